pub mod extract;
pub mod listing;
pub mod rules;

use serde::Serialize;

use crate::fetcher::RawDocument;
use crate::gate::{Gate, ValidationVerdict};
use crate::resolve::{ResolvedRecord, Resolver};
use rules::FieldRuleSet;

/// A detail page after extraction, resolution and the gate.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub record: ResolvedRecord,
    pub verdict: ValidationVerdict,
}

/// Three-step pipeline: document → extracted fields → typed record → verdict.
/// `None` when the document is not a detail page at all.
pub fn evaluate(
    document: &RawDocument,
    rules: &FieldRuleSet,
    resolver: &Resolver,
    gate: &Gate,
) -> Option<Evaluation> {
    let extracted = extract::extract(document, rules);
    if extracted.is_unrecognized() {
        return None;
    }
    let record = resolver.resolve(extracted);
    let verdict = gate.validate(&record);
    Some(Evaluation { record, verdict })
}

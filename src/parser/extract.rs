use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html};
use serde::Serialize;

use super::rules::{Access, Cardinality, FieldKey, FieldRule, FieldRuleSet};
use crate::fetcher::RawDocument;

/// Sub-elements whose text `Access::OwnText` leaves out.
const LABEL_TAGS: &[&str] = &["strong", "b", "em", "label"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
    /// The locator matched nothing; `sentinel` is the rule's placeholder label.
    Missing { sentinel: String },
}

/// One value (or explicit gap) per rule of the set that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractedRecord {
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
    pub fields: BTreeMap<FieldKey, FieldValue>,
}

impl ExtractedRecord {
    pub fn value(&self, key: FieldKey) -> Option<&FieldValue> {
        self.fields.get(&key)
    }

    /// The text of a scalar field, or `None` when it is missing.
    pub fn text(&self, key: FieldKey) -> Option<&str> {
        match self.fields.get(&key) {
            Some(FieldValue::Text(t)) => Some(t),
            Some(FieldValue::List(items)) => items.first().map(String::as_str),
            _ => None,
        }
    }

    /// Items of a list field; empty when missing.
    pub fn list(&self, key: FieldKey) -> &[String] {
        match self.fields.get(&key) {
            Some(FieldValue::List(items)) => items,
            _ => &[],
        }
    }

    /// Nothing matched at all: an age gate, an error page, or a different site.
    pub fn is_unrecognized(&self) -> bool {
        self.fields.values().all(|v| match v {
            FieldValue::Text(_) => false,
            FieldValue::List(items) => items.is_empty(),
            FieldValue::Missing { .. } => true,
        })
    }
}

/// Apply every rule to the document. Never fails: gaps become `Missing`.
pub fn extract(document: &RawDocument, ruleset: &FieldRuleSet) -> ExtractedRecord {
    let html = Html::parse_document(&document.body);
    let fields = ruleset
        .rules()
        .iter()
        .map(|rule| (rule.field, extract_field(&html, rule)))
        .collect();

    ExtractedRecord {
        source_url: document.url.clone(),
        fetched_at: document.fetched_at,
        fields,
    }
}

fn extract_field(html: &Html, rule: &FieldRule) -> FieldValue {
    let mut values = html
        .select(&rule.selector)
        .filter_map(|el| read(el, &rule.access));

    match &rule.cardinality {
        Cardinality::First { sentinel } => match values.next() {
            Some(v) => FieldValue::Text(v),
            None => FieldValue::Missing {
                sentinel: sentinel.clone(),
            },
        },
        Cardinality::All { cap } => {
            let items: Vec<String> = match *cap {
                Some(n) => values.take(n).collect(),
                None => values.collect(),
            };
            FieldValue::List(items)
        }
    }
}

/// The value behind one matched element; empty values count as no match.
fn read(el: ElementRef<'_>, access: &Access) -> Option<String> {
    let value = match access {
        Access::Text => collapse(el.text()),
        Access::Attr { name } => el.value().attr(name)?.trim().to_string(),
        Access::OwnText => own_text(el),
    };
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn own_text(el: ElementRef<'_>) -> String {
    let root = el.id();
    let texts = el.descendants().filter_map(|node| {
        let text = node.value().as_text()?;
        let inside_label = node
            .ancestors()
            .take_while(|a| a.id() != root)
            .filter_map(|a| a.value().as_element())
            .any(|e| LABEL_TAGS.contains(&e.name()));
        if inside_label {
            None
        } else {
            Some(&**text)
        }
    });
    collapse(texts)
}

fn collapse<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    let joined: String = parts.collect::<Vec<_>>().join(" ");
    joined.split_whitespace().collect::<Vec<_>>().join(" ")
}

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ListingSettings, RetrySettings, Settings};
use crate::db::Sink;
use crate::error::FetchError;
use crate::fetcher::{Fetcher, RawDocument};
use crate::gate::{Gate, RejectReason, ValidationVerdict};
use crate::parser::rules::FieldRuleSet;
use crate::parser::{self, listing, Evaluation};
use crate::resolve::{ResolvedRecord, Resolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    DiscoveringListings,
    FetchingItems,
    Draining,
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunPhase::Idle => "idle",
            RunPhase::DiscoveringListings => "discovering-listings",
            RunPhase::FetchingItems => "fetching-items",
            RunPhase::Draining => "draining",
            RunPhase::Done => "done",
        })
    }
}

/// Shared by every task of a run; only ever incremented.
#[derive(Debug, Default)]
pub struct RunCounters {
    pub listing_pages: AtomicUsize,
    pub listing_failed: AtomicUsize,
    pub discovered: AtomicUsize,
    pub fetch_failed: AtomicUsize,
    pub parse_failed: AtomicUsize,
    pub rejected: AtomicUsize,
    pub accepted: AtomicUsize,
    pub persisted: AtomicUsize,
    pub persist_failed: AtomicUsize,
}

fn inc(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn get(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::Relaxed)
}

/// What an item task hands to the writer.
#[derive(Debug)]
pub enum ItemOutcome {
    Accepted(Box<ResolvedRecord>),
    Rejected { url: String, reason: RejectReason },
    FetchFailed { url: String, error: FetchError },
    ParseFailed { url: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub listing_pages: usize,
    pub listing_failed: usize,
    pub discovered: usize,
    pub dispatched: usize,
    pub fetch_failed: usize,
    pub parse_failed: usize,
    pub rejected: usize,
    pub accepted: usize,
    pub persisted: usize,
    pub persist_failed: usize,
    pub rejected_by_reason: BTreeMap<RejectReason, usize>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn dominant_reason(&self) -> Option<(RejectReason, usize)> {
        self.rejected_by_reason
            .iter()
            .max_by_key(|(_, n)| **n)
            .map(|(r, n)| (*r, *n))
    }

    /// Why nothing was persisted. `None` when something was.
    pub fn zero_cause(&self) -> Option<String> {
        if self.persisted > 0 {
            return None;
        }
        if self.cancelled && self.dispatched < self.discovered.max(1) {
            return Some("cancelled before any record was persisted".into());
        }
        if self.discovered == 0 {
            if self.listing_pages > 0 && self.listing_failed == self.listing_pages {
                return Some(format!("all {} listing pages failed", self.listing_pages));
            }
            return Some("no items discovered".into());
        }
        if let Some((reason, n)) = self.dominant_reason() {
            return Some(format!("mostly rejected as {} ({} of {})", reason, n, self.rejected));
        }
        if self.fetch_failed > 0 {
            return Some(format!("{} item fetches failed", self.fetch_failed));
        }
        if self.parse_failed > 0 {
            return Some(format!("{} pages not recognized", self.parse_failed));
        }
        if self.persist_failed > 0 {
            return Some(format!("{} writes failed", self.persist_failed));
        }
        Some("nothing accepted".into())
    }

    pub fn summary(&self) -> String {
        let mut s = format!(
            "discovered {}, fetch-failed {}, parse-failed {}, rejected {}, persisted {}",
            self.discovered, self.fetch_failed, self.parse_failed, self.rejected, self.persisted
        );
        if let Some(cause) = self.zero_cause() {
            s.push_str(&format!(" ({})", cause));
        }
        s
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {}", self.run_id)?;
        writeln!(
            f,
            "  Listing pages: {} ({} failed)",
            self.listing_pages, self.listing_failed
        )?;
        writeln!(f, "  Discovered:    {}", self.discovered)?;
        if self.dispatched < self.discovered {
            writeln!(f, "  Not fetched:   {}", self.discovered - self.dispatched)?;
        }
        writeln!(f, "  Fetch failed:  {}", self.fetch_failed)?;
        writeln!(f, "  Parse failed:  {}", self.parse_failed)?;
        writeln!(f, "  Rejected:      {}", self.rejected)?;
        for (reason, n) in &self.rejected_by_reason {
            writeln!(f, "    {:<28} {}", reason.to_string(), n)?;
        }
        writeln!(f, "  Persisted:     {}", self.persisted)?;
        if self.persist_failed > 0 {
            writeln!(f, "  Write failed:  {}", self.persist_failed)?;
        }
        if self.cancelled {
            writeln!(f, "  Cancelled")?;
        }
        if let Some(cause) = self.zero_cause() {
            writeln!(f, "  Nothing persisted: {}", cause)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HarvestOptions {
    /// Bound on in-flight requests, listing and item alike.
    pub concurrency: usize,
    pub listing: ListingSettings,
    pub retry: RetrySettings,
    pub progress: bool,
}

impl HarvestOptions {
    pub fn from_settings(settings: &Settings, progress: bool) -> Self {
        HarvestOptions {
            concurrency: settings.concurrency,
            listing: settings.listing.clone(),
            retry: settings.retry.clone(),
            progress,
        }
    }
}

/// Everything a spawned task needs, cheap to clone.
#[derive(Clone)]
struct Shared {
    fetcher: Arc<dyn Fetcher>,
    rules: Arc<FieldRuleSet>,
    resolver: Arc<Resolver>,
    gate: Arc<Gate>,
    semaphore: Arc<Semaphore>,
    retry: RetrySettings,
    counters: Arc<RunCounters>,
    cancel: CancellationToken,
}

pub struct Harvester {
    fetcher: Arc<dyn Fetcher>,
    rules: Arc<FieldRuleSet>,
    resolver: Arc<Resolver>,
    gate: Arc<Gate>,
    options: HarvestOptions,
}

impl Harvester {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        rules: Arc<FieldRuleSet>,
        resolver: Arc<Resolver>,
        gate: Arc<Gate>,
        options: HarvestOptions,
    ) -> Self {
        Harvester {
            fetcher,
            rules,
            resolver,
            gate,
            options,
        }
    }

    /// Discover item URLs, fetch and evaluate them concurrently, and persist
    /// accepted records one at a time through `sink` as they arrive.
    pub async fn run<S: Sink>(&self, sink: &mut S, cancel: CancellationToken) -> Result<RunReport> {
        let started_at = Utc::now();
        let t0 = Instant::now();
        let run_id = new_run_id(started_at);
        let counters = Arc::new(RunCounters::default());
        let shared = Shared {
            fetcher: Arc::clone(&self.fetcher),
            rules: Arc::clone(&self.rules),
            resolver: Arc::clone(&self.resolver),
            gate: Arc::clone(&self.gate),
            semaphore: Arc::new(Semaphore::new(self.options.concurrency)),
            retry: self.options.retry.clone(),
            counters: Arc::clone(&counters),
            cancel: cancel.clone(),
        };

        let mut phase = RunPhase::Idle;
        advance(&mut phase, RunPhase::DiscoveringListings, &run_id);
        let urls = self.discover(&shared).await;
        counters.discovered.store(urls.len(), Ordering::Relaxed);
        info!(run_id = %run_id, items = urls.len(), "discovery finished");

        advance(&mut phase, RunPhase::FetchingItems, &run_id);
        let pb = self.progress_bar(urls.len())?;

        // Channel: item tasks send outcomes, this loop is the only writer
        let (tx, mut rx) = mpsc::channel::<ItemOutcome>(self.options.concurrency * 2);
        let mut dispatcher = tokio::spawn(dispatch(shared.clone(), urls, tx));
        let mut dispatched: Option<usize> = None;
        let mut tally: BTreeMap<RejectReason, usize> = BTreeMap::new();

        loop {
            tokio::select! {
                joined = &mut dispatcher, if dispatched.is_none() => {
                    dispatched = Some(joined?);
                    advance(&mut phase, RunPhase::Draining, &run_id);
                }
                outcome = rx.recv() => match outcome {
                    Some(outcome) => {
                        write_outcome(outcome, sink, &counters, &mut tally);
                        pb.inc(1);
                    }
                    None => break,
                },
            }
        }
        let dispatched = match dispatched {
            Some(n) => n,
            None => {
                advance(&mut phase, RunPhase::Draining, &run_id);
                dispatcher.await?
            }
        };

        pb.finish_and_clear();
        advance(&mut phase, RunPhase::Done, &run_id);

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            elapsed_ms: t0.elapsed().as_millis() as u64,
            listing_pages: get(&counters.listing_pages),
            listing_failed: get(&counters.listing_failed),
            discovered: get(&counters.discovered),
            dispatched,
            fetch_failed: get(&counters.fetch_failed),
            parse_failed: get(&counters.parse_failed),
            rejected: get(&counters.rejected),
            accepted: get(&counters.accepted),
            persisted: get(&counters.persisted),
            persist_failed: get(&counters.persist_failed),
            rejected_by_reason: tally,
            cancelled: cancel.is_cancelled(),
        };
        info!(run_id = %report.run_id, "{}", report.summary());
        Ok(report)
    }

    /// Fetch every listing page under the shared budget and collect item URLs
    /// in page order, deduplicated across pages.
    async fn discover(&self, shared: &Shared) -> Vec<String> {
        let prefix = self.options.listing.item_prefix.clone();
        let mut set = JoinSet::new();

        for (index, url) in self.options.listing.listing_urls().into_iter().enumerate() {
            let Some(permit) = acquire(&shared.semaphore, &shared.cancel).await else {
                info!("cancelled during discovery");
                break;
            };
            let shared = shared.clone();
            let prefix = prefix.clone();
            set.spawn(async move {
                inc(&shared.counters.listing_pages);
                let doc = match fetch_with_retry(&shared, &url, permit).await {
                    Ok(doc) => doc,
                    Err(e) => {
                        inc(&shared.counters.listing_failed);
                        warn!(url = %url, kind = e.kind(), error = %e, "listing page failed");
                        return (index, Vec::new());
                    }
                };
                match listing::parse_listing(&doc.body) {
                    Ok(page) => {
                        let items = listing::item_urls(&page.results_html, &prefix);
                        debug!(url = %url, items = items.len(), total = ?page.total_count, "listing page");
                        (index, items)
                    }
                    Err(e) => {
                        inc(&shared.counters.listing_failed);
                        warn!(url = %url, error = %e, "listing page is not a results payload");
                        (index, Vec::new())
                    }
                }
            });
        }

        let mut pages = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(page) => pages.push(page),
                Err(e) => warn!(error = %e, "listing task aborted"),
            }
        }
        pages.sort_by_key(|(index, _)| *index);

        let mut seen = HashSet::new();
        pages
            .into_iter()
            .flat_map(|(_, items)| items)
            .filter(|url| seen.insert(url.clone()))
            .collect()
    }

    fn progress_bar(&self, len: usize) -> Result<ProgressBar> {
        if !self.options.progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
                .progress_chars("=> "),
        );
        Ok(pb)
    }
}

static RUN_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Millisecond start time plus process id and an in-process sequence, so runs
/// started in the same second (or from parallel processes) get distinct ids.
fn new_run_id(started_at: DateTime<Utc>) -> String {
    let seq = RUN_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "run-{}-{}-{}",
        started_at.timestamp_millis(),
        std::process::id(),
        seq
    )
}

fn advance(phase: &mut RunPhase, next: RunPhase, run_id: &str) {
    info!(run_id, from = %phase, to = %next, "phase");
    *phase = next;
}

/// Acquire a permit unless the run is cancelled first.
async fn acquire(semaphore: &Arc<Semaphore>, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = Arc::clone(semaphore).acquire_owned() => permit.ok(),
    }
}

/// Spawn one task per item, each holding a permit for its fetch.
/// Stops at the first permit wait interrupted by cancellation, then waits for
/// every spawned task. A task that panicked counts as a parse failure.
async fn dispatch(shared: Shared, urls: Vec<String>, tx: mpsc::Sender<ItemOutcome>) -> usize {
    let mut tasks = JoinSet::new();
    let mut dispatched = 0usize;
    for url in urls {
        let Some(permit) = acquire(&shared.semaphore, &shared.cancel).await else {
            info!(dispatched, "cancelled, no further items dispatched");
            break;
        };
        let item = shared.clone();
        let tx = tx.clone();
        tasks.spawn(async move {
            let outcome = process_item(&item, url, permit).await;
            let _ = tx.send(outcome).await;
        });
        dispatched += 1;
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            inc(&shared.counters.parse_failed);
            warn!(error = %e, "item task failed");
        }
    }
    dispatched
}

async fn process_item(shared: &Shared, url: String, permit: OwnedSemaphorePermit) -> ItemOutcome {
    let document = match fetch_with_retry(shared, &url, permit).await {
        Ok(doc) => doc,
        Err(error) => {
            inc(&shared.counters.fetch_failed);
            return ItemOutcome::FetchFailed { url, error };
        }
    };

    match parser::evaluate(&document, &shared.rules, &shared.resolver, &shared.gate) {
        None => {
            inc(&shared.counters.parse_failed);
            ItemOutcome::ParseFailed { url }
        }
        Some(Evaluation {
            record,
            verdict: ValidationVerdict::Accept,
        }) => {
            inc(&shared.counters.accepted);
            ItemOutcome::Accepted(Box::new(record))
        }
        Some(Evaluation {
            verdict: ValidationVerdict::Reject(reason),
            ..
        }) => {
            inc(&shared.counters.rejected);
            ItemOutcome::Rejected { url, reason }
        }
    }
}

/// First attempt runs under `permit`; each retry waits out the delay and
/// takes a fresh permit. Only transient failures are retried.
async fn fetch_with_retry(
    shared: &Shared,
    url: &str,
    permit: OwnedSemaphorePermit,
) -> Result<RawDocument, FetchError> {
    let mut result = shared.fetcher.fetch(url).await;
    drop(permit);

    for attempt in 1..=shared.retry.attempts {
        match &result {
            Err(e) if e.is_transient() => {
                warn!(
                    url,
                    attempt,
                    of = shared.retry.attempts,
                    error = %e,
                    "transient failure, retrying"
                );
            }
            _ => break,
        }
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(shared.retry.delay_ms)) => {}
        }
        let Some(permit) = acquire(&shared.semaphore, &shared.cancel).await else {
            break;
        };
        result = shared.fetcher.fetch(url).await;
        drop(permit);
    }
    result
}

/// Writer side of the channel: persist, count, tally, log.
fn write_outcome<S: Sink>(
    outcome: ItemOutcome,
    sink: &mut S,
    counters: &RunCounters,
    tally: &mut BTreeMap<RejectReason, usize>,
) {
    match outcome {
        ItemOutcome::Accepted(record) => match sink.persist(&record) {
            Ok(()) => inc(&counters.persisted),
            Err(e) => {
                inc(&counters.persist_failed);
                warn!(url = %record.source_url, error = %e, "persist failed");
            }
        },
        ItemOutcome::Rejected { url, reason } => {
            debug!(url = %url, %reason, "rejected");
            *tally.entry(reason).or_insert(0) += 1;
        }
        ItemOutcome::FetchFailed { url, error } => {
            warn!(url = %url, kind = error.kind(), error = %error, "item fetch failed");
        }
        ItemOutcome::ParseFailed { url } => warn!(url = %url, "not an item page"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PageRange, RatingSettings};
    use crate::error::PersistError;
    use crate::gate::Check;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const LISTING: &str = "https://listing.test/?start={start}";
    const PREFIX: &str = "https://shop.test/app/";

    struct StubFetcher {
        pages: HashMap<String, Result<String, FetchError>>,
        /// Transient failures to serve before the real response.
        flaky: Mutex<HashMap<String, usize>>,
        panic_on: Mutex<HashSet<String>>,
        delay: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl StubFetcher {
        fn new(delay_ms: u64) -> Self {
            StubFetcher {
                pages: HashMap::new(),
                flaky: Mutex::new(HashMap::new()),
                panic_on: Mutex::new(HashSet::new()),
                delay: Duration::from_millis(delay_ms),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn page(mut self, url: impl Into<String>, body: impl Into<String>) -> Self {
            self.pages.insert(url.into(), Ok(body.into()));
            self
        }

        fn failing(mut self, url: impl Into<String>, error: FetchError) -> Self {
            self.pages.insert(url.into(), Err(error));
            self
        }
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self, url: &str) -> Result<RawDocument, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.panic_on.lock().unwrap().contains(url) {
                panic!("stub fetcher told to panic on {url}");
            }

            if let Some(left) = self.flaky.lock().unwrap().get_mut(url) {
                if *left > 0 {
                    *left -= 1;
                    return Err(FetchError::HttpStatus { url: url.to_string(), status: 503 });
                }
            }
            match self.pages.get(url) {
                Some(Ok(body)) => Ok(RawDocument::new(url, body.clone())),
                Some(Err(e)) => Err(e.clone()),
                None => Err(FetchError::HttpStatus { url: url.to_string(), status: 404 }),
            }
        }
    }

    #[derive(Default)]
    struct MemorySink {
        records: Vec<ResolvedRecord>,
        fail_on: HashSet<String>,
    }

    impl Sink for MemorySink {
        fn persist(&mut self, record: &ResolvedRecord) -> Result<(), PersistError> {
            if self.fail_on.contains(&record.source_url) {
                return Err(PersistError::Db(rusqlite::Error::QueryReturnedNoRows));
            }
            self.records.push(record.clone());
            Ok(())
        }
    }

    fn listing_url(start: u32) -> String {
        LISTING.replace("{start}", &start.to_string())
    }

    fn item_url(id: u32) -> String {
        format!("{}{}/Game_{}/", PREFIX, id, id)
    }

    fn listing_body(ids: &[u32]) -> String {
        let anchors: String = ids
            .iter()
            .map(|id| format!(r#"<a href="{}{}/Game_{}/?snr=1_7_7">Game {}</a>"#, PREFIX, id, id, id))
            .collect();
        serde_json::json!({ "results_html": anchors, "total_count": ids.len() }).to_string()
    }

    fn item_html(title: &str, release_date: Option<&str>) -> String {
        let release = release_date
            .map(|d| format!(r#"<div class="release_date"><div class="date">{}</div></div>"#, d))
            .unwrap_or_default();
        format!(
            r#"<html><body>
            <div class="apphub_AppName">{title}</div>
            <img class="game_header_image_full" src="https://cdn.test/{title}/header.jpg">
            <div class="game_description_snippet">About {title}.</div>
            <div class="user_reviews_summary_row"
                 data-tooltip-html="92% of the 4,321 user reviews for this game are positive."></div>
            <div class="glance_ctn_responsive_left">
              {release}
              <div class="dev_row"><div class="summary" id="developers_list"><a href="/dev">Studio</a></div></div>
              <div class="dev_row"><div class="summary"><a href="/pub">Label</a></div></div>
            </div>
            <a class="app_tag" href="/tag/1">Indie</a>
            <a class="highlight_screenshot_link" href="https://cdn.test/{title}/ss_1.jpg"></a>
            <div class="game_area_purchase_game">
              <div class="game_purchase_price" data-price-final="999">$9.99</div>
            </div>
            <div class="game_area_sys_req_leftCol"><ul class="bb_ul"><li><strong>OS:</strong> Windows 10</li></ul></div>
            <div class="game_area_sys_req_rightCol"><ul class="bb_ul"><li><strong>OS:</strong> Windows 11</li></ul></div>
            </body></html>"#
        )
    }

    fn options(concurrency: usize, pages: &str) -> HarvestOptions {
        HarvestOptions {
            concurrency,
            listing: ListingSettings {
                url_template: LISTING.to_string(),
                item_prefix: PREFIX.to_string(),
                pages: pages.parse::<PageRange>().unwrap(),
                ..ListingSettings::default()
            },
            retry: RetrySettings {
                attempts: 0,
                delay_ms: 0,
            },
            progress: false,
        }
    }

    fn harvester(fetcher: Arc<StubFetcher>, options: HarvestOptions) -> Harvester {
        Harvester::new(
            fetcher,
            Arc::new(FieldRuleSet::storefront().unwrap()),
            Arc::new(Resolver::new(&RatingSettings::default().pattern, 1000, 4).unwrap()),
            Arc::new(Gate::default()),
            options,
        )
    }

    /// A single listing page at offset 0 with `n` complete items.
    fn catalog(n: u32, delay_ms: u64) -> StubFetcher {
        let ids: Vec<u32> = (1..=n).collect();
        ids.iter().fold(
            StubFetcher::new(delay_ms).page(listing_url(0), listing_body(&ids)),
            |stub, id| stub.page(item_url(*id), item_html(&format!("Game {}", id), Some("1 Jan, 2020"))),
        )
    }

    #[tokio::test]
    async fn three_items_one_missing_release_date() {
        let stub = StubFetcher::new(0)
            .page(listing_url(0), listing_body(&[1, 2, 3]))
            .page(item_url(1), item_html("One", Some("1 Jan, 2020")))
            .page(item_url(2), item_html("Two", None))
            .page(item_url(3), item_html("Three", Some("3 Mar, 2023")));
        let mut sink = MemorySink::default();

        let report = harvester(Arc::new(stub), options(4, "0:0"))
            .run(&mut sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.discovered, 3);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.persisted, 2);
        assert_eq!(
            report.rejected_by_reason.get(&RejectReason::Missing(Check::ReleaseDate)),
            Some(&1)
        );
        let mut titles: Vec<_> = sink.records.iter().filter_map(|r| r.title.clone()).collect();
        titles.sort();
        assert_eq!(titles, ["One", "Three"]);
        assert_eq!(sink.records[0].price_minor_units, Some(999));
        assert_eq!(report.zero_cause(), None);
    }

    #[tokio::test]
    async fn concurrency_budget_is_never_exceeded() {
        let ids: Vec<u32> = (1..=12).collect();
        let stub = ids.iter().fold(
            StubFetcher::new(15)
                .page(listing_url(0), listing_body(&ids[..4]))
                .page(listing_url(50), listing_body(&ids[4..8]))
                .page(listing_url(100), listing_body(&ids[8..])),
            |stub, id| stub.page(item_url(*id), item_html(&format!("G{}", id), Some("2020"))),
        );
        let stub = Arc::new(stub);
        let mut sink = MemorySink::default();

        let report = harvester(Arc::clone(&stub), options(3, "0:100:50"))
            .run(&mut sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.listing_pages, 3);
        assert_eq!(report.discovered, 12);
        assert_eq!(report.persisted, 12);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 15);
        assert!(stub.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn one_fetch_failure_does_not_stop_the_rest() {
        let stub = catalog(5, 1).failing(
            item_url(3),
            FetchError::ConnectionFailed {
                url: item_url(3),
                reason: "reset".into(),
            },
        );
        let mut sink = MemorySink::default();

        let report = harvester(Arc::new(stub), options(2, "0:0"))
            .run(&mut sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.discovered, 5);
        assert_eq!(report.fetch_failed, 1);
        assert_eq!(report.persisted, 4);
        assert!(sink.records.iter().all(|r| r.source_url != item_url(3)));
    }

    #[tokio::test]
    async fn failed_listing_page_contributes_no_urls() {
        let stub = StubFetcher::new(0)
            .page(listing_url(0), listing_body(&[1, 2]))
            .page(item_url(1), item_html("One", Some("2020")))
            .page(item_url(2), item_html("Two", Some("2020")));
        let mut sink = MemorySink::default();

        let report = harvester(Arc::new(stub), options(2, "0:50"))
            .run(&mut sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.listing_pages, 2);
        assert_eq!(report.listing_failed, 1);
        assert_eq!(report.discovered, 2);
        assert_eq!(report.persisted, 2);
    }

    #[tokio::test]
    async fn duplicate_items_across_pages_are_fetched_once() {
        let stub = StubFetcher::new(0)
            .page(listing_url(0), listing_body(&[1, 2]))
            .page(listing_url(50), listing_body(&[2, 3]))
            .page(item_url(1), item_html("One", Some("2020")))
            .page(item_url(2), item_html("Two", Some("2020")))
            .page(item_url(3), item_html("Three", Some("2020")));
        let stub = Arc::new(stub);
        let mut sink = MemorySink::default();

        let report = harvester(Arc::clone(&stub), options(2, "0:50"))
            .run(&mut sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.discovered, 3);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let stub = catalog(2, 0);
        stub.flaky.lock().unwrap().insert(item_url(1), 1);
        let stub = Arc::new(stub);
        let mut opts = options(2, "0:0");
        opts.retry = RetrySettings {
            attempts: 2,
            delay_ms: 1,
        };
        let mut sink = MemorySink::default();

        let report = harvester(Arc::clone(&stub), opts)
            .run(&mut sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.fetch_failed, 0);
        assert_eq!(report.persisted, 2);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let stub = Arc::new(catalog(1, 0).failing(
            item_url(1),
            FetchError::HttpStatus {
                url: item_url(1),
                status: 404,
            },
        ));
        let mut opts = options(1, "0:0");
        opts.retry.attempts = 3;
        let mut sink = MemorySink::default();

        let report = harvester(Arc::clone(&stub), opts)
            .run(&mut sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.fetch_failed, 1);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.zero_cause().as_deref(), Some("1 item fetches failed"));
    }

    #[tokio::test]
    async fn unrecognized_pages_count_as_parse_failures() {
        let stub = catalog(2, 0)
            .page(item_url(2), "<html><body><h2>Please enter your birth date</h2></body></html>")
            .page(listing_url(50), "<html>Access denied</html>");
        let mut sink = MemorySink::default();

        let report = harvester(Arc::new(stub), options(2, "0:50"))
            .run(&mut sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.listing_failed, 1);
        assert_eq!(report.parse_failed, 1);
        assert_eq!(report.persisted, 1);
        assert_eq!(
            report.accepted + report.rejected + report.fetch_failed + report.parse_failed,
            report.dispatched
        );
    }

    #[tokio::test]
    async fn panicking_item_task_counts_as_parse_failure() {
        let stub = catalog(4, 1);
        stub.panic_on.lock().unwrap().insert(item_url(2));
        let mut sink = MemorySink::default();

        let report = harvester(Arc::new(stub), options(2, "0:0"))
            .run(&mut sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.dispatched, 4);
        assert_eq!(report.parse_failed, 1);
        assert_eq!(report.persisted, 3);
        assert!(sink.records.iter().all(|r| r.source_url != item_url(2)));
    }

    #[tokio::test]
    async fn consecutive_runs_get_distinct_ids() {
        let stub = Arc::new(catalog(1, 0));
        let h = harvester(stub, options(1, "0:0"));
        let mut sink = MemorySink::default();

        let first = h.run(&mut sink, CancellationToken::new()).await.unwrap();
        let second = h.run(&mut sink, CancellationToken::new()).await.unwrap();

        assert_ne!(first.run_id, second.run_id);
        assert!(first.run_id.starts_with("run-"));
    }

    #[tokio::test]
    async fn persist_error_is_counted_not_fatal() {
        let stub = catalog(3, 0);
        let mut sink = MemorySink::default();
        sink.fail_on.insert(item_url(2));

        let report = harvester(Arc::new(stub), options(2, "0:0"))
            .run(&mut sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.accepted, 3);
        assert_eq!(report.persist_failed, 1);
        assert_eq!(report.persisted, 2);
    }

    #[tokio::test]
    async fn cancelled_before_start_fetches_nothing() {
        let stub = Arc::new(catalog(3, 0));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut sink = MemorySink::default();

        let report = harvester(Arc::clone(&stub), options(2, "0:0"))
            .run(&mut sink, cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.persisted, 0);
        assert!(report.summary().contains("cancelled"));
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch_and_finishes_in_flight() {
        let stub = Arc::new(catalog(10, 40));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(110)).await;
            trigger.cancel();
        });
        let mut sink = MemorySink::default();

        let report = harvester(Arc::clone(&stub), options(1, "0:0"))
            .run(&mut sink, cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.discovered, 10);
        assert!(report.dispatched < 10);
        assert_eq!(report.persisted, report.dispatched);
        assert_eq!(sink.records.len(), report.dispatched);
    }

    #[tokio::test]
    async fn zero_persisted_names_dominant_reason() {
        let stub = StubFetcher::new(0)
            .page(listing_url(0), listing_body(&[1, 2]))
            .page(item_url(1), item_html("One", None))
            .page(item_url(2), item_html("Two", None));
        let mut sink = MemorySink::default();

        let report = harvester(Arc::new(stub), options(2, "0:0"))
            .run(&mut sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.persisted, 0);
        assert!(report.summary().contains("missing:release-date"));
    }

    #[tokio::test]
    async fn no_listing_pages_reachable() {
        let stub = StubFetcher::new(0);
        let mut sink = MemorySink::default();

        let report = harvester(Arc::new(stub), options(2, "0:50"))
            .run(&mut sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.discovered, 0);
        assert_eq!(
            report.zero_cause().as_deref(),
            Some("all 2 listing pages failed")
        );
    }
}

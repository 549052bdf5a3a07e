use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::error::PersistError;
use crate::pipeline::RunReport;
use crate::resolve::ResolvedRecord;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS games (
            id                       INTEGER PRIMARY KEY,
            source_url               TEXT UNIQUE NOT NULL,
            name                     TEXT NOT NULL,
            description              TEXT,
            rating_summary           TEXT,
            rating_percent           INTEGER,
            rating_count             INTEGER,
            release_date             TEXT,
            developer                TEXT,
            publisher                TEXT,
            tags                     TEXT NOT NULL DEFAULT '[]',
            price                    INTEGER,
            media_urls               TEXT NOT NULL DEFAULT '[]',
            header_image             TEXT,
            minimum_requirements     TEXT NOT NULL DEFAULT '[]',
            recommended_requirements TEXT NOT NULL DEFAULT '[]',
            fetched_at               TEXT NOT NULL,
            harvested_at             TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_games_name ON games(name);
        CREATE INDEX IF NOT EXISTS idx_games_price ON games(price);

        CREATE TABLE IF NOT EXISTS runs (
            run_id         TEXT PRIMARY KEY,
            started_at     TEXT NOT NULL,
            finished_at    TEXT NOT NULL,
            listing_pages  INTEGER NOT NULL,
            listing_failed INTEGER NOT NULL,
            discovered     INTEGER NOT NULL,
            fetch_failed   INTEGER NOT NULL,
            parse_failed   INTEGER NOT NULL,
            rejected       INTEGER NOT NULL,
            accepted       INTEGER NOT NULL,
            persisted      INTEGER NOT NULL,
            persist_failed INTEGER NOT NULL,
            cancelled      BOOLEAN NOT NULL,
            reject_reasons TEXT NOT NULL,
            summary        TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

// ── Sink ──

/// Receives accepted records one at a time from the pipeline's writer.
pub trait Sink {
    fn persist(&mut self, record: &ResolvedRecord) -> Result<(), PersistError>;
}

pub struct SqliteSink<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteSink<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        SqliteSink { conn }
    }
}

const UPSERT_GAME: &str = "
    INSERT INTO games
        (source_url, name, description, rating_summary, rating_percent, rating_count,
         release_date, developer, publisher, tags, price, media_urls, header_image,
         minimum_requirements, recommended_requirements, fetched_at)
    VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
    ON CONFLICT(source_url) DO UPDATE SET
        name = excluded.name,
        description = excluded.description,
        rating_summary = excluded.rating_summary,
        rating_percent = excluded.rating_percent,
        rating_count = excluded.rating_count,
        release_date = excluded.release_date,
        developer = excluded.developer,
        publisher = excluded.publisher,
        tags = excluded.tags,
        price = excluded.price,
        media_urls = excluded.media_urls,
        header_image = excluded.header_image,
        minimum_requirements = excluded.minimum_requirements,
        recommended_requirements = excluded.recommended_requirements,
        fetched_at = excluded.fetched_at,
        harvested_at = datetime('now')";

impl Sink for SqliteSink<'_> {
    /// One statement per record, so a record is either fully written or not at all.
    fn persist(&mut self, r: &ResolvedRecord) -> Result<(), PersistError> {
        let json = |column: &'static str, v: &Vec<String>| {
            serde_json::to_string(v).map_err(|source| PersistError::Encode { column, source })
        };
        let rating = r.rating.rated();
        let mut stmt = self.conn.prepare_cached(UPSERT_GAME)?;
        stmt.execute(rusqlite::params![
            r.source_url,
            r.title,
            r.description,
            r.rating_summary,
            rating.map(|x| x.percent),
            rating.map(|x| x.count as i64),
            r.release_date,
            r.developer,
            r.publisher,
            json("tags", &r.tags)?,
            r.price_minor_units.map(|p| p as i64),
            json("media_urls", &r.media_urls)?,
            r.header_image,
            json("minimum_requirements", &r.minimum_requirements)?,
            json("recommended_requirements", &r.recommended_requirements)?,
            r.fetched_at.to_rfc3339(),
        ])?;
        Ok(())
    }
}

// ── Runs ──

/// Run ids are unique; saving the same id twice is an error, not an overwrite.
pub fn save_run(conn: &Connection, report: &RunReport) -> Result<()> {
    let reasons = serde_json::to_string(&report.rejected_by_reason)?;
    conn.execute(
        "INSERT INTO runs
         (run_id, started_at, finished_at, listing_pages, listing_failed, discovered,
          fetch_failed, parse_failed, rejected, accepted, persisted, persist_failed,
          cancelled, reject_reasons, summary)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
        rusqlite::params![
            report.run_id,
            report.started_at.to_rfc3339(),
            report.finished_at.to_rfc3339(),
            report.listing_pages,
            report.listing_failed,
            report.discovered,
            report.fetch_failed,
            report.parse_failed,
            report.rejected,
            report.accepted,
            report.persisted,
            report.persist_failed,
            report.cancelled,
            reasons,
            report.summary(),
        ],
    )?;
    Ok(())
}

pub struct RunRow {
    pub run_id: String,
    pub finished_at: String,
    pub discovered: usize,
    pub persisted: usize,
    pub summary: String,
}

pub fn fetch_recent_runs(conn: &Connection, limit: usize) -> Result<Vec<RunRow>> {
    let mut stmt = conn.prepare(
        "SELECT run_id, finished_at, discovered, persisted, summary
         FROM runs ORDER BY finished_at DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit as i64], |row| {
            Ok(RunRow {
                run_id: row.get(0)?,
                finished_at: row.get(1)?,
                discovered: row.get(2)?,
                persisted: row.get(3)?,
                summary: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Listing persisted games ──

/// Price filter for `list`: free only, anything, or at most N minor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceFilter {
    Any,
    Free,
    AtMost(u64),
}

impl std::str::FromStr for PriceFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "any" => Ok(PriceFilter::Any),
            "free" => Ok(PriceFilter::Free),
            other => other
                .parse::<u64>()
                .map(PriceFilter::AtMost)
                .map_err(|_| format!("expected 'free', 'any' or a number, got {:?}", other)),
        }
    }
}

pub struct GameRow {
    pub name: String,
    pub rating_summary: Option<String>,
    pub rating_percent: Option<u8>,
    pub release_date: Option<String>,
    pub price: Option<i64>,
    pub header_image: Option<String>,
    pub source_url: String,
}

pub fn fetch_games(
    conn: &Connection,
    name: Option<&str>,
    price: PriceFilter,
    limit: usize,
) -> Result<Vec<GameRow>> {
    let mut conditions = Vec::new();
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(n) = name {
        conditions.push(format!("name LIKE ?{}", params.len() + 1));
        params.push(Box::new(format!("%{}%", n)));
    }
    match price {
        PriceFilter::Any => {}
        PriceFilter::Free => conditions.push("price = 0".to_string()),
        PriceFilter::AtMost(max) => {
            conditions.push(format!("price <= ?{}", params.len() + 1));
            params.push(Box::new(max as i64));
        }
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };
    let order = if name.is_some() { "name" } else { "harvested_at DESC, name" };

    let sql = format!(
        "SELECT name, rating_summary, rating_percent, release_date, price, header_image, source_url
         FROM games{}
         ORDER BY {}
         LIMIT {}",
        where_clause, order, limit
    );

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), |row| {
            Ok(GameRow {
                name: row.get(0)?,
                rating_summary: row.get(1)?,
                rating_percent: row.get(2)?,
                release_date: row.get(3)?,
                price: row.get(4)?,
                header_image: row.get(5)?,
                source_url: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stats ──

pub struct Stats {
    pub games: usize,
    pub free: usize,
    pub runs: usize,
    pub last_run: Option<String>,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let games: usize = conn.query_row("SELECT COUNT(*) FROM games", [], |r| r.get(0))?;
    let free: usize =
        conn.query_row("SELECT COUNT(*) FROM games WHERE price = 0", [], |r| r.get(0))?;
    let runs: usize = conn.query_row("SELECT COUNT(*) FROM runs", [], |r| r.get(0))?;
    let last_run: Option<String> =
        conn.query_row("SELECT MAX(finished_at) FROM runs", [], |r| r.get(0))?;
    Ok(Stats {
        games,
        free,
        runs,
        last_run,
    })
}

mod config;
mod db;
mod error;
mod fetcher;
mod gate;
mod parser;
mod pipeline;
mod resolve;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use config::{PageRange, Settings};
use db::{PriceFilter, SqliteSink};
use fetcher::{Fetcher, HttpFetcher};
use gate::Gate;
use parser::rules::FieldRuleSet;
use pipeline::{HarvestOptions, Harvester};
use resolve::Resolver;

#[derive(Parser)]
#[command(name = "catalog_harvester", about = "Steam store catalog harvester")]
struct Cli {
    /// Settings file (default: ./harvest.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,
    /// Discover listing pages, fetch items, validate and persist
    Run {
        /// Listing offsets as START:END[:STRIDE] (e.g. 0:500:50)
        #[arg(long)]
        pages: Option<PageRange>,
        /// Max in-flight requests
        #[arg(short, long)]
        concurrency: Option<usize>,
        /// Minimum review count for a record to be kept
        #[arg(long)]
        min_reviews: Option<u64>,
        /// Max media URLs per record
        #[arg(long)]
        media_cap: Option<usize>,
        /// Skip TLS certificate verification
        #[arg(long)]
        insecure: bool,
        /// No progress bar
        #[arg(short, long)]
        quiet: bool,
    },
    /// Fetch one item page and print the resolved record and verdict (nothing is saved)
    Fetch {
        url: String,
    },
    /// Show database and run statistics
    Stats,
    /// Persisted games table
    List {
        /// Filter by name (substring)
        #[arg(long)]
        name: Option<String>,
        /// free, any, or a maximum price in minor units (e.g. 999)
        #[arg(long, default_value = "any")]
        price: PriceFilter,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    if let Some(db) = cli.db {
        settings.db_path = db;
    }

    let result = match cli.command {
        Commands::Init => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            println!("Database ready at {}", settings.db_path.display());
            Ok(())
        }
        Commands::Run {
            pages,
            concurrency,
            min_reviews,
            media_cap,
            insecure,
            quiet,
        } => {
            if let Some(p) = pages {
                settings.listing.pages = p;
            }
            if let Some(c) = concurrency {
                settings.concurrency = c;
            }
            if let Some(m) = min_reviews {
                settings.rating.min_reviews = m;
            }
            if let Some(m) = media_cap {
                settings.media_cap = m;
            }
            if insecure {
                settings.http.verify_tls = false;
            }
            settings.validate()?;
            run_harvest(&settings, !quiet).await
        }
        Commands::Fetch { url } => {
            settings.validate()?;
            fetch_one(&settings, &url).await
        }
        Commands::Stats => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Games:    {}", s.games);
            println!("Free:     {}", s.free);
            println!("Runs:     {}", s.runs);
            println!("Last run: {}", s.last_run.as_deref().unwrap_or("-"));

            let runs = db::fetch_recent_runs(&conn, 5)?;
            if !runs.is_empty() {
                println!("\n--- Recent runs ---");
                for r in &runs {
                    println!(
                        "  {} {} {}/{}: {}",
                        r.run_id,
                        truncate(&r.finished_at, 19),
                        r.persisted,
                        r.discovered,
                        r.summary
                    );
                }
            }
            Ok(())
        }
        Commands::List { name, price, limit } => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let rows = db::fetch_games(&conn, name.as_deref(), price, limit)?;
            if rows.is_empty() {
                println!("No games found.");
                return Ok(());
            }

            println!(
                "{:>3} | {:<32} | {:<14} | {:>6} | {:>8} | {:<40}",
                "#", "Name", "Released", "Rating", "Price", "URL"
            );
            println!("{}", "-".repeat(118));

            for (i, r) in rows.iter().enumerate() {
                let rating = r
                    .rating_percent
                    .map(|p| format!("{}%", p))
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:>3} | {:<32} | {:<14} | {:>6} | {:>8} | {:<40}",
                    i + 1,
                    truncate(&r.name, 32),
                    truncate(r.release_date.as_deref().unwrap_or("-"), 14),
                    rating,
                    format_price(r.price),
                    truncate(&r.source_url, 40)
                );
            }

            let with_summary: Vec<_> = rows.iter().filter(|r| r.rating_summary.is_some()).collect();
            if !with_summary.is_empty() && with_summary.len() <= 10 {
                println!("\n--- Reviews ---");
                for r in &with_summary {
                    println!(
                        "  {}: {}",
                        truncate(&r.name, 32),
                        r.rating_summary.as_deref().unwrap_or_default()
                    );
                }
            }

            let with_header = rows.iter().filter(|r| r.header_image.is_some()).count();
            println!("\n{} games ({} with header image)", rows.len(), with_header);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// The read-only pieces every item task shares.
struct Components {
    fetcher: Arc<HttpFetcher>,
    rules: Arc<FieldRuleSet>,
    resolver: Arc<Resolver>,
    gate: Arc<Gate>,
}

fn build_components(settings: &Settings) -> anyhow::Result<Components> {
    let rules = match &settings.rules_file {
        Some(path) => FieldRuleSet::from_file(path)?,
        None => FieldRuleSet::storefront()?,
    };
    Ok(Components {
        fetcher: Arc::new(HttpFetcher::new(&settings.http)?),
        rules: Arc::new(rules),
        resolver: Arc::new(Resolver::from_settings(settings)?),
        gate: Arc::new(Gate::from_names(&settings.gate.checks)?),
    })
}

async fn run_harvest(settings: &Settings, progress: bool) -> anyhow::Result<()> {
    let conn = db::connect(&settings.db_path)?;
    db::init_schema(&conn)?;
    let c = build_components(settings)?;

    let harvester = Harvester::new(
        c.fetcher,
        c.rules,
        c.resolver,
        c.gate,
        HarvestOptions::from_settings(settings, progress),
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight requests");
            on_signal.cancel();
        }
    });

    println!(
        "Harvesting {} listing pages (concurrency {}, streaming to {})...",
        settings.listing.listing_urls().len(),
        settings.concurrency,
        settings.db_path.display()
    );
    let mut sink = SqliteSink::new(&conn);
    let report = harvester.run(&mut sink, cancel).await?;
    db::save_run(&conn, &report)?;

    print!("{}", report);
    Ok(())
}

async fn fetch_one(settings: &Settings, url: &str) -> anyhow::Result<()> {
    let c = build_components(settings)?;
    let document = c.fetcher.fetch(url).await?;
    let evaluation = parser::evaluate(&document, &c.rules, &c.resolver, &c.gate)
        .with_context(|| format!("{} does not look like an item page (age gate or error page?)", url))?;
    println!("{}", serde_json::to_string_pretty(&evaluation)?);
    Ok(())
}

fn format_price(minor: Option<i64>) -> String {
    match minor {
        None => "-".to_string(),
        Some(0) => "Free".to_string(),
        Some(p) => format!("{}.{:02}", p / 100, p % 100),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

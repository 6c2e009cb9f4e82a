use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use byteon_core::{count_rows, Observation};
use byteon_storage::CsvFetcher;
use byteon_sync::SyncConfig;
use byteon_tracker::{AdaptivePoller, PollerConfig};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "byteon-cli")]
#[command(about = "Byteon registrant tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync persisted counts for every tracked entity (or one with --id).
    Sync {
        #[arg(long)]
        id: Option<String>,
    },
    /// Fetch an export once and print its registrant count.
    Count { url: String },
    /// Poll an export live; type `r` + Enter to refresh immediately.
    Watch {
        url: String,
        #[arg(long)]
        fallback: Option<u64>,
        #[arg(long, default_value_t = 3000)]
        normal_ms: u64,
        #[arg(long, default_value_t = 2000)]
        quick_ms: u64,
        #[arg(long, default_value_t = 2)]
        max_quick_checks: u32,
    },
    Migrate,
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { id: None }) {
        Commands::Sync { id } => {
            let report = byteon_sync::run_sync_once_from_env(id.as_deref()).await?;
            println!(
                "sync complete: run_id={} entities={} succeeded={} failed={}",
                report.run_id,
                report.results.len(),
                report.succeeded(),
                report.failed()
            );
            for result in &report.results {
                match (&result.count, &result.error) {
                    (Some(count), _) => println!("  {}: {}", result.id, count),
                    (_, Some(error)) => println!("  {}: error: {}", result.id, error),
                    _ => println!("  {}: -", result.id),
                }
            }
        }
        Commands::Count { url } => {
            let fetcher = CsvFetcher::new(SyncConfig::from_env().http_client_config())?;
            let text = fetcher.fetch_text(&url).await?;
            println!("{}", count_rows(&text));
        }
        Commands::Watch {
            url,
            fallback,
            normal_ms,
            quick_ms,
            max_quick_checks,
        } => {
            let config = PollerConfig {
                normal_interval: Duration::from_millis(normal_ms),
                quick_interval: Duration::from_millis(quick_ms),
                max_quick_checks,
            };
            watch(url, fallback, config).await?;
        }
        Commands::Migrate => {
            byteon_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            byteon_web::serve_from_env().await?;
        }
    }

    Ok(())
}

async fn watch(url: String, fallback: Option<u64>, config: PollerConfig) -> Result<()> {
    let fetcher = Arc::new(CsvFetcher::new(SyncConfig::from_env().http_client_config())?);
    let poller = AdaptivePoller::start(fetcher, url, config, fallback);
    let refresher = poller.refresher();
    let mut snapshots = poller.subscribe();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    print_snapshot(&poller.snapshot());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                print_snapshot(&snapshot);
            }
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) if line.trim() == "r" => {
                    let refresher = refresher.clone();
                    tokio::spawn(async move { refresher.refresh().await });
                }
                Some(_) => {}
                None => stdin_open = false,
            },
        }
    }

    poller.shutdown();
    Ok(())
}

fn print_snapshot(snapshot: &Observation) {
    let source = if snapshot.live_count.is_some() { "live" } else { "cached" };
    match &snapshot.last_error {
        Some(error) => println!(
            "{} ({source}, {:?}) error: {error}",
            snapshot.displayed_count(),
            snapshot.phase
        ),
        None => println!(
            "{} ({source}, {:?})",
            snapshot.displayed_count(),
            snapshot.phase
        ),
    }
}

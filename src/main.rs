//! feed-dispatch: polls RSS feeds and hands new matching torrents to
//! Transmission.
//!
//! ## Architecture overview
//!
//! ```text
//! ┌───────────┐ snapshot ┌──────────┐ run_cycle() ┌──────────┐
//! │ config.rs │ ───────► │ poll.rs  │ ──────────► │  job.rs  │
//! │  (store)  │  (watch) │ (timer + │             │ (cycle)  │
//! └───────────┘          │ trigger) │             └────┬─────┘
//!                        └──────────┘                  │
//!              ┌───────────────┬──────────────┬────────┴──────┐
//!              ▼               ▼              ▼               ▼
//!         ┌─────────┐    ┌────────────┐ ┌────────────┐  ┌──────────┐
//!         │ source/ │    │ payload.rs │ │ backend.rs │  │ cache.rs │
//!         │ (feeds) │    │ (torrents) │ │  (submit)  │  │ (dedup)  │
//!         └─────────┘    └────────────┘ └────────────┘  └──────────┘
//! ```
//!
//! * **`config`**: the source list, its file format, and the single writer
//!   that publishes immutable snapshots.
//! * **`filter`**: pure eligibility, date, and title-pattern decisions.
//! * **`source/`**: the `FeedFetcher` trait and the RSS implementation.
//! * **`payload`**: turns a feed item into a `ResultDescriptor`.
//! * **`descriptor`**: the payload/magnet value and its cache encoding.
//! * **`backend`**: the `Submitter` trait and the Transmission client.
//! * **`cache`**: the `DedupCache` trait and the SQLite implementation.
//! * **`job`**: one poll cycle: host partitioning, bounded concurrency,
//!   the per-item pipeline.
//! * **`poll`**: the scheduler loop and manual triggers.
//! * **`main`**: parses flags, wires everything together, and handles
//!   signals.

mod backend;
mod cache;
mod config;
mod descriptor;
mod filter;
mod job;
mod payload;
mod poll;
mod source;

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use backend::TransmissionClient;
use cache::{DedupCache, SqliteCache};
use config::{ConfigFormat, ConfigStore, Source};
use job::{Job, JobLimits};
use payload::HttpPayloadFetcher;
use source::RssFeed;

const CACHE_FILE: &str = "dispatch.db";
const DEFAULT_RPC: &str = "http://127.0.0.1:9091/transmission/rpc";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "feed-dispatch", version, about = "Poll RSS feeds and queue new torrents in Transmission")]
struct Cli {
    /// Directory holding the source list and the cache database.
    #[arg(long, env = "FEED_DISPATCH_DIR", default_value = ".")]
    dir: PathBuf,

    /// Source list file format.
    #[arg(long, env = "FEED_DISPATCH_FORMAT", value_enum, default_value_t = ConfigFormat::Toml)]
    format: ConfigFormat,

    /// Transmission RPC endpoint; user info is used for basic auth.
    #[arg(long, env = "FEED_DISPATCH_RPC", default_value = DEFAULT_RPC)]
    rpc: String,

    /// Minutes between scheduled cycles.
    #[arg(long, env = "FEED_DISPATCH_INTERVAL", default_value_t = 60)]
    interval: u64,

    /// Concurrent feed and payload fetches across all hosts.
    #[arg(long, env = "FEED_DISPATCH_MAX_IN_FLIGHT", default_value_t = 8)]
    max_in_flight: usize,

    /// Seconds allowed for one feed fetch.
    #[arg(long, env = "FEED_DISPATCH_FEED_TIMEOUT", default_value_t = 45)]
    feed_timeout: u64,

    /// Seconds allowed for one torrent download.
    #[arg(long, env = "FEED_DISPATCH_PAYLOAD_TIMEOUT", default_value_t = 45)]
    payload_timeout: u64,

    /// Seconds allowed for one submission to Transmission.
    #[arg(long, env = "FEED_DISPATCH_SUBMIT_TIMEOUT", default_value_t = 30)]
    submit_timeout: u64,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll on a timer until interrupted (the default).
    Run,
    /// Run a single cycle and exit.
    Once,
    /// Print the configured sources.
    List,
    /// Add a source.
    Add(AddArgs),
    /// Remove a source by name.
    Remove { name: String },
    /// Enable or disable a source by name.
    Toggle { name: String },
    /// Print the item URLs already dispatched for a source.
    History { name: String },
}

#[derive(Debug, Args)]
struct AddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    url: String,
    #[arg(long)]
    download_dir: String,
    /// Repeatable.
    #[arg(long = "label")]
    labels: Vec<String>,
    /// Title regex; repeatable.  No include pattern means every title.
    #[arg(long)]
    include: Vec<String>,
    /// Title regex; repeatable.  Wins over include.
    #[arg(long)]
    exclude: Vec<String>,
    /// Skip items published at or before this epoch second.
    #[arg(long)]
    download_after: Option<i64>,
    /// Stop polling this source from this epoch second on.
    #[arg(long)]
    expire_time: Option<i64>,
    /// Milliseconds to wait before each request to this source.
    #[arg(long, default_value_t = 0)]
    fetch_interval: u64,
    #[arg(long)]
    disabled: bool,
}

impl From<AddArgs> for Source {
    fn from(args: AddArgs) -> Self {
        let mut source = Source::new(args.name, args.url, args.download_dir);
        source.labels = args.labels;
        source.include = args.include;
        source.exclude = args.exclude;
        source.download_after = args.download_after;
        source.expire_time = args.expire_time;
        source.fetch_interval = args.fetch_interval;
        source.disabled = args.disabled;
        source
    }
}

impl Cli {
    fn limits(&self) -> JobLimits {
        JobLimits {
            feed_timeout: Duration::from_secs(self.feed_timeout),
            payload_timeout: Duration::from_secs(self.payload_timeout),
            submit_timeout: Duration::from_secs(self.submit_timeout),
            max_in_flight: self.max_in_flight,
        }
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.interval.max(1) * 60)
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("feed_dispatch=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let mut cli = Cli::parse();
    let command = cli.command.take().unwrap_or(Command::Run);
    let store = ConfigStore::open(&cli.dir, cli.format)?;

    match command {
        Command::Run => serve(&cli, &store, false).await,
        Command::Once => serve(&cli, &store, true).await,
        Command::List => {
            for source in &store.snapshot().sources {
                let state = if source.disabled { "disabled" } else { "enabled" };
                println!(
                    "{}\t{}\t{}\t{}",
                    source.name, state, source.url, source.download_dir
                );
            }
            Ok(())
        }
        Command::Add(args) => {
            let source = Source::from(args);
            let name = source.name.clone();
            store.add_source(source)?;
            info!(source = %name, "source added");
            Ok(())
        }
        Command::Remove { name } => {
            store.remove_source(&name)?;
            info!(source = %name, "source removed");
            Ok(())
        }
        Command::Toggle { name } => {
            let disabled = store.toggle_disabled(&name)?;
            info!(source = %name, disabled, "source toggled");
            Ok(())
        }
        Command::History { name } => {
            let cache = SqliteCache::open(&cli.dir.join(CACHE_FILE))?;
            for key in cache.entries(&name)? {
                println!("{key}");
            }
            cache.close()?;
            Ok(())
        }
    }
}

/// Wire up the collaborators and run cycles until shutdown, or exactly one
/// cycle when `once` is set.
async fn serve(cli: &Cli, store: &ConfigStore, once: bool) -> Result<()> {
    let cache = Arc::new(SqliteCache::open(&cli.dir.join(CACHE_FILE))?);

    let limits = cli.limits();
    let client = reqwest::Client::builder()
        .user_agent(concat!("feed-dispatch/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(limits.http_backstop())
        .build()
        .context("failed to build http client")?;

    let backend = TransmissionClient::new(client.clone(), &cli.rpc)?;
    backend
        .ping()
        .await
        .context("transmission is not reachable")?;
    info!("connected to transmission");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(forward_shutdown(shutdown_signal()?, shutdown_tx));

    let job = Arc::new(Job::new(
        Arc::new(RssFeed::new(client.clone())),
        Arc::new(HttpPayloadFetcher::new(client)),
        Arc::new(backend),
        cache.clone(),
        limits,
        shutdown_rx.clone(),
    ));

    if once {
        if job.try_run(&store.snapshot()).await.is_none() {
            warn!("job is already running");
        }
    } else {
        let (handle, scheduler) = poll::spawn(
            Arc::clone(&job),
            store.subscribe(),
            cli.interval(),
            shutdown_rx.clone(),
        );
        listen_for_triggers(handle.clone())?;

        let mut shutdown = shutdown_rx;
        // An error means the sender is gone, which only happens on the way out.
        let _ = shutdown.wait_for(|stop| *stop).await;
        scheduler.await.context("scheduler task panicked")?;
        if handle.is_running() {
            info!("waiting for the running cycle to wind down");
        }
        job.wait_idle().await;
    }

    cache.close()?;
    info!("stopped");
    Ok(())
}

/// `SIGUSR1` starts a cycle immediately.
#[cfg(unix)]
fn listen_for_triggers(handle: poll::SchedulerHandle) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = signal(SignalKind::user_defined1()).context("failed to register SIGUSR1")?;
    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            if let Err(e) = handle.trigger_now() {
                warn!(error = %e, "manual trigger failed");
                break;
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn listen_for_triggers(_handle: poll::SchedulerHandle) -> Result<()> {
    Ok(())
}

/// Register the shutdown signals now and return a future that resolves on
/// the first of them: Ctrl-C, or SIGTERM on Unix.
///
/// Fails at startup if a handler cannot be registered.
#[cfg(unix)]
fn shutdown_signal() -> Result<impl Future<Output = io::Result<()>>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        Ok::<_, io::Error>(())
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> Result<impl Future<Output = io::Result<()>>> {
    Ok(tokio::signal::ctrl_c())
}

/// Flip `shutdown` once `signal` fires.
///
/// If `signal` fails the sender is held forever; receivers must never see
/// it close.
async fn forward_shutdown<F>(signal: F, shutdown: watch::Sender<bool>)
where
    F: Future<Output = io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("shutdown requested");
            let _ = shutdown.send(true);
        }
        Err(e) => {
            warn!(error = %e, "shutdown listener failed, ignoring signals from now on");
            std::future::pending::<()>().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failed_listener_does_not_request_shutdown() {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(forward_shutdown(
            async { Err::<(), _>(io::Error::other("no signal handler")) },
            tx,
        ));

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(rx.has_changed().is_ok(), "sender must stay alive");
        assert!(!*rx.borrow());
    }

    #[tokio::test]
    async fn signal_requests_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(forward_shutdown(async { Ok::<_, io::Error>(()) }, tx));

        rx.wait_for(|stop| *stop).await.unwrap();
    }

    #[test]
    fn flags_map_to_limits() {
        let cli = Cli::parse_from(["feed-dispatch", "--feed-timeout", "10", "--max-in-flight", "2"]);
        let limits = cli.limits();
        assert_eq!(limits.feed_timeout, Duration::from_secs(10));
        assert_eq!(limits.max_in_flight, 2);
        assert!(limits.http_backstop() > limits.payload_timeout);
    }
}

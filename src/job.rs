//! One poll cycle: fetch every eligible feed, pick out new matching items,
//! submit them, and record them in the dedup cache.
//!
//! ## Shape of a cycle
//!
//! ```text
//!  Config snapshot
//!        │  partition_by_host()
//!        ▼
//!  ┌──────────┐ ┌──────────┐ ┌──────────┐   one worker per host, run
//!  │ host a   │ │ host b   │ │ default  │   concurrently; sources inside
//!  │ src, src │ │ src      │ │ src      │   a worker run one after another
//!  └────┬─────┘ └────┬─────┘ └────┬─────┘
//!       ▼            ▼            ▼
//!  date gate → pattern gate → cache gate → fetch payload → submit → store
//! ```
//!
//! A global semaphore caps concurrent feed and payload fetches across all
//! workers.  Nothing inside a cycle is fatal: failures are logged and the
//! affected item (or source) is simply picked up again next cycle because
//! it was never recorded.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::backend::Submitter;
use crate::cache::{CacheError, DedupCache};
use crate::config::{Config, Source};
use crate::descriptor::ResultDescriptor;
use crate::filter;
use crate::payload::PayloadFetcher;
use crate::source::{FeedFetcher, FeedItem};

/// Partition for sources whose URL has no parseable host.
const FALLBACK_PARTITION: &str = "default";

/// Attempts made to record a submitted item before giving up.
const STORE_ATTEMPTS: u32 = 3;
const STORE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Added on top of the longest per-call limit for the HTTP client's own
/// timeout.
const HTTP_BACKSTOP_SLACK: Duration = Duration::from_secs(15);

/// Per-call ceilings and the global fetch cap.
#[derive(Debug, Clone)]
pub struct JobLimits {
    pub feed_timeout: Duration,
    pub payload_timeout: Duration,
    pub submit_timeout: Duration,
    pub max_in_flight: usize,
}

impl Default for JobLimits {
    fn default() -> Self {
        Self {
            feed_timeout: Duration::from_secs(45),
            payload_timeout: Duration::from_secs(45),
            submit_timeout: Duration::from_secs(30),
            max_in_flight: 8,
        }
    }
}

impl JobLimits {
    /// Whole-request timeout for the shared HTTP client.  Always longer
    /// than every per-call limit, so those fire first.
    pub fn http_backstop(&self) -> Duration {
        self.feed_timeout
            .max(self.payload_timeout)
            .max(self.submit_timeout)
            + HTTP_BACKSTOP_SLACK
    }
}

#[derive(Debug, Error)]
pub enum ItemError {
    #[error("fetch payload failed: {0:#}")]
    Fetch(anyhow::Error),
    #[error("submit failed: {0:#}")]
    Submit(anyhow::Error),
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
}

/// What happened to one candidate item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    TooOld,
    NotMatched,
    AlreadyHandled,
    /// Submitted; `recorded` is false when the cache write failed.
    Submitted { recorded: bool },
}

/// Counters for one cycle, summed across partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub sources: usize,
    pub failed_sources: usize,
    pub items: usize,
    pub submitted: usize,
    pub unrecorded: usize,
    pub already_handled: usize,
    pub failed_items: usize,
}

impl CycleStats {
    fn merge(&mut self, other: CycleStats) {
        self.sources += other.sources;
        self.failed_sources += other.failed_sources;
        self.items += other.items;
        self.submitted += other.submitted;
        self.unrecorded += other.unrecorded;
        self.already_handled += other.already_handled;
        self.failed_items += other.failed_items;
    }
}

// ---------------------------------------------------------------------------
// Run state: at most one cycle at a time
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RunState {
    running: AtomicBool,
    idle: Notify,
}

/// Proof that the caller owns the single active run.
///
/// Returned by [`Job::try_begin`]; dropping it (normally or during unwinding)
/// marks the job idle again.
pub struct RunGuard {
    state: Arc<RunState>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::SeqCst);
        self.state.idle.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

pub struct Job {
    feeds: Arc<dyn FeedFetcher>,
    payloads: Arc<dyn PayloadFetcher>,
    backend: Arc<dyn Submitter>,
    cache: Arc<dyn DedupCache>,
    limits: JobLimits,
    permits: Semaphore,
    state: Arc<RunState>,
    shutdown: watch::Receiver<bool>,
}

impl Job {
    pub fn new(
        feeds: Arc<dyn FeedFetcher>,
        payloads: Arc<dyn PayloadFetcher>,
        backend: Arc<dyn Submitter>,
        cache: Arc<dyn DedupCache>,
        limits: JobLimits,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let permits = Semaphore::new(limits.max_in_flight.max(1));
        Self {
            feeds,
            payloads,
            backend,
            cache,
            limits,
            permits,
            state: Arc::new(RunState::default()),
            shutdown,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Claim the single active run, or `None` if a cycle is in flight.
    pub fn try_begin(&self) -> Option<RunGuard> {
        self.state
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard {
                state: Arc::clone(&self.state),
            })
    }

    /// Run a cycle unless one is already in flight.
    pub async fn try_run(&self, config: &Config) -> Option<CycleStats> {
        let _guard = self.try_begin()?;
        Some(self.run_cycle(config).await)
    }

    /// Resolve once no cycle is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.state.idle.notified();
            if !self.is_running() {
                return;
            }
            idle.await;
        }
    }

    /// Run one full cycle over `config`.
    ///
    /// Does not touch the run state; callers that need the single-run
    /// guarantee go through [`try_begin`](Self::try_begin) or
    /// [`try_run`](Self::try_run).
    pub async fn run_cycle(&self, config: &Config) -> CycleStats {
        let partitions = partition_by_host(config);
        info!(
            sources = config.sources.len(),
            partitions = partitions.len(),
            "start job"
        );

        let mut stats = CycleStats::default();
        let workers = partitions
            .into_iter()
            .map(|(host, sources)| self.run_partition(host, sources));
        for partial in join_all(workers).await {
            stats.merge(partial);
        }

        info!(
            sources = stats.sources,
            failed_sources = stats.failed_sources,
            items = stats.items,
            submitted = stats.submitted,
            unrecorded = stats.unrecorded,
            already_handled = stats.already_handled,
            failed_items = stats.failed_items,
            "job done"
        );
        stats
    }

    async fn run_partition(&self, host: String, sources: Vec<&Source>) -> CycleStats {
        debug!(host = %host, sources = sources.len(), "partition worker started");
        let mut stats = CycleStats::default();
        for source in sources {
            if self.shutting_down() {
                warn!(host = %host, "shutdown requested, abandoning partition");
                break;
            }
            self.process_source(source, &mut stats).await;
        }
        stats
    }

    async fn process_source(&self, source: &Source, stats: &mut CycleStats) {
        if !filter::is_eligible(source) {
            return;
        }
        stats.sources += 1;

        self.throttle(source).await;

        let items = match self.fetch_feed(source).await {
            Ok(items) => items,
            Err(e) => {
                error!(source = %source.name, url = %source.url, error = %e, "parse rss failed");
                stats.failed_sources += 1;
                return;
            }
        };
        info!(source = %source.name, url = %source.url, items = items.len(), "parsed rss");

        for item in &items {
            if self.shutting_down() {
                warn!(source = %source.name, "shutdown requested, abandoning source");
                break;
            }
            stats.items += 1;
            match self.process_item(source, item).await {
                Ok(ItemOutcome::Submitted { recorded }) => {
                    stats.submitted += 1;
                    if !recorded {
                        stats.unrecorded += 1;
                    }
                }
                Ok(ItemOutcome::AlreadyHandled) => stats.already_handled += 1,
                Ok(ItemOutcome::TooOld | ItemOutcome::NotMatched) => {}
                Err(e) => {
                    error!(source = %source.name, url = %item.url, error = %e, "process item failed");
                    stats.failed_items += 1;
                }
            }
        }
    }

    /// Run one item through the gates and, if it passes, fetch, submit and
    /// record it.
    pub async fn process_item(
        &self,
        source: &Source,
        item: &FeedItem,
    ) -> Result<ItemOutcome, ItemError> {
        if !filter::passes_date_threshold(source, item) {
            return Ok(ItemOutcome::TooOld);
        }
        if !filter::matches(source, &item.title) {
            return Ok(ItemOutcome::NotMatched);
        }
        if self.cache_load(source, item).await.is_some() {
            return Ok(ItemOutcome::AlreadyHandled);
        }

        debug!(
            source = %source.name,
            name = %item.title,
            description = item.description.as_deref().unwrap_or_default(),
            "item matched"
        );
        self.throttle(source).await;

        let descriptor = {
            let _permit = self.permits.acquire().await;
            timeout(self.limits.payload_timeout, self.payloads.fetch_payload(item))
                .await
                .map_err(|_| ItemError::Timeout("payload fetch", self.limits.payload_timeout))?
                .map_err(ItemError::Fetch)?
        };

        timeout(
            self.limits.submit_timeout,
            self.backend
                .submit(&descriptor, &source.download_dir, &source.labels),
        )
        .await
        .map_err(|_| ItemError::Timeout("submit", self.limits.submit_timeout))?
        .map_err(ItemError::Submit)?;

        info!(
            source = %source.name,
            url = %item.url,
            name = %item.title,
            descriptor = %descriptor.summary(),
            "add torrent"
        );

        let recorded = self.record(source, item, &descriptor).await;
        Ok(ItemOutcome::Submitted { recorded })
    }

    async fn fetch_feed(&self, source: &Source) -> anyhow::Result<Vec<FeedItem>> {
        let _permit = self.permits.acquire().await;
        timeout(self.limits.feed_timeout, self.feeds.fetch_feed(&source.url))
            .await
            .map_err(|_| anyhow::anyhow!("timed out after {:?}", self.limits.feed_timeout))?
    }

    /// Store the submitted descriptor, retrying a few times.  Returns
    /// whether the record landed.
    async fn record(&self, source: &Source, item: &FeedItem, descriptor: &ResultDescriptor) -> bool {
        for attempt in 1..=STORE_ATTEMPTS {
            match self.cache_store(source, item, descriptor).await {
                Ok(()) => return true,
                Err(e) if attempt < STORE_ATTEMPTS => {
                    warn!(source = %source.name, url = %item.url, attempt, error = %e, "store torrent failed, retrying");
                    tokio::time::sleep(STORE_RETRY_DELAY * attempt).await;
                }
                Err(e) => {
                    error!(
                        source = %source.name,
                        url = %item.url,
                        error = %e,
                        "store torrent failed, item may be submitted again next cycle"
                    );
                }
            }
        }
        false
    }

    /// Cache lookup on the blocking pool, so a slow disk stalls only this
    /// partition and not the other workers sharing the runtime thread.
    async fn cache_load(&self, source: &Source, item: &FeedItem) -> Option<ResultDescriptor> {
        let cache = Arc::clone(&self.cache);
        let namespace = source.name.clone();
        let key = item.url.clone();
        match tokio::task::spawn_blocking(move || cache.load(&namespace, &key)).await {
            Ok(found) => found,
            Err(e) => {
                warn!(source = %source.name, url = %item.url, error = %e, "cache lookup task failed");
                None
            }
        }
    }

    async fn cache_store(
        &self,
        source: &Source,
        item: &FeedItem,
        descriptor: &ResultDescriptor,
    ) -> Result<(), CacheError> {
        let cache = Arc::clone(&self.cache);
        let namespace = source.name.clone();
        let key = item.url.clone();
        let descriptor = descriptor.clone();
        tokio::task::spawn_blocking(move || cache.store(&namespace, &key, &descriptor)).await?
    }

    /// Sleep the source's fetch interval, cut short by shutdown.
    async fn throttle(&self, source: &Source) {
        let delay = source.fetch_throttle();
        if delay.is_zero() {
            return;
        }
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.wait_for(|stop| *stop) => {}
        }
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Group eligible sources by the host (and port) of their feed URL.
///
/// Sources whose URL does not parse, or has no host, share the fallback
/// partition.  Within a partition, configuration order is kept.
pub fn partition_by_host(config: &Config) -> BTreeMap<String, Vec<&Source>> {
    let mut partitions: BTreeMap<String, Vec<&Source>> = BTreeMap::new();
    for source in config.sources.iter().filter(|s| filter::is_eligible(s)) {
        let key = Url::parse(&source.url)
            .ok()
            .and_then(|url| {
                let host = url.host_str()?.to_string();
                Some(match url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host,
                })
            })
            .unwrap_or_else(|| FALLBACK_PARTITION.to_string());
        partitions.entry(key).or_default().push(source);
    }
    partitions
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::{mpsc, Mutex};

    use tempfile::tempdir;

    use super::testing::*;
    use super::*;
    use crate::cache::SqliteCache;

    fn demo_source() -> Source {
        let mut source = Source::new("demo", "http://h/feed", "/downloads/demo");
        source.include = vec!["^Foo".into()];
        source.download_after = Some(1000);
        source
    }

    fn demo_feeds() -> FakeFeeds {
        FakeFeeds::default().with_feed(
            "http://h/feed",
            vec![
                item("Foo-1", "http://h/foo-1.torrent", 1001),
                item("Bar-1", "http://h/bar-1.torrent", 1002),
                item("Foo-2", "http://h/foo-2.torrent", 900),
            ],
        )
    }

    fn config(sources: Vec<Source>) -> Config {
        Config { sources }
    }

    #[tokio::test]
    async fn only_new_matching_items_are_submitted_and_recorded() {
        let cache = Arc::new(MemoryCache::default());
        let h = harness(demo_feeds(), cache.clone(), JobLimits::default());

        let stats = h.job.run_cycle(&config(vec![demo_source()])).await;

        assert_eq!(h.payloads.calls(), vec!["http://h/foo-1.torrent"]);
        let submitted = h.backend.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(
            submitted[0].0,
            ResultDescriptor::magnet("http://h/foo-1.torrent")
        );
        assert_eq!(submitted[0].1, "/downloads/demo");
        assert_eq!(
            cache.keys(),
            vec![("demo".to_string(), "http://h/foo-1.torrent".to_string())]
        );
        assert_eq!(stats.items, 3);
        assert_eq!(stats.submitted, 1);
    }

    #[tokio::test]
    async fn persisted_cache_prevents_resubmission_across_restarts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dispatch.db");
        let cfg = config(vec![demo_source()]);

        let first = harness(
            demo_feeds(),
            Arc::new(SqliteCache::open(&path).unwrap()),
            JobLimits::default(),
        );
        first.job.run_cycle(&cfg).await;
        first.cache.close().unwrap();

        let second = harness(
            demo_feeds(),
            Arc::new(SqliteCache::open(&path).unwrap()),
            JobLimits::default(),
        );
        let stats = second.job.run_cycle(&cfg).await;

        assert_eq!(first.backend.submitted().len(), 1);
        assert!(second.backend.submitted().is_empty());
        assert!(second.payloads.calls().is_empty());
        assert_eq!(stats.already_handled, 1);
    }

    #[tokio::test]
    async fn disabled_and_expired_sources_are_never_fetched() {
        let mut disabled = Source::new("off", "http://a/feed", "/d");
        disabled.disabled = true;
        let mut expired = Source::new("old", "http://b/feed", "/d");
        expired.expire_time = Some(1);
        let live = Source::new("live", "http://c/feed", "/d");

        let h = harness(
            FakeFeeds::default(),
            Arc::new(MemoryCache::default()),
            JobLimits::default(),
        );
        let stats = h.job.run_cycle(&config(vec![disabled, expired, live])).await;

        assert_eq!(h.feeds.calls(), vec!["http://c/feed"]);
        assert_eq!(stats.sources, 1);
    }

    #[tokio::test]
    async fn feed_failure_only_abandons_that_source() {
        let broken = Source::new("broken", "http://a/feed", "/d");
        let healthy = Source::new("healthy", "http://a/other", "/d");
        let feeds = FakeFeeds::default()
            .failing("http://a/feed")
            .with_feed("http://a/other", vec![item("X", "http://a/x.torrent", 5)]);

        let h = harness(feeds, Arc::new(MemoryCache::default()), JobLimits::default());
        let stats = h.job.run_cycle(&config(vec![broken, healthy])).await;

        assert_eq!(stats.failed_sources, 1);
        assert_eq!(h.backend.submitted().len(), 1);
    }

    #[tokio::test]
    async fn failed_items_are_not_recorded_and_retry_next_cycle() {
        let source = Source::new("s", "http://a/feed", "/d");
        let feeds = FakeFeeds::default().with_feed(
            "http://a/feed",
            vec![
                item("gone", "http://a/gone.torrent", 5),
                item("ok", "http://a/ok.torrent", 5),
            ],
        );
        let cache = Arc::new(MemoryCache::default());
        let h = harness(feeds, cache.clone(), JobLimits::default());
        h.payloads
            .failing
            .lock()
            .unwrap()
            .insert("http://a/gone.torrent".into());
        h.backend.fail.store(true, Ordering::SeqCst);

        let cfg = config(vec![source]);
        let stats = h.job.run_cycle(&cfg).await;
        assert_eq!(stats.failed_items, 2);
        assert!(cache.keys().is_empty());

        // Backend recovers: the item that failed to submit goes through now.
        h.backend.fail.store(false, Ordering::SeqCst);
        let stats = h.job.run_cycle(&cfg).await;
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.failed_items, 1);
        assert_eq!(
            cache.keys(),
            vec![("s".to_string(), "http://a/ok.torrent".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn store_failures_are_retried_then_tolerated() {
        let source = Source::new("s", "http://a/feed", "/d");
        let feeds = FakeFeeds::default()
            .with_feed("http://a/feed", vec![item("x", "http://a/x.torrent", 5)]);

        let cache = Arc::new(MemoryCache::default());
        cache.failures_left.store(2, Ordering::SeqCst);
        let h = harness(feeds, cache.clone(), JobLimits::default());
        let cfg = config(vec![source]);

        let stats = h.job.run_cycle(&cfg).await;
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.unrecorded, 0);
        assert_eq!(cache.store_calls.load(Ordering::SeqCst), 3);

        // Every attempt fails: still submitted, but left unrecorded.
        let cache = Arc::new(MemoryCache::default());
        cache.failures_left.store(usize::MAX, Ordering::SeqCst);
        let feeds = FakeFeeds::default()
            .with_feed("http://a/feed", vec![item("x", "http://a/x.torrent", 5)]);
        let h = harness(feeds, cache.clone(), JobLimits::default());

        let stats = h.job.run_cycle(&cfg).await;
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.unrecorded, 1);
        assert!(cache.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn global_limit_caps_concurrent_fetches() {
        let sources = vec![
            Source::new("a", "http://a/feed", "/d"),
            Source::new("b", "http://b/feed", "/d"),
            Source::new("c", "http://c/feed", "/d"),
        ];
        let feeds = FakeFeeds {
            latency: Some(Duration::from_millis(50)),
            ..FakeFeeds::default()
        };
        let limits = JobLimits {
            max_in_flight: 1,
            ..JobLimits::default()
        };

        let h = harness(feeds, Arc::new(MemoryCache::default()), limits);
        h.job.run_cycle(&config(sources)).await;

        assert_eq!(h.feeds.calls().len(), 3);
        assert_eq!(h.feeds.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_interval_delays_feed_and_payload_requests() {
        let mut source = Source::new("s", "http://a/feed", "/d");
        source.fetch_interval = 5_000;
        let feeds = FakeFeeds::default()
            .with_feed("http://a/feed", vec![item("x", "http://a/x.torrent", 5)]);
        let h = harness(feeds, Arc::new(MemoryCache::default()), JobLimits::default());

        let job = Arc::clone(&h.job);
        let cfg = config(vec![source]);
        let cycle = tokio::spawn(async move { job.run_cycle(&cfg).await });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(h.feeds.calls().is_empty());

        // Feed fetched at 5s, the payload waits another interval.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.feeds.calls().len(), 1);
        assert!(h.payloads.calls().is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.payloads.calls(), vec!["http://a/x.torrent"]);

        let stats = cycle.await.unwrap();
        assert_eq!(stats.submitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn same_host_sources_run_one_at_a_time() {
        let limits = JobLimits {
            max_in_flight: 8,
            ..JobLimits::default()
        };
        let slow = || FakeFeeds {
            latency: Some(Duration::from_millis(50)),
            ..FakeFeeds::default()
        };

        let h = harness(slow(), Arc::new(MemoryCache::default()), limits.clone());
        h.job
            .run_cycle(&config(vec![
                Source::new("one", "http://a/one", "/d"),
                Source::new("two", "http://a/two", "/d"),
            ]))
            .await;
        assert_eq!(h.feeds.calls(), vec!["http://a/one", "http://a/two"]);
        assert_eq!(h.feeds.max_in_flight.load(Ordering::SeqCst), 1);

        // Different hosts do overlap.
        let h = harness(slow(), Arc::new(MemoryCache::default()), limits);
        h.job
            .run_cycle(&config(vec![
                Source::new("one", "http://a/one", "/d"),
                Source::new("two", "http://b/two", "/d"),
            ]))
            .await;
        assert_eq!(h.feeds.max_in_flight.load(Ordering::SeqCst), 2);
    }

    /// Loads in namespace "a" block the calling thread until a store in
    /// namespace "b" lands, or five seconds pass.
    struct HandoffCache {
        inner: MemoryCache,
        signal: Mutex<Option<mpsc::Sender<()>>>,
        wait: Mutex<mpsc::Receiver<()>>,
        handed_off: AtomicBool,
    }

    impl HandoffCache {
        fn new() -> Self {
            let (tx, rx) = mpsc::channel();
            Self {
                inner: MemoryCache::default(),
                signal: Mutex::new(Some(tx)),
                wait: Mutex::new(rx),
                handed_off: AtomicBool::new(false),
            }
        }
    }

    impl DedupCache for HandoffCache {
        fn load(&self, namespace: &str, item_key: &str) -> Option<ResultDescriptor> {
            if namespace == "a" {
                let got = self
                    .wait
                    .lock()
                    .unwrap()
                    .recv_timeout(Duration::from_secs(5))
                    .is_ok();
                self.handed_off.store(got, Ordering::SeqCst);
            }
            self.inner.load(namespace, item_key)
        }

        fn store(
            &self,
            namespace: &str,
            item_key: &str,
            descriptor: &ResultDescriptor,
        ) -> Result<(), CacheError> {
            if namespace == "b" {
                if let Some(tx) = self.signal.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            }
            self.inner.store(namespace, item_key, descriptor)
        }

        fn close(&self) -> Result<(), CacheError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn blocking_cache_calls_do_not_stall_other_hosts() {
        let feeds = FakeFeeds::default()
            .with_feed("http://a/feed", vec![item("x", "http://a/x.torrent", 5)])
            .with_feed("http://b/feed", vec![item("y", "http://b/y.torrent", 5)]);
        let cache = Arc::new(HandoffCache::new());
        let h = harness(feeds, cache.clone(), JobLimits::default());

        let stats = h
            .job
            .run_cycle(&config(vec![
                Source::new("a", "http://a/feed", "/d"),
                Source::new("b", "http://b/feed", "/d"),
            ]))
            .await;

        assert!(cache.handed_off.load(Ordering::SeqCst));
        assert_eq!(stats.submitted, 2);
    }

    #[test]
    fn http_backstop_outlasts_every_call_limit() {
        let limits = JobLimits {
            feed_timeout: Duration::from_secs(10),
            payload_timeout: Duration::from_secs(90),
            submit_timeout: Duration::from_secs(30),
            max_in_flight: 1,
        };
        assert!(limits.http_backstop() > Duration::from_secs(90));
        assert!(JobLimits::default().http_backstop() > Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_feed_times_out() {
        let feeds = FakeFeeds {
            latency: Some(Duration::from_secs(120)),
            ..FakeFeeds::default()
        };
        let limits = JobLimits {
            feed_timeout: Duration::from_secs(1),
            ..JobLimits::default()
        };

        let h = harness(feeds, Arc::new(MemoryCache::default()), limits);
        let stats = h
            .job
            .run_cycle(&config(vec![Source::new("s", "http://a/feed", "/d")]))
            .await;

        assert_eq!(stats.failed_sources, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_new_work() {
        let h = harness(
            demo_feeds(),
            Arc::new(MemoryCache::default()),
            JobLimits::default(),
        );
        h.shutdown.send(true).unwrap();

        h.job.run_cycle(&config(vec![demo_source()])).await;

        assert!(h.feeds.calls().is_empty());
    }

    #[tokio::test]
    async fn try_run_refuses_overlap() {
        let h = harness(
            FakeFeeds::default(),
            Arc::new(MemoryCache::default()),
            JobLimits::default(),
        );

        let guard = h.job.try_begin().unwrap();
        assert!(h.job.is_running());
        assert!(h.job.try_run(&Config::default()).await.is_none());

        drop(guard);
        assert!(!h.job.is_running());
        assert!(h.job.try_run(&Config::default()).await.is_some());
    }

    #[test]
    fn sources_are_partitioned_by_host() {
        let mut disabled = Source::new("off", "http://a.example/x", "/d");
        disabled.disabled = true;
        let cfg = config(vec![
            Source::new("a1", "http://a.example/feed1", "/d"),
            Source::new("b1", "https://b.example:8443/rss", "/d"),
            Source::new("a2", "http://a.example/feed2", "/d"),
            Source::new("bad", "not a url", "/d"),
            disabled,
        ]);

        let partitions = partition_by_host(&cfg);
        let names = |key: &str| -> Vec<String> {
            partitions[key].iter().map(|s| s.name.clone()).collect()
        };

        assert_eq!(partitions.len(), 3);
        assert_eq!(names("a.example"), vec!["a1", "a2"]);
        assert_eq!(names("b.example:8443"), vec!["b1"]);
        assert_eq!(names("default"), vec!["bad"]);
    }
}

//! Source list model and its on-disk store.
//!
//! A [`Config`] is the list of [`Source`]s to poll.  It is persisted as TOML
//! or JSON and owned by [`ConfigStore`], which is the only writer: every
//! mutation is saved to disk and then published as a fresh `Arc<Config>`
//! snapshot.  A poll cycle takes one snapshot and never sees later edits.
//!
//! Compiled pattern sets and converted timestamps are derived lazily and
//! memoised on the `Source` value itself, so a reload (which builds new
//! `Source` values) always recompiles.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::filter::PatternSet;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("failed to serialize TOML: {0}")]
    SerializeToml(#[from] toml::ser::Error),
    #[error("failed to (de)serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid source: {0}")]
    Invalid(String),
    #[error("source not found: {0}")]
    NotFound(String),
    #[error("config writer lock poisoned")]
    Poisoned,
}

/// On-disk format of the source list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// File name used inside the config directory.
    pub fn file_name(self) -> &'static str {
        match self {
            ConfigFormat::Toml => "config.toml",
            ConfigFormat::Json => "config.json",
        }
    }

    fn decode(self, data: &str) -> Result<Config, ConfigError> {
        Ok(match self {
            ConfigFormat::Toml => toml::from_str(data)?,
            ConfigFormat::Json => serde_json::from_str(data)?,
        })
    }

    fn encode(self, config: &Config) -> Result<String, ConfigError> {
        Ok(match self {
            ConfigFormat::Toml => toml::to_string_pretty(config)?,
            ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        })
    }
}

/// The full list of configured feeds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, alias = "rss")]
    pub sources: Vec<Source>,
}

/// One configured feed with its matching rules and destination.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Source {
    /// Stable identity; also the dedup-cache namespace.
    pub name: String,

    /// Feed URL.  Its host decides which partition polls it.
    pub url: String,

    /// Destination directory handed to the download backend.
    pub download_dir: String,

    #[serde(default, alias = "label", skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,

    /// Title patterns that select items.  Empty means "everything".
    #[serde(default, alias = "regexp", skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,

    /// Title patterns that reject items, checked before `include`.
    #[serde(
        default,
        alias = "exclude_regexp",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub exclude: Vec<String>,

    /// Only items published strictly after this epoch second are fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_after: Option<i64>,

    /// The source stops being polled once this epoch second is reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_time: Option<i64>,

    #[serde(default)]
    pub disabled: bool,

    /// Milliseconds to wait before each feed fetch and each payload fetch.
    #[serde(default)]
    pub fetch_interval: u64,

    #[serde(skip)]
    include_set: OnceLock<PatternSet>,
    #[serde(skip)]
    exclude_set: OnceLock<PatternSet>,
    #[serde(skip)]
    download_after_at: OnceLock<Option<DateTime<Utc>>>,
}

/// A clone starts with empty memoised state, so edits made to it are seen
/// the first time its patterns or thresholds are used.
impl Clone for Source {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            url: self.url.clone(),
            download_dir: self.download_dir.clone(),
            labels: self.labels.clone(),
            include: self.include.clone(),
            exclude: self.exclude.clone(),
            download_after: self.download_after,
            expire_time: self.expire_time,
            disabled: self.disabled,
            fetch_interval: self.fetch_interval,
            include_set: OnceLock::new(),
            exclude_set: OnceLock::new(),
            download_after_at: OnceLock::new(),
        }
    }
}

impl Source {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        download_dir: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            download_dir: download_dir.into(),
            ..Self::default()
        }
    }

    /// Include patterns, compiled on first use.
    pub fn include_patterns(&self) -> &PatternSet {
        self.include_set
            .get_or_init(|| PatternSet::compile_logged(&self.name, &self.include))
    }

    /// Exclude patterns, compiled on first use.
    pub fn exclude_patterns(&self) -> &PatternSet {
        self.exclude_set
            .get_or_init(|| PatternSet::compile_logged(&self.name, &self.exclude))
    }

    /// The `download_after` threshold, converted once from epoch seconds.
    /// Zero counts as unset.
    pub fn download_after_time(&self) -> Option<DateTime<Utc>> {
        *self.download_after_at.get_or_init(|| {
            self.download_after
                .filter(|secs| *secs != 0)
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
        })
    }

    /// Expiry instant, if one is configured.  Zero counts as unset.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expire_time
            .filter(|secs| *secs != 0)
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    }

    pub fn fetch_throttle(&self) -> Duration {
        Duration::from_millis(self.fetch_interval)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("name is empty".into()));
        }
        if self.url.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("{}: url is empty", self.name)));
        }
        if self.download_dir.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{}: download_dir is empty",
                self.name
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Owner of the source list file.
///
/// Writers are serialised by an internal lock; readers never block and get
/// an immutable snapshot.
pub struct ConfigStore {
    path: PathBuf,
    format: ConfigFormat,
    writer: Mutex<()>,
    sender: watch::Sender<Arc<Config>>,
}

impl ConfigStore {
    /// Open the source list in `dir`, creating an empty one if missing.
    pub fn open(dir: &Path, format: ConfigFormat) -> Result<Self, ConfigError> {
        let path = dir.join(format.file_name());
        let (config, missing) = match Self::load(&path, format) {
            Ok(config) => (config, false),
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir_all(dir)?;
                (Config::default(), true)
            }
            Err(e) => return Err(e),
        };

        let (sender, _) = watch::channel(Arc::new(config));
        let store = Self {
            path,
            format,
            writer: Mutex::new(()),
            sender,
        };

        if missing {
            store.save(Config::default())?;
            tracing::info!(path = %store.path.display(), "created empty source list");
        } else {
            tracing::info!(
                path = %store.path.display(),
                sources = store.snapshot().sources.len(),
                "loaded source list"
            );
        }
        Ok(store)
    }

    /// Read and parse the source list at `path`.
    pub fn load(path: &Path, format: ConfigFormat) -> Result<Config, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        format.decode(&data)
    }

    /// Persist `config` and publish it as the current snapshot.
    pub fn save(&self, config: Config) -> Result<Arc<Config>, ConfigError> {
        let _guard = self.writer.lock().map_err(|_| ConfigError::Poisoned)?;
        self.save_locked(config)
    }

    /// The current immutable snapshot.
    pub fn snapshot(&self) -> Arc<Config> {
        self.sender.borrow().clone()
    }

    /// A receiver that always sees the latest published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Config>> {
        self.sender.subscribe()
    }

    /// Append a new source.  Names must be unique.
    pub fn add_source(&self, source: Source) -> Result<Arc<Config>, ConfigError> {
        source.validate()?;
        self.update(|config| {
            if config.sources.iter().any(|s| s.name == source.name) {
                return Err(ConfigError::Invalid(format!(
                    "a source named {} already exists",
                    source.name
                )));
            }
            config.sources.push(source);
            Ok(())
        })
    }

    pub fn remove_source(&self, name: &str) -> Result<Arc<Config>, ConfigError> {
        self.update(|config| {
            let before = config.sources.len();
            config.sources.retain(|s| s.name != name);
            if config.sources.len() == before {
                return Err(ConfigError::NotFound(name.to_string()));
            }
            Ok(())
        })
    }

    /// Flip the `disabled` flag of a source, returning the new value.
    pub fn toggle_disabled(&self, name: &str) -> Result<bool, ConfigError> {
        let mut disabled = false;
        self.update(|config| {
            let source = config
                .sources
                .iter_mut()
                .find(|s| s.name == name)
                .ok_or_else(|| ConfigError::NotFound(name.to_string()))?;
            source.disabled = !source.disabled;
            disabled = source.disabled;
            Ok(())
        })?;
        Ok(disabled)
    }

    /// Copy the current snapshot, apply `f`, then save and publish.
    fn update<F>(&self, f: F) -> Result<Arc<Config>, ConfigError>
    where
        F: FnOnce(&mut Config) -> Result<(), ConfigError>,
    {
        let _guard = self.writer.lock().map_err(|_| ConfigError::Poisoned)?;
        let mut config = Config::clone(&self.snapshot());
        f(&mut config)?;
        self.save_locked(config)
    }

    fn save_locked(&self, config: Config) -> Result<Arc<Config>, ConfigError> {
        std::fs::write(&self.path, self.format.encode(&config)?)?;
        let snapshot = Arc::new(config);
        self.sender.send_replace(snapshot.clone());
        Ok(snapshot)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_legacy_field_names() {
        let data = r#"
[[rss]]
name = "show"
url = "https://example.com/rss"
download_dir = "/downloads/show"
regexp = ["^\\[Group\\]"]
exclude_regexp = ["720p"]
label = ["anime"]
download_after = 1700000000
fetch_interval = 500
"#;
        let config = ConfigFormat::Toml.decode(data).unwrap();
        let source = &config.sources[0];

        assert_eq!(source.name, "show");
        assert_eq!(source.include, vec!["^\\[Group\\]"]);
        assert_eq!(source.exclude, vec!["720p"]);
        assert_eq!(source.labels, vec!["anime"]);
        assert_eq!(source.fetch_throttle(), Duration::from_millis(500));
        assert_eq!(
            source.download_after_time().map(|d| d.timestamp()),
            Some(1_700_000_000)
        );
        assert!(!source.disabled);
    }

    #[test]
    fn edited_clone_recompiles_patterns() {
        let mut source = Source::new("a", "http://h/feed", "/d");
        source.include = vec!["^Foo".into()];
        source.download_after = Some(1000);
        assert!(source.include_patterns().is_match("Foo-1"));
        assert!(source.download_after_time().is_some());

        let mut edited = source.clone();
        edited.include = vec!["^Bar".into()];
        edited.download_after = None;

        assert!(!edited.include_patterns().is_match("Foo-1"));
        assert!(edited.include_patterns().is_match("Bar-1"));
        assert!(edited.download_after_time().is_none());
        // The original keeps its own compiled set.
        assert!(source.include_patterns().is_match("Foo-1"));
    }

    #[test]
    fn zero_timestamps_mean_unset() {
        let mut source = Source::new("a", "http://h/feed", "/d");
        source.download_after = Some(0);
        source.expire_time = Some(0);

        assert!(source.download_after_time().is_none());
        assert!(source.expires_at().is_none());
    }

    #[test]
    fn json_round_trip_keeps_sources() {
        let mut source = Source::new("a", "http://h/feed", "/d");
        source.include = vec!["^Foo".into()];
        let config = Config {
            sources: vec![source],
        };

        let encoded = ConfigFormat::Json.encode(&config).unwrap();
        let decoded = ConfigFormat::Json.decode(&encoded).unwrap();

        assert_eq!(decoded.sources.len(), 1);
        assert_eq!(decoded.sources[0].include, vec!["^Foo"]);
    }

    #[test]
    fn open_creates_missing_file() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path(), ConfigFormat::Toml).unwrap();

        assert!(dir.path().join("config.toml").exists());
        assert!(store.snapshot().sources.is_empty());
    }

    #[test]
    fn crud_persists_and_publishes_snapshots() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path(), ConfigFormat::Toml).unwrap();
        let rx = store.subscribe();

        store
            .add_source(Source::new("a", "http://h/a", "/d/a"))
            .unwrap();
        store
            .add_source(Source::new("b", "http://h/b", "/d/b"))
            .unwrap();
        assert_eq!(rx.borrow().sources.len(), 2);

        assert!(store.toggle_disabled("a").unwrap());

        // A snapshot taken before a mutation is unaffected by it.
        let before = store.snapshot();
        store.remove_source("b").unwrap();
        assert_eq!(before.sources.len(), 2);

        let reloaded = ConfigStore::load(&dir.path().join("config.toml"), ConfigFormat::Toml)
            .unwrap();
        assert_eq!(reloaded.sources.len(), 1);
        assert_eq!(reloaded.sources[0].name, "a");
        assert!(reloaded.sources[0].disabled);
    }

    #[test]
    fn rejects_invalid_and_duplicate_sources() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::open(dir.path(), ConfigFormat::Json).unwrap();

        let err = store.add_source(Source::new("a", "", "/d")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        store.add_source(Source::new("a", "http://h/a", "/d")).unwrap();
        let err = store
            .add_source(Source::new("a", "http://h/other", "/d"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = store.remove_source("missing").unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}

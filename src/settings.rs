use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};
use crate::origin::replace::ReplaceMode;
use crate::origin::scanner::ReadSpec;

const REFRESH_MAX: u64 = 4_294_966;
const CACHE_MAX: u32 = 31_536_000;

fn default_prefix() -> String {
    "/filesystem/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_http_clock_skew_max() -> u64 {
    300
}

fn default_notify_timeout() -> u64 {
    5
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

/// HTTP cache lifetime: an explicit second count, or the literal
/// `"refresh"` meaning half the refresh period (at least one second).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CacheLifetime {
    Seconds(u32),
    Keyword(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedirectSpec {
    pub pattern: String,
    pub target: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyTarget {
    pub pattern: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub directory: PathBuf,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Global in-memory ceiling in KiB.
    #[serde(default)]
    pub files_size: Option<u64>,
    /// Rescan period in seconds; absent disables refresh.
    #[serde(default)]
    pub refresh: Option<u64>,
    #[serde(default)]
    pub cache: Option<CacheLifetime>,
    #[serde(default)]
    pub replace: Option<ReplaceMode>,
    #[serde(default)]
    pub replace_index: bool,
    #[serde(default)]
    pub read: Vec<ReadSpec>,
    #[serde(default)]
    pub write_truncate: Vec<String>,
    #[serde(default)]
    pub write_append: Vec<String>,
    #[serde(default)]
    pub redirect: Vec<RedirectSpec>,
    #[serde(default)]
    pub notify_one: Vec<NotifyTarget>,
    #[serde(default)]
    pub notify_all: Vec<NotifyTarget>,
    #[serde(default)]
    pub notify_on_start: bool,
    #[serde(default = "default_notify_timeout")]
    pub notify_timeout: u64,
    #[serde(default)]
    pub notify_priority: i8,
    /// Tolerated client-future clock skew in seconds.
    #[serde(default = "default_http_clock_skew_max")]
    pub http_clock_skew_max: u64,
    #[serde(default = "default_true")]
    pub use_content_types: bool,
    #[serde(default)]
    pub use_content_disposition: bool,
    #[serde(default)]
    pub use_expires: bool,
    /// HTTP-method routing: per-method endpoint suffixes and the full
    /// conditional/range treatment. Disabled, each file is a single bare
    /// read-only endpoint.
    #[serde(default = "default_true")]
    pub use_http_get_suffix: bool,
    /// Distinguishes replacement-index sidecars between processes sharing
    /// a directory.
    #[serde(default)]
    pub process_index: u32,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        builder = builder.add_source(File::from(config_path.clone()).required(true));
        builder = builder.add_source(
            Environment::with_prefix("SHELF")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(&config_path);
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults for embedding: serve `directory` with method routing on
    /// and everything else off.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            prefix: default_prefix(),
            files_size: None,
            refresh: None,
            cache: None,
            replace: None,
            replace_index: false,
            read: Vec::new(),
            write_truncate: Vec::new(),
            write_append: Vec::new(),
            redirect: Vec::new(),
            notify_one: Vec::new(),
            notify_all: Vec::new(),
            notify_on_start: false,
            notify_timeout: default_notify_timeout(),
            notify_priority: 0,
            http_clock_skew_max: default_http_clock_skew_max(),
            use_content_types: true,
            use_content_disposition: false,
            use_expires: false,
            use_http_get_suffix: true,
            process_index: 0,
            log: default_log_format(),
        }
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh.map(Duration::from_secs)
    }

    /// The effective HTTP cache lifetime in seconds, `None` when caching
    /// headers are disabled.
    pub fn cache_seconds(&self) -> Option<u32> {
        match &self.cache {
            None => None,
            Some(CacheLifetime::Seconds(seconds)) => Some(*seconds),
            Some(CacheLifetime::Keyword(_)) => {
                self.refresh.map(|refresh| (refresh / 2).max(1) as u32)
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.directory.as_os_str().is_empty(),
            "directory must not be empty"
        );
        ensure!(
            self.prefix.ends_with('/'),
            "prefix '{}' must end with '/'",
            self.prefix
        );
        if let Some(refresh) = self.refresh {
            ensure!(
                (1..=REFRESH_MAX).contains(&refresh),
                "refresh must be within 1..={REFRESH_MAX} seconds (got {refresh})"
            );
        }
        match &self.cache {
            None => {}
            Some(CacheLifetime::Seconds(seconds)) => {
                ensure!(
                    (1..=CACHE_MAX).contains(seconds),
                    "cache must be within 1..={CACHE_MAX} seconds (got {seconds})"
                );
            }
            Some(CacheLifetime::Keyword(keyword)) => {
                ensure!(
                    keyword == "refresh",
                    "cache must be a second count or the literal \"refresh\" (got '{keyword}')"
                );
                ensure!(
                    self.refresh.is_some(),
                    "cache = \"refresh\" requires the refresh setting"
                );
            }
        }
        if self.replace.is_some() {
            ensure!(
                self.files_size.is_some(),
                "replace requires the files_size setting"
            );
            ensure!(self.refresh.is_some(), "replace requires the refresh setting");
        }
        if self.replace_index {
            ensure!(
                self.replace.is_some(),
                "replace_index requires a replacement algorithm"
            );
        }
        for spec in &self.read {
            ensure!(!spec.name.is_empty(), "read entries must name a file");
        }
        for pattern in self.write_truncate.iter().chain(&self.write_append) {
            ensure!(!pattern.is_empty(), "write patterns must not be empty");
        }
        Ok(())
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        if !self.directory.is_absolute() {
            self.directory = base_dir.join(&self.directory);
        }
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/shelf/shelf.toml"),
        PathBuf::from("shelf.toml"),
    ]
}

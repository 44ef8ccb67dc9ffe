//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "flusso";
const DEFAULT_BACKFILL_DEBOUNCE_MS: u64 = 100;
const DEFAULT_SUPPRESSION_TTL_MS: u64 = 2000;
const DEFAULT_LOCK_STRIPES: u64 = 64;
const DEFAULT_SIMULATE_SUBSCRIBERS: usize = 4;
const DEFAULT_SIMULATE_WRITES: usize = 32;
const DEFAULT_SIMULATE_LIMIT: u64 = 10;

/// Command-line arguments for the Flusso binary.
#[derive(Debug, Parser)]
#[command(name = "flusso", version, about = "Flusso live query cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "FLUSSO_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Print the resolved settings and exit.
    #[command(name = "check-config")]
    CheckConfig(CheckConfigArgs),
    /// Drive subscribers and writes against an in-process store.
    Simulate(SimulateArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct CheckConfigArgs {
    #[command(flatten)]
    pub overrides: Overrides,
}

#[derive(Debug, Args, Clone)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub overrides: Overrides,

    /// Number of concurrent subscribers.
    #[arg(long, default_value_t = DEFAULT_SIMULATE_SUBSCRIBERS)]
    pub subscribers: usize,

    /// Number of writes issued against the store.
    #[arg(long, default_value_t = DEFAULT_SIMULATE_WRITES)]
    pub writes: usize,

    /// Page size of every subscription.
    #[arg(long, default_value_t = DEFAULT_SIMULATE_LIMIT)]
    pub limit: u64,

    /// JSON file holding an array of documents to seed the store with.
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub seed: Option<PathBuf>,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            overrides: Overrides::default(),
            subscribers: DEFAULT_SIMULATE_SUBSCRIBERS,
            writes: DEFAULT_SIMULATE_WRITES,
            limit: DEFAULT_SIMULATE_LIMIT,
            seed: None,
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Toggle the document cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Log cache purges at warn level.
    #[arg(
        long = "cache-debug",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_debug: Option<bool>,

    /// Override the delete batching window.
    #[arg(long = "cache-backfill-debounce-ms", value_name = "MILLIS")]
    pub backfill_debounce_ms: Option<u64>,

    /// Override the writer suppression lifetime.
    #[arg(long = "cache-suppression-ttl-ms", value_name = "MILLIS")]
    pub suppression_ttl_ms: Option<u64>,

    /// Override the number of entry lock stripes.
    #[arg(long = "cache-lock-stripes", value_name = "COUNT")]
    pub lock_stripes: Option<u64>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub debug: bool,
    pub backfill_debounce_ms: u64,
    pub suppression_ttl_ms: u64,
    pub release_suppression_after_dispatch: bool,
    pub evict_on_last_detach: bool,
    pub lock_stripes: usize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("FLUSSO").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::CheckConfig(args)) => raw.apply_overrides(&args.overrides),
        Some(Command::Simulate(args)) => raw.apply_overrides(&args.overrides),
        None => raw.apply_overrides(&Overrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(debug) = overrides.cache_debug {
            self.cache.debug = Some(debug);
        }
        if let Some(millis) = overrides.backfill_debounce_ms {
            self.cache.backfill_debounce_ms = Some(millis);
        }
        if let Some(millis) = overrides.suppression_ttl_ms {
            self.cache.suppression_ttl_ms = Some(millis);
        }
        if let Some(stripes) = overrides.lock_stripes {
            self.cache.lock_stripes = Some(stripes);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self { logging, cache })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let backfill_debounce_ms = non_zero_millis(
        cache
            .backfill_debounce_ms
            .unwrap_or(DEFAULT_BACKFILL_DEBOUNCE_MS),
        "cache.backfill_debounce_ms",
    )?;
    let suppression_ttl_ms = non_zero_millis(
        cache.suppression_ttl_ms.unwrap_or(DEFAULT_SUPPRESSION_TTL_MS),
        "cache.suppression_ttl_ms",
    )?;

    let stripes = cache.lock_stripes.unwrap_or(DEFAULT_LOCK_STRIPES);
    if stripes == 0 {
        return Err(LoadError::invalid(
            "cache.lock_stripes",
            "must be greater than zero",
        ));
    }
    let lock_stripes = usize::try_from(stripes).map_err(|_| {
        LoadError::invalid(
            "cache.lock_stripes",
            "value exceeds supported range for usize",
        )
    })?;

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        debug: cache.debug.unwrap_or(false),
        backfill_debounce_ms,
        suppression_ttl_ms,
        release_suppression_after_dispatch: cache
            .release_suppression_after_dispatch
            .unwrap_or(true),
        evict_on_last_detach: cache.evict_on_last_detach.unwrap_or(true),
        lock_stripes,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    debug: Option<bool>,
    backfill_debounce_ms: Option<u64>,
    suppression_ttl_ms: Option<u64>,
    release_suppression_after_dispatch: Option<bool>,
    evict_on_last_detach: Option<bool>,
    lock_stripes: Option<u64>,
}

fn non_zero_millis(value: u64, key: &'static str) -> Result<u64, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

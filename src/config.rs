use crate::consumers::DEFAULT_AGGREGATE_WINDOW_SECS;
use crate::frame::{ExtractorConfig, DEFAULT_MAX_FRAME_BYTES};
use crate::ingest::{
    PersistPolicy, PipelineSettings, DEFAULT_SILENCE_TIMEOUT_SECS, DEFAULT_THROTTLE_WINDOW_SECS,
};
use crate::transport::{
    ReaderSettings, TransportConfig, DEFAULT_BAUD_RATE, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_READ_TIMEOUT_MS,
};
use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DATABASE_PATH: &str = "air_quality_data.db";
const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;
const DEFAULT_STATS_LOG_INTERVAL_SECS: u64 = 30;
const MAX_WINDOW_SECS: i64 = 365 * 24 * 3600;

fn setup_config_path(lookup: &dyn Fn(&str) -> Option<String>) -> Option<PathBuf> {
    lookup("AIRQ_SETUP_CONFIG_PATH").map(PathBuf::from)
}

/// Optional JSON file whose values apply only where the matching env var is unset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetupConfigOverrides {
    #[serde(default)]
    serial_device: Option<String>,
    #[serde(default)]
    baud_rate: Option<u32>,
    #[serde(default)]
    database_path: Option<String>,
    #[serde(default)]
    throttle_window_secs: Option<u64>,
    #[serde(default)]
    silence_timeout_secs: Option<u64>,
    #[serde(default)]
    persist_policy: Option<String>,
    #[serde(default)]
    aggregate_window_secs: Option<u64>,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn apply_setup_overrides(
    config: &mut Config,
    overrides: &SetupConfigOverrides,
    lookup: &dyn Fn(&str) -> Option<String>,
) {
    let env_allows = |key: &str| lookup(key).is_none();

    if env_allows("AIRQ_SERIAL_DEVICE") {
        if let Some(device) = overrides
            .serial_device
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.serial_device = Some(device.to_string());
        }
    }
    if env_allows("AIRQ_BAUD_RATE") {
        if let Some(value) = overrides.baud_rate.filter(|v| *v != 0) {
            config.baud_rate = value;
        }
    }
    if env_allows("AIRQ_DATABASE_PATH") {
        if let Some(path) = overrides
            .database_path
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.database_path = PathBuf::from(path);
        }
    }
    if env_allows("AIRQ_THROTTLE_WINDOW_SECS") {
        if let Some(value) = overrides.throttle_window_secs.filter(|v| *v != 0) {
            config.throttle_window_secs = value;
        }
    }
    if env_allows("AIRQ_SILENCE_TIMEOUT_SECS") {
        if let Some(value) = overrides.silence_timeout_secs.filter(|v| *v != 0) {
            config.silence_timeout_secs = value;
        }
    }
    if env_allows("AIRQ_PERSIST_POLICY") {
        if let Some(raw) = overrides.persist_policy.as_deref() {
            match raw.parse() {
                Ok(policy) => config.persist_policy = policy,
                Err(err) => tracing::warn!(error = %err, "ignoring persist_policy from setup config"),
            }
        }
    }
    if env_allows("AIRQ_AGGREGATE_WINDOW_SECS") {
        if let Some(value) = overrides.aggregate_window_secs.filter(|v| *v != 0) {
            config.aggregate_window_secs = value;
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub serial_device: Option<String>,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub max_frame_bytes: usize,
    pub line_resync: bool,
    pub database_path: PathBuf,
    pub throttle_window_secs: u64,
    pub silence_timeout_secs: u64,
    pub tick_interval_ms: u64,
    pub persist_policy: PersistPolicy,
    pub aggregate_window_secs: u64,
    pub stats_log_interval_secs: u64,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let lookup = |key: &str| {
            env::var(key)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let overrides = setup_config_path(&lookup)
            .as_deref()
            .and_then(load_setup_config_overrides);
        Self::from_lookup(&lookup, overrides.as_ref())
    }

    /// Builds the config from `lookup` (trimmed, non-empty values only) plus optional setup
    /// overrides.
    pub fn from_lookup(
        lookup: &dyn Fn(&str) -> Option<String>,
        overrides: Option<&SetupConfigOverrides>,
    ) -> Result<Self> {
        let baud_rate = match lookup("AIRQ_BAUD_RATE") {
            Some(raw) => raw
                .parse::<u32>()
                .with_context(|| format!("AIRQ_BAUD_RATE must be a positive integer, got {raw:?}"))?,
            None => DEFAULT_BAUD_RATE,
        };
        let persist_policy = match lookup("AIRQ_PERSIST_POLICY") {
            Some(raw) => raw
                .parse::<PersistPolicy>()
                .map_err(anyhow::Error::msg)
                .context("invalid AIRQ_PERSIST_POLICY")?,
            None => PersistPolicy::default(),
        };
        let line_resync = lookup("AIRQ_LINE_RESYNC")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);
        let u64_or = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(default)
        };
        // zero counts as unset for windows
        let nonzero_u64_or = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v != 0)
                .unwrap_or(default)
        };

        let mut config = Self {
            serial_device: lookup("AIRQ_SERIAL_DEVICE"),
            baud_rate,
            read_timeout_ms: u64_or("AIRQ_READ_TIMEOUT_MS", DEFAULT_READ_TIMEOUT_MS).max(1),
            poll_interval_ms: u64_or("AIRQ_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS),
            max_frame_bytes: lookup("AIRQ_MAX_FRAME_BYTES")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_MAX_FRAME_BYTES),
            line_resync,
            database_path: lookup("AIRQ_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH)),
            throttle_window_secs: nonzero_u64_or(
                "AIRQ_THROTTLE_WINDOW_SECS",
                DEFAULT_THROTTLE_WINDOW_SECS as u64,
            ),
            silence_timeout_secs: nonzero_u64_or(
                "AIRQ_SILENCE_TIMEOUT_SECS",
                DEFAULT_SILENCE_TIMEOUT_SECS as u64,
            ),
            tick_interval_ms: u64_or("AIRQ_TICK_INTERVAL_MS", DEFAULT_TICK_INTERVAL_MS).max(1),
            persist_policy,
            aggregate_window_secs: nonzero_u64_or(
                "AIRQ_AGGREGATE_WINDOW_SECS",
                DEFAULT_AGGREGATE_WINDOW_SECS as u64,
            ),
            stats_log_interval_secs: u64_or(
                "AIRQ_STATS_LOG_INTERVAL_SECS",
                DEFAULT_STATS_LOG_INTERVAL_SECS,
            ),
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };

        if let Some(overrides) = overrides {
            apply_setup_overrides(&mut config, overrides, lookup);
        }

        Ok(config)
    }

    pub fn transport_config(&self) -> Result<TransportConfig> {
        let device = self
            .serial_device
            .clone()
            .context("AIRQ_SERIAL_DEVICE is required (or --device, or serial_device in the setup config)")?;
        Ok(TransportConfig {
            device,
            baud_rate: self.baud_rate,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        })
    }

    pub fn reader_settings(&self) -> ReaderSettings {
        ReaderSettings {
            extractor: ExtractorConfig {
                max_frame_bytes: self.max_frame_bytes,
                line_resync: self.line_resync,
            },
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            throttle_window: secs(self.throttle_window_secs),
            silence_timeout: secs(self.silence_timeout_secs),
            persist_policy: self.persist_policy,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn stats_log_interval(&self) -> Option<Duration> {
        (self.stats_log_interval_secs > 0).then(|| Duration::from_secs(self.stats_log_interval_secs))
    }
}

fn secs(value: u64) -> ChronoDuration {
    ChronoDuration::seconds(i64::try_from(value).unwrap_or(i64::MAX).min(MAX_WINDOW_SECS))
}

use crate::config::Config;
use crate::store::{DEFAULT_EXPORT_LIMIT, DEFAULT_RECENT_LIMIT};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "airq-ingest",
    version,
    about = "Serial air-quality telemetry ingest"
)]
pub struct Args {
    /// Serial device path; overrides AIRQ_SERIAL_DEVICE.
    #[arg(long)]
    pub device: Option<String>,
    #[arg(long)]
    pub baud: Option<u32>,
    /// SQLite database file; overrides AIRQ_DATABASE_PATH.
    #[arg(long)]
    pub database: Option<PathBuf>,
    /// Print store statistics as JSON and exit.
    #[arg(long, default_value_t = false)]
    pub print_stats: bool,
    /// Print the N most recent stored readings as JSON and exit (default 50).
    #[arg(long, value_name = "N")]
    pub recent: Option<Option<usize>>,
    /// Dump up to N stored rows (newest first) as JSON and exit (default 1000).
    #[arg(long, value_name = "N")]
    pub export: Option<Option<usize>>,
}

impl Args {
    pub fn apply(&self, config: &mut Config) {
        if let Some(device) = self.device.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            config.serial_device = Some(device.to_string());
        }
        if let Some(baud) = self.baud.filter(|v| *v != 0) {
            config.baud_rate = baud;
        }
        if let Some(path) = &self.database {
            config.database_path = path.clone();
        }
    }

    pub fn recent_limit(&self) -> Option<usize> {
        self.recent.map(|limit| limit.unwrap_or(DEFAULT_RECENT_LIMIT))
    }

    pub fn export_limit(&self) -> Option<usize> {
        self.export.map(|limit| limit.unwrap_or(DEFAULT_EXPORT_LIMIT))
    }

    /// True when the invocation only queries the store.
    pub fn is_query(&self) -> bool {
        self.print_stats || self.recent.is_some() || self.export.is_some()
    }
}

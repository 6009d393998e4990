//! CLI configuration via clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

/// How a trigger window is identified. See [`crate::aggregator::WindowKey`].
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowPolicy {
    /// Fire once per window value, the lowest `revision / period` across sources.
    #[default]
    Simultaneous,
    /// Fire only after every source has moved past the window it was in at the
    /// last dispatch.
    AllAdvanced,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "race-strategy-aggregator")]
#[command(about = "Synchronizes overtake, tire cliff and undercut telemetry streams and requests race strategy")]
pub struct Config {
    /// Overtake likelihood stream
    #[arg(long, default_value = "ws://localhost:8000/ws/overtakes")]
    pub overtake_url: String,

    /// Tire cliff risk stream
    #[arg(long, default_value = "ws://localhost:8001/ws/cliff")]
    pub tire_cliff_url: String,

    /// Undercut risk stream
    #[arg(long, default_value = "ws://localhost:8002/ws/undercuts")]
    pub undercut_url: String,

    /// Strategy endpoint receiving the combined payload
    #[arg(long, default_value = "http://localhost:8010/api/strategy")]
    pub strategy_url: String,

    /// Trigger period: every source revision must be a multiple of this
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub period: u64,

    /// How repeated alignments are deduplicated
    #[arg(long, value_enum, default_value_t = WindowPolicy::Simultaneous)]
    pub window_policy: WindowPolicy,

    /// SQLite file holding the latest snapshot per source
    #[arg(long, default_value = "latest_snapshots.sqlite3")]
    pub cache_path: PathBuf,

    /// HTTP port for /health, /metrics and /api/state
    #[arg(short, long, default_value = "8080")]
    pub port: u16,

    /// Per-request timeout for the strategy call, in seconds
    #[arg(long, default_value = "30")]
    pub strategy_timeout_secs: u64,

    /// Upper bound, in seconds, on waiting for strategy tasks at exit. On a
    /// signal in-flight calls are abandoned; when every stream ends on its own
    /// they may finish within this window.
    #[arg(long, default_value = "5")]
    pub shutdown_grace_secs: u64,

    /// Do not re-establish a stream after it drops
    #[arg(long)]
    pub no_reconnect: bool,
}

impl Config {
    #[must_use]
    pub fn strategy_timeout(&self) -> Duration {
        Duration::from_secs(self.strategy_timeout_secs)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

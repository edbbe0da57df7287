pub mod capture;
pub mod delivery;
pub mod error;
pub mod manager;
pub mod pipeline;
pub mod telemetry;
pub mod utils;

use std::path::Path;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use capture::{
    BufferHandle, CaptureRequest, DispatchedRequest, Request, RequestState, SequenceId, Settings,
    StreamBuffer, StreamClass, StreamConfig, StreamId,
};
pub use delivery::{CallbackSinks, FinalResult};
pub use error::{Error, Result};
pub use manager::{FlushOutcome, RequestManager};
pub use pipeline::{
    BufferReady, BufferStatus, Metadata, NotifyError, NotifyMessage, NotifyStatus, ResultEvent,
    ResultKey, ResultKind,
};
pub use telemetry::TelemetrySnapshot;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Reconciler configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub flush: FlushConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How long a worker waits on its queue before running a pass anyway.
    pub poll_interval_ms: u64,
    /// Consecutive blocked passes on one request before a stall is reported.
    /// Zero disables stall reports.
    pub stall_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Final results averaged for the completion rate.
    pub rate_window: usize,
    pub export_metrics: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            stall_threshold: 10,
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            // 200 polls of 50 ms
            timeout_ms: 10_000,
            poll_interval_ms: 50,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            rate_window: 30,
            export_metrics: true,
        }
    }
}

impl Config {
    /// Defaults, overlaid with the TOML file at `path` (if given) and then
    /// with `RECONCILER__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("RECONCILER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_overlays_file_on_defaults() {
        let path = std::env::temp_dir().join(format!("reconciler-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[pipeline]\nstall_threshold = 4\n\n[flush]\ntimeout_ms = 250").unwrap();
        drop(file);

        let config = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.pipeline.stall_threshold, 4);
        assert_eq!(config.pipeline.poll_interval_ms, 100);
        assert_eq!(config.flush.timeout_ms, 250);
        assert_eq!(config.flush.poll_interval_ms, 50);
        assert_eq!(config.telemetry, TelemetryConfig::default());
    }

    #[test]
    fn missing_file_is_an_error() {
        let path = std::env::temp_dir().join("reconciler-does-not-exist.toml");
        assert!(matches!(Config::load(Some(&path)), Err(Error::Config(_))));
    }
}

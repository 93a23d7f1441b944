//! Process-wide `tracing` setup for the `wave` binary.
//!
//! Negotiation code logs under the `negotiation` and `signaling` targets, so
//! the verbose levels raise those explicitly and leave the rest of the
//! process at `info`. The webrtc stack is very chatty at trace level and is
//! capped unless `WAVE_TRACE_DEPS` is set. `WAVE_LOG_FILTER` replaces the
//! whole filter.

use clap::ValueEnum;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const FILTER_VAR: &str = "WAVE_LOG_FILTER";
const DEPS_VAR: &str = "WAVE_TRACE_DEPS";

const WAVE_TARGETS: &[&str] = &["negotiation", "signaling", "wave_core", "wave"];
const WEBRTC_TARGETS: &[&str] = &["webrtc", "webrtc_ice", "webrtc_dtls", "tungstenite"];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }
    let directives = match std::env::var(FILTER_VAR) {
        Ok(custom) => custom,
        Err(_) => default_directives(config.level, dependency_traces_allowed()),
    };

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&directives))
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    tracing::debug!(filter = %directives, "logging initialised");
    Ok(())
}

fn dependency_traces_allowed() -> bool {
    std::env::var(DEPS_VAR).is_ok_and(|value| !value.is_empty() && value != "0")
}

pub(crate) fn default_directives(level: LogLevel, allow_deps: bool) -> String {
    if level < LogLevel::Debug {
        return level.as_str().to_owned();
    }
    let mut directives = vec!["info".to_owned()];
    directives.extend(
        WAVE_TARGETS
            .iter()
            .map(|target| format!("{target}={}", level.as_str())),
    );
    if level == LogLevel::Trace && !allow_deps {
        directives.extend(WEBRTC_TARGETS.iter().map(|target| format!("{target}=info")));
    }
    directives.join(",")
}

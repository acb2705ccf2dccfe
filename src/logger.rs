use clap::ValueEnum;
use once_cell::sync::OnceCell;
use tracing::level_filters::LevelFilter;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

/// Overrides the whole filter when set, e.g. `PARLEY_LOG=parley_lib=trace`.
pub const LOG_FILTER_ENV: &str = "PARLEY_LOG";

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        if crate::config::LOGGING_ENABLED && crate::config::dev::ENABLE_LOGGING {
            LogLevel::Debug
        } else {
            LogLevel::Warn
        }
    }
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

    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub ansi: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static INIT: OnceCell<()> = OnceCell::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    INIT.get_or_try_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(build_env_filter(config.level))
            .with_target(config.level >= LogLevel::Debug)
            .with_ansi(config.ansi)
            .try_init()
            .map_err(|err| InitError::Configure(err.to_string()))
    })?;
    Ok(())
}

fn build_env_filter(level: LogLevel) -> EnvFilter {
    if let Ok(filter) = std::env::var(LOG_FILTER_ENV) {
        return EnvFilter::new(filter);
    }
    EnvFilter::new(default_filter_for(level))
}

/// The webrtc stack is chatty below `info`; keep it one notch quieter than
/// our own crate unless the caller asks for `trace`.
fn default_filter_for(level: LogLevel) -> String {
    let ours = level.as_str();
    match level {
        LogLevel::Trace => format!("info,parley_lib={ours},parley_loopback={ours},webrtc=debug"),
        LogLevel::Debug | LogLevel::Info => {
            format!("warn,parley_lib={ours},parley_loopback={ours},webrtc=warn")
        }
        LogLevel::Warn | LogLevel::Error => ours.to_string(),
    }
}

/// Trickle-ICE trace of a gathered candidate.
pub async fn dump_candidate(label: &str, cand: &RTCIceCandidate) {
    if let Ok(init) = cand.to_json() {
        debug!(
            label,
            candidate = %init.candidate,
            sdp_mid = ?init.sdp_mid,
            sdp_mline_index = ?init.sdp_mline_index,
            username_fragment = ?init.username_fragment,
            "trickle candidate"
        );
    }
}

/// Snapshot of the nominated candidate pair from getStats.
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, report) in stats.reports {
        if let StatsReportType::CandidatePair(pair) = report {
            if pair.nominated {
                info!(
                    moment,
                    local = %pair.local_candidate_id,
                    remote = %pair.remote_candidate_id,
                    bytes_sent = pair.bytes_sent,
                    bytes_received = pair.bytes_received,
                    state = ?pair.state,
                    "selected candidate pair"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_levels_do_not_widen_dependency_logging() {
        assert_eq!(default_filter_for(LogLevel::Warn), "warn");
        let debug = default_filter_for(LogLevel::Debug);
        assert!(debug.contains("parley_lib=debug"));
        assert!(debug.contains("webrtc=warn"));
    }

    #[test]
    fn init_is_idempotent() {
        let config = LogConfig::default();
        assert!(init(&config).is_ok());
        assert!(init(&config).is_ok());
    }
}

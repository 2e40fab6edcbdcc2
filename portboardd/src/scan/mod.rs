pub mod nmap;
pub mod parser;

use std::fmt;
use std::time::Duration;
use async_trait::async_trait;
use shared::types::Observation;

/// How deep a scan goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Presence sweep over a whole range
    Fast,
    /// Every-port scan of a single host
    Full,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::Fast => f.write_str("fast"),
            ScanMode::Full => f.write_str("full"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("failed to start scanner {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("scanner exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },
    #[error("scanner did not finish within {0:?}")]
    Timeout(Duration),
}

/// Source of host/port observations.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, target: &str, mode: ScanMode) -> Result<Vec<Observation>, ScanError>;
}

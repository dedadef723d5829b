use bridge::{DownloadId, DownloadStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("No tokio runtime available to run the progress loop")]
    NoRuntime,
}

/// Why a lifecycle operation changed nothing
///
/// Never returned to callers; lifecycle operations are best-effort and only
/// log these at debug level.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Rejection {
    #[error("download {0} not found")]
    NotFound(DownloadId),
    #[error("cannot {action} download {id} while {from}")]
    InvalidTransition {
        id: DownloadId,
        from: DownloadStatus,
        action: &'static str,
    },
    #[error("download {0} is not driven by external reports")]
    NotExternal(DownloadId),
    #[error("invalid progress {value} for download {id}")]
    InvalidProgress { id: DownloadId, value: f64 },
}

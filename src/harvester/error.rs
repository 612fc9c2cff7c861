//! Error taxonomy for the harvest pipeline
//!
//! Per-record failures are caught at the batch level and recorded to the
//! error_logs audit table; per-batch fetch failures feed the consecutive-error
//! backoff. Only storage initialization failures abort the process.

use thiserror::Error;

use crate::harvester::api_client::FetchError;
use crate::harvester::download_engine::DownloadError;

/// Pipeline-level error for a single record or fetch attempt
#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API error: status {status}")]
    Api { status: u16 },

    #[error("Storage write error: {0}")]
    StorageWrite(#[from] rusqlite::Error),

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Integrity error for image {image_id}: metadata commit failed (file rolled back: {rolled_back})")]
    Integrity { image_id: String, rolled_back: bool },
}

/// Result type for pipeline operations
pub type HarvestResult<T> = Result<T, HarvestError>;

impl HarvestError {
    /// Stable label used for the error_type column of audit rows.
    pub fn kind(&self) -> &'static str {
        match self {
            HarvestError::Transport(_) => "transport_error",
            HarvestError::Api { .. } => "api_error",
            HarvestError::StorageWrite(_) => "storage_write_error",
            HarvestError::FileSystem(_) => "file_system_error",
            HarvestError::Integrity { .. } => "integrity_error",
        }
    }
}

impl From<FetchError> for HarvestError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Transport(e) => HarvestError::Transport(e),
            FetchError::Status { status } => HarvestError::Api { status },
        }
    }
}

impl From<DownloadError> for HarvestError {
    fn from(err: DownloadError) -> Self {
        match err {
            DownloadError::Request(e) => HarvestError::Transport(e),
            DownloadError::Status { status } => HarvestError::Api { status },
            DownloadError::Io(e) => HarvestError::FileSystem(e),
        }
    }
}

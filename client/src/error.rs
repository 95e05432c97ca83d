use thiserror::Error;

use crate::chunks::ChunkKey;

/// Failure of a single range fetch. Never propagated past the scheduler.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("server responded with status {0}")]
    Status(u16),
    #[error("response body could not be decoded: {0}")]
    Decode(String),
    #[error("fetch timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("worker task ended without a result: {0}")]
    Worker(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Status(status.as_u16())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RasterError {
    #[error("could not allocate {texels} texels for chunk {key}")]
    Allocation { key: ChunkKey, texels: usize },
}

#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    #[error("cluster traversal could not reserve memory for {cells} cells")]
    Exhausted { cells: usize },
}

//! Error types for the engine

use thiserror::Error;

/// Main error type for the engine
#[derive(Debug, Error)]
pub enum Error {
    #[error("allocation failed")]
    AllocFailed,

    #[error("failed to allocate a new arena page")]
    AllocPageFailed,

    #[error("invalid page size: {0}")]
    InvalidPageSize(usize),

    #[error("task queue full")]
    TaskQueueFull,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

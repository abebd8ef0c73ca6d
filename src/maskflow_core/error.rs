use thiserror::Error;

use crate::maskflow_core::frames::FrameSourceError;
use crate::maskflow_core::mask::MaskError;
use crate::maskflow_core::segmenter::SegmenterError;

/// The orchestrator error taxonomy. Every operation fails with exactly one
/// of these; nothing is retried internally.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("object not found: {0}")]
    ObjectNotFound(u32),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error(
        "maximum concurrent sessions ({limit}) reached; close an existing session or wait for one to expire"
    )]
    CapacityExceeded { limit: usize },
    #[error("could not open video: {0}")]
    VideoUnreadable(String),
    #[error("video too large: {0}")]
    VideoTooLarge(String),
    #[error("session has no tracked objects to propagate")]
    NothingToPropagate,
    #[error("segmenter failed: {0}")]
    Segmenter(#[from] SegmenterError),
    #[error("cancelled")]
    Cancelled,
    #[error("session closed while propagation was running")]
    SessionGone,
    #[error("service is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<FrameSourceError> for EngineError {
    fn from(err: FrameSourceError) -> Self {
        match err {
            FrameSourceError::Unreadable(msg) => EngineError::VideoUnreadable(msg),
            FrameSourceError::Decode(msg) => EngineError::VideoUnreadable(msg),
        }
    }
}

impl From<MaskError> for EngineError {
    fn from(err: MaskError) -> Self {
        EngineError::InvalidArgument(err.to_string())
    }
}

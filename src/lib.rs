//! maskflow: a session-based video segmentation orchestration service.
//!
//! The core turns an interactive image-segmentation capability (the
//! [`Segmenter`] trait) into a stateful multi-user annotation service:
//! sessions bind a video to prepared inference state, tracked objects
//! collect prompts and per-frame masks, and long propagation passes run as
//! background jobs with progress and cooperative cancellation.

mod maskflow_core;
pub mod server;
mod sync_ext;

pub use crate::maskflow_core::{
    AddObjectBoxRequest, AddObjectRequest, AnnotationEngine, CloseSessionResponse, Direction,
    EngineError, FfmpegFrameSource, FrameMasksResponse, FrameSink, FrameSource, FrameSourceError,
    FrameStore, InferenceState, JOB_TYPE_PROPAGATE, Job, JobContext, JobManager, JobStatus,
    JobTask, Mask, MaskError, MaskUpdateResponse, OBJECT_COLORS, ObjectResponse, ObjectSummary,
    OpenSessionRequest, OpenSessionResponse, OrchestratorSettings, OverrideMaskRequest,
    PromptInput, PromptRecord, PropagateRequest, PropagateResponse, RefineRequest, Segmenter,
    SegmenterError, Session, SessionInfoResponse, SessionManager, SessionState,
    SimulatorSegmenter, StreamControl, SyntheticFrameSource, TrackedObject, VideoMetadata,
};

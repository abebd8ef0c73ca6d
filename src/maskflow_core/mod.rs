mod domain;
mod engine;
mod error;
mod frames;
mod jobs;
mod mask;
mod segmenter;
mod session;
mod settings;

pub use domain::{
    AddObjectBoxRequest, AddObjectRequest, CloseSessionResponse, Direction, FrameMasksResponse,
    MaskUpdateResponse, OBJECT_COLORS, ObjectResponse, ObjectSummary, OpenSessionRequest,
    OpenSessionResponse, OverrideMaskRequest, PromptRecord, PropagateRequest, PropagateResponse,
    RefineRequest, SessionInfoResponse, TrackedObject,
};
pub use engine::AnnotationEngine;
pub use error::EngineError;
pub use frames::{
    FfmpegFrameSource, FrameSource, FrameSourceError, FrameStore, SyntheticFrameSource,
    VideoMetadata,
};
pub use jobs::{JOB_TYPE_PROPAGATE, Job, JobContext, JobManager, JobStatus, JobTask};
pub use mask::{Mask, MaskError};
pub use segmenter::{
    FrameSink, InferenceState, PromptInput, Segmenter, SegmenterError, SimulatorSegmenter,
    StreamControl,
};
pub use session::{Session, SessionManager, SessionState};
pub use settings::OrchestratorSettings;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::maskflow_core::mask::Mask;

/// Fixed palette assigned to tracked objects round-robin at creation time.
/// RGB triples; the order is part of the observable API (clients key their
/// overlays off it).
pub const OBJECT_COLORS: [[u8; 3]; 8] = [
    [255, 0, 0],
    [0, 255, 0],
    [0, 0, 255],
    [255, 255, 0],
    [255, 0, 255],
    [0, 255, 255],
    [255, 128, 0],
    [128, 0, 255],
];

/// Propagation direction requested by the client. The engine records it on
/// the job and forwards it to the segmenter; seed frames are never
/// overwritten regardless of direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
    #[default]
    Both,
}

/// One durable entry in a tracked object's prompt history. The list is
/// append-only and preserves order of application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromptRecord {
    InitialPoints {
        frame_idx: usize,
        points: Vec<[f32; 2]>,
        labels: Vec<u8>,
    },
    InitialBox {
        frame_idx: usize,
        #[serde(rename = "box")]
        bbox: [f32; 4],
    },
    RefinementPoints {
        frame_idx: usize,
        points: Vec<[f32; 2]>,
        labels: Vec<u8>,
    },
    OverrideMask {
        frame_idx: usize,
    },
}

impl PromptRecord {
    pub fn frame_idx(&self) -> usize {
        match self {
            PromptRecord::InitialPoints { frame_idx, .. }
            | PromptRecord::InitialBox { frame_idx, .. }
            | PromptRecord::RefinementPoints { frame_idx, .. }
            | PromptRecord::OverrideMask { frame_idx } => *frame_idx,
        }
    }
}

/// One user-identified target within a session: identity, visual metadata,
/// the full prompt history and the per-frame masks known so far.
#[derive(Debug, Clone)]
pub struct TrackedObject {
    pub object_id: u32,
    pub name: String,
    pub category: String,
    pub color: [u8; 3],
    pub prompts: Vec<PromptRecord>,
    /// frame_idx -> mask, always in the session's working dimensions.
    pub masks: BTreeMap<usize, Mask>,
}

impl TrackedObject {
    pub fn new(object_id: u32, name: String, category: String, color: [u8; 3]) -> Self {
        Self {
            object_id,
            name,
            category,
            color,
            prompts: Vec::new(),
            masks: BTreeMap::new(),
        }
    }

    pub fn frames_with_masks(&self) -> Vec<usize> {
        self.masks.keys().copied().collect()
    }
}

// Request payloads accepted by the HTTP surface.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSessionRequest {
    pub video_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddObjectRequest {
    pub frame_idx: usize,
    pub object_id: u32,
    pub points: Vec<[f32; 2]>,
    pub labels: Vec<u8>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddObjectBoxRequest {
    pub frame_idx: usize,
    pub object_id: u32,
    #[serde(rename = "box")]
    pub bbox: [f32; 4],
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefineRequest {
    pub frame_idx: usize,
    pub points: Vec<[f32; 2]>,
    pub labels: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideMaskRequest {
    pub frame_idx: usize,
    /// Base64-encoded PNG, any color type; collapsed to a single channel and
    /// thresholded at the boundary.
    pub mask: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropagateRequest {
    #[serde(default)]
    pub start_frame: Option<usize>,
    #[serde(default)]
    pub end_frame: Option<usize>,
    #[serde(default)]
    pub direction: Option<Direction>,
}

// Response payloads produced by the HTTP surface.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSessionResponse {
    pub session_id: String,
    pub total_frames: usize,
    pub frame_width: u32,
    pub frame_height: u32,
    pub fps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub id: u32,
    pub name: String,
    pub category: String,
    pub color: [u8; 3],
    pub frames_with_masks: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfoResponse {
    pub session_id: String,
    pub total_frames: usize,
    pub frame_width: u32,
    pub frame_height: u32,
    pub fps: f64,
    pub objects: Vec<ObjectSummary>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_accessed: chrono::DateTime<chrono::Utc>,
    pub idle_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectResponse {
    pub object_id: u32,
    pub name: String,
    pub category: String,
    pub color: [u8; 3],
    pub frame_idx: usize,
    /// Base64-encoded single-channel PNG in working dimensions.
    pub mask: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskUpdateResponse {
    pub object_id: u32,
    pub frame_idx: usize,
    pub mask: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMasksResponse {
    pub frame_idx: usize,
    pub masks: BTreeMap<u32, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagateResponse {
    pub job_id: String,
}

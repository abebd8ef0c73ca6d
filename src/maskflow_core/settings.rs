use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Idle window before a session becomes eligible for eviction. Kept large
/// enough that a slow client surveying a long propagation does not lose its
/// session.
pub const DEFAULT_SESSION_TIMEOUT_SECONDS: u64 = 900;
pub const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 2;
pub const DEFAULT_MAX_VIDEO_FRAMES: usize = 300;
pub const DEFAULT_MAX_FRAME_DIMENSION: u32 = 1920;
pub const DEFAULT_FRAME_JPEG_QUALITY: u8 = 85;
pub const DEFAULT_MAX_WORKERS: usize = 2;
pub const DEFAULT_JOB_RETENTION_SECONDS: u64 = 3600;
/// Propagation cadences: refresh the session access stamp every
/// `touch_every` streamed frames, log + publish progress every
/// `progress_log_every`.
pub const DEFAULT_PROGRESS_LOG_EVERY: usize = 50;
pub const DEFAULT_TOUCH_EVERY: usize = 10;
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60;

fn default_session_timeout_seconds() -> u64 {
    DEFAULT_SESSION_TIMEOUT_SECONDS
}

fn default_max_concurrent_sessions() -> usize {
    DEFAULT_MAX_CONCURRENT_SESSIONS
}

fn default_max_video_frames() -> usize {
    DEFAULT_MAX_VIDEO_FRAMES
}

fn default_max_frame_dimension() -> u32 {
    DEFAULT_MAX_FRAME_DIMENSION
}

fn default_frame_jpeg_quality() -> u8 {
    DEFAULT_FRAME_JPEG_QUALITY
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

fn default_job_retention_seconds() -> u64 {
    DEFAULT_JOB_RETENTION_SECONDS
}

fn default_progress_log_every() -> usize {
    DEFAULT_PROGRESS_LOG_EVERY
}

fn default_touch_every() -> usize {
    DEFAULT_TOUCH_EVERY
}

fn default_sweep_interval_seconds() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECONDS
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub session_timeout_seconds: u64,
    pub max_concurrent_sessions: usize,
    pub max_video_frames: usize,
    pub max_frame_dimension: u32,
    pub frame_jpeg_quality: u8,
    pub max_workers: usize,
    pub job_retention_seconds: u64,
    pub progress_log_every: usize,
    pub touch_every: usize,
    pub sweep_interval_seconds: u64,
    pub bind_addr: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            session_timeout_seconds: default_session_timeout_seconds(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            max_video_frames: default_max_video_frames(),
            max_frame_dimension: default_max_frame_dimension(),
            frame_jpeg_quality: default_frame_jpeg_quality(),
            max_workers: default_max_workers(),
            job_retention_seconds: default_job_retention_seconds(),
            progress_log_every: default_progress_log_every(),
            touch_every: default_touch_every(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl OrchestratorSettings {
    /// Load settings from a JSON file. A missing path (or `None`) yields the
    /// defaults; a present-but-invalid file is an error rather than a silent
    /// fallback.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        let mut settings: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse settings from {}", path.display()))?;
        settings.normalize();
        Ok(settings)
    }

    /// Clamp values that would make the service inoperable. Zeroed cadences
    /// and worker counts are legacy "unset" spellings and fall back to the
    /// defaults.
    pub fn normalize(&mut self) {
        if self.max_concurrent_sessions == 0 {
            self.max_concurrent_sessions = DEFAULT_MAX_CONCURRENT_SESSIONS;
        }
        if self.max_video_frames == 0 {
            self.max_video_frames = DEFAULT_MAX_VIDEO_FRAMES;
        }
        if self.max_frame_dimension == 0 {
            self.max_frame_dimension = DEFAULT_MAX_FRAME_DIMENSION;
        }
        self.frame_jpeg_quality = self.frame_jpeg_quality.clamp(1, 100);
        if self.max_workers == 0 {
            self.max_workers = DEFAULT_MAX_WORKERS;
        }
        if self.progress_log_every == 0 {
            self.progress_log_every = DEFAULT_PROGRESS_LOG_EVERY;
        }
        if self.touch_every == 0 {
            self.touch_every = DEFAULT_TOUCH_EVERY;
        }
        if self.sweep_interval_seconds == 0 {
            self.sweep_interval_seconds = DEFAULT_SWEEP_INTERVAL_SECONDS;
        }
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use image::RgbImage;
use tracing::{info, warn};

use crate::maskflow_core::domain::TrackedObject;
use crate::maskflow_core::error::EngineError;
use crate::maskflow_core::frames::{FrameSource, FrameStore};
use crate::maskflow_core::segmenter::{InferenceState, Segmenter};
use crate::maskflow_core::settings::OrchestratorSettings;
use crate::sync_ext::MutexExt;

/// Everything mutable about a session, guarded by one lock. Interactive
/// operations hold it for their duration; propagation holds it for the
/// entire stream, which is what keeps refinements from racing the stream.
pub struct SessionState {
    pub frames: Vec<RgbImage>,
    /// `None` once the session has been closed and the scratch dir removed.
    pub store: Option<FrameStore>,
    pub model_state: Box<dyn InferenceState>,
    pub objects: HashMap<u32, TrackedObject>,
}

pub struct Session {
    pub session_id: String,
    pub video_path: PathBuf,
    pub frames_dir: PathBuf,
    /// Working dimensions: the coordinate space of every prompt and mask in
    /// this session, fixed at admission.
    pub frame_width: u32,
    pub frame_height: u32,
    pub total_frames: usize,
    pub fps: f64,
    pub created_at: DateTime<Utc>,
    last_accessed_ms: AtomicI64,
    pub state: Mutex<SessionState>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("video_path", &self.video_path)
            .field("frame_width", &self.frame_width)
            .field("frame_height", &self.frame_height)
            .field("total_frames", &self.total_frames)
            .field("fps", &self.fps)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl Session {
    pub fn touch(&self) {
        self.last_accessed_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.last_accessed_ms.load(Ordering::Relaxed))
            .unwrap_or_else(Utc::now)
    }

    pub fn idle_seconds(&self) -> f64 {
        let idle_ms = Utc::now().timestamp_millis() - self.last_accessed_ms.load(Ordering::Relaxed);
        (idle_ms.max(0) as f64) / 1000.0
    }
}

/// Creates, looks up, evicts, and closes sessions, enforcing the global
/// admission cap. The table lock is only ever held for short map
/// operations; per-session work happens under the session's own lock.
pub struct SessionManager {
    table: Mutex<HashMap<String, Arc<Session>>>,
    /// Admissions currently materializing frames, counted so concurrent
    /// opens cannot overshoot the cap while off the table lock.
    pending_admissions: AtomicUsize,
    accepting: AtomicBool,
    frame_source: Arc<dyn FrameSource>,
    settings: Arc<OrchestratorSettings>,
}

impl SessionManager {
    pub fn new(frame_source: Arc<dyn FrameSource>, settings: Arc<OrchestratorSettings>) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            pending_admissions: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            frame_source,
            settings,
        }
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Relaxed);
    }

    pub fn session_count(&self) -> usize {
        self.table.lock_unpoisoned().len()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        let session = self.table.lock_unpoisoned().get(session_id).cloned()?;
        session.touch();
        Some(session)
    }

    /// Membership check that does not refresh the access stamp; the
    /// propagation loop uses this to detect teardown without keeping the
    /// session artificially alive.
    pub fn contains(&self, session_id: &str) -> bool {
        self.table.lock_unpoisoned().contains_key(session_id)
    }

    /// Admit a new session for `video_path`: probe, pick working
    /// dimensions, decode a bounded number of frames, materialize the
    /// frame store, and ask the segmenter to prepare per-video state.
    pub fn open(
        &self,
        video_path: &Path,
        segmenter: &dyn Segmenter,
    ) -> Result<Arc<Session>, EngineError> {
        if !self.accepting.load(Ordering::Relaxed) {
            return Err(EngineError::ShuttingDown);
        }

        self.reserve_slot(segmenter)?;
        let result = self.open_reserved(video_path, segmenter);
        self.pending_admissions.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn reserve_slot(&self, segmenter: &dyn Segmenter) -> Result<(), EngineError> {
        let limit = self.settings.max_concurrent_sessions;
        let at_capacity = {
            let table = self.table.lock_unpoisoned();
            table.len() + self.pending_admissions.load(Ordering::SeqCst) >= limit
        };
        if at_capacity {
            let swept = self.sweep_expired(segmenter);
            if swept > 0 {
                info!(swept, "swept expired sessions to make room");
            }
        }

        let table = self.table.lock_unpoisoned();
        if table.len() + self.pending_admissions.load(Ordering::SeqCst) >= limit {
            return Err(EngineError::CapacityExceeded { limit });
        }
        self.pending_admissions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn open_reserved(
        &self,
        video_path: &Path,
        segmenter: &dyn Segmenter,
    ) -> Result<Arc<Session>, EngineError> {
        let meta = self.frame_source.probe(video_path)?;

        let max_dim = self.settings.max_frame_dimension;
        let (mut width, mut height) = (meta.width, meta.height);
        if width > max_dim || height > max_dim {
            let scale = f64::min(
                max_dim as f64 / meta.width as f64,
                max_dim as f64 / meta.height as f64,
            );
            width = (meta.width as f64 * scale) as u32;
            height = (meta.height as f64 * scale) as u32;
            if width == 0 || height == 0 {
                return Err(EngineError::VideoTooLarge(format!(
                    "{}x{} cannot be downscaled within {max_dim}px",
                    meta.width, meta.height
                )));
            }
            info!(
                from_width = meta.width,
                from_height = meta.height,
                to_width = width,
                to_height = height,
                "downscaling video to working dimensions"
            );
        }

        let max_frames = self.settings.max_video_frames;
        if let Some(total) = meta.total_frames
            && total > max_frames
        {
            warn!(
                total,
                max_frames, "video exceeds the frame cap; trailing frames will be dropped"
            );
        }

        let frames = self
            .frame_source
            .read_frames(video_path, max_frames, (width, height))?;
        if frames.is_empty() {
            return Err(EngineError::VideoUnreadable(format!(
                "no frames decoded from {}",
                video_path.display()
            )));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let store = FrameStore::materialize(&session_id, &frames, self.settings.frame_jpeg_quality)
            .map_err(EngineError::Internal)?;
        let model_state = segmenter.prepare_video_state(store.path())?;

        let now = Utc::now();
        let session = Arc::new(Session {
            session_id: session_id.clone(),
            video_path: video_path.to_path_buf(),
            frames_dir: store.path().to_path_buf(),
            frame_width: width,
            frame_height: height,
            total_frames: frames.len(),
            fps: meta.fps,
            created_at: now,
            last_accessed_ms: AtomicI64::new(now.timestamp_millis()),
            state: Mutex::new(SessionState {
                frames,
                store: Some(store),
                model_state,
                objects: HashMap::new(),
            }),
        });

        info!(
            session_id = %session.session_id,
            video = %video_path.display(),
            frames = session.total_frames,
            width,
            height,
            "created session"
        );

        self.table
            .lock_unpoisoned()
            .insert(session_id, session.clone());
        Ok(session)
    }

    /// Close and clean up. Idempotent: closing an unknown id returns false
    /// without error. If a propagation holds the session lock, cleanup
    /// blocks until the stream notices the session is gone and bails.
    pub fn close(&self, session_id: &str, segmenter: &dyn Segmenter) -> bool {
        let Some(session) = self.table.lock_unpoisoned().remove(session_id) else {
            return false;
        };

        let mut state = session.state.lock_unpoisoned();
        segmenter.reset(state.model_state.as_mut());
        state.objects.clear();
        if let Some(store) = state.store.take() {
            store.close();
        }
        drop(state);

        info!(session_id, "closed session");
        true
    }

    /// Close every session idle longer than the configured timeout.
    pub fn sweep_expired(&self, segmenter: &dyn Segmenter) -> usize {
        let timeout = self.settings.session_timeout_seconds as f64;
        let expired: Vec<String> = {
            let table = self.table.lock_unpoisoned();
            table
                .values()
                .filter(|session| session.idle_seconds() > timeout)
                .map(|session| session.session_id.clone())
                .collect()
        };

        for session_id in &expired {
            info!(session_id, "session expired; evicting");
            self.close(session_id, segmenter);
        }
        expired.len()
    }

    pub fn close_all(&self, segmenter: &dyn Segmenter) {
        let ids: Vec<String> = self.table.lock_unpoisoned().keys().cloned().collect();
        for session_id in ids {
            self.close(&session_id, segmenter);
        }
    }
}

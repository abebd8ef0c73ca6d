use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use tracing::{info, warn};

use crate::maskflow_core::domain::{
    AddObjectBoxRequest, AddObjectRequest, Direction, OBJECT_COLORS, ObjectResponse,
    ObjectSummary, OpenSessionRequest, OpenSessionResponse, OverrideMaskRequest, PromptRecord,
    PropagateRequest, RefineRequest, SessionInfoResponse, TrackedObject,
};
use crate::maskflow_core::error::EngineError;
use crate::maskflow_core::frames::FrameSource;
use crate::maskflow_core::jobs::{JOB_TYPE_PROPAGATE, Job, JobContext, JobManager};
use crate::maskflow_core::mask::Mask;
use crate::maskflow_core::segmenter::{PromptInput, Segmenter, StreamControl};
use crate::maskflow_core::session::{Session, SessionManager, SessionState};
use crate::maskflow_core::settings::OrchestratorSettings;
use crate::sync_ext::MutexExt;

fn validate_frame_idx(frame_idx: usize, total_frames: usize) -> Result<(), EngineError> {
    if frame_idx >= total_frames {
        return Err(EngineError::InvalidArgument(format!(
            "frame index {frame_idx} out of range [0, {total_frames})"
        )));
    }
    Ok(())
}

fn validate_points(points: &[[f32; 2]], labels: &[u8]) -> Result<(), EngineError> {
    if points.is_empty() {
        return Err(EngineError::InvalidArgument(
            "at least one point is required".to_string(),
        ));
    }
    if points.len() != labels.len() {
        return Err(EngineError::InvalidArgument(format!(
            "{} points but {} labels",
            points.len(),
            labels.len()
        )));
    }
    if let Some(bad) = labels.iter().find(|&&label| label > 1) {
        return Err(EngineError::InvalidArgument(format!(
            "labels must be 0 or 1, got {bad}"
        )));
    }
    Ok(())
}

fn validate_box(bbox: [f32; 4], width: u32, height: u32) -> Result<(), EngineError> {
    let [x1, y1, x2, y2] = bbox;
    if !(x1 < x2 && y1 < y2) {
        return Err(EngineError::InvalidArgument(format!(
            "box corners must satisfy x1 < x2 and y1 < y2, got [{x1}, {y1}, {x2}, {y2}]"
        )));
    }
    if x1 < 0.0 || y1 < 0.0 || x2 > width as f32 || y2 > height as f32 {
        return Err(EngineError::InvalidArgument(format!(
            "box [{x1}, {y1}, {x2}, {y2}] lies outside the {width}x{height} frame"
        )));
    }
    Ok(())
}

// Segmenter output is conformed before it is stored: anything in the wrong
// shape becomes an empty mask of the working dimensions, with a warning.
fn conform_mask(mask: Mask, width: u32, height: u32, object_id: u32, frame_idx: usize) -> Mask {
    if mask.width() == width && mask.height() == height {
        mask
    } else {
        warn!(
            object_id,
            frame_idx,
            got_width = mask.width(),
            got_height = mask.height(),
            "segmenter mask has wrong dimensions; substituting empty mask"
        );
        Mask::empty(width, height)
    }
}

fn encode_mask(mask: &Mask) -> Result<String, EngineError> {
    mask.to_png_base64()
        .map_err(|e| EngineError::Internal(anyhow::Error::new(e)))
}

/// The orchestrator facade: translates user intents into session, segmenter
/// and job manager calls, and owns the background maintenance loop.
#[derive(Clone)]
pub struct AnnotationEngine {
    sessions: Arc<SessionManager>,
    jobs: JobManager,
    segmenter: Arc<dyn Segmenter>,
    settings: Arc<OrchestratorSettings>,
    stop: Arc<AtomicBool>,
}

impl AnnotationEngine {
    pub fn new(
        settings: OrchestratorSettings,
        frame_source: Arc<dyn FrameSource>,
        segmenter: Arc<dyn Segmenter>,
    ) -> Self {
        let settings = Arc::new(settings);
        Self {
            sessions: Arc::new(SessionManager::new(frame_source, settings.clone())),
            jobs: JobManager::new(settings.max_workers),
            segmenter,
            settings,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn session_count(&self) -> usize {
        self.sessions.session_count()
    }

    fn session(&self, session_id: &str) -> Result<Arc<Session>, EngineError> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    pub fn open_session(&self, req: &OpenSessionRequest) -> Result<OpenSessionResponse, EngineError> {
        let session = self
            .sessions
            .open(Path::new(&req.video_path), self.segmenter.as_ref())?;
        Ok(OpenSessionResponse {
            session_id: session.session_id.clone(),
            total_frames: session.total_frames,
            frame_width: session.frame_width,
            frame_height: session.frame_height,
            fps: session.fps,
        })
    }

    pub fn session_info(&self, session_id: &str) -> Result<SessionInfoResponse, EngineError> {
        let session = self.session(session_id)?;
        let state = session.state.lock_unpoisoned();
        let mut objects: Vec<ObjectSummary> = state
            .objects
            .values()
            .map(|object| ObjectSummary {
                id: object.object_id,
                name: object.name.clone(),
                category: object.category.clone(),
                color: object.color,
                frames_with_masks: object.frames_with_masks(),
            })
            .collect();
        objects.sort_by_key(|summary| summary.id);
        Ok(SessionInfoResponse {
            session_id: session.session_id.clone(),
            total_frames: session.total_frames,
            frame_width: session.frame_width,
            frame_height: session.frame_height,
            fps: session.fps,
            objects,
            created_at: session.created_at,
            last_accessed: session.last_accessed(),
            idle_seconds: session.idle_seconds(),
        })
    }

    /// Idempotent: closing an unknown session is not an error.
    pub fn close_session(&self, session_id: &str) -> bool {
        self.sessions.close(session_id, self.segmenter.as_ref())
    }

    pub fn add_object(
        &self,
        session_id: &str,
        req: &AddObjectRequest,
    ) -> Result<ObjectResponse, EngineError> {
        let session = self.session(session_id)?;
        validate_frame_idx(req.frame_idx, session.total_frames)?;
        validate_points(&req.points, &req.labels)?;

        let mut state = session.state.lock_unpoisoned();
        if state.objects.contains_key(&req.object_id) {
            return Err(EngineError::InvalidArgument(format!(
                "object {} already exists in this session",
                req.object_id
            )));
        }

        let color = OBJECT_COLORS[state.objects.len() % OBJECT_COLORS.len()];
        let mask = self.segmenter.add_prompts(
            state.model_state.as_mut(),
            req.frame_idx,
            req.object_id,
            PromptInput::Points {
                points: &req.points,
                labels: &req.labels,
            },
        )?;
        let mask = conform_mask(
            mask,
            session.frame_width,
            session.frame_height,
            req.object_id,
            req.frame_idx,
        );

        let name = req
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("Object {}", req.object_id));
        let category = req.category.clone().unwrap_or_default();
        let mut object = TrackedObject::new(req.object_id, name, category, color);
        object.prompts.push(PromptRecord::InitialPoints {
            frame_idx: req.frame_idx,
            points: req.points.clone(),
            labels: req.labels.clone(),
        });
        object.masks.insert(req.frame_idx, mask.clone());

        // The segmenter already knows this object; commit it to the local
        // map before anything else can fail.
        let (name, category) = (object.name.clone(), object.category.clone());
        state.objects.insert(req.object_id, object);
        Ok(ObjectResponse {
            object_id: req.object_id,
            name,
            category,
            color,
            frame_idx: req.frame_idx,
            mask: encode_mask(&mask)?,
        })
    }

    pub fn add_object_with_box(
        &self,
        session_id: &str,
        req: &AddObjectBoxRequest,
    ) -> Result<ObjectResponse, EngineError> {
        let session = self.session(session_id)?;
        validate_frame_idx(req.frame_idx, session.total_frames)?;
        validate_box(req.bbox, session.frame_width, session.frame_height)?;

        let mut state = session.state.lock_unpoisoned();
        if state.objects.contains_key(&req.object_id) {
            return Err(EngineError::InvalidArgument(format!(
                "object {} already exists in this session",
                req.object_id
            )));
        }

        let color = OBJECT_COLORS[state.objects.len() % OBJECT_COLORS.len()];
        let mask = self.segmenter.add_prompts(
            state.model_state.as_mut(),
            req.frame_idx,
            req.object_id,
            PromptInput::Box { bbox: req.bbox },
        )?;
        let mask = conform_mask(
            mask,
            session.frame_width,
            session.frame_height,
            req.object_id,
            req.frame_idx,
        );

        let name = req
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("Object {}", req.object_id));
        let category = req.category.clone().unwrap_or_default();
        let mut object = TrackedObject::new(req.object_id, name, category, color);
        object.prompts.push(PromptRecord::InitialBox {
            frame_idx: req.frame_idx,
            bbox: req.bbox,
        });
        object.masks.insert(req.frame_idx, mask.clone());

        let (name, category) = (object.name.clone(), object.category.clone());
        state.objects.insert(req.object_id, object);
        Ok(ObjectResponse {
            object_id: req.object_id,
            name,
            category,
            color,
            frame_idx: req.frame_idx,
            mask: encode_mask(&mask)?,
        })
    }

    /// Add refinement prompts to an existing object on one frame. Only the
    /// mask at that frame is replaced; other frames are the propagation
    /// step's business.
    pub fn refine(
        &self,
        session_id: &str,
        object_id: u32,
        req: &RefineRequest,
    ) -> Result<(u32, usize, Mask), EngineError> {
        let session = self.session(session_id)?;
        validate_frame_idx(req.frame_idx, session.total_frames)?;
        validate_points(&req.points, &req.labels)?;

        let mut state = session.state.lock_unpoisoned();
        if !state.objects.contains_key(&object_id) {
            return Err(EngineError::ObjectNotFound(object_id));
        }

        let mask = self.segmenter.add_prompts(
            state.model_state.as_mut(),
            req.frame_idx,
            object_id,
            PromptInput::Points {
                points: &req.points,
                labels: &req.labels,
            },
        )?;
        let mask = conform_mask(
            mask,
            session.frame_width,
            session.frame_height,
            object_id,
            req.frame_idx,
        );

        let object = state
            .objects
            .get_mut(&object_id)
            .ok_or(EngineError::ObjectNotFound(object_id))?;
        object.prompts.push(PromptRecord::RefinementPoints {
            frame_idx: req.frame_idx,
            points: req.points.clone(),
            labels: req.labels.clone(),
        });
        object.masks.insert(req.frame_idx, mask.clone());
        Ok((object_id, req.frame_idx, mask))
    }

    /// Accept a user-edited mask, store it, and inject it into the
    /// segmenter state so later propagations treat it as ground truth. If
    /// injection fails the local store is rolled back; the two stores are
    /// never allowed to diverge.
    pub fn override_mask(
        &self,
        session_id: &str,
        object_id: u32,
        req: &OverrideMaskRequest,
    ) -> Result<(u32, usize, Mask), EngineError> {
        let session = self.session(session_id)?;
        validate_frame_idx(req.frame_idx, session.total_frames)?;

        let png_bytes = BASE64
            .decode(req.mask.trim())
            .map_err(|e| EngineError::InvalidArgument(format!("mask is not valid base64: {e}")))?;
        let mask =
            Mask::normalize_override(&png_bytes, session.frame_width, session.frame_height)?;

        let mut state = session.state.lock_unpoisoned();
        let SessionState {
            model_state,
            objects,
            ..
        } = &mut *state;
        let object = objects
            .get_mut(&object_id)
            .ok_or(EngineError::ObjectNotFound(object_id))?;

        let previous = object.masks.get(&req.frame_idx).cloned();
        object.masks.insert(req.frame_idx, mask.clone());
        object.prompts.push(PromptRecord::OverrideMask {
            frame_idx: req.frame_idx,
        });

        if let Err(err) =
            self.segmenter
                .inject_mask(model_state.as_mut(), req.frame_idx, object_id, &mask)
        {
            match previous {
                Some(previous) => object.masks.insert(req.frame_idx, previous),
                None => object.masks.remove(&req.frame_idx),
            };
            object.prompts.pop();
            return Err(EngineError::Segmenter(err));
        }

        Ok((object_id, req.frame_idx, mask))
    }

    /// Masks currently known at `frame_idx`, keyed by object id. Objects
    /// without a mask at that frame are simply absent.
    pub fn get_frame_masks(
        &self,
        session_id: &str,
        frame_idx: usize,
    ) -> Result<BTreeMap<u32, Mask>, EngineError> {
        let session = self.session(session_id)?;
        validate_frame_idx(frame_idx, session.total_frames)?;
        let state = session.state.lock_unpoisoned();
        Ok(state
            .objects
            .values()
            .filter_map(|object| {
                object
                    .masks
                    .get(&frame_idx)
                    .map(|mask| (object.object_id, mask.clone()))
            })
            .collect())
    }

    /// Submit a propagation job. Returns the job id immediately; the task
    /// runs on the worker pool and holds the session lock for the whole
    /// stream.
    pub fn start_propagation(
        &self,
        session_id: &str,
        req: &PropagateRequest,
    ) -> Result<String, EngineError> {
        let session = self.session(session_id)?;
        let total_frames = session.total_frames;
        let start_frame = req.start_frame.unwrap_or(0);
        let end_frame = req.end_frame.unwrap_or(total_frames - 1);
        validate_frame_idx(start_frame, total_frames)?;
        validate_frame_idx(end_frame, total_frames)?;
        if start_frame > end_frame {
            return Err(EngineError::InvalidArgument(format!(
                "start frame {start_frame} is after end frame {end_frame}"
            )));
        }
        let direction = req.direction.unwrap_or_default();

        {
            let state = session.state.lock_unpoisoned();
            if state.objects.is_empty() {
                return Err(EngineError::NothingToPropagate);
            }
        }

        let params = json!({
            "session_id": session_id,
            "start_frame": start_frame,
            "end_frame": end_frame,
            "direction": direction,
        });

        let sessions = self.sessions.clone();
        let segmenter = self.segmenter.clone();
        let settings = self.settings.clone();
        let task_session_id = session_id.to_string();
        self.jobs.submit(
            JOB_TYPE_PROPAGATE,
            params,
            Box::new(move |ctx| {
                run_propagation(
                    &sessions,
                    segmenter.as_ref(),
                    &settings,
                    &task_session_id,
                    start_frame,
                    end_frame,
                    direction,
                    ctx,
                )
            }),
        )
    }

    pub fn job(&self, job_id: &str) -> Result<Job, EngineError> {
        self.jobs
            .get(job_id)
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))
    }

    pub fn cancel_job(&self, job_id: &str) -> Result<Job, EngineError> {
        self.jobs
            .cancel(job_id)
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))
    }

    pub fn sweep_expired_sessions(&self) -> usize {
        self.sessions.sweep_expired(self.segmenter.as_ref())
    }

    pub fn cleanup_old_jobs(&self) -> usize {
        self.jobs
            .cleanup_old_jobs(Duration::from_secs(self.settings.job_retention_seconds))
    }

    /// Periodic session sweep + job reaping until shutdown.
    pub fn spawn_maintenance(&self) {
        let engine = self.clone();
        thread::Builder::new()
            .name("maskflow-maintenance".to_string())
            .spawn(move || {
                let interval = Duration::from_secs(engine.settings.sweep_interval_seconds);
                let mut last_run = Instant::now();
                while !engine.stop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(200));
                    if last_run.elapsed() < interval {
                        continue;
                    }
                    last_run = Instant::now();
                    let swept = engine.sweep_expired_sessions();
                    let reaped = engine.cleanup_old_jobs();
                    if swept > 0 || reaped > 0 {
                        info!(swept, reaped, "maintenance pass");
                    }
                }
            })
            .expect("failed to spawn maintenance thread");
    }

    /// Graceful teardown: stop admitting, drain the worker pool, then close
    /// every session (which frees the frame scratch dirs).
    pub fn shutdown(&self) {
        info!("engine shutting down");
        self.stop.store(true, Ordering::Relaxed);
        self.sessions.set_accepting(false);
        self.jobs.shutdown();
        self.sessions.close_all(self.segmenter.as_ref());
    }
}

enum StreamOutcome {
    Finished,
    Cancelled,
    SessionGone,
}

#[allow(clippy::too_many_arguments)]
fn run_propagation(
    sessions: &SessionManager,
    segmenter: &dyn Segmenter,
    settings: &OrchestratorSettings,
    session_id: &str,
    start_frame: usize,
    end_frame: usize,
    direction: Direction,
    ctx: &JobContext,
) -> Result<serde_json::Value, EngineError> {
    let session = sessions
        .get(session_id)
        .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

    let expected = (end_frame - start_frame + 1) as f64;
    let (width, height) = (session.frame_width, session.frame_height);
    let touch_every = settings.touch_every;
    let progress_log_every = settings.progress_log_every;

    info!(
        session_id,
        start_frame,
        end_frame,
        ?direction,
        "starting mask propagation"
    );
    let started = Instant::now();

    let mut state = session.state.lock_unpoisoned();
    let SessionState {
        model_state,
        objects,
        ..
    } = &mut *state;

    let mut outcome = StreamOutcome::Finished;
    let mut frames_done = 0usize;
    let mut covered: serde_json::Map<String, serde_json::Value> = serde_json::Map::new();
    let mut first_frame: Option<usize> = None;
    let mut last_frame: Option<usize> = None;

    segmenter.stream_propagation(model_state.as_mut(), start_frame, end_frame, &mut |frame_idx,
                                                                                     masks| {
        if ctx.is_cancelled() {
            outcome = StreamOutcome::Cancelled;
            return StreamControl::Stop;
        }
        if !sessions.contains(session_id) {
            outcome = StreamOutcome::SessionGone;
            return StreamControl::Stop;
        }

        let mut frame_objects = Vec::with_capacity(masks.len());
        for (object_id, mask) in masks {
            let mask = conform_mask(mask, width, height, object_id, frame_idx);
            if let Some(object) = objects.get_mut(&object_id) {
                object.masks.insert(frame_idx, mask);
                frame_objects.push(serde_json::Value::from(object_id));
            }
        }
        covered.insert(
            frame_idx.to_string(),
            serde_json::Value::Array(frame_objects),
        );
        first_frame = Some(first_frame.unwrap_or(frame_idx).min(frame_idx));
        last_frame = Some(last_frame.unwrap_or(frame_idx).max(frame_idx));

        frames_done += 1;
        if frames_done % touch_every == 0 {
            session.touch();
        }
        if frames_done % progress_log_every == 0 {
            let elapsed = started.elapsed().as_secs_f64();
            let fps = if elapsed > 0.0 {
                frames_done as f64 / elapsed
            } else {
                0.0
            };
            info!(
                session_id,
                frames_done,
                fps = format!("{fps:.1}"),
                "propagation progress"
            );
            ctx.update_progress(frames_done as f64 / expected * 100.0);
        }
        StreamControl::Continue
    })?;

    match outcome {
        StreamOutcome::Cancelled => {
            info!(session_id, frames_done, "propagation cancelled");
            Err(EngineError::Cancelled)
        }
        StreamOutcome::SessionGone => {
            warn!(session_id, "session closed mid-propagation");
            Err(EngineError::SessionGone)
        }
        StreamOutcome::Finished => {
            session.touch();
            let elapsed = started.elapsed().as_secs_f64();
            info!(
                session_id,
                frames_done,
                elapsed = format!("{elapsed:.2}s"),
                "propagation completed"
            );
            // The per-frame map is large; the job manager strips `frames`
            // before the result is stored. Summary fields survive.
            Ok(json!({
                "session_id": session_id,
                "total_frames": session.total_frames,
                "frames": covered,
                "frames_covered": frames_done,
                "first_frame": first_frame,
                "last_frame": last_frame,
                "direction": direction,
            }))
        }
    }
}

use std::any::Any;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::maskflow_core::mask::Mask;

#[derive(Debug, Error)]
pub enum SegmenterError {
    #[error("failed to prepare video state: {0}")]
    Prepare(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("mask injection failed: {0}")]
    Inject(String),
}

/// Opaque per-video state prepared by a segmenter. The core never inspects
/// it; implementations downcast through `as_any_mut`.
pub trait InferenceState: Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Sparse prompt input forwarded to the segmenter.
#[derive(Debug, Clone, Copy)]
pub enum PromptInput<'a> {
    Points {
        points: &'a [[f32; 2]],
        labels: &'a [u8],
    },
    Box {
        bbox: [f32; 4],
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    Continue,
    Stop,
}

/// Per-frame sink for propagation streaming. Returning `Stop` ends the
/// stream at the next frame boundary; this is how cancellation and
/// session teardown reach a propagation in flight.
pub type FrameSink<'a> = dyn FnMut(usize, Vec<(u32, Mask)>) -> StreamControl + 'a;

/// The segmentation capability the orchestrator is built against: prepare
/// and reset per-video state, turn prompts into masks, accept mask
/// overrides, and stream a propagation pass.
pub trait Segmenter: Send + Sync {
    fn prepare_video_state(&self, frames_dir: &Path)
    -> Result<Box<dyn InferenceState>, SegmenterError>;

    /// Add prompts for one object at one frame, mutating the state, and
    /// return the resulting mask. Repeat calls for a known object are
    /// refinements.
    fn add_prompts(
        &self,
        state: &mut dyn InferenceState,
        frame_idx: usize,
        object_id: u32,
        prompts: PromptInput<'_>,
    ) -> Result<Mask, SegmenterError>;

    /// Install a user-supplied mask as ground truth for `(object, frame)`
    /// so subsequent propagation honors it.
    fn inject_mask(
        &self,
        state: &mut dyn InferenceState,
        frame_idx: usize,
        object_id: u32,
        mask: &Mask,
    ) -> Result<(), SegmenterError>;

    /// Stream per-frame masks for every known object across
    /// `[start_frame, end_frame]`, in frame order.
    fn stream_propagation(
        &self,
        state: &mut dyn InferenceState,
        start_frame: usize,
        end_frame: usize,
        on_frame: &mut FrameSink<'_>,
    ) -> Result<(), SegmenterError>;

    /// Release everything held for this video.
    fn reset(&self, state: &mut dyn InferenceState);
}

struct SimObject {
    /// Explicitly prompted, refined, or injected frames. Seeds are emitted
    /// verbatim during propagation, never re-estimated.
    seeds: BTreeMap<usize, Mask>,
}

pub struct SimulatorState {
    width: u32,
    height: u32,
    total_frames: usize,
    objects: BTreeMap<u32, SimObject>,
}

impl InferenceState for SimulatorState {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Deterministic segmenter used by tests and the no-accelerator mode.
///
/// Positive points paint a filled disc, negative points carve one out,
/// boxes fill their rectangle, and propagation warps the nearest seed
/// horizontally by two pixels per frame of distance.
pub struct SimulatorSegmenter {
    frame_delay: Option<Duration>,
}

impl SimulatorSegmenter {
    pub fn new() -> Self {
        Self { frame_delay: None }
    }

    /// Sleep this long per streamed frame, approximating model latency.
    pub fn with_frame_delay(delay: Duration) -> Self {
        Self {
            frame_delay: Some(delay),
        }
    }

    fn downcast<'a>(state: &'a mut dyn InferenceState) -> Result<&'a mut SimulatorState, SegmenterError> {
        state
            .as_any_mut()
            .downcast_mut::<SimulatorState>()
            .ok_or_else(|| {
                SegmenterError::Inference("state was not prepared by this segmenter".to_string())
            })
    }
}

impl Default for SimulatorSegmenter {
    fn default() -> Self {
        Self::new()
    }
}

fn paint_disc(mask: &mut Mask, cx: f32, cy: f32, radius: i64, value: u8) {
    let (width, height) = (mask.width() as i64, mask.height() as i64);
    let cx = cx.round() as i64;
    let cy = cy.round() as i64;
    let r2 = radius * radius;
    for y in (cy - radius).max(0)..=(cy + radius).min(height - 1) {
        for x in (cx - radius).max(0)..=(cx + radius).min(width - 1) {
            let dx = x - cx;
            let dy = y - cy;
            if dx * dx + dy * dy <= r2 {
                mask.put(x as u32, y as u32, value);
            }
        }
    }
}

fn fill_box(mask: &mut Mask, bbox: [f32; 4]) {
    let (width, height) = (mask.width() as i64, mask.height() as i64);
    let x1 = (bbox[0].round() as i64).clamp(0, width - 1);
    let y1 = (bbox[1].round() as i64).clamp(0, height - 1);
    let x2 = (bbox[2].round() as i64).clamp(0, width - 1);
    let y2 = (bbox[3].round() as i64).clamp(0, height - 1);
    for y in y1..=y2 {
        for x in x1..=x2 {
            mask.put(x as u32, y as u32, 255);
        }
    }
}

fn shifted(mask: &Mask, dx: i64) -> Mask {
    let (width, height) = (mask.width(), mask.height());
    let mut out = Mask::empty(width, height);
    for y in 0..height {
        for x in 0..width {
            if mask.get(x, y) == 0 {
                continue;
            }
            let nx = x as i64 + dx;
            if nx >= 0 && nx < width as i64 {
                out.put(nx as u32, y, 255);
            }
        }
    }
    out
}

impl Segmenter for SimulatorSegmenter {
    fn prepare_video_state(
        &self,
        frames_dir: &Path,
    ) -> Result<Box<dyn InferenceState>, SegmenterError> {
        let mut frame_paths: Vec<_> = std::fs::read_dir(frames_dir)
            .map_err(|e| SegmenterError::Prepare(format!("unreadable frames dir: {e}")))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "jpg"))
            .collect();
        frame_paths.sort();

        let first = frame_paths
            .first()
            .ok_or_else(|| SegmenterError::Prepare("frames dir holds no frames".to_string()))?;
        let (width, height) = image::image_dimensions(first)
            .map_err(|e| SegmenterError::Prepare(format!("unreadable first frame: {e}")))?;

        Ok(Box::new(SimulatorState {
            width,
            height,
            total_frames: frame_paths.len(),
            objects: BTreeMap::new(),
        }))
    }

    fn add_prompts(
        &self,
        state: &mut dyn InferenceState,
        frame_idx: usize,
        object_id: u32,
        prompts: PromptInput<'_>,
    ) -> Result<Mask, SegmenterError> {
        let state = Self::downcast(state)?;
        if frame_idx >= state.total_frames {
            return Err(SegmenterError::Inference(format!(
                "frame {frame_idx} outside prepared range"
            )));
        }

        let known = state.objects.contains_key(&object_id);
        let object = state
            .objects
            .entry(object_id)
            .or_insert_with(|| SimObject {
                seeds: BTreeMap::new(),
            });

        let mut mask = object
            .seeds
            .get(&frame_idx)
            .cloned()
            .unwrap_or_else(|| Mask::empty(state.width, state.height));

        match prompts {
            PromptInput::Points { points, labels } => {
                let base = state.width.min(state.height) as i64;
                let radius = if known { base / 15 } else { base / 10 };
                for (point, label) in points.iter().zip(labels.iter()) {
                    let value = if *label == 1 { 255 } else { 0 };
                    paint_disc(&mut mask, point[0], point[1], radius.max(1), value);
                }
            }
            PromptInput::Box { bbox } => {
                fill_box(&mut mask, bbox);
            }
        }

        object.seeds.insert(frame_idx, mask.clone());
        Ok(mask)
    }

    fn inject_mask(
        &self,
        state: &mut dyn InferenceState,
        frame_idx: usize,
        object_id: u32,
        mask: &Mask,
    ) -> Result<(), SegmenterError> {
        let state = Self::downcast(state)?;
        if mask.width() != state.width || mask.height() != state.height {
            return Err(SegmenterError::Inject(format!(
                "mask is {}x{} but state expects {}x{}",
                mask.width(),
                mask.height(),
                state.width,
                state.height
            )));
        }
        let object = state
            .objects
            .get_mut(&object_id)
            .ok_or_else(|| SegmenterError::Inject(format!("unknown object {object_id}")))?;
        object.seeds.insert(frame_idx, mask.clone());
        Ok(())
    }

    fn stream_propagation(
        &self,
        state: &mut dyn InferenceState,
        start_frame: usize,
        end_frame: usize,
        on_frame: &mut FrameSink<'_>,
    ) -> Result<(), SegmenterError> {
        let state = Self::downcast(state)?;
        let end_frame = end_frame.min(state.total_frames.saturating_sub(1));

        for frame_idx in start_frame..=end_frame {
            if let Some(delay) = self.frame_delay {
                std::thread::sleep(delay);
            }

            let mut masks = Vec::with_capacity(state.objects.len());
            for (&object_id, object) in &state.objects {
                if let Some(seed) = object.seeds.get(&frame_idx) {
                    masks.push((object_id, seed.clone()));
                    continue;
                }
                let Some(nearest) = object
                    .seeds
                    .keys()
                    .min_by_key(|&&seed_frame| seed_frame.abs_diff(frame_idx))
                    .copied()
                else {
                    continue;
                };
                let dx = (frame_idx as i64 - nearest as i64) * 2;
                masks.push((object_id, shifted(&object.seeds[&nearest], dx)));
            }

            if on_frame(frame_idx, masks) == StreamControl::Stop {
                return Ok(());
            }
        }
        Ok(())
    }

    fn reset(&self, state: &mut dyn InferenceState) {
        if let Some(state) = state.as_any_mut().downcast_mut::<SimulatorState>() {
            state.objects.clear();
        }
    }
}

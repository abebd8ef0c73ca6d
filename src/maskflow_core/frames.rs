use std::fs;
use std::io::{BufWriter, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use serde::Deserialize;
use tempfile::TempDir;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum FrameSourceError {
    #[error("could not open video: {0}")]
    Unreadable(String),
    #[error("video decode failed: {0}")]
    Decode(String),
}

/// Metadata reported for a video before any frames are decoded.
/// `total_frames` is best-effort; some containers do not carry a frame
/// count, in which case the decoder's actual yield is authoritative.
#[derive(Debug, Clone)]
pub struct VideoMetadata {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub total_frames: Option<usize>,
}

/// Capability: given a video reference, report its metadata and yield
/// decoded RGB frames at the requested working dimensions.
pub trait FrameSource: Send + Sync {
    fn probe(&self, video: &Path) -> Result<VideoMetadata, FrameSourceError>;

    /// Decode up to `max_frames` frames scaled to `dims`. Implementations
    /// must stop at the cap rather than erroring on longer videos.
    fn read_frames(
        &self,
        video: &Path,
        max_frames: usize,
        dims: (u32, u32),
    ) -> Result<Vec<RgbImage>, FrameSourceError>;
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

fn parse_rate(rate: &str) -> Option<f64> {
    let mut parts = rate.splitn(2, '/');
    let num: f64 = parts.next()?.trim().parse().ok()?;
    match parts.next() {
        Some(den) => {
            let den: f64 = den.trim().parse().ok()?;
            if den > 0.0 { Some(num / den) } else { None }
        }
        None => Some(num),
    }
}

/// Production frame source backed by the `ffprobe`/`ffmpeg` binaries.
/// Frames are piped out as packed rgb24 so no container-specific decoding
/// lives in this process.
pub struct FfmpegFrameSource {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegFrameSource {
    pub fn new() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }

    pub fn with_binaries(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self { ffmpeg, ffprobe }
    }
}

impl Default for FfmpegFrameSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for FfmpegFrameSource {
    fn probe(&self, video: &Path) -> Result<VideoMetadata, FrameSourceError> {
        let output = Command::new(&self.ffprobe)
            .arg("-v")
            .arg("error")
            .arg("-select_streams")
            .arg("v:0")
            .arg("-show_entries")
            .arg("stream=width,height,r_frame_rate,avg_frame_rate,nb_frames")
            .arg("-of")
            .arg("json")
            .arg(video.as_os_str())
            .output()
            .map_err(|e| FrameSourceError::Unreadable(format!("failed to run ffprobe: {e}")))?;

        if !output.status.success() {
            return Err(FrameSourceError::Unreadable(format!(
                "ffprobe failed for {}: {}",
                video.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let parsed: FfprobeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| FrameSourceError::Unreadable(format!("unparseable ffprobe output: {e}")))?;
        let stream = parsed
            .streams
            .into_iter()
            .next()
            .ok_or_else(|| FrameSourceError::Unreadable("no video stream".to_string()))?;

        let width = stream
            .width
            .filter(|&w| w > 0)
            .ok_or_else(|| FrameSourceError::Unreadable("missing frame width".to_string()))?;
        let height = stream
            .height
            .filter(|&h| h > 0)
            .ok_or_else(|| FrameSourceError::Unreadable("missing frame height".to_string()))?;
        let fps = stream
            .avg_frame_rate
            .as_deref()
            .and_then(parse_rate)
            .filter(|f| f.is_finite() && *f > 0.0)
            .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))
            .unwrap_or(0.0);
        let total_frames = stream.nb_frames.as_deref().and_then(|n| n.parse().ok());

        Ok(VideoMetadata {
            width,
            height,
            fps,
            total_frames,
        })
    }

    fn read_frames(
        &self,
        video: &Path,
        max_frames: usize,
        dims: (u32, u32),
    ) -> Result<Vec<RgbImage>, FrameSourceError> {
        let (width, height) = dims;
        let frame_len = (width as usize) * (height as usize) * 3;

        let mut child = Command::new(&self.ffmpeg)
            .arg("-v")
            .arg("error")
            .arg("-i")
            .arg(video.as_os_str())
            .arg("-vf")
            .arg(format!("scale={width}:{height}:flags=area"))
            .arg("-frames:v")
            .arg(max_frames.to_string())
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| FrameSourceError::Unreadable(format!("failed to run ffmpeg: {e}")))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| FrameSourceError::Decode("ffmpeg stdout unavailable".to_string()))?;

        let mut frames = Vec::new();
        let mut buf = vec![0u8; frame_len];
        while frames.len() < max_frames {
            if !read_frame(&mut stdout, &mut buf)? {
                break;
            }
            let frame = RgbImage::from_raw(width, height, buf.clone()).ok_or_else(|| {
                FrameSourceError::Decode("frame buffer size mismatch".to_string())
            })?;
            frames.push(frame);
        }
        drop(stdout);

        let mut stderr_text = String::new();
        if let Some(mut stderr) = child.stderr.take() {
            let _ = stderr.read_to_string(&mut stderr_text);
        }
        let status = child
            .wait()
            .map_err(|e| FrameSourceError::Decode(format!("ffmpeg did not exit cleanly: {e}")))?;

        if frames.is_empty() {
            let detail = if stderr_text.trim().is_empty() {
                format!("ffmpeg produced no frames (exit status {status})")
            } else {
                stderr_text.trim().to_string()
            };
            return Err(FrameSourceError::Unreadable(detail));
        }

        Ok(frames)
    }
}

// Reads one full frame into `buf`. Returns Ok(false) on a clean EOF before
// any bytes of the frame; a truncated frame is an error.
fn read_frame(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool, FrameSourceError> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .map_err(|e| FrameSourceError::Decode(format!("read from ffmpeg failed: {e}")))?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(FrameSourceError::Decode(format!(
                "truncated frame: got {filled} of {} bytes",
                buf.len()
            )));
        }
        filled += n;
    }
    Ok(true)
}

/// Deterministic frame source for tests and model-free demos. Produces
/// gradient frames whose content varies per frame index.
pub struct SyntheticFrameSource {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub total_frames: usize,
}

impl SyntheticFrameSource {
    pub fn new(width: u32, height: u32, fps: f64, total_frames: usize) -> Self {
        Self {
            width,
            height,
            fps,
            total_frames,
        }
    }
}

impl FrameSource for SyntheticFrameSource {
    fn probe(&self, _video: &Path) -> Result<VideoMetadata, FrameSourceError> {
        Ok(VideoMetadata {
            width: self.width,
            height: self.height,
            fps: self.fps,
            total_frames: Some(self.total_frames),
        })
    }

    fn read_frames(
        &self,
        _video: &Path,
        max_frames: usize,
        dims: (u32, u32),
    ) -> Result<Vec<RgbImage>, FrameSourceError> {
        let (width, height) = dims;
        let count = self.total_frames.min(max_frames);
        let frames = (0..count)
            .map(|i| {
                RgbImage::from_fn(width, height, |x, y| {
                    Rgb([
                        (x % 256) as u8,
                        (y % 256) as u8,
                        ((i * 7) % 256) as u8,
                    ])
                })
            })
            .collect();
        Ok(frames)
    }
}

/// On-disk scratch directory holding a session's frames as sequentially
/// numbered JPEGs, the layout segmenters consume. The directory is removed
/// when the store is dropped or explicitly closed.
pub struct FrameStore {
    dir: TempDir,
    frame_count: usize,
}

impl FrameStore {
    /// Write every frame as `{index:06}.jpg` at one fixed JPEG quality.
    pub fn materialize(session_id: &str, frames: &[RgbImage], jpeg_quality: u8) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("maskflow_frames_{session_id}_"))
            .tempdir()
            .context("failed to create frame scratch directory")?;

        for (index, frame) in frames.iter().enumerate() {
            let path = dir.path().join(format!("{index:06}.jpg"));
            let file = fs::File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            let mut encoder = JpegEncoder::new_with_quality(&mut writer, jpeg_quality);
            encoder
                .encode_image(frame)
                .with_context(|| format!("failed to encode {}", path.display()))?;
        }

        info!(
            frames = frames.len(),
            dir = %dir.path().display(),
            "materialized session frames"
        );

        Ok(Self {
            dir,
            frame_count: frames.len(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Remove the scratch directory now instead of waiting for drop.
    pub fn close(self) {
        let _ = self.dir.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frames(count: usize, width: u32, height: u32) -> Vec<RgbImage> {
        (0..count)
            .map(|i| RgbImage::from_pixel(width, height, Rgb([i as u8, 0, 0])))
            .collect()
    }

    #[test]
    fn frame_store_writes_sequentially_numbered_jpegs() {
        let frames = solid_frames(3, 16, 8);
        let store = FrameStore::materialize("test", &frames, 85).unwrap();
        assert_eq!(store.frame_count(), 3);
        for index in 0..3 {
            let path = store.path().join(format!("{index:06}.jpg"));
            assert!(path.exists(), "missing {}", path.display());
            let (w, h) = image::image_dimensions(&path).unwrap();
            assert_eq!((w, h), (16, 8));
        }
    }

    #[test]
    fn frame_store_close_removes_directory() {
        let frames = solid_frames(1, 4, 4);
        let store = FrameStore::materialize("cleanup", &frames, 85).unwrap();
        let path = store.path().to_path_buf();
        assert!(path.exists());
        store.close();
        assert!(!path.exists());
    }

    #[test]
    fn synthetic_source_respects_frame_cap_and_dims() {
        let source = SyntheticFrameSource::new(64, 48, 30.0, 10);
        let frames = source.read_frames(Path::new("synthetic"), 4, (32, 24)).unwrap();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].dimensions(), (32, 24));
    }

    #[test]
    fn rate_parsing_handles_fractions_and_integers() {
        assert_eq!(parse_rate("30/1"), Some(30.0));
        assert!((parse_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_rate("25"), Some(25.0));
        assert_eq!(parse_rate("0/0"), None);
    }

    #[test]
    fn read_frame_reports_clean_eof_and_truncation() {
        let data = vec![1u8; 6];
        let mut cursor = std::io::Cursor::new(data);
        let mut buf = vec![0u8; 4];
        assert!(read_frame(&mut cursor, &mut buf).unwrap());
        // Two bytes remain: a truncated second frame.
        assert!(read_frame(&mut cursor, &mut buf).is_err());

        let mut empty = std::io::Cursor::new(Vec::<u8>::new());
        assert!(!read_frame(&mut empty, &mut buf).unwrap());
    }
}

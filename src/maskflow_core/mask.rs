use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, GrayImage, ImageEncoder, Luma};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum MaskError {
    #[error("mask decode failed: {0}")]
    Decode(String),
    #[error("mask encode failed: {0}")]
    Encode(String),
    #[error("mask contains pixel values outside {{0, 255}}")]
    NonBinary,
}

/// A binary mask in the session's working dimensions. Pixel values are
/// exactly 0 or 255; every constructor enforces or restores that invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Mask {
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0u8; (width as usize) * (height as usize)],
        }
    }

    /// Accept a raw byte buffer produced by a segmenter. A buffer of the
    /// wrong length or carrying values outside {0, 255} is replaced by an
    /// empty mask of the expected shape, with a warning.
    pub fn from_model(width: u32, height: u32, raw: Vec<u8>) -> Self {
        let expected = (width as usize) * (height as usize);
        if raw.len() != expected {
            warn!(
                got = raw.len(),
                expected, "model mask has wrong shape; substituting empty mask"
            );
            return Self::empty(width, height);
        }
        if raw.iter().any(|&v| v != 0 && v != 255) {
            warn!("model mask has non-binary pixels; substituting empty mask");
            return Self::empty(width, height);
        }
        Self {
            width,
            height,
            data: raw,
        }
    }

    /// Threshold raw model logits at 0.0. Non-finite values anywhere in the
    /// buffer mean the output is corrupt and an empty mask is substituted.
    pub fn from_logits(width: u32, height: u32, logits: &[f32]) -> Self {
        let expected = (width as usize) * (height as usize);
        if logits.len() != expected || logits.iter().any(|v| !v.is_finite()) {
            warn!("model logits are corrupt; substituting empty mask");
            return Self::empty(width, height);
        }
        let data = logits
            .iter()
            .map(|&v| if v > 0.0 { 255u8 } else { 0u8 })
            .collect();
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.data[(y as usize) * (self.width as usize) + (x as usize)]
    }

    pub fn put(&mut self, x: u32, y: u32, value: u8) {
        debug_assert!(value == 0 || value == 255);
        self.data[(y as usize) * (self.width as usize) + (x as usize)] = value;
    }

    /// Number of foreground pixels.
    pub fn coverage(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }

    pub fn is_empty_mask(&self) -> bool {
        self.data.iter().all(|&v| v == 0)
    }

    /// Wire encoding: single-channel PNG, base64 text.
    pub fn to_png_base64(&self) -> Result<String, MaskError> {
        let mut png_bytes: Vec<u8> = Vec::new();
        PngEncoder::new(&mut png_bytes)
            .write_image(&self.data, self.width, self.height, ExtendedColorType::L8)
            .map_err(|e| MaskError::Encode(e.to_string()))?;
        Ok(BASE64.encode(&png_bytes))
    }

    /// Strict wire decoding. The payload must be a single-channel PNG whose
    /// pixels are exactly {0, 255}; anything else is rejected.
    pub fn from_png_base64(text: &str) -> Result<Self, MaskError> {
        let bytes = BASE64
            .decode(text.trim())
            .map_err(|e| MaskError::Decode(e.to_string()))?;
        let image = image::load_from_memory(&bytes).map_err(|e| MaskError::Decode(e.to_string()))?;
        let gray = image.to_luma8();
        if gray.pixels().any(|p| p[0] != 0 && p[0] != 255) {
            return Err(MaskError::NonBinary);
        }
        let (width, height) = gray.dimensions();
        Ok(Self {
            width,
            height,
            data: gray.into_raw(),
        })
    }

    /// Normalize a user-edited mask upload into working dimensions.
    ///
    /// RGB/RGBA inputs collapse to their first channel, other color types go
    /// through an RGB conversion first. A shape mismatch is resized with
    /// nearest-neighbor so binariness survives, then everything is
    /// thresholded at 128.
    pub fn normalize_override(png_bytes: &[u8], width: u32, height: u32) -> Result<Self, MaskError> {
        let image =
            image::load_from_memory(png_bytes).map_err(|e| MaskError::Decode(e.to_string()))?;
        let gray: GrayImage = match image {
            DynamicImage::ImageLuma8(g) => g,
            DynamicImage::ImageLumaA8(g) => {
                GrayImage::from_fn(g.width(), g.height(), |x, y| Luma([g.get_pixel(x, y)[0]]))
            }
            DynamicImage::ImageRgb8(rgb) => {
                GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| Luma([rgb.get_pixel(x, y)[0]]))
            }
            DynamicImage::ImageRgba8(rgba) => GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| {
                Luma([rgba.get_pixel(x, y)[0]])
            }),
            other => {
                let rgb = other.to_rgb8();
                GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| Luma([rgb.get_pixel(x, y)[0]]))
            }
        };

        let gray = if gray.dimensions() != (width, height) {
            warn!(
                from_width = gray.width(),
                from_height = gray.height(),
                to_width = width,
                to_height = height,
                "override mask does not match working dimensions; resizing"
            );
            image::imageops::resize(&gray, width, height, FilterType::Nearest)
        } else {
            gray
        };

        let data = gray
            .into_raw()
            .into_iter()
            .map(|v| if v > 128 { 255u8 } else { 0u8 })
            .collect();
        Ok(Self {
            width,
            height,
            data,
        })
    }
}

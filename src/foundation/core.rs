use crate::foundation::error::{VeilcamError, VeilcamResult};

/// Pixel dimensions of a frame, texture, or tensor plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Resolution {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Resolution {
    /// Create a validated non-zero resolution.
    pub fn new(width: u32, height: u32) -> VeilcamResult<Self> {
        if width == 0 || height == 0 {
            return Err(VeilcamError::validation(
                "resolution dimensions must be non-zero",
            ));
        }
        Ok(Self { width, height })
    }

    /// Total pixel count as `usize`.
    pub fn pixel_count(self) -> usize {
        (self.width as usize) * (self.height as usize)
    }

    /// Width / height ratio.
    pub fn aspect_ratio(self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

/// A decoded source frame borrowed from the source collaborator for one
/// render call.
///
/// The pipeline never retains this reference past `render()`; ownership stays
/// with the caller.
#[derive(Clone, Copy, Debug)]
pub struct SourceFrame<'a> {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// RGBA8 bytes, tightly packed, row-major, straight alpha.
    pub rgba: &'a [u8],
}

impl<'a> SourceFrame<'a> {
    /// Borrow a validated RGBA8 frame view.
    pub fn new(width: u32, height: u32, rgba: &'a [u8]) -> VeilcamResult<Self> {
        if width == 0 || height == 0 {
            return Err(VeilcamError::validation(
                "source frame dimensions must be non-zero",
            ));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(4))
            .ok_or_else(|| VeilcamError::validation("source frame size overflow"))?;
        if rgba.len() != expected {
            return Err(VeilcamError::validation(format!(
                "source frame expects {expected} bytes, got {}",
                rgba.len()
            )));
        }
        Ok(Self {
            width,
            height,
            rgba,
        })
    }

    /// Frame dimensions as a [`Resolution`].
    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width,
            height: self.height,
        }
    }
}

/// A composited output frame as RGBA8 pixels, straight alpha.
#[derive(Clone, Debug)]
pub struct FrameRgba {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// RGBA8 bytes, tightly packed, row-major.
    pub data: Vec<u8>,
}

impl FrameRgba {
    /// Allocate an opaque black frame.
    pub fn new(width: u32, height: u32) -> Self {
        let mut data = vec![0u8; (width as usize) * (height as usize) * 4];
        for px in data.chunks_exact_mut(4) {
            px[3] = 255;
        }
        Self {
            width,
            height,
            data,
        }
    }
}

/// Single-channel person-probability mask, values in `[0, 1]`.
///
/// This is the one mask convention used across both pipelines; every
/// composition stage samples this channel directly.
#[derive(Clone, Debug)]
pub struct MaskBuffer {
    /// Mask width in pixels.
    pub width: u32,
    /// Mask height in pixels.
    pub height: u32,
    /// Probabilities, row-major, one f32 per pixel.
    pub data: Vec<f32>,
}

impl MaskBuffer {
    /// Allocate a zeroed mask.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; (width as usize) * (height as usize)],
        }
    }

    /// Sample with clamp-to-edge addressing. Empty masks sample as
    /// background.
    pub fn get_clamped(&self, x: i32, y: i32) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let x = x.clamp(0, self.width as i32 - 1) as usize;
        let y = y.clamp(0, self.height as i32 - 1) as usize;
        self.data[y * self.width as usize + x]
    }
}

/// Hermite smoothstep: 0 for `x <= edge0`, 1 for `x >= edge1`, smooth and
/// monotonic in between.
pub fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    if edge0 >= edge1 {
        return if x < edge0 { 0.0 } else { 1.0 };
    }
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

//! Source resizing stage (CPU variant).
//!
//! Scales the source frame down to the inference input resolution and writes
//! normalized RGB floats into the engine's input window. The engine buffer is
//! only touched once the full staging buffer is ready, so a failed resize
//! never leaves a partially written input tensor.

use crate::engine::InferenceEngine;
use crate::foundation::core::{Resolution, SourceFrame};
use crate::foundation::error::{VeilcamError, VeilcamResult};

/// Bilinear-downsample `frame` to `target`, producing channel-interleaved RGB
/// floats in `[0, 1]` (alpha dropped). Output length is exactly
/// `target.width * target.height * 3`.
pub fn resize_to_rgb_f32(frame: &SourceFrame<'_>, target: Resolution) -> Vec<f32> {
    let (src_w, src_h) = (frame.width as usize, frame.height as usize);
    let (dst_w, dst_h) = (target.width as usize, target.height as usize);
    let mut out = vec![0.0f32; dst_w * dst_h * 3];

    let x_ratio = frame.width as f32 / target.width as f32;
    let y_ratio = frame.height as f32 / target.height as f32;

    for dy in 0..dst_h {
        // Pixel-center mapping, clamped to the source interior.
        let sy = ((dy as f32 + 0.5) * y_ratio - 0.5).max(0.0);
        let y0 = (sy as usize).min(src_h - 1);
        let y1 = (y0 + 1).min(src_h - 1);
        let fy = sy - y0 as f32;

        for dx in 0..dst_w {
            let sx = ((dx as f32 + 0.5) * x_ratio - 0.5).max(0.0);
            let x0 = (sx as usize).min(src_w - 1);
            let x1 = (x0 + 1).min(src_w - 1);
            let fx = sx - x0 as f32;

            let base = (dy * dst_w + dx) * 3;
            for c in 0..3 {
                let p00 = frame.rgba[(y0 * src_w + x0) * 4 + c] as f32;
                let p10 = frame.rgba[(y0 * src_w + x1) * 4 + c] as f32;
                let p01 = frame.rgba[(y1 * src_w + x0) * 4 + c] as f32;
                let p11 = frame.rgba[(y1 * src_w + x1) * 4 + c] as f32;
                let top = p00 + (p10 - p00) * fx;
                let bottom = p01 + (p11 - p01) * fx;
                out[base + c] = (top + (bottom - top) * fy) / 255.0;
            }
        }
    }

    out
}

/// Resize the source frame into the engine's input window.
///
/// The engine input tensor must be three-channel; its dimensions define the
/// target resolution.
pub fn write_engine_input(
    frame: &SourceFrame<'_>,
    engine: &mut dyn InferenceEngine,
) -> VeilcamResult<()> {
    let desc = engine.input_desc();
    if desc.channels != 3 {
        return Err(VeilcamError::inference(format!(
            "engine input must have 3 channels, got {}",
            desc.channels
        )));
    }
    let target = Resolution::new(desc.width, desc.height)?;
    let staged = resize_to_rgb_f32(frame, target);

    let offset = engine.input_offset();
    let len = desc.element_count();
    let memory = engine.memory_f32();
    let window = memory
        .get_mut(offset..offset + len)
        .ok_or_else(|| VeilcamError::inference("engine input window out of bounds"))?;
    window.copy_from_slice(&staged);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_output_is_exactly_w_h_3_in_unit_range() {
        let (w, h) = (8u32, 6u32);
        let mut rgba = vec![0u8; (w * h * 4) as usize];
        for (i, px) in rgba.chunks_exact_mut(4).enumerate() {
            px[0] = (i * 7 % 256) as u8;
            px[1] = (i * 13 % 256) as u8;
            px[2] = (i * 29 % 256) as u8;
            px[3] = 255;
        }
        let frame = SourceFrame::new(w, h, &rgba).unwrap();
        let target = Resolution::new(4, 3).unwrap();

        let out = resize_to_rgb_f32(&frame, target);
        assert_eq!(out.len(), 4 * 3 * 3);
        assert!(out.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn solid_color_survives_resize_exactly() {
        let (w, h) = (10u32, 10u32);
        let px = [51u8, 102, 204, 255];
        let rgba: Vec<u8> = px.repeat((w * h) as usize);
        let frame = SourceFrame::new(w, h, &rgba).unwrap();

        let out = resize_to_rgb_f32(&frame, Resolution::new(3, 3).unwrap());
        for rgb in out.chunks_exact(3) {
            assert!((rgb[0] - 51.0 / 255.0).abs() < 1e-6);
            assert!((rgb[1] - 102.0 / 255.0).abs() < 1e-6);
            assert!((rgb[2] - 204.0 / 255.0).abs() < 1e-6);
        }
    }

    #[test]
    fn upscale_is_supported_too() {
        let rgba = [255u8, 0, 0, 255, 0, 0, 255, 255];
        let frame = SourceFrame::new(2, 1, &rgba).unwrap();
        let out = resize_to_rgb_f32(&frame, Resolution::new(4, 2).unwrap());
        assert_eq!(out.len(), 4 * 2 * 3);
        // Left edge stays red, right edge stays blue.
        assert!(out[0] > 0.9);
        assert!(out[(3 * 3) + 2] > 0.9);
    }
}

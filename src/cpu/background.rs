//! Background composition stage (CPU variant).
//!
//! Three modes share one output contract, an opaque RGBA8 frame at display
//! resolution: passthrough, blurred-self background, and replacement image.
//! The image mode adds a light wrap that bleeds blurred background color onto
//! the subject's rim before the final mask composite.

use rayon::prelude::*;

use crate::config::{BackgroundImage, PostProcessingConfig};
use crate::foundation::core::{smoothstep, FrameRgba, MaskBuffer, Resolution, SourceFrame};

/// Passes of the separable blur applied to the replacement image to build the
/// light-wrap source.
const LIGHT_WRAP_BLUR_PASSES: usize = 3;

/// Mapping from output UV space into background image UV space that covers
/// the output while preserving the image's aspect ratio (center crop).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackgroundPlacement {
    pub scale: (f32, f32),
    pub offset: (f32, f32),
}

impl BackgroundPlacement {
    pub fn cover(output: Resolution, image_width: u32, image_height: u32) -> Self {
        let output_ratio = output.aspect_ratio();
        let image_ratio = image_width as f32 / image_height as f32;
        if image_ratio > output_ratio {
            // Image is relatively wider, crop left and right.
            let scale_x = output_ratio / image_ratio;
            Self {
                scale: (scale_x, 1.0),
                offset: ((1.0 - scale_x) * 0.5, 0.0),
            }
        } else {
            // Image is relatively taller, crop top and bottom.
            let scale_y = image_ratio / output_ratio;
            Self {
                scale: (1.0, scale_y),
                offset: (0.0, (1.0 - scale_y) * 0.5),
            }
        }
    }

    fn map(&self, u: f32, v: f32) -> (f32, f32) {
        (
            self.offset.0 + u * self.scale.0,
            self.offset.1 + v * self.scale.1,
        )
    }
}

/// Replacement image resampled to display resolution, with a pre-blurred copy
/// serving as the light-wrap source. Built once per background change, reused
/// every frame.
#[derive(Debug)]
pub struct PreparedBackground {
    pub width: u32,
    pub height: u32,
    /// Packed RGB floats in `[0, 1]` at display resolution.
    pub rgb: Vec<f32>,
    /// Blurred copy of `rgb` for the light wrap.
    pub wrap_rgb: Vec<f32>,
}

fn sample_image_bilinear(image: &BackgroundImage, u: f32, v: f32) -> [f32; 3] {
    let x = (u.clamp(0.0, 1.0) * image.width as f32 - 0.5).max(0.0);
    let y = (v.clamp(0.0, 1.0) * image.height as f32 - 0.5).max(0.0);
    let x0 = (x as usize).min(image.width as usize - 1);
    let y0 = (y as usize).min(image.height as usize - 1);
    let x1 = (x0 + 1).min(image.width as usize - 1);
    let y1 = (y0 + 1).min(image.height as usize - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let w = image.width as usize;
    let mut rgb = [0.0f32; 3];
    for (c, out) in rgb.iter_mut().enumerate() {
        let p00 = image.rgba[(y0 * w + x0) * 4 + c] as f32;
        let p10 = image.rgba[(y0 * w + x1) * 4 + c] as f32;
        let p01 = image.rgba[(y1 * w + x0) * 4 + c] as f32;
        let p11 = image.rgba[(y1 * w + x1) * 4 + c] as f32;
        let top = p00 + (p10 - p00) * fx;
        let bottom = p01 + (p11 - p01) * fx;
        *out = (top + (bottom - top) * fy) / 255.0;
    }
    rgb
}

/// Resample the replacement image to display resolution with cover placement
/// and derive its light-wrap source.
pub fn prepare_background(image: &BackgroundImage, output: Resolution) -> PreparedBackground {
    let placement = BackgroundPlacement::cover(output, image.width, image.height);
    let (out_w, out_h) = (output.width as usize, output.height as usize);

    let mut rgb = vec![0.0f32; out_w * out_h * 3];
    rgb.par_chunks_mut(out_w * 3).enumerate().for_each(|(y, row)| {
        let v = (y as f32 + 0.5) / out_h as f32;
        for x in 0..out_w {
            let u = (x as f32 + 0.5) / out_w as f32;
            let (iu, iv) = placement.map(u, v);
            let px = sample_image_bilinear(image, iu, iv);
            row[x * 3..x * 3 + 3].copy_from_slice(&px);
        }
    });

    let wrap_rgb = super::blur::blur_rgb(&rgb, output.width, output.height, LIGHT_WRAP_BLUR_PASSES);
    PreparedBackground {
        width: output.width,
        height: output.height,
        rgb,
        wrap_rgb,
    }
}

fn to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// No background effect: the source frame copied through unchanged.
pub fn composite_none(frame: &SourceFrame<'_>) -> FrameRgba {
    FrameRgba {
        width: frame.width,
        height: frame.height,
        data: frame.rgba.to_vec(),
    }
}

/// Composite the source frame over its own blurred background.
///
/// `blurred_rgb` is the masked-blur output at frame resolution. Mask coverage
/// is remapped through smoothstep before the mix.
pub fn composite_blur(
    frame: &SourceFrame<'_>,
    blurred_rgb: &[f32],
    mask: &MaskBuffer,
    post: &PostProcessingConfig,
) -> FrameRgba {
    let w = frame.width as usize;
    let (low, high) = post.coverage;
    let mut data = vec![0u8; frame.rgba.len()];

    data.par_chunks_mut(w * 4).enumerate().for_each(|(y, row)| {
        for x in 0..w {
            let person = smoothstep(low, high, mask.data[y * w + x]);
            let src = (y * w + x) * 4;
            let bg = (y * w + x) * 3;
            for c in 0..3 {
                let frame_c = frame.rgba[src + c] as f32 / 255.0;
                let blur_c = blurred_rgb[bg + c];
                row[x * 4 + c] = to_u8(blur_c + (frame_c - blur_c) * person);
            }
            row[x * 4 + 3] = 255;
        }
    });

    FrameRgba {
        width: frame.width,
        height: frame.height,
        data,
    }
}

/// Composite the source frame over a prepared replacement image, with light
/// wrap applied to the subject's rim.
pub fn composite_image(
    frame: &SourceFrame<'_>,
    background: &PreparedBackground,
    mask: &MaskBuffer,
    post: &PostProcessingConfig,
) -> FrameRgba {
    debug_assert_eq!(background.width, frame.width);
    debug_assert_eq!(background.height, frame.height);

    let w = frame.width as usize;
    let (low, high) = post.coverage;
    let light_wrap = post.light_wrap;
    let blend = post.blend_mode;
    let mut data = vec![0u8; frame.rgba.len()];

    data.par_chunks_mut(w * 4).enumerate().for_each(|(y, row)| {
        for x in 0..w {
            let idx = y * w + x;
            let raw = mask.data[idx];
            let person = smoothstep(low, high, raw);
            // Evaluated against the raw mask, full inside the subject's rim
            // and fading linearly toward the mask ceiling.
            let wrap_mask = 1.0 - ((raw - high).max(0.0) / (1.0 - high).max(1.0e-6));

            let src = idx * 4;
            let bg = idx * 3;
            for c in 0..3 {
                let frame_c = frame.rgba[src + c] as f32 / 255.0;
                let wrap = light_wrap * wrap_mask * background.wrap_rgb[bg + c];
                let lit = blend.apply(frame_c, wrap);
                let bg_c = background.rgb[bg + c];
                row[x * 4 + c] = to_u8(bg_c + (lit - bg_c) * person);
            }
            row[x * 4 + 3] = 255;
        }
    });

    FrameRgba {
        width: frame.width,
        height: frame.height,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlendMode;

    fn solid_frame_bytes(w: u32, h: u32, rgb: [u8; 3]) -> Vec<u8> {
        [rgb[0], rgb[1], rgb[2], 255].repeat((w * h) as usize)
    }

    #[test]
    fn cover_placement_crops_the_wider_axis() {
        let output = Resolution::new(16, 9).unwrap();

        // Square image on a 16:9 output, crop top and bottom.
        let p = BackgroundPlacement::cover(output, 100, 100);
        assert_eq!(p.scale.0, 1.0);
        assert!(p.scale.1 < 1.0);
        assert!(p.offset.1 > 0.0);

        // Very wide image, crop left and right.
        let p = BackgroundPlacement::cover(output, 400, 100);
        assert!(p.scale.0 < 1.0);
        assert_eq!(p.scale.1, 1.0);
        assert!(p.offset.0 > 0.0);
    }

    #[test]
    fn composite_none_is_a_passthrough() {
        let rgba = solid_frame_bytes(4, 4, [10, 20, 30]);
        let frame = SourceFrame::new(4, 4, &rgba).unwrap();
        let out = composite_none(&frame);
        assert_eq!(out.data, rgba);
    }

    #[test]
    fn blur_composite_picks_frame_inside_and_blur_outside() {
        let (w, h) = (4u32, 4u32);
        let rgba = solid_frame_bytes(w, h, [255, 0, 0]);
        let frame = SourceFrame::new(w, h, &rgba).unwrap();
        let blurred = vec![0.0f32; (w * h * 3) as usize]; // black background

        let mut mask = MaskBuffer::new(w, h);
        for y in 0..h as usize {
            mask.data[y * w as usize] = 1.0; // first column is person
        }

        let post = PostProcessingConfig::default();
        let out = composite_blur(&frame, &blurred, &mask, &post);

        // Person column keeps the frame color.
        assert_eq!(out.data[0], 255);
        // Background column shows the blurred color.
        assert_eq!(out.data[4], 0);
        // Output is opaque everywhere.
        assert!(out.data.chunks_exact(4).all(|px| px[3] == 255));
    }

    #[test]
    fn image_composite_replaces_background_and_stays_opaque() {
        let (w, h) = (4u32, 4u32);
        let rgba = solid_frame_bytes(w, h, [255, 255, 255]);
        let frame = SourceFrame::new(w, h, &rgba).unwrap();

        let image = BackgroundImage {
            width: w,
            height: h,
            rgba: solid_frame_bytes(w, h, [0, 255, 0]),
        };
        let prepared = prepare_background(&image, Resolution::new(w, h).unwrap());

        let mask = MaskBuffer::new(w, h); // all background
        let post = PostProcessingConfig::default();
        let out = composite_image(&frame, &prepared, &mask, &post);

        for px in out.data.chunks_exact(4) {
            assert_eq!(px[0], 0);
            assert_eq!(px[1], 255);
            assert_eq!(px[2], 0);
            assert_eq!(px[3], 255);
        }
    }

    #[test]
    fn light_wrap_tints_the_subject_rim() {
        let (w, h) = (4u32, 4u32);
        let rgba = solid_frame_bytes(w, h, [40, 40, 40]);
        let frame = SourceFrame::new(w, h, &rgba).unwrap();

        let image = BackgroundImage {
            width: w,
            height: h,
            rgba: solid_frame_bytes(w, h, [255, 255, 255]),
        };
        let prepared = prepare_background(&image, Resolution::new(w, h).unwrap());

        // Rim-valued mask: inside coverage but below the ceiling.
        let mut mask = MaskBuffer::new(w, h);
        mask.data.fill(0.7);

        let post = PostProcessingConfig {
            light_wrap: 0.5,
            blend_mode: BlendMode::LinearDodge,
            ..PostProcessingConfig::default()
        };
        let wrapped = composite_image(&frame, &prepared, &mask, &post);

        let no_wrap = PostProcessingConfig {
            light_wrap: 0.0,
            blend_mode: BlendMode::LinearDodge,
            ..PostProcessingConfig::default()
        };
        let plain = composite_image(&frame, &prepared, &mask, &no_wrap);

        // The wrap only ever brightens toward the background color.
        assert!(wrapped.data[0] > plain.data[0]);
    }

    #[test]
    fn light_wrap_fades_linearly_above_the_coverage_ceiling() {
        let (w, h) = (4u32, 4u32);
        let rgba = solid_frame_bytes(w, h, [40, 40, 40]);
        let frame = SourceFrame::new(w, h, &rgba).unwrap();
        let image = BackgroundImage {
            width: w,
            height: h,
            rgba: solid_frame_bytes(w, h, [255, 255, 255]),
        };
        let prepared = prepare_background(&image, Resolution::new(w, h).unwrap());

        // Raw mask above the ceiling: coverage saturates to 1.0 but the wrap
        // keeps fading on the raw value, (1 - 0.9) / (1 - 0.75) = 0.4 here.
        let mut mask = MaskBuffer::new(w, h);
        mask.data.fill(0.9);

        let post = PostProcessingConfig {
            coverage: (0.5, 0.75),
            light_wrap: 1.0,
            blend_mode: BlendMode::LinearDodge,
            ..PostProcessingConfig::default()
        };
        let wrapped = composite_image(&frame, &prepared, &mask, &post);

        // 40/255 + 0.4 * 1.0, rounded.
        let expected = ((40.0 / 255.0f32 + 0.4).min(1.0) * 255.0).round() as u8;
        assert_eq!(wrapped.data[0], expected);
        assert!(wrapped.data[0] > 40);
    }

    #[test]
    fn full_person_mask_keeps_the_frame() {
        let (w, h) = (4u32, 4u32);
        let rgba = solid_frame_bytes(w, h, [10, 200, 10]);
        let frame = SourceFrame::new(w, h, &rgba).unwrap();
        let image = BackgroundImage {
            width: w,
            height: h,
            rgba: solid_frame_bytes(w, h, [255, 0, 0]),
        };
        let prepared = prepare_background(&image, Resolution::new(w, h).unwrap());

        let mut mask = MaskBuffer::new(w, h);
        mask.data.fill(1.0);
        let post = PostProcessingConfig {
            light_wrap: 0.0,
            ..PostProcessingConfig::default()
        };
        let out = composite_image(&frame, &prepared, &mask, &post);
        assert_eq!(out.data[0], 10);
        assert_eq!(out.data[1], 200);
    }
}

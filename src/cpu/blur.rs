//! Separable 5-tap Gaussian blur (CPU variant), plain and person-mask
//! weighted.
//!
//! The masked variant weighs every tap by `(1 - personMask)` so foreground
//! pixels neither bleed into the background nor get blurred themselves; the
//! weight that masked-out taps would have contributed is refilled from the
//! center color.

use rayon::prelude::*;

use crate::foundation::core::{MaskBuffer, SourceFrame};

/// Binomial-like tap weights of the 9-wide separable kernel (center + 4
/// mirrored offsets).
pub const TAP_WEIGHTS: [f32; 5] = [
    0.227_027_03,
    0.194_594_59,
    0.121_621_62,
    0.054_054_054,
    0.016_216_216,
];

/// Convert the RGBA8 frame to a packed RGB f32 plane in `[0, 1]`.
pub fn frame_to_rgb_f32(frame: &SourceFrame<'_>) -> Vec<f32> {
    frame
        .rgba
        .chunks_exact(4)
        .flat_map(|px| {
            [
                px[0] as f32 / 255.0,
                px[1] as f32 / 255.0,
                px[2] as f32 / 255.0,
            ]
        })
        .collect()
}

fn masked_pass(
    src: &[f32],
    dst: &mut [f32],
    width: usize,
    height: usize,
    mask: &MaskBuffer,
    horizontal: bool,
) {
    dst.par_chunks_mut(width * 3)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..width {
                let center_idx = (y * width + x) * 3;
                let center = [src[center_idx], src[center_idx + 1], src[center_idx + 2]];
                let center_bg = 1.0 - mask.get_clamped(x as i32, y as i32);

                let mut acc = [
                    center[0] * TAP_WEIGHTS[0] * center_bg,
                    center[1] * TAP_WEIGHTS[0] * center_bg,
                    center[2] * TAP_WEIGHTS[0] * center_bg,
                ];
                let mut acc_weight = TAP_WEIGHTS[0] * center_bg;

                for (k, &w) in TAP_WEIGHTS.iter().enumerate().skip(1) {
                    for sign in [-1i32, 1] {
                        let (sx, sy) = if horizontal {
                            (x as i32 + sign * k as i32, y as i32)
                        } else {
                            (x as i32, y as i32 + sign * k as i32)
                        };
                        let cx = sx.clamp(0, width as i32 - 1) as usize;
                        let cy = sy.clamp(0, height as i32 - 1) as usize;
                        let idx = (cy * width + cx) * 3;
                        let bg = 1.0 - mask.get_clamped(sx, sy);
                        let ww = w * bg;
                        acc[0] += src[idx] * ww;
                        acc[1] += src[idx + 1] * ww;
                        acc[2] += src[idx + 2] * ww;
                        acc_weight += ww;
                    }
                }

                // Refill weight lost to masked taps from the center color.
                let refill = 1.0 - acc_weight;
                row[x * 3] = acc[0] + refill * center[0];
                row[x * 3 + 1] = acc[1] + refill * center[1];
                row[x * 3 + 2] = acc[2] + refill * center[2];
            }
        });
}

fn plain_pass(src: &[f32], dst: &mut [f32], width: usize, height: usize, horizontal: bool) {
    dst.par_chunks_mut(width * 3)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..width {
                let center_idx = (y * width + x) * 3;
                let mut acc = [
                    src[center_idx] * TAP_WEIGHTS[0],
                    src[center_idx + 1] * TAP_WEIGHTS[0],
                    src[center_idx + 2] * TAP_WEIGHTS[0],
                ];
                for (k, &w) in TAP_WEIGHTS.iter().enumerate().skip(1) {
                    for sign in [-1i32, 1] {
                        let (sx, sy) = if horizontal {
                            (x as i32 + sign * k as i32, y as i32)
                        } else {
                            (x as i32, y as i32 + sign * k as i32)
                        };
                        let cx = sx.clamp(0, width as i32 - 1) as usize;
                        let cy = sy.clamp(0, height as i32 - 1) as usize;
                        let idx = (cy * width + cx) * 3;
                        acc[0] += src[idx] * w;
                        acc[1] += src[idx + 1] * w;
                        acc[2] += src[idx + 2] * w;
                    }
                }
                row[x * 3] = acc[0];
                row[x * 3 + 1] = acc[1];
                row[x * 3 + 2] = acc[2];
            }
        });
}

/// Mask-weighted separable blur: `passes` iterations of horizontal+vertical.
///
/// The mask is held fixed across passes; only the color plane ping-pongs.
pub fn masked_blur(
    rgb: &[f32],
    width: u32,
    height: u32,
    mask: &MaskBuffer,
    passes: usize,
) -> Vec<f32> {
    let (w, h) = (width as usize, height as usize);
    debug_assert_eq!(rgb.len(), w * h * 3);

    let mut front = rgb.to_vec();
    let mut back = vec![0.0f32; rgb.len()];
    for _ in 0..passes.max(1) {
        masked_pass(&front, &mut back, w, h, mask, true);
        masked_pass(&back, &mut front, w, h, mask, false);
    }
    front
}

/// Plain separable blur of an RGB plane, used to pre-blur background images
/// for the light-wrap source.
pub fn blur_rgb(rgb: &[f32], width: u32, height: u32, passes: usize) -> Vec<f32> {
    let (w, h) = (width as usize, height as usize);
    debug_assert_eq!(rgb.len(), w * h * 3);

    let mut front = rgb.to_vec();
    let mut back = vec![0.0f32; rgb.len()];
    for _ in 0..passes.max(1) {
        plain_pass(&front, &mut back, w, h, true);
        plain_pass(&back, &mut front, w, h, false);
    }
    front
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_weights_sum_to_one() {
        let sum: f32 = TAP_WEIGHTS[0] + 2.0 * TAP_WEIGHTS[1..].iter().sum::<f32>();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn constant_plane_is_blur_invariant() {
        let (w, h) = (8u32, 8u32);
        let rgb = vec![0.4f32; (w * h * 3) as usize];
        let out = blur_rgb(&rgb, w, h, 3);
        for &v in &out {
            assert!((v - 0.4).abs() < 1e-4);
        }
    }

    #[test]
    fn blur_spreads_energy() {
        let (w, h) = (9u32, 9u32);
        let mut rgb = vec![0.0f32; (w * h * 3) as usize];
        let center = ((4 * w + 4) * 3) as usize;
        rgb[center] = 1.0;

        let out = blur_rgb(&rgb, w, h, 1);
        assert!(out[center] < 1.0);
        let neighbor = ((4 * w + 5) * 3) as usize;
        assert!(out[neighbor] > 0.0);
    }

    #[test]
    fn fully_masked_region_is_untouched() {
        let (w, h) = (8u32, 8u32);
        let mut rgb = vec![0.0f32; (w * h * 3) as usize];
        for (i, v) in rgb.iter_mut().enumerate() {
            *v = (i % 7) as f32 / 7.0;
        }
        let mut mask = MaskBuffer::new(w, h);
        mask.data.fill(1.0); // everything is person

        let out = masked_blur(&rgb, w, h, &mask, 2);
        for (a, b) in rgb.iter().zip(out.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn unmasked_region_gets_blurred() {
        let (w, h) = (9u32, 9u32);
        let mut rgb = vec![0.0f32; (w * h * 3) as usize];
        let center = ((4 * w + 4) * 3) as usize;
        rgb[center] = 1.0;
        let mask = MaskBuffer::new(w, h); // all background

        let out = masked_blur(&rgb, w, h, &mask, 1);
        assert!(out[center] < 1.0);
    }
}

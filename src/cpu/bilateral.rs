//! Edge refinement stage (CPU variant): joint bilateral upsampling of the
//! low-resolution mask guided by the full-resolution color frame.
//!
//! The kernel is sub-sampled at a stride derived from `sigma_space`, trading
//! exactness for speed, and the spatial sigma is rescaled to display
//! resolution before use. With smoothing disabled the stage is bypassed in
//! favor of plain bilinear upsampling.

use rayon::prelude::*;

use crate::config::BilateralConfig;
use crate::foundation::core::{MaskBuffer, Resolution, SourceFrame};

pub(crate) const SPARSITY_FACTOR: f32 = 0.66; // Higher is more sparse.

fn gaussian(x: f32, sigma: f32) -> f32 {
    let coeff = -0.5 / (sigma * sigma * 4.0 + 1.0e-6);
    (x * x * coeff).exp()
}

/// Joint bilateral upsample of `mask` to `output` resolution, guided by the
/// color content of `guide`.
pub fn joint_bilateral_upsample(
    mask: &MaskBuffer,
    guide: &SourceFrame<'_>,
    output: Resolution,
    cfg: &BilateralConfig,
) -> MaskBuffer {
    let out_w = output.width as usize;
    let out_h = output.height as usize;
    let guide_w = guide.width as usize;

    // Kernel geometry in mask texels.
    let step = (cfg.sigma_space.sqrt() * SPARSITY_FACTOR).max(1.0);
    let radius = cfg.sigma_space;
    let offset = if step > 1.0 { step * 0.5 } else { 0.0 };

    // Sigma was specified relative to mask resolution; the filter runs at
    // display resolution.
    let ratio_x = output.width as f32 / mask.width as f32;
    let ratio_y = output.height as f32 / mask.height as f32;
    let sigma_texel = cfg.sigma_space * ratio_x.max(ratio_y);

    let guide_rgb = |x: i32, y: i32| -> [f32; 3] {
        let x = x.clamp(0, guide.width as i32 - 1) as usize;
        let y = y.clamp(0, guide.height as i32 - 1) as usize;
        let idx = (y * guide_w + x) * 4;
        [
            guide.rgba[idx] as f32 / 255.0,
            guide.rgba[idx + 1] as f32 / 255.0,
            guide.rgba[idx + 2] as f32 / 255.0,
        ]
    };

    let mut out = MaskBuffer::new(output.width, output.height);
    out.data
        .par_chunks_mut(out_w)
        .enumerate()
        .for_each(|(oy, row)| {
            for (ox, out_px) in row.iter_mut().enumerate() {
                let center_color = guide_rgb(ox as i32, oy as i32);

                // Continuous center position in mask texel space.
                let mx = (ox as f32 + 0.5) / ratio_x - 0.5;
                let my = (oy as f32 + 0.5) / ratio_y - 0.5;

                let mut acc = 0.0f32;
                let mut total_weight = 0.0f32;

                // Subsample kernel space.
                let mut i = -radius + offset;
                while i <= radius {
                    let mut j = -radius + offset;
                    while j <= radius {
                        let sample = mask
                            .get_clamped((mx + j).round() as i32, (my + i).round() as i32);

                        let gx = (ox as f32 + j * ratio_x).round() as i32;
                        let gy = (oy as f32 + i * ratio_y).round() as i32;
                        let sample_color = guide_rgb(gx, gy);

                        let dist = ((j * ratio_x) * (j * ratio_x)
                            + (i * ratio_y) * (i * ratio_y))
                            .sqrt();
                        let color_dist = ((sample_color[0] - center_color[0]).powi(2)
                            + (sample_color[1] - center_color[1]).powi(2)
                            + (sample_color[2] - center_color[2]).powi(2))
                        .sqrt();

                        let weight =
                            gaussian(dist, sigma_texel) * gaussian(color_dist, cfg.sigma_color);
                        total_weight += weight;
                        acc += weight * sample;

                        j += step;
                    }
                    i += step;
                }

                *out_px = if total_weight > 0.0 {
                    acc / total_weight
                } else {
                    mask.get_clamped(mx.round() as i32, my.round() as i32)
                };
            }
        });

    out
}

/// Plain bilinear upsample, used when mask smoothing is disabled.
pub fn bilinear_upsample(mask: &MaskBuffer, output: Resolution) -> MaskBuffer {
    let mut out = MaskBuffer::new(output.width, output.height);
    let out_w = output.width as usize;
    let ratio_x = mask.width as f32 / output.width as f32;
    let ratio_y = mask.height as f32 / output.height as f32;

    out.data
        .par_chunks_mut(out_w)
        .enumerate()
        .for_each(|(oy, row)| {
            let sy = ((oy as f32 + 0.5) * ratio_y - 0.5).max(0.0);
            let y0 = sy.floor() as i32;
            let fy = sy - y0 as f32;
            for (ox, out_px) in row.iter_mut().enumerate() {
                let sx = ((ox as f32 + 0.5) * ratio_x - 0.5).max(0.0);
                let x0 = sx.floor() as i32;
                let fx = sx - x0 as f32;

                let p00 = mask.get_clamped(x0, y0);
                let p10 = mask.get_clamped(x0 + 1, y0);
                let p01 = mask.get_clamped(x0, y0 + 1);
                let p11 = mask.get_clamped(x0 + 1, y0 + 1);
                let top = p00 + (p10 - p00) * fx;
                let bottom = p01 + (p11 - p01) * fx;
                *out_px = top + (bottom - top) * fy;
            }
        });

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(w: u32, h: u32, rgb: [u8; 3]) -> Vec<u8> {
        [rgb[0], rgb[1], rgb[2], 255].repeat((w * h) as usize)
    }

    #[test]
    fn constant_mask_stays_constant() {
        let mut mask = MaskBuffer::new(4, 4);
        mask.data.fill(0.75);
        let rgba = solid_frame(16, 16, [120, 90, 30]);
        let guide = SourceFrame::new(16, 16, &rgba).unwrap();

        let out = joint_bilateral_upsample(
            &mask,
            &guide,
            Resolution::new(16, 16).unwrap(),
            &BilateralConfig {
                sigma_space: 4.0,
                sigma_color: 2.0,
            },
        );
        for &v in &out.data {
            assert!((v - 0.75).abs() < 1e-5);
        }
    }

    #[test]
    fn output_stays_in_unit_range() {
        let mut mask = MaskBuffer::new(4, 4);
        for (i, v) in mask.data.iter_mut().enumerate() {
            *v = (i % 2) as f32;
        }
        let rgba: Vec<u8> = (0..16 * 16)
            .flat_map(|i| [(i * 37 % 256) as u8, (i * 11 % 256) as u8, 0, 255])
            .collect();
        let guide = SourceFrame::new(16, 16, &rgba).unwrap();

        let out = joint_bilateral_upsample(
            &mask,
            &guide,
            Resolution::new(16, 16).unwrap(),
            &BilateralConfig {
                sigma_space: 8.0,
                sigma_color: 2.0,
            },
        );
        assert_eq!(out.data.len(), 16 * 16);
        assert!(out.data.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn color_edge_sharpens_mask_edge() {
        // Left half person (mask 1), right half background (mask 0), with a
        // hard color edge at the same boundary. The filter must not bleed the
        // mask across the color edge.
        let mut mask = MaskBuffer::new(8, 8);
        for y in 0..8 {
            for x in 0..8 {
                mask.data[y * 8 + x] = if x < 4 { 1.0 } else { 0.0 };
            }
        }
        let (w, h) = (32u32, 32u32);
        let mut rgba = vec![0u8; (w * h * 4) as usize];
        for y in 0..h as usize {
            for x in 0..w as usize {
                let idx = (y * w as usize + x) * 4;
                let c = if x < 16 { 250 } else { 10 };
                rgba[idx] = c;
                rgba[idx + 1] = c;
                rgba[idx + 2] = c;
                rgba[idx + 3] = 255;
            }
        }
        let guide = SourceFrame::new(w, h, &rgba).unwrap();

        let out = joint_bilateral_upsample(
            &mask,
            &guide,
            Resolution::new(w, h).unwrap(),
            &BilateralConfig {
                sigma_space: 4.0,
                sigma_color: 0.1,
            },
        );

        // Deep inside each region the mask should be decisive.
        assert!(out.get_clamped(2, 16) > 0.9);
        assert!(out.get_clamped(29, 16) < 0.1);
    }

    #[test]
    fn bilinear_upsample_interpolates() {
        let mut mask = MaskBuffer::new(2, 1);
        mask.data = vec![0.0, 1.0];
        let out = bilinear_upsample(&mask, Resolution::new(8, 1).unwrap());
        assert_eq!(out.data.len(), 8);
        assert!(out.data[0] < 0.1);
        assert!(out.data[7] > 0.9);
        for pair in out.data.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }
}

//! Mask decode stage: raw engine output to a normalized person-probability
//! mask.
//!
//! Two variants, chosen once at construction from the model family:
//! two-channel logits through a max-shifted softmax, or a single-channel
//! probability loaded directly. Per-pixel code never branches on the variant.

use crate::config::ModelVariant;
use crate::engine::InferenceEngine;
use crate::foundation::core::MaskBuffer;
use crate::foundation::error::{VeilcamError, VeilcamResult};

/// Decode algorithm for one model family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaskDecoder {
    /// Two values per pixel: (background logit, person logit).
    Softmax,
    /// One person probability per pixel, already in `[0, 1]`.
    DirectLoad,
}

impl MaskDecoder {
    /// Select the decoder for a model family and verify it against the
    /// engine's output channel count.
    pub fn for_model(model: ModelVariant, output_channels: u32) -> VeilcamResult<Self> {
        let decoder = match model {
            ModelVariant::Meet => MaskDecoder::Softmax,
            ModelVariant::MlKit => MaskDecoder::DirectLoad,
        };
        let expected = match decoder {
            MaskDecoder::Softmax => 2,
            MaskDecoder::DirectLoad => 1,
        };
        if output_channels != expected {
            return Err(VeilcamError::inference(format!(
                "model expects {expected}-channel engine output, got {output_channels}"
            )));
        }
        Ok(decoder)
    }
}

/// Max-shifted two-class softmax. The shift keeps `exp` bounded for large
/// logits; the naive form overflows.
pub fn softmax_probability(background: f32, person: f32) -> f32 {
    let shift = background.max(person);
    let background_exp = (background - shift).exp();
    let person_exp = (person - shift).exp();
    person_exp / (background_exp + person_exp)
}

/// Decode the engine's output window into `mask`.
///
/// `mask` must match the engine output resolution; it is fully overwritten.
pub fn decode_mask(
    engine: &mut dyn InferenceEngine,
    decoder: MaskDecoder,
    mask: &mut MaskBuffer,
) -> VeilcamResult<()> {
    let desc = engine.output_desc();
    if mask.width != desc.width || mask.height != desc.height {
        return Err(VeilcamError::render(format!(
            "mask buffer is {}x{}, engine output is {}x{}",
            mask.width, mask.height, desc.width, desc.height
        )));
    }

    let offset = engine.output_offset();
    let len = desc.element_count();
    let memory = engine.memory_f32();
    let window = memory
        .get(offset..offset + len)
        .ok_or_else(|| VeilcamError::inference("engine output window out of bounds"))?;

    match decoder {
        MaskDecoder::Softmax => {
            for (out, pair) in mask.data.iter_mut().zip(window.chunks_exact(2)) {
                *out = softmax_probability(pair[0], pair[1]);
            }
        }
        MaskDecoder::DirectLoad => {
            for (out, &p) in mask.data.iter_mut().zip(window.iter()) {
                *out = p.clamp(0.0, 1.0);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TensorDesc;

    #[test]
    fn equal_logits_give_exactly_half() {
        assert_eq!(softmax_probability(2.0, 2.0), 0.5);
    }

    #[test]
    fn dominant_person_logit_saturates() {
        let p = softmax_probability(0.0, 10.0);
        assert!((p - 1.0).abs() < 1e-4);
    }

    #[test]
    fn large_logits_do_not_overflow() {
        let p = softmax_probability(1000.0, 1000.0);
        assert!(p.is_finite());
        assert_eq!(p, 0.5);

        let q = softmax_probability(1000.0, 1004.0);
        assert!(q.is_finite());
        assert!(q > 0.98);
    }

    struct PatternEngine {
        memory: Vec<f32>,
        channels: u32,
    }

    impl InferenceEngine for PatternEngine {
        fn input_desc(&self) -> TensorDesc {
            TensorDesc {
                width: 2,
                height: 2,
                channels: 3,
            }
        }

        fn output_desc(&self) -> TensorDesc {
            TensorDesc {
                width: 2,
                height: 2,
                channels: self.channels,
            }
        }

        fn input_offset(&self) -> usize {
            0
        }

        fn output_offset(&self) -> usize {
            12
        }

        fn memory_f32(&mut self) -> &mut [f32] {
            &mut self.memory
        }

        fn load_model(&mut self, _model: &[u8]) -> i32 {
            0
        }

        fn run_inference(&mut self) -> i32 {
            0
        }
    }

    #[test]
    fn softmax_decode_fills_whole_mask() {
        let mut engine = PatternEngine {
            memory: vec![0.0; 20],
            channels: 2,
        };
        // (bg, person) pairs: strongly bg, even, strongly person, even.
        engine.memory[12..20]
            .copy_from_slice(&[5.0, -5.0, 1.0, 1.0, -5.0, 5.0, 0.0, 0.0]);

        let mut mask = MaskBuffer::new(2, 2);
        decode_mask(&mut engine, MaskDecoder::Softmax, &mut mask).unwrap();

        assert!(mask.data[0] < 0.01);
        assert_eq!(mask.data[1], 0.5);
        assert!(mask.data[2] > 0.99);
        assert_eq!(mask.data[3], 0.5);
    }

    #[test]
    fn direct_load_clamps_out_of_range_values() {
        let mut engine = PatternEngine {
            memory: vec![0.0; 16],
            channels: 1,
        };
        engine.memory[12..16].copy_from_slice(&[0.25, 1.5, -0.5, 1.0]);

        let mut mask = MaskBuffer::new(2, 2);
        decode_mask(&mut engine, MaskDecoder::DirectLoad, &mut mask).unwrap();
        assert_eq!(mask.data, vec![0.25, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn decoder_selection_checks_channels() {
        assert_eq!(
            MaskDecoder::for_model(ModelVariant::Meet, 2).unwrap(),
            MaskDecoder::Softmax
        );
        assert!(MaskDecoder::for_model(ModelVariant::Meet, 1).is_err());
        assert_eq!(
            MaskDecoder::for_model(ModelVariant::MlKit, 1).unwrap(),
            MaskDecoder::DirectLoad
        );
    }
}

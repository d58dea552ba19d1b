//! Seam to the external inference engine collaborator.
//!
//! The engine is an opaque module exposing a flat f32-addressable memory
//! region. The pipeline writes normalized input pixels into the input window
//! and reads raw segmentation output from the output window; it never owns the
//! engine, never allocates its memory, and never loads models on its own (an
//! external loader does, keyed by model/backend/resolution).

use crate::config::{InputResolution, ModelVariant};
use crate::foundation::error::{VeilcamError, VeilcamResult};

/// Dimensions and channel count of one engine tensor plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TensorDesc {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl TensorDesc {
    /// Number of f32 elements in the tensor.
    pub fn element_count(self) -> usize {
        (self.width as usize) * (self.height as usize) * (self.channels as usize)
    }
}

/// Handle to an externally owned inference engine.
///
/// Offsets are element indices into [`InferenceEngine::memory_f32`]. Status
/// codes follow the engine's convention: zero is success, anything else is a
/// fault the pipeline must treat as fatal for the frame.
pub trait InferenceEngine: Send {
    /// Input tensor shape (what the resizing stage must produce).
    fn input_desc(&self) -> TensorDesc;

    /// Output tensor shape (what the decode stage consumes).
    fn output_desc(&self) -> TensorDesc;

    /// Element offset of the input tensor inside the memory region.
    fn input_offset(&self) -> usize;

    /// Element offset of the output tensor inside the memory region.
    fn output_offset(&self) -> usize;

    /// The engine's flat f32 memory region.
    fn memory_f32(&mut self) -> &mut [f32];

    /// Copy a model blob into the engine and initialize it.
    fn load_model(&mut self, model: &[u8]) -> i32;

    /// Run one synchronous inference over the current input window.
    fn run_inference(&mut self) -> i32;
}

/// Validate that the engine's memory region actually contains both tensor
/// windows. Called once at pipeline construction.
pub fn validate_engine_windows(engine: &mut dyn InferenceEngine) -> VeilcamResult<()> {
    let input_end = engine
        .input_offset()
        .checked_add(engine.input_desc().element_count())
        .ok_or_else(|| VeilcamError::inference("input window offset overflow"))?;
    let output_end = engine
        .output_offset()
        .checked_add(engine.output_desc().element_count())
        .ok_or_else(|| VeilcamError::inference("output window offset overflow"))?;
    let len = engine.memory_f32().len();
    if input_end > len || output_end > len {
        return Err(VeilcamError::inference(format!(
            "engine memory too small: {len} elements, input ends at {input_end}, output ends at {output_end}"
        )));
    }
    Ok(())
}

/// Run one inference, mapping a non-zero status code to an error.
pub fn run_inference_checked(engine: &mut dyn InferenceEngine) -> VeilcamResult<()> {
    let status = engine.run_inference();
    if status != 0 {
        return Err(VeilcamError::inference(format!(
            "run_inference returned status {status}"
        )));
    }
    Ok(())
}

/// Model blob file name used by the external loader, keyed by model family and
/// input resolution.
pub fn model_file_name(model: ModelVariant, input_resolution: InputResolution) -> &'static str {
    match model {
        ModelVariant::Meet => match input_resolution {
            InputResolution::R96p => "segm_lite_v681",
            _ => "segm_full_v679",
        },
        ModelVariant::MlKit => "selfiesegmentation_mlkit-256x256-2021_01_19-v1215.f16",
    }
}

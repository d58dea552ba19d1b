//! Configuration snapshots consumed by the rendering pipeline.
//!
//! Config values are delivered as immutable snapshots. A *structural* change
//! ([`SegmentationConfig`], background kind) invalidates the live pipeline and
//! requires a rebuild; a *non-structural* change ([`PostProcessingConfig`]) is
//! applied in place through [`crate::pipeline::RenderingPipeline::update_post_processing`].

use crate::foundation::core::Resolution;

/// Segmentation model family. Selects the mask decode variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModelVariant {
    /// Two-channel output (background logit, person logit); softmax decode.
    Meet,
    /// Single-channel person probability; direct-load decode.
    MlKit,
}

/// Execution backend requested for the inference engine collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InferenceBackend {
    Wasm,
    WasmSimd,
}

/// Named inference input resolutions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InputResolution {
    #[serde(rename = "360p")]
    R360p,
    #[serde(rename = "144p")]
    R144p,
    #[serde(rename = "96p")]
    R96p,
}

impl InputResolution {
    /// Pixel dimensions of the named resolution.
    pub fn dimensions(self) -> Resolution {
        let (width, height) = match self {
            InputResolution::R360p => (640, 360),
            InputResolution::R144p => (256, 144),
            InputResolution::R96p => (160, 96),
        };
        Resolution { width, height }
    }
}

/// Which execution strategy renders the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineKind {
    Gpu,
    Cpu,
}

/// Structural pipeline configuration. Changing any field rebuilds the whole
/// pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentationConfig {
    pub model: ModelVariant,
    pub backend: InferenceBackend,
    pub input_resolution: InputResolution,
    pub pipeline: PipelineKind,
}

impl SegmentationConfig {
    /// Return `true` when switching from `self` to `other` invalidates a live
    /// pipeline.
    pub fn requires_rebuild(&self, other: &SegmentationConfig) -> bool {
        self != other
    }
}

/// Foreground/background blend mode for light wrapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlendMode {
    /// `1 - (1 - a) * (1 - b)`
    Screen,
    /// `a + b`
    LinearDodge,
}

impl BlendMode {
    /// Apply the blend to a single channel pair.
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BlendMode::Screen => 1.0 - (1.0 - a) * (1.0 - b),
            BlendMode::LinearDodge => a + b,
        }
    }
}

/// Joint bilateral filter parameters.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BilateralConfig {
    /// Spatial sigma, expressed relative to mask resolution.
    pub sigma_space: f32,
    /// Color sigma, in normalized color distance.
    pub sigma_color: f32,
}

/// Non-structural post-processing parameters, updatable on a live pipeline.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostProcessingConfig {
    /// Run the edge refinement stage; `false` falls back to plain bilinear
    /// mask upsampling.
    pub smooth_mask: bool,
    pub bilateral: BilateralConfig,
    /// `(low, high)` probability thresholds of the soft transition band.
    pub coverage: (f32, f32),
    /// Light wrap intensity in `[0, 1]`.
    pub light_wrap: f32,
    pub blend_mode: BlendMode,
}

impl Default for PostProcessingConfig {
    fn default() -> Self {
        Self {
            smooth_mask: true,
            bilateral: BilateralConfig {
                sigma_space: 8.0,
                sigma_color: 2.0,
            },
            coverage: (0.5, 0.75),
            light_wrap: 0.3,
            blend_mode: BlendMode::Screen,
        }
    }
}

impl PostProcessingConfig {
    /// Validate value ranges.
    pub fn validate(&self) -> crate::foundation::error::VeilcamResult<()> {
        use crate::foundation::error::VeilcamError;
        let (low, high) = self.coverage;
        if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low > high {
            return Err(VeilcamError::validation(
                "coverage must satisfy 0 <= low <= high <= 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.light_wrap) {
            return Err(VeilcamError::validation("light_wrap must be in [0, 1]"));
        }
        if self.bilateral.sigma_space <= 0.0 || self.bilateral.sigma_color <= 0.0 {
            return Err(VeilcamError::validation("bilateral sigmas must be > 0"));
        }
        Ok(())
    }
}

/// Decoded background image handle handed to the composition stage.
#[derive(Clone, Debug, PartialEq)]
pub struct BackgroundImage {
    pub width: u32,
    pub height: u32,
    /// RGBA8 bytes, tightly packed, row-major.
    pub rgba: Vec<u8>,
}

impl BackgroundImage {
    /// Decode an encoded image blob (PNG, JPEG, ...) into an RGBA8 background.
    pub fn decode(bytes: &[u8]) -> crate::foundation::error::VeilcamResult<Self> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| {
                crate::foundation::error::VeilcamError::validation(format!(
                    "background image decode failed: {e}"
                ))
            })?
            .to_rgba8();
        Ok(Self {
            width: img.width(),
            height: img.height(),
            rgba: img.into_raw(),
        })
    }
}

/// Background selection. Changing the kind is structural for the composition
/// stage; the orchestrator treats it as a full rebuild.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum BackgroundConfig {
    #[default]
    None,
    Blur,
    Image(BackgroundImage),
}

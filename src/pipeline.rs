//! Rendering pipeline seam and lifecycle orchestration.
//!
//! A [`RenderingPipeline`] owns every resource it allocates and accounts for
//! them in [`ResourceCounts`]; `clean_up` is idempotent and releases
//! everything in reverse acquisition order. [`PipelineSlot`] serializes
//! config changes: a structural change tears the live pipeline down fully
//! before the replacement is built, a non-structural change is applied in
//! place.

use tracing::{info, warn};

use crate::config::{
    BackgroundConfig, PipelineKind, PostProcessingConfig, SegmentationConfig,
};
use crate::cpu::CpuPipeline;
use crate::engine::InferenceEngine;
use crate::foundation::core::{FrameRgba, Resolution, SourceFrame};
use crate::foundation::error::VeilcamResult;
use crate::stats::FrameTimings;

/// One composited output frame plus its stage timings.
#[derive(Clone, Debug)]
pub struct RenderedFrame {
    pub frame: FrameRgba,
    pub timings: FrameTimings,
}

/// Created/released tally for one resource class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceBalance {
    pub created: u64,
    pub released: u64,
}

impl ResourceBalance {
    pub fn balanced(&self) -> bool {
        self.created == self.released
    }
}

/// Per-class resource accounting for cleanup verification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    pub textures: ResourceBalance,
    pub buffers: ResourceBalance,
    pub pipelines: ResourceBalance,
}

impl ResourceCounts {
    /// `true` once every created resource has been released.
    pub fn balanced(&self) -> bool {
        self.textures.balanced() && self.buffers.balanced() && self.pipelines.balanced()
    }
}

/// What to do when the requested GPU pipeline cannot be constructed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Fall back to the CPU pipeline and log a warning.
    #[default]
    Auto,
    /// Surface the construction error to the caller.
    Strict,
}

/// Pipeline construction parameters that are not part of the config
/// snapshots.
#[derive(Clone, Copy, Debug)]
pub struct PipelineOptions {
    /// Display resolution; every rendered frame has these dimensions.
    pub frame_size: Resolution,
    pub fallback: FallbackPolicy,
}

/// One frame-rendering strategy.
pub trait RenderingPipeline: Send {
    /// The strategy actually running, after any fallback.
    fn kind(&self) -> PipelineKind;

    /// Render one source frame into a composited output frame.
    fn render(
        &mut self,
        frame: &SourceFrame<'_>,
        engine: &mut dyn InferenceEngine,
    ) -> VeilcamResult<RenderedFrame>;

    /// Apply a non-structural post-processing change in place.
    fn update_post_processing(&mut self, post: &PostProcessingConfig) -> VeilcamResult<()>;

    /// Release all owned resources, in reverse acquisition order. Safe to
    /// call more than once; rendering after cleanup is an error.
    fn clean_up(&mut self);

    fn resource_counts(&self) -> ResourceCounts;
}

impl std::fmt::Debug for dyn RenderingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderingPipeline")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

/// Build the pipeline requested by `segmentation.pipeline`, honoring the
/// fallback policy when GPU construction fails.
pub fn build_pipeline(
    segmentation: &SegmentationConfig,
    background: &BackgroundConfig,
    post: &PostProcessingConfig,
    options: &PipelineOptions,
    engine: &mut dyn InferenceEngine,
) -> VeilcamResult<Box<dyn RenderingPipeline>> {
    match segmentation.pipeline {
        PipelineKind::Cpu => {
            let pipeline = CpuPipeline::new(segmentation, background, post, options, engine)?;
            info!(kind = "cpu", "pipeline built");
            Ok(Box::new(pipeline))
        }
        PipelineKind::Gpu => match build_gpu(segmentation, background, post, options, engine) {
            Ok(pipeline) => {
                info!(kind = "gpu", "pipeline built");
                Ok(pipeline)
            }
            Err(err) => match options.fallback {
                FallbackPolicy::Strict => Err(err),
                FallbackPolicy::Auto => {
                    warn!(error = %err, "gpu pipeline unavailable, falling back to cpu");
                    let pipeline =
                        CpuPipeline::new(segmentation, background, post, options, engine)?;
                    Ok(Box::new(pipeline))
                }
            },
        },
    }
}

#[cfg(feature = "gpu")]
fn build_gpu(
    segmentation: &SegmentationConfig,
    background: &BackgroundConfig,
    post: &PostProcessingConfig,
    options: &PipelineOptions,
    engine: &mut dyn InferenceEngine,
) -> VeilcamResult<Box<dyn RenderingPipeline>> {
    let pipeline =
        crate::gpu::GpuPipeline::new(segmentation, background, post, options, engine)?;
    Ok(Box::new(pipeline))
}

#[cfg(not(feature = "gpu"))]
fn build_gpu(
    _segmentation: &SegmentationConfig,
    _background: &BackgroundConfig,
    _post: &PostProcessingConfig,
    _options: &PipelineOptions,
    _engine: &mut dyn InferenceEngine,
) -> VeilcamResult<Box<dyn RenderingPipeline>> {
    Err(crate::foundation::error::VeilcamError::gpu(
        "built without gpu support",
    ))
}

/// Outcome of [`PipelineSlot::apply`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotUpdate {
    /// Structural change: the old pipeline was torn down and a new one built.
    Rebuilt,
    /// Non-structural change applied to the live pipeline.
    Updated,
}

/// Holds the live pipeline together with the config snapshots it was built
/// from, and routes config changes to a rebuild or an in-place update.
pub struct PipelineSlot {
    segmentation: SegmentationConfig,
    background: BackgroundConfig,
    post: PostProcessingConfig,
    options: PipelineOptions,
    pipeline: Box<dyn RenderingPipeline>,
}

impl PipelineSlot {
    pub fn build(
        segmentation: SegmentationConfig,
        background: BackgroundConfig,
        post: PostProcessingConfig,
        options: PipelineOptions,
        engine: &mut dyn InferenceEngine,
    ) -> VeilcamResult<Self> {
        post.validate()?;
        let pipeline = build_pipeline(&segmentation, &background, &post, &options, engine)?;
        Ok(Self {
            segmentation,
            background,
            post,
            options,
            pipeline,
        })
    }

    pub fn kind(&self) -> PipelineKind {
        self.pipeline.kind()
    }

    pub fn pipeline_mut(&mut self) -> &mut dyn RenderingPipeline {
        self.pipeline.as_mut()
    }

    /// Apply new config snapshots. Structural changes (segmentation config or
    /// any background change) complete the teardown of the old pipeline
    /// before the replacement is constructed; post-processing-only changes go
    /// through [`RenderingPipeline::update_post_processing`].
    pub fn apply(
        &mut self,
        segmentation: SegmentationConfig,
        background: BackgroundConfig,
        post: PostProcessingConfig,
        engine: &mut dyn InferenceEngine,
    ) -> VeilcamResult<SlotUpdate> {
        post.validate()?;
        let structural = self.segmentation.requires_rebuild(&segmentation)
            || self.background != background;

        if structural {
            self.pipeline.clean_up();
            self.pipeline =
                build_pipeline(&segmentation, &background, &post, &self.options, engine)?;
            self.segmentation = segmentation;
            self.background = background;
            self.post = post;
            return Ok(SlotUpdate::Rebuilt);
        }

        if self.post != post {
            self.pipeline.update_post_processing(&post)?;
            self.post = post;
        }
        Ok(SlotUpdate::Updated)
    }

    /// Tear the live pipeline down and consume the slot.
    pub fn shutdown(mut self) -> ResourceCounts {
        self.pipeline.clean_up();
        self.pipeline.resource_counts()
    }
}

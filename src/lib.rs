#![forbid(unsafe_code)]

//! Virtual background compositor: segments the person in a video frame and
//! renders them over a blurred or replaced background, on the CPU or on a
//! wgpu device.

pub mod config;
pub mod cpu;
pub mod engine;
pub mod foundation;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod pipeline;
pub mod scheduler;
pub mod stats;

pub use config::{
    BackgroundConfig, BackgroundImage, BilateralConfig, BlendMode, InferenceBackend,
    InputResolution, ModelVariant, PipelineKind, PostProcessingConfig, SegmentationConfig,
};
pub use engine::{model_file_name, InferenceEngine, TensorDesc};
pub use foundation::core::{FrameRgba, MaskBuffer, Resolution, SourceFrame};
pub use foundation::error::{VeilcamError, VeilcamResult};
pub use pipeline::{
    build_pipeline, FallbackPolicy, PipelineOptions, PipelineSlot, RenderedFrame,
    RenderingPipeline, ResourceCounts, SlotUpdate,
};
pub use scheduler::FrameScheduler;
pub use stats::{FrameStats, FrameTimings, StageLabel};

//! GPU execution strategy, available behind the `gpu` feature.

mod context;
mod pipeline;
mod stages;

pub use pipeline::GpuPipeline;

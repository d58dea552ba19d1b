//! CPU execution strategy and its per-stage building blocks.

pub mod background;
pub mod bilateral;
pub mod blur;
pub mod decode;
mod pipeline;
pub mod resize;

pub use pipeline::CpuPipeline;

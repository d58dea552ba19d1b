//! CPU execution strategy: every stage runs on the host, parallelized with
//! rayon where a stage is row-separable.

use crate::config::{
    BackgroundConfig, PipelineKind, PostProcessingConfig, SegmentationConfig,
};
use crate::engine::{run_inference_checked, validate_engine_windows, InferenceEngine, TensorDesc};
use crate::foundation::core::{MaskBuffer, SourceFrame};
use crate::foundation::error::{VeilcamError, VeilcamResult};
use crate::pipeline::{
    PipelineOptions, RenderedFrame, RenderingPipeline, ResourceCounts,
};
use crate::stats::{FrameTimer, StageLabel};

use super::background::{
    composite_blur, composite_image, composite_none, prepare_background, PreparedBackground,
};
use super::bilateral::{bilinear_upsample, joint_bilateral_upsample};
use super::blur::{frame_to_rgb_f32, masked_blur};
use super::decode::{decode_mask, MaskDecoder};
use super::resize::write_engine_input;

/// Separable blur iterations for the blurred-background mode.
const BACKGROUND_BLUR_PASSES: usize = 3;

#[derive(Debug)]
pub struct CpuPipeline {
    options: PipelineOptions,
    background: BackgroundConfig,
    post: PostProcessingConfig,
    decoder: MaskDecoder,
    /// Engine tensor shapes captured at construction; every render checks the
    /// engine still matches.
    input_desc: TensorDesc,
    output_desc: TensorDesc,
    /// Low-resolution decode target, reused across frames.
    mask: MaskBuffer,
    prepared: Option<PreparedBackground>,
    counts: ResourceCounts,
    cleaned: bool,
}

impl CpuPipeline {
    pub fn new(
        segmentation: &SegmentationConfig,
        background: &BackgroundConfig,
        post: &PostProcessingConfig,
        options: &PipelineOptions,
        engine: &mut dyn InferenceEngine,
    ) -> VeilcamResult<Self> {
        post.validate()?;
        validate_engine_windows(engine)?;

        let input_desc = engine.input_desc();
        let expected = segmentation.input_resolution.dimensions();
        if input_desc.width != expected.width || input_desc.height != expected.height {
            return Err(VeilcamError::validation(format!(
                "engine input is {}x{}, segmentation config expects {}x{}",
                input_desc.width, input_desc.height, expected.width, expected.height
            )));
        }

        let output_desc = engine.output_desc();
        let decoder = MaskDecoder::for_model(segmentation.model, output_desc.channels)?;

        let mut counts = ResourceCounts::default();
        let mask = MaskBuffer::new(output_desc.width, output_desc.height);
        counts.buffers.created += 1;

        let prepared = match background {
            BackgroundConfig::Image(image) => {
                let prepared = prepare_background(image, options.frame_size);
                // Resampled plane plus its blurred light-wrap copy.
                counts.buffers.created += 2;
                Some(prepared)
            }
            _ => None,
        };

        Ok(Self {
            options: *options,
            background: background.clone(),
            post: *post,
            decoder,
            input_desc,
            output_desc,
            mask,
            prepared,
            counts,
            cleaned: false,
        })
    }

    fn check_frame(&self, frame: &SourceFrame<'_>) -> VeilcamResult<()> {
        let size = self.options.frame_size;
        if frame.width != size.width || frame.height != size.height {
            return Err(VeilcamError::validation(format!(
                "source frame is {}x{}, pipeline was built for {}x{}",
                frame.width, frame.height, size.width, size.height
            )));
        }
        Ok(())
    }

    fn check_engine(&self, engine: &mut dyn InferenceEngine) -> VeilcamResult<()> {
        if engine.input_desc() != self.input_desc || engine.output_desc() != self.output_desc {
            return Err(VeilcamError::inference(
                "engine tensor shapes changed since pipeline construction",
            ));
        }
        Ok(())
    }
}

impl RenderingPipeline for CpuPipeline {
    fn kind(&self) -> PipelineKind {
        PipelineKind::Cpu
    }

    fn render(
        &mut self,
        frame: &SourceFrame<'_>,
        engine: &mut dyn InferenceEngine,
    ) -> VeilcamResult<RenderedFrame> {
        if self.cleaned {
            return Err(VeilcamError::render("render called after clean_up"));
        }
        self.check_frame(frame)?;

        let mut timer = FrameTimer::start();

        // Passthrough still reports the full span structure so downstream
        // telemetry sees a uniform shape.
        if matches!(self.background, BackgroundConfig::None) {
            timer.checkpoint(StageLabel::Resize);
            timer.checkpoint(StageLabel::Inference);
            let out = composite_none(frame);
            return Ok(RenderedFrame {
                frame: out,
                timings: timer.finish(StageLabel::Composition),
            });
        }

        self.check_engine(engine)?;
        write_engine_input(frame, engine)?;
        timer.checkpoint(StageLabel::Resize);

        run_inference_checked(engine)?;
        timer.checkpoint(StageLabel::Inference);

        decode_mask(engine, self.decoder, &mut self.mask)?;
        let refined = if self.post.smooth_mask {
            joint_bilateral_upsample(
                &self.mask,
                frame,
                self.options.frame_size,
                &self.post.bilateral,
            )
        } else {
            bilinear_upsample(&self.mask, self.options.frame_size)
        };

        let out = match &self.background {
            BackgroundConfig::Blur => {
                let rgb = frame_to_rgb_f32(frame);
                let blurred = masked_blur(
                    &rgb,
                    frame.width,
                    frame.height,
                    &refined,
                    BACKGROUND_BLUR_PASSES,
                );
                composite_blur(frame, &blurred, &refined, &self.post)
            }
            BackgroundConfig::Image(_) => {
                let prepared = self
                    .prepared
                    .as_ref()
                    .ok_or_else(|| VeilcamError::render("background image not prepared"))?;
                composite_image(frame, prepared, &refined, &self.post)
            }
            BackgroundConfig::None => unreachable!("handled above"),
        };

        Ok(RenderedFrame {
            frame: out,
            timings: timer.finish(StageLabel::Composition),
        })
    }

    fn update_post_processing(&mut self, post: &PostProcessingConfig) -> VeilcamResult<()> {
        post.validate()?;
        self.post = *post;
        Ok(())
    }

    fn clean_up(&mut self) {
        if self.cleaned {
            return;
        }
        // Reverse acquisition order: background planes, then the mask buffer.
        if self.prepared.take().is_some() {
            self.counts.buffers.released += 2;
        }
        self.mask = MaskBuffer::new(1, 1);
        self.counts.buffers.released += 1;
        self.cleaned = true;
    }

    fn resource_counts(&self) -> ResourceCounts {
        self.counts
    }
}

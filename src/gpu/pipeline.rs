//! GPU execution strategy: the stages run as render passes on a wgpu device,
//! with readbacks only at the engine input handoff and the final frame.

use crate::config::{
    BackgroundConfig, PipelineKind, PostProcessingConfig, SegmentationConfig,
};
use crate::cpu::background::prepare_background;
use crate::cpu::decode::MaskDecoder;
use crate::engine::{run_inference_checked, validate_engine_windows, InferenceEngine, TensorDesc};
use crate::foundation::core::{FrameRgba, Resolution, SourceFrame};
use crate::foundation::error::{VeilcamError, VeilcamResult};
use crate::pipeline::{PipelineOptions, RenderedFrame, RenderingPipeline, ResourceCounts};
use crate::stats::{FrameTimer, StageLabel};

use super::context::GpuContext;
use super::stages::{
    BlurBackgroundStage, DecodeStage, ImageBackgroundStage, RefineStage, ResizeStage,
};

/// Separable blur iterations for the blurred-background mode.
const BACKGROUND_BLUR_ITERATIONS: usize = 3;

enum BackgroundStage {
    /// Passthrough; no GPU work per frame.
    None,
    Blur(BlurBackgroundStage),
    Image(ImageBackgroundStage),
}

struct StageSet {
    frame_tex: wgpu::Texture,
    resize: ResizeStage,
    decode: DecodeStage,
    mask_tex: wgpu::Texture,
    mask_view: wgpu::TextureView,
    refine: RefineStage,
    refined_tex: wgpu::Texture,
    refined_view: wgpu::TextureView,
    background: BackgroundStage,
    output_tex: wgpu::Texture,
    output_view: wgpu::TextureView,
    output_readback: wgpu::Buffer,
}

pub struct GpuPipeline {
    ctx: GpuContext,
    options: PipelineOptions,
    post: PostProcessingConfig,
    input_desc: TensorDesc,
    output_desc: TensorDesc,
    /// `None` after clean_up, or when the background mode needs no GPU work.
    stages: Option<StageSet>,
    passthrough: bool,
    cleaned: bool,
}

impl GpuPipeline {
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

        let mut ctx = GpuContext::new()?;
        let display = options.frame_size;

        if matches!(background, BackgroundConfig::None) {
            return Ok(Self {
                ctx,
                options: *options,
                post: *post,
                input_desc,
                output_desc,
                stages: None,
                passthrough: true,
                cleaned: false,
            });
        }

        let frame_tex = ctx.create_texture(
            "veilcam_frame",
            display.width,
            display.height,
            wgpu::TextureFormat::Rgba8Unorm,
            wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::TEXTURE_BINDING,
        );
        let frame_view = frame_tex.create_view(&wgpu::TextureViewDescriptor::default());

        let resize = ResizeStage::new(&mut ctx, &frame_view, input_desc);

        let mask_res = Resolution::new(output_desc.width, output_desc.height)?;
        let mask_tex = ctx.create_texture(
            "veilcam_mask",
            mask_res.width,
            mask_res.height,
            wgpu::TextureFormat::R32Float,
            wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST,
        );
        let mask_view = mask_tex.create_view(&wgpu::TextureViewDescriptor::default());
        let decode = match decoder {
            MaskDecoder::Softmax => DecodeStage::softmax(&mut ctx, output_desc),
            MaskDecoder::DirectLoad => DecodeStage::Direct,
        };

        let refined_tex = ctx.create_texture(
            "veilcam_refined_mask",
            display.width,
            display.height,
            wgpu::TextureFormat::R32Float,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        );
        let refined_view = refined_tex.create_view(&wgpu::TextureViewDescriptor::default());
        let refine = RefineStage::new(&mut ctx, &mask_view, &frame_view, mask_res, display, post);

        let background = match background {
            BackgroundConfig::None => BackgroundStage::None,
            BackgroundConfig::Blur => BackgroundStage::Blur(BlurBackgroundStage::new(
                &mut ctx,
                &frame_view,
                &refined_view,
                display,
                post,
                BACKGROUND_BLUR_ITERATIONS,
            )),
            BackgroundConfig::Image(image) => {
                let prepared = prepare_background(image, display);
                BackgroundStage::Image(ImageBackgroundStage::new(
                    &mut ctx,
                    &frame_view,
                    &refined_view,
                    &prepared,
                    post,
                ))
            }
        };

        let output_tex = ctx.create_texture(
            "veilcam_output",
            display.width,
            display.height,
            wgpu::TextureFormat::Rgba8Unorm,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        );
        let output_view = output_tex.create_view(&wgpu::TextureViewDescriptor::default());
        let output_readback = ctx.create_buffer(
            "veilcam_output_readback",
            GpuContext::readback_size(display.width, display.height, 4),
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        );

        Ok(Self {
            ctx,
            options: *options,
            post: *post,
            input_desc,
            output_desc,
            stages: Some(StageSet {
                frame_tex,
                resize,
                decode,
                mask_tex,
                mask_view,
                refine,
                refined_tex,
                refined_view,
                background,
                output_tex,
                output_view,
                output_readback,
            }),
            passthrough: false,
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
}

impl RenderingPipeline for GpuPipeline {
    fn kind(&self) -> PipelineKind {
        PipelineKind::Gpu
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

        if self.passthrough {
            timer.checkpoint(StageLabel::Resize);
            timer.checkpoint(StageLabel::Inference);
            return Ok(RenderedFrame {
                frame: FrameRgba {
                    width: frame.width,
                    height: frame.height,
                    data: frame.rgba.to_vec(),
                },
                timings: timer.finish(StageLabel::Composition),
            });
        }

        if engine.input_desc() != self.input_desc || engine.output_desc() != self.output_desc {
            return Err(VeilcamError::inference(
                "engine tensor shapes changed since pipeline construction",
            ));
        }

        let stages = self
            .stages
            .as_ref()
            .ok_or_else(|| VeilcamError::render("gpu stages missing"))?;

        self.ctx
            .upload_texture(&stages.frame_tex, frame.width, frame.height, 4, frame.rgba);

        // Resize on the GPU, then hand the pixels to the engine.
        let resized = stages.resize.run(&self.ctx)?;
        {
            let offset = engine.input_offset();
            let len = self.input_desc.element_count();
            let memory = engine.memory_f32();
            let window = memory
                .get_mut(offset..offset + len)
                .ok_or_else(|| VeilcamError::inference("engine input window out of bounds"))?;
            for (dst, src) in window.chunks_exact_mut(3).zip(resized.chunks_exact(4)) {
                dst.copy_from_slice(&src[..3]);
            }
        }
        timer.checkpoint(StageLabel::Resize);

        run_inference_checked(engine)?;
        timer.checkpoint(StageLabel::Inference);

        let output_window = {
            let offset = engine.output_offset();
            let len = self.output_desc.element_count();
            let memory = engine.memory_f32();
            memory
                .get(offset..offset + len)
                .ok_or_else(|| VeilcamError::inference("engine output window out of bounds"))?
                .to_vec()
        };
        stages.decode.run(
            &self.ctx,
            self.output_desc,
            &output_window,
            &stages.mask_tex,
            &stages.mask_view,
        );

        stages
            .refine
            .run(&self.ctx, self.post.smooth_mask, &stages.refined_view);

        match &stages.background {
            BackgroundStage::None => {}
            BackgroundStage::Blur(blur) => blur.run(&self.ctx, &stages.output_view),
            BackgroundStage::Image(image) => image.run(&self.ctx, &stages.output_view),
        }

        let data = self.ctx.read_texture(
            &stages.output_tex,
            &stages.output_readback,
            frame.width,
            frame.height,
            4,
        )?;

        Ok(RenderedFrame {
            frame: FrameRgba {
                width: frame.width,
                height: frame.height,
                data,
            },
            timings: timer.finish(StageLabel::Composition),
        })
    }

    fn update_post_processing(&mut self, post: &PostProcessingConfig) -> VeilcamResult<()> {
        post.validate()?;
        self.post = *post;
        if let Some(stages) = &self.stages {
            stages.refine.write_params(&self.ctx, post);
            match &stages.background {
                BackgroundStage::None => {}
                BackgroundStage::Blur(blur) => blur.write_params(&self.ctx, post),
                BackgroundStage::Image(image) => image.write_params(&self.ctx, post),
            }
        }
        Ok(())
    }

    fn clean_up(&mut self) {
        if self.cleaned {
            return;
        }
        if let Some(stages) = self.stages.take() {
            // Reverse acquisition order.
            self.ctx.release_buffer(stages.output_readback);
            self.ctx.release_texture(stages.output_tex);
            match stages.background {
                BackgroundStage::None => {}
                BackgroundStage::Blur(blur) => blur.release(&mut self.ctx),
                BackgroundStage::Image(image) => image.release(&mut self.ctx),
            }
            stages.refine.release(&mut self.ctx);
            self.ctx.release_texture(stages.refined_tex);
            stages.decode.release(&mut self.ctx);
            self.ctx.release_texture(stages.mask_tex);
            stages.resize.release(&mut self.ctx);
            self.ctx.release_texture(stages.frame_tex);
        }
        self.cleaned = true;
    }

    fn resource_counts(&self) -> ResourceCounts {
        self.ctx.counts()
    }
}

use veilcam::{
    build_pipeline, BackgroundConfig, BackgroundImage, FallbackPolicy, InferenceBackend,
    InferenceEngine, InputResolution, ModelVariant, PipelineKind, PipelineOptions, PipelineSlot,
    PostProcessingConfig, Resolution, RenderingPipeline, SegmentationConfig, SlotUpdate,
    SourceFrame, TensorDesc,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Engine that segments the left half of the frame as person.
struct HalfPersonEngine {
    memory: Vec<f32>,
    input: TensorDesc,
    output: TensorDesc,
}

impl HalfPersonEngine {
    fn meet_96p() -> Self {
        let input = TensorDesc {
            width: 160,
            height: 96,
            channels: 3,
        };
        let output = TensorDesc {
            width: 160,
            height: 96,
            channels: 2,
        };
        Self {
            memory: vec![0.0; input.element_count() + output.element_count()],
            input,
            output,
        }
    }
}

impl InferenceEngine for HalfPersonEngine {
    fn input_desc(&self) -> TensorDesc {
        self.input
    }

    fn output_desc(&self) -> TensorDesc {
        self.output
    }

    fn input_offset(&self) -> usize {
        0
    }

    fn output_offset(&self) -> usize {
        self.input.element_count()
    }

    fn memory_f32(&mut self) -> &mut [f32] {
        &mut self.memory
    }

    fn load_model(&mut self, _model: &[u8]) -> i32 {
        0
    }

    fn run_inference(&mut self) -> i32 {
        let offset = self.input.element_count();
        let width = self.output.width as usize;
        for (i, pair) in self.memory[offset..].chunks_exact_mut(2).enumerate() {
            let x = i % width;
            if x < width / 2 {
                pair[0] = -10.0;
                pair[1] = 10.0;
            } else {
                pair[0] = 10.0;
                pair[1] = -10.0;
            }
        }
        0
    }
}

fn cpu_config() -> SegmentationConfig {
    SegmentationConfig {
        model: ModelVariant::Meet,
        backend: InferenceBackend::Wasm,
        input_resolution: InputResolution::R96p,
        pipeline: PipelineKind::Cpu,
    }
}

fn options() -> PipelineOptions {
    PipelineOptions {
        frame_size: Resolution::new(320, 180).unwrap(),
        fallback: FallbackPolicy::Auto,
    }
}

fn solid_frame(rgb: [u8; 3]) -> Vec<u8> {
    [rgb[0], rgb[1], rgb[2], 255].repeat(320 * 180)
}

fn green_image() -> BackgroundImage {
    BackgroundImage {
        width: 320,
        height: 180,
        rgba: [0u8, 255, 0, 255].repeat(320 * 180),
    }
}

#[test]
fn image_background_replaces_only_the_background_half() {
    init_tracing();
    let mut engine = HalfPersonEngine::meet_96p();
    let mut pipeline = build_pipeline(
        &cpu_config(),
        &BackgroundConfig::Image(green_image()),
        &PostProcessingConfig::default(),
        &options(),
        &mut engine,
    )
    .unwrap();

    let rgba = solid_frame([255, 255, 255]);
    let frame = SourceFrame::new(320, 180, &rgba).unwrap();
    let rendered = pipeline.render(&frame, &mut engine).unwrap();

    assert_eq!(rendered.frame.width, 320);
    assert_eq!(rendered.frame.height, 180);
    assert_eq!(rendered.timings.interior_checkpoints(), 2);

    let px = |x: usize, y: usize| {
        let i = (y * 320 + x) * 4;
        [
            rendered.frame.data[i],
            rendered.frame.data[i + 1],
            rendered.frame.data[i + 2],
            rendered.frame.data[i + 3],
        ]
    };

    // Deep inside the person half the frame color survives.
    assert_eq!(px(10, 90), [255, 255, 255, 255]);
    // Deep inside the background half the replacement shows.
    assert_eq!(px(310, 90), [0, 255, 0, 255]);
    // Output is opaque everywhere.
    assert!(rendered.frame.data.chunks_exact(4).all(|p| p[3] == 255));
}

#[test]
fn engine_input_receives_exact_normalized_pixels() {
    let mut engine = HalfPersonEngine::meet_96p();
    let mut pipeline = build_pipeline(
        &cpu_config(),
        &BackgroundConfig::Blur,
        &PostProcessingConfig::default(),
        &options(),
        &mut engine,
    )
    .unwrap();

    let rgba = solid_frame([51, 102, 204]);
    let frame = SourceFrame::new(320, 180, &rgba).unwrap();
    pipeline.render(&frame, &mut engine).unwrap();

    let len = engine.input_desc().element_count();
    let window = &engine.memory_f32()[..len];
    for rgb in window.chunks_exact(3) {
        assert!((rgb[0] - 51.0 / 255.0).abs() < 1e-6);
        assert!((rgb[1] - 102.0 / 255.0).abs() < 1e-6);
        assert!((rgb[2] - 204.0 / 255.0).abs() < 1e-6);
    }
}

#[test]
fn blur_background_keeps_person_and_stays_opaque() {
    let mut engine = HalfPersonEngine::meet_96p();
    let mut pipeline = build_pipeline(
        &cpu_config(),
        &BackgroundConfig::Blur,
        &PostProcessingConfig::default(),
        &options(),
        &mut engine,
    )
    .unwrap();

    // Person half solid red, background half a checkerboard the blur softens.
    let mut rgba = vec![0u8; 320 * 180 * 4];
    for y in 0..180usize {
        for x in 0..320usize {
            let i = (y * 320 + x) * 4;
            if x < 160 {
                rgba[i] = 255;
            } else if (x + y) % 2 == 0 {
                rgba[i] = 255;
                rgba[i + 1] = 255;
                rgba[i + 2] = 255;
            }
            rgba[i + 3] = 255;
        }
    }
    let frame = SourceFrame::new(320, 180, &rgba).unwrap();
    let rendered = pipeline.render(&frame, &mut engine).unwrap();

    let i = (90 * 320 + 10) * 4;
    assert_eq!(&rendered.frame.data[i..i + 4], &[255, 0, 0, 255]);

    // The checkerboard half must be softened toward mid gray.
    let j = (90 * 320 + 310) * 4;
    let r = rendered.frame.data[j];
    assert!(r > 40 && r < 220, "expected blurred value, got {r}");
    assert!(rendered.frame.data.chunks_exact(4).all(|p| p[3] == 255));
}

#[test]
fn none_background_passes_the_frame_through() {
    let mut engine = HalfPersonEngine::meet_96p();
    let mut pipeline = build_pipeline(
        &cpu_config(),
        &BackgroundConfig::None,
        &PostProcessingConfig::default(),
        &options(),
        &mut engine,
    )
    .unwrap();

    let rgba = solid_frame([7, 6, 5]);
    let frame = SourceFrame::new(320, 180, &rgba).unwrap();
    let rendered = pipeline.render(&frame, &mut engine).unwrap();
    assert_eq!(rendered.frame.data, rgba);
    assert_eq!(rendered.timings.interior_checkpoints(), 2);
}

/// The full-size scenario: 640x360 frame, GPU requested with automatic
/// fallback, so it passes on hosts with and without an adapter.
#[test]
fn full_size_render_with_fallback_produces_no_transparent_pixels() {
    init_tracing();
    let mut engine = HalfPersonEngine::meet_96p();
    let mut config = cpu_config();
    config.pipeline = PipelineKind::Gpu;
    let opts = PipelineOptions {
        frame_size: Resolution::new(640, 360).unwrap(),
        fallback: FallbackPolicy::Auto,
    };

    let mut pipeline = build_pipeline(
        &config,
        &BackgroundConfig::Blur,
        &PostProcessingConfig::default(),
        &opts,
        &mut engine,
    )
    .unwrap();

    let rgba = [120u8, 130, 140, 255].repeat(640 * 360);
    let frame = SourceFrame::new(640, 360, &rgba).unwrap();
    let rendered = pipeline.render(&frame, &mut engine).unwrap();

    assert_eq!(rendered.frame.width, 640);
    assert_eq!(rendered.frame.height, 360);
    assert_eq!(rendered.timings.interior_checkpoints(), 2);
    assert!(rendered.frame.data.chunks_exact(4).all(|p| p[3] != 0));
}

#[test]
fn slot_distinguishes_structural_from_in_place_changes() {
    let mut engine = HalfPersonEngine::meet_96p();
    let mut slot = PipelineSlot::build(
        cpu_config(),
        BackgroundConfig::Blur,
        PostProcessingConfig::default(),
        options(),
        &mut engine,
    )
    .unwrap();
    assert_eq!(slot.kind(), PipelineKind::Cpu);

    // Post-processing tweak applies in place.
    let mut post = PostProcessingConfig::default();
    post.light_wrap = 0.1;
    let counts_before = slot.pipeline_mut().resource_counts();
    let update = slot
        .apply(cpu_config(), BackgroundConfig::Blur, post, &mut engine)
        .unwrap();
    assert_eq!(update, SlotUpdate::Updated);
    // In-place updates allocate nothing.
    assert_eq!(slot.pipeline_mut().resource_counts(), counts_before);

    // Background kind change rebuilds.
    let update = slot
        .apply(
            cpu_config(),
            BackgroundConfig::Image(green_image()),
            post,
            &mut engine,
        )
        .unwrap();
    assert_eq!(update, SlotUpdate::Rebuilt);

    // Invalid post config is rejected before touching the pipeline.
    post.coverage = (0.9, 0.1);
    assert!(slot
        .apply(
            cpu_config(),
            BackgroundConfig::Image(green_image()),
            post,
            &mut engine,
        )
        .is_err());
}

#[test]
fn shutdown_releases_every_resource() {
    let mut engine = HalfPersonEngine::meet_96p();
    let mut slot = PipelineSlot::build(
        cpu_config(),
        BackgroundConfig::Image(green_image()),
        PostProcessingConfig::default(),
        options(),
        &mut engine,
    )
    .unwrap();

    let rgba = solid_frame([20, 30, 40]);
    let frame = SourceFrame::new(320, 180, &rgba).unwrap();
    slot.pipeline_mut().render(&frame, &mut engine).unwrap();

    let counts = slot.shutdown();
    assert!(counts.balanced(), "unbalanced resources: {counts:?}");
}

#[cfg(not(feature = "gpu"))]
mod without_gpu_feature {
    use super::*;

    #[test]
    fn auto_fallback_builds_a_cpu_pipeline() {
        init_tracing();
        let mut engine = HalfPersonEngine::meet_96p();
        let mut config = cpu_config();
        config.pipeline = PipelineKind::Gpu;

        let pipeline = build_pipeline(
            &config,
            &BackgroundConfig::Blur,
            &PostProcessingConfig::default(),
            &options(),
            &mut engine,
        )
        .unwrap();
        assert_eq!(pipeline.kind(), PipelineKind::Cpu);
    }

    #[test]
    fn strict_fallback_surfaces_the_gpu_error() {
        let mut engine = HalfPersonEngine::meet_96p();
        let mut config = cpu_config();
        config.pipeline = PipelineKind::Gpu;
        let mut opts = options();
        opts.fallback = FallbackPolicy::Strict;

        let err = build_pipeline(
            &config,
            &BackgroundConfig::Blur,
            &PostProcessingConfig::default(),
            &opts,
            &mut engine,
        )
        .unwrap_err();
        assert!(err.to_string().contains("gpu"));
    }
}

#[cfg(feature = "gpu")]
mod gpu_pipeline {
    use veilcam::{
        build_pipeline, BackgroundConfig, BackgroundImage, FallbackPolicy, InferenceBackend,
        InferenceEngine, InputResolution, ModelVariant, PipelineKind, PipelineOptions,
        PostProcessingConfig, Resolution, RenderingPipeline, SegmentationConfig, SourceFrame,
        TensorDesc,
    };

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

    fn gpu_config() -> SegmentationConfig {
        SegmentationConfig {
            model: ModelVariant::Meet,
            backend: InferenceBackend::Wasm,
            input_resolution: InputResolution::R96p,
            pipeline: PipelineKind::Gpu,
        }
    }

    fn options() -> PipelineOptions {
        PipelineOptions {
            frame_size: Resolution::new(320, 180).unwrap(),
            fallback: FallbackPolicy::Strict,
        }
    }

    /// Build strictly; `None` when the host has no adapter.
    fn try_build(
        background: BackgroundConfig,
        engine: &mut HalfPersonEngine,
    ) -> Option<Box<dyn RenderingPipeline>> {
        match build_pipeline(
            &gpu_config(),
            &background,
            &PostProcessingConfig::default(),
            &options(),
            engine,
        ) {
            Ok(pipeline) => Some(pipeline),
            Err(err) if err.to_string().contains("no gpu adapter") => {
                eprintln!("skipping gpu test: {err}");
                None
            }
            Err(err) => panic!("gpu pipeline construction failed: {err}"),
        }
    }

    #[test]
    fn image_background_composites_on_the_gpu() {
        let mut engine = HalfPersonEngine::meet_96p();
        let background = BackgroundConfig::Image(BackgroundImage {
            width: 320,
            height: 180,
            rgba: [0u8, 255, 0, 255].repeat(320 * 180),
        });
        let Some(mut pipeline) = try_build(background, &mut engine) else {
            return;
        };
        assert_eq!(pipeline.kind(), PipelineKind::Gpu);

        let rgba = [255u8, 255, 255, 255].repeat(320 * 180);
        let frame = SourceFrame::new(320, 180, &rgba).unwrap();
        let rendered = pipeline.render(&frame, &mut engine).unwrap();
        assert_eq!(rendered.frame.width, 320);
        assert_eq!(rendered.timings.interior_checkpoints(), 2);

        let px = |x: usize, y: usize| {
            let i = (y * 320 + x) * 4;
            &rendered.frame.data[i..i + 4]
        };
        // GPU rounding gets a small tolerance.
        let close = |actual: &[u8], expected: [u8; 4]| {
            actual
                .iter()
                .zip(expected.iter())
                .all(|(a, e)| a.abs_diff(*e) <= 3)
        };
        assert!(close(px(10, 90), [255, 255, 255, 255]), "{:?}", px(10, 90));
        assert!(close(px(310, 90), [0, 255, 0, 255]), "{:?}", px(310, 90));

        pipeline.clean_up();
        assert!(pipeline.resource_counts().balanced());
    }

    #[test]
    fn blur_background_renders_and_cleans_up_balanced() {
        let mut engine = HalfPersonEngine::meet_96p();
        let Some(mut pipeline) = try_build(BackgroundConfig::Blur, &mut engine) else {
            return;
        };

        let rgba = [128u8, 64, 32, 255].repeat(320 * 180);
        let frame = SourceFrame::new(320, 180, &rgba).unwrap();
        let rendered = pipeline.render(&frame, &mut engine).unwrap();
        assert!(rendered.frame.data.chunks_exact(4).all(|p| p[3] == 255));

        pipeline.clean_up();
        pipeline.clean_up();
        assert!(pipeline.resource_counts().balanced());
        assert!(pipeline.render(&frame, &mut engine).is_err());
    }
}

//! Render passes of the GPU pipeline.
//!
//! Every stage is a fullscreen-triangle pass over a fixed set of textures, so
//! bind groups are built once at construction and only uniform buffers change
//! afterwards. Float mask textures are read with `textureLoad`, which keeps
//! the pipeline off the float-filtering device feature.

use crate::config::{BlendMode, PostProcessingConfig};
use crate::cpu::background::PreparedBackground;
use crate::cpu::bilateral::SPARSITY_FACTOR;
use crate::engine::TensorDesc;
use crate::foundation::core::Resolution;
use crate::foundation::error::VeilcamResult;

use super::context::GpuContext;

const FULLSCREEN_VS: &str = r#"
struct VsOut {
  @builtin(position) pos: vec4<f32>,
  @location(0) uv: vec2<f32>,
};

@vertex
fn vs(@builtin(vertex_index) vi: u32) -> VsOut {
  var p = array<vec2<f32>, 3>(
    vec2<f32>(-1.0, -1.0),
    vec2<f32>( 3.0, -1.0),
    vec2<f32>(-1.0,  3.0),
  );
  let pos = p[vi];
  var o: VsOut;
  o.pos = vec4<f32>(pos, 0.0, 1.0);
  o.uv = (pos + vec2<f32>(1.0, 1.0)) * 0.5;
  return o;
}
"#;

const RESIZE_FS: &str = r#"
@group(0) @binding(0) var t_frame: texture_2d<f32>;
@group(0) @binding(1) var s_frame: sampler;

@fragment
fn fs(in: VsOut) -> @location(0) vec4<f32> {
  return textureSample(t_frame, s_frame, in.uv);
}
"#;

const SOFTMAX_FS: &str = r#"
@group(0) @binding(0) var t_logits: texture_2d<f32>;

@fragment
fn fs(in: VsOut) -> @location(0) vec4<f32> {
  let logits = textureLoad(t_logits, vec2<i32>(in.pos.xy), 0).rg;
  let shift = max(logits.r, logits.g);
  let bg = exp(logits.r - shift);
  let person = exp(logits.g - shift);
  return vec4<f32>(person / (bg + person), 0.0, 0.0, 1.0);
}
"#;

const BILATERAL_FS: &str = r#"
struct Params {
  sigma_texel: f32,
  sigma_color: f32,
  step: f32,
  radius: f32,
  offset: f32,
  ratio_x: f32,
  ratio_y: f32,
  _pad: f32,
};

@group(0) @binding(0) var t_mask: texture_2d<f32>;
@group(0) @binding(1) var t_guide: texture_2d<f32>;
@group(0) @binding(2) var<uniform> params: Params;

fn gauss(x: f32, sigma: f32) -> f32 {
  let coeff = -0.5 / (sigma * sigma * 4.0 + 1.0e-6);
  return exp(x * x * coeff);
}

@fragment
fn fs(in: VsOut) -> @location(0) vec4<f32> {
  let mask_max = vec2<i32>(textureDimensions(t_mask)) - vec2<i32>(1, 1);
  let guide_max = vec2<i32>(textureDimensions(t_guide)) - vec2<i32>(1, 1);
  let out_px = vec2<i32>(in.pos.xy);
  let center_color = textureLoad(t_guide, clamp(out_px, vec2<i32>(0, 0), guide_max), 0).rgb;

  // Continuous center position in mask texel space.
  let m = in.pos.xy / vec2<f32>(params.ratio_x, params.ratio_y) - vec2<f32>(0.5, 0.5);

  var acc = 0.0;
  var total = 0.0;
  var i = -params.radius + params.offset;
  loop {
    if (i > params.radius) { break; }
    var j = -params.radius + params.offset;
    loop {
      if (j > params.radius) { break; }
      let mc = clamp(vec2<i32>(round(m + vec2<f32>(j, i))), vec2<i32>(0, 0), mask_max);
      let sample = textureLoad(t_mask, mc, 0).r;

      let gf = vec2<f32>(in.pos.xy - vec2<f32>(0.5, 0.5))
        + vec2<f32>(j * params.ratio_x, i * params.ratio_y);
      let gc = clamp(vec2<i32>(round(gf)), vec2<i32>(0, 0), guide_max);
      let sample_color = textureLoad(t_guide, gc, 0).rgb;

      let dist = length(vec2<f32>(j * params.ratio_x, i * params.ratio_y));
      let color_dist = distance(sample_color, center_color);
      let w = gauss(dist, params.sigma_texel) * gauss(color_dist, params.sigma_color);
      total = total + w;
      acc = acc + w * sample;
      j = j + params.step;
    }
    i = i + params.step;
  }

  var out = 0.0;
  if (total > 0.0) {
    out = acc / total;
  } else {
    out = textureLoad(t_mask, clamp(vec2<i32>(round(m)), vec2<i32>(0, 0), mask_max), 0).r;
  }
  return vec4<f32>(out, 0.0, 0.0, 1.0);
}
"#;

const UPSAMPLE_FS: &str = r#"
struct Params {
  out_size: vec2<f32>,
  _pad: vec2<f32>,
};

@group(0) @binding(0) var t_mask: texture_2d<f32>;
@group(0) @binding(1) var<uniform> params: Params;

@fragment
fn fs(in: VsOut) -> @location(0) vec4<f32> {
  let dims = vec2<f32>(textureDimensions(t_mask));
  let mask_max = vec2<i32>(dims) - vec2<i32>(1, 1);
  let s = max(in.pos.xy * dims / params.out_size - vec2<f32>(0.5, 0.5), vec2<f32>(0.0, 0.0));
  let p0 = vec2<i32>(floor(s));
  let f = s - floor(s);

  let p00 = textureLoad(t_mask, clamp(p0, vec2<i32>(0, 0), mask_max), 0).r;
  let p10 = textureLoad(t_mask, clamp(p0 + vec2<i32>(1, 0), vec2<i32>(0, 0), mask_max), 0).r;
  let p01 = textureLoad(t_mask, clamp(p0 + vec2<i32>(0, 1), vec2<i32>(0, 0), mask_max), 0).r;
  let p11 = textureLoad(t_mask, clamp(p0 + vec2<i32>(1, 1), vec2<i32>(0, 0), mask_max), 0).r;
  let top = mix(p00, p10, f.x);
  let bottom = mix(p01, p11, f.x);
  return vec4<f32>(mix(top, bottom, f.y), 0.0, 0.0, 1.0);
}
"#;

const BLUR_FS: &str = r#"
struct Params {
  uv_step: vec2<f32>,
  px_step: vec2<f32>,
};

@group(0) @binding(0) var t_color: texture_2d<f32>;
@group(0) @binding(1) var s_color: sampler;
@group(0) @binding(2) var t_mask: texture_2d<f32>;
@group(0) @binding(3) var<uniform> params: Params;

@fragment
fn fs(in: VsOut) -> @location(0) vec4<f32> {
  var weights = array<f32, 5>(0.2270270270, 0.1945945946, 0.1216216216, 0.0540540541, 0.0162162162);
  let mask_max = vec2<i32>(textureDimensions(t_mask)) - vec2<i32>(1, 1);
  let cc = vec2<i32>(in.pos.xy);

  let center = textureSample(t_color, s_color, in.uv).rgb;
  let center_bg = 1.0 - textureLoad(t_mask, clamp(cc, vec2<i32>(0, 0), mask_max), 0).r;

  var acc = center * weights[0] * center_bg;
  var acc_w = weights[0] * center_bg;
  for (var k = 1; k < 5; k = k + 1) {
    for (var s = -1; s <= 1; s = s + 2) {
      let uv = in.uv + params.uv_step * f32(k * s);
      let mc = clamp(cc + vec2<i32>(params.px_step) * k * s, vec2<i32>(0, 0), mask_max);
      let bg = 1.0 - textureLoad(t_mask, mc, 0).r;
      let w = weights[k] * bg;
      acc = acc + textureSample(t_color, s_color, uv).rgb * w;
      acc_w = acc_w + w;
    }
  }
  // Refill weight lost to masked taps from the center color.
  return vec4<f32>(acc + (1.0 - acc_w) * center, 1.0);
}
"#;

const COVERAGE_FN: &str = r#"
fn coverage_mask(low: f32, high: f32, x: f32) -> f32 {
  if (low >= high) {
    if (x < low) { return 0.0; }
    return 1.0;
  }
  let t = clamp((x - low) / (high - low), 0.0, 1.0);
  return t * t * (3.0 - 2.0 * t);
}
"#;

const BLUR_COMPOSITE_FS: &str = r#"
struct Params {
  coverage: vec2<f32>,
  _pad: vec2<f32>,
};

@group(0) @binding(0) var t_frame: texture_2d<f32>;
@group(0) @binding(1) var s_frame: sampler;
@group(0) @binding(2) var t_blur: texture_2d<f32>;
@group(0) @binding(3) var t_mask: texture_2d<f32>;
@group(0) @binding(4) var<uniform> params: Params;

@fragment
fn fs(in: VsOut) -> @location(0) vec4<f32> {
  let cc = vec2<i32>(in.pos.xy);
  let person = coverage_mask(params.coverage.x, params.coverage.y, textureLoad(t_mask, cc, 0).r);
  let frame = textureSample(t_frame, s_frame, in.uv).rgb;
  let blurred = textureLoad(t_blur, cc, 0).rgb;
  return vec4<f32>(mix(blurred, frame, person), 1.0);
}
"#;

const IMAGE_COMPOSITE_FS: &str = r#"
struct Params {
  coverage: vec2<f32>,
  light_wrap: f32,
  blend_mode: f32,
};

@group(0) @binding(0) var t_frame: texture_2d<f32>;
@group(0) @binding(1) var s_frame: sampler;
@group(0) @binding(2) var t_background: texture_2d<f32>;
@group(0) @binding(3) var t_wrap: texture_2d<f32>;
@group(0) @binding(4) var t_mask: texture_2d<f32>;
@group(0) @binding(5) var<uniform> params: Params;

@fragment
fn fs(in: VsOut) -> @location(0) vec4<f32> {
  let cc = vec2<i32>(in.pos.xy);
  let raw = textureLoad(t_mask, cc, 0).r;
  let person = coverage_mask(params.coverage.x, params.coverage.y, raw);
  let wrap_mask = 1.0 - max(0.0, raw - params.coverage.y) / max(1.0 - params.coverage.y, 1.0e-6);

  let frame = textureSample(t_frame, s_frame, in.uv).rgb;
  let background = textureLoad(t_background, cc, 0).rgb;
  let wrap = params.light_wrap * wrap_mask * textureLoad(t_wrap, cc, 0).rgb;

  let screen = vec3<f32>(1.0, 1.0, 1.0) - (vec3<f32>(1.0, 1.0, 1.0) - frame) * (vec3<f32>(1.0, 1.0, 1.0) - wrap);
  let dodge = frame + wrap;
  let lit = select(screen, dodge, params.blend_mode > 0.5);

  return vec4<f32>(mix(background, lit, person), 1.0);
}
"#;

pub(super) fn texture_entry(binding: u32, filterable: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            multisampled: false,
            view_dimension: wgpu::TextureViewDimension::D2,
            sample_type: wgpu::TextureSampleType::Float { filterable },
        },
        count: None,
    }
}

pub(super) fn sampler_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
        count: None,
    }
}

pub(super) fn uniform_entry(binding: u32, size: u64) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: std::num::NonZeroU64::new(size),
        },
        count: None,
    }
}

/// One fullscreen-triangle render pass.
pub(super) struct Pass {
    pub pipeline: wgpu::RenderPipeline,
    pub layout: wgpu::BindGroupLayout,
}

impl Pass {
    pub fn new(
        ctx: &mut GpuContext,
        label: &str,
        fragment: &str,
        entries: &[wgpu::BindGroupLayoutEntry],
        format: wgpu::TextureFormat,
    ) -> Self {
        let device = &ctx.device;
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(label),
            entries,
        });

        let source = format!("{FULLSCREEN_VS}\n{COVERAGE_FN}\n{fragment}");
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });

        ctx.note_pipeline_created();
        Self { pipeline, layout }
    }

    pub fn encode(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        target: &wgpu::TextureView,
        bind_group: &wgpu::BindGroup,
    ) {
        let mut rp = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: None,
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target,
                resolve_target: None,
                depth_slice: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        rp.set_pipeline(&self.pipeline);
        rp.set_bind_group(0, bind_group, &[]);
        rp.draw(0..3, 0..1);
    }
}

pub(super) fn linear_sampler(device: &wgpu::Device, label: &str) -> wgpu::Sampler {
    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some(label),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: wgpu::FilterMode::Linear,
        min_filter: wgpu::FilterMode::Linear,
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    })
}

fn f32s_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Downscales the source frame to engine input resolution and reads the
/// pixels back for the engine's input window.
pub(super) struct ResizeStage {
    pass: Pass,
    bind_group: wgpu::BindGroup,
    target: wgpu::Texture,
    target_view: wgpu::TextureView,
    readback: wgpu::Buffer,
    width: u32,
    height: u32,
}

impl ResizeStage {
    pub fn new(
        ctx: &mut GpuContext,
        frame_view: &wgpu::TextureView,
        input: TensorDesc,
    ) -> Self {
        let pass = Pass::new(
            ctx,
            "veilcam_resize",
            RESIZE_FS,
            &[texture_entry(0, true), sampler_entry(1)],
            wgpu::TextureFormat::Rgba32Float,
        );
        let target = ctx.create_texture(
            "veilcam_resize_target",
            input.width,
            input.height,
            wgpu::TextureFormat::Rgba32Float,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        );
        let target_view = target.create_view(&wgpu::TextureViewDescriptor::default());
        let readback = ctx.create_buffer(
            "veilcam_resize_readback",
            GpuContext::readback_size(input.width, input.height, 16),
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        );

        let sampler = linear_sampler(&ctx.device, "veilcam_resize_sampler");
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("veilcam_resize_bg"),
            layout: &pass.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(frame_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
            ],
        });

        Self {
            pass,
            bind_group,
            target,
            target_view,
            readback,
            width: input.width,
            height: input.height,
        }
    }

    /// Run the pass and return RGBA floats at input resolution.
    pub fn run(&self, ctx: &GpuContext) -> VeilcamResult<Vec<f32>> {
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("veilcam_resize_encoder"),
            });
        self.pass.encode(&mut encoder, &self.target_view, &self.bind_group);
        ctx.queue.submit(Some(encoder.finish()));

        let bytes = ctx.read_texture(&self.target, &self.readback, self.width, self.height, 16)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    pub fn release(self, ctx: &mut GpuContext) {
        ctx.release_buffer(self.readback);
        ctx.release_texture(self.target);
        ctx.note_pipeline_released();
    }
}

/// Turns the engine's raw output into the low-resolution mask texture.
pub(super) enum DecodeStage {
    /// Two-channel logits uploaded and pushed through a softmax pass.
    Softmax {
        pass: Pass,
        bind_group: wgpu::BindGroup,
        logits: wgpu::Texture,
    },
    /// Single-channel probabilities uploaded straight into the mask texture.
    Direct,
}

impl DecodeStage {
    pub fn softmax(ctx: &mut GpuContext, output: TensorDesc) -> Self {
        let pass = Pass::new(
            ctx,
            "veilcam_softmax",
            SOFTMAX_FS,
            &[texture_entry(0, false)],
            wgpu::TextureFormat::R32Float,
        );
        let logits = ctx.create_texture(
            "veilcam_logits",
            output.width,
            output.height,
            wgpu::TextureFormat::Rg32Float,
            wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::TEXTURE_BINDING,
        );
        let logits_view = logits.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("veilcam_softmax_bg"),
            layout: &pass.layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::TextureView(&logits_view),
            }],
        });
        DecodeStage::Softmax {
            pass,
            bind_group,
            logits,
        }
    }

    /// Upload the engine output window and produce the mask in `mask_view`.
    pub fn run(
        &self,
        ctx: &GpuContext,
        output: TensorDesc,
        window: &[f32],
        mask: &wgpu::Texture,
        mask_view: &wgpu::TextureView,
    ) {
        let bytes = f32s_to_bytes(window);
        match self {
            DecodeStage::Softmax {
                pass,
                bind_group,
                logits,
            } => {
                ctx.upload_texture(logits, output.width, output.height, 8, &bytes);
                let mut encoder =
                    ctx.device
                        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                            label: Some("veilcam_softmax_encoder"),
                        });
                pass.encode(&mut encoder, mask_view, bind_group);
                ctx.queue.submit(Some(encoder.finish()));
            }
            DecodeStage::Direct => {
                ctx.upload_texture(mask, output.width, output.height, 4, &bytes);
            }
        }
    }

    pub fn release(self, ctx: &mut GpuContext) {
        if let DecodeStage::Softmax { logits, .. } = self {
            ctx.release_texture(logits);
            ctx.note_pipeline_released();
        }
    }
}

/// Upscales the low-resolution mask to display resolution, either through the
/// joint bilateral filter or plain bilinear when smoothing is off.
pub(super) struct RefineStage {
    smooth_pass: Pass,
    smooth_bind_group: wgpu::BindGroup,
    smooth_params: wgpu::Buffer,
    bypass_pass: Pass,
    bypass_bind_group: wgpu::BindGroup,
    bypass_params: wgpu::Buffer,
    mask_res: Resolution,
    display_res: Resolution,
}

impl RefineStage {
    pub fn new(
        ctx: &mut GpuContext,
        mask_view: &wgpu::TextureView,
        frame_view: &wgpu::TextureView,
        mask_res: Resolution,
        display_res: Resolution,
        post: &PostProcessingConfig,
    ) -> Self {
        let smooth_pass = Pass::new(
            ctx,
            "veilcam_bilateral",
            BILATERAL_FS,
            &[
                texture_entry(0, false),
                texture_entry(1, false),
                uniform_entry(2, 32),
            ],
            wgpu::TextureFormat::R32Float,
        );
        let smooth_params = ctx.create_buffer(
            "veilcam_bilateral_params",
            32,
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        );
        let smooth_bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("veilcam_bilateral_bg"),
            layout: &smooth_pass.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(mask_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(frame_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: smooth_params.as_entire_binding(),
                },
            ],
        });

        let bypass_pass = Pass::new(
            ctx,
            "veilcam_upsample",
            UPSAMPLE_FS,
            &[texture_entry(0, false), uniform_entry(1, 16)],
            wgpu::TextureFormat::R32Float,
        );
        let bypass_params = ctx.create_buffer(
            "veilcam_upsample_params",
            16,
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        );
        let bypass_bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("veilcam_upsample_bg"),
            layout: &bypass_pass.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(mask_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: bypass_params.as_entire_binding(),
                },
            ],
        });

        let stage = Self {
            smooth_pass,
            smooth_bind_group,
            smooth_params,
            bypass_pass,
            bypass_bind_group,
            bypass_params,
            mask_res,
            display_res,
        };
        stage.write_params(ctx, post);
        stage
    }

    /// Push current post-processing parameters into the uniform buffers.
    pub fn write_params(&self, ctx: &GpuContext, post: &PostProcessingConfig) {
        let cfg = post.bilateral;
        let step = (cfg.sigma_space.sqrt() * SPARSITY_FACTOR).max(1.0);
        let offset = if step > 1.0 { step * 0.5 } else { 0.0 };
        let ratio_x = self.display_res.width as f32 / self.mask_res.width as f32;
        let ratio_y = self.display_res.height as f32 / self.mask_res.height as f32;
        let sigma_texel = cfg.sigma_space * ratio_x.max(ratio_y);

        let params = [
            sigma_texel,
            cfg.sigma_color,
            step,
            cfg.sigma_space,
            offset,
            ratio_x,
            ratio_y,
            0.0,
        ];
        ctx.queue
            .write_buffer(&self.smooth_params, 0, &f32s_to_bytes(&params));

        let bypass = [
            self.display_res.width as f32,
            self.display_res.height as f32,
            0.0,
            0.0,
        ];
        ctx.queue
            .write_buffer(&self.bypass_params, 0, &f32s_to_bytes(&bypass));
    }

    pub fn run(&self, ctx: &GpuContext, smooth: bool, target: &wgpu::TextureView) {
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("veilcam_refine_encoder"),
            });
        if smooth {
            self.smooth_pass
                .encode(&mut encoder, target, &self.smooth_bind_group);
        } else {
            self.bypass_pass
                .encode(&mut encoder, target, &self.bypass_bind_group);
        }
        ctx.queue.submit(Some(encoder.finish()));
    }

    pub fn release(self, ctx: &mut GpuContext) {
        ctx.release_buffer(self.bypass_params);
        ctx.note_pipeline_released();
        ctx.release_buffer(self.smooth_params);
        ctx.note_pipeline_released();
    }
}

/// Masked background blur followed by the coverage composite.
pub(super) struct BlurBackgroundStage {
    blur_pass: Pass,
    params_h: wgpu::Buffer,
    params_v: wgpu::Buffer,
    ping: wgpu::Texture,
    pong: wgpu::Texture,
    bg_frame_h: wgpu::BindGroup,
    bg_ping_v: wgpu::BindGroup,
    bg_pong_h: wgpu::BindGroup,
    composite_pass: Pass,
    composite_bind_group: wgpu::BindGroup,
    composite_params: wgpu::Buffer,
    iterations: usize,
}

impl BlurBackgroundStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: &mut GpuContext,
        frame_view: &wgpu::TextureView,
        refined_view: &wgpu::TextureView,
        display_res: Resolution,
        post: &PostProcessingConfig,
        iterations: usize,
    ) -> Self {
        let blur_pass = Pass::new(
            ctx,
            "veilcam_blur",
            BLUR_FS,
            &[
                texture_entry(0, true),
                sampler_entry(1),
                texture_entry(2, false),
                uniform_entry(3, 16),
            ],
            wgpu::TextureFormat::Rgba8Unorm,
        );

        let make_target = |ctx: &mut GpuContext, label: &str| {
            ctx.create_texture(
                label,
                display_res.width,
                display_res.height,
                wgpu::TextureFormat::Rgba8Unorm,
                wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            )
        };
        let ping = make_target(ctx, "veilcam_blur_ping");
        let pong = make_target(ctx, "veilcam_blur_pong");
        let ping_view = ping.create_view(&wgpu::TextureViewDescriptor::default());
        let pong_view = pong.create_view(&wgpu::TextureViewDescriptor::default());

        let params_h = ctx.create_buffer(
            "veilcam_blur_params_h",
            16,
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        );
        let params_v = ctx.create_buffer(
            "veilcam_blur_params_v",
            16,
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        );
        let h = [1.0 / display_res.width as f32, 0.0, 1.0, 0.0];
        let v = [0.0, 1.0 / display_res.height as f32, 0.0, 1.0];
        ctx.queue.write_buffer(&params_h, 0, &f32s_to_bytes(&h));
        ctx.queue.write_buffer(&params_v, 0, &f32s_to_bytes(&v));

        let sampler = linear_sampler(&ctx.device, "veilcam_blur_sampler");
        let make_bind_group = |ctx: &GpuContext, src: &wgpu::TextureView, params: &wgpu::Buffer| {
            ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("veilcam_blur_bg"),
                layout: &blur_pass.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(src),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Sampler(&sampler),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: wgpu::BindingResource::TextureView(refined_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: params.as_entire_binding(),
                    },
                ],
            })
        };
        let bg_frame_h = make_bind_group(ctx, frame_view, &params_h);
        let bg_ping_v = make_bind_group(ctx, &ping_view, &params_v);
        let bg_pong_h = make_bind_group(ctx, &pong_view, &params_h);

        let composite_pass = Pass::new(
            ctx,
            "veilcam_blur_composite",
            BLUR_COMPOSITE_FS,
            &[
                texture_entry(0, true),
                sampler_entry(1),
                texture_entry(2, false),
                texture_entry(3, false),
                uniform_entry(4, 16),
            ],
            wgpu::TextureFormat::Rgba8Unorm,
        );
        let composite_params = ctx.create_buffer(
            "veilcam_blur_composite_params",
            16,
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        );
        let composite_bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("veilcam_blur_composite_bg"),
            layout: &composite_pass.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(frame_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&pong_view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(refined_view),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: composite_params.as_entire_binding(),
                },
            ],
        });

        let stage = Self {
            blur_pass,
            params_h,
            params_v,
            ping,
            pong,
            bg_frame_h,
            bg_ping_v,
            bg_pong_h,
            composite_pass,
            composite_bind_group,
            composite_params,
            iterations,
        };
        stage.write_params(ctx, post);
        stage
    }

    pub fn write_params(&self, ctx: &GpuContext, post: &PostProcessingConfig) {
        let params = [post.coverage.0, post.coverage.1, 0.0, 0.0];
        ctx.queue
            .write_buffer(&self.composite_params, 0, &f32s_to_bytes(&params));
    }

    pub fn run(&self, ctx: &GpuContext, output: &wgpu::TextureView) {
        let ping_view = self.ping.create_view(&wgpu::TextureViewDescriptor::default());
        let pong_view = self.pong.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("veilcam_blur_encoder"),
            });

        // frame -> ping -> pong, then pong -> ping -> pong per extra
        // iteration; the composite reads from pong.
        self.blur_pass.encode(&mut encoder, &ping_view, &self.bg_frame_h);
        self.blur_pass.encode(&mut encoder, &pong_view, &self.bg_ping_v);
        for _ in 1..self.iterations.max(1) {
            self.blur_pass.encode(&mut encoder, &ping_view, &self.bg_pong_h);
            self.blur_pass.encode(&mut encoder, &pong_view, &self.bg_ping_v);
        }
        self.composite_pass
            .encode(&mut encoder, output, &self.composite_bind_group);
        ctx.queue.submit(Some(encoder.finish()));
    }

    pub fn release(self, ctx: &mut GpuContext) {
        ctx.release_buffer(self.composite_params);
        ctx.note_pipeline_released();
        ctx.release_buffer(self.params_v);
        ctx.release_buffer(self.params_h);
        ctx.release_texture(self.pong);
        ctx.release_texture(self.ping);
        ctx.note_pipeline_released();
    }
}

fn rgb_plane_to_rgba8(rgb: &[f32]) -> Vec<u8> {
    rgb.chunks_exact(3)
        .flat_map(|px| {
            [
                (px[0].clamp(0.0, 1.0) * 255.0).round() as u8,
                (px[1].clamp(0.0, 1.0) * 255.0).round() as u8,
                (px[2].clamp(0.0, 1.0) * 255.0).round() as u8,
                255,
            ]
        })
        .collect()
}

/// Replacement-image composite with light wrap.
pub(super) struct ImageBackgroundStage {
    pass: Pass,
    bind_group: wgpu::BindGroup,
    params: wgpu::Buffer,
    background: wgpu::Texture,
    wrap: wgpu::Texture,
}

impl ImageBackgroundStage {
    pub fn new(
        ctx: &mut GpuContext,
        frame_view: &wgpu::TextureView,
        refined_view: &wgpu::TextureView,
        prepared: &PreparedBackground,
        post: &PostProcessingConfig,
    ) -> Self {
        let pass = Pass::new(
            ctx,
            "veilcam_image_composite",
            IMAGE_COMPOSITE_FS,
            &[
                texture_entry(0, true),
                sampler_entry(1),
                texture_entry(2, false),
                texture_entry(3, false),
                texture_entry(4, false),
                uniform_entry(5, 16),
            ],
            wgpu::TextureFormat::Rgba8Unorm,
        );

        let make_upload = |ctx: &mut GpuContext, label: &str, rgb: &[f32]| {
            let texture = ctx.create_texture(
                label,
                prepared.width,
                prepared.height,
                wgpu::TextureFormat::Rgba8Unorm,
                wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::TEXTURE_BINDING,
            );
            ctx.upload_texture(
                &texture,
                prepared.width,
                prepared.height,
                4,
                &rgb_plane_to_rgba8(rgb),
            );
            texture
        };
        let background = make_upload(ctx, "veilcam_background", &prepared.rgb);
        let wrap = make_upload(ctx, "veilcam_background_wrap", &prepared.wrap_rgb);
        let background_view = background.create_view(&wgpu::TextureViewDescriptor::default());
        let wrap_view = wrap.create_view(&wgpu::TextureViewDescriptor::default());

        let params = ctx.create_buffer(
            "veilcam_image_composite_params",
            16,
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        );

        let sampler = linear_sampler(&ctx.device, "veilcam_image_sampler");
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("veilcam_image_composite_bg"),
            layout: &pass.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(frame_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&background_view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(&wrap_view),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::TextureView(refined_view),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: params.as_entire_binding(),
                },
            ],
        });

        let stage = Self {
            pass,
            bind_group,
            params,
            background,
            wrap,
        };
        stage.write_params(ctx, post);
        stage
    }

    pub fn write_params(&self, ctx: &GpuContext, post: &PostProcessingConfig) {
        let blend = match post.blend_mode {
            BlendMode::Screen => 0.0,
            BlendMode::LinearDodge => 1.0,
        };
        let params = [post.coverage.0, post.coverage.1, post.light_wrap, blend];
        ctx.queue
            .write_buffer(&self.params, 0, &f32s_to_bytes(&params));
    }

    pub fn run(&self, ctx: &GpuContext, output: &wgpu::TextureView) {
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("veilcam_image_encoder"),
            });
        self.pass.encode(&mut encoder, output, &self.bind_group);
        ctx.queue.submit(Some(encoder.finish()));
    }

    pub fn release(self, ctx: &mut GpuContext) {
        ctx.release_buffer(self.params);
        ctx.release_texture(self.wrap);
        ctx.release_texture(self.background);
        ctx.note_pipeline_released();
    }
}

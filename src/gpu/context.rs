//! Device acquisition and tracked resource creation for the GPU pipeline.
//!
//! Every texture and buffer goes through the context so creation and release
//! stay countable; the balance is what `resource_counts` reports after
//! cleanup.

use crate::foundation::error::{VeilcamError, VeilcamResult};
use crate::pipeline::ResourceCounts;

pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    counts: ResourceCounts,
}

impl GpuContext {
    pub fn new() -> VeilcamResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| match e {
            wgpu::RequestAdapterError::NotFound { .. } => {
                VeilcamError::gpu("no gpu adapter available")
            }
            other => VeilcamError::gpu(format!("wgpu request_adapter failed: {other:?}")),
        })?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("veilcam_device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| VeilcamError::gpu(format!("wgpu request_device failed: {e:?}")))?;

        Ok(Self {
            device,
            queue,
            counts: ResourceCounts::default(),
        })
    }

    pub fn counts(&self) -> ResourceCounts {
        self.counts
    }

    pub fn create_texture(
        &mut self,
        label: &str,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        usage: wgpu::TextureUsages,
    ) -> wgpu::Texture {
        self.counts.textures.created += 1;
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        })
    }

    pub fn release_texture(&mut self, texture: wgpu::Texture) {
        texture.destroy();
        self.counts.textures.released += 1;
    }

    pub fn create_buffer(
        &mut self,
        label: &str,
        size: u64,
        usage: wgpu::BufferUsages,
    ) -> wgpu::Buffer {
        self.counts.buffers.created += 1;
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        })
    }

    pub fn release_buffer(&mut self, buffer: wgpu::Buffer) {
        buffer.destroy();
        self.counts.buffers.released += 1;
    }

    /// Pipelines have no destroy call; counting keeps the ledger symmetric.
    pub fn note_pipeline_created(&mut self) {
        self.counts.pipelines.created += 1;
    }

    pub fn note_pipeline_released(&mut self) {
        self.counts.pipelines.released += 1;
    }

    /// Upload tightly packed texel rows into a whole texture.
    pub fn upload_texture(
        &self,
        texture: &wgpu::Texture,
        width: u32,
        height: u32,
        bytes_per_texel: u32,
        data: &[u8],
    ) {
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * bytes_per_texel),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
    }

    /// Copy a texture into `readback` (sized for padded rows) and return the
    /// tightly packed bytes.
    pub fn read_texture(
        &self,
        texture: &wgpu::Texture,
        readback: &wgpu::Buffer,
        width: u32,
        height: u32,
        bytes_per_texel: u32,
    ) -> VeilcamResult<Vec<u8>> {
        let padded_bytes_per_row = align_to(width * bytes_per_texel, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("veilcam_readback_encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let buffer_slice = readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| VeilcamError::gpu(format!("wgpu poll failed: {e:?}")))?;
        rx.recv()
            .map_err(|_| VeilcamError::gpu("readback channel closed"))?
            .map_err(|e| VeilcamError::gpu(format!("readback map failed: {e:?}")))?;

        let mapped = buffer_slice.get_mapped_range();
        let row_bytes = (width * bytes_per_texel) as usize;
        let padded = padded_bytes_per_row as usize;
        let mut out = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * padded;
            out.extend_from_slice(&mapped[start..start + row_bytes]);
        }
        drop(mapped);
        readback.unmap();
        Ok(out)
    }

    /// Size in bytes of a readback buffer for a texture with padded rows.
    pub fn readback_size(width: u32, height: u32, bytes_per_texel: u32) -> u64 {
        let padded = align_to(width * bytes_per_texel, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        padded as u64 * height as u64
    }
}

pub fn align_to(value: u32, alignment: u32) -> u32 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_rounds_up_to_copy_granularity() {
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(257, 256), 512);
        assert_eq!(align_to(640 * 4, 256), 2560);
    }
}

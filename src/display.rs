//! GPU context and display targets
//!
//! The runtime never creates windows. A caller hands over a device and queue
//! plus something to present into: a `wgpu::Surface` for a real panel, or an
//! offscreen texture for tests and headless runs.

use std::sync::Arc;

use log::{info, warn};
use thiserror::Error;

use crate::error::{VrError, VrResult};
use crate::types::Sizei;

/// Device and queue shared by the renderer and the swap sets
#[derive(Debug, Clone)]
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
}

impl GpuContext {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self { device: Arc::new(device), queue: Arc::new(queue) }
    }

    /// Picks any adapter without a surface; used for tests and offscreen runs
    pub fn new_headless() -> VrResult<Self> {
        pollster::block_on(async {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });

            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .ok_or_else(|| VrError::Gpu("no GPU adapter available".into()))?;

            let (device, queue) = adapter
                .request_device(
                    &wgpu::DeviceDescriptor { label: Some("Runtime Device"), ..Default::default() },
                    None,
                )
                .await
                .map_err(|e| VrError::Gpu(e.to_string()))?;

            info!("Headless GPU context on {}", adapter.get_info().name);
            Ok(Self::new(device, queue))
        })
    }
}

#[derive(Debug, Error)]
pub enum AcquireError {
    /// Nothing to draw into right now (minimized, timed out, occluded)
    #[error("display target not visible")]
    NotVisible,
    #[error("display target lost: {0}")]
    Lost(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    NotVisible,
}

/// One acquired image of a display target
pub struct TargetFrame {
    pub view: wgpu::TextureView,
    pub size: Sizei,
    pub format: wgpu::TextureFormat,
    surface_texture: Option<wgpu::SurfaceTexture>,
}

pub trait DisplayTarget {
    fn acquire(&mut self) -> Result<TargetFrame, AcquireError>;
    fn present(&mut self, frame: TargetFrame) -> PresentOutcome;
    fn format(&self) -> wgpu::TextureFormat;
    fn size(&self) -> Sizei;
}

fn render_texture(device: &wgpu::Device, label: &str, size: Sizei, format: wgpu::TextureFormat) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d { width: size.w, height: size.h, depth_or_array_layers: 1 },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT
            | wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}

/// Presents into a plain texture that can be read back
pub struct OffscreenTarget {
    texture: wgpu::Texture,
    size: Sizei,
    format: wgpu::TextureFormat,
    visible: bool,
    presented: u64,
}

impl OffscreenTarget {
    pub fn new(gpu: &GpuContext, size: Sizei, format: wgpu::TextureFormat) -> VrResult<Self> {
        if size.w == 0 || size.h == 0 {
            return Err(VrError::InvalidArgument(format!("offscreen target size {:?}", size)));
        }
        let texture = render_texture(&gpu.device, "Offscreen Target", size, format);
        Ok(Self { texture, size, format, visible: true, presented: 0 })
    }

    /// A hidden target refuses to acquire, like a minimized window
    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn presented_frames(&self) -> u64 {
        self.presented
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    /// Copies the target back to the CPU, tightly packed rows
    pub fn read_pixels(&self, gpu: &GpuContext) -> VrResult<Vec<u8>> {
        read_texture(gpu, &self.texture, self.size, self.format)
    }
}

impl DisplayTarget for OffscreenTarget {
    fn acquire(&mut self) -> Result<TargetFrame, AcquireError> {
        if !self.visible {
            return Err(AcquireError::NotVisible);
        }
        Ok(TargetFrame {
            view: self.texture.create_view(&wgpu::TextureViewDescriptor::default()),
            size: self.size,
            format: self.format,
            surface_texture: None,
        })
    }

    fn present(&mut self, _frame: TargetFrame) -> PresentOutcome {
        self.presented += 1;
        PresentOutcome::Presented
    }

    fn format(&self) -> wgpu::TextureFormat {
        self.format
    }

    fn size(&self) -> Sizei {
        self.size
    }
}

/// Reads a 4-byte-per-texel texture back to the CPU
pub fn read_texture(
    gpu: &GpuContext,
    texture: &wgpu::Texture,
    size: Sizei,
    format: wgpu::TextureFormat,
) -> VrResult<Vec<u8>> {
    let texel_bytes = format
        .block_copy_size(None)
        .filter(|bytes| *bytes == 4)
        .ok_or_else(|| VrError::InvalidArgument(format!("cannot read back {:?}", format)))?;
    let unpadded_row = size.w * texel_bytes;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    let padded_row = unpadded_row.div_ceil(align) * align;

    let buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Readback Buffer"),
        size: (padded_row * size.h) as u64,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });

    let mut encoder = gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("Readback Encoder"),
    });
    encoder.copy_texture_to_buffer(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyBufferInfo {
            buffer: &buffer,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded_row),
                rows_per_image: Some(size.h),
            },
        },
        wgpu::Extent3d { width: size.w, height: size.h, depth_or_array_layers: 1 },
    );
    gpu.queue.submit(Some(encoder.finish()));

    let slice = buffer.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    let _ = gpu.device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .map_err(|e| VrError::Gpu(e.to_string()))?
        .map_err(|e| VrError::Gpu(e.to_string()))?;

    let mapped = slice.get_mapped_range();
    let mut pixels = Vec::with_capacity((unpadded_row * size.h) as usize);
    for row in mapped.chunks(padded_row as usize) {
        pixels.extend_from_slice(&row[..unpadded_row as usize]);
    }
    drop(mapped);
    buffer.unmap();
    Ok(pixels)
}

/// A configured `wgpu::Surface`, usually the HMD's display
pub struct SurfaceTarget {
    surface: wgpu::Surface<'static>,
    device: Arc<wgpu::Device>,
    config: wgpu::SurfaceConfiguration,
}

impl SurfaceTarget {
    pub fn new(surface: wgpu::Surface<'static>, gpu: &GpuContext, config: wgpu::SurfaceConfiguration) -> Self {
        surface.configure(&gpu.device, &config);
        info!("Surface configured {}x{} {:?}", config.width, config.height, config.format);
        Self { surface, device: gpu.device.clone(), config }
    }

    pub fn resize(&mut self, size: Sizei) {
        if size.w > 0 && size.h > 0 {
            self.config.width = size.w;
            self.config.height = size.h;
            self.surface.configure(&self.device, &self.config);
        }
    }

    /// Fifo when on, otherwise whatever tears least on this platform
    pub fn set_vsync(&mut self, vsync: bool) {
        self.config.present_mode =
            if vsync { wgpu::PresentMode::Fifo } else { wgpu::PresentMode::AutoNoVsync };
        self.surface.configure(&self.device, &self.config);
    }

    fn frame_from(&self, output: wgpu::SurfaceTexture) -> TargetFrame {
        TargetFrame {
            view: output.texture.create_view(&wgpu::TextureViewDescriptor::default()),
            size: Sizei::new(self.config.width, self.config.height),
            format: self.config.format,
            surface_texture: Some(output),
        }
    }
}

impl DisplayTarget for SurfaceTarget {
    fn acquire(&mut self) -> Result<TargetFrame, AcquireError> {
        match self.surface.get_current_texture() {
            Ok(output) => Ok(self.frame_from(output)),
            Err(wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost) => {
                warn!("Surface outdated, reconfiguring");
                self.surface.configure(&self.device, &self.config);
                match self.surface.get_current_texture() {
                    Ok(output) => Ok(self.frame_from(output)),
                    Err(e) => {
                        warn!("Surface still unavailable after reconfigure: {}", e);
                        Err(AcquireError::NotVisible)
                    }
                }
            }
            Err(wgpu::SurfaceError::OutOfMemory) => Err(AcquireError::Lost("surface out of memory".into())),
            Err(e) => {
                warn!("Surface acquire failed: {}", e);
                Err(AcquireError::NotVisible)
            }
        }
    }

    fn present(&mut self, frame: TargetFrame) -> PresentOutcome {
        match frame.surface_texture {
            Some(output) => {
                output.present();
                PresentOutcome::Presented
            }
            None => PresentOutcome::NotVisible,
        }
    }

    fn format(&self) -> wgpu::TextureFormat {
        self.config.format
    }

    fn size(&self) -> Sizei {
        Sizei::new(self.config.width, self.config.height)
    }
}

/// Creates the render-attachment texture used for mirrors and history rings
pub(crate) fn attachment_texture(
    device: &wgpu::Device,
    label: &str,
    size: Sizei,
    format: wgpu::TextureFormat,
) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = render_texture(device, label, size, format);
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

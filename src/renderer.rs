//! Distortion renderer
//!
//! Takes the committed eye textures of a frame, warps them through the
//! per-eye distortion meshes with the latest timewarp correction, composites
//! overlay layers and presents to a `DisplayTarget`.

use std::cell::RefCell;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use log::{debug, info, trace, warn};
use wgpu::util::DeviceExt;
use wgpu::{BindGroup, BindGroupLayout, Buffer, RenderPipeline, Sampler};

use crate::config::RuntimeConfig;
use crate::display::{attachment_texture, AcquireError, DisplayTarget, GpuContext, PresentOutcome, TargetFrame};
use crate::error::{VrError, VrResult};
use crate::eye_pose::eye_viewport;
use crate::hmd::{DistortionCaps, HmdDesc};
use crate::layer::{EyeFovLayer, Layer, LayerFlags, QuadLayer, QuadPlacement, ViewScaleDesc};
use crate::mesh::{DistortionMesh, DistortionVertex};
use crate::pose_source::{Pose, PoseSource};
use crate::swap_chain::{SwapChainManager, SwapSetHandle, SwapTexture};
use crate::timewarp::{positional_timewarp_from_source, timewarp_from_source, TimewarpMatrices};
use crate::timing::{wait_until, FrameScheduler, WaitMode};
use crate::types::{Eye, Recti, ScaleAndOffset2D, Sizei};

const OVERDRIVE_RING_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    Success,
    /// Timing advanced but nothing reached the display
    SuccessNotVisible,
    Error,
}

/// Hook for callers that share the GPU with their own cached state
pub trait GraphicsStateHook: Send {
    fn save(&mut self);
    fn restore(&mut self);
}

#[derive(Debug, Default)]
pub struct NoopStateHook;

impl GraphicsStateHook for NoopStateHook {
    fn save(&mut self) {}
    fn restore(&mut self) {}
}

/// Saves caller state on creation and restores it when dropped, on every
/// return path. With `restore == false` it does nothing.
pub struct GpuStateGuard<'a> {
    hook: &'a mut dyn GraphicsStateHook,
    restore: bool,
}

impl<'a> GpuStateGuard<'a> {
    pub fn new(hook: &'a mut dyn GraphicsStateHook, restore: bool) -> Self {
        if restore {
            hook.save();
        }
        Self { hook, restore }
    }
}

impl Drop for GpuStateGuard<'_> {
    fn drop(&mut self) {
        if self.restore {
            self.hook.restore();
        }
    }
}

// Eye uniforms, matches EyeUniforms in distortion.wgsl
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct EyeUniforms {
    pub uv_scale: [f32; 2],
    pub uv_offset: [f32; 2],
    pub timewarp_start: [[f32; 4]; 4],
    pub timewarp_end: [[f32; 4]; 4],
}

impl EyeUniforms {
    pub fn new(eye_to_source_uv: &ScaleAndOffset2D, timewarp: &TimewarpMatrices) -> Self {
        Self {
            uv_scale: eye_to_source_uv.scale.to_array(),
            uv_offset: eye_to_source_uv.offset.to_array(),
            timewarp_start: timewarp.start.to_cols_array_2d(),
            timewarp_end: timewarp.end.to_cols_array_2d(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct OverdriveUniforms {
    pub rise: f32,
    pub fall: f32,
    pub is_srgb: f32,
    pub enabled: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct QuadUniforms {
    quad_from_eye: [[f32; 4]; 4],
    size: [f32; 2],
    uv_scale: [f32; 2],
    uv_offset: [f32; 2],
    _padding: [f32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BlitUniforms {
    uv_scale: [f32; 2],
    uv_offset: [f32; 2],
}

/// Maps an eye's tan-angle space to UV in its source texture
pub fn eye_to_source_uv(layer: &EyeFovLayer, eye: Eye, texture_size: Sizei, caps: DistortionCaps) -> ScaleAndOffset2D {
    let i = eye.index();
    let uv = layer.fov[i].to_ndc_scale_and_offset().ndc_to_uv(layer.viewport[i], texture_size);
    if caps.contains(DistortionCaps::FLIP_INPUT) || layer.flags.contains(LayerFlags::TEXTURE_ORIGIN_AT_BOTTOM_LEFT) {
        uv.flipped_v()
    } else {
        uv
    }
}

fn viewport_uv(viewport: &Recti, texture_size: Sizei, flags: LayerFlags) -> ([f32; 2], [f32; 2]) {
    let w = texture_size.w as f32;
    let h = texture_size.h as f32;
    let scale = [viewport.w as f32 / w, viewport.h as f32 / h];
    let offset = [viewport.x as f32 / w, viewport.y as f32 / h];
    if flags.contains(LayerFlags::TEXTURE_ORIGIN_AT_BOTTOM_LEFT) {
        ([scale[0], -scale[1]], [offset[0], 1.0 - offset[1]])
    } else {
        (scale, offset)
    }
}

/// Transform taking a ray from eye space into the quad's plane space
fn quad_from_eye(quad: &QuadLayer, head: &Pose, eye_offset: glam::Vec3, world_meters_per_unit: f32) -> Mat4 {
    let placement = quad.placement.pose().normalized();
    let head_from_eye = Mat4::from_translation(eye_offset);
    match quad.placement {
        QuadPlacement::InWorld(_) => {
            let world_from_quad = Mat4::from_rotation_translation(
                placement.orientation,
                placement.position * world_meters_per_unit,
            );
            let world_from_head = Mat4::from_rotation_translation(head.normalized_orientation(), head.position);
            world_from_quad.inverse() * world_from_head * head_from_eye
        }
        QuadPlacement::HeadLocked(_) => {
            let head_from_quad = Mat4::from_rotation_translation(placement.orientation, placement.position);
            head_from_quad.inverse() * head_from_eye
        }
    }
}

fn viewport_of(pass: &mut wgpu::RenderPass<'_>, rect: &Recti) {
    pass.set_viewport(rect.x as f32, rect.y as f32, rect.w as f32, rect.h as f32, 0.0, 1.0);
}

/// GPU copy of a distortion mesh
struct MeshBuffers {
    mesh: Arc<DistortionMesh>,
    vertex: Buffer,
    index: Buffer,
    index_count: u32,
}

impl MeshBuffers {
    fn new(device: &wgpu::Device, eye: Eye, mesh: &Arc<DistortionMesh>) -> Self {
        let vertex = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&format!("Mesh Vertex Buffer {:?}", eye)),
            contents: bytemuck::cast_slice(&mesh.vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&format!("Mesh Index Buffer {:?}", eye)),
            contents: bytemuck::cast_slice(&mesh.indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        Self { mesh: mesh.clone(), vertex, index, index_count: mesh.index_count() as u32 }
    }
}

/// Previous warped frames, read back by the overdrive pass
struct OverdriveRing {
    size: Sizei,
    format: wgpu::TextureFormat,
    _textures: Vec<wgpu::Texture>,
    views: Vec<wgpu::TextureView>,
    read_groups: Vec<BindGroup>,
    last: usize,
    /// False until one frame has been written
    primed: bool,
}

impl OverdriveRing {
    fn current(&self) -> usize {
        (self.last + 1) % OVERDRIVE_RING_LEN
    }
}

struct Pipelines {
    format: wgpu::TextureFormat,
    warp: RenderPipeline,
    warp_overdrive: RenderPipeline,
    quad: RenderPipeline,
    blit: RenderPipeline,
}

struct Mirror {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    size: Sizei,
    blit: RenderPipeline,
}

/// Everything a frame submit reads
pub struct FrameSubmission<'a> {
    /// `0` means the scheduler's next frame
    pub frame_index: u64,
    pub layers: &'a [Layer],
    pub view_scale: ViewScaleDesc,
    pub eye_meshes: [Arc<DistortionMesh>; 2],
    pub swap_sets: &'a SwapChainManager<SwapTexture>,
    pub scheduler: &'a FrameScheduler,
    pub pose_source: &'a dyn PoseSource,
}

pub struct DistortionRenderer {
    gpu: GpuContext,
    caps: DistortionCaps,
    wait_mode: WaitMode,
    overdrive_rise: f32,
    overdrive_fall: f32,
    flush_after_present: bool,

    uniform_layout: BindGroupLayout,
    texture_layout: BindGroupLayout,
    history_layout: BindGroupLayout,
    warp_layout: wgpu::PipelineLayout,
    overdrive_layout: wgpu::PipelineLayout,
    layer_layout: wgpu::PipelineLayout,
    warp_shader: wgpu::ShaderModule,
    quad_shader: wgpu::ShaderModule,
    blit_shader: wgpu::ShaderModule,
    sampler: Sampler,
    hq_sampler: Sampler,

    eye_uniform_buffers: [Buffer; 2],
    eye_uniform_groups: [BindGroup; 2],
    overdrive_buffer: Buffer,
    mesh_buffers: [Option<MeshBuffers>; 2],
    pipelines: Option<Pipelines>,
    overdrive_ring: Option<OverdriveRing>,
    mirror: Option<Mirror>,
    layer_uniforms: RefCell<UniformPool>,
    state_hook: RefCell<Box<dyn GraphicsStateHook>>,
}

/// Anisotropic filtering for the whole session or for one layer
pub fn uses_hq_sampler(caps: DistortionCaps, flags: LayerFlags) -> bool {
    caps.contains(DistortionCaps::HQ_DISTORTION) || flags.contains(LayerFlags::HIGH_QUALITY)
}

/// Overlay uniform buffers, reused across frames. Every draw in a frame
/// takes its own slot since writes land before the submit.
struct UniformPool {
    slots: Vec<(Buffer, BindGroup)>,
    used: usize,
}

impl UniformPool {
    // Large enough for every overlay uniform struct
    const SLOT_SIZE: wgpu::BufferAddress = 256;

    fn new() -> Self {
        Self { slots: Vec::new(), used: 0 }
    }

    fn reset(&mut self) {
        self.used = 0;
    }

    /// Writes `contents` into the next free slot and returns its index
    fn push(&mut self, gpu: &GpuContext, layout: &BindGroupLayout, contents: &[u8]) -> usize {
        if self.used == self.slots.len() {
            let buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Layer Uniform Buffer"),
                size: Self::SLOT_SIZE,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Layer Uniform Bind Group"),
                layout,
                entries: &[wgpu::BindGroupEntry { binding: 0, resource: buffer.as_entire_binding() }],
            });
            debug!("Layer uniform pool grew to {} slots", self.slots.len() + 1);
            self.slots.push((buffer, group));
        }
        let slot = self.used;
        gpu.queue.write_buffer(&self.slots[slot].0, 0, contents);
        self.used += 1;
        slot
    }
}

fn mesh_vertex_layout() -> wgpu::VertexBufferLayout<'static> {
    const ATTRIBUTES: [wgpu::VertexAttribute; 6] = wgpu::vertex_attr_array![
        0 => Float32x2,
        1 => Float32x2,
        2 => Float32x2,
        3 => Float32x2,
        4 => Float32,
        5 => Float32
    ];
    wgpu::VertexBufferLayout {
        array_stride: std::mem::size_of::<DistortionVertex>() as wgpu::BufferAddress,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &ATTRIBUTES,
    }
}

impl DistortionRenderer {
    pub fn new(gpu: GpuContext, hmd: &HmdDesc, config: &RuntimeConfig) -> Self {
        let device = &gpu.device;

        let warp_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Distortion Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/distortion.wgsl").into()),
        });
        let quad_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Quad Layer Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/quad.wgsl").into()),
        });
        let blit_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Blit Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/blit.wgsl").into()),
        });

        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Uniform Bind Group Layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let texture_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Source Texture Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let history_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Overdrive History Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let warp_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Distortion Pipeline Layout"),
            bind_group_layouts: &[&uniform_layout, &texture_layout],
            push_constant_ranges: &[],
        });
        let overdrive_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Overdrive Pipeline Layout"),
            bind_group_layouts: &[&uniform_layout, &texture_layout, &history_layout],
            push_constant_ranges: &[],
        });
        let layer_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Layer Pipeline Layout"),
            bind_group_layouts: &[&uniform_layout, &texture_layout],
            push_constant_ranges: &[],
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Source Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        let hq_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("High Quality Source Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Linear,
            anisotropy_clamp: 8,
            ..Default::default()
        });

        let identity = EyeUniforms::new(
            &ScaleAndOffset2D { scale: glam::Vec2::ONE, offset: glam::Vec2::ZERO },
            &TimewarpMatrices::IDENTITY,
        );
        let eye_uniform_buffers = Eye::BOTH.map(|eye| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&format!("Eye Uniform Buffer {:?}", eye)),
                contents: bytemuck::bytes_of(&identity),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            })
        });
        let eye_uniform_groups = [0, 1].map(|i| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Eye Uniform Bind Group"),
                layout: &uniform_layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: eye_uniform_buffers[i].as_entire_binding(),
                }],
            })
        });

        let overdrive_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Overdrive Buffer"),
            contents: bytemuck::bytes_of(&OverdriveUniforms { rise: 0.0, fall: 0.0, is_srgb: 0.0, enabled: 0.0 }),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let caps = config.distortion_caps & hmd.distortion_caps;
        info!("Distortion renderer initialized ({:?})", caps);

        Self {
            gpu,
            caps,
            wait_mode: config.effective_wait_mode(caps),
            overdrive_rise: config.overdrive_rise,
            overdrive_fall: config.overdrive_fall,
            flush_after_present: config.flush_after_present,
            uniform_layout,
            texture_layout,
            history_layout,
            warp_layout,
            overdrive_layout,
            layer_layout,
            warp_shader,
            quad_shader,
            blit_shader,
            sampler,
            hq_sampler,
            eye_uniform_buffers,
            eye_uniform_groups,
            overdrive_buffer,
            mesh_buffers: [None, None],
            pipelines: None,
            overdrive_ring: None,
            mirror: None,
            layer_uniforms: RefCell::new(UniformPool::new()),
            state_hook: RefCell::new(Box::new(NoopStateHook)),
        }
    }

    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    pub fn caps(&self) -> DistortionCaps {
        self.caps
    }

    /// Changes the active caps; called when the session is reconfigured
    pub fn set_caps(&mut self, caps: DistortionCaps, wait_mode: WaitMode) {
        if !caps.contains(DistortionCaps::OVERDRIVE) {
            self.overdrive_ring = None;
        }
        self.caps = caps;
        self.wait_mode = wait_mode;
    }

    pub fn set_state_hook(&mut self, hook: Box<dyn GraphicsStateHook>) {
        self.state_hook = RefCell::new(hook);
    }

    pub fn create_mirror_texture(&mut self, size: Sizei, format: wgpu::TextureFormat) -> VrResult<&wgpu::Texture> {
        if size.w == 0 || size.h == 0 {
            return Err(VrError::InvalidArgument(format!("mirror size {:?}", size)));
        }
        let (texture, view) = attachment_texture(&self.gpu.device, "Mirror Texture", size, format);
        let blit = self.create_blit_pipeline(format);
        info!("Mirror texture created {}x{}", size.w, size.h);
        Ok(&self.mirror.insert(Mirror { texture, view, size, blit }).texture)
    }

    pub fn destroy_mirror_texture(&mut self) {
        if self.mirror.take().is_some() {
            debug!("Mirror texture destroyed");
        }
    }

    pub fn mirror_texture(&self) -> Option<&wgpu::Texture> {
        self.mirror.as_ref().map(|m| &m.texture)
    }

    fn create_blit_pipeline(&self, format: wgpu::TextureFormat) -> RenderPipeline {
        self.gpu.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Blit Pipeline"),
            layout: Some(&self.layer_layout),
            vertex: wgpu::VertexState {
                module: &self.blit_shader,
                entry_point: Some("vs_blit"),
                buffers: &[],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &self.blit_shader,
                entry_point: Some("fs_blit"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        })
    }

    fn create_mesh_pipeline(
        &self,
        label: &str,
        layout: &wgpu::PipelineLayout,
        shader: &wgpu::ShaderModule,
        entry_points: (&str, &str),
        targets: &[Option<wgpu::ColorTargetState>],
    ) -> RenderPipeline {
        self.gpu.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(label),
            layout: Some(layout),
            vertex: wgpu::VertexState {
                module: shader,
                entry_point: Some(entry_points.0),
                buffers: &[mesh_vertex_layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: shader,
                entry_point: Some(entry_points.1),
                targets,
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                cull_mode: None,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        })
    }

    fn ensure_pipelines(&mut self, format: wgpu::TextureFormat) {
        if self.pipelines.as_ref().is_some_and(|p| p.format == format) {
            return;
        }
        let opaque = Some(wgpu::ColorTargetState {
            format,
            blend: Some(wgpu::BlendState::REPLACE),
            write_mask: wgpu::ColorWrites::ALL,
        });
        let blended = Some(wgpu::ColorTargetState {
            format,
            blend: Some(wgpu::BlendState::ALPHA_BLENDING),
            write_mask: wgpu::ColorWrites::ALL,
        });

        let warp = self.create_mesh_pipeline(
            "Distortion Pipeline",
            &self.warp_layout,
            &self.warp_shader,
            ("vs_warp", "fs_warp"),
            &[opaque.clone()],
        );
        // Second target is the next history slot.
        let warp_overdrive = self.create_mesh_pipeline(
            "Overdrive Distortion Pipeline",
            &self.overdrive_layout,
            &self.warp_shader,
            ("vs_warp", "fs_warp_overdrive"),
            &[opaque.clone(), opaque],
        );
        let quad = self.create_mesh_pipeline(
            "Quad Layer Pipeline",
            &self.layer_layout,
            &self.quad_shader,
            ("vs_quad", "fs_quad"),
            &[blended],
        );
        let blit = self.create_blit_pipeline(format);
        info!("Distortion pipelines built for {:?}", format);
        self.pipelines = Some(Pipelines { format, warp, warp_overdrive, quad, blit });
    }

    fn ensure_overdrive_ring(&mut self, size: Sizei, format: wgpu::TextureFormat) {
        if self.overdrive_ring.as_ref().is_some_and(|r| r.size == size && r.format == format) {
            return;
        }
        let device = &self.gpu.device;
        let mut textures = Vec::with_capacity(OVERDRIVE_RING_LEN);
        let mut views = Vec::with_capacity(OVERDRIVE_RING_LEN);
        let mut read_groups = Vec::with_capacity(OVERDRIVE_RING_LEN);
        for slot in 0..OVERDRIVE_RING_LEN {
            let (texture, view) = attachment_texture(device, &format!("Overdrive History {}", slot), size, format);
            read_groups.push(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Overdrive History Bind Group"),
                layout: &self.history_layout,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(&view) },
                    wgpu::BindGroupEntry { binding: 1, resource: self.overdrive_buffer.as_entire_binding() },
                ],
            }));
            textures.push(texture);
            views.push(view);
        }
        debug!("Overdrive ring sized {}x{}", size.w, size.h);
        self.overdrive_ring = Some(OverdriveRing { size, format, _textures: textures, views, read_groups, last: 0, primed: false });
    }

    fn update_mesh_buffers(&mut self, meshes: &[Arc<DistortionMesh>; 2]) {
        for eye in Eye::BOTH {
            let mesh = &meshes[eye.index()];
            let slot = &mut self.mesh_buffers[eye.index()];
            if slot.as_ref().is_some_and(|b| Arc::ptr_eq(&b.mesh, mesh)) {
                continue;
            }
            *slot = if mesh.is_empty() {
                warn!("Empty distortion mesh for {:?}, eye will be black", eye);
                None
            } else {
                trace!("Uploading distortion mesh for {:?}", eye);
                Some(MeshBuffers::new(&self.gpu.device, eye, mesh))
            };
        }
    }

    fn source_group(&self, texture: &SwapTexture, flags: LayerFlags) -> BindGroup {
        let sampler = if uses_hq_sampler(self.caps, flags) { &self.hq_sampler } else { &self.sampler };
        self.gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Source Texture Bind Group"),
            layout: &self.texture_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(&texture.view) },
                wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::Sampler(sampler) },
            ],
        })
    }

    fn set_layer_uniforms(&self, pass: &mut wgpu::RenderPass<'_>, contents: &[u8]) {
        let slot = self.layer_uniforms.borrow_mut().push(&self.gpu, &self.uniform_layout, contents);
        pass.set_bind_group(0, &self.layer_uniforms.borrow().slots[slot].1, &[]);
    }

    /// Warps and presents one frame.
    ///
    /// `Err` is only returned for device loss; everything else degrades to
    /// a black eye or a skipped layer.
    pub fn submit_frame(
        &mut self,
        frame: FrameSubmission<'_>,
        target: &mut dyn DisplayTarget,
    ) -> VrResult<SubmitStatus> {
        let scheduler = frame.scheduler;
        let caps = self.caps;
        let timing = scheduler.frame_timing(frame.frame_index);
        let frame_index = timing.frame_index;

        let texture_size = |handle: SwapSetHandle| {
            frame.swap_sets.get(handle).ok().and_then(|set| set.textures().first()).map(|t| t.size)
        };
        let layers: Vec<&Layer> = frame
            .layers
            .iter()
            .filter(|layer| !matches!(layer, Layer::Disabled))
            .filter(|layer| match layer.validate(texture_size) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Skipping layer in frame {}: {}", frame_index, e);
                    false
                }
            })
            .collect();
        let eye_layer = layers.iter().find(|layer| layer.eye_fov().is_some()).copied();

        if caps.contains(DistortionCaps::TIMEWARP) && scheduler.vsync_enabled() {
            scheduler.mark_waiting_for_warp(frame_index);
            wait_until(scheduler.clock().as_ref(), timing.timewarp_sample_time, self.wait_mode);
        }
        scheduler.mark_warp_and_present(frame_index);
        let warp_started = scheduler.now();

        let target_frame = match target.acquire() {
            Ok(target_frame) => target_frame,
            Err(AcquireError::NotVisible) => {
                debug!("Frame {} not visible", frame_index);
                scheduler.end_frame(frame_index);
                return Ok(SubmitStatus::SuccessNotVisible);
            }
            Err(AcquireError::Lost(reason)) => {
                warn!("Display lost during frame {}: {}", frame_index, reason);
                scheduler.end_frame(frame_index);
                return Err(VrError::DeviceLost(reason));
            }
        };

        let overdrive = caps.contains(DistortionCaps::OVERDRIVE);
        self.ensure_pipelines(target_frame.format);
        if overdrive {
            self.ensure_overdrive_ring(target_frame.size, target_frame.format);
        }
        self.update_mesh_buffers(&frame.eye_meshes);
        self.layer_uniforms.get_mut().reset();

        // Sampled after acquire, which may block on the display.
        let mut timewarp = [TimewarpMatrices::IDENTITY; 2];
        if let Some(layer) = eye_layer.filter(|_| caps.contains(DistortionCaps::TIMEWARP)) {
            for eye in Eye::BOTH {
                let i = eye.index();
                let window = timing.eye_warp_window[i];
                let (matrices, tracked) = match layer {
                    Layer::EyeFovDepth(depth) => positional_timewarp_from_source(
                        &depth.eye.render_pose[i],
                        frame.pose_source,
                        window,
                        frame.view_scale.hmd_to_eye_offset[i],
                    ),
                    Layer::EyeFov(eye_fov) => timewarp_from_source(&eye_fov.render_pose[i], frame.pose_source, window),
                    _ => (TimewarpMatrices::IDENTITY, false),
                };
                if !tracked {
                    trace!("No tracking for {:?} in frame {}, warp is identity", eye, frame_index);
                }
                timewarp[i] = matrices;
            }
        }

        let mut eye_sources: [Option<&SwapTexture>; 2] = [None, None];
        if let Some(layer) = eye_layer.and_then(|layer| layer.eye_fov()) {
            for eye in Eye::BOTH {
                let i = eye.index();
                let Some(texture) = frame.swap_sets.submitted_texture(layer.color[i]).ok().flatten() else {
                    debug!("{:?} swap set has nothing committed", eye);
                    continue;
                };
                let uniforms = EyeUniforms::new(&eye_to_source_uv(layer, eye, texture.size, caps), &timewarp[i]);
                self.gpu.queue.write_buffer(&self.eye_uniform_buffers[i], 0, bytemuck::bytes_of(&uniforms));
                eye_sources[i] = Some(texture);
            }
        }

        if let Some(ring) = &self.overdrive_ring {
            let uniforms = OverdriveUniforms {
                rise: self.overdrive_rise,
                fall: self.overdrive_fall,
                is_srgb: if caps.contains(DistortionCaps::SRGB) || target_frame.format.is_srgb() { 1.0 } else { 0.0 },
                enabled: if ring.primed { 1.0 } else { 0.0 },
            };
            self.gpu.queue.write_buffer(&self.overdrive_buffer, 0, bytemuck::bytes_of(&uniforms));
        }

        {
            let mut hook = self.state_hook.borrow_mut();
            let _guard = GpuStateGuard::new(&mut **hook, !caps.contains(DistortionCaps::NO_RESTORE));

            let mut encoder = self.gpu.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Distortion Encoder"),
            });
            let eye_flags = eye_layer.map(|layer| layer.flags()).unwrap_or_default();
            self.encode_warp(&mut encoder, &target_frame, &eye_sources, eye_flags, overdrive);
            self.encode_overlays(&mut encoder, &target_frame, &layers, &frame, &timing.eye_scanout_time);
            if let Some(layer) = eye_layer.and_then(|layer| layer.eye_fov()) {
                self.encode_mirror(&mut encoder, layer, &eye_sources);
            }
            self.gpu.queue.submit(Some(encoder.finish()));
        }

        let outcome = target.present(target_frame);
        if let Some(ring) = self.overdrive_ring.as_mut().filter(|_| overdrive) {
            ring.last = ring.current();
            ring.primed = true;
        }

        scheduler.record_distortion_time(scheduler.now() - warp_started);
        scheduler.end_frame(frame_index);
        if self.flush_after_present {
            let _ = self.gpu.device.poll(wgpu::Maintain::Wait);
        }

        Ok(match outcome {
            PresentOutcome::Presented => SubmitStatus::Success,
            PresentOutcome::NotVisible => SubmitStatus::SuccessNotVisible,
        })
    }

    fn encode_warp(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        target: &TargetFrame,
        eye_sources: &[Option<&SwapTexture>; 2],
        flags: LayerFlags,
        overdrive: bool,
    ) {
        let Some(pipelines) = &self.pipelines else {
            return;
        };
        let ring = self.overdrive_ring.as_ref().filter(|_| overdrive);

        let clear = wgpu::Operations { load: wgpu::LoadOp::Clear(wgpu::Color::BLACK), store: wgpu::StoreOp::Store };
        let mut attachments = vec![Some(wgpu::RenderPassColorAttachment {
            view: &target.view,
            resolve_target: None,
            ops: clear,
        })];
        if let Some(ring) = ring {
            attachments.push(Some(wgpu::RenderPassColorAttachment {
                view: &ring.views[ring.current()],
                resolve_target: None,
                ops: clear,
            }));
        }

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Distortion Pass"),
            color_attachments: &attachments,
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        match ring {
            Some(ring) => {
                pass.set_pipeline(&pipelines.warp_overdrive);
                pass.set_bind_group(2, &ring.read_groups[ring.last], &[]);
            }
            None => pass.set_pipeline(&pipelines.warp),
        }

        for eye in Eye::BOTH {
            let i = eye.index();
            let (Some(source), Some(mesh)) = (eye_sources[i], &self.mesh_buffers[i]) else {
                continue;
            };
            viewport_of(&mut pass, &eye_viewport(eye, target.size));
            pass.set_bind_group(0, &self.eye_uniform_groups[i], &[]);
            pass.set_bind_group(1, &self.source_group(source, flags), &[]);
            pass.set_vertex_buffer(0, mesh.vertex.slice(..));
            pass.set_index_buffer(mesh.index.slice(..), wgpu::IndexFormat::Uint16);
            pass.draw_indexed(0..mesh.index_count, 0, 0..1);
        }
    }

    fn encode_overlays(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        target: &TargetFrame,
        layers: &[&Layer],
        frame: &FrameSubmission<'_>,
        eye_scanout_time: &[f64; 2],
    ) {
        let Some(pipelines) = &self.pipelines else {
            return;
        };
        if !layers.iter().any(|layer| matches!(layer, Layer::Quad(_) | Layer::Direct(_))) {
            return;
        }

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Layer Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &target.view,
                resolve_target: None,
                ops: wgpu::Operations { load: wgpu::LoadOp::Load, store: wgpu::StoreOp::Store },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        for layer in layers {
            match layer {
                Layer::Quad(quad) => {
                    let Some(texture) = frame.swap_sets.submitted_texture(quad.color).ok().flatten() else {
                        continue;
                    };
                    let source = self.source_group(texture, quad.flags);
                    let (uv_scale, uv_offset) = viewport_uv(&quad.viewport, texture.size, quad.flags);
                    pass.set_pipeline(&pipelines.quad);
                    for eye in Eye::BOTH {
                        let i = eye.index();
                        let Some(mesh) = &self.mesh_buffers[i] else {
                            continue;
                        };
                        let head = frame.pose_source.predicted_pose(eye_scanout_time[i]).unwrap_or(Pose::IDENTITY);
                        let uniforms = QuadUniforms {
                            quad_from_eye: quad_from_eye(
                                quad,
                                &head,
                                frame.view_scale.hmd_to_eye_offset[i],
                                frame.view_scale.world_meters_per_unit,
                            )
                            .to_cols_array_2d(),
                            size: quad.size.to_array(),
                            uv_scale,
                            uv_offset,
                            _padding: [0.0; 2],
                        };
                        viewport_of(&mut pass, &eye_viewport(eye, target.size));
                        self.set_layer_uniforms(&mut pass, bytemuck::bytes_of(&uniforms));
                        pass.set_bind_group(1, &source, &[]);
                        pass.set_vertex_buffer(0, mesh.vertex.slice(..));
                        pass.set_index_buffer(mesh.index.slice(..), wgpu::IndexFormat::Uint16);
                        pass.draw_indexed(0..mesh.index_count, 0, 0..1);
                    }
                }
                Layer::Direct(direct) => {
                    pass.set_pipeline(&pipelines.blit);
                    for eye in Eye::BOTH {
                        let i = eye.index();
                        let Some(texture) = frame.swap_sets.submitted_texture(direct.color[i]).ok().flatten() else {
                            continue;
                        };
                        let (uv_scale, uv_offset) = viewport_uv(&direct.viewport[i], texture.size, direct.flags);
                        let uniforms = BlitUniforms { uv_scale, uv_offset };
                        viewport_of(&mut pass, &eye_viewport(eye, target.size));
                        self.set_layer_uniforms(&mut pass, bytemuck::bytes_of(&uniforms));
                        pass.set_bind_group(1, &self.source_group(texture, direct.flags), &[]);
                        pass.draw(0..3, 0..1);
                    }
                }
                _ => {}
            }
        }
    }

    fn encode_mirror(&self, encoder: &mut wgpu::CommandEncoder, layer: &EyeFovLayer, eye_sources: &[Option<&SwapTexture>; 2]) {
        let Some(mirror) = &self.mirror else {
            return;
        };
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Mirror Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &mirror.view,
                resolve_target: None,
                ops: wgpu::Operations { load: wgpu::LoadOp::Clear(wgpu::Color::BLACK), store: wgpu::StoreOp::Store },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&mirror.blit);
        for eye in Eye::BOTH {
            let i = eye.index();
            let Some(texture) = eye_sources[i] else {
                continue;
            };
            let (uv_scale, uv_offset) = viewport_uv(&layer.viewport[i], texture.size, layer.flags);
            let uniforms = BlitUniforms { uv_scale, uv_offset };
            viewport_of(&mut pass, &eye_viewport(eye, mirror.size));
            self.set_layer_uniforms(&mut pass, bytemuck::bytes_of(&uniforms));
            pass.set_bind_group(1, &self.source_group(texture, layer.flags), &[]);
            pass.draw(0..3, 0..1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::OffscreenTarget;
    use crate::eye_pose::default_eye_offsets;
    use crate::hmd::HmdType;
    use crate::layer::{DirectLayer, EyeFovLayer};
    use crate::mesh::MeshCache;
    use crate::pose_source::StaticPoseSource;
    use crate::swap_chain::{wgpu_swap_texture, SwapTextureDesc};
    use crate::timewarp::compute_timewarp;
    use crate::timing::ManualClock;
    use crate::types::FovPort;
    use glam::{Quat, Vec2, Vec3};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[derive(Default)]
    struct CountingHook {
        saves: Arc<AtomicUsize>,
        restores: Arc<AtomicUsize>,
    }

    impl GraphicsStateHook for CountingHook {
        fn save(&mut self) {
            self.saves.fetch_add(1, Ordering::SeqCst);
        }
        fn restore(&mut self) {
            self.restores.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn guarded_early_return(hook: &mut dyn GraphicsStateHook, restore: bool, bail: bool) -> Option<()> {
        let _guard = GpuStateGuard::new(hook, restore);
        if bail {
            return None;
        }
        Some(())
    }

    #[test]
    fn state_guard_restores_on_every_path() {
        let mut hook = CountingHook::default();
        let (saves, restores) = (hook.saves.clone(), hook.restores.clone());
        assert!(guarded_early_return(&mut hook, true, true).is_none());
        assert!(guarded_early_return(&mut hook, true, false).is_some());
        assert_eq!(saves.load(Ordering::SeqCst), 2);
        assert_eq!(restores.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn no_restore_skips_the_hook() {
        let mut hook = CountingHook::default();
        let (saves, restores) = (hook.saves.clone(), hook.restores.clone());
        guarded_early_return(&mut hook, false, false);
        assert_eq!(saves.load(Ordering::SeqCst), 0);
        assert_eq!(restores.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn uniform_layouts_match_the_shader() {
        assert_eq!(std::mem::size_of::<EyeUniforms>(), 144);
        assert_eq!(std::mem::size_of::<OverdriveUniforms>(), 16);
        assert_eq!(std::mem::size_of::<QuadUniforms>(), 96);
        assert_eq!(std::mem::size_of::<DistortionVertex>(), 40);
    }

    fn test_layer(pose: Pose) -> EyeFovLayer {
        let handle = {
            let mut manager = SwapChainManager::new();
            manager.create_set(2, |_| Ok(())).unwrap()
        };
        EyeFovLayer {
            flags: LayerFlags::empty(),
            color: [handle; 2],
            viewport: [Recti::new(0, 0, 640, 800), Recti::new(640, 0, 640, 800)],
            fov: [FovPort::new(1.1, 1.2, 1.0, 0.9), FovPort::new(1.1, 1.2, 0.9, 1.0)],
            render_pose: [pose; 2],
        }
    }

    #[test]
    fn identity_timewarp_samples_like_plain_distortion() {
        let hmd = HmdDesc::debug(HmdType::Dk2);
        let pose = Pose::new(Quat::from_euler(glam::EulerRot::YXZ, 0.3, -0.1, 0.05), Vec3::new(0.0, 1.6, 0.0));
        let layer = test_layer(pose);
        let mut cache = MeshCache::new();
        let tw = compute_timewarp(&pose, &pose, &pose);

        for eye in Eye::BOTH {
            let mesh = cache.get_or_build(eye, &layer.fov[eye.index()], DistortionCaps::default(), 0.0, &hmd.render_info);
            let uv_map = eye_to_source_uv(&layer, eye, Sizei::new(1280, 800), DistortionCaps::default());
            for v in &mesh.vertices {
                for tan in [v.tan_eye_angles_r, v.tan_eye_angles_g, v.tan_eye_angles_b] {
                    let tan = Vec2::from(tan);
                    assert_eq!(tw.warp_to_source_uv(tan, v.timewarp_lerp, &uv_map), uv_map.apply(tan));
                }
            }
        }
    }

    #[test]
    fn bottom_left_origin_flips_v() {
        let mut layer = test_layer(Pose::IDENTITY);
        let size = Sizei::new(1280, 800);
        let plain = eye_to_source_uv(&layer, Eye::Left, size, DistortionCaps::empty());
        layer.flags = LayerFlags::TEXTURE_ORIGIN_AT_BOTTOM_LEFT;
        let flipped = eye_to_source_uv(&layer, Eye::Left, size, DistortionCaps::empty());
        let tan = Vec2::new(0.2, -0.4);
        let (a, b) = (plain.apply(tan), flipped.apply(tan));
        assert!((a.x - b.x).abs() < 1e-6);
        assert!((a.y + b.y - 1.0).abs() < 1e-6);
        assert_eq!(eye_to_source_uv(&test_layer(Pose::IDENTITY), Eye::Left, size, DistortionCaps::FLIP_INPUT), flipped);
    }

    #[test]
    fn hq_distortion_cap_selects_the_anisotropic_sampler() {
        assert!(!uses_hq_sampler(DistortionCaps::default(), LayerFlags::empty()));
        assert!(uses_hq_sampler(DistortionCaps::HQ_DISTORTION, LayerFlags::empty()));
        assert!(uses_hq_sampler(DistortionCaps::empty(), LayerFlags::HIGH_QUALITY));
    }

    #[test]
    fn head_locked_quad_ignores_head_pose() {
        let quad = QuadLayer {
            flags: LayerFlags::empty(),
            color: test_layer(Pose::IDENTITY).color[0],
            viewport: Recti::new(0, 0, 16, 16),
            placement: QuadPlacement::HeadLocked(Pose::new(Quat::IDENTITY, Vec3::new(0.0, 0.0, -2.0))),
            size: Vec2::ONE,
        };
        let turned = Pose::new(Quat::from_rotation_y(1.0), Vec3::new(3.0, 0.0, 0.0));
        let a = quad_from_eye(&quad, &Pose::IDENTITY, Vec3::ZERO, 1.0);
        let b = quad_from_eye(&quad, &turned, Vec3::ZERO, 1.0);
        assert!(a.abs_diff_eq(b, 1e-6));
        // The eye sits two meters in front of the quad plane.
        assert!((a.w_axis.z - 2.0).abs() < 1e-6);
    }

    struct GpuFixture {
        gpu: GpuContext,
        hmd: HmdDesc,
        swap_sets: SwapChainManager<SwapTexture>,
        layer: EyeFovLayer,
        scheduler: FrameScheduler,
        pose: StaticPoseSource,
    }

    fn gpu_fixture(pose: Pose) -> Option<GpuFixture> {
        init_logger();
        let gpu = match GpuContext::new_headless() {
            Ok(gpu) => gpu,
            Err(e) => {
                log::info!("Skipping GPU test: {}", e);
                return None;
            }
        };
        let hmd = HmdDesc::debug(HmdType::Dk2);
        let size = Sizei::new(128, 64);
        let mut swap_sets = SwapChainManager::new();
        let handle = swap_sets
            .create_set(2, wgpu_swap_texture(&gpu.device, SwapTextureDesc { size, format: wgpu::TextureFormat::Rgba8Unorm }))
            .unwrap();

        let pixels: Vec<u8> = (0..size.h)
            .flat_map(|y| (0..size.w).flat_map(move |x| [(x * 2) as u8, (y * 4) as u8, ((x ^ y) * 3) as u8, 255]))
            .collect();
        let texture = &swap_sets.current_texture(handle).unwrap().texture;
        gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &pixels,
            wgpu::TexelCopyBufferLayout { offset: 0, bytes_per_row: Some(size.w * 4), rows_per_image: Some(size.h) },
            wgpu::Extent3d { width: size.w, height: size.h, depth_or_array_layers: 1 },
        );
        swap_sets.commit(handle).unwrap();

        let layer = EyeFovLayer {
            flags: LayerFlags::empty(),
            color: [handle; 2],
            viewport: [Recti::new(0, 0, 64, 64), Recti::new(64, 0, 64, 64)],
            fov: hmd.default_eye_fov,
            render_pose: [pose; 2],
        };
        let config = RuntimeConfig::default();
        let scheduler = FrameScheduler::new(&hmd.render_info, &config, Arc::new(ManualClock::new(100.0)));
        scheduler.set_vsync_enabled(false);
        Some(GpuFixture { gpu, hmd, swap_sets, layer, scheduler, pose: StaticPoseSource::new(pose) })
    }

    fn render_once(fixture: &GpuFixture, caps: DistortionCaps, frame_index: u64) -> (SubmitStatus, Vec<u8>) {
        let config = RuntimeConfig { distortion_caps: caps, ..RuntimeConfig::default() };
        let mut renderer = DistortionRenderer::new(fixture.gpu.clone(), &fixture.hmd, &config);
        let mut target = OffscreenTarget::new(&fixture.gpu, Sizei::new(96, 48), wgpu::TextureFormat::Rgba8Unorm).unwrap();
        let mut cache = MeshCache::new();
        let meshes = Eye::BOTH.map(|eye| {
            cache.get_or_build(eye, &fixture.layer.fov[eye.index()], caps, 0.0, &fixture.hmd.render_info)
        });
        let layers = [Layer::EyeFov(fixture.layer), Layer::Disabled];

        fixture.scheduler.begin_frame(frame_index);
        let status = renderer
            .submit_frame(
                FrameSubmission {
                    frame_index,
                    layers: &layers,
                    view_scale: ViewScaleDesc { hmd_to_eye_offset: default_eye_offsets(0.064), world_meters_per_unit: 1.0 },
                    eye_meshes: meshes,
                    swap_sets: &fixture.swap_sets,
                    scheduler: &fixture.scheduler,
                    pose_source: &fixture.pose,
                },
                &mut target,
            )
            .unwrap();
        (status, target.read_pixels(&fixture.gpu).unwrap())
    }

    #[test]
    fn timewarp_with_unchanged_pose_matches_plain_distortion() {
        let pose = Pose::new(Quat::from_rotation_y(0.4), Vec3::new(0.0, 1.7, 0.0));
        let Some(fixture) = gpu_fixture(pose) else {
            return;
        };
        let base = DistortionCaps::CHROMATIC | DistortionCaps::VIGNETTE;
        let (status_tw, warped) = render_once(&fixture, base | DistortionCaps::TIMEWARP, 1);
        let (status_plain, plain) = render_once(&fixture, base, 2);
        assert_eq!(status_tw, SubmitStatus::Success);
        assert_eq!(status_plain, SubmitStatus::Success);
        assert!(warped.iter().any(|b| *b != 0), "warp produced a black frame");
        assert_eq!(warped, plain);
    }

    #[test]
    fn hidden_target_skips_the_frame_but_advances_timing() {
        let Some(fixture) = gpu_fixture(Pose::IDENTITY) else {
            return;
        };
        let config = RuntimeConfig::default();
        let mut renderer = DistortionRenderer::new(fixture.gpu.clone(), &fixture.hmd, &config);
        let mut target = OffscreenTarget::new(&fixture.gpu, Sizei::new(32, 16), wgpu::TextureFormat::Rgba8Unorm).unwrap();
        target.set_visible(false);
        let mut cache = MeshCache::new();
        let caps = renderer.caps();
        let meshes = Eye::BOTH.map(|eye| {
            cache.get_or_build(eye, &fixture.layer.fov[eye.index()], caps, 0.0, &fixture.hmd.render_info)
        });

        fixture.scheduler.begin_frame(5);
        let status = renderer
            .submit_frame(
                FrameSubmission {
                    frame_index: 5,
                    layers: &[Layer::EyeFov(fixture.layer)],
                    view_scale: ViewScaleDesc::default(),
                    eye_meshes: meshes,
                    swap_sets: &fixture.swap_sets,
                    scheduler: &fixture.scheduler,
                    pose_source: &fixture.pose,
                },
                &mut target,
            )
            .unwrap();
        assert_eq!(status, SubmitStatus::SuccessNotVisible);
        assert_eq!(target.presented_frames(), 0);
        assert_eq!(fixture.scheduler.frame_timing(0).frame_index, 6);
    }

    #[test]
    fn layer_uniforms_are_reused_across_frames() {
        let Some(fixture) = gpu_fixture(Pose::IDENTITY) else {
            return;
        };
        let mut renderer = DistortionRenderer::new(fixture.gpu.clone(), &fixture.hmd, &RuntimeConfig::default());
        let mut target = OffscreenTarget::new(&fixture.gpu, Sizei::new(32, 16), wgpu::TextureFormat::Rgba8Unorm).unwrap();
        let mut cache = MeshCache::new();
        let caps = renderer.caps();
        let direct = Layer::Direct(DirectLayer {
            flags: LayerFlags::empty(),
            color: fixture.layer.color,
            viewport: fixture.layer.viewport,
        });
        let layers = [Layer::EyeFov(fixture.layer), direct];

        for frame_index in 1..=3 {
            let meshes = Eye::BOTH.map(|eye| {
                cache.get_or_build(eye, &fixture.layer.fov[eye.index()], caps, 0.0, &fixture.hmd.render_info)
            });
            fixture.scheduler.begin_frame(frame_index);
            let status = renderer
                .submit_frame(
                    FrameSubmission {
                        frame_index,
                        layers: &layers,
                        view_scale: ViewScaleDesc::default(),
                        eye_meshes: meshes,
                        swap_sets: &fixture.swap_sets,
                        scheduler: &fixture.scheduler,
                        pose_source: &fixture.pose,
                    },
                    &mut target,
                )
                .unwrap();
            assert_eq!(status, SubmitStatus::Success);
            // One slot per eye for the direct layer, allocated on the first frame only.
            assert_eq!(renderer.layer_uniforms.borrow().slots.len(), 2);
        }
    }

    struct CountingPoseSource {
        pose: Pose,
        samples: Arc<AtomicUsize>,
    }

    impl PoseSource for CountingPoseSource {
        fn predicted_pose(&self, _absolute_time: f64) -> Option<Pose> {
            self.samples.fetch_add(1, Ordering::SeqCst);
            Some(self.pose)
        }
    }

    struct RecordingTarget {
        inner: OffscreenTarget,
        samples: Arc<AtomicUsize>,
        samples_at_acquire: Option<usize>,
    }

    impl DisplayTarget for RecordingTarget {
        fn acquire(&mut self) -> Result<TargetFrame, AcquireError> {
            self.samples_at_acquire = Some(self.samples.load(Ordering::SeqCst));
            self.inner.acquire()
        }
        fn present(&mut self, frame: TargetFrame) -> PresentOutcome {
            self.inner.present(frame)
        }
        fn format(&self) -> wgpu::TextureFormat {
            self.inner.format()
        }
        fn size(&self) -> Sizei {
            self.inner.size()
        }
    }

    #[test]
    fn timewarp_poses_are_sampled_after_acquire() {
        let Some(fixture) = gpu_fixture(Pose::IDENTITY) else {
            return;
        };
        let mut renderer = DistortionRenderer::new(fixture.gpu.clone(), &fixture.hmd, &RuntimeConfig::default());
        let caps = renderer.caps();
        assert!(caps.contains(DistortionCaps::TIMEWARP));
        let samples = Arc::new(AtomicUsize::new(0));
        let pose_source = CountingPoseSource { pose: Pose::IDENTITY, samples: samples.clone() };
        let mut target = RecordingTarget {
            inner: OffscreenTarget::new(&fixture.gpu, Sizei::new(32, 16), wgpu::TextureFormat::Rgba8Unorm).unwrap(),
            samples: samples.clone(),
            samples_at_acquire: None,
        };
        let mut cache = MeshCache::new();
        let meshes = Eye::BOTH.map(|eye| {
            cache.get_or_build(eye, &fixture.layer.fov[eye.index()], caps, 0.0, &fixture.hmd.render_info)
        });

        fixture.scheduler.begin_frame(1);
        let status = renderer
            .submit_frame(
                FrameSubmission {
                    frame_index: 1,
                    layers: &[Layer::EyeFov(fixture.layer)],
                    view_scale: ViewScaleDesc::default(),
                    eye_meshes: meshes,
                    swap_sets: &fixture.swap_sets,
                    scheduler: &fixture.scheduler,
                    pose_source: &pose_source,
                },
                &mut target,
            )
            .unwrap();
        assert_eq!(status, SubmitStatus::Success);
        assert_eq!(target.samples_at_acquire, Some(0));
        // Start and end of the window for both eyes.
        assert_eq!(samples.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn mirror_texture_lifecycle() {
        let Some(fixture) = gpu_fixture(Pose::IDENTITY) else {
            return;
        };
        let mut renderer = DistortionRenderer::new(fixture.gpu.clone(), &fixture.hmd, &RuntimeConfig::default());
        assert!(renderer.create_mirror_texture(Sizei::new(0, 10), wgpu::TextureFormat::Rgba8Unorm).is_err());
        renderer.create_mirror_texture(Sizei::new(64, 32), wgpu::TextureFormat::Rgba8Unorm).unwrap();
        assert!(renderer.mirror_texture().is_some());
        renderer.destroy_mirror_texture();
        assert!(renderer.mirror_texture().is_none());
    }
}

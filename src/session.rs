//! Sessions
//!
//! A `Session` is everything the runtime knows about one headset: the device
//! description, the frame scheduler, the pose source, meshes, swap sets and
//! the renderer. There is no global state; callers hold sessions in a
//! `SessionTable` and refer to them through `HmdHandle`s.

use std::sync::Arc;

use glam::Vec3;
use log::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::display::{DisplayTarget, GpuContext};
use crate::error::{VrError, VrResult};
use crate::eye_pose::{calc_eye_poses, EyeRenderDesc};
use crate::hmd::{DistortionCaps, HmdCaps, HmdDesc};
use crate::layer::{Layer, ViewScaleDesc};
use crate::mesh::{DistortionMesh, MeshCache};
use crate::pose_source::{Pose, PoseSource};
use crate::renderer::{DistortionRenderer, FrameSubmission, SubmitStatus};
use crate::swap_chain::{wgpu_swap_texture, SwapChainManager, SwapSetHandle, SwapTexture, SwapTextureDesc};
use crate::timing::{Clock, FrameScheduler, FrameTiming};
use crate::types::{Eye, FovPort, Sizei};

pub struct Session {
    hmd: Arc<HmdDesc>,
    config: RuntimeConfig,
    scheduler: Arc<FrameScheduler>,
    pose_source: Arc<dyn PoseSource>,
    caps: DistortionCaps,
    eye_render_desc: [EyeRenderDesc; 2],
    meshes: MeshCache,
    swap_sets: SwapChainManager<SwapTexture>,
    renderer: Option<DistortionRenderer>,
    target: Option<Box<dyn DisplayTarget + Send>>,
    last_error: Option<VrError>,
}

impl Session {
    pub fn new(
        hmd: HmdDesc,
        config: RuntimeConfig,
        pose_source: Arc<dyn PoseSource>,
        clock: Arc<dyn Clock>,
    ) -> VrResult<Self> {
        config.validate()?;
        let scheduler = Arc::new(FrameScheduler::new(&hmd.render_info, &config, clock));
        let fovs = hmd.default_eye_fov;
        let hmd = Arc::new(hmd);
        let eye_render_desc = Eye::BOTH
            .map(|eye| EyeRenderDesc::new(eye, fovs[eye.index()], &hmd.render_info, config.eye_relief, config.ipd));

        let mut session = Self {
            caps: config.distortion_caps & hmd.distortion_caps,
            hmd,
            config,
            scheduler,
            pose_source,
            eye_render_desc,
            meshes: MeshCache::new(),
            swap_sets: SwapChainManager::new(),
            renderer: None,
            target: None,
            last_error: None,
        };
        let caps = session.config.distortion_caps;
        session.configure_rendering(caps, fovs)?;
        info!("Session created for {}", session.hmd.product_name);
        Ok(session)
    }

    /// Read-only device description
    pub fn hmd_desc(&self) -> &HmdDesc {
        &self.hmd
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn caps(&self) -> DistortionCaps {
        self.caps
    }

    /// Shared with other threads that want frame predictions
    pub fn scheduler(&self) -> &Arc<FrameScheduler> {
        &self.scheduler
    }

    /// Picks the distortion caps and per-eye FOVs.
    ///
    /// Caps the device lacks are dropped. Cached meshes are discarded.
    pub fn configure_rendering(&mut self, caps: DistortionCaps, fovs: [FovPort; 2]) -> VrResult<[EyeRenderDesc; 2]> {
        if let Some(bad) = fovs.iter().find(|fov| !fov.is_valid()) {
            return Err(VrError::InvalidArgument(format!("eye fov {:?}", bad)));
        }
        let supported = caps & self.hmd.distortion_caps;
        if supported != caps {
            warn!("Distortion caps {:?} not supported by {}", caps - supported, self.hmd.product_name);
        }
        self.caps = supported;

        let render_info = &self.hmd.render_info;
        self.eye_render_desc = Eye::BOTH.map(|eye| {
            EyeRenderDesc::new(eye, fovs[eye.index()], render_info, self.config.eye_relief, self.config.ipd)
        });
        self.meshes.invalidate();

        self.scheduler
            .set_jit_enabled(self.config.jit_timewarp && supported.contains(DistortionCaps::TIMEWARP_JIT_DELAY));
        self.scheduler.set_vsync_enabled(self.vsync_enabled());
        self.scheduler.set_timewarp_fraction(self.config.timewarp_fraction);
        if let Some(renderer) = &mut self.renderer {
            renderer.set_caps(supported, self.config.effective_wait_mode(supported));
        }
        debug!("Rendering configured: {:?}", supported);
        Ok(self.eye_render_desc)
    }

    fn vsync_enabled(&self) -> bool {
        self.config.vsync && !self.hmd.hmd_caps.contains(HmdCaps::NO_VSYNC)
    }

    pub fn eye_render_desc(&self, eye: Eye) -> &EyeRenderDesc {
        &self.eye_render_desc[eye.index()]
    }

    /// Head pose at `absolute_time`, identity until tracking has data
    pub fn tracking_state(&self, absolute_time: f64) -> Pose {
        self.pose_source.predicted_pose(absolute_time).unwrap_or(Pose::IDENTITY)
    }

    /// Both eye poses for a frame from one head sample at its scanout midpoint
    pub fn eye_poses(&self, frame_index: u64, hmd_to_eye_offsets: [Vec3; 2]) -> [Pose; 2] {
        let timing = self.scheduler.frame_timing(frame_index);
        let head = self.tracking_state(timing.scanout_midpoint_time);
        calc_eye_poses(&head, hmd_to_eye_offsets)
    }

    pub fn create_distortion_mesh(&mut self, eye: Eye, fov: &FovPort, caps: DistortionCaps) -> Arc<DistortionMesh> {
        self.meshes
            .get_or_build(eye, fov, caps & self.hmd.distortion_caps, self.config.eye_relief, &self.hmd.render_info)
    }

    /// Releases a mesh handed out by `create_distortion_mesh` and clears the
    /// caller's reference
    pub fn destroy_distortion_mesh(mesh: &mut Option<Arc<DistortionMesh>>) {
        mesh.take();
    }

    pub fn frame_timing(&self, frame_index: u64) -> FrameTiming {
        self.scheduler.frame_timing(frame_index)
    }

    pub fn begin_frame(&self, frame_index: u64) -> FrameTiming {
        self.scheduler.begin_frame(frame_index)
    }

    /// Reseeds the frame grid, e.g. after a vsync or video mode change
    pub fn reset_frame_timing(&self, frame_index: u64) {
        self.scheduler.reset_frame_timing(frame_index, self.vsync_enabled());
    }

    /// Hooks the session up to a GPU and a display
    pub fn attach_renderer(&mut self, gpu: GpuContext, target: Box<dyn DisplayTarget + Send>) {
        let mut renderer = DistortionRenderer::new(gpu, &self.hmd, &self.config);
        renderer.set_caps(self.caps, self.config.effective_wait_mode(self.caps));
        self.renderer = Some(renderer);
        self.target = Some(target);
    }

    pub fn renderer(&self) -> Option<&DistortionRenderer> {
        self.renderer.as_ref()
    }

    pub fn renderer_mut(&mut self) -> Option<&mut DistortionRenderer> {
        self.renderer.as_mut()
    }

    /// Warps and presents a frame. Errors land in `last_error`.
    pub fn submit_frame(&mut self, frame_index: u64, view_scale: Option<ViewScaleDesc>, layers: &[Layer]) -> SubmitStatus {
        let fovs = layers
            .iter()
            .find_map(Layer::eye_fov)
            .map(|layer| layer.fov)
            .unwrap_or(self.eye_render_desc.map(|desc| desc.fov));
        let caps = self.caps;
        let eye_meshes = Eye::BOTH.map(|eye| {
            self.meshes
                .get_or_build(eye, &fovs[eye.index()], caps, self.config.eye_relief, &self.hmd.render_info)
        });
        let view_scale = view_scale.unwrap_or(ViewScaleDesc {
            hmd_to_eye_offset: self.eye_render_desc.map(|desc| desc.hmd_to_eye_offset),
            world_meters_per_unit: 1.0,
        });

        let (Some(renderer), Some(target)) = (self.renderer.as_mut(), self.target.as_mut()) else {
            warn!("submit_frame({}) without a renderer", frame_index);
            self.last_error = Some(VrError::NotConfigured("no renderer attached"));
            return SubmitStatus::Error;
        };

        let submission = FrameSubmission {
            frame_index,
            layers,
            view_scale,
            eye_meshes,
            swap_sets: &self.swap_sets,
            scheduler: &self.scheduler,
            pose_source: self.pose_source.as_ref(),
        };
        match renderer.submit_frame(submission, target.as_mut()) {
            Ok(status) => status,
            Err(e) => {
                error!("Frame {} failed: {}", frame_index, e);
                self.last_error = Some(e);
                SubmitStatus::Error
            }
        }
    }

    pub fn last_error(&self) -> Option<&VrError> {
        self.last_error.as_ref()
    }

    pub fn swap_sets(&self) -> &SwapChainManager<SwapTexture> {
        &self.swap_sets
    }

    /// For the app side of the ring: `current_texture`, `commit`, `advance_index`
    pub fn swap_sets_mut(&mut self) -> &mut SwapChainManager<SwapTexture> {
        &mut self.swap_sets
    }

    pub fn create_swap_texture_set(&mut self, count: usize, desc: SwapTextureDesc) -> VrResult<SwapSetHandle> {
        let renderer = self.renderer.as_ref().ok_or(VrError::NotConfigured("no renderer attached"))?;
        let device = renderer.gpu().device.clone();
        self.swap_sets.create_set(count, wgpu_swap_texture(&device, desc))
    }

    pub fn destroy_swap_texture_set(&mut self, handle: SwapSetHandle) -> VrResult<()> {
        self.swap_sets.destroy(handle)
    }

    /// Mirror in the display's format; each eye lands in its half undistorted
    pub fn create_mirror_texture(&mut self, size: Sizei) -> VrResult<&wgpu::Texture> {
        let (Some(renderer), Some(target)) = (self.renderer.as_mut(), self.target.as_ref()) else {
            return Err(VrError::NotConfigured("no renderer attached"));
        };
        renderer.create_mirror_texture(size, target.format())
    }

    pub fn destroy_mirror_texture(&mut self) {
        if let Some(renderer) = &mut self.renderer {
            renderer.destroy_mirror_texture();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.swap_sets.clear();
        debug!("Session for {} closed", self.hmd.product_name);
    }
}

/// Opaque reference to a session; stale after `destroy`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HmdHandle {
    index: u32,
    generation: u32,
}

struct SessionSlot {
    generation: u32,
    session: Option<Session>,
}

#[derive(Default)]
pub struct SessionTable {
    slots: Vec<SessionSlot>,
    free: Vec<u32>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &mut self,
        hmd: HmdDesc,
        config: RuntimeConfig,
        pose_source: Arc<dyn PoseSource>,
        clock: Arc<dyn Clock>,
    ) -> VrResult<HmdHandle> {
        let session = Session::new(hmd, config, pose_source, clock)?;
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.session = Some(session);
                HmdHandle { index, generation: slot.generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(SessionSlot { generation: 0, session: Some(session) });
                HmdHandle { index, generation: 0 }
            }
        };
        Ok(handle)
    }

    pub fn get(&self, handle: HmdHandle) -> VrResult<&Session> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.session.as_ref())
            .ok_or(VrError::InvalidHandle)
    }

    pub fn get_mut(&mut self, handle: HmdHandle) -> VrResult<&mut Session> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.session.as_mut())
            .ok_or(VrError::InvalidHandle)
    }

    pub fn destroy(&mut self, handle: HmdHandle) -> VrResult<()> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.session.is_some())
            .ok_or(VrError::InvalidHandle)?;
        slot.session = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.session.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Distortion mesh generation
//!
//! Each eye gets a 64x64 cell grid laid over its render target. Every grid
//! point is pushed through the inverse lens curve to find where on the panel
//! it lands; the vertex then carries that panel position plus the per-channel
//! directions the fragment stage samples.
//!
//! A mesh is a pure function of (eye, fov, caps, eye relief), so the session
//! keeps built meshes in a `MeshCache` until one of those changes.

use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use log::{debug, warn};

use crate::hmd::{DistortionCaps, HmdRenderInfo, ShutterType, VignetteParams};
use crate::lens::{lens_config_from_eye_relief, DistortionRenderDesc};
use crate::types::{Eye, FovPort, ScaleAndOffset2D};

/// Cells per side; must be a power of two for the Morton walk
pub const GRID_SIZE: usize = 64;
pub const VERTICES_PER_EYE: usize = (GRID_SIZE + 1) * (GRID_SIZE + 1);
pub const TRIANGLES_PER_EYE: usize = GRID_SIZE * GRID_SIZE * 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct DistortionVertex {
    /// Position in the eye's own viewport NDC, y up
    pub screen_pos_ndc: [f32; 2],
    pub tan_eye_angles_r: [f32; 2],
    pub tan_eye_angles_g: [f32; 2],
    pub tan_eye_angles_b: [f32; 2],
    pub vignette: f32,
    /// 0 samples the start timewarp matrix, 1 the end one
    pub timewarp_lerp: f32,
}

impl DistortionVertex {
    fn is_finite(&self) -> bool {
        self.screen_pos_ndc
            .iter()
            .chain(&self.tan_eye_angles_r)
            .chain(&self.tan_eye_angles_g)
            .chain(&self.tan_eye_angles_b)
            .chain([&self.vignette, &self.timewarp_lerp])
            .all(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DistortionMesh {
    pub vertices: Vec<DistortionVertex>,
    pub indices: Vec<u16>,
}

impl DistortionMesh {
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.indices.is_empty()
    }
}

/// Builds the distortion mesh for one eye.
///
/// `eye_relief` of 0 uses the device calibration. Bad input yields an empty
/// mesh rather than a partial one.
pub fn build_mesh(
    eye: Eye,
    fov: &FovPort,
    caps: DistortionCaps,
    eye_relief: f32,
    hmd: &HmdRenderInfo,
) -> DistortionMesh {
    if !fov.is_valid() {
        warn!("Distortion mesh not built: invalid FOV {:?}", fov);
        return DistortionMesh::default();
    }
    if !eye_relief.is_finite() || eye_relief < 0.0 {
        warn!("Distortion mesh not built: invalid eye relief {}", eye_relief);
        return DistortionMesh::default();
    }

    let relief = if eye_relief > 0.0 { eye_relief } else { hmd.eye(eye).relief_in_meters };
    let distortion = DistortionRenderDesc::new(eye, hmd, lens_config_from_eye_relief(relief, hmd.eye_cups));
    let eye_to_source_ndc = fov.to_ndc_scale_and_offset();

    let mut vertices = Vec::with_capacity(VERTICES_PER_EYE);
    for y in 0..=GRID_SIZE {
        for x in 0..=GRID_SIZE {
            let source_ndc = Vec2::new(
                2.0 * (x as f32 / GRID_SIZE as f32) - 1.0,
                2.0 * (y as f32 / GRID_SIZE as f32) - 1.0,
            );
            let tan_eye_angle = eye_to_source_ndc.invert(source_ndc);
            // Clamped so no vertex spills into the other eye's half.
            let screen_ndc = distortion
                .tan_fov_space_to_screen_ndc(tan_eye_angle, false)
                .clamp(Vec2::NEG_ONE, Vec2::ONE);
            vertices.push(make_vertex(screen_ndc, eye, caps, hmd, &distortion, &eye_to_source_ndc));
        }
    }

    if let Some(bad) = vertices.iter().position(|v| !v.is_finite()) {
        warn!("Distortion mesh for {:?} discarded: vertex {} is not finite", eye, bad);
        return DistortionMesh::default();
    }

    debug!("Built {:?} distortion mesh, fov {:?}, caps {:?}", eye, fov, caps);
    DistortionMesh { vertices, indices: grid_indices() }
}

fn make_vertex(
    screen_ndc: Vec2,
    eye: Eye,
    caps: DistortionCaps,
    hmd: &HmdRenderInfo,
    distortion: &DistortionRenderDesc,
    eye_to_source_ndc: &ScaleAndOffset2D,
) -> DistortionVertex {
    let [red, green, blue] = if caps.contains(DistortionCaps::CHROMATIC) {
        distortion.screen_ndc_to_tan_fov_space_chroma(screen_ndc)
    } else {
        let green = distortion.screen_ndc_to_tan_fov_space(screen_ndc);
        [green; 3]
    };

    let vignette = if caps.contains(DistortionCaps::VIGNETTE) {
        vignette_factor(screen_ndc, blue, eye, &hmd.vignette, eye_to_source_ndc)
    } else {
        1.0
    };

    let timewarp_lerp = if caps.contains(DistortionCaps::TIMEWARP) {
        timewarp_lerp(screen_ndc, eye, hmd.shutter.shutter_type)
    } else {
        0.0
    };

    DistortionVertex {
        screen_pos_ndc: [screen_ndc.x, -screen_ndc.y],
        tan_eye_angles_r: red.to_array(),
        tan_eye_angles_g: green.to_array(),
        tan_eye_angles_b: blue.to_array(),
        vignette,
        timewarp_lerp,
    }
}

/// Edge fade from both the source texture edge and the panel edge.
///
/// Blue spreads furthest through the lens, so it decides the texture edge.
fn vignette_factor(
    screen_ndc: Vec2,
    blue_tan: Vec2,
    eye: Eye,
    params: &VignetteParams,
    eye_to_source_ndc: &ScaleAndOffset2D,
) -> f32 {
    let mut blue = eye_to_source_ndc.apply(blue_tan);
    if eye.is_right() {
        // +1 is the inner edge for both eyes.
        blue.x = -blue.x;
    }
    let texture = 1.0 / params.texture_border_fraction;
    let inner = 1.0 / params.texture_inner_edge_fraction;
    let fade = (inner * (1.0 - blue.x))
        .min(texture * (1.0 + blue.x))
        .min(texture * (1.0 - blue.y))
        .min(texture * (1.0 + blue.y));
    let screen = (1.0 / params.screen_border_fraction) * (1.0 - screen_ndc.x.abs().max(screen_ndc.y.abs()));
    (fade.min(screen) + params.floor).clamp(0.0, 1.0)
}

/// Where in the scanout window this panel position is lit
fn timewarp_lerp(screen_ndc: Vec2, eye: Eye, shutter: ShutterType) -> f32 {
    let lerp = match shutter {
        ShutterType::Global => 0.0,
        // Left eye covers 0..0.5 of the scan, right eye 0.5..1.
        ShutterType::RollingLeftToRight => {
            screen_ndc.x * 0.25 + 0.25 + if eye.is_right() { 0.5 } else { 0.0 }
        }
        ShutterType::RollingRightToLeft => {
            0.75 - screen_ndc.x * 0.25 - if eye.is_right() { 0.5 } else { 0.0 }
        }
        ShutterType::RollingTopToBottom => screen_ndc.y * 0.5 + 0.5,
    };
    lerp.clamp(0.0, 1.0)
}

/// Two triangles per cell, walked in Morton order.
///
/// Cells in two opposite quadrants split along the other diagonal, so no
/// triangle edge runs across the lens center.
fn grid_indices() -> Vec<u16> {
    let stride = GRID_SIZE + 1;
    let half = GRID_SIZE / 2;
    let mut indices = Vec::with_capacity(TRIANGLES_PER_EYE * 3);
    for cell in 0..GRID_SIZE * GRID_SIZE {
        let (x, y) = morton_decode(cell);
        let first = (x * stride + y) as u16;
        let right = first + 1;
        let below = first + stride as u16;
        let diagonal = below + 1;
        if (x < half) != (y < half) {
            indices.extend_from_slice(&[first, right, diagonal, diagonal, below, first]);
        } else {
            indices.extend_from_slice(&[first, right, below, right, diagonal, below]);
        }
    }
    indices
}

/// x from the even bits, y from the odd bits
fn morton_decode(n: usize) -> (usize, usize) {
    let compact = |mut v: usize| {
        let mut out = 0;
        let mut bit = 0;
        while v != 0 {
            out |= (v & 1) << bit;
            v >>= 2;
            bit += 1;
        }
        out
    };
    (compact(n), compact(n >> 1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MeshKey {
    eye: Eye,
    fov: [u32; 4],
    caps: DistortionCaps,
    relief: u32,
}

/// Built meshes, shared until an input changes
#[derive(Debug, Default)]
pub struct MeshCache {
    meshes: HashMap<MeshKey, Arc<DistortionMesh>>,
}

impl MeshCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(
        &mut self,
        eye: Eye,
        fov: &FovPort,
        caps: DistortionCaps,
        eye_relief: f32,
        hmd: &HmdRenderInfo,
    ) -> Arc<DistortionMesh> {
        let caps = caps.mesh_relevant();
        let key = MeshKey { eye, fov: fov.to_bits(), caps, relief: eye_relief.to_bits() };
        self.meshes
            .entry(key)
            .or_insert_with(|| Arc::new(build_mesh(eye, fov, caps, eye_relief, hmd)))
            .clone()
    }

    pub fn invalidate(&mut self) {
        if !self.meshes.is_empty() {
            debug!("Dropping {} cached distortion meshes", self.meshes.len());
        }
        self.meshes.clear();
    }

    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }
}

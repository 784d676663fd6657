//! Layers submitted for a frame
//!
//! A frame is a list of layers composited in order. The first eye layer is
//! distorted and timewarped; quads and direct layers are drawn over it.

use bitflags::bitflags;
use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::error::{VrError, VrResult};
use crate::eye_pose::{default_eye_offsets, DEFAULT_IPD};
use crate::pose_source::Pose;
use crate::swap_chain::SwapSetHandle;
use crate::types::{FovPort, Recti, Sizei};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
    pub struct LayerFlags: u32 {
        /// Sample with the higher quality filter
        const HIGH_QUALITY = 0x01;
        const TEXTURE_ORIGIN_AT_BOTTOM_LEFT = 0x02;
    }
}

/// Stereo pair rendered with a known FOV and pose per eye
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeFovLayer {
    pub flags: LayerFlags,
    /// May name the same set twice when both eyes share a texture
    pub color: [SwapSetHandle; 2],
    pub viewport: [Recti; 2],
    pub fov: [FovPort; 2],
    pub render_pose: [Pose; 2],
}

/// Projection terms needed to turn depth back into distance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionDesc {
    pub projection22: f32,
    pub projection23: f32,
    pub projection32: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeFovDepthLayer {
    pub eye: EyeFovLayer,
    pub depth: [SwapSetHandle; 2],
    pub projection: ProjectionDesc,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QuadPlacement {
    /// Fixed in tracking space
    InWorld(Pose),
    /// Relative to the head, follows it around
    HeadLocked(Pose),
}

impl QuadPlacement {
    pub fn pose(&self) -> &Pose {
        match self {
            QuadPlacement::InWorld(pose) | QuadPlacement::HeadLocked(pose) => pose,
        }
    }
}

/// Flat textured rectangle, shown to both eyes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadLayer {
    pub flags: LayerFlags,
    pub color: SwapSetHandle,
    pub viewport: Recti,
    pub placement: QuadPlacement,
    /// Width and height in meters
    pub size: Vec2,
}

/// Copied straight into each eye's half of the panel, no distortion
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectLayer {
    pub flags: LayerFlags,
    pub color: [SwapSetHandle; 2],
    pub viewport: [Recti; 2],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Layer {
    EyeFov(EyeFovLayer),
    EyeFovDepth(EyeFovDepthLayer),
    Quad(QuadLayer),
    Direct(DirectLayer),
    Disabled,
}

impl Layer {
    /// The stereo part of an eye layer
    pub fn eye_fov(&self) -> Option<&EyeFovLayer> {
        match self {
            Layer::EyeFov(layer) => Some(layer),
            Layer::EyeFovDepth(layer) => Some(&layer.eye),
            _ => None,
        }
    }

    pub fn flags(&self) -> LayerFlags {
        match self {
            Layer::EyeFov(layer) => layer.flags,
            Layer::EyeFovDepth(layer) => layer.eye.flags,
            Layer::Quad(layer) => layer.flags,
            Layer::Direct(layer) => layer.flags,
            Layer::Disabled => LayerFlags::empty(),
        }
    }

    /// Checks the layer against the live swap sets.
    ///
    /// `texture_size` returns the size of a set's textures, or `None` for a
    /// stale handle.
    pub fn validate(&self, texture_size: impl Fn(SwapSetHandle) -> Option<Sizei>) -> VrResult<()> {
        match self {
            Layer::EyeFov(layer) => validate_eye(layer, &texture_size),
            Layer::EyeFovDepth(layer) => {
                validate_eye(&layer.eye, &texture_size)?;
                for (depth, viewport) in layer.depth.iter().zip(&layer.eye.viewport) {
                    check_viewport(*depth, viewport, &texture_size)?;
                }
                let p = &layer.projection;
                if ![p.projection22, p.projection23, p.projection32].iter().all(|v| v.is_finite()) {
                    return Err(VrError::InvalidArgument("depth projection is not finite".into()));
                }
                Ok(())
            }
            Layer::Quad(layer) => {
                check_viewport(layer.color, &layer.viewport, &texture_size)?;
                if !(layer.size.is_finite() && layer.size.x > 0.0 && layer.size.y > 0.0) {
                    return Err(VrError::InvalidArgument(format!("quad size {:?}", layer.size)));
                }
                check_pose(layer.placement.pose())
            }
            Layer::Direct(layer) => {
                for (color, viewport) in layer.color.iter().zip(&layer.viewport) {
                    check_viewport(*color, viewport, &texture_size)?;
                }
                Ok(())
            }
            Layer::Disabled => Ok(()),
        }
    }
}

fn validate_eye(layer: &EyeFovLayer, texture_size: &impl Fn(SwapSetHandle) -> Option<Sizei>) -> VrResult<()> {
    for eye in 0..2 {
        check_viewport(layer.color[eye], &layer.viewport[eye], texture_size)?;
        if !layer.fov[eye].is_valid() {
            return Err(VrError::InvalidArgument(format!("eye {} fov {:?}", eye, layer.fov[eye])));
        }
        check_pose(&layer.render_pose[eye])?;
    }
    Ok(())
}

fn check_viewport(
    set: SwapSetHandle,
    viewport: &Recti,
    texture_size: &impl Fn(SwapSetHandle) -> Option<Sizei>,
) -> VrResult<()> {
    let size = texture_size(set).ok_or(VrError::InvalidHandle)?;
    if viewport.is_empty() || !viewport.fits_within(size) {
        return Err(VrError::InvalidArgument(format!(
            "viewport {:?} outside texture {:?}",
            viewport, size
        )));
    }
    Ok(())
}

fn check_pose(pose: &Pose) -> VrResult<()> {
    if pose.position.is_finite() && pose.orientation.is_finite() {
        Ok(())
    } else {
        Err(VrError::InvalidArgument("pose is not finite".into()))
    }
}

/// How the app's world units relate to the tracked eyes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewScaleDesc {
    pub hmd_to_eye_offset: [Vec3; 2],
    pub world_meters_per_unit: f32,
}

impl Default for ViewScaleDesc {
    fn default() -> Self {
        Self { hmd_to_eye_offset: default_eye_offsets(DEFAULT_IPD), world_meters_per_unit: 1.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap_chain::SwapChainManager;

    fn sets() -> (SwapChainManager<Sizei>, SwapSetHandle) {
        let mut manager = SwapChainManager::new();
        let handle = manager.create_set(2, |_| Ok(Sizei::new(1024, 1024))).unwrap();
        (manager, handle)
    }

    fn eye_layer(handle: SwapSetHandle) -> EyeFovLayer {
        EyeFovLayer {
            flags: LayerFlags::empty(),
            color: [handle; 2],
            viewport: [Recti::new(0, 0, 512, 1024), Recti::new(512, 0, 512, 1024)],
            fov: [FovPort::symmetric(1.0); 2],
            render_pose: [Pose::IDENTITY; 2],
        }
    }

    #[test]
    fn shared_texture_eye_layer_is_valid() {
        let (manager, handle) = sets();
        let lookup = |h| manager.get(h).ok().map(|set| set.textures()[0]);
        assert!(Layer::EyeFov(eye_layer(handle)).validate(lookup).is_ok());
        assert!(Layer::Disabled.validate(lookup).is_ok());
    }

    #[test]
    fn viewport_outside_texture_is_rejected() {
        let (manager, handle) = sets();
        let lookup = |h| manager.get(h).ok().map(|set| set.textures()[0]);
        let mut layer = eye_layer(handle);
        layer.viewport[1] = Recti::new(600, 0, 512, 1024);
        assert!(matches!(Layer::EyeFov(layer).validate(lookup), Err(VrError::InvalidArgument(_))));
    }

    #[test]
    fn stale_handle_is_rejected() {
        let (mut manager, handle) = sets();
        manager.destroy(handle).unwrap();
        let lookup = |h| manager.get(h).ok().map(|set| set.textures()[0]);
        assert!(matches!(Layer::EyeFov(eye_layer(handle)).validate(lookup), Err(VrError::InvalidHandle)));
    }

    #[test]
    fn quad_needs_positive_size() {
        let (manager, handle) = sets();
        let lookup = |h| manager.get(h).ok().map(|set| set.textures()[0]);
        let mut quad = QuadLayer {
            flags: LayerFlags::HIGH_QUALITY,
            color: handle,
            viewport: Recti::new(0, 0, 256, 256),
            placement: QuadPlacement::HeadLocked(Pose::new(glam::Quat::IDENTITY, Vec3::new(0.0, 0.0, -1.0))),
            size: Vec2::new(0.5, 0.25),
        };
        assert!(Layer::Quad(quad).validate(lookup).is_ok());
        quad.size.y = 0.0;
        assert!(Layer::Quad(quad).validate(lookup).is_err());
    }

    #[test]
    fn depth_layer_exposes_its_eye_part() {
        let (manager, handle) = sets();
        let lookup = |h| manager.get(h).ok().map(|set| set.textures()[0]);
        let layer = Layer::EyeFovDepth(EyeFovDepthLayer {
            eye: eye_layer(handle),
            depth: [handle; 2],
            projection: ProjectionDesc { projection22: -1.0, projection23: -0.1, projection32: -1.0 },
        });
        assert!(layer.validate(lookup).is_ok());
        assert_eq!(layer.eye_fov(), Some(&eye_layer(handle)));
        assert!(Layer::Direct(DirectLayer {
            flags: LayerFlags::empty(),
            color: [handle; 2],
            viewport: [Recti::new(0, 0, 10, 10); 2],
        })
        .eye_fov()
        .is_none());
    }
}

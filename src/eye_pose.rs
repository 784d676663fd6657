//! Eye poses and per-eye render descriptions

use glam::{Vec2, Vec3};

use crate::hmd::HmdRenderInfo;
use crate::lens::{lens_config_from_eye_relief, DistortionRenderDesc};
use crate::pose_source::Pose;
use crate::types::{Eye, FovPort, Recti, Sizei};

/// Profile default inter-pupillary distance, meters
pub const DEFAULT_IPD: f32 = 0.064;

/// Head-to-eye vectors for an IPD, left eye first
pub fn default_eye_offsets(ipd: f32) -> [Vec3; 2] {
    [Vec3::new(-ipd * 0.5, 0.0, 0.0), Vec3::new(ipd * 0.5, 0.0, 0.0)]
}

/// Derives both eye poses from a single head sample.
///
/// Both eyes get the head orientation; positions are the head position plus
/// each offset rotated into the head frame. Velocities and the timestamp are
/// carried over unchanged.
pub fn calc_eye_poses(head: &Pose, eye_offsets: [Vec3; 2]) -> [Pose; 2] {
    let head = head.normalized();
    eye_offsets.map(|offset| Pose {
        position: head.position + head.orientation * offset,
        ..head
    })
}

/// Fixed per-eye rendering parameters for a chosen FOV
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeRenderDesc {
    pub eye: Eye,
    pub fov: FovPort,
    /// Region of the display panel this eye is warped into
    pub distorted_viewport: Recti,
    pub pixels_per_tan_angle_at_center: Vec2,
    pub hmd_to_eye_offset: Vec3,
}

impl EyeRenderDesc {
    pub fn new(eye: Eye, fov: FovPort, hmd: &HmdRenderInfo, eye_relief: f32, ipd: f32) -> Self {
        let relief = if eye_relief > 0.0 { eye_relief } else { hmd.eye(eye).relief_in_meters };
        let lens = lens_config_from_eye_relief(relief, hmd.eye_cups);
        let distortion = DistortionRenderDesc::new(eye, hmd, lens);
        Self {
            eye,
            fov,
            distorted_viewport: framebuffer_viewport(eye, hmd),
            pixels_per_tan_angle_at_center: distortion.pixels_per_tan_angle_at_center,
            hmd_to_eye_offset: default_eye_offsets(ipd)[eye.index()],
        }
    }
}

/// Half of the panel owned by an eye; the right half rounds up
pub fn framebuffer_viewport(eye: Eye, hmd: &HmdRenderInfo) -> Recti {
    eye_viewport(eye, hmd.resolution_in_pixels)
}

/// Same split for a target of any size
pub fn eye_viewport(eye: Eye, size: Sizei) -> Recti {
    let x = if eye.is_right() { ((size.w + 1) / 2) as i32 } else { 0 };
    Recti::new(x, 0, size.w / 2, size.h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmd::{HmdDesc, HmdType};
    use glam::Quat;

    #[test]
    fn both_eyes_share_head_orientation() {
        let head = Pose::new(Quat::from_euler(glam::EulerRot::YXZ, 0.4, -0.2, 0.1), Vec3::new(0.1, 1.6, -0.3));
        let eyes = calc_eye_poses(&head, default_eye_offsets(DEFAULT_IPD));
        assert_eq!(eyes[0].orientation, eyes[1].orientation);
        assert_eq!(eyes[0].orientation, head.normalized_orientation());
        assert!(eyes[0].orientation.abs_diff_eq(head.orientation, 1e-6));
    }

    #[test]
    fn eye_positions_follow_head_rotation() {
        let head = Pose::new(Quat::from_rotation_y(std::f32::consts::FRAC_PI_2), Vec3::ZERO);
        let eyes = calc_eye_poses(&head, default_eye_offsets(0.064));
        // A quarter turn left carries the right eye from +X toward -Z.
        assert!((eyes[1].position - Vec3::new(0.0, 0.0, -0.032)).length() < 1e-6);
        assert!((eyes[0].position - Vec3::new(0.0, 0.0, 0.032)).length() < 1e-6);
    }

    #[test]
    fn eyes_keep_head_timestamp() {
        let mut head = Pose::IDENTITY;
        head.time_seconds = 12.5;
        let eyes = calc_eye_poses(&head, default_eye_offsets(DEFAULT_IPD));
        assert!(eyes.iter().all(|e| e.time_seconds == 12.5));
    }

    #[test]
    fn viewports_split_the_panel() {
        let desc = HmdDesc::debug(HmdType::Dk2);
        let left = framebuffer_viewport(Eye::Left, &desc.render_info);
        let right = framebuffer_viewport(Eye::Right, &desc.render_info);
        assert_eq!(left, Recti::new(0, 0, 960, 1080));
        assert_eq!(right, Recti::new(960, 0, 960, 1080));
        assert_eq!(eye_viewport(Eye::Right, Sizei::new(101, 50)), Recti::new(51, 0, 50, 50));
    }

    #[test]
    fn render_desc_uses_eye_offset() {
        let desc = HmdDesc::debug(HmdType::Dk2);
        let render = EyeRenderDesc::new(Eye::Right, desc.default_eye_fov[1], &desc.render_info, 0.0, 0.07);
        assert_eq!(render.hmd_to_eye_offset, Vec3::new(0.035, 0.0, 0.0));
        assert!(render.pixels_per_tan_angle_at_center.x > 0.0);
    }
}

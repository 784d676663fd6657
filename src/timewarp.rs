//! Timewarp matrices
//!
//! The warp pass re-aims each eye image at the pose sampled just before
//! scanout. The correction is the rotation from the render pose to the warp
//! pose, expressed in the mesh's tan-angle space (x right, y down, z forward)
//! instead of the tracking space (x right, y up, z back).

use glam::{Mat4, Quat, Vec2, Vec3, Vec4};
use log::trace;

use crate::pose_source::{Pose, PoseSource};
use crate::types::ScaleAndOffset2D;

/// Corrections at the start and end of an eye's scanout window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimewarpMatrices {
    pub start: Mat4,
    pub end: Mat4,
}

impl Default for TimewarpMatrices {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl TimewarpMatrices {
    pub const IDENTITY: TimewarpMatrices = TimewarpMatrices { start: Mat4::IDENTITY, end: Mat4::IDENTITY };

    /// Warps a tan-angle direction the way the vertex shader does.
    ///
    /// `lerp` picks the point in the scanout window, 0 at the start.
    pub fn warp_tan_angle(&self, tan: Vec2, lerp: f32) -> Vec2 {
        let dir = Vec4::new(tan.x, tan.y, 1.0, 1.0);
        let start = (self.start * dir).truncate();
        let end = (self.end * dir).truncate();
        // Written as a + (b - a) * t so equal endpoints come back unchanged.
        let warped = start + (end - start) * lerp;
        Vec2::new(warped.x, warped.y) / warped.z
    }

    /// Full per-vertex mapping to source texture UV
    pub fn warp_to_source_uv(&self, tan: Vec2, lerp: f32, eye_to_source_uv: &ScaleAndOffset2D) -> Vec2 {
        eye_to_source_uv.apply(self.warp_tan_angle(tan, lerp))
    }
}

fn delta_rotation(render: Quat, warp: Quat) -> Quat {
    if render.to_array().map(f32::to_bits) == warp.to_array().map(f32::to_bits) {
        Quat::IDENTITY
    } else {
        (render.inverse() * warp).normalize()
    }
}

/// Similarity transform into tan-angle space: negates the Y and Z rows and
/// columns, most of which cancel.
fn basis_change(mut m: Mat4) -> Mat4 {
    m.y_axis.x = -m.y_axis.x;
    m.z_axis.x = -m.z_axis.x;
    m.x_axis.y = -m.x_axis.y;
    m.x_axis.z = -m.x_axis.z;
    m.w_axis.y = -m.w_axis.y;
    m.w_axis.z = -m.w_axis.z;
    m
}

/// Orientation-only correction from the render pose to one warp pose
pub fn orientation_timewarp_matrix(render: &Pose, warp: &Pose) -> Mat4 {
    let delta = delta_rotation(render.normalized_orientation(), warp.normalized_orientation());
    basis_change(Mat4::from_quat(delta))
}

pub fn compute_timewarp(render: &Pose, warp_start: &Pose, warp_end: &Pose) -> TimewarpMatrices {
    TimewarpMatrices {
        start: orientation_timewarp_matrix(render, warp_start),
        end: orientation_timewarp_matrix(render, warp_end),
    }
}

/// Same warp pose at both ends of the window
pub fn compute_timewarp_single(render: &Pose, warp: &Pose) -> TimewarpMatrices {
    let m = orientation_timewarp_matrix(render, warp);
    TimewarpMatrices { start: m, end: m }
}

/// Correction that also accounts for head translation, for layers that
/// carry depth. `extra_eye_offset` is added to the warp position.
pub fn positional_timewarp_matrix(render: &Pose, warp: &Pose, extra_eye_offset: Vec3) -> Mat4 {
    let render_orientation = render.normalized_orientation();
    let delta = delta_rotation(render_orientation, warp.normalized_orientation());
    // Rigid inverse of the render pose, applied to the warp eye position.
    let translation = render_orientation.conjugate() * (warp.position + extra_eye_offset - render.position);
    basis_change(Mat4::from_rotation_translation(delta, translation))
}

/// Samples `source` over a warp window and builds the matrices.
///
/// Returns identity and `false` when the source has no data yet.
pub fn timewarp_from_source(render: &Pose, source: &dyn PoseSource, window: [f64; 2]) -> (TimewarpMatrices, bool) {
    match (source.predicted_pose(window[0]), source.predicted_pose(window[1])) {
        (Some(start), Some(end)) => (compute_timewarp(render, &start, &end), true),
        _ => {
            trace!("No tracking data, timewarp disabled for this eye");
            (TimewarpMatrices::IDENTITY, false)
        }
    }
}

/// Positional variant of `timewarp_from_source`
pub fn positional_timewarp_from_source(
    render: &Pose,
    source: &dyn PoseSource,
    window: [f64; 2],
    hmd_to_eye_offset: Vec3,
) -> (TimewarpMatrices, bool) {
    match (source.predicted_pose(window[0]), source.predicted_pose(window[1])) {
        (Some(start), Some(end)) => {
            // Render poses are eye poses, the source reports the head.
            let eye_offset = start.normalized_orientation() * hmd_to_eye_offset;
            let matrices = TimewarpMatrices {
                start: positional_timewarp_matrix(render, &start, eye_offset),
                end: positional_timewarp_matrix(render, &end, eye_offset),
            };
            (matrices, true)
        }
        _ => (TimewarpMatrices::IDENTITY, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose_source::{StaticPoseSource, TrackedPoseSource};

    #[test]
    fn identical_poses_give_exact_identity() {
        let pose = Pose::new(Quat::from_euler(glam::EulerRot::YXZ, 0.7, 0.1, -0.3), Vec3::ZERO);
        let tw = compute_timewarp(&pose, &pose, &pose);
        assert_eq!(tw, TimewarpMatrices::IDENTITY);

        for tan in [Vec2::new(0.3, -0.8), Vec2::new(-1.1, 0.45), Vec2::ZERO] {
            for lerp in [0.0, 0.37, 1.0] {
                assert_eq!(tw.warp_tan_angle(tan, lerp), tan);
            }
        }
    }

    #[test]
    fn yaw_left_samples_further_left() {
        let angle = 0.1f32;
        let render = Pose::IDENTITY;
        let warp = Pose::new(Quat::from_rotation_y(angle), Vec3::ZERO);
        let tw = compute_timewarp_single(&render, &warp);
        let warped = tw.warp_tan_angle(Vec2::ZERO, 0.5);
        assert!((warped.x + angle.tan()).abs() < 1e-5, "{:?}", warped);
        assert!(warped.y.abs() < 1e-6);
    }

    #[test]
    fn pitch_up_samples_higher() {
        let angle = 0.05f32;
        let warp = Pose::new(Quat::from_rotation_x(angle), Vec3::ZERO);
        let tw = compute_timewarp_single(&Pose::IDENTITY, &warp);
        let warped = tw.warp_tan_angle(Vec2::ZERO, 0.0);
        // Tan-angle y points down, so up is negative.
        assert!((warped.y + angle.tan()).abs() < 1e-5, "{:?}", warped);
    }

    #[test]
    fn lerp_blends_start_and_end() {
        let start = Pose::IDENTITY;
        let end = Pose::new(Quat::from_rotation_y(0.2), Vec3::ZERO);
        let tw = compute_timewarp(&Pose::IDENTITY, &start, &end);
        assert_eq!(tw.warp_tan_angle(Vec2::ZERO, 0.0), Vec2::ZERO);
        let at_end = tw.warp_tan_angle(Vec2::ZERO, 1.0);
        assert!((at_end.x + 0.2f32.tan()).abs() < 1e-5);
    }

    #[test]
    fn empty_source_disables_warp() {
        let tracker = TrackedPoseSource::new();
        let (tw, ok) = timewarp_from_source(&Pose::IDENTITY, &tracker, [1.0, 1.01]);
        assert!(!ok);
        assert_eq!(tw, TimewarpMatrices::IDENTITY);
    }

    #[test]
    fn static_source_matching_render_pose_is_identity() {
        let pose = Pose::new(Quat::from_rotation_z(0.25), Vec3::new(0.0, 1.6, 0.0));
        let source = StaticPoseSource::new(pose);
        let (tw, ok) = timewarp_from_source(&pose, &source, [2.0, 2.01]);
        assert!(ok);
        assert_eq!(tw, TimewarpMatrices::IDENTITY);
    }

    #[test]
    fn positional_warp_carries_translation() {
        let render = Pose::new(Quat::IDENTITY, Vec3::new(0.0, 1.6, 0.0));
        let warp = Pose::new(Quat::IDENTITY, Vec3::new(0.1, 1.6, 0.0));
        let m = positional_timewarp_matrix(&render, &warp, Vec3::ZERO);
        assert!((m.w_axis.x - 0.1).abs() < 1e-5);
        assert!(m.w_axis.y.abs() < 1e-5 && m.w_axis.z.abs() < 1e-5);

        let same = positional_timewarp_matrix(&render, &render, Vec3::ZERO);
        assert_eq!(same, Mat4::IDENTITY);
    }

    #[test]
    fn positional_warp_is_exact_identity_for_unchanged_pose() {
        let render = Pose::new(
            Quat::from_euler(glam::EulerRot::YXZ, 0.7, -0.2, 0.1),
            Vec3::new(0.3, 1.65, -0.4),
        );
        let offset = Vec3::new(0.032, 0.0, 0.0);
        assert_eq!(positional_timewarp_matrix(&render, &render, Vec3::ZERO), Mat4::IDENTITY);

        // A rotated render pose still maps an offset back into eye space.
        let moved = Pose::new(render.orientation, render.position + render.orientation * offset);
        let m = positional_timewarp_matrix(&render, &moved, Vec3::ZERO);
        assert!((m.w_axis.x - 0.032).abs() < 1e-5);
        assert!(m.w_axis.y.abs() < 1e-5 && m.w_axis.z.abs() < 1e-5);
    }

    #[test]
    fn upward_translation_flips_into_tan_space() {
        let warp = Pose::new(Quat::IDENTITY, Vec3::new(0.0, 0.2, 0.0));
        let m = positional_timewarp_matrix(&Pose::IDENTITY, &warp, Vec3::ZERO);
        assert!((m.w_axis.y + 0.2).abs() < 1e-6);
    }
}

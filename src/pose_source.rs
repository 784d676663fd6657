//! Head pose sources
//!
//! A `PoseSource` answers "where will the head be at time t". Queries can
//! come from any thread; each source serializes its own state.

use glam::{EulerRot, Quat, Vec3};
use log::info;
use parking_lot::Mutex;

/// Longest forward prediction allowed from one sample, in seconds
pub const MAX_PREDICTION_SECONDS: f64 = 0.1;

/// Rigid body pose with derivatives at a point in time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub orientation: Quat,
    pub position: Vec3,
    /// Body-frame angular velocity, radians per second
    pub angular_velocity: Vec3,
    pub linear_velocity: Vec3,
    pub linear_acceleration: Vec3,
    /// Absolute time this pose corresponds to
    pub time_seconds: f64,
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        orientation: Quat::IDENTITY,
        position: Vec3::ZERO,
        angular_velocity: Vec3::ZERO,
        linear_velocity: Vec3::ZERO,
        linear_acceleration: Vec3::ZERO,
        time_seconds: 0.0,
    };

    pub fn new(orientation: Quat, position: Vec3) -> Self {
        Self { orientation, position, ..Self::IDENTITY }
    }

    /// Unit-length orientation, identity if the stored one is unusable
    pub fn normalized_orientation(&self) -> Quat {
        let q = self.orientation;
        let len_sq = q.length_squared();
        if !len_sq.is_finite() || len_sq < 1e-12 {
            Quat::IDENTITY
        } else if (len_sq - 1.0).abs() < 1e-7 {
            q
        } else {
            q.normalize()
        }
    }

    /// Copy with the orientation renormalized
    pub fn normalized(&self) -> Pose {
        Pose { orientation: self.normalized_orientation(), ..*self }
    }

    /// Extrapolates this sample forward by `dt` seconds
    pub fn predicted(&self, dt: f64) -> Pose {
        let dt = dt.clamp(0.0, MAX_PREDICTION_SECONDS);
        let dtf = dt as f32;
        let mut out = self.normalized();
        out.position += self.linear_velocity * dtf + 0.5 * self.linear_acceleration * dtf * dtf;
        out.linear_velocity += self.linear_acceleration * dtf;

        let angular_speed = self.angular_velocity.length();
        if angular_speed > 0.001 {
            let delta = Quat::from_axis_angle(self.angular_velocity / angular_speed, angular_speed * dtf);
            out.orientation = (out.orientation * delta).normalize();
        }
        out.time_seconds = self.time_seconds + dt;
        out
    }
}

/// Source of predicted head poses
pub trait PoseSource: Send + Sync {
    /// Pose predicted for `absolute_time`; `0.0` means the latest sample
    /// without prediction. `None` when tracking has no data yet.
    fn predicted_pose(&self, absolute_time: f64) -> Option<Pose>;
}

/// Always reports the same pose
#[derive(Debug, Default)]
pub struct StaticPoseSource {
    pose: Mutex<Pose>,
}

impl StaticPoseSource {
    pub fn new(pose: Pose) -> Self {
        Self { pose: Mutex::new(pose) }
    }

    pub fn set(&self, pose: Pose) {
        *self.pose.lock() = pose;
    }
}

impl PoseSource for StaticPoseSource {
    fn predicted_pose(&self, absolute_time: f64) -> Option<Pose> {
        let mut pose = *self.pose.lock();
        if absolute_time != 0.0 {
            pose.time_seconds = absolute_time;
        }
        Some(pose.normalized())
    }
}

/// Holds the newest tracker sample and predicts forward from it
#[derive(Debug, Default)]
pub struct TrackedPoseSource {
    state: Mutex<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    latest: Option<Pose>,
    /// Applied on top of every sample, set by `recenter`
    yaw_correction: Quat,
}

impl TrackedPoseSource {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState { latest: None, yaw_correction: Quat::IDENTITY }),
        }
    }

    /// Called by the sensor thread for every fused sample
    pub fn push_sample(&self, pose: Pose) {
        self.state.lock().latest = Some(pose.normalized());
    }

    /// Makes the current facing direction the new forward
    pub fn recenter(&self) {
        let mut state = self.state.lock();
        if let Some(latest) = state.latest {
            let (yaw, _, _) = latest.orientation.to_euler(EulerRot::YXZ);
            state.yaw_correction = Quat::from_rotation_y(-yaw);
            info!("Orientation recentered (yaw {:.3} rad)", yaw);
        }
    }

    /// Drops all samples and corrections
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.latest = None;
        state.yaw_correction = Quat::IDENTITY;
        info!("Tracking reset");
    }

    pub fn has_data(&self) -> bool {
        self.state.lock().latest.is_some()
    }
}

impl PoseSource for TrackedPoseSource {
    fn predicted_pose(&self, absolute_time: f64) -> Option<Pose> {
        let state = self.state.lock();
        let latest = state.latest?;
        let mut pose = if absolute_time == 0.0 {
            latest
        } else {
            latest.predicted(absolute_time - latest.time_seconds)
        };
        pose.orientation = (state.yaw_correction * pose.orientation).normalize();
        pose.position = state.yaw_correction * pose.position;
        Some(pose)
    }
}

/// Gentle breathing and sway, for running without a tracker
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedHeadMotion {
    /// Scales the motion, 1.0 is the standard amplitude
    pub amplitude: f32,
}

impl SimulatedHeadMotion {
    pub fn new() -> Self {
        Self { amplitude: 1.0 }
    }

    fn orientation_at(&self, t: f64) -> Quat {
        let t = t as f32;
        let breathing = (t * 0.5).sin() * 0.01 * self.amplitude;
        let sway = (t * 0.3).sin() * 0.005 * self.amplitude;
        Quat::from_euler(EulerRot::YXZ, 0.0, breathing, sway)
    }
}

impl PoseSource for SimulatedHeadMotion {
    fn predicted_pose(&self, absolute_time: f64) -> Option<Pose> {
        let mut pose = Pose::new(self.orientation_at(absolute_time), Vec3::ZERO);
        pose.time_seconds = absolute_time;
        Some(pose)
    }
}

//! Runtime configuration
//!
//! Every field has a default, so a config file only needs to name what it
//! changes:
//!
//! ```json
//! { "wait_mode": "Sleep", "distortion_caps": "CHROMATIC | TIMEWARP" }
//! ```

use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{VrError, VrResult};
use crate::eye_pose::DEFAULT_IPD;
use crate::hmd::{DistortionCaps, HmdType};
use crate::timing::WaitMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub wait_mode: WaitMode,
    /// Warp point as a fraction of the frame before the next vsync
    pub timewarp_fraction: f32,
    /// Allows the late warp point when the app asks for it
    pub jit_timewarp: bool,
    pub fallback_refresh_hz: f32,
    pub vsync: bool,
    pub distortion_caps: DistortionCaps,
    pub overdrive_rise: f32,
    pub overdrive_fall: f32,
    /// Block on the GPU after each present
    pub flush_after_present: bool,
    pub ipd: f32,
    /// Meters; 0 uses the device calibration
    pub eye_relief: f32,
    pub hmd: HmdType,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            wait_mode: WaitMode::Spin,
            timewarp_fraction: 0.25,
            jit_timewarp: true,
            fallback_refresh_hz: 90.0,
            vsync: true,
            distortion_caps: DistortionCaps::default(),
            overdrive_rise: 0.1,
            overdrive_fall: 0.05,
            flush_after_present: false,
            ipd: DEFAULT_IPD,
            eye_relief: 0.0,
            hmd: HmdType::Dk2,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_str(json: &str) -> VrResult<Self> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> VrResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        info!("Loaded runtime config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> VrResult<()> {
        if !(self.timewarp_fraction.is_finite() && self.timewarp_fraction > 0.0 && self.timewarp_fraction < 1.0) {
            return Err(VrError::Config(format!(
                "timewarp_fraction must be in (0, 1), got {}",
                self.timewarp_fraction
            )));
        }
        if !(self.fallback_refresh_hz.is_finite() && self.fallback_refresh_hz > 0.0) {
            return Err(VrError::Config(format!(
                "fallback_refresh_hz must be positive, got {}",
                self.fallback_refresh_hz
            )));
        }
        for (name, value) in [("overdrive_rise", self.overdrive_rise), ("overdrive_fall", self.overdrive_fall)] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(VrError::Config(format!("{} must be non-negative, got {}", name, value)));
            }
        }
        if !(self.ipd.is_finite() && self.ipd > 0.0) {
            return Err(VrError::Config(format!("ipd must be positive, got {}", self.ipd)));
        }
        if !(self.eye_relief.is_finite() && self.eye_relief >= 0.0) {
            return Err(VrError::Config(format!("eye_relief must be non-negative, got {}", self.eye_relief)));
        }
        Ok(())
    }

    /// Spin unless either the config or the caps ask to sleep
    pub fn effective_wait_mode(&self, caps: DistortionCaps) -> WaitMode {
        if caps.contains(DistortionCaps::PROFILE_NO_SPIN_WAITS) {
            WaitMode::Sleep
        } else {
            self.wait_mode
        }
    }
}

//! HMD device description
//!
//! Calibration values for the display panel, lenses and scanout. These are
//! read-only input to the pipeline; a session hands out the description by
//! value and never mutates it.

use bitflags::bitflags;
use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::types::{Eye, FovPort, Sizei};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HmdType {
    Dk1,
    Dk2,
}

/// Order in which the panel lights its pixels within one refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShutterType {
    Global,
    RollingTopToBottom,
    RollingLeftToRight,
    RollingRightToLeft,
}

/// Lens assembly fitted to the headset, selects the calibration table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EyeCupType {
    Dk1A,
    Dk2A,
    /// Uncalibrated optics, uses a generic polynomial
    Generic,
}

bitflags! {
    /// Distortion pass features requested by the application
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
    pub struct DistortionCaps: u32 {
        const CHROMATIC = 0x01;
        const TIMEWARP = 0x02;
        const VIGNETTE = 0x08;
        /// Skip restoring application GPU state after the warp pass
        const NO_RESTORE = 0x10;
        /// Source textures have a bottom-left origin
        const FLIP_INPUT = 0x20;
        const SRGB = 0x40;
        const OVERDRIVE = 0x80;
        const HQ_DISTORTION = 0x100;
        /// Sample the warp pose as late as the measured warp cost allows
        const TIMEWARP_JIT_DELAY = 0x1000;
        /// Sleep instead of spinning while waiting for the warp point
        const PROFILE_NO_SPIN_WAITS = 0x10000;
    }
}

impl Default for DistortionCaps {
    fn default() -> Self {
        DistortionCaps::CHROMATIC
            | DistortionCaps::TIMEWARP
            | DistortionCaps::VIGNETTE
            | DistortionCaps::OVERDRIVE
    }
}

impl DistortionCaps {
    /// Flags that change the mesh; the rest only affect the draw.
    pub fn mesh_relevant(self) -> DistortionCaps {
        self & (DistortionCaps::CHROMATIC | DistortionCaps::VIGNETTE | DistortionCaps::TIMEWARP)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
    pub struct HmdCaps: u32 {
        const LOW_PERSISTENCE = 0x0080;
        const DYNAMIC_PREDICTION = 0x0200;
        const NO_VSYNC = 0x1000;
    }
}

/// Scanout timing of the panel, all in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShutterInfo {
    pub shutter_type: ShutterType,
    pub vsync_to_next_vsync: f32,
    pub vsync_to_first_scanline: f32,
    pub first_scanline_to_last_scanline: f32,
    pub pixel_settle_time: f32,
    pub pixel_persistence: f32,
}

/// Per-eye physical placement relative to the lens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EyeConfig {
    pub relief_in_meters: f32,
    pub nose_to_pupil_in_meters: f32,
}

/// Edge fade tuning for the vignette
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VignetteParams {
    pub texture_border_fraction: f32,
    pub texture_inner_edge_fraction: f32,
    pub screen_border_fraction: f32,
    pub floor: f32,
}

/// Everything the distortion and timing code needs to know about the panel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HmdRenderInfo {
    pub hmd_type: HmdType,
    pub resolution_in_pixels: Sizei,
    pub screen_size_in_meters: Vec2,
    pub screen_gap_size_in_meters: f32,
    pub center_from_top_in_meters: f32,
    pub lens_separation_in_meters: f32,
    pub lens_diameter_in_meters: f32,
    pub eye_cups: EyeCupType,
    pub shutter: ShutterInfo,
    pub eyes: [EyeConfig; 2],
    pub vignette: VignetteParams,
}

impl HmdRenderInfo {
    pub fn eye(&self, eye: Eye) -> &EyeConfig {
        &self.eyes[eye.index()]
    }

    pub fn nominal_refresh_interval(&self) -> f64 {
        self.shutter.vsync_to_next_vsync as f64
    }
}

/// Immutable description of the attached headset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HmdDesc {
    pub hmd_type: HmdType,
    pub product_name: String,
    pub manufacturer: String,
    pub resolution: Sizei,
    pub hmd_caps: HmdCaps,
    pub distortion_caps: DistortionCaps,
    pub default_eye_fov: [FovPort; 2],
    pub max_eye_fov: [FovPort; 2],
    pub render_info: HmdRenderInfo,
}

impl HmdDesc {
    /// Builds the description of a headset from the built-in calibration
    /// tables, with nothing plugged in.
    pub fn debug(hmd_type: HmdType) -> Self {
        let render_info = match hmd_type {
            HmdType::Dk1 => HmdRenderInfo {
                hmd_type,
                resolution_in_pixels: Sizei::new(1280, 800),
                screen_size_in_meters: Vec2::new(0.1498, 0.0936),
                screen_gap_size_in_meters: 0.0,
                center_from_top_in_meters: 0.0468,
                lens_separation_in_meters: 0.0635,
                lens_diameter_in_meters: 0.035,
                eye_cups: EyeCupType::Dk1A,
                shutter: ShutterInfo {
                    shutter_type: ShutterType::RollingTopToBottom,
                    vsync_to_next_vsync: 1.0 / 60.0,
                    vsync_to_first_scanline: 0.000052,
                    first_scanline_to_last_scanline: 0.016580,
                    pixel_settle_time: 0.015,
                    pixel_persistence: 1.0 / 60.0,
                },
                eyes: [EyeConfig { relief_in_meters: 0.010, nose_to_pupil_in_meters: 0.032 }; 2],
                vignette: VignetteParams {
                    texture_border_fraction: 0.3,
                    texture_inner_edge_fraction: 0.075,
                    screen_border_fraction: 0.075,
                    floor: 0.25,
                },
            },
            HmdType::Dk2 => {
                let refresh = 1.0 / 75.0;
                HmdRenderInfo {
                    hmd_type,
                    resolution_in_pixels: Sizei::new(1920, 1080),
                    screen_size_in_meters: Vec2::new(0.12576, 0.07074),
                    screen_gap_size_in_meters: 0.0,
                    center_from_top_in_meters: 0.07074 * 0.5,
                    lens_separation_in_meters: 0.0635,
                    lens_diameter_in_meters: 0.04,
                    eye_cups: EyeCupType::Dk2A,
                    shutter: ShutterInfo {
                        shutter_type: ShutterType::RollingRightToLeft,
                        vsync_to_next_vsync: refresh,
                        vsync_to_first_scanline: 0.0000273,
                        first_scanline_to_last_scanline: 0.0131033,
                        pixel_settle_time: 0.0,
                        pixel_persistence: 0.18 * refresh,
                    },
                    eyes: [EyeConfig { relief_in_meters: 0.012, nose_to_pupil_in_meters: 0.032 }; 2],
                    vignette: VignetteParams {
                        texture_border_fraction: 0.1,
                        texture_inner_edge_fraction: 0.1,
                        screen_border_fraction: 0.1,
                        floor: 0.6,
                    },
                }
            }
        };

        let (product_name, hmd_caps) = match hmd_type {
            HmdType::Dk1 => ("Oculus Rift DK1", HmdCaps::empty()),
            HmdType::Dk2 => (
                "Oculus Rift DK2",
                HmdCaps::LOW_PERSISTENCE | HmdCaps::DYNAMIC_PREDICTION,
            ),
        };

        let mut desc = Self {
            hmd_type,
            product_name: product_name.to_string(),
            manufacturer: "Oculus VR".to_string(),
            resolution: render_info.resolution_in_pixels,
            hmd_caps,
            distortion_caps: DistortionCaps::all(),
            default_eye_fov: [FovPort::symmetric(1.0); 2],
            max_eye_fov: [FovPort::symmetric(1.0); 2],
            render_info,
        };
        desc.derive_eye_fovs();
        desc
    }

    /// Fills the default and maximum FOVs from lens geometry, clamped to what
    /// the panel can physically show.
    pub fn derive_eye_fovs(&mut self) {
        for eye in Eye::BOTH {
            let lens = crate::lens::lens_config_from_eye_relief(
                self.render_info.eye(eye).relief_in_meters,
                self.render_info.eye_cups,
            );
            let distortion = crate::lens::DistortionRenderDesc::new(eye, &self.render_info, lens);
            let physical = distortion.physical_screen_fov();
            let nominal = crate::lens::fov_from_eye_position(eye, &self.render_info, DEFAULT_EXTRA_EYE_ROTATION);
            self.default_eye_fov[eye.index()] = nominal.min(&physical);
            self.max_eye_fov[eye.index()] = physical;
        }
    }

    pub fn from_json_str(json: &str) -> crate::VrResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Pupil swing allowed for when sizing the default FOV, in radians
pub const DEFAULT_EXTRA_EYE_ROTATION: f32 = 30.0 * std::f32::consts::PI / 180.0;

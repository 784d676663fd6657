//! Lens distortion model
//!
//! Maps between physical screen positions and the real-world direction
//! (as tangent angles) a pixel appears in after passing through the lens.
//! The radial scale is a Catmull-Rom spline over r^2 for calibrated lenses,
//! with per-channel scales for chromatic aberration.

use glam::{Vec2, Vec3};
use log::debug;

use crate::hmd::{EyeCupType, HmdRenderInfo};
use crate::types::{Eye, FovPort, Sizei};

pub const NUM_COEFFICIENTS: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistortionEquation {
    /// scale = K0 + K1 r^2 + K2 r^4 + K3 r^6
    Poly4,
    /// scale = 1 / (K0 + K1 r^2 + K2 r^4 + K3 r^6)
    RecipPoly4,
    /// Spline through 1.0, K1..K10 evenly spaced in r^2 up to MaxR^2
    CatmullRom10,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LensConfig {
    pub eqn: DistortionEquation,
    pub k: [f32; NUM_COEFFICIENTS],
    pub max_r: f32,
    pub meters_per_tan_angle_at_center: f32,
    /// Red constant, red r^2, blue constant, blue r^2
    pub chromatic_aberration: [f32; 4],
    pub inv_k: [f32; NUM_COEFFICIENTS],
    pub max_inv_r: f32,
}

impl LensConfig {
    /// A lens that does nothing
    pub fn identity() -> Self {
        let mut k = [0.0; NUM_COEFFICIENTS];
        let mut inv_k = [0.0; NUM_COEFFICIENTS];
        k[0] = 1.0;
        inv_k[0] = 1.0;
        Self {
            eqn: DistortionEquation::RecipPoly4,
            k,
            max_r: 1.0,
            meters_per_tan_angle_at_center: 0.05,
            chromatic_aberration: [0.0; 4],
            inv_k,
            max_inv_r: 1.0,
        }
    }

    /// Radial scale factor for a squared radius in distorted tan-angle space
    pub fn scale_radius_squared(&self, rsq: f32) -> f32 {
        let k = &self.k;
        match self.eqn {
            DistortionEquation::Poly4 => k[0] + rsq * (k[1] + rsq * (k[2] + rsq * k[3])),
            DistortionEquation::RecipPoly4 => 1.0 / (k[0] + rsq * (k[1] + rsq * (k[2] + rsq * k[3]))),
            DistortionEquation::CatmullRom10 => {
                let scaled = (NUM_COEFFICIENTS - 1) as f32 * rsq / (self.max_r * self.max_r);
                eval_catmull_rom10(k, scaled)
            }
        }
    }

    /// Scale factors for red, green and blue
    pub fn scale_radius_squared_chroma(&self, rsq: f32) -> Vec3 {
        let scale = self.scale_radius_squared(rsq);
        let ca = &self.chromatic_aberration;
        Vec3::new(
            scale * (1.0 + ca[0] + rsq * ca[1]),
            scale,
            scale * (1.0 + ca[2] + rsq * ca[3]),
        )
    }

    pub fn distortion_fn(&self, r: f32) -> f32 {
        r * self.scale_radius_squared(r * r)
    }

    /// Numerically inverts `distortion_fn`.
    ///
    /// Starts low and walks up, guessing high can land past a singularity.
    pub fn distortion_fn_inverse(&self, r: f32) -> f32 {
        let mut delta = r * 0.25;
        let mut s = r * 0.25;
        let mut d = (r - self.distortion_fn(s)).abs();

        for _ in 0..20 {
            let s_up = s + delta;
            let s_down = s - delta;
            let d_up = (r - self.distortion_fn(s_up)).abs();
            let d_down = (r - self.distortion_fn(s_down)).abs();

            if d_up < d {
                s = s_up;
                d = d_up;
            } else if d_down < d {
                s = s_down;
                d = d_down;
            } else {
                delta *= 0.5;
            }
        }
        s
    }

    /// Fast inverse using the `inv_k` fit from `set_up_inverse_approx`
    pub fn distortion_fn_inverse_approx(&self, r: f32) -> f32 {
        let rsq = r * r;
        let inv = &self.inv_k;
        let scale = match self.eqn {
            DistortionEquation::Poly4 => return self.distortion_fn_inverse(r),
            DistortionEquation::RecipPoly4 => {
                1.0 / (inv[0] + rsq * (inv[1] + rsq * (inv[2] + rsq * inv[3])))
            }
            DistortionEquation::CatmullRom10 => {
                let scaled = (NUM_COEFFICIENTS - 1) as f32 * rsq / (self.max_inv_r * self.max_inv_r);
                eval_catmull_rom10(inv, scaled)
            }
        };
        r * scale
    }

    pub fn set_up_inverse_approx(&mut self) {
        let max_r = self.max_inv_r;
        match self.eqn {
            DistortionEquation::Poly4 => {}
            DistortionEquation::RecipPoly4 => {
                let sample_r = [0.0, max_r * 0.4, max_r * 0.8, max_r * 1.5];
                let mut sample_rsq = [0.0; 4];
                let mut sample_fit = [1.0; 4];
                for i in 0..4 {
                    sample_rsq[i] = sample_r[i] * sample_r[i];
                    if i > 0 {
                        sample_fit[i] = sample_r[i] / self.distortion_fn_inverse(sample_r[i]);
                    }
                }
                if let Some(fit) = fit_cubic_polynomial(&sample_rsq, &sample_fit) {
                    self.inv_k[..4].copy_from_slice(&fit);
                }
            }
            DistortionEquation::CatmullRom10 => {
                self.inv_k[0] = 1.0;
                for i in 1..NUM_COEFFICIENTS {
                    let rsq = i as f32 * max_r * max_r / (NUM_COEFFICIENTS - 1) as f32;
                    let r = rsq.sqrt();
                    self.inv_k[i] = self.distortion_fn_inverse(r) / r;
                }
            }
        }
    }
}

impl Default for LensConfig {
    fn default() -> Self {
        Self::identity()
    }
}

/// Evaluates the 11-knot Catmull-Rom spline at `scaled` in knot units.
///
/// The curve starts at 1.0 with K0 only controlling the initial slope, and
/// continues as a straight line past the last knot.
pub fn eval_catmull_rom10(k: &[f32; NUM_COEFFICIENTS], scaled: f32) -> f32 {
    const N: usize = NUM_COEFFICIENTS;
    let floor = scaled.floor().clamp(0.0, (N - 1) as f32);
    let t = scaled - floor;
    let seg = floor as usize;

    let (p0, m0, p1, m1) = if seg == 0 {
        (1.0, k[1] - k[0], k[1], 0.5 * (k[2] - k[0]))
    } else if seg == N - 2 {
        (k[N - 2], 0.5 * (k[N - 1] - k[N - 3]), k[N - 1], k[N - 1] - k[N - 2])
    } else if seg == N - 1 {
        let m = k[N - 1] - k[N - 2];
        (k[N - 1], m, k[N - 1] + m, m)
    } else {
        (k[seg], 0.5 * (k[seg + 1] - k[seg - 1]), k[seg + 1], 0.5 * (k[seg + 2] - k[seg]))
    };

    let omt = 1.0 - t;
    (p0 * (1.0 + 2.0 * t) + m0 * t) * omt * omt + (p1 * (1.0 + 2.0 * omt) - m1 * omt) * t * t
}

/// Cubic through four points, coefficients lowest power first.
fn fit_cubic_polynomial(x: &[f32; 4], y: &[f32; 4]) -> Option<[f32; 4]> {
    let d0 = (x[0] - x[1]) * (x[0] - x[2]) * (x[0] - x[3]);
    let d1 = (x[1] - x[2]) * (x[1] - x[3]) * (x[1] - x[0]);
    let d2 = (x[2] - x[3]) * (x[2] - x[0]) * (x[2] - x[1]);
    let d3 = (x[3] - x[0]) * (x[3] - x[1]) * (x[3] - x[2]);
    if d0 == 0.0 || d1 == 0.0 || d2 == 0.0 || d3 == 0.0 {
        return None;
    }

    let f0 = y[0] / d0;
    let f1 = y[1] / d1;
    let f2 = y[2] / d2;
    let f3 = y[3] / d3;

    Some([
        -(f0 * x[1] * x[2] * x[3] + f1 * x[0] * x[2] * x[3] + f2 * x[0] * x[1] * x[3] + f3 * x[0] * x[1] * x[2]),
        f0 * (x[1] * x[2] + x[2] * x[3] + x[3] * x[1])
            + f1 * (x[0] * x[2] + x[2] * x[3] + x[3] * x[0])
            + f2 * (x[0] * x[1] + x[1] * x[3] + x[3] * x[0])
            + f3 * (x[0] * x[1] + x[1] * x[2] + x[2] * x[0]),
        -(f0 * (x[1] + x[2] + x[3]) + f1 * (x[0] + x[2] + x[3]) + f2 * (x[0] + x[1] + x[3]) + f3 * (x[0] + x[1] + x[2])),
        f0 + f1 + f2 + f3,
    ])
}

/// One measured lens curve at a given eye relief
struct Calibration {
    eye_relief: f32,
    max_radius: f32,
    config: LensConfig,
}

fn catmull_rom(meters_per_tan: f32, k: [f32; NUM_COEFFICIENTS], ca: [f32; 4]) -> LensConfig {
    LensConfig {
        eqn: DistortionEquation::CatmullRom10,
        k,
        meters_per_tan_angle_at_center: meters_per_tan,
        chromatic_aberration: ca,
        ..LensConfig::identity()
    }
}

/// Calibration curves for a lens, sorted by eye relief, plus the default index.
fn calibration_table(eye_cups: EyeCupType) -> (Vec<Calibration>, usize) {
    match eye_cups {
        EyeCupType::Dk1A => {
            let ca = [-0.006, 0.0, 0.014, 0.0];
            let table = vec![
                Calibration {
                    eye_relief: 0.012760465 - 0.005,
                    max_radius: 1.8f32.sqrt(),
                    config: catmull_rom(
                        0.0425,
                        [1.0, 1.06505, 1.14725, 1.2705, 1.48, 1.87, 2.534, 3.6, 5.1, 7.4, 11.0],
                        ca,
                    ),
                },
                Calibration {
                    eye_relief: 0.012760465,
                    max_radius: 1.0,
                    config: catmull_rom(
                        0.0425,
                        [
                            1.0, 1.032407264, 1.07160462, 1.11998388, 1.1808606, 1.2590494, 1.361915,
                            1.5014339, 1.6986004, 1.9940577, 2.4783147,
                        ],
                        ca,
                    ),
                },
                Calibration {
                    eye_relief: 0.012760465 + 0.005,
                    max_radius: 1.0,
                    config: catmull_rom(
                        0.0425,
                        [1.0102, 1.0371, 1.0831, 1.1353, 1.2, 1.2851, 1.3979, 1.56, 1.8, 2.25, 3.0],
                        ca,
                    ),
                },
            ];
            (table, 0)
        }
        EyeCupType::Dk2A => {
            let k = [1.003, 1.02, 1.042, 1.066, 1.094, 1.126, 1.162, 1.203, 1.25, 1.31, 1.38];
            let table = vec![
                Calibration {
                    eye_relief: 0.008,
                    max_radius: 1.0,
                    config: catmull_rom(0.036, k, [-0.0112, -0.015, 0.0187, 0.015]),
                },
                Calibration {
                    eye_relief: 0.018,
                    max_radius: 1.0,
                    config: catmull_rom(0.036, k, [-0.015, -0.02, 0.025, 0.02]),
                },
            ];
            (table, 1)
        }
        EyeCupType::Generic => {
            let mut k = [0.0; NUM_COEFFICIENTS];
            k[..4].copy_from_slice(&[1.0, -0.3999, 0.2408, -0.4589]);
            let config = LensConfig {
                eqn: DistortionEquation::RecipPoly4,
                k,
                meters_per_tan_angle_at_center: 0.043875,
                ..LensConfig::identity()
            };
            let table = vec![
                Calibration { eye_relief: 0.005, max_radius: 1.0, config },
                Calibration { eye_relief: 0.010, max_radius: 1.0, config },
            ];
            (table, 0)
        }
    }
}

/// Builds the lens curve for an eye relief by blending the two nearest
/// calibration curves.
///
/// A relief of zero selects the default curve. Reliefs outside the
/// calibrated range clamp to the nearest end.
pub fn lens_config_from_eye_relief(eye_relief: f32, eye_cups: EyeCupType) -> LensConfig {
    let (table, default_index) = calibration_table(eye_cups);

    let (lower, upper, lerp) = if eye_relief == 0.0 || !eye_relief.is_finite() {
        (default_index, default_index, 0.0)
    } else {
        let bracket = table.windows(2).enumerate().find_map(|(i, pair)| {
            (pair[0].eye_relief <= eye_relief && pair[1].eye_relief > eye_relief).then(|| {
                let t = (eye_relief - pair[0].eye_relief) / (pair[1].eye_relief - pair[0].eye_relief);
                (i, i + 1, t)
            })
        });
        match bracket {
            Some(found) => found,
            None if eye_relief < table[0].eye_relief => (0, 0, 0.0),
            None => (table.len() - 1, table.len() - 1, 0.0),
        }
    };

    let (mut lo, mut hi) = (table[lower].config, table[upper].config);
    lo.max_r = table[lower].max_radius;
    hi.max_r = table[upper].max_radius;
    let inv_lerp = 1.0 - lerp;
    let max_valid_radius = inv_lerp * lo.max_r + lerp * hi.max_r;

    let mut result = LensConfig::identity();
    result.eqn = DistortionEquation::CatmullRom10;
    result.max_r = max_valid_radius;
    result.k[0] = inv_lerp * lo.k[0] + lerp * hi.k[0];
    for i in 1..NUM_COEFFICIENTS {
        let rsq = (i as f32 / (NUM_COEFFICIENTS - 1) as f32) * max_valid_radius * max_valid_radius;
        result.k[i] = inv_lerp * lo.scale_radius_squared(rsq) + lerp * hi.scale_radius_squared(rsq);
    }
    result.max_inv_r = result.distortion_fn(max_valid_radius);
    result.set_up_inverse_approx();

    for i in 0..4 {
        result.chromatic_aberration[i] =
            inv_lerp * lo.chromatic_aberration[i] + lerp * hi.chromatic_aberration[i];
    }
    result.meters_per_tan_angle_at_center =
        inv_lerp * lo.meters_per_tan_angle_at_center + lerp * hi.meters_per_tan_angle_at_center;

    debug!("Lens config for relief {:.4}m: curves {}..{} lerp {:.3}", eye_relief, lower, upper, lerp);
    result
}

/// Lens plus the screen placement of one eye
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistortionRenderDesc {
    pub lens: LensConfig,
    /// Lens center in the eye's screen NDC
    pub lens_center: Vec2,
    /// Screen NDC to distorted tan-angle scale
    pub tan_eye_angle_scale: Vec2,
    pub pixels_per_tan_angle_at_center: Vec2,
}

impl DistortionRenderDesc {
    pub fn new(eye: Eye, hmd: &HmdRenderInfo, lens: LensConfig) -> Self {
        let screen = hmd.screen_size_in_meters;
        let res = hmd.resolution_in_pixels;
        let pixels_per_meter = Vec2::new(
            res.w as f32 / (screen.x - hmd.screen_gap_size_in_meters),
            res.h as f32 / screen.y,
        );
        let pixels_per_tan_angle_at_center = pixels_per_meter * lens.meters_per_tan_angle_at_center;
        let tan_eye_angle_scale = Vec2::new(0.25, 0.5) * (screen / lens.meters_per_tan_angle_at_center);

        let visible_width_of_one_eye = 0.5 * (screen.x - hmd.screen_gap_size_in_meters);
        let center_from_left = (screen.x - hmd.lens_separation_in_meters) * 0.5;
        let mut lens_center = Vec2::new(
            (center_from_left / visible_width_of_one_eye) * 2.0 - 1.0,
            (hmd.center_from_top_in_meters / screen.y) * 2.0 - 1.0,
        );
        if eye.is_right() {
            lens_center.x = -lens_center.x;
        }

        Self { lens, lens_center, tan_eye_angle_scale, pixels_per_tan_angle_at_center }
    }

    fn distorted_tan(&self, screen_ndc: Vec2) -> Vec2 {
        (screen_ndc - self.lens_center) * self.tan_eye_angle_scale
    }

    /// Screen position to the direction it appears in
    pub fn screen_ndc_to_tan_fov_space(&self, screen_ndc: Vec2) -> Vec2 {
        let distorted = self.distorted_tan(screen_ndc);
        distorted * self.lens.scale_radius_squared(distorted.length_squared())
    }

    /// Per-channel directions for red, green and blue
    pub fn screen_ndc_to_tan_fov_space_chroma(&self, screen_ndc: Vec2) -> [Vec2; 3] {
        let distorted = self.distorted_tan(screen_ndc);
        let scales = self.lens.scale_radius_squared_chroma(distorted.length_squared());
        [distorted * scales.x, distorted * scales.y, distorted * scales.z]
    }

    /// Inverse mapping, direction back to the screen position showing it
    pub fn tan_fov_space_to_screen_ndc(&self, tan_eye_angle: Vec2, use_poly_approx: bool) -> Vec2 {
        let radius = tan_eye_angle.length();
        let distorted_radius = if use_poly_approx {
            self.lens.distortion_fn_inverse_approx(radius)
        } else {
            self.lens.distortion_fn_inverse(radius)
        };
        let distorted = if radius > 0.0 {
            tan_eye_angle * (distorted_radius / radius)
        } else {
            tan_eye_angle
        };
        distorted / self.tan_eye_angle_scale + self.lens_center
    }

    /// Widest FOV the panel can show through this lens.
    ///
    /// Some curves wrap back toward the center for invisible pixels, so
    /// each edge is approached in steps and the farthest reach kept.
    pub fn physical_screen_fov(&self) -> FovPort {
        const STEPS: usize = 10;
        let reach = |to: Vec2| -> FovPort {
            let from = self.lens_center;
            let mut fov = FovPort::new(0.0, 0.0, 0.0, 0.0);
            for step in 0..STEPS {
                let t = step as f32 / (STEPS - 1) as f32;
                let tan = self.screen_ndc_to_tan_fov_space(from + (to - from) * t);
                fov.left_tan = fov.left_tan.max(-tan.x);
                fov.right_tan = fov.right_tan.max(tan.x);
                fov.up_tan = fov.up_tan.max(-tan.y);
                fov.down_tan = fov.down_tan.max(tan.y);
            }
            fov
        };
        let c = self.lens_center;
        FovPort {
            left_tan: reach(Vec2::new(-1.0, c.y)).left_tan,
            right_tan: reach(Vec2::new(1.0, c.y)).right_tan,
            up_tan: reach(Vec2::new(c.x, -1.0)).up_tan,
            down_tan: reach(Vec2::new(c.x, 1.0)).down_tan,
        }
    }

    pub fn clamp_to_physical_screen_fov(&self, fov: FovPort) -> FovPort {
        fov.min(&self.physical_screen_fov())
    }

    /// Render target size that keeps one texel per display pixel at the lens center
    pub fn ideal_pixel_size(&self, fov: FovPort, pixels_per_display_pixel: f32) -> Sizei {
        let ppt = self.pixels_per_tan_angle_at_center;
        Sizei::new(
            (0.5 + pixels_per_display_pixel * ppt.x * (fov.left_tan + fov.right_tan)) as u32,
            (0.5 + pixels_per_display_pixel * ppt.y * (fov.up_tan + fov.down_tan)) as u32,
        )
    }
}

pub fn tan_fov_to_render_target_ndc(fov: &FovPort, tan_eye_angle: Vec2) -> Vec2 {
    fov.to_ndc_scale_and_offset().apply(tan_eye_angle)
}

pub fn render_target_ndc_to_tan_fov(fov: &FovPort, ndc: Vec2) -> Vec2 {
    fov.to_ndc_scale_and_offset().invert(ndc)
}

/// FOV limited by the lens rim as seen from the pupil.
///
/// `extra_eye_rotation` widens it for the pupil moving as the eye turns,
/// capped at 30 degrees.
pub fn fov_from_eye_position(eye: Eye, hmd: &HmdRenderInfo, extra_eye_rotation: f32) -> FovPort {
    let config = hmd.eye(eye);
    let relief = config.relief_in_meters.max(0.006);
    let inward = config.nose_to_pupil_in_meters - 0.5 * hmd.lens_separation_in_meters;
    let offset_to_right = if eye.is_right() { inward } else { -inward };
    let offset_down = 0.0;
    let half_lens = hmd.lens_diameter_in_meters * 0.5;

    let mut fov = FovPort::new(
        (half_lens + offset_down) / relief,
        (half_lens - offset_down) / relief,
        (half_lens + offset_to_right) / relief,
        (half_lens - offset_to_right) / relief,
    );

    if extra_eye_rotation > 0.0 {
        let rotation = extra_eye_rotation.clamp(0.0, 30f32.to_radians());
        const EYEBALL_CENTER_TO_PUPIL: f32 = 0.0135;
        let lateral_pull = 0.001 * (rotation / 30f32.to_radians());
        let extra_translation = EYEBALL_CENTER_TO_PUPIL * rotation.sin() + lateral_pull;
        let extra_relief = EYEBALL_CENTER_TO_PUPIL * (1.0 - rotation.cos());
        let swung = |edge: f32| (edge + extra_translation) / (relief + extra_relief);

        fov.up_tan = fov.up_tan.max(swung(half_lens + offset_down));
        fov.down_tan = fov.down_tan.max(swung(half_lens - offset_down));
        fov.left_tan = fov.left_tan.max(swung(half_lens + offset_to_right));
        fov.right_tan = fov.right_tan.max(swung(half_lens - offset_to_right));
    }
    fov
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmd::{HmdDesc, HmdType};

    #[test]
    fn identity_lens_does_not_scale() {
        let lens = LensConfig::identity();
        for rsq in [0.0, 0.25, 1.0, 2.0] {
            assert_eq!(lens.scale_radius_squared(rsq), 1.0);
        }
    }

    #[test]
    fn spline_passes_through_knots() {
        let lens = lens_config_from_eye_relief(0.0, EyeCupType::Dk2A);
        assert_eq!(eval_catmull_rom10(&lens.k, 0.0), 1.0);
        for i in 1..NUM_COEFFICIENTS {
            let v = eval_catmull_rom10(&lens.k, i as f32);
            assert!((v - lens.k[i]).abs() < 1e-6, "knot {} gave {}", i, v);
        }
    }

    #[test]
    fn spline_extends_linearly_past_last_knot() {
        let lens = lens_config_from_eye_relief(0.0, EyeCupType::Dk2A);
        let slope = lens.k[10] - lens.k[9];
        let v = eval_catmull_rom10(&lens.k, 10.5);
        assert!((v - (lens.k[10] + 0.5 * slope)).abs() < 1e-5);
    }

    #[test]
    fn inverse_undoes_distortion() {
        let lens = lens_config_from_eye_relief(0.012, EyeCupType::Dk2A);
        for i in 1..=20 {
            let r = lens.max_inv_r * i as f32 / 20.0;
            let inv = lens.distortion_fn_inverse(r);
            let back = lens.distortion_fn(inv);
            assert!((back - r).abs() / r < 1e-3, "r={} back={}", r, back);
        }
    }

    #[test]
    fn approx_inverse_tracks_exact_inverse() {
        let lens = lens_config_from_eye_relief(0.0, EyeCupType::Dk2A);
        for i in 0..=20 {
            let r = lens.max_inv_r * i as f32 / 20.0;
            let exact = lens.distortion_fn_inverse(r);
            let approx = lens.distortion_fn_inverse_approx(r);
            assert!((exact - approx).abs() / lens.max_r < 0.01, "r={} {} vs {}", r, exact, approx);
        }
    }

    #[test]
    fn eye_relief_blends_and_clamps() {
        let default = lens_config_from_eye_relief(0.0, EyeCupType::Dk2A);
        assert!((default.chromatic_aberration[0] + 0.015).abs() < 1e-6);

        let mid = lens_config_from_eye_relief(0.013, EyeCupType::Dk2A);
        assert!((mid.chromatic_aberration[0] + 0.0131).abs() < 1e-5);

        let near = lens_config_from_eye_relief(0.001, EyeCupType::Dk2A);
        assert!((near.chromatic_aberration[0] + 0.0112).abs() < 1e-6);

        let far = lens_config_from_eye_relief(0.05, EyeCupType::Dk2A);
        assert!((far.chromatic_aberration[0] + 0.015).abs() < 1e-6);
    }

    #[test]
    fn generic_lens_resamples_into_spline() {
        let lens = lens_config_from_eye_relief(0.007, EyeCupType::Generic);
        assert_eq!(lens.eqn, DistortionEquation::CatmullRom10);
        assert!(lens.k.iter().all(|k| k.is_finite()));
    }

    #[test]
    fn chroma_scales_bracket_green() {
        let lens = lens_config_from_eye_relief(0.0, EyeCupType::Dk2A);
        let s = lens.scale_radius_squared_chroma(0.5);
        assert!(s.x < s.y, "red should pull in");
        assert!(s.z > s.y, "blue should push out");
    }

    #[test]
    fn screen_and_tan_space_round_trip() {
        let desc = HmdDesc::debug(HmdType::Dk2);
        let lens = lens_config_from_eye_relief(0.0, desc.render_info.eye_cups);
        let distortion = DistortionRenderDesc::new(Eye::Left, &desc.render_info, lens);
        for ndc in [Vec2::new(0.1, 0.2), Vec2::new(-0.5, 0.3), Vec2::new(0.4, -0.4)] {
            let tan = distortion.screen_ndc_to_tan_fov_space(ndc);
            let back = distortion.tan_fov_space_to_screen_ndc(tan, false);
            assert!((back - ndc).length() < 1e-3, "{:?} -> {:?}", ndc, back);
        }
    }

    #[test]
    fn right_eye_lens_center_is_mirrored() {
        let desc = HmdDesc::debug(HmdType::Dk1);
        let lens = lens_config_from_eye_relief(0.0, desc.render_info.eye_cups);
        let left = DistortionRenderDesc::new(Eye::Left, &desc.render_info, lens);
        let right = DistortionRenderDesc::new(Eye::Right, &desc.render_info, lens);
        assert_eq!(left.lens_center.x, -right.lens_center.x);
        assert_eq!(left.lens_center.y, right.lens_center.y);
    }

    #[test]
    fn ideal_size_scales_with_fov() {
        let desc = HmdDesc::debug(HmdType::Dk2);
        let lens = lens_config_from_eye_relief(0.0, desc.render_info.eye_cups);
        let distortion = DistortionRenderDesc::new(Eye::Left, &desc.render_info, lens);
        let small = distortion.ideal_pixel_size(FovPort::symmetric(0.5), 1.0);
        let large = distortion.ideal_pixel_size(FovPort::symmetric(1.0), 1.0);
        assert!(large.w > small.w && large.h > small.h);
    }
}

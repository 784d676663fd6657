//! Small value types shared across the pipeline
//!
//! Field-of-view is carried as tangent slopes rather than angles so the hot
//! paths never need trig.

use glam::Vec2;
use serde::{Deserialize, Serialize};

/// Which eye a value belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    pub const BOTH: [Eye; 2] = [Eye::Left, Eye::Right];

    pub fn index(self) -> usize {
        match self {
            Eye::Left => 0,
            Eye::Right => 1,
        }
    }

    pub fn is_right(self) -> bool {
        self == Eye::Right
    }
}

/// Field of view as four tangent slopes, all measured away from the center
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FovPort {
    pub up_tan: f32,
    pub down_tan: f32,
    pub left_tan: f32,
    pub right_tan: f32,
}

impl FovPort {
    pub const fn new(up_tan: f32, down_tan: f32, left_tan: f32, right_tan: f32) -> Self {
        Self { up_tan, down_tan, left_tan, right_tan }
    }

    /// Same slope on all four sides
    pub const fn symmetric(tan: f32) -> Self {
        Self::new(tan, tan, tan, tan)
    }

    pub fn max_side_tan(&self) -> f32 {
        self.up_tan.max(self.down_tan).max(self.left_tan).max(self.right_tan)
    }

    pub fn scaled(&self, scale: f32) -> Self {
        Self::new(
            self.up_tan * scale,
            self.down_tan * scale,
            self.left_tan * scale,
            self.right_tan * scale,
        )
    }

    /// Mirror left and right, used to derive the right eye from the left
    pub fn flipped_horizontally(&self) -> Self {
        Self::new(self.up_tan, self.down_tan, self.right_tan, self.left_tan)
    }

    /// Per-side minimum of two ports
    pub fn min(&self, other: &FovPort) -> Self {
        Self::new(
            self.up_tan.min(other.up_tan),
            self.down_tan.min(other.down_tan),
            self.left_tan.min(other.left_tan),
            self.right_tan.min(other.right_tan),
        )
    }

    pub fn is_valid(&self) -> bool {
        let tans = [self.up_tan, self.down_tan, self.left_tan, self.right_tan];
        tans.iter().all(|t| t.is_finite() && *t > 0.0)
    }

    /// Maps tan-angle space onto render target NDC for this port.
    ///
    /// Tangent y points down, so `+down_tan` lands on NDC `+1`.
    pub fn to_ndc_scale_and_offset(&self) -> ScaleAndOffset2D {
        let x_scale = 2.0 / (self.left_tan + self.right_tan);
        let x_offset = (self.left_tan - self.right_tan) * x_scale * 0.5;
        let y_scale = 2.0 / (self.up_tan + self.down_tan);
        let y_offset = (self.up_tan - self.down_tan) * y_scale * 0.5;
        ScaleAndOffset2D {
            scale: Vec2::new(x_scale, y_scale),
            offset: Vec2::new(x_offset, y_offset),
        }
    }

    /// Bit pattern used for hashing cache keys
    pub fn to_bits(&self) -> [u32; 4] {
        [
            self.up_tan.to_bits(),
            self.down_tan.to_bits(),
            self.left_tan.to_bits(),
            self.right_tan.to_bits(),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Sizei {
    pub w: u32,
    pub h: u32,
}

impl Sizei {
    pub const fn new(w: u32, h: u32) -> Self {
        Self { w, h }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Recti {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

impl Recti {
    pub const fn new(x: i32, y: i32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    /// True when the rect lies inside a texture of `size`
    pub fn fits_within(&self, size: Sizei) -> bool {
        self.x >= 0
            && self.y >= 0
            && self.x as u64 + self.w as u64 <= size.w as u64
            && self.y as u64 + self.h as u64 <= size.h as u64
    }
}

/// Linear 2D map, `out = in * scale + offset`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleAndOffset2D {
    pub scale: Vec2,
    pub offset: Vec2,
}

impl ScaleAndOffset2D {
    pub fn apply(&self, v: Vec2) -> Vec2 {
        v * self.scale + self.offset
    }

    pub fn invert(&self, v: Vec2) -> Vec2 {
        (v - self.offset) / self.scale
    }

    /// Converts an NDC map into texture UVs for a viewport inside a texture.
    pub fn ndc_to_uv(&self, viewport: Recti, texture_size: Sizei) -> ScaleAndOffset2D {
        let scale = self.scale * 0.5;
        let offset = self.offset * 0.5 + Vec2::splat(0.5);
        let tw = texture_size.w.max(1) as f32;
        let th = texture_size.h.max(1) as f32;
        let vp_scale = Vec2::new(viewport.w as f32 / tw, viewport.h as f32 / th);
        let vp_offset = Vec2::new(viewport.x as f32 / tw, viewport.y as f32 / th);
        ScaleAndOffset2D {
            scale: scale * vp_scale,
            offset: offset * vp_scale + vp_offset,
        }
    }

    /// Flips the v axis for textures whose origin is bottom-left
    pub fn flipped_v(&self) -> ScaleAndOffset2D {
        ScaleAndOffset2D {
            scale: Vec2::new(self.scale.x, -self.scale.y),
            offset: Vec2::new(self.offset.x, 1.0 - self.offset.y),
        }
    }
}

//! Push-constant blocks shared with the forward and shadow shaders

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use static_assertions::const_assert_eq;

/// Per-draw constants for the shadow-lit forward pass.
///
/// Scalars follow each `vec3` so the block keeps std140-style alignment.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ShadowLitPushConstants {
    pub view_proj: Mat4,
    pub model: Mat4,
    pub light_view_proj: Mat4,
    pub light_dir: Vec3,
    pub ambient_strength: f32,
    pub light_color: Vec3,
    pub shadow_bias: f32,
}

const_assert_eq!(std::mem::size_of::<ShadowLitPushConstants>(), 224);

impl Default for ShadowLitPushConstants {
    fn default() -> Self {
        Self {
            view_proj: Mat4::IDENTITY,
            model: Mat4::IDENTITY,
            light_view_proj: Mat4::IDENTITY,
            light_dir: Vec3::new(0.0, -1.0, 0.0),
            ambient_strength: 0.1,
            light_color: Vec3::ONE,
            shadow_bias: 0.005,
        }
    }
}

/// Per-draw constants for the depth-only shadow pass
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ShadowPassPushConstants {
    pub light_view_proj: Mat4,
    pub model: Mat4,
}

const_assert_eq!(std::mem::size_of::<ShadowPassPushConstants>(), 128);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shadow_lit_field_offsets() {
        let block = ShadowLitPushConstants {
            light_dir: Vec3::new(1.0, 2.0, 3.0),
            ambient_strength: 4.0,
            light_color: Vec3::new(5.0, 6.0, 7.0),
            shadow_bias: 8.0,
            ..Default::default()
        };
        let floats: &[f32] = bytemuck::cast_slice(bytemuck::bytes_of(&block));
        assert_eq!(&floats[48..56], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_shadow_pass_layout() {
        let block = ShadowPassPushConstants {
            light_view_proj: Mat4::IDENTITY,
            model: Mat4::from_translation(Vec3::new(3.0, 0.0, 0.0)),
        };
        let floats: &[f32] = bytemuck::cast_slice(bytemuck::bytes_of(&block));
        assert_eq!(floats[0], 1.0);
        assert_eq!(floats[16 + 12], 3.0);
    }
}

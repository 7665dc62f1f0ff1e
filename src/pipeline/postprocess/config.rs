//! Effect stack parameters and their GPU block

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

/// Tunable effect stack of the composite pass.
///
/// Every effect toggles independently. Changes take effect at the next
/// composite without re-creating any GPU resource.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PostProcessConfig {
    pub enable_bloom: bool,
    pub bloom_threshold: f32,
    pub bloom_intensity: f32,

    pub enable_vignette: bool,
    pub vignette_strength: f32,

    pub enable_chromatic_aberration: bool,
    pub chromatic_aberration_strength: f32,

    pub enable_gamma_correction: bool,
    pub gamma: f32,

    pub exposure: f32,
    pub contrast: f32,
    pub saturation: f32,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            enable_bloom: false,
            bloom_threshold: 1.0,
            bloom_intensity: 0.5,
            enable_vignette: false,
            vignette_strength: 0.3,
            enable_chromatic_aberration: false,
            chromatic_aberration_strength: 0.002,
            enable_gamma_correction: true,
            gamma: 2.2,
            exposure: 1.0,
            contrast: 1.0,
            saturation: 1.0,
        }
    }
}

impl PostProcessConfig {
    /// Pack the config for the composite shader of a `width` x `height` target
    pub fn uniforms(&self, width: u32, height: u32) -> PostProcessUniforms {
        let texel = |extent: u32| if extent == 0 { 0.0 } else { 1.0 / extent as f32 };
        PostProcessUniforms {
            bloom_vignette_ca: [
                self.bloom_threshold,
                self.bloom_intensity,
                self.vignette_strength,
                self.chromatic_aberration_strength,
            ],
            gamma_exposure_contrast_saturation: [
                self.gamma,
                self.exposure,
                self.contrast,
                self.saturation,
            ],
            enabled: [
                self.enable_bloom as u32,
                self.enable_vignette as u32,
                self.enable_chromatic_aberration as u32,
                self.enable_gamma_correction as u32,
            ],
            texel_size: [texel(width), texel(height), 0.0, 0.0],
        }
    }
}

/// Uniform block at binding 1 of the composite bind group
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PostProcessUniforms {
    /// bloom threshold, bloom intensity, vignette strength, aberration strength
    pub bloom_vignette_ca: [f32; 4],
    pub gamma_exposure_contrast_saturation: [f32; 4],
    /// bloom, vignette, chromatic aberration, gamma correction
    pub enabled: [u32; 4],
    /// 1/width, 1/height
    pub texel_size: [f32; 4],
}

const_assert_eq!(std::mem::size_of::<PostProcessUniforms>(), 64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PostProcessConfig::default();
        assert!(!config.enable_bloom);
        assert!(!config.enable_vignette);
        assert!(!config.enable_chromatic_aberration);
        assert!(config.enable_gamma_correction);
        assert_eq!(config.gamma, 2.2);
        assert_eq!(config.vignette_strength, 0.3);
        assert_eq!(config.chromatic_aberration_strength, 0.002);
    }

    #[test]
    fn test_uniform_packing() {
        let config = PostProcessConfig {
            enable_bloom: true,
            exposure: 1.5,
            ..Default::default()
        };
        let uniforms = config.uniforms(800, 400);
        assert_eq!(uniforms.bloom_vignette_ca, [1.0, 0.5, 0.3, 0.002]);
        assert_eq!(uniforms.gamma_exposure_contrast_saturation, [2.2, 1.5, 1.0, 1.0]);
        assert_eq!(uniforms.enabled, [1, 0, 0, 1]);
        assert_eq!(uniforms.texel_size, [1.0 / 800.0, 1.0 / 400.0, 0.0, 0.0]);
    }

    #[test]
    fn test_zero_extent_does_not_divide() {
        let uniforms = PostProcessConfig::default().uniforms(0, 0);
        assert_eq!(uniforms.texel_size, [0.0; 4]);
    }
}

//! Material instances and their packed GPU block

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};
use static_assertions::const_assert_eq;

use crate::backend::{
    BackendResult, BindGroupHandle, BindGroupPoolHandle, BlendState, Face, GraphicsBackend,
    PipelineLayoutHandle, RenderPipelineHandle,
};
use crate::material::{Property, PropertyValue};
use crate::resources::GpuBuffer;

/// Texture slot value meaning "nothing bound"
pub const UNBOUND_TEXTURE: i32 = -1;

/// How fragments combine with the color already in the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Opaque,
    AlphaBlend,
    Additive,
    Multiply,
}

impl BlendMode {
    pub fn blend_state(&self) -> Option<BlendState> {
        match self {
            BlendMode::Opaque => None,
            BlendMode::AlphaBlend => Some(BlendState::alpha_blending()),
            BlendMode::Additive => Some(BlendState::additive()),
            BlendMode::Multiply => Some(BlendState::multiply()),
        }
    }
}

/// Which faces are discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    #[default]
    Back,
    Front,
    None,
}

impl CullMode {
    pub fn face(&self) -> Face {
        match self {
            CullMode::Back => Face::Back,
            CullMode::Front => Face::Front,
            CullMode::None => Face::None,
        }
    }
}

/// The pipeline-relevant subset of a material's state flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderState {
    pub blend_mode: BlendMode,
    pub cull_mode: CullMode,
    pub depth_write: bool,
    pub depth_test: bool,
}

impl Default for RenderState {
    fn default() -> Self {
        MaterialProperties::default().render_state()
    }
}

/// Fixed PBR block, state flags, texture slots and the custom property bag
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialProperties {
    pub base_color: Vec4,
    pub emissive: Vec3,
    pub metallic: f32,
    pub roughness: f32,
    pub ao: f32,
    pub normal_strength: f32,

    pub blend_mode: BlendMode,
    pub cull_mode: CullMode,
    pub depth_write: bool,
    pub depth_test: bool,
    pub cast_shadows: bool,
    pub receive_shadows: bool,

    pub albedo_map: i32,
    pub normal_map: i32,
    pub metallic_roughness_map: i32,
    pub ao_map: i32,
    pub emissive_map: i32,

    /// Case-sensitive name to value map, seeded from the shader's defaults
    pub custom: HashMap<String, PropertyValue>,
}

impl Default for MaterialProperties {
    fn default() -> Self {
        Self {
            base_color: Vec4::ONE,
            emissive: Vec3::ZERO,
            metallic: 0.0,
            roughness: 1.0,
            ao: 1.0,
            normal_strength: 1.0,
            blend_mode: BlendMode::Opaque,
            cull_mode: CullMode::Back,
            depth_write: true,
            depth_test: true,
            cast_shadows: true,
            receive_shadows: true,
            albedo_map: UNBOUND_TEXTURE,
            normal_map: UNBOUND_TEXTURE,
            metallic_roughness_map: UNBOUND_TEXTURE,
            ao_map: UNBOUND_TEXTURE,
            emissive_map: UNBOUND_TEXTURE,
            custom: HashMap::new(),
        }
    }
}

impl MaterialProperties {
    pub fn render_state(&self) -> RenderState {
        RenderState {
            blend_mode: self.blend_mode,
            cull_mode: self.cull_mode,
            depth_write: self.depth_write,
            depth_test: self.depth_test,
        }
    }

    /// Pack the PBR block for shaders. Only the six PBR fields contribute.
    pub fn to_gpu(&self) -> GpuMaterialData {
        GpuMaterialData {
            base_color: self.base_color.to_array(),
            emissive_metallic: self.emissive.extend(self.metallic).to_array(),
            roughness_ao_normal: [self.roughness, self.ao, self.normal_strength, 0.0],
        }
    }
}

/// Material block as consumed by shaders.
///
/// - offset 0: base color
/// - offset 16: emissive.xyz, metallic
/// - offset 32: roughness, ao, normal strength, 0
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuMaterialData {
    pub base_color: [f32; 4],
    pub emissive_metallic: [f32; 4],
    pub roughness_ao_normal: [f32; 4],
}

const_assert_eq!(std::mem::size_of::<GpuMaterialData>(), 48);
const_assert_eq!(std::mem::align_of::<GpuMaterialData>(), 16);

impl GpuMaterialData {
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Free-function form of [`MaterialProperties::to_gpu`]
pub fn to_gpu(properties: &MaterialProperties) -> GpuMaterialData {
    properties.to_gpu()
}

/// One pipeline stage of a shader definition
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShaderPass {
    pub name: String,
    pub vertex_shader: String,
    pub fragment_shader: String,
    pub defines: Vec<String>,
    /// Filled in when the pass is materialized against a backend
    pub pipeline: RenderPipelineHandle,
    pub layout: PipelineLayoutHandle,
}

impl ShaderPass {
    pub fn new(name: &str, vertex_shader: &str, fragment_shader: &str) -> Self {
        Self {
            name: name.to_string(),
            vertex_shader: vertex_shader.to_string(),
            fragment_shader: fragment_shader.to_string(),
            ..Default::default()
        }
    }

    pub fn is_materialized(&self) -> bool {
        !self.pipeline.is_null()
    }

    /// Copy of the pass metadata with no pipeline attached
    pub fn unmaterialized(&self) -> Self {
        Self {
            pipeline: RenderPipelineHandle::NULL,
            layout: PipelineLayoutHandle::NULL,
            ..self.clone()
        }
    }
}

/// GPU objects a prepared material owns
#[derive(Debug, Default)]
pub(crate) struct MaterialBinding {
    pub(crate) uniform: GpuBuffer,
    pub(crate) bind_group: BindGroupHandle,
    pub(crate) pool: BindGroupPoolHandle,
}

/// An instance of a shader definition with its own property values.
///
/// A material refers to its shader by name and holds copies of the shader's
/// passes. Pipelines in those copies belong to the [`ShaderLibrary`]
/// that filled them in.
///
/// Cloning copies the properties and passes, pipelines included, but not the
/// uniform buffer or descriptor set: the clone starts unprepared.
///
/// [`ShaderLibrary`]: crate::material::ShaderLibrary
#[derive(Debug, Default)]
pub struct Material {
    pub name: String,
    pub shader_name: String,
    pub properties: MaterialProperties,
    pub passes: Vec<ShaderPass>,
    pub(crate) binding: MaterialBinding,
}

impl Clone for Material {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            shader_name: self.shader_name.clone(),
            properties: self.properties.clone(),
            passes: self.passes.clone(),
            binding: MaterialBinding::default(),
        }
    }
}

impl Material {
    pub fn new(name: &str, shader_name: &str) -> Self {
        Self {
            name: name.to_string(),
            shader_name: shader_name.to_string(),
            ..Default::default()
        }
    }

    /// Store any property value under `name`
    pub fn set<T: Property>(&mut self, name: &str, value: T) {
        self.properties
            .custom
            .insert(name.to_string(), value.into_value());
    }

    pub fn set_float(&mut self, name: &str, value: f32) {
        self.set(name, value);
    }

    pub fn set_vec2(&mut self, name: &str, value: Vec2) {
        self.set(name, value);
    }

    pub fn set_vec3(&mut self, name: &str, value: Vec3) {
        self.set(name, value);
    }

    pub fn set_vec4(&mut self, name: &str, value: Vec4) {
        self.set(name, value);
    }

    pub fn set_mat4(&mut self, name: &str, value: Mat4) {
        self.set(name, value);
    }

    pub fn set_int(&mut self, name: &str, value: i32) {
        self.set(name, value);
    }

    /// The stored value if it is a `T`, otherwise `default`
    pub fn get<T: Property>(&self, name: &str, default: T) -> T {
        self.properties
            .custom
            .get(name)
            .and_then(T::from_value)
            .unwrap_or(default)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.custom.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        self.properties.custom.remove(name)
    }

    pub fn render_state(&self) -> RenderState {
        self.properties.render_state()
    }

    pub fn to_gpu(&self) -> GpuMaterialData {
        self.properties.to_gpu()
    }

    /// Forward pass copy, if the material has any passes
    pub fn forward_pass(&self) -> Option<&ShaderPass> {
        self.passes.first()
    }

    pub fn pass(&self, name: &str) -> Option<&ShaderPass> {
        self.passes.iter().find(|p| p.name == name)
    }

    /// Descriptor set holding the material block, null until prepared
    pub fn bind_group(&self) -> BindGroupHandle {
        self.binding.bind_group
    }

    pub fn uniform_buffer(&self) -> &GpuBuffer {
        &self.binding.uniform
    }

    pub fn is_prepared(&self) -> bool {
        !self.binding.uniform.is_null() && !self.binding.bind_group.is_null()
    }

    /// Rewrite the packed block after property edits
    pub fn upload<B: GraphicsBackend>(&mut self, backend: &mut B) -> BackendResult<()> {
        let data = self.to_gpu();
        self.binding.uniform.update(backend, 0, data.as_bytes())
    }

    /// Free the uniform buffer and descriptor set and forget any pipelines
    pub fn release<B: GraphicsBackend>(&mut self, backend: &mut B) {
        if !self.binding.bind_group.is_null() {
            backend.free_bind_group(self.binding.pool, self.binding.bind_group);
        }
        self.binding.uniform.destroy(backend);
        self.binding = MaterialBinding::default();
        for pass in &mut self.passes {
            *pass = pass.unmaterialized();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_properties() {
        let props = MaterialProperties::default();
        assert_eq!(props.base_color, Vec4::ONE);
        assert_eq!(props.roughness, 1.0);
        assert_eq!(props.albedo_map, UNBOUND_TEXTURE);
        assert_eq!(props.render_state().blend_mode, BlendMode::Opaque);
        assert!(props.depth_write && props.depth_test);
        assert_eq!(RenderState::default(), props.render_state());
    }

    #[test]
    fn test_to_gpu_layout() {
        let props = MaterialProperties {
            base_color: Vec4::new(0.5, 0.5, 0.5, 1.0),
            emissive: Vec3::new(0.0, 0.0, 0.2),
            metallic: 0.8,
            roughness: 0.3,
            ao: 0.9,
            normal_strength: 1.0,
            ..Default::default()
        };
        let gpu = props.to_gpu();
        let floats: &[f32] = bytemuck::cast_slice(gpu.as_bytes());
        assert_eq!(
            floats,
            &[0.5, 0.5, 0.5, 1.0, 0.0, 0.0, 0.2, 0.8, 0.3, 0.9, 1.0, 0.0]
        );
    }

    #[test]
    fn test_to_gpu_ignores_state_and_custom() {
        let base = MaterialProperties::default();
        let mut other = base.clone();
        other.blend_mode = BlendMode::Additive;
        other.cull_mode = CullMode::None;
        other.cast_shadows = false;
        other.normal_map = 3;
        other.custom.insert("tiling".into(), PropertyValue::Float(4.0));
        assert_eq!(base.to_gpu().as_bytes(), other.to_gpu().as_bytes());
    }

    #[test]
    fn test_typed_getter() {
        let mut material = Material::new("m", "Standard");
        material.set_float("metallic", 0.25);
        material.set_int("layers", 2);

        assert_eq!(material.get("metallic", 1.0f32), 0.25);
        assert_eq!(material.get("metallic", 9i32), 9);
        assert_eq!(material.get("layers", 0i32), 2);
        assert_eq!(material.get("missing", Vec3::X), Vec3::X);
        assert_eq!(material.get("Metallic", -1.0f32), -1.0);
    }

    #[test]
    fn test_setter_replaces_tag() {
        let mut material = Material::new("m", "Unlit");
        material.set_vec4("tint", Vec4::ONE);
        material.set_vec2("tint", Vec2::ONE);
        assert_eq!(material.get("tint", Vec4::ZERO), Vec4::ZERO);
        assert_eq!(material.get("tint", Vec2::ZERO), Vec2::ONE);
        assert_eq!(material.remove("tint"), Some(PropertyValue::Vec2(Vec2::ONE)));
    }

    #[test]
    fn test_blend_modes() {
        assert!(BlendMode::Opaque.blend_state().is_none());
        assert_eq!(
            BlendMode::AlphaBlend.blend_state(),
            Some(BlendState::alpha_blending())
        );
        assert_eq!(CullMode::None.face(), Face::None);
    }
}

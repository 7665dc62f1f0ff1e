//! Registry of named shader definitions.
//!
//! The library parses shader description files, hands out [`Material`]s that
//! copy a definition's passes and defaults, and owns every pipeline built
//! from its definitions. Pipelines are created lazily once a backend and a
//! target render pass are known.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::backend::{
    BackendError, BackendResult, BindGroupEntry, BindGroupLayoutEntry, BindGroupLayoutHandle,
    BindGroupPoolDescriptor, BindGroupPoolHandle, BindingType, BufferUsage, CompareFunction,
    DepthStencilState, FrontFace, GraphicsBackend, PipelineLayoutDescriptor, PipelineLayoutHandle,
    PrimitiveTopology, PushConstantRange, RenderPassHandle, RenderPipelineDescriptor,
    RenderPipelineHandle, ShaderStageFlags, TextureFormat,
};
use crate::material::{parse_shader, Material, ParseError, RenderState, ShaderDef, ShaderPass};
use crate::resources::{BoneBuffer, GpuBuffer, ShadowLitPushConstants, Vertex};

/// Names of the definitions [`ShaderLibrary::register_builtins`] installs
pub const BUILTIN_SHADERS: [&str; 4] = ["Standard", "Unlit", "Instanced", "Skinned"];

/// Name of the pass every builtin shader has
pub const FORWARD_PASS: &str = "Forward";

/// Binding of the packed material block in a material's bind group
pub const MATERIAL_BINDING: u32 = 0;

/// Binding of the bone palette in a material's bind group
pub const BONE_BINDING: u32 = 1;

const DEFAULT_MATERIAL_CAPACITY: u32 = 256;

/// Errors loading a shader description
#[derive(Error, Debug)]
pub enum ShaderLoadError {
    #[error("failed to open shader file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("shader description has no 'shader' directive")]
    MissingName,
}

/// Render pass and attachment formats a pipeline is built against.
///
/// Pipelines are shared by every target with the same formats, so all render
/// passes described with one pair of formats must be compatible. A resized
/// offscreen target therefore reuses the pipelines built for the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineTarget {
    pub render_pass: RenderPassHandle,
    pub color_format: TextureFormat,
    pub depth_format: Option<TextureFormat>,
}

impl PipelineTarget {
    fn formats(&self) -> (TextureFormat, Option<TextureFormat>) {
        (self.color_format, self.depth_format)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct VariantKey {
    shader: String,
    pass: usize,
    state: RenderState,
    formats: (TextureFormat, Option<TextureFormat>),
}

/// Shader registry and owner of the pipelines built from it
pub struct ShaderLibrary {
    shaders: HashMap<String, ShaderDef>,
    variants: HashMap<VariantKey, RenderPipelineHandle>,
    /// Pipelines and layouts of replaced definitions, destroyed on the next
    /// call that has a backend
    retired_pipelines: Vec<RenderPipelineHandle>,
    retired_layouts: Vec<PipelineLayoutHandle>,
    material_layout: BindGroupLayoutHandle,
    material_pool: BindGroupPoolHandle,
    material_capacity: u32,
}

impl Default for ShaderLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaderLibrary {
    /// Create a library with the builtin shaders registered
    pub fn new() -> Self {
        let mut library = Self::empty();
        library.register_builtins();
        library
    }

    /// Create a library with no definitions
    pub fn empty() -> Self {
        Self {
            shaders: HashMap::new(),
            variants: HashMap::new(),
            retired_pipelines: Vec::new(),
            retired_layouts: Vec::new(),
            material_layout: BindGroupLayoutHandle::NULL,
            material_pool: BindGroupPoolHandle::NULL,
            material_capacity: DEFAULT_MATERIAL_CAPACITY,
        }
    }

    /// Number of materials [`ShaderLibrary::prepare_material`] can bind
    /// before the pool is exhausted. Only effective before the first
    /// prepared material.
    pub fn with_material_capacity(mut self, capacity: u32) -> Self {
        self.material_capacity = capacity.max(1);
        self
    }

    /// Install Standard, Unlit, Instanced and Skinned, replacing any
    /// definitions with those names
    pub fn register_builtins(&mut self) {
        for name in BUILTIN_SHADERS {
            let stem = name.to_lowercase();
            let mut def = ShaderDef::new(name)
                .with_pass(ShaderPass::new(
                    FORWARD_PASS,
                    &format!("shaders/{stem}_vert.spv"),
                    &format!("shaders/{stem}_frag.spv"),
                ))
                .with_property("baseColor", glam::Vec4::ONE);
            if name == "Standard" {
                def = def
                    .with_property("metallic", 0.0f32)
                    .with_property("roughness", 1.0f32);
            }
            self.register(def);
        }
        log::debug!("Registered {} builtin shaders", BUILTIN_SHADERS.len());
    }

    /// Add a definition, replacing one with the same name.
    ///
    /// Pipelines built from the replaced definition are released on the next
    /// call that receives a backend.
    pub fn register(&mut self, def: ShaderDef) {
        if let Some(old) = self.shaders.remove(&def.name) {
            self.retire(&old);
        }
        self.shaders.insert(def.name.clone(), def);
    }

    fn retire(&mut self, old: &ShaderDef) {
        let stale: Vec<VariantKey> = self
            .variants
            .keys()
            .filter(|key| key.shader == old.name)
            .cloned()
            .collect();
        for key in stale {
            if let Some(pipeline) = self.variants.remove(&key) {
                self.retired_pipelines.push(pipeline);
            }
        }
        self.retired_layouts.extend(
            old.passes
                .iter()
                .map(|pass| pass.layout)
                .filter(|layout| !layout.is_null()),
        );
    }

    fn collect_retired<B: GraphicsBackend>(&mut self, backend: &mut B) {
        for pipeline in self.retired_pipelines.drain(..) {
            backend.destroy_render_pipeline(pipeline);
        }
        for layout in self.retired_layouts.drain(..) {
            backend.destroy_pipeline_layout(layout);
        }
    }

    /// Parse a shader description file and commit it.
    ///
    /// Returns false, after logging the cause, when the file cannot be read,
    /// is rejected by the parser, or names no shader.
    pub fn load_shader(&mut self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        match self.try_load_shader(path) {
            Ok(_) => true,
            Err(e) => {
                log::error!("Failed to load shader {}: {e}", path.display());
                false
            }
        }
    }

    /// Parse a shader description file and commit it, returning its name
    pub fn try_load_shader(&mut self, path: impl AsRef<Path>) -> Result<String, ShaderLoadError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ShaderLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.load_shader_source(&source)
    }

    /// Parse a shader description held in memory and commit it
    pub fn load_shader_source(&mut self, source: &str) -> Result<String, ShaderLoadError> {
        let def = parse_shader(source)?;
        if def.name.is_empty() {
            return Err(ShaderLoadError::MissingName);
        }

        let name = def.name.clone();
        let replaced = self.shaders.contains_key(&name);
        log::info!(
            "Loaded shader '{name}' ({} passes, {} properties){}",
            def.passes.len(),
            def.default_properties.len(),
            if replaced { ", replacing previous definition" } else { "" }
        );
        self.register(def);
        Ok(name)
    }

    /// Load every `*.shader` file in `dir`, in file name order.
    ///
    /// Returns how many were committed. A missing directory loads nothing.
    pub fn load_shader_dir(&mut self, dir: impl AsRef<Path>) -> usize {
        let dir = dir.as_ref();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("Shader directory {} not read: {e}", dir.display());
                return 0;
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "shader"))
            .collect();
        paths.sort();

        paths
            .iter()
            .filter(|path| self.load_shader(path))
            .count()
    }

    pub fn has_shader(&self, name: &str) -> bool {
        self.shaders.contains_key(name)
    }

    pub fn get_shader(&self, name: &str) -> Option<&ShaderDef> {
        self.shaders.get(name)
    }

    /// Registered names, sorted
    pub fn shader_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.shaders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }

    /// Instantiate a shader.
    ///
    /// The material gets unmaterialized copies of the passes and a copy of
    /// the defaults. An unknown shader still yields a material, with no
    /// passes and no defaults. The name defaults to `<shader>_material`.
    pub fn create_material(&self, shader_name: &str, material_name: Option<&str>) -> Material {
        let name = match material_name {
            Some(name) => name.to_string(),
            None => format!("{shader_name}_material"),
        };
        let mut material = Material::new(&name, shader_name);

        match self.shaders.get(shader_name) {
            Some(def) => {
                material.passes = def.passes.iter().map(ShaderPass::unmaterialized).collect();
                material.properties.custom = def.default_properties.clone();
            }
            None => log::warn!("Material '{name}' refers to unknown shader '{shader_name}'"),
        }
        material
    }

    /// Layout of the material bind group, null until a backend has been used
    pub fn material_layout(&self) -> BindGroupLayoutHandle {
        self.material_layout
    }

    fn ensure_material_layout<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
    ) -> BackendResult<BindGroupLayoutHandle> {
        if self.material_layout.is_null() {
            self.material_layout = backend.create_bind_group_layout(&[
                BindGroupLayoutEntry {
                    binding: MATERIAL_BINDING,
                    visibility: ShaderStageFlags::VERTEX_FRAGMENT,
                    ty: BindingType::UniformBuffer,
                },
                BindGroupLayoutEntry {
                    binding: BONE_BINDING,
                    visibility: ShaderStageFlags::VERTEX,
                    ty: BindingType::UniformBuffer,
                },
            ])?;
        }
        Ok(self.material_layout)
    }

    fn ensure_material_pool<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
    ) -> BackendResult<BindGroupPoolHandle> {
        if self.material_pool.is_null() {
            self.material_pool = backend.create_bind_group_pool(&BindGroupPoolDescriptor {
                label: Some("material_pool".into()),
                max_sets: self.material_capacity,
                uniform_buffers: self.material_capacity * 2,
                combined_image_samplers: 0,
            })?;
        }
        Ok(self.material_pool)
    }

    /// Pipeline layout of a pass, created on first use
    fn ensure_pass_layout<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        shader: &str,
        pass_index: usize,
    ) -> BackendResult<PipelineLayoutHandle> {
        let material_layout = self.ensure_material_layout(backend)?;
        let pass = self
            .shaders
            .get_mut(shader)
            .and_then(|def| def.passes.get_mut(pass_index))
            .ok_or_else(|| unknown_pass(shader, pass_index))?;

        if pass.layout.is_null() {
            pass.layout = backend.create_pipeline_layout(&PipelineLayoutDescriptor {
                label: Some(format!("{shader}/{}", pass.name)),
                bind_group_layouts: vec![material_layout],
                push_constant_ranges: vec![PushConstantRange {
                    stages: ShaderStageFlags::VERTEX_FRAGMENT,
                    offset: 0,
                    size: std::mem::size_of::<ShadowLitPushConstants>() as u32,
                }],
            })?;
        }
        Ok(pass.layout)
    }

    /// Pipeline for one pass under one render state, built on first request
    fn variant<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        shader: &str,
        pass_index: usize,
        state: RenderState,
        target: &PipelineTarget,
    ) -> BackendResult<(RenderPipelineHandle, PipelineLayoutHandle)> {
        let layout = self.ensure_pass_layout(backend, shader, pass_index)?;
        let key = VariantKey {
            shader: shader.to_string(),
            pass: pass_index,
            state,
            formats: target.formats(),
        };
        if let Some(&pipeline) = self.variants.get(&key) {
            return Ok((pipeline, layout));
        }

        let pass = self
            .shaders
            .get(shader)
            .and_then(|def| def.passes.get(pass_index))
            .ok_or_else(|| unknown_pass(shader, pass_index))?;

        let desc = RenderPipelineDescriptor {
            label: Some(format!("{shader}/{}", pass.name)),
            layout,
            render_pass: target.render_pass,
            vertex_shader: pass.vertex_shader.clone(),
            fragment_shader: pass.fragment_shader.clone(),
            defines: pass.defines.clone(),
            vertex_layouts: vec![Vertex::layout()],
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: state.cull_mode.face(),
            depth_stencil: target.depth_format.map(|format| DepthStencilState {
                format,
                depth_test_enabled: state.depth_test,
                depth_write_enabled: state.depth_write,
                depth_compare: CompareFunction::Less,
            }),
            blend: state.blend_mode.blend_state(),
        };
        let pipeline = backend.create_render_pipeline(&desc)?;
        log::debug!(
            "Created pipeline for {shader}/{} ({:?}, cull {:?})",
            pass.name,
            state.blend_mode,
            state.cull_mode
        );
        self.variants.insert(key, pipeline);
        Ok((pipeline, layout))
    }

    /// Build the canonical pipeline of every pass of `name`.
    ///
    /// The handles are stored in the library's definition, so materials
    /// created afterwards still start unmaterialized.
    pub fn materialize_shader<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        name: &str,
        target: &PipelineTarget,
    ) -> BackendResult<()> {
        self.collect_retired(backend);
        let pass_count = self
            .shaders
            .get(name)
            .map(|def| def.passes.len())
            .ok_or_else(|| unknown_shader(name))?;

        for pass_index in 0..pass_count {
            let (pipeline, _) =
                self.variant(backend, name, pass_index, RenderState::default(), target)?;
            if let Some(pass) = self
                .shaders
                .get_mut(name)
                .and_then(|def| def.passes.get_mut(pass_index))
            {
                pass.pipeline = pipeline;
            }
        }
        Ok(())
    }

    /// Fill a material's pass copies with pipelines matching its render state
    pub fn bind_material<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        material: &mut Material,
        target: &PipelineTarget,
    ) -> BackendResult<()> {
        self.collect_retired(backend);
        let def = self
            .shaders
            .get(&material.shader_name)
            .ok_or_else(|| unknown_shader(&material.shader_name))?;

        // Passes are matched by name; a material may have been created from an
        // older definition with a different pass order.
        let indices: Vec<Option<usize>> = material
            .passes
            .iter()
            .map(|pass| def.pass_index(&pass.name))
            .collect();

        let state = material.render_state();
        for (pass, index) in material.passes.iter_mut().zip(indices) {
            let Some(index) = index else {
                log::warn!(
                    "Material '{}' pass '{}' no longer exists in shader '{}'",
                    material.name,
                    pass.name,
                    material.shader_name
                );
                continue;
            };
            let (pipeline, layout) =
                self.variant(backend, &material.shader_name, index, state, target)?;
            pass.pipeline = pipeline;
            pass.layout = layout;
        }
        Ok(())
    }

    /// Give a material its uniform buffer and bind group and upload its block.
    ///
    /// `bones` is bound at [`BONE_BINDING`] for skinned shaders. Preparing an
    /// already prepared material only re-uploads the block.
    pub fn prepare_material<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        material: &mut Material,
        bones: Option<&BoneBuffer>,
    ) -> BackendResult<()> {
        if material.is_prepared() {
            return material.upload(backend);
        }

        let layout = self.ensure_material_layout(backend)?;
        let pool = self.ensure_material_pool(backend)?;

        let data = material.to_gpu();
        let mut uniform = GpuBuffer::create_init(
            backend,
            &format!("{}_material", material.name),
            BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            data.as_bytes(),
            true,
        )?;

        let bind_group = match backend.allocate_bind_group(pool, layout) {
            Ok(group) => group,
            Err(e) => {
                uniform.destroy(backend);
                return Err(e);
            }
        };

        let mut entries = vec![(
            MATERIAL_BINDING,
            BindGroupEntry::Buffer {
                buffer: uniform.handle(),
                offset: 0,
                size: Some(uniform.size()),
            },
        )];
        if let Some(bones) = bones.filter(|b| b.is_valid()) {
            entries.push((
                BONE_BINDING,
                BindGroupEntry::Buffer {
                    buffer: bones.handle(),
                    offset: 0,
                    size: Some(bones.buffer().size()),
                },
            ));
        }
        backend.update_bind_group(bind_group, &entries);

        material.binding.uniform = uniform;
        material.binding.bind_group = bind_group;
        material.binding.pool = pool;
        Ok(())
    }

    /// Destroy every pipeline and layout built from the registry and clear it.
    ///
    /// Materials still holding bind groups from this library are left with
    /// dangling handles; release them first.
    pub fn teardown<B: GraphicsBackend>(&mut self, backend: &mut B) {
        self.collect_retired(backend);
        for (_, pipeline) in self.variants.drain() {
            backend.destroy_render_pipeline(pipeline);
        }
        for def in self.shaders.values() {
            for pass in &def.passes {
                if !pass.layout.is_null() {
                    backend.destroy_pipeline_layout(pass.layout);
                }
            }
        }
        self.shaders.clear();

        if !self.material_pool.is_null() {
            backend.destroy_bind_group_pool(self.material_pool);
            self.material_pool = BindGroupPoolHandle::NULL;
        }
        if !self.material_layout.is_null() {
            backend.destroy_bind_group_layout(self.material_layout);
            self.material_layout = BindGroupLayoutHandle::NULL;
        }
        log::debug!("Shader library torn down");
    }
}

fn unknown_shader(name: &str) -> BackendError {
    BackendError::PipelineCreationFailed(format!("unknown shader '{name}'"))
}

fn unknown_pass(shader: &str, index: usize) -> BackendError {
    BackendError::PipelineCreationFailed(format!("shader '{shader}' has no pass {index}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessBackend, RenderPassLayout};
    use crate::material::{BlendMode, PropertyValue};
    use glam::Vec4;

    fn target(backend: &mut HeadlessBackend) -> PipelineTarget {
        let render_pass = backend
            .create_render_pass(&RenderPassLayout {
                label: None,
                color_attachments: vec![],
                depth_attachment: None,
            })
            .unwrap();
        PipelineTarget {
            render_pass,
            color_format: TextureFormat::Rgba16Float,
            depth_format: Some(TextureFormat::Depth32Float),
        }
    }

    #[test]
    fn test_builtins() {
        let library = ShaderLibrary::new();
        assert_eq!(library.shader_names(), vec!["Instanced", "Skinned", "Standard", "Unlit"]);

        let skinned = library.get_shader("Skinned").unwrap();
        assert_eq!(skinned.passes[0].vertex_shader, "shaders/skinned_vert.spv");
        assert_eq!(skinned.passes[0].fragment_shader, "shaders/skinned_frag.spv");
        assert!(skinned.passes[0].defines.is_empty());
        assert!(!skinned.default_properties.contains_key("metallic"));
    }

    #[test]
    fn test_empty_library() {
        let library = ShaderLibrary::empty();
        assert!(library.is_empty());
        assert!(!library.has_shader("Standard"));
    }

    #[test]
    fn test_missing_name_is_not_committed() {
        let mut library = ShaderLibrary::empty();
        let result = library.load_shader_source("property a float 1\n");
        assert!(matches!(result, Err(ShaderLoadError::MissingName)));
        assert!(library.is_empty());
    }

    #[test]
    fn test_reload_replaces() {
        let mut library = ShaderLibrary::new();
        library
            .load_shader_source("shader \"Unlit\"\npass \"Forward\"\nvertex \"a.spv\"\nend\n")
            .unwrap();
        let unlit = library.get_shader("Unlit").unwrap();
        assert_eq!(unlit.passes[0].vertex_shader, "a.spv");
        assert!(unlit.default_properties.is_empty());
        assert_eq!(library.len(), 4);
    }

    #[test]
    fn test_default_material_name() {
        let library = ShaderLibrary::new();
        let material = library.create_material("Standard", None);
        assert_eq!(material.name, "Standard_material");
        assert_eq!(
            material.property("roughness"),
            Some(&PropertyValue::Float(1.0))
        );
        assert_eq!(material.get("baseColor", Vec4::ZERO), Vec4::ONE);
    }

    #[test]
    fn test_variants_are_cached_per_state() {
        let mut backend = HeadlessBackend::new();
        let target = target(&mut backend);
        let mut library = ShaderLibrary::new();

        let mut a = library.create_material("Standard", Some("a"));
        let mut b = library.create_material("Standard", Some("b"));
        let mut glass = library.create_material("Standard", Some("glass"));
        glass.properties.blend_mode = BlendMode::AlphaBlend;

        library.bind_material(&mut backend, &mut a, &target).unwrap();
        library.bind_material(&mut backend, &mut b, &target).unwrap();
        library.bind_material(&mut backend, &mut glass, &target).unwrap();

        assert_eq!(a.passes[0].pipeline, b.passes[0].pipeline);
        assert_ne!(a.passes[0].pipeline, glass.passes[0].pipeline);
        assert_eq!(a.passes[0].layout, glass.passes[0].layout);
        assert_eq!(backend.stats().pipelines, 2);
        assert_eq!(backend.stats().pipeline_layouts, 1);

        let desc = backend.pipeline_descriptor(glass.passes[0].pipeline).unwrap();
        assert!(desc.blend.is_some());
    }

    #[test]
    fn test_materialize_shares_default_variant() {
        let mut backend = HeadlessBackend::new();
        let target = target(&mut backend);
        let mut library = ShaderLibrary::new();

        library.materialize_shader(&mut backend, "Unlit", &target).unwrap();
        assert!(library.get_shader("Unlit").unwrap().passes[0].is_materialized());

        let mut material = library.create_material("Unlit", None);
        assert!(!material.passes[0].is_materialized());
        library.bind_material(&mut backend, &mut material, &target).unwrap();
        assert_eq!(
            material.passes[0].pipeline,
            library.get_shader("Unlit").unwrap().passes[0].pipeline
        );
        assert_eq!(backend.stats().pipelines, 1);
    }

    #[test]
    fn test_bind_unknown_shader_fails() {
        let mut backend = HeadlessBackend::new();
        let target = target(&mut backend);
        let mut library = ShaderLibrary::new();
        let mut material = library.create_material("Missing", None);
        assert!(library.bind_material(&mut backend, &mut material, &target).is_err());
    }

    #[test]
    fn test_replaced_definition_releases_pipelines() {
        let mut backend = HeadlessBackend::new();
        let target = target(&mut backend);
        let mut library = ShaderLibrary::new();
        library.materialize_shader(&mut backend, "Unlit", &target).unwrap();
        assert_eq!(backend.stats().pipelines, 1);

        library
            .load_shader_source("shader \"Unlit\"\npass \"Forward\"\nvertex \"v.spv\"\nfragment \"f.spv\"\nend\n")
            .unwrap();
        library.materialize_shader(&mut backend, "Unlit", &target).unwrap();
        assert_eq!(backend.stats().pipelines, 1);
        assert_eq!(backend.stats().pipeline_layouts, 1);
    }

    #[test]
    fn test_prepare_material() {
        let mut backend = HeadlessBackend::new();
        let mut library = ShaderLibrary::new();
        let bones = BoneBuffer::create(&mut backend).unwrap();
        let mut material = library.create_material("Skinned", None);

        library
            .prepare_material(&mut backend, &mut material, Some(&bones))
            .unwrap();
        assert!(material.is_prepared());

        let entries = backend.bind_group_entries(material.bind_group()).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(
            entries[&BONE_BINDING],
            BindGroupEntry::Buffer { buffer, .. } if buffer == bones.handle()
        ));

        material.properties.metallic = 0.75;
        library.prepare_material(&mut backend, &mut material, None).unwrap();
        let bytes = backend.read_buffer(material.uniform_buffer().handle()).unwrap();
        let metallic: f32 = bytemuck::pod_read_unaligned(&bytes[28..32]);
        assert_eq!(metallic, 0.75);
    }

    #[test]
    fn test_teardown_releases_everything() {
        let mut backend = HeadlessBackend::new();
        let target = target(&mut backend);
        let mut library = ShaderLibrary::new();
        let mut material = library.create_material("Standard", None);
        library.bind_material(&mut backend, &mut material, &target).unwrap();
        library.prepare_material(&mut backend, &mut material, None).unwrap();
        material.release(&mut backend);

        library.teardown(&mut backend);
        let stats = backend.stats();
        assert_eq!(stats.pipelines, 0);
        assert_eq!(stats.pipeline_layouts, 0);
        assert_eq!(stats.bind_group_layouts, 0);
        assert_eq!(stats.bind_group_pools, 0);
        assert_eq!(stats.buffers, 0);
        assert!(library.is_empty());
    }
}

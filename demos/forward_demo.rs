//! Forward rendering demo
//!
//! Draws a spinning cube and a ground quad through the offscreen target and
//! the composite pass.
//!
//! Run with:
//!   cargo run --example forward_demo
//!
//! Expects compiled SPIR-V under `shaders/` (`standard_vert.spv`,
//! `standard_frag.spv`, `unlit_vert.spv`, `unlit_frag.spv`,
//! `fullscreen_vert.spv`, `post_frag.spv`) and loads descriptions from
//! `assets/shaders`.

use std::time::Instant;

use glam::{Mat4, Vec3, Vec4};
use zero_render::{
    backend::SurfaceBackend,
    init_logging,
    material::{BlendMode, Material},
    resources::{Mesh, MeshData},
    window, DrawItem, Renderer, RendererConfig, SceneLighting, VulkanBackend,
};

struct DemoState {
    renderer: Renderer<VulkanBackend>,
    cube: Mesh,
    ground: Mesh,
    cube_material: Material,
    ground_material: Material,
    start: Instant,
    last_report: Instant,
    frames_since_report: u32,
}

impl DemoState {
    fn new(window: &window::Window, config: RendererConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let backend = VulkanBackend::new(window.window_arc(), config.vsync)?;
        let mut renderer = Renderer::new(backend, config)?;

        let cube = renderer.create_mesh(&MeshData::cube())?;
        let ground = renderer.create_mesh(&MeshData::quad())?;

        let mut cube_material = renderer.create_material("Standard", Some("cube"), None)?;
        cube_material.properties.metallic = 0.2;
        cube_material.properties.roughness = 0.4;
        cube_material.upload(renderer.backend_mut())?;

        let ground_shader = if renderer.library().has_shader("Terrain") {
            "Terrain"
        } else {
            "Unlit"
        };
        let mut ground_material = renderer.create_material(ground_shader, Some("ground"), None)?;
        ground_material.properties.base_color = Vec4::new(0.4, 0.6, 0.3, 0.8);
        ground_material.properties.blend_mode = BlendMode::AlphaBlend;
        renderer.rebind_material(&mut ground_material)?;

        let now = Instant::now();
        Ok(Self {
            renderer,
            cube,
            ground,
            cube_material,
            ground_material,
            start: now,
            last_report: now,
            frames_since_report: 0,
        })
    }

    fn frame(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let t = self.start.elapsed().as_secs_f32();
        let (width, height) = self.renderer.post_processor().extent();
        let aspect = width as f32 / height.max(1) as f32;

        let projection = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 100.0);
        let view = Mat4::look_at_rh(Vec3::new(0.0, 3.0, 8.0), Vec3::ZERO, Vec3::Y);
        let lighting = SceneLighting {
            view_proj: projection * view,
            light_dir: Vec3::new(-0.4, -1.0, -0.3).normalize(),
            ..Default::default()
        };

        let items = [
            DrawItem {
                mesh: &self.cube,
                material: &self.cube_material,
                model: Mat4::from_rotation_y(t) * Mat4::from_rotation_x(t * 0.5),
            },
            DrawItem {
                mesh: &self.ground,
                material: &self.ground_material,
                model: Mat4::from_translation(Vec3::new(0.0, -1.5, 0.0))
                    * Mat4::from_rotation_x(-std::f32::consts::FRAC_PI_2)
                    * Mat4::from_scale(Vec3::splat(6.0)),
            },
        ];
        self.renderer.render_frame(&items, &lighting, None)?;

        self.frames_since_report += 1;
        let since = self.last_report.elapsed().as_secs_f32();
        if since >= 2.0 {
            log::info!("{:.1} fps", self.frames_since_report as f32 / since);
            self.frames_since_report = 0;
            self.last_report = Instant::now();
        }
        Ok(())
    }
}

impl Drop for DemoState {
    fn drop(&mut self) {
        self.renderer.backend_mut().wait_idle();
        self.renderer.destroy_material(&mut self.cube_material);
        self.renderer.destroy_material(&mut self.ground_material);
        self.renderer.destroy_mesh(&mut self.cube);
        self.renderer.destroy_mesh(&mut self.ground);
    }
}

fn main() {
    init_logging();

    let config = RendererConfig {
        title: "zero-render forward demo".to_string(),
        shader_dir: "assets/shaders".into(),
        ..Default::default()
    };
    let (title, width, height) = (config.title.clone(), config.width, config.height);

    let mut state: Option<DemoState> = None;
    let result = window::run(&title, width, height, move |window| {
        if state.is_none() {
            match DemoState::new(window, config.clone()) {
                Ok(created) => state = Some(created),
                Err(e) => {
                    log::error!("Failed to initialize demo: {e}");
                    window.request_close();
                    return;
                }
            }
        }
        let Some(demo) = state.as_mut() else {
            return;
        };

        if let Some((width, height)) = window.take_resize() {
            demo.renderer.resize(width, height);
        }
        if let Err(e) = demo.frame() {
            log::error!("Frame failed: {e}");
            window.request_close();
        }
        if window.should_close() {
            state = None;
        }
    });

    if let Err(e) = result {
        log::error!("{e}");
    }
}

//! End-to-end frame recording through the renderer

mod common;

use glam::Mat4;

use common::{surface_backend, write_shader, TERRAIN_SOURCE};
use zero_render::backend::{RecordedCommand, SurfaceBackend};
use zero_render::resources::MeshData;
use zero_render::{DrawItem, Renderer, RendererConfig, SceneLighting};

fn renderer_with_terrain() -> (Renderer<zero_render::HeadlessBackend>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    write_shader(dir.path(), "terrain.shader", TERRAIN_SOURCE);
    let config = RendererConfig {
        shader_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    (Renderer::new(surface_backend(), config).unwrap(), dir)
}

#[test]
fn test_frame_order() {
    let (mut renderer, _dir) = renderer_with_terrain();
    assert!(renderer.library().has_shader("Terrain"));

    let mesh = renderer.create_mesh(&MeshData::quad()).unwrap();
    let material = renderer
        .create_material("Terrain", Some("ground"), None)
        .unwrap();
    let pipeline = material.forward_pass().unwrap().pipeline;
    let offscreen_pass = renderer.post_processor().render_pass();
    let surface_pass = renderer.backend().surface_render_pass();
    renderer.backend_mut().clear_commands();

    let items = [DrawItem {
        mesh: &mesh,
        material: &material,
        model: Mat4::IDENTITY,
    }];
    renderer
        .render_frame(&items, &SceneLighting::default(), None)
        .unwrap();

    let commands = renderer.backend_mut().take_commands();
    let position = |pred: &dyn Fn(&RecordedCommand) -> bool| {
        commands.iter().position(|c| pred(c)).unwrap()
    };
    let offscreen_begin = position(&|c| {
        matches!(c, RecordedCommand::BeginRenderPass { render_pass, .. } if *render_pass == offscreen_pass)
    });
    let scene_draw = position(&|c| matches!(c, RecordedCommand::DrawIndexed { .. }));
    let bind = position(&|c| *c == RecordedCommand::SetRenderPipeline(pipeline));
    let transition = position(&|c| matches!(c, RecordedCommand::TransitionTexture { .. }));
    let composite_begin = position(&|c| {
        matches!(c, RecordedCommand::BeginRenderPass { render_pass, .. } if *render_pass == surface_pass)
    });
    let composite_draw = position(&|c| matches!(c, RecordedCommand::Draw { .. }));

    assert!(offscreen_begin < bind);
    assert!(bind < scene_draw);
    assert!(scene_draw < transition);
    assert!(transition < composite_begin);
    assert!(composite_begin < composite_draw);
    assert_eq!(renderer.backend().frames_presented(), 1);
}

#[test]
fn test_resize_between_frames() {
    let (mut renderer, _dir) = renderer_with_terrain();
    let mesh = renderer.create_mesh(&MeshData::cube()).unwrap();
    let material = renderer.create_material("Standard", None, None).unwrap();
    let items = [DrawItem {
        mesh: &mesh,
        material: &material,
        model: Mat4::IDENTITY,
    }];

    renderer
        .render_frame(&items, &SceneLighting::default(), None)
        .unwrap();
    renderer.resize(1920, 1080);
    renderer
        .render_frame(&items, &SceneLighting::default(), None)
        .unwrap();

    assert_eq!(renderer.post_processor().extent(), (1920, 1080));
    assert_eq!(renderer.frame_count(), 2);
    // Pipelines built before the resize keep drawing
    assert!(renderer
        .backend()
        .commands()
        .contains(&RecordedCommand::SetRenderPipeline(
            material.forward_pass().unwrap().pipeline
        )));
}

#[test]
fn test_pipelines_survive_repeated_resizes() {
    let (mut renderer, _dir) = renderer_with_terrain();
    let mut material = renderer.create_material("Terrain", None, None).unwrap();
    let pipeline = material.forward_pass().unwrap().pipeline;
    let live = renderer.backend().stats().pipelines;

    for (width, height) in [(1024, 768), (640, 360)] {
        renderer.resize(width, height);
        renderer
            .render_frame(&[], &SceneLighting::default(), None)
            .unwrap();
        renderer.rebind_material(&mut material).unwrap();
        let mut extra = renderer.create_material("Terrain", None, None).unwrap();

        assert_eq!(material.forward_pass().unwrap().pipeline, pipeline);
        assert_eq!(extra.forward_pass().unwrap().pipeline, pipeline);
        assert_eq!(renderer.backend().stats().pipelines, live);
        renderer.destroy_material(&mut extra);
    }
}

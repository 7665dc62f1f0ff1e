//! Mesh factory and bone palette integration tests

mod common;

use std::f32::consts::FRAC_PI_2;

use glam::{Mat4, Vec3};
use rstest::rstest;

use common::floats;
use zero_render::backend::{BufferUsage, HeadlessBackend};
use zero_render::resources::{BoneBuffer, MeshData, MeshFactory, Vertex, MAX_BONES};

#[test]
fn test_cube_mesh() {
    let mut backend = HeadlessBackend::new();
    let data = MeshData::cube();
    assert_eq!(data.vertices.len(), 24);
    assert_eq!(data.indices.len(), 36);
    assert_eq!(data.vertices[0].position, [-1.0, -1.0, 1.0]);
    assert_eq!(data.vertices[0].color, [1.0, 0.0, 0.0, 1.0]);
    assert_eq!(&data.indices[..3], &[0, 1, 2]);

    let mesh = MeshFactory::create_cube(&mut backend).unwrap();
    assert!(mesh.is_valid());
    assert_eq!(mesh.vertex_count(), 24);
    assert_eq!(mesh.index_count(), 36);

    let vertex_bytes = backend.read_buffer(mesh.vertex_buffer().handle()).unwrap();
    assert_eq!(vertex_bytes.len(), 24 * std::mem::size_of::<Vertex>());
    assert_eq!(&floats(vertex_bytes)[..7], &[-1.0, -1.0, 1.0, 1.0, 0.0, 0.0, 1.0]);
    assert!(mesh.vertex_buffer().usage().contains(BufferUsage::VERTEX));
    assert!(mesh.index_buffer().usage().contains(BufferUsage::INDEX));
}

#[test]
fn test_empty_mesh_rejected() {
    let mut backend = HeadlessBackend::new();
    assert!(MeshFactory::create_mesh(&mut backend, &[], &[]).is_err());
    assert!(MeshFactory::create_mesh(&mut backend, &MeshData::quad().vertices, &[]).is_err());
    assert_eq!(backend.stats().total(), 0);
}

#[test]
fn test_destroyed_mesh_is_all_zero() {
    let mut backend = HeadlessBackend::new();
    let mut mesh = MeshFactory::create_quad(&mut backend).unwrap();
    MeshFactory::destroy_mesh(&mut backend, &mut mesh);

    assert!(!mesh.is_valid());
    assert!(mesh.vertex_buffer().is_null());
    assert!(mesh.index_buffer().is_null());
    assert!(mesh.layout().is_none());
    assert_eq!(backend.stats().buffers, 0);

    // A second destroy is harmless
    MeshFactory::destroy_mesh(&mut backend, &mut mesh);
}

#[test]
fn test_mesh_creation_failure_releases_buffers() {
    let mut backend = HeadlessBackend::new();
    backend.set_allocation_budget(Some(1));
    assert!(MeshFactory::create_cube(&mut backend).is_err());
    assert_eq!(backend.stats().buffers, 0);
}

#[test]
fn test_bone_update_scenario() {
    let mut backend = HeadlessBackend::new();
    let mut bones = BoneBuffer::create(&mut backend).unwrap();

    let rotation = Mat4::from_rotation_x(FRAC_PI_2);
    let translation = Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0));
    bones.update(&[rotation, translation]);

    assert_eq!(bones.bone(0), Some(rotation));
    assert_eq!(bones.bone(1), Some(translation));
    for index in 2..MAX_BONES {
        assert_eq!(bones.bone(index), Some(Mat4::IDENTITY), "bone {index}");
    }
    assert_eq!(bones.bone(MAX_BONES), None);

    // The mapping is the buffer's memory
    let bytes = backend.read_buffer(bones.handle()).unwrap();
    assert_eq!(floats(bytes)[16 + 12], 1.0);
}

#[rstest]
#[case::empty(0, 0)]
#[case::partial(5, 5)]
#[case::full(128, 128)]
#[case::overflow(129, 128)]
fn test_bone_update_counts(#[case] supplied: usize, #[case] written: usize) {
    let mut backend = HeadlessBackend::new();
    let mut bones = BoneBuffer::create(&mut backend).unwrap();
    let scaled = Mat4::from_scale(Vec3::splat(2.0));

    bones.update(&vec![scaled; supplied]);

    for index in 0..MAX_BONES {
        let expected = if index < written { scaled } else { Mat4::IDENTITY };
        assert_eq!(bones.bone(index), Some(expected), "bone {index}");
    }
}

#[test]
fn test_bone_prefix_keeps_previous_tail() {
    let mut backend = HeadlessBackend::new();
    let mut bones = BoneBuffer::create(&mut backend).unwrap();
    let a = Mat4::from_scale(Vec3::splat(3.0));
    let b = Mat4::from_translation(Vec3::Y);

    bones.update(&[a, a, a]);
    bones.update(&[b]);

    assert_eq!(bones.bone(0), Some(b));
    assert_eq!(bones.bone(1), Some(a));
    assert_eq!(bones.bone(2), Some(a));
    assert_eq!(bones.bone(3), Some(Mat4::IDENTITY));

    bones.destroy(&mut backend);
    assert!(!bones.is_valid());
    assert_eq!(bones.bone(0), None);
}

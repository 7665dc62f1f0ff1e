//! Mesh data structures and generation

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use crate::backend::{
    BackendResult, BufferUsage, GraphicsBackend, IndexFormat, VertexAttribute, VertexBufferLayout,
    VertexFormat, VertexStepMode,
};
use crate::resources::GpuBuffer;

/// Interleaved vertex: position, color, texture coordinate.
///
/// Stored as plain float arrays so the struct stays tightly packed at 36 bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
    pub uv: [f32; 2],
}

const_assert_eq!(std::mem::size_of::<Vertex>(), 36);

impl Vertex {
    pub const fn new(position: [f32; 3], color: [f32; 4], uv: [f32; 2]) -> Self {
        Self {
            position,
            color,
            uv,
        }
    }

    /// Binding 0, locations 0/1/2 at offsets 0/12/28
    pub fn layout() -> VertexBufferLayout {
        VertexBufferLayout {
            binding: 0,
            array_stride: std::mem::size_of::<Self>() as u64,
            step_mode: VertexStepMode::Vertex,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: VertexFormat::Float32x3,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: VertexFormat::Float32x4,
                    offset: 12,
                },
                VertexAttribute {
                    location: 2,
                    format: VertexFormat::Float32x2,
                    offset: 28,
                },
            ],
        }
    }
}

/// CPU-side vertex and index arrays
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u16>,
}

const RED: [f32; 4] = [1.0, 0.0, 0.0, 1.0];
const GREEN: [f32; 4] = [0.0, 1.0, 0.0, 1.0];
const BLUE: [f32; 4] = [0.0, 0.0, 1.0, 1.0];
const YELLOW: [f32; 4] = [1.0, 1.0, 0.0, 1.0];
const MAGENTA: [f32; 4] = [1.0, 0.0, 1.0, 1.0];
const CYAN: [f32; 4] = [0.0, 1.0, 1.0, 1.0];
const WHITE: [f32; 4] = [1.0, 1.0, 1.0, 1.0];

impl MeshData {
    /// Calculate triangle count
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Get vertex data as bytes
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Get index data as bytes
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Cube spanning -1..1 on every axis.
    ///
    /// Faces do not share vertices so each can carry its own color:
    /// +Z red, -Z green, +Y blue, -Y yellow, +X magenta, -X cyan.
    /// Triangles wind counter-clockwise seen from outside.
    pub fn cube() -> Self {
        let vertices = vec![
            // +Z
            Vertex::new([-1.0, -1.0, 1.0], RED, [0.0, 0.0]),
            Vertex::new([1.0, -1.0, 1.0], RED, [1.0, 0.0]),
            Vertex::new([1.0, 1.0, 1.0], RED, [1.0, 1.0]),
            Vertex::new([-1.0, 1.0, 1.0], RED, [0.0, 1.0]),
            // -Z
            Vertex::new([-1.0, -1.0, -1.0], GREEN, [0.0, 0.0]),
            Vertex::new([-1.0, 1.0, -1.0], GREEN, [0.0, 1.0]),
            Vertex::new([1.0, 1.0, -1.0], GREEN, [1.0, 1.0]),
            Vertex::new([1.0, -1.0, -1.0], GREEN, [1.0, 0.0]),
            // +Y
            Vertex::new([-1.0, 1.0, -1.0], BLUE, [0.0, 0.0]),
            Vertex::new([-1.0, 1.0, 1.0], BLUE, [0.0, 1.0]),
            Vertex::new([1.0, 1.0, 1.0], BLUE, [1.0, 1.0]),
            Vertex::new([1.0, 1.0, -1.0], BLUE, [1.0, 0.0]),
            // -Y
            Vertex::new([-1.0, -1.0, -1.0], YELLOW, [0.0, 0.0]),
            Vertex::new([1.0, -1.0, -1.0], YELLOW, [1.0, 0.0]),
            Vertex::new([1.0, -1.0, 1.0], YELLOW, [1.0, 1.0]),
            Vertex::new([-1.0, -1.0, 1.0], YELLOW, [0.0, 1.0]),
            // +X
            Vertex::new([1.0, -1.0, -1.0], MAGENTA, [0.0, 0.0]),
            Vertex::new([1.0, 1.0, -1.0], MAGENTA, [0.0, 1.0]),
            Vertex::new([1.0, 1.0, 1.0], MAGENTA, [1.0, 1.0]),
            Vertex::new([1.0, -1.0, 1.0], MAGENTA, [1.0, 0.0]),
            // -X
            Vertex::new([-1.0, -1.0, -1.0], CYAN, [0.0, 0.0]),
            Vertex::new([-1.0, -1.0, 1.0], CYAN, [1.0, 0.0]),
            Vertex::new([-1.0, 1.0, 1.0], CYAN, [1.0, 1.0]),
            Vertex::new([-1.0, 1.0, -1.0], CYAN, [0.0, 1.0]),
        ];

        // Define indices (two triangles per face)
        let mut indices = Vec::with_capacity(36);
        for face in 0..6u16 {
            let base = face * 4;
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        Self { vertices, indices }
    }

    /// White unit quad in the z=0 plane, counter-clockwise seen from +Z
    pub fn quad() -> Self {
        Self {
            vertices: vec![
                Vertex::new([-1.0, -1.0, 0.0], WHITE, [0.0, 0.0]),
                Vertex::new([1.0, -1.0, 0.0], WHITE, [1.0, 0.0]),
                Vertex::new([1.0, 1.0, 0.0], WHITE, [1.0, 1.0]),
                Vertex::new([-1.0, 1.0, 0.0], WHITE, [0.0, 1.0]),
            ],
            indices: vec![0, 1, 2, 0, 2, 3],
        }
    }
}

/// Vertex and index buffers uploaded to the GPU.
///
/// Either both buffers and the layout are present, or (after
/// [`Mesh::destroy`]) none of them are.
#[derive(Debug, Default)]
pub struct Mesh {
    vertex_buffer: GpuBuffer,
    index_buffer: GpuBuffer,
    layout: Option<VertexBufferLayout>,
    vertex_count: u32,
    index_count: u32,
}

impl Mesh {
    pub fn is_valid(&self) -> bool {
        !self.vertex_buffer.is_null() && !self.index_buffer.is_null() && self.layout.is_some()
    }

    pub fn vertex_buffer(&self) -> &GpuBuffer {
        &self.vertex_buffer
    }

    pub fn index_buffer(&self) -> &GpuBuffer {
        &self.index_buffer
    }

    /// Vertex binding description, `None` once destroyed
    pub fn layout(&self) -> Option<&VertexBufferLayout> {
        self.layout.as_ref()
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn index_format(&self) -> IndexFormat {
        IndexFormat::Uint16
    }

    /// Bind both buffers and issue one indexed draw
    pub fn draw<B: GraphicsBackend>(&self, backend: &mut B, instances: u32) {
        if !self.is_valid() {
            log::warn!("Skipping draw of a destroyed mesh");
            return;
        }
        backend.set_vertex_buffer(0, self.vertex_buffer.handle(), 0);
        backend.set_index_buffer(self.index_buffer.handle(), 0, self.index_format());
        backend.draw_indexed(0..self.index_count, 0, 0..instances);
    }

    /// Release both buffers and the binding description
    pub fn destroy<B: GraphicsBackend>(&mut self, backend: &mut B) {
        self.vertex_buffer.destroy(backend);
        self.index_buffer.destroy(backend);
        self.layout = None;
        self.vertex_count = 0;
        self.index_count = 0;
    }
}

/// Builds GPU meshes from CPU arrays
pub struct MeshFactory;

impl MeshFactory {
    /// Upload `vertices` and 16-bit `indices` into static device buffers
    pub fn create_mesh<B: GraphicsBackend>(
        backend: &mut B,
        vertices: &[Vertex],
        indices: &[u16],
    ) -> BackendResult<Mesh> {
        let mut vertex_buffer = GpuBuffer::create_init(
            backend,
            "mesh vertices",
            BufferUsage::VERTEX | BufferUsage::COPY_DST,
            bytemuck::cast_slice(vertices),
            false,
        )?;

        let index_buffer = match GpuBuffer::create_init(
            backend,
            "mesh indices",
            BufferUsage::INDEX | BufferUsage::COPY_DST,
            bytemuck::cast_slice(indices),
            false,
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                vertex_buffer.destroy(backend);
                return Err(e);
            }
        };

        Ok(Mesh {
            vertex_buffer,
            index_buffer,
            layout: Some(Vertex::layout()),
            vertex_count: vertices.len() as u32,
            index_count: indices.len() as u32,
        })
    }

    pub fn create_from_data<B: GraphicsBackend>(backend: &mut B, data: &MeshData) -> BackendResult<Mesh> {
        Self::create_mesh(backend, &data.vertices, &data.indices)
    }

    pub fn create_cube<B: GraphicsBackend>(backend: &mut B) -> BackendResult<Mesh> {
        Self::create_from_data(backend, &MeshData::cube())
    }

    pub fn create_quad<B: GraphicsBackend>(backend: &mut B) -> BackendResult<Mesh> {
        Self::create_from_data(backend, &MeshData::quad())
    }

    pub fn destroy_mesh<B: GraphicsBackend>(backend: &mut B, mesh: &mut Mesh) {
        mesh.destroy(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use glam::Vec3;

    fn face_normal(data: &MeshData, tri: &[u16]) -> Vec3 {
        let p = |i: u16| Vec3::from_array(data.vertices[i as usize].position);
        (p(tri[1]) - p(tri[0])).cross(p(tri[2]) - p(tri[0]))
    }

    #[test]
    fn test_vertex_layout() {
        let layout = Vertex::layout();
        assert_eq!(layout.binding, 0);
        assert_eq!(layout.array_stride, 36);
        let offsets: Vec<_> = layout.attributes.iter().map(|a| (a.location, a.offset)).collect();
        assert_eq!(offsets, vec![(0, 0), (1, 12), (2, 28)]);
    }

    #[test]
    fn test_cube_geometry() {
        let cube = MeshData::cube();
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.indices.len(), 36);
        assert_eq!(cube.vertices[0].position, [-1.0, -1.0, 1.0]);
        assert_eq!(cube.vertices[0].color, [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(&cube.indices[..3], &[0, 1, 2]);
        assert!(cube
            .vertices
            .iter()
            .flat_map(|v| v.position)
            .all(|c| c.abs() == 1.0));
    }

    #[test]
    fn test_cube_winding_faces_outward() {
        let cube = MeshData::cube();
        for tri in cube.indices.chunks(3) {
            let normal = face_normal(&cube, tri);
            let center = Vec3::from_array(cube.vertices[tri[0] as usize].position)
                + Vec3::from_array(cube.vertices[tri[1] as usize].position)
                + Vec3::from_array(cube.vertices[tri[2] as usize].position);
            assert!(normal.dot(center) > 0.0, "triangle {tri:?} faces inward");
        }
    }

    #[test]
    fn test_cube_face_colors() {
        let cube = MeshData::cube();
        let expected = [RED, GREEN, BLUE, YELLOW, MAGENTA, CYAN];
        for (face, color) in expected.iter().enumerate() {
            for v in &cube.vertices[face * 4..face * 4 + 4] {
                assert_eq!(&v.color, color);
            }
        }
    }

    #[test]
    fn test_quad_faces_positive_z() {
        let quad = MeshData::quad();
        assert_eq!(quad.vertices.len(), 4);
        assert_eq!(quad.indices.len(), 6);
        assert!(quad.vertices.iter().all(|v| v.position[2] == 0.0 && v.color == WHITE));
        for tri in quad.indices.chunks(3) {
            assert!(face_normal(&quad, tri).z > 0.0);
        }
    }

    #[test]
    fn test_create_and_destroy_mesh() {
        let mut backend = HeadlessBackend::new();
        let mut mesh = MeshFactory::create_cube(&mut backend).unwrap();
        assert!(mesh.is_valid());
        assert_eq!(mesh.vertex_buffer().size(), 24 * 36);
        assert_eq!(mesh.index_buffer().size(), 36 * 2);
        assert_eq!(mesh.index_count(), 36);

        MeshFactory::destroy_mesh(&mut backend, &mut mesh);
        assert!(mesh.vertex_buffer().is_null());
        assert!(mesh.index_buffer().is_null());
        assert!(mesh.layout().is_none());
        assert_eq!(backend.stats().buffers, 0);
    }

    #[test]
    fn test_partial_failure_releases_vertex_buffer() {
        let mut backend = HeadlessBackend::new();
        backend.set_allocation_budget(Some(1));
        assert!(MeshFactory::create_quad(&mut backend).is_err());
        assert_eq!(backend.stats().buffers, 0);
    }
}

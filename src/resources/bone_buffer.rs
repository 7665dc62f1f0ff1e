//! Persistently mapped skinning palette

use std::ptr::NonNull;

use glam::Mat4;
use static_assertions::const_assert_eq;

use crate::backend::{BackendResult, BufferHandle, BufferUsage, GraphicsBackend};
use crate::resources::GpuBuffer;

/// Hard cap on bones per palette
pub const MAX_BONES: usize = 128;

/// Size of the bone uniform block in bytes
pub const BONE_BUFFER_SIZE: u64 = (MAX_BONES * std::mem::size_of::<Mat4>()) as u64;

const_assert_eq!(BONE_BUFFER_SIZE, 8192);

/// Uniform buffer holding [`MAX_BONES`] column-major matrices.
///
/// The buffer stays mapped for its whole lifetime. Writes go straight through
/// the mapping, so `update` needs no backend access.
#[derive(Debug, Default)]
pub struct BoneBuffer {
    buffer: GpuBuffer,
    mapped: Option<NonNull<u8>>,
}

impl BoneBuffer {
    /// Allocate the palette and fill it with identity matrices
    pub fn create<B: GraphicsBackend>(backend: &mut B) -> BackendResult<Self> {
        let mut buffer = GpuBuffer::create(
            backend,
            "bone palette",
            BufferUsage::UNIFORM,
            BONE_BUFFER_SIZE,
            true,
        )?;
        let mapped = match buffer.raw_pointer(backend) {
            Ok(ptr) => ptr,
            Err(e) => {
                buffer.destroy(backend);
                return Err(e);
            }
        };

        let mut bones = Self {
            buffer,
            mapped: Some(mapped),
        };
        bones.write(&[Mat4::IDENTITY; MAX_BONES]);
        Ok(bones)
    }

    /// Overwrite the first `bones.len()` entries; the rest keep their values.
    /// Anything past [`MAX_BONES`] is dropped.
    pub fn update(&mut self, bones: &[Mat4]) {
        if bones.len() > MAX_BONES {
            log::warn!(
                "Bone palette truncated from {} to {} entries",
                bones.len(),
                MAX_BONES
            );
        }
        let count = bones.len().min(MAX_BONES);
        self.write(&bones[..count]);
    }

    /// Read one entry back through the mapping
    pub fn bone(&self, index: usize) -> Option<Mat4> {
        let mapped = self.mapped?;
        if index >= MAX_BONES {
            return None;
        }
        let size = std::mem::size_of::<Mat4>();
        // SAFETY: the mapping spans BONE_BUFFER_SIZE bytes while `mapped` is set.
        let bytes = unsafe { std::slice::from_raw_parts(mapped.as_ptr().add(index * size), size) };
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    pub fn handle(&self) -> BufferHandle {
        self.buffer.handle()
    }

    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }

    pub fn is_valid(&self) -> bool {
        self.mapped.is_some() && !self.buffer.is_null()
    }

    pub fn destroy<B: GraphicsBackend>(&mut self, backend: &mut B) {
        self.mapped = None;
        self.buffer.destroy(backend);
    }

    fn write(&mut self, bones: &[Mat4]) {
        let Some(mapped) = self.mapped else {
            log::warn!("Bone palette update on a destroyed buffer");
            return;
        };
        let bytes: &[u8] = bytemuck::cast_slice(bones);
        debug_assert!(bytes.len() as u64 <= BONE_BUFFER_SIZE);
        // SAFETY: the mapping spans BONE_BUFFER_SIZE bytes and callers cap the
        // slice at MAX_BONES matrices.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), mapped.as_ptr(), bytes.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    #[test]
    fn test_create_initializes_identity() {
        let mut backend = HeadlessBackend::new();
        let bones = BoneBuffer::create(&mut backend).unwrap();
        assert_eq!(bones.buffer().size(), 8192);
        assert!((0..MAX_BONES).all(|i| bones.bone(i) == Some(Mat4::IDENTITY)));
        assert_eq!(bones.bone(MAX_BONES), None);
    }

    #[test]
    fn test_update_writes_prefix() {
        let mut backend = HeadlessBackend::new();
        let mut bones = BoneBuffer::create(&mut backend).unwrap();
        let moved = Mat4::from_translation(glam::Vec3::new(0.0, 2.0, 0.0));
        bones.update(&[moved; 3]);
        bones.update(&[Mat4::ZERO]);

        assert_eq!(bones.bone(0), Some(Mat4::ZERO));
        assert_eq!(bones.bone(1), Some(moved));
        assert_eq!(bones.bone(2), Some(moved));
        assert_eq!(bones.bone(3), Some(Mat4::IDENTITY));
    }

    #[test]
    fn test_update_visible_in_device_memory() {
        let mut backend = HeadlessBackend::new();
        let mut bones = BoneBuffer::create(&mut backend).unwrap();
        let scale = Mat4::from_scale(glam::Vec3::splat(2.0));
        bones.update(&[scale]);

        let bytes = backend.read_buffer(bones.handle()).unwrap();
        let first: Mat4 = bytemuck::pod_read_unaligned(&bytes[..64]);
        assert_eq!(first, scale);
    }

    #[test]
    fn test_destroy() {
        let mut backend = HeadlessBackend::new();
        let mut bones = BoneBuffer::create(&mut backend).unwrap();
        bones.destroy(&mut backend);
        assert!(!bones.is_valid());
        assert_eq!(bones.bone(0), None);
        bones.update(&[Mat4::IDENTITY]);
        assert_eq!(backend.stats().buffers, 0);
    }
}

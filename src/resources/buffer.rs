//! Owned GPU buffer

use std::ptr::NonNull;

use crate::backend::{
    BackendError, BackendResult, BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend,
};

/// A device buffer together with the parameters it was created with.
///
/// The handle is either fully valid or [`BufferHandle::NULL`]. Destroying a
/// null buffer is a no-op, so `destroy` can be called unconditionally during
/// teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuBuffer {
    handle: BufferHandle,
    usage: BufferUsage,
    size: u64,
    host_visible: bool,
}

impl Default for GpuBuffer {
    fn default() -> Self {
        Self::null()
    }
}

impl GpuBuffer {
    /// A buffer that owns nothing
    pub const fn null() -> Self {
        Self {
            handle: BufferHandle::NULL,
            usage: BufferUsage::empty(),
            size: 0,
            host_visible: false,
        }
    }

    /// Allocate a buffer. Host-visible buffers stay mapped until destroyed.
    pub fn create<B: GraphicsBackend>(
        backend: &mut B,
        label: &str,
        usage: BufferUsage,
        size: u64,
        host_visible: bool,
    ) -> BackendResult<Self> {
        let handle = backend
            .create_buffer(&BufferDescriptor {
                label: Some(label.to_string()),
                size,
                usage,
                host_visible,
            })
            .inspect_err(|e| log::error!("Failed to allocate buffer '{label}' ({size} bytes): {e}"))?;

        log::debug!("Created buffer '{label}' ({size} bytes, host visible: {host_visible})");

        Ok(Self {
            handle,
            usage,
            size,
            host_visible,
        })
    }

    /// Allocate a buffer and fill it with `data`
    pub fn create_init<B: GraphicsBackend>(
        backend: &mut B,
        label: &str,
        usage: BufferUsage,
        data: &[u8],
        host_visible: bool,
    ) -> BackendResult<Self> {
        let mut buffer = Self::create(backend, label, usage, data.len() as u64, host_visible)?;
        if let Err(e) = buffer.update(backend, 0, data) {
            buffer.destroy(backend);
            return Err(e);
        }
        Ok(buffer)
    }

    /// Copy `bytes` into the buffer at `offset`
    pub fn update<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        offset: u64,
        bytes: &[u8],
    ) -> BackendResult<()> {
        if self.handle.is_null() {
            return Err(BackendError::InvalidHandle("buffer"));
        }
        let len = bytes.len() as u64;
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(BackendError::OutOfBounds {
                offset,
                len,
                size: self.size,
            });
        }
        backend.write_buffer(self.handle, offset, bytes)
    }

    /// Address of the persistent mapping
    pub fn raw_pointer<B: GraphicsBackend>(&self, backend: &B) -> BackendResult<NonNull<u8>> {
        if self.handle.is_null() {
            return Err(BackendError::InvalidHandle("buffer"));
        }
        if !self.host_visible {
            return Err(BackendError::NotHostVisible);
        }
        backend
            .mapped_ptr(self.handle)
            .ok_or(BackendError::NotHostVisible)
    }

    /// Release device memory and mapping, leaving a null buffer
    pub fn destroy<B: GraphicsBackend>(&mut self, backend: &mut B) {
        if self.handle.is_null() {
            return;
        }
        backend.destroy_buffer(self.handle);
        *self = Self::null();
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_host_visible(&self) -> bool {
        self.host_visible
    }

    pub fn is_null(&self) -> bool {
        self.handle.is_null()
    }
}

//! GPU resource management
//!
//! Owned buffers, meshes and their factory, the skinning palette, and the
//! push-constant blocks recorded per draw.

mod bone_buffer;
mod buffer;
mod mesh;
mod push_constants;

pub use bone_buffer::*;
pub use buffer::*;
pub use mesh::*;
pub use push_constants::*;

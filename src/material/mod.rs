//! Materials and the shader library
//!
//! A [`ShaderDef`] is parsed from a text description and registered in a
//! [`ShaderLibrary`]. Materials are instances of a definition with their own
//! property values; the library turns them into pipelines and bind groups.

mod library;
#[allow(clippy::module_inception)]
mod material;
mod parser;
mod property;
mod shader;

pub use library::*;
pub use material::*;
pub use parser::*;
pub use property::*;
pub use shader::*;

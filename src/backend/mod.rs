//! Backend abstraction layer
//!
//! Provides the traits and types that the headless and Vulkan backends implement.

pub mod headless;
pub mod traits;
pub mod types;

// Vulkan backend is only available on native platforms
#[cfg(all(feature = "vulkan-backend", not(target_arch = "wasm32")))]
pub mod vulkan;

pub use headless::{HeadlessBackend, RecordedCommand, ResourceStats};
pub use traits::*;
pub use types::*;

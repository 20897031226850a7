//! Core value types.
//!
//! Small, dependency-light types shared by every other layer.

pub mod color;
pub mod hash;
pub mod identity;

// Re-export core types
pub use color::{Color, InvalidColor};
pub use hash::{CanvasHash, CanvasHasher};
pub use identity::{Identity, InvalidIdentity};

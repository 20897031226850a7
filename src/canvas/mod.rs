//! Canvas State
//!
//! The shared mutable state of the canvas, each piece as a plain owned
//! struct. Locking is the server's job.
//!
//! ## Module Structure
//!
//! - `store`: the cell grid, chunked snapshots
//! - `limiter`: per-identity points and cooldown
//! - `chat`: bounded chat history

pub mod chat;
pub mod limiter;
pub mod store;

// Re-export key types
pub use chat::{ChatConfig, ChatError, ChatLog, ChatMessage};
pub use limiter::{ConsumeOutcome, RateLimitConfig, RateLimiter, RateLimiterState, RegenPolicy};
pub use store::{CanvasConfig, CanvasError, CanvasStore, Cell, CellCoord, ChunkKey, ChunkView};

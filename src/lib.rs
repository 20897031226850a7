//! # Pixel Canvas Server
//!
//! Realtime synchronization server for a shared pixel canvas.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    PIXEL CANVAS SERVER                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Value types                               │
//! │  ├── color.rs    - Validated 24-bit colors                   │
//! │  ├── identity.rs - Identity names                            │
//! │  └── hash.rs     - Canvas digests, snapshot checksums        │
//! │                                                              │
//! │  canvas/         - Shared state (unsynchronized structs)     │
//! │  ├── store.rs    - Chunked cell grid                         │
//! │  ├── limiter.rs  - Points and cooldown per identity          │
//! │  └── chat.rs     - Bounded chat log                          │
//! │                                                              │
//! │  network/        - Connections and fan-out                   │
//! │  ├── server.rs   - WebSocket server, request handling        │
//! │  ├── registry.rs - Connections and outbound queues           │
//! │  ├── protocol.rs - Message types                             │
//! │  └── accounts.rs - Known identities                          │
//! │                                                              │
//! │  persist/        - Durability                                │
//! │  ├── snapshot.rs - Checksummed canvas + chat snapshots       │
//! │  └── journal.rs  - Placement history                         │
//! │                                                              │
//! │  config.rs       - Environment configuration                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency
//!
//! - Each cell is last-write-wins; a cell's broadcasts leave the server
//!   in the order its writes were applied
//! - A joining connection's `init` reflects every write whose broadcast
//!   it does not receive
//! - Rate limits are per identity, shared by all of its connections

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

use std::time::Duration;

pub mod canvas;
pub mod config;
pub mod core;
pub mod network;
pub mod persist;

// Re-export commonly used types
pub use canvas::{CanvasStore, ChatLog, RateLimiter, RegenPolicy};
pub use config::{ConfigError, ServerConfig};
pub use crate::core::{Color, Identity};
pub use network::{MemoryAccounts, SyncServer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default canvas width in cells
pub const DEFAULT_CANVAS_WIDTH: u32 = 5000;

/// Default canvas height in cells
pub const DEFAULT_CANVAS_HEIGHT: u32 = 5000;

/// Default chunk edge length
pub const DEFAULT_CHUNK_SIZE: u32 = 100;

/// Default point balance (and regeneration ceiling)
pub const DEFAULT_MAX_POINTS: u32 = 6;

/// Default cooldown in seconds
pub const DEFAULT_COOLDOWN_SECS: u64 = 20;

/// Default number of chat messages kept
pub const DEFAULT_CHAT_RETENTION: usize = 50;

/// Regeneration check interval
pub const REGEN_TICK: Duration = Duration::from_secs(1);

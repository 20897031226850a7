//! Network Layer
//!
//! WebSocket server for real-time canvas synchronization.
//! State lives in `canvas/`; this layer owns connections and fan-out.

pub mod accounts;
pub mod protocol;
pub mod registry;
pub mod server;

pub use accounts::{refresh_from_file, AccountError, AccountStore, MemoryAccounts};
pub use protocol::{ClientMessage, ErrorCode, InitInfo, PixelChunk, PixelUpdate, PlaceFailure, ServerMessage};
pub use registry::{ConnectionId, ConnectionRegistry, Outbound};
pub use server::{SyncServer, SyncServerError};

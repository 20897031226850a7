//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON object tagged by `type`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::canvas::chat::ChatMessage;
use crate::canvas::store::{Cell, ChunkView};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind this connection to an identity.
    Login {
        /// Login name.
        identity: String,
    },

    /// Ask for the bound identity and its balance.
    Whoami,

    /// Attempt a placement.
    #[serde(alias = "draw", alias = "drawPixel")]
    Place(PlaceRequest),

    /// Post a chat message.
    Chat {
        /// Message body.
        #[serde(alias = "message")]
        text: String,
    },

    /// Ping for latency measurement.
    Ping {
        /// Client clock, echoed back.
        #[serde(default)]
        timestamp: u64,
    },
}

/// Placement request.
///
/// Coordinates are signed so negative input reaches bounds validation
/// instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceRequest {
    /// Column.
    pub x: i64,
    /// Row.
    pub y: i64,
    /// `#RGB` or `#RRGGBB`.
    pub color: String,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Initial state, sent once on join.
    Init(InitInfo),

    /// A cell changed.
    Pixel(PixelUpdate),

    /// New chat message.
    Chat(ChatMessage),

    /// Login accepted.
    LoginSuccess {
        /// Bound identity.
        identity: String,
        /// Current balance.
        points: u32,
    },

    /// Login refused.
    LoginFailed {
        /// Why.
        reason: String,
    },

    /// Reply to `whoami`.
    Whoami {
        /// Bound identity, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identity: Option<String>,
        /// Balance, if identified.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        points: Option<u32>,
        /// Distinct identities online.
        online: usize,
    },

    /// Balance changed (spend or regeneration).
    PointsUpdate {
        /// New balance.
        points: u32,
    },

    /// Balance hit zero.
    CooldownStarted {
        /// Seconds until points return.
        wait: u64,
    },

    /// Placement rejected.
    PlaceFailed(PlaceFailure),

    /// Distinct identities online changed.
    Presence {
        /// Distinct identities online.
        online: usize,
    },

    /// Pong response.
    Pong {
        /// Echoed client clock.
        timestamp: u64,
        /// Server clock, ms since epoch.
        server_time: u64,
    },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown {
        /// Why.
        reason: String,
    },
}

/// Initial state for a joining connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitInfo {
    /// Canvas width.
    pub width: u32,
    /// Canvas height.
    pub height: u32,
    /// Chunk edge length.
    pub chunk_size: u32,
    /// Canvas contents grouped by chunk.
    pub pixels: Vec<PixelChunk>,
    /// Recent chat, oldest first.
    pub chat: Vec<ChatMessage>,
    /// Identity resumed from the connection URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Balance of the resumed identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<u32>,
    /// Distinct identities online.
    pub online: usize,
}

/// One chunk of the canvas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelChunk {
    /// Chunk column.
    pub cx: u32,
    /// Chunk row.
    pub cy: u32,
    /// Placed cells in the chunk.
    pub cells: Vec<PixelUpdate>,
}

impl From<ChunkView<'_>> for PixelChunk {
    fn from(chunk: ChunkView<'_>) -> Self {
        Self {
            cx: chunk.key.cx,
            cy: chunk.key.cy,
            cells: chunk.cells().map(PixelUpdate::from).collect(),
        }
    }
}

/// A cell and its color.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelUpdate {
    /// Column.
    pub x: u32,
    /// Row.
    pub y: u32,
    /// Normalized `#rrggbb`.
    pub color: String,
}

impl From<Cell> for PixelUpdate {
    fn from(cell: Cell) -> Self {
        Self {
            x: cell.x,
            y: cell.y,
            color: cell.color.to_string(),
        }
    }
}

/// Why a placement failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceFailReason {
    /// Connection has no identity.
    NotLoggedIn,
    /// Out of points.
    Cooldown,
    /// Bad coordinates or color.
    Invalid,
}

/// Placement rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceFailure {
    /// Why.
    pub reason: PlaceFailReason,
    /// Seconds to wait, for cooldowns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<u64>,
    /// Validation detail, for invalid requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PlaceFailure {
    /// Placement before login.
    pub fn not_logged_in() -> Self {
        Self {
            reason: PlaceFailReason::NotLoggedIn,
            wait: None,
            detail: None,
        }
    }

    /// Placement during cooldown.
    pub fn cooldown(wait: Duration) -> Self {
        Self {
            reason: PlaceFailReason::Cooldown,
            wait: Some(wait_secs(wait)),
            detail: None,
        }
    }

    /// Malformed placement.
    pub fn invalid(detail: impl Into<String>) -> Self {
        Self {
            reason: PlaceFailReason::Invalid,
            wait: None,
            detail: Some(detail.into()),
        }
    }
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame was not a valid client message.
    InvalidMessage,
    /// Request needs a bound identity.
    NotLoggedIn,
    /// Chat text rejected.
    InvalidChat,
    /// Server at connection capacity.
    ServerOverloaded,
}

/// Round a wait up to whole seconds, so clients never retry early.
pub fn wait_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs();
    if wait.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

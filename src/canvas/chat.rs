//! Chat Log
//!
//! Bounded, append-ordered log of chat messages. Only the newest
//! `retention` messages are kept.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::identity::Identity;

/// Chat configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatConfig {
    /// Messages retained.
    pub retention: usize,
    /// Maximum message length in characters.
    pub max_len: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            retention: crate::DEFAULT_CHAT_RETENTION,
            max_len: 500,
        }
    }
}

/// One chat message. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author, or none for anonymous posts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Identity>,
    /// Trimmed text.
    pub text: String,
    /// Append time, milliseconds since the Unix epoch on the wire.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Chat errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Blank after trimming.
    #[error("message is empty")]
    EmptyMessage,
    /// Above the configured length.
    #[error("message is {len} characters, limit is {max}")]
    TooLong {
        /// Message length.
        len: usize,
        /// Configured limit.
        max: usize,
    },
}

/// The chat log.
#[derive(Debug, Clone)]
pub struct ChatLog {
    config: ChatConfig,
    messages: VecDeque<ChatMessage>,
    appended: u64,
}

impl ChatLog {
    /// Create an empty log.
    pub fn new(config: ChatConfig) -> Self {
        Self {
            config,
            messages: VecDeque::with_capacity(config.retention.min(1024)),
            appended: 0,
        }
    }

    /// Validate and append a message, evicting the oldest on overflow.
    pub fn append(
        &mut self,
        author: Option<Identity>,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<ChatMessage, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let len = text.chars().count();
        if len > self.config.max_len {
            return Err(ChatError::TooLong {
                len,
                max: self.config.max_len,
            });
        }

        let message = ChatMessage {
            author,
            text: text.to_string(),
            timestamp: now,
        };
        self.push(message.clone());
        self.appended += 1;
        Ok(message)
    }

    /// Up to `limit` of the newest messages, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<ChatMessage> {
        let skip = self.messages.len().saturating_sub(limit);
        self.messages.iter().skip(skip).cloned().collect()
    }

    /// Refill from persisted messages (oldest first), keeping the newest.
    pub fn restore(&mut self, messages: impl IntoIterator<Item = ChatMessage>) {
        for message in messages {
            self.push(message);
        }
    }

    /// Messages currently retained.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Total appends since startup; persistence uses it to detect changes.
    pub fn appended(&self) -> u64 {
        self.appended
    }

    /// Retention window.
    pub fn retention(&self) -> usize {
        self.config.retention
    }

    fn push(&mut self, message: ChatMessage) {
        if self.config.retention == 0 {
            return;
        }
        while self.messages.len() >= self.config.retention {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }
}

//! Identities
//!
//! An identity is the durable name a point balance belongs to. It is an
//! opaque string; the server only checks that it is non-blank and short.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum identity length in characters.
pub const MAX_IDENTITY_LEN: usize = 64;

/// A login name or session identifier.
///
/// Ordered so it can key a `BTreeMap`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

/// Identity validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidIdentity {
    /// Blank after trimming.
    #[error("identity is empty")]
    Empty,
    /// Longer than [`MAX_IDENTITY_LEN`].
    #[error("identity exceeds {MAX_IDENTITY_LEN} characters")]
    TooLong,
}

impl Identity {
    /// Validate and wrap a name. Surrounding whitespace is trimmed.
    pub fn new(name: impl AsRef<str>) -> Result<Self, InvalidIdentity> {
        let name = name.as_ref().trim();
        if name.is_empty() {
            return Err(InvalidIdentity::Empty);
        }
        if name.chars().count() > MAX_IDENTITY_LEN {
            return Err(InvalidIdentity::TooLong);
        }
        Ok(Self(name.to_string()))
    }

    /// Borrow the name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identity {
    type Error = InvalidIdentity;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

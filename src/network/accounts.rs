//! Account Store
//!
//! Login checks an identity against an account store owned by an external
//! registration service. The server never creates accounts on login; it
//! only asks whether one exists. Identities the service appends to the
//! accounts file are picked up by [`refresh_from_file`].

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::RwLock;

use thiserror::Error;
use tracing::info;

use crate::core::identity::{Identity, InvalidIdentity};

/// Account store errors.
#[derive(Debug, Error)]
pub enum AccountError {
    /// Accounts file could not be read.
    #[error("failed to read accounts file: {0}")]
    Io(#[from] std::io::Error),
    /// A line in the accounts file is not a valid identity.
    #[error("invalid identity on line {line}: {source}")]
    InvalidLine {
        /// 1-based line number.
        line: usize,
        /// Validation failure.
        source: InvalidIdentity,
    },
    /// The store's lock was poisoned by a panicking writer.
    #[error("account store unavailable")]
    Unavailable,
}

/// Registered identities, as seen by the sync server.
pub trait AccountStore: Send + Sync {
    /// Whether `identity` has an account.
    fn contains(&self, identity: &Identity) -> bool;

    /// Add an account. Returns false if it already existed.
    fn register(&self, identity: Identity) -> Result<bool, AccountError>;

    /// Number of accounts.
    fn len(&self) -> usize;

    /// Whether no accounts exist.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory account set.
#[derive(Debug, Default)]
pub struct MemoryAccounts {
    accounts: RwLock<BTreeSet<Identity>>,
}

impl MemoryAccounts {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `identities`.
    pub fn with_identities(identities: impl IntoIterator<Item = Identity>) -> Self {
        Self {
            accounts: RwLock::new(identities.into_iter().collect()),
        }
    }

    /// Parse newline-separated identities. Blank lines and `#` comments are skipped.
    pub fn parse(contents: &str) -> Result<Self, AccountError> {
        Ok(Self {
            accounts: RwLock::new(parse_identities(contents)?),
        })
    }

    /// Load from a file written by the registration service.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AccountError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let store = Self::parse(&contents)?;
        info!("Loaded {} accounts from {}", store.len(), path.display());
        Ok(store)
    }
}

/// Parse an accounts file body into identities.
pub fn parse_identities(contents: &str) -> Result<BTreeSet<Identity>, AccountError> {
    let mut identities = BTreeSet::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let identity = Identity::new(line).map_err(|source| AccountError::InvalidLine {
            line: index + 1,
            source,
        })?;
        identities.insert(identity);
    }
    Ok(identities)
}

/// Register every identity listed in `path` that `store` does not know yet.
///
/// Additive only; identities missing from the file keep their accounts.
/// Returns how many were added.
pub async fn refresh_from_file(store: &dyn AccountStore, path: &Path) -> Result<usize, AccountError> {
    let contents = tokio::fs::read_to_string(path).await?;
    let mut added = 0;
    for identity in parse_identities(&contents)? {
        if store.register(identity)? {
            added += 1;
        }
    }
    if added > 0 {
        info!("Registered {} new accounts from {}", added, path.display());
    }
    Ok(added)
}

impl AccountStore for MemoryAccounts {
    fn contains(&self, identity: &Identity) -> bool {
        self.accounts
            .read()
            .map(|accounts| accounts.contains(identity))
            .unwrap_or(false)
    }

    fn register(&self, identity: Identity) -> Result<bool, AccountError> {
        let mut accounts = self.accounts.write().map_err(|_| AccountError::Unavailable)?;
        Ok(accounts.insert(identity))
    }

    fn len(&self) -> usize {
        self.accounts.read().map(|accounts| accounts.len()).unwrap_or(0)
    }
}

// =============================================================================
// TESTS
// =============================================================================

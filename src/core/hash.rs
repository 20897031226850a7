//! Canvas Hashing
//!
//! SHA-256 helpers used for:
//! - Canvas digests (logged on startup and shutdown to spot divergence)
//! - Snapshot file checksums

use sha2::{Digest, Sha256};

use super::color::Color;

/// Hash output type (256 bits / 32 bytes)
pub type CanvasHash = [u8; 32];

/// Domain separator for canvas content digests.
pub const CANVAS_DOMAIN: &[u8] = b"PIXEL_CANVAS_CELLS_V1";

/// Domain separator for snapshot payload checksums.
pub const SNAPSHOT_DOMAIN: &[u8] = b"PIXEL_CANVAS_SNAPSHOT_V1";

/// Incremental hasher with a domain separator.
///
/// Callers must feed cells in a deterministic order.
pub struct CanvasHasher {
    hasher: Sha256,
}

impl CanvasHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for canvas contents.
    pub fn for_canvas() -> Self {
        Self::new(CANVAS_DOMAIN)
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Update with a u32 value (little-endian).
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with one cell.
    #[inline]
    pub fn update_cell(&mut self, x: u32, y: u32, color: Color) {
        self.update_u32(x);
        self.update_u32(y);
        self.update_u32(color.rgb());
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> CanvasHash {
        self.hasher.finalize().into()
    }
}

/// Compute hash with domain separator.
pub fn hash_with_domain(domain: &[u8], data: &[u8]) -> CanvasHash {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(data);
    hasher.finalize().into()
}

/// Short hex prefix of a hash, for log lines.
pub fn short_hex(hash: &CanvasHash) -> String {
    hex::encode(&hash[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_separation() {
        let data = b"same payload";
        assert_ne!(
            hash_with_domain(CANVAS_DOMAIN, data),
            hash_with_domain(SNAPSHOT_DOMAIN, data)
        );
    }

    #[test]
    fn test_cell_order_matters() {
        let mut a = CanvasHasher::for_canvas();
        a.update_cell(0, 0, Color::WHITE);
        a.update_cell(1, 0, Color::BLACK);

        let mut b = CanvasHasher::for_canvas();
        b.update_cell(1, 0, Color::BLACK);
        b.update_cell(0, 0, Color::WHITE);

        assert_ne!(a.finalize(), b.finalize());
    }

    #[test]
    fn test_short_hex() {
        let hash = [0xAB; 32];
        assert_eq!(short_hex(&hash), "abababababababab");
    }
}

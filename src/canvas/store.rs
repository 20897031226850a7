//! Canvas Store
//!
//! Authoritative grid of placed cells. Cells live in fixed-size square
//! chunks so a joining client can be sent a bounded number of groups
//! instead of one message per cell.
//!
//! The store itself is not synchronized; the server wraps it in a lock and
//! every method here runs under that lock. Uses BTreeMap throughout so
//! snapshots and digests iterate in a stable order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::color::{Color, InvalidColor};
use crate::core::hash::{CanvasHash, CanvasHasher};

/// Canvas dimensions and chunking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanvasConfig {
    /// Grid width in cells.
    pub width: u32,
    /// Grid height in cells.
    pub height: u32,
    /// Chunk edge length in cells.
    pub chunk_size: u32,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            width: crate::DEFAULT_CANVAS_WIDTH,
            height: crate::DEFAULT_CANVAS_HEIGHT,
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Canvas errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanvasError {
    /// Coordinate outside `0..width` x `0..height`.
    #[error("cell ({x}, {y}) is outside the {width}x{height} canvas")]
    OutOfBounds {
        /// Requested x.
        x: i64,
        /// Requested y.
        y: i64,
        /// Canvas width.
        width: u32,
        /// Canvas height.
        height: u32,
    },

    /// Color string failed validation.
    #[error(transparent)]
    InvalidColor(#[from] InvalidColor),
}

/// A validated in-bounds coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellCoord {
    /// Column.
    pub x: u32,
    /// Row.
    pub y: u32,
}

/// One placed cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    /// Column.
    pub x: u32,
    /// Row.
    pub y: u32,
    /// Current color.
    pub color: Color,
}

/// Chunk position in chunk units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkKey {
    /// Chunk row.
    pub cy: u32,
    /// Chunk column.
    pub cx: u32,
}

/// Cells of one chunk, keyed by row-major offset inside the chunk.
#[derive(Debug, Default, Clone)]
struct Chunk {
    cells: BTreeMap<u64, Color>,
}

/// Borrowed view of one non-empty chunk.
#[derive(Debug, Clone, Copy)]
pub struct ChunkView<'a> {
    /// Chunk position.
    pub key: ChunkKey,
    chunk_size: u32,
    cells: &'a BTreeMap<u64, Color>,
}

impl<'a> ChunkView<'a> {
    /// Number of placed cells in the chunk.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the chunk has no cells.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Iterate cells with absolute coordinates, row-major.
    pub fn cells(&self) -> impl Iterator<Item = Cell> + 'a {
        let size = u64::from(self.chunk_size);
        let origin_x = self.key.cx * self.chunk_size;
        let origin_y = self.key.cy * self.chunk_size;
        let cells: &'a BTreeMap<u64, Color> = self.cells;
        // Both remainders are below `chunk_size`, so they fit back in u32.
        cells.iter().map(move |(offset, color)| Cell {
            x: origin_x + (offset % size) as u32,
            y: origin_y + (offset / size) as u32,
            color: *color,
        })
    }
}

/// The canvas.
#[derive(Debug, Clone)]
pub struct CanvasStore {
    config: CanvasConfig,
    chunks: BTreeMap<ChunkKey, Chunk>,
    cell_count: usize,
    revision: u64,
}

impl CanvasStore {
    /// Create an empty canvas. A zero chunk size is treated as 1.
    pub fn new(mut config: CanvasConfig) -> Self {
        config.chunk_size = config.chunk_size.max(1);
        Self {
            config,
            chunks: BTreeMap::new(),
            cell_count: 0,
            revision: 0,
        }
    }

    /// Canvas configuration.
    pub fn config(&self) -> CanvasConfig {
        self.config
    }

    /// Check a coordinate against the canvas bounds.
    pub fn check_bounds(&self, x: i64, y: i64) -> Result<CellCoord, CanvasError> {
        let in_range = |v: i64, limit: u32| v >= 0 && v < i64::from(limit);
        if in_range(x, self.config.width) && in_range(y, self.config.height) {
            Ok(CellCoord { x: x as u32, y: y as u32 })
        } else {
            Err(CanvasError::OutOfBounds {
                x,
                y,
                width: self.config.width,
                height: self.config.height,
            })
        }
    }

    /// Validate a placement without applying it.
    pub fn validate(&self, x: i64, y: i64, color: &str) -> Result<(CellCoord, Color), CanvasError> {
        let coord = self.check_bounds(x, y)?;
        let color = Color::parse(color)?;
        Ok((coord, color))
    }

    /// Write a pre-validated cell. Returns the previous color.
    pub fn apply(&mut self, coord: CellCoord, color: Color) -> Option<Color> {
        let (key, offset) = self.locate(coord);
        let previous = self.chunks.entry(key).or_default().cells.insert(offset, color);
        if previous.is_none() {
            self.cell_count += 1;
        }
        self.revision += 1;
        previous
    }

    /// Validate and write a cell. Returns the previous color.
    pub fn set(&mut self, x: i64, y: i64, color: &str) -> Result<Option<Color>, CanvasError> {
        let (coord, color) = self.validate(x, y, color)?;
        Ok(self.apply(coord, color))
    }

    /// Read one cell. Out-of-bounds reads are simply absent.
    pub fn get(&self, x: i64, y: i64) -> Option<Color> {
        let coord = self.check_bounds(x, y).ok()?;
        let (key, offset) = self.locate(coord);
        self.chunks.get(&key)?.cells.get(&offset).copied()
    }

    /// Lazily iterate every placed cell, chunk by chunk.
    ///
    /// Each call starts over; the borrow pins the store to one revision.
    pub fn snapshot(&self) -> impl Iterator<Item = Cell> + '_ {
        self.chunks().flat_map(|chunk| chunk.cells())
    }

    /// Iterate non-empty chunks in (row, column) order.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkView<'_>> + '_ {
        let chunk_size = self.config.chunk_size;
        self.chunks
            .iter()
            .filter(|(_, chunk)| !chunk.cells.is_empty())
            .map(move |(key, chunk)| ChunkView {
                key: *key,
                chunk_size,
                cells: &chunk.cells,
            })
    }

    /// Number of placed cells.
    pub fn len(&self) -> usize {
        self.cell_count
    }

    /// Whether nothing has been placed.
    pub fn is_empty(&self) -> bool {
        self.cell_count == 0
    }

    /// Write counter; bumps on every applied cell.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Digest of the current contents.
    pub fn digest(&self) -> CanvasHash {
        let mut hasher = CanvasHasher::for_canvas();
        hasher.update_u32(self.config.width);
        hasher.update_u32(self.config.height);
        hasher.update_u64(self.cell_count as u64);
        for cell in self.snapshot() {
            hasher.update_cell(cell.x, cell.y, cell.color);
        }
        hasher.finalize()
    }

    /// Load cells from a persisted snapshot.
    ///
    /// Cells outside the current bounds are skipped and counted.
    /// The revision is set to `revision` so dirty-tracking resumes from it.
    pub fn restore(&mut self, cells: impl IntoIterator<Item = Cell>, revision: u64) -> usize {
        let mut skipped = 0;
        for cell in cells {
            match self.check_bounds(i64::from(cell.x), i64::from(cell.y)) {
                Ok(coord) => {
                    self.apply(coord, cell.color);
                }
                Err(_) => skipped += 1,
            }
        }
        self.revision = revision.max(self.revision);
        skipped
    }

    fn locate(&self, coord: CellCoord) -> (ChunkKey, u64) {
        let size = self.config.chunk_size;
        let key = ChunkKey {
            cx: coord.x / size,
            cy: coord.y / size,
        };
        let offset = u64::from(coord.y % size) * u64::from(size) + u64::from(coord.x % size);
        (key, offset)
    }
}

// arch.rs — Fabric geometry and grid coordinates
//
// Fixed dimensions of the spatial fabric: column count, selectable depth,
// boundary-register lanes per cell, local-memory size, and the (row, col)
// coordinate type shared by every pass.
//
// Preconditions: none (types and constants only).
// Postconditions: none.
// Failure modes: `GridDepth::from_rows` rejects unsupported depths.
// Side effects: none.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Constants ───────────────────────────────────────────────────────────────

/// Cells per row.
pub const GRID_WIDTH: usize = 4;
/// Deepest supported grid.
pub const MAX_DEPTH: usize = 64;
/// Boundary-register / transfer-register lanes per cell.
pub const UNIT_WIDTH: usize = 4;
/// Replicas chained behind one lane's bus.
pub const MAX_REPLICAS: usize = 4;
/// Independent lanes.
pub const MAX_LANES: usize = 8;
/// Local memory per cell, bytes.
pub const LMM_BYTES: u32 = 524_288;
/// Width of the op3 immediate field.
pub const E3_IMM_BITS: u32 = 6;
/// Widest mapdist encodable in the configuration word.
pub const MAX_MAPDIST: u8 = 63;

// ── Grid depth ──────────────────────────────────────────────────────────────

/// Number of rows the fabric is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum GridDepth {
    D8,
    D16,
    D32,
    D64,
}

impl GridDepth {
    pub const ALL: [GridDepth; 4] = [GridDepth::D8, GridDepth::D16, GridDepth::D32, GridDepth::D64];

    pub fn rows(self) -> usize {
        match self {
            GridDepth::D8 => 8,
            GridDepth::D16 => 16,
            GridDepth::D32 => 32,
            GridDepth::D64 => 64,
        }
    }

    pub fn from_rows(rows: u32) -> Option<Self> {
        match rows {
            8 => Some(GridDepth::D8),
            16 => Some(GridDepth::D16),
            32 => Some(GridDepth::D32),
            64 => Some(GridDepth::D64),
            _ => None,
        }
    }

    /// log2 of the row count, as reported in the status register.
    pub fn log2(self) -> u32 {
        self.rows().trailing_zeros()
    }

    /// Row that precedes `row` on the ring (row 0 reads the last row).
    pub fn prev_row(self, row: u8) -> u8 {
        let rows = self.rows() as u8;
        (row + rows - 1) % rows
    }
}

impl Default for GridDepth {
    fn default() -> Self {
        GridDepth::D64
    }
}

impl TryFrom<u32> for GridDepth {
    type Error = String;

    fn try_from(rows: u32) -> Result<Self, Self::Error> {
        GridDepth::from_rows(rows)
            .ok_or_else(|| format!("unsupported grid depth {} (expected 8, 16, 32 or 64)", rows))
    }
}

impl From<GridDepth> for u32 {
    fn from(d: GridDepth) -> u32 {
        d.rows() as u32
    }
}

impl fmt::Display for GridDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.rows())
    }
}

// ── Location ────────────────────────────────────────────────────────────────

/// A grid cell coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Loc {
    pub row: u8,
    pub col: u8,
}

impl Loc {
    pub fn new(row: u8, col: u8) -> Self {
        Loc { row, col }
    }

    pub fn in_grid(self, depth: GridDepth) -> bool {
        (self.row as usize) < depth.rows() && (self.col as usize) < GRID_WIDTH
    }
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.row, self.col)
    }
}

/// Boundary-register select code: `col * 4 + lane`.
pub fn br_select(col: u8, lane: u8) -> u8 {
    col * UNIT_WIDTH as u8 + lane
}

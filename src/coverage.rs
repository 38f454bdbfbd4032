//! Rectangular tile coverage declarations
//!
//! A [`TileExtents`] bounds which rows/columns may hold tiles at one level;
//! an [`InsetCoverage`] stacks those bounds over a contiguous level range.
//! Index and presence files are pre-sized from these declarations, so they
//! are validated up front rather than at every tile insert.

use crate::error::{FfError, Result};
use crate::types::TileAddr;

/// Half-open row/column bounds `[begin_row, end_row) x [begin_col, end_col)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileExtents {
    pub begin_row: u32,
    pub end_row: u32,
    pub begin_col: u32,
    pub end_col: u32,
}

impl TileExtents {
    pub fn new(begin_row: u32, end_row: u32, begin_col: u32, end_col: u32) -> Self {
        Self {
            begin_row,
            end_row,
            begin_col,
            end_col,
        }
    }

    pub fn num_rows(&self) -> u32 {
        self.end_row.saturating_sub(self.begin_row)
    }

    pub fn num_cols(&self) -> u32 {
        self.end_col.saturating_sub(self.begin_col)
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0 || self.num_cols() == 0
    }

    /// Number of cells covered, wide enough for full level-24 extents.
    pub fn num_tiles(&self) -> u64 {
        u64::from(self.num_rows()) * u64::from(self.num_cols())
    }

    pub fn contains(&self, row: u32, col: u32) -> bool {
        row >= self.begin_row && row < self.end_row && col >= self.begin_col && col < self.end_col
    }

    pub fn intersection(a: &Self, b: &Self) -> Self {
        let out = Self {
            begin_row: a.begin_row.max(b.begin_row),
            end_row: a.end_row.min(b.end_row),
            begin_col: a.begin_col.max(b.begin_col),
            end_col: a.end_col.min(b.end_col),
        };
        if out.end_row <= out.begin_row || out.end_col <= out.begin_col {
            Self::default()
        } else {
            out
        }
    }
}

/// Tile coverage over a single level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelCoverage {
    pub level: u32,
    pub extents: TileExtents,
}

impl LevelCoverage {
    pub fn new(level: u32, extents: TileExtents) -> Self {
        Self { level, extents }
    }

    /// Coverage of a single tile.
    pub fn of_tile(addr: &TileAddr) -> Self {
        Self {
            level: addr.level,
            extents: TileExtents::new(addr.row, addr.row + 1, addr.col, addr.col + 1),
        }
    }

    /// Same coverage expressed `levels` levels finer.
    pub fn magnified_by(&self, levels: u32) -> Self {
        Self {
            level: self.level + levels,
            extents: TileExtents::new(
                self.extents.begin_row << levels,
                self.extents.end_row << levels,
                self.extents.begin_col << levels,
                self.extents.end_col << levels,
            ),
        }
    }

    /// Same coverage expressed `levels` levels coarser. Partially covered
    /// coarse tiles round outward.
    pub fn minified_by(&self, levels: u32) -> Self {
        let pad = (1u32 << levels) - 1;
        Self {
            level: self.level - levels,
            extents: TileExtents::new(
                self.extents.begin_row >> levels,
                (self.extents.end_row + pad) >> levels,
                self.extents.begin_col >> levels,
                (self.extents.end_col + pad) >> levels,
            ),
        }
    }

    pub fn magnified_to_level(&self, target: u32) -> Self {
        debug_assert!(target >= self.level);
        self.magnified_by(target - self.level)
    }
}

/// Per-level tile bounds across a contiguous range of levels
/// `[begin_level, end_level)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsetCoverage {
    begin_level: u32,
    end_level: u32,
    extents: Vec<TileExtents>,
}

impl InsetCoverage {
    /// Build a coverage from per-level extents, one entry per level starting
    /// at `begin_level`. Every level's extents must be non-empty and fit
    /// inside that level's `2^level` grid.
    pub fn new(begin_level: u32, extents: Vec<TileExtents>) -> Result<Self> {
        if extents.is_empty() {
            return Err(FfError::InvalidCoverage("no levels declared".into()));
        }
        let end_level = begin_level + extents.len() as u32;
        for (i, ext) in extents.iter().enumerate() {
            let level = begin_level + i as u32;
            if ext.is_empty() {
                return Err(FfError::InvalidCoverage(format!(
                    "empty extents at level {level}"
                )));
            }
            let dim = 1u64.checked_shl(level).unwrap_or(u64::MAX);
            if u64::from(ext.end_row) > dim || u64::from(ext.end_col) > dim {
                return Err(FfError::InvalidCoverage(format!(
                    "extents exceed the {dim}x{dim} grid at level {level}"
                )));
            }
        }
        Ok(Self {
            begin_level,
            end_level,
            extents,
        })
    }

    pub fn begin_level(&self) -> u32 {
        self.begin_level
    }

    pub fn end_level(&self) -> u32 {
        self.end_level
    }

    pub fn num_levels(&self) -> u32 {
        self.end_level - self.begin_level
    }

    pub fn contains_level(&self, level: u32) -> bool {
        level >= self.begin_level && level < self.end_level
    }

    pub fn level_extents(&self, level: u32) -> Option<&TileExtents> {
        if self.contains_level(level) {
            self.extents.get((level - self.begin_level) as usize)
        } else {
            None
        }
    }

    pub fn level_coverage(&self, level: u32) -> Option<LevelCoverage> {
        self.level_extents(level)
            .map(|ext| LevelCoverage::new(level, *ext))
    }

    /// Iterate the covered levels in ascending order.
    pub fn levels(&self) -> impl Iterator<Item = LevelCoverage> + '_ {
        self.extents
            .iter()
            .enumerate()
            .map(|(i, ext)| LevelCoverage::new(self.begin_level + i as u32, *ext))
    }

    pub fn contains(&self, addr: &TileAddr) -> bool {
        self.level_extents(addr.level)
            .is_some_and(|ext| ext.contains(addr.row, addr.col))
    }
}

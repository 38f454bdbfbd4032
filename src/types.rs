//! Common types used throughout the flat-file tile store

use std::fmt;

use crate::error::{FfError, Result};

/// Deepest quadtree level the store will accept.
///
/// The historical format never stored tiles deeper than this, and the
/// scanner uses it to tell a plausible header from garbage. Callers with
/// unusual tilespaces can override it where validation takes a level limit
/// (see [`crate::scanner::FlatFileScanner::max_level`]).
pub const MAX_FUSION_LEVEL: u32 = 24;

/// Number of level slots in per-level lookup tables.
pub const NUM_FUSION_LEVELS: usize = (MAX_FUSION_LEVEL + 1) as usize;

/// Address of one quadtree tile: level plus row/column within that level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileAddr {
    pub level: u32,
    pub row: u32,
    pub col: u32,
}

impl TileAddr {
    pub fn new(level: u32, row: u32, col: u32) -> Self {
        Self { level, row, col }
    }

    /// Number of tiles along one axis at this address's level, saturated
    /// for levels past the u64 shift range.
    pub fn level_dim(&self) -> u64 {
        1u64.checked_shl(self.level).unwrap_or(u64::MAX)
    }

    /// True when row and col both fit inside the level's `2^level` grid
    /// and the level itself is within `max_level`.
    pub fn is_valid(&self, max_level: u32) -> bool {
        self.level <= max_level
            && u64::from(self.row) < self.level_dim()
            && u64::from(self.col) < self.level_dim()
    }

    /// Same tile address expressed `levels` levels coarser.
    pub fn minified_by(&self, levels: u32) -> Self {
        Self {
            level: self.level - levels,
            row: self.row >> levels,
            col: self.col >> levels,
        }
    }

    pub fn minified_to_level(&self, target: u32) -> Self {
        debug_assert!(target <= self.level);
        self.minified_by(self.level - target)
    }
}

impl fmt::Display for TileAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(lev {} row {} col {})", self.level, self.row, self.col)
    }
}

/// What kind of tiles a flat file holds.
///
/// The discriminants are stored in index headers; don't renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FfType {
    Raster = 0,
    Tmesh = 1,
    Vector = 2,
}

impl FfType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Raster),
            1 => Ok(Self::Tmesh),
            2 => Ok(Self::Vector),
            other => Err(FfError::InvalidCoverage(format!(
                "unknown flat-file type {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_validation() {
        assert!(TileAddr::new(0, 0, 0).is_valid(MAX_FUSION_LEVEL));
        assert!(TileAddr::new(5, 31, 31).is_valid(MAX_FUSION_LEVEL));
        assert!(!TileAddr::new(5, 32, 0).is_valid(MAX_FUSION_LEVEL));
        assert!(!TileAddr::new(5, 0, 32).is_valid(MAX_FUSION_LEVEL));
        assert!(!TileAddr::new(25, 0, 0).is_valid(MAX_FUSION_LEVEL));
        assert!(TileAddr::new(24, (1 << 24) - 1, 0).is_valid(MAX_FUSION_LEVEL));
        // levels past the u64 shift range saturate rather than panic
        assert!(TileAddr::new(70, u32::MAX, u32::MAX).is_valid(u32::MAX));
    }

    #[test]
    fn addr_minify() {
        let addr = TileAddr::new(6, 45, 33);
        assert_eq!(addr.minified_by(2), TileAddr::new(4, 11, 8));
        assert_eq!(addr.minified_to_level(6), addr);
    }

    #[test]
    fn type_round_trip() {
        for t in [FfType::Raster, FfType::Tmesh, FfType::Vector] {
            assert_eq!(FfType::from_u8(t as u8).unwrap(), t);
        }
        assert!(FfType::from_u8(3).is_err());
    }
}

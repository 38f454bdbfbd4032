//! Random-access index reader
//!
//! Opens a finished index read-only, validates its header and level
//! directory up front, and then answers point lookups straight out of the
//! mapping. Any number of readers can share one index file.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use memmap2::{Mmap, MmapOptions};
use tracing::debug;

use crate::coverage::{InsetCoverage, TileExtents};
use crate::error::{FfError, Result};
use crate::index::storage::{
    HEADER_SIZE, Header, INDEX_FORMAT_VERSION, LEVEL_RECORD_SIZE, LevelRecord, TILE_RECORD_SIZE,
    TileRecord, TYPE_DATA_SIZE,
};
use crate::types::{FfType, MAX_FUSION_LEVEL, NUM_FUSION_LEVELS, TileAddr};
use crate::util::wait_if_too_new;

/// One validated level of the index.
struct LevelInfo {
    level: u32,
    extents: TileExtents,
    tile_records_offset: u32,
}

impl LevelInfo {
    fn tile_offset(&self, row: u32, col: u32) -> usize {
        let idx = (row - self.extents.begin_row) as usize * self.extents.num_cols() as usize
            + (col - self.extents.begin_col) as usize;
        self.tile_records_offset as usize + idx * TILE_RECORD_SIZE
    }
}

/// Read-only view of a `pack.idx` file.
pub struct IndexReader {
    path: PathBuf,
    map: Mmap,
    ff_type: FfType,
    total_ff_size: u64,
    total_index_size: u32,
    total_stored_tiles: u32,
    type_data: [u8; TYPE_DATA_SIZE],
    levels: Vec<LevelInfo>,
    /// Level number -> index into `levels`.
    level_slots: [Option<usize>; NUM_FUSION_LEVELS],
}

impl IndexReader {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_visibility_delay(path, Duration::ZERO)
    }

    /// Open, waiting out `delay` first if the file looks freshly written
    /// (see [`crate::util::wait_if_too_new`]).
    pub fn open_with_visibility_delay(path: &Path, delay: Duration) -> Result<Self> {
        wait_if_too_new(path, delay)?;

        let mut file = File::open(path).map_err(|e| FfError::io(path, e))?;
        let file_size = file.metadata().map_err(|e| FfError::io(path, e))?.len();

        let mut hdr_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut hdr_buf)
            .map_err(|e| FfError::io(path, e))?;
        if !Header::has_magic(&hdr_buf) {
            return Err(FfError::InvalidIndexFormat {
                path: path.to_path_buf(),
                detail: "bad magic".into(),
            });
        }
        let header = Header::decode(&hdr_buf);
        if header.index_format_version != INDEX_FORMAT_VERSION {
            return Err(FfError::UnsupportedIndexVersion {
                path: path.to_path_buf(),
                version: header.index_format_version,
            });
        }
        if u64::from(header.total_index_size) > file_size {
            return Err(FfError::InvalidIndexFormat {
                path: path.to_path_buf(),
                detail: format!(
                    "header claims {} bytes, file has {}",
                    header.total_index_size, file_size
                ),
            });
        }
        let ff_type = FfType::from_u8(header.ff_type).map_err(|_| FfError::InvalidIndexFormat {
            path: path.to_path_buf(),
            detail: format!("unknown tile type {}", header.ff_type),
        })?;

        let map = unsafe {
            MmapOptions::new()
                .len(header.total_index_size as usize)
                .map(&file)
        }
        .map_err(|e| FfError::io(path, e))?;

        let directory_end = HEADER_SIZE + usize::from(header.num_levels) * LEVEL_RECORD_SIZE;
        if directory_end > header.total_index_size as usize {
            return Err(FfError::InvalidIndexFormat {
                path: path.to_path_buf(),
                detail: format!("{} level records don't fit", header.num_levels),
            });
        }

        let mut levels = Vec::with_capacity(usize::from(header.num_levels));
        let mut level_slots = [None; NUM_FUSION_LEVELS];
        for i in 0..usize::from(header.num_levels) {
            let off = HEADER_SIZE + i * LEVEL_RECORD_SIZE;
            let mut buf = [0u8; LEVEL_RECORD_SIZE];
            buf.copy_from_slice(&map[off..off + LEVEL_RECORD_SIZE]);
            let rec = LevelRecord::decode(&buf);

            // sanity-check against corruption before trusting any offsets
            if u32::from(rec.level_num) > MAX_FUSION_LEVEL {
                return Err(FfError::InvalidIndexFormat {
                    path: path.to_path_buf(),
                    detail: format!("level number {} out of range", rec.level_num),
                });
            }
            let extents = rec.extents().ok_or_else(|| FfError::InvalidIndexFormat {
                path: path.to_path_buf(),
                detail: format!("level {} extents overflow", rec.level_num),
            })?;
            let stored_end = u64::from(rec.tile_records_offset)
                + u64::from(rec.total_stored_tiles) * TILE_RECORD_SIZE as u64;
            let array_end = u64::from(rec.tile_records_offset)
                + u64::from(rec.num_rows) * u64::from(rec.num_cols) * TILE_RECORD_SIZE as u64;
            if stored_end > u64::from(header.total_index_size)
                || array_end > u64::from(header.total_index_size)
            {
                return Err(FfError::InvalidIndexFormat {
                    path: path.to_path_buf(),
                    detail: format!(
                        "level {} tile records exceed index size {}",
                        rec.level_num, header.total_index_size
                    ),
                });
            }

            level_slots[usize::from(rec.level_num)] = Some(levels.len());
            levels.push(LevelInfo {
                level: u32::from(rec.level_num),
                extents,
                tile_records_offset: rec.tile_records_offset,
            });
        }

        debug!(
            "opened index {:?}: type={:?}, {} tiles, {} levels",
            path, ff_type, header.total_stored_tiles, header.num_levels
        );

        Ok(Self {
            path: path.to_path_buf(),
            map,
            ff_type,
            total_ff_size: header.total_ff_size,
            total_index_size: header.total_index_size,
            total_stored_tiles: header.total_stored_tiles,
            type_data: header.type_data,
            levels,
            level_slots,
        })
    }

    /// Look up a tile, returning the payload's logical flat-file offset
    /// and length. `None` for unindexed levels, addresses outside a
    /// level's extents, and never-stored tiles.
    pub fn find_tile(&self, addr: &TileAddr) -> Option<(u64, u32)> {
        let slot = *self.level_slots.get(addr.level as usize)?;
        let info = &self.levels[slot?];
        if !info.extents.contains(addr.row, addr.col) {
            return None;
        }
        let off = info.tile_offset(addr.row, addr.col);
        let mut buf = [0u8; TILE_RECORD_SIZE];
        buf.copy_from_slice(&self.map[off..off + TILE_RECORD_SIZE]);
        let rec = TileRecord::decode(&buf);
        if rec.data_len == 0 {
            None
        } else {
            Some((rec.data_offset, rec.data_len))
        }
    }

    /// True when the tile has a stored record.
    pub fn has_tile(&self, addr: &TileAddr) -> bool {
        self.find_tile(addr).is_some()
    }

    /// Reconstruct the coverage this index was built over. The levels in
    /// the file must be contiguous and ascending.
    pub fn populate_coverage(&self) -> Result<InsetCoverage> {
        let first = self.levels.first().ok_or_else(|| FfError::InvalidIndexFormat {
            path: self.path.clone(),
            detail: "index has no levels".into(),
        })?;
        let mut extents = Vec::with_capacity(self.levels.len());
        for (i, info) in self.levels.iter().enumerate() {
            if info.level != first.level + i as u32 {
                return Err(FfError::MisorderedLevels {
                    path: self.path.clone(),
                });
            }
            extents.push(info.extents);
        }
        InsetCoverage::new(first.level, extents)
    }

    pub fn ff_type(&self) -> FfType {
        self.ff_type
    }

    pub fn type_data(&self) -> &[u8; TYPE_DATA_SIZE] {
        &self.type_data
    }

    pub fn total_ff_size(&self) -> u64 {
        self.total_ff_size
    }

    pub fn total_index_size(&self) -> u32 {
        self.total_index_size
    }

    pub fn total_stored_tiles(&self) -> u32 {
        self.total_stored_tiles
    }
}

//! Random-access index writer
//!
//! The writer pre-sizes the whole index file from the declared coverage,
//! zero-fills it, and maps it read-write. Tiles can then be added in any
//! order; each add writes its TileRecord straight into the mapped array.
//! The header and level directory are only written at close, so a crash
//! mid-build leaves a file with a zeroed header that readers reject.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, error};

use crate::coverage::{InsetCoverage, LevelCoverage};
use crate::error::{FfError, Result};
use crate::index::storage::{
    HEADER_SIZE, Header, INDEX_FORMAT_VERSION, LEVEL_RECORD_SIZE, LevelRecord, TILE_RECORD_SIZE,
    TileRecord, TYPE_DATA_SIZE,
};
use crate::types::{FfType, MAX_FUSION_LEVEL, NUM_FUSION_LEVELS, TileAddr};

/// Book-keeping for one indexed level.
struct LevelInfo {
    coverage: LevelCoverage,
    /// Byte offset of this level's TileRecord array within the index file.
    tile_records_offset: u32,
    total_stored_tiles: u32,
}

impl LevelInfo {
    /// Byte offset of the TileRecord for `(row, col)`.
    fn tile_offset(&self, row: u32, col: u32) -> usize {
        let ext = &self.coverage.extents;
        let idx = (row - ext.begin_row) as usize * ext.num_cols() as usize
            + (col - ext.begin_col) as usize;
        self.tile_records_offset as usize + idx * TILE_RECORD_SIZE
    }
}

/// Writer for the `pack.idx` random-access index.
pub struct IndexWriter {
    path: PathBuf,
    ff_type: FfType,
    map: MmapMut,
    levels: Vec<LevelInfo>,
    /// Level number -> index into `levels`.
    level_slots: [Option<usize>; NUM_FUSION_LEVELS],
    total_index_size: u32,
    total_ff_size: u64,
    total_stored_tiles: u32,
    type_data: [u8; TYPE_DATA_SIZE],
    finalized: bool,
}

impl IndexWriter {
    /// Create (or truncate) the index file for `coverage`, sized exactly
    /// and zero-filled.
    pub fn new(
        ff_type: FfType,
        path: &Path,
        coverage: &InsetCoverage,
        type_data: Option<[u8; TYPE_DATA_SIZE]>,
    ) -> Result<Self> {
        if coverage.end_level() > MAX_FUSION_LEVEL + 1 {
            return Err(FfError::InvalidCoverage(format!(
                "coverage reaches level {}, deeper than {}",
                coverage.end_level() - 1,
                MAX_FUSION_LEVEL
            )));
        }

        // exact file size: header + level directory + tile arrays
        let mut total: u64 = (HEADER_SIZE
            + coverage.num_levels() as usize * LEVEL_RECORD_SIZE) as u64;
        let directory_size = total;
        for lev in coverage.levels() {
            total += lev.extents.num_tiles() * TILE_RECORD_SIZE as u64;
        }
        let total_index_size = u32::try_from(total).map_err(|_| {
            FfError::InvalidCoverage(format!("index would be {total} bytes, too large"))
        })?;

        debug!(
            "creating index {:?}: {} levels, {} bytes",
            path,
            coverage.num_levels(),
            total_index_size
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| FfError::io(path, e))?;
        file.set_len(u64::from(total_index_size))
            .map_err(|e| FfError::io(path, e))?;
        let map = unsafe { MmapOptions::new().map_mut(&file) }.map_err(|e| FfError::io(path, e))?;

        // lay out one tile array per level, in level order
        let mut levels = Vec::with_capacity(coverage.num_levels() as usize);
        let mut level_slots = [None; NUM_FUSION_LEVELS];
        let mut next = directory_size;
        for lev in coverage.levels() {
            level_slots[lev.level as usize] = Some(levels.len());
            levels.push(LevelInfo {
                coverage: lev,
                tile_records_offset: next as u32,
                total_stored_tiles: 0,
            });
            next += lev.extents.num_tiles() * TILE_RECORD_SIZE as u64;
        }

        Ok(Self {
            path: path.to_path_buf(),
            ff_type,
            map,
            levels,
            level_slots,
            total_index_size,
            total_ff_size: 0,
            total_stored_tiles: 0,
            type_data: type_data.unwrap_or([0; TYPE_DATA_SIZE]),
            finalized: false,
        })
    }

    /// Record a tile at `addr` whose payload lives at `data_offset` in the
    /// logical flat file. Tiles may arrive in any order.
    pub fn add_tile(&mut self, addr: &TileAddr, data_offset: u64, data_len: u32) -> Result<()> {
        let level = self
            .level_slots
            .get(addr.level as usize)
            .copied()
            .flatten()
            .ok_or(FfError::LevelNotCovered(addr.level))?;
        let info = &mut self.levels[level];

        if !info.coverage.extents.contains(addr.row, addr.col) {
            return Err(FfError::TileOutsideCoverage(*addr));
        }
        if data_len == 0 {
            return Err(FfError::ZeroLengthTile(*addr));
        }

        let rec = TileRecord {
            data_offset,
            data_len,
        };
        let off = info.tile_offset(addr.row, addr.col);
        self.map[off..off + TILE_RECORD_SIZE].copy_from_slice(&rec.encode());
        info.total_stored_tiles += 1;
        self.total_stored_tiles += 1;
        Ok(())
    }

    /// Record the running byte total of the flat files this index covers,
    /// written into the header at close.
    pub fn set_total_ff_size(&mut self, total_ff_size: u64) {
        self.total_ff_size = total_ff_size;
    }

    /// Update the opaque per-type header payload.
    pub fn set_type_data(&mut self, type_data: [u8; TYPE_DATA_SIZE]) {
        self.type_data = type_data;
    }

    pub fn total_stored_tiles(&self) -> u32 {
        self.total_stored_tiles
    }

    /// Write the header and level directory, then flush the mapping.
    pub fn close(mut self) -> Result<()> {
        self.finalize()
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        let header = Header {
            index_format_version: INDEX_FORMAT_VERSION,
            total_ff_size: self.total_ff_size,
            total_index_size: self.total_index_size,
            total_stored_tiles: self.total_stored_tiles,
            ff_type: self.ff_type as u8,
            num_levels: self.levels.len() as u8,
            type_data: self.type_data,
        };
        self.map[0..HEADER_SIZE].copy_from_slice(&header.encode());

        let mut off = HEADER_SIZE;
        for info in &self.levels {
            let rec = LevelRecord::new(
                info.tile_records_offset,
                &info.coverage.extents,
                info.coverage.level as u8,
                info.total_stored_tiles,
            );
            self.map[off..off + LEVEL_RECORD_SIZE].copy_from_slice(&rec.encode());
            off += LEVEL_RECORD_SIZE;
        }

        self.map
            .flush()
            .map_err(|e| FfError::io(&self.path, e))?;
        debug!(
            "finalized index {:?}: {} tiles across {} levels",
            self.path,
            self.total_stored_tiles,
            self.levels.len()
        );
        Ok(())
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            error!("failed to finalize index {:?}: {}", self.path, e);
        }
    }
}

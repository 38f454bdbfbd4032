//! Per-level presence bitmask
//!
//! One bit per covered tile cell, stacked over the same coverage as the
//! index. Readers consult it before touching the index: a clear bit is a
//! guaranteed miss, a set bit only means "might exist". Writers cascade
//! set bits to coarser levels so queries above the covered range can be
//! answered from the top level, and queries below it by scanning the
//! magnified footprint at the bottom level.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, error};

use crate::coverage::{InsetCoverage, LevelCoverage, TileExtents};
use crate::error::{FfError, Result};
use crate::types::{MAX_FUSION_LEVEL, NUM_FUSION_LEVELS, TileAddr};
use crate::util::wait_if_too_new;

/// Encoded presence-file header size.
const PRESENCE_HEADER_SIZE: usize = 32;
/// Encoded per-level record size.
const PRESENCE_LEVEL_RECORD_SIZE: usize = 32;

/// Magic prefix of every presence file, NUL-terminated to fill the field.
const MAGIC: &[u8; 22] = b"Keyhole Presence Mask\0";

const PRESENCE_FORMAT_VERSION: u8 = 1;

/// Bitmask over one level's declared extents.
#[derive(Debug, Clone)]
pub struct LevelPresenceMask {
    pub level: u32,
    pub extents: TileExtents,
    buf: Vec<u8>,
}

impl LevelPresenceMask {
    /// Bytes needed for a rows x cols bitmap.
    pub fn calc_buffer_size(num_rows: u32, num_cols: u32) -> u32 {
        ((u64::from(num_rows) * u64::from(num_cols) + 7) / 8) as u32
    }

    fn new(level: u32, extents: TileExtents) -> Self {
        let size = Self::calc_buffer_size(extents.num_rows(), extents.num_cols());
        Self {
            level,
            extents,
            buf: vec![0u8; size as usize],
        }
    }

    fn from_buffer(level: u32, extents: TileExtents, buf: Vec<u8>) -> Self {
        debug_assert_eq!(
            buf.len(),
            Self::calc_buffer_size(extents.num_rows(), extents.num_cols()) as usize
        );
        Self { level, extents, buf }
    }

    pub fn buffer_size(&self) -> u32 {
        self.buf.len() as u32
    }

    fn bit_index(&self, row: u32, col: u32) -> usize {
        (row - self.extents.begin_row) as usize * self.extents.num_cols() as usize
            + (col - self.extents.begin_col) as usize
    }

    pub fn get_presence(&self, row: u32, col: u32) -> bool {
        if !self.extents.contains(row, col) {
            return false;
        }
        let idx = self.bit_index(row, col);
        self.buf[idx >> 3] & (1 << (idx & 7)) != 0
    }

    pub fn set_presence(&mut self, row: u32, col: u32, present: bool) {
        if !self.extents.contains(row, col) {
            return;
        }
        let idx = self.bit_index(row, col);
        if present {
            self.buf[idx >> 3] |= 1 << (idx & 7);
        } else {
            self.buf[idx >> 3] &= !(1 << (idx & 7));
        }
    }
}

/// Presence bits across a contiguous range of levels.
#[derive(Debug, Clone)]
pub struct PresenceMask {
    begin_level: u32,
    end_level: u32,
    /// Indexed by level number; contiguous Some-range `[begin, end)`.
    levels: Vec<Option<LevelPresenceMask>>,
}

impl PresenceMask {
    /// All-absent mask over `coverage`.
    pub fn new(coverage: &InsetCoverage) -> Result<Self> {
        if coverage.end_level() > MAX_FUSION_LEVEL + 1 {
            return Err(FfError::InvalidCoverage(format!(
                "coverage reaches level {}, deeper than {}",
                coverage.end_level() - 1,
                MAX_FUSION_LEVEL
            )));
        }
        let mut levels: Vec<Option<LevelPresenceMask>> = Vec::new();
        levels.resize_with(NUM_FUSION_LEVELS, || None);
        for lev in coverage.levels() {
            levels[lev.level as usize] = Some(LevelPresenceMask::new(lev.level, lev.extents));
        }
        Ok(Self {
            begin_level: coverage.begin_level(),
            end_level: coverage.end_level(),
            levels,
        })
    }

    /// Load a presence file written by [`PresenceMaskWriter`].
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_file_with_visibility_delay(path, Duration::ZERO)
    }

    /// Load, waiting out `delay` first if the file looks freshly written.
    pub fn from_file_with_visibility_delay(path: &Path, delay: Duration) -> Result<Self> {
        wait_if_too_new(path, delay)?;

        let data = std::fs::read(path).map_err(|e| FfError::io(path, e))?;
        let bad = |detail: String| FfError::InvalidPresenceFormat {
            path: path.to_path_buf(),
            detail,
        };

        if data.len() < PRESENCE_HEADER_SIZE {
            return Err(bad(format!("file is only {} bytes", data.len())));
        }
        if &data[0..22] != MAGIC {
            return Err(bad("bad magic".into()));
        }
        let version = data[22];
        if version != PRESENCE_FORMAT_VERSION {
            return Err(bad(format!("unsupported format version {version}")));
        }
        let num_levels = data[23] as usize;
        let total_file_size = LittleEndian::read_u32(&data[24..28]);
        if total_file_size as usize != data.len() {
            return Err(bad(format!(
                "header claims {} bytes, file has {}",
                total_file_size,
                data.len()
            )));
        }
        if num_levels > NUM_FUSION_LEVELS {
            return Err(bad(format!("{num_levels} levels out of range")));
        }
        if PRESENCE_HEADER_SIZE + num_levels * PRESENCE_LEVEL_RECORD_SIZE > data.len() {
            return Err(bad(format!("{num_levels} level records don't fit")));
        }

        let mut levels: Vec<Option<LevelPresenceMask>> = Vec::new();
        levels.resize_with(NUM_FUSION_LEVELS, || None);
        let mut begin_level = MAX_FUSION_LEVEL;
        let mut end_level = 0u32;

        for i in 0..num_levels {
            let off = PRESENCE_HEADER_SIZE + i * PRESENCE_LEVEL_RECORD_SIZE;
            let rec = &data[off..off + PRESENCE_LEVEL_RECORD_SIZE];
            let buffer_offset = LittleEndian::read_u32(&rec[0..4]);
            let buffer_size = LittleEndian::read_u32(&rec[4..8]);
            let start_row = LittleEndian::read_u32(&rec[8..12]);
            let start_col = LittleEndian::read_u32(&rec[12..16]);
            let num_rows = LittleEndian::read_u32(&rec[16..20]);
            let num_cols = LittleEndian::read_u32(&rec[20..24]);
            let level_num = u32::from(rec[24]);

            if level_num > MAX_FUSION_LEVEL {
                return Err(bad(format!("level number {level_num} out of range")));
            }
            if buffer_size != LevelPresenceMask::calc_buffer_size(num_rows, num_cols) {
                return Err(bad(format!("level {level_num} buffer size mismatch")));
            }
            if u64::from(buffer_offset) + u64::from(buffer_size) > data.len() as u64 {
                return Err(bad(format!("level {level_num} buffer exceeds file")));
            }

            let (Some(end_row), Some(end_col)) = (
                start_row.checked_add(num_rows),
                start_col.checked_add(num_cols),
            ) else {
                return Err(bad(format!("level {level_num} extents overflow")));
            };
            let extents = TileExtents::new(start_row, end_row, start_col, end_col);
            let buf =
                data[buffer_offset as usize..(buffer_offset + buffer_size) as usize].to_vec();
            levels[level_num as usize] =
                Some(LevelPresenceMask::from_buffer(level_num, extents, buf));

            begin_level = begin_level.min(level_num);
            end_level = end_level.max(level_num + 1);
        }

        if num_levels == 0 {
            begin_level = 0;
            end_level = 0;
        } else if num_levels as u32 != end_level.saturating_sub(begin_level) {
            return Err(bad("levels are not contiguous".into()));
        }

        debug!(
            "loaded presence mask {:?}: levels [{}, {})",
            path, begin_level, end_level
        );

        Ok(Self {
            begin_level,
            end_level,
            levels,
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

    fn level(&self, level: u32) -> Option<&LevelPresenceMask> {
        self.levels.get(level as usize).and_then(Option::as_ref)
    }

    /// Exact bit for an address inside the covered level range; false for
    /// uncovered levels.
    pub fn get_presence(&self, addr: &TileAddr) -> bool {
        self.level(addr.level)
            .is_some_and(|lev| lev.get_presence(addr.row, addr.col))
    }

    /// Set or clear one bit. Errors if the level is not covered.
    pub fn set_presence(&mut self, addr: &TileAddr, present: bool) -> Result<()> {
        let lev = self
            .levels
            .get_mut(addr.level as usize)
            .and_then(Option::as_mut)
            .ok_or(FfError::LevelNotCovered(addr.level))?;
        if !lev.extents.contains(addr.row, addr.col) {
            return Err(FfError::TileOutsideCoverage(*addr));
        }
        lev.set_presence(addr.row, addr.col, present);
        Ok(())
    }

    /// Set the bit for `addr` and propagate it to coarser levels until an
    /// already-set bit or the bottom of the covered range.
    pub fn set_presence_cascade(&mut self, addr: &TileAddr) -> Result<()> {
        if self.level(addr.level).is_none() {
            return Err(FfError::LevelNotCovered(addr.level));
        }
        let mut cur = *addr;
        while let Some(lev) = self
            .levels
            .get_mut(cur.level as usize)
            .and_then(Option::as_mut)
        {
            if lev.get_presence(cur.row, cur.col) {
                break;
            }
            lev.set_presence(cur.row, cur.col, true);
            if cur.level <= self.begin_level {
                break;
            }
            cur = cur.minified_by(1);
        }
        Ok(())
    }

    /// Conservative existence estimate for any level.
    ///
    /// Inside the covered range this is the exact bit. Above it, the
    /// address is minified to the top covered level (cascaded writes keep
    /// that level honest). Below it, any set bit inside the address's
    /// magnified footprint at the bottom covered level counts as a hit.
    pub fn get_estimated_presence(&self, addr: &TileAddr) -> bool {
        if self.num_levels() == 0 {
            return false;
        }
        if let Some(lev) = self.level(addr.level) {
            return lev.get_presence(addr.row, addr.col);
        }
        if addr.level >= self.end_level {
            let top = addr.minified_to_level(self.end_level - 1);
            return self
                .level(top.level)
                .is_some_and(|lev| lev.get_presence(top.row, top.col));
        }
        // below the covered range: scan the magnified footprint
        let Some(bottom) = self.level(self.begin_level) else {
            return false;
        };
        let footprint = LevelCoverage::of_tile(addr).magnified_to_level(self.begin_level);
        let to_check = TileExtents::intersection(&footprint.extents, &bottom.extents);
        for row in to_check.begin_row..to_check.end_row {
            for col in to_check.begin_col..to_check.end_col {
                if bottom.get_presence(row, col) {
                    return true;
                }
            }
        }
        false
    }

    /// Reconstruct the coverage this mask spans.
    pub fn populate_coverage(&self) -> Result<InsetCoverage> {
        let mut extents = Vec::with_capacity(self.num_levels() as usize);
        for level in self.begin_level..self.end_level {
            let lev = self
                .level(level)
                .ok_or(FfError::LevelNotCovered(level))?;
            extents.push(lev.extents);
        }
        InsetCoverage::new(self.begin_level, extents)
    }

    fn covered_levels(&self) -> impl Iterator<Item = &LevelPresenceMask> {
        self.levels.iter().filter_map(Option::as_ref)
    }
}

/// Writer for the `pack.presence` file.
///
/// The file is pre-sized at construction so filesystem problems surface
/// early; the actual header, level records and bitmaps are written at
/// close. A crash before close leaves a zero-filled file that
/// [`PresenceMask::from_file`] rejects.
pub struct PresenceMaskWriter {
    path: PathBuf,
    file: std::fs::File,
    presence: PresenceMask,
    finalized: bool,
}

impl PresenceMaskWriter {
    pub fn new(path: &Path, coverage: &InsetCoverage) -> Result<Self> {
        let presence = PresenceMask::new(coverage)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| FfError::io(path, e))?;
        let total = Self::total_file_size(&presence);
        file.set_len(u64::from(total))
            .map_err(|e| FfError::io(path, e))?;
        debug!("creating presence mask {:?}: {} bytes", path, total);
        Ok(Self {
            path: path.to_path_buf(),
            file,
            presence,
            finalized: false,
        })
    }

    fn data_offset(presence: &PresenceMask) -> u32 {
        (PRESENCE_HEADER_SIZE + presence.num_levels() as usize * PRESENCE_LEVEL_RECORD_SIZE) as u32
    }

    fn total_file_size(presence: &PresenceMask) -> u32 {
        let mut total = Self::data_offset(presence);
        for lev in presence.covered_levels() {
            total += lev.buffer_size();
        }
        total
    }

    pub fn mask(&self) -> &PresenceMask {
        &self.presence
    }

    pub fn get_presence(&self, addr: &TileAddr) -> bool {
        self.presence.get_estimated_presence(addr)
    }

    pub fn set_presence(&mut self, addr: &TileAddr) -> Result<()> {
        self.presence.set_presence_cascade(addr)
    }

    /// Write header, level records and bitmaps, then sync.
    pub fn close(mut self) -> Result<()> {
        self.finalize()
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        let total = Self::total_file_size(&self.presence) as usize;
        let mut out = vec![0u8; total];

        out[0..22].copy_from_slice(MAGIC);
        out[22] = PRESENCE_FORMAT_VERSION;
        out[23] = self.presence.num_levels() as u8;
        LittleEndian::write_u32(&mut out[24..28], total as u32);

        let mut rec_off = PRESENCE_HEADER_SIZE;
        let mut buf_off = Self::data_offset(&self.presence) as usize;
        for lev in self.presence.covered_levels() {
            let rec = &mut out[rec_off..rec_off + PRESENCE_LEVEL_RECORD_SIZE];
            LittleEndian::write_u32(&mut rec[0..4], buf_off as u32);
            LittleEndian::write_u32(&mut rec[4..8], lev.buffer_size());
            LittleEndian::write_u32(&mut rec[8..12], lev.extents.begin_row);
            LittleEndian::write_u32(&mut rec[12..16], lev.extents.begin_col);
            LittleEndian::write_u32(&mut rec[16..20], lev.extents.num_rows());
            LittleEndian::write_u32(&mut rec[20..24], lev.extents.num_cols());
            rec[24] = lev.level as u8;
            rec_off += PRESENCE_LEVEL_RECORD_SIZE;

            out[buf_off..buf_off + lev.buf.len()].copy_from_slice(&lev.buf);
            buf_off += lev.buf.len();
        }

        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.write_all(&out))
            .and_then(|_| self.file.sync_all())
            .map_err(|e| FfError::io(&self.path, e))?;
        debug!("finalized presence mask {:?}", self.path);
        Ok(())
    }
}

impl Drop for PresenceMaskWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            error!("failed to finalize presence mask {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::TileExtents;
    use tempfile::tempdir;

    fn two_level_coverage() -> InsetCoverage {
        InsetCoverage::new(
            4,
            vec![TileExtents::new(0, 4, 0, 4), TileExtents::new(0, 8, 0, 8)],
        )
        .unwrap()
    }

    #[test]
    fn buffer_size_rounds_up() {
        assert_eq!(LevelPresenceMask::calc_buffer_size(1, 1), 1);
        assert_eq!(LevelPresenceMask::calc_buffer_size(2, 4), 1);
        assert_eq!(LevelPresenceMask::calc_buffer_size(3, 3), 2);
        assert_eq!(LevelPresenceMask::calc_buffer_size(16, 16), 32);
    }

    #[test]
    fn set_and_get_bits() {
        let mut mask = PresenceMask::new(&two_level_coverage()).unwrap();
        let addr = TileAddr::new(5, 3, 6);
        assert!(!mask.get_presence(&addr));
        mask.set_presence(&addr, true).unwrap();
        assert!(mask.get_presence(&addr));
        assert!(!mask.get_presence(&TileAddr::new(5, 3, 7)));
        mask.set_presence(&addr, false).unwrap();
        assert!(!mask.get_presence(&addr));
    }

    #[test]
    fn set_rejects_uncovered() {
        let mut mask = PresenceMask::new(&two_level_coverage()).unwrap();
        assert!(matches!(
            mask.set_presence(&TileAddr::new(9, 0, 0), true),
            Err(FfError::LevelNotCovered(9))
        ));
        assert!(matches!(
            mask.set_presence(&TileAddr::new(4, 4, 0), true),
            Err(FfError::TileOutsideCoverage(_))
        ));
    }

    #[test]
    fn cascade_reaches_bottom_level() {
        let mut mask = PresenceMask::new(&two_level_coverage()).unwrap();
        mask.set_presence_cascade(&TileAddr::new(5, 7, 5)).unwrap();
        assert!(mask.get_presence(&TileAddr::new(5, 7, 5)));
        assert!(mask.get_presence(&TileAddr::new(4, 3, 2)));
    }

    #[test]
    fn estimates_outside_level_range() {
        let mut mask = PresenceMask::new(&two_level_coverage()).unwrap();
        mask.set_presence_cascade(&TileAddr::new(5, 7, 5)).unwrap();

        // above the range: minified address hits the set top-level bit
        assert!(mask.get_estimated_presence(&TileAddr::new(7, 30, 21)));
        assert!(!mask.get_estimated_presence(&TileAddr::new(7, 0, 0)));

        // below the range: any set bit in the magnified footprint
        assert!(mask.get_estimated_presence(&TileAddr::new(3, 1, 1)));
        assert!(!mask.get_estimated_presence(&TileAddr::new(3, 0, 0)));
    }

    #[test]
    fn file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pack.presence");
        let cov = two_level_coverage();

        let mut writer = PresenceMaskWriter::new(&path, &cov).unwrap();
        writer.set_presence(&TileAddr::new(5, 1, 2)).unwrap();
        writer.set_presence(&TileAddr::new(4, 3, 3)).unwrap();
        writer.close().unwrap();

        let mask = PresenceMask::from_file(&path).unwrap();
        assert_eq!(mask.begin_level(), 4);
        assert_eq!(mask.end_level(), 6);
        assert!(mask.get_presence(&TileAddr::new(5, 1, 2)));
        assert!(mask.get_presence(&TileAddr::new(4, 0, 1))); // cascaded
        assert!(mask.get_presence(&TileAddr::new(4, 3, 3)));
        assert!(!mask.get_presence(&TileAddr::new(5, 0, 0)));
        assert_eq!(mask.populate_coverage().unwrap(), cov);
    }

    #[test]
    fn rejects_corrupt_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pack.presence");
        let cov = two_level_coverage();
        PresenceMaskWriter::new(&path, &cov).unwrap().close().unwrap();

        let good = std::fs::read(&path).unwrap();

        // flipped magic
        let mut bad = good.clone();
        bad[0] ^= 0xff;
        std::fs::write(&path, &bad).unwrap();
        assert!(PresenceMask::from_file(&path).is_err());

        // wrong file size claim
        let mut bad = good.clone();
        bad[24] ^= 0xff;
        std::fs::write(&path, &bad).unwrap();
        assert!(PresenceMask::from_file(&path).is_err());

        // start_row so large the first level's extents overflow u32
        let mut bad = good.clone();
        bad[PRESENCE_HEADER_SIZE + 8..PRESENCE_HEADER_SIZE + 12]
            .copy_from_slice(&u32::MAX.to_le_bytes());
        std::fs::write(&path, &bad).unwrap();
        assert!(PresenceMask::from_file(&path).is_err());

        // a never-finalized (all zero) file
        std::fs::write(&path, vec![0u8; good.len()]).unwrap();
        assert!(PresenceMask::from_file(&path).is_err());
    }
}

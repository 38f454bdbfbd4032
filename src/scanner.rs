//! Streaming flat-file scanner
//!
//! Walks a flat file record by record through rolling memory-map windows,
//! so arbitrarily large files never have to be mapped whole. Each record
//! header is validated before the payload is handed to the callback; the
//! first implausible or truncated record aborts the scan with a corruption
//! error. There is no partial success.

use std::fs::File;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};
use tracing::{debug, trace};

use crate::error::{FfError, Result};
use crate::record::{RECORD_HEADER_SIZE, RecordHeader};
use crate::types::MAX_FUSION_LEVEL;

/// Default scan window: 100 MiB per mapping.
pub const DEFAULT_WINDOW_SIZE: usize = 100 * 1024 * 1024;

/// Window starts are aligned down to this granularity so the mapping
/// offset satisfies the page size on every platform we care about.
const MAP_ALIGN: u64 = 64 * 1024;

/// Tells the scanner whether to keep going after a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    Continue,
    /// Clean early termination, not an error.
    Stop,
}

/// One mapped window of the file being scanned.
struct Window {
    base: u64,
    map: Mmap,
}

impl Window {
    fn covers(&self, offset: u64, len: u64) -> bool {
        offset >= self.base && offset + len <= self.base + self.map.len() as u64
    }

    fn slice(&self, offset: u64, len: usize) -> &[u8] {
        let start = (offset - self.base) as usize;
        &self.map[start..start + len]
    }
}

/// Configurable scanner over one flat file.
#[derive(Debug, Clone)]
pub struct FlatFileScanner {
    window_size: usize,
    max_level: u32,
}

impl Default for FlatFileScanner {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            max_level: MAX_FUSION_LEVEL,
        }
    }
}

impl FlatFileScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the mapping window size (mostly for tests).
    pub fn window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size.max(MAP_ALIGN as usize);
        self
    }

    /// Override the deepest level treated as plausible.
    pub fn max_level(mut self, max_level: u32) -> Self {
        self.max_level = max_level;
        self
    }

    /// Scan `path`, invoking `callback` with each record's header and
    /// payload slice (padding excluded). The callback can stop the scan
    /// early without error by returning [`ScanControl::Stop`].
    pub fn scan<F>(&self, path: &Path, mut callback: F) -> Result<()>
    where
        F: FnMut(&RecordHeader, &[u8]) -> ScanControl,
    {
        let file = File::open(path).map_err(|e| FfError::io(path, e))?;
        let file_size = file.metadata().map_err(|e| FfError::io(path, e))?.len();

        debug!("scanning flat file {:?} ({} bytes)", path, file_size);

        if file_size == 0 {
            return Ok(());
        }

        let mut window = self.remap(path, &file, 0, file_size, RECORD_HEADER_SIZE as u64)?;
        let mut offset: u64 = 0;
        let mut record: u64 = 0;

        while offset < file_size {
            if offset + RECORD_HEADER_SIZE as u64 > file_size {
                return Err(FfError::TruncatedFile {
                    path: path.to_path_buf(),
                    record,
                    offset,
                    needed: RECORD_HEADER_SIZE as u64,
                    file_size,
                });
            }

            if !window.covers(offset, RECORD_HEADER_SIZE as u64) {
                window = self.remap(path, &file, offset, file_size, RECORD_HEADER_SIZE as u64)?;
            }
            let hdr = {
                let mut buf = [0u8; RECORD_HEADER_SIZE];
                buf.copy_from_slice(window.slice(offset, RECORD_HEADER_SIZE));
                RecordHeader::decode(&buf)
            };

            if !hdr.is_plausible(self.max_level) {
                return Err(FfError::CorruptRecord {
                    path: path.to_path_buf(),
                    record,
                    level: hdr.level,
                    x: hdr.x,
                    y: hdr.y,
                    len: hdr.len,
                    vers: hdr.vers,
                });
            }

            let record_len = u64::from(hdr.record_len());
            if offset + record_len > file_size {
                return Err(FfError::TruncatedFile {
                    path: path.to_path_buf(),
                    record,
                    offset,
                    needed: record_len,
                    file_size,
                });
            }

            // Remap if the payload runs off the end of the window.
            if !window.covers(offset, record_len) {
                window = self.remap(path, &file, offset, file_size, record_len)?;
            }
            let payload = window.slice(offset + RECORD_HEADER_SIZE as u64, hdr.len as usize);

            trace!(
                "record {}: level={} row={} col={} len={}",
                record, hdr.level, hdr.y, hdr.x, hdr.len
            );

            if callback(&hdr, payload) == ScanControl::Stop {
                debug!("scan of {:?} stopped by callback at record {}", path, record);
                return Ok(());
            }

            offset += record_len;
            record += 1;
        }

        debug!("scanned {} records from {:?}", record, path);
        Ok(())
    }

    /// Map a fresh window whose start is aligned down from `offset` and
    /// which holds at least `needed` bytes past `offset`.
    fn remap(
        &self,
        path: &Path,
        file: &File,
        offset: u64,
        file_size: u64,
        needed: u64,
    ) -> Result<Window> {
        let base = offset & !(MAP_ALIGN - 1);
        let want = (offset - base) + needed;
        let len = (self.window_size as u64).max(want).min(file_size - base);
        let map = unsafe {
            MmapOptions::new()
                .offset(base)
                .len(len as usize)
                .map(file)
                .map_err(|e| FfError::io(path, e))?
        };
        trace!("mapped window [{}, {}) of {:?}", base, base + len, path);
        Ok(Window { base, map })
    }
}

/// Scan with default window size and level limit.
pub fn scan<F>(path: &Path, callback: F) -> Result<()>
where
    F: FnMut(&RecordHeader, &[u8]) -> ScanControl,
{
    FlatFileScanner::new().scan(path, callback)
}

/// Cheap tile-count estimate for progress reporting: average the on-disk
/// size of the first 10 records and divide the file size by it. Not exact
/// once record sizes vary, and never used for correctness.
pub fn estimate_tile_count(path: &Path) -> Result<u64> {
    let file_size = std::fs::metadata(path)
        .map_err(|e| FfError::io(path, e))?
        .len();
    if file_size == 0 {
        return Ok(0);
    }

    let mut sampled: u64 = 0;
    let mut sampled_bytes: u64 = 0;
    FlatFileScanner::new().scan(path, |hdr, _payload| {
        sampled += 1;
        sampled_bytes += u64::from(hdr.record_len());
        if sampled >= 10 {
            ScanControl::Stop
        } else {
            ScanControl::Continue
        }
    })?;

    if sampled == 0 {
        return Ok(0);
    }
    let avg = sampled_bytes / sampled;
    Ok(file_size / avg.max(1))
}

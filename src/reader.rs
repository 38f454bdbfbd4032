//! Composed tile reader over a finished output directory
//!
//! Locating a tile goes presence mask -> index -> split files: the mask
//! answers most misses without touching the index, the index yields the
//! logical byte range, and the range is mapped onto whichever `pack.NN`
//! file contains it. All state is per-instance; any number of readers can
//! work against one immutable directory.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{FfError, Result};
use crate::index::reader::IndexReader;
use crate::presence::PresenceMask;
use crate::types::TileAddr;
use crate::util::{INDEX_FILE_NAME, PRESENCE_FILE_NAME, split_file_name};

/// Which logical-offset range one split file covers. Derived from file
/// sizes at open, never persisted.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,
    pub begin_offset: u64,
    pub end_offset: u64,
}

/// Where a tile's payload lives: which split file, where in it, how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileLocation {
    pub file_index: usize,
    pub file_offset: u64,
    pub data_len: u32,
}

/// Reader over one flat-file dataset directory.
pub struct Reader {
    files: Vec<FileInfo>,
    presence: PresenceMask,
    index_path: PathBuf,
    visibility_delay: Duration,
    /// Index is opened on first lookup; many callers only ever consult
    /// the presence mask.
    index: Mutex<Option<IndexReader>>,
    /// Most recently read split file, kept open to avoid reopen churn on
    /// clustered lookups. Purely an optimization.
    cached_file: Mutex<Option<(PathBuf, File)>>,
}

impl Reader {
    pub fn open(ffdir: &Path) -> Result<Self> {
        Self::open_with_visibility_delay(ffdir, Duration::ZERO)
    }

    /// Open, waiting out `delay` on freshly written index/presence files
    /// (NFS visibility workaround).
    pub fn open_with_visibility_delay(ffdir: &Path, delay: Duration) -> Result<Self> {
        // discover split files by probing until one is missing
        let mut files = Vec::new();
        let mut total: u64 = 0;
        for seq in 0.. {
            let path = ffdir.join(split_file_name(seq));
            let size = match std::fs::metadata(&path) {
                Ok(md) => md.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => return Err(FfError::io(&path, e)),
            };
            files.push(FileInfo {
                path,
                begin_offset: total,
                end_offset: total + size,
            });
            total += size;
        }
        debug!(
            "opened flat file set {:?}: {} split files, {} bytes",
            ffdir,
            files.len(),
            total
        );

        let presence = PresenceMask::from_file_with_visibility_delay(
            &ffdir.join(PRESENCE_FILE_NAME),
            delay,
        )?;

        Ok(Self {
            files,
            presence,
            index_path: ffdir.join(INDEX_FILE_NAME),
            visibility_delay: delay,
            index: Mutex::new(None),
            cached_file: Mutex::new(None),
        })
    }

    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }

    pub fn presence(&self) -> &PresenceMask {
        &self.presence
    }

    /// Cheap existence estimate from the presence mask alone.
    pub fn get_presence(&self, addr: &TileAddr) -> bool {
        self.presence.get_estimated_presence(addr)
    }

    /// Locate a tile's payload. `Ok(None)` when the tile does not exist;
    /// errors only for real failures (index unreadable, corrupt, ...).
    pub fn find_tile(&self, addr: &TileAddr) -> Result<Option<TileLocation>> {
        if !self.presence.get_estimated_presence(addr) {
            return Ok(None);
        }

        let mut guard = self.index.lock();
        if guard.is_none() {
            *guard = Some(IndexReader::open_with_visibility_delay(
                &self.index_path,
                self.visibility_delay,
            )?);
        }
        let Some((logical_offset, data_len)) = guard.as_ref().and_then(|i| i.find_tile(addr))
        else {
            return Ok(None);
        };
        drop(guard);

        for (file_index, info) in self.files.iter().enumerate() {
            if logical_offset >= info.begin_offset
                && logical_offset + u64::from(data_len) <= info.end_offset
            {
                return Ok(Some(TileLocation {
                    file_index,
                    file_offset: logical_offset - info.begin_offset,
                    data_len,
                }));
            }
        }

        // The index says the tile exists but no split file covers its
        // range. Nothing here can repair on-disk state, so report a miss
        // rather than failing the whole fetch.
        error!(
            "index {:?} places tile {} at [{}, {}) but no split file covers it",
            self.index_path,
            addr,
            logical_offset,
            logical_offset + u64::from(data_len)
        );
        Ok(None)
    }

    /// Positioned read of `out.len()` bytes at `file_offset` in `path`,
    /// reusing the cached handle when the path matches. Returns the byte
    /// count read.
    pub fn read_block(&self, path: &Path, file_offset: u64, out: &mut [u8]) -> Result<u32> {
        let mut guard = self.cached_file.lock();
        if !matches!(guard.as_ref(), Some((p, _)) if p == path) {
            debug!("opening split file {:?}", path);
            let file = File::open(path).map_err(|e| FfError::io(path, e))?;
            *guard = Some((path.to_path_buf(), file));
        }
        let Some((_, file)) = guard.as_mut() else {
            return Err(FfError::io(path, std::io::Error::other("file cache empty")));
        };
        file.seek(SeekFrom::Start(file_offset))
            .and_then(|_| file.read_exact(out))
            .map_err(|e| FfError::io(path, e))?;
        Ok(out.len() as u32)
    }

    /// Locate and read a tile in one call, resizing `out_buf` to the
    /// payload length. A missing tile is an error here, unlike
    /// [`find_tile`](Self::find_tile).
    pub fn find_read_block(&self, addr: &TileAddr, out_buf: &mut Vec<u8>) -> Result<u32> {
        let loc = self
            .find_tile(addr)?
            .ok_or(FfError::TileNotFound(*addr))?;
        out_buf.resize(loc.data_len as usize, 0);
        let path = self.files[loc.file_index].path.clone();
        self.read_block(&path, loc.file_offset, out_buf)
    }
}

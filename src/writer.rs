//! Sequential flat-file appender with size-based splitting
//!
//! Records are appended to `pack.00` until the next record would push the
//! file past the split threshold, then the writer rolls to `pack.01` and
//! so on. The logical flat file is the concatenation of the split files
//! in sequence order; offsets recorded by the index are logical, never
//! per-file. One writer per output directory; construction wipes it.

use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{FfError, Result};
use crate::record::RecordHeader;
use crate::types::{FfType, TileAddr};
use crate::util::split_file_name;

/// Default split threshold: 1000 MiB per physical file.
pub const DEFAULT_SPLIT_SIZE: u64 = 1000 * 1024 * 1024;

const PAD: [u8; 32] = [0u8; 32];

/// Appender over one output directory's split data files.
pub struct Writer {
    ff_type: FfType,
    outdir: PathBuf,
    split_size: u64,
    file: BufWriter<File>,
    file_seq: u32,
    file_offset: u64,
    tile_version: u32,
}

impl Writer {
    /// Wipe and recreate `outdir`, then open `pack.00` for appending.
    pub fn new(ff_type: FfType, outdir: &Path, split_size: u64) -> Result<Self> {
        if outdir.exists() {
            std::fs::remove_dir_all(outdir).map_err(|e| FfError::io(outdir, e))?;
        }
        std::fs::create_dir_all(outdir).map_err(|e| FfError::io(outdir, e))?;

        let path = outdir.join(split_file_name(0));
        let file = File::create(&path).map_err(|e| FfError::io(&path, e))?;
        info!("writing {:?} flat file set in {:?}", ff_type, outdir);

        Ok(Self {
            ff_type,
            outdir: outdir.to_path_buf(),
            split_size,
            file: BufWriter::new(file),
            file_seq: 0,
            file_offset: 0,
            tile_version: 1,
        })
    }

    /// Version stamped into each record header.
    pub fn set_tile_version(&mut self, vers: u32) {
        self.tile_version = vers;
    }

    pub fn ff_type(&self) -> FfType {
        self.ff_type
    }

    /// Append one tile record: header, payload, zero padding out to the
    /// record alignment. Returns the total bytes written so callers can
    /// maintain the logical offset for the index.
    pub fn write_packet(&mut self, buf: &[u8], addr: &TileAddr) -> Result<u32> {
        let len = u32::try_from(buf.len()).map_err(|_| FfError::PayloadTooLarge {
            addr: *addr,
            len: buf.len(),
        })?;
        let hdr = RecordHeader::new(len, addr, self.tile_version);
        let record_len = hdr.record_len();

        if self.file_offset > 0 && self.file_offset + u64::from(record_len) > self.split_size {
            self.roll()?;
        }

        let path = self.current_path();
        let io = |e| FfError::io(&path, e);
        self.file.write_all(&hdr.encode()).map_err(io)?;
        self.file.write_all(buf).map_err(io)?;
        let pad = (hdr.padded_len() - hdr.len) as usize;
        self.file.write_all(&PAD[..pad]).map_err(io)?;

        self.file_offset += u64::from(record_len);
        Ok(record_len)
    }

    /// Close the current split file and start the next one.
    fn roll(&mut self) -> Result<()> {
        self.file
            .flush()
            .map_err(|e| FfError::io(self.current_path(), e))?;
        self.file_seq += 1;
        let path = self.outdir.join(split_file_name(self.file_seq));
        debug!(
            "split at {} bytes, rolling to {:?}",
            self.file_offset, path
        );
        let file = File::create(&path).map_err(|e| FfError::io(&path, e))?;
        self.file = BufWriter::new(file);
        self.file_offset = 0;
        Ok(())
    }

    fn current_path(&self) -> PathBuf {
        self.outdir.join(split_file_name(self.file_seq))
    }

    /// Offset the next record will land at within the current split file.
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    /// Number of split files written so far.
    pub fn num_split_files(&self) -> u32 {
        self.file_seq + 1
    }

    pub fn close(mut self) -> Result<()> {
        self.file
            .flush()
            .map_err(|e| FfError::io(self.current_path(), e))
    }
}

//! Indexed writer composing the appender, index and presence mask
//!
//! Every packet written through here lands in three places: the record
//! itself in the current split file, its (logical offset, length) in the
//! index, and a cascaded bit in the presence mask. All three files become
//! a consistent triple only once `close` has finished; there is no
//! cross-file transaction.

use std::path::Path;

use crate::coverage::InsetCoverage;
use crate::error::{FfError, Result};
use crate::index::storage::TYPE_DATA_SIZE;
use crate::index::writer::IndexWriter;
use crate::presence::PresenceMaskWriter;
use crate::record::RECORD_HEADER_SIZE;
use crate::types::{FfType, TileAddr};
use crate::util::{INDEX_FILE_NAME, PRESENCE_FILE_NAME};
use crate::writer::{DEFAULT_SPLIT_SIZE, Writer};

/// Writer for a complete flat-file dataset: `pack.NN` + `pack.idx` +
/// `pack.presence`, all over one declared coverage.
pub struct GridIndexedWriter {
    writer: Writer,
    index: IndexWriter,
    presence: PresenceMaskWriter,
    /// Bytes of all records written so far, across every split file.
    total_ff_size: u64,
}

impl GridIndexedWriter {
    pub fn new(
        ff_type: FfType,
        outdir: &Path,
        coverage: &InsetCoverage,
        type_data: Option<[u8; TYPE_DATA_SIZE]>,
    ) -> Result<Self> {
        Self::with_split_size(ff_type, outdir, coverage, type_data, DEFAULT_SPLIT_SIZE)
    }

    pub fn with_split_size(
        ff_type: FfType,
        outdir: &Path,
        coverage: &InsetCoverage,
        type_data: Option<[u8; TYPE_DATA_SIZE]>,
        split_size: u64,
    ) -> Result<Self> {
        // Writer::new wipes the directory, so it must come first.
        let writer = Writer::new(ff_type, outdir, split_size)?;
        let index = IndexWriter::new(ff_type, &outdir.join(INDEX_FILE_NAME), coverage, type_data)?;
        let presence = PresenceMaskWriter::new(&outdir.join(PRESENCE_FILE_NAME), coverage)?;
        Ok(Self {
            writer,
            index,
            presence,
            total_ff_size: 0,
        })
    }

    /// Append one tile: record to the data file, (offset, length) to the
    /// index, presence bit cascaded. Returns the record's on-disk length.
    pub fn write_packet(&mut self, buf: &[u8], addr: &TileAddr) -> Result<u32> {
        // the stored offset points at the payload, past the record header,
        // in the logical concatenation of all split files; indexing first
        // means a rejected tile leaves no orphan record behind
        let data_len = u32::try_from(buf.len()).map_err(|_| FfError::PayloadTooLarge {
            addr: *addr,
            len: buf.len(),
        })?;
        let data_offset = self.total_ff_size + RECORD_HEADER_SIZE as u64;
        self.index.add_tile(addr, data_offset, data_len)?;

        let record_len = self.writer.write_packet(buf, addr)?;
        self.total_ff_size += u64::from(record_len);
        self.index.set_total_ff_size(self.total_ff_size);

        self.presence.set_presence(addr)?;
        Ok(record_len)
    }

    /// Existence check without touching the index.
    pub fn get_presence(&self, addr: &TileAddr) -> bool {
        self.presence.get_presence(addr)
    }

    pub fn total_stored_tiles(&self) -> u32 {
        self.index.total_stored_tiles()
    }

    pub fn total_ff_size(&self) -> u64 {
        self.total_ff_size
    }

    /// Update the opaque per-type payload in the index header.
    pub fn set_type_data(&mut self, type_data: [u8; TYPE_DATA_SIZE]) {
        self.index.set_type_data(type_data);
    }

    /// Version stamped into each record header.
    pub fn set_tile_version(&mut self, vers: u32) {
        self.writer.set_tile_version(vers);
    }

    /// Finalize all three files.
    pub fn close(self) -> Result<()> {
        self.writer.close()?;
        self.index.close()?;
        self.presence.close()
    }
}

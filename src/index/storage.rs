//! On-disk records of the flat-file index
//!
//! The index file is `[Header][LevelRecord x num_levels][TileRecord arrays]`.
//! Everything here is little-endian, unlike the flat files being indexed;
//! the public reader/writer APIs hide the difference. Each struct has an
//! exact encoded size and is written through explicit byte-buffer encode /
//! decode functions, never by aliasing mapped memory.

use byteorder::{ByteOrder, LittleEndian};

use crate::coverage::TileExtents;

/// Encoded header size.
pub const HEADER_SIZE: usize = 64;
/// Encoded per-level record size.
pub const LEVEL_RECORD_SIZE: usize = 32;
/// Encoded per-tile record size.
pub const TILE_RECORD_SIZE: usize = 16;

/// Magic prefix of every index file, NUL-terminated to fill the field.
pub const MAGIC: &[u8; 23] = b"Keyhole Flatfile Index\0";

/// Only format version ever produced.
pub const INDEX_FORMAT_VERSION: u8 = 1;

/// Size of the opaque per-type payload carried in the header.
pub const TYPE_DATA_SIZE: usize = 16;

/// Index file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub index_format_version: u8,
    /// Total bytes of all flat files this index covers.
    pub total_ff_size: u64,
    /// Byte length of the index file itself.
    pub total_index_size: u32,
    pub total_stored_tiles: u32,
    /// Raw [`crate::types::FfType`] discriminant.
    pub ff_type: u8,
    pub num_levels: u8,
    /// Opaque payload owned by the tile-type specialization.
    pub type_data: [u8; TYPE_DATA_SIZE],
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..23].copy_from_slice(MAGIC);
        buf[23] = self.index_format_version;
        LittleEndian::write_u64(&mut buf[24..32], self.total_ff_size);
        LittleEndian::write_u32(&mut buf[32..36], self.total_index_size);
        LittleEndian::write_u32(&mut buf[36..40], self.total_stored_tiles);
        buf[40] = self.ff_type;
        buf[41] = self.num_levels;
        // 42..48 stay zero
        buf[48..64].copy_from_slice(&self.type_data);
        buf
    }

    /// Decode without magic verification; callers check [`has_magic`] first.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        let mut type_data = [0u8; TYPE_DATA_SIZE];
        type_data.copy_from_slice(&buf[48..64]);
        Self {
            index_format_version: buf[23],
            total_ff_size: LittleEndian::read_u64(&buf[24..32]),
            total_index_size: LittleEndian::read_u32(&buf[32..36]),
            total_stored_tiles: LittleEndian::read_u32(&buf[36..40]),
            ff_type: buf[40],
            num_levels: buf[41],
            type_data,
        }
    }

    pub fn has_magic(buf: &[u8; HEADER_SIZE]) -> bool {
        &buf[0..23] == MAGIC
    }
}

/// Per-level directory entry pointing at the level's TileRecord array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelRecord {
    /// Byte offset of the level's TileRecord array within the index file.
    pub tile_records_offset: u32,
    pub total_stored_tiles: u32,
    pub start_row: u32,
    pub start_col: u32,
    pub num_rows: u32,
    pub num_cols: u32,
    pub level_num: u8,
}

impl LevelRecord {
    pub fn new(
        tile_records_offset: u32,
        extents: &TileExtents,
        level_num: u8,
        total_stored_tiles: u32,
    ) -> Self {
        Self {
            tile_records_offset,
            total_stored_tiles,
            start_row: extents.begin_row,
            start_col: extents.begin_col,
            num_rows: extents.num_rows(),
            num_cols: extents.num_cols(),
            level_num,
        }
    }

    /// Reconstruct the extents. `None` when the stored bounds overflow,
    /// which only happens for corrupt records.
    pub fn extents(&self) -> Option<TileExtents> {
        Some(TileExtents::new(
            self.start_row,
            self.start_row.checked_add(self.num_rows)?,
            self.start_col,
            self.start_col.checked_add(self.num_cols)?,
        ))
    }

    pub fn encode(&self) -> [u8; LEVEL_RECORD_SIZE] {
        let mut buf = [0u8; LEVEL_RECORD_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.tile_records_offset);
        LittleEndian::write_u32(&mut buf[4..8], self.total_stored_tiles);
        LittleEndian::write_u32(&mut buf[8..12], self.start_row);
        LittleEndian::write_u32(&mut buf[12..16], self.start_col);
        LittleEndian::write_u32(&mut buf[16..20], self.num_rows);
        LittleEndian::write_u32(&mut buf[20..24], self.num_cols);
        buf[24] = self.level_num;
        // 25..32 stay zero
        buf
    }

    pub fn decode(buf: &[u8; LEVEL_RECORD_SIZE]) -> Self {
        Self {
            tile_records_offset: LittleEndian::read_u32(&buf[0..4]),
            total_stored_tiles: LittleEndian::read_u32(&buf[4..8]),
            start_row: LittleEndian::read_u32(&buf[8..12]),
            start_col: LittleEndian::read_u32(&buf[12..16]),
            num_rows: LittleEndian::read_u32(&buf[16..20]),
            num_cols: LittleEndian::read_u32(&buf[20..24]),
            level_num: buf[24],
        }
    }
}

/// One cell of a level's tile array. A zero `data_len` means the tile was
/// never stored, which is why zero-length tiles are rejected at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRecord {
    /// Offset of the payload in the logical concatenation of all split
    /// flat files.
    pub data_offset: u64,
    pub data_len: u32,
}

impl TileRecord {
    pub fn encode(&self) -> [u8; TILE_RECORD_SIZE] {
        let mut buf = [0u8; TILE_RECORD_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.data_offset);
        LittleEndian::write_u32(&mut buf[8..12], self.data_len);
        // 12..16 stay zero
        buf
    }

    pub fn decode(buf: &[u8; TILE_RECORD_SIZE]) -> Self {
        Self {
            data_offset: LittleEndian::read_u64(&buf[0..8]),
            data_len: LittleEndian::read_u32(&buf[8..12]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn header_round_trip() {
        let hdr = Header {
            index_format_version: INDEX_FORMAT_VERSION,
            total_ff_size: 0x1234_5678_9abc,
            total_index_size: 4096,
            total_stored_tiles: 17,
            ff_type: 2,
            num_levels: 3,
            type_data: *b"0123456789abcdef",
        };
        let buf = hdr.encode();
        assert!(Header::has_magic(&buf));
        assert_eq!(Header::decode(&buf), hdr);
    }

    #[test]
    fn header_magic_is_checked() {
        let hdr = Header {
            index_format_version: 1,
            total_ff_size: 0,
            total_index_size: 64,
            total_stored_tiles: 0,
            ff_type: 0,
            num_levels: 0,
            type_data: [0; TYPE_DATA_SIZE],
        };
        let mut buf = hdr.encode();
        buf[0] ^= 0xff;
        assert!(!Header::has_magic(&buf));
        // a zero-filled header (crashed writer) fails the magic check too
        assert!(!Header::has_magic(&[0u8; HEADER_SIZE]));
    }

    #[test]
    fn level_record_round_trip() {
        let ext = TileExtents::new(10, 14, 20, 25);
        let rec = LevelRecord::new(640, &ext, 7, 9);
        assert_eq!(rec.num_rows, 4);
        assert_eq!(rec.num_cols, 5);
        let decoded = LevelRecord::decode(&rec.encode());
        assert_eq!(decoded, rec);
        assert_eq!(decoded.extents(), Some(ext));
    }

    #[test]
    fn level_record_overflowing_bounds_have_no_extents() {
        let mut rec = LevelRecord::new(640, &TileExtents::new(0, 2, 0, 2), 7, 0);
        rec.start_row = u32::MAX;
        assert_eq!(rec.extents(), None);
        rec.start_row = 0;
        rec.num_cols = u32::MAX;
        rec.start_col = 2;
        assert_eq!(rec.extents(), None);
    }

    #[test]
    fn tile_record_round_trip() {
        let rec = TileRecord {
            data_offset: u64::from(u32::MAX) + 12345,
            data_len: 999,
        };
        assert_eq!(TileRecord::decode(&rec.encode()), rec);

        let absent = TileRecord::decode(&[0u8; TILE_RECORD_SIZE]);
        assert_eq!(absent.data_len, 0);
    }
}

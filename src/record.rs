//! On-disk flat-file record header
//!
//! Every tile payload in a flat file is preceded by this fixed 32-byte
//! big-endian header and followed by zero padding out to the next 32-byte
//! boundary. The padding keeps records aligned so binary diffs of rebuilt
//! files stay clean.

use byteorder::{BigEndian, ByteOrder};

use crate::types::TileAddr;

/// Size of the encoded record header in bytes.
pub const RECORD_HEADER_SIZE: usize = 32;

/// Payloads bigger than this are assumed to be corruption, not tiles.
pub const MAX_PAYLOAD_LEN: u32 = 3 * 1024 * 1024;

/// Payload length rounded up to the next multiple of 32.
pub fn padded_len(len: u32) -> u32 {
    (len + 31) & !31
}

/// Decoded flat-file record header.
///
/// Note the historical field names: `x` is the column and `y` is the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Payload bytes (before padding).
    pub len: u32,
    pub level: u32,
    /// Tile column.
    pub x: u32,
    /// Tile row.
    pub y: u32,
    /// Caller-defined tile version.
    pub vers: u32,
}

impl RecordHeader {
    pub fn new(len: u32, addr: &TileAddr, vers: u32) -> Self {
        Self {
            len,
            level: addr.level,
            x: addr.col,
            y: addr.row,
            vers,
        }
    }

    pub fn addr(&self) -> TileAddr {
        TileAddr::new(self.level, self.y, self.x)
    }

    /// Payload length rounded up to the record alignment.
    pub fn padded_len(&self) -> u32 {
        padded_len(self.len)
    }

    /// Total on-disk footprint: header plus padded payload.
    pub fn record_len(&self) -> u32 {
        RECORD_HEADER_SIZE as u32 + self.padded_len()
    }

    /// True when the header looks like a real record: plausible payload
    /// size, level within `max_level`, and x/y inside the level's grid.
    pub fn is_plausible(&self, max_level: u32) -> bool {
        if self.len > MAX_PAYLOAD_LEN || self.level > max_level {
            return false;
        }
        // levels past 63 hold more tiles per axis than u32 can address,
        // so any x/y passes; saturate instead of overflowing the shift
        let dim = 1u64.checked_shl(self.level).unwrap_or(u64::MAX);
        u64::from(self.x) < dim && u64::from(self.y) < dim
    }

    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        BigEndian::write_u32(&mut buf[0..4], self.len);
        BigEndian::write_u32(&mut buf[4..8], self.level);
        BigEndian::write_u32(&mut buf[8..12], self.x);
        BigEndian::write_u32(&mut buf[12..16], self.y);
        BigEndian::write_u32(&mut buf[16..20], self.vers);
        // bytes 20..32 stay zero
        buf
    }

    pub fn decode(buf: &[u8; RECORD_HEADER_SIZE]) -> Self {
        Self {
            len: BigEndian::read_u32(&buf[0..4]),
            level: BigEndian::read_u32(&buf[4..8]),
            x: BigEndian::read_u32(&buf[8..12]),
            y: BigEndian::read_u32(&buf[12..16]),
            vers: BigEndian::read_u32(&buf[16..20]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn padded_len_examples() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 32);
        assert_eq!(padded_len(31), 32);
        assert_eq!(padded_len(32), 32);
        assert_eq!(padded_len(33), 64);
    }

    #[test]
    fn encode_is_big_endian() {
        let hdr = RecordHeader::new(0x0102_0304, &TileAddr::new(5, 6, 7), 1);
        let buf = hdr.encode();
        assert_eq!(&buf[0..4], &[1, 2, 3, 4]);
        assert_eq!(&buf[4..8], &[0, 0, 0, 5]);
        // x is the column
        assert_eq!(&buf[8..12], &[0, 0, 0, 7]);
        assert_eq!(&buf[12..16], &[0, 0, 0, 6]);
        assert_eq!(&buf[20..32], &[0u8; 12]);
    }

    #[test]
    fn plausibility() {
        let good = RecordHeader::new(100, &TileAddr::new(5, 0, 0), 1);
        assert!(good.is_plausible(crate::types::MAX_FUSION_LEVEL));

        let too_big = RecordHeader::new(MAX_PAYLOAD_LEN + 1, &TileAddr::new(5, 0, 0), 1);
        assert!(!too_big.is_plausible(crate::types::MAX_FUSION_LEVEL));

        let deep = RecordHeader::new(100, &TileAddr::new(25, 0, 0), 1);
        assert!(!deep.is_plausible(crate::types::MAX_FUSION_LEVEL));
        assert!(deep.is_plausible(30));

        let out_of_grid = RecordHeader::new(100, &TileAddr::new(5, 32, 0), 1);
        assert!(!out_of_grid.is_plausible(crate::types::MAX_FUSION_LEVEL));

        // a level limit past the shift range must not panic
        let very_deep = RecordHeader::new(100, &TileAddr::new(70, 0, 0), 1);
        assert!(!very_deep.is_plausible(crate::types::MAX_FUSION_LEVEL));
        assert!(very_deep.is_plausible(u32::MAX));
    }

    proptest! {
        #[test]
        fn padded_len_laws(len in 0u32..=MAX_PAYLOAD_LEN) {
            let p = padded_len(len);
            prop_assert!(p >= len);
            prop_assert_eq!(p % 32, 0);
            prop_assert_eq!(padded_len(p), p);
            prop_assert!(p - len < 32);
        }

        #[test]
        fn header_round_trip(
            len in 0u32..=MAX_PAYLOAD_LEN,
            level in 0u32..=24,
            row_bits in 0u32..u32::MAX,
            col_bits in 0u32..u32::MAX,
            vers in 0u32..u32::MAX,
        ) {
            let dim = 1u32 << level;
            let addr = TileAddr::new(level, row_bits % dim, col_bits % dim);
            let hdr = RecordHeader::new(len, &addr, vers);
            let decoded = RecordHeader::decode(&hdr.encode());
            prop_assert_eq!(decoded, hdr);
            prop_assert_eq!(decoded.addr(), addr);
        }
    }
}

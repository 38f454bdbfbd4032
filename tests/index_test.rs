//! Index file integrity: header totals, lookups, corruption rejection

use std::path::Path;

use flatfile_store::{
    FfError, FfType, GridIndexedWriter, IndexReader, InsetCoverage, TileAddr, TileExtents,
};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

fn build_dataset(ffdir: &Path) -> InsetCoverage {
    let cov = InsetCoverage::new(
        4,
        vec![TileExtents::new(1, 3, 1, 3), TileExtents::new(2, 6, 2, 6)],
    )
    .unwrap();
    let mut writer =
        GridIndexedWriter::new(FfType::Tmesh, ffdir, &cov, Some(*b"terrain metadata")).unwrap();
    writer.write_packet(b"first tile", &TileAddr::new(4, 1, 2)).unwrap();
    writer.write_packet(b"second tile, longer", &TileAddr::new(5, 3, 4)).unwrap();
    writer.close().unwrap();
    cov
}

#[test]
fn header_totals_match_files() {
    let dir = tempdir().unwrap();
    let ffdir = dir.path().join("out");
    let cov = build_dataset(&ffdir);

    let idx_path = ffdir.join("pack.idx");
    let index = IndexReader::open(&idx_path).unwrap();

    assert_eq!(index.ff_type(), FfType::Tmesh);
    assert_eq!(index.type_data(), b"terrain metadata");
    assert_eq!(index.total_stored_tiles(), 2);
    assert_eq!(
        u64::from(index.total_index_size()),
        std::fs::metadata(&idx_path).unwrap().len()
    );
    // 10 -> 32 padded and 19 -> 32 padded, each plus a 32-byte header
    assert_eq!(index.total_ff_size(), 64 + 64);
    assert_eq!(
        index.total_ff_size(),
        std::fs::metadata(ffdir.join("pack.00")).unwrap().len()
    );

    // the coverage written survives the round trip through level records
    assert_eq!(index.populate_coverage().unwrap(), cov);
}

#[test]
fn lookups_return_payload_ranges() {
    let dir = tempdir().unwrap();
    let ffdir = dir.path().join("out");
    build_dataset(&ffdir);

    let index = IndexReader::open(&ffdir.join("pack.idx")).unwrap();

    // offsets point at the payload, past each record header
    assert_eq!(index.find_tile(&TileAddr::new(4, 1, 2)), Some((32, 10)));
    assert_eq!(index.find_tile(&TileAddr::new(5, 3, 4)), Some((96, 19)));

    assert!(index.has_tile(&TileAddr::new(4, 1, 2)));
    assert!(!index.has_tile(&TileAddr::new(4, 2, 2))); // in range, never stored
    assert_eq!(index.find_tile(&TileAddr::new(4, 0, 0)), None); // outside extents
    assert_eq!(index.find_tile(&TileAddr::new(9, 0, 0)), None); // level not indexed
}

#[test]
fn corruption_is_rejected_at_open() {
    let dir = tempdir().unwrap();
    let ffdir = dir.path().join("out");
    build_dataset(&ffdir);

    let idx_path = ffdir.join("pack.idx");
    let pristine = std::fs::read(&idx_path).unwrap();
    let corrupt_path = dir.path().join("corrupt.idx");
    let open_mutated = |mutate: &dyn Fn(&mut Vec<u8>)| {
        let mut bytes = pristine.clone();
        mutate(&mut bytes);
        std::fs::write(&corrupt_path, &bytes).unwrap();
        IndexReader::open(&corrupt_path)
    };

    // flipped magic byte
    assert!(matches!(
        open_mutated(&|b| b[0] ^= 0xff),
        Err(FfError::InvalidIndexFormat { .. })
    ));

    // unknown format version
    assert!(matches!(
        open_mutated(&|b| b[23] = 9),
        Err(FfError::UnsupportedIndexVersion { version: 9, .. })
    ));

    // header claims more bytes than the file holds (total_index_size)
    assert!(matches!(
        open_mutated(&|b| b[32..36].copy_from_slice(&u32::MAX.to_le_bytes())),
        Err(FfError::InvalidIndexFormat { .. })
    ));

    // first level record points its tile array past the end of the index
    assert!(matches!(
        open_mutated(&|b| b[64..68].copy_from_slice(&0x00ff_ffffu32.to_le_bytes())),
        Err(FfError::InvalidIndexFormat { .. })
    ));

    // level number beyond the deepest fusion level
    assert!(matches!(
        open_mutated(&|b| b[64 + 24] = 200),
        Err(FfError::InvalidIndexFormat { .. })
    ));

    // start_row so large the level's extents overflow u32
    assert!(matches!(
        open_mutated(&|b| b[64 + 8..64 + 12].copy_from_slice(&u32::MAX.to_le_bytes())),
        Err(FfError::InvalidIndexFormat { .. })
    ));

    // file truncated inside the header
    assert!(matches!(
        open_mutated(&|b| b.truncate(40)),
        Err(FfError::Io { .. })
    ));

    // the untouched original still opens
    assert!(IndexReader::open(&idx_path).is_ok());
}

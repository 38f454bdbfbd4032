//! Scanner validation, truncation handling and early termination

use std::path::Path;

use flatfile_store::{
    FfError, FfType, FlatFileScanner, RecordHeader, ScanControl, TileAddr, Writer,
    estimate_tile_count, scan,
};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

fn write_flat_file(ffdir: &Path, count: u32, payload_len: usize) {
    let mut writer = Writer::new(FfType::Raster, ffdir, u64::MAX).unwrap();
    for i in 0..count {
        writer
            .write_packet(&vec![i as u8; payload_len], &TileAddr::new(8, i, i))
            .unwrap();
    }
    writer.close().unwrap();
}

#[test]
fn scans_every_record_in_order() {
    let dir = tempdir().unwrap();
    write_flat_file(dir.path(), 25, 100);

    let mut count = 0u32;
    scan(&dir.path().join("pack.00"), |hdr, payload| {
        assert_eq!(hdr.addr(), TileAddr::new(8, count, count));
        assert_eq!(payload, vec![count as u8; 100]);
        count += 1;
        ScanControl::Continue
    })
    .unwrap();
    assert_eq!(count, 25);
}

#[test]
fn empty_file_scans_to_nothing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.ff");
    std::fs::write(&path, b"").unwrap();

    scan(&path, |_, _| panic!("no records expected")).unwrap();
    assert_eq!(estimate_tile_count(&path).unwrap(), 0);
}

#[test]
fn callback_stops_scan_early() {
    let dir = tempdir().unwrap();
    write_flat_file(dir.path(), 25, 100);

    let mut count = 0u32;
    scan(&dir.path().join("pack.00"), |_, _| {
        count += 1;
        if count == 3 { ScanControl::Stop } else { ScanControl::Continue }
    })
    .unwrap();
    assert_eq!(count, 3);
}

#[test]
fn small_windows_see_the_same_records() {
    let dir = tempdir().unwrap();
    write_flat_file(dir.path(), 200, 4000);

    // window smaller than the file forces remapping mid-scan
    let mut count = 0u32;
    FlatFileScanner::new()
        .window_size(64 * 1024)
        .scan(&dir.path().join("pack.00"), |hdr, payload| {
            assert_eq!(hdr.len as usize, payload.len());
            assert_eq!(payload[0], count as u8);
            count += 1;
            ScanControl::Continue
        })
        .unwrap();
    assert_eq!(count, 200);
}

#[test]
fn implausible_record_aborts_scan() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.ff");

    // a valid record followed by one whose row is outside its level's grid
    let good = RecordHeader::new(0, &TileAddr::new(3, 1, 1), 1);
    let bad = RecordHeader {
        len: 0,
        level: 3,
        x: 0,
        y: 99,
        vers: 1,
    };
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&good.encode());
    bytes.extend_from_slice(&bad.encode());
    std::fs::write(&path, &bytes).unwrap();

    let err = scan(&path, |_, _| ScanControl::Continue).unwrap_err();
    assert!(matches!(
        err,
        FfError::CorruptRecord { record: 1, y: 99, .. }
    ));
}

#[test]
fn deep_levels_need_an_explicit_limit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("deep.ff");

    let hdr = RecordHeader::new(0, &TileAddr::new(28, 5, 5), 1);
    std::fs::write(&path, hdr.encode()).unwrap();

    // level 28 is implausible under the default limit of 24
    assert!(matches!(
        scan(&path, |_, _| ScanControl::Continue),
        Err(FfError::CorruptRecord { level: 28, .. })
    ));

    let mut count = 0;
    FlatFileScanner::new()
        .max_level(30)
        .scan(&path, |_, _| {
            count += 1;
            ScanControl::Continue
        })
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn truncation_is_reported() {
    let dir = tempdir().unwrap();
    write_flat_file(dir.path(), 3, 100);
    let path = dir.path().join("pack.00");

    let bytes = std::fs::read(&path).unwrap();
    let record_len = bytes.len() / 3;

    // cut inside the last record's payload
    let cut_payload = dir.path().join("cut_payload.ff");
    std::fs::write(&cut_payload, &bytes[..bytes.len() - 10]).unwrap();
    assert!(matches!(
        scan(&cut_payload, |_, _| ScanControl::Continue),
        Err(FfError::TruncatedFile { record: 2, .. })
    ));

    // cut inside the last record's header
    let cut_header = dir.path().join("cut_header.ff");
    std::fs::write(&cut_header, &bytes[..2 * record_len + 10]).unwrap();
    assert!(matches!(
        scan(&cut_header, |_, _| ScanControl::Continue),
        Err(FfError::TruncatedFile { record: 2, .. })
    ));
}

#[test]
fn tile_count_estimate_is_exact_for_uniform_records() {
    let dir = tempdir().unwrap();
    write_flat_file(dir.path(), 40, 100);
    assert_eq!(estimate_tile_count(&dir.path().join("pack.00")).unwrap(), 40);

    // fewer than 10 records still gets an answer
    let small = tempdir().unwrap();
    write_flat_file(small.path(), 4, 100);
    assert_eq!(estimate_tile_count(&small.path().join("pack.00")).unwrap(), 4);
}

//! Validation and block assembly against the HEX fixtures.

use hidboot::image::NOP;
use hidboot::{Error, MemoryLayout, ProgramBlock, ProgramBlocks, validate_file};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn layout() -> MemoryLayout {
    MemoryLayout::new(0x4000, 0x3FFF)
}

fn blocks(name: &str) -> Vec<ProgramBlock> {
    let file = File::open(fixture(name)).unwrap();
    ProgramBlocks::new(BufReader::new(file), &layout())
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap()
}

/// Expected flash content of a fixture, NOP at every gap.
fn flatten(records: &[(u32, usize)]) -> Vec<u8> {
    let payload = |addr: u32, i: usize| ((addr as usize + i) * 7 + 3) as u8;
    let end = records
        .iter()
        .map(|(a, n)| *a as usize + n)
        .max()
        .unwrap();
    let mut image = vec![NOP; end - 0x4000];
    for &(addr, n) in records {
        for i in 0..n {
            image[addr as usize - 0x4000 + i] = payload(addr, i);
        }
    }
    image
}

#[test]
fn test_83_line_fixture() {
    let summary = validate_file(fixture("app_83.hex"), &layout()).unwrap();
    assert_eq!(summary.line_count, 83);
    assert_eq!(summary.start_address, 0x4000);
    assert_eq!(summary.end_address, 0x4500);
    assert_eq!(summary.end_byte_count, 16);
    assert_eq!(summary.transfer_size(), 81 * 16);
}

#[test]
fn test_40_line_fixture_with_crlf() {
    let summary = validate_file(fixture("app_40.hex"), &layout()).unwrap();
    assert_eq!(summary.line_count, 40);
    assert_eq!(summary.end_address, 0x4300);
    assert_eq!(summary.end_byte_count, 8);
    assert_eq!(summary.transfer_size(), 0x308);
}

#[test]
fn test_validation_is_repeatable() {
    let first = validate_file(fixture("app_40.hex"), &layout()).unwrap();
    let second = validate_file(fixture("app_40.hex"), &layout()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_missing_eof_fixture() {
    let err = validate_file(fixture("missing_eof.hex"), &layout()).unwrap_err();
    assert!(matches!(err, Error::NoEndOfFile { records: 82 }));
}

#[test]
fn test_no_colon_fixture() {
    let err = validate_file(fixture("no_colon.hex"), &layout()).unwrap_err();
    assert!(matches!(err, Error::Syntax { line: 1, .. }));
}

#[test]
fn test_protected_fixture() {
    let err = validate_file(fixture("protected.hex"), &layout()).unwrap_err();
    assert!(matches!(
        err,
        Error::ProtectedAddress {
            line: 1,
            address: 0x3FF0,
            ..
        }
    ));
}

#[test]
fn test_bad_checksum_fixture() {
    let err = validate_file(fixture("bad_checksum.hex"), &layout()).unwrap_err();
    match err {
        Error::Checksum {
            line,
            expected,
            actual,
        } => {
            assert_eq!(line, 11);
            assert_eq!(actual, expected.wrapping_add(1));
        },
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_relocated_fixture() {
    let err = validate_file(fixture("relocated.hex"), &layout()).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidStartAddress {
            expected: 0x4000,
            actual: 0x8000
        }
    ));
}

#[test]
fn test_83_line_blocks_reconstruct_image() {
    let blocks = blocks("app_83.hex");
    assert_eq!(blocks.len(), 41);
    for block in &blocks[..40] {
        assert_eq!(block.len(), 32);
    }
    assert_eq!(blocks[40].len(), 16);

    let records: Vec<(u32, usize)> = (0..81).map(|i| (0x4000 + 16 * i, 16)).collect();
    let joined: Vec<u8> = blocks.iter().flat_map(|b| b.data.clone()).collect();
    assert_eq!(joined, flatten(&records));
}

#[test]
fn test_40_line_blocks_pad_the_gap() {
    let blocks = blocks("app_40.hex");
    // 10 data blocks, 6 all-NOP gap blocks, 8 data blocks, 1 short tail.
    assert_eq!(blocks.len(), 25);
    assert!(blocks[10..16].iter().all(|b| b.data == vec![NOP; 32]));
    assert_eq!(blocks[24].address, 0x4300);
    assert_eq!(blocks[24].len(), 8);

    let mut records: Vec<(u32, usize)> = (0..20).map(|i| (0x4000 + 16 * i, 16)).collect();
    records.extend((0..16).map(|i| (0x4200 + 16 * i, 16)));
    records.push((0x4300, 8));
    let joined: Vec<u8> = blocks.iter().flat_map(|b| b.data.clone()).collect();
    assert_eq!(joined, flatten(&records));

    // Blocks are contiguous.
    for pair in blocks.windows(2) {
        assert_eq!(pair[0].address + pair[0].len() as u32, pair[1].address);
    }
}

//! Intel-HEX record decoding.
//!
//! Each call to [`read_next`] consumes one `:`-prefixed line:
//!
//! ```text
//! :LL AAAA TT DD..DD CC
//!  |   |    |   |     +-- checksum (sum of all bytes == 0 mod 256)
//!  |   |    |   +-------- LL data bytes
//!  |   |    +------------ record type
//!  |   +----------------- 16-bit address (big-endian)
//!  +--------------------- data length
//! ```
//!
//! Extended address records only update the [`ParserState`]; the reader
//! skips over them and returns the next data-bearing record with its
//! address fully resolved.

use crate::error::{Error, Result};
use crate::protocol::checksum::checksum8;
use log::trace;
use std::io::BufRead;

/// Lowest accepted extended segment value.
pub const MIN_SEGMENT: u16 = 0x1000;

/// Highest accepted extended segment value.
pub const MAX_SEGMENT: u16 = 0xF000;

/// Intel-HEX record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Data record (0x00).
    Data = 0x00,
    /// End of file (0x01).
    EndOfFile = 0x01,
    /// Extended segment address (0x02).
    ExtendedSegmentAddress = 0x02,
    /// Start segment address (0x03).
    StartSegmentAddress = 0x03,
    /// Extended linear address (0x04).
    ExtendedLinearAddress = 0x04,
    /// Start linear address (0x05).
    StartLinearAddress = 0x05,
}

impl RecordType {
    /// Decode a type byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Data),
            0x01 => Some(Self::EndOfFile),
            0x02 => Some(Self::ExtendedSegmentAddress),
            0x03 => Some(Self::StartSegmentAddress),
            0x04 => Some(Self::ExtendedLinearAddress),
            0x05 => Some(Self::StartLinearAddress),
            _ => None,
        }
    }
}

/// How extended address records map onto absolute addresses.
///
/// Bootloaders for different board generations disagree on this, so the
/// mode is picked per target rather than assumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum AddressingMode {
    /// `segment_base + linear_base + offset`, per the Intel-HEX definition.
    #[default]
    SegmentLinear,
    /// Single linear base taken from the low byte of 0x04 records only.
    /// Segment records are validated and ignored.
    LinearLowByte,
}

/// A decoded data-bearing record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    /// Number of data bytes.
    pub byte_count: u8,
    /// Absolute address after extended-address resolution.
    pub address: u32,
    /// Record type (`Data` or `EndOfFile`).
    pub record_type: RecordType,
    /// Payload.
    pub data: Vec<u8>,
    /// Checksum byte as found in the source.
    pub checksum: u8,
}

impl HexRecord {
    /// Whether this record terminates the image (`byte_count == 0`).
    pub fn is_terminator(&self) -> bool {
        self.byte_count == 0
    }
}

/// Reader state threaded through every [`read_next`] call.
///
/// A fresh state starts every pass over a file, so nothing leaks between
/// validation and programming runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserState {
    mode: AddressingMode,
    segment_base: u32,
    linear_base: u32,
    records: u32,
    line: u32,
}

impl ParserState {
    /// Initial state for the given addressing mode.
    pub fn new(mode: AddressingMode) -> Self {
        Self {
            mode,
            segment_base: 0,
            linear_base: 0,
            records: 0,
            line: 0,
        }
    }

    /// Addressing mode in use.
    pub fn mode(&self) -> AddressingMode {
        self.mode
    }

    /// Current segment base (`value << 4`).
    pub fn segment_base(&self) -> u32 {
        self.segment_base
    }

    /// Current linear base (`value << 16`).
    pub fn linear_base(&self) -> u32 {
        self.linear_base
    }

    /// Number of `:` records consumed so far, control records included.
    pub fn records(&self) -> u32 {
        self.records
    }

    /// Physical line number of the last line read.
    pub fn line(&self) -> u32 {
        self.line
    }

    fn resolve(&self, offset: u16) -> u32 {
        self.segment_base
            .wrapping_add(self.linear_base)
            .wrapping_add(u32::from(offset))
    }
}

/// Result of one [`read_next`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A data or end-of-file record.
    Record(HexRecord),
    /// The source ran out.
    EndOfStream,
}

/// Read the next data-bearing record from `source`.
///
/// Returns the outcome together with the updated state; `state` itself is
/// left untouched so callers can retry from a known point.
pub fn read_next<R: BufRead>(
    source: &mut R,
    state: ParserState,
) -> Result<(ReadOutcome, ParserState)> {
    let mut state = state;
    let mut raw = Vec::new();

    loop {
        raw.clear();
        if source.read_until(b'\n', &mut raw)? == 0 {
            return Ok((ReadOutcome::EndOfStream, state));
        }
        state.line += 1;

        let line = raw.trim_ascii();
        if line.is_empty() {
            continue;
        }

        let Some(body) = line.strip_prefix(b":") else {
            return Err(Error::syntax(state.line, "line does not start with ':'"));
        };

        let bytes = decode_hex(body, state.line)?;
        state.records += 1;

        let record = parse_record(&bytes, state.line)?;
        trace!(
            "line {}: type {:?}, {} bytes @ {:#06x}",
            state.line, record.record_type, record.byte_count, record.offset
        );

        match record.record_type {
            RecordType::EndOfFile if record.byte_count != 0 => {
                return Err(Error::syntax(
                    state.line,
                    format!(
                        "end-of-file record carries {} data bytes",
                        record.byte_count
                    ),
                ));
            },
            RecordType::Data | RecordType::EndOfFile => {
                let hex = HexRecord {
                    byte_count: record.byte_count,
                    address: state.resolve(record.offset),
                    record_type: record.record_type,
                    data: record.data.to_vec(),
                    checksum: record.checksum,
                };
                return Ok((ReadOutcome::Record(hex), state));
            },
            RecordType::ExtendedSegmentAddress => {
                let value = expect_u16(&record, state.line)?;
                if state.mode == AddressingMode::SegmentLinear {
                    if !(MIN_SEGMENT..=MAX_SEGMENT).contains(&value) {
                        return Err(Error::InvalidSegmentAddress {
                            line: state.line,
                            value,
                        });
                    }
                    state.segment_base = u32::from(value) << 4;
                }
            },
            RecordType::ExtendedLinearAddress => {
                let value = expect_u16(&record, state.line)?;
                state.linear_base = match state.mode {
                    AddressingMode::SegmentLinear => u32::from(value) << 16,
                    AddressingMode::LinearLowByte => u32::from(value & 0x00FF) << 16,
                };
            },
            RecordType::StartSegmentAddress | RecordType::StartLinearAddress => {
                if record.data.len() != 4 {
                    return Err(Error::syntax(
                        state.line,
                        "start address record must carry 4 bytes",
                    ));
                }
            },
        }
    }
}

/// Borrowed view of one decoded line.
struct RawRecord<'a> {
    byte_count: u8,
    offset: u16,
    record_type: RecordType,
    data: &'a [u8],
    checksum: u8,
}

fn parse_record(bytes: &[u8], line: u32) -> Result<RawRecord<'_>> {
    // length + address(2) + type + checksum
    if bytes.len() < 5 {
        return Err(Error::syntax(line, "record is shorter than 5 bytes"));
    }

    let byte_count = bytes[0];
    if bytes.len() != usize::from(byte_count) + 5 {
        return Err(Error::syntax(
            line,
            format!(
                "length field says {byte_count} data bytes, line carries {}",
                bytes.len() - 5
            ),
        ));
    }

    let (body, tail) = bytes.split_at(bytes.len() - 1);
    let actual = tail[0];
    let expected = checksum8(body);
    if expected != actual {
        return Err(Error::Checksum {
            line,
            expected,
            actual,
        });
    }

    let record_type = RecordType::from_u8(bytes[3]).ok_or(Error::UnknownRecordType {
        line,
        record_type: bytes[3],
    })?;

    Ok(RawRecord {
        byte_count,
        offset: u16::from_be_bytes([bytes[1], bytes[2]]),
        record_type,
        data: &body[4..],
        checksum: actual,
    })
}

fn expect_u16(record: &RawRecord<'_>, line: u32) -> Result<u16> {
    match record.data {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(Error::syntax(line, "extended address record must carry 2 bytes")),
    }
}

fn decode_hex(digits: &[u8], line: u32) -> Result<Vec<u8>> {
    if digits.len() % 2 != 0 {
        return Err(Error::syntax(line, "odd number of hex digits"));
    }

    digits
        .chunks_exact(2)
        .map(|pair| match (nibble(pair[0]), nibble(pair[1])) {
            (Some(hi), Some(lo)) => Ok((hi << 4) | lo),
            _ => Err(Error::syntax(
                line,
                format!(
                    "invalid hex digits '{}'",
                    String::from_utf8_lossy(pair)
                ),
            )),
        })
        .collect()
}

fn nibble(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

/// Encode one record line (without newline), computing its checksum.
///
/// Used to build images in tests and tooling.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_line(record_type: RecordType, offset: u16, data: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut bytes = Vec::with_capacity(data.len() + 5);
    bytes.push(data.len() as u8);
    bytes.extend_from_slice(&offset.to_be_bytes());
    bytes.push(record_type as u8);
    bytes.extend_from_slice(data);
    bytes.push(checksum8(&bytes));

    let mut line = String::with_capacity(1 + bytes.len() * 2);
    line.push(':');
    for b in bytes {
        let _ = write!(line, "{b:02X}");
    }
    line
}

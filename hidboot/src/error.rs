//! Error types for hidboot.

use std::io;
use thiserror::Error;

/// Result type for hidboot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for hidboot operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (image file, report port).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial bridge error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Malformed HEX line (missing `:`, bad digits, length mismatch).
    #[error("Syntax error on line {line}: {reason}")]
    Syntax {
        /// Physical line number (1-based).
        line: u32,
        /// What was wrong with the line.
        reason: String,
    },

    /// HEX line checksum mismatch.
    #[error("Checksum mismatch on line {line}: expected {expected:#04x}, got {actual:#04x}")]
    Checksum {
        /// Physical line number (1-based).
        line: u32,
        /// Checksum computed from the record bytes.
        expected: u8,
        /// Checksum byte found in the file.
        actual: u8,
    },

    /// Record type outside 0x00..=0x05.
    #[error("Unknown record type {record_type:#04x} on line {line}")]
    UnknownRecordType {
        /// Physical line number (1-based).
        line: u32,
        /// Offending type byte.
        record_type: u8,
    },

    /// Extended segment address outside the accepted window.
    #[error("Extended segment address {value:#06x} on line {line} is outside 0x1000..=0xF000")]
    InvalidSegmentAddress {
        /// Physical line number (1-based).
        line: u32,
        /// Segment value from the record.
        value: u16,
    },

    /// Data record targets the bootloader's reserved region.
    #[error(
        "Line {line} writes to {address:#010x}, inside the bootloader region (<= {bootloader_end:#010x})"
    )]
    ProtectedAddress {
        /// Physical line number (1-based).
        line: u32,
        /// Resolved record address.
        address: u32,
        /// Last address reserved for the bootloader.
        bootloader_end: u32,
    },

    /// Image is not linked for the application origin.
    #[error("Image starts at {actual:#010x}, expected application start {expected:#010x}")]
    InvalidStartAddress {
        /// Application start address of the target.
        expected: u32,
        /// Address of the first data record.
        actual: u32,
    },

    /// Data record runs past the end of the 32-bit address space.
    #[error("Line {line}: {byte_count} bytes at {address:#010x} run past the 32-bit address space")]
    AddressOverflow {
        /// Physical line number (1-based).
        line: u32,
        /// Resolved record address.
        address: u32,
        /// Record length.
        byte_count: u8,
    },

    /// Source ended without an end-of-file record.
    #[error("No end-of-file record after {records} records")]
    NoEndOfFile {
        /// Records read before the source ran out.
        records: u32,
    },

    /// Image contains no data records.
    #[error("Image contains no data records")]
    EmptyImage,

    /// Record address went backwards while assembling blocks.
    #[error("Record at {address:#010x} overlaps already assembled data (next free {next_free:#010x})")]
    AddressOutOfOrder {
        /// Address of the offending record.
        address: u32,
        /// First address not yet written in the current block.
        next_free: u32,
    },

    /// Program frame checksum did not cancel the frame sum.
    #[error("Frame checksum {checksum:#06x} does not cancel frame sum {sum:#06x}")]
    FrameChecksum {
        /// Computed checksum.
        checksum: u16,
        /// Sum of the frame bytes it should cancel.
        sum: u16,
    },

    /// No response within the allowed time.
    #[error("Transport timeout: {0}")]
    TransportTimeout(String),

    /// Garbled or unexpected response.
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Link layer rejected one segment of a packet.
    #[error("Segment {segment} of {segments} rejected by the link")]
    SegmentRejected {
        /// Zero-based index of the rejected segment.
        segment: usize,
        /// Number of segments in the packet.
        segments: usize,
    },

    /// Response report carried the error flag.
    #[error("Target did not respond (error flag in report {report})")]
    RobotNoResponse {
        /// Zero-based index of the flagged response report.
        report: usize,
    },

    /// Too many NACK-driven rewinds for one block.
    #[error("Gave up on block at {address:#010x} after {rewinds} rewinds")]
    RewindLimitExceeded {
        /// Start address of the block being written.
        address: u32,
        /// Rewinds performed.
        rewinds: u32,
    },

    /// Operation cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn syntax(line: u32, reason: impl Into<String>) -> Self {
        Self::Syntax {
            line,
            reason: reason.into(),
        }
    }
}

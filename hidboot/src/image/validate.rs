//! Single-pass image validation.
//!
//! Runs before every programming run: the line count drives progress
//! reporting and the last data record sizes the transfer header.

use crate::error::{Error, Result};
use crate::image::MemoryLayout;
use crate::image::hex::{ParserState, ReadOutcome, read_next};
use log::debug;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// What a successful validation pass learned about an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ImageSummary {
    /// Records up to and including the end-of-file marker.
    pub line_count: u32,
    /// Address of the first data record.
    pub start_address: u32,
    /// Address of the last data record.
    pub end_address: u32,
    /// Byte count of the last data record.
    pub end_byte_count: u8,
}

impl ImageSummary {
    /// First address past the last data record.
    ///
    /// [`validate`] guarantees this fits in 32 bits; hand-built summaries
    /// saturate.
    pub fn end(&self) -> u32 {
        self.end_address
            .saturating_add(u32::from(self.end_byte_count))
    }

    /// Bytes from the application start to the end of the last data record.
    pub fn transfer_size(&self) -> u32 {
        self.end()
            .saturating_sub(self.start_address)
    }
}

/// Validate an image read from `source` against `layout`.
pub fn validate<R: BufRead>(mut source: R, layout: &MemoryLayout) -> Result<ImageSummary> {
    let mut state = ParserState::new(layout.addressing);
    let mut first: Option<u32> = None;
    let mut last: Option<(u32, u8)> = None;

    loop {
        let (outcome, next) = read_next(&mut source, state)?;
        state = next;

        let record = match outcome {
            ReadOutcome::Record(record) => record,
            ReadOutcome::EndOfStream => {
                return Err(Error::NoEndOfFile {
                    records: state.records(),
                });
            },
        };

        if record.is_terminator() {
            let (Some(start_address), Some((end_address, end_byte_count))) = (first, last) else {
                return Err(Error::EmptyImage);
            };
            let summary = ImageSummary {
                line_count: state.records(),
                start_address,
                end_address,
                end_byte_count,
            };
            debug!(
                "Image valid: {} records, {:#010x}..{:#010x}",
                summary.line_count,
                summary.start_address,
                summary.end()
            );
            return Ok(summary);
        }

        if record.address <= layout.bootloader_end {
            return Err(Error::ProtectedAddress {
                line: state.line(),
                address: record.address,
                bootloader_end: layout.bootloader_end,
            });
        }

        if record
            .address
            .checked_add(u32::from(record.byte_count))
            .is_none()
        {
            return Err(Error::AddressOverflow {
                line: state.line(),
                address: record.address,
                byte_count: record.byte_count,
            });
        }

        if first.is_none() {
            if record.address != layout.app_start {
                return Err(Error::InvalidStartAddress {
                    expected: layout.app_start,
                    actual: record.address,
                });
            }
            first = Some(record.address);
        }

        last = Some((record.address, record.byte_count));
    }
}

/// Validate the image stored at `path`.
pub fn validate_file<P: AsRef<Path>>(path: P, layout: &MemoryLayout) -> Result<ImageSummary> {
    let path = path.as_ref();
    debug!("Validating HEX image: {}", path.display());
    let file = File::open(path)?;
    validate(BufReader::new(file), layout)
}

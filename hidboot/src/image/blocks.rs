//! Assembly of HEX records into fixed-size program blocks.
//!
//! Blocks are laid out contiguously from the application start. Gaps are
//! filled with [`NOP`], and a record that crosses a block boundary is split,
//! its tail carried into the next block.

use crate::error::{Error, Result};
use crate::image::MemoryLayout;
use crate::image::hex::{HexRecord, ParserState, ReadOutcome, read_next};
use log::trace;
use std::io::BufRead;

/// Fill byte for unprogrammed gaps.
pub const NOP: u8 = 0x00;

/// Largest block a program frame can describe (one-byte count field).
pub const MAX_BLOCK_SIZE: usize = 0xFF;

/// One contiguous chunk of flash content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramBlock {
    /// Target address of `data[0]`.
    pub address: u32,
    /// Block content; shorter than the block size only for the final block.
    pub data: Vec<u8>,
}

impl ProgramBlock {
    /// Number of bytes in the block.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the block carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Iterator over the program blocks of a HEX source.
///
/// Yields `Err` at most once; the iterator is exhausted afterwards.
pub struct ProgramBlocks<R> {
    source: R,
    state: ParserState,
    block_size: usize,
    start: u32,
    fill: usize,
    buffer: Vec<u8>,
    pending: Option<HexRecord>,
    finished: bool,
}

impl<R: BufRead> ProgramBlocks<R> {
    /// Start assembling blocks from `source` at `layout.app_start`.
    pub fn new(source: R, layout: &MemoryLayout) -> Result<Self> {
        layout.check()?;

        Ok(Self {
            source,
            state: ParserState::new(layout.addressing),
            block_size: layout.block_size,
            start: layout.app_start,
            fill: 0,
            buffer: vec![NOP; layout.block_size],
            pending: None,
            finished: false,
        })
    }

    /// HEX records read from the source so far, control records included.
    pub fn records_consumed(&self) -> u32 {
        self.state.records()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn block_end(&self) -> u32 {
        self.start.wrapping_add(self.block_size as u32)
    }

    fn take_block(&mut self, len: usize) -> ProgramBlock {
        let mut data = std::mem::replace(&mut self.buffer, vec![NOP; self.block_size]);
        data.truncate(len);
        let block = ProgramBlock {
            address: self.start,
            data,
        };
        self.start = self.block_end();
        self.fill = 0;
        trace!("Assembled block @ {:#010x} ({} bytes)", block.address, block.len());
        block
    }

    fn next_record(&mut self) -> Result<Option<HexRecord>> {
        if let Some(record) = self.pending.take() {
            return Ok(Some(record));
        }
        let (outcome, state) = read_next(&mut self.source, self.state)?;
        self.state = state;
        Ok(match outcome {
            ReadOutcome::Record(record) => Some(record),
            ReadOutcome::EndOfStream => None,
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn step(&mut self) -> Result<Option<ProgramBlock>> {
        loop {
            let Some(record) = self.next_record()? else {
                return Err(Error::NoEndOfFile {
                    records: self.state.records(),
                });
            };

            if record.is_terminator() {
                self.finished = true;
                if self.fill == 0 {
                    return Ok(None);
                }
                return Ok(Some(self.take_block(self.fill)));
            }

            let block_end = self.block_end();
            if record.address >= block_end {
                self.pending = Some(record);
                return Ok(Some(self.take_block(self.block_size)));
            }

            let next_free = self.start.wrapping_add(self.fill as u32);
            if record.address < next_free {
                return Err(Error::AddressOutOfOrder {
                    address: record.address,
                    next_free,
                });
            }

            let offset = (record.address - self.start) as usize;
            let take = record.data.len().min(self.block_size - offset);
            self.buffer[offset..offset + take].copy_from_slice(&record.data[..take]);
            self.fill = offset + take;

            if take < record.data.len() {
                let rest = record.data[take..].to_vec();
                self.pending = Some(HexRecord {
                    byte_count: rest.len() as u8,
                    address: block_end,
                    record_type: record.record_type,
                    data: rest,
                    checksum: record.checksum,
                });
            }

            if self.fill == self.block_size {
                return Ok(Some(self.take_block(self.block_size)));
            }
        }
    }
}

impl<R: BufRead> Iterator for ProgramBlocks<R> {
    type Item = Result<ProgramBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.step() {
            Ok(Some(block)) => Some(Ok(block)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::hex::{RecordType, encode_line};
    use std::io::Cursor;

    fn layout(block_size: usize) -> MemoryLayout {
        MemoryLayout::new(0x4000, 0x3FFF).with_block_size(block_size)
    }

    fn source(records: &[(u16, Vec<u8>)], eof: bool) -> Cursor<Vec<u8>> {
        let mut lines: Vec<String> = records
            .iter()
            .map(|(offset, data)| encode_line(RecordType::Data, *offset, data))
            .collect();
        if eof {
            lines.push(encode_line(RecordType::EndOfFile, 0, &[]));
        }
        Cursor::new(lines.join("\n").into_bytes())
    }

    fn collect(src: Cursor<Vec<u8>>, block_size: usize) -> Result<Vec<ProgramBlock>> {
        ProgramBlocks::new(src, &layout(block_size))?.collect()
    }

    #[test]
    fn test_contiguous_records_fill_blocks() {
        let src = source(
            &[
                (0x4000, vec![1; 16]),
                (0x4010, vec![2; 16]),
                (0x4020, vec![3; 16]),
                (0x4030, vec![4; 16]),
            ],
            true,
        );
        let blocks = collect(src, 32).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].address, 0x4000);
        assert_eq!(&blocks[0].data[..16], &[1; 16]);
        assert_eq!(&blocks[0].data[16..], &[2; 16]);
        assert_eq!(blocks[1].address, 0x4020);
        assert_eq!(blocks[1].len(), 32);
    }

    #[test]
    fn test_final_block_is_short() {
        let src = source(&[(0x4000, vec![0xAA; 16]), (0x4010, vec![0xBB; 8])], true);
        let blocks = collect(src, 32).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].len(), 24);
        assert_eq!(&blocks[0].data[16..], &[0xBB; 8]);
    }

    #[test]
    fn test_gap_inside_block_is_nop_filled() {
        let src = source(&[(0x4000, vec![1; 4]), (0x4008, vec![2; 4])], true);
        let blocks = collect(src, 32).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].data, vec![1, 1, 1, 1, NOP, NOP, NOP, NOP, 2, 2, 2, 2]);
    }

    #[test]
    fn test_record_straddling_boundary_is_split() {
        let data: Vec<u8> = (0..16).collect();
        let src = source(&[(0x4000, vec![0xEE; 24]), (0x4018, data.clone())], true);
        let blocks = collect(src, 32).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(&blocks[0].data[24..], &data[..8]);
        assert_eq!(blocks[1].address, 0x4020);
        assert_eq!(blocks[1].data, data[8..].to_vec());
    }

    #[test]
    fn test_record_spanning_several_blocks() {
        let data: Vec<u8> = (0..40).collect();
        let src = source(&[(0x4000, data.clone())], true);
        let blocks = collect(src, 16).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].data, data[..16].to_vec());
        assert_eq!(blocks[1].data, data[16..32].to_vec());
        assert_eq!(blocks[2].address, 0x4020);
        assert_eq!(blocks[2].data, data[32..].to_vec());
    }

    #[test]
    fn test_gap_past_block_pads_and_emits_empty_blocks() {
        let src = source(&[(0x4000, vec![1; 4]), (0x4040, vec![2; 4])], true);
        let blocks = collect(src, 32).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].len(), 32);
        assert_eq!(&blocks[0].data[4..], &[NOP; 28]);
        assert_eq!(blocks[1].address, 0x4020);
        assert_eq!(blocks[1].data, vec![NOP; 32]);
        assert_eq!(blocks[2].address, 0x4040);
        assert_eq!(blocks[2].data, vec![2; 4]);
    }

    #[test]
    fn test_exact_fit_emits_without_trailing_block() {
        let src = source(&[(0x4000, vec![7; 32])], true);
        let blocks = collect(src, 32).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].len(), 32);
    }

    #[test]
    fn test_backwards_address_is_rejected() {
        let src = source(&[(0x4000, vec![1; 8]), (0x4004, vec![2; 4])], true);
        let err = collect(src, 32).unwrap_err();
        assert!(matches!(
            err,
            Error::AddressOutOfOrder {
                address: 0x4004,
                next_free: 0x4008
            }
        ));
    }

    #[test]
    fn test_missing_eof() {
        let src = source(&[(0x4000, vec![1; 8])], false);
        let mut blocks = ProgramBlocks::new(src, &layout(32)).unwrap();
        assert!(matches!(
            blocks.next(),
            Some(Err(Error::NoEndOfFile { records: 1 }))
        ));
        assert!(blocks.next().is_none());
    }

    #[test]
    fn test_records_consumed_counts_source_lines() {
        let src = source(&[(0x4000, vec![1; 16]), (0x4010, vec![2; 16])], true);
        let mut blocks = ProgramBlocks::new(src, &layout(32)).unwrap();
        blocks.next().unwrap().unwrap();
        assert_eq!(blocks.records_consumed(), 2);
        assert!(blocks.next().is_none());
        assert_eq!(blocks.records_consumed(), 3);
    }

    #[test]
    fn test_invalid_block_size() {
        let src = source(&[], true);
        assert!(matches!(
            ProgramBlocks::new(src, &layout(0)),
            Err(Error::Config(_))
        ));
    }
}

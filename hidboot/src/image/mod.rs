//! Firmware image handling: Intel-HEX decoding, validation and block assembly.

pub mod blocks;
pub mod hex;
pub mod validate;

use crate::error::{Error, Result};

pub use blocks::{MAX_BLOCK_SIZE, NOP, ProgramBlock, ProgramBlocks};
pub use hex::{AddressingMode, HexRecord, ParserState, ReadOutcome, RecordType, read_next};
pub use validate::{ImageSummary, validate, validate_file};

/// Default program block size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 32;

/// Flash layout of a target, as seen by the image pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryLayout {
    /// Address the application must be linked at.
    pub app_start: u32,
    /// Last address reserved for the bootloader itself.
    pub bootloader_end: u32,
    /// Program block size in bytes.
    pub block_size: usize,
    /// Extended address interpretation.
    pub addressing: AddressingMode,
}

impl MemoryLayout {
    /// Layout with the default block size and addressing mode.
    pub fn new(app_start: u32, bootloader_end: u32) -> Self {
        Self {
            app_start,
            bootloader_end,
            block_size: DEFAULT_BLOCK_SIZE,
            addressing: AddressingMode::default(),
        }
    }

    /// Set the block size.
    #[must_use]
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the addressing mode.
    #[must_use]
    pub fn with_addressing(mut self, addressing: AddressingMode) -> Self {
        self.addressing = addressing;
        self
    }

    /// Reject layouts the block pipeline cannot work with.
    pub fn check(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(Error::Config(format!(
                "block size must be 1..={MAX_BLOCK_SIZE}, got {}",
                self.block_size
            )));
        }
        if self.app_start <= self.bootloader_end {
            return Err(Error::Config(format!(
                "application start {:#010x} lies inside the bootloader region (<= {:#010x})",
                self.app_start, self.bootloader_end
            )));
        }
        Ok(())
    }
}

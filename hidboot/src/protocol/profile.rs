//! Opcode tables for the report link.
//!
//! Every control-board revision speaks the same protocol with different
//! numeric opcodes. A [`ProtocolProfile`] captures one such table; it is
//! picked once when the link is built and never consulted by name again.

use crate::error::{Error, Result};

/// Transport mode requested with a mode-switch report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Target forwards reports to the bootloader.
    Bootload,
    /// Target resumes its regular command handling.
    Normal,
}

/// Numeric opcode table for one hardware revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProtocolProfile {
    /// Packet fits one report.
    pub single: u8,
    /// First report of a multi-report packet.
    pub first: u8,
    /// Middle report of a multi-report packet.
    pub middle: u8,
    /// Last report of a multi-report packet.
    pub last: u8,
    /// Transmit to target, acknowledged.
    pub transmit: u8,
    /// Transmit to target, fire and forget.
    pub transmit_no_ack: u8,
    /// Receive from target.
    pub receive: u8,
    /// Receive from target, forwarding a command first.
    pub receive_forward: u8,
    /// Tag on each inbound response report.
    pub receive_continue: u8,
    /// Switch the link to bootload mode.
    pub mode_bootload: u8,
    /// Switch the link back to normal mode.
    pub mode_normal: u8,
    /// Segment accepted.
    pub done: u8,
    /// Segment rejected.
    pub failed: u8,
    /// Mode switch acknowledged.
    pub mode_ack: u8,
    /// Byte the bootloader sends when the previous frame was not written.
    pub flash_nack: u8,
    /// Value of the error flag in inbound response reports.
    pub error_flag: u8,
}

impl ProtocolProfile {
    /// First-generation control board.
    pub const REV_A: Self = Self {
        single: 0x10,
        first: 0x11,
        middle: 0x12,
        last: 0x13,
        transmit: 0x20,
        transmit_no_ack: 0x21,
        receive: 0x30,
        receive_forward: 0x31,
        receive_continue: 0x32,
        mode_bootload: 0x40,
        mode_normal: 0x41,
        done: 0x80,
        failed: 0x81,
        mode_ack: 0x82,
        flash_nack: 0x15,
        error_flag: 0x01,
    };

    /// Second-generation control board.
    pub const REV_B: Self = Self {
        single: 0x01,
        first: 0x02,
        middle: 0x03,
        last: 0x04,
        transmit: 0x05,
        transmit_no_ack: 0x06,
        receive: 0x07,
        receive_forward: 0x08,
        receive_continue: 0x09,
        mode_bootload: 0x0A,
        mode_normal: 0x0B,
        done: 0xA0,
        failed: 0xA1,
        mode_ack: 0xA2,
        flash_nack: 0x15,
        error_flag: 0x01,
    };

    /// Third-generation control board.
    pub const REV_C: Self = Self {
        single: 0x51,
        first: 0x52,
        middle: 0x53,
        last: 0x54,
        transmit: 0x60,
        transmit_no_ack: 0x61,
        receive: 0x70,
        receive_forward: 0x71,
        receive_continue: 0x72,
        mode_bootload: 0x7E,
        mode_normal: 0x7F,
        done: 0x06,
        failed: 0x15,
        mode_ack: 0x07,
        flash_nack: 0xEE,
        error_flag: 0xFF,
    };

    /// Opcode of the mode-switch report for `mode`.
    pub fn mode_opcode(&self, mode: LinkMode) -> u8 {
        match mode {
            LinkMode::Bootload => self.mode_bootload,
            LinkMode::Normal => self.mode_normal,
        }
    }

    /// Reject tables the link could not tell apart on the wire.
    pub fn check(&self) -> Result<()> {
        let segments = [self.single, self.first, self.middle, self.last];
        for (i, a) in segments.iter().enumerate() {
            if segments[i + 1..].contains(a) {
                return Err(Error::Config(format!(
                    "segment opcode {a:#04x} is used twice"
                )));
            }
        }

        let responses = [self.done, self.failed, self.mode_ack];
        if responses[0] == responses[1] || responses[0] == responses[2] || responses[1] == responses[2] {
            return Err(Error::Config(
                "done, failed and mode-ack codes must differ".to_string(),
            ));
        }

        if self.mode_bootload == self.mode_normal {
            return Err(Error::Config(
                "bootload and normal mode opcodes must differ".to_string(),
            ));
        }

        if self.error_flag == 0 {
            return Err(Error::Config("error flag value must be non-zero".to_string()));
        }

        Ok(())
    }
}

impl Default for ProtocolProfile {
    fn default() -> Self {
        Self::REV_A
    }
}

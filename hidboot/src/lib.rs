//! # hidboot
//!
//! A library for streaming Intel-HEX firmware to a microcontroller
//! bootloader behind a 65-byte report link.
//!
//! This crate provides:
//!
//! - Intel-HEX decoding and single-pass image validation
//! - Assembly of HEX records into fixed-size, NOP-padded program blocks
//! - Link framing (single/first/middle/last segments) over 65-byte reports
//! - The flash write protocol with NACK-driven rewind and retransmit
//! - A bootload orchestrator with progress events and cancellation
//!
//! ## Board Revisions
//!
//! Each control-board revision has its own opcode table and HEX addressing
//! rule; see [`BoardRevision`] and [`ProtocolProfile`].
//!
//! ## Features
//!
//! - `native` (default): serial/CDC bridge support via `serialport`
//! - `serde`: Serialization support for configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use hidboot::{MemoryLayout, validate_file};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let summary = validate_file("firmware.hex", &MemoryLayout::new(0x4000, 0x3FFF))?;
//!     println!("{} lines, {} bytes", summary.line_count, summary.transfer_size());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod target;
pub mod transport;

/// Cooperative cancellation flag shared between a caller and a run.
///
/// Clones observe the same flag. The orchestrator checks it once before
/// every program block, never inside a rewind sequence.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0
            .store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0
            .load(Ordering::SeqCst)
    }
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    error::{Error, Result},
    image::{
        AddressingMode, HexRecord, ImageSummary, MemoryLayout, ProgramBlock, ProgramBlocks,
        validate, validate_file,
    },
    port::{Port, SerialConfig},
    protocol::{Link, LinkMode, LinkTimeouts, ProtocolProfile, TargetChannel},
    target::{
        BoardRevision, BootState, Bootloader, EventSink, FlashEvent, FlashSummary, TargetConfig,
        spawn_programming,
    },
    transport::{REPORT_SIZE, Report, ReportPort, Transport},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_default_false() {
        assert!(!CancelToken::new().is_cancelled());
    }

    #[test]
    fn test_cancel_token_clones_share_flag() {
        let token = CancelToken::new();
        let observer = token.clone();
        token.cancel();
        assert!(observer.is_cancelled());
    }
}

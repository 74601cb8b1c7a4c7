//! Flash write protocol: program frames and NACK-driven rewind.
//!
//! ## Program Frame
//!
//! ```text
//! +-----------+-------+----------------+----------+
//! |  Address  | Count |      Data      | Checksum |
//! +-----------+-------+----------------+----------+
//! | 4 bytes BE|   1   |  count bytes   | 2 bytes BE|
//! +-----------+-------+----------------+----------+
//! ```
//!
//! The checksum cancels the 16-bit sum of everything before it.
//!
//! After each frame the bootloader either stays silent (busy writing, which
//! counts as success) or answers with its NACK byte, meaning the *previous*
//! frame never made it to flash. The writer then steps back through its
//! [`FrameHistory`] and replays forward from there.

use crate::error::{Error, Result};
use crate::image::ProgramBlock;
use crate::protocol::checksum::{frame_checksum, sum16};
use crate::protocol::link::TargetChannel;
use byteorder::{BigEndian, WriteBytesExt};
use log::{debug, trace, warn};
use std::time::Duration;

/// Default rewind budget per block.
pub const DEFAULT_MAX_REWINDS: u32 = 16;

/// One encoded program frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramFrame {
    address: u32,
    count: u8,
    bytes: Vec<u8>,
}

impl ProgramFrame {
    /// Encode `block` into a checksummed frame.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(block: &ProgramBlock) -> Result<Self> {
        let count = u8::try_from(block.len()).map_err(|_| {
            Error::Config(format!(
                "block at {:#010x} holds {} bytes, frames carry at most 255",
                block.address,
                block.len()
            ))
        })?;

        let mut bytes = Vec::with_capacity(block.len() + 7);
        bytes
            .write_u32::<BigEndian>(block.address)
            .unwrap();
        bytes.push(count);
        bytes.extend_from_slice(&block.data);

        let sum = sum16(&bytes);
        let checksum = frame_checksum(&bytes);
        if checksum.wrapping_add(sum) != 0 {
            return Err(Error::FrameChecksum { checksum, sum });
        }
        bytes
            .write_u16::<BigEndian>(checksum)
            .unwrap();

        Ok(Self {
            address: block.address,
            count,
            bytes,
        })
    }

    /// Target address of the frame's first data byte.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Number of data bytes.
    pub fn count(&self) -> u8 {
        self.count
    }

    /// Checksum field.
    pub fn checksum(&self) -> u16 {
        let n = self.bytes.len();
        u16::from_be_bytes([self.bytes[n - 2], self.bytes[n - 1]])
    }

    /// Wire bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Every frame transmitted in this run, in order.
#[derive(Debug, Default, Clone)]
pub struct FrameHistory {
    frames: Vec<ProgramFrame>,
}

impl FrameHistory {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame; returns its index.
    ///
    /// Frames must continue where the previous one ended.
    pub fn push(&mut self, frame: ProgramFrame) -> Result<usize> {
        if let Some(prev) = self.frames.last() {
            let next_free = prev
                .address
                .wrapping_add(u32::from(prev.count));
            if frame.address != next_free {
                return Err(Error::AddressOutOfOrder {
                    address: frame.address,
                    next_free,
                });
            }
        }
        self.frames.push(frame);
        Ok(self.frames.len() - 1)
    }

    /// Frame at `index`.
    pub fn get(&self, index: usize) -> Option<&ProgramFrame> {
        self.frames.get(index)
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frame was transmitted yet.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Flash writer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    /// Wait for a NACK after a regular frame.
    pub ack_timeout: Duration,
    /// Wait after the last frame of the image, which triggers finalization.
    pub final_ack_timeout: Duration,
    /// Rewinds allowed while writing one block.
    pub max_rewinds: u32,
    /// NACK byte sent by the bootloader.
    pub nack: u8,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(200),
            final_ack_timeout: Duration::from_millis(2000),
            max_rewinds: DEFAULT_MAX_REWINDS,
            nack: 0x15,
        }
    }
}

/// Outcome of one [`FlashWriter::write_block`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockReport {
    /// Block start address.
    pub address: u32,
    /// Bytes in the block.
    pub len: usize,
    /// Rewinds needed before the block was accepted.
    pub rewinds: u32,
}

/// Writes program blocks, replaying history on NACK.
#[derive(Debug)]
pub struct FlashWriter {
    config: WriterConfig,
    history: FrameHistory,
}

impl FlashWriter {
    /// Writer with an empty history.
    pub fn new(config: WriterConfig) -> Self {
        Self {
            config,
            history: FrameHistory::new(),
        }
    }

    /// Frames transmitted so far.
    pub fn history(&self) -> &FrameHistory {
        &self.history
    }

    /// Transmit `block`, rewinding as often as the bootloader asks.
    ///
    /// `is_final` selects the longer wait for the image's last frame.
    pub fn write_block<C: TargetChannel + ?Sized>(
        &mut self,
        channel: &mut C,
        block: &ProgramBlock,
        is_final: bool,
    ) -> Result<BlockReport> {
        let target = self
            .history
            .push(ProgramFrame::encode(block)?)?;
        let mut index = target;
        let mut rewinds = 0u32;

        loop {
            let Some(frame) = self.history.get(index) else {
                return Err(Error::TransportFailure(format!(
                    "frame history has no entry {index}"
                )));
            };
            trace!(
                "Frame {index} @ {:#010x} ({} bytes)",
                frame.address(),
                frame.count()
            );
            channel.send(frame.as_bytes())?;

            let timeout = if is_final && index == target {
                self.config.final_ack_timeout
            } else {
                self.config.ack_timeout
            };

            match channel.receive(1, timeout)? {
                Some(reply) if reply.first() == Some(&self.config.nack) => {
                    rewinds += 1;
                    if rewinds > self.config.max_rewinds {
                        return Err(Error::RewindLimitExceeded {
                            address: block.address,
                            rewinds: self.config.max_rewinds,
                        });
                    }
                    index = index.saturating_sub(1);
                    warn!(
                        "NACK after frame @ {:#010x}, rewinding to frame {index} ({rewinds}/{})",
                        frame.address(),
                        self.config.max_rewinds
                    );
                },
                _ if index == target => break,
                _ => index += 1,
            }
        }

        if rewinds > 0 {
            debug!("Block @ {:#010x} accepted after {rewinds} rewinds", block.address);
        }
        Ok(BlockReport {
            address: block.address,
            len: block.len(),
            rewinds,
        })
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::protocol::profile::LinkMode;
    use std::collections::VecDeque;

    /// Channel that records what was sent and replays scripted replies.
    #[derive(Default)]
    pub(crate) struct MockChannel {
        pub(crate) sent: Vec<Vec<u8>>,
        pub(crate) replies: VecDeque<Option<Vec<u8>>>,
        pub(crate) timeouts: Vec<Duration>,
        pub(crate) modes: Vec<LinkMode>,
    }

    impl MockChannel {
        pub(crate) fn with_replies(replies: impl IntoIterator<Item = Option<Vec<u8>>>) -> Self {
            Self {
                replies: replies.into_iter().collect(),
                ..Self::default()
            }
        }
    }

    impl TargetChannel for MockChannel {
        fn send(&mut self, data: &[u8]) -> Result<()> {
            self.sent.push(data.to_vec());
            Ok(())
        }

        fn receive(&mut self, _expected_len: usize, timeout: Duration) -> Result<Option<Vec<u8>>> {
            self.timeouts.push(timeout);
            Ok(self.replies.pop_front().flatten())
        }

        fn switch_mode(&mut self, mode: LinkMode) -> Result<()> {
            self.modes.push(mode);
            Ok(())
        }
    }
}

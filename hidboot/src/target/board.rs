//! Board revisions and target configuration.
//!
//! Control boards of different generations run the same bootloader flow
//! with different opcode tables, HEX addressing rules and timings. This
//! module collects those per-revision defaults in one place.

use crate::error::Result;
use crate::image::{AddressingMode, ImageSummary, MemoryLayout};
use crate::protocol::checksum::frame_checksum;
use crate::protocol::link::LinkTimeouts;
use crate::protocol::profile::ProtocolProfile;
use crate::protocol::program::{DEFAULT_MAX_REWINDS, WriterConfig};
use byteorder::{BigEndian, WriteBytesExt};
use std::fmt;
use std::time::Duration;

/// Default application start address.
pub const DEFAULT_APP_START: u32 = 0x4000;

/// Default last bootloader address.
pub const DEFAULT_BOOTLOADER_END: u32 = 0x3FFF;

/// Supported control-board revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum BoardRevision {
    /// First generation.
    #[default]
    RevA,
    /// Second generation.
    RevB,
    /// Third generation (linear-only HEX addressing).
    RevC,
}

impl BoardRevision {
    /// All known revisions.
    pub const ALL: [Self; 3] = [Self::RevA, Self::RevB, Self::RevC];

    /// Opcode table spoken by this revision.
    #[must_use]
    pub fn profile(&self) -> ProtocolProfile {
        match self {
            Self::RevA => ProtocolProfile::REV_A,
            Self::RevB => ProtocolProfile::REV_B,
            Self::RevC => ProtocolProfile::REV_C,
        }
    }

    /// How this revision's bootloader resolves extended address records.
    #[must_use]
    pub fn addressing(&self) -> AddressingMode {
        match self {
            Self::RevA | Self::RevB => AddressingMode::SegmentLinear,
            Self::RevC => AddressingMode::LinearLowByte,
        }
    }

    /// Post-erase wait hint sent in the transfer header, in milliseconds.
    #[must_use]
    pub fn finalize_wait_hint(&self) -> u16 {
        match self {
            Self::RevA => 500,
            Self::RevB => 750,
            Self::RevC => 1000,
        }
    }

    /// Get the board revision from a string name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name
            .to_lowercase()
            .replace(['-', '_'], "")
            .as_str()
        {
            "reva" | "a" => Some(Self::RevA),
            "revb" | "b" => Some(Self::RevB),
            "revc" | "c" => Some(Self::RevC),
            _ => None,
        }
    }
}

impl fmt::Display for BoardRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RevA => write!(f, "rev-a"),
            Self::RevB => write!(f, "rev-b"),
            Self::RevC => write!(f, "rev-c"),
        }
    }
}

/// Everything the bootloader flow needs to know about one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    /// Board revision the defaults came from.
    pub revision: BoardRevision,
    /// Flash layout and image rules.
    pub layout: MemoryLayout,
    /// Opcode table.
    pub profile: ProtocolProfile,
    /// Link-level timeouts.
    pub link: LinkTimeouts,
    /// Wait for a NACK after a regular frame.
    pub ack_timeout: Duration,
    /// Wait after the final frame.
    pub final_ack_timeout: Duration,
    /// Post-erase wait hint sent in the transfer header (ms).
    pub finalize_wait_hint: u16,
    /// Fixed part of the post-header erase settle.
    pub erase_settle_base: Duration,
    /// Erase settle added per started KiB of image.
    pub erase_settle_per_kib: Duration,
    /// Rewind budget per block.
    pub max_rewinds: u32,
}

impl TargetConfig {
    /// Create a new target configuration for the given revision.
    pub fn new(revision: BoardRevision) -> Self {
        Self {
            revision,
            layout: MemoryLayout::new(DEFAULT_APP_START, DEFAULT_BOOTLOADER_END)
                .with_addressing(revision.addressing()),
            profile: revision.profile(),
            link: LinkTimeouts::default(),
            ack_timeout: Duration::from_millis(200),
            final_ack_timeout: Duration::from_millis(2000),
            finalize_wait_hint: revision.finalize_wait_hint(),
            erase_settle_base: Duration::from_millis(500),
            erase_settle_per_kib: Duration::from_millis(20),
            max_rewinds: DEFAULT_MAX_REWINDS,
        }
    }

    /// Replace the opcode table.
    #[must_use]
    pub fn with_profile(mut self, profile: ProtocolProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Replace the memory layout.
    #[must_use]
    pub fn with_layout(mut self, layout: MemoryLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Set the NACK waits for regular and final frames.
    #[must_use]
    pub fn with_ack_timeouts(mut self, ack: Duration, final_ack: Duration) -> Self {
        self.ack_timeout = ack;
        self.final_ack_timeout = final_ack;
        self
    }

    /// Set the link timeouts.
    #[must_use]
    pub fn with_link_timeouts(mut self, link: LinkTimeouts) -> Self {
        self.link = link;
        self
    }

    /// Set the erase settle interval.
    #[must_use]
    pub fn with_erase_settle(mut self, base: Duration, per_kib: Duration) -> Self {
        self.erase_settle_base = base;
        self.erase_settle_per_kib = per_kib;
        self
    }

    /// Set the rewind budget.
    #[must_use]
    pub fn with_max_rewinds(mut self, max_rewinds: u32) -> Self {
        self.max_rewinds = max_rewinds;
        self
    }

    /// Check the configuration for values the protocol cannot work with.
    pub fn check(&self) -> Result<()> {
        self.profile.check()?;
        self.layout.check()
    }

    /// Settings for the flash writer.
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            ack_timeout: self.ack_timeout,
            final_ack_timeout: self.final_ack_timeout,
            max_rewinds: self.max_rewinds,
            nack: self.profile.flash_nack,
        }
    }

    /// Time the target needs to mass-erase `total_size` bytes.
    pub fn erase_settle(&self, total_size: u32) -> Duration {
        let kib = total_size.div_ceil(1024);
        self.erase_settle_base + self.erase_settle_per_kib * kib
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self::new(BoardRevision::default())
    }
}

/// Start-of-transfer header.
///
/// ```text
/// +---------------+-----------+----------+
/// |  Total size   | Wait hint | Checksum |
/// +---------------+-----------+----------+
/// |  4 bytes BE   | 2 bytes BE| 2 bytes BE|
/// +---------------+-----------+----------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHeader {
    /// Bytes from the application start to the end of the image.
    pub total_size: u32,
    /// Post-erase wait hint (ms).
    pub wait_hint: u16,
}

impl TransferHeader {
    /// Header for a validated image.
    pub fn new(summary: &ImageSummary, config: &TargetConfig) -> Self {
        Self {
            total_size: summary.transfer_size(),
            wait_hint: config.finalize_wait_hint,
        }
    }

    /// Wire bytes.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8);
        bytes
            .write_u32::<BigEndian>(self.total_size)
            .unwrap();
        bytes
            .write_u16::<BigEndian>(self.wait_hint)
            .unwrap();
        let checksum = frame_checksum(&bytes);
        bytes
            .write_u16::<BigEndian>(checksum)
            .unwrap();
        bytes
    }
}

//! Link layer: packet segmentation over 65-byte reports.
//!
//! ## Outbound Segments
//!
//! ```text
//! Single / First:  [0x00][op][total length: 4 BE][chunk <= 56]
//! Middle / Last:   [0x00][op][chunk <= 56]
//! ```
//!
//! Every segment is answered by one report whose opcode is the profile's
//! `done` or `failed` code.
//!
//! ## Inbound Responses
//!
//! ```text
//! [0x00][continue][total length: 4 BE][chunk: 56][error flag]
//!  0     1         2..6                6..62      62
//! ```

use crate::error::{Error, Result};
use crate::protocol::profile::{LinkMode, ProtocolProfile};
use crate::transport::{PAYLOAD_OFFSET, Report, Transport};
use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};
use std::time::Duration;

/// Bytes of packet data carried by one segment.
pub const SEGMENT_CHUNK: usize = 56;

/// Report offset of the response chunk.
const RESPONSE_CHUNK_OFFSET: usize = PAYLOAD_OFFSET + 4;

/// Report offset of the response error flag.
pub const ERROR_FLAG_OFFSET: usize = RESPONSE_CHUNK_OFFSET + SEGMENT_CHUNK;

/// Timeouts for link-level exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTimeouts {
    /// Wait for the done/failed answer to one segment.
    pub segment: Duration,
    /// Wait for the mode-switch acknowledgment.
    pub mode_switch: Duration,
}

impl Default for LinkTimeouts {
    fn default() -> Self {
        Self {
            segment: Duration::from_millis(1000),
            mode_switch: Duration::from_millis(2000),
        }
    }
}

/// One segment of a framed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFrame<'a> {
    /// Whole packet in one report.
    Single {
        /// Packet length.
        total: u32,
        /// Packet bytes.
        chunk: &'a [u8],
    },
    /// First report of a longer packet.
    First {
        /// Packet length.
        total: u32,
        /// First 56 packet bytes.
        chunk: &'a [u8],
    },
    /// Full 56-byte continuation.
    Middle(&'a [u8]),
    /// Final continuation.
    Last(&'a [u8]),
}

impl TransportFrame<'_> {
    /// Packet bytes carried by this segment.
    pub fn chunk(&self) -> &[u8] {
        match self {
            Self::Single { chunk, .. } | Self::First { chunk, .. } => chunk,
            Self::Middle(chunk) | Self::Last(chunk) => chunk,
        }
    }

    /// Build the report for this segment with `profile`'s opcodes.
    pub fn to_report(&self, profile: &ProtocolProfile) -> Report {
        let (opcode, total) = match self {
            Self::Single { total, .. } => (profile.single, Some(*total)),
            Self::First { total, .. } => (profile.first, Some(*total)),
            Self::Middle(_) => (profile.middle, None),
            Self::Last(_) => (profile.last, None),
        };

        let mut report = Report::new(opcode);
        let payload = report.payload_mut();
        let offset = match total {
            Some(total) => {
                BigEndian::write_u32(&mut payload[..4], total);
                4
            },
            None => 0,
        };
        let chunk = self.chunk();
        payload[offset..offset + chunk.len()].copy_from_slice(chunk);
        report
    }
}

/// Split `packet` into link segments.
#[allow(clippy::cast_possible_truncation)]
pub fn frame(packet: &[u8]) -> Vec<TransportFrame<'_>> {
    let total = packet.len() as u32;
    if packet.len() <= SEGMENT_CHUNK {
        return vec![TransportFrame::Single {
            total,
            chunk: packet,
        }];
    }

    let mut chunks = packet.chunks(SEGMENT_CHUNK);
    let mut frames = Vec::with_capacity(packet.len().div_ceil(SEGMENT_CHUNK));
    if let Some(first) = chunks.next() {
        frames.push(TransportFrame::First {
            total,
            chunk: first,
        });
    }
    let rest: Vec<&[u8]> = chunks.collect();
    if let Some((last, middle)) = rest.split_last() {
        frames.extend(
            middle
                .iter()
                .map(|chunk| TransportFrame::Middle(*chunk)),
        );
        frames.push(TransportFrame::Last(*last));
    }
    frames
}

/// What the flash protocol and orchestrator need from the link.
pub trait TargetChannel {
    /// Deliver `data` to the target, every segment acknowledged.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Collect up to `expected_len` bytes from the target.
    ///
    /// `Ok(None)` means the target stayed silent for `timeout`.
    fn receive(&mut self, expected_len: usize, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Switch the link mode and wait for the acknowledgment.
    fn switch_mode(&mut self, mode: LinkMode) -> Result<()>;
}

impl<C: TargetChannel + ?Sized> TargetChannel for &mut C {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        (**self).send(data)
    }

    fn receive(&mut self, expected_len: usize, timeout: Duration) -> Result<Option<Vec<u8>>> {
        (**self).receive(expected_len, timeout)
    }

    fn switch_mode(&mut self, mode: LinkMode) -> Result<()> {
        (**self).switch_mode(mode)
    }
}

/// Link over a report [`Transport`] using one [`ProtocolProfile`].
pub struct Link<T: Transport> {
    transport: T,
    profile: ProtocolProfile,
    timeouts: LinkTimeouts,
}

impl<T: Transport> Link<T> {
    /// Create a link with default timeouts.
    pub fn new(transport: T, profile: ProtocolProfile) -> Self {
        Self {
            transport,
            profile,
            timeouts: LinkTimeouts::default(),
        }
    }

    /// Set the link timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: LinkTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Get a mutable reference to the underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consume the link and return the underlying transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Transmit a packet, waiting for every segment's answer.
    fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        let frames = frame(packet);
        let segments = frames.len();
        trace!("Sending {} byte packet in {segments} segment(s)", packet.len());

        self.transport
            .discard_input()?;
        for (segment, frame) in frames.iter().enumerate() {
            self.transport
                .write_report(&frame.to_report(&self.profile))?;

            let Some(reply) = self
                .transport
                .read_report(self.timeouts.segment)?
            else {
                return Err(Error::TransportTimeout(format!(
                    "no answer to segment {segment} of {segments}"
                )));
            };

            match reply.opcode() {
                op if op == self.profile.done => {},
                op if op == self.profile.failed => {
                    debug!("Segment {segment} of {segments} rejected");
                    return Err(Error::SegmentRejected { segment, segments });
                },
                op => {
                    return Err(Error::TransportFailure(format!(
                        "unexpected answer {op:#04x} to segment {segment}"
                    )));
                },
            }
        }
        Ok(())
    }

    /// Transmit a packet without waiting for segment answers.
    fn post_packet(&mut self, packet: &[u8]) -> Result<()> {
        for frame in frame(packet) {
            self.transport
                .write_report(&frame.to_report(&self.profile))?;
        }
        Ok(())
    }

    /// Fold `continue` reports until the declared length is collected.
    fn collect_response(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let mut buffer: Vec<u8> = Vec::new();
        let mut declared: Option<usize> = None;
        let mut index = 0;

        loop {
            let Some(report) = self
                .transport
                .read_report(timeout)?
            else {
                if index == 0 {
                    return Ok(None);
                }
                return Err(Error::TransportTimeout(format!(
                    "response stalled after {} of {} bytes",
                    buffer.len(),
                    declared.unwrap_or_default()
                )));
            };

            if report.opcode() != self.profile.receive_continue {
                return Err(Error::TransportFailure(format!(
                    "expected continue report, got opcode {:#04x}",
                    report.opcode()
                )));
            }

            let bytes = report.as_bytes();
            if bytes[ERROR_FLAG_OFFSET] == self.profile.error_flag {
                return Err(Error::RobotNoResponse { report: index });
            }

            let total = *declared.get_or_insert_with(|| {
                BigEndian::read_u32(&bytes[PAYLOAD_OFFSET..RESPONSE_CHUNK_OFFSET]) as usize
            });
            let take = (total - buffer.len()).min(SEGMENT_CHUNK);
            buffer.extend_from_slice(&bytes[RESPONSE_CHUNK_OFFSET..RESPONSE_CHUNK_OFFSET + take]);
            index += 1;

            if buffer.len() >= total {
                return Ok(Some(buffer));
            }
        }
    }

    /// Transmit `data` with the `transmit_no_ack` opcode.
    ///
    /// The bridge forwards the packet without answering, so no segment
    /// reply is awaited. Programming never needs this; it is for tooling
    /// that pushes fire-and-forget commands to the target.
    pub fn post(&mut self, data: &[u8]) -> Result<()> {
        let mut packet = Vec::with_capacity(data.len() + 1);
        packet.push(self.profile.transmit_no_ack);
        packet.extend_from_slice(data);
        self.post_packet(&packet)
    }

    /// Forward `command` with the `receive_forward` opcode and collect
    /// the answer.
    ///
    /// Unlike [`TargetChannel::receive`], the bridge passes `command` on to
    /// the target before reading back `expected_len` bytes. Returns `None`
    /// when nothing arrives within `timeout`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn query(
        &mut self,
        command: &[u8],
        expected_len: usize,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let mut packet = Vec::with_capacity(command.len() + 5);
        packet.push(self.profile.receive_forward);
        packet.extend_from_slice(&(expected_len as u32).to_be_bytes());
        packet.extend_from_slice(command);
        self.send_packet(&packet)?;
        self.collect_response(timeout)
    }
}

impl<T: Transport> TargetChannel for Link<T> {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut packet = Vec::with_capacity(data.len() + 1);
        packet.push(self.profile.transmit);
        packet.extend_from_slice(data);
        self.send_packet(&packet)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn receive(&mut self, expected_len: usize, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let mut packet = [0u8; 5];
        packet[0] = self.profile.receive;
        BigEndian::write_u32(&mut packet[1..], expected_len as u32);
        self.send_packet(&packet)?;
        self.collect_response(timeout)
    }

    fn switch_mode(&mut self, mode: LinkMode) -> Result<()> {
        let opcode = self
            .profile
            .mode_opcode(mode);
        debug!("Switching link to {mode:?} mode");
        self.transport
            .discard_input()?;
        self.transport
            .write_report(&Report::new(opcode))?;

        match self
            .transport
            .read_report(self.timeouts.mode_switch)?
        {
            Some(reply) if reply.opcode() == self.profile.mode_ack => Ok(()),
            Some(reply) => Err(Error::TransportFailure(format!(
                "mode switch to {mode:?} answered with {:#04x}",
                reply.opcode()
            ))),
            None => Err(Error::TransportTimeout(format!(
                "no acknowledgment for {mode:?} mode switch"
            ))),
        }
    }
}

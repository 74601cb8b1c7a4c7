//! Fixed-size report transport.
//!
//! ## Report Format
//!
//! ```text
//! +-----------+--------+--------------------------------------+
//! | Report ID | Opcode |               Payload                |
//! +-----------+--------+--------------------------------------+
//! |  1 byte   | 1 byte |              63 bytes                |
//! +-----------+--------+--------------------------------------+
//! |   0x00    |  op    |  opcode-specific, zero-filled        |
//! +-----------+--------+--------------------------------------+
//! ```

use crate::error::{Error, Result};
use crate::port::Port;
use log::trace;
use std::io::ErrorKind;
use std::time::{Duration, Instant};

/// Size of every report on the wire.
pub const REPORT_SIZE: usize = 65;

/// Offset of the opcode byte.
pub const OPCODE_OFFSET: usize = 1;

/// Offset of the first payload byte.
pub const PAYLOAD_OFFSET: usize = 2;

/// One 65-byte report.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Report([u8; REPORT_SIZE]);

impl Report {
    /// Zero-filled report carrying `opcode`.
    pub fn new(opcode: u8) -> Self {
        let mut bytes = [0u8; REPORT_SIZE];
        bytes[OPCODE_OFFSET] = opcode;
        Self(bytes)
    }

    /// Wrap raw report bytes.
    pub fn from_bytes(bytes: [u8; REPORT_SIZE]) -> Self {
        Self(bytes)
    }

    /// Opcode byte.
    pub fn opcode(&self) -> u8 {
        self.0[OPCODE_OFFSET]
    }

    /// Bytes after the opcode.
    pub fn payload(&self) -> &[u8] {
        &self.0[PAYLOAD_OFFSET..]
    }

    /// Mutable bytes after the opcode.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.0[PAYLOAD_OFFSET..]
    }

    /// Raw report bytes, report id included.
    pub fn as_bytes(&self) -> &[u8; REPORT_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let used = self
            .0
            .iter()
            .rposition(|&b| b != 0)
            .map_or(PAYLOAD_OFFSET, |i| (i + 1).max(PAYLOAD_OFFSET));
        write!(f, "Report({:#04x}, {:02X?})", self.opcode(), &self.0[PAYLOAD_OFFSET..used])
    }
}

/// Report-level transport to the target.
pub trait Transport {
    /// Send one report.
    fn write_report(&mut self, report: &Report) -> Result<()>;

    /// Wait up to `timeout` for one report; `None` when nothing arrived.
    fn read_report(&mut self, timeout: Duration) -> Result<Option<Report>>;

    /// Drop anything the target sent that nobody has read yet.
    ///
    /// Called before each exchange so a reply that missed its window is not
    /// taken as the answer to the next request.
    fn discard_input(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write_report(&mut self, report: &Report) -> Result<()> {
        (**self).write_report(report)
    }

    fn read_report(&mut self, timeout: Duration) -> Result<Option<Report>> {
        (**self).read_report(timeout)
    }

    fn discard_input(&mut self) -> Result<()> {
        (**self).discard_input()
    }
}

/// Report transport over a byte-stream [`Port`].
///
/// Reports are written and read as whole 65-byte units; the bridge on the
/// other side maps them onto the report endpoint one to one.
pub struct ReportPort<P: Port> {
    port: P,
}

impl<P: Port> ReportPort<P> {
    /// Wrap an opened port.
    pub fn new(port: P) -> Self {
        Self { port }
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }
}

impl<P: Port> Transport for ReportPort<P> {
    fn write_report(&mut self, report: &Report) -> Result<()> {
        trace!("-> {report:?}");
        self.port
            .write_all_bytes(report.as_bytes())
    }

    fn read_report(&mut self, timeout: Duration) -> Result<Option<Report>> {
        self.port
            .set_timeout(timeout)?;

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; REPORT_SIZE];
        let mut filled = 0;

        while filled < REPORT_SIZE {
            match self
                .port
                .read(&mut buf[filled..])
            {
                // End of stream; the bridge has nothing more for us.
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {
                    if Instant::now() >= deadline {
                        break;
                    }
                },
                Err(e) => return Err(Error::Io(e)),
            }
        }

        match filled {
            0 => Ok(None),
            REPORT_SIZE => {
                let report = Report::from_bytes(buf);
                trace!("<- {report:?}");
                Ok(Some(report))
            },
            n => Err(Error::TransportFailure(format!(
                "partial report: {n} of {REPORT_SIZE} bytes"
            ))),
        }
    }

    fn discard_input(&mut self) -> Result<()> {
        trace!("Discarding stale input on {}", self.port.name());
        self.port
            .clear_buffers()
    }
}

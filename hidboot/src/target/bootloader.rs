//! Bootload orchestration.
//!
//! Drives one programming run end to end:
//!
//! ```text
//! Idle -> Validating -> ModeSwitch(Bootload) -> SendHeader -> Streaming
//!      -> ModeSwitch(Normal) -> Completed | Cancelled | Failed
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use hidboot::{BoardRevision, Bootloader, CancelToken, TargetConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TargetConfig::new(BoardRevision::RevB);
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let mut bootloader = Bootloader::open("/dev/ttyACM0", 115200, config)?;
//!         let mut events = Vec::new();
//!         let summary = bootloader.program("firmware.hex", &mut events, &CancelToken::new())?;
//!         println!("Wrote {} blocks", summary.blocks);
//!     }
//!
//!     Ok(())
//! }
//! ```

use crate::CancelToken;
use crate::error::{Error, Result};
use crate::image::{ImageSummary, ProgramBlocks, validate_file};
use crate::protocol::link::TargetChannel;
use crate::protocol::profile::LinkMode;
use crate::protocol::program::FlashWriter;
use crate::target::board::{TargetConfig, TransferHeader};
use log::{debug, info};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Orchestrator state, reported on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootState {
    /// Nothing started yet.
    Idle,
    /// Checking the image.
    Validating,
    /// Entering bootload mode.
    ModeSwitchBootload,
    /// Sending the transfer header and waiting for the erase.
    SendHeader,
    /// Writing program blocks.
    Streaming,
    /// Returning to normal mode.
    ModeSwitchNormal,
    /// Run finished.
    Completed,
    /// Run stopped on request; the link is left in bootload mode.
    Cancelled,
    /// Run failed with the given message.
    Failed(String),
}

impl BootState {
    /// Whether the run is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed(_))
    }
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Validating => write!(f, "validating image"),
            Self::ModeSwitchBootload => write!(f, "entering bootload mode"),
            Self::SendHeader => write!(f, "sending transfer header"),
            Self::Streaming => write!(f, "writing flash"),
            Self::ModeSwitchNormal => write!(f, "returning to normal mode"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Notification emitted while programming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashEvent {
    /// State transition.
    State(BootState),
    /// Line-granularity progress.
    Progress {
        /// Rounded percentage of HEX records consumed.
        percent: u8,
        /// Records consumed.
        records: u32,
        /// Records in the image.
        total: u32,
    },
    /// A block was written.
    Block {
        /// Block start address.
        address: u32,
        /// Bytes in the block.
        len: usize,
        /// Rewinds needed for the block.
        rewinds: u32,
    },
}

/// Receiver of [`FlashEvent`]s.
pub trait EventSink {
    /// Deliver one event.
    fn emit(&mut self, event: FlashEvent);
}

impl EventSink for Sender<FlashEvent> {
    fn emit(&mut self, event: FlashEvent) {
        // A dropped receiver only means nobody is watching.
        let _ = self.send(event);
    }
}

impl EventSink for Vec<FlashEvent> {
    fn emit(&mut self, event: FlashEvent) {
        self.push(event);
    }
}

impl<S: EventSink + ?Sized> EventSink for &mut S {
    fn emit(&mut self, event: FlashEvent) {
        (**self).emit(event);
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashSummary {
    /// Validated image.
    pub image: ImageSummary,
    /// Blocks written.
    pub blocks: usize,
    /// Bytes written, NOP padding included.
    pub bytes: usize,
    /// Rewinds over the whole run.
    pub rewinds: u32,
    /// Wall time of the run.
    pub elapsed: Duration,
}

/// Rounded `records * 100 / total`, emitted only when it changes.
struct ProgressTracker {
    total: u32,
    records: u32,
    percent: Option<u8>,
}

impl ProgressTracker {
    fn new(total: u32) -> Self {
        Self {
            total,
            records: 0,
            percent: None,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn percent_of(&self, records: u32) -> u8 {
        if self.total == 0 {
            return 100;
        }
        let n = u64::from(records.min(self.total));
        let total = u64::from(self.total);
        ((n * 200 + total) / (2 * total)) as u8
    }

    fn advance<S: EventSink + ?Sized>(&mut self, consumed: u32, sink: &mut S) {
        while self.records < consumed {
            self.records += 1;
            let percent = self.percent_of(self.records);
            if self.percent != Some(percent) {
                self.percent = Some(percent);
                sink.emit(FlashEvent::Progress {
                    percent,
                    records: self.records,
                    total: self.total,
                });
            }
        }
    }
}

/// Bootload orchestrator over a [`TargetChannel`].
pub struct Bootloader<C: TargetChannel> {
    channel: C,
    config: TargetConfig,
}

impl<C: TargetChannel> Bootloader<C> {
    /// Create an orchestrator for an already opened channel.
    pub fn new(channel: C, config: TargetConfig) -> Self {
        Self { channel, config }
    }

    /// Target configuration in use.
    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// Get a mutable reference to the underlying channel.
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Consume the orchestrator and return the underlying channel.
    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Validate the image at `path` without touching the link.
    pub fn validate_image<P: AsRef<Path>>(&self, path: P) -> Result<ImageSummary> {
        validate_file(path, &self.config.layout)
    }

    /// Program the image at `path`.
    ///
    /// Blocks the calling thread until the run ends; see
    /// [`spawn_programming`] for a background run.
    pub fn program<P: AsRef<Path>, S: EventSink + ?Sized>(
        &mut self,
        path: P,
        sink: &mut S,
        cancel: &CancelToken,
    ) -> Result<FlashSummary> {
        sink.emit(FlashEvent::State(BootState::Idle));
        let result = self.run(path.as_ref(), sink, cancel);

        let last = match &result {
            Ok(_) => BootState::Completed,
            Err(Error::Cancelled) => BootState::Cancelled,
            Err(e) => BootState::Failed(e.to_string()),
        };
        info!("Programming {last}");
        sink.emit(FlashEvent::State(last));
        result
    }

    fn run<S: EventSink + ?Sized>(
        &mut self,
        path: &Path,
        sink: &mut S,
        cancel: &CancelToken,
    ) -> Result<FlashSummary> {
        let started = Instant::now();

        sink.emit(FlashEvent::State(BootState::Validating));
        self.config.check()?;
        let image = self.validate_image(path)?;
        let file = File::open(path)?;
        let mut blocks = ProgramBlocks::new(BufReader::new(file), &self.config.layout)?;
        info!(
            "Image {}: {} records, {} bytes from {:#010x}",
            path.display(),
            image.line_count,
            image.transfer_size(),
            image.start_address
        );

        sink.emit(FlashEvent::State(BootState::ModeSwitchBootload));
        self.channel
            .switch_mode(LinkMode::Bootload)?;

        sink.emit(FlashEvent::State(BootState::SendHeader));
        let header = TransferHeader::new(&image, &self.config);
        self.channel
            .send(&header.encode())?;
        let settle = self
            .config
            .erase_settle(header.total_size);
        debug!("Waiting {settle:?} for erase");
        thread::sleep(settle);

        sink.emit(FlashEvent::State(BootState::Streaming));
        let mut writer = FlashWriter::new(self.config.writer_config());
        let mut progress = ProgressTracker::new(image.line_count);
        let mut summary = FlashSummary {
            image,
            blocks: 0,
            bytes: 0,
            rewinds: 0,
            elapsed: Duration::ZERO,
        };

        let mut pending = blocks.next();
        while let Some(next) = pending {
            if cancel.is_cancelled() {
                info!("Cancelled before block {}", summary.blocks);
                return Err(Error::Cancelled);
            }

            let block = next?;
            progress.advance(blocks.records_consumed(), sink);
            pending = blocks.next();
            let is_final = pending.is_none();

            let report = writer.write_block(&mut self.channel, &block, is_final)?;
            summary.blocks += 1;
            summary.bytes += report.len;
            summary.rewinds += report.rewinds;
            sink.emit(FlashEvent::Block {
                address: report.address,
                len: report.len,
                rewinds: report.rewinds,
            });
        }
        progress.advance(blocks.records_consumed(), sink);

        sink.emit(FlashEvent::State(BootState::ModeSwitchNormal));
        self.channel
            .switch_mode(LinkMode::Normal)?;

        summary.elapsed = started.elapsed();
        Ok(summary)
    }
}

// Native-specific convenience functions
#[cfg(feature = "native")]
mod native_impl {
    use super::{Bootloader, Result, TargetConfig};
    use crate::port::{NativePort, SerialConfig};
    use crate::protocol::link::Link;
    use crate::transport::ReportPort;

    impl Bootloader<Link<ReportPort<NativePort>>> {
        /// Open the serial bridge at `port_name` and build the link for
        /// `config`'s revision.
        pub fn open(port_name: &str, baud_rate: u32, config: TargetConfig) -> Result<Self> {
            config.check()?;
            let serial = SerialConfig::new(port_name, baud_rate).with_timeout(config.link.segment);
            let port = NativePort::open_with_retry(&serial)?;
            let link = Link::new(ReportPort::new(port), config.profile).with_timeouts(config.link);
            Ok(Self::new(link, config))
        }
    }
}

/// Run [`Bootloader::program`] on a dedicated worker thread.
///
/// Events arrive on the returned receiver; the join handle yields the
/// orchestrator back together with the run's result so the caller can
/// restore the link mode after a cancellation.
pub fn spawn_programming<C>(
    mut bootloader: Bootloader<C>,
    path: impl Into<PathBuf>,
    cancel: CancelToken,
) -> (
    JoinHandle<(Bootloader<C>, Result<FlashSummary>)>,
    Receiver<FlashEvent>,
)
where
    C: TargetChannel + Send + 'static,
{
    let path = path.into();
    let (mut tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let result = bootloader.program(&path, &mut tx, &cancel);
        (bootloader, result)
    });
    (handle, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::hex::{RecordType, encode_line};
    use crate::protocol::program::mock::MockChannel;
    use std::io::Write;

    fn quick_config() -> TargetConfig {
        TargetConfig::default()
            .with_erase_settle(Duration::ZERO, Duration::ZERO)
            .with_ack_timeouts(Duration::from_millis(1), Duration::from_millis(2))
    }

    fn write_image(records: &[(u16, Vec<u8>)]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for (offset, data) in records {
            writeln!(file, "{}", encode_line(RecordType::Data, *offset, data)).unwrap();
        }
        writeln!(file, "{}", encode_line(RecordType::EndOfFile, 0, &[])).unwrap();
        file.flush().unwrap();
        file
    }

    fn states(events: &[FlashEvent]) -> Vec<BootState> {
        events
            .iter()
            .filter_map(|e| match e {
                FlashEvent::State(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_progress_rounding() {
        let tracker = ProgressTracker::new(3);
        assert_eq!(tracker.percent_of(1), 33);
        assert_eq!(tracker.percent_of(2), 67);
        assert_eq!(tracker.percent_of(3), 100);

        let tracker = ProgressTracker::new(8);
        // 1/8 = 12.5 rounds up
        assert_eq!(tracker.percent_of(1), 13);
    }

    #[test]
    fn test_progress_deduplicates() {
        let mut tracker = ProgressTracker::new(400);
        let mut events = Vec::new();
        tracker.advance(4, &mut events);
        // 1/400 -> 0, 2/400 -> 1 (0.5 rounds up), 3/400 -> 1, 4/400 -> 1
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_full_run() {
        let file = write_image(&[(0x4000, vec![0x11; 16]), (0x4010, vec![0x22; 8])]);
        let mut bootloader = Bootloader::new(MockChannel::default(), quick_config());
        let mut events = Vec::new();

        let summary = bootloader
            .program(file.path(), &mut events, &CancelToken::new())
            .unwrap();

        assert_eq!(summary.image.line_count, 3);
        assert_eq!(summary.blocks, 1);
        assert_eq!(summary.bytes, 24);
        assert_eq!(
            states(&events),
            vec![
                BootState::Idle,
                BootState::Validating,
                BootState::ModeSwitchBootload,
                BootState::SendHeader,
                BootState::Streaming,
                BootState::ModeSwitchNormal,
                BootState::Completed,
            ]
        );

        let channel = bootloader.into_channel();
        assert_eq!(channel.modes, vec![LinkMode::Bootload, LinkMode::Normal]);
        // Header, then the single short block.
        assert_eq!(channel.sent.len(), 2);
        assert_eq!(&channel.sent[0][..4], &[0, 0, 0, 24]);
        assert_eq!(channel.sent[1][4], 24);
        // Last block waits with the final timeout.
        assert_eq!(channel.timeouts, vec![Duration::from_millis(2)]);

        let last_progress = events.iter().rev().find_map(|e| match e {
            FlashEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        });
        assert_eq!(last_progress, Some(100));
    }

    #[test]
    fn test_invalid_image_never_touches_link() {
        let file = write_image(&[(0x3000, vec![0; 4])]);
        let mut bootloader = Bootloader::new(MockChannel::default(), quick_config());
        let mut events = Vec::new();

        let err = bootloader
            .program(file.path(), &mut events, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::ProtectedAddress { .. }));
        assert!(matches!(events.last(), Some(FlashEvent::State(BootState::Failed(_)))));

        let channel = bootloader.into_channel();
        assert!(channel.modes.is_empty());
        assert!(channel.sent.is_empty());
    }

    #[test]
    fn test_bad_block_size_never_touches_link() {
        let file = write_image(&[(0x4000, vec![0x11; 16])]);
        let config = quick_config();
        let layout = config.layout.with_block_size(300);
        let mut bootloader = Bootloader::new(MockChannel::default(), config.with_layout(layout));
        let mut events = Vec::new();

        let err = bootloader
            .program(file.path(), &mut events, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!states(&events).contains(&BootState::ModeSwitchBootload));

        let channel = bootloader.into_channel();
        assert!(channel.modes.is_empty());
        assert!(channel.sent.is_empty());
    }

    #[test]
    fn test_cancel_skips_mode_restore() {
        let file = write_image(&[(0x4000, vec![1; 32]), (0x4020, vec![2; 32])]);
        let mut bootloader = Bootloader::new(MockChannel::default(), quick_config());
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut events = Vec::new();

        let err = bootloader
            .program(file.path(), &mut events, &cancel)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(
            states(&events).last(),
            Some(&BootState::Cancelled)
        );

        let channel = bootloader.into_channel();
        assert_eq!(channel.modes, vec![LinkMode::Bootload]);
        // Only the header went out.
        assert_eq!(channel.sent.len(), 1);
    }

    #[test]
    fn test_only_last_block_is_final() {
        let file = write_image(&[(0x4000, vec![1; 32]), (0x4020, vec![2; 32])]);
        let mut bootloader = Bootloader::new(MockChannel::default(), quick_config());
        bootloader
            .program(file.path(), &mut Vec::new(), &CancelToken::new())
            .unwrap();
        let channel = bootloader.into_channel();
        assert_eq!(
            channel.timeouts,
            vec![Duration::from_millis(1), Duration::from_millis(2)]
        );
    }

    #[test]
    fn test_spawned_run_reports_through_channel() {
        let file = write_image(&[(0x4000, vec![5; 40])]);
        let bootloader = Bootloader::new(MockChannel::default(), quick_config());
        let (handle, events) = spawn_programming(bootloader, file.path(), CancelToken::new());

        let (_, result) = handle.join().unwrap();
        let summary = result.unwrap();
        assert_eq!(summary.blocks, 2);

        let received: Vec<FlashEvent> = events.try_iter().collect();
        assert_eq!(
            received.last(),
            Some(&FlashEvent::State(BootState::Completed))
        );
        let blocks = received
            .iter()
            .filter(|e| matches!(e, FlashEvent::Block { .. }))
            .count();
        assert_eq!(blocks, 2);
    }
}

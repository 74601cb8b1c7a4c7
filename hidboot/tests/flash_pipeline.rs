//! End-to-end programming runs against a simulated bootloader.

use hidboot::image::NOP;
use hidboot::{
    BoardRevision, BootState, Bootloader, CancelToken, Error, FlashEvent, Link, ProtocolProfile,
    REPORT_SIZE, Report, TargetConfig, Transport,
};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Report-level model of the target: link bridge plus bootloader.
struct SimulatedTarget {
    profile: ProtocolProfile,
    replies: VecDeque<Report>,
    packet: Vec<u8>,
    expected: usize,
    bootload: bool,
    header: Option<Vec<u8>>,
    flash: BTreeMap<u32, u8>,
    frames: Vec<u32>,
    /// Frame numbers (in arrival order) after which the bootloader NACKs.
    nack_after: HashSet<usize>,
    last_frame: Option<(u32, usize)>,
    pending_nack: bool,
}

impl SimulatedTarget {
    fn new(profile: ProtocolProfile) -> Self {
        Self {
            profile,
            replies: VecDeque::new(),
            packet: Vec::new(),
            expected: 0,
            bootload: false,
            header: None,
            flash: BTreeMap::new(),
            frames: Vec::new(),
            nack_after: HashSet::new(),
            last_frame: None,
            pending_nack: false,
        }
    }

    fn reply(&mut self, opcode: u8) {
        self.replies.push_back(Report::new(opcode));
    }

    fn handle_packet(&mut self, packet: &[u8]) {
        let (op, body) = packet.split_first().unwrap();
        if *op == self.profile.transmit {
            if self.header.is_none() {
                self.header = Some(body.to_vec());
            } else {
                self.program(body);
            }
        } else if *op == self.profile.receive {
            if std::mem::take(&mut self.pending_nack) {
                let mut report = Report::new(self.profile.receive_continue);
                report.payload_mut()[..5].copy_from_slice(&[0, 0, 0, 1, self.profile.flash_nack]);
                self.replies.push_back(report);
            }
        } else {
            panic!("unexpected packet opcode {op:#04x}");
        }
    }

    fn program(&mut self, frame: &[u8]) {
        let sum = frame
            .iter()
            .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)));
        assert_eq!(sum, 0, "frame checksum must cancel");

        let address = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let count = usize::from(frame[4]);
        let data = &frame[5..5 + count];

        if self.nack_after.remove(&self.frames.len()) {
            // The previous write never reached flash.
            if let Some((prev, len)) = self.last_frame {
                for i in 0..len {
                    self.flash.remove(&(prev + i as u32));
                }
            }
            self.pending_nack = true;
        }

        for (i, b) in data.iter().enumerate() {
            self.flash.insert(address + i as u32, *b);
        }
        self.frames.push(address);
        self.last_frame = Some((address, count));
    }
}

impl Transport for SimulatedTarget {
    fn write_report(&mut self, report: &Report) -> hidboot::Result<()> {
        let bytes = report.as_bytes();
        assert_eq!(bytes.len(), REPORT_SIZE);
        let op = report.opcode();
        let p = self.profile;

        if op == p.mode_bootload || op == p.mode_normal {
            self.bootload = op == p.mode_bootload;
            self.reply(p.mode_ack);
            return Ok(());
        }

        let chunk = if op == p.single || op == p.first {
            self.expected = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
            self.packet.clear();
            &bytes[6..62]
        } else if op == p.middle || op == p.last {
            &bytes[2..58]
        } else {
            self.reply(p.failed);
            return Ok(());
        };

        let take = (self.expected - self.packet.len()).min(56);
        self.packet.extend_from_slice(&chunk[..take]);
        self.reply(p.done);

        if self.packet.len() == self.expected {
            let packet = std::mem::take(&mut self.packet);
            self.handle_packet(&packet);
        }
        Ok(())
    }

    fn read_report(&mut self, _timeout: Duration) -> hidboot::Result<Option<Report>> {
        Ok(self.replies.pop_front())
    }
}

fn config(revision: BoardRevision) -> TargetConfig {
    TargetConfig::new(revision)
        .with_erase_settle(Duration::ZERO, Duration::ZERO)
        .with_ack_timeouts(Duration::from_millis(1), Duration::from_millis(1))
}

fn bootloader(
    revision: BoardRevision,
    target: SimulatedTarget,
) -> Bootloader<Link<SimulatedTarget>> {
    let config = config(revision);
    Bootloader::new(Link::new(target, config.profile), config)
}

fn flash_bytes(target: &SimulatedTarget, start: u32, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| {
            target
                .flash
                .get(&(start + i as u32))
                .copied()
                .unwrap_or(0xFF)
        })
        .collect()
}

#[test]
fn test_programs_83_line_image() {
    let target = SimulatedTarget::new(ProtocolProfile::REV_A);
    let mut bootloader = bootloader(BoardRevision::RevA, target);
    let mut events = Vec::new();

    let summary = bootloader
        .program(fixture("app_83.hex"), &mut events, &CancelToken::new())
        .unwrap();
    assert_eq!(summary.blocks, 41);
    assert_eq!(summary.bytes, 81 * 16);
    assert_eq!(summary.rewinds, 0);

    let target = bootloader
        .into_channel()
        .into_transport();
    assert!(!target.bootload);
    assert_eq!(target.header.as_deref(), Some(&[0, 0, 0x05, 0x10, 0x01, 0xF4, 0xFE, 0xF6][..]));
    assert_eq!(target.frames.len(), 41);

    let written = flash_bytes(&target, 0x4000, 81 * 16);
    let expected: Vec<u8> = (0..81 * 16)
        .map(|i| ((0x4000 + i) * 7 + 3) as u8)
        .collect();
    assert_eq!(written, expected);

    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            FlashEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert!(progress.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(progress.last(), Some(&100));
}

#[test]
fn test_nack_recovers_lost_block() {
    let mut target = SimulatedTarget::new(ProtocolProfile::REV_B);
    // Frame 5 arrives, bootloader reports frame 4 lost.
    target.nack_after.insert(5);
    let mut bootloader = bootloader(BoardRevision::RevB, target);

    let summary = bootloader
        .program(fixture("app_40.hex"), &mut Vec::new(), &CancelToken::new())
        .unwrap();
    assert_eq!(summary.blocks, 25);
    assert_eq!(summary.rewinds, 1);

    let target = bootloader
        .into_channel()
        .into_transport();
    // 0x4000 + 32 * n for frames 0..=5, then frame 4 again, then 5.
    assert_eq!(&target.frames[4..8], &[0x4080, 0x40A0, 0x4080, 0x40A0]);

    let gap = flash_bytes(&target, 0x4140, 0xC0);
    assert_eq!(gap, vec![NOP; 0xC0]);
    let head = flash_bytes(&target, 0x4080, 32);
    let expected: Vec<u8> = (0..32).map(|i| ((0x4080 + i) * 7 + 3) as u8).collect();
    assert_eq!(head, expected);
}

#[test]
fn test_cancelled_run_stays_in_bootload_mode() {
    let target = SimulatedTarget::new(ProtocolProfile::REV_A);
    let mut bootloader = bootloader(BoardRevision::RevA, target);
    let cancel = CancelToken::new();
    cancel.cancel();
    let mut events = Vec::new();

    let err = bootloader
        .program(fixture("app_83.hex"), &mut events, &cancel)
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(events.last(), Some(&FlashEvent::State(BootState::Cancelled)));

    let target = bootloader
        .into_channel()
        .into_transport();
    assert!(target.bootload);
    assert!(target.frames.is_empty());
}

#[test]
fn test_mismatched_profile_fails_fast() {
    // Target speaks rev C, host uses rev A opcodes.
    let target = SimulatedTarget::new(ProtocolProfile::REV_C);
    let mut bootloader = bootloader(BoardRevision::RevA, target);
    let mut events = Vec::new();

    let err = bootloader
        .program(fixture("app_40.hex"), &mut events, &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, Error::TransportFailure(_)));
    assert!(matches!(
        events.last(),
        Some(FlashEvent::State(BootState::Failed(_)))
    ));
}

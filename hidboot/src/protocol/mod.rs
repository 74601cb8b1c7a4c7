//! Protocol implementations.

pub mod checksum;
pub mod link;
pub mod profile;
pub mod program;

// Re-export common types
pub use link::{Link, LinkTimeouts, TargetChannel, TransportFrame, frame};
pub use profile::{LinkMode, ProtocolProfile};
pub use program::{BlockReport, FlashWriter, FrameHistory, ProgramFrame, WriterConfig};

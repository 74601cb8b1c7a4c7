//! Target boards and the bootload flow.

pub mod board;
pub mod bootloader;

pub use board::{BoardRevision, TargetConfig, TransferHeader};
pub use bootloader::{
    BootState, Bootloader, EventSink, FlashEvent, FlashSummary, spawn_programming,
};

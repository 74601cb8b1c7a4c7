//! Board revision listing.

use anyhow::Result;
use console::style;
use hidboot::{BoardRevision, ProtocolProfile};

/// Profiles command implementation.
pub(crate) fn cmd_profiles(json: bool) -> Result<()> {
    if json {
        println!("{}", profiles_json()?);
        return Ok(());
    }

    for revision in BoardRevision::ALL {
        let p = revision.profile();
        println!(
            "{} {}  (wait hint {} ms, {:?} addressing)",
            style("•").dim(),
            style(revision).bold(),
            revision.finalize_wait_hint(),
            revision.addressing()
        );
        for (name, value) in opcode_rows(&p) {
            println!("    {name:<16} 0x{value:02X}");
        }
    }
    Ok(())
}

fn opcode_rows(p: &ProtocolProfile) -> [(&'static str, u8); 16] {
    [
        ("single", p.single),
        ("first", p.first),
        ("middle", p.middle),
        ("last", p.last),
        ("transmit", p.transmit),
        ("transmit_no_ack", p.transmit_no_ack),
        ("receive", p.receive),
        ("receive_forward", p.receive_forward),
        ("receive_continue", p.receive_continue),
        ("mode_bootload", p.mode_bootload),
        ("mode_normal", p.mode_normal),
        ("done", p.done),
        ("failed", p.failed),
        ("mode_ack", p.mode_ack),
        ("flash_nack", p.flash_nack),
        ("error_flag", p.error_flag),
    ]
}

fn profiles_json() -> Result<String> {
    let boards: Vec<_> = BoardRevision::ALL
        .iter()
        .map(|revision| {
            serde_json::json!({
                "board": revision,
                "addressing": revision.addressing(),
                "wait_hint_ms": revision.finalize_wait_hint(),
                "opcodes": revision.profile(),
            })
        })
        .collect();
    Ok(serde_json::to_string_pretty(&boards)?)
}

//! Flash command implementation.

use anyhow::{Context, Result, anyhow};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use hidboot::{
    Bootloader, CancelToken, FlashEvent, FlashSummary, ImageSummary, LinkMode, TargetChannel,
    spawn_programming, validate_file,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use std::io::IsTerminal;
use std::path::Path;
use std::sync::mpsc::Receiver;

use crate::config::Config;
use crate::{Cli, CliError, use_fancy_output};

/// Flash command implementation.
pub(crate) fn cmd_flash(cli: &Cli, config: &Config, image: &Path, yes: bool) -> Result<()> {
    let board = cli.resolve_board(config)?;
    let target = config.target_config(board)?;

    if !cli.quiet {
        eprintln!(
            "{} Validating {} for {board}",
            style("📦").cyan(),
            image.display()
        );
    }

    // Validate before anything touches the link
    let summary = validate_file(image, &target.layout)
        .with_context(|| format!("Failed to validate {}", image.display()))?;
    if !cli.quiet {
        print_image(&summary);
    }

    let port = cli.resolve_port(config)?;
    let baud = cli.resolve_baud(config);

    if !yes && !confirm(cli, &port)? {
        return Err(CliError::Cancelled("Flashing aborted".to_string()).into());
    }

    if !cli.quiet {
        eprintln!("{} Using {port} @ {baud}", style("🔌").cyan());
    }
    let bootloader = Bootloader::open(&port, baud, target)
        .with_context(|| format!("Failed to open {port}"))?;

    // Ctrl-C requests cancellation; the run stops before the next block.
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .context("Failed to install Ctrl-C handler")?;

    let (handle, events) = spawn_programming(bootloader, image, cancel);

    let pb = progress_bar(cli.quiet);
    drive_progress(&pb, &events);

    let (mut bootloader, result) = handle
        .join()
        .map_err(|_| anyhow!("Programming worker panicked"))?;

    match result {
        Ok(done) => {
            pb.finish_with_message("complete");
            if !cli.quiet {
                print_done(&done);
            }
            Ok(())
        },
        Err(hidboot::Error::Cancelled) => {
            pb.abandon_with_message("cancelled");
            // A cancelled run leaves the link in bootload mode.
            if let Err(e) = bootloader
                .channel_mut()
                .switch_mode(LinkMode::Normal)
            {
                warn!("Could not switch the link back to normal mode: {e}");
            }
            Err(CliError::Cancelled("Programming cancelled".to_string()).into())
        },
        Err(e) => {
            pb.abandon_with_message("failed");
            Err(anyhow::Error::new(e).context(format!("Programming {} failed", image.display())))
        },
    }
}

/// Ask before erasing the target. Non-interactive runs proceed.
fn confirm(cli: &Cli, port: &str) -> Result<bool> {
    if cli.non_interactive {
        return Ok(true);
    }
    if !(std::io::stdin().is_terminal() && std::io::stderr().is_terminal()) {
        return Err(CliError::Usage(
            "Confirmation needs a terminal. Pass --yes or --non-interactive".to_string(),
        )
        .into());
    }

    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "Erase the application on the target behind {port} and program it?"
        ))
        .default(false)
        .interact()
        .map_err(|e| CliError::Cancelled(format!("Prompt failed: {e}")).into())
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Feed events into the bar until the worker drops its sender.
fn drive_progress(pb: &ProgressBar, events: &Receiver<FlashEvent>) {
    for event in events {
        match event {
            FlashEvent::State(state) => {
                debug!("State: {state}");
                pb.set_message(state.to_string());
            },
            FlashEvent::Progress { percent, .. } => pb.set_position(u64::from(percent)),
            FlashEvent::Block {
                address, rewinds, ..
            } if rewinds > 0 => {
                pb.println(format!(
                    "{} Block 0x{address:08X} needed {rewinds} rewind(s)",
                    style("⚠").yellow()
                ));
            },
            FlashEvent::Block { .. } => {},
        }
    }
}

fn print_image(summary: &ImageSummary) {
    eprintln!(
        "{} {} lines, 0x{:08X}..0x{:08X}, {} bytes",
        style("✓").green(),
        summary.line_count,
        summary.start_address,
        summary.end(),
        summary.transfer_size()
    );
}

fn print_done(done: &FlashSummary) {
    eprintln!(
        "\n{} Programmed {} bytes in {} blocks ({} rewinds) in {:.1}s",
        style("🎉").green().bold(),
        done.bytes,
        done.blocks,
        done.rewinds,
        done.elapsed.as_secs_f64()
    );
}

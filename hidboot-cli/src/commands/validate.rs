//! Image validation command.

use anyhow::{Context, Result};
use console::style;
use hidboot::{ImageSummary, validate_file};
use std::path::Path;

use crate::Cli;
use crate::config::Config;

/// Validate command implementation.
pub(crate) fn cmd_validate(cli: &Cli, config: &Config, image: &Path, json: bool) -> Result<()> {
    let board = cli.resolve_board(config)?;
    let target = config.target_config(board)?;

    let summary = validate_file(image, &target.layout)
        .with_context(|| format!("Failed to validate {}", image.display()))?;

    if json {
        println!("{}", summary_json(image, &board.to_string(), &summary)?);
        return Ok(());
    }

    if cli.quiet {
        println!("{}", summary.line_count);
        return Ok(());
    }

    println!(
        "{} {} ({board})",
        style("✓").green(),
        style(image.display()).bold()
    );
    println!("    {:<10} {}", "lines", summary.line_count);
    println!("    {:<10} 0x{:08X}", "start", summary.start_address);
    println!(
        "    {:<10} 0x{:08X} (+{} bytes)",
        "end", summary.end_address, summary.end_byte_count
    );
    println!("    {:<10} {} bytes", "transfer", summary.transfer_size());
    println!(
        "    {:<10} {} x {} bytes",
        "blocks",
        (summary.transfer_size() as usize).div_ceil(target.layout.block_size),
        target.layout.block_size
    );

    Ok(())
}

fn summary_json(image: &Path, board: &str, summary: &ImageSummary) -> Result<String> {
    let value = serde_json::json!({
        "path": image.display().to_string(),
        "board": board,
        "line_count": summary.line_count,
        "start_address": summary.start_address,
        "end_address": summary.end_address,
        "end_byte_count": summary.end_byte_count,
        "transfer_size": summary.transfer_size(),
    });
    Ok(serde_json::to_string_pretty(&value)?)
}

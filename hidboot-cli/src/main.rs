//! hidboot CLI - Command-line tool for flashing Intel-HEX firmware through a
//! report-link bootloader.
//!
//! ## Features
//!
//! - Validate Intel-HEX images against a board's memory layout
//! - Flash images with a progress bar and Ctrl-C cancellation
//! - List board revisions and their opcode tables
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use hidboot::BoardRevision;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Baud rate used when neither flags nor config files name one.
const DEFAULT_BAUD: u32 = hidboot::port::DEFAULT_BAUD;

/// hidboot - Flash Intel-HEX firmware through a report-link bootloader.
///
/// Environment variables:
///   HIDBOOT_PORT              - Serial bridge to use
///   HIDBOOT_BAUD              - Baud rate (default: 115200)
///   HIDBOOT_BOARD             - Board revision (rev-a, rev-b, rev-c)
///   HIDBOOT_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "hidboot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Serial bridge the report link runs over.
    #[arg(short, long, global = true, env = "HIDBOOT_PORT")]
    pub(crate) port: Option<String>,

    /// Baud rate of the bridge.
    #[arg(short, long, global = true, env = "HIDBOOT_BAUD")]
    pub(crate) baud: Option<u32>,

    /// Target board revision.
    #[arg(long, global = true, env = "HIDBOOT_BOARD")]
    pub(crate) board: Option<Board>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "HIDBOOT_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Supported board revisions.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub(crate) enum Board {
    /// First-generation control board (default).
    RevA,
    /// Second-generation control board.
    RevB,
    /// Third-generation control board.
    RevC,
}

impl From<Board> for BoardRevision {
    fn from(board: Board) -> Self {
        match board {
            Board::RevA => BoardRevision::RevA,
            Board::RevB => BoardRevision::RevB,
            Board::RevC => BoardRevision::RevC,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Check an Intel-HEX image and print its summary.
    Validate {
        /// Path to the Intel-HEX image.
        image: PathBuf,

        /// Output the summary as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Validate and program an Intel-HEX image.
    Flash {
        /// Path to the Intel-HEX image.
        image: PathBuf,

        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// List board revisions and their opcode tables.
    Profiles {
        /// Output the table as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or configuration.
    #[error("{0}")]
    Usage(String),
    /// Stopped by the user.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Map an error chain to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(cli_err) = cause.downcast_ref::<CliError>() {
            return cli_err.exit_code();
        }
        if let Some(hidboot::Error::Cancelled) = cause.downcast_ref::<hidboot::Error>() {
            return 130;
        }
    }
    1
}

impl Cli {
    /// Board from the flag, then the config file, then the default.
    pub(crate) fn resolve_board(&self, config: &Config) -> Result<BoardRevision> {
        if let Some(board) = self.board {
            return Ok(board.into());
        }
        Ok(config
            .board()?
            .unwrap_or_default())
    }

    /// Port from the flag, then the config file.
    pub(crate) fn resolve_port(&self, config: &Config) -> Result<String> {
        self.port
            .clone()
            .or_else(|| {
                config
                    .connection
                    .port
                    .clone()
            })
            .ok_or_else(|| {
                CliError::Usage(
                    "No serial port given. Use --port, HIDBOOT_PORT or [connection] port in hidboot.toml"
                        .to_string(),
                )
                .into()
            })
    }

    /// Baud rate from the flag, then the config file, then the default.
    pub(crate) fn resolve_baud(&self, config: &Config) -> u32 {
        self.baud
            .or(config.connection.baud)
            .unwrap_or(DEFAULT_BAUD)
    }
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version go to stdout with status 0, usage errors to stderr.
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            };
        },
    };

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "hidboot v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Validate { image, json } => {
            commands::validate::cmd_validate(cli, &config, image, *json)
        },
        Commands::Flash { image, yes } => commands::flash::cmd_flash(cli, &config, image, *yes),
        Commands::Profiles { json } => commands::profiles::cmd_profiles(*json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_exit_codes() {
        let usage = anyhow::Error::from(CliError::Usage("bad".into()));
        assert_eq!(exit_code_for(&usage), 2);

        let cancelled = anyhow::Error::from(CliError::Cancelled("stop".into()));
        assert_eq!(exit_code_for(&cancelled), 130);

        let lib_cancel = anyhow::Error::from(hidboot::Error::Cancelled);
        assert_eq!(exit_code_for(&lib_cancel), 130);

        let other = anyhow::anyhow!("boom");
        assert_eq!(exit_code_for(&other), 1);
    }

    #[test]
    fn test_exit_code_sees_through_context() {
        let err = Err::<(), _>(CliError::Usage("bad".into()))
            .context("while flashing")
            .unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "hidboot",
            "validate",
            "fw.hex",
            "--board",
            "rev-c",
            "--port",
            "/dev/ttyACM0",
            "-vv",
        ])
        .unwrap();
        assert!(matches!(cli.board, Some(Board::RevC)));
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_resolution_order() {
        let cli = Cli::try_parse_from(["hidboot", "profiles"]).unwrap();
        let mut config = Config::default();
        assert_eq!(cli.resolve_baud(&config), DEFAULT_BAUD);
        assert!(cli.resolve_port(&config).is_err());
        assert_eq!(cli.resolve_board(&config).unwrap(), BoardRevision::RevA);

        config.connection.port = Some("/dev/ttyUSB3".into());
        config.connection.baud = Some(57600);
        config.target.board = Some("rev-b".into());
        assert_eq!(cli.resolve_port(&config).unwrap(), "/dev/ttyUSB3");
        assert_eq!(cli.resolve_baud(&config), 57600);
        assert_eq!(cli.resolve_board(&config).unwrap(), BoardRevision::RevB);

        let cli = Cli::try_parse_from(["hidboot", "--baud", "9600", "--board", "rev-c", "profiles"])
            .unwrap();
        assert_eq!(cli.resolve_baud(&config), 9600);
        assert_eq!(cli.resolve_board(&config).unwrap(), BoardRevision::RevC);
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}

//! CLI surface for dirrepl.
//!
//! Two jobs: run an in-process replication topology and report what the
//! writer saw, and show the effective configuration.

use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

use crate::Result;
use crate::config::Config;
use crate::core::AssuredRequest;
use crate::sim::ReaderBehavior;

mod commands;
mod render;

// =============================================================================
// Entry + global options
// =============================================================================

#[derive(Parser, Debug)]
#[command(
    name = "dirrepl",
    version,
    about = "Assured replication for a multi-master directory",
    infer_subcommands = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Machine-readable JSON output.
    #[arg(long, global = true)]
    pub json: bool,

    /// Config file layered over the user config.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run writes through an in-process topology and report the outcome.
    #[command(alias = "sim")]
    Simulate(SimulateArgs),

    /// Inspect configuration.
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCmd {
    /// Print the effective configuration as TOML.
    Show,
    /// Print the user config file location.
    Path,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Send and forget.
    #[value(name = "none")]
    NotAssured,
    SafeRead,
    SafeData,
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Replication servers, fully meshed.
    #[arg(long, default_value_t = 1)]
    pub relays: usize,

    /// Directory servers that replay normally.
    #[arg(long, default_value_t = 1)]
    pub readers: usize,

    /// Directory servers whose replay always fails.
    #[arg(long, default_value_t = 0)]
    pub failing: usize,

    /// Directory servers that never replay.
    #[arg(long, default_value_t = 0)]
    pub stalled: usize,

    /// Assured mode for every write. Defaults to the configured one.
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Safe-data level.
    #[arg(long, default_value_t = 1)]
    pub level: u8,

    #[arg(long, default_value_t = 10)]
    pub writes: usize,

    /// Per-write assured timeout. Defaults to the writer's configured one.
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Time each reader spends replaying one update.
    #[arg(long, value_name = "MS", default_value_t = 0)]
    pub replay_delay_ms: u64,
}

impl SimulateArgs {
    fn behaviors(&self) -> Vec<ReaderBehavior> {
        std::iter::repeat_n(ReaderBehavior::Replay, self.readers)
            .chain(std::iter::repeat_n(ReaderBehavior::Fail, self.failing))
            .chain(std::iter::repeat_n(ReaderBehavior::Stall, self.stalled))
            .collect()
    }

    fn request(&self, config: &Config) -> Result<Option<AssuredRequest>> {
        Ok(match self.mode {
            None => config.replication.default_request()?,
            Some(ModeArg::NotAssured) => None,
            Some(ModeArg::SafeRead) => Some(AssuredRequest::SafeRead),
            Some(ModeArg::SafeData) => Some(AssuredRequest::safe_data(self.level)?),
        })
    }
}

// =============================================================================
// Public API
// =============================================================================

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

/// Run the CLI (used by bin).
pub fn run(cli: Cli, config: &Config) -> Result<()> {
    match cli.command {
        Commands::Simulate(args) => commands::simulate::handle(&args, config, cli.json),
        Commands::Config { cmd } => commands::config::handle(cmd, config, cli.config.as_deref()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let s = serde_json::to_string_pretty(value)?;
    print_line(&s)
}

fn print_line(s: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    if let Err(e) = writeln!(stdout, "{s}")
        && e.kind() != std::io::ErrorKind::BrokenPipe
    {
        return Err(e.into());
    }
    Ok(())
}

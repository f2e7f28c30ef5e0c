mod cmd;
mod core;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

/// Exit code for broken regime definitions and engine faults (EX_SOFTWARE)
const EXIT_DEFECT: i32 = 70;
/// Exit code when another writer held the period chain (EX_TEMPFAIL)
const EXIT_RETRY: i32 = 75;

#[derive(Parser, Debug)]
#[command(
    name = "vntax",
    version,
    about = "Derive Vietnamese tax return boxes and carry credits across filing periods"
)]
struct Cli {
    /// Directory of extra regime definitions (*.json), loaded at start
    #[arg(long, global = true, env = "VNTAX_SCHEMAS")]
    schemas: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the box layout of a regime
    Boxes(cmd::boxes::BoxesCommand),
    /// Derive every box of a return from raw inputs
    Evaluate(cmd::evaluate::EvaluateCommand),
    /// Create, close, reopen and list filing periods
    Period(cmd::period::PeriodCommand),
    /// Print expected input formats
    Schema(cmd::schema::SchemaCommand),
    /// Check regime definition files
    Validate(cmd::validate::ValidateCommand),
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let registry = Arc::new(cmd::load_registry(cli.schemas.as_deref())?);
    match cli.command {
        Command::Boxes(cmd) => cmd.exec(&registry),
        Command::Evaluate(cmd) => cmd.exec(&registry),
        Command::Period(cmd) => cmd.exec(registry),
        Command::Schema(cmd) => cmd.exec(&registry),
        Command::Validate(cmd) => cmd.exec(&registry),
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<core::Error>() {
        Some(e) if e.is_retryable() => EXIT_RETRY,
        Some(e) if e.is_defect() => EXIT_DEFECT,
        _ => 1,
    }
}

fn main() {
    pretty_env_logger::init();

    if let Err(err) = run(Cli::parse()) {
        eprintln!("Error: {err:#}");
        std::process::exit(exit_code(&err));
    }
}

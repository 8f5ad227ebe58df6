//! CLI for the shackle single-shot jail.
//!
//! `shackle <program> [args...]` runs `program` in a fresh jail, relays
//! stdin/stdout and exits with the jailed program's status. Logs go to
//! stderr, filtered by `SHACKLE_LOG` (default `warn`).

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use shackle::{EXIT_FAILURE, EXIT_USAGE};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
const ENV_LOG: &str = "SHACKLE_LOG";

#[derive(Parser)]
#[command(
    name = "shackle",
    version,
    about = "Run one untrusted program in a chroot + seccomp jail"
)]
struct Cli {
    /// Executable to stage and run.
    program: PathBuf,

    /// Arguments passed to the program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return exit(if e.use_stderr() { EXIT_USAGE } else { 0 });
        }
    };
    init_logging();

    match run(cli) {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("shackle: {}", report(&e));
            exit(EXIT_FAILURE)
        }
    }
}

#[cfg(target_os = "linux")]
fn run(cli: Cli) -> Result<i32> {
    let config = shackle::Config::load().context("load configuration")?;
    let invocation = shackle::Invocation::new(cli.program, cli.args);
    let report = shackle::run(&config, &invocation)
        .with_context(|| format!("run {}", invocation.program.display()))?;
    Ok(report.outcome.code())
}

#[cfg(not(target_os = "linux"))]
fn run(_cli: Cli) -> Result<i32> {
    anyhow::bail!("shackle only runs on Linux")
}

/// Installs the stderr-only subscriber.
fn init_logging() {
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Renders the context chain down to the first library error, whose own
/// message already includes its source.
fn report(e: &anyhow::Error) -> String {
    let mut msg = String::new();
    for cause in e.chain() {
        if !msg.is_empty() {
            msg.push_str(": ");
        }
        msg.push_str(&cause.to_string());
        if cause.is::<shackle::Error>() {
            break;
        }
    }
    msg
}

/// Converts a status (0..=255 after masking) into an [`ExitCode`].
fn exit(code: i32) -> ExitCode {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    ExitCode::from((code & 0xff) as u8)
}

// CLI module
// Command-line and environment configuration

mod args;

pub use args::{CliArgs, LogFormat};

use clap::Parser;

/// Parse command-line arguments using clap
///
/// Every option falls back to its environment variable. If parsing fails
/// (e.g., a missing accrual address or an invalid value) or `--help` is
/// given, clap prints the message and exits the process.
pub fn parse_args() -> CliArgs {
    CliArgs::parse()
}

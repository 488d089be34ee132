//! Command-line interface for fnbox.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};

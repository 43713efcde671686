use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

pub const DEFAULT_LEDGER_PATH: &str = "fabhouse-ledger.json";

#[derive(Debug, Parser)]
#[command(
    name = "fabhouse",
    version,
    about = "House registry chaincode running against a local ledger file"
)]
pub struct Cli {
    /// Snapshot file holding the world state.
    #[arg(long, env = "FABHOUSE_LEDGER", default_value = DEFAULT_LEDGER_PATH)]
    pub ledger: PathBuf,

    /// Log filter; `RUST_LOG` takes precedence when set.
    #[arg(long, env = "FABHOUSE_LOG", default_value = "info")]
    pub log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Instantiate the chaincode, creating the ledger file if needed.
    Instantiate,
    /// Run a function and commit its writes on success.
    Invoke {
        function: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Run a function without committing anything.
    Query {
        function: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print the ledger height and state root.
    StateRoot,
    /// Print the ledger snapshot as JSON.
    Dump,
}

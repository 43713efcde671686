use std::io::{self, Write};
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fabhouse::config::{Cli, Command, LogFormat};
use fabhouse::store::{self, StoreError};
use fabhouse::{HouseContract, Invocation, Peer, Response};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] fabhouse::LedgerError),
    #[error("cannot write output: {0}")]
    Output(#[from] io::Error),
    #[error("cannot render snapshot: {0}")]
    Render(#[from] serde_json::Error),
}

fn init_tracing(log_level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .init(),
    }
}

/// Payload goes to stdout, failure messages to stderr.
fn report(response: Response) -> Result<ExitCode, CliError> {
    if response.is_ok() {
        let mut out = io::stdout().lock();
        if !response.payload.is_empty() {
            out.write_all(&response.payload)?;
            out.write_all(b"\n")?;
        }
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("Error: {}", response.message);
        Ok(ExitCode::from(1))
    }
}

fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let peer = Peer::new(HouseContract);
    let mut state = store::load_state(&cli.ledger)?;

    match cli.command {
        Command::Instantiate => {
            let (response, _) = peer.instantiate(&mut state);
            if response.is_ok() {
                store::save_state(&cli.ledger, &state)?;
            }
            report(response)
        }
        Command::Invoke { function, args } => {
            let invocation = Invocation::new(function, args);
            let (response, receipt) = peer.invoke(&mut state, &invocation);
            if receipt.committed {
                store::save_state(&cli.ledger, &state)?;
            }
            report(response)
        }
        Command::Query { function, args } => {
            let invocation = Invocation::new(function, args);
            let (response, _) = peer.query(&mut state, &invocation);
            report(response)
        }
        Command::StateRoot => {
            println!(
                "height={} root={}",
                state.height(),
                hex::encode(state.state_root())
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Dump => {
            let snapshot = state.snapshot()?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "fabhouse failed");
            eprintln!("error: {err}");
            ExitCode::from(2)
        }
    }
}

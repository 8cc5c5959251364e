//! Command-line entry point for the load-generation client

use std::process::ExitCode;

use netsurge::config::{PerfConfig, HELP_TEXT};
use netsurge::PerfClient;

fn main() -> ExitCode {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() || args.iter().any(|arg| is_help(arg)) {
        print!("{HELP_TEXT}");
        return ExitCode::FAILURE;
    }

    let config = match PerfConfig::parse(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            print!("{HELP_TEXT}");
            return ExitCode::FAILURE;
        }
    };

    let mut client = match PerfClient::new(config) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = client.start() {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }
    client.wait(0);
    ExitCode::SUCCESS
}

fn is_help(arg: &str) -> bool {
    matches!(arg, "?" | "-?" | "help" | "-help" | "--help")
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();
}

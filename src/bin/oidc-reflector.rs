//! Process entry point for the OIDC reflector.

// std
use std::process::ExitCode;
// crates.io
use clap::Parser;
// self
use oidc_reflector::{Cli, Result};

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();

	if let Err(err) = oidc_reflector::setup_tracing(&cli.log_level, cli.log_format) {
		eprintln!("oidc-reflector: {err}");

		return ExitCode::FAILURE;
	}

	match run(cli).await {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			tracing::error!(error = %err, kind = err.kind(), "reflector stopped");

			ExitCode::FAILURE
		},
	}
}

async fn run(cli: Cli) -> Result<()> {
	let config = cli.into_config()?;

	oidc_reflector::serve(config).await
}

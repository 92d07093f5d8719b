//! Vonnegut server binary

use clap::Parser;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;
use vonnegut::{Server, ServerArgs, ServerConfig};

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("vonnegut={log_level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = ServerArgs::parse();

    let config = match ServerConfig::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("vonnegut: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.log_level);

    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server exited with error");
            ExitCode::FAILURE
        }
    }
}

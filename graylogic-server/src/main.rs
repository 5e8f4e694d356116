//! Gray Logic Core server binary
//!
//! Usage: `graylogic-server [config.yaml]`
//!
//! Exit codes: 0 normal, 1 configuration error, 2 startup failure.

use std::path::PathBuf;
use std::process::ExitCode;

use graylogic_core::config::Config;
use graylogic_core::server::{init_tracing, GrayLogicCore};
use graylogic_core::Error;

#[tokio::main]
async fn main() -> ExitCode {
    let config_path: Option<PathBuf> = std::env::args().nth(1).map(PathBuf::from);

    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    init_tracing(&config);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?config_path,
        "gray logic core starting"
    );

    let core = match GrayLogicCore::build(config).await {
        Ok(core) => core,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            return ExitCode::from(2);
        }
    };

    match core.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ Error::ConfigInvalid(_)) => {
            tracing::error!(error = %e, "configuration error");
            ExitCode::from(1)
        }
        Err(e) => {
            tracing::error!(error = %e, "server error");
            ExitCode::from(2)
        }
    }
}

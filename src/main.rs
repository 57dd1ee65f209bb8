//! AWS MFA Session Refresher
//!
//! Keeps a profile in the AWS credentials file supplied with temporary, MFA-authenticated
//! session credentials.
//!
//! The program performs the following operations:
//! 1. Parses command-line arguments into an immutable [`config::Config`]
//! 2. Checks that long-term credentials exist in the `<profile>-mfa` section
//! 3. Skips the refresh if the cached session is still valid (by expiration or probe call)
//! 4. Lists the account's MFA devices and asks for a device and its current code
//! 5. Exchanges the code for a session and writes it into the `<profile>` section

use std::process::ExitCode;

use clap::Parser;
use log::error;

mod aws;
mod cli;
mod config;
mod credentials;
mod mfa;
mod updater;
mod validator;

use cli::Args;
use config::Config;
use updater::AwsMfaUpdater;

/// Main entry point for the AWS MFA session refresher.
///
/// This function orchestrates a single refresh run:
/// 1. Initializes logging with INFO level filtering
/// 2. Parses command-line arguments and resolves them into a [`Config`]
/// 3. Creates an AWS MFA updater wired to AWS and the terminal
/// 4. Runs the refresh and reports how it ended
///
/// # Returns
/// * `ExitCode::SUCCESS` - The session was refreshed, was still valid, or the run ended with an
///   expected outcome such as a missing `-mfa` profile, no MFA device or a rejected code
/// * `ExitCode::FAILURE` - A fatal setup or I/O error, logged with its full cause chain
#[tokio::main]
async fn main() -> ExitCode {
    // INFO by default, overridable with RUST_LOG.
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let config = match Config::from_args(Args::parse()) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    match AwsMfaUpdater::new(config).update_credentials().await {
        Ok(outcome) => {
            updater::report(&outcome);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

//! Command-line interface definitions.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// AWS MFA session refresher.
///
/// Refreshes temporary AWS credentials for a profile by exchanging an MFA code for a session
/// token. Reads long-term credentials from the `[<profile>-mfa]` section and writes the
/// temporary session to the `[<profile>]` section of the credentials file.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// Path to AWS credentials file [default: ~/.aws/credentials]
    #[arg(short, long, env = "AWS_SHARED_CREDENTIALS_FILE")]
    pub config: Option<PathBuf>,

    /// Profile to refresh; long-term credentials are read from `<profile>-mfa`
    #[arg(short, long, default_value = "default")]
    pub profile: String,

    /// AWS region for IAM and STS calls [default: SDK region chain, then eu-west-1]
    #[arg(short, long)]
    pub region: Option<String>,

    /// Session duration in seconds (900-129600)
    #[arg(
        short,
        long,
        env = "AWS_SESSION_DURATION",
        default_value = "43200",
        value_parser = clap::value_parser!(u32).range(900..=129600)
    )]
    pub duration: u32,

    /// How to decide whether the cached session is still usable
    #[arg(long, value_enum, default_value_t = ValidatorKind::Expiration)]
    pub validator: ValidatorKind,

    /// 1Password account for automatic MFA code retrieval
    #[arg(long, env = "AWS_MFA_OP_ACCOUNT", requires = "op_item_name")]
    pub op_account: Option<String>,

    /// 1Password item name containing the TOTP
    #[arg(long, env = "AWS_MFA_OP_ITEM_NAME", requires = "op_account")]
    pub op_item_name: Option<String>,
}

/// Session validity strategy.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidatorKind {
    /// Compare the stored `expiration` with the current time
    Expiration,
    /// Issue a cheap authenticated call with the cached session
    Probe,
}

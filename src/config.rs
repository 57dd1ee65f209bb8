//! Immutable run configuration resolved from the command line.

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::cli::{Args, ValidatorKind};

/// 1Password item used as an MFA code source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnePassword {
    pub account: String,
    pub item: String,
}

/// Everything a refresh run needs to know, fixed before the run starts.
#[derive(Clone, Debug)]
pub struct Config {
    /// Credentials file to read and rewrite.
    pub credentials_path: PathBuf,
    /// Profile receiving the temporary session.
    pub profile: String,
    /// Explicit region; `None` defers to the SDK region chain.
    pub region: Option<String>,
    /// Requested session lifetime in seconds.
    pub duration: u32,
    pub validator: ValidatorKind,
    pub one_password: Option<OnePassword>,
}

impl Config {
    /// Resolves defaults that depend on the environment, such as the home directory.
    pub fn from_args(args: Args) -> Result<Self> {
        let Args {
            config,
            profile,
            region,
            duration,
            validator,
            op_account,
            op_item_name,
        } = args;

        let credentials_path = match config {
            Some(path) => path,
            None => dirs::home_dir()
                .map(|d| d.join(".aws").join("credentials"))
                .context("Could not determine home directory")?,
        };

        let one_password = match (op_account, op_item_name) {
            (Some(account), Some(item)) => Some(OnePassword { account, item }),
            _ => None,
        };

        Ok(Self {
            credentials_path,
            profile,
            region,
            duration,
            validator,
            one_password,
        })
    }

    /// Section holding the long-term credentials used to request sessions.
    pub fn source_profile(&self) -> String {
        format!("{}-mfa", self.profile)
    }
}

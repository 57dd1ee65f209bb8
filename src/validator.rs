//! Decides whether the cached session of a profile can still be used.

use async_trait::async_trait;
use aws_sdk_sts::config::Credentials;
use chrono::{DateTime, Utc};

use crate::{
    aws::{CallerIdentity, StsCallerIdentity},
    cli::ValidatorKind,
    credentials::{
        ACCESS_KEY_ID, CredentialsFile, EXPIRATION, SECRET_ACCESS_KEY, SESSION_TOKEN,
        format_expiration, parse_expiration,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    Valid { expires_at: Option<DateTime<Utc>> },
    Invalid { reason: String },
}

impl Validity {
    fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait SessionValidator: Send + Sync {
    async fn validate(&self, file: &CredentialsFile, profile: &str) -> Validity;
}

/// Builds the validator selected on the command line.
pub fn from_kind(kind: ValidatorKind, region: Option<String>) -> Box<dyn SessionValidator> {
    match kind {
        ValidatorKind::Expiration => Box::new(ExpirationValidator::new()),
        ValidatorKind::Probe => Box::new(ProbeValidator::new(region)),
    }
}

/// Compares the stored `expiration` with the clock. Never touches the network.
pub struct ExpirationValidator {
    clock: fn() -> DateTime<Utc>,
}

impl ExpirationValidator {
    pub fn new() -> Self {
        Self { clock: Utc::now }
    }

    #[cfg(test)]
    fn with_clock(clock: fn() -> DateTime<Utc>) -> Self {
        Self { clock }
    }
}

impl Default for ExpirationValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionValidator for ExpirationValidator {
    async fn validate(&self, file: &CredentialsFile, profile: &str) -> Validity {
        if !file.has_section(profile) {
            return Validity::invalid(format!("profile \"{profile}\" has no cached session"));
        }
        let Some(stored) = file.get(profile, EXPIRATION) else {
            return Validity::invalid(format!("profile \"{profile}\" has no expiration"));
        };

        match parse_expiration(&stored) {
            Ok(expires_at) if expires_at > (self.clock)() => Validity::Valid {
                expires_at: Some(expires_at),
            },
            Ok(expires_at) => Validity::invalid(format!(
                "session of profile \"{profile}\" expired at {}",
                format_expiration(&expires_at)
            )),
            Err(e) => Validity::invalid(format!(
                "expiration in profile \"{profile}\" is in the wrong format: {e:#}"
            )),
        }
    }
}

/// Calls STS with the cached session; any failure means the session is unusable.
pub struct ProbeValidator {
    identity: Box<dyn CallerIdentity>,
}

impl ProbeValidator {
    pub fn new(region: Option<String>) -> Self {
        Self::with_identity(Box::new(StsCallerIdentity::new(region)))
    }

    pub fn with_identity(identity: Box<dyn CallerIdentity>) -> Self {
        Self { identity }
    }
}

#[async_trait]
impl SessionValidator for ProbeValidator {
    async fn validate(&self, file: &CredentialsFile, profile: &str) -> Validity {
        let (Some(access_key_id), Some(secret_access_key)) = (
            file.get(profile, ACCESS_KEY_ID),
            file.get(profile, SECRET_ACCESS_KEY),
        ) else {
            return Validity::invalid(format!("profile \"{profile}\" has no cached session"));
        };
        let credentials = Credentials::new(
            access_key_id,
            secret_access_key,
            file.get(profile, SESSION_TOKEN),
            None,
            "aws-mfa-session-cached",
        );

        match self.identity.check(credentials).await {
            Ok(()) => Validity::Valid {
                expires_at: file
                    .get(profile, EXPIRATION)
                    .and_then(|stored| parse_expiration(&stored).ok()),
            },
            Err(e) => Validity::invalid(format!("cached session was rejected: {e:#}")),
        }
    }
}

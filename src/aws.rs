//! IAM and STS calls backing the MFA challenge.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig, meta::region::RegionProviderChain};
use aws_sdk_sts::{
    config::{Credentials, Region},
    types,
};
use chrono::{DateTime, Utc};
use log::debug;

use crate::credentials::{Session, SourceCredentials};

/// Region used when neither the flag nor the SDK region chain yields one.
const FALLBACK_REGION: &str = "eu-west-1";

/// Account-side operations needed to mint a new session.
#[async_trait]
pub trait MfaService: Send + Sync {
    /// Serial numbers of every MFA device attached to the caller.
    async fn list_mfa_devices(&self, source: &SourceCredentials) -> Result<Vec<String>>;

    /// Exchanges a device serial and its current code for temporary credentials.
    async fn get_session_token(
        &self,
        source: &SourceCredentials,
        serial_number: &str,
        token_code: &str,
    ) -> Result<Session>;
}

/// [`MfaService`] talking to AWS.
pub struct AwsMfaService {
    region: Option<String>,
    duration: u32,
}

impl AwsMfaService {
    pub fn new(region: Option<String>, duration: u32) -> Self {
        Self { region, duration }
    }
}

#[async_trait]
impl MfaService for AwsMfaService {
    async fn list_mfa_devices(&self, source: &SourceCredentials) -> Result<Vec<String>> {
        let config = sdk_config(self.region.as_deref(), source.credentials()).await;

        let devices = aws_sdk_iam::Client::new(&config)
            .list_mfa_devices()
            .into_paginator()
            .items()
            .send()
            .try_collect()
            .await?;

        debug!("Found {} MFA device(s)", devices.len());
        Ok(devices
            .iter()
            .map(|device| device.serial_number().to_owned())
            .collect())
    }

    async fn get_session_token(
        &self,
        source: &SourceCredentials,
        serial_number: &str,
        token_code: &str,
    ) -> Result<Session> {
        let config = sdk_config(self.region.as_deref(), source.credentials()).await;

        let credentials = aws_sdk_sts::Client::new(&config)
            .get_session_token()
            .duration_seconds(self.duration as i32)
            .serial_number(serial_number)
            .token_code(token_code)
            .send()
            .await?
            .credentials()
            .cloned()
            .context("No credentials returned")?;

        Session::try_from(&credentials)
    }
}

/// Cheap authenticated call used to tell whether cached credentials still work.
#[async_trait]
pub trait CallerIdentity: Send + Sync {
    async fn check(&self, credentials: Credentials) -> Result<()>;
}

/// [`CallerIdentity`] backed by STS `GetCallerIdentity`, which needs no IAM permissions.
pub struct StsCallerIdentity {
    region: Option<String>,
}

impl StsCallerIdentity {
    pub fn new(region: Option<String>) -> Self {
        Self { region }
    }
}

#[async_trait]
impl CallerIdentity for StsCallerIdentity {
    async fn check(&self, credentials: Credentials) -> Result<()> {
        let config = sdk_config(self.region.as_deref(), credentials).await;
        let identity = aws_sdk_sts::Client::new(&config)
            .get_caller_identity()
            .send()
            .await?;
        debug!("Cached session belongs to {}", identity.arn().unwrap_or("unknown"));
        Ok(())
    }
}

async fn sdk_config(region: Option<&str>, credentials: Credentials) -> SdkConfig {
    let region = RegionProviderChain::first_try(region.map(|r| Region::new(r.to_owned())))
        .or_default_provider()
        .or_else(Region::from_static(FALLBACK_REGION));

    aws_config::defaults(BehaviorVersion::latest())
        .region(region)
        .credentials_provider(credentials)
        .load()
        .await
}

impl TryFrom<&types::Credentials> for Session {
    type Error = anyhow::Error;

    fn try_from(credentials: &types::Credentials) -> Result<Self> {
        Ok(Self {
            access_key_id: credentials.access_key_id().to_owned(),
            secret_access_key: credentials.secret_access_key().to_owned(),
            session_token: credentials.session_token().to_owned(),
            expiration: to_utc(credentials.expiration())?,
        })
    }
}

fn to_utc(time: &aws_smithy_types::DateTime) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(time.secs(), time.subsec_nanos())
        .with_context(|| format!("Expiration out of range: {time:?}"))
}

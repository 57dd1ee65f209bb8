//! AWS MFA session updater.
//!
//! Drives a single refresh of the `[<profile>]` section from the long-term credentials stored in
//! `[<profile>-mfa]`:
//!
//! 1. load the credentials file and check that the source profile exists
//! 2. ask the configured [`SessionValidator`] whether the cached session is still usable
//! 3. list MFA devices, pick one and collect its current code
//! 4. exchange the code for a temporary session through STS
//! 5. write all four session keys into `[<profile>]` and save the file once
//!
//! Fatal problems (unreadable file, missing long-term keys, terminal failures) are returned as
//! errors. Every expected way for a run to end is an [`Outcome`]; only
//! [`Outcome::Refreshed`] changes the file.

use std::fmt;

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::{
    aws::{AwsMfaService, MfaService},
    config::Config,
    credentials::{CredentialsFile, SourceCredentials, format_expiration},
    mfa::{Prompt, TerminalPrompt},
    validator::{self, SessionValidator, Validity},
};

/// How a refresh run ended.
#[derive(Debug)]
pub enum Outcome {
    /// The cached session is still usable; nothing was done.
    StillValid { expires_at: Option<DateTime<Utc>> },
    /// No `<profile>-mfa` section to request a session with.
    MissingSourceProfile { profile: String },
    DeviceListFailed(anyhow::Error),
    NoMfaDevice,
    /// The user cancelled a prompt.
    Cancelled,
    ExchangeFailed { device: String, error: anyhow::Error },
    Refreshed { expires_at: DateTime<Utc> },
}

impl Outcome {
    /// Whether the run ended the way the user asked for.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::StillValid { .. } | Self::Cancelled | Self::Refreshed { .. }
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StillValid {
                expires_at: Some(expires_at),
            } => write!(
                f,
                "You're still authenticated! Your credentials expire at {}",
                format_expiration(expires_at)
            ),
            Self::StillValid { expires_at: None } => write!(f, "You're still authenticated!"),
            Self::MissingSourceProfile { profile } => write!(
                f,
                "AWS profile \"{profile}-mfa\" not available! Suffix the profile you want to \
                 use with \"-mfa\", e.g. [{profile}] -> [{profile}-mfa]"
            ),
            Self::DeviceListFailed(error) => {
                write!(f, "An error occurred while listing MFA devices: {error:#}")
            }
            Self::NoMfaDevice => write!(f, "No MFA device found"),
            Self::Cancelled => write!(f, "MFA prompt cancelled, credentials left untouched"),
            Self::ExchangeFailed { device, error } => write!(
                f,
                "An error occurred while retrieving a session token for {device}: {error:#}"
            ),
            Self::Refreshed { expires_at } => write!(
                f,
                "Success! Credentials expire at: {}",
                format_expiration(expires_at)
            ),
        }
    }
}

/// AWS MFA session updater that refreshes one profile of the credentials file.
///
/// This struct ties together the pieces of a refresh run:
/// 1. The immutable [`Config`] resolved from the command line
/// 2. A [`SessionValidator`] deciding whether the cached session can be reused
/// 3. An [`MfaService`] listing MFA devices and exchanging codes for sessions
/// 4. A [`Prompt`] asking the user for a device and its current code
pub struct AwsMfaUpdater {
    /// Credentials path, profile, region and session duration for this run
    config: Config,
    validator: Box<dyn SessionValidator>,
    service: Box<dyn MfaService>,
    prompt: Box<dyn Prompt>,
}

impl AwsMfaUpdater {
    /// Creates an updater backed by AWS and the terminal.
    ///
    /// # Arguments
    ///
    /// * `config` - Run configuration. `config.validator` selects the validity strategy, while
    ///   `config.region` and `config.duration` are handed to the IAM/STS clients and
    ///   `config.one_password` enables the 1Password code source.
    ///
    /// No I/O happens here; the credentials file is only read by
    /// [`update_credentials`](Self::update_credentials).
    pub fn new(config: Config) -> Self {
        let validator = validator::from_kind(config.validator, config.region.clone());
        let service = AwsMfaService::new(config.region.clone(), config.duration);
        let prompt = TerminalPrompt::new(config.one_password.clone());
        Self::with_parts(config, validator, Box::new(service), Box::new(prompt))
    }

    /// Creates an updater from explicit collaborators.
    pub fn with_parts(
        config: Config,
        validator: Box<dyn SessionValidator>,
        service: Box<dyn MfaService>,
        prompt: Box<dyn Prompt>,
    ) -> Self {
        Self {
            config,
            validator,
            service,
            prompt,
        }
    }

    /// Refreshes the temporary session of the configured profile if it is no longer usable.
    ///
    /// This method performs the complete refresh workflow:
    /// 1. Loads the credentials file and checks for the `[<profile>-mfa]` section
    /// 2. Asks the validator whether the cached `[<profile>]` session is still usable
    /// 3. Lists the account's MFA devices with the long-term credentials
    /// 4. Picks a device (automatically when there is only one) and collects its code
    /// 5. Exchanges the code for a temporary session through STS
    /// 6. Writes all four session keys into `[<profile>]` and saves the file once
    ///
    /// # Returns
    ///
    /// * `Ok(Outcome::Refreshed { .. })` - The file now holds the new session
    /// * `Ok(outcome)` - Any other expected ending; the file was not touched
    ///
    /// # Errors
    ///
    /// This function will return an error if:
    /// * The credentials file is missing, unreadable or not valid INI
    /// * `[<profile>-mfa]` lacks `aws_access_key_id` or `aws_secret_access_key`
    /// * The terminal fails while prompting (other than the user cancelling)
    /// * The updated file cannot be written
    pub async fn update_credentials(&self) -> Result<Outcome> {
        let profile = &self.config.profile;
        let source_profile = self.config.source_profile();

        let mut file = CredentialsFile::load(&self.config.credentials_path).await?;
        debug!("Loaded credentials from {}", file.path().display());

        // Without long-term credentials there is nothing to request a session with
        if !file.has_section(&source_profile) {
            return Ok(Outcome::MissingSourceProfile {
                profile: profile.clone(),
            });
        }

        match self.validator.validate(&file, profile).await {
            Validity::Valid { expires_at } => return Ok(Outcome::StillValid { expires_at }),
            Validity::Invalid { reason } => info!("Requesting a new session: {reason}"),
        }

        // Missing long-term keys are a broken setup rather than an expected outcome
        let source = SourceCredentials::from_file(&file, &source_profile)?;

        let devices = match self.service.list_mfa_devices(&source).await {
            Ok(devices) => devices,
            Err(e) => return Ok(Outcome::DeviceListFailed(e)),
        };

        let device = match devices.as_slice() {
            [] => return Ok(Outcome::NoMfaDevice),
            [only] => {
                info!("Using MFA device {only}");
                only.clone()
            }
            _ => match self.prompt.select_device(&devices)? {
                Some(device) => device,
                None => return Ok(Outcome::Cancelled),
            },
        };

        let Some(code) = self.prompt.mfa_code(&device)? else {
            return Ok(Outcome::Cancelled);
        };

        info!("Fetching credentials - Duration: {}s", self.config.duration);
        let session = match self
            .service
            .get_session_token(&source, &device, &code)
            .await
        {
            Ok(session) => session,
            Err(error) => return Ok(Outcome::ExchangeFailed { device, error }),
        };

        // All four keys change in memory before the single write
        file.upsert_session(profile, &session)?;
        file.save().await?;

        Ok(Outcome::Refreshed {
            expires_at: session.expiration,
        })
    }
}

/// Logs the outcome at a level matching its severity.
pub fn report(outcome: &Outcome) {
    if outcome.is_success() {
        info!("{outcome}");
    } else {
        warn!("{outcome}");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use anyhow::anyhow;
    use async_trait::async_trait;
    use aws_sdk_sts::config::Credentials;
    use chrono::TimeZone;

    use super::*;
    use crate::{
        aws::CallerIdentity,
        cli::ValidatorKind,
        credentials::Session,
        validator::{ExpirationValidator, ProbeValidator},
    };

    const BASE: &str = "\
[unrelated]
aws_access_key_id=AKIAUNRELATED
aws_secret_access_key = unrelated-secret
; keep this comment

[default-mfa]
aws_access_key_id = AKIALONGTERM
aws_secret_access_key = long-term-secret
";

    #[derive(Default)]
    struct Calls {
        list: AtomicUsize,
        exchange: AtomicUsize,
        select: AtomicUsize,
        code: AtomicUsize,
    }

    struct FakeService {
        devices: Vec<String>,
        fail_exchange: bool,
        calls: Arc<Calls>,
        exchanged_with: Arc<Mutex<Option<(String, String)>>>,
    }

    #[async_trait]
    impl MfaService for FakeService {
        async fn list_mfa_devices(&self, _source: &SourceCredentials) -> Result<Vec<String>> {
            self.calls.list.fetch_add(1, Ordering::SeqCst);
            Ok(self.devices.clone())
        }

        async fn get_session_token(
            &self,
            _source: &SourceCredentials,
            serial_number: &str,
            token_code: &str,
        ) -> Result<Session> {
            self.calls.exchange.fetch_add(1, Ordering::SeqCst);
            *self.exchanged_with.lock().unwrap() =
                Some((serial_number.to_owned(), token_code.to_owned()));
            if self.fail_exchange {
                return Err(anyhow!("invalid MFA one time pass code"));
            }
            Ok(Session {
                access_key_id: "ASIAFRESH".into(),
                secret_access_key: "fresh-secret".into(),
                session_token: "fresh-token".into(),
                expiration: Utc.with_ymd_and_hms(2031, 1, 2, 3, 4, 5).unwrap(),
            })
        }
    }

    struct FakePrompt {
        device: Option<usize>,
        code: Option<&'static str>,
        calls: Arc<Calls>,
    }

    impl Prompt for FakePrompt {
        fn select_device(&self, devices: &[String]) -> Result<Option<String>> {
            self.calls.select.fetch_add(1, Ordering::SeqCst);
            Ok(self.device.map(|i| devices[i].clone()))
        }

        fn mfa_code(&self, _device: &str) -> Result<Option<String>> {
            self.calls.code.fetch_add(1, Ordering::SeqCst);
            Ok(self.code.map(str::to_owned))
        }
    }

    struct Harness {
        devices: Vec<String>,
        fail_exchange: bool,
        device: Option<usize>,
        code: Option<&'static str>,
        calls: Arc<Calls>,
        exchanged_with: Arc<Mutex<Option<(String, String)>>>,
    }

    impl Harness {
        fn new(devices: &[&str]) -> Self {
            Self {
                devices: devices.iter().map(|d| d.to_string()).collect(),
                fail_exchange: false,
                device: Some(0),
                code: Some("123456"),
                calls: Arc::default(),
                exchanged_with: Arc::default(),
            }
        }

        async fn run(&self, path: &Path, profile: &str) -> Outcome {
            self.run_with(path, profile, Box::new(ExpirationValidator::new()))
                .await
        }

        async fn run_with(
            &self,
            path: &Path,
            profile: &str,
            validator: Box<dyn SessionValidator>,
        ) -> Outcome {
            let config = Config {
                credentials_path: path.to_path_buf(),
                profile: profile.to_owned(),
                region: None,
                duration: 3600,
                validator: ValidatorKind::Expiration,
                one_password: None,
            };
            let service = FakeService {
                devices: self.devices.clone(),
                fail_exchange: self.fail_exchange,
                calls: self.calls.clone(),
                exchanged_with: self.exchanged_with.clone(),
            };
            let prompt = FakePrompt {
                device: self.device,
                code: self.code,
                calls: self.calls.clone(),
            };
            AwsMfaUpdater::with_parts(config, validator, Box::new(service), Box::new(prompt))
                .update_credentials()
                .await
                .unwrap()
        }

        fn count(&self, counter: fn(&Calls) -> &AtomicUsize) -> usize {
            counter(&self.calls).load(Ordering::SeqCst)
        }
    }

    fn write_credentials(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[tokio::test]
    async fn missing_source_profile_leaves_file_alone() {
        let (_dir, path) = write_credentials(BASE);
        let harness = Harness::new(&["arn:aws:iam::123456789012:mfa/phone"]);

        let outcome = harness.run(&path, "work").await;

        assert!(
            matches!(&outcome, Outcome::MissingSourceProfile { profile } if profile == "work")
        );
        assert!(outcome.to_string().contains("-mfa"));
        assert_eq!(read(&path), BASE);
        assert_eq!(harness.count(|c| &c.list), 0);
    }

    #[tokio::test]
    async fn unexpired_session_skips_network() {
        let contents = format!(
            "{BASE}\n[default]\naws_access_key_id = ASIA\nexpiration = 2999-01-01 00:00:00\n"
        );
        let (_dir, path) = write_credentials(&contents);
        let harness = Harness::new(&["arn:aws:iam::123456789012:mfa/phone"]);

        let outcome = harness.run(&path, "default").await;

        assert!(matches!(outcome, Outcome::StillValid { expires_at: Some(_) }));
        assert!(outcome.is_success());
        assert_eq!(read(&path), contents);
        assert_eq!(harness.count(|c| &c.list), 0);
        assert_eq!(harness.count(|c| &c.exchange), 0);
    }

    #[tokio::test]
    async fn expired_session_is_refreshed() {
        let contents = format!(
            "[default]\naws_access_key_id = ASIAOLD\naws_secret_access_key = old\n\
             aws_session_token = old-token\nexpiration = 2000-01-01 00:00:00\n\n{BASE}"
        );
        let (_dir, path) = write_credentials(&contents);
        let harness = Harness::new(&["arn:aws:iam::123456789012:mfa/phone"]);

        let outcome = harness.run(&path, "default").await;

        assert!(matches!(outcome, Outcome::Refreshed { .. }));
        let expected = format!(
            "[default]\naws_access_key_id = ASIAFRESH\naws_secret_access_key = fresh-secret\n\
             aws_session_token = fresh-token\nexpiration = 2031-01-02 03:04:05\n\n{BASE}"
        );
        assert_eq!(read(&path), expected);
        assert_eq!(harness.count(|c| &c.exchange), 1);
    }

    #[tokio::test]
    async fn unparsable_expiration_is_refreshed() {
        let contents = format!("{BASE}\n[default]\nexpiration = soon\n");
        let (_dir, path) = write_credentials(&contents);
        let harness = Harness::new(&["arn:aws:iam::123456789012:mfa/phone"]);

        let outcome = harness.run(&path, "default").await;

        assert!(matches!(outcome, Outcome::Refreshed { .. }));
        assert!(read(&path).contains("expiration = 2031-01-02 03:04:05\n"));
        assert!(!read(&path).contains("soon"));
    }

    #[tokio::test]
    async fn new_profile_is_appended_and_other_sections_kept() {
        let (_dir, path) = write_credentials(BASE);
        let harness = Harness::new(&["arn:aws:iam::123456789012:mfa/phone"]);

        let outcome = harness.run(&path, "default").await;

        assert!(matches!(outcome, Outcome::Refreshed { .. }));
        let written = read(&path);
        assert!(written.starts_with(BASE));
        let file = CredentialsFile::parse(path.clone(), written).unwrap();
        assert_eq!(file.get("default", "aws_access_key_id").as_deref(), Some("ASIAFRESH"));
        assert_eq!(file.get("default", "aws_secret_access_key").as_deref(), Some("fresh-secret"));
        assert_eq!(file.get("default", "aws_session_token").as_deref(), Some("fresh-token"));
        assert_eq!(
            file.get("default", "expiration").as_deref(),
            Some("2031-01-02 03:04:05")
        );
    }

    #[tokio::test]
    async fn single_device_is_selected_without_prompt() {
        let (_dir, path) = write_credentials(BASE);
        let harness = Harness::new(&["arn:aws:iam::123456789012:mfa/phone"]);

        harness.run(&path, "default").await;

        assert_eq!(harness.count(|c| &c.select), 0);
        assert_eq!(harness.count(|c| &c.code), 1);
        assert_eq!(
            *harness.exchanged_with.lock().unwrap(),
            Some((
                "arn:aws:iam::123456789012:mfa/phone".to_owned(),
                "123456".to_owned()
            ))
        );
    }

    #[tokio::test]
    async fn several_devices_prompt_for_selection() {
        let (_dir, path) = write_credentials(BASE);
        let mut harness = Harness::new(&[
            "arn:aws:iam::123456789012:mfa/phone",
            "arn:aws:iam::123456789012:mfa/yubikey",
        ]);
        harness.device = Some(1);

        harness.run(&path, "default").await;

        assert_eq!(harness.count(|c| &c.select), 1);
        let exchanged = harness.exchanged_with.lock().unwrap().clone();
        assert_eq!(
            exchanged.map(|(device, _)| device).as_deref(),
            Some("arn:aws:iam::123456789012:mfa/yubikey")
        );
    }

    #[tokio::test]
    async fn no_device_means_no_prompt() {
        let (_dir, path) = write_credentials(BASE);
        let harness = Harness::new(&[]);

        let outcome = harness.run(&path, "default").await;

        assert!(matches!(outcome, Outcome::NoMfaDevice));
        assert_eq!(harness.count(|c| &c.select), 0);
        assert_eq!(harness.count(|c| &c.code), 0);
        assert_eq!(read(&path), BASE);
    }

    #[tokio::test]
    async fn cancelled_selection_leaves_file_alone() {
        let (_dir, path) = write_credentials(BASE);
        let mut harness = Harness::new(&["a", "b"]);
        harness.device = None;

        let outcome = harness.run(&path, "default").await;

        assert!(matches!(outcome, Outcome::Cancelled));
        assert!(outcome.is_success());
        assert_eq!(harness.count(|c| &c.code), 0);
        assert_eq!(read(&path), BASE);
    }

    #[tokio::test]
    async fn cancelled_code_leaves_file_alone() {
        let (_dir, path) = write_credentials(BASE);
        let mut harness = Harness::new(&["a"]);
        harness.code = None;

        let outcome = harness.run(&path, "default").await;

        assert!(matches!(outcome, Outcome::Cancelled));
        assert_eq!(harness.count(|c| &c.exchange), 0);
        assert_eq!(read(&path), BASE);
    }

    #[tokio::test]
    async fn failed_exchange_leaves_file_alone() {
        let (_dir, path) = write_credentials(BASE);
        let mut harness = Harness::new(&["arn:aws:iam::123456789012:mfa/phone"]);
        harness.fail_exchange = true;

        let outcome = harness.run(&path, "default").await;

        assert!(
            matches!(&outcome, Outcome::ExchangeFailed { device, .. } if device.ends_with("phone"))
        );
        assert!(!outcome.is_success());
        assert_eq!(read(&path), BASE);
    }

    #[tokio::test]
    async fn missing_long_term_keys_is_fatal() {
        let contents = "[default-mfa]\naws_access_key_id = AKIA\n";
        let (_dir, path) = write_credentials(contents);
        let config = Config {
            credentials_path: path.clone(),
            profile: "default".into(),
            region: None,
            duration: 3600,
            validator: ValidatorKind::Expiration,
            one_password: None,
        };
        let harness = Harness::new(&["a"]);
        let updater = AwsMfaUpdater::with_parts(
            config,
            Box::new(ExpirationValidator::new()),
            Box::new(FakeService {
                devices: harness.devices.clone(),
                fail_exchange: false,
                calls: harness.calls.clone(),
                exchanged_with: harness.exchanged_with.clone(),
            }),
            Box::new(FakePrompt {
                device: Some(0),
                code: Some("123456"),
                calls: harness.calls.clone(),
            }),
        );

        assert!(updater.update_credentials().await.is_err());
        assert_eq!(read(&path), contents);
    }

    struct AcceptingIdentity;

    #[async_trait]
    impl CallerIdentity for AcceptingIdentity {
        async fn check(&self, _credentials: Credentials) -> Result<()> {
            Ok(())
        }
    }

    struct RejectingIdentity;

    #[async_trait]
    impl CallerIdentity for RejectingIdentity {
        async fn check(&self, _credentials: Credentials) -> Result<()> {
            Err(anyhow!("InvalidClientTokenId"))
        }
    }

    const CACHED: &str = "\
[default]
aws_access_key_id = ASIACACHED
aws_secret_access_key = cached-secret
aws_session_token = cached-token
expiration = 2000-01-01 00:00:00

";

    #[tokio::test]
    async fn accepted_cached_session_skips_mfa() {
        let contents = format!("{CACHED}{BASE}");
        let (_dir, path) = write_credentials(&contents);
        let harness = Harness::new(&["arn:aws:iam::123456789012:mfa/phone"]);

        let validator = ProbeValidator::with_identity(Box::new(AcceptingIdentity));
        let outcome = harness.run_with(&path, "default", Box::new(validator)).await;

        assert!(matches!(outcome, Outcome::StillValid { .. }));
        assert_eq!(harness.count(|c| &c.list), 0);
        assert_eq!(harness.count(|c| &c.code), 0);
        assert_eq!(read(&path), contents);
    }

    #[tokio::test]
    async fn rejected_cached_session_is_refreshed() {
        let contents = format!("{CACHED}{BASE}");
        let (_dir, path) = write_credentials(&contents);
        let harness = Harness::new(&["arn:aws:iam::123456789012:mfa/phone"]);

        let validator = ProbeValidator::with_identity(Box::new(RejectingIdentity));
        let outcome = harness.run_with(&path, "default", Box::new(validator)).await;

        assert!(matches!(outcome, Outcome::Refreshed { .. }));
        assert_eq!(harness.count(|c| &c.list), 1);
        assert!(read(&path).contains("aws_session_token = fresh-token\n"));
    }
}

//! AWS shared credentials file model.
//!
//! Lookups go through `configparser`. Writes are spliced into the original text line by line so
//! that every section other than the one being refreshed stays byte-identical on disk.
//!
//! ```ini
//! [default]
//! aws_access_key_id = ASIA...           # temporary, written by this tool
//! aws_secret_access_key = ...
//! aws_session_token = ...
//! expiration = 2025-01-01 12:00:00
//!
//! [default-mfa]
//! aws_access_key_id = AKIA...           # long-term IAM user credentials
//! aws_secret_access_key = ...
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, ensure};
use aws_sdk_sts::config::Credentials;
use chrono::{DateTime, NaiveDateTime, Utc};
use configparser::ini::Ini;
use tokio::fs;

/// Textual format of the stored `expiration` key, always UTC.
pub const EXPIRATION_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const ACCESS_KEY_ID: &str = "aws_access_key_id";
pub const SECRET_ACCESS_KEY: &str = "aws_secret_access_key";
pub const SESSION_TOKEN: &str = "aws_session_token";
pub const EXPIRATION: &str = "expiration";

/// Temporary credentials returned by STS for an MFA-authenticated session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: DateTime<Utc>,
}

impl Session {
    /// The four managed keys, in the order they are written.
    fn entries(&self) -> [(&'static str, String); 4] {
        [
            (ACCESS_KEY_ID, self.access_key_id.clone()),
            (SECRET_ACCESS_KEY, self.secret_access_key.clone()),
            (SESSION_TOKEN, self.session_token.clone()),
            (EXPIRATION, format_expiration(&self.expiration)),
        ]
    }
}

pub fn format_expiration(expiration: &DateTime<Utc>) -> String {
    expiration.format(EXPIRATION_FORMAT).to_string()
}

pub fn parse_expiration(value: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), EXPIRATION_FORMAT)
        .map(|naive| naive.and_utc())
        .with_context(|| format!("expected format YYYY-MM-DD HH:MM:SS, got \"{value}\""))
}

/// Long-term credentials read from the `<profile>-mfa` section.
#[derive(Clone)]
pub struct SourceCredentials {
    credentials: Credentials,
}

impl SourceCredentials {
    pub fn new(access_key_id: String, secret_access_key: String) -> Self {
        Self {
            credentials: Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "aws-mfa-session",
            ),
        }
    }

    pub fn from_file(file: &CredentialsFile, section: &str) -> Result<Self> {
        let get = |key| {
            file.get(section, key)
                .with_context(|| format!("Missing {key} in [{section}]"))
        };
        Ok(Self::new(get(ACCESS_KEY_ID)?, get(SECRET_ACCESS_KEY)?))
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials.clone()
    }
}

/// An INI credentials file held in memory between one load and one save.
pub struct CredentialsFile {
    path: PathBuf,
    contents: String,
    ini: Ini,
}

impl CredentialsFile {
    pub async fn load(path: &Path) -> Result<Self> {
        ensure!(
            path.exists(),
            "Credentials file not found: {}",
            path.display()
        );
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(path.to_path_buf(), contents)
    }

    pub fn parse(path: PathBuf, contents: String) -> Result<Self> {
        let ini = parse_ini(&contents)?;
        Ok(Self {
            path,
            contents,
            ini,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub fn contents(&self) -> &str {
        &self.contents
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.ini.sections().iter().any(|s| s == section)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<String> {
        self.ini.get(section, key)
    }

    /// Overwrites the four session keys of `section`, creating the section if needed.
    ///
    /// All keys are applied to the in-memory text before anything is written, so a later
    /// [`save`](Self::save) persists either the full session or nothing.
    pub fn upsert_session(&mut self, section: &str, session: &Session) -> Result<()> {
        let contents = splice_section(&self.contents, section, &session.entries());
        self.ini = parse_ini(&contents)?;
        self.contents = contents;
        Ok(())
    }

    pub async fn save(&self) -> Result<()> {
        fs::write(&self.path, &self.contents)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

/// Receives keys found before the first header. Header names are cut at the first `]`, so no
/// section in a file can collide with it.
const TOP_LEVEL_SECTION: &str = "]top-level[";

fn parse_ini(contents: &str) -> Result<Ini> {
    let mut ini = Ini::new_cs();
    ini.set_default_section(TOP_LEVEL_SECTION);
    ini.read(contents.to_owned())
        .map_err(|e| anyhow!("Failed to parse credentials: {e}"))?;
    Ok(ini)
}

/// Header name as configparser reads it: anything after the closing `]` is ignored.
fn section_name(line: &str) -> Option<&str> {
    let rest = line.trim().strip_prefix('[')?;
    rest.find(']').map(|end| rest[..end].trim())
}

fn key_name(line: &str) -> Option<&str> {
    let line = line.trim_start();
    if line.starts_with('#') || line.starts_with(';') {
        return None;
    }
    line.find(['=', ':']).map(|at| line[..at].trim())
}

/// One line of the file with its own terminator (`"\n"`, `"\r\n"`, or empty at EOF).
struct Line {
    text: String,
    eol: String,
}

impl Line {
    fn new(text: String, eol: &str) -> Self {
        Self {
            text,
            eol: eol.to_owned(),
        }
    }
}

fn split_lines(contents: &str) -> Vec<Line> {
    contents
        .split_inclusive('\n')
        .map(|raw| {
            let text = raw.strip_suffix('\n').unwrap_or(raw);
            let (text, eol) = match text.strip_suffix('\r') {
                Some(text) if raw.ends_with('\n') => (text, "\r\n"),
                _ if raw.ends_with('\n') => (text, "\n"),
                _ => (text, ""),
            };
            Line::new(text.to_owned(), eol)
        })
        .collect()
}

fn splice_section(contents: &str, section: &str, entries: &[(&str, String)]) -> String {
    let mut lines = split_lines(contents);
    let newline = lines
        .iter()
        .map(|l| l.eol.as_str())
        .find(|eol| !eol.is_empty())
        .unwrap_or("\n")
        .to_owned();

    // Every `[section]` block, as (first key line, end) ranges.
    let headers: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter_map(|(i, l)| section_name(&l.text).map(|_| i))
        .collect();
    let blocks: Vec<(usize, usize)> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| section_name(&lines[**h].text) == Some(section))
        .map(|(n, &h)| (h + 1, headers.get(n + 1).copied().unwrap_or(lines.len())))
        .collect();

    let mut missing = Vec::new();
    for (key, value) in entries {
        let mut found = false;
        for &(start, end) in &blocks {
            for line in &mut lines[start..end] {
                if key_name(&line.text) == Some(*key) {
                    line.text = format!("{key} = {value}");
                    found = true;
                }
            }
        }
        if !found {
            missing.push(Line::new(format!("{key} = {value}"), &newline));
        }
    }

    match blocks.last() {
        Some(&(start, end)) => {
            if !missing.is_empty() {
                let anchor = (start..end)
                    .rev()
                    .find(|&i| !lines[i].text.trim().is_empty())
                    .unwrap_or(start - 1);
                if lines[anchor].eol.is_empty() {
                    lines[anchor].eol.clone_from(&newline);
                }
                for (offset, line) in missing.into_iter().enumerate() {
                    lines.insert(anchor + 1 + offset, line);
                }
            }
        }
        None => {
            if let Some(last) = lines.last_mut() {
                if last.eol.is_empty() {
                    last.eol.clone_from(&newline);
                }
                if !last.text.trim().is_empty() {
                    lines.push(Line::new(String::new(), &newline));
                }
            }
            lines.push(Line::new(format!("[{section}]"), &newline));
            lines.extend(missing);
        }
    }

    lines.iter().fold(String::new(), |mut out, line| {
        out.push_str(&line.text);
        out.push_str(&line.eol);
        out
    })
}

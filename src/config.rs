//! Fetcher configuration

use crate::error::{Error, Result};
use crate::policy::{SelectionPolicy, TlsMode};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_ATTACHMENT_DIR: &str = "attachments";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolved configuration for one mailbox.
///
/// Build it with [`Config::from_env`] or fill the fields directly and
/// call [`Config::validate`]; the fetcher never re-reads its source.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: TlsMode,
    /// Accept any server certificate (self-signed bridges, test servers).
    pub accept_invalid_certs: bool,
    pub poll_interval: Duration,
    pub attachment_dir: PathBuf,
    pub selection: SelectionPolicy,
    pub connect_timeout: Duration,
}

impl Config {
    /// Configuration with defaults for everything but the account.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let tls = TlsMode::default();
        Self {
            host: host.into(),
            port: tls.default_port(),
            username: username.into(),
            password: password.into(),
            tls,
            accept_invalid_certs: false,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            attachment_dir: PathBuf::from(DEFAULT_ATTACHMENT_DIR),
            selection: SelectionPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Load configuration from environment variables
    ///
    /// Reads from `.env` file if present. Required variables:
    /// - `IMAP_HOST`
    /// - `IMAP_USERNAME`
    /// - `IMAP_PASSWORD`
    ///
    /// Optional (with defaults):
    /// - `IMAP_TLS` (default: `implicit`, or `starttls`)
    /// - `IMAP_PORT` (default: `993`, `143` with STARTTLS)
    /// - `IMAP_ACCEPT_INVALID_CERTS` (default: `false`)
    /// - `POLL_INTERVAL_SECS` (default: `60`)
    /// - `ATTACHMENT_DIR` (default: `attachments`)
    /// - `SELECTION_POLICY` (default: `latest`, or `all`)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first missing or invalid
    /// variable.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from any key/value source.
    ///
    /// # Errors
    ///
    /// Same as [`Config::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required =
            |key: &str| lookup(key).ok_or_else(|| Error::Config(format!("{key} not set")));

        let mut config = Self::new(
            required("IMAP_HOST")?,
            required("IMAP_USERNAME")?,
            required("IMAP_PASSWORD")?,
        );

        if let Some(tls) = lookup("IMAP_TLS") {
            config.tls = tls
                .parse()
                .map_err(|e| Error::Config(format!("Invalid IMAP_TLS: {e}")))?;
        }
        config.port = match lookup("IMAP_PORT") {
            Some(port) => port
                .parse()
                .map_err(|e| Error::Config(format!("Invalid IMAP_PORT: {e}")))?,
            None => config.tls.default_port(),
        };
        if let Some(flag) = lookup("IMAP_ACCEPT_INVALID_CERTS") {
            config.accept_invalid_certs = parse_bool(&flag).ok_or_else(|| {
                Error::Config(format!("Invalid IMAP_ACCEPT_INVALID_CERTS: {flag}"))
            })?;
        }
        if let Some(secs) = lookup("POLL_INTERVAL_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|e| Error::Config(format!("Invalid POLL_INTERVAL_SECS: {e}")))?;
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(dir) = lookup("ATTACHMENT_DIR") {
            config.attachment_dir = PathBuf::from(dir);
        }
        if let Some(policy) = lookup("SELECTION_POLICY") {
            config.selection = policy
                .parse()
                .map_err(|e| Error::Config(format!("Invalid SELECTION_POLICY: {e}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the fetcher relies on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a required field is empty or the
    /// poll interval is zero.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("host", self.host.as_str()),
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{name} must not be empty")));
            }
        }
        if self.attachment_dir.as_os_str().is_empty() {
            return Err(Error::Config("attachment_dir must not be empty".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be greater than zero".into()));
        }
        if self.port == 0 {
            return Err(Error::Config("port must not be 0".into()));
        }
        Ok(())
    }

    /// `host:port` of the IMAP server.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

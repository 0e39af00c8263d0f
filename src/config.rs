//! Configuration manager for keysignup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ini::{Ini, ParseOption};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the configuration file location.
pub const CONFIG_PATH_ENV: &str = "KEY_SIGNUP_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "/etc/signup.cfg";
/// Section read from INI files.
const INI_SECTION: &str = "DEFAULT";

const DEFAULT_REDIS_HOST: &str = "localhost";
const DEFAULT_REDIS_PORT: u16 = 16379;
const DEFAULT_CHANNEL: &str = "gitciuser";
const DEFAULT_KEYDIR: &str = "/home/git/.gitolite/keydir";
const DEFAULT_GITOLITE_BIN: &str = "/usr/local/bin/gitolite";
const DEFAULT_RECONCILE_TIMEOUT: u64 = 120;
const DEFAULT_POLL_INTERVAL: u64 = 1;
const DEFAULT_STORE_TIMEOUT: u64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Hostname of the redis instance.
    #[serde(rename = "REDIS_HOST")]
    pub redis_host: String,
    #[serde(rename = "REDIS_PORT")]
    pub redis_port: u16,
    #[serde(rename = "REDIS_PASSWORD", skip_serializing)]
    pub redis_password: Option<String>,
    /// Pub/sub channel announcing new users.
    #[serde(rename = "REDIS_CHANNEL")]
    pub channel: String,
    /// Directory read by `gitolite setup`.
    #[serde(rename = "KEYDIR_PATH")]
    pub keydir: PathBuf,
    #[serde(rename = "GITOLITE_BIN")]
    pub gitolite_bin: PathBuf,
    /// Seconds before a hung `gitolite setup` is killed.
    #[serde(rename = "RECONCILE_TIMEOUT")]
    pub reconcile_timeout: u64,
    /// Seconds to wait for a notification before polling again.
    #[serde(rename = "POLL_INTERVAL")]
    pub poll_interval: u64,
    /// Seconds allowed for connecting to redis and for each lookup.
    #[serde(rename = "STORE_TIMEOUT")]
    pub store_timeout: u64,
    /// OTLP collector receiving log records, if any.
    #[serde(rename = "OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,
    #[serde(skip)]
    pub(crate) path: PathBuf,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            redis_host: DEFAULT_REDIS_HOST.into(),
            redis_port: DEFAULT_REDIS_PORT,
            redis_password: None,
            channel: DEFAULT_CHANNEL.into(),
            keydir: DEFAULT_KEYDIR.into(),
            gitolite_bin: DEFAULT_GITOLITE_BIN.into(),
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            otlp_endpoint: None,
            path: PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Use the path found in `KEY_SIGNUP_CONFIG`, if set.
    pub fn from_env(self) -> Self {
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) if !path.is_empty() => self.path(path.into()),
            _ => self,
        }
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval.max(1))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout.max(1))
    }

    /// Reads the configuration file.
    ///
    /// Both a YAML mapping and an INI file with a `[DEFAULT]` section are
    /// accepted. A missing or broken file is never fatal: defaults are
    /// returned.
    pub fn read(self) -> Arc<Self> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    path = %self.path.display(),
                    "config file does not exist, empty config provided"
                );
                return Arc::new(self);
            },
            Err(err) => return Arc::new(self.error(err)),
        };

        if is_ini(&content) {
            return Arc::new(self.ini(&content));
        }

        match serde_yaml::from_str::<Option<Configuration>>(&content) {
            Ok(Some(config)) => Arc::new(config.path(self.path)),
            // empty file.
            Ok(None) => Arc::new(self),
            Err(err) => Arc::new(self.error(err)),
        }
    }

    fn ini(mut self, content: &str) -> Self {
        // values are taken verbatim, no quote or escape handling.
        let option = ParseOption {
            enabled_quote: false,
            enabled_escape: false,
            ..Default::default()
        };
        let ini = match Ini::load_from_str_opt(content, option) {
            Ok(ini) => ini,
            Err(err) => return self.error(err),
        };

        let Some(section) = ini.section(Some(INI_SECTION)) else {
            tracing::warn!(
                path = %self.path.display(),
                "config file has no [{INI_SECTION}] section, empty config provided"
            );
            return self;
        };

        for (key, value) in section.iter() {
            if let Err(err) = self.set(key, value) {
                return self.error(err);
            }
        }

        self
    }

    /// Apply a single `KEY = value` pair. Keys are case-insensitive.
    fn set(&mut self, key: &str, value: &str) -> Result<(), std::num::ParseIntError> {
        match key.to_ascii_uppercase().as_str() {
            "REDIS_HOST" => self.redis_host = value.to_owned(),
            "REDIS_PORT" => self.redis_port = value.parse()?,
            "REDIS_PASSWORD" => self.redis_password = Some(value.to_owned()),
            "REDIS_CHANNEL" => self.channel = value.to_owned(),
            "KEYDIR_PATH" => self.keydir = value.into(),
            "GITOLITE_BIN" => self.gitolite_bin = value.into(),
            "RECONCILE_TIMEOUT" => self.reconcile_timeout = value.parse()?,
            "POLL_INTERVAL" => self.poll_interval = value.parse()?,
            "STORE_TIMEOUT" => self.store_timeout = value.parse()?,
            "OTLP_ENDPOINT" => self.otlp_endpoint = Some(value.to_owned()),
            _ => tracing::debug!(key, "unknown config key ignored"),
        }

        Ok(())
    }

    /// Return a default configuration as fallback.
    fn error(self, err: impl std::error::Error) -> Self {
        tracing::error!(
            error = %err,
            path = %self.path.display(),
            "config file cannot be read, defaults used"
        );
        Self {
            path: self.path,
            ..Default::default()
        }
    }

    pub fn file(&self) -> &Path {
        &self.path
    }
}

/// Whether the first meaningful line is a section header.
fn is_ini(content: &str) -> bool {
    content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with(['#', ';']))
        .is_some_and(|line| line.starts_with('['))
}

//! Deployment configuration.
//!
//! Ding reads a single JSON configuration file (path given by `DING_CONFIG`,
//! defaulting to `ding.json` in the current directory). The resulting
//! [`Config`] is passed by value into every component at construction;
//! nothing here is read again from a global afterward.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DingError, Result};

/// Per-build privilege isolation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationConfig {
    pub enabled: bool,
    pub uid_start: u32,
    pub uid_end: u32,
    /// Identity the unprivileged worker process itself runs as; excluded
    /// from the per-build uid range.
    pub ding_uid: u32,
    pub ding_gid: u32,
    /// Root of the builds tree; every build/checkout path must resolve
    /// inside it.
    pub builds_dir: String,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            uid_start: 0,
            uid_end: 0,
            ding_uid: 0,
            ding_gid: 0,
            builds_dir: "data/build".to_string(),
        }
    }
}

/// SMTP submission settings for failure/recovery notifications.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MailConfig {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_tls: bool,
    pub smtp_username: String,
    #[serde(default)]
    pub smtp_password: String,
    pub from: String,
    pub from_name: String,
    pub reply_to: Option<String>,
}

/// Mail recipient for build notifications.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotifyConfig {
    pub name: String,
    pub email: String,
}

/// Top-level deployment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database connection string, e.g. `sqlite:data/ding.db`.
    pub database_url: String,
    /// Base URL used to build links in notification mail.
    pub base_url: String,
    /// Environment variables added to every build child, on top of the
    /// fixed set the driver itself sets (§4.2).
    #[serde(default)]
    pub environment: std::collections::HashMap<String, String>,
    /// Command prefix applied to every spawned build-related child, e.g.
    /// `["nice", "-n", "10"]` or `["timeout", "3600"]`.
    #[serde(default)]
    pub run_prefix: Vec<String>,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub github_webhook_secret: Option<String>,
    #[serde(default)]
    pub bitbucket_webhook_secret: Option<String>,
    #[serde(default)]
    pub isolate_builds: IsolationConfig,
    #[serde(default)]
    pub mail: MailConfig,
    /// Address the HTTP/RPC surface listens on.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Root of the promoted-release tree, `data/release/<repo>/<id>/`.
    #[serde(default = "default_release_dir")]
    pub release_dir: String,
    /// Path this configuration was loaded from, so the root process can
    /// re-exec the worker and `ding chownbuild` with the same file.
    #[serde(skip, default)]
    pub config_path: std::path::PathBuf,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_release_dir() -> String {
    "data/release".to_string()
}

impl Config {
    /// Loads configuration from the file named by `DING_CONFIG`
    /// (default `ding.json`), falling back to environment variable
    /// overrides for anything a deployment prefers not to put on disk.
    pub fn load() -> Result<Self> {
        let path = std::env::var("DING_CONFIG").unwrap_or_else(|_| "ding.json".to_string());
        let mut config = Self::load_from_file(&path)?;
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(listen) = std::env::var("DING_LISTEN") {
            config.listen = listen;
        }
        Ok(config)
    }

    /// Loads configuration from an explicit path, bypassing `DING_CONFIG`.
    /// Used by `ding chownbuild`, which receives its config path as an
    /// argument rather than reading it from the environment.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_from_file(path)
    }

    fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Config {
                database_url: "sqlite:ding.db".to_string(),
                base_url: "http://localhost:8080".to_string(),
                environment: Default::default(),
                run_prefix: Vec::new(),
                notify: NotifyConfig::default(),
                github_webhook_secret: None,
                bitbucket_webhook_secret: None,
                isolate_builds: IsolationConfig::default(),
                mail: MailConfig::default(),
                listen: default_listen(),
                release_dir: default_release_dir(),
                config_path: path.to_path_buf(),
            });
        }
        let data = std::fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&data)
            .map_err(|e| DingError::Configuration(format!("parsing {}: {e}", path.display())))?;
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    /// The numeric identity a given build runs under.
    pub fn build_uid(&self, build_id: i64) -> u32 {
        if !self.isolate_builds.enabled {
            return self.isolate_builds.ding_uid;
        }
        let span = (self.isolate_builds.uid_end - self.isolate_builds.uid_start) as i64;
        let offset = if span > 0 { build_id.rem_euclid(span) } else { 0 };
        self.isolate_builds.uid_start + offset as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let config = Config::load_from_file("/nonexistent/ding.json").unwrap();
        assert_eq!(config.listen, "127.0.0.1:8080");
        assert!(!config.isolate_builds.enabled);
    }

    #[test]
    fn build_uid_wraps_within_range() {
        let mut config = Config::load_from_file("/nonexistent/ding.json").unwrap();
        config.isolate_builds.enabled = true;
        config.isolate_builds.uid_start = 2000;
        config.isolate_builds.uid_end = 2010;
        assert_eq!(config.build_uid(0), 2000);
        assert_eq!(config.build_uid(10), 2000);
        assert_eq!(config.build_uid(15), 2005);
    }

    #[test]
    fn build_uid_falls_back_to_ding_uid_when_disabled() {
        let mut config = Config::load_from_file("/nonexistent/ding.json").unwrap();
        config.isolate_builds.ding_uid = 1000;
        assert_eq!(config.build_uid(42), 1000);
    }
}

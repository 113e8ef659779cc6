// Server configuration.
//
// Core settings come from environment variables with local-development
// defaults. Users, project membership and workflow managers live in a
// separate TOML access file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chronicle_common::types::{ProjectId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::access::Operation;
use crate::session::{DEFAULT_SESSION_TTL, DEFAULT_SWEEP_INTERVAL};

/// Core server configuration.
///
/// Constructed via [`ServerConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Directory holding one subdirectory per project.
    pub data_root: PathBuf,
    /// Directory receiving squashed history segments. Must be on the same
    /// filesystem as `data_root`; the store refuses to open otherwise.
    pub archive_root: PathBuf,
    /// Inactivity window after which a session expires.
    pub session_ttl: Duration,
    /// How often idle sessions are swept.
    pub session_sweep_interval: Duration,
    /// TOML file with users and project access rules.
    pub access_file: Option<PathBuf>,
    /// Log filter directive (e.g. `info`, `chronicle_server=debug`).
    pub log_filter: String,
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `CHRONICLE_HOST` | `0.0.0.0` |
    /// | `CHRONICLE_PORT` | `8080` |
    /// | `CHRONICLE_DATA_ROOT` | `./data` |
    /// | `CHRONICLE_ARCHIVE_ROOT` | `./archive` |
    /// | `CHRONICLE_SESSION_TTL_SECS` | `600` |
    /// | `CHRONICLE_SESSION_SWEEP_SECS` | `20` |
    /// | `CHRONICLE_ACCESS_FILE` | *(none: nobody can log in)* |
    /// | `CHRONICLE_LOG_FILTER` | `info` |
    ///
    /// The data and archive roots must share a filesystem.
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("CHRONICLE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("CHRONICLE_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let data_root = env("CHRONICLE_DATA_ROOT").map(PathBuf::from).unwrap_or_else(|_| "./data".into());
        let archive_root =
            env("CHRONICLE_ARCHIVE_ROOT").map(PathBuf::from).unwrap_or_else(|_| "./archive".into());

        let session_ttl = env("CHRONICLE_SESSION_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SESSION_TTL);
        let session_sweep_interval = env("CHRONICLE_SESSION_SWEEP_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SWEEP_INTERVAL);

        let access_file = env("CHRONICLE_ACCESS_FILE").ok().map(PathBuf::from);
        let log_filter = env("CHRONICLE_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self {
            listen_addr,
            data_root,
            archive_root,
            session_ttl,
            session_sweep_interval,
            access_file,
            log_filter,
        }
    }
}

/// Contents of the access file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    pub users: Vec<UserConfig>,
    pub projects: Vec<ProjectConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub id: UserId,
    pub name: String,
    /// Argon2 PHC string.
    pub password_hash: String,
    /// May pause and resume the server.
    #[serde(default)]
    pub maintenance: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: ProjectId,
    #[serde(default)]
    pub members: Vec<MemberConfig>,
    #[serde(default)]
    pub workflow_managers: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub user: UserId,
    pub operations: Vec<Operation>,
}

impl UserConfig {
    /// Render as a `[[users]]` table for the access file.
    pub fn to_access_entry(&self) -> Result<String, ConfigError> {
        #[derive(Serialize)]
        struct Entry<'a> {
            users: &'a [UserConfig],
        }
        toml::to_string(&Entry { users: std::slice::from_ref(self) }).map_err(ConfigError::Render)
    }
}

impl AccessConfig {
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for user in &self.users {
            if !seen.insert(&user.id) {
                return Err(ConfigError::Invalid(format!("user `{}` is defined twice", user.id)));
            }
        }
        for project in &self.projects {
            let referenced = project.members.iter().map(|m| &m.user).chain(&project.workflow_managers);
            for user in referenced {
                if !seen.contains(user) {
                    return Err(ConfigError::Invalid(format!(
                        "project `{}` references unknown user `{user}`",
                        project.id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[source] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("invalid access config: {0}")]
    Invalid(String),

    #[error("failed to render access entry: {0}")]
    Render(#[source] toml::ser::Error),
}

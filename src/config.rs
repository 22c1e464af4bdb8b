//! Pool configuration.
//!
//! A configuration document is a TOML file listing one or more servers:
//!
//! ```toml
//! failure_budget = 3
//!
//! [[server]]
//! host = "stats-01"
//! port = 6311
//! username = "analyst"
//! password = "secret"
//!
//! [[server]]
//! host = "localhost"
//! embedded = true
//! command = "/usr/lib/R/library/Rserve/Rserve"
//! ```
//!
//! Only `host` is required per server. `port` defaults to 6311, `embedded`
//! to false, and `command` to the platform's Rserve executable name
//! (overridable with the `RSERVE_COMMAND` environment variable).
//!
//! # Resolution
//!
//! [`PoolConfig::resolve`] locates the document: the `RESERVOIR_CONFIGURATION`
//! environment variable names a path (a `file://` URL is accepted);
//! otherwise `reservoir.toml` is tried in the working directory and then
//! under `config/`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::{
    CONFIGURATION_ENV, DEFAULT_CONFIGURATION_FILE, DEFAULT_FAILURE_BUDGET,
    DEFAULT_RSERVE_EXECUTABLE, DEFAULT_RSERVE_EXECUTABLE_WINDOWS, DEFAULT_RSERVE_PORT,
    RSERVE_COMMAND_ENV,
};
use crate::endpoint::ServerEndpoint;
use crate::error::{Error, Result};

/// Configuration for the connection pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// The backend servers to enroll.
    #[serde(default, rename = "server")]
    pub servers: Vec<ServerConfig>,

    /// Consecutive connection failures a slot absorbs before it is
    /// permanently removed.
    #[serde(default = "default_failure_budget")]
    pub failure_budget: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            failure_budget: DEFAULT_FAILURE_BUDGET,
        }
    }
}

/// One backend server entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host or IP the server runs on. Required.
    pub host: String,

    /// TCP port the server listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication.
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication.
    #[serde(default)]
    pub password: Option<String>,

    /// Whether the pool spawns (and owns) this server process.
    #[serde(default)]
    pub embedded: bool,

    /// Command used to launch the server when `embedded` is set.
    #[serde(default = "default_command")]
    pub command: String,
}

fn default_port() -> u16 {
    DEFAULT_RSERVE_PORT
}

fn default_failure_budget() -> u32 {
    DEFAULT_FAILURE_BUDGET
}

/// The platform's Rserve launch command, overridable via `RSERVE_COMMAND`.
pub fn default_command() -> String {
    std::env::var(RSERVE_COMMAND_ENV).unwrap_or_else(|_| {
        if cfg!(windows) {
            DEFAULT_RSERVE_EXECUTABLE_WINDOWS.to_string()
        } else {
            DEFAULT_RSERVE_EXECUTABLE.to_string()
        }
    })
}

impl ServerConfig {
    /// A minimal entry for a server on the default port.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_RSERVE_PORT,
            username: None,
            password: None,
            embedded: false,
            command: default_command(),
        }
    }

    /// The endpoint descriptor for this entry.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] for a blank host.
    pub fn endpoint(&self) -> Result<ServerEndpoint> {
        let endpoint = ServerEndpoint::with_port(self.host.clone(), self.port)?;
        Ok(match (&self.username, &self.password) {
            (Some(username), Some(password)) => endpoint.with_credentials(username, password),
            _ => endpoint,
        })
    }
}

impl PoolConfig {
    /// A configuration with a single server entry.
    pub fn single_server(server: ServerConfig) -> Self {
        Self {
            servers: vec![server],
            ..Self::default()
        }
    }

    /// Parse a configuration document.
    pub fn from_toml_str(document: &str) -> Result<Self> {
        let config: PoolConfig =
            toml::from_str(document).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&document)
    }

    /// Locate and read the configuration document.
    ///
    /// Resolution order: the `RESERVOIR_CONFIGURATION` environment
    /// variable (a path; `file://` URLs accepted), then
    /// `reservoir.toml` in the working directory, then
    /// `config/reservoir.toml`.
    ///
    /// # Errors
    /// [`Error::Config`] when no document is found or the found document
    /// is invalid.
    pub fn resolve() -> Result<Self> {
        if let Ok(value) = std::env::var(CONFIGURATION_ENV) {
            let path = value.strip_prefix("file://").unwrap_or(&value);
            return Self::from_file(path);
        }

        for candidate in [
            DEFAULT_CONFIGURATION_FILE.to_string(),
            format!("config/{}", DEFAULT_CONFIGURATION_FILE),
        ] {
            if Path::new(&candidate).exists() {
                return Self::from_file(&candidate);
            }
        }

        Err(Error::Config(format!(
            "no configuration document found; set {} or provide {}",
            CONFIGURATION_ENV, DEFAULT_CONFIGURATION_FILE
        )))
    }

    fn validate(&self) -> Result<()> {
        for server in &self.servers {
            if server.host.trim().is_empty() {
                return Err(Error::Config(
                    "server entry with a blank host".to_string(),
                ));
            }
        }
        Ok(())
    }
}

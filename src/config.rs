// Copyright 2020 Joyent, Inc.

//! Startup configuration.  A `ServerConfig` is built once before the listener
//! is bound and is never mutated afterward.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use slog::{warn, Logger};

use crate::error::ConfigError;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_AUTH_KEY: &str = "vtkweb-secret";
pub const DEFAULT_UPSTREAM_PORT: u16 = 11111;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A data-server or render-server endpoint.  These are carried through from
/// the command line but this server never connects to them.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamConfig {
    pub host: Option<String>,
    pub port: u16,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            host: None,
            port: DEFAULT_UPSTREAM_PORT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub auth_key: String,
    pub file: Option<PathBuf>,
    pub read_timeout: Duration,
    pub data_server: UpstreamConfig,
    pub render_server: UpstreamConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            auth_key: String::from(DEFAULT_AUTH_KEY),
            file: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
            data_server: UpstreamConfig::default(),
            render_server: UpstreamConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(listen: SocketAddr) -> Self {
        ServerConfig {
            listen,
            ..ServerConfig::default()
        }
    }

    pub fn with_file<P: AsRef<Path>>(mut self, file: P) -> Self {
        self.file = Some(file.as_ref().to_path_buf());
        self
    }

    pub fn with_auth_key(mut self, auth_key: &str) -> Self {
        self.auth_key = String::from(auth_key);
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Checks the configuration for conditions that leave the server able to
    /// start but unable to serve an image.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.file {
            Some(_) => Ok(()),
            None => Err(ConfigError::MissingFile),
        }
    }

    /// Runs `validate` and logs any problem as a warning.  A missing file is
    /// reported to clients later, on the first initialized `stillRender`.
    pub fn warn_if_incomplete(&self, log: &Logger) {
        if let Err(e) = self.validate() {
            warn!(log, "incomplete configuration"; "err" => %e);
        }
    }
}

/// Joins a host and port into a socket address.
pub fn listen_addr(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let addr = [host, ":", &port.to_string()].concat();
    addr.parse::<SocketAddr>()
        .map_err(|source| ConfigError::InvalidAddress { addr, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_bootstrap_conventions() {
        let config = ServerConfig::default();
        assert_eq!(config.listen.port(), DEFAULT_PORT);
        assert_eq!(config.auth_key, "vtkweb-secret");
        assert_eq!(config.data_server.port, 11111);
        assert_eq!(config.render_server.port, 11111);
        assert!(config.data_server.host.is_none());
        assert_eq!(config.read_timeout, Duration::from_secs(5));
    }

    #[test]
    fn missing_file_is_a_configuration_error() {
        let config = ServerConfig::default();
        match config.validate() {
            Err(ConfigError::MissingFile) => (),
            other => panic!("expected MissingFile, got {:?}", other),
        }

        let config = config.with_file("image.jpg");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn listen_addr_rejects_bad_hosts() {
        let addr = listen_addr("127.0.0.1", 2030).unwrap();
        assert_eq!(addr.port(), 2030);

        match listen_addr("not a host", 2030) {
            Err(ConfigError::InvalidAddress { addr, .. }) => {
                assert_eq!(addr, "not a host:2030")
            }
            other => panic!("expected InvalidAddress, got {:?}", other),
        }
    }
}

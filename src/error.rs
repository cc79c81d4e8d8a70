// Copyright 2020 Joyent, Inc.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures while serving the configured image.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("no image file was configured")]
    NoFileConfigured,

    #[error("unable to read image file {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("timed out after {timeout:?} reading image file {}", .path.display())]
    ReadTimeout { path: PathBuf, timeout: Duration },
}

impl DeliveryError {
    pub fn name(&self) -> &'static str {
        "ResourceUnavailable"
    }
}

/// Errors returned to a remote caller as a Fast error message.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("authenticate must be called before any other method")]
    AuthenticationRequired,

    #[error("the supplied secret was not accepted")]
    AuthenticationFailed,

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("failed to encode reply: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl RpcError {
    /// Name reported in the `name` field of an error message.
    pub fn name(&self) -> &'static str {
        match self {
            RpcError::UnsupportedMethod(_) => "UnsupportedMethod",
            RpcError::AuthenticationRequired => "AuthenticationRequired",
            RpcError::AuthenticationFailed => "AuthenticationFailed",
            RpcError::InvalidArguments(_) => "InvalidArguments",
            RpcError::Delivery(e) => e.name(),
            RpcError::Encoding(_) => "InternalError",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("method {method} is already registered by {owner}")]
    DuplicateMethod { method: String, owner: String },

    #[error("method {0} is reserved by the server")]
    ReservedMethod(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ConfigurationError: at least one valid file is required")]
    MissingFile,

    #[error("invalid listen address {addr}: {source}")]
    InvalidAddress {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

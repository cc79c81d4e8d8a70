// Copyright 2020 Joyent, Inc.

//! Method registry.  Each protocol object exports a fixed set of method names
//! and the registry routes incoming calls to the object that owns the name.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use slog::{debug, Logger};
use subtle::ConstantTimeEq;

use crate::error::{RegistryError, RpcError};

/// Method handled by the server session itself rather than a protocol.
pub const AUTH_METHOD: &str = "authenticate";

pub trait RpcProtocol: Send + Sync {
    /// Name used when logging and reporting registration conflicts.
    fn name(&self) -> &'static str;

    fn methods(&self) -> &'static [&'static str];

    /// Invokes `method` with the Fast argument array `args`.
    fn call<'a>(
        &'a self,
        method: &'a str,
        args: Value,
        log: &'a Logger,
    ) -> BoxFuture<'a, Result<Value, RpcError>>;
}

pub struct ProtocolRegistry {
    secret: String,
    handlers: HashMap<String, Arc<dyn RpcProtocol>>,
}

impl ProtocolRegistry {
    pub fn new(secret: &str) -> Self {
        ProtocolRegistry {
            secret: String::from(secret),
            handlers: HashMap::new(),
        }
    }

    /// Registers every method exported by `protocol`.  Nothing is registered
    /// if any of its methods conflicts with an existing one.
    pub fn register(
        &mut self,
        protocol: Arc<dyn RpcProtocol>,
    ) -> Result<(), RegistryError> {
        for method in protocol.methods() {
            if *method == AUTH_METHOD {
                return Err(RegistryError::ReservedMethod(method.to_string()));
            }
            if let Some(owner) = self.handlers.get(*method) {
                return Err(RegistryError::DuplicateMethod {
                    method: method.to_string(),
                    owner: owner.name().to_string(),
                });
            }
        }

        for method in protocol.methods() {
            self.handlers
                .insert(method.to_string(), Arc::clone(&protocol));
        }
        Ok(())
    }

    pub fn update_secret(&mut self, secret: &str) {
        self.secret = String::from(secret);
    }

    /// Compares in constant time for candidates of the secret's length.
    pub fn check_secret(&self, candidate: &str) -> bool {
        self.secret.as_bytes().ct_eq(candidate.as_bytes()).into()
    }

    pub fn lookup(&self, method: &str) -> Option<&Arc<dyn RpcProtocol>> {
        self.handlers.get(method)
    }

    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> =
            self.handlers.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }

    pub async fn dispatch(
        &self,
        method: &str,
        args: Value,
        log: &Logger,
    ) -> Result<Value, RpcError> {
        match self.lookup(method) {
            Some(protocol) => {
                debug!(log, "dispatching request";
                       "method" => method, "protocol" => protocol.name());
                protocol.call(method, args, log).await
            }
            None => Err(RpcError::UnsupportedMethod(String::from(method))),
        }
    }
}

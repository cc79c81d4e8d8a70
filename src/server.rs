// Copyright 2020 Joyent, Inc.

//! Per-connection request handling.
//!
//! Each accepted connection runs `make_task`, which reads Fast requests in
//! order, routes them through a shared `ProtocolRegistry`, and writes back a
//! DATA message followed by END, or a single ERROR message if the call fails.
//! A client must call `authenticate` with the shared secret before anything
//! else.  Handler failures are reported to the client and never close the
//! connection; only framing errors do.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_derive::Deserialize;
use serde_json::{json, Value};
use slog::{debug, error, info, o, warn, Drain, Logger};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::error::RpcError;
use crate::protocol::{FastMessage, FastMessageData, FastMessageStatus, FastRpc};
use crate::registry::{ProtocolRegistry, AUTH_METHOD};

#[derive(Deserialize)]
struct AuthPayload {
    secret: String,
}

/// Authentication state for one connection.
pub struct Session {
    registry: Arc<ProtocolRegistry>,
    authenticated: bool,
}

impl Session {
    pub fn new(registry: Arc<ProtocolRegistry>) -> Self {
        Session {
            registry,
            authenticated: false,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Builds the complete response to one request message.
    pub async fn respond(
        &mut self,
        msg: &FastMessage,
        log: &Logger,
    ) -> Vec<FastMessage> {
        let method = msg.data.m.name.clone();

        if msg.status != FastMessageStatus::Data {
            warn!(log, "ignoring non-data request"; "method" => &method, "id" => msg.id);
            return vec![];
        }

        match self.call(&method, msg.data.d.clone(), log).await {
            Ok(reply) => vec![
                FastMessage::data(
                    msg.id,
                    FastMessageData::new(method.clone(), Value::Array(vec![reply])),
                ),
                FastMessage::end(msg.id, method),
            ],
            Err(e) => {
                info!(log, "request failed";
                      "method" => &method, "id" => msg.id, "err" => %e);
                let payload = json!({
                    "name": e.name(),
                    "message": e.to_string(),
                });
                vec![FastMessage::error(
                    msg.id,
                    FastMessageData::new(method, payload),
                )]
            }
        }
    }

    async fn call(
        &mut self,
        method: &str,
        args: Value,
        log: &Logger,
    ) -> Result<Value, RpcError> {
        if method == AUTH_METHOD {
            return self.authenticate(args, log);
        }
        if !self.authenticated {
            return Err(RpcError::AuthenticationRequired);
        }
        self.registry.dispatch(method, args, log).await
    }

    fn authenticate(
        &mut self,
        args: Value,
        log: &Logger,
    ) -> Result<Value, RpcError> {
        let payloads: Vec<AuthPayload> = serde_json::from_value(args)
            .map_err(|_| {
                RpcError::InvalidArguments(String::from(
                    "Expected JSON array with a single secret object",
                ))
            })?;

        match payloads.first() {
            Some(payload) if self.registry.check_secret(&payload.secret) => {
                debug!(log, "session authenticated");
                self.authenticated = true;
                Ok(json!({ "authenticated": true }))
            }
            Some(_) => Err(RpcError::AuthenticationFailed),
            None => Err(RpcError::InvalidArguments(String::from(
                "Expected JSON array with a single secret object",
            ))),
        }
    }
}

/// Serves one connection until the peer hangs up or sends a malformed frame.
pub async fn make_task(
    socket: TcpStream,
    registry: Arc<ProtocolRegistry>,
    log: Option<&Logger>,
) {
    let peer = socket
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    let conn_log = log
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
        .new(o!("peer" => peer));

    let (mut tx, mut rx) = Framed::new(socket, FastRpc).split();
    let mut session = Session::new(registry);

    debug!(conn_log, "accepted connection");
    while let Some(request) = rx.next().await {
        match request {
            Ok(msg) => {
                let response = session.respond(&msg, &conn_log).await;
                if response.is_empty() {
                    continue;
                }
                if let Err(e) = tx.send(response).await {
                    error!(conn_log, "failed to send response"; "err" => %e);
                    break;
                }
            }
            Err(e) => {
                error!(conn_log, "failed to process connection"; "err" => %e);
                break;
            }
        }
    }
    debug!(conn_log, "connection closed");
}

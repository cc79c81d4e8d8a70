// Copyright 2020 Joyent, Inc.

//! Still image delivery.
//!
//! `ImageDelivery` serves one configured file to remote callers.  A caller
//! must invoke `initRender` once before `stillRender` returns any bytes; until
//! then `stillRender` answers with an empty object.  The flag is never reset.
//!
//! The `size` and `format` fields of a `stillRender` reply are fixed at
//! `[200, 200]` and `"jpeg;base64"` regardless of the file actually served,
//! which is what existing browser clients expect.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};
use slog::{debug, info, Logger};
use tokio::fs;
use tokio::time::timeout;

use crate::config::ServerConfig;
use crate::error::{DeliveryError, RpcError};
use crate::registry::RpcProtocol;

pub const INIT_RENDER: &str = "initRender";
pub const STILL_RENDER: &str = "stillRender";

pub const RENDER_SIZE: [u32; 2] = [200, 200];
pub const RENDER_FORMAT: &str = "jpeg;base64";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitRenderReply {
    pub message: String,
}

impl InitRenderReply {
    fn success() -> Self {
        InitRenderReply {
            message: String::from("success"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StillRenderReply {
    pub image: String,
    pub state: bool,
    pub mtime: String,
    pub size: [u32; 2],
    pub format: String,
    pub global_id: String,
    #[serde(rename = "localTime")]
    pub local_time: String,
    #[serde(rename = "workTime")]
    pub work_time: String,
}

impl StillRenderReply {
    fn from_bytes(bytes: &[u8]) -> Self {
        StillRenderReply {
            image: STANDARD.encode(bytes),
            state: true,
            mtime: String::new(),
            size: RENDER_SIZE,
            format: String::from(RENDER_FORMAT),
            global_id: String::new(),
            local_time: String::new(),
            work_time: String::new(),
        }
    }
}

/// Outcome of a `stillRender` call.  `NotReady` goes out on the wire as `{}`.
#[derive(Debug, Clone, PartialEq)]
pub enum StillRender {
    NotReady,
    Ready(StillRenderReply),
}

impl StillRender {
    pub fn is_ready(&self) -> bool {
        match self {
            StillRender::Ready(_) => true,
            StillRender::NotReady => false,
        }
    }
}

impl Serialize for StillRender {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            StillRender::NotReady => serializer.serialize_map(Some(0))?.end(),
            StillRender::Ready(reply) => reply.serialize(serializer),
        }
    }
}

pub struct ImageDelivery {
    file: Option<PathBuf>,
    read_timeout: Duration,
    render_initialized: AtomicBool,
}

impl ImageDelivery {
    pub fn new(config: &ServerConfig) -> Self {
        ImageDelivery {
            file: config.file.clone(),
            read_timeout: config.read_timeout,
            render_initialized: AtomicBool::new(false),
        }
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn is_render_initialized(&self) -> bool {
        self.render_initialized.load(Ordering::SeqCst)
    }

    pub fn init_render(&self, log: &Logger) -> InitRenderReply {
        let was_initialized =
            self.render_initialized.swap(true, Ordering::SeqCst);
        info!(log, "init render called"; "already_initialized" => was_initialized);
        InitRenderReply::success()
    }

    /// Returns the configured file as base64 once `init_render` has been
    /// called.  `options` is accepted for compatibility and ignored.
    pub async fn still_render(
        &self,
        _options: &Value,
        log: &Logger,
    ) -> Result<StillRender, DeliveryError> {
        if !self.is_render_initialized() {
            debug!(log, "still render requested before init render");
            return Ok(StillRender::NotReady);
        }

        let bytes = self.read_image().await?;
        debug!(log, "still render read image"; "bytes" => bytes.len());
        Ok(StillRender::Ready(StillRenderReply::from_bytes(&bytes)))
    }

    async fn read_image(&self) -> Result<Vec<u8>, DeliveryError> {
        let path = self.file.as_ref().ok_or(DeliveryError::NoFileConfigured)?;

        match timeout(self.read_timeout, fs::read(path)).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(source)) => Err(DeliveryError::Unreadable {
                path: path.clone(),
                source,
            }),
            Err(_elapsed) => Err(DeliveryError::ReadTimeout {
                path: path.clone(),
                timeout: self.read_timeout,
            }),
        }
    }
}

/// Pulls the options object out of a Fast argument array.
fn still_render_options(args: Value) -> Result<Value, RpcError> {
    match args {
        Value::Array(args) => {
            Ok(args.into_iter().next().unwrap_or_else(|| json!({})))
        }
        Value::Null => Ok(json!({})),
        _ => Err(RpcError::InvalidArguments(String::from(
            "Expected JSON array",
        ))),
    }
}

impl RpcProtocol for ImageDelivery {
    fn name(&self) -> &'static str {
        "image-delivery"
    }

    fn methods(&self) -> &'static [&'static str] {
        &[INIT_RENDER, STILL_RENDER]
    }

    fn call<'a>(
        &'a self,
        method: &'a str,
        args: Value,
        log: &'a Logger,
    ) -> BoxFuture<'a, Result<Value, RpcError>> {
        async move {
            match method {
                INIT_RENDER => Ok(serde_json::to_value(self.init_render(log))?),
                STILL_RENDER => {
                    let options = still_render_options(args)?;
                    let result = self.still_render(&options, log).await?;
                    Ok(serde_json::to_value(result)?)
                }
                _ => Err(RpcError::UnsupportedMethod(String::from(method))),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use quickcheck::quickcheck;
    use slog::{o, Discard};
    use tempfile::NamedTempFile;
    use tokio_test::block_on;

    fn log() -> Logger {
        Logger::root(Discard, o!())
    }

    fn image_file(contents: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("failed to create file");
        file.write_all(contents).expect("failed to write file");
        file.flush().expect("failed to flush file");
        file
    }

    fn delivery_for(path: &Path) -> ImageDelivery {
        ImageDelivery::new(&ServerConfig::default().with_file(path))
    }

    #[tokio::test]
    async fn not_ready_until_initialized() {
        let file = image_file(b"\x01\x02\x03");
        let delivery = delivery_for(file.path());
        let log = log();

        for _ in 0..3 {
            let result = delivery.still_render(&json!({}), &log).await.unwrap();
            assert_eq!(result, StillRender::NotReady);
            assert_eq!(serde_json::to_value(&result).unwrap(), json!({}));
        }
        assert!(!delivery.is_render_initialized());
    }

    #[tokio::test]
    async fn missing_file_is_not_touched_before_init() {
        let delivery = ImageDelivery::new(&ServerConfig::default());
        let result = delivery.still_render(&json!({}), &log()).await;
        assert_eq!(result.unwrap(), StillRender::NotReady);
    }

    #[tokio::test]
    async fn three_byte_file_scenario() {
        let file = image_file(b"\x01\x02\x03");
        let delivery = delivery_for(file.path());
        let log = log();

        let before = delivery.call(STILL_RENDER, json!([{}]), &log).await;
        assert_eq!(before.unwrap(), json!({}));

        let init = delivery.call(INIT_RENDER, json!([]), &log).await;
        assert_eq!(init.unwrap(), json!({"message": "success"}));

        let after = delivery.call(STILL_RENDER, json!([{}]), &log).await;
        assert_eq!(
            after.unwrap(),
            json!({
                "image": "AQID",
                "state": true,
                "mtime": "",
                "size": [200, 200],
                "format": "jpeg;base64",
                "global_id": "",
                "localTime": "",
                "workTime": ""
            })
        );
    }

    #[tokio::test]
    async fn init_render_is_idempotent() {
        let file = image_file(b"idempotent");
        let once = delivery_for(file.path());
        let many = delivery_for(file.path());
        let log = log();

        once.init_render(&log);
        for _ in 0..5 {
            assert_eq!(many.init_render(&log), InitRenderReply::success());
        }

        let a = once.still_render(&json!({}), &log).await.unwrap();
        let b = many.still_render(&json!({}), &log).await.unwrap();
        assert!(a.is_ready());
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn file_is_read_on_every_call() {
        let mut file = image_file(b"first");
        let delivery = delivery_for(file.path());
        let log = log();
        delivery.init_render(&log);

        let first = delivery.still_render(&json!({}), &log).await.unwrap();
        file.write_all(b" and second").unwrap();
        file.flush().unwrap();
        let second = delivery.still_render(&json!({}), &log).await.unwrap();

        match (first, second) {
            (StillRender::Ready(a), StillRender::Ready(b)) => {
                assert_eq!(STANDARD.decode(a.image).unwrap(), b"first");
                assert_eq!(
                    STANDARD.decode(b.image).unwrap(),
                    b"first and second"
                );
            }
            other => panic!("expected two images, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unreadable_file_is_resource_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.jpg");
        let delivery = delivery_for(&missing);
        let log = log();
        delivery.init_render(&log);

        match delivery.still_render(&json!({}), &log).await {
            Err(e @ DeliveryError::Unreadable { .. }) => {
                assert_eq!(e.name(), "ResourceUnavailable");
                assert!(e.to_string().contains("missing.jpg"));
            }
            other => panic!("expected Unreadable, got {:?}", other),
        }

        let err = delivery
            .call(STILL_RENDER, json!([{}]), &log)
            .await
            .unwrap_err();
        assert_eq!(err.name(), "ResourceUnavailable");
    }

    #[tokio::test]
    async fn unconfigured_file_is_resource_unavailable() {
        let delivery = ImageDelivery::new(&ServerConfig::default());
        let log = log();
        delivery.init_render(&log);

        match delivery.still_render(&json!({}), &log).await {
            Err(e @ DeliveryError::NoFileConfigured) => {
                assert_eq!(e.name(), "ResourceUnavailable")
            }
            other => panic!("expected NoFileConfigured, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stalled_read_times_out_as_resource_unavailable() {
        use std::fs::OpenOptions;
        use std::process::Command;

        // Opening a fifo with no writer blocks, standing in for a stalled mount
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("stalled.jpg");
        let status = Command::new("mkfifo").arg(&fifo).status().unwrap();
        assert!(status.success());

        let config = ServerConfig::default()
            .with_file(&fifo)
            .with_read_timeout(Duration::from_millis(200));
        let delivery = ImageDelivery::new(&config);
        let log = log();
        delivery.init_render(&log);

        match delivery.still_render(&json!({}), &log).await {
            Err(e @ DeliveryError::ReadTimeout { .. }) => {
                assert_eq!(e.name(), "ResourceUnavailable");
                assert!(e.to_string().contains("timed out after 200ms"));
            }
            other => panic!("expected ReadTimeout, got {:?}", other),
        }

        let err = delivery
            .call(STILL_RENDER, json!([{}]), &log)
            .await
            .unwrap_err();
        assert_eq!(err.name(), "ResourceUnavailable");

        // Release the blocked readers so the runtime can shut down
        drop(OpenOptions::new().write(true).open(&fifo).unwrap());
    }

    #[tokio::test]
    async fn arguments_must_be_an_array() {
        let file = image_file(b"x");
        let delivery = delivery_for(file.path());
        let log = log();
        delivery.init_render(&log);

        let err = delivery
            .call(STILL_RENDER, json!({"width": 10}), &log)
            .await
            .unwrap_err();
        assert_eq!(err.name(), "InvalidArguments");

        let ok = delivery.call(STILL_RENDER, json!([]), &log).await.unwrap();
        assert_eq!(ok["state"], json!(true));

        let err = delivery.call("render", json!([]), &log).await.unwrap_err();
        assert_eq!(err.name(), "UnsupportedMethod");
    }

    quickcheck! {
        fn prop_image_decodes_to_file_contents(contents: Vec<u8>) -> bool {
            let file = image_file(&contents);
            let delivery = delivery_for(file.path());
            let log = log();
            delivery.init_render(&log);

            match block_on(delivery.still_render(&json!({}), &log)) {
                Ok(StillRender::Ready(reply)) => {
                    reply.state
                        && reply.size == [200, 200]
                        && reply.format == "jpeg;base64"
                        && STANDARD.decode(&reply.image).ok() == Some(contents)
                }
                _ => false,
            }
        }
    }
}

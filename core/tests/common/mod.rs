//! Stub executors and fixtures shared by the integration tests.
#![allow(dead_code)]

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use imgrelay_core::fetch::{FetchedResponse, OutboundRequest};
use imgrelay_core::{Fetcher, RelayConfig, RelayError};

pub const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01";

type Responder = Box<dyn Fn(&OutboundRequest) -> Result<FetchedResponse, RelayError> + Send + Sync>;
type Delay = Box<dyn Fn(&OutboundRequest) -> Duration + Send + Sync>;

/// Answers every request through a closure and remembers what it was asked.
pub struct ScriptedFetcher {
    respond: Responder,
    delay: Delay,
    seen: Mutex<Vec<OutboundRequest>>,
}

impl ScriptedFetcher {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&OutboundRequest) -> Result<FetchedResponse, RelayError> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            delay: Box::new(|_| Duration::ZERO),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Always answer 200 with `body` as JSON.
    pub fn json(body: serde_json::Value) -> Self {
        Self::new(move |_| Ok(json_response(200, &body)))
    }

    pub fn with_delay<D>(mut self, delay: D) -> Self
    where
        D: Fn(&OutboundRequest) -> Duration + Send + Sync + 'static,
    {
        self.delay = Box::new(delay);
        self
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: OutboundRequest) -> Result<FetchedResponse, RelayError> {
        self.seen.lock().unwrap().push(request.clone());
        let delay = (self.delay)(&request);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        (self.respond)(&request)
    }
}

/// An executor with a bug in it.
pub struct PanickingFetcher;

#[async_trait]
impl Fetcher for PanickingFetcher {
    async fn fetch(&self, _request: OutboundRequest) -> Result<FetchedResponse, RelayError> {
        panic!("executor exploded")
    }
}

pub fn json_response(status: u16, body: &serde_json::Value) -> FetchedResponse {
    FetchedResponse {
        status,
        status_text: status_text(status).into(),
        headers: vec![("content-type".into(), "application/json".into())],
        body: Bytes::from(body.to_string()),
    }
}

pub fn text_response(status: u16, content_type: &str, body: &str) -> FetchedResponse {
    FetchedResponse {
        status,
        status_text: status_text(status).into(),
        headers: vec![("content-type".into(), content_type.into())],
        body: Bytes::from(body.to_string()),
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        401 => "Unauthorized",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "",
    }
}

/// Defaults with timeouts short enough for tests.
pub fn config() -> RelayConfig {
    RelayConfig {
        api_base: "https://api.test".into(),
        site_origin: "https://www.site.test".into(),
        reply_timeout_ms: 3_000,
        fetch_timeout_ms: 1_000,
        bridge_timeout_ms: 1_000,
        ..RelayConfig::default()
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

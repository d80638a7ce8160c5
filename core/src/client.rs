//! Restricted-side relay client.
//!
//! # Design
//! `RelayClient` is a cheap, cloneable handle around the relay channel's
//! sender. Callers describe a request with `Request`. A request may carry an
//! in-memory multipart `Form`, and the client turns it into a serialisable
//! `RequestDescriptor`, encoding file bytes on the way. Each call waits for
//! its own reply under a timeout, so a lost message surfaces as
//! `RelayError::Timeout` rather than a future that never resolves.
//!
//! The client never retries. Fallback policy lives with the caller
//! (see `ImageHost`).

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec;
use crate::descriptor::{FormPart, HttpMethod, RequestBody, RequestDescriptor, ResponseType};
use crate::envelope::HttpReply;
use crate::error::RelayError;
use crate::message::{Dispatch, Message, PanelReply, Reply, SaveReply};

pub(crate) const DEFAULT_FILE_NAME: &str = "blob";
pub(crate) const DEFAULT_MIME: &str = "application/octet-stream";

/// An in-memory file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlob {
    pub name: String,
    pub mime: String,
    pub bytes: Bytes,
    /// Milliseconds since the Unix epoch.
    pub last_modified: u64,
}

impl FileBlob {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            bytes: bytes.into(),
            last_modified: now_millis(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormValue {
    File(FileBlob),
    Text(String),
}

/// Ordered multipart collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Form {
    entries: Vec<(String, FormValue)>,
}

impl Form {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, key: impl Into<String>, file: FileBlob) -> Self {
        self.entries.push((key.into(), FormValue::File(file)));
        self
    }

    pub fn text(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.entries.push((key.into(), FormValue::Text(value.to_string())));
        self
    }

    pub fn entries(&self) -> &[(String, FormValue)] {
        &self.entries
    }

    /// Encode every entry into a `FormPart`.
    pub fn into_parts(self) -> Vec<FormPart> {
        self.entries
            .into_iter()
            .map(|(key, value)| match value {
                FormValue::File(file) => FormPart::File {
                    key,
                    file_name: non_empty_or(file.name, DEFAULT_FILE_NAME),
                    mime: non_empty_or(file.mime, DEFAULT_MIME),
                    encoded_bytes: codec::encode(&file.bytes),
                    last_modified: file.last_modified,
                },
                FormValue::Text(value) => FormPart::Text { key, value },
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Raw(String),
    Bytes(Bytes),
    Form(Form),
}

/// A logical request, before encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    method: HttpMethod,
    url: String,
    headers: HashMap<String, String>,
    body: Option<Body>,
    with_credentials: bool,
    response_type: ResponseType,
}

impl Request {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            with_credentials: false,
            response_type: ResponseType::Json,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn raw(mut self, body: impl Into<String>) -> Self {
        self.body = Some(Body::Raw(body.into()));
        self
    }

    /// A binary body, sent byte for byte.
    pub fn bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(Body::Bytes(body.into()));
        self
    }

    pub fn form(mut self, form: Form) -> Self {
        self.body = Some(Body::Form(form));
        self
    }

    pub fn with_credentials(mut self, with_credentials: bool) -> Self {
        self.with_credentials = with_credentials;
        self
    }

    pub fn response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    pub fn into_descriptor(self) -> RequestDescriptor {
        RequestDescriptor {
            method: self.method,
            url: self.url,
            headers: self.headers,
            response_type: self.response_type,
            with_credentials: self.with_credentials,
            body: self.body.map(|body| match body {
                Body::Raw(raw) => RequestBody::Raw(raw),
                Body::Bytes(bytes) => RequestBody::Binary(codec::encode(&bytes)),
                Body::Form(form) => RequestBody::Parts(form.into_parts()),
            }),
        }
    }
}

/// Handle for sending messages to the relay endpoint.
#[derive(Debug, Clone)]
pub struct RelayClient {
    outbox: mpsc::Sender<Dispatch>,
    timeout: Duration,
}

impl RelayClient {
    pub fn new(outbox: mpsc::Sender<Dispatch>, timeout: Duration) -> Self {
        Self { outbox, timeout }
    }

    /// Encode and relay a logical request.
    pub async fn request(&self, request: Request) -> Result<HttpReply, RelayError> {
        self.send(request.into_descriptor()).await
    }

    /// Relay a ready-made descriptor.
    ///
    /// `Ok` means an HTTP exchange completed. The status may still be
    /// anything. A failure envelope from the endpoint becomes
    /// `RelayError::Remote`.
    pub async fn send(&self, descriptor: RequestDescriptor) -> Result<HttpReply, RelayError> {
        descriptor.validate()?;
        let (method, url) = (descriptor.method, descriptor.url.clone());
        match self.call(Message::RelayRequest { opts: descriptor }).await? {
            Reply::Relay(envelope) => {
                let result = envelope.into_result();
                match &result {
                    Ok(reply) => debug!("relay {method} {url} -> {}", reply.status),
                    Err(e) => debug!("relay {method} {url} failed: {e}"),
                }
                result
            }
            _ => Err(RelayError::UnexpectedReply("relay_request")),
        }
    }

    /// Callback adapter over [`RelayClient::request`].
    ///
    /// Exactly one of `on_success`/`on_failure` runs, on a spawned task.
    pub fn request_with<S, F>(&self, request: Request, on_success: S, on_failure: F) -> JoinHandle<()>
    where
        S: FnOnce(HttpReply) + Send + 'static,
        F: FnOnce(RelayError) + Send + 'static,
    {
        let client = self.clone();
        tokio::spawn(async move {
            match client.request(request).await {
                Ok(reply) => on_success(reply),
                Err(e) => on_failure(e),
            }
        })
    }

    pub async fn open_panel(&self) -> Result<PanelReply, RelayError> {
        match self.call(Message::OpenPanel).await? {
            Reply::Panel(reply) => Ok(reply),
            _ => Err(RelayError::UnexpectedReply("open_panel")),
        }
    }

    pub async fn save_image(&self, image_url: impl Into<String>) -> Result<SaveReply, RelayError> {
        let message = Message::SaveImage {
            image_url: image_url.into(),
        };
        match self.call(message).await? {
            Reply::Save(reply) => Ok(reply),
            _ => Err(RelayError::UnexpectedReply("save_image")),
        }
    }

    async fn call(&self, message: Message) -> Result<Reply, RelayError> {
        let tag = message.tag();
        let (reply, answer) = oneshot::channel();
        self.outbox
            .send(Dispatch { message, reply })
            .await
            .map_err(|_| RelayError::Channel(format!("no endpoint listening for {tag}")))?;

        match tokio::time::timeout(self.timeout, answer).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RelayError::Channel(format!("{tag} dropped without a reply"))),
            Err(_) => {
                warn!("{tag} got no reply within {:?}", self.timeout);
                Err(RelayError::Timeout(self.timeout))
            }
        }
    }
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

//! Network executors.
//!
//! # Design
//! The endpoint never talks to `reqwest` directly. It turns a descriptor into
//! an `OutboundRequest` (multipart rebuilt, headers merged, credential mode
//! resolved) and hands it to a `Fetcher`. Production uses `ReqwestFetcher`;
//! tests plug in stubs that record, delay, fail, or panic. Whatever the
//! executor returns is raw: status, ordered headers, body bytes.
//! Interpretation of the body belongs to `HttpReply::from_fetched`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use reqwest::cookie::Jar;
use reqwest::multipart::{Form, Part};

use crate::client::DEFAULT_MIME;
use crate::descriptor::HttpMethod;
use crate::error::RelayError;

/// Whether ambient cookies go out with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credentials {
    Include,
    Omit,
}

/// One rebuilt multipart field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultipartField {
    File {
        key: String,
        file_name: String,
        mime: String,
        bytes: Bytes,
        last_modified: u64,
    },
    Text {
        key: String,
        value: String,
    },
}

impl MultipartField {
    pub fn key(&self) -> &str {
        match self {
            MultipartField::File { key, .. } | MultipartField::Text { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutboundBody {
    #[default]
    Empty,
    Raw(String),
    Binary(Bytes),
    /// The executor picks the boundary and the content type.
    Multipart(Vec<MultipartField>),
}

/// A request ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: OutboundBody,
    pub credentials: Credentials,
}

impl OutboundRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A raw response as the executor saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Executes outbound requests.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: OutboundRequest) -> Result<FetchedResponse, RelayError>;
}

/// `reqwest`-backed executor.
///
/// Holds one client per credential mode. Only the credentialed client owns
/// a cookie jar, so `Credentials::Omit` can never leak session cookies.
#[derive(Clone)]
pub struct ReqwestFetcher {
    credentialed: reqwest::Client,
    anonymous: reqwest::Client,
    jar: Arc<Jar>,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, RelayError> {
        Self::with_cookie_jar(Arc::new(Jar::default()))
    }

    /// Build an executor around an existing cookie jar, e.g. one seeded
    /// with a site session.
    pub fn with_cookie_jar(jar: Arc<Jar>) -> Result<Self, RelayError> {
        let credentialed = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .build()
            .map_err(|e| RelayError::Network(e.to_string()))?;
        let anonymous = reqwest::Client::builder()
            .build()
            .map_err(|e| RelayError::Network(e.to_string()))?;
        Ok(Self {
            credentialed,
            anonymous,
            jar,
        })
    }

    pub fn cookie_jar(&self) -> &Arc<Jar> {
        &self.jar
    }

    fn client(&self, credentials: Credentials) -> &reqwest::Client {
        match credentials {
            Credentials::Include => &self.credentialed,
            Credentials::Omit => &self.anonymous,
        }
    }
}

#[async_trait]
impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, request: OutboundRequest) -> Result<FetchedResponse, RelayError> {
        debug!("{} {} ({:?})", request.method, request.url, request.credentials);
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client(request.credentials)
            .request(method, &request.url)
            .header(reqwest::header::CACHE_CONTROL, "no-cache");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            OutboundBody::Empty => builder,
            OutboundBody::Raw(raw) => builder.body(raw),
            OutboundBody::Binary(bytes) => builder.body(bytes),
            OutboundBody::Multipart(fields) => builder.multipart(build_form(fields)?),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| RelayError::Network(e.to_string()))?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| RelayError::Network(e.to_string()))?;

        Ok(FetchedResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }
}

fn build_form(fields: Vec<MultipartField>) -> Result<Form, RelayError> {
    let mut form = Form::new();
    for field in fields {
        form = match field {
            MultipartField::File {
                key,
                file_name,
                mime,
                bytes,
                ..
            } => {
                let part = || Part::bytes(bytes.to_vec()).file_name(file_name.clone());
                let part = match part().mime_str(&mime) {
                    Ok(part) => part,
                    Err(e) => {
                        warn!("sending {file_name} as {DEFAULT_MIME}, unusable mime {mime:?}: {e}");
                        part()
                            .mime_str(DEFAULT_MIME)
                            .map_err(|e| RelayError::Network(e.to_string()))?
                    }
                };
                form.part(key, part)
            }
            MultipartField::Text { key, value } => form.text(key, value),
        };
    }
    Ok(form)
}

//! Request descriptors: an HTTP request described as plain data.
//!
//! # Design
//! A `RequestDescriptor` is what the restricted side hands to the privileged
//! side. It owns everything (no borrowed buffers, no live file handles) so it
//! can be serialised onto the relay channel as-is. Multipart bodies travel as
//! an ordered list of `FormPart`s with file bytes already base64-encoded;
//! the executing side rebuilds the multipart body from them.
//!
//! `body` is an `Option<RequestBody>` rather than two optional fields, so a
//! descriptor can never carry both a raw payload and parts.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// HTTP method for a relayed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        })
    }
}

/// How the executing side should interpret the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    #[default]
    Json,
    Text,
}

/// One field of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FormPart {
    #[serde(rename_all = "camelCase")]
    File {
        key: String,
        file_name: String,
        mime: String,
        /// Base64 of the full file content.
        encoded_bytes: String,
        /// Milliseconds since the Unix epoch.
        last_modified: u64,
    },
    Text { key: String, value: String },
}

impl FormPart {
    pub fn key(&self) -> &str {
        match self {
            FormPart::File { key, .. } | FormPart::Text { key, .. } => key,
        }
    }
}

/// Request body: an opaque payload or an ordered multipart field list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestBody {
    Raw(String),
    /// Base64 of a binary payload, encoded the same way as file parts.
    Binary(String),
    Parts(Vec<FormPart>),
}

/// A complete HTTP request ready to cross the relay channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDescriptor {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub response_type: ResponseType,
    #[serde(default)]
    pub with_credentials: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<RequestBody>,
}

impl RequestDescriptor {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            ..Default::default()
        }
    }

    /// Reject descriptors that cannot be executed.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.url.trim().is_empty() {
            return Err(RelayError::MissingUrl);
        }
        Ok(())
    }

    /// Look up a header by name, ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn parts(&self) -> Option<&[FormPart]> {
        match &self.body {
            Some(RequestBody::Parts(parts)) => Some(parts),
            _ => None,
        }
    }
}

//! Response envelopes returned across the relay channel.
//!
//! # Design
//! The envelope is a sum type: a normalised `HttpReply` or a bare
//! `{ "error": ... }`. Both shapes can never appear together. Any completed
//! HTTP exchange is a success envelope, whatever its status code. Whether a
//! 401 is a failure is the caller's call, not the relay's.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::descriptor::ResponseType;
use crate::error::RelayError;
use crate::fetch::FetchedResponse;

/// A single response header, in the order the server sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPair {
    pub name: String,
    pub value: String,
}

/// A completed HTTP exchange, normalised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpReply {
    pub status: u16,
    pub status_text: String,
    /// Parsed body when JSON was expected and parsed cleanly.
    pub response: Option<Value>,
    /// Raw body when JSON was not expected or did not parse.
    #[serde(default)]
    pub response_text: String,
    #[serde(default)]
    pub response_headers: Vec<HeaderPair>,
}

impl HttpReply {
    /// Normalise a raw response.
    ///
    /// JSON parsing is attempted when `response_type` asks for it or the
    /// content type says so. A body that fails to parse is kept as text,
    /// never reported as an error.
    pub fn from_fetched(fetched: FetchedResponse, response_type: ResponseType) -> Self {
        let content_type = fetched
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.to_ascii_lowercase())
            .unwrap_or_default();
        let wants_json = response_type == ResponseType::Json || content_type.contains("json");

        let (response, response_text) = if wants_json {
            match serde_json::from_slice::<Value>(&fetched.body) {
                Ok(value) => (Some(value), String::new()),
                Err(_) => (None, String::from_utf8_lossy(&fetched.body).into_owned()),
            }
        } else {
            (None, String::from_utf8_lossy(&fetched.body).into_owned())
        };

        HttpReply {
            status: fetched.status,
            status_text: fetched.status_text,
            response,
            response_text,
            response_headers: fetched
                .headers
                .into_iter()
                .map(|(name, value)| HeaderPair { name, value })
                .collect(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The body as JSON: the parsed value, or a late parse of the raw text.
    pub fn json(&self) -> Option<Value> {
        self.response
            .clone()
            .or_else(|| serde_json::from_str(&self.response_text).ok())
    }

    /// First header with this name, ignoring ASCII case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

/// Result of one relay round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseEnvelope {
    Failure { error: String },
    Success(HttpReply),
}

impl ResponseEnvelope {
    pub fn failure(error: impl ToString) -> Self {
        ResponseEnvelope::Failure {
            error: error.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResponseEnvelope::Success(_))
    }

    pub fn into_result(self) -> Result<HttpReply, RelayError> {
        match self {
            ResponseEnvelope::Success(reply) => Ok(reply),
            ResponseEnvelope::Failure { error } => Err(RelayError::Remote(error)),
        }
    }
}

impl From<HttpReply> for ResponseEnvelope {
    fn from(reply: HttpReply) -> Self {
        ResponseEnvelope::Success(reply)
    }
}

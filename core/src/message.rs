//! Messages exchanged between the restricted and the privileged side.
//!
//! # Design
//! Message kinds form a closed enum, so the endpoint's dispatch is an
//! exhaustive `match`. Every message travels with its own `oneshot` reply
//! slot. That slot is the correlation: a message is answered at most once,
//! and independent messages never share ordering.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::descriptor::RequestDescriptor;
use crate::envelope::ResponseEnvelope;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum Message {
    RelayRequest {
        opts: RequestDescriptor,
    },
    OpenPanel,
    SaveImage {
        #[serde(rename = "imageUrl")]
        image_url: String,
    },
}

impl Message {
    pub fn tag(&self) -> &'static str {
        match self {
            Message::RelayRequest { .. } => "relay_request",
            Message::OpenPanel => "open_panel",
            Message::SaveImage { .. } => "save_image",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reply to a [`Message`]; the variant always matches the message kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Relay(ResponseEnvelope),
    Panel(PanelReply),
    Save(SaveReply),
}

/// A message in flight together with the slot its answer goes into.
#[derive(Debug)]
pub struct Dispatch {
    pub message: Message,
    pub reply: oneshot::Sender<Reply>,
}

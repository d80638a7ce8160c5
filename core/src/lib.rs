//! Cross-context request relay for an image-upload extension.
//!
//! # Overview
//! Code running in a restricted context (a content script, or any task that
//! must not do network IO itself) describes an HTTP request as plain data.
//! It hands the description to a privileged endpoint over a message channel
//! and gets back a normalised response envelope. File parts travel as
//! base64 text, since only serialisable data crosses the channel.
//!
//! # Design
//! - `RequestDescriptor` and `ResponseEnvelope` are the wire types. The
//!   envelope is either a success record or `{ "error": ... }`, never both.
//! - `RelayClient` sends `Message`s and awaits one reply each, bounded by a
//!   timeout. A dead or silent endpoint surfaces as an error, never a hang.
//! - `RelayEndpoint` executes descriptors through a `Fetcher`. It turns
//!   every failure mode (network error, panic, timeout) into a failure
//!   envelope.
//! - Requests that need the site's own cookies can run inside a companion
//!   page through `SiteTabs` / `PageBridge`, correlated by request id.
//! - `ImageHost` layers the upstream API on top: API-key auth with a single
//!   cookie fallback, and bounded-concurrency batches.

pub mod api;
pub mod batch;
pub mod bridge;
pub mod client;
pub mod codec;
pub mod config;
pub mod descriptor;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod fetch;
pub mod filetype;
pub mod message;
pub mod relay;
mod save;
pub mod session;
pub mod tabs;

pub use api::{ImageHost, ImageRecord, Page, Pagination, UploadResult};
pub use batch::BatchReport;
pub use bridge::{BridgeHandle, BridgeOptions, PageBridge};
pub use client::{Body, FileBlob, Form, RelayClient, Request};
pub use config::RelayConfig;
pub use descriptor::{FormPart, HttpMethod, RequestBody, RequestDescriptor, ResponseType};
pub use endpoint::{PanelHost, RelayEndpoint};
pub use envelope::{HttpReply, ResponseEnvelope};
pub use error::{ApiError, RelayError};
pub use fetch::{Fetcher, ReqwestFetcher};
pub use message::Message;
pub use relay::Relay;
pub use session::Session;
pub use tabs::{BridgeTabs, SiteTabs};

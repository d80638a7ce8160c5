//! Privileged-side relay endpoint.
//!
//! # Design
//! The endpoint is the only place where a descriptor turns into a network
//! call. `execute` rebuilds the multipart body, merges the site's fixed
//! headers over the caller's, and runs the executor under a timeout. It then
//! normalises the response. Every failure is folded into a failure envelope
//! on the way out. That includes a panicking executor, which is caught with
//! `catch_unwind`. A caller waiting on the other end of the channel always
//! gets an answer.
//!
//! Credentialed requests go through a companion tab's page bridge first
//! when tabs are available. The direct executor is the fallback.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::client::{DEFAULT_FILE_NAME, DEFAULT_MIME};
use crate::codec;
use crate::config::RelayConfig;
use crate::descriptor::{FormPart, RequestBody, RequestDescriptor};
use crate::envelope::{HttpReply, ResponseEnvelope};
use crate::error::RelayError;
use crate::fetch::{Credentials, Fetcher, MultipartField, OutboundBody, OutboundRequest};
use crate::message::{Dispatch, Message, PanelReply, Reply, SaveReply};
use crate::save;
use crate::tabs::SiteTabs;

/// Whatever shows the management panel on the restricted side.
pub trait PanelHost: Send + Sync {
    fn open_panel(&self) -> Result<(), RelayError>;
}

/// How a descriptor is executed: which headers are forced, whether the
/// credential mode is forced, how long the network call may take.
#[derive(Debug, Clone)]
pub struct ExecPolicy {
    pub fixed_headers: Vec<(String, String)>,
    /// `None` follows the descriptor's `with_credentials`.
    pub credentials: Option<Credentials>,
    pub timeout: Duration,
}

pub struct RelayEndpoint {
    config: Arc<RelayConfig>,
    fetcher: Arc<dyn Fetcher>,
    tabs: Option<Arc<dyn SiteTabs>>,
    panel: Option<Arc<dyn PanelHost>>,
    policy: ExecPolicy,
}

impl RelayEndpoint {
    pub fn new(config: Arc<RelayConfig>, fetcher: Arc<dyn Fetcher>) -> Self {
        let policy = ExecPolicy {
            fixed_headers: config.fixed_headers(),
            credentials: None,
            timeout: config.fetch_timeout(),
        };
        Self {
            config,
            fetcher,
            tabs: None,
            panel: None,
            policy,
        }
    }

    pub fn with_tabs(mut self, tabs: Arc<dyn SiteTabs>) -> Self {
        self.tabs = Some(tabs);
        self
    }

    pub fn with_panel(mut self, panel: Arc<dyn PanelHost>) -> Self {
        self.panel = Some(panel);
        self
    }

    /// Answer messages until the inbox closes or `shutdown` fires.
    ///
    /// Each message is handled on its own task, so a slow upload never
    /// holds up a quick `open_panel`.
    pub async fn serve(self: Arc<Self>, mut inbox: mpsc::Receiver<Dispatch>, mut shutdown: oneshot::Receiver<()>) {
        info!("relay endpoint listening");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                next = inbox.recv() => match next {
                    Some(dispatch) => {
                        let endpoint = Arc::clone(&self);
                        tokio::spawn(async move { endpoint.answer(dispatch).await });
                    }
                    None => break,
                },
            }
        }
        info!("relay endpoint stopped");
    }

    async fn answer(&self, dispatch: Dispatch) {
        let Dispatch { message, reply } = dispatch;
        let tag = message.tag();
        if reply.send(self.handle(message).await).is_err() {
            debug!("{tag} caller went away before the reply");
        }
    }

    pub async fn handle(&self, message: Message) -> Reply {
        match message {
            Message::RelayRequest { opts } => Reply::Relay(self.relay(opts).await),
            Message::OpenPanel => Reply::Panel(self.open_panel()),
            Message::SaveImage { image_url } => Reply::Save(self.save_image(&image_url).await),
        }
    }

    pub async fn relay(&self, descriptor: RequestDescriptor) -> ResponseEnvelope {
        if let Err(e) = descriptor.validate() {
            return ResponseEnvelope::failure(e);
        }
        if descriptor.with_credentials {
            if let Some(tabs) = &self.tabs {
                let attempt = AssertUnwindSafe(self.site_fetch(tabs.as_ref(), descriptor.clone()))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(RelayError::Bridge(panic_message(panic))));
                match attempt {
                    Ok(envelope) => return envelope,
                    Err(e) => warn!("site fetch of {} failed, using direct fetch: {e}", descriptor.url),
                }
            }
        }
        execute(self.fetcher.as_ref(), descriptor, &self.policy).await
    }

    /// Run the descriptor inside a companion tab of the target site.
    ///
    /// A tab opened just for this request is closed again whatever the
    /// outcome.
    async fn site_fetch(
        &self,
        tabs: &dyn SiteTabs,
        descriptor: RequestDescriptor,
    ) -> Result<ResponseEnvelope, RelayError> {
        let origin = self.config.site_origin.as_str();
        let (tab, temporary) = match tabs.find(origin).await {
            Some(tab) => (tab, false),
            None => (tabs.open(origin).await?, true),
        };
        debug!("site fetch {} via {tab:?} (temporary: {temporary})", descriptor.url);

        let outcome = AssertUnwindSafe(tabs.site_fetch(tab, descriptor))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(RelayError::Bridge(panic_message(panic))));
        if temporary {
            if let Err(e) = tabs.close(tab).await {
                warn!("failed to close temporary {tab:?}: {e}");
            }
        }
        match outcome? {
            ResponseEnvelope::Failure { error } => Err(RelayError::Bridge(error)),
            success => Ok(success),
        }
    }

    fn open_panel(&self) -> PanelReply {
        let Some(panel) = &self.panel else {
            return PanelReply {
                ok: false,
                error: Some(RelayError::PanelNotReady.to_string()),
            };
        };
        match std::panic::catch_unwind(AssertUnwindSafe(|| panel.open_panel())) {
            Ok(Ok(())) => PanelReply { ok: true, error: None },
            Ok(Err(e)) => PanelReply {
                ok: false,
                error: Some(e.to_string()),
            },
            Err(panic) => PanelReply {
                ok: false,
                error: Some(panic_message(panic)),
            },
        }
    }

    async fn save_image(&self, image_url: &str) -> SaveReply {
        let work = save::save_image(
            self.fetcher.as_ref(),
            &self.config.download_dir,
            image_url,
            self.policy.timeout,
        );
        let outcome = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(outcome) => outcome.map_err(|e| e.to_string()),
            Err(panic) => Err(panic_message(panic)),
        };
        match outcome {
            Ok(filename) => {
                info!("saved {image_url} as {filename}");
                SaveReply {
                    ok: true,
                    filename: Some(filename),
                    error: None,
                }
            }
            Err(error) => {
                warn!("saving {image_url} failed: {error}");
                SaveReply {
                    ok: false,
                    filename: None,
                    error: Some(error),
                }
            }
        }
    }
}

/// Execute one descriptor and fold every outcome into an envelope.
pub async fn execute(fetcher: &dyn Fetcher, descriptor: RequestDescriptor, policy: &ExecPolicy) -> ResponseEnvelope {
    let response_type = descriptor.response_type;
    let work = async {
        let request = build_outbound(descriptor, policy)?;
        let fetched = tokio::time::timeout(policy.timeout, fetcher.fetch(request))
            .await
            .map_err(|_| RelayError::Timeout(policy.timeout))??;
        Ok::<_, RelayError>(HttpReply::from_fetched(fetched, response_type))
    };

    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(reply)) => ResponseEnvelope::Success(reply),
        Ok(Err(e)) => ResponseEnvelope::failure(e),
        Err(panic) => {
            let message = panic_message(panic);
            warn!("executor panicked: {message}");
            ResponseEnvelope::failure(message)
        }
    }
}

/// Turn a descriptor into a wire-ready request.
pub fn build_outbound(descriptor: RequestDescriptor, policy: &ExecPolicy) -> Result<OutboundRequest, RelayError> {
    descriptor.validate()?;
    let RequestDescriptor {
        method,
        url,
        headers,
        with_credentials,
        body,
        ..
    } = descriptor;

    let mut headers: Vec<(String, String)> = headers.into_iter().collect();
    headers.sort();

    let body = match body {
        None => OutboundBody::Empty,
        Some(RequestBody::Raw(raw)) => OutboundBody::Raw(raw),
        Some(RequestBody::Binary(encoded)) => OutboundBody::Binary(Bytes::from(codec::decode(&encoded)?)),
        Some(RequestBody::Parts(parts)) if parts.is_empty() => OutboundBody::Empty,
        Some(RequestBody::Parts(parts)) => {
            // The executor owns the multipart boundary.
            headers.retain(|(name, _)| !name.eq_ignore_ascii_case("content-type"));
            OutboundBody::Multipart(rebuild_parts(parts)?)
        }
    };

    for (name, value) in &policy.fixed_headers {
        headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
        headers.push((name.clone(), value.clone()));
    }

    let credentials = policy.credentials.unwrap_or(if with_credentials {
        Credentials::Include
    } else {
        Credentials::Omit
    });

    Ok(OutboundRequest {
        method,
        url,
        headers,
        body,
        credentials,
    })
}

fn rebuild_parts(parts: Vec<FormPart>) -> Result<Vec<MultipartField>, RelayError> {
    parts
        .into_iter()
        .map(|part| match part {
            FormPart::File {
                key,
                file_name,
                mime,
                encoded_bytes,
                last_modified,
            } => Ok(MultipartField::File {
                key,
                file_name: if file_name.is_empty() {
                    DEFAULT_FILE_NAME.to_string()
                } else {
                    file_name
                },
                mime: if mime.is_empty() { DEFAULT_MIME.to_string() } else { mime },
                bytes: Bytes::from(codec::decode(&encoded_bytes)?),
                last_modified,
            }),
            FormPart::Text { key, value } => Ok(MultipartField::Text { key, value }),
        })
        .collect()
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "executor panicked".to_string()
    }
}

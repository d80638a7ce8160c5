//! Page-context bridge.
//!
//! # Design
//! The bridge executes descriptors from inside a page of the target site,
//! so the site's own cookies ride along. It has two halves joined by a
//! page-internal message exchange:
//!
//! - the page half receives `PageRequest`s and runs each one on its own task
//!   with credentials forced on. It posts a `PageResponse` tagged with the
//!   same id.
//! - the `BridgeHandle` side parks a `oneshot` per request in a pending map
//!   keyed by correlation id. A router task hands each response to the
//!   matching waiter.
//!
//! Concurrent requests therefore complete in any order without cross-talk.
//! Responses for ids nobody is waiting on (timed out, say) are dropped.
//! Dropping every `BridgeHandle` shuts the page half down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::descriptor::RequestDescriptor;
use crate::endpoint::{self, ExecPolicy};
use crate::envelope::ResponseEnvelope;
use crate::error::RelayError;
use crate::fetch::{Credentials, Fetcher};

const PAGE_QUEUE: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRequest {
    pub id: String,
    pub opts: RequestDescriptor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageResponse {
    pub id: String,
    pub res: ResponseEnvelope,
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<ResponseEnvelope>>>>;

/// Settings for one page bridge.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Origin of the page the bridge lives in.
    pub origin: String,
    pub fetch_timeout: Duration,
    /// How long a caller waits for its correlated response.
    pub reply_timeout: Duration,
}

pub struct PageBridge;

impl PageBridge {
    /// Start both halves of a bridge on the current runtime.
    pub fn spawn(fetcher: Arc<dyn Fetcher>, options: BridgeOptions) -> BridgeHandle {
        let (requests, mut page_inbox) = mpsc::channel::<PageRequest>(PAGE_QUEUE);
        let (page_outbox, mut responses) = mpsc::channel::<PageResponse>(PAGE_QUEUE);
        let pending: Pending = Arc::default();

        let origin = options.origin.trim_end_matches('/').to_string();
        let policy = Arc::new(ExecPolicy {
            fixed_headers: vec![
                ("Origin".to_string(), origin.clone()),
                ("Referer".to_string(), format!("{origin}/")),
            ],
            credentials: Some(Credentials::Include),
            timeout: options.fetch_timeout,
        });

        tokio::spawn(async move {
            while let Some(PageRequest { id, opts }) = page_inbox.recv().await {
                let fetcher = Arc::clone(&fetcher);
                let policy = Arc::clone(&policy);
                let outbox = page_outbox.clone();
                tokio::spawn(async move {
                    let res = endpoint::execute(fetcher.as_ref(), opts, &policy).await;
                    if outbox.send(PageResponse { id, res }).await.is_err() {
                        debug!("bridge router gone, dropping response");
                    }
                });
            }
            debug!("page bridge for {origin} closed");
        });

        let router_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(PageResponse { id, res }) = responses.recv().await {
                let waiter = lock(&router_pending).remove(&id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(res);
                    }
                    None => debug!("no waiter for bridge response {id}"),
                }
            }
        });

        BridgeHandle {
            requests,
            pending,
            reply_timeout: options.reply_timeout,
        }
    }
}

/// Content-side handle to a running page bridge.
#[derive(Debug)]
pub struct BridgeHandle {
    requests: mpsc::Sender<PageRequest>,
    pending: Pending,
    reply_timeout: Duration,
}

impl BridgeHandle {
    /// Execute `opts` inside the page and wait for the correlated response.
    pub async fn fetch(&self, opts: RequestDescriptor) -> Result<ResponseEnvelope, RelayError> {
        opts.validate()?;
        let id = format!("pf_{}", Uuid::new_v4().simple());
        let (waiter, response) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), waiter);

        let request = PageRequest { id: id.clone(), opts };
        if self.requests.send(request).await.is_err() {
            lock(&self.pending).remove(&id);
            return Err(RelayError::Bridge("page is gone".into()));
        }

        match tokio::time::timeout(self.reply_timeout, response).await {
            Ok(Ok(res)) => Ok(res),
            Ok(Err(_)) => Err(RelayError::Bridge(format!("request {id} dropped by the page"))),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(RelayError::Timeout(self.reply_timeout))
            }
        }
    }

    /// Requests still waiting for a response.
    pub fn in_flight(&self) -> usize {
        lock(&self.pending).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

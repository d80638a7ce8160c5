//! Companion tabs of the target site.
//!
//! # Design
//! A credentialed request that must carry the site's own cookies runs inside
//! a page of that site. `SiteTabs` is the seam: find an open page for an
//! origin, open one (resolving once it is ready), close it, and run a
//! descriptor in it. `BridgeTabs` backs each tab with a `PageBridge` and
//! never holds more than one tab per origin.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};

use crate::bridge::{BridgeHandle, BridgeOptions, PageBridge};
use crate::config::RelayConfig;
use crate::descriptor::RequestDescriptor;
use crate::envelope::ResponseEnvelope;
use crate::error::RelayError;
use crate::fetch::Fetcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TabId(pub u64);

#[async_trait]
pub trait SiteTabs: Send + Sync {
    /// An already open tab of `origin`, if any.
    async fn find(&self, origin: &str) -> Option<TabId>;

    /// Open a tab of `origin`; resolves once the page can take requests.
    async fn open(&self, origin: &str) -> Result<TabId, RelayError>;

    async fn close(&self, tab: TabId) -> Result<(), RelayError>;

    /// Execute `opts` inside `tab`'s page context.
    async fn site_fetch(&self, tab: TabId, opts: RequestDescriptor) -> Result<ResponseEnvelope, RelayError>;
}

/// Builds the credentialed executor a new tab's page runs with.
pub type FetcherFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn Fetcher>, RelayError> + Send + Sync>;

struct Tab {
    origin: String,
    bridge: Arc<BridgeHandle>,
}

/// In-process tabs, one `PageBridge` each.
pub struct BridgeTabs {
    factory: FetcherFactory,
    fetch_timeout: Duration,
    reply_timeout: Duration,
    next_id: AtomicU64,
    tabs: Mutex<HashMap<TabId, Tab>>,
}

impl BridgeTabs {
    pub fn new(config: &RelayConfig, factory: FetcherFactory) -> Self {
        Self {
            factory,
            fetch_timeout: config.fetch_timeout(),
            reply_timeout: config.bridge_timeout(),
            next_id: AtomicU64::new(1),
            tabs: Mutex::new(HashMap::new()),
        }
    }

    /// Every tab shares `fetcher` (and therefore its cookie jar).
    pub fn with_fetcher(config: &RelayConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        let factory: FetcherFactory =
            Arc::new(move |_: &str| -> Result<Arc<dyn Fetcher>, RelayError> { Ok(Arc::clone(&fetcher)) });
        Self::new(config, factory)
    }

    pub fn open_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TabId, Tab>> {
        self.tabs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn find_locked(tabs: &HashMap<TabId, Tab>, origin: &str) -> Option<TabId> {
        tabs.iter()
            .find(|(_, tab)| same_origin(&tab.origin, origin))
            .map(|(id, _)| *id)
    }
}

#[async_trait]
impl SiteTabs for BridgeTabs {
    async fn find(&self, origin: &str) -> Option<TabId> {
        Self::find_locked(&self.lock(), origin)
    }

    async fn open(&self, origin: &str) -> Result<TabId, RelayError> {
        let mut tabs = self.lock();
        if let Some(existing) = Self::find_locked(&tabs, origin) {
            debug!("reusing {existing:?} for {origin}");
            return Ok(existing);
        }
        let fetcher = (self.factory)(origin)?;
        let bridge = PageBridge::spawn(
            fetcher,
            BridgeOptions {
                origin: origin.to_string(),
                fetch_timeout: self.fetch_timeout,
                reply_timeout: self.reply_timeout,
            },
        );
        let id = TabId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tabs.insert(
            id,
            Tab {
                origin: origin.to_string(),
                bridge: Arc::new(bridge),
            },
        );
        info!("opened {id:?} for {origin}");
        Ok(id)
    }

    async fn close(&self, tab: TabId) -> Result<(), RelayError> {
        match self.lock().remove(&tab) {
            Some(_) => {
                info!("closed {tab:?}");
                Ok(())
            }
            None => Err(RelayError::Bridge(format!("{tab:?} is not open"))),
        }
    }

    async fn site_fetch(&self, tab: TabId, opts: RequestDescriptor) -> Result<ResponseEnvelope, RelayError> {
        let bridge = self
            .lock()
            .get(&tab)
            .map(|t| Arc::clone(&t.bridge))
            .ok_or_else(|| RelayError::Bridge(format!("{tab:?} is not open")))?;
        bridge.fetch(opts).await
    }
}

fn same_origin(a: &str, b: &str) -> bool {
    a.trim_end_matches('/').eq_ignore_ascii_case(b.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::descriptor::HttpMethod;
    use crate::fetch::{FetchedResponse, OutboundRequest};

    struct Ok200;

    #[async_trait]
    impl Fetcher for Ok200 {
        async fn fetch(&self, _request: OutboundRequest) -> Result<FetchedResponse, RelayError> {
            Ok(FetchedResponse {
                status: 200,
                status_text: "OK".into(),
                headers: Vec::new(),
                body: Bytes::from_static(b"{}"),
            })
        }
    }

    fn tabs() -> BridgeTabs {
        BridgeTabs::with_fetcher(&RelayConfig::default(), Arc::new(Ok200))
    }

    #[tokio::test]
    async fn one_tab_per_origin() {
        let tabs = tabs();
        assert_eq!(tabs.find("https://www.nodeimage.com").await, None);
        let first = tabs.open("https://www.nodeimage.com").await.unwrap();
        let second = tabs.open("https://www.nodeimage.com/").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(tabs.open_count(), 1);
        assert_eq!(tabs.find("https://WWW.nodeimage.com").await, Some(first));
    }

    #[tokio::test]
    async fn closed_tab_cannot_fetch() {
        let tabs = tabs();
        let tab = tabs.open("https://www.nodeimage.com").await.unwrap();
        let desc = RequestDescriptor::new(HttpMethod::Get, "https://api/x");
        assert!(tabs.site_fetch(tab, desc.clone()).await.unwrap().is_success());

        tabs.close(tab).await.unwrap();
        assert_eq!(tabs.open_count(), 0);
        assert!(matches!(tabs.site_fetch(tab, desc).await, Err(RelayError::Bridge(_))));
        assert!(tabs.close(tab).await.is_err());
    }

    #[tokio::test]
    async fn factory_errors_surface() {
        let tabs = BridgeTabs::new(
            &RelayConfig::default(),
            Arc::new(|_: &str| -> Result<Arc<dyn Fetcher>, RelayError> {
                Err(RelayError::Bridge("no browser".into()))
            }),
        );
        assert!(tabs.open("https://www.nodeimage.com").await.is_err());
        assert_eq!(tabs.open_count(), 0);
    }
}

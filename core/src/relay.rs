//! Wiring: start an endpoint, hand out clients, shut down.

use std::sync::Arc;

use log::debug;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::client::RelayClient;
use crate::config::RelayConfig;
use crate::endpoint::{PanelHost, RelayEndpoint};
use crate::fetch::Fetcher;
use crate::tabs::SiteTabs;

/// A running relay. Dropping it stops the endpoint loop as well.
pub struct Relay {
    client: RelayClient,
    shutdown: oneshot::Sender<()>,
    endpoint: JoinHandle<()>,
}

pub struct RelayBuilder {
    config: Arc<RelayConfig>,
    fetcher: Arc<dyn Fetcher>,
    tabs: Option<Arc<dyn SiteTabs>>,
    panel: Option<Arc<dyn PanelHost>>,
}

impl Relay {
    pub fn builder(config: Arc<RelayConfig>, fetcher: Arc<dyn Fetcher>) -> RelayBuilder {
        RelayBuilder {
            config,
            fetcher,
            tabs: None,
            panel: None,
        }
    }

    /// Start a relay with no companion tabs and no panel host.
    pub fn start(config: Arc<RelayConfig>, fetcher: Arc<dyn Fetcher>) -> Relay {
        Self::builder(config, fetcher).start()
    }

    pub fn client(&self) -> RelayClient {
        self.client.clone()
    }

    /// Stop accepting messages and wait for the loop to exit. Requests
    /// already being executed still get their replies.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.endpoint.await {
            debug!("endpoint task ended abnormally: {e}");
        }
    }
}

impl RelayBuilder {
    pub fn with_tabs(mut self, tabs: Arc<dyn SiteTabs>) -> Self {
        self.tabs = Some(tabs);
        self
    }

    pub fn with_panel(mut self, panel: Arc<dyn PanelHost>) -> Self {
        self.panel = Some(panel);
        self
    }

    /// Spawn the endpoint on the current runtime.
    pub fn start(self) -> Relay {
        let (outbox, inbox) = mpsc::channel(self.config.channel_capacity.max(1));
        let (shutdown, stop) = oneshot::channel();
        let reply_budget = self.config.reply_budget(self.tabs.is_some());

        let mut endpoint = RelayEndpoint::new(Arc::clone(&self.config), self.fetcher);
        if let Some(tabs) = self.tabs {
            endpoint = endpoint.with_tabs(tabs);
        }
        if let Some(panel) = self.panel {
            endpoint = endpoint.with_panel(panel);
        }
        let endpoint = tokio::spawn(Arc::new(endpoint).serve(inbox, stop));

        Relay {
            client: RelayClient::new(outbox, reply_budget),
            shutdown,
            endpoint,
        }
    }
}

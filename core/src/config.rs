//! Runtime configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Path templates of the upstream image-hosting API, relative to `api_base`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EndpointPaths {
    pub upload: String,
    pub api_key: String,
    pub list: String,
    /// `{id}` is replaced with the percent-encoded image id.
    pub delete: String,
    pub images: String,
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self {
            upload: "/api/upload".into(),
            api_key: "/api/user/api-key".into(),
            list: "/api/v1/list".into(),
            delete: "/api/v1/delete/{id}".into(),
            images: "/api/images".into(),
        }
    }
}

/// Headroom for channel hops on top of the bridge and fetch budgets.
const REPLY_SLACK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelayConfig {
    /// Origin of the target site. Sent as `Origin`/`Referer` on every
    /// relayed request and used to locate companion tabs.
    pub site_origin: String,
    pub api_base: String,
    pub endpoints: EndpointPaths,
    pub reply_timeout_ms: u64,
    pub fetch_timeout_ms: u64,
    pub bridge_timeout_ms: u64,
    pub batch_concurrency: usize,
    pub list_page_size: usize,
    pub max_file_size: usize,
    pub channel_capacity: usize,
    pub download_dir: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            site_origin: "https://www.nodeimage.com".into(),
            api_base: "https://api.nodeimage.com".into(),
            endpoints: EndpointPaths::default(),
            reply_timeout_ms: 30_000,
            fetch_timeout_ms: 30_000,
            bridge_timeout_ms: 30_000,
            batch_concurrency: 2,
            list_page_size: 10,
            max_file_size: 30 * 1024 * 1024,
            channel_capacity: 64,
            download_dir: PathBuf::from("downloads"),
        }
    }
}

impl RelayConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn bridge_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_timeout_ms)
    }

    /// How long a caller waits for a reply. With companion tabs a
    /// credentialed request can use up the whole bridge budget before the
    /// direct fetch starts, so the wait never drops below both combined.
    pub fn reply_budget(&self, bridged: bool) -> Duration {
        let reply = self.reply_timeout();
        if !bridged {
            return reply;
        }
        let floor = self.bridge_timeout() + self.fetch_timeout() + REPLY_SLACK;
        reply.max(floor)
    }

    /// Headers the upstream's anti-forgery checks expect on every request.
    pub fn fixed_headers(&self) -> Vec<(String, String)> {
        let origin = self.site_origin.trim_end_matches('/');
        vec![
            ("Origin".to_string(), origin.to_string()),
            ("Referer".to_string(), format!("{origin}/")),
        ]
    }

    pub fn upload_url(&self) -> String {
        self.url(&self.endpoints.upload)
    }

    pub fn api_key_url(&self) -> String {
        self.url(&self.endpoints.api_key)
    }

    pub fn list_url(&self) -> String {
        self.url(&self.endpoints.list)
    }

    pub fn delete_url(&self, id: &str) -> String {
        let id = utf8_percent_encode(id, NON_ALPHANUMERIC).to_string();
        self.url(&self.endpoints.delete.replace("{id}", &id))
    }

    /// Cookie-authenticated paged listing. `_t` busts intermediary caches.
    pub fn images_url(&self, page: usize, limit: usize, timestamp_ms: u128) -> String {
        format!(
            "{}?page={page}&limit={limit}&_t={timestamp_ms}",
            self.url(&self.endpoints.images)
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = RelayConfig::from_toml_str("").unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.batch_concurrency, 2);
    }

    #[test]
    fn partial_document_overrides_only_named_fields() {
        let config = RelayConfig::from_toml_str(
            r#"
            api_base = "http://127.0.0.1:9000/"
            reply_timeout_ms = 500

            [endpoints]
            upload = "/upload"
            "#,
        )
        .unwrap();
        assert_eq!(config.reply_timeout(), Duration::from_millis(500));
        assert_eq!(config.upload_url(), "http://127.0.0.1:9000/upload");
        assert_eq!(config.list_url(), "http://127.0.0.1:9000/api/v1/list");
    }

    #[test]
    fn bridged_reply_budget_covers_bridge_and_fetch() {
        let config = RelayConfig::default();
        assert_eq!(config.reply_budget(false), Duration::from_secs(30));
        assert_eq!(config.reply_budget(true), Duration::from_millis(60_250));

        let generous = RelayConfig {
            reply_timeout_ms: 120_000,
            ..RelayConfig::default()
        };
        assert_eq!(generous.reply_budget(true), Duration::from_secs(120));
    }

    #[test]
    fn delete_url_encodes_id() {
        let config = RelayConfig::default();
        assert_eq!(
            config.delete_url("a b/c"),
            "https://api.nodeimage.com/api/v1/delete/a%20b%2Fc"
        );
    }

    #[test]
    fn images_url_carries_paging_params() {
        let config = RelayConfig::default();
        assert_eq!(
            config.images_url(2, 10, 99),
            "https://api.nodeimage.com/api/images?page=2&limit=10&_t=99"
        );
    }

    #[test]
    fn fixed_headers_follow_site_origin() {
        let config = RelayConfig {
            site_origin: "https://site.example/".into(),
            ..Default::default()
        };
        assert_eq!(
            config.fixed_headers(),
            vec![
                ("Origin".to_string(), "https://site.example".to_string()),
                ("Referer".to_string(), "https://site.example/".to_string()),
            ]
        );
    }

    #[test]
    fn rejects_wrong_types() {
        assert!(matches!(
            RelayConfig::from_toml_str("batch_concurrency = \"two\""),
            Err(ConfigError::Parse(_))
        ));
    }
}

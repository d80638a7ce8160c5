//! Image-host operations on top of the relay.
//!
//! # Design
//! `ImageHost` talks to the upstream API only through a `RelayClient`, and
//! keeps its credential in an explicit `Session`. Two auth modes exist:
//! - API-key mode sends `X-API-Key` and omits cookies.
//! - Cookie mode sends no key and includes the site's cookies.
//!
//! Mutating calls try API-key mode first and fall back to cookie mode
//! exactly once. A failure whose message looks like an auth rejection clears
//! the cached key first, so a bad key is never replayed. Listing prefers the
//! API-key endpoint and falls back to the cookie-authenticated paged one.

use std::sync::{Arc, LazyLock};

use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::batch::{self, BatchReport};
use crate::client::{now_millis, FileBlob, Form, Request, RelayClient};
use crate::config::RelayConfig;
use crate::descriptor::HttpMethod;
use crate::error::ApiError;
use crate::filetype;
use crate::session::Session;

const AUTH_FAILURE_PATTERN: &str = r"(?i)unauthorized|invalid api key|未授权|无效";

static AUTH_FAILURE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(AUTH_FAILURE_PATTERN).expect("auth failure pattern is a valid regex"));

/// Whether an upstream error message means the credential was rejected.
pub fn is_auth_failure(message: &str) -> bool {
    AUTH_FAILURE.is_match(message)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    ApiKey,
    Cookie,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Links {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown: Option<String>,
}

impl Links {
    fn for_url(url: &str) -> Self {
        Links {
            direct: Some(url.to_string()),
            markdown: Some(format!("![]({url})")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default, alias = "imageId", skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Links>,
}

impl UploadResult {
    pub fn direct_url(&self) -> Option<&str> {
        self.links
            .as_ref()
            .and_then(|l| l.direct.as_deref())
            .or(self.url.as_deref())
    }

    /// Markdown to insert into the editor.
    pub fn markdown(&self) -> Option<String> {
        if let Some(md) = self.links.as_ref().and_then(|l| l.markdown.clone()) {
            return Some(md);
        }
        self.direct_url().map(|url| format!("![]({url})"))
    }
}

/// One stored image, whichever listing endpoint it came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    #[serde(default, alias = "imageId", alias = "id")]
    pub image_id: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Links>,
    #[serde(default, alias = "uploadTime", skip_serializing_if = "Option::is_none")]
    pub upload_time: Option<String>,
    #[serde(default, alias = "mime", skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
}

impl ImageRecord {
    fn with_links(mut self) -> Self {
        if self.links.is_none() {
            self.links = self.url.as_deref().map(Links::for_url);
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub current_page: usize,
    pub total_pages: usize,
    pub total_count: usize,
    pub has_next_page: bool,
    pub has_prev_page: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub images: Vec<ImageRecord>,
    pub pagination: Pagination,
}

impl Page {
    pub fn empty() -> Self {
        Page {
            images: Vec::new(),
            pagination: Pagination {
                current_page: 1,
                total_pages: 1,
                total_count: 0,
                has_next_page: false,
                has_prev_page: false,
            },
        }
    }
}

/// Pagination block as the cookie endpoint sends it; any field may be absent.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPagination {
    current_page: Option<usize>,
    total_pages: Option<usize>,
    total_count: Option<usize>,
    has_next_page: Option<bool>,
    has_prev_page: Option<bool>,
}

pub struct ImageHost {
    relay: RelayClient,
    config: Arc<RelayConfig>,
    session: Arc<Session>,
}

impl ImageHost {
    pub fn new(relay: RelayClient, config: Arc<RelayConfig>, session: Arc<Session>) -> Self {
        Self {
            relay,
            config,
            session,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Fetch a fresh API key using the site's login cookies.
    ///
    /// `Ok(false)` means the server did not hand out a key (not logged in).
    pub async fn refresh_api_key(&self) -> Result<bool, ApiError> {
        match self
            .call(HttpMethod::Get, self.config.api_key_url(), None, AuthMode::Cookie)
            .await
        {
            Ok(body) => match body.get("api_key").and_then(Value::as_str) {
                Some(key) if !key.trim().is_empty() => {
                    self.session.set_api_key(key);
                    info!("API key refreshed");
                    Ok(true)
                }
                _ => Ok(false),
            },
            Err(ApiError::Relay(e)) => Err(ApiError::Relay(e)),
            Err(e) => {
                debug!("API key refresh refused: {e}");
                Ok(false)
            }
        }
    }

    /// Make sure a key is cached, refreshing when missing or when `force`d.
    pub async fn ensure_api_key(&self, force: bool) -> Result<bool, ApiError> {
        if self.session.has_api_key() && !force {
            return Ok(true);
        }
        self.refresh_api_key().await
    }

    /// Upload one image.
    ///
    /// The real format is sniffed from the bytes and the name and MIME
    /// type are corrected to match before upload.
    pub async fn upload(&self, file: FileBlob) -> Result<UploadResult, ApiError> {
        let kind = filetype::detect(&file.bytes).ok_or(ApiError::UnsupportedImage)?;
        if file.len() > self.config.max_file_size {
            return Err(ApiError::TooLarge {
                size: file.len(),
                limit: self.config.max_file_size,
            });
        }
        let stem = if file.name.is_empty() { "image" } else { file.name.as_str() };
        let file = FileBlob {
            name: filetype::normalize_name(stem, kind.ext),
            mime: kind.mime.to_string(),
            ..file
        };
        let form = Form::new().file("image", file);

        let err = match self.try_upload(form.clone(), AuthMode::ApiKey).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };
        self.forget_key_on_auth_failure(&err);
        match self.try_upload(form, AuthMode::Cookie).await {
            Ok(result) => {
                info!("upload succeeded via cookie fallback");
                Ok(result)
            }
            Err(fallback) => {
                debug!("cookie fallback failed too: {fallback}");
                Err(err)
            }
        }
    }

    async fn try_upload(&self, form: Form, mode: AuthMode) -> Result<UploadResult, ApiError> {
        let body = self
            .call(HttpMethod::Post, self.config.upload_url(), Some(form), mode)
            .await?;
        let result: UploadResult =
            serde_json::from_value(body.clone()).map_err(|e| ApiError::Deserialization(e.to_string()))?;
        if result.success || result.links.is_some() {
            Ok(result)
        } else {
            Err(ApiError::Rejected(
                error_message(&body).unwrap_or_else(|| "upload failed".into()),
            ))
        }
    }

    /// All images of the account (API-key mode).
    pub async fn list(&self) -> Result<Vec<ImageRecord>, ApiError> {
        let body = self
            .call(HttpMethod::Get, self.config.list_url(), None, AuthMode::ApiKey)
            .await?;
        match body.get("images") {
            Some(images) => {
                let records: Vec<ImageRecord> = serde_json::from_value(images.clone())
                    .map_err(|e| ApiError::Deserialization(e.to_string()))?;
                Ok(records.into_iter().map(ImageRecord::with_links).collect())
            }
            None => Ok(Vec::new()),
        }
    }

    pub async fn delete(&self, id: &str) -> Result<(), ApiError> {
        let url = self.config.delete_url(id);
        let err = match self.try_delete(&url, AuthMode::ApiKey).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        self.forget_key_on_auth_failure(&err);
        match self.try_delete(&url, AuthMode::Cookie).await {
            Ok(()) => Ok(()),
            Err(fallback) => {
                debug!("cookie fallback for delete {id} failed too: {fallback}");
                Err(err)
            }
        }
    }

    async fn try_delete(&self, url: &str, mode: AuthMode) -> Result<(), ApiError> {
        let body = self
            .call(HttpMethod::Delete, url.to_string(), None, mode)
            .await?;
        if body.get("success").and_then(Value::as_bool) == Some(true) {
            return Ok(());
        }
        Err(ApiError::Rejected(
            error_message(&body).unwrap_or_else(|| "delete failed".into()),
        ))
    }

    /// One page of images.
    ///
    /// With a cached key, the full API-key listing is paginated locally.
    /// Otherwise (or if that fails) the cookie-authenticated paged endpoint
    /// is used. When both fail the result is an empty page, never an error.
    pub async fn list_page(&self, page: usize, limit: usize) -> Page {
        let limit = limit.max(1);
        if self.session.has_api_key() {
            match self.list().await {
                Ok(all) => return paginate(all, page, limit),
                Err(e) => debug!("API-key listing failed, trying cookie paging: {e}"),
            }
        }
        match self.list_page_via_cookie(page, limit).await {
            Ok(page) => page,
            Err(e) => {
                warn!("listing images failed: {e}");
                Page::empty()
            }
        }
    }

    async fn list_page_via_cookie(&self, page: usize, limit: usize) -> Result<Page, ApiError> {
        let url = self.config.images_url(page, limit, u128::from(now_millis()));
        let body = self.call(HttpMethod::Get, url, None, AuthMode::Cookie).await?;
        let images = body
            .get("images")
            .filter(|v| v.is_array())
            .ok_or_else(|| ApiError::Deserialization("bad format".into()))?;
        let images: Vec<ImageRecord> = serde_json::from_value::<Vec<ImageRecord>>(images.clone())
            .map_err(|e| ApiError::Deserialization(e.to_string()))?
            .into_iter()
            .map(ImageRecord::with_links)
            .collect();
        let raw: RawPagination = body
            .get("pagination")
            .and_then(|p| serde_json::from_value(p.clone()).ok())
            .unwrap_or_default();

        let total_count = raw.total_count.unwrap_or(images.len());
        let total_pages = raw.total_pages.unwrap_or_else(|| pages_for(total_count, limit));
        let current_page = raw.current_page.filter(|p| *p > 0).unwrap_or(page.max(1));
        Ok(Page {
            images,
            pagination: Pagination {
                current_page,
                total_pages,
                total_count,
                has_next_page: raw.has_next_page.unwrap_or(current_page < total_pages),
                has_prev_page: raw.has_prev_page.unwrap_or(current_page > 1),
            },
        })
    }

    /// Upload several files with bounded concurrency.
    pub async fn upload_batch(&self, files: Vec<FileBlob>) -> BatchReport<UploadResult> {
        batch::run_bounded(files, self.config.batch_concurrency, |file| self.upload(file)).await
    }

    /// Delete several images with bounded concurrency.
    pub async fn delete_batch(&self, ids: Vec<String>) -> BatchReport<String> {
        batch::run_bounded(ids, self.config.batch_concurrency, |id| async move {
            self.delete(&id).await.map(|()| id)
        })
        .await
    }

    fn forget_key_on_auth_failure(&self, err: &ApiError) {
        if is_auth_failure(&err.message()) {
            warn!("credential rejected: {err}");
            self.session.clear();
        }
    }

    /// Relay one JSON request and insist on a 2xx JSON answer.
    async fn call(
        &self,
        method: HttpMethod,
        url: String,
        form: Option<Form>,
        mode: AuthMode,
    ) -> Result<Value, ApiError> {
        let mut request = Request::new(method, url)
            .header("Accept", "application/json")
            .with_credentials(mode == AuthMode::Cookie);
        if mode == AuthMode::ApiKey {
            if let Some(key) = self.session.api_key() {
                request = request.header("X-API-Key", key);
            }
        }
        if let Some(form) = form {
            request = request.form(form);
        }

        let reply = self.relay.request(request).await?;
        let body = reply.json();
        if reply.is_success() {
            if let Some(body) = body {
                return Ok(body);
            }
        }

        let message = body
            .as_ref()
            .and_then(error_message)
            .or_else(|| (!reply.response_text.is_empty()).then(|| reply.response_text.clone()))
            .unwrap_or_else(|| reply.status_text.clone());
        match reply.status {
            401 | 403 => Err(ApiError::Unauthorized(message)),
            status => Err(ApiError::Http { status, message }),
        }
    }
}

fn error_message(body: &Value) -> Option<String> {
    body.get("error")
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn pages_for(total: usize, limit: usize) -> usize {
    total.div_ceil(limit.max(1)).max(1)
}

/// Slice `all` into the requested page, clamping the page into range.
fn paginate(all: Vec<ImageRecord>, page: usize, limit: usize) -> Page {
    let total_count = all.len();
    let total_pages = pages_for(total_count, limit);
    let current_page = page.clamp(1, total_pages);
    let images = all
        .into_iter()
        .skip((current_page - 1) * limit)
        .take(limit)
        .collect();
    Page {
        images,
        pagination: Pagination {
            current_page,
            total_pages,
            total_count,
            has_next_page: current_page < total_pages,
            has_prev_page: current_page > 1,
        },
    }
}

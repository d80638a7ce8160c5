//! In-memory stand-in for the upstream image host.
//!
//! Serves the same routes the extension talks to, with the same two auth
//! schemes: an `X-API-Key` header, or the site's session cookie. Every
//! multipart upload is recorded so tests can check what actually reached
//! the wire.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct MockConfig {
    pub api_key: String,
    pub cookie_name: String,
    pub cookie_value: String,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            api_key: "test-api-key".to_string(),
            cookie_name: "session".to_string(),
            cookie_value: "logged-in".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StoredImage {
    pub id: String,
    pub filename: String,
    pub mime: String,
    pub size: usize,
    pub upload_time: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

/// One multipart field as the server received it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeenField {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub len: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Auth {
    ApiKey,
    Cookie,
}

#[derive(Clone, Default)]
pub struct MockState {
    config: Arc<MockConfig>,
    images: Arc<RwLock<Vec<StoredImage>>>,
    uploads: Arc<RwLock<Vec<Vec<SeenField>>>>,
}

impl MockState {
    pub fn new(config: MockConfig) -> Self {
        Self {
            config: Arc::new(config),
            ..Self::default()
        }
    }

    pub fn config(&self) -> &MockConfig {
        &self.config
    }

    pub async fn images(&self) -> Vec<StoredImage> {
        self.images.read().await.clone()
    }

    /// Fields of every multipart upload received so far, in arrival order.
    pub async fn uploads(&self) -> Vec<Vec<SeenField>> {
        self.uploads.read().await.clone()
    }

    /// Store an image directly, bypassing auth.
    pub async fn seed(&self, filename: &str, mime: &str, bytes: &[u8]) -> String {
        let image = StoredImage {
            id: Uuid::new_v4().simple().to_string(),
            filename: filename.to_string(),
            mime: mime.to_string(),
            size: bytes.len(),
            upload_time: now_millis().to_string(),
            bytes: bytes.to_vec(),
        };
        let id = image.id.clone();
        self.images.write().await.push(image);
        id
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<Auth, Response> {
        if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
            return if key == self.config.api_key {
                Ok(Auth::ApiKey)
            } else {
                Err(failure(StatusCode::UNAUTHORIZED, "Invalid API key"))
            };
        }
        if self.has_session_cookie(headers) {
            return Ok(Auth::Cookie);
        }
        Err(failure(StatusCode::UNAUTHORIZED, "unauthorized"))
    }

    fn has_session_cookie(&self, headers: &HeaderMap) -> bool {
        let wanted = format!("{}={}", self.config.cookie_name, self.config.cookie_value);
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .any(|pair| pair.trim() == wanted)
    }
}

pub fn app(config: MockConfig) -> Router {
    router(MockState::new(config))
}

pub fn router(state: MockState) -> Router {
    Router::new()
        .route("/api/upload", post(upload))
        .route("/api/user/api-key", get(api_key))
        .route("/api/v1/list", get(list))
        .route("/api/v1/delete/{id}", delete(delete_image))
        .route("/api/images", get(images_page))
        .route("/files/{id}", get(file))
        .with_state(state)
}

pub async fn run(listener: TcpListener, state: MockState) -> Result<(), std::io::Error> {
    axum::serve(listener, router(state)).await
}

fn failure(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({ "success": false, "error": error }))).into_response()
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

fn base_url(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}")
}

fn links(base: &str, image: &StoredImage) -> Value {
    let direct = format!("{base}/files/{}", image.id);
    json!({ "direct": direct, "markdown": format!("![{}]({direct})", image.filename) })
}

async fn upload(State(state): State<MockState>, headers: HeaderMap, mut multipart: Multipart) -> Response {
    let via = match state.authenticate(&headers) {
        Ok(via) => via,
        Err(resp) => return resp,
    };

    let mut seen = Vec::new();
    let mut image = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return failure(StatusCode::BAD_REQUEST, &e.body_text()),
        };
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return failure(StatusCode::BAD_REQUEST, &e.body_text()),
        };
        seen.push(SeenField {
            name: name.clone(),
            file_name: file_name.clone(),
            content_type: content_type.clone(),
            len: bytes.len(),
        });
        if image.is_none() && (name == "image" || name == "file") {
            image = Some((file_name, content_type, bytes));
        }
    }
    state.uploads.write().await.push(seen);

    let Some((file_name, content_type, bytes)) = image else {
        return failure(StatusCode::BAD_REQUEST, "no image field");
    };
    let stored = StoredImage {
        id: Uuid::new_v4().simple().to_string(),
        filename: file_name.unwrap_or_else(|| "blob".to_string()),
        mime: content_type.unwrap_or_else(|| "application/octet-stream".to_string()),
        size: bytes.len(),
        upload_time: now_millis().to_string(),
        bytes: bytes.to_vec(),
    };
    info!("stored {} ({} bytes) via {via:?}", stored.id, stored.size);
    let body = json!({
        "success": true,
        "image_id": stored.id,
        "links": links(&base_url(&headers), &stored),
    });
    state.images.write().await.push(stored);
    Json(body).into_response()
}

async fn api_key(State(state): State<MockState>, headers: HeaderMap) -> Response {
    if !state.has_session_cookie(&headers) {
        return failure(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    Json(json!({ "api_key": state.config.api_key })).into_response()
}

async fn list(State(state): State<MockState>, headers: HeaderMap) -> Response {
    match state.authenticate(&headers) {
        Ok(Auth::ApiKey) => {}
        Ok(Auth::Cookie) => return failure(StatusCode::UNAUTHORIZED, "API key required"),
        Err(resp) => return resp,
    }
    let base = base_url(&headers);
    let images: Vec<Value> = state
        .images
        .read()
        .await
        .iter()
        .rev()
        .map(|image| {
            json!({
                "image_id": image.id,
                "filename": image.filename,
                "size": image.size,
                "mimetype": image.mime,
                "upload_time": image.upload_time,
                "links": links(&base, image),
            })
        })
        .collect();
    Json(json!({ "success": true, "images": images })).into_response()
}

async fn delete_image(State(state): State<MockState>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    if let Err(resp) = state.authenticate(&headers) {
        return resp;
    }
    let mut images = state.images.write().await;
    match images.iter().position(|image| image.id == id) {
        Some(index) => {
            images.remove(index);
            debug!("deleted {id}");
            Json(json!({ "success": true })).into_response()
        }
        None => failure(StatusCode::NOT_FOUND, "image not found"),
    }
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<usize>,
    limit: Option<usize>,
}

async fn images_page(State(state): State<MockState>, headers: HeaderMap, Query(query): Query<PageQuery>) -> Response {
    if !state.has_session_cookie(&headers) {
        return failure(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    let limit = query.limit.unwrap_or(10).max(1);
    let images = state.images.read().await;
    let total_count = images.len();
    let total_pages = total_count.div_ceil(limit).max(1);
    let current_page = query.page.unwrap_or(1).clamp(1, total_pages);

    let base = base_url(&headers);
    let page: Vec<Value> = images
        .iter()
        .rev()
        .skip((current_page - 1) * limit)
        .take(limit)
        .map(|image| {
            json!({
                "id": image.id,
                "filename": image.filename,
                "size": image.size,
                "mime": image.mime,
                "uploadTime": image.upload_time,
                "url": format!("{base}/files/{}", image.id),
            })
        })
        .collect();
    Json(json!({
        "images": page,
        "pagination": {
            "currentPage": current_page,
            "totalPages": total_pages,
            "totalCount": total_count,
            "hasNextPage": current_page < total_pages,
            "hasPrevPage": current_page > 1,
        }
    }))
    .into_response()
}

async fn file(State(state): State<MockState>, Path(id): Path<String>) -> Response {
    let images = state.images.read().await;
    match images.iter().find(|image| image.id == id) {
        Some(image) => ([(header::CONTENT_TYPE, image.mime.clone())], image.bytes.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

//! End-to-end behaviour of the relay: client → channel → endpoint → executor.
//!
//! # Design
//! Every test starts a real `Relay` on the test runtime and swaps the
//! network for a `ScriptedFetcher`, so what reached the "wire" can be
//! asserted exactly. Anything that could hang is wrapped in a timeout.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{config, init_logging, json_response, text_response, PanickingFetcher, ScriptedFetcher, PNG};
use imgrelay_core::fetch::{Credentials, MultipartField, OutboundBody};
use async_trait::async_trait;
use imgrelay_core::message::Message;
use imgrelay_core::tabs::TabId;
use imgrelay_core::{
    BridgeTabs, FileBlob, Form, PanelHost, Relay, RelayConfig, RelayEndpoint, RelayError,
    Request, RequestDescriptor, ResponseEnvelope, SiteTabs,
};
use serde_json::json;
use tokio::sync::oneshot;

const BOUND: Duration = Duration::from_secs(5);

fn start(config: RelayConfig, fetcher: Arc<ScriptedFetcher>) -> Relay {
    Relay::builder(Arc::new(config), fetcher).start()
}

// --- request path ---

#[tokio::test]
async fn upload_form_is_rebuilt_as_one_image_part() {
    init_logging();
    let fetcher = Arc::new(ScriptedFetcher::json(json!({"success": true, "image_id": "abc"})));
    let relay = start(config(), Arc::clone(&fetcher));

    let form = Form::new().file("image", FileBlob::new("cat.png", "image/png", PNG));
    let reply = relay
        .client()
        .request(
            Request::post("https://api.test/api/upload")
                .header("X-API-Key", "k")
                .form(form),
        )
        .await
        .unwrap();

    assert_eq!(reply.status, 200);
    assert_eq!(reply.response.as_ref().unwrap()["success"], true);

    let requests = fetcher.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.header("x-api-key"), Some("k"));
    assert_eq!(request.header("origin"), Some("https://www.site.test"));
    assert_eq!(request.header("referer"), Some("https://www.site.test/"));
    assert_eq!(request.credentials, Credentials::Omit);
    match &request.body {
        OutboundBody::Multipart(fields) => {
            assert_eq!(fields.len(), 1);
            match &fields[0] {
                MultipartField::File {
                    key,
                    file_name,
                    mime,
                    bytes,
                    ..
                } => {
                    assert_eq!(key, "image");
                    assert_eq!(file_name, "cat.png");
                    assert_eq!(mime, "image/png");
                    assert_eq!(&bytes[..], PNG);
                }
                other => panic!("expected a file part, got {other:?}"),
            }
        }
        other => panic!("expected multipart, got {other:?}"),
    }
    relay.shutdown().await;
}

#[tokio::test]
async fn binary_body_arrives_byte_for_byte() {
    let fetcher = Arc::new(ScriptedFetcher::json(json!({})));
    let relay = start(config(), Arc::clone(&fetcher));

    relay
        .client()
        .request(Request::post("https://api.test/blob").bytes(PNG))
        .await
        .unwrap();

    assert_eq!(fetcher.requests()[0].body, OutboundBody::Binary(bytes::Bytes::from_static(PNG)));
}

#[tokio::test]
async fn caller_origin_header_is_overridden() {
    let fetcher = Arc::new(ScriptedFetcher::json(json!({})));
    let relay = start(config(), Arc::clone(&fetcher));

    relay
        .client()
        .request(Request::get("https://api.test/x").header("origin", "https://evil.test"))
        .await
        .unwrap();

    let request = &fetcher.requests()[0];
    let origins: Vec<_> = request
        .headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("origin"))
        .collect();
    assert_eq!(origins.len(), 1);
    assert_eq!(origins[0].1, "https://www.site.test");
}

#[tokio::test]
async fn empty_url_is_refused_before_any_fetch() {
    let fetcher = Arc::new(ScriptedFetcher::json(json!({})));
    let relay = start(config(), Arc::clone(&fetcher));

    let err = relay.client().request(Request::get("  ")).await.unwrap_err();
    assert!(matches!(err, RelayError::MissingUrl));
    assert_eq!(err.to_string(), "no url");

    let endpoint = RelayEndpoint::new(Arc::new(config()), fetcher.clone());
    let envelope = endpoint.relay(Request::get("").into_descriptor()).await;
    assert_eq!(envelope, ResponseEnvelope::failure("no url"));
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn invalid_json_is_returned_as_text() {
    let fetcher = Arc::new(ScriptedFetcher::new(|_| {
        Ok(text_response(200, "application/json", "<html>oops</html>"))
    }));
    let relay = start(config(), fetcher);

    let reply = relay.client().request(Request::get("https://api.test/x")).await.unwrap();
    assert_eq!(reply.status, 200);
    assert_eq!(reply.response, None);
    assert_eq!(reply.response_text, "<html>oops</html>");
}

#[tokio::test]
async fn non_2xx_is_still_a_success_envelope() {
    let fetcher = Arc::new(ScriptedFetcher::new(|_| {
        Ok(json_response(401, &json!({"error": "unauthorized"})))
    }));
    let relay = start(config(), fetcher);

    let reply = relay.client().request(Request::get("https://api.test/x")).await.unwrap();
    assert_eq!(reply.status, 401);
    assert_eq!(reply.status_text, "Unauthorized");
    assert!(!reply.is_success());
}

#[tokio::test]
async fn network_error_becomes_failure() {
    let fetcher = Arc::new(ScriptedFetcher::new(|_| Err(RelayError::Network("connection refused".into()))));
    let relay = start(config(), fetcher);

    let err = relay.client().request(Request::get("https://api.test/x")).await.unwrap_err();
    match err {
        RelayError::Remote(message) => assert!(message.contains("connection refused"), "{message}"),
        other => panic!("expected a remote failure, got {other:?}"),
    }
}

#[tokio::test]
async fn panicking_executor_still_answers() {
    let relay = Relay::start(Arc::new(config()), Arc::new(PanickingFetcher));

    let (tx, rx) = oneshot::channel();
    relay.client().request_with(
        Request::get("https://api.test/x"),
        |_| panic!("success callback must not run"),
        move |e| {
            let _ = tx.send(e);
        },
    );
    let err = tokio::time::timeout(BOUND, rx).await.unwrap().unwrap();
    match err {
        RelayError::Remote(message) => assert!(message.contains("executor exploded"), "{message}"),
        other => panic!("expected a remote failure, got {other:?}"),
    }
}

#[tokio::test]
async fn slow_executor_times_out_into_failure() {
    let fetcher = Arc::new(
        ScriptedFetcher::json(json!({})).with_delay(|_| Duration::from_secs(30)),
    );
    let config = RelayConfig {
        fetch_timeout_ms: 50,
        ..config()
    };
    let relay = start(config, fetcher);

    let result = tokio::time::timeout(BOUND, relay.client().request(Request::get("https://api.test/x")))
        .await
        .unwrap();
    assert!(matches!(result, Err(RelayError::Remote(_))));
}

#[tokio::test]
async fn concurrent_requests_complete_out_of_order() {
    let fetcher = Arc::new(
        ScriptedFetcher::new(|request| Ok(json_response(200, &json!({"url": request.url}))))
            .with_delay(|request| {
                if request.url.ends_with("/slow") {
                    Duration::from_millis(300)
                } else {
                    Duration::ZERO
                }
            }),
    );
    let relay = start(config(), fetcher);
    let client = relay.client();

    let finished = Arc::new(AtomicUsize::new(0));
    let order = |finished: Arc<AtomicUsize>, url: &'static str| {
        let client = client.clone();
        tokio::spawn(async move {
            let reply = client.request(Request::get(url)).await.unwrap();
            (finished.fetch_add(1, Ordering::SeqCst), reply)
        })
    };
    let slow = order(Arc::clone(&finished), "https://api.test/slow");
    tokio::time::sleep(Duration::from_millis(20)).await;
    let fast = order(Arc::clone(&finished), "https://api.test/fast");

    let (fast_rank, fast_reply) = fast.await.unwrap();
    let (slow_rank, slow_reply) = slow.await.unwrap();
    assert_eq!(fast_rank, 0);
    assert_eq!(slow_rank, 1);
    assert_eq!(fast_reply.response.unwrap()["url"], "https://api.test/fast");
    assert_eq!(slow_reply.response.unwrap()["url"], "https://api.test/slow");
}

#[tokio::test]
async fn request_with_runs_success_callback_once() {
    let fetcher = Arc::new(ScriptedFetcher::json(json!({"ok": 1})));
    let relay = start(config(), fetcher);

    let (tx, rx) = oneshot::channel();
    let handle = relay.client().request_with(
        Request::get("https://api.test/x"),
        move |reply| {
            let _ = tx.send(reply.status);
        },
        |e| panic!("failure callback must not run: {e}"),
    );
    handle.await.unwrap();
    assert_eq!(rx.await.unwrap(), 200);
}

// --- companion tabs ---

#[tokio::test]
async fn credentialed_request_runs_in_a_temporary_site_tab() {
    let page = Arc::new(ScriptedFetcher::json(json!({"via": "page"})));
    let direct = Arc::new(ScriptedFetcher::json(json!({"via": "direct"})));
    let config = Arc::new(config());
    let tabs = Arc::new(BridgeTabs::with_fetcher(&config, page.clone()));
    let relay = Relay::builder(Arc::clone(&config), direct.clone())
        .with_tabs(tabs.clone())
        .start();

    let reply = relay
        .client()
        .request(Request::get("https://api.test/me").with_credentials(true))
        .await
        .unwrap();
    assert_eq!(reply.response.unwrap()["via"], "page");
    assert_eq!(direct.calls(), 0);

    let request = &page.requests()[0];
    assert_eq!(request.credentials, Credentials::Include);
    assert_eq!(request.header("origin"), Some("https://www.site.test"));
    assert_eq!(tabs.open_count(), 0);
}

#[tokio::test]
async fn existing_site_tab_is_reused_and_kept() {
    let page = Arc::new(ScriptedFetcher::json(json!({})));
    let config = Arc::new(config());
    let tabs = Arc::new(BridgeTabs::with_fetcher(&config, page.clone()));
    let tab = tabs.open(&config.site_origin).await.unwrap();
    let relay = Relay::builder(Arc::clone(&config), Arc::new(ScriptedFetcher::json(json!({}))))
        .with_tabs(tabs.clone())
        .start();

    for _ in 0..2 {
        relay
            .client()
            .request(Request::get("https://api.test/me").with_credentials(true))
            .await
            .unwrap();
    }
    assert_eq!(page.calls(), 2);
    assert_eq!(tabs.find(&config.site_origin).await, Some(tab));
}

#[tokio::test]
async fn failed_site_tab_falls_back_to_direct_fetch() {
    let page = Arc::new(ScriptedFetcher::new(|_| Err(RelayError::Network("page offline".into()))));
    let direct = Arc::new(ScriptedFetcher::json(json!({"via": "direct"})));
    let config = Arc::new(config());
    let tabs = Arc::new(BridgeTabs::with_fetcher(&config, page));
    let relay = Relay::builder(Arc::clone(&config), direct.clone())
        .with_tabs(tabs.clone())
        .start();

    let reply = relay
        .client()
        .request(Request::get("https://api.test/me").with_credentials(true))
        .await
        .unwrap();
    assert_eq!(reply.response.unwrap()["via"], "direct");
    assert_eq!(direct.requests()[0].credentials, Credentials::Include);
    assert_eq!(tabs.open_count(), 0);
}

#[tokio::test]
async fn hung_site_tab_still_reaches_direct_fetch_in_time() {
    let page = Arc::new(ScriptedFetcher::json(json!({"via": "page"})).with_delay(|_| Duration::from_secs(10)));
    let direct = Arc::new(ScriptedFetcher::json(json!({"via": "direct"})));
    // Every budget equal: the caller must still outlast bridge plus fetch.
    let config = Arc::new(RelayConfig {
        reply_timeout_ms: 300,
        fetch_timeout_ms: 300,
        bridge_timeout_ms: 300,
        ..config()
    });
    let tabs = Arc::new(BridgeTabs::with_fetcher(&config, page));
    let relay = Relay::builder(Arc::clone(&config), direct.clone())
        .with_tabs(tabs.clone())
        .start();

    let result = tokio::time::timeout(
        BOUND,
        relay
            .client()
            .request(Request::get("https://api.test/me").with_credentials(true)),
    )
    .await
    .unwrap();
    let reply = result.unwrap();
    assert_eq!(reply.response.unwrap()["via"], "direct");
    assert_eq!(direct.calls(), 1);
    assert_eq!(tabs.open_count(), 0);
}

/// Tabs whose page crashes on every fetch.
#[derive(Default)]
struct CrashingTabs {
    closed: AtomicUsize,
}

#[async_trait]
impl SiteTabs for CrashingTabs {
    async fn find(&self, _origin: &str) -> Option<TabId> {
        None
    }

    async fn open(&self, _origin: &str) -> Result<TabId, RelayError> {
        Ok(TabId(7))
    }

    async fn close(&self, _tab: TabId) -> Result<(), RelayError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn site_fetch(&self, _tab: TabId, _opts: RequestDescriptor) -> Result<ResponseEnvelope, RelayError> {
        panic!("page script crashed")
    }
}

#[tokio::test]
async fn panicking_site_tab_falls_back_to_direct_fetch() {
    let direct = Arc::new(ScriptedFetcher::json(json!({"via": "direct"})));
    let tabs = Arc::new(CrashingTabs::default());
    let relay = Relay::builder(Arc::new(config()), direct.clone())
        .with_tabs(tabs.clone())
        .start();

    let reply = relay
        .client()
        .request(Request::get("https://api.test/me").with_credentials(true))
        .await
        .unwrap();
    assert_eq!(reply.response.unwrap()["via"], "direct");
    assert_eq!(direct.calls(), 1);
    assert_eq!(tabs.closed.load(Ordering::SeqCst), 1);
}

// --- panel and downloads ---

struct Panel(AtomicUsize);

impl PanelHost for Panel {
    fn open_panel(&self) -> Result<(), RelayError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct BrokenPanel;

impl PanelHost for BrokenPanel {
    fn open_panel(&self) -> Result<(), RelayError> {
        panic!("panel script crashed")
    }
}

#[tokio::test]
async fn open_panel_reports_missing_host() {
    let relay = start(config(), Arc::new(ScriptedFetcher::json(json!({}))));
    let reply = relay.client().open_panel().await.unwrap();
    assert!(!reply.ok);
    assert_eq!(reply.error.as_deref(), Some("panel not ready"));
}

#[tokio::test]
async fn open_panel_reaches_the_host() {
    let panel = Arc::new(Panel(AtomicUsize::new(0)));
    let relay = Relay::builder(Arc::new(config()), Arc::new(ScriptedFetcher::json(json!({}))))
        .with_panel(panel.clone())
        .start();

    let reply = relay.client().open_panel().await.unwrap();
    assert!(reply.ok);
    assert_eq!(reply.error, None);
    assert_eq!(panel.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn panicking_panel_is_reported_not_propagated() {
    let relay = Relay::builder(Arc::new(config()), Arc::new(ScriptedFetcher::json(json!({}))))
        .with_panel(Arc::new(BrokenPanel))
        .start();

    let reply = relay.client().open_panel().await.unwrap();
    assert!(!reply.ok);
    assert!(reply.error.unwrap().contains("panel script crashed"));
}

#[tokio::test]
async fn save_image_writes_into_download_dir() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new(|_| {
        Ok(imgrelay_core::fetch::FetchedResponse {
            status: 200,
            status_text: "OK".into(),
            headers: vec![("content-type".into(), "image/png".into())],
            body: bytes::Bytes::from_static(PNG),
        })
    }));
    let config = RelayConfig {
        download_dir: dir.path().join("saved"),
        ..config()
    };
    let relay = start(config, fetcher.clone());
    let client = relay.client();

    let first = client.save_image("https://img.test/files/cat.png?x=1").await.unwrap();
    assert!(first.ok, "{:?}", first.error);
    assert_eq!(first.filename.as_deref(), Some("cat.png"));
    assert_eq!(std::fs::read(dir.path().join("saved/cat.png")).unwrap(), PNG);

    let second = client.save_image("https://img.test/files/cat.png").await.unwrap();
    assert_eq!(second.filename.as_deref(), Some("cat-1.png"));
    assert_eq!(fetcher.requests()[0].credentials, Credentials::Omit);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_saves_of_one_name_never_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let served = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&served);
    let fetcher = Arc::new(ScriptedFetcher::new(move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        Ok(text_response(200, "image/png", &format!("body-{n}")))
    }));
    let config = RelayConfig {
        download_dir: dir.path().to_path_buf(),
        ..config()
    };
    let relay = start(config, fetcher);
    let client = relay.client();

    for _ in 0..10 {
        let (a, b) = tokio::join!(
            client.save_image("https://img.test/files/cat.png"),
            client.save_image("https://img.test/files/cat.png"),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.ok && b.ok, "{:?} {:?}", a.error, b.error);
        assert_ne!(a.filename, b.filename);
    }

    let mut bodies: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| std::fs::read_to_string(entry.unwrap().path()).unwrap())
        .collect();
    bodies.sort();
    bodies.dedup();
    assert_eq!(bodies.len(), 20);
    assert_eq!(served.load(Ordering::SeqCst), 20);
}

#[tokio::test]
async fn save_image_reports_http_errors() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new(|_| Ok(text_response(404, "text/plain", "gone"))));
    let config = RelayConfig {
        download_dir: dir.path().to_path_buf(),
        ..config()
    };
    let relay = start(config, fetcher);

    let reply = relay.client().save_image("https://img.test/files/x.png").await.unwrap();
    assert!(!reply.ok);
    assert!(reply.error.unwrap().contains("404"));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

// --- lifecycle ---

#[tokio::test]
async fn client_fails_fast_after_shutdown() {
    let relay = start(config(), Arc::new(ScriptedFetcher::json(json!({}))));
    let client = relay.client();
    relay.shutdown().await;

    let result = tokio::time::timeout(BOUND, client.request(Request::get("https://api.test/x")))
        .await
        .unwrap();
    assert!(matches!(result, Err(RelayError::Channel(_))));
}

#[tokio::test]
async fn endpoint_dispatches_every_message_kind() {
    let endpoint = RelayEndpoint::new(Arc::new(config()), Arc::new(ScriptedFetcher::json(json!({}))));
    let relay = endpoint
        .handle(Message::RelayRequest {
            opts: Request::get("https://api.test/x").into_descriptor(),
        })
        .await;
    let panel = endpoint.handle(Message::OpenPanel).await;

    let relay = serde_json::to_value(&relay).unwrap();
    let panel = serde_json::to_value(&panel).unwrap();
    assert_eq!(relay["status"], 200);
    assert_eq!(panel, json!({"ok": false, "error": "panel not ready"}));
}

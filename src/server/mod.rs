// src/server/mod.rs

mod extract;
mod webhooks;

use crate::config::Config;
use crate::error::{ApiError, error_envelope};
use crate::state::{AppState, SharedState};
use axum::Router;
use axum::body::to_bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{StatusCode, header};
use axum::middleware;
use axum::response::Response;
use axum::routing::{delete, get, post};
use std::any::Any;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Build the API router. Bodies over `state.max_body_bytes` are refused
/// with 413.
pub fn router(state: SharedState) -> Router {
    let max_body_bytes = state.max_body_bytes;
    Router::new()
        .route("/api/extract", post(extract::extract_invoice))
        .route("/api/download-csv", post(extract::download_csv))
        .route("/api/download-json", post(extract::download_json))
        .route("/api/health", get(extract::health))
        .route("/api/webhooks", get(webhooks::list).post(webhooks::create))
        .route("/api/webhooks/{id}", delete(webhooks::remove))
        .route("/api/webhooks/{id}/toggle", post(webhooks::toggle))
        .route("/api/webhook-logs", get(webhooks::logs))
        .route("/api/demo-webhook", post(webhooks::demo_webhook))
        .route("/api/get-data", get(webhooks::get_data))
        .route("/api/clear-webhook-data", post(webhooks::clear_data))
        .route("/api/test-webhook-system", get(webhooks::test_system))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::map_response_with_state(
            max_body_bytes,
            json_error_envelope,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let state = Arc::new(AppState::from_config(cfg)?);
    if !state.extractor.is_available() {
        info!("Starting without extraction; other endpoints remain available");
    }
    let app = router(state);

    let listener = TcpListener::bind((cfg.server.host.as_str(), cfg.server.port)).await?;
    info!(addr = %listener.local_addr()?, "Invoice extractor API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

async fn not_found() -> ApiError {
    ApiError::NotFound("Endpoint not found".to_string())
}

fn panic_response(_panic: Box<dyn Any + Send + 'static>) -> Response {
    error!("Handler panicked");
    error_envelope(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

/// Rewrite error responses produced outside our handlers (body limits,
/// extractor rejections, 405s) into the `{"error": ...}` envelope.
async fn json_error_envelope(State(limit): State<usize>, response: Response) -> Response {
    let status = response.status();
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if is_json || !(status.is_client_error() || status.is_server_error()) {
        return response;
    }

    let message = match status {
        StatusCode::PAYLOAD_TOO_LARGE => ApiError::PayloadTooLarge { limit }.to_string(),
        StatusCode::NOT_FOUND => "Endpoint not found".to_string(),
        StatusCode::INTERNAL_SERVER_ERROR => "Internal server error".to_string(),
        _ => {
            let text = to_bytes(response.into_body(), 4096)
                .await
                .map(|b| String::from_utf8_lossy(&b).trim().to_string())
                .unwrap_or_default();
            if text.is_empty() {
                status.canonical_reason().unwrap_or("Request failed").to_string()
            } else {
                text
            }
        }
    };
    error_envelope(status, &message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtractError;
    use crate::llm_extract::{ExtractionClient, ModelBackend};
    use crate::webhooks::{DeliveryLog, DeliveryStatus, Dispatcher, WebhookStore};
    use async_trait::async_trait;
    use axum::body::{Body, Bytes};
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    const LIMIT: usize = 16 * 1024 * 1024;

    /// Answers with prose-wrapped JSON whose `n` counts calls.
    struct CountingBackend {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ModelBackend for CountingBackend {
        async fn generate(&self, _prompt: &str, _image: &[u8], _mime: &str) -> Result<String, ExtractError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!(
                "Here is the data: {{\"totals\": {{\"n\": {n}}}, \"items\": [{{\"rate\": 5}}], \"bank_info\": null}}"
            ))
        }
    }

    struct Harness {
        app: Router,
        state: SharedState,
        calls: Arc<AtomicUsize>,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn upload_dir(&self) -> &Path {
            &self.state.upload_dir
        }

        fn uploads_left(&self) -> usize {
            std::fs::read_dir(self.upload_dir()).unwrap().count()
        }
    }

    fn harness(with_model: bool) -> Harness {
        harness_with_limit(with_model, LIMIT)
    }

    fn harness_with_limit(with_model: bool, limit: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let upload_dir = dir.path().join("uploads");
        std::fs::create_dir_all(&upload_dir).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let backend: Option<Arc<dyn ModelBackend>> = if with_model {
            Some(Arc::new(CountingBackend { calls: Arc::clone(&calls) }))
        } else {
            None
        };

        let state = Arc::new(AppState::new(
            ExtractionClient::new(backend),
            WebhookStore::new(dir.path().join("webhooks.json")),
            Dispatcher::spawn(2, 16, DeliveryLog::new()).unwrap(),
            upload_dir,
            "http://127.0.0.1:5001".to_string(),
        )
        .with_max_body_bytes(limit));
        Harness {
            app: router(Arc::clone(&state)),
            state,
            calls,
            dir,
        }
    }

    const BOUNDARY: &str = "invoiceboundary42";

    fn part_head(field: &str, filename: &str) -> String {
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
    }

    fn part_tail() -> String {
        format!("\r\n--{BOUNDARY}--\r\n")
    }

    fn upload(field: &str, filename: &str, bytes: &[u8]) -> Request<Body> {
        let mut body = part_head(field, filename).into_bytes();
        body.extend_from_slice(bytes);
        body.extend_from_slice(part_tail().as_bytes());

        Request::post("/api/extract")
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .unwrap()
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_extract_returns_data_and_cleans_up() {
        let h = harness(true);
        let (status, body) = send(&h.app, upload("file", "scan.PNG", b"png bytes")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"totals": {"n": 1}, "items": [{"rate": 5}]}));
        assert_eq!(h.uploads_left(), 0);
    }

    #[tokio::test]
    async fn test_get_data_holds_only_latest_extraction() {
        let h = harness(true);
        send(&h.app, upload("file", "a.jpg", b"one")).await;
        let (_, second) = send(&h.app, upload("file", "b.jpg", b"two")).await;

        let (status, body) = send(&h.app, get("/api/get-data")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["data"][0]["data"], second);
        assert_eq!(body["data"][0]["data"]["totals"]["n"], 2);
    }

    #[tokio::test]
    async fn test_upload_validation() {
        let h = harness(true);

        let (status, body) = send(&h.app, upload("file", "invoice.pdf", b"%PDF")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid file type. Please upload an image file.");

        let (status, body) = send(&h.app, upload("attachment", "invoice.png", b"x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No file uploaded");

        let (status, body) = send(&h.app, upload("file", "", b"x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No file selected");

        let (status, _) = send(&h.app, upload("file", "noextension", b"x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert_eq!(h.uploads_left(), 0);
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert!(h.state.received.get().is_none());
    }

    #[tokio::test]
    async fn test_oversize_body_rejected_before_handler() {
        let h = harness(true);
        let body = vec![b'a'; LIMIT + 1];
        let req = Request::post("/api/extract")
            .header(header::CONTENT_TYPE, "multipart/form-data; boundary=x")
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap();

        let (status, body) = send(&h.app, req).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["error"], "File too large. Maximum size is 16MB.");
        assert_eq!(h.uploads_left(), 0);
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_oversize_chunked_upload_is_413() {
        let h = harness(true);
        let chunk = Bytes::from(vec![b'a'; 1024 * 1024]);
        let mut chunks = vec![Bytes::from(part_head("file", "big.png"))];
        chunks.extend(std::iter::repeat_n(chunk, 17));
        chunks.push(Bytes::from(part_tail()));
        let stream = futures_util::stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));

        let req = Request::post("/api/extract")
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from_stream(stream))
            .unwrap();
        assert!(req.headers().get(header::CONTENT_LENGTH).is_none());

        let (status, body) = send(&h.app, req).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["error"], "File too large. Maximum size is 16MB.");
        assert_eq!(h.uploads_left(), 0);
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_too_large_message_follows_configured_limit() {
        let h = harness_with_limit(true, 1024 * 1024);

        let (status, body) = send(&h.app, upload("file", "big.png", &vec![b'a'; 2 * 1024 * 1024])).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["error"], "File too large. Maximum size is 1MB.");

        let padding = "x".repeat(2 * 1024 * 1024);
        let (status, body) = send(
            &h.app,
            json_request("POST", "/api/download-csv", json!({"notes": padding})),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["error"], "File too large. Maximum size is 1MB.");

        let (status, _) = send(&h.app, upload("file", "small.png", b"ok")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_extract_without_model_is_500() {
        let h = harness(false);
        let (status, body) = send(&h.app, upload("file", "scan.png", b"x")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Gemini API not properly initialized. Check your API key.");
        assert_eq!(h.uploads_left(), 0);

        let (status, body) = send(&h.app, get("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["extraction_available"], false);
    }

    #[tokio::test]
    async fn test_download_csv_flattens() {
        let h = harness(true);
        let data = json!({
            "company_info": {"company_name": "Acme"},
            "items": [{"hsn_code": "7318", "quantity": 3}]
        });
        let response = h
            .app
            .clone()
            .oneshot(json_request("POST", "/api/download-csv", data))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/csv"));
        assert!(
            response.headers()[header::CONTENT_DISPOSITION]
                .to_str()
                .unwrap()
                .contains("extracted_invoice_data.csv")
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            String::from_utf8_lossy(&bytes),
            "company_info_company_name,item_1_hsn_code,item_1_quantity\nAcme,7318,3\n"
        );
    }

    #[tokio::test]
    async fn test_download_csv_requires_data() {
        let h = harness(true);
        let (status, body) = send(&h.app, json_request("POST", "/api/download-csv", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No data provided");

        let req = Request::post("/api/download-csv").body(Body::empty()).unwrap();
        let (status, _) = send(&h.app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_download_json_is_pretty() {
        let h = harness(true);
        let response = h
            .app
            .clone()
            .oneshot(json_request("POST", "/api/download-json", json!({"a": {"b": 1}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(String::from_utf8_lossy(&bytes), "{\n  \"a\": {\n    \"b\": 1\n  }\n}");
    }

    #[tokio::test]
    async fn test_webhook_crud() {
        let h = harness(true);

        let (status, body) = send(
            &h.app,
            json_request("POST", "/api/webhooks", json!({"url": "http://hooks.example/in", "name": "CRM"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["webhook"]["id"].as_u64().unwrap();
        assert_eq!(body["webhook"]["enabled"], true);

        let (status, body) = send(&h.app, json_request("POST", "/api/webhooks", json!({"name": "no url"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "URL is required");

        let (_, body) = send(&h.app, json_request("POST", &format!("/api/webhooks/{id}/toggle"), json!({}))).await;
        assert_eq!(body["webhook"]["enabled"], false);

        let (status, _) = send(&h.app, json_request("POST", "/api/webhooks/999/toggle", json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&h.app, json_request("DELETE", &format!("/api/webhooks/{id}"), json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&h.app, json_request("DELETE", "/api/webhooks/12345", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], false);

        let (_, body) = send(&h.app, get("/api/webhooks")).await;
        assert_eq!(body["webhooks"], json!([]));
    }

    #[tokio::test]
    async fn test_extraction_is_relayed_to_enabled_webhooks() {
        let hits = Arc::new(AtomicUsize::new(0));
        let receiver = {
            let hits = Arc::clone(&hits);
            Router::new().route(
                "/hook",
                post(move |body: axum::Json<Value>| {
                    let hits = Arc::clone(&hits);
                    async move {
                        assert_eq!(body["event"], "invoice.extracted");
                        hits.fetch_add(1, Ordering::SeqCst);
                        "ok"
                    }
                }),
            )
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, receiver).await.unwrap() });

        let h = harness(true);
        let on = h.state.webhooks.ensure(&format!("http://{addr}/hook"), "on").unwrap();
        let off = h.state.webhooks.ensure(&format!("http://{addr}/other"), "off").unwrap();
        h.state.webhooks.toggle(off.id).unwrap();
        assert!(on.enabled);

        let (status, _) = send(&h.app, upload("file", "scan.jpeg", b"x")).await;
        assert_eq!(status, StatusCode::OK);

        for _ in 0..200 {
            if h.state.dispatcher.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let (_, body) = send(&h.app, get("/api/webhook-logs")).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["logs"][0]["status"], "success");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(h.state.dispatcher.log().snapshot()[0].status, DeliveryStatus::Success);
    }

    #[tokio::test]
    async fn test_demo_webhook_and_clear() {
        let h = harness(true);
        let (status, body) = send(&h.app, json_request("POST", "/api/demo-webhook", json!({"x": 1}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["updated"], true);

        let (_, body) = send(&h.app, json_request("POST", "/api/demo-webhook", json!({"x": 1}))).await;
        assert_eq!(body["updated"], false);

        let (_, body) = send(&h.app, get("/api/get-data")).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["data"][0]["data"], json!({"x": 1}));

        let (status, _) = send(&h.app, json_request("POST", "/api/clear-webhook-data", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = send(&h.app, get("/api/get-data")).await;
        assert_eq!(body["count"], 0);
        assert_eq!(body["data"], json!([]));
    }

    #[tokio::test]
    async fn test_self_test_registers_demo_once() {
        let h = harness(true);
        let (status, body) = send(&h.app, get("/api/test-webhook-system")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"]["failed"], 0);
        assert_eq!(body["summary"]["all_passed"], true);
        assert_eq!(body["steps"].as_array().unwrap().len(), 3);

        send(&h.app, get("/api/test-webhook-system")).await;
        let hooks = h.state.webhooks.list();
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].url, "http://127.0.0.1:5001/api/demo-webhook");
        assert!(h.dir.path().join("webhooks.json").exists());
    }

    #[tokio::test]
    async fn test_unknown_route_and_method_use_envelope() {
        let h = harness(true);
        let (status, body) = send(&h.app, get("/api/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Endpoint not found");

        let (status, body) = send(&h.app, get("/api/extract")).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert!(body["error"].is_string());
    }
}

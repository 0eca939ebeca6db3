//! Server startup and routing
//!
//! Startup is strictly ordered: resolve the compute target, load every model,
//! then bind the listener. A model that fails to load aborts startup before
//! any request can be accepted.

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    response::Html,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    api,
    compute_target::{DeviceResolver, NvmlProbe},
    config::Config,
    metrics,
    model_runtime::{ArtifactStore, LoadContext, ModelRegistry},
    shared_state::AppState,
};

/// Upload limit for a single request body; the landing page enforces the same.
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

const INDEX_HTML: &str = include_str!("../static/index.html");

/// Run the HTTP server until ctrl-c.
pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing(cfg.debug);
    metrics::init_metrics()?;
    cfg.print_config();

    let resolver = DeviceResolver::new(Arc::new(NvmlProbe::new()));
    let target = resolver.resolve(&cfg.device);

    let registry = {
        let store = ArtifactStore::new(&cfg.cache_dir);
        let resolver = resolver.clone();
        let mut registry = ModelRegistry::from_config(&cfg);

        // Session creation is blocking work; keep it off the reactor.
        tokio::task::spawn_blocking(move || -> anyhow::Result<ModelRegistry> {
            let ctx = LoadContext {
                store: &store,
                resolver: &resolver,
                target: &target,
            };
            registry.load_all(&ctx)?;
            Ok(registry)
        })
        .await
        .context("Model loading task panicked")??
    };

    let addr = cfg.api_addr()?;
    let state = AppState::new(cfg, registry, resolver, target);

    info!("🚀 Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            warn!("Failed to listen for ctrl-c: {}. Running until killed.", e);
            std::future::pending::<()>().await;
        }
    }
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Landing page, health and metrics at the root; capabilities under `/api`.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/vqa", post(api::visual_qa))
        .route("/captioning", post(api::image_captioning))
        .route("/ocr", post(api::ocr))
        .route("/object-detection", post(api::object_detection))
        .route("/system/status", get(api::system_status));

    Router::new()
        .route("/", get(index))
        .route("/healthz", get(|| async { "OK" }))
        .route("/metrics", get(metrics::get_metrics))
        .nest("/api", api_routes)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute_target::ComputeTarget;
    use crate::model_runtime::testing::{MockAdapter, TestEnv};
    use crate::model_runtime::Capability;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    const BOUNDARY: &str = "multimodal-test-boundary";

    struct Part<'a> {
        name: &'a str,
        content_type: Option<&'a str>,
        data: &'a [u8],
    }

    fn image_part(content_type: &str) -> Part<'_> {
        Part {
            name: "image",
            content_type: Some(content_type),
            data: b"\x89PNG\r\n\x1a\nfake",
        }
    }

    fn text_part<'a>(name: &'a str, value: &'a str) -> Part<'a> {
        Part {
            name,
            content_type: None,
            data: value.as_bytes(),
        }
    }

    fn multipart_request(uri: &str, parts: &[Part<'_>]) -> Request<Body> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match part.content_type {
                Some(ct) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"upload\"\r\nContent-Type: {}\r\n\r\n",
                        part.name, ct
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", part.name)
                        .as_bytes(),
                ),
            }
            body.extend_from_slice(part.data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    struct Harness {
        app: Router,
        calls: [Arc<AtomicUsize>; 4],
    }

    impl Harness {
        fn new() -> Self {
            Self::with_ocr(MockAdapter::new(Capability::Ocr, "EasyOCR"))
        }

        fn with_ocr(ocr: MockAdapter) -> Self {
            let vqa = MockAdapter::new(Capability::Vqa, "vqa-model");
            let captioning = MockAdapter::new(Capability::Captioning, "caption-model");
            let detection = MockAdapter::new(Capability::ObjectDetection, "detection-model");
            let calls = [vqa.calls(), captioning.calls(), ocr.calls(), detection.calls()];

            let env = TestEnv::new();
            let mut registry = ModelRegistry::new(
                Box::new(vqa),
                Box::new(captioning),
                Box::new(ocr),
                Box::new(detection),
            );
            registry.load_all(&env.ctx()).unwrap();

            let config = Config::from_vars(|key| match key {
                "DEVICE" => Some("cuda".to_string()),
                _ => None,
            })
            .unwrap();
            let state = AppState::new(config, registry, env.resolver.clone(), ComputeTarget::cpu());

            Self {
                app: build_router(state),
                calls,
            }
        }

        fn total_calls(&self) -> usize {
            self.calls.iter().map(|c| c.load(Ordering::SeqCst)).sum()
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
        }
    }

    #[tokio::test]
    async fn test_non_image_upload_is_rejected_before_inference() {
        let harness = Harness::new();
        for uri in ["/api/captioning", "/api/ocr", "/api/object-detection"] {
            let (status, json) = harness
                .send(multipart_request(uri, &[image_part("text/plain")]))
                .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(json["detail"], "Invalid file type. Please upload an image file.");
            assert_eq!(json["error_code"], "invalid_file_type");
        }

        let (status, _) = harness
            .send(multipart_request(
                "/api/vqa",
                &[text_part("question", "what?"), image_part("application/pdf")],
            ))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(harness.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_vqa_requires_question() {
        let harness = Harness::new();
        let (status, json) = harness
            .send(multipart_request("/api/vqa", &[image_part("image/png")]))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error_code"], "missing_field");

        let (status, _) = harness
            .send(multipart_request(
                "/api/vqa",
                &[text_part("question", "   "), image_part("image/png")],
            ))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(harness.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_image_is_rejected() {
        let harness = Harness::new();
        let (status, json) = harness
            .send(multipart_request("/api/ocr", &[text_part("note", "hi")]))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["detail"], "Missing required field: image");
        assert_eq!(harness.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_non_multipart_body_is_rejected() {
        let harness = Harness::new();
        let request = Request::builder()
            .method("POST")
            .uri("/api/captioning")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, json) = harness.send(request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error_code"], "invalid_multipart");
        assert_eq!(harness.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_vqa_response_shape() {
        let harness = Harness::new();
        let (status, json) = harness
            .send(multipart_request(
                "/api/vqa",
                &[text_part("question", "How many cats?"), image_part("image/jpeg")],
            ))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["answer"], "2");
        assert_eq!(json["confidence"], 0.87);
        assert_eq!(json["model"], "vqa-model");
        assert_eq!(harness.calls[0].load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_captioning_and_ocr_response_shapes() {
        let harness = Harness::new();
        let (status, json) = harness
            .send(multipart_request("/api/captioning", &[image_part("image/png")]))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["caption"], "a cat sitting on a couch");
        assert_eq!(json["model"], "caption-model");

        let (status, json) = harness
            .send(multipart_request("/api/ocr", &[image_part("image/webp")]))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["text"], "STOP");
        assert_eq!(json["model"], "EasyOCR");
    }

    #[tokio::test]
    async fn test_object_detection_response_shape() {
        let harness = Harness::new();
        let (status, json) = harness
            .send(multipart_request("/api/object-detection", &[image_part("image/png")]))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["model"], "detection-model");
        let detection = &json["detections"][0];
        assert_eq!(detection["label"], "cat");
        assert_eq!(detection["confidence"], 0.998);
        assert_eq!(detection["box"], serde_json::json!([12.5, 40.0, 310.25, 280.0]));
    }

    #[tokio::test]
    async fn test_inference_failure_maps_to_500() {
        let harness =
            Harness::with_ocr(MockAdapter::new(Capability::Ocr, "EasyOCR").failing_inference("boom"));
        let (status, json) = harness
            .send(multipart_request("/api/ocr", &[image_part("image/png")]))
            .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["detail"], "Error processing OCR: boom");
        assert_eq!(json["error_code"], "inference_failed");
        assert_eq!(harness.calls[2].load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_system_status_reports_registry() {
        let harness = Harness::new();
        let request = || {
            Request::builder()
                .uri("/api/system/status")
                .body(Body::empty())
                .unwrap()
        };

        let (status, first) = harness.send(request()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["device"], "cpu");
        assert_eq!(first["device_type"], "cuda");
        assert_eq!(first["models_loaded"], true);
        assert_eq!(
            first["active_models"],
            serde_json::json!(["vqa-model", "caption-model", "EasyOCR", "detection-model"])
        );
        assert_eq!(first["cuda_available"], false);
        assert!(first.get("cuda_device").is_none());

        let (_, second) = harness.send(request()).await;
        assert_eq!(first, second);
        assert_eq!(harness.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_health_and_landing_page() {
        let harness = Harness::new();
        let response = harness
            .app
            .clone()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"OK");

        let response = harness
            .app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

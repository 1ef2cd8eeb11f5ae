//! GeoForge API Gateway
//!
//! The HTTP entry point of the orchestration core.
//! Handles:
//! - Chat turns and deep discovery runs
//! - Sandboxed code execution
//! - Dependency health
//! - Rate limiting, request ids and observability (logging, metrics)

mod handlers;
mod middleware;

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use geoforge_common::{
    config::{AppConfig, ObservabilityConfig},
    documents::{self, DocumentStore},
    embeddings::{self, Embedder},
    errors::Result,
    llm::{self, LlmEndpoint},
    metrics,
    rerank::{self, Reranker},
    vector::{self, VectorStore},
    web,
};
use geoforge_context::{
    discovery::Retention, ChatOrchestrator, ContextAssembler, ContextRetriever, DiscoveryOrchestrator,
    DiscoveryStore, GenerationClient, GenerationSettings, RetrievalSettings, WebAugmenter,
};
use geoforge_sandbox::SandboxSupervisor;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::{signal, sync::Notify};
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub chat: Arc<ChatOrchestrator>,
    pub discovery: Arc<DiscoveryOrchestrator>,
    pub sandbox: Arc<SandboxSupervisor>,
    pub upstreams: Arc<Upstreams>,
}

/// Leaf service clients checked by `/health`
pub struct Upstreams {
    pub embedder: Arc<dyn Embedder>,
    pub reranker: Arc<dyn Reranker>,
    pub vector_store: Arc<dyn VectorStore>,
    pub llm: Arc<dyn LlmEndpoint>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("failed to load configuration")?;
    init_tracing(&config.observability);
    config.validate()?;

    info!("Starting GeoForge API Gateway v{}", geoforge_common::VERSION);

    // Initialize metrics
    install_metrics_exporter(&config)?;
    metrics::register_metrics();

    let addr = listen_addr(&config.server.host, config.server.port)?;
    let grace = config.shutdown_timeout();
    let retention = Retention {
        finished: Duration::from_secs(config.discovery.retention_secs),
        paused: Duration::from_secs(config.discovery.paused_ttl_secs),
    };
    let sweep_interval = Duration::from_secs(config.discovery.sweep_interval_secs.max(1));

    let state = build_state(config)?;
    info!(
        sandbox_backend = state.sandbox.backend().name(),
        sandbox_slots = state.sandbox.max_concurrent(),
        llm = state.upstreams.llm.model_name(),
        "Orchestrators ready"
    );
    let sweeper = state.discovery.store().spawn_sweeper(retention, sweep_interval);

    // Build the router
    let app = create_router(state)?;

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // In-flight requests get `grace` to finish once a signal arrives
    let draining = Arc::new(Notify::new());
    let signalled = Arc::clone(&draining);
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signalled.notify_one();
        })
        .into_future();

    tokio::select! {
        result = server => result?,
        _ = async {
            draining.notified().await;
            tokio::time::sleep(grace).await;
        } => tracing::warn!(grace_secs = grace.as_secs(), "Graceful shutdown timed out, dropping connections"),
    }

    sweeper.abort();
    info!("Server shutdown complete");
    Ok(())
}

/// `RUST_LOG` wins over the configured level
fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Serve Prometheus metrics on their own port; 0 disables the exporter
fn install_metrics_exporter(config: &AppConfig) -> anyhow::Result<()> {
    let port = config.observability.metrics_port;
    if port == 0 {
        return Ok(());
    }
    let addr = listen_addr(&config.server.host, port)?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets(metrics::LATENCY_BUCKETS)?
        .install()
        .context("failed to install Prometheus exporter")?;
    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

fn listen_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))
}

/// Connect the leaf services and wire the orchestrators
fn build_state(config: AppConfig) -> Result<AppState> {
    let upstreams = Upstreams {
        embedder: embeddings::create_embedder(&config.embedding)?,
        reranker: rerank::create_reranker(&config.reranking)?,
        vector_store: vector::create_vector_store(&config.vector_store)?,
        llm: llm::create_llm(&config.llm)?,
    };
    let documents = documents::create_document_store(&config.documents);
    let (web, encyclopedia) = web::create_providers(&config.web_search)?;
    let augmenter = WebAugmenter::new(
        web,
        encyclopedia,
        Duration::from_secs(config.web_search.timeout_secs),
    );
    let sandbox = SandboxSupervisor::new(&config.sandbox)?;

    Ok(assemble_state(config, upstreams, documents, augmenter, sandbox))
}

fn assemble_state(
    config: AppConfig,
    upstreams: Upstreams,
    documents: Arc<dyn DocumentStore>,
    augmenter: WebAugmenter,
    sandbox: SandboxSupervisor,
) -> AppState {
    let retriever = Arc::new(ContextRetriever::new(
        Arc::clone(&upstreams.embedder),
        Arc::clone(&upstreams.vector_store),
        Arc::clone(&upstreams.reranker),
        Arc::clone(&documents),
        RetrievalSettings::from(&config.retrieval),
    ));
    let augmenter = Arc::new(augmenter);
    let assembler = ContextAssembler::new(config.assembly.clone());
    let generator = Arc::new(GenerationClient::new(
        Arc::clone(&upstreams.llm),
        GenerationSettings::from(&config.llm),
    ));

    let chat = ChatOrchestrator::new(
        Arc::clone(&retriever),
        Arc::clone(&augmenter),
        documents,
        assembler.clone(),
        Arc::clone(&generator),
        &config,
    );
    let discovery = DiscoveryOrchestrator::new(
        retriever,
        augmenter,
        assembler,
        generator,
        Arc::new(DiscoveryStore::new()),
        &config.discovery,
    );

    AppState {
        config: Arc::new(config),
        chat: Arc::new(chat),
        discovery: Arc::new(discovery),
        sandbox: Arc::new(sandbox),
        upstreams: Arc::new(upstreams),
    }
}

/// Create the main application router
fn create_router(state: AppState) -> Result<Router> {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    let mut api_routes = Router::new()
        .route("/chat", post(handlers::chat::chat))
        .route("/discovery", post(handlers::discovery::start_discovery))
        .route(
            "/discovery/{id}",
            get(handlers::discovery::get_discovery).delete(handlers::discovery::delete_discovery),
        )
        .route("/discovery/{id}/pause", post(handlers::discovery::pause_discovery))
        .route("/discovery/{id}/resume", post(handlers::discovery::resume_discovery))
        .route("/discovery/{id}/stop", post(handlers::discovery::stop_discovery))
        .route("/code/execute", post(handlers::code::execute_code));

    let limits = &state.config.rate_limit;
    if limits.enabled {
        let limiter = middleware::create_rate_limiter(limits.requests_per_second, limits.burst)?;
        api_routes = api_routes.layer(axum::middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit_middleware,
        ));
    }

    // Health stays outside the rate limit
    let max_body_bytes = state.config.server.max_body_bytes;
    Ok(api_routes
        .route("/health", get(handlers::health::health))
        .route_layer(axum::middleware::from_fn(middleware::track_requests))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(propagate_id)
        .layer(request_id)
        .with_state(state))
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use geoforge_common::{
        documents::MemoryDocumentStore, embeddings::MockEmbedder, llm::ScriptedLlm, models::Origin,
        rerank::MockReranker, vector::MemoryVectorStore, web::StaticSnippetProvider,
    };
    use geoforge_sandbox::IsolationBackend;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.rate_limit.enabled = false;
        config.server.max_body_bytes = 4096;
        config
    }

    fn test_state(config: AppConfig, embedder: MockEmbedder, llm: ScriptedLlm) -> AppState {
        let upstreams = Upstreams {
            embedder: Arc::new(embedder),
            reranker: Arc::new(MockReranker::new()),
            vector_store: Arc::new(MemoryVectorStore::new()),
            llm: Arc::new(llm),
        };
        let augmenter = WebAugmenter::new(
            Arc::new(StaticSnippetProvider::new(Origin::WebSearch, vec![])),
            Arc::new(StaticSnippetProvider::new(Origin::Encyclopedia, vec![])),
            Duration::from_secs(1),
        );
        let sandbox = SandboxSupervisor::with_backend(&config.sandbox, IsolationBackend::Process);
        assemble_state(config, upstreams, Arc::new(MemoryDocumentStore::new()), augmenter, sandbox)
    }

    fn app_with(llm: ScriptedLlm) -> Router {
        create_router(test_state(test_config(), MockEmbedder::new(8), llm)).unwrap()
    }

    fn app() -> Router {
        app_with(ScriptedLlm::new())
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health_reports_dependencies_and_capacity() {
        let app = app();
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));

        let (_, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(body["status"], "online");
        for dependency in ["embedding", "reranking", "vector_store", "llm"] {
            assert_eq!(body["checks"][dependency]["status"], "up", "{dependency}");
            assert!(body["checks"][dependency]["latency_ms"].is_u64());
        }
        assert_eq!(body["llm_provider"], "scripted");
        assert_eq!(body["sandbox"]["backend"], "process");
        assert_eq!(body["sandbox"]["max_concurrent"], 4);
        assert_eq!(body["sandbox"]["available_slots"], 4);
        assert_eq!(body["discovery"]["active_runs"], 0);
    }

    #[tokio::test]
    async fn test_health_degrades_with_one_dependency_down() {
        let app = create_router(test_state(
            test_config(),
            MockEmbedder::unavailable(8),
            ScriptedLlm::new(),
        ))
        .unwrap();

        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["checks"]["embedding"]["status"], "down");
        assert!(body["checks"]["embedding"]["error"].is_string());
        assert_eq!(body["checks"]["llm"]["status"], "up");
    }

    #[tokio::test]
    async fn test_chat_answers_with_empty_knowledge_base() {
        let (status, body) = send(
            &app(),
            "POST",
            "/chat",
            Some(json!({"message": "Where are the main aquifers of the Nubian sandstone?"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(body["answer"].as_str().unwrap().contains("Scripted answer"));
        assert_eq!(body["sources"], json!([]));
        assert!(body["tokens"]["input"].is_u64());
        assert!(body["processing_time_ms"].is_u64());
        assert!(body.get("thinking").is_none());
    }

    #[tokio::test]
    async fn test_chat_rejects_invalid_requests() {
        let app = app();

        let (status, body) = send(&app, "POST", "/chat", Some(json!({"message": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], "validation_error");
        assert!(body["timestamp"].is_string());

        let (status, body) = send(&app, "POST", "/chat", Some(json!({"text": "missing message"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], "validation_error");

        let request = Request::builder()
            .method("POST")
            .uri("/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let message = "a".repeat(10_000);
        let (status, body) = send(&app(), "POST", "/chat", Some(json!({ "message": message }))).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["error_code"], "payload_too_large");
    }

    #[tokio::test]
    async fn test_discovery_lifecycle() {
        // Slow synthesis keeps the run active while it is controlled
        let app = app_with(ScriptedLlm::new().with_delay(Duration::from_secs(30)));

        let (status, body) = send(
            &app,
            "POST",
            "/discovery",
            Some(json!({"query": "Rare earth deposits along the East African Rift"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "running");
        let id = body["discovery_id"].as_str().unwrap().to_string();

        let (status, body) = send(&app, "GET", &format!("/discovery/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["discovery_id"], id.as_str());
        assert_eq!(body["steps"].as_array().unwrap().len(), 5);

        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["discovery"]["active_runs"], 1);

        let (status, body) = send(&app, "POST", &format!("/discovery/{id}/pause"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"discovery_id": id, "status": "paused"}));

        let (status, body) = send(&app, "POST", &format!("/discovery/{id}/pause"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error_code"], "invalid_transition");

        let (_, body) = send(&app, "POST", &format!("/discovery/{id}/resume"), None).await;
        assert_eq!(body["status"], "running");

        let (_, body) = send(&app, "POST", &format!("/discovery/{id}/stop"), None).await;
        assert_eq!(body["status"], "stopped");

        let (status, _) = send(&app, "POST", &format!("/discovery/{id}/resume"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(&app, "DELETE", &format!("/discovery/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(body, Value::Null);

        let (status, body) = send(&app, "GET", &format!("/discovery/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_code"], "run_not_found");
    }

    #[tokio::test]
    async fn test_discovery_unknown_and_invalid_requests() {
        let app = app();

        let (status, body) = send(&app, "GET", &format!("/discovery/{}", uuid_like()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_code"], "run_not_found");

        let (status, body) = send(&app, "POST", "/discovery/not-a-run/stop", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_code"], "run_not_found");

        let (status, body) = send(&app, "POST", "/discovery", Some(json!({"query": ""}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], "validation_error");

        let (status, _) = send(&app, "POST", "/discovery", Some(json!({"query": "q", "max_steps": 0}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    fn uuid_like() -> String {
        "0190c4d2-7a1e-7c3b-9f00-000000000001".to_string()
    }

    #[tokio::test]
    async fn test_code_execution_rejects_denied_code_without_spawning() {
        let app = app();
        let (status, body) = send(
            &app,
            "POST",
            "/code/execute",
            Some(json!({"code": "import socket\nsocket.create_connection(('example.org', 80))"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "validation_error");
        assert!(!body["findings"].as_array().unwrap().is_empty());
        assert!(body["execution_id"].is_string());
    }

    #[tokio::test]
    async fn test_code_execution_timeout_bounds() {
        let app = app();

        let (status, body) = send(&app, "POST", "/code/execute", Some(json!({"code": "x = 1", "timeout_s": 0}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], "validation_error");

        let (status, _) = send(
            &app,
            "POST",
            "/code/execute",
            Some(json!({"code": "x = 1", "timeout_s": 100_000})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_rate_limit_spares_health() {
        let mut config = test_config();
        config.rate_limit = geoforge_common::config::RateLimitConfig {
            requests_per_second: 1,
            burst: 1,
            enabled: true,
        };
        let app = create_router(test_state(config, MockEmbedder::new(8), ScriptedLlm::new())).unwrap();
        let uri = format!("/discovery/{}", uuid_like());

        let (status, _) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error_code"], "rate_limited");

        let (status, _) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn test_listen_addr() {
        assert_eq!(listen_addr("0.0.0.0", 8080).unwrap().port(), 8080);
        assert!(listen_addr("not a host", 80).is_err());
    }
}

use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event as SseEvent, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use dotenv::dotenv;
use futures::{Stream, StreamExt};
use qa_agent::{AgentPipeline, CheckpointBackend, MemoryCheckpoint, RedisCheckpoint};
use qa_core::{QueryRequest, Settings};
use qa_error::QaError;
use qa_llm::make_providers;
use qa_rag::{HttpReranker, QdrantVectorIndex, VectorIndex};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

#[derive(Clone)]
struct AppState {
    pipeline: Arc<AgentPipeline>,
    index: Arc<dyn VectorIndex>,
    settings: Arc<Settings>,
    http: reqwest::Client,
}

#[tokio::main]
async fn main() {
    init_tracing();
    dotenv().ok();

    let settings = match Settings::from_env() {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(2);
        }
    };

    match run(settings).await {
        Ok(()) => {
            info!("shutdown complete");
        }
        Err(e) => {
            if matches!(e, QaError::Configuration { .. }) {
                error!(error = %e, "configuration error");
                std::process::exit(2);
            }
            error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
    // 每条记录一行 JSON 输出到 stdout
    let fmt_layer = fmt::layer().json().with_target(false);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,tower_http=info"))
        .unwrap();
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

async fn run(settings: Arc<Settings>) -> Result<(), QaError> {
    let providers = make_providers(&settings)?;

    let index: Arc<dyn VectorIndex> = Arc::new(QdrantVectorIndex::new(
        &settings.qdrant_url,
        settings.qdrant_collection.clone(),
        settings.rrf_k,
        Duration::from_secs(settings.vector_timeout_secs),
    )?);

    let http = reqwest::Client::builder()
        .pool_max_idle_per_host(settings.http_pool_size)
        .build()
        .map_err(|e| QaError::Internal {
            message: format!("failed to build http client: {}", e),
            details: None,
        })?;

    let reranker = Arc::new(HttpReranker::new(
        http.clone(),
        settings.reranker_url.clone(),
        Duration::from_secs(settings.rerank_timeout_secs),
    ));

    let checkpoint: Arc<dyn CheckpointBackend> = match &settings.redis_url {
        Some(url) => {
            info!(url = %url, "using redis checkpoint backend");
            Arc::new(RedisCheckpoint::new(url, settings.session_ttl_secs)?)
        }
        None => {
            info!("REDIS_URL not set, using in-memory checkpoint backend");
            Arc::new(MemoryCheckpoint::new())
        }
    };

    // 启动期自举：payload 索引 + 嵌入维度断言
    if let Err(e) = index.ensure_text_index().await {
        warn!(error = %e, "payload index bootstrap failed, continuing");
    }
    match providers.embed.embed_one("dimension probe").await {
        Ok(vector) => {
            if vector.len() != settings.embedding_dim {
                return Err(QaError::Configuration {
                    key: "EMBEDDING_DIM".to_string(),
                    reason: format!(
                        "configured {} but embedding service returned {}",
                        settings.embedding_dim,
                        vector.len()
                    ),
                });
            }
            info!(dim = vector.len(), model = %settings.embedding_model_id, "embedding dimension verified");
        }
        Err(e) => {
            warn!(error = %e, "embedding service unreachable at startup, continuing degraded");
        }
    }

    let pipeline = Arc::new(AgentPipeline::new(
        providers.chat,
        providers.embed,
        index.clone(),
        reranker,
        checkpoint,
        settings.clone(),
    ));

    let state = AppState {
        pipeline,
        index,
        settings: settings.clone(),
        http,
    };

    let app = Router::new()
        .route("/chat/stream", post(chat_stream))
        .route("/query", post(query))
        .route("/health", get(health))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .map_err(|e| QaError::Configuration {
            key: "HOST/PORT".to_string(),
            reason: format!("{}", e),
        })?;
    info!(%addr, "qa-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| QaError::Internal {
            message: format!("failed to bind {}: {}", addr, e),
            details: None,
        })?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| QaError::Internal {
            message: format!("server error: {}", e),
            details: None,
        })
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

/// SSE 流式问答：每个事件一帧 JSON，帧后即刷
async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (rx, _cancel) = state.pipeline.clone().stream(request);
    let stream = ReceiverStream::new(rx).map(|event| {
        let payload = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(SseEvent::default().data(payload))
    });
    Sse::new(stream)
}

/// 非流式问答：流水线内部失败返回 200 + 错误体，仅格式错误返回 4xx
async fn query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> axum::response::Response {
    match state.pipeline.ask(request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) if e.category() == "guardrail_input" => e.into_response(),
        Err(e) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "error": e.to_string(),
                "category": e.category(),
                "message": e.user_message(),
            })),
        )
            .into_response(),
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let vector_backend = state.index.health_check().await;
    let collection_info = if vector_backend {
        state.index.collection_info().await.ok()
    } else {
        None
    };

    let object_store = match &state.settings.object_store_url {
        Some(url) => state
            .http
            .get(url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false),
        None => false,
    };

    let status = if vector_backend { "healthy" } else { "degraded" };
    Json(serde_json::json!({
        "status": status,
        "vector_backend": vector_backend,
        "object_store": object_store,
        "collection_info": collection_info,
    }))
}

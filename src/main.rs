use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use log::{error, info, warn};
use redis::aio::ConnectionManager;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use convoserver::automation::AutomationWorker;
use convoserver::config::{apply_config_file, AppConfig};
use convoserver::gateway;
use convoserver::gateway::forwarder::InboundForwarder;
use convoserver::gateway::outbound::OutboundWorker;
use convoserver::ingestion::IngestionWorker;
use convoserver::llm::{ChatLlmClient, LlmProvider};
use convoserver::orchestrator;
use convoserver::orchestrator::dedupe::EventDeduper;
use convoserver::orchestrator::policy::PolicyStore;
use convoserver::orchestrator::publish::OutboundPublisher;
use convoserver::retrieval::embeddings::EmbeddingService;
use convoserver::retrieval::vector_store::VectorStoreClient;
use convoserver::shared::events::EventBus;
use convoserver::shared::metrics::MetricsCollector;
use convoserver::shared::state::AppState;
use convoserver::shared::utils::{create_pool, create_s3_client, run_pending_migrations};

const COMPONENTS: &[&str] = &["orchestrator", "gateway", "ingestion", "automation"];

fn usage() -> ! {
    eprintln!("usage: convoserver <orchestrator|gateway|ingestion|automation> [--config <path>]");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(component) = args.first().cloned() else {
        usage();
    };
    if !COMPONENTS.contains(&component.as_str()) {
        eprintln!("unknown component: {}", component);
        usage();
    }

    if let Some(index) = args.iter().position(|a| a == "--config") {
        let Some(path) = args.get(index + 1) else {
            usage();
        };
        if let Err(e) = apply_config_file(&PathBuf::from(path)) {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let state = match build_state(config).await {
        Ok(state) => state,
        Err(e) => {
            error!("startup failed: {}", e);
            std::process::exit(1);
        }
    };

    info!("starting component {}", component);
    let result = match component.as_str() {
        "orchestrator" => run_orchestrator(state).await,
        "gateway" => run_gateway(state).await,
        "ingestion" => run_ingestion(state).await,
        "automation" => run_automation(state).await,
        _ => unreachable!(),
    };
    if let Err(e) = result {
        error!("{} exited with error: {}", component, e);
        std::process::exit(1);
    }
    Ok(())
}

async fn build_state(config: AppConfig) -> anyhow::Result<Arc<AppState>> {
    let conn = create_pool(&config.database.url, config.database.pool_size)?;
    let redis_client = redis::Client::open(config.streams.outbound_url.as_str())?;
    let redis = ConnectionManager::new(redis_client).await?;
    let s3 = Some(create_s3_client(&config.object_store).await);
    let http = reqwest::Client::builder()
        .user_agent(concat!("convoserver/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let metrics = MetricsCollector::new();
    let events = EventBus::new(redis.clone());
    let policies = Arc::new(PolicyStore::new(
        conn.clone(),
        config.runtime.policy_cache_ttl,
    ));
    let vectors = Arc::new(VectorStoreClient::new(
        http.clone(),
        config.vector_store.url.clone(),
        config.vector_store.api_key.clone(),
    ));
    let embeddings = Arc::new(EmbeddingService::new(http.clone(), config.embedding.clone()));
    let llm: Option<Arc<dyn LlmProvider>> = Some(Arc::new(ChatLlmClient::new(
        http.clone(),
        config.llm.clone(),
    )));
    let publisher = Arc::new(OutboundPublisher::new(redis.clone(), Arc::clone(&metrics)));
    let deduper = Arc::new(EventDeduper::new(redis.clone(), config.runtime.dedupe_ttl));

    Ok(Arc::new(AppState {
        config,
        conn,
        redis,
        s3,
        http,
        metrics,
        events,
        policies,
        vectors,
        embeddings,
        llm,
        publisher,
        deduper,
    }))
}

async fn run_orchestrator(state: Arc<AppState>) -> anyhow::Result<()> {
    run_pending_migrations(&state.conn)?;
    Arc::clone(&state.publisher).spawn_retry_drain();

    let app = orchestrator::configure()
        .with_state(Arc::clone(&state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());
    serve(app, &state).await
}

async fn run_gateway(state: Arc<AppState>) -> anyhow::Result<()> {
    let forwarder = Arc::new(InboundForwarder::new(
        state.http.clone(),
        state.redis.clone(),
        state.config.gateway.orchestrator_url.clone(),
        Arc::clone(&state.metrics),
    ));
    Arc::clone(&forwarder).spawn_drain();

    let outbound = OutboundWorker::new(Arc::clone(&state));
    tokio::spawn(async move {
        if let Err(e) = outbound.run().await {
            error!("outbound worker stopped: {}", e);
        }
    });

    let app = gateway::configure(forwarder)
        .with_state(Arc::clone(&state))
        .layer(TraceLayer::new_for_http());
    serve(app, &state).await
}

async fn run_ingestion(state: Arc<AppState>) -> anyhow::Result<()> {
    let worker = IngestionWorker::new(Arc::clone(&state));
    let handle = tokio::spawn(async move {
        if let Err(e) = worker.run().await {
            error!("ingestion worker stopped: {}", e);
        }
    });
    run_worker_sidecar(state, handle, "ingestion").await
}

async fn run_automation(state: Arc<AppState>) -> anyhow::Result<()> {
    let worker = AutomationWorker::new(Arc::clone(&state));
    let handle = tokio::spawn(async move {
        if let Err(e) = worker.run().await {
            error!("automation worker stopped: {}", e);
        }
    });
    run_worker_sidecar(state, handle, "automation").await
}

/// Health/metrics endpoint plus drain-on-signal for queue workers.
async fn run_worker_sidecar(
    state: Arc<AppState>,
    worker: tokio::task::JoinHandle<()>,
    component: &'static str,
) -> anyhow::Result<()> {
    let sidecar_state = Arc::clone(&state);
    let app = Router::new()
        .route(
            "/health",
            get(move || {
                let state = Arc::clone(&sidecar_state);
                async move {
                    let db_ok = state.conn.get().is_ok();
                    axum::Json(serde_json::json!({
                        "status": if db_ok { "ok" } else { "degraded" },
                        "component": component,
                    }))
                }
            }),
        )
        .route(
            "/metrics",
            get({
                let state = Arc::clone(&state);
                move || {
                    let state = Arc::clone(&state);
                    async move { state.metrics.render().await }
                }
            }),
        );

    let listener = tokio::net::TcpListener::bind(state.config.runtime.http_bind.as_str()).await?;
    info!(
        "{} sidecar listening on {}",
        component, state.config.runtime.http_bind
    );
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Two-phase shutdown: stop intake, let in-flight work drain, then stop.
    info!(
        "{} draining for up to {:?}",
        component, state.config.runtime.drain_deadline
    );
    tokio::time::sleep(state.config.runtime.drain_deadline).await;
    worker.abort();
    Ok(())
}

async fn serve(app: Router, state: &AppState) -> anyhow::Result<()> {
    let bind = state.config.runtime.http_bind.as_str();
    let listener = match tokio::net::TcpListener::bind(bind).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind {}: {} - is another instance running?", bind, e);
            return Err(e.into());
        }
    };
    info!("HTTP server listening on {}", bind);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install ctrl-c handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => warn!("failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

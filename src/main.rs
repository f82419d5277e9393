use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use webagent_solver::brain::LlmPlanner;
use webagent_solver::cache::PlanCache;
use webagent_solver::config::Config;
use webagent_solver::{AppState, LearningStore, Planner, RulePlanner, router};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let config = Config::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = Arc::new(LearningStore::open(
        &config.learning_data_dir,
        config.checkpoint_every,
    ));

    let (planner, agent_type): (Arc<dyn Planner>, &str) = if config.llm_enabled() {
        let planner = LlmPlanner::new(
            config.llm_api_url.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
            config.llm_timeout(),
            Arc::clone(&store),
        )?;
        info!(model = %config.llm_model, "LLM planner enabled");
        (Arc::new(planner), "llm")
    } else {
        info!("no LLM key configured, using rule planner");
        (Arc::new(RulePlanner::new(Arc::clone(&store))), "rules")
    };

    let state = Arc::new(
        AppState::new(planner, Arc::clone(&store))
            .with_cache(PlanCache::new(config.cache_ttl(), config.cache_capacity))
            .with_trust_forwarded_for(config.trust_forwarded_for)
            .with_agent_type(agent_type),
    );
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_target())
        .await
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    info!("shutting down, writing learning checkpoint");
    tokio::task::spawn_blocking(move || store.checkpoint_logged())
        .await
        .context("checkpoint task panicked")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

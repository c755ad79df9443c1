//! Deckmind HTTP 服务
//!
//! 启动: cargo run --bin deckmind
//! 对话接口: POST http://127.0.0.1:8080/api/presentations/{id}/chat

#![cfg(feature = "web")]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use deckmind::config::load_config;
use deckmind::core::ShutdownManager;
use deckmind::environment::{create_provider, ReferenceFiles};
use deckmind::server::{router, AppState};
use deckmind::slides::LineClassifier;
use deckmind::store::create_kv_store;
use deckmind::turn::build_executor;

/// 后台回收过期环境与过期键的间隔
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    deckmind::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("failed to load configuration")?;
    cfg.validate().context("invalid configuration")?;

    let store = create_kv_store(&cfg.store).context("failed to create session store")?;
    let provider = create_provider(&cfg.environment).await;
    let references = ReferenceFiles::load(&cfg.references)
        .await
        .context("failed to load reference files")?;
    let executor = Arc::new(build_executor(
        &cfg,
        Arc::clone(&store),
        Arc::clone(&provider),
        references,
    ));

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    let sweep_provider = Arc::clone(&provider);
    let sweep_token = shutdown.token();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = sweep_token.cancelled() => break,
                _ = interval.tick() => {
                    let removed = sweep_provider.sweep_expired().await;
                    if removed > 0 {
                        tracing::info!(removed, "expired environments removed");
                    }
                    let purged = store.purge_expired().await;
                    if purged > 0 {
                        tracing::debug!(purged, "expired session keys purged");
                    }
                }
            }
        }
    });

    let state = Arc::new(AppState {
        executor,
        classifier: LineClassifier::new(cfg.slides.visible_indent),
        shutdown: shutdown.clone(),
    });
    let app = router(state);

    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(
        app = cfg.app.name.as_deref().unwrap_or("deckmind"),
        addr = %addr,
        "Deckmind listening"
    );

    let graceful = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { graceful.wait_for_shutdown().await })
        .await
        .context("server error")?;

    let drained = shutdown
        .drain(Duration::from_secs(cfg.server.drain_timeout_secs))
        .await;
    tracing::info!(drained, "Deckmind stopped");
    Ok(())
}

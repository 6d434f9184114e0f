pub mod error;
pub mod routes;
pub mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use veriq_core::config::Config;
use veriq_core::worker::Worker;
use veriq_core::Platform;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(app_state: state::AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(routes::registry::healthz))
        // Intent
        .route("/v1/intent/propose", post(routes::intent::propose))
        .route("/v1/intent/commit", post(routes::intent::commit))
        // Work
        .route("/v1/work", post(routes::intent::submit))
        .route("/v1/work/{work_id}", get(routes::work::get_work))
        .route("/v1/work/{work_id}/events", get(routes::work::get_events))
        .route("/v1/stream", get(routes::stream::sse_events))
        // Leases
        .route("/v1/leases/acquire", post(routes::leases::acquire))
        .route("/v1/leases/sweep", post(routes::leases::sweep))
        .route(
            "/v1/leases/{work_id}/heartbeat",
            post(routes::leases::heartbeat),
        )
        .route(
            "/v1/leases/{work_id}/complete",
            post(routes::leases::complete),
        )
        .route("/v1/leases/{work_id}/fail", post(routes::leases::fail))
        // Receipts
        .route("/v1/receipts/{cid}", get(routes::receipts::get_receipt))
        .route(
            "/v1/receipts/{cid}/inclusion",
            get(routes::receipts::get_inclusion),
        )
        .route("/v1/verify/receipt", post(routes::receipts::verify))
        // Anchors
        .route("/v1/anchors/{date}", get(routes::anchors::get_anchor))
        .route(
            "/v1/anchors/{date}/rebuild",
            post(routes::anchors::rebuild_anchor),
        )
        // Registry
        .route("/v1/capabilities", get(routes::registry::capabilities))
        .route(
            "/v1/schema/{schema_id}/{version}",
            get(routes::registry::get_schema),
        )
        .route("/v1/keys", get(routes::registry::keys))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

/// Run `tick` on the blocking pool every `period`. Failures are logged and
/// the loop carries on.
fn every<F>(name: &'static str, period: Duration, platform: Arc<Platform>, tick: F) -> JoinHandle<()>
where
    F: Fn(&Platform) -> veriq_core::Result<()> + Send + Sync + 'static,
{
    let tick = Arc::new(tick);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let platform = platform.clone();
            let tick = tick.clone();
            match tokio::task::spawn_blocking(move || (*tick)(&platform)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "background tick failed"),
                Err(e) => tracing::warn!(task = name, error = %e, "background tick panicked"),
            }
        }
    })
}

/// Start the lease sweeper, the anchor sealer and, when enabled, the
/// built-in worker.
pub fn spawn_background(app_state: &state::AppState) -> Vec<JoinHandle<()>> {
    let config = app_state.platform.config().clone();
    let platform = app_state.platform.clone();
    let mut handles = vec![
        every(
            "sweep",
            Duration::from_millis(config.queue.sweep_interval_ms),
            platform.clone(),
            |p| {
                let report = p.sweep()?;
                if !report.reassigned.is_empty() || !report.abandoned.is_empty() {
                    tracing::info!(
                        reassigned = report.reassigned.len(),
                        abandoned = report.abandoned.len(),
                        "lease sweep"
                    );
                }
                Ok(())
            },
        ),
        every(
            "seal",
            Duration::from_secs(config.anchor.seal_interval_secs),
            platform.clone(),
            |p| {
                for anchor in p.seal_due()? {
                    tracing::info!(date = %anchor.date, receipts = anchor.receipt_cids.len(), "anchor sealed");
                }
                Ok(())
            },
        ),
    ];
    if config.worker.enabled {
        let worker = Worker::builtin(&config);
        tracing::info!(worker_id = worker.worker_id(), topics = ?worker.topics(), "built-in worker enabled");
        handles.push(every(
            "worker",
            Duration::from_millis(config.queue.worker_tick_ms),
            platform,
            move |p| worker.run_once(p).map(|_| ()),
        ));
    }
    handles
}

// ---------------------------------------------------------------------------
// Serve
// ---------------------------------------------------------------------------

fn open_state(root: PathBuf) -> anyhow::Result<state::AppState> {
    let config = Config::load(&root)?;
    let warnings = config.validate();
    for w in &warnings {
        tracing::warn!(level = ?w.level, "config: {}", w.message);
    }
    if Config::has_errors(&warnings) {
        anyhow::bail!("invalid configuration at {}", veriq_core::paths::config_path(&root).display());
    }
    state::AppState::open(root, config)
}

/// Start the veriq HTTP server on `0.0.0.0:{port}`.
pub async fn serve(root: PathBuf, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_on(root, listener).await
}

/// Start the server on a pre-bound listener.
///
/// Unlike `serve`, this accepts a `TcpListener` that was already bound so the
/// caller can read the actual port before starting (useful when `port = 0` and
/// the OS picks a free port).
pub async fn serve_on(root: PathBuf, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let app_state = open_state(root)?;
    let background = spawn_background(&app_state);
    let app = build_router(app_state);

    tracing::info!("veriq listening on http://localhost:{actual_port}");

    let served = axum::serve(listener, app).await;
    for handle in background {
        handle.abort();
    }
    served?;
    Ok(())
}

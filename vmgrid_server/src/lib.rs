//! vmgrid hub: a transparent WebDriver proxy over a lazily provisioned VM
//! fleet. Clients drive `/wd/hub` on this server; each session gets its own
//! VM running a real Selenium server, torn down when the session ends.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::{any, get, post};
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

use vmgrid_persistence::Database;
use vmgrid_pool::{PoolConfig, Preloader, VmChecker, VmPool};
use vmgrid_provider::{KvmProvider, OpenstackProvider, Provider};
use vmgrid_session::{SessionWorker, Sessions, SessionsConfig};
use vmgrid_settings::Settings;

pub mod api;
pub mod error;
pub mod proxy;
pub mod rewrite;
pub mod screenshot;

/// How long shutdown waits for active sessions before giving up.
const DRAIN_LIMIT: Duration = Duration::from_secs(60);

/// What the proxy handlers need besides the session table.
#[derive(Debug)]
pub struct ProxySettings {
    pub selenium_port: u16,
    pub agent_port: u16,
    pub screenshots_dir: PathBuf,
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub pool: Arc<VmPool>,
    pub sessions: Arc<Sessions>,
    pub http: reqwest::Client,
    pub proxy: Arc<ProxySettings>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api::status))
        .route("/api/platforms", get(api::platforms))
        .route("/api/sessions", get(api::sessions))
        .route("/api/pool", get(api::pool))
        .route("/api/queue", get(api::queue))
        .route("/api/session/{session_id}", get(api::session))
        .route("/api/session/{session_id}/stop", post(api::stop_session))
        .route("/api/user/{user_id}", get(api::user_info))
        .route(
            "/api/user/{user_id}/regenerate_token",
            post(api::regenerate_token),
        )
        .route("/wd/hub/{*rest}", any(proxy::handle))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
}

/// Wire everything up and run until ctrl-c: providers, pool, background
/// workers, the session table and the HTTP surface.
pub async fn serve(settings: Settings) -> anyhow::Result<()> {
    settings.validate()?;

    let create_check_pause = Duration::from_secs(settings.pool.vm_create_check_pause);

    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
    if settings.kvm.enabled {
        providers.push(Arc::new(KvmProvider::new(
            settings.kvm.clone(),
            settings.net.selenium_port,
            create_check_pause,
            settings.pool.vm_create_check_attempts,
        )));
    }
    if settings.openstack.enabled {
        providers.push(Arc::new(OpenstackProvider::new(
            settings.openstack.clone(),
            settings.net.selenium_port,
            create_check_pause,
            settings.pool.vm_create_check_attempts,
        )));
    }

    let pool = Arc::new(
        VmPool::new(
            providers,
            PoolConfig {
                selenium_port: settings.net.selenium_port,
                ping_timeout: Duration::from_secs(settings.net.ping_timeout),
            },
        )
        .await
        .context("platform discovery failed")?,
    );

    let db = Arc::new(Database::open(&settings.database.path).context("opening database")?);
    let platforms: Vec<(String, String)> = pool
        .platforms()
        .into_iter()
        .map(|platform| (platform.name, platform.node))
        .collect();
    db.register_platforms(&platforms)?;

    let sessions = Sessions::new(
        db.clone(),
        pool.clone(),
        SessionsConfig {
            timeout: Duration::from_secs(settings.session.timeout),
            get_vm_timeout: Duration::from_secs(settings.pool.get_vm_timeout),
            selenium_port: settings.net.selenium_port,
            screenshots_dir: PathBuf::from(&settings.dirs.screenshots_dir),
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let preloader = Preloader::new(
        pool.clone(),
        Duration::from_secs(settings.pool.preloader_frequency),
    )
    .spawn(shutdown_rx.clone());
    let checker = settings.pool.vm_check.then(|| {
        VmChecker::new(
            pool.clone(),
            Duration::from_secs(settings.pool.vm_check_frequency),
        )
        .spawn(shutdown_rx.clone())
    });
    let worker = SessionWorker::new(sessions.clone()).spawn(shutdown_rx);

    let state = AppState {
        db,
        pool: pool.clone(),
        sessions: sessions.clone(),
        http: reqwest::Client::new(),
        proxy: Arc::new(ProxySettings {
            selenium_port: settings.net.selenium_port,
            agent_port: settings.net.agent_port,
            screenshots_dir: PathBuf::from(&settings.dirs.screenshots_dir),
        }),
    };
    let app = router(state);

    let addr: SocketAddr = settings
        .server
        .listen
        .parse()
        .context("invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("server is listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cooperative shutdown: the listener is gone; let active sessions run
    // out, stop the background workers, then destroy every VM.
    sessions.wait_for_drain(DRAIN_LIMIT).await;
    let _ = shutdown_tx.send(true);
    let _ = preloader.await;
    if let Some(checker) = checker {
        let _ = checker.await;
    }
    let _ = worker.await;
    pool.free().await;

    log::info!("server gracefully shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("listening for shutdown signal: {e}");
    }
    log::info!("shutting down...");
}

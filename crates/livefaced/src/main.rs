use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use liveface_core::{FaceDetector, FaceVerifier, Orchestrator, SessionStore};

mod config;
mod dbus_interface;
mod identity_store;
mod rate_limiter;
mod remote;

use config::Config;
use dbus_interface::{AppState, LivefaceService};
use identity_store::IdentityStore;
use remote::RemotePerception;

const BUS_NAME: &str = "org.liveface.Liveface1";
const OBJECT_PATH: &str = "/org/liveface/Liveface1";

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    init_tracing(config.log_json);

    tracing::info!(
        perception = %config.perception_url,
        db = %config.db_path.display(),
        session_bus = config.session_bus,
        "livefaced starting"
    );

    let identity_store = IdentityStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening identity store at {}", config.db_path.display()))?;

    let remote = RemotePerception::new(&config.perception_url, config.perception_timeout());
    tracing::debug!(
        url = remote.base_url(),
        timeout_secs = config.perception_timeout_secs,
        "perception client configured"
    );
    let orchestrator = Orchestrator::new(
        remote.clone(),
        remote,
        Arc::new(SessionStore::new()),
        config.policy(),
    );

    match identity_store.load().await {
        Ok(Some(reference)) => {
            tracing::info!(digest = %reference.digest, "restored identity reference");
            orchestrator.identity().replace(reference).await;
        }
        Ok(None) => tracing::info!("no identity reference enrolled yet"),
        Err(e) => tracing::error!(error = %e, "failed to restore identity reference"),
    }

    let session_bus = config.session_bus;
    let state = Arc::new(AppState::new(config, orchestrator, identity_store));
    let sweeper = spawn_idle_sweeper(Arc::clone(&state), state.config.sweep_interval());

    let service = LivefaceService {
        state: Arc::clone(&state),
    };
    let builder = if session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus_name = BUS_NAME, path = OBJECT_PATH, "livefaced ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    sweeper.abort();
    tracing::info!("livefaced shutting down");

    Ok(())
}

fn init_tracing(json: bool) {
    let builder = tracing_subscriber::fmt().with_env_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn spawn_idle_sweeper<D: FaceDetector, V: FaceVerifier>(
    state: Arc<AppState<D, V>>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately
        tick.tick().await;
        loop {
            tick.tick().await;
            state.sweep().await;
        }
    })
}

use anyhow::{Context, Result};
use gatekeeper_core::{AccessStateMachine, EmbeddingStore, MajorityVoteMatcher};
use gatekeeper_hw::{Camera, FrameSource};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod history;
mod hub;
mod notifier;
mod remote_encoder;
mod router;
mod server;

use config::Config;
use engine::{EngineSettings, Pipeline};
use history::HistoryLog;
use hub::BroadcastHub;
use notifier::{HttpPushGateway, NotificationDispatcher};
use remote_encoder::RemoteEncoder;
use router::TransitionRouter;

/// Open the camera and encoder, then enroll every identity under the
/// enrollment root. Blocking: runs off the async runtime.
fn prepare(config: &Config) -> Result<(Camera, RemoteEncoder, EmbeddingStore)> {
    let mut encoder = RemoteEncoder::new(&config.encoder_url, config.encoder_timeout)
        .context("failed to build encoder client")?;
    let store = EmbeddingStore::load(&config.enroll_dir, &mut encoder)
        .context("failed to load enrollment database")?;
    tracing::info!(
        identities = store.identities().len(),
        references = store.len(),
        dimension = store.dimension(),
        "enrollment loaded"
    );

    let mut camera = Camera::open(&config.camera_device)
        .with_context(|| format!("failed to open camera {}", config.camera_device))?;
    camera.discard(config.warmup_frames);
    Ok((camera, encoder, store))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        camera = %config.camera_device,
        enroll_dir = %config.enroll_dir.display(),
        tolerance = config.tolerance,
        listen = %config.listen_addr,
        notifications = config.notify.is_some(),
        "gatekeeperd starting"
    );

    let setup_config = config.clone();
    let (camera, encoder, store) = tokio::task::spawn_blocking(move || prepare(&setup_config))
        .await
        .context("setup task panicked")??;
    let store = Arc::new(store);

    let machine = AccessStateMachine::new()
        .with_deny_list(config.deny_list.iter().cloned())
        .with_idle_reset(config.idle_reset);
    let pipeline = Pipeline::new(
        Arc::clone(&store),
        MajorityVoteMatcher::new(config.tolerance),
        machine,
    );
    let hub = Arc::new(BroadcastHub::new(pipeline.current().clone()));

    let history = match HistoryLog::open(&config.db_path).await {
        Ok(log) => {
            tracing::info!(path = %config.db_path.display(), "access history enabled");
            Some(log)
        }
        Err(e) => {
            tracing::warn!(error = %e, path = %config.db_path.display(), "access history disabled");
            None
        }
    };

    let dispatcher = match &config.notify {
        Some(notify) => {
            let gateway = HttpPushGateway::new(&notify.api_url, notify.timeout)
                .context("failed to build push gateway client")?;
            tracing::info!(endpoint = gateway.endpoint(), "visitor notifications enabled");
            Some(NotificationDispatcher::new(gateway, notify))
        }
        None => {
            tracing::info!("API_URL or FCM_TOKEN unset; visitor notifications disabled");
            None
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let router = TransitionRouter::new(Arc::clone(&hub), dispatcher, history.clone());
    tokio::spawn(router.run(rx));

    let service = dbus_interface::GatekeeperService::new(Arc::clone(&hub), Arc::clone(&store));
    let _dbus = match dbus_interface::serve(config.dbus, service).await {
        Ok(Some(conn)) => {
            tokio::spawn(dbus_interface::forward_signals(conn.clone(), Arc::clone(&hub)));
            Some(conn)
        }
        Ok(None) => None,
        Err(e) => {
            tracing::warn!(error = %e, "D-Bus unavailable; continuing without it");
            None
        }
    };

    let state = server::AppState {
        hub: Arc::clone(&hub),
        history,
        identities: Arc::new(store.identities().iter().map(|i| i.name.clone()).collect()),
    };
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let mut http = tokio::spawn(async move { axum::serve(listener, server::create_router(state)).await });

    let settings = EngineSettings {
        max_capture_failures: config.max_capture_failures,
        ..EngineSettings::default()
    };
    let engine_exit = engine::spawn_engine(camera, encoder, pipeline, tx, settings)?;

    tracing::info!(listen = %config.listen_addr, "gatekeeperd ready");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("gatekeeperd shutting down");
        }
        exit = engine_exit => {
            match exit {
                Ok(Ok(())) => tracing::info!("engine stopped"),
                Ok(Err(e)) => return Err(e).context("capture engine failed"),
                Err(_) => anyhow::bail!("engine thread exited without reporting"),
            }
        }
        served = &mut http => {
            served.context("http server task panicked")?.context("http server failed")?;
        }
    }

    Ok(())
}

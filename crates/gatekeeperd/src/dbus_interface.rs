use crate::config::BusKind;
use crate::hub::BroadcastHub;
use gatekeeper_core::{AccessStatus, EmbeddingStore};
use std::sync::Arc;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.freedesktop.Gatekeeper1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Gatekeeper1";

/// D-Bus interface for the Gatekeeper access daemon.
///
/// Bus name: org.freedesktop.Gatekeeper1
/// Object path: /org/freedesktop/Gatekeeper1
pub struct GatekeeperService {
    hub: Arc<BroadcastHub>,
    store: Arc<EmbeddingStore>,
}

impl GatekeeperService {
    pub fn new(hub: Arc<BroadcastHub>, store: Arc<EmbeddingStore>) -> Self {
        Self { hub, store }
    }
}

#[interface(name = "org.freedesktop.Gatekeeper1")]
impl GatekeeperService {
    /// Current access status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        status_json(&self.hub.current())
    }

    /// Enrolled identities with their reference embedding counts, as JSON.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        Ok(identities_json(&self.store).to_string())
    }

    /// Emitted whenever the access decision changes.
    #[zbus(signal)]
    async fn access_changed(emitter: &SignalEmitter<'_>, status: &str) -> zbus::Result<()>;
}

fn status_json(status: &AccessStatus) -> zbus::fdo::Result<String> {
    serde_json::to_string(status).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn identities_json(store: &EmbeddingStore) -> serde_json::Value {
    store
        .identities()
        .iter()
        .map(|id| serde_json::json!({ "name": id.name, "embeddings": id.embeddings.len() }))
        .collect()
}

/// Claim the bus name and export the service. `Ok(None)` when D-Bus is off.
pub async fn serve(
    bus: BusKind,
    service: GatekeeperService,
) -> zbus::Result<Option<zbus::Connection>> {
    let builder = match bus {
        BusKind::Off => return Ok(None),
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;
    tracing::info!(bus = ?bus, name = BUS_NAME, "D-Bus interface registered");
    Ok(Some(conn))
}

/// Re-emit hub updates as `AccessChanged` signals, skipping repeats of the
/// same decision.
pub async fn forward_signals(conn: zbus::Connection, hub: Arc<BroadcastHub>) {
    let emitter = match SignalEmitter::new(&conn, OBJECT_PATH) {
        Ok(emitter) => emitter,
        Err(e) => {
            tracing::warn!(error = %e, "cannot emit D-Bus signals");
            return;
        }
    };

    let (id, mut rx) = hub.subscribe();
    let mut last = rx.recv().await.map(|s| s.kind);
    while let Some(status) = rx.recv().await {
        if last.as_ref() == Some(&status.kind) {
            continue;
        }
        last = Some(status.kind.clone());

        let Ok(payload) = status_json(&status) else {
            continue;
        };
        if let Err(e) = GatekeeperService::access_changed(&emitter, &payload).await {
            tracing::warn!(error = %e, "failed to emit AccessChanged");
        }
    }
    hub.unsubscribe(&id);
}

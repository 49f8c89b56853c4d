use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use nimbus_domain::{CellGeolocation, CloudApi, DeviceRegistry, GeoFix};

use crate::broadcaster::{DeviceReadings, DeviceUiState, UiBroadcaster};

#[derive(Clone)]
struct AppState {
    broadcaster: Arc<UiBroadcaster>,
    registry: Arc<DeviceRegistry>,
    cloud: Arc<dyn CloudApi>,
}

/// One device in the `/devices` snapshot.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub short_id: String,
    pub device_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geolocation: Option<GeoFix>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell_geolocation: Option<CellGeolocation>,
    pub update: DeviceReadings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imei: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_info: Option<Value>,
}

/// Serve the snapshot API and the WebSocket update stream until cancelled.
pub async fn serve(
    broadcaster: Arc<UiBroadcaster>,
    registry: Arc<DeviceRegistry>,
    cloud: Arc<dyn CloudApi>,
    port: u16,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let state = AppState {
        broadcaster,
        registry,
        cloud,
    };

    // CORS is wide open on purpose: the map UI is served from elsewhere and
    // the snapshot carries no credentials.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/devices", get(devices_snapshot))
        .route("/ws", get(upgrade_viewer))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "ui server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await?;
    Ok(())
}

async fn devices_snapshot(State(state): State<AppState>) -> Json<Vec<SnapshotEntry>> {
    // Display names are best-effort; the device id stands in when the
    // listing is unavailable.
    let names: HashMap<String, String> = match state.cloud.list_devices().await {
        Ok(listing) => listing
            .into_iter()
            .filter_map(|device| device.name.map(|name| (device.id, name)))
            .collect(),
        Err(e) => {
            warn!(error = %e, "device listing unavailable, falling back to ids");
            HashMap::new()
        }
    };

    let connections: Vec<(String, String)> = state
        .registry
        .active_connections()
        .await
        .iter()
        .map(|connection| (connection.short_id.clone(), connection.device_id.clone()))
        .collect();
    let device_states = state.broadcaster.device_states().await;

    Json(build_snapshot(&connections, &names, &device_states))
}

fn build_snapshot(
    connections: &[(String, String)],
    names: &HashMap<String, String>,
    device_states: &HashMap<String, DeviceUiState>,
) -> Vec<SnapshotEntry> {
    connections
        .iter()
        .map(|(short_id, device_id)| {
            let ui_state = device_states.get(device_id).cloned().unwrap_or_default();
            SnapshotEntry {
                short_id: short_id.clone(),
                device_id: device_id.clone(),
                name: names
                    .get(device_id)
                    .cloned()
                    .unwrap_or_else(|| device_id.clone()),
                geolocation: ui_state.fix,
                cell_geolocation: ui_state.cell_location,
                update: ui_state.readings,
                imei: ui_state.imei,
                network_info: ui_state.network_info,
            }
        })
        .collect()
}

/// WebSocket upgrades are accepted unconditionally; a viewer only ever
/// receives updates.
async fn upgrade_viewer(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| run_viewer(socket, peer, state.broadcaster))
}

async fn run_viewer(mut socket: WebSocket, peer: SocketAddr, broadcaster: Arc<UiBroadcaster>) {
    info!(peer = %peer, "viewer connected");
    let mut updates = broadcaster.subscribe();
    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(frame) => {
                        if socket.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    // A lagging viewer misses frames but stays connected.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(peer = %peer, missed = missed, "viewer lagging");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    // Inbound frames from viewers are ignored.
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }
    info!(peer = %peer, "viewer disconnected");
}

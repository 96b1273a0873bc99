//! Routes: the WebSocket endpoint, the small JSON API and the static UI.

use crate::{VERSION, WebPaths, WireEvent, client};
use axum::{
    Router,
    extract::{Multipart, Query, State, WebSocketUpgrade},
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use canbridge_rs::{Command, GatewaySettings};
use crossbeam_channel::Sender;
use log::{info, warn};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::broadcast;

/// Shared per-request state.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) commands: Sender<Command>,
    pub(crate) events: broadcast::Sender<WireEvent>,
    pub(crate) next_client: Arc<AtomicU32>,
    pub(crate) paths: WebPaths,
}

pub(crate) async fn start_web_server(
    addr: SocketAddr,
    commands: Sender<Command>,
    events: broadcast::Sender<WireEvent>,
    paths: WebPaths,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState {
        commands,
        events,
        next_client: Arc::new(AtomicU32::new(1)),
        paths,
    };

    let app = Router::new()
        .route("/ws", get(websocket_handler))
        .route("/version", get(version_handler))
        .route("/devices", get(devices_handler))
        .route("/settings", get(settings_handler))
        .route("/ota/upload", post(ota_upload_handler))
        .fallback(static_handler)
        .with_state(state);

    info!("gateway listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let client = state.next_client.fetch_add(1, Ordering::Relaxed);
    ws.on_upgrade(move |socket| client::handle_socket(socket, state, client))
}

async fn version_handler() -> &'static str {
    VERSION
}

/// Serves the registry file as-is; the protocol thread keeps it current.
async fn devices_handler(State(state): State<AppState>) -> Response {
    let path = state.paths.registry_dir.join("devices.json");
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => match serde_json::from_str::<Value>(&text) {
            Ok(value) => axum::Json(value).into_response(),
            Err(e) => {
                warn!("registry file unreadable as JSON: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        Err(_) => axum::Json(json!({ "devices": {} })).into_response(),
    }
}

/// Reads the persisted settings; with query parameters present, updates
/// and persists them first. Changes take effect on the next start.
async fn settings_handler(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let mut settings = match tokio::fs::read_to_string(&state.paths.settings_path).await {
        Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
        Err(_) => GatewaySettings::default(),
    };

    if !query.is_empty() {
        let parse = |key: &str| query.get(key).and_then(|v| v.parse::<u8>().ok());
        if let Some(v) = parse("canRXPin") {
            settings.can_rx_pin = v;
        }
        if let Some(v) = parse("canTXPin") {
            settings.can_tx_pin = v;
        }
        if let Some(v) = parse("canEnablePin") {
            settings.can_enable_pin = v;
        }
        if let Some(v) = parse("canSpeed") {
            settings.can_speed = v;
        }
        if let Some(v) = parse("scanStartNode") {
            settings.scan_start_node = v;
        }
        if let Some(v) = parse("scanEndNode") {
            settings.scan_end_node = v;
        }
        settings = settings.normalized();
        let serialized = match serde_json::to_string_pretty(&settings) {
            Ok(text) => text,
            Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        };
        if let Err(e) = tokio::fs::write(&state.paths.settings_path, serialized).await {
            warn!("settings not persisted: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        info!("settings updated via HTTP");
    }

    axum::Json(settings).into_response()
}

/// Receives a firmware image, stages it on disk and starts the updater.
async fn ota_upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Response {
    let mut firmware: Option<Vec<u8>> = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => match field.bytes().await {
                Ok(bytes) if !bytes.is_empty() => {
                    firmware = Some(bytes.to_vec());
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("firmware upload failed mid-stream: {}", e);
                    return StatusCode::BAD_REQUEST.into_response();
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!("firmware upload malformed: {}", e);
                return StatusCode::BAD_REQUEST.into_response();
            }
        }
    }
    let Some(firmware) = firmware else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    // The previous image is transient state; replace it.
    let _ = tokio::fs::remove_file(&state.paths.firmware_path).await;
    if let Err(e) = tokio::fs::write(&state.paths.firmware_path, &firmware).await {
        warn!("firmware image not staged: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    info!("firmware image staged, {} bytes", firmware.len());

    let commands = state.commands.clone();
    let submitted = tokio::task::spawn_blocking(move || {
        client::submit(
            &commands,
            Command::StartOta {
                client: None,
                firmware,
            },
        )
    })
    .await
    .unwrap_or(false);

    if submitted {
        "Update started".into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

/// Everything else is a static UI asset: `dist{path}(.gz)?` first, then
/// `{path}(.gz)?`.
async fn static_handler(State(state): State<AppState>, uri: Uri) -> Response {
    let path = match uri.path() {
        "/" => "/index.html",
        other => other,
    };
    if path.contains("..") {
        return StatusCode::NOT_FOUND.into_response();
    }
    let relative = path.trim_start_matches('/');

    let candidates = [
        (state.paths.static_root.join("dist").join(relative), false),
        (
            state
                .paths
                .static_root
                .join("dist")
                .join(format!("{relative}.gz")),
            true,
        ),
        (state.paths.static_root.join(relative), false),
        (state.paths.static_root.join(format!("{relative}.gz")), true),
    ];

    for (candidate, gzipped) in candidates {
        if let Ok(body) = tokio::fs::read(&candidate).await {
            let mut response = ([(header::CONTENT_TYPE, content_type(path))], body).into_response();
            if gzipped {
                response.headers_mut().insert(
                    header::CONTENT_ENCODING,
                    header::HeaderValue::from_static("gzip"),
                );
            }
            return response;
        }
    }
    StatusCode::NOT_FOUND.into_response()
}

fn content_type(path: &str) -> &'static str {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json" | "map") => "application/json",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

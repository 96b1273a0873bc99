//! HTTP/WebSocket transport for the gateway.
//!
//! This crate is intentionally thin: it shuttles envelope strings between
//! browser clients and the protocol thread. All protocol decisions live in
//! the core; the only state here is the per-client fan-out.

mod client;
mod server;

use canbridge_rs::{ClientId, Command, OutboundEvent, envelope};
use crossbeam_channel::{Receiver, Sender};
use log::{error, info};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::broadcast;

/// Version string reported by `GET /version`.
pub const VERSION: &str = "1.1.R-WS";

/// The default port for the gateway UI.
pub const DEFAULT_PORT: u16 = 80;

/// Capacity of the broadcast channel feeding WebSocket clients.
const BROADCAST_CHANNEL_CAPACITY: usize = 32;

/// A serialized envelope plus its delivery scope.
pub type WireEvent = (Option<ClientId>, String);

/// Filesystem locations the HTTP surface serves from.
#[derive(Debug, Clone)]
pub struct WebPaths {
    /// Directory holding `devices.json` and the schema cache.
    pub registry_dir: PathBuf,
    /// The persisted settings file.
    pub settings_path: PathBuf,
    /// Where uploaded firmware images are staged.
    pub firmware_path: PathBuf,
    /// Root of the static UI files (`dist/` is probed first).
    pub static_root: PathBuf,
}

/// Runs the transport: bridges the protocol thread's event queue into a
/// broadcast fan-out and serves HTTP/WebSocket until the listener fails.
///
/// Intended to run on the main tokio runtime while the protocol task runs
/// on its own thread, the two connected only by the bounded channels.
pub async fn serve(
    addr: SocketAddr,
    commands: Sender<Command>,
    events: Receiver<OutboundEvent>,
    paths: WebPaths,
) -> Result<(), Box<dyn std::error::Error>> {
    let (event_tx, _) = broadcast::channel::<WireEvent>(BROADCAST_CHANNEL_CAPACITY);

    // Bridge the blocking crossbeam receive off the async runtime.
    let bridge_tx = event_tx.clone();
    tokio::task::spawn_blocking(move || {
        info!("event bridge running");
        while let Ok(outbound) = events.recv() {
            let payload = envelope::to_envelope(&outbound.event).to_string();
            // A send error only means no client is connected right now.
            let _ = bridge_tx.send((outbound.target, payload));
        }
        info!("event bridge shut down");
    });

    if let Err(e) = server::start_web_server(addr, commands, event_tx, paths).await {
        error!("web server failed: {}", e);
        return Err(e);
    }
    Ok(())
}

//! Runs the full gateway: the protocol task on a dedicated thread over
//! SocketCAN, and the HTTP/WebSocket surface on the main tokio runtime.
//!
//! The two sides share nothing but a pair of bounded channels.
//!
//! Environment:
//!   CANBRIDGE_INTERFACE  CAN interface name (default "can0")
//!   CANBRIDGE_DATA_DIR   registry/settings/firmware directory (default ".")
//!   CANBRIDGE_HTTP_PORT  listen port (default 80)

use canbridge_rs::{Command, ConfigStorage, Gateway, OutboundEvent};
use canbridge_rs_socketcan::{FileConfigStorage, FileRegistryStorage, SocketcanInterface};
use canbridge_rs_web::{DEFAULT_PORT, WebPaths, serve};
use crossbeam_channel::{Receiver, Sender, bounded};
use log::{error, info};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::{env, process, thread};

#[tokio::main]
async fn main() {
    env_logger::try_init().ok();

    let data_dir = PathBuf::from(env::var("CANBRIDGE_DATA_DIR").unwrap_or_else(|_| ".".into()));
    let port = env::var("CANBRIDGE_HTTP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    // 1. The bounded queues joining the transport and protocol sides.
    let (command_tx, command_rx) =
        bounded::<Command>(canbridge_rs::COMMAND_QUEUE_CAPACITY);
    let (event_tx, event_rx) = bounded::<OutboundEvent>(canbridge_rs::EVENT_QUEUE_CAPACITY);

    // 2. The protocol thread owns the bus and every piece of device state.
    let protocol_dir = data_dir.clone();
    thread::spawn(move || {
        if let Err(e) = run_protocol_task(protocol_dir, command_rx, event_tx) {
            error!("[protocol] task failed: {}", e);
            process::exit(1);
        }
    });

    // 3. The web surface runs here and blocks until the listener dies.
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port);
    let paths = WebPaths {
        registry_dir: data_dir.clone(),
        settings_path: data_dir.join("settings.json"),
        firmware_path: data_dir.join("firmware_update.bin"),
        static_root: data_dir.join("web"),
    };
    info!("[web] starting transport on {}", addr);
    if let Err(e) = serve(addr, command_tx, event_rx, paths).await {
        error!("[web] transport failed: {}", e);
        process::exit(1);
    }
}

fn run_protocol_task(
    data_dir: PathBuf,
    commands: Receiver<Command>,
    events: Sender<OutboundEvent>,
) -> Result<(), String> {
    let interface_name =
        env::var("CANBRIDGE_INTERFACE").unwrap_or_else(|_| "can0".to_string());
    info!("[protocol] using interface {}", interface_name);

    let settings = FileConfigStorage::new(data_dir.join("settings.json"))
        .load()
        .map_err(|e| format!("settings unusable: {}", e))?;

    let interface = SocketcanInterface::open(&interface_name)
        .map_err(|e| format!("CAN interface unusable: {}", e))?;
    let storage = FileRegistryStorage::new(&data_dir);

    let mut gateway = Gateway::new(interface, storage, settings, commands, events)
        .map_err(|e| format!("gateway not initialised: {}", e))?;
    gateway.run();
    Ok(())
}

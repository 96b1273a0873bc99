//! Per-connection WebSocket handling: event fan-out with point-to-point
//! filtering, inbound action parsing and lock release on disconnect.

use crate::server::AppState;
use axum::extract::ws::{Message, WebSocket};
use canbridge_rs::dispatch::COMMAND_ENQUEUE_TIMEOUT_MS;
use canbridge_rs::{ClientId, Command, envelope};
use crossbeam_channel::Sender;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

pub(crate) async fn handle_socket(mut socket: WebSocket, state: AppState, client: ClientId) {
    info!("client {} connected", client);
    let mut events = state.events.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok((target, payload)) => {
                    if target.is_none() || target == Some(client) {
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!("client {} lagged, {} events dropped", client, missed);
                }
                Err(RecvError::Closed) => break,
            },
            message = socket.recv() => match message {
                Some(Ok(Message::Text(text))) => {
                    match envelope::parse_action(client, text.as_str()) {
                        Ok(command) => {
                            // The enqueue may block on a full queue; keep
                            // it off the async worker threads.
                            let commands = state.commands.clone();
                            tokio::task::spawn_blocking(move || submit(&commands, command));
                        }
                        Err(e) => {
                            // Malformed input gets no reply, only a log line.
                            debug!("client {} sent unusable message: {}", client, e);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // axum answers pings itself
                Some(Err(_)) => break,
            },
        }
    }

    // Whatever this client held goes back to the pool; the protocol task
    // broadcasts the unlock.
    let commands = state.commands.clone();
    tokio::task::spawn_blocking(move || {
        submit(&commands, Command::ClientDisconnected { client })
    });
    info!("client {} disconnected", client);
}

/// Enqueues one command toward the protocol task, waiting at most the
/// configured enqueue timeout. Failures are logged; the client sees no
/// response, matching how malformed input is treated.
pub(crate) fn submit(commands: &Sender<Command>, command: Command) -> bool {
    match commands.send_timeout(command, Duration::from_millis(COMMAND_ENQUEUE_TIMEOUT_MS)) {
        Ok(()) => true,
        Err(e) => {
            warn!("command not enqueued: {}", e);
            false
        }
    }
}

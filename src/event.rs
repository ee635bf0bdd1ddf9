// MIT License - Copyright (c) 2026 initialed85

use std::net::SocketAddr;

use crate::wire::HardwareAddr;

/// Lifecycle events emitted by the persistent client.
///
/// Users subscribe via `client.subscribe()` to receive a
/// `tokio::sync::broadcast::Receiver<ClientEvent>`.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A device answered a discovery broadcast for the first time
    Discovered {
        mac: HardwareAddr,
        addr: SocketAddr,
        name: String,
    },
    /// A device completed authentication and received a session key
    Authenticated { mac: HardwareAddr },
    /// A device fell out of the table after the expiry window
    Expired { mac: HardwareAddr },
    /// A transport restart was requested (link looked unhealthy)
    RestartRequested,
    /// The transport was rebuilt; known devices are rebound
    RestartComplete,
    /// Restart retries were exhausted; the client is dead and the embedding
    /// process should exit or rebuild it
    Fatal,
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<ClientEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<ClientEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}

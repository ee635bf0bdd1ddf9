// MIT License - Copyright (c) 2026 initialed85

//! Stateful handle bound to one physical device: discovery refresh,
//! authentication, sensor reads and IR learn/send, all built from
//! [`Transport::call`] plus the wire codec.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration, Instant as TokioInstant};
use tracing::debug;

use crate::constants::DEFAULT_KEY;
use crate::error::{BridgeError, Result};
use crate::transport::Transport;
use crate::wire::{self, CommandPayload, HardwareAddr, SensorData};

/// How long to wait between polls for a learned IR code.
const LEARN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-poll reply timeout while waiting for a learned code.
const LEARN_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything known about one physical unit.
///
/// Created from a discovery reply; the name, type and last-seen fields are
/// refreshed on every subsequent sighting of the same hardware address. The
/// numeric ID and session key only exist after a successful auth; an absent
/// key means "not authenticated".
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub name: String,
    pub device_type: u16,
    pub mac: HardwareAddr,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub id: u32,
    pub key: Option<[u8; 16]>,
}

/// Shared reference to the current transport.
///
/// The persistent client swaps the inner `Arc<Transport>` wholesale during a
/// restart; devices read through the lock on every operation rather than
/// capturing the socket once.
pub type TransportHandle = Arc<RwLock<Arc<Transport>>>;

/// A handle bound to one physical device.
pub struct Device {
    transport: TransportHandle,
    identity: Mutex<DeviceIdentity>,
}

impl Device {
    /// Bind a device to a fixed transport.
    pub fn new(transport: Arc<Transport>, identity: DeviceIdentity) -> Self {
        Self::with_handle(Arc::new(RwLock::new(transport)), identity)
    }

    /// Bind a device to a shared, swappable transport handle.
    pub(crate) fn with_handle(transport: TransportHandle, identity: DeviceIdentity) -> Self {
        Self {
            transport,
            identity: Mutex::new(identity),
        }
    }

    async fn transport(&self) -> Arc<Transport> {
        self.transport.read().await.clone()
    }

    /// Snapshot of the current identity.
    pub async fn identity(&self) -> DeviceIdentity {
        self.identity.lock().await.clone()
    }

    pub async fn mac(&self) -> HardwareAddr {
        self.identity.lock().await.mac
    }

    pub async fn addr(&self) -> SocketAddr {
        self.identity.lock().await.addr
    }

    /// Whether a session key is currently held.
    pub async fn is_authenticated(&self) -> bool {
        self.identity.lock().await.key.is_some()
    }

    /// Absorb a fresh discovery sighting: name, type, address and last-seen
    /// are refreshed; the numeric ID and session key are left alone.
    pub(crate) async fn update_sighting(&self, seen: &DeviceIdentity) {
        let mut identity = self.identity.lock().await;
        identity.name = seen.name.clone();
        identity.device_type = seen.device_type;
        identity.addr = seen.addr;
        identity.last_seen = seen.last_seen;
    }

    /// Refresh name/type/last-seen from the device itself via a unicast
    /// discovery exchange.
    pub async fn refresh(&self, timeout: Duration) -> Result<()> {
        let transport = self.transport().await;
        let addr = self.identity.lock().await.addr;

        let (local_ip, local_port) = transport.local_v4();
        let sequence_number = transport.next_sequence_number().await;
        let payload = wire::build_discovery_request(
            chrono::Local::now(),
            local_ip,
            local_port,
            sequence_number,
        );

        let reply = transport.call(addr, payload, sequence_number, timeout).await?;
        let parsed = wire::parse_discovery_reply(&reply.payload)?;

        let mut identity = self.identity.lock().await;
        identity.name = parsed.name;
        identity.device_type = parsed.device_type;
        identity.mac = parsed.mac;
        identity.last_seen = reply.received_at;

        Ok(())
    }

    /// One command round trip: build the frame, send, return the encrypted
    /// reply payload.
    async fn do_command(
        &self,
        payload: &CommandPayload,
        key: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let (device_type, mac, addr, id) = {
            let identity = self.identity.lock().await;
            (
                identity.device_type,
                identity.mac,
                identity.addr,
                identity.id,
            )
        };

        let transport = self.transport().await;
        let sequence_number = transport.next_sequence_number().await;
        let frame =
            wire::build_command_frame(device_type, sequence_number, mac, id, payload, key)?;

        let reply = transport.call(addr, frame, sequence_number, timeout).await?;
        let (_header, encrypted) = wire::split_command_reply(&reply.payload)?;
        Ok(encrypted.to_vec())
    }

    /// Authenticate with the device using the protocol default key.
    ///
    /// On success the device's numeric ID and freshly issued session key are
    /// stored; the key is self-tested first so a garbled reply surfaces here
    /// rather than as undecryptable traffic later.
    pub async fn auth(&self, timeout: Duration) -> Result<()> {
        // Any previously held key is stale the moment we re-auth.
        self.identity.lock().await.key = None;

        let encrypted = self
            .do_command(&CommandPayload::Auth, &DEFAULT_KEY, timeout)
            .await?;
        let plain = wire::decrypt(&encrypted, &DEFAULT_KEY)?;
        let (id, key) = wire::parse_auth_reply(&plain)?;

        wire::self_test_key(&key)?;

        let mut identity = self.identity.lock().await;
        identity.id = id;
        identity.key = Some(key);
        debug!("authenticated {} (device id {})", identity.mac, id);

        Ok(())
    }

    fn session_key(identity: &DeviceIdentity) -> Result<[u8; 16]> {
        identity.key.ok_or(BridgeError::NotAuthenticated)
    }

    /// Authenticated passthrough command: encrypt, send, decrypt, strip the
    /// reply envelope. Returns (reported data length, data bytes).
    async fn send_command(
        &self,
        payload: CommandPayload,
        timeout: Duration,
    ) -> Result<(u16, Vec<u8>)> {
        let key = Self::session_key(&*self.identity.lock().await)?;

        let encrypted = self.do_command(&payload, &key, timeout).await?;
        let plain = wire::decrypt(&encrypted, &key)?;
        let (length, data) = wire::parse_command_reply(&plain)?;
        Ok((length, data.to_vec()))
    }

    /// Read the temperature and humidity sensors.
    ///
    /// Fails fast with [`BridgeError::NotAuthenticated`] (no network I/O)
    /// when no session key is held.
    pub async fn sensor_data(&self, timeout: Duration) -> Result<SensorData> {
        let (_, data) = self
            .send_command(CommandPayload::ReadSensors, timeout)
            .await?;
        wire::parse_sensor_data(&data)
    }

    /// Put the device in learn mode and poll until it captures an IR code or
    /// the overall timeout elapses.
    ///
    /// Failing to *enter* learn mode is fatal; empty polls while waiting for
    /// the user to press a remote button are expected and retried.
    pub async fn learn(&self, timeout: Duration) -> Result<Vec<u8>> {
        // Guard before any network traffic.
        Self::session_key(&*self.identity.lock().await)?;

        let deadline = TokioInstant::now() + timeout;

        self.send_command(CommandPayload::EnterLearn, timeout).await?;

        while TokioInstant::now() < deadline {
            match self
                .send_command(CommandPayload::LastCode, LEARN_POLL_TIMEOUT)
                .await
            {
                Ok((_, data)) => return Ok(data),
                Err(e) => {
                    debug!("no learned code yet ({}); polling again", e);
                    sleep(LEARN_POLL_INTERVAL).await;
                }
            }
        }

        Err(BridgeError::LearnTimeout { timeout })
    }

    /// Transmit a previously learned or precomputed IR code.
    pub async fn send_ir(&self, code: &[u8], timeout: Duration) -> Result<()> {
        let (_, _) = self
            .send_command(CommandPayload::SendIr(code.to_vec()), timeout)
            .await?;
        Ok(())
    }
}

// MIT License - Copyright (c) 2026 initialed85

//! UDP transport: one socket, one reader task, one writer task, and a
//! lock-protected correlation table that matches replies to callers by
//! `(destination address, sequence number)`.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::{sleep_until, timeout, Duration, Instant as TokioInstant};
use tracing::{debug, warn};

use crate::constants::{DISCOVERY_PORT, MIN_REPLY_LEN};
use crate::device::DeviceIdentity;
use crate::error::{BridgeError, Result};
use crate::wire;

/// How often a discovery broadcast is re-sent within the discovery window,
/// to tolerate UDP loss.
const DISCOVERY_RESEND_INTERVAL: Duration = Duration::from_millis(500);

/// Capacity of the outgoing request queue feeding the writer task.
const OUTGOING_QUEUE_CAPACITY: usize = 1024;

/// Correlation key: the only way a reply is matched back to its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    /// Destination the request was sent to (may be the broadcast address)
    pub addr: SocketAddr,
    /// Per-transport wrapping sequence number
    pub sequence_number: u16,
}

/// A reply delivered to a waiting caller.
#[derive(Debug, Clone)]
pub struct Reply {
    pub key: CorrelationKey,
    pub src: SocketAddr,
    pub payload: Vec<u8>,
    pub received_at: Instant,
}

/// Where a pending request's reply goes.
///
/// `Single` slots deliver at most once and leave the table on delivery or on
/// the caller's timeout, whichever wins. `Shared` slots collect every reply
/// for a discovery window and are removed by the discovering caller when the
/// window closes.
enum ReplySink {
    Single(oneshot::Sender<Result<Reply>>),
    Shared(mpsc::UnboundedSender<Result<Reply>>),
}

struct OutgoingRequest {
    key: CorrelationKey,
    payload: Vec<u8>,
}

/// Transport configuration. The default discovery destination is the
/// all-ones broadcast address on port 80, which is what real devices listen
/// on; tests point it at a scripted responder instead.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub discovery_addr: SocketAddr,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            discovery_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DISCOVERY_PORT),
        }
    }
}

struct Shared {
    socket: UdpSocket,
    pending: Mutex<HashMap<CorrelationKey, ReplySink>>,
    sequence_number: Mutex<u16>,
}

/// Owns exactly one UDP socket and multiplexes concurrent requests over it.
pub struct Transport {
    shared: Arc<Shared>,
    config: TransportConfig,
    local_addr: SocketAddr,
    outgoing_tx: mpsc::Sender<OutgoingRequest>,
    shutdown_tx: watch::Sender<bool>,
    reader_handle: tokio::task::JoinHandle<()>,
    writer_handle: tokio::task::JoinHandle<()>,
}

impl Transport {
    /// Bind an ephemeral UDP port and start the reader and writer tasks.
    pub async fn new() -> Result<Self> {
        Self::with_config(TransportConfig::default()).await
    }

    pub async fn with_config(config: TransportConfig) -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;

        // Initial value only matters in that concurrent instances shouldn't
        // collide; monotonicity per instance is what correlation relies on.
        let initial_seq = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as u16;

        let shared = Arc::new(Shared {
            socket,
            pending: Mutex::new(HashMap::new()),
            sequence_number: Mutex::new(initial_seq),
        });

        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reader_handle =
            spawn_reader_task(shared.clone(), config.discovery_addr.ip(), shutdown_rx.clone());
        let writer_handle = spawn_writer_task(shared.clone(), outgoing_rx, shutdown_rx);

        debug!("transport bound to {}", local_addr);

        Ok(Self {
            shared,
            config,
            local_addr,
            outgoing_tx,
            shutdown_tx,
            reader_handle,
            writer_handle,
        })
    }

    /// The local socket address (port is ephemeral).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn local_v4(&self) -> (Ipv4Addr, u16) {
        match self.local_addr.ip() {
            IpAddr::V4(ip) => (ip, self.local_addr.port()),
            IpAddr::V6(_) => (Ipv4Addr::UNSPECIFIED, self.local_addr.port()),
        }
    }

    /// Assign the next sequence number. Callers embed it in the frame they
    /// build and pass it back to [`Transport::call`].
    pub async fn next_sequence_number(&self) -> u16 {
        let mut seq = self.shared.sequence_number.lock().await;
        let current = *seq;
        *seq = seq.wrapping_add(1);
        current
    }

    fn check_running(&self) -> Result<()> {
        if *self.shutdown_tx.borrow() {
            return Err(BridgeError::Shutdown);
        }
        Ok(())
    }

    /// Send one datagram and wait for the correlated reply.
    ///
    /// At-most-once delivery: either the reader task hands the reply to this
    /// caller and removes the table entry, or the timeout fires here and the
    /// caller reclaims its own entry. Never both.
    pub async fn call(
        &self,
        dst: SocketAddr,
        payload: Vec<u8>,
        sequence_number: u16,
        call_timeout: Duration,
    ) -> Result<Reply> {
        self.check_running()?;

        let key = CorrelationKey {
            addr: dst,
            sequence_number,
        };

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .await
            .insert(key, ReplySink::Single(tx));

        if let Err(e) = self.enqueue(OutgoingRequest { key, payload }) {
            self.shared.pending.lock().await.remove(&key);
            return Err(e);
        }

        match timeout(call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                // Sender dropped without delivering: table cleared by shutdown.
                self.shared.pending.lock().await.remove(&key);
                Err(BridgeError::ChannelClosed)
            }
            Err(_) => {
                self.shared.pending.lock().await.remove(&key);
                Err(BridgeError::CallTimeout {
                    timeout: call_timeout,
                })
            }
        }
    }

    fn enqueue(&self, request: OutgoingRequest) -> Result<()> {
        self.outgoing_tx.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BridgeError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => BridgeError::Shutdown,
        })
    }

    /// Broadcast discovery for the whole window, re-sending every 500 ms,
    /// then drain and de-duplicate the replies by hardware address.
    pub async fn discover(&self, window: Duration) -> Result<Vec<DeviceIdentity>> {
        self.check_running()?;

        let dst = self.config.discovery_addr;
        let (local_ip, local_port) = self.local_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registered: Vec<CorrelationKey> = Vec::new();

        let deadline = TokioInstant::now() + window;
        loop {
            let sequence_number = self.next_sequence_number().await;
            let payload =
                wire::build_discovery_request(Local::now(), local_ip, local_port, sequence_number);

            let key = CorrelationKey {
                addr: dst,
                sequence_number,
            };
            self.shared
                .pending
                .lock()
                .await
                .insert(key, ReplySink::Shared(tx.clone()));
            registered.push(key);

            if let Err(e) = self.enqueue(OutgoingRequest {
                key,
                payload,
            }) {
                self.remove_keys(&registered).await;
                return Err(e);
            }

            let next_send = TokioInstant::now() + DISCOVERY_RESEND_INTERVAL;
            if next_send >= deadline {
                sleep_until(deadline).await;
                break;
            }
            sleep_until(next_send).await;
        }

        // The window is over: the waiters are giving up, so their table
        // entries go too.
        self.remove_keys(&registered).await;
        drop(tx);

        let mut devices: Vec<DeviceIdentity> = Vec::new();
        while let Ok(result) = rx.try_recv() {
            let reply = match result {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("discovery reply carried an error: {}; skipping", e);
                    continue;
                }
            };

            let parsed = match wire::parse_discovery_reply(&reply.payload) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(
                        "malformed discovery reply from {}: {}; skipping",
                        reply.src, e
                    );
                    continue;
                }
            };

            if devices.iter().any(|d| d.mac == parsed.mac) {
                continue;
            }

            devices.push(DeviceIdentity {
                name: parsed.name,
                device_type: parsed.device_type,
                mac: parsed.mac,
                addr: reply.src,
                last_seen: reply.received_at,
                id: 0,
                key: None,
            });
        }

        Ok(devices)
    }

    async fn remove_keys(&self, keys: &[CorrelationKey]) {
        let mut pending = self.shared.pending.lock().await;
        for key in keys {
            pending.remove(key);
        }
    }

    /// Stop the reader and writer tasks and fail every in-flight call.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let mut pending = self.shared.pending.lock().await;
        for (_, sink) in pending.drain() {
            match sink {
                ReplySink::Single(tx) => {
                    let _ = tx.send(Err(BridgeError::Shutdown));
                }
                ReplySink::Shared(_) => {}
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn pending_len(&self) -> usize {
        self.shared.pending.lock().await.len()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

/// Reader task: one datagram at a time, demultiplexed to the waiting caller.
fn spawn_reader_task(
    shared: Arc<Shared>,
    discovery_ip: IpAddr,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];

        loop {
            let (n, src) = tokio::select! {
                result = shared.socket.recv_from(&mut buf) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("reader: failed to read from socket: {}; retrying", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("reader task shutting down");
                        return;
                    }
                    continue;
                }
            };

            let payload = &buf[..n];

            let sequence_number = match wire::reply_sequence_number(payload) {
                Ok(seq) => seq,
                Err(_) => {
                    warn!(
                        "reader: {} byte datagram from {} too short for a sequence number",
                        n, src
                    );
                    continue;
                }
            };

            let mut pending = shared.pending.lock().await;

            // Discovery replies arrive from per-device unicast addresses but
            // were requested against the configured discovery (broadcast)
            // address, hence the fallback lookup.
            let direct_key = CorrelationKey {
                addr: src,
                sequence_number,
            };
            let broadcast_key = CorrelationKey {
                addr: SocketAddr::new(discovery_ip, src.port()),
                sequence_number,
            };

            let key = if pending.contains_key(&direct_key) {
                direct_key
            } else if pending.contains_key(&broadcast_key) {
                broadcast_key
            } else {
                warn!(
                    "reader: no pending request for {} bytes from {} (sequence number {})",
                    n, src, sequence_number
                );
                continue;
            };

            let result = match wire::reply_firmware_error(payload) {
                Ok(None) => Ok(Reply {
                    key,
                    src,
                    payload: payload.to_vec(),
                    received_at: Instant::now(),
                }),
                Ok(Some(code)) => Err(BridgeError::Firmware(code)),
                Err(e) => Err(e),
            };

            match pending.get(&key) {
                Some(ReplySink::Single(_)) => {
                    if let Some(ReplySink::Single(tx)) = pending.remove(&key) {
                        let _ = tx.send(result);
                    }
                }
                Some(ReplySink::Shared(tx)) => {
                    // Many devices may answer one broadcast; the entry stays
                    // until the discovery window closes.
                    let _ = tx.send(result);
                }
                None => {}
            }
        }
    })
}

/// Writer task: the single path through which datagrams leave the socket.
fn spawn_writer_task(
    shared: Arc<Shared>,
    mut outgoing_rx: mpsc::Receiver<OutgoingRequest>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                request = outgoing_rx.recv() => match request {
                    Some(request) => request,
                    None => return,
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("writer task shutting down");
                        return;
                    }
                    continue;
                }
            };

            if let Err(e) = shared
                .socket
                .send_to(&request.payload, request.key.addr)
                .await
            {
                warn!("writer: failed to send to {}: {}", request.key.addr, e);
                let mut pending = shared.pending.lock().await;
                if let Some(sink) = pending.remove(&request.key) {
                    match sink {
                        ReplySink::Single(tx) => {
                            let _ = tx.send(Err(BridgeError::Io(e)));
                        }
                        ReplySink::Shared(tx) => {
                            let _ = tx.send(Err(BridgeError::Io(e)));
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{OFF_ERROR_CODE, OFF_SEQUENCE};
    use crate::wire::HardwareAddr;

    /// Minimal valid reply frame: zero error code, given sequence number.
    fn reply_frame(sequence_number: u16) -> Vec<u8> {
        let mut frame = vec![0u8; MIN_REPLY_LEN];
        frame[OFF_SEQUENCE..OFF_SEQUENCE + 2].copy_from_slice(&sequence_number.to_le_bytes());
        frame
    }

    fn discovery_reply_frame(sequence_number: u16, mac: HardwareAddr, name: &str) -> Vec<u8> {
        let mut frame = vec![0u8; 0x40 + name.len() + 1];
        frame[OFF_SEQUENCE..OFF_SEQUENCE + 2].copy_from_slice(&sequence_number.to_le_bytes());
        frame[0x34..0x36].copy_from_slice(&0x2712u16.to_le_bytes());
        frame[0x3a..0x40].copy_from_slice(&mac.to_wire());
        frame[0x40..0x40 + name.len()].copy_from_slice(name.as_bytes());
        frame
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let transport = Transport::new().await.unwrap();
        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let echo = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let (n, src) = peer.recv_from(&mut buf).await.unwrap();
            let seq = u16::from_le_bytes([buf[OFF_SEQUENCE], buf[OFF_SEQUENCE + 1]]);
            assert!(n >= MIN_REPLY_LEN);
            peer.send_to(&reply_frame(seq), src).await.unwrap();
        });

        let seq = transport.next_sequence_number().await;
        let reply = transport
            .call(peer_addr, reply_frame(seq), seq, Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(reply.src, peer_addr);
        assert_eq!(reply.key.sequence_number, seq);
        assert_eq!(transport.pending_len().await, 0);
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_calls_each_get_their_own_reply() {
        let transport = Arc::new(Transport::new().await.unwrap());
        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let n_calls = 8;

        // Echo every request back, in bursts, preserving each sequence number.
        let echo = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            for _ in 0..n_calls {
                let (_, src) = peer.recv_from(&mut buf).await.unwrap();
                let seq = u16::from_le_bytes([buf[OFF_SEQUENCE], buf[OFF_SEQUENCE + 1]]);
                peer.send_to(&reply_frame(seq), src).await.unwrap();
            }
        });

        let mut handles = Vec::new();
        for _ in 0..n_calls {
            let transport = transport.clone();
            handles.push(tokio::spawn(async move {
                let seq = transport.next_sequence_number().await;
                let reply = transport
                    .call(peer_addr, reply_frame(seq), seq, Duration::from_secs(2))
                    .await
                    .unwrap();
                assert_eq!(reply.key.sequence_number, seq);
                seq
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap()));
        }

        assert_eq!(transport.pending_len().await, 0);
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_residual_entry() {
        let transport = Transport::new().await.unwrap();
        // A peer that never answers.
        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let seq = transport.next_sequence_number().await;
        let result = transport
            .call(peer_addr, reply_frame(seq), seq, Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(BridgeError::CallTimeout { .. })));
        assert_eq!(transport.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_firmware_error_reply_surfaces_as_error() {
        let transport = Transport::new().await.unwrap();
        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let (_, src) = peer.recv_from(&mut buf).await.unwrap();
            let seq = u16::from_le_bytes([buf[OFF_SEQUENCE], buf[OFF_SEQUENCE + 1]]);
            let mut frame = reply_frame(seq);
            frame[OFF_ERROR_CODE..OFF_ERROR_CODE + 2].copy_from_slice(&(-1i16).to_le_bytes());
            peer.send_to(&frame, src).await.unwrap();
        });

        let seq = transport.next_sequence_number().await;
        let result = transport
            .call(peer_addr, reply_frame(seq), seq, Duration::from_secs(2))
            .await;

        assert!(matches!(
            result,
            Err(BridgeError::Firmware(
                crate::error::FirmwareErrorCode::AuthenticationFailed
            ))
        ));
        assert_eq!(transport.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_fallback_lookup() {
        let transport = Transport::new().await.unwrap();
        let local_addr = transport.local_addr();
        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let peer_port = peer.local_addr().unwrap().port();

        // Request went to the broadcast address; the reply comes back from a
        // unicast source with the same port.
        let dst = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), peer_port);
        let seq = transport.next_sequence_number().await;

        let replier = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            peer.send_to(&reply_frame(seq), local_addr).await.unwrap();
        });

        let reply = transport
            .call(dst, reply_frame(seq), seq, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply.key.addr, dst);
        assert_eq!(transport.pending_len().await, 0);
        replier.await.unwrap();
    }

    #[tokio::test]
    async fn test_fallback_follows_configured_discovery_address() {
        // A subnet-broadcast discovery destination instead of all-ones; the
        // reader's fallback lookup must key on the configured address.
        let discovery_ip = Ipv4Addr::new(127, 255, 255, 255);
        let transport = Transport::with_config(TransportConfig {
            discovery_addr: SocketAddr::new(IpAddr::V4(discovery_ip), DISCOVERY_PORT),
        })
        .await
        .unwrap();
        let local_addr = transport.local_addr();
        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let peer_port = peer.local_addr().unwrap().port();

        let dst = SocketAddr::new(IpAddr::V4(discovery_ip), peer_port);
        let seq = transport.next_sequence_number().await;

        let replier = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            peer.send_to(&reply_frame(seq), local_addr).await.unwrap();
        });

        let reply = transport
            .call(dst, reply_frame(seq), seq, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply.key.addr, dst);
        assert_eq!(transport.pending_len().await, 0);
        replier.await.unwrap();
    }

    #[tokio::test]
    async fn test_discover_deduplicates_by_hardware_address() {
        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let transport = Transport::with_config(TransportConfig {
            discovery_addr: peer_addr,
        })
        .await
        .unwrap();

        let mac: HardwareAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();

        // Answer every broadcast in the window from the same device.
        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut answered = 0;
            while answered < 3 {
                let received =
                    tokio::time::timeout(Duration::from_secs(3), peer.recv_from(&mut buf)).await;
                let (_, src) = match received {
                    Ok(Ok(received)) => received,
                    _ => break,
                };
                let seq = u16::from_le_bytes([buf[OFF_SEQUENCE], buf[OFF_SEQUENCE + 1]]);
                peer.send_to(&discovery_reply_frame(seq, mac, "RM Mini"), src)
                    .await
                    .unwrap();
                answered += 1;
            }
        });

        let devices = transport.discover(Duration::from_millis(1200)).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].mac, mac);
        assert_eq!(devices[0].name, "RM Mini");
        assert_eq!(devices[0].device_type, 0x2712);
        assert_eq!(transport.pending_len().await, 0);
        responder.abort();
    }

    #[tokio::test]
    async fn test_shutdown_fails_in_flight_calls() {
        let transport = Arc::new(Transport::new().await.unwrap());
        let peer = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let seq = transport.next_sequence_number().await;
        let caller = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .call(peer_addr, reply_frame(seq), seq, Duration::from_secs(10))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        transport.shutdown().await;

        let result = caller.await.unwrap();
        assert!(matches!(result, Err(BridgeError::Shutdown)));

        // New calls fail fast once shut down.
        let seq = transport.next_sequence_number().await;
        assert!(matches!(
            transport
                .call(peer_addr, reply_frame(seq), seq, Duration::from_secs(1))
                .await,
            Err(BridgeError::Shutdown)
        ));
    }
}

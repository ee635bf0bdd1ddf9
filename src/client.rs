// MIT License - Copyright (c) 2026 initialed85

//! Self-healing client: periodic discovery, authentication of newly seen
//! devices, expiry of stale ones, and serialized transport restarts that
//! known devices survive without losing their session keys.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::device::{Device, TransportHandle};
use crate::error::{BridgeError, Result};
use crate::event::{event_channel, ClientEvent, EventReceiver, EventSender};
use crate::transport::{Transport, TransportConfig};
use crate::wire::HardwareAddr;

/// Supervision policy. The defaults are the reference policy; tests shrink
/// the windows.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transport: TransportConfig,
    /// Discovery cadence starts here after a (re)start...
    pub discovery_interval_start: Duration,
    /// ...grows by this much each cycle...
    pub discovery_interval_step: Duration,
    /// ...and never exceeds this.
    pub discovery_interval_ceiling: Duration,
    /// Per-device authentication timeout during the discovery cycle.
    pub auth_timeout: Duration,
    /// Devices unseen for this long fall out of the table.
    pub expiry_window: Duration,
    /// Transport rebuild attempts before giving up for good.
    pub restart_attempts: u32,
    /// Delay between rebuild attempts.
    pub restart_retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            discovery_interval_start: Duration::from_millis(100),
            discovery_interval_step: Duration::from_millis(100),
            discovery_interval_ceiling: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(5),
            expiry_window: Duration::from_secs(30),
            restart_attempts: 10,
            restart_retry_delay: Duration::from_secs(1),
        }
    }
}

struct Inner {
    config: ClientConfig,
    /// The one reference every device reads the current transport through;
    /// restarts swap the inner Arc wholesale.
    transport: TransportHandle,
    devices: Mutex<HashMap<HardwareAddr, Arc<Device>>>,
    restart_tx: mpsc::Sender<()>,
    /// Bumped after each successful restart so the discovery loop resets its
    /// cadence to the fast rate.
    restart_generation: watch::Sender<u64>,
    /// Set once restart retries are exhausted; every operation fails after.
    dead: RwLock<bool>,
    event_tx: EventSender,
}

impl Inner {
    async fn check_alive(&self) -> Result<()> {
        if *self.dead.read().await {
            return Err(BridgeError::RestartsExhausted {
                attempts: self.config.restart_attempts,
            });
        }
        Ok(())
    }

    async fn current_transport(&self) -> Arc<Transport> {
        self.transport.read().await.clone()
    }

    /// Non-blocking restart request. Requests while a restart is already
    /// queued or running are coalesced.
    fn request_restart(&self) {
        if self.restart_tx.try_send(()).is_ok() {
            let _ = self.event_tx.send(ClientEvent::RestartRequested);
        }
    }
}

/// Supervisor that keeps discovery, authentication and the transport alive
/// across network churn.
pub struct PersistentClient {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
    discovery_handle: tokio::task::JoinHandle<()>,
    restart_handle: tokio::task::JoinHandle<()>,
}

impl PersistentClient {
    pub async fn new() -> Result<Self> {
        Self::with_config(ClientConfig::default()).await
    }

    pub async fn with_config(config: ClientConfig) -> Result<Self> {
        let transport = Arc::new(Transport::with_config(config.transport.clone()).await?);
        let (event_tx, _) = event_channel(256);
        let (restart_tx, restart_rx) = mpsc::channel(1);
        let (generation_tx, _) = watch::channel(0u64);

        let inner = Arc::new(Inner {
            config,
            transport: Arc::new(RwLock::new(transport)),
            devices: Mutex::new(HashMap::new()),
            restart_tx,
            restart_generation: generation_tx,
            dead: RwLock::new(false),
            event_tx,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let discovery_handle = spawn_discovery_loop(inner.clone(), shutdown_rx.clone());
        let restart_handle = spawn_restart_loop(inner.clone(), restart_rx, shutdown_rx);

        Ok(Self {
            inner,
            shutdown_tx,
            discovery_handle,
            restart_handle,
        })
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> EventReceiver {
        self.inner.event_tx.subscribe()
    }

    /// Ask for a transport restart. Never blocks; concurrent requests while
    /// one is in flight are coalesced.
    pub fn request_restart(&self) {
        self.inner.request_restart();
    }

    /// Snapshot of all known (authenticated) devices.
    pub async fn devices(&self) -> Vec<PersistentDevice> {
        let devices = self.inner.devices.lock().await;
        devices
            .values()
            .map(|device| PersistentDevice {
                device: device.clone(),
                inner: self.inner.clone(),
            })
            .collect()
    }

    /// Look up a device by hardware address.
    pub async fn device_for_mac(&self, mac: HardwareAddr) -> Result<PersistentDevice> {
        let devices = self.inner.devices.lock().await;
        match devices.get(&mac) {
            Some(device) => Ok(PersistentDevice {
                device: device.clone(),
                inner: self.inner.clone(),
            }),
            None => Err(BridgeError::DeviceNotFound {
                wanted: mac.to_string(),
                known: known_macs(&devices),
            }),
        }
    }

    /// Look up a device by the IP address it was discovered at.
    pub async fn device_for_ip(&self, ip: IpAddr) -> Result<PersistentDevice> {
        let devices = self.inner.devices.lock().await;
        let mut ips = Vec::new();
        for device in devices.values() {
            let addr = device.addr().await;
            if addr.ip() == ip {
                return Ok(PersistentDevice {
                    device: device.clone(),
                    inner: self.inner.clone(),
                });
            }
            ips.push(addr.ip().to_string());
        }
        Err(BridgeError::DeviceNotFound {
            wanted: ip.to_string(),
            known: ips.join(", "),
        })
    }

    /// Tear down the supervisor tasks and the current transport.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.inner.current_transport().await.shutdown().await;
    }
}

impl Drop for PersistentClient {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.discovery_handle.abort();
        self.restart_handle.abort();
    }
}

fn known_macs(devices: &HashMap<HardwareAddr, Arc<Device>>) -> String {
    let mut macs: Vec<String> = devices.keys().map(|mac| mac.to_string()).collect();
    macs.sort();
    macs.join(", ")
}

/// Discovery/expiry loop: broadcast, auth the newly seen, expire the stale,
/// back the cadence off from the fast rate to the ceiling.
fn spawn_discovery_loop(
    inner: Arc<Inner>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = inner.config.discovery_interval_start;
        let mut generation_rx = inner.restart_generation.subscribe();

        loop {
            if *shutdown_rx.borrow() || *inner.dead.read().await {
                return;
            }

            let transport = inner.current_transport().await;

            match transport.discover(interval).await {
                Ok(seen) => {
                    let mut attempted = 0u32;
                    let mut succeeded = 0u32;

                    for identity in seen {
                        let existing = {
                            let devices = inner.devices.lock().await;
                            devices.get(&identity.mac).cloned()
                        };

                        if let Some(device) = existing {
                            device.update_sighting(&identity).await;
                            continue;
                        }

                        info!(
                            "discovered {} @ {} ({:?})",
                            identity.mac, identity.addr, identity.name
                        );
                        let _ = inner.event_tx.send(ClientEvent::Discovered {
                            mac: identity.mac,
                            addr: identity.addr,
                            name: identity.name.clone(),
                        });

                        let mac = identity.mac;
                        let device =
                            Arc::new(Device::with_handle(inner.transport.clone(), identity));

                        attempted += 1;
                        if let Err(e) = device.auth(inner.config.auth_timeout).await {
                            warn!("failed to auth {}: {}; ignoring until next cycle", mac, e);
                            continue;
                        }
                        succeeded += 1;

                        let _ = inner.event_tx.send(ClientEvent::Authenticated { mac });
                        inner.devices.lock().await.insert(mac, device);
                    }

                    if attempted > 0 && succeeded == 0 {
                        warn!(
                            "saw {} new devices but authenticated none; requesting restart",
                            attempted
                        );
                        inner.request_restart();
                    }
                }
                Err(e) => {
                    warn!("discovery failed: {}; requesting restart", e);
                    inner.request_restart();
                }
            }

            // Expiry sweep.
            {
                let mut devices = inner.devices.lock().await;
                let mut expired = Vec::new();
                for (mac, device) in devices.iter() {
                    let identity = device.identity().await;
                    if identity.last_seen.elapsed() > inner.config.expiry_window {
                        expired.push((*mac, identity.addr, identity.name));
                    }
                }
                for (mac, addr, name) in expired {
                    devices.remove(&mac);
                    info!("expired {} @ {} ({:?})", mac, addr, name);
                    let _ = inner.event_tx.send(ClientEvent::Expired { mac });
                }
            }

            // A completed restart resets the cadence to the fast rate.
            if generation_rx.has_changed().unwrap_or(false) {
                generation_rx.mark_unchanged();
                interval = inner.config.discovery_interval_start;
            } else if interval < inner.config.discovery_interval_ceiling {
                interval = (interval + inner.config.discovery_interval_step)
                    .min(inner.config.discovery_interval_ceiling);
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
                // The discovery window itself provides most of the pacing;
                // yield briefly so expiry keeps running even when the window
                // is tiny.
                _ = sleep(Duration::from_millis(10)) => {}
            }
        }
    })
}

/// Restart loop: single-flight transport rebuilds with bounded retries.
/// Exhausting the retries is fatal for the whole client.
fn spawn_restart_loop(
    inner: Arc<Inner>,
    mut restart_rx: mpsc::Receiver<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
                request = restart_rx.recv() => {
                    if request.is_none() {
                        return;
                    }
                    // A request that was already queued when shutdown fired
                    // must not rebuild the transport.
                    if *shutdown_rx.borrow() {
                        return;
                    }

                    let attempts = inner.config.restart_attempts;
                    let mut restarted = false;

                    for attempt in 1..=attempts {
                        match Transport::with_config(inner.config.transport.clone()).await {
                            Ok(new_transport) => {
                                let old = {
                                    let mut current = inner.transport.write().await;
                                    std::mem::replace(&mut *current, Arc::new(new_transport))
                                };
                                old.shutdown().await;

                                info!("transport restarted (attempt {}/{})", attempt, attempts);
                                inner.restart_generation.send_modify(|g| *g += 1);
                                let _ = inner.event_tx.send(ClientEvent::RestartComplete);
                                restarted = true;
                                break;
                            }
                            Err(e) if attempt < attempts => {
                                warn!(
                                    "attempt {}/{} to restart transport failed: {}; trying again",
                                    attempt, attempts, e
                                );
                                sleep(inner.config.restart_retry_delay).await;
                            }
                            Err(e) => {
                                error!(
                                    "attempt {}/{} to restart transport failed: {}; giving up",
                                    attempt, attempts, e
                                );
                            }
                        }
                    }

                    if !restarted {
                        *inner.dead.write().await = true;
                        let _ = inner.event_tx.send(ClientEvent::Fatal);
                        return;
                    }
                }
            }
        }
    })
}

/// A device handle that survives transport restarts.
///
/// Every operation retries once through a fresh auth when the first attempt
/// fails, and escalates a restart request when the retry fails too. Callers
/// get operation-level resilience without knowing about restarts.
#[derive(Clone)]
pub struct PersistentDevice {
    device: Arc<Device>,
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PersistentDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentDevice").finish_non_exhaustive()
    }
}

impl PersistentDevice {
    pub async fn identity(&self) -> crate::device::DeviceIdentity {
        self.device.identity().await
    }

    pub async fn mac(&self) -> HardwareAddr {
        self.device.mac().await
    }

    /// Refresh the device's identity via unicast discovery.
    pub async fn refresh(&self, timeout: Duration) -> Result<()> {
        self.inner.check_alive().await?;

        match self.device.refresh(timeout).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.request_restart();
                Err(e)
            }
        }
    }

    /// Re-run authentication explicitly.
    pub async fn auth(&self, timeout: Duration) -> Result<()> {
        self.inner.check_alive().await?;

        match self.device.auth(timeout).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.request_restart();
                Err(e)
            }
        }
    }

    pub async fn sensor_data(&self, timeout: Duration) -> Result<crate::wire::SensorData> {
        self.inner.check_alive().await?;
        self.with_reauth_retry(timeout, |device| async move {
            device.sensor_data(timeout).await
        })
        .await
    }

    pub async fn learn(&self, timeout: Duration) -> Result<Vec<u8>> {
        self.inner.check_alive().await?;
        self.with_reauth_retry(timeout, |device| async move { device.learn(timeout).await })
            .await
    }

    pub async fn send_ir(&self, code: &[u8], timeout: Duration) -> Result<()> {
        self.inner.check_alive().await?;
        let code = code.to_vec();
        self.with_reauth_retry(timeout, move |device| {
            let code = code.clone();
            async move { device.send_ir(&code, timeout).await }
        })
        .await
    }

    /// Run an operation; on failure re-auth once and retry; on a failed
    /// retry, escalate a restart request and propagate the error.
    async fn with_reauth_retry<T, F, Fut>(&self, timeout: Duration, op: F) -> Result<T>
    where
        F: Fn(Arc<Device>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let first = op(self.device.clone()).await;
        let err = match first {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        debug!(
            "operation on {} failed ({}); re-authenticating and retrying once",
            self.device.mac().await,
            err
        );

        if let Err(auth_err) = self.device.auth(timeout).await {
            self.inner.request_restart();
            return Err(auth_err);
        }

        match op(self.device.clone()).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.inner.request_restart();
                Err(e)
            }
        }
    }
}

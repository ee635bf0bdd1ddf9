// MIT License - Copyright (c) 2026 initialed85

//! End-to-end tests against a scripted UDP device that answers discovery,
//! authentication and sensor reads with byte-accurate frames.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Duration};

use broadlink_lan_bridge::constants::{
    CMD_AUTH, CMD_PASSTHROUGH, DISCOVERY_REQUEST_LEN, HEADER_LEN, OFF_COMMAND_CODE, OFF_REPLY_MAC,
    OFF_REPLY_NAME, OFF_REPLY_DEVICE_TYPE, OFF_SEQUENCE, OP_READ_SENSORS,
};
use broadlink_lan_bridge::{
    wire, ClientConfig, ClientEvent, HardwareAddr, PersistentClient, TransportConfig,
};

const FAKE_MAC: &str = "aa:bb:cc:dd:ee:ff";
const FAKE_NAME: &str = "Bedroom RM Mini";
const FAKE_DEVICE_TYPE: u16 = 0x2712;
const FAKE_DEVICE_ID: u32 = 0x00c0ffee;
const SESSION_KEY: [u8; 16] = [
    0x5a, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
];
const DEFAULT_KEY: [u8; 16] = [
    0x09, 0x76, 0x28, 0x34, 0x3f, 0xe9, 0x9e, 0x23, 0x76, 0x5c, 0x15, 0x13, 0xac, 0xcf, 0x8b, 0x02,
];

struct FakeDevice {
    addr: SocketAddr,
    answer_discovery: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn reply_header(sequence_number: u16) -> Vec<u8> {
    let mut header = vec![0u8; HEADER_LEN];
    header[OFF_SEQUENCE..OFF_SEQUENCE + 2].copy_from_slice(&sequence_number.to_le_bytes());
    header
}

fn discovery_reply(sequence_number: u16) -> Vec<u8> {
    let mac: HardwareAddr = FAKE_MAC.parse().unwrap();
    let mut frame = vec![0u8; OFF_REPLY_NAME + FAKE_NAME.len() + 1];
    frame[OFF_SEQUENCE..OFF_SEQUENCE + 2].copy_from_slice(&sequence_number.to_le_bytes());
    frame[OFF_REPLY_DEVICE_TYPE..OFF_REPLY_DEVICE_TYPE + 2]
        .copy_from_slice(&FAKE_DEVICE_TYPE.to_le_bytes());
    frame[OFF_REPLY_MAC..OFF_REPLY_MAC + 6].copy_from_slice(&mac.to_wire());
    frame[OFF_REPLY_NAME..OFF_REPLY_NAME + FAKE_NAME.len()].copy_from_slice(FAKE_NAME.as_bytes());
    frame
}

fn auth_reply(sequence_number: u16) -> Vec<u8> {
    let mut plain = vec![0u8; 0x14];
    plain[0..4].copy_from_slice(&FAKE_DEVICE_ID.to_le_bytes());
    plain[0x04..0x14].copy_from_slice(&SESSION_KEY);

    let mut frame = reply_header(sequence_number);
    frame.extend_from_slice(&wire::encrypt(&plain, &DEFAULT_KEY).unwrap());
    frame
}

fn sensor_reply(sequence_number: u16) -> Vec<u8> {
    let mut plain = vec![0u8; 0x0a];
    plain[0..2].copy_from_slice(&0x0au16.to_le_bytes());
    // 24.50 C, 55.0 % relative humidity
    plain[0x06..0x0a].copy_from_slice(&[24, 50, 55, 0]);

    let mut frame = reply_header(sequence_number);
    frame.extend_from_slice(&wire::encrypt(&plain, &SESSION_KEY).unwrap());
    frame
}

async fn spawn_fake_device() -> FakeDevice {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let answer_discovery = Arc::new(AtomicBool::new(true));
    let discovery_flag = answer_discovery.clone();

    let handle = tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let (n, src) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(_) => return,
            };
            let datagram = &buf[..n];

            if n == DISCOVERY_REQUEST_LEN {
                if !discovery_flag.load(Ordering::SeqCst) {
                    continue;
                }
                let seq = u16::from_le_bytes([datagram[OFF_SEQUENCE], datagram[OFF_SEQUENCE + 1]]);
                socket.send_to(&discovery_reply(seq), src).await.unwrap();
                continue;
            }

            if n <= HEADER_LEN {
                continue;
            }
            let seq = u16::from_le_bytes([datagram[OFF_SEQUENCE], datagram[OFF_SEQUENCE + 1]]);
            let command =
                u16::from_le_bytes([datagram[OFF_COMMAND_CODE], datagram[OFF_COMMAND_CODE + 1]]);

            match command {
                CMD_AUTH => {
                    socket.send_to(&auth_reply(seq), src).await.unwrap();
                }
                CMD_PASSTHROUGH => {
                    let plain = wire::decrypt(&datagram[HEADER_LEN..], &SESSION_KEY).unwrap();
                    let opcode =
                        u32::from_le_bytes([plain[2], plain[3], plain[4], plain[5]]);
                    if opcode == OP_READ_SENSORS {
                        socket.send_to(&sensor_reply(seq), src).await.unwrap();
                    }
                }
                _ => {}
            }
        }
    });

    FakeDevice {
        addr,
        answer_discovery,
        handle,
    }
}

fn test_config(device_addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        transport: TransportConfig {
            discovery_addr: device_addr,
        },
        discovery_interval_start: Duration::from_millis(100),
        discovery_interval_step: Duration::from_millis(50),
        discovery_interval_ceiling: Duration::from_millis(200),
        auth_timeout: Duration::from_secs(2),
        expiry_window: Duration::from_millis(600),
        restart_attempts: 3,
        restart_retry_delay: Duration::from_millis(100),
    }
}

#[tokio::test]
async fn test_discover_auth_and_read_sensors() {
    let fake = spawn_fake_device().await;
    let client = PersistentClient::with_config(test_config(fake.addr))
        .await
        .unwrap();
    let mut events = client.subscribe();

    // The device shows up discovered, then authenticated.
    let mut discovered = false;
    let mut authenticated = false;
    let wait = async {
        while !(discovered && authenticated) {
            match events.recv().await.unwrap() {
                ClientEvent::Discovered { mac, name, .. } => {
                    assert_eq!(mac.to_string(), FAKE_MAC);
                    assert_eq!(name, FAKE_NAME);
                    discovered = true;
                }
                ClientEvent::Authenticated { mac } => {
                    assert_eq!(mac.to_string(), FAKE_MAC);
                    authenticated = true;
                }
                _ => {}
            }
        }
    };
    timeout(Duration::from_secs(5), wait).await.unwrap();

    let devices = client.devices().await;
    assert_eq!(devices.len(), 1);

    let mac: HardwareAddr = FAKE_MAC.parse().unwrap();
    let device = client.device_for_mac(mac).await.unwrap();
    let identity = device.identity().await;
    assert_eq!(identity.name, FAKE_NAME);
    assert_eq!(identity.device_type, FAKE_DEVICE_TYPE);
    assert_eq!(identity.id, FAKE_DEVICE_ID);
    assert_eq!(identity.key, Some(SESSION_KEY));

    let readings = device.sensor_data(Duration::from_secs(2)).await.unwrap();
    assert_eq!(readings.temperature, 24.50);
    assert_eq!(readings.humidity, 55.0);

    // Same device reachable by IP.
    let by_ip = client.device_for_ip(fake.addr.ip()).await.unwrap();
    assert_eq!(by_ip.mac().await, mac);

    client.shutdown().await;
}

#[tokio::test]
async fn test_unknown_device_lookup_lists_known() {
    let fake = spawn_fake_device().await;
    let client = PersistentClient::with_config(test_config(fake.addr))
        .await
        .unwrap();

    // Wait for the device table to populate.
    timeout(Duration::from_secs(5), async {
        while client.devices().await.is_empty() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    let missing: HardwareAddr = "00:11:22:33:44:55".parse().unwrap();
    let err = client.device_for_mac(missing).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("00:11:22:33:44:55"));
    assert!(message.contains(FAKE_MAC));

    client.shutdown().await;
}

#[tokio::test]
async fn test_silent_device_expires() {
    let fake = spawn_fake_device().await;
    let client = PersistentClient::with_config(test_config(fake.addr))
        .await
        .unwrap();
    let mut events = client.subscribe();

    timeout(Duration::from_secs(5), async {
        while client.devices().await.is_empty() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    // Go quiet: discovery keeps running but nothing answers, so the device
    // ages past the expiry window and falls out.
    fake.answer_discovery.store(false, Ordering::SeqCst);

    timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await.unwrap() {
                ClientEvent::Expired { mac } => {
                    assert_eq!(mac.to_string(), FAKE_MAC);
                    return;
                }
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    assert!(client.devices().await.is_empty());

    client.shutdown().await;
}

async fn wait_for_device(client: &PersistentClient) {
    timeout(Duration::from_secs(5), async {
        while client.devices().await.is_empty() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_restart_preserves_authenticated_sessions() {
    let fake = spawn_fake_device().await;
    let client = PersistentClient::with_config(test_config(fake.addr))
        .await
        .unwrap();
    wait_for_device(&client).await;

    let mut events = client.subscribe();
    client.request_restart();

    // The request is acknowledged, then the rebuilt transport comes up.
    let mut requested = false;
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.unwrap() {
                ClientEvent::RestartRequested => requested = true,
                ClientEvent::RestartComplete => {
                    assert!(requested);
                    return;
                }
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    // The device table survives the swap, session key intact, and commands
    // flow through the new transport.
    let mac: HardwareAddr = FAKE_MAC.parse().unwrap();
    let device = client.device_for_mac(mac).await.unwrap();
    assert_eq!(device.identity().await.key, Some(SESSION_KEY));

    let readings = device.sensor_data(Duration::from_secs(2)).await.unwrap();
    assert_eq!(readings.temperature, 24.50);
    assert_eq!(readings.humidity, 55.0);

    client.shutdown().await;
}

#[tokio::test]
async fn test_rapid_restart_requests_coalesce() {
    let fake = spawn_fake_device().await;
    let client = PersistentClient::with_config(test_config(fake.addr))
        .await
        .unwrap();
    wait_for_device(&client).await;

    let mut events = client.subscribe();

    // Back-to-back requests with no await between them: the second lands
    // while the first still sits in the queue and is absorbed.
    client.request_restart();
    client.request_restart();

    let mut requested = 0;
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.unwrap() {
                ClientEvent::RestartRequested => requested += 1,
                ClientEvent::RestartComplete => return,
                _ => {}
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(requested, 1);

    // No second restart follows.
    let extra = timeout(Duration::from_millis(500), async {
        loop {
            if let Ok(ClientEvent::RestartComplete) = events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(extra.is_err());

    client.shutdown().await;
}

#[tokio::test]
async fn test_restart_request_after_shutdown_does_nothing() {
    let fake = spawn_fake_device().await;
    let client = PersistentClient::with_config(test_config(fake.addr))
        .await
        .unwrap();
    wait_for_device(&client).await;

    let mut events = client.subscribe();
    client.shutdown().await;
    client.request_restart();

    // No transport is rebuilt once the client is torn down.
    let rebuilt = timeout(Duration::from_millis(500), async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::RestartComplete) => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
    })
    .await;
    assert!(matches!(rebuilt, Err(_) | Ok(false)));
}

#[tokio::test]
async fn test_device_survives_while_answering() {
    let fake = spawn_fake_device().await;
    let client = PersistentClient::with_config(test_config(fake.addr))
        .await
        .unwrap();

    timeout(Duration::from_secs(5), async {
        while client.devices().await.is_empty() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    // Sit through several expiry windows; re-sightings keep it alive.
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(client.devices().await.len(), 1);

    client.shutdown().await;
}

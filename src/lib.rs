// MIT License - Copyright (c) 2026 initialed85

//! # broadlink-lan-bridge
//!
//! Direct LAN communication with Broadlink IR blasters and sensors
//! (RM Mini, RM Pro, A1) over their reverse-engineered UDP protocol,
//! bypassing the vendor cloud entirely.
//!
//! The crate has two layers: [`Transport`]/[`Device`] for one-shot use
//! against a known device, and [`PersistentClient`] which keeps a device
//! table alive across network churn (periodic discovery, auth of newly seen
//! devices, expiry of silent ones, and transport restarts that devices
//! survive without losing their session keys).
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use broadlink_lan_bridge::PersistentClient;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = PersistentClient::new().await?;
//!
//!     let mut events = client.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("event: {:?}", event);
//!         }
//!     });
//!
//!     tokio::time::sleep(Duration::from_secs(2)).await;
//!
//!     for device in client.devices().await {
//!         let readings = device.sensor_data(Duration::from_secs(5)).await?;
//!         println!(
//!             "{}: {:.2} C, {:.2} %",
//!             device.mac().await,
//!             readings.temperature,
//!             readings.humidity
//!         );
//!     }
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod constants;
pub mod device;
pub mod error;
pub mod event;
pub mod transport;
pub mod wire;

// Re-exports for convenience
pub use client::{ClientConfig, PersistentClient, PersistentDevice};
pub use device::{Device, DeviceIdentity};
pub use error::{BridgeError, FirmwareErrorCode, Result};
pub use event::{ClientEvent, EventReceiver};
pub use transport::{Transport, TransportConfig};
pub use wire::{CommandPayload, HardwareAddr, SensorData};

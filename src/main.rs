// MIT License - Copyright (c) 2026 initialed85
// IR learn / replay tool

use std::collections::BTreeMap;
use std::net::IpAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use broadlink_lan_bridge::{ClientEvent, PersistentClient, PersistentDevice};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "ir-learn")]
#[command(about = "Learn IR codes from (or replay them through) a Broadlink blaster")]
struct Cli {
    /// Hardware address of the device to use (e.g. "aa:bb:cc:dd:ee:ff");
    /// defaults to the first device discovered
    #[arg(long)]
    device: Option<String>,

    /// How long to wait for a device to show up
    #[arg(long, default_value_t = 30)]
    discover_timeout_secs: u64,

    /// Per-learn timeout (press the remote button within this window)
    #[arg(long, default_value_t = 30)]
    learn_timeout_secs: u64,

    /// Replay a previously learned code (hex string) instead of learning
    #[arg(long)]
    send: Option<String>,

    /// Read and print the device's temperature/humidity sensors, then exit
    #[arg(long, default_value_t = false)]
    sensors: bool,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Render a learned code the way it would be pasted into source.
fn format_code(code: &[u8]) -> String {
    let bytes: Vec<String> = code.iter().map(|b| format!("0x{b:02x}")).collect();
    format!("[{}]", bytes.join(", "))
}

fn dump_codes(codes: &BTreeMap<String, Vec<u8>>) {
    if codes.is_empty() {
        return;
    }
    println!("// learned codes");
    for (name, code) in codes {
        println!("pub const {}: &[u8] = &{};", name.to_uppercase(), format_code(code));
    }
}

/// Wait until the client has at least one device, then pick one.
async fn pick_device(
    client: &PersistentClient,
    wanted: Option<&str>,
    deadline: Duration,
) -> Result<PersistentDevice> {
    let give_up = tokio::time::Instant::now() + deadline;

    loop {
        if let Some(selector) = wanted {
            // Accept either a hardware address or an IP address.
            let found = if let Ok(mac) = selector.parse() {
                client.device_for_mac(mac).await
            } else if let Ok(ip) = selector.parse::<IpAddr>() {
                client.device_for_ip(ip).await
            } else {
                anyhow::bail!(
                    "--device {selector:?} is neither a hardware address nor an IP address"
                );
            };
            if let Ok(device) = found {
                return Ok(device);
            }
        } else if let Some(device) = client.devices().await.into_iter().next() {
            return Ok(device);
        }

        if tokio::time::Instant::now() >= give_up {
            anyhow::bail!(
                "no matching device discovered within {:?}; is it on this network?",
                deadline
            );
        }
        sleep(Duration::from_millis(500)).await;
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or
    // RUST_LOG=broadlink_lan_bridge=trace). Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    let client = PersistentClient::new().await?;

    // Surface lifecycle events while we wait for discovery.
    let mut events = client.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ClientEvent::Discovered { mac, addr, name }) => {
                    info!("discovered {name:?} ({mac}) at {addr}");
                }
                Ok(ClientEvent::Fatal) => {
                    warn!("client gave up restarting its transport; exiting");
                    std::process::exit(1);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("event receiver lagged, missed {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    info!("waiting for a device...");
    let device = pick_device(
        &client,
        cli.device.as_deref(),
        Duration::from_secs(cli.discover_timeout_secs),
    )
    .await?;
    let identity = device.identity().await;
    info!(
        "using {:?} ({}) at {}",
        identity.name, identity.mac, identity.addr
    );

    if let Some(hex_code) = &cli.send {
        let code = hex::decode(hex_code.trim()).context("--send payload is not valid hex")?;
        device.send_ir(&code, Duration::from_secs(5)).await?;
        info!("sent {} byte code", code.len());
        client.shutdown().await;
        return Ok(());
    }

    if cli.sensors {
        let readings = device.sensor_data(Duration::from_secs(5)).await?;
        println!(
            "temperature: {:.2} C, humidity: {:.2} %",
            readings.temperature, readings.humidity
        );
        client.shutdown().await;
        return Ok(());
    }

    // Interactive learn loop: capture a code, ask for a name, repeat until
    // the user types "exit" or hits ctrl-c. Everything named so far is
    // dumped as pasteable constants on the way out.
    let mut codes: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    'outer: loop {
        info!("waiting to learn a code (press a button on the remote)...");

        let learned = tokio::select! {
            result = device.learn(Duration::from_secs(cli.learn_timeout_secs)) => result,
            _ = tokio::signal::ctrl_c() => break 'outer,
        };

        let code = match learned {
            Ok(code) if !code.is_empty() => code,
            Ok(_) => {
                warn!("device returned an empty code; trying again");
                continue;
            }
            Err(e) => {
                warn!("learn failed: {e}; trying again");
                continue;
            }
        };

        info!("learned {} byte code: {}", code.len(), hex::encode(&code));

        loop {
            print!("enter a name (blank to discard, \"exit\" to finish): ");
            use std::io::Write as _;
            std::io::stdout().flush().ok();

            let line = tokio::select! {
                line = lines.next_line() => line.context("failed to read user input")?,
                _ = tokio::signal::ctrl_c() => break 'outer,
            };
            let name = match line {
                Some(line) => line.trim().to_string(),
                None => break 'outer,
            };

            if name.is_empty() {
                info!("discarded");
                continue 'outer;
            }
            if name == "exit" {
                break 'outer;
            }
            if !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                warn!("name {name:?} must be alphanumeric/underscores only");
                continue;
            }

            if codes.insert(name.clone(), code.clone()).is_some() {
                info!("replaced {name}");
            } else {
                info!("saved {name}");
            }
            break;
        }
    }

    println!();
    dump_codes(&codes);
    client.shutdown().await;
    Ok(())
}

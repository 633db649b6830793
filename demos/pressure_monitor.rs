//! Pressure monitor example
//!
//! Keeps a session with a Pressensor and prints every reading.
//! Type `zero` and press Enter to zero the sensor, `diag` for diagnostics.
//!
//! Run with: cargo run --example pressure_monitor
//!
//! To connect to a specific device:
//!   cargo run --example pressure_monitor -- --address AA:BB:CC:DD:EE:FF

use pressensor_ble::{
    format_mac, BtleplugRadio, Error, Orchestrator, OrchestratorConfig, Result, SensorKind,
    SENSORS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,pressensor_ble=debug")
        .init();

    println!("Pressensor Pressure Monitor");
    println!("===========================\n");

    let args: Vec<String> = std::env::args().collect();
    let target_address = args
        .iter()
        .position(|arg| arg == "--address")
        .and_then(|i| args.get(i + 1))
        .map(|s| format_mac(s));

    let radio = Arc::new(BtleplugRadio::new().await?);

    let address = match target_address {
        Some(address) => address,
        None => {
            println!("Scanning for Pressensors...\n");
            let mut devices = radio.discover(Duration::from_secs(5)).await?;
            devices.sort_by_key(|d| std::cmp::Reverse(d.rssi));
            let nearest = devices.into_iter().next().ok_or_else(|| Error::DeviceNotFound {
                address: "any".to_string(),
            })?;
            println!(
                "Found {} ({}), RSSI {:?} dBm\n",
                nearest.name.as_deref().unwrap_or("unnamed"),
                nearest.address,
                nearest.rssi
            );
            nearest.address
        }
    };

    let orchestrator = Orchestrator::start(radio, address, OrchestratorConfig::default());
    let mut updates = orchestrator.subscribe_updates();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    println!("Waiting for the device to wake up. Press Ctrl+C to stop.\n");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Ok(reading) = updates.recv() => {
                let mut line = String::new();
                for description in SENSORS.iter() {
                    match description.kind.value(&reading) {
                        Some(value) => line.push_str(&format!(
                            "{}: {:.*} {}  ",
                            description.key,
                            usize::from(description.display_precision),
                            value,
                            description.unit
                        )),
                        None => line.push_str(&format!("{}: --  ", description.key)),
                    }
                }
                if !SensorKind::Battery.is_available(&reading) || !reading.battery_is_live() {
                    line.push_str("(battery not read yet)  ");
                }
                println!("{}[{}]", line, if reading.connected { "connected" } else { "asleep" });
            }
            Ok(Some(command)) = stdin.next_line() => match command.trim() {
                "zero" => match orchestrator.send_zero_calibration().await {
                    Ok(()) => println!("Zeroed"),
                    Err(e) if e.is_not_connected() => {
                        println!("Device is asleep, wake it up and try again")
                    }
                    Err(e) => println!("Zero calibration failed: {}", e),
                },
                "diag" => println!("{:#?}", orchestrator.diagnostics().await?),
                "connect" => {
                    if let Err(e) = orchestrator.request_connect().await {
                        println!("Connect failed: {}", e);
                    }
                }
                "" => {}
                other => println!("Unknown command: {}", other),
            },
        }
    }

    println!("\nShutting down...");
    orchestrator.shutdown().await?;
    Ok(())
}

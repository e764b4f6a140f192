//! Monitor Nikobus bus events.
//!
//! Connects to a PC-Link, polls one module once, and prints every bus event
//! for 60 seconds: button presses from wall switches, decoded module status
//! and connection changes.
//!
//! # Requirements
//!
//! - A PC-Link connected to the serial port below
//! - The module address adjusted for your installation
//!
//! # Usage
//!
//! ```sh
//! cargo run -p nikobus --example monitor_events
//! ```

use std::sync::Arc;
use std::time::Duration;

use nikobus::{Address, BusEvent, EngineBuilder, Module, ModuleKind, ModuleRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let serial_port = "/dev/ttyUSB0";
    let address: Address = "6C0E".parse()?;

    let modules = Arc::new(ModuleRegistry::new());
    modules.add(
        Module::new(address.clone(), ModuleKind::Switch)
            .with_channel(1, "output-1")?
            .with_channel(7, "output-7")?,
    );

    let engine = EngineBuilder::new()
        .serial_port(serial_port)
        .modules(modules)
        .build()?;

    let mut events = engine.subscribe();
    engine.start().await;
    println!("Connecting to PC-Link on {}...", serial_port);
    engine.connect().await?;
    println!("{}\n", engine.connection_status());

    engine.schedule_status_update_request(&address, true)?;
    println!("Monitoring for 60 seconds (press a wall switch to generate events)\n");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    let start = tokio::time::Instant::now();

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) => {
                let elapsed = start.elapsed();
                let timestamp = format!("{:>6}.{:03}s", elapsed.as_secs(), elapsed.subsec_millis());
                match event {
                    BusEvent::ButtonPressed { address } => {
                        println!("{timestamp}  button {address}");
                    }
                    BusEvent::ModuleStatus {
                        address,
                        group,
                        levels,
                    } => {
                        println!("{timestamp}  module {address} {group}: {levels:02X?}");
                    }
                    other => println!("{timestamp}  {other:?}"),
                }
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(n))) => {
                println!("(missed {n} events)");
            }
            Ok(Err(_)) | Err(_) => break,
        }
    }

    engine.stop().await;
    println!("\nDone.");
    Ok(())
}

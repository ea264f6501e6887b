//! usb-detect
//!
//! Lists attached USB devices and watches for devices being plugged in or
//! removed.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use config::DetectorConfig;
use detection::{DeviceMonitor, EventBus, SourceHandle, UsbEventSource, scripted_source};
use protocol::{DeviceEvent, DeviceKey, DeviceRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-detect")]
#[command(
    author,
    version,
    about = "usb-detect - Report USB devices as they are plugged in and removed"
)]
#[command(long_about = "
Keeps track of the USB devices attached to this machine, prints every
arrival and removal, and answers device queries by vendor/product ID.

EXAMPLES:
    # Watch for device changes until Ctrl+C
    usb-detect

    # List every attached device
    usb-detect --list

    # List devices from one vendor, as JSON
    usb-detect --list --vid 0x04e8 --json

    # Watch a simulated device sequence (no hardware needed)
    usb-detect --simulate

    # Run with debug logging
    usb-detect --log-level debug

CONFIGURATION:
    usb-detect looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-detect/config.toml
    3. /etc/usb-detect/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List attached devices and exit
    #[arg(long)]
    list: bool,

    /// Vendor ID to list (hex with 0x prefix, or decimal)
    #[arg(long, value_name = "ID", value_parser = parse_id)]
    vid: Option<u16>,

    /// Product ID to list; requires --vid
    #[arg(long, value_name = "ID", value_parser = parse_id, requires = "vid")]
    pid: Option<u16>,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    /// Use a simulated device sequence instead of the USB bus
    #[arg(long)]
    simulate: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

/// Parse a USB ID given as `0x04e8` or `1256`
fn parse_id(value: &str) -> std::result::Result<u16, String> {
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| format!("'{}' is not a valid USB ID", value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = DetectorConfig::default();
        let path = DetectorConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    // Load configuration first (to get log level from config if not specified)
    let config = if let Some(ref path) = args.config {
        DetectorConfig::load(Some(config::expand_path(path)))
            .context("Failed to load configuration")?
    } else {
        DetectorConfig::load_or_default()
    };

    // Use CLI log level if specified, otherwise use config value
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.detector.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-detect v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let json = args.json || config.detector.json_output;
    let (monitor, simulation) =
        build_monitor(&config, args.simulate, !args.list).context("Failed to start monitor")?;
    let monitor = Arc::new(monitor);
    info!("Using {} event source", monitor.source_name());

    let result = if args.list {
        list_devices_mode(&monitor, args.vid.unwrap_or(0), args.pid.unwrap_or(0), json).await
    } else {
        watch_mode(&monitor, &config, simulation, json).await
    };

    // Joining the worker threads blocks
    info!("Shutting down device monitor...");
    let shutdown = Arc::clone(&monitor);
    if let Err(e) = tokio::task::spawn_blocking(move || shutdown.shutdown()).await {
        error!("Device monitor shutdown panicked: {}", e);
    }

    result
}

/// Create the monitor over the real USB bus or a simulation
fn build_monitor(
    config: &DetectorConfig,
    simulate: bool,
    watch: bool,
) -> Result<(DeviceMonitor, Option<SourceHandle>)> {
    let mut monitor_config = config.monitor_config();
    // Listing never reports events
    monitor_config.auto_start = monitor_config.auto_start && watch;

    if simulate {
        let (source, handle) = scripted_source(vec![demo_devices()[0].clone()]);
        let monitor = DeviceMonitor::new(source, monitor_config)?;
        return Ok((monitor, Some(handle)));
    }

    let source = UsbEventSource::new(
        config.monitor.prefer_hotplug,
        config.monitor.poll_interval(),
    )?
    .with_root_hubs(config.monitor.include_root_hubs);
    Ok((DeviceMonitor::new(source, monitor_config)?, None))
}

/// List devices matching the IDs and exit
async fn list_devices_mode(
    monitor: &DeviceMonitor,
    vendor_id: u16,
    product_id: u16,
    json: bool,
) -> Result<()> {
    info!("Listing USB devices...");

    let devices = monitor
        .find(vendor_id, product_id)
        .await
        .context("Failed to query devices")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&devices).context("Failed to serialize devices")?
        );
    } else if devices.is_empty() {
        println!("No USB devices found.");
    } else {
        println!("Found {} USB device(s):\n", devices.len());
        for device in &devices {
            print_device(device);
        }
    }

    Ok(())
}

fn print_device(device: &DeviceRecord) {
    println!(
        "  {:04x}:{:04x} - {} {}",
        device.vendor_id,
        device.product_id,
        non_empty(&device.manufacturer, "Unknown Manufacturer"),
        non_empty(&device.device_name, "Unknown Product")
    );
    println!(
        "      Location {:#010x} Address {:03}",
        device.location_id, device.device_address
    );
    if !device.serial_number.is_empty() {
        println!("      Serial: {}", device.serial_number);
    }
    println!();
}

fn non_empty<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() { fallback } else { value }
}

/// Print device events until Ctrl+C
async fn watch_mode(
    monitor: &DeviceMonitor,
    config: &DetectorConfig,
    simulation: Option<SourceHandle>,
    json: bool,
) -> Result<()> {
    let bus = EventBus::new();
    for topic in config.watch.topics()? {
        info!("Watching topic '{}'", topic);
        bus.on(topic, move |event| print_event(event, json));
    }
    bus.attach(monitor);

    if !monitor.is_monitoring() {
        monitor.start_monitoring();
    }

    let simulator = simulation.map(|handle| tokio::spawn(run_simulation(handle)));

    println!("Watching for USB device changes (Ctrl+C to stop)...");
    signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C");

    if let Some(simulator) = simulator {
        simulator.abort();
    }
    Ok(())
}

fn print_event(event: &DeviceEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Failed to serialize event: {}", e),
        }
    } else {
        println!(
            "[{}] {} (location {:#010x})",
            event.direction, event.record, event.record.location_id
        );
    }
}

fn demo_device(
    key: &str,
    location_id: u32,
    ids: (u16, u16),
    name: &str,
    manufacturer: &str,
    serial_number: &str,
) -> (DeviceKey, DeviceRecord) {
    (
        DeviceKey::from(key),
        DeviceRecord {
            location_id,
            vendor_id: ids.0,
            product_id: ids.1,
            device_name: name.to_string(),
            manufacturer: manufacturer.to_string(),
            serial_number: serial_number.to_string(),
            device_address: (location_id >> 20) & 0x7f,
        },
    )
}

/// Devices used by --simulate; the first one is attached from the start
fn demo_devices() -> Vec<(DeviceKey, DeviceRecord)> {
    vec![
        demo_device(
            "usb-1-1",
            0x0110_0000,
            (0x16c0, 0x0483),
            "Teensy USB Serial",
            "PJRC.COM, LLC.",
            "1234560",
        ),
        demo_device(
            "usb-1-2",
            0x0120_0000,
            (0x04e8, 0x503b),
            "Galaxy",
            "Samsung",
            "R58M42ABCDE",
        ),
        demo_device(
            "usb-2-1.3",
            0x0213_0000,
            (0x2341, 0x0043),
            "Arduino Uno",
            "Arduino (www.arduino.cc)",
            "",
        ),
    ]
}

/// Plug the demo devices in and out forever
async fn run_simulation(handle: SourceHandle) {
    let devices = demo_devices();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;

    loop {
        for (key, record) in devices.iter().skip(1) {
            ticker.tick().await;
            if let Err(e) = handle.arrive(key.clone(), record.clone()) {
                warn!("Simulation stopped: {}", e);
                return;
            }
        }
        for (key, _) in devices.iter().skip(1) {
            ticker.tick().await;
            if let Err(e) = handle.leave(key.clone()) {
                warn!("Simulation stopped: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id("0x04e8").unwrap(), 0x04e8);
        assert_eq!(parse_id("0X16C0").unwrap(), 0x16c0);
        assert_eq!(parse_id("1256").unwrap(), 1256);
        assert!(parse_id("0x1ffff").is_err());
        assert!(parse_id("usb").is_err());
    }

    #[test]
    fn test_args_pid_requires_vid() {
        assert!(Args::try_parse_from(["usb-detect", "--list", "--pid", "0x503b"]).is_err());

        let args =
            Args::try_parse_from(["usb-detect", "--list", "--vid", "0x04e8", "--pid", "20539"])
                .unwrap();
        assert_eq!(args.vid, Some(0x04e8));
        assert_eq!(args.pid, Some(0x503b));
    }

    #[test]
    fn test_demo_devices_are_distinct() {
        let devices = demo_devices();
        let mut keys: Vec<_> = devices.iter().map(|(k, _)| k.clone()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), devices.len());
    }

    #[tokio::test]
    async fn test_simulated_list() {
        let config = DetectorConfig::default();
        let (monitor, handle) = build_monitor(&config, true, false).unwrap();

        assert!(handle.is_some());
        assert!(!monitor.is_monitoring());
        let found = monitor.find(0x16c0, 0).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].device_name, "Teensy USB Serial");

        tokio::task::spawn_blocking(move || monitor.shutdown())
            .await
            .unwrap();
    }
}

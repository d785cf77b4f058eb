//! tranzportd
//!
//! Attaches Tranzport control surfaces over USB, then either runs one-shot
//! commands (lights, LCD text, attributes) or streams decoded reports until
//! interrupted.

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use common::{Error, effective_level, setup_logging};
use driver::usb::{self, HotplugEvent, HotplugMonitor};
use driver::{DriverConfig, DriverRegistry, OpenFile, OpenOptions};
use protocol::{Command, Frame, InputReport, Light, lcd_line};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

/// How long the reader waits for readiness before rechecking
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "tranzportd")]
#[command(author, version, about = "User-space driver for the Tranzport control surface")]
#[command(long_about = "
Attaches to a Frontier Design Tranzport and streams its button, wheel and
link reports, or sends it light and LCD commands.

EXAMPLES:
    # Stream reports from the first surface
    tranzportd

    # Stream as JSON lines
    tranzportd --json

    # Light the record LED and write to the display
    tranzportd --light record=on --lcd 0='Hello world'

    # Show or set attributes
    tranzportd --attr offline --attr compress_wheel=0

    # List matching devices
    tranzportd --list-devices

CONFIGURATION:
    The driver looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/tranzport/driver.toml
    3. /etc/tranzport/driver.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List matching USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Print reports and listings as JSON
    #[arg(long)]
    json: bool,

    /// Open the device in non-blocking mode
    #[arg(long)]
    nonblock: bool,

    /// Switch a light, e.g. record=on
    #[arg(long, value_name = "NAME=on|off", value_parser = parse_light)]
    light: Vec<(Light, bool)>,

    /// Write text starting at an LCD cell, e.g. 0=Hello
    #[arg(long, value_name = "CELL=TEXT", value_parser = parse_lcd)]
    lcd: Vec<(u8, String)>,

    /// Show an attribute, or set it with NAME=VALUE
    #[arg(long, value_name = "NAME[=VALUE]")]
    attr: Vec<String>,
}

impl Args {
    fn has_commands(&self) -> bool {
        !self.light.is_empty() || !self.lcd.is_empty() || !self.attr.is_empty()
    }
}

fn parse_light(s: &str) -> std::result::Result<(Light, bool), String> {
    let (name, state) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=on|off, got '{}'", s))?;
    let light = name.parse::<Light>()?;
    let on = match state.to_ascii_lowercase().as_str() {
        "on" | "1" => true,
        "off" | "0" => false,
        other => return Err(format!("expected on or off, got '{}'", other)),
    };
    Ok((light, on))
}

fn parse_lcd(s: &str) -> std::result::Result<(u8, String), String> {
    let (cell, text) = s
        .split_once('=')
        .ok_or_else(|| format!("expected CELL=TEXT, got '{}'", s))?;
    let cell = cell
        .parse::<u8>()
        .map_err(|e| format!("invalid cell '{}': {}", cell, e))?;
    Ok((cell, text.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DriverConfig::default();
        let path = DriverConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        driver::config::load_config(&path.to_string_lossy())
            .context("Failed to load configuration")?
    } else {
        DriverConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.logging.log_level);
    let log_level = effective_level(log_level, config.driver.debug);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("tranzportd v{}", env!("CARGO_PKG_VERSION"));
    debug!("Configuration: {:?}", config);

    let context = rusb::Context::new().context("Failed to initialize libusb")?;

    if args.list_devices {
        return list_devices_mode(&context, &config, args.json);
    }

    let registry = Arc::new(DriverRegistry::new(config.clone()));
    attach_present(&context, &registry)?;

    let (event_tx, event_rx) = async_channel::unbounded();
    let mut monitor = if config.usb.hotplug {
        let filter = config.device_match()?;
        match HotplugMonitor::spawn(context.clone(), filter, event_tx) {
            Ok(monitor) => Some(monitor),
            Err(e) => {
                warn!("Hot-plug unavailable: {}", e);
                None
            }
        }
    } else {
        None
    };

    if registry.devices().is_empty() {
        if monitor.is_none() {
            bail!("No Tranzport found");
        }
        info!("Waiting for a Tranzport to be plugged in (Ctrl+C to quit)");
        tokio::select! {
            result = wait_for_arrival(&registry, &event_rx) => result?,
            _ = signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
        }
    }

    let hotplug_task = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            while let Ok(event) = event_rx.recv().await {
                handle_hotplug(&registry, event).await;
            }
        })
    };

    let minor = registry
        .devices()
        .first()
        .map(|d| d.minor())
        .ok_or_else(|| anyhow!("No Tranzport attached"))?;
    let options = OpenOptions::new().nonblocking(args.nonblock);
    let file = Arc::new(
        registry
            .open(minor, options)
            .with_context(|| format!("Failed to open tranzport{}", minor))?,
    );

    let result = if args.has_commands() {
        run_commands(&file, &args)
    } else {
        stream_reports(Arc::clone(&file), Arc::clone(&registry), args.json).await
    };

    drop(file);
    registry.shutdown();
    hotplug_task.abort();
    if let Some(monitor) = monitor.as_mut() {
        monitor.stop();
    }

    info!("Shutdown complete");
    result
}

/// List matching devices and exit
fn list_devices_mode(context: &rusb::Context, config: &DriverConfig, json: bool) -> Result<()> {
    let devices = usb::list_devices(context, config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No Tranzport devices found.");
    } else {
        println!("Found {} device(s):\n", devices.len());
        for device in devices {
            println!(
                "  {:04x}:{:04x} - {} {}",
                device.vendor_id,
                device.product_id,
                device
                    .manufacturer
                    .as_deref()
                    .unwrap_or("Unknown Manufacturer"),
                device.product.as_deref().unwrap_or("Unknown Product")
            );
            println!("      {}", device.location);
            if let Some(serial) = &device.serial_number {
                println!("      Serial: {}", serial);
            }
            println!();
        }
    }

    Ok(())
}

/// Attach every matching device already on the bus
fn attach_present(context: &rusb::Context, registry: &DriverRegistry) -> Result<()> {
    for device in usb::find_devices(context, registry.config())? {
        match usb::open_device(&device, registry.config()) {
            Ok(binding) => {
                if let Err(e) = registry.probe(binding) {
                    error!("Failed to attach {}: {}", usb::probe::location(&device), e);
                }
            }
            Err(e) => error!("Failed to open {}: {}", usb::probe::location(&device), e),
        }
    }
    Ok(())
}

async fn wait_for_arrival(
    registry: &Arc<DriverRegistry>,
    events: &async_channel::Receiver<HotplugEvent>,
) -> Result<()> {
    while registry.devices().is_empty() {
        let event = events
            .recv()
            .await
            .context("Hot-plug monitor stopped")?;
        handle_hotplug(registry, event).await;
    }
    Ok(())
}

async fn handle_hotplug(registry: &Arc<DriverRegistry>, event: HotplugEvent) {
    match event {
        HotplugEvent::Arrived(device) => {
            let registry = Arc::clone(registry);
            // Opening and claiming block on libusb
            let result = tokio::task::spawn_blocking(move || {
                let binding = usb::open_device(&device, registry.config())?;
                registry.probe(binding)
            })
            .await;

            match result {
                Ok(Ok(minor)) => debug!("Hot-plugged device attached as minor {}", minor),
                Ok(Err(e)) => error!("Failed to attach hot-plugged device: {}", e),
                Err(e) => error!("Attach task failed: {}", e),
            }
        }
        HotplugEvent::Left { location } => {
            if let Some(minor) = registry.disconnect_location(&location) {
                info!("tranzport{} unplugged", minor);
            }
        }
    }
}

/// Apply --light, --lcd and --attr in order
fn run_commands(file: &OpenFile, args: &Args) -> Result<()> {
    for (light, on) in &args.light {
        let frame = Command::Light {
            light: *light,
            on: *on,
        }
        .encode()?;
        send(file, &[frame])?;
    }

    for (cell, text) in &args.lcd {
        let frames = lcd_line(*cell, text)?;
        let per_write = file.device().params().write_buffer_size / protocol::FRAME_SIZE;
        for chunk in frames.chunks(per_write.max(1)) {
            send(file, chunk)?;
        }
    }

    for attr in &args.attr {
        let device = file.device();
        match attr.split_once('=') {
            Some((name, value)) => {
                driver::store_attribute(device, name, value)?;
                let value = driver::show_attribute(device, name)?;
                println!("{} = {}", name, value.trim_end());
            }
            None => {
                let value = driver::show_attribute(device, attr)?;
                println!("{} = {}", attr, value.trim_end());
            }
        }
    }

    if !file.flush(Duration::from_secs(2))? {
        warn!("Last write still pending");
    }
    Ok(())
}

/// Write frames, waiting for the outbound slot if opened non-blocking
fn send(file: &OpenFile, frames: &[Frame]) -> Result<()> {
    loop {
        match file.write_frames(frames) {
            Ok(_) => return Ok(()),
            Err(Error::WouldBlock) => {
                file.flush(POLL_INTERVAL)?;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Print reports until the device goes away or Ctrl+C
async fn stream_reports(
    file: Arc<OpenFile>,
    registry: Arc<DriverRegistry>,
    json: bool,
) -> Result<()> {
    info!("Streaming reports (Ctrl+C to stop)");

    let reader = tokio::task::spawn_blocking(move || read_loop(&file, json));
    tokio::pin!(reader);

    tokio::select! {
        result = &mut reader => return result.context("Reader task failed")?,
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    // Detaching wakes the blocked reader with DeviceGone
    registry.shutdown();
    reader.await.context("Reader task failed")?
}

fn read_loop(file: &OpenFile, json: bool) -> Result<()> {
    let mut offline_reported = false;

    loop {
        match file.read_frame() {
            Ok(frame) => {
                offline_reported = false;
                print_report(&frame, json)?;
            }
            Err(Error::Offline) => {
                if !offline_reported {
                    info!("Surface offline");
                    offline_reported = true;
                }
                file.poll_wait(POLL_INTERVAL);
            }
            Err(Error::WouldBlock) => {
                file.poll_wait(POLL_INTERVAL);
            }
            Err(Error::DeviceGone) => {
                info!("Device gone, reader stopping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn print_report(frame: &Frame, json: bool) -> Result<()> {
    let report = InputReport::decode(frame);

    if json {
        println!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }

    if report.is_offline() {
        println!("offline");
        return Ok(());
    }

    let buttons: Vec<String> = report.pressed().map(|b| format!("{:?}", b)).collect();
    println!(
        "{}  buttons=[{}] wheel={}",
        frame,
        buttons.join(","),
        report.wheel
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_light() {
        assert_eq!(parse_light("record=on").unwrap(), (Light::Record, true));
        assert_eq!(
            parse_light("track-mute=off").unwrap(),
            (Light::TrackMute, false)
        );
        assert!(parse_light("record").is_err());
        assert!(parse_light("record=maybe").is_err());
        assert!(parse_light("laser=on").is_err());
    }

    #[test]
    fn test_parse_lcd() {
        assert_eq!(parse_lcd("3=Hi").unwrap(), (3, "Hi".to_string()));
        assert_eq!(parse_lcd("0=a=b").unwrap(), (0, "a=b".to_string()));
        assert!(parse_lcd("x=Hi").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from([
            "tranzportd",
            "--json",
            "--light",
            "loop=1",
            "--attr",
            "offline",
        ]);
        assert!(args.json);
        assert!(args.has_commands());
        assert_eq!(args.light, vec![(Light::Loop, true)]);
    }
}

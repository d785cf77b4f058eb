//! Device discovery and attach
//!
//! Finds control surfaces on the bus, takes interface 0 away from any kernel
//! driver, and wraps the handle in a [`RusbTransport`] ready for the registry.

use crate::config::DriverConfig;
use crate::usb::transport::RusbTransport;
use common::{EndpointInfo, Error, Result, TransportBinding, completion_channel};
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

const INTERFACE: u8 = 0;

/// What `--list-devices` shows for one matching device
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub location: String,
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// Check a VID/PID pair against a parsed filter (product None matches any)
pub fn matches_filter(vid: u16, pid: u16, filter: (u16, Option<u16>)) -> bool {
    let (want_vid, want_pid) = filter;
    vid == want_vid && want_pid.is_none_or(|p| p == pid)
}

/// Human readable location used to name a device in logs and on unplug
pub fn location<T: UsbContext>(device: &Device<T>) -> String {
    format!(
        "bus {:03} device {:03}",
        device.bus_number(),
        device.address()
    )
}

/// Map rusb errors onto driver errors
pub fn map_rusb_error(err: rusb::Error) -> Error {
    match err {
        rusb::Error::NoDevice => Error::DeviceGone,
        rusb::Error::Busy => Error::Busy,
        rusb::Error::NoMem => Error::ResourceExhausted("libusb out of memory".to_string()),
        rusb::Error::Access => Error::Transport("permission denied".to_string()),
        _ => Error::Transport(err.to_string()),
    }
}

/// Devices on the bus that pass the configured filter
pub fn find_devices(context: &Context, config: &DriverConfig) -> Result<Vec<Device<Context>>> {
    let filter = config
        .device_match()
        .map_err(|e| Error::Config(e.to_string()))?;

    let mut found = Vec::new();
    for device in context.devices().map_err(map_rusb_error)?.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        if matches_filter(desc.vendor_id(), desc.product_id(), filter) {
            found.push(device);
        }
    }

    debug!("Found {} matching device(s)", found.len());
    Ok(found)
}

/// Describe matching devices without claiming them
pub fn list_devices(context: &Context, config: &DriverConfig) -> Result<Vec<DeviceSummary>> {
    find_devices(context, config)?
        .iter()
        .map(summarize)
        .collect()
}

fn summarize(device: &Device<Context>) -> Result<DeviceSummary> {
    let desc = device.device_descriptor().map_err(map_rusb_error)?;

    let (manufacturer, product, serial_number) = match device.open() {
        Ok(handle) => (
            desc.manufacturer_string_index()
                .and_then(|i| handle.read_string_descriptor_ascii(i).ok()),
            desc.product_string_index()
                .and_then(|i| handle.read_string_descriptor_ascii(i).ok()),
            desc.serial_number_string_index()
                .and_then(|i| handle.read_string_descriptor_ascii(i).ok()),
        ),
        Err(e) => {
            debug!("Could not open {} for strings: {}", location(device), e);
            (None, None, None)
        }
    };

    Ok(DeviceSummary {
        location: location(device),
        bus_number: device.bus_number(),
        address: device.address(),
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        manufacturer,
        product,
        serial_number,
    })
}

/// Locate the interrupt endpoints of interface 0
pub fn discover_endpoints(device: &Device<Context>) -> Result<EndpointInfo> {
    let config = device.active_config_descriptor().map_err(map_rusb_error)?;

    let mut endpoint_in = None;
    let mut endpoint_out = None;

    for interface in config.interfaces() {
        if interface.number() != INTERFACE {
            continue;
        }
        for setting in interface.descriptors() {
            for endpoint in setting.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Interrupt {
                    continue;
                }
                let entry = (
                    endpoint.address(),
                    usize::from(endpoint.max_packet_size()),
                    Duration::from_millis(u64::from(endpoint.interval())),
                );
                match endpoint.direction() {
                    Direction::In if endpoint_in.is_none() => endpoint_in = Some(entry),
                    Direction::Out if endpoint_out.is_none() => endpoint_out = Some(entry),
                    _ => {}
                }
            }
        }
    }

    let (in_address, in_max_packet, in_interval) = endpoint_in.ok_or_else(|| {
        Error::Transport("could not find interrupt-in endpoint".to_string())
    })?;
    let (out_address, out_max_packet, out_interval) = endpoint_out.ok_or_else(|| {
        Error::Transport("could not find interrupt-out endpoint".to_string())
    })?;

    Ok(EndpointInfo {
        in_address,
        in_max_packet,
        in_interval,
        out_address,
        out_max_packet,
        out_interval,
    })
}

/// Open a device and hand back everything the registry needs to attach it
pub fn open_device(device: &Device<Context>, config: &DriverConfig) -> Result<TransportBinding> {
    let location = location(device);
    let endpoints = discover_endpoints(device)?;

    let mut handle = device.open().map_err(|e| {
        warn!("Failed to open {}: {}", location, e);
        map_rusb_error(e)
    })?;
    claim(&mut handle, &location)?;

    let in_interval = config.driver.min_in_interval().max(endpoints.in_interval);
    let out_interval = config.driver.min_out_interval().max(endpoints.out_interval);

    let (sender, completions) = completion_channel();
    let transport = RusbTransport::start(
        handle,
        INTERFACE,
        endpoints,
        in_interval,
        out_interval,
        sender.clone(),
        &format!("usb-{:03}-{:03}", device.bus_number(), device.address()),
    )?;

    info!("Claimed {}", location);
    Ok(TransportBinding {
        location,
        endpoints,
        transport: Box::new(transport),
        completions,
        notifier: sender,
    })
}

fn claim(handle: &mut DeviceHandle<Context>, location: &str) -> Result<()> {
    match handle.kernel_driver_active(INTERFACE) {
        Ok(true) => {
            debug!("Detaching kernel driver from {}", location);
            if let Err(e) = handle.detach_kernel_driver(INTERFACE) {
                warn!("Failed to detach kernel driver from {}: {}", location, e);
            }
        }
        Ok(false) => {}
        Err(e) => {
            debug!("Could not check kernel driver status on {}: {}", location, e);
        }
    }

    handle.claim_interface(INTERFACE).map_err(|e| {
        warn!("Failed to claim interface {} on {}: {}", INTERFACE, location, e);
        map_rusb_error(e)
    })
}

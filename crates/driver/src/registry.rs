//! Driver registry
//!
//! Tracks every attached device by minor number. The device table lock is
//! held across probe, open and disconnect, so an open can never race with the
//! teardown of the device it is opening.

use crate::config::DriverConfig;
use crate::device::{DeviceParams, TranzportDevice};
use crate::file::{OpenFile, OpenOptions};
use crate::lifecycle::spawn_dispatcher;
use common::{Error, Result, TransportBinding};
use protocol::FRAME_SIZE;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct DeviceTable {
    devices: HashMap<u32, Arc<TranzportDevice>>,
    next_minor: u32,
}

#[derive(Debug)]
pub struct DriverRegistry {
    config: DriverConfig,
    table: Mutex<DeviceTable>,
}

impl DriverRegistry {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            table: Mutex::new(DeviceTable::default()),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Attach a device; returns its minor number
    ///
    /// Nothing is registered if the device cannot be set up.
    pub fn probe(&self, binding: TransportBinding) -> Result<u32> {
        let TransportBinding {
            location,
            endpoints,
            transport,
            completions,
            notifier,
        } = binding;

        if endpoints.in_max_packet != FRAME_SIZE {
            warn!(
                "Interrupt in endpoint size is {} (expected {})",
                endpoints.in_max_packet, FRAME_SIZE
            );
        }
        if endpoints.out_max_packet < FRAME_SIZE {
            warn!(
                "Interrupt out endpoint size is {} (expected {})",
                endpoints.out_max_packet, FRAME_SIZE
            );
        }

        let mut table = self.lock();
        let minor = table.next_minor;

        let params = DeviceParams::from_config(minor, location, &self.config, &endpoints);
        debug!(
            "tranzport{}: in interval {:?}, out interval {:?}",
            minor, params.in_interval, params.out_interval
        );

        let device = Arc::new(TranzportDevice::new(
            params,
            self.config.driver.ring_buffer_size,
            transport,
            notifier,
        )?);

        // Detached: the thread exits by itself once the device is destroyed
        let _dispatcher = spawn_dispatcher(&device, completions)?;

        if self.config.driver.auto_start
            && let Err(e) = device.start_polling()
        {
            device.disconnect();
            return Err(e);
        }

        table.next_minor += 1;
        table.devices.insert(minor, Arc::clone(&device));

        info!(
            "Tranzport device {} now attached to {}",
            device.params().location,
            device.name()
        );
        Ok(minor)
    }

    /// Open a device by minor number
    pub fn open(&self, minor: u32, options: OpenOptions) -> Result<OpenFile> {
        let table = self.lock();
        let device = table
            .devices
            .get(&minor)
            .cloned()
            .ok_or(Error::NoSuchDevice(minor))?;

        device.open()?;
        Ok(OpenFile::new(device, options))
    }

    /// Detach a device
    ///
    /// Open handles stay valid but every call on them fails with `DeviceGone`;
    /// the device is freed when the last one is dropped.
    pub fn disconnect(&self, minor: u32) -> Result<()> {
        let mut table = self.lock();
        let device = table
            .devices
            .remove(&minor)
            .ok_or(Error::NoSuchDevice(minor))?;

        device.disconnect();
        Ok(())
    }

    /// Detach the device at `location`, if any
    pub fn disconnect_location(&self, location: &str) -> Option<u32> {
        let minor = self
            .devices()
            .into_iter()
            .find(|d| d.params().location == location)
            .map(|d| d.minor())?;
        self.disconnect(minor).ok().map(|_| minor)
    }

    /// Attached devices, ordered by minor
    pub fn devices(&self) -> Vec<Arc<TranzportDevice>> {
        let table = self.lock();
        let mut devices: Vec<_> = table.devices.values().cloned().collect();
        devices.sort_by_key(|d| d.minor());
        devices
    }

    pub fn device(&self, minor: u32) -> Option<Arc<TranzportDevice>> {
        self.lock().devices.get(&minor).cloned()
    }

    /// Detach everything
    pub fn shutdown(&self) {
        let mut table = self.lock();
        let count = table.devices.len();
        for (_, device) in table.devices.drain() {
            device.disconnect();
        }
        if count > 0 {
            info!("Detached {} device(s)", count);
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

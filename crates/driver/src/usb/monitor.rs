//! Hot-plug monitoring
//!
//! libusb delivers hot-plug callbacks from inside `handle_events`, where the
//! device may not be opened. The callback only forwards the event; the
//! receiver does the probing.

use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::usb::probe::location;
use common::{Error, Result};

#[derive(Debug)]
pub enum HotplugEvent {
    Arrived(Device<Context>),
    Left { location: String },
}

struct HotplugCallback {
    event_sender: async_channel::Sender<HotplugEvent>,
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!("Hot-plug: device arrived at {}", location(&device));
        if let Err(e) = self.event_sender.try_send(HotplugEvent::Arrived(device)) {
            error!("Failed to forward arrival: {}", e);
        }
    }

    fn device_left(&mut self, device: Device<Context>) {
        let location = location(&device);
        debug!("Hot-plug: device left {}", location);
        if let Err(e) = self.event_sender.try_send(HotplugEvent::Left { location }) {
            error!("Failed to forward departure: {}", e);
        }
    }
}

/// Running hot-plug registration plus the thread that pumps libusb events
pub struct HotplugMonitor {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HotplugMonitor {
    /// Watch for devices matching `filter` and forward events to `event_sender`
    ///
    /// Devices already present are not reported; enumerate them separately.
    pub fn spawn(
        context: Context,
        filter: (u16, Option<u16>),
        event_sender: async_channel::Sender<HotplugEvent>,
    ) -> Result<Self> {
        if !rusb::has_hotplug() {
            return Err(Error::Transport(
                "libusb was built without hot-plug support".to_string(),
            ));
        }

        let (vendor_id, product_id) = filter;
        let callback: Box<dyn Hotplug<Context>> = Box::new(HotplugCallback { event_sender });

        let mut builder = HotplugBuilder::new();
        builder.vendor_id(vendor_id).enumerate(false);
        if let Some(product_id) = product_id {
            builder.product_id(product_id);
        }
        let registration = builder
            .register(&context, callback)
            .map_err(crate::usb::probe::map_rusb_error)?;

        let running = Arc::new(AtomicBool::new(true));
        let thread = {
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("usb-hotplug".to_string())
                .spawn(move || run_events(context, registration, running))?
        };

        info!("Hot-plug monitoring started");
        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Hot-plug thread panicked");
        }
    }
}

impl Drop for HotplugMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_events(context: Context, registration: Registration<Context>, running: Arc<AtomicBool>) {
    // Keep the registration alive for as long as events are pumped
    let _registration = registration;

    while running.load(Ordering::Relaxed) {
        match context.handle_events(Some(Duration::from_millis(100))) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    debug!("Hot-plug thread stopped");
}

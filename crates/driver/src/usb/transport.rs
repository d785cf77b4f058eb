//! rusb-backed transport
//!
//! libusb's synchronous calls block, so each direction gets a dedicated thread.
//! A submission arms the thread; the thread performs the transfer and posts the
//! outcome through the completion channel. Cancelling bumps a generation
//! counter under the control lock, and a thread only posts while its generation
//! is still current, so nothing is delivered for a cancelled transfer.

use bytes::Bytes;
use common::{
    CompletionSender, EndpointInfo, Error, InCompletion, OutCompletion, Result, Transport,
};
use protocol::FRAME_SIZE;
use rusb::{Context, DeviceHandle};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Upper bound on a single outbound transfer
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Control {
    in_armed: bool,
    in_generation: u64,
    /// Device epoch the armed read was submitted with
    in_epoch: u64,
    out_payload: Option<Bytes>,
    out_armed: bool,
    out_generation: u64,
    stopping: bool,
}

struct Shared {
    handle: DeviceHandle<Context>,
    interface: u8,
    endpoints: EndpointInfo,
    /// Effective polling interval, used as the read timeout
    in_interval: Duration,
    /// Minimum spacing between the starts of two writes
    out_interval: Duration,
    completions: CompletionSender,
    control: Mutex<Control>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct RusbTransport {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl RusbTransport {
    /// Start the transfer threads for an opened handle with `interface` claimed
    pub fn start(
        handle: DeviceHandle<Context>,
        interface: u8,
        endpoints: EndpointInfo,
        in_interval: Duration,
        out_interval: Duration,
        completions: CompletionSender,
        name: &str,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            handle,
            interface,
            endpoints,
            in_interval,
            out_interval,
            completions,
            control: Mutex::new(Control::default()),
            changed: Condvar::new(),
        });

        let mut transport = Self {
            shared,
            threads: Vec::with_capacity(2),
        };

        let reader = Arc::clone(&transport.shared);
        transport.threads.push(
            std::thread::Builder::new()
                .name(format!("{}-in", name))
                .spawn(move || run_reader(reader))?,
        );

        let writer = Arc::clone(&transport.shared);
        transport.threads.push(
            std::thread::Builder::new()
                .name(format!("{}-out", name))
                .spawn(move || run_writer(writer))?,
        );

        Ok(transport)
    }
}

impl Transport for RusbTransport {
    fn submit_in(&self, epoch: u64) -> Result<()> {
        let mut control = self.shared.lock();
        if control.stopping {
            return Err(Error::DeviceGone);
        }
        if control.in_armed {
            return Err(Error::Transport("inbound read already armed".to_string()));
        }
        control.in_armed = true;
        control.in_epoch = epoch;
        self.shared.changed.notify_all();
        Ok(())
    }

    fn submit_out(&self, payload: Bytes) -> Result<()> {
        let mut control = self.shared.lock();
        if control.stopping {
            return Err(Error::DeviceGone);
        }
        if control.out_armed {
            return Err(Error::Busy);
        }
        control.out_payload = Some(payload);
        control.out_armed = true;
        self.shared.changed.notify_all();
        Ok(())
    }

    fn cancel_in(&self) {
        let mut control = self.shared.lock();
        control.in_armed = false;
        control.in_generation += 1;
    }

    fn cancel_out(&self) {
        let mut control = self.shared.lock();
        control.out_armed = false;
        control.out_payload = None;
        control.out_generation += 1;
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        {
            let mut control = self.shared.lock();
            control.stopping = true;
            control.in_armed = false;
            control.out_armed = false;
            self.shared.changed.notify_all();
        }

        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                warn!("USB transfer thread panicked");
            }
        }

        // Threads are joined, so this is the last reference
        if let Some(shared) = Arc::get_mut(&mut self.shared)
            && let Err(e) = shared.handle.release_interface(shared.interface)
        {
            debug!("Could not release interface {}: {}", shared.interface, e);
        }
    }
}

fn run_reader(shared: Arc<Shared>) {
    let endpoint = shared.endpoints.in_address;
    let mut buf = vec![0u8; shared.endpoints.in_max_packet.max(FRAME_SIZE)];
    debug!("Reader started on endpoint {:#04x}", endpoint);

    loop {
        let (generation, epoch) = {
            let control = shared
                .changed
                .wait_while(shared.lock(), |c| !c.in_armed && !c.stopping)
                .unwrap_or_else(PoisonError::into_inner);
            if control.stopping {
                break;
            }
            (control.in_generation, control.in_epoch)
        };

        let completion = loop {
            match shared.handle.read_interrupt(endpoint, &mut buf, shared.in_interval) {
                Ok(len) => break Some(InCompletion::Report(buf[..len].to_vec())),
                Err(rusb::Error::Timeout) => {
                    let control = shared.lock();
                    if control.stopping || control.in_generation != generation {
                        break None;
                    }
                }
                Err(rusb::Error::NoDevice) => break Some(InCompletion::DeviceGone),
                Err(e) => break Some(InCompletion::TransientError(e.to_string())),
            }
        };
        let Some(completion) = completion else {
            trace!("Read cancelled while waiting for data");
            continue;
        };

        let mut control = shared.lock();
        if control.in_armed && control.in_generation == generation {
            control.in_armed = false;
            if shared.completions.complete_in(epoch, completion).is_err() {
                break;
            }
        } else {
            trace!("Dropping completion of cancelled read");
        }
    }

    debug!("Reader stopped");
}

fn run_writer(shared: Arc<Shared>) {
    let endpoint = shared.endpoints.out_address;
    let mut last_write: Option<Instant> = None;
    debug!("Writer started on endpoint {:#04x}", endpoint);

    loop {
        let (payload, generation) = {
            let mut control = shared
                .changed
                .wait_while(shared.lock(), |c| c.out_payload.is_none() && !c.stopping)
                .unwrap_or_else(PoisonError::into_inner);
            if control.stopping {
                break;
            }
            let Some(payload) = control.out_payload.take() else {
                continue;
            };
            (payload, control.out_generation)
        };

        if let Some(last) = last_write {
            let elapsed = last.elapsed();
            if elapsed < shared.out_interval {
                std::thread::sleep(shared.out_interval - elapsed);
            }
        }
        last_write = Some(Instant::now());

        let completion = match shared.handle.write_interrupt(endpoint, &payload, WRITE_TIMEOUT) {
            Ok(len) if len == payload.len() => OutCompletion::Done,
            Ok(len) => OutCompletion::Failed(format!(
                "short write: {} of {} bytes",
                len,
                payload.len()
            )),
            Err(rusb::Error::NoDevice) => OutCompletion::DeviceGone,
            Err(e) => OutCompletion::Failed(e.to_string()),
        };

        let mut control = shared.lock();
        if control.out_armed && control.out_generation == generation {
            control.out_armed = false;
            if shared.completions.complete_out(completion).is_err() {
                break;
            }
        } else {
            trace!("Dropping completion of cancelled write");
        }
    }

    debug!("Writer stopped");
}

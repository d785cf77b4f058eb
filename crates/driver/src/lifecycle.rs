//! Device lifecycle and the completion dispatcher
//!
//! Each attached device gets one dispatcher thread. It stands in for interrupt
//! context: transports post completions to a channel and the dispatcher feeds
//! them, one at a time and in order, to the device.
//!
//! ```text
//!            first open / auto-start
//!   ┌──────┐ ───────────────────────► ┌─────────┐
//!   │ Idle │                          │ Running │
//!   └──────┘ ◄─────┐                  └─────────┘
//!                  │ still attached        │ last close / disconnect / device gone
//!                  │                  ┌──────────┐
//!                  └───────────────── │ Draining │
//!                                     └──────────┘
//!                                          │ detached and no openers
//!                                     ┌───────────┐
//!                                     │ Destroyed │
//!                                     └───────────┘
//! ```

use crate::device::TranzportDevice;
use common::{CompletionReceiver, Error, Result, TransportEvent};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, error, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Attached, no inbound loop
    Idle,
    /// Inbound loop active
    Running,
    /// Transfers being cancelled or the device has gone away
    Draining,
    /// Detached with no openers left; nothing more will happen
    Destroyed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Running => "running",
            LifecycleState::Draining => "draining",
            LifecycleState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Spawn the completion dispatcher for `device`
///
/// The thread holds only a weak reference, so it never keeps a device alive.
/// It exits on `Shutdown`, when the channel closes, when the device is dropped,
/// or once the device reaches `Destroyed`.
pub fn spawn_dispatcher(
    device: &Arc<TranzportDevice>,
    completions: CompletionReceiver,
) -> Result<JoinHandle<()>> {
    let weak = Arc::downgrade(device);
    let name = format!("{}-completions", device.name());

    std::thread::Builder::new()
        .name(name)
        .spawn(move || run_dispatcher(weak, completions))
        .map_err(Error::Io)
}

fn run_dispatcher(device: Weak<TranzportDevice>, completions: CompletionReceiver) {
    debug!("Completion dispatcher started");

    loop {
        let event = match completions.recv() {
            Ok(event) => event,
            Err(e) => {
                debug!("Completion channel closed: {}", e);
                break;
            }
        };

        let Some(device) = device.upgrade() else {
            debug!("Device dropped, dispatcher exiting");
            break;
        };

        match event {
            TransportEvent::Shutdown => {
                trace!("Dispatcher shutdown requested");
                break;
            }
            TransportEvent::In { epoch, completion } => {
                guarded(|| device.handle_in_completion(epoch, completion));
            }
            TransportEvent::Out(completion) => {
                guarded(|| device.handle_out_completion(completion));
            }
        }

        if device.lifecycle() == LifecycleState::Destroyed {
            break;
        }
    }

    debug!("Completion dispatcher stopped");
}

/// Run a completion handler, keeping the dispatcher alive if it panics
fn guarded(handler: impl FnOnce()) {
    if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(handler)) {
        error!("Panic in completion handler: {:?}", e);
    }
}

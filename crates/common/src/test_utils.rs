//! Test utilities for the Tranzport driver
//!
//! Provides a scriptable mock transport and helper functions for testing
//! across crates without hardware.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockTransport, button_frame};
//! use common::Transport;
//!
//! let (mock, _binding) = MockTransport::new();
//! mock.submit_in(1).unwrap();
//! assert!(mock.is_in_armed());
//! assert!(mock.deliver_frame(button_frame(0x0010_0000)));
//! assert!(!mock.is_in_armed());
//! ```

use crate::channel::{CompletionSender, InCompletion, OutCompletion, completion_channel};
use crate::transport::{EndpointInfo, Transport, TransportBinding};
use bytes::Bytes;
use protocol::{Frame, STATUS_OFFLINE, STATUS_ONLINE};
use std::future::Future;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct MockState {
    in_submissions: u64,
    in_armed: bool,
    in_epoch: u64,
    strict_arming: bool,
    out_payloads: Vec<Bytes>,
    out_armed: bool,
    cancel_in_count: u64,
    cancel_out_count: u64,
    auto_complete_out: bool,
    fail_next_submit: bool,
}

struct MockInner {
    completions: CompletionSender,
    state: Mutex<MockState>,
    changed: Condvar,
}

/// In-memory transport that records submissions and lets tests play the hardware
///
/// Clones share state, so a test keeps one clone while the driver owns another.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

impl MockTransport {
    /// Create a mock and a binding that hands a clone of it to the driver
    pub fn new() -> (MockTransport, TransportBinding) {
        Self::with_endpoints(EndpointInfo::default())
    }

    pub fn with_endpoints(endpoints: EndpointInfo) -> (MockTransport, TransportBinding) {
        let (completions, receiver) = completion_channel();
        let mock = MockTransport {
            inner: Arc::new(MockInner {
                completions,
                state: Mutex::new(MockState::default()),
                changed: Condvar::new(),
            }),
        };
        let binding = TransportBinding {
            location: "mock".to_string(),
            endpoints,
            transport: Box::new(mock.clone()),
            completions: receiver,
            notifier: mock.inner.completions.clone(),
        };
        (mock, binding)
    }

    /// Complete writes as soon as they are submitted
    pub fn set_auto_complete_out(&self, enabled: bool) {
        self.inner.state.lock().unwrap().auto_complete_out = enabled;
    }

    /// Reject `submit_in` while a read is still armed, as the rusb backend does
    pub fn set_strict_arming(&self, enabled: bool) {
        self.inner.state.lock().unwrap().strict_arming = enabled;
    }

    /// Make the next `submit_in`/`submit_out` fail
    pub fn fail_next_submit(&self) {
        self.inner.state.lock().unwrap().fail_next_submit = true;
    }

    /// Wait for an armed read, then complete it
    ///
    /// Returns false if no read was armed within [`DEFAULT_TEST_TIMEOUT`].
    pub fn deliver_in(&self, completion: InCompletion) -> bool {
        let state = self.inner.state.lock().unwrap();
        let (mut state, result) = self
            .inner
            .changed
            .wait_timeout_while(state, DEFAULT_TEST_TIMEOUT, |s| !s.in_armed)
            .unwrap();
        if result.timed_out() && !state.in_armed {
            return false;
        }
        state.in_armed = false;
        self.inner
            .completions
            .complete_in(state.in_epoch, completion)
            .is_ok()
    }

    /// Consume the armed read as if the hardware answered it, without posting
    ///
    /// Returns the epoch it was armed with, or `None` if nothing was armed.
    /// The caller hands the completion to the device itself.
    pub fn disarm_in(&self) -> Option<u64> {
        let mut state = self.inner.state.lock().unwrap();
        if !state.in_armed {
            return None;
        }
        state.in_armed = false;
        self.inner.changed.notify_all();
        Some(state.in_epoch)
    }

    /// Deliver one report frame
    pub fn deliver_frame(&self, frame: Frame) -> bool {
        self.deliver_in(InCompletion::Report(frame.as_bytes().to_vec()))
    }

    /// Post an inbound completion whether or not a read is armed
    pub fn inject_in(&self, completion: InCompletion) {
        let epoch = self.inner.state.lock().unwrap().in_epoch;
        let _ = self.inner.completions.complete_in(epoch, completion);
    }

    /// Wait for an outstanding write, then complete it
    pub fn complete_out(&self, completion: OutCompletion) -> bool {
        let state = self.inner.state.lock().unwrap();
        let (mut state, result) = self
            .inner
            .changed
            .wait_timeout_while(state, DEFAULT_TEST_TIMEOUT, |s| !s.out_armed)
            .unwrap();
        if result.timed_out() && !state.out_armed {
            return false;
        }
        state.out_armed = false;
        self.inner.completions.complete_out(completion).is_ok()
    }

    /// Simulate unplugging: the armed read completes with `DeviceGone`
    pub fn unplug(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.in_armed {
            state.in_armed = false;
            let _ = self
                .inner
                .completions
                .complete_in(state.in_epoch, InCompletion::DeviceGone);
        }
    }

    /// Wait until at least `count` reads have been submitted
    pub fn wait_for_in_submissions(&self, count: u64, timeout: Duration) -> bool {
        let state = self.inner.state.lock().unwrap();
        let (state, _) = self
            .inner
            .changed
            .wait_timeout_while(state, timeout, |s| s.in_submissions < count)
            .unwrap();
        state.in_submissions >= count
    }

    /// Wait until at least `count` writes have been submitted
    pub fn wait_for_out_payloads(&self, count: usize, timeout: Duration) -> bool {
        let state = self.inner.state.lock().unwrap();
        let (state, _) = self
            .inner
            .changed
            .wait_timeout_while(state, timeout, |s| s.out_payloads.len() < count)
            .unwrap();
        state.out_payloads.len() >= count
    }

    pub fn in_submissions(&self) -> u64 {
        self.inner.state.lock().unwrap().in_submissions
    }

    pub fn is_in_armed(&self) -> bool {
        self.inner.state.lock().unwrap().in_armed
    }

    /// Epoch of the most recent read submission
    pub fn in_epoch(&self) -> u64 {
        self.inner.state.lock().unwrap().in_epoch
    }

    pub fn is_out_armed(&self) -> bool {
        self.inner.state.lock().unwrap().out_armed
    }

    pub fn out_payloads(&self) -> Vec<Bytes> {
        self.inner.state.lock().unwrap().out_payloads.clone()
    }

    pub fn cancel_in_count(&self) -> u64 {
        self.inner.state.lock().unwrap().cancel_in_count
    }

    pub fn cancel_out_count(&self) -> u64 {
        self.inner.state.lock().unwrap().cancel_out_count
    }

    fn take_failure(state: &mut MockState) -> crate::Result<()> {
        if std::mem::take(&mut state.fail_next_submit) {
            return Err(crate::Error::Transport("injected submit failure".into()));
        }
        Ok(())
    }
}

impl Transport for MockTransport {
    fn submit_in(&self, epoch: u64) -> crate::Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        Self::take_failure(&mut state)?;
        if state.strict_arming && state.in_armed {
            return Err(crate::Error::Transport(
                "inbound read already armed".to_string(),
            ));
        }
        state.in_submissions += 1;
        state.in_armed = true;
        state.in_epoch = epoch;
        self.inner.changed.notify_all();
        Ok(())
    }

    fn submit_out(&self, payload: Bytes) -> crate::Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        Self::take_failure(&mut state)?;
        state.out_payloads.push(payload);
        if state.auto_complete_out {
            let _ = self.inner.completions.complete_out(OutCompletion::Done);
        } else {
            state.out_armed = true;
        }
        self.inner.changed.notify_all();
        Ok(())
    }

    fn cancel_in(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.in_armed = false;
        state.cancel_in_count += 1;
        self.inner.changed.notify_all();
    }

    fn cancel_out(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.out_armed = false;
        state.cancel_out_count += 1;
        self.inner.changed.notify_all();
    }
}

/// Build an online report with the given button mask and no wheel movement
pub fn button_frame(buttons: u32) -> Frame {
    let b = buttons.to_be_bytes();
    Frame::new([0x00, STATUS_ONLINE, b[0], b[1], b[2], b[3], 0x00, 0x00])
}

/// Build an online report with only wheel movement
pub fn wheel_frame(delta: i8) -> Frame {
    button_frame(0).with_wheel(delta)
}

/// Build the report the surface sends when its link drops
pub fn offline_frame() -> Frame {
    Frame::new([0x00, STATUS_OFFLINE, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00])
}

/// Build a frame tagged with a sequence number in bytes 2..6
///
/// Useful for ordering checks; the number can be recovered with [`frame_seq`].
pub fn seq_frame(seq: u32) -> Frame {
    button_frame(seq)
}

/// Recover the sequence number of a [`seq_frame`]
pub fn frame_seq(frame: &Frame) -> u32 {
    let b = frame.as_bytes();
    u32::from_be_bytes([b[2], b[3], b[4], b[5]])
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

//! Per-device handle
//!
//! A `TranzportDevice` owns the transport for one control surface, the ring of
//! unread reports, and the bookkeeping shared between user calls and the
//! completion path. All of it lives behind one mutex; readers and writers park
//! on their own condition variables.
//!
//! Only one inbound read and one outbound write are ever in flight. The
//! completion path resubmits the inbound read after every completion for as
//! long as the loop is running.

use crate::config::{DriverConfig, RetrySettings};
use crate::lifecycle::LifecycleState;
use crate::ring::{RingBuffer, RingStats};
use bytes::Bytes;
use common::{
    CompletionSender, EndpointInfo, Error, InCompletion, OutCompletion, Result, Transport,
};
use protocol::{FRAME_SIZE, Frame, STATUS_OFFLINE, max_payload};
use serde::Serialize;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Fixed parameters of one device, derived from the configuration at probe time
#[derive(Debug, Clone)]
pub struct DeviceParams {
    pub minor: u32,
    pub location: String,
    /// Effective inbound polling interval
    pub in_interval: Duration,
    /// Effective minimum spacing between writes
    pub out_interval: Duration,
    pub write_buffer_size: usize,
    pub compress_wheel: bool,
    pub suppress_extra_offline_events: bool,
    pub exclusive_open: bool,
    pub auto_start: bool,
    pub debug: bool,
    pub release_timeout: Duration,
    pub retry: RetrySettings,
}

impl DeviceParams {
    pub fn from_config(
        minor: u32,
        location: impl Into<String>,
        config: &DriverConfig,
        endpoints: &EndpointInfo,
    ) -> Self {
        let driver = &config.driver;
        Self {
            minor,
            location: location.into(),
            in_interval: driver.min_in_interval().max(endpoints.in_interval),
            out_interval: driver.min_out_interval().max(endpoints.out_interval),
            write_buffer_size: driver.write_buffer_size,
            compress_wheel: driver.compress_wheel,
            suppress_extra_offline_events: driver.suppress_extra_offline_events,
            exclusive_open: driver.exclusive_open,
            auto_start: driver.auto_start,
            debug: driver.debug,
            release_timeout: driver.release_timeout(),
            retry: config.retry.clone(),
        }
    }
}

/// Readiness as reported by `poll`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Readiness {
    /// At least one unread report
    pub readable: bool,
    /// The outbound slot is free
    pub writable: bool,
    /// The device is gone; reads and writes will fail
    pub hangup: bool,
}

/// Snapshot of a device's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub ring: RingStats,
    pub malformed_reports: u64,
    pub transient_errors: u64,
    pub suppressed_offline: u64,
    pub writes: u64,
    pub write_failures: u64,
}

struct DeviceState {
    open_count: u32,
    attached: bool,
    /// Transport reported the device gone, or the inbound loop gave up
    transport_gone: bool,
    enable: bool,
    offline: bool,
    compress_wheel: bool,
    in_running: bool,
    /// Bumped each time an inbound loop starts; completions carry it back
    in_epoch: u64,
    out_busy: bool,
    lifecycle: LifecycleState,
    ring: RingBuffer,
    consecutive_transient: u32,
    overflow_warned: bool,
    stats: DeviceStats,
}

impl DeviceState {
    fn unavailable(&self) -> bool {
        !self.attached || self.transport_gone
    }
}

pub struct TranzportDevice {
    params: DeviceParams,
    transport: Box<dyn Transport>,
    notifier: CompletionSender,
    state: Mutex<DeviceState>,
    read_wait: Condvar,
    write_wait: Condvar,
}

impl TranzportDevice {
    /// Build a device around an attached transport
    ///
    /// Fails with `ResourceExhausted` if the ring cannot be allocated.
    pub fn new(
        params: DeviceParams,
        ring_capacity: usize,
        transport: Box<dyn Transport>,
        notifier: CompletionSender,
    ) -> Result<Self> {
        let ring = RingBuffer::with_capacity(ring_capacity)?;
        let compress_wheel = params.compress_wheel;

        Ok(Self {
            params,
            transport,
            notifier,
            state: Mutex::new(DeviceState {
                open_count: 0,
                attached: true,
                transport_gone: false,
                enable: false,
                offline: false,
                compress_wheel,
                in_running: false,
                in_epoch: 0,
                out_busy: false,
                lifecycle: LifecycleState::Idle,
                ring,
                consecutive_transient: 0,
                overflow_warned: false,
                stats: DeviceStats::default(),
            }),
            read_wait: Condvar::new(),
            write_wait: Condvar::new(),
        })
    }

    pub fn minor(&self) -> u32 {
        self.params.minor
    }

    /// Device node name, e.g. "tranzport0"
    pub fn name(&self) -> String {
        format!("tranzport{}", self.params.minor)
    }

    pub fn params(&self) -> &DeviceParams {
        &self.params
    }

    // ------------------------------------------------------------------
    // Open / release
    // ------------------------------------------------------------------

    /// Register an opener; the first one starts the inbound loop
    pub fn open(&self) -> Result<()> {
        let mut st = self.lock();

        if !st.attached {
            return Err(Error::DeviceGone);
        }
        if self.params.exclusive_open && st.open_count > 0 {
            return Err(Error::Busy);
        }

        if st.open_count == 0 {
            if !st.in_running {
                st.ring.clear();
                st.offline = false;
                st.transport_gone = false;
                st.consecutive_transient = 0;
                self.start_in(&mut st)?;
            }
            st.enable = true;
            st.compress_wheel = self.params.compress_wheel;
        }

        st.open_count += 1;
        debug!(
            "{}: opened (open count {})",
            self.name(),
            st.open_count
        );
        Ok(())
    }

    /// Start polling before anyone opens the device
    pub fn start_polling(&self) -> Result<()> {
        let mut st = self.lock();
        if !st.attached {
            return Err(Error::DeviceGone);
        }
        if st.in_running {
            return Ok(());
        }
        self.start_in(&mut st)
    }

    /// Drop an opener; the last one lets pending output finish, then stops transfers
    pub fn release(&self) {
        let mut st = self.lock();

        if st.open_count == 0 {
            warn!("{}: release without matching open", self.name());
            return;
        }
        st.open_count -= 1;
        debug!(
            "{}: released (open count {})",
            self.name(),
            st.open_count
        );
        if st.open_count > 0 {
            return;
        }

        if st.out_busy && !st.unavailable() {
            let (guard, result) = self
                .write_wait
                .wait_timeout_while(st, self.params.release_timeout, |s| {
                    s.out_busy && !s.unavailable()
                })
                .unwrap_or_else(PoisonError::into_inner);
            st = guard;
            if result.timed_out() {
                debug!("{}: outstanding write did not finish before close", self.name());
            }
            // Someone may have opened again while we waited, or a disconnect
            // may already have torn the device down
            if st.open_count > 0 || st.lifecycle == LifecycleState::Destroyed {
                return;
            }
        }

        st.enable = false;

        if !st.attached {
            self.destroy(&mut st);
            return;
        }

        if self.params.auto_start && !st.transport_gone {
            return;
        }

        st.lifecycle = LifecycleState::Draining;
        self.abort_transfers(&mut st);
        st.lifecycle = LifecycleState::Idle;
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Copy unread reports into `buf`, as many whole frames as fit
    pub fn read(&self, buf: &mut [u8], nonblocking: bool) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if buf.len() < FRAME_SIZE {
            return Err(Error::InvalidArgument(format!(
                "read buffer of {} bytes is smaller than one {} byte report",
                buf.len(),
                FRAME_SIZE
            )));
        }

        let mut st = self.wait_readable(nonblocking)?;

        let wanted = buf.len() / FRAME_SIZE;
        let mut copied = 0;
        while copied < wanted {
            let next = if st.compress_wheel {
                st.ring.pop_coalesced()
            } else {
                st.ring.pop()
            };
            let Some(frame) = next else { break };
            buf[copied * FRAME_SIZE..(copied + 1) * FRAME_SIZE].copy_from_slice(frame.as_bytes());
            copied += 1;
        }
        st.overflow_warned = false;

        Ok(copied * FRAME_SIZE)
    }

    /// Take exactly one report
    pub fn read_frame(&self, nonblocking: bool) -> Result<Frame> {
        let mut st = self.wait_readable(nonblocking)?;
        let next = if st.compress_wheel {
            st.ring.pop_coalesced()
        } else {
            st.ring.pop()
        };
        st.overflow_warned = false;
        next.ok_or(Error::WouldBlock)
    }

    /// Block until the ring has data, returning the guard; or fail with the
    /// reason no data will come
    fn wait_readable(&self, nonblocking: bool) -> Result<MutexGuard<'_, DeviceState>> {
        let mut st = self.lock();
        loop {
            if st.unavailable() {
                return Err(Error::DeviceGone);
            }
            if !st.ring.is_empty() {
                return Ok(st);
            }
            if st.offline {
                return Err(Error::Offline);
            }
            if nonblocking {
                return Err(Error::WouldBlock);
            }
            st = self
                .read_wait
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Send one or more 8 byte command frames as a single transfer
    pub fn write(&self, buf: &[u8], nonblocking: bool) -> Result<usize> {
        let limit = max_payload(self.params.write_buffer_size);
        if buf.is_empty() || buf.len() % FRAME_SIZE != 0 || buf.len() > limit {
            return Err(Error::InvalidArgument(format!(
                "write of {} bytes; expected a multiple of {} up to {}",
                buf.len(),
                FRAME_SIZE,
                limit
            )));
        }
        let payload = Bytes::copy_from_slice(buf);

        let mut st = self.lock();
        loop {
            if st.unavailable() {
                return Err(Error::DeviceGone);
            }
            if !st.out_busy {
                break;
            }
            if nonblocking {
                return Err(Error::WouldBlock);
            }
            st = self
                .write_wait
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if self.params.debug {
            debug!("{}: write {:02x?}", self.name(), buf);
        }

        st.out_busy = true;
        if let Err(e) = self.transport.submit_out(payload) {
            st.out_busy = false;
            self.write_wait.notify_all();
            error!("{}: failed submitting write: {}", self.name(), e);
            return Err(e);
        }
        st.stats.writes += 1;

        Ok(buf.len())
    }

    /// Wait for the outstanding write to complete
    ///
    /// Returns false if it was still pending when `timeout` expired.
    pub fn flush(&self, timeout: Duration) -> Result<bool> {
        let st = self.lock();
        let (st, _) = self
            .write_wait
            .wait_timeout_while(st, timeout, |s| s.out_busy && !s.unavailable())
            .unwrap_or_else(PoisonError::into_inner);

        if st.unavailable() {
            return Err(Error::DeviceGone);
        }
        Ok(!st.out_busy)
    }

    // ------------------------------------------------------------------
    // Readiness
    // ------------------------------------------------------------------

    pub fn poll(&self) -> Readiness {
        Self::readiness(&self.lock())
    }

    /// Wait up to `timeout` for the device to become readable or hang up
    pub fn poll_wait(&self, timeout: Duration) -> Readiness {
        let st = self.lock();
        let (st, _) = self
            .read_wait
            .wait_timeout_while(st, timeout, |s| s.ring.is_empty() && !s.unavailable())
            .unwrap_or_else(PoisonError::into_inner);
        Self::readiness(&st)
    }

    fn readiness(st: &DeviceState) -> Readiness {
        let hangup = st.unavailable();
        Readiness {
            readable: !st.ring.is_empty(),
            writable: !st.out_busy && !hangup,
            hangup,
        }
    }

    // ------------------------------------------------------------------
    // Completion path
    // ------------------------------------------------------------------

    /// Handle the outcome of the inbound read submitted with `epoch`
    ///
    /// Completions from a loop that has since been stopped, including one
    /// restarted by a later open, are ignored.
    pub fn handle_in_completion(&self, epoch: u64, completion: InCompletion) {
        let mut st = self.lock();

        if !st.in_running {
            trace!("{}: inbound completion after stop, ignored", self.name());
            return;
        }
        if epoch != st.in_epoch {
            debug!(
                "{}: completion from read epoch {} (current {}), ignored",
                self.name(),
                epoch,
                st.in_epoch
            );
            return;
        }

        match completion {
            InCompletion::DeviceGone => {
                info!("{}: device gone, inbound polling stopped", self.name());
                self.quiesce(&mut st);
            }
            InCompletion::TransientError(reason) => {
                st.consecutive_transient += 1;
                st.stats.transient_errors += 1;
                debug!(
                    "{}: nonzero status received: {} ({} in a row)",
                    self.name(),
                    reason,
                    st.consecutive_transient
                );

                if let Some(max) = self.params.retry.max_consecutive_transient_errors
                    && st.consecutive_transient > max
                {
                    error!(
                        "{}: {} consecutive transfer errors, giving up",
                        self.name(),
                        st.consecutive_transient
                    );
                    self.quiesce(&mut st);
                    return;
                }

                let backoff = self.params.retry.backoff();
                if !backoff.is_zero() {
                    drop(st);
                    std::thread::sleep(backoff);
                    st = self.lock();
                    if !st.in_running || st.in_epoch != epoch {
                        trace!("{}: read stopped during backoff", self.name());
                        return;
                    }
                }
                self.resubmit_in(&mut st);
            }
            InCompletion::Report(data) => {
                st.consecutive_transient = 0;
                match Frame::from_slice(&data) {
                    Ok(frame) => self.accept_frame(&mut st, frame),
                    Err(_) => {
                        warn!(
                            "{}: report length was {} bytes, discarding",
                            self.name(),
                            data.len()
                        );
                        st.stats.malformed_reports += 1;
                    }
                }
                self.resubmit_in(&mut st);
            }
        }
    }

    /// Handle the outcome of the outbound write
    pub fn handle_out_completion(&self, completion: OutCompletion) {
        let mut st = self.lock();

        if !st.out_busy {
            trace!("{}: write completion with nothing pending, ignored", self.name());
            return;
        }

        match completion {
            OutCompletion::Done => {}
            OutCompletion::Failed(reason) => {
                warn!("{}: write failed: {}", self.name(), reason);
                st.stats.write_failures += 1;
            }
            OutCompletion::DeviceGone => {
                info!("{}: device gone during write", self.name());
                st.transport_gone = true;
                self.read_wait.notify_all();
            }
        }

        st.out_busy = false;
        self.write_wait.notify_all();
    }

    fn accept_frame(&self, st: &mut DeviceState, frame: Frame) {
        if frame.status() == STATUS_OFFLINE {
            if st.offline && self.params.suppress_extra_offline_events {
                st.stats.suppressed_offline += 1;
                trace!("{}: repeated offline report suppressed", self.name());
                return;
            }
            if !st.offline {
                info!("{}: surface went offline", self.name());
                st.offline = true;
            }
        } else if st.offline {
            info!("{}: surface back online", self.name());
            st.offline = false;
        }

        if self.params.debug {
            debug!("{}: received {}", self.name(), frame);
        } else {
            trace!("{}: received {}", self.name(), frame);
        }

        if st.ring.push(frame) && !st.overflow_warned {
            warn!(
                "{}: ring buffer overflow, dropping oldest reports",
                self.name()
            );
            st.overflow_warned = true;
        }

        self.read_wait.notify_all();
    }

    fn start_in(&self, st: &mut DeviceState) -> Result<()> {
        let epoch = st.in_epoch.wrapping_add(1);
        self.transport.submit_in(epoch).inspect_err(|e| {
            error!("{}: failed submitting read: {}", self.name(), e);
        })?;
        st.in_epoch = epoch;
        st.in_running = true;
        st.lifecycle = LifecycleState::Running;
        Ok(())
    }

    fn resubmit_in(&self, st: &mut DeviceState) {
        if let Err(e) = self.transport.submit_in(st.in_epoch) {
            error!("{}: failed resubmitting read: {}", self.name(), e);
            self.quiesce(st);
        }
    }

    /// Stop the inbound loop for good and wake everyone waiting on it
    fn quiesce(&self, st: &mut DeviceState) {
        st.in_running = false;
        st.transport_gone = true;
        if st.lifecycle == LifecycleState::Running {
            st.lifecycle = LifecycleState::Draining;
        }
        self.read_wait.notify_all();
        self.write_wait.notify_all();
    }

    fn abort_transfers(&self, st: &mut DeviceState) {
        if st.in_running {
            st.in_running = false;
            self.transport.cancel_in();
        }
        if st.out_busy {
            self.transport.cancel_out();
            st.out_busy = false;
        }
        self.read_wait.notify_all();
        self.write_wait.notify_all();
    }

    fn destroy(&self, st: &mut DeviceState) {
        self.abort_transfers(st);
        st.ring.clear();
        st.lifecycle = LifecycleState::Destroyed;
        if self.notifier.shutdown().is_err() {
            trace!("{}: dispatcher already gone", self.name());
        }
        info!("{}: {} now disconnected", self.name(), self.params.location);
    }

    // ------------------------------------------------------------------
    // Disconnect
    // ------------------------------------------------------------------

    /// The hardware went away
    ///
    /// Every pending and future read or write fails with `DeviceGone`. The
    /// device is torn down now if nobody has it open, otherwise by the last
    /// `release`.
    pub fn disconnect(&self) {
        let mut st = self.lock();
        if !st.attached {
            return;
        }

        st.attached = false;
        st.lifecycle = LifecycleState::Draining;
        self.abort_transfers(&mut st);

        if st.open_count == 0 {
            self.destroy(&mut st);
        } else {
            debug!(
                "{}: disconnected with {} opener(s) left",
                self.name(),
                st.open_count
            );
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn lifecycle(&self) -> LifecycleState {
        self.lock().lifecycle
    }

    pub fn is_attached(&self) -> bool {
        self.lock().attached
    }

    pub fn open_count(&self) -> u32 {
        self.lock().open_count
    }

    pub fn stats(&self) -> DeviceStats {
        let st = self.lock();
        DeviceStats {
            ring: st.ring.stats(),
            ..st.stats
        }
    }

    /// Reports waiting to be read
    pub fn pending(&self) -> usize {
        self.lock().ring.len()
    }

    pub fn enable(&self) -> bool {
        self.lock().enable
    }

    pub fn offline(&self) -> bool {
        self.lock().offline
    }

    pub fn compress_wheel(&self) -> bool {
        self.lock().compress_wheel
    }

    pub fn set_compress_wheel(&self, enabled: bool) {
        self.lock().compress_wheel = enabled;
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for TranzportDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranzportDevice")
            .field("minor", &self.params.minor)
            .field("location", &self.params.location)
            .finish_non_exhaustive()
    }
}

//! Device Integration Tests
//!
//! Drives attached devices end to end through the registry, with the mock
//! transport playing the hardware and the real completion dispatcher in
//! between.
//!
//! # Test Scenarios
//! - Blocking and non-blocking reads
//! - Write serialization
//! - Producer/consumer ordering under overflow
//! - Disconnect while readers and writers are blocked
//! - Offline, malformed and transient reports
//!
//! Run with: `cargo test -p driver --test device_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockTransport, button_frame, frame_seq, offline_frame, seq_frame,
    wait_until, wheel_frame,
};
use common::{Error, InCompletion, OutCompletion};
use driver::{DriverConfig, DriverRegistry, LifecycleState, OpenOptions};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Long enough for a blocked thread to have parked
const SETTLE: Duration = Duration::from_millis(50);

fn attach(config: DriverConfig) -> (Arc<DriverRegistry>, MockTransport, u32) {
    let registry = Arc::new(DriverRegistry::new(config));
    let (mock, binding) = MockTransport::new();
    let minor = registry.probe(binding).expect("Probe failed");
    (registry, mock, minor)
}

fn attach_default() -> (Arc<DriverRegistry>, MockTransport, u32) {
    attach(DriverConfig::default())
}

// ============================================================================
// Read Tests
// ============================================================================

#[test]
fn test_nonblocking_read_without_data_would_block() {
    let (registry, mock, minor) = attach_default();
    let file = registry
        .open(minor, OpenOptions::new().nonblocking(true))
        .unwrap();

    let mut buf = [0u8; 8];
    assert!(matches!(file.read(&mut buf), Err(Error::WouldBlock)));
    assert!(!file.poll().readable);
    assert!(mock.is_in_armed());
}

#[test]
fn test_blocking_read_wakes_on_report() {
    let (registry, mock, minor) = attach_default();
    let file = registry.open(minor, OpenOptions::new()).unwrap();

    let (tx, rx) = mpsc::channel();
    let reader = thread::spawn(move || {
        tx.send(file.read_frame()).unwrap();
    });

    thread::sleep(SETTLE);
    assert!(mock.deliver_frame(button_frame(0x0000_0400)));

    let frame = rx
        .recv_timeout(DEFAULT_TEST_TIMEOUT)
        .expect("Reader never woke")
        .unwrap();
    assert_eq!(frame, button_frame(0x0000_0400));
    reader.join().unwrap();
}

#[test]
fn test_read_returns_several_frames_when_they_fit() {
    let mut config = DriverConfig::default();
    config.driver.compress_wheel = false;
    let (registry, mock, minor) = attach(config);
    let file = registry.open(minor, OpenOptions::new()).unwrap();
    let device = Arc::clone(file.device());

    for seq in 1..=3 {
        assert!(mock.deliver_frame(seq_frame(seq)));
    }
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || device.pending() == 3));

    let mut buf = [0u8; 24];
    assert_eq!(file.read(&mut buf).unwrap(), 24);
    assert_eq!(buf[5], 1);
    assert_eq!(buf[13], 2);
    assert_eq!(buf[21], 3);
}

#[test]
fn test_wheel_reports_coalesce_on_read() {
    let (registry, mock, minor) = attach_default();
    let file = registry.open(minor, OpenOptions::new()).unwrap();
    let device = Arc::clone(file.device());

    for _ in 0..4 {
        assert!(mock.deliver_frame(wheel_frame(-2)));
    }
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || device.pending() == 4));

    assert_eq!(file.read_frame().unwrap().wheel(), -8);
    assert_eq!(device.pending(), 0);
}

// ============================================================================
// Write Tests
// ============================================================================

#[test]
fn test_second_write_waits_for_first() {
    let (registry, mock, minor) = attach_default();
    let file = Arc::new(registry.open(minor, OpenOptions::new()).unwrap());

    let first = [0x11u8; 8];
    let second = [0x22u8; 8];
    assert_eq!(file.write(&first).unwrap(), 8);

    let (tx, rx) = mpsc::channel();
    let writer = {
        let file = Arc::clone(&file);
        thread::spawn(move || {
            tx.send(file.write(&second)).unwrap();
        })
    };

    thread::sleep(SETTLE);
    assert!(rx.try_recv().is_err(), "Second write did not wait");
    assert_eq!(mock.out_payloads().len(), 1);

    assert!(mock.complete_out(OutCompletion::Done));
    assert_eq!(
        rx.recv_timeout(DEFAULT_TEST_TIMEOUT)
            .expect("Writer never woke")
            .unwrap(),
        8
    );
    writer.join().unwrap();

    let payloads = mock.out_payloads();
    assert_eq!(payloads.len(), 2);
    assert_eq!(&payloads[0][..], &first);
    assert_eq!(&payloads[1][..], &second);

    assert!(mock.complete_out(OutCompletion::Done));
    assert!(file.flush(DEFAULT_TEST_TIMEOUT).unwrap());
}

#[test]
fn test_nonblocking_write_while_busy() {
    let (registry, _mock, minor) = attach_default();
    let file = registry
        .open(minor, OpenOptions::new().nonblocking(true))
        .unwrap();

    file.write(&[0u8; 8]).unwrap();
    assert!(!file.poll().writable);
    assert!(matches!(file.write(&[0u8; 8]), Err(Error::WouldBlock)));
}

#[test]
fn test_invalid_write_changes_nothing() {
    let (registry, mock, minor) = attach_default();
    let file = registry.open(minor, OpenOptions::new()).unwrap();

    assert!(matches!(
        file.write(&[0u8; 5]),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        file.write(&[0u8; 40]),
        Err(Error::InvalidArgument(_))
    ));
    assert!(mock.out_payloads().is_empty());
    assert!(file.poll().writable);
}

#[test]
fn test_write_frames_packs_one_transfer() {
    let (registry, mock, minor) = attach_default();
    let file = registry.open(minor, OpenOptions::new()).unwrap();
    mock.set_auto_complete_out(true);

    let frames = protocol::lcd_line(0, "Hello").unwrap();
    assert_eq!(file.write_frames(&frames).unwrap(), 16);
    assert!(file.flush(DEFAULT_TEST_TIMEOUT).unwrap());
    assert_eq!(mock.out_payloads()[0].len(), 16);
}

// ============================================================================
// Producer / Consumer Tests
// ============================================================================

#[test]
fn test_concurrent_producer_consumer_keeps_order() {
    let mut config = DriverConfig::default();
    config.driver.ring_buffer_size = 16;
    let (registry, mock, minor) = attach(config);
    let file = registry.open(minor, OpenOptions::new()).unwrap();

    let producer = thread::spawn(move || {
        for seq in 1..=1000u32 {
            assert!(mock.deliver_frame(seq_frame(seq)), "Read not rearmed");
        }
    });

    let mut seen = Vec::new();
    loop {
        let frame = file.read_frame().expect("Read failed");
        let seq = frame_seq(&frame);
        seen.push(seq);
        if seq == 1000 {
            break;
        }
    }
    producer.join().unwrap();

    assert!(seen.windows(2).all(|w| w[0] < w[1]), "Reordered or duplicated");
    assert!(seen.iter().all(|s| (1..=1000).contains(s)));
}

// ============================================================================
// Disconnect Tests
// ============================================================================

#[test]
fn test_disconnect_unblocks_reader_and_destroys_after_close() {
    let (registry, mock, minor) = attach_default();
    let file = registry.open(minor, OpenOptions::new()).unwrap();
    let device = Arc::clone(file.device());

    let (tx, rx) = mpsc::channel();
    let reader = thread::spawn(move || {
        let result = file.read_frame();
        tx.send(result.map(|_| ())).unwrap();
        // file dropped here: the last reference
    });

    thread::sleep(SETTLE);
    registry.disconnect(minor).unwrap();

    let result = rx
        .recv_timeout(DEFAULT_TEST_TIMEOUT)
        .expect("Reader stayed blocked after disconnect");
    assert!(matches!(result, Err(Error::DeviceGone)));
    reader.join().unwrap();

    assert_eq!(device.lifecycle(), LifecycleState::Destroyed);
    assert_eq!(mock.cancel_in_count(), 1);
    assert!(registry.device(minor).is_none());
}

#[test]
fn test_disconnect_unblocks_writer() {
    let (registry, _mock, minor) = attach_default();
    let file = Arc::new(registry.open(minor, OpenOptions::new()).unwrap());
    file.write(&[0u8; 8]).unwrap();

    let (tx, rx) = mpsc::channel();
    let writer = {
        let file = Arc::clone(&file);
        thread::spawn(move || {
            tx.send(file.write(&[1u8; 8]).map(|_| ())).unwrap();
        })
    };

    thread::sleep(SETTLE);
    registry.disconnect(minor).unwrap();

    let result = rx
        .recv_timeout(DEFAULT_TEST_TIMEOUT)
        .expect("Writer stayed blocked after disconnect");
    assert!(matches!(result, Err(Error::DeviceGone)));
    writer.join().unwrap();
    assert!(file.poll().hangup);
}

#[test]
fn test_open_after_disconnect_fails() {
    let (registry, _mock, minor) = attach_default();
    registry.disconnect(minor).unwrap();
    assert!(matches!(
        registry.open(minor, OpenOptions::new()),
        Err(Error::NoSuchDevice(_))
    ));
}

#[test]
fn test_unplug_reported_by_transport() {
    let (registry, mock, minor) = attach_default();
    let file = registry.open(minor, OpenOptions::new()).unwrap();
    let device = Arc::clone(file.device());

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || mock.is_in_armed()));
    mock.unplug();

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || device.poll().hangup));
    assert!(matches!(file.read_frame(), Err(Error::DeviceGone)));
    assert_eq!(mock.in_submissions(), 1);

    registry.disconnect(minor).unwrap();
    drop(file);
    assert_eq!(device.lifecycle(), LifecycleState::Destroyed);
}

#[test]
fn test_shutdown_detaches_everything() {
    let registry = DriverRegistry::new(DriverConfig::default());
    let (_a, binding_a) = MockTransport::new();
    let (_b, binding_b) = MockTransport::new();
    registry.probe(binding_a).unwrap();
    registry.probe(binding_b).unwrap();

    let devices = registry.devices();
    registry.shutdown();

    assert!(registry.devices().is_empty());
    assert!(
        devices
            .iter()
            .all(|d| d.lifecycle() == LifecycleState::Destroyed)
    );
}

// ============================================================================
// Open / Close Tests
// ============================================================================

#[test]
fn test_reference_counted_open() {
    let (registry, mock, minor) = attach_default();
    let first = registry.open(minor, OpenOptions::new()).unwrap();
    let second = registry.open(minor, OpenOptions::new()).unwrap();
    let device = Arc::clone(first.device());
    assert_eq!(device.open_count(), 2);

    drop(first);
    assert_eq!(device.lifecycle(), LifecycleState::Running);
    assert_eq!(mock.cancel_in_count(), 0);

    drop(second);
    assert_eq!(device.lifecycle(), LifecycleState::Idle);
    assert_eq!(mock.cancel_in_count(), 1);
}

#[test]
fn test_exclusive_open() {
    let mut config = DriverConfig::default();
    config.driver.exclusive_open = true;
    let (registry, _mock, minor) = attach(config);

    let file = registry.open(minor, OpenOptions::new()).unwrap();
    assert!(matches!(
        registry.open(minor, OpenOptions::new()),
        Err(Error::Busy)
    ));
    drop(file);
    assert!(registry.open(minor, OpenOptions::new()).is_ok());
}

#[test]
fn test_reopen_discards_stale_reports() {
    let (registry, mock, minor) = attach_default();
    let file = registry.open(minor, OpenOptions::new()).unwrap();
    let device = Arc::clone(file.device());

    assert!(mock.deliver_frame(button_frame(1)));
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || device.pending() == 1));
    drop(file);

    let file = registry
        .open(minor, OpenOptions::new().nonblocking(true))
        .unwrap();
    assert!(matches!(file.read_frame(), Err(Error::WouldBlock)));
}

#[test]
fn test_close_waits_for_pending_write() {
    let mut config = DriverConfig::default();
    config.driver.release_timeout_ms = 2000;
    let (registry, mock, minor) = attach(config);
    let file = registry.open(minor, OpenOptions::new()).unwrap();
    let device = Arc::clone(file.device());
    file.write(&[0u8; 8]).unwrap();

    let completer = thread::spawn(move || {
        thread::sleep(SETTLE);
        assert!(mock.complete_out(OutCompletion::Done));
        mock
    });

    drop(file);
    let mock = completer.join().unwrap();
    assert_eq!(mock.cancel_out_count(), 0);
    assert_eq!(device.lifecycle(), LifecycleState::Idle);
}

// ============================================================================
// Report Handling Tests
// ============================================================================

#[test]
fn test_offline_reporting() {
    let (registry, mock, minor) = attach_default();
    let file = registry.open(minor, OpenOptions::new()).unwrap();
    let device = Arc::clone(file.device());

    for _ in 0..3 {
        assert!(mock.deliver_frame(offline_frame()));
    }
    assert!(mock.wait_for_in_submissions(4, DEFAULT_TEST_TIMEOUT));
    assert!(device.offline());
    assert_eq!(driver::show_attribute(&device, "offline").unwrap(), "1\n");

    assert_eq!(file.read_frame().unwrap(), offline_frame());
    assert!(matches!(file.read_frame(), Err(Error::Offline)));

    assert!(mock.deliver_frame(button_frame(0)));
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !device.offline()));
    assert_eq!(file.read_frame().unwrap(), button_frame(0));
}

#[test]
fn test_malformed_report_is_discarded() {
    let (registry, mock, minor) = attach_default();
    let file = registry.open(minor, OpenOptions::new()).unwrap();
    let device = Arc::clone(file.device());

    assert!(mock.deliver_in(InCompletion::Report(vec![0u8; 5])));
    assert!(mock.deliver_frame(button_frame(2)));

    assert_eq!(file.read_frame().unwrap(), button_frame(2));
    assert_eq!(device.stats().malformed_reports, 1);
}

#[test]
fn test_transient_errors_resubmit() {
    let (registry, mock, minor) = attach_default();
    let file = registry.open(minor, OpenOptions::new()).unwrap();

    for _ in 0..5 {
        assert!(mock.deliver_in(InCompletion::TransientError("EILSEQ".into())));
    }
    assert!(mock.wait_for_in_submissions(6, DEFAULT_TEST_TIMEOUT));
    assert!(!file.poll().hangup);
    assert_eq!(file.device().stats().transient_errors, 5);
}

#[test]
fn test_bounded_retries_give_up() {
    let mut config = DriverConfig::default();
    config.retry.max_consecutive_transient_errors = Some(2);
    let (registry, mock, minor) = attach(config);
    let file = registry.open(minor, OpenOptions::new()).unwrap();

    let (tx, rx) = mpsc::channel();
    let reader = thread::spawn(move || {
        tx.send(file.read_frame().map(|_| ())).unwrap();
    });

    for _ in 0..3 {
        assert!(mock.deliver_in(InCompletion::TransientError("EPROTO".into())));
    }

    let result = rx
        .recv_timeout(DEFAULT_TEST_TIMEOUT)
        .expect("Reader stayed blocked after retries ran out");
    assert!(matches!(result, Err(Error::DeviceGone)));
    reader.join().unwrap();
    assert_eq!(mock.in_submissions(), 3);
}

#[test]
fn test_compress_wheel_attribute_round_trip() {
    let (registry, _mock, minor) = attach_default();
    let file = registry.open(minor, OpenOptions::new()).unwrap();
    let device = file.device();

    assert_eq!(driver::store_attribute(device, "compress_wheel", "0\n").unwrap(), 2);
    assert_eq!(driver::show_attribute(device, "compress_wheel").unwrap(), "0\n");
    assert_eq!(driver::show_attribute(device, "enable").unwrap(), "1\n");
    assert!(driver::store_attribute(device, "enable", "0").is_err());
}

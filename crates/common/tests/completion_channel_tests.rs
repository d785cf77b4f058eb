//! Completion Channel Integration Tests
//!
//! Tests for the channel that carries transfer completions from a transport
//! to a device dispatcher, driven through the mock transport.
//!
//! # Test Scenarios
//! - Completion ordering across threads
//! - Mock transport arming and cancellation
//! - Channel shutdown semantics
//!
//! Run with: `cargo test -p common --test completion_channel_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockTransport, frame_seq, seq_frame, with_timeout,
};
use common::{InCompletion, OutCompletion, Transport, TransportEvent, completion_channel};
use std::thread;
use std::time::Duration;

// ============================================================================
// Ordering Tests
// ============================================================================

#[test]
fn test_many_completions_arrive_in_order() {
    let (tx, rx) = completion_channel();

    let producer = thread::spawn(move || {
        for seq in 0..500u32 {
            tx.complete_in(1, InCompletion::Report(seq_frame(seq).as_bytes().to_vec()))
                .expect("Failed to post completion");
        }
    });

    for expected in 0..500u32 {
        match rx.recv().expect("Channel closed early") {
            TransportEvent::In {
                completion: InCompletion::Report(bytes),
                ..
            } => {
                let frame = protocol::Frame::from_slice(&bytes).unwrap();
                assert_eq!(frame_seq(&frame), expected);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    producer.join().expect("Producer panicked");
}

#[test]
fn test_receiver_reports_closed_channel() {
    let (tx, rx) = completion_channel();
    drop(tx);
    assert!(rx.recv().is_err());
}

// ============================================================================
// Mock Transport Tests
// ============================================================================

#[test]
fn test_mock_delivery_waits_for_submission() {
    let (mock, binding) = MockTransport::new();

    let submitter = {
        let mock = mock.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            mock.submit_in(7).unwrap();
        })
    };

    assert!(mock.deliver_in(InCompletion::TransientError("EILSEQ".into())));
    submitter.join().unwrap();

    assert_eq!(
        binding.completions.recv().unwrap(),
        TransportEvent::In {
            epoch: 7,
            completion: InCompletion::TransientError("EILSEQ".into()),
        }
    );
}

#[test]
fn test_mock_write_completion() {
    let (mock, binding) = MockTransport::new();

    mock.submit_out(bytes::Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]))
        .unwrap();
    assert!(mock.is_out_armed());
    assert!(mock.complete_out(OutCompletion::Failed("EPIPE".into())));
    assert!(!mock.is_out_armed());

    assert_eq!(
        binding.completions.recv().unwrap(),
        TransportEvent::Out(OutCompletion::Failed("EPIPE".into()))
    );
}

#[test]
fn test_mock_cancel_counts() {
    let (mock, _binding) = MockTransport::new();
    mock.submit_in(1).unwrap();
    mock.cancel_in();
    mock.cancel_out();
    assert_eq!(mock.cancel_in_count(), 1);
    assert_eq!(mock.cancel_out_count(), 1);
    assert!(mock.wait_for_in_submissions(1, Duration::from_millis(10)));
    assert!(!mock.wait_for_in_submissions(2, Duration::from_millis(10)));
}

#[test]
fn test_mock_unplug_completes_armed_read() {
    let (mock, binding) = MockTransport::new();
    mock.submit_in(2).unwrap();
    mock.unplug();
    assert_eq!(
        binding.completions.recv().unwrap(),
        TransportEvent::In {
            epoch: 2,
            completion: InCompletion::DeviceGone,
        }
    );
}

// ============================================================================
// Async Consumer Tests
// ============================================================================

#[tokio::test]
async fn test_async_consumer_receives_shutdown() {
    let (tx, rx) = completion_channel();

    thread::spawn(move || {
        tx.complete_out(OutCompletion::Done).unwrap();
        tx.shutdown().unwrap();
    });

    let first = with_timeout(DEFAULT_TEST_TIMEOUT, rx.recv_async())
        .await
        .expect("Timed out")
        .unwrap();
    assert_eq!(first, TransportEvent::Out(OutCompletion::Done));

    let second = with_timeout(DEFAULT_TEST_TIMEOUT, rx.recv_async())
        .await
        .expect("Timed out")
        .unwrap();
    assert_eq!(second, TransportEvent::Shutdown);
}

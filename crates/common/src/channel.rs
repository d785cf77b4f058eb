//! Completion channel between a transport and the device it serves
//!
//! Transports complete asynchronous transfers from their own threads. Each
//! completion is posted here and consumed, in order, by the device's dispatcher
//! thread. The channel is unbounded so that posting a completion never blocks.

use async_channel::{Receiver, Sender, TryRecvError, unbounded};
use tracing::debug;

/// Outcome of one inbound interrupt read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InCompletion {
    /// Raw report bytes as received (length not yet validated)
    Report(Vec<u8>),
    /// Recoverable transport error; the read should be resubmitted
    TransientError(String),
    /// The device went away
    DeviceGone,
}

/// Outcome of one outbound interrupt write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutCompletion {
    Done,
    Failed(String),
    DeviceGone,
}

/// Event delivered to a device's dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Completion of the read armed with `epoch`
    In { epoch: u64, completion: InCompletion },
    Out(OutCompletion),
    /// Ask the dispatcher to exit
    Shutdown,
}

/// Posting side, held by the transport (and by the device for shutdown)
#[derive(Debug, Clone)]
pub struct CompletionSender {
    tx: Sender<TransportEvent>,
}

impl CompletionSender {
    pub fn complete_in(&self, epoch: u64, completion: InCompletion) -> crate::Result<()> {
        self.send(TransportEvent::In { epoch, completion })
    }

    pub fn complete_out(&self, completion: OutCompletion) -> crate::Result<()> {
        self.send(TransportEvent::Out(completion))
    }

    pub fn shutdown(&self) -> crate::Result<()> {
        self.send(TransportEvent::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, event: TransportEvent) -> crate::Result<()> {
        // Unbounded: never waits
        self.tx.try_send(event).map_err(|e| {
            debug!("Completion dropped, dispatcher gone: {:?}", e.into_inner());
            crate::Error::Channel("completion channel closed".to_string())
        })
    }
}

/// Consuming side, owned by the dispatcher thread
#[derive(Debug)]
pub struct CompletionReceiver {
    rx: Receiver<TransportEvent>,
}

impl CompletionReceiver {
    /// Receive the next event (blocking)
    pub fn recv(&self) -> crate::Result<TransportEvent> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next event from async code
    pub async fn recv_async(&self) -> crate::Result<TransportEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&self) -> Option<TransportEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Number of events waiting
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

/// Create a completion channel
///
/// Returns (sender for the transport, receiver for the dispatcher)
pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    let (tx, rx) = unbounded();
    (CompletionSender { tx }, CompletionReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_order_is_preserved() {
        let (tx, rx) = completion_channel();

        tx.complete_in(3, InCompletion::Report(vec![1; 8])).unwrap();
        tx.complete_out(OutCompletion::Done).unwrap();
        tx.shutdown().unwrap();

        assert_eq!(
            rx.recv().unwrap(),
            TransportEvent::In {
                epoch: 3,
                completion: InCompletion::Report(vec![1; 8]),
            }
        );
        assert_eq!(rx.recv().unwrap(), TransportEvent::Out(OutCompletion::Done));
        assert_eq!(rx.recv().unwrap(), TransportEvent::Shutdown);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_send_fails_after_receiver_dropped() {
        let (tx, rx) = completion_channel();
        drop(rx);
        assert!(tx.is_closed());
        assert!(matches!(
            tx.complete_in(1, InCompletion::DeviceGone),
            Err(crate::Error::Channel(_))
        ));
    }

    #[tokio::test]
    async fn test_cross_thread_completion() {
        let (tx, rx) = completion_channel();

        let handle = std::thread::spawn(move || {
            tx.complete_in(1, InCompletion::TransientError("EPROTO".into()))
                .unwrap();
        });

        let event = rx.recv_async().await.unwrap();
        assert_eq!(
            event,
            TransportEvent::In {
                epoch: 1,
                completion: InCompletion::TransientError("EPROTO".into()),
            }
        );
        handle.join().unwrap();
    }
}

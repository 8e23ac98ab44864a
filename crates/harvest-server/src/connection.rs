//! Channel-backed connection handle.
//!
//! The registry never touches a socket directly. Each WebSocket gets a
//! writer task fed by a bounded channel; this handle is the sending side.
//! Closing goes through a separate token so it works even when the queue
//! is full.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;

use crate::registry::{ConnectionHandle, TransportError};

pub struct ChannelHandle {
    tx: mpsc::Sender<Arc<String>>,
    closing: CancellationToken,
    send_timeout: Duration,
    connected_at: Instant,
    /// Milliseconds after `connected_at` of the last client activity.
    last_seen_ms: AtomicU64,
}

impl ChannelHandle {
    pub fn new(tx: mpsc::Sender<Arc<String>>, send_timeout: Duration) -> Self {
        Self {
            tx,
            closing: CancellationToken::new(),
            send_timeout,
            connected_at: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    /// Cancelled once the registry asks this connection to close.
    pub fn close_signal(&self) -> CancellationToken {
        self.closing.clone()
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Record client activity (pong or any inbound frame).
    pub fn touch(&self) {
        let elapsed = self.connected_at.elapsed().as_millis() as u64;
        self.last_seen_ms.store(elapsed, Ordering::Relaxed);
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

#[async_trait]
impl ConnectionHandle for ChannelHandle {
    async fn send(&self, payload: Arc<String>) -> Result<(), TransportError> {
        if self.closing.is_cancelled() {
            return Err(TransportError::new("connection closing"));
        }
        self.tx
            .send_timeout(payload, self.send_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => TransportError::new("send queue full"),
                SendTimeoutError::Closed(_) => TransportError::new("connection closed"),
            })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closing.cancel();
        Ok(())
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.connected_at.elapsed().saturating_sub(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(capacity: usize) -> (ChannelHandle, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ChannelHandle::new(tx, Duration::from_millis(50)), rx)
    }

    #[tokio::test]
    async fn send_forwards_payload() {
        let (h, mut rx) = handle(4);
        h.send(Arc::new("hello".into())).await.unwrap();
        assert_eq!(rx.recv().await, Some(Arc::new("hello".to_string())));
    }

    #[tokio::test]
    async fn send_to_closed_channel_fails() {
        let (h, rx) = handle(4);
        drop(rx);
        let err = h.send(Arc::new("x".into())).await.unwrap_err();
        assert_eq!(err, TransportError::new("connection closed"));
    }

    #[tokio::test]
    async fn send_to_full_queue_times_out() {
        let (h, _rx) = handle(1);
        h.send(Arc::new("first".into())).await.unwrap();
        let err = h.send(Arc::new("second".into())).await.unwrap_err();
        assert_eq!(err, TransportError::new("send queue full"));
    }

    #[tokio::test]
    async fn close_signals_writer() {
        let (h, _rx) = handle(4);
        let signal = h.close_signal();
        assert!(!signal.is_cancelled());
        h.close().await.unwrap();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn close_with_full_queue_still_signals() {
        let (h, _rx) = handle(1);
        h.send(Arc::new("stuck".into())).await.unwrap();

        let signal = h.close_signal();
        tokio::time::timeout(Duration::from_millis(20), h.close())
            .await
            .expect("close must not wait for queue space")
            .unwrap();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn send_after_close_is_refused() {
        let (h, mut rx) = handle(4);
        h.close().await.unwrap();
        let err = h.send(Arc::new("late".into())).await.unwrap_err();
        assert_eq!(err, TransportError::new("connection closing"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_after_writer_exit_is_ok() {
        let (h, rx) = handle(4);
        drop(rx);
        assert!(h.close().await.is_ok());
    }

    #[test]
    fn touch_resets_idle_time() {
        let (h, _rx) = handle(1);
        std::thread::sleep(Duration::from_millis(30));
        assert!(h.idle_for() >= Duration::from_millis(30));
        h.touch();
        assert!(h.idle_for() < Duration::from_millis(30));
        assert!(h.age() >= Duration::from_millis(30));
    }
}

//! Outbound side of a live session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use duet_core::{RoomId, SessionId, StreamEvent, UserId};
use duet_telemetry::metrics::STREAM_DROPS_TOTAL;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

/// The transport went away; the session must drain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("live connection is closed")]
pub struct TransportClosed;

/// A session's stream to its client.
///
/// Events go through a bounded channel read by the HTTP response body. The
/// sender is dropped by [`close`](Self::close), which ends the stream.
pub struct LiveConnection {
    pub session_id: SessionId,
    pub identity: UserId,
    pub room: RoomId,
    tx: Mutex<Option<mpsc::Sender<StreamEvent>>>,
    pub connected_at: Instant,
    is_alive: AtomicBool,
    dropped_events: AtomicU64,
}

impl LiveConnection {
    pub fn new(
        session_id: SessionId,
        identity: UserId,
        room: RoomId,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Self {
        Self {
            session_id,
            identity,
            room,
            tx: Mutex::new(Some(tx)),
            connected_at: Instant::now(),
            is_alive: AtomicBool::new(true),
            dropped_events: AtomicU64::new(0),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Acquire)
    }

    fn sender(&self) -> Option<mpsc::Sender<StreamEvent>> {
        if !self.is_alive() {
            return None;
        }
        self.tx.lock().clone()
    }

    fn mark_dead(&self) {
        self.is_alive.store(false, Ordering::Release);
    }

    /// Send an event, waiting for channel capacity. Used for message batches,
    /// which must not be dropped.
    pub async fn deliver(&self, event: StreamEvent) -> Result<(), TransportClosed> {
        let tx = self.sender().ok_or(TransportClosed)?;
        tx.send(event).await.map_err(|_| {
            self.mark_dead();
            TransportClosed
        })
    }

    /// Send without waiting. A full channel drops the event and counts it;
    /// a closed one marks the connection dead.
    pub fn offer(&self, event: StreamEvent) -> Result<bool, TransportClosed> {
        let tx = self.sender().ok_or(TransportClosed)?;
        match tx.try_send(event) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped_events.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(STREAM_DROPS_TOTAL).increment(1);
                Ok(false)
            }
            Err(TrySendError::Closed(_)) => {
                self.mark_dead();
                Err(TransportClosed)
            }
        }
    }

    /// Resolves once the client side has gone away. The pending future holds
    /// a sender clone, so drop it before [`close`](Self::close) is expected
    /// to end the stream.
    pub async fn closed(&self) {
        let tx = self.tx.lock().clone();
        if let Some(tx) = tx {
            tx.closed().await;
        }
    }

    /// Close the transport. Only the first call has an effect; it returns
    /// `true`.
    pub fn close(&self) -> bool {
        self.mark_dead();
        self.tx.lock().take().is_some()
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

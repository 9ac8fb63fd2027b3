//! Telemetry buffering
//!
//! Progress and completion events queue in local buffers and are flushed to
//! the coordinator in bounded chunks on a fixed ticker. The buffers are
//! authoritative: an event is only removed after the chunk carrying it was
//! acknowledged, so a lost connection means redelivery, never loss. Event
//! ids make the removal exact even when new events arrive mid-flush.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use backhaul_core::rpc::{CompleteEvent, ProgressEvent, RpcError};

/// Where flushed chunks go. The live implementation sends RPC frames; tests
/// substitute a recorder.
#[async_trait]
pub trait TelemetryTransport: Send + Sync {
    async fn send_progress(&self, events: Vec<ProgressEvent>) -> Result<(), RpcError>;
    async fn send_complete(&self, events: Vec<CompleteEvent>) -> Result<(), RpcError>;
}

pub struct TelemetryBuffer {
    progress: Mutex<Vec<ProgressEvent>>,
    complete: Mutex<Vec<CompleteEvent>>,
    /// Serializes flushes without blocking pushes.
    flush_lock: tokio::sync::Mutex<()>,
    chunk_size: usize,
}

impl TelemetryBuffer {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            progress: Mutex::new(Vec::new()),
            complete: Mutex::new(Vec::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            chunk_size,
        }
    }

    pub fn push_progress(&self, event: ProgressEvent) {
        if let Ok(mut buffer) = self.progress.lock() {
            buffer.push(event);
        }
    }

    pub fn push_complete(&self, event: CompleteEvent) {
        if let Ok(mut buffer) = self.complete.lock() {
            buffer.push(event);
        }
    }

    pub fn pending_progress(&self) -> usize {
        self.progress.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn pending_complete(&self) -> usize {
        self.complete.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Flushes everything currently buffered in chunks. A chunk that fails
    /// or misses the deadline stays buffered for the next tick; later
    /// chunks of the same flush are skipped rather than delivered out of
    /// order.
    pub async fn flush(&self, transport: &dyn TelemetryTransport, send_deadline: Duration) {
        let _guard = self.flush_lock.lock().await;

        let progress_snapshot = self
            .progress
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default();
        for chunk in progress_snapshot.chunks(self.chunk_size) {
            let sent =
                tokio::time::timeout(send_deadline, transport.send_progress(chunk.to_vec())).await;
            match sent {
                Ok(Ok(())) => {
                    let ids: HashSet<Uuid> = chunk.iter().map(|e| e.id).collect();
                    if let Ok(mut buffer) = self.progress.lock() {
                        buffer.retain(|e| !ids.contains(&e.id));
                    }
                }
                Ok(Err(e)) => {
                    debug!("progress chunk rejected, keeping {} event(s): {}", chunk.len(), e);
                    return;
                }
                Err(_) => {
                    debug!("progress chunk missed send deadline, keeping {} event(s)", chunk.len());
                    return;
                }
            }
        }

        let complete_snapshot = self
            .complete
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default();
        for chunk in complete_snapshot.chunks(self.chunk_size) {
            let sent =
                tokio::time::timeout(send_deadline, transport.send_complete(chunk.to_vec())).await;
            match sent {
                Ok(Ok(())) => {
                    let ids: HashSet<Uuid> = chunk.iter().map(|e| e.id).collect();
                    if let Ok(mut buffer) = self.complete.lock() {
                        buffer.retain(|e| !ids.contains(&e.id));
                    }
                }
                Ok(Err(e)) => {
                    warn!("completion chunk rejected, keeping {} event(s): {}", chunk.len(), e);
                    return;
                }
                Err(_) => {
                    warn!("completion chunk missed send deadline, keeping {} event(s)", chunk.len());
                    return;
                }
            }
        }
    }

    /// Spawns the periodic flusher. Aborted by the connection loop when the
    /// transport it writes to goes away.
    pub fn spawn_flusher(
        self: &Arc<Self>,
        transport: Arc<dyn TelemetryTransport>,
        interval: Duration,
        send_deadline: Duration,
    ) -> JoinHandle<()> {
        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                buffer.flush(transport.as_ref(), send_deadline).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingTransport {
        fail_progress: AtomicBool,
        progress_chunks: Mutex<Vec<Vec<ProgressEvent>>>,
        complete_chunks: Mutex<Vec<Vec<CompleteEvent>>>,
    }

    #[async_trait]
    impl TelemetryTransport for RecordingTransport {
        async fn send_progress(&self, events: Vec<ProgressEvent>) -> Result<(), RpcError> {
            if self.fail_progress.load(Ordering::SeqCst) {
                return Err(RpcError::Transport("connection reset".to_string()));
            }
            self.progress_chunks.lock().unwrap().push(events);
            Ok(())
        }

        async fn send_complete(&self, events: Vec<CompleteEvent>) -> Result<(), RpcError> {
            self.complete_chunks.lock().unwrap().push(events);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_flush_delivers_and_drains() {
        let buffer = TelemetryBuffer::new(100);
        let transport = RecordingTransport::default();
        buffer.push_progress(ProgressEvent::new(Uuid::new_v4(), "page 1"));
        buffer.push_complete(CompleteEvent::new(Uuid::new_v4(), "done", None, false));

        buffer.flush(&transport, Duration::from_millis(500)).await;

        assert_eq!(buffer.pending_progress(), 0);
        assert_eq!(buffer.pending_complete(), 0);
        assert_eq!(transport.progress_chunks.lock().unwrap().len(), 1);
        assert_eq!(transport.complete_chunks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_chunk_stays_buffered_for_retry() {
        let buffer = TelemetryBuffer::new(100);
        let transport = RecordingTransport::default();
        transport.fail_progress.store(true, Ordering::SeqCst);
        buffer.push_progress(ProgressEvent::new(Uuid::new_v4(), "page 1"));

        buffer.flush(&transport, Duration::from_millis(500)).await;
        assert_eq!(buffer.pending_progress(), 1);

        transport.fail_progress.store(false, Ordering::SeqCst);
        buffer.flush(&transport, Duration::from_millis(500)).await;
        assert_eq!(buffer.pending_progress(), 0);
        assert_eq!(transport.progress_chunks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_large_backlog_is_chunked() {
        let buffer = TelemetryBuffer::new(100);
        let transport = RecordingTransport::default();
        let unit = Uuid::new_v4();
        for i in 0..250 {
            buffer.push_progress(ProgressEvent::new(unit, format!("page {}", i)));
        }

        buffer.flush(&transport, Duration::from_millis(500)).await;

        let chunks = transport.progress_chunks.lock().unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 100);
        assert_eq!(chunks[2].len(), 50);
        assert_eq!(buffer.pending_progress(), 0);
    }

    #[tokio::test]
    async fn test_only_acknowledged_chunks_are_removed() {
        struct FailSecondChunk {
            sent: Mutex<Vec<Vec<ProgressEvent>>>,
        }

        #[async_trait]
        impl TelemetryTransport for FailSecondChunk {
            async fn send_progress(&self, events: Vec<ProgressEvent>) -> Result<(), RpcError> {
                let mut sent = self.sent.lock().unwrap();
                if sent.len() >= 1 {
                    return Err(RpcError::Transport("connection reset".to_string()));
                }
                sent.push(events);
                Ok(())
            }

            async fn send_complete(&self, _events: Vec<CompleteEvent>) -> Result<(), RpcError> {
                Ok(())
            }
        }

        let buffer = TelemetryBuffer::new(1);
        let transport = FailSecondChunk {
            sent: Mutex::new(Vec::new()),
        };
        let unit = Uuid::new_v4();
        let first = ProgressEvent::new(unit, "first");
        let second = ProgressEvent::new(unit, "second");
        buffer.push_progress(first.clone());
        buffer.push_progress(second.clone());

        buffer.flush(&transport, Duration::from_millis(500)).await;

        // The acknowledged event is gone, the rejected one is intact.
        assert_eq!(buffer.pending_progress(), 1);
        let remaining = buffer.progress.lock().unwrap();
        assert_eq!(remaining[0].id, second.id);
    }
}

//! Microphone capture pipeline
//!
//! The hardware callback pushes raw buffers into a bounded queue through a
//! [`CaptureProducer`]. A sender task spawned by [`CapturePipeline`] drains
//! the queue on a fixed tick, encodes each buffer to a wire frame and sends
//! it over the session transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::codec::encode_capture;
use crate::session::{OutboundMessage, Transport};

/// Repeated duplicate rejections are logged once per this many
const DUPLICATE_WARN_EVERY: u64 = 100;

/// Raw buffer as delivered by the input device
#[derive(Debug, Clone, PartialEq)]
pub struct HardwareBuffer {
    /// Capture timestamp, monotonic within one stream
    pub captured_at: Duration,
    /// Interleaved `f32` samples
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Result of handing a buffer to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Buffer queued
    Queued,
    /// Buffer queued after discarding the oldest one
    DroppedOldest,
    /// Timestamp not newer than the last buffer; rejected
    Duplicate,
    /// The consumer is gone
    Closed,
}

#[derive(Debug, Default)]
struct CaptureStats {
    dropped: AtomicU64,
    duplicates: AtomicU64,
    sent: AtomicU64,
    closed: AtomicBool,
}

/// Create a bounded capture queue holding at most `max_backlog` buffers
#[must_use]
pub fn capture_channel(max_backlog: usize) -> (CaptureProducer, CaptureQueue) {
    let (tx, rx) = crossbeam_channel::bounded(max_backlog.max(1));
    let stats = Arc::new(CaptureStats::default());

    let producer = CaptureProducer {
        tx,
        evict: rx.clone(),
        stats: Arc::clone(&stats),
        last_captured_at: None,
    };
    let queue = CaptureQueue { rx, stats };

    (producer, queue)
}

/// Real-time side of the capture queue, owned by the input callback
#[derive(Debug)]
pub struct CaptureProducer {
    tx: Sender<HardwareBuffer>,
    evict: Receiver<HardwareBuffer>,
    stats: Arc<CaptureStats>,
    last_captured_at: Option<Duration>,
}

impl CaptureProducer {
    /// Queue one hardware buffer without blocking
    ///
    /// When the backlog is full the oldest buffer is discarded so capture
    /// stays close to real time.
    pub fn push(
        &mut self,
        captured_at: Duration,
        samples: &[f32],
        sample_rate: u32,
        channels: u16,
    ) -> PushOutcome {
        if self.stats.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }
        if self.last_captured_at.is_some_and(|last| captured_at <= last) {
            let rejected = self.stats.duplicates.fetch_add(1, Ordering::Relaxed) + 1;
            if rejected == 1 || rejected.is_multiple_of(DUPLICATE_WARN_EVERY) {
                tracing::warn!(
                    rejected,
                    ?captured_at,
                    "capture buffer not newer than the last one, dropped"
                );
            }
            return PushOutcome::Duplicate;
        }
        self.last_captured_at = Some(captured_at);

        let mut buffer = HardwareBuffer {
            captured_at,
            samples: samples.to_vec(),
            sample_rate,
            channels,
        };
        let mut outcome = PushOutcome::Queued;

        loop {
            match self.tx.try_send(buffer) {
                Ok(()) => return outcome,
                Err(TrySendError::Full(rejected)) => {
                    buffer = rejected;
                    if self.evict.try_recv().is_ok() {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        outcome = PushOutcome::DroppedOldest;
                    }
                }
                Err(TrySendError::Disconnected(_)) => return PushOutcome::Closed,
            }
        }
    }
}

/// Consumer side of the capture queue
#[derive(Debug)]
pub struct CaptureQueue {
    rx: Receiver<HardwareBuffer>,
    stats: Arc<CaptureStats>,
}

impl CaptureQueue {
    /// Next buffer in capture order, if any
    ///
    /// # Errors
    ///
    /// Returns `TryRecvError::Disconnected` once the producer is gone and
    /// the queue is drained
    pub fn try_next(&self) -> Result<Option<HardwareBuffer>, TryRecvError> {
        match self.rx.try_recv() {
            Ok(buffer) => Ok(Some(buffer)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Buffers waiting to be sent
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Buffers discarded because the backlog was full
    #[must_use]
    pub fn dropped_buffers(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    /// Buffers rejected for a stale capture timestamp
    #[must_use]
    pub fn duplicate_buffers(&self) -> u64 {
        self.stats.duplicates.load(Ordering::Relaxed)
    }
}

impl Drop for CaptureQueue {
    fn drop(&mut self) {
        self.stats.closed.store(true, Ordering::Release);
    }
}

/// Asynchronous sender draining a capture queue into a transport
#[derive(Debug)]
pub struct CapturePipeline {
    task: JoinHandle<()>,
    stats: Arc<CaptureStats>,
}

impl CapturePipeline {
    /// Spawn the sender task
    ///
    /// The task polls the queue every `poll_interval` and sends buffers in
    /// capture order, awaiting each send before the next.
    #[must_use]
    pub fn spawn(
        queue: CaptureQueue,
        transport: Arc<dyn Transport>,
        poll_interval: Duration,
    ) -> Self {
        let stats = Arc::clone(&queue.stats);
        let task = tokio::spawn(send_loop(queue, transport, poll_interval));
        tracing::debug!(?poll_interval, "capture sender started");
        Self { task, stats }
    }

    /// Stop sending; idempotent
    pub fn stop(&self) {
        if !self.task.is_finished() {
            self.task.abort();
            tracing::debug!(sent = self.sent_frames(), "capture sender stopped");
        }
    }

    /// Whether the sender task has ended
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Frames successfully sent
    #[must_use]
    pub fn sent_frames(&self) -> u64 {
        self.stats.sent.load(Ordering::Relaxed)
    }

    /// Buffers discarded because the backlog was full
    #[must_use]
    pub fn dropped_buffers(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn send_loop(queue: CaptureQueue, transport: Arc<dyn Transport>, poll_interval: Duration) {
    // `interval` panics on a zero period
    let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        loop {
            let buffer = match queue.try_next() {
                Ok(Some(buffer)) => buffer,
                Ok(None) => break,
                Err(_) => {
                    tracing::debug!("capture producer gone, sender exiting");
                    return;
                }
            };

            let frame = match encode_capture(&buffer.samples, buffer.sample_rate, buffer.channels)
            {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping unencodable capture buffer");
                    continue;
                }
            };

            match transport.send(&OutboundMessage::audio(&frame)).await {
                Ok(()) => {
                    queue.stats.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) if e.is_graceful() => {
                    tracing::debug!("transport closed, capture sender exiting");
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "capture send failed, sender exiting");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_push_in_order() {
        let (mut producer, queue) = capture_channel(4);
        assert_eq!(producer.push(ms(0), &[0.1; 4], 16_000, 1), PushOutcome::Queued);
        assert_eq!(producer.push(ms(10), &[0.2; 4], 16_000, 1), PushOutcome::Queued);

        let first = queue.try_next().unwrap().unwrap();
        let second = queue.try_next().unwrap().unwrap();
        assert_eq!(first.captured_at, ms(0));
        assert_eq!(second.captured_at, ms(10));
        assert!(queue.try_next().unwrap().is_none());
    }

    #[test]
    fn test_full_backlog_drops_oldest() {
        let (mut producer, queue) = capture_channel(2);
        producer.push(ms(1), &[0.0], 16_000, 1);
        producer.push(ms(2), &[0.0], 16_000, 1);
        assert_eq!(producer.push(ms(3), &[0.0], 16_000, 1), PushOutcome::DroppedOldest);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_buffers(), 1);
        assert_eq!(queue.try_next().unwrap().unwrap().captured_at, ms(2));
        assert_eq!(queue.try_next().unwrap().unwrap().captured_at, ms(3));
    }

    #[test]
    fn test_duplicate_timestamp_rejected() {
        let (mut producer, queue) = capture_channel(4);
        producer.push(ms(5), &[0.0], 16_000, 1);
        assert_eq!(producer.push(ms(5), &[0.0], 16_000, 1), PushOutcome::Duplicate);
        assert_eq!(producer.push(ms(4), &[0.0], 16_000, 1), PushOutcome::Duplicate);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.duplicate_buffers(), 2);

        // A newer buffer is still accepted
        assert_eq!(producer.push(ms(6), &[0.0], 16_000, 1), PushOutcome::Queued);
        assert_eq!(queue.duplicate_buffers(), 2);
    }

    #[test]
    fn test_push_after_queue_dropped() {
        let (mut producer, queue) = capture_channel(4);
        drop(queue);
        assert_eq!(producer.push(ms(1), &[0.0], 16_000, 1), PushOutcome::Closed);
    }

    #[test]
    fn test_producer_gone_disconnects_after_drain() {
        let (mut producer, queue) = capture_channel(4);
        producer.push(ms(1), &[0.0], 16_000, 1);
        drop(producer);

        assert!(queue.try_next().unwrap().is_some());
        assert!(queue.try_next().is_err());
    }
}

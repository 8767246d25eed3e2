//! Size- and age-bounded batching of retained events.
//!
//! The [`Batcher`] drains the bounded queue filled by the source stage and
//! emits [`Batch`]es. A batch is flushed as soon as one of these holds:
//!
//! - the buffer reached `max_batch_size` events,
//! - the oldest buffered event waited `max_queue_time`,
//! - the queue closed (end of stream, terminal event, or stop); the final
//!   partial batch is still emitted.
//!
//! The age timer is armed when an event enters an empty buffer and disarmed
//! on every flush.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::event::{Position, RecordedEvent};

/// Why a batch was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// The buffer reached the maximum batch size.
    Size,
    /// The oldest buffered event waited the maximum queue time.
    Timeout,
    /// The upstream queue closed.
    EndOfStream,
}

/// An ordered, non-empty group of events committed as one unit.
#[derive(Debug, Clone)]
pub struct Batch {
    events: Vec<RecordedEvent>,
    reason: FlushReason,
}

impl Batch {
    /// Create a batch, or `None` if `events` is empty.
    pub fn new(events: Vec<RecordedEvent>, reason: FlushReason) -> Option<Self> {
        if events.is_empty() {
            return None;
        }
        Some(Self { events, reason })
    }

    /// The events of this batch, in log order.
    pub fn events(&self) -> &[RecordedEvent] {
        &self.events
    }

    /// Number of events in the batch (always at least one).
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Always `false`; batches are never empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Why this batch was flushed.
    pub fn reason(&self) -> FlushReason {
        self.reason
    }

    /// Highest position in the batch, used as its checkpoint.
    pub fn highest_position(&self) -> Position {
        // Non-empty by construction, so the fallback is never taken.
        self.events
            .iter()
            .map(|e| e.position)
            .max()
            .unwrap_or_default()
    }

    /// Consume the batch, returning its events.
    pub fn into_events(self) -> Vec<RecordedEvent> {
        self.events
    }
}

/// Groups events from a bounded queue into [`Batch`]es.
///
/// The batcher owns its buffer exclusively. Errors from later stages never
/// touch it: a failed attempt simply drops the batcher along with its
/// buffer, and the events are re-delivered from the checkpoint.
pub struct Batcher {
    rx: mpsc::Receiver<RecordedEvent>,
    max_batch_size: usize,
    max_queue_time: Duration,
    buffer: Vec<RecordedEvent>,
    deadline: Option<Instant>,
    closed: bool,
}

impl Batcher {
    /// Create a batcher reading from `rx`.
    ///
    /// # Arguments
    ///
    /// * `rx` - Receiving end of the queue filled by the source stage.
    /// * `max_batch_size` - Flush threshold; values below 1 are treated as 1.
    /// * `max_queue_time` - Maximum time the oldest buffered event may wait.
    pub fn new(
        rx: mpsc::Receiver<RecordedEvent>,
        max_batch_size: usize,
        max_queue_time: Duration,
    ) -> Self {
        let max_batch_size = max_batch_size.max(1);
        Self {
            rx,
            max_batch_size,
            max_queue_time,
            buffer: Vec::new(),
            deadline: None,
            closed: false,
        }
    }

    /// Wait for the next batch.
    ///
    /// # Returns
    ///
    /// `Some(batch)` on every flush, `None` once the queue is closed and the
    /// buffer has been drained.
    pub async fn next_batch(&mut self) -> Option<Batch> {
        loop {
            if self.closed {
                return self.flush(FlushReason::EndOfStream);
            }

            let deadline = self.deadline;
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                () = timer => {
                    tracing::debug!(size = self.buffer.len(), "max queue time exceeded");
                    return self.flush(FlushReason::Timeout);
                }
                received = self.rx.recv() => match received {
                    Some(event) => {
                        if self.buffer.is_empty() {
                            self.deadline = Some(Instant::now() + self.max_queue_time);
                        }
                        self.buffer.push(event);
                        if self.buffer.len() >= self.max_batch_size {
                            return self.flush(FlushReason::Size);
                        }
                    }
                    None => {
                        self.closed = true;
                    }
                },
            }
        }
    }

    /// Move the buffer out as a batch and disarm the timer.
    fn flush(&mut self, reason: FlushReason) -> Option<Batch> {
        self.deadline = None;
        let events = std::mem::take(&mut self.buffer);
        let batch = Batch::new(events, reason)?;
        tracing::debug!(size = batch.len(), ?reason, "flushing batch");
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn numbered(a: u64) -> RecordedEvent {
        RecordedEvent::json(Position::new(a), "numbers", "Numbered", json!({ "a": a }))
    }

    /// Feed `count` events into a closed queue and collect every batch.
    async fn batch_all(count: u64, max_batch_size: usize, max_queue_time: Duration) -> Vec<Batch> {
        let (tx, rx) = mpsc::channel(count.max(1) as usize);
        for a in 0..count {
            tx.send(numbered(a)).await.expect("send");
        }
        drop(tx);

        let mut batcher = Batcher::new(rx, max_batch_size, max_queue_time);
        let mut batches = Vec::new();
        while let Some(batch) = batcher.next_batch().await {
            batches.push(batch);
        }
        batches
    }

    fn sizes(batches: &[Batch]) -> Vec<usize> {
        batches.iter().map(Batch::len).collect()
    }

    #[tokio::test]
    async fn chunks_of_size_one() {
        let batches = batch_all(10, 1, Duration::from_secs(2)).await;
        assert_eq!(sizes(&batches), vec![1; 10]);
        assert!(batches.iter().all(|b| b.reason() == FlushReason::Size));
    }

    #[tokio::test]
    async fn chunks_of_size_three_flush_remainder_at_end_of_stream() {
        let batches = batch_all(10, 3, Duration::from_secs(2)).await;
        assert_eq!(sizes(&batches), vec![3, 3, 3, 1]);
        assert_eq!(batches[3].reason(), FlushReason::EndOfStream);
    }

    #[tokio::test]
    async fn n_events_make_ceil_n_over_k_batches() {
        for (n, k) in [(1u64, 1usize), (7, 2), (12, 4), (100, 7)] {
            let batches = batch_all(n, k, Duration::from_secs(60)).await;
            let expected = (n as usize).div_ceil(k);
            assert_eq!(batches.len(), expected, "n={n} k={k}");
            for batch in &batches[..expected - 1] {
                assert_eq!(batch.len(), k);
            }
        }
    }

    #[tokio::test]
    async fn single_event_with_large_batch_size_flushes_at_end_of_stream() {
        let batches = batch_all(1, 10, Duration::from_secs(2)).await;
        assert_eq!(sizes(&batches), vec![1]);
        assert_eq!(batches[0].reason(), FlushReason::EndOfStream);
    }

    #[tokio::test]
    async fn concatenated_batches_preserve_order() {
        let batches = batch_all(25, 4, Duration::from_secs(2)).await;
        let positions: Vec<u64> = batches
            .into_iter()
            .flat_map(Batch::into_events)
            .map(|e| e.position.value())
            .collect();
        assert_eq!(positions, (0..25).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn single_event_flushes_after_max_queue_time() {
        let (tx, rx) = mpsc::channel(4);
        let mut batcher = Batcher::new(rx, 10, Duration::from_millis(100));

        let started = Instant::now();
        tx.send(numbered(0)).await.expect("send");
        let batch = batcher.next_batch().await.expect("timer should flush");

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.reason(), FlushReason::Timeout);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(100), "flushed early: {waited:?}");
        assert!(waited < Duration::from_millis(150), "flushed late: {waited:?}");
        // The sender is still alive: the flush was timer driven.
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_arrivals_produce_timeout_batches_of_one() {
        let (tx, rx) = mpsc::channel(4);
        let producer = tokio::spawn(async move {
            for a in 0..5 {
                tx.send(numbered(a)).await.expect("send");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        });

        let mut batcher = Batcher::new(rx, 3, Duration::from_millis(100));
        let mut batches = Vec::new();
        while let Some(batch) = batcher.next_batch().await {
            batches.push(batch);
        }
        producer.await.expect("producer");

        assert_eq!(sizes(&batches), vec![1; 5]);
        assert!(batches.iter().all(|b| b.reason() == FlushReason::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_rearms_after_each_flush() {
        let (tx, rx) = mpsc::channel(8);
        let mut batcher = Batcher::new(rx, 10, Duration::from_millis(100));

        tx.send(numbered(0)).await.expect("send");
        tx.send(numbered(1)).await.expect("send");
        let first = batcher.next_batch().await.expect("first batch");
        assert_eq!(first.len(), 2);
        assert_eq!(first.reason(), FlushReason::Timeout);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let before_send = Instant::now();
        tx.send(numbered(2)).await.expect("send");
        let second = batcher.next_batch().await.expect("second batch");
        assert_eq!(second.len(), 1);
        // Timer was armed by event 2, not carried over from the idle period.
        assert!(before_send.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(Batch::new(Vec::new(), FlushReason::Size).is_none());
    }

    #[test]
    fn highest_position_is_max_of_events() {
        let batch = Batch::new(vec![numbered(4), numbered(9), numbered(7)], FlushReason::Size)
            .expect("non-empty");
        assert_eq!(batch.highest_position(), Position::new(9));
    }
}

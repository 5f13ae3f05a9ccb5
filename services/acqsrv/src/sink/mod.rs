//! Output backends.
//!
//! Every sink accepts batches of points through a non-blocking
//! [`Sink::save`] and persists them from its own background task. Two
//! buffering disciplines are shared across the variants:
//!
//! * bounded queue (console, file): points are enqueued one at a time
//!   until the queue is full, so the accepted count is always a prefix of
//!   the offered batch;
//! * bounded slice (influx, timescale): a capacity-limited deque that
//!   accepts `min(room, len)` points in one append and releases them from
//!   the front only after the backend confirmed a batch.
//!
//! Locks are held for in-memory mutation only, never across backend I/O.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::config::SinkSection;
use crate::error::Result;
use crate::point::Point;

mod console;
mod file;
mod influx;
mod timescale;

pub use console::ConsoleSink;
pub use file::{FileFormat, FileSink};
pub use influx::InfluxSink;
pub use timescale::TimescaleSink;

/// Capability implemented by every output backend.
///
/// `save` never blocks on backend I/O: each offered point is either
/// buffered or rejected immediately, and the number of buffered points is
/// returned. Rejections are reported by the sink itself, never raised.
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;
    fn save(&self, points: &[Point]) -> usize;
}

/// Build a sink from its configuration section.
pub fn create_sink(section: &SinkSection, shutdown: watch::Receiver<bool>) -> Result<Box<dyn Sink>> {
    match section {
        SinkSection::Console { fifo_size } => {
            Ok(Box::new(ConsoleSink::new(*fifo_size, shutdown)))
        }
        SinkSection::Csv {
            path,
            fifo_size,
            max_age,
        } => Ok(Box::new(FileSink::new(
            path,
            FileFormat::Csv,
            *fifo_size,
            *max_age,
            shutdown,
        )?)),
        SinkSection::Json {
            path,
            fifo_size,
            max_age,
        } => Ok(Box::new(FileSink::new(
            path,
            FileFormat::Json,
            *fifo_size,
            *max_age,
            shutdown,
        )?)),
        SinkSection::Influxdb {
            url,
            fifo_size,
            batch_size,
            max_age,
        } => Ok(Box::new(InfluxSink::new(
            url,
            *fifo_size,
            *batch_size,
            *max_age,
            shutdown,
        )?)),
        SinkSection::Timescaledb {
            url,
            table,
            fifo_size,
            batch_size,
            max_age,
        } => Ok(Box::new(TimescaleSink::new(
            url,
            table,
            *fifo_size,
            *batch_size,
            *max_age,
            shutdown,
        )?)),
    }
}

/// Enqueue points one at a time until the queue refuses one.
///
/// Stopping at the first rejection keeps the accepted count a plain prefix
/// of the offered batch.
pub(crate) fn offer_all(tx: &mpsc::Sender<Point>, points: &[Point]) -> usize {
    let mut accepted = 0;
    for point in points {
        match tx.try_send(point.clone()) {
            Ok(()) => accepted += 1,
            Err(mpsc::error::TrySendError::Full(_)) | Err(mpsc::error::TrySendError::Closed(_)) => {
                break;
            }
        }
    }
    accepted
}

/// Capacity-bounded FIFO shared by the batch-flushing sinks.
///
/// Batches are snapshot from the front under the lock and released only
/// after the backend confirmed them, so a failed push leaves the batch in
/// place to be retried whole on the next flush tick.
pub(crate) struct BoundedBuffer {
    capacity: usize,
    queue: Mutex<VecDeque<Point>>,
}

impl BoundedBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Append up to `capacity - len` points, returning how many were taken.
    pub(crate) fn push(&self, points: &[Point]) -> usize {
        let mut queue = self.queue.lock();
        let room = self.capacity.saturating_sub(queue.len());
        let accepted = room.min(points.len());
        queue.extend(points[..accepted].iter().cloned());
        accepted
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Clone up to `max` points from the front without removing them.
    pub(crate) fn front_batch(&self, max: usize) -> Vec<Point> {
        let queue = self.queue.lock();
        queue.iter().take(max).cloned().collect()
    }

    /// Drop `count` points from the front after a confirmed backend push.
    pub(crate) fn release(&self, count: usize) {
        let mut queue = self.queue.lock();
        let count = count.min(queue.len());
        queue.drain(..count);
    }
}

/// Log a buffer-overflow drop the way every sink reports it.
pub(crate) fn report_drops(name: &str, accepted: usize, offered: usize) {
    if accepted < offered {
        warn!("{name} sink: dropped {} points out of {offered}", offered - accepted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::Value;
    use chrono::{TimeZone, Utc};

    fn points(n: usize) -> Vec<Point> {
        (0..n)
            .map(|i| {
                Point::new(
                    Utc.timestamp_opt(1_569_150_729 + i as i64, 0).unwrap(),
                    format!("sensor{i}.temperature"),
                    Value::F64(i as f64),
                )
            })
            .collect()
    }

    #[test]
    fn bounded_buffer_accepts_up_to_capacity() {
        let buffer = BoundedBuffer::new(10);
        assert_eq!(buffer.push(&points(4)), 4);
        assert_eq!(buffer.push(&points(7)), 6);
        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.push(&points(1)), 0);
    }

    #[test]
    fn bounded_buffer_keeps_fifo_order_across_retries() {
        let buffer = BoundedBuffer::new(10);
        let input = points(5);
        buffer.push(&input);

        // a failed push leaves the batch at the front
        let first = buffer.front_batch(3);
        assert_eq!(first, input[..3].to_vec());
        let again = buffer.front_batch(3);
        assert_eq!(again, first);

        // release removes exactly the confirmed batch
        buffer.release(3);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.front_batch(3), input[3..].to_vec());
    }

    #[tokio::test]
    async fn offer_all_accepts_a_prefix() {
        let (tx, mut rx) = mpsc::channel(3);
        let input = points(5);
        assert_eq!(offer_all(&tx, &input), 3);

        for expected in &input[..3] {
            assert_eq!(rx.recv().await.unwrap(), *expected);
        }
        assert!(rx.try_recv().is_err());
    }
}

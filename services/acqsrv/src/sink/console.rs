//! Console sink: prints every accepted point to stdout.

use tokio::sync::{mpsc, watch};

use crate::point::Point;
use crate::sink::{offer_all, report_drops, Sink};

const DEFAULT_FIFO_SIZE: usize = 300;

pub struct ConsoleSink {
    tx: mpsc::Sender<Point>,
}

impl ConsoleSink {
    pub fn new(fifo_size: usize, shutdown: watch::Receiver<bool>) -> Self {
        let fifo_size = if fifo_size == 0 {
            DEFAULT_FIFO_SIZE
        } else {
            fifo_size
        };
        let (tx, rx) = mpsc::channel(fifo_size);
        tokio::spawn(write_loop(rx, shutdown));
        Self { tx }
    }
}

impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    fn save(&self, points: &[Point]) -> usize {
        let accepted = offer_all(&self.tx, points);
        report_drops(self.name(), accepted, points.len());
        accepted
    }
}

async fn write_loop(mut rx: mpsc::Receiver<Point>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(point) => println!(
                    "timestamp: {}, label: {}, value: {}",
                    point.timestamp, point.label, point.value
                ),
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

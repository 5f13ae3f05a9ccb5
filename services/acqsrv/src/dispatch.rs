//! Dispatch tick: drain every poller, feed every sink.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::point::Point;
use crate::poller::Poller;
use crate::sink::Sink;

/// Fans freshly acquired points out to every sink on a fixed tick.
///
/// The tick runs independently of poller and sink timers: whatever has been
/// buffered since the previous tick is offered to every sink exactly once.
pub struct Dispatcher {
    pollers: Vec<Poller>,
    sinks: Vec<Box<dyn Sink>>,
    tick: Duration,
}

impl Dispatcher {
    pub fn new(pollers: Vec<Poller>, sinks: Vec<Box<dyn Sink>>, tick: Duration) -> Self {
        Self {
            pollers,
            sinks,
            tick,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut points: Vec<Point> = Vec::new();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            for poller in &self.pollers {
                points.extend(poller.drain());
            }
            if points.is_empty() {
                continue;
            }

            for sink in &self.sinks {
                let accepted = sink.save(&points);
                debug!(
                    "dispatched {accepted}/{} points to {} sink",
                    points.len(),
                    sink.name()
                );
            }
            points.clear();
        }

        info!("dispatcher stopped");
    }
}

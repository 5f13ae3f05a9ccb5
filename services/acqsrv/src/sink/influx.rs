//! Line-protocol HTTP sink (InfluxDB 1.x write endpoint).

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::warn;

use crate::error::{AcqSrvError, Result};
use crate::point::Point;
use crate::sink::{report_drops, BoundedBuffer, Sink};

const DEFAULT_BUFFER_SIZE: usize = 100_000;
const DEFAULT_BATCH_SIZE: usize = 1000;
const DEFAULT_PUSH_INTERVAL: Duration = Duration::from_secs(10);
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

pub struct InfluxSink {
    buffer: Arc<BoundedBuffer>,
}

impl InfluxSink {
    pub fn new(
        url: &str,
        buffer_size: usize,
        batch_size: usize,
        push_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let buffer_size = if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        };
        let batch_size = if batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            batch_size
        };
        let push_interval = if push_interval.is_zero() {
            DEFAULT_PUSH_INTERVAL
        } else {
            push_interval
        };

        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| AcqSrvError::storage(format!("failed to build http client: {e}")))?;

        // the backend needs to know timestamps are in milliseconds
        let push_url = if url.contains('?') {
            format!("{url}&precision=ms")
        } else {
            format!("{url}?precision=ms")
        };

        let buffer = Arc::new(BoundedBuffer::new(buffer_size));
        tokio::spawn(push_loop(
            client,
            push_url,
            Arc::clone(&buffer),
            batch_size,
            push_interval,
            shutdown,
        ));

        Ok(Self { buffer })
    }
}

impl Sink for InfluxSink {
    fn name(&self) -> &str {
        "influxdb"
    }

    fn save(&self, points: &[Point]) -> usize {
        let accepted = self.buffer.push(points);
        report_drops(self.name(), accepted, points.len());
        accepted
    }
}

async fn push_loop(
    client: reqwest::Client,
    push_url: String,
    buffer: Arc<BoundedBuffer>,
    batch_size: usize,
    push_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(push_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let batch = buffer.front_batch(batch_size);
        if batch.is_empty() {
            continue;
        }

        let body = serialize_batch(&batch);

        let response = client
            .post(&push_url)
            .header(CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await;

        match response {
            Err(e) => {
                warn!("failed to perform influxdb POST request: {e}");
            }
            Ok(response) if response.status() != StatusCode::NO_CONTENT => {
                warn!(
                    "influxdb POST request failed with status code: {}",
                    response.status()
                );
            }
            // only a confirmed push releases the batch; otherwise it is
            // retried whole on the next tick
            Ok(_) => buffer.release(batch.len()),
        }
    }
}

/// Split a label on its last `.` into (series key, field name).
///
/// Labels without a usable split point (no dot, or a dot at either end)
/// cannot be expressed in the line protocol and are dropped.
fn split_label(label: &str) -> Option<(&str, &str)> {
    let idx = label.rfind('.')?;
    if idx == 0 || idx == label.len() - 1 {
        return None;
    }
    Some((&label[..idx], &label[idx + 1..]))
}

/// Turn a batch into newline-delimited line-protocol entries.
fn serialize_batch(points: &[Point]) -> String {
    let mut body = String::new();
    for point in points {
        let Some((series, field)) = split_label(&point.label) else {
            warn!(
                "discarding point with label '{}': cannot split on '.'",
                point.label
            );
            continue;
        };
        body.push_str(&format!(
            "{series} {field}={} {}\n",
            point.value,
            point.epoch_millis()
        ));
    }
    body
}

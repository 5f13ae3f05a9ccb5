//! File sink: one append-only data file per UTC calendar day.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{info, warn};

use crate::error::{AcqSrvError, Result};
use crate::point::{Point, Value};
use crate::sink::{offer_all, report_drops, Sink};

const DEFAULT_FIFO_SIZE: usize = 1000;
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60);
const OPEN_RETRY_COOLDOWN: Duration = Duration::from_secs(30);

/// On-disk record format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Json,
}

impl FileFormat {
    fn extension(&self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Json => "json",
        }
    }
}

pub struct FileSink {
    name: &'static str,
    tx: mpsc::Sender<Point>,
}

impl FileSink {
    pub fn new(
        path: &Path,
        format: FileFormat,
        fifo_size: usize,
        max_age: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let meta = std::fs::metadata(path).map_err(|e| {
            AcqSrvError::config(format!("failed to stat path '{}': {e}", path.display()))
        })?;
        if !meta.is_dir() {
            return Err(AcqSrvError::config(format!(
                "'{}' is not a directory",
                path.display()
            )));
        }

        let fifo_size = if fifo_size == 0 {
            DEFAULT_FIFO_SIZE
        } else {
            fifo_size
        };
        let max_age = if max_age.is_zero() {
            DEFAULT_MAX_AGE
        } else {
            max_age
        };
        let tick = max_age.min(Duration::from_secs(1));

        let (tx, rx) = mpsc::channel(fifo_size);
        let writer = FileWriter {
            dir: path.to_path_buf(),
            format,
            rx,
            probe: tx.clone(),
            high_water: fifo_size * 80 / 100,
            max_age,
            file: None,
            file_path: PathBuf::new(),
            current_day: None,
            record_count: 0,
            last_flush: None,
        };
        tokio::spawn(writer.run(tick, shutdown));

        let name = match format {
            FileFormat::Csv => "csv file",
            FileFormat::Json => "json file",
        };
        Ok(Self { name, tx })
    }
}

impl Sink for FileSink {
    fn name(&self) -> &str {
        self.name
    }

    fn save(&self, points: &[Point]) -> usize {
        let accepted = offer_all(&self.tx, points);
        report_drops(self.name(), accepted, points.len());
        accepted
    }
}

enum TickOutcome {
    Ok,
    OpenFailed,
}

struct FileWriter {
    dir: PathBuf,
    format: FileFormat,
    rx: mpsc::Receiver<Point>,
    /// Sender clone used only to observe the queue length.
    probe: mpsc::Sender<Point>,
    high_water: usize,
    max_age: Duration,
    file: Option<tokio::fs::File>,
    file_path: PathBuf,
    current_day: Option<u32>,
    record_count: u64,
    last_flush: Option<Instant>,
}

impl FileWriter {
    async fn run(mut self, tick: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            if let TickOutcome::OpenFailed = self.tick(Utc::now()).await {
                tokio::select! {
                    _ = sleep(OPEN_RETRY_COOLDOWN) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    async fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        // close the file on day changes
        if self.current_day != Some(now.day()) {
            self.current_day = Some(now.day());

            if self.file.take().is_some() {
                info!(
                    "saved {} records in {}",
                    self.record_count,
                    self.file_path.display()
                );
                self.record_count = 0;
            }
        }

        if self.file.is_none() {
            let file_name = format!("{}.{}", now.format("%Y-%m-%d"), self.format.extension());
            let path = self.dir.join(file_name);

            match OpenOptions::new().append(true).create(true).open(&path).await {
                Ok(file) => {
                    self.file = Some(file);
                    self.file_path = path;
                    info!("opened {} for writing", self.file_path.display());
                }
                Err(e) => {
                    warn!("failed to open file '{}': {e}", path.display());
                    return TickOutcome::OpenFailed;
                }
            }
        }

        let queue_len = self.probe.max_capacity() - self.probe.capacity();
        let flush_due = self
            .last_flush
            .map_or(true, |at| at.elapsed() >= self.max_age);

        if flush_due || queue_len > self.high_water {
            if let Err(e) = self.flush().await {
                warn!("failed to write: {e}");
                return TickOutcome::Ok;
            }
            self.last_flush = Some(Instant::now());
        }

        TickOutcome::Ok
    }

    /// Drain the queue into one buffered append write.
    async fn flush(&mut self) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| AcqSrvError::io("sink closed"))?;

        let mut batch = Vec::new();
        while let Ok(point) = self.rx.try_recv() {
            batch.push(point);
        }
        if batch.is_empty() {
            return Ok(());
        }

        let (buf, count) = serialize_batch(&batch, self.format);
        file.write_all(&buf).await?;
        file.flush().await?;
        self.record_count += count;
        Ok(())
    }
}

#[derive(Serialize)]
struct FileRecord<'a> {
    timestamp: i64,
    label: &'a str,
    value: Value,
}

/// Serialize a batch into newline-delimited records.
///
/// A point that fails to serialize is dropped without blocking the rest of
/// the batch; the returned count covers serialized records only.
fn serialize_batch(points: &[Point], format: FileFormat) -> (Vec<u8>, u64) {
    let mut count = 0u64;
    match format {
        FileFormat::Csv => {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(Vec::new());
            for point in points {
                let record = [
                    point.epoch_millis().to_string(),
                    point.label.clone(),
                    point.value.to_string(),
                ];
                match writer.write_record(&record) {
                    Ok(()) => count += 1,
                    Err(e) => warn!("failed to serialize point '{}': {e}", point.label),
                }
            }
            (writer.into_inner().unwrap_or_default(), count)
        }
        FileFormat::Json => {
            let mut buf = Vec::new();
            for point in points {
                let record = FileRecord {
                    timestamp: point.epoch_millis(),
                    label: &point.label,
                    value: point.value,
                };
                match serde_json::to_string(&record) {
                    Ok(line) => {
                        buf.extend_from_slice(line.as_bytes());
                        buf.push(b'\n');
                        count += 1;
                    }
                    Err(e) => warn!("failed to serialize point '{}': {e}", point.label),
                }
            }
            (buf, count)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn point(secs: i64, label: &str, value: Value) -> Point {
        Point::new(Utc.timestamp_opt(secs, 0).unwrap(), label, value)
    }

    #[test]
    fn csv_records() {
        let points = vec![
            point(1_569_150_729, "sensor0.temperature", Value::F64(18.7)),
            point(1_569_150_730, "sensor0.humidity", Value::U16(54)),
        ];
        let (buf, count) = serialize_batch(&points, FileFormat::Csv);
        assert_eq!(count, 2);
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "1569150729000,sensor0.temperature,18.7\n1569150730000,sensor0.humidity,54\n"
        );
    }

    #[test]
    fn json_records() {
        let points = vec![point(1_569_150_729, "sensor0.temperature", Value::F64(18.7))];
        let (buf, count) = serialize_batch(&points, FileFormat::Json);
        assert_eq!(count, 1);
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "{\"timestamp\":1569150729000,\"label\":\"sensor0.temperature\",\"value\":18.7}\n"
        );
    }

    fn test_writer(dir: &Path, format: FileFormat) -> (mpsc::Sender<Point>, FileWriter) {
        let (tx, rx) = mpsc::channel(100);
        let writer = FileWriter {
            dir: dir.to_path_buf(),
            format,
            rx,
            probe: tx.clone(),
            high_water: 80,
            // zero max age makes every tick flush
            max_age: Duration::ZERO,
            file: None,
            file_path: PathBuf::new(),
            current_day: None,
            record_count: 0,
            last_flush: None,
        };
        (tx, writer)
    }

    #[tokio::test]
    async fn appends_within_a_day_and_rotates_on_day_change() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut writer) = test_writer(dir.path(), FileFormat::Json);

        let day_one = Utc.with_ymd_and_hms(2019, 9, 22, 10, 0, 0).unwrap();
        let day_two = Utc.with_ymd_and_hms(2019, 9, 23, 0, 0, 1).unwrap();

        tx.try_send(point(1_569_146_400, "sensor0.temperature", Value::F64(18.7)))
            .unwrap();
        tx.try_send(point(1_569_146_401, "sensor0.humidity", Value::U16(54)))
            .unwrap();
        writer.tick(day_one).await;

        let day_one_path = dir.path().join("2019-09-22.json");
        let written = std::fs::read_to_string(&day_one_path).unwrap();
        assert_eq!(written.lines().count(), 2);

        // a later flush appends without truncating
        tx.try_send(point(1_569_146_402, "sensor1.temperature", Value::F64(-17.1)))
            .unwrap();
        writer.tick(day_one).await;
        let written = std::fs::read_to_string(&day_one_path).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("sensor0.temperature"));
        assert!(lines[2].contains("sensor1.temperature"));
        assert_eq!(writer.record_count, 3);

        // day change closes the old file and opens a fresh one
        writer.tick(day_two).await;
        assert_eq!(writer.record_count, 0);
        assert!(dir.path().join("2019-09-23.json").exists());
        let written = std::fs::read_to_string(&day_one_path).unwrap();
        assert_eq!(written.lines().count(), 3);
    }

    #[tokio::test]
    async fn csv_day_file_preserves_submission_order() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut writer) = test_writer(dir.path(), FileFormat::Csv);

        let day = Utc.with_ymd_and_hms(2019, 9, 22, 10, 0, 0).unwrap();
        tx.try_send(point(1_569_146_400, "a.first", Value::U16(1))).unwrap();
        tx.try_send(point(1_569_146_401, "a.second", Value::U16(2))).unwrap();
        writer.tick(day).await;

        let written = std::fs::read_to_string(dir.path().join("2019-09-22.csv")).unwrap();
        assert_eq!(written, "1569146400000,a.first,1\n1569146401000,a.second,2\n");
    }

    #[tokio::test]
    async fn rejects_paths_that_are_not_directories() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("not-a-dir");
        std::fs::write(&file_path, b"x").unwrap();

        let (_tx, shutdown) = watch::channel(false);
        let result = FileSink::new(
            &file_path,
            FileFormat::Csv,
            0,
            Duration::ZERO,
            shutdown,
        );
        assert!(result.is_err());
    }
}

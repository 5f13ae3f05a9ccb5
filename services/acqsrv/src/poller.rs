//! Per-link polling engine.
//!
//! A [`Poller`] owns exactly one protocol link. Once spawned it runs an
//! unattended acquisition cycle on its own interval: (re)open the link with
//! capped backoff, read every configured target in order, decode and
//! transform the values, and buffer the resulting points until the
//! dispatcher collects them with [`Poller::drain`].
//!
//! The buffer lock is held only to append or to swap the buffer out, never
//! across link I/O.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fieldbus::{LinkConfig, ModbusLink, RegisterKind, RegisterLink};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{info, warn};

use crate::error::Result;
use crate::point::{Point, Value};

/// How to decode a register read into a typed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float32,
}

/// Static descriptor of one measurement to acquire.
#[derive(Debug, Clone)]
pub struct Target {
    pub unit_id: u8,
    pub register_kind: RegisterKind,
    pub address: u16,
    pub value_kind: ValueKind,
    pub label: String,
    pub scale_factor: f64,
    pub offset: f64,
    pub decimal_places: u32,
}

impl Target {
    /// Apply the configured scale/offset/rounding chain.
    ///
    /// Any enabled transform promotes the value to f64; with all three
    /// disabled the decoded value passes through unchanged.
    fn apply_transforms(&self, value: Value) -> Value {
        if self.scale_factor == 0.0 && self.offset == 0.0 && self.decimal_places == 0 {
            return value;
        }

        let mut v = value.as_f64();
        if self.scale_factor != 0.0 {
            v *= self.scale_factor;
        }
        if self.offset != 0.0 {
            v += self.offset;
        }
        if self.decimal_places != 0 {
            v = round_to_places(v, self.decimal_places);
        }
        Value::F64(v)
    }
}

/// Rounds half away from zero; NaN and infinities pass through.
pub fn round_to_places(value: f64, places: u32) -> f64 {
    let shift = 10f64.powi(places as i32);
    if value >= 0.0 {
        ((value * shift) + 0.5).floor() / shift
    } else {
        ((value * shift) - 0.5).floor() / shift
    }
}

/// Validated runtime configuration, owned by one poller for its lifetime.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub link: LinkConfig,
    pub poll_interval: Duration,
    pub targets: Vec<Target>,
}

/// Handle to a running acquisition task.
pub struct Poller {
    url: String,
    buffer: Arc<Mutex<Vec<Point>>>,
}

impl Poller {
    /// Spawn a poller over a Modbus link built from the configuration.
    pub fn spawn(config: PollerConfig, shutdown: watch::Receiver<bool>) -> Result<Self> {
        let link = ModbusLink::new(config.link.clone())?;
        Ok(Self::spawn_with_link(config, Box::new(link), shutdown))
    }

    /// Spawn a poller over an already-built link.
    pub fn spawn_with_link(
        config: PollerConfig,
        link: Box<dyn RegisterLink>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let url = config.link.url.clone();
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let cycle = AcquisitionCycle {
            config,
            link,
            buffer: Arc::clone(&buffer),
            shutdown,
        };
        tokio::spawn(cycle.run());
        Self { url, buffer }
    }

    /// Link URL this poller was configured with.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Atomically take all points buffered since the previous call.
    pub fn drain(&self) -> Vec<Point> {
        std::mem::take(&mut *self.buffer.lock())
    }
}

struct AcquisitionCycle {
    config: PollerConfig,
    link: Box<dyn RegisterLink>,
    buffer: Arc<Mutex<Vec<Point>>>,
    shutdown: watch::Receiver<bool>,
}

impl AcquisitionCycle {
    async fn run(self) {
        let AcquisitionCycle {
            config,
            mut link,
            buffer,
            mut shutdown,
        } = self;
        let url = config.link.url.clone();

        let mut ticker = interval(config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut open = false;
        let mut failures: u32 = 0;

        'cycle: loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break 'cycle,
            }

            if !open {
                if let Err(e) = link.open().await {
                    warn!("failed to open link {url}: {e}");

                    // capped backoff so a dead device is not hammered
                    let delay = Duration::from_secs(u64::from(failures.min(5)) * 5);
                    failures = failures.saturating_add(1).min(5);
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = sleep(delay) => {}
                            _ = shutdown.changed() => break 'cycle,
                        }
                    }
                    continue;
                }
                failures = 0;
                open = true;
                info!("link {url} open");
            }

            for target in &config.targets {
                link.set_unit(target.unit_id);

                let decoded = match target.value_kind {
                    ValueKind::Uint16 => link
                        .read_register16(target.address, target.register_kind)
                        .await
                        .map(Value::U16),
                    ValueKind::Int16 => link
                        .read_register16(target.address, target.register_kind)
                        .await
                        .map(|v| Value::I16(v as i16)),
                    ValueKind::Uint32 => link
                        .read_register32(target.address, target.register_kind)
                        .await
                        .map(Value::U32),
                    ValueKind::Int32 => link
                        .read_register32(target.address, target.register_kind)
                        .await
                        .map(|v| Value::I32(v as i32)),
                    ValueKind::Float32 => link
                        .read_float32(target.address, target.register_kind)
                        .await
                        .map(Value::F32),
                };

                match decoded {
                    Err(e) => {
                        warn!("failed to read target '{}': {e}", target.label);

                        // an unrecoverable error invalidates the whole link:
                        // close it and abandon the remaining targets this tick
                        if !e.is_recoverable() {
                            let _ = link.close().await;
                            open = false;
                            break;
                        }
                    }
                    Ok(value) => {
                        let value = target.apply_transforms(value);
                        let point = Point::new(Utc::now(), target.label.clone(), value);
                        buffer.lock().push(point);
                    }
                }
            }
        }

        let _ = link.close().await;
        info!("poller for {url} stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_half_away_from_zero() {
        assert_eq!(round_to_places(0.123_456_7, 4), 0.1235);
        assert_eq!(round_to_places(0.823_456_7, 5), 0.82346);
        assert_eq!(round_to_places(-0.823_456_7, 3), -0.824);
        assert_eq!(round_to_places(-100.823_456_7, 0), -102.0);
    }

    #[test]
    fn rounding_passes_non_finite_through() {
        assert!(round_to_places(f64::NAN, 4).is_nan());
        assert_eq!(round_to_places(f64::INFINITY, 2), f64::INFINITY);
        assert_eq!(round_to_places(f64::NEG_INFINITY, 2), f64::NEG_INFINITY);
    }

    fn target(scale_factor: f64, offset: f64, decimal_places: u32) -> Target {
        Target {
            unit_id: 1,
            register_kind: RegisterKind::Holding,
            address: 0,
            value_kind: ValueKind::Uint16,
            label: "bench.sensor0.temperature".to_string(),
            scale_factor,
            offset,
            decimal_places,
        }
    }

    #[test]
    fn disabled_transforms_keep_the_decoded_kind() {
        let t = target(0.0, 0.0, 0);
        assert_eq!(t.apply_transforms(Value::F32(18.7)), Value::F32(18.7));
        assert_eq!(t.apply_transforms(Value::U16(105)), Value::U16(105));
    }

    #[test]
    fn any_transform_promotes_to_f64() {
        let t = target(0.1, 0.0, 1);
        assert_eq!(t.apply_transforms(Value::U16(105)), Value::F64(10.5));

        let t = target(0.0, -2.5, 0);
        assert_eq!(t.apply_transforms(Value::I16(-17)), Value::F64(-19.5));

        let t = target(2.0, 1.0, 2);
        assert_eq!(t.apply_transforms(Value::F32(1.25)), Value::F64(3.5));
    }
}

//! Service configuration.
//!
//! The file is YAML, with `ACQSRV_`-prefixed environment variables layered
//! on top. Everything is validated here so the poller and sink layers only
//! ever see well-formed configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fieldbus::{ByteOrder, LinkConfig, Parity, RegisterKind, SerialParams, WordOrder};
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{AcqSrvError, Result};
use crate::poller::{PollerConfig, Target, ValueKind};

fn default_dispatch_interval() -> Duration {
    Duration::from_millis(250)
}

fn default_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

/// Top-level service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// How often the dispatcher drains pollers into the sinks.
    #[serde(
        default = "default_dispatch_interval",
        with = "humantime_serde"
    )]
    pub dispatch_interval: Duration,
    #[serde(default)]
    pub pollers: Vec<PollerSection>,
    #[serde(default)]
    pub sinks: Vec<SinkSection>,
}

/// One polled link and its targets.
#[derive(Debug, Clone, Deserialize)]
pub struct PollerSection {
    pub url: String,
    #[serde(default, with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub word_order: WordOrder,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default)]
    pub targets: Vec<TargetSection>,
}

/// One measurement to acquire.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetSection {
    pub unit_id: u8,
    /// Register table and decoding, e.g. `holding:float32` or `i:uint16`.
    pub register_type: String,
    pub register_address: u16,
    pub label: String,
    #[serde(default)]
    pub scale_factor: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub decimal_places: u32,
}

/// One output backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkSection {
    Console {
        #[serde(default)]
        fifo_size: usize,
    },
    Csv {
        path: PathBuf,
        #[serde(default)]
        fifo_size: usize,
        #[serde(default, with = "humantime_serde")]
        max_age: Duration,
    },
    Json {
        path: PathBuf,
        #[serde(default)]
        fifo_size: usize,
        #[serde(default, with = "humantime_serde")]
        max_age: Duration,
    },
    Influxdb {
        url: String,
        #[serde(default)]
        fifo_size: usize,
        #[serde(default)]
        batch_size: usize,
        #[serde(default, with = "humantime_serde")]
        max_age: Duration,
    },
    Timescaledb {
        url: String,
        table: String,
        #[serde(default)]
        fifo_size: usize,
        #[serde(default)]
        batch_size: usize,
        #[serde(default, with = "humantime_serde")]
        max_age: Duration,
    },
}

impl AppConfig {
    /// Load and validate the configuration file, with environment
    /// overrides applied.
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Yaml::file(path))
                .merge(Env::prefixed("ACQSRV_").split("__")),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let mut config: AppConfig = figment
            .extract()
            .map_err(|e| AcqSrvError::config(format!("failed to load configuration: {e}")))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        if self.dispatch_interval.is_zero() {
            self.dispatch_interval = default_dispatch_interval();
        }
        for poller in &mut self.pollers {
            if poller.timeout.is_zero() {
                poller.timeout = default_timeout();
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.pollers.is_empty() {
            return Err(AcqSrvError::config("no poller defined"));
        }
        if self.sinks.is_empty() {
            return Err(AcqSrvError::config("no sink defined"));
        }

        let mut labels = HashSet::new();
        for poller in &self.pollers {
            if poller.url.is_empty() {
                return Err(AcqSrvError::config("poller url missing"));
            }
            if poller.poll_interval.is_zero() {
                return Err(AcqSrvError::config(format!(
                    "poller '{}': poll_interval missing",
                    poller.url
                )));
            }
            for target in &poller.targets {
                // each target needs a system-wide unique label
                if target.label.is_empty() {
                    return Err(AcqSrvError::config("missing target label"));
                }
                if !labels.insert(target.label.as_str()) {
                    return Err(AcqSrvError::config(format!(
                        "duplicate target label '{}'",
                        target.label
                    )));
                }
                parse_register_selector(&target.register_type)?;
            }
        }
        Ok(())
    }
}

impl PollerSection {
    /// Build the validated runtime configuration consumed by a poller.
    pub fn to_poller_config(&self) -> Result<PollerConfig> {
        let targets = self
            .targets
            .iter()
            .map(TargetSection::to_target)
            .collect::<Result<Vec<_>>>()?;

        Ok(PollerConfig {
            link: LinkConfig {
                url: self.url.clone(),
                timeout: self.timeout,
                byte_order: self.byte_order,
                word_order: self.word_order,
                serial: SerialParams {
                    baud_rate: self.baud_rate,
                    data_bits: self.data_bits,
                    stop_bits: self.stop_bits,
                    parity: self.parity,
                },
            },
            poll_interval: self.poll_interval,
            targets,
        })
    }
}

impl TargetSection {
    fn to_target(&self) -> Result<Target> {
        let (register_kind, value_kind) = parse_register_selector(&self.register_type)?;
        Ok(Target {
            unit_id: self.unit_id,
            register_kind,
            address: self.register_address,
            value_kind,
            label: self.label.clone(),
            scale_factor: self.scale_factor,
            offset: self.offset,
            decimal_places: self.decimal_places,
        })
    }
}

/// Parse a `table:kind` register selector.
fn parse_register_selector(selector: &str) -> Result<(RegisterKind, ValueKind)> {
    let unknown =
        || AcqSrvError::config(format!("unknown register_type setting '{selector}'"));

    let (table, kind) = selector.split_once(':').ok_or_else(unknown)?;
    let register_kind = match table {
        "h" | "holding" => RegisterKind::Holding,
        "i" | "input" => RegisterKind::Input,
        _ => return Err(unknown()),
    };
    let value_kind = match kind {
        "uint16" => ValueKind::Uint16,
        "int16" => ValueKind::Int16,
        "uint32" => ValueKind::Uint32,
        "int32" => ValueKind::Int32,
        "float32" => ValueKind::Float32,
        _ => return Err(unknown()),
    };
    Ok((register_kind, value_kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_yaml(yaml: &str) -> Result<AppConfig> {
        AppConfig::from_figment(Figment::new().merge(Yaml::string(yaml)))
    }

    const BASE: &str = r#"
pollers:
  - url: tcp://10.0.0.10:502
    poll_interval: 2s
    targets:
      - unit_id: 1
        register_type: holding:float32
        register_address: 1000
        label: plant.sensor0.temperature
      - unit_id: 1
        register_type: i:uint16
        register_address: 1002
        label: plant.sensor0.humidity
        scale_factor: 0.1
        decimal_places: 1
sinks:
  - type: console
  - type: influxdb
    url: http://localhost:8086/write?db=plant
"#;

    #[test]
    fn loads_a_valid_file_with_defaults() {
        let config = load_yaml(BASE).unwrap();
        assert_eq!(config.dispatch_interval, Duration::from_millis(250));
        assert_eq!(config.pollers.len(), 1);
        assert_eq!(config.pollers[0].timeout, Duration::from_secs(1));
        assert_eq!(config.pollers[0].byte_order, ByteOrder::Big);
        assert_eq!(config.pollers[0].word_order, WordOrder::HighFirst);
        assert_eq!(config.sinks.len(), 2);

        let runtime = config.pollers[0].to_poller_config().unwrap();
        assert_eq!(runtime.targets.len(), 2);
        assert_eq!(runtime.targets[0].value_kind, ValueKind::Float32);
        assert_eq!(runtime.targets[0].register_kind, RegisterKind::Holding);
        assert_eq!(runtime.targets[1].value_kind, ValueKind::Uint16);
        assert_eq!(runtime.targets[1].register_kind, RegisterKind::Input);
    }

    #[test]
    fn requires_at_least_one_poller_and_sink() {
        assert!(load_yaml("sinks:\n  - type: console\n").is_err());
        assert!(load_yaml(
            "pollers:\n  - url: tcp://h:502\n    poll_interval: 1s\n"
        )
        .is_err());
    }

    #[test]
    fn rejects_duplicate_labels() {
        let yaml = r#"
pollers:
  - url: tcp://10.0.0.10:502
    poll_interval: 1s
    targets:
      - { unit_id: 1, register_type: "h:uint16", register_address: 0, label: a.b }
      - { unit_id: 1, register_type: "h:uint16", register_address: 1, label: a.b }
sinks:
  - type: console
"#;
        let err = load_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate target label"));
    }

    #[test]
    fn rejects_missing_poll_interval() {
        let yaml = r#"
pollers:
  - url: tcp://10.0.0.10:502
    targets: []
sinks:
  - type: console
"#;
        let err = load_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("poll_interval"));
    }

    #[test]
    fn rejects_unknown_register_types() {
        assert!(parse_register_selector("holding:float64").is_err());
        assert!(parse_register_selector("coil:uint16").is_err());
        assert!(parse_register_selector("uint16").is_err());
        assert_eq!(
            parse_register_selector("i:int32").unwrap(),
            (RegisterKind::Input, ValueKind::Int32)
        );
    }

    #[test]
    fn rejects_unknown_sink_types() {
        let yaml = r#"
pollers:
  - url: tcp://10.0.0.10:502
    poll_interval: 1s
sinks:
  - type: carrier-pigeon
"#;
        assert!(load_yaml(yaml).is_err());
    }

    #[test]
    fn zero_dispatch_interval_falls_back_to_default() {
        let yaml = r#"
dispatch_interval: 0s
pollers:
  - url: tcp://10.0.0.10:502
    poll_interval: 1s
sinks:
  - type: console
"#;
        let config = load_yaml(yaml).unwrap();
        assert_eq!(config.dispatch_interval, Duration::from_millis(250));
    }

    #[test]
    fn accepts_serial_links_with_word_order_aliases() {
        let yaml = r#"
pollers:
  - url: rtu:///dev/ttyUSB0
    poll_interval: 5s
    baud_rate: 19200
    parity: even
    byte_order: big
    word_order: lf
    targets:
      - { unit_id: 3, register_type: "h:int32", register_address: 42, label: meter.energy }
sinks:
  - type: console
"#;
        let config = load_yaml(yaml).unwrap();
        let poller = &config.pollers[0];
        assert_eq!(poller.baud_rate, 19200);
        assert_eq!(poller.parity, Parity::Even);
        assert_eq!(poller.word_order, WordOrder::LowFirst);
    }
}

//! Register link abstraction and its Modbus implementation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tokio_modbus::prelude::*;
use tracing::{debug, warn};

use crate::codec;
use crate::error::{LinkError, Result};

/// Register table to read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    Holding,
    Input,
}

/// Byte order inside each 16-bit register word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    #[serde(alias = "bigendian")]
    Big,
    #[serde(alias = "littleendian")]
    Little,
}

/// Which 16-bit word of a 32-bit value is transmitted first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WordOrder {
    #[default]
    #[serde(alias = "hf")]
    HighFirst,
    #[serde(alias = "lf")]
    LowFirst,
}

/// Serial parity setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Serial line parameters, ignored for TCP links.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SerialParams {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

/// Parsed link endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAddress {
    /// `tcp://host:port`
    Tcp(String),
    /// `rtu:///dev/ttyUSB0`
    Serial(String),
}

impl LinkAddress {
    pub fn parse(url: &str) -> Result<Self> {
        if let Some(rest) = url.strip_prefix("tcp://") {
            if rest.is_empty() || !rest.contains(':') {
                return Err(LinkError::config(format!(
                    "tcp link '{url}' must be of the form tcp://host:port"
                )));
            }
            return Ok(LinkAddress::Tcp(rest.to_string()));
        }
        if let Some(rest) = url.strip_prefix("rtu://") {
            if rest.is_empty() {
                return Err(LinkError::config(format!(
                    "rtu link '{url}' is missing a device path"
                )));
            }
            return Ok(LinkAddress::Serial(rest.to_string()));
        }
        Err(LinkError::config(format!(
            "unsupported link url '{url}' (expected tcp:// or rtu://)"
        )))
    }
}

/// Everything needed to open one link and decode its registers.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub url: String,
    pub timeout: Duration,
    pub byte_order: ByteOrder,
    pub word_order: WordOrder,
    pub serial: SerialParams,
}

/// Protocol link collaborator used by the acquisition layer.
///
/// `open`/`close` manage the transport; reads are sized by the caller
/// (one word for 16-bit values, two for 32-bit). Implementations must
/// classify every failure through [`LinkError`].
#[async_trait]
pub trait RegisterLink: Send {
    async fn open(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;

    /// Select the unit (slave) id addressed by subsequent reads.
    fn set_unit(&mut self, unit: u8);

    async fn read_register16(&mut self, addr: u16, kind: RegisterKind) -> Result<u16>;
    async fn read_register32(&mut self, addr: u16, kind: RegisterKind) -> Result<u32>;
    async fn read_float32(&mut self, addr: u16, kind: RegisterKind) -> Result<f32>;
}

/// Production [`RegisterLink`] over Modbus TCP or RTU.
pub struct ModbusLink {
    config: LinkConfig,
    address: LinkAddress,
    ctx: Option<client::Context>,
    unit: u8,
}

impl ModbusLink {
    /// Build a link from its configuration. Fails on an unusable URL;
    /// no connection is attempted until [`RegisterLink::open`].
    pub fn new(config: LinkConfig) -> Result<Self> {
        let address = LinkAddress::parse(&config.url)?;
        Ok(Self {
            config,
            address,
            ctx: None,
            unit: 0,
        })
    }

    async fn connect_tcp(endpoint: &str, request_timeout: Duration) -> Result<client::Context> {
        let mut addrs = tokio::net::lookup_host(endpoint)
            .await
            .map_err(|e| LinkError::config(format!("cannot resolve '{endpoint}': {e}")))?;
        let socket_addr = addrs
            .next()
            .ok_or_else(|| LinkError::config(format!("'{endpoint}' resolved to no address")))?;

        debug!("connecting to modbus tcp server at {socket_addr}");
        match timeout(request_timeout, tcp::connect(socket_addr)).await {
            Ok(Ok(ctx)) => Ok(ctx),
            Ok(Err(e)) => Err(LinkError::io(format!("tcp connect failed: {e}"))),
            Err(_) => Err(LinkError::Timeout),
        }
    }

    async fn connect_rtu(
        device: &str,
        serial: SerialParams,
        request_timeout: Duration,
        unit: u8,
    ) -> Result<client::Context> {
        let data_bits = match serial.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match serial.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        let parity = match serial.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };

        debug!(
            "opening serial device {device} at {} baud",
            serial.baud_rate
        );
        let builder = tokio_serial::new(device, serial.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .timeout(request_timeout);

        let stream = tokio_serial::SerialStream::open(&builder)
            .map_err(|e| LinkError::io(format!("failed to open serial device: {e}")))?;

        Ok(rtu::attach_slave(stream, Slave(unit)))
    }

    async fn read_words(&mut self, addr: u16, count: u16, kind: RegisterKind) -> Result<Vec<u16>> {
        let unit = self.unit;
        let request_timeout = self.config.timeout;
        let ctx = self.ctx.as_mut().ok_or(LinkError::NotOpen)?;
        ctx.set_slave(Slave(unit));

        let request = match kind {
            RegisterKind::Holding => ctx.read_holding_registers(addr, count),
            RegisterKind::Input => ctx.read_input_registers(addr, count),
        };

        let words = match timeout(request_timeout, request).await {
            Ok(Ok(words)) => words,
            Ok(Err(e)) => return Err(LinkError::from_io(e)),
            Err(_) => return Err(LinkError::Timeout),
        };

        if words.len() != count as usize {
            return Err(LinkError::io(format!(
                "short register response: expected {count} words, got {}",
                words.len()
            )));
        }
        Ok(words)
    }
}

#[async_trait]
impl RegisterLink for ModbusLink {
    async fn open(&mut self) -> Result<()> {
        if self.ctx.is_some() {
            return Ok(());
        }
        let ctx = match self.address.clone() {
            LinkAddress::Tcp(endpoint) => {
                Self::connect_tcp(&endpoint, self.config.timeout).await?
            }
            LinkAddress::Serial(device) => {
                Self::connect_rtu(&device, self.config.serial, self.config.timeout, self.unit)
                    .await?
            }
        };
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.ctx.take().is_some() {
            debug!("closed modbus link {}", self.config.url);
        }
        Ok(())
    }

    fn set_unit(&mut self, unit: u8) {
        self.unit = unit;
    }

    async fn read_register16(&mut self, addr: u16, kind: RegisterKind) -> Result<u16> {
        let words = self.read_words(addr, 1, kind).await?;
        Ok(codec::decode_word(words[0], self.config.byte_order))
    }

    async fn read_register32(&mut self, addr: u16, kind: RegisterKind) -> Result<u32> {
        let words = self.read_words(addr, 2, kind).await?;
        Ok(codec::assemble_u32(
            [words[0], words[1]],
            self.config.byte_order,
            self.config.word_order,
        ))
    }

    async fn read_float32(&mut self, addr: u16, kind: RegisterKind) -> Result<f32> {
        let words = self.read_words(addr, 2, kind).await?;
        Ok(codec::assemble_f32(
            [words[0], words[1]],
            self.config.byte_order,
            self.config.word_order,
        ))
    }
}

impl Drop for ModbusLink {
    fn drop(&mut self) {
        if self.ctx.is_some() {
            warn!("modbus link {} dropped while open", self.config.url);
        }
    }
}

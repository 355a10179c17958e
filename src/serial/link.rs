//! Serial device acquisition and bounded reads
//!
//! The knob microcontroller streams ASCII position samples over a UART.
//! `SerialLink` owns exclusive access to the device for one control session;
//! the device is released when the link drops, on every exit path.

use std::io::Read;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serialport::{DataBits, SerialPort, StopBits};
use tracing::debug;

use crate::error::{AppError, Result};

/// Default read buffer capacity in bytes
pub const DEFAULT_READ_BUFFER: usize = 256;

/// One raw position sample as received from the link.
///
/// Opaque bytes for one reporting interval; consumed immediately by the
/// decoder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSample(Vec<u8>);

impl RawSample {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Parity setting for the serial frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParityMode {
    #[default]
    None,
    Odd,
    Even,
}

impl ParityMode {
    fn to_serialport(self) -> serialport::Parity {
        match self {
            ParityMode::None => serialport::Parity::None,
            ParityMode::Odd => serialport::Parity::Odd,
            ParityMode::Even => serialport::Parity::Even,
        }
    }
}

/// Read/write timeout policy for the link.
///
/// Mirrors the classic five-parameter COMM timeout surface. The underlying
/// driver exposes a single deadline per port, so the effective read deadline
/// is `read_total_constant + read_total_multiplier * buffer_capacity`; the
/// remaining fields stay part of the configuration surface (this link never
/// transmits, and per-byte gap control is not portable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    /// Maximum gap between consecutive bytes, in milliseconds
    pub read_interval_ms: u64,
    /// Fixed part of the read deadline, in milliseconds
    pub read_total_constant_ms: u64,
    /// Per-byte part of the read deadline, in milliseconds
    pub read_total_multiplier_ms: u64,
    /// Fixed part of the write deadline, in milliseconds
    pub write_total_constant_ms: u64,
    /// Per-byte part of the write deadline, in milliseconds
    pub write_total_multiplier_ms: u64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            read_interval_ms: 1,
            read_total_constant_ms: 50,
            read_total_multiplier_ms: 10,
            write_total_constant_ms: 50,
            write_total_multiplier_ms: 10,
        }
    }
}

impl TimeoutPolicy {
    /// Effective deadline for one read into a buffer of `capacity` bytes.
    pub fn read_timeout(&self, capacity: usize) -> Duration {
        Duration::from_millis(
            self.read_total_constant_ms
                .saturating_add(self.read_total_multiplier_ms.saturating_mul(capacity as u64)),
        )
    }

    /// Effective deadline for writing `len` bytes.
    pub fn write_timeout(&self, len: usize) -> Duration {
        Duration::from_millis(
            self.write_total_constant_ms
                .saturating_add(self.write_total_multiplier_ms.saturating_mul(len as u64)),
        )
    }
}

/// Serial link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path (e.g. /dev/ttyUSB0 or a COM port name)
    pub device: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits per frame (5-8)
    pub data_bits: u8,
    /// Stop bits per frame (1 or 2)
    pub stop_bits: u8,
    /// Parity mode
    pub parity: ParityMode,
    /// Read buffer capacity in bytes
    pub read_buffer: usize,
    /// Timeout policy
    pub timeouts: TimeoutPolicy,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            data_bits: 8,
            stop_bits: 1,
            parity: ParityMode::None,
            read_buffer: DEFAULT_READ_BUFFER,
            timeouts: TimeoutPolicy::default(),
        }
    }
}

/// Source of raw position samples.
///
/// Seam between the control loop and the serial driver so the loop can be
/// exercised with scripted sources. Errors are transient from the caller's
/// view; escalation after repeated failures is the control loop's job.
pub trait SampleSource {
    /// One bounded read attempt.
    fn read_sample(&mut self) -> Result<RawSample>;
}

/// Exclusive handle on the serial device for one control session
pub struct SerialLink {
    device: String,
    port: Box<dyn SerialPort>,
    buf: Vec<u8>,
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("device", &self.device)
            .field("buf", &self.buf)
            .finish_non_exhaustive()
    }
}

impl SerialLink {
    /// Acquire the device and configure framing and timeouts.
    ///
    /// Failure here is fatal for the session; there is no retry at open time.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let capacity = config.read_buffer.max(1);
        let port = serialport::new(config.device.as_str(), config.baud_rate)
            .data_bits(data_bits(config.data_bits, &config.device)?)
            .stop_bits(stop_bits(config.stop_bits, &config.device)?)
            .parity(config.parity.to_serialport())
            .timeout(config.timeouts.read_timeout(capacity))
            .open()
            .map_err(|e| connection_error(&config.device, "failed to open serial device", e))?;

        debug!(
            "Serial device acquired: {} @ {} baud, {}{}{}",
            config.device,
            config.baud_rate,
            config.data_bits,
            match config.parity {
                ParityMode::None => "N",
                ParityMode::Odd => "O",
                ParityMode::Even => "E",
            },
            config.stop_bits
        );

        Ok(Self {
            device: config.device.clone(),
            port,
            buf: vec![0u8; capacity],
        })
    }
}

impl SampleSource for SerialLink {
    fn read_sample(&mut self) -> Result<RawSample> {
        match self.port.read(&mut self.buf) {
            Ok(0) => Err(AppError::Read(format!("{}: no data", self.device))),
            Ok(n) => Ok(RawSample::from_bytes(&self.buf[..n])),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                Err(AppError::Read(format!("{}: read timed out", self.device)))
            }
            Err(e) => Err(AppError::Read(format!("{}: {}", self.device, e))),
        }
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        debug!("Serial device released: {}", self.device);
    }
}

fn data_bits(bits: u8, device: &str) -> Result<DataBits> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(AppError::Connection {
            device: device.to_string(),
            reason: format!("invalid data bits: {}", other),
            error_code: "invalid_config".to_string(),
        }),
    }
}

fn stop_bits(bits: u8, device: &str) -> Result<StopBits> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        other => Err(AppError::Connection {
            device: device.to_string(),
            reason: format!("invalid stop bits: {}", other),
            error_code: "invalid_config".to_string(),
        }),
    }
}

/// Convert a serialport error into a connection error with a stable code
fn connection_error(device: &str, operation: &str, e: serialport::Error) -> AppError {
    let error_code = match e.kind() {
        serialport::ErrorKind::NoDevice => "port_not_found",
        serialport::ErrorKind::InvalidInput => "invalid_config",
        serialport::ErrorKind::Io(_) => "io_error",
        _ => "serial_error",
    };

    AppError::Connection {
        device: device.to_string(),
        reason: format!("{}: {}", operation, e),
        error_code: error_code.to_string(),
    }
}

//! Serial transport session.
//!
//! [`SerialSession`] implements the session contract over a blocking serial
//! port: line-oriented writes and reads with configurable terminations, an
//! explicit read timeout, and buffer flushing in both directions. Ports are
//! opened 8N1 with no flow control.
//!
//! A device id may be a port path (`/dev/ttyUSB0`, `COM3`) or a stable USB
//! identifier (the adapter's serial number, or `vid:pid` in hex). Paths move
//! around as devices re-enumerate; the USB identifiers do not, so resolution
//! warns when a plain path was used and a stable id was available.

use std::io::{BufRead, BufReader, Write};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, SerialPort, SerialPortInfo, SerialPortType};
use tracing::{debug, warn};

use crate::error::{Result, ScpiError};
use crate::session::Session;

// =============================================================================
// Configuration
// =============================================================================

fn default_baud_rate() -> u32 {
    57600
}

fn default_termination() -> String {
    "\n".to_string()
}

fn default_timeout_ms() -> u64 {
    2000
}

/// Serial link settings.
///
/// All fields have serde defaults so the struct can be embedded in a host
/// application's TOML/JSON configuration and partially specified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Baud rate; data framing is always 8N1 with no flow control.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Byte sequence terminating a device response. Must not be empty.
    #[serde(default = "default_termination")]
    pub read_termination: String,
    /// Byte sequence appended to every outgoing command. Must not be empty.
    #[serde(default = "default_termination")]
    pub write_termination: String,
    /// Read timeout for a single response.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Settle time after opening the port, before the first flush.
    #[serde(default)]
    pub wait_after_connect_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            read_termination: default_termination(),
            write_termination: default_termination(),
            timeout_ms: default_timeout_ms(),
            wait_after_connect_ms: 0,
        }
    }
}

// =============================================================================
// Port Resolution
// =============================================================================

fn matches_usb_id(info: &SerialPortInfo, id: &str) -> bool {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => {
            usb.serial_number.as_deref() == Some(id)
                || format!("{:04x}:{:04x}", usb.vid, usb.pid) == id.to_ascii_lowercase()
        }
        _ => false,
    }
}

fn stable_id(info: &SerialPortInfo) -> Option<String> {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => Some(
            usb.serial_number
                .clone()
                .unwrap_or_else(|| format!("{:04x}:{:04x}", usb.vid, usb.pid)),
        ),
        _ => None,
    }
}

/// Resolve a device id to the current port path.
///
/// Matches enumerated ports by path, USB serial number, or `vid:pid`; a path
/// the enumeration does not know about (a pseudo-terminal, say) is accepted
/// as-is when it exists on disk.
///
/// # Errors
///
/// [`ScpiError::Configuration`] when the id matches no device or more than
/// one, or when port enumeration itself fails.
pub fn resolve_port(id: &str) -> Result<String> {
    let ports = serialport::available_ports()
        .map_err(|err| ScpiError::Configuration(format!("could not enumerate serial ports: {err}")))?;

    let matches: Vec<&SerialPortInfo> = ports
        .iter()
        .filter(|info| info.port_name == id || matches_usb_id(info, id))
        .collect();

    match matches.as_slice() {
        [] => {
            if std::path::Path::new(id).exists() {
                return Ok(id.to_string());
            }
            let known: Vec<&str> = ports.iter().map(|p| p.port_name.as_str()).collect();
            Err(ScpiError::Configuration(format!(
                "device '{}' not found; available ports: [{}]",
                id,
                known.join(", ")
            )))
        }
        [info] => {
            if info.port_name == id {
                if let Some(stable) = stable_id(info) {
                    warn!(
                        "device opened by port path '{}'; the stable id '{}' would survive re-enumeration",
                        id, stable
                    );
                }
            }
            Ok(info.port_name.clone())
        }
        _ => Err(ScpiError::Configuration(format!(
            "multiple devices match '{id}'"
        ))),
    }
}

// =============================================================================
// Serial Session
// =============================================================================

type Port = BufReader<Box<dyn SerialPort>>;

/// Blocking line-oriented session over a serial port.
///
/// Interior mutability keeps the trait methods at `&self`; exclusive use is
/// guaranteed upstream by the per-device lock. After `close`, every
/// operation fails with [`ScpiError::SessionClosed`].
pub struct SerialSession {
    port: Mutex<Option<Port>>,
    read_termination: Vec<u8>,
    write_termination: Vec<u8>,
    port_name: String,
}

impl SerialSession {
    /// Resolve `device_id` and open the port with `config`'s settings.
    pub fn open(device_id: &str, config: &SerialConfig) -> Result<Self> {
        if config.read_termination.is_empty() || config.write_termination.is_empty() {
            return Err(ScpiError::Configuration(
                "read/write terminations must not be empty".to_string(),
            ));
        }

        let port_name = resolve_port(device_id)?;
        debug!(
            "opening {} at {} baud (timeout {} ms)",
            port_name, config.baud_rate, config.timeout_ms
        );

        let port = serialport::new(&port_name, config.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(config.timeout_ms))
            .open()?;

        if config.wait_after_connect_ms > 0 {
            thread::sleep(Duration::from_millis(config.wait_after_connect_ms));
        }

        Ok(Self {
            port: Mutex::new(Some(BufReader::new(port))),
            read_termination: config.read_termination.as_bytes().to_vec(),
            write_termination: config.write_termination.as_bytes().to_vec(),
            port_name,
        })
    }

    /// The resolved port path this session talks through.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn send(port: &mut Port, command: &str, termination: &[u8]) -> Result<()> {
        let raw = port.get_mut();
        raw.write_all(command.as_bytes())?;
        raw.write_all(termination)?;
        raw.flush()?;
        Ok(())
    }
}

impl Session for SerialSession {
    fn write(&self, command: &str) -> Result<()> {
        let mut guard = self.port.lock().unwrap_or_else(PoisonError::into_inner);
        let port = guard.as_mut().ok_or(ScpiError::SessionClosed)?;
        Self::send(port, command, &self.write_termination)
    }

    fn query(&self, command: &str) -> Result<String> {
        let mut guard = self.port.lock().unwrap_or_else(PoisonError::into_inner);
        let port = guard.as_mut().ok_or(ScpiError::SessionClosed)?;
        Self::send(port, command, &self.write_termination)?;

        let delimiter = self.read_termination.last().copied().unwrap_or(b'\n');
        let mut raw = Vec::new();
        let read = port.read_until(delimiter, &mut raw)?;
        if read == 0 {
            return Err(ScpiError::Transport(
                "unexpected EOF from serial port".to_string(),
            ));
        }

        if raw.ends_with(&self.read_termination) {
            raw.truncate(raw.len() - self.read_termination.len());
        }
        while raw.last() == Some(&b'\r') {
            raw.pop();
        }
        String::from_utf8(raw)
            .map_err(|_| ScpiError::Transport("response is not valid UTF-8".to_string()))
    }

    fn flush(&self) -> Result<()> {
        let mut guard = self.port.lock().unwrap_or_else(PoisonError::into_inner);
        let port = guard.as_mut().ok_or(ScpiError::SessionClosed)?;
        port.get_ref().clear(ClearBuffer::All)?;
        // Bytes already pulled into the reader are stale too.
        let buffered = port.buffer().len();
        port.consume(buffered);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.port.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.take().is_some() {
            debug!("closed serial port {}", self.port_name);
        }
        Ok(())
    }
}

//! Serial port transport.
//!
//! `port = "auto"` is resolved on every open, so a scale plugged in after
//! start-up is picked up by the next reopen.
use crate::error::IoError;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use weigh_config::{FlowControl, Parity, SerialSection};
use weigh_traits::{BoxError, ByteTransport, TransportOpener};

/// Value of `serial.port` that selects the first detected port.
pub const AUTO_PORT: &str = "auto";

fn lowest(names: &[&str], prefix: &str) -> Option<String> {
    names.iter().filter(|n| n.starts_with(prefix)).min().map(|n| (*n).to_string())
}

/// First COM port, else the lowest ttyUSB, else the lowest ttyACM.
pub fn pick_port<S: AsRef<str>>(names: &[S]) -> Option<String> {
    let names: Vec<&str> = names.iter().map(|n| n.as_ref()).collect();
    names
        .iter()
        .find(|n| n.to_ascii_uppercase().starts_with("COM"))
        .map(|n| (*n).to_string())
        .or_else(|| lowest(&names, "/dev/ttyUSB"))
        .or_else(|| lowest(&names, "/dev/ttyACM"))
}

fn detect_port() -> Result<String, IoError> {
    let ports = serialport::available_ports().map_err(IoError::from)?;
    let names: Vec<String> = ports.into_iter().map(|p| p.port_name).collect();
    pick_port(&names).ok_or_else(|| {
        IoError::Serial(format!(
            "no serial port detected among {names:?}; set serial.port or plug in the device"
        ))
    })
}

/// Line settings for one port, applied on every open.
#[derive(Debug, Clone)]
pub struct SerialOpener {
    port: String,
    baud_rate: u32,
    data_bits: serialport::DataBits,
    parity: serialport::Parity,
    stop_bits: serialport::StopBits,
    flow_control: serialport::FlowControl,
    dtr_on_open: bool,
    rts_on_open: bool,
    read_timeout: Duration,
    /// Port chosen by the last `auto` open.
    resolved: Option<String>,
}

impl SerialOpener {
    pub fn from_section(s: &SerialSection) -> Result<Self, IoError> {
        let data_bits = match s.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            8 => serialport::DataBits::Eight,
            other => return Err(IoError::Serial(format!("unsupported data bits: {other}"))),
        };
        let stop_bits = match s.stop_bits {
            1 => serialport::StopBits::One,
            2 => serialport::StopBits::Two,
            other => return Err(IoError::Serial(format!("unsupported stop bits: {other}"))),
        };
        Ok(Self {
            port: s.port.clone(),
            baud_rate: s.baud_rate,
            data_bits,
            parity: match s.parity {
                Parity::N => serialport::Parity::None,
                Parity::E => serialport::Parity::Even,
                Parity::O => serialport::Parity::Odd,
            },
            stop_bits,
            flow_control: match s.flow_control {
                FlowControl::None => serialport::FlowControl::None,
                FlowControl::Software => serialport::FlowControl::Software,
                FlowControl::Hardware => serialport::FlowControl::Hardware,
            },
            dtr_on_open: s.dtr_on_open,
            rts_on_open: s.rts_on_open,
            read_timeout: Duration::from_millis(s.read_timeout_ms.max(1)),
            resolved: None,
        })
    }

    pub fn is_auto(&self) -> bool {
        self.port.eq_ignore_ascii_case(AUTO_PORT)
    }

    fn target(&mut self) -> Result<String, IoError> {
        if !self.is_auto() {
            return Ok(self.port.clone());
        }
        let port = detect_port()?;
        if self.resolved.as_deref() != Some(port.as_str()) {
            tracing::info!(%port, "serial port auto-detected");
        }
        self.resolved = Some(port.clone());
        Ok(port)
    }
}

impl TransportOpener for SerialOpener {
    fn open(&mut self) -> Result<Box<dyn ByteTransport>, BoxError> {
        let target = self.target()?;
        let mut port = serialport::new(&target, self.baud_rate)
            .data_bits(self.data_bits)
            .parity(self.parity)
            .stop_bits(self.stop_bits)
            .flow_control(self.flow_control)
            .timeout(self.read_timeout)
            .open()
            .map_err(IoError::from)?;
        if self.dtr_on_open {
            port.write_data_terminal_ready(true).map_err(IoError::from)?;
        }
        if self.rts_on_open {
            port.write_request_to_send(true).map_err(IoError::from)?;
        }
        Ok(Box::new(SerialTransport { port }))
    }

    fn describe(&self) -> String {
        match (&self.resolved, self.is_auto()) {
            (Some(port), true) => format!("{port} (auto) @ {}", self.baud_rate),
            _ => format!("{} @ {}", self.port, self.baud_rate),
        }
    }
}

struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl ByteTransport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, BoxError> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(0),
            Err(e) => Err(Box::new(IoError::Serial(e.to_string()))),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), BoxError> {
        self.port
            .write_all(bytes)
            .and_then(|()| self.port.flush())
            .map_err(|e| Box::new(IoError::Serial(e.to_string())) as BoxError)
    }
}

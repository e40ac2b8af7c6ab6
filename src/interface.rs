//! Serial port and clock abstractions
//!
//! The protocol layer only ever talks to [`SerialPort`] and [`Clock`], so it
//! can be exercised without hardware. [`SerialInterface`] is the native
//! implementation backed by the `serialport` crate.

use std::{
    io::{Read, Write},
    time::{Duration, Instant},
};

use serialport::{ClearBuffer, FlowControl};

use crate::error::ConnectionError;

/// Desired level for a control line at open time or during a reset pulse.
///
/// Levels are named at the RS-232 electrical level; a USB adapter may invert
/// the logical sense, which is the cable's business, not ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineLevel {
    /// Leave the line as-is
    #[default]
    Leave,
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    #[default]
    Eight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    #[default]
    One,
    OneAndHalf,
    Two,
}

/// Framing and initial control-line configuration for opening a port.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortSettings {
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub dtr: LineLevel,
    pub rts: LineLevel,
}

/// Byte-level access to an asynchronous serial channel.
pub trait SerialPort {
    /// Change the baud rate of an open port
    fn set_speed(&mut self, baud: u32) -> Result<(), ConnectionError>;

    /// Read available bytes into `buf`, returning the count transferred.
    /// Blocks for at most the device timeout when nothing is available.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ConnectionError>;

    /// Write the whole buffer
    fn write_all(&mut self, buf: &[u8]) -> Result<(), ConnectionError>;

    /// Number of bytes queued in the driver
    fn available(&mut self) -> Result<usize, ConnectionError>;

    /// Drive the DTR and/or RTS lines
    fn set_control(&mut self, dtr: LineLevel, rts: LineLevel) -> Result<(), ConnectionError>;

    /// Hold the TX line in break condition for `ms` milliseconds
    fn send_break(&mut self, ms: u64) -> Result<(), ConnectionError>;

    /// Discard everything queued in the driver's receive buffer
    fn flush_rx(&mut self) -> Result<(), ConnectionError>;
}

/// Monotonic milliseconds and sleeping, factored out so protocol timeouts
/// are testable.
pub trait Clock {
    fn ticks_ms(&self) -> u64;
    fn sleep_ms(&self, ms: u64);
}

/// [`Clock`] implementation over the host's monotonic clock.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn ticks_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Native [`SerialPort`] implementation over the `serialport` crate.
pub struct SerialInterface {
    port: Box<dyn serialport::SerialPort>,
}

/// Inner read timeout for the OS port. Protocol-level timeouts are enforced
/// above this layer, so reads only need to wake up often enough to poll.
const DEVICE_TIMEOUT: Duration = Duration::from_millis(50);

impl SerialInterface {
    /// Open `desc` (e.g. `/dev/ttyUSB0` or `COM3`) at `baud`, applying the
    /// framing and initial control-line levels from `settings`.
    pub fn open(desc: &str, baud: u32, settings: PortSettings) -> Result<Self, ConnectionError> {
        let data_bits = match settings.data_bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        };
        let parity = match settings.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        };
        // The serialport crate has no 1.5-stop-bit setting; two is the
        // closest the driver offers.
        let stop_bits = match settings.stop_bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::OneAndHalf | StopBits::Two => serialport::StopBits::Two,
        };

        let port = serialport::new(desc, baud)
            .flow_control(FlowControl::None)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(DEVICE_TIMEOUT)
            .open()
            .map_err(ConnectionError::CommOpen)?;

        let mut interface = SerialInterface { port };
        interface.set_control(settings.dtr, settings.rts)?;

        Ok(interface)
    }
}

impl SerialPort for SerialInterface {
    fn set_speed(&mut self, baud: u32) -> Result<(), ConnectionError> {
        self.port.set_baud_rate(baud)?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(ConnectionError::CommRead(e)),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), ConnectionError> {
        self.port
            .write_all(buf)
            .and_then(|_| self.port.flush())
            .map_err(ConnectionError::CommWrite)
    }

    fn available(&mut self) -> Result<usize, ConnectionError> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn set_control(&mut self, dtr: LineLevel, rts: LineLevel) -> Result<(), ConnectionError> {
        match dtr {
            LineLevel::Leave => {}
            LineLevel::Low => self.port.write_data_terminal_ready(false)?,
            LineLevel::High => self.port.write_data_terminal_ready(true)?,
        }
        match rts {
            LineLevel::Leave => {}
            LineLevel::Low => self.port.write_request_to_send(false)?,
            LineLevel::High => self.port.write_request_to_send(true)?,
        }
        Ok(())
    }

    fn send_break(&mut self, ms: u64) -> Result<(), ConnectionError> {
        self.port.set_break()?;
        std::thread::sleep(Duration::from_millis(ms));
        self.port.clear_break()?;
        Ok(())
    }

    fn flush_rx(&mut self) -> Result<(), ConnectionError> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

//! Library and application errors

use std::fmt::{Display, Formatter};

use miette::Diagnostic;
use thiserror::Error;

use crate::command::CommandType;

#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("Error while communicating with device")]
    #[diagnostic(transparent)]
    Connection(#[from] ConnectionError),
    #[error("Supplied ELF image is not valid: {0}")]
    #[diagnostic(
        code(esp_tool::invalid_elf),
        help("Make sure the file is a little-endian ELF32 object")
    )]
    InvalidElf(String),
    #[error("Invalid parameter: {0}")]
    #[diagnostic(code(esp_tool::invalid_parameter))]
    Param(String),
    #[error("Unable to determine the OUI (code {0:#04x})")]
    #[diagnostic(
        code(esp_tool::unknown_oui),
        help("The OTP id byte does not match any known vendor prefix")
    )]
    UnknownOui(u8),
    #[error("The device OTP does not contain a programmed MAC address")]
    #[diagnostic(code(esp_tool::otp_not_programmed))]
    Device,
    #[error("The image file \"{0}\" is zero length")]
    #[diagnostic(code(esp_tool::image_size))]
    ImageSize(String),
    #[error("The filename \"{0}\" exceeds the supported length")]
    #[diagnostic(code(esp_tool::filename_length))]
    FilenameLength(String),
    #[error("The file \"{0}\" is neither a standard ESP image nor a combined image")]
    #[diagnostic(code(esp_tool::unknown_image))]
    UnknownImageFormat(String),
    #[error("The file \"{0}\" is not a valid ESP image")]
    #[diagnostic(code(esp_tool::invalid_image))]
    InvalidImage(String),
    #[error("Can't allocate {0} bytes")]
    #[diagnostic(code(esp_tool::alloc))]
    Alloc(usize),
    #[error("Can't open file \"{path}\" for reading")]
    #[diagnostic(code(esp_tool::file_open))]
    FileOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Can't create file \"{path}\"")]
    #[diagnostic(code(esp_tool::file_create))]
    FileCreate {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("An error occurred while reading \"{path}\"")]
    #[diagnostic(code(esp_tool::file_read))]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("An error occurred while writing \"{path}\"")]
    #[diagnostic(code(esp_tool::file_write))]
    FileWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Can't reposition the file \"{path}\"")]
    #[diagnostic(code(esp_tool::file_seek))]
    FileSeek { path: String },
    #[error("Can't determine the size of the file \"{path}\"")]
    #[diagnostic(code(esp_tool::file_size))]
    FileSize {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Transport-level failures on the serial link
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Timeout while running {0}command")]
    #[diagnostic(code(esp_tool::timeout))]
    Timeout(TimedOutCommand),
    #[error("Failed to open serial port: {0}")]
    #[diagnostic(
        code(esp_tool::serial_open),
        help("Make sure the correct device is connected to the host system")
    )]
    CommOpen(#[source] serialport::Error),
    #[error("IO error while reading from serial port: {0}")]
    #[diagnostic(code(esp_tool::serial_read))]
    CommRead(#[source] std::io::Error),
    #[error("IO error while writing to serial port: {0}")]
    #[diagnostic(code(esp_tool::serial_write))]
    CommWrite(#[source] std::io::Error),
    #[error("Failed to connect to the device")]
    #[diagnostic(
        code(esp_tool::connection_failed),
        help("Ensure that the device is in download mode and the reset mode matches your board")
    )]
    ConnectionFailed,
    #[error("The device replied with an unexpected status")]
    #[diagnostic(code(esp_tool::bad_reply))]
    Reply,
    #[error("Received a response header with a bad direction or operation byte")]
    #[diagnostic(code(esp_tool::response_header))]
    ResponseHeader,
    #[error("Expected a frame start marker, got another byte")]
    #[diagnostic(code(esp_tool::slip_start))]
    SlipStart,
    #[error("Received packet has invalid SLIP framing")]
    #[diagnostic(
        code(esp_tool::slip_framing),
        help("Try hard-resetting the device and try again")
    )]
    SlipFrame,
    #[error("The packet reader entered an invalid state")]
    #[diagnostic(code(esp_tool::slip_state))]
    SlipState,
    #[error("SLIP decoder ran out of data mid-sequence")]
    #[diagnostic(code(esp_tool::slip_data))]
    SlipData,
    #[error("Expected a frame end marker, got another byte")]
    #[diagnostic(code(esp_tool::slip_end))]
    SlipEnd,
}

/// The command that was in flight when a timeout fired, if any.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl From<CommandType> for TimedOutCommand {
    fn from(command: CommandType) -> Self {
        TimedOutCommand {
            command: Some(command),
        }
    }
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(kind) => ConnectionError::CommRead(kind.into()),
            _ => ConnectionError::CommOpen(err),
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Error::Connection(err.into())
    }
}

pub(crate) trait ResultExt {
    /// Attribute a bare timeout to the command that was in flight
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, ConnectionError> {
    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(ConnectionError::Timeout(_)) => Err(ConnectionError::Timeout(command.into())),
            res => res,
        }
    }
}

//! Command transport over the serial link
//!
//! [`Connection`] owns the port, the receive queue, and the clock. It frames
//! outgoing commands, runs the packet state machine over incoming bytes,
//! and matches each response to the command in flight; there is no
//! multiplexing, a reply is always read before the next send.

use log::{debug, trace};

use crate::{
    command::{Command, CommandType},
    error::{ConnectionError, ResultExt, TimedOutCommand},
    interface::{Clock, SerialPort},
    queue::RxQueue,
    slip::{self, DecodeStep, SlipEncoder},
};

pub mod reset;

/// Direction byte carried by every loader response header
const DIRECTION_RESPONSE: u8 = 0x01;
/// Fixed length of the response header
const HEADER_LEN: usize = 8;

/// A decoded loader response
#[derive(Debug, Clone)]
pub struct CommandResponse {
    /// Value word from the header; `READ_REG` returns its result here
    pub value: u32,
    /// Response body; two zero bytes on plain success
    pub body: Vec<u8>,
}

enum ReadState {
    Begin,
    Header,
    Body,
    End,
}

pub struct Connection {
    serial: Box<dyn SerialPort>,
    queue: RxQueue,
    clock: Box<dyn Clock>,
    /// Disables reply-timeout enforcement, for debugging a wedged link
    no_time_limit: bool,
}

impl Connection {
    pub fn new(serial: Box<dyn SerialPort>, clock: Box<dyn Clock>) -> Self {
        Connection {
            serial,
            queue: RxQueue::new(0),
            clock,
            no_time_limit: false,
        }
    }

    pub fn set_no_time_limit(&mut self, on: bool) {
        self.no_time_limit = on;
    }

    pub fn set_speed(&mut self, baud: u32) -> Result<(), ConnectionError> {
        self.serial.set_speed(baud)
    }

    pub fn serial_mut(&mut self) -> &mut dyn SerialPort {
        self.serial.as_mut()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Drop all stale input, host-side and driver-side
    pub fn flush_input(&mut self) -> Result<(), ConnectionError> {
        self.queue.flush(self.serial.as_mut())
    }

    /// Frame and send a command as one write: `C0 | slip(header|payload) | C0`
    pub fn send_command(&mut self, command: &Command<'_>) -> Result<(), ConnectionError> {
        trace!("Sending command: {command:?}");
        self.flush_input()?;

        let mut frame = Vec::new();
        let mut encoder = SlipEncoder::new(&mut frame).map_err(ConnectionError::CommWrite)?;
        command
            .write(&mut encoder)
            .map_err(ConnectionError::CommWrite)?;
        encoder.finish().map_err(ConnectionError::CommWrite)?;

        self.serial.write_all(&frame)
    }

    /// Send a command and match its reply. Returns the header value word;
    /// anything other than a two-zero-byte body is a reply error.
    pub fn command(&mut self, command: &Command<'_>) -> Result<u32, ConnectionError> {
        self.command_with_timeout(command, command.timeout_ms())
    }

    /// [`command`](Self::command) with an explicit reply timeout
    pub fn command_with_timeout(
        &mut self,
        command: &Command<'_>,
        timeout: u64,
    ) -> Result<u32, ConnectionError> {
        let ty = command.command_type();

        self.send_command(command).for_command(ty)?;
        let response = self.read_packet(Some(ty as u8), timeout).for_command(ty)?;

        if response.body == [0, 0] {
            Ok(response.value)
        } else {
            debug!("{ty} rejected, body {:02x?}", response.body);
            Err(ConnectionError::Reply)
        }
    }

    pub fn read_reg(&mut self, address: u32) -> Result<u32, ConnectionError> {
        self.command(&Command::ReadReg { address })
    }

    pub fn write_reg(
        &mut self,
        address: u32,
        value: u32,
        mask: u32,
        delay_us: u32,
    ) -> Result<(), ConnectionError> {
        self.command(&Command::WriteReg {
            address,
            value,
            mask,
            delay_us,
        })?;
        Ok(())
    }

    /// Run the packet state machine until one whole response frame has been
    /// consumed. `expected_op` of `None` accepts any operation byte.
    pub fn read_packet(
        &mut self,
        expected_op: Option<u8>,
        timeout_ms: u64,
    ) -> Result<CommandResponse, ConnectionError> {
        let deadline = self.clock.ticks_ms() + timeout_ms;
        let mut state = ReadState::Begin;
        let mut needed = 1usize;

        let mut header = [0u8; HEADER_LEN];
        let mut header_idx = 0usize;
        let mut body: Vec<u8> = Vec::new();
        let mut body_len = 0usize;
        let mut value = 0u32;

        loop {
            if !self.no_time_limit && self.clock.ticks_ms() > deadline {
                return Err(ConnectionError::Timeout(TimedOutCommand::default()));
            }

            self.queue.refresh(self.serial.as_mut())?;
            if self.queue.len() < needed {
                self.clock.sleep_ms(1);
                continue;
            }

            match state {
                ReadState::Begin | ReadState::End => {
                    let byte = self.queue.pop().expect("byte available");
                    if byte != slip::END {
                        return Err(ConnectionError::SlipFrame);
                    }
                    match state {
                        ReadState::Begin => {
                            state = ReadState::Header;
                            needed = 2;
                        }
                        _ => return Ok(CommandResponse { value, body }),
                    }
                }
                ReadState::Header | ReadState::Body => {
                    let byte = match slip::decode_byte(&mut self.queue) {
                        DecodeStep::Byte(b) | DecodeStep::Escaped(b) => b,
                        DecodeStep::Empty | DecodeStep::Partial => {
                            return Err(ConnectionError::SlipData)
                        }
                        DecodeStep::Delimiter | DecodeStep::BadEscape(_) => {
                            return Err(ConnectionError::SlipFrame)
                        }
                    };
                    match state {
                        ReadState::Header => {
                            header[header_idx] = byte;
                            header_idx += 1;
                            if header_idx == HEADER_LEN {
                                if header[0] != DIRECTION_RESPONSE {
                                    return Err(ConnectionError::ResponseHeader);
                                }
                                if let Some(op) = expected_op {
                                    if header[1] != op {
                                        return Err(ConnectionError::ResponseHeader);
                                    }
                                }
                                body_len =
                                    u16::from_le_bytes(header[2..4].try_into().unwrap()) as usize;
                                value = u32::from_le_bytes(header[4..8].try_into().unwrap());
                                if body_len == 0 {
                                    state = ReadState::End;
                                    needed = 1;
                                } else {
                                    body.reserve(body_len);
                                    state = ReadState::Body;
                                    needed = 2;
                                }
                            }
                        }
                        _ => {
                            body.push(byte);
                            if body.len() == body_len {
                                state = ReadState::End;
                                needed = 1;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Read one unframed byte from the link
    pub fn read_byte_raw(&mut self, timeout_ms: u64) -> Result<u8, ConnectionError> {
        self.wait_for(1, timeout_ms)?;
        Ok(self.queue.pop().expect("byte available"))
    }

    /// Read one SLIP-decoded body byte from the link
    pub fn read_byte_slip(&mut self, timeout_ms: u64) -> Result<u8, ConnectionError> {
        self.wait_for(2, timeout_ms)?;
        match slip::decode_byte(&mut self.queue) {
            DecodeStep::Byte(b) | DecodeStep::Escaped(b) => Ok(b),
            DecodeStep::Empty | DecodeStep::Partial => Err(ConnectionError::SlipData),
            DecodeStep::Delimiter | DecodeStep::BadEscape(_) => Err(ConnectionError::SlipFrame),
        }
    }

    fn wait_for(&mut self, needed: usize, timeout_ms: u64) -> Result<(), ConnectionError> {
        let deadline = self.clock.ticks_ms() + timeout_ms;
        loop {
            self.queue.refresh(self.serial.as_mut())?;
            if self.queue.len() >= needed {
                return Ok(());
            }
            if !self.no_time_limit && self.clock.ticks_ms() > deadline {
                return Err(ConnectionError::Timeout(TimedOutCommand::default()));
            }
            self.clock.sleep_ms(1);
        }
    }

    /// Reset into the loader using the given scheme
    pub fn enter_bootloader(&mut self, mode: reset::ResetMode) -> Result<(), ConnectionError> {
        mode.enter_bootloader(self.serial.as_mut(), self.clock.as_ref())
    }

    /// Reset into the application using the given scheme
    pub fn enter_app(&mut self, mode: reset::ResetMode) -> Result<(), ConnectionError> {
        mode.enter_app(self.serial.as_mut(), self.clock.as_ref())
    }

    /// Expose the sync-echo drain: read and drop one whole frame for `op`
    pub(crate) fn drain_packet(&mut self, op: CommandType, timeout_ms: u64) -> bool {
        self.read_packet(Some(op as u8), timeout_ms).is_ok()
    }
}

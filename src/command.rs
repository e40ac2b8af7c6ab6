//! ROM-loader commands and their wire encoding

use std::{io::Write, mem::size_of};

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::Display;

use crate::image_format::{checksum, CHECKSUM_INIT};

/// Default reply timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 500;
/// A `FLASH_BEGIN` with a non-zero size erases the region first, which can
/// take the ROM several seconds.
pub const ERASE_TIMEOUT_MS: u64 = 10_000;

/// Operation codes understood by the ESP8266 factory ROM
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0A,
}

#[derive(Copy, Clone, Debug)]
pub enum Command<'a> {
    FlashBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    FlashData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    MemBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    MemData {
        data: &'a [u8],
        sequence: u32,
    },
    MemEnd {
        entry: u32,
    },
    Sync,
    WriteReg {
        address: u32,
        value: u32,
        mask: u32,
        delay_us: u32,
    },
    ReadReg {
        address: u32,
    },
}

impl<'a> Command<'a> {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::MemBegin { .. } => CommandType::MemBegin,
            Command::MemData { .. } => CommandType::MemData,
            Command::MemEnd { .. } => CommandType::MemEnd,
            Command::Sync => CommandType::Sync,
            Command::WriteReg { .. } => CommandType::WriteReg,
            Command::ReadReg { .. } => CommandType::ReadReg,
        }
    }

    /// Reply timeout for this command, in milliseconds
    pub fn timeout_ms(&self) -> u64 {
        match self {
            Command::FlashBegin { size, .. } if *size > 0 => ERASE_TIMEOUT_MS,
            _ => DEFAULT_TIMEOUT_MS,
        }
    }

    /// Serialize the command header and payload (everything between the
    /// SLIP sentinels) into `writer`.
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&[0, self.command_type() as u8])?;
        match *self {
            Command::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                begin_command(writer, size, blocks, block_size, offset)?;
            }
            Command::FlashData {
                data,
                pad_to,
                pad_byte,
                sequence,
            } => {
                data_command(writer, data, pad_to, pad_byte, sequence)?;
            }
            Command::FlashEnd { reboot } => {
                let run: u32 = if reboot { 0 } else { 1 };
                write_basic(writer, &run.to_le_bytes(), 0)?;
            }
            Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                begin_command(writer, size, blocks, block_size, offset)?;
            }
            Command::MemData { data, sequence } => {
                data_command(writer, data, data.len(), 0, sequence)?;
            }
            Command::MemEnd { entry } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct EntryParams {
                    no_entry: u32,
                    entry: u32,
                }
                let params = EntryParams {
                    no_entry: (entry == 0) as u32,
                    entry,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::Sync => {
                write_basic(
                    writer,
                    &[
                        0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                        0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                        0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                    ],
                    0,
                )?;
            }
            Command::WriteReg {
                address,
                value,
                mask,
                delay_us,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct WriteRegParams {
                    addr: u32,
                    value: u32,
                    mask: u32,
                    delay_us: u32,
                }
                let params = WriteRegParams {
                    // register accesses are word-aligned
                    addr: address & !0x03,
                    value,
                    mask,
                    delay_us,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::ReadReg { address } => {
                write_basic(writer, &(address & !0x03).to_le_bytes(), 0)?;
            }
        };
        Ok(())
    }
}

fn write_basic<W: Write>(mut writer: W, data: &[u8], check: u32) -> std::io::Result<()> {
    writer.write_all(&((data.len() as u16).to_le_bytes()))?;
    writer.write_all(&(check.to_le_bytes()))?;
    writer.write_all(data)?;
    Ok(())
}

fn begin_command<W: Write>(
    writer: W,
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BeginParams {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    }
    let params = BeginParams {
        size,
        blocks,
        block_size,
        offset,
    };
    write_basic(writer, bytes_of(&params), 0)
}

fn data_command<W: Write>(
    mut writer: W,
    block_data: &[u8],
    pad_to: usize,
    pad_byte: u8,
    sequence: u32,
) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy1: u32,
        dummy2: u32,
    }

    let pad_length = pad_to.saturating_sub(block_data.len());
    let params = BlockParams {
        size: (block_data.len() + pad_length) as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let mut check = checksum(block_data, CHECKSUM_INIT);
    for _ in 0..pad_length {
        check ^= pad_byte;
    }

    let total_length = size_of::<BlockParams>() + block_data.len() + pad_length;
    writer.write_all(&((total_length as u16).to_le_bytes()))?;
    writer.write_all(&((check as u32).to_le_bytes()))?;
    writer.write_all(bytes_of(&params))?;
    writer.write_all(block_data)?;
    for _ in 0..pad_length {
        writer.write_all(&[pad_byte])?;
    }
    Ok(())
}

//! High-level driver for the ESP8266 ROM loader
//!
//! [`Flasher`] sequences the loader workflows over a [`Connection`]: baud
//! synchronization, reset-and-retry connection establishment, the flash and
//! RAM download protocols, register access, and the OTP-derived device
//! queries.

use std::io::SeekFrom;

use log::{debug, info};

use crate::{
    byte_file::ByteFile,
    command::{Command, CommandType, DEFAULT_TIMEOUT_MS},
    connection::{reset::ResetMode, Connection},
    error::{ConnectionError, Error},
    image_format::{COMBINED_SIG, ESP_MAGIC},
    interface::{Clock, SerialPort},
    progress::ProgressCallbacks,
    slip,
    stubs::{self, ERASE_CHIP_ADDR, FLASH_READ_STUB_ENTRY, IRAM_ADDR},
};

/// Flash writes are issued in blocks of this many bytes
pub const FLASH_BLOCK_SIZE: u32 = 0x400;

/// Soft timeout for each sync probe during connection establishment
const SYNC_TIMEOUT_MS: u64 = 500;
/// Reset pulses and sync probes per reset, before giving up
const CONNECT_ATTEMPTS: usize = 4;
const SYNC_ATTEMPTS: usize = 4;
/// Each flash data block is retried this many times before failing the
/// whole write
const FLASH_DATA_TRIES: usize = 3;

/// OTP fuse words holding the factory MAC
const OTP_MAC0: u32 = 0x3FF0_0050;
const OTP_MAC1: u32 = 0x3FF0_0054;
const OTP_MAC2: u32 = 0x3FF0_0058;
const OTP_MAC3: u32 = 0x3FF0_005C;

/// SPI controller registers used for the flash-id sequence
const SPI_W0_REG: u32 = 0x6000_0240;
const SPI_CMD_REG: u32 = 0x6000_0200;
const SPI_CMD_READ_ID: u32 = 0x1000_0000;

/// Station and access-point MAC addresses from the OTP fuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress {
    pub station: [u8; 6],
    pub ap: [u8; 6],
}

pub struct Flasher {
    connection: Connection,
    connected: bool,
}

impl Flasher {
    pub fn new(serial: Box<dyn SerialPort>, clock: Box<dyn Clock>) -> Self {
        Flasher {
            connection: Connection::new(serial, clock),
            connected: false,
        }
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// Send one baud-rate synchronization probe and, on success, drain the
    /// extra replies the ROM sends for it.
    pub fn sync(&mut self, timeout_ms: u64) -> Result<(), Error> {
        match self
            .connection
            .command_with_timeout(&Command::Sync, timeout_ms)
        {
            Ok(_) => {
                while self.connection.drain_packet(CommandType::Sync, timeout_ms) {}
                Ok(())
            }
            Err(e) => {
                self.connection.clock().sleep_ms(100);
                self.connection.flush_input()?;
                Err(e.into())
            }
        }
    }

    /// Establish a connection: pulse the chosen reset scheme, then probe
    /// until the ROM answers, retrying the reset a few times.
    pub fn connect(&mut self, mode: ResetMode) -> Result<(), Error> {
        if self.connected {
            return Ok(());
        }

        info!("Connecting...");
        for _ in 0..CONNECT_ATTEMPTS {
            self.connection.enter_bootloader(mode)?;

            for _ in 0..SYNC_ATTEMPTS {
                match self.sync(SYNC_TIMEOUT_MS) {
                    Ok(()) => {
                        info!("Connection established");
                        self.connected = true;
                        return Ok(());
                    }
                    Err(e) => debug!("Sync failed, retrying: {e}"),
                }
            }
        }
        Err(ConnectionError::ConnectionFailed.into())
    }

    /// Make the ROM jump to the user code, optionally rebooting first
    pub fn run(&mut self, reboot: bool) -> Result<(), Error> {
        self.flash_begin(0, 0)?;
        self.connection.command(&Command::FlashEnd { reboot })?;
        Ok(())
    }

    /// Pulse a hardware reset so the chip boots the application
    pub fn reset_device(&mut self, mode: ResetMode) -> Result<(), Error> {
        self.connection.enter_app(mode)?;
        Ok(())
    }

    /// Read the JEDEC id of the SPI flash chip
    pub fn flash_id(&mut self) -> Result<u32, Error> {
        self.flash_begin(0, 0)?;
        self.connection.write_reg(SPI_W0_REG, 0, u32::MAX, 0)?;
        self.connection.write_reg(SPI_CMD_REG, SPI_CMD_READ_ID, u32::MAX, 0)?;
        Ok(self.connection.read_reg(SPI_W0_REG)?)
    }

    /// Read the factory MAC addresses out of the OTP words
    pub fn read_mac(&mut self) -> Result<MacAddress, Error> {
        let mac0 = self.connection.read_reg(OTP_MAC0)?;
        let mac1 = self.connection.read_reg(OTP_MAC1)?;
        let mac2 = self.connection.read_reg(OTP_MAC2)?;
        let _mac3 = self.connection.read_reg(OTP_MAC3)?;

        if mac2 & 0x0000_8000 == 0 {
            return Err(Error::Device);
        }

        let id = (mac1 >> 16) as u8;
        let (station_oui, ap_oui): ([u8; 3], [u8; 3]) = match id {
            0 => ([0x18, 0xFE, 0x34], [0x1A, 0xFE, 0x34]),
            1 => ([0xAC, 0xD0, 0x74], [0xAC, 0xD0, 0x74]),
            other => return Err(Error::UnknownOui(other)),
        };

        let low = [(mac1 >> 8) as u8, mac1 as u8, (mac0 >> 24) as u8];
        let mut station = [0u8; 6];
        let mut ap = [0u8; 6];
        station[..3].copy_from_slice(&station_oui);
        station[3..].copy_from_slice(&low);
        ap[..3].copy_from_slice(&ap_oui);
        ap[3..].copy_from_slice(&low);

        Ok(MacAddress { station, ap })
    }

    pub fn read_reg(&mut self, address: u32) -> Result<u32, Error> {
        Ok(self.connection.read_reg(address)?)
    }

    pub fn write_reg(&mut self, address: u32, value: u32, mask: u32) -> Result<(), Error> {
        Ok(self.connection.write_reg(address, value, mask, 0)?)
    }

    /// Erase the whole flash chip by jumping the ROM into `SPIEraseChip`
    pub fn erase_flash(&mut self) -> Result<(), Error> {
        self.flash_begin(0, 0)?;
        self.mem_begin(IRAM_ADDR, 0, 0, 0)?;
        self.mem_end(ERASE_CHIP_ADDR)?;
        Ok(())
    }

    /// Erase a block-aligned region of flash
    pub fn erase_region(&mut self, addr: u32, size: u32) -> Result<(), Error> {
        if size == 0 {
            return Err(Error::Param("the size to erase must be non-zero".into()));
        }
        let blocks = size.div_ceil(FLASH_BLOCK_SIZE);
        let addr = addr & !(FLASH_BLOCK_SIZE - 1);
        info!("Erasing {size} bytes at {addr:#08x}");
        self.flash_begin(addr, blocks * FLASH_BLOCK_SIZE)
    }

    /// Write a file to flash. A combined container fans out into one write
    /// per entry at that entry's own address; anything else is written as a
    /// single region at `addr`.
    pub fn flash_write(
        &mut self,
        vf: &mut ByteFile,
        addr: u32,
        parm_val: u16,
        parm_mask: u16,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let file_size = vf.len()? as u32;
        if file_size == 0 {
            return Err(Error::ImageSize(vf.name().to_string()));
        }

        vf.seek(SeekFrom::Start(0))?;
        let mut head = [0u8; 4];
        vf.read_exact(&mut head)?;

        if &head[..3] != COMBINED_SIG {
            return self.write_region(vf, 0, file_size, addr, parm_val, parm_mask, progress);
        }

        let image_count = head[3] as u16;
        for _ in 0..image_count {
            let mut desc = [0u8; 8];
            vf.read_exact(&mut desc)?;
            let entry_addr = u32::from_le_bytes(desc[0..4].try_into().unwrap());
            let entry_len = u32::from_le_bytes(desc[4..8].try_into().unwrap());
            let pos = vf.position()? as u32;

            self.write_region(vf, pos, entry_len, entry_addr, parm_val, parm_mask, progress)?;
            vf.seek(SeekFrom::Start((pos + entry_len) as u64))?;
        }
        Ok(())
    }

    /// Download the read stub, run it, and collect its raw SLIP frames into
    /// `vf` until `length` bytes have been stored.
    pub fn flash_read(
        &mut self,
        vf: &mut ByteFile,
        addr: u32,
        length: u32,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        if length == 0 {
            return Err(Error::Param("the size to read must be non-zero".into()));
        }

        // a single block of the exact size for short reads
        let (block_size, block_count) = if length <= FLASH_BLOCK_SIZE {
            (length, 1)
        } else {
            (FLASH_BLOCK_SIZE, length.div_ceil(FLASH_BLOCK_SIZE))
        };

        let stub = stubs::flash_read_stub(addr, block_size, block_count);
        self.flash_begin(0, 0)?;
        self.mem_begin(IRAM_ADDR, stub.len() as u32, stub.len() as u32, 1)?;
        self.mem_data(&stub, 0)?;
        self.mem_end(FLASH_READ_STUB_ENTRY)?;

        progress.init(addr, length as usize);
        let mut stored = 0u32;
        let mut block = Vec::with_capacity(block_size as usize);
        for _ in 0..block_count {
            if self.connection.read_byte_raw(DEFAULT_TIMEOUT_MS)? != slip::END {
                return Err(ConnectionError::SlipStart.into());
            }

            block.clear();
            for _ in 0..block_size {
                block.push(self.connection.read_byte_slip(DEFAULT_TIMEOUT_MS)?);
            }

            if self.connection.read_byte_raw(DEFAULT_TIMEOUT_MS)? != slip::END {
                return Err(ConnectionError::SlipEnd.into());
            }

            // the final block may run past the requested length
            let keep = (length - stored).min(block.len() as u32);
            vf.write_all(&block[..keep as usize])?;
            stored += keep;
            progress.update(stored as usize);
        }
        progress.finish();

        info!("{length} bytes written to \"{}\"", vf.name());
        Ok(())
    }

    /// Copy a memory region out word by word through `READ_REG`
    pub fn dump_mem(
        &mut self,
        vf: &mut ByteFile,
        addr: u32,
        size: u32,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let addr = addr & !0x03;
        progress.init(addr, size as usize);

        let mut ofst = 0;
        while ofst < size {
            let value = self.connection.read_reg(addr + ofst)?;
            vf.write_all(&value.to_le_bytes())?;
            ofst += 4;
            progress.update(ofst as usize);
        }
        progress.finish();

        info!("{ofst} bytes written to \"{}\"", vf.name());
        Ok(())
    }

    /// Write `size` bytes at `ofst` within `vf` to flash address `addr`
    #[allow(clippy::too_many_arguments)]
    fn write_region(
        &mut self,
        vf: &mut ByteFile,
        ofst: u32,
        size: u32,
        addr: u32,
        parm_val: u16,
        parm_mask: u16,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let block_count = size.div_ceil(FLASH_BLOCK_SIZE);

        vf.seek(SeekFrom::Start(ofst as u64))?;

        info!("Erasing {size} bytes at {addr:#08x}");
        self.flash_begin(addr, block_count * FLASH_BLOCK_SIZE)?;

        progress.init(addr, size as usize);
        let mut block = vec![0u8; FLASH_BLOCK_SIZE as usize];
        for sequence in 0..block_count {
            // partial last block, fill the remainder with erased-flash bytes
            let n = vf.read(&mut block)?;
            block[n..].fill(0xFF);

            // rewrite the flash parameters in an image headed for offset 0
            if sequence == 0 && addr == 0 && block[0] == ESP_MAGIC && parm_mask != 0 {
                let parm = u16::from_le_bytes(block[2..4].try_into().unwrap());
                let parm = (parm & !parm_mask) | parm_val;
                block[2..4].copy_from_slice(&parm.to_le_bytes());
            }

            let command = Command::FlashData {
                data: &block,
                pad_to: FLASH_BLOCK_SIZE as usize,
                pad_byte: 0xFF,
                sequence,
            };
            let mut result = Ok(0);
            for _ in 0..FLASH_DATA_TRIES {
                result = self.connection.command(&command);
                if result.is_ok() {
                    break;
                }
                debug!("Block {sequence} rejected, retrying");
            }
            result?;

            progress.update(((sequence + 1) * FLASH_BLOCK_SIZE).min(size) as usize);
        }
        progress.finish();

        info!("{size} bytes written successfully");
        Ok(())
    }

    fn flash_begin(&mut self, addr: u32, size: u32) -> Result<(), Error> {
        let blocks = size.div_ceil(FLASH_BLOCK_SIZE);
        self.connection.command(&Command::FlashBegin {
            size,
            blocks,
            block_size: FLASH_BLOCK_SIZE,
            // writes always start on a block boundary
            offset: addr & !(FLASH_BLOCK_SIZE - 1),
        })?;
        Ok(())
    }

    fn mem_begin(&mut self, addr: u32, size: u32, block_size: u32, blocks: u32) -> Result<(), Error> {
        self.connection.command(&Command::MemBegin {
            size,
            blocks,
            block_size,
            offset: addr,
        })?;
        Ok(())
    }

    fn mem_data(&mut self, data: &[u8], sequence: u32) -> Result<(), Error> {
        self.connection.command(&Command::MemData { data, sequence })?;
        Ok(())
    }

    fn mem_end(&mut self, entry: u32) -> Result<(), Error> {
        self.connection.command(&Command::MemEnd { entry })?;
        Ok(())
    }
}

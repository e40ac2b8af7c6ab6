//! ESP8266 boot-image formats
//!
//! Two container kinds exist on disk: the standard boot image the ROM knows
//! how to load (magic `0xE9`), and the locally defined combined container
//! (signature `"esp"`) that packs several flash-offset-tagged images into a
//! single file for one download session.

use bytemuck::{Pod, Zeroable};
use strum::{Display, EnumString};

pub mod combined;
pub mod image;

pub use combined::Combiner;
pub use image::{auto_extract, image_info, write_sections};

/// First byte of a standard boot image
pub const ESP_MAGIC: u8 = 0xE9;
/// Seed for the image body checksum
pub const CHECKSUM_INIT: u8 = 0xEF;
/// Signature of a combined container
pub const COMBINED_SIG: &[u8; 3] = b"esp";
/// Flash is mapped at this address; `.irom0.text` load addresses are
/// rebased against it.
pub const IROM_MAP_START: u32 = 0x4020_0000;

pub const FLASH_MODE_MASK: u16 = 0x0003;
pub const FLASH_FREQ_MASK: u16 = 0x0F00;
pub const FLASH_SIZE_MASK: u16 = 0xF000;

/// XOR-fold `data` into a running checksum
pub fn checksum(data: &[u8], mut cksum: u8) -> u8 {
    for byte in data {
        cksum ^= *byte;
    }
    cksum
}

/// Fixed 8-byte header of a standard boot image
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
#[repr(C)]
pub struct EspCommonHeader {
    pub magic: u8,
    pub segment_count: u8,
    pub flash_config: u16,
    pub entry: u32,
}

/// Per-segment header: load address and padded byte count
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
#[repr(C)]
pub struct SegmentHeader {
    pub addr: u32,
    pub length: u32,
}

/// SPI mode bits of the flash-parameter word
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[repr(u16)]
pub enum FlashMode {
    Qio = 0x0000,
    Qout = 0x0001,
    Dio = 0x0002,
    Dout = 0x0003,
}

impl FlashMode {
    pub fn from_bits(bits: u16) -> Option<Self> {
        match bits & FLASH_MODE_MASK {
            0x0000 => Some(FlashMode::Qio),
            0x0001 => Some(FlashMode::Qout),
            0x0002 => Some(FlashMode::Dio),
            0x0003 => Some(FlashMode::Dout),
            _ => None,
        }
    }
}

/// SPI frequency bits of the flash-parameter word
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, EnumString)]
#[strum(ascii_case_insensitive)]
#[repr(u16)]
pub enum FlashFreq {
    #[strum(serialize = "40M")]
    Freq40M = 0x0000,
    #[strum(serialize = "26M")]
    Freq26M = 0x0100,
    #[strum(serialize = "20M")]
    Freq20M = 0x0200,
    #[strum(serialize = "80M")]
    Freq80M = 0x0F00,
}

impl FlashFreq {
    pub fn from_bits(bits: u16) -> Option<Self> {
        match bits & FLASH_FREQ_MASK {
            0x0000 => Some(FlashFreq::Freq40M),
            0x0100 => Some(FlashFreq::Freq26M),
            0x0200 => Some(FlashFreq::Freq20M),
            0x0F00 => Some(FlashFreq::Freq80M),
            _ => None,
        }
    }
}

/// Flash chip capacity bits of the flash-parameter word
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, EnumString)]
#[strum(ascii_case_insensitive)]
#[repr(u16)]
pub enum FlashSize {
    #[strum(serialize = "512K")]
    Size512K = 0x0000,
    #[strum(serialize = "256K")]
    Size256K = 0x1000,
    #[strum(serialize = "1M")]
    Size1M = 0x2000,
    #[strum(serialize = "2M")]
    Size2M = 0x3000,
    #[strum(serialize = "4M")]
    Size4M = 0x4000,
    #[strum(serialize = "8M")]
    Size8M = 0x5000,
    #[strum(serialize = "16M")]
    Size16M = 0x6000,
    #[strum(serialize = "32M")]
    Size32M = 0x7000,
}

impl FlashSize {
    pub fn from_bits(bits: u16) -> Option<Self> {
        match bits & FLASH_SIZE_MASK {
            0x0000 => Some(FlashSize::Size512K),
            0x1000 => Some(FlashSize::Size256K),
            0x2000 => Some(FlashSize::Size1M),
            0x3000 => Some(FlashSize::Size2M),
            0x4000 => Some(FlashSize::Size4M),
            0x5000 => Some(FlashSize::Size8M),
            0x6000 => Some(FlashSize::Size16M),
            0x7000 => Some(FlashSize::Size32M),
            _ => None,
        }
    }
}

//! In-RAM helper executed by the device during bulk flash reads

/// Start of instruction RAM, where download stubs are staged
pub const IRAM_ADDR: u32 = 0x4010_0000;
/// Entry point of the flash-read stub, just past its data words
pub const FLASH_READ_STUB_ENTRY: u32 = IRAM_ADDR + 0x18;
/// ROM `SPIEraseChip` entry, jumped to for a whole-chip erase
pub const ERASE_CHIP_ADDR: u32 = 0x4000_4984;

/// Position-independent Xtensa blob that reads flash out over the serial
/// line. The first twelve bytes are the read parameters (start address,
/// block size, block count, little-endian), the next twelve the ROM entry
/// points and scratch-buffer address the code loads. Everything after is
/// code: a loop of ROM `SPIRead` into the scratch buffer followed by ROM
/// `send_packet`, once per block, then an idle spin. These absolute
/// addresses are part of the contract with the factory ROM.
const FLASH_READ_STUB: [u8; 69] = [
    // parameters, patched per invocation
    0x00, 0x00, 0x00, 0x00, // start address
    0x00, 0x00, 0x00, 0x00, // block size
    0x00, 0x00, 0x00, 0x00, // block count
    // constant data
    0x80, 0x3C, 0x00, 0x40, // &send_packet
    0x1C, 0x4B, 0x00, 0x40, // &SPIRead
    0x00, 0x80, 0xFE, 0x3F, // scratch buffer in user data RAM
    // code
    0xC1, 0xFC, 0xFF, 0xD1, 0xF9, 0xFF, 0x2D, 0x0D, 0x31, 0xFD, 0xFF, 0x41, 0xF8, 0xFF, 0x4A,
    0xDD, 0x51, 0xFA, 0xFF, 0xC0, 0x05, 0x00, 0x21, 0xF9, 0xFF, 0x31, 0xF4, 0xFF, 0x41, 0xF6,
    0xFF, 0xC0, 0x04, 0x00, 0x0B, 0xCC, 0x56, 0xEC, 0xFD, 0x06, 0xFF, 0xFF, 0x00, 0x00, 0x00,
];

/// The stub with its read parameters patched in, truncated to a four-byte
/// multiple for the RAM download.
pub fn flash_read_stub(addr: u32, block_size: u32, block_count: u32) -> Vec<u8> {
    let mut stub = FLASH_READ_STUB.to_vec();
    stub.truncate(stub.len() & !0x03);
    stub[0..4].copy_from_slice(&addr.to_le_bytes());
    stub[4..8].copy_from_slice(&block_size.to_le_bytes());
    stub[8..12].copy_from_slice(&block_count.to_le_bytes());
    stub
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_is_patched_and_word_aligned() {
        let stub = flash_read_stub(0x1000, 0x400, 7);
        assert_eq!(stub.len() % 4, 0);
        assert_eq!(&stub[0..4], &0x1000u32.to_le_bytes());
        assert_eq!(&stub[4..8], &0x400u32.to_le_bytes());
        assert_eq!(&stub[8..12], &7u32.to_le_bytes());
        // constant data untouched
        assert_eq!(&stub[12..16], &0x4000_3C80u32.to_le_bytes());
        assert_eq!(&stub[16..20], &0x4000_4B1Cu32.to_le_bytes());
        assert_eq!(&stub[20..24], &0x3FFE_8000u32.to_le_bytes());
    }
}

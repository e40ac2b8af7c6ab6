//! Emitting and describing standard boot images

use std::{fmt::Write as _, io::SeekFrom, mem::size_of};

use bytemuck::bytes_of;
use log::info;

use super::{
    checksum, Combiner, EspCommonHeader, FlashFreq, FlashMode, FlashSize, SegmentHeader,
    CHECKSUM_INIT, COMBINED_SIG, ESP_MAGIC, FLASH_FREQ_MASK, FLASH_MODE_MASK, FLASH_SIZE_MASK,
    IROM_MAP_START,
};
use crate::{byte_file::ByteFile, elf::ElfReader, error::Error};

/// Longest accepted path for a user-supplied image file
const MAX_FILENAME: usize = 1024;

/// Write one or more ELF sections to `out`.
///
/// A comma-separated `sect_names` list produces a standard boot image with
/// one segment per named section, in list order, the entry point taken from
/// the ELF header, padded to a 16-byte boundary with the checksum in the
/// final byte. A single name produces a raw binary holding just the section
/// content.
pub fn write_sections(
    elf: &ElfReader<'_>,
    out: &mut ByteFile,
    sect_names: &str,
    flash_parm: u16,
) -> Result<(), Error> {
    let lookup = |name: &str| {
        elf.section_by_name(name).ok_or_else(|| {
            Error::Param(format!(
                "Can't find section \"{}\" in the ELF file \"{}\"",
                name,
                elf.path()
            ))
        })
    };

    if !sect_names.contains(',') {
        let section = lookup(sect_names)?;
        let mut cksum = 0;
        elf.write_section(&section, out, &mut cksum, 0)?;
        return Ok(());
    }

    let names: Vec<&str> = sect_names.split(',').collect();
    let header = EspCommonHeader {
        magic: ESP_MAGIC,
        segment_count: names.len() as u8,
        flash_config: flash_parm,
        entry: elf.entry(),
    };
    out.write_all(bytes_of(&header))?;

    let mut image_size = size_of::<EspCommonHeader>() as u32;
    let mut cksum = CHECKSUM_INIT;
    for name in names {
        let section = lookup(name)?;
        let padded_size = (section.size + 3) & !3;

        let segment = SegmentHeader {
            addr: section.addr,
            length: padded_size,
        };
        out.write_all(bytes_of(&segment))?;
        image_size += size_of::<SegmentHeader>() as u32;

        elf.write_section(&section, out, &mut cksum, padded_size)?;
        image_size += padded_size;
    }

    // pad to the next 16-byte boundary, checksum in the last byte; there is
    // always at least one pad byte
    let pad = ((image_size + 16) & !15) - image_size;
    let mut tail = vec![0u8; pad as usize];
    *tail.last_mut().unwrap() = cksum;
    out.write_all(&tail)?;

    Ok(())
}

/// Extract the two canonical images from an ELF: a boot image built from
/// `.text`, `.data`, and `.rodata` named `<base>_0x00000.bin`, and a raw
/// blob of `.irom0.text` named by its flash offset.
///
/// With `combine` set the images are staged in memory and added to the
/// container instead of written to disk; `extra` optionally interleaves a
/// user-supplied image file at a caller-chosen flash address, before the
/// irom blob iff its address is strictly below the irom flash offset.
///
/// Returns the names of the images produced.
pub fn auto_extract(
    elf: &ElfReader<'_>,
    mut combine: Option<(&mut Combiner, &mut ByteFile)>,
    flash_parm: u16,
    extra: Option<(&str, u32)>,
) -> Result<Vec<String>, Error> {
    if let Some((name, _)) = extra {
        if name.is_empty() {
            return Err(Error::Param("empty image filename".to_string()));
        }
        if name.len() >= MAX_FILENAME {
            return Err(Error::FilenameLength(name.to_string()));
        }
    }

    let base = match elf.path().rfind('.') {
        Some(idx) => &elf.path()[..idx],
        None => elf.path(),
    };

    let open_stage = |name: &str, in_memory: bool| -> Result<ByteFile, Error> {
        if in_memory {
            Ok(ByteFile::in_memory(name))
        } else {
            ByteFile::create(name)
        }
    };
    let staging = combine.is_some();

    // boot image from the RAM-resident sections
    let boot_name = format!("{base}_0x00000.bin");
    let mut boot_image = open_stage(&boot_name, staging)?;
    write_sections(elf, &mut boot_image, ".text,.data,.rodata", flash_parm)?;
    info!("Created image file \"{boot_name}\"");

    // raw blob of the flash-mapped code
    let irom = elf.section_by_name(".irom0.text").ok_or_else(|| {
        Error::Param(format!(
            "Can't find section \".irom0.text\" in the ELF file \"{}\"",
            elf.path()
        ))
    })?;
    if irom.addr <= IROM_MAP_START {
        return Err(Error::Param(format!(
            "Invalid start address for section .irom0.text - {:#010x}",
            irom.addr
        )));
    }
    let irom_offset = irom.addr - IROM_MAP_START;

    let irom_name = format!("{base}_0x{irom_offset:05x}.bin");
    let mut irom_image = open_stage(&irom_name, staging)?;
    let mut cksum = 0;
    elf.write_section(&irom, &mut irom_image, &mut cksum, 0)?;
    info!("Created image file \"{irom_name}\"");

    let mut produced = vec![boot_name.clone(), irom_name.clone()];

    if let Some((combiner, container)) = combine.take() {
        // assemble in flash-address order; an extra image at exactly the
        // irom offset lands after it
        let mut entries: Vec<(u32, &str, Option<&mut ByteFile>)> = Vec::new();
        entries.push((0, &boot_name, Some(&mut boot_image)));
        match extra {
            Some((name, addr)) if addr < irom_offset => {
                entries.push((addr, name, None));
                entries.push((irom_offset, &irom_name, Some(&mut irom_image)));
            }
            Some((name, addr)) => {
                entries.push((irom_offset, &irom_name, Some(&mut irom_image)));
                entries.push((addr, name, None));
            }
            None => entries.push((irom_offset, &irom_name, Some(&mut irom_image))),
        }

        for (addr, name, staged) in entries {
            match staged {
                Some(vf) => {
                    combiner.add_image(container, vf, addr)?;
                }
                None => {
                    let mut vf = ByteFile::open(name)?;
                    combiner.add_image(container, &mut vf, addr)?;
                }
            }
        }
        if let Some((name, _)) = extra {
            produced.push(name.to_string());
        }
    }

    Ok(produced)
}

/// Describe an image file: either container kind, detected from the leading
/// bytes. Includes decoded flash parameters and checksum verification.
pub fn image_info(vf: &mut ByteFile) -> Result<String, Error> {
    let file_size = vf.len()? as u32;
    vf.seek(SeekFrom::Start(0))?;
    let mut head = [0u8; 4];
    vf.read_exact(&mut head)?;

    let mut out = String::new();
    if head[0] == ESP_MAGIC {
        let _ = writeln!(out, "{}:", vf.name());
        std_image_info(vf, 0, file_size, "", &mut out)?;
        return Ok(out);
    }
    if &head[..3] != COMBINED_SIG {
        return Err(Error::UnknownImageFormat(vf.name().to_string()));
    }

    let image_count = head[3] as u16;
    let _ = writeln!(out, "{}:", vf.name());
    let _ = writeln!(out, "Combined image file containing {image_count} images:");
    for i in 0..image_count {
        let mut desc = [0u8; 8];
        vf.read_exact(&mut desc)?;
        let addr = u32::from_le_bytes(desc[0..4].try_into().unwrap());
        let len = u32::from_le_bytes(desc[4..8].try_into().unwrap());
        let pos = vf.position()? as u32;

        let _ = writeln!(
            out,
            "  Image {i:2}: Flash address {addr:#08x}, size {len:#08x}"
        );

        vf.read_exact(&mut head)?;
        if head[0] == ESP_MAGIC {
            std_image_info(vf, pos, len, "    ", &mut out)?;
        }
        vf.seek(SeekFrom::Start((pos + len) as u64))?;
    }
    Ok(out)
}

/// Describe the standard boot image at `ofst` within `vf`
fn std_image_info(
    vf: &mut ByteFile,
    ofst: u32,
    size: u32,
    prefix: &str,
    out: &mut String,
) -> Result<(), Error> {
    if size == 0 {
        return Err(Error::Param("zero-length image".to_string()));
    }
    vf.seek(SeekFrom::Start(ofst as u64))?;

    let mut header = [0u8; 8];
    vf.read_exact(&mut header)?;
    if header[0] != ESP_MAGIC {
        return Err(Error::InvalidImage(vf.name().to_string()));
    }

    let flash_parm = u16::from_le_bytes(header[2..4].try_into().unwrap());
    let size_str = match FlashSize::from_bits(flash_parm & FLASH_SIZE_MASK) {
        Some(size) => format!("{size}B"),
        None => "<unknown>".to_string(),
    };
    let mode_str = match FlashMode::from_bits(flash_parm & FLASH_MODE_MASK) {
        Some(mode) => mode.to_string(),
        None => "<unknown>".to_string(),
    };
    let freq_str = match FlashFreq::from_bits(flash_parm & FLASH_FREQ_MASK) {
        Some(freq) => format!("{freq}Hz"),
        None => "<unknown>".to_string(),
    };
    let _ = writeln!(
        out,
        "{prefix}Flash parameters: size={size_str}, mode={mode_str}, freq={freq_str}"
    );

    // walk the segments, folding their bytes into the checksum
    let mut cksum = CHECKSUM_INIT;
    let segment_count = header[1] as u16;
    for i in 0..segment_count {
        let mut desc = [0u8; 8];
        vf.read_exact(&mut desc)?;
        let addr = u32::from_le_bytes(desc[0..4].try_into().unwrap());
        let len = u32::from_le_bytes(desc[4..8].try_into().unwrap());

        let _ = writeln!(
            out,
            "{prefix}segment {i:2}: address {addr:#010x}, size {len:#08x}"
        );

        let mut remaining = len as usize;
        let mut chunk = [0u8; 1024];
        while remaining > 0 {
            let part = remaining.min(chunk.len());
            vf.read_exact(&mut chunk[..part])?;
            cksum = checksum(&chunk[..part], cksum);
            remaining -= part;
        }
    }

    // the padding runs to the next 16-byte boundary with the checksum byte
    // last; at least one byte is always present
    let mut pos = vf.position()? as u32 - ofst;
    let pad = ((pos + 16) & !15) - pos;
    let mut tail = vec![0u8; pad as usize];
    vf.read_exact(&mut tail)?;
    cksum = checksum(&tail, cksum);
    pos += pad;
    let _ = writeln!(
        out,
        "{prefix}The checksum is {}correct: {:#04x}",
        if cksum == 0 { "" } else { "in" },
        tail.last().copied().unwrap_or(0)
    );

    if pos < size {
        let _ = writeln!(out, "\n{prefix}Additional Flash data:");
        let _ = writeln!(
            out,
            "{prefix}              address {pos:#08x}, size {:#08x}",
            size - pos
        );
    }
    Ok(())
}

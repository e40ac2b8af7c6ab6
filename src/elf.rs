//! ELF (Executable and Linkable Format) file operations

use std::fmt::Write as _;

use xmas_elf::{
    header::{Class, Data},
    sections::SectionData,
    ElfFile,
};

use crate::{byte_file::ByteFile, error::Error};

/// A section of interest from the source ELF
#[derive(Debug, Clone, Copy)]
pub struct ElfSection<'a> {
    pub name: &'a str,
    pub addr: u32,
    pub size: u32,
    data: &'a [u8],
}

impl<'a> ElfSection<'a> {
    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

/// Read-only view of a little-endian ELF32 object
pub struct ElfReader<'a> {
    elf: ElfFile<'a>,
    path: String,
}

impl<'a> ElfReader<'a> {
    /// Parse `data`, validating the magic, class, and byte order. `path` is
    /// carried for error messages.
    pub fn parse(path: &str, data: &'a [u8]) -> Result<Self, Error> {
        let elf = ElfFile::new(data).map_err(|e| Error::InvalidElf(e.to_string()))?;

        if elf.header.pt1.class() != Class::ThirtyTwo {
            return Err(Error::InvalidElf(format!(
                "\"{path}\" is not a 32-bit object"
            )));
        }
        if elf.header.pt1.data() != Data::LittleEndian {
            return Err(Error::InvalidElf(format!(
                "\"{path}\" is not little-endian"
            )));
        }

        Ok(ElfReader {
            elf,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Image entry point
    pub fn entry(&self) -> u32 {
        self.elf.header.pt2.entry_point() as u32
    }

    /// Look up a section by exact name
    pub fn section_by_name(&self, name: &str) -> Option<ElfSection<'a>> {
        self.sections().find(|section| section.name == name)
    }

    /// All named sections, in header-table order
    pub fn sections(&self) -> impl Iterator<Item = ElfSection<'a>> + '_ {
        self.elf.section_iter().filter_map(move |header| {
            let name = header.get_name(&self.elf).ok().filter(|n| !n.is_empty())?;
            let data = match header.get_data(&self.elf) {
                Ok(SectionData::Undefined(data)) => data,
                _ => &[],
            };
            Some(ElfSection {
                name,
                addr: header.address() as u32,
                size: header.size() as u32,
                data,
            })
        })
    }

    /// Stream a section's bytes into `out`, folding each byte into the
    /// running XOR `cksum` and zero-padding up to `padded_size`. Returns the
    /// number of bytes written.
    pub fn write_section(
        &self,
        section: &ElfSection<'_>,
        out: &mut ByteFile,
        cksum: &mut u8,
        padded_size: u32,
    ) -> Result<u32, Error> {
        let data = section.data;
        if data.is_empty() && padded_size == 0 {
            return Ok(0);
        }

        out.reserve(data.len().max(padded_size as usize))?;
        out.write_all(data)?;
        for &b in data {
            *cksum ^= b;
        }

        let written = data.len() as u32;
        if written < padded_size {
            out.fill(0, (padded_size - written) as usize)?;
            return Ok(padded_size);
        }
        Ok(written)
    }

    /// Human-readable table of section addresses, sizes, and names
    pub fn section_info(&self) -> String {
        let mut out = String::from("Address     Size        Name\n");
        for section in self.sections() {
            let _ = writeln!(
                out,
                "{:#010x}  {:#010x}  {}",
                section.addr, section.size, section.name
            );
        }
        out
    }
}

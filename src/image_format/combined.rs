//! The combined-image container
//!
//! Sparse mode packs images behind per-entry `{addr, padded_size}` headers;
//! the result is a packaging container, not directly flashable. Padded mode
//! emits a literal flash snapshot, filling the gaps between images with
//! `0xFF` (erased flash).

use std::io::SeekFrom;

use log::info;

use super::COMBINED_SIG;
use crate::{byte_file::ByteFile, error::Error};

/// Builds a combined container across successive [`add_image`] calls,
/// tracking the running image size so entries stay ordered and gap-free.
///
/// [`add_image`]: Combiner::add_image
pub struct Combiner {
    padded: bool,
    image_size: u32,
}

impl Combiner {
    pub fn new(padded: bool) -> Self {
        Combiner {
            padded,
            image_size: 0,
        }
    }

    pub fn is_padded(&self) -> bool {
        self.padded
    }

    /// Append `image` to the container at flash address `addr`. Returns the
    /// number of image bytes added (after alignment padding).
    pub fn add_image(
        &mut self,
        out: &mut ByteFile,
        image: &mut ByteFile,
        addr: u32,
    ) -> Result<u32, Error> {
        let out_size = out.len()? as u32;
        if out_size == 0 {
            self.image_size = 0;
        }

        let in_size = image.len()? as u32;
        if in_size == 0 {
            return Err(Error::ImageSize(image.name().to_string()));
        }
        image.seek(SeekFrom::Start(0))?;

        if addr < self.image_size {
            return Err(Error::Param(format!(
                "The address specified for the image file \"{}\" is less than the current image size",
                image.name()
            )));
        }

        if self.padded {
            // pad up to the image's flash address with erased-flash fill
            out.seek(SeekFrom::End(0))?;
            if self.image_size < addr {
                out.fill(0xFF, (addr - self.image_size) as usize)?;
                self.image_size = addr;
            }
        } else {
            let mut head = [0u8; 4];
            let pos;
            if out_size == 0 {
                head[..3].copy_from_slice(COMBINED_SIG);
                head[3] = 1;
                pos = head.len() as u32;
            } else if out_size & 0x03 != 0 {
                return Err(Error::Param(format!(
                    "The combined file \"{}\" is not a multiple of 4 bytes in size",
                    out.name()
                )));
            } else {
                // bump the image count in the existing header
                out.seek(SeekFrom::Start(0))?;
                if out.peek(&mut head)? != head.len() || &head[..3] != COMBINED_SIG {
                    return Err(Error::Param(format!(
                        "The combined file \"{}\" does not have the correct header",
                        out.name()
                    )));
                }
                head[3] = head[3].wrapping_add(1);
                pos = out_size;
            }
            out.write_all(&head)?;
            out.seek(SeekFrom::Start(pos as u64))?;

            let padded_size = (in_size + 3) & !3;
            let mut entry = [0u8; 8];
            entry[0..4].copy_from_slice(&addr.to_le_bytes());
            entry[4..8].copy_from_slice(&padded_size.to_le_bytes());
            out.write_all(&entry)?;
        }

        // copy the image body
        let mut added = 0u32;
        out.reserve(in_size as usize)?;
        let mut chunk = [0u8; 1024];
        while added < in_size {
            let part = ((in_size - added) as usize).min(chunk.len());
            image.read_exact(&mut chunk[..part])?;
            out.write_all(&chunk[..part])?;
            added += part as u32;
        }

        if self.padded {
            self.image_size += added;
        } else {
            // align the entry to a multiple of four bytes
            let tail = added & 0x03;
            if tail != 0 {
                out.fill(0, (4 - tail) as usize)?;
                added += 4 - tail;
            }
            self.image_size = addr + added;
        }

        info!(
            "Added \"{}\" at {:#010x}, {} bytes",
            image.name(),
            addr,
            added
        );
        Ok(added)
    }
}

//! Uniform byte stream over a heap buffer or an OS file
//!
//! Image emission and the flash workflows all operate on [`ByteFile`], so a
//! staged image can live purely in memory until it is combined or flashed,
//! while user-supplied files stream from disk through the same interface.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use crate::error::Error;

/// Minimum number of extra bytes reserved when a memory-backed file grows
pub const DEFAULT_INCREMENT: usize = 100;

enum Backend {
    Memory { buf: Vec<u8>, pos: usize },
    Os(File),
}

pub struct ByteFile {
    backend: Backend,
    name: String,
    increment: usize,
}

impl ByteFile {
    /// A memory-backed file; `name` is only used in error messages.
    pub fn in_memory(name: &str) -> Self {
        ByteFile {
            backend: Backend::Memory {
                buf: Vec::new(),
                pos: 0,
            },
            name: name.to_string(),
            increment: DEFAULT_INCREMENT,
        }
    }

    /// Open an existing OS file for reading
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let name = path.as_ref().display().to_string();
        let file = File::open(&path).map_err(|source| Error::FileOpen {
            path: name.clone(),
            source,
        })?;
        Ok(Self::from_file(file, name))
    }

    /// Create (truncating) an OS file for writing
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let name = path.as_ref().display().to_string();
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| Error::FileCreate {
                path: name.clone(),
                source,
            })?;
        Ok(Self::from_file(file, name))
    }

    /// Open an existing OS file for reading and writing without truncation,
    /// for appending to a combined container.
    pub fn open_rw<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let name = path.as_ref().display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| Error::FileOpen {
                path: name.clone(),
                source,
            })?;
        Ok(Self::from_file(file, name))
    }

    fn from_file(file: File, name: String) -> Self {
        ByteFile {
            backend: Backend::Os(file),
            name,
            increment: DEFAULT_INCREMENT,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_increment(&mut self, increment: usize) {
        self.increment = increment;
    }

    /// Read up to `buf.len()` bytes; a short count means end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        match &mut self.backend {
            Backend::Memory { buf: data, pos } => {
                let avail = data.len().saturating_sub(*pos);
                let n = avail.min(buf.len());
                buf[..n].copy_from_slice(&data[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
            Backend::Os(file) => {
                let mut total = 0;
                while total < buf.len() {
                    match file.read(&mut buf[total..]) {
                        Ok(0) => break,
                        Ok(n) => total += n,
                        Err(source) => {
                            return Err(Error::FileRead {
                                path: self.name.clone(),
                                source,
                            })
                        }
                    }
                }
                Ok(total)
            }
        }
    }

    /// Read exactly `buf.len()` bytes or fail with a read error naming the
    /// file.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let n = self.read(buf)?;
        if n != buf.len() {
            return Err(Error::FileRead {
                path: self.name.clone(),
                source: std::io::ErrorKind::UnexpectedEof.into(),
            });
        }
        Ok(())
    }

    /// Like `read`, but restores the prior position afterwards
    pub fn peek(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let pos = self.position()?;
        let n = self.read(buf)?;
        self.seek(SeekFrom::Start(pos))?;
        Ok(n)
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        match &mut self.backend {
            Backend::Memory { buf, pos } => {
                reserve(buf, *pos, data.len(), self.increment)?;
                if *pos + data.len() > buf.len() {
                    buf.resize(*pos + data.len(), 0);
                }
                buf[*pos..*pos + data.len()].copy_from_slice(data);
                *pos += data.len();
                Ok(())
            }
            Backend::Os(file) => file.write_all(data).map_err(|source| Error::FileWrite {
                path: self.name.clone(),
                source,
            }),
        }
    }

    /// Append `count` copies of `byte` at the current position
    pub fn fill(&mut self, byte: u8, count: usize) -> Result<(), Error> {
        match &mut self.backend {
            Backend::Memory { buf, pos } => {
                reserve(buf, *pos, count, self.increment)?;
                if *pos + count > buf.len() {
                    buf.resize(*pos + count, 0);
                }
                buf[*pos..*pos + count].fill(byte);
                *pos += count;
                Ok(())
            }
            Backend::Os(file) => {
                // bounded scratch, repeated for large fills
                let chunk = [byte; 512];
                let mut remaining = count;
                while remaining > 0 {
                    let part = remaining.min(chunk.len());
                    file.write_all(&chunk[..part])
                        .map_err(|source| Error::FileWrite {
                            path: self.name.clone(),
                            source,
                        })?;
                    remaining -= part;
                }
                Ok(())
            }
        }
    }

    /// Reposition the stream. Memory files reject positions past the end.
    pub fn seek(&mut self, seek: SeekFrom) -> Result<u64, Error> {
        match &mut self.backend {
            Backend::Memory { buf, pos } => {
                let target = match seek {
                    SeekFrom::Start(n) => n as i64,
                    SeekFrom::Current(n) => *pos as i64 + n,
                    SeekFrom::End(n) => buf.len() as i64 + n,
                };
                if target < 0 || target as usize > buf.len() {
                    return Err(Error::FileSeek {
                        path: self.name.clone(),
                    });
                }
                *pos = target as usize;
                Ok(*pos as u64)
            }
            Backend::Os(file) => file.seek(seek).map_err(|_| Error::FileSeek {
                path: self.name.clone(),
            }),
        }
    }

    pub fn position(&mut self) -> Result<u64, Error> {
        match &mut self.backend {
            Backend::Memory { pos, .. } => Ok(*pos as u64),
            Backend::Os(file) => file.stream_position().map_err(|_| Error::FileSeek {
                path: self.name.clone(),
            }),
        }
    }

    /// Current logical length of the stream
    pub fn len(&mut self) -> Result<u64, Error> {
        match &mut self.backend {
            Backend::Memory { buf, .. } => Ok(buf.len() as u64),
            Backend::Os(file) => {
                let meta = file.metadata().map_err(|source| Error::FileSize {
                    path: self.name.clone(),
                    source,
                })?;
                Ok(meta.len())
            }
        }
    }

    pub fn is_empty(&mut self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    /// Pre-allocate space for an upcoming write; memory mode only.
    pub fn reserve(&mut self, space: usize) -> Result<(), Error> {
        if let Backend::Memory { buf, pos } = &mut self.backend {
            reserve(buf, *pos, space, self.increment)?;
        }
        Ok(())
    }

    /// The memory buffer, for handing a staged image onwards. Returns the
    /// empty slice for OS-backed files.
    pub fn bytes(&self) -> &[u8] {
        match &self.backend {
            Backend::Memory { buf, .. } => buf,
            Backend::Os(_) => &[],
        }
    }
}

fn reserve(buf: &mut Vec<u8>, pos: usize, space: usize, increment: usize) -> Result<(), Error> {
    let needed = pos + space;
    if needed <= buf.capacity() {
        return Ok(());
    }
    let extra = space.max(increment);
    buf.try_reserve(pos + extra - buf.len())
        .map_err(|_| Error::Alloc(pos + extra))
}

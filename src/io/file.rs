//! File-backed implementation of the [`Io`] contract.
//!
//! ## File layout
//!
//! ```text
//! +--------------------------------------+
//! | Base header (64 bytes)               |
//! |   magic     [0..8)                   |
//! |   version   [8..12)                  |
//! |   generation[12..20)                 |
//! |   fanout_len[20..28)                 |
//! |   checksum  [28..36)  CRC-64 of 0..28|
//! +--------------------------------------+
//! | Fan-out region (fanout_len bytes)    |
//! +--------------------------------------+
//! | Payload (append-only)                |
//! +--------------------------------------+
//! ```
//!
//! The base header is rewritten in place on `clear`; the fan-out region is
//! reserved at creation time and filled once by `write_fanout`. Appends are
//! buffered in memory and land on disk on `sync` or when the buffer
//! overflows its threshold, so `read_at` only observes synced bytes.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::Crc;

use super::Io;
use crate::corruption;
use crate::error::{Error, Result};
use crate::types::CRC_64_ECMA;

pub const HEADER_BASE_SIZE: u64 = 64;

const MAGIC: &[u8; 8] = b"TEPHRA\x00F";
const VERSION: u32 = 1;
const FLUSH_THRESHOLD: usize = 64 * 1024;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA);

#[derive(Debug, Clone, Copy, PartialEq)]
struct Header {
    generation: u64,
    fanout_len: u64,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_BASE_SIZE as usize] {
        let mut buf = [0u8; HEADER_BASE_SIZE as usize];
        buf[0..8].copy_from_slice(MAGIC);
        (&mut buf[8..12])
            .write_u32::<BigEndian>(VERSION)
            .expect("writing to a fixed buffer cannot fail");
        (&mut buf[12..20])
            .write_u64::<BigEndian>(self.generation)
            .expect("writing to a fixed buffer cannot fail");
        (&mut buf[20..28])
            .write_u64::<BigEndian>(self.fanout_len)
            .expect("writing to a fixed buffer cannot fail");
        let checksum = CRC64.checksum(&buf[0..28]);
        (&mut buf[28..36])
            .write_u64::<BigEndian>(checksum)
            .expect("writing to a fixed buffer cannot fail");
        buf
    }

    fn decode(buf: &[u8; HEADER_BASE_SIZE as usize], path: &Path) -> Result<Self> {
        if &buf[0..8] != MAGIC {
            return Err(corruption!("bad magic in {}", path.display()));
        }
        let version = (&buf[8..12]).read_u32::<BigEndian>()?;
        if version != VERSION {
            return Err(corruption!(
                "unsupported format version {version} in {}",
                path.display()
            ));
        }
        let generation = (&buf[12..20]).read_u64::<BigEndian>()?;
        let fanout_len = (&buf[20..28]).read_u64::<BigEndian>()?;
        let stored = (&buf[28..36]).read_u64::<BigEndian>()?;
        if stored != CRC64.checksum(&buf[0..28]) {
            return Err(corruption!("header checksum mismatch in {}", path.display()));
        }
        Ok(Self {
            generation,
            fanout_len,
        })
    }
}

/// Append-only file with buffered writes and positioned reads.
#[derive(Debug)]
pub struct FileIo {
    file: File,
    path: PathBuf,
    readonly: bool,
    header: Header,
    /// Logical payload length, including bytes still in `buf`.
    offset: u64,
    /// Payload bytes actually on disk.
    flushed: u64,
    buf: Vec<u8>,
}

#[cfg(unix)]
fn pread(file: &File, pos: u64, buf: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, pos)
}

#[cfg(unix)]
fn pwrite(file: &File, pos: u64, buf: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, pos)
}

#[cfg(windows)]
fn pread(file: &File, mut pos: u64, mut buf: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, pos) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to fill whole buffer",
                ))
            }
            Ok(n) => {
                buf = &mut buf[n..];
                pos += n as u64;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
fn pwrite(file: &File, mut pos: u64, mut buf: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, pos) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ))
            }
            Ok(n) => {
                buf = &buf[n..];
                pos += n as u64;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

impl FileIo {
    fn header_size(&self) -> u64 {
        HEADER_BASE_SIZE + self.header.fanout_len
    }

    fn flush_buf(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        pwrite(&self.file, self.header_size() + self.flushed, &self.buf)?;
        self.flushed += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }
}

impl Io for FileIo {
    fn create(path: &Path, generation: u64, fanout_size: u64) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let header = Header {
            generation,
            fanout_len: fanout_size,
        };
        pwrite(&file, 0, &header.encode())?;
        if fanout_size > 0 {
            pwrite(&file, HEADER_BASE_SIZE, &vec![0u8; fanout_size as usize])?;
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            readonly: false,
            header,
            offset: 0,
            flushed: 0,
            buf: Vec::new(),
        })
    }

    fn open(path: &Path, readonly: bool) -> Result<Self> {
        let file = File::options().read(true).write(!readonly).open(path)?;

        let mut base = [0u8; HEADER_BASE_SIZE as usize];
        pread(&file, 0, &mut base).map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                corruption!("truncated header in {}", path.display())
            } else {
                Error::Io(err)
            }
        })?;
        let header = Header::decode(&base, path)?;

        let len = file.metadata()?.len();
        let header_size = HEADER_BASE_SIZE + header.fanout_len;
        if len < header_size {
            return Err(corruption!(
                "{} is {len} bytes, shorter than its {header_size}-byte header",
                path.display()
            ));
        }
        let offset = len - header_size;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            readonly,
            header,
            offset,
            flushed: offset,
            buf: Vec::new(),
        })
    }

    fn exists(path: &Path) -> bool {
        path.exists()
    }

    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnly);
        }
        self.buf.extend_from_slice(bytes);
        self.offset += bytes.len() as u64;
        if self.buf.len() >= FLUSH_THRESHOLD {
            self.flush_buf()?;
        }
        Ok(())
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        pread(&self.file, self.header_size() + offset, buf)?;
        Ok(())
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn force_offset(&mut self) -> Result<u64> {
        let len = self.file.metadata()?.len();
        self.offset = len.saturating_sub(self.header_size());
        self.flushed = self.offset;
        Ok(self.offset)
    }

    fn generation(&self) -> u64 {
        self.header.generation
    }

    fn read_generation(&mut self) -> Result<u64> {
        let mut base = [0u8; HEADER_BASE_SIZE as usize];
        pread(&self.file, 0, &mut base)?;
        self.header = Header::decode(&base, &self.path)?;
        Ok(self.header.generation)
    }

    fn write_fanout(&mut self, blob: &[u8]) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnly);
        }
        if blob.len() as u64 != self.header.fanout_len {
            return Err(Error::InvariantViolation(format!(
                "fan-out blob is {} bytes but {} were reserved in {}",
                blob.len(),
                self.header.fanout_len,
                self.path.display()
            )));
        }
        pwrite(&self.file, HEADER_BASE_SIZE, blob)?;
        Ok(())
    }

    fn read_fanout(&self) -> Result<Vec<u8>> {
        let mut blob = vec![0u8; self.header.fanout_len as usize];
        pread(&self.file, HEADER_BASE_SIZE, &mut blob)?;
        Ok(blob)
    }

    fn clear(&mut self, generation: u64) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnly);
        }
        self.buf.clear();
        self.offset = 0;
        self.flushed = 0;
        self.header = Header {
            generation,
            fanout_len: 0,
        };
        // Header first: observers must see the generation change before the
        // payload disappears.
        pwrite(&self.file, 0, &self.header.encode())?;
        self.file.set_len(HEADER_BASE_SIZE)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.flush_buf()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn rename(from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to)?;
        Ok(())
    }

    fn remove(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

//! Byte-stream capability: the sole abstraction every higher layer uses to
//! touch the filesystem.
//!
//! Mirrors the role of `raw.rs`'s `RAW` wrapper in the teacher crate, but as
//! a trait rather than a single concrete struct, so an [`crate::extent`]
//! extent can hold whichever stream implementation opened it without the
//! rest of the crate ever calling into `std::fs` directly.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use log::debug;

/// Open/seek/read/size on a named file. `read_at` is position-independent
/// from the caller's point of view but, per `spec.md` §4.A, is free to move
/// the underlying cursor; it is not safe to call concurrently on the same
/// handle from two logical readers.
pub trait ByteStream: Send {
    /// Reads into `buf` starting at `offset`. Returns the number of bytes
    /// read; less than `buf.len()` only at EOF.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Total size of the underlying stream, in bytes.
    fn size(&mut self) -> io::Result<u64>;
}

/// The default, file-backed implementation.
pub struct FileStream {
    file: File,
}

impl FileStream {
    pub fn open(path: &Path) -> io::Result<Self> {
        debug!("Opening byte-stream: {}", path.display());
        Ok(Self {
            file: File::open(path)?,
        })
    }
}

impl ByteStream for FileStream {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read(buf)
    }

    fn size(&mut self) -> io::Result<u64> {
        let current = self.file.stream_position()?;
        let end = self.file.seek(SeekFrom::End(0))?;
        self.file.seek(SeekFrom::Start(current))?;
        Ok(end)
    }
}

/// Reads exactly `buf.len()` bytes at `offset`, short of EOF.
///
/// Most callers in this crate want exact reads (headers, directories,
/// grain tables); only the outermost [`crate::image::ImageHandle::read`]
/// tolerates short reads, at EOF.
pub fn read_exact_at(stream: &mut dyn ByteStream, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    let mut total = 0;
    while total < buf.len() {
        let n = stream.read_at(offset + total as u64, &mut buf[total..])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected end of stream",
            ));
        }
        total += n;
    }
    Ok(())
}

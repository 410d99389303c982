//! Positioned writes, zero fill and checksumming of the dump file

use {
    crate::errors::OutputError,
    std::{
        fs::{File, OpenOptions},
        io::{ErrorKind, Read, Seek, SeekFrom, Write},
        path::{Path, PathBuf},
    },
};

type Result<T> = std::result::Result<T, OutputError>;

/// Size of the scratch buffer used for zero fill and read back
pub const CHUNK_SIZE: usize = 64 * 1024;

/// A seekable, growable output with positioned writes
///
/// Memory use is bounded by [`CHUNK_SIZE`] regardless of how much zero fill is
/// requested, as PE sections can have virtual sizes far larger than their
/// on-disk sizes.
#[derive(Debug)]
pub struct OutputStream<W> {
    inner: W,
    position: u64,
}

impl<W> OutputStream<W>
where
    W: Read + Write + Seek,
{
    pub fn new(mut inner: W) -> Result<Self> {
        let position = inner.stream_position()?;
        Ok(Self { inner, position })
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn seek_absolute(&mut self, pos: u64) -> Result<()> {
        self.position = self.inner.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    /// Writes all of `bytes` at the current position. A write that stops
    /// short is an error and is not retried.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < bytes.len() {
            match self.inner.write(&bytes[written..]) {
                Ok(0) => {
                    self.position += written as u64;
                    return Err(OutputError::ShortWrite {
                        offset: self.position - written as u64,
                        written,
                        requested: bytes.len(),
                    });
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.position += written as u64;
        Ok(())
    }

    pub fn write_at(&mut self, pos: u64, bytes: &[u8]) -> Result<()> {
        self.seek_absolute(pos)?;
        self.write(bytes)
    }

    /// Writes `count` zero bytes at the current position
    pub fn zero_fill(&mut self, mut count: u64) -> Result<()> {
        let zeros = vec![0u8; CHUNK_SIZE.min(count as usize)];
        while count > 0 {
            let chunk = (count as usize).min(zeros.len());
            self.write(&zeros[..chunk])?;
            count -= chunk as u64;
        }
        Ok(())
    }

    /// Zero fills from the end of the stream up to `len`, if it is shorter
    pub fn pad_to(&mut self, len: u64) -> Result<()> {
        let end = self.inner.seek(SeekFrom::End(0))?;
        self.position = end;
        if end < len {
            self.zero_fill(len - end)?;
        }
        Ok(())
    }

    /// Fills `buf` with the bytes at `pos`
    pub fn read_back(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        self.seek_absolute(pos)?;
        let mut read = 0;
        while read < buf.len() {
            match self.inner.read(&mut buf[read..]) {
                Ok(0) => {
                    return Err(OutputError::ShortRead {
                        offset: pos,
                        read,
                        requested: buf.len(),
                    });
                }
                Ok(n) => read += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.position += read as u64;
        Ok(())
    }

    /// Additive checksum of the whole stream: the wrapping sum of every
    /// little-endian 4-byte word, reading from offset 0. Trailing bytes that
    /// don't form a whole word are ignored.
    pub fn checksum(&mut self) -> Result<u32> {
        self.seek_absolute(0)?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut sum = 0u32;
        // Bytes carried over from the previous chunk when a read ended
        // mid-word
        let mut carry = 0;
        loop {
            let n = match self.inner.read(&mut buf[carry..]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.position += n as u64;
            let filled = carry + n;
            let whole = filled - filled % 4;
            sum = buf[..whole].chunks_exact(4).fold(sum, |sum, word| {
                sum.wrapping_add(u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
            });
            buf.copy_within(whole..filled, 0);
            carry = filled - whole;
        }
        Ok(sum)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// The dump file on disk
///
/// Until [`DumpFile::persist`] is called the file is considered unfinished,
/// and dropping it removes it from disk. The handle is closed when this value
/// is dropped.
#[derive(Debug)]
pub struct DumpFile {
    path: PathBuf,
    stream: OutputStream<File>,
    persisted: bool,
}

impl DumpFile {
    /// Creates (or truncates) the file at `path`
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            path,
            stream: OutputStream::new(file)?,
            persisted: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stream(&mut self) -> &mut OutputStream<File> {
        &mut self.stream
    }

    /// Flushes the file and keeps it on disk
    pub fn persist(mut self) -> Result<()> {
        self.stream.flush()?;
        self.persisted = true;
        Ok(())
    }

    /// Removes the file
    pub fn delete(mut self) -> Result<()> {
        self.persisted = true;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

impl Drop for DumpFile {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!(
                "failed to remove unfinished dump {}: {e}",
                self.path.display()
            );
        }
    }
}

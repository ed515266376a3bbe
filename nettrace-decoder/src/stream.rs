use std::io::Read;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use nettrace_format::{FormatError, Guid};

use crate::instrument::{DecodeHooks, NoopHooks};
use crate::Result;

const READ_CHUNK: usize = 64 * 1024;

/// Opaque absolute stream offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamLabel(u64);

impl StreamLabel {
    pub fn add(self, bytes: u64) -> StreamLabel {
        StreamLabel(self.0 + bytes)
    }

    pub fn offset_from(self, earlier: StreamLabel) -> u64 {
        self.0 - earlier.0
    }
}

/// Forward-biased buffered reader over a byte source.
///
/// The source may be a file or a socket; the reader never relies on
/// seekability. Repositioning backwards is only possible within the
/// currently buffered window, which is all the decoder ever needs (the
/// magic probe peeks, block skips go forward).
pub struct StreamReader<R> {
    source: R,
    hooks: Arc<dyn DecodeHooks>,
    buf: Vec<u8>,
    start: usize,
    origin: u64,
}

impl<R: Read> StreamReader<R> {
    pub fn new(source: R) -> Self {
        Self::with_hooks(source, Arc::new(NoopHooks))
    }

    pub fn with_hooks(source: R, hooks: Arc<dyn DecodeHooks>) -> Self {
        StreamReader {
            source,
            hooks,
            buf: Vec::new(),
            start: 0,
            origin: 0,
        }
    }

    pub fn position(&self) -> StreamLabel {
        StreamLabel(self.origin + self.start as u64)
    }

    fn buffered(&self) -> usize {
        self.buf.len() - self.start
    }

    /// Pull from the source until `n` bytes are buffered. Returns false when
    /// the source is exhausted first.
    fn fill(&mut self, n: usize) -> Result<bool> {
        while self.buffered() < n {
            // Reclaim consumed space before growing the window.
            if self.start >= READ_CHUNK {
                self.buf.drain(..self.start);
                self.origin += self.start as u64;
                self.start = 0;
            }
            let old_len = self.buf.len();
            let want = READ_CHUNK.max(n - self.buffered());
            self.buf.resize(old_len + want, 0);
            self.hooks.start_read();
            let res = self.source.read(&mut self.buf[old_len..]);
            self.hooks.stop_read(*res.as_ref().unwrap_or(&0));
            let got = match res {
                Ok(count) => count,
                Err(err) => {
                    self.buf.truncate(old_len);
                    return Err(err.into());
                }
            };
            self.buf.truncate(old_len + got);
            if got == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn ensure(&mut self, n: usize) -> Result<()> {
        if !self.fill(n)? {
            return Err(FormatError::Truncated {
                needed: n,
                available: self.buffered(),
            }
            .into());
        }
        Ok(())
    }

    /// True when no more bytes can be read.
    pub fn at_eof(&mut self) -> Result<bool> {
        Ok(!self.fill(1)?)
    }

    pub fn peek(&mut self, n: usize) -> Result<&[u8]> {
        self.ensure(n)?;
        Ok(&self.buf[self.start..self.start + n])
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&[u8]> {
        self.ensure(n)?;
        let slice = &self.buf[self.start..self.start + n];
        self.start += n;
        Ok(slice)
    }

    pub fn read_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.read_bytes(n)?.to_vec())
    }

    pub fn skip(&mut self, mut n: u64) -> Result<()> {
        while n > 0 {
            let step = (n as usize).min(READ_CHUNK);
            self.ensure(step)?;
            self.start += step;
            n -= step as u64;
        }
        Ok(())
    }

    /// Reposition to a previously recorded label. Forward motion consumes
    /// the source; backward motion is bounded by the buffered window.
    pub fn goto(&mut self, label: StreamLabel) -> Result<()> {
        let current = self.origin + self.start as u64;
        if label.0 >= current {
            return self.skip(label.0 - current);
        }
        if label.0 < self.origin {
            return Err(FormatError::InvalidFormat(
                "cannot reposition before the buffered window on a non-seekable source",
            )
            .into());
        }
        self.start = (label.0 - self.origin) as usize;
        Ok(())
    }

    /// Advance to the next 4-byte boundary of the absolute stream offset.
    pub fn align4(&mut self) -> Result<()> {
        let rem = (self.origin + self.start as u64) % 4;
        if rem != 0 {
            self.skip(4 - rem)?;
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(LittleEndian::read_i16(self.read_bytes(2)?))
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.read_bytes(2)?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(LittleEndian::read_i32(self.read_bytes(4)?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.read_bytes(4)?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(LittleEndian::read_i64(self.read_bytes(8)?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.read_bytes(8)?))
    }

    pub fn read_guid(&mut self) -> Result<Guid> {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(self.read_bytes(16)?);
        Ok(Guid::from_bytes(bytes))
    }

    /// UTF-16LE string with a u16 0x0000 terminator.
    pub fn read_utf16_nul(&mut self) -> Result<String> {
        let mut units = Vec::new();
        loop {
            let unit = self.read_u16()?;
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        Ok(String::from_utf16_lossy(&units))
    }

    /// u32-length-prefixed UTF-8, the serialization stream's string shape.
    pub fn read_counted_utf8(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

//! Outbound content staged as an ordered list of chunks.
//!
//! Text and raw bytes are kept in memory; uploads are kept as lazy sources and
//! are not opened until the buffer is written. The total size is tracked as
//! chunks are appended, so it is known before anything is read.

use std::fmt;
use std::io::{self, Read, Write};

use crate::upload::Uploadable;

/// Receives transfer progress while a [`Buffer`] is written.
pub trait ProgressListener {
    /// Number of bytes between two callbacks. Asked once, before any byte is
    /// written, with the total size of the content.
    fn chunk_granularity(&mut self, _total_size: u64) -> u64 {
        512
    }

    /// Called with the cumulative number of bytes written so far.
    fn on_transferred(&mut self, bytes: u64);
}

impl<F: FnMut(u64)> ProgressListener for F {
    fn on_transferred(&mut self, bytes: u64) {
        self(bytes)
    }
}

pub enum Chunk {
    Memory(Vec<u8>),
    Lazy(Box<dyn Uploadable>),
}

impl Chunk {
    pub fn len(&self) -> u64 {
        match self {
            Chunk::Memory(bytes) => bytes.len() as u64,
            Chunk::Lazy(upload) => upload.size(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chunk::Memory(bytes) => f.debug_tuple("Memory").field(&bytes.len()).finish(),
            Chunk::Lazy(upload) => f
                .debug_struct("Lazy")
                .field("size", &upload.size())
                .field("file_name", &upload.file_name())
                .finish(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Buffer {
    chunks: Vec<Chunk>,
    size: u64,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends text encoded one byte per character (ISO-8859-1).
    ///
    /// Characters outside that range are written as `?`; pre-encode such text
    /// and use [`Buffer::append_bytes`] instead.
    pub fn append_str(&mut self, text: &str) -> &mut Self {
        self.extend_tail(text.chars().map(|c| u8::try_from(c).unwrap_or(b'?')));
        self.size += text.chars().count() as u64;
        self
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.extend_tail(bytes.iter().copied());
        self.size += bytes.len() as u64;
        self
    }

    pub fn append_char(&mut self, c: char) -> &mut Self {
        let mut tmp = [0u8; 4];
        self.append_str(c.encode_utf8(&mut tmp))
    }

    pub fn append_number(&mut self, number: impl fmt::Display) -> &mut Self {
        self.append_str(&number.to_string())
    }

    /// Appends a lazy source as its own chunk.
    pub fn append_uploadable(&mut self, upload: impl Uploadable + 'static) -> &mut Self {
        self.size += upload.size();
        self.chunks.push(Chunk::Lazy(Box::new(upload)));
        self
    }

    /// Moves the chunks of `other` to the end of this buffer.
    ///
    /// A buffer with no chunks leaves `self` untouched.
    pub fn append_buffer(&mut self, mut other: Buffer) -> &mut Self {
        if other.chunks.is_empty() {
            return self;
        }
        self.chunks.append(&mut other.chunks);
        self.size += other.size;
        self
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Extends the in-memory tail chunk, starting a new one after a lazy chunk.
    fn extend_tail(&mut self, bytes: impl Iterator<Item = u8>) {
        match self.chunks.last_mut() {
            Some(Chunk::Memory(tail)) => tail.extend(bytes),
            _ => self.chunks.push(Chunk::Memory(bytes.collect())),
        }
    }

    /// Writes all chunks in order.
    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        for chunk in &self.chunks {
            match chunk {
                Chunk::Memory(bytes) => out.write_all(bytes)?,
                Chunk::Lazy(upload) => {
                    let mut reader = upload.open()?;
                    copy_exact(&mut reader, out, upload.size())?;
                }
            }
        }
        Ok(())
    }

    /// Writes all chunks in order, reporting progress to `listener`.
    pub fn write_to_with_progress<W: Write + ?Sized>(
        &self,
        out: &mut W,
        listener: &mut dyn ProgressListener,
    ) -> io::Result<()> {
        let granularity = listener.chunk_granularity(self.size).max(1);
        let mut progress = Progress {
            listener,
            granularity,
            count: 0,
            step: 0,
        };

        progress.listener.on_transferred(0);

        for chunk in &self.chunks {
            match chunk {
                Chunk::Memory(bytes) => {
                    let mut offset = 0;
                    while offset < bytes.len() {
                        let len = progress.next_len((bytes.len() - offset) as u64) as usize;
                        out.write_all(&bytes[offset..offset + len])?;
                        offset += len;
                        progress.advance(len as u64);
                    }
                }
                Chunk::Lazy(upload) => {
                    let mut reader = upload.open()?;
                    let mut remaining = upload.size();
                    while remaining > 0 {
                        let len = progress.next_len(remaining);
                        copy_exact(&mut reader, out, len)?;
                        remaining -= len;
                        progress.advance(len);
                    }
                }
            }
        }

        progress.finish();
        Ok(())
    }
}

struct Progress<'a> {
    listener: &'a mut dyn ProgressListener,
    granularity: u64,
    count: u64,
    step: u64,
}

impl Progress<'_> {
    fn next_len(&self, remaining: u64) -> u64 {
        (self.granularity - self.step).min(remaining)
    }

    fn advance(&mut self, len: u64) {
        self.count += len;
        self.step += len;
        if self.step >= self.granularity {
            self.listener.on_transferred(self.count);
            self.step -= self.granularity;
        }
    }

    fn finish(&mut self) {
        if self.step != 0 {
            self.listener.on_transferred(self.count);
        }
    }
}

fn copy_exact<R: Read + ?Sized, W: Write + ?Sized>(reader: &mut R, out: &mut W, len: u64) -> io::Result<()> {
    let copied = io::copy(&mut reader.take(len), out)?;
    if copied < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("upload ended after {} of {} bytes", copied, len),
        ));
    }
    Ok(())
}

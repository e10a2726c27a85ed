//! Block-buffered sequential access to a byte range of a run file.

use std::io::{self, Read, Write};

use crate::diskio::file::{FileHandle, pread_fd, pwrite_all_fd};
use crate::diskio::io_stats::IoStatsTracker;

/// Appends to a file starting at a fixed offset, one block per `pwrite`.
pub struct BlockWriter {
    handle: FileHandle,
    start: u64,
    flushed: u64,
    buf: Vec<u8>,
    block_size: usize,
    io_tracker: Option<IoStatsTracker>,
}

impl BlockWriter {
    pub fn new(
        handle: FileHandle,
        start: u64,
        block_size: usize,
        io_tracker: Option<IoStatsTracker>,
    ) -> Self {
        let block_size = block_size.max(1);
        Self {
            handle,
            start,
            flushed: 0,
            buf: Vec::with_capacity(block_size),
            block_size,
            io_tracker,
        }
    }

    pub fn handle(&self) -> &FileHandle {
        &self.handle
    }

    /// Absolute file offset of the next byte written.
    pub fn position(&self) -> u64 {
        self.start + self.flushed + self.buf.len() as u64
    }

    fn flush_block(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let offset = self.start + self.flushed;
        pwrite_all_fd(self.handle.fd().as_raw_fd(), &self.buf, offset)?;
        if let Some(tracker) = &self.io_tracker {
            tracker.record_write(self.buf.len() as u64);
        }
        self.flushed += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }

    /// Flushes the tail block and closes the file. Returns the bytes written.
    pub fn finish(mut self) -> io::Result<u64> {
        self.flush_block()?;
        Ok(self.flushed)
    }
}

impl Write for BlockWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = self.block_size - self.buf.len();
        let n = room.min(data.len());
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() == self.block_size {
            self.flush_block()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_block()
    }
}

/// Reads the byte range `[start, end)` of a file one block at a time.
pub struct BlockReader {
    handle: FileHandle,
    end: u64,
    buf: Vec<u8>,
    buf_offset: u64,
    buf_pos: usize,
    block_size: usize,
    io_tracker: Option<IoStatsTracker>,
}

impl BlockReader {
    pub fn new(
        handle: FileHandle,
        start: u64,
        end: u64,
        block_size: usize,
        io_tracker: Option<IoStatsTracker>,
    ) -> Self {
        Self {
            handle,
            end,
            buf: Vec::new(),
            buf_offset: start,
            buf_pos: 0,
            block_size: block_size.max(1),
            io_tracker,
        }
    }

    pub fn handle(&self) -> &FileHandle {
        &self.handle
    }

    /// Absolute file offset of the next unread byte.
    pub fn position(&self) -> u64 {
        self.buf_offset + self.buf_pos as u64
    }

    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.position())
    }

    fn fill(&mut self) -> io::Result<()> {
        let offset = self.position();
        let want = (self.end - offset).min(self.block_size as u64) as usize;
        self.buf.resize(want, 0);
        let mut filled = 0;
        while filled < want {
            let n = match pread_fd(
                self.handle.fd().as_raw_fd(),
                &mut self.buf[filled..],
                offset + filled as u64,
            ) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("file ends at {} inside run range", offset + filled as u64),
                ));
            }
            filled += n;
        }
        if let Some(tracker) = &self.io_tracker {
            tracker.record_read(want as u64);
        }
        self.buf_offset = offset;
        self.buf_pos = 0;
        Ok(())
    }
}

impl Read for BlockReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.buf_pos == self.buf.len() {
            if self.remaining() == 0 {
                return Ok(0);
            }
            self.fill()?;
        }
        let n = (self.buf.len() - self.buf_pos).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.buf_pos..self.buf_pos + n]);
        self.buf_pos += n;
        Ok(n)
    }
}

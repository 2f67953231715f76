//! Pipes.
//!
//! A fixed ring buffer with byte counters for each side. Readers sleep
//! while the pipe is empty and a writer remains; writers sleep while it
//! is full and a reader remains. Close of the last handle on a side
//! wakes the other side so it can observe EOF or the broken pipe.

use alloc::sync::Arc;

use crate::error::{KernelError, Result};
use crate::file::{FileKind, FileTable, RcFile};
use crate::lock::SpinLock;
use crate::proc::WaitChannel;

const PIPESIZE: usize = 512;

struct PipeInner {
    data: [u8; PIPESIZE],

    /// Number of bytes read.
    nread: u32,

    /// Number of bytes written.
    nwrite: u32,

    /// Read side is still open.
    readopen: bool,

    /// Write side is still open.
    writeopen: bool,
}

#[derive(Debug)]
enum PipeWait {
    /// Nothing to do until the other side acts.
    WaitForIo,
    /// The other side is gone.
    Closed,
}

impl PipeInner {
    fn new() -> Self {
        Self {
            data: [0; PIPESIZE],
            nread: 0,
            nwrite: 0,
            readopen: true,
            writeopen: true,
        }
    }

    fn available(&self) -> usize {
        (self.nwrite - self.nread) as usize
    }

    fn space(&self) -> usize {
        PIPESIZE - self.available()
    }

    /// Copies out up to `buf.len()` bytes without blocking.
    fn try_read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, PipeWait> {
        if self.available() == 0 {
            if !self.writeopen {
                return Err(PipeWait::Closed);
            }
            return Err(PipeWait::WaitForIo);
        }
        let n = buf.len().min(self.available());
        for b in buf[..n].iter_mut() {
            *b = self.data[self.nread as usize % PIPESIZE];
            self.nread = self.nread.wrapping_add(1);
        }
        Ok(n)
    }

    /// Copies in as much of `buf` as fits without blocking.
    fn try_write(&mut self, buf: &[u8]) -> core::result::Result<usize, PipeWait> {
        if !self.readopen {
            return Err(PipeWait::Closed);
        }
        if self.space() == 0 {
            return Err(PipeWait::WaitForIo);
        }
        let n = buf.len().min(self.space());
        for &b in &buf[..n] {
            self.data[self.nwrite as usize % PIPESIZE] = b;
            self.nwrite = self.nwrite.wrapping_add(1);
        }
        Ok(n)
    }
}

pub struct Pipe {
    inner: SpinLock<PipeInner>,

    /// Says there are unread bytes in the ring.
    read_wait: WaitChannel,

    /// Says there is room in the ring.
    write_wait: WaitChannel,
}

impl Pipe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SpinLock::new("pipe", PipeInner::new()),
            read_wait: WaitChannel::new(),
            write_wait: WaitChannel::new(),
        })
    }

    /// Reads up to `buf.len()` bytes, sleeping while the pipe is empty
    /// and writers remain. Zero with all writers gone means EOF.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.lock();
        loop {
            match inner.try_read(buf) {
                Ok(n) => {
                    self.write_wait.wakeup();
                    return Ok(n);
                }
                Err(PipeWait::Closed) => return Ok(0),
                Err(PipeWait::WaitForIo) => {
                    self.read_wait.sleep(&mut inner);
                }
            }
        }
    }

    /// Writes all of `buf`, sleeping while the ring is full. Writing to
    /// a pipe with no readers is an I/O error.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut written = 0;
        let mut inner = self.inner.lock();
        while written < buf.len() {
            match inner.try_write(&buf[written..]) {
                Ok(n) => {
                    written += n;
                    self.read_wait.wakeup();
                }
                Err(PipeWait::Closed) => return Err(KernelError::Io),
                Err(PipeWait::WaitForIo) => {
                    self.write_wait.sleep(&mut inner);
                }
            }
        }
        Ok(written)
    }

    /// Drops one side; wakes the other so it can notice.
    pub fn close_end(&self, writable: bool) {
        let mut inner = self.inner.lock();
        if writable {
            inner.writeopen = false;
            self.read_wait.wakeup();
        } else {
            inner.readopen = false;
            self.write_wait.wakeup();
        }
    }

    /// Unread byte count, for diagnostics.
    pub fn pending(&self) -> usize {
        self.inner.lock().available()
    }
}

/// Allocates the (read, write) handle pair for the pipe syscall.
pub fn alloc_pair(ftable: &FileTable) -> Result<(RcFile, RcFile)> {
    let pipe = Pipe::new();
    let reader = ftable.alloc(
        FileKind::Pipe { pipe: pipe.clone() },
        true,
        false,
        false,
    )?;
    let writer = ftable.alloc(FileKind::Pipe { pipe }, false, true, false)?;
    Ok((reader, writer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_flow_in_fifo_order() {
        let pipe = Pipe::new();
        assert_eq!(pipe.write(b"abc").unwrap(), 3);
        let mut out = [0u8; 2];
        assert_eq!(pipe.read(&mut out).unwrap(), 2);
        assert_eq!(&out, b"ab");
        assert_eq!(pipe.read(&mut out).unwrap(), 1);
        assert_eq!(out[0], b'c');
    }

    #[test]
    fn ring_wraps_around() {
        let pipe = Pipe::new();
        let chunk = [7u8; PIPESIZE - 10];
        let mut sink = vec![0u8; PIPESIZE];
        for _ in 0..5 {
            assert_eq!(pipe.write(&chunk).unwrap(), chunk.len());
            assert_eq!(pipe.read(&mut sink).unwrap(), chunk.len());
        }
    }

    #[test]
    fn reader_sees_eof_after_writer_closes() {
        let pipe = Pipe::new();
        pipe.write(b"tail").unwrap();
        pipe.close_end(true);
        let mut out = [0u8; 8];
        assert_eq!(pipe.read(&mut out).unwrap(), 4);
        assert_eq!(pipe.read(&mut out).unwrap(), 0);
    }

    #[test]
    fn write_without_readers_is_an_error() {
        let pipe = Pipe::new();
        pipe.close_end(false);
        assert_eq!(pipe.write(b"x").err(), Some(KernelError::Io));
    }

    #[test]
    fn nonblocking_paths_report_wait_states() {
        let mut inner = PipeInner::new();
        let mut out = [0u8; 4];
        assert!(matches!(inner.try_read(&mut out), Err(PipeWait::WaitForIo)));
        let big = [1u8; PIPESIZE];
        assert_eq!(inner.try_write(&big).unwrap(), PIPESIZE);
        assert!(matches!(inner.try_write(&big[..1]), Err(PipeWait::WaitForIo)));
    }
}

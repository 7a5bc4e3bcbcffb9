//! Non-blocking pipe ends for `wl_data_offer.receive` and
//! `wl_data_source.send`.
//!
//! Both sides are driven from the event loop: the pump polls the fds and
//! calls [`PipeReader::read_available`] / [`PipeWriter::write_available`]
//! when they are ready. Neither ever blocks.

use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};

use bytes::{Bytes, BytesMut};
use nix::fcntl::{FcntlArg, OFlag, fcntl};

use crate::error::Result;

/// Largest single read or write.
const CHUNK: usize = 4096;

/// Create a close-on-exec pipe whose read end is non-blocking.
/// Returns `(read, write)`.
pub fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    set_nonblocking(&read)?;
    Ok((read, write))
}

pub fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Progress of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// More may come.
    Pending,
    /// The writer closed its end; everything has been read.
    Eof,
    /// The peer sent more than the configured limit.
    Overflow,
}

/// Read end of a transfer, accumulating until end-of-stream.
pub struct PipeReader {
    fd: OwnedFd,
    buf: BytesMut,
    limit: usize,
}

impl PipeReader {
    pub fn new(fd: OwnedFd, limit: usize) -> Self {
        Self {
            fd,
            buf: BytesMut::new(),
            limit,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Drain whatever is readable right now.
    pub fn read_available(&mut self) -> Result<ReadStatus> {
        let mut chunk = [0u8; CHUNK];
        loop {
            match nix::unistd::read(self.fd.as_fd(), &mut chunk) {
                Ok(0) => return Ok(ReadStatus::Eof),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    if self.buf.len() > self.limit {
                        return Ok(ReadStatus::Overflow);
                    }
                }
                Err(nix::Error::EINTR) => continue,
                Err(nix::Error::EAGAIN) => return Ok(ReadStatus::Pending),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Everything read so far.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Write end of a `send` request. The fd is closed when the writer is
/// dropped, which is the end-of-stream signal.
pub struct PipeWriter {
    fd: OwnedFd,
    data: Bytes,
    offset: usize,
}

impl PipeWriter {
    /// Takes ownership of the compositor's fd and makes it non-blocking.
    pub fn new(fd: OwnedFd, data: Bytes) -> Result<Self> {
        set_nonblocking(&fd)?;
        Ok(Self {
            fd,
            data,
            offset: 0,
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Write until the pipe is full or everything is out. Returns `true`
    /// once the transfer is finished, successfully or not.
    pub fn write_available(&mut self) -> bool {
        while self.offset < self.data.len() {
            let end = (self.offset + CHUNK).min(self.data.len());
            match nix::unistd::write(&self.fd, &self.data[self.offset..end]) {
                Ok(n) => self.offset += n,
                Err(nix::Error::EINTR) => continue,
                Err(nix::Error::EAGAIN) => return false,
                Err(e) => {
                    // EPIPE: the reader went away.
                    tracing::debug!(error = %e, written = self.offset, "pipe write aborted");
                    return true;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn reader_collects_until_eof() {
        let (read, write) = pipe().unwrap();
        let mut reader = PipeReader::new(read, 1024);
        assert_eq!(reader.read_available().unwrap(), ReadStatus::Pending);

        let mut file = std::fs::File::from(write);
        file.write_all(b"hello ").unwrap();
        assert_eq!(reader.read_available().unwrap(), ReadStatus::Pending);
        file.write_all(b"world").unwrap();
        drop(file);
        assert_eq!(reader.read_available().unwrap(), ReadStatus::Eof);
        assert_eq!(&reader.into_bytes()[..], b"hello world");
    }

    #[test]
    fn reader_stops_at_limit() {
        let (read, write) = pipe().unwrap();
        let mut reader = PipeReader::new(read, 4);
        std::fs::File::from(write).write_all(b"too long").unwrap();
        assert_eq!(reader.read_available().unwrap(), ReadStatus::Overflow);
    }

    #[test]
    fn writer_writes_everything_and_closes() {
        let (read, write) = pipe().unwrap();
        let payload = Bytes::from(vec![7u8; CHUNK * 3 + 5]);
        let mut writer = PipeWriter::new(write, payload.clone()).unwrap();
        // The pipe buffer holds at least 4 pages on Linux.
        assert!(writer.write_available());
        drop(writer);

        let mut received = Vec::new();
        let mut file = std::fs::File::from(read);
        // The read end is non-blocking but the writer is gone, so this
        // reads to EOF without ever seeing EAGAIN.
        file.read_to_end(&mut received).unwrap();
        assert_eq!(received, payload);
    }

    #[test]
    fn writer_gives_up_on_closed_reader() {
        let (read, write) = pipe().unwrap();
        drop(read);
        let mut writer = PipeWriter::new(write, Bytes::from_static(b"x")).unwrap();
        assert!(writer.write_available());
    }
}

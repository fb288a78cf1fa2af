//! Line-framed pipe I/O shared by the pool side and the worker side.
//!
//! Reads and writes go straight to the file descriptor through `nix`, retrying
//! on EINTR, with a buffer on top for line framing.

use super::protocol::{WorkRequest, WorkResponse};
use super::{RequestWriter, ResponseReader};
use crate::error::{PoolError, Result};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Buffer size for pipe I/O (64KB).
const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// An owned pipe end with EINTR-safe Read/Write.
#[derive(Debug)]
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: impl Into<OwnedFd>) -> Self {
        Self { fd: fd.into() }
    }

    /// Duplicate the process's stdin and stdout for use by a worker loop.
    pub fn stdio() -> io::Result<(Self, Self)> {
        let stdin = io::stdin().as_fd().try_clone_to_owned()?;
        let stdout = io::stdout().as_fd().try_clone_to_owned()?;
        Ok((Self::new(stdin), Self::new(stdout)))
    }

    /// Create an anonymous pipe, returning `(read_end, write_end)`.
    pub fn pipe() -> io::Result<(Self, Self)> {
        let (read_fd, write_fd) = nix::unistd::pipe().map_err(io::Error::from)?;
        Ok((Self::new(read_fd), Self::new(write_fd)))
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Buffered newline-delimited reader.
pub struct LineReader<R = PipeFd> {
    reader: BufReader<R>,
    line: String,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::with_capacity(PIPE_BUFFER_SIZE, inner),
            line: String::with_capacity(4096),
        }
    }

    /// Read one line without its terminator. Returns `None` on EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.line.clear();
        if self.reader.read_line(&mut self.line)? == 0 {
            return Ok(None);
        }
        let trimmed = self.line.trim_end_matches(['\n', '\r']).len();
        self.line.truncate(trimmed);
        Ok(Some(&self.line))
    }
}

/// Buffered newline-delimited writer; every line is flushed immediately.
pub struct LineWriter<W: Write = PipeFd> {
    writer: BufWriter<W>,
}

impl<W: Write> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(PIPE_BUFFER_SIZE, inner),
        }
    }

    /// Write a line (appending the newline if missing) and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }
}

impl<W: Write + Send> RequestWriter for LineWriter<W> {
    fn send(&mut self, request: &WorkRequest) -> Result<()> {
        let line = request.to_line()?;
        self.write_line(&line)
            .map_err(|e| PoolError::Transport(format!("failed to send to worker: {e}")))
    }
}

impl<R: Read + Send> ResponseReader for LineReader<R> {
    fn recv(&mut self) -> Result<Option<WorkResponse>> {
        match self.read_line() {
            Ok(Some(line)) => WorkResponse::from_line(line)
                .map(Some)
                .map_err(|e| PoolError::Protocol(format!("invalid worker response: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(PoolError::Transport(format!(
                "failed to receive from worker: {e}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_framing_over_pipe() {
        let (read_end, write_end) = PipeFd::pipe().unwrap();
        let mut reader = LineReader::new(read_end);
        let mut writer = LineWriter::new(write_end);

        writer.write_line("hello").unwrap();
        writer.write_line("world\n").unwrap();
        writer.write_line("crlf\r\n").unwrap();
        drop(writer);

        assert_eq!(reader.read_line().unwrap(), Some("hello"));
        assert_eq!(reader.read_line().unwrap(), Some("world"));
        assert_eq!(reader.read_line().unwrap(), Some("crlf"));
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn test_request_and_response_over_pipe() {
        let (req_read, req_write) = PipeFd::pipe().unwrap();
        let (resp_read, resp_write) = PipeFd::pipe().unwrap();

        let mut pool_side_writer = LineWriter::new(req_write);
        pool_side_writer
            .send(&WorkRequest::work(5, vec!["a".into()]))
            .unwrap();

        let mut worker_side_reader = LineReader::new(req_read);
        let line = worker_side_reader.read_line().unwrap().unwrap().to_string();
        assert_eq!(
            WorkRequest::from_line(&line).unwrap(),
            WorkRequest::work(5, vec!["a".into()])
        );

        let mut worker_side_writer = LineWriter::new(resp_write);
        worker_side_writer
            .write_line(&WorkResponse::result(5, 0, "a").to_line().unwrap())
            .unwrap();
        drop(worker_side_writer);

        let mut pool_side_reader = LineReader::new(resp_read);
        assert_eq!(
            pool_side_reader.recv().unwrap(),
            Some(WorkResponse::result(5, 0, "a"))
        );
        assert_eq!(pool_side_reader.recv().unwrap(), None);
    }

    #[test]
    fn test_garbage_response_is_protocol_error() {
        let (read_end, write_end) = PipeFd::pipe().unwrap();
        let mut writer = LineWriter::new(write_end);
        writer.write_line("not json").unwrap();
        drop(writer);

        let mut reader = LineReader::new(read_end);
        assert!(matches!(reader.recv(), Err(PoolError::Protocol(_))));
    }
}

//! Length-framed self-pipe.
//!
//! Every frame is a native-endian `u32` length prefix followed by the payload:
//!
//! ```text
//! ┌──────────────┬──────────────────┐
//! │ Length       │ Payload          │
//! │ 4 bytes (NE) │ `Length` bytes   │
//! └──────────────┴──────────────────┘
//! ```
//!
//! A zero-length frame is a pure wake-up with no payload.
//!
//! The pipe never leaves the process, so native endianness is fine. Frames are
//! written with a single contiguous buffer: frames up to `PIPE_BUF` bytes are
//! atomic, so concurrent writers never interleave partial frames.
//!
//! # Example
//!
//! ```
//! use request_piper::transport::Pipe;
//!
//! let pipe = Pipe::new().unwrap();
//! assert!(pipe.read().unwrap().is_none());
//!
//! pipe.write(b"wake").unwrap();
//! assert_eq!(&pipe.read().unwrap().unwrap()[..], b"wake");
//! ```

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use rustix::fs::OFlags;
use rustix::io::Errno;

use crate::error::{PiperError, Result};

/// Size of the frame length prefix in bytes.
pub const LEN_PREFIX_SIZE: usize = std::mem::size_of::<u32>();

/// Default maximum payload accepted by [`Pipe::read`] (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1 << 20;

/// A process-local pipe carrying discrete, size-framed messages.
///
/// One designated reader, any number of writers. `write` takes no lock:
/// callers that need a frame to line up with some other state change (a
/// queue push) must hold their own lock across both.
#[derive(Debug)]
pub struct Pipe {
    read_fd: OwnedFd,
    write_fd: OwnedFd,
    max_payload: u32,
    closed: AtomicBool,
}

impl Pipe {
    /// Open a new pipe with the default maximum frame size.
    ///
    /// The read end is non-blocking.
    pub fn new() -> Result<Self> {
        Self::with_max_payload(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Open a new pipe that rejects frames larger than `max_payload`.
    pub fn with_max_payload(max_payload: u32) -> Result<Self> {
        let (read_fd, write_fd) = rustix::pipe::pipe().map_err(|e| {
            tracing::error!("pipe() failed: {}", e);
            PiperError::from(e)
        })?;

        let flags = rustix::fs::fcntl_getfl(&read_fd)?;
        rustix::fs::fcntl_setfl(&read_fd, flags | OFlags::NONBLOCK)?;

        tracing::debug!(
            "created pipe read fd {} write fd {}",
            read_fd.as_raw_fd(),
            write_fd.as_raw_fd()
        );

        Ok(Self {
            read_fd,
            write_fd,
            max_payload,
            closed: AtomicBool::new(false),
        })
    }

    /// Maximum payload size accepted by the reader.
    #[inline]
    pub fn max_payload(&self) -> u32 {
        self.max_payload
    }

    /// Write one frame.
    ///
    /// Retries on `EINTR`. Any other error aborts the frame, is logged and
    /// returned. Blocks while the pipe is full.
    pub fn write(&self, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= self.max_payload)
            .ok_or_else(|| {
                PiperError::Protocol(format!(
                    "Frame size {} exceeds maximum {}",
                    payload.len(),
                    self.max_payload
                ))
            })?;

        let mut frame = BytesMut::with_capacity(LEN_PREFIX_SIZE + payload.len());
        frame.put_slice(&len.to_ne_bytes());
        frame.put_slice(payload);

        let mut written = 0;
        while written < frame.len() {
            match rustix::io::write(&self.write_fd, &frame[written..]) {
                Ok(0) => {
                    tracing::warn!("write() to fd {} returned 0", self.write_fd.as_raw_fd());
                    return Err(PiperError::Closed);
                }
                Ok(n) => written += n,
                Err(Errno::INTR) => continue,
                Err(e) => {
                    tracing::warn!(
                        "write() to fd {} failed: {}",
                        self.write_fd.as_raw_fd(),
                        e
                    );
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Write a zero-length frame, purely to wake the reader.
    pub fn signal(&self) -> Result<()> {
        self.write(&[])
    }

    /// Read one frame without waiting for one to arrive.
    ///
    /// Returns `Ok(None)` when no frame is ready. Once a length prefix has been
    /// read the payload is known to be on its way, so the descriptor is put in
    /// blocking mode until the payload is complete.
    pub fn read(&self) -> Result<Option<Bytes>> {
        let mut prefix = [0u8; LEN_PREFIX_SIZE];
        let mut filled = 0;

        while filled < LEN_PREFIX_SIZE {
            match rustix::io::read(&self.read_fd, &mut prefix[filled..]) {
                Ok(0) => return Err(PiperError::Closed),
                Ok(n) => filled += n,
                Err(Errno::INTR) => continue,
                Err(Errno::AGAIN) if filled == 0 => return Ok(None),
                Err(Errno::AGAIN) => {
                    // The prefix goes out in one write, so the rest is in flight.
                    let _blocking = BlockingGuard::engage(self.read_fd.as_fd());
                    read_exact(self.read_fd.as_fd(), &mut prefix[filled..])?;
                    filled = LEN_PREFIX_SIZE;
                }
                Err(e) => {
                    tracing::warn!(
                        "unexpected error reading fd {}: {}",
                        self.read_fd.as_raw_fd(),
                        e
                    );
                    return Err(e.into());
                }
            }
        }

        let len = self.check_len(u32::from_ne_bytes(prefix))?;
        if len == 0 {
            return Ok(Some(Bytes::new()));
        }

        let _blocking = BlockingGuard::engage(self.read_fd.as_fd());
        let mut payload = vec![0u8; len];
        read_exact(self.read_fd.as_fd(), &mut payload)?;
        Ok(Some(Bytes::from(payload)))
    }

    /// Read one frame, waiting for it to arrive.
    pub fn read_blocking(&self) -> Result<Bytes> {
        let _blocking = BlockingGuard::engage(self.read_fd.as_fd());

        let mut prefix = [0u8; LEN_PREFIX_SIZE];
        read_exact(self.read_fd.as_fd(), &mut prefix)?;

        let len = self.check_len(u32::from_ne_bytes(prefix))?;
        let mut payload = vec![0u8; len];
        read_exact(self.read_fd.as_fd(), &mut payload)?;
        Ok(Bytes::from(payload))
    }

    /// Mark the pipe closed and wake any blocked reader.
    ///
    /// Returns `false` if the pipe was already closed. The descriptors stay
    /// open until the pipe is dropped.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Err(e) = self.signal() {
            tracing::debug!("failed to wake reader on close: {}", e);
        }
        true
    }

    /// Whether [`close`](Self::close) has been called.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The read descriptor for poll/select integration, or `None` once closed.
    pub fn raw_read_fd(&self) -> Option<RawFd> {
        (!self.is_closed()).then(|| self.read_fd.as_raw_fd())
    }

    fn check_len(&self, len: u32) -> Result<usize> {
        if len > self.max_payload {
            tracing::error!(
                "frame on fd {} announces {} bytes, maximum is {}",
                self.read_fd.as_raw_fd(),
                len,
                self.max_payload
            );
            return Err(PiperError::Protocol(format!(
                "Frame size {} exceeds maximum {}",
                len, self.max_payload
            )));
        }
        Ok(len as usize)
    }
}

impl AsFd for Pipe {
    /// The read end.
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.read_fd.as_fd()
    }
}

impl AsRawFd for Pipe {
    fn as_raw_fd(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }
}

/// Fill `buf` from `fd`, retrying on `EINTR`.
fn read_exact(fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match rustix::io::read(fd, &mut buf[filled..]) {
            Ok(0) => return Err(PiperError::Closed),
            Ok(n) => filled += n,
            Err(Errno::INTR) => continue,
            Err(e) => {
                tracing::warn!("read() of fd {} failed: {}", fd.as_raw_fd(), e);
                return Err(e.into());
            }
        }
    }
    Ok(())
}

/// Clears `O_NONBLOCK` for its lifetime and restores the original flags on drop.
struct BlockingGuard<'fd> {
    fd: BorrowedFd<'fd>,
    restore: Option<OFlags>,
}

impl<'fd> BlockingGuard<'fd> {
    fn engage(fd: BorrowedFd<'fd>) -> Self {
        let restore = match rustix::fs::fcntl_getfl(fd) {
            Ok(flags) if flags.contains(OFlags::NONBLOCK) => {
                match rustix::fs::fcntl_setfl(fd, flags - OFlags::NONBLOCK) {
                    Ok(()) => Some(flags),
                    Err(e) => {
                        tracing::warn!("fcntl(F_SETFL) on fd {} failed: {}", fd.as_raw_fd(), e);
                        None
                    }
                }
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("fcntl(F_GETFL) on fd {} failed: {}", fd.as_raw_fd(), e);
                None
            }
        };
        Self { fd, restore }
    }
}

impl Drop for BlockingGuard<'_> {
    fn drop(&mut self) {
        if let Some(flags) = self.restore {
            if let Err(e) = rustix::fs::fcntl_setfl(self.fd, flags) {
                tracing::warn!("failed to restore flags on fd {}: {}", self.fd.as_raw_fd(), e);
            }
        }
    }
}

//! Reliable blocking I/O on a connection.
//!
//! `read_exact`/`write_exact` hide partial transfers: they either move the
//! whole requested range or fail. A zero-byte receive is not trusted as
//! end-of-stream on its own; the peer is probed first and the receive is
//! retried if it is still there.

use crate::error::TransportError;
use socket2::SockRef;
use std::io::{self, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use tracing::trace;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const PEER_HANGUP: libc::c_short = libc::POLLRDHUP;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const PEER_HANGUP: libc::c_short = 0;

/// A byte stream the connection handler can drive.
pub trait Transport: Read + Write {
    /// Whether the peer is still attached. Only called after a receive
    /// returned zero bytes.
    fn is_alive(&self) -> bool;
}

impl Transport for TcpStream {
    fn is_alive(&self) -> bool {
        probe_liveness(self)
    }
}

/// Check whether the peer has abandoned `stream`.
///
/// Issues a zero-length send (no data reaches the peer, and a reset peer
/// yields an error instead of `SIGPIPE`), then polls without blocking for
/// hangup. Readable right after an empty receive also means end-of-stream,
/// since this thread is the only reader.
pub fn probe_liveness(stream: &TcpStream) -> bool {
    if SockRef::from(stream).send_with_flags(&[], SEND_FLAGS).is_err() {
        return false;
    }

    let mut pfd = libc::pollfd {
        fd: stream.as_raw_fd(),
        events: libc::POLLIN | PEER_HANGUP,
        revents: 0,
    };
    // SAFETY: `pfd` is a single valid pollfd for a descriptor we own, and a
    // zero timeout never blocks.
    let ready = unsafe { libc::poll(&mut pfd, 1, 0) };
    if ready < 0 {
        return false;
    }
    let hangup = libc::POLLIN | libc::POLLHUP | libc::POLLERR | PEER_HANGUP;
    pfd.revents & hangup == 0
}

/// Receive at least one byte into `dst`.
///
/// Interrupted receives and empty receives from a live peer are retried.
pub fn read_some<T: Transport + ?Sized>(
    stream: &mut T,
    dst: &mut [u8],
) -> Result<usize, TransportError> {
    debug_assert!(!dst.is_empty(), "read_some into empty buffer");
    loop {
        match stream.read(dst) {
            Ok(0) => {
                if !stream.is_alive() {
                    return Err(TransportError::Closed);
                }
                trace!("Empty receive from live peer, retrying");
            }
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(TransportError::Recv(e)),
        }
    }
}

/// Fill all of `dst` from the stream.
pub fn read_exact<T: Transport + ?Sized>(
    stream: &mut T,
    dst: &mut [u8],
) -> Result<(), TransportError> {
    let mut read = 0;
    while read < dst.len() {
        read += read_some(stream, &mut dst[read..])?;
    }
    Ok(())
}

/// Send all of `src` to the stream.
pub fn write_exact<T: Transport + ?Sized>(stream: &mut T, src: &[u8]) -> Result<(), TransportError> {
    let mut sent = 0;
    while sent < src.len() {
        match stream.write(&src[sent..]) {
            Ok(0) => {
                return Err(TransportError::Send(io::Error::new(
                    ErrorKind::WriteZero,
                    "send returned 0",
                )))
            }
            Ok(n) => sent += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(TransportError::Send(e)),
        }
    }
    Ok(())
}

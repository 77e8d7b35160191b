use std::io::{Error, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};

/// Outcome of a single non-blocking stream operation.
pub enum IoStatus {
    /// The operation transferred this many bytes.
    Success(usize),
    /// The kernel buffer cannot make progress right now; retry on the next
    /// readiness event.
    WouldBlock,
    /// The peer has shut down its side of the stream (zero-length read).
    Shutdown,
    Err(Error),
}

pub trait ReadNonblocking: Read {
    /// A single `read(2)` on a non-blocking descriptor, with `EINTR`
    /// retried and end-of-file reported as [`IoStatus::Shutdown`].
    fn read_nonblocking(&mut self, buf: &mut [u8]) -> IoStatus {
        loop {
            return match self.read(buf) {
                Ok(0) => IoStatus::Shutdown,
                Ok(len) => IoStatus::Success(len),
                Err(err) if err.kind() == ErrorKind::WouldBlock => IoStatus::WouldBlock,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => IoStatus::Err(err),
            };
        }
    }
}

impl ReadNonblocking for TcpStream {}

pub trait WriteNonblocking: Write {
    /// A single `write(2)` on a non-blocking descriptor; partial writes are
    /// reported as success with the transferred length.
    fn write_nonblocking(&mut self, buf: &[u8]) -> IoStatus {
        if buf.is_empty() {
            return IoStatus::Success(0);
        }
        loop {
            return match self.write(buf) {
                Ok(0) => IoStatus::WouldBlock,
                Ok(len) => IoStatus::Success(len),
                Err(err) if err.kind() == ErrorKind::WriteZero => IoStatus::WouldBlock,
                Err(err) if err.kind() == ErrorKind::WouldBlock => IoStatus::WouldBlock,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => IoStatus::Err(err),
            };
        }
    }
}

impl WriteNonblocking for TcpStream {}

/// Outcome of a single non-blocking datagram receive.
pub enum DatagramStatus {
    /// A datagram of this size arrived from this address.
    Success(usize, SocketAddr),
    /// No datagram is queued right now.
    WouldBlock,
    /// The socket is connected and a previous send bounced with an ICMP
    /// port-unreachable; the datagram slot is empty.
    Refused,
    Err(Error),
}

pub trait RecvNonblocking {
    /// A single `recvfrom(2)` on a non-blocking datagram socket, with
    /// `EINTR` retried and `ECONNREFUSED` surfaced as
    /// [`DatagramStatus::Refused`].
    fn recv_nonblocking(&self, buf: &mut [u8]) -> DatagramStatus;
}

impl RecvNonblocking for UdpSocket {
    fn recv_nonblocking(&self, buf: &mut [u8]) -> DatagramStatus {
        loop {
            return match self.recv_from(buf) {
                Ok((len, peer)) => DatagramStatus::Success(len, peer),
                Err(err) if err.kind() == ErrorKind::WouldBlock => DatagramStatus::WouldBlock,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::ConnectionRefused => DatagramStatus::Refused,
                Err(err) => DatagramStatus::Err(err),
            };
        }
    }
}

/// Whether an `io::Error` carries the POSIX "datagram too long for the
/// protocol" condition, which `std` has no [`ErrorKind`] for.
pub fn is_msg_too_long(err: &Error) -> bool { err.raw_os_error() == Some(libc::EMSGSIZE) }

/// Whether a failed `connect(2)` merely reports that the attempt continues
/// in the background.
pub fn is_in_progress(err: &Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == ErrorKind::WouldBlock
}

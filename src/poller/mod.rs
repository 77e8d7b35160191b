// Callback-driven network reactor library.
//
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#[cfg(feature = "popol")]
pub mod popol;

use std::fmt::{self, Display, Formatter};
use std::io::{self, Read, Write};
use std::ops;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

/// A single I/O readiness condition reported for a descriptor.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Io {
    Read,
    Write,
}

/// Set of I/O conditions a descriptor is interested in - or ready for.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct IoType {
    /// Specifies whether I/O source has data to read.
    pub read: bool,
    /// Specifies whether I/O source is ready for write operations.
    pub write: bool,
}

impl IoType {
    pub fn none() -> Self { Self { read: false, write: false } }
    pub fn read_only() -> Self { Self { read: true, write: false } }
    pub fn write_only() -> Self { Self { read: false, write: true } }
    pub fn read_write() -> Self { Self { read: true, write: true } }

    pub fn is_none(self) -> bool { !self.read && !self.write }
    pub fn is_read_only(self) -> bool { self.read && !self.write }
    pub fn is_write_only(self) -> bool { !self.read && self.write }
    pub fn is_read_write(self) -> bool { self.read && self.write }
}

impl ops::Not for IoType {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self {
            read: !self.read,
            write: !self.write,
        }
    }
}

/// Yields the ready conditions one by one, write side first so that drained
/// buffers and completed connection attempts are observed before new input.
impl Iterator for IoType {
    type Item = Io;

    fn next(&mut self) -> Option<Self::Item> {
        if self.write {
            self.write = false;
            Some(Io::Write)
        } else if self.read {
            self.read = false;
            Some(Io::Read)
        } else {
            None
        }
    }
}

impl Display for IoType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("none")
        } else if self.is_read_write() {
            f.write_str("read-write")
        } else if self.read {
            f.write_str("read")
        } else if self.write {
            f.write_str("write")
        } else {
            unreachable!()
        }
    }
}

#[derive(Copy, Clone, Debug, Display, Error)]
#[display(doc_comments)]
pub enum IoFail {
    /// connection is absent (POSIX events {0:#b})
    Connectivity(i16),
    /// OS-level error (POSIX events {0:#b})
    Os(i16),
}

/// Abstraction of an OS I/O multiplexer (poll, epoll, kqueue etc).
///
/// After a successful [`Poll::poll`] the instance iterates over the fired
/// events as `(fd, Ok(ready))` or `(fd, Err(fail))` pairs. Events must be
/// fully drained before the next `poll` call.
pub trait Poll
where Self: Send + Iterator<Item = (RawFd, Result<IoType, IoFail>)>
{
    /// Waker flavour matching this poller backend.
    type Waker: Waker;

    /// Registers the read side of the reactor waker. The poller treats it as
    /// an ordinary read-interested descriptor; it is never unregistered for
    /// the whole lifetime of the poller.
    fn register_waker(&mut self, fd: &impl AsRawFd);

    fn register(&mut self, fd: &impl AsRawFd, interest: IoType);
    fn unregister(&mut self, fd: &impl AsRawFd);

    /// Updates the interest set for an already registered descriptor;
    /// returns whether the descriptor was known to the poller.
    fn set_interest(&mut self, fd: &impl AsRawFd, interest: IoType) -> bool;

    /// Blocks until at least one event fires or the timeout expires.
    /// `None` blocks indefinitely. Returns the number of events to drain.
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize>;
}

/// Sending half of a reactor waker: interrupts a blocking [`Poll::poll`] from
/// another thread.
///
/// Waking is level-based, not counted: any number of wakes before the loop
/// runs again collapses into a single wake-up.
pub trait WakerSend: Send + Sync {
    fn wake(&self) -> io::Result<()>;
}

/// Receiving half of a reactor waker, owned by the reactor loop and
/// registered with the poller alongside ordinary descriptors.
pub trait WakerRecv: AsRawFd + Send {
    /// Drains whatever the sending half has written so the descriptor stops
    /// reporting read-readiness.
    fn reset(&self);
}

/// Constructor for a matching pair of waker halves.
pub trait Waker {
    type Send: WakerSend + 'static;
    type Recv: WakerRecv + 'static;

    fn pair() -> io::Result<(Self::Send, Self::Recv)>;
}

/// Waker over a non-blocking UNIX socket pair.
///
/// The sender writes a single byte; a full kernel buffer means a wake-up is
/// already pending and counts as success.
pub struct SocketWaker;

impl Waker for SocketWaker {
    type Send = WakerSender;
    type Recv = WakerReceiver;

    fn pair() -> io::Result<(Self::Send, Self::Recv)> {
        let (tx, rx) = UnixStream::pair()?;
        tx.set_nonblocking(true)?;
        rx.set_nonblocking(true)?;
        Ok((WakerSender(Arc::new(tx)), WakerReceiver(rx)))
    }
}

#[derive(Clone)]
pub struct WakerSender(Arc<UnixStream>);

impl WakerSend for WakerSender {
    fn wake(&self) -> io::Result<()> {
        loop {
            match (&*self.0).write(&[0x1]) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct WakerReceiver(UnixStream);

impl WakerRecv for WakerReceiver {
    fn reset(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.0).read(&mut buf) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return,
            }
        }
    }
}

impl AsRawFd for WakerReceiver {
    fn as_raw_fd(&self) -> RawFd { self.0.as_raw_fd() }
}

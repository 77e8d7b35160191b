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

//! UDP machinery: bound datagram ports with optional connected mode.

use std::fmt::{self, Display, Formatter};
use std::io;
use std::net::{self, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::error::DatagramError;
use crate::nonblock::is_msg_too_long;
use crate::reactor::Handle;
use crate::registry::ResourceId;

/// Default upper bound of a single accepted datagram; larger ones are
/// truncated by the kernel.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 8192;

/// Largest payload a single IPv4 UDP datagram can carry; the kernel refuses
/// sends beyond it.
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// How many bytes one readiness event may deliver to a datagram protocol
/// before the port yields to other resources.
pub(crate) const MAX_READ_PER_EVENT: usize = 256 * 1024;

/// Extra options for datagram ports.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct UdpConfig {
    /// Receive buffer size per datagram; payloads beyond it are truncated.
    pub max_packet_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self { UdpConfig { max_packet_size: DEFAULT_MAX_PACKET_SIZE } }
}

/// A bound UDP socket delivering datagrams to a
/// [`DatagramProtocol`](crate::DatagramProtocol).
///
/// Sends are direct, unbuffered syscalls; a kernel push-back surfaces to the
/// caller as an ordinary I/O error instead of being queued.
pub struct UdpPort {
    socket: net::UdpSocket,
    addr: SocketAddr,
    peer: Option<SocketAddr>,
    max_packet_size: usize,
}

impl Display for UdpPort {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { Display::fmt(&self.addr, f) }
}

impl AsRawFd for UdpPort {
    fn as_raw_fd(&self) -> RawFd { self.socket.as_raw_fd() }
}

impl UdpPort {
    /// Binds a non-blocking datagram socket.
    pub(crate) fn bind(addr: SocketAddr, config: UdpConfig) -> io::Result<Self> {
        let socket = net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let addr = socket.local_addr()?;
        Ok(UdpPort { socket, addr, peer: None, max_packet_size: config.max_packet_size })
    }

    /// The actual bound address (with the OS-chosen port when bound to
    /// port zero).
    pub fn addr(&self) -> SocketAddr { self.addr }

    /// The remote address this port is connected to, if any.
    pub fn peer(&self) -> Option<SocketAddr> { self.peer }

    pub(crate) fn max_packet_size(&self) -> usize { self.max_packet_size }

    pub(crate) fn socket(&self) -> &net::UdpSocket { &self.socket }

    /// Sends one datagram to an explicit destination. Only valid on an
    /// unconnected port; oversized payloads are reported without being
    /// sent.
    pub fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> Result<(), DatagramError> {
        if self.peer.is_some() {
            return Err(DatagramError::AlreadyConnected);
        }
        loop {
            return match self.socket.send_to(datagram, dest) {
                Ok(_) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => Ok(()),
                Err(err) if is_msg_too_long(&err) => Err(DatagramError::TooLong {
                    len: datagram.len(),
                    max: MAX_DATAGRAM_SIZE,
                }),
                Err(err) => Err(DatagramError::Io(err)),
            };
        }
    }

    /// Sends one datagram to the connected remote address. A refusal of an
    /// earlier send surfaces through [`DatagramProtocol::connection_refused`]
    /// rather than here.
    ///
    /// [`DatagramProtocol::connection_refused`]: crate::DatagramProtocol::connection_refused
    pub fn send(&self, datagram: &[u8]) -> Result<(), DatagramError> {
        if self.peer.is_none() {
            return Err(DatagramError::NotConnected);
        }
        loop {
            return match self.socket.send(datagram) {
                Ok(_) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                // A previous send bounced; the refusal belongs to
                // `DatagramProtocol::connection_refused`, not to this call.
                Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => Ok(()),
                Err(err) if is_msg_too_long(&err) => Err(DatagramError::TooLong {
                    len: datagram.len(),
                    max: MAX_DATAGRAM_SIZE,
                }),
                Err(err) => Err(DatagramError::Io(err)),
            };
        }
    }

    /// Restricts the port to exchanging datagrams with a single remote
    /// address. From now on [`UdpPort::send`] is the way to transmit, and
    /// ICMP refusals of previous sends are reported to the protocol.
    pub fn connect(&mut self, peer: SocketAddr) -> Result<(), DatagramError> {
        if self.peer.is_some() {
            return Err(DatagramError::AlreadyConnected);
        }
        self.socket.connect(peer)?;
        self.peer = Some(peer);
        Ok(())
    }
}

/// Handle for a bound datagram port, returned by
/// [`Handle::listen_udp`](crate::Handle::listen_udp).
#[derive(Clone)]
pub struct UdpListeningPort {
    id: ResourceId,
    addr: SocketAddr,
    reactor: Handle,
}

impl UdpListeningPort {
    pub(crate) fn new(id: ResourceId, addr: SocketAddr, reactor: Handle) -> Self {
        UdpListeningPort { id, addr, reactor }
    }

    /// The actual bound address.
    pub fn addr(&self) -> SocketAddr { self.addr }

    /// Asks the reactor to close the port. The protocol's `stopped` hook
    /// fires once the port is gone. Repeated stops are no-ops.
    pub fn stop_listening(&self) -> io::Result<()> { self.reactor.close_resource(self.id) }
}

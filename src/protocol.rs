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

//! Traits connecting application code to the reactor: stream protocols and
//! their factories, datagram protocols, and write-side producers.

use std::net::SocketAddr;

use crate::error::Reason;
use crate::tcp::TcpTransport;
use crate::udp::UdpPort;

/// Stateful handler of a single stream connection.
///
/// All methods are called on the reactor loop thread. The transport passed in
/// is the same connection the event belongs to; calls on it (writes, close
/// requests, producer registration) take effect without leaving the loop.
pub trait Protocol: Send {
    /// Called exactly once, as soon as the connection is established and
    /// registered; no other callback of this protocol can precede it.
    fn connection_made(&mut self, _transport: &mut TcpTransport) {}

    /// Called whenever a chunk of bytes arrives. The reactor gives no
    /// framing guarantees whatsoever; `data` is never empty.
    fn data_received(&mut self, transport: &mut TcpTransport, data: &[u8]);

    /// The peer has shut down its sending direction (half-close). The
    /// default reaction closes the whole connection; override to keep
    /// writing on the still-open direction.
    fn read_connection_lost(&mut self, transport: &mut TcpTransport) {
        transport.lose_connection();
    }

    /// Our sending direction was shut down after
    /// [`TcpTransport::lose_write_connection`] drained the buffer. The
    /// default reaction closes the whole connection; override to keep
    /// reading on the still-open direction.
    fn write_connection_lost(&mut self, transport: &mut TcpTransport) {
        transport.lose_connection();
    }

    /// Called exactly once when the connection is gone, with the reason why.
    /// No further callbacks follow; the transport no longer exists.
    fn connection_lost(&mut self, _reason: Reason) {}
}

/// Constructor of [`Protocol`] instances for accepted server connections.
pub trait Factory: Send {
    /// Called for every connection accepted on a listening port the factory
    /// is attached to. Returning `None` rejects the connection: its socket
    /// is closed at once and no protocol callback ever runs for it.
    fn build_protocol(&mut self, peer: SocketAddr) -> Option<Box<dyn Protocol>>;

    /// Called exactly once when the listening port the factory was attached
    /// to is closed, whether by `stop_listening` or by reactor shutdown. No
    /// further connections will be built. Connections already accepted are
    /// unaffected.
    fn stopped_listening(&mut self) {}
}

/// Constructor of [`Protocol`] instances for outbound connections, also
/// receiving the outcome of the connection attempt itself.
pub trait ClientFactory: Factory {
    /// The connection attempt failed before any protocol was built: refused,
    /// timed out, could not bind, or failed with another OS error.
    fn connection_failed(&mut self, reason: Reason);

    /// A connection previously built by this factory has terminated.
    /// Useful for reconnect policies; default does nothing.
    fn connection_lost(&mut self, _reason: Reason) {}
}

/// Stateful handler of a datagram port.
///
/// All methods are called on the reactor loop thread.
pub trait DatagramProtocol: Send {
    /// Called exactly once when the port is bound and registered.
    fn started(&mut self, _port: &mut UdpPort) {}

    /// A datagram arrived. Datagram boundaries are preserved; `data` is the
    /// whole payload, possibly empty (zero-length datagrams are legal).
    fn datagram_received(&mut self, port: &mut UdpPort, data: &[u8], peer: SocketAddr);

    /// On a connected port, a previous send bounced with an ICMP
    /// port-unreachable. Unconnected ports never report this.
    fn connection_refused(&mut self, _port: &mut UdpPort) {}

    /// Called exactly once when the port is torn down; the port no longer
    /// exists afterwards.
    fn stopped(&mut self) {}
}

/// Source of outgoing data subject to backpressure from a transport.
///
/// A *streaming* producer (registered with `streaming = true`) pushes data on
/// its own and is told to pause whenever the transport write buffer grows
/// beyond the high-water mark, then to resume once the buffer fully drains.
/// A *non-streaming* producer writes only when asked: `resume_producing` is
/// its request for the next batch, issued every time the buffer empties.
pub trait Producer: Send {
    /// Back off: the transport buffer is above the high-water mark. Only
    /// streaming producers receive this.
    fn pause_producing(&mut self) {}

    /// Produce more data: the transport buffer has fully drained.
    fn resume_producing(&mut self);

    /// The transport is gone (connection closed or failed); no more data
    /// will ever be accepted.
    fn stop_producing(&mut self) {}
}

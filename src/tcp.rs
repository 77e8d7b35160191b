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

//! TCP machinery: buffered stream transports, listening ports and outbound
//! connection attempts.

use std::fmt::{self, Display, Formatter};
use std::io;
use std::net::{self, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use socket2::{Domain, SockRef, Socket, Type};

use crate::error::{DuplicateProducer, Reason};
use crate::nonblock::{IoStatus, ReadNonblocking, WriteNonblocking, is_in_progress};
use crate::poller::IoType;
use crate::protocol::{ClientFactory, Factory, Producer, Protocol};
use crate::reactor::Handle;
use crate::registry::ResourceId;
use crate::scheduler::Timestamp;

/// Size of the scratch buffer a reactor reads stream data into; also the
/// upper bound of a single `data_received` chunk.
pub const READ_BUFFER_SIZE: usize = 65536;

/// Write buffer level above which a registered streaming producer is told to
/// pause. The corresponding low-water mark is zero: the producer resumes
/// only once the buffer has fully drained.
pub const WRITE_HIGH_WATER: usize = 65536;

/// Default listen queue depth.
pub const DEFAULT_BACKLOG: i32 = 50;

/// Default timeout for outbound connection attempts.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// Consumed write buffer prefix is compacted once it grows past this.
const COMPACT_THRESHOLD: usize = 128 * 1024;

// Accept budget adaptation, see `ListenerState::accept_batch`.
const INITIAL_ACCEPT_BUDGET: usize = 100;
const ACCEPT_BUDGET_GROWTH: usize = 20;

/// Extra options for listening ports.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ListenConfig {
    /// Depth of the kernel queue of not-yet-accepted connections.
    pub backlog: i32,
}

impl Default for ListenConfig {
    fn default() -> Self { ListenConfig { backlog: DEFAULT_BACKLOG } }
}

/// Extra options for outbound connection attempts.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ConnectConfig {
    /// Give up on the attempt after this long; `None` leaves it to the OS.
    pub timeout: Option<Duration>,
    /// Local address to bind before connecting.
    pub bind: Option<SocketAddr>,
}

impl Default for ConnectConfig {
    fn default() -> Self { ConnectConfig { timeout: Some(DEFAULT_CONNECT_TIMEOUT), bind: None } }
}

/// Result of draining a transport write buffer towards the socket.
pub(crate) enum FlushStatus {
    /// The buffer is empty.
    Drained,
    /// Bytes remain; the kernel will report write-readiness when it can
    /// take more.
    Partial,
    Err(io::Error),
}

/// An established TCP connection: a non-blocking socket plus the write
/// buffer, close intentions and producer hook-up which make up the
/// per-connection state machine.
///
/// Writes never block and never fail: data is appended to an internal buffer
/// which the reactor drains as the kernel accepts it. Write errors surface
/// asynchronously through [`Protocol::connection_lost`].
pub struct TcpTransport {
    stream: net::TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    session: Option<u64>,
    buffer: Vec<u8>,
    cursor: usize,
    disconnecting: bool,
    write_disconnecting: bool,
    write_disconnected: bool,
    read_disconnected: bool,
    aborted: bool,
    producer: Option<Box<dyn Producer>>,
    streaming: bool,
    producer_paused: bool,
}

impl Display for TcpTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.session {
            Some(session) => write!(f, "{}#{session}", self.peer),
            None => Display::fmt(&self.peer, f),
        }
    }
}

impl AsRawFd for TcpTransport {
    fn as_raw_fd(&self) -> RawFd { self.stream.as_raw_fd() }
}

impl TcpTransport {
    pub(crate) fn new(
        stream: net::TcpStream,
        peer: SocketAddr,
        local: SocketAddr,
        session: Option<u64>,
    ) -> Self {
        TcpTransport {
            stream,
            peer,
            local,
            session,
            buffer: Vec::new(),
            cursor: 0,
            disconnecting: false,
            write_disconnecting: false,
            write_disconnected: false,
            read_disconnected: false,
            aborted: false,
            producer: None,
            streaming: false,
            producer_paused: false,
        }
    }

    /// Address of the remote end of the connection.
    pub fn peer_addr(&self) -> SocketAddr { self.peer }

    /// Address of the local end of the connection.
    pub fn local_addr(&self) -> SocketAddr { self.local }

    /// Server-side session number of the connection, assigned sequentially
    /// per listening port. `None` for outbound connections.
    pub fn session(&self) -> Option<u64> { self.session }

    /// Queues `data` for delivery, in order after everything previously
    /// written. Never blocks; after a close has been requested the data is
    /// silently discarded instead.
    pub fn write(&mut self, data: &[u8]) {
        if self.closing() || self.write_disconnected || data.is_empty() {
            return;
        }
        self.buffer.extend_from_slice(data);
        if self.streaming && !self.producer_paused && self.buffered() > WRITE_HIGH_WATER {
            if let Some(producer) = &mut self.producer {
                self.producer_paused = true;
                producer.pause_producing();
            }
        }
    }

    /// Number of queued bytes not yet handed to the kernel.
    pub fn buffered(&self) -> usize { self.buffer.len() - self.cursor }

    /// Requests an orderly close: reading stops immediately, queued data is
    /// still delivered, and once the buffer drains the socket is closed and
    /// [`Protocol::connection_lost`] fires with [`Reason::Done`].
    /// Idempotent.
    pub fn lose_connection(&mut self) { self.disconnecting = true; }

    /// Requests a half-close of the sending direction: once the buffer
    /// drains, the write side shuts down and
    /// [`Protocol::write_connection_lost`] fires. Reading continues.
    pub fn lose_write_connection(&mut self) {
        if self.write_disconnected {
            return;
        }
        self.write_disconnecting = true;
    }

    /// Drops the connection immediately: queued data is discarded, the peer
    /// sees a reset instead of an orderly close, and
    /// [`Protocol::connection_lost`] fires with [`Reason::Aborted`].
    pub fn abort_connection(&mut self) {
        // Linger zero turns the close(2) into an RST.
        let _ = SockRef::from(&self.stream).set_linger(Some(Duration::ZERO));
        self.aborted = true;
    }

    /// Disables (or re-enables) Nagle coalescing on the underlying socket.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> { self.stream.set_nodelay(nodelay) }

    /// Attaches a producer feeding this transport, subjecting it to the
    /// buffer backpressure contract described on [`Producer`]. Errors if a
    /// producer is already attached. A non-streaming producer is asked for
    /// its first batch right away.
    pub fn register_producer(
        &mut self,
        mut producer: Box<dyn Producer>,
        streaming: bool,
    ) -> Result<(), DuplicateProducer> {
        if self.producer.is_some() {
            return Err(DuplicateProducer);
        }
        if !streaming {
            producer.resume_producing();
        }
        self.streaming = streaming;
        self.producer_paused = false;
        self.producer = Some(producer);
        Ok(())
    }

    /// Detaches the currently registered producer, if any.
    pub fn unregister_producer(&mut self) {
        self.producer = None;
        self.producer_paused = false;
    }

    fn closing(&self) -> bool { self.disconnecting || self.write_disconnecting || self.aborted }

    /// One non-blocking read into `buf`; marks the read side gone on EOF.
    pub(crate) fn handle_read(&mut self, buf: &mut [u8]) -> IoStatus {
        let status = self.stream.read_nonblocking(buf);
        if let IoStatus::Shutdown = status {
            self.read_disconnected = true;
        }
        status
    }

    /// Pushes buffered data into the kernel until the buffer drains or the
    /// kernel pushes back. Fully draining wakes the registered producer.
    pub(crate) fn flush(&mut self) -> FlushStatus {
        let was_empty = self.buffered() == 0;
        while self.buffered() > 0 {
            match self.stream.write_nonblocking(&self.buffer[self.cursor..]) {
                IoStatus::Success(written) => {
                    self.cursor += written;
                    if self.cursor >= COMPACT_THRESHOLD && self.buffered() > 0 {
                        self.buffer.drain(..self.cursor);
                        self.cursor = 0;
                    }
                }
                IoStatus::WouldBlock => return FlushStatus::Partial,
                IoStatus::Shutdown => unreachable!("writes never report EOF"),
                IoStatus::Err(err) => return FlushStatus::Err(err),
            }
        }
        self.buffer.clear();
        self.cursor = 0;
        if !was_empty {
            self.buffer_emptied();
        }
        FlushStatus::Drained
    }

    fn buffer_emptied(&mut self) {
        if let Some(producer) = &mut self.producer {
            if !self.streaming {
                producer.resume_producing();
            } else if self.producer_paused {
                self.producer_paused = false;
                producer.resume_producing();
            }
        }
    }

    /// The interest set the reactor should poll this connection with.
    pub(crate) fn interests(&self) -> IoType {
        if self.aborted {
            return IoType::none();
        }
        IoType {
            read: !self.read_disconnected && !self.disconnecting,
            write: !self.write_disconnected
                && (self.buffered() > 0 || self.disconnecting || self.write_disconnecting),
        }
    }

    /// Whether the buffer has drained far enough to complete a requested
    /// orderly close, the connection was aborted, or both directions are
    /// gone on their own (EOF after a completed write half-close).
    pub(crate) fn ready_to_close(&self) -> bool {
        self.aborted
            || (self.disconnecting && (self.buffered() == 0 || self.write_disconnected))
            || (self.read_disconnected && self.write_disconnected)
    }

    /// Whether a requested half-close can now shut the write direction down.
    pub(crate) fn ready_to_shut_write(&self) -> bool {
        self.write_disconnecting && !self.write_disconnected && self.buffered() == 0
    }

    pub(crate) fn is_read_disconnected(&self) -> bool { self.read_disconnected }

    pub(crate) fn is_disconnecting(&self) -> bool { self.disconnecting }

    /// Performs the actual half-close after [`Self::ready_to_shut_write`].
    pub(crate) fn shutdown_write(&mut self) -> io::Result<()> {
        self.write_disconnecting = false;
        self.write_disconnected = true;
        self.stream.shutdown(net::Shutdown::Write)
    }

    pub(crate) fn close_reason(&self) -> Reason {
        if self.aborted {
            Reason::Aborted
        } else {
            Reason::Done
        }
    }

    /// Detaches the producer at teardown so it can be told to stop.
    pub(crate) fn take_producer(&mut self) -> Option<Box<dyn Producer>> { self.producer.take() }
}

/// A bound and listening TCP socket together with the factory producing
/// protocols for the connections it accepts.
pub(crate) struct ListenerState {
    listener: net::TcpListener,
    factory: Box<dyn Factory>,
    addr: SocketAddr,
    accept_budget: usize,
    sessions: u64,
}

impl AsRawFd for ListenerState {
    fn as_raw_fd(&self) -> RawFd { self.listener.as_raw_fd() }
}

impl ListenerState {
    /// Binds a listening socket with `SO_REUSEADDR`, in non-blocking mode.
    pub fn bind(
        addr: SocketAddr,
        config: ListenConfig,
        factory: Box<dyn Factory>,
    ) -> io::Result<Self> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(config.backlog)?;
        let listener = net::TcpListener::from(socket);
        let addr = listener.local_addr()?;
        Ok(ListenerState {
            listener,
            factory,
            addr,
            accept_budget: INITIAL_ACCEPT_BUDGET,
            sessions: 0,
        })
    }

    /// The actual bound address (with the OS-chosen port when bound to
    /// port zero).
    pub fn addr(&self) -> SocketAddr { self.addr }

    pub fn into_factory(self) -> Box<dyn Factory> { self.factory }

    /// Accepts queued connections and builds their transport/protocol
    /// pairs, up to an adaptive budget: draining the kernel queue early
    /// shrinks the budget to the observed batch size, while exhausting the
    /// budget grows it for the next round. Factories refusing a peer
    /// (`build_protocol` returning `None`) close the socket on the spot.
    ///
    /// A failed `accept(2)` ends the batch and is returned alongside the
    /// connections accepted before it; the listening port itself stays up.
    pub fn accept_batch(
        &mut self,
    ) -> (Vec<(TcpTransport, Box<dyn Protocol>)>, Option<io::Error>) {
        let mut accepted = Vec::new();
        for count in 0..self.accept_budget {
            let (stream, peer) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.accept_budget = count.max(1);
                    return (accepted, None);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return (accepted, Some(err)),
            };
            if let Err(err) = stream.set_nonblocking(true) {
                return (accepted, Some(err));
            }
            let Some(protocol) = self.factory.build_protocol(peer) else {
                continue;
            };
            let local = stream.local_addr().unwrap_or(self.addr);
            self.sessions += 1;
            let transport = TcpTransport::new(stream, peer, local, Some(self.sessions));
            accepted.push((transport, protocol));
        }
        self.accept_budget += ACCEPT_BUDGET_GROWTH;
        (accepted, None)
    }
}

/// An outbound connection attempt in flight: the socket has issued a
/// non-blocking `connect(2)` and waits for the kernel to report the outcome
/// through write-readiness.
pub(crate) struct PendingConnect {
    socket: Socket,
    addr: SocketAddr,
    factory: Box<dyn ClientFactory>,
    deadline: Option<Timestamp>,
}

/// What `connect_tcp` hands over to the reactor loop: either an attempt in
/// flight, or an attempt which already failed at launch (bind or connect
/// refused synchronously) and only needs its failure reported from the loop.
pub(crate) enum ConnectLaunch {
    Started(PendingConnect),
    Failed { factory: Box<dyn ClientFactory>, error: io::Error },
}

impl AsRawFd for PendingConnect {
    fn as_raw_fd(&self) -> RawFd { self.socket.as_raw_fd() }
}

impl PendingConnect {
    /// Creates the socket and issues the non-blocking `connect(2)`.
    ///
    /// Failure to create the socket itself errors synchronously; bind and
    /// connect failures travel with the returned launch so they reach the
    /// factory as [`ClientFactory::connection_failed`], the same way
    /// asynchronous failures do.
    pub fn launch(
        addr: SocketAddr,
        config: ConnectConfig,
        factory: Box<dyn ClientFactory>,
    ) -> io::Result<ConnectLaunch> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_nonblocking(true)?;
        if let Some(bind) = config.bind {
            if let Err(error) = socket.bind(&bind.into()) {
                return Ok(ConnectLaunch::Failed { factory, error });
            }
        }
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(err) if is_in_progress(&err) => {}
            Err(error) => return Ok(ConnectLaunch::Failed { factory, error }),
        }
        let deadline = config.timeout.map(|timeout| Timestamp::now() + timeout);
        Ok(ConnectLaunch::Started(PendingConnect { socket, addr, factory, deadline }))
    }

    pub fn addr(&self) -> SocketAddr { self.addr }

    pub fn deadline(&self) -> Option<Timestamp> { self.deadline }

    pub fn into_factory(self) -> Box<dyn ClientFactory> { self.factory }

    /// Resolves the attempt once the socket reported write-readiness (or an
    /// error condition): either a connected stream ready to become a
    /// transport, or the OS error that sank the attempt.
    pub fn complete(self) -> (Box<dyn ClientFactory>, Result<(net::TcpStream, SocketAddr), io::Error>) {
        match self.socket.take_error() {
            Ok(Some(error)) => return (self.factory, Err(error)),
            Ok(None) => {}
            Err(error) => return (self.factory, Err(error)),
        }
        let stream = net::TcpStream::from(self.socket);
        match stream.local_addr() {
            Ok(local) => (self.factory, Ok((stream, local))),
            Err(error) => (self.factory, Err(error)),
        }
    }
}

/// Handle for a listening TCP port, returned by
/// [`Handle::listen_tcp`](crate::Handle::listen_tcp).
#[derive(Clone)]
pub struct ListeningPort {
    id: ResourceId,
    addr: SocketAddr,
    reactor: Handle,
}

impl ListeningPort {
    pub(crate) fn new(id: ResourceId, addr: SocketAddr, reactor: Handle) -> Self {
        ListeningPort { id, addr, reactor }
    }

    /// The actual bound address, including the OS-chosen port when the
    /// request was for port zero.
    pub fn addr(&self) -> SocketAddr { self.addr }

    /// Asks the reactor to stop accepting and close the listening socket.
    /// Established connections are unaffected. Teardown happens on the loop
    /// thread; [`Factory::stopped_listening`](crate::Factory::stopped_listening)
    /// signals its completion. Safe to call from any thread and at any time;
    /// repeated stops are no-ops.
    pub fn stop_listening(&self) -> io::Result<()> { self.reactor.close_resource(self.id) }
}

/// Handle for an outbound connection attempt, returned by
/// [`Handle::connect_tcp`](crate::Handle::connect_tcp).
#[derive(Clone)]
pub struct Connector {
    id: ResourceId,
    addr: SocketAddr,
    reactor: Handle,
}

impl Connector {
    pub(crate) fn new(id: ResourceId, addr: SocketAddr, reactor: Handle) -> Self {
        Connector { id, addr, reactor }
    }

    /// The remote address the attempt is directed at.
    pub fn addr(&self) -> SocketAddr { self.addr }

    /// Abandons the attempt if it is still in flight; the factory learns of
    /// it through [`ClientFactory::connection_failed`] with
    /// [`Reason::Aborted`]. A no-op once the attempt has concluded either
    /// way.
    pub fn stop_connecting(&self) -> io::Result<()> { self.reactor.close_resource(self.id) }
}

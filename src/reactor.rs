// Callback-driven network reactor library.
//
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! The reactor event loop and its thread-safe control handle.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel as chan;

use crate::error::{CannotListen, NotRunning, Reason};
use crate::nonblock::{DatagramStatus, IoStatus, RecvNonblocking};
use crate::poller::{Io, IoFail, IoType, Poll, Waker, WakerRecv, WakerSend};
use crate::protocol::{ClientFactory, DatagramProtocol, Factory, Protocol};
use crate::registry::{Kind, Registry, ResourceId};
use crate::scheduler::{Callback, DelayedCall, ScheduledCall, Scheduler, Timestamp};
use crate::tcp::{
    ConnectConfig, ConnectLaunch, Connector, FlushStatus, ListenConfig, ListenerState,
    ListeningPort, PendingConnect, READ_BUFFER_SIZE, TcpTransport,
};
use crate::udp::{MAX_READ_PER_EVENT, UdpConfig, UdpListeningPort, UdpPort};

/// Control messages travelling from [`Handle`]s to the reactor loop.
pub(crate) enum Ctl {
    Schedule { at: Timestamp, call: ScheduledCall },
    FromThread(Callback),
    OnShutdown(Callback),
    Listen(ResourceId, ListenerState),
    Connect(ResourceId, ConnectLaunch),
    ListenUdp(ResourceId, UdpPort, Box<dyn DatagramProtocol>),
    Close(ResourceId),
    Shutdown,
}

impl Display for Ctl {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Ctl::Schedule { at, .. } => write!(f, "schedule({at})"),
            Ctl::FromThread(_) => f.write_str("from_thread"),
            Ctl::OnShutdown(_) => f.write_str("on_shutdown"),
            Ctl::Listen(id, _) => write!(f, "listen({id})"),
            Ctl::Connect(id, _) => write!(f, "connect({id})"),
            Ctl::ListenUdp(id, _, _) => write!(f, "listen_udp({id})"),
            Ctl::Close(id) => write!(f, "close({id})"),
            Ctl::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Thread-safe control surface of a reactor.
///
/// Cloneable and sendable; every method may be called from any thread, including from protocol
/// callbacks on the loop thread itself. Requests are queued to the loop, which is then woken, so
/// their effects are applied asynchronously, in submission order.
///
/// Methods returning [`io::Result`] fail with [`io::ErrorKind::BrokenPipe`] once the reactor has
/// shut down.
#[derive(Clone)]
pub struct Handle {
    ctl: chan::Sender<Ctl>,
    waker: Arc<dyn WakerSend>,
    next_id: Arc<AtomicU64>,
    stopped: Arc<AtomicBool>,
}

impl Handle {
    fn send(&self, ctl: Ctl) -> io::Result<()> {
        self.ctl.send(ctl).map_err(|_| io::ErrorKind::BrokenPipe)?;
        self.waker.wake()
    }

    fn next_id(&self) -> ResourceId { ResourceId::new(self.next_id.fetch_add(1, Ordering::Relaxed)) }

    /// Schedules `callable` to run on the loop thread after `delay`. Equal deadlines fire in
    /// scheduling order.
    ///
    /// The returned handle can cancel the call or query whether it is still pending.
    pub fn call_later(
        &self,
        delay: Duration,
        callable: impl FnOnce() + Send + 'static,
    ) -> io::Result<DelayedCall> {
        let (handle, call) = ScheduledCall::new(Box::new(callable));
        let at = Timestamp::now() + delay;
        self.send(Ctl::Schedule { at, call })?;
        Ok(handle)
    }

    /// Runs `callable` on the loop thread as soon as possible. This is the one safe way for
    /// foreign threads to touch reactor-owned state.
    pub fn call_from_thread(&self, callable: impl FnOnce() + Send + 'static) -> io::Result<()> {
        self.send(Ctl::FromThread(Box::new(callable)))
    }

    /// Registers a hook to run on the loop thread when the reactor shuts down, before any
    /// connection is torn down. Hooks run in registration order.
    pub fn call_on_shutdown(&self, hook: impl FnOnce() + Send + 'static) -> io::Result<()> {
        self.send(Ctl::OnShutdown(Box::new(hook)))
    }

    /// Binds a TCP listening socket at `addr` and starts accepting connections, building a
    /// protocol for each accepted peer via `factory`.
    ///
    /// Binding happens synchronously: the returned port carries the actual bound address even
    /// when `addr` requested port zero.
    pub fn listen_tcp(
        &self,
        addr: SocketAddr,
        factory: impl Factory + 'static,
    ) -> Result<ListeningPort, CannotListen> {
        self.listen_tcp_with(addr, factory, ListenConfig::default())
    }

    /// [`Handle::listen_tcp`] with explicit listening options.
    pub fn listen_tcp_with(
        &self,
        addr: SocketAddr,
        factory: impl Factory + 'static,
        config: ListenConfig,
    ) -> Result<ListeningPort, CannotListen> {
        let listener = ListenerState::bind(addr, config, Box::new(factory))
            .map_err(|error| CannotListen { addr, error })?;
        let bound = listener.addr();
        let id = self.next_id();
        self.send(Ctl::Listen(id, listener))
            .map_err(|error| CannotListen { addr: bound, error })?;
        Ok(ListeningPort::new(id, bound, self.clone()))
    }

    /// Starts a non-blocking connection attempt towards `addr`. The outcome arrives through the
    /// factory: a protocol is built and gets `connection_made` on success,
    /// [`ClientFactory::connection_failed`] fires otherwise.
    ///
    /// This call errors only when the socket itself cannot be created or the reactor is gone.
    pub fn connect_tcp(
        &self,
        addr: SocketAddr,
        factory: impl ClientFactory + 'static,
    ) -> io::Result<Connector> {
        self.connect_tcp_with(addr, factory, ConnectConfig::default())
    }

    /// [`Handle::connect_tcp`] with an explicit timeout and local binding.
    pub fn connect_tcp_with(
        &self,
        addr: SocketAddr,
        factory: impl ClientFactory + 'static,
        config: ConnectConfig,
    ) -> io::Result<Connector> {
        let launch = PendingConnect::launch(addr, config, Box::new(factory))?;
        let id = self.next_id();
        self.send(Ctl::Connect(id, launch))?;
        Ok(Connector::new(id, addr, self.clone()))
    }

    /// Binds a UDP port at `addr` and starts delivering its datagrams to `protocol`. Binding
    /// happens synchronously, like for [`Handle::listen_tcp`].
    pub fn listen_udp(
        &self,
        addr: SocketAddr,
        protocol: impl DatagramProtocol + 'static,
    ) -> Result<UdpListeningPort, CannotListen> {
        self.listen_udp_with(addr, protocol, UdpConfig::default())
    }

    /// [`Handle::listen_udp`] with explicit datagram options.
    pub fn listen_udp_with(
        &self,
        addr: SocketAddr,
        protocol: impl DatagramProtocol + 'static,
        config: UdpConfig,
    ) -> Result<UdpListeningPort, CannotListen> {
        let port = UdpPort::bind(addr, config).map_err(|error| CannotListen { addr, error })?;
        let bound = port.addr();
        let id = self.next_id();
        self.send(Ctl::ListenUdp(id, port, Box::new(protocol)))
            .map_err(|error| CannotListen { addr: bound, error })?;
        Ok(UdpListeningPort::new(id, bound, self.clone()))
    }

    /// Requests reactor termination. The loop finishes its current iteration, runs the shutdown
    /// hooks, tears down every remaining resource (their protocols see [`Reason::Shutdown`]) and
    /// returns from [`Reactor::run`].
    ///
    /// Stopping an already stopped reactor is an error.
    pub fn stop(&self) -> Result<(), NotRunning> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(NotRunning);
        }
        self.send(Ctl::Shutdown).map_err(|_| NotRunning)
    }

    /// Enqueues closing of a listening port, connection attempt or datagram port.
    pub(crate) fn close_resource(&self, id: ResourceId) -> io::Result<()> {
        self.send(Ctl::Close(id))
    }
}

struct TransportEntry {
    transport: TcpTransport,
    protocol: Box<dyn Protocol>,
    /// Present for outbound connections: the factory which built the protocol, kept for its
    /// `connection_lost` notification.
    client: Option<Box<dyn ClientFactory>>,
}

struct DatagramEntry {
    port: UdpPort,
    protocol: Box<dyn DatagramProtocol>,
}

enum ReadOutcome {
    /// Data was delivered to the protocol; more may be queued in the kernel.
    Progress,
    /// Nothing to read, or reading is over for this transport.
    Idle,
    /// The transport was torn down.
    Gone,
}

/// A single-threaded callback-driven I/O event loop.
///
/// The reactor multiplexes listening sockets, stream connections, datagram ports and timers over
/// one OS poller and dispatches their events to [`Protocol`] implementations. All callbacks run
/// on the thread which called [`Reactor::run`]; other threads talk to the loop through cloned
/// [`Handle`]s, which wake it via a socket pair registered alongside the ordinary descriptors.
pub struct Reactor<P: Poll> {
    poller: P,
    waker: <P::Waker as Waker>::Recv,
    handle: Handle,
    ctl: chan::Receiver<Ctl>,
    registry: Registry,
    scheduler: Scheduler,
    listeners: HashMap<ResourceId, ListenerState>,
    transports: HashMap<ResourceId, TransportEntry>,
    connects: HashMap<ResourceId, PendingConnect>,
    datagrams: HashMap<ResourceId, DatagramEntry>,
    shutdown_hooks: Vec<Callback>,
    stopping: bool,
    read_buf: Vec<u8>,
}

#[cfg(feature = "popol")]
impl Reactor<crate::poller::popol::Poller> {
    /// Creates a reactor over the default `poll(2)`-based multiplexer.
    pub fn with_popol() -> io::Result<Self> { Reactor::new(crate::poller::popol::Poller::new()) }
}

impl<P: Poll> Reactor<P> {
    /// Creates a reactor over the given poller. The waker pair is created here and its read side
    /// is registered before any other descriptor.
    pub fn new(mut poller: P) -> io::Result<Self> {
        let (waker_send, waker_recv) = <P::Waker as Waker>::pair()?;
        let (ctl_send, ctl_recv) = chan::unbounded();

        #[cfg(feature = "log")]
        log::debug!(target: "reactor", "Registering waker (fd {})", waker_recv.as_raw_fd());
        poller.register_waker(&waker_recv);

        let handle = Handle {
            ctl: ctl_send,
            waker: Arc::new(waker_send),
            next_id: Arc::new(AtomicU64::new(1)),
            stopped: Arc::new(AtomicBool::new(false)),
        };
        Ok(Reactor {
            poller,
            waker: waker_recv,
            handle,
            ctl: ctl_recv,
            registry: Registry::new(),
            scheduler: Scheduler::new(),
            listeners: empty!(),
            transports: empty!(),
            connects: empty!(),
            datagrams: empty!(),
            shutdown_hooks: Vec::new(),
            stopping: false,
            read_buf: vec![0u8; READ_BUFFER_SIZE],
        })
    }

    /// A control handle for this reactor; clone it freely.
    pub fn handle(&self) -> Handle { self.handle.clone() }

    /// Runs the event loop on the calling thread until [`Handle::stop`] is requested (clean exit)
    /// or the poller fails fatally (the error is returned). Either way every remaining resource
    /// is torn down and the shutdown hooks run before this returns.
    pub fn run(mut self) -> io::Result<()> {
        #[cfg(feature = "log")]
        log::info!(target: "reactor", "Entering reactor event loop");

        let result = self.run_loop();
        self.finish_shutdown();
        self.handle.stopped.store(true, Ordering::SeqCst);
        result
    }

    fn run_loop(&mut self) -> io::Result<()> {
        loop {
            self.sync_interests();

            let now = Timestamp::now();
            let mut deadline = self.scheduler.next_deadline();
            for pending in self.connects.values() {
                match (deadline, pending.deadline()) {
                    (Some(cur), Some(at)) if at < cur => deadline = Some(at),
                    (None, Some(at)) => deadline = Some(at),
                    _ => {}
                }
            }
            let timeout = deadline.map(|at| at.duration_since(now));

            let resources = self.registry.len();
            #[cfg(feature = "log")]
            log::trace!(target: "reactor", "Polling {resources} resources with timeout {timeout:?}");

            match self.poller.poll(timeout) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::error!(target: "reactor", "Polling has failed: {err}");
                    return Err(err);
                }
            }

            let awoken = self.dispatch_events();
            if awoken {
                self.drain_ctl();
            }

            let now = Timestamp::now();
            for call in self.scheduler.expire(now) {
                call.invoke();
            }

            self.sweep_connect_timeouts(now);
            self.sweep_transports();

            if self.stopping {
                return Ok(());
            }
        }
    }

    /// Refreshes the registry with the current interest of every connection, then pushes the
    /// whole interest ledger down to the poller, so that state changed by callbacks during the
    /// previous iteration is reflected before the next blocking poll.
    ///
    /// Listeners, connection attempts and datagram ports keep the constant interest they were
    /// registered with; only established connections change theirs over time.
    fn sync_interests(&mut self) {
        let registry = &mut self.registry;
        for (id, entry) in &self.transports {
            registry.set_interest(*id, entry.transport.interests());
        }
        let poller = &mut self.poller;
        for (fd, interest) in registry.interests() {
            poller.set_interest(&fd, interest);
        }
    }

    /// Drains fired events from the poller and dispatches them. Returns whether one of them was
    /// a wake-up from a [`Handle`].
    fn dispatch_events(&mut self) -> bool {
        let mut awoken = false;
        let waker_fd = self.waker.as_raw_fd();

        while let Some((fd, res)) = self.poller.next() {
            if fd == waker_fd {
                if let Err(err) = res {
                    #[cfg(feature = "log")]
                    log::error!(target: "reactor", "Polling waker has failed: {err}");
                    panic!("waker failure: {err}");
                }
                #[cfg(feature = "log")]
                log::trace!(target: "reactor", "Awoken by a reactor handle");
                self.waker.reset();
                awoken = true;
                continue;
            }

            let Some((id, kind)) = self.registry.resolve(fd) else {
                // The owner was unregistered earlier in this very batch.
                #[cfg(feature = "log")]
                log::trace!(target: "reactor", "Discarding stale event for fd {fd}");
                continue;
            };

            match kind {
                Kind::Listener => self.service_listener(id, res),
                Kind::Transport => self.service_transport(id, res),
                Kind::Connecting => self.service_connecting(id),
                Kind::Datagram => self.service_datagram(id, res),
            }
        }

        awoken
    }

    fn service_listener(&mut self, id: ResourceId, res: Result<IoType, IoFail>) {
        if let Err(err) = res {
            #[cfg(feature = "log")]
            log::error!(target: "reactor", "Listener {id} has failed ({err}); closing the port");
            self.close_resource(id);
            return;
        }

        let Some(listener) = self.listeners.get_mut(&id) else { return };
        let (accepted, err) = listener.accept_batch();
        #[cfg(feature = "log")]
        if !accepted.is_empty() {
            log::debug!(
                target: "reactor",
                "Accepted {} connection(s) on {}",
                accepted.len(),
                listener.addr(),
            );
        }
        if let Some(err) = err {
            #[cfg(feature = "log")]
            log::warn!(target: "reactor", "Accepting a connection on {id} has failed: {err}");
        }
        for (transport, protocol) in accepted {
            self.install_transport(transport, protocol, None);
        }
    }

    /// Registers an established connection and fires `connection_made`.
    fn install_transport(
        &mut self,
        transport: TcpTransport,
        protocol: Box<dyn Protocol>,
        client: Option<Box<dyn ClientFactory>>,
    ) {
        let id = self.handle.next_id();
        let fd = transport.as_raw_fd();
        #[cfg(feature = "log")]
        log::debug!(target: "reactor", "Connection {transport} established (fd {fd}) as {id}");

        let interest = transport.interests();
        self.poller.register(&transport, interest);
        self.registry.register(id, fd, Kind::Transport, interest);
        self.transports.insert(id, TransportEntry { transport, protocol, client });

        let entry = self.transports.get_mut(&id).expect("transport was just inserted");
        entry.protocol.connection_made(&mut entry.transport);
    }

    fn service_transport(&mut self, id: ResourceId, res: Result<IoType, IoFail>) {
        match res {
            Err(IoFail::Connectivity(flags)) => {
                // The peer is gone, but in-flight data may still be queued in the kernel; drain
                // it before tearing down, so the protocol sees everything that was sent and a
                // clean EOF stays a clean close.
                #[cfg(feature = "log")]
                log::trace!(target: "reactor", "Transport {id} hung up (events {flags:#b})");
                loop {
                    match self.transport_read(id) {
                        ReadOutcome::Progress => continue,
                        ReadOutcome::Idle => break,
                        ReadOutcome::Gone => return,
                    }
                }
                // No buffered byte can leave a hung-up socket, so a close waiting on its drain
                // would wait forever. Whatever the sweep cannot collect goes down as a reset.
                let collectable = self
                    .transports
                    .get(&id)
                    .map_or(true, |entry| entry.transport.ready_to_close());
                if !collectable {
                    self.teardown_transport(id, Reason::Lost(io::ErrorKind::ConnectionReset.into()));
                }
            }
            Err(IoFail::Os(flags)) => {
                #[cfg(feature = "log")]
                log::trace!(target: "reactor", "Transport {id} has failed (events {flags:#b})");
                let err = io::Error::new(io::ErrorKind::Other, IoFail::Os(flags).to_string());
                self.teardown_transport(id, Reason::Lost(err));
            }
            Ok(io) => {
                for io in io {
                    match io {
                        Io::Write => self.transport_flush(id),
                        Io::Read => {
                            self.transport_read(id);
                        }
                    }
                }
            }
        }
    }

    /// One read cycle on a transport: reads a chunk and hands it to the protocol, or reacts to
    /// EOF and errors.
    fn transport_read(&mut self, id: ResourceId) -> ReadOutcome {
        let Some(entry) = self.transports.get_mut(&id) else { return ReadOutcome::Gone };
        if entry.transport.is_disconnecting() || entry.transport.is_read_disconnected() {
            return ReadOutcome::Idle;
        }
        match entry.transport.handle_read(&mut self.read_buf) {
            IoStatus::Success(len) => {
                #[cfg(feature = "log")]
                log::trace!(target: "reactor", "Read {len} bytes from {}", entry.transport);
                entry.protocol.data_received(&mut entry.transport, &self.read_buf[..len]);
                ReadOutcome::Progress
            }
            IoStatus::WouldBlock => ReadOutcome::Idle,
            IoStatus::Shutdown => {
                #[cfg(feature = "log")]
                log::trace!(target: "reactor", "Peer of {} has stopped sending", entry.transport);
                entry.protocol.read_connection_lost(&mut entry.transport);
                ReadOutcome::Idle
            }
            IoStatus::Err(err) => {
                self.teardown_transport(id, Reason::Lost(err));
                ReadOutcome::Gone
            }
        }
    }

    /// One write cycle on a transport: drains the buffer and completes a pending half-close once
    /// it empties. A completed full close is picked up by the transport sweep.
    fn transport_flush(&mut self, id: ResourceId) {
        let Some(entry) = self.transports.get_mut(&id) else { return };
        match entry.transport.flush() {
            FlushStatus::Err(err) => {
                self.teardown_transport(id, Reason::Lost(err));
                return;
            }
            FlushStatus::Drained | FlushStatus::Partial => {}
        }
        if entry.transport.ready_to_shut_write() {
            #[cfg(feature = "log")]
            log::debug!(
                target: "reactor",
                "Shutting down the write direction of {}", entry.transport,
            );
            match entry.transport.shutdown_write() {
                Ok(()) => entry.protocol.write_connection_lost(&mut entry.transport),
                Err(err) => self.teardown_transport(id, Reason::Lost(err)),
            }
        }
    }

    /// Resolves a connection attempt once its socket reports an outcome. Both writability and
    /// error conditions resolve the attempt, so the event payload itself is not interesting.
    fn service_connecting(&mut self, id: ResourceId) {
        let Some(pending) = self.connects.remove(&id) else { return };
        self.registry.unregister(id);
        self.poller.unregister(&pending);
        let peer = pending.addr();

        let (mut factory, outcome) = pending.complete();
        match outcome {
            Err(error) => {
                #[cfg(feature = "log")]
                log::debug!(target: "reactor", "Connection attempt {id} to {peer} failed: {error}");
                factory.connection_failed(Reason::from_connect_error(error));
            }
            Ok((stream, local)) => {
                let Some(protocol) = factory.build_protocol(peer) else {
                    #[cfg(feature = "log")]
                    log::warn!(target: "reactor", "Factory refused its own connection to {peer}");
                    return;
                };
                let transport = TcpTransport::new(stream, peer, local, None);
                self.install_transport(transport, protocol, Some(factory));
            }
        }
    }

    fn service_datagram(&mut self, id: ResourceId, res: Result<IoType, IoFail>) {
        if let Err(IoFail::Connectivity(flags)) = res {
            #[cfg(feature = "log")]
            log::error!(target: "reactor", "Datagram port {id} hung up (events {flags:#b}); closing");
            self.close_datagram(id);
            return;
        }
        // An `IoFail::Os` event falls through to the loop below: a connected port raises
        // `POLLERR` when a send bounced, and recv(2) turns the queued errno into
        // `connection_refused` while the port stays up.

        let Some(entry) = self.datagrams.get_mut(&id) else { return };
        let max_packet = entry.port.max_packet_size().min(self.read_buf.len());
        let buf = &mut self.read_buf[..max_packet];
        let mut consumed = 0usize;
        let mut failed = None;
        loop {
            match entry.port.socket().recv_nonblocking(buf) {
                DatagramStatus::Success(len, peer) => {
                    entry.protocol.datagram_received(&mut entry.port, &buf[..len], peer);
                    consumed += len;
                    // Yield to other resources once this port has had its share; the poller will
                    // report it again.
                    if consumed > MAX_READ_PER_EVENT {
                        break;
                    }
                }
                DatagramStatus::WouldBlock => break,
                DatagramStatus::Refused => {
                    entry.protocol.connection_refused(&mut entry.port);
                    break;
                }
                DatagramStatus::Err(err) => {
                    failed = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = failed {
            #[cfg(feature = "log")]
            log::error!(target: "reactor", "Datagram port {id} has failed ({err}); closing");
            self.close_datagram(id);
        }
    }

    fn drain_ctl(&mut self) {
        loop {
            match self.ctl.try_recv() {
                Err(chan::TryRecvError::Empty) => break,
                Err(chan::TryRecvError::Disconnected) => {
                    self.stopping = true;
                    break;
                }
                Ok(ctl) => {
                    #[cfg(feature = "log")]
                    log::trace!(target: "reactor", "Handling control request `{ctl}`");
                    self.handle_ctl(ctl);
                }
            }
        }
    }

    fn handle_ctl(&mut self, ctl: Ctl) {
        match ctl {
            Ctl::Schedule { at, call } => self.scheduler.attach(at, call),
            Ctl::FromThread(callable) => callable(),
            Ctl::OnShutdown(hook) => self.shutdown_hooks.push(hook),
            Ctl::Listen(id, listener) => {
                #[cfg(feature = "log")]
                log::debug!(
                    target: "reactor",
                    "Listening on {} (fd {}) as {id}",
                    listener.addr(),
                    listener.as_raw_fd(),
                );
                let fd = listener.as_raw_fd();
                self.poller.register(&listener, IoType::read_only());
                self.registry.register(id, fd, Kind::Listener, IoType::read_only());
                self.listeners.insert(id, listener);
            }
            Ctl::Connect(id, ConnectLaunch::Failed { mut factory, error }) => {
                #[cfg(feature = "log")]
                log::debug!(target: "reactor", "Connection attempt {id} failed at launch: {error}");
                factory.connection_failed(Reason::from_connect_error(error));
            }
            Ctl::Connect(id, ConnectLaunch::Started(pending)) => {
                #[cfg(feature = "log")]
                log::debug!(
                    target: "reactor",
                    "Connecting to {} (fd {}) as {id}",
                    pending.addr(),
                    pending.as_raw_fd(),
                );
                let fd = pending.as_raw_fd();
                self.poller.register(&pending, IoType::write_only());
                self.registry.register(id, fd, Kind::Connecting, IoType::write_only());
                self.connects.insert(id, pending);
            }
            Ctl::ListenUdp(id, port, protocol) => {
                #[cfg(feature = "log")]
                log::debug!(
                    target: "reactor",
                    "Datagram port {port} (fd {}) open as {id}",
                    port.as_raw_fd(),
                );
                if port.max_packet_size() > self.read_buf.len() {
                    self.read_buf.resize(port.max_packet_size(), 0);
                }
                self.poller.register(&port, IoType::read_only());
                self.registry.register(id, port.as_raw_fd(), Kind::Datagram, IoType::read_only());
                self.datagrams.insert(id, DatagramEntry { port, protocol });
                let entry = self.datagrams.get_mut(&id).expect("port was just inserted");
                entry.protocol.started(&mut entry.port);
            }
            Ctl::Close(id) => self.close_resource(id),
            Ctl::Shutdown => {
                #[cfg(feature = "log")]
                log::info!(target: "reactor", "Reactor shutdown requested");
                self.stopping = true;
            }
        }
    }

    /// Closes a listening port, connection attempt or datagram port by id. Unknown (already
    /// closed) ids are ignored.
    fn close_resource(&mut self, id: ResourceId) {
        if let Some(listener) = self.listeners.remove(&id) {
            #[cfg(feature = "log")]
            log::debug!(target: "reactor", "Closing listener {id} on {}", listener.addr());
            self.registry.unregister(id);
            self.poller.unregister(&listener);
            listener.into_factory().stopped_listening();
        } else if let Some(pending) = self.connects.remove(&id) {
            #[cfg(feature = "log")]
            log::debug!(
                target: "reactor",
                "Abandoning connection attempt {id} to {}", pending.addr(),
            );
            self.registry.unregister(id);
            self.poller.unregister(&pending);
            let mut factory = pending.into_factory();
            factory.connection_failed(Reason::Aborted);
        } else if self.datagrams.contains_key(&id) {
            self.close_datagram(id);
        }
    }

    fn close_datagram(&mut self, id: ResourceId) {
        let Some(mut entry) = self.datagrams.remove(&id) else { return };
        #[cfg(feature = "log")]
        log::debug!(target: "reactor", "Closing datagram port {id} on {}", entry.port);
        self.registry.unregister(id);
        self.poller.unregister(&entry.port);
        entry.protocol.stopped();
    }

    /// Removes a connection, notifying its producer, protocol and (for outbound connections)
    /// factory. Repeated teardown of the same id is a no-op.
    fn teardown_transport(&mut self, id: ResourceId, reason: Reason) {
        let Some(mut entry) = self.transports.remove(&id) else { return };
        self.registry.unregister(id);
        self.poller.unregister(&entry.transport);
        #[cfg(feature = "log")]
        log::debug!(target: "reactor", "Disconnecting {} ({reason})", entry.transport);

        if let Some(mut producer) = entry.transport.take_producer() {
            producer.stop_producing();
        }
        match entry.client.take() {
            Some(mut factory) => {
                entry.protocol.connection_lost(reason.clone());
                factory.connection_lost(reason);
            }
            None => entry.protocol.connection_lost(reason),
        }
    }

    /// Abandons connection attempts which outlived their deadline.
    fn sweep_connect_timeouts(&mut self, now: Timestamp) {
        let expired: Vec<ResourceId> = self
            .connects
            .iter()
            .filter(|(_, pending)| pending.deadline().map_or(false, |at| at <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            let Some(pending) = self.connects.remove(&id) else { continue };
            self.registry.unregister(id);
            self.poller.unregister(&pending);
            #[cfg(feature = "log")]
            log::debug!(
                target: "reactor",
                "Connection attempt {id} to {} has timed out", pending.addr(),
            );
            let mut factory = pending.into_factory();
            factory.connection_failed(Reason::TimedOut);
        }
    }

    /// Completes orderly closes whose write buffers have drained, and aborted connections.
    fn sweep_transports(&mut self) {
        let closing: Vec<(ResourceId, Reason)> = self
            .transports
            .iter()
            .filter(|(_, entry)| entry.transport.ready_to_close())
            .map(|(id, entry)| (*id, entry.transport.close_reason()))
            .collect();
        for (id, reason) in closing {
            self.teardown_transport(id, reason);
        }
    }

    /// The shutdown sequence: hooks first, in registration order, then teardown of every
    /// remaining resource.
    fn finish_shutdown(&mut self) {
        #[cfg(feature = "log")]
        log::info!(target: "reactor", "Reactor is shutting down");

        for hook in mem::take(&mut self.shutdown_hooks) {
            hook();
        }

        let ids: Vec<ResourceId> = self.transports.keys().copied().collect();
        for id in ids {
            self.teardown_transport(id, Reason::Shutdown);
        }
        let ids: Vec<ResourceId> = self.listeners.keys().copied().collect();
        for id in ids {
            self.close_resource(id);
        }
        for (id, pending) in mem::take(&mut self.connects) {
            self.registry.unregister(id);
            self.poller.unregister(&pending);
            let mut factory = pending.into_factory();
            factory.connection_failed(Reason::Shutdown);
        }
        let ids: Vec<ResourceId> = self.datagrams.keys().copied().collect();
        for id in ids {
            self.close_datagram(id);
        }
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use socket2::SockRef;

    use super::*;
    use crate::error::{CancelError, DatagramError};
    use crate::protocol::Producer;

    const WAIT: Duration = Duration::from_secs(5);

    fn run_reactor() -> (Handle, thread::JoinHandle<io::Result<()>>) {
        let reactor = Reactor::with_popol().unwrap();
        let handle = reactor.handle();
        let join = thread::spawn(move || reactor.run());
        (handle, join)
    }

    fn finish(handle: Handle, join: thread::JoinHandle<io::Result<()>>) {
        handle.stop().unwrap();
        join.join().unwrap().unwrap();
    }

    fn local() -> SocketAddr { "127.0.0.1:0".parse().unwrap() }

    struct EchoProtocol {
        events: chan::Sender<&'static str>,
    }

    impl Protocol for EchoProtocol {
        fn data_received(&mut self, transport: &mut TcpTransport, data: &[u8]) {
            assert_eq!(data, b"ping");
            transport.write(b"pong");
        }
        fn connection_lost(&mut self, reason: Reason) {
            assert!(reason.is_clean(), "server close must be clean, got {reason}");
            self.events.send("server lost").unwrap();
        }
    }

    struct EchoFactory {
        events: chan::Sender<&'static str>,
    }

    impl Factory for EchoFactory {
        fn build_protocol(&mut self, _peer: SocketAddr) -> Option<Box<dyn Protocol>> {
            Some(Box::new(EchoProtocol { events: self.events.clone() }))
        }
    }

    struct PingClient {
        events: chan::Sender<&'static str>,
    }

    impl Protocol for PingClient {
        fn connection_made(&mut self, transport: &mut TcpTransport) {
            transport.write(b"ping");
        }
        fn data_received(&mut self, transport: &mut TcpTransport, data: &[u8]) {
            assert_eq!(data, b"pong");
            self.events.send("pong").unwrap();
            transport.lose_connection();
        }
        fn connection_lost(&mut self, reason: Reason) {
            assert!(matches!(reason, Reason::Done), "client requested the close: {reason}");
            self.events.send("client lost").unwrap();
        }
    }

    struct PingFactory {
        events: chan::Sender<&'static str>,
    }

    impl Factory for PingFactory {
        fn build_protocol(&mut self, _peer: SocketAddr) -> Option<Box<dyn Protocol>> {
            Some(Box::new(PingClient { events: self.events.clone() }))
        }
    }

    impl ClientFactory for PingFactory {
        fn connection_failed(&mut self, reason: Reason) {
            panic!("connection must succeed, got {reason}");
        }
    }

    #[test]
    fn echo_roundtrip_and_orderly_close() {
        let (handle, join) = run_reactor();
        let (tx, rx) = chan::unbounded();

        let port = handle.listen_tcp(local(), EchoFactory { events: tx.clone() }).unwrap();
        handle.connect_tcp(port.addr(), PingFactory { events: tx }).unwrap();

        let mut events = Vec::new();
        for _ in 0..3 {
            events.push(rx.recv_timeout(WAIT).unwrap());
        }
        assert_eq!(events[0], "pong", "data must flow before anything closes");
        events.sort_unstable();
        assert_eq!(events, vec!["client lost", "pong", "server lost"]);

        finish(handle, join);
    }

    #[test]
    fn delayed_calls_fire_in_deadline_order() {
        let (handle, join) = run_reactor();
        let (tx, rx) = chan::unbounded();

        let late = tx.clone();
        handle.call_later(Duration::from_millis(50), move || late.send("late").unwrap()).unwrap();
        let early = tx;
        handle.call_later(Duration::from_millis(10), move || early.send("early").unwrap()).unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "early");
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "late");

        finish(handle, join);
    }

    #[test]
    fn cancelled_call_never_fires() {
        let (handle, join) = run_reactor();
        let (tx, rx) = chan::unbounded();

        let never = tx.clone();
        let cancelled = handle
            .call_later(Duration::from_millis(20), move || never.send("never").unwrap())
            .unwrap();
        assert!(cancelled.active());
        cancelled.cancel().unwrap();
        assert!(!cancelled.active());
        assert_eq!(cancelled.cancel(), Err(CancelError::AlreadyCancelled));

        let ran = tx;
        let fired = handle
            .call_later(Duration::from_millis(40), move || ran.send("ran").unwrap())
            .unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "ran");
        assert!(rx.try_recv().is_err(), "cancelled call must not have fired");
        assert_eq!(fired.cancel(), Err(CancelError::AlreadyCalled));

        finish(handle, join);
    }

    #[test]
    fn call_from_thread_runs_on_the_loop_thread() {
        let (handle, join) = run_reactor();
        let (tx, rx) = chan::unbounded();

        handle.call_from_thread(move || tx.send(thread::current().id()).unwrap()).unwrap();
        let loop_thread = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(loop_thread, join.thread().id());
        assert_ne!(loop_thread, thread::current().id());

        finish(handle, join);
    }

    struct RefusedFactory {
        events: chan::Sender<&'static str>,
    }

    impl Factory for RefusedFactory {
        fn build_protocol(&mut self, _peer: SocketAddr) -> Option<Box<dyn Protocol>> {
            panic!("no protocol may be built for a failed attempt");
        }
    }

    impl ClientFactory for RefusedFactory {
        fn connection_failed(&mut self, reason: Reason) {
            assert!(matches!(reason, Reason::Refused), "expected a refusal, got {reason}");
            self.events.send("refused").unwrap();
        }
    }

    #[test]
    fn refused_connect_reports_failure_and_builds_nothing() {
        let (handle, join) = run_reactor();
        let (tx, rx) = chan::unbounded();

        // Bind and immediately drop a listener to get an address which refuses.
        let vacant = {
            let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            taken.local_addr().unwrap()
        };

        handle.connect_tcp(vacant, RefusedFactory { events: tx }).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "refused");

        finish(handle, join);
    }

    struct DeadEndFactory {
        events: chan::Sender<&'static str>,
    }

    impl Factory for DeadEndFactory {
        fn build_protocol(&mut self, _peer: SocketAddr) -> Option<Box<dyn Protocol>> {
            panic!("no protocol may be built for a failed attempt");
        }
    }

    impl ClientFactory for DeadEndFactory {
        fn connection_failed(&mut self, reason: Reason) {
            let event = match reason {
                Reason::TimedOut => "timed out",
                _ => "failed",
            };
            self.events.send(event).unwrap();
        }
    }

    #[test]
    fn stalled_connect_attempt_times_out() {
        let (handle, join) = run_reactor();
        let (tx, rx) = chan::unbounded();

        // 192.0.2.0/24 (TEST-NET-1) is reserved, so the handshake never
        // completes. Hosts without a route there fail the attempt right away
        // instead; either outcome must reach the factory.
        let blackhole: SocketAddr = "192.0.2.1:81".parse().unwrap();
        let config = ConnectConfig { timeout: Some(Duration::from_millis(250)), bind: None };
        handle.connect_tcp_with(blackhole, DeadEndFactory { events: tx }, config).unwrap();

        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), "timed out" | "failed"));

        finish(handle, join);
    }

    struct ChanProducer {
        events: chan::Sender<&'static str>,
    }

    impl Producer for ChanProducer {
        fn pause_producing(&mut self) { self.events.send("pause").unwrap(); }
        fn resume_producing(&mut self) { self.events.send("resume").unwrap(); }
        fn stop_producing(&mut self) { self.events.send("stop").unwrap(); }
    }

    struct FloodClient {
        events: chan::Sender<&'static str>,
    }

    impl Protocol for FloodClient {
        fn connection_made(&mut self, transport: &mut TcpTransport) {
            transport
                .register_producer(Box::new(ChanProducer { events: self.events.clone() }), true)
                .unwrap();
            transport.write(&vec![0x42u8; 200_000]);
        }
        fn data_received(&mut self, _transport: &mut TcpTransport, _data: &[u8]) {
            unreachable!("the sink never answers");
        }
    }

    struct FloodFactory {
        events: chan::Sender<&'static str>,
    }

    impl Factory for FloodFactory {
        fn build_protocol(&mut self, _peer: SocketAddr) -> Option<Box<dyn Protocol>> {
            Some(Box::new(FloodClient { events: self.events.clone() }))
        }
    }

    impl ClientFactory for FloodFactory {
        fn connection_failed(&mut self, reason: Reason) {
            panic!("connection must succeed, got {reason}");
        }
    }

    struct SinkProtocol {
        received: usize,
        counts: chan::Sender<usize>,
    }

    impl Protocol for SinkProtocol {
        fn data_received(&mut self, _transport: &mut TcpTransport, data: &[u8]) {
            self.received += data.len();
            if self.received >= 200_000 {
                self.counts.send(self.received).unwrap();
            }
        }
    }

    struct SinkFactory {
        counts: chan::Sender<usize>,
    }

    impl Factory for SinkFactory {
        fn build_protocol(&mut self, _peer: SocketAddr) -> Option<Box<dyn Protocol>> {
            Some(Box::new(SinkProtocol { received: 0, counts: self.counts.clone() }))
        }
    }

    #[test]
    fn producer_paused_and_resumed_exactly_once() {
        let (handle, join) = run_reactor();
        let (events_tx, events) = chan::unbounded();
        let (counts_tx, counts) = chan::unbounded();

        let port = handle.listen_tcp(local(), SinkFactory { counts: counts_tx }).unwrap();
        handle.connect_tcp(port.addr(), FloodFactory { events: events_tx }).unwrap();

        // Writing 200 kB in one call overshoots the high-water mark, so the producer pauses
        // during the write itself and resumes on full drain.
        assert_eq!(events.recv_timeout(WAIT).unwrap(), "pause");
        assert_eq!(events.recv_timeout(WAIT).unwrap(), "resume");
        assert_eq!(counts.recv_timeout(WAIT).unwrap(), 200_000, "sink must see every byte");

        finish(handle, join);
        assert_eq!(events.recv_timeout(WAIT).unwrap(), "stop", "producer is stopped at teardown");
        assert!(events.try_recv().is_err(), "no further pause/resume cycles");
    }

    struct HalfCloseClient {
        events: chan::Sender<&'static str>,
    }

    impl Protocol for HalfCloseClient {
        fn connection_made(&mut self, transport: &mut TcpTransport) {
            transport.write(b"question");
            transport.lose_write_connection();
        }
        fn data_received(&mut self, _transport: &mut TcpTransport, data: &[u8]) {
            assert_eq!(data, b"answer");
            self.events.send("answer").unwrap();
        }
        fn write_connection_lost(&mut self, _transport: &mut TcpTransport) {
            self.events.send("write half closed").unwrap();
        }
        fn connection_lost(&mut self, _reason: Reason) {
            self.events.send("client lost").unwrap();
        }
    }

    struct HalfCloseFactory {
        events: chan::Sender<&'static str>,
    }

    impl Factory for HalfCloseFactory {
        fn build_protocol(&mut self, _peer: SocketAddr) -> Option<Box<dyn Protocol>> {
            Some(Box::new(HalfCloseClient { events: self.events.clone() }))
        }
    }

    impl ClientFactory for HalfCloseFactory {
        fn connection_failed(&mut self, reason: Reason) {
            panic!("connection must succeed, got {reason}");
        }
    }

    struct LateAnswerProtocol;

    impl Protocol for LateAnswerProtocol {
        fn data_received(&mut self, _transport: &mut TcpTransport, data: &[u8]) {
            assert_eq!(data, b"question");
        }
        fn read_connection_lost(&mut self, transport: &mut TcpTransport) {
            // The peer finished sending; answer on the still-open direction and close once
            // everything is delivered.
            transport.write(b"answer");
            transport.lose_connection();
        }
    }

    struct LateAnswerFactory;

    impl Factory for LateAnswerFactory {
        fn build_protocol(&mut self, _peer: SocketAddr) -> Option<Box<dyn Protocol>> {
            Some(Box::new(LateAnswerProtocol))
        }
    }

    #[test]
    fn half_close_keeps_the_read_direction_open() {
        let (handle, join) = run_reactor();
        let (tx, rx) = chan::unbounded();

        let port = handle.listen_tcp(local(), LateAnswerFactory).unwrap();
        handle.connect_tcp(port.addr(), HalfCloseFactory { events: tx }).unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "write half closed");
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "answer", "reads survive the half-close");
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "client lost");

        finish(handle, join);
    }

    struct GlutProtocol {
        events: chan::Sender<&'static str>,
    }

    impl Protocol for GlutProtocol {
        fn connection_made(&mut self, transport: &mut TcpTransport) {
            // Far more than loopback can absorb, so plenty is still buffered
            // when the peer resets.
            transport.write(&vec![0u8; 32 * 1024 * 1024]);
            transport.lose_connection();
            self.events.send("draining").unwrap();
        }
        fn data_received(&mut self, _transport: &mut TcpTransport, _data: &[u8]) {}
        fn connection_lost(&mut self, reason: Reason) {
            assert!(!reason.is_clean(), "an interrupted drain cannot end cleanly: {reason}");
            self.events.send("server lost").unwrap();
        }
    }

    struct GlutFactory {
        events: chan::Sender<&'static str>,
    }

    impl Factory for GlutFactory {
        fn build_protocol(&mut self, _peer: SocketAddr) -> Option<Box<dyn Protocol>> {
            Some(Box::new(GlutProtocol { events: self.events.clone() }))
        }
    }

    #[test]
    fn peer_reset_while_draining_reports_connection_lost() {
        let (handle, join) = run_reactor();
        let (tx, rx) = chan::unbounded();

        let port = handle.listen_tcp(local(), GlutFactory { events: tx }).unwrap();
        let client = std::net::TcpStream::connect(port.addr()).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "draining");

        // Give part of the glut time to reach the kernel buffers, then reset
        // without reading any of it.
        thread::sleep(Duration::from_millis(200));
        SockRef::from(&client).set_linger(Some(Duration::ZERO)).unwrap();
        drop(client);

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "server lost");
        finish(handle, join);
    }

    struct NoBuildFactory {
        events: chan::Sender<&'static str>,
    }

    impl Factory for NoBuildFactory {
        fn build_protocol(&mut self, _peer: SocketAddr) -> Option<Box<dyn Protocol>> {
            panic!("the port must be closed before anything connects");
        }

        fn stopped_listening(&mut self) {
            self.events.send("listener stopped").unwrap();
        }
    }

    #[test]
    fn stopped_listener_signals_completion_and_refuses_new_dials() {
        let (handle, join) = run_reactor();
        let (tx, rx) = chan::unbounded();

        let port = handle.listen_tcp(local(), NoBuildFactory { events: tx.clone() }).unwrap();
        let addr = port.addr();
        port.stop_listening().unwrap();
        port.stop_listening().unwrap();

        // The factory hears about the close once the loop has applied it.
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "listener stopped");

        handle.connect_tcp(addr, RefusedFactory { events: tx }).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "refused");
        assert!(rx.try_recv().is_err(), "a repeated stop must not signal twice");

        finish(handle, join);
    }

    struct MarcoProtocol {
        events: chan::Sender<&'static str>,
    }

    impl DatagramProtocol for MarcoProtocol {
        fn started(&mut self, _port: &mut UdpPort) {
            self.events.send("marco started").unwrap();
        }
        fn datagram_received(&mut self, port: &mut UdpPort, data: &[u8], peer: SocketAddr) {
            assert_eq!(data, b"marco");
            port.send_to(b"polo", peer).unwrap();
        }
        fn stopped(&mut self) {
            self.events.send("marco stopped").unwrap();
        }
    }

    struct PoloProtocol {
        responder: SocketAddr,
        events: chan::Sender<&'static str>,
    }

    impl DatagramProtocol for PoloProtocol {
        fn started(&mut self, port: &mut UdpPort) {
            port.connect(self.responder).unwrap();
            port.send(b"marco").unwrap();
        }
        fn datagram_received(&mut self, _port: &mut UdpPort, data: &[u8], peer: SocketAddr) {
            assert_eq!(data, b"polo");
            assert_eq!(peer, self.responder);
            self.events.send("polo").unwrap();
        }
        fn stopped(&mut self) {
            self.events.send("polo stopped").unwrap();
        }
    }

    #[test]
    fn udp_roundtrip_with_connected_mode() {
        let (handle, join) = run_reactor();
        let (tx, rx) = chan::unbounded();

        let responder = handle.listen_udp(local(), MarcoProtocol { events: tx.clone() }).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "marco started");

        let caller = handle
            .listen_udp(local(), PoloProtocol { responder: responder.addr(), events: tx })
            .unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "polo");

        caller.stop_listening().unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "polo stopped");

        finish(handle, join);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "marco stopped");
    }

    struct BouncerProtocol {
        vacant: SocketAddr,
        events: chan::Sender<&'static str>,
    }

    impl DatagramProtocol for BouncerProtocol {
        fn started(&mut self, port: &mut UdpPort) {
            port.connect(self.vacant).unwrap();
            port.send(b"anyone there").unwrap();
        }
        fn datagram_received(&mut self, _port: &mut UdpPort, _data: &[u8], _peer: SocketAddr) {
            panic!("nothing can answer from a vacant port");
        }
        fn connection_refused(&mut self, _port: &mut UdpPort) {
            self.events.send("refused").unwrap();
        }
        fn stopped(&mut self) {
            self.events.send("stopped").unwrap();
        }
    }

    #[test]
    fn bounced_datagram_reports_connection_refused() {
        let (handle, join) = run_reactor();
        let (tx, rx) = chan::unbounded();

        let vacant = {
            let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            taken.local_addr().unwrap()
        };
        handle.listen_udp(local(), BouncerProtocol { vacant, events: tx }).unwrap();

        // The refusal must reach the protocol, and must not cost it the port.
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "refused");

        finish(handle, join);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "stopped");
    }

    struct ShutdownWitness {
        events: chan::Sender<&'static str>,
        label: &'static str,
    }

    impl Protocol for ShutdownWitness {
        fn data_received(&mut self, _transport: &mut TcpTransport, _data: &[u8]) {}
        fn connection_lost(&mut self, reason: Reason) {
            assert!(matches!(reason, Reason::Shutdown), "expected shutdown, got {reason}");
            self.events.send(self.label).unwrap();
        }
    }

    struct WitnessFactory {
        events: chan::Sender<&'static str>,
        label: &'static str,
        built: chan::Sender<()>,
    }

    impl Factory for WitnessFactory {
        fn build_protocol(&mut self, _peer: SocketAddr) -> Option<Box<dyn Protocol>> {
            self.built.send(()).unwrap();
            Some(Box::new(ShutdownWitness { events: self.events.clone(), label: self.label }))
        }
    }

    impl ClientFactory for WitnessFactory {
        fn connection_failed(&mut self, reason: Reason) {
            panic!("connection must succeed, got {reason}");
        }
    }

    #[test]
    fn shutdown_runs_hooks_then_tears_down_connections() {
        let (handle, join) = run_reactor();
        let (tx, rx) = chan::unbounded();
        let (built_tx, built) = chan::unbounded();

        let port = handle
            .listen_tcp(local(), WitnessFactory {
                events: tx.clone(),
                label: "server torn down",
                built: built_tx.clone(),
            })
            .unwrap();
        handle
            .connect_tcp(port.addr(), WitnessFactory {
                events: tx.clone(),
                label: "client torn down",
                built: built_tx,
            })
            .unwrap();
        built.recv_timeout(WAIT).unwrap();
        built.recv_timeout(WAIT).unwrap();

        let first = tx.clone();
        handle.call_on_shutdown(move || first.send("first hook").unwrap()).unwrap();
        let second = tx;
        handle.call_on_shutdown(move || second.send("second hook").unwrap()).unwrap();

        finish(handle, join);

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "first hook");
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "second hook");
        let mut teardowns = vec![rx.recv_timeout(WAIT).unwrap(), rx.recv_timeout(WAIT).unwrap()];
        teardowns.sort_unstable();
        assert_eq!(teardowns, vec!["client torn down", "server torn down"]);
    }

    struct DummyDatagram;

    impl DatagramProtocol for DummyDatagram {
        fn datagram_received(&mut self, _port: &mut UdpPort, _data: &[u8], _peer: SocketAddr) {}
    }

    #[test]
    fn handles_report_a_gone_reactor() {
        let (handle, join) = run_reactor();
        finish(handle.clone(), join);

        assert_eq!(handle.stop(), Err(NotRunning));
        assert!(handle.call_from_thread(|| {}).is_err());
        assert!(handle.call_later(Duration::from_millis(1), || {}).is_err());
        assert!(handle.listen_udp(local(), DummyDatagram).is_err());
    }

    struct Oversender {
        events: chan::Sender<&'static str>,
    }

    impl DatagramProtocol for Oversender {
        fn started(&mut self, port: &mut UdpPort) {
            let giant = vec![0u8; 70_000];
            let loopback = port.addr();
            match port.send_to(&giant, loopback) {
                Err(DatagramError::TooLong { len: 70_000, .. }) => {
                    self.events.send("too long").unwrap()
                }
                other => panic!("oversized datagram must be refused: {other:?}"),
            }
        }
        fn datagram_received(&mut self, _port: &mut UdpPort, _data: &[u8], _peer: SocketAddr) {}
    }

    #[test]
    fn oversized_udp_send_is_reported() {
        let (handle, join) = run_reactor();
        let (tx, rx) = chan::unbounded();

        handle.listen_udp(local(), Oversender { events: tx }).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "too long");

        finish(handle, join);
    }
}

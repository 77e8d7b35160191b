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

#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    //missing_docs
)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Callback-driven I/O reactor ([`Reactor`]) multiplexing TCP streams, TCP
//! listeners, UDP ports and timers over a single poll syscall. Applications
//! implement [`Protocol`] (plus [`Factory`] for servers and [`ClientFactory`]
//! for outgoing connections) and are called back on the loop thread as I/O
//! happens; a cloneable [`Handle`] schedules work and opens ports from any
//! thread.
//!
//! The loop runs on the thread which calls [`Reactor::run`], and every
//! application callback runs there too, so protocol code never needs its own
//! synchronization.
//!
//! All multiplexed resources must be representable as file descriptors.

#[macro_use]
extern crate amplify;

pub mod poller;

mod error;
mod nonblock;
mod protocol;
mod reactor;
mod registry;
mod scheduler;
mod tcp;
mod udp;

pub use error::{CancelError, CannotListen, DatagramError, DuplicateProducer, NotRunning, Reason};
pub use nonblock::{
    DatagramStatus, IoStatus, ReadNonblocking, RecvNonblocking, WriteNonblocking, is_in_progress,
    is_msg_too_long,
};
pub use protocol::{ClientFactory, DatagramProtocol, Factory, Producer, Protocol};
pub use registry::ResourceId;
pub use scheduler::{Callback, DelayedCall, Scheduler, Timestamp};
pub use tcp::{
    ConnectConfig, Connector, DEFAULT_BACKLOG, DEFAULT_CONNECT_TIMEOUT, ListenConfig,
    ListeningPort, READ_BUFFER_SIZE, TcpTransport, WRITE_HIGH_WATER,
};
pub use udp::{DEFAULT_MAX_PACKET_SIZE, MAX_DATAGRAM_SIZE, UdpConfig, UdpListeningPort, UdpPort};

pub use self::reactor::{Handle, Reactor};

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

//! Typed errors and connection termination reasons.

use std::io;
use std::net::SocketAddr;

/// Why a connection (or connection attempt) was terminated.
///
/// Passed to [`Protocol::connection_lost`](crate::Protocol::connection_lost)
/// and to the client factory failure callbacks. [`Reason::Done`] and
/// [`Reason::Shutdown`] are clean terminations; everything else indicates
/// the connection ended for a cause the local side did not request through
/// the normal close path.
#[derive(Debug, Display, Error)]
#[display(doc_comments)]
pub enum Reason {
    /// connection closed cleanly
    Done,

    /// connection aborted locally
    Aborted,

    /// connection was refused by the remote host
    Refused,

    /// connection attempt timed out
    TimedOut,

    /// reactor was shut down
    Shutdown,

    /// connection lost ({0})
    Lost(io::Error),
}

impl Clone for Reason {
    fn clone(&self) -> Self {
        match self {
            Reason::Done => Reason::Done,
            Reason::Aborted => Reason::Aborted,
            Reason::Refused => Reason::Refused,
            Reason::TimedOut => Reason::TimedOut,
            Reason::Shutdown => Reason::Shutdown,
            // io::Error is not Clone; keep the kind and the rendered text.
            Reason::Lost(e) => Reason::Lost(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl Reason {
    /// Whether the termination was requested through the normal close path
    /// (an orderly close or a reactor shutdown) rather than caused by a
    /// failure.
    pub fn is_clean(&self) -> bool { matches!(self, Reason::Done | Reason::Shutdown) }

    /// Classifies an OS error from a failed connection attempt.
    pub(crate) fn from_connect_error(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Reason::Refused,
            io::ErrorKind::TimedOut => Reason::TimedOut,
            _ => Reason::Lost(err),
        }
    }
}

/// Errors cancelling a [`DelayedCall`](crate::DelayedCall).
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum CancelError {
    /// the delayed call has already been run
    AlreadyCalled,

    /// the delayed call has already been cancelled
    AlreadyCancelled,
}

/// Error returned when stopping a reactor which is not running (either it was
/// never started or it has already finished its shutdown sequence).
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, Error)]
#[display("reactor is not running")]
pub struct NotRunning;

/// A listening address could not be bound.
#[derive(Debug, Display, Error)]
#[display("cannot listen on {addr}: {error}")]
pub struct CannotListen {
    pub addr: SocketAddr,
    pub error: io::Error,
}

/// A producer is already registered on the transport; the previous one must
/// be unregistered first.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, Error)]
#[display("a producer is already registered on this transport")]
pub struct DuplicateProducer;

/// Errors operating on a datagram port.
#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum DatagramError {
    /// datagram of {len} bytes exceeds the {max}-byte protocol limit
    TooLong { len: usize, max: usize },

    /// the port is not connected to a remote address
    NotConnected,

    /// the port is already connected to a remote address
    AlreadyConnected,

    /// {0}
    #[from]
    Io(io::Error),
}

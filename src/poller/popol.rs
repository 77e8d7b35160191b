use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::poller::{IoFail, IoType, Poll, SocketWaker};

/// I/O multiplexer backed by the [`popol`] library (`poll(2)` based, portable
/// across POSIX systems).
pub struct Poller {
    poll: popol::Sources<RawFd>,
    events: VecDeque<(RawFd, Result<IoType, IoFail>)>,
}

impl Poller {
    pub fn new() -> Self {
        Self {
            poll: popol::Sources::new(),
            events: empty!(),
        }
    }
}

impl Default for Poller {
    fn default() -> Self { Self::new() }
}

impl Poll for Poller {
    type Waker = SocketWaker;

    fn register_waker(&mut self, fd: &impl AsRawFd) {
        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Registering waker on {}", fd.as_raw_fd());
        self.poll.register(fd.as_raw_fd(), fd, popol::interest::READ);
    }

    fn register(&mut self, fd: &impl AsRawFd, interest: IoType) {
        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Registering {} for `{interest}`", fd.as_raw_fd());
        self.poll.register(fd.as_raw_fd(), fd, interest.into());
    }

    fn unregister(&mut self, fd: &impl AsRawFd) {
        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Unregistering {}", fd.as_raw_fd());
        self.poll.unregister(&fd.as_raw_fd());
    }

    fn set_interest(&mut self, fd: &impl AsRawFd, interest: IoType) -> bool {
        let fd = fd.as_raw_fd();
        self.poll.unset(&fd, (!interest).into());
        self.poll.set(&fd, interest.into())
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let len = self.events.len();

        #[cfg(feature = "log")]
        log::trace!(target: "popol",
            "Polling {} descriptors with timeout {timeout:?} (pending event queue is {len})",
            self.poll.len(),
        );

        // Blocking call
        let mut fired = Vec::new();
        match self.poll.poll(&mut fired, timeout) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                #[cfg(feature = "log")]
                log::trace!(target: "popol", "Poll timed out with zero events generated");
                return Ok(0);
            }
            Err(err) => return Err(err),
        }

        for event in fired {
            let fd = event.key;
            let res = if event.is_hangup() {
                Err(IoFail::Connectivity(event.raw_events()))
            } else if event.is_error() || event.is_invalid() {
                Err(IoFail::Os(event.raw_events()))
            } else {
                Ok(IoType {
                    read: event.is_readable(),
                    write: event.is_writable(),
                })
            };
            #[cfg(feature = "log")]
            log::trace!(target: "popol", "Got `{res:?}` for {fd}");
            self.events.push_back((fd, res))
        }

        Ok(self.events.len() - len)
    }
}

impl Iterator for Poller {
    type Item = (RawFd, Result<IoType, IoFail>);

    fn next(&mut self) -> Option<Self::Item> { self.events.pop_front() }
}

impl From<IoType> for popol::Interest {
    fn from(ev: IoType) -> Self {
        let mut e = popol::interest::NONE;
        if ev.read {
            e |= popol::interest::READ;
        }
        if ev.write {
            e |= popol::interest::WRITE;
        }
        e
    }
}

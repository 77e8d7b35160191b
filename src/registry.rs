use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::os::unix::io::RawFd;

use crate::poller::IoType;

/// Identifier of a resource registered with a reactor, unique for the
/// lifetime of the reactor (never reused, unlike file descriptors).
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct ResourceId(u64);

impl ResourceId {
    pub(crate) fn new(id: u64) -> Self { ResourceId(id) }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { write!(f, "#{}", self.0) }
}

/// What kind of I/O source a registry entry stands for; decides which
/// service routine the reactor loop dispatches its events to.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) enum Kind {
    Listener,
    Transport,
    Connecting,
    Datagram,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct Registration {
    pub fd: RawFd,
    pub kind: Kind,
    pub interest: IoType,
}

/// Bookkeeping of every descriptor the reactor watches.
///
/// Maps descriptors to resource ids and back, and holds the current interest
/// set which the loop pushes down to the poller each iteration. Removal is
/// idempotent so that a resource torn down earlier in an event batch can be
/// unregistered again without effect.
#[derive(Default)]
pub(crate) struct Registry {
    entries: HashMap<ResourceId, Registration>,
    by_fd: HashMap<RawFd, ResourceId>,
}

impl Registry {
    pub fn new() -> Self { Registry { entries: empty!(), by_fd: empty!() } }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn register(&mut self, id: ResourceId, fd: RawFd, kind: Kind, interest: IoType) {
        debug_assert!(!self.entries.contains_key(&id), "duplicate resource id {id}");
        self.entries.insert(id, Registration { fd, kind, interest });
        self.by_fd.insert(fd, id);
    }

    /// Removes an entry, returning its registration; `None` if the id is
    /// unknown or was already removed.
    pub fn unregister(&mut self, id: ResourceId) -> Option<Registration> {
        let reg = self.entries.remove(&id)?;
        self.by_fd.remove(&reg.fd);
        Some(reg)
    }

    /// Resolves a fired descriptor to the owning resource. Events for
    /// descriptors removed earlier in the same batch resolve to `None` and
    /// must be discarded by the caller.
    pub fn resolve(&self, fd: RawFd) -> Option<(ResourceId, Kind)> {
        self.by_fd.get(&fd).map(|id| (*id, self.entries[id].kind))
    }

    pub fn set_interest(&mut self, id: ResourceId, interest: IoType) -> bool {
        match self.entries.get_mut(&id) {
            Some(reg) => {
                reg.interest = interest;
                true
            }
            None => false,
        }
    }

    pub fn interests(&self) -> impl Iterator<Item = (RawFd, IoType)> + '_ {
        self.entries.values().map(|reg| (reg.fd, reg.interest))
    }
}

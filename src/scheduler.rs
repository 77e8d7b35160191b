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

use std::collections::BTreeMap;
use std::mem;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::error::CancelError;

/// UNIX timestamp in milliseconds which helps working with absolute time.
#[derive(Wrapper, WrapperMut, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Debug, From)]
#[wrapper(Display, Add, Sub)]
#[wrapper_mut(AddAssign, SubAssign)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates timestamp matching the current moment.
    pub fn now() -> Self {
        let duration =
            SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).expect("system time");
        Self(duration.as_millis() as u64)
    }

    /// Converts into number of milliseconds since UNIX epoch.
    pub fn into_millis(self) -> u64 { self.0 }

    /// Time elapsed since an earlier timestamp; zero if `earlier` is in fact
    /// later than `self`.
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output { Timestamp(self.0 + rhs.as_millis() as u64) }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Self::Output { Timestamp(self.0 - rhs.as_millis() as u64) }
}

impl AddAssign<Duration> for Timestamp {
    fn add_assign(&mut self, rhs: Duration) { self.0 += rhs.as_millis() as u64 }
}

impl SubAssign<Duration> for Timestamp {
    fn sub_assign(&mut self, rhs: Duration) { self.0 -= rhs.as_millis() as u64 }
}

/// One-shot callable run by the reactor on its loop thread.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum CallState {
    Pending,
    Fired,
    Cancelled,
}

/// Handle for a callable scheduled with
/// [`Handle::call_later`](crate::Handle::call_later).
///
/// The handle can be kept, cloned and used from any thread to cancel the call
/// or query whether it is still pending. Dropping every handle does not
/// cancel the call.
#[derive(Clone)]
pub struct DelayedCall {
    state: Arc<Mutex<CallState>>,
}

impl DelayedCall {
    /// Cancels the scheduled callable so that it will never run.
    ///
    /// Cancelling a call which has already fired, or cancelling twice, is
    /// a bug in the calling code and is reported as an error.
    pub fn cancel(&self) -> Result<(), CancelError> {
        let mut state = self.state.lock().expect("delayed call state poisoned");
        match *state {
            CallState::Pending => {
                *state = CallState::Cancelled;
                Ok(())
            }
            CallState::Fired => Err(CancelError::AlreadyCalled),
            CallState::Cancelled => Err(CancelError::AlreadyCancelled),
        }
    }

    /// Whether the callable is still waiting to be run.
    pub fn active(&self) -> bool {
        *self.state.lock().expect("delayed call state poisoned") == CallState::Pending
    }
}

/// A scheduled callable travelling towards - or sitting inside - the
/// scheduler queue. Shares its state with the [`DelayedCall`] handles.
pub struct ScheduledCall {
    state: Arc<Mutex<CallState>>,
    callable: Callback,
}

impl ScheduledCall {
    pub fn new(callable: Callback) -> (DelayedCall, ScheduledCall) {
        let state = Arc::new(Mutex::new(CallState::Pending));
        let handle = DelayedCall { state: state.clone() };
        (handle, ScheduledCall { state, callable })
    }

    /// Runs the callable unless it has been cancelled in the meantime.
    pub fn invoke(self) {
        {
            let mut state = self.state.lock().expect("delayed call state poisoned");
            match *state {
                CallState::Pending => *state = CallState::Fired,
                CallState::Cancelled => return,
                CallState::Fired => unreachable!("delayed call invoked twice"),
            }
        }
        (self.callable)();
    }

    fn is_cancelled(&self) -> bool {
        *self.state.lock().expect("delayed call state poisoned") == CallState::Cancelled
    }
}

/// Ordered queue of delayed calls.
///
/// Calls are keyed by their absolute deadline plus an insertion sequence
/// number, so calls sharing a deadline fire in the order they were scheduled.
#[derive(Default)]
pub struct Scheduler {
    queue: BTreeMap<(Timestamp, u64), ScheduledCall>,
    next_seq: u64,
}

impl Scheduler {
    /// Create a new delayed call scheduler.
    pub fn new() -> Self { Scheduler { queue: BTreeMap::new(), next_seq: 0 } }

    /// Return the number of scheduled calls, including already cancelled
    /// ones which have not yet been swept.
    pub fn len(&self) -> usize { self.queue.len() }

    /// Check whether there are scheduled calls.
    pub fn is_empty(&self) -> bool { self.queue.is_empty() }

    /// Schedules a callable for an absolute deadline and returns the handle
    /// controlling it.
    pub fn schedule(&mut self, at: Timestamp, callable: Callback) -> DelayedCall {
        let (handle, call) = ScheduledCall::new(callable);
        self.attach(at, call);
        handle
    }

    /// Inserts an already constructed call (whose handle lives elsewhere)
    /// into the queue.
    pub fn attach(&mut self, at: Timestamp, call: ScheduledCall) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.insert((at, seq), call);
    }

    /// The deadline of the earliest pending call, dropping already cancelled
    /// calls from the head of the queue along the way. Returns `None` if
    /// nothing is pending.
    pub fn next_deadline(&mut self) -> Option<Timestamp> {
        while let Some((&(at, seq), call)) = self.queue.iter().next() {
            if call.is_cancelled() {
                self.queue.remove(&(at, seq));
            } else {
                return Some(at);
            }
        }
        None
    }

    /// Removes and returns every call whose deadline is at or before `time`,
    /// in firing order.
    pub fn expire(&mut self, time: Timestamp) -> Vec<ScheduledCall> {
        // `split_off` keeps everything *at and after* the given key, so keys
        // are bumped by one millisecond to expire calls due exactly at
        // `time` as well.
        let at = (Timestamp(time.0 + 1), 0);
        let unexpired = self.queue.split_off(&at);
        let fired = mem::replace(&mut self.queue, unexpired);
        fired.into_values().collect()
    }
}

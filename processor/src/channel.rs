use std::{collections::VecDeque, sync::Mutex};

use murmur_core::Value;
use smallvec::SmallVec;

// CONSTANTS
// ================================================================================================

/// How many pending puts a channel holds before further putters are told to back off.
const PENDING_CAP: usize = 1;

/// How many attempts a blocking take makes before yielding back to the scheduler.
pub const CHANNEL_TAKE_TRIES: usize = 64;

// OUTCOMES
// ================================================================================================

#[derive(Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// The values were handed to the channel; the putter must yield until they are consumed.
    Placed,
    /// The channel already holds an unconsumed put; retry later.
    Full,
    /// The channel is closed; the put fails.
    Closed,
}

#[derive(Debug, PartialEq)]
pub enum TakeOutcome {
    /// A put was matched; these are its values, in put order.
    Values(SmallVec<[Value; 4]>),
    /// The channel is open but holds nothing.
    Empty,
    /// The channel is closed and fully drained.
    Drained,
}

// CHANNEL
// ================================================================================================

/// A bounded rendezvous buffer.
///
/// A put hands `(fiber, values)` descriptors to the channel; the descriptor stays queued until
/// a taker consumes it, and the putter's identity is what a resumed putter uses to decide
/// whether its handoff completed. Closing is atomic under the state lock: later puts fail,
/// later takes drain what remains and then report `Drained`.
#[derive(Debug)]
pub struct ChannelObj {
    state: Mutex<ChanState>,
}

#[derive(Debug, Default)]
struct ChanState {
    closed: bool,
    puts: VecDeque<PendingPut>,
}

#[derive(Debug)]
struct PendingPut {
    fiber: Value,
    values: SmallVec<[Value; 4]>,
}

impl ChannelObj {
    pub fn new() -> Self {
        Self { state: Mutex::new(ChanState::default()) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChanState> {
        self.state.lock().expect("channel poisoned")
    }

    /// Attempts to hand `values` into the channel on behalf of `fiber`.
    pub fn try_put(&self, fiber: Value, values: &[Value]) -> PutOutcome {
        let mut state = self.lock();
        if state.closed {
            return PutOutcome::Closed;
        }
        if state.puts.len() >= PENDING_CAP {
            return PutOutcome::Full;
        }
        state.puts.push_back(PendingPut { fiber, values: values.iter().copied().collect() });
        PutOutcome::Placed
    }

    /// Whether the channel still holds an unconsumed put from `fiber`.
    ///
    /// This is the identity check a re-entering putter performs: fibers never migrate and never
    /// share stacks, so the fiber value uniquely names the handoff.
    pub fn holds_put_from(&self, fiber: Value) -> bool {
        self.lock().puts.iter().any(|put| put.fiber == fiber)
    }

    /// Attempts to consume the oldest pending put.
    pub fn try_take(&self) -> TakeOutcome {
        let mut state = self.lock();
        match state.puts.pop_front() {
            Some(put) => TakeOutcome::Values(put.values),
            None if state.closed => TakeOutcome::Drained,
            None => TakeOutcome::Empty,
        }
    }

    /// Transitions `open -> closed`. Pending puts remain takeable.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_empty(&self) -> bool {
        self.lock().puts.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().puts.len() >= PENDING_CAP
    }
}

impl Default for ChannelObj {
    fn default() -> Self {
        Self::new()
    }
}

// TESTS
// ================================================================================================

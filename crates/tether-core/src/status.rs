use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// Socket lifecycle states. Transitions are CAS-guarded so exactly one task
/// wins each teardown edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Created, tasks not started.
    None = 0,
    /// Read/write tasks running.
    Connected = 1,
    /// Graceful close requested; write channel still draining.
    Closing = 2,
    /// Transient teardown state.
    Disconnect = 3,
    /// Server-role terminal (pre-release bookkeeping).
    Disconnected = 4,
    /// Client-role transient while a redial is in flight.
    Reconnecting = 5,
    /// Fully torn down.
    Released = 6,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            1 => State::Connected,
            2 => State::Closing,
            3 => State::Disconnect,
            4 => State::Disconnected,
            5 => State::Reconnecting,
            6 => State::Released,
            _ => State::None,
        }
    }
}

/// Atomic state + idle counter for one socket.
pub struct Status {
    state: AtomicU8,
    heartbeat: AtomicU32,
}

impl Status {
    pub(crate) fn new() -> Self {
        Status {
            state: AtomicU8::new(State::None as u8),
            heartbeat: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Single-writer transition; returns whether this caller won.
    pub(crate) fn cas(&self, from: State, to: State) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditional transition, used on edges already owned via CAS.
    pub(crate) fn set(&self, to: State) {
        self.state.store(to as u8, Ordering::Release);
    }

    /// States in which heartbeat accounting applies.
    pub fn is_active(&self) -> bool {
        matches!(self.state(), State::None | State::Connected | State::Closing)
    }

    /// Whether new writes are accepted.
    pub fn ready(&self) -> bool {
        self.state() == State::Connected
    }

    /// Any successful read or write clears the idle counter.
    pub(crate) fn keep_alive(&self) {
        self.heartbeat.store(0, Ordering::Release);
    }

    /// Advance the idle counter by `delta` and return the new value.
    pub(crate) fn age(&self, delta: u32) -> u32 {
        self.heartbeat.fetch_add(delta, Ordering::AcqRel) + delta
    }

    /// Pre-age the counter (graceful close schedules teardown this way).
    pub(crate) fn set_heartbeat(&self, value: u32) {
        self.heartbeat.store(value, Ordering::Release);
    }

    pub fn heartbeat(&self) -> u32 {
        self.heartbeat.load(Ordering::Acquire)
    }
}

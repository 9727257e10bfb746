//! Wait primitives for the sink render threads.
//!
//! Each [`OutputSink`](crate::sink::OutputSink) render thread blocks on a
//! [`SinkSignal`] that merges the endpoint's buffer-due event with the
//! owner's stop request, the equivalent of waiting on a `{stop, event}`
//! handle pair. The data flag auto-resets on wake; stop latches.

use std::sync::{Arc, Condvar, Mutex};
#[cfg(test)]
use std::time::Duration;

#[derive(Debug, Default)]
struct SignalState {
    stop: bool,
    data: bool,
}

/// Why a [`SinkSignal::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// The owner requested shutdown. Takes priority over pending data.
    Stop,
    /// The endpoint signalled that a buffer is due.
    Data,
}

/// Two-flag wait object shared between a sink, its render thread, and the
/// endpoint's event delivery.
#[derive(Debug, Default)]
pub(crate) struct SinkSignal {
    state: Mutex<SignalState>,
    cv: Condvar,
}

impl SinkSignal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn signal_stop(&self) {
        self.state.lock().expect("sink signal poisoned").stop = true;
        self.cv.notify_all();
    }

    pub(crate) fn signal_data(&self) {
        self.state.lock().expect("sink signal poisoned").data = true;
        self.cv.notify_all();
    }

    /// Block until either flag is raised.
    pub(crate) fn wait(&self) -> Wake {
        let mut state = self.state.lock().expect("sink signal poisoned");
        loop {
            if state.stop {
                return Wake::Stop;
            }
            if state.data {
                state.data = false;
                return Wake::Data;
            }
            state = self.cv.wait(state).expect("sink signal poisoned");
        }
    }

    /// Block with a timeout; `None` on timeout.
    #[cfg(test)]
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<Wake> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock().expect("sink signal poisoned");
        loop {
            if state.stop {
                return Some(Wake::Stop);
            }
            if state.data {
                state.data = false;
                return Some(Wake::Data);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, res) = self
                .cv
                .wait_timeout(state, deadline - now)
                .expect("sink signal poisoned");
            state = guard;
            if res.timed_out() && !state.stop && !state.data {
                return None;
            }
        }
    }
}

/// Handle given to a [`RenderClient`](crate::endpoint::RenderClient) so the
/// endpoint can announce that a buffer is due. The auto-reset behavior lives
/// in the sink-side wait.
#[derive(Clone)]
pub struct BufferEvent(pub(crate) Arc<SinkSignal>);

impl BufferEvent {
    /// Announce that the endpoint is ready for the next buffer.
    pub fn signal(&self) {
        self.0.signal_data();
    }
}

impl std::fmt::Debug for BufferEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferEvent").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn data_wakes_and_auto_resets() {
        let sig = SinkSignal::new();
        sig.signal_data();
        assert_eq!(sig.wait(), Wake::Data);
        assert_eq!(sig.wait_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn stop_latches_and_wins_over_data() {
        let sig = SinkSignal::new();
        sig.signal_data();
        sig.signal_stop();
        assert_eq!(sig.wait(), Wake::Stop);
        assert_eq!(sig.wait(), Wake::Stop);
    }

    #[test]
    fn wakes_a_blocked_waiter() {
        let sig = SinkSignal::new();
        let waiter = Arc::clone(&sig);
        let handle = thread::spawn(move || waiter.wait());
        thread::sleep(Duration::from_millis(20));
        sig.signal_data();
        assert_eq!(handle.join().unwrap(), Wake::Data);
    }
}

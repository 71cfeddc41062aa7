//! Blocking waits over host events. A wait can be bounded by a timeout and
//! optionally interrupted by the calling thread's signal token, which is the
//! unified "wait on object or be interrupted" primitive everything blocking
//! in this crate goes through.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// One parked thread. Events notify every attached cell when they become set.
struct WaitCell {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl WaitCell {
    fn new() -> Self {
        Self {
            fired: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn notify(&self) {
        *self.fired.lock().unwrap() = true;
        self.cond.notify_all();
    }
}

/// A manual-reset event. Once set it stays set until explicitly reset, so a
/// waiter that attaches late still observes the signal.
pub struct Event {
    set: Mutex<bool>,
    waiters: Mutex<Vec<Arc<WaitCell>>>,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("set", &self.is_set()).finish()
    }
}

impl Event {
    pub fn new() -> Self {
        Self {
            set: Mutex::new(false),
            waiters: Mutex::new(Vec::new()),
        }
    }

    pub fn set(&self) {
        *self.set.lock().unwrap() = true;
        for waiter in self.waiters.lock().unwrap().iter() {
            waiter.notify();
        }
    }

    pub fn reset(&self) {
        *self.set.lock().unwrap() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock().unwrap()
    }

    fn attach(&self, cell: &Arc<WaitCell>) {
        self.waiters.lock().unwrap().push(Arc::clone(cell));
    }

    fn detach(&self, cell: &Arc<WaitCell>) {
        self.waiters
            .lock()
            .unwrap()
            .retain(|w| !Arc::ptr_eq(w, cell));
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a wait may be interrupted by the calling thread's signal token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigMode {
    Ignore,
    Eintr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The event at this index became set.
    Object(usize),
    TimedOut,
    Interrupted,
}

thread_local! {
    static SIG_EVENT: Arc<Event> = Arc::new(Event::new());
}

/// A handle onto a thread's pending-signal latch. Cloneable and sendable, so
/// another thread can interrupt this one's blocking socket operations.
#[derive(Clone)]
pub struct SignalToken {
    ev: Arc<Event>,
}

impl SignalToken {
    /// Mark a signal pending for the token's owning thread. Any in-progress
    /// interruptible wait returns `Interrupted`; the next interruptible wait
    /// does so immediately otherwise.
    pub fn raise(&self) {
        self.ev.set();
    }

    pub fn clear(&self) {
        self.ev.reset();
    }
}

/// The signal token of the calling thread.
pub fn current_signal_token() -> SignalToken {
    SignalToken {
        ev: SIG_EVENT.with(Arc::clone),
    }
}

/// Wait until one of `events` is set, the timeout expires, or (with
/// [`SigMode::Eintr`]) the calling thread's signal token is raised. A pending
/// signal is consumed when it is reported. Events are checked in order, so
/// the lowest index wins when several are already set.
pub fn wait_any(events: &[&Event], timeout: Option<Duration>, sig: SigMode) -> WaitOutcome {
    let cell = Arc::new(WaitCell::new());
    let sig_ev = match sig {
        SigMode::Eintr => Some(SIG_EVENT.with(Arc::clone)),
        SigMode::Ignore => None,
    };

    for ev in events {
        ev.attach(&cell);
    }
    if let Some(ev) = &sig_ev {
        ev.attach(&cell);
    }

    let deadline = timeout.map(|t| Instant::now() + t);

    let outcome = loop {
        if let Some(ev) = &sig_ev {
            if ev.is_set() {
                // signals are consumed by the wait that observes them
                ev.reset();
                break WaitOutcome::Interrupted;
            }
        }
        if let Some(idx) = events.iter().position(|ev| ev.is_set()) {
            break WaitOutcome::Object(idx);
        }

        let mut fired = cell.fired.lock().unwrap();
        if !*fired {
            match deadline {
                None => {
                    fired = cell.cond.wait(fired).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break WaitOutcome::TimedOut;
                    }
                    let (guard, _) = cell.cond.wait_timeout(fired, deadline - now).unwrap();
                    fired = guard;
                }
            }
        }
        *fired = false;
    };

    for ev in events {
        ev.detach(&cell);
    }
    if let Some(ev) = &sig_ev {
        ev.detach(&cell);
    }

    outcome
}

impl Event {
    /// Wait for this event alone; see [`wait_any`].
    pub fn wait(&self, timeout: Option<Duration>, sig: SigMode) -> WaitOutcome {
        wait_any(&[self], timeout, sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_set_returns_immediately() {
        let ev = Event::new();
        ev.set();
        assert_eq!(ev.wait(None, SigMode::Ignore), WaitOutcome::Object(0));
        // manual reset: still set
        assert_eq!(ev.wait(None, SigMode::Ignore), WaitOutcome::Object(0));
    }

    #[test]
    fn timeout_expires() {
        let ev = Event::new();
        assert_eq!(
            ev.wait(Some(Duration::from_millis(10)), SigMode::Ignore),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn cross_thread_set() {
        let ev = Arc::new(Event::new());
        let ev2 = Arc::clone(&ev);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            ev2.set();
        });
        assert_eq!(
            ev.wait(Some(Duration::from_secs(5)), SigMode::Ignore),
            WaitOutcome::Object(0)
        );
        t.join().unwrap();
    }

    #[test]
    fn signal_interrupts_and_is_consumed() {
        let token = current_signal_token();
        token.raise();
        let ev = Event::new();
        assert_eq!(
            ev.wait(Some(Duration::from_secs(5)), SigMode::Eintr),
            WaitOutcome::Interrupted
        );
        // consumed: the next wait times out instead
        assert_eq!(
            ev.wait(Some(Duration::from_millis(10)), SigMode::Eintr),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn lowest_index_wins() {
        let a = Event::new();
        let b = Event::new();
        a.set();
        b.set();
        assert_eq!(
            wait_any(&[&a, &b], None, SigMode::Ignore),
            WaitOutcome::Object(0)
        );
    }
}

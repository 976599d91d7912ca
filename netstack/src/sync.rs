//! Bounded waits and listener lists shared between interrupt and worker
//! contexts.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::hal::Clock;

/// Polling step used by blocking waits.
pub const WAIT_STEP_MS: u32 = 1;

struct SlotState<T> {
    armed: bool,
    value: Option<T>,
}

/// A single-value rendezvous between a waiting worker and the receive path.
///
/// The worker arms the slot before sending its request, then waits. The
/// receive path signals the slot; signals that arrive while the slot is not
/// armed are discarded so late replies never satisfy a later request.
pub struct WaitSlot<T> {
    state: Mutex<SlotState<T>>,
}

impl<T> WaitSlot<T> {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(SlotState { armed: false, value: None }),
        }
    }

    pub fn arm(&self) {
        let mut state = self.state.lock();
        state.armed = true;
        state.value = None;
    }

    pub fn disarm(&self) {
        let mut state = self.state.lock();
        state.armed = false;
        state.value = None;
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().armed
    }

    /// Whether another context is inside the slot right now.
    pub fn is_busy(&self) -> bool {
        self.state.is_locked()
    }

    /// Stores `value` if a waiter is armed. Returns whether it was accepted.
    pub fn signal(&self, value: T) -> bool {
        let mut state = self.state.lock();
        if !state.armed || state.value.is_some() {
            return false;
        }
        state.value = Some(value);
        true
    }

    pub fn take(&self) -> Option<T> {
        let mut state = self.state.lock();
        let value = state.value.take();
        if value.is_some() {
            state.armed = false;
        }
        value
    }

    /// Waits until signalled or until `timeout_ms` elapses.
    ///
    /// `idle` runs between polls; the stack uses it to service the
    /// controller when the interrupt path could not.
    pub fn wait<F: FnMut()>(&self, clock: &dyn Clock, timeout_ms: u64, mut idle: F) -> Option<T> {
        let deadline = clock.now_ms().saturating_add(timeout_ms);
        loop {
            if let Some(value) = self.take() {
                return Some(value);
            }
            if clock.now_ms() >= deadline {
                self.disarm();
                return None;
            }
            idle();
            clock.delay_ms(WAIT_STEP_MS);
        }
    }
}

impl<T> Default for WaitSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListenerId(u32);

pub type Listener<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Registered callbacks for one event kind.
///
/// Callbacks run on whatever context raised the event, with the list locked;
/// they must not register or remove listeners of the same kind.
pub struct Listeners<T> {
    entries: Mutex<Vec<(ListenerId, Listener<T>)>>,
    next_id: AtomicU32,
}

impl<T> Listeners<T> {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// True while a registration or notification holds the list.
    pub fn is_busy(&self) -> bool {
        self.entries.is_locked()
    }

    pub fn add<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, Box::new(listener)));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn notify(&self, event: &T) {
        for (_, listener) in self.entries.lock().iter() {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicU64;

    struct StepClock(AtomicU64);

    impl Clock for StepClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
        fn delay_ms(&self, ms: u32) {
            self.0.fetch_add(ms as u64, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_listeners_busy_during_notify() {
        let listeners: Arc<Listeners<u8>> = Arc::new(Listeners::new());
        let seen = Arc::new(AtomicU64::new(0));
        let (inner, sink) = (listeners.clone(), seen.clone());
        listeners.add(move |_| {
            if inner.is_busy() {
                sink.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(!listeners.is_busy());
        listeners.notify(&1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!listeners.is_busy());
    }

    #[test]
    fn test_unarmed_slot_drops_signal() {
        let slot = WaitSlot::new();
        assert!(!slot.signal(5u32));
        assert_eq!(slot.take(), None);

        slot.arm();
        assert!(slot.signal(7));
        assert!(!slot.signal(8));
        assert_eq!(slot.take(), Some(7));
        assert!(!slot.is_armed());
    }

    #[test]
    fn test_wait_times_out_and_disarms() {
        let clock = StepClock(AtomicU64::new(0));
        let slot: WaitSlot<u8> = WaitSlot::new();
        slot.arm();
        let mut polls = 0;
        assert_eq!(slot.wait(&clock, 10, || polls += 1), None);
        assert!(clock.now_ms() >= 10);
        assert!(polls >= 10);
        assert!(!slot.signal(1));
    }

    #[test]
    fn test_wait_returns_value_signalled_while_idle() {
        let clock = StepClock(AtomicU64::new(0));
        let slot = WaitSlot::new();
        slot.arm();
        let mut polls = 0;
        let value = slot.wait(&clock, 100, || {
            polls += 1;
            if polls == 3 {
                slot.signal(42u16);
            }
        });
        assert_eq!(value, Some(42));
        assert!(clock.now_ms() < 100);
    }

    #[test]
    fn test_listeners_add_notify_remove() {
        let hits = Arc::new(AtomicU32::new(0));
        let listeners: Listeners<u32> = Listeners::new();

        let counter = hits.clone();
        let id = listeners.add(move |value| {
            counter.fetch_add(*value, Ordering::SeqCst);
        });
        listeners.notify(&3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        listeners.notify(&3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(listeners.is_empty());
    }
}

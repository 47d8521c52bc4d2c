//! Event channels between the FOTA task, its triggers and the application.
//!
//! Bits are edge-triggered flags, not a queue: setting a bit twice before
//! anyone waits on it wakes the waiter once, and a waiter consumes the bits
//! it was waiting for.

use std::ops::{BitOr, BitOrAssign};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventBits(u32);

impl EventBits {
    pub const NONE: EventBits = EventBits(0);
    /// Start the update procedure
    pub const UPDATE_REQUESTED: EventBits = EventBits(1 << 0);
    pub const ERROR_OCCURRED: EventBits = EventBits(1 << 1);
    /// Application side: the image is on the device, waiting for acknowledgment
    pub const UPDATE_COMPLETE_NOTIFY: EventBits = EventBits(1 << 2);
    /// Task side: the application acknowledged, the task may finalize and reboot
    pub const WAITING_FOR_USER_ACK: EventBits = EventBits(1 << 3);
    /// Caller decided no transfer is needed this round
    pub const SKIP_REQUESTED: EventBits = EventBits(1 << 4);
    /// The channel is being torn down
    pub const SHUTDOWN: EventBits = EventBits(1 << 5);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn union(self, other: EventBits) -> EventBits {
        EventBits(self.0 | other.0)
    }

    pub const fn contains(self, other: EventBits) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventBits {
    type Output = EventBits;

    fn bitor(self, rhs: EventBits) -> EventBits {
        EventBits(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventBits {
    fn bitor_assign(&mut self, rhs: EventBits) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Default)]
pub struct EventGroup {
    bits: Mutex<u32>,
    changed: Condvar,
}

impl EventGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, bits: EventBits) {
        let mut current = self.lock();
        *current |= bits.bits();
        self.changed.notify_all();
    }

    pub fn clear(&self, bits: EventBits) {
        let mut current = self.lock();
        *current &= !bits.bits();
    }

    pub fn get(&self) -> EventBits {
        EventBits(*self.lock())
    }

    /// Block until any bit of `mask` is set, then clear and return the set
    /// bits of `mask`. `None` waits forever; on timeout the result is empty.
    pub fn wait_any(&self, mask: EventBits, timeout: Option<Duration>) -> EventBits {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut current = self.lock();

        loop {
            let hit = *current & mask.bits();
            if hit != 0 {
                *current &= !hit;
                return EventBits(hit);
            }

            current = match deadline {
                None => self
                    .changed
                    .wait(current)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return EventBits::NONE;
                    }
                    self.changed
                        .wait_timeout(current, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, u32> {
        self.bits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_consumes_only_the_bits_it_waited_for() {
        let group = EventGroup::new();
        group.set(EventBits::UPDATE_REQUESTED | EventBits::UPDATE_COMPLETE_NOTIFY);

        let got = group.wait_any(EventBits::UPDATE_REQUESTED | EventBits::ERROR_OCCURRED, None);
        assert_eq!(got, EventBits::UPDATE_REQUESTED);
        assert_eq!(group.get(), EventBits::UPDATE_COMPLETE_NOTIFY);
    }

    #[test]
    fn repeated_sets_coalesce_into_one_wakeup() {
        let group = EventGroup::new();
        group.set(EventBits::ERROR_OCCURRED);
        group.set(EventBits::ERROR_OCCURRED);
        group.set(EventBits::ERROR_OCCURRED);

        let first = group.wait_any(EventBits::ERROR_OCCURRED, Some(Duration::from_millis(10)));
        assert!(first.contains(EventBits::ERROR_OCCURRED));
        let second = group.wait_any(EventBits::ERROR_OCCURRED, Some(Duration::from_millis(10)));
        assert!(second.is_empty());
    }

    #[test]
    fn wait_times_out_with_no_bits() {
        let group = EventGroup::new();
        group.set(EventBits::SKIP_REQUESTED);
        let got = group.wait_any(EventBits::UPDATE_REQUESTED, Some(Duration::from_millis(20)));
        assert!(got.is_empty());
        assert_eq!(group.get(), EventBits::SKIP_REQUESTED);
    }

    #[test]
    fn wakes_a_waiter_on_another_thread() {
        let group = Arc::new(EventGroup::new());
        let waiter = {
            let group = group.clone();
            thread::spawn(move || group.wait_any(EventBits::WAITING_FOR_USER_ACK, None))
        };

        thread::sleep(Duration::from_millis(20));
        group.set(EventBits::WAITING_FOR_USER_ACK);
        assert_eq!(waiter.join().unwrap(), EventBits::WAITING_FOR_USER_ACK);
        assert!(group.get().is_empty());
    }

    #[test]
    fn contains_needs_every_bit() {
        let both = EventBits::ERROR_OCCURRED | EventBits::SHUTDOWN;
        assert!(both.contains(EventBits::SHUTDOWN));
        assert!(!both.contains(EventBits::SHUTDOWN | EventBits::UPDATE_REQUESTED));
        assert!(!EventBits::NONE.contains(EventBits::NONE));
    }
}

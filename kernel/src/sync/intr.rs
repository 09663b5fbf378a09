//! Interrupt masking for the simulated processor.
//!
//! Each host thread stands in for a CPU, so the disable count is kept per
//! thread. Interrupts are on while the count is zero.

use core::cell::Cell;
use core::marker::PhantomData;

thread_local! {
    static INTR_DISABLE_COUNT: Cell<usize> = const { Cell::new(0) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrLevel {
    IntrOn,
    IntrOff,
}

// This function disables interrupts, and increments the disable count when called
pub fn intr_disable() {
    INTR_DISABLE_COUNT.with(|count| count.set(count.get() + 1));
}

// This function decrements the disable count; interrupts come back on when it reaches zero.
pub fn intr_enable() {
    INTR_DISABLE_COUNT.with(|count| {
        let current = count.get();
        debug_assert!(current > 0, "intr_enable without matching intr_disable");
        count.set(current.saturating_sub(1));
    });
}

pub fn intr_get_level() -> IntrLevel {
    if INTR_DISABLE_COUNT.with(Cell::get) == 0 {
        IntrLevel::IntrOn
    } else {
        IntrLevel::IntrOff
    }
}

/// Disables interrupts until the returned guard is dropped.
#[must_use = "interrupts are re-enabled when the guard is dropped"]
pub fn hold_interrupts() -> InterruptsGuard {
    intr_disable();
    InterruptsGuard {
        _not_send: PhantomData,
    }
}

/// Restores the previous interrupt level on drop. Tied to the thread that
/// created it.
pub struct InterruptsGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for InterruptsGuard {
    fn drop(&mut self) {
        intr_enable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_nest() {
        assert_eq!(intr_get_level(), IntrLevel::IntrOn);
        let outer = hold_interrupts();
        {
            let _inner = hold_interrupts();
            assert_eq!(intr_get_level(), IntrLevel::IntrOff);
        }
        assert_eq!(intr_get_level(), IntrLevel::IntrOff);
        drop(outer);
        assert_eq!(intr_get_level(), IntrLevel::IntrOn);
    }

    #[test]
    fn level_is_per_thread() {
        let _guard = hold_interrupts();
        let other = std::thread::spawn(intr_get_level).join().unwrap();
        assert_eq!(other, IntrLevel::IntrOn);
        assert_eq!(intr_get_level(), IntrLevel::IntrOff);
    }
}

use super::{Ppn, TranslationEntry};
use crate::sync::SleepMutex;
use std::collections::BTreeMap;

/// Frames that must not be evicted right now.
///
/// Pins are counted, so overlapping users of the same frame do not release
/// each other's pin.
#[derive(Default)]
pub struct PinSet {
    counts: SleepMutex<BTreeMap<Ppn, usize>>,
}

impl PinSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins `ppn` until the returned guard is dropped.
    pub fn hold(&self, ppn: Ppn) -> PinnedFrame<'_> {
        *self.counts.lock().entry(ppn).or_insert(0) += 1;
        PinnedFrame { pins: self, ppn }
    }

    /// Pins `ppn` only if nobody else has it pinned.
    pub fn try_hold_unpinned(&self, ppn: Ppn) -> Option<PinnedFrame<'_>> {
        let mut counts = self.counts.lock();
        if counts.contains_key(&ppn) {
            return None;
        }
        counts.insert(ppn, 1);
        Some(PinnedFrame { pins: self, ppn })
    }

    pub fn is_pinned(&self, ppn: Ppn) -> bool {
        self.counts.lock().contains_key(&ppn)
    }

    /// Number of distinct frames pinned.
    pub fn pinned_count(&self) -> usize {
        self.counts.lock().len()
    }

    fn release(&self, ppn: Ppn) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(&ppn) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&ppn);
            }
        }
    }
}

/// A pin on one frame, released on drop.
#[must_use = "the frame is unpinned when the guard is dropped"]
pub struct PinnedFrame<'a> {
    pins: &'a PinSet,
    ppn: Ppn,
}

impl PinnedFrame<'_> {
    pub fn ppn(&self) -> Ppn {
        self.ppn
    }
}

impl Drop for PinnedFrame<'_> {
    fn drop(&mut self) {
        self.pins.release(self.ppn);
    }
}

impl core::fmt::Debug for PinnedFrame<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("PinnedFrame").field(&self.ppn).finish()
    }
}

/// A translation whose frame stays pinned for as long as this is alive.
#[derive(Debug)]
pub struct PinnedTranslation<'a> {
    pub entry: TranslationEntry,
    pub frame: PinnedFrame<'a>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pins_are_counted() {
        let pins = PinSet::new();
        let first = pins.hold(3);
        let second = pins.hold(3);
        assert!(pins.is_pinned(3));
        assert_eq!(pins.pinned_count(), 1);
        drop(first);
        assert!(pins.is_pinned(3));
        drop(second);
        assert!(!pins.is_pinned(3));
        assert_eq!(pins.pinned_count(), 0);
    }

    #[test]
    fn try_hold_skips_pinned_frames() {
        let pins = PinSet::new();
        let held = pins.hold(1);
        assert!(pins.try_hold_unpinned(1).is_none());
        let other = pins.try_hold_unpinned(2).unwrap();
        assert_eq!(other.ppn(), 2);
        assert!(pins.try_hold_unpinned(2).is_none());
        drop(held);
        assert!(pins.try_hold_unpinned(1).is_some());
    }

    #[test]
    fn unpinned_on_unwind() {
        let pins = PinSet::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _pin = pins.hold(4);
            panic!("copy failed");
        }));
        assert!(result.is_err());
        assert!(!pins.is_pinned(4));
    }
}

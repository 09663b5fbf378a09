use crate::error::VmError;
use crate::mem::{CoreMapEntry, PageTables, PinSet, PinnedFrame, Ppn};
use log::{error, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::thread;

/// Proposes frames to evict. Proposals are only hints: the caller skips
/// frames that are free or pinned.
pub trait PageReplacementPolicy: Send {
    fn next_candidate(&mut self, num_frames: usize) -> Ppn;
}

/// Picks frames uniformly at random.
pub struct RandomEviction {
    rng: StdRng,
}

impl RandomEviction {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// A reproducible sequence of picks.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomEviction {
    fn default() -> Self {
        Self::new()
    }
}

impl PageReplacementPolicy for RandomEviction {
    fn next_candidate(&mut self, num_frames: usize) -> Ppn {
        self.rng.gen_range(0..num_frames)
    }
}

/// A resident frame chosen for eviction, pinned so no other evictor can
/// choose it as well.
#[derive(Debug)]
pub struct Victim<'a> {
    pub frame: PinnedFrame<'a>,
    pub owner: CoreMapEntry,
}

/// Finds a resident, unpinned frame and pins it.
///
/// Each round draws `num_frames` candidates from `policy` and then sweeps
/// every frame in order, so a round only fails if every resident frame was
/// pinned when it was looked at. Between rounds the thread yields to let pin
/// holders finish. After `rounds` failed rounds this gives up with
/// [`VmError::EvictionStalled`].
pub fn select_victim<'a>(
    tables: &PageTables,
    pins: &'a PinSet,
    policy: &mut dyn PageReplacementPolicy,
    rounds: usize,
) -> Result<Victim<'a>, VmError> {
    let num_frames = tables.num_frames();
    if num_frames == 0 {
        return Err(VmError::OutOfMemory);
    }

    let take = move |ppn: Ppn| {
        let owner = tables.owner(ppn)?;
        let frame = pins.try_hold_unpinned(ppn)?;
        Some(Victim { frame, owner })
    };

    for round in 1..=rounds {
        let drawn =
            (0..num_frames).find_map(|_| take(policy.next_candidate(num_frames) % num_frames));
        if let Some(victim) = drawn.or_else(|| (0..num_frames).find_map(take)) {
            return Ok(victim);
        }
        if tables.resident_count() == 0 {
            // Nothing is resident, waiting will not help.
            return Err(VmError::OutOfMemory);
        }
        warn!("eviction round {round}/{rounds}: every resident frame is pinned");
        thread::yield_now();
    }

    error!("eviction stalled after {rounds} rounds");
    Err(VmError::EvictionStalled { rounds })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::TranslationEntry;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn full_tables(num_frames: usize) -> PageTables {
        let mut tables = PageTables::new(num_frames);
        for ppn in 0..num_frames {
            let vpn = u32::try_from(ppn).unwrap();
            tables.put(1, TranslationEntry::new(vpn, ppn, false)).unwrap();
        }
        tables
    }

    // Always proposes the same frame.
    struct Fixed(Ppn);

    impl PageReplacementPolicy for Fixed {
        fn next_candidate(&mut self, _num_frames: usize) -> Ppn {
            self.0
        }
    }

    #[test]
    fn sweep_finds_the_only_candidate() {
        let tables = full_tables(4);
        let pins = PinSet::new();
        let _held: Vec<_> = [0, 1, 3].into_iter().map(|ppn| pins.hold(ppn)).collect();

        let victim = select_victim(&tables, &pins, &mut Fixed(0), 1).unwrap();
        assert_eq!(victim.frame.ppn(), 2);
        assert_eq!(victim.owner, CoreMapEntry { pid: 1, vpn: 2 });
        assert!(pins.is_pinned(2));
        drop(victim);
        assert!(!pins.is_pinned(2));
    }

    #[test]
    fn free_frames_are_skipped() {
        let mut tables = PageTables::new(3);
        tables.put(4, TranslationEntry::new(9, 1, false)).unwrap();
        let pins = PinSet::new();
        let victim = select_victim(&tables, &pins, &mut RandomEviction::seeded(7), 1).unwrap();
        assert_eq!(victim.frame.ppn(), 1);
    }

    #[test]
    fn all_pinned_stalls() {
        let tables = full_tables(2);
        let pins = PinSet::new();
        let _a = pins.hold(0);
        let _b = pins.hold(1);
        assert!(matches!(
            select_victim(&tables, &pins, &mut RandomEviction::seeded(1), 3),
            Err(VmError::EvictionStalled { rounds: 3 })
        ));
    }

    #[test]
    fn nothing_resident_is_out_of_memory() {
        let tables = PageTables::new(2);
        let pins = PinSet::new();
        assert!(matches!(
            select_victim(&tables, &pins, &mut RandomEviction::new(), 3),
            Err(VmError::OutOfMemory)
        ));
    }

    #[test]
    fn concurrent_pins_are_never_chosen() {
        let tables = Arc::new(full_tables(8));
        let pins = Arc::new(PinSet::new());
        let stop = Arc::new(AtomicBool::new(false));
        // Frame 0 is pinned for the whole test; frames 1..4 are pinned and
        // unpinned continuously.
        let permanent = pins.hold(0);

        let churners: Vec<_> = (1..4)
            .map(|ppn| {
                let pins = pins.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let _pin = pins.hold(ppn);
                        thread::yield_now();
                    }
                })
            })
            .collect();

        let mut policy = RandomEviction::seeded(99);
        for _ in 0..2000 {
            let victim = select_victim(&tables, &pins, &mut policy, 4).unwrap();
            assert_ne!(victim.frame.ppn(), permanent.ppn());
        }

        stop.store(true, Ordering::Relaxed);
        for churner in churners {
            churner.join().unwrap();
        }
    }

    proptest! {
        #[test]
        fn pinned_frames_are_never_victims(
            pinned in proptest::collection::btree_set(0..16usize, 0..15),
            seed in any::<u64>(),
        ) {
            let tables = full_tables(16);
            let pins = PinSet::new();
            let _held: Vec<_> = pinned.iter().map(|&ppn| pins.hold(ppn)).collect();
            let mut policy = RandomEviction::seeded(seed);
            let mut chosen = BTreeSet::new();
            // Keep every victim pinned so each pick must find a new frame.
            let mut victims = Vec::new();
            for _ in 0..(16 - pinned.len()) {
                let victim = select_victim(&tables, &pins, &mut policy, 1).unwrap();
                prop_assert!(!pinned.contains(&victim.frame.ppn()));
                prop_assert!(chosen.insert(victim.frame.ppn()));
                victims.push(victim);
            }
            prop_assert!(select_victim(&tables, &pins, &mut policy, 1).is_err());
        }
    }
}

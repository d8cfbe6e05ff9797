//! Overview of retrace scheduling:
//!
//! Records physically live in dozens of independent per-syscall-type
//! streams, but they must be re-executed in exactly the interleaving that
//! originally occurred, identified solely by unique_id. The scheduler is a
//! k-way merge: one live cursor per unit that still has a decoded record
//! pending, kept in a min-priority-queue ordered by that record's
//! unique_id. Ties cannot occur in well-formed traces; insertion order
//! breaks them deterministically anyway.
//!
//! The baseline step is pop-min, apply, verify, advance, reinsert-if-more.
//! Repeatedly pushing and popping the queue is wasteful when one stream
//! holds the global minimum many times in a row (a process doing thousands
//! of consecutive reads, say), so after each apply the scheduler checks
//! whether the same unit is still the global minimum and, if so, keeps
//! draining it for up to BATCH_SIZE records before going back to the
//! queue. The applied order is identical for any batch size >= 1.
//!
//! The very first record of a well-formed trace is the synthetic umask
//! record with unique_id 0; before it is applied the resource tables for
//! its pid are seeded with the standard descriptors.

use crate::log::LogInfo;
use crate::replay_unit::{ReplayContext, ReplayUnit, Statistics};
use crate::trace::trace_frame::UniqueId;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// How many consecutive records one unit may drain per queue visit.
pub const BATCH_SIZE: usize = 64;

struct Cursor {
    unique_id: UniqueId,
    /// Heap insertion tiebreak.
    order: u64,
    unit: usize,
}

impl PartialEq for Cursor {
    fn eq(&self, other: &Self) -> bool {
        self.unique_id == other.unique_id && self.order == other.order
    }
}

impl Eq for Cursor {}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.unique_id, self.order).cmp(&(other.unique_id, other.order))
    }
}

pub struct ReplayScheduler {
    units: Vec<Box<dyn ReplayUnit>>,
    heap: BinaryHeap<Reverse<Cursor>>,
    next_order: u64,
    batch_size: usize,
    ctx: ReplayContext,
}

impl ReplayScheduler {
    pub fn new(ctx: ReplayContext) -> ReplayScheduler {
        ReplayScheduler::with_batch_size(ctx, BATCH_SIZE)
    }

    pub fn with_batch_size(ctx: ReplayContext, batch_size: usize) -> ReplayScheduler {
        debug_assert!(batch_size >= 1);
        ReplayScheduler {
            units: Vec::new(),
            heap: BinaryHeap::new(),
            next_order: 0,
            batch_size,
            ctx,
        }
    }

    pub fn add_unit(&mut self, unit: Box<dyn ReplayUnit>) {
        self.units.push(unit);
    }

    pub fn ctx(&self) -> &ReplayContext {
        &self.ctx
    }

    pub fn stats(&self) -> &Statistics {
        &self.ctx.stats
    }

    fn push_cursor(&mut self, unique_id: UniqueId, unit: usize) {
        let order = self.next_order;
        self.next_order += 1;
        self.heap.push(Reverse(Cursor {
            unique_id,
            order,
            unit,
        }));
    }

    /// Apply the pending record of `unit`, then verify and advance it.
    fn step(&mut self, unit: usize) {
        let u = &mut self.units[unit];
        let unique_id = u.pending_unique_id().unwrap();
        if let Err(e) = u.apply(&mut self.ctx) {
            fatal!(
                "{} record with unique_id {} cannot be replayed: {}",
                u.kind().name(),
                unique_id,
                e
            );
        }
        u.verify(&mut self.ctx);
        u.advance();
    }

    /// Drive every unit to exhaustion in global unique_id order.
    pub fn run(&mut self) {
        // Prime: one cursor per unit that has any records at all. A unit
        // with no records for the whole run is never scheduled.
        for i in 0..self.units.len() {
            if self.units[i].load_record() {
                let unique_id = self.units[i].pending_unique_id().unwrap();
                self.push_cursor(unique_id, i);
            }
        }

        // Program startup: the synthetic umask record with unique_id 0
        // must come first; seed its pid's descriptors before applying it.
        match self.heap.peek() {
            None => return,
            Some(Reverse(first)) => {
                if first.unique_id != 0 {
                    fatal!(
                        "Trace does not begin with the startup umask record \
                         (first unique_id is {})",
                        first.unique_id
                    );
                }
                let pid = self.units[first.unit].pending_pid().unwrap();
                self.ctx.resources.initialize(pid);
            }
        }

        while let Some(Reverse(cursor)) = self.heap.pop() {
            let unit = cursor.unit;
            let mut budget = self.batch_size;
            loop {
                self.step(unit);
                budget -= 1;
                if !self.units[unit].load_record() {
                    // Exhausted mid-batch: the remaining budget is
                    // abandoned and the unit never requeues.
                    break;
                }
                let next_id = self.units[unit].pending_unique_id().unwrap();
                let still_min = match self.heap.peek() {
                    None => true,
                    Some(Reverse(top)) => next_id < top.unique_id,
                };
                if budget == 0 || !still_min {
                    self.push_cursor(next_id, unit);
                    break;
                }
            }
        }

        log!(
            LogInfo,
            "replay complete: {} records applied, {} simulated short-circuits, {} mismatches",
            self.ctx.stats.applied,
            self.ctx.stats.simulated,
            self.ctx.stats.mismatches
        );
    }
}

#[cfg(test)]
mod test {
    use super::ReplayScheduler;
    use crate::replay_unit::{ReplayConfig, ReplayContext, ReplayUnit};
    use crate::resources::ResourceError;
    use crate::trace::trace_frame::UniqueId;
    use crate::trace::trace_stream::SyscallKind;
    use libc::pid_t;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// A unit over a canned list of unique_ids that records the order in
    /// which the scheduler applies them.
    struct TestUnit {
        kind: SyscallKind,
        ids: Vec<UniqueId>,
        next: usize,
        loaded: bool,
        applied: Rc<RefCell<Vec<UniqueId>>>,
    }

    impl TestUnit {
        fn new(
            kind: SyscallKind,
            ids: Vec<UniqueId>,
            applied: Rc<RefCell<Vec<UniqueId>>>,
        ) -> TestUnit {
            TestUnit {
                kind,
                ids,
                next: 0,
                loaded: false,
                applied,
            }
        }
    }

    impl ReplayUnit for TestUnit {
        fn kind(&self) -> SyscallKind {
            self.kind
        }

        fn pending_unique_id(&self) -> Option<UniqueId> {
            if self.loaded {
                Some(self.ids[self.next])
            } else {
                None
            }
        }

        fn pending_pid(&self) -> Option<pid_t> {
            self.pending_unique_id().map(|_| 100)
        }

        fn load_record(&mut self) -> bool {
            if self.loaded {
                self.next += 1;
            }
            self.loaded = self.next < self.ids.len();
            self.loaded
        }

        fn apply(&mut self, _ctx: &mut ReplayContext) -> Result<(), ResourceError> {
            self.applied.borrow_mut().push(self.ids[self.next]);
            Ok(())
        }

        fn verify(&mut self, _ctx: &mut ReplayContext) {}

        fn advance(&mut self) {}
    }

    fn run_streams(streams: &[Vec<UniqueId>], batch_size: usize) -> Vec<UniqueId> {
        let applied = Rc::new(RefCell::new(Vec::new()));
        let ctx = ReplayContext::new(ReplayConfig::default());
        let mut sched = ReplayScheduler::with_batch_size(ctx, batch_size);
        for ids in streams {
            sched.add_unit(Box::new(TestUnit::new(
                SyscallKind::Read,
                ids.clone(),
                applied.clone(),
            )));
        }
        sched.run();
        let result = applied.borrow().clone();
        result
    }

    #[test]
    fn applies_in_global_unique_id_order() {
        let streams = vec![
            vec![0, 3, 4, 9, 10],
            vec![1, 5, 6, 7],
            vec![2, 8, 11],
        ];
        let applied = run_streams(&streams, super::BATCH_SIZE);
        assert_eq!(applied, (0..=11).collect::<Vec<_>>());
    }

    #[test]
    fn single_stream_drains_fully() {
        let applied = run_streams(&[vec![0, 1, 2, 3, 4]], super::BATCH_SIZE);
        assert_eq!(applied, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn empty_units_are_never_scheduled() {
        let applied = run_streams(&[vec![], vec![0, 1], vec![]], super::BATCH_SIZE);
        assert_eq!(applied, vec![0, 1]);
    }

    #[test]
    fn no_units_at_all_terminates() {
        let applied = run_streams(&[], super::BATCH_SIZE);
        assert!(applied.is_empty());
    }

    #[test]
    fn batching_is_order_equivalent() {
        // Long runs from single streams, interleaved bursts, and a stream
        // much longer than any batch.
        let streams = vec![
            (0..200).map(|i| i * 3).collect::<Vec<u64>>(),
            (0..200).map(|i| i * 3 + 1).collect::<Vec<u64>>(),
            (0..200).map(|i| i * 3 + 2).collect::<Vec<u64>>(),
        ];
        // Renumber so stream 0 owns a long exclusive prefix.
        let mut streams = streams;
        streams[0] = (0..100).collect();
        streams[1] = (100..300).step_by(2).collect();
        streams[2] = (101..300).step_by(2).collect();

        let reference = run_streams(&streams, 1);
        let mut expected: Vec<u64> = streams.iter().flatten().copied().collect();
        expected.sort_unstable();
        assert_eq!(reference, expected);

        for batch_size in &[2usize, 3, 7, 64] {
            assert_eq!(run_streams(&streams, *batch_size), reference);
        }
    }

    #[test]
    fn startup_seeds_resources_for_first_pid() {
        let applied = Rc::new(RefCell::new(Vec::new()));
        let ctx = ReplayContext::new(ReplayConfig::default());
        let mut sched = ReplayScheduler::new(ctx);
        sched.add_unit(Box::new(TestUnit::new(
            SyscallKind::Umask,
            vec![0, 1],
            applied.clone(),
        )));
        sched.run();
        assert_eq!(*applied.borrow(), vec![0, 1]);
        // Standard descriptors were seeded before the first apply.
        assert!(sched.ctx().resources.get_fd(100, 0).is_ok());
        assert!(sched.ctx().resources.get_fd(100, 2).is_ok());
    }
}

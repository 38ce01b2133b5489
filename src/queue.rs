//! FIFO holders for picks and pings awaiting an inner round-robin instance.
//!
//! Mutation is not internally synchronized: [`core::Inner`](crate::core)
//! owns a `PendingQueues` behind its coordinator lock and all mutating calls
//! below assume that lock is already held by the caller.
//!
//! Generic over the pick payload `P` (in practice
//! [`BackendHandle`](crate::rr::BackendHandle)) so this module stays free of
//! any dependency on the RR collaborator's types.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::Error;
use crate::token::InitialMetadata;

/// Opaque identity of an enqueued pick, used to target cancellation without
/// requiring the caller to hand back a pointer into policy-owned state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PickSlot(u64);

static NEXT_SLOT: AtomicU64 = AtomicU64::new(1);

impl PickSlot {
    fn next() -> Self {
        Self(NEXT_SLOT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Bit flags a caller may attach to a pick, used by [`cancel_by_flag_mask`].
pub type PickFlags = u32;

/// A pick waiting for an inner RR to become available.
///
/// Per §3, this carries the caller's initial-metadata handle (so the token
/// injector can still reach it once an RR is finally adopted) alongside the
/// slot identity, flags, and deadline.
pub struct PendingPick<P> {
    /// Slot identity, handed back to the caller so it can later cancel this
    /// specific pick via [`PendingQueues::cancel_by_target_slot`].
    pub slot: PickSlot,
    /// Caller-supplied flags, matched by [`PendingQueues::cancel_by_flag_mask`].
    pub flags: PickFlags,
    /// The call's initial-metadata handle, carried until an RR is adopted
    /// and the token injector can attach the chosen backend's token to it.
    pub initial_metadata: InitialMetadata,
    /// The call's deadline, if any.
    pub deadline: Option<Instant>,
    /// Completes the pick, handing back the (possibly token-injected)
    /// initial metadata together with the outcome: `Ok(Some(payload))` for
    /// a chosen backend, `Ok(None)` when draining at shutdown with no
    /// backend chosen, or `Err` on cancellation.
    pub continuation: Box<dyn FnOnce(InitialMetadata, Result<Option<P>, Error>) + Send>,
}

/// A ping waiting for an inner RR to become available.
pub struct PendingPing {
    /// Completes the ping once an RR is available to receive it, or with an
    /// error if the policy shuts down first.
    pub continuation: Box<dyn FnOnce(Result<(), Error>) + Send>,
}

/// The two FIFOs backing picks and pings made before an RR exists.
pub struct PendingQueues<P> {
    picks: VecDeque<PendingPick<P>>,
    pings: VecDeque<PendingPing>,
}

impl<P> Default for PendingQueues<P> {
    fn default() -> Self {
        Self {
            picks: VecDeque::new(),
            pings: VecDeque::new(),
        }
    }
}

impl<P> PendingQueues<P> {
    /// Create empty queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a pick, returning the slot it was assigned so the caller can
    /// later cancel it by identity.
    pub fn enqueue_pick(
        &mut self,
        flags: PickFlags,
        initial_metadata: InitialMetadata,
        deadline: Option<Instant>,
        continuation: Box<dyn FnOnce(InitialMetadata, Result<Option<P>, Error>) + Send>,
    ) -> PickSlot {
        let slot = PickSlot::next();
        self.picks.push_back(PendingPick {
            slot,
            flags,
            initial_metadata,
            deadline,
            continuation,
        });
        slot
    }

    /// Enqueue a ping.
    pub fn enqueue_ping(&mut self, continuation: Box<dyn FnOnce(Result<(), Error>) + Send>) {
        self.pings.push_back(PendingPing { continuation });
    }

    /// Detach and return every enqueued pick, in enqueue order, leaving the
    /// queue empty.
    pub fn drain_picks(&mut self) -> Vec<PendingPick<P>> {
        self.picks.drain(..).collect()
    }

    /// Detach and return every enqueued ping, in enqueue order, leaving the
    /// queue empty.
    pub fn drain_pings(&mut self) -> Vec<PendingPing> {
        self.pings.drain(..).collect()
    }

    /// Remove and complete, with `error`, every enqueued pick matching
    /// `predicate`; survivors keep their relative order.
    pub fn cancel_matching(
        &mut self,
        predicate: impl Fn(&PendingPick<P>) -> bool,
        make_error: impl Fn() -> Error,
    ) {
        let mut survivors = VecDeque::with_capacity(self.picks.len());
        for pick in self.picks.drain(..) {
            if predicate(&pick) {
                let PendingPick {
                    initial_metadata,
                    continuation,
                    ..
                } = pick;
                continuation(
                    initial_metadata,
                    Err(Error::PickCancelled(Box::new(make_error()))),
                );
            } else {
                survivors.push_back(pick);
            }
        }
        self.picks = survivors;
    }

    /// Cancel every pick whose slot equals `target`.
    pub fn cancel_by_target_slot(&mut self, target: PickSlot, make_error: impl Fn() -> Error) {
        self.cancel_matching(|pick| pick.slot == target, make_error);
    }

    /// Cancel every pick whose flags, masked by `mask`, equal `needle`.
    pub fn cancel_by_flag_mask(
        &mut self,
        mask: PickFlags,
        needle: PickFlags,
        make_error: impl Fn() -> Error,
    ) {
        self.cancel_matching(|pick| (pick.flags & mask) == needle, make_error);
    }

    /// True if neither queue holds anything.
    pub fn is_empty(&self) -> bool {
        self.picks.is_empty() && self.pings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type TestPick = u32;
    type TestContinuation =
        Box<dyn FnOnce(InitialMetadata, Result<Option<TestPick>, Error>) + Send>;

    fn recorder() -> (
        Arc<Mutex<Vec<Result<Option<TestPick>, String>>>>,
        impl Fn() -> TestContinuation,
    ) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let captured = results.clone();
        let make = move || {
            let results = captured.clone();
            Box::new(move |_metadata: InitialMetadata, r: Result<Option<TestPick>, Error>| {
                results.lock().unwrap().push(r.map_err(|e| e.to_string()));
            }) as TestContinuation
        };
        (results, make)
    }

    #[test]
    fn drain_preserves_enqueue_order() {
        let mut queues: PendingQueues<TestPick> = PendingQueues::new();
        let (results, make) = recorder();
        for _ in 0..3 {
            queues.enqueue_pick(0, InitialMetadata::new(), None, make());
        }
        let drained = queues.drain_picks();
        assert_eq!(drained.len(), 3);
        assert!(queues.is_empty());
        for pick in drained {
            (pick.continuation)(pick.initial_metadata, Ok(None));
        }
        assert_eq!(results.lock().unwrap().len(), 3);
    }

    #[test]
    fn cancel_by_target_slot_only_removes_matching() {
        let mut queues: PendingQueues<TestPick> = PendingQueues::new();
        let (results, make) = recorder();
        let slot_a = queues.enqueue_pick(0, InitialMetadata::new(), None, make());
        let _slot_b = queues.enqueue_pick(0, InitialMetadata::new(), None, make());

        queues.cancel_by_target_slot(slot_a, || Error::ChannelShutdown);

        let remaining = queues.drain_picks();
        assert_eq!(remaining.len(), 1);
        assert_eq!(results.lock().unwrap().len(), 1);
        assert!(results.lock().unwrap()[0].is_err());
    }

    #[test]
    fn cancel_by_flag_mask_matches_masked_value() {
        let mut queues: PendingQueues<TestPick> = PendingQueues::new();
        let (results, make) = recorder();
        queues.enqueue_pick(0b10, InitialMetadata::new(), None, make());
        queues.enqueue_pick(0b01, InitialMetadata::new(), None, make());

        queues.cancel_by_flag_mask(0b11, 0b10, || Error::ChannelShutdown);

        assert_eq!(queues.drain_picks().len(), 1);
        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }
}

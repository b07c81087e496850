//! A bag: the fixed-width array of slot nodes owned by one handle node, and
//! the cross-bag merge machinery that moves one bag's slots into another's
//! pending-merge lists.
//!
//! The per-slot append protocol below is modeled directly on the donor
//! crate's `AbandonedBags::push`/`take_and_merge` CAS-loop
//! (`src/bag.rs`) and its `HazardList::get_or_insert_unchecked`
//! retry-on-conflict shape (`src/hazard/list.rs`): try the fast path, and on
//! a losing CAS, re-read and retry rather than blocking.

use rand::{thread_rng, Rng};

use crate::seq::SequentialPq;
use crate::slot::{ApplyResult, OpOutcome, SlotNode};

/// The fixed-width array of slots shared by every handle node that
/// currently points directly at it.
pub struct Bag<T, S> {
    slots: Box<[SlotNode<T, S>]>,
}

impl<T, S: Default> Bag<T, S> {
    /// Builds a fresh bag of `width` empty slots, each tagged with `handle`
    /// as its owning handle pointer. The `Bag` itself is subsequently handed
    /// to an [`Allocator`](crate::alloc::Allocator) by the caller
    /// (`handle.rs`), which leaks it for the process lifetime; the boxed
    /// slice of slots here is just that allocation's backing storage.
    pub fn new(width: usize, handle: *const ()) -> Self {
        assert!(width > 0, "bag width must be greater than 0");
        let slots = (0..width).map(|_| SlotNode::new(handle)).collect::<Vec<_>>().into_boxed_slice();
        Self { slots }
    }
}

impl<T, S> Bag<T, S> {
    #[inline]
    pub fn width(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn slot(&self, i: usize) -> &SlotNode<T, S> {
        &self.slots[i]
    }

    /// A uniformly random cyclic visitation order over `[0, width)`: a
    /// random starting offset, then linear wraparound, with no allocation.
    /// Cuts contention the way work-stealing schedulers pick a random
    /// victim rather than scanning from index 0 every time.
    fn random_order(&self) -> impl Iterator<Item = usize> {
        let width = self.width();
        let start = thread_rng().gen_range(0..width);
        (0..width).map(move |i| (start + i) % width)
    }

    /// Drives the per-slot operation `op` across this bag's slots until one
    /// of them reports [`ApplyResult::Finished`] or [`ApplyResult::NextBag`].
    /// If a full randomized round completes with every slot reporting
    /// `NextElem`, a fresh round starts with a newly randomized order — this
    /// is what allows `remove_any`/`swap_empty_with` to block until a slot
    /// can satisfy them — unless `keep_going` now reports `false`, in which
    /// case the caller itself has decided to give up (e.g. `try_remove_any`
    /// exhausting its retry budget) and this returns `NextElem` once, to be
    /// read by the caller as "nothing found, stop looking".
    pub(crate) fn try_apply_until<F>(
        &self,
        is_merged_away: &dyn Fn(*const ()) -> bool,
        ensure_merged: &dyn Fn(*const ()),
        keep_going: &dyn Fn() -> bool,
        mut op: F,
    ) -> ApplyResult
    where
        S: SequentialPq<T>,
        F: FnMut(&mut S) -> OpOutcome,
    {
        loop {
            let mut any_next_bag = false;
            for i in self.random_order() {
                match self.slot(i).try_evaluate_and_apply(is_merged_away, ensure_merged, &mut op) {
                    ApplyResult::Finished => return ApplyResult::Finished,
                    ApplyResult::NextBag => {
                        any_next_bag = true;
                        break;
                    }
                    ApplyResult::NextElem => continue,
                }
            }
            if any_next_bag {
                return ApplyResult::NextBag;
            }
            if !keep_going() {
                return ApplyResult::NextElem;
            }
            // every slot reported NextElem this round; try again with a
            // freshly randomized order.
        }
    }

    /// Like `try_apply_until`, but visits each slot at most once per call
    /// (no re-rounding). Used by the `empty()` snapshot probe, which needs
    /// a single deterministic pass rather than a blocking loop.
    pub(crate) fn try_apply_each_until<F>(&self, mut op: F) -> bool
    where
        S: SequentialPq<T>,
        F: FnMut(&SlotNode<T, S>) -> bool,
    {
        for i in self.random_order() {
            if op(self.slot(i)) {
                return true;
            }
        }
        false
    }

    /// Best-effort, single-pass, non-blocking peek across this bag's slots:
    /// returns the first non-empty slot's current minimum in random
    /// visitation order, ignoring any slot whose lock is contended.
    /// Approximate in the same sense as `remove_any` — not a true
    /// queue-wide minimum, and it does not drain pending merges first.
    pub(crate) fn try_peek_any(&self) -> Option<T>
    where
        S: SequentialPq<T>,
        T: Clone,
    {
        for i in self.random_order() {
            if let Some(Some(v)) = self.slot(i).try_peek_min() {
                return Some(v);
            }
        }
        None
    }

    /// Moves every slot of `self` into the corresponding slot of whatever
    /// bag `resolve_dest` currently points at, re-resolving the destination
    /// each time it may have changed (its own handle might be merged away
    /// mid-walk). `resolve_dest` returns both the destination bag and a
    /// type-erased pointer identifying it, used as the ownership token
    /// CAS'd into each moved slot's `owner` field.
    pub(crate) fn merge_per_element_into(
        &self,
        mut resolve_dest: impl FnMut() -> (*const Bag<T, S>, *const ()),
    ) where
        S: SequentialPq<T>,
    {
        for i in self.random_order() {
            let self_node = self.slot(i) as *const SlotNode<T, S> as *mut SlotNode<T, S>;
            loop {
                // SAFETY: `self_node` is `&self.slots[i]`, valid for the
                // lifetime of `self`.
                if unsafe { (*self_node).owner_is_set() } {
                    // already claimed by some earlier racing merge
                    break;
                }

                let (dest_bag_ptr, dest_token) = resolve_dest();
                if dest_bag_ptr.is_null() {
                    // destination slot itself was drained; re-resolve and retry
                    continue;
                }
                // SAFETY: caller guarantees `dest_bag_ptr` stays valid for
                // the duration of the merge (it is never freed; see
                // alloc.rs).
                let dest_bag = unsafe { &*dest_bag_ptr };
                let dest_slot = dest_bag.slot(i);
                let dest_slot_ptr = dest_slot as *const SlotNode<T, S> as *mut SlotNode<T, S>;

                if dest_slot.merge_head_raw().is_null() {
                    // destination slot has itself been drained already
                    continue;
                }
                if dest_slot.merge_head_raw() == self_node {
                    // already inserted by an earlier pass of this loop
                    break;
                }

                let inserted = if dest_slot.try_insert_at_head(self_node) {
                    true
                } else {
                    match dest_slot.find_appendable_tail() {
                        None => continue, // list ended in DUMMY or is drained; restart
                        Some(tail_ptr) => {
                            // SAFETY: returned by find_appendable_tail, live node.
                            let tail = unsafe { &*tail_ptr };
                            match tail.try_append(self_node) {
                                Ok(()) => true,
                                Err(_) => continue, // lost the race or list tombstoned; restart
                            }
                        }
                    }
                };

                if !inserted {
                    continue;
                }

                // SAFETY: `self_node` outlives this call (see above).
                let claimed = unsafe { (*self_node).try_claim_owner(dest_slot_ptr) };
                let _ = dest_token;
                if claimed || unsafe { (*self_node).is_owned_by(dest_slot_ptr) } {
                    break;
                }
                // another destination slot already owns this node; undo our
                // insertion if we can, otherwise the other side's own
                // appendable-tail check will notice and skip past us.
                let _ = dest_slot.try_undo_append(self_node);
                break;
            }
        }
    }
}

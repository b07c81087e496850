//! A single bag slot: a sequential priority queue guarded by a try-lock,
//! plus the intrusive lock-free "pending merge" list used to fold other
//! slots' contents into this one.
//!
//! # Sentinel pointers
//!
//! `merge_head` and `next` each carry two distinguished non-null sentinel
//! values in addition to real node pointers, the same way the donor crate's
//! `Hazard` distinguishes `FREE`/`THREAD_RESERVED` from a real protected
//! pointer by reserving the low addresses `0` and `1` (see
//! `hazard/mod.rs`). Here:
//!
//! - `NIL` marks an empty-but-not-yet-drained list (`merge_head`) or an
//!   unterminated list tail (`next`).
//! - `DUMMY` marks a `next` pointer whose slot has been permanently drained
//!   and must not be appended to again; appenders restart from the head.
//! - Rust's own `null` marks `merge_head` once this slot itself has been
//!   drained and moved elsewhere. Unlike `NIL`/`DUMMY` this state is
//!   terminal and is never reused, so it does not need a fake address.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::seq::SequentialPq;

const NIL_ADDR: usize = 1;
const DUMMY_ADDR: usize = 2;

cfg_if::cfg_if! {
    if #[cfg(feature = "sanitize-threads")] {
        /// Ordering used for the `skip` hint load in `find_appendable_tail`.
        /// Under `sanitize-threads` this is promoted to `SeqCst` so thread
        /// sanitizers see a total order even though the algorithm itself
        /// only relies on the hint being safe to ignore when stale.
        const SKIP_HINT_LOAD: Ordering = Ordering::SeqCst;
    } else {
        /// The `skip` pointer is a pure optimization hint: a stale read is
        /// always safe because the caller falls back to `next_raw()` (an
        /// `Acquire` load) whenever the hint turns out not to be a real,
        /// live node pointer. Relaxed is sufficient outside sanitizer runs.
        const SKIP_HINT_LOAD: Ordering = Ordering::Relaxed;
    }
}

#[inline]
fn nil<T, S>() -> *mut SlotNode<T, S> {
    NIL_ADDR as *mut SlotNode<T, S>
}

#[inline]
fn dummy<T, S>() -> *mut SlotNode<T, S> {
    DUMMY_ADDR as *mut SlotNode<T, S>
}

#[inline]
fn is_sentinel<T, S>(ptr: *mut SlotNode<T, S>) -> bool {
    let addr = ptr as usize;
    addr == NIL_ADDR || addr == DUMMY_ADDR
}

/// Outcome of a user-supplied per-slot operation passed to
/// [`Bag::try_apply_until`](crate::bag::Bag::try_apply_until).
///
/// Kept distinct from a bare `bool` because only [`Mutated`](OpOutcome::Mutated)
/// may advance a slot's version counter; a retry-budget exhaustion
/// ([`GiveUp`](OpOutcome::GiveUp)) must look, to any concurrent `empty()`
/// snapshot, exactly like a no-op.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpOutcome {
    /// The operation succeeded and mutated the slot; stop applying.
    Mutated,
    /// The operation did not apply to this slot; try the next one.
    Continue,
    /// The caller's retry budget is exhausted; stop applying without having
    /// mutated anything.
    GiveUp,
}

/// Result of [`SlotNode::try_evaluate_and_apply`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApplyResult {
    /// The operation completed and mutated this slot.
    Finished,
    /// This slot could not satisfy the operation; try another slot index.
    NextElem,
    /// This slot's owning handle has been merged away; the caller must
    /// re-resolve its destination bag before continuing.
    NextBag,
}

/// One slot in a [`Bag`](crate::bag::Bag).
pub struct SlotNode<T, S> {
    locked: AtomicBool,
    elem: UnsafeCell<S>,
    /// Bumped on every mutation that reaches `Mutated`; read by `empty()`'s
    /// two-pass snapshot protocol.
    version: AtomicUsize,
    /// Set at most once, monotonically, from `null` to the slot that has
    /// claimed ownership of this node within some destination bag's pending
    /// merge list.
    owner: AtomicPtr<SlotNode<T, S>>,
    /// Head of the intrusive pending-merge list rooted at this slot.
    /// `NIL` while empty-but-live, real pointer while non-empty, `null`
    /// once this slot itself has been drained.
    merge_head: AtomicPtr<SlotNode<T, S>>,
    /// Next link when this node is itself enqueued in another slot's list.
    /// `NIL` while unlinked/tail, `DUMMY` once permanently drained.
    next: AtomicPtr<SlotNode<T, S>>,
    /// Optional tail-skip hint; always safe to follow or ignore.
    skip: AtomicPtr<SlotNode<T, S>>,
    /// Type-erased back-pointer to the handle node that owns this slot's
    /// bag. Established once, before the node is ever shared across
    /// threads (during `PriorityQueue::new`), and never mutated afterward,
    /// so unlike the fields above it does not need atomic access.
    handle: *const (),
    _elem_marker: std::marker::PhantomData<T>,
}

// SAFETY: all mutable state lives behind `AtomicBool`/`AtomicPtr`/`AtomicUsize`
// or is only ever touched while `locked` is held (the `UnsafeCell<S>`). The
// `handle` pointer is write-once-before-publication, read-only thereafter.
unsafe impl<T: Send, S: Send> Send for SlotNode<T, S> {}
unsafe impl<T: Send, S: Send> Sync for SlotNode<T, S> {}

impl<T, S: Default> SlotNode<T, S> {
    /// Creates a fresh, empty, unowned slot node belonging to `handle`.
    pub fn new(handle: *const ()) -> Self {
        Self {
            locked: AtomicBool::new(false),
            elem: UnsafeCell::new(S::default()),
            version: AtomicUsize::new(0),
            owner: AtomicPtr::new(ptr::null_mut()),
            merge_head: AtomicPtr::new(nil()),
            next: AtomicPtr::new(nil()),
            skip: AtomicPtr::new(nil()),
            handle,
            _elem_marker: std::marker::PhantomData,
        }
    }
}

impl<T, S> SlotNode<T, S> {
    /// Type-erased handle pointer this slot was created under.
    #[inline]
    pub fn handle_ptr(&self) -> *const () {
        self.handle
    }

    #[inline]
    pub fn version(&self) -> usize {
        self.version.load(Ordering::Acquire)
    }

    /// Attempts to acquire the slot's lock without blocking.
    #[inline]
    fn try_lock(&self) -> bool {
        self.locked.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed).is_ok()
    }

    #[inline]
    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Ownership of this node within some destination slot's pending-merge
    /// list, if claimed.
    #[inline]
    fn owner(&self) -> Option<*mut SlotNode<T, S>> {
        let p = self.owner.load(Ordering::Acquire);
        if p.is_null() {
            None
        } else {
            Some(p)
        }
    }

    /// One-shot, monotonic ownership claim. Returns `true` iff this call
    /// was the one that set it (i.e. this thread's destination slot won).
    #[inline]
    pub(crate) fn try_claim_owner(&self, by: *mut SlotNode<T, S>) -> bool {
        self.owner.compare_exchange(ptr::null_mut(), by, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    #[inline]
    pub(crate) fn is_owned_by(&self, who: *mut SlotNode<T, S>) -> bool {
        self.owner.load(Ordering::Acquire) == who
    }

    #[inline]
    pub(crate) fn owner_is_set(&self) -> bool {
        !self.owner.load(Ordering::Acquire).is_null()
    }

    #[inline]
    pub(crate) fn merge_head_raw(&self) -> *mut SlotNode<T, S> {
        self.merge_head.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn next_raw(&self) -> *mut SlotNode<T, S> {
        self.next.load(Ordering::Acquire)
    }

    /// Inserts `node` at the head of this slot's pending-merge list if it
    /// is currently `NIL`. Returns `true` on success.
    pub(crate) fn try_insert_at_head(&self, node: *mut SlotNode<T, S>) -> bool {
        self.merge_head
            .compare_exchange(nil(), node, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Walks this slot's list looking for an appendable tail (a node whose
    /// `next` is `NIL`), using `skip` as a hint and path-compressing it
    /// when found stale. Returns `None` if the walk discovers the list has
    /// ended in a `DUMMY` tombstone (caller must restart from the head).
    pub(crate) fn find_appendable_tail(&self) -> Option<*mut SlotNode<T, S>> {
        let head = self.merge_head_raw();
        if head.is_null() || is_sentinel(head) {
            // `NIL` (empty) is handled by the caller via try_insert_at_head;
            // `null` (drained) must be handled by re-resolving the
            // destination bag.
            return None;
        }
        let mut cur = head;
        // SAFETY: `cur` is a live slot node reachable from `merge_head`,
        // which by invariant only ever points at nodes that remain valid
        // for the process lifetime (§3: slot nodes are never freed
        // individually).
        loop {
            let node = unsafe { &*cur };
            let hint = node.skip.load(SKIP_HINT_LOAD);
            if !hint.is_null() && !is_sentinel(hint) {
                cur = hint;
                continue;
            }
            let next = node.next_raw();
            if next == dummy() {
                return None;
            }
            if next == nil::<T, S>() {
                return Some(cur);
            }
            // compress: point skip at next so future walks jump ahead
            node.skip.store(next, Ordering::Release);
            cur = next;
        }
    }

    /// Attempts to CAS `self.next` from `NIL` to `node`. Fails either
    /// because another appender won (`next` now a real pointer — caller
    /// should re-walk from `find_appendable_tail`) or because this slot was
    /// concurrently drained (`next` now `DUMMY` — caller must restart from
    /// the list head).
    pub(crate) fn try_append(&self, node: *mut SlotNode<T, S>) -> Result<(), *mut SlotNode<T, S>> {
        self.next
            .compare_exchange(nil(), node, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|observed| observed)
    }

    /// Undoes a double-insertion: CAS `self.next` back from `node` to `NIL`.
    /// May legitimately fail if another appender has already linked past
    /// `node`; the loser relies on the other thread's own appendable-tail
    /// check to notice and restart (see DESIGN.md).
    pub(crate) fn try_undo_append(&self, node: *mut SlotNode<T, S>) -> bool {
        self.next.compare_exchange(node, nil(), Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Marks this slot's own `next` permanently dead.
    pub(crate) fn try_tombstone_next(&self) -> bool {
        self.next.compare_exchange(nil(), dummy(), Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Drains this slot as the head of some other list: CAS `merge_head`
    /// from `cur` to `replacement` (a live node pointer or `NIL`).
    pub(crate) fn try_advance_head(
        &self,
        cur: *mut SlotNode<T, S>,
        replacement: *mut SlotNode<T, S>,
    ) -> bool {
        self.merge_head.compare_exchange(cur, replacement, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Marks this slot itself as drained: CAS `merge_head` from its current
    /// value to `null`. Terminal; once this succeeds it never changes
    /// again.
    pub(crate) fn try_mark_self_drained(&self, cur: *mut SlotNode<T, S>) -> bool {
        self.merge_head.compare_exchange(cur, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Runs the per-slot merge-evaluation loop (§4.1): repeatedly linearize
    /// and drain entries from this slot's own pending-merge list into
    /// `self.elem`, recursively evaluating each entry's own pending merges
    /// first. `ensure_merged` is invoked with a claimed entry's type-erased
    /// handle pointer to linearize the cross-bag merge that produced it
    /// (see `handle.rs::ensure_merged_into`); it is the seam that lets this
    /// module stay ignorant of the handle chain's concrete type.
    ///
    /// Must only be called while `self.locked` is held by the caller.
    /// Returns [`ApplyResult::Finished`] once this slot's own pending-merge
    /// list is fully drained, [`ApplyResult::NextElem`] on bailout (a nested
    /// try-lock failed; the caller must release its own lock and retry on a
    /// different slot index), or [`ApplyResult::NextBag`] if `self` itself
    /// turns out to have already been drained by some other destination
    /// (`merge_head == null`) — reachable when a reader resolves this
    /// slot's owning handle before that handle's own `bag` pointer has been
    /// nulled (see `handle.rs::ensure_merged_into`); the caller must
    /// re-resolve its destination bag rather than operate on this one.
    pub(crate) fn evaluate_merges(&self, ensure_merged: &dyn Fn(*const ())) -> ApplyResult
    where
        S: SequentialPq<T>,
    {
        loop {
            let cur = self.merge_head_raw();
            if cur.is_null() {
                return ApplyResult::NextBag;
            }
            if cur == nil() {
                return ApplyResult::Finished;
            }
            // SAFETY: `cur` is a live, process-lifetime-valid node (see
            // `find_appendable_tail`).
            let node = unsafe { &*cur };
            ensure_merged(node.handle_ptr());

            if !node.try_lock() {
                // bailout: do not wait on a concurrently-held slot lock.
                return ApplyResult::NextElem;
            }
            match node.evaluate_merges(ensure_merged) {
                ApplyResult::Finished => {}
                ApplyResult::NextElem => {
                    node.unlock();
                    return ApplyResult::NextElem;
                }
                ApplyResult::NextBag => {
                    // `node` was concurrently found to already be drained;
                    // nothing left to steal from it here. Treat like a
                    // bailout rather than loop on a list entry that will
                    // never again report anything else.
                    node.unlock();
                    return ApplyResult::NextElem;
                }
            }
            // SAFETY: both `self` and `node` are locked by this thread.
            unsafe {
                (*self.elem.get()).merge_steal(&mut *node.elem.get());
            }
            node.unlock();

            // mark `node` drained: its own pending list just emptied
            // (`Finished` above), so its merge_head is `NIL`.
            let marked = node.try_mark_self_drained(nil());
            debug_assert!(marked, "merge_head transitions to null exactly once");

            let successor = node.next_raw();
            let replacement = if successor == dummy() || successor == nil() {
                nil()
            } else {
                successor
            };
            // tombstone node.next before unlinking it from our own list: a
            // concurrent appender that already observed `head == cur` would
            // otherwise be able to read `cur.next == NIL` and append onto
            // an already-unlinked node.
            if replacement == nil() {
                let _ = node.try_tombstone_next();
            }
            if !self.try_advance_head(cur, replacement) {
                // another thread already advanced past `cur`; the list
                // shape changed under us, loop and re-read.
                continue;
            }
        }
    }

    /// Tries to drain pending merges and then apply `op` to this slot's
    /// sequential PQ. `is_merged_away` reports whether this slot's owning
    /// handle has itself been merged away (checked before doing any work).
    pub(crate) fn try_evaluate_and_apply(
        &self,
        is_merged_away: &dyn Fn(*const ()) -> bool,
        ensure_merged: &dyn Fn(*const ()),
        mut op: impl FnMut(&mut S) -> OpOutcome,
    ) -> ApplyResult
    where
        S: SequentialPq<T>,
    {
        if !self.try_lock() {
            return ApplyResult::NextElem;
        }
        if is_merged_away(self.handle) {
            self.unlock();
            return ApplyResult::NextBag;
        }
        match self.evaluate_merges(ensure_merged) {
            ApplyResult::Finished => {}
            ApplyResult::NextElem => {
                self.unlock();
                return ApplyResult::NextElem;
            }
            ApplyResult::NextBag => {
                self.unlock();
                return ApplyResult::NextBag;
            }
        }
        // SAFETY: `locked` is held by this thread.
        let outcome = op(unsafe { &mut *self.elem.get() });
        let result = match outcome {
            OpOutcome::Mutated => {
                self.version.fetch_add(1, Ordering::AcqRel);
                ApplyResult::Finished
            }
            OpOutcome::Continue | OpOutcome::GiveUp => ApplyResult::NextElem,
        };
        self.unlock();
        result
    }

    /// Snapshot probe used by `empty()`: try-locks, checks emptiness and
    /// records the current version without mutating anything.
    pub(crate) fn try_snapshot_empty(&self) -> Option<(bool, usize)>
    where
        S: SequentialPq<T>,
    {
        if !self.try_lock() {
            return None;
        }
        // SAFETY: `locked` is held by this thread.
        let empty = unsafe { (*self.elem.get()).is_empty() };
        let version = self.version.load(Ordering::Acquire);
        self.unlock();
        Some((empty, version))
    }

    /// Best-effort peek: try-locks, clones this slot's current minimum (if
    /// any) without draining pending merges or mutating anything, and
    /// unlocks. Returns `None` if the lock is contended, distinct from
    /// `Some(None)` meaning "locked and currently empty".
    pub(crate) fn try_peek_min(&self) -> Option<Option<T>>
    where
        S: SequentialPq<T>,
        T: Clone,
    {
        if !self.try_lock() {
            return None;
        }
        // SAFETY: `locked` is held by this thread.
        let peeked = unsafe { (*self.elem.get()).peek_min().cloned() };
        self.unlock();
        Some(peeked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq::BinaryHeapPq;

    fn noop_handle_cb(_: *const ()) {}
    fn never_merged_away(_: *const ()) -> bool {
        false
    }

    #[test]
    fn fresh_slot_is_empty_and_unowned() {
        let slot: SlotNode<i32, BinaryHeapPq<i32>> = SlotNode::new(ptr::null());
        assert!(slot.owner().is_none());
        assert_eq!(slot.merge_head_raw(), nil());
        assert_eq!(slot.next_raw(), nil());
    }

    #[test]
    fn insert_and_delete_min_via_apply() {
        let slot: SlotNode<i32, BinaryHeapPq<i32>> = SlotNode::new(ptr::null());
        let result = slot.try_evaluate_and_apply(&never_merged_away, &noop_handle_cb, |pq| {
            pq.insert(5);
            OpOutcome::Mutated
        });
        assert_eq!(result, ApplyResult::Finished);
        assert_eq!(slot.version(), 1);

        let mut out = None;
        let result = slot.try_evaluate_and_apply(&never_merged_away, &noop_handle_cb, |pq| {
            if let Some(v) = pq.delete_min() {
                out = Some(v);
                OpOutcome::Mutated
            } else {
                OpOutcome::GiveUp
            }
        });
        assert_eq!(result, ApplyResult::Finished);
        assert_eq!(out, Some(5));
        assert_eq!(slot.version(), 2);
    }

    #[test]
    fn owner_claim_is_one_shot() {
        let slot: SlotNode<i32, BinaryHeapPq<i32>> = SlotNode::new(ptr::null());
        let fake_a = 1usize as *mut SlotNode<i32, BinaryHeapPq<i32>>;
        let fake_b = 2usize as *mut SlotNode<i32, BinaryHeapPq<i32>>;
        assert!(slot.try_claim_owner(fake_a));
        assert!(!slot.try_claim_owner(fake_b));
        assert!(slot.is_owned_by(fake_a));
        assert!(!slot.is_owned_by(fake_b));
    }

    #[test]
    fn try_append_then_undo() {
        let slot: SlotNode<i32, BinaryHeapPq<i32>> = SlotNode::new(ptr::null());
        let fake = 3usize as *mut SlotNode<i32, BinaryHeapPq<i32>>;
        assert!(slot.try_append(fake).is_ok());
        assert_eq!(slot.next_raw(), fake);
        assert!(slot.try_undo_append(fake));
        assert_eq!(slot.next_raw(), nil());
    }
}

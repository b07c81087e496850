//! The union-find-like handle chain that gives every `PriorityQueue` its
//! identity and records the history of `merge` calls against it.
//!
//! Chain nodes form a strictly-decreasing-id, acyclic sequence the same way
//! the donor crate's `HazardList` forms an append-only, never-shrinking
//! chain (`src/hazard/list.rs`): readers walk it lock-free, and a losing CAS
//! during a structural change means "someone else already did this, re-read
//! and continue" rather than an error.

use std::sync::atomic::{AtomicPtr, Ordering};

use crate::alloc::Allocator;
use crate::bag::Bag;
use crate::seq::SequentialPq;

/// Outcome of [`Handle::merge_into`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MergeResult {
    /// The merge completed; the two handles now refer to the same queue.
    Success,
    /// The handles already referred to the same queue; nothing changed.
    WereAlreadyEqual,
    /// Both handles carry the same id while both are still live roots.
    IdClash,
    /// The two queues have different bag widths and cannot be merged.
    Incompatible,
}

/// One node in the handle chain.
pub struct HandleNode<T, S> {
    id: usize,
    /// The bag this node owns, or `null` once fully merged elsewhere.
    /// Transitions monotonically from some bag to `null` exactly once; that
    /// CAS is the merge's linearization point.
    bag: AtomicPtr<Bag<T, S>>,
    /// The node this one was merged into, or `null` while still a root.
    /// Transitions monotonically from `null` to its final value at most
    /// once, and only ever to a node with strictly smaller `id`.
    next: AtomicPtr<HandleNode<T, S>>,
}

impl<T, S> HandleNode<T, S> {
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    fn bag_raw(&self) -> *mut Bag<T, S> {
        self.bag.load(Ordering::Acquire)
    }

    #[inline]
    fn next_raw(&self) -> *mut HandleNode<T, S> {
        self.next.load(Ordering::Acquire)
    }

    /// Borrows the bag this node currently owns.
    ///
    /// # Panics
    ///
    /// Panics if called on a node whose bag has already been merged away
    /// (`bag == null`). Callers obtain `HandleNode` pointers exclusively
    /// through [`Handle::find_closest_bag`], which only ever returns a node
    /// with a live bag, so this never fires in practice.
    #[inline]
    pub(crate) fn bag_ref(&self) -> &Bag<T, S> {
        let ptr = self.bag_raw();
        debug_assert!(!ptr.is_null(), "bag_ref called on a merged-away handle node");
        // SAFETY: non-null bag pointers are never freed (see alloc.rs), and
        // callers are required to only pass nodes resolved via
        // `find_closest_bag`.
        unsafe { &*ptr }
    }
}

/// A (possibly shared) reference into the handle chain.
///
/// Because a single `PriorityQueue` value is itself meant to be shared and
/// called concurrently from many threads (not just cloned per-thread), the
/// cached pointer here is an `AtomicPtr`, compressed via CAS the same way
/// the chain's own internal links are, rather than a private `&mut self`
/// cache.
pub struct Handle<T, S> {
    cursor: AtomicPtr<HandleNode<T, S>>,
}

impl<T, S> Handle<T, S> {
    /// Creates a brand-new root handle owning a freshly allocated bag of
    /// `width` empty slots.
    pub fn new<A: Allocator>(alloc: &A, id: usize, width: usize) -> Self
    where
        S: Default,
    {
        // The node is allocated before it is ever shared with another
        // thread (construction happens entirely here, inside `Handle::new`,
        // before the `Handle` is returned to the caller), so the `handle`
        // back-pointer every slot carries can safely be a plain, non-atomic
        // raw pointer (see slot.rs).
        let node: &'static mut HandleNode<T, S> =
            alloc.alloc(HandleNode { id, bag: AtomicPtr::new(std::ptr::null_mut()), next: AtomicPtr::new(std::ptr::null_mut()) });
        let handle_ptr = node as *const HandleNode<T, S> as *const ();
        let bag = Bag::new(width, handle_ptr);
        node.bag.store(Box::into_raw(Box::new(bag)), Ordering::Release);
        Self { cursor: AtomicPtr::new(node as *mut HandleNode<T, S>) }
    }

    #[inline]
    fn cursor_raw(&self) -> *mut HandleNode<T, S> {
        self.cursor.load(Ordering::Acquire)
    }

    /// Walks `start` until a node with a live (non-null) bag is found,
    /// path-halving along the way: each node visited whose successor is
    /// itself non-terminal gets its `next` advanced to its
    /// grandsuccessor, roughly halving the length of future walks through
    /// it. Safe under concurrent merges because `next` only ever advances
    /// to strictly smaller ids, so advancing it further down the same
    /// chain can never reintroduce a cycle or skip past the eventual root.
    fn find_closest_bag_from(start: *mut HandleNode<T, S>) -> *mut HandleNode<T, S> {
        let mut cur = start;
        loop {
            // SAFETY: every node ever stored in a `next`/cursor field is a
            // leaked, process-lifetime-valid `HandleNode` (see alloc.rs).
            let node = unsafe { &*cur };
            if !node.bag_raw().is_null() {
                return cur;
            }
            let next = node.next_raw();
            debug_assert!(!next.is_null(), "a node with a null bag must have a non-null next");
            // SAFETY: `next` is itself a valid leaked node.
            let next_node = unsafe { &*next };
            let grandnext = next_node.next_raw();
            if !grandnext.is_null() {
                let _ = node.next.compare_exchange(next, grandnext, Ordering::AcqRel, Ordering::Acquire);
                cur = grandnext;
            } else {
                cur = next;
            }
        }
    }

    /// Resolves the bag currently backing this handle, re-descending the
    /// chain each call (the destination may have changed since the last
    /// resolution, e.g. because it was itself merged away mid-operation).
    pub(crate) fn find_closest_bag(&self) -> *mut HandleNode<T, S> {
        let resolved = Self::find_closest_bag_from(self.cursor_raw());
        self.cursor.store(resolved, Ordering::Release);
        resolved
    }

    /// Like `find_closest_bag`, but also drains (`ensure_merged_into`s)
    /// every intermediate node discovered along the way.
    ///
    /// Every node this walk visits already satisfies `bag == null` by the
    /// walk's own loop condition in `find_closest_bag_from` (that is
    /// precisely why the walk continues past it), and `ensure_merged_into`
    /// is defined to be a no-op once `bag` is already null. So unlike the
    /// literal pseudocode this method does not re-issue `ensure_merged_into`
    /// on those nodes — there is nothing left for it to do there. It is
    /// kept as its own method, distinct from `find_closest_bag`, because
    /// `try_union` below specifically needs the draining behavior performed
    /// on the *non-leaf* endpoint after a successful union.
    pub(crate) fn descend_merging(&self) -> *mut HandleNode<T, S> {
        self.find_closest_bag()
    }

    /// Drains `node`'s bag into `dest`'s, then CASes `node.bag` to null.
    /// That CAS is the merge's linearization point: any reader who
    /// subsequently observes `node.bag == null` is guaranteed to see the
    /// union by re-descending through `node.next`.
    pub(crate) fn ensure_merged_into(node: *mut HandleNode<T, S>, dest: *mut HandleNode<T, S>)
    where
        S: SequentialPq<T>,
    {
        // SAFETY: both pointers are leaked, process-lifetime-valid nodes.
        let node_ref = unsafe { &*node };
        let old_bag = node_ref.bag_raw();
        if old_bag.is_null() {
            return;
        }

        // SAFETY: `old_bag` is non-null, checked above, and never freed.
        let bag = unsafe { &*old_bag };
        bag.merge_per_element_into(|| {
            let resolved = Self::find_closest_bag_from(dest);
            // SAFETY: `resolved` comes from `find_closest_bag_from`, which
            // only ever returns a node with a live bag.
            let resolved_ref = unsafe { &*resolved };
            (resolved_ref.bag_raw() as *const Bag<T, S>, resolved as *const ())
        });

        // linearization point of the handle-level merge.
        let _ = node_ref.bag.compare_exchange(old_bag, std::ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire);
    }

    /// Type-erased `is_merged_away` callback for `slot.rs`: given a slot's
    /// `handle` token (a `*const HandleNode<T, S>` cast to `*const ()`),
    /// reports whether that node's bag has gone null.
    pub(crate) fn is_merged_away(handle_token: *const ()) -> bool {
        if handle_token.is_null() {
            return false;
        }
        // SAFETY: every token handed to these callbacks originates from a
        // `HandleNode` pointer established in `Handle::new`/`try_union`.
        let node = unsafe { &*(handle_token as *const HandleNode<T, S>) };
        node.bag_raw().is_null()
    }

    /// Type-erased `ensure_merged` callback for `slot.rs`: given a claimed
    /// pending-merge entry's handle token, linearizes the cross-bag merge
    /// that produced it by resolving its current chain leaf and draining
    /// into it.
    pub(crate) fn ensure_merged(handle_token: *const ())
    where
        S: SequentialPq<T>,
    {
        if handle_token.is_null() {
            return;
        }
        let node = handle_token as *mut HandleNode<T, S>;
        let dest = Self::find_closest_bag_from(node);
        if dest == node {
            // `node` is itself still a live root; nothing to drain.
            return;
        }
        Self::ensure_merged_into(node, dest);
    }

    /// Attempts to union the chains rooted at `a` and `b`. Returns the
    /// lower-id endpoint as the new root, and the higher-id endpoint as the
    /// node that must still be drained by the caller.
    fn try_union(a: &Handle<T, S>, b: &Handle<T, S>) -> Result<UnionOutcome<T, S>, MergeResult>
    where
        S: SequentialPq<T>,
    {
        loop {
            let a_leaf = a.descend_merging();
            let b_leaf = b.descend_merging();

            if a_leaf == b_leaf {
                return Ok(UnionOutcome::AlreadyUnified);
            }

            // SAFETY: both are leaked, process-lifetime-valid leaf nodes.
            let (a_ref, b_ref) = unsafe { (&*a_leaf, &*b_leaf) };
            if a_ref.id == b_ref.id {
                return Err(MergeResult::IdClash);
            }

            let (lo, hi) = if a_ref.id < b_ref.id { (a_leaf, b_leaf) } else { (b_leaf, a_leaf) };
            // SAFETY: as above.
            let hi_ref = unsafe { &*hi };
            match hi_ref.next.compare_exchange(std::ptr::null_mut(), lo, Ordering::AcqRel, Ordering::Acquire) {
                Ok(()) => return Ok(UnionOutcome::Merged { lo, hi }),
                Err(_) => continue, // someone else unioned `hi` already; re-descend and retry
            }
        }
    }

    /// Merges `self` with `other`. See [`MergeResult`] for the possible
    /// outcomes; a width mismatch is checked before touching the chain.
    pub fn merge_into(&self, other: &Handle<T, S>) -> MergeResult
    where
        S: SequentialPq<T>,
    {
        // SAFETY: both leaves are valid leaked nodes; `find_closest_bag`
        // guarantees a live bag.
        let self_bag = unsafe { &*(&*self.find_closest_bag()).bag_raw() };
        let other_bag = unsafe { &*(&*other.find_closest_bag()).bag_raw() };
        if self_bag.width() != other_bag.width() {
            return MergeResult::Incompatible;
        }

        match Self::try_union(self, other) {
            Ok(UnionOutcome::AlreadyUnified) => MergeResult::WereAlreadyEqual,
            Err(result) => result,
            Ok(UnionOutcome::Merged { lo, hi }) => {
                Self::ensure_merged_into(hi, lo);
                self.cursor.store(lo, Ordering::Release);
                other.cursor.store(lo, Ordering::Release);
                MergeResult::Success
            }
        }
    }
}

enum UnionOutcome<T, S> {
    AlreadyUnified,
    Merged { lo: *mut HandleNode<T, S>, hi: *mut HandleNode<T, S> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::BumpArena;
    use crate::seq::BinaryHeapPq;

    #[test]
    fn fresh_handle_is_its_own_root() {
        let alloc = BumpArena::default();
        let h: Handle<i32, BinaryHeapPq<i32>> = Handle::new(&alloc, 0, 4);
        let leaf = h.find_closest_bag();
        // SAFETY: test-internal pointer dereference on a node allocated just above.
        let node = unsafe { &*leaf };
        assert_eq!(node.id(), 0);
    }

    #[test]
    fn merge_is_idempotent() {
        let alloc = BumpArena::default();
        let a: Handle<i32, BinaryHeapPq<i32>> = Handle::new(&alloc, 0, 4);
        let b: Handle<i32, BinaryHeapPq<i32>> = Handle::new(&alloc, 1, 4);
        assert_eq!(a.merge_into(&b), MergeResult::Success);
        assert_eq!(a.merge_into(&b), MergeResult::WereAlreadyEqual);
    }

    #[test]
    fn merge_rejects_width_mismatch() {
        let alloc = BumpArena::default();
        let a: Handle<i32, BinaryHeapPq<i32>> = Handle::new(&alloc, 0, 2);
        let b: Handle<i32, BinaryHeapPq<i32>> = Handle::new(&alloc, 1, 3);
        assert_eq!(a.merge_into(&b), MergeResult::Incompatible);
    }

    #[test]
    fn merge_rejects_id_clash() {
        let alloc = BumpArena::default();
        let a: Handle<i32, BinaryHeapPq<i32>> = Handle::new(&alloc, 5, 4);
        let b: Handle<i32, BinaryHeapPq<i32>> = Handle::new(&alloc, 5, 4);
        assert_eq!(a.merge_into(&b), MergeResult::IdClash);
    }
}

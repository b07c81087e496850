//! A relaxed, concurrent, mergeable priority queue.
//!
//! `insert`, `try_remove_any`/`remove_any`, and `merge` may all be called
//! concurrently from many threads against the same [`PriorityQueue`] value.
//! `remove_any` returns an element of approximately low rank, not
//! necessarily the strict minimum — this relaxation is what lets `insert`
//! and `merge` stay lock-free while `remove_any` stays deadlock-free.
//!
//! Two independent queues can be fused together with [`PriorityQueue::merge`]:
//! afterwards, every operation on either handle observes the union of both.
//! This is implemented as a union-find-like chain of handle nodes
//! ([`handle`]) layered over a lock-free bag of sequential priority-queue
//! slots ([`bag`], [`slot`]).
//!
//! # Module overview
//!
//! - [`config`]: runtime-tunable parameters (`Config`/`ConfigBuilder`).
//! - [`alloc`]: the `Allocator` trait and its default thread-local bump-arena
//!   implementation; nodes are allocated once and never individually freed.
//! - [`seq`]: the pluggable single-threaded `SequentialPq` stored in each
//!   slot, plus a `BinaryHeap`-backed default.
//! - [`slot`]: one bag slot — a sequential PQ guarded by a try-lock, plus
//!   its intrusive lock-free pending-merge list.
//! - [`bag`]: the fixed-width array of slots and the cross-bag merge
//!   machinery.
//! - [`handle`]: the union-find handle chain and the public `MergeResult`.

pub mod alloc;
pub mod bag;
pub mod config;
pub mod handle;
pub mod seq;
pub mod slot;

use std::marker::PhantomData;

use crate::alloc::{Allocator, BumpArena};
use crate::config::Config;
use crate::handle::Handle;
pub use crate::handle::MergeResult;
use crate::seq::{BinaryHeapPq, SequentialPq};
use crate::slot::{ApplyResult, OpOutcome};

/// Marker type enabling the linearizable [`PriorityQueue::empty`] query.
///
/// The per-slot version counter needed to support it is always present (see
/// `slot.rs`); this and [`DisableEmpty`] only gate whether the public method
/// is compiled in, mirroring how a strategy marker type elsewhere gates
/// which of several concrete behaviors a generic type uses.
#[derive(Debug, Default)]
pub struct EnableEmpty;

/// Marker type disabling [`PriorityQueue::empty`] (the default).
#[derive(Debug, Default)]
pub struct DisableEmpty;

/// A relaxed concurrent mergeable priority queue over elements of type `T`.
///
/// - `A`: the node allocator, default [`BumpArena`].
/// - `S`: the sequential priority queue backing each slot, default
///   [`BinaryHeapPq`].
/// - `E`: whether [`empty`](PriorityQueue::empty) is available, default
///   [`DisableEmpty`].
pub struct PriorityQueue<T, A = BumpArena, S = BinaryHeapPq<T>, E = DisableEmpty> {
    handle: Handle<T, S>,
    alloc: A,
    config: Config,
    _empty_marker: PhantomData<E>,
}

impl<T, S: Default> PriorityQueue<T, BumpArena, S, DisableEmpty> {
    /// Creates a new queue with the given unique `id` and default
    /// [`Config`].
    ///
    /// `id` must be unique among queues that might ever be merged with each
    /// other; a collision is reported as [`MergeResult::IdClash`] at merge
    /// time rather than at construction.
    pub fn new(id: usize) -> Self {
        Self::with_config(id, Config::default())
    }

    /// Creates a new queue with the given `id` and explicit [`Config`].
    pub fn with_config(id: usize, config: Config) -> Self {
        let alloc = BumpArena::default();
        alloc.enter(config.bag_width() * 64);
        let handle = Handle::new(&alloc, id, config.bag_width());
        Self { handle, alloc, config, _empty_marker: PhantomData }
    }
}

impl<T, A: Allocator, S: Default> PriorityQueue<T, A, S, DisableEmpty> {
    /// Creates a new queue with an explicit allocator and configuration.
    pub fn with_allocator(id: usize, config: Config, alloc: A) -> Self {
        alloc.enter(config.bag_width() * 64);
        let handle = Handle::new(&alloc, id, config.bag_width());
        Self { handle, alloc, config, _empty_marker: PhantomData }
    }

    /// Returns an equivalent queue with [`empty`](PriorityQueue::empty)
    /// enabled.
    pub fn with_empty_enabled(self) -> PriorityQueue<T, A, S, EnableEmpty> {
        PriorityQueue { handle: self.handle, alloc: self.alloc, config: self.config, _empty_marker: PhantomData }
    }
}

impl<T, A: Allocator, S, E> PriorityQueue<T, A, S, E>
where
    S: SequentialPq<T>,
{
    #[inline]
    fn is_merged_away(token: *const ()) -> bool {
        Handle::<T, S>::is_merged_away(token)
    }

    #[inline]
    fn ensure_merged(token: *const ()) {
        Handle::<T, S>::ensure_merged(token)
    }

    #[inline]
    fn always_keep_going() -> bool {
        true
    }

    /// Inserts `item`. Lock-free.
    pub fn insert(&self, item: T) {
        let mut item = Some(item);
        loop {
            let leaf = self.handle.find_closest_bag();
            // SAFETY: `find_closest_bag` always returns a node with a live bag.
            let bag = unsafe { &*leaf }.bag_ref();
            let result = bag.try_apply_until(
                &Self::is_merged_away,
                &Self::ensure_merged,
                &Self::always_keep_going,
                |pq| {
                    pq.insert(item.take().expect("insert closure invoked at most once"));
                    OpOutcome::Mutated
                },
            );
            match result {
                ApplyResult::Finished => return,
                ApplyResult::NextBag | ApplyResult::NextElem => continue,
            }
        }
    }

    /// Like [`try_remove_any`](Self::try_remove_any), using the retry budget
    /// from this queue's [`Config`].
    pub fn try_remove_any_default(&self) -> Option<T> {
        self.try_remove_any(self.config.max_retries())
    }

    /// Attempts to remove an element of approximately minimal rank, giving
    /// up after `max_retries` unsuccessful slot visits and returning `None`.
    /// Deadlock-free.
    pub fn try_remove_any(&self, max_retries: u32) -> Option<T> {
        let mut out = None;
        let mut retries = 0u32;
        let gave_up = std::cell::Cell::new(false);
        loop {
            let leaf = self.handle.find_closest_bag();
            let bag = unsafe { &*leaf }.bag_ref();
            let result = bag.try_apply_until(
                &Self::is_merged_away,
                &Self::ensure_merged,
                &|| !gave_up.get(),
                |pq| {
                    if let Some(v) = pq.delete_min() {
                        out = Some(v);
                        OpOutcome::Mutated
                    } else if retries >= max_retries {
                        gave_up.set(true);
                        OpOutcome::GiveUp
                    } else {
                        retries += 1;
                        OpOutcome::Continue
                    }
                },
            );
            match result {
                ApplyResult::Finished => return out,
                ApplyResult::NextBag => continue,
                ApplyResult::NextElem => {
                    debug_assert!(gave_up.get(), "NextElem only surfaces once keep_going reports false");
                    return None;
                }
            }
        }
    }

    /// Removes an element of approximately minimal rank, blocking until one
    /// is available.
    pub fn remove_any(&self) -> T {
        loop {
            if let Some(v) = self.try_remove_any(u32::MAX) {
                return v;
            }
        }
    }

    /// If some slot's sequential PQ is currently empty, swaps `src` into it
    /// and returns `true`; blocks until a slot is empty.
    pub fn swap_empty_with(&self, src: &mut S) -> bool {
        loop {
            let leaf = self.handle.find_closest_bag();
            let bag = unsafe { &*leaf }.bag_ref();
            let mut done = false;
            let result = bag.try_apply_until(
                &Self::is_merged_away,
                &Self::ensure_merged,
                &Self::always_keep_going,
                |pq| {
                    if pq.is_empty() {
                        std::mem::swap(pq, src);
                        done = true;
                        OpOutcome::Mutated
                    } else {
                        OpOutcome::Continue
                    }
                },
            );
            match result {
                ApplyResult::Finished => return done,
                ApplyResult::NextBag | ApplyResult::NextElem => continue,
            }
        }
    }

    /// Merges `self` with `other`. See [`MergeResult`].
    pub fn merge(&self, other: &Self) -> MergeResult {
        self.handle.merge_into(&other.handle)
    }

    /// Best-effort peek at an element of approximately minimal rank, without
    /// removing it. Like `remove_any`, this is relaxed: it may miss an
    /// element that is present but momentarily behind a contended lock or an
    /// undrained pending merge, and a concurrent `insert`/`remove_any` may
    /// invalidate the result immediately after it's returned.
    pub fn peek_any(&self) -> Option<T>
    where
        T: Clone,
    {
        let leaf = self.handle.find_closest_bag();
        // SAFETY: `find_closest_bag` always returns a node with a live bag.
        unsafe { &*leaf }.bag_ref().try_peek_any()
    }
}

impl<T, A: Allocator, S> PriorityQueue<T, A, S, EnableEmpty>
where
    S: SequentialPq<T>,
{
    /// Linearizable emptiness query: two successive full passes over every
    /// slot, confirming each stayed empty at the same version between
    /// passes. Requires [`EnableEmpty`].
    pub fn empty(&self) -> bool {
        loop {
            let leaf = self.handle.find_closest_bag();
            let bag = unsafe { &*leaf }.bag_ref();

            let mut versions = Vec::new();
            let mut saw_nonempty = false;
            bag.try_apply_each_until(|slot| match slot.try_snapshot_empty() {
                Some((empty, version)) => {
                    if empty {
                        versions.push(version);
                        false
                    } else {
                        saw_nonempty = true;
                        true
                    }
                }
                // lost the try-lock race; be conservative and retry the
                // whole two-pass probe rather than report a stale result.
                None => {
                    saw_nonempty = true;
                    true
                }
            });
            if saw_nonempty {
                return false;
            }

            let mut idx = 0usize;
            let mut mismatched = false;
            bag.try_apply_each_until(|slot| {
                let ok = match slot.try_snapshot_empty() {
                    Some((empty, version)) => empty && versions.get(idx).copied() == Some(version),
                    None => false,
                };
                idx += 1;
                if !ok {
                    mismatched = true;
                }
                mismatched
            });
            if mismatched {
                continue;
            }
            return true;
        }
    }
}

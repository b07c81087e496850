//! Node allocation.
//!
//! Handle nodes, bags, and slot nodes are never freed individually: once
//! published to other threads they must remain valid for the remaining
//! lifetime of the process, since a concurrent reader may be in the middle
//! of dereferencing one at any time and there is no reclamation scheme (this
//! crate is not hazard-pointer or epoch based). This mirrors the donor
//! crate's own hazard list, which "can only grow for the entire program
//! runtime and is never actually dropped."
//!
//! The default implementation, [`BumpArena`], owns a `'static` reference to
//! a [`Box::leak`]ed [`bumpalo::Bump`] rather than an owned `Bump` value: a
//! `PriorityQueue` (and its `BumpArena`) may itself be dropped while other
//! threads still hold references into nodes it allocated, so the backing
//! chunk must outlive the `BumpArena` handle, not just the handle's owner.
//! This is the same trade the donor crate's hazard list makes ("can only
//! grow for the entire program runtime and is never actually dropped") —
//! applied here to the arena's storage instead of to a linked list.

use std::sync::OnceLock;

use bumpalo::Bump;

/// A source of permanently-leaked node storage.
///
/// `alloc` itself is not required to be safe to call concurrently from
/// multiple threads — in practice it is only ever invoked while a
/// `PriorityQueue` (or a merge's destination bag) is being constructed,
/// single-threaded, before anything is published. Once published, the
/// returned reference must be dereferenceable from any thread for the
/// remaining program lifetime.
pub trait Allocator: Default {
    /// Reserves an initial chunk of `chunk_size` bytes for subsequent
    /// allocations. Purely an optimization hint; implementors may ignore it.
    fn enter(&self, chunk_size: usize);

    /// Releases any thread-local bookkeeping associated with the calling
    /// thread. Already-handed-out references remain valid; this only stops
    /// further allocation through `self` from this thread.
    fn exit(&self);

    /// Allocates storage for `value`, moves it in, and returns a `'static`
    /// reference to it. The value is never individually freed.
    fn alloc<T>(&self, value: T) -> &'static mut T;
}

/// The default [`Allocator`]: a bump arena backed by [`bumpalo`], leaked for
/// the remaining life of the process on first use.
pub struct BumpArena {
    bump: OnceLock<&'static Bump>,
}

impl Default for BumpArena {
    #[inline]
    fn default() -> Self {
        Self { bump: OnceLock::new() }
    }
}

impl BumpArena {
    fn bump(&self) -> &'static Bump {
        *self.bump.get_or_init(|| {
            // leaked once per `BumpArena`; never reclaimed, matching the
            // never-individually-freed discipline every node allocated
            // through it also follows.
            Box::leak(Box::new(Bump::new()))
        })
    }
}

impl Allocator for BumpArena {
    #[inline]
    fn enter(&self, chunk_size: usize) {
        // `bumpalo` grows its chunks geometrically from whatever the first
        // allocation requires; requesting one up front of the expected size
        // avoids repeated chunk growth during a bag's initial slot fill.
        let bump = self.bump();
        let _ = bump.alloc_layout(std::alloc::Layout::from_size_align(chunk_size.max(1), 1).unwrap());
    }

    #[inline]
    fn exit(&self) {
        // nothing to release: the arena is leaked, and already-handed-out
        // references must remain valid regardless of what this thread does
        // next.
    }

    #[inline]
    fn alloc<T>(&self, value: T) -> &'static mut T {
        self.bump().alloc(value)
    }
}

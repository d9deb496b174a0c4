//! Scoped memory accounting.
//!
//! An [`Arena`] is a child scope of the process-wide [`ArenaRoot`]: every
//! reservation made against an arena also shows up at the root, and closing
//! the arena returns all of its reservations at once. The arena tracks, it
//! does not own; callers drop their allocations themselves. Closing is
//! one-shot and idempotent.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::config;

pub struct ArenaRoot {
    reserved: AtomicUsize,
}

static GLOBAL_ROOT: ArenaRoot = ArenaRoot {
    reserved: AtomicUsize::new(0),
};

impl ArenaRoot {
    pub fn global() -> &'static ArenaRoot {
        &GLOBAL_ROOT
    }

    /// Bytes currently reserved across all open arenas.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }
}

pub struct Arena {
    root: &'static ArenaRoot,
    reserved: AtomicUsize,
    closed: AtomicBool,
}

impl Arena {
    pub fn new() -> Self {
        Self {
            root: ArenaRoot::global(),
            reserved: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Box a value and account for its size in this arena.
    pub fn alloc<T>(&self, value: T) -> Box<T> {
        self.reserve(std::mem::size_of::<T>());
        Box::new(value)
    }

    pub fn reserve(&self, bytes: usize) {
        debug_assert!(!self.is_closed());
        self.reserved.fetch_add(bytes, Ordering::Relaxed);
        self.root.reserved.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns all reservations to the root. Returns whether this call
    /// performed the close; later calls are no-ops.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let reserved = self.reserved.swap(0, Ordering::Relaxed);
        self.root.reserved.fetch_sub(reserved, Ordering::Relaxed);
        if config::verbose() {
            eprintln!("arena closed, returned {reserved} reserved bytes");
        }
        true
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.close();
    }
}

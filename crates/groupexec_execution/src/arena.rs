//! Accounting and lifecycle scopes for executor-owned values.
//!
//! An `Arena` does not allocate; ownership of datums follows normal Rust
//! moves. What it provides is the two things a memory context gives an
//! executor: a pollable byte count for values logically living in the scope,
//! and reset callbacks that run when the scope is torn down, so aggregate
//! functions holding external resources get a release hook on every exit
//! path.

use std::cell::{Cell, RefCell};
use std::fmt;

/// Callback invoked when the owning arena is reset or dropped.
pub type ResetCallback = Box<dyn FnMut() + Send>;

pub struct Arena {
    name: &'static str,
    allocated: Cell<usize>,
    callbacks: RefCell<Vec<ResetCallback>>,
}

impl Arena {
    pub fn new(name: &'static str) -> Self {
        Arena {
            name,
            allocated: Cell::new(0),
            callbacks: RefCell::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Record `bytes` of values now living in this scope.
    pub fn charge(&self, bytes: usize) {
        self.allocated.set(self.allocated.get() + bytes);
    }

    /// Record that `bytes` of values left this scope early.
    pub fn release(&self, bytes: usize) {
        self.allocated.set(self.allocated.get().saturating_sub(bytes));
    }

    /// Bytes currently accounted to this scope. This is the introspection
    /// point the hash engine polls for its memory limit.
    pub fn allocated(&self) -> usize {
        self.allocated.get()
    }

    /// Register a callback to run at the next reset. Callbacks run once and
    /// are then discarded, matching shutdown-callback semantics.
    pub fn register_reset_callback(&self, cb: ResetCallback) {
        self.callbacks.borrow_mut().push(cb);
    }

    /// Run pending callbacks and zero the byte count.
    pub fn reset(&self) {
        let mut callbacks = self.callbacks.take();
        for cb in callbacks.iter_mut() {
            cb();
        }
        self.allocated.set(0);
    }

    /// Zero the byte count without running callbacks. For per-tuple scopes
    /// that are cleared between calls while registered shutdown callbacks
    /// must stay armed until the owner is truly done.
    pub fn reset_memory(&self) {
        self.allocated.set(0);
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.reset();
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.name)
            .field("allocated", &self.allocated.get())
            .field("num_callbacks", &self.callbacks.borrow().len())
            .finish()
    }
}

//! Resource layer: a front-end guard (priority queue of waiting
//! processes) plus a core (capacity, in-use count, holders list), shared
//! by the three resource variants in `unit.rs`, `store.rs` and
//! `buffer.rs`. Each variant is its own concrete type with its own
//! acquire/release/preempt; only the guard/core data structures and the
//! [`Held`] sum type (used by `Process::stop`'s drop callback) are shared.

pub mod buffer;
pub mod store;
pub mod unit;

use crate::event::{Action, Tag};
use crate::kernel::Kernel;
use crate::process::{Process, ProcessId};
use crate::pqueue::{Handle as QueueHandle, IndexedPQueue};
use crate::signal::Signal;

/// Capacity bookkeeping common to every variant. `in_use` means "units
/// currently allocated" for the holdable variants and "items currently
/// buffered" for `Buffer`.
pub struct Core {
    pub capacity: u64,
    pub in_use: u64,
}

impl Core {
    pub fn new(capacity: u64) -> Core {
        Core { capacity, in_use: 0 }
    }
}

/// The predicate a guard entry is waiting on: either "at least `n` units
/// free" (acquire-style, used by `Unit`, `Store`, and a buffer's put-side
/// guard) or "at least `n` units filled" (consume-style, used by a
/// buffer's get-side guard).
#[derive(Clone, Copy)]
pub enum Need {
    Free(u64),
    Filled(u64),
}

impl Need {
    fn satisfied(&self, core: &Core) -> bool {
        match *self {
            Need::Free(n) => core.capacity - core.in_use >= n,
            Need::Filled(n) => core.in_use >= n,
        }
    }
}

struct Entry {
    process: Process,
    need: Need,
}

/// The priority queue of processes waiting on a resource predicate, keyed
/// by (priority, entry_time) — priority dominates, entry_time breaks ties
/// within equal priority — through [`IndexedPQueue::new_guard`]'s
/// priority-primary comparator, the ordering spec.md §4.5 requires
/// ("strictly higher priority ahead of lower; within equal priority, FIFO
/// by entry time").
pub struct Guard {
    queue: IndexedPQueue<Entry>,
}

impl Guard {
    pub fn new() -> Guard {
        Guard {
            queue: IndexedPQueue::new_guard(),
        }
    }

    pub fn enqueue(&mut self, process: &Process, need: Need) -> QueueHandle {
        let time = process.kernel().time();
        let priority = process.priority();
        self.queue.enqueue(
            Entry {
                process: process.clone(),
                need,
            },
            time,
            priority,
        )
    }

    pub fn cancel(&mut self, handle: QueueHandle) {
        self.queue.cancel(handle);
    }

    /// `cancel(guard, p)`: remove every entry belonging to `p`. The three
    /// built-in variants never need more than one entry per process (a
    /// process can only ever be parked in one `WaitsFor` at a time) and so
    /// route their own teardown through the single handle recorded in
    /// `ResourceWait` instead; this is the general form spec.md §4.5 names
    /// for a resource variant whose predicate might enqueue a process more
    /// than once.
    pub fn cancel_process(&mut self, pid: ProcessId) -> usize {
        self.queue.retain_remove(|e| e.process.id() == pid).len()
    }

    pub fn reprioritize(&mut self, handle: QueueHandle, new_priority: i64) {
        if let Some((time, _)) = self.queue.keys_of(handle) {
            self.queue.reprioritize(handle, time, new_priority);
        }
    }

    /// `signal(guard)`: if the front waiter's predicate now holds, remove
    /// and return it. Callers releasing multiple units call this
    /// repeatedly until it returns `None`.
    pub fn signal(&mut self, core: &Core) -> Option<(Process, Need)> {
        let handle = match self.queue.peek() {
            Some((h, entry)) if entry.need.satisfied(core) => h,
            _ => return None,
        };
        let entry = self.queue.cancel(handle)?;
        Some((entry.process, entry.need))
    }
}

impl Default for Guard {
    fn default() -> Self {
        Self::new()
    }
}

/// Schedule a zero-delay resume for a process a guard just let through.
/// The kernel's priority ordering guarantee still applies to this resume
/// because it goes through the same event queue as every other wakeup.
pub(crate) fn schedule_guard_resume(kernel: &Kernel, resource_id: u64, process: Process) {
    let time = kernel.time();
    let priority = process.priority();
    kernel.schedule(
        Action::GuardSignal,
        Tag::Resource(resource_id),
        Tag::None,
        time,
        priority,
        move || process.resume(Signal::SUCCESS),
    );
}

/// What a process is recorded as currently holding, for `Process::stop`'s
/// drop callback to return units and signal the guard without the process
/// itself ever touching its own stack again.
#[derive(Clone)]
pub enum Held {
    Unit(unit::Unit),
    Store(store::Store, u64),
}

impl Held {
    pub(crate) fn resource_id(&self) -> u64 {
        match self {
            Held::Unit(u) => u.id(),
            Held::Store(s, _) => s.id(),
        }
    }

    pub(crate) fn amount(&self) -> u64 {
        match self {
            Held::Unit(_) => 1,
            Held::Store(_, amount) => *amount,
        }
    }

    pub(crate) fn drop_for(&self, pid: ProcessId) {
        match self {
            Held::Unit(u) => u.drop_holder(pid),
            Held::Store(s, amount) => s.drop_holder(pid, *amount),
        }
    }
}

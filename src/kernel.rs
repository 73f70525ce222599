//! Per-simulation kernel: the event queue, current time, and next-id
//! counters bundled into one context object, shared across every process
//! and resource spawned under it. The public API hides this bundling
//! behind a thread-local "current kernel" pointer, installed on every
//! process thread belonging to one simulation, so process/resource
//! methods never need a `&Kernel` passed explicitly.
//!
//! `Kernel`'s state is touched by whichever process thread is currently
//! active, one at a time, by construction (the rendezvous-channel handoff
//! in `coroutine/mod.rs` guarantees this). A `Mutex` still guards it
//! because several real OS threads alias the same `Arc<KernelInner>`
//! across their lifetimes even though at most one ever holds the lock at
//! once; it is uncontended in practice for the same reason.

use std::cell::RefCell;
use std::sync::{Arc, Mutex};

use log::trace;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::event::{Action, EventHandle, EventQueue, Match, Tag};
use crate::signal::Signal;

struct KernelInner {
    queue: Mutex<EventQueue>,
    next_process_id: std::sync::atomic::AtomicU64,
    next_resource_id: std::sync::atomic::AtomicU64,
    // Shared, not thread-local: a process is backed by its own OS thread
    // (see `coroutine/mod.rs`), so a thread-local generator would hand each
    // process an independent, unseeded stream instead of the one shared,
    // seedable stream a simulation's determinism promise depends on. At
    // most one process thread ever touches this at a time, enforced by the
    // same rendezvous handoff that makes `queue` effectively uncontended.
    rng: Mutex<StdRng>,
}

/// A handle to one simulation's shared state. Cheap to `Clone` (an `Arc`
/// underneath); every process and resource created under a kernel holds a
/// clone of it.
#[derive(Clone)]
pub struct Kernel(Arc<KernelInner>);

thread_local! {
    static CURRENT: RefCell<Option<Kernel>> = RefCell::new(None);
}

impl Kernel {
    /// `event_queue_initialize(t0)`. Installs itself as "current" on the
    /// calling thread, so the thread that builds a simulation can call
    /// `random::seed`/spawn processes/schedule events without a separate
    /// `install_current` step; a process's own dedicated thread still
    /// installs its kernel explicitly (see `process.rs`) since it is never
    /// the thread that called `new`.
    pub fn new(t0: f64) -> Kernel {
        let kernel = Kernel(Arc::new(KernelInner {
            queue: Mutex::new(EventQueue::new(t0)),
            next_process_id: std::sync::atomic::AtomicU64::new(1),
            next_resource_id: std::sync::atomic::AtomicU64::new(1),
            rng: Mutex::new(StdRng::from_entropy()),
        }));
        Kernel::install_current(kernel.clone());
        kernel
    }

    /// Reseed this simulation's shared random stream. Two kernels seeded
    /// identically and driven through the same sequence of process/resource
    /// calls produce the same draws, since every process shares this one
    /// generator rather than owning its own.
    pub fn seed_rng(&self, seed: u64) {
        *self.0.rng.lock().unwrap() = StdRng::seed_from_u64(seed);
    }

    pub(crate) fn with_rng<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
        f(&mut self.0.rng.lock().unwrap())
    }

    pub(crate) fn next_process_id(&self) -> u64 {
        self.0.next_process_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    pub(crate) fn next_resource_id(&self) -> u64 {
        self.0.next_resource_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// `time()`.
    pub fn time(&self) -> f64 {
        self.0.queue.lock().unwrap().time()
    }

    /// True once the event queue has no scheduled events left. `execute`'s
    /// loop condition, and what a test checks after `stop` to confirm no
    /// trace of a torn-down process (its wakeup event, its waiter
    /// registrations) lingers in the queue.
    pub fn is_empty(&self) -> bool {
        self.0.queue.lock().unwrap().is_empty()
    }

    pub(crate) fn schedule<F>(
        &self,
        action: Action,
        subject: Tag,
        object: Tag,
        time: f64,
        priority: i64,
        thunk: F,
    ) -> EventHandle
    where
        F: FnOnce() + Send + 'static,
    {
        trace!("schedule {:?} subject={:?} object={:?} t={} prio={}", action, subject, object, time, priority);
        self.0
            .queue
            .lock()
            .unwrap()
            .schedule(action, subject, object, time, priority, thunk)
    }

    pub(crate) fn add_waiter<F>(&self, handle: EventHandle, waiter_id: u64, waiter: F) -> bool
    where
        F: FnOnce(Signal) + Send + 'static,
    {
        self.0.queue.lock().unwrap().add_waiter(handle, waiter_id, waiter)
    }

    pub(crate) fn remove_waiter(&self, handle: EventHandle, waiter_id: u64) {
        self.0.queue.lock().unwrap().remove_waiter(handle, waiter_id)
    }

    /// `event_cancel(handle)`.
    pub fn cancel(&self, handle: EventHandle) -> bool {
        self.0.queue.lock().unwrap().cancel(handle)
    }

    /// `event_pattern_cancel(action, subject, object)`.
    pub fn pattern_cancel(&self, action: Match<Action>, subject: Match<Tag>, object: Match<Tag>) -> usize {
        let count = self.0.queue.lock().unwrap().pattern_cancel(action, subject, object);
        if count == 0 {
            log::warn!("pattern_cancel matched zero events");
        }
        count
    }

    pub(crate) fn reprioritize(&self, handle: EventHandle, new_priority: i64) {
        self.0.queue.lock().unwrap().reprioritize(handle, new_priority)
    }

    /// `event_queue_clear()`.
    pub fn clear(&self) {
        self.0.queue.lock().unwrap().clear()
    }

    /// `event_queue_execute()`: run until the queue empties.
    pub fn run(&self) {
        while self.step() {}
    }

    /// Run a single dispatch step; used by tests that want to interleave
    /// assertions between events. Pops the minimum event with the queue
    /// briefly locked, then releases the lock before firing it — firing
    /// runs user code (a process's entry function, a guard signal) that
    /// routinely calls straight back into `schedule`/`cancel`/`add_waiter`
    /// on this very `Kernel`, and those would deadlock against a lock held
    /// across the whole dispatch step.
    pub fn step(&self) -> bool {
        let event = self.0.queue.lock().unwrap().pop_ready();
        match event {
            Some(event) => {
                event.fire();
                true
            }
            None => false,
        }
    }

    /// Install this kernel as "current" for the calling thread. Called once
    /// by the thread that creates the kernel, and again by every process
    /// coroutine thread spawned under it, so that `Process`/`Resource`
    /// methods never need the kernel passed explicitly.
    pub fn install_current(kernel: Kernel) {
        CURRENT.with(|c| *c.borrow_mut() = Some(kernel));
    }

    /// The kernel installed on this thread. Fatal if none has been
    /// installed — calling a process/resource operation on a thread that
    /// was never given a simulation to belong to is a contract violation.
    pub fn current() -> Kernel {
        CURRENT.with(|c| {
            c.borrow()
                .clone()
                .unwrap_or_else(|| crate::error::fatal("no kernel installed on this thread"))
        })
    }
}

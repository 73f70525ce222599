// The MIT License (MIT)

// Copyright (c) 2015 Rustcc Developers
// Copyright (c) 2026 Cimba Developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Cimba is a discrete-event simulation kernel for process-oriented
//! simulations: queues, servers, factories. A simulated entity is written
//! as a long-running procedure (a [`Process`]) that advances simulated
//! time by explicitly holding, waiting, or acquiring resources; the kernel
//! weaves these procedures onto a handful of real threads by suspending
//! and resuming them at well-defined points and advancing a simulated
//! clock (owned by [`Kernel`]) between events.
//!
//! Three subsystems do the work:
//!
//! - [`coroutine`] — stackful coroutines: each process runs on its own
//!   stack (here, a dedicated OS thread), with control transferred
//!   synchronously and values passed in both directions.
//! - [`pqueue`] and [`event`] — an indexable priority queue of timestamped
//!   callbacks keyed by (time, priority, FIFO insertion order), and the
//!   dispatcher built on it.
//! - [`process`] and [`resource`] — the protocol by which processes wait
//!   for the clock, other processes, raw events, or guarded resources, and
//!   by which resources maintain FIFO-within-priority waiter queues and
//!   holder lists.
//!
//! A simulation is one [`Kernel`] value. Building one, spawning processes
//! and resources under it, and calling [`Kernel::run`] to drive it to
//! completion is the whole public surface; everything else is plumbing
//! those three pieces share.
//!
//! ```
//! use cimba::{Builder, Kernel, Signal};
//!
//! let kernel = Kernel::new(0.0);
//! Builder::new().name("example").spawn(&kernel, |_me| {
//!     log::debug!("hello from inside the simulation");
//!     Signal::SUCCESS
//! });
//! kernel.run();
//! assert!(kernel.time() >= 0.0);
//! ```

#[macro_use]
extern crate log;

pub mod builder;
pub mod coroutine;
pub mod error;
pub mod event;
pub mod kernel;
pub mod process;
pub mod pqueue;
pub mod random;
pub mod resource;
pub mod signal;

pub use builder::Builder;
pub use coroutine::{Coroutine, CoroutineId, Status as CoroutineStatus};
pub use event::{Action as EventAction, EventHandle, Tag as EventTag};
pub use kernel::Kernel;
pub use process::{Process, ProcessId, State as ProcessState, WaitsFor};
pub use resource::buffer::Buffer;
pub use resource::store::Store;
pub use resource::unit::Unit;
pub use signal::Signal;

/// Default process stack size. Every process here is backed by a full OS
/// thread rather than a lightweight stack, and simulations built on this
/// kernel may spawn thousands of processes over a run, so the default is
/// kept modest; raise it per-process with [`Builder::stack_size`] for
/// deeply recursive process bodies.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    #[test]
    fn a_minimal_simulation_runs_to_completion() {
        let kernel = Kernel::new(0.0);
        let observed = Arc::new(AtomicI64::new(-1));
        let observed_inner = observed.clone();
        Builder::new().name("smoke").spawn(&kernel, move |_me| {
            let t = Process::hold(5.0);
            observed_inner.store(t.code() as i64, Ordering::SeqCst);
            Signal::SUCCESS
        });
        kernel.run();
        assert_eq!(observed.load(Ordering::SeqCst), Signal::SUCCESS.code() as i64);
        assert_eq!(kernel.time(), 5.0);
    }
}

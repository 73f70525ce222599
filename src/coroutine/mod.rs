//! Stackful coroutines, backed here by real OS threads rather than a
//! hand-assembled register-swap: each coroutine gets its own thread (its
//! "stack"), and `transfer` is realized as a synchronous, zero-capacity
//! channel hand-off between the caller's thread and the target's.
//!
//! Because every coroutine maps 1:1 onto the OS thread that runs it, "the
//! current coroutine" falls out of thread-local storage for free: a thread
//! never needs to be told who it is after the handoff completes, because it
//! already knows (it is always backing the same `Coroutine` for its entire
//! life). A design that multiplexed many coroutines onto one OS thread
//! would instead need to track a stack of whoever is "current" by hand;
//! this module does not.

pub mod environment;

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, error, trace};

use crate::error::{fatal, unwind_for_stop, StopUnwind};
use crate::signal::Signal;

/// Opaque, non-zero identifier stable for the life of a coroutine.
pub type CoroutineId = u64;

fn next_id() -> CoroutineId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Coroutine lifecycle: `Created`, `Running`, `Finished`. `Running` covers
/// both "currently executing" and "suspended, parked on its own inbox" —
/// this three-state model does not distinguish those, only
/// `Coroutine::current()` identity does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Created = 0,
    Running = 1,
    Finished = 2,
}

impl Status {
    fn from_u8(v: u8) -> Status {
        match v {
            0 => Status::Created,
            1 => Status::Running,
            2 => Status::Finished,
            _ => unreachable!("cimba: corrupt coroutine status byte"),
        }
    }
}

type Entry = Box<dyn FnOnce(Coroutine, Signal) -> Signal + Send>;

struct Inner {
    id: CoroutineId,
    name: Mutex<Option<String>>,
    stack_size: usize,
    status: AtomicU8,
    panicked: AtomicU8,
    tx: SyncSender<Signal>,
    rx: Mutex<Option<Receiver<Signal>>>,
    entry: Mutex<Option<Entry>>,
    join: Mutex<Option<JoinHandle<()>>>,
    parent: Mutex<Option<Coroutine>>,
    caller: Mutex<Option<Coroutine>>,
    exit_value: Mutex<Option<Signal>>,
}

/// A handle to a coroutine. Cheaply `Clone`-able (an `Arc` underneath),
/// reference-counted rather than uniquely owned because a coroutine here
/// is referenced from several places at once: the process that owns it,
/// its parent/caller fields, and any waiter that is blocked on it.
#[derive(Clone)]
pub struct Coroutine(Arc<Inner>);

impl PartialEq for Coroutine {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Coroutine {}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.0.id)
            .field("name", &*self.0.name.lock().unwrap())
            .field("status", &self.status())
            .finish()
    }
}

impl Coroutine {
    /// `create(stack_bytes)`: allocate an uninitialised coroutine with an
    /// owned stack; status = Created. The "owned stack" is realized lazily
    /// as the `std::thread::Builder::stack_size` passed when the backing OS
    /// thread is actually spawned by `start`.
    pub fn create(stack_size: usize) -> Coroutine {
        let (tx, rx) = sync_channel(0);
        Coroutine(Arc::new(Inner {
            id: next_id(),
            name: Mutex::new(None),
            stack_size,
            status: AtomicU8::new(Status::Created as u8),
            panicked: AtomicU8::new(0),
            tx,
            rx: Mutex::new(Some(rx)),
            entry: Mutex::new(None),
            join: Mutex::new(None),
            parent: Mutex::new(None),
            caller: Mutex::new(None),
            exit_value: Mutex::new(None),
        }))
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.0.name.lock().unwrap() = Some(name.into());
    }

    pub fn name(&self) -> Option<String> {
        self.0.name.lock().unwrap().clone()
    }

    pub fn id(&self) -> CoroutineId {
        self.0.id
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.0.status.load(Ordering::Acquire))
    }

    pub fn panicked(&self) -> bool {
        self.0.panicked.load(Ordering::Acquire) != 0
    }

    fn set_status(&self, status: Status) {
        self.0.status.store(status as u8, Ordering::Release);
    }

    pub fn parent(&self) -> Option<Coroutine> {
        self.0.parent.lock().unwrap().clone()
    }

    pub fn caller(&self) -> Option<Coroutine> {
        self.0.caller.lock().unwrap().clone()
    }

    pub fn exit_value(&self) -> Option<Signal> {
        *self.0.exit_value.lock().unwrap()
    }

    /// Preload the entry closure so the first switch in runs
    /// `entry(self, arg)`, and if `entry` returns, redirects through the
    /// exit path with the returned value. `arg` is simply the value the
    /// first `start(arg)` transfer carries; the exit path is built into the
    /// thread wrapper installed by `start` (see below) rather than passed
    /// in explicitly, since the closure already captures what it needs.
    pub fn initialize<F>(&self, entry: F)
    where
        F: FnOnce(Coroutine, Signal) -> Signal + Send + 'static,
    {
        if self.status() != Status::Created {
            fatal("initialize() called on a coroutine that has already been started");
        }
        *self.0.entry.lock().unwrap() = Some(Box::new(entry));
    }

    /// `start(arg)`: sets parent = caller = current, transitions to
    /// Running, and transfers control in with `arg`; returns whatever value
    /// the coroutine first passes back.
    pub fn start(&self, arg: Signal) -> Signal {
        if self.status() != Status::Created {
            fatal("start() called on a coroutine that is not Created");
        }
        let me = Coroutine::current();
        *self.0.parent.lock().unwrap() = Some(me.clone());
        *self.0.caller.lock().unwrap() = Some(me.clone());
        self.spawn_thread();
        self.set_status(Status::Running);
        debug!(
            "coroutine {:?} started by {:?}",
            self.name().unwrap_or_default(),
            me.name().unwrap_or_default()
        );
        Coroutine::transfer(self, arg)
    }

    fn spawn_thread(&self) {
        let rx = self
            .0
            .rx
            .lock()
            .unwrap()
            .take()
            .expect("cimba: contract violation: start() called twice");
        let entry = self
            .0
            .entry
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| fatal("start() called before initialize()"));
        let me = self.clone();
        let name = me.name().unwrap_or_else(|| format!("coroutine-{}", me.id()));
        let builder = thread::Builder::new()
            .name(name)
            .stack_size(self.0.stack_size);
        let me_for_thread = me.clone();
        let join = builder
            .spawn(move || {
                environment::install_current(me_for_thread.clone(), rx);
                let first = environment::recv_current()
                    .expect("cimba: contract violation: coroutine inbox closed before first resume");
                let result = panic::catch_unwind(AssertUnwindSafe(|| entry(me_for_thread.clone(), first)));
                me_for_thread.finish(result);
            })
            .expect("cimba: failed to spawn coroutine thread");
        *self.0.join.lock().unwrap() = Some(join);
    }

    fn finish(&self, result: std::thread::Result<Signal>) {
        // Whether `parent` is actually parked in its own `recv`, waiting for
        // this stack to hand a value back, determines whether notifying it
        // here is safe. That holds for the `Ok`/`ExitNow` paths (this stack
        // is finishing while it is still the one thing the parent's last
        // `transfer` is blocked on). It does NOT hold for `StopUnwind`: that
        // teardown is driven by `Coroutine::stop` on a *different* thread,
        // which already recorded the exit value and status synchronously
        // before waking this stack to unwind, and which has since moved on
        // to run other code rather than parking on its inbox. Sending to it
        // here would leave a dangling send racing to steal whatever later,
        // unrelated rendezvous that thread's own inbox is actually waiting
        // for.
        let mut notify_parent = true;
        let value = match result {
            Ok(v) => v,
            Err(payload) => match payload.downcast::<ExitNow>() {
                // `Coroutine::exit` on the current coroutine: the exit
                // value was already recorded before the unwind began.
                Ok(exit) => self.exit_value().unwrap_or(exit.0),
                Err(payload) => {
                    if payload.downcast_ref::<StopUnwind>().is_some() {
                        // A teardown triggered by `stop` on this coroutine
                        // while it was suspended elsewhere: `stop` already
                        // recorded the caller-supplied exit value
                        // synchronously before waking this stack to unwind,
                        // and is not waiting on a reply.
                        notify_parent = false;
                        self.exit_value().unwrap_or(Signal::STOPPED)
                    } else {
                        self.0.panicked.store(1, Ordering::Release);
                        log_panic_payload(self.name().as_deref(), &payload);
                        Signal::STOPPED
                    }
                }
            },
        };
        *self.0.exit_value.lock().unwrap() = Some(value);
        self.set_status(Status::Finished);
        trace!("coroutine {:?} finished with {}", self.name(), value);
        if notify_parent {
            if let Some(parent) = self.parent() {
                // One-way notification: the parent is, by the
                // single-active-coroutine invariant, parked in its own
                // `recv` while it is not current, so this handshake
                // returns promptly. We must not block waiting for a reply
                // the way `transfer` does, because nothing will ever
                // resume a Finished coroutine again.
                let _ = parent.0.tx.send(value);
            }
        }
    }

    /// `transfer(to, value)` — symmetric: suspends the current coroutine,
    /// updates `to.caller = current`, and swaps control, returning the
    /// value passed by the next transfer back. Requires `to.status ==
    /// Running`. This is the one primitive `yield_`, `resume` and `start`
    /// all reduce to.
    pub fn transfer(to: &Coroutine, value: Signal) -> Signal {
        match to.status() {
            Status::Finished => return to.exit_value().unwrap_or(Signal::SUCCESS),
            Status::Created => fatal("transfer() target has not been started"),
            Status::Running => {}
        }
        let me = Coroutine::current();
        if *to == me {
            fatal("transfer() target is the current coroutine");
        }
        *to.0.caller.lock().unwrap() = Some(me);
        trace!("transfer -> {:?} ({})", to.name(), value);
        to.0
            .tx
            .send(value)
            .unwrap_or_else(|_| fatal("transfer() target's inbox is closed"));
        let resumed = environment::recv_current()
            .unwrap_or_else(|| fatal("coroutine inbox closed while suspended"));
        // `stop()` on a non-current coroutine marks it Finished synchronously
        // before waking its thread (see `stop` below); observing Finished
        // here, right after waking up, means this wakeup *is* that stop, and
        // the stack must unwind now rather than hand `resumed` back to user
        // code — distinguishing a teardown wakeup from an ordinary interrupt
        // wakeup, which leaves status Running.
        if Coroutine::current().status() == Status::Finished {
            force_stop();
        }
        resumed
    }

    /// `yield(value)` transfers to `current.caller`.
    pub fn yield_(value: Signal) -> Signal {
        let me = Coroutine::current();
        let caller = me
            .caller()
            .unwrap_or_else(|| fatal("yield() called from the main coroutine, which has no caller"));
        Coroutine::transfer(&caller, value)
    }

    /// `resume(c, value)` transfers to `c`, which must be Running and not
    /// current.
    pub fn resume(&self, value: Signal) -> Signal {
        Coroutine::transfer(self, value)
    }

    /// `exit(value)` stores value, sets status = Finished, transfers to
    /// parent. Only callable from within the coroutine exiting (it is how
    /// `Process::stop` behaves when a coroutine stops itself).
    pub fn exit(value: Signal) -> ! {
        let me = Coroutine::current();
        *me.0.exit_value.lock().unwrap() = Some(value);
        panic::resume_unwind(Box::new(ExitNow(value)))
    }

    /// `stop(c, value)` — if `c` is current, behaves as `exit`; otherwise
    /// records the exit value and marks `c` Finished without running
    /// further user code on that stack. The bookkeeping (status,
    /// exit_value) is synchronous and visible to the caller immediately;
    /// the backing OS thread is woken with a one-way notification so it can
    /// actually unwind (via `StopUnwind`) and terminate, but the caller
    /// does not wait for that to happen.
    pub fn stop(&self, value: Signal) {
        if *self == Coroutine::current() {
            Coroutine::exit(value);
        }
        match self.status() {
            Status::Finished | Status::Created => return,
            Status::Running => {}
        }
        *self.0.exit_value.lock().unwrap() = Some(value);
        self.set_status(Status::Finished);
        debug!("coroutine {:?} stopped with {}", self.name(), value);
        let _ = self.0.tx.send(Signal::STOPPED);
    }

    /// `destroy(c)` frees the stack; requires status != Running.
    pub fn destroy(&self) {
        if self.status() == Status::Running {
            fatal("destroy() called on a Running coroutine");
        }
        if let Some(join) = self.0.join.lock().unwrap().take() {
            let _ = join.join();
        }
    }

    /// Accessor for the current coroutine (the one backing this very OS
    /// thread).
    pub fn current() -> Coroutine {
        environment::current()
    }

    /// Builds a free-standing "main coroutine" identity plus the receiving
    /// half of its inbox, for `environment::current()` to install on a
    /// thread that was never itself spawned as a coroutine. Marked Running
    /// directly since no backing thread needs to be spawned — the calling
    /// OS thread *is* its stack.
    pub(crate) fn create_main_parts() -> (Coroutine, Receiver<Signal>) {
        let co = Coroutine::create(0);
        let rx = co
            .0
            .rx
            .lock()
            .unwrap()
            .take()
            .expect("cimba: freshly created coroutine always owns its inbox receiver");
        co.set_name("<main coroutine>");
        co.set_status(Status::Running);
        (co, rx)
    }
}

struct ExitNow(Signal);

fn log_panic_payload(name: Option<&str>, payload: &Box<dyn Any + Send>) {
    let msg = payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()))
        .unwrap_or("Box<dyn Any>");
    error!(
        "coroutine '{}' panicked: {}",
        name.unwrap_or("<unnamed>"),
        msg
    );
}

/// Force an immediate, clean unwind of the current coroutine's stack,
/// skipping any remaining user code, as required by `Process::stop`'s
/// "without running further user code on that stack" guarantee.
pub(crate) fn force_stop() -> ! {
    unwind_for_stop()
}

//! Process layer: a coroutine augmented with a name, priority, "what am I
//! waiting for" descriptor, a waiters list (other processes blocked on
//! this one finishing), and the set of resources currently held — the
//! latter consulted only when the process is torn down by `stop`.
//!
//! `Process` is an `Arc`-based handle exactly like
//! [`crate::coroutine::Coroutine`], for the same reason: a process is
//! referenced from several places that must not own it exclusively (its
//! own waiters list, resource holder lists, pending wakeup events), so
//! ownership is shared and reference-counted rather than tree-structured.

use std::cell::RefCell;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::coroutine::{Coroutine, Status as CoroutineStatus};
use crate::error::fatal;
use crate::event::{Action, EventHandle, Tag};
use crate::kernel::Kernel;
use crate::resource::Held;
use crate::signal::Signal;

pub type ProcessId = u64;

/// What a suspended process is blocked on. Exactly one variant applies at
/// a time; `None` means the process is not currently suspended in any
/// kernel-tracked wait.
#[derive(Clone)]
pub enum WaitsFor {
    None,
    Clock(EventHandle),
    Event(EventHandle),
    Process(Process),
    Resource(ResourceWait),
}

/// The hooks a resource guard registers when it parks a process, so
/// `stop_waiting`/`set_priority` can reach back into the right guard entry
/// without `process.rs` knowing which resource variant it belongs to.
#[derive(Clone)]
pub struct ResourceWait {
    pub cancel: Arc<dyn Fn() + Send + Sync>,
    pub reprioritize: Arc<dyn Fn(i64) + Send + Sync>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Created = 0,
    Running = 1,
    Finished = 2,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Created,
            1 => State::Running,
            2 => State::Finished,
            _ => unreachable!("cimba: corrupt process state byte"),
        }
    }
}

struct Inner {
    id: ProcessId,
    kernel: Kernel,
    coroutine: Coroutine,
    name: Mutex<String>,
    priority: AtomicI64,
    state: AtomicU8,
    waits_for: Mutex<WaitsFor>,
    waiters: Mutex<Vec<Process>>,
    held: Mutex<Vec<Held>>,
}

#[derive(Clone)]
pub struct Process(Arc<Inner>);

impl PartialEq for Process {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Process {}

thread_local! {
    static CURRENT_PROCESS: RefCell<Option<Process>> = RefCell::new(None);
}

fn install_current_process(p: Process) {
    CURRENT_PROCESS.with(|c| *c.borrow_mut() = Some(p));
}

impl Process {
    /// `process_create` + `process_initialize(name, entry, context,
    /// priority)` combined, at the crate's default stack size: the
    /// stack-size/entry-function split the coroutine layer exposes
    /// separately collapses into one constructor here since nothing in
    /// this crate reuses an uninitialised process the way a pooled-stack
    /// allocator might. Use [`crate::builder::Builder`] for a non-default
    /// stack size.
    pub fn spawn<F>(kernel: &Kernel, name: impl Into<String>, priority: i64, entry: F) -> Process
    where
        F: FnOnce(Process) -> Signal + Send + 'static,
    {
        Process::spawn_with_stack_size(kernel, name, priority, crate::DEFAULT_STACK_SIZE, entry)
    }

    pub(crate) fn spawn_with_stack_size<F>(
        kernel: &Kernel,
        name: impl Into<String>,
        priority: i64,
        stack_size: usize,
        entry: F,
    ) -> Process
    where
        F: FnOnce(Process) -> Signal + Send + 'static,
    {
        let coroutine = Coroutine::create(stack_size);
        let inner = Arc::new(Inner {
            id: kernel.next_process_id(),
            kernel: kernel.clone(),
            coroutine: coroutine.clone(),
            name: Mutex::new(name.into()),
            priority: AtomicI64::new(priority),
            state: AtomicU8::new(State::Created as u8),
            waits_for: Mutex::new(WaitsFor::None),
            waiters: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
        });
        let process = Process(inner);
        process.0.coroutine.set_name(process.name());
        let process_for_entry = process.clone();
        let kernel_for_thread = kernel.clone();
        coroutine.initialize(move |_co, _first| {
            Kernel::install_current(kernel_for_thread);
            install_current_process(process_for_entry.clone());
            entry(process_for_entry)
        });
        process
    }

    pub fn id(&self) -> ProcessId {
        self.0.id
    }

    pub fn name(&self) -> String {
        self.0.name.lock().unwrap().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.0.name.lock().unwrap() = name.into();
    }

    pub fn priority(&self) -> i64 {
        self.0.priority.load(Ordering::Acquire)
    }

    pub fn state(&self) -> State {
        State::from_u8(self.0.state.load(Ordering::Acquire))
    }

    pub fn kernel(&self) -> Kernel {
        self.0.kernel.clone()
    }

    pub fn exit_value(&self) -> Option<Signal> {
        self.0.coroutine.exit_value()
    }

    fn tag(&self) -> Tag {
        Tag::Process(self.0.id)
    }

    fn set_waits_for(&self, wf: WaitsFor) {
        *self.0.waits_for.lock().unwrap() = wf;
    }

    fn waits_for_clone(&self) -> WaitsFor {
        self.0.waits_for.lock().unwrap().clone()
    }

    pub(crate) fn set_resource_wait(&self, wait: ResourceWait) {
        self.set_waits_for(WaitsFor::Resource(wait));
    }

    pub(crate) fn clear_resource_wait(&self) {
        self.set_waits_for(WaitsFor::None);
    }

    pub(crate) fn add_held(&self, held: Held) {
        self.0.held.lock().unwrap().push(held);
    }

    pub(crate) fn remove_held(&self, resource_id: u64) {
        self.0.held.lock().unwrap().retain(|h| h.resource_id() != resource_id);
    }

    pub(crate) fn held_amount(&self, resource_id: u64) -> u64 {
        self.0
            .held
            .lock()
            .unwrap()
            .iter()
            .find(|h| h.resource_id() == resource_id)
            .map(|h| h.amount())
            .unwrap_or(0)
    }

    /// `process_current`.
    pub fn current() -> Process {
        CURRENT_PROCESS
            .with(|c| c.borrow().clone())
            .unwrap_or_else(|| fatal("Process::current() called outside any process"))
    }

    /// Transfer control into this process's coroutine (`first` selects
    /// `Coroutine::start` vs `Coroutine::resume`), and if that transfer
    /// runs the process to completion, perform the process-level teardown
    /// a natural finish requires: mark Finished, resume every waiter with
    /// `SUCCESS`, and return any still-held resources. `Process::stop`'s own
    /// event performs the equivalent teardown with `STOPPED` instead, since
    /// that path does not go through a transfer that "returns" in the usual
    /// sense.
    fn dispatch_transfer(&self, signal: Signal, first: bool) -> Signal {
        let result = if first {
            self.0.coroutine.start(signal)
        } else {
            self.0.coroutine.resume(signal)
        };
        if self.0.coroutine.status() == CoroutineStatus::Finished && self.state() != State::Finished {
            self.finish_and_notify(Signal::SUCCESS);
        }
        result
    }

    /// Resume this (suspended) process with `signal`, for use by resource
    /// guards once they have granted a waiter its unit(s).
    pub(crate) fn resume(&self, signal: Signal) {
        self.dispatch_transfer(signal, false);
    }

    fn finish_and_notify(&self, waiter_signal: Signal) {
        self.0.state.store(State::Finished as u8, Ordering::Release);
        let id = self.id();
        for waiter in std::mem::take(&mut *self.0.waiters.lock().unwrap()) {
            waiter.dispatch_transfer(waiter_signal, false);
        }
        for held in std::mem::take(&mut *self.0.held.lock().unwrap()) {
            held.drop_for(id);
        }
    }

    /// `process_start(p)`: schedules a zero-duration event at the current
    /// clock, at this process's priority, whose action transfers into the
    /// coroutine for the first time.
    pub fn start(&self) {
        if self.state() != State::Created {
            fatal("Process::start() called on a process that is not Created");
        }
        self.0.state.store(State::Running as u8, Ordering::Release);
        let me = self.clone();
        let kernel = self.0.kernel.clone();
        let time = kernel.time();
        kernel.schedule(Action::Start, self.tag(), Tag::None, time, self.priority(), move || {
            me.dispatch_transfer(Signal::SUCCESS, true);
        });
    }

    /// `process_hold(duration)`. Callable only inside this process.
    pub fn hold(duration: f64) -> Signal {
        if duration < 0.0 {
            fatal("hold() called with a negative duration");
        }
        let me = Process::current();
        me.require_not_waiting();
        let kernel = me.0.kernel.clone();
        let wake_at = kernel.time() + duration;
        let priority = me.priority();
        let waiter = me.clone();
        let handle = kernel.schedule(Action::Wakeup, me.tag(), Tag::None, wake_at, priority, move || {
            waiter.dispatch_transfer(Signal::SUCCESS, false);
        });
        me.set_waits_for(WaitsFor::Clock(handle));
        let signal = Coroutine::yield_(Signal::SUCCESS);
        me.set_waits_for(WaitsFor::None);
        if !signal.is_success() {
            me.0.kernel.cancel(handle);
        }
        signal
    }

    /// `process_wait_process(target)`.
    pub fn wait_for_process(&self, target: &Process) -> Signal {
        if target.state() == State::Finished {
            return Signal::SUCCESS;
        }
        self.require_not_waiting();
        target.0.waiters.lock().unwrap().push(self.clone());
        self.set_waits_for(WaitsFor::Process(target.clone()));
        let signal = Coroutine::yield_(Signal::SUCCESS);
        self.set_waits_for(WaitsFor::None);
        signal
    }

    /// `process_wait_event(handle)`.
    pub fn wait_for_event(&self, handle: EventHandle) -> Signal {
        self.require_not_waiting();
        let me = self.clone();
        let registered = self.0.kernel.add_waiter(handle, self.0.id, move |signal| {
            me.dispatch_transfer(signal, false);
        });
        if !registered {
            fatal("wait_for_event() on a handle that is not a live event");
        }
        self.set_waits_for(WaitsFor::Event(handle));
        let signal = Coroutine::yield_(Signal::SUCCESS);
        self.set_waits_for(WaitsFor::None);
        signal
    }

    fn require_not_waiting(&self) {
        if !matches!(self.waits_for_clone(), WaitsFor::None) {
            fatal("a suspending call was made while a process is already waiting on something else");
        }
    }

    /// `stop_waiting(p)`: tear down whatever `p` is currently blocked on,
    /// without resuming it — shared by `interrupt` and `stop`.
    fn stop_waiting(&self) {
        let wf = {
            let mut slot = self.0.waits_for.lock().unwrap();
            std::mem::replace(&mut *slot, WaitsFor::None)
        };
        match wf {
            WaitsFor::None => {}
            WaitsFor::Clock(handle) => {
                self.0.kernel.cancel(handle);
            }
            WaitsFor::Event(handle) => {
                // Unlink this process's own waiter registration so a stale
                // fire/cancel of an event we are no longer blocked on can
                // never deliver a spurious resume into whatever wait we
                // move on to next.
                self.0.kernel.remove_waiter(handle, self.0.id);
            }
            WaitsFor::Process(target) => {
                target.0.waiters.lock().unwrap().retain(|w| w != self);
            }
            WaitsFor::Resource(wait) => {
                (wait.cancel)();
            }
        }
        // Any wakeup event already scheduled for this process (e.g. a
        // hold's clock event) is swept up here too: a wakeup still sitting
        // in the queue never fires after this point, but one that has
        // already popped and is mid-dispatch is unaffected since it no
        // longer lives in the queue to be pattern-cancelled.
        self.0.kernel.pattern_cancel(Some(Action::Wakeup), Some(self.tag()), None);
    }

    /// `process_interrupt(p, signal, priority)`: non-blocking.
    pub fn interrupt(&self, signal: Signal, priority: i64) {
        if signal.is_success() {
            fatal("interrupt() must not use the SUCCESS sentinel");
        }
        self.stop_waiting();
        let target = self.clone();
        let time = self.0.kernel.time();
        self.0
            .kernel
            .schedule(Action::Interrupt, self.tag(), Tag::None, time, priority, move || {
                target.dispatch_transfer(signal, false);
            });
    }

    /// `process_stop(p, retval)`: non-blocking.
    pub fn stop(&self, retval: Signal) {
        if self.state() == State::Finished {
            return;
        }
        self.stop_waiting();
        let target = self.clone();
        let time = self.0.kernel.time();
        self.0
            .kernel
            .schedule(Action::Stop, self.tag(), Tag::None, time, self.priority(), move || {
                target.0.coroutine.stop(retval);
                if target.0.coroutine.status() == CoroutineStatus::Finished
                    && target.state() != State::Finished
                {
                    target.finish_and_notify(Signal::STOPPED);
                    debug!("process {:?} stopped", target.name());
                }
            });
    }

    /// `process_exit` — called from within the process itself.
    pub fn exit(value: Signal) -> ! {
        Coroutine::exit(value)
    }

    /// `process_set_priority(p, new)`.
    pub fn set_priority(&self, new: i64) {
        self.0.priority.store(new, Ordering::Release);
        match self.waits_for_clone() {
            WaitsFor::Clock(handle) => self.0.kernel.reprioritize(handle, new),
            WaitsFor::Resource(wait) => (wait.reprioritize)(new),
            _ => {}
        }
        debug!("process {:?} priority -> {}", self.name(), new);
    }
}

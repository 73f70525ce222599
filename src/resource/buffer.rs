//! Bounded FIFO buffer. Two guards share one `core.size`/`capacity`: the
//! put-side guard waits on `size < capacity`, the get-side guard waits on
//! `size > 0`. Put pushes and signals the get-guard; get pops and signals
//! the put-guard. Not holdable — a stopped process mid-`put`/`get` simply
//! has its guard entry cancelled like any other non-holdable wait, so
//! `Buffer` never appears in [`crate::resource::Held`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::kernel::Kernel;
use crate::resource::{schedule_guard_resume, Core, Guard, Need};
use crate::signal::Signal;

struct State {
    core: Core,
    put_guard: Guard,
    get_guard: Guard,
    items: VecDeque<u64>,
}

struct Inner {
    id: u64,
    kernel: Kernel,
    state: Mutex<State>,
}

#[derive(Clone)]
pub struct Buffer(Arc<Inner>);

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Buffer {}

impl Buffer {
    /// `resource_create` + `resource_initialize(capacity)`.
    pub fn new(kernel: &Kernel, capacity: u64) -> Buffer {
        Buffer(Arc::new(Inner {
            id: kernel.next_resource_id(),
            kernel: kernel.clone(),
            state: Mutex::new(State {
                core: Core::new(capacity),
                put_guard: Guard::new(),
                get_guard: Guard::new(),
                items: VecDeque::new(),
            }),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn len(&self) -> u64 {
        self.0.state.lock().unwrap().core.in_use
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks while `size + amount > capacity`, then pushes `amount` items
    /// and signals the get-guard.
    pub fn put(&self, amount: u64) -> Signal {
        let process = crate::process::Process::current();
        let me_cancel = self.clone();
        let me_reprio = self.clone();
        let signal = {
            let mut state = self.0.state.lock().unwrap();
            if Need::Free(amount).satisfied(&state.core) {
                state.core.in_use += amount;
                for _ in 0..amount {
                    state.items.push_back(process.id());
                }
                Signal::SUCCESS
            } else {
                let handle = state.put_guard.enqueue(&process, Need::Free(amount));
                drop(state);
                process.set_resource_wait(crate::process::ResourceWait {
                    cancel: Arc::new(move || me_cancel.cancel_put(handle)),
                    reprioritize: Arc::new(move |p| me_reprio.reprioritize_put(handle, p)),
                });
                let signal = crate::coroutine::Coroutine::yield_(Signal::SUCCESS);
                process.clear_resource_wait();
                if !signal.is_success() {
                    self.0.state.lock().unwrap().put_guard.cancel(handle);
                }
                // On success, `signal_put` already pushed these items and
                // bumped `in_use` on this process's behalf when it granted
                // the waiting entry; redoing it here would double-count.
                signal
            }
        };
        if signal.is_success() {
            self.signal_get();
        }
        signal
    }

    /// `release(resource, amount)` on the get side: block while `size <
    /// amount`, then pop `amount` items and signal the put-guard.
    pub fn get(&self, amount: u64) -> Signal {
        let process = crate::process::Process::current();
        let me_cancel = self.clone();
        let me_reprio = self.clone();
        let signal = {
            let mut state = self.0.state.lock().unwrap();
            if Need::Filled(amount).satisfied(&state.core) {
                state.core.in_use -= amount;
                for _ in 0..amount {
                    state.items.pop_front();
                }
                Signal::SUCCESS
            } else {
                let handle = state.get_guard.enqueue(&process, Need::Filled(amount));
                drop(state);
                process.set_resource_wait(crate::process::ResourceWait {
                    cancel: Arc::new(move || me_cancel.cancel_get(handle)),
                    reprioritize: Arc::new(move |p| me_reprio.reprioritize_get(handle, p)),
                });
                let signal = crate::coroutine::Coroutine::yield_(Signal::SUCCESS);
                process.clear_resource_wait();
                if !signal.is_success() {
                    self.0.state.lock().unwrap().get_guard.cancel(handle);
                }
                // On success, `signal_get` already popped these items and
                // dropped `in_use` on this process's behalf when it granted
                // the waiting entry; redoing it here would double-pop.
                signal
            }
        };
        if signal.is_success() {
            self.signal_put();
        }
        signal
    }

    fn cancel_put(&self, handle: crate::pqueue::Handle) {
        self.0.state.lock().unwrap().put_guard.cancel(handle);
    }

    fn reprioritize_put(&self, handle: crate::pqueue::Handle, new_priority: i64) {
        self.0
            .state
            .lock()
            .unwrap()
            .put_guard
            .reprioritize(handle, new_priority);
    }

    fn cancel_get(&self, handle: crate::pqueue::Handle) {
        self.0.state.lock().unwrap().get_guard.cancel(handle);
    }

    fn reprioritize_get(&self, handle: crate::pqueue::Handle, new_priority: i64) {
        self.0
            .state
            .lock()
            .unwrap()
            .get_guard
            .reprioritize(handle, new_priority);
    }

    /// After a put (size went up), the get-side guard's predicate may now
    /// hold for its front waiter.
    fn signal_get(&self) {
        loop {
            let granted = {
                let mut state = self.0.state.lock().unwrap();
                match state.get_guard.signal(&state.core) {
                    Some((p, Need::Filled(amount))) => {
                        state.core.in_use -= amount;
                        for _ in 0..amount {
                            state.items.pop_front();
                        }
                        Some(p)
                    }
                    Some((_, Need::Free(_))) => {
                        unreachable!("cimba: a buffer get-guard only ever enqueues Need::Filled waiters")
                    }
                    None => None,
                }
            };
            match granted {
                Some(process) => {
                    schedule_guard_resume(&self.0.kernel, self.0.id, process);
                    self.signal_put();
                }
                None => break,
            }
        }
    }

    /// After a get (size went down), the put-side guard's predicate may now
    /// hold for its front waiter.
    fn signal_put(&self) {
        loop {
            let granted = {
                let mut state = self.0.state.lock().unwrap();
                match state.put_guard.signal(&state.core) {
                    Some((p, Need::Free(amount))) => {
                        state.core.in_use += amount;
                        for _ in 0..amount {
                            state.items.push_back(p.id());
                        }
                        Some(p)
                    }
                    Some((_, Need::Filled(_))) => {
                        unreachable!("cimba: a buffer put-guard only ever enqueues Need::Free waiters")
                    }
                    None => None,
                }
            };
            match granted {
                Some(process) => {
                    schedule_guard_resume(&self.0.kernel, self.0.id, process);
                }
                None => break,
            }
        }
    }
}

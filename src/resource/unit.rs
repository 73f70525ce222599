//! Single-unit resource (a binary semaphore): at most one holder at a
//! time. Holdable: an external `Process::stop` on the holder returns the
//! unit via [`Unit::drop_holder`] without running any code on the stopped
//! process's own stack.

use std::sync::{Arc, Mutex};

use crate::kernel::Kernel;
use crate::process::{Process, ProcessId};
use crate::resource::{schedule_guard_resume, Core, Guard, Held, Need};
use crate::signal::Signal;

struct State {
    core: Core,
    guard: Guard,
    holder: Option<Process>,
}

struct Inner {
    id: u64,
    kernel: Kernel,
    state: Mutex<State>,
}

#[derive(Clone)]
pub struct Unit(Arc<Inner>);

impl PartialEq for Unit {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Unit {}

impl Unit {
    /// `resource_create` + `resource_initialize(capacity=1)`.
    pub fn new(kernel: &Kernel) -> Unit {
        Unit(Arc::new(Inner {
            id: kernel.next_resource_id(),
            kernel: kernel.clone(),
            state: Mutex::new(State {
                core: Core::new(1),
                guard: Guard::new(),
                holder: None,
            }),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn in_use(&self) -> bool {
        self.0.state.lock().unwrap().core.in_use == 1
    }

    /// `acquire(resource, 1)`.
    pub fn acquire(&self) -> Signal {
        let process = Process::current();
        let cancel_unit = self.clone();
        let reprio_unit = self.clone();
        let signal = {
            let mut state = self.0.state.lock().unwrap();
            if Need::Free(1).satisfied(&state.core) {
                state.core.in_use = 1;
                state.holder = Some(process.clone());
                Signal::SUCCESS
            } else {
                let handle = state.guard.enqueue(&process, Need::Free(1));
                drop(state);
                process.set_resource_wait(crate::process::ResourceWait {
                    cancel: Arc::new(move || cancel_unit.cancel_wait(handle)),
                    reprioritize: Arc::new(move |p| reprio_unit.reprioritize_wait(handle, p)),
                });
                let signal = crate::coroutine::Coroutine::yield_(Signal::SUCCESS);
                process.clear_resource_wait();
                if !signal.is_success() {
                    self.0.state.lock().unwrap().guard.cancel(handle);
                }
                signal
            }
        };
        if signal.is_success() {
            process.add_held(Held::Unit(self.clone()));
        }
        signal
    }

    fn cancel_wait(&self, handle: crate::pqueue::Handle) {
        self.0.state.lock().unwrap().guard.cancel(handle);
    }

    fn reprioritize_wait(&self, handle: crate::pqueue::Handle, new_priority: i64) {
        self.0.state.lock().unwrap().guard.reprioritize(handle, new_priority);
    }

    /// `release(resource, 1)`.
    pub fn release(&self) {
        let process = Process::current();
        process.remove_held(self.id());
        {
            let mut state = self.0.state.lock().unwrap();
            state.core.in_use = 0;
            state.holder = None;
        }
        self.drain_guard();
    }

    fn drain_guard(&self) {
        let granted = {
            let mut state = self.0.state.lock().unwrap();
            match state.guard.signal(&state.core) {
                Some((process, _)) => {
                    state.core.in_use = 1;
                    state.holder = Some(process.clone());
                    Some(process)
                }
                None => None,
            }
        };
        if let Some(process) = granted {
            process.add_held(Held::Unit(self.clone()));
            schedule_guard_resume(&self.0.kernel, self.0.id, process);
        }
    }

    /// `preempt(resource, 1)` (holdable variant): if held, interrupt the
    /// current holder with `PREEMPTED` and hand the unit to the caller;
    /// otherwise behaves like `acquire`.
    pub fn preempt(&self) -> Signal {
        let process = Process::current();
        let victim = {
            let state = self.0.state.lock().unwrap();
            state.holder.clone()
        };
        match victim {
            Some(holder) if holder != process => {
                holder.remove_held(self.id());
                {
                    let mut state = self.0.state.lock().unwrap();
                    state.holder = Some(process.clone());
                }
                holder.interrupt(Signal::PREEMPTED, holder.priority());
                process.add_held(Held::Unit(self.clone()));
                Signal::SUCCESS
            }
            _ => self.acquire(),
        }
    }

    pub(crate) fn drop_holder(&self, pid: ProcessId) {
        {
            let mut state = self.0.state.lock().unwrap();
            if state.holder.as_ref().map(|p| p.id()) == Some(pid) {
                state.core.in_use = 0;
                state.holder = None;
            }
        }
        self.drain_guard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Builder, Kernel};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn acquire_then_release_frees_the_unit() {
        let kernel = Kernel::new(0.0);
        let unit = Unit::new(&kernel);
        {
            let unit = unit.clone();
            Builder::new().name("holder").spawn(&kernel, move |_me| {
                assert!(unit.acquire().is_success());
                assert!(unit.in_use());
                unit.release();
                Signal::SUCCESS
            });
        }
        kernel.run();
        assert!(!unit.in_use());
    }

    #[test]
    fn second_acquirer_blocks_until_release() {
        let kernel = Kernel::new(0.0);
        let unit = Unit::new(&kernel);
        let second_acquired_at = Arc::new(std::sync::Mutex::new(None));

        {
            let unit = unit.clone();
            Builder::new().name("first").spawn(&kernel, move |_me| {
                assert!(unit.acquire().is_success());
                Process::hold(3.0);
                unit.release();
                Signal::SUCCESS
            });
        }
        {
            let unit = unit.clone();
            let second_acquired_at = second_acquired_at.clone();
            Builder::new().name("second").spawn(&kernel, move |me| {
                assert!(unit.acquire().is_success());
                *second_acquired_at.lock().unwrap() = Some(me.kernel().time());
                unit.release();
                Signal::SUCCESS
            });
        }
        kernel.run();
        assert_eq!(*second_acquired_at.lock().unwrap(), Some(3.0));
    }

    #[test]
    fn preempt_on_a_free_unit_behaves_like_acquire() {
        let kernel = Kernel::new(0.0);
        let unit = Unit::new(&kernel);
        let acquired = Arc::new(AtomicBool::new(false));
        {
            let unit = unit.clone();
            let acquired = acquired.clone();
            Builder::new().name("p").spawn(&kernel, move |_me| {
                assert_eq!(unit.preempt(), Signal::SUCCESS);
                acquired.store(true, Ordering::SeqCst);
                unit.release();
                Signal::SUCCESS
            });
        }
        kernel.run();
        assert!(acquired.load(Ordering::SeqCst));
    }
}

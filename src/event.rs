//! Event queue / dispatcher, built directly on [`pqueue::IndexedPQueue`].
//! Kept data-only and ignorant of the `Process` type: an `Event` carries a
//! type-erased thunk for its action and a list of type-erased wakeup
//! closures for its waiters, each closure already carrying (having
//! captured) the one process it resumes. There is no permanent process
//! registry here for a handle to be looked up in; each waiter closure owns
//! its own clone of the process it resumes and is consumed exactly once.

use crate::pqueue::{Handle, IndexedPQueue};
use crate::signal::Signal;

pub type EventHandle = Handle;
pub type ProcessId = u64;

/// What kind of event this is, used only so `pattern_cancel` can match on
/// it; the dispatcher itself just runs whatever thunk is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Wakeup,
    Stop,
    Interrupt,
    GuardSignal,
}

/// The subject/object pair an event is tagged with for pattern matching.
/// `Resource` is identified by the same opaque id space `resource.rs`
/// hands out. `ProcessId` here is a plain numeric tag used only for
/// equality matching, not a registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    None,
    Process(ProcessId),
    Resource(u64),
}

/// A wildcard-capable match clause for `pattern_cancel`: `None` matches
/// anything, `Some(x)` requires equality.
pub type Match<T> = Option<T>;

fn matches<T: PartialEq>(clause: &Match<T>, value: &T) -> bool {
    match clause {
        None => true,
        Some(want) => want == value,
    }
}

type Wakeup = Box<dyn FnOnce(Signal) + Send>;

pub struct Event {
    pub action: Action,
    pub subject: Tag,
    pub object: Tag,
    // Tagged with the waiting process's id so `EventQueue::remove_waiter`
    // can unlink one specific waiter, not every waiter, when that process
    // is interrupted out of a `wait_for_event` before the event itself
    // fires or is cancelled.
    waiters: Vec<(ProcessId, Wakeup)>,
    thunk: Option<Box<dyn FnOnce() + Send>>,
}

impl Event {
    /// Resume every registered waiter with `SUCCESS`, then run the event's
    /// own action. `pub(crate)` so the dispatcher can fire an event after
    /// releasing the queue lock it was popped under — see
    /// `EventQueue::pop_ready`.
    pub(crate) fn fire(mut self) {
        for (_, waiter) in self.waiters.drain(..) {
            waiter(Signal::SUCCESS);
        }
        if let Some(thunk) = self.thunk.take() {
            thunk();
        }
    }

    fn cancel_waiters(mut self) {
        for (_, waiter) in self.waiters.drain(..) {
            waiter(Signal::CANCELLED);
        }
    }
}

pub struct EventQueue {
    pqueue: IndexedPQueue<Event>,
    clock: f64,
}

impl EventQueue {
    /// `initialize(t0)`.
    pub fn new(t0: f64) -> Self {
        EventQueue {
            pqueue: IndexedPQueue::new(),
            clock: t0,
        }
    }

    pub fn time(&self) -> f64 {
        self.clock
    }

    /// Schedule `thunk` to run at `time` with the given `priority`.
    /// `time >= current_clock` is a hard precondition.
    pub fn schedule<F>(
        &mut self,
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
        if time < self.clock {
            crate::error::fatal("schedule() at a time earlier than the current clock");
        }
        let event = Event {
            action,
            subject,
            object,
            waiters: Vec::new(),
            thunk: Some(Box::new(thunk)),
        };
        self.pqueue.enqueue(event, time, priority)
    }

    /// Register a wakeup closure to run (with `SUCCESS`) when `handle`
    /// fires, or (with `CANCELLED`) if it is cancelled first. Returns
    /// `false`, running nothing, if the event is not live — the caller
    /// treats that as "already fired".
    pub fn add_waiter<F>(&mut self, handle: EventHandle, waiter_id: ProcessId, waiter: F) -> bool
    where
        F: FnOnce(Signal) + Send + 'static,
    {
        match self.pqueue.get_mut(handle) {
            Some(event) => {
                event.waiters.push((waiter_id, Box::new(waiter)));
                true
            }
            None => false,
        }
    }

    /// Unlink `waiter_id`'s registration from `handle` without resuming
    /// it, used when a process blocked in `wait_for_event` is interrupted
    /// or stopped before the event it was waiting on fires or is
    /// cancelled. A no-op if the event is no longer live (already
    /// fired/cancelled, in which case the waiter was already consumed, or
    /// never registered).
    pub fn remove_waiter(&mut self, handle: EventHandle, waiter_id: ProcessId) {
        if let Some(event) = self.pqueue.get_mut(handle) {
            event.waiters.retain(|(id, _)| *id != waiter_id);
        }
    }

    /// Remove the event `handle` if present, resuming its waiters with
    /// cancellation.
    pub fn cancel(&mut self, handle: EventHandle) -> bool {
        match self.pqueue.cancel(handle) {
            Some(event) => {
                event.cancel_waiters();
                true
            }
            None => false,
        }
    }

    /// `pattern_cancel(action, subject, object)`: remove all matching
    /// events, resuming their waiters with cancellation; returns the
    /// number of events removed.
    pub fn pattern_cancel(
        &mut self,
        action: Match<Action>,
        subject: Match<Tag>,
        object: Match<Tag>,
    ) -> usize {
        let removed = self.pqueue.retain_remove(|event| {
            matches(&action, &event.action)
                && matches(&subject, &event.subject)
                && matches(&object, &event.object)
        });
        let count = removed.len();
        for event in removed {
            event.cancel_waiters();
        }
        count
    }

    /// `reprioritize(handle, new_priority)`.
    pub fn reprioritize(&mut self, handle: EventHandle, new_priority: i64) {
        let (time, _) = self
            .pqueue
            .keys_of(handle)
            .unwrap_or_else(|| crate::error::fatal("reprioritize() on a handle that is not live"));
        self.pqueue.reprioritize(handle, time, new_priority);
    }

    /// `clear()`: cancel everything, resuming every waiter with
    /// cancellation.
    pub fn clear(&mut self) {
        while let Some((_, event)) = self.pqueue.pop() {
            event.cancel_waiters();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pqueue.is_empty()
    }

    pub fn peek_time(&self) -> Option<f64> {
        self.pqueue.peek_keys().map(|(t, _)| t)
    }

    /// Advance the clock to the minimum event's time (which must be `>=`
    /// the current clock, since the clock is monotonic across a run) and
    /// pop it, returning the event still unfired.
    ///
    /// Deliberately split from firing: firing runs waiters and the event's
    /// action, which is user code that may call straight back into this
    /// same `EventQueue` (`Process::hold` schedules another event, a guard
    /// signal resumes a process that immediately acquires again, ...). A
    /// caller that holds this queue behind a lock — `Kernel` does — must
    /// drop that lock between `pop_ready` and `Event::fire`, or such a
    /// re-entrant call deadlocks against itself.
    pub fn pop_ready(&mut self) -> Option<Event> {
        let time = self.peek_time()?;
        if time < self.clock {
            crate::error::fatal("event queue clock moved backwards");
        }
        self.clock = time;
        let (_, event) = self.pqueue.pop().expect("peek_time() said an event was ready");
        Some(event)
    }

    /// Convenience for callers (tests, anything not behind `Kernel`'s lock)
    /// that don't need the pop/fire split: pop the minimum event and fire
    /// it immediately. One iteration of `execute()`'s main loop.
    pub fn step(&mut self) -> bool {
        match self.pop_ready() {
            Some(event) => {
                event.fire();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    // Thunks and waiters are `Send` (they cross from whichever thread calls
    // `schedule`/`add_waiter` to the thread that later drives the queue),
    // so these tests share state with `Arc<Mutex<_>>` rather than `Rc<RefCell<_>>`.

    #[test]
    fn events_fire_in_time_priority_fifo_order() {
        let mut q = EventQueue::new(0.0);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mk = |label: &'static str, order: Arc<Mutex<Vec<&'static str>>>| {
            move || order.lock().unwrap().push(label)
        };

        q.schedule(Action::Wakeup, Tag::None, Tag::None, 5.0, 0, mk("late", order.clone()));
        q.schedule(Action::Wakeup, Tag::None, Tag::None, 1.0, 0, mk("early-low", order.clone()));
        q.schedule(Action::Wakeup, Tag::None, Tag::None, 1.0, 10, mk("early-high", order.clone()));

        while q.step() {}
        assert_eq!(*order.lock().unwrap(), vec!["early-high", "early-low", "late"]);
    }

    #[test]
    fn waiters_resume_with_success_before_action_runs() {
        let mut q = EventQueue::new(0.0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_action = seen.clone();
        let handle = q.schedule(Action::Wakeup, Tag::None, Tag::None, 1.0, 0, move || {
            seen_action.lock().unwrap().push(Signal::user(999))
        });
        let seen_waiter = seen.clone();
        q.add_waiter(handle, 0, move |s| seen_waiter.lock().unwrap().push(s));
        q.step();
        assert_eq!(*seen.lock().unwrap(), vec![Signal::SUCCESS, Signal::user(999)]);
    }

    #[test]
    fn cancel_resumes_waiters_with_cancelled() {
        let mut q = EventQueue::new(0.0);
        let seen = Arc::new(Mutex::new(None));
        let handle = q.schedule(Action::Wakeup, Tag::None, Tag::None, 1.0, 0, || {});
        let seen_waiter = seen.clone();
        q.add_waiter(handle, 0, move |s| *seen_waiter.lock().unwrap() = Some(s));
        assert!(q.cancel(handle));
        assert_eq!(*seen.lock().unwrap(), Some(Signal::CANCELLED));
    }

    #[test]
    fn pattern_cancel_matches_wildcards() {
        let mut q = EventQueue::new(0.0);
        q.schedule(Action::Wakeup, Tag::Process(1), Tag::None, 1.0, 0, || {});
        q.schedule(Action::Wakeup, Tag::Process(2), Tag::None, 2.0, 0, || {});
        q.schedule(Action::Stop, Tag::Process(1), Tag::None, 3.0, 0, || {});
        let count = q.pattern_cancel(Some(Action::Wakeup), None, None);
        assert_eq!(count, 2);
        assert!(!q.is_empty());
    }

    #[test]
    #[should_panic(expected = "earlier than the current clock")]
    fn schedule_in_the_past_is_fatal() {
        let mut q = EventQueue::new(10.0);
        q.schedule(Action::Wakeup, Tag::None, Tag::None, 5.0, 0, || {});
    }
}

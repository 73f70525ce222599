//! Per-thread "which coroutine am I" bookkeeping. One OS thread hosts
//! exactly one coroutine for its entire life, so the thread-local only
//! ever needs to remember that single identity and its inbox.
//!
//! Every OS thread that is not itself a spawned coroutine thread (the
//! process's initial thread, a test thread, an embedder's own thread) is
//! lazily given a free-standing "main coroutine" the first time it calls
//! `Coroutine::current()`. A main coroutine is never `start`-ed and never
//! receives on its inbox; it exists purely as an identity other coroutines
//! can address with `transfer`/`yield_`.

use std::cell::RefCell;
use std::sync::mpsc::Receiver;

use crate::signal::Signal;

use super::Coroutine;

thread_local! {
    static CURRENT: RefCell<Option<Coroutine>> = RefCell::new(None);
    static INBOX: RefCell<Option<Receiver<Signal>>> = RefCell::new(None);
}

/// Installed by a coroutine's backing thread right after it starts, before
/// it waits for its first resume value.
pub(crate) fn install_current(co: Coroutine, rx: Receiver<Signal>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(co));
    INBOX.with(|i| *i.borrow_mut() = Some(rx));
}

/// Blocks until the next value is transferred into this coroutine, or
/// `None` if its inbox has been torn down (only possible after `destroy`).
pub(crate) fn recv_current() -> Option<Signal> {
    INBOX.with(|i| i.borrow().as_ref().and_then(|rx| rx.recv().ok()))
}

/// The coroutine identity of the calling thread, creating a free-standing
/// main coroutine on first use if this thread has never hosted a spawned
/// coroutine.
pub fn current() -> Coroutine {
    let existing = CURRENT.with(|c| c.borrow().clone());
    if let Some(co) = existing {
        return co;
    }
    // Built outside of any thread-local borrow: `create_main_parts` touches
    // only the new coroutine's own state, but keeping this sequence strictly
    // non-reentrant with respect to `CURRENT`/`INBOX` avoids ever trying to
    // borrow either thread-local twice at once.
    let (co, rx) = super::Coroutine::create_main_parts();
    CURRENT.with(|c| *c.borrow_mut() = Some(co.clone()));
    INBOX.with(|i| *i.borrow_mut() = Some(rx));
    co
}

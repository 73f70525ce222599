//! Contract-violation reporting.
//!
//! Contract violations — negative hold durations, yielding from the main
//! coroutine, destroying a running coroutine, scheduling into the past,
//! reprioritizing a handle that isn't live — are programming errors. They
//! are fatal and reported with `panic!`, not threaded through `Result`.

/// Panics with a uniform `cimba: contract violation: ...` prefix so every
/// fatal diagnostic in the crate reads the same way.
#[track_caller]
pub(crate) fn fatal(message: &str) -> ! {
    panic!("cimba: contract violation: {message}")
}

/// Private marker unwound through a stopped coroutine's stack so that no
/// further user code runs after `Coroutine::stop`/`Process::stop` lands. It
/// is caught only by `Coroutine::finish` in `coroutine/mod.rs` and must
/// never be observed by user code.
pub(crate) struct StopUnwind;

/// Begin unwinding the current coroutine's stack with the `StopUnwind`
/// marker. Called from `Coroutine::transfer` immediately after a resume,
/// once it observes that this coroutine's own status was flipped to
/// `Finished` externally (by a `stop` call on a non-current coroutine)
/// while it was suspended — the mark left behind so that waking up here
/// unwinds instead of handing control back to user code.
pub(crate) fn unwind_for_stop() -> ! {
    std::panic::resume_unwind(Box::new(StopUnwind))
}

//! End-to-end simulation scenarios exercising the process, event, and
//! resource layers together. Each test builds a small simulation, runs it
//! to completion (or for a bounded simulated duration), and checks the
//! outcome against a known-correct expectation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cimba::{Builder, Buffer, Kernel, Process, Signal, Unit};

fn init() {
    let _ = env_logger::try_init();
}

/// M/M/1 queue: a Poisson arrival process feeding a FIFO buffer that a
/// single server drains at its own exponential rate. For utilization
/// ρ = λ/μ = 0.75, the analytic mean queue length is ρ²/(1−ρ) = 2.25.
/// A monitor samples the buffer length on a fixed cadence after a warm-up
/// period and checks the time-average lands within 10% of that figure.
#[test]
fn mm1_queue_length_matches_analytic_mean() {
    init();
    let kernel = Kernel::new(0.0);
    cimba::random::seed(20260727);

    let buffer = Buffer::new(&kernel, u64::MAX);

    {
        let buffer = buffer.clone();
        Builder::new().name("arrival").spawn(&kernel, move |_me| loop {
            Process::hold(cimba::random::exponential(1.0 / 0.75));
            buffer.put(1);
        });
    }
    {
        let buffer = buffer.clone();
        Builder::new().name("server").spawn(&kernel, move |_me| loop {
            buffer.get(1);
            Process::hold(cimba::random::exponential(1.0));
        });
    }

    let warmup = 1000.0;
    let horizon = 1_000_000.0;
    let sample_interval = 1.0;
    let weighted_sum = Arc::new(Mutex::new(0.0f64));
    let sampled_time = Arc::new(Mutex::new(0.0f64));

    {
        let buffer = buffer.clone();
        let weighted_sum = weighted_sum.clone();
        let sampled_time = sampled_time.clone();
        Builder::new().name("monitor").spawn(&kernel, move |me| {
            Process::hold(warmup);
            loop {
                if me.kernel().time() > horizon {
                    break Signal::SUCCESS;
                }
                *weighted_sum.lock().unwrap() += buffer.len() as f64 * sample_interval;
                *sampled_time.lock().unwrap() += sample_interval;
                Process::hold(sample_interval);
            }
        });
    }

    // Stop the clock once the monitor crosses the horizon; the arrival and
    // server processes loop forever otherwise.
    {
        Builder::new().name("clock-stop").spawn(&kernel, move |_me| {
            Process::hold(horizon + warmup + 10.0);
            Signal::SUCCESS
        });
    }

    while kernel.time() <= horizon + warmup + 10.0 {
        if !kernel.step() {
            break;
        }
    }

    let observed_mean = *weighted_sum.lock().unwrap() / *sampled_time.lock().unwrap();
    let expected = 2.25;
    assert!(
        (observed_mean - expected).abs() / expected < 0.10,
        "observed mean queue length {observed_mean} too far from analytic {expected}"
    );
}

/// Preempt-and-return: capacity-1 resource, A (priority 0) acquires at
/// t=0 and holds for 5, B (priority 10) preempts at t=1. A's hold must
/// return PREEMPTED at t=1, B then holds from 1 to 4, and A re-acquires
/// and completes; both finish with the resource free.
#[test]
fn preempt_and_return() {
    init();
    let kernel = Kernel::new(0.0);
    let unit = Unit::new(&kernel);

    let a_preempted_at = Arc::new(Mutex::new(None));
    let a_finished = Arc::new(Mutex::new(false));
    let b_finished = Arc::new(Mutex::new(false));

    {
        let unit = unit.clone();
        let a_preempted_at = a_preempted_at.clone();
        let a_finished = a_finished.clone();
        Builder::new().name("A").priority(0).spawn(&kernel, move |me| {
            assert!(unit.acquire().is_success());
            let signal = Process::hold(5.0);
            if signal == Signal::PREEMPTED {
                *a_preempted_at.lock().unwrap() = Some(me.kernel().time());
                assert!(unit.acquire().is_success());
                Process::hold(4.0);
                unit.release();
            } else {
                unit.release();
            }
            *a_finished.lock().unwrap() = true;
            Signal::SUCCESS
        });
    }
    {
        let unit = unit.clone();
        let b_finished = b_finished.clone();
        Builder::new().name("B").priority(10).spawn(&kernel, move |_me| {
            Process::hold(1.0);
            assert!(unit.preempt().is_success());
            Process::hold(3.0);
            unit.release();
            *b_finished.lock().unwrap() = true;
            Signal::SUCCESS
        });
    }

    kernel.run();

    assert_eq!(*a_preempted_at.lock().unwrap(), Some(1.0));
    assert!(*a_finished.lock().unwrap());
    assert!(*b_finished.lock().unwrap());
    assert!(!unit.in_use());
}

/// Stop during hold: P calls hold(100); at t=10 another process stops it.
/// P must be Finished at t=10, and no trace of it (wakeup event, held
/// resources) must remain.
#[test]
fn stop_during_hold() {
    init();
    let kernel = Kernel::new(0.0);
    let p_holder = Arc::new(Mutex::new(None));

    {
        let p_holder = p_holder.clone();
        Builder::new().name("P").spawn(&kernel, move |me| {
            *p_holder.lock().unwrap() = Some(me.clone());
            Process::hold(100.0);
            Signal::SUCCESS
        });
    }
    kernel.step(); // run P up to its hold(100.0)

    {
        let p_holder = p_holder.clone();
        Builder::new().name("stopper").spawn(&kernel, move |me| {
            Process::hold(10.0);
            let p = p_holder.lock().unwrap().clone().unwrap();
            p.stop(Signal::STOPPED);
            assert_eq!(me.kernel().time(), 10.0);
            Signal::SUCCESS
        });
    }

    kernel.run();

    let p = p_holder.lock().unwrap().clone().unwrap();
    assert_eq!(p.state(), cimba::ProcessState::Finished);
    assert_eq!(kernel.time(), 10.0);
    assert!(kernel.is_empty());
}

/// Wait-for-process: P1 holds 5; P2 waits for P1 to finish. P2 must
/// resume at t=5 with SUCCESS.
#[test]
fn wait_for_process_resumes_on_finish() {
    init();
    let kernel = Kernel::new(0.0);
    let p2_result = Arc::new(Mutex::new(None));

    let p1 = Builder::new().name("P1").spawn(&kernel, |_me| {
        Process::hold(5.0);
        Signal::SUCCESS
    });

    {
        let p1 = p1.clone();
        let p2_result = p2_result.clone();
        Builder::new().name("P2").spawn(&kernel, move |me| {
            let signal = me.wait_for_process(&p1);
            *p2_result.lock().unwrap() = Some((me.kernel().time(), signal));
            Signal::SUCCESS
        });
    }

    kernel.run();

    assert_eq!(*p2_result.lock().unwrap(), Some((5.0, Signal::SUCCESS)));
}

/// Guard FIFO at equal priority: three processes, all priority 0, call
/// acquire(1) on a capacity-1 resource already held by a fourth, entering
/// the guard queue at t=0, 1, 2 respectively. On release they must
/// acquire in that same order.
#[test]
fn guard_is_fifo_within_equal_priority() {
    init();
    let kernel = Kernel::new(0.0);
    let unit = Unit::new(&kernel);
    let order = Arc::new(Mutex::new(Vec::new()));

    let holder = {
        let unit = unit.clone();
        Builder::new().name("holder").spawn(&kernel, move |_me| {
            assert!(unit.acquire().is_success());
            Process::hold(3.0);
            unit.release();
            Signal::SUCCESS
        })
    };

    for (label, delay) in [("first", 0.0), ("second", 1.0), ("third", 2.0)] {
        let unit = unit.clone();
        let order = order.clone();
        Builder::new().name(label).spawn(&kernel, move |_me| {
            Process::hold(delay);
            assert!(unit.acquire().is_success());
            order.lock().unwrap().push(label);
            unit.release();
            Signal::SUCCESS
        });
    }

    kernel.run();

    assert_eq!(holder.state(), cimba::ProcessState::Finished);
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
}

/// Guard ordering is priority-primary, not entry-time-primary: a
/// low-priority waiter that entered the guard first must still be served
/// after a higher-priority waiter that entered later. Capacity-1 resource
/// held by a fourth process; `low` (priority 0) calls acquire at t=0,
/// `high` (priority 10) calls acquire at t=5; on release the unit must go
/// to `high` first even though `low` has been queued longer.
#[test]
fn guard_is_priority_primary_not_entry_time_primary() {
    init();
    let kernel = Kernel::new(0.0);
    let unit = Unit::new(&kernel);
    let order = Arc::new(Mutex::new(Vec::new()));

    let holder = {
        let unit = unit.clone();
        Builder::new().name("holder").spawn(&kernel, move |_me| {
            assert!(unit.acquire().is_success());
            Process::hold(10.0);
            unit.release();
            Signal::SUCCESS
        })
    };

    {
        let unit = unit.clone();
        let order = order.clone();
        Builder::new().name("low").priority(0).spawn(&kernel, move |_me| {
            assert!(unit.acquire().is_success());
            order.lock().unwrap().push("low");
            unit.release();
            Signal::SUCCESS
        });
    }
    {
        let unit = unit.clone();
        let order = order.clone();
        Builder::new().name("high").priority(10).spawn(&kernel, move |_me| {
            Process::hold(5.0);
            assert!(unit.acquire().is_success());
            order.lock().unwrap().push("high");
            unit.release();
            Signal::SUCCESS
        });
    }

    kernel.run();

    assert_eq!(holder.state(), cimba::ProcessState::Finished);
    assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
}

/// Reprioritize wakeup: P schedules hold(10) at priority 0; at t=1 another
/// process raises P's priority to 5. A second process, "low", also wakes
/// at t=10 but stays at priority 0. Because higher priority runs first
/// among simultaneously scheduled events, P must record its wakeup before
/// "low" does.
#[test]
fn reprioritize_moves_a_queued_wakeup() {
    init();
    let kernel = Kernel::new(0.0);
    let order = Arc::new(Mutex::new(Vec::new()));
    let p_holder = Arc::new(Mutex::new(None));

    {
        let order = order.clone();
        let p_holder = p_holder.clone();
        Builder::new().name("P").priority(0).spawn(&kernel, move |me| {
            *p_holder.lock().unwrap() = Some(me.clone());
            Process::hold(10.0);
            order.lock().unwrap().push("P");
            Signal::SUCCESS
        });
    }
    {
        let order = order.clone();
        Builder::new().name("low").priority(0).spawn(&kernel, move |_me| {
            Process::hold(10.0);
            order.lock().unwrap().push("low");
            Signal::SUCCESS
        });
    }
    {
        let p_holder = p_holder.clone();
        Builder::new().name("reprioritizer").spawn(&kernel, move |_me| {
            Process::hold(1.0);
            let p = p_holder.lock().unwrap().clone().unwrap();
            p.set_priority(5);
            Signal::SUCCESS
        });
    }

    kernel.run();

    assert_eq!(*order.lock().unwrap(), vec!["P", "low"]);
}

/// Interrupt delivered exactly once: interrupting a holding process
/// returns the signal from its `hold` exactly once, with no duplicate
/// wakeup once the original clock event has been cancelled.
#[test]
fn interrupt_delivered_exactly_once() {
    init();
    let kernel = Kernel::new(0.0);
    let signals_seen = Arc::new(AtomicU64::new(0));
    let p_holder = Arc::new(Mutex::new(None));

    {
        let signals_seen = signals_seen.clone();
        let p_holder = p_holder.clone();
        Builder::new().name("P").spawn(&kernel, move |me| {
            *p_holder.lock().unwrap() = Some(me.clone());
            loop {
                let signal = Process::hold(100.0);
                signals_seen.fetch_add(1, Ordering::SeqCst);
                if signal != Signal::SUCCESS {
                    break Signal::SUCCESS;
                }
            }
        });
    }

    {
        let p_holder = p_holder.clone();
        Builder::new().name("interrupter").spawn(&kernel, move |_me| {
            Process::hold(1.0);
            let p = p_holder.lock().unwrap().clone().unwrap();
            p.interrupt(Signal::INTERRUPTED, 0);
            Signal::SUCCESS
        });
    }

    kernel.run();

    assert_eq!(signals_seen.load(Ordering::SeqCst), 1);
}

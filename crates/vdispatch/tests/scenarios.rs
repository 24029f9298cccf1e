//! End-to-end dispatcher behaviour
//!
//! Timing-sensitive checks use generous margins so they hold on loaded CI
//! machines.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use vdispatch::{
    cancel_current_item, current_item_cancelled, current_queue, main_queue, now, run_main_queue,
    Dispatch, DispatchAttr, DispatchRef, Error, Qos, SubmitFlags, TerminateFlags, TimeSpec,
    TimerFlags,
};

fn serial() -> DispatchRef {
    Dispatch::create(&DispatchAttr::serial(Qos::Utility, 0)).expect("create serial dispatcher")
}

/// Poll until `cond` holds or a few seconds pass
fn eventually(cond: impl Fn() -> bool) -> bool {
    for _ in 0..4000 {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn serial_fifo_ordering() {
    let q = serial();
    let log = Arc::new(Mutex::new(String::new()));

    for label in ["A", "B", "C"] {
        let log = log.clone();
        q.spawn(move || log.lock().unwrap().push_str(label)).unwrap();
    }

    // The sync sentinel queues behind A, B and C on the lone worker.
    q.sync(|| 0).unwrap();
    assert_eq!(log.lock().unwrap().as_str(), "ABC");

    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();
}

#[test]
fn sync_delivers_result() {
    let q = serial();
    let x = 7;
    assert_eq!(q.sync(move || x * 3 + 1).unwrap(), 22);
    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();
}

#[test]
fn timers_fire_in_deadline_order() {
    let q = serial();
    let order = Arc::new(Mutex::new(Vec::new()));

    for delay_ms in [30i64, 10, 20] {
        let order = order.clone();
        q.after(TimerFlags::empty(), TimeSpec::from_millis(delay_ms), move || {
            order.lock().unwrap().push(delay_ms);
        })
        .unwrap();
    }

    assert!(eventually(|| order.lock().unwrap().len() == 3));
    assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);

    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();
}

#[test]
fn repeating_timer_coalesces_missed_periods() {
    let q = serial();
    let fires = Arc::new(Mutex::new(Vec::new()));

    let f = fires.clone();
    q.repeating(
        TimerFlags::empty(),
        TimeSpec::from_millis(10),
        TimeSpec::from_millis(10),
        move || {
            let mut v = f.lock().unwrap();
            v.push(now());
            if v.len() == 1 {
                // Block the lone worker across several periods.
                thread::sleep(Duration::from_millis(55));
            }
        },
    )
    .unwrap();

    thread::sleep(Duration::from_millis(200));
    q.terminate(TerminateFlags::CANCEL_ALL | TerminateFlags::AWAIT_ALL).unwrap();

    let v = fires.lock().unwrap();
    assert!(v.len() >= 3, "expected a few fires, got {}", v.len());

    // The periods missed while blocked collapse into one next fire.
    let gap = v[1].sub(v[0]);
    assert!(
        gap >= TimeSpec::from_millis(50),
        "second fire arrived during the block: {}",
        gap
    );

    // No catch-up burst: the run can never see more fires than elapsed
    // periods, despite the five deadlines missed while blocked.
    assert!(v.len() <= 21, "burst of {} fires", v.len());
}

#[test]
fn cancel_before_execution() {
    let q = serial();
    q.suspend().unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    let item = q.item_create(move || r.store(true, Ordering::SeqCst)).unwrap();
    q.submit(SubmitFlags::empty(), item).unwrap();
    q.cancel_item(item);

    q.resume();
    q.sync(|| 0).unwrap();

    assert!(!ran.load(Ordering::SeqCst));
    assert!(q.item_cancelled(item));
    q.item_destroy(item).unwrap();

    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();
}

#[test]
fn suspend_waits_for_busy_workers() {
    let q = Dispatch::create(&DispatchAttr::concurrent(2, 2)).unwrap();
    let done = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let done = done.clone();
        q.spawn(move || {
            thread::sleep(Duration::from_millis(100));
            done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    // Let both workers pick their item up.
    thread::sleep(Duration::from_millis(30));

    let t0 = Instant::now();
    q.suspend().unwrap();
    assert!(
        t0.elapsed() >= Duration::from_millis(50),
        "suspend returned while workers were still running items"
    );
    assert_eq!(done.load(Ordering::SeqCst), 2);

    q.resume();
    q.sync(|| 0).unwrap();
    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();
}

#[test]
fn suspended_dispatcher_defers_new_work() {
    let q = serial();
    q.suspend().unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    q.spawn(move || r.store(true, Ordering::SeqCst)).unwrap();

    thread::sleep(Duration::from_millis(50));
    assert!(!ran.load(Ordering::SeqCst));

    q.resume();
    assert!(eventually(|| ran.load(Ordering::SeqCst)));
    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();
}

#[test]
fn nested_suspension_is_counted() {
    let q = serial();
    q.suspend().unwrap();
    q.suspend().unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    q.spawn(move || r.store(true, Ordering::SeqCst)).unwrap();

    q.resume();
    thread::sleep(Duration::from_millis(50));
    assert!(!ran.load(Ordering::SeqCst), "one resume undid two suspends");

    q.resume();
    assert!(eventually(|| ran.load(Ordering::SeqCst)));
    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();
}

#[test]
fn termination_drains_timers() {
    let q = serial();
    let count = Arc::new(AtomicUsize::new(0));

    let c = count.clone();
    q.repeating(
        TimerFlags::empty(),
        TimeSpec::from_millis(5),
        TimeSpec::from_millis(5),
        move || {
            c.fetch_add(1, Ordering::SeqCst);
        },
    )
    .unwrap();

    thread::sleep(Duration::from_millis(40));
    q.terminate(TerminateFlags::CANCEL_ALL | TerminateFlags::AWAIT_ALL).unwrap();
    assert_eq!(q.await_termination(), Ok(()));

    let settled = count.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(count.load(Ordering::SeqCst), settled, "timer fired after termination");

    // Repeated await_termination stays successful; then teardown succeeds.
    assert_eq!(q.await_termination(), Ok(()));
    assert_eq!(q.destroy(), Ok(()));
}

#[test]
fn signal_monitor_fans_out_and_rearms() {
    let q = Dispatch::create(&DispatchAttr::concurrent(1, 2)).unwrap();
    let signo = q.alloc_signal(0).unwrap();

    let c1 = Arc::new(AtomicUsize::new(0));
    let c2 = Arc::new(AtomicUsize::new(0));
    let (a, b) = (c1.clone(), c2.clone());
    let h1 = q.item_create(move || {
        a.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    let h2 = q.item_create(move || {
        b.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    q.signal_monitor(signo, h1).unwrap();
    q.signal_monitor(signo, h2).unwrap();

    // Each delivery fires each handler exactly once.
    q.send_signal(signo).unwrap();
    assert!(eventually(|| {
        c1.load(Ordering::SeqCst) == 1 && c2.load(Ordering::SeqCst) == 1
    }));

    // Handlers re-armed; a second delivery fires them again.
    q.send_signal(signo).unwrap();
    assert!(eventually(|| {
        c1.load(Ordering::SeqCst) == 2 && c2.load(Ordering::SeqCst) == 2
    }));

    // Cancelling one leaves only the other.
    q.cancel_item(h2);
    q.send_signal(signo).unwrap();
    assert!(eventually(|| c1.load(Ordering::SeqCst) == 3));
    thread::sleep(Duration::from_millis(30));
    assert_eq!(c2.load(Ordering::SeqCst), 2);

    q.free_signal(signo);
    q.terminate(TerminateFlags::CANCEL_ALL | TerminateFlags::AWAIT_ALL).unwrap();
}

#[test]
fn executing_item_observes_cancellation() {
    let q = serial();
    let item = q
        .item_create(|| {
            while !current_item_cancelled() {
                thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

    q.submit(SubmitFlags::AWAITABLE, item).unwrap();
    thread::sleep(Duration::from_millis(30));

    q.cancel_item(item);
    q.await_item(item).unwrap();
    assert!(q.item_cancelled(item));

    q.item_destroy(item).unwrap();
    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();
}

#[test]
fn awaited_item_is_resubmittable() {
    let q = serial();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let item = q
        .item_create(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    q.submit(SubmitFlags::AWAITABLE, item).unwrap();
    q.await_item(item).unwrap();
    q.submit(SubmitFlags::AWAITABLE, item).unwrap();
    q.await_item(item).unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 2);
    q.item_destroy(item).unwrap();
    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();
}

#[test]
fn live_item_resubmission_is_rejected() {
    let q = serial();
    q.suspend().unwrap();

    let item = q.item_create(|| {}).unwrap();
    q.submit(SubmitFlags::empty(), item).unwrap();
    assert_eq!(q.submit(SubmitFlags::empty(), item), Err(Error::Busy));
    assert_eq!(q.item_destroy(item), Err(Error::Busy));

    q.resume();
    q.sync(|| 0).unwrap();
    q.item_destroy(item).unwrap();
    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();
}

#[test]
fn terminated_dispatcher_rejects_work() {
    let q = serial();
    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();

    assert_eq!(q.spawn(|| {}).err(), Some(Error::Terminated));
    assert_eq!(q.sync(|| 1).err(), Some(Error::Terminated));
    assert_eq!(q.suspend(), Err(Error::Terminated));
    assert_eq!(
        q.after(TimerFlags::empty(), TimeSpec::from_millis(1), || {}).err(),
        Some(Error::Terminated)
    );

    // And terminating again changes nothing.
    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();
    assert_eq!(q.await_termination(), Ok(()));
}

#[test]
fn await_termination_needs_terminating_state() {
    let q = serial();
    assert_eq!(q.await_termination(), Err(Error::NotFound));
    assert_eq!(q.destroy(), Err(Error::Busy));
    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();
    assert_eq!(q.destroy(), Ok(()));
}

#[test]
fn invalid_attributes_are_rejected() {
    let mut attr = DispatchAttr::default();
    attr.min_concurrency = 0;
    assert!(matches!(Dispatch::create(&attr), Err(Error::Inval)));

    let attr = DispatchAttr::concurrent(3, 2);
    assert!(matches!(Dispatch::create(&attr), Err(Error::Inval)));

    let mut attr = DispatchAttr::default();
    attr.priority = i8::MAX;
    assert!(matches!(Dispatch::create(&attr), Err(Error::Inval)));
}

#[test]
fn unknown_flag_bits_are_rejected() {
    let q = serial();
    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    let item = q.item_create(move || r.store(true, Ordering::SeqCst)).unwrap();

    // `from_bits_retain` is the one safe door to out-of-range values; every
    // entry point must slam it.
    let bad_submit = SubmitFlags::from_bits_retain(0x80);
    assert_eq!(q.submit(bad_submit, item), Err(Error::Inval));

    let bad_timer = TimerFlags::from_bits_retain(0x40);
    assert_eq!(
        q.timer(bad_timer, TimeSpec::from_millis(5), TimeSpec::INFINITY, item),
        Err(Error::Inval)
    );
    assert_eq!(
        q.after(bad_timer, TimeSpec::from_millis(5), || {}).err(),
        Some(Error::Inval)
    );
    assert_eq!(
        q.repeating(bad_timer, TimeSpec::from_millis(5), TimeSpec::from_millis(5), || {})
            .err(),
        Some(Error::Inval)
    );

    let bad_terminate = TerminateFlags::from_bits_retain(0x40);
    assert_eq!(q.terminate(bad_terminate), Err(Error::Inval));

    // Nothing above was admitted.
    q.sync(|| 0).unwrap();
    assert!(!ran.load(Ordering::SeqCst));

    q.item_destroy(item).unwrap();
    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();
}

#[test]
fn zero_interval_timer_runs_once() {
    let q = serial();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    q.repeating(
        TimerFlags::empty(),
        TimeSpec::from_millis(5),
        TimeSpec::ZERO,
        move || {
            c.fetch_add(1, Ordering::SeqCst);
        },
    )
    .unwrap();

    assert!(eventually(|| count.load(Ordering::SeqCst) == 1));
    thread::sleep(Duration::from_millis(40));
    assert_eq!(count.load(Ordering::SeqCst), 1);

    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();
}

#[test]
fn overdue_timer_cancels_without_firing() {
    let q = serial();
    q.suspend().unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    // Deadline passes while the dispatcher is suspended.
    let item = q
        .after(TimerFlags::empty(), TimeSpec::ZERO, move || {
            r.store(true, Ordering::SeqCst);
        })
        .unwrap();
    thread::sleep(Duration::from_millis(20));
    q.cancel_item(item);

    q.resume();
    q.sync(|| 0).unwrap();
    assert!(!ran.load(Ordering::SeqCst));

    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();
}

#[test]
fn user_timer_on_item_with_absolute_deadline() {
    let q = serial();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let item = q
        .item_create(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let deadline = now().add(TimeSpec::from_millis(20));
    q.timer(TimerFlags::ABSTIME, deadline, TimeSpec::INFINITY, item)
        .unwrap();
    assert_eq!(
        q.timer(TimerFlags::ABSTIME, deadline, TimeSpec::INFINITY, item),
        Err(Error::Busy),
        "arming a scheduled item must fail"
    );

    assert!(eventually(|| count.load(Ordering::SeqCst) == 1));
    q.item_destroy(item).unwrap();
    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();
}

#[test]
fn submission_spills_onto_new_workers() {
    let q = Dispatch::create(&DispatchAttr::concurrent(1, 3)).unwrap();
    for _ in 0..8 {
        q.spawn(|| thread::sleep(Duration::from_millis(50))).unwrap();
    }

    let info = q.concurrency_info();
    assert_eq!(info.minimum, 1);
    assert_eq!(info.maximum, 3);
    assert!(info.current >= 2, "pool never grew: {:?}", info);
    assert!(info.current <= 3);

    q.terminate(TerminateFlags::CANCEL_ALL | TerminateFlags::AWAIT_ALL).unwrap();
}

#[test]
fn name_copy_honours_buffer_bounds() {
    let q = Dispatch::create(&DispatchAttr::default().name("disk-io")).unwrap();

    let mut buf = [0u8; 32];
    let len = q.copy_name(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"disk-io");

    let mut small = [0u8; 3];
    assert_eq!(q.copy_name(&mut small), Err(Error::Range));
    assert_eq!(q.copy_name(&mut []), Err(Error::Inval));

    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();
}

#[test]
fn signal_allocation_respects_reservations() {
    let q = serial();

    // Lowest-priority-first scan, skipping the reserved dispatch-wake
    // signal at the top.
    let first = q.alloc_signal(0).unwrap();
    assert_eq!(first, vdispatch::SIGMAX - 1);
    assert_eq!(q.alloc_signal(first), Err(Error::Busy));
    q.free_signal(first);
    assert_eq!(q.alloc_signal(first), Ok(first));

    // The kill signal is pre-reserved and never handed out.
    assert_eq!(q.alloc_signal(9), Err(Error::Busy));

    // Reserved signals are rejected at the delivery entry points too.
    assert_eq!(q.send_signal(vdispatch::SIGMAX), Err(Error::Inval));
    let item = q.item_create(|| {}).unwrap();
    assert_eq!(q.signal_monitor(9, item), Err(Error::Inval));

    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();
}

#[test]
fn retire_hook_runs_after_each_retirement() {
    let q = serial();
    let retired = Arc::new(AtomicUsize::new(0));
    let r = retired.clone();
    let item = q
        .item_create_with_retire(
            || {},
            move || {
                r.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

    q.submit(SubmitFlags::empty(), item).unwrap();
    assert!(eventually(|| retired.load(Ordering::SeqCst) == 1));

    q.submit(SubmitFlags::empty(), item).unwrap();
    assert!(eventually(|| retired.load(Ordering::SeqCst) == 2));

    q.item_destroy(item).unwrap();
    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();
}

#[test]
fn worker_context_is_visible_to_closures() {
    let q = serial();
    let saw_queue = Arc::new(AtomicBool::new(false));
    let cancelled_inside = Arc::new(AtomicBool::new(false));

    let (sq, ci) = (saw_queue.clone(), cancelled_inside.clone());
    let q2 = q.clone();
    q.spawn(move || {
        if let Some(cur) = current_queue() {
            sq.store(Arc::ptr_eq(&cur, &q2), Ordering::SeqCst);
        }
        cancel_current_item();
        ci.store(current_item_cancelled(), Ordering::SeqCst);
    })
    .unwrap();

    q.sync(|| 0).unwrap();
    assert!(saw_queue.load(Ordering::SeqCst));
    assert!(cancelled_inside.load(Ordering::SeqCst));
    assert!(current_queue().is_none(), "test thread is not a worker");

    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();
}

#[test]
fn scheduling_parameters_are_adjustable() {
    let q = serial();
    assert_eq!(q.qos(), Qos::Utility);
    assert_eq!(q.priority(), 0);

    q.set_qos(Qos::Background).unwrap();
    q.set_priority(4).unwrap();
    assert_eq!(q.qos(), Qos::Background);
    assert_eq!(q.priority(), 4);

    assert_eq!(q.set_priority(i8::MAX), Err(Error::Inval));
    q.terminate(TerminateFlags::AWAIT_ALL).unwrap();
}

#[test]
fn main_queue_adopts_and_serves() {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let q = main_queue();
        tx.send(q).expect("hand the main queue to the test");
        run_main_queue();
    });

    let q = rx.recv().unwrap();
    assert!(Arc::ptr_eq(&q, &main_queue()));

    assert_eq!(q.sync(|| 123).unwrap(), 123);

    // The main dispatcher shrugs termination off.
    q.terminate(TerminateFlags::empty()).unwrap();
    assert_eq!(q.await_termination(), Err(Error::NotFound));
    assert_eq!(q.sync(|| 7).unwrap(), 7);
}

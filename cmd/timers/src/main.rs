//! Timer and signal-monitor example

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vdispatch::{now, Dispatch, DispatchAttr, Qos, TerminateFlags, TimeSpec, TimerFlags};

fn main() {
    println!("=== vdispatch timer example ===\n");

    let q = Dispatch::create(&DispatchAttr::serial(Qos::Utility, 0).name("timers"))
        .expect("create dispatcher");

    let t0 = now();
    for delay_ms in [300i64, 100, 200] {
        q.after(TimerFlags::empty(), TimeSpec::from_millis(delay_ms), move || {
            println!("  one-shot {:>3}ms fired at {}", delay_ms, now().sub(t0));
        })
        .expect("after");
    }

    let ticks = Arc::new(AtomicUsize::new(0));
    let t = ticks.clone();
    let ticker = q
        .repeating(
            TimerFlags::empty(),
            TimeSpec::from_millis(50),
            TimeSpec::from_millis(50),
            move || {
                let n = t.fetch_add(1, Ordering::SeqCst) + 1;
                println!("  tick {} at {}", n, now().sub(t0));
            },
        )
        .expect("repeating");

    std::thread::sleep(Duration::from_millis(400));

    println!("\ncancelling the ticker after {} ticks", ticks.load(Ordering::SeqCst));
    q.cancel_item(ticker);

    // A signal wakes a registered handler each time it is delivered.
    let signo = q.alloc_signal(0).expect("alloc signal");
    let handler = q
        .item_create(move || println!("  signal handler ran"))
        .expect("item");
    q.signal_monitor(signo, handler).expect("monitor");

    for _ in 0..2 {
        q.send_signal(signo).expect("send");
        std::thread::sleep(Duration::from_millis(50));
    }

    q.terminate(TerminateFlags::CANCEL_ALL | TerminateFlags::AWAIT_ALL)
        .expect("terminate");
    println!("\nterminated");
}

//! Basic dispatcher example
//!
//! Spawns fire-and-forget work, runs a synchronous call, and shows the
//! worker pool growing under load.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vdispatch::{Dispatch, DispatchAttr, Qos, TerminateFlags};

fn main() {
    println!("=== vdispatch basic example ===\n");

    let q = Dispatch::create(
        &DispatchAttr::concurrent(1, 4)
            .qos(Qos::Utility)
            .name("example"),
    )
    .expect("create dispatcher");

    let completed = Arc::new(AtomicUsize::new(0));

    println!("Spawning 10 work items...");
    for i in 0..10 {
        let completed = completed.clone();
        q.spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            println!("  item {} done", i);
            completed.fetch_add(1, Ordering::SeqCst);
        })
        .expect("spawn");
    }

    let info = q.concurrency_info();
    println!(
        "worker pool: {} running (min {}, max {})",
        info.current, info.minimum, info.maximum
    );

    // A synchronous call queues behind the spawned items on its worker.
    let answer = q.sync(|| 6 * 7).expect("sync");
    println!("\nsync(6 * 7) = {}", answer);

    q.terminate(TerminateFlags::AWAIT_ALL).expect("terminate");
    println!(
        "terminated; {} of 10 items completed",
        completed.load(Ordering::SeqCst)
    );
}

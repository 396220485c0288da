// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Standalone dispatch throughput benchmark.
//! Times serial fan-in, coroutine fan-out through a group, and an idle heartbeat.

use dispatchq::{
    DispatchConfig, DispatchContext, DispatchGroup, Scheduler, TaskRef, reusable_idle,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .try_init();

    let config = DispatchConfig::from_env();
    config.validate()?;

    println!("dispatchq Standalone Benchmark");
    println!("==============================");
    println!(
        "pool: {} core threads, {} in flight",
        config.pool_core_threads,
        config.pool_capacity()
    );

    let scheduler = Scheduler::new(config);
    let iterations = 100_000;

    // Serial fan-in: every task lands on one worker thread
    let serial = scheduler.serial_queue("bench-serial");
    let counter = Arc::new(AtomicUsize::new(0));
    let start_time = Instant::now();
    for _ in 0..iterations {
        let counter = counter.clone();
        serial.submit(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })?;
    }
    serial.sync(Duration::ZERO, None, |_| {})?;
    let serial_time = start_time.elapsed();
    if counter.load(Ordering::Relaxed) != iterations {
        return Err(format!(
            "Serial queue ran {} of {iterations} tasks",
            counter.load(Ordering::Relaxed)
        )
        .into());
    }
    println!("Serial: {iterations} tasks in {serial_time:?}");
    println!("Average per task: {:?}", serial_time / iterations as u32);

    // Coroutine fan-out, joined through a group
    let fan_out = 10_000;
    let coroutine = scheduler.coroutine_queue("bench-coroutine");
    let group = DispatchGroup::with_scheduler(&scheduler, false);
    let done = Arc::new(AtomicUsize::new(0));
    let start_time = Instant::now();
    for _ in 0..fan_out {
        let done = done.clone();
        group.dispatch_fn(&coroutine, move |_| {
            done.fetch_add(1, Ordering::Relaxed);
        })?;
    }
    let (tx, rx) = mpsc::channel();
    group.notify_fn(scheduler.standard(), move |_| {
        let _ = tx.send(Instant::now());
    })?;
    let finished = rx.recv()?;
    let fan_out_time = finished.duration_since(start_time);
    println!(
        "Coroutine group: {} of {fan_out} tasks in {fan_out_time:?}",
        done.load(Ordering::Relaxed)
    );

    // Idle heartbeat on an otherwise quiet queue
    let heartbeat = scheduler.serial_queue("bench-heartbeat");
    let beats = Arc::new(AtomicUsize::new(0));
    let counted = beats.clone();
    let task: TaskRef = reusable_idle(move |_: &DispatchContext| {
        counted.fetch_add(1, Ordering::Relaxed);
    });
    heartbeat.add_idle(Duration::from_millis(10), task)?;
    thread::sleep(Duration::from_millis(500));
    heartbeat.shutdown_await(true);
    println!(
        "Idle heartbeat: {} beats in 500ms at 10ms",
        beats.load(Ordering::Relaxed)
    );

    serial.shutdown_await(true);
    coroutine.shutdown_await(true);
    scheduler.shutdown(true);

    println!("Benchmark completed!");
    Ok(())
}

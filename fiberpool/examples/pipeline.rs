//! Demo driver in the shape of a streaming benchmark: one worker thread per
//! core, one job per data block, a throttled producer keeping the pipeline
//! topped up, and a blocking wait from the main thread.
//!
//! Run with `cargo run --release --example pipeline`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

use fiberpool::{Config, Group, JobContext, JobDesc, Scheduler};

const BLOCK_COUNT: usize = 1 << 10;
const BLOCK_SIZE: usize = 1 << 16;

struct BlockCtx {
    data: *const u8,
    len: usize,
    checksum: AtomicU64,
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn checksum_block(_job: &mut JobContext, user_data: *mut ()) {
    let ctx = unsafe { &*(user_data as *const BlockCtx) };
    let block = unsafe { std::slice::from_raw_parts(ctx.data, ctx.len) };
    ctx.checksum.store(fnv1a(block), Ordering::Relaxed);
}

struct ProducerCtx<'a> {
    descs: &'a [JobDesc],
    group: Group,
    window: usize,
    low_water: u32,
}

/// Feed the block jobs through a bounded window so no more than `window`
/// of them are ever in flight.
fn producer(job: &mut JobContext, user_data: *mut ()) {
    let ctx = unsafe { &*(user_data as *const ProducerCtx) };

    let mut cursor = 0;
    while cursor < ctx.descs.len() {
        cursor += unsafe {
            job.scheduler()
                .enqueue_throttled(&ctx.descs[cursor..], &ctx.group, ctx.window)
        };
        job.wait(&ctx.group, ctx.low_water);
    }
    job.wait(&ctx.group, 0);
}

fn main() {
    env_logger::init();

    // Deterministic filler standing in for file blocks.
    let mut state = 0x9e37_79b9_7f4a_7c15u64;
    let blocks: Vec<Vec<u8>> = (0..BLOCK_COUNT)
        .map(|_| {
            (0..BLOCK_SIZE)
                .map(|_| {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    state as u8
                })
                .collect()
        })
        .collect();
    let expected: Vec<u64> = blocks.iter().map(|b| fnv1a(b)).collect();

    let worker_count = thread::available_parallelism().map(Into::into).unwrap_or(4);
    let sched = Scheduler::new(Config::default()).expect("scheduler construction failed");

    let block_ctxs: Vec<BlockCtx> = blocks
        .iter()
        .map(|block| BlockCtx {
            data: block.as_ptr(),
            len: block.len(),
            checksum: AtomicU64::new(0),
        })
        .collect();
    let descs: Vec<JobDesc> = block_ctxs
        .iter()
        .map(|ctx| {
            JobDesc::new(checksum_block)
                .name("checksum_block")
                .user_data(ctx as *const BlockCtx as *mut ())
        })
        .collect();
    let producer_ctx = ProducerCtx {
        descs: &descs,
        group: Group::new(),
        window: 2 * worker_count,
        low_water: worker_count as u32,
    };

    println!("starting {worker_count} worker threads for {BLOCK_COUNT} blocks");
    let started = Instant::now();
    let outer = Group::new();

    let exited = AtomicUsize::new(0);
    thread::scope(|scope| {
        for thread_id in 0..worker_count {
            let (sched, exited) = (&sched, &exited);
            scope.spawn(move || {
                sched.run(0, false, thread_id);
                exited.fetch_add(1, Ordering::Release);
            });
        }

        let desc = JobDesc::new(producer)
            .name("producer")
            .user_data(&producer_ctx as *const ProducerCtx as *mut ());
        unsafe { sched.enqueue(desc, Some(&outer)) };
        sched.wait_blocking(&outer, 0);

        // A worker entering `run` after a pause clears the flag again, so
        // keep pausing until everyone has checked out.
        while exited.load(Ordering::Acquire) < worker_count {
            sched.pause();
            thread::yield_now();
        }
    });

    let elapsed = started.elapsed();
    for (ctx, expected) in block_ctxs.iter().zip(&expected) {
        assert_eq!(ctx.checksum.load(Ordering::Relaxed), *expected);
    }
    let megabytes = (BLOCK_COUNT * BLOCK_SIZE) as f64 / (1024.0 * 1024.0);
    println!(
        "checksummed {megabytes:.0} MiB in {elapsed:?} ({:.0} MiB/s)",
        megabytes / elapsed.as_secs_f64(),
    );
}

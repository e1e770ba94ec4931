//! End to end scenarios with real worker threads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use fiberpool::{Config, Group, JobContext, JobDesc, Scheduler};
use pretty_assertions::assert_eq;

fn spawn_workers<'scope>(
    scope: &'scope thread::Scope<'scope, '_>,
    sched: &'scope Scheduler,
    queue: usize,
    count: usize,
    exited: &'scope AtomicUsize,
) {
    for thread_id in 0..count {
        scope.spawn(move || {
            sched.run(queue, false, thread_id);
            exited.fetch_add(1, Ordering::Release);
        });
    }
}

/// Pause the scheduler until every worker has left `run`. A worker that
/// enters `run` after a pause clears the flag again, so keep pausing until
/// all of them have checked out.
fn shutdown(sched: &Scheduler, exited: &AtomicUsize, workers: usize) {
    while exited.load(Ordering::Acquire) < workers {
        sched.pause();
        thread::yield_now();
    }
}

fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

fn bump(_job: &mut JobContext, user_data: *mut ()) {
    let counter = unsafe { &*(user_data as *const AtomicUsize) };
    counter.fetch_add(1, Ordering::Relaxed);
}

// Scenario: fork/join. 1000 independent jobs on 4 workers, awaited from the
// main thread; every slot must be incremented exactly once.
#[test]
fn fork_join_touches_every_slot_once() {
    let sched = Scheduler::new(Config {
        job_count: 1024,
        queue_count: 1,
        fiber_count: 32,
        stack_size: 64 * 1024,
    })
    .unwrap();
    let slots: Vec<AtomicUsize> = (0..1000).map(|_| AtomicUsize::new(0)).collect();
    let group = Group::new();
    let exited = AtomicUsize::new(0);

    thread::scope(|scope| {
        spawn_workers(scope, &sched, 0, 4, &exited);

        let descs: Vec<JobDesc> = slots
            .iter()
            .map(|slot| JobDesc::new(bump).user_data(slot as *const AtomicUsize as *mut ()))
            .collect();
        unsafe { sched.enqueue_batch(&descs, Some(&group)) };
        sched.wait_blocking(&group, 0);
        shutdown(&sched, &exited, 4);
    });

    let counts: Vec<usize> = slots.iter().map(|s| s.load(Ordering::Relaxed)).collect();
    assert_eq!(counts, vec![1; 1000]);
}

struct ProducerCtx {
    group: Group,
    counter: AtomicUsize,
    total: usize,
    max: usize,
    low_water: u32,
}

fn producer(job: &mut JobContext, user_data: *mut ()) {
    let ctx = unsafe { &*(user_data as *const ProducerCtx) };
    let descs: Vec<JobDesc> = (0..ctx.total)
        .map(|_| JobDesc::new(bump).user_data(&ctx.counter as *const AtomicUsize as *mut ()))
        .collect();

    let mut cursor = 0;
    while cursor < ctx.total {
        cursor += unsafe {
            job.scheduler()
                .enqueue_throttled(&descs[cursor..], &ctx.group, ctx.max)
        };
        // Let the pipeline drain to the low-water mark before refilling.
        job.wait(&ctx.group, ctx.low_water);
    }
    job.wait(&ctx.group, 0);
}

// Scenario: throttled producer. One producer feeds 10000 unit jobs through
// a 64-entry window; the group never tracks more than 64 jobs and all of
// them complete.
#[test]
fn throttled_producer_bounds_outstanding_work() {
    let sched = Scheduler::new(Config {
        job_count: 256,
        queue_count: 1,
        fiber_count: 16,
        stack_size: 64 * 1024,
    })
    .unwrap();
    let ctx = ProducerCtx {
        group: Group::new(),
        counter: AtomicUsize::new(0),
        total: 10_000,
        max: 64,
        low_water: 48,
    };
    let outer = Group::new();
    let exited = AtomicUsize::new(0);
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        spawn_workers(scope, &sched, 0, 4, &exited);

        // Sample the window from outside while the producer runs.
        let sampler = {
            let (sched, ctx, done) = (&sched, &ctx, &done);
            scope.spawn(move || {
                let mut peak = 0;
                while !done.load(Ordering::Acquire) {
                    peak = peak.max(sched.outstanding(&ctx.group));
                    thread::sleep(Duration::from_millis(1));
                }
                peak
            })
        };

        let desc = JobDesc::new(producer)
            .name("producer")
            .user_data(&ctx as *const ProducerCtx as *mut ());
        unsafe { sched.enqueue(desc, Some(&outer)) };
        sched.wait_blocking(&outer, 0);
        done.store(true, Ordering::Release);

        let peak = sampler.join().unwrap();
        assert!(peak <= 64, "window overflowed: {peak} outstanding");
        shutdown(&sched, &exited, 4);
    });

    assert_eq!(ctx.counter.load(Ordering::Relaxed), 10_000);
}

struct ChainCtx {
    high_done: AtomicBool,
    low_before_high: AtomicUsize,
    low_done: AtomicUsize,
}

fn slow_high(_job: &mut JobContext, user_data: *mut ()) {
    let ctx = unsafe { &*(user_data as *const ChainCtx) };
    thread::sleep(Duration::from_millis(100));
    ctx.high_done.store(true, Ordering::Release);
}

fn low(_job: &mut JobContext, user_data: *mut ()) {
    let ctx = unsafe { &*(user_data as *const ChainCtx) };
    if !ctx.high_done.load(Ordering::Acquire) {
        ctx.low_before_high.fetch_add(1, Ordering::Relaxed);
    }
    ctx.low_done.fetch_add(1, Ordering::Relaxed);
}

// Scenario: priority chain. Workers pinned to the high queue drain the low
// queue through the fallback link, and do so while one of them is stuck on
// a slow high-priority job.
#[test]
fn fallback_queue_drains_in_parallel() {
    let sched = Scheduler::new(Config {
        job_count: 2048,
        queue_count: 2,
        fiber_count: 8,
        stack_size: 64 * 1024,
    })
    .unwrap();
    sched.queue_priority(0, 1);
    let ctx = ChainCtx {
        high_done: AtomicBool::new(false),
        low_before_high: AtomicUsize::new(0),
        low_done: AtomicUsize::new(0),
    };
    let group = Group::new();
    let exited = AtomicUsize::new(0);

    thread::scope(|scope| {
        spawn_workers(scope, &sched, 0, 4, &exited);

        let user_data = &ctx as *const ChainCtx as *mut ();
        unsafe {
            sched.enqueue(JobDesc::new(slow_high).user_data(user_data), Some(&group));
            let lows = vec![JobDesc::new(low).user_data(user_data).queue(1); 1000];
            sched.enqueue_batch(&lows, Some(&group));
        }
        sched.wait_blocking(&group, 0);
        shutdown(&sched, &exited, 4);
    });

    assert_eq!(ctx.low_done.load(Ordering::Relaxed), 1000);
    // The three idle workers must not have waited for the high job.
    assert!(ctx.low_before_high.load(Ordering::Relaxed) > 0);
}

// New work in a fallback queue must wake a worker sleeping on its primary.
#[test]
fn enqueue_to_fallback_wakes_primary_sleeper() {
    let sched = Scheduler::new(Config {
        job_count: 64,
        queue_count: 2,
        fiber_count: 4,
        stack_size: 64 * 1024,
    })
    .unwrap();
    sched.queue_priority(0, 1);
    let hits = AtomicUsize::new(0);
    let exited = AtomicUsize::new(0);

    thread::scope(|scope| {
        spawn_workers(scope, &sched, 0, 1, &exited);
        // Give the worker time to go to sleep on queue 0.
        thread::sleep(Duration::from_millis(20));

        let desc = JobDesc::new(bump)
            .user_data(&hits as *const AtomicUsize as *mut ())
            .queue(1);
        unsafe { sched.enqueue(desc, None) };

        assert!(
            wait_until(Duration::from_secs(2), || hits.load(Ordering::Relaxed) == 1),
            "sleeping worker never picked up the fallback job",
        );
        shutdown(&sched, &exited, 1);
    });
}

fn abort_midway(job: &mut JobContext, _user_data: *mut ()) {
    let scratch = [0u8; 256];
    std::hint::black_box(&scratch);
    job.abort();
}

// Scenario: abort. Aborting jobs under live workers recycles records and
// fibers; many times the pool capacity passes through without exhaustion.
#[test]
fn abort_recycles_under_load() {
    let sched = Scheduler::new(Config {
        job_count: 64,
        queue_count: 1,
        fiber_count: 8,
        stack_size: 64 * 1024,
    })
    .unwrap();
    let exited = AtomicUsize::new(0);

    thread::scope(|scope| {
        spawn_workers(scope, &sched, 0, 2, &exited);

        for _ in 0..20 {
            let group = Group::new();
            let descs = [JobDesc::new(abort_midway); 32];
            unsafe { sched.enqueue_batch(&descs, Some(&group)) };
            sched.wait_blocking(&group, 0);
        }
        shutdown(&sched, &exited, 2);
    });
}

struct YieldCtx {
    finished: AtomicUsize,
}

fn yield_then_finish(job: &mut JobContext, user_data: *mut ()) {
    let ctx = unsafe { &*(user_data as *const YieldCtx) };
    for _ in 0..5 {
        job.yield_now();
    }
    // The observable effect lands exactly once, no matter how many times
    // the job bounced between workers.
    ctx.finished.fetch_add(1, Ordering::Relaxed);
}

// Scenario: yielding jobs park at the back of their queue and resume; their
// effects still happen exactly once.
#[test]
fn yielding_jobs_complete_exactly_once() {
    let sched = Scheduler::new(Config {
        job_count: 256,
        queue_count: 1,
        // A yielding job keeps its fiber, and FIFO order starts all 100
        // jobs before the first one completes, so the pool must cover the
        // whole batch.
        fiber_count: 128,
        stack_size: 64 * 1024,
    })
    .unwrap();
    let ctx = YieldCtx {
        finished: AtomicUsize::new(0),
    };
    let group = Group::new();
    let exited = AtomicUsize::new(0);

    thread::scope(|scope| {
        spawn_workers(scope, &sched, 0, 4, &exited);

        let descs =
            vec![JobDesc::new(yield_then_finish).user_data(&ctx as *const YieldCtx as *mut ()); 100];
        unsafe { sched.enqueue_batch(&descs, Some(&group)) };
        sched.wait_blocking(&group, 0);
        shutdown(&sched, &exited, 4);
    });

    assert_eq!(ctx.finished.load(Ordering::Relaxed), 100);
}

// Scenario: pause. Workers stop at the next job boundary; a later `run`
// resumes and finishes both the leftovers and fresh work.
#[test]
fn pause_stops_workers_and_fresh_runs_resume() {
    let sched = Scheduler::new(Config {
        job_count: 1024,
        queue_count: 1,
        fiber_count: 8,
        stack_size: 64 * 1024,
    })
    .unwrap();
    let first = AtomicUsize::new(0);
    let second = AtomicUsize::new(0);

    let exited = AtomicUsize::new(0);
    thread::scope(|scope| {
        spawn_workers(scope, &sched, 0, 2, &exited);
        let descs = vec![JobDesc::new(bump).user_data(&first as *const AtomicUsize as *mut ()); 500];
        unsafe { sched.enqueue_batch(&descs, None) };
        shutdown(&sched, &exited, 2);
    });
    assert!(first.load(Ordering::Relaxed) <= 500);

    let exited = AtomicUsize::new(0);
    thread::scope(|scope| {
        spawn_workers(scope, &sched, 0, 2, &exited);
        let group = Group::new();
        let descs =
            vec![JobDesc::new(bump).user_data(&second as *const AtomicUsize as *mut ()); 100];
        unsafe { sched.enqueue_batch(&descs, Some(&group)) };
        sched.wait_blocking(&group, 0);
        shutdown(&sched, &exited, 2);
    });

    // FIFO: the leftovers of the first batch were popped before the second
    // batch; the last of them may still be mid-body when the group wait
    // returns, so give it a moment.
    assert!(wait_until(Duration::from_secs(2), || {
        first.load(Ordering::Relaxed) == 500
    }));
    assert_eq!(second.load(Ordering::Relaxed), 100);
}

struct FanCtx {
    counter: AtomicUsize,
}

fn fan_parent(job: &mut JobContext, user_data: *mut ()) {
    let ctx = unsafe { &*(user_data as *const FanCtx) };
    let leaf = JobDesc::new(bump).user_data(&ctx.counter as *const AtomicUsize as *mut ());
    unsafe { job.join(&[leaf; 10]) };
    ctx.counter.fetch_add(1, Ordering::Relaxed);
}

// Fork/join from inside jobs: parents spawn leaves and resume only after
// their whole batch completed.
#[test]
fn join_from_inside_jobs() {
    let sched = Scheduler::new(Config {
        job_count: 512,
        queue_count: 1,
        // Every parked parent keeps its fiber, so the pool must cover all
        // of them plus the running leaves.
        fiber_count: 64,
        stack_size: 64 * 1024,
    })
    .unwrap();
    let ctx = FanCtx {
        counter: AtomicUsize::new(0),
    };
    let outer = Group::new();
    let exited = AtomicUsize::new(0);

    thread::scope(|scope| {
        spawn_workers(scope, &sched, 0, 4, &exited);

        let parents =
            vec![JobDesc::new(fan_parent).user_data(&ctx as *const FanCtx as *mut ()); 16];
        unsafe { sched.enqueue_batch(&parents, Some(&outer)) };
        sched.wait_blocking(&outer, 0);
        shutdown(&sched, &exited, 4);
    });

    assert_eq!(ctx.counter.load(Ordering::Relaxed), 16 * 10 + 16);
}

// Flush mode lets a non-worker thread drain a queue synchronously.
#[test]
fn flush_drains_synchronously() {
    let sched = Scheduler::new(Config::default()).unwrap();
    let hits = AtomicUsize::new(0);

    let descs = vec![JobDesc::new(bump).user_data(&hits as *const AtomicUsize as *mut ()); 10];
    unsafe { sched.enqueue_batch(&descs, None) };
    sched.run(0, true, 0);

    assert_eq!(hits.load(Ordering::Relaxed), 10);
}

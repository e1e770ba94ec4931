//! The scheduler: queues, pools, the worker loop and the suspension API.
//!
//! See the crate docs for the overall model. Everything here revolves around
//! one global mutex protecting the [`Shared`] state: every queue, pool and
//! group transition happens under it, and it is released only around user
//! job code and condvar sleeps. Because a job suspends by *switching
//! stacks*, the lock is deliberately held across every fiber switch — the
//! side that receives control releases it (or hands it back to the worker
//! loop, which re-materializes its guard). This is also why the mutex is a
//! [`parking_lot`] one: a switch never leaves the OS thread, but the guard
//! object cannot follow it across stacks, so the protocol needs
//! `mem::forget`-ing guards and `force_unlock`/`make_guard_unchecked` on the
//! far side.

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::ptr::{self, NonNull};
use std::slice;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::fiber::{Fiber, StackRegion};
use crate::group::Group;
use crate::queue::{self, JobId, Queue};

////////////////////////////////////////////////////////////////////////////////
// Config
////////////////////////////////////////////////////////////////////////////////

/// Capacities of a [`Scheduler`]. Everything is allocated up front at
/// construction; nothing grows or shrinks afterwards.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Size of the job pool, and the capacity of every queue. Must be a
    /// power of two.
    pub job_count: usize,
    /// Number of queues, at most 256 (job descriptors address them with an
    /// 8 bit index).
    pub queue_count: usize,
    /// Size of the fiber pool. This bounds how many jobs can be in flight
    /// (executing or suspended) at once.
    pub fiber_count: usize,
    /// Stack size of each fiber in bytes. Must be a power of two. Overflow
    /// is undefined and not detected.
    pub stack_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            job_count: 1024,
            queue_count: 1,
            fiber_count: 32,
            stack_size: 64 * 1024,
        }
    }
}

impl Config {
    /// Total number of bytes a scheduler with this configuration will
    /// allocate: the job arena, the fiber arena and its stacks, and one
    /// ring per queue. Useful for capacity budgeting.
    pub fn footprint(&self) -> usize {
        self.queue_count * self.job_count * mem::size_of::<JobId>()
            + self.job_count * mem::size_of::<Job>()
            + self.fiber_count * mem::size_of::<Fiber>()
            + self.fiber_count * self.stack_size
    }

    fn validate(&self) -> Result<()> {
        if !self.job_count.is_power_of_two() {
            return Err(Error::JobCountNotPowerOfTwo(self.job_count));
        }
        if !self.stack_size.is_power_of_two() {
            return Err(Error::StackSizeNotPowerOfTwo(self.stack_size));
        }
        if self.queue_count == 0 {
            return Err(Error::NoQueues);
        }
        if self.queue_count > 256 {
            return Err(Error::TooManyQueues(self.queue_count));
        }
        if self.fiber_count == 0 {
            return Err(Error::NoFibers);
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Job descriptions & records
////////////////////////////////////////////////////////////////////////////////

/// A job body. Receives a handle for the suspension calls and the opaque
/// user pointer from the [`JobDesc`]. Anything read through the handle —
/// most notably [`JobContext::thread_id`] — must be re-read after a
/// suspension, since the job may resume on a different worker.
pub type JobFn = fn(job: &mut JobContext, user_data: *mut ());

/// Description of a job to enqueue.
#[derive(Clone, Copy, Debug)]
pub struct JobDesc {
    /// Job name, for logging only.
    pub name: Option<&'static str>,
    /// Job body function.
    pub func: JobFn,
    /// Opaque pointer passed to the body.
    pub user_data: *mut (),
    /// Index of the queue to run the job on.
    pub queue: u8,
}

impl JobDesc {
    /// A nameless descriptor for `func` with a null user pointer, targeting
    /// queue 0. Chain the other methods to fill in the rest.
    pub fn new(func: JobFn) -> Self {
        JobDesc {
            name: None,
            func,
            user_data: ptr::null_mut(),
            queue: 0,
        }
    }

    pub fn name(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    pub fn user_data(mut self, user_data: *mut ()) -> Self {
        self.user_data = user_data;
        self
    }

    pub fn queue(mut self, queue: u8) -> Self {
        self.queue = queue;
        self
    }
}

/// Pool-allocated job record. Lives in the scheduler's arena; its identity
/// (index) is reused across enqueue-to-completion cycles and its contents
/// are rewritten by [`Job::prepare`] at every enqueue.
///
/// All fields are `Cell`s on purpose: records are reached both under the
/// scheduler lock (transitions) and from the job's own fiber with the lock
/// released (`thread_id`, the body arguments), and handing out nothing but
/// shared references keeps those paths from ever forming aliasing `&mut`.
/// The arena's `Sync` impl documents the access discipline.
struct Job {
    id: JobId,
    sched: Cell<*const Scheduler>,
    name: Cell<Option<&'static str>>,
    func: Cell<Option<JobFn>>,
    user_data: Cell<*mut ()>,
    queue: Cell<u8>,
    fiber: Cell<Option<usize>>,
    thread_id: Cell<usize>,
    group: Cell<Option<NonNull<Group>>>,
}

impl Job {
    fn vacant(id: JobId) -> Self {
        Job {
            id,
            sched: Cell::new(ptr::null()),
            name: Cell::new(None),
            func: Cell::new(None),
            user_data: Cell::new(ptr::null_mut()),
            queue: Cell::new(0),
            fiber: Cell::new(None),
            thread_id: Cell::new(0),
            group: Cell::new(None),
        }
    }

    fn prepare(&self, desc: &JobDesc, sched: &Scheduler, group: Option<&Group>) {
        self.sched.set(sched);
        self.name.set(desc.name);
        self.func.set(Some(desc.func));
        self.user_data.set(desc.user_data);
        self.queue.set(desc.queue);
        self.fiber.set(None);
        self.thread_id.set(0);
        self.group.set(group.map(NonNull::from));
    }
}

struct JobArena {
    slots: Box<[Job]>,
}

impl JobArena {
    fn job(&self, id: JobId) -> &Job {
        &self.slots[id]
    }
}

// SAFETY: a record's cells are only touched while the scheduler lock is
// held, or by the single worker/fiber the record is checked out to; the two
// never overlap because check-in and check-out are themselves transitions
// under the lock.
unsafe impl Send for JobArena {}
unsafe impl Sync for JobArena {}

struct FiberArena {
    slots: Box<[UnsafeCell<Fiber>]>,
}

impl FiberArena {
    /// # Safety
    ///
    /// The caller must have the fiber checked out (or be constructing the
    /// scheduler); fibers are not access-checked beyond that discipline.
    unsafe fn get(&self, id: usize) -> *mut Fiber {
        self.slots[id].get()
    }
}

// SAFETY: same checkout discipline as `JobArena`.
unsafe impl Send for FiberArena {}
unsafe impl Sync for FiberArena {}

/// Status word a fiber reports when switching back to the worker loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Complete,
    Waiting,
    Yielding,
    Aborted,
}

impl Status {
    fn word(self) -> usize {
        self as usize
    }

    fn from_word(word: usize) -> Status {
        match word {
            0 => Status::Complete,
            1 => Status::Waiting,
            2 => Status::Yielding,
            3 => Status::Aborted,
            other => unreachable!("invalid job status word: {other}"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Scheduler
////////////////////////////////////////////////////////////////////////////////

/// State behind the global lock.
struct Shared {
    pause: bool,
    queues: Box<[Queue]>,
    /// Free pools are stacks so recently used records stay warm in cache.
    job_free: Vec<JobId>,
    fiber_free: Vec<usize>,
}

/// A fiber based cooperative job scheduler.
///
/// Client code submits short functions ("jobs") into one of several queues;
/// a pool of worker threads, each running [`run`] pinned to a queue index,
/// dequeues and executes them. Each job runs on its own fiber, so it may
/// suspend mid-execution — waiting on a [`Group`], yielding, hopping to
/// another queue — and resume later on any worker.
///
/// Dropping a scheduler silently discards any unfinished jobs. Drain the
/// queues first ([`run`] in flush mode) or [`pause`] the workers if you need
/// a graceful shutdown; dropping while workers are still inside [`run`] is a
/// precondition violation.
///
/// # Example
///
/// ```no_run
/// use fiberpool::{Config, Group, JobDesc, Scheduler};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// fn body(_job: &mut fiberpool::JobContext, user_data: *mut ()) {
///     let hits = unsafe { &*(user_data as *const AtomicUsize) };
///     hits.fetch_add(1, Ordering::Relaxed);
/// }
///
/// let sched = Scheduler::new(Config::default()).unwrap();
/// let hits = AtomicUsize::new(0);
/// let group = Group::new();
///
/// std::thread::scope(|scope| {
///     for thread_id in 0..4 {
///         let sched = &sched;
///         scope.spawn(move || sched.run(0, false, thread_id));
///     }
///     let desc = JobDesc::new(body).user_data(&hits as *const _ as *mut ());
///     unsafe { sched.enqueue_batch(&[desc; 100], Some(&group)) };
///     sched.wait_blocking(&group, 0);
///     sched.pause();
/// });
/// assert_eq!(hits.load(Ordering::Relaxed), 100);
/// ```
///
/// [`run`]: Scheduler::run
/// [`pause`]: Scheduler::pause
pub struct Scheduler {
    shared: Mutex<Shared>,
    /// One condvar per queue, alongside (not inside) the locked state.
    signals: Box<[Condvar]>,
    jobs: JobArena,
    fibers: FiberArena,
    /// Keeps the fiber stacks mapped for the scheduler's lifetime.
    _stacks: StackRegion,
}

impl Scheduler {
    /// Allocate a scheduler. All memory — job arena, fiber arena, stacks,
    /// queue rings — is acquired here; see [`Config::footprint`] for how
    /// much that is.
    pub fn new(config: Config) -> Result<Scheduler> {
        config.validate()?;
        let stack_bytes = config
            .fiber_count
            .checked_mul(config.stack_size)
            .expect("fiber stack region size overflows usize");
        let stacks = StackRegion::new(stack_bytes)?;

        let fibers: Box<[UnsafeCell<Fiber>]> = (0..config.fiber_count)
            .map(|i| {
                UnsafeCell::new(Fiber::new(
                    stacks.stack_base(i, config.stack_size),
                    config.stack_size,
                    fiber_main,
                ))
            })
            .collect();
        // A fresh context embeds its fiber's address, so the contexts can
        // only be built once the arena slots stop moving.
        for slot in fibers.iter() {
            unsafe { (*slot.get()).reset() };
        }

        log::debug!(
            "scheduler: {} jobs, {} queue(s), {} fibers x {} byte stacks, {} bytes total",
            config.job_count,
            config.queue_count,
            config.fiber_count,
            config.stack_size,
            config.footprint(),
        );

        Ok(Scheduler {
            shared: Mutex::new(Shared {
                pause: false,
                queues: (0..config.queue_count)
                    .map(|_| Queue::with_capacity(config.job_count))
                    .collect(),
                job_free: (0..config.job_count).collect(),
                fiber_free: (0..config.fiber_count).collect(),
            }),
            signals: (0..config.queue_count).map(|_| Condvar::new()).collect(),
            jobs: JobArena {
                slots: (0..config.job_count).map(Job::vacant).collect(),
            },
            fibers: FiberArena { slots: fibers },
            _stacks: stacks,
        })
    }

    /// Link `fallback` as the consumption fallback of `primary`: a worker
    /// running on `primary` drains `fallback` when `primary` is empty.
    /// Producers are unaffected; they enqueue to whichever queue they name.
    /// Each queue takes at most one predecessor and one successor, so
    /// chains are linear.
    pub fn queue_priority(&self, primary: usize, fallback: usize) {
        let mut shared = self.shared.lock();
        let queue_count = shared.queues.len();
        assert!(
            primary < queue_count && fallback < queue_count,
            "queue index out of range",
        );
        queue::link(&mut shared.queues, primary, fallback);
        log::debug!("queue {primary} falls back to queue {fallback}");
    }

    /// Execute jobs continuously on the calling thread.
    ///
    /// Only returns after [`pause`], or, with `flush` set, once the queue
    /// (and its fallback chain) is empty — flush mode ignores the pause
    /// flag and is the way for a non-worker thread to drain a queue
    /// synchronously.
    ///
    /// `thread_id` is an arbitrary caller-chosen id handed to every job
    /// that runs here (for thread local pooling and the like); the
    /// scheduler does not interpret it.
    ///
    /// [`pause`]: Scheduler::pause
    pub fn run(&self, queue: usize, flush: bool, thread_id: usize) {
        let mut shared = self.shared.lock();
        assert!(queue < shared.queues.len(), "queue index out of range");
        shared.pause = false;
        log::trace!("worker {thread_id} entering queue {queue} (flush: {flush})");

        while flush || !shared.pause {
            if let Some(id) = queue::pop_chain(&mut shared.queues, queue) {
                let job = self.jobs.job(id);
                // Jobs that are resuming already own a fiber.
                let fid = match job.fiber.get() {
                    Some(fid) => fid,
                    None => {
                        let fid = shared.fiber_free.pop().expect("fiber pool exhausted");
                        job.fiber.set(Some(fid));
                        fid
                    }
                };
                job.thread_id.set(thread_id);

                // SAFETY: the fiber was just checked out for this job.
                let fiber = unsafe { self.fibers.get(fid) };
                // The guard cannot travel onto the fiber's stack, so it is
                // forgotten here with the mutex still locked; the fiber
                // releases it around the job body and locks again before
                // switching back.
                mem::forget(shared);
                let status = unsafe { Fiber::resume(fiber, job as *const Job as usize) };
                shared = unsafe { self.relock() };

                match Status::from_word(status) {
                    Status::Aborted => {
                        // The stack was not unwound; back to fresh entry.
                        // SAFETY: the fiber is suspended and its arena slot
                        // never moves.
                        unsafe { (*fiber).reset() };
                        self.retire(&mut shared, id, fid);
                    }
                    Status::Complete => self.retire(&mut shared, id, fid),
                    Status::Yielding => {
                        // Back of the (possibly rewritten) queue; the fiber
                        // stays attached to the job.
                        let target = job.queue.get() as usize;
                        shared.queues[target].push_back(id);
                        self.signal_from(&mut shared, target);
                    }
                    Status::Waiting => {
                        // Parked in its group until the count drains.
                    }
                }
            } else if flush {
                break;
            } else {
                shared.queues[queue].waiters += 1;
                self.signals[queue].wait(&mut shared);
            }
        }
        log::trace!("worker {thread_id} leaving queue {queue}");
    }

    /// Stop all workers at their next job boundary (running jobs finish
    /// first) and wake every sleeper. Workers re-enter via [`run`], which
    /// clears the flag.
    ///
    /// [`run`]: Scheduler::run
    pub fn pause(&self) {
        let mut shared = self.shared.lock();
        shared.pause = true;
        for (i, queue) in shared.queues.iter_mut().enumerate() {
            self.signals[i].notify_all();
            queue.waiters = 0;
        }
        log::debug!("pause requested");
    }

    /// Add jobs to the scheduler, all under one lock acquisition and in
    /// list order, optionally attributing them to `group`.
    ///
    /// # Safety
    ///
    /// Every descriptor's `user_data` must stay valid until its job
    /// completes, and `group`, if given, must stay valid and pinned until
    /// all jobs attributed to it have completed and any wait on it has
    /// returned.
    pub unsafe fn enqueue_batch(&self, list: &[JobDesc], group: Option<&Group>) {
        let mut shared = self.shared.lock();
        unsafe { self.enqueue_batch_locked(&mut shared, list, group) };
    }

    /// Convenience wrapper for a single job.
    ///
    /// # Safety
    ///
    /// Same contract as [`enqueue_batch`](Scheduler::enqueue_batch).
    pub unsafe fn enqueue(&self, desc: JobDesc, group: Option<&Group>) {
        unsafe { self.enqueue_batch(slice::from_ref(&desc), group) };
    }

    /// Add jobs like [`enqueue_batch`], but never let `group` track more
    /// than `max` jobs; the prefix of `list` that fits is enqueued and its
    /// length returned. This is the one flow control mechanism: producers
    /// use it (typically with a threshold [`wait`]) to keep a pipeline full
    /// without overflowing it.
    ///
    /// # Safety
    ///
    /// Same contract as [`enqueue_batch`](Scheduler::enqueue_batch).
    ///
    /// [`enqueue_batch`]: Scheduler::enqueue_batch
    /// [`wait`]: JobContext::wait
    pub unsafe fn enqueue_throttled(&self, list: &[JobDesc], group: &Group, max: usize) -> usize {
        let mut shared = self.shared.lock();
        group.assert_valid();
        let tracked = group.count.get() as usize;
        if tracked >= max {
            return 0;
        }
        let accepted = list.len().min(max - tracked);
        unsafe { self.enqueue_batch_locked(&mut shared, &list[..accepted], Some(group)) };
        accepted
    }

    /// Number of outstanding jobs attributed to `group`, observed under the
    /// scheduler lock. Exact while no waiter is parked on the group (a
    /// parked waiter temporarily hides its threshold from the counter).
    pub fn outstanding(&self, group: &Group) -> u32 {
        let _shared = self.shared.lock();
        group.assert_valid();
        group.count.get().saturating_sub(1)
    }

    /// Block the calling thread until at most `threshold` jobs of `group`
    /// remain outstanding.
    ///
    /// This is [`JobContext::wait`] for non-worker threads, which have no
    /// fiber to suspend: a tiny helper job is enqueued on queue 0 to do the
    /// waiting, and it signals this thread when the threshold is reached.
    /// Some worker must therefore be servicing queue 0 (or a queue that
    /// falls back to it). Never call this from inside a job — it would put
    /// a worker to sleep and likely deadlock the pool.
    pub fn wait_blocking(&self, group: &Group, threshold: u32) {
        struct WakeupCtx {
            group: *const Group,
            threshold: u32,
            done: Cell<bool>,
            wakeup: Condvar,
        }

        fn wakeup_body(job: &mut JobContext, user_data: *mut ()) {
            let ctx = unsafe { &*(user_data as *const WakeupCtx) };
            job.wait(unsafe { &*ctx.group }, ctx.threshold);

            let sched = job.scheduler();
            let shared = sched.shared.lock();
            ctx.done.set(true);
            ctx.wakeup.notify_one();
            drop(shared);
        }

        let ctx = WakeupCtx {
            group,
            threshold,
            done: Cell::new(false),
            wakeup: Condvar::new(),
        };
        let desc = JobDesc::new(wakeup_body)
            .name("wait_blocking_wakeup")
            .user_data(&ctx as *const WakeupCtx as *mut ());

        let mut shared = self.shared.lock();
        // The helper must not join the awaited group itself: it would be
        // waiting for its own completion.
        // SAFETY: `ctx` and `group` outlive the helper job, which completes
        // before the condvar loop below exits.
        unsafe { self.enqueue_batch_locked(&mut shared, slice::from_ref(&desc), None) };
        while !ctx.done.get() {
            ctx.wakeup.wait(&mut shared);
        }
    }

    /// # Safety
    ///
    /// Same contract as [`enqueue_batch`](Scheduler::enqueue_batch).
    unsafe fn enqueue_batch_locked(
        &self,
        shared: &mut Shared,
        list: &[JobDesc],
        group: Option<&Group>,
    ) {
        if let Some(group) = group {
            group.assert_valid();
            group.count.set(group.count.get() + list.len() as u32);
        }

        for desc in list {
            assert!(
                (desc.queue as usize) < shared.queues.len(),
                "queue index out of range",
            );
            let id = shared.job_free.pop().expect("job pool exhausted");
            self.jobs.job(id).prepare(desc, self, group);
            shared.queues[desc.queue as usize].push_back(id);
            self.signal_from(shared, desc.queue as usize);
        }
        log::trace!("enqueued {} job(s)", list.len());
    }

    /// Return a finished job's record and fiber to their pools and drain
    /// its group: the completion that brings the count to zero re-enqueues
    /// the parked waiter at the *front* of its queue, so continuations beat
    /// fresh work.
    fn retire(&self, shared: &mut Shared, id: JobId, fid: usize) {
        shared.job_free.push(id);
        shared.fiber_free.push(fid);

        let job = self.jobs.job(id);
        if let Some(group) = job.group.get() {
            // SAFETY: the enqueue contract keeps the group alive while any
            // of its jobs are in flight.
            let group = unsafe { group.as_ref() };
            let count = group.count.get() - 1;
            group.count.set(count);
            if count == 0 {
                let waiter = group.job.get().expect("group drained with no waiter attached");
                let target = self.jobs.job(waiter).queue.get() as usize;
                shared.queues[target].push_front(waiter);
                self.signal_from(shared, target);
            }
        }
    }

    /// Wake one sleeper on queue `idx`, then walk the priority chain
    /// towards its head: a predecessor may be sleeping with only the
    /// fallback link to feed it, so new work here must wake it too.
    fn signal_from(&self, shared: &mut Shared, idx: usize) {
        let mut cursor = Some(idx);
        while let Some(i) = cursor {
            let queue = &mut shared.queues[i];
            if queue.waiters > 0 {
                queue.waiters -= 1;
                self.signals[i].notify_one();
            }
            cursor = queue.prev;
        }
    }

    /// Re-materialize the guard for a lock that was forgotten on the other
    /// side of a fiber switch.
    ///
    /// # Safety
    ///
    /// The mutex must be locked, with no live guard, and ownership of the
    /// critical section must be this side's by protocol.
    unsafe fn relock(&self) -> MutexGuard<'_, Shared> {
        unsafe { self.shared.make_guard_unchecked() }
    }

    /// # Safety
    ///
    /// The job must have a fiber attached (true for any running job).
    unsafe fn fiber_ptr(&self, job: &Job) -> *mut Fiber {
        let fid = job.fiber.get().expect("suspending a job that has no fiber");
        unsafe { self.fibers.get(fid) }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

/// Body of every worker fiber: runs jobs forever, reporting a status word
/// through each switch back to the worker loop that resumed it.
extern "C" fn fiber_main(owner: *mut u8, mut value: usize) -> ! {
    let fiber = owner.cast::<Fiber>();
    loop {
        // SAFETY: the worker passed a prepared job record; the record stays
        // checked out to this fiber until the completion switch below.
        let job = unsafe { &*(value as *const Job) };
        let sched = unsafe { &*job.sched.get() };

        // The worker resumed this fiber with the lock held; release it
        // around the user body.
        unsafe { sched.shared.force_unlock() };

        let func = job.func.get().expect("job has no body");
        let mut ctx = JobContext {
            job: NonNull::from(job),
        };
        let user_data = job.user_data.get();
        // A panic must not unwind past the bottom of a fiber stack.
        if panic::catch_unwind(AssertUnwindSafe(|| func(&mut ctx, user_data))).is_err() {
            log::error!("job {:?} panicked", job.name.get());
            process::abort();
        }

        mem::forget(sched.shared.lock());
        // SAFETY: this code runs on `fiber`'s stack.
        value = unsafe { Fiber::suspend(fiber, Status::Complete.word()) };
    }
}

////////////////////////////////////////////////////////////////////////////////
// JobContext
////////////////////////////////////////////////////////////////////////////////

/// Handle to the currently running job, passed to every job body.
///
/// The suspension calls on this handle are the only operations that
/// transfer control away from a job; user code between them is opaque to
/// the scheduler. The handle is tied to the job's fiber and must not be
/// smuggled elsewhere, which its lack of `Send` enforces.
pub struct JobContext {
    job: NonNull<Job>,
}

impl JobContext {
    fn job(&self) -> &Job {
        // SAFETY: the record stays checked out to this job for the whole
        // body, which is the only place a `JobContext` can exist.
        unsafe { self.job.as_ref() }
    }

    /// The scheduler this job runs on.
    pub fn scheduler(&self) -> &Scheduler {
        // SAFETY: the scheduler outlives its running jobs by the `run`
        // contract.
        unsafe { &*self.job().sched.get() }
    }

    /// Id of the worker thread currently running this job, as passed to
    /// [`Scheduler::run`]. Don't cache it across suspensions: the job may
    /// resume on a different worker.
    pub fn thread_id(&self) -> usize {
        self.job().thread_id.get()
    }

    /// The job's name, if the descriptor carried one.
    pub fn name(&self) -> Option<&'static str> {
        self.job().name.get()
    }

    /// Suspend this job until at most `threshold` jobs of `group` remain
    /// outstanding.
    ///
    /// A zero threshold is a full join. A non-zero threshold resumes the
    /// job as soon as the group drains to that many jobs, which is how a
    /// producer keeps a bounded pipeline topped up: enqueue until
    /// [throttled] enqueueing reports the group full, wait at a threshold,
    /// repeat.
    ///
    /// [throttled]: Scheduler::enqueue_throttled
    pub fn wait(&mut self, group: &Group, threshold: u32) {
        let sched = self.scheduler();
        let mut shared = sched.shared.lock();
        group.assert_valid();
        group.job.set(Some(self.job().id));

        // Consume the bias; park only if more than `threshold` remain.
        let count = group.count.get() - 1;
        group.count.set(count);
        if count > threshold {
            // Hide `threshold` jobs from the counter so the completion that
            // drains it to zero resumes us exactly at the threshold.
            group.count.set(count - threshold);
            // SAFETY: a running job always has a fiber, and this code runs
            // on that fiber's stack.
            let fiber = unsafe { sched.fiber_ptr(self.job()) };
            mem::forget(shared);
            unsafe { Fiber::suspend(fiber, Status::Waiting.word()) };
            // Re-dispatched: the draining job pushed us to the front of our
            // queue and a worker resumed us, lock in hand.
            shared = unsafe { sched.relock() };
            group.count.set(group.count.get() + threshold);
        }

        // Restore the bias and detach, leaving the group ready for reuse.
        group.count.set(group.count.get() + 1);
        group.job.set(None);
        drop(shared);
    }

    /// Suspend this job and reschedule it at the back of its current queue.
    pub fn yield_now(&mut self) {
        let sched = self.scheduler();
        let shared = sched.shared.lock();
        // SAFETY: as in `wait`.
        let fiber = unsafe { sched.fiber_ptr(self.job()) };
        mem::forget(shared);
        unsafe {
            Fiber::suspend(fiber, Status::Yielding.word());
            // Resumed with the lock held by the new worker; release it
            // before returning to the body.
            sched.shared.force_unlock();
        }
    }

    /// Suspend this job and reschedule it on another queue.
    pub fn switch_queue(&mut self, queue: usize) {
        let sched = self.scheduler();
        let shared = sched.shared.lock();
        assert!(queue < sched.signals.len(), "queue index out of range");
        self.job().queue.set(queue as u8);
        // SAFETY: as in `wait`.
        let fiber = unsafe { sched.fiber_ptr(self.job()) };
        mem::forget(shared);
        unsafe {
            Fiber::suspend(fiber, Status::Yielding.word());
            sched.shared.force_unlock();
        }
    }

    /// Abort this job: it is marked completed (its group is drained as
    /// usual) and its record and fiber return to the pools, but the rest of
    /// the body never runs — and neither do destructors of values currently
    /// live on the job's stack, so don't abort while holding resources.
    pub fn abort(&mut self) -> ! {
        let sched = self.scheduler();
        // SAFETY: as in `wait`.
        let fiber = unsafe { sched.fiber_ptr(self.job()) };
        mem::forget(sched.shared.lock());
        unsafe { Fiber::suspend(fiber, Status::Aborted.word()) };
        unreachable!("aborted job was resumed");
    }

    /// Enqueue `list` and wait for all of it: shorthand for a fresh group,
    /// [`enqueue_batch`] and a zero-threshold [`wait`].
    ///
    /// # Safety
    ///
    /// Same contract as [`enqueue_batch`] for the descriptors' `user_data`.
    ///
    /// [`enqueue_batch`]: Scheduler::enqueue_batch
    /// [`wait`]: JobContext::wait
    pub unsafe fn join(&mut self, list: &[JobDesc]) {
        let group = Group::new();
        unsafe { self.scheduler().enqueue_batch(list, Some(&group)) };
        self.wait(&group, 0);
    }
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("name", &self.name())
            .field("thread_id", &self.thread_id())
            .finish_non_exhaustive()
    }
}

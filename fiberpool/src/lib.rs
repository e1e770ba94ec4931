//! Fiber based cooperative job scheduler.
//!
//! With this crate you can:
//! - submit short functions ("jobs") into one of several named queues and
//!   run them on a pool of worker threads,
//! - suspend a job mid-execution — each job runs on its own user-space
//!   stack (fiber), so it can wait for other jobs, yield, or move to
//!   another queue, and later resume on any worker,
//! - track completion through lightweight caller-allocated [`Group`]
//!   counters, awaitable with a threshold for both fork/join and throttled
//!   producer/consumer patterns.
//!
//! # Scheduling model
//!
//! A fixed set of OS threads each call [`Scheduler::run`] pinned to one
//! queue index. Within a worker, jobs are cooperative: a job runs until it
//! completes or suspends itself through its [`JobContext`]; jobs on
//! different workers run truly in parallel. Queues can be chained with
//! [`Scheduler::queue_priority`] so an idle worker drains a fallback queue.
//!
//! All capacities — job records, fibers, stacks, queue slots — are fixed at
//! construction by a [`Config`] and recycled forever after; the scheduler
//! never allocates on the enqueue or dispatch paths. Running out of a pool,
//! naming a bad queue, or handing over a corrupted group is a caller bug
//! and panics; construction is the one fallible seam (see [`Error`]).
//!
//! # External threads
//!
//! A thread that is not a worker has no fiber and cannot use
//! [`JobContext::wait`]; it blocks on a group with
//! [`Scheduler::wait_blocking`] instead. The demo in
//! `examples/pipeline.rs` shows the typical shape: one worker per core, one
//! job per data block, a throttled producer, a blocking wait at the end.

mod error;
mod fiber;
mod group;
mod queue;
mod scheduler;

pub use error::{Error, Result};
pub use group::Group;
pub use scheduler::{Config, JobContext, JobDesc, JobFn, Scheduler};

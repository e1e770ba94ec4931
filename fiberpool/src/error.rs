//! Error handling utils.
//!
//! The scheduler treats runtime misuse (bad queue indexes, exhausted pools,
//! corrupted groups, double priority links) as fatal precondition violations
//! and panics; those are bugs in the calling code, not recoverable
//! conditions. The only fallible seam is construction: [`Scheduler::new`]
//! validates its [`Config`] and maps the stack region, and reports problems
//! through the [`Error`] type below.
//!
//! [`Scheduler::new`]: crate::Scheduler::new
//! [`Config`]: crate::Config

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("job count must be a power of two, got {0}")]
    JobCountNotPowerOfTwo(usize),

    #[error("stack size must be a power of two, got {0}")]
    StackSizeNotPowerOfTwo(usize),

    #[error("at least one queue is required")]
    NoQueues,

    #[error("queue indexes are 8 bit, so at most 256 queues are supported, got {0}")]
    TooManyQueues(usize),

    #[error("at least one fiber is required")]
    NoFibers,

    #[error("failed to map the fiber stack region: {0}")]
    StackRegion(#[from] io::Error),
}

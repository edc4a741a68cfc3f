//! Corral Dispatch
//!
//! Hands Queued Work Items to a Slurm-style batch scheduler and keeps the
//! scheduler queue consistent with the store: cancels jobs whose priority
//! dropped to 0, cleans up after jobs that vanished and renices jobs whose
//! priority changed.

pub mod config;
pub mod dispatcher;
pub mod queue;
pub mod shutdown;
pub mod slurm;

pub use config::{Config, DispatchFileConfig};
pub use dispatcher::Dispatcher;
pub use queue::{QueueEntry, QueueMonitor, QueueSnapshot};
pub use slurm::{BatchScheduler, JobSubmission, SlurmCli};

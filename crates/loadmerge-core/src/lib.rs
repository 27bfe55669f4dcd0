//! loadmerge-core - batching scheduler and the traits it drives.
//!
//! # Overview
//!
//! LoadMerge amortizes many small, concurrent point lookups into fewer
//! merged queries against a slow backing resource, then routes every
//! returned item back to the caller that asked for it. The core crate
//! defines:
//!
//! - [`BatchScheduler`] - buffers `load` calls and flushes them per tick
//! - [`RequestMerger`] - partitions a flushed batch into [`RequestGroup`]s
//! - [`RequestRunner`] - the async backing call each group is sent to
//! - [`Request`] / [`Callback`] - a buffered call and its settlement handle
//! - [`BatchError`] - how a `load` call can fail

pub mod error;
pub mod merger;
pub mod request;
pub mod runner;
pub mod scheduler;

pub use error::{BatchError, BoxError, SharedError};
pub use merger::RequestMerger;
pub use request::{Callback, Request, RequestGroup, ResultDispatcher, Settlement, SettlementReceiver};
pub use runner::{runner_fn, RequestRunner, RunnerFn};
pub use scheduler::{BatchScheduler, LoadFuture, SchedulerConfig};

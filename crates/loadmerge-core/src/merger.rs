//! The request merger capability.

use crate::error::BoxError;
use crate::request::{Request, RequestGroup};

/// Partitions a flushed batch of requests into groups that each run as a
/// single runner call.
///
/// Implementations must be synchronous and side-effect free: they only read
/// the batch. Every position of `requests` should appear in exactly one
/// returned group; the scheduler rejects positions that are left out.
///
/// Returning `Err` fails every request of the batch with that error and no
/// runner is invoked.
pub trait RequestMerger<A, RA, R>: Send + Sync + 'static {
    fn merge(&self, requests: &[Request<A, R>]) -> Result<Vec<RequestGroup<RA, R>>, BoxError>;
}

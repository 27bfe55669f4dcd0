//! The request runner capability: the slow backing resource.

use std::future::Future;

use async_trait::async_trait;

use crate::error::BoxError;

/// Executes one merged query against the backing resource (database driver,
/// HTTP API, ...).
///
/// # Thread Safety
/// Implementations must be `Send + Sync`; groups run as separate Tokio tasks.
#[async_trait]
pub trait RequestRunner<A, R>: Send + Sync + 'static {
    /// Run the merged arguments and return every result item found.
    async fn run(&self, args: A) -> Result<Vec<R>, BoxError>;
}

/// Runner built from an async closure. See [`runner_fn`].
#[derive(Clone)]
pub struct RunnerFn<F> {
    f: F,
}

/// Adapt an async closure into a [`RequestRunner`].
///
/// ```rust,no_run
/// use loadmerge_core::runner_fn;
///
/// let runner = runner_fn(|ids: Vec<u64>| async move {
///     Ok::<_, std::io::Error>(ids.into_iter().map(|id| id * 2).collect::<Vec<_>>())
/// });
/// ```
pub fn runner_fn<F>(f: F) -> RunnerFn<F> {
    RunnerFn { f }
}

#[async_trait]
impl<A, R, E, F, Fut> RequestRunner<A, R> for RunnerFn<F>
where
    A: Send + 'static,
    R: Send + 'static,
    E: Into<BoxError>,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<R>, E>> + Send,
{
    async fn run(&self, args: A) -> Result<Vec<R>, BoxError> {
        (self.f)(args).await.map_err(Into::into)
    }
}

//! Buffered requests, their settlement handles, and request groups.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::{BatchError, BoxError, SharedError};

/// Outcome delivered to a single `load` caller.
pub type Settlement<R> = Result<Vec<R>, BatchError>;

/// Receiving half of a request's settlement slot.
pub type SettlementReceiver<R> = oneshot::Receiver<Settlement<R>>;

/// Maps one returned result item to the request positions (within its
/// group) that should receive it.
///
/// An empty list drops the item; several positions share it.
pub type ResultDispatcher<R> = Box<dyn Fn(&R) -> Vec<usize> + Send + Sync>;

/// Single-assignment settlement handle for one request.
///
/// Both `resolve` and `reject` consume the callback, so a request is settled
/// at most once.
pub struct Callback<R> {
    tx: oneshot::Sender<Settlement<R>>,
}

impl<R> Callback<R> {
    /// Settle with the results routed to this request (possibly empty).
    pub fn resolve(self, results: Vec<R>) {
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.tx.send(Ok(results));
    }

    /// Settle with an error.
    pub fn reject(self, err: BatchError) {
        let _ = self.tx.send(Err(err));
    }

    /// Returns `true` if the waiting side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<R> std::fmt::Debug for Callback<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// A buffered unit of work: the caller's arguments plus its callback.
#[derive(Debug)]
pub struct Request<A, R> {
    args: A,
    callback: Callback<R>,
}

impl<A, R> Request<A, R> {
    /// Create a request and the receiver its settlement will arrive on.
    pub fn new(args: A) -> (Self, SettlementReceiver<R>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            args,
            callback: Callback { tx },
        };
        (request, rx)
    }

    /// The arguments this request was loaded with.
    pub fn args(&self) -> &A {
        &self.args
    }

    /// Split into arguments and callback.
    pub fn into_parts(self) -> (A, Callback<R>) {
        (self.args, self.callback)
    }
}

/// Requests that will be serviced by one runner call.
///
/// `requests` lists positions into the flushed batch handed to the merger.
/// The order of that list defines the indices `dispatcher` returns: index
/// `i` refers to the request at `requests[i]`.
///
/// A group whose `args` is `Err` could not be turned into a runner call;
/// its requests are rejected with that error and the runner is skipped.
/// Other groups of the same flush are unaffected.
pub struct RequestGroup<RA, R> {
    /// Merged arguments passed to the runner, or why none could be built.
    pub args: Result<RA, SharedError>,
    /// Batch positions of the member requests, in group order.
    pub requests: Vec<usize>,
    /// Routes each result item to group indices.
    pub dispatcher: ResultDispatcher<R>,
}

impl<RA, R> RequestGroup<RA, R> {
    /// Group that runs `args` once for every request in `requests`.
    pub fn new(
        args: RA,
        requests: Vec<usize>,
        dispatcher: impl Fn(&R) -> Vec<usize> + Send + Sync + 'static,
    ) -> Self {
        Self {
            args: Ok(args),
            requests,
            dispatcher: Box::new(dispatcher),
        }
    }

    /// Group whose requests all fail with `err` without reaching the runner.
    pub fn failed(requests: Vec<usize>, err: impl Into<BoxError>) -> Self
    where
        R: 'static,
    {
        Self {
            args: Err(Arc::from(err.into())),
            requests,
            dispatcher: Box::new(|_: &R| Vec::new()),
        }
    }

    /// Runner arguments, if the group has any.
    pub fn runner_args(&self) -> Option<&RA> {
        self.args.as_ref().ok()
    }

    /// Number of member requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Returns `true` if the group has no member requests.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Group indices that should receive `item`.
    pub fn dispatch(&self, item: &R) -> Vec<usize> {
        (self.dispatcher)(item)
    }
}

impl<RA: std::fmt::Debug, R> std::fmt::Debug for RequestGroup<RA, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGroup")
            .field("args", &self.args)
            .field("requests", &self.requests)
            .finish_non_exhaustive()
    }
}

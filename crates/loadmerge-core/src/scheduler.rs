//! Batching scheduler: buffers `load` calls, flushes them through a
//! [`RequestMerger`] and runs the resulting groups concurrently.
//!
//! ```text
//! load() → pending queue (cycle n) ─→ flush(n): take queue → merger → groups ─┬→ runner → dispatcher → callbacks
//!                                                                              ├→ runner → ...
//!                                                                              └→ failed group → reject
//! ```
//!
//! Every flush closes one cycle; loads arriving afterwards queue for the next.
//! With no execution delay the flush runs on the caller's task, after one
//! cooperative yield of the first polled load of the cycle. With a delay a
//! timer task flushes the cycle it was armed for.
//!
//! Each group is an independent Tokio task: a failing or slow group never
//! holds back its siblings.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{BatchError, SharedError};
use crate::merger::RequestMerger;
use crate::request::{Callback, Request, RequestGroup, ResultDispatcher, Settlement};
use crate::runner::RequestRunner;

/// Configuration for [`BatchScheduler`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How long a batch stays open after its first request, in milliseconds.
    /// `0` (the default) flushes at the next cooperative yield point, which
    /// adds the least latency; larger values give more room to batch.
    pub execution_delay_ms: u64,
}

impl SchedulerConfig {
    pub fn with_execution_delay_ms(mut self, ms: u64) -> Self {
        self.execution_delay_ms = ms;
        self
    }

    pub fn execution_delay(&self) -> Duration {
        Duration::from_millis(self.execution_delay_ms)
    }
}

/// Future returned by [`BatchScheduler::load`].
pub type LoadFuture<R> = BoxFuture<'static, Settlement<R>>;

/// Coalesces concurrent `load` calls into merged runner calls.
///
/// Cloning is cheap and clones share the same pending queue.
pub struct BatchScheduler<A, RA, R> {
    inner: Arc<SchedulerInner<A, RA, R>>,
}

struct SchedulerInner<A, RA, R> {
    merger: Arc<dyn RequestMerger<A, RA, R>>,
    runner: Arc<dyn RequestRunner<RA, R>>,
    pending: Mutex<PendingBatch<A, R>>,
    execution_delay: Duration,
}

/// Requests of the open cycle.
struct PendingBatch<A, R> {
    queue: Vec<Request<A, R>>,
    cycle: u64,
}

impl<A, RA, R> Clone for BatchScheduler<A, RA, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, RA, R> BatchScheduler<A, RA, R>
where
    A: Send + 'static,
    RA: Send + 'static,
    R: Clone + Send + 'static,
{
    /// Scheduler that owns its merger and runner.
    pub fn new(
        merger: impl RequestMerger<A, RA, R>,
        runner: impl RequestRunner<RA, R>,
        config: SchedulerConfig,
    ) -> Self {
        Self::from_shared(Arc::new(merger), Arc::new(runner), config)
    }

    /// Build from merger and runner trait objects that are shared elsewhere.
    pub fn from_shared(
        merger: Arc<dyn RequestMerger<A, RA, R>>,
        runner: Arc<dyn RequestRunner<RA, R>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                merger,
                runner,
                pending: Mutex::new(PendingBatch {
                    queue: Vec::new(),
                    cycle: 0,
                }),
                execution_delay: config.execution_delay(),
            }),
        }
    }

    /// Request the results for `args`.
    ///
    /// The request joins the pending batch immediately, before the returned
    /// future is polled, so every `load` issued before the flush fires shares
    /// one batch. The future resolves with the items routed to this request
    /// (an empty list means nothing matched) or with the error of its group.
    ///
    /// With no execution delay the batch is flushed by whichever load of the
    /// cycle is polled first; a load that is never polled is picked up by
    /// the next one that is.
    ///
    /// # Panics
    /// Must be called (and polled) from within a Tokio runtime.
    pub fn load(&self, args: A) -> LoadFuture<R> {
        let (request, rx) = Request::new(args);
        let (cycle, first) = {
            let mut pending = self.inner.lock_pending();
            pending.queue.push(request);
            (pending.cycle, pending.queue.len() == 1)
        };

        if self.inner.execution_delay.is_zero() {
            let inner = Arc::clone(&self.inner);
            return async move {
                tokio::task::yield_now().await;
                inner.flush_cycle(cycle);
                rx.await.unwrap_or(Err(BatchError::Dropped))
            }
            .boxed();
        }

        if first {
            SchedulerInner::schedule_flush(&self.inner, cycle);
        }
        async move { rx.await.unwrap_or(Err(BatchError::Dropped)) }.boxed()
    }

    /// Number of requests waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.inner.lock_pending().queue.len()
    }
}

impl<A, RA, R> SchedulerInner<A, RA, R>
where
    A: Send + 'static,
    RA: Send + 'static,
    R: Clone + Send + 'static,
{
    fn lock_pending(&self) -> MutexGuard<'_, PendingBatch<A, R>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule_flush(this: &Arc<Self>, cycle: u64) {
        let inner = Arc::clone(this);
        let delay = this.execution_delay;
        trace!(cycle, delay_ms = delay.as_millis() as u64, "flush scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.flush_cycle(cycle);
        });
    }

    /// Flush the queue if `cycle` is still the open one.
    fn flush_cycle(&self, cycle: u64) {
        let batch = {
            let mut pending = self.lock_pending();
            if pending.cycle != cycle || pending.queue.is_empty() {
                return;
            }
            pending.cycle += 1;
            std::mem::take(&mut pending.queue)
        };
        trace!(cycle, requests = batch.len(), "cycle closed");
        self.flush(batch);
    }

    fn flush(&self, batch: Vec<Request<A, R>>) {
        let total = batch.len();

        let groups = match self.merger.merge(&batch) {
            Ok(groups) => groups,
            Err(e) => {
                let err = BatchError::Merge(Arc::from(e));
                warn!(requests = total, error = %err, "request merger failed, rejecting batch");
                for request in batch {
                    let (_, callback) = request.into_parts();
                    callback.reject(err.clone());
                }
                return;
            }
        };

        debug!(
            requests = total,
            groups = groups.len(),
            saved = total.saturating_sub(groups.len()),
            "flushing batch"
        );

        let mut slots: Vec<Option<Callback<R>>> = batch
            .into_iter()
            .map(|request| Some(request.into_parts().1))
            .collect();

        for group in groups {
            let RequestGroup {
                args,
                requests,
                dispatcher,
            } = group;

            let callbacks: Vec<Option<Callback<R>>> = requests
                .iter()
                .map(|&position| {
                    let callback = slots.get_mut(position).and_then(Option::take);
                    if callback.is_none() {
                        warn!(position, "group names a request that is out of range or already grouped");
                    }
                    callback
                })
                .collect();

            if callbacks.iter().all(Option::is_none) {
                continue;
            }
            match args {
                Ok(args) => self.spawn_group(args, callbacks, dispatcher),
                Err(cause) => reject_group(cause, callbacks),
            }
        }

        let unassigned: Vec<Callback<R>> = slots.into_iter().flatten().collect();
        if !unassigned.is_empty() {
            warn!(requests = unassigned.len(), "merger left requests out of every group");
            for callback in unassigned {
                callback.reject(BatchError::Unassigned);
            }
        }
    }

    fn spawn_group(
        &self,
        args: RA,
        callbacks: Vec<Option<Callback<R>>>,
        dispatcher: ResultDispatcher<R>,
    ) {
        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            match runner.run(args).await {
                Ok(results) => settle_group(results, callbacks, &dispatcher),
                Err(e) => reject_group(Arc::from(e), callbacks),
            }
        });
    }
}

/// Reject every member of a group with the same runner error.
fn reject_group<R>(cause: SharedError, callbacks: Vec<Option<Callback<R>>>) {
    let err = BatchError::Runner(cause);
    warn!(requests = callbacks.len(), error = %err, "group failed");
    for callback in callbacks.into_iter().flatten() {
        callback.reject(err.clone());
    }
}

/// Route every result item into per-request buckets, then resolve each
/// request with its bucket.
fn settle_group<R: Clone>(
    results: Vec<R>,
    callbacks: Vec<Option<Callback<R>>>,
    dispatcher: &ResultDispatcher<R>,
) {
    let mut buckets: Vec<Vec<R>> = callbacks.iter().map(|_| Vec::new()).collect();

    for item in results {
        let mut targets = dispatcher(&item);
        targets.retain(|&idx| {
            let in_range = idx < buckets.len();
            if !in_range {
                warn!(index = idx, group_size = buckets.len(), "dispatcher index outside group");
            }
            in_range
        });
        if let Some((&last, rest)) = targets.split_last() {
            for &idx in rest {
                buckets[idx].push(item.clone());
            }
            buckets[last].push(item);
        }
    }

    for (callback, bucket) in callbacks.into_iter().zip(buckets) {
        if let Some(callback) = callback {
            callback.resolve(bucket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::runner::runner_fn;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    /// Unions every requested id into one `$in`-style list.
    struct UnionMerger;

    impl RequestMerger<Vec<u32>, Vec<u32>, u32> for UnionMerger {
        fn merge(
            &self,
            requests: &[Request<Vec<u32>, u32>],
        ) -> Result<Vec<RequestGroup<Vec<u32>, u32>>, BoxError> {
            let mut owners: HashMap<u32, Vec<usize>> = HashMap::new();
            let mut ids = Vec::new();
            for (i, request) in requests.iter().enumerate() {
                for &id in request.args() {
                    let entry = owners.entry(id).or_default();
                    if entry.is_empty() {
                        ids.push(id);
                    }
                    entry.push(i);
                }
            }
            let positions = (0..requests.len()).collect();
            Ok(vec![RequestGroup::new(ids, positions, move |item: &u32| {
                owners.get(item).cloned().unwrap_or_default()
            })])
        }
    }

    /// One group per parity; each group's runner args are its values.
    struct ParityMerger;

    impl RequestMerger<u32, Vec<u32>, u32> for ParityMerger {
        fn merge(
            &self,
            requests: &[Request<u32, u32>],
        ) -> Result<Vec<RequestGroup<Vec<u32>, u32>>, BoxError> {
            let mut groups = Vec::new();
            for parity in [0, 1] {
                let positions: Vec<usize> = (0..requests.len())
                    .filter(|&i| requests[i].args() % 2 == parity)
                    .collect();
                if positions.is_empty() {
                    continue;
                }
                let values: Vec<u32> = positions.iter().map(|&i| *requests[i].args()).collect();
                let lookup = values.clone();
                groups.push(RequestGroup::new(values, positions, move |item: &u32| {
                    lookup
                        .iter()
                        .enumerate()
                        .filter(|(_, v)| *v == item)
                        .map(|(i, _)| i)
                        .collect()
                }));
            }
            Ok(groups)
        }
    }

    struct FailingMerger;

    impl RequestMerger<u32, Vec<u32>, u32> for FailingMerger {
        fn merge(
            &self,
            _requests: &[Request<u32, u32>],
        ) -> Result<Vec<RequestGroup<Vec<u32>, u32>>, BoxError> {
            Err("bad batch".into())
        }
    }

    /// Only groups the first request; the rest are left out.
    struct FirstOnlyMerger;

    impl RequestMerger<u32, Vec<u32>, u32> for FirstOnlyMerger {
        fn merge(
            &self,
            requests: &[Request<u32, u32>],
        ) -> Result<Vec<RequestGroup<Vec<u32>, u32>>, BoxError> {
            let first = *requests[0].args();
            Ok(vec![RequestGroup::new(vec![first], vec![0], |_: &u32| vec![0, 7])])
        }
    }

    fn counting_runner(
        calls: Arc<AtomicUsize>,
    ) -> impl RequestRunner<Vec<u32>, u32> {
        runner_fn(move |ids: Vec<u32>| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, BoxError>(ids.into_iter().filter(|id| *id < 100).collect()) }
        })
    }

    #[tokio::test]
    async fn concurrent_loads_share_one_runner_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler =
            BatchScheduler::new(UnionMerger, counting_runner(calls.clone()), SchedulerConfig::default());

        let a = scheduler.load(vec![25, 130]);
        let b = scheduler.load(vec![35, 40]);
        assert_eq!(scheduler.pending(), 2);

        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap(), vec![25]);
        assert_eq!(b.unwrap(), vec![35, 40]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shared_result_reaches_every_owner() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler =
            BatchScheduler::new(UnionMerger, counting_runner(calls.clone()), SchedulerConfig::default());

        let (a, b) = tokio::join!(scheduler.load(vec![5]), scheduler.load(vec![5, 6]));
        assert_eq!(a.unwrap(), vec![5]);
        assert_eq!(b.unwrap(), vec![5, 6]);
    }

    #[tokio::test]
    async fn no_match_resolves_empty() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler =
            BatchScheduler::new(UnionMerger, counting_runner(calls), SchedulerConfig::default());
        assert!(scheduler.load(vec![500]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn loads_after_a_flush_start_a_new_batch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler =
            BatchScheduler::new(UnionMerger, counting_runner(calls.clone()), SchedulerConfig::default());

        scheduler.load(vec![1]).await.unwrap();
        scheduler.load(vec![2]).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn merger_failure_rejects_whole_batch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler =
            BatchScheduler::new(FailingMerger, counting_runner(calls.clone()), SchedulerConfig::default());

        let (a, b) = tokio::join!(scheduler.load(1), scheduler.load(2));
        for res in [a, b] {
            let err = res.unwrap_err();
            assert!(err.is_merge());
            assert_eq!(err.cause().unwrap().to_string(), "bad batch");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn runner_failure_is_isolated_to_its_group() {
        let runner = runner_fn(|values: Vec<u32>| async move {
            if values.iter().any(|v| v % 2 == 1) {
                Err::<Vec<u32>, BoxError>("odd group down".into())
            } else {
                Ok(values)
            }
        });
        let scheduler = BatchScheduler::new(ParityMerger, runner, SchedulerConfig::default());

        let (a, b, c) = tokio::join!(scheduler.load(2), scheduler.load(3), scheduler.load(5));
        assert_eq!(a.unwrap(), vec![2]);

        let (b, c) = (b.unwrap_err(), c.unwrap_err());
        assert!(b.is_runner());
        match (&b, &c) {
            (BatchError::Runner(x), BatchError::Runner(y)) => assert!(Arc::ptr_eq(x, y)),
            _ => panic!("expected runner errors, got {b:?} / {c:?}"),
        }
    }

    #[tokio::test]
    async fn panicking_runner_drops_only_its_group() {
        let runner = runner_fn(|values: Vec<u32>| async move {
            if values.contains(&3) {
                panic!("runner blew up");
            }
            Ok::<_, BoxError>(values)
        });
        let scheduler = BatchScheduler::new(ParityMerger, runner, SchedulerConfig::default());

        let (a, b) = tokio::join!(scheduler.load(2), scheduler.load(3));
        assert_eq!(a.unwrap(), vec![2]);
        assert!(matches!(b, Err(BatchError::Dropped)));
    }

    #[tokio::test]
    async fn requests_left_out_by_merger_are_rejected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler =
            BatchScheduler::new(FirstOnlyMerger, counting_runner(calls.clone()), SchedulerConfig::default());

        let (a, b) = tokio::join!(scheduler.load(1), scheduler.load(2));
        // the dispatcher's out-of-range index 7 is ignored
        assert_eq!(a.unwrap(), vec![1]);
        assert!(matches!(b, Err(BatchError::Unassigned)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delayed_flush_collects_late_arrivals() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = SchedulerConfig::default().with_execution_delay_ms(50);
        let scheduler = BatchScheduler::new(UnionMerger, counting_runner(calls.clone()), config);

        let started = Instant::now();
        let first = scheduler.load(vec![1]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.pending(), 1);
        let second = scheduler.load(vec![2]);

        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap(), vec![1]);
        assert_eq!(b.unwrap(), vec![2]);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// Rejects odd values in a group of their own; evens share a runner group.
    struct OddRejectingMerger;

    impl RequestMerger<u32, Vec<u32>, u32> for OddRejectingMerger {
        fn merge(
            &self,
            requests: &[Request<u32, u32>],
        ) -> Result<Vec<RequestGroup<Vec<u32>, u32>>, BoxError> {
            let (even, odd): (Vec<usize>, Vec<usize>) =
                (0..requests.len()).partition(|&i| requests[i].args() % 2 == 0);
            let values: Vec<u32> = even.iter().map(|&i| *requests[i].args()).collect();
            let lookup = values.clone();
            Ok(vec![
                RequestGroup::failed(odd, "odd values are not accepted"),
                RequestGroup::new(values, even, move |item: &u32| {
                    lookup.iter().position(|v| v == item).into_iter().collect()
                }),
            ])
        }
    }

    #[tokio::test]
    async fn failed_group_skips_runner_and_spares_siblings() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = BatchScheduler::new(
            OddRejectingMerger,
            counting_runner(calls.clone()),
            SchedulerConfig::default(),
        );

        let (a, b, c) = tokio::join!(scheduler.load(2), scheduler.load(3), scheduler.load(4));
        assert_eq!(a.unwrap(), vec![2]);
        assert_eq!(c.unwrap(), vec![4]);
        let err = b.unwrap_err();
        assert!(err.is_runner());
        assert_eq!(err.cause().unwrap().to_string(), "odd values are not accepted");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unpolled_load_is_flushed_with_the_next_polled_one() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler =
            BatchScheduler::new(UnionMerger, counting_runner(calls.clone()), SchedulerConfig::default());

        let idle = scheduler.load(vec![1]);
        let polled = scheduler.load(vec![2]);
        assert_eq!(polled.await.unwrap(), vec![2]);
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(idle.await.unwrap(), vec![1]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_tick_loads_share_one_call_on_worker_threads() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler =
            BatchScheduler::new(UnionMerger, counting_runner(calls.clone()), SchedulerConfig::default());

        for round in 0..200u32 {
            let loads = (0..3).map(|i| scheduler.load(vec![round % 50 + i]));
            let results = futures::future::join_all(loads).await;
            for (i, res) in results.into_iter().enumerate() {
                assert_eq!(res.unwrap(), vec![round % 50 + i as u32]);
            }
            assert_eq!(calls.load(Ordering::SeqCst), round as usize + 1, "round {round} split");
        }
    }

    #[tokio::test]
    async fn load_during_running_flush_starts_its_own_batch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());
        let runner = {
            let calls = calls.clone();
            let gate = gate.clone();
            runner_fn(move |ids: Vec<u32>| {
                calls.fetch_add(1, Ordering::SeqCst);
                let gate = gate.clone();
                async move {
                    if ids.contains(&1) {
                        gate.notified().await;
                    }
                    Ok::<_, BoxError>(ids)
                }
            })
        };
        let scheduler = BatchScheduler::new(UnionMerger, runner, SchedulerConfig::default());

        let first = tokio::spawn(scheduler.load(vec![1]));
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(scheduler.pending(), 0);

        assert_eq!(scheduler.load(vec![2]).await.unwrap(), vec![2]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!first.is_finished());

        gate.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), vec![1]);
    }

    #[test]
    fn config_defaults_and_deserializes() {
        assert_eq!(SchedulerConfig::default().execution_delay(), Duration::ZERO);
        let cfg: SchedulerConfig = serde_json::from_str(r#"{"execution_delay_ms": 100}"#).unwrap();
        assert_eq!(cfg.execution_delay(), Duration::from_millis(100));
        let empty: SchedulerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, SchedulerConfig::default());
    }
}

//! Field-bound solver: a [`BatchScheduler`] pre-wired with a [`FieldMerger`].

use loadmerge_core::{BatchScheduler, LoadFuture, RequestRunner, SchedulerConfig};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::merger::{FieldMerger, FieldMergerConfig};
use crate::value::FieldSource;

/// Options for [`FieldSolver`]; the union of merger and scheduler options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldSolverConfig {
    /// Maximum distinct field values per merged query.
    pub max_query_length: usize,
    /// Batch window in milliseconds; `0` flushes at the next yield point.
    pub execution_delay_ms: u64,
    /// Merge every request into one query regardless of other arguments.
    pub force_single_group: bool,
}

impl Default for FieldSolverConfig {
    fn default() -> Self {
        let merger = FieldMergerConfig::default();
        Self {
            max_query_length: merger.max_query_length,
            execution_delay_ms: SchedulerConfig::default().execution_delay_ms,
            force_single_group: merger.force_single_group,
        }
    }
}

impl FieldSolverConfig {
    pub fn with_max_query_length(mut self, n: usize) -> Self {
        self.max_query_length = n;
        self
    }

    pub fn with_execution_delay_ms(mut self, ms: u64) -> Self {
        self.execution_delay_ms = ms;
        self
    }

    pub fn with_force_single_group(mut self, force: bool) -> Self {
        self.force_single_group = force;
        self
    }

    pub fn merger_config(&self) -> FieldMergerConfig {
        FieldMergerConfig {
            max_query_length: self.max_query_length,
            force_single_group: self.force_single_group,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            execution_delay_ms: self.execution_delay_ms,
        }
    }
}

/// Solves N+1 lookups by one field.
///
/// Each `load({ field: value, ...filters })` call is batched with its
/// neighbours into `runner({ field: { "$in": [...] }, ...filters })`, and
/// every returned row is handed to the calls whose value it carries.
///
/// ```rust,no_run
/// use loadmerge_core::{runner_fn, BoxError};
/// use loadmerge_field::{FieldSolver, FieldSolverConfig};
/// use serde_json::{json, Value};
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let users = FieldSolver::new(
///     "id",
///     runner_fn(|query: Value| async move {
///         // SELECT * FROM users WHERE id IN (...)
///         let _ = query;
///         Ok::<Vec<Value>, BoxError>(vec![])
///     }),
///     FieldSolverConfig::default(),
/// );
/// let rows = users.load(json!({ "id": 42, "deletedAt": null })).await?;
/// # let _ = rows;
/// # Ok(())
/// # }
/// ```
pub struct FieldSolver<A = Value, RA = Value, R = Value> {
    merger: FieldMerger,
    scheduler: BatchScheduler<A, RA, R>,
}

impl<A, RA, R> Clone for FieldSolver<A, RA, R> {
    fn clone(&self) -> Self {
        Self {
            merger: self.merger.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<A, RA, R> FieldSolver<A, RA, R>
where
    A: Serialize + Send + 'static,
    RA: DeserializeOwned + Send + 'static,
    R: FieldSource + Clone + Send + 'static,
{
    pub fn new(
        field: impl Into<String>,
        runner: impl RequestRunner<RA, R>,
        config: FieldSolverConfig,
    ) -> Self {
        let merger = FieldMerger::new(field, config.merger_config());
        let scheduler = BatchScheduler::new(merger.clone(), runner, config.scheduler_config());
        Self { merger, scheduler }
    }

    /// Load the rows whose field matches `args`' field, under the same
    /// remaining filters. Resolves to an empty list when nothing matches.
    pub fn load(&self, args: A) -> LoadFuture<R> {
        self.scheduler.load(args)
    }

    pub fn field(&self) -> &str {
        self.merger.field()
    }

    pub fn scheduler(&self) -> &BatchScheduler<A, RA, R> {
        &self.scheduler
    }
}

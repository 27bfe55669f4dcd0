//! loadmerge CLI - preview how requests are merged and simulate a batch.
//!
//! # Commands
//! ```bash
//! # Show the merged queries a batch of request arguments would produce
//! loadmerge plan --field id --file requests.json
//!
//! # Push the batch through the scheduler against an echo runner
//! loadmerge simulate --field id --file requests.json --delay-ms 5
//! ```
//!
//! The input file holds a JSON array of argument objects, e.g.
//! `[{"id": 1}, {"id": 2, "deletedAt": null}]`. Use `-` to read stdin.

use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use loadmerge_core::{runner_fn, BoxError, Request, RequestGroup, RequestMerger};
use loadmerge_field::{FieldMerger, FieldSolver, FieldSolverConfig, IN_OPERATOR};
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "loadmerge",
    about = "Preview and simulate N+1 request batching by field",
    version
)]
struct Cli {
    /// Enable debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the merged queries a batch would run, without running them
    Plan {
        #[command(flatten)]
        merge: MergeOpts,
    },

    /// Load every request concurrently through the scheduler
    Simulate {
        #[command(flatten)]
        merge: MergeOpts,
        /// Batch window in milliseconds (0 = next yield point)
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },
}

#[derive(Args)]
struct MergeOpts {
    /// Distinguishing field merged into an `$in` condition
    #[arg(short, long)]
    field: String,
    /// JSON array of request arguments (`-` for stdin)
    #[arg(long, default_value = "-")]
    file: String,
    /// Maximum distinct values per merged query
    #[arg(long, default_value_t = 100)]
    max_query_length: usize,
    /// Merge everything into one query regardless of other arguments
    #[arg(long)]
    single_group: bool,
}

impl MergeOpts {
    fn config(&self) -> FieldSolverConfig {
        FieldSolverConfig::default()
            .with_max_query_length(self.max_query_length)
            .with_force_single_group(self.single_group)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Plan { merge } => cmd_plan(&merge),
        Commands::Simulate { merge, delay_ms } => cmd_simulate(&merge, delay_ms).await,
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_requests(path: &str) -> Result<Vec<Value>> {
    let content = if path == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read stdin")?;
        buf
    } else {
        std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?
    };
    let value: Value = serde_json::from_str(&content).context("input is not valid JSON")?;
    match value {
        Value::Array(items) if !items.is_empty() => Ok(items),
        Value::Array(_) => bail!("input array is empty"),
        _ => bail!("input must be a JSON array of request arguments"),
    }
}

fn cmd_plan(opts: &MergeOpts) -> Result<()> {
    let args = read_requests(&opts.file)?;
    let merger = FieldMerger::new(opts.field.clone(), opts.config().merger_config());

    let (requests, _pending): (Vec<Request<Value, Value>>, Vec<_>) =
        args.into_iter().map(Request::new).unzip();
    let groups: Vec<RequestGroup<Value, Value>> = merger
        .merge(&requests)
        .map_err(|e| anyhow!("merge failed: {e}"))?;

    let plan: Vec<Value> = groups
        .iter()
        .map(|g| match &g.args {
            Ok(args) => json!({ "args": args, "requests": g.requests }),
            Err(e) => json!({ "error": e.to_string(), "requests": g.requests }),
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&plan)?);
    eprintln!(
        "{} requests → {} queries, {} rejected",
        requests.len(),
        groups.iter().filter(|g| g.args.is_ok()).count(),
        groups.iter().filter(|g| g.args.is_err()).count()
    );
    Ok(())
}

/// Answers every merged query with one row per requested value, carrying
/// the query's other arguments.
fn echo_rows(field: &str, query: &Value) -> Vec<Value> {
    let Some(obj) = query.as_object() else {
        return vec![];
    };
    let values = obj
        .get(field)
        .and_then(|cond| cond.get(IN_OPERATOR))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    values
        .into_iter()
        .map(|v| {
            let mut row: Map<String, Value> = obj.clone();
            row.insert(field.to_string(), v);
            Value::Object(row)
        })
        .collect()
}

async fn cmd_simulate(opts: &MergeOpts, delay_ms: u64) -> Result<()> {
    let args = read_requests(&opts.file)?;
    let total = args.len();
    let calls = Arc::new(AtomicUsize::new(0));

    let runner = {
        let calls = calls.clone();
        let field = opts.field.clone();
        runner_fn(move |query: Value| {
            calls.fetch_add(1, Ordering::SeqCst);
            let rows = echo_rows(&field, &query);
            tracing::info!(query = %query, rows = rows.len(), "runner called");
            async move { Ok::<_, BoxError>(rows) }
        })
    };
    let solver: FieldSolver = FieldSolver::new(
        opts.field.clone(),
        runner,
        opts.config().with_execution_delay_ms(delay_ms),
    );

    let start = Instant::now();
    let loads: Vec<_> = args.iter().cloned().map(|a| solver.load(a)).collect();
    let results = futures::future::join_all(loads).await;
    let elapsed = start.elapsed();

    let mut failed = 0usize;
    for (args, result) in args.iter().zip(results) {
        match result {
            Ok(rows) => println!("{args} → {}", Value::Array(rows)),
            Err(e) => {
                failed += 1;
                println!("{args} → error: {e}");
            }
        }
    }

    println!();
    println!("  Requests:     {total}");
    println!("  Runner calls: {}", calls.load(Ordering::SeqCst));
    println!("  Failed:       {failed}");
    println!("  Elapsed:      {}ms", elapsed.as_millis());
    Ok(())
}

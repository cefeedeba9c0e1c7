/// Scheduler - Fanning Tests Out Across Workers
///
/// **Responsibility:**
/// Split the test list into shards, run every shard to completion on its
/// own worker, and merge the results into one report.
///
/// **Rules:**
/// - workers = clamp(requested or CPU count, 1, max(1, test count))
/// - one worker: run serially on a single blocking task, no sharding
/// - otherwise: test `i` goes to shard `i % workers`
/// - each worker loads its own compiler and never shares it
/// - results are concatenated in shard order (or re-sorted into discovery
///   order when configured)
/// - any worker failure or panic aborts the whole run; the remaining
///   workers stop before their next test
///
/// Workers are blocking tasks; shard results travel back over a channel.

use crate::compiler::{locate_and_load, CompilerLoader, CompilerSearch};
use crate::config::{ResultOrder, RunnerConfig};
use crate::executor::TestExecutor;
use anyhow::{anyhow, Context, Result};
use nmtest_common::{RunReport, TestCase, TestResult};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

/// Everything a worker needs to set up its execution context.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub search: CompilerSearch,
    pub jobs: Option<usize>,
    pub entry: String,
    pub profile: Option<String>,
    pub order: ResultOrder,
}

impl RunPlan {
    pub fn from_config(config: &RunnerConfig, working_dir: &Path) -> Self {
        Self {
            search: config.compiler_search(working_dir),
            jobs: config.jobs,
            entry: config.entry_export.clone(),
            profile: config.profile.clone(),
            order: config.result_order,
        }
    }
}

type Indexed<T> = (usize, T);

pub fn effective_workers(requested: Option<usize>, test_count: usize) -> usize {
    let requested = requested.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    });
    requested.clamp(1, test_count.max(1))
}

/// Round-robin partition, keeping each test's discovery index.
pub fn shard<T>(items: Vec<T>, shards: usize) -> Vec<Vec<Indexed<T>>> {
    let shards = shards.max(1);
    let mut out: Vec<Vec<Indexed<T>>> = (0..shards).map(|_| Vec::new()).collect();
    for (index, item) in items.into_iter().enumerate() {
        out[index % shards].push((index, item));
    }
    out
}

/// Run every test and aggregate the results.
pub async fn run_all(
    tests: Vec<TestCase>,
    plan: RunPlan,
    loader: Arc<dyn CompilerLoader>,
) -> Result<RunReport> {
    let started = Instant::now();
    let total = tests.len();
    let workers = effective_workers(plan.jobs, total);
    let order = plan.order;
    info!(tests = total, workers, "Starting test run");

    let indexed = if workers == 1 {
        let tests = tests.into_iter().enumerate().collect();
        tokio::task::spawn_blocking(move || {
            run_shard(0, tests, &plan, loader.as_ref(), &AtomicBool::new(false))
        })
        .await
        .context("Worker crashed")??
    } else {
        run_sharded(tests, workers, &plan, loader).await?
    };

    let results = merge(indexed, order);
    let report = RunReport::new(results);
    info!(
        total = report.summary.total,
        passed = report.summary.passed,
        failed = report.summary.failed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Test run finished"
    );
    Ok(report)
}

async fn run_sharded(
    tests: Vec<TestCase>,
    workers: usize,
    plan: &RunPlan,
    loader: Arc<dyn CompilerLoader>,
) -> Result<Vec<Indexed<TestResult>>> {
    let (tx, mut rx) = mpsc::channel::<Indexed<Result<Vec<Indexed<TestResult>>>>>(workers);
    let cancel = Arc::new(AtomicBool::new(false));

    for (index, tests) in shard(tests, workers).into_iter().enumerate() {
        let tx = tx.clone();
        let plan = plan.clone();
        let loader = Arc::clone(&loader);
        let cancel = Arc::clone(&cancel);
        tokio::task::spawn_blocking(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                run_shard(index, tests, &plan, loader.as_ref(), &cancel)
            }))
            .unwrap_or_else(|_| Err(anyhow!("worker crashed")));
            if outcome.is_err() {
                cancel.store(true, Ordering::SeqCst);
            }
            // The coordinator only stops listening after it has already failed
            let _ = tx.blocking_send((index, outcome));
        });
    }
    drop(tx);

    let mut parts: Vec<Option<Vec<Indexed<TestResult>>>> = (0..workers).map(|_| None).collect();
    while let Some((index, outcome)) = rx.recv().await {
        match outcome {
            Ok(results) => parts[index] = Some(results),
            Err(e) => {
                cancel.store(true, Ordering::SeqCst);
                return Err(e.context(format!("Shard {} failed", index)));
            }
        }
    }

    parts
        .into_iter()
        .enumerate()
        .map(|(index, part)| part.with_context(|| format!("Shard {} produced no results", index)))
        .collect::<Result<Vec<_>>>()
        .map(|parts| parts.into_iter().flatten().collect())
}

/// Run one shard. Stops before the next test once `cancel` is set; the
/// partial results it returns are only used if no other shard failed.
#[instrument(skip(tests, plan, loader, cancel), fields(tests = tests.len()))]
fn run_shard(
    shard: usize,
    tests: Vec<Indexed<TestCase>>,
    plan: &RunPlan,
    loader: &dyn CompilerLoader,
    cancel: &AtomicBool,
) -> Result<Vec<Indexed<TestResult>>> {
    let compiler = locate_and_load(&plan.search, loader)
        .context("Failed to load compiler")?
        .with_profile(plan.profile.clone())?;
    info!(script = %compiler.origin().script.display(), "Worker ready");

    let executor = TestExecutor::new(&compiler, plan.entry.clone());
    let mut results = Vec::with_capacity(tests.len());
    for (index, test) in tests {
        if cancel.load(Ordering::SeqCst) {
            warn!(completed = results.len(), "Run aborted, stopping shard");
            break;
        }
        results.push((index, executor.run(test)));
    }
    Ok(results)
}

fn merge(mut indexed: Vec<Indexed<TestResult>>, order: ResultOrder) -> Vec<TestResult> {
    if order == ResultOrder::Discovery {
        indexed.sort_by_key(|(index, _)| *index);
    }
    indexed.into_iter().map(|(_, result)| result).collect()
}

//! Worker pool that drains the work queue.
//!
//! Each worker owns one granule at a time, retries it under the
//! [`RetryPolicy`], and hands the outcome to the shared [`OutputWriter`].
//! A failed granule never stops a worker; a failed write to the ledger
//! stops the whole run.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use parking_lot::Mutex;
use rayon::ThreadPoolBuilder;

use crate::catalog::WorkItem;
use crate::error::{Error, Result};
use crate::ledger::OutputWriter;
use crate::queue::WorkQueue;

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub concurrency: usize,
    /// Pause between launching consecutive workers.
    pub startup_separation: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            concurrency: 1,
            startup_separation: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

/// Explicit concurrency wins, then the service's desired capacity, then 1.
/// Test runs always use a single worker.
pub fn resolve_concurrency(concurrency: Option<usize>, desired_nodes: Option<usize>, test: bool) -> usize {
    if test {
        return 1;
    }
    concurrency.or(desired_nodes).unwrap_or(1).max(1)
}

/// Result of one processing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// CSV block (header line first) to append to the summary.
    Completed(String),
    /// Worth trying again.
    Retry(String),
    /// Will fail the same way every time.
    Terminal(String),
}

/// Final outcome of a granule after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { block: String, attempts: u32 },
    Failed { reason: String, attempts: u32 },
}

/// Calls `attempt` until it completes, fails terminally, or the policy runs
/// out. Sleeps `policy.delay` between attempts, never after the last one.
pub fn run_with_retry<F>(policy: &RetryPolicy, mut attempt: F) -> Outcome
where
    F: FnMut(u32) -> Attempt,
{
    let max = policy.attempts.max(1);
    let mut last_reason = String::new();
    for n in 1..=max {
        match attempt(n) {
            Attempt::Completed(block) => return Outcome::Completed { block, attempts: n },
            Attempt::Terminal(reason) => return Outcome::Failed { reason, attempts: n },
            Attempt::Retry(reason) => {
                last_reason = reason;
                if n < max && !policy.delay.is_zero() {
                    thread::sleep(policy.delay);
                }
            }
        }
    }
    Outcome::Failed {
        reason: last_reason,
        attempts: max,
    }
}

/// Work done for one granule by a worker.
pub trait GranuleProcessor: Sync {
    fn process(&self, worker_id: usize, item: &WorkItem) -> Attempt;
}

/// State shared by all workers of one run.
pub struct RunContext {
    pub queue: WorkQueue,
    pub writer: OutputWriter,
    /// When false, terminal failures are only logged (test runs).
    pub record_errors: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub rows_written: usize,
}

struct Shared<'a> {
    ctx: &'a RunContext,
    retry: RetryPolicy,
    progress: ProgressBar,
    abort: AtomicBool,
    fatal: Mutex<Option<Error>>,
    completed: AtomicUsize,
    failed: AtomicUsize,
    rows: AtomicUsize,
}

impl Shared<'_> {
    fn fail_run(&self, worker_id: usize, e: Error) {
        error!("<{}> ledger write failed, stopping run: {}", worker_id, e);
        self.abort.store(true, Ordering::SeqCst);
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(e);
        }
    }
}

fn worker<P: GranuleProcessor>(worker_id: usize, shared: &Shared<'_>, processor: &P) {
    loop {
        // Stop once another worker hit a ledger error
        if shared.abort.load(Ordering::SeqCst) {
            break;
        }
        let Some(item) = shared.ctx.queue.try_pop() else {
            info!("<{}> no more requests", worker_id);
            break;
        };

        info!("<{}> processing granule {} ...", worker_id, item.name);
        let start = Instant::now();
        let outcome = run_with_retry(&shared.retry, |n| {
            let attempt = processor.process(worker_id, &item);
            if let Attempt::Retry(reason) = &attempt {
                warn!("<{}> attempt {} failed on {}: {}", worker_id, n, item.name, reason);
            }
            attempt
        });

        // Record the outcome; a failed ledger write ends the run
        match outcome {
            Outcome::Completed { block, attempts } => match shared.ctx.writer.append_block(&block) {
                Ok(rows) => {
                    shared.completed.fetch_add(1, Ordering::SeqCst);
                    shared.rows.fetch_add(rows, Ordering::SeqCst);
                    info!(
                        "<{}> finished granule {} ({} rows, {} attempts, {:.1}s)",
                        worker_id,
                        item.name,
                        rows,
                        attempts,
                        start.elapsed().as_secs_f64()
                    );
                    shared.progress.println(format!("Processed: {}", item.name));
                }
                Err(e) => {
                    shared.fail_run(worker_id, e);
                    break;
                }
            },
            Outcome::Failed { reason, attempts } => {
                shared.failed.fetch_add(1, Ordering::SeqCst);
                warn!(
                    "<{}> giving up on {} after {} attempts: {}",
                    worker_id, item.name, attempts, reason
                );
                shared.progress.println(format!("Error: {} - {}", item.name, reason));
                // Test runs leave the error log alone
                if shared.ctx.record_errors {
                    if let Err(e) = shared.ctx.writer.record_error(&item.name) {
                        shared.fail_run(worker_id, e);
                        break;
                    }
                }
            }
        }
        shared.progress.inc(1);
    }
}

/// Drains the queue with `config.concurrency` workers.
pub fn run<P: GranuleProcessor>(ctx: &RunContext, processor: &P, config: &DispatchConfig) -> Result<RunSummary> {
    let concurrency = config.concurrency.max(1);
    let total = ctx.queue.len();

    // Set up the worker pool
    let pool = ThreadPoolBuilder::new()
        .num_threads(concurrency)
        .thread_name(|i| format!("granule-worker-{}", i))
        .build()
        .map_err(|e| Error::ThreadPool(e.to_string()))?;

    // Progress bar, one tick per finished granule
    let style = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    let progress = ProgressBar::new(total as u64);
    progress.set_style(style);
    progress.set_message("Processing granules...");

    let shared = Shared {
        ctx,
        retry: config.retry,
        progress,
        abort: AtomicBool::new(false),
        fatal: Mutex::new(None),
        completed: AtomicUsize::new(0),
        failed: AtomicUsize::new(0),
        rows: AtomicUsize::new(0),
    };

    info!("Starting {} workers for {} granules", concurrency, total);
    // Launch workers one at a time, `startup_separation` apart
    pool.scope(|s| {
        for worker_id in 0..concurrency {
            let shared = &shared;
            s.spawn(move |_| worker(worker_id, shared, processor));
            if worker_id + 1 < concurrency && !config.startup_separation.is_zero() {
                thread::sleep(config.startup_separation);
            }
        }
    });
    shared.progress.finish_with_message("All processing requests completed.");

    // First ledger error wins
    if let Some(e) = shared.fatal.into_inner() {
        return Err(e);
    }

    let summary = RunSummary {
        completed: shared.completed.load(Ordering::SeqCst),
        failed: shared.failed.load(Ordering::SeqCst),
        rows_written: shared.rows.load(Ordering::SeqCst),
    };
    info!(
        "Run complete: {} processed, {} failed, {} rows written",
        summary.completed, summary.failed, summary.rows_written
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use std::fs;

    fn item(name: &str) -> WorkItem {
        WorkItem {
            name: name.to_string(),
            size: 0,
        }
    }

    fn no_wait(attempts: u32) -> DispatchConfig {
        DispatchConfig {
            concurrency: 3,
            startup_separation: Duration::ZERO,
            retry: RetryPolicy {
                attempts,
                delay: Duration::ZERO,
            },
        }
    }

    #[test]
    fn retry_accepts_first_success() {
        let mut calls = 0;
        let outcome = run_with_retry(&RetryPolicy { attempts: 3, delay: Duration::ZERO }, |n| {
            calls += 1;
            if n < 2 {
                Attempt::Retry("busy".into())
            } else {
                Attempt::Completed("h\nrow".into())
            }
        });
        assert_eq!(calls, 2);
        assert_eq!(
            outcome,
            Outcome::Completed {
                block: "h\nrow".into(),
                attempts: 2
            }
        );
    }

    #[test]
    fn retry_stops_on_terminal() {
        let mut calls = 0;
        let outcome = run_with_retry(&RetryPolicy { attempts: 5, delay: Duration::ZERO }, |_| {
            calls += 1;
            Attempt::Terminal("bad extent".into())
        });
        assert_eq!(calls, 1);
        assert!(matches!(outcome, Outcome::Failed { attempts: 1, .. }));
    }

    #[test]
    fn retry_waits_only_between_attempts() {
        let policy = RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(40),
        };
        let start = Instant::now();
        let outcome = run_with_retry(&policy, |_| Attempt::Retry("down".into()));
        let elapsed = start.elapsed();
        assert_eq!(
            outcome,
            Outcome::Failed {
                reason: "down".into(),
                attempts: 3
            }
        );
        assert!(elapsed >= Duration::from_millis(80));
        assert!(elapsed < Duration::from_millis(120) + Duration::from_secs(1));
    }

    #[test]
    fn concurrency_resolution() {
        assert_eq!(resolve_concurrency(Some(8), Some(4), false), 8);
        assert_eq!(resolve_concurrency(None, Some(4), false), 4);
        assert_eq!(resolve_concurrency(None, None, false), 1);
        assert_eq!(resolve_concurrency(Some(8), None, true), 1);
        assert_eq!(resolve_concurrency(Some(0), None, false), 1);
    }

    struct EvenSucceeds;

    impl GranuleProcessor for EvenSucceeds {
        fn process(&self, _worker_id: usize, item: &WorkItem) -> Attempt {
            let n: usize = item.name.parse().unwrap();
            if n % 2 == 0 {
                Attempt::Completed(format!("granule,beam\n{},gt1l\n{},gt2l\n", n, n))
            } else {
                Attempt::Retry(format!("{} failed", n))
            }
        }
    }

    #[test]
    fn every_item_lands_in_summary_or_error_log() {
        let dir = tempfile::tempdir().unwrap();
        let summary = dir.path().join("summary.csv");
        let errors = dir.path().join("errors.txt");
        let (_, writer) = Ledger::open(&summary, &errors, false, None).unwrap();
        let ctx = RunContext {
            queue: WorkQueue::new((0..20).map(|i| item(&i.to_string()))),
            writer,
            record_errors: true,
        };

        let result = run(&ctx, &EvenSucceeds, &no_wait(2)).unwrap();
        assert_eq!(result.completed, 10);
        assert_eq!(result.failed, 10);
        assert_eq!(result.rows_written, 20);
        assert!(ctx.queue.is_empty());
        drop(ctx);

        let text = fs::read_to_string(&summary).unwrap();
        assert_eq!(text.matches("granule,beam").count(), 1);
        assert_eq!(text.lines().count(), 21);
        let mut failed: Vec<usize> = fs::read_to_string(&errors)
            .unwrap()
            .lines()
            .map(|l| l.parse().unwrap())
            .collect();
        failed.sort();
        assert_eq!(failed, (0..20).filter(|n| n % 2 == 1).collect::<Vec<_>>());
    }

    #[test]
    fn test_runs_do_not_record_errors() {
        let dir = tempfile::tempdir().unwrap();
        let summary = dir.path().join("summary.csv");
        let errors = dir.path().join("errors.txt");
        let (_, writer) = Ledger::open(&summary, &errors, false, None).unwrap();
        let ctx = RunContext {
            queue: WorkQueue::new(vec![item("1")]),
            writer,
            record_errors: false,
        };
        let result = run(&ctx, &EvenSucceeds, &no_wait(1)).unwrap();
        assert_eq!(result.failed, 1);
        drop(ctx);
        assert_eq!(fs::read_to_string(&errors).unwrap(), "");
    }

    /// Holds each granule long enough that every worker takes one, and
    /// stamps when each worker first gets work.
    struct SlowStamps {
        hold: Duration,
        first_call: Mutex<Vec<(usize, Instant)>>,
    }

    impl GranuleProcessor for SlowStamps {
        fn process(&self, worker_id: usize, item: &WorkItem) -> Attempt {
            {
                let mut stamps = self.first_call.lock();
                if !stamps.iter().any(|&(id, _)| id == worker_id) {
                    stamps.push((worker_id, Instant::now()));
                }
            }
            thread::sleep(self.hold);
            Attempt::Completed(format!("granule\n{}\n", item.name))
        }
    }

    #[test]
    fn workers_launch_staggered() {
        let dir = tempfile::tempdir().unwrap();
        let summary = dir.path().join("summary.csv");
        let errors = dir.path().join("errors.txt");
        let (_, writer) = Ledger::open(&summary, &errors, false, None).unwrap();
        let ctx = RunContext {
            queue: WorkQueue::new((0..3).map(|i| item(&i.to_string()))),
            writer,
            record_errors: true,
        };
        let separation = Duration::from_millis(60);
        let config = DispatchConfig {
            concurrency: 3,
            startup_separation: separation,
            retry: RetryPolicy {
                attempts: 1,
                delay: Duration::ZERO,
            },
        };
        let processor = SlowStamps {
            hold: separation * 6,
            first_call: Mutex::new(Vec::new()),
        };

        let start = Instant::now();
        let result = run(&ctx, &processor, &config).unwrap();
        assert_eq!(result.completed, 3);

        let mut stamps = processor.first_call.into_inner();
        assert_eq!(stamps.len(), 3);
        stamps.sort_by_key(|&(id, _)| id);
        for (id, at) in stamps {
            assert!(
                at.duration_since(start) >= separation * id as u32,
                "worker {} started after {:?}",
                id,
                at.duration_since(start)
            );
        }
    }
}

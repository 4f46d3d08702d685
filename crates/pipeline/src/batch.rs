//! Bounded worker pool and per-stage batch reports.
//!
//! `run_batch` fans items out over at most `N` rayon workers and folds the
//! outcomes into a [`BatchReport`] on the calling thread once every item has
//! finished. A panicking item is recorded as a failure; its siblings keep going.
//! `run_planned_batch` additionally refuses to let two items write one output.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::warn;

use crate::media::MediaFile;

/// Result of processing one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Success,
    Skipped,
    Failed(String),
}

impl ItemOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        ItemOutcome::Failed(reason.into())
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ItemOutcome::Failed(_))
    }
}

/// Aggregated outcomes of one stage invocation.
///
/// Only counts and sets are kept, so the report does not depend on the order
/// in which workers finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub skipped: BTreeSet<PathBuf>,
    pub failed: BTreeMap<PathBuf, String>,
}

impl BatchReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, path: PathBuf, outcome: ItemOutcome) {
        self.total += 1;
        match outcome {
            ItemOutcome::Success => self.succeeded += 1,
            ItemOutcome::Skipped => {
                self.skipped.insert(path);
            }
            ItemOutcome::Failed(reason) => {
                self.failed.insert(path, reason);
            }
        }
    }

    /// Fold another report into this one
    pub fn merge(&mut self, other: BatchReport) {
        self.total += other.total;
        self.succeeded += other.succeeded;
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ok, {} skipped, {} failed (of {})",
            self.succeeded,
            self.skipped_count(),
            self.failed_count(),
            self.total
        )
    }
}

/// Anything with a path that can be fed to [`run_batch`]
pub trait BatchItem {
    fn item_path(&self) -> &Path;
}

impl BatchItem for PathBuf {
    fn item_path(&self) -> &Path {
        self
    }
}

impl BatchItem for MediaFile {
    fn item_path(&self) -> &Path {
        self.path()
    }
}

/// Run `operation` once per item with at most `concurrency` workers.
///
/// - `concurrency <= 1` runs sequentially on the calling thread, in order
/// - an empty `items` slice returns an empty report without building a pool
/// - returns only after every item has finished
///
/// # Arguments
/// * `items` - Inputs, each attempted exactly once
/// * `concurrency` - Upper bound on simultaneously running operations
/// * `operation` - Per-item work; must not touch the report
pub fn run_batch<I, F>(items: &[I], concurrency: usize, operation: F) -> BatchReport
where
    I: BatchItem + Sync,
    F: Fn(&I) -> ItemOutcome + Sync,
{
    let mut report = BatchReport::new();
    if items.is_empty() {
        return report;
    }

    let workers = concurrency.max(1).min(items.len());
    let run_one = |item: &I| (item.item_path().to_path_buf(), guarded(&operation, item));

    let outcomes: Vec<(PathBuf, ItemOutcome)> = if workers == 1 {
        items.iter().map(run_one).collect()
    } else {
        match rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("batch-worker-{}", index))
            .build()
        {
            Ok(pool) => pool.install(|| items.par_iter().map(run_one).collect()),
            Err(e) => {
                warn!(error = %e, "could not build worker pool, running sequentially");
                items.iter().map(run_one).collect()
            }
        }
    };

    for (path, outcome) in outcomes {
        report.record(path, outcome);
    }
    report
}

/// An item paired with the output path it will write
struct Planned<'a, I> {
    item: &'a I,
    output: PathBuf,
}

impl<I: BatchItem> BatchItem for Planned<'_, I> {
    fn item_path(&self) -> &Path {
        self.item.item_path()
    }
}

/// [`run_batch`] for items that each write one planned output.
///
/// `plan` is evaluated for every item before any work starts. When several
/// items plan the same output, the first in input order keeps it and the
/// others fail without running.
///
/// # Arguments
/// * `plan` - Output path for an item
/// * `operation` - Per-item work, handed the planned output
pub fn run_planned_batch<I, P, F>(
    items: &[I],
    concurrency: usize,
    plan: P,
    operation: F,
) -> BatchReport
where
    I: BatchItem + Sync,
    P: Fn(&I) -> PathBuf,
    F: Fn(&I, &Path) -> ItemOutcome + Sync,
{
    let mut report = BatchReport::new();
    let mut owners: HashMap<PathBuf, &Path> = HashMap::new();
    let mut planned = Vec::with_capacity(items.len());

    for item in items {
        let output = plan(item);
        if let Some(owner) = owners.get(&output) {
            warn!(
                input = %item.item_path().display(),
                output = %output.display(),
                owner = %owner.display(),
                "output collision"
            );
            report.record(
                item.item_path().to_path_buf(),
                ItemOutcome::failed(format!("output collides with {}", owner.display())),
            );
            continue;
        }
        owners.insert(output.clone(), item.item_path());
        planned.push(Planned { item, output });
    }

    report.merge(run_batch(&planned, concurrency, |p| {
        operation(p.item, &p.output)
    }));
    report
}

fn guarded<I, F>(operation: &F, item: &I) -> ItemOutcome
where
    I: BatchItem,
    F: Fn(&I) -> ItemOutcome,
{
    panic::catch_unwind(AssertUnwindSafe(|| operation(item))).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        warn!(path = %item.item_path().display(), panic = %message, "worker panicked");
        ItemOutcome::Failed(format!("worker panicked: {}", message))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    fn paths(count: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|i| PathBuf::from(format!("pack/{:03}.png", i)))
            .collect()
    }

    #[test]
    fn test_empty_input_has_no_side_effects() {
        let calls = AtomicUsize::new(0);
        let items: Vec<PathBuf> = Vec::new();
        let report = run_batch(&items, 4, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            ItemOutcome::Success
        });

        assert!(report.is_empty());
        assert_eq!(report, BatchReport::new());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sequential_preserves_submission_order() {
        let seen = Mutex::new(Vec::new());
        let items = paths(6);
        let caller = thread::current().id();

        run_batch(&items, 1, |item| {
            assert_eq!(thread::current().id(), caller);
            seen.lock().unwrap().push(item.clone());
            ItemOutcome::Success
        });

        assert_eq!(*seen.lock().unwrap(), items);
    }

    #[test]
    fn test_concurrency_never_exceeds_bound() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let items = paths(24);

        let report = run_batch(&items, 3, |_| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            active.fetch_sub(1, Ordering::SeqCst);
            ItemOutcome::Success
        });

        assert_eq!(report.succeeded, 24);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_colliding_outputs_run_once() {
        let items = vec![
            PathBuf::from("pack/a.jpg"),
            PathBuf::from("pack/a.png"),
            PathBuf::from("pack/b.png"),
        ];
        let ran = Mutex::new(Vec::new());

        let report = run_planned_batch(
            &items,
            2,
            |item| item.with_extension("jxl"),
            |item, output| {
                ran.lock().unwrap().push((item.clone(), output.to_path_buf()));
                ItemOutcome::Success
            },
        );

        assert_eq!(report.total, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(
            report.failed[Path::new("pack/a.png")],
            "output collides with pack/a.jpg"
        );
        let mut ran = ran.into_inner().unwrap();
        ran.sort();
        assert_eq!(
            ran,
            vec![
                (items[0].clone(), PathBuf::from("pack/a.jxl")),
                (items[2].clone(), PathBuf::from("pack/b.jxl")),
            ]
        );
    }

    #[test]
    fn test_panic_is_isolated_to_one_item() {
        let items = paths(10);
        let poisoned = items[4].clone();

        let report = run_batch(&items, 4, |item| {
            if *item == poisoned {
                panic!("decoder exploded");
            }
            ItemOutcome::Success
        });

        assert_eq!(report.total, 10);
        assert_eq!(report.succeeded, 9);
        assert_eq!(report.failed_count(), 1);
        let reason = &report.failed[&poisoned];
        assert!(reason.starts_with("worker panicked"), "{reason}");
        assert!(reason.contains("decoder exploded"), "{reason}");
    }

    #[test]
    fn test_panic_in_sequential_mode_is_isolated() {
        let items = paths(3);
        let report = run_batch(&items, 1, |item| {
            if item.ends_with("001.png") {
                panic!("{} broke", item.display());
            }
            ItemOutcome::Skipped
        });

        assert_eq!(report.skipped_count(), 2);
        assert_eq!(report.failed_count(), 1);
    }

    #[test]
    fn test_merge_and_display() {
        let mut first = BatchReport::new();
        first.record(PathBuf::from("a"), ItemOutcome::Success);
        first.record(PathBuf::from("b"), ItemOutcome::Skipped);
        let mut second = BatchReport::new();
        second.record(PathBuf::from("c"), ItemOutcome::failed("boom"));

        first.merge(second);

        assert_eq!(first.total, 3);
        assert!(first.has_failures());
        assert_eq!(first.to_string(), "1 ok, 1 skipped, 1 failed (of 3)");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Every item is attempted exactly once and the report adds up,
        // whatever the worker count.
        #[test]
        fn prop_report_accounts_for_every_item(
            outcomes in prop::collection::vec(0u8..3, 0..40),
            concurrency in 0usize..6,
        ) {
            let items = paths(outcomes.len());
            let attempts = AtomicUsize::new(0);

            let report = run_batch(&items, concurrency, |item| {
                attempts.fetch_add(1, Ordering::SeqCst);
                let index = items.iter().position(|p| p == item).unwrap();
                match outcomes[index] {
                    0 => ItemOutcome::Success,
                    1 => ItemOutcome::Skipped,
                    _ => ItemOutcome::failed("nope"),
                }
            });

            let expected_ok = outcomes.iter().filter(|o| **o == 0).count();
            let expected_skip = outcomes.iter().filter(|o| **o == 1).count();
            prop_assert_eq!(attempts.load(Ordering::SeqCst), items.len());
            prop_assert_eq!(report.total, items.len());
            prop_assert_eq!(report.succeeded, expected_ok);
            prop_assert_eq!(report.skipped_count(), expected_skip);
            prop_assert_eq!(
                report.succeeded + report.skipped_count() + report.failed_count(),
                report.total
            );
        }
    }
}

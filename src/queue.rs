use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::catalog::WorkItem;
use crate::granule::SKIP_MARKER;
use crate::ledger::ChecklistSets;

/// Work shared by all workers of a run. `try_pop` checks for emptiness and
/// removes the item under one lock, so an empty result always means the
/// queue is drained.
#[derive(Debug, Default)]
pub struct WorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
}

impl WorkQueue {
    pub fn new(items: impl IntoIterator<Item = WorkItem>) -> Self {
        WorkQueue {
            items: Mutex::new(items.into_iter().collect()),
        }
    }

    /// Catalog entries that still need work: not already processed, not a
    /// known failure (unless reprocessing), and not disabled with the skip
    /// marker.
    pub fn plan(catalog: Vec<WorkItem>, sets: &ChecklistSets, reprocess: bool) -> Self {
        let pending = catalog.into_iter().filter(|item| {
            !item.name.contains(SKIP_MARKER)
                && !sets.processed.contains(&item.name)
                && (reprocess || !sets.in_error.contains(&item.name))
        });
        Self::new(pending)
    }

    pub fn try_pop(&self) -> Option<WorkItem> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.items.lock().iter().map(|i| i.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str) -> WorkItem {
        WorkItem {
            name: name.to_string(),
            size: 0,
        }
    }

    fn sets(processed: &[&str], in_error: &[&str]) -> ChecklistSets {
        ChecklistSets {
            processed: processed.iter().map(|s| s.to_string()).collect(),
            in_error: in_error.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn plan_excludes_processed_errors_and_skipped() {
        let catalog = vec![item("a"), item("b"), item("c"), item("#d")];
        let q = WorkQueue::plan(catalog, &sets(&["a"], &["b"]), false);
        assert_eq!(q.names(), vec!["c"]);
    }

    #[test]
    fn plan_requeues_errors_when_reprocessing() {
        let catalog = vec![item("a"), item("b"), item("c")];
        let mut s = sets(&["a", "b"], &["b"]);
        s.release_errors();
        let q = WorkQueue::plan(catalog, &s, true);
        assert_eq!(q.names(), vec!["b", "c"]);
    }

    #[test]
    fn unchanged_catalog_plans_nothing() {
        let catalog = vec![item("a"), item("b")];
        let q = WorkQueue::plan(catalog, &sets(&["a", "b"], &[]), false);
        assert!(q.is_empty());
    }

    #[test]
    fn concurrent_pops_see_each_item_once() {
        let q = WorkQueue::new((0..1000).map(|i| item(&i.to_string())));
        let taken = Mutex::new(Vec::new());
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    while let Some(i) = q.try_pop() {
                        taken.lock().push(i.name);
                    }
                });
            }
        });
        let mut taken = taken.into_inner();
        taken.sort();
        taken.dedup();
        assert_eq!(taken.len(), 1000);
        assert!(q.try_pop().is_none());
    }
}

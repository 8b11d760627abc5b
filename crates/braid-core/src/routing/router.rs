//! Router: pick the least-loaded worker whose capabilities cover the task's tags.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::domain::{Task, WorkerId};
use crate::error::RoutingError;

use super::registry::{CapabilityRegistry, WorkerDescriptor};

/// Deterministic, set-containment routing. No fuzzy matching here:
/// turning free text into tags is the classifier's job.
#[derive(Clone)]
pub struct Router {
    registry: Arc<CapabilityRegistry>,
}

impl Router {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Workers whose capability set is a superset of the task's tags, in id order.
    pub fn eligible<'a>(&'a self, task: &'a Task) -> impl Iterator<Item = &'a WorkerDescriptor> {
        self.registry
            .descriptors()
            .filter(move |worker| worker.covers(&task.tags))
    }

    /// Lowest `current_load / max_concurrent` wins; ties go to the smallest worker id.
    ///
    /// The chosen worker may be saturated. In that case every eligible worker is,
    /// and the caller leaves the task Ready until a slot frees up.
    pub fn route(&self, task: &Task) -> Result<WorkerId, RoutingError> {
        self.eligible(task)
            .map(|worker| {
                let load = self.registry.load(&worker.id).unwrap_or(0);
                (worker, load)
            })
            .min_by(|(a, a_load), (b, b_load)| {
                compare_load_ratio(*a_load, a.max_concurrent, *b_load, b.max_concurrent)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|(worker, _)| worker.id.clone())
            .ok_or_else(|| RoutingError::NoCapableWorker {
                task: task.id.clone(),
                tags: task.tags.iter().cloned().collect(),
            })
    }
}

/// Compares `a_load / a_max` with `b_load / b_max` without floating point.
fn compare_load_ratio(a_load: u32, a_max: u32, b_load: u32, b_max: u32) -> Ordering {
    (u64::from(a_load) * u64::from(b_max)).cmp(&(u64::from(b_load) * u64::from(a_max)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn router(workers: &[(&str, &[&str], u32)]) -> Router {
        let mut reg = CapabilityRegistry::new();
        for (id, caps, max) in workers {
            reg.register(WorkerDescriptor::new(*id, caps.iter().copied(), *max))
                .unwrap();
        }
        Router::new(Arc::new(reg))
    }

    #[test]
    fn requires_superset_of_tags() {
        let router = router(&[("w1", &["build"], 1), ("w2", &["build", "testing"], 1)]);
        let task = Task::new("t", "Build and test", ["build", "testing"]);
        assert_eq!(router.route(&task).unwrap(), WorkerId::new("w2"));
    }

    #[test]
    fn no_capable_worker_is_an_error() {
        let router = router(&[("w1", &["build"], 1)]);
        let task = Task::new("t", "Fix contrast", ["accessibility"]);
        assert!(matches!(
            router.route(&task),
            Err(RoutingError::NoCapableWorker { .. })
        ));
    }

    #[test]
    fn prefers_lowest_load_ratio() {
        let router = router(&[("w1", &["build"], 2), ("w2", &["build"], 4)]);
        let w1 = WorkerId::new("w1");
        let w2 = WorkerId::new("w2");
        // w1: 1/2, w2: 1/4
        assert!(router.registry().try_acquire(&w1));
        assert!(router.registry().try_acquire(&w2));

        let task = Task::new("t", "Compile", ["build"]);
        assert_eq!(router.route(&task).unwrap(), w2);
    }

    #[test]
    fn ties_break_by_worker_id() {
        let router = router(&[("w2", &["build"], 2), ("w1", &["build"], 4)]);
        let task = Task::new("t", "Compile", ["build"]);
        assert_eq!(router.route(&task).unwrap(), WorkerId::new("w1"));
    }

    #[rstest]
    #[case::equal(1, 2, 2, 4, Ordering::Equal)]
    #[case::less(0, 1, 1, 3, Ordering::Less)]
    #[case::greater(3, 3, 1, 2, Ordering::Greater)]
    fn load_ratio_comparison(
        #[case] a_load: u32,
        #[case] a_max: u32,
        #[case] b_load: u32,
        #[case] b_max: u32,
        #[case] expected: Ordering,
    ) {
        assert_eq!(compare_load_ratio(a_load, a_max, b_load, b_max), expected);
    }
}

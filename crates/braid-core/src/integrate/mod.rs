//! Integrator - batch の結果を artifact に反映する
//!
//! # フロー
//! 1. 同じ batch id がすでに commit 済みなら何もしない（replay）
//! 2. artifact ごとに conflict を検出し、ルール順に解決
//! 3. 負けた task（とその batch 内の dependent）の mutation は全部取り下げ
//! 4. 残りを 1 transaction で apply。どれか 1 つでも失敗したら全部 rollback
//!
//! artifact の version が動くのはここだけです。

pub mod conflict;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

pub use self::conflict::TaskOutput;

use self::conflict::{
    contenders, group_by_artifact, mutation, provably_independent, resolve, withheld_dependents,
    Entry,
};
use crate::domain::{
    ArtifactId, BatchId, CommitFailure, CommittedMutation, ConflictRule, DeferReason,
    DeferredTask, IntegrationRecord, MutationFingerprint, ResolvedConflict, TaskId,
};
use crate::error::{BraidError, CommitError};
use crate::ports::ArtifactStore;

/// The IntegrationRecord plus the errors the report has to surface.
#[derive(Debug)]
pub struct Integration {
    pub record: IntegrationRecord,
    /// `ConflictUnresolvable` for every manual-review group, `Commit` on rollback.
    pub errors: Vec<BraidError>,
}

#[derive(Debug, Clone)]
pub struct Integrator {
    delete_margin: f64,
}

impl Default for Integrator {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl Integrator {
    pub fn new(delete_margin: f64) -> Self {
        Self { delete_margin }
    }

    pub fn delete_margin(&self) -> f64 {
        self.delete_margin
    }

    #[instrument(skip_all, fields(batch = %batch_id, outputs = outputs.len()))]
    pub fn integrate(
        &self,
        batch_id: BatchId,
        outputs: &[TaskOutput],
        store: &mut dyn ArtifactStore,
        now: DateTime<Utc>,
    ) -> Integration {
        let mut record = IntegrationRecord::empty(batch_id, now);
        let mut errors = Vec::new();

        if store.is_committed(&batch_id) {
            info!("batch already committed, nothing to do");
            record.replayed = true;
            return Integration { record, errors };
        }

        let groups = group_by_artifact(outputs);

        // conflict 検出と解決
        let mut withheld: BTreeMap<TaskId, DeferReason> = BTreeMap::new();
        for (artifact, entries) in &groups {
            if contenders(entries).len() < 2 || provably_independent(outputs, entries, &*store) {
                continue;
            }
            let resolved = resolve(artifact, outputs, entries, self.delete_margin);
            info!(
                artifact = %artifact,
                rule = resolved.rule.number(),
                winner = ?resolved.winner.as_ref().map(|w| w.as_str()),
                losers = resolved.losers.len(),
                "conflict resolved"
            );
            if matches!(
                resolved.rule,
                ConflictRule::CreateCollision | ConflictRule::Unresolvable
            ) {
                errors.push(BraidError::ConflictUnresolvable {
                    artifact: artifact.clone(),
                    tasks: resolved.losers.iter().map(|l| l.task_id.clone()).collect(),
                });
            }
            for loser in &resolved.losers {
                // 最初に負けた理由を残す
                withheld
                    .entry(loser.task_id.clone())
                    .or_insert_with(|| loser.reason.clone());
            }
            record.resolved_conflicts.push(resolved);
        }

        let losers: BTreeSet<TaskId> = withheld.keys().cloned().collect();
        for (task, dependency) in withheld_dependents(outputs, &losers) {
            withheld
                .entry(task)
                .or_insert(DeferReason::BlockedBy { dependency });
        }
        record.deferred_tasks = withheld
            .iter()
            .map(|(task_id, reason)| DeferredTask {
                task_id: task_id.clone(),
                reason: reason.clone(),
            })
            .collect();

        // apply
        store.begin();
        let plan = apply_plan(outputs, &groups, &withheld, &*store);
        for (entry, rebase) in plan {
            let task = &outputs[entry.output];
            let original = mutation(outputs, entry);
            let fingerprint = MutationFingerprint::of(&task.task_id, entry.ordinal, original);
            if store.is_applied(&fingerprint) {
                record.already_applied.push(fingerprint);
                continue;
            }

            let mut applied = original.clone();
            if rebase {
                applied.base_version = store.version(&applied.artifact_id);
            }
            match store.apply(&fingerprint, &applied) {
                Ok(version) => record.committed_mutations.push(CommittedMutation {
                    fingerprint,
                    mutation: applied,
                    version,
                }),
                Err(source) => {
                    store.rollback();
                    warn!(task = %task.task_id, error = %source, "apply failed, batch rolled back");
                    record.rolled_back = Some(CommitFailure {
                        task_id: task.task_id.clone(),
                        artifact_id: original.artifact_id.clone(),
                        error: source.to_string(),
                    });
                    record.committed_mutations.clear();
                    record.already_applied.clear();
                    record.deferred_tasks.clear();
                    errors.push(BraidError::Commit(CommitError {
                        batch: batch_id,
                        task: task.task_id.clone(),
                        source,
                    }));
                    return Integration { record, errors };
                }
            }
        }
        store.commit(batch_id);

        info!(
            committed = record.committed_mutations.len(),
            conflicts = record.resolved_conflicts.len(),
            deferred = record.deferred_tasks.len(),
            "batch committed"
        );
        Integration { record, errors }
    }
}

/// Order in which surviving mutations are applied, with a flag telling
/// whether the mutation's base must be moved to the artifact's current version.
///
/// Artifacts go in id order. Inside a proven-independent patch group the
/// patches are applied bottom-up (descending start line) so earlier line
/// numbers stay valid; every other group keeps each task's own order.
fn apply_plan(
    outputs: &[TaskOutput],
    groups: &BTreeMap<ArtifactId, Vec<Entry>>,
    withheld: &BTreeMap<TaskId, DeferReason>,
    store: &dyn ArtifactStore,
) -> Vec<(Entry, bool)> {
    let mut plan = Vec::new();
    for entries in groups.values() {
        let surviving: Vec<Entry> = entries
            .iter()
            .copied()
            .filter(|e| !withheld.contains_key(&outputs[e.output].task_id))
            .collect();
        if surviving.len() > 1 && provably_independent(outputs, &surviving, store) {
            let mut patches = surviving;
            patches.sort_by_key(|e| {
                std::cmp::Reverse(mutation(outputs, *e).as_patch().map_or(0, |p| p.start))
            });
            plan.extend(patches.into_iter().map(|e| (e, true)));
        } else {
            plan.extend(surviving.into_iter().map(|e| (e, false)));
        }
    }
    plan
}

impl Integration {
    pub fn is_rolled_back(&self) -> bool {
        self.record.is_rolled_back()
    }

    pub fn conflicts(&self) -> &[ResolvedConflict] {
        &self.record.resolved_conflicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ArtifactMutation, LinePatch, Payload, Score};
    use crate::impls::InMemoryArtifactStore;
    use crate::priority::Priority;
    use ulid::Ulid;

    fn batch() -> BatchId {
        BatchId::from_ulid(Ulid::new())
    }

    fn output(id: &str, impact: u32, mutations: Vec<ArtifactMutation>) -> TaskOutput {
        TaskOutput {
            task_id: TaskId::new(id),
            priority: Priority::from_scores(
                Score::new(impact).unwrap(),
                Score::NEUTRAL,
                Score::NEUTRAL,
            ),
            depends_on: BTreeSet::new(),
            mutations,
        }
    }

    fn seeded(artifact: &str, text: &str) -> InMemoryArtifactStore {
        let mut store = InMemoryArtifactStore::new();
        let m = ArtifactMutation::create(artifact, text);
        store
            .apply(&MutationFingerprint::of(&TaskId::new("seed"), 0, &m), &m)
            .unwrap();
        store
    }

    fn patch(base: u64, start: usize, end: usize, line: &str) -> ArtifactMutation {
        ArtifactMutation::update(
            "f",
            base,
            Payload::Patch(LinePatch {
                start,
                end,
                lines: vec![line.into()],
            }),
        )
    }

    #[test]
    fn non_overlapping_patches_both_commit() {
        let mut store = seeded("f", "a\nb\nc\nd\n");
        let outputs = vec![
            output("top", 3, vec![patch(1, 0, 1, "A")]),
            output("bottom", 3, vec![patch(1, 3, 4, "D")]),
        ];

        let integration = Integrator::default().integrate(batch(), &outputs, &mut store, Utc::now());

        assert!(integration.record.resolved_conflicts.is_empty());
        assert_eq!(integration.record.committed_mutations.len(), 2);
        let artifact = store.get(&ArtifactId::new("f")).unwrap();
        assert_eq!(artifact.text(), Some("A\nb\nc\nD\n"));
        assert_eq!(artifact.version, 3);
    }

    #[test]
    fn loser_withholds_all_its_mutations_and_dependents() {
        let mut store = seeded("f", "x\n");
        let mut dependent = output("dependent", 5, vec![ArtifactMutation::create("g", "g")]);
        dependent.depends_on.insert(TaskId::new("loser"));
        let outputs = vec![
            output(
                "loser",
                1,
                vec![
                    ArtifactMutation::update("f", 1, Payload::Replace("l".into())),
                    ArtifactMutation::create("other", "o"),
                ],
            ),
            output("winner", 5, vec![ArtifactMutation::update("f", 1, Payload::Replace("w".into()))]),
            dependent,
        ];

        let integration = Integrator::default().integrate(batch(), &outputs, &mut store, Utc::now());
        let record = integration.record;

        assert_eq!(record.committed_mutations.len(), 1);
        assert!(!store.exists(&ArtifactId::new("other")));
        assert!(!store.exists(&ArtifactId::new("g")));
        assert_eq!(
            record.deferred_tasks,
            vec![
                DeferredTask {
                    task_id: TaskId::new("dependent"),
                    reason: DeferReason::BlockedBy {
                        dependency: TaskId::new("loser")
                    },
                },
                DeferredTask {
                    task_id: TaskId::new("loser"),
                    reason: DeferReason::SupersededByHigherPriority {
                        winner: TaskId::new("winner"),
                        artifact: ArtifactId::new("f"),
                    },
                },
            ]
        );
    }

    #[test]
    fn manual_review_surfaces_an_error() {
        let mut store = InMemoryArtifactStore::new();
        let outputs = vec![
            output("a", 3, vec![ArtifactMutation::create("f", "a")]),
            output("b", 3, vec![ArtifactMutation::create("f", "b")]),
        ];

        let integration = Integrator::default().integrate(batch(), &outputs, &mut store, Utc::now());

        assert!(matches!(
            integration.errors.as_slice(),
            [BraidError::ConflictUnresolvable { .. }]
        ));
        assert_eq!(integration.record.deferred_tasks.len(), 2);
        assert!(!store.exists(&ArtifactId::new("f")));
    }

    #[test]
    fn apply_failure_rolls_everything_back() {
        let mut store = seeded("f", "x\n");
        let outputs = vec![
            output("good", 3, vec![ArtifactMutation::create("a", "a")]),
            output("stale", 3, vec![ArtifactMutation::update("f", 0, Payload::Replace("y".into()))]),
        ];
        let id = batch();

        let integration = Integrator::default().integrate(id, &outputs, &mut store, Utc::now());

        assert!(integration.is_rolled_back());
        let failure = integration.record.rolled_back.clone().unwrap();
        assert_eq!(failure.task_id, TaskId::new("stale"));
        assert!(integration.record.committed_mutations.is_empty());
        assert!(!store.exists(&ArtifactId::new("a")));
        assert_eq!(store.version(&ArtifactId::new("f")), 1);
        assert!(!store.is_committed(&id));
        assert!(matches!(integration.errors.as_slice(), [BraidError::Commit(_)]));
    }

    #[test]
    fn committed_batch_is_replayed_as_noop() {
        let mut store = InMemoryArtifactStore::new();
        let outputs = vec![output("a", 3, vec![ArtifactMutation::create("a", "a")])];
        let id = batch();
        let integrator = Integrator::default();

        let first = integrator.integrate(id, &outputs, &mut store, Utc::now());
        let second = integrator.integrate(id, &outputs, &mut store, Utc::now());

        assert_eq!(first.record.committed_mutations.len(), 1);
        assert!(second.record.replayed);
        assert!(second.record.committed_mutations.is_empty());
        assert_eq!(store.version(&ArtifactId::new("a")), 1);
    }

    #[test]
    fn already_applied_mutations_are_skipped() {
        let mut store = InMemoryArtifactStore::new();
        let outputs = vec![output("a", 3, vec![ArtifactMutation::create("a", "a")])];
        let integrator = Integrator::default();

        integrator.integrate(batch(), &outputs, &mut store, Utc::now());
        let again = integrator.integrate(batch(), &outputs, &mut store, Utc::now());

        assert!(!again.is_rolled_back());
        assert_eq!(again.record.already_applied.len(), 1);
        assert!(again.record.committed_mutations.is_empty());
    }
}

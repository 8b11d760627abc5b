//! Conflict detection and resolution.
//!
//! mutation を artifact ごとにまとめ、複数 task が同じ artifact を触っていたら conflict。
//! 例外は「全部が現行 version に対する Patch で、行範囲が互いに重ならない」ときだけで、
//! 判定できないものは conflict 側に倒します（見逃すより過検出）。

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::domain::{
    ArtifactId, ArtifactMutation, ConflictLoser, ConflictRule, DeferReason, MutationKind,
    ResolvedConflict, TaskId,
};
use crate::ports::ArtifactStore;
use crate::priority::Priority;

/// What one completed task hands to the integrator.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput {
    pub task_id: TaskId,
    pub priority: Priority,
    /// Declared dependencies, used to hold back dependents of a losing task.
    pub depends_on: BTreeSet<TaskId>,
    pub mutations: Vec<ArtifactMutation>,
}

/// One mutation inside an artifact group: (index into outputs, ordinal within the task).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Entry {
    pub output: usize,
    pub ordinal: usize,
}

/// Mutations grouped by artifact, in artifact-id order.
pub(crate) fn group_by_artifact(outputs: &[TaskOutput]) -> BTreeMap<ArtifactId, Vec<Entry>> {
    let mut groups: BTreeMap<ArtifactId, Vec<Entry>> = BTreeMap::new();
    for (output, task) in outputs.iter().enumerate() {
        for (ordinal, mutation) in task.mutations.iter().enumerate() {
            groups
                .entry(mutation.artifact_id.clone())
                .or_default()
                .push(Entry { output, ordinal });
        }
    }
    groups
}

pub(crate) fn mutation<'a>(outputs: &'a [TaskOutput], entry: Entry) -> &'a ArtifactMutation {
    &outputs[entry.output].mutations[entry.ordinal]
}

pub(crate) fn contenders(entries: &[Entry]) -> BTreeSet<usize> {
    entries.iter().map(|e| e.output).collect()
}

/// True when the group's mutations can be applied in any order without
/// touching each other's lines.
pub(crate) fn provably_independent(
    outputs: &[TaskOutput],
    entries: &[Entry],
    store: &dyn ArtifactStore,
) -> bool {
    let Some(first) = entries.first() else {
        return true;
    };
    let current = store.version(&mutation(outputs, *first).artifact_id);

    let mut patches = Vec::with_capacity(entries.len());
    for entry in entries {
        let m = mutation(outputs, *entry);
        match (m.kind, m.as_patch()) {
            (MutationKind::Update, Some(patch)) if m.base_version == current => patches.push(patch),
            _ => return false,
        }
    }
    patches.iter().enumerate().all(|(i, a)| {
        patches[i + 1..]
            .iter()
            .all(|b| a.is_disjoint(b))
    })
}

/// How a task touches one artifact, for rules 2 and 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Touch {
    Create,
    Write,
    Delete,
}

fn touch_of(outputs: &[TaskOutput], output: usize, entries: &[Entry]) -> Touch {
    let kinds: Vec<MutationKind> = entries
        .iter()
        .filter(|e| e.output == output)
        .map(|e| mutation(outputs, *e).kind)
        .collect();
    if kinds.contains(&MutationKind::Delete) {
        Touch::Delete
    } else if kinds.iter().all(|k| *k == MutationKind::Create) {
        Touch::Create
    } else {
        Touch::Write
    }
}

/// Applies the fixed rule list to one conflicting artifact group.
///
/// 1. a unique highest priority wins, everyone else is superseded
/// 2. tied Creates go to manual review
/// 3. tied Delete vs Create/Update: the delete's lead is 0 here, so it wins only
///    when `delete_margin` is negative
/// 4. anything else goes to manual review
///
/// In rules 2-4 contenders below the tied top are superseded by the
/// smallest-id top task.
pub(crate) fn resolve(
    artifact: &ArtifactId,
    outputs: &[TaskOutput],
    entries: &[Entry],
    delete_margin: f64,
) -> ResolvedConflict {
    let mut ranked: Vec<usize> = contenders(entries).into_iter().collect();
    ranked.sort_by(|a, b| {
        outputs[*b]
            .priority
            .cmp(&outputs[*a].priority)
            .then_with(|| outputs[*a].task_id.cmp(&outputs[*b].task_id))
    });
    let top = outputs[ranked[0]].priority;
    let (tied, below): (Vec<usize>, Vec<usize>) = ranked
        .iter()
        .copied()
        .partition(|i| outputs[*i].priority == top);

    let id = |i: usize| outputs[i].task_id.clone();
    let superseded_by = |winner: &TaskId, losers: &[usize]| -> Vec<ConflictLoser> {
        losers
            .iter()
            .map(|i| ConflictLoser {
                task_id: id(*i),
                reason: DeferReason::SupersededByHigherPriority {
                    winner: winner.clone(),
                    artifact: artifact.clone(),
                },
            })
            .collect()
    };
    let manual_review = |tasks: &[usize]| -> Vec<ConflictLoser> {
        tasks
            .iter()
            .map(|i| ConflictLoser {
                task_id: id(*i),
                reason: DeferReason::ManualReviewRequired {
                    artifact: artifact.clone(),
                },
            })
            .collect()
    };

    // Rule 1
    if tied.len() == 1 {
        let winner = id(tied[0]);
        return ResolvedConflict {
            artifact_id: artifact.clone(),
            rule: ConflictRule::HigherPriority,
            losers: superseded_by(&winner, &below),
            winner: Some(winner),
        };
    }

    let head = id(tied[0]);
    let mut losers = superseded_by(&head, &below);
    let touches: Vec<(usize, Touch)> = tied
        .iter()
        .map(|i| (*i, touch_of(outputs, *i, entries)))
        .collect();

    // Rule 2
    if touches.iter().all(|(_, t)| *t == Touch::Create) {
        losers.extend(manual_review(&tied));
        return ResolvedConflict {
            artifact_id: artifact.clone(),
            rule: ConflictRule::CreateCollision,
            winner: None,
            losers,
        };
    }

    // Rule 3
    let deletes: Vec<usize> = touches
        .iter()
        .filter(|(_, t)| *t == Touch::Delete)
        .map(|(i, _)| *i)
        .collect();
    let writes: Vec<usize> = touches
        .iter()
        .filter(|(_, t)| *t != Touch::Delete)
        .map(|(i, _)| *i)
        .collect();
    if !deletes.is_empty() && !writes.is_empty() {
        let best_write = writes
            .iter()
            .map(|i| outputs[*i].priority)
            .max()
            .unwrap_or(top);
        let lead = outputs[deletes[0]].priority.lead_over(best_write);
        let (winners, beaten) = if lead > delete_margin {
            (deletes, writes)
        } else {
            (writes, deletes)
        };
        if let [winner] = winners.as_slice() {
            let winner = id(*winner);
            losers.extend(beaten.iter().map(|i| ConflictLoser {
                task_id: id(*i),
                reason: DeferReason::DeleteConflict {
                    winner: winner.clone(),
                    artifact: artifact.clone(),
                },
            }));
            debug!(artifact = %artifact, winner = %winner, lead, delete_margin, "delete conflict resolved");
            return ResolvedConflict {
                artifact_id: artifact.clone(),
                rule: ConflictRule::DeleteVersusWrite,
                winner: Some(winner),
                losers,
            };
        }
    }

    // Rule 4
    losers.extend(manual_review(&tied));
    ResolvedConflict {
        artifact_id: artifact.clone(),
        rule: ConflictRule::Unresolvable,
        winner: None,
        losers,
    }
}

/// Tasks in the batch that (transitively) depend on a withheld task.
///
/// Returns `(dependent, withheld dependency)` pairs in discovery order.
pub(crate) fn withheld_dependents(
    outputs: &[TaskOutput],
    withheld: &BTreeSet<TaskId>,
) -> Vec<(TaskId, TaskId)> {
    let mut blocked: BTreeSet<TaskId> = withheld.clone();
    let mut found = Vec::new();
    loop {
        let next: Vec<(TaskId, TaskId)> = outputs
            .iter()
            .filter(|o| !blocked.contains(&o.task_id))
            .filter_map(|o| {
                o.depends_on
                    .iter()
                    .find(|dep| blocked.contains(*dep))
                    .map(|dep| (o.task_id.clone(), dep.clone()))
            })
            .collect();
        if next.is_empty() {
            return found;
        }
        for (task, dep) in next {
            blocked.insert(task.clone());
            found.push((task, dep));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LinePatch, Payload, Score};
    use crate::impls::InMemoryArtifactStore;
    use rstest::rstest;

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

    fn patch(base: u64, start: usize, end: usize) -> ArtifactMutation {
        ArtifactMutation::update(
            "f",
            base,
            Payload::Patch(LinePatch {
                start,
                end,
                lines: vec!["x".into()],
            }),
        )
    }

    fn resolve_all(outputs: &[TaskOutput], margin: f64) -> ResolvedConflict {
        let groups = group_by_artifact(outputs);
        let (artifact, entries) = groups.iter().next().unwrap();
        resolve(artifact, outputs, entries, margin)
    }

    fn loser_ids(conflict: &ResolvedConflict) -> Vec<&str> {
        conflict.losers.iter().map(|l| l.task_id.as_str()).collect()
    }

    #[rstest]
    #[case::disjoint(vec![patch(0, 0, 2), patch(0, 5, 6)], true)]
    #[case::overlapping(vec![patch(0, 0, 3), patch(0, 2, 4)], false)]
    #[case::same_insertion_point(vec![patch(0, 3, 3), patch(0, 3, 3)], false)]
    #[case::stale_base(vec![patch(1, 0, 2), patch(1, 5, 6)], false)]
    #[case::replace(vec![patch(0, 0, 2), ArtifactMutation::update("f", 0, Payload::Replace("y".into()))], false)]
    fn independence(#[case] mutations: Vec<ArtifactMutation>, #[case] expected: bool) {
        let outputs: Vec<TaskOutput> = mutations
            .into_iter()
            .enumerate()
            .map(|(i, m)| output(&format!("t{i}"), 3, vec![m]))
            .collect();
        let store = InMemoryArtifactStore::new();
        let groups = group_by_artifact(&outputs);
        let entries = &groups[&ArtifactId::new("f")];
        assert_eq!(provably_independent(&outputs, entries, &store), expected);
    }

    #[test]
    fn rule_one_highest_priority_wins() {
        let outputs = vec![
            output("low", 2, vec![ArtifactMutation::update("f", 1, Payload::Replace("a".into()))]),
            output("high", 5, vec![ArtifactMutation::update("f", 1, Payload::Replace("b".into()))]),
        ];
        let conflict = resolve_all(&outputs, 0.0);
        assert_eq!(conflict.rule, ConflictRule::HigherPriority);
        assert_eq!(conflict.winner, Some(TaskId::new("high")));
        assert_eq!(
            conflict.losers[0].reason,
            DeferReason::SupersededByHigherPriority {
                winner: TaskId::new("high"),
                artifact: ArtifactId::new("f"),
            }
        );
    }

    #[test]
    fn rule_two_tied_creates_need_review() {
        let outputs = vec![
            output("a", 3, vec![ArtifactMutation::create("f", "a")]),
            output("b", 3, vec![ArtifactMutation::create("f", "b")]),
            output("c", 1, vec![ArtifactMutation::create("f", "c")]),
        ];
        let conflict = resolve_all(&outputs, 0.0);
        assert_eq!(conflict.rule, ConflictRule::CreateCollision);
        assert_eq!(conflict.winner, None);
        assert_eq!(loser_ids(&conflict), vec!["c", "a", "b"]);
        assert!(matches!(
            conflict.losers[0].reason,
            DeferReason::SupersededByHigherPriority { .. }
        ));
        assert!(matches!(
            conflict.losers[1].reason,
            DeferReason::ManualReviewRequired { .. }
        ));
    }

    #[rstest]
    #[case::delete_loses_a_tie(0.0, "writer", "deleter")]
    #[case::negative_margin_lets_delete_win(-1.0, "deleter", "writer")]
    fn rule_three_delete_versus_write(
        #[case] margin: f64,
        #[case] winner: &str,
        #[case] loser: &str,
    ) {
        let outputs = vec![
            output("deleter", 3, vec![ArtifactMutation::delete("f", 1)]),
            output("writer", 3, vec![ArtifactMutation::update("f", 1, Payload::Replace("w".into()))]),
        ];
        let conflict = resolve_all(&outputs, margin);
        assert_eq!(conflict.rule, ConflictRule::DeleteVersusWrite);
        assert_eq!(conflict.winner, Some(TaskId::new(winner)));
        assert_eq!(loser_ids(&conflict), vec![loser]);
        assert!(matches!(
            conflict.losers[0].reason,
            DeferReason::DeleteConflict { .. }
        ));
    }

    #[test]
    fn higher_priority_delete_wins_by_rule_one_whatever_the_margin() {
        let outputs = vec![
            output("deleter", 5, vec![ArtifactMutation::delete("f", 1)]),
            output("writer", 3, vec![ArtifactMutation::update("f", 1, Payload::Replace("w".into()))]),
        ];
        let conflict = resolve_all(&outputs, 10.0);
        assert_eq!(conflict.rule, ConflictRule::HigherPriority);
        assert_eq!(conflict.winner, Some(TaskId::new("deleter")));
        assert_eq!(loser_ids(&conflict), vec!["writer"]);
    }

    #[test]
    fn rule_four_tied_updates_need_review() {
        let outputs = vec![
            output("a", 3, vec![patch(1, 0, 3)]),
            output("b", 3, vec![patch(1, 2, 4)]),
        ];
        let conflict = resolve_all(&outputs, 0.0);
        assert_eq!(conflict.rule, ConflictRule::Unresolvable);
        assert_eq!(conflict.winner, None);
        assert_eq!(loser_ids(&conflict), vec!["a", "b"]);
    }

    #[test]
    fn dependents_of_withheld_tasks_are_found_transitively() {
        let mut a = output("a", 3, vec![]);
        let mut b = output("b", 3, vec![]);
        let c = output("c", 3, vec![]);
        a.depends_on.insert(TaskId::new("loser"));
        b.depends_on.insert(TaskId::new("a"));
        let withheld = BTreeSet::from([TaskId::new("loser")]);

        let found = withheld_dependents(&[a, b, c], &withheld);
        assert_eq!(
            found,
            vec![
                (TaskId::new("a"), TaskId::new("loser")),
                (TaskId::new("b"), TaskId::new("a")),
            ]
        );
    }
}

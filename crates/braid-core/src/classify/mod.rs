//! Classifier: raw source units → scored, tagged tasks.
//!
//! Classification never aborts an intake. A malformed unit or item is
//! reported in [`Intake::errors`] and skipped; everything else goes through.
//! Dependency references are resolved best-effort against tasks already
//! known to the engine and tasks from the same intake.

mod keywords;
mod parse;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::domain::{CapabilityTag, Score, SourceUnit, Task, TaskId};
use crate::error::ClassificationError;

pub use keywords::{KeywordRule, KeywordTable};
pub use parse::slug;

use parse::{Directives, RawItem};

/// Result of one intake.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Intake {
    pub tasks: Vec<Task>,
    pub warnings: Vec<ClassificationWarning>,
    pub errors: Vec<ClassificationError>,
}

/// Non-fatal findings. The task is still produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum ClassificationWarning {
    UnresolvedDependency { task: TaskId, reference: String },
    SelfDependency { task: TaskId },
}

impl fmt::Display for ClassificationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnresolvedDependency { task, reference } => {
                write!(f, "{task}: could not resolve dependency \"{reference}\"")
            }
            Self::SelfDependency { task } => write!(f, "{task}: task depends on itself (ignored)"),
        }
    }
}

/// Ids and titles the engine already knows, used for dependency resolution
/// and id uniqueness.
#[derive(Debug, Default, Clone)]
pub struct KnownTasks {
    ids: BTreeSet<TaskId>,
    titles: BTreeMap<String, TaskId>,
    next_order: u64,
}

impl KnownTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut known = Self::new();
        for task in tasks {
            known.insert(task);
        }
        known
    }

    pub fn insert(&mut self, task: &Task) {
        self.ids.insert(task.id.clone());
        self.titles
            .entry(slug(&task.title))
            .or_insert_with(|| task.id.clone());
        self.next_order = self.next_order.max(task.source_order + 1);
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.ids.contains(id)
    }

    /// source_order the next classified task gets.
    pub fn next_order(&self) -> u64 {
        self.next_order
    }

    fn resolve(&self, reference: &str) -> Option<TaskId> {
        if let Some(id) = self.ids.get(reference) {
            return Some(id.clone());
        }
        if let Some(id) = self
            .ids
            .iter()
            .find(|id| id.as_str().eq_ignore_ascii_case(reference))
        {
            return Some(id.clone());
        }
        let slugged = slug(reference);
        if slugged.is_empty() {
            return None;
        }
        if let Some(id) = self.ids.get(slugged.as_str()) {
            return Some(id.clone());
        }
        self.titles.get(&slugged).cloned()
    }

    fn fresh_id(&self, title: &str) -> TaskId {
        let base = match slug(title) {
            s if s.is_empty() => "task".to_string(),
            s => s,
        };
        if !self.ids.contains(base.as_str()) {
            return TaskId::new(base);
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base}-{n}");
            if !self.ids.contains(candidate.as_str()) {
                return TaskId::new(candidate);
            }
            n += 1;
        }
    }
}

struct Pending {
    task: Task,
    references: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Classifier {
    keywords: KeywordTable,
}

impl Classifier {
    pub fn new(keywords: KeywordTable) -> Self {
        Self { keywords }
    }

    pub fn keywords(&self) -> &KeywordTable {
        &self.keywords
    }

    #[instrument(skip_all, fields(units = units.len()))]
    pub fn classify(&self, units: &[SourceUnit], known: &KnownTasks) -> Intake {
        let mut working = known.clone();
        let mut intake = Intake::default();
        let mut pending = Vec::new();

        for unit in units {
            if unit.text.trim().is_empty() {
                intake.errors.push(ClassificationError::EmptyUnit {
                    origin: unit.origin.clone(),
                });
                continue;
            }

            let items = parse::split_items(&unit.text);
            let numbered = items.len() > 1;
            for (n, item) in items.iter().enumerate() {
                let origin = if numbered {
                    format!("{}#{}", unit.origin, n + 1)
                } else {
                    unit.origin.clone()
                };
                match self.build_task(item, origin, &working) {
                    Ok(p) => {
                        debug!(task = %p.task.id, tags = ?p.task.tags, "classified");
                        working.insert(&p.task);
                        pending.push(p);
                    }
                    Err(e) => {
                        debug!(error = %e, "item rejected");
                        intake.errors.push(e);
                    }
                }
            }
        }

        // 同じ intake 内の後続タスクも参照できるよう、解決は全件パース後に行う
        for Pending {
            mut task,
            references,
        } in pending
        {
            for reference in references {
                match working.resolve(&reference) {
                    Some(id) if id == task.id => {
                        intake
                            .warnings
                            .push(ClassificationWarning::SelfDependency { task: task.id.clone() });
                    }
                    Some(id) => {
                        task.depends_on.insert(id);
                    }
                    None => {
                        intake.warnings.push(ClassificationWarning::UnresolvedDependency {
                            task: task.id.clone(),
                            reference: reference.clone(),
                        });
                        task.dependency_hints.push(reference);
                    }
                }
            }
            intake.tasks.push(task);
        }

        intake
    }

    fn build_task(
        &self,
        item: &RawItem,
        origin: String,
        working: &KnownTasks,
    ) -> Result<Pending, ClassificationError> {
        let mut directives = Directives::default();
        let title_line = parse::strip_directives(&item.title_line, &mut directives);
        let description = item
            .description
            .lines()
            .map(|line| parse::strip_directives(line, &mut directives))
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        let title = parse::clean_title(&title_line);
        if title.is_empty() {
            return Err(ClassificationError::MissingTitle { origin });
        }

        let full_text = format!("{title_line}\n{description}");
        let references = parse::dependency_refs(&full_text);

        let impact = score(&origin, "impact", directives.impact.as_deref(), || {
            keywords::impact_hint(&full_text)
        })?;
        let effort = score(&origin, "effort", directives.effort.as_deref(), || {
            keywords::effort_hint(&full_text)
        })?;
        let risk = score(&origin, "risk", directives.risk.as_deref(), || {
            keywords::risk_hint(&full_text)
        })?;

        let mut tags: Vec<CapabilityTag> = directives
            .tags
            .iter()
            .map(CapabilityTag::new)
            .filter(|tag| !tag.is_empty())
            .collect();
        if tags.is_empty() {
            tags.extend(self.keywords.infer_tag(&full_text));
        }
        if tags.is_empty() {
            return Err(ClassificationError::NoCapabilityTags { origin, title });
        }

        let id = match directives.id {
            Some(explicit) => {
                let id = TaskId::new(explicit);
                if working.contains(&id) {
                    return Err(ClassificationError::DuplicateId { origin, id });
                }
                id
            }
            None => working.fresh_id(&title),
        };

        let mut task = Task::new(id, title, tags)
            .with_scores(impact, effort, risk)
            .with_source(origin, working.next_order());
        task.description = description;

        Ok(Pending { task, references })
    }
}

/// 明示値があれば検証、なければキーワードから推定
fn score(
    origin: &str,
    field: &'static str,
    explicit: Option<&str>,
    hint: impl FnOnce() -> Score,
) -> Result<Score, ClassificationError> {
    let Some(raw) = explicit else {
        return Ok(hint());
    };
    raw.parse::<u32>()
        .ok()
        .and_then(|value| Score::new(value).ok())
        .ok_or_else(|| ClassificationError::InvalidScore {
            origin: origin.to_string(),
            field,
            value: raw.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(text: &str) -> Intake {
        Classifier::default().classify(&[SourceUnit::new(text, "notes.md")], &KnownTasks::new())
    }

    fn ids(intake: &Intake) -> Vec<&str> {
        intake.tasks.iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn list_unit_yields_one_task_per_item() {
        let intake = classify("- Fix crash on save\n- Write README section #documentation\n");
        assert!(intake.errors.is_empty());
        assert_eq!(ids(&intake), vec!["fix-crash-on-save", "write-readme-section"]);
        assert_eq!(intake.tasks[0].source_ref, "notes.md#1");
        assert_eq!(intake.tasks[1].source_ref, "notes.md#2");
        assert_eq!(intake.tasks[0].source_order, 0);
        assert_eq!(intake.tasks[1].source_order, 1);
        assert!(intake.tasks[1].tags.contains(&CapabilityTag::new("documentation")));
    }

    #[test]
    fn issue_reference_does_not_block_tag_inference() {
        let intake = classify("Fix crash on save, see #412");
        assert!(intake.errors.is_empty());
        let tags: Vec<&str> = intake.tasks[0].tags.iter().map(|t| t.as_str()).collect();
        assert_eq!(tags, vec!["bug-fix"]);
    }

    #[test]
    fn explicit_directives_win_over_inference() {
        let intake = classify("Fix crash [id: crash-1] #backend impact=2 effort=1 risk=4");
        let task = &intake.tasks[0];
        assert_eq!(task.id.as_str(), "crash-1");
        assert_eq!(task.title, "Fix crash");
        assert_eq!(task.tags.iter().map(|t| t.as_str()).collect::<Vec<_>>(), vec!["backend"]);
        assert_eq!(
            (task.impact.get(), task.effort.get(), task.risk.get()),
            (2, 1, 4)
        );
    }

    #[test]
    fn scores_fall_back_to_hints_then_neutral() {
        let intake = classify("Critical crash in login #bug-fix");
        let task = &intake.tasks[0];
        assert_eq!(task.impact.get(), 5);
        assert_eq!(task.effort.get(), 3);
    }

    #[test]
    fn invalid_score_rejects_only_that_item() {
        let intake = classify("- Add tests impact=9\n- Add more tests\n");
        assert_eq!(ids(&intake), vec!["add-more-tests"]);
        assert!(matches!(
            &intake.errors[..],
            [ClassificationError::InvalidScore { field: "impact", value, .. }] if value == "9"
        ));
    }

    #[test]
    fn empty_unit_and_untaggable_item_are_reported() {
        let intake = Classifier::default().classify(
            &[
                SourceUnit::new("   \n", "a.md"),
                SourceUnit::new("Think about lunch", "b.md"),
            ],
            &KnownTasks::new(),
        );
        assert!(intake.tasks.is_empty());
        assert!(matches!(
            &intake.errors[..],
            [
                ClassificationError::EmptyUnit { .. },
                ClassificationError::NoCapabilityTags { .. }
            ]
        ));
    }

    #[test]
    fn title_made_only_of_directives_is_rejected() {
        let intake = classify("#testing impact=3");
        assert!(matches!(
            &intake.errors[..],
            [ClassificationError::MissingTitle { .. }]
        ));
    }

    #[test]
    fn dependencies_resolve_forward_within_intake() {
        let intake = classify(
            "- Deploy the api (blocked by Set up database)\n- Set up database #backend\n",
        );
        assert!(intake.warnings.is_empty());
        let deploy = &intake.tasks[0];
        assert_eq!(deploy.title, "Deploy the api");
        assert!(deploy.depends_on.contains("set-up-database"));
    }

    #[test]
    fn dependencies_resolve_against_known_ids_case_insensitively() {
        let known = KnownTasks::from_tasks(&[Task::new("DB-1", "Schema", ["backend"]).with_source("x", 7)]);
        let intake = Classifier::default().classify(
            &[SourceUnit::new("Add endpoint, depends on db-1", "n.md")],
            &known,
        );
        let task = &intake.tasks[0];
        assert!(task.depends_on.contains("DB-1"));
        assert_eq!(task.source_order, 8);
    }

    #[test]
    fn unresolved_and_self_references_become_warnings() {
        let intake = classify("Add endpoint [id: ep] depends on ep, ghost-task");
        let task = &intake.tasks[0];
        assert!(task.depends_on.is_empty());
        assert_eq!(task.dependency_hints, vec!["ghost-task".to_string()]);
        assert_eq!(
            intake.warnings,
            vec![
                ClassificationWarning::SelfDependency { task: TaskId::new("ep") },
                ClassificationWarning::UnresolvedDependency {
                    task: TaskId::new("ep"),
                    reference: "ghost-task".into(),
                },
            ]
        );
    }

    #[test]
    fn duplicate_explicit_id_is_rejected_and_slugs_get_suffixes() {
        let intake = classify(
            "- Add tests [id: t1]\n- Add tests for parser [id: t1]\n- Add tests\n- Add tests\n",
        );
        assert_eq!(ids(&intake), vec!["t1", "add-tests", "add-tests-2"]);
        assert!(matches!(
            &intake.errors[..],
            [ClassificationError::DuplicateId { id, .. }] if id.as_str() == "t1"
        ));
    }

    #[test]
    fn continuation_lines_form_the_description() {
        let intake = classify("- Speed up build\n  cache the deps #performance\n  effort=2\n");
        let task = &intake.tasks[0];
        assert_eq!(task.description, "cache the deps");
        assert_eq!(task.effort.get(), 2);
        assert!(task.tags.contains(&CapabilityTag::new("performance")));
    }
}

//! Task and phase definitions for the orc engine.
//!
//! This module provides:
//! - `Task` — the unit of work handed to the driver
//! - `Weight` — categorical size controlling iteration budgets and validators
//! - `PhaseSpec` — a single workflow step with its prompt source and deps
//! - `order_phases` — deterministic topological ordering with cycle detection

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::errors::DriverError;

/// Categorical task size. Controls default iteration budgets, whether a spec
/// is required up front, and which validators opt in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Weight {
    Trivial,
    #[default]
    Small,
    Medium,
    Large,
}

impl Weight {
    /// Trivial tasks skip the spec precondition.
    pub fn requires_spec(&self) -> bool {
        !matches!(self, Self::Trivial)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trivial => "trivial",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

impl std::fmt::Display for Weight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Change-request overrides carried on a task. The `*_set` flags distinguish
/// "explicitly set to empty" from "not set" so a task can clear config
/// defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PrOverrides {
    #[serde(default)]
    pub draft: Option<bool>,
    #[serde(default)]
    pub labels_set: bool,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub reviewers_set: bool,
    #[serde(default)]
    pub reviewers: Vec<String>,
}

/// The unit of work. Created by the caller; the driver only mutates
/// phase-status bookkeeping derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub weight: Weight,
    #[serde(default)]
    pub category: String,
    pub branch: String,
    #[serde(default)]
    pub initiative_id: Option<String>,
    #[serde(default)]
    pub requires_ui_testing: bool,
    #[serde(default)]
    pub is_automation: bool,
    #[serde(default)]
    pub pr_overrides: PrOverrides,
}

impl Task {
    pub fn new(id: &str, title: &str, weight: Weight, branch: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: String::new(),
            weight,
            category: String::new(),
            branch: branch.to_string(),
            initiative_id: None,
            requires_ui_testing: false,
            is_automation: false,
            pr_overrides: PrOverrides::default(),
        }
    }
}

/// Where a phase's prompt template comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PromptSource {
    /// Prompt text carried on the phase itself.
    Inline { text: String },
    /// Compiled-in template at `prompts/{phase}.md`.
    Embedded,
    /// Template file on disk.
    File { path: String },
    /// Template stored in the backend artifact store.
    Database,
}

impl Default for PromptSource {
    fn default() -> Self {
        Self::Embedded
    }
}

/// One workflow step. Phases form a DAG per task via `depends_on`, with
/// `sequence` as the stable tiebreak for ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub id: String,
    #[serde(default)]
    pub prompt_source: PromptSource,
    #[serde(default)]
    pub produces_artifact: bool,
    pub max_iterations: u32,
    #[serde(default)]
    pub model_override: Option<String>,
    #[serde(default)]
    pub thinking_override: Option<bool>,
    /// Raw JSON array of phase ids, as stored in the backend. Parsed by
    /// `parse_depends_on`; malformed JSON is fatal.
    #[serde(default)]
    pub depends_on: Option<String>,
    #[serde(default)]
    pub sequence: i32,
    /// Runtime control flow; never a dependency edge.
    #[serde(default)]
    pub retry_from_phase: Option<String>,
    /// Runtime control flow; never a dependency edge.
    #[serde(default)]
    pub loop_config: Option<serde_json::Value>,
}

impl PhaseSpec {
    pub fn new(id: &str, max_iterations: u32, sequence: i32) -> Self {
        Self {
            id: id.to_string(),
            prompt_source: PromptSource::Embedded,
            produces_artifact: false,
            max_iterations,
            model_override: None,
            thinking_override: None,
            depends_on: None,
            sequence,
            retry_from_phase: None,
            loop_config: None,
        }
    }

    pub fn with_artifact(mut self) -> Self {
        self.produces_artifact = true;
        self
    }

    pub fn with_depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = Some(
            serde_json::to_string(&deps.iter().collect::<Vec<_>>())
                .expect("string slice serializes"),
        );
        self
    }

    /// Parse the raw `depends_on` JSON into phase ids.
    ///
    /// `None`/empty means no dependencies; malformed JSON is a fatal error.
    pub fn parse_depends_on(&self) -> Result<Vec<String>, DriverError> {
        match self.depends_on.as_deref() {
            None | Some("") => Ok(Vec::new()),
            Some(raw) => {
                serde_json::from_str(raw).map_err(|source| DriverError::MalformedDependsOn {
                    phase: self.id.clone(),
                    source,
                })
            }
        }
    }

    /// Decision phases (reviews, QA verdicts) default extended thinking on.
    pub fn is_decision_phase(&self) -> bool {
        matches!(self.id.as_str(), "review" | "qa" | "validate")
    }
}

/// Topologically order phases by `depends_on`, using `(sequence, id)` as the
/// stable tiebreak so repeated sorts are byte-identical.
///
/// Dependencies on phase ids absent from the input are ignored. A cycle is a
/// fatal error naming the involved phase ids.
pub fn order_phases(phases: &[PhaseSpec]) -> Result<Vec<PhaseSpec>, DriverError> {
    let by_id: HashMap<&str, &PhaseSpec> =
        phases.iter().map(|p| (p.id.as_str(), p)).collect();

    // In-degree over edges that exist in the input.
    let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for phase in phases {
        let deps = phase.parse_depends_on()?;
        let present: Vec<&str> = deps
            .iter()
            .filter_map(|d| by_id.get_key_value(d.as_str()).map(|(k, _)| *k))
            .collect();
        indegree.insert(phase.id.as_str(), present.len());
        for dep in present {
            dependents.entry(dep).or_default().push(phase.id.as_str());
        }
    }

    // Kahn's algorithm with a sorted ready set for determinism.
    let mut ready: Vec<&PhaseSpec> = phases
        .iter()
        .filter(|p| indegree[p.id.as_str()] == 0)
        .collect();
    sort_stable(&mut ready);

    let mut ordered = Vec::with_capacity(phases.len());
    while let Some(next) = ready.first().copied() {
        ready.remove(0);
        ordered.push(next.clone());
        if let Some(deps) = dependents.get(next.id.as_str()) {
            for dep_id in deps {
                let count = indegree.get_mut(dep_id).expect("known phase");
                *count -= 1;
                if *count == 0 {
                    ready.push(by_id[dep_id]);
                }
            }
        }
        sort_stable(&mut ready);
    }

    if ordered.len() != phases.len() {
        let placed: HashSet<&str> = ordered.iter().map(|p| p.id.as_str()).collect();
        let mut remaining: Vec<String> = phases
            .iter()
            .filter(|p| !placed.contains(p.id.as_str()))
            .map(|p| p.id.clone())
            .collect();
        remaining.sort();
        return Err(DriverError::DependencyCycle { phases: remaining });
    }

    Ok(ordered)
}

fn sort_stable(ready: &mut [&PhaseSpec]) {
    ready.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.id.cmp(&b.id)));
}

/// The default workflow for a task weight. Callers can pass their own phase
/// list; this covers the common paths.
pub fn default_phases(weight: Weight) -> Vec<PhaseSpec> {
    match weight {
        Weight::Trivial => vec![
            PhaseSpec::new("implement", 15, 1),
            PhaseSpec::new("test", 10, 2).with_depends_on(&["implement"]),
        ],
        Weight::Small => vec![
            PhaseSpec::new("research", 5, 1).with_artifact(),
            PhaseSpec::new("spec", 8, 2).with_artifact().with_depends_on(&["research"]),
            PhaseSpec::new("implement", 20, 3).with_depends_on(&["spec"]),
            PhaseSpec::new("test", 10, 4).with_depends_on(&["implement"]),
        ],
        Weight::Medium | Weight::Large => vec![
            PhaseSpec::new("research", 8, 1).with_artifact(),
            PhaseSpec::new("spec", 10, 2).with_artifact().with_depends_on(&["research"]),
            PhaseSpec::new("breakdown", 8, 3)
                .with_artifact()
                .with_depends_on(&["spec"]),
            PhaseSpec::new("implement", 30, 4).with_depends_on(&["breakdown"]),
            PhaseSpec::new("test", 15, 5).with_depends_on(&["implement"]),
            PhaseSpec::new("review", 10, 6).with_depends_on(&["test"]),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase(id: &str, seq: i32, deps: &[&str]) -> PhaseSpec {
        let p = PhaseSpec::new(id, 5, seq);
        if deps.is_empty() { p } else { p.with_depends_on(deps) }
    }

    fn ids(phases: &[PhaseSpec]) -> Vec<&str> {
        phases.iter().map(|p| p.id.as_str()).collect()
    }

    // =========================================
    // Ordering tests
    // =========================================

    #[test]
    fn linear_chain_orders_by_dependency() {
        let phases = vec![
            phase("implement", 3, &["spec"]),
            phase("spec", 2, &["research"]),
            phase("research", 1, &[]),
        ];
        let ordered = order_phases(&phases).unwrap();
        assert_eq!(ids(&ordered), vec!["research", "spec", "implement"]);
    }

    #[test]
    fn sequence_breaks_ties_deterministically() {
        let phases = vec![
            phase("docs", 5, &[]),
            phase("research", 1, &[]),
            phase("spec", 2, &[]),
        ];
        let ordered = order_phases(&phases).unwrap();
        assert_eq!(ids(&ordered), vec!["research", "spec", "docs"]);
    }

    #[test]
    fn repeated_sorts_are_identical() {
        let phases = vec![
            phase("a", 2, &[]),
            phase("b", 2, &[]),
            phase("c", 1, &["a", "b"]),
            phase("d", 3, &["a"]),
        ];
        let first = ids(&order_phases(&phases).unwrap())
            .join(",");
        for _ in 0..10 {
            let again = ids(&order_phases(&phases).unwrap()).join(",");
            assert_eq!(first, again);
        }
    }

    #[test]
    fn dependencies_appear_before_dependents() {
        let phases = vec![
            phase("review", 6, &["test", "implement"]),
            phase("test", 5, &["implement"]),
            phase("implement", 4, &["spec"]),
            phase("spec", 2, &[]),
            phase("research", 1, &[]),
        ];
        let ordered = order_phases(&phases).unwrap();
        let pos: HashMap<&str, usize> = ordered
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.as_str(), i))
            .collect();
        for p in &ordered {
            for dep in p.parse_depends_on().unwrap() {
                if let Some(dep_pos) = pos.get(dep.as_str()) {
                    assert!(dep_pos < &pos[p.id.as_str()], "{dep} must precede {}", p.id);
                }
            }
        }
    }

    #[test]
    fn missing_dependency_is_ignored() {
        let phases = vec![phase("implement", 1, &["nonexistent"])];
        let ordered = order_phases(&phases).unwrap();
        assert_eq!(ids(&ordered), vec!["implement"]);
    }

    #[test]
    fn cycle_is_fatal_and_names_phases() {
        let phases = vec![
            phase("a", 1, &["b"]),
            phase("b", 2, &["a"]),
            phase("c", 3, &[]),
        ];
        let err = order_phases(&phases).unwrap_err();
        match err {
            DriverError::DependencyCycle { phases } => {
                assert_eq!(phases, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected DependencyCycle, got {other}"),
        }
    }

    #[test]
    fn malformed_depends_on_is_fatal() {
        let mut p = PhaseSpec::new("implement", 5, 1);
        p.depends_on = Some("{not an array".into());
        let err = order_phases(&[p]).unwrap_err();
        assert!(matches!(err, DriverError::MalformedDependsOn { .. }));
    }

    #[test]
    fn retry_from_phase_is_not_an_edge() {
        let mut implement = phase("implement", 2, &[]);
        implement.retry_from_phase = Some("spec".into());
        let phases = vec![implement, phase("spec", 1, &[])];
        let ordered = order_phases(&phases).unwrap();
        // Ordered by sequence only; retry_from_phase added no edge.
        assert_eq!(ids(&ordered), vec!["spec", "implement"]);
    }

    // =========================================
    // Model tests
    // =========================================

    #[test]
    fn weight_spec_requirement() {
        assert!(!Weight::Trivial.requires_spec());
        assert!(Weight::Small.requires_spec());
        assert!(Weight::Medium.requires_spec());
        assert!(Weight::Large.requires_spec());
    }

    #[test]
    fn weight_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Weight::Medium).unwrap(), "\"medium\"");
        let w: Weight = serde_json::from_str("\"trivial\"").unwrap();
        assert_eq!(w, Weight::Trivial);
    }

    #[test]
    fn task_deserializes_with_defaults() {
        let json = r#"{"id": "t-1", "title": "Add search", "branch": "orc/t-1"}"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.weight, Weight::Small);
        assert!(!task.requires_ui_testing);
        assert!(task.pr_overrides.draft.is_none());
        assert!(!task.pr_overrides.labels_set);
    }

    #[test]
    fn decision_phases() {
        assert!(PhaseSpec::new("review", 5, 1).is_decision_phase());
        assert!(PhaseSpec::new("qa", 5, 1).is_decision_phase());
        assert!(!PhaseSpec::new("implement", 5, 1).is_decision_phase());
    }

    #[test]
    fn default_phases_order_cleanly() {
        for weight in [Weight::Trivial, Weight::Small, Weight::Medium, Weight::Large] {
            let phases = default_phases(weight);
            let ordered = order_phases(&phases).unwrap();
            assert_eq!(ordered.len(), phases.len());
        }
    }
}

//! Workflow definitions
//!
//! A definition is a versioned, immutable graph of steps. Activating a
//! definition freezes it; edits create a new version row. The engine only
//! ever starts executions from Active definitions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::step::StepKind;
use crate::variables::VariableDecl;

/// Lifecycle of a definition version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    Draft,
    Active,
    Retired,
}

impl std::fmt::Display for DefinitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Active => write!(f, "active"),
            Self::Retired => write!(f, "retired"),
        }
    }
}

/// One node in the step graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDef {
    pub index: i32,
    pub name: String,
    #[serde(flatten)]
    pub kind: StepKind,
}

/// Structural problems detected by [`WorkflowDefinition::validate`]
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("definition has no steps")]
    Empty,

    #[error("first step must be a start step")]
    FirstStepNotStart,

    #[error("definition has {0} start steps, expected exactly one")]
    MultipleStartSteps(usize),

    #[error("step indexes must be dense and start at 0 (found {0})")]
    NonContiguousIndexes(i32),

    #[error("switch at step {step} targets missing step {target}")]
    BranchTargetOutOfRange { step: i32, target: i32 },

    #[error("step {step} is missing required configuration: {reason}")]
    MissingConfig { step: i32, reason: String },
}

/// A versioned workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub version: i32,
    pub status: DefinitionStatus,
    #[serde(default)]
    pub variables: Vec<VariableDecl>,
    pub steps: Vec<StepDef>,
}

impl WorkflowDefinition {
    pub fn step(&self, index: i32) -> Option<&StepDef> {
        self.steps.iter().find(|s| s.index == index)
    }

    pub fn variable_decl(&self, name: &str) -> Option<&VariableDecl> {
        self.variables.iter().find(|d| d.name == name)
    }

    /// Structural validation run before a definition is activated and
    /// again defensively at start() time (definitions are stored as
    /// documents, so a hand-edited row could be malformed).
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.steps.is_empty() {
            return Err(DefinitionError::Empty);
        }

        // Dense, zero-based indexes so "advance to index + 1" is total
        let mut sorted: Vec<i32> = self.steps.iter().map(|s| s.index).collect();
        sorted.sort_unstable();
        for (pos, index) in sorted.iter().enumerate() {
            if *index != pos as i32 {
                return Err(DefinitionError::NonContiguousIndexes(*index));
            }
        }

        let starts = self
            .steps
            .iter()
            .filter(|s| matches!(s.kind, StepKind::Start(_)))
            .count();
        if starts != 1 {
            return Err(DefinitionError::MultipleStartSteps(starts));
        }
        if !matches!(self.step(0).map(|s| &s.kind), Some(StepKind::Start(_))) {
            return Err(DefinitionError::FirstStepNotStart);
        }

        let max_index = self.steps.len() as i32 - 1;
        for step in &self.steps {
            if let StepKind::Switch(cfg) = &step.kind {
                for case in &cfg.cases {
                    if case.target < 0 || case.target > max_index {
                        return Err(DefinitionError::BranchTargetOutOfRange {
                            step: step.index,
                            target: case.target,
                        });
                    }
                }
                if let Some(target) = cfg.default_target {
                    if target < 0 || target > max_index {
                        return Err(DefinitionError::BranchTargetOutOfRange {
                            step: step.index,
                            target,
                        });
                    }
                }
                if cfg.cases.is_empty() {
                    return Err(DefinitionError::MissingConfig {
                        step: step.index,
                        reason: "switch with no cases".to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Comparator, Condition, ConditionGroup, GroupLogic};
    use crate::step::{StartConfig, SwitchCase, SwitchConfig};

    fn step(index: i32, kind: StepKind) -> StepDef {
        StepDef {
            index,
            name: format!("step-{index}"),
            kind,
        }
    }

    fn definition(steps: Vec<StepDef>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            tenant_id: Uuid::now_v7(),
            name: "test".to_string(),
            version: 1,
            status: DefinitionStatus::Active,
            variables: vec![],
            steps,
        }
    }

    #[test]
    fn valid_minimal_definition() {
        let def = definition(vec![
            step(0, StepKind::Start(StartConfig::default())),
            step(1, StepKind::End),
        ]);
        def.validate().unwrap();
    }

    #[test]
    fn rejects_missing_start() {
        let def = definition(vec![step(0, StepKind::End)]);
        assert!(matches!(
            def.validate(),
            Err(DefinitionError::MultipleStartSteps(0))
        ));
    }

    #[test]
    fn rejects_sparse_indexes() {
        let def = definition(vec![
            step(0, StepKind::Start(StartConfig::default())),
            step(2, StepKind::End),
        ]);
        assert!(matches!(
            def.validate(),
            Err(DefinitionError::NonContiguousIndexes(2))
        ));
    }

    #[test]
    fn rejects_branch_target_out_of_range() {
        let switch = SwitchConfig {
            cases: vec![SwitchCase {
                group: ConditionGroup {
                    logic: GroupLogic::And,
                    conditions: vec![Condition {
                        variable: "x".to_string(),
                        comparator: Comparator::IsNotEmpty,
                        operand: None,
                    }],
                },
                target: 9,
            }],
            default_target: None,
        };
        let def = definition(vec![
            step(0, StepKind::Start(StartConfig::default())),
            step(1, StepKind::Switch(switch)),
            step(2, StepKind::End),
        ]);
        assert!(matches!(
            def.validate(),
            Err(DefinitionError::BranchTargetOutOfRange { step: 1, target: 9 })
        ));
    }

    #[test]
    fn step_def_flattens_kind_tag() {
        let s = step(0, StepKind::Start(StartConfig::default()));
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["type"], "start");
        assert_eq!(json["index"], 0);
    }
}

//! Switch-step condition evaluation
//!
//! Condition groups are AND/OR compositions of comparisons over named
//! process variables. The Switch step evaluates its groups in order and
//! follows the first group that holds.

use serde::{Deserialize, Serialize};

use crate::variables::{VarValue, Variables};

/// Comparison operator over a process variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    IsEmpty,
    IsNotEmpty,
}

/// One comparison; `operand` is absent for the emptiness checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub variable: String,
    pub comparator: Comparator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operand: Option<VarValue>,
}

impl Condition {
    pub fn holds(&self, variables: &Variables) -> bool {
        let value = variables.get(&self.variable);

        match self.comparator {
            Comparator::IsEmpty => value.map(VarValue::is_empty).unwrap_or(true),
            Comparator::IsNotEmpty => value.map(|v| !v.is_empty()).unwrap_or(false),
            Comparator::Equals => match (value, &self.operand) {
                (Some(v), Some(op)) => values_equal(v, op),
                _ => false,
            },
            Comparator::NotEquals => match (value, &self.operand) {
                (Some(v), Some(op)) => !values_equal(v, op),
                // A missing variable is not equal to any operand
                (None, Some(_)) => true,
                _ => false,
            },
            Comparator::GreaterThan => ordered(value, self.operand.as_ref())
                .map(|o| o == std::cmp::Ordering::Greater)
                .unwrap_or(false),
            Comparator::LessThan => ordered(value, self.operand.as_ref())
                .map(|o| o == std::cmp::Ordering::Less)
                .unwrap_or(false),
            Comparator::Contains => match (value, &self.operand) {
                (Some(v), Some(op)) => match (v.as_str(), op.as_str()) {
                    (Some(hay), Some(needle)) => hay.contains(needle),
                    _ => false,
                },
                _ => false,
            },
        }
    }
}

/// Equality with Int/Decimal widening; everything else is strict
fn values_equal(a: &VarValue, b: &VarValue) -> bool {
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordered comparison for numbers and datetimes
fn ordered(value: Option<&VarValue>, operand: Option<&VarValue>) -> Option<std::cmp::Ordering> {
    let (v, op) = (value?, operand?);
    if let (Some(x), Some(y)) = (v.as_number(), op.as_number()) {
        return x.partial_cmp(&y);
    }
    if let (VarValue::DateTime(x), VarValue::DateTime(y)) = (v, op) {
        return Some(x.cmp(y));
    }
    None
}

/// How conditions within a group combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupLogic {
    And,
    Or,
}

/// An AND/OR composition of conditions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub logic: GroupLogic,
    pub conditions: Vec<Condition>,
}

impl ConditionGroup {
    pub fn holds(&self, variables: &Variables) -> bool {
        match self.logic {
            GroupLogic::And => self.conditions.iter().all(|c| c.holds(variables)),
            GroupLogic::Or => self.conditions.iter().any(|c| c.holds(variables)),
        }
    }
}

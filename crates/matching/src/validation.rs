//! Advisory checks over funnel steps. Problems reported here never stop
//! evaluation; the affected condition simply does not match.

use std::fmt;

use regex::Regex;
use serde::Serialize;

use crate::conditions::{Comparison, FunnelStep, Operator, StepCondition, StepMatcher};
use crate::matcher::{glob_to_regex, regex_source};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepIssue {
    /// Index of the step in the funnel.
    pub step: usize,
    /// Index of the condition within an OR-group, `None` for single-condition steps.
    pub condition: Option<usize>,
    pub kind: IssueKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum IssueKind {
    UnknownComparison { comparison: String },
    UnknownOperator { operator: String },
    InvalidPattern { pattern: String, error: String },
    QueryParamsOnNonUrl,
    EmptyConditionList,
}

impl fmt::Display for StepIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {}", self.step)?;
        if let Some(condition) = self.condition {
            write!(f, " condition {}", condition)?;
        }
        match &self.kind {
            IssueKind::UnknownComparison { comparison } => {
                write!(f, ": unknown comparison '{}'", comparison)
            }
            IssueKind::UnknownOperator { operator } => {
                write!(f, ": unknown operator '{}'", operator)
            }
            IssueKind::InvalidPattern { pattern, error } => {
                write!(f, ": invalid pattern '{}': {}", pattern, error)
            }
            IssueKind::QueryParamsOnNonUrl => {
                write!(f, ": ignore_query_params only applies to url comparisons")
            }
            IssueKind::EmptyConditionList => write!(f, ": condition list is empty"),
        }
    }
}

/// Lists every condition that can never match as configured.
pub fn validate_steps(steps: &[FunnelStep]) -> Vec<StepIssue> {
    let mut issues = Vec::new();

    for (step_index, step) in steps.iter().enumerate() {
        match &step.matcher {
            StepMatcher::Single(condition) => {
                check_condition(step_index, None, condition, &mut issues);
            }
            StepMatcher::AnyOf(conditions) if conditions.is_empty() => issues.push(StepIssue {
                step: step_index,
                condition: None,
                kind: IssueKind::EmptyConditionList,
            }),
            StepMatcher::AnyOf(conditions) => {
                for (condition_index, condition) in conditions.iter().enumerate() {
                    check_condition(step_index, Some(condition_index), condition, &mut issues);
                }
            }
        }
    }

    issues
}

fn check_condition(
    step: usize,
    condition_index: Option<usize>,
    condition: &StepCondition,
    issues: &mut Vec<StepIssue>,
) {
    let mut push = |kind| {
        issues.push(StepIssue {
            step,
            condition: condition_index,
            kind,
        })
    };

    if let Comparison::Unknown(raw) = &condition.comparison {
        push(IssueKind::UnknownComparison {
            comparison: raw.clone(),
        });
    }

    if condition.ignore_query_params && condition.comparison != Comparison::Url {
        push(IssueKind::QueryParamsOnNonUrl);
    }

    // Glob patterns are compiled the way the matcher sees them
    let pattern = if condition.case_sensitive {
        condition.pattern.clone()
    } else {
        condition.pattern.to_lowercase()
    };

    let source = match &condition.operator {
        Operator::Unknown(raw) => {
            push(IssueKind::UnknownOperator {
                operator: raw.clone(),
            });
            None
        }
        Operator::Regex => Some(regex_source(&condition.pattern, condition.case_sensitive)),
        Operator::Equals | Operator::NotEquals if pattern.contains('*') => {
            Some(glob_to_regex(&pattern))
        }
        _ => None,
    };

    if let Some(source) = source {
        if let Err(e) = Regex::new(&source) {
            push(IssueKind::InvalidPattern {
                pattern: condition.pattern.clone(),
                error: e.to_string(),
            });
        }
    }
}

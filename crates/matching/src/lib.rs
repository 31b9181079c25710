//! Step matching: decides whether a tracked interaction satisfies a funnel
//! step, for single-condition steps and OR-groups of conditions.

pub mod conditions;
pub mod matcher;
pub mod validation;

pub use conditions::{Comparison, FunnelStep, Operator, StepCondition, StepMatcher};
pub use matcher::{matches, safe_match, ConditionMatcher};
pub use validation::{validate_steps, IssueKind, StepIssue};

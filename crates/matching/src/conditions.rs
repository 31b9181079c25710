//! Step and condition types, including the persisted JSON shape of a step.

use funnel_core::error::{FunnelError, FunnelResult};
use serde::{Deserialize, Deserializer, Serialize};

/// Which field of an interaction a condition inspects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Comparison {
    Url,
    Path,
    SearchQuery,
    Title,
    EventCategory,
    EventAction,
    EventName,
    /// Unrecognized comparison; kept verbatim and never matches.
    Unknown(String),
}

impl Comparison {
    pub fn as_str(&self) -> &str {
        match self {
            Comparison::Url => "url",
            Comparison::Path => "path",
            Comparison::SearchQuery => "search_query",
            Comparison::Title => "title",
            Comparison::EventCategory => "event_category",
            Comparison::EventAction => "event_action",
            Comparison::EventName => "event_name",
            Comparison::Unknown(raw) => raw,
        }
    }
}

impl From<String> for Comparison {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "url" => Comparison::Url,
            "path" => Comparison::Path,
            "search_query" => Comparison::SearchQuery,
            "title" | "page_title" => Comparison::Title,
            "event_category" => Comparison::EventCategory,
            "event_action" => Comparison::EventAction,
            "event_name" | "event_value" => Comparison::EventName,
            _ => Comparison::Unknown(raw),
        }
    }
}

impl From<Comparison> for String {
    fn from(comparison: Comparison) -> Self {
        match comparison {
            Comparison::Unknown(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

/// How the extracted value is compared against the pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    NotStartsWith,
    EndsWith,
    NotEndsWith,
    Regex,
    /// Unrecognized operator; kept verbatim and never matches.
    Unknown(String),
}

impl Operator {
    pub fn as_str(&self) -> &str {
        match self {
            Operator::Equals => "equals",
            Operator::NotEquals => "not_equals",
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
            Operator::StartsWith => "starts_with",
            Operator::NotStartsWith => "not_starts_with",
            Operator::EndsWith => "ends_with",
            Operator::NotEndsWith => "not_ends_with",
            Operator::Regex => "regex",
            Operator::Unknown(raw) => raw,
        }
    }
}

impl From<String> for Operator {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "equals" => Operator::Equals,
            "not_equals" => Operator::NotEquals,
            "contains" => Operator::Contains,
            "not_contains" => Operator::NotContains,
            "starts_with" | "starts with" => Operator::StartsWith,
            "not_starts_with" => Operator::NotStartsWith,
            "ends_with" | "ends with" => Operator::EndsWith,
            "not_ends_with" => Operator::NotEndsWith,
            "regex" | "matches regular expression" => Operator::Regex,
            _ => Operator::Unknown(raw),
        }
    }
}

impl From<Operator> for String {
    fn from(operator: Operator) -> Self {
        match operator {
            Operator::Unknown(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

/// One atomic predicate over an interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCondition {
    pub comparison: Comparison,
    pub operator: Operator,
    #[serde(default, deserialize_with = "pattern_as_text")]
    pub pattern: String,
    #[serde(default)]
    pub case_sensitive: bool,
    /// Only consulted for `url` comparisons.
    #[serde(default)]
    pub ignore_query_params: bool,
}

impl StepCondition {
    pub fn new(comparison: Comparison, operator: Operator, pattern: impl Into<String>) -> Self {
        Self {
            comparison,
            operator,
            pattern: pattern.into(),
            case_sensitive: false,
            ignore_query_params: false,
        }
    }

    pub fn case_sensitive(mut self) -> Self {
        self.case_sensitive = true;
        self
    }

    pub fn ignoring_query_params(mut self) -> Self {
        self.ignore_query_params = true;
        self
    }
}

/// Patterns are stored as text, but older configurations hold bare numbers.
fn pattern_as_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    })
}

/// The match rule of a step: the legacy single condition or an OR-group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepMatcher {
    Single(StepCondition),
    AnyOf(Vec<StepCondition>),
}

/// One stage of a funnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StepRecord", into = "StepRecord")]
pub struct FunnelStep {
    /// 1-based display position; evaluation follows the order of the step list.
    pub position: u32,
    pub name: String,
    pub matcher: StepMatcher,
    pub is_optional: bool,
    /// Seconds allowed between entering this step and proceeding; 0 means
    /// unlimited.
    pub time_limit_seconds: u32,
}

impl FunnelStep {
    pub fn single(name: impl Into<String>, condition: StepCondition) -> Self {
        Self {
            position: 0,
            name: name.into(),
            matcher: StepMatcher::Single(condition),
            is_optional: false,
            time_limit_seconds: 0,
        }
    }

    /// OR-group step. An empty group could never match and is refused.
    pub fn any_of(
        name: impl Into<String>,
        conditions: Vec<StepCondition>,
    ) -> FunnelResult<Self> {
        let name = name.into();
        if conditions.is_empty() {
            return Err(FunnelError::InvalidDefinition(format!(
                "step '{}' has an empty condition list",
                name
            )));
        }

        Ok(Self {
            position: 0,
            name,
            matcher: StepMatcher::AnyOf(conditions),
            is_optional: false,
            time_limit_seconds: 0,
        })
    }

    pub fn optional(mut self) -> Self {
        self.is_optional = true;
        self
    }

    pub fn with_time_limit(mut self, seconds: u32) -> Self {
        self.time_limit_seconds = seconds;
        self
    }

    pub fn at_position(mut self, position: u32) -> Self {
        self.position = position;
        self
    }

    /// All conditions of the step, in evaluation order.
    pub fn conditions(&self) -> &[StepCondition] {
        match &self.matcher {
            StepMatcher::Single(condition) => std::slice::from_ref(condition),
            StepMatcher::AnyOf(conditions) => conditions,
        }
    }
}

/// Persisted shape: the legacy flat condition fields next to an optional
/// `conditions` list that takes precedence when non-empty.
#[derive(Serialize, Deserialize)]
struct StepRecord {
    #[serde(default)]
    position: u32,
    #[serde(default)]
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    comparison: Option<Comparison>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    operator: Option<Operator>,
    #[serde(
        default,
        deserialize_with = "pattern_as_text",
        skip_serializing_if = "String::is_empty"
    )]
    pattern: String,
    #[serde(default, skip_serializing_if = "is_false")]
    case_sensitive: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    ignore_query_params: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    conditions: Vec<StepCondition>,
    #[serde(default, alias = "optional")]
    is_optional: bool,
    #[serde(default)]
    time_limit_seconds: u32,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl From<StepRecord> for FunnelStep {
    fn from(record: StepRecord) -> Self {
        let matcher = if record.conditions.is_empty() {
            StepMatcher::Single(StepCondition {
                comparison: record
                    .comparison
                    .unwrap_or_else(|| Comparison::Unknown(String::new())),
                operator: record
                    .operator
                    .unwrap_or_else(|| Operator::Unknown(String::new())),
                pattern: record.pattern,
                case_sensitive: record.case_sensitive,
                ignore_query_params: record.ignore_query_params,
            })
        } else {
            StepMatcher::AnyOf(record.conditions)
        };

        FunnelStep {
            position: record.position,
            name: record.name,
            matcher,
            is_optional: record.is_optional,
            time_limit_seconds: record.time_limit_seconds,
        }
    }
}

impl From<FunnelStep> for StepRecord {
    fn from(step: FunnelStep) -> Self {
        let mut record = StepRecord {
            position: step.position,
            name: step.name,
            comparison: None,
            operator: None,
            pattern: String::new(),
            case_sensitive: false,
            ignore_query_params: false,
            conditions: Vec::new(),
            is_optional: step.is_optional,
            time_limit_seconds: step.time_limit_seconds,
        };

        match step.matcher {
            StepMatcher::Single(condition) => {
                record.comparison = Some(condition.comparison);
                record.operator = Some(condition.operator);
                record.pattern = condition.pattern;
                record.case_sensitive = condition.case_sensitive;
                record.ignore_query_params = condition.ignore_query_params;
            }
            StepMatcher::AnyOf(conditions) => record.conditions = conditions,
        }

        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_synonyms() {
        assert_eq!(Operator::from("starts with".to_string()), Operator::StartsWith);
        assert_eq!(Operator::from("ends with".to_string()), Operator::EndsWith);
        assert_eq!(
            Operator::from("matches regular expression".to_string()),
            Operator::Regex
        );
        assert_eq!(
            Operator::from("sounds_like".to_string()),
            Operator::Unknown("sounds_like".into())
        );
    }

    #[test]
    fn test_comparison_aliases() {
        assert_eq!(Comparison::from("event_value".to_string()), Comparison::EventName);
        assert_eq!(Comparison::from("page_title".to_string()), Comparison::Title);
        assert_eq!(
            Comparison::from("referrer".to_string()),
            Comparison::Unknown("referrer".into())
        );
    }

    #[test]
    fn test_legacy_step_shape() {
        let step: FunnelStep = serde_json::from_str(
            r#"{"position":1,"name":"Cart","comparison":"path","operator":"starts with","pattern":"/cart","time_limit_seconds":600}"#,
        )
        .unwrap();

        assert_eq!(step.name, "Cart");
        assert_eq!(step.time_limit_seconds, 600);
        assert!(!step.is_optional);
        match &step.matcher {
            StepMatcher::Single(condition) => {
                assert_eq!(condition.comparison, Comparison::Path);
                assert_eq!(condition.operator, Operator::StartsWith);
                assert_eq!(condition.pattern, "/cart");
            }
            other => panic!("expected single condition, got {:?}", other),
        }
    }

    #[test]
    fn test_condition_list_replaces_legacy_fields() {
        let step: FunnelStep = serde_json::from_str(
            r#"{
                "name":"Product",
                "comparison":"url","operator":"equals","pattern":"https://shop.test/old",
                "conditions":[
                    {"comparison":"path","operator":"contains","pattern":"/product/"},
                    {"comparison":"title","operator":"regex","pattern":"^Product"}
                ],
                "optional": true
            }"#,
        )
        .unwrap();

        assert!(step.is_optional);
        assert_eq!(step.conditions().len(), 2);
        assert!(matches!(step.matcher, StepMatcher::AnyOf(_)));
    }

    #[test]
    fn test_empty_condition_list_falls_back_to_legacy() {
        let step: FunnelStep = serde_json::from_str(
            r#"{"comparison":"url","operator":"contains","pattern":"checkout","conditions":[]}"#,
        )
        .unwrap();
        assert!(matches!(step.matcher, StepMatcher::Single(_)));
    }

    #[test]
    fn test_numeric_pattern_is_coerced_to_text() {
        let condition: StepCondition = serde_json::from_str(
            r#"{"comparison":"event_name","operator":"equals","pattern":42}"#,
        )
        .unwrap();
        assert_eq!(condition.pattern, "42");
    }

    #[test]
    fn test_unknown_values_survive_serialization() {
        let step = FunnelStep::single(
            "Odd",
            StepCondition::new(
                Comparison::Unknown("referrer".into()),
                Operator::Unknown("sounds_like".into()),
                "x",
            ),
        );
        let json = serde_json::to_string(&step).unwrap();
        assert!(json.contains("\"comparison\":\"referrer\""));
        assert!(json.contains("\"operator\":\"sounds_like\""));

        let back: FunnelStep = serde_json::from_str(&json).unwrap();
        assert_eq!(back, step);
    }
}

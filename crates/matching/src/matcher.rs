//! Condition evaluation against a single interaction.
//!
//! Matching is total: an unknown comparison or operator, or a pattern that
//! does not compile, yields `false` instead of an error, so one bad step can
//! never abort the evaluation of a batch.

use std::borrow::Cow;

use dashmap::DashMap;
use funnel_core::types::InteractionEvent;
use regex::Regex;
use tracing::debug;
use url::Url;

use crate::conditions::{Comparison, FunnelStep, Operator, StepCondition, StepMatcher};

/// Base used to resolve relative URLs when extracting a path.
const PLACEHOLDER_BASE: &str = "http://placeholder.invalid/";

/// Evaluates steps against interactions, caching compiled regular
/// expressions by source so a pattern is compiled once per batch.
#[derive(Debug, Default)]
pub struct ConditionMatcher {
    regex_cache: DashMap<String, Option<Regex>>,
}

impl ConditionMatcher {
    pub fn new() -> Self {
        Self {
            regex_cache: DashMap::new(),
        }
    }

    /// Returns `true` if the event satisfies the step. OR-groups short-circuit
    /// on the first matching condition.
    pub fn matches(&self, step: &FunnelStep, event: &InteractionEvent) -> bool {
        match &step.matcher {
            StepMatcher::Single(condition) => self.match_single(condition, event),
            StepMatcher::AnyOf(conditions) => conditions
                .iter()
                .any(|condition| self.match_single(condition, event)),
        }
    }

    pub fn match_single(&self, condition: &StepCondition, event: &InteractionEvent) -> bool {
        let Some(value) = extract_value(condition, event) else {
            debug!(
                comparison = condition.comparison.as_str(),
                "Unknown comparison, condition never matches"
            );
            return false;
        };

        // Regexes fold case through `(?i)`; lower-casing would turn `\D` into `\d`
        let fold_case =
            !condition.case_sensitive && !matches!(condition.operator, Operator::Regex);
        if fold_case {
            self.compare(
                condition,
                &value.to_lowercase(),
                &condition.pattern.to_lowercase(),
            )
        } else {
            self.compare(condition, &value, &condition.pattern)
        }
    }

    /// Indices of every step the event satisfies.
    pub fn matching_steps(&self, steps: &[FunnelStep], event: &InteractionEvent) -> Vec<usize> {
        steps
            .iter()
            .enumerate()
            .filter(|(_, step)| self.matches(step, event))
            .map(|(index, _)| index)
            .collect()
    }

    /// Number of distinct regex sources compiled so far.
    pub fn cached_patterns(&self) -> usize {
        self.regex_cache.len()
    }

    fn compare(&self, condition: &StepCondition, value: &str, pattern: &str) -> bool {
        match &condition.operator {
            Operator::Equals => self.equals(value, pattern),
            Operator::NotEquals => !self.equals(value, pattern),
            Operator::Contains => value.contains(pattern),
            Operator::NotContains => !value.contains(pattern),
            Operator::StartsWith => pattern.is_empty() || value.starts_with(pattern),
            Operator::NotStartsWith => !pattern.is_empty() && !value.starts_with(pattern),
            Operator::EndsWith => pattern.is_empty() || value.ends_with(pattern),
            Operator::NotEndsWith => !pattern.is_empty() && !value.ends_with(pattern),
            Operator::Regex => {
                self.regex_is_match(&regex_source(pattern, condition.case_sensitive), value)
            }
            Operator::Unknown(raw) => {
                debug!(operator = %raw, "Unknown operator, condition never matches");
                false
            }
        }
    }

    /// Exact equality; a pattern containing `*` also matches as a glob.
    fn equals(&self, value: &str, pattern: &str) -> bool {
        value == pattern
            || (pattern.contains('*') && self.regex_is_match(&glob_to_regex(pattern), value))
    }

    fn regex_is_match(&self, source: &str, value: &str) -> bool {
        if let Some(cached) = self.regex_cache.get(source) {
            return cached.value().as_ref().is_some_and(|re| re.is_match(value));
        }

        let compiled = compile(source);
        let is_match = compiled.as_ref().is_some_and(|re| re.is_match(value));
        self.regex_cache.insert(source.to_string(), compiled);
        is_match
    }
}

/// Returns `true` if the event satisfies the step.
///
/// Uses a throwaway regex cache; batch callers should hold a
/// [`ConditionMatcher`] instead.
pub fn matches(step: &FunnelStep, event: &InteractionEvent) -> bool {
    ConditionMatcher::new().matches(step, event)
}

/// Searches `value` for `pattern` (delimited or bare regex syntax). A pattern
/// that fails to compile matches nothing.
pub fn safe_match(pattern: &str, value: &str) -> bool {
    compile(&normalize_regex(pattern)).is_some_and(|re| re.is_match(value))
}

fn compile(source: &str) -> Option<Regex> {
    match Regex::new(source) {
        Ok(re) => Some(re),
        Err(e) => {
            debug!(pattern = %source, error = %e, "Invalid pattern, treated as no match");
            None
        }
    }
}

fn extract_value<'a>(
    condition: &StepCondition,
    event: &'a InteractionEvent,
) -> Option<Cow<'a, str>> {
    let value = match &condition.comparison {
        Comparison::Url if condition.ignore_query_params => {
            let url = event.url.as_str();
            Cow::Borrowed(url.split_once('?').map_or(url, |(base, _)| base))
        }
        Comparison::Url => Cow::Borrowed(event.url.as_str()),
        Comparison::Path => Cow::Owned(url_path(&event.url)),
        Comparison::SearchQuery => Cow::Borrowed(event.search_term.as_str()),
        Comparison::Title => Cow::Borrowed(event.page_title.as_str()),
        Comparison::EventCategory => Cow::Borrowed(event.event_category.as_str()),
        Comparison::EventAction => Cow::Borrowed(event.event_action.as_str()),
        Comparison::EventName => Cow::Borrowed(event.event_name.as_str()),
        Comparison::Unknown(_) => return None,
    };
    Some(value)
}

/// Path component of a URL, without query or fragment. Relative URLs are
/// resolved against a placeholder host; anything unparseable yields "".
pub fn url_path(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let parsed = match Url::parse(raw) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(PLACEHOLDER_BASE).and_then(|base| base.join(raw))
        }
        Err(e) => Err(e),
    };

    parsed.map(|url| url.path().to_string()).unwrap_or_default()
}

/// Converts a `*` wildcard pattern into an anchored regex; every other
/// character is matched literally.
pub fn glob_to_regex(pattern: &str) -> String {
    let body: Vec<String> = pattern.split('*').map(regex::escape).collect();
    format!("(?s)^{}$", body.join(".*"))
}

/// Regex source for a condition pattern, with `(?i)` prepended when the
/// condition is case-insensitive.
pub fn regex_source(pattern: &str, case_sensitive: bool) -> String {
    let source = normalize_regex(pattern);
    if case_sensitive {
        source.into_owned()
    } else {
        format!("(?i){}", source)
    }
}

/// Rewrites a delimited pattern such as `/step-\d+/i` into the regex crate's
/// syntax, turning trailing flags into an inline group. Patterns that are not
/// delimited are returned unchanged.
pub fn normalize_regex(pattern: &str) -> Cow<'_, str> {
    let Some(delimiter) = pattern.chars().next() else {
        return Cow::Borrowed(pattern);
    };
    if !delimiter.is_ascii_punctuation() || matches!(delimiter, '\\' | '(' | '[' | '{' | '<') {
        return Cow::Borrowed(pattern);
    }

    let rest = &pattern[delimiter.len_utf8()..];
    let Some(close) = rest.rfind(delimiter) else {
        return Cow::Borrowed(pattern);
    };
    let (body, flags) = (&rest[..close], &rest[close + delimiter.len_utf8()..]);
    if !flags
        .chars()
        .all(|f| matches!(f, 'i' | 'm' | 's' | 'x' | 'U' | 'u' | 'D'))
    {
        return Cow::Borrowed(pattern);
    }

    let escaped_delimiter = format!("\\{}", delimiter);
    let body = if is_regex_meta(delimiter) {
        body.to_string()
    } else {
        body.replace(&escaped_delimiter, &delimiter.to_string())
    };

    // `u` and `D` are accepted but have no regex crate counterpart.
    let inline: String = flags
        .chars()
        .filter(|f| matches!(f, 'i' | 'm' | 's' | 'x' | 'U'))
        .collect();

    if inline.is_empty() {
        Cow::Owned(body)
    } else {
        Cow::Owned(format!("(?{}){}", inline, body))
    }
}

fn is_regex_meta(c: char) -> bool {
    matches!(
        c,
        '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$' | '#' | '&'
            | '-' | '~'
    )
}

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{FunnelError, FunnelResult};

/// Tracked website identifier.
pub type SiteId = u32;

/// A single tracked interaction (page view, site search or custom event).
/// Fields missing from the raw log are read as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(default, deserialize_with = "empty_if_null")]
    pub url: String,
    #[serde(default, deserialize_with = "empty_if_null")]
    pub page_title: String,
    #[serde(default, deserialize_with = "empty_if_null")]
    pub search_term: String,
    #[serde(default, deserialize_with = "empty_if_null")]
    pub event_category: String,
    #[serde(default, deserialize_with = "empty_if_null")]
    pub event_action: String,
    #[serde(default, deserialize_with = "empty_if_null")]
    pub event_name: String,
}

impl InteractionEvent {
    pub fn page_view(url: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.page_title = title.into();
        self
    }

    pub fn with_search(mut self, term: impl Into<String>) -> Self {
        self.search_term = term.into();
        self
    }

    pub fn with_event(
        mut self,
        category: impl Into<String>,
        action: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        self.event_category = category.into();
        self.event_action = action.into();
        self.event_name = name.into();
        self
    }
}

fn empty_if_null<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// One visitor session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visit {
    pub visit_id: u64,
    #[serde(default)]
    pub events: Vec<InteractionEvent>,
}

impl Visit {
    pub fn new(visit_id: u64, events: Vec<InteractionEvent>) -> Self {
        Self { visit_id, events }
    }

    /// Events ordered by timestamp. The sort is stable, so events sharing a
    /// timestamp keep their log order.
    pub fn ordered_events(&self) -> Vec<&InteractionEvent> {
        let mut events: Vec<&InteractionEvent> = self.events.iter().collect();
        events.sort_by_key(|e| e.timestamp);
        events
    }
}

/// Inclusive date range a snapshot of funnel metrics covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReportPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ReportPeriod {
    pub fn new(start: NaiveDate, end: NaiveDate) -> FunnelResult<Self> {
        if start > end {
            return Err(FunnelError::InvalidPeriod(format!(
                "start {} is after end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn day(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn contains(&self, timestamp: &DateTime<Utc>) -> bool {
        let date = timestamp.date_naive();
        date >= self.start && date <= self.end
    }
}

impl fmt::Display for ReportPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{},{}", self.start, self.end)
        }
    }
}

impl FromStr for ReportPeriod {
    type Err = FunnelError;

    /// Parses `YYYY-MM-DD` (a single day) or `YYYY-MM-DD,YYYY-MM-DD`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            NaiveDate::parse_from_str(part.trim(), "%Y-%m-%d")
                .map_err(|e| FunnelError::InvalidPeriod(format!("{}: {}", part.trim(), e)))
        };

        match s.split_once(',') {
            Some((start, end)) => ReportPeriod::new(parse(start)?, parse(end)?),
            None => Ok(ReportPeriod::day(parse(s)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_missing_and_null_fields_read_as_empty() {
        let event: InteractionEvent = serde_json::from_str(
            r#"{"timestamp":"2024-03-01T10:00:00Z","url":"https://shop.test/","page_title":null}"#,
        )
        .unwrap();
        assert_eq!(event.url, "https://shop.test/");
        assert_eq!(event.page_title, "");
        assert_eq!(event.event_name, "");
    }

    #[test]
    fn test_ordered_events_is_stable_on_ties() {
        let visit = Visit::new(
            1,
            vec![
                InteractionEvent::page_view("/b", ts(10)),
                InteractionEvent::page_view("/a", ts(5)),
                InteractionEvent::page_view("/c", ts(10)),
            ],
        );
        let urls: Vec<&str> = visit
            .ordered_events()
            .iter()
            .map(|e| e.url.as_str())
            .collect();
        assert_eq!(urls, vec!["/a", "/b", "/c"]);
    }

    #[test]
    fn test_period_parse_and_display() {
        let range: ReportPeriod = "2024-01-01,2024-01-31".parse().unwrap();
        assert_eq!(range.to_string(), "2024-01-01,2024-01-31");

        let day: ReportPeriod = "2024-02-29".parse().unwrap();
        assert_eq!(day.start, day.end);
        assert_eq!(day.to_string(), "2024-02-29");

        assert!("2024-02-01,2024-01-01".parse::<ReportPeriod>().is_err());
        assert!("yesterday".parse::<ReportPeriod>().is_err());
    }

    #[test]
    fn test_period_contains() {
        let period: ReportPeriod = "2023-11-14".parse().unwrap();
        assert!(period.contains(&ts(0)));
        assert!(!period.contains(&ts(86_400 * 3)));
    }
}

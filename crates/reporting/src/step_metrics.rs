//! Per-step counters produced by funnel evaluation, and the snapshot records
//! handed to the metrics sink.

use std::collections::BTreeMap;

use funnel_core::error::FunnelResult;
use funnel_core::types::{ReportPeriod, SiteId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Counters for one funnel step.
///
/// Merging is element-wise addition, so partial results from disjoint sets
/// of visits can be combined in any order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub entries: u64,
    pub proceeded: u64,
    pub exits: u64,
    pub skips: u64,
    /// Whole seconds between entry and proceeding, summed over proceeding visits.
    pub time_spent: u64,
    pub time_hits: u64,
    /// Next URL of exiting visits. Visits without a next URL are not listed.
    pub dropoff_urls: BTreeMap<String, u64>,
}

impl StepMetrics {
    pub fn merge(&mut self, other: &StepMetrics) {
        self.entries += other.entries;
        self.proceeded += other.proceeded;
        self.exits += other.exits;
        self.skips += other.skips;
        self.time_spent += other.time_spent;
        self.time_hits += other.time_hits;
        for (url, count) in &other.dropoff_urls {
            *self.dropoff_urls.entry(url.clone()).or_insert(0) += count;
        }
    }

    pub fn record_dropoff(&mut self, url: &str) {
        if !url.is_empty() {
            *self.dropoff_urls.entry(url.to_string()).or_insert(0) += 1;
        }
    }

    /// Exiting visits whose destination is known.
    pub fn known_dropoffs(&self) -> u64 {
        self.dropoff_urls.values().sum()
    }
}

/// Step-indexed metrics for a whole funnel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunnelMetrics {
    pub steps: Vec<StepMetrics>,
}

impl FunnelMetrics {
    pub fn empty(step_count: usize) -> Self {
        Self {
            steps: vec![StepMetrics::default(); step_count],
        }
    }

    /// Associative, commutative combination with `FunnelMetrics::default()`
    /// as identity.
    pub fn merge(mut self, other: FunnelMetrics) -> FunnelMetrics {
        if self.steps.len() < other.steps.len() {
            self.steps.resize(other.steps.len(), StepMetrics::default());
        }
        for (mine, theirs) in self.steps.iter_mut().zip(other.steps.iter()) {
            mine.merge(theirs);
        }
        self
    }

    /// Visits that entered the funnel.
    pub fn entered(&self) -> u64 {
        self.steps.first().map_or(0, |s| s.entries)
    }

    /// Visits that reached the final step.
    pub fn converted(&self) -> u64 {
        self.steps.last().map_or(0, |s| s.entries)
    }
}

/// Identifies one immutable metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotKey {
    pub site_id: SiteId,
    pub funnel_id: Uuid,
    pub period: ReportPeriod,
}

/// Persisted form of [`StepMetrics`]; `dropoff_urls` is an encoded JSON map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetricsRecord {
    pub visits: u64,
    pub entries: u64,
    pub exits: u64,
    pub proceeded: u64,
    pub skips: u64,
    pub time_spent: u64,
    pub time_hits: u64,
    pub dropoff_urls: String,
}

impl StepMetricsRecord {
    pub fn from_metrics(metrics: &StepMetrics) -> FunnelResult<Self> {
        Ok(Self {
            visits: metrics.entries,
            entries: metrics.entries,
            exits: metrics.exits,
            proceeded: metrics.proceeded,
            skips: metrics.skips,
            time_spent: metrics.time_spent,
            time_hits: metrics.time_hits,
            dropoff_urls: serde_json::to_string(&metrics.dropoff_urls)?,
        })
    }

    pub fn decode_dropoff_urls(&self) -> FunnelResult<BTreeMap<String, u64>> {
        Ok(serde_json::from_str(&self.dropoff_urls)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunnelSnapshot {
    pub key: SnapshotKey,
    pub steps: Vec<StepMetricsRecord>,
}

impl FunnelSnapshot {
    pub fn new(key: SnapshotKey, metrics: &FunnelMetrics) -> FunnelResult<Self> {
        let steps = metrics
            .steps
            .iter()
            .map(StepMetricsRecord::from_metrics)
            .collect::<FunnelResult<Vec<_>>>()?;
        Ok(Self { key, steps })
    }

    pub fn to_json(&self) -> FunnelResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(entries: u64, proceeded: u64, exits: u64, dropoffs: &[(&str, u64)]) -> StepMetrics {
        StepMetrics {
            entries,
            proceeded,
            exits,
            skips: 0,
            time_spent: proceeded * 10,
            time_hits: proceeded,
            dropoff_urls: dropoffs
                .iter()
                .map(|(url, count)| (url.to_string(), *count))
                .collect(),
        }
    }

    #[test]
    fn test_step_merge_adds_counters_and_urls() {
        let mut a = step(3, 2, 1, &[("/other", 1)]);
        let b = step(2, 1, 1, &[("/other", 1), ("/help", 1)]);
        a.merge(&b);
        assert_eq!(a.entries, 5);
        assert_eq!(a.proceeded, 3);
        assert_eq!(a.exits, 2);
        assert_eq!(a.time_spent, 30);
        assert_eq!(a.dropoff_urls["/other"], 2);
        assert_eq!(a.dropoff_urls["/help"], 1);
        assert_eq!(a.known_dropoffs(), 3);
    }

    #[test]
    fn test_funnel_merge_is_order_independent() {
        let x = FunnelMetrics {
            steps: vec![step(1, 1, 0, &[]), step(1, 0, 1, &[("/a", 1)])],
        };
        let y = FunnelMetrics {
            steps: vec![step(2, 0, 2, &[("/b", 2)]), step(0, 0, 0, &[])],
        };
        let z = FunnelMetrics {
            steps: vec![step(1, 1, 0, &[]), step(1, 1, 0, &[])],
        };

        let left = x.clone().merge(y.clone()).merge(z.clone());
        let right = z.clone().merge(x.clone().merge(y.clone()));
        assert_eq!(left, right);
        assert_eq!(FunnelMetrics::default().merge(x.clone()), x);
        assert_eq!(left.entered(), 4);
        assert_eq!(left.converted(), 2);
    }

    #[test]
    fn test_record_dropoff_skips_unknown_destination() {
        let mut metrics = StepMetrics::default();
        metrics.record_dropoff("");
        metrics.record_dropoff("/pricing");
        assert_eq!(metrics.dropoff_urls.len(), 1);
    }

    #[test]
    fn test_snapshot_record_fields() {
        let metrics = FunnelMetrics {
            steps: vec![step(2, 1, 1, &[("/z", 1), ("/a", 3)])],
        };
        let key = SnapshotKey {
            site_id: 1,
            funnel_id: Uuid::nil(),
            period: "2024-05-01".parse().unwrap(),
        };
        let snapshot = FunnelSnapshot::new(key, &metrics).unwrap();
        let record = &snapshot.steps[0];
        assert_eq!(record.visits, record.entries);
        // BTreeMap keeps the encoded map in key order
        assert_eq!(record.dropoff_urls, r#"{"/a":3,"/z":1}"#);
        assert_eq!(record.decode_dropoff_urls().unwrap()["/a"], 3);
    }
}

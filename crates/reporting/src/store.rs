//! Collaborator seams around evaluation: where funnel definitions, raw
//! visits and finished snapshots live. The in-memory implementations back
//! the CLI and tests.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use funnel_core::error::{FunnelError, FunnelResult};
use funnel_core::types::{ReportPeriod, SiteId, Visit};
use tracing::{debug, info};
use uuid::Uuid;

use crate::funnel::FunnelDefinition;
use crate::step_metrics::{FunnelSnapshot, SnapshotKey};

/// Source of funnel definitions. Deletion is soft until the retention purge.
pub trait FunnelStore: Send + Sync {
    fn get(&self, id: &Uuid) -> Option<FunnelDefinition>;

    /// Active, non-deleted funnels of a site, ordered by name then id.
    fn list_active(&self, site_id: SiteId) -> Vec<FunnelDefinition>;

    fn save(&self, definition: FunnelDefinition);

    fn soft_delete(&self, id: &Uuid, now: DateTime<Utc>) -> FunnelResult<()>;

    /// Physically removes soft-deleted funnels last updated more than
    /// `retention_days` before `now`. Returns how many were removed.
    fn purge_deleted(&self, now: DateTime<Utc>, retention_days: u32) -> usize;
}

/// Supplies the raw visits of a site for a reporting period.
pub trait EventSource: Send + Sync {
    fn visits(&self, site_id: SiteId, period: &ReportPeriod) -> FunnelResult<Vec<Visit>>;
}

/// Receives immutable metrics snapshots.
pub trait MetricsSink: Send + Sync {
    fn write(&self, snapshot: FunnelSnapshot) -> FunnelResult<()>;

    fn read(&self, key: &SnapshotKey) -> Option<FunnelSnapshot>;

    /// Drops every snapshot of the site and period so it is recomputed on
    /// next access. Returns how many were dropped.
    fn invalidate(&self, site_id: SiteId, period: &ReportPeriod) -> usize;
}

#[derive(Debug, Default)]
pub struct InMemoryFunnelStore {
    funnels: DashMap<Uuid, FunnelDefinition>,
}

impl InMemoryFunnelStore {
    pub fn new() -> Self {
        Self {
            funnels: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.funnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funnels.is_empty()
    }
}

impl FunnelStore for InMemoryFunnelStore {
    fn get(&self, id: &Uuid) -> Option<FunnelDefinition> {
        self.funnels.get(id).map(|f| f.clone())
    }

    fn list_active(&self, site_id: SiteId) -> Vec<FunnelDefinition> {
        let mut funnels: Vec<FunnelDefinition> = self
            .funnels
            .iter()
            .filter(|f| f.site_id == site_id && f.active && !f.deleted)
            .map(|f| f.value().clone())
            .collect();
        funnels.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        funnels
    }

    fn save(&self, definition: FunnelDefinition) {
        debug!(funnel_id = %definition.id, name = %definition.name, "Saving funnel");
        self.funnels.insert(definition.id, definition);
    }

    fn soft_delete(&self, id: &Uuid, now: DateTime<Utc>) -> FunnelResult<()> {
        let mut entry = self
            .funnels
            .get_mut(id)
            .ok_or_else(|| FunnelError::FunnelNotFound {
                funnel_id: id.to_string(),
            })?;
        entry.deleted = true;
        entry.updated_at = now;
        info!(funnel_id = %id, "Funnel soft-deleted");
        Ok(())
    }

    fn purge_deleted(&self, now: DateTime<Utc>, retention_days: u32) -> usize {
        let cutoff = now - Duration::days(i64::from(retention_days));
        let before = self.funnels.len();
        self.funnels
            .retain(|_, f| !(f.deleted && f.updated_at < cutoff));
        let purged = before - self.funnels.len();
        if purged > 0 {
            info!(purged, retention_days, "Purged deleted funnels");
        }
        purged
    }
}

/// Visits held per site. A visit belongs to the period of its first event
/// and is returned whole, so sessions crossing midnight are not split.
#[derive(Debug, Default)]
pub struct InMemoryEventSource {
    visits: DashMap<SiteId, Vec<Visit>>,
}

impl InMemoryEventSource {
    pub fn new() -> Self {
        Self {
            visits: DashMap::new(),
        }
    }

    pub fn add_visits(&self, site_id: SiteId, visits: impl IntoIterator<Item = Visit>) {
        self.visits.entry(site_id).or_default().extend(visits);
    }
}

impl EventSource for InMemoryEventSource {
    fn visits(&self, site_id: SiteId, period: &ReportPeriod) -> FunnelResult<Vec<Visit>> {
        let Some(all) = self.visits.get(&site_id) else {
            return Ok(Vec::new());
        };

        Ok(all
            .iter()
            .filter(|visit| {
                visit
                    .events
                    .iter()
                    .map(|e| e.timestamp)
                    .min()
                    .is_some_and(|first| period.contains(&first))
            })
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMetricsSink {
    snapshots: DashMap<SnapshotKey, FunnelSnapshot>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self {
            snapshots: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn write(&self, snapshot: FunnelSnapshot) -> FunnelResult<()> {
        self.snapshots.insert(snapshot.key, snapshot);
        metrics::counter!("funnel.snapshots_written").increment(1);
        Ok(())
    }

    fn read(&self, key: &SnapshotKey) -> Option<FunnelSnapshot> {
        self.snapshots.get(key).map(|s| s.clone())
    }

    fn invalidate(&self, site_id: SiteId, period: &ReportPeriod) -> usize {
        let before = self.snapshots.len();
        self.snapshots
            .retain(|key, _| !(key.site_id == site_id && key.period == *period));
        let dropped = before - self.snapshots.len();
        metrics::counter!("funnel.snapshots_invalidated").increment(dropped as u64);
        dropped
    }
}

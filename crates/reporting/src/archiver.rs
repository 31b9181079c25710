//! Ties the collaborators together: loads a funnel, pulls the period's
//! visits, evaluates and stores the resulting snapshot.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use funnel_core::config::RetentionConfig;
use funnel_core::error::{FunnelError, FunnelResult};
use funnel_core::types::{ReportPeriod, SiteId};
use tracing::{debug, info};
use uuid::Uuid;

use crate::funnel::{FunnelDefinition, FunnelEvaluator};
use crate::step_metrics::{FunnelSnapshot, SnapshotKey};
use crate::store::{EventSource, FunnelStore, MetricsSink};

#[derive(Clone)]
pub struct FunnelArchiver {
    store: Arc<dyn FunnelStore>,
    source: Arc<dyn EventSource>,
    sink: Arc<dyn MetricsSink>,
    evaluator: Arc<FunnelEvaluator>,
    retention: RetentionConfig,
}

impl std::fmt::Debug for FunnelArchiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunnelArchiver")
            .field("evaluator", &self.evaluator)
            .field("retention", &self.retention)
            .finish()
    }
}

impl FunnelArchiver {
    pub fn new(
        store: Arc<dyn FunnelStore>,
        source: Arc<dyn EventSource>,
        sink: Arc<dyn MetricsSink>,
        evaluator: Arc<FunnelEvaluator>,
    ) -> Self {
        Self {
            store,
            source,
            sink,
            evaluator,
            retention: RetentionConfig::default(),
        }
    }

    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    /// Evaluates one funnel for a period and writes its snapshot. Inactive
    /// funnels are skipped and yield `None`.
    pub fn archive_funnel(
        &self,
        site_id: SiteId,
        funnel_id: &Uuid,
        period: &ReportPeriod,
    ) -> FunnelResult<Option<FunnelSnapshot>> {
        let definition = self.load(site_id, funnel_id)?;
        if !definition.active {
            debug!(funnel_id = %funnel_id, "Funnel inactive, not archived");
            return Ok(None);
        }

        let visits = self.source.visits(site_id, period)?;
        self.archive_definition(&definition, period, &visits)
            .map(Some)
    }

    /// Archives every active funnel of a site.
    pub fn archive_site(
        &self,
        site_id: SiteId,
        period: &ReportPeriod,
    ) -> FunnelResult<Vec<FunnelSnapshot>> {
        let funnels = self.store.list_active(site_id);
        if funnels.is_empty() {
            return Ok(Vec::new());
        }

        let visits = self.source.visits(site_id, period)?;
        info!(
            site_id,
            %period,
            funnels = funnels.len(),
            visits = visits.len(),
            "Archiving site funnels"
        );

        funnels
            .iter()
            .map(|definition| self.archive_definition(definition, period, &visits))
            .collect()
    }

    /// Returns the stored snapshot, computing it first if it is missing or
    /// was invalidated.
    pub fn get_or_archive(
        &self,
        site_id: SiteId,
        funnel_id: &Uuid,
        period: &ReportPeriod,
    ) -> FunnelResult<Option<FunnelSnapshot>> {
        let key = SnapshotKey {
            site_id,
            funnel_id: *funnel_id,
            period: *period,
        };
        if let Some(snapshot) = self.sink.read(&key) {
            return Ok(Some(snapshot));
        }
        self.archive_funnel(site_id, funnel_id, period)
    }

    /// Marks a site's snapshots for the period as stale.
    pub fn invalidate(&self, site_id: SiteId, period: &ReportPeriod) -> usize {
        let dropped = self.sink.invalidate(site_id, period);
        info!(site_id, %period, dropped, "Invalidated funnel snapshots");
        dropped
    }

    /// Retention job for soft-deleted funnels.
    pub fn purge_deleted(&self, now: DateTime<Utc>) -> usize {
        self.store
            .purge_deleted(now, self.retention.deleted_funnel_days)
    }

    fn load(&self, site_id: SiteId, funnel_id: &Uuid) -> FunnelResult<FunnelDefinition> {
        let definition = self
            .store
            .get(funnel_id)
            .filter(|f| f.site_id == site_id)
            .ok_or_else(|| FunnelError::FunnelNotFound {
                funnel_id: funnel_id.to_string(),
            })?;

        if definition.deleted {
            return Err(FunnelError::FunnelDeleted {
                funnel_id: funnel_id.to_string(),
            });
        }
        Ok(definition)
    }

    fn archive_definition(
        &self,
        definition: &FunnelDefinition,
        period: &ReportPeriod,
        visits: &[funnel_core::types::Visit],
    ) -> FunnelResult<FunnelSnapshot> {
        let metrics = self.evaluator.evaluate(definition, visits)?;
        let key = SnapshotKey {
            site_id: definition.site_id,
            funnel_id: definition.id,
            period: *period,
        };
        let snapshot = FunnelSnapshot::new(key, &metrics)?;
        self.sink.write(snapshot.clone())?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryEventSource, InMemoryFunnelStore, InMemoryMetricsSink};
    use chrono::TimeZone;
    use funnel_core::types::{InteractionEvent, Visit};
    use funnel_matching::{Comparison, FunnelStep, Operator, StepCondition};

    struct Fixture {
        store: Arc<InMemoryFunnelStore>,
        source: Arc<InMemoryEventSource>,
        sink: Arc<InMemoryMetricsSink>,
        archiver: FunnelArchiver,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryFunnelStore::new());
        let source = Arc::new(InMemoryEventSource::new());
        let sink = Arc::new(InMemoryMetricsSink::new());
        let archiver = FunnelArchiver::new(
            store.clone(),
            source.clone(),
            sink.clone(),
            Arc::new(FunnelEvaluator::sequential()),
        );
        Fixture {
            store,
            source,
            sink,
            archiver,
        }
    }

    fn signup_funnel(site_id: SiteId) -> FunnelDefinition {
        FunnelDefinition::new(
            site_id,
            "Signup",
            vec![
                FunnelStep::single(
                    "Pricing",
                    StepCondition::new(Comparison::Path, Operator::Equals, "/pricing"),
                ),
                FunnelStep::single(
                    "Signed up",
                    StepCondition::new(Comparison::EventAction, Operator::Equals, "signup"),
                ),
            ],
        )
    }

    fn period() -> ReportPeriod {
        "2024-03-01".parse().unwrap()
    }

    fn seed_visits(source: &InMemoryEventSource, site_id: SiteId) {
        let at = |m: u32| Utc.with_ymd_and_hms(2024, 3, 1, 9, m, 0).unwrap();
        source.add_visits(
            site_id,
            vec![
                Visit::new(
                    1,
                    vec![
                        InteractionEvent::page_view("https://app.test/pricing", at(0)),
                        InteractionEvent::page_view("https://app.test/register", at(1))
                            .with_event("Account", "signup", "form"),
                    ],
                ),
                Visit::new(
                    2,
                    vec![
                        InteractionEvent::page_view("https://app.test/pricing", at(3)),
                        InteractionEvent::page_view("https://app.test/docs", at(4)),
                    ],
                ),
            ],
        );
    }

    #[test]
    fn test_archive_funnel_writes_snapshot() {
        let fx = fixture();
        let funnel = signup_funnel(5);
        let id = funnel.id;
        fx.store.save(funnel);
        seed_visits(&fx.source, 5);

        let snapshot = fx.archiver.archive_funnel(5, &id, &period()).unwrap().unwrap();
        assert_eq!(snapshot.steps[0].entries, 2);
        assert_eq!(snapshot.steps[0].proceeded, 1);
        assert_eq!(snapshot.steps[0].exits, 1);
        assert_eq!(snapshot.steps[0].time_spent, 60);
        assert_eq!(
            snapshot.steps[0].dropoff_urls,
            r#"{"https://app.test/docs":1}"#
        );
        assert_eq!(snapshot.steps[1].visits, 1);
        assert_eq!(fx.sink.len(), 1);
    }

    #[test]
    fn test_missing_deleted_and_inactive_funnels() {
        let fx = fixture();
        assert!(matches!(
            fx.archiver.archive_funnel(5, &Uuid::new_v4(), &period()),
            Err(FunnelError::FunnelNotFound { .. })
        ));

        // Funnel of another site is not visible
        let foreign = signup_funnel(6);
        let foreign_id = foreign.id;
        fx.store.save(foreign);
        assert!(matches!(
            fx.archiver.archive_funnel(5, &foreign_id, &period()),
            Err(FunnelError::FunnelNotFound { .. })
        ));

        let deleted = signup_funnel(5);
        let deleted_id = deleted.id;
        fx.store.save(deleted);
        fx.store.soft_delete(&deleted_id, Utc::now()).unwrap();
        assert!(matches!(
            fx.archiver.archive_funnel(5, &deleted_id, &period()),
            Err(FunnelError::FunnelDeleted { .. })
        ));

        let mut inactive = signup_funnel(5);
        inactive.active = false;
        let inactive_id = inactive.id;
        fx.store.save(inactive);
        assert!(fx
            .archiver
            .archive_funnel(5, &inactive_id, &period())
            .unwrap()
            .is_none());
        assert!(fx.sink.is_empty());
    }

    #[test]
    fn test_invalidate_then_recompute_is_identical() {
        let fx = fixture();
        let funnel = signup_funnel(5);
        let id = funnel.id;
        fx.store.save(funnel);
        seed_visits(&fx.source, 5);

        let first = fx.archiver.get_or_archive(5, &id, &period()).unwrap().unwrap();
        let cached = fx.archiver.get_or_archive(5, &id, &period()).unwrap().unwrap();
        assert_eq!(first, cached);

        assert_eq!(fx.archiver.invalidate(5, &period()), 1);
        assert!(fx.sink.is_empty());

        let recomputed = fx.archiver.get_or_archive(5, &id, &period()).unwrap().unwrap();
        assert_eq!(first.to_json().unwrap(), recomputed.to_json().unwrap());
    }

    #[test]
    fn test_archive_site_covers_active_funnels() {
        let fx = fixture();
        fx.store.save(signup_funnel(5));
        fx.store.save(signup_funnel(5));
        let mut inactive = signup_funnel(5);
        inactive.active = false;
        fx.store.save(inactive);
        seed_visits(&fx.source, 5);

        let snapshots = fx.archiver.archive_site(5, &period()).unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(fx.sink.len(), 2);
        assert!(fx.archiver.archive_site(99, &period()).unwrap().is_empty());
    }

    #[test]
    fn test_purge_uses_retention_config() {
        let fx = fixture();
        let archiver = fx.archiver.clone().with_retention(RetentionConfig {
            deleted_funnel_days: 7,
        });
        let funnel = signup_funnel(5);
        let id = funnel.id;
        fx.store.save(funnel);

        let now = Utc::now();
        fx.store
            .soft_delete(&id, now - chrono::Duration::days(10))
            .unwrap();
        assert_eq!(fx.archiver.purge_deleted(now), 0);
        assert_eq!(archiver.purge_deleted(now), 1);
    }
}

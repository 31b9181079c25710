//! Funnel analysis: tracks visit progression through ordered, multi-step
//! conversion paths and aggregates per-step metrics for a batch of visits.

use chrono::{DateTime, Utc};
use funnel_core::config::EvaluatorConfig;
use funnel_core::error::{FunnelError, FunnelResult};
use funnel_core::types::{SiteId, Visit};
use funnel_matching::{validate_steps, ConditionMatcher, FunnelStep};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::step_metrics::FunnelMetrics;
use crate::visit_state::{VisitOutcome, VisitWalker};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunnelDefinition {
    pub id: Uuid,
    pub site_id: SiteId,
    pub name: String,
    /// Conversion goal the funnel leads to, if any.
    #[serde(default)]
    pub goal_id: Option<u32>,
    pub steps: Vec<FunnelStep>,
    /// When set, steps must be matched in order and optional steps can not
    /// be skipped.
    #[serde(default)]
    pub strict_mode: bool,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl FunnelDefinition {
    pub fn new(site_id: SiteId, name: impl Into<String>, steps: Vec<FunnelStep>) -> Self {
        let steps = steps
            .into_iter()
            .enumerate()
            .map(|(i, step)| step.at_position(i as u32 + 1))
            .collect();

        Self {
            id: Uuid::new_v4(),
            site_id,
            name: name.into(),
            goal_id: None,
            steps,
            strict_mode: false,
            active: true,
            deleted: false,
            updated_at: Utc::now(),
        }
    }

    pub fn strict(mut self) -> Self {
        self.strict_mode = true;
        self
    }

    pub fn ensure_has_steps(&self) -> FunnelResult<()> {
        if self.steps.is_empty() {
            return Err(FunnelError::EmptyFunnel {
                funnel_id: self.id.to_string(),
            });
        }
        Ok(())
    }
}

/// Evaluates funnels over closed batches of visits.
///
/// Each visit is walked independently, so large batches are split into
/// chunks, evaluated on the rayon pool and merged.
pub struct FunnelEvaluator {
    config: EvaluatorConfig,
    pool: Option<rayon::ThreadPool>,
}

impl std::fmt::Debug for FunnelEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunnelEvaluator")
            .field("config", &self.config)
            .field("dedicated_pool", &self.pool.is_some())
            .finish()
    }
}

impl FunnelEvaluator {
    pub fn new(config: EvaluatorConfig) -> FunnelResult<Self> {
        let pool = if config.parallel && config.num_threads > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.num_threads)
                .thread_name(|i| format!("funnel-eval-{}", i))
                .build()
                .map_err(|e| FunnelError::Config(format!("evaluator thread pool: {}", e)))?;
            Some(pool)
        } else {
            None
        };

        Ok(Self { config, pool })
    }

    /// Evaluator that never leaves the calling thread.
    pub fn sequential() -> Self {
        Self {
            config: EvaluatorConfig {
                parallel: false,
                ..Default::default()
            },
            pool: None,
        }
    }

    /// Computes per-step metrics for `visits`, one entry per step in step
    /// order. Fails only when the funnel has no steps.
    pub fn evaluate(
        &self,
        definition: &FunnelDefinition,
        visits: &[Visit],
    ) -> FunnelResult<FunnelMetrics> {
        definition.ensure_has_steps()?;

        for issue in validate_steps(&definition.steps) {
            warn!(funnel_id = %definition.id, %issue, "Funnel step can never match as configured");
        }

        let matcher = ConditionMatcher::new();
        let chunk_size = self.config.min_visits_per_task.max(1);

        let metrics = if self.config.parallel && visits.len() > chunk_size {
            debug!(
                funnel_id = %definition.id,
                visits = visits.len(),
                chunk_size,
                "Evaluating funnel in parallel"
            );
            let run = || {
                visits
                    .par_chunks(chunk_size)
                    .map(|chunk| evaluate_partition(definition, &matcher, chunk))
                    .reduce(
                        || FunnelMetrics::empty(definition.steps.len()),
                        FunnelMetrics::merge,
                    )
            };
            match &self.pool {
                Some(pool) => pool.install(run),
                None => run(),
            }
        } else {
            evaluate_partition(definition, &matcher, visits)
        };

        metrics::counter!("funnel.visits_evaluated").increment(visits.len() as u64);
        info!(
            funnel_id = %definition.id,
            visits = visits.len(),
            entered = metrics.entered(),
            converted = metrics.converted(),
            "Funnel evaluated"
        );

        Ok(metrics)
    }

    /// Outcome of a single visit, for inspection and debugging.
    pub fn trace_visit(
        &self,
        definition: &FunnelDefinition,
        visit: &Visit,
    ) -> FunnelResult<VisitOutcome> {
        definition.ensure_has_steps()?;
        let matcher = ConditionMatcher::new();
        let mut scratch = FunnelMetrics::empty(definition.steps.len());
        let events = visit.ordered_events();
        Ok(
            VisitWalker::new(&definition.steps, definition.strict_mode, &matcher, &events)
                .run(&mut scratch),
        )
    }
}

impl Default for FunnelEvaluator {
    fn default() -> Self {
        Self::sequential()
    }
}

fn evaluate_partition(
    definition: &FunnelDefinition,
    matcher: &ConditionMatcher,
    visits: &[Visit],
) -> FunnelMetrics {
    let mut metrics = FunnelMetrics::empty(definition.steps.len());
    for visit in visits {
        let events = visit.ordered_events();
        VisitWalker::new(&definition.steps, definition.strict_mode, matcher, &events)
            .run(&mut metrics);
    }
    metrics
}

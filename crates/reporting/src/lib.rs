//! Funnel reporting: per-visit step progression, mergeable step metrics,
//! snapshot archiving and the storage seams around it.

pub mod archiver;
pub mod funnel;
pub mod step_metrics;
pub mod store;
pub mod visit_state;

pub use archiver::FunnelArchiver;
pub use funnel::{FunnelDefinition, FunnelEvaluator};
pub use step_metrics::{FunnelMetrics, FunnelSnapshot, SnapshotKey, StepMetrics, StepMetricsRecord};
pub use store::{
    EventSource, FunnelStore, InMemoryEventSource, InMemoryFunnelStore, InMemoryMetricsSink,
    MetricsSink,
};
pub use visit_state::{VisitOutcome, VisitState, VisitWalker};

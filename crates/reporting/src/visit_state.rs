//! Per-visit progress through a funnel, as a small explicit state machine.

use chrono::{DateTime, Utc};
use funnel_core::types::InteractionEvent;
use funnel_matching::{ConditionMatcher, FunnelStep};
use serde::{Deserialize, Serialize};

use crate::step_metrics::FunnelMetrics;

/// Where a visit stands while its events are scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitState {
    /// No event has matched the first step yet.
    Seeking,
    /// Inside `step`, entered by the event at index `event` at `entered_at`.
    InStep {
        step: usize,
        event: usize,
        entered_at: DateTime<Utc>,
    },
    /// Stopped advancing at `step`; the event after index `event` is where
    /// the visit went instead.
    Exited { step: usize, event: usize },
    /// Reached the final step.
    Completed,
}

/// Final outcome of one visit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum VisitOutcome {
    NotEntered,
    Exited {
        step: usize,
        destination: Option<String>,
    },
    Completed,
}

/// A candidate move from the current step to `target`, triggered by the
/// event at index `event`. Steps strictly between are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Advance {
    target: usize,
    event: usize,
}

/// Walks one visit's ordered events against the funnel steps and records
/// entries, proceeds, skips, exits and dwell time into `metrics`.
pub struct VisitWalker<'a> {
    steps: &'a [FunnelStep],
    strict_mode: bool,
    matcher: &'a ConditionMatcher,
    events: &'a [&'a InteractionEvent],
    state: VisitState,
}

impl<'a> VisitWalker<'a> {
    pub fn new(
        steps: &'a [FunnelStep],
        strict_mode: bool,
        matcher: &'a ConditionMatcher,
        events: &'a [&'a InteractionEvent],
    ) -> Self {
        Self {
            steps,
            strict_mode,
            matcher,
            events,
            state: VisitState::Seeking,
        }
    }

    pub fn state(&self) -> VisitState {
        self.state
    }

    /// Drives the state machine to a terminal state.
    pub fn run(mut self, metrics: &mut FunnelMetrics) -> VisitOutcome {
        loop {
            match self.state {
                VisitState::Seeking => match self.enter_first_step(metrics) {
                    Some(state) => self.state = state,
                    None => return VisitOutcome::NotEntered,
                },
                VisitState::InStep {
                    step,
                    event,
                    entered_at,
                } => self.state = self.advance(step, event, entered_at, metrics),
                VisitState::Exited { step, event } => {
                    let destination = self
                        .events
                        .get(event + 1)
                        .filter(|next| !next.url.is_empty())
                        .map(|next| next.url.clone());
                    return VisitOutcome::Exited { step, destination };
                }
                VisitState::Completed => return VisitOutcome::Completed,
            }
        }
    }

    fn enter_first_step(&self, metrics: &mut FunnelMetrics) -> Option<VisitState> {
        let first = self.steps.first()?;
        let event = self
            .events
            .iter()
            .position(|e| self.matcher.matches(first, e))?;

        metrics.steps[0].entries += 1;
        Some(VisitState::InStep {
            step: 0,
            event,
            entered_at: self.events[event].timestamp,
        })
    }

    fn advance(
        &self,
        step: usize,
        event: usize,
        entered_at: DateTime<Utc>,
        metrics: &mut FunnelMetrics,
    ) -> VisitState {
        if step + 1 >= self.steps.len() {
            return VisitState::Completed;
        }

        let Some(next) = self.find_advance(step, event + 1) else {
            let last = self.last_match(step, event);
            return self.exit(step, last, metrics);
        };

        let reached_at = self.events[next.event].timestamp;
        let elapsed = (reached_at - entered_at).num_seconds().max(0) as u64;
        let limit = self.steps[step].time_limit_seconds;
        if limit > 0 && elapsed > u64::from(limit) {
            // Timed out: the visit is considered gone right after the entry
            return self.exit(step, event, metrics);
        }

        let current = &mut metrics.steps[step];
        current.proceeded += 1;
        current.time_spent += elapsed;
        current.time_hits += 1;
        for skipped in &mut metrics.steps[step + 1..next.target] {
            skipped.skips += 1;
        }
        metrics.steps[next.target].entries += 1;

        VisitState::InStep {
            step: next.target,
            event: next.event,
            entered_at: reached_at,
        }
    }

    fn exit(&self, step: usize, event: usize, metrics: &mut FunnelMetrics) -> VisitState {
        let current = &mut metrics.steps[step];
        current.exits += 1;
        if let Some(next) = self.events.get(event + 1) {
            current.record_dropoff(&next.url);
        }
        VisitState::Exited { step, event }
    }

    /// Index of the last event from `entry` on that still matches `step`.
    fn last_match(&self, step: usize, entry: usize) -> usize {
        self.events
            .iter()
            .enumerate()
            .skip(entry + 1)
            .rev()
            .find(|(_, e)| self.matcher.matches(&self.steps[step], e))
            .map_or(entry, |(index, _)| index)
    }

    /// Finds the next step to move to from `step`, scanning events from
    /// index `from`. The immediate successor wins if any remaining event
    /// matches it; otherwise, unless strict mode is on, the nearest later step
    /// reachable over a run of optional steps is taken.
    fn find_advance(&self, step: usize, from: usize) -> Option<Advance> {
        let next = step + 1;
        let mut skip: Option<Advance> = None;

        for (index, event) in self.events.iter().enumerate().skip(from) {
            if self.matcher.matches(&self.steps[next], event) {
                return Some(Advance {
                    target: next,
                    event: index,
                });
            }
            if self.strict_mode {
                continue;
            }

            let mut target = next + 1;
            while target < self.steps.len() && self.steps[target - 1].is_optional {
                if skip.map_or(false, |s| s.target <= target) {
                    break;
                }
                if self.matcher.matches(&self.steps[target], event) {
                    skip = Some(Advance {
                        target,
                        event: index,
                    });
                    break;
                }
                target += 1;
            }
        }

        skip
    }
}

//! The result aggregator (§4.9): collects a `(requeue decision, error?)` per
//! step and reduces them to the single most-specific outcome for the
//! orchestrator to return.

use std::time::Duration;

use snafu::Report;

/// Most-specific-wins lattice: `requeue_after(short) ≻ requeue_after(long) ≻
/// requeue_now ≻ no_requeue`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequeueDecision {
    NoRequeue,
    RequeueNow,
    RequeueAfter(Duration),
}

impl RequeueDecision {
    /// Rank within the lattice; higher is more specific.
    fn rank(self) -> u8 {
        match self {
            RequeueDecision::NoRequeue => 0,
            RequeueDecision::RequeueNow => 1,
            RequeueDecision::RequeueAfter(_) => 2,
        }
    }

    /// Combines two decisions, keeping the most specific one. Between two
    /// `RequeueAfter`s the *shorter* duration wins, since it is the more
    /// specific (sooner) deadline.
    pub fn most_specific(self, other: RequeueDecision) -> RequeueDecision {
        match (self, other) {
            (RequeueDecision::RequeueAfter(a), RequeueDecision::RequeueAfter(b)) => {
                RequeueDecision::RequeueAfter(a.min(b))
            }
            (a, b) if a.rank() >= b.rank() => a,
            (_, b) => b,
        }
    }
}

/// A single step's outcome, as produced by each phase in §4.3-§4.5.
#[derive(Debug)]
pub struct StepOutcome<E> {
    pub decision: RequeueDecision,
    pub error: Option<E>,
}

impl<E> StepOutcome<E> {
    pub fn ok(decision: RequeueDecision) -> Self {
        StepOutcome {
            decision,
            error: None,
        }
    }

    pub fn err(decision: RequeueDecision, error: E) -> Self {
        StepOutcome {
            decision,
            error: Some(error),
        }
    }
}

/// Accumulates step outcomes across a single reconcile pass and reduces them
/// to `(most_specific_decision, aggregated_error)` (§4.9).
#[derive(Debug, Default)]
pub struct ResultAggregator<E> {
    decision: Option<RequeueDecision>,
    errors: Vec<E>,
}

impl<E> ResultAggregator<E> {
    pub fn new() -> Self {
        ResultAggregator {
            decision: None,
            errors: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: StepOutcome<E>) {
        self.decision = Some(match self.decision {
            Some(existing) => existing.most_specific(outcome.decision),
            None => outcome.decision,
        });
        if let Some(error) = outcome.error {
            self.errors.push(error);
        }
    }

    pub fn record_decision(&mut self, decision: RequeueDecision) {
        self.decision = Some(match self.decision {
            Some(existing) => existing.most_specific(decision),
            None => decision,
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn decision(&self) -> RequeueDecision {
        self.decision.unwrap_or(RequeueDecision::NoRequeue)
    }

    pub fn into_errors(self) -> Vec<E> {
        self.errors
    }
}

impl<E: std::error::Error + 'static> ResultAggregator<E> {
    /// Renders the aggregated errors the way `snafu::Report` renders a single
    /// error chain, joined by blank lines, for use in events/logs (§7).
    pub fn error_messages(&self) -> Vec<String> {
        self.errors
            .iter()
            .map(|error| Report::from_error(error).to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn more_specific_decision_wins() {
        assert_eq!(
            RequeueDecision::NoRequeue.most_specific(RequeueDecision::RequeueNow),
            RequeueDecision::RequeueNow
        );
        assert_eq!(
            RequeueDecision::RequeueNow
                .most_specific(RequeueDecision::RequeueAfter(Duration::from_secs(10))),
            RequeueDecision::RequeueAfter(Duration::from_secs(10))
        );
    }

    #[test]
    fn shorter_requeue_after_wins() {
        assert_eq!(
            RequeueDecision::RequeueAfter(Duration::from_secs(30))
                .most_specific(RequeueDecision::RequeueAfter(Duration::from_secs(5))),
            RequeueDecision::RequeueAfter(Duration::from_secs(5))
        );
    }

    #[test]
    fn aggregator_collects_errors_without_dropping_requeue() {
        let mut aggregator: ResultAggregator<String> = ResultAggregator::new();
        aggregator.record(StepOutcome::ok(RequeueDecision::NoRequeue));
        aggregator.record(StepOutcome::err(
            RequeueDecision::RequeueNow,
            "boom".to_string(),
        ));
        assert_eq!(aggregator.decision(), RequeueDecision::RequeueNow);
        assert!(aggregator.has_errors());
        assert_eq!(aggregator.into_errors(), vec!["boom".to_string()]);
    }
}

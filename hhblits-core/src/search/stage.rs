use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// States of one search. Every iteration walks
/// `Prefilter -> Align -> Decode -> Collect` and then either refines the
/// query and loops, or converges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Prefilter,
    Align,
    Decode,
    Collect,
    Refine,
    Converged(StopReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    IterationLimit,
    /// No hit newly crossed the significance threshold.
    NoNewHits,
    /// The query profile reached the configured diversity.
    NeffReached,
    Aborted,
}

/// Caller-side abort flag; the controller looks at it between batches only.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct IterationSummary {
    pub iteration: usize,
    /// Prefilter survivors.
    pub candidates: usize,
    /// Earlier merged subjects re-aligned against the current profile.
    pub rescored: usize,
    pub aligned: usize,
    pub failed: usize,
    /// Viterbi batches run.
    pub batches: usize,
    pub low_confidence: usize,
    pub significant: usize,
    pub new_hits: usize,
    /// Diversity of the query profile searched with.
    pub neff: f32,
    pub stopped_early: bool,
}

/// Why a batched pass ended before its last item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BatchStop {
    Aborted,
    Early,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct BatchRun {
    pub batches: usize,
    pub stopped: Option<BatchStop>,
}

/// Running sum of `1 / (1 + E)` over the most recent `window` alignments.
#[derive(Debug)]
pub(crate) struct EarlyStop {
    window: usize,
    threshold: f64,
    recent: VecDeque<f64>,
    sum: f64,
}

impl EarlyStop {
    pub fn new(window: usize, threshold: f64) -> Self {
        Self {
            window: window.max(1),
            threshold,
            recent: VecDeque::with_capacity(window),
            sum: 0.0,
        }
    }

    /// `evalue` is infinite for pairs without an alignment.
    pub fn push(&mut self, evalue: f64) {
        let v = 1.0 / (1.0 + evalue);
        self.recent.push_back(v);
        self.sum += v;
        if self.recent.len() > self.window {
            if let Some(old) = self.recent.pop_front() {
                self.sum -= old;
            }
        }
    }

    pub fn should_stop(&self) -> bool {
        self.recent.len() == self.window && self.sum < self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn early_stop_needs_a_full_window() {
        let mut es = EarlyStop::new(3, 0.5);
        es.push(1000.0);
        es.push(1000.0);
        assert!(!es.should_stop());
        es.push(1000.0);
        assert!(es.should_stop());
        es.push(0.0);
        assert!(!es.should_stop());
    }

    #[test]
    fn missing_alignments_count_as_zero() {
        let mut es = EarlyStop::new(2, 0.1);
        es.push(f64::INFINITY);
        es.push(f64::INFINITY);
        assert!(es.should_stop());
    }

    #[test]
    fn abort_is_shared_between_clones() {
        let a = AbortSignal::new();
        let b = a.clone();
        assert!(!b.is_aborted());
        a.abort();
        assert!(b.is_aborted());
    }
}

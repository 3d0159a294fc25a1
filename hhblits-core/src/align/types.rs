use serde::{Deserialize, Serialize};
use std::ops::Range;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignmentMode {
    #[default]
    Local,
    Global,
}

/// Path operations consume profile columns.
/// Ins consumes query (gap in subject), Del consumes subject (gap in query).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathOp {
    /// Consumes query and subject.
    Match,
    /// Consumes query, gap in subject.
    Ins,
    /// Consumes subject, gap in query.
    Del,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct AlignmentPath {
    pub ops: Vec<(PathOp, usize)>,
}

impl AlignmentPath {
    pub fn push(&mut self, op: PathOp, len: usize) {
        if len == 0 {
            return;
        }
        if let Some((last_op, last_len)) = self.ops.last_mut() {
            if *last_op == op {
                *last_len += len;
                return;
            }
        }
        self.ops.push((op, len));
    }

    pub fn len(&self) -> usize {
        self.ops.iter().map(|(_, n)| *n).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Columns consumed on the query and subject side.
    pub fn consumed(&self) -> (usize, usize) {
        let mut q = 0usize;
        let mut t = 0usize;
        for &(op, n) in &self.ops {
            match op {
                PathOp::Match => {
                    q += n;
                    t += n;
                }
                PathOp::Ins => q += n,
                PathOp::Del => t += n,
            }
        }
        (q, t)
    }

    pub fn matches(&self) -> usize {
        self.ops
            .iter()
            .filter(|(op, _)| *op == PathOp::Match)
            .map(|(_, n)| *n)
            .sum()
    }

    /// Matched (query, subject) column pairs, 0-based, starting from the given offsets.
    pub fn pairs(&self, query_start: usize, subject_start: usize) -> Vec<(usize, usize)> {
        let mut out = Vec::with_capacity(self.matches());
        let mut qi = query_start;
        let mut tj = subject_start;
        for &(op, n) in &self.ops {
            match op {
                PathOp::Match => {
                    for k in 0..n {
                        out.push((qi + k, tj + k));
                    }
                    qi += n;
                    tj += n;
                }
                PathOp::Ins => qi += n,
                PathOp::Del => tj += n,
            }
        }
        out
    }

    /// Build from ops collected back to front during a traceback.
    pub(crate) fn from_reversed(rev_ops: Vec<(PathOp, usize)>) -> Self {
        Self {
            ops: rev_ops.into_iter().rev().collect(),
        }
    }
}

pub(crate) fn push_rev(ops: &mut Vec<(PathOp, usize)>, op: PathOp, len: usize) {
    if len == 0 {
        return;
    }
    if let Some((last_op, last_len)) = ops.last_mut() {
        if *last_op == op {
            *last_len += len;
            return;
        }
    }
    ops.push((op, len));
}

/// Optimal path of one query/subject pair.
#[derive(Clone, Debug, PartialEq)]
pub struct ViterbiResult {
    /// Score in bits.
    pub score: f32,
    pub query_range: Range<usize>,
    pub subject_range: Range<usize>,
    pub path: AlignmentPath,
}

/// Maximum-accuracy alignment of one pair decoded from posterior probabilities.
#[derive(Clone, Debug, PartialEq)]
pub struct PosteriorResult {
    pub query_range: Range<usize>,
    pub subject_range: Range<usize>,
    pub path: AlignmentPath,
    /// Sum of posterior match probabilities over the aligned columns.
    pub sum_probability: f32,
    pub mean_probability: f32,
    /// Log partition function (nats) of the pair.
    pub log_z: f32,
}

/// Outcome of one pair inside a batch. Failures are isolated per pair.
#[derive(Debug)]
pub enum PairOutcome<T> {
    Aligned(T),
    /// Too short to align, or nothing worth reporting.
    NoMatch,
    Failed(crate::error::SearchError),
}

impl<T> PairOutcome<T> {
    pub fn aligned(&self) -> Option<&T> {
        match self {
            PairOutcome::Aligned(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_aligned(self) -> Option<T> {
        match self {
            PairOutcome::Aligned(v) => Some(v),
            _ => None,
        }
    }
}

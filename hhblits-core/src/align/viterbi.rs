//! Batched Viterbi alignment of one query profile against many subjects.
//!
//! Subjects of a batch are packed into lane groups; each lane is one bin and
//! every group runs the three-state recurrence (match, query gap, subject gap)
//! in lock-step over the query rows. Backtrace bits go to the bin's own matrix.

use super::lanes::{floor_clamp, lane, splat_column, LaneGroup, LANES};
use super::pool::{BinLease, MatrixPool};
use super::scoring::{QueryRows, ScoringContext, LOG_FLOOR};
use super::types::{push_rev, AlignmentMode, AlignmentPath, PairOutcome, PathOp, ViterbiResult};
use crate::error::{SearchError, SearchResult};
use crate::profile::Profile;
use std::sync::Arc;
use tracing::debug;
use wide::{f32x8, CmpGt};

pub(crate) const FROM_START: u8 = 0;
pub(crate) const FROM_M: u8 = 1;
pub(crate) const FROM_QI: u8 = 2;
pub(crate) const FROM_TI: u8 = 3;
pub(crate) const M_MASK: u8 = 0b11;
pub(crate) const QI_EXTEND: u8 = 0b100;
pub(crate) const TI_EXTEND: u8 = 0b1000;

/// Backtrace storage of one bin. Grows on demand and is never shrunk.
#[derive(Default)]
pub struct ViterbiMatrix {
    trace: Vec<u8>,
    cols: usize,
}

impl ViterbiMatrix {
    pub(crate) fn prepare(&mut self, rows: usize, cols: usize) {
        let need = rows * cols;
        if self.trace.len() < need {
            self.trace.resize(need, 0);
        }
        self.cols = cols;
    }

    #[inline]
    pub(crate) fn set(&mut self, i: usize, j: usize, v: u8) {
        self.trace[i * self.cols + j] = v;
    }

    #[inline]
    pub(crate) fn get(&self, i: usize, j: usize) -> u8 {
        self.trace[i * self.cols + j]
    }

    pub fn capacity(&self) -> usize {
        self.trace.len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    M,
    Qi,
    Ti,
}

/// Best cell of a filled matrix.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Endpoint {
    pub score: f32,
    pub i: usize,
    pub j: usize,
    pub state: State,
}

/// Global end cell with priority M > query gap > subject gap.
pub(crate) fn global_end(m: f32, qi: f32, ti: f32, i: usize, j: usize) -> Endpoint {
    let (score, state) = if m >= qi && m >= ti {
        (m, State::M)
    } else if qi >= ti {
        (qi, State::Qi)
    } else {
        (ti, State::Ti)
    };
    Endpoint { score, i, j, state }
}

pub(crate) fn traceback(
    mat: &ViterbiMatrix,
    mode: AlignmentMode,
    end: Endpoint,
    query_len: usize,
    subject_len: usize,
) -> ViterbiResult {
    let mut ops = Vec::new();
    let (mut i, mut j) = (end.i, end.j);
    let mut state = end.state;
    while i > 0 && j > 0 {
        let cell = mat.get(i, j);
        match state {
            State::M => {
                push_rev(&mut ops, PathOp::Match, 1);
                i -= 1;
                j -= 1;
                state = match cell & M_MASK {
                    FROM_M => State::M,
                    FROM_QI => State::Qi,
                    FROM_TI => State::Ti,
                    _ => break,
                };
            }
            State::Qi => {
                push_rev(&mut ops, PathOp::Ins, 1);
                i -= 1;
                if cell & QI_EXTEND == 0 {
                    state = State::M;
                }
            }
            State::Ti => {
                push_rev(&mut ops, PathOp::Del, 1);
                j -= 1;
                if cell & TI_EXTEND == 0 {
                    state = State::M;
                }
            }
        }
    }
    match mode {
        AlignmentMode::Global => {
            // leading gaps run along the matrix border
            push_rev(&mut ops, PathOp::Del, j);
            push_rev(&mut ops, PathOp::Ins, i);
            ViterbiResult {
                score: end.score,
                query_range: 0..query_len,
                subject_range: 0..subject_len,
                path: AlignmentPath::from_reversed(ops),
            }
        }
        AlignmentMode::Local => ViterbiResult {
            score: end.score,
            query_range: i..end.i,
            subject_range: j..end.j,
            path: AlignmentPath::from_reversed(ops),
        },
    }
}

/// Fill up to `LANES` bins at once. Returns the best cell per lane.
#[cfg_attr(not(feature = "simd"), allow(dead_code))]
pub(crate) fn fill_group(
    ctx: &ScoringContext,
    query: &Profile,
    qrows: &QueryRows,
    group: &LaneGroup,
    mats: &mut [BinLease<'_, ViterbiMatrix>],
) -> [Endpoint; LANES] {
    let lq = query.len();
    let cols = group.max_len + 1;
    let global = ctx.mode == AlignmentMode::Global;
    let floor = f32x8::splat(LOG_FLOOR);
    let zero = f32x8::splat(0.0);
    let shift = f32x8::splat(ctx.shift);

    for (b, mat) in mats.iter_mut().enumerate() {
        mat.prepare(lq + 1, group.lens[b] + 1);
    }

    let mut m_prev = vec![floor; cols];
    let mut qi_prev = vec![floor; cols];
    let mut ti_prev = vec![floor; cols];
    let mut m_cur = vec![floor; cols];
    let mut qi_cur = vec![floor; cols];
    let mut ti_cur = vec![floor; cols];

    if global {
        m_prev[0] = floor_clamp(zero + group.pad[0]);
        let open = f32x8::splat(qrows.open[0]);
        let extend = f32x8::splat(qrows.extend[0]);
        for j in 1..cols {
            let v = (m_prev[j - 1] + open).max(ti_prev[j - 1] + extend);
            ti_prev[j] = floor_clamp(v + group.pad[j]);
        }
    }

    let mut best = floor;
    let mut best_i = [0usize; LANES];
    let mut best_j = [0usize; LANES];

    for i in 1..=lq {
        let q = splat_column(&query.columns()[i - 1].freqs);
        let q_mm = f32x8::splat(qrows.mm[i - 1]);
        let t_open = f32x8::splat(qrows.open[i]);
        let t_ext = f32x8::splat(qrows.extend[i]);

        m_cur[0] = floor;
        ti_cur[0] = floor;
        qi_cur[0] = if global {
            let v = (m_prev[0] + group.open[0]).max(qi_prev[0] + group.extend[0]);
            floor_clamp(v + group.pad[0])
        } else {
            floor
        };

        for j in 1..cols {
            let s = group.score(&q, j, shift);

            let mut pred = m_prev[j - 1] + q_mm + group.mm[j - 1];
            let qi_wins = qi_prev[j - 1].cmp_gt(pred);
            pred = pred.max(qi_prev[j - 1]);
            let ti_wins = ti_prev[j - 1].cmp_gt(pred);
            pred = pred.max(ti_prev[j - 1]);
            let start_bits = if global {
                0
            } else {
                let start_wins = zero.cmp_gt(pred);
                pred = pred.max(zero);
                start_wins.move_mask()
            };
            let m = floor_clamp(s + pred + group.pad[j]);

            let qi_open = m_prev[j] + group.open[j];
            let qi_ext = qi_prev[j] + group.extend[j];
            let qi_ext_bits = qi_ext.cmp_gt(qi_open).move_mask();
            let qi = floor_clamp(qi_open.max(qi_ext) + group.pad[j]);

            let ti_open = m_cur[j - 1] + t_open;
            let ti_ext = ti_cur[j - 1] + t_ext;
            let ti_ext_bits = ti_ext.cmp_gt(ti_open).move_mask();
            let ti = floor_clamp(ti_open.max(ti_ext) + group.pad[j]);

            m_cur[j] = m;
            qi_cur[j] = qi;
            ti_cur[j] = ti;

            let qi_bits = qi_wins.move_mask();
            let ti_bits = ti_wins.move_mask();
            for (b, mat) in mats.iter_mut().enumerate() {
                if j > group.lens[b] {
                    continue;
                }
                let bit = |mask: i32| (mask >> b) & 1 == 1;
                let mut cell = if bit(start_bits) {
                    FROM_START
                } else if bit(ti_bits) {
                    FROM_TI
                } else if bit(qi_bits) {
                    FROM_QI
                } else {
                    FROM_M
                };
                if bit(qi_ext_bits) {
                    cell |= QI_EXTEND;
                }
                if bit(ti_ext_bits) {
                    cell |= TI_EXTEND;
                }
                mat.set(i, j, cell);
            }

            if !global {
                let improved = m.cmp_gt(best).move_mask();
                if improved != 0 {
                    for b in 0..group.active {
                        if (improved >> b) & 1 == 1 {
                            best_i[b] = i;
                            best_j[b] = j;
                        }
                    }
                    best = best.max(m);
                }
            }
        }

        std::mem::swap(&mut m_prev, &mut m_cur);
        std::mem::swap(&mut qi_prev, &mut qi_cur);
        std::mem::swap(&mut ti_prev, &mut ti_cur);
    }

    let mut ends = [Endpoint {
        score: LOG_FLOOR,
        i: 0,
        j: 0,
        state: State::M,
    }; LANES];
    for (b, end) in ends.iter_mut().enumerate().take(group.active) {
        if global {
            let lb = group.lens[b];
            *end = global_end(
                lane(m_prev[lb], b),
                lane(qi_prev[lb], b),
                lane(ti_prev[lb], b),
                lq,
                lb,
            );
        } else {
            *end = Endpoint {
                score: lane(best, b),
                i: best_i[b],
                j: best_j[b],
                state: State::M,
            };
        }
    }
    ends
}

fn align_group(
    ctx: &ScoringContext,
    query: &Profile,
    qrows: &QueryRows,
    subjects: &[&Profile],
    mats: &mut [BinLease<'_, ViterbiMatrix>],
) -> Vec<ViterbiResult> {
    #[cfg(feature = "simd")]
    {
        let group = LaneGroup::new(ctx, subjects);
        let ends = fill_group(ctx, query, qrows, &group, mats);
        subjects
            .iter()
            .zip(mats.iter())
            .zip(ends)
            .map(|((s, mat), end)| traceback(mat, ctx.mode, end, query.len(), s.len()))
            .collect()
    }
    #[cfg(not(feature = "simd"))]
    {
        let _ = qrows;
        subjects
            .iter()
            .zip(mats.iter_mut())
            .map(|(s, mat)| {
                let end = super::scalar_ref::fill(ctx, query, s, mat);
                traceback(mat, ctx.mode, end, query.len(), s.len())
            })
            .collect()
    }
}

/// Viterbi aligner for batches of up to `MAXBINS` subjects against one query.
pub struct ViterbiEngine {
    ctx: Arc<ScoringContext>,
    pool: MatrixPool<ViterbiMatrix>,
}

impl ViterbiEngine {
    pub fn new(ctx: Arc<ScoringContext>, bins: usize) -> Self {
        Self {
            ctx,
            pool: MatrixPool::new(bins),
        }
    }

    pub fn bins(&self) -> usize {
        self.pool.capacity()
    }

    pub fn context(&self) -> &ScoringContext {
        &self.ctx
    }

    /// Align `query` against every subject of one batch.
    ///
    /// The outer error is batch-level (no free bins, malformed query); pair
    /// failures come back in the matching slot of the result.
    pub fn align_batch(
        &self,
        query: &Profile,
        subjects: &[&Profile],
    ) -> SearchResult<Vec<PairOutcome<ViterbiResult>>> {
        if subjects.len() > self.pool.capacity() {
            return Err(SearchError::ResourceExhausted {
                requested: subjects.len(),
                available: self.pool.capacity(),
            });
        }
        query.validate()?;

        let mut outcomes: Vec<Option<PairOutcome<ViterbiResult>>> =
            subjects.iter().map(|_| None).collect();
        let query_short = self.ctx.too_short(query);
        let mut eligible = Vec::with_capacity(subjects.len());
        for (k, s) in subjects.iter().enumerate() {
            if let Err(e) = s.validate() {
                outcomes[k] = Some(PairOutcome::Failed(e));
            } else if query_short || self.ctx.too_short(s) {
                outcomes[k] = Some(PairOutcome::NoMatch);
            } else {
                eligible.push(k);
            }
        }

        let leases = self.pool.lease(eligible.len())?;
        debug!(
            query = query.name(),
            pairs = eligible.len(),
            skipped = subjects.len() - eligible.len(),
            "viterbi batch"
        );

        let qrows = QueryRows::new(&self.ctx, query);
        let mut leases = leases.into_iter();
        let groups: Vec<(Vec<usize>, Vec<BinLease<'_, ViterbiMatrix>>)> = eligible
            .chunks(LANES)
            .map(|chunk| (chunk.to_vec(), leases.by_ref().take(chunk.len()).collect()))
            .collect();

        let ctx = &*self.ctx;
        let qrows = &qrows;
        let done: Vec<Vec<(usize, ViterbiResult)>> = par_map_owned!(groups, |(idx, mut mats)| {
            let members: Vec<&Profile> = idx.iter().map(|&k| subjects[k]).collect();
            let results = align_group(ctx, query, qrows, &members, &mut mats);
            idx.into_iter().zip(results).collect::<Vec<_>>()
        });
        for (k, res) in done.into_iter().flatten() {
            outcomes[k] = Some(PairOutcome::Aligned(res));
        }

        Ok(outcomes
            .into_iter()
            .map(|o| o.unwrap_or(PairOutcome::NoMatch))
            .collect())
    }

    pub fn align_pair(
        &self,
        query: &Profile,
        subject: &Profile,
    ) -> SearchResult<PairOutcome<ViterbiResult>> {
        let mut out = self.align_batch(query, &[subject])?;
        Ok(out.pop().unwrap_or(PairOutcome::NoMatch))
    }
}

//! Forward/backward posterior probabilities and maximum-accuracy (MAC) decoding.
//!
//! Sums run in natural-log space, so no row rescaling is needed. The forward
//! match values of every bin are kept in that bin's matrix; the backward pass
//! combines them with the backward values into per-cell posteriors, and MAC
//! decoding then picks the path maximizing `sum (P - mact)` over aligned cells.

use super::lanes::{
    floor_clamp, lane, log_sum_exp, log_sum_exp_scalar, splat_column, LaneGroup, LANES,
};
use super::pool::{BinLease, MatrixPool};
use super::scoring::{QueryRows, ScoringContext, LOG_FLOOR};
use super::types::{push_rev, AlignmentMode, AlignmentPath, PairOutcome, PathOp, PosteriorResult};
use crate::error::{SearchError, SearchResult};
use crate::profile::Profile;
use std::f32::consts::LN_2;
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;
use wide::f32x8;

const MAC_DIAG: u8 = 0;
const MAC_START: u8 = 1;
const MAC_UP: u8 = 2;
const MAC_LEFT: u8 = 3;

/// Subject columns (1-based, inclusive) allowed to be matched per query row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    bounds: Vec<(usize, usize)>,
}

impl Envelope {
    pub fn full(query_len: usize, subject_len: usize) -> Self {
        let mut bounds = vec![(1, subject_len); query_len + 1];
        bounds[0] = (1, 0);
        Self { bounds }
    }

    /// Band of `margin` rows and columns around a previous path.
    pub fn around_path(
        query_len: usize,
        subject_len: usize,
        query_start: usize,
        subject_start: usize,
        path: &AlignmentPath,
        margin: usize,
    ) -> Self {
        let mut covered: Vec<Option<(usize, usize)>> = vec![None; query_len + 1];
        let mut mark = |row: usize, col: usize| {
            if row == 0 || row > query_len || subject_len == 0 {
                return;
            }
            let col = col.clamp(1, subject_len);
            let slot = &mut covered[row];
            *slot = Some(match *slot {
                Some((lo, hi)) => (lo.min(col), hi.max(col)),
                None => (col, col),
            });
        };
        let mut qi = query_start;
        let mut tj = subject_start;
        for &(op, n) in &path.ops {
            for _ in 0..n {
                match op {
                    PathOp::Match => {
                        qi += 1;
                        tj += 1;
                        mark(qi, tj);
                    }
                    PathOp::Ins => {
                        qi += 1;
                        mark(qi, tj);
                        mark(qi, tj + 1);
                    }
                    PathOp::Del => {
                        tj += 1;
                        mark(qi.max(1), tj);
                    }
                }
            }
        }

        let mut bounds = vec![(1, 0); query_len + 1];
        for (r, bound) in bounds.iter_mut().enumerate().skip(1) {
            let from = r.saturating_sub(margin).max(1);
            let to = (r + margin).min(query_len);
            let mut band: Option<(usize, usize)> = None;
            for c in covered[from..=to].iter().flatten() {
                band = Some(match band {
                    Some((lo, hi)) => (lo.min(c.0), hi.max(c.1)),
                    None => *c,
                });
            }
            if let Some((lo, hi)) = band {
                *bound = (lo.saturating_sub(margin).max(1), (hi + margin).min(subject_len));
            }
        }
        Self { bounds }
    }

    pub fn rows(&self) -> usize {
        self.bounds.len()
    }

    #[inline]
    pub fn contains(&self, i: usize, j: usize) -> bool {
        match self.bounds.get(i) {
            Some(&(lo, hi)) => lo <= j && j <= hi,
            None => false,
        }
    }
}

/// Per-bin storage for forward values, posteriors and the MAC matrix.
#[derive(Default)]
pub struct PosteriorMatrix {
    fwd: Vec<f32>,
    post: Vec<f32>,
    mac: Vec<f32>,
    trace: Vec<u8>,
    cols: usize,
}

impl PosteriorMatrix {
    pub(crate) fn prepare(&mut self, rows: usize, cols: usize) {
        let need = rows * cols;
        if self.fwd.len() < need {
            self.fwd.resize(need, LOG_FLOOR);
            self.post.resize(need, 0.0);
            self.mac.resize(need, 0.0);
            self.trace.resize(need, 0);
        }
        self.cols = cols;
    }

    #[inline]
    fn idx(&self, i: usize, j: usize) -> usize {
        i * self.cols + j
    }

    /// Posterior probability that query column `i` matches subject column `j` (1-based).
    #[inline]
    pub fn probability(&self, i: usize, j: usize) -> f32 {
        self.post[self.idx(i, j)]
    }

    pub fn capacity(&self) -> usize {
        self.fwd.len()
    }
}

/// One pair of a posterior batch.
#[derive(Clone, Copy, Debug)]
pub struct PosteriorRequest<'a> {
    pub subject: &'a Profile,
    pub envelope: Option<&'a Envelope>,
}

/// Forward/backward over one lane group. Fills posteriors into the bins and
/// returns the log partition function (nats) per lane.
pub(crate) fn posterior_group(
    ctx: &ScoringContext,
    query: &Profile,
    qrows: &QueryRows,
    group: &LaneGroup,
    envs: &[Option<&Envelope>],
    mats: &mut [BinLease<'_, PosteriorMatrix>],
) -> [f32; LANES] {
    let lq = query.len();
    let cols = group.max_len + 1;
    let global = ctx.mode == AlignmentMode::Global;
    let floor = f32x8::splat(LOG_FLOOR);
    let zero = f32x8::splat(0.0);
    let ln2 = f32x8::splat(LN_2);
    let shift = f32x8::splat(ctx.shift);

    let to_nats = |v: &[f32x8]| -> Vec<f32x8> { v.iter().map(|&x| x * ln2).collect() };
    let mm = to_nats(&group.mm[..]);
    let open = to_nats(&group.open[..]);
    let extend = to_nats(&group.extend[..]);

    let any_env = envs.iter().any(|e| e.is_some());
    let env_mask = |i: usize, j: usize| -> f32x8 {
        if !any_env {
            return zero;
        }
        let mut arr = [0.0f32; LANES];
        for (b, env) in envs.iter().enumerate() {
            if let Some(e) = env {
                if !e.contains(i, j) {
                    arr[b] = LOG_FLOOR;
                }
            }
        }
        f32x8::from(arr)
    };

    for (b, mat) in mats.iter_mut().enumerate() {
        mat.prepare(lq + 1, group.lens[b] + 1);
    }

    // forward
    let mut fm_prev = vec![floor; cols];
    let mut fq_prev = vec![floor; cols];
    let mut ft_prev = vec![floor; cols];
    let mut fm_cur = vec![floor; cols];
    let mut fq_cur = vec![floor; cols];
    let mut ft_cur = vec![floor; cols];
    if global {
        fm_prev[0] = floor_clamp(zero + group.pad[0]);
        let t_open = f32x8::splat(qrows.open[0] * LN_2);
        let t_ext = f32x8::splat(qrows.extend[0] * LN_2);
        for j in 1..cols {
            let v = log_sum_exp(fm_prev[j - 1] + t_open, ft_prev[j - 1] + t_ext);
            ft_prev[j] = floor_clamp(v + group.pad[j]);
        }
    }

    let mut total = floor;
    for i in 1..=lq {
        let q = splat_column(&query.columns()[i - 1].freqs);
        let q_mm = f32x8::splat(qrows.mm[i - 1] * LN_2);
        let t_open = f32x8::splat(qrows.open[i] * LN_2);
        let t_ext = f32x8::splat(qrows.extend[i] * LN_2);

        fm_cur[0] = floor;
        ft_cur[0] = floor;
        fq_cur[0] = if global {
            let v = log_sum_exp(fm_prev[0] + open[0], fq_prev[0] + extend[0]);
            floor_clamp(v + group.pad[0])
        } else {
            floor
        };

        for j in 1..cols {
            let s = group.score(&q, j, shift) * ln2;
            let mut pred = log_sum_exp(fm_prev[j - 1] + q_mm + mm[j - 1], fq_prev[j - 1]);
            pred = log_sum_exp(pred, ft_prev[j - 1]);
            if !global {
                pred = log_sum_exp(pred, zero);
            }
            let fm = floor_clamp(s + pred + group.pad[j] + env_mask(i, j));
            let fq = floor_clamp(
                log_sum_exp(fm_prev[j] + open[j], fq_prev[j] + extend[j]) + group.pad[j],
            );
            let ft = floor_clamp(
                log_sum_exp(fm_cur[j - 1] + t_open, ft_cur[j - 1] + t_ext) + group.pad[j],
            );
            fm_cur[j] = fm;
            fq_cur[j] = fq;
            ft_cur[j] = ft;
            if !global {
                total = log_sum_exp(total, fm);
            }
            let vals = fm.to_array();
            for (b, mat) in mats.iter_mut().enumerate() {
                if j <= group.lens[b] {
                    let k = mat.idx(i, j);
                    mat.fwd[k] = vals[b];
                }
            }
        }
        std::mem::swap(&mut fm_prev, &mut fm_cur);
        std::mem::swap(&mut fq_prev, &mut fq_cur);
        std::mem::swap(&mut ft_prev, &mut ft_cur);
    }

    let mut log_z = [LOG_FLOOR; LANES];
    for (b, z) in log_z.iter_mut().enumerate().take(group.active) {
        *z = if global {
            let lb = group.lens[b];
            let t = log_sum_exp_scalar(lane(fm_prev[lb], b), lane(fq_prev[lb], b));
            log_sum_exp_scalar(t, lane(ft_prev[lb], b))
        } else {
            lane(total, b)
        };
    }

    // backward
    let mut z_arr = [0.0f32; LANES];
    for b in 0..group.active {
        if !is_degenerate(log_z[b]) {
            z_arr[b] = log_z[b];
        }
    }
    let z_vec = f32x8::from(z_arr);

    let end_global: Vec<f32x8> = (0..cols)
        .map(|j| {
            let mut arr = [LOG_FLOOR; LANES];
            for b in 0..group.active {
                if group.lens[b] == j {
                    arr[b] = 0.0;
                }
            }
            f32x8::from(arr)
        })
        .collect();

    let mut bm_next = vec![floor; cols + 1];
    let mut bq_next = vec![floor; cols + 1];
    let mut em_next = vec![floor; cols + 1];
    let mut bm_cur = vec![floor; cols + 1];
    let mut bq_cur = vec![floor; cols + 1];
    let mut bt_cur = vec![floor; cols + 1];
    let mut em_cur = vec![floor; cols + 1];

    for i in (1..=lq).rev() {
        let q = splat_column(&query.columns()[i - 1].freqs);
        for j in 1..cols {
            em_cur[j] = group.score(&q, j, shift) * ln2 + group.pad[j] + env_mask(i, j);
        }
        let q_mm = f32x8::splat(qrows.mm[i] * LN_2);
        let t_open = f32x8::splat(qrows.open[i] * LN_2);
        let t_ext = f32x8::splat(qrows.extend[i] * LN_2);
        bm_cur[cols] = floor;
        bq_cur[cols] = floor;
        bt_cur[cols] = floor;

        for j in (1..cols).rev() {
            let diag = bm_next[j + 1] + em_next[j + 1];
            let gaps = log_sum_exp(bq_next[j] + open[j], bt_cur[j + 1] + t_open);
            let mut bm = log_sum_exp(diag + q_mm + mm[j], gaps);
            let mut bq = log_sum_exp(diag, bq_next[j] + extend[j]);
            let mut bt = log_sum_exp(diag, bt_cur[j + 1] + t_ext);
            if !global {
                bm = log_sum_exp(bm, zero);
            } else if i == lq {
                bm = log_sum_exp(bm, end_global[j]);
                bq = log_sum_exp(bq, end_global[j]);
                bt = log_sum_exp(bt, end_global[j]);
            }
            let bm = floor_clamp(bm + group.pad[j]);
            bm_cur[j] = bm;
            bq_cur[j] = floor_clamp(bq + group.pad[j]);
            bt_cur[j] = floor_clamp(bt + group.pad[j]);

            let mut fwd = [LOG_FLOOR; LANES];
            for (b, mat) in mats.iter().enumerate() {
                if j <= group.lens[b] {
                    fwd[b] = mat.fwd[mat.idx(i, j)];
                }
            }
            let p = (f32x8::from(fwd) + bm - z_vec).exp().to_array();
            for (b, mat) in mats.iter_mut().enumerate() {
                if j <= group.lens[b] {
                    let k = mat.idx(i, j);
                    mat.post[k] = p[b].clamp(0.0, 1.0);
                }
            }
        }
        std::mem::swap(&mut bm_next, &mut bm_cur);
        std::mem::swap(&mut bq_next, &mut bq_cur);
        std::mem::swap(&mut em_next, &mut em_cur);
    }

    log_z
}

#[inline]
pub(crate) fn is_degenerate(log_z: f32) -> bool {
    !log_z.is_finite() || log_z <= LOG_FLOOR * 0.5
}

struct MacPath {
    query_range: Range<usize>,
    subject_range: Range<usize>,
    path: AlignmentPath,
    sum_probability: f32,
}

/// Maximum-accuracy decoding over the posteriors of one bin.
///
/// `A(i,j) = max(P(i,j) - mact + max(A(i-1,j-1), 0), A(i-1,j) - mact/2, A(i,j-1) - mact/2)`.
/// Ties prefer the diagonal, then the query gap; the first best cell in
/// row-major order wins.
fn mac_decode(
    mat: &mut PosteriorMatrix,
    query_len: usize,
    subject_len: usize,
    mact: f32,
    envelope: Option<&Envelope>,
) -> Option<MacPath> {
    let half = 0.5 * mact;
    for j in 0..=subject_len {
        let k = mat.idx(0, j);
        mat.mac[k] = 0.0;
    }
    let mut best = 0.0f32;
    let mut best_cell = None;
    for i in 1..=query_len {
        let k0 = mat.idx(i, 0);
        mat.mac[k0] = 0.0;
        for j in 1..=subject_len {
            let diag_prev = mat.mac[mat.idx(i - 1, j - 1)];
            let (mut val, mut dir) = if envelope.is_some_and(|e| !e.contains(i, j)) {
                (LOG_FLOOR, MAC_START)
            } else if diag_prev > 0.0 {
                (mat.post[mat.idx(i, j)] - mact + diag_prev, MAC_DIAG)
            } else {
                (mat.post[mat.idx(i, j)] - mact, MAC_START)
            };
            let diag_val = val;
            let up = mat.mac[mat.idx(i - 1, j)] - half;
            if up > val {
                val = up;
                dir = MAC_UP;
            }
            let left = mat.mac[mat.idx(i, j - 1)] - half;
            if left > val {
                val = left;
                dir = MAC_LEFT;
            }
            let k = mat.idx(i, j);
            mat.mac[k] = val;
            mat.trace[k] = dir;
            if (dir == MAC_DIAG || dir == MAC_START) && diag_val > best {
                best = diag_val;
                best_cell = Some((i, j));
            }
        }
    }

    let (end_i, end_j) = best_cell?;
    let mut ops = Vec::new();
    let (mut i, mut j) = (end_i, end_j);
    let mut sum = 0.0f32;
    while i > 0 && j > 0 {
        let k = mat.idx(i, j);
        match mat.trace[k] {
            MAC_DIAG | MAC_START => {
                push_rev(&mut ops, PathOp::Match, 1);
                sum += mat.post[k];
                let start = mat.trace[k] == MAC_START;
                i -= 1;
                j -= 1;
                if start {
                    break;
                }
            }
            MAC_UP => {
                push_rev(&mut ops, PathOp::Ins, 1);
                i -= 1;
            }
            _ => {
                push_rev(&mut ops, PathOp::Del, 1);
                j -= 1;
            }
        }
    }
    Some(MacPath {
        query_range: i..end_i,
        subject_range: j..end_j,
        path: AlignmentPath::from_reversed(ops),
        sum_probability: sum,
    })
}

fn finish_lane(
    mat: &mut PosteriorMatrix,
    query_len: usize,
    subject: &Profile,
    envelope: Option<&Envelope>,
    log_z: f32,
    mact: f32,
) -> PairOutcome<PosteriorResult> {
    if is_degenerate(log_z) {
        return PairOutcome::Failed(SearchError::NumericDegenerate {
            name: subject.name().to_string(),
            log_z,
        });
    }
    match mac_decode(mat, query_len, subject.len(), mact, envelope) {
        Some(mac) => {
            let n = mac.path.matches().max(1) as f32;
            PairOutcome::Aligned(PosteriorResult {
                query_range: mac.query_range,
                subject_range: mac.subject_range,
                mean_probability: mac.sum_probability / n,
                sum_probability: mac.sum_probability,
                path: mac.path,
                log_z,
            })
        }
        None => PairOutcome::NoMatch,
    }
}

/// Forward/backward decoder producing posteriors and MAC alignments.
pub struct PosteriorEngine {
    ctx: Arc<ScoringContext>,
    pool: MatrixPool<PosteriorMatrix>,
    mact: f32,
}

impl PosteriorEngine {
    pub fn new(ctx: Arc<ScoringContext>, bins: usize, mact: f32) -> Self {
        Self {
            ctx,
            pool: MatrixPool::new(bins),
            mact,
        }
    }

    pub fn bins(&self) -> usize {
        self.pool.capacity()
    }

    pub fn mact(&self) -> f32 {
        self.mact
    }

    /// Posterior decoding of one batch. Same error split as the Viterbi batch:
    /// the outer error concerns the whole batch, pair failures stay in their slot.
    pub fn decode_batch(
        &self,
        query: &Profile,
        requests: &[PosteriorRequest<'_>],
    ) -> SearchResult<Vec<PairOutcome<PosteriorResult>>> {
        if requests.len() > self.pool.capacity() {
            return Err(SearchError::ResourceExhausted {
                requested: requests.len(),
                available: self.pool.capacity(),
            });
        }
        query.validate()?;

        let mut outcomes: Vec<Option<PairOutcome<PosteriorResult>>> =
            requests.iter().map(|_| None).collect();
        let query_short = self.ctx.too_short(query);
        let mut eligible = Vec::with_capacity(requests.len());
        for (k, req) in requests.iter().enumerate() {
            if let Err(e) = req.subject.validate() {
                outcomes[k] = Some(PairOutcome::Failed(e));
            } else if query_short || self.ctx.too_short(req.subject) {
                outcomes[k] = Some(PairOutcome::NoMatch);
            } else if req.envelope.is_some_and(|e| e.rows() != query.len() + 1) {
                outcomes[k] = Some(PairOutcome::Failed(SearchError::malformed(
                    req.subject.name(),
                    "envelope does not match the query length",
                )));
            } else {
                eligible.push(k);
            }
        }

        let leases = self.pool.lease(eligible.len())?;
        debug!(query = query.name(), pairs = eligible.len(), "posterior batch");

        let qrows = QueryRows::new(&self.ctx, query);
        let mut leases = leases.into_iter();
        let groups: Vec<(Vec<usize>, Vec<BinLease<'_, PosteriorMatrix>>)> = eligible
            .chunks(LANES)
            .map(|chunk| (chunk.to_vec(), leases.by_ref().take(chunk.len()).collect()))
            .collect();

        let ctx = &*self.ctx;
        let qrows = &qrows;
        let mact = self.mact;
        let done: Vec<Vec<(usize, PairOutcome<PosteriorResult>)>> =
            par_map_owned!(groups, |(idx, mut mats)| {
                let members: Vec<&Profile> = idx.iter().map(|&k| requests[k].subject).collect();
                let envs: Vec<Option<&Envelope>> =
                    idx.iter().map(|&k| requests[k].envelope).collect();
                let group = LaneGroup::new(ctx, &members);
                let log_z = posterior_group(ctx, query, qrows, &group, &envs, &mut mats);
                idx.iter()
                    .enumerate()
                    .map(|(b, &k)| {
                        let out = finish_lane(
                            &mut mats[b],
                            query.len(),
                            members[b],
                            envs[b],
                            log_z[b],
                            mact,
                        );
                        (k, out)
                    })
                    .collect::<Vec<_>>()
            });
        for (k, out) in done.into_iter().flatten() {
            outcomes[k] = Some(out);
        }
        Ok(outcomes
            .into_iter()
            .map(|o| o.unwrap_or(PairOutcome::NoMatch))
            .collect())
    }

    pub fn decode_pair(
        &self,
        query: &Profile,
        subject: &Profile,
        envelope: Option<&Envelope>,
    ) -> SearchResult<PairOutcome<PosteriorResult>> {
        let mut out = self.decode_batch(query, &[PosteriorRequest { subject, envelope }])?;
        Ok(out.pop().unwrap_or(PairOutcome::NoMatch))
    }
}

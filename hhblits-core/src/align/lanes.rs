use super::scoring::{
    gap_extend_after, gap_open_after, match_to_match, ScoringContext, INV_LN2, LOG_FLOOR, MIN_ODDS,
};
use crate::alphabet::NAA;
use crate::profile::Profile;
use wide::f32x8;

/// One lane per bin: a group advances up to `LANES` subjects in lock-step.
pub const LANES: usize = 8;

/// Subject-side data of up to `LANES` bins, interleaved by column.
///
/// Column indices are 1-based; index 0 is the boundary column. Lanes without
/// a subject, and columns past a subject's length, carry `LOG_FLOOR` in `pad`.
pub(crate) struct LaneGroup {
    /// Subject length per lane; 0 for empty lanes.
    pub lens: [usize; LANES],
    /// Number of lanes holding a subject.
    pub active: usize,
    /// Longest subject in the group.
    pub max_len: usize,
    /// `odds[j * NAA + a]` = `t_j(a) / pb(a)` per lane.
    pub odds: Vec<f32x8>,
    /// Subject match-to-match bits after column `j`.
    pub mm: Vec<f32x8>,
    /// Cost of opening a query-residue gap after subject column `j`.
    pub open: Vec<f32x8>,
    /// Cost of extending that gap.
    pub extend: Vec<f32x8>,
    /// 0 for real cells, `LOG_FLOOR` for padding.
    pub pad: Vec<f32x8>,
}

impl LaneGroup {
    pub fn new(ctx: &ScoringContext, subjects: &[&Profile]) -> Self {
        debug_assert!(subjects.len() <= LANES);
        let mut lens = [0usize; LANES];
        for (slot, p) in lens.iter_mut().zip(subjects) {
            *slot = p.len();
        }
        let max_len = lens.iter().copied().max().unwrap_or(0);
        let cols = max_len + 1;

        let mut odds = vec![f32x8::splat(0.0); cols * NAA];
        let mut mm = vec![f32x8::splat(0.0); cols];
        let mut open = vec![f32x8::splat(ctx.gap_open); cols];
        let mut extend = vec![f32x8::splat(ctx.gap_extend); cols];
        let mut pad = vec![f32x8::splat(0.0); cols];

        for j in 0..cols {
            let mut lane_mm = [0.0f32; LANES];
            let mut lane_open = [ctx.gap_open; LANES];
            let mut lane_ext = [ctx.gap_extend; LANES];
            let mut lane_pad = [LOG_FLOOR; LANES];
            let mut lane_odds = [[0.0f32; LANES]; NAA];
            for (lane, p) in subjects.iter().enumerate() {
                if j > p.len() {
                    continue;
                }
                lane_pad[lane] = 0.0;
                lane_mm[lane] = match_to_match(p, j);
                lane_open[lane] = gap_open_after(ctx, p, j);
                lane_ext[lane] = gap_extend_after(ctx, p, j);
                if j > 0 {
                    let o = ctx.subject_odds(&p.columns()[j - 1]);
                    for a in 0..NAA {
                        lane_odds[a][lane] = o[a];
                    }
                }
            }
            mm[j] = f32x8::from(lane_mm);
            open[j] = f32x8::from(lane_open);
            extend[j] = f32x8::from(lane_ext);
            pad[j] = f32x8::from(lane_pad);
            for a in 0..NAA {
                odds[j * NAA + a] = f32x8::from(lane_odds[a]);
            }
        }
        // boundary column is valid only for real lanes
        let mut boundary = [LOG_FLOOR; LANES];
        for slot in boundary.iter_mut().take(subjects.len()) {
            *slot = 0.0;
        }
        pad[0] = f32x8::from(boundary);

        Self {
            lens,
            active: subjects.len(),
            max_len,
            odds,
            mm,
            open,
            extend,
            pad,
        }
    }

    /// Column scores (bits) of query column `q` against subject column `j`.
    #[inline]
    pub fn score(&self, q: &[f32x8; NAA], j: usize, shift: f32x8) -> f32x8 {
        let base = j * NAA;
        let mut dot = f32x8::splat(0.0);
        for a in 0..NAA {
            dot = dot + q[a] * self.odds[base + a];
        }
        dot.max(f32x8::splat(MIN_ODDS)).ln() * f32x8::splat(INV_LN2) + shift
    }
}

/// Broadcast one query column across all lanes.
#[inline]
pub(crate) fn splat_column(freqs: &[f32; NAA]) -> [f32x8; NAA] {
    let mut out = [f32x8::splat(0.0); NAA];
    for a in 0..NAA {
        out[a] = f32x8::splat(freqs[a]);
    }
    out
}

#[inline]
pub(crate) fn floor_clamp(v: f32x8) -> f32x8 {
    v.max(f32x8::splat(LOG_FLOOR))
}

/// `ln(exp(a) + exp(b))` per lane.
#[inline]
pub(crate) fn log_sum_exp(a: f32x8, b: f32x8) -> f32x8 {
    let hi = a.max(b);
    let lo = a.min(b);
    hi + (f32x8::splat(1.0) + (lo - hi).exp()).ln()
}

#[inline]
pub(crate) fn log_sum_exp_scalar(a: f32, b: f32) -> f32 {
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    hi + (1.0 + (lo - hi).exp()).ln()
}

#[inline]
pub(crate) fn lane(v: f32x8, b: usize) -> f32 {
    v.to_array()[b]
}

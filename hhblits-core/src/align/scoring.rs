use super::types::AlignmentMode;
use crate::alphabet::{BACKGROUND, NAA};
use crate::config::SearchConfig;
use crate::profile::{Profile, ProfileColumn};

/// Lower bound on the column odds ratio before taking the log.
pub const MIN_ODDS: f32 = 1.0e-4;

/// Finite stand-in for minus infinity. Adding penalties to it is absorbing in f32.
pub const LOG_FLOOR: f32 = -1.0e20;

pub(crate) const INV_LN2: f32 = std::f32::consts::LOG2_E;

/// Read-only scoring parameters shared by every worker of a search.
#[derive(Clone, Debug)]
pub struct ScoringContext {
    pub mode: AlignmentMode,
    /// Bits, <= 0.
    pub gap_open: f32,
    /// Bits, <= 0.
    pub gap_extend: f32,
    /// Added to every column score.
    pub shift: f32,
    pub min_len: usize,
    inv_background: [f32; NAA],
}

impl ScoringContext {
    pub fn new(mode: AlignmentMode, gap_open: f32, gap_extend: f32, shift: f32) -> Self {
        let mut inv_background = [0.0f32; NAA];
        for (inv, &bg) in inv_background.iter_mut().zip(BACKGROUND.iter()) {
            *inv = 1.0 / bg;
        }
        Self {
            mode,
            gap_open,
            gap_extend,
            shift,
            min_len: 1,
            inv_background,
        }
    }

    pub fn from_config(config: &SearchConfig) -> Self {
        let mut ctx = Self::new(
            config.mode,
            config.gap_open,
            config.gap_extend,
            config.score_shift,
        );
        ctx.min_len = config.min_profile_len.max(1);
        ctx
    }

    pub fn with_mode(mut self, mode: AlignmentMode) -> Self {
        self.mode = mode;
        self
    }

    /// `t(a) / pb(a)` for one subject column.
    #[inline]
    pub fn subject_odds(&self, col: &ProfileColumn) -> [f32; NAA] {
        let mut odds = [0.0f32; NAA];
        for a in 0..NAA {
            odds[a] = col.freqs[a] * self.inv_background[a];
        }
        odds
    }

    /// Log-odds score in bits from the dot product `sum q(a) t(a) / pb(a)`.
    #[inline]
    pub fn score_from_dot(&self, dot: f32) -> f32 {
        dot.max(MIN_ODDS).ln() * INV_LN2 + self.shift
    }

    pub fn column_score(&self, q: &ProfileColumn, t: &ProfileColumn) -> f32 {
        let odds = self.subject_odds(t);
        let dot: f32 = q.freqs.iter().zip(odds.iter()).map(|(a, b)| a * b).sum();
        self.score_from_dot(dot)
    }

    pub fn too_short(&self, profile: &Profile) -> bool {
        profile.len() < self.min_len
    }
}

// Transition helpers. Column indices are 1-based; index 0 stands for the
// boundary before the first column and carries neutral transitions.

/// Match-to-match transition leaving column `i`.
#[inline]
pub(crate) fn match_to_match(p: &Profile, i: usize) -> f32 {
    if i == 0 {
        0.0
    } else {
        p.transition(i - 1).match_to_match
    }
}

/// Cost of opening a gap in the other sequence right after column `i` of `p`.
#[inline]
pub(crate) fn gap_open_after(ctx: &ScoringContext, p: &Profile, i: usize) -> f32 {
    if i == 0 {
        ctx.gap_open
    } else {
        ctx.gap_open + p.transition(i - 1).match_to_insert
    }
}

#[inline]
pub(crate) fn gap_extend_after(ctx: &ScoringContext, p: &Profile, i: usize) -> f32 {
    if i == 0 {
        ctx.gap_extend
    } else {
        ctx.gap_extend + p.transition(i - 1).insert_to_insert
    }
}

/// Per-row query terms, shared by every subject of a batch.
pub(crate) struct QueryRows {
    /// `match_to_match(query, i)` for i in 0..=len.
    pub mm: Vec<f32>,
    /// Gap open/extend for subject columns placed after query column i.
    pub open: Vec<f32>,
    pub extend: Vec<f32>,
}

impl QueryRows {
    pub fn new(ctx: &ScoringContext, query: &Profile) -> Self {
        let n = query.len();
        Self {
            mm: (0..=n).map(|i| match_to_match(query, i)).collect(),
            open: (0..=n).map(|i| gap_open_after(ctx, query, i)).collect(),
            extend: (0..=n).map(|i| gap_extend_after(ctx, query, i)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_columns_score_positive() {
        let ctx = ScoringContext::new(AlignmentMode::Local, -3.0, -1.0, 0.0);
        let y = ProfileColumn::one_hot(18);
        let a = ProfileColumn::one_hot(0);
        assert!(ctx.column_score(&y, &y) > 4.0);
        assert!(ctx.column_score(&y, &a) < -10.0);
    }

    #[test]
    fn background_columns_score_near_zero() {
        let ctx = ScoringContext::new(AlignmentMode::Local, -3.0, -1.0, 0.0);
        let bg = ProfileColumn::background();
        let s = ctx.column_score(&bg, &bg);
        // sum pb(a)^2 / pb(a) == 1
        assert!(s.abs() < 1e-3, "{s}");
    }

    #[test]
    fn shift_is_additive() {
        let base = ScoringContext::new(AlignmentMode::Local, -3.0, -1.0, 0.0);
        let shifted = ScoringContext::new(AlignmentMode::Local, -3.0, -1.0, -0.5);
        let c = ProfileColumn::one_hot(4);
        let d = base.column_score(&c, &c) - shifted.column_score(&c, &c);
        assert!((d - 0.5).abs() < 1e-5);
    }

    #[test]
    fn boundary_transitions_are_neutral() {
        let ctx = ScoringContext::new(AlignmentMode::Global, -3.0, -1.0, 0.0);
        let rows: Vec<&[u8]> = vec![b"ACD", b"AcCD"];
        let p = Profile::from_a3m_rows("p", &rows).unwrap();
        assert_eq!(match_to_match(&p, 0), 0.0);
        assert_eq!(gap_open_after(&ctx, &p, 0), -3.0);
        assert!(gap_open_after(&ctx, &p, 1) < -3.0);
        let q = QueryRows::new(&ctx, &p);
        assert_eq!(q.mm.len(), 4);
    }
}

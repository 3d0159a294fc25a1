use super::lanes::log_sum_exp_scalar;
use super::scoring::{gap_extend_after, gap_open_after, match_to_match, ScoringContext, LOG_FLOOR};
use super::types::{AlignmentMode, PairOutcome, PathOp, ViterbiResult};
use super::viterbi::{
    global_end, traceback, Endpoint, State, ViterbiMatrix, FROM_M, FROM_QI, FROM_START, FROM_TI,
    QI_EXTEND, TI_EXTEND,
};
use crate::alphabet::NAA;
use crate::error::SearchResult;
use crate::profile::Profile;
use std::f32::consts::LN_2;

fn subject_odds(ctx: &ScoringContext, subject: &Profile) -> Vec<[f32; NAA]> {
    subject
        .columns()
        .iter()
        .map(|c| ctx.subject_odds(c))
        .collect()
}

#[inline]
fn dot(q: &[f32; NAA], odds: &[f32; NAA]) -> f32 {
    let mut d = 0.0f32;
    for a in 0..NAA {
        d += q[a] * odds[a];
    }
    d
}

/// Single-pair Viterbi fill into `mat`; same recurrence as the lane kernel.
pub(crate) fn fill(
    ctx: &ScoringContext,
    query: &Profile,
    subject: &Profile,
    mat: &mut ViterbiMatrix,
) -> Endpoint {
    let lq = query.len();
    let lt = subject.len();
    let global = ctx.mode == AlignmentMode::Global;
    mat.prepare(lq + 1, lt + 1);
    let odds = subject_odds(ctx, subject);

    let mut m_prev = vec![LOG_FLOOR; lt + 1];
    let mut qi_prev = vec![LOG_FLOOR; lt + 1];
    let mut ti_prev = vec![LOG_FLOOR; lt + 1];
    let mut m_cur = vec![LOG_FLOOR; lt + 1];
    let mut qi_cur = vec![LOG_FLOOR; lt + 1];
    let mut ti_cur = vec![LOG_FLOOR; lt + 1];

    if global {
        m_prev[0] = 0.0;
        let open = gap_open_after(ctx, query, 0);
        let extend = gap_extend_after(ctx, query, 0);
        for j in 1..=lt {
            ti_prev[j] = (m_prev[j - 1] + open)
                .max(ti_prev[j - 1] + extend)
                .max(LOG_FLOOR);
        }
    }

    let mut best = LOG_FLOOR;
    let (mut best_i, mut best_j) = (0usize, 0usize);

    for i in 1..=lq {
        let q = &query.columns()[i - 1].freqs;
        let q_mm = match_to_match(query, i - 1);
        let t_open = gap_open_after(ctx, query, i);
        let t_ext = gap_extend_after(ctx, query, i);

        m_cur[0] = LOG_FLOOR;
        ti_cur[0] = LOG_FLOOR;
        qi_cur[0] = if global {
            (m_prev[0] + gap_open_after(ctx, subject, 0))
                .max(qi_prev[0] + gap_extend_after(ctx, subject, 0))
                .max(LOG_FLOOR)
        } else {
            LOG_FLOOR
        };

        for j in 1..=lt {
            let s = ctx.score_from_dot(dot(q, &odds[j - 1]));

            let mut pred = m_prev[j - 1] + q_mm + match_to_match(subject, j - 1);
            let mut cell = FROM_M;
            if qi_prev[j - 1] > pred {
                pred = qi_prev[j - 1];
                cell = FROM_QI;
            }
            if ti_prev[j - 1] > pred {
                pred = ti_prev[j - 1];
                cell = FROM_TI;
            }
            if !global && 0.0 > pred {
                pred = 0.0;
                cell = FROM_START;
            }
            let m = (s + pred).max(LOG_FLOOR);

            let qi_open = m_prev[j] + gap_open_after(ctx, subject, j);
            let qi_ext = qi_prev[j] + gap_extend_after(ctx, subject, j);
            if qi_ext > qi_open {
                cell |= QI_EXTEND;
            }
            let ti_open = m_cur[j - 1] + t_open;
            let ti_ext = ti_cur[j - 1] + t_ext;
            if ti_ext > ti_open {
                cell |= TI_EXTEND;
            }

            m_cur[j] = m;
            qi_cur[j] = qi_open.max(qi_ext).max(LOG_FLOOR);
            ti_cur[j] = ti_open.max(ti_ext).max(LOG_FLOOR);
            mat.set(i, j, cell);

            if !global && m > best {
                best = m;
                best_i = i;
                best_j = j;
            }
        }

        std::mem::swap(&mut m_prev, &mut m_cur);
        std::mem::swap(&mut qi_prev, &mut qi_cur);
        std::mem::swap(&mut ti_prev, &mut ti_cur);
    }

    if global {
        global_end(m_prev[lt], qi_prev[lt], ti_prev[lt], lq, lt)
    } else {
        Endpoint {
            score: best,
            i: best_i,
            j: best_j,
            state: State::M,
        }
    }
}

/// Unbatched Viterbi with its own matrix.
pub fn viterbi_scalar(
    ctx: &ScoringContext,
    query: &Profile,
    subject: &Profile,
) -> SearchResult<PairOutcome<ViterbiResult>> {
    query.validate()?;
    if let Err(e) = subject.validate() {
        return Ok(PairOutcome::Failed(e));
    }
    if ctx.too_short(query) || ctx.too_short(subject) {
        return Ok(PairOutcome::NoMatch);
    }
    let mut mat = ViterbiMatrix::default();
    let end = fill(ctx, query, subject, &mut mat);
    Ok(PairOutcome::Aligned(traceback(
        &mat,
        ctx.mode,
        end,
        query.len(),
        subject.len(),
    )))
}

/// Re-score a path under the Viterbi model (bits).
pub fn score_path(
    ctx: &ScoringContext,
    query: &Profile,
    subject: &Profile,
    result: &ViterbiResult,
) -> f32 {
    let mut prev = match ctx.mode {
        AlignmentMode::Global => Some(State::M),
        AlignmentMode::Local => None,
    };
    // 1-based count of consumed columns
    let mut i = result.query_range.start;
    let mut j = result.subject_range.start;
    let mut score = 0.0f32;
    for &(op, n) in &result.path.ops {
        for _ in 0..n {
            match op {
                PathOp::Match => {
                    if prev == Some(State::M) {
                        score += match_to_match(query, i) + match_to_match(subject, j);
                    }
                    i += 1;
                    j += 1;
                    score += ctx.column_score(&query.columns()[i - 1], &subject.columns()[j - 1]);
                    prev = Some(State::M);
                }
                PathOp::Ins => {
                    score += if prev == Some(State::Qi) {
                        gap_extend_after(ctx, subject, j)
                    } else {
                        gap_open_after(ctx, subject, j)
                    };
                    i += 1;
                    prev = Some(State::Qi);
                }
                PathOp::Del => {
                    score += if prev == Some(State::Ti) {
                        gap_extend_after(ctx, query, i)
                    } else {
                        gap_open_after(ctx, query, i)
                    };
                    j += 1;
                    prev = Some(State::Ti);
                }
            }
        }
    }
    score
}

/// Log partition function (nats) by a plain forward pass, no envelope.
pub fn log_partition_scalar(ctx: &ScoringContext, query: &Profile, subject: &Profile) -> f32 {
    let lq = query.len();
    let lt = subject.len();
    let global = ctx.mode == AlignmentMode::Global;
    let odds = subject_odds(ctx, subject);
    let nats = |bits: f32| bits * LN_2;

    let mut m_prev = vec![LOG_FLOOR; lt + 1];
    let mut qi_prev = vec![LOG_FLOOR; lt + 1];
    let mut ti_prev = vec![LOG_FLOOR; lt + 1];
    let mut m_cur = vec![LOG_FLOOR; lt + 1];
    let mut qi_cur = vec![LOG_FLOOR; lt + 1];
    let mut ti_cur = vec![LOG_FLOOR; lt + 1];
    let mut total = LOG_FLOOR;

    if global {
        m_prev[0] = 0.0;
        for j in 1..=lt {
            ti_prev[j] = log_sum_exp_scalar(
                m_prev[j - 1] + nats(gap_open_after(ctx, query, 0)),
                ti_prev[j - 1] + nats(gap_extend_after(ctx, query, 0)),
            );
        }
    }

    for i in 1..=lq {
        let q = &query.columns()[i - 1].freqs;
        m_cur[0] = LOG_FLOOR;
        ti_cur[0] = LOG_FLOOR;
        qi_cur[0] = if global {
            log_sum_exp_scalar(
                m_prev[0] + nats(gap_open_after(ctx, subject, 0)),
                qi_prev[0] + nats(gap_extend_after(ctx, subject, 0)),
            )
        } else {
            LOG_FLOOR
        };
        for j in 1..=lt {
            let s = nats(ctx.score_from_dot(dot(q, &odds[j - 1])));
            let diag = m_prev[j - 1]
                + nats(match_to_match(query, i - 1) + match_to_match(subject, j - 1));
            let mut pred = log_sum_exp_scalar(diag, qi_prev[j - 1]);
            pred = log_sum_exp_scalar(pred, ti_prev[j - 1]);
            if !global {
                pred = log_sum_exp_scalar(pred, 0.0);
            }
            m_cur[j] = (s + pred).max(LOG_FLOOR);
            qi_cur[j] = log_sum_exp_scalar(
                m_prev[j] + nats(gap_open_after(ctx, subject, j)),
                qi_prev[j] + nats(gap_extend_after(ctx, subject, j)),
            )
            .max(LOG_FLOOR);
            ti_cur[j] = log_sum_exp_scalar(
                m_cur[j - 1] + nats(gap_open_after(ctx, query, i)),
                ti_cur[j - 1] + nats(gap_extend_after(ctx, query, i)),
            )
            .max(LOG_FLOOR);
            if !global {
                total = log_sum_exp_scalar(total, m_cur[j]);
            }
        }
        std::mem::swap(&mut m_prev, &mut m_cur);
        std::mem::swap(&mut qi_prev, &mut qi_cur);
        std::mem::swap(&mut ti_prev, &mut ti_cur);
    }

    if global {
        let t = log_sum_exp_scalar(m_prev[lt], qi_prev[lt]);
        log_sum_exp_scalar(t, ti_prev[lt])
    } else {
        total
    }
}

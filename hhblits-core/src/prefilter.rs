//! Cheap shortlist of subjects worth a full alignment.

use crate::align::scoring::match_to_match;
use crate::align::ScoringContext;
use crate::db::{DatabaseProvider, EntryStream, HhEntry};
use crate::error::SearchResult;
use crate::hits::{ScoreStatistics, SignificanceCutoff};
use crate::profile::Profile;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub entry: HhEntry,
    /// Best ungapped local segment in bits; used for ordering.
    pub score: f32,
    /// Upper bound on any alignment score of the pair; used for discarding.
    pub bound: f32,
    /// `bound` reaches a score that could pass the significance cutoff.
    /// Such candidates are never removed by the candidate cap.
    pub reachable: bool,
}

/// Score a pair needs to pass the significance cutoff of a search.
#[derive(Clone)]
pub struct SignificanceFloor {
    pub statistics: Arc<dyn ScoreStatistics>,
    pub cutoff: SignificanceCutoff,
    /// Entries over all databases.
    pub db_size: usize,
}

impl SignificanceFloor {
    pub fn score(&self, query_len: usize, subject_len: usize) -> f32 {
        self.statistics
            .min_significant_score(&self.cutoff, query_len, subject_len, self.db_size)
    }
}

/// Screens the entries of one stream against the query.
///
/// Implementations must never drop a subject whose full alignment could reach
/// the configured minimum score, and must return a deterministic order.
pub trait Prefilter: Send + Sync {
    fn screen(
        &self,
        query: &Profile,
        db: &dyn DatabaseProvider,
        entries: &mut dyn EntryStream,
    ) -> SearchResult<Vec<Candidate>>;
}

/// Coarse score: the best ungapped diagonal segment, including match-to-match
/// transitions, so it is the score of a real local path and never exceeds the
/// Viterbi optimum.
///
/// Discarding uses a separate upper bound: every query column is matched at
/// most once and gaps and transitions never score above zero, so no alignment
/// can beat the sum of per-row (or per-column) best positive column scores.
/// A candidate is dropped only when that bound is below `min_score`, or below
/// the pair's significance floor when that is lower.
#[derive(Clone)]
pub struct UngappedPrefilter {
    ctx: Arc<ScoringContext>,
    min_score: f32,
    floor: Option<SignificanceFloor>,
}

impl UngappedPrefilter {
    pub fn new(ctx: Arc<ScoringContext>, min_score: f32) -> Self {
        Self {
            ctx,
            min_score,
            floor: None,
        }
    }

    pub fn with_significance(mut self, floor: SignificanceFloor) -> Self {
        self.floor = Some(floor);
        self
    }

    pub fn min_score(&self) -> f32 {
        self.min_score
    }

    /// Bound a pair must reach to be kept, and the significance floor if any.
    fn thresholds(&self, query_len: usize, subject_len: usize) -> (f32, Option<f32>) {
        match &self.floor {
            Some(f) => {
                let floor = f.score(query_len, subject_len);
                (self.min_score.min(floor), Some(floor))
            }
            None => (self.min_score, None),
        }
    }

    /// `(coarse score, upper bound)` for one pair.
    pub fn score_pair(&self, query: &Profile, subject: &Profile) -> (f32, f32) {
        let ctx = &*self.ctx;
        let lq = query.len();
        let lt = subject.len();
        let odds: Vec<_> = subject
            .columns()
            .iter()
            .map(|c| ctx.subject_odds(c))
            .collect();

        let mut row_best = vec![0.0f32; lq];
        let mut col_best = vec![0.0f32; lt];
        let mut prev = vec![0.0f32; lt + 1];
        let mut cur = vec![0.0f32; lt + 1];
        let mut best = f32::NEG_INFINITY;

        for i in 1..=lq {
            let q = &query.columns()[i - 1].freqs;
            let q_mm = match_to_match(query, i - 1);
            for j in 1..=lt {
                let dot: f32 = q.iter().zip(odds[j - 1].iter()).map(|(a, b)| a * b).sum();
                let s = ctx.score_from_dot(dot);
                let extend = prev[j - 1] + q_mm + match_to_match(subject, j - 1);
                let h = s + extend.max(0.0);
                cur[j] = h;
                best = best.max(h);
                row_best[i - 1] = row_best[i - 1].max(s);
                col_best[j - 1] = col_best[j - 1].max(s);
            }
            std::mem::swap(&mut prev, &mut cur);
        }

        let by_rows: f32 = row_best.iter().sum();
        let by_cols: f32 = col_best.iter().sum();
        (best, by_rows.min(by_cols))
    }
}

impl Prefilter for UngappedPrefilter {
    fn screen(
        &self,
        query: &Profile,
        db: &dyn DatabaseProvider,
        entries: &mut dyn EntryStream,
    ) -> SearchResult<Vec<Candidate>> {
        let mut handles = Vec::new();
        while let Some(entry) = entries.next_entry() {
            handles.push(entry);
        }

        let score_one = |entry: &HhEntry| -> SearchResult<Option<Candidate>> {
            let subject = db.resolve(entry)?;
            if subject.validate().is_err() {
                // kept so the alignment stage reports it as a failed hit
                return Ok(Some(Candidate {
                    entry: entry.clone(),
                    score: f32::NEG_INFINITY,
                    bound: f32::INFINITY,
                    reachable: false,
                }));
            }
            if self.ctx.too_short(&subject) {
                return Ok(None);
            }
            let (score, bound) = self.score_pair(query, &subject);
            let (keep, floor) = self.thresholds(query.len(), subject.len());
            Ok((bound >= keep).then(|| Candidate {
                entry: entry.clone(),
                score,
                bound,
                reachable: floor.is_some_and(|f| bound >= f),
            }))
        };
        let scored: Vec<SearchResult<Option<Candidate>>> = par_map!(handles, score_one);

        let mut kept = Vec::with_capacity(scored.len());
        for c in scored {
            if let Some(c) = c? {
                kept.push(c);
            }
        }
        debug!(
            db = db.name(),
            screened = handles.len(),
            kept = kept.len(),
            "prefilter"
        );
        Ok(kept)
    }
}

/// Coarse score descending, then `(database, entry index)` ascending.
pub fn candidate_order(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| (a.entry.db, a.entry.index).cmp(&(b.entry.db, b.entry.index)))
}

/// Screen every database and return one ordered list. Past the first
/// `max_candidates` entries only reachable candidates are kept.
pub fn shortlist(
    prefilter: &dyn Prefilter,
    query: &Profile,
    databases: &[Arc<dyn DatabaseProvider>],
    max_candidates: usize,
) -> SearchResult<Vec<Candidate>> {
    let mut all = Vec::new();
    for (index, db) in databases.iter().enumerate() {
        let mut stream = db.open(index)?;
        all.extend(prefilter.screen(query, db.as_ref(), &mut *stream)?);
    }
    all.sort_by(candidate_order);
    let mut rank = 0;
    all.retain(|c| {
        rank += 1;
        rank <= max_candidates || c.reachable
    });
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::scalar_ref::viterbi_scalar;
    use crate::align::{AlignmentMode, PairOutcome};
    use crate::alphabet::AMINO_ACIDS;
    use crate::db::InMemoryDatabase;
    use crate::hits::KarlinAltschul;
    use proptest::prelude::*;

    fn ctx() -> Arc<ScoringContext> {
        Arc::new(ScoringContext::new(AlignmentMode::Local, -3.0, -1.0, -0.03))
    }

    fn seq(name: &str, s: &[u8]) -> Profile {
        Profile::from_sequence(name, s).unwrap()
    }

    fn db() -> Arc<dyn DatabaseProvider> {
        Arc::new(InMemoryDatabase::new(
            "mem",
            vec![
                seq("unrelated", b"GGGGGGGGGG"),
                seq("half", b"MKTAYIAKQRGGGGGGGG"),
                seq("full", b"MKTAYIAKQRQISFVKSHFSRQ"),
            ],
        ))
    }

    #[test]
    fn related_subjects_survive_in_score_order() {
        let query = seq("q", b"MKTAYIAKQRQISFVKSHFSRQ");
        let filter = UngappedPrefilter::new(ctx(), 20.0);
        let out = shortlist(&filter, &query, &[db()], 100).unwrap();
        let names: Vec<&str> = out.iter().map(|c| c.entry.name.as_str()).collect();
        assert_eq!(names, vec!["full", "half"]);
        assert!(out[0].score > out[1].score);
    }

    #[test]
    fn cap_and_ties_follow_database_order() {
        let query = seq("q", b"ACDEFGHIKL");
        let twin: Arc<dyn DatabaseProvider> =
            Arc::new(InMemoryDatabase::new("twin", vec![seq("a", b"ACDEFGHIKL")]));
        let filter = UngappedPrefilter::new(ctx(), 0.0);
        let out = shortlist(&filter, &query, &[twin.clone(), twin], 1).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].entry.db, 0);
    }

    #[test]
    fn malformed_subjects_are_passed_on() {
        let bad = Profile::from_parts("bad", 4, vec![], None, vec![]);
        let db: Arc<dyn DatabaseProvider> = Arc::new(InMemoryDatabase::new("m", vec![bad]));
        let query = seq("q", b"ACDE");
        let out = shortlist(&UngappedPrefilter::new(ctx(), 1e6), &query, &[db], 10).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].score, f32::NEG_INFINITY);
    }

    fn significance_floor() -> SignificanceFloor {
        SignificanceFloor {
            statistics: Arc::new(KarlinAltschul::default()),
            cutoff: SignificanceCutoff::EValue(1e-3),
            db_size: 3,
        }
    }

    #[test]
    fn significance_floor_overrides_a_high_min_score() {
        let query = seq("q", b"MKTAYIAKQRQISFVKSHFSRQ");
        let filter = UngappedPrefilter::new(ctx(), 1e6).with_significance(significance_floor());
        let out = shortlist(&filter, &query, &[db()], 100).unwrap();
        let names: Vec<&str> = out.iter().map(|c| c.entry.name.as_str()).collect();
        assert_eq!(names, vec!["full", "half"]);
        assert!(out.iter().all(|c| c.reachable));
    }

    #[test]
    fn cap_never_drops_reachable_candidates() {
        let query = seq("q", b"MKTAYIAKQRQISFVKSHFSRQ");
        let plain = UngappedPrefilter::new(ctx(), 20.0);
        assert_eq!(shortlist(&plain, &query, &[db()], 1).unwrap().len(), 1);

        let guarded = plain.with_significance(significance_floor());
        let out = shortlist(&guarded, &query, &[db()], 1).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].entry.name, "full");
    }

    fn residues() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(0usize..20, 3..30)
            .prop_map(|v| v.into_iter().map(|a| AMINO_ACIDS[a]).collect())
    }

    proptest! {
        #[test]
        fn coarse_score_and_bound_bracket_viterbi(q in residues(), t in residues()) {
            let ctx = ctx();
            let query = seq("q", &q);
            let subject = seq("t", &t);
            let (score, bound) = UngappedPrefilter::new(ctx.clone(), 0.0).score_pair(&query, &subject);
            if let PairOutcome::Aligned(v) = viterbi_scalar(&ctx, &query, &subject).unwrap() {
                prop_assert!(score <= v.score + 1e-2);
                prop_assert!(bound + 1e-2 >= v.score);
            }
        }
    }
}

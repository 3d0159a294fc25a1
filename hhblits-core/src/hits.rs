//! Hits, their significance, and the deduplicated hit list.
//!
//! The list keeps one hit per subject identity. A new hit for a known subject
//! replaces the stored one only if it is strictly better under the list's
//! [`HitOrder`], so re-inserting the same or a worse hit is a no-op. Hits from
//! a later iteration go through [`HitList::replace_rescored`] instead and
//! always take over.

use crate::align::{AlignmentPath, PosteriorResult, ViterbiResult};
use crate::config::StatisticsConfig;
use crate::db::{HhEntry, SubjectId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

/// Score of a hit whose alignment failed.
pub const INVALID_SCORE: f32 = f32::MIN;

#[derive(Clone, Debug, PartialEq)]
pub enum HitStatus {
    Ok,
    /// Alignment exists but its decoding was numerically unreliable.
    LowConfidence(String),
    Failed(String),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PosteriorSummary {
    pub sum_probability: f32,
    pub mean_probability: f32,
    pub log_z: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Hit {
    /// Database handle used to re-read the subject.
    pub entry: HhEntry,
    pub subject: SubjectId,
    /// Viterbi score in bits.
    pub score: f32,
    pub pvalue: f64,
    /// Expected number of chance hits at this score.
    pub evalue: f64,
    /// Percent.
    pub probability: f64,
    /// Aligned query columns, 0-based half-open.
    pub query_range: Range<usize>,
    /// Aligned subject columns, 0-based half-open.
    pub subject_range: Range<usize>,
    /// Viterbi path, replaced by the MAC path once decoded.
    pub path: AlignmentPath,
    /// Set by the posterior stage.
    pub posterior: Option<PosteriorSummary>,
    pub status: HitStatus,
    /// Iteration (1-based) that produced this hit.
    pub iteration: usize,
}

impl Hit {
    pub fn from_viterbi(
        entry: HhEntry,
        result: ViterbiResult,
        significance: Significance,
        iteration: usize,
    ) -> Self {
        Self {
            subject: entry.id(),
            entry,
            score: result.score,
            pvalue: significance.pvalue,
            evalue: significance.evalue,
            probability: significance.probability,
            query_range: result.query_range,
            subject_range: result.subject_range,
            path: result.path,
            posterior: None,
            status: HitStatus::Ok,
            iteration,
        }
    }

    pub fn failed(entry: HhEntry, reason: impl Into<String>, iteration: usize) -> Self {
        Self {
            subject: entry.id(),
            entry,
            score: INVALID_SCORE,
            pvalue: 1.0,
            evalue: f64::INFINITY,
            probability: 0.0,
            query_range: 0..0,
            subject_range: 0..0,
            path: AlignmentPath::default(),
            posterior: None,
            status: HitStatus::Failed(reason.into()),
            iteration,
        }
    }

    /// Replace boundaries and path with a posterior decoding; score and
    /// significance stay untouched.
    pub fn apply_posterior(&mut self, post: PosteriorResult) {
        self.query_range = post.query_range;
        self.subject_range = post.subject_range;
        self.path = post.path;
        self.posterior = Some(PosteriorSummary {
            sum_probability: post.sum_probability,
            mean_probability: post.mean_probability,
            log_z: post.log_z,
        });
    }

    pub fn mark_low_confidence(&mut self, reason: impl Into<String>) {
        if self.status == HitStatus::Ok {
            self.status = HitStatus::LowConfidence(reason.into());
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == HitStatus::Ok
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, HitStatus::Failed(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Significance {
    pub pvalue: f64,
    pub evalue: f64,
    pub probability: f64,
}

/// Converts a raw score into P-value, E-value and probability.
pub trait ScoreStatistics: Send + Sync {
    /// Expected number of chance alignments of this pair scoring at least `score`.
    fn pair_evalue(&self, score: f32, query_len: usize, subject_len: usize) -> f64;

    fn significance(
        &self,
        score: f32,
        query_len: usize,
        subject_len: usize,
        db_size: usize,
    ) -> Significance {
        let pair = self.pair_evalue(score, query_len, subject_len);
        // 1 - exp(-pair) without cancellation for small values
        let pvalue = (-(-pair).exp_m1()).clamp(0.0, 1.0);
        Significance {
            pvalue,
            evalue: pvalue * db_size.max(1) as f64,
            probability: 100.0 * (1.0 - pvalue),
        }
    }

    /// Lowest score (bits) at which a pair of these lengths passes `cutoff`.
    /// `-inf` if every score passes, `+inf` if none does. Found by bisection,
    /// so significance must not get worse as the score grows.
    fn min_significant_score(
        &self,
        cutoff: &SignificanceCutoff,
        query_len: usize,
        subject_len: usize,
        db_size: usize,
    ) -> f32 {
        let passes =
            |s: f32| cutoff.admits(&self.significance(s, query_len, subject_len, db_size));
        let (mut lo, mut hi) = (-SCORE_SEARCH_RANGE, SCORE_SEARCH_RANGE);
        if !passes(hi) {
            return f32::INFINITY;
        }
        if passes(lo) {
            return f32::NEG_INFINITY;
        }
        for _ in 0..64 {
            let mid = 0.5 * (lo + hi);
            if passes(mid) {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        // last failing score, never above the true threshold
        lo
    }
}

const SCORE_SEARCH_RANGE: f32 = 1.0e5;

/// `E = K * m * n * 2^(-lambda * S)` with `S` in bits.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KarlinAltschul {
    pub k: f64,
    pub lambda: f64,
}

impl KarlinAltschul {
    pub fn from_config(config: &StatisticsConfig) -> Self {
        Self {
            k: config.k,
            lambda: config.lambda,
        }
    }
}

impl Default for KarlinAltschul {
    fn default() -> Self {
        Self::from_config(&StatisticsConfig::default())
    }
}

impl ScoreStatistics for KarlinAltschul {
    fn pair_evalue(&self, score: f32, query_len: usize, subject_len: usize) -> f64 {
        let space = (query_len.max(1) * subject_len.max(1)) as f64;
        self.k * space * (-self.lambda * score as f64).exp2()
    }
}

/// Ranking used for reporting and for improvement-only replacement.
///
/// Every order breaks ties by score (descending), then by subject identity
/// (ascending), so it is total and independent of insertion order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitOrder {
    /// Score, descending.
    #[default]
    Score,
    /// E-value, ascending.
    EValue,
    /// Probability, descending.
    Probability,
}

impl HitOrder {
    /// `Less` means `a` ranks before `b`.
    pub fn compare(&self, a: &Hit, b: &Hit) -> Ordering {
        let primary = match self {
            HitOrder::Score => Ordering::Equal,
            HitOrder::EValue => a.evalue.total_cmp(&b.evalue),
            HitOrder::Probability => b.probability.total_cmp(&a.probability),
        };
        primary
            .then_with(|| b.score.total_cmp(&a.score))
            .then_with(|| a.subject.cmp(&b.subject))
    }
}

/// Threshold a hit must meet to be merged into the query alignment.
/// Both comparisons are inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum SignificanceCutoff {
    /// `evalue <= x`
    #[serde(rename = "evalue")]
    EValue(f64),
    /// `probability >= p` (percent)
    #[serde(rename = "probability")]
    Probability(f64),
}

impl SignificanceCutoff {
    /// Low-confidence and failed hits are never significant.
    pub fn passes(&self, hit: &Hit) -> bool {
        hit.is_ok()
            && self.admits(&Significance {
                pvalue: hit.pvalue,
                evalue: hit.evalue,
                probability: hit.probability,
            })
    }

    pub fn admits(&self, significance: &Significance) -> bool {
        match *self {
            SignificanceCutoff::EValue(x) => significance.evalue <= x,
            SignificanceCutoff::Probability(p) => significance.probability >= p,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AddSummary {
    pub inserted: usize,
    pub replaced: usize,
    /// Worse duplicates, failed hits, and hits above the report cutoff.
    pub rejected: usize,
}

#[derive(Clone, Debug)]
pub struct HitList {
    hits: BTreeMap<SubjectId, Hit>,
    order: HitOrder,
    report_evalue: f64,
}

impl HitList {
    pub fn new(order: HitOrder, report_evalue: f64) -> Self {
        Self {
            hits: BTreeMap::new(),
            order,
            report_evalue,
        }
    }

    pub fn order(&self) -> HitOrder {
        self.order
    }

    /// Largest E-value a finished hit may carry to be admitted.
    pub fn report_cutoff(&self) -> f64 {
        self.report_evalue
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn contains(&self, id: &SubjectId) -> bool {
        self.hits.contains_key(id)
    }

    pub fn get(&self, id: &SubjectId) -> Option<&Hit> {
        self.hits.get(id)
    }

    /// Whether `new` should replace `old` for the same subject. Usable hits
    /// always beat low-confidence ones; otherwise the list order decides.
    fn improves(&self, new: &Hit, old: &Hit) -> bool {
        match (new.is_ok(), old.is_ok()) {
            (true, false) => true,
            (false, true) => false,
            _ => self.order.compare(new, old) == Ordering::Less,
        }
    }

    pub fn add_hits_to_hitlist(&mut self, hits: impl IntoIterator<Item = Hit>) -> AddSummary {
        let mut summary = AddSummary::default();
        for hit in hits {
            if hit.is_failed() || !(hit.evalue <= self.report_evalue) {
                summary.rejected += 1;
                continue;
            }
            match self.hits.get(&hit.subject) {
                Some(old) if !self.improves(&hit, old) => summary.rejected += 1,
                Some(_) => {
                    summary.replaced += 1;
                    self.hits.insert(hit.subject.clone(), hit);
                }
                None => {
                    summary.inserted += 1;
                    self.hits.insert(hit.subject.clone(), hit);
                }
            }
        }
        summary
    }

    /// Store hits realigned against a newer query profile. Each one replaces
    /// the stored hit of its subject whether or not it ranks better; one above
    /// the report cutoff removes the subject. Failed hits are skipped.
    pub fn replace_rescored(&mut self, hits: impl IntoIterator<Item = Hit>) -> AddSummary {
        let mut summary = AddSummary::default();
        for hit in hits {
            if hit.is_failed() {
                summary.rejected += 1;
                continue;
            }
            if !(hit.evalue <= self.report_evalue) {
                self.hits.remove(&hit.subject);
                summary.rejected += 1;
                continue;
            }
            match self.hits.insert(hit.subject.clone(), hit) {
                Some(_) => summary.replaced += 1,
                None => summary.inserted += 1,
            }
        }
        summary
    }

    /// Hits in rank order; low-confidence hits follow all usable ones.
    pub fn ranked(&self) -> Vec<&Hit> {
        let mut out: Vec<&Hit> = self.hits.values().collect();
        out.sort_by(|a, b| {
            b.is_ok()
                .cmp(&a.is_ok())
                .then_with(|| self.order.compare(a, b))
        });
        out
    }

    pub fn significant(&self, cutoff: &SignificanceCutoff) -> Vec<&Hit> {
        self.ranked()
            .into_iter()
            .filter(|h| cutoff.passes(h))
            .collect()
    }

    pub fn get_entries_of_selected_hits(&self, cutoff: &SignificanceCutoff) -> Vec<HhEntry> {
        self.significant(cutoff)
            .into_iter()
            .map(|h| h.entry.clone())
            .collect()
    }

    pub fn get_entries_of_all_hits(&self) -> Vec<HhEntry> {
        self.ranked().into_iter().map(|h| h.entry.clone()).collect()
    }

    /// Swap in a posterior decoding for one hit without touching its rank.
    pub fn update_alignment(&mut self, id: &SubjectId, post: PosteriorResult) -> bool {
        match self.hits.get_mut(id) {
            Some(hit) => {
                hit.apply_posterior(post);
                true
            }
            None => false,
        }
    }

    pub fn mark_low_confidence(&mut self, id: &SubjectId, reason: impl Into<String>) -> bool {
        match self.hits.get_mut(id) {
            Some(hit) => {
                hit.mark_low_confidence(reason);
                true
            }
            None => false,
        }
    }

    pub fn into_ranked(self) -> Vec<Hit> {
        let order = self.order;
        let mut out: Vec<Hit> = self.hits.into_values().collect();
        out.sort_by(|a, b| b.is_ok().cmp(&a.is_ok()).then_with(|| order.compare(a, b)));
        out
    }
}

/// Subjects already folded into the query alignment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PreviousHits {
    ids: BTreeSet<SubjectId>,
}

impl PreviousHits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the subject was already present.
    pub fn insert(&mut self, id: SubjectId) -> bool {
        self.ids.insert(id)
    }

    pub fn contains(&self, id: &SubjectId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubjectId> {
        self.ids.iter()
    }
}

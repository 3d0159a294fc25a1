//! Search configuration.
//!
//! Every option the search core recognizes lives here. Sections deserialize
//! from TOML with per-field defaults, so a config file only needs to name the
//! values it changes:
//!
//! ```toml
//! iterations = 3
//! mode = "global"
//! significance = { evalue = 1e-4 }
//!
//! [prefilter]
//! min_score = 8.0
//! ```

use crate::align::AlignmentMode;
use crate::error::{SearchError, SearchResult};
use crate::hits::{HitOrder, SignificanceCutoff};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Maximum number of search/refine iterations.
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// Threshold a hit must pass to be merged into the query alignment.
    #[serde(default = "default_significance")]
    pub significance: SignificanceCutoff,
    /// Hits with a larger E-value are not admitted to the hit list at all.
    #[serde(default = "default_report_evalue")]
    pub report_evalue: f64,
    #[serde(default)]
    pub hit_order: HitOrder,
    #[serde(default)]
    pub mode: AlignmentMode,
    /// Gap open penalty in bits (<= 0), added on top of profile transitions.
    #[serde(default = "default_gap_open")]
    pub gap_open: f32,
    /// Gap extension penalty in bits (<= 0).
    #[serde(default = "default_gap_extend")]
    pub gap_extend: f32,
    /// Per-column score offset in bits.
    #[serde(default = "default_score_shift")]
    pub score_shift: f32,
    /// Recompute alignment boundaries of significant hits with MAC decoding.
    #[serde(default = "default_realign")]
    pub realign: bool,
    /// MAC threshold: posterior probability a column must exceed to be aligned.
    #[serde(default = "default_mact")]
    pub mact: f32,
    /// Half-width of the envelope kept around a previous path when realigning.
    #[serde(default = "default_realign_margin")]
    pub realign_margin: usize,
    /// Upper bound on hits realigned at the end of a search.
    #[serde(default = "default_realign_max")]
    pub realign_max: usize,
    /// Retain every merged sequence in the "all" view, not only filtered ones.
    #[serde(default)]
    pub keep_all_sequences: bool,
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Number of bins (pairwise alignments in flight) per batch.
    #[serde(default = "default_max_bins")]
    pub max_bins: usize,
    /// Profiles shorter than this never enter the DP matrices.
    #[serde(default = "default_min_profile_len")]
    pub min_profile_len: usize,
    /// Stop iterating once the query profile reaches this diversity.
    #[serde(default = "default_max_neff")]
    pub max_neff: f32,
    /// Fold significant hits of the final iteration into the alignment for output.
    #[serde(default)]
    pub merge_last_iteration: bool,
    #[serde(default)]
    pub prefilter: PrefilterConfig,
    #[serde(default)]
    pub early_stopping: EarlyStoppingConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub statistics: StatisticsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefilterConfig {
    /// Score bound (bits) a candidate needs to be aligned. Lowered per pair to
    /// the lowest score that could still pass `significance`.
    #[serde(default = "default_prefilter_min_score")]
    pub min_score: f32,
    /// Candidates kept per iteration, not counting those that could still
    /// pass `significance`.
    #[serde(default = "default_prefilter_max_candidates")]
    pub max_candidates: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStoppingConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Number of most recent hits the running sum looks at.
    #[serde(default = "default_early_window")]
    pub window: usize,
    /// Stop once the sum of `1 / (1 + E)` over the window falls below this.
    #[serde(default = "default_early_threshold")]
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Maximum pairwise identity between sequences of the filtered view.
    #[serde(default = "default_max_seqid")]
    pub max_seqid: f32,
    /// Minimum fraction of query match columns a sequence must cover.
    #[serde(default)]
    pub min_coverage: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsConfig {
    #[serde(default = "default_stat_k")]
    pub k: f64,
    /// Scale of the score in bits.
    #[serde(default = "default_stat_lambda")]
    pub lambda: f64,
}

fn default_iterations() -> usize { 2 }
fn default_significance() -> SignificanceCutoff { SignificanceCutoff::EValue(1e-3) }
fn default_report_evalue() -> f64 { 1000.0 }
fn default_gap_open() -> f32 { -3.0 }
fn default_gap_extend() -> f32 { -1.0 }
fn default_score_shift() -> f32 { -0.03 }
fn default_realign() -> bool { true }
fn default_mact() -> f32 { 0.35 }
fn default_realign_margin() -> usize { 8 }
fn default_realign_max() -> usize { 500 }
fn default_threads() -> usize { num_cpus::get() }
fn default_max_bins() -> usize { 64 }
fn default_min_profile_len() -> usize { 1 }
fn default_max_neff() -> f32 { 10.0 }
fn default_prefilter_min_score() -> f32 { 5.0 }
fn default_prefilter_max_candidates() -> usize { 20000 }
fn default_early_window() -> usize { 10 }
fn default_early_threshold() -> f64 { 0.01 }
fn default_max_seqid() -> f32 { 0.9 }
fn default_stat_k() -> f64 { 0.1 }
fn default_stat_lambda() -> f64 { 1.0 }

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            significance: default_significance(),
            report_evalue: default_report_evalue(),
            hit_order: HitOrder::default(),
            mode: AlignmentMode::default(),
            gap_open: default_gap_open(),
            gap_extend: default_gap_extend(),
            score_shift: default_score_shift(),
            realign: default_realign(),
            mact: default_mact(),
            realign_margin: default_realign_margin(),
            realign_max: default_realign_max(),
            keep_all_sequences: false,
            threads: default_threads(),
            max_bins: default_max_bins(),
            min_profile_len: default_min_profile_len(),
            max_neff: default_max_neff(),
            merge_last_iteration: false,
            prefilter: PrefilterConfig::default(),
            early_stopping: EarlyStoppingConfig::default(),
            filter: FilterConfig::default(),
            statistics: StatisticsConfig::default(),
        }
    }
}

impl Default for PrefilterConfig {
    fn default() -> Self {
        Self {
            min_score: default_prefilter_min_score(),
            max_candidates: default_prefilter_max_candidates(),
        }
    }
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window: default_early_window(),
            threshold: default_early_threshold(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_seqid: default_max_seqid(),
            min_coverage: 0.0,
        }
    }
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            k: default_stat_k(),
            lambda: default_stat_lambda(),
        }
    }
}

impl SearchConfig {
    pub fn from_toml_str(text: &str) -> SearchResult<Self> {
        let config: SearchConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> SearchResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> SearchResult<String> {
        toml::to_string(self).map_err(|e| SearchError::Config { msg: e.to_string() })
    }

    pub fn validate(&self) -> SearchResult<()> {
        fn bad(msg: impl Into<String>) -> SearchResult<()> {
            Err(SearchError::Config { msg: msg.into() })
        }
        if self.iterations == 0 {
            return bad("iterations must be at least 1");
        }
        if self.max_bins == 0 {
            return bad("max_bins must be at least 1");
        }
        if self.threads == 0 {
            return bad("threads must be at least 1");
        }
        if !self.gap_open.is_finite() || self.gap_open > 0.0 {
            return bad("gap_open must be finite and <= 0");
        }
        if !self.gap_extend.is_finite() || self.gap_extend > 0.0 {
            return bad("gap_extend must be finite and <= 0");
        }
        if !self.score_shift.is_finite() {
            return bad("score_shift must be finite");
        }
        if !(0.0..1.0).contains(&self.mact) {
            return bad("mact must lie in [0, 1)");
        }
        if !(self.filter.max_seqid > 0.0 && self.filter.max_seqid <= 1.0) {
            return bad("filter.max_seqid must lie in (0, 1]");
        }
        if !(0.0..=1.0).contains(&self.filter.min_coverage) {
            return bad("filter.min_coverage must lie in [0, 1]");
        }
        if self.prefilter.min_score.is_nan() {
            return bad("prefilter.min_score must be a number");
        }
        if self.prefilter.max_candidates == 0 {
            return bad("prefilter.max_candidates must be at least 1");
        }
        if self.early_stopping.window == 0 {
            return bad("early_stopping.window must be at least 1");
        }
        if self.statistics.k <= 0.0 || self.statistics.lambda <= 0.0 {
            return bad("statistics.k and statistics.lambda must be positive");
        }
        match self.significance {
            SignificanceCutoff::EValue(e) if !(e >= 0.0) => bad("evalue cutoff must be >= 0"),
            SignificanceCutoff::Probability(p) if !(0.0..=100.0).contains(&p) => {
                bad("probability cutoff must lie in [0, 100]")
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config = SearchConfig::from_toml_str("").unwrap();
        assert_eq!(config.iterations, 2);
        assert_eq!(config.max_bins, 64);
        assert_eq!(config.mode, AlignmentMode::Local);
        assert_eq!(config.significance, SignificanceCutoff::EValue(1e-3));
        assert_eq!(config.prefilter.max_candidates, 20000);
        assert!(!config.early_stopping.enabled);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let text = r#"
            iterations = 4
            mode = "global"
            hit_order = "evalue"
            significance = { probability = 95.0 }

            [prefilter]
            min_score = 12.5

            [filter]
            min_coverage = 0.5
        "#;
        let config = SearchConfig::from_toml_str(text).unwrap();
        assert_eq!(config.iterations, 4);
        assert_eq!(config.mode, AlignmentMode::Global);
        assert_eq!(config.hit_order, HitOrder::EValue);
        assert_eq!(config.significance, SignificanceCutoff::Probability(95.0));
        assert_eq!(config.prefilter.min_score, 12.5);
        assert_eq!(config.prefilter.max_candidates, 20000);
        assert_eq!(config.filter.min_coverage, 0.5);
        assert_eq!(config.filter.max_seqid, 0.9);
    }

    #[test]
    fn toml_round_trip() {
        let mut config = SearchConfig::default();
        config.threads = 3;
        config.keep_all_sequences = true;
        let text = config.to_toml_string().unwrap();
        let back = SearchConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.threads, 3);
        assert!(back.keep_all_sequences);
        assert_eq!(back.gap_open, config.gap_open);
    }

    #[test]
    fn rejects_positive_gap_penalty() {
        let err = SearchConfig::from_toml_str("gap_open = 2.0").unwrap_err();
        assert!(matches!(err, SearchError::Config { .. }));
    }

    #[test]
    fn rejects_zero_bins() {
        let mut config = SearchConfig::default();
        config.max_bins = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_candidate_cap() {
        let mut config = SearchConfig::default();
        config.prefilter.max_candidates = 0;
        assert!(config.validate().is_err());
        config.prefilter.max_candidates = 1;
        config.prefilter.min_score = f32::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn reports_parse_errors() {
        let err = SearchConfig::from_toml_str("iterations = \"many\"").unwrap_err();
        assert!(matches!(err, SearchError::ConfigParse(_)));
    }
}

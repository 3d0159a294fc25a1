//! The iterative search-and-refine loop.
//!
//! A search starts from a query alignment, builds the query profile from it,
//! and then repeats prefilter, Viterbi alignment, posterior decoding of the
//! significant new hits, and hit collection. Significant hits not merged
//! before are folded into the query alignment and the profile is rebuilt for
//! the next iteration. All batches run on the controller's worker pool; the
//! hit list, the alignment and `PreviousHits` are only written from the
//! controlling thread between batches.

mod realign;
mod stage;

pub use realign::RealignReport;
pub use stage::{AbortSignal, IterationSummary, Stage, StopReason};

use crate::align::{PairOutcome, PosteriorEngine, ScoringContext, ViterbiEngine};
use crate::config::SearchConfig;
use crate::context::{ContextProvider, NoPseudocounts};
use crate::db::{DatabaseProvider, HhEntry, SubjectId};
use crate::error::{SearchError, SearchResult};
use crate::hits::{Hit, HitList, KarlinAltschul, PreviousHits, ScoreStatistics};
use crate::msa::QueryAlignment;
use crate::par::WorkerPool;
use crate::prefilter::{shortlist, Candidate, Prefilter, SignificanceFloor, UngappedPrefilter};
use crate::profile::Profile;
use crate::refine::{FoundCounters, MergeReport, ProfileRefiner};
use stage::{BatchRun, BatchStop, EarlyStop};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Everything a finished search hands to the output side.
#[derive(Debug)]
pub struct SearchOutcome {
    pub hit_list: HitList,
    /// Pairs that could not be aligned, in the order they were met.
    pub failed: Vec<Hit>,
    pub query_alignment: QueryAlignment,
    pub query_profile: Profile,
    pub previous_hits: PreviousHits,
    /// Significant subjects that could not be folded into the query alignment.
    pub unmerged: BTreeSet<SubjectId>,
    pub counters: FoundCounters,
    pub iterations: Vec<IterationSummary>,
    pub stop: StopReason,
}

pub struct SearchController {
    config: SearchConfig,
    databases: Vec<Arc<dyn DatabaseProvider>>,
    /// Total entries over all databases; the E-value search space.
    search_space: usize,
    scoring: Arc<ScoringContext>,
    prefilter: Arc<dyn Prefilter>,
    /// The prefilter is the built-in one and follows `statistics`.
    own_prefilter: bool,
    statistics: Arc<dyn ScoreStatistics>,
    refiner: ProfileRefiner,
    viterbi: ViterbiEngine,
    posterior: PosteriorEngine,
    workers: WorkerPool,
    abort: Option<AbortSignal>,
}

impl SearchController {
    pub fn new(
        config: SearchConfig,
        databases: Vec<Arc<dyn DatabaseProvider>>,
    ) -> SearchResult<Self> {
        config.validate()?;
        let scoring = Arc::new(ScoringContext::from_config(&config));
        let workers = WorkerPool::new(config.threads)?;
        let search_space = databases.iter().map(|db| db.size()).sum();
        let statistics: Arc<dyn ScoreStatistics> =
            Arc::new(KarlinAltschul::from_config(&config.statistics));
        Ok(Self {
            prefilter: default_prefilter(&config, &scoring, &statistics, search_space),
            own_prefilter: true,
            search_space,
            statistics,
            refiner: ProfileRefiner::new(Arc::new(NoPseudocounts)),
            viterbi: ViterbiEngine::new(scoring.clone(), config.max_bins),
            posterior: PosteriorEngine::new(scoring.clone(), config.max_bins, config.mact),
            scoring,
            workers,
            databases,
            config,
            abort: None,
        })
    }

    /// Pseudocount strategy applied whenever the query profile is rebuilt.
    pub fn with_context(mut self, context: Arc<dyn ContextProvider>) -> Self {
        self.refiner = ProfileRefiner::new(context);
        self
    }

    pub fn with_prefilter(mut self, prefilter: Arc<dyn Prefilter>) -> Self {
        self.prefilter = prefilter;
        self.own_prefilter = false;
        self
    }

    pub fn with_statistics(mut self, statistics: Arc<dyn ScoreStatistics>) -> Self {
        if self.own_prefilter {
            self.prefilter =
                default_prefilter(&self.config, &self.scoring, &statistics, self.search_space);
        }
        self.statistics = statistics;
        self
    }

    /// Limit both engines to `slots` matrices. Batches of `max_bins` that do
    /// not fit are split until they do.
    pub fn with_matrix_slots(mut self, slots: usize) -> Self {
        let slots = slots.max(1);
        self.viterbi = ViterbiEngine::new(self.scoring.clone(), slots);
        self.posterior = PosteriorEngine::new(self.scoring.clone(), slots, self.config.mact);
        self
    }

    pub fn with_abort(mut self, signal: AbortSignal) -> Self {
        self.abort = Some(signal);
        self
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn scoring(&self) -> &ScoringContext {
        &self.scoring
    }

    pub fn threads(&self) -> usize {
        self.workers.threads()
    }

    #[instrument(skip_all, fields(query = %qali.name(), databases = self.databases.len()))]
    pub fn run(&self, qali: QueryAlignment) -> SearchResult<SearchOutcome> {
        let span = tracing::Span::current();
        self.workers.install(move || span.in_scope(|| self.search(qali)))
    }

    fn search(&self, mut qali: QueryAlignment) -> SearchResult<SearchOutcome> {
        let cutoff = self.config.significance;
        let mut profile = self.refiner.rebuild_profile(&qali)?;
        let mut hit_list = HitList::new(self.config.hit_order, self.config.report_evalue);
        let mut previous = PreviousHits::new();
        let mut unmerged = BTreeSet::new();
        let mut counters = FoundCounters::default();
        let mut failed = Vec::new();
        let mut summaries = Vec::new();

        let mut iteration = 1;
        let mut summary = IterationSummary::default();
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut found: Vec<Hit> = Vec::new();
        let mut aborted = false;
        let mut stage = Stage::Prefilter;

        let stop = loop {
            debug!(?stage, iteration, "stage");
            stage = match stage {
                Stage::Prefilter => {
                    summary = IterationSummary {
                        iteration,
                        neff: profile.neff(),
                        ..IterationSummary::default()
                    };
                    if self.aborted() {
                        Stage::Converged(StopReason::Aborted)
                    } else {
                        candidates = shortlist(
                            self.prefilter.as_ref(),
                            &profile,
                            &self.databases,
                            self.config.prefilter.max_candidates,
                        )?;
                        summary.candidates = candidates.len();
                        Stage::Align
                    }
                }
                Stage::Align => {
                    let (hits, stopped) = self.align_stage(
                        &profile,
                        &candidates,
                        &hit_list,
                        &previous,
                        iteration,
                        &mut summary,
                    )?;
                    found = hits;
                    aborted = stopped;
                    Stage::Decode
                }
                Stage::Decode => {
                    if self.config.realign && !aborted {
                        aborted = self.decode_stage(&profile, &mut found, &previous, &mut summary)?;
                    }
                    Stage::Collect
                }
                Stage::Collect => {
                    let (bad, good): (Vec<Hit>, Vec<Hit>) =
                        std::mem::take(&mut found).into_iter().partition(Hit::is_failed);
                    summary.failed = bad.len();
                    failed.extend(bad);
                    // hits of subjects listed in earlier iterations follow the current profile
                    let (rescored, fresh): (Vec<Hit>, Vec<Hit>) =
                        good.into_iter().partition(|h| hit_list.contains(&h.subject));
                    hit_list.replace_rescored(rescored);
                    hit_list.add_hits_to_hitlist(fresh);

                    let significant = hit_list.significant(&cutoff);
                    summary.significant = significant.len();
                    summary.new_hits = significant
                        .iter()
                        .filter(|h| {
                            !previous.contains(&h.subject) && !unmerged.contains(&h.subject)
                        })
                        .count();
                    info!(
                        iteration,
                        candidates = summary.candidates,
                        aligned = summary.aligned,
                        significant = summary.significant,
                        new_hits = summary.new_hits,
                        neff = summary.neff,
                        "iteration finished"
                    );
                    summaries.push(summary.clone());

                    if aborted {
                        Stage::Converged(StopReason::Aborted)
                    } else if summary.new_hits == 0 {
                        Stage::Converged(StopReason::NoNewHits)
                    } else if iteration >= self.config.iterations {
                        if self.config.merge_last_iteration {
                            let report = self.merge_new(
                                &mut qali,
                                &hit_list,
                                &unmerged,
                                &mut previous,
                                &mut counters,
                            )?;
                            unmerged.extend(report.failed);
                        }
                        Stage::Converged(StopReason::IterationLimit)
                    } else {
                        Stage::Refine
                    }
                }
                Stage::Refine => {
                    let report = self.merge_new(
                        &mut qali,
                        &hit_list,
                        &unmerged,
                        &mut previous,
                        &mut counters,
                    )?;
                    unmerged.extend(report.failed);
                    profile = self.refiner.rebuild_profile(&qali)?;
                    if profile.neff() >= self.config.max_neff {
                        Stage::Converged(StopReason::NeffReached)
                    } else {
                        iteration += 1;
                        Stage::Prefilter
                    }
                }
                Stage::Converged(reason) => break reason,
            };
        };

        if self.config.realign && stop != StopReason::Aborted && !hit_list.is_empty() {
            self.perform_realign(&profile, &mut hit_list)?;
        }
        info!(
            ?stop,
            iterations = summaries.len(),
            hits = hit_list.len(),
            seqs_found = counters.seqs_found,
            "search finished"
        );
        Ok(SearchOutcome {
            hit_list,
            failed,
            query_alignment: qali,
            query_profile: profile,
            previous_hits: previous,
            unmerged,
            counters,
            iterations: summaries,
            stop,
        })
    }

    /// Merge significant hits that are neither merged nor known to fail.
    fn merge_new(
        &self,
        qali: &mut QueryAlignment,
        hit_list: &HitList,
        unmerged: &BTreeSet<SubjectId>,
        previous: &mut PreviousHits,
        counters: &mut FoundCounters,
    ) -> SearchResult<MergeReport> {
        let selected: Vec<&Hit> = hit_list
            .significant(&self.config.significance)
            .into_iter()
            .filter(|h| !previous.contains(&h.subject) && !unmerged.contains(&h.subject))
            .collect();
        self.refiner
            .merge_hits_to_query(qali, &selected, &self.databases, previous, counters)
    }

    /// Viterbi over the prefilter survivors, then over earlier merged subjects
    /// the prefilter did not return. The flag is set when the run was aborted.
    fn align_stage(
        &self,
        query: &Profile,
        candidates: &[Candidate],
        hit_list: &HitList,
        previous: &PreviousHits,
        iteration: usize,
        summary: &mut IterationSummary,
    ) -> SearchResult<(Vec<Hit>, bool)> {
        let mut hits = Vec::new();
        let early_stopping = self.config.early_stopping.enabled;
        let mut early = EarlyStop::new(
            self.config.early_stopping.window,
            self.config.early_stopping.threshold,
        );

        let entries: Vec<HhEntry> = candidates.iter().map(|c| c.entry.clone()).collect();
        let run = self.for_each_batch(&entries, |batch| {
            let aligned = self.align_entries(query, batch, iteration)?;
            for hit in &aligned {
                early.push(hit.as_ref().map_or(f64::INFINITY, |h| h.evalue));
            }
            hits.extend(aligned.into_iter().flatten());
            Ok(!(early_stopping && early.should_stop()))
        })?;
        summary.batches = run.batches;
        summary.stopped_early = run.stopped == Some(BatchStop::Early);
        if summary.stopped_early {
            debug!(iteration, "early stopping");
        }
        let mut stopped = run.stopped == Some(BatchStop::Aborted);

        if iteration > 1 && !stopped {
            let selected: BTreeSet<SubjectId> = candidates.iter().map(|c| c.entry.id()).collect();
            let rescore: Vec<HhEntry> = previous
                .iter()
                .filter(|id| !selected.contains(*id))
                .filter_map(|id| hit_list.get(id).map(|h| h.entry.clone()))
                .collect();
            summary.rescored = rescore.len();
            let run = self.for_each_batch(&rescore, |batch| {
                let aligned = self.align_entries(query, batch, iteration)?;
                hits.extend(aligned.into_iter().flatten());
                Ok(true)
            })?;
            summary.batches += run.batches;
            stopped = run.stopped == Some(BatchStop::Aborted);
        }

        summary.aligned = hits.iter().filter(|h| !h.is_failed()).count();
        Ok((hits, stopped))
    }

    /// One Viterbi batch. The result is parallel to `batch`; `None` means the
    /// pair produced no alignment.
    fn align_entries(
        &self,
        query: &Profile,
        batch: &[HhEntry],
        iteration: usize,
    ) -> SearchResult<Vec<Option<Hit>>> {
        let resolved: Vec<SearchResult<Profile>> =
            par_map!(batch, |entry: &HhEntry| self.resolve(entry));

        let mut out: Vec<Option<Hit>> = vec![None; batch.len()];
        let mut profiles = Vec::with_capacity(batch.len());
        let mut slots = Vec::with_capacity(batch.len());
        for (k, r) in resolved.into_iter().enumerate() {
            match r {
                Ok(p) => {
                    profiles.push(p);
                    slots.push(k);
                }
                Err(e) if e.is_per_pair() => {
                    out[k] = Some(Hit::failed(batch[k].clone(), e.to_string(), iteration));
                }
                Err(e) => return Err(e),
            }
        }

        let refs: Vec<&Profile> = profiles.iter().collect();
        let outcomes = self.viterbi.align_batch(query, &refs)?;
        for ((&k, outcome), subject) in slots.iter().zip(outcomes).zip(&profiles) {
            let entry = batch[k].clone();
            out[k] = match outcome {
                PairOutcome::Aligned(v) => {
                    let significance = self.statistics.significance(
                        v.score,
                        query.len(),
                        subject.len(),
                        self.search_space,
                    );
                    Some(Hit::from_viterbi(entry, v, significance, iteration))
                }
                PairOutcome::NoMatch => None,
                PairOutcome::Failed(e) => Some(Hit::failed(entry, e.to_string(), iteration)),
            };
        }
        Ok(out)
    }

    /// Posterior decoding of the significant hits that would be merged. A
    /// degenerate decoding marks the hit low-confidence, which keeps it out of
    /// the merge. Returns whether the run was aborted.
    fn decode_stage(
        &self,
        query: &Profile,
        hits: &mut [Hit],
        previous: &PreviousHits,
        summary: &mut IterationSummary,
    ) -> SearchResult<bool> {
        let cutoff = self.config.significance;
        let targets: Vec<usize> = hits
            .iter()
            .enumerate()
            .filter(|(_, h)| cutoff.passes(h) && !previous.contains(&h.subject))
            .map(|(k, _)| k)
            .collect();

        let run = self.for_each_batch(&targets, |batch| {
            let batch_hits: Vec<&Hit> = batch.iter().map(|&k| &hits[k]).collect();
            let outcomes = self.decode_hits(query, &batch_hits)?;
            for (&k, outcome) in batch.iter().zip(outcomes) {
                match outcome {
                    PairOutcome::Aligned(post) => hits[k].apply_posterior(post),
                    PairOutcome::Failed(e) => {
                        warn!(subject = %hits[k].subject, error = %e, "posterior decoding failed");
                        hits[k].mark_low_confidence(e.to_string());
                        summary.low_confidence += 1;
                    }
                    PairOutcome::NoMatch => {}
                }
            }
            Ok(true)
        })?;
        Ok(run.stopped == Some(BatchStop::Aborted))
    }

    /// Run `f` over `items` in batches of at most `max_bins`. A batch the bin
    /// pool cannot take is halved and retried; `f` returns `false` to skip
    /// the remaining batches. The abort signal is checked before every batch.
    fn for_each_batch<T>(
        &self,
        items: &[T],
        mut f: impl FnMut(&[T]) -> SearchResult<bool>,
    ) -> SearchResult<BatchRun> {
        let mut run = BatchRun::default();
        let mut size = self.config.max_bins;
        let mut pos = 0;
        while pos < items.len() {
            if self.aborted() {
                run.stopped = Some(BatchStop::Aborted);
                break;
            }
            let end = (pos + size).min(items.len());
            match f(&items[pos..end]) {
                Ok(go_on) => {
                    run.batches += 1;
                    pos = end;
                    if !go_on && pos < items.len() {
                        run.stopped = Some(BatchStop::Early);
                        break;
                    }
                }
                Err(SearchError::ResourceExhausted {
                    requested,
                    available,
                }) if end - pos > 1 => {
                    size = (end - pos) / 2;
                    warn!(requested, available, retry = size, "bins exhausted, halving batch");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(run)
    }

    fn resolve(&self, entry: &HhEntry) -> SearchResult<Profile> {
        let db = self
            .databases
            .get(entry.db)
            .ok_or_else(|| SearchError::Database {
                db: entry.db,
                msg: "no such database".to_string(),
            })?;
        db.resolve(entry)
    }

    fn aborted(&self) -> bool {
        self.abort.as_ref().is_some_and(AbortSignal::is_aborted)
    }
}

fn default_prefilter(
    config: &SearchConfig,
    scoring: &Arc<ScoringContext>,
    statistics: &Arc<dyn ScoreStatistics>,
    search_space: usize,
) -> Arc<dyn Prefilter> {
    Arc::new(
        UngappedPrefilter::new(scoring.clone(), config.prefilter.min_score).with_significance(
            SignificanceFloor {
                statistics: statistics.clone(),
                cutoff: config.significance,
                db_size: search_space,
            },
        ),
    )
}

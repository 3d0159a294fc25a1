use super::SearchController;
use crate::align::{Envelope, PairOutcome, PosteriorRequest, PosteriorResult};
use crate::error::SearchResult;
use crate::hits::{Hit, HitList};
use crate::profile::Profile;
use tracing::{info, instrument, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RealignReport {
    pub realigned: usize,
    /// Decoding found no alignment; the Viterbi alignment is kept.
    pub unchanged: usize,
    /// Decoding failed (e.g. numerically degenerate); the hit is left as it was.
    pub failed: usize,
}

impl SearchController {
    /// Recompute alignment detail of the best `realign_max` usable hits with
    /// posterior decoding, constrained to an envelope around each hit's
    /// current path. Scores, significance and ranking stay as they are, and
    /// nothing here feeds the query alignment.
    #[instrument(skip_all, fields(hits = hits.len()))]
    pub fn perform_realign(
        &self,
        query: &Profile,
        hits: &mut HitList,
    ) -> SearchResult<RealignReport> {
        let targets: Vec<Hit> = hits
            .ranked()
            .into_iter()
            .filter(|h| h.is_ok())
            .take(self.config.realign_max)
            .cloned()
            .collect();

        let mut report = RealignReport::default();
        self.for_each_batch(&targets, |batch| {
            let refs: Vec<&Hit> = batch.iter().collect();
            let outcomes = self.decode_hits(query, &refs)?;
            for (hit, outcome) in batch.iter().zip(outcomes) {
                match outcome {
                    PairOutcome::Aligned(post) => {
                        hits.update_alignment(&hit.subject, post);
                        report.realigned += 1;
                    }
                    PairOutcome::NoMatch => report.unchanged += 1,
                    PairOutcome::Failed(e) => {
                        warn!(subject = %hit.subject, error = %e, "realignment failed");
                        report.failed += 1;
                    }
                }
            }
            Ok(true)
        })?;
        info!(
            realigned = report.realigned,
            unchanged = report.unchanged,
            failed = report.failed,
            "realign finished"
        );
        Ok(report)
    }

    /// Posterior decoding of one batch of hits, each inside an envelope of
    /// `realign_margin` around its current path. The result is parallel to
    /// `hits`.
    pub(super) fn decode_hits(
        &self,
        query: &Profile,
        hits: &[&Hit],
    ) -> SearchResult<Vec<PairOutcome<PosteriorResult>>> {
        let resolved: Vec<SearchResult<Profile>> =
            par_map!(hits, |hit: &&Hit| self.resolve(&hit.entry));

        let mut out: Vec<Option<PairOutcome<PosteriorResult>>> =
            hits.iter().map(|_| None).collect();
        let mut subjects = Vec::with_capacity(hits.len());
        let mut envelopes = Vec::with_capacity(hits.len());
        let mut slots = Vec::with_capacity(hits.len());
        for (k, r) in resolved.into_iter().enumerate() {
            match r {
                Ok(subject) => {
                    let hit = hits[k];
                    envelopes.push(Envelope::around_path(
                        query.len(),
                        subject.len(),
                        hit.query_range.start,
                        hit.subject_range.start,
                        &hit.path,
                        self.config.realign_margin,
                    ));
                    subjects.push(subject);
                    slots.push(k);
                }
                Err(e) if e.is_per_pair() => out[k] = Some(PairOutcome::Failed(e)),
                Err(e) => return Err(e),
            }
        }

        let requests: Vec<PosteriorRequest<'_>> = subjects
            .iter()
            .zip(&envelopes)
            .map(|(subject, envelope)| PosteriorRequest {
                subject,
                envelope: Some(envelope),
            })
            .collect();
        let decoded = self.posterior.decode_batch(query, &requests)?;
        for (&k, outcome) in slots.iter().zip(decoded) {
            out[k] = Some(outcome);
        }
        Ok(out
            .into_iter()
            .map(|o| o.unwrap_or(PairOutcome::NoMatch))
            .collect())
    }
}

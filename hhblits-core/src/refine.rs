//! Folding significant hits into the query alignment and rebuilding the query
//! profile from it.

use crate::context::ContextProvider;
use crate::db::{DatabaseProvider, SubjectId};
use crate::error::{SearchError, SearchResult};
use crate::hits::{Hit, PreviousHits};
use crate::msa::QueryAlignment;
use crate::profile::Profile;
use std::sync::Arc;
use tracing::{debug, warn};

/// Running totals over a whole search.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FoundCounters {
    /// Sequences offered to the query alignment by merged subjects.
    pub seqs_found: usize,
    /// Subjects merged.
    pub cluster_found: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub merged: Vec<SubjectId>,
    /// Hits whose subject was already in the alignment.
    pub already_merged: usize,
    /// Subjects that could not be resolved or projected onto the query.
    pub failed: Vec<SubjectId>,
}

pub struct ProfileRefiner {
    context: Arc<dyn ContextProvider>,
}

impl ProfileRefiner {
    pub fn new(context: Arc<dyn ContextProvider>) -> Self {
        Self { context }
    }

    /// Fold `hits` (in rank order) into `qali`. Subjects already in
    /// `previous` are skipped, so presenting the same subject again never adds
    /// rows or counts twice. Every merged subject is recorded in `previous`.
    pub fn merge_hits_to_query(
        &self,
        qali: &mut QueryAlignment,
        hits: &[&Hit],
        databases: &[Arc<dyn DatabaseProvider>],
        previous: &mut PreviousHits,
        counters: &mut FoundCounters,
    ) -> SearchResult<MergeReport> {
        let mut report = MergeReport::default();
        for hit in hits {
            if previous.contains(&hit.subject) {
                report.already_merged += 1;
                continue;
            }
            let db = databases
                .get(hit.entry.db)
                .ok_or_else(|| SearchError::Database {
                    db: hit.entry.db,
                    msg: "no such database".to_string(),
                })?;
            let subject = match db.resolve(&hit.entry) {
                Ok(p) => p,
                Err(e) if e.is_per_pair() => {
                    warn!(subject = %hit.subject, error = %e, "cannot resolve hit for merging");
                    report.failed.push(hit.subject.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };
            match qali.merge_hit(&subject, hit) {
                Ok(count) => {
                    counters.seqs_found += count.offered;
                    counters.cluster_found += 1;
                    previous.insert(hit.subject.clone());
                    report.merged.push(hit.subject.clone());
                }
                Err(e) => {
                    warn!(subject = %hit.subject, error = %e, "hit not merged");
                    report.failed.push(hit.subject.clone());
                }
            }
        }
        debug!(
            merged = report.merged.len(),
            already_merged = report.already_merged,
            failed = report.failed.len(),
            "merged hits into query alignment"
        );
        Ok(report)
    }

    /// Query profile of the filtered view, with pseudocounts applied.
    pub fn rebuild_profile(&self, qali: &QueryAlignment) -> SearchResult<Profile> {
        let raw = qali.profile()?;
        let profile = self.context.augment(&raw);
        profile.validate()?;
        Ok(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::{AlignmentPath, PathOp, ViterbiResult};
    use crate::config::FilterConfig;
    use crate::context::{BackgroundAdmix, NoPseudocounts};
    use crate::db::InMemoryDatabase;
    use crate::hits::Significance;
    use crate::msa::View;

    fn setup() -> (Vec<Arc<dyn DatabaseProvider>>, QueryAlignment, Hit) {
        let subject = Profile::from_sequence("s", b"ACDEWFGHI").unwrap();
        let db: Arc<dyn DatabaseProvider> = Arc::new(InMemoryDatabase::new("m", vec![subject]));
        let entry = db.open(0).unwrap().next_entry().unwrap();
        let mut path = AlignmentPath::default();
        path.push(PathOp::Match, 4);
        path.push(PathOp::Del, 1);
        path.push(PathOp::Match, 4);
        let hit = Hit::from_viterbi(
            entry,
            ViterbiResult {
                score: 20.0,
                query_range: 0..8,
                subject_range: 0..9,
                path,
            },
            Significance {
                pvalue: 1e-8,
                evalue: 1e-8,
                probability: 100.0,
            },
            1,
        );
        let filter = FilterConfig {
            max_seqid: 1.0,
            min_coverage: 0.0,
        };
        let qali = QueryAlignment::new("q", b"ACDEFGHI", &filter, false).unwrap();
        (vec![db], qali, hit)
    }

    #[test]
    fn merging_is_idempotent_with_respect_to_previous_hits() {
        let (dbs, mut qali, hit) = setup();
        let refiner = ProfileRefiner::new(Arc::new(NoPseudocounts));
        let mut previous = PreviousHits::new();
        let mut counters = FoundCounters::default();

        let first = refiner
            .merge_hits_to_query(&mut qali, &[&hit], &dbs, &mut previous, &mut counters)
            .unwrap();
        assert_eq!(first.merged.len(), 1);
        assert_eq!(counters, FoundCounters { seqs_found: 1, cluster_found: 1 });
        assert_eq!(qali.len(View::All), 2);
        assert_eq!(qali.num_columns(), 9);

        let again = refiner
            .merge_hits_to_query(&mut qali, &[&hit], &dbs, &mut previous, &mut counters)
            .unwrap();
        assert!(again.merged.is_empty());
        assert_eq!(again.already_merged, 1);
        assert_eq!(counters.seqs_found, 1);
        assert_eq!(qali.len(View::All), 2);
        assert_eq!(previous.len(), 1);
    }

    #[test]
    fn unknown_database_is_a_controller_error() {
        let (_, mut qali, hit) = setup();
        let refiner = ProfileRefiner::new(Arc::new(NoPseudocounts));
        let err = refiner
            .merge_hits_to_query(
                &mut qali,
                &[&hit],
                &[],
                &mut PreviousHits::new(),
                &mut FoundCounters::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SearchError::Database { db: 0, .. }));
    }

    #[test]
    fn rebuilt_profile_carries_pseudocounts() {
        let (_, qali, _) = setup();
        let plain = ProfileRefiner::new(Arc::new(NoPseudocounts))
            .rebuild_profile(&qali)
            .unwrap();
        let mixed = ProfileRefiner::new(Arc::new(BackgroundAdmix::constant(0.5)))
            .rebuild_profile(&qali)
            .unwrap();
        assert_eq!(plain.len(), 8);
        assert_eq!(mixed.len(), 8);
        assert!(mixed.columns()[0].freqs[0] < plain.columns()[0].freqs[0]);
    }
}

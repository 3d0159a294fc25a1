use super::pool::MatrixPool;
use super::posterior::{posterior_group, Envelope, PosteriorEngine, PosteriorMatrix};
use super::scalar_ref::{log_partition_scalar, score_path, viterbi_scalar};
use super::scoring::{QueryRows, ScoringContext};
use super::types::{AlignmentMode, PairOutcome, PathOp, ViterbiResult};
use super::viterbi::ViterbiEngine;
use super::lanes::LaneGroup;
use crate::alphabet::AMINO_ACIDS;
use crate::error::SearchError;
use crate::profile::{Profile, ProfileColumn, Transitions};
use proptest::prelude::*;
use std::sync::Arc;

fn ctx(mode: AlignmentMode) -> Arc<ScoringContext> {
    Arc::new(ScoringContext::new(mode, -3.0, -1.0, -0.03))
}

fn seq(name: &str, s: &[u8]) -> Profile {
    Profile::from_sequence(name, s).unwrap()
}

fn aligned(out: PairOutcome<ViterbiResult>) -> ViterbiResult {
    match out {
        PairOutcome::Aligned(r) => r,
        other => panic!("expected an alignment, got {other:?}"),
    }
}

fn residues() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop::sample::select(AMINO_ACIDS.to_vec()), 1..30)
}

#[test]
fn local_self_alignment_is_ungapped() {
    let engine = ViterbiEngine::new(ctx(AlignmentMode::Local), 4);
    let q = seq("q", b"WWCCYYHHMMKKRRFF");
    let r = aligned(engine.align_pair(&q, &q).unwrap());
    assert_eq!(r.path.ops, vec![(PathOp::Match, 16)]);
    assert_eq!(r.query_range, 0..16);
    assert_eq!(r.subject_range, 0..16);
    assert!(r.score > 50.0);
}

#[test]
fn global_self_alignment_covers_both_profiles() {
    let engine = ViterbiEngine::new(ctx(AlignmentMode::Global), 4);
    let q = seq("q", b"MKVLAAGIWHEC");
    let r = aligned(engine.align_pair(&q, &q).unwrap());
    assert_eq!(r.path.ops, vec![(PathOp::Match, 12)]);
    assert_eq!(r.query_range, 0..12);
    assert_eq!(r.subject_range, 0..12);
}

#[test]
fn global_alignment_opens_gap_for_subject_insert() {
    let engine = ViterbiEngine::new(ctx(AlignmentMode::Global), 4);
    let q = seq("q", b"WWCCYYHHMMWWCCYYHHMM");
    let t = seq("t", b"WWCCYYHHMMAAAAWWCCYYHHMM");
    let r = aligned(engine.align_pair(&q, &t).unwrap());
    assert_eq!(r.path.consumed(), (20, 24));
    assert!(r.path.ops.iter().any(|&(op, n)| op == PathOp::Del && n == 4));
    let rescored = score_path(engine.context(), &q, &t, &r);
    assert!((rescored - r.score).abs() < 1e-2, "{rescored} vs {}", r.score);
}

fn with_insert_cost(p: &Profile, match_to_insert: f32) -> Profile {
    let t = Transitions {
        match_to_insert,
        ..Transitions::NEUTRAL
    };
    Profile::from_parts(
        p.name(),
        p.len(),
        p.columns().to_vec(),
        Some(vec![t; p.len()]),
        p.seed().to_vec(),
    )
}

#[test]
fn query_residue_against_gap_pays_the_subject_insert_cost() {
    let c = ctx(AlignmentMode::Global);
    let engine = ViterbiEngine::new(c.clone(), 2);
    let q = seq("q", b"WWCCYYHHMMKWWCCYYHHMM");
    let t = seq("t", b"WWCCYYHHMMWWCCYYHHMM");
    let plain = aligned(engine.align_pair(&q, &t).unwrap());
    assert_eq!(
        plain.path.ops,
        vec![(PathOp::Match, 10), (PathOp::Ins, 1), (PathOp::Match, 10)]
    );

    let costly_query = with_insert_cost(&q, -8.0);
    let costly_subject = with_insert_cost(&t, -8.0);
    let by_query = aligned(engine.align_pair(&costly_query, &t).unwrap());
    let by_subject = aligned(engine.align_pair(&q, &costly_subject).unwrap());
    assert!((by_query.score - plain.score).abs() < 1e-3);
    assert!((plain.score - by_subject.score - 8.0).abs() < 1e-3);

    let scalar = aligned(viterbi_scalar(&c, &q, &costly_subject).unwrap());
    assert!((scalar.score - by_subject.score).abs() < 1e-3);
    let rescored = score_path(&c, &q, &costly_subject, &by_subject);
    assert!((rescored - by_subject.score).abs() < 1e-3);
}

#[test]
fn subject_residue_against_gap_pays_the_query_insert_cost() {
    let c = ctx(AlignmentMode::Global);
    let engine = ViterbiEngine::new(c.clone(), 2);
    let q = seq("q", b"WWCCYYHHMMWWCCYYHHMM");
    let t = seq("t", b"WWCCYYHHMMKWWCCYYHHMM");
    let plain = aligned(engine.align_pair(&q, &t).unwrap());
    let by_query = aligned(engine.align_pair(&with_insert_cost(&q, -8.0), &t).unwrap());
    let by_subject = aligned(engine.align_pair(&q, &with_insert_cost(&t, -8.0)).unwrap());
    assert!((plain.score - by_query.score - 8.0).abs() < 1e-3);
    assert!((by_subject.score - plain.score).abs() < 1e-3);
}

#[test]
fn local_alignment_finds_embedded_segment() {
    let engine = ViterbiEngine::new(ctx(AlignmentMode::Local), 4);
    let q = seq("q", b"AAAAAWWCCYYHHMMAAAAA");
    let t = seq("t", b"GGGWWCCYYHHMMGGG");
    let r = aligned(engine.align_pair(&q, &t).unwrap());
    assert_eq!(r.query_range, 5..15);
    assert_eq!(r.subject_range, 3..13);
}

#[test]
fn batch_results_do_not_depend_on_bin_slot() {
    let engine = ViterbiEngine::new(ctx(AlignmentMode::Local), 16);
    let q = seq("q", b"MKVLAAGIWHECYYRR");
    let raw: [&[u8]; 10] = [
        b"MKVLAGIWHECYRR",
        b"GGWHECYYRRKV",
        b"MKVLAAGIW",
        b"PPPPPPPP",
        b"HECYYRRMKVLAAGIW",
        b"MKVIAAGLWHDCYYKR",
        b"AAGIW",
        b"WHEC",
        b"MKVLAAGIWHECYYRRMKVLAAGIWHECYYRR",
        b"CY",
    ];
    let subjects: Vec<Profile> = raw
        .iter()
        .enumerate()
        .map(|(k, s)| seq(&format!("s{k}"), s))
        .collect();
    let forward: Vec<&Profile> = subjects.iter().collect();
    let mut reversed = forward.clone();
    reversed.reverse();

    let a = engine.align_batch(&q, &forward).unwrap();
    let mut b = engine.align_batch(&q, &reversed).unwrap();
    b.reverse();
    for (x, y) in a.into_iter().zip(b) {
        assert_eq!(aligned(x), aligned(y));
    }
}

#[test]
fn oversized_batch_is_rejected() {
    let engine = ViterbiEngine::new(ctx(AlignmentMode::Local), 2);
    let q = seq("q", b"MKV");
    let err = engine.align_batch(&q, &[&q, &q, &q]).unwrap_err();
    assert!(matches!(err, SearchError::ResourceExhausted { requested: 3, .. }));
}

#[test]
fn pair_failures_stay_in_their_slot() {
    let mut scoring = ScoringContext::new(AlignmentMode::Local, -3.0, -1.0, 0.0);
    scoring.min_len = 3;
    let engine = ViterbiEngine::new(Arc::new(scoring), 4);
    let q = seq("q", b"MKVLAAG");
    let short = seq("short", b"MK");
    let broken = Profile::from_parts("broken", 5, vec![ProfileColumn::background(); 2], None, vec![]);
    let good = seq("good", b"MKVLA");
    let out = engine.align_batch(&q, &[&short, &broken, &good]).unwrap();
    assert!(matches!(out[0], PairOutcome::NoMatch));
    assert!(matches!(out[1], PairOutcome::Failed(SearchError::InputMalformed { .. })));
    assert!(out[2].aligned().is_some());
}

#[test]
fn profiles_with_transitions_match_scalar_reference() {
    let rows: Vec<&[u8]> = vec![
        b"MKVLAAGIWHECYYRR",
        b"MKV-AAGIWhhHECYYRR",
        b"MKVLA-GIWHECY-RR",
        b"MRVLAAGLWHEcCYYKR",
    ];
    let q = Profile::from_a3m_rows("q", &rows).unwrap();
    let t_rows: Vec<&[u8]> = vec![b"MKVLAGIWHECYRR", b"MKVLAgGIWHDCYRR"];
    let t = Profile::from_a3m_rows("t", &t_rows).unwrap();
    for mode in [AlignmentMode::Local, AlignmentMode::Global] {
        let c = ctx(mode);
        let engine = ViterbiEngine::new(c.clone(), 2);
        let simd = aligned(engine.align_pair(&q, &t).unwrap());
        let scalar = aligned(viterbi_scalar(&c, &q, &t).unwrap());
        assert!((simd.score - scalar.score).abs() < 1e-2);
        let rescored = score_path(&c, &q, &t, &simd);
        assert!((rescored - simd.score).abs() < 1e-2, "{mode:?}: {rescored} vs {}", simd.score);
    }
}

proptest! {
    #[test]
    fn batch_scores_match_scalar_reference(
        q in residues(),
        subjects in prop::collection::vec(residues(), 1..12),
        global in any::<bool>(),
    ) {
        let mode = if global { AlignmentMode::Global } else { AlignmentMode::Local };
        let c = ctx(mode);
        let engine = ViterbiEngine::new(c.clone(), 16);
        let query = seq("q", &q);
        let profiles: Vec<Profile> = subjects.iter().enumerate().map(|(k, s)| seq(&format!("s{k}"), s)).collect();
        let refs: Vec<&Profile> = profiles.iter().collect();
        let out = engine.align_batch(&query, &refs).unwrap();
        for (res, subject) in out.into_iter().zip(&profiles) {
            let simd = aligned(res);
            let scalar = aligned(viterbi_scalar(&c, &query, subject).unwrap());
            let tol = 1e-3 * (q.len() + subject.len()) as f32;
            prop_assert!((simd.score - scalar.score).abs() <= tol);
            let (dq, dt) = simd.path.consumed();
            prop_assert_eq!(dq, simd.query_range.len());
            prop_assert_eq!(dt, simd.subject_range.len());
            let rescored = score_path(&c, &query, subject, &simd);
            prop_assert!((rescored - simd.score).abs() <= tol);
        }
    }
}

proptest! {
    #[test]
    fn local_paths_start_and_end_with_match(q in residues(), t in residues()) {
        let c = ctx(AlignmentMode::Local);
        let engine = ViterbiEngine::new(c, 1);
        let r = aligned(engine.align_pair(&seq("q", &q), &seq("t", &t)).unwrap());
        prop_assert_eq!(r.path.ops.first().map(|o| o.0), Some(PathOp::Match));
        prop_assert_eq!(r.path.ops.last().map(|o| o.0), Some(PathOp::Match));
    }
}

fn posteriors(
    c: &ScoringContext,
    query: &Profile,
    subjects: &[&Profile],
    envs: &[Option<&Envelope>],
) -> (Vec<Vec<Vec<f32>>>, Vec<f32>) {
    let pool: MatrixPool<PosteriorMatrix> = MatrixPool::new(subjects.len());
    let mut mats = pool.lease(subjects.len()).unwrap();
    let group = LaneGroup::new(c, subjects);
    let qrows = QueryRows::new(c, query);
    let log_z = posterior_group(c, query, &qrows, &group, envs, &mut mats);
    let probs = subjects
        .iter()
        .zip(&mats)
        .map(|(s, m)| {
            (1..=query.len())
                .map(|i| (1..=s.len()).map(|j| m.probability(i, j)).collect())
                .collect()
        })
        .collect();
    (probs, log_z[..subjects.len()].to_vec())
}

#[test]
fn posterior_rows_are_distributions() {
    for mode in [AlignmentMode::Local, AlignmentMode::Global] {
        let c = ctx(mode);
        let q = seq("q", b"MKVLAAGIWHECYYRR");
        let a = seq("a", b"MKVLAGIWHECYRR");
        let b = seq("b", b"GGWHECYYRRKV");
        let (probs, log_z) = posteriors(&c, &q, &[&a, &b], &[None, None]);
        for (k, s) in [&a, &b].iter().enumerate() {
            let reference = log_partition_scalar(&c, &q, s);
            assert!(
                (log_z[k] - reference).abs() <= 1e-3 * reference.abs().max(1.0),
                "{mode:?}: {} vs {reference}",
                log_z[k]
            );
            for row in &probs[k] {
                let total: f32 = row.iter().sum();
                assert!(total <= 1.0 + 1e-3, "{mode:?}: row sum {total}");
                assert!(row.iter().all(|p| (0.0..=1.0).contains(p)));
            }
        }
    }
}

#[test]
fn posterior_is_deterministic_and_slot_invariant() {
    let c = ctx(AlignmentMode::Local);
    let q = seq("q", b"MKVLAAGIWHECYYRR");
    let a = seq("a", b"MKVLAGIWHECYRR");
    let b = seq("b", b"HECYYRRMKV");
    let (first, za) = posteriors(&c, &q, &[&a, &b], &[None, None]);
    let (second, zb) = posteriors(&c, &q, &[&b, &a], &[None, None]);
    assert_eq!(first[0], second[1]);
    assert_eq!(first[1], second[0]);
    assert_eq!(za[0], zb[1]);
}

#[test]
fn mac_recovers_self_alignment() {
    let engine = PosteriorEngine::new(ctx(AlignmentMode::Local), 2, 0.35);
    let q = seq("q", b"WWCCYYHHMMKKRRFF");
    let out = engine.decode_pair(&q, &q, None).unwrap();
    let PairOutcome::Aligned(r) = out else {
        panic!("expected alignment");
    };
    assert_eq!(r.path.ops, vec![(PathOp::Match, 16)]);
    assert_eq!(r.query_range, 0..16);
    assert!(r.mean_probability > 0.9);
    assert!(r.sum_probability <= 16.0 + 1e-3);
}

#[test]
fn envelope_keeps_realignment_near_previous_path() {
    let c = ctx(AlignmentMode::Local);
    let viterbi = ViterbiEngine::new(c.clone(), 1);
    let q = seq("q", b"WWCCYYHHMMAAAAWWCCYYHHMM");
    let t = seq("t", b"WWCCYYHHMM");
    let v = aligned(viterbi.align_pair(&q, &t).unwrap());
    let env = Envelope::around_path(
        q.len(),
        t.len(),
        v.query_range.start,
        v.subject_range.start,
        &v.path,
        2,
    );
    let engine = PosteriorEngine::new(c, 1, 0.35);
    let out = engine.decode_pair(&q, &t, Some(&env)).unwrap();
    let PairOutcome::Aligned(r) = out else {
        panic!("expected alignment");
    };
    assert!(r.query_range.start + 2 >= v.query_range.start);
    assert!(r.query_range.end <= v.query_range.end + 2);
}

#[test]
fn empty_envelope_is_numerically_degenerate() {
    let engine = PosteriorEngine::new(ctx(AlignmentMode::Local), 1, 0.35);
    let q = seq("q", b"MKVLA");
    let t = seq("t", b"MKVLA");
    let empty = Envelope::around_path(5, 5, 0, 0, &Default::default(), 0);
    let out = engine.decode_pair(&q, &t, Some(&empty)).unwrap();
    assert!(matches!(
        out,
        PairOutcome::Failed(SearchError::NumericDegenerate { .. })
    ));
}

#[test]
fn envelope_bounds_follow_path() {
    let mut path = super::types::AlignmentPath::default();
    path.push(PathOp::Match, 3);
    path.push(PathOp::Del, 2);
    path.push(PathOp::Match, 2);
    let env = Envelope::around_path(10, 10, 2, 0, &path, 0);
    assert!(env.contains(3, 1));
    assert!(env.contains(5, 5));
    assert!(env.contains(6, 6));
    assert!(!env.contains(1, 1));
    assert!(!env.contains(3, 4));
    assert!(Envelope::full(4, 4).contains(4, 4));
}

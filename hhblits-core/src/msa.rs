//! The query multiple alignment (Qali).
//!
//! One store of A3M rows, all relative to the query's match columns, seen
//! through two views: `All` is every stored row, `Filtered` is the subset that
//! passed the redundancy and coverage filter when it was appended. Rows the
//! filter rejects are stored only when "keep all sequences" is on, so the two
//! views can never diverge except by the filter.

use crate::align::PathOp;
use crate::alphabet::{self, ANY, GAP, NAA};
use crate::config::FilterConfig;
use crate::error::{SearchError, SearchResult};
use crate::hits::Hit;
use crate::profile::{A3mRow, Profile};
use bit_set::BitSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum View {
    Filtered,
    All,
}

/// Where an appended row ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Appended {
    Filtered,
    AllOnly,
    Dropped,
}

#[derive(Clone, Debug)]
pub struct AlignedSeq {
    name: String,
    a3m: Vec<u8>,
    parsed: A3mRow,
}

impl AlignedSeq {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn a3m(&self) -> &[u8] {
        &self.a3m
    }

    /// Number of non-gap match columns.
    pub fn coverage(&self) -> usize {
        self.parsed.coverage()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeCount {
    /// Rows offered by the subject.
    pub offered: usize,
    pub filtered: usize,
    pub all_only: usize,
}

#[derive(Clone, Debug)]
pub struct QueryAlignment {
    name: String,
    match_len: usize,
    seqs: Vec<AlignedSeq>,
    filtered: BitSet,
    keep_all: bool,
    max_seqid: f32,
    min_coverage: f32,
}

impl QueryAlignment {
    /// Alignment holding only the query row. The query row defines the match
    /// columns and is never filtered.
    pub fn new(
        name: impl Into<String>,
        query_row: &[u8],
        filter: &FilterConfig,
        keep_all: bool,
    ) -> SearchResult<Self> {
        let name = name.into();
        let parsed = A3mRow::parse(query_row)?;
        if parsed.matches.is_empty() {
            return Err(SearchError::malformed(&name, "query has no match columns"));
        }
        let mut filtered = BitSet::new();
        filtered.insert(0);
        Ok(Self {
            match_len: parsed.matches.len(),
            seqs: vec![AlignedSeq {
                name: name.clone(),
                a3m: query_row.to_vec(),
                parsed,
            }],
            name,
            filtered,
            keep_all,
            max_seqid: filter.max_seqid,
            min_coverage: filter.min_coverage,
        })
    }

    /// First row is the query; the rest go through the filter.
    pub fn from_a3m(
        name: impl Into<String>,
        rows: &[&[u8]],
        filter: &FilterConfig,
        keep_all: bool,
    ) -> SearchResult<Self> {
        let name = name.into();
        let Some((first, rest)) = rows.split_first() else {
            return Err(SearchError::malformed(&name, "alignment has no sequences"));
        };
        let mut qali = Self::new(name, first, filter, keep_all)?;
        for (k, row) in rest.iter().enumerate() {
            let row_name = format!("{}_{}", qali.name, k + 1);
            qali.append_row(row_name, row)?;
        }
        Ok(qali)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Query length.
    pub fn num_match_columns(&self) -> usize {
        self.match_len
    }

    /// Match columns plus, for every insertion slot, the widest insertion
    /// carried by any stored row.
    pub fn num_columns(&self) -> usize {
        let (lead, widths) = self.insert_widths(View::All);
        self.match_len + lead + widths.iter().sum::<usize>()
    }

    pub fn len(&self, view: View) -> usize {
        match view {
            View::Filtered => self.filtered.len(),
            View::All => self.seqs.len(),
        }
    }

    pub fn keeps_all(&self) -> bool {
        self.keep_all
    }

    pub fn rows(&self, view: View) -> impl Iterator<Item = &AlignedSeq> + '_ {
        self.seqs
            .iter()
            .enumerate()
            .filter(move |(k, _)| view == View::All || self.filtered.contains(*k))
            .map(|(_, s)| s)
    }

    pub fn append_row(&mut self, name: impl Into<String>, row: &[u8]) -> SearchResult<Appended> {
        let name = name.into();
        let parsed = A3mRow::parse(row)?;
        if parsed.matches.len() != self.match_len {
            return Err(SearchError::malformed(
                &name,
                format!(
                    "{} match columns, query has {}",
                    parsed.matches.len(),
                    self.match_len
                ),
            ));
        }
        let outcome = if self.admits(&parsed) {
            Appended::Filtered
        } else if self.keep_all {
            Appended::AllOnly
        } else {
            return Ok(Appended::Dropped);
        };
        let slot = self.seqs.len();
        self.seqs.push(AlignedSeq {
            name,
            a3m: row.to_vec(),
            parsed,
        });
        if outcome == Appended::Filtered {
            self.filtered.insert(slot);
        }
        Ok(outcome)
    }

    fn admits(&self, row: &A3mRow) -> bool {
        let coverage = row.coverage() as f32 / self.match_len as f32;
        if coverage < self.min_coverage {
            return false;
        }
        self.filtered
            .iter()
            .all(|k| identity(&self.seqs[k].parsed, row) <= self.max_seqid)
    }

    /// Fold every seed row of `subject` into the alignment, projected onto the
    /// query columns through the hit's path. Subject columns aligned to a query
    /// gap become lower-case insertions; query columns outside the hit or
    /// against a subject gap become `-`.
    pub fn merge_hit(&mut self, subject: &Profile, hit: &Hit) -> SearchResult<MergeCount> {
        let (q_used, s_used) = hit.path.consumed();
        if hit.query_range.end > self.match_len
            || hit.subject_range.end > subject.len()
            || q_used != hit.query_range.len()
            || s_used != hit.subject_range.len()
        {
            return Err(SearchError::malformed(
                subject.name(),
                format!(
                    "hit path does not fit query {:?} / subject {:?}",
                    hit.query_range, hit.subject_range
                ),
            ));
        }

        let seeds: Vec<Vec<u8>> = if subject.seed().is_empty() {
            vec![consensus(subject)]
        } else {
            subject.seed().to_vec()
        };
        let mut count = MergeCount {
            offered: seeds.len(),
            ..MergeCount::default()
        };
        for (k, seed) in seeds.iter().enumerate() {
            let row = self.project(subject, seed, hit)?;
            let name = if k == 0 {
                subject.name().to_string()
            } else {
                format!("{}_{k}", subject.name())
            };
            match self.append_row(name, &row)? {
                Appended::Filtered => count.filtered += 1,
                Appended::AllOnly => count.all_only += 1,
                Appended::Dropped => {}
            }
        }
        Ok(count)
    }

    fn project(&self, subject: &Profile, seed: &[u8], hit: &Hit) -> SearchResult<Vec<u8>> {
        let (residues, inserts) = split_slots(seed);
        if residues.len() != subject.len() {
            return Err(SearchError::malformed(
                subject.name(),
                format!(
                    "seed row has {} match columns, profile has {}",
                    residues.len(),
                    subject.len()
                ),
            ));
        }
        let end = hit.subject_range.end;
        // insertions trailing the last aligned subject column are dropped
        let tail = |out: &mut Vec<u8>, j: usize| {
            if j + 1 < end {
                out.extend(inserts[j + 1].iter().map(u8::to_ascii_lowercase));
            }
        };

        let mut out = Vec::with_capacity(self.match_len + hit.subject_range.len());
        out.resize(hit.query_range.start, b'-');
        let mut j = hit.subject_range.start;
        for &(op, n) in &hit.path.ops {
            for _ in 0..n {
                match op {
                    PathOp::Match => {
                        out.push(residues[j].to_ascii_uppercase());
                        tail(&mut out, j);
                        j += 1;
                    }
                    PathOp::Ins => out.push(b'-'),
                    PathOp::Del => {
                        if residues[j] != b'-' {
                            out.push(residues[j].to_ascii_lowercase());
                        }
                        tail(&mut out, j);
                        j += 1;
                    }
                }
            }
        }
        out.extend(std::iter::repeat(b'-').take(self.match_len - hit.query_range.end));
        Ok(out)
    }

    /// Profile of the filtered view.
    pub fn profile(&self) -> SearchResult<Profile> {
        let rows: Vec<&[u8]> = self.rows(View::Filtered).map(|s| s.a3m()).collect();
        Profile::from_a3m_rows(self.name.clone(), &rows)
    }

    /// Rows of a view padded to a common width: insertions are padded with
    /// `.`, so every returned row has the same length.
    pub fn expanded_rows(&self, view: View) -> Vec<Vec<u8>> {
        let (lead, widths) = self.insert_widths(view);
        let width = self.match_len + lead + widths.iter().sum::<usize>();
        self.rows(view)
            .map(|s| {
                let (residues, inserts) = split_slots(&s.a3m);
                let mut out = Vec::with_capacity(width);
                pad_insert(&mut out, &inserts[0], lead);
                for (i, &r) in residues.iter().enumerate() {
                    out.push(r);
                    pad_insert(&mut out, &inserts[i + 1], widths[i]);
                }
                out
            })
            .collect()
    }

    /// Widest leading insertion and widest insertion after each match column.
    fn insert_widths(&self, view: View) -> (usize, Vec<usize>) {
        let mut lead = 0usize;
        let mut widths = vec![0usize; self.match_len];
        for s in self.rows(view) {
            lead = lead.max(s.parsed.leading);
            for (w, &n) in widths.iter_mut().zip(&s.parsed.inserts) {
                *w = (*w).max(n);
            }
        }
        (lead, widths)
    }
}

fn pad_insert(out: &mut Vec<u8>, insert: &[u8], width: usize) {
    out.extend_from_slice(insert);
    out.extend(std::iter::repeat(b'.').take(width - insert.len()));
}

/// Split an A3M row into its match-column bytes and insertion slots. Slot 0
/// holds the leading insertion, slot `k + 1` the insertion after column `k`.
fn split_slots(row: &[u8]) -> (Vec<u8>, Vec<Vec<u8>>) {
    let mut residues = Vec::with_capacity(row.len());
    let mut inserts = vec![Vec::new()];
    for &b in row {
        if b.is_ascii_lowercase() {
            if let Some(slot) = inserts.last_mut() {
                slot.push(b);
            }
        } else if b != b'.' {
            residues.push(b);
            inserts.push(Vec::new());
        }
    }
    (residues, inserts)
}

/// Fraction of identical residues over the shorter of the two rows.
fn identity(a: &A3mRow, b: &A3mRow) -> f32 {
    let shorter = a.coverage().min(b.coverage());
    if shorter == 0 {
        return 0.0;
    }
    let same = a
        .matches
        .iter()
        .zip(&b.matches)
        .filter(|&(&x, &y)| x == y && x != GAP && x != ANY)
        .count();
    same as f32 / shorter as f32
}

fn consensus(profile: &Profile) -> Vec<u8> {
    profile
        .columns()
        .iter()
        .map(|c| {
            let best = (0..NAA).fold(0usize, |b, a| if c.freqs[a] > c.freqs[b] { a } else { b });
            alphabet::letter(best as u8)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::{AlignmentPath, ViterbiResult};
    use crate::db::HhEntry;
    use crate::hits::Significance;

    fn filter(max_seqid: f32, min_coverage: f32) -> FilterConfig {
        FilterConfig {
            max_seqid,
            min_coverage,
        }
    }

    fn hit_for(
        subject: &Profile,
        q: std::ops::Range<usize>,
        s: std::ops::Range<usize>,
        ops: &[(PathOp, usize)],
    ) -> Hit {
        let mut path = AlignmentPath::default();
        for &(op, n) in ops {
            path.push(op, n);
        }
        Hit::from_viterbi(
            HhEntry {
                db: 0,
                index: 0,
                name: subject.name().to_string(),
                length: subject.len(),
            },
            ViterbiResult {
                score: 10.0,
                query_range: q,
                subject_range: s,
                path,
            },
            Significance {
                pvalue: 1e-6,
                evalue: 1e-6,
                probability: 99.9,
            },
            1,
        )
    }

    #[test]
    fn query_row_is_always_kept() {
        let qali = QueryAlignment::new("q", b"ACDEFG", &filter(0.1, 1.0), false).unwrap();
        assert_eq!(qali.len(View::Filtered), 1);
        assert_eq!(qali.num_match_columns(), 6);
        assert_eq!(qali.num_columns(), 6);
    }

    #[test]
    fn redundant_rows_only_reach_the_all_view_when_kept() {
        let rows: Vec<&[u8]> = vec![b"ACDEFGHIKL", b"ACDEFGHIKL", b"WWWWWGHIKL"];
        let dropped = QueryAlignment::from_a3m("q", &rows, &filter(0.9, 0.0), false).unwrap();
        assert_eq!(dropped.len(View::Filtered), 2);
        assert_eq!(dropped.len(View::All), 2);

        let kept = QueryAlignment::from_a3m("q", &rows, &filter(0.9, 0.0), true).unwrap();
        assert_eq!(kept.len(View::Filtered), 2);
        assert_eq!(kept.len(View::All), 3);
        let names: Vec<&str> = kept.rows(View::Filtered).map(|s| s.name()).collect();
        assert_eq!(names, vec!["q", "q_2"]);
    }

    #[test]
    fn coverage_filter_applies() {
        let mut qali = QueryAlignment::new("q", b"ACDEFGHIKL", &filter(1.0, 0.5), false).unwrap();
        assert_eq!(qali.append_row("short", b"ACD-------").unwrap(), Appended::Dropped);
        assert_eq!(qali.append_row("long", b"ACDEF-----").unwrap(), Appended::Filtered);
    }

    #[test]
    fn rows_of_the_wrong_length_are_rejected() {
        let mut qali = QueryAlignment::new("q", b"ACDEF", &filter(1.0, 0.0), false).unwrap();
        let err = qali.append_row("bad", b"ACD").unwrap_err();
        assert!(matches!(err, SearchError::InputMalformed { .. }));
    }

    #[test]
    fn deleted_subject_columns_become_insertions() {
        let mut qali = QueryAlignment::new("q", b"ACDEFGHI", &filter(1.0, 0.0), false).unwrap();
        let subject = Profile::from_sequence("s", b"ACDEWWWFGHI").unwrap();
        let hit = hit_for(
            &subject,
            0..8,
            0..11,
            &[(PathOp::Match, 4), (PathOp::Del, 3), (PathOp::Match, 4)],
        );
        let count = qali.merge_hit(&subject, &hit).unwrap();
        assert_eq!(count, MergeCount { offered: 1, filtered: 1, all_only: 0 });
        let merged = qali.rows(View::All).nth(1).unwrap();
        assert_eq!(merged.a3m(), b"ACDEwwwFGHI");
        assert_eq!(qali.num_match_columns(), 8);
        assert_eq!(qali.num_columns(), 11);

        let expanded = qali.expanded_rows(View::All);
        assert_eq!(expanded[0], b"ACDE...FGHI".to_vec());
        assert!(expanded.iter().all(|r| r.len() == 11));
    }

    #[test]
    fn local_hits_are_padded_with_gaps() {
        let mut qali = QueryAlignment::new("q", b"ACDEFGHIKL", &filter(1.0, 0.0), false).unwrap();
        let subject = Profile::from_sequence("s", b"WWDEFGWW").unwrap();
        let hit = hit_for(
            &subject,
            2..6,
            2..5,
            &[(PathOp::Match, 2), (PathOp::Ins, 1), (PathOp::Match, 1)],
        );
        qali.merge_hit(&subject, &hit).unwrap();
        let merged = qali.rows(View::All).nth(1).unwrap();
        assert_eq!(merged.a3m(), b"--DE-F----");
        assert_eq!(qali.num_columns(), 10);
    }

    #[test]
    fn inconsistent_paths_are_rejected() {
        let mut qali = QueryAlignment::new("q", b"ACDEF", &filter(1.0, 0.0), false).unwrap();
        let subject = Profile::from_sequence("s", b"ACDEF").unwrap();
        let hit = hit_for(&subject, 0..5, 0..5, &[(PathOp::Match, 4)]);
        assert!(qali.merge_hit(&subject, &hit).is_err());
        assert_eq!(qali.len(View::All), 1);
    }

    #[test]
    fn profile_follows_the_filtered_view() {
        let rows: Vec<&[u8]> = vec![b"ACDEF", b"ACDEF", b"ACDEW"];
        let qali = QueryAlignment::from_a3m("q", &rows, &filter(0.9, 0.0), true).unwrap();
        let p = qali.profile().unwrap();
        assert_eq!(p.len(), 5);
        assert_eq!(p.seed().len(), 2);
        assert_eq!(p.name(), "q");
    }
}

//! Profiles: per-column amino-acid distributions plus optional transitions.

use crate::alphabet::{self, BACKGROUND, GAP, NAA};
use crate::error::{SearchError, SearchResult};

/// Pseudocount mass added to every transition estimate.
const TRANSITION_PC: f32 = 0.05;

/// Log2 transition probabilities out of one match column.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transitions {
    pub match_to_match: f32,
    pub match_to_insert: f32,
    pub insert_to_insert: f32,
}

impl Transitions {
    pub const NEUTRAL: Transitions = Transitions {
        match_to_match: 0.0,
        match_to_insert: 0.0,
        insert_to_insert: 0.0,
    };

    fn is_valid(&self) -> bool {
        [self.match_to_match, self.match_to_insert, self.insert_to_insert]
            .iter()
            .all(|v| v.is_finite() && *v <= 0.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProfileColumn {
    pub freqs: [f32; NAA],
}

impl ProfileColumn {
    pub fn one_hot(code: u8) -> Self {
        let mut freqs = [0.0f32; NAA];
        if (code as usize) < NAA {
            freqs[code as usize] = 1.0;
        } else {
            freqs = BACKGROUND;
        }
        Self { freqs }
    }

    pub fn background() -> Self {
        Self { freqs: BACKGROUND }
    }

    /// Shannon entropy in nats.
    pub fn entropy(&self) -> f32 {
        self.freqs
            .iter()
            .filter(|&&f| f > 0.0)
            .map(|&f| -f * f.ln())
            .sum()
    }

    pub fn normalize(&mut self) {
        let total: f32 = self.freqs.iter().sum();
        if total > 0.0 {
            for f in self.freqs.iter_mut() {
                *f /= total;
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Profile {
    name: String,
    declared_len: usize,
    columns: Vec<ProfileColumn>,
    transitions: Option<Vec<Transitions>>,
    neff: f32,
    seed: Vec<Vec<u8>>,
}

impl Profile {
    /// Build a profile from raw parts. Nothing is checked here; call
    /// [`Profile::validate`] before handing the profile to an engine.
    pub fn from_parts(
        name: impl Into<String>,
        declared_len: usize,
        columns: Vec<ProfileColumn>,
        transitions: Option<Vec<Transitions>>,
        seed: Vec<Vec<u8>>,
    ) -> Self {
        let mut profile = Self {
            name: name.into(),
            declared_len,
            columns,
            transitions,
            neff: 1.0,
            seed,
        };
        profile.neff = profile.compute_neff();
        profile
    }

    /// Single-sequence profile: one-hot columns, no transitions.
    pub fn from_sequence(name: impl Into<String>, seq: &[u8]) -> SearchResult<Self> {
        let codes = alphabet::encode_protein(seq)?;
        let columns = codes.iter().map(|&c| ProfileColumn::one_hot(c)).collect();
        let seed = vec![seq.to_ascii_uppercase()];
        Ok(Self::from_parts(name, codes.len(), columns, None, seed))
    }

    /// Profile from A3M rows: upper case and `-` are match columns, lower case
    /// letters are insertions. The first row defines the match columns.
    ///
    /// Rows are weighted with position-based (Henikoff) weights; transitions
    /// are estimated from the weighted insertion/deletion events.
    pub fn from_a3m_rows(name: impl Into<String>, rows: &[&[u8]]) -> SearchResult<Self> {
        let name = name.into();
        let parsed: Vec<A3mRow> = rows
            .iter()
            .map(|r| A3mRow::parse(r))
            .collect::<SearchResult<_>>()?;
        let Some(first) = parsed.first() else {
            return Err(SearchError::malformed(&name, "alignment has no sequences"));
        };
        let len = first.matches.len();
        for (idx, row) in parsed.iter().enumerate() {
            if row.matches.len() != len {
                return Err(SearchError::malformed(
                    &name,
                    format!(
                        "row {idx} has {} match columns, expected {len}",
                        row.matches.len()
                    ),
                ));
            }
        }

        let weights = henikoff_weights(&parsed, len);
        let mut columns = Vec::with_capacity(len);
        let mut transitions = Vec::with_capacity(len);
        for i in 0..len {
            let mut col = ProfileColumn { freqs: [0.0; NAA] };
            let mut w_match = 0.0f32;
            let mut w_mm = 0.0f32;
            let mut w_mi = 0.0f32;
            let mut ins_open = 0.0f32;
            let mut ins_extend = 0.0f32;
            for (row, &w) in parsed.iter().zip(&weights) {
                let c = row.matches[i];
                if (c as usize) < NAA {
                    col.freqs[c as usize] += w;
                }
                if c == GAP {
                    continue;
                }
                w_match += w;
                let ins = row.inserts[i];
                if ins > 0 {
                    w_mi += w;
                    ins_open += w * ins as f32;
                    ins_extend += w * (ins - 1) as f32;
                } else if i + 1 < len && row.matches[i + 1] == GAP {
                    // deletion: neither match nor insert continues
                } else {
                    w_mm += w;
                }
            }
            if col.freqs.iter().sum::<f32>() > 0.0 {
                col.normalize();
            } else {
                col = ProfileColumn::background();
            }
            columns.push(col);

            let denom = w_match + 3.0 * TRANSITION_PC;
            transitions.push(Transitions {
                match_to_match: ((w_mm + TRANSITION_PC) / denom).log2(),
                match_to_insert: ((w_mi + TRANSITION_PC) / denom).log2(),
                insert_to_insert: ((ins_extend + TRANSITION_PC) / (ins_open + 2.0 * TRANSITION_PC))
                    .log2(),
            });
        }

        let seed = rows.iter().map(|r| r.to_vec()).collect();
        Ok(Self::from_parts(name, len, columns, Some(transitions), seed))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of match columns.
    pub fn len(&self) -> usize {
        self.declared_len
    }

    pub fn is_empty(&self) -> bool {
        self.declared_len == 0
    }

    pub fn columns(&self) -> &[ProfileColumn] {
        &self.columns
    }

    pub fn columns_mut(&mut self) -> &mut [ProfileColumn] {
        &mut self.columns
    }

    pub fn transitions(&self) -> Option<&[Transitions]> {
        self.transitions.as_deref()
    }

    /// Transitions of column `i` (0-based), neutral when the profile has none.
    #[inline]
    pub fn transition(&self, i: usize) -> Transitions {
        match &self.transitions {
            Some(t) => t[i],
            None => Transitions::NEUTRAL,
        }
    }

    pub fn neff(&self) -> f32 {
        self.neff
    }

    /// A3M rows of the alignment this profile was built from.
    pub fn seed(&self) -> &[Vec<u8>] {
        &self.seed
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Recompute neff after the columns were changed in place.
    pub fn refresh_neff(&mut self) {
        self.neff = self.compute_neff();
    }

    fn compute_neff(&self) -> f32 {
        if self.columns.is_empty() {
            return 1.0;
        }
        let total: f32 = self.columns.iter().map(|c| c.entropy().exp()).sum();
        total / self.columns.len() as f32
    }

    /// Structural checks every profile must pass before entering a DP matrix.
    pub fn validate(&self) -> SearchResult<()> {
        if self.columns.len() != self.declared_len {
            return Err(SearchError::malformed(
                &self.name,
                format!(
                    "{} columns but declared length {}",
                    self.columns.len(),
                    self.declared_len
                ),
            ));
        }
        if let Some(t) = &self.transitions {
            if t.len() != self.declared_len {
                return Err(SearchError::malformed(
                    &self.name,
                    format!("{} transition rows for {} columns", t.len(), self.declared_len),
                ));
            }
            if let Some(pos) = t.iter().position(|t| !t.is_valid()) {
                return Err(SearchError::malformed(
                    &self.name,
                    format!("invalid transition log-probability at column {pos}"),
                ));
            }
        }
        for (pos, col) in self.columns.iter().enumerate() {
            if col.freqs.iter().any(|f| !f.is_finite() || *f < 0.0) {
                return Err(SearchError::malformed(
                    &self.name,
                    format!("non-finite or negative frequency at column {pos}"),
                ));
            }
            if col.freqs.iter().sum::<f32>() <= 0.0 {
                return Err(SearchError::malformed(
                    &self.name,
                    format!("column {pos} has no emission mass"),
                ));
            }
        }
        Ok(())
    }
}

/// One A3M row split into match-column codes and per-column insertion counts.
#[derive(Clone, Debug)]
pub(crate) struct A3mRow {
    /// Residue code per match column (`GAP` for deletions).
    pub matches: Vec<u8>,
    /// Number of inserted residues following each match column.
    pub inserts: Vec<usize>,
    /// Inserted residues before the first match column.
    pub leading: usize,
}

impl A3mRow {
    pub fn parse(row: &[u8]) -> SearchResult<Self> {
        let mut matches = Vec::with_capacity(row.len());
        let mut inserts = Vec::with_capacity(row.len());
        let mut leading = 0usize;
        for (pos, &b) in row.iter().enumerate() {
            if b.is_ascii_lowercase() {
                alphabet::code(b).ok_or(SearchError::InvalidChar { ch: b as char, pos })?;
                match inserts.last_mut() {
                    Some(n) => *n += 1,
                    None => leading += 1,
                }
                continue;
            }
            let c = alphabet::code(b).ok_or(SearchError::InvalidChar { ch: b as char, pos })?;
            if b == b'.' {
                // A2M-style insert-gap padding carries no column
                continue;
            }
            matches.push(c);
            inserts.push(0);
        }
        Ok(Self {
            matches,
            inserts,
            leading,
        })
    }

    pub fn coverage(&self) -> usize {
        self.matches.iter().filter(|&&c| c != GAP).count()
    }
}

fn henikoff_weights(rows: &[A3mRow], len: usize) -> Vec<f32> {
    let n = rows.len();
    let mut weights = vec![0.0f32; n];
    let mut counts = [0usize; NAA];
    for i in 0..len {
        counts.fill(0);
        for row in rows {
            let c = row.matches[i];
            if (c as usize) < NAA {
                counts[c as usize] += 1;
            }
        }
        let distinct = counts.iter().filter(|&&k| k > 0).count();
        if distinct == 0 {
            continue;
        }
        for (row, w) in rows.iter().zip(weights.iter_mut()) {
            let c = row.matches[i];
            if (c as usize) < NAA {
                *w += 1.0 / (distinct * counts[c as usize]) as f32;
            }
        }
    }
    // rows made only of gaps or X still count a little
    let floor = 1e-3 / n as f32;
    for w in weights.iter_mut() {
        if *w <= 0.0 {
            *w = floor;
        }
    }
    let total: f32 = weights.iter().sum();
    for w in weights.iter_mut() {
        *w /= total;
    }
    weights
}

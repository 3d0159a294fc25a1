use crate::error::{SearchError, SearchResult};
use std::sync::LazyLock;

/// Number of amino-acid letters that carry emission probability.
pub const NAA: usize = 20;
/// Code of the unknown residue `X`; accepted but contributes no counts.
pub const ANY: u8 = 20;
/// Code used internally for a gap in a match column.
pub const GAP: u8 = 21;

pub const AMINO_ACIDS: &[u8; NAA] = b"ARNDCQEGHILKMFPSTWYV";

/// BLOSUM62 background frequencies, in `AMINO_ACIDS` order.
pub const BACKGROUND: [f32; NAA] = [
    0.074, 0.052, 0.045, 0.054, 0.025, 0.034, 0.054, 0.074, 0.026, 0.068, 0.099, 0.058, 0.025,
    0.047, 0.039, 0.057, 0.051, 0.013, 0.032, 0.073,
];

static AA_MAP: LazyLock<[u8; 256]> = LazyLock::new(build_map);

fn build_map() -> [u8; 256] {
    let mut map = [255u8; 256];
    for (i, &b) in AMINO_ACIDS.iter().enumerate() {
        map[b as usize] = i as u8;
        map[b.to_ascii_lowercase() as usize] = i as u8;
    }
    // ambiguity codes and rare residues fold into X
    for &b in b"XBZJUOxbzjuo*" {
        map[b as usize] = ANY;
    }
    map[b'-' as usize] = GAP;
    map[b'.' as usize] = GAP;
    map
}

#[inline]
pub fn code(b: u8) -> Option<u8> {
    match AA_MAP[b as usize] {
        255 => None,
        v => Some(v),
    }
}

#[inline]
pub fn letter(code: u8) -> u8 {
    match code {
        c if (c as usize) < NAA => AMINO_ACIDS[c as usize],
        ANY => b'X',
        _ => b'-',
    }
}

#[inline]
pub fn is_gap(b: u8) -> bool {
    b == b'-' || b == b'.'
}

/// Encode an ungapped protein sequence; gaps are rejected.
pub fn encode_protein(seq: &[u8]) -> SearchResult<Vec<u8>> {
    let mut codes = Vec::with_capacity(seq.len());
    for (pos, &b) in seq.iter().enumerate() {
        match code(b) {
            Some(v) if v != GAP => codes.push(v),
            _ => return Err(SearchError::InvalidChar { ch: b as char, pos }),
        }
    }
    Ok(codes)
}

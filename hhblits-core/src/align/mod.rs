pub mod lanes;
pub mod pool;
pub mod posterior;
pub mod scalar_ref;
pub mod scoring;
pub mod types;
pub mod viterbi;

pub use pool::{BinLease, MatrixPool};
pub use posterior::{Envelope, PosteriorEngine, PosteriorMatrix, PosteriorRequest};
pub use scoring::{ScoringContext, LOG_FLOOR, MIN_ODDS};
pub use types::{
    AlignmentMode, AlignmentPath, PairOutcome, PathOp, PosteriorResult, ViterbiResult,
};
pub use viterbi::{ViterbiEngine, ViterbiMatrix};

#[cfg(test)]
mod tests;

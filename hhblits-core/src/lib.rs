#[macro_use]
mod par;

pub mod align;
pub mod alphabet;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod hits;
pub mod msa;
pub mod prefilter;
pub mod profile;
pub mod refine;
pub mod search;

pub use config::SearchConfig;
pub use error::{SearchError, SearchResult};
pub use search::{SearchController, SearchOutcome};

//! Database collaborator interface and an in-memory implementation.

use crate::error::{SearchError, SearchResult};
use crate::profile::Profile;
use std::fmt;

/// Identity of a subject across iterations: database index plus entry name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectId {
    pub db: usize,
    pub name: String,
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.db, self.name)
    }
}

/// Handle to a subject profile inside a database; resolved lazily.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HhEntry {
    pub db: usize,
    pub index: usize,
    pub name: String,
    /// Number of match columns of the stored profile.
    pub length: usize,
}

impl HhEntry {
    pub fn id(&self) -> SubjectId {
        SubjectId {
            db: self.db,
            name: self.name.clone(),
        }
    }
}

/// Stream of entry handles; `None` marks the end of the stream.
pub trait EntryStream: Send {
    fn next_entry(&mut self) -> Option<HhEntry>;
}

impl<I> EntryStream for I
where
    I: Iterator<Item = HhEntry> + Send,
{
    fn next_entry(&mut self) -> Option<HhEntry> {
        self.next()
    }
}

pub trait DatabaseProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Number of entries, used as the search-space size for E-values.
    fn size(&self) -> usize;

    /// Start a fresh entry stream. `db` is the index the caller assigned to
    /// this database and must be stamped on every handle.
    fn open(&self, db: usize) -> SearchResult<Box<dyn EntryStream + '_>>;

    /// Load the profile behind a handle; `NotFound` for stale handles.
    fn resolve(&self, entry: &HhEntry) -> SearchResult<Profile>;
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryDatabase {
    name: String,
    profiles: Vec<Profile>,
}

impl InMemoryDatabase {
    pub fn new(name: impl Into<String>, profiles: Vec<Profile>) -> Self {
        Self {
            name: name.into(),
            profiles,
        }
    }

    pub fn push(&mut self, profile: Profile) {
        self.profiles.push(profile);
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }
}

impl DatabaseProvider for InMemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> usize {
        self.profiles.len()
    }

    fn open(&self, db: usize) -> SearchResult<Box<dyn EntryStream + '_>> {
        Ok(Box::new(self.profiles.iter().enumerate().map(
            move |(index, p)| HhEntry {
                db,
                index,
                name: p.name().to_string(),
                length: p.len(),
            },
        )))
    }

    fn resolve(&self, entry: &HhEntry) -> SearchResult<Profile> {
        match self.profiles.get(entry.index) {
            Some(p) if p.name() == entry.name => Ok(p.clone()),
            _ => Err(SearchError::NotFound {
                db: entry.db,
                entry: entry.index,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> InMemoryDatabase {
        InMemoryDatabase::new(
            "mem",
            vec![
                Profile::from_sequence("a", b"ACDE").unwrap(),
                Profile::from_sequence("b", b"KLMNPQ").unwrap(),
            ],
        )
    }

    #[test]
    fn stream_stamps_database_index() {
        let db = db();
        let mut stream = db.open(3).unwrap();
        let first = stream.next_entry().unwrap();
        assert_eq!(first.db, 3);
        assert_eq!(first.length, 4);
        let second = stream.next_entry().unwrap();
        assert_eq!(second.name, "b");
        assert!(stream.next_entry().is_none());
    }

    #[test]
    fn resolve_and_stale_handles() {
        let db = db();
        let entry = db.open(0).unwrap().next_entry().unwrap();
        assert_eq!(db.resolve(&entry).unwrap().name(), "a");
        let stale = HhEntry {
            name: "gone".into(),
            ..entry
        };
        assert!(matches!(
            db.resolve(&stale),
            Err(SearchError::NotFound { db: 0, entry: 0 })
        ));
    }

    #[test]
    fn subject_ids_order_by_database_then_name() {
        let a = SubjectId { db: 0, name: "z".into() };
        let b = SubjectId { db: 1, name: "a".into() };
        assert!(a < b);
        assert_eq!(a.to_string(), "0:z");
    }
}

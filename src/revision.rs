use std::{
    fmt,
    hash::{Hash, Hasher},
    ops::Deref,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::{error::RevisionError, index::ChainLocation};

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Contributor {
    pub name: Option<CompactString>,
    pub id: Option<i64>,
    pub is_registered: bool,
}

/// Everything about a revision except its text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionMetadata {
    pub id: i64,
    pub article_id: i64,
    /// 1-based position among the article's revisions in chronological order.
    pub counter: i64,
    pub primary_key: i64,
    pub full_revision_pk: i64,
    pub timestamp: DateTime<Utc>,
    pub contributor: Contributor,
    pub comment: Option<CompactString>,
    pub minor: bool,
}

impl RevisionMetadata {
    pub fn location(&self) -> ChainLocation {
        ChainLocation {
            full_revision_pk: self.full_revision_pk,
            run_length: self.primary_key - self.full_revision_pk + 1,
        }
    }
}

/// Reconstructs revision texts on demand.
pub trait TextLoader: Send + Sync {
    fn load_text(&self, revision: &RevisionMetadata) -> Result<String, RevisionError>;
}

/// A revision whose text is reconstructed on first access and kept afterwards.
///
/// Two revisions are equal iff their ids are equal, regardless of whether their texts
/// have been loaded.
pub struct Revision {
    metadata: RevisionMetadata,
    text: OnceCell<String>,
    loader: Arc<dyn TextLoader>,
}

impl Revision {
    pub fn new(metadata: RevisionMetadata, loader: Arc<dyn TextLoader>) -> Self {
        Self {
            metadata,
            text: OnceCell::new(),
            loader,
        }
    }

    pub fn metadata(&self) -> &RevisionMetadata {
        &self.metadata
    }

    /// Returns the revision text, reconstructing it on the first call.
    ///
    /// Concurrent first calls block on each other and the chain is replayed only once. A
    /// failed reconstruction is not cached; the next call tries again.
    pub fn text(&self) -> Result<&str, RevisionError> {
        self.text
            .get_or_try_init(|| self.loader.load_text(&self.metadata))
            .map(String::as_str)
    }

    pub fn is_text_loaded(&self) -> bool {
        self.text.get().is_some()
    }

    pub fn into_text(self) -> Result<String, RevisionError> {
        match self.text.into_inner() {
            Some(text) => Ok(text),
            None => self.loader.load_text(&self.metadata),
        }
    }
}

impl Deref for Revision {
    type Target = RevisionMetadata;

    fn deref(&self) -> &Self::Target {
        &self.metadata
    }
}

impl PartialEq for Revision {
    fn eq(&self, other: &Self) -> bool {
        self.metadata.id == other.metadata.id
    }
}

impl Eq for Revision {}

impl Hash for Revision {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.metadata.id.hash(state);
    }
}

impl fmt::Debug for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Revision")
            .field("metadata", &self.metadata)
            .field("text_loaded", &self.is_text_loaded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    struct CountingLoader {
        calls: AtomicUsize,
        fail_first: bool,
    }

    impl TextLoader for CountingLoader {
        fn load_text(&self, revision: &RevisionMetadata) -> Result<String, RevisionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(RevisionError::UnknownRevision(revision.id));
            }
            Ok(format!("text of {}", revision.id))
        }
    }

    fn metadata(id: i64) -> RevisionMetadata {
        RevisionMetadata {
            id,
            article_id: 1,
            counter: 1,
            primary_key: 12,
            full_revision_pk: 10,
            timestamp: DateTime::from_timestamp_millis(0).unwrap(),
            contributor: Contributor::default(),
            comment: None,
            minor: false,
        }
    }

    fn loader(fail_first: bool) -> Arc<CountingLoader> {
        Arc::new(CountingLoader {
            calls: AtomicUsize::new(0),
            fail_first,
        })
    }

    #[test]
    fn test_text_is_loaded_once() {
        let loader = loader(false);
        let revision = Revision::new(metadata(5), loader.clone());
        assert!(!revision.is_text_loaded());
        assert_eq!(revision.text().unwrap(), "text of 5");
        assert_eq!(revision.text().unwrap(), "text of 5");
        assert!(revision.is_text_loaded());
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_load_is_retried() {
        let loader = loader(true);
        let revision = Revision::new(metadata(5), loader.clone());
        assert!(revision.text().is_err());
        assert!(!revision.is_text_loaded());
        assert_eq!(revision.text().unwrap(), "text of 5");
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_equality_by_id() {
        let loader = loader(false);
        let a = Revision::new(metadata(5), loader.clone());
        let b = Revision::new(metadata(5), loader.clone());
        let c = Revision::new(metadata(6), loader.clone());
        a.text().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_deref_and_location() {
        let revision = Revision::new(metadata(5), loader(false));
        assert_eq!(revision.article_id, 1);
        assert_eq!(
            revision.location(),
            ChainLocation {
                full_revision_pk: 10,
                run_length: 3
            }
        );
    }
}

use chrono::{DateTime, Utc};

use crate::{codec::DecodingError, index::IndexFormatError, store::StoreError};

/// Errors of the revision lookups.
///
/// Not-found conditions are separate variants so callers can tell "no such article"
/// from "no such revision number in this article" without inspecting messages.
#[derive(Debug, thiserror::Error)]
pub enum RevisionError {
    #[error("revision {0} does not exist")]
    UnknownRevision(i64),
    #[error("article {0} does not exist")]
    UnknownArticle(i64),
    #[error("article {article_id} has no revision {counter} (it has {max} revisions)")]
    CounterOutOfRange {
        article_id: i64,
        counter: i64,
        max: i64,
    },
    #[error("article {article_id} did not exist at {timestamp}")]
    BeforeFirstAppearance {
        article_id: i64,
        timestamp: DateTime<Utc>,
    },
    /// Rejected before any I/O.
    #[error("{name} must be positive, got {value}")]
    InvalidArgument { name: &'static str, value: i64 },
    #[error("corrupt revision chain at primary key {primary_key} (run starting at {full_revision_pk})")]
    Decoding {
        full_revision_pk: i64,
        primary_key: i64,
        #[source]
        source: DecodingError,
    },
    #[error("corrupt entry in `{table}` for key {key}")]
    IndexCorrupt {
        table: &'static str,
        key: i64,
        #[source]
        source: IndexFormatError,
    },
    #[error("row store failure")]
    Store(#[from] StoreError),
}

impl RevisionError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RevisionError::UnknownRevision(_)
                | RevisionError::UnknownArticle(_)
                | RevisionError::CounterOutOfRange { .. }
                | RevisionError::BeforeFirstAppearance { .. }
        )
    }

    /// Whether a reconnect may make the failed operation succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RevisionError::Store(err) if err.is_retryable())
    }
}

pub(crate) fn require_positive(name: &'static str, value: i64) -> Result<(), RevisionError> {
    if value > 0 {
        Ok(())
    } else {
        Err(RevisionError::InvalidArgument { name, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(RevisionError::UnknownRevision(1).is_not_found());
        assert!(RevisionError::CounterOutOfRange {
            article_id: 1,
            counter: 9,
            max: 3
        }
        .is_not_found());
        assert!(!RevisionError::InvalidArgument {
            name: "revision id",
            value: 0
        }
        .is_not_found());

        let transient = RevisionError::Store(StoreError::Connection("gone".into()));
        assert!(transient.is_retryable());
        assert!(!transient.is_not_found());
        let fatal = RevisionError::Store(StoreError::MissingColumn("Revision"));
        assert!(!fatal.is_retryable());
    }

    #[test]
    fn test_require_positive() {
        assert!(require_positive("revision id", 1).is_ok());
        assert!(matches!(
            require_positive("revision id", -42),
            Err(RevisionError::InvalidArgument { value: -42, .. })
        ));
        assert!(require_positive("revision id", 0).is_err());
    }
}

//! Public query surface over a [`RowStore`].
//!
//! Lookups resolve a revision through the [`RevisionIndex`] and load its metadata eagerly.
//! The text is reconstructed on first [`Revision::text`] call by reading the revision's
//! chain, decoding each row and replaying it. Every store round-trip is wrapped in the
//! configured [`RetryPolicy`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use compact_str::CompactString;

use crate::{
    codec::DecodingError,
    config::{Config, ConfigError},
    decoder::{EncodedPayload, RevisionDecoder},
    diff::Diff,
    error::{require_positive, RevisionError},
    index::{millis_to_datetime, ArticleIndexEntry, ChainLocation, IndexFormatError, RevisionIndex},
    maintenance,
    reconstruction::{ChainReplayer, RowKind},
    retry::RetryPolicy,
    revision::{Contributor, Revision, RevisionMetadata, TextLoader},
    store::{
        columns, Aggregate, Comparison, Filter, Order, Query, RowSink, RowStore, ScalarQuery, Table,
        Value,
    },
};

const METADATA_COLUMNS: &[&str] = &[
    columns::PRIMARY_KEY,
    columns::REVISION_COUNTER,
    columns::REVISION_ID,
    columns::ARTICLE_ID,
    columns::TIMESTAMP,
    columns::COMMENT,
    columns::MINOR,
    columns::CONTRIBUTOR_NAME,
    columns::CONTRIBUTOR_ID,
    columns::CONTRIBUTOR_IS_REGISTERED,
];
const CHAIN_COLUMNS: &[&str] = &[columns::PRIMARY_KEY, columns::REVISION];

/// Cheap to clone; clones share the store, the index caches and the decoder settings.
pub struct RevisionApi<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for RevisionApi<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<S> {
    store: S,
    index: RevisionIndex,
    decoder: RevisionDecoder,
    binary_data: bool,
    retry: RetryPolicy,
}

impl<S: RowStore + 'static> RevisionApi<S> {
    /// Uses the default settings: UTF-8, binary payloads, no compression, one reconnect.
    pub fn new(store: S) -> Self {
        Self::from_parts(
            store,
            RevisionDecoder::new(Default::default()),
            true,
            RetryPolicy::default(),
        )
    }

    pub fn with_config(store: S, config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::from_parts(
            store,
            config.decoder()?,
            config.encoding.binary_data,
            config.retry_policy(),
        ))
    }

    pub fn from_parts(
        store: S,
        decoder: RevisionDecoder,
        binary_data: bool,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                index: RevisionIndex::new(),
                decoder,
                binary_data,
                retry,
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn index(&self) -> &RevisionIndex {
        &self.inner.index
    }

    /// Drops cached index entries, e.g. after new articles were written.
    pub fn clear_cache(&self) {
        self.inner.index.clear_cache();
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn get_revision(&self, revision_id: i64) -> Result<Revision, RevisionError> {
        require_positive("revision id", revision_id)?;
        let inner = &self.inner;
        let metadata = inner.retry.run(&inner.store, |store| {
            let location = inner.index.resolve_by_id(store, revision_id)?;
            inner.load_metadata(store, location)
        })?;
        if metadata.id != revision_id {
            return Err(RevisionError::IndexCorrupt {
                table: Table::IndexRevisionId.name(),
                key: revision_id,
                source: IndexFormatError::Mismatch {
                    column: columns::REVISION_ID,
                    expected: revision_id,
                    found: metadata.id,
                },
            });
        }
        Ok(self.revision(metadata))
    }

    /// The `counter`-th revision of the article in chronological order (1-based).
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn get_revision_by_counter(
        &self,
        article_id: i64,
        counter: i64,
    ) -> Result<Revision, RevisionError> {
        require_positive("article id", article_id)?;
        require_positive("revision counter", counter)?;
        let inner = &self.inner;
        let metadata = inner.retry.run(&inner.store, |store| {
            let location = inner.index.resolve_by_counter(store, article_id, counter)?;
            inner.load_metadata(store, location)
        })?;
        Ok(self.revision(metadata))
    }

    /// The revision of the article that was current at `timestamp`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn get_revision_at(
        &self,
        article_id: i64,
        timestamp: DateTime<Utc>,
    ) -> Result<Revision, RevisionError> {
        require_positive("article id", article_id)?;
        let inner = &self.inner;
        let metadata = inner.retry.run(&inner.store, |store| {
            let location = inner.index.resolve_by_timestamp(store, article_id, timestamp)?;
            inner.load_metadata(store, location)
        })?;
        Ok(self.revision(metadata))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn article_id_for(&self, revision_id: i64) -> Result<i64, RevisionError> {
        require_positive("revision id", revision_id)?;
        let inner = &self.inner;
        inner.retry.run(&inner.store, |store| {
            inner.index.article_id_for(store, revision_id)
        })
    }

    /// Loads a revision and reconstructs its text right away.
    pub fn revision_text(&self, revision_id: i64) -> Result<String, RevisionError> {
        self.get_revision(revision_id)?.into_text()
    }

    pub fn number_of_revisions(&self, article_id: i64) -> Result<i64, RevisionError> {
        Ok(self.article_entry(article_id)?.number_of_revisions())
    }

    pub fn first_appearance(&self, article_id: i64) -> Result<DateTime<Utc>, RevisionError> {
        Ok(self.article_entry(article_id)?.first_appearance)
    }

    pub fn last_appearance(&self, article_id: i64) -> Result<DateTime<Utc>, RevisionError> {
        Ok(self.article_entry(article_id)?.last_appearance)
    }

    /// Timestamps of all revisions of the article in chronological order.
    pub fn revision_timestamps(&self, article_id: i64) -> Result<Vec<DateTime<Utc>>, RevisionError> {
        self.timestamps(article_id, Vec::new())
    }

    /// Timestamps within `from..=to` in chronological order.
    pub fn revision_timestamps_between(
        &self,
        article_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, RevisionError> {
        self.timestamps(
            article_id,
            vec![
                Filter::new(columns::TIMESTAMP, Comparison::Ge, from.timestamp_millis()),
                Filter::new(columns::TIMESTAMP, Comparison::Le, to.timestamp_millis()),
            ],
        )
    }

    pub fn number_of_unique_contributors(
        &self,
        article_id: i64,
        only_registered: bool,
    ) -> Result<i64, RevisionError> {
        self.article_entry(article_id)?;
        let mut query = ScalarQuery::new(
            Table::Revisions,
            Aggregate::CountDistinct(columns::CONTRIBUTOR_NAME),
        )
        .filter(Filter::eq(columns::ARTICLE_ID, article_id));
        if only_registered {
            query = query.filter(Filter::eq(columns::CONTRIBUTOR_IS_REGISTERED, true));
        }

        let inner = &self.inner;
        inner.retry.run(&inner.store, |store| {
            Ok(store.execute_scalar(&query)?.unwrap_or(0))
        })
    }

    fn article_entry(&self, article_id: i64) -> Result<Arc<ArticleIndexEntry>, RevisionError> {
        require_positive("article id", article_id)?;
        let inner = &self.inner;
        inner.retry.run(&inner.store, |store| {
            inner.index.article_entry(store, article_id)
        })
    }

    fn timestamps(
        &self,
        article_id: i64,
        filters: Vec<Filter>,
    ) -> Result<Vec<DateTime<Utc>>, RevisionError> {
        self.article_entry(article_id)?;
        let mut query = Query::select(Table::Revisions, &[columns::TIMESTAMP])
            .filter(Filter::eq(columns::ARTICLE_ID, article_id))
            .order_by(columns::TIMESTAMP, Order::Ascending)
            .order_by(columns::REVISION_COUNTER, Order::Ascending);
        query.filters.extend(filters);

        let inner = &self.inner;
        let rows = inner
            .retry
            .run(&inner.store, |store| Ok(store.query_rows(&query)?))?;
        rows.iter()
            .map(|row| -> Result<DateTime<Utc>, RevisionError> {
                let millis = row.get_i64(columns::TIMESTAMP)?;
                millis_to_datetime(millis).map_err(|source| RevisionError::IndexCorrupt {
                    table: Table::Revisions.name(),
                    key: article_id,
                    source,
                })
            })
            .collect()
    }

    fn revision(&self, metadata: RevisionMetadata) -> Revision {
        Revision::new(metadata, self.inner.clone())
    }
}

impl<S: RowStore + RowSink + 'static> RevisionApi<S> {
    /// Articles whose number of revisions lies within `min..=max` (`max` unbounded when
    /// `None`), in ascending id order.
    ///
    /// Creates and fills the `NumberRevisions` column on first use.
    pub fn articles_with_revision_count(
        &self,
        min: i64,
        max: Option<i64>,
    ) -> Result<Vec<i64>, RevisionError> {
        let inner = &self.inner;
        inner.retry.run(&inner.store, |store| {
            maintenance::ensure_number_revisions(store)?;

            let mut query = Query::select(Table::IndexArticleId, &[columns::ARTICLE_ID])
                .filter(Filter::new(columns::NUMBER_REVISIONS, Comparison::Ge, min))
                .order_by(columns::ARTICLE_ID, Order::Ascending);
            if let Some(max) = max {
                query = query.filter(Filter::new(columns::NUMBER_REVISIONS, Comparison::Le, max));
            }
            store
                .query_rows(&query)?
                .iter()
                .map(|row| row.get_i64(columns::ARTICLE_ID).map_err(RevisionError::from))
                .collect()
        })
    }
}

impl<S: RowStore> Inner<S> {
    /// Reads the metadata of the last row of the chain at `location`.
    fn load_metadata(
        &self,
        store: &S,
        location: ChainLocation,
    ) -> Result<RevisionMetadata, RevisionError> {
        let primary_key = location.last_primary_key();
        let row = store
            .query_one(
                Query::select(Table::Revisions, METADATA_COLUMNS)
                    .filter(Filter::eq(columns::PRIMARY_KEY, primary_key)),
            )?
            .ok_or(RevisionError::IndexCorrupt {
                table: Table::Revisions.name(),
                key: primary_key,
                source: IndexFormatError::TruncatedChain {
                    expected: location.run_length,
                    found: 0,
                },
            })?;

        let article_id = row.get_i64(columns::ARTICLE_ID)?;
        let storage_counter = row.get_i64(columns::REVISION_COUNTER)?;
        let counter = self
            .index
            .chronological_mapping(store, article_id)?
            .to_chronological(storage_counter);
        let timestamp = millis_to_datetime(row.get_i64(columns::TIMESTAMP)?).map_err(|source| {
            RevisionError::IndexCorrupt {
                table: Table::Revisions.name(),
                key: primary_key,
                source,
            }
        })?;

        Ok(RevisionMetadata {
            id: row.get_i64(columns::REVISION_ID)?,
            article_id,
            counter,
            primary_key,
            full_revision_pk: location.full_revision_pk,
            timestamp,
            contributor: Contributor {
                name: row
                    .get_opt_str(columns::CONTRIBUTOR_NAME)?
                    .map(CompactString::from),
                id: row.get_opt_i64(columns::CONTRIBUTOR_ID)?,
                is_registered: row.get_bool(columns::CONTRIBUTOR_IS_REGISTERED)?,
            },
            comment: row.get_opt_str(columns::COMMENT)?.map(CompactString::from),
            minor: row.get_bool(columns::MINOR)?,
        })
    }

    fn replay(&self, store: &S, location: ChainLocation) -> Result<String, RevisionError> {
        let rows = store.query_rows(
            &Query::select(Table::Revisions, CHAIN_COLUMNS)
                .filter(Filter::new(
                    columns::PRIMARY_KEY,
                    Comparison::Ge,
                    location.full_revision_pk,
                ))
                .order_by(columns::PRIMARY_KEY, Order::Ascending)
                .limit(location.run_length as u64),
        )?;
        if rows.len() as i64 != location.run_length {
            return Err(RevisionError::IndexCorrupt {
                table: Table::Revisions.name(),
                key: location.full_revision_pk,
                source: IndexFormatError::TruncatedChain {
                    expected: location.run_length,
                    found: rows.len(),
                },
            });
        }

        let run_length = rows.len();
        let mut replayer = ChainReplayer::new();
        let mut full_rows = 0;
        let mut last_row = RowKind::Full;
        for (position, row) in rows.iter().enumerate() {
            let primary_key = row.get_i64(columns::PRIMARY_KEY)?;
            let column = row.get(columns::REVISION)?;
            last_row = self
                .decode_row(column)
                .and_then(|diff| {
                    let kind = RowKind::classify(&diff, position, run_length);
                    replayer.apply(&diff)?;
                    Ok(kind)
                })
                .map_err(|source| RevisionError::Decoding {
                    full_revision_pk: location.full_revision_pk,
                    primary_key,
                    source,
                })?;
            if last_row == RowKind::Full {
                full_rows += 1;
            }
        }

        tracing::debug!(
            message = "Replayed revision chain",
            full_revision_pk = location.full_revision_pk,
            rows = replayer.rows(),
            full_rows,
            last_row = ?last_row
        );
        Ok(replayer.into_text())
    }

    /// Decodes one stored row through the read path matching the configured column kind.
    fn decode_row(&self, column: &Value) -> Result<Diff, DecodingError> {
        let payload = match (column, self.binary_data) {
            (Value::Blob(bytes), true) => EncodedPayload::Binary(bytes),
            (Value::Text(text), false) => EncodedPayload::Text(text),
            (other, binary_data) => {
                return Err(DecodingError::UnexpectedColumnType {
                    expected: if binary_data { "binary" } else { "text" },
                    found: other.type_name(),
                })
            }
        };
        self.decoder.decode(payload)
    }
}

impl<S: RowStore> TextLoader for Inner<S> {
    fn load_text(&self, revision: &RevisionMetadata) -> Result<String, RevisionError> {
        self.retry
            .run(&self.store, |store| self.replay(store, revision.location()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::prelude::*;

    #[test]
    fn test_lookup_by_id() {
        let api = RevisionApi::new(populated_store());
        let revision = api.get_revision(102).unwrap();
        assert_eq!(revision.article_id, ARTICLE_ID);
        assert_eq!(revision.counter, 2);
        assert_eq!(revision.contributor.name.as_deref(), Some("Bob"));
        assert!(!revision.is_text_loaded());
        assert_eq!(revision.text().unwrap(), "ABCD");
        assert!(revision.is_text_loaded());
    }

    #[test]
    fn test_precondition_before_io() {
        let store = FlakyStore::new(populated_store(), usize::MAX);
        let api = RevisionApi::new(store);
        assert!(matches!(
            api.get_revision(-42),
            Err(RevisionError::InvalidArgument { value: -42, .. })
        ));
        assert!(matches!(
            api.get_revision_by_counter(ARTICLE_ID, 0),
            Err(RevisionError::InvalidArgument { value: 0, .. })
        ));
        assert_eq!(api.store().calls(), 0);
    }

    #[test]
    fn test_column_kind_mismatch_is_a_decoding_error() {
        let api = RevisionApi::from_parts(
            populated_store(),
            RevisionDecoder::new(Default::default()),
            false,
            RetryPolicy::default(),
        );
        let err = api.revision_text(101).unwrap_err();
        assert!(matches!(
            err,
            RevisionError::Decoding {
                source: DecodingError::UnexpectedColumnType {
                    expected: "text",
                    found: "binary"
                },
                ..
            }
        ));
    }

    #[test]
    fn test_article_summaries() {
        let api = RevisionApi::new(populated_store());
        assert_eq!(api.number_of_revisions(ARTICLE_ID).unwrap(), 3);
        assert_eq!(api.first_appearance(ARTICLE_ID).unwrap(), at(1_000));
        assert_eq!(api.last_appearance(ARTICLE_ID).unwrap(), at(3_000));
        assert_eq!(
            api.revision_timestamps(ARTICLE_ID).unwrap(),
            vec![at(1_000), at(2_000), at(3_000)]
        );
        assert_eq!(
            api.revision_timestamps_between(ARTICLE_ID, at(1_500), at(3_000))
                .unwrap(),
            vec![at(2_000), at(3_000)]
        );
        assert_eq!(
            api.number_of_unique_contributors(ARTICLE_ID, false).unwrap(),
            2
        );
        assert_eq!(
            api.number_of_unique_contributors(ARTICLE_ID, true).unwrap(),
            1
        );
        assert!(matches!(
            api.number_of_revisions(4711),
            Err(RevisionError::UnknownArticle(4711))
        ));
    }
}

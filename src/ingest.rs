//! Writes article histories as diff chains together with their index rows.

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::{
    codec::EncodingError,
    config::{Config, ConfigError},
    diff::Diff,
    diff_calculator::DiffCalculator,
    encoder::RevisionEncoder,
    index::{ArticleIndexEntry, ChronologicalMapping, IndexFormatError, Run},
    revision::Contributor,
    store::{
        columns, Aggregate, Comparison, Filter, InsertBatch, Order, Query, RowSink, RowStore,
        ScalarQuery, Table, Value,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("article {0} has no revisions")]
    EmptyHistory(i64),
    #[error("{name} must be positive, got {value}")]
    InvalidId { name: &'static str, value: i64 },
    #[error("article {0} is already indexed")]
    AlreadyIndexed(i64),
    #[error("revision {0} occurs more than once")]
    DuplicateRevision(i64),
    #[error("revision {0} is already stored")]
    RevisionExists(i64),
    #[error("failed to encode revision {revision_id}")]
    Encoding {
        revision_id: i64,
        #[source]
        source: EncodingError,
    },
    #[error(transparent)]
    Index(#[from] IndexFormatError),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// One revision of an article history, as given to the writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub contributor: Contributor,
    #[serde(default)]
    pub comment: Option<CompactString>,
    #[serde(default)]
    pub minor: bool,
    pub text: String,
}

/// Revisions of one article in storage order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleHistory {
    pub article_id: i64,
    #[serde(rename = "revision")]
    pub revisions: Vec<RevisionRecord>,
}

const REVISION_COLUMNS: &[&str] = &[
    columns::PRIMARY_KEY,
    columns::REVISION_COUNTER,
    columns::REVISION_ID,
    columns::ARTICLE_ID,
    columns::TIMESTAMP,
    columns::REVISION,
    columns::COMMENT,
    columns::MINOR,
    columns::CONTRIBUTOR_NAME,
    columns::CONTRIBUTOR_ID,
    columns::CONTRIBUTOR_IS_REGISTERED,
];
const REVISION_ID_COLUMNS: &[&str] = &[
    columns::REVISION_ID,
    columns::FULL_REVISION_PK,
    columns::REVISION_PK,
];
const ARTICLE_COLUMNS: &[&str] = &[
    columns::ARTICLE_ID,
    columns::FULL_REVISION_PKS,
    columns::REVISION_COUNTER,
    columns::FIRST_APPEARANCE,
    columns::LAST_APPEARANCE,
];
const MAPPING_COLUMNS: &[&str] = &[
    columns::ARTICLE_ID,
    columns::MAPPING,
    columns::REVERSE_MAPPING,
];

pub struct ChainWriter<'a, S: ?Sized> {
    store: &'a S,
    encoder: RevisionEncoder,
    binary_data: bool,
    full_revision_interval: usize,
    calculator: DiffCalculator,
}

impl<'a, S: RowStore + RowSink + ?Sized> ChainWriter<'a, S> {
    pub fn new(store: &'a S, config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_settings(
            store,
            config.encoder()?,
            config.encoding.binary_data,
            config.ingest.full_revision_interval,
        ))
    }

    pub fn with_settings(
        store: &'a S,
        encoder: RevisionEncoder,
        binary_data: bool,
        full_revision_interval: usize,
    ) -> Self {
        Self {
            store,
            encoder,
            binary_data,
            full_revision_interval: full_revision_interval.max(1),
            calculator: DiffCalculator::new(),
        }
    }

    /// Stores the history and returns its index entry.
    ///
    /// All rows are written in one batch, so a failed write leaves no partial history
    /// behind. Within the batch the article row comes last.
    pub fn write_article(
        &mut self,
        history: &ArticleHistory,
    ) -> Result<ArticleIndexEntry, IngestError> {
        let article_id = history.article_id;
        self.validate(history)?;

        let first_pk = self
            .store
            .execute_scalar(&ScalarQuery::new(
                Table::Revisions,
                Aggregate::Max(columns::PRIMARY_KEY),
            ))?
            .unwrap_or(0)
            + 1;

        let mut runs: Vec<Run> = Vec::new();
        let mut revision_rows = Vec::with_capacity(history.revisions.len());
        let mut id_rows = Vec::with_capacity(history.revisions.len());
        let mut previous: Option<&str> = None;

        for (position, record) in history.revisions.iter().enumerate() {
            let primary_key = first_pk + position as i64;
            let counter = position as i64 + 1;

            let diff = match previous {
                Some(previous) if position % self.full_revision_interval != 0 => {
                    self.calculator.diff(previous, &record.text)
                }
                _ => {
                    runs.push(Run {
                        full_revision_pk: primary_key,
                        first_counter: counter,
                        last_counter: counter,
                    });
                    Diff::full(record.text.clone())
                }
            };
            if let Some(run) = runs.last_mut() {
                run.last_counter = counter;
            }
            let full_revision_pk = runs.last().map_or(primary_key, |run| run.full_revision_pk);

            revision_rows.push(vec![
                Value::Integer(primary_key),
                Value::Integer(counter),
                Value::Integer(record.id),
                Value::Integer(article_id),
                Value::Integer(record.timestamp.timestamp_millis()),
                self.encode(record.id, &diff)?,
                Value::from(record.comment.as_ref().map(|c| c.to_string())),
                Value::from(record.minor),
                Value::from(record.contributor.name.as_ref().map(|n| n.to_string())),
                Value::from(record.contributor.id),
                Value::from(record.contributor.is_registered),
            ]);
            id_rows.push(vec![
                Value::Integer(record.id),
                Value::Integer(full_revision_pk),
                Value::Integer(primary_key),
            ]);
            previous = Some(&record.text);
        }

        let timestamps: Vec<DateTime<Utc>> =
            history.revisions.iter().map(|r| r.timestamp).collect();
        let (first_appearance, last_appearance) = timestamps
            .iter()
            .fold((timestamps[0], timestamps[0]), |(lo, hi), &t| {
                (lo.min(t), hi.max(t))
            });
        let entry = ArticleIndexEntry::new(article_id, runs, first_appearance, last_appearance)?;
        let mapping = ChronologicalMapping::from_storage_timestamps(&timestamps);

        let mut batches = vec![
            InsertBatch {
                table: Table::Revisions,
                columns: REVISION_COLUMNS,
                rows: revision_rows,
            },
            InsertBatch {
                table: Table::IndexRevisionId,
                columns: REVISION_ID_COLUMNS,
                rows: id_rows,
            },
        ];
        if !mapping.is_identity() {
            batches.push(InsertBatch {
                table: Table::IndexChronological,
                columns: MAPPING_COLUMNS,
                rows: vec![vec![
                    Value::Integer(article_id),
                    Value::Text(mapping.mapping_string()),
                    Value::Text(mapping.reverse_mapping_string()),
                ]],
            });
        }
        batches.push(InsertBatch {
            table: Table::IndexArticleId,
            columns: ARTICLE_COLUMNS,
            rows: vec![vec![
                Value::Integer(article_id),
                Value::Text(entry.full_revision_pks_string()),
                Value::Text(entry.revision_counters_string()),
                Value::Integer(first_appearance.timestamp_millis()),
                Value::Integer(last_appearance.timestamp_millis()),
            ]],
        });
        self.store.insert_batches(batches)?;

        tracing::debug!(
            message = "Stored article history",
            article_id,
            revisions = history.revisions.len(),
            runs = entry.runs().len(),
            reordered = !mapping.is_identity()
        );
        Ok(entry)
    }

    fn validate(&self, history: &ArticleHistory) -> Result<(), IngestError> {
        let article_id = history.article_id;
        if article_id <= 0 {
            return Err(IngestError::InvalidId {
                name: "article id",
                value: article_id,
            });
        }
        if history.revisions.is_empty() {
            return Err(IngestError::EmptyHistory(article_id));
        }

        let mut seen = FxHashSet::default();
        let (mut lowest, mut highest) = (i64::MAX, i64::MIN);
        for record in &history.revisions {
            if record.id <= 0 {
                return Err(IngestError::InvalidId {
                    name: "revision id",
                    value: record.id,
                });
            }
            if !seen.insert(record.id) {
                return Err(IngestError::DuplicateRevision(record.id));
            }
            lowest = lowest.min(record.id);
            highest = highest.max(record.id);
        }

        let stored = self.store.query_rows(
            &Query::select(Table::IndexRevisionId, &[columns::REVISION_ID])
                .filter(Filter::new(columns::REVISION_ID, Comparison::Ge, lowest))
                .filter(Filter::new(columns::REVISION_ID, Comparison::Le, highest))
                .order_by(columns::REVISION_ID, Order::Ascending),
        )?;
        for row in &stored {
            let revision_id = row.get_i64(columns::REVISION_ID)?;
            if seen.contains(&revision_id) {
                return Err(IngestError::RevisionExists(revision_id));
            }
        }

        let existing = self.store.query_one(
            Query::select(Table::IndexArticleId, &[columns::ARTICLE_ID])
                .filter(Filter::eq(columns::ARTICLE_ID, article_id)),
        )?;
        if existing.is_some() {
            return Err(IngestError::AlreadyIndexed(article_id));
        }
        Ok(())
    }

    fn encode(&self, revision_id: i64, diff: &Diff) -> Result<Value, IngestError> {
        let encoded = if self.binary_data {
            self.encoder.encode_binary(diff).map(Value::Blob)
        } else {
            self.encoder.encode_text(diff).map(Value::Text)
        };
        encoded.map_err(|source| IngestError::Encoding {
            revision_id,
            source,
        })
    }
}

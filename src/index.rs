//! Revision index: resolves revision ids, per-article counters and timestamps to the
//! location of a revision's diff chain.
//!
//! Three index tables are consulted:
//!
//! - `index_revisionID` maps a revision id to the primary key of its chain's full revision
//!   and to the primary key of the revision's own row.
//! - `index_articleID_rc_ts` lists, per article, the primary keys of all full revisions
//!   (`"pk pk ..."`) and the storage-order counter range each of them covers
//!   (`"start end start end ..."`), plus first and last appearance in milliseconds.
//! - `index_chronological` holds the permutation between the chronological counter seen
//!   by callers and the storage-order counter, for articles whose revisions were not
//!   stored in timestamp order. Only deviating entries are stored; absent entries and
//!   absent rows mean identity.
//!
//! Article entries and mappings are read-mostly and cached behind a [`RwLock`]. An entry is
//! fully built before it is inserted, so readers never see a partial one.

use std::{collections::hash_map::Entry, fmt::Write, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    error::{require_positive, RevisionError},
    store::{columns, Comparison, Filter, Order, Query, RowStore, Table},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexFormatError {
    #[error("malformed integer sequence `{0}`")]
    Malformed(String),
    #[error("sequence of pairs has an odd number of elements ({0})")]
    OddLength(usize),
    #[error("{pks} full revisions but {ranges} counter ranges")]
    LengthMismatch { pks: usize, ranges: usize },
    #[error("counter range {first}..={last} does not continue at {expected}")]
    NonContiguous { expected: i64, first: i64, last: i64 },
    #[error("chronological mapping is not a bijection at counter {0}")]
    NotABijection(i64),
    #[error("timestamp {0} ms is out of range")]
    InvalidTimestamp(i64),
    #[error("no run covers storage counter {0}")]
    MissingRun(i64),
    #[error("chain should have {expected} rows, found {found}")]
    TruncatedChain { expected: i64, found: usize },
    #[error("row has {column} {found}, index says {expected}")]
    Mismatch {
        column: &'static str,
        expected: i64,
        found: i64,
    },
}

/// Parses a space separated list of integers as stored in the index tables.
pub fn parse_integers(input: &str) -> Result<Vec<i64>, IndexFormatError> {
    input
        .split_ascii_whitespace()
        .map(|token| {
            token
                .parse::<i64>()
                .map_err(|_| IndexFormatError::Malformed(input.to_string()))
        })
        .collect()
}

pub fn format_integers(values: impl IntoIterator<Item = i64>) -> String {
    let mut out = String::new();
    for value in values {
        if !out.is_empty() {
            out.push(' ');
        }
        // writing to a String cannot fail
        let _ = write!(out, "{value}");
    }
    out
}

pub fn parse_pairs(input: &str) -> Result<Vec<(i64, i64)>, IndexFormatError> {
    let values = parse_integers(input)?;
    if values.len() % 2 != 0 {
        return Err(IndexFormatError::OddLength(values.len()));
    }
    Ok(values.chunks_exact(2).map(|pair| (pair[0], pair[1])).collect())
}

pub fn format_pairs(pairs: impl IntoIterator<Item = (i64, i64)>) -> String {
    format_integers(pairs.into_iter().flat_map(|(a, b)| [a, b]))
}

pub(crate) fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, IndexFormatError> {
    DateTime::from_timestamp_millis(millis).ok_or(IndexFormatError::InvalidTimestamp(millis))
}

/// Where a revision's chain lives: the full revision row and the number of rows up to and
/// including the revision's own row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainLocation {
    pub full_revision_pk: i64,
    pub run_length: i64,
}

impl ChainLocation {
    pub fn last_primary_key(&self) -> i64 {
        self.full_revision_pk + self.run_length - 1
    }
}

/// A full revision together with the storage-order counters its diff chain covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub full_revision_pk: i64,
    pub first_counter: i64,
    pub last_counter: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleIndexEntry {
    pub article_id: i64,
    runs: Vec<Run>,
    pub first_appearance: DateTime<Utc>,
    pub last_appearance: DateTime<Utc>,
}

impl ArticleIndexEntry {
    /// Runs must be non-empty, ordered and contiguous starting at counter 1.
    pub fn new(
        article_id: i64,
        runs: Vec<Run>,
        first_appearance: DateTime<Utc>,
        last_appearance: DateTime<Utc>,
    ) -> Result<Self, IndexFormatError> {
        let mut expected = 1;
        for run in &runs {
            if run.first_counter != expected || run.last_counter < run.first_counter {
                return Err(IndexFormatError::NonContiguous {
                    expected,
                    first: run.first_counter,
                    last: run.last_counter,
                });
            }
            expected = run.last_counter + 1;
        }
        if runs.is_empty() {
            return Err(IndexFormatError::LengthMismatch { pks: 0, ranges: 0 });
        }

        Ok(Self {
            article_id,
            runs,
            first_appearance,
            last_appearance,
        })
    }

    pub fn from_storage(
        article_id: i64,
        full_revision_pks: &str,
        revision_counters: &str,
        first_appearance: i64,
        last_appearance: i64,
    ) -> Result<Self, IndexFormatError> {
        let pks = parse_integers(full_revision_pks)?;
        let ranges = parse_pairs(revision_counters)?;
        if pks.len() != ranges.len() {
            return Err(IndexFormatError::LengthMismatch {
                pks: pks.len(),
                ranges: ranges.len(),
            });
        }
        let runs = pks
            .into_iter()
            .zip(ranges)
            .map(|(full_revision_pk, (first_counter, last_counter))| Run {
                full_revision_pk,
                first_counter,
                last_counter,
            })
            .collect();

        Self::new(
            article_id,
            runs,
            millis_to_datetime(first_appearance)?,
            millis_to_datetime(last_appearance)?,
        )
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    pub fn number_of_revisions(&self) -> i64 {
        self.runs.last().map_or(0, |run| run.last_counter)
    }

    /// Finds the chain containing the revision with the given storage-order counter.
    pub fn locate(&self, storage_counter: i64) -> Option<ChainLocation> {
        let position = self
            .runs
            .partition_point(|run| run.last_counter < storage_counter);
        let run = self.runs.get(position)?;
        (run.first_counter <= storage_counter).then(|| ChainLocation {
            full_revision_pk: run.full_revision_pk,
            run_length: storage_counter - run.first_counter + 1,
        })
    }

    /// Primary keys spanned by all chains of the article.
    pub fn primary_key_range(&self) -> (i64, i64) {
        let first = self.runs.first().map_or(0, |run| run.full_revision_pk);
        let last = self.runs.last().map_or(0, |run| {
            run.full_revision_pk + run.last_counter - run.first_counter
        });
        (first, last)
    }

    pub fn full_revision_pks_string(&self) -> String {
        format_integers(self.runs.iter().map(|run| run.full_revision_pk))
    }

    pub fn revision_counters_string(&self) -> String {
        format_pairs(
            self.runs
                .iter()
                .map(|run| (run.first_counter, run.last_counter)),
        )
    }
}

/// Permutation between chronological counters (as callers see them) and storage-order
/// counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChronologicalMapping {
    forward: FxHashMap<i64, i64>,
    reverse: FxHashMap<i64, i64>,
}

impl ChronologicalMapping {
    pub fn identity() -> Self {
        Self::default()
    }

    /// Derives the mapping from the revision timestamps in storage order. Revisions with
    /// equal timestamps keep their storage order.
    pub fn from_storage_timestamps(timestamps: &[DateTime<Utc>]) -> Self {
        let mut order: Vec<usize> = (0..timestamps.len()).collect();
        order.sort_by_key(|&index| timestamps[index]);

        let mut mapping = Self::identity();
        for (chronological, storage) in order.into_iter().enumerate() {
            let (chronological, storage) = (chronological as i64 + 1, storage as i64 + 1);
            if chronological != storage {
                mapping.forward.insert(chronological, storage);
                mapping.reverse.insert(storage, chronological);
            }
        }
        mapping
    }

    pub fn from_storage(mapping: &str, reverse_mapping: &str) -> Result<Self, IndexFormatError> {
        let forward: FxHashMap<i64, i64> = parse_pairs(mapping)?.into_iter().collect();
        let reverse: FxHashMap<i64, i64> = parse_pairs(reverse_mapping)?.into_iter().collect();

        // a sparse permutation: keys and values cover the same counters, and both
        // directions agree
        let keys: FxHashSet<i64> = forward.keys().copied().collect();
        let values: FxHashSet<i64> = forward.values().copied().collect();
        if keys != values || values.len() != forward.len() || reverse.len() != forward.len() {
            let counter = keys.symmetric_difference(&values).next().copied();
            return Err(IndexFormatError::NotABijection(counter.unwrap_or(0)));
        }
        for (&chronological, &storage) in &forward {
            if chronological < 1 || reverse.get(&storage) != Some(&chronological) {
                return Err(IndexFormatError::NotABijection(chronological));
            }
        }

        Ok(Self { forward, reverse })
    }

    pub fn is_identity(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn to_storage(&self, chronological: i64) -> i64 {
        self.forward.get(&chronological).copied().unwrap_or(chronological)
    }

    pub fn to_chronological(&self, storage: i64) -> i64 {
        self.reverse.get(&storage).copied().unwrap_or(storage)
    }

    pub fn mapping_string(&self) -> String {
        Self::sorted_pairs(&self.forward)
    }

    pub fn reverse_mapping_string(&self) -> String {
        Self::sorted_pairs(&self.reverse)
    }

    fn sorted_pairs(map: &FxHashMap<i64, i64>) -> String {
        let mut pairs: Vec<(i64, i64)> = map.iter().map(|(&a, &b)| (a, b)).collect();
        pairs.sort_unstable();
        format_pairs(pairs)
    }
}

const ARTICLE_COLUMNS: &[&str] = &[
    columns::FULL_REVISION_PKS,
    columns::REVISION_COUNTER,
    columns::FIRST_APPEARANCE,
    columns::LAST_APPEARANCE,
];
const MAPPING_COLUMNS: &[&str] = &[columns::MAPPING, columns::REVERSE_MAPPING];
const REVISION_ID_COLUMNS: &[&str] = &[columns::FULL_REVISION_PK, columns::REVISION_PK];

/// Cached view of the index tables.
#[derive(Debug, Default)]
pub struct RevisionIndex {
    articles: RwLock<FxHashMap<i64, Arc<ArticleIndexEntry>>>,
    mappings: RwLock<FxHashMap<i64, Arc<ChronologicalMapping>>>,
}

impl RevisionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear_cache(&self) {
        self.articles.write().clear();
        self.mappings.write().clear();
    }

    pub fn resolve_by_id<S: RowStore + ?Sized>(
        &self,
        store: &S,
        revision_id: i64,
    ) -> Result<ChainLocation, RevisionError> {
        require_positive("revision id", revision_id)?;
        let row = store
            .query_one(
                Query::select(Table::IndexRevisionId, REVISION_ID_COLUMNS)
                    .filter(Filter::eq(columns::REVISION_ID, revision_id)),
            )?
            .ok_or(RevisionError::UnknownRevision(revision_id))?;

        let full_revision_pk = row.get_i64(columns::FULL_REVISION_PK)?;
        let revision_pk = row.get_i64(columns::REVISION_PK)?;
        if revision_pk < full_revision_pk {
            return Err(RevisionError::IndexCorrupt {
                table: Table::IndexRevisionId.name(),
                key: revision_id,
                source: IndexFormatError::Mismatch {
                    column: columns::REVISION_PK,
                    expected: full_revision_pk,
                    found: revision_pk,
                },
            });
        }

        Ok(ChainLocation {
            full_revision_pk,
            run_length: revision_pk - full_revision_pk + 1,
        })
    }

    /// Resolves the `counter`-th revision of an article in chronological order (1-based).
    pub fn resolve_by_counter<S: RowStore + ?Sized>(
        &self,
        store: &S,
        article_id: i64,
        counter: i64,
    ) -> Result<ChainLocation, RevisionError> {
        require_positive("article id", article_id)?;
        require_positive("revision counter", counter)?;

        let entry = self.article_entry(store, article_id)?;
        let max = entry.number_of_revisions();
        if counter > max {
            return Err(RevisionError::CounterOutOfRange {
                article_id,
                counter,
                max,
            });
        }

        let storage_counter = self
            .chronological_mapping(store, article_id)?
            .to_storage(counter);
        entry
            .locate(storage_counter)
            .ok_or_else(|| RevisionError::IndexCorrupt {
                table: Table::IndexArticleId.name(),
                key: article_id,
                source: IndexFormatError::MissingRun(storage_counter),
            })
    }

    /// Chronological counter of the revision that was current at `timestamp`.
    pub fn counter_at<S: RowStore + ?Sized>(
        &self,
        store: &S,
        article_id: i64,
        timestamp: DateTime<Utc>,
    ) -> Result<i64, RevisionError> {
        require_positive("article id", article_id)?;
        let entry = self.article_entry(store, article_id)?;
        let before = || RevisionError::BeforeFirstAppearance {
            article_id,
            timestamp,
        };
        if timestamp < entry.first_appearance {
            return Err(before());
        }

        let (first_pk, last_pk) = entry.primary_key_range();
        let row = store
            .query_one(
                Query::select(Table::Revisions, &[columns::REVISION_COUNTER])
                    .filter(Filter::eq(columns::ARTICLE_ID, article_id))
                    .filter(Filter::new(columns::PRIMARY_KEY, Comparison::Ge, first_pk))
                    .filter(Filter::new(columns::PRIMARY_KEY, Comparison::Le, last_pk))
                    .filter(Filter::new(
                        columns::TIMESTAMP,
                        Comparison::Le,
                        timestamp.timestamp_millis(),
                    ))
                    .order_by(columns::TIMESTAMP, Order::Descending)
                    .order_by(columns::REVISION_COUNTER, Order::Descending),
            )?
            .ok_or_else(before)?;

        let storage_counter = row.get_i64(columns::REVISION_COUNTER)?;
        Ok(self
            .chronological_mapping(store, article_id)?
            .to_chronological(storage_counter))
    }

    pub fn resolve_by_timestamp<S: RowStore + ?Sized>(
        &self,
        store: &S,
        article_id: i64,
        timestamp: DateTime<Utc>,
    ) -> Result<ChainLocation, RevisionError> {
        let counter = self.counter_at(store, article_id, timestamp)?;
        self.resolve_by_counter(store, article_id, counter)
    }

    pub fn article_id_for<S: RowStore + ?Sized>(
        &self,
        store: &S,
        revision_id: i64,
    ) -> Result<i64, RevisionError> {
        require_positive("revision id", revision_id)?;
        let row = store
            .query_one(
                Query::select(Table::Revisions, &[columns::ARTICLE_ID])
                    .filter(Filter::eq(columns::REVISION_ID, revision_id)),
            )?
            .ok_or(RevisionError::UnknownRevision(revision_id))?;
        Ok(row.get_i64(columns::ARTICLE_ID)?)
    }

    pub fn article_entry<S: RowStore + ?Sized>(
        &self,
        store: &S,
        article_id: i64,
    ) -> Result<Arc<ArticleIndexEntry>, RevisionError> {
        if let Some(entry) = self.articles.read().get(&article_id) {
            return Ok(entry.clone());
        }

        let row = store
            .query_one(
                Query::select(Table::IndexArticleId, ARTICLE_COLUMNS)
                    .filter(Filter::eq(columns::ARTICLE_ID, article_id)),
            )?
            .ok_or(RevisionError::UnknownArticle(article_id))?;
        let entry = ArticleIndexEntry::from_storage(
            article_id,
            row.get_str(columns::FULL_REVISION_PKS)?,
            row.get_str(columns::REVISION_COUNTER)?,
            row.get_i64(columns::FIRST_APPEARANCE)?,
            row.get_i64(columns::LAST_APPEARANCE)?,
        )
        .map_err(|source| RevisionError::IndexCorrupt {
            table: Table::IndexArticleId.name(),
            key: article_id,
            source,
        })?;

        Ok(Self::cache_insert(&self.articles, article_id, entry))
    }

    pub fn chronological_mapping<S: RowStore + ?Sized>(
        &self,
        store: &S,
        article_id: i64,
    ) -> Result<Arc<ChronologicalMapping>, RevisionError> {
        if let Some(mapping) = self.mappings.read().get(&article_id) {
            return Ok(mapping.clone());
        }

        let mapping = match store.query_one(
            Query::select(Table::IndexChronological, MAPPING_COLUMNS)
                .filter(Filter::eq(columns::ARTICLE_ID, article_id)),
        )? {
            Some(row) => ChronologicalMapping::from_storage(
                row.get_str(columns::MAPPING)?,
                row.get_str(columns::REVERSE_MAPPING)?,
            )
            .map_err(|source| RevisionError::IndexCorrupt {
                table: Table::IndexChronological.name(),
                key: article_id,
                source,
            })?,
            None => ChronologicalMapping::identity(),
        };

        Ok(Self::cache_insert(&self.mappings, article_id, mapping))
    }

    fn cache_insert<T>(cache: &RwLock<FxHashMap<i64, Arc<T>>>, key: i64, value: T) -> Arc<T> {
        // another reader may have loaded the same entry meanwhile; the first one wins
        match cache.write().entry(key) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => entry.insert(Arc::new(value)).clone(),
        }
    }
}

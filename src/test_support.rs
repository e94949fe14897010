use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use compact_str::CompactString;

use crate::{
    codec::Charset,
    encoder::RevisionEncoder,
    index::ArticleIndexEntry,
    ingest::{ArticleHistory, ChainWriter, RevisionRecord},
    revision::Contributor,
    sqlite::SqliteStore,
    store::{columns, Filter, Query, Row, RowSink, RowStore, ScalarQuery, StoreError, Table},
};

pub mod prelude {
    pub(crate) use super::proptest as proptest_support;
    pub(crate) use super::{
        at, history, populated_store, revision_id_query, write_history, FlakyStore, ARTICLE_ID,
    };
    pub(crate) use proptest::prelude::*;
}

/// Article of [`populated_store`]: revisions 101 `"ABC"`, 102 `"ABCD"`, 103 `"BCD"`.
pub const ARTICLE_ID: i64 = 1;

pub fn at(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap()
}

/// History with revision ids `article_id * 100 + n` and timestamps `n * 1000` ms for the
/// n-th text. Alice (registered) and Bob (anonymous) take turns, starting with Alice.
pub fn history(article_id: i64, texts: &[&str]) -> ArticleHistory {
    let revisions = texts
        .iter()
        .enumerate()
        .map(|(i, text)| {
            let n = i as i64 + 1;
            let alice = i % 2 == 0;
            RevisionRecord {
                id: article_id * 100 + n,
                timestamp: at(n * 1000),
                contributor: Contributor {
                    name: Some(CompactString::from(if alice { "Alice" } else { "Bob" })),
                    id: alice.then_some(7),
                    is_registered: alice,
                },
                comment: (!alice).then(|| "fix".into()),
                minor: !alice,
                text: text.to_string(),
            }
        })
        .collect();
    ArticleHistory {
        article_id,
        revisions,
    }
}

pub fn write_history<S>(store: &S, article_id: i64, texts: &[&str]) -> ArticleIndexEntry
where
    S: RowStore + RowSink + ?Sized,
{
    ChainWriter::with_settings(store, RevisionEncoder::new(Charset::Utf8), true, 1000)
        .write_article(&history(article_id, texts))
        .unwrap()
}

pub fn populated_store() -> SqliteStore {
    let store = SqliteStore::open_in_memory().unwrap();
    write_history(&store, ARTICLE_ID, &["ABC", "ABCD", "BCD"]);
    store
}

pub fn revision_id_query(revision_id: i64) -> Query {
    Query::select(
        Table::IndexRevisionId,
        &[columns::FULL_REVISION_PK, columns::REVISION_PK],
    )
    .filter(Filter::eq(columns::REVISION_ID, revision_id))
}

/// Fails the first `failures` store calls with a connection error.
pub struct FlakyStore<S> {
    inner: S,
    failures: AtomicUsize,
    calls: AtomicUsize,
    reconnects: AtomicUsize,
}

impl<S: RowStore> FlakyStore<S> {
    pub fn new(inner: S, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    fn call(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            Err(StoreError::Connection("connection reset by peer".into()))
        } else {
            Ok(())
        }
    }
}

impl<S: RowStore> RowStore for FlakyStore<S> {
    fn query_rows(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        self.call()?;
        self.inner.query_rows(query)
    }

    fn execute_scalar(&self, query: &ScalarQuery) -> Result<Option<i64>, StoreError> {
        self.call()?;
        self.inner.execute_scalar(query)
    }

    fn table_exists(&self, name: &str) -> Result<bool, StoreError> {
        self.call()?;
        self.inner.table_exists(name)
    }

    fn index_exists(&self, table: &str, index_name: Option<&str>) -> Result<bool, StoreError> {
        self.call()?;
        self.inner.index_exists(table, index_name)
    }

    fn column_exists(&self, table: Table, column: &str) -> Result<bool, StoreError> {
        self.call()?;
        self.inner.column_exists(table, column)
    }

    fn reconnect(&self) -> Result<(), StoreError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.inner.reconnect()
    }
}

pub mod proptest {
    use proptest::prelude::*;

    use crate::diff::{Diff, DiffPart};

    /// An edit with positions that are reduced modulo the text length when applied, so
    /// every generated edit is valid for any text.
    #[derive(Debug, Clone)]
    pub enum Edit {
        Insert { at: usize, text: String },
        Delete { at: usize, length: usize },
        Replace { at: usize, length: usize, text: String },
        Move { at: usize, length: usize, to: usize },
    }

    pub fn edit_strategy() -> impl Strategy<Value = Edit> {
        let text = "\\PC{0,8}";
        prop_oneof![
            3 => (any::<usize>(), text).prop_map(|(at, text)| Edit::Insert { at, text }),
            2 => (any::<usize>(), 0usize..10).prop_map(|(at, length)| Edit::Delete { at, length }),
            2 => (any::<usize>(), 0usize..10, text)
                .prop_map(|(at, length, text)| Edit::Replace { at, length, text }),
            1 => (any::<usize>(), 0usize..10, any::<usize>())
                .prop_map(|(at, length, to)| Edit::Move { at, length, to }),
        ]
    }

    /// Turns `base` and `edits` into a chain: a full revision followed by one diff per edit.
    pub fn chain_from_edits(base: &str, edits: &[Edit]) -> Vec<Diff> {
        let mut chain = vec![Diff::full(base)];
        let mut len = base.chars().count();

        for edit in edits {
            let mut diff = Diff::new();
            match edit {
                Edit::Insert { at, text } => {
                    diff.push(DiffPart::Insert {
                        start: at % (len + 1),
                        text: text.clone(),
                    });
                    len += text.chars().count();
                }
                Edit::Delete { at, length } => {
                    let start = at % (len + 1);
                    let length = (*length).min(len - start);
                    diff.push(DiffPart::Delete { start, length });
                    len -= length;
                }
                Edit::Replace { at, length, text } => {
                    let start = at % (len + 1);
                    let length = (*length).min(len - start);
                    diff.push(DiffPart::Replace {
                        start,
                        length,
                        text: text.clone(),
                    });
                    len = len - length + text.chars().count();
                }
                Edit::Move { at, length, to } => {
                    let start = at % (len + 1);
                    let length = (*length).min(len - start);
                    diff.push(DiffPart::Cut {
                        start,
                        length,
                        block: 0,
                    });
                    diff.push(DiffPart::Paste {
                        start: to % (len - length + 1),
                        block: 0,
                    });
                }
            }
            chain.push(diff);
        }
        chain
    }
}

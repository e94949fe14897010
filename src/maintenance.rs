//! Index maintenance that needs write access.

use crate::{
    error::RevisionError,
    index::{parse_pairs, IndexFormatError},
    store::{columns, ColumnType, Filter, Query, RowSink, RowStore, Table, Value},
};

const PENDING_COLUMNS: &[&str] = &[columns::ARTICLE_ID, columns::REVISION_COUNTER];

/// Makes sure `index_articleID_rc_ts` has a filled `NumberRevisions` column.
///
/// Adds the column when it is missing and fills every row where it is still NULL.
/// Returns the number of rows filled; running it again returns 0.
pub fn ensure_number_revisions<S>(store: &S) -> Result<usize, RevisionError>
where
    S: RowStore + RowSink + ?Sized,
{
    let table = Table::IndexArticleId;
    if !store.column_exists(table, columns::NUMBER_REVISIONS)? {
        tracing::info!(
            message = "Adding revision count column",
            table = table.name(),
            column = columns::NUMBER_REVISIONS
        );
        if let Err(err) = store.add_column(table, columns::NUMBER_REVISIONS, ColumnType::Integer) {
            // a concurrent writer may have added it in the meantime
            if !store.column_exists(table, columns::NUMBER_REVISIONS)? {
                return Err(err.into());
            }
        }
    }

    let pending = store.query_rows(
        &Query::select(table, PENDING_COLUMNS).filter(Filter::is_null(columns::NUMBER_REVISIONS)),
    )?;
    let mut filled = 0;
    for row in &pending {
        let article_id = row.get_i64(columns::ARTICLE_ID)?;
        let ranges = parse_pairs(row.get_str(columns::REVISION_COUNTER)?).map_err(|source| {
            RevisionError::IndexCorrupt {
                table: table.name(),
                key: article_id,
                source,
            }
        })?;
        let count = ranges
            .last()
            .map(|&(_, last)| last)
            .ok_or(RevisionError::IndexCorrupt {
                table: table.name(),
                key: article_id,
                source: IndexFormatError::LengthMismatch { pks: 0, ranges: 0 },
            })?;

        filled += store.update_rows(
            table,
            &[(columns::NUMBER_REVISIONS, Value::Integer(count))],
            &[
                Filter::eq(columns::ARTICLE_ID, article_id),
                Filter::is_null(columns::NUMBER_REVISIONS),
            ],
        )?;
    }

    if filled > 0 {
        tracing::debug!(message = "Filled revision counts", rows = filled);
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::prelude::*;

    #[test]
    fn test_column_is_created_once_and_filled() {
        let store = populated_store();
        assert!(!store
            .column_exists(Table::IndexArticleId, columns::NUMBER_REVISIONS)
            .unwrap());

        assert_eq!(ensure_number_revisions(&store).unwrap(), 1);
        assert!(store
            .column_exists(Table::IndexArticleId, columns::NUMBER_REVISIONS)
            .unwrap());
        assert_eq!(ensure_number_revisions(&store).unwrap(), 0);

        let row = store
            .query_one(
                Query::select(Table::IndexArticleId, &[columns::NUMBER_REVISIONS])
                    .filter(Filter::eq(columns::ARTICLE_ID, ARTICLE_ID)),
            )
            .unwrap()
            .unwrap();
        assert_eq!(row.get_i64(columns::NUMBER_REVISIONS).unwrap(), 3);
    }

    #[test]
    fn test_new_articles_are_filled_later() {
        let store = populated_store();
        ensure_number_revisions(&store).unwrap();

        write_history(&store, 8, &["one", "two"]);
        assert_eq!(ensure_number_revisions(&store).unwrap(), 1);
    }
}

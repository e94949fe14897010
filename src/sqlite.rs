//! SQLite-backed implementation of [`RowStore`] and [`RowSink`].

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use parking_lot::Mutex;
use rusqlite::{
    params, params_from_iter,
    types::{ToSqlOutput, ValueRef},
    Connection, ErrorCode, ToSql,
};

use crate::store::{
    Aggregate, ColumnType, Comparison, Filter, InsertBatch, Order, Query, Row, RowSink, RowStore,
    ScalarQuery, StoreError, Table, Value,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteStore {
    // `None` for in-memory databases, which cannot be re-opened
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens or creates a database at `path`.
    ///
    /// Creates missing tables, enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = Self::connect(&path)?;
        Ok(Self {
            path: Some(path),
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(classify)?;
        conn.execute_batch(include_str!("schema.sql"))
            .map_err(classify)?;
        Ok(Self {
            path: None,
            conn: Mutex::new(conn),
        })
    }

    fn connect(path: &Path) -> Result<Connection, StoreError> {
        let conn = Connection::open(path).map_err(classify)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(classify)?;
        conn.execute_batch(include_str!("schema.sql"))
            .map_err(classify)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(classify)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(classify)?;
        Ok(conn)
    }
}

impl RowStore for SqliteStore {
    fn query_rows(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        let mut sql = format!(
            "SELECT {} FROM \"{}\"",
            quoted_list(query.columns),
            query.table.name()
        );
        let mut values = Vec::new();
        push_where(&mut sql, &mut values, &query.filters);

        for (i, (column, order)) in query.order_by.iter().enumerate() {
            sql.push_str(if i == 0 { " ORDER BY " } else { ", " });
            let direction = match order {
                Order::Ascending => "ASC",
                Order::Descending => "DESC",
            };
            sql.push_str(&format!("\"{column}\" {direction}"));
        }
        if query.limit.is_some() || query.offset.is_some() {
            // sqlite only accepts OFFSET after a LIMIT, -1 means unbounded
            sql.push_str(" LIMIT ? OFFSET ?");
            values.push(Value::Integer(query.limit.map_or(-1, |l| l as i64)));
            values.push(Value::Integer(query.offset.unwrap_or(0) as i64));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql).map_err(classify)?;
        let mut rows = stmt.query(params_from_iter(values.iter())).map_err(classify)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(classify)? {
            let values = query
                .columns
                .iter()
                .enumerate()
                .map(|(i, &column)| value_from_ref(column, row.get_ref(i).map_err(classify)?))
                .collect::<Result<Vec<_>, _>>()?;
            out.push(Row::new(query.columns, values));
        }
        Ok(out)
    }

    fn execute_scalar(&self, query: &ScalarQuery) -> Result<Option<i64>, StoreError> {
        let aggregate = match query.aggregate {
            Aggregate::Count => "COUNT(*)".to_string(),
            Aggregate::CountDistinct(column) => format!("COUNT(DISTINCT \"{column}\")"),
            Aggregate::Min(column) => format!("MIN(\"{column}\")"),
            Aggregate::Max(column) => format!("MAX(\"{column}\")"),
        };
        let mut sql = format!("SELECT {aggregate} FROM \"{}\"", query.table.name());
        let mut values = Vec::new();
        push_where(&mut sql, &mut values, &query.filters);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&sql).map_err(classify)?;
        stmt.query_row(params_from_iter(values.iter()), |row| row.get(0))
            .map_err(classify)
    }

    fn table_exists(&self, name: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |row| row.get(0),
            )
            .map_err(classify)?;
        Ok(count > 0)
    }

    fn index_exists(&self, table: &str, index_name: Option<&str>) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = match index_name {
            Some(index_name) => conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1 AND name = ?2",
                params![table, index_name],
                |row| row.get(0),
            ),
            None => conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1",
                params![table],
                |row| row.get(0),
            ),
        }
        .map_err(classify)?;
        Ok(count > 0)
    }

    fn column_exists(&self, table: Table, column: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
                params![table.name(), column],
                |row| row.get(0),
            )
            .map_err(classify)?;
        Ok(count > 0)
    }

    fn reconnect(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            tracing::debug!("in-memory database cannot be re-opened, keeping connection");
            return Ok(());
        };

        tracing::info!(message = "Re-opening database", path = %path.display());
        let conn = Self::connect(path)?;
        // the old connection is closed when dropped here
        *self.conn.lock() = conn;
        Ok(())
    }
}

impl RowSink for SqliteStore {
    fn insert_batches(&self, batches: Vec<InsertBatch<'_>>) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(classify)?;
        let mut written = 0;
        for batch in batches.iter().filter(|batch| !batch.rows.is_empty()) {
            let placeholders = vec!["?"; batch.columns.len()].join(", ");
            let sql = format!(
                "INSERT INTO \"{}\" ({}) VALUES ({placeholders})",
                batch.table.name(),
                quoted_list(batch.columns)
            );
            let mut stmt = tx.prepare_cached(&sql).map_err(classify)?;
            for row in &batch.rows {
                stmt.execute(params_from_iter(row.iter()))
                    .map_err(classify)?;
            }
            written += batch.rows.len();
        }
        // dropping an uncommitted transaction rolls it back
        tx.commit().map_err(classify)?;
        Ok(written)
    }

    fn update_rows(
        &self,
        table: Table,
        assignments: &[(&'static str, Value)],
        filters: &[Filter],
    ) -> Result<usize, StoreError> {
        let set = assignments
            .iter()
            .map(|(column, _)| format!("\"{column}\" = ?"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!("UPDATE \"{}\" SET {set}", table.name());
        let mut values: Vec<Value> = assignments.iter().map(|(_, v)| v.clone()).collect();
        push_where(&mut sql, &mut values, filters);

        let conn = self.conn.lock();
        conn.execute(&sql, params_from_iter(values.iter()))
            .map_err(classify)
    }

    fn add_column(
        &self,
        table: Table,
        column: &'static str,
        kind: ColumnType,
    ) -> Result<(), StoreError> {
        let kind = match kind {
            ColumnType::Integer => "INTEGER",
            ColumnType::Text => "TEXT",
        };
        let conn = self.conn.lock();
        conn.execute_batch(&format!(
            "ALTER TABLE \"{}\" ADD COLUMN \"{column}\" {kind}",
            table.name()
        ))
        .map_err(classify)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self {
            Value::Null => ValueRef::Null,
            Value::Integer(value) => ValueRef::Integer(*value),
            Value::Text(value) => ValueRef::Text(value.as_bytes()),
            Value::Blob(value) => ValueRef::Blob(value),
        }))
    }
}

/// Converts a column value without loss; `REAL` values and text that is not UTF-8 have no
/// [`Value`] counterpart and are reported as type mismatches.
fn value_from_ref(column: &'static str, value: ValueRef<'_>) -> Result<Value, StoreError> {
    let mismatch = |expected, found| StoreError::ColumnType {
        column,
        expected,
        found,
    };
    Ok(match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(value) => Value::Integer(value),
        ValueRef::Real(_) => return Err(mismatch("integer", "real")),
        ValueRef::Text(bytes) => Value::Text(
            std::str::from_utf8(bytes)
                .map_err(|_| mismatch("text", "non UTF-8 text"))?
                .to_owned(),
        ),
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    })
}

fn quoted_list(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|column| format!("\"{column}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

fn push_where(sql: &mut String, values: &mut Vec<Value>, filters: &[Filter]) {
    for (i, filter) in filters.iter().enumerate() {
        sql.push_str(if i == 0 { " WHERE " } else { " AND " });
        if filter.comparison == Comparison::IsNull {
            sql.push_str(&format!("\"{}\" IS NULL", filter.column));
        } else {
            sql.push_str(&format!(
                "\"{}\" {} ?",
                filter.column,
                filter.comparison.operator()
            ));
            values.push(filter.value.clone());
        }
    }
}

/// Busy, locked and I/O failures are transient; everything else is fatal.
fn classify(err: rusqlite::Error) -> StoreError {
    let transient = matches!(
        &err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
            )
    );
    if transient {
        StoreError::Connection(Box::new(err))
    } else {
        StoreError::Backend(Box::new(err))
    }
}

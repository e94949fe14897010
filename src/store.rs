//! Row store consumed by the revision index and access façade.
//!
//! The store is addressed with typed [`Query`] values instead of SQL strings so that
//! every lookup is parameterized. Column names are the ones of the deployed schema.

pub mod columns {
    pub const REVISION: &str = "Revision";
    pub const PRIMARY_KEY: &str = "PrimaryKey";
    pub const REVISION_COUNTER: &str = "RevisionCounter";
    pub const REVISION_ID: &str = "RevisionID";
    pub const ARTICLE_ID: &str = "ArticleID";
    pub const TIMESTAMP: &str = "Timestamp";
    pub const COMMENT: &str = "Comment";
    pub const MINOR: &str = "Minor";
    pub const CONTRIBUTOR_NAME: &str = "ContributorName";
    pub const CONTRIBUTOR_ID: &str = "ContributorId";
    pub const CONTRIBUTOR_IS_REGISTERED: &str = "ContributorIsRegistered";

    pub const FULL_REVISION_PK: &str = "FullRevisionPK";
    pub const REVISION_PK: &str = "RevisionPK";

    pub const FULL_REVISION_PKS: &str = "FullRevisionPKs";
    pub const FIRST_APPEARANCE: &str = "FirstAppearance";
    pub const LAST_APPEARANCE: &str = "LastAppearance";
    pub const NUMBER_REVISIONS: &str = "NumberRevisions";

    pub const MAPPING: &str = "Mapping";
    pub const REVERSE_MAPPING: &str = "ReverseMapping";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Revisions,
    IndexRevisionId,
    IndexArticleId,
    IndexChronological,
}

impl Table {
    pub const fn name(self) -> &'static str {
        match self {
            Table::Revisions => "revisions",
            Table::IndexRevisionId => "index_revisionID",
            Table::IndexArticleId => "index_articleID_rc_ts",
            Table::IndexChronological => "index_chronological",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Text(_) => "text",
            Value::Blob(_) => "binary",
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Blob(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    IsNull,
}

impl Comparison {
    pub fn operator(self) -> &'static str {
        match self {
            Comparison::Eq => "=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::IsNull => "IS NULL",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: &'static str,
    pub comparison: Comparison,
    pub value: Value,
}

impl Filter {
    pub fn eq(column: &'static str, value: impl Into<Value>) -> Self {
        Self::new(column, Comparison::Eq, value)
    }

    pub fn new(column: &'static str, comparison: Comparison, value: impl Into<Value>) -> Self {
        Self {
            column,
            comparison,
            value: value.into(),
        }
    }

    pub fn is_null(column: &'static str) -> Self {
        Self::new(column, Comparison::IsNull, Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

#[derive(Debug, Clone)]
pub struct Query {
    pub table: Table,
    pub columns: &'static [&'static str],
    pub filters: Vec<Filter>,
    pub order_by: Vec<(&'static str, Order)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Query {
    pub fn select(table: Table, columns: &'static [&'static str]) -> Self {
        Self {
            table,
            columns,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, column: &'static str, order: Order) -> Self {
        self.order_by.push((column, order));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    CountDistinct(&'static str),
    Min(&'static str),
    Max(&'static str),
}

/// A single-value aggregate over the filtered rows of a table.
#[derive(Debug, Clone)]
pub struct ScalarQuery {
    pub table: Table,
    pub aggregate: Aggregate,
    pub filters: Vec<Filter>,
}

impl ScalarQuery {
    pub fn new(table: Table, aggregate: Aggregate) -> Self {
        Self {
            table,
            aggregate,
            filters: Vec::new(),
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Transient failure of the connection; the operation may succeed after a reconnect.
    #[error("connection to the row store failed")]
    Connection(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("row store query failed")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("column `{0}` was not selected")]
    MissingColumn(&'static str),
    #[error("column `{column}` holds {found}, expected {expected}")]
    ColumnType {
        column: &'static str,
        expected: &'static str,
        found: &'static str,
    },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

/// One result row, holding the values of the selected columns in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: &'static [&'static str],
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: &'static [&'static str], values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn get(&self, column: &'static str) -> Result<&Value, StoreError> {
        self.columns
            .iter()
            .position(|c| *c == column)
            .and_then(|index| self.values.get(index))
            .ok_or(StoreError::MissingColumn(column))
    }

    pub fn get_i64(&self, column: &'static str) -> Result<i64, StoreError> {
        match self.get(column)? {
            Value::Integer(value) => Ok(*value),
            other => Err(StoreError::ColumnType {
                column,
                expected: "integer",
                found: other.type_name(),
            }),
        }
    }

    pub fn get_opt_i64(&self, column: &'static str) -> Result<Option<i64>, StoreError> {
        match self.get(column)? {
            Value::Null => Ok(None),
            _ => self.get_i64(column).map(Some),
        }
    }

    pub fn get_bool(&self, column: &'static str) -> Result<bool, StoreError> {
        Ok(self.get_opt_i64(column)?.unwrap_or(0) != 0)
    }

    pub fn get_str(&self, column: &'static str) -> Result<&str, StoreError> {
        match self.get(column)? {
            Value::Text(value) => Ok(value),
            other => Err(StoreError::ColumnType {
                column,
                expected: "text",
                found: other.type_name(),
            }),
        }
    }

    pub fn get_opt_str(&self, column: &'static str) -> Result<Option<&str>, StoreError> {
        match self.get(column)? {
            Value::Null => Ok(None),
            _ => self.get_str(column).map(Some),
        }
    }
}

/// Read access to the revision tables.
pub trait RowStore: Send + Sync {
    fn query_rows(&self, query: &Query) -> Result<Vec<Row>, StoreError>;

    /// Returns `None` when the aggregate has no value (e.g. `MAX` over no rows).
    fn execute_scalar(&self, query: &ScalarQuery) -> Result<Option<i64>, StoreError>;

    fn table_exists(&self, name: &str) -> Result<bool, StoreError>;

    /// With `index_name == None`, reports whether `table` has any index at all.
    fn index_exists(&self, table: &str, index_name: Option<&str>) -> Result<bool, StoreError>;

    fn column_exists(&self, table: Table, column: &str) -> Result<bool, StoreError>;

    /// Drops and re-opens the underlying connection.
    fn reconnect(&self) -> Result<(), StoreError>;

    fn query_one(&self, query: Query) -> Result<Option<Row>, StoreError> {
        Ok(self.query_rows(&query.limit(1))?.into_iter().next())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Text,
}

/// Rows for one table, written as part of [`RowSink::insert_batches`].
#[derive(Debug, Clone, PartialEq)]
pub struct InsertBatch<'a> {
    pub table: Table,
    pub columns: &'a [&'static str],
    pub rows: Vec<Vec<Value>>,
}

/// Write access, used by ingestion and index maintenance.
pub trait RowSink: Send + Sync {
    /// Inserts all rows atomically. Returns the number of rows written.
    fn insert_rows(
        &self,
        table: Table,
        columns: &[&'static str],
        rows: Vec<Vec<Value>>,
    ) -> Result<usize, StoreError> {
        self.insert_batches(vec![InsertBatch {
            table,
            columns,
            rows,
        }])
    }

    /// Inserts the rows of all batches in one transaction: either every row is written or
    /// none. Returns the number of rows written.
    fn insert_batches(&self, batches: Vec<InsertBatch<'_>>) -> Result<usize, StoreError>;

    fn update_rows(
        &self,
        table: Table,
        assignments: &[(&'static str, Value)],
        filters: &[Filter],
    ) -> Result<usize, StoreError>;

    fn add_column(&self, table: Table, column: &'static str, kind: ColumnType)
        -> Result<(), StoreError>;
}

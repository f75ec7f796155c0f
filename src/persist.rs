// used for persistence
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params_from_iter};
use tracing::{debug, trace};

use crate::construct::ObjectId;
use crate::error::{Result, TesseraError};

// table names
pub const IDENTIFIER: &str = "Identifier";
pub const OBJECT: &str = "Object";
pub const PROPERTY_VALUE: &str = "PropertyValue";
pub const REVISION: &str = "Revision";
pub const SNAPSHOT: &str = "Snapshot";

/// Where the backing store keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceMode {
    InMemory,
    File(String),
}

/// A parameterized `where` clause. Only internal identifiers are ever spliced
/// into the SQL text, every value travels as a bound parameter.
#[derive(Debug, Clone)]
pub struct Predicate {
    sql: String,
    params: Vec<SqlValue>,
    order_by: Option<String>,
}
impl Predicate {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
            order_by: None,
        }
    }
    pub fn all() -> Self {
        Self::new("1 = 1", Vec::new())
    }
    pub fn eq(column: &str, value: impl Into<SqlValue>) -> Self {
        Self::new(format!("{column} = ?"), vec![value.into()])
    }
    pub fn object(object: ObjectId) -> Self {
        Self::eq("Object_Identity", object_value(object))
    }
    pub fn property(property: &str) -> Self {
        Self::eq("Property", text_value(property))
    }
    pub fn and(mut self, other: Predicate) -> Self {
        self.sql = format!("({}) and ({})", self.sql, other.sql);
        self.params.extend(other.params);
        self
    }
    pub fn order_by(mut self, ordering: &str) -> Self {
        self.order_by = Some(ordering.to_string());
        self
    }
    pub fn sql(&self) -> &str {
        &self.sql
    }
    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }
}

pub fn object_value(object: ObjectId) -> SqlValue {
    SqlValue::Integer(object as i64)
}
pub fn text_value(text: impl Into<String>) -> SqlValue {
    SqlValue::Text(text.into())
}

/// One fetched row, columns in the order they were selected.
#[derive(Debug, Clone, PartialEq)]
pub struct Row(Vec<SqlValue>);
impl Row {
    pub fn value(&self, column: usize) -> Result<&SqlValue> {
        self.0.get(column).ok_or_else(|| TesseraError::Invariant(format!(
            "row has no column {column}"
        )))
    }
    pub fn integer(&self, column: usize) -> Result<i64> {
        match self.value(column)? {
            SqlValue::Integer(i) => Ok(*i),
            other => Err(TesseraError::DataCorruption {
                message: format!("expected an integer in column {column}, found {other:?}"),
            }),
        }
    }
    pub fn object(&self, column: usize) -> Result<ObjectId> {
        let id = self.integer(column)?;
        ObjectId::try_from(id).map_err(|_| TesseraError::DataCorruption {
            message: format!("{id} is not a valid object identity"),
        })
    }
    pub fn text(&self, column: usize) -> Result<String> {
        match self.value(column)? {
            SqlValue::Text(s) => Ok(s.clone()),
            other => Err(TesseraError::DataCorruption {
                message: format!("expected text in column {column}, found {other:?}"),
            }),
        }
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ------------- Persistence -------------
pub struct Persistor {
    db: Connection,
}
impl Persistor {
    pub fn new(mode: &PersistenceMode) -> Result<Persistor> {
        let connection = match mode {
            PersistenceMode::InMemory => Connection::open_in_memory()?,
            PersistenceMode::File(path) => Connection::open(path)?,
        };
        debug!(?mode, "opened backing store");
        // The "STRICT" keyword is left out on purpose: the Value columns carry no
        // affinity so that integers, reals and text keep their storage class and
        // compare natively.
        connection.execute_batch(
            "
            create table if not exists Identifier (
                Identifier integer not null,
                constraint unique_and_referenceable_Identifier primary key (
                    Identifier
                )
            );
            create table if not exists Object (
                Object_Identity integer not null,
                Class text not null,
                Created integer not null,
                Last_Cached integer not null,
                Last_Revised integer not null,
                Track_Revisions integer not null,
                constraint referenceable_Object_Identity primary key (
                    Object_Identity
                )
            );
            create index if not exists Object_by_Class on Object (
                Class,
                Created
            );
            create table if not exists PropertyValue (
                Object_Identity integer not null,
                Property text not null,
                Value blob null,
                ValueType text not null,
                ValueHash text not null,
                Added integer not null,
                constraint unique_PropertyValue unique (
                    Object_Identity,
                    Property,
                    ValueHash
                )
            );
            create index if not exists PropertyValue_by_Property on PropertyValue (
                Property,
                ValueHash
            );
            create table if not exists Revision (
                Revision_Identity integer primary key autoincrement,
                Object_Identity integer not null,
                Property text not null,
                RevisionType text not null,
                Value blob null,
                ValueType text not null,
                RevisionTime integer not null
            );
            create index if not exists Revision_by_Object on Revision (
                Object_Identity,
                RevisionTime
            );
            create table if not exists Snapshot (
                Object_Identity integer not null,
                Properties text not null,
                constraint referenceable_Snapshot primary key (
                    Object_Identity
                )
            );
            ",
        )?;
        Ok(Persistor { db: connection })
    }
    pub fn select(
        &self,
        columns: &[&str],
        table: &str,
        predicate: &Predicate,
        first_row_only: bool,
    ) -> Result<Vec<Row>> {
        let mut sql = format!(
            "select {} from {} where {}",
            columns.join(", "),
            table,
            predicate.sql()
        );
        if let Some(ordering) = &predicate.order_by {
            sql += " order by ";
            sql += ordering;
        }
        if first_row_only {
            sql += " limit 1";
        }
        self.query(&sql, predicate.params())
    }
    /// Runs an arbitrary parameterized select.
    pub fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        trace!(sql, "query");
        let mut statement = self.db.prepare_cached(sql)?;
        let width = statement.column_count();
        let mut rows = statement.query(params_from_iter(params.iter()))?;
        let mut fetched = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for column in 0..width {
                values.push(row.get::<_, SqlValue>(column)?);
            }
            fetched.push(Row(values));
        }
        Ok(fetched)
    }
    pub fn insert(&self, table: &str, columns: &[&str], rows: &[Vec<SqlValue>]) -> Result<usize> {
        self.insert_with("insert", table, columns, rows)
    }
    /// Rows that collide with a uniqueness constraint are skipped and not counted.
    pub fn insert_or_ignore(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<SqlValue>],
    ) -> Result<usize> {
        self.insert_with("insert or ignore", table, columns, rows)
    }
    fn insert_with(
        &self,
        verb: &str,
        table: &str,
        columns: &[&str],
        rows: &[Vec<SqlValue>],
    ) -> Result<usize> {
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "{verb} into {table} ({}) values ({placeholders})",
            columns.join(", ")
        );
        trace!(sql, rows = rows.len(), "insert");
        let mut statement = self.db.prepare_cached(&sql)?;
        let mut count = 0;
        for row in rows {
            if row.len() != columns.len() {
                return Err(TesseraError::Invariant(format!(
                    "{} values given for {} columns of {table}",
                    row.len(),
                    columns.len()
                )));
            }
            count += statement.execute(params_from_iter(row.iter()))?;
        }
        Ok(count)
    }
    pub fn update(
        &self,
        table: &str,
        assignments: &[(&str, SqlValue)],
        predicate: &Predicate,
    ) -> Result<usize> {
        let set = assignments
            .iter()
            .map(|(column, _)| format!("{column} = ?"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("update {table} set {set} where {}", predicate.sql());
        trace!(sql, "update");
        let params = assignments
            .iter()
            .map(|(_, value)| value)
            .chain(predicate.params().iter());
        let mut statement = self.db.prepare_cached(&sql)?;
        Ok(statement.execute(params_from_iter(params))?)
    }
    pub fn delete(&self, table: &str, predicate: &Predicate) -> Result<usize> {
        let sql = format!("delete from {table} where {}", predicate.sql());
        trace!(sql, "delete");
        let mut statement = self.db.prepare_cached(&sql)?;
        Ok(statement.execute(params_from_iter(predicate.params().iter()))?)
    }
    /// Executes a single raw statement, typically DDL.
    pub fn exec(&self, statement: &str) -> Result<usize> {
        trace!(statement, "exec");
        Ok(self.db.execute(statement, [])?)
    }
    /// Executes a parameterized statement that returns no rows.
    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<usize> {
        trace!(sql, "execute");
        let mut statement = self.db.prepare_cached(sql)?;
        Ok(statement.execute(params_from_iter(params.iter()))?)
    }
    pub fn in_transaction(&self) -> bool {
        !self.db.is_autocommit()
    }
    /// Returns false when a transaction is already open; nesting is not supported.
    pub fn begin_transaction(&self) -> Result<bool> {
        if self.in_transaction() {
            return Ok(false);
        }
        self.db.execute_batch("begin")?;
        Ok(true)
    }
    pub fn commit(&self) -> Result<bool> {
        if !self.in_transaction() {
            return Ok(false);
        }
        self.db.execute_batch("commit")?;
        Ok(true)
    }
    pub fn rollback(&self) -> Result<bool> {
        if !self.in_transaction() {
            return Ok(false);
        }
        self.db.execute_batch("rollback")?;
        Ok(true)
    }
    pub fn close(self) -> Result<()> {
        self.db.close().map_err(|(_, e)| TesseraError::from(e))
    }
}

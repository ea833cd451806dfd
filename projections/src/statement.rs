//! Typed SQL statements for `PostgreSQL` views.
//!
//! Reducers of a Postgres-backed projection return [`Statement`]s instead of
//! raw SQL. A statement names its table and carries typed [`Column`] values
//! and [`Condition`]s; values are always sent as bind parameters.
//!
//! ```
//! use eventide_projections::statement::{Column, Condition, Statement};
//!
//! let stmt = Statement::update(
//!     "lockout_policies",
//!     vec![Column::new("max_password_attempts", 5_i64)],
//!     vec![Condition::new("instance_id", "inst"), Condition::new("id", "org-1")],
//! );
//! assert_eq!(
//!     stmt.to_sql().unwrap().as_deref(),
//!     Some("UPDATE lockout_policies SET max_password_attempts = $1 WHERE instance_id = $2 AND id = $3")
//! );
//! ```

use chrono::{DateTime, Utc};
use eventide_core::projection::ProjectionError;
use sqlx::{PgConnection, Postgres, QueryBuilder};
use std::fmt;

/// A value bound into a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// `TEXT`
    Text(String),
    /// `BIGINT`
    Int(i64),
    /// `BOOLEAN`
    Bool(bool),
    /// `TIMESTAMPTZ`
    Timestamp(DateTime<Utc>),
    /// `NULL`
    Null,
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for SqlValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u64> for SqlValue {
    /// Values beyond `i64::MAX` are clamped; sequences and positions never
    /// get there.
    fn from(value: u64) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Column assignment `name = value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Assigned value.
    pub value: SqlValue,
}

impl Column {
    /// Create a column assignment.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Equality condition `name = value`, AND-connected with its siblings.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Column name.
    pub name: String,
    /// Expected value.
    pub value: SqlValue,
}

impl Condition {
    /// Create a condition.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One mutation of a Postgres view.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `INSERT`
    Create {
        /// Target table.
        table: String,
        /// Inserted values.
        columns: Vec<Column>,
    },
    /// `INSERT ... ON CONFLICT (..) DO UPDATE`
    Upsert {
        /// Target table.
        table: String,
        /// Conflict target.
        conflict: Vec<String>,
        /// Inserted values; the non-conflict ones are updated on conflict.
        columns: Vec<Column>,
    },
    /// `UPDATE ... WHERE`
    Update {
        /// Target table.
        table: String,
        /// Assigned values.
        columns: Vec<Column>,
        /// Row selection.
        conditions: Vec<Condition>,
    },
    /// `DELETE ... WHERE`
    Delete {
        /// Target table.
        table: String,
        /// Row selection.
        conditions: Vec<Condition>,
    },
    /// `DELETE` of every row, used to reset a view.
    Clear {
        /// Target table.
        table: String,
    },
    /// Nothing to do. Still advances the checkpoint.
    NoOp,
}

impl Statement {
    /// Insert a row.
    #[must_use]
    pub fn create(table: impl Into<String>, columns: Vec<Column>) -> Self {
        Self::Create {
            table: table.into(),
            columns,
        }
    }

    /// Insert a row or update it when `conflict` columns collide.
    #[must_use]
    pub fn upsert<I, S>(table: impl Into<String>, conflict: I, columns: Vec<Column>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Upsert {
            table: table.into(),
            conflict: conflict.into_iter().map(Into::into).collect(),
            columns,
        }
    }

    /// Update the rows matching all conditions.
    #[must_use]
    pub fn update(table: impl Into<String>, columns: Vec<Column>, conditions: Vec<Condition>) -> Self {
        Self::Update {
            table: table.into(),
            columns,
            conditions,
        }
    }

    /// Delete the rows matching all conditions.
    #[must_use]
    pub fn delete(table: impl Into<String>, conditions: Vec<Condition>) -> Self {
        Self::Delete {
            table: table.into(),
            conditions,
        }
    }

    /// Delete every row of `table`.
    #[must_use]
    pub fn clear(table: impl Into<String>) -> Self {
        Self::Clear { table: table.into() }
    }

    /// Whether executing the statement does nothing.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp)
    }

    /// SQL text with numbered placeholders; `None` for [`Statement::NoOp`].
    ///
    /// # Errors
    ///
    /// See [`Statement::execute`].
    pub fn to_sql(&self) -> Result<Option<String>, ProjectionError> {
        Ok(self.build()?.map(|builder| builder.into_sql()))
    }

    /// Run the statement on `conn` and return the affected row count.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::EventProcessing`] if the statement is malformed:
    ///   no columns, an update or delete without conditions, or an identifier
    ///   that is not a plain (optionally schema-qualified) name
    /// - [`ProjectionError::Storage`] if the database rejects it
    pub async fn execute(&self, conn: &mut PgConnection) -> Result<u64, ProjectionError> {
        let Some(mut builder) = self.build()? else {
            return Ok(0);
        };
        let result = builder
            .build()
            .execute(conn)
            .await
            .map_err(|e| ProjectionError::Storage(format!("{self}: {e}")))?;
        Ok(result.rows_affected())
    }

    fn build(&self) -> Result<Option<QueryBuilder<'static, Postgres>>, ProjectionError> {
        match self {
            Self::NoOp => Ok(None),
            Self::Create { table, columns } => {
                let builder = insert(table, columns)?;
                Ok(Some(builder))
            }
            Self::Upsert {
                table,
                conflict,
                columns,
            } => {
                if conflict.is_empty() {
                    return Err(malformed(self, "no conflict columns"));
                }
                for name in conflict {
                    identifier(name)?;
                }
                let mut builder = insert(table, columns)?;
                builder.push(format!(" ON CONFLICT ({}) DO ", conflict.join(", ")));

                let updated: Vec<&Column> = columns
                    .iter()
                    .filter(|c| !conflict.contains(&c.name))
                    .collect();
                if updated.is_empty() {
                    builder.push("NOTHING");
                } else {
                    builder.push("UPDATE SET ");
                    for (i, column) in updated.iter().enumerate() {
                        if i > 0 {
                            builder.push(", ");
                        }
                        builder.push(format!("{0} = EXCLUDED.{0}", column.name));
                    }
                }
                Ok(Some(builder))
            }
            Self::Update {
                table,
                columns,
                conditions,
            } => {
                if columns.is_empty() {
                    return Err(malformed(self, "no columns"));
                }
                let mut builder = QueryBuilder::new(format!("UPDATE {} SET ", identifier(table)?));
                for (i, column) in columns.iter().enumerate() {
                    if i > 0 {
                        builder.push(", ");
                    }
                    builder.push(format!("{} = ", identifier(&column.name)?));
                    push_value(&mut builder, &column.value);
                }
                push_conditions(&mut builder, self, conditions)?;
                Ok(Some(builder))
            }
            Self::Delete { table, conditions } => {
                let mut builder = QueryBuilder::new(format!("DELETE FROM {}", identifier(table)?));
                push_conditions(&mut builder, self, conditions)?;
                Ok(Some(builder))
            }
            Self::Clear { table } => Ok(Some(QueryBuilder::new(format!("DELETE FROM {}", identifier(table)?)))),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create { table, .. } => write!(f, "create on {table}"),
            Self::Upsert { table, .. } => write!(f, "upsert on {table}"),
            Self::Update { table, .. } => write!(f, "update on {table}"),
            Self::Delete { table, .. } => write!(f, "delete on {table}"),
            Self::Clear { table } => write!(f, "clear {table}"),
            Self::NoOp => f.write_str("no-op"),
        }
    }
}

fn insert(table: &str, columns: &[Column]) -> Result<QueryBuilder<'static, Postgres>, ProjectionError> {
    if columns.is_empty() {
        return Err(ProjectionError::EventProcessing(format!("insert into {table} without columns")));
    }
    let names = columns
        .iter()
        .map(|c| identifier(&c.name))
        .collect::<Result<Vec<_>, _>>()?;

    let mut builder = QueryBuilder::new(format!("INSERT INTO {} ({}) VALUES (", identifier(table)?, names.join(", ")));
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        push_value(&mut builder, &column.value);
    }
    builder.push(")");
    Ok(builder)
}

fn push_conditions(
    builder: &mut QueryBuilder<'static, Postgres>,
    statement: &Statement,
    conditions: &[Condition],
) -> Result<(), ProjectionError> {
    if conditions.is_empty() {
        return Err(malformed(statement, "no conditions"));
    }
    builder.push(" WHERE ");
    for (i, condition) in conditions.iter().enumerate() {
        if i > 0 {
            builder.push(" AND ");
        }
        let name = identifier(&condition.name)?;
        if condition.value == SqlValue::Null {
            builder.push(format!("{name} IS NULL"));
        } else {
            builder.push(format!("{name} = "));
            push_value(builder, &condition.value);
        }
    }
    Ok(())
}

fn push_value(builder: &mut QueryBuilder<'static, Postgres>, value: &SqlValue) {
    match value {
        SqlValue::Text(v) => builder.push_bind(v.clone()),
        SqlValue::Int(v) => builder.push_bind(*v),
        SqlValue::Bool(v) => builder.push_bind(*v),
        SqlValue::Timestamp(v) => builder.push_bind(*v),
        SqlValue::Null => builder.push("NULL"),
    };
}

/// Table and column names are code constants; anything but plain
/// identifiers is rejected rather than quoted.
fn identifier(name: &str) -> Result<&str, ProjectionError> {
    let plain = |part: &str| {
        part.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    if !name.is_empty() && name.split('.').all(plain) {
        Ok(name)
    } else {
        Err(ProjectionError::EventProcessing(format!("invalid identifier: {name:?}")))
    }
}

fn malformed(statement: &Statement, reason: &str) -> ProjectionError {
    ProjectionError::EventProcessing(format!("{statement} has {reason}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sql(statement: &Statement) -> String {
        statement.to_sql().unwrap().unwrap()
    }

    #[test]
    fn create_binds_every_column() {
        let stmt = Statement::create(
            "views.users",
            vec![Column::new("id", "u1"), Column::new("sequence", 3_u64), Column::new("nick", None::<String>)],
        );
        assert_eq!(sql(&stmt), "INSERT INTO views.users (id, sequence, nick) VALUES ($1, $2, NULL)");
    }

    #[test]
    fn upsert_updates_non_conflict_columns() {
        let stmt = Statement::upsert(
            "users",
            ["instance_id", "id"],
            vec![Column::new("instance_id", "i"), Column::new("id", "u1"), Column::new("name", "ada")],
        );
        assert_eq!(
            sql(&stmt),
            "INSERT INTO users (instance_id, id, name) VALUES ($1, $2, $3) \
             ON CONFLICT (instance_id, id) DO UPDATE SET name = EXCLUDED.name"
        );

        let keys_only = Statement::upsert("users", ["id"], vec![Column::new("id", "u1")]);
        assert!(sql(&keys_only).ends_with("ON CONFLICT (id) DO NOTHING"));
    }

    #[test]
    fn delete_and_null_conditions() {
        let stmt = Statement::delete(
            "users",
            vec![Condition::new("instance_id", "i"), Condition::new("deleted_at", SqlValue::Null)],
        );
        assert_eq!(sql(&stmt), "DELETE FROM users WHERE instance_id = $1 AND deleted_at IS NULL");
        assert_eq!(sql(&Statement::clear("users")), "DELETE FROM users");
    }

    #[test]
    fn noop_has_no_sql() {
        assert!(Statement::NoOp.to_sql().unwrap().is_none());
        assert!(Statement::NoOp.is_noop());
    }

    #[test]
    fn malformed_statements_are_rejected() {
        assert!(Statement::create("users", vec![]).to_sql().is_err());
        assert!(Statement::update("users", vec![Column::new("a", 1_i64)], vec![]).to_sql().is_err());
        assert!(Statement::delete("users", vec![]).to_sql().is_err());
        assert!(Statement::upsert("users", Vec::<String>::new(), vec![Column::new("a", 1_i64)]).to_sql().is_err());
        assert!(
            Statement::create("users; DROP TABLE events", vec![Column::new("a", 1_i64)])
                .to_sql()
                .is_err()
        );
        assert!(Statement::create("users", vec![Column::new("1a", 1_i64)]).to_sql().is_err());
    }
}

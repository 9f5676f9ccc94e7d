//! Builder-facing query description and its terminal operations.
//!
//! A [`Query`] only accumulates clauses; rendering `(sql, params)` is the
//! [`QueryBuilder`] collaborator's job. [`AnsiQueryBuilder`] is a minimal
//! renderer so the terminal operations work out of the box; anything
//! dialect-heavy belongs in an external builder.

use lazy_static::lazy_static;
use regex::{Captures, Regex};

use crate::cache::CacheDuration;
use crate::command::Command;
use crate::connection::Connection;
use crate::driver::Dialect;
use crate::error::SqlConduitError;
use crate::results::{ResultSet, Row};
use crate::types::{ParamIndex, RowValues};

/// A logical query description, accumulated fluently.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub select: Vec<String>,
    pub distinct: bool,
    pub from: Option<String>,
    pub joins: Vec<Join>,
    pub conditions: Vec<String>,
    pub group_by: Vec<String>,
    pub having: Option<String>,
    pub order_by: Vec<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub params: Vec<(ParamIndex, RowValues)>,
    cache: Option<(CacheDuration, Option<String>)>,
}

#[derive(Debug, Clone)]
pub struct Join {
    pub kind: String,
    pub table: String,
    pub on: String,
}

impl Query {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    #[must_use]
    pub fn from(mut self, table: impl Into<String>) -> Self {
        self.from = Some(table.into());
        self
    }

    #[must_use]
    pub fn join(
        mut self,
        kind: impl Into<String>,
        table: impl Into<String>,
        on: impl Into<String>,
    ) -> Self {
        self.joins.push(Join {
            kind: kind.into(),
            table: table.into(),
            on: on.into(),
        });
        self
    }

    /// AND a condition onto the WHERE clause.
    #[must_use]
    pub fn and_where(mut self, condition: impl Into<String>) -> Self {
        self.conditions.push(condition.into());
        self
    }

    #[must_use]
    pub fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn having(mut self, condition: impl Into<String>) -> Self {
        self.having = Some(condition.into());
        self
    }

    #[must_use]
    pub fn order_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.order_by = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    #[must_use]
    pub fn param(mut self, index: impl Into<ParamIndex>, value: RowValues) -> Self {
        self.params.push((index.into(), value));
        self
    }

    /// Cache results of this query's terminal operations.
    #[must_use]
    pub fn cache(mut self, duration: CacheDuration, dependency: Option<String>) -> Self {
        self.cache = Some((duration, dependency));
        self
    }

    #[must_use]
    pub fn no_cache(mut self) -> Self {
        self.cache = Some((CacheDuration::Disabled, None));
        self
    }

    /// Render via `builder` and wrap the result in a command on `conn`,
    /// propagating params and any cache policy set on the query.
    pub fn create_command<'c>(
        &self,
        conn: &'c mut Connection,
        builder: &dyn QueryBuilder,
    ) -> Result<Command<'c>, SqlConduitError> {
        let prefix = conn.table_prefix().to_string();
        let (sql, params) = builder.build(self, &prefix)?;
        let mut command = conn.create_command(sql);
        command.bind_values(params);
        if let Some((duration, dependency)) = &self.cache {
            command.cache(*duration, dependency.clone());
        }
        Ok(command)
    }

    pub async fn all(
        &self,
        conn: &mut Connection,
        builder: &dyn QueryBuilder,
    ) -> Result<ResultSet, SqlConduitError> {
        self.create_command(conn, builder)?.query_all().await
    }

    pub async fn one(
        &self,
        conn: &mut Connection,
        builder: &dyn QueryBuilder,
    ) -> Result<Option<Row>, SqlConduitError> {
        self.create_command(conn, builder)?.query_one().await
    }

    pub async fn scalar(
        &self,
        conn: &mut Connection,
        builder: &dyn QueryBuilder,
    ) -> Result<Option<RowValues>, SqlConduitError> {
        self.create_command(conn, builder)?.query_scalar().await
    }

    pub async fn column(
        &self,
        conn: &mut Connection,
        builder: &dyn QueryBuilder,
    ) -> Result<Vec<RowValues>, SqlConduitError> {
        self.create_command(conn, builder)?.query_column().await
    }

    /// Existence check; the wrapping transformation is delegated to the
    /// builder.
    pub async fn exists(
        &self,
        conn: &mut Connection,
        builder: &dyn QueryBuilder,
    ) -> Result<bool, SqlConduitError> {
        let prefix = conn.table_prefix().to_string();
        let (sql, params) = builder.build(self, &prefix)?;
        let wrapped = builder.wrap_exists(&sql);
        let mut command = conn.create_command(wrapped);
        command.bind_values(params);
        if let Some((duration, dependency)) = &self.cache {
            command.cache(*duration, dependency.clone());
        }
        let value = command.query_scalar().await?;
        Ok(match value {
            Some(v) => v.as_bool().unwrap_or_else(|| v.as_int().is_some_and(|i| *i != 0)),
            None => false,
        })
    }

    pub async fn count(
        &self,
        conn: &mut Connection,
        builder: &dyn QueryBuilder,
    ) -> Result<Option<RowValues>, SqlConduitError> {
        self.aggregate("COUNT", "*", conn, builder).await
    }

    pub async fn sum(
        &self,
        column: &str,
        conn: &mut Connection,
        builder: &dyn QueryBuilder,
    ) -> Result<Option<RowValues>, SqlConduitError> {
        self.aggregate("SUM", column, conn, builder).await
    }

    pub async fn avg(
        &self,
        column: &str,
        conn: &mut Connection,
        builder: &dyn QueryBuilder,
    ) -> Result<Option<RowValues>, SqlConduitError> {
        self.aggregate("AVG", column, conn, builder).await
    }

    pub async fn min(
        &self,
        column: &str,
        conn: &mut Connection,
        builder: &dyn QueryBuilder,
    ) -> Result<Option<RowValues>, SqlConduitError> {
        self.aggregate("MIN", column, conn, builder).await
    }

    pub async fn max(
        &self,
        column: &str,
        conn: &mut Connection,
        builder: &dyn QueryBuilder,
    ) -> Result<Option<RowValues>, SqlConduitError> {
        self.aggregate("MAX", column, conn, builder).await
    }

    async fn aggregate(
        &self,
        function: &str,
        column: &str,
        conn: &mut Connection,
        builder: &dyn QueryBuilder,
    ) -> Result<Option<RowValues>, SqlConduitError> {
        let mut shaped = self.clone();
        shaped.select = vec![format!("{function}({column})")];
        shaped.order_by.clear();
        shaped.limit = None;
        shaped.offset = None;
        shaped.scalar(conn, builder).await
    }
}

/// External collaborator that turns a [`Query`] into `(sql, params)`.
pub trait QueryBuilder: Send + Sync {
    fn build(
        &self,
        query: &Query,
        table_prefix: &str,
    ) -> Result<(String, Vec<(ParamIndex, RowValues)>), SqlConduitError>;

    /// Wrap a rendered SELECT into an existence check.
    fn wrap_exists(&self, sql: &str) -> String;
}

/// Minimal ANSI renderer. Clause text passes through as written, with
/// `{{table}}` / `[[column]]` markers expanded via the dialect.
pub struct AnsiQueryBuilder {
    dialect: std::sync::Arc<dyn Dialect>,
}

impl AnsiQueryBuilder {
    pub fn new(dialect: std::sync::Arc<dyn Dialect>) -> Self {
        Self { dialect }
    }
}

impl QueryBuilder for AnsiQueryBuilder {
    fn build(
        &self,
        query: &Query,
        table_prefix: &str,
    ) -> Result<(String, Vec<(ParamIndex, RowValues)>), SqlConduitError> {
        let from = query.from.as_deref().ok_or_else(|| {
            SqlConduitError::Unsupported("query has no FROM clause".to_string())
        })?;

        let mut sql = String::from("SELECT ");
        if query.distinct {
            sql.push_str("DISTINCT ");
        }
        if query.select.is_empty() {
            sql.push('*');
        } else {
            sql.push_str(&query.select.join(", "));
        }
        sql.push_str(" FROM ");
        sql.push_str(from);
        for join in &query.joins {
            sql.push_str(&format!(" {} {} ON {}", join.kind, join.table, join.on));
        }
        if !query.conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(
                &query
                    .conditions
                    .iter()
                    .map(|c| format!("({c})"))
                    .collect::<Vec<_>>()
                    .join(" AND "),
            );
        }
        if !query.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&query.group_by.join(", "));
        }
        if let Some(having) = &query.having {
            sql.push_str(" HAVING ");
            sql.push_str(having);
        }
        if !query.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&query.order_by.join(", "));
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = query.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        let sql = expand_sql_markers(&sql, self.dialect.as_ref(), table_prefix);
        Ok((sql, query.params.clone()))
    }

    fn wrap_exists(&self, sql: &str) -> String {
        self.dialect.wrap_exists(sql)
    }
}

lazy_static! {
    static ref TABLE_MARKER: Regex =
        Regex::new(r"\{\{([%\w.\- ]+)\}\}").expect("table marker regex is valid");
    static ref COLUMN_MARKER: Regex =
        Regex::new(r"\[\[([\w.\- ]+)\]\]").expect("column marker regex is valid");
}

/// Expand `{{tableName}}` (with `%` as the table prefix) and `[[columnName]]`
/// markers into dialect-quoted identifiers.
#[must_use]
pub fn expand_sql_markers(sql: &str, dialect: &dyn Dialect, table_prefix: &str) -> String {
    let sql = TABLE_MARKER.replace_all(sql, |caps: &Captures<'_>| {
        dialect.quote_table(&caps[1], table_prefix)
    });
    COLUMN_MARKER
        .replace_all(&sql, |caps: &Captures<'_>| dialect.quote_column(&caps[1]))
        .into_owned()
}

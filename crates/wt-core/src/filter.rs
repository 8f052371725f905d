//! Optional report filters compiled to parameterized SQL.
//!
//! Columns come from a fixed whitelist and values are always bound, so a
//! filter can never inject SQL. The rendered fragments assume the store's
//! aliases: `pi` for `play_intervals` and `li` for `library_item`.

use std::fmt;

use rusqlite::types::{ToSql, ToSqlOutput};
use serde::{Deserialize, Serialize};

use crate::types::ValidationError;

/// Media types that represent live television rather than library content.
pub const LIVE_TV_MEDIA_TYPES: [&str; 4] = ["TvChannel", "LiveTv", "Channel", "TvProgram"];

/// A filterable column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    MediaType,
    ServerId,
    ServerType,
    /// Series id, falling back to series name.
    SeriesKey,
    ItemId,
    UserId,
}

impl Column {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MediaType => "media_type",
            Self::ServerId => "server_id",
            Self::ServerType => "server_type",
            Self::SeriesKey => "series_key",
            Self::ItemId => "item_id",
            Self::UserId => "user_id",
        }
    }

    /// SQL expression for the column. Unknown items read as `'Unknown'` or `''`.
    #[must_use]
    pub const fn expr(&self) -> &'static str {
        match self {
            Self::MediaType => "COALESCE(li.media_type, 'Unknown')",
            Self::ServerId => "COALESCE(li.server_id, '')",
            Self::ServerType => "COALESCE(li.server_type, '')",
            Self::SeriesKey => "COALESCE(NULLIF(li.series_id, ''), li.series_name, '')",
            Self::ItemId => "pi.item_id",
            Self::UserId => "pi.user_id",
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Eq,
    NotEq,
    In,
    NotIn,
    /// Case-insensitive substring match.
    Contains,
}

/// The right-hand side of a clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Text(String),
    Integer(i64),
    List(Vec<String>),
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<Vec<String>> for FilterValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value)
    }
}

/// A single bound parameter produced by compiling a predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    Text(String),
    Integer(i64),
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Self::Text(value) => value.to_sql(),
            Self::Integer(value) => value.to_sql(),
        }
    }
}

/// One `column op value` condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clause {
    pub column: Column,
    pub op: Op,
    pub value: FilterValue,
}

/// A conjunction of clauses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    clauses: Vec<Clause>,
}

/// A compiled predicate: a SQL boolean expression with `?` placeholders and
/// the values to bind to them, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledFilter {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl CompiledFilter {
    /// The fragment to append after an existing `WHERE` condition.
    #[must_use]
    pub fn and_clause(&self) -> String {
        if self.sql.is_empty() {
            String::new()
        } else {
            format!(" AND {}", self.sql)
        }
    }
}

impl Predicate {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            clauses: Vec::new(),
        }
    }

    #[must_use]
    pub fn and(mut self, column: Column, op: Op, value: impl Into<FilterValue>) -> Self {
        self.clauses.push(Clause {
            column,
            op,
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub fn equals(self, column: Column, value: impl Into<FilterValue>) -> Self {
        self.and(column, Op::Eq, value)
    }

    #[must_use]
    pub fn is_in<S: Into<String>>(self, column: Column, values: impl IntoIterator<Item = S>) -> Self {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        self.and(column, Op::In, values)
    }

    #[must_use]
    pub fn not_in<S: Into<String>>(
        self,
        column: Column,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        self.and(column, Op::NotIn, values)
    }

    /// Drops live-TV media types.
    #[must_use]
    pub fn exclude_live_tv(self) -> Self {
        self.not_in(Column::MediaType, LIVE_TV_MEDIA_TYPES)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    #[must_use]
    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Compiles the predicate. An empty predicate compiles to an empty fragment.
    pub fn compile(&self) -> Result<CompiledFilter, ValidationError> {
        let mut parts = Vec::with_capacity(self.clauses.len());
        let mut params = Vec::new();
        for clause in &self.clauses {
            parts.push(compile_clause(clause, &mut params)?);
        }
        Ok(CompiledFilter {
            sql: parts.join(" AND "),
            params,
        })
    }
}

fn compile_clause(clause: &Clause, params: &mut Vec<SqlParam>) -> Result<String, ValidationError> {
    let expr = clause.column.expr();
    let invalid = |reason| ValidationError::InvalidFilter {
        column: clause.column.as_str(),
        reason,
    };

    match (clause.op, &clause.value) {
        (Op::Eq | Op::NotEq, FilterValue::Text(value)) => {
            params.push(SqlParam::Text(value.clone()));
            Ok(format!("{expr} {} ?", comparison(clause.op)))
        }
        (Op::Eq | Op::NotEq, FilterValue::Integer(value)) => {
            params.push(SqlParam::Integer(*value));
            Ok(format!("{expr} {} ?", comparison(clause.op)))
        }
        (Op::Eq | Op::NotEq, FilterValue::List(_)) => Err(invalid("a list needs in or not_in")),
        (Op::In | Op::NotIn, FilterValue::List(values)) => {
            if values.is_empty() {
                // Nothing is in an empty set.
                return Ok(if clause.op == Op::In { "0" } else { "1" }.to_string());
            }
            let placeholders = vec!["?"; values.len()].join(", ");
            params.extend(values.iter().cloned().map(SqlParam::Text));
            let keyword = if clause.op == Op::In { "IN" } else { "NOT IN" };
            Ok(format!("{expr} {keyword} ({placeholders})"))
        }
        (Op::In | Op::NotIn, _) => Err(invalid("in and not_in need a list")),
        (Op::Contains, FilterValue::Text(value)) => {
            params.push(SqlParam::Text(format!("%{}%", escape_like(value))));
            Ok(format!("{expr} LIKE ? ESCAPE '\\'"))
        }
        (Op::Contains, _) => Err(invalid("contains needs text")),
    }
}

const fn comparison(op: Op) -> &'static str {
    match op {
        Op::NotEq => "<>",
        _ => "=",
    }
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

//! Row-id resolution for database dispatch targets.

use std::collections::BTreeMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres};
use tracing::{debug, instrument};

use cnet_core::{Error, Result, RowSelection, RowSource, TargetKind};

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"));

/// Table backing a row target kind.
pub fn table_for(kind: TargetKind) -> Result<&'static str> {
    match kind {
        TargetKind::Measure => Ok("measures"),
        TargetKind::Point => Ok("points"),
        TargetKind::Overlap => Ok("overlay"),
        TargetKind::Image => Ok("images"),
        TargetKind::GroundPoint => Ok("candidategroundpoints"),
        other => Err(Error::UnknownTarget(format!(
            "'{}' is not backed by a database table",
            other
        ))),
    }
}

/// Type-safe parameter binding for row queries.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
}

/// Build the id query for a selection.
///
/// Filter keys become quoted column names compared for equality; a `null`
/// value matches `IS NULL`. A raw query is wrapped so only its `id` column is
/// read, numbered as the query emits it so its own `ORDER BY` survives.
pub fn build_id_query(kind: TargetKind, selection: &RowSelection) -> Result<(String, Vec<QueryParam>)> {
    let table = table_for(kind)?;
    match selection {
        RowSelection::All => Ok((
            format!("SELECT id::bigint FROM {} ORDER BY id", table),
            Vec::new(),
        )),
        RowSelection::Filters(filters) => build_filter_query(table, filters),
        RowSelection::Query(sql) => {
            let sql = sql.trim().trim_end_matches(';');
            if sql.is_empty() {
                return Err(Error::InvalidInput("query_string is empty".into()));
            }
            Ok((
                format!(
                    "SELECT o.id::bigint FROM (SELECT q.id, row_number() OVER () AS ordinal \
                     FROM ({}) AS q) AS o ORDER BY o.ordinal",
                    sql
                ),
                Vec::new(),
            ))
        }
    }
}

fn build_filter_query(
    table: &str,
    filters: &BTreeMap<String, JsonValue>,
) -> Result<(String, Vec<QueryParam>)> {
    let mut clauses = Vec::with_capacity(filters.len());
    let mut params = Vec::new();

    for (column, value) in filters {
        if !IDENTIFIER_RE.is_match(column) {
            return Err(Error::InvalidInput(format!(
                "'{}' is not a valid column name",
                column
            )));
        }
        let param = match value {
            JsonValue::Null => {
                clauses.push(format!("\"{}\" IS NULL", column));
                continue;
            }
            JsonValue::Bool(b) => QueryParam::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => QueryParam::Int(i),
                None => QueryParam::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => QueryParam::String(s.clone()),
            other => {
                return Err(Error::InvalidInput(format!(
                    "filter on '{}' must be a scalar, got {}",
                    column, other
                )))
            }
        };
        params.push(param);
        clauses.push(format!("\"{}\" = ${}", column, params.len()));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    Ok((
        format!("SELECT id::bigint FROM {}{} ORDER BY id", table, where_clause),
        params,
    ))
}

/// [`RowSource`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PgRowSource {
    pool: PgPool,
}

impl PgRowSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RowSource for PgRowSource {
    #[instrument(skip(self, selection), fields(subsystem = "database", target_kind = %kind))]
    async fn row_ids(&self, kind: TargetKind, selection: &RowSelection) -> Result<Vec<i64>> {
        let (sql, params) = build_id_query(kind, selection)?;

        let mut q = sqlx::query_scalar::<Postgres, i64>(&sql);
        for param in params {
            q = match param {
                QueryParam::Int(v) => q.bind(v),
                QueryParam::Float(v) => q.bind(v),
                QueryParam::Bool(v) => q.bind(v),
                QueryParam::String(v) => q.bind(v),
            };
        }

        // The transaction scopes the connection to this call; it is back in the
        // pool before the ids are handed to the dispatcher.
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let ids = q.fetch_all(&mut *tx).await.map_err(Error::Database)?;
        tx.commit().await.map_err(Error::Database)?;

        debug!(row_count = ids.len(), "Resolved row ids");
        Ok(ids)
    }
}

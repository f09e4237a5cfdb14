//! PostgreSQL implementation of [`ShardConnection`].
//!
//! Rows are read with `SELECT *` and decoded column by column into
//! [`SqlValue`]s from the column's PostgreSQL type, so the copy path works
//! for any table whose columns use the supported types. Built-in types are
//! identified by OID; enums travel as text and are cast back to the enum on
//! insert. A column of any other type fails that row only.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::postgres::{PgArguments, PgPool, PgRow, PgTypeInfo, PgTypeKind};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row as _, TypeInfo};
use tracing::{debug, trace};
use uuid::Uuid;

use shardctl_core::sql::{build_insert, count_sql, delete_all_sql, quote_ident, select_batch_sql};
use shardctl_core::{
    ColumnMeta, ConflictPolicy, Error, Result, Row, RowBatch, ShardConnection, SqlValue,
};

use crate::pool::log_pool_metrics;

const REPLICATION_LAG_SQL: &str = "SELECT CASE WHEN pg_is_in_recovery() \
     THEN EXTRACT(EPOCH FROM (now() - pg_last_xact_replay_timestamp()))::float8 \
     ELSE NULL END";

/// A pooled connection to one shard.
#[derive(Debug, Clone)]
pub struct PgShardConnection {
    shard_id: i32,
    pool: PgPool,
}

impl PgShardConnection {
    pub fn new(shard_id: i32, pool: PgPool) -> Self {
        Self { shard_id, pool }
    }

    pub fn shard_id(&self) -> i32 {
        self.shard_id
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Catalog name of a built-in type, by OID.
///
/// sqlx reports SQL display names (`CHAR`, `VARCHAR`, `INT8`), which do not
/// round-trip as casts: `$1::char` is `char(1)` and truncates.
fn builtin_type_name(oid: u32) -> Option<&'static str> {
    let name = match oid {
        16 => "bool",
        17 => "bytea",
        19 => "name",
        20 => "int8",
        21 => "int2",
        23 => "int4",
        25 => "text",
        114 => "json",
        700 => "float4",
        701 => "float8",
        1042 => "bpchar",
        1043 => "varchar",
        1082 => "date",
        1114 => "timestamp",
        1184 => "timestamptz",
        1700 => "numeric",
        2950 => "uuid",
        3802 => "jsonb",
        _ => return None,
    };
    Some(name)
}

/// Type name used to decode a column and to cast its insert placeholder.
///
/// Enums keep their quoted type name so the text value is cast back to the
/// enum on insert.
fn column_type_name(info: &PgTypeInfo) -> String {
    if let Some(name) = info.oid().and_then(|oid| builtin_type_name(oid.0)) {
        return name.to_string();
    }
    match info.kind() {
        PgTypeKind::Enum(_) => quote_ident(info.name()),
        _ => info.name().to_ascii_lowercase(),
    }
}

fn is_enum(info: &PgTypeInfo) -> bool {
    matches!(info.kind(), PgTypeKind::Enum(_))
}

fn column_meta(row: &PgRow) -> Vec<ColumnMeta> {
    row.columns()
        .iter()
        .map(|c| ColumnMeta::typed(c.name(), column_type_name(c.type_info())))
        .collect()
}

fn decode_column(row: &PgRow, idx: usize, column: &ColumnMeta) -> Result<SqlValue> {
    let type_name = column.type_name.as_deref().unwrap_or_default();
    let value = match type_name {
        "bool" => row.try_get::<Option<bool>, _>(idx)?.map(SqlValue::Bool),
        "int2" => row
            .try_get::<Option<i16>, _>(idx)?
            .map(|v| SqlValue::Int(v.into())),
        "int4" => row
            .try_get::<Option<i32>, _>(idx)?
            .map(|v| SqlValue::Int(v.into())),
        "int8" => row.try_get::<Option<i64>, _>(idx)?.map(SqlValue::Int),
        "float4" => row
            .try_get::<Option<f32>, _>(idx)?
            .map(|v| SqlValue::Float(v.into())),
        "float8" => row.try_get::<Option<f64>, _>(idx)?.map(SqlValue::Float),
        "numeric" => row
            .try_get::<Option<sqlx::types::BigDecimal>, _>(idx)?
            .map(|v| SqlValue::Text(v.to_string())),
        "text" | "varchar" | "bpchar" | "name" => {
            row.try_get::<Option<String>, _>(idx)?.map(SqlValue::Text)
        }
        "uuid" => row.try_get::<Option<Uuid>, _>(idx)?.map(SqlValue::Uuid),
        "json" | "jsonb" => row
            .try_get::<Option<serde_json::Value>, _>(idx)?
            .map(SqlValue::Json),
        "bytea" => row.try_get::<Option<Vec<u8>>, _>(idx)?.map(SqlValue::Bytes),
        "timestamptz" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map(SqlValue::Timestamp),
        "timestamp" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)?
            .map(SqlValue::NaiveTimestamp),
        "date" => row.try_get::<Option<NaiveDate>, _>(idx)?.map(SqlValue::Date),
        // Enum labels are sent as their text in both wire formats.
        _ if is_enum(row.column(idx).type_info()) => row
            .try_get_unchecked::<Option<String>, _>(idx)?
            .map(SqlValue::Text),
        other => {
            return Err(Error::UnsupportedType {
                column: column.name.clone(),
                type_name: other.to_string(),
            })
        }
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

fn decode_row(row: &PgRow, columns: &[ColumnMeta]) -> Result<Row> {
    let values = columns
        .iter()
        .enumerate()
        .map(|(idx, column)| decode_column(row, idx, column))
        .collect::<Result<Vec<_>>>()?;
    Ok(Row::new(values))
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q SqlValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Null => query.bind(Option::<String>::None),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_str()),
        SqlValue::Bytes(v) => query.bind(v.as_slice()),
        SqlValue::Uuid(v) => query.bind(*v),
        SqlValue::Json(v) => query.bind(v.clone()),
        SqlValue::Timestamp(v) => query.bind(*v),
        SqlValue::NaiveTimestamp(v) => query.bind(*v),
        SqlValue::Date(v) => query.bind(*v),
    }
}

#[async_trait]
impl ShardConnection for PgShardConnection {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        log_pool_metrics(self.shard_id, &self.pool);
        Ok(())
    }

    async fn count_rows(&self, table: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(&count_sql(table))
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(count)
    }

    async fn fetch_batch(&self, table: &str, limit: i64, offset: i64) -> Result<RowBatch> {
        let start = Instant::now();
        let sql = select_batch_sql(table);
        let rows = sqlx::query(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        let columns = rows.first().map(column_meta).unwrap_or_default();
        let decoded = rows.iter().map(|row| decode_row(row, &columns)).collect();

        debug!(
            subsystem = "db",
            component = "connection",
            op = "fetch_batch",
            shard_id = self.shard_id,
            db_table = table,
            offset,
            rows_fetched = rows.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Fetched batch"
        );
        Ok(RowBatch::new(columns, decoded))
    }

    async fn insert_row(
        &self,
        table: &str,
        columns: &[ColumnMeta],
        values: &[SqlValue],
        conflict: ConflictPolicy,
    ) -> Result<u64> {
        let stmt = build_insert(table, columns, values, conflict)?;
        trace!(shard_id = self.shard_id, db_table = table, sql = %stmt.sql, "Insert row");

        let mut query = sqlx::query(&stmt.sql);
        for value in stmt.binds.iter().copied() {
            query = bind_value(query, value);
        }
        let result = query.execute(&self.pool).await.map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn delete_all(&self, table: &str) -> Result<u64> {
        let result = sqlx::query(&delete_all_sql(table))
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }

    async fn database_size(&self) -> Result<i64> {
        let size: i64 = sqlx::query_scalar("SELECT pg_database_size(current_database())")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(size)
    }

    async fn replication_lag(&self) -> Result<Option<Duration>> {
        let lag: Option<f64> = sqlx::query_scalar(REPLICATION_LAG_SQL)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(lag.map(|secs| Duration::from_secs_f64(secs.max(0.0))))
    }

    async fn close(&self) {
        debug!(
            subsystem = "db",
            component = "connection",
            op = "close",
            shard_id = self.shard_id,
            "Closing shard pool"
        );
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_type_names_use_catalog_names() {
        assert_eq!(builtin_type_name(1042), Some("bpchar"));
        assert_eq!(builtin_type_name(1043), Some("varchar"));
        assert_eq!(builtin_type_name(1700), Some("numeric"));
        assert_eq!(builtin_type_name(1184), Some("timestamptz"));
        assert_eq!(builtin_type_name(3614), None);
    }

    #[test]
    fn test_column_type_name_for_fixed_width_char() {
        use sqlx::postgres::types::Oid;

        // CHAR(n) columns report the display name CHAR.
        assert_eq!(column_type_name(&PgTypeInfo::with_oid(Oid(1042))), "bpchar");
        assert_eq!(column_type_name(&PgTypeInfo::with_oid(Oid(20))), "int8");
    }
}

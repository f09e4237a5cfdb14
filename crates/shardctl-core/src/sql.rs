//! SQL statement builders for table-generic operations.
//!
//! Table and column names come from the fixed table list and from column
//! metadata reported by the source shard, so they are always quoted as
//! identifiers. Values are always bound, never inlined, except `NULL`.

use crate::error::{Error, Result};
use crate::value::{ColumnMeta, ConflictPolicy, SqlValue};

/// Quote an identifier for PostgreSQL, escaping embedded double quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// `SELECT COUNT(*) FROM "table"`
pub fn count_sql(table: &str) -> String {
    format!("SELECT COUNT(*) FROM {}", quote_ident(table))
}

/// `SELECT * FROM "table" ORDER BY id LIMIT $1 OFFSET $2`
pub fn select_batch_sql(table: &str) -> String {
    format!(
        "SELECT * FROM {} ORDER BY id LIMIT $1 OFFSET $2",
        quote_ident(table)
    )
}

/// `DELETE FROM "table"`
pub fn delete_all_sql(table: &str) -> String {
    format!("DELETE FROM {}", quote_ident(table))
}

/// Type to cast a placeholder to for a column of `type_name`.
///
/// A bare `char` cast means `char(1)` and would truncate, so fixed-width
/// character columns are cast to the unsized `bpchar`.
fn placeholder_cast(type_name: &str) -> &str {
    if type_name.eq_ignore_ascii_case("char") || type_name.eq_ignore_ascii_case("character") {
        "bpchar"
    } else {
        type_name
    }
}

/// A parameterized INSERT and the values bound to its placeholders, in order.
#[derive(Debug)]
pub struct InsertStatement<'a> {
    pub sql: String,
    pub binds: Vec<&'a SqlValue>,
}

/// Build an `INSERT` for one row.
///
/// Placeholders are cast to the column's type name when it is known so
/// text-encoded values (numerics, enums) land in the right type.
pub fn build_insert<'a>(
    table: &str,
    columns: &[ColumnMeta],
    values: &'a [SqlValue],
    conflict: ConflictPolicy,
) -> Result<InsertStatement<'a>> {
    if columns.is_empty() {
        return Err(Error::InvalidInput(format!(
            "insert into {}: no columns",
            table
        )));
    }
    if columns.len() != values.len() {
        return Err(Error::InvalidInput(format!(
            "insert into {}: {} columns but {} values",
            table,
            columns.len(),
            values.len()
        )));
    }

    let column_list = columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");

    let mut binds = Vec::with_capacity(values.len());
    let mut placeholders = Vec::with_capacity(values.len());
    for (column, value) in columns.iter().zip(values) {
        if value.is_null() {
            placeholders.push("NULL".to_string());
            continue;
        }
        binds.push(value);
        let n = binds.len();
        placeholders.push(match &column.type_name {
            Some(type_name) => format!("${}::{}", n, placeholder_cast(type_name)),
            None => format!("${}", n),
        });
    }

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        column_list,
        placeholders.join(", ")
    );
    if conflict == ConflictPolicy::DoNothing {
        sql.push_str(" ON CONFLICT DO NOTHING");
    }

    Ok(InsertStatement { sql, binds })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_select_batch_sql() {
        assert_eq!(
            select_batch_sql("order_items"),
            "SELECT * FROM \"order_items\" ORDER BY id LIMIT $1 OFFSET $2"
        );
    }

    #[test]
    fn test_build_insert_with_casts_and_conflict() {
        let columns = vec![
            ColumnMeta::typed("id", "int8"),
            ColumnMeta::typed("total", "numeric"),
            ColumnMeta::new("note"),
        ];
        let values = vec![
            SqlValue::Int(1),
            SqlValue::Text("12.50".to_string()),
            SqlValue::Text("extra cheese".to_string()),
        ];
        let stmt = build_insert("orders", &columns, &values, ConflictPolicy::DoNothing).unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"orders\" (\"id\", \"total\", \"note\") VALUES ($1::int8, $2::numeric, $3) ON CONFLICT DO NOTHING"
        );
        assert_eq!(stmt.binds.len(), 3);
    }

    #[test]
    fn test_build_insert_inlines_null() {
        let columns = vec![ColumnMeta::typed("id", "int8"), ColumnMeta::typed("paid_at", "timestamptz")];
        let values = vec![SqlValue::Int(9), SqlValue::Null];
        let stmt = build_insert("payments", &columns, &values, ConflictPolicy::Error).unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"payments\" (\"id\", \"paid_at\") VALUES ($1::int8, NULL)"
        );
        assert_eq!(stmt.binds, vec![&SqlValue::Int(9)]);
    }

    #[test]
    fn test_build_insert_never_casts_to_single_char() {
        let columns = vec![
            ColumnMeta::typed("id", "int8"),
            ColumnMeta::typed("currency", "char"),
            ColumnMeta::typed("status", "\"order_status\""),
        ];
        let values = vec![
            SqlValue::Int(1),
            SqlValue::from("USD"),
            SqlValue::from("paid"),
        ];
        let stmt = build_insert("payments", &columns, &values, ConflictPolicy::Error).unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"payments\" (\"id\", \"currency\", \"status\") VALUES ($1::int8, $2::bpchar, $3::\"order_status\")"
        );
    }

    #[test]
    fn test_build_insert_length_mismatch() {
        let columns = vec![ColumnMeta::new("id")];
        let values = vec![SqlValue::Int(1), SqlValue::Int(2)];
        let err = build_insert("orders", &columns, &values, ConflictPolicy::DoNothing).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_build_insert_no_columns() {
        assert!(build_insert("orders", &[], &[], ConflictPolicy::DoNothing).is_err());
    }
}

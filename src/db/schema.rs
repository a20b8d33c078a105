use std::collections::HashMap;

use super::pool::Pool;

/// Destination table of a load, with the casts its columns need
///
/// Every field is bound as text. Postgres will not assign a text parameter to
/// a non-text column, so those placeholders are wrapped in `CAST(.. AS type)`
/// and the conversion is left to the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableTarget {
    pub name: String,
    casts: HashMap<String, String>,
}

impl TableTarget {
    /// A target whose columns take text parameters as-is
    pub fn untyped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            casts: HashMap::new(),
        }
    }

    pub fn with_casts(name: impl Into<String>, casts: HashMap<String, String>) -> Self {
        Self {
            name: name.into(),
            casts,
        }
    }

    /// SQL type a column's placeholder must be cast to, if any
    pub fn cast_for(&self, column: &str) -> Option<&str> {
        self.casts.get(column).map(String::as_str)
    }
}

/// Whether a Postgres type accepts a text parameter without a cast
fn is_textual(sql_type: &str) -> bool {
    let lower = sql_type.to_ascii_lowercase();
    lower == "text"
        || lower == "name"
        || lower == "citext"
        || lower.starts_with("character")
        || lower.starts_with("varchar")
}

/// Look up the declared column types of an existing table
///
/// A table that does not exist yields no casts; the insert itself then fails
/// and is reported against the file being loaded.
pub async fn query_table_target(pool: &Pool, table_name: &str) -> Result<TableTarget, sqlx::Error> {
    if !pool.is_postgres() {
        return Ok(TableTarget::untyped(table_name));
    }

    let query = r#"
        SELECT
            a.attname::text,
            format_type(a.atttypid, a.atttypmod)
        FROM pg_attribute a
        WHERE a.attrelid = to_regclass($1::text)
          AND a.attnum > 0
          AND NOT a.attisdropped
        ORDER BY a.attnum
    "#;

    let rows = pool.fetch_pairs_with_bind(query, table_name).await?;

    let casts = rows
        .into_iter()
        .filter(|(_, sql_type)| !is_textual(sql_type))
        .collect();

    Ok(TableTarget::with_casts(table_name, casts))
}

/// Quote an identifier for Postgres, escaping embedded quotes
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified table name part by part
pub fn qualified_table_name(table: &str) -> String {
    table
        .split('.')
        .map(quote_identifier)
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_textual_types() {
        assert!(is_textual("text"));
        assert!(is_textual("character varying(255)"));
        assert!(is_textual("character(2)"));
        assert!(!is_textual("integer"));
        assert!(!is_textual("double precision"));
        assert!(!is_textual("numeric(12,4)"));
    }

    #[test]
    fn test_cast_lookup() {
        let mut casts = HashMap::new();
        casts.insert("year".to_string(), "integer".to_string());
        let target = TableTarget::with_casts("data", casts);

        assert_eq!(target.cast_for("year"), Some("integer"));
        assert_eq!(target.cast_for("country"), None);
        assert_eq!(TableTarget::untyped("data").cast_for("year"), None);
    }

    #[test]
    fn test_identifier_quoting() {
        assert_eq!(quote_identifier("value"), "\"value\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(qualified_table_name("data"), "\"data\"");
        assert_eq!(qualified_table_name("raw.data"), "\"raw\".\"data\"");
    }

    #[tokio::test]
    async fn test_sqlite_target_has_no_casts() {
        let pool = Pool::sqlite_in_memory().await.unwrap();
        let target = query_table_target(&pool, "data").await.unwrap();
        assert_eq!(target, TableTarget::untyped("data"));
    }
}

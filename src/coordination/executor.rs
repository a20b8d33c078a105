use async_trait::async_trait;
use tracing::debug;

use crate::db::TableTarget;
use crate::db::schema::{qualified_table_name, quote_identifier};
use crate::error::LoadError;
use crate::formats::{Batch, Header, Record};

/// Destination of multi-row inserts
///
/// Implementations bind every field of every record, in order, as a text
/// parameter and report the number of rows the statement affected.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn insert(&self, sql: &str, records: &[Record]) -> Result<u64, sqlx::Error>;
}

/// Build `INSERT INTO "t" ("a", "b") VALUES ($1, $2), ($3, $4), ...` for `rows` rows
///
/// Placeholders for columns the target declares with a non-text type are
/// wrapped in `CAST($n AS type)`.
pub fn insert_statement(target: &TableTarget, header: &Header, rows: usize) -> String {
    let column_list = header
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut value_groups = Vec::with_capacity(rows);
    let mut param_idx = 1;

    for _ in 0..rows {
        let placeholders: Vec<String> = header
            .iter()
            .map(|column| {
                let placeholder = format!("${}", param_idx);
                param_idx += 1;
                match target.cast_for(column) {
                    Some(sql_type) => format!("CAST({} AS {})", placeholder, sql_type),
                    None => placeholder,
                }
            })
            .collect();
        value_groups.push(format!("({})", placeholders.join(", ")));
    }

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualified_table_name(&target.name),
        column_list,
        value_groups.join(", ")
    )
}

/// Insert one batch and verify every row landed
pub async fn execute_batch<S: BatchSink + ?Sized>(
    sink: &S,
    target: &TableTarget,
    batch: &Batch,
) -> Result<u64, LoadError> {
    let sql = insert_statement(target, &batch.header, batch.len());

    let affected = sink
        .insert(&sql, &batch.records)
        .await
        .map_err(|source| LoadError::Query {
            path: batch.source.to_path_buf(),
            batch: batch.index,
            source,
        })?;

    let expected = batch.len() as u64;
    if affected != expected {
        return Err(LoadError::Integrity {
            path: batch.source.to_path_buf(),
            batch: batch.index,
            expected,
            affected,
        });
    }

    debug!(
        path = %batch.source.display(),
        table = %target.name,
        batch = batch.index,
        rows = affected,
        "batch inserted"
    );
    Ok(affected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::Mutex;

    struct RecordingSink {
        statements: Mutex<Vec<(String, usize)>>,
        short_by: u64,
        fail: bool,
    }

    impl RecordingSink {
        fn new(short_by: u64, fail: bool) -> Self {
            Self {
                statements: Mutex::new(Vec::new()),
                short_by,
                fail,
            }
        }
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn insert(&self, sql: &str, records: &[Record]) -> Result<u64, sqlx::Error> {
            self.statements
                .lock()
                .unwrap()
                .push((sql.to_string(), records.len()));
            if self.fail {
                return Err(sqlx::Error::Protocol("relation does not exist".to_string()));
            }
            Ok(records.len() as u64 - self.short_by)
        }
    }

    fn header() -> Header {
        Header::new(vec![
            "country".to_string(),
            "year".to_string(),
            "value".to_string(),
        ])
    }

    fn batch(rows: usize) -> Batch {
        let records = (0..rows)
            .map(|i| Record {
                line: i as u64 + 2,
                fields: vec!["FR".to_string(), format!("{}", 1980 + i), "0.5".to_string()],
            })
            .collect();
        Batch {
            source: Arc::from(Path::new("WID_data_FR.csv")),
            index: 3,
            header: header(),
            records,
            rows_dropped: 0,
        }
    }

    #[test]
    fn test_insert_statement_untyped() {
        let sql = insert_statement(&TableTarget::untyped("data"), &header(), 2);
        assert_eq!(
            sql,
            r#"INSERT INTO "data" ("country", "year", "value") VALUES ($1, $2, $3), ($4, $5, $6)"#
        );
    }

    #[test]
    fn test_insert_statement_casts_typed_columns() {
        let mut casts = HashMap::new();
        casts.insert("year".to_string(), "integer".to_string());
        casts.insert("value".to_string(), "double precision".to_string());
        let target = TableTarget::with_casts("raw.data", casts);

        let sql = insert_statement(&target, &header(), 1);
        assert_eq!(
            sql,
            r#"INSERT INTO "raw"."data" ("country", "year", "value") VALUES ($1, CAST($2 AS integer), CAST($3 AS double precision))"#
        );
    }

    #[tokio::test]
    async fn test_execute_batch_reports_rows() {
        let sink = RecordingSink::new(0, false);
        let affected = execute_batch(&sink, &TableTarget::untyped("data"), &batch(4))
            .await
            .unwrap();

        assert_eq!(affected, 4);
        let statements = sink.statements.lock().unwrap();
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].1, 4);
        assert!(statements[0].0.ends_with("($10, $11, $12)"));
    }

    #[tokio::test]
    async fn test_execute_batch_short_count_is_integrity_error() {
        let sink = RecordingSink::new(1, false);
        let err = execute_batch(&sink, &TableTarget::untyped("data"), &batch(4))
            .await
            .unwrap_err();

        match err {
            LoadError::Integrity {
                batch,
                expected,
                affected,
                ..
            } => {
                assert_eq!(batch, 3);
                assert_eq!(expected, 4);
                assert_eq!(affected, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_batch_driver_failure_is_query_error() {
        let sink = RecordingSink::new(0, true);
        let err = execute_batch(&sink, &TableTarget::untyped("data"), &batch(2))
            .await
            .unwrap_err();

        assert!(matches!(err, LoadError::Query { batch: 3, .. }));
        assert!(err.to_string().contains("WID_data_FR.csv"));
    }
}

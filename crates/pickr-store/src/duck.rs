//! DuckDB-backed label tables.

use std::collections::HashMap;
use std::path::Path;

use arrow::array::{Array, Int64Array, LargeStringArray, StringArray};
use arrow::record_batch::RecordBatch;
use duckdb::{Connection, params};
use pickr_core::{DuplicateGroup, LabelStore, NormalizedRow, UniqueLabel};
use tracing::{debug, info};

use crate::StoreError;

/// Raw `(name, label)` rows, possibly several per name.
pub const SOURCE_TABLE: &str = "menu_labels";
/// One canonical row per name.
pub const NORMALIZED_TABLE: &str = "normalized_labels";

/// DuckDB store holding the source and normalized label tables.
///
/// Use [`open`](Self::open) for an in-memory database and
/// [`open_persistent`](Self::open_persistent) for a file that survives
/// restarts. Both create the tables if they are missing.
pub struct DuckLabelStore {
    conn: Connection,
}

impl DuckLabelStore {
    /// Open an in-memory DuckDB database.
    pub fn open() -> Result<Self, StoreError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.create_schema()?;
        Ok(store)
    }

    /// Open or create a persistent DuckDB database at the given path.
    pub fn open_persistent(path: &Path) -> Result<Self, StoreError> {
        let store = Self {
            conn: Connection::open(path)?,
        };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {SOURCE_TABLE} (
                name  VARCHAR NOT NULL,
                label VARCHAR NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {NORMALIZED_TABLE} (
                name         VARCHAR NOT NULL,
                label        VARCHAR NOT NULL,
                source_count BIGINT  NOT NULL
            );"
        ))?;
        Ok(())
    }

    /// Replace the source table with the `name` and `label` columns of a
    /// parquet file. Returns the number of rows loaded.
    pub fn load_source_parquet(&self, path: &Path) -> Result<usize, StoreError> {
        if !path.exists() {
            return Err(StoreError::ParquetNotFound(path.to_path_buf()));
        }
        let sql = format!(
            "CREATE OR REPLACE TABLE {SOURCE_TABLE} AS
             SELECT CAST(name AS VARCHAR) AS name, CAST(label AS VARCHAR) AS label
             FROM read_parquet('{}')
             WHERE name IS NOT NULL AND label IS NOT NULL",
            path.display()
        );
        self.conn.execute_batch(&sql)?;
        let count = self.source_count()?;
        info!(count, path = %path.display(), "loaded source labels");
        Ok(count)
    }

    /// Append rows to the source table.
    pub fn insert_source(&self, rows: &[(String, String)]) -> Result<usize, StoreError> {
        let mut appender = self.conn.appender(SOURCE_TABLE)?;
        for (name, label) in rows {
            appender.append_row(params![name, label])?;
        }
        appender.flush()?;
        Ok(rows.len())
    }

    /// Write the source table to a parquet file.
    pub fn export_source_parquet(&self, path: &Path) -> Result<(), StoreError> {
        self.conn.execute_batch(&format!(
            "COPY {SOURCE_TABLE} TO '{}' (FORMAT PARQUET)",
            path.display()
        ))?;
        Ok(())
    }

    pub fn source_count(&self) -> Result<usize, StoreError> {
        self.count_table(SOURCE_TABLE)
    }

    pub fn normalized_count(&self) -> Result<usize, StoreError> {
        self.count_table(NORMALIZED_TABLE)
    }

    fn count_table(&self, table: &str) -> Result<usize, StoreError> {
        let sql = format!("SELECT count(*)::BIGINT AS cnt FROM {table}");
        let mut stmt = self.conn.prepare(&sql)?;
        let batches: Vec<RecordBatch> = stmt.query_arrow([])?.collect();
        let batch = batches.first().ok_or(StoreError::NoResults)?;
        let col = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .ok_or_else(|| StoreError::Other("count column not i64".into()))?;
        Ok(col.value(0) as usize)
    }

    /// Every normalized row, ordered by name.
    pub fn normalized_rows(&self) -> Result<Vec<NormalizedRow>, StoreError> {
        let sql = format!(
            "SELECT name, label, source_count::BIGINT FROM {NORMALIZED_TABLE} ORDER BY name"
        );
        let mut rows = Vec::new();
        for batch in self.query_arrow(&sql)? {
            let counts = int64_column(&batch, 2)?;
            for row in 0..batch.num_rows() {
                rows.push(NormalizedRow {
                    name: string_at(&batch, 0, row)?,
                    label: string_at(&batch, 1, row)?,
                    source_count: counts.value(row) as usize,
                });
            }
        }
        Ok(rows)
    }

    /// Execute arbitrary SQL and return Arrow RecordBatches.
    pub fn query_arrow(&self, sql: &str) -> Result<Vec<RecordBatch>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let batches: Vec<RecordBatch> = stmt.query_arrow([])?.collect();
        Ok(batches)
    }
}

impl LabelStore for DuckLabelStore {
    fn clear_normalized(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch(&format!("DELETE FROM {NORMALIZED_TABLE}"))?;
        Ok(())
    }

    fn unique_labels(&self) -> anyhow::Result<Vec<UniqueLabel>> {
        let sql = format!(
            "SELECT name, min(label) AS label
             FROM {SOURCE_TABLE}
             GROUP BY name
             HAVING count(DISTINCT label) = 1
             ORDER BY min(rowid)"
        );
        let mut out = Vec::new();
        for batch in self.query_arrow(&sql)? {
            for row in 0..batch.num_rows() {
                out.push(UniqueLabel {
                    name: string_at(&batch, 0, row)?,
                    label: string_at(&batch, 1, row)?,
                });
            }
        }
        debug!(count = out.len(), "unique labels");
        Ok(out)
    }

    fn duplicate_groups(&self) -> anyhow::Result<Vec<DuplicateGroup>> {
        // Rows in insertion order so labels keep their first-seen order.
        let sql = format!(
            "SELECT name, label, CAST(count(*) OVER (PARTITION BY name) AS BIGINT) AS row_count
             FROM {SOURCE_TABLE}
             WHERE name IN (
                 SELECT name FROM {SOURCE_TABLE}
                 GROUP BY name
                 HAVING count(DISTINCT label) > 1
             )
             ORDER BY rowid"
        );
        let mut groups: Vec<DuplicateGroup> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for batch in self.query_arrow(&sql)? {
            let counts = int64_column(&batch, 2)?;
            for row in 0..batch.num_rows() {
                let name = string_at(&batch, 0, row)?;
                let label = string_at(&batch, 1, row)?;
                let i = match index.get(&name) {
                    Some(&i) => i,
                    None => {
                        index.insert(name.clone(), groups.len());
                        groups.push(DuplicateGroup {
                            name,
                            labels: Vec::new(),
                            row_count: counts.value(row) as usize,
                        });
                        groups.len() - 1
                    }
                };
                if !groups[i].labels.contains(&label) {
                    groups[i].labels.push(label);
                }
            }
        }
        debug!(count = groups.len(), "duplicate label groups");
        Ok(groups)
    }

    fn insert_normalized(&self, rows: &[NormalizedRow]) -> anyhow::Result<usize> {
        let mut appender = self.conn.appender(NORMALIZED_TABLE)?;
        for row in rows {
            appender.append_row(params![row.name, row.label, row.source_count as i64])?;
        }
        appender.flush()?;
        Ok(rows.len())
    }

    fn update_source_labels(&self, updates: &[(String, String)]) -> anyhow::Result<usize> {
        let mut stmt = self.conn.prepare(&format!(
            "UPDATE {SOURCE_TABLE} SET label = ? WHERE name = ? AND label <> ?"
        ))?;
        let mut changed = 0;
        for (name, label) in updates {
            changed += stmt.execute(params![label, name, label])?;
        }
        Ok(changed)
    }
}

fn int64_column(batch: &RecordBatch, index: usize) -> Result<&Int64Array, StoreError> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| StoreError::Other(format!("column {index} not i64")))
}

fn string_at(batch: &RecordBatch, index: usize, row: usize) -> Result<String, StoreError> {
    get_string(batch.column(index).as_ref(), row)
        .ok_or_else(|| StoreError::Other(format!("column {index} row {row} is not a string")))
}

/// Extract a string from a Utf8 or LargeUtf8 column.
fn get_string(col: &dyn Array, row: usize) -> Option<String> {
    if col.is_null(row) {
        return None;
    }
    col.as_any()
        .downcast_ref::<StringArray>()
        .map(|arr| arr.value(row).to_string())
        .or_else(|| {
            col.as_any()
                .downcast_ref::<LargeStringArray>()
                .map(|arr| arr.value(row).to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(n, l)| (n.to_string(), l.to_string()))
            .collect()
    }

    fn seeded() -> DuckLabelStore {
        let store = DuckLabelStore::open().unwrap();
        store
            .insert_source(&rows(&[
                ("소주", "음식 > 주류"),
                ("김치", "음식 > 반찬"),
                ("소주", "음식 > 술"),
                ("김치", "음식 > 반찬"),
                ("소주", "음식 > 주류"),
                ("라면", "음식 > 면"),
            ]))
            .unwrap();
        store
    }

    #[test]
    fn open_in_memory_creates_tables() {
        let store = DuckLabelStore::open().unwrap();
        assert_eq!(store.source_count().unwrap(), 0);
        assert_eq!(store.normalized_count().unwrap(), 0);
    }

    #[test]
    fn load_missing_file_errors() {
        let store = DuckLabelStore::open().unwrap();
        let result = store.load_source_parquet(Path::new("/nonexistent/labels.parquet"));
        assert!(matches!(result, Err(StoreError::ParquetNotFound(_))));
    }

    #[test]
    fn unique_labels_in_first_seen_order() {
        let store = seeded();
        let unique = store.unique_labels().unwrap();
        let names: Vec<&str> = unique.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["김치", "라면"]);
        assert_eq!(unique[0].label, "음식 > 반찬");
    }

    #[test]
    fn duplicate_groups_carry_labels_and_row_count() {
        let store = seeded();
        let groups = store.duplicate_groups().unwrap();
        assert_eq!(
            groups,
            vec![DuplicateGroup {
                name: "소주".into(),
                labels: vec!["음식 > 주류".into(), "음식 > 술".into()],
                row_count: 3,
            }]
        );
    }

    #[test]
    fn update_source_labels_counts_changed_rows() {
        let store = seeded();
        let changed = store
            .update_source_labels(&rows(&[("소주", "음식 > 주류")]))
            .unwrap();
        assert_eq!(changed, 1);
        assert!(store.duplicate_groups().unwrap().is_empty());
        assert_eq!(store.source_count().unwrap(), 6);
    }

    #[test]
    fn normalized_insert_and_clear() {
        let store = DuckLabelStore::open().unwrap();
        let rows = vec![
            NormalizedRow {
                name: "b".into(),
                label: "X > Y".into(),
                source_count: 3,
            },
            NormalizedRow {
                name: "a".into(),
                label: "X".into(),
                source_count: 1,
            },
        ];
        assert_eq!(store.insert_normalized(&rows).unwrap(), 2);
        let stored = store.normalized_rows().unwrap();
        assert_eq!(stored[0].name, "a");
        assert_eq!(stored[1].source_count, 3);

        store.clear_normalized().unwrap();
        assert_eq!(store.normalized_count().unwrap(), 0);
    }

    #[test]
    fn parquet_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("labels.parquet");
        seeded().export_source_parquet(&path).unwrap();

        let store = DuckLabelStore::open().unwrap();
        assert_eq!(store.load_source_parquet(&path).unwrap(), 6);
        assert_eq!(store.duplicate_groups().unwrap().len(), 1);
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db_path = tmp.path().join("labels.duckdb");
        {
            let store = DuckLabelStore::open_persistent(&db_path).unwrap();
            store.insert_source(&rows(&[("a", "X")])).unwrap();
        }
        assert!(db_path.exists());

        let store = DuckLabelStore::open_persistent(&db_path).unwrap();
        assert_eq!(store.source_count().unwrap(), 1);
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::RunError;
use crate::table::{Row, Table};

/// The run artifact: one table per input sheet plus a final status block.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sheet {
    pub name: String,
    pub table: Table,
}

impl Workbook {
    #[allow(dead_code)]
    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.name == name)
    }

    fn sheet_mut_or_insert(&mut self, name: &str) -> &mut Sheet {
        if let Some(pos) = self.sheets.iter().position(|s| s.name == name) {
            return &mut self.sheets[pos];
        }
        self.sheets.push(Sheet {
            name: name.to_string(),
            table: Table::new(),
        });
        self.sheets.last_mut().unwrap()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct BatchProgress {
    pub batch_number: u64,
    pub total_batches: u64,
    pub completed_indices: BTreeSet<usize>,
    pub persisted_path: PathBuf,
}

/// Durably persists each completed batch before the next begins, so a crash
/// mid-run loses at most the one in-flight batch. Each append rewrites the
/// workbook to a temp file and renames it into place: a batch is on disk
/// all-or-nothing, never half-written. A write failure falls back once to a
/// secondary path; if that also fails the error surfaces to the caller.
pub struct BatchCheckpointer {
    active: PathBuf,
    fallback: Option<PathBuf>,
    workbook: Workbook,
    progress: BatchProgress,
}

impl BatchCheckpointer {
    pub fn new(primary: PathBuf, fallback: Option<PathBuf>, total_batches: u64) -> Self {
        let progress = BatchProgress {
            batch_number: 0,
            total_batches,
            completed_indices: BTreeSet::new(),
            persisted_path: primary.clone(),
        };
        Self {
            active: primary,
            fallback,
            workbook: Workbook::default(),
            progress,
        }
    }

    pub fn path(&self) -> &Path {
        &self.active
    }

    /// Append one completed batch of rows to a sheet and persist the whole
    /// workbook before returning.
    pub async fn append_batch(
        &mut self,
        sheet: &str,
        unit_indices: &[usize],
        rows: Vec<Row>,
    ) -> Result<&BatchProgress, RunError> {
        {
            let sheet = self.workbook.sheet_mut_or_insert(sheet);
            for row in rows {
                sheet.table.push_row(row);
            }
        }
        self.persist().await?;
        self.progress.batch_number += 1;
        self.progress
            .completed_indices
            .extend(unit_indices.iter().copied());
        self.progress.persisted_path = self.active.clone();
        Ok(&self.progress)
    }

    /// Attach the final status block and persist one last time.
    pub async fn finalize(&mut self, status: serde_json::Value) -> Result<(), RunError> {
        self.workbook.status = Some(status);
        self.persist().await
    }

    async fn persist(&mut self) -> Result<(), RunError> {
        let primary_err = match write_atomic(&self.active, &self.workbook).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        warn!(
            path = %self.active.display(),
            error = %primary_err,
            "checkpoint write failed on primary path"
        );

        let Some(fallback) = self.fallback.take() else {
            return Err(RunError::CatastrophicWrite(format!(
                "{}: {}",
                self.active.display(),
                primary_err
            )));
        };

        match write_atomic(&fallback, &self.workbook).await {
            Ok(()) => {
                info!(path = %fallback.display(), "checkpoint switched to fallback path");
                self.active = fallback;
                Ok(())
            }
            Err(fallback_err) => Err(RunError::CatastrophicWrite(format!(
                "primary {}: {}; fallback {}: {}",
                self.active.display(),
                primary_err,
                fallback.display(),
                fallback_err
            ))),
        }
    }
}

async fn write_atomic(path: &Path, workbook: &Workbook) -> std::io::Result<()> {
    let data = serde_json::to_vec_pretty(workbook)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let tmp = tmp_path(path);
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&data).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

pub async fn load_existing(path: &Path) -> std::io::Result<Workbook> {
    let data = tokio::fs::read(path).await?;
    serde_json::from_slice(&data)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch_rows(base: usize, count: usize) -> Vec<Row> {
        (0..count)
            .map(|i| {
                let mut row = Row::new();
                row.insert("query".to_string(), json!(format!("q{}", base + i)));
                row.insert("score".to_string(), json!((base + i) as f64));
                row
            })
            .collect()
    }

    #[tokio::test]
    async fn test_each_batch_durable_before_next() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let mut cp = BatchCheckpointer::new(path.clone(), None, 3);

        cp.append_batch("sheet1", &[0, 1], batch_rows(0, 2))
            .await
            .unwrap();

        // simulate a crash here by re-reading what is on disk
        let on_disk = load_existing(&path).await.unwrap();
        assert_eq!(on_disk.sheet("sheet1").unwrap().table.len(), 2);

        cp.append_batch("sheet1", &[2, 3], batch_rows(2, 2))
            .await
            .unwrap();

        let on_disk = load_existing(&path).await.unwrap();
        assert_eq!(on_disk.sheet("sheet1").unwrap().table.len(), 4);
        assert_eq!(
            on_disk.sheet("sheet1").unwrap().table.rows()[2]["query"],
            json!("q2")
        );
    }

    #[tokio::test]
    async fn test_progress_indices_only_grow() {
        let dir = tempfile::tempdir().unwrap();
        let mut cp = BatchCheckpointer::new(dir.path().join("out.json"), None, 2);

        let p = cp
            .append_batch("s", &[0, 1], batch_rows(0, 2))
            .await
            .unwrap();
        assert_eq!(p.batch_number, 1);
        assert_eq!(p.completed_indices.len(), 2);

        let p = cp
            .append_batch("s", &[2], batch_rows(2, 1))
            .await
            .unwrap();
        assert_eq!(p.batch_number, 2);
        assert!(p.completed_indices.contains(&0));
        assert!(p.completed_indices.contains(&2));
        assert_eq!(p.total_batches, 2);
    }

    #[tokio::test]
    async fn test_multiple_sheets_kept_apart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let mut cp = BatchCheckpointer::new(path.clone(), None, 2);

        cp.append_batch("alpha", &[0], batch_rows(0, 1))
            .await
            .unwrap();
        cp.append_batch("beta", &[0], batch_rows(10, 1))
            .await
            .unwrap();

        let on_disk = load_existing(&path).await.unwrap();
        assert_eq!(on_disk.sheets.len(), 2);
        assert_eq!(on_disk.sheet("alpha").unwrap().table.len(), 1);
        assert_eq!(on_disk.sheet("beta").unwrap().table.len(), 1);
    }

    #[tokio::test]
    async fn test_fallback_path_used_when_primary_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        let bad_primary = dir.path().join("no-such-subdir").join("out.json");
        let fallback = dir.path().join("recovery.json");
        let mut cp = BatchCheckpointer::new(bad_primary, Some(fallback.clone()), 1);

        let progress = cp
            .append_batch("s", &[0], batch_rows(0, 1))
            .await
            .unwrap();
        assert_eq!(progress.persisted_path, fallback);
        assert!(fallback.exists());

        let on_disk = load_existing(&fallback).await.unwrap();
        assert_eq!(on_disk.sheet("s").unwrap().table.len(), 1);
    }

    #[tokio::test]
    async fn test_catastrophic_when_both_paths_fail() {
        let dir = tempfile::tempdir().unwrap();
        let bad_primary = dir.path().join("missing-a").join("out.json");
        let bad_fallback = dir.path().join("missing-b").join("out.json");
        let mut cp = BatchCheckpointer::new(bad_primary, Some(bad_fallback), 1);

        let err = cp
            .append_batch("s", &[0], batch_rows(0, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::CatastrophicWrite(_)));
    }

    #[tokio::test]
    async fn test_finalize_attaches_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let mut cp = BatchCheckpointer::new(path.clone(), None, 1);

        cp.append_batch("s", &[0], batch_rows(0, 1)).await.unwrap();
        cp.finalize(json!({"sheets_succeeded": 1})).await.unwrap();

        let on_disk = load_existing(&path).await.unwrap();
        assert_eq!(on_disk.status.unwrap()["sheets_succeeded"], json!(1));
    }

    #[test]
    fn test_tmp_path_sibling_of_target() {
        let p = tmp_path(Path::new("/data/out.json"));
        assert_eq!(p, PathBuf::from("/data/out.json.tmp"));
    }
}

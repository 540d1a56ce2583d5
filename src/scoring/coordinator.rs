use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::model::EvaluationUnit;
use crate::scoring::{PipelineSummary, Scorer};
use crate::table::{merge_tables, Row, Table};

pub const NO_EVALUATION_PERFORMED: &str = "No evaluation performed";

/// What one batch of units produced once every enabled pipeline has had its
/// say. `table` is never empty-handed: zero succeeded pipelines synthesize a
/// minimal table from the input rows instead.
#[derive(Clone, Debug)]
pub struct MergeOutcome {
    pub table: Table,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub row_count_mismatch: bool,
    pub synthesized: bool,
    pub failed_rows_by_pipeline: BTreeMap<String, usize>,
    pub summary_metrics: BTreeMap<String, f64>,
}

/// Runs the enabled scorer pipelines concurrently over one batch and merges
/// their per-row tables. A failing pipeline is excluded from the merge and
/// must never stop its siblings.
pub struct MultiScorerCoordinator {
    scorers: Vec<Arc<dyn Scorer>>,
}

impl MultiScorerCoordinator {
    pub fn new(scorers: Vec<Arc<dyn Scorer>>) -> Self {
        Self { scorers }
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        self.scorers.iter().map(|s| s.name().to_string()).collect()
    }

    pub async fn evaluate(&self, units: &[EvaluationUnit]) -> MergeOutcome {
        // spawned so one panicking pipeline cannot take the others down
        let mut meta = Vec::with_capacity(self.scorers.len());
        let mut handles = Vec::with_capacity(self.scorers.len());
        for scorer in &self.scorers {
            meta.push((scorer.name().to_string(), scorer.rename_map()));
            let scorer = scorer.clone();
            let units = units.to_vec();
            handles.push(tokio::spawn(async move { scorer.score(&units).await }));
        }
        let results = futures::future::join_all(handles).await;

        let mut succeeded: Vec<(String, Table, PipelineSummary)> = Vec::new();
        let mut failed: Vec<String> = Vec::new();

        for ((name, rename_map), joined) in meta.into_iter().zip(results) {
            match joined {
                Ok(Ok((mut table, summary))) => {
                    table.rename_columns(&rename_map);
                    info!(
                        pipeline = %name,
                        rows = table.len(),
                        failed_rows = summary.failed_rows,
                        "pipeline completed"
                    );
                    succeeded.push((name, table, summary));
                }
                Ok(Err(e)) => {
                    error!(pipeline = %name, error = %e, "pipeline failed, siblings continue");
                    failed.push(name);
                }
                Err(e) => {
                    error!(pipeline = %name, error = %e, "pipeline panicked, siblings continue");
                    failed.push(name);
                }
            }
        }

        let mut failed_rows_by_pipeline = BTreeMap::new();
        let mut summary_metrics = BTreeMap::new();
        for (name, _, summary) in &succeeded {
            failed_rows_by_pipeline.insert(name.clone(), summary.failed_rows);
            for (key, value) in &summary.metrics {
                summary_metrics.insert(format!("{name}_{key}"), *value);
            }
        }

        let succeeded_names: Vec<String> = succeeded.iter().map(|(n, _, _)| n.clone()).collect();

        let (table, synthesized, row_count_mismatch) = match succeeded.len() {
            0 => {
                info!("no scorer pipeline succeeded, synthesizing a minimal table");
                (synthesize_unevaluated(units), true, false)
            }
            1 => {
                let (_, table, _) = succeeded.into_iter().next().unwrap();
                (table, false, false)
            }
            _ => {
                let named: Vec<(String, Table)> = succeeded
                    .into_iter()
                    .map(|(name, table, _)| (name, table))
                    .collect();
                let (merged, mismatch) = merge_tables(&named);
                (merged, false, mismatch)
            }
        };

        MergeOutcome {
            table,
            succeeded: succeeded_names,
            failed,
            row_count_mismatch,
            synthesized,
            failed_rows_by_pipeline,
            summary_metrics,
        }
    }
}

fn synthesize_unevaluated(units: &[EvaluationUnit]) -> Table {
    let mut table = Table::with_columns(&[
        "query",
        "answer",
        "ground_truth",
        "context",
        "evaluation_status",
    ]);
    for unit in units {
        let mut row = Row::new();
        row.insert("query".to_string(), json!(unit.query));
        row.insert("answer".to_string(), json!(unit.answer));
        row.insert("ground_truth".to_string(), json!(unit.ground_truth));
        row.insert("context".to_string(), json!(unit.context));
        row.insert(
            "evaluation_status".to_string(),
            json!(NO_EVALUATION_PERFORMED),
        );
        table.push_row(row);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedScorer {
        name: &'static str,
        columns: Vec<&'static str>,
        rows: usize,
        rename: Vec<(String, String)>,
        fail: bool,
    }

    impl FixedScorer {
        fn new(name: &'static str, columns: Vec<&'static str>, rows: usize) -> Self {
            Self {
                name,
                columns,
                rows,
                rename: Vec::new(),
                fail: false,
            }
        }

        fn failing(name: &'static str) -> Self {
            Self {
                name,
                columns: Vec::new(),
                rows: 0,
                rename: Vec::new(),
                fail: true,
            }
        }

        fn with_rename(mut self, from: &str, to: &str) -> Self {
            self.rename.push((from.to_string(), to.to_string()));
            self
        }
    }

    #[async_trait]
    impl Scorer for FixedScorer {
        fn name(&self) -> &str {
            self.name
        }

        fn rename_map(&self) -> Vec<(String, String)> {
            self.rename.clone()
        }

        async fn score(
            &self,
            _units: &[EvaluationUnit],
        ) -> anyhow::Result<(Table, PipelineSummary)> {
            if self.fail {
                anyhow::bail!("whole pipeline exploded");
            }
            let mut table = Table::new();
            for i in 0..self.rows {
                let mut row = Row::new();
                for col in &self.columns {
                    row.insert(col.to_string(), json!(format!("{}-{}-{}", self.name, col, i)));
                }
                table.push_row(row);
            }
            Ok((
                table,
                PipelineSummary {
                    rows: self.rows,
                    failed_rows: 0,
                    metrics: BTreeMap::new(),
                },
            ))
        }
    }

    fn units(n: usize) -> Vec<EvaluationUnit> {
        (0..n)
            .map(|i| EvaluationUnit::new(i, format!("q{i}"), "a", "gt", "ctx"))
            .collect()
    }

    #[tokio::test]
    async fn test_failing_pipeline_does_not_stop_siblings() {
        // pipeline A returns 10 rows, pipeline B throws for the whole sheet
        let coordinator = MultiScorerCoordinator::new(vec![
            Arc::new(FixedScorer::new("a", vec!["x"], 10)),
            Arc::new(FixedScorer::failing("b")),
        ]);

        let outcome = coordinator.evaluate(&units(10)).await;
        assert_eq!(outcome.table.len(), 10);
        assert_eq!(outcome.succeeded, vec!["a"]);
        assert_eq!(outcome.failed, vec!["b"]);
        assert!(!outcome.synthesized);
        assert!(!outcome.table.columns().iter().any(|c| c.starts_with("b-")));
    }

    #[tokio::test]
    async fn test_single_success_used_as_is() {
        let coordinator =
            MultiScorerCoordinator::new(vec![Arc::new(FixedScorer::new("only", vec!["m"], 3))]);
        let outcome = coordinator.evaluate(&units(3)).await;
        assert_eq!(outcome.table.len(), 3);
        assert_eq!(outcome.table.columns(), &["m"]);
    }

    #[tokio::test]
    async fn test_zero_success_synthesizes_table() {
        let coordinator = MultiScorerCoordinator::new(vec![
            Arc::new(FixedScorer::failing("a")),
            Arc::new(FixedScorer::failing("b")),
        ]);

        let outcome = coordinator.evaluate(&units(2)).await;
        assert!(outcome.synthesized);
        assert_eq!(outcome.table.len(), 2);
        assert_eq!(
            outcome.table.rows()[0]["evaluation_status"],
            json!(NO_EVALUATION_PERFORMED)
        );
        assert_eq!(outcome.failed.len(), 2);
        assert!(outcome.succeeded.is_empty());
    }

    #[tokio::test]
    async fn test_rename_map_applied_before_merge() {
        let coordinator = MultiScorerCoordinator::new(vec![
            Arc::new(
                FixedScorer::new("stat", vec!["question", "similarity"], 2)
                    .with_rename("question", "query"),
            ),
            Arc::new(FixedScorer::new("judge", vec!["query", "correctness"], 2)),
        ]);

        let outcome = coordinator.evaluate(&units(2)).await;
        // "question" became "query" and collided with judge's column; the
        // first registrant (stat) won
        assert!(outcome.table.columns().contains(&"query".to_string()));
        assert!(!outcome.table.columns().contains(&"question".to_string()));
        assert_eq!(outcome.table.rows()[0]["query"], json!("stat-question-0"));
        assert_eq!(outcome.table.rows()[0]["correctness"], json!("judge-correctness-0"));
    }

    #[tokio::test]
    async fn test_row_count_mismatch_flagged_not_swallowed() {
        let coordinator = MultiScorerCoordinator::new(vec![
            Arc::new(FixedScorer::new("long", vec!["x"], 5)),
            Arc::new(FixedScorer::new("short", vec!["y"], 3)),
        ]);

        let outcome = coordinator.evaluate(&units(5)).await;
        assert!(outcome.row_count_mismatch);
        assert_eq!(outcome.table.len(), 3);
    }

    #[tokio::test]
    async fn test_zero_success_with_empty_units() {
        let coordinator = MultiScorerCoordinator::new(vec![Arc::new(FixedScorer::failing("a"))]);
        let outcome = coordinator.evaluate(&[]).await;
        assert!(outcome.synthesized);
        assert!(outcome.table.is_empty());
        // columns still declared so the sheet is well-formed
        assert!(outcome
            .table
            .columns()
            .contains(&"evaluation_status".to_string()));
    }
}

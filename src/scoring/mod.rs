pub mod chunk_stats;
pub mod coordinator;
pub mod judge;
pub mod retrieval;
pub mod search;
pub mod statistical;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::model::EvaluationUnit;
use crate::table::Table;

/// Per-pipeline aggregate metrics returned next to the row table.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PipelineSummary {
    pub rows: usize,
    pub failed_rows: usize,
    pub metrics: BTreeMap<String, f64>,
}

/// Uniform contract for every scorer pipeline, statistical or LLM-backed.
/// The coordinator depends only on this shape.
#[async_trait]
pub trait Scorer: Send + Sync {
    fn name(&self) -> &str;

    /// Column renames applied to this pipeline's output before merging, so
    /// synonymous concepts unify to one canonical name.
    fn rename_map(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    async fn score(&self, units: &[EvaluationUnit]) -> anyhow::Result<(Table, PipelineSummary)>;
}

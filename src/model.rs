use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::ItemFailure;

/// One query/answer/ground-truth/context row to be scored. Immutable once
/// built; `index` is the row's original ordinal position and stays stable
/// for the lifetime of a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvaluationUnit {
    pub index: usize,
    pub query: String,
    pub answer: String,
    pub ground_truth: String,
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_retrieval: Option<serde_json::Value>,
}

impl EvaluationUnit {
    pub fn new(
        index: usize,
        query: impl Into<String>,
        answer: impl Into<String>,
        ground_truth: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            index,
            query: query.into(),
            answer: answer.into(),
            ground_truth: ground_truth.into(),
            context: context.into(),
            raw_retrieval: None,
        }
    }
}

/// Output of scoring one unit with one scorer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScoreResult {
    pub unit_index: usize,
    pub scorer_name: String,
    pub metrics: BTreeMap<String, f64>,
    pub justifications: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemFailure>,
}

impl ScoreResult {
    pub fn success(
        unit_index: usize,
        scorer_name: impl Into<String>,
        metrics: BTreeMap<String, f64>,
        justifications: BTreeMap<String, String>,
    ) -> Self {
        Self {
            unit_index,
            scorer_name: scorer_name.into(),
            metrics,
            justifications,
            error: None,
        }
    }

    pub fn failure(
        unit_index: usize,
        scorer_name: impl Into<String>,
        failure: ItemFailure,
    ) -> Self {
        Self {
            unit_index,
            scorer_name: scorer_name.into(),
            metrics: BTreeMap::new(),
            justifications: BTreeMap::new(),
            error: Some(failure),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Final status of one run. Partial success is the expected common case, so
/// the report carries counts rather than a single pass/fail flag.
#[derive(Clone, Debug, Serialize)]
pub struct RunStatus {
    pub sheets_total: usize,
    pub sheets_succeeded: usize,
    pub elapsed_seconds: f64,
    pub output_path: PathBuf,
    pub output_size_bytes: u64,
    pub rows_total: usize,
    pub failed_rows_by_pipeline: BTreeMap<String, usize>,
    pub failed_pipelines: Vec<String>,
    pub row_count_mismatch: bool,
}

use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

use crate::model::EvaluationUnit;
use crate::scoring::{PipelineSummary, Scorer};
use crate::table::{Row, Table};

/// In-process similarity/faithfulness scorer. Emits its native column names
/// (question/response/reference/retrieved_contexts) and relies on the
/// coordinator's rename map to unify them with the other pipelines.
pub struct StatisticalScorer;

impl StatisticalScorer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StatisticalScorer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scorer for StatisticalScorer {
    fn name(&self) -> &str {
        "statistical"
    }

    fn rename_map(&self) -> Vec<(String, String)> {
        [
            ("question", "query"),
            ("user_input", "query"),
            ("response", "answer"),
            ("retrieved_contexts", "context"),
            ("reference", "ground_truth"),
        ]
        .iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect()
    }

    async fn score(&self, units: &[EvaluationUnit]) -> anyhow::Result<(Table, PipelineSummary)> {
        let mut table = Table::with_columns(&[
            "question",
            "response",
            "reference",
            "retrieved_contexts",
            "answer_similarity",
            "faithfulness",
        ]);

        let mut similarity_sum = 0.0;
        let mut faithfulness_sum = 0.0;

        for unit in units {
            let similarity = token_f1(&unit.answer, &unit.ground_truth);
            let faithfulness = supported_fraction(&unit.answer, &unit.context);
            similarity_sum += similarity;
            faithfulness_sum += faithfulness;

            let mut row = Row::new();
            row.insert("question".to_string(), json!(unit.query));
            row.insert("response".to_string(), json!(unit.answer));
            row.insert("reference".to_string(), json!(unit.ground_truth));
            row.insert("retrieved_contexts".to_string(), json!(unit.context));
            row.insert("answer_similarity".to_string(), json!(similarity));
            row.insert("faithfulness".to_string(), json!(faithfulness));
            table.push_row(row);
        }

        let mut metrics = BTreeMap::new();
        if !units.is_empty() {
            let n = units.len() as f64;
            metrics.insert("mean_answer_similarity".to_string(), round3(similarity_sum / n));
            metrics.insert("mean_faithfulness".to_string(), round3(faithfulness_sum / n));
        }

        Ok((
            table,
            PipelineSummary {
                rows: units.len(),
                failed_rows: 0,
                metrics,
            },
        ))
    }
}

fn tokens(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Unigram F1 overlap between answer and ground truth.
fn token_f1(answer: &str, ground_truth: &str) -> f64 {
    let a = tokens(answer);
    let b = tokens(ground_truth);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let overlap = a.intersection(&b).count() as f64;
    if overlap == 0.0 {
        return 0.0;
    }
    let precision = overlap / a.len() as f64;
    let recall = overlap / b.len() as f64;
    round3(2.0 * precision * recall / (precision + recall))
}

/// Fraction of answer tokens present in the retrieved context.
fn supported_fraction(answer: &str, context: &str) -> f64 {
    let a = tokens(answer);
    if a.is_empty() {
        return 0.0;
    }
    let c = tokens(context);
    round3(a.intersection(&c).count() as f64 / a.len() as f64)
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

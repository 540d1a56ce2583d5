use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::model::EvaluationUnit;
use crate::scoring::chunk_stats::{self, ChunkStat, RetrievedChunk};
use crate::scoring::{PipelineSummary, Scorer};
use crate::table::{Row, Table};

/// Turns each unit's raw retrieval payload into support-metric columns.
/// Units without a payload get all-zero statistics, same as an empty
/// retrieval list.
pub struct RetrievalStatsScorer;

impl RetrievalStatsScorer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RetrievalStatsScorer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scorer for RetrievalStatsScorer {
    fn name(&self) -> &str {
        "retrieval"
    }

    async fn score(&self, units: &[EvaluationUnit]) -> anyhow::Result<(Table, PipelineSummary)> {
        let mut table = Table::with_columns(&[
            "query",
            "context_url",
            "retrieved_chunk_count",
            "sent_to_llm_chunk_count",
            "used_in_answer_chunk_count",
            "best_support_rank",
            "chunks_used_top_5",
            "chunks_used_5_10",
            "chunks_used_10_20",
            "used_chunk_ranks",
        ]);

        let mut stats = Vec::with_capacity(units.len());
        for unit in units {
            let (context_url, chunks) = decode_payload(unit.raw_retrieval.as_ref());
            let stat = chunk_stats::aggregate(&chunks);
            table.push_row(stat_row(unit, &context_url, &stat));
            stats.push(stat);
        }

        let summary = chunk_stats::summarize(&stats);
        let mut metrics = BTreeMap::new();
        metrics.insert("mean_retrieved_chunks".to_string(), summary.mean_retrieved);
        metrics.insert(
            "mean_sent_to_llm_chunks".to_string(),
            summary.mean_sent_to_llm,
        );
        metrics.insert(
            "mean_used_in_answer_chunks".to_string(),
            summary.mean_used_in_answer,
        );
        metrics.insert("mean_chunks_used_top_5".to_string(), summary.mean_used_top_5);
        metrics.insert("mean_chunks_used_5_10".to_string(), summary.mean_used_5_10);
        metrics.insert(
            "mean_chunks_used_10_20".to_string(),
            summary.mean_used_10_20,
        );

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

fn decode_payload(raw: Option<&Value>) -> (String, Vec<RetrievedChunk>) {
    let Some(raw) = raw else {
        return (String::new(), Vec::new());
    };
    let context_url = raw
        .get("context_url")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let chunks = raw
        .get("chunks")
        .cloned()
        .and_then(|c| serde_json::from_value(c).ok())
        .unwrap_or_default();
    (context_url, chunks)
}

fn stat_row(unit: &EvaluationUnit, context_url: &str, stat: &ChunkStat) -> Row {
    let mut row = Row::new();
    row.insert("query".to_string(), json!(unit.query));
    row.insert("context_url".to_string(), json!(context_url));
    row.insert(
        "retrieved_chunk_count".to_string(),
        json!(stat.retrieved_count),
    );
    row.insert(
        "sent_to_llm_chunk_count".to_string(),
        json!(stat.sent_to_llm_count),
    );
    row.insert(
        "used_in_answer_chunk_count".to_string(),
        json!(stat.used_in_answer_count),
    );
    row.insert("best_support_rank".to_string(), json!(stat.best_support_rank));
    row.insert("chunks_used_top_5".to_string(), json!(stat.chunks_used_top_5));
    row.insert("chunks_used_5_10".to_string(), json!(stat.chunks_used_5_10));
    row.insert(
        "chunks_used_10_20".to_string(),
        json!(stat.chunks_used_10_20),
    );
    row.insert("used_chunk_ranks".to_string(), json!(stat.used_ranks));
    row
}

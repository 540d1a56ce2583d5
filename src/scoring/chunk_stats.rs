//! Retrieval-support statistics computed from one search result's chunk
//! list. Pure and deterministic; identical input yields identical output.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Only the top ranks of a retrieval list carry signal; everything past this
/// is ignored.
pub const MAX_CHUNKS_CONSIDERED: usize = 20;

/// One retrieval candidate as reported by the search API.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    /// 1-based position in the retrieval list.
    pub rank: u32,
    pub sent_to_llm: bool,
    pub used_in_answer: bool,
    pub qualification: String,
}

/// Per-item retrieval-support metrics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkStat {
    pub retrieved_ids: Vec<String>,
    pub retrieved_count: usize,
    pub sent_to_llm_ids: Vec<String>,
    pub sent_to_llm_count: usize,
    pub used_in_answer_ids: Vec<String>,
    pub used_in_answer_count: usize,
    pub qualification_counts: BTreeMap<String, usize>,
    /// Best (lowest) rank among chunks actually used in the answer.
    pub best_support_rank: Option<u32>,
    pub chunks_used_top_5: usize,
    pub chunks_used_5_10: usize,
    pub chunks_used_10_20: usize,
    pub used_ranks: Vec<u32>,
}

/// Batch-level sums and means of the per-item counts.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ChunkStatSummary {
    pub items: usize,
    pub total_retrieved: usize,
    pub total_sent_to_llm: usize,
    pub total_used_in_answer: usize,
    pub mean_retrieved: f64,
    pub mean_sent_to_llm: f64,
    pub mean_used_in_answer: f64,
    pub mean_used_top_5: f64,
    pub mean_used_5_10: f64,
    pub mean_used_10_20: f64,
}

pub fn aggregate(chunks: &[RetrievedChunk]) -> ChunkStat {
    let considered = &chunks[..chunks.len().min(MAX_CHUNKS_CONSIDERED)];

    let mut stat = ChunkStat::default();
    for chunk in considered {
        stat.retrieved_ids.push(chunk.chunk_id.clone());
        if chunk.sent_to_llm {
            stat.sent_to_llm_ids.push(chunk.chunk_id.clone());
        }
        if chunk.used_in_answer {
            stat.used_in_answer_ids.push(chunk.chunk_id.clone());
            stat.used_ranks.push(chunk.rank);
            match chunk.rank {
                1..=5 => stat.chunks_used_top_5 += 1,
                6..=10 => stat.chunks_used_5_10 += 1,
                11..=20 => stat.chunks_used_10_20 += 1,
                _ => {}
            }
        }
        *stat
            .qualification_counts
            .entry(chunk.qualification.clone())
            .or_insert(0) += 1;
    }

    stat.retrieved_ids.sort();
    stat.sent_to_llm_ids.sort();
    stat.used_in_answer_ids.sort();
    stat.retrieved_count = stat.retrieved_ids.len();
    stat.sent_to_llm_count = stat.sent_to_llm_ids.len();
    stat.used_in_answer_count = stat.used_in_answer_ids.len();
    stat.best_support_rank = stat.used_ranks.iter().min().copied();

    stat
}

pub fn summarize(stats: &[ChunkStat]) -> ChunkStatSummary {
    if stats.is_empty() {
        return ChunkStatSummary::default();
    }

    let items = stats.len();
    let total_retrieved: usize = stats.iter().map(|s| s.retrieved_count).sum();
    let total_sent_to_llm: usize = stats.iter().map(|s| s.sent_to_llm_count).sum();
    let total_used_in_answer: usize = stats.iter().map(|s| s.used_in_answer_count).sum();
    let used_top_5: usize = stats.iter().map(|s| s.chunks_used_top_5).sum();
    let used_5_10: usize = stats.iter().map(|s| s.chunks_used_5_10).sum();
    let used_10_20: usize = stats.iter().map(|s| s.chunks_used_10_20).sum();

    ChunkStatSummary {
        items,
        total_retrieved,
        total_sent_to_llm,
        total_used_in_answer,
        mean_retrieved: mean(total_retrieved, items),
        mean_sent_to_llm: mean(total_sent_to_llm, items),
        mean_used_in_answer: mean(total_used_in_answer, items),
        mean_used_top_5: mean(used_top_5, items),
        mean_used_5_10: mean(used_5_10, items),
        mean_used_10_20: mean(used_10_20, items),
    }
}

fn mean(total: usize, items: usize) -> f64 {
    ((total as f64 / items as f64) * 100.0).round() / 100.0
}

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::SearchCredentials;
use crate::error::ItemFailure;
use crate::scoring::chunk_stats::{RetrievedChunk, MAX_CHUNKS_CONSIDERED};

pub const NO_ANSWER_FOUND: &str = "No Answer Found";

/// One backfilled search result: the bot answer, the context chunks that
/// were forwarded to the generator, and the raw chunk list for support
/// statistics.
#[derive(Clone, Debug)]
pub struct SearchHit {
    pub answer: String,
    pub context: Vec<String>,
    pub context_url: String,
    pub chunks: Vec<RetrievedChunk>,
}

/// Retrieval-search collaborator used to backfill missing answer/context
/// before scoring.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn fetch(&self, query: &str, ground_truth: &str) -> Result<SearchHit, ItemFailure>;
}

pub struct HttpSearchClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: String,
}

impl HttpSearchClient {
    pub fn new(creds: &SearchCredentials, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: format!("https://{}/api/public/bot/{}", creds.domain, creds.app_id),
            auth_token: creds.auth_token.clone(),
        })
    }
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn fetch(&self, query: &str, _ground_truth: &str) -> Result<SearchHit, ItemFailure> {
        let body = json!({
            "query": query,
            "includeChunksInResponse": true,
        });

        let response = self
            .http
            .post(format!("{}/advancedSearch", self.base_url))
            .header("auth", &self.auth_token)
            .json(&body)
            .send()
            .await
            .map_err(request_failure)?
            .error_for_status()
            .map_err(request_failure)?;

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ItemFailure::parse(format!("search response undecodable: {e}")))?;

        Ok(parse_search_payload(&payload))
    }
}

pub fn request_failure(e: reqwest::Error) -> ItemFailure {
    if e.is_timeout() {
        ItemFailure::timeout(e.to_string())
    } else {
        ItemFailure::transport(e.to_string())
    }
}

pub fn parse_search_payload(payload: &Value) -> SearchHit {
    let (context, context_url) = extract_context(payload);
    SearchHit {
        answer: extract_answer(payload),
        context,
        context_url,
        chunks: extract_chunks(payload),
    }
}

/// The two supported response shapes nest the generative chunk list
/// differently.
fn generative_chunks(payload: &Value) -> Option<&Vec<Value>> {
    payload
        .get("chunk_result")
        .or_else(|| payload.pointer("/template/chunk_result"))
        .and_then(|c| c.get("generative"))
        .and_then(Value::as_array)
}

pub fn extract_chunks(payload: &Value) -> Vec<RetrievedChunk> {
    let Some(raw) = generative_chunks(payload) else {
        return Vec::new();
    };

    raw.iter()
        .take(MAX_CHUNKS_CONSIDERED)
        .enumerate()
        .filter_map(|(i, chunk)| {
            let source = chunk.get("_source")?;
            let chunk_id = source.get("chunkId").and_then(Value::as_str)?;
            if chunk_id.is_empty() {
                return None;
            }
            Some(RetrievedChunk {
                chunk_id: chunk_id.to_string(),
                rank: (i + 1) as u32,
                sent_to_llm: source
                    .get("sentToLLM")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                used_in_answer: source
                    .get("usedInAnswer")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                qualification: source
                    .get("chunkQualified")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            })
        })
        .collect()
}

pub fn extract_context(payload: &Value) -> (Vec<String>, String) {
    let mut contexts = Vec::new();
    let mut urls: Vec<String> = Vec::new();

    if let Some(raw) = generative_chunks(payload) {
        for chunk in raw {
            let Some(source) = chunk.get("_source") else {
                continue;
            };
            if !source
                .get("sentToLLM")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                continue;
            }
            contexts.push(
                source
                    .get("chunkText")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            );
            let url = source
                .get("recordUrl")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if !url.is_empty() && !urls.contains(&url) {
                urls.push(url);
            }
        }
    }

    (contexts, urls.join(","))
}

pub fn extract_answer(payload: &Value) -> String {
    let center_panel = payload
        .pointer("/response/answer_payload/center_panel")
        .or_else(|| payload.pointer("/template/graph_answer/payload/center_panel"));

    let Some(panel) = center_panel else {
        return NO_ANSWER_FOUND.to_string();
    };
    let Some(snippets) = panel
        .pointer("/data/0/snippet_content")
        .and_then(Value::as_array)
    else {
        return NO_ANSWER_FOUND.to_string();
    };
    if snippets.is_empty() {
        return NO_ANSWER_FOUND.to_string();
    }

    snippets
        .iter()
        .map(|c| {
            c.get("answer_fragment")
                .and_then(Value::as_str)
                .unwrap_or(NO_ANSWER_FOUND)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_value(id: &str, sent: bool, used: bool) -> Value {
        json!({
            "_source": {
                "chunkId": id,
                "sentToLLM": sent,
                "usedInAnswer": used,
                "chunkQualified": "qualified",
                "chunkText": format!("text of {id}"),
                "recordUrl": format!("https://docs/{id}"),
            }
        })
    }

    fn xo_payload() -> Value {
        json!({
            "response": {
                "answer_payload": {
                    "center_panel": {
                        "data": [{
                            "snippet_content": [
                                {"answer_fragment": "Part one."},
                                {"answer_fragment": "Part two."},
                            ]
                        }]
                    }
                }
            },
            "chunk_result": {
                "generative": [
                    chunk_value("c1", true, true),
                    chunk_value("c2", true, false),
                    chunk_value("c3", false, false),
                ]
            }
        })
    }

    #[test]
    fn test_extract_answer_xo_shape() {
        assert_eq!(extract_answer(&xo_payload()), "Part one. Part two.");
    }

    #[test]
    fn test_extract_answer_search_assist_shape() {
        let payload = json!({
            "template": {
                "graph_answer": {
                    "payload": {
                        "center_panel": {
                            "data": [{
                                "snippet_content": [{"answer_fragment": "SA answer"}]
                            }]
                        }
                    }
                }
            }
        });
        assert_eq!(extract_answer(&payload), "SA answer");
    }

    #[test]
    fn test_extract_answer_missing_panel() {
        assert_eq!(extract_answer(&json!({})), NO_ANSWER_FOUND);
        assert_eq!(
            extract_answer(&json!({"response": {"answer_payload": {}}})),
            NO_ANSWER_FOUND
        );
    }

    #[test]
    fn test_extract_context_only_sent_to_llm() {
        let (contexts, url) = extract_context(&xo_payload());
        assert_eq!(contexts, vec!["text of c1", "text of c2"]);
        assert_eq!(url, "https://docs/c1,https://docs/c2");
    }

    #[test]
    fn test_extract_context_search_assist_shape() {
        let payload = json!({
            "template": {
                "chunk_result": {
                    "generative": [chunk_value("sa1", true, false)]
                }
            }
        });
        let (contexts, url) = extract_context(&payload);
        assert_eq!(contexts, vec!["text of sa1"]);
        assert_eq!(url, "https://docs/sa1");
    }

    #[test]
    fn test_extract_chunks_ranks_from_position() {
        let chunks = extract_chunks(&xo_payload());
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].rank, 1);
        assert_eq!(chunks[2].rank, 3);
        assert!(chunks[0].used_in_answer);
        assert!(!chunks[2].sent_to_llm);
    }

    #[test]
    fn test_extract_chunks_skips_empty_ids_keeps_rank() {
        let payload = json!({
            "chunk_result": {
                "generative": [
                    json!({"_source": {"chunkId": ""}}),
                    chunk_value("real", true, true),
                ]
            }
        });
        let chunks = extract_chunks(&payload);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_id, "real");
        assert_eq!(chunks[0].rank, 2);
    }

    #[test]
    fn test_extract_chunks_caps_at_twenty() {
        let raw: Vec<Value> = (0..30).map(|i| chunk_value(&format!("c{i}"), false, false)).collect();
        let payload = json!({"chunk_result": {"generative": raw}});
        assert_eq!(extract_chunks(&payload).len(), 20);
    }

    #[test]
    fn test_parse_search_payload_full() {
        let hit = parse_search_payload(&xo_payload());
        assert_eq!(hit.answer, "Part one. Part two.");
        assert_eq!(hit.context.len(), 2);
        assert_eq!(hit.chunks.len(), 3);
    }
}

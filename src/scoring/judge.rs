use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

use crate::config::JudgeCredentials;
use crate::dispatch::dispatch_bounded;
use crate::error::{FailureKind, ItemFailure};
use crate::model::{EvaluationUnit, ScoreResult};
use crate::scoring::search::request_failure;
use crate::scoring::{PipelineSummary, Scorer};
use crate::table::{Row, Table};

pub const COULD_NOT_EVALUATE: &str = "could not evaluate";

const SYSTEM_PROMPT: &str = "You grade RAG answers. Reply with a JSON object \
containing answer_correctness (0.0-1.0), completeness (0.0-1.0) and a short \
justification string. Reply with the JSON object only.";

/// LLM-judge pipeline: one chat-completions call per unit, fanned out under
/// the judge concurrency bound. Transport and timeout failures are absorbed
/// per row; an unparseable verdict becomes a sentinel "could not evaluate"
/// row rather than a failure.
pub struct LlmJudgeScorer {
    http: reqwest::Client,
    creds: JudgeCredentials,
    max_concurrent: usize,
    timeout: Duration,
}

impl LlmJudgeScorer {
    pub fn new(
        creds: JudgeCredentials,
        max_concurrent: usize,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            creds,
            max_concurrent,
            timeout,
        })
    }
}

#[derive(Debug, Deserialize)]
struct JudgeVerdict {
    answer_correctness: f64,
    completeness: f64,
    #[serde(default)]
    justification: String,
}

#[async_trait]
impl Scorer for LlmJudgeScorer {
    fn name(&self) -> &str {
        "judge"
    }

    async fn score(&self, units: &[EvaluationUnit]) -> anyhow::Result<(Table, PipelineSummary)> {
        let http = self.http.clone();
        let creds = self.creds.clone();

        let outcomes = dispatch_bounded(
            units.to_vec(),
            self.max_concurrent,
            self.timeout,
            move |_, unit| {
                let http = http.clone();
                let creds = creds.clone();
                async move { judge_one(&http, &creds, &unit).await }
            },
        )
        .await?;

        let mut table = Table::with_columns(&[
            "query",
            "answer_correctness",
            "completeness",
            "judge_justification",
            "judge_error",
        ]);

        let mut failed_rows = 0usize;
        let mut unparseable_rows = 0usize;
        let mut correctness_sum = 0.0;
        let mut completeness_sum = 0.0;
        let mut scored = 0usize;

        for (unit, outcome) in units.iter().zip(outcomes) {
            let result = match outcome {
                Ok(result) => result,
                Err(failure) if failure.kind == FailureKind::Parse => {
                    // judge answered but the verdict was garbage; the row
                    // continues with a sentinel score
                    unparseable_rows += 1;
                    warn!(index = unit.index, error = %failure, "judge verdict unparseable, substituting sentinel");
                    let mut justifications = BTreeMap::new();
                    justifications.insert(
                        "judge_justification".to_string(),
                        format!("{COULD_NOT_EVALUATE}: {}", failure.detail),
                    );
                    ScoreResult::success(unit.index, "judge", BTreeMap::new(), justifications)
                }
                Err(failure) => ScoreResult::failure(unit.index, "judge", failure),
            };
            if result.is_failure() {
                failed_rows += 1;
            }

            let mut row = Row::new();
            row.insert("query".to_string(), json!(unit.query));
            if let Some(correctness) = result.metrics.get("answer_correctness") {
                correctness_sum += correctness;
                scored += 1;
                row.insert("answer_correctness".to_string(), json!(correctness));
            }
            if let Some(completeness) = result.metrics.get("completeness") {
                completeness_sum += completeness;
                row.insert("completeness".to_string(), json!(completeness));
            }
            if let Some(justification) = result.justifications.get("judge_justification") {
                row.insert("judge_justification".to_string(), json!(justification));
            }
            if let Some(ref error) = result.error {
                row.insert("judge_error".to_string(), json!(error.to_string()));
            }
            table.push_row(row);
        }

        let mut metrics = BTreeMap::new();
        if scored > 0 {
            metrics.insert(
                "mean_answer_correctness".to_string(),
                correctness_sum / scored as f64,
            );
            metrics.insert(
                "mean_completeness".to_string(),
                completeness_sum / scored as f64,
            );
        }
        if unparseable_rows > 0 {
            warn!(
                unparseable_rows,
                rows = units.len(),
                "some judge verdicts could not be parsed"
            );
        }

        Ok((
            table,
            PipelineSummary {
                rows: units.len(),
                failed_rows,
                metrics,
            },
        ))
    }
}

async fn judge_one(
    http: &reqwest::Client,
    creds: &JudgeCredentials,
    unit: &EvaluationUnit,
) -> Result<ScoreResult, ItemFailure> {
    let body = json!({
        "model": creds.model,
        "temperature": 0.0,
        "messages": [
            {"role": "system", "content": SYSTEM_PROMPT},
            {"role": "user", "content": build_prompt(unit)},
        ],
    });

    let response = http
        .post(format!(
            "{}/chat/completions",
            creds.endpoint.trim_end_matches('/')
        ))
        .bearer_auth(&creds.api_key)
        .json(&body)
        .send()
        .await
        .map_err(request_failure)?
        .error_for_status()
        .map_err(request_failure)?;

    let payload: Value = response
        .json()
        .await
        .map_err(|e| ItemFailure::parse(format!("judge response undecodable: {e}")))?;

    let content = payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| ItemFailure::parse("judge response missing message content"))?;

    let verdict: JudgeVerdict = serde_json::from_str(strip_code_fence(content))
        .map_err(|e| ItemFailure::parse(format!("judge verdict unparseable: {e}")))?;

    let mut metrics = BTreeMap::new();
    metrics.insert(
        "answer_correctness".to_string(),
        verdict.answer_correctness.clamp(0.0, 1.0),
    );
    metrics.insert(
        "completeness".to_string(),
        verdict.completeness.clamp(0.0, 1.0),
    );
    let mut justifications = BTreeMap::new();
    justifications.insert("judge_justification".to_string(), verdict.justification);

    Ok(ScoreResult::success(
        unit.index,
        "judge",
        metrics,
        justifications,
    ))
}

fn build_prompt(unit: &EvaluationUnit) -> String {
    format!(
        "Question:\n{}\n\nGround truth:\n{}\n\nAnswer under evaluation:\n{}\n\nRetrieved context:\n{}",
        unit.query, unit.ground_truth, unit.answer, unit.context
    )
}

/// Judge models wrap JSON in markdown fences often enough to handle it here.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

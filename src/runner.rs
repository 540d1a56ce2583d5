use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{error, info, warn};

use crate::checkpoint::BatchCheckpointer;
use crate::collector;
use crate::config::{resolve_search_credentials, Config, SearchCredentials};
use crate::error::{ItemFailure, RunError};
use crate::metrics::Metrics;
use crate::model::{EvaluationUnit, RunStatus};
use crate::scoring::coordinator::MultiScorerCoordinator;
use crate::scoring::judge::LlmJudgeScorer;
use crate::scoring::retrieval::RetrievalStatsScorer;
use crate::scoring::search::{HttpSearchClient, SearchClient};
use crate::scoring::statistical::StatisticalScorer;
use crate::scoring::Scorer;
use crate::session::SessionRegistry;

#[derive(Clone, Debug, Deserialize)]
pub struct RunRequest {
    pub session_id: String,
    pub sheets: Vec<SheetInput>,
    #[serde(default)]
    pub options: RunOptions,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SheetInput {
    pub name: String,
    pub rows: Vec<RowInput>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RowInput {
    pub query: String,
    #[serde(default)]
    pub ground_truth: String,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub evaluate_statistical: bool,
    pub evaluate_judge: bool,
    pub evaluate_retrieval: bool,
    pub use_search_api: bool,
    pub batch_size: Option<usize>,
    /// Session-specific search credentials; absent means the shared config
    /// is consulted next (and the fallback logged).
    pub search: Option<SearchCredentials>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            evaluate_statistical: true,
            evaluate_judge: false,
            evaluate_retrieval: false,
            use_search_api: false,
            batch_size: None,
            search: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunState {
    pub run_id: String,
    pub session_id: String,
    pub phase: RunPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct SheetReport {
    evaluated: bool,
    rows: usize,
    failed_rows_by_pipeline: BTreeMap<String, usize>,
    failed_pipelines: BTreeSet<String>,
    row_count_mismatch: bool,
    summary_metrics: BTreeMap<String, f64>,
}

/// Drives evaluation runs end to end: session workspace resolution, search
/// backfill, concurrent pipeline scoring, per-batch checkpointing, artifact
/// registration. One spawned task per run; state lives in a shared map the
/// HTTP handlers poll.
pub struct Runner {
    config: Arc<Config>,
    sessions: Arc<SessionRegistry>,
    metrics: Arc<Metrics>,
    runs: DashMap<String, Arc<Mutex<RunState>>>,
}

impl Runner {
    pub fn new(config: Arc<Config>, sessions: Arc<SessionRegistry>, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            sessions,
            metrics,
            runs: DashMap::new(),
        }
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<Mutex<RunState>>> {
        self.runs.get(run_id).map(|r| r.value().clone())
    }

    pub fn spawn_run(self: Arc<Self>, request: RunRequest) -> String {
        let run_id = uuid::Uuid::new_v4().to_string();
        let state = Arc::new(Mutex::new(RunState {
            run_id: run_id.clone(),
            session_id: request.session_id.clone(),
            phase: RunPhase::Pending,
            status: None,
            error: None,
        }));
        self.runs.insert(run_id.clone(), state.clone());

        let runner = self;
        let id = run_id.clone();
        tokio::spawn(async move {
            runner.metrics.start_run();
            let start = Instant::now();
            {
                state.lock().await.phase = RunPhase::Running;
            }

            let outcome = runner.execute(&id, request).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            let mut st = state.lock().await;
            match outcome {
                Ok(status) => {
                    info!(
                        run_id = %id,
                        sheets_succeeded = status.sheets_succeeded,
                        sheets_total = status.sheets_total,
                        elapsed_seconds = status.elapsed_seconds,
                        "run completed"
                    );
                    runner.metrics.finish_run(true, duration_ms);
                    st.status = Some(status);
                    st.phase = RunPhase::Completed;
                }
                Err(e) => {
                    error!(run_id = %id, error = %e, "run failed");
                    runner.metrics.finish_run(false, duration_ms);
                    st.error = Some(e.to_string());
                    st.phase = RunPhase::Failed;
                }
            }
        });

        run_id
    }

    async fn execute(&self, run_id: &str, request: RunRequest) -> Result<RunStatus, RunError> {
        let started = Instant::now();
        let options = &request.options;

        if !options.evaluate_statistical && !options.evaluate_judge && !options.evaluate_retrieval {
            return Err(RunError::Configuration(
                "at least one scorer pipeline must be enabled".to_string(),
            ));
        }

        let workspace = self.sessions.workspace_dir(&request.session_id)?;
        let batch_size = options.batch_size.unwrap_or(self.config.batch_size).max(1);

        // everything configuration-shaped fails here, before any dispatch
        let coordinator = self.build_coordinator(options)?;
        let search_client = self.build_search_client(options)?;

        let file_name = format!(
            "evaluation_output_{}_{}.json",
            &run_id[..8.min(run_id.len())],
            Utc::now().format("%Y%m%d-%H%M%S")
        );
        let primary = workspace.join(&file_name);
        let fallback = workspace.join(format!("recovery_{file_name}"));

        let total_batches: u64 = request
            .sheets
            .iter()
            .map(|s| s.rows.len().div_ceil(batch_size) as u64)
            .sum();
        let mut checkpointer = BatchCheckpointer::new(primary, Some(fallback), total_batches);

        info!(
            run_id = %run_id,
            sheets = request.sheets.len(),
            total_batches,
            batch_size,
            "starting evaluation run"
        );

        let mut sheets_succeeded = 0usize;
        let mut rows_total = 0usize;
        let mut failed_rows_by_pipeline: BTreeMap<String, usize> = BTreeMap::new();
        let mut failed_pipelines: BTreeSet<String> = BTreeSet::new();
        let mut row_count_mismatch = false;
        let mut sheet_summaries: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();

        for sheet in &request.sheets {
            let report = self
                .process_sheet(
                    &coordinator,
                    search_client.clone(),
                    sheet,
                    batch_size,
                    &mut checkpointer,
                )
                .await?;

            rows_total += report.rows;
            if report.evaluated {
                sheets_succeeded += 1;
            }
            for (pipeline, count) in report.failed_rows_by_pipeline {
                *failed_rows_by_pipeline.entry(pipeline).or_insert(0) += count;
            }
            failed_pipelines.extend(report.failed_pipelines);
            row_count_mismatch |= report.row_count_mismatch;
            sheet_summaries.insert(sheet.name.clone(), report.summary_metrics);
        }

        self.metrics.record_rows(rows_total as u64);
        self.metrics
            .record_pipeline_failures(failed_pipelines.len() as u64);

        let elapsed_seconds = started.elapsed().as_secs_f64();
        checkpointer
            .finalize(json!({
                "sheets_total": request.sheets.len(),
                "sheets_succeeded": sheets_succeeded,
                "rows_total": rows_total,
                "failed_pipelines": &failed_pipelines,
                "row_count_mismatch": row_count_mismatch,
                "sheet_summaries": sheet_summaries,
                "elapsed_seconds": elapsed_seconds,
            }))
            .await?;

        let output_path = checkpointer.path().to_path_buf();
        let output_size_bytes = std::fs::metadata(&output_path).map(|m| m.len()).unwrap_or(0);
        self.sessions
            .register_output_file(&request.session_id, &output_path)?;

        Ok(RunStatus {
            sheets_total: request.sheets.len(),
            sheets_succeeded,
            elapsed_seconds,
            output_path,
            output_size_bytes,
            rows_total,
            failed_rows_by_pipeline,
            failed_pipelines: failed_pipelines.into_iter().collect(),
            row_count_mismatch,
        })
    }

    fn build_coordinator(&self, options: &RunOptions) -> Result<MultiScorerCoordinator, RunError> {
        let mut scorers: Vec<Arc<dyn Scorer>> = Vec::new();
        if options.evaluate_statistical {
            scorers.push(Arc::new(StatisticalScorer::new()));
        }
        if options.evaluate_judge {
            let creds = self.config.judge.clone().ok_or_else(|| {
                RunError::Configuration(
                    "judge pipeline enabled but no judge credentials configured".to_string(),
                )
            })?;
            let judge = LlmJudgeScorer::new(
                creds,
                self.config.max_concurrent_judge,
                Duration::from_secs(self.config.judge_timeout_secs),
            )
            .map_err(|e| RunError::Configuration(e.to_string()))?;
            scorers.push(Arc::new(judge));
        }
        if options.evaluate_retrieval {
            scorers.push(Arc::new(RetrievalStatsScorer::new()));
        }
        Ok(MultiScorerCoordinator::new(scorers))
    }

    fn build_search_client(
        &self,
        options: &RunOptions,
    ) -> Result<Option<Arc<dyn SearchClient>>, RunError> {
        if !options.use_search_api {
            return Ok(None);
        }
        let (creds, source) =
            resolve_search_credentials(options.search.as_ref(), self.config.search.as_ref())
                .ok_or_else(|| {
                    RunError::Configuration(
                        "search backfill enabled but no credentials in request or environment"
                            .to_string(),
                    )
                })?;
        info!(source = %source, "search credentials resolved");
        let client = HttpSearchClient::new(
            creds,
            Duration::from_secs(self.config.search_timeout_secs),
        )
        .map_err(|e| RunError::Configuration(e.to_string()))?;
        Ok(Some(Arc::new(client)))
    }

    async fn process_sheet(
        &self,
        coordinator: &MultiScorerCoordinator,
        search_client: Option<Arc<dyn SearchClient>>,
        sheet: &SheetInput,
        batch_size: usize,
        checkpointer: &mut BatchCheckpointer,
    ) -> Result<SheetReport, RunError> {
        let units: Vec<EvaluationUnit> = sheet
            .rows
            .iter()
            .enumerate()
            .map(|(index, row)| {
                EvaluationUnit::new(
                    index,
                    row.query.clone(),
                    row.answer.clone().unwrap_or_default(),
                    row.ground_truth.clone(),
                    row.context.clone().unwrap_or_default(),
                )
            })
            .collect();

        let mut report = SheetReport {
            rows: units.len(),
            ..Default::default()
        };
        // summary metrics are per-batch means; accumulate them weighted by
        // batch size so the sheet-level numbers are row-weighted means
        let mut summary_acc: BTreeMap<String, (f64, usize)> = BTreeMap::new();

        for (batch_no, chunk) in units.chunks(batch_size).enumerate() {
            let mut batch = chunk.to_vec();
            if let Some(ref client) = search_client {
                self.backfill_batch(client.clone(), &mut batch).await;
            }

            let outcome = coordinator.evaluate(&batch).await;
            if !outcome.synthesized {
                report.evaluated = true;
            }
            for (pipeline, count) in &outcome.failed_rows_by_pipeline {
                *report
                    .failed_rows_by_pipeline
                    .entry(pipeline.clone())
                    .or_insert(0) += count;
            }
            report
                .failed_pipelines
                .extend(outcome.failed.iter().cloned());
            report.row_count_mismatch |= outcome.row_count_mismatch;
            for (key, value) in &outcome.summary_metrics {
                let entry = summary_acc.entry(key.clone()).or_insert((0.0, 0));
                entry.0 += value * batch.len() as f64;
                entry.1 += batch.len();
            }

            let indices: Vec<usize> = batch.iter().map(|u| u.index).collect();
            let succeeded = outcome.succeeded.clone();
            let progress = checkpointer
                .append_batch(&sheet.name, &indices, outcome.table.into_rows())
                .await?;
            info!(
                sheet = %sheet.name,
                batch = batch_no + 1,
                batches_done = progress.batch_number,
                total_batches = progress.total_batches,
                pipelines = ?succeeded,
                "batch checkpointed"
            );
        }

        report.summary_metrics = summary_acc
            .into_iter()
            .map(|(key, (sum, weight))| (key, if weight > 0 { sum / weight as f64 } else { 0.0 }))
            .collect();

        Ok(report)
    }

    /// Fill missing answer/context from the search API before scoring.
    /// Results arrive in completion order over a channel and are restored to
    /// unit order; a row whose fetch failed continues unanswered.
    async fn backfill_batch(&self, client: Arc<dyn SearchClient>, units: &mut [EvaluationUnit]) {
        if units.is_empty() {
            return;
        }

        let (tx, mut rx) = mpsc::channel(units.len());
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_search));
        let timeout = Duration::from_secs(self.config.search_timeout_secs);

        for (slot, unit) in units.iter().enumerate() {
            let tx = tx.clone();
            let semaphore = semaphore.clone();
            let client = client.clone();
            let query = unit.query.clone();
            let ground_truth = unit.ground_truth.clone();

            tokio::spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let outcome = match tokio::time::timeout(timeout, client.fetch(&query, &ground_truth))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ItemFailure::timeout(format!(
                        "search gave no response within {}s",
                        timeout.as_secs()
                    ))),
                };
                let _ = tx.send((slot, outcome)).await;
            });
        }
        drop(tx);

        let deadline = Duration::from_secs(self.config.search_timeout_secs.saturating_mul(3));
        let outcomes = collector::collect(&mut rx, units.len(), deadline, |slot| {
            Err(ItemFailure::unknown(format!(
                "no search result received for row {slot}"
            )))
        })
        .await;

        for (unit, outcome) in units.iter_mut().zip(outcomes) {
            match outcome {
                Ok(hit) => {
                    if unit.answer.is_empty() {
                        unit.answer = hit.answer;
                    }
                    if unit.context.is_empty() {
                        unit.context = hit.context.join("\n");
                    }
                    unit.raw_retrieval = Some(json!({
                        "context_url": hit.context_url,
                        "chunks": hit.chunks,
                    }));
                }
                Err(failure) => {
                    warn!(
                        index = unit.index,
                        error = %failure,
                        "search backfill failed, row continues unanswered"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::load_existing;
    use crate::scoring::chunk_stats::RetrievedChunk;
    use crate::scoring::search::SearchHit;
    use async_trait::async_trait;

    struct MockSearchClient {
        fail_on: Option<usize>,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl MockSearchClient {
        fn new(fail_on: Option<usize>) -> Self {
            Self {
                fail_on,
                calls: std::sync::atomic::AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SearchClient for MockSearchClient {
        async fn fetch(&self, query: &str, _ground_truth: &str) -> Result<SearchHit, ItemFailure> {
            let call = self
                .calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if Some(call) == self.fail_on {
                return Err(ItemFailure::transport("connection refused"));
            }
            Ok(SearchHit {
                answer: format!("answer to {query}"),
                context: vec![format!("context for {query}")],
                context_url: "https://docs/x".to_string(),
                chunks: vec![RetrievedChunk {
                    chunk_id: "c1".to_string(),
                    rank: 1,
                    sent_to_llm: true,
                    used_in_answer: true,
                    qualification: "qualified".to_string(),
                }],
            })
        }
    }

    fn test_runner() -> (tempfile::TempDir, Arc<Runner>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_env();
        config.workspace_base = dir.path().to_path_buf();
        let sessions =
            Arc::new(SessionRegistry::load_or_create(dir.path().to_path_buf()).unwrap());
        let runner = Arc::new(Runner::new(
            Arc::new(config),
            sessions,
            Metrics::new(),
        ));
        (dir, runner)
    }

    fn sheet(name: &str, rows: usize) -> SheetInput {
        SheetInput {
            name: name.to_string(),
            rows: (0..rows)
                .map(|i| RowInput {
                    query: format!("query {i}"),
                    ground_truth: format!("truth {i}"),
                    answer: Some(format!("truth {i}")),
                    context: Some(format!("context {i}")),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_execute_statistical_run_end_to_end() {
        let (_dir, runner) = test_runner();
        let session = runner.sessions.create().unwrap();

        let request = RunRequest {
            session_id: session.session_id.clone(),
            sheets: vec![sheet("sheet1", 5)],
            options: RunOptions::default(),
        };

        let status = runner.execute("test-run-0001", request).await.unwrap();
        assert_eq!(status.sheets_total, 1);
        assert_eq!(status.sheets_succeeded, 1);
        assert_eq!(status.rows_total, 5);
        assert!(status.failed_pipelines.is_empty());
        assert!(status.output_size_bytes > 0);

        // artifact on disk, registered, and well-formed
        let workbook = load_existing(&status.output_path).await.unwrap();
        assert_eq!(workbook.sheet("sheet1").unwrap().table.len(), 5);
        assert!(workbook.status.is_some());
        assert_eq!(
            runner
                .sessions
                .latest_output_file(&session.session_id)
                .unwrap(),
            Some(status.output_path.clone())
        );

        // statistical columns arrived under their canonical names
        let table = &workbook.sheet("sheet1").unwrap().table;
        assert!(table.columns().contains(&"query".to_string()));
        assert!(table.columns().contains(&"answer_similarity".to_string()));
        assert!(!table.columns().contains(&"question".to_string()));
    }

    #[tokio::test]
    async fn test_execute_no_pipelines_is_configuration_error() {
        let (_dir, runner) = test_runner();
        let session = runner.sessions.create().unwrap();

        let request = RunRequest {
            session_id: session.session_id,
            sheets: vec![sheet("s", 1)],
            options: RunOptions {
                evaluate_statistical: false,
                ..Default::default()
            },
        };

        let err = runner.execute("test-run-0002", request).await.unwrap_err();
        assert!(matches!(err, RunError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_execute_unknown_session_fails_fast() {
        let (_dir, runner) = test_runner();
        let request = RunRequest {
            session_id: "bogus".to_string(),
            sheets: vec![sheet("s", 1)],
            options: RunOptions::default(),
        };
        let err = runner.execute("test-run-0003", request).await.unwrap_err();
        assert!(matches!(err, RunError::Session(_)));
    }

    #[tokio::test]
    async fn test_execute_search_enabled_without_credentials() {
        let (_dir, runner) = test_runner();
        let session = runner.sessions.create().unwrap();
        let request = RunRequest {
            session_id: session.session_id,
            sheets: vec![sheet("s", 1)],
            options: RunOptions {
                use_search_api: true,
                ..Default::default()
            },
        };
        // runner config came from a clean env, so no shared credentials
        if runner.config.search.is_none() {
            let err = runner.execute("test-run-0004", request).await.unwrap_err();
            assert!(matches!(err, RunError::Configuration(_)));
        }
    }

    #[tokio::test]
    async fn test_backfill_fills_missing_fields_only() {
        let (_dir, runner) = test_runner();
        let client = Arc::new(MockSearchClient::new(None));

        let mut units = vec![
            EvaluationUnit::new(0, "q0", "", "gt0", ""),
            EvaluationUnit::new(1, "q1", "already answered", "gt1", "own context"),
        ];
        runner.backfill_batch(client, &mut units).await;

        assert_eq!(units[0].answer, "answer to q0");
        assert_eq!(units[0].context, "context for q0");
        assert!(units[0].raw_retrieval.is_some());
        // rows that already carry data keep it
        assert_eq!(units[1].answer, "already answered");
        assert_eq!(units[1].context, "own context");
        assert!(units[1].raw_retrieval.is_some());
    }

    #[tokio::test]
    async fn test_backfill_failed_row_continues_unanswered() {
        let (_dir, runner) = test_runner();
        let client = Arc::new(MockSearchClient::new(Some(0)));

        let mut units = vec![EvaluationUnit::new(0, "q0", "", "gt0", "")];
        runner.backfill_batch(client, &mut units).await;

        assert_eq!(units[0].answer, "");
        assert!(units[0].raw_retrieval.is_none());
    }

    #[tokio::test]
    async fn test_spawn_run_reaches_completed_state() {
        let (_dir, runner) = test_runner();
        let session = runner.sessions.create().unwrap();

        let run_id = runner.clone().spawn_run(RunRequest {
            session_id: session.session_id,
            sheets: vec![sheet("s", 3)],
            options: RunOptions::default(),
        });

        let state = runner.get(&run_id).expect("run state tracked");
        for _ in 0..200 {
            {
                let st = state.lock().await;
                if st.phase == RunPhase::Completed {
                    assert!(st.status.is_some());
                    return;
                }
                assert_ne!(st.phase, RunPhase::Failed, "run failed: {:?}", st.error);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run never completed");
    }

    #[tokio::test]
    async fn test_multi_sheet_run_batches_in_order() {
        let (_dir, runner) = test_runner();
        let session = runner.sessions.create().unwrap();

        let request = RunRequest {
            session_id: session.session_id,
            sheets: vec![sheet("alpha", 12), sheet("beta", 4)],
            options: RunOptions {
                batch_size: Some(5),
                ..Default::default()
            },
        };

        let status = runner.execute("test-run-0005", request).await.unwrap();
        assert_eq!(status.sheets_total, 2);
        assert_eq!(status.sheets_succeeded, 2);
        assert_eq!(status.rows_total, 16);

        let workbook = load_existing(&status.output_path).await.unwrap();
        assert_eq!(workbook.sheet("alpha").unwrap().table.len(), 12);
        assert_eq!(workbook.sheet("beta").unwrap().table.len(), 4);
        // original row order survives out-of-order scoring
        let alpha = &workbook.sheet("alpha").unwrap().table;
        assert_eq!(alpha.rows()[0]["query"], json!("query 0"));
        assert_eq!(alpha.rows()[11]["query"], json!("query 11"));
    }
}

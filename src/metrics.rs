use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct Metrics {
    pub runs_total: AtomicU64,
    pub runs_active: AtomicU64,
    pub runs_completed: AtomicU64,
    pub runs_failed: AtomicU64,
    pub rows_scored: AtomicU64,
    pub pipeline_failures: AtomicU64,
    pub duration_sum_ms: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            runs_total: AtomicU64::new(0),
            runs_active: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            rows_scored: AtomicU64::new(0),
            pipeline_failures: AtomicU64::new(0),
            duration_sum_ms: AtomicU64::new(0),
        })
    }

    pub fn start_run(&self) {
        self.runs_total.fetch_add(1, Ordering::Relaxed);
        self.runs_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finish_run(&self, succeeded: bool, duration_ms: u64) {
        self.runs_active.fetch_sub(1, Ordering::Relaxed);
        if succeeded {
            self.runs_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.runs_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.duration_sum_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn record_rows(&self, rows: u64) {
        self.rows_scored.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_pipeline_failures(&self, count: u64) {
        self.pipeline_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let runs_total = self.runs_total.load(Ordering::Relaxed);
        let runs_active = self.runs_active.load(Ordering::Relaxed);
        let runs_completed = self.runs_completed.load(Ordering::Relaxed);
        let runs_failed = self.runs_failed.load(Ordering::Relaxed);
        let rows_scored = self.rows_scored.load(Ordering::Relaxed);
        let pipeline_failures = self.pipeline_failures.load(Ordering::Relaxed);
        let dur_sum = self.duration_sum_ms.load(Ordering::Relaxed);

        format!(
            "# HELP rag_eval_runs_total Total evaluation runs submitted.\n\
             # TYPE rag_eval_runs_total counter\n\
             rag_eval_runs_total {}\n\
             # HELP rag_eval_runs_active Currently running evaluations.\n\
             # TYPE rag_eval_runs_active gauge\n\
             rag_eval_runs_active {}\n\
             # HELP rag_eval_runs_completed Runs that finished with a result.\n\
             # TYPE rag_eval_runs_completed counter\n\
             rag_eval_runs_completed {}\n\
             # HELP rag_eval_runs_failed Runs that failed at run level.\n\
             # TYPE rag_eval_runs_failed counter\n\
             rag_eval_runs_failed {}\n\
             # HELP rag_eval_rows_scored Rows pushed through scoring.\n\
             # TYPE rag_eval_rows_scored counter\n\
             rag_eval_rows_scored {}\n\
             # HELP rag_eval_pipeline_failures Whole-pipeline failures absorbed.\n\
             # TYPE rag_eval_pipeline_failures counter\n\
             rag_eval_pipeline_failures {}\n\
             # HELP rag_eval_duration_ms_sum Sum of run durations in ms.\n\
             # TYPE rag_eval_duration_ms_sum counter\n\
             rag_eval_duration_ms_sum {}\n",
            runs_total,
            runs_active,
            runs_completed,
            runs_failed,
            rows_scored,
            pipeline_failures,
            dur_sum
        )
    }
}

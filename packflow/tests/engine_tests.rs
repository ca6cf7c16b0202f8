//! End-to-end tests driving the engine through real worker pools.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

use packflow::config::EngineConfig;
use packflow::queue::QueueConfig;
use packflow::sweeper::SweeperConfig;
use packflow::worker_pool::WorkerPoolConfig;
use packflow::{
    Engine, JobState, Model, QueuedJob, ResultStatus, Step, StepContext, StepRegistry, StepResult,
};

/// Records the package id of every execution, in order.
struct RecordStep(Arc<Mutex<Vec<String>>>);

#[async_trait]
impl Step for RecordStep {
    fn name(&self) -> &'static str {
        "record"
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> packflow::Result<StepResult> {
        self.0.lock().push(ctx.package.id().to_string());
        Ok(StepResult::ok(&ctx.info.step_id))
    }
}

/// Sleeps for the `ms` parameter while tracking concurrency.
#[derive(Default)]
struct SleepStep {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[async_trait]
impl Step for SleepStep {
    fn name(&self) -> &'static str {
        "sleep"
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> packflow::Result<StepResult> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let ms = ctx
            .info
            .parameter("ms")
            .and_then(|v| v.parse().ok())
            .unwrap_or(20);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(StepResult::ok(&ctx.info.step_id))
    }
}

/// Upper-cases its input into the declared output and offers it for download.
struct ConvertStep;

#[async_trait]
impl Step for ConvertStep {
    fn name(&self) -> &'static str {
        "convert"
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> packflow::Result<StepResult> {
        let input = ctx
            .info
            .input
            .as_deref()
            .and_then(|i| ctx.package.resolve(i))
            .ok_or_else(|| packflow::Error::step("no input"))?;
        let output = ctx.info.output.clone().unwrap_or_else(|| "out.txt".into());
        let text = tokio::fs::read_to_string(&input).await?;
        tokio::fs::write(ctx.package.directory().join(&output), text.to_uppercase()).await?;
        Ok(StepResult::ok(&ctx.info.step_id).with_download(output))
    }
}

/// Always reports an error.
struct FailStep;

#[async_trait]
impl Step for FailStep {
    fn name(&self) -> &'static str {
        "fail"
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> packflow::Result<StepResult> {
        Ok(StepResult::error(&ctx.info.step_id, "bad input"))
    }
}

struct Harness {
    temp: TempDir,
    root: std::path::PathBuf,
    log: Arc<Mutex<Vec<String>>>,
    sleep: Arc<SleepStep>,
    models: Vec<Arc<Model>>,
}

const MODEL: &str = r#"{
    "name": "docs",
    "pipelines": [
        {"id": "publish", "default": true, "steps": [
            {"id": "record", "executable": "record"},
            {"id": "convert", "executable": "convert", "output": "upper.txt", "downloadable": true},
            {"id": "check", "executable": "nop"}
        ]},
        {"id": "slow", "steps": [
            {"id": "wait", "executable": "sleep", "parameters": {"ms": "40"}}
        ]},
        {"id": "long", "steps": [
            {"id": "wait", "executable": "sleep", "parameters": {"ms": "10000"}}
        ]},
        {"id": "broken", "steps": [
            {"id": "record", "executable": "record"},
            {"id": "fail", "executable": "fail"},
            {"id": "after", "executable": "record"}
        ]},
        {"id": "lenient", "steps": [
            {"id": "fail", "executable": "fail", "fail_on_error": false},
            {"id": "after", "executable": "record"}
        ]}
    ]
}"#;

impl Harness {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("packages");
        let log = Arc::new(Mutex::new(Vec::new()));
        let sleep = Arc::new(SleepStep::default());

        let mut registry = StepRegistry::with_builtins();
        registry
            .register("record", Arc::new(RecordStep(log.clone())))
            .register("sleep", sleep.clone())
            .register("convert", Arc::new(ConvertStep))
            .register("fail", Arc::new(FailStep));
        let models = vec![Arc::new(Model::from_json_str(MODEL, &registry).unwrap())];

        Self {
            temp,
            root,
            log,
            sleep,
            models,
        }
    }

    fn config(&self, workers: usize) -> EngineConfig {
        let pool = WorkerPoolConfig::default()
            .with_max_workers(workers)
            .with_rest_interval_ms(1);
        EngineConfig::new(&self.root)
            .with_pipeline_pool(pool.clone())
            .with_step_pool(pool)
            .with_sweeper(SweeperConfig::default().with_enabled(false))
    }

    fn engine(&self, config: EngineConfig) -> Engine {
        Engine::new(config, self.models.clone()).unwrap()
    }

    fn original(&self, name: &str, content: &str) -> std::path::PathBuf {
        let path = self.temp.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }
}

async fn wait_for(engine: &Engine, job_id: &str) -> packflow::StatusSnapshot {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(status) = engine
                .pipeline_status(job_id)
                .or_else(|| engine.step_status(job_id))
                && status.has_completed()
            {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job did not finish in time")
}

async fn package(engine: &Engine, original: Option<&Path>) -> Arc<packflow::PackageData> {
    engine
        .create_package("docs", original, &BTreeMap::new())
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pipeline_runs_every_step_and_captures_download() {
    let h = Harness::new();
    let engine = h.engine(h.config(1));
    let original = h.original("letter.txt", "hello");
    let pkg = package(&engine, Some(original.as_path())).await;

    let job_id = engine.submit_pipeline("docs", None, pkg.clone()).unwrap();
    let status = wait_for(&engine, &job_id).await;

    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.percentage, 100);
    assert!(status.message.is_none());

    let job = engine.pipeline_job(&job_id).unwrap();
    let results = job.results();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.status == ResultStatus::Ok));
    assert_eq!(results[1].step_id, "convert");

    assert_eq!(
        std::fs::read_to_string(pkg.directory().join("upper.txt")).unwrap(),
        "HELLO"
    );
    let download = job.download().unwrap();
    assert_eq!(download, format!("{}/upper.txt", pkg.id()));
    assert!(engine.config().download_dir().join(&download).is_file());
    assert_eq!(*h.log.lock(), vec![pkg.id().to_string()]);

    engine.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_bounds_concurrency() {
    let h = Harness::new();
    let engine = h.engine(h.config(2));

    let mut packages = Vec::new();
    for _ in 0..5 {
        packages.push(package(&engine, None).await);
    }
    let ids: Vec<String> = packages
        .into_iter()
        .map(|pkg| engine.submit_pipeline("docs", Some("slow"), pkg).unwrap())
        .collect();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let overview = engine.overview();
            assert!(overview.pipelines.running.len() <= 2);
            if overview.pipelines.completed.len() == ids.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("jobs did not finish in time");
    for id in &ids {
        assert_eq!(wait_for(&engine, id).await.state, JobState::Completed);
    }

    let max = h.sleep.max_in_flight.load(Ordering::SeqCst);
    assert!((1..=2).contains(&max), "max in flight was {max}");
    assert_eq!(engine.pending_count(), 0);

    engine.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_worker_runs_jobs_in_submission_order() {
    let h = Harness::new();
    let engine = h.engine(h.config(1));

    let mut expected = Vec::new();
    let mut last = String::new();
    for _ in 0..4 {
        let pkg = package(&engine, None).await;
        expected.push(pkg.id().to_string());
        last = engine.submit_step("docs", "publish", None, pkg).unwrap();
    }
    wait_for(&engine, &last).await;

    assert_eq!(*h.log.lock(), expected);

    engine.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_step_stops_pipeline() {
    let h = Harness::new();
    let engine = h.engine(h.config(1));
    let pkg = package(&engine, None).await;

    let job_id = engine.submit_pipeline("docs", Some("broken"), pkg).unwrap();
    let status = wait_for(&engine, &job_id).await;

    assert_eq!(status.state, JobState::Failed);
    assert!(status.message.unwrap().contains("step 'fail' failed: bad input"));
    assert!(status.percentage < 100);

    let results = engine.pipeline_job(&job_id).unwrap().results();
    assert_eq!(results.len(), 2);
    assert_eq!(results[1].status, ResultStatus::Error);
    assert_eq!(h.log.lock().len(), 1);

    engine.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lenient_failure_runs_remaining_steps() {
    let h = Harness::new();
    let engine = h.engine(h.config(1));
    let pkg = package(&engine, None).await;

    let job_id = engine.submit_pipeline("docs", Some("lenient"), pkg).unwrap();
    let status = wait_for(&engine, &job_id).await;

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.percentage, 100);
    assert_eq!(engine.pipeline_job(&job_id).unwrap().results().len(), 2);
    assert_eq!(h.log.lock().len(), 1);

    engine.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_large_original_goes_to_slow_lane() {
    let h = Harness::new();
    let engine = h.engine(h.config(1).with_slow_threshold_bytes(4));
    let big = h.original("big.txt", "larger than four bytes");
    let pkg = package(&engine, Some(big.as_path())).await;

    let job_id = engine.submit_pipeline("docs", None, pkg).unwrap();
    let job = engine.pipeline_job(&job_id).unwrap();
    assert!(job.is_slow());

    assert_eq!(wait_for(&engine, &job_id).await.state, JobState::Completed);
    let overview = serde_json::to_value(engine.overview()).unwrap();
    assert_eq!(overview["pipelines"]["completed"][0]["mode"], "SLOW");

    engine.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_submit_step_runs_single_step() {
    let h = Harness::new();
    let engine = h.engine(h.config(1));
    let original = h.original("note.txt", "abc");
    let pkg = package(&engine, Some(original.as_path())).await;

    let job_id = engine
        .submit_step("docs", "publish", Some("convert"), pkg.clone())
        .unwrap();
    let status = wait_for(&engine, &job_id).await;
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.percentage, 100);

    let job = engine.step_job(&job_id).unwrap();
    assert_eq!(job.step().id(), "convert");
    assert_eq!(job.result().unwrap().status, ResultStatus::Ok);
    assert!(job.download().is_some());
    assert!(h.log.lock().is_empty());
    assert!(engine.pipeline_status(&job_id).is_none());

    engine.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_completed_jobs_are_evicted_when_inactive() {
    let h = Harness::new();
    let mut config = h.config(1).with_max_inactive_ms(0);
    config.pipeline_queue = QueueConfig::default().with_max_completed_jobs(1);
    let engine = h.engine(config);

    let first = engine
        .submit_pipeline("docs", Some("slow"), package(&engine, None).await)
        .unwrap();
    wait_for(&engine, &first).await;
    assert!(engine.pipeline_status(&first).is_some());

    // The completed bucket is at its bound, so the next enqueue evicts.
    let second = engine
        .submit_pipeline("docs", Some("slow"), package(&engine, None).await)
        .unwrap();
    assert!(engine.pipeline_status(&first).is_none());
    assert!(engine.pipeline_status(&second).is_some());

    wait_for(&engine, &second).await;
    let third = engine
        .submit_pipeline("docs", Some("slow"), package(&engine, None).await)
        .unwrap();
    assert!(engine.pipeline_status(&second).is_none());
    assert!(engine.pipeline_status(&third).is_some());

    engine.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_discards_jobs_and_returns_working_engine() {
    let h = Harness::new();
    let engine = h.engine(h.config(1));

    let running_id = engine
        .submit_pipeline("docs", Some("long"), package(&engine, None).await)
        .unwrap();
    let waiting_id = engine
        .submit_pipeline("docs", Some("long"), package(&engine, None).await)
        .unwrap();
    let running = engine.pipeline_job(&running_id).unwrap();
    let waiting = engine.pipeline_job(&waiting_id).unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while running.status().state() != JobState::Processing {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let engine = engine.shutdown().await.unwrap();

    assert_eq!(running.status().state(), JobState::Stopped);
    assert_eq!(waiting.status().state(), JobState::Stopped);
    assert!(engine.pipeline_status(&running_id).is_none());
    assert_eq!(engine.pending_count(), 0);

    let pkg = package(&engine, None).await;
    let job_id = engine.submit_pipeline("docs", Some("slow"), pkg).unwrap();
    assert_eq!(wait_for(&engine, &job_id).await.state, JobState::Completed);

    engine.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overview_groups_jobs_by_bucket() {
    let h = Harness::new();
    let engine = h.engine(h.config(1));

    let done = engine
        .submit_step("docs", "publish", Some("check"), package(&engine, None).await)
        .unwrap();
    wait_for(&engine, &done).await;
    let blocker = engine
        .submit_pipeline("docs", Some("long"), package(&engine, None).await)
        .unwrap();
    let queued = engine
        .submit_pipeline("docs", Some("slow"), package(&engine, None).await)
        .unwrap();

    let blocker_job = engine.pipeline_job(&blocker).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while blocker_job.status().state() != JobState::Processing {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let overview = engine.overview();
    assert_eq!(overview.steps.completed.len(), 1);
    assert_eq!(overview.pipelines.running.len(), 1);
    assert_eq!(overview.pipelines.waiting.len(), 1);
    assert_eq!(overview.pipelines.waiting[0].id, queued);

    let json = serde_json::to_value(&overview).unwrap();
    assert_eq!(json["steps"]["completed"][0]["state"], "COMPLETED");
    assert_eq!(json["steps"]["completed"][0]["kind"], "step");
    assert_eq!(json["steps"]["completed"][0]["step_id"], "check");
    assert_eq!(json["pipelines"]["running"][0]["state"], "PROCESSING");
    assert!(json.get("sweeper").is_none());

    engine.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sweeper_spares_active_packages() {
    let h = Harness::new();
    let config = h.config(1).with_sweeper(
        SweeperConfig::default()
            .with_max_inactive_ms(200)
            .with_check_interval_ms(20),
    );
    let engine = h.engine(config);

    let busy = package(&engine, None).await;
    let busy_id = engine
        .submit_pipeline("docs", Some("long"), busy.clone())
        .unwrap();
    let idle = package(&engine, None).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while idle.directory().exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("idle package was not swept");

    assert!(busy.directory().exists());
    assert!(engine.pipeline_status(&busy_id).is_some());
    assert!(engine.config().download_dir().is_dir());
    assert!(engine.config().upload_dir().is_dir());

    engine.close().await;
}

#![cfg(unix)]

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use analysis_worker::pipeline::{
    parse_line, CommandPipeline, EventTranslator, PipelineEvent, PipelineOutcome, Translated,
};
use analysis_worker::task::{KpiField, RecordPatch, TaskRecord, TaskStatus};
use analysis_worker::worker::run_and_ack;
use analysis_worker_test_utils::harness::Harness;
use analysis_worker_test_utils::{init_tracing, with_timeout};
use tempfile::TempDir;

fn write_script(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("pipeline.sh");
    fs::write(&path, body).unwrap();
    path
}

async fn run_script(h: &Harness, body: &str) -> (PipelineOutcome, TaskRecord) {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, body);
    let pipeline = CommandPipeline::new("sh", vec![script.display().to_string()]);

    h.submit("t1", "ref-a").await;
    let task = h
        .queue
        .dequeue(Duration::from_millis(20))
        .await
        .expect("task should dequeue");

    let outcome = with_timeout(run_and_ack(&h.queue, &h.progress, &pipeline, task)).await;
    (outcome, h.cached("t1").await)
}

#[tokio::test]
async fn protocol_lines_drive_progress_and_completion() {
    init_tracing();
    let h = Harness::new();
    let script = r#"
echo "starting analysis of $1 from $2"
echo '{"type":"progress","progress":0.2,"message":"File downloaded, loading data..."}'
echo '{"type":"kpis","kpis":["Revenue","Churn"]}'
echo '{"type":"kpi_started","kpi":"Revenue","progress":0.3}'
echo '{"type":"kpi_result","kpi":"Revenue","field":"visualization_ref","value":"chart://revenue","progress":0.45}'
echo '{"type":"kpi_result","kpi":"Churn","field":"insights","value":"flat","progress":0.8,"message":"Churn done"}'
echo '{"type":"summary","summary":"all good","progress":0.95}'
echo "progress line that is not json" >&2
echo "{\"type\":\"completed\",\"report_ref\":\"report://$1.html\",\"raw_data_ref\":\"raw://$1.json\"}"
"#;

    let (outcome, record) = run_script(&h, script).await;

    assert!(outcome.is_success(), "unexpected outcome {outcome:?}");
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.progress, 1.0);
    assert_eq!(record.identified_kpis, vec!["Revenue", "Churn"]);
    assert_eq!(record.summary.as_deref(), Some("all good"));
    assert_eq!(record.report_ref.as_deref(), Some("report://t1.html"));
    assert_eq!(record.raw_data_ref.as_deref(), Some("raw://t1.json"));
    assert_eq!(
        record.partial("revenue").and_then(|r| r.visualization_ref.as_deref()),
        Some("chart://revenue")
    );
    assert_eq!(
        record.partial("churn").and_then(|r| r.insights.as_deref()),
        Some("flat")
    );
    assert!(record.current_kpi.is_none());
    assert_eq!(h.stored("t1").await.report_ref.as_deref(), Some("report://t1.html"));
}

#[tokio::test]
async fn reported_failure_is_used_verbatim() {
    let h = Harness::new();
    let script = r#"
echo '{"type":"progress","progress":0.3,"message":"Data loaded"}'
echo '{"type":"failed","error_detail":"model quota exceeded","error_trace":"Traceback: quota"}'
exit 1
"#;

    let (outcome, record) = run_script(&h, script).await;

    assert!(!outcome.is_success());
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.error_detail.as_deref(), Some("model quota exceeded"));
    assert_eq!(record.error_trace.as_deref(), Some("Traceback: quota"));
    assert_eq!(record.message, "Analysis failed: model quota exceeded");
    assert_eq!(record.progress, 0.3);
}

#[tokio::test]
async fn non_zero_exit_fails_with_the_stderr_tail() {
    let h = Harness::new();
    let script = r#"
echo "loading" >&2
echo "KeyError: 'visualization_url'" >&2
exit 3
"#;

    let (outcome, record) = run_script(&h, script).await;

    match outcome {
        PipelineOutcome::Failure(failure) => {
            assert!(failure.error_detail.contains("exit status: 3"), "{}", failure.error_detail);
            assert_eq!(failure.error_trace, "loading\nKeyError: 'visualization_url'");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(h.queue.processing_len().await.unwrap(), 0);
}

#[tokio::test]
async fn clean_exit_without_completion_is_a_failure() {
    let h = Harness::new();
    let (outcome, record) = run_script(&h, "echo '{\"type\":\"progress\",\"progress\":0.5}'\n").await;

    assert!(!outcome.is_success());
    assert_eq!(
        record.error_detail.as_deref(),
        Some("pipeline exited without reporting completion")
    );
}

#[tokio::test]
async fn missing_program_fails_the_task() {
    init_tracing();
    let h = Harness::new();
    let pipeline = CommandPipeline::new("/nonexistent/analysis-program", vec![]);

    h.submit("t1", "ref-a").await;
    let task = h.queue.dequeue(Duration::from_millis(20)).await.unwrap();
    let outcome = run_and_ack(&h.queue, &h.progress, &pipeline, task).await;

    assert!(!outcome.is_success());
    let record = h.cached("t1").await;
    assert_eq!(record.status, TaskStatus::Failed);
    assert!(
        record
            .error_detail
            .as_deref()
            .unwrap()
            .contains("spawning pipeline program '/nonexistent/analysis-program'")
    );
}

#[test]
fn parse_line_ignores_plain_output() {
    assert_eq!(parse_line("Loading dataset..."), None);
    assert_eq!(parse_line("{\"type\":\"unknown\"}"), None);
    assert_eq!(parse_line("{broken"), None);
    assert_eq!(
        parse_line("  {\"type\":\"kpis\",\"kpis\":[\"A\"]}  "),
        Some(PipelineEvent::Kpis {
            kpis: vec!["A".to_string()]
        })
    );
}

#[test]
fn translator_keeps_progress_monotonic_and_remembers_the_message() {
    let mut translator = EventTranslator::new();

    let Translated::Update(update) = translator.translate(PipelineEvent::Progress {
        progress: 0.5,
        message: Some("half".to_string()),
    }) else {
        panic!("expected an update");
    };
    assert_eq!(update.progress, Some(0.5));
    assert_eq!(update.message, "half");

    let Translated::Update(update) = translator.translate(PipelineEvent::KpiResult {
        kpi: "A".to_string(),
        field: KpiField::Insights,
        value: "ok".to_string(),
        progress: Some(0.2),
        message: None,
    }) else {
        panic!("expected an update");
    };
    assert_eq!(update.progress, Some(0.5));
    assert_eq!(update.message, "half");
    assert_eq!(
        update.patches,
        vec![RecordPatch::kpi("A", KpiField::Insights, "ok")]
    );
    assert_eq!(translator.progress(), 0.5);
}

//! End-to-end pipeline scenarios: real scheduler, mock collaborators

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::config::ManagerConfig;
use crate::core::events::JobEvent;
use crate::core::manager::DownloadManager;
use crate::core::models::{
    ClipRequest, DownloadRequest, Job, JobStatus, OutputFormat, QualityTier, StorageBackend,
    SubtitleOptions,
};
use crate::core::testing::{MockExtractor, MockSource, RecordingSink};
use crate::source::SourceError;
use crate::storage::SinkRegistry;

fn test_config(work_dir: &std::path::Path, max_concurrent: usize) -> ManagerConfig {
    ManagerConfig {
        max_concurrent_downloads: max_concurrent,
        queue_size_limit: 32,
        work_dir: work_dir.to_path_buf(),
        assumed_job_duration_secs: 60,
        event_channel_capacity: 256,
    }
}

fn make_manager(
    config: ManagerConfig,
    source: MockSource,
    extractor: MockExtractor,
) -> DownloadManager {
    let mut sinks = SinkRegistry::new();
    sinks.register(Arc::new(RecordingSink::new(StorageBackend::Local)));
    DownloadManager::new(config, Arc::new(source), Arc::new(extractor), Arc::new(sinks)).unwrap()
}

fn request(asset_id: &str, clips: Vec<ClipRequest>) -> DownloadRequest {
    DownloadRequest {
        asset_id: asset_id.to_string(),
        clips,
        format: OutputFormat::Mp4,
        quality: QualityTier::Best,
        subtitles: SubtitleOptions::default(),
        backend: StorageBackend::Local,
        target_path: None,
        metadata: HashMap::new(),
    }
}

fn clip(id: &str, start: f64, end: f64) -> ClipRequest {
    ClipRequest {
        id: id.to_string(),
        start_secs: start,
        end_secs: end,
        title: None,
        description: None,
        metadata: HashMap::new(),
    }
}

async fn wait_for<F: Fn(&Job) -> bool>(manager: &DownloadManager, job_id: &str, pred: F) -> Job {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(job) = manager.get(job_id) {
            if pred(&job) {
                return job;
            }
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting on job {}",
            job_id
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_job_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let manager = make_manager(
        test_config(dir.path(), 2),
        MockSource::new(),
        MockExtractor::new(),
    );
    manager.start().await;

    let job = manager.submit(request("https://example.com/video", vec![])).unwrap();
    let done = wait_for(&manager, &job.id, |j| j.status.is_terminal()).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.output_files, vec!["mock://media.mp4".to_string()]);
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());
    // Source metadata was merged in on completion
    assert!(done.metadata.contains_key("title"));

    manager.stop().await;
}

#[tokio::test]
async fn test_concurrency_never_exceeds_cap() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new().with_delay(Duration::from_millis(50));
    let peak = source.peak_concurrency();
    let manager = make_manager(test_config(dir.path(), 2), source, MockExtractor::new());
    manager.start().await;

    let mut ids = Vec::new();
    for i in 0..5 {
        let job = manager
            .submit(request(&format!("https://example.com/{}", i), vec![]))
            .unwrap();
        ids.push(job.id);
    }

    for id in &ids {
        let job = wait_for(&manager, id, |j| j.status.is_terminal()).await;
        assert_eq!(job.status, JobStatus::Completed);
    }
    assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 2);

    manager.stop().await;
}

#[tokio::test]
async fn test_steady_state_holds_two_active_three_pending() {
    let dir = tempfile::tempdir().unwrap();
    let manager = make_manager(
        test_config(dir.path(), 2),
        MockSource::new().holding(),
        MockExtractor::new(),
    );
    manager.start().await;

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            manager
                .submit(request(&format!("https://example.com/{}", i), vec![]))
                .unwrap()
                .id,
        );
    }

    // Wait until both worker slots are occupied
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let status = manager.queue_status();
        if status.active_jobs == 2 {
            assert_eq!(status.pending_jobs, 3);
            break;
        }
        assert!(Instant::now() < deadline, "workers never reached capacity");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    manager.stop().await;
}

#[tokio::test]
async fn test_cancel_active_job_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let manager = make_manager(
        test_config(dir.path(), 1),
        MockSource::new().holding(),
        MockExtractor::new(),
    );
    manager.start().await;

    let job = manager.submit(request("https://example.com/held", vec![])).unwrap();
    wait_for(&manager, &job.id, |j| j.status == JobStatus::Downloading).await;

    assert!(manager.cancel(&job.id));
    let done = wait_for(&manager, &job.id, |j| j.status.is_terminal()).await;
    assert_eq!(done.status, JobStatus::Cancelled);

    // Partial files are gone
    wait_for(&manager, &job.id, |_| !dir.path().join(&job.id).exists()).await;
    // Terminal jobs cannot be cancelled again
    assert!(!manager.cancel(&job.id));

    manager.stop().await;
}

#[tokio::test]
async fn test_source_failure_marks_job_failed_without_breaking_others() {
    let dir = tempfile::tempdir().unwrap();
    let manager = make_manager(
        test_config(dir.path(), 1),
        MockSource::new().failing(SourceError::Unavailable("404".to_string())),
        MockExtractor::new(),
    );
    manager.start().await;

    let first = manager.submit(request("https://example.com/a", vec![])).unwrap();
    let second = manager.submit(request("https://example.com/b", vec![])).unwrap();

    let first = wait_for(&manager, &first.id, |j| j.status.is_terminal()).await;
    assert_eq!(first.status, JobStatus::Failed);
    assert!(first.error.unwrap().contains("404"));
    // A failed fetch never reaches the processing stage
    assert!(first.output_files.is_empty());

    // The loop keeps dispatching after a failure
    let second = wait_for(&manager, &second.id, |j| j.status.is_terminal()).await;
    assert_eq!(second.status, JobStatus::Failed);

    manager.stop().await;
}

#[tokio::test]
async fn test_partial_clip_failure_still_completes() {
    let dir = tempfile::tempdir().unwrap();
    let manager = make_manager(
        test_config(dir.path(), 1),
        MockSource::new(),
        MockExtractor::new().failing_clip("bad"),
    );
    manager.start().await;

    let job = manager
        .submit(request(
            "https://example.com/v",
            vec![clip("good", 0.0, 10.0), clip("bad", 10.0, 20.0)],
        ))
        .unwrap();
    let done = wait_for(&manager, &job.id, |j| j.status.is_terminal()).await;

    // One clip surviving is a success with a reduced output list
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.output_files, vec!["mock://good.mp4".to_string()]);

    manager.stop().await;
}

#[tokio::test]
async fn test_all_clips_failing_fails_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let manager = make_manager(
        test_config(dir.path(), 1),
        MockSource::new(),
        MockExtractor::new().failing_clip("c1").failing_clip("c2"),
    );
    manager.start().await;

    let job = manager
        .submit(request(
            "https://example.com/v",
            vec![clip("c1", 0.0, 10.0), clip("c2", 10.0, 20.0)],
        ))
        .unwrap();
    let done = wait_for(&manager, &job.id, |j| j.status.is_terminal()).await;

    assert_eq!(done.status, JobStatus::Failed);
    assert!(done.error.unwrap().contains("clips failed"));

    manager.stop().await;
}

#[tokio::test]
async fn test_stop_cancels_active_jobs_and_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let manager = make_manager(
        test_config(dir.path(), 1),
        MockSource::new().holding(),
        MockExtractor::new(),
    );
    manager.start().await;
    assert!(manager.is_running());

    let job = manager.submit(request("https://example.com/held", vec![])).unwrap();
    wait_for(&manager, &job.id, |j| j.status == JobStatus::Downloading).await;

    manager.stop().await;
    assert!(!manager.is_running());
    assert_eq!(manager.get(&job.id).unwrap().status, JobStatus::Cancelled);

    // Stopping again is a no-op
    manager.stop().await;
}

#[tokio::test]
async fn test_immediate_stop_leaves_no_job_active() {
    let dir = tempfile::tempdir().unwrap();
    let manager = make_manager(
        test_config(dir.path(), 2),
        MockSource::new().holding(),
        MockExtractor::new(),
    );
    manager.start().await;

    for i in 0..4 {
        manager
            .submit(request(&format!("https://example.com/{}", i), vec![]))
            .unwrap();
    }

    // Stop races the dispatch loop: workers may exist that have not yet
    // started fetching. stop() must still cancel and reap all of them.
    manager.stop().await;

    for job in manager.list(None, None) {
        assert!(
            !job.status.is_active(),
            "job {} still active after stop",
            job.id
        );
    }
}

#[tokio::test]
async fn test_restart_resumes_dispatching() {
    let dir = tempfile::tempdir().unwrap();
    let manager = make_manager(
        test_config(dir.path(), 2),
        MockSource::new(),
        MockExtractor::new(),
    );

    manager.start().await;
    manager.stop().await;
    manager.start().await;

    let job = manager.submit(request("https://example.com/v", vec![])).unwrap();
    let done = wait_for(&manager, &job.id, |j| j.status.is_terminal()).await;
    assert_eq!(done.status, JobStatus::Completed);

    manager.stop().await;
}

#[tokio::test]
async fn test_events_follow_job_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let manager = make_manager(
        test_config(dir.path(), 1),
        MockSource::new(),
        MockExtractor::new(),
    );
    let mut events = manager.subscribe();
    manager.start().await;

    let job = manager.submit(request("https://example.com/v", vec![])).unwrap();
    wait_for(&manager, &job.id, |j| j.status.is_terminal()).await;

    let mut saw_submitted = false;
    let mut saw_completed = false;
    while !(saw_submitted && saw_completed) {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for events")
            .unwrap();
        match event {
            JobEvent::Submitted { job: submitted } => {
                assert_eq!(submitted.id, job.id);
                saw_submitted = true;
            }
            JobEvent::Completed { job_id, output_files } => {
                assert_eq!(job_id, job.id);
                assert!(!output_files.is_empty());
                saw_completed = true;
            }
            _ => {}
        }
    }

    manager.stop().await;
}

#[tokio::test]
async fn test_whole_asset_job_skips_no_stage() {
    let dir = tempfile::tempdir().unwrap();
    let manager = make_manager(
        test_config(dir.path(), 1),
        MockSource::new(),
        MockExtractor::new(),
    );
    let mut events = manager.subscribe();
    manager.start().await;

    let job = manager.submit(request("https://example.com/v", vec![])).unwrap();
    wait_for(&manager, &job.id, |j| j.status == JobStatus::Completed).await;

    // Even clipless jobs pass through the processing state
    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let JobEvent::StatusChanged { status, .. } = event {
            statuses.push(status);
        }
    }
    assert!(statuses.contains(&JobStatus::Downloading));
    assert!(statuses.contains(&JobStatus::Processing));

    manager.stop().await;
}

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{
    fast_uploader_settings, fragment_payload, Harness, InProcessTransport, FRAGMENT_SECONDS,
};
use ivcap_core::{
    CreateSessionRequest, DrainReport, FinalizeOutcome, FinalizeRequest, Fragment, GapPolicy,
    JobFilter, JobStatus, SessionStatus, Uploader,
};

const FRAGMENTS: u64 = 12;

fn start(harness: &Harness, session_id: &str) {
    harness
        .coordinator()
        .create_session(&CreateSessionRequest {
            session_id: Some(session_id.into()),
            user_id: "candidate-1".into(),
        })
        .unwrap();
}

fn finalize(harness: &Harness, session_id: &str, failed: u64) -> FinalizeOutcome {
    harness
        .coordinator()
        .finalize(
            session_id,
            &FinalizeRequest {
                user_id: "candidate-1".into(),
                failed_fragments: failed,
            },
        )
        .unwrap()
}

/// Uploads `indices` in the given order through a concurrent uploader.
async fn upload(
    transport: Arc<InProcessTransport>,
    session_id: &str,
    indices: &[u64],
) -> DrainReport {
    let uploader = Uploader::new(transport, fast_uploader_settings(4));
    for &index in indices {
        uploader
            .enqueue(Fragment::new(
                session_id,
                index,
                fragment_payload(index, FRAGMENT_SECONDS),
            ))
            .unwrap();
    }
    let report = uploader.drain().await;
    assert_eq!(report.total, indices.len() as u64);
    report
}

fn expected_bytes(indices: impl IntoIterator<Item = u64>) -> Vec<u8> {
    indices
        .into_iter()
        .flat_map(|index| fragment_payload(index, FRAGMENT_SECONDS).to_vec())
        .collect()
}

#[tokio::test]
async fn out_of_order_fragments_merge_in_index_order() {
    let harness = Harness::new();
    start(&harness, "interview-a");
    let order = [3, 0, 11, 1, 7, 2, 10, 4, 9, 5, 8, 6];
    let report = upload(harness.transport(), "interview-a", &order).await;
    assert_eq!(report.uploaded, FRAGMENTS);
    assert!(report.failed_indices.is_empty());

    let outcome = finalize(&harness, "interview-a", report.failed());
    assert!(!outcome.deduplicated);
    let stats = harness.services.workers.run_until_idle().await.unwrap();
    assert_eq!(stats.completed, 1);

    assert_eq!(harness.tools.last_input(), expected_bytes(0..FRAGMENTS));
    let view = harness.coordinator().status("interview-a").unwrap();
    assert_eq!(view.session.status, SessionStatus::Ready);
    assert_eq!(view.session.fragments_received, FRAGMENTS);
    // 60 s of media in 6 s segments.
    assert_eq!(view.session.segment_count, 10);
    assert!((view.session.duration_s.unwrap() - 60.0).abs() < 1e-6);
    assert_eq!(
        view.session.playback_url.as_deref(),
        Some("https://media.example.com/recordings/interview-a/index.m3u8")
    );
    let job = view.job.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);

    let output = harness.config.output_dir().join("interview-a");
    assert!(output.join("index.m3u8").exists());
    assert!(output.join("manifest.json").exists());
    assert!(!harness.config.staging_dir().join("interview-a").exists());
}

#[tokio::test]
async fn permanently_failed_fragment_still_produces_playback() {
    let harness = Harness::new();
    start(&harness, "interview-b");
    let transport =
        Arc::new(InProcessTransport::new(harness.coordinator().clone()).refusing([7]));
    let indices: Vec<u64> = (0..FRAGMENTS).collect();
    let report = upload(transport.clone(), "interview-b", &indices).await;
    assert_eq!(report.failed_indices, vec![7]);
    assert_eq!(report.uploaded, FRAGMENTS - 1);

    finalize(&harness, "interview-b", report.failed());
    harness.services.workers.run_until_idle().await.unwrap();

    let session = harness.coordinator().status("interview-b").unwrap().session;
    assert_eq!(session.status, SessionStatus::Ready);
    assert_eq!(session.failed_fragments, 1);
    assert_eq!(session.fragments_received, FRAGMENTS - 1);
    assert_eq!(
        harness.tools.last_input(),
        expected_bytes((0..FRAGMENTS).filter(|index| *index != 7))
    );
    // 55 s: nine full segments and a short tail.
    assert_eq!(session.segment_count, 10);
}

#[tokio::test]
async fn concurrent_finalize_enqueues_one_job() {
    let harness = Harness::new();
    start(&harness, "interview-c");
    let indices: Vec<u64> = (0..3).collect();
    upload(harness.transport(), "interview-c", &indices).await;

    let coordinator = harness.coordinator().clone();
    let (first, second) = futures::future::join(
        tokio::task::spawn_blocking({
            let coordinator = coordinator.clone();
            move || {
                coordinator.finalize(
                    "interview-c",
                    &FinalizeRequest {
                        user_id: "candidate-1".into(),
                        failed_fragments: 0,
                    },
                )
            }
        }),
        tokio::task::spawn_blocking({
            let coordinator = coordinator.clone();
            move || {
                coordinator.finalize(
                    "interview-c",
                    &FinalizeRequest {
                        user_id: "candidate-1".into(),
                        failed_fragments: 0,
                    },
                )
            }
        }),
    )
    .await;
    let first = first.unwrap().unwrap();
    let second = second.unwrap().unwrap();
    assert_eq!(first.job_id, second.job_id);
    assert!(first.deduplicated ^ second.deduplicated);

    let jobs = coordinator
        .jobs()
        .list(&JobFilter {
            session_id: Some("interview-c".into()),
            ..JobFilter::default()
        })
        .unwrap();
    assert_eq!(jobs.len(), 1);

    harness.services.workers.run_until_idle().await.unwrap();
    let again = finalize(&harness, "interview-c", 0);
    assert!(again.deduplicated);
    assert_eq!(again.status, SessionStatus::Ready);
    assert_eq!(again.job_id, first.job_id);
    assert_eq!(harness.tools.encodes(), 1);
}

#[tokio::test]
async fn encoder_failure_is_retried_until_success() {
    let harness = Harness::new();
    harness.tools.encoder_failures.store(1, Ordering::SeqCst);
    start(&harness, "interview-d");
    upload(harness.transport(), "interview-d", &[0, 1, 2]).await;
    finalize(&harness, "interview-d", 0);

    let stats = harness.services.workers.run_until_idle().await.unwrap();
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.completed, 1);

    let view = harness.coordinator().status("interview-d").unwrap();
    assert_eq!(view.session.status, SessionStatus::Ready);
    let job = view.job.unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn encoder_failing_every_attempt_fails_the_session() {
    let harness = Harness::with_config(|config| config.worker.max_job_attempts = 2);
    harness.tools.encoder_failures.store(u32::MAX, Ordering::SeqCst);
    start(&harness, "interview-e");
    upload(harness.transport(), "interview-e", &[0, 1]).await;
    finalize(&harness, "interview-e", 0);

    let stats = harness.services.workers.run_until_idle().await.unwrap();
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.failed, 1);

    let view = harness.coordinator().status("interview-e").unwrap();
    assert_eq!(view.session.status, SessionStatus::Failed);
    assert!(view
        .session
        .failure_reason
        .unwrap()
        .contains("Conversion failed!"));
    assert_eq!(view.job.unwrap().status, JobStatus::Failed);
    // Fragments stay staged for inspection.
    assert!(harness
        .config
        .staging_dir()
        .join("interview-e")
        .join("fragments")
        .exists());
}

#[tokio::test]
async fn worker_panic_requeues_the_job() {
    let harness = Harness::new();
    harness.tools.encoder_panics.store(1, Ordering::SeqCst);
    start(&harness, "interview-f");
    upload(harness.transport(), "interview-f", &[0, 1, 2, 3]).await;
    finalize(&harness, "interview-f", 0);

    let stats = harness.services.workers.run_until_idle().await.unwrap();
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(
        harness.coordinator().status("interview-f").unwrap().session.status,
        SessionStatus::Ready
    );
}

#[tokio::test]
async fn missing_header_fragment_fails_without_retry() {
    let harness = Harness::new();
    start(&harness, "interview-g");
    upload(harness.transport(), "interview-g", &[1, 2, 3]).await;
    finalize(&harness, "interview-g", 1);

    let stats = harness.services.workers.run_until_idle().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.requeued, 0);
    assert_eq!(harness.tools.encodes(), 0);

    let view = harness.coordinator().status("interview-g").unwrap();
    assert_eq!(view.session.status, SessionStatus::Failed);
    let job = view.job.unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn gaps_are_rejected_under_strict_policy() {
    let harness = Harness::with_config(|config| {
        config.merge.gap_policy = GapPolicy::Reject;
    });
    start(&harness, "interview-h");
    upload(harness.transport(), "interview-h", &[0, 1, 3]).await;
    finalize(&harness, "interview-h", 1);
    harness.services.workers.run_until_idle().await.unwrap();

    let session = harness.coordinator().status("interview-h").unwrap().session;
    assert_eq!(session.status, SessionStatus::Failed);
    assert!(session.failure_reason.unwrap().contains("[2]"));
}

#[tokio::test]
async fn merged_file_without_video_fails_the_session() {
    let harness = Harness::new();
    harness.tools.no_video.store(true, Ordering::SeqCst);
    start(&harness, "interview-i");
    upload(harness.transport(), "interview-i", &[0, 1]).await;
    finalize(&harness, "interview-i", 0);
    harness.services.workers.run_until_idle().await.unwrap();

    let session = harness.coordinator().status("interview-i").unwrap().session;
    assert_eq!(session.status, SessionStatus::Failed);
    assert!(session.failure_reason.unwrap().contains("no video stream"));
}

#[tokio::test]
async fn recovered_jobs_are_processed_after_restart() {
    let harness = Harness::new();
    start(&harness, "interview-j");
    upload(harness.transport(), "interview-j", &[0, 1, 2]).await;
    let outcome = finalize(&harness, "interview-j", 0);

    // A previous process claimed the job and died.
    let jobs = harness.coordinator().jobs();
    let claimed = jobs.claim_next().unwrap().unwrap();
    assert_eq!(Some(claimed.id), outcome.job_id);
    assert!(jobs.claim_next().unwrap().is_none());
    assert_eq!(jobs.recover_running().unwrap(), 1);

    harness.services.workers.run_until_idle().await.unwrap();
    let view = harness.coordinator().status("interview-j").unwrap();
    assert_eq!(view.session.status, SessionStatus::Ready);
    assert_eq!(view.job.unwrap().attempts, 2);
}

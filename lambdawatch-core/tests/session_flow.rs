use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::time::timeout;

use lambdawatch_core::orchestration::{ChannelProgressSink, ProgressReport};
use lambdawatch_core::{
    CompletionConfig, DatasetJob, DatasetKey, DatasetProcessor, DatasetStatus, DispatchConfig,
    FsWatchConfig, NamingConvention, ProcessingError, SessionConfig, SessionPhase, WatchError,
    WatchEvent, WatchEventKind, WatchMessage, WatchSession,
};

fn fast_config(workers: usize) -> SessionConfig {
    SessionConfig {
        naming: NamingConvention::default(),
        completion: CompletionConfig {
            quiescence_window_ms: 50,
            evaluation_interval_ms: 10,
            retention_ms: None,
        },
        dispatch: DispatchConfig {
            max_concurrent_jobs: workers,
            shutdown_grace_ms: 5_000,
        },
        watch: FsWatchConfig {
            recursive: true,
            rescan_on_start: true,
            channel_capacity: 256,
        },
    }
}

#[derive(Default)]
struct Recorder {
    running: AtomicUsize,
    peak: AtomicUsize,
    processed: parking_lot::Mutex<Vec<DatasetKey>>,
    fail_stem: Option<String>,
    done_stems: Vec<String>,
}

#[async_trait]
impl DatasetProcessor for Recorder {
    async fn process(&self, job: &DatasetJob) -> Result<(), ProcessingError> {
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.processed.lock().push(job.key.clone());

        if self.fail_stem.as_deref() == Some(job.key.stem()) {
            return Err(ProcessingError::failed("integration failed"));
        }
        Ok(())
    }

    async fn already_processed(&self, key: &DatasetKey) -> bool {
        self.done_stems.iter().any(|stem| stem == key.stem())
    }
}

fn send_parts(tx: &mpsc::Sender<WatchMessage>, dir: &Path, stem: &str) {
    for idx in 1..=3 {
        let event = WatchEvent::new(
            dir.join(format!("{stem}_m{idx}.nxs")),
            WatchEventKind::Created,
            Utc::now(),
        );
        tx.try_send(WatchMessage::Event(event)).expect("channel has room");
    }
}

async fn wait_for_terminal(
    rx: &mut mpsc::UnboundedReceiver<ProgressReport>,
    count: usize,
) -> Vec<ProgressReport> {
    let mut finished = Vec::new();
    timeout(Duration::from_secs(10), async {
        while finished.len() < count {
            let report = rx.recv().await.expect("progress channel open");
            if report.status.is_terminal() {
                finished.push(report);
            }
        }
    })
    .await
    .expect("datasets finished in time");
    finished
}

#[tokio::test]
async fn events_flow_to_exactly_one_job_per_dataset() {
    let (tx, rx) = mpsc::channel(64);
    let (sink, mut progress) = ChannelProgressSink::new();
    let recorder = Arc::new(Recorder::default());
    let session = WatchSession::builder(fast_config(1))
        .with_processor(recorder.clone())
        .with_progress(Arc::new(sink))
        .start(rx)
        .expect("session");

    let dir = PathBuf::from("/beam/run1");
    send_parts(&tx, &dir, "a");
    send_parts(&tx, &dir, "b");
    send_parts(&tx, &dir, "a");

    wait_for_terminal(&mut progress, 2).await;
    assert_eq!(recorder.peak.load(Ordering::SeqCst), 1);

    let mut processed = recorder.processed.lock().clone();
    processed.sort();
    assert_eq!(
        processed,
        vec![
            DatasetKey::new(&dir, "a", None),
            DatasetKey::new(&dir, "b", None)
        ]
    );

    let stats = session.stats();
    assert_eq!(stats.registry.counts.completed, 2);
    assert_eq!(stats.phase, SessionPhase::Running);

    let registry = session.stop(Duration::from_secs(5)).await;
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn incomplete_dataset_is_never_dispatched() {
    let (tx, rx) = mpsc::channel(64);
    let recorder = Arc::new(Recorder::default());
    let session = WatchSession::builder(fast_config(2))
        .with_processor(recorder.clone())
        .start(rx)
        .expect("session");

    for idx in 1..=2 {
        let event = WatchEvent::new(
            format!("/beam/s_m{idx}.nxs"),
            WatchEventKind::Created,
            Utc::now(),
        );
        tx.send(WatchMessage::Event(event)).await.expect("send");
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(recorder.processed.lock().is_empty());
    let key = DatasetKey::new("/beam", "s", None);
    assert_eq!(session.registry().status(&key), Some(DatasetStatus::Pending));
    session.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn event_source_failure_halts_session_but_keeps_registry() {
    let (tx, rx) = mpsc::channel(64);
    let session = WatchSession::builder(fast_config(1))
        .with_processor(Arc::new(Recorder::default()))
        .start(rx)
        .expect("session");

    let event = WatchEvent::new("/beam/s_m1.nxs", WatchEventKind::Created, Utc::now());
    tx.send(WatchMessage::Event(event)).await.expect("send");
    tx.send(WatchMessage::Failed("inotify queue overflow".into()))
        .await
        .expect("send");

    let phase = timeout(Duration::from_secs(5), session.wait_for_exit())
        .await
        .expect("session exited");
    assert_eq!(
        phase,
        SessionPhase::Failed {
            reason: "inotify queue overflow".into()
        }
    );

    let late = WatchEvent::new("/beam/s_m2.nxs", WatchEventKind::Created, Utc::now());
    let _ = tx.send(WatchMessage::Event(late)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let key = DatasetKey::new("/beam", "s", None);
    let state = session.registry().get(&key).expect("retained");
    assert_eq!(state.parts_seen(), 1);

    let registry = session.stop(Duration::from_secs(1)).await;
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn closed_event_stream_is_a_failure() {
    let (tx, rx) = mpsc::channel::<WatchMessage>(4);
    let session = WatchSession::builder(fast_config(1))
        .with_processor(Arc::new(Recorder::default()))
        .start(rx)
        .expect("session");
    drop(tx);

    let phase = timeout(Duration::from_secs(5), session.wait_for_exit())
        .await
        .expect("session exited");
    assert!(matches!(phase, SessionPhase::Failed { .. }));
    session.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn stopped_session_resumes_from_its_registry() {
    let mut config = fast_config(1);
    config.completion.quiescence_window_ms = 60_000;

    let (tx, rx) = mpsc::channel(64);
    let recorder = Arc::new(Recorder::default());
    let first = WatchSession::builder(config.clone())
        .with_processor(recorder.clone())
        .start(rx)
        .expect("first session");
    send_parts(&tx, Path::new("/beam"), "s");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let registry = first.stop(Duration::from_secs(1)).await;

    let key = DatasetKey::new("/beam", "s", None);
    assert_eq!(registry.status(&key), Some(DatasetStatus::Pending));
    assert!(recorder.processed.lock().is_empty());

    config.completion.quiescence_window_ms = 0;
    let (_tx, rx) = mpsc::channel(64);
    let (sink, mut progress) = ChannelProgressSink::new();
    let second = WatchSession::builder(config)
        .with_registry(registry)
        .with_processor(recorder.clone())
        .with_progress(Arc::new(sink))
        .start(rx)
        .expect("second session");

    wait_for_terminal(&mut progress, 1).await;
    assert_eq!(
        second.registry().status(&key),
        Some(DatasetStatus::Completed)
    );
    second.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn requeue_reprocesses_a_failed_dataset() {
    let dir = tempdir().expect("tempdir");
    for idx in 1..=3 {
        fs::write(dir.path().join(format!("s_m{idx}.nxs")), b"data").expect("write");
    }

    let (tx, rx) = mpsc::channel(64);
    let (sink, mut progress) = ChannelProgressSink::new();
    let recorder = Arc::new(Recorder {
        fail_stem: Some("s".into()),
        ..Recorder::default()
    });
    let session = WatchSession::builder(fast_config(1))
        .with_processor(recorder.clone())
        .with_progress(Arc::new(sink))
        .start(rx)
        .expect("session");

    send_parts(&tx, dir.path(), "s");
    let finished = wait_for_terminal(&mut progress, 1).await;
    assert_eq!(finished[0].status, DatasetStatus::Failed);

    let key = DatasetKey::new(dir.path(), "s", None);
    send_parts(&tx, dir.path(), "s");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.processed.lock().len(), 1, "failures are not retried");

    assert!(session.requeue(&key).await.expect("requeue"));
    wait_for_terminal(&mut progress, 1).await;
    assert_eq!(recorder.processed.lock().len(), 2);

    assert!(!session.requeue(&DatasetKey::new("/x", "y", None)).await.expect("noop"));
    session.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn requeue_requires_a_running_session() {
    let (tx, rx) = mpsc::channel::<WatchMessage>(4);
    let session = WatchSession::builder(fast_config(1))
        .with_processor(Arc::new(Recorder::default()))
        .start(rx)
        .expect("session");
    tx.send(WatchMessage::Failed("gone".into())).await.expect("send");
    session.wait_for_exit().await;

    let err = session
        .requeue(&DatasetKey::new("/beam", "s", None))
        .await
        .expect_err("inactive");
    assert!(matches!(err, WatchError::SessionInactive(_)));
    session.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn builder_requires_a_processor() {
    let (_tx, rx) = mpsc::channel::<WatchMessage>(4);
    let err = WatchSession::builder(SessionConfig::default())
        .start(rx)
        .expect_err("missing processor");
    assert!(matches!(err, WatchError::Internal(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_directory_seeds_from_existing_files() {
    let dir = tempdir().expect("tempdir");
    for stem in ["fresh", "done"] {
        for idx in 1..=3 {
            fs::write(dir.path().join(format!("{stem}_m{idx}.nxs")), b"data").expect("write");
        }
    }
    fs::write(dir.path().join("fresh_m1.log"), b"noise").expect("write");

    let (sink, mut progress) = ChannelProgressSink::new();
    let recorder = Arc::new(Recorder {
        done_stems: vec!["done".into()],
        ..Recorder::default()
    });
    let session = WatchSession::builder(fast_config(1))
        .with_processor(recorder.clone())
        .with_progress(Arc::new(sink))
        .watch_directory(dir.path())
        .await
        .expect("watch session");

    let finished = wait_for_terminal(&mut progress, 1).await;
    assert_eq!(finished[0].key.stem(), "fresh");
    assert!(
        session
            .registry()
            .get(&DatasetKey::new(dir.path(), "done", None))
            .is_none()
    );

    session.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn watch_directory_rejects_missing_root() {
    let dir = tempdir().expect("tempdir");
    let err = WatchSession::builder(fast_config(1))
        .with_processor(Arc::new(Recorder::default()))
        .watch_directory(&dir.path().join("absent"))
        .await
        .expect_err("missing dir");
    assert!(matches!(err, WatchError::MissingDirectory(_)));
}

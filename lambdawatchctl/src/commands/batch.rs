use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use lambdawatch_config::AppConfig;
use lambdawatch_core::orchestration::{ChannelProgressSink, TracingProgressSink};
use lambdawatch_core::{
    DatasetKey, DatasetStatus, ModuleSuffixClassifier, PathClassifier, ProgressSink, WatchEvent,
    WatchMessage, WatchSession,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{Grouping, log_registry_summary};
use crate::processor::CommandProcessor;

#[derive(Debug, Default)]
struct BatchOutcome {
    completed: usize,
    failed: Vec<DatasetKey>,
    unfinished: usize,
    interrupted: bool,
}

/// Group `files` into datasets and push the complete ones through a session.
/// Quiescence is measured from each file's modification time, so files that
/// settled long ago are dispatched on the first sweep.
pub async fn run(config: AppConfig, files: Vec<PathBuf>) -> anyhow::Result<()> {
    let classifier = Arc::new(
        ModuleSuffixClassifier::new(config.session.naming.clone())
            .context("invalid naming convention")?,
    );
    let required = classifier.required_parts();

    let paths = files
        .iter()
        .map(|path| {
            std::path::absolute(path)
                .with_context(|| format!("cannot resolve {}", path.display()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let grouping = Grouping::from_paths(classifier.as_ref(), paths);

    for path in &grouping.unrecognized {
        warn!(path = %path.display(), "not a dataset part; ignored");
    }

    let mut expected = BTreeSet::new();
    let mut events = Vec::new();
    for (key, parts) in &grouping.datasets {
        if !Grouping::is_complete(parts, required) {
            warn!(
                dataset = %key,
                missing_modules = ?Grouping::missing(parts, required),
                "incomplete dataset; skipped"
            );
            continue;
        }
        for path in parts.values() {
            let event = WatchEvent::from_existing(path)
                .with_context(|| format!("cannot stat {}", path.display()))?;
            events.push(event);
        }
        expected.insert(key.clone());
    }

    if expected.is_empty() {
        warn!("no complete datasets among the given files");
        return Ok(());
    }
    info!(datasets = expected.len(), "processing complete datasets");

    let processor = Arc::new(CommandProcessor::from_config(&config.processor)?);
    let (sink, mut reports) = ChannelProgressSink::new();
    let (tx, rx) = mpsc::channel(config.session.watch.channel_capacity);
    let session = WatchSession::builder(config.session.clone())
        .with_classifier(classifier)
        .with_processor(processor)
        .with_progress(Arc::new(sink))
        .start(rx)
        .context("failed to start session")?;

    for event in events {
        tx.send(WatchMessage::Event(event))
            .await
            .context("session stopped accepting events")?;
    }

    let mut outcome = BatchOutcome::default();
    let mut remaining = expected;
    while !remaining.is_empty() {
        tokio::select! {
            report = reports.recv() => {
                let Some(report) = report else { break };
                TracingProgressSink.report(report.clone());
                match report.status {
                    DatasetStatus::Completed if remaining.remove(&report.key) => {
                        outcome.completed += 1;
                    }
                    DatasetStatus::Failed if remaining.remove(&report.key) => {
                        outcome.failed.push(report.key);
                    }
                    _ => {}
                }
            }
            phase = session.wait_for_exit() => {
                warn!(%phase, "session exited before every dataset finished");
                break;
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                outcome.interrupted = true;
                break;
            }
        }
    }
    outcome.unfinished = remaining.len();

    let registry = session.stop_default().await;
    drop(tx);
    log_registry_summary(&registry);

    info!(
        completed = outcome.completed,
        failed = outcome.failed.len(),
        unfinished = outcome.unfinished,
        "batch finished"
    );
    for key in &outcome.failed {
        warn!(dataset = %key, "dataset failed");
    }

    if outcome.interrupted {
        bail!("interrupted with {} dataset(s) unfinished", outcome.unfinished);
    }
    if !outcome.failed.is_empty() || outcome.unfinished > 0 {
        bail!(
            "{} dataset(s) failed, {} unfinished",
            outcome.failed.len(),
            outcome.unfinished
        );
    }
    Ok(())
}

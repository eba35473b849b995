use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use lambdawatch_config::AppConfig;
use lambdawatch_core::orchestration::TracingProgressSink;
use lambdawatch_core::{DatasetProcessor, SessionPhase, SharedRegistry, WatchSession};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use super::log_registry_summary;
use crate::processor::CommandProcessor;

const RESTART_BACKOFF: Duration = Duration::from_secs(1);
const STATS_INTERVAL: Duration = Duration::from_secs(60);

enum Exit {
    Interrupted,
    Exited(SessionPhase),
}

/// Run sessions on `dir` until Ctrl-C. A failed event source restarts the
/// session from the retained registry, at most `max_restarts` times.
pub async fn run(config: AppConfig, dir: PathBuf) -> anyhow::Result<()> {
    let processor: Arc<dyn DatasetProcessor> =
        Arc::new(CommandProcessor::from_config(&config.processor)?);

    restart_sessions(config.max_restarts, RESTART_BACKOFF, |previous| {
        let mut builder = WatchSession::builder(config.session.clone())
            .with_processor(Arc::clone(&processor))
            .with_progress(Arc::new(TracingProgressSink));
        if let Some(previous) = previous {
            builder = builder.with_registry(previous);
        }
        let dir = dir.clone();
        async move {
            let session = builder
                .watch_directory(&dir)
                .await
                .with_context(|| format!("failed to start watching {}", dir.display()))?;
            info!(dir = %dir.display(), "watching for datasets");
            Ok(session)
        }
    })
    .await
}

/// Supervise sessions produced by `start`. `start` receives the registry
/// retained from the previous session, or `None` for the first one.
async fn restart_sessions<F, Fut>(
    max_restarts: u32,
    backoff: Duration,
    mut start: F,
) -> anyhow::Result<()>
where
    F: FnMut(Option<SharedRegistry>) -> Fut,
    Fut: Future<Output = anyhow::Result<WatchSession>>,
{
    let mut registry: Option<SharedRegistry> = None;
    let mut restarts = 0u32;

    loop {
        let session = start(registry.take()).await?;
        debug!(restarts, "session started");

        let exit = supervise(&session).await?;
        let retained = session.stop_default().await;
        log_registry_summary(&retained);

        match exit {
            Exit::Interrupted => {
                info!("interrupted; shut down cleanly");
                return Ok(());
            }
            Exit::Exited(SessionPhase::Failed { reason }) => {
                if restarts >= max_restarts {
                    bail!("event source failed: {reason}");
                }
                restarts += 1;
                warn!(
                    restarts,
                    max_restarts,
                    "event source failed ({reason}); restarting from the retained registry"
                );
                registry = Some(retained);
                tokio::time::sleep(backoff).await;
            }
            Exit::Exited(phase) => {
                info!(%phase, "session exited");
                return Ok(());
            }
        }
    }
}

async fn supervise(session: &WatchSession) -> anyhow::Result<Exit> {
    let mut stats = interval(STATS_INTERVAL);
    stats.set_missed_tick_behavior(MissedTickBehavior::Delay);
    stats.tick().await;

    loop {
        tokio::select! {
            phase = session.wait_for_exit() => return Ok(Exit::Exited(phase)),
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                return Ok(Exit::Interrupted);
            }
            _ = stats.tick() => {
                let snapshot = session.stats();
                debug!(
                    phase = %snapshot.phase,
                    queued = snapshot.queued_jobs,
                    active = snapshot.active_jobs,
                    tracked_paths = snapshot.intake.tracked_paths,
                    stale_dropped = snapshot.intake.stale_dropped,
                    "session stats"
                );
                log_registry_summary(session.registry());
            }
        }
    }
}

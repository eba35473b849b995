//! Runtime pieces that move datasets through their lifecycle: the evaluator
//! that ingests events and sweeps for readiness, the dispatcher's worker
//! pool, progress reporting, and the session that owns them all.

pub mod config;
pub mod dispatcher;
pub mod evaluator;
pub mod progress;
pub mod session;

pub use config::{CompletionConfig, DispatchConfig, FsWatchConfig, SessionConfig};
pub use dispatcher::{DatasetProcessor, DispatchIntake, Dispatcher, SubmitOutcome};
pub use evaluator::{CompletionEvaluator, EvaluatorDiagnostics, IngestOutcome, SweepReport};
pub use progress::{
    ChannelProgressSink, NoopProgressSink, ProgressReport, ProgressSink, TracingProgressSink,
};
pub use session::{SeedReport, SessionPhase, SessionStats, WatchSession, WatchSessionBuilder};

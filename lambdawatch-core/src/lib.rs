//! # Lambdawatch Core
//!
//! Dataset-completion detection and job dispatch for multi-module detector
//! acquisitions.
//!
//! ## Overview
//!
//! A detector with `K` modules writes one file per module for every
//! acquisition. Files arrive incrementally and may be rewritten while the
//! detector is still streaming. This crate decides when all `K` parts of an
//! acquisition are present and have stopped changing, then hands the dataset
//! to a processor exactly once.
//!
//! ## Architecture
//!
//! - [`dataset`]: keys, the naming-convention classifier, per-path stability
//!   tracking, and the lifecycle registry
//! - [`orchestration`]: event intake and readiness sweeps, the worker pool,
//!   progress reporting, and [`WatchSession`]
//! - [`fs_watch`]: the `notify`-backed event source and directory re-scan
//!
//! Data flows `fs_watch -> CompletionEvaluator -> SharedRegistry ->
//! Dispatcher -> DatasetProcessor`, with lifecycle notifications going to a
//! [`ProgressSink`].
//!
//! ## Examples
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use lambdawatch_core::{
//!     DatasetJob, DatasetProcessor, ProcessingError, SessionConfig, WatchSession,
//! };
//!
//! struct Integrate;
//!
//! #[async_trait]
//! impl DatasetProcessor for Integrate {
//!     async fn process(&self, job: &DatasetJob) -> Result<(), ProcessingError> {
//!         println!("integrating {}", job.key);
//!         Ok(())
//!     }
//! }
//!
//! async fn run() -> lambdawatch_core::Result<()> {
//!     let session = WatchSession::builder(SessionConfig::default())
//!         .with_processor(Arc::new(Integrate))
//!         .watch_directory(Path::new("/data/beamtime"))
//!         .await?;
//!     let phase = session.wait_for_exit().await;
//!     println!("session ended: {phase}");
//!     session.stop(std::time::Duration::from_secs(30)).await;
//!     Ok(())
//! }
//! ```

#![allow(missing_docs)]

pub mod dataset;
pub mod error;
pub mod fs_watch;
pub mod orchestration;

pub use dataset::{
    Classification, DatasetJob, DatasetKey, DatasetRegistry, DatasetState, DatasetStatus,
    JobId, ModuleSuffixClassifier, NamingConvention, PartIndex, PathClassifier, SharedRegistry,
    StabilityTracker,
};
pub use error::{ProcessingError, Result, WatchError};
pub use fs_watch::{FsWatchService, WatchEvent, WatchEventKind, WatchMessage};
pub use orchestration::{
    CompletionConfig, CompletionEvaluator, DatasetProcessor, DispatchConfig, Dispatcher,
    FsWatchConfig, ProgressReport, ProgressSink, SessionConfig, SessionPhase, WatchSession,
};

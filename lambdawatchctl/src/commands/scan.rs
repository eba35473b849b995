use std::path::{Path, PathBuf};

use anyhow::Context;
use lambdawatch_config::AppConfig;
use lambdawatch_core::fs_watch::rescan;
use lambdawatch_core::{DatasetKey, DatasetProcessor, ModuleSuffixClassifier, PathClassifier};
use serde::Serialize;
use tokio::task::spawn_blocking;
use tracing::warn;

use super::Grouping;
use crate::processor::CommandProcessor;

#[derive(Debug, Serialize)]
struct DatasetListing {
    dataset: String,
    key: DatasetKey,
    complete: bool,
    parts: Vec<PathBuf>,
    missing_modules: Vec<u8>,
    /// `None` when no `skip_if_exists` marker is configured.
    processed: Option<bool>,
}

/// Dry run: list every dataset found under `dir` with its completeness.
pub async fn run(config: AppConfig, dir: PathBuf, json: bool) -> anyhow::Result<()> {
    let classifier = ModuleSuffixClassifier::new(config.session.naming.clone())
        .context("invalid naming convention")?;
    let required = classifier.required_parts();
    let recursive = config.session.watch.recursive;

    let root = dir.clone();
    let scan_classifier = classifier.clone();
    let report = spawn_blocking(move || rescan(&root, recursive, &scan_classifier))
        .await
        .context("scan task failed")?
        .with_context(|| format!("failed to scan {}", dir.display()))?;
    for error in &report.errors {
        warn!("{error}");
    }

    let grouping = Grouping::from_paths(
        &classifier,
        report.events.into_iter().map(|event| event.path),
    );

    // Only consulted for the processed column; scanning works without a
    // configured program.
    let marker_check = config
        .processor
        .skip_if_exists
        .is_some()
        .then(|| CommandProcessor::from_config(&config.processor).ok())
        .flatten();

    let mut listings = Vec::with_capacity(grouping.datasets.len());
    for (key, parts) in grouping.datasets {
        let processed = match &marker_check {
            Some(processor) => Some(processor.already_processed(&key).await),
            None => None,
        };
        listings.push(DatasetListing {
            dataset: key.to_string(),
            complete: Grouping::is_complete(&parts, required),
            missing_modules: Grouping::missing(&parts, required),
            parts: parts.into_values().collect(),
            key,
            processed,
        });
    }

    if json {
        for listing in &listings {
            println!("{}", serde_json::to_string(listing)?);
        }
    } else {
        print_table(&dir, &listings, required);
    }
    Ok(())
}

fn print_table(dir: &Path, listings: &[DatasetListing], required: u8) {
    let complete = listings.iter().filter(|listing| listing.complete).count();
    println!(
        "{}: {} dataset(s), {} complete, {} incomplete",
        dir.display(),
        listings.len(),
        complete,
        listings.len() - complete
    );
    for listing in listings {
        let state = if listing.complete { "complete" } else { "incomplete" };
        let mut line = format!(
            "  {state:<10} {} ({}/{})",
            listing.dataset,
            listing.parts.len(),
            required
        );
        if !listing.missing_modules.is_empty() {
            let missing = listing
                .missing_modules
                .iter()
                .map(u8::to_string)
                .collect::<Vec<_>>()
                .join(",");
            line.push_str(&format!(" missing modules {missing}"));
        }
        if listing.processed == Some(true) {
            line.push_str(" [processed]");
        }
        println!("{line}");
    }
}

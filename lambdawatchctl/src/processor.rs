//! `DatasetProcessor` that runs an external program once per dataset.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use lambdawatch_config::ProcessorConfig;
use lambdawatch_core::{DatasetJob, DatasetKey, DatasetProcessor, PartIndex, ProcessingError};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info};

const STDERR_TAIL: usize = 2_048;

#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    skip_if_exists: Option<String>,
    timeout: Option<Duration>,
}

impl CommandProcessor {
    pub fn from_config(config: &ProcessorConfig) -> anyhow::Result<Self> {
        let Some(program) = config.program.as_deref().map(str::trim) else {
            bail!("processor.program is not configured");
        };
        if program.is_empty() {
            bail!("processor.program is empty");
        }
        if let Some(dir) = &config.working_dir {
            if !dir.is_dir() {
                bail!("processor.working_dir {} does not exist", dir.display());
            }
        }

        Ok(Self {
            program: program.to_string(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
            skip_if_exists: config.skip_if_exists.clone(),
            timeout: config.timeout_ms.map(Duration::from_millis),
        })
    }

    /// Expand the argument templates for `job`. A lone `{parts}` argument
    /// becomes one argument per part file.
    pub fn render_args(&self, job: &DatasetJob) -> Vec<String> {
        let mut rendered = Vec::with_capacity(self.args.len() + job.parts.len());
        for arg in &self.args {
            if arg == "{parts}" {
                rendered.extend(job.part_paths().map(|path| path.display().to_string()));
            } else {
                rendered.push(render(arg, &job.key, &job.parts));
            }
        }
        rendered
    }

    fn skip_marker(&self, key: &DatasetKey) -> Option<PathBuf> {
        let template = self.skip_if_exists.as_deref()?;
        let path = PathBuf::from(render(template, key, &[]));
        Some(if path.is_relative() {
            key.directory().join(path)
        } else {
            path
        })
    }

    async fn run(&self, job: &DatasetJob) -> Result<(), ProcessingError> {
        let args = self.render_args(job);
        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        debug!(
            target: "lambdawatch::dispatch",
            dataset = %job.key,
            program = %self.program,
            ?args,
            "running processor command"
        );

        let output = command.output();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, output).await.map_err(|_| {
                ProcessingError::failed(format!(
                    "{} timed out after {}s",
                    self.program,
                    limit.as_secs_f64()
                ))
            })?,
            None => output.await,
        }
        .map_err(|err| ProcessingError::failed(format!("failed to launch {}: {err}", self.program)))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let tail_start = stderr
            .char_indices()
            .rev()
            .nth(STDERR_TAIL.saturating_sub(1))
            .map_or(0, |(idx, _)| idx);
        Err(ProcessingError::CommandFailed {
            status: output.status.to_string(),
            stderr: stderr[tail_start..].to_string(),
        })
    }
}

#[async_trait]
impl DatasetProcessor for CommandProcessor {
    async fn process(&self, job: &DatasetJob) -> Result<(), ProcessingError> {
        for path in job.part_paths() {
            check_readable(path).await?;
        }
        self.run(job).await?;
        info!(
            target: "lambdawatch::dispatch",
            dataset = %job.key,
            job = %job.id,
            "processor command finished"
        );
        Ok(())
    }

    async fn already_processed(&self, key: &DatasetKey) -> bool {
        match self.skip_marker(key) {
            Some(marker) => tokio::fs::try_exists(&marker).await.unwrap_or(false),
            None => false,
        }
    }
}

/// Open the part and read one byte so a file still locked or truncated by
/// the writer fails here rather than inside the external program.
async fn check_readable(path: &Path) -> Result<(), ProcessingError> {
    let unreadable = |err: std::io::Error| ProcessingError::UnreadablePart {
        path: path.to_path_buf(),
        reason: err.to_string(),
    };
    let mut file = tokio::fs::File::open(path).await.map_err(unreadable)?;
    let mut byte = [0u8; 1];
    // An empty part reads zero bytes and still counts as readable.
    let _read = file.read(&mut byte).await.map_err(unreadable)?;
    Ok(())
}

fn render(template: &str, key: &DatasetKey, parts: &[(PartIndex, PathBuf)]) -> String {
    let mut out = template
        .replace("{key}", &key.name())
        .replace("{stem}", key.output_stem())
        .replace("{dir}", &key.directory().display().to_string());
    if out.contains("{parts}") {
        let joined = parts
            .iter()
            .map(|(_, path)| path.display().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        out = out.replace("{parts}", &joined);
    }
    for (index, path) in parts {
        out = out.replace(&format!("{{part{index}}}"), &path.display().to_string());
    }
    out
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use strum::Display;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::backend::InferenceBackend;

/// A single remote call within a swap sequence.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Step {
    Clear,
    UploadTarget,
    UploadSource,
    Run,
}

impl Step {
    /// The order the remote service expects. It is stateful, so this
    /// must never be rearranged.
    pub const SEQUENCE: [Step; 3] = [Step::UploadTarget, Step::UploadSource, Step::Run];

    /// The full sequence with the optional leading reset.
    pub fn sequence(clear_first: bool) -> Vec<Step> {
        let mut steps = Vec::with_capacity(Self::SEQUENCE.len() + 1);
        if clear_first {
            steps.push(Step::Clear);
        }
        steps.extend(Self::SEQUENCE);
        steps
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A remote call failed, the rest of the sequence was abandoned.
    #[error("{step} step failed")]
    Step {
        step: Step,
        #[source]
        source: anyhow::Error,
    },

    /// The run completed without any usable image reference.
    #[error("failed to create output image")]
    MissingOutput,

    /// The run referenced a file which does not exist locally and
    /// offered no url to download it from.
    #[error("failed to create output image, {0:?} does not exist")]
    OutputNotFound(PathBuf),

    /// The output exists but could not be read back.
    #[error("failed to read output image {path:?}")]
    ReadOutput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The output only exists remotely and downloading it failed.
    #[error("failed to download output image from {url}")]
    FetchOutput {
        url: String,
        #[source]
        source: anyhow::Error,
    },
}

/// The image reference returned by the run call.
///
/// The backend is not consistent about its shape, so it is normalised
/// here once instead of being inspected wherever it is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOutput {
    /// An object carrying the path in its `value` field.
    Value(String),

    /// An object carrying the path in its `path` field.
    Path(String),

    /// A bare path string.
    Raw(String),
}

impl ImageOutput {
    /// Checks `value`, then `path`, then a raw string, in that order.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(fields) => {
                if let Some(path) = fields.get("value").and_then(nested_path) {
                    return Some(Self::Value(path));
                }

                fields
                    .get("path")
                    .and_then(non_empty_str)
                    .map(Self::Path)
            },
            Value::String(_) => non_empty_str(value).map(Self::Raw),
            _ => None,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Value(path) | Self::Path(path) | Self::Raw(path) => Path::new(path),
        }
    }

    /// Resolves the reference to a file which exists on this machine.
    pub async fn resolve(&self) -> Result<PathBuf, PipelineError> {
        let path = self.path().to_path_buf();
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            _ => Err(PipelineError::OutputNotFound(path)),
        }
    }
}

fn non_empty_str(value: &Value) -> Option<String> {
    value
        .as_str()
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Older UIs wrap file outputs as `{"value": {"path": ...}}`.
fn nested_path(value: &Value) -> Option<String> {
    non_empty_str(value).or_else(|| value.get("path").and_then(non_empty_str))
}

/// The url the backend serves a file output at, if it reported one.
pub fn output_url(value: &Value) -> Option<String> {
    value
        .get("url")
        .and_then(non_empty_str)
        .or_else(|| value.get("value")?.get("url").and_then(non_empty_str))
}

pub struct ExecutionResult {
    /// The path the backend wrote the result to.
    pub output: PathBuf,

    /// The raw bytes of the result image.
    pub data: Vec<u8>,

    /// The time taken to execute the remote sequence.
    pub execution_time: Duration,
}

/// The single long-lived session with the inference backend.
///
/// The remote side keeps one set of uploaded inputs per session, so
/// whole sequences are serialised here. Two requests interleaving their
/// uploads would otherwise receive each other's results.
pub struct BackendSession {
    backend: Arc<dyn InferenceBackend>,
    clear_first: bool,
    lock: Mutex<()>,
}

impl BackendSession {
    pub fn new(backend: Arc<dyn InferenceBackend>, clear_first: bool) -> Self {
        Self {
            backend,
            clear_first,
            lock: Mutex::new(()),
        }
    }

    /// Runs the full swap sequence for one source/target pair.
    ///
    /// The result is read back before the session is released, as the
    /// backend may reuse its output location on the next run.
    pub async fn execute(
        &self,
        source: &Path,
        target: &Path,
    ) -> Result<ExecutionResult, PipelineError> {
        let _guard = self.lock.lock().await;

        let instant = Instant::now();
        let mut image = None;
        for step in Step::sequence(self.clear_first) {
            debug!("Running {} step", step);

            let res = match step {
                Step::Clear => self.backend.clear().await,
                Step::UploadTarget => self.backend.upload_target(target).await,
                Step::UploadSource => self.backend.upload_source(&[source]).await,
                Step::Run => self.backend.run().await.map(|out| {
                    if out.video.is_some() {
                        debug!("Run produced a video output, ignoring it");
                    }
                    image = out.image;
                }),
            };

            res.map_err(|err| PipelineError::Step { step, source: err })?;
        }
        let execution_time = instant.elapsed();

        let image = image.ok_or(PipelineError::MissingOutput)?;
        let reported = ImageOutput::from_value(&image).ok_or(PipelineError::MissingOutput)?;

        // A local file wins, the url is only for backends on another machine.
        let (output, data) = match reported.resolve().await {
            Ok(output) => {
                let data = tokio::fs::read(&output)
                    .await
                    .map_err(|source| PipelineError::ReadOutput {
                        path: output.clone(),
                        source,
                    })?;
                (output, data)
            },
            Err(err) => {
                let url = output_url(&image).ok_or(err)?;
                debug!("Output {:?} is not local, downloading {}", reported.path(), &url);

                let data = self
                    .backend
                    .fetch_output(&url)
                    .await
                    .map_err(|source| PipelineError::FetchOutput { url, source })?;
                (reported.path().to_path_buf(), data)
            },
        };

        Ok(ExecutionResult {
            output,
            data,
            execution_time,
        })
    }
}

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use crate::backend::template::{InferenceBackend, RunOutput};
use crate::pipeline::Step;

const MOCK_URL_SCHEME: &str = "mock://";

/// How the mock reports the produced image from `run`.
#[derive(Debug, Copy, Clone)]
pub enum OutputShape {
    Value,
    Path,
    Raw,
    Missing,
    Nonexistent,

    /// A path only the backend can see, with a url serving the file.
    Remote,
}

#[derive(Default)]
struct Uploaded {
    target: Vec<u8>,
    source: Vec<u8>,
}

/// An in-process stand-in for the remote web UI.
///
/// `run` writes `source|target` to a fresh file so callers can check
/// they got the result for their own inputs.
pub struct MockBackend {
    output_dir: TempDir,
    shape: OutputShape,
    fail_at: Option<Step>,
    delay: Duration,
    calls: Mutex<Vec<Step>>,
    seen_files: Mutex<Vec<PathBuf>>,
    uploaded: Mutex<Uploaded>,
    runs: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockBackend {
    pub fn new(shape: OutputShape) -> anyhow::Result<Self> {
        Ok(Self {
            output_dir: tempfile::tempdir()?,
            shape,
            fail_at: None,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            seen_files: Mutex::new(Vec::new()),
            uploaded: Mutex::new(Uploaded::default()),
            runs: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn fail_at(mut self, step: Step) -> Self {
        self.fail_at = Some(step);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<Step> {
        self.calls.lock().unwrap().clone()
    }

    /// Every local file handed to an upload call.
    pub fn seen_files(&self) -> Vec<PathBuf> {
        self.seen_files.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, step: Step) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(step);

        if step == Step::UploadTarget {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.fail_at == Some(step) {
            if step != Step::Clear {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(anyhow!("mock failure during {}", step));
        }

        Ok(())
    }

    async fn read(&self, file: &Path) -> anyhow::Result<Vec<u8>> {
        self.seen_files.lock().unwrap().push(file.to_path_buf());
        Ok(tokio::fs::read(file).await?)
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    async fn upload_target(&self, file: &Path) -> anyhow::Result<()> {
        self.enter(Step::UploadTarget).await?;
        let data = self.read(file).await?;
        self.uploaded.lock().unwrap().target = data;
        Ok(())
    }

    async fn upload_source(&self, files: &[&Path]) -> anyhow::Result<()> {
        self.enter(Step::UploadSource).await?;

        let mut data = Vec::new();
        for file in files {
            data.extend(self.read(file).await?);
        }
        self.uploaded.lock().unwrap().source = data;
        Ok(())
    }

    async fn run(&self) -> anyhow::Result<RunOutput> {
        self.enter(Step::Run).await?;

        let result = {
            let uploaded = self.uploaded.lock().unwrap();
            let mut result = uploaded.source.clone();
            result.push(b'|');
            result.extend_from_slice(&uploaded.target);
            result
        };

        let n = self.runs.fetch_add(1, Ordering::SeqCst);
        let path = self.output_dir.path().join(format!("output-{}.png", n));
        tokio::fs::write(&path, result).await?;
        let path = path.to_string_lossy().into_owned();

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let image = match self.shape {
            OutputShape::Value => Some(json!({ "value": path })),
            OutputShape::Path => Some(json!({ "path": path, "url": null })),
            OutputShape::Raw => Some(Value::String(path)),
            OutputShape::Missing => None,
            OutputShape::Nonexistent => Some(json!({ "path": "/nonexistent/output.png" })),
            OutputShape::Remote => Some(json!({
                "path": format!("/remote-only/output-{}.png", n),
                "url": format!("{}{}", MOCK_URL_SCHEME, path),
            })),
        };

        Ok(RunOutput { image, video: None })
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.enter(Step::Clear).await
    }

    async fn fetch_output(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let path = url
            .strip_prefix(MOCK_URL_SCHEME)
            .ok_or_else(|| anyhow!("mock cannot serve {}", url))?;
        Ok(tokio::fs::read(path).await?)
    }
}

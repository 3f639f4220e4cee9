use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

/// The two outputs of a run call.
///
/// Either may be absent depending on whether the target was an image
/// or a video.
#[derive(Debug, Default, Clone)]
pub struct RunOutput {
    pub image: Option<Value>,
    pub video: Option<Value>,
}

/// The remote procedures the gateway drives on the inference service.
///
/// The remote side is stateful, calls must be issued in the order
/// target upload, source upload, run.
#[async_trait]
pub trait InferenceBackend: Sync + Send + 'static {
    /// Sends a single file to the single-file update procedure.
    async fn upload_target(&self, file: &Path) -> anyhow::Result<()>;

    /// Sends a set of files to the list-of-files update procedure.
    async fn upload_source(&self, files: &[&Path]) -> anyhow::Result<()>;

    /// Runs the swap with whatever is currently uploaded.
    async fn run(&self) -> anyhow::Result<RunOutput>;

    /// Resets any state the previous run left behind.
    async fn clear(&self) -> anyhow::Result<()>;

    /// Downloads a produced file the backend serves at `url`.
    ///
    /// Used when the reported output path is not visible on this machine.
    async fn fetch_output(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}

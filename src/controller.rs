use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::payload::ImagePayload;
use crate::pipeline::BackendSession;

/// The outcome of a successful swap.
pub struct SwapResult {
    /// The raw bytes of the produced image.
    pub data: Vec<u8>,

    /// The time spent inside the backend.
    pub processing_time: Duration,
}

impl SwapResult {
    /// Processing time in seconds rounded to two decimals.
    pub fn processing_secs(&self) -> f64 {
        round_secs(self.processing_time)
    }

    pub fn to_base64(&self) -> String {
        base64::encode(&self.data)
    }
}

#[inline]
pub fn round_secs(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100.0).round() / 100.0
}

#[derive(Debug, Error)]
pub enum SwapError {
    /// The request images could not be decoded, nothing was sent to the backend.
    #[error("Error decoding image")]
    InvalidInput(#[source] anyhow::Error),

    /// No backend session was established at startup.
    #[error("Backend client not initialized")]
    Unavailable,

    /// The backend sequence or the local file handling failed.
    #[error("Error processing face swap")]
    Backend(#[source] anyhow::Error),
}

impl SwapError {
    /// The error followed by its causes, as reported back to clients.
    pub fn detail(&self) -> String {
        anyhow::Chain::new(self)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(": ")
    }
}

pub struct SwapController {
    session: Option<BackendSession>,
    backend_url: String,
    temp_dir: PathBuf,
    max_upload_size: usize,
}

impl SwapController {
    pub fn new(
        session: Option<BackendSession>,
        backend_url: String,
        temp_dir: PathBuf,
        max_upload_size: usize,
    ) -> Self {
        Self {
            session,
            backend_url,
            temp_dir,
            max_upload_size,
        }
    }

    pub fn from_config(cfg: &RuntimeConfig, session: Option<BackendSession>) -> Self {
        Self::new(
            session,
            cfg.backend.url.clone(),
            cfg.temp_dir.clone().unwrap_or_else(std::env::temp_dir),
            cfg.max_upload_size,
        )
    }

    /// Whether a backend session was established at startup.
    #[inline]
    pub fn is_available(&self) -> bool {
        self.session.is_some()
    }

    #[inline]
    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    /// Swaps the face from `source` onto `target`, both base64 encoded.
    pub async fn swap_base64(&self, source: &str, target: &str) -> Result<SwapResult, SwapError> {
        let source = ImagePayload::from_base64(source, self.max_upload_size)
            .map_err(SwapError::InvalidInput)?;
        let target = ImagePayload::from_base64(target, self.max_upload_size)
            .map_err(SwapError::InvalidInput)?;

        self.swap(source, target).await
    }

    /// Swaps the face from `source` onto `target`, both raw image bytes.
    pub async fn swap_bytes(
        &self,
        source: Vec<u8>,
        target: Vec<u8>,
    ) -> Result<SwapResult, SwapError> {
        let source = ImagePayload::from_bytes(source, self.max_upload_size)
            .map_err(SwapError::InvalidInput)?;
        let target = ImagePayload::from_bytes(target, self.max_upload_size)
            .map_err(SwapError::InvalidInput)?;

        self.swap(source, target).await
    }

    async fn swap(
        &self,
        source: ImagePayload,
        target: ImagePayload,
    ) -> Result<SwapResult, SwapError> {
        let session = self.session.as_ref().ok_or(SwapError::Unavailable)?;
        let span = info_span!("swap", request_id = %Uuid::new_v4());

        async move {
            debug!(
                "Received source ({:?}, {} bytes) and target ({:?}, {} bytes)",
                source.format(),
                source.len(),
                target.format(),
                target.len(),
            );

            // Both spooled files are removed when they go out of scope,
            // including on every error return below.
            let source = source
                .spool(&self.temp_dir, "source")
                .await
                .map_err(SwapError::Backend)?;
            let target = target
                .spool(&self.temp_dir, "target")
                .await
                .map_err(SwapError::Backend)?;

            let res = session
                .execute(source.path(), target.path())
                .await
                .map_err(|e| SwapError::Backend(e.into()));

            match res {
                Ok(result) => {
                    info!(
                        "Swap completed in {:?}, result @ {:?} ({} bytes)",
                        result.execution_time,
                        &result.output,
                        result.data.len(),
                    );
                    Ok(SwapResult {
                        data: result.data,
                        processing_time: result.execution_time,
                    })
                },
                Err(e) => {
                    error!("Swap failed: {}", e.detail());
                    Err(e)
                },
            }
        }
        .instrument(span)
        .await
    }
}

use std::path::Path;

use anyhow::{anyhow, Context};
use image::ImageFormat;
use tempfile::NamedTempFile;

/// A decoded request image.
///
/// Only lives for the duration of a single request, see `spool` for
/// getting it onto disk for the backend.
#[derive(Debug)]
pub struct ImagePayload {
    data: Vec<u8>,
    format: ImageFormat,
}

impl ImagePayload {
    /// Decodes a base64 image, with or without a `data:<mime>;base64,` header.
    pub fn from_base64(encoded: &str, max_size: usize) -> anyhow::Result<Self> {
        let cleaned: String = strip_data_uri(encoded)
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();

        let data = base64::decode(cleaned)
            .map_err(|e| anyhow!("data is not encoded in base64 format correctly: {}", e))?;

        Self::from_bytes(data, max_size)
    }

    /// Validates raw uploaded bytes.
    pub fn from_bytes(data: Vec<u8>, max_size: usize) -> anyhow::Result<Self> {
        if data.is_empty() {
            return Err(anyhow!("image is empty"));
        }

        if data.len() > max_size {
            return Err(anyhow!(
                "image is {} bytes which exceeds the limit of {} bytes",
                data.len(),
                max_size,
            ));
        }

        let format = image::guess_format(&data)
            .map_err(|_| anyhow!("data is not a recognised image format"))?;

        Ok(Self { data, format })
    }

    #[inline]
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Writes the image to a temp file which is removed once dropped.
    pub async fn spool(self, dir: &Path, role: &str) -> anyhow::Result<SpooledImage> {
        let extension = self.format.extensions_str().first().copied().unwrap_or("img");

        let file = tempfile::Builder::new()
            .prefix(&format!("{}-", role))
            .suffix(&format!(".{}", extension))
            .tempfile_in(dir)
            .with_context(|| format!("failed to create temp file in {:?}", dir))?;

        // Owning the handle before writing means a failed write still cleans up.
        let spooled = SpooledImage { file: Some(file) };
        tokio::fs::write(spooled.path(), &self.data)
            .await
            .with_context(|| format!("failed to write {} image to disk", role))?;

        Ok(spooled)
    }
}

/// Strips a `data:<mime>;base64,` header if one is present.
pub fn strip_data_uri(encoded: &str) -> &str {
    let trimmed = encoded.trim();
    match trimmed.split_once(',') {
        Some((header, data)) if header.starts_with("data:") => data,
        _ => trimmed,
    }
}

/// A temp file holding a request image.
///
/// Deleted on drop, whichever way the request ends.
#[derive(Debug)]
pub struct SpooledImage {
    file: Option<NamedTempFile>,
}

impl SpooledImage {
    pub fn path(&self) -> &Path {
        self.file
            .as_ref()
            .map(|f| f.path())
            .unwrap_or_else(|| Path::new(""))
    }
}

impl Drop for SpooledImage {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let path = file.path().to_path_buf();
            if let Err(e) = file.close() {
                warn!("Failed to remove temp file {:?}: {}", path, e);
            }
        }
    }
}

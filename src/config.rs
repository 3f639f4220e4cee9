use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

/// The default address of a locally running FaceFusion web UI.
pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:7870";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    /// The remote inference backend configuration.
    pub backend: BackendConfig,

    #[serde(default)]
    /// The directory request images are spooled to before being uploaded.
    ///
    /// Defaults to the system temp directory.
    pub temp_dir: Option<PathBuf>,

    #[serde(default = "default_max_upload_size")]
    /// The maximum size of a single decoded image in bytes.
    ///
    /// Defaults to 32 MiB.
    pub max_upload_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            temp_dir: None,
            max_upload_size: default_max_upload_size(),
        }
    }
}

impl RuntimeConfig {
    /// Loads the config from a YAML or JSON file depending on its extension.
    pub async fn from_file(path: &Path) -> anyhow::Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read config file {:?}", path))?;

        Self::parse(path, &data)
    }

    fn parse(path: &Path, data: &[u8]) -> anyhow::Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => Ok(serde_yaml::from_slice(data)?),
            Some("json") => Ok(serde_json::from_slice(data)?),
            other => Err(anyhow!(
                "config file must be a YAML or JSON file, got extension {:?}",
                other
            )),
        }
    }

    /// A config file with every field set to its default value.
    pub fn template() -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(&Self::default())?)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_url")]
    /// The base URL of the FaceFusion web UI.
    pub url: String,

    #[serde(default)]
    /// The names of the remote procedures used for a swap.
    pub endpoints: EndpointNames,

    #[serde(default)]
    /// Reset the remote session before every swap sequence.
    ///
    /// Defaults to `false`.
    pub clear_before_run: bool,

    #[serde(default)]
    /// Refuse to start the server if the backend cannot be reached.
    ///
    /// When `false` the server starts anyway and reports itself as
    /// unhealthy until it is restarted with a reachable backend.
    pub require_on_startup: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            endpoints: EndpointNames::default(),
            clear_before_run: false,
            require_on_startup: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointNames {
    #[serde(default = "default_target_upload")]
    /// The single-file update procedure the target image is sent to.
    pub target_upload: String,

    #[serde(default = "default_source_upload")]
    /// The list-of-files update procedure the source image is sent to.
    pub source_upload: String,

    #[serde(default = "default_run")]
    /// The procedure that runs the swap and returns `(image, video)`.
    pub run: String,

    #[serde(default = "default_clear")]
    pub clear: String,
}

impl Default for EndpointNames {
    fn default() -> Self {
        Self {
            target_upload: default_target_upload(),
            source_upload: default_source_upload(),
            run: default_run(),
            clear: default_clear(),
        }
    }
}

impl EndpointNames {
    pub fn all(&self) -> [&str; 4] {
        [
            self.target_upload.as_str(),
            self.source_upload.as_str(),
            self.run.as_str(),
            self.clear.as_str(),
        ]
    }
}

fn default_backend_url() -> String {
    DEFAULT_BACKEND_URL.to_string()
}

fn default_target_upload() -> String {
    "/update_1".to_string()
}

fn default_source_upload() -> String {
    "/update".to_string()
}

fn default_run() -> String {
    "/run".to_string()
}

fn default_clear() -> String {
    "/clear".to_string()
}

const fn default_max_upload_size() -> usize {
    32 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_defaults() -> anyhow::Result<()> {
        let raw = b"backend:\n  url: http://10.0.0.2:7860\n";
        let cfg = RuntimeConfig::parse(Path::new("config.yaml"), raw)?;

        assert_eq!(cfg.backend.url, "http://10.0.0.2:7860");
        assert_eq!(cfg.backend.endpoints.target_upload, "/update_1");
        assert_eq!(cfg.backend.endpoints.source_upload, "/update");
        assert_eq!(cfg.backend.endpoints.run, "/run");
        assert!(!cfg.backend.clear_before_run);
        assert_eq!(cfg.max_upload_size, 32 * 1024 * 1024);
        Ok(())
    }

    #[test]
    fn test_json_config() -> anyhow::Result<()> {
        let raw = br#"{
            "backend": {"require_on_startup": true, "endpoints": {"run": "/start"}},
            "max_upload_size": 1024
        }"#;
        let cfg = RuntimeConfig::parse(Path::new("config.json"), raw)?;

        assert_eq!(cfg.backend.url, DEFAULT_BACKEND_URL);
        assert!(cfg.backend.require_on_startup);
        assert_eq!(cfg.backend.endpoints.run, "/start");
        assert_eq!(cfg.backend.endpoints.clear, "/clear");
        assert_eq!(cfg.max_upload_size, 1024);
        Ok(())
    }

    #[test]
    fn test_unknown_extension() {
        assert!(RuntimeConfig::parse(Path::new("config.toml"), b"").is_err());
    }

    #[test]
    fn test_template_round_trips() -> anyhow::Result<()> {
        let template = RuntimeConfig::template()?;
        let cfg = RuntimeConfig::parse(Path::new("config.yaml"), template.as_bytes())?;
        assert_eq!(cfg.backend.url, DEFAULT_BACKEND_URL);
        assert_eq!(cfg.max_upload_size, 32 * 1024 * 1024);
        Ok(())
    }
}

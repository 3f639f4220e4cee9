use std::sync::Arc;

use crate::backend::gradio::GradioClient;
use crate::backend::template::InferenceBackend;
use crate::config::BackendConfig;

impl BackendConfig {
    pub async fn connect(&self) -> anyhow::Result<Arc<dyn InferenceBackend>> {
        let client = GradioClient::connect(
            &self.url,
            self.endpoints.clone(),
            self.clear_before_run,
        )
        .await?;

        Ok(Arc::new(client))
    }
}

use std::path::Path;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::backend::template::{InferenceBackend, RunOutput};
use crate::config::EndpointNames;

/// The subset of the web UI's `/config` document we care about.
#[derive(Debug, Deserialize)]
struct AppConfig {
    #[serde(default)]
    version: Option<String>,

    #[serde(default)]
    api_prefix: Option<String>,

    #[serde(default)]
    dependencies: Vec<Dependency>,
}

#[derive(Debug, Deserialize)]
struct Dependency {
    /// Either the procedure name, `null` or `false` for unnamed handlers.
    #[serde(default)]
    api_name: Value,
}

#[derive(Debug, Deserialize)]
struct CallAck {
    event_id: String,
}

/// A client for a Gradio web UI speaking the queued `/call` protocol.
///
/// One client is one remote session, every call carries the same
/// session hash so uploads and runs land in the same server-side state.
pub struct GradioClient {
    http: reqwest::Client,
    base_url: String,
    api_prefix: String,
    session_hash: String,
    endpoints: EndpointNames,
}

impl GradioClient {
    /// Fetches the remote app config and checks the procedures we need are exposed.
    pub async fn connect(
        url: &str,
        endpoints: EndpointNames,
        needs_clear: bool,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::new();
        let base_url = url.trim_end_matches('/').to_string();

        let app: AppConfig = http
            .get(format!("{}/config", base_url))
            .send()
            .await
            .with_context(|| format!("failed to reach backend at {}", base_url))?
            .error_for_status()?
            .json()
            .await
            .context("backend returned an invalid app config")?;

        let exposed: Vec<&str> = app
            .dependencies
            .iter()
            .filter_map(|dep| dep.api_name.as_str())
            .collect();

        if !exposed.is_empty() {
            let required = endpoints
                .all()
                .into_iter()
                .filter(|name| needs_clear || *name != endpoints.clear.as_str());

            for name in required {
                if !exposed.contains(&name.trim_start_matches('/')) {
                    bail!("backend does not expose the remote procedure {:?}", name);
                }
            }
        }

        let api_prefix = app
            .api_prefix
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string();

        info!(
            "Connected to backend @ {} (version: {})",
            base_url,
            app.version.as_deref().unwrap_or("unknown"),
        );

        Ok(Self {
            http,
            base_url,
            api_prefix,
            session_hash: Uuid::new_v4().simple().to_string(),
            endpoints,
        })
    }

    #[inline]
    fn route(&self, path: &str) -> String {
        format!("{}{}/{}", self.base_url, self.api_prefix, path)
    }

    /// Uploads a local file and returns the file-data object referencing it remotely.
    async fn upload(&self, file: &Path) -> anyhow::Result<Value> {
        let data = tokio::fs::read(file)
            .await
            .with_context(|| format!("failed to read {:?} for upload", file))?;

        let orig_name = file
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("image")
            .to_string();

        let part = multipart::Part::bytes(data).file_name(orig_name.clone());
        let form = multipart::Form::new().part("files", part);

        let paths: Vec<String> = self
            .http
            .post(self.route("upload"))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let path = paths
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("upload of {:?} returned no remote path", file))?;

        debug!("Uploaded {:?} as {}", file, &path);
        Ok(json!({
            "path": path,
            "orig_name": orig_name,
            "meta": { "_type": "gradio.FileData" },
        }))
    }

    /// Queues a call to the named procedure and waits for it to complete.
    async fn predict(&self, api_name: &str, data: Vec<Value>) -> anyhow::Result<Vec<Value>> {
        let call_url = self.route(&format!("call/{}", api_name.trim_start_matches('/')));

        let ack: CallAck = self
            .http
            .post(&call_url)
            .json(&json!({
                "data": data,
                "session_hash": &self.session_hash,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!("Queued {} as event {}", api_name, &ack.event_id);

        let resp = self
            .http
            .get(format!("{}/{}", call_url, ack.event_id))
            .send()
            .await?
            .error_for_status()?;

        let mut stream = resp.bytes_stream();
        let mut parser = EventStreamParser::default();
        let mut finished = false;

        loop {
            let events = if finished {
                parser.finish()
            } else {
                match stream.next().await {
                    Some(chunk) => parser.feed(&chunk?),
                    None => {
                        finished = true;
                        continue;
                    },
                }
            };

            for event in events {
                match event.name.as_str() {
                    "complete" => {
                        let output: Vec<Value> = serde_json::from_str(&event.data)
                            .with_context(|| {
                                format!("{} returned a malformed result", api_name)
                            })?;
                        return Ok(output);
                    },
                    "error" => bail!("remote procedure {} failed: {}", api_name, event.data),
                    other => debug!("{} event {:?}", api_name, other),
                }
            }

            if finished {
                bail!("event stream for {} ended before completing", api_name);
            }
        }
    }
}

#[async_trait]
impl InferenceBackend for GradioClient {
    async fn upload_target(&self, file: &Path) -> anyhow::Result<()> {
        let file = self.upload(file).await?;
        self.predict(&self.endpoints.target_upload, vec![file]).await?;
        Ok(())
    }

    async fn upload_source(&self, files: &[&Path]) -> anyhow::Result<()> {
        let mut uploaded = Vec::with_capacity(files.len());
        for file in files {
            uploaded.push(self.upload(file).await?);
        }

        self.predict(&self.endpoints.source_upload, vec![Value::Array(uploaded)])
            .await?;
        Ok(())
    }

    async fn run(&self) -> anyhow::Result<RunOutput> {
        let mut output = self.predict(&self.endpoints.run, vec![]).await?.into_iter();

        let image = output.next().filter(|v| !v.is_null());
        let video = output.next().filter(|v| !v.is_null());

        Ok(RunOutput { image, video })
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.predict(&self.endpoints.clear, vec![]).await?;
        Ok(())
    }

    async fn fetch_output(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        // Some versions report the url relative to the app root.
        let url = if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            url.to_string()
        };

        let data = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to download output from {}", url))?
            .error_for_status()?
            .bytes()
            .await?;

        debug!("Downloaded {} bytes from {}", data.len(), &url);
        Ok(data.to_vec())
    }
}

#[derive(Debug, PartialEq, Eq)]
struct StreamEvent {
    name: String,
    data: String,
}

/// Incremental parser for a `text/event-stream` body.
#[derive(Default)]
struct EventStreamParser {
    buffer: Vec<u8>,
}

impl EventStreamParser {
    fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = parse_block(&block[..pos]) {
                events.push(event);
            }
        }

        events
    }

    /// Flushes a trailing event that was not terminated by a blank line.
    fn finish(&mut self) -> Vec<StreamEvent> {
        let block = std::mem::take(&mut self.buffer);
        parse_block(&block).into_iter().collect()
    }
}

fn parse_block(block: &[u8]) -> Option<StreamEvent> {
    let text = String::from_utf8_lossy(block);

    let mut name = None;
    let mut data: Vec<&str> = Vec::new();
    for line in text.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            name = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }

    if name.is_none() && data.is_empty() {
        return None;
    }

    Some(StreamEvent {
        name: name.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
    })
}

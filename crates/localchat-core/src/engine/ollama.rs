use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::ndjson::{NdjsonError, NdjsonReader};
use super::{ChatParams, DeltaStream, EngineHandle, InferenceEngine, ProgressEvent};
use crate::error::{EngineError, GenerationError, LoadError};
use crate::state::ChatMessage;

/// How long Ollama keeps a loaded model resident between requests.
const KEEP_ALIVE: &str = "30m";

#[derive(Serialize)]
struct PullRequest<'a> {
    model: &'a str,
    stream: bool,
}

#[derive(Deserialize, Debug, Default)]
struct PullStatus {
    #[serde(default)]
    status: String,
    total: Option<u64>,
    completed: Option<u64>,
    error: Option<String>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
    stream: bool,
    keep_alive: serde_json::Value,
}

#[derive(Deserialize)]
struct GenerateResponse {
    error: Option<String>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    keep_alive: &'a str,
    options: ChatOptions,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize, Debug)]
struct ChatChunk {
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct OllamaModel {
    name: String,
}

#[derive(Deserialize)]
struct OllamaModelsResponse {
    models: Vec<OllamaModel>,
}

/// Inference engine backed by a local Ollama server.
#[derive(Clone)]
pub struct OllamaEngine {
    client: Client,
    base_url: String,
}

impl OllamaEngine {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Models already downloaded on the server.
    pub async fn list_local_models(&self) -> Result<Vec<String>, LoadError> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.load_error(e))?;

        if !response.status().is_success() {
            return Err(LoadError::Rejected(format!(
                "Failed to list models: {}",
                response.status()
            )));
        }

        let models_response: OllamaModelsResponse = response.json().await?;
        Ok(models_response
            .models
            .into_iter()
            .map(|model| model.name)
            .collect())
    }

    async fn pull(
        &self,
        model: &str,
        on_progress: &mut (dyn FnMut(ProgressEvent) + Send),
    ) -> Result<(), LoadError> {
        let url = format!("{}/api/pull", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&PullRequest { model, stream: true })
            .send()
            .await
            .map_err(|e| self.load_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(LoadError::Rejected(rejection_message(status, &text)));
        }

        let mut reader = NdjsonReader::new(response);
        let mut fraction = 0.0;
        while let Some(update) = reader.next::<PullStatus>().await? {
            if let Some(error) = update.error {
                return Err(LoadError::Rejected(error));
            }
            if let (Some(total), Some(completed)) = (update.total, update.completed) {
                if total > 0 {
                    fraction = completed as f64 / total as f64;
                }
            }
            debug!(model, status = %update.status, fraction, "pull progress");
            on_progress(ProgressEvent::new(fraction, update.status));
        }
        Ok(())
    }

    async fn warm(&self, model: &str) -> Result<(), LoadError> {
        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&GenerateRequest {
                model,
                prompt: Some(""),
                stream: false,
                keep_alive: KEEP_ALIVE.into(),
            })
            .send()
            .await
            .map_err(|e| self.load_error(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| self.load_error(e))?;
        warm_outcome(status, &text)
    }

    fn load_error(&self, err: reqwest::Error) -> LoadError {
        if err.is_connect() {
            LoadError::Unreachable {
                url: self.base_url.clone(),
            }
        } else {
            LoadError::Http(err)
        }
    }
}

#[async_trait]
impl InferenceEngine for OllamaEngine {
    async fn load(
        &self,
        model: &str,
        on_progress: &mut (dyn FnMut(ProgressEvent) + Send),
    ) -> Result<Arc<dyn EngineHandle>, LoadError> {
        info!(model, url = %self.base_url, "loading model");
        self.pull(model, on_progress).await?;

        on_progress(ProgressEvent::new(1.0, "loading model into memory"));
        self.warm(model).await?;
        on_progress(ProgressEvent::new(1.0, "ready"));

        Ok(Arc::new(OllamaSession {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            model: model.to_string(),
        }))
    }
}

/// A model resident in Ollama.
pub struct OllamaSession {
    client: Client,
    base_url: String,
    model: String,
}

#[async_trait]
impl EngineHandle for OllamaSession {
    fn model(&self) -> &str {
        &self.model
    }

    async fn stream_chat(
        &self,
        history: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<DeltaStream, GenerationError> {
        let url = format!("{}/api/chat", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages: history
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            stream: true,
            keep_alive: KEEP_ALIVE,
            options: ChatOptions {
                temperature: params.temperature,
                num_predict: params.max_tokens,
            },
        };

        let response = self.client.post(&url).json(&request).send().await.map_err(|e| {
            if e.is_connect() {
                GenerationError::Unreachable {
                    url: self.base_url.clone(),
                }
            } else {
                GenerationError::Http(e)
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GenerationError::Rejected(rejection_message(status, &text)));
        }

        let reader = NdjsonReader::new(response);
        let stream = futures_util::stream::unfold(Some(reader), |state| async move {
            let mut reader = state?;
            match reader.next::<ChatChunk>().await {
                Ok(Some(chunk)) => match chunk_delta(chunk) {
                    ChunkOutcome::Delta(text) => Some((Ok(text), Some(reader))),
                    ChunkOutcome::Done => None,
                    ChunkOutcome::Failed(e) => Some((Err(e), None)),
                },
                Ok(None) => None,
                Err(NdjsonError::Http(e)) => Some((Err(GenerationError::Http(e)), None)),
                Err(NdjsonError::Decode(e)) => Some((Err(GenerationError::Decode(e)), None)),
            }
        });

        Ok(Box::pin(stream))
    }

    async fn unload(&self) -> Result<(), EngineError> {
        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&GenerateRequest {
                model: &self.model,
                prompt: None,
                stream: false,
                keep_alive: 0.into(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::Rejected(response.status().to_string()));
        }
        info!(model = %self.model, "model unloaded");
        Ok(())
    }
}

enum ChunkOutcome {
    Delta(String),
    Done,
    Failed(GenerationError),
}

fn chunk_delta(chunk: ChatChunk) -> ChunkOutcome {
    if let Some(error) = chunk.error {
        return ChunkOutcome::Failed(GenerationError::Engine(error));
    }
    if chunk.done {
        return ChunkOutcome::Done;
    }
    ChunkOutcome::Delta(chunk.message.map(|m| m.content).unwrap_or_default())
}

/// Prefer Ollama's `{"error": "..."}` body over the bare status line.
fn rejection_message(status: reqwest::StatusCode, body: &str) -> String {
    serde_json::from_str::<GenerateResponse>(body)
        .ok()
        .and_then(|r| r.error)
        .unwrap_or_else(|| format!("Ollama request failed with status: {status}"))
}

/// Interpret the warm-up reply. The status is checked first so a non-JSON
/// error page still reports the HTTP failure.
fn warm_outcome(status: reqwest::StatusCode, body: &str) -> Result<(), LoadError> {
    if !status.is_success() {
        return Err(LoadError::Rejected(rejection_message(status, body)));
    }
    let response: GenerateResponse = serde_json::from_str(body)?;
    match response.error {
        Some(error) => Err(LoadError::Rejected(error)),
        None => Ok(()),
    }
}

impl From<NdjsonError> for LoadError {
    fn from(err: NdjsonError) -> Self {
        match err {
            NdjsonError::Http(e) => LoadError::Http(e),
            NdjsonError::Decode(e) => LoadError::Decode(e),
        }
    }
}

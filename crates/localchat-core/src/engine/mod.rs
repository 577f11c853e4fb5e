//! Gateway to the external inference runtime.
//!
//! The runtime owns downloading, loading and generation. This side only sees
//! three calls: load a model (with progress), stream a chat reply, unload.

pub mod ndjson;
pub mod ollama;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, GenerationError, LoadError};
use crate::state::ChatMessage;

pub use ollama::OllamaEngine;

/// Lazy sequence of text deltas. May fail after partial output.
pub type DeltaStream = BoxStream<'static, Result<String, GenerationError>>;

/// One load progress report. Transient.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// In `[0, 1]`.
    pub fraction: f64,
    pub label: String,
}

impl ProgressEvent {
    pub fn new(fraction: f64, label: impl Into<String>) -> Self {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            fraction,
            label: label.into(),
        }
    }

    pub fn percent(&self) -> u8 {
        (self.fraction * 100.0).round() as u8
    }
}

/// Sampling parameters, fixed by configuration for the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChatParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ChatParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Load `model`, reporting progress zero or more times before resolving.
    async fn load(
        &self,
        model: &str,
        on_progress: &mut (dyn FnMut(ProgressEvent) + Send),
    ) -> Result<Arc<dyn EngineHandle>, LoadError>;
}

/// A loaded model.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    fn model(&self) -> &str;

    async fn stream_chat(
        &self,
        history: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<DeltaStream, GenerationError>;

    /// Release the model. Not idempotent: call at most once.
    async fn unload(&self) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_clamped() {
        assert_eq!(ProgressEvent::new(1.7, "x").fraction, 1.0);
        assert_eq!(ProgressEvent::new(-0.2, "x").fraction, 0.0);
        assert_eq!(ProgressEvent::new(f64::NAN, "x").fraction, 0.0);
        assert_eq!(ProgressEvent::new(0.456, "x").percent(), 46);
    }
}

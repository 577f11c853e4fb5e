//! Error taxonomy for probing, loading, generation and session transitions.

use thiserror::Error;

use crate::session::SessionState;

/// Why the host cannot run the engine. Terminal for the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("no driver interface available")]
    NoInterface,

    #[error("no compatible adapter")]
    NoAdapter,

    #[error("device initialization failed{}", detail_suffix(.0))]
    DeviceInit(String),
}

fn detail_suffix(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(": {detail}")
    }
}

/// A model load the engine rejected. Recoverable: the session returns to Unloaded.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("engine unreachable at {url}. Make sure Ollama is running with: ollama serve")]
    Unreachable { url: String },

    #[error("{0}")]
    Rejected(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed engine response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A generation that failed before or during streaming. Recoverable: back to Ready.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("engine unreachable at {url}")]
    Unreachable { url: String },

    #[error("{0}")]
    Rejected(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed engine response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Engine(String),
}

/// Releasing an engine handle failed.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unload rejected: {0}")]
    Rejected(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: SessionState,
    },

    #[error("GPU not available: {0}")]
    CapabilityUnavailable(String),
}

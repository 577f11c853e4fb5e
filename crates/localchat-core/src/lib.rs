pub mod capability;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod markup;
pub mod models;
pub mod renderer;
pub mod session;
pub mod state;
pub mod transcript;

// Re-export main types for convenience
pub use capability::CapabilityReport;
pub use config::Config;
pub use engine::{ChatParams, EngineHandle, InferenceEngine, OllamaEngine, ProgressEvent};
pub use error::{CapabilityError, EngineError, GenerationError, LoadError, SessionError};
pub use models::Model;
pub use renderer::{GenerationStats, StreamRenderer};
pub use session::{GenerationId, GenerationRequest, Session, SessionEvent, SessionState};
pub use state::{ChatMessage, ChatRole};
pub use transcript::{EntryRole, Transcript, TranscriptEntry};

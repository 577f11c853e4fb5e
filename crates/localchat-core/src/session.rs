//! Session state machine.
//!
//! One `Session` owns everything that changes over a chat session: the
//! lifecycle state, the loaded engine handle, the conversation history, the
//! transcript and the latest stats. Asynchronous work happens elsewhere
//! (see [`crate::driver`]) and reports back as [`SessionEvent`]s, which are
//! applied here in arrival order on a single task.
//!
//! ```text
//!   Unloaded --load--> Loading --ok--> Ready --send--> Generating
//!      ^                  |              ^  ^               |
//!      |                  +--err---------|--|---------------+ done / failed
//!      +--------------- unload ----------+--+---------------+
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::capability::CapabilityReport;
use crate::engine::{ChatParams, EngineHandle, ProgressEvent};
use crate::error::{GenerationError, LoadError, SessionError};
use crate::models::Model;
use crate::renderer::{GenerationStats, StreamRenderer};
use crate::state::{ChatMessage, ConversationHistory};
use crate::transcript::{EntryRole, Transcript};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unloaded,
    Loading,
    Ready,
    Generating,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Unloaded => "unloaded",
            SessionState::Loading => "loading",
            SessionState::Ready => "ready",
            SessionState::Generating => "generating",
        })
    }
}

/// Identifies one generation cycle; events from any other cycle are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenerationId(u64);

/// Results of asynchronous work, fed back into [`Session::handle_event`].
pub enum SessionEvent {
    Probed(CapabilityReport),
    LoadProgress(ProgressEvent),
    Loaded(Result<Arc<dyn EngineHandle>, LoadError>),
    Delta {
        generation: GenerationId,
        text: String,
    },
    Finished {
        generation: GenerationId,
        result: Result<(), GenerationError>,
    },
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Probed(report) => f.debug_tuple("Probed").field(report).finish(),
            SessionEvent::LoadProgress(progress) => {
                f.debug_tuple("LoadProgress").field(progress).finish()
            }
            SessionEvent::Loaded(Ok(handle)) => {
                f.debug_tuple("Loaded").field(&handle.model()).finish()
            }
            SessionEvent::Loaded(Err(e)) => f.debug_tuple("LoadFailed").field(e).finish(),
            SessionEvent::Delta { generation, text } => f
                .debug_struct("Delta")
                .field("generation", generation)
                .field("text", text)
                .finish(),
            SessionEvent::Finished { generation, result } => f
                .debug_struct("Finished")
                .field("generation", generation)
                .field("result", result)
                .finish(),
        }
    }
}

/// Everything a generation task needs. Produced by [`Session::submit`].
pub struct GenerationRequest {
    pub id: GenerationId,
    pub handle: Arc<dyn EngineHandle>,
    /// History as the engine should see it, ending with the new user message.
    pub history: Vec<ChatMessage>,
    pub params: ChatParams,
    /// Set when the session stops caring about this generation.
    pub abandoned: Arc<AtomicBool>,
}

struct ActiveGeneration {
    id: GenerationId,
    renderer: StreamRenderer,
    entry: usize,
    abandoned: Arc<AtomicBool>,
}

pub struct Session {
    state: SessionState,
    capability: Option<CapabilityReport>,
    selected_model: Model,
    loaded_model: Option<Model>,
    handle: Option<Arc<dyn EngineHandle>>,
    history: ConversationHistory,
    transcript: Transcript,
    stats: Option<GenerationStats>,
    progress: Option<ProgressEvent>,
    params: ChatParams,
    active: Option<ActiveGeneration>,
    next_generation: u64,
}

const WELCOME: &str = "Select a model and load it to start chatting.";
const UNLOADED: &str = "Model unloaded. Select a model and load it to start chatting.";

impl Session {
    pub fn new(selected_model: Model, params: ChatParams) -> Self {
        let mut transcript = Transcript::new();
        transcript.push(EntryRole::Notice, WELCOME);

        Self {
            state: SessionState::Unloaded,
            capability: None,
            selected_model,
            loaded_model: None,
            handle: None,
            history: ConversationHistory::new(),
            transcript,
            stats: None,
            progress: None,
            params,
            active: None,
            next_generation: 0,
        }
    }

    // Accessors

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn capability(&self) -> Option<&CapabilityReport> {
        self.capability.as_ref()
    }

    pub fn selected_model(&self) -> Model {
        self.selected_model
    }

    pub fn loaded_model(&self) -> Option<Model> {
        self.loaded_model
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn stats(&self) -> Option<&GenerationStats> {
        self.stats.as_ref()
    }

    pub fn progress(&self) -> Option<&ProgressEvent> {
        self.progress.as_ref()
    }

    pub fn params(&self) -> &ChatParams {
        &self.params
    }

    // Guards

    pub fn can_load(&self) -> bool {
        self.state == SessionState::Unloaded
            && self.capability.as_ref().is_some_and(|c| c.supported)
    }

    pub fn can_send(&self, input: &str) -> bool {
        self.state == SessionState::Ready && !input.trim().is_empty()
    }

    pub fn can_unload(&self) -> bool {
        matches!(self.state, SessionState::Ready | SessionState::Generating)
    }

    pub fn can_select_model(&self) -> bool {
        self.state == SessionState::Unloaded
    }

    /// Status line: what is loaded, or the latest throughput figures.
    pub fn status_line(&self) -> String {
        match (self.state, self.loaded_model, &self.stats) {
            (SessionState::Loading, _, _) => format!("Loading {}…", self.selected_model),
            (SessionState::Generating, _, _) => "Generating…".to_string(),
            (_, Some(_), Some(stats)) => stats.to_string(),
            (_, Some(model), None) => format!("Model: {} • Ready", model),
            _ => "No model loaded".to_string(),
        }
    }

    // Transitions

    pub fn select_model(&mut self, model: Model) -> Result<(), SessionError> {
        if !self.can_select_model() {
            return Err(self.invalid("select a model"));
        }
        self.selected_model = model;
        Ok(())
    }

    /// Unloaded → Loading. Returns the model the caller should ask the engine for.
    pub fn begin_load(&mut self) -> Result<Model, SessionError> {
        match &self.capability {
            Some(report) if !report.supported => {
                return Err(SessionError::CapabilityUnavailable(report.reason.clone()))
            }
            None => return Err(SessionError::CapabilityUnavailable("GPU check pending".to_string())),
            Some(_) => {}
        }
        if self.state != SessionState::Unloaded {
            return Err(self.invalid("load a model"));
        }

        info!(model = %self.selected_model, "load requested");
        self.state = SessionState::Loading;
        self.progress = None;
        Ok(self.selected_model)
    }

    /// Ready → Generating. Blank input is ignored and yields `None`.
    pub fn submit(&mut self, input: &str) -> Option<GenerationRequest> {
        if !self.can_send(input) {
            debug!(state = %self.state, "submission ignored");
            return None;
        }
        let handle = self.handle.clone()?;
        let input = input.trim();

        self.history.push(ChatMessage::user(input));
        self.transcript.push(EntryRole::User, input);

        let id = GenerationId(self.next_generation);
        self.next_generation += 1;
        let abandoned = Arc::new(AtomicBool::new(false));
        let entry = self.transcript.push_streaming();
        self.active = Some(ActiveGeneration {
            id,
            renderer: StreamRenderer::new(),
            entry,
            abandoned: abandoned.clone(),
        });
        self.state = SessionState::Generating;
        debug!(generation = id.0, turns = self.history.len(), "generation started");

        Some(GenerationRequest {
            id,
            handle,
            history: self.history.for_engine(),
            params: self.params,
            abandoned,
        })
    }

    /// Ready/Generating → Unloaded. Hands back the engine handle so the caller
    /// can release it exactly once.
    pub fn unload(&mut self) -> Result<Option<Arc<dyn EngineHandle>>, SessionError> {
        if !self.can_unload() {
            return Err(self.invalid("unload"));
        }

        if let Some(active) = self.active.take() {
            active.abandoned.store(true, Ordering::Release);
            info!(
                generation = active.id.0,
                received = active.renderer.token_count(),
                "abandoning in-flight generation"
            );
        }

        info!(model = ?self.loaded_model, "model unloaded");
        self.state = SessionState::Unloaded;
        self.loaded_model = None;
        self.history.clear();
        self.stats = None;
        self.progress = None;
        self.transcript.clear();
        self.transcript.push(EntryRole::Notice, UNLOADED);
        Ok(self.handle.take())
    }

    pub fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Probed(report) => self.apply_probe(report),
            SessionEvent::LoadProgress(progress) => self.apply_progress(progress),
            SessionEvent::Loaded(result) => self.finish_load(result),
            SessionEvent::Delta { generation, text } => {
                self.apply_delta(generation, &text);
            }
            SessionEvent::Finished { generation, result } => {
                self.finish_generation(generation, result);
            }
        }
    }

    fn apply_probe(&mut self, report: CapabilityReport) {
        if self.capability.is_some() {
            warn!("capability report already recorded; ignoring");
            return;
        }
        self.capability = Some(report);
    }

    fn apply_progress(&mut self, progress: ProgressEvent) {
        if self.state != SessionState::Loading {
            return;
        }
        debug!(percent = progress.percent(), label = %progress.label, "load progress");
        self.progress = Some(progress);
    }

    fn finish_load(&mut self, result: Result<Arc<dyn EngineHandle>, LoadError>) {
        if self.state != SessionState::Loading {
            warn!(state = %self.state, "load result arrived outside Loading; ignoring");
            return;
        }
        self.progress = None;

        match result {
            Ok(handle) => {
                let model = self.selected_model;
                info!(model = %model, "model loaded");
                self.handle = Some(handle);
                self.loaded_model = Some(model);
                self.state = SessionState::Ready;
                self.history.clear();
                self.stats = None;
                self.transcript.clear();
                self.transcript.push(
                    EntryRole::Assistant,
                    format!("Model **{}** loaded successfully! How can I help you?", model),
                );
            }
            Err(err) => {
                warn!(model = %self.selected_model, error = %err, "model load failed");
                self.state = SessionState::Unloaded;
                self.transcript
                    .push(EntryRole::Error, format!("Failed to load model: {err}"));
            }
        }
    }

    /// Apply one delta. Returns false when it belongs to a stale generation.
    pub fn apply_delta(&mut self, generation: GenerationId, text: &str) -> bool {
        let Some(active) = self.current(generation) else {
            debug!(generation = generation.0, "dropping stale delta");
            return false;
        };
        active.renderer.push(text);
        let entry = active.entry;
        let content = active.renderer.text().to_string();
        let lines = active.renderer.lines().to_vec();
        self.transcript.update_streaming(entry, &content, &lines);
        true
    }

    /// Generating → Ready. Returns false when the event is stale.
    pub fn finish_generation(
        &mut self,
        generation: GenerationId,
        result: Result<(), GenerationError>,
    ) -> bool {
        if self.current(generation).is_none() {
            debug!(generation = generation.0, "dropping stale completion");
            return false;
        }
        let Some(active) = self.active.take() else {
            return false;
        };
        self.transcript.settle(active.entry);
        self.state = SessionState::Ready;

        match result {
            Ok(()) => {
                let stats = active.renderer.stats();
                info!(
                    generation = generation.0,
                    tokens = stats.token_count,
                    elapsed_ms = stats.elapsed.as_millis() as u64,
                    "generation complete"
                );
                self.stats = Some(stats);
                self.history
                    .push(ChatMessage::assistant(active.renderer.into_text()));
            }
            Err(err) => {
                warn!(generation = generation.0, error = %err, "generation failed");
                self.transcript.push(EntryRole::Error, format!("Error: {err}"));
            }
        }
        true
    }

    fn current(&mut self, generation: GenerationId) -> Option<&mut ActiveGeneration> {
        if self.state != SessionState::Generating {
            return None;
        }
        self.active.as_mut().filter(|a| a.id == generation)
    }

    fn invalid(&self, action: &'static str) -> SessionError {
        SessionError::InvalidTransition {
            action,
            state: self.state,
        }
    }
}

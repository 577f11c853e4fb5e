use std::path::PathBuf;
use std::sync::Arc;

use ratatui::layout::Rect;
use ratatui::widgets::ListState;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use localchat_core::{
    driver, Config, EngineHandle, InferenceEngine, Model, Session, SessionEvent, SessionState,
};

use crate::tui::AppEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Editing,
}

pub struct App {
    // Core state
    pub should_quit: bool,
    pub input_mode: InputMode,

    // Chat session and the engine it talks to
    pub session: Session,
    pub engine: Arc<dyn InferenceEngine>,
    pub events: UnboundedSender<AppEvent>,
    pub config_path: PathBuf,

    // Query input
    pub query_input: String,
    pub query_cursor: usize, // cursor position in query_input, in chars

    // Chat scrolling
    pub chat_scroll: u16,
    pub chat_max_scroll: u16, // updated during render
    pub chat_height: u16,
    /// Stick to the newest output until the user scrolls up.
    pub follow_output: bool,

    // Animation state
    pub animation_frame: u8, // 0-2 for ellipsis animation

    // Model picker state
    pub show_model_picker: bool,
    pub available_models: Vec<Model>,
    pub model_picker_state: ListState,

    /// One-line feedback for rejected actions, cleared on the next key.
    pub flash: Option<String>,

    // Panel area for mouse hit-testing (updated during render)
    pub chat_area: Option<Rect>,
}

impl App {
    pub fn new(
        session: Session,
        engine: Arc<dyn InferenceEngine>,
        events: UnboundedSender<AppEvent>,
        config_path: PathBuf,
    ) -> Self {
        Self {
            should_quit: false,
            input_mode: InputMode::Normal,
            session,
            engine,
            events,
            config_path,
            query_input: String::new(),
            query_cursor: 0,
            chat_scroll: 0,
            chat_max_scroll: 0,
            chat_height: 0,
            follow_output: true,
            animation_frame: 0,
            show_model_picker: false,
            available_models: Model::all(),
            model_picker_state: ListState::default(),
            flash: None,
            chat_area: None,
        }
    }

    pub fn on_session_event(&mut self, event: SessionEvent) {
        self.session.handle_event(event);
    }

    // Session actions

    pub fn request_load(&mut self) {
        match self.session.begin_load() {
            Ok(model) => {
                self.follow_output = true;
                driver::spawn_load(self.engine.clone(), model, self.events.clone());
            }
            Err(e) => self.flash = Some(e.to_string()),
        }
    }

    pub fn request_unload(&mut self) {
        match self.session.unload() {
            Ok(handle) => {
                if let Some(handle) = handle {
                    driver::spawn_unload(handle);
                }
                self.chat_scroll = 0;
                self.follow_output = true;
            }
            Err(e) => self.flash = Some(e.to_string()),
        }
    }

    /// Send the current input. Blank input is ignored; input typed while a
    /// reply is streaming stays in the box until the model is ready again.
    pub fn submit_query(&mut self) {
        if self.query_input.trim().is_empty() {
            return;
        }
        if self.session.state() != SessionState::Ready {
            self.flash = Some(match self.session.state() {
                SessionState::Generating => "Wait for the current reply to finish".to_string(),
                _ => "Load a model before sending messages".to_string(),
            });
            return;
        }

        let Some(request) = self.session.submit(&self.query_input) else {
            return;
        };
        driver::spawn_generation(request, self.events.clone());

        self.query_input.clear();
        self.query_cursor = 0;
        self.follow_output = true;
        self.animation_frame = 0;
    }

    /// Release the engine on the way out.
    pub fn shutdown(&mut self) -> Option<Arc<dyn EngineHandle>> {
        if !self.session.can_unload() {
            return None;
        }
        self.session.unload().ok().flatten()
    }

    // Model picker methods

    pub fn open_model_picker(&mut self) {
        if !self.session.can_select_model() {
            self.flash = Some("Unload the current model before switching".to_string());
            return;
        }
        let current = self.session.selected_model();
        let index = self.available_models.iter().position(|m| *m == current);
        self.model_picker_state.select(index.or(Some(0)));
        self.show_model_picker = true;
    }

    pub fn model_picker_nav_down(&mut self) {
        let len = self.available_models.len();
        if len > 0 {
            let i = self.model_picker_state.selected().unwrap_or(0);
            self.model_picker_state.select(Some((i + 1).min(len - 1)));
        }
    }

    pub fn model_picker_nav_up(&mut self) {
        let i = self.model_picker_state.selected().unwrap_or(0);
        self.model_picker_state.select(Some(i.saturating_sub(1)));
    }

    pub fn select_model(&mut self) {
        let Some(model) = self
            .model_picker_state
            .selected()
            .and_then(|i| self.available_models.get(i).copied())
        else {
            return;
        };
        self.show_model_picker = false;

        if let Err(e) = self.session.select_model(model) {
            self.flash = Some(e.to_string());
            return;
        }
        debug!(model = %model, "model selected");
        // Save to config
        if let Err(e) = Config::save_default_model(&self.config_path, model) {
            warn!(error = %e, "could not remember default model");
        }
    }

    // Chat scrolling

    pub fn scroll_down(&mut self, lines: u16) {
        self.chat_scroll = self.chat_scroll.saturating_add(lines).min(self.chat_max_scroll);
        self.follow_output = self.chat_scroll >= self.chat_max_scroll;
    }

    pub fn scroll_up(&mut self, lines: u16) {
        self.chat_scroll = self.chat_scroll.saturating_sub(lines);
        self.follow_output = false;
    }

    pub fn page_down(&mut self) {
        self.scroll_down(self.chat_height.max(2) - 1);
    }

    pub fn page_up(&mut self) {
        self.scroll_up(self.chat_height.max(2) - 1);
    }

    pub fn scroll_to_bottom(&mut self) {
        self.chat_scroll = self.chat_max_scroll;
        self.follow_output = true;
    }

    /// Tick animation frame (called by Tick event)
    pub fn tick_animation(&mut self) {
        if self.session.state() == SessionState::Generating {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::stream;
    use localchat_core::engine::DeltaStream;
    use localchat_core::{
        CapabilityReport, ChatMessage, ChatParams, EngineError, GenerationError, OllamaEngine,
    };
    use tokio::sync::mpsc;

    /// Loaded model that answers every message with nothing.
    pub(crate) struct SilentHandle;

    #[async_trait]
    impl EngineHandle for SilentHandle {
        fn model(&self) -> &str {
            Model::DEFAULT.as_str()
        }

        async fn stream_chat(
            &self,
            _history: &[ChatMessage],
            _params: &ChatParams,
        ) -> Result<DeltaStream, GenerationError> {
            Ok(Box::pin(stream::empty()))
        }

        async fn unload(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    pub(crate) fn app(dir: &tempfile::TempDir) -> (App, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = Session::new(Model::DEFAULT, ChatParams::default());
        session.handle_event(SessionEvent::Probed(CapabilityReport::ready("Test GPU")));
        let engine = Arc::new(OllamaEngine::new("http://127.0.0.1:9"));
        let app = App::new(session, engine, tx, dir.path().join("config.json"));
        (app, rx)
    }

    pub(crate) fn loaded_app(dir: &tempfile::TempDir) -> (App, mpsc::UnboundedReceiver<AppEvent>) {
        let (mut app, rx) = app(dir);
        app.session.begin_load().unwrap();
        app.session
            .handle_event(SessionEvent::Loaded(Ok(Arc::new(SilentHandle))));
        assert_eq!(app.session.state(), SessionState::Ready);
        (app, rx)
    }

    #[tokio::test]
    async fn test_submit_sends_trimmed_input() {
        let dir = tempfile::TempDir::new().unwrap();
        let (mut app, _rx) = loaded_app(&dir);
        app.query_input = "  What is Rust?\n\n".to_string();
        app.query_cursor = app.query_input.chars().count();

        app.submit_query();

        assert_eq!(app.session.state(), SessionState::Generating);
        assert_eq!(app.session.history().messages()[0].content, "What is Rust?");
        let user_entry = app
            .session
            .transcript()
            .entries()
            .iter()
            .find(|e| e.role == localchat_core::EntryRole::User)
            .unwrap();
        assert_eq!(user_entry.content, "What is Rust?");
        assert!(app.query_input.is_empty());
    }

    #[test]
    fn test_select_model_persists_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let (mut app, _rx) = app(&dir);

        app.open_model_picker();
        assert!(app.show_model_picker);
        app.model_picker_nav_down();
        app.model_picker_nav_down();
        app.select_model();

        let chosen = Model::all()[2];
        assert!(!app.show_model_picker);
        assert_eq!(app.session.selected_model(), chosen);
        let config = Config::load_from(&app.config_path).unwrap();
        assert_eq!(config.model(), Some(chosen));
    }

    #[test]
    fn test_picker_nav_stays_in_bounds() {
        let dir = tempfile::TempDir::new().unwrap();
        let (mut app, _rx) = app(&dir);
        app.open_model_picker();

        app.model_picker_nav_up();
        assert_eq!(app.model_picker_state.selected(), Some(0));
        for _ in 0..20 {
            app.model_picker_nav_down();
        }
        assert_eq!(app.model_picker_state.selected(), Some(app.available_models.len() - 1));
    }

    #[test]
    fn test_submit_without_model_keeps_input() {
        let dir = tempfile::TempDir::new().unwrap();
        let (mut app, _rx) = app(&dir);
        app.query_input = "hello".to_string();
        app.query_cursor = 5;

        app.submit_query();
        assert_eq!(app.query_input, "hello");
        assert!(app.flash.is_some());
        assert_eq!(app.session.state(), SessionState::Unloaded);
    }

    #[test]
    fn test_scroll_tracks_follow_mode() {
        let dir = tempfile::TempDir::new().unwrap();
        let (mut app, _rx) = app(&dir);
        app.chat_max_scroll = 10;
        app.chat_height = 4;

        app.scroll_to_bottom();
        app.scroll_up(3);
        assert_eq!(app.chat_scroll, 7);
        assert!(!app.follow_output);

        app.page_down();
        assert_eq!(app.chat_scroll, 10);
        assert!(app.follow_output);
    }
}

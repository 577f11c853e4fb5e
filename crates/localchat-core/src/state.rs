//! UI-agnostic conversation types
//!
//! These are shared by every frontend and don't depend on any UI framework.

use serde::{Deserialize, Serialize};

/// A chat message in the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// The role of a chat message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    /// UI-only; never replayed to the engine.
    Error,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Error => "error",
        }
    }
}

/// Ordered, chronological message history for one loaded model.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    messages: Vec<ChatMessage>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// The history as the engine should see it, with error entries dropped.
    pub fn for_engine(&self) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .filter(|m| m.role != ChatRole::Error)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_engine_skips_errors() {
        let mut history = ConversationHistory::new();
        history.push(ChatMessage::user("hi"));
        history.push(ChatMessage {
            role: ChatRole::Error,
            content: "Error: boom".to_string(),
        });
        history.push(ChatMessage::assistant("hello"));

        let replay = history.for_engine();
        assert_eq!(replay.len(), 2);
        assert!(replay.iter().all(|m| m.role != ChatRole::Error));
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&ChatMessage::assistant("x")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"x"}"#);
    }
}

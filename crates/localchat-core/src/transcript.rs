//! What the user sees: role-tagged entries with the markup transform applied.

use crate::markup::{self, Line};
use crate::state::ChatRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryRole {
    User,
    Assistant,
    Error,
    /// Banners such as the "model unloaded" hint. Never part of the conversation.
    Notice,
}

impl From<ChatRole> for EntryRole {
    fn from(role: ChatRole) -> Self {
        match role {
            ChatRole::User => EntryRole::User,
            ChatRole::Assistant => EntryRole::Assistant,
            ChatRole::Error => EntryRole::Error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub role: EntryRole,
    pub content: String,
    pub lines: Vec<Line>,
    /// Still receiving deltas.
    pub streaming: bool,
}

/// Append-only list of entries until `clear`.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, role: impl Into<EntryRole>, content: impl Into<String>) -> usize {
        let content = content.into();
        self.entries.push(TranscriptEntry {
            role: role.into(),
            lines: markup::format(&content),
            content,
            streaming: false,
        });
        self.entries.len() - 1
    }

    /// Open an empty assistant entry that will be filled by `update_streaming`.
    pub fn push_streaming(&mut self) -> usize {
        let index = self.push(EntryRole::Assistant, String::new());
        self.entries[index].streaming = true;
        index
    }

    /// Replace the content of a streaming entry. Settled entries are never rewritten.
    pub fn update_streaming(&mut self, index: usize, content: &str, lines: &[Line]) -> bool {
        match self.entries.get_mut(index) {
            Some(entry) if entry.streaming => {
                entry.content.clear();
                entry.content.push_str(content);
                entry.lines = lines.to_vec();
                true
            }
            _ => false,
        }
    }

    pub fn settle(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.streaming = false;
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.entries.last()
    }
}

//! Splits streamed model output into reasoning ("thinking") and answer text.
//!
//! Reasoning models wrap their trace in inline `<think>` / `</think>` markers.
//! Markers are matched per fragment only: a marker straddling two fragments is
//! treated as ordinary text.

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentUpdate {
    /// Full answer text accumulated so far.
    Answer(String),
    /// Full thinking text accumulated for the current span.
    Thinking(String),
    /// The thinking span closed and its accumulator was reset.
    ThinkingCleared,
}

#[derive(Debug, Clone, Default)]
pub struct ThinkingSegmenter {
    answer: String,
    thinking: String,
    in_thinking_block: bool,
}

impl ThinkingSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(&self) -> &str {
        &self.answer
    }

    pub fn thinking(&self) -> &str {
        &self.thinking
    }

    pub fn is_thinking(&self) -> bool {
        self.in_thinking_block
    }

    pub fn into_answer(self) -> String {
        self.answer
    }

    pub fn push(&mut self, fragment: &str) -> Vec<SegmentUpdate> {
        let mut updates = Vec::new();

        if let Some(open) = fragment.find(THINK_OPEN) {
            let before = &fragment[..open];
            if !before.trim().is_empty() {
                self.answer.push_str(before);
                updates.push(SegmentUpdate::Answer(self.answer.clone()));
            }

            self.in_thinking_block = true;
            let after = &fragment[open + THINK_OPEN.len()..];
            if !fragment.contains(THINK_CLOSE) {
                self.thinking.push_str(after);
                updates.push(SegmentUpdate::Thinking(self.thinking.clone()));
            }
        } else if let Some(close) = fragment.find(THINK_CLOSE) {
            let before = &fragment[..close];
            if !before.trim().is_empty() {
                self.thinking.push_str(before);
                updates.push(SegmentUpdate::Thinking(self.thinking.clone()));
            }

            self.in_thinking_block = false;
            self.thinking.clear();
            updates.push(SegmentUpdate::ThinkingCleared);

            let after = &fragment[close + THINK_CLOSE.len()..];
            if !after.trim().is_empty() {
                self.answer.push_str(after);
                updates.push(SegmentUpdate::Answer(self.answer.clone()));
            }
        } else if self.in_thinking_block {
            self.thinking.push_str(fragment);
            updates.push(SegmentUpdate::Thinking(self.thinking.clone()));
        } else {
            self.answer.push_str(fragment);
            updates.push(SegmentUpdate::Answer(self.answer.clone()));
        }

        updates
    }
}

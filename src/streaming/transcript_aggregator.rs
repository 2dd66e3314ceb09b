//! Live transcript aggregation
//!
//! The backend sends `transcription` events for the response being spoken.
//! Interim results revise the current utterance; final results close it.
//!
//! # Aggregation Strategy
//!
//! - **Interim**: replaces the pending utterance (the backend re-sends it whole)
//! - **Final**: appended to the finished segments, pending text cleared

/// Aggregates live transcription events into display text
#[derive(Debug, Clone, Default)]
pub struct TranscriptAggregator {
    /// Finalized utterances, in arrival order
    segments: Vec<String>,
    /// Latest interim text of the utterance in progress
    pending: String,
    event_count: u64,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one transcription event and return the current text
    pub fn apply(&mut self, text: &str, is_final: bool) -> String {
        self.event_count += 1;

        if is_final {
            let text = text.trim();
            if !text.is_empty() {
                self.segments.push(text.to_string());
            }
            self.pending.clear();
            log::debug!(
                "TranscriptAggregator: {} final segments after {} events",
                self.segments.len(),
                self.event_count
            );
        } else {
            self.pending = text.trim().to_string();
        }

        self.current_text()
    }

    /// Finalized segments followed by the interim text, space-separated
    pub fn current_text(&self) -> String {
        let mut parts: Vec<&str> = self.segments.iter().map(String::as_str).collect();
        if !self.pending.is_empty() {
            parts.push(&self.pending);
        }
        parts.join(" ")
    }

    /// Only the finalized segments
    pub fn final_text(&self) -> String {
        self.segments.join(" ")
    }
}

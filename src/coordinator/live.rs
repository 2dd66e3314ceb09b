//! Auxiliary state fed by inbound stream events

use serde::Serialize;

use crate::streaming::{AiResponse, AudioProcessed, RealTimeFeedback, TranscriptAggregator, Transcription};

/// Maximum AI responses / feedback items kept per task
const MAX_ITEMS: usize = 50;

#[derive(Debug, Clone, Default, Serialize)]
pub struct LiveFeedback {
    #[serde(skip)]
    aggregator: TranscriptAggregator,
    /// Finalized text plus the utterance in progress
    pub transcript: String,
    pub ai_responses: Vec<AiResponse>,
    pub feedback: Vec<RealTimeFeedback>,
    pub chunks_acknowledged: u64,
    pub last_error: Option<String>,
}

impl LiveFeedback {
    pub fn apply_transcription(&mut self, transcription: &Transcription) {
        self.transcript = self
            .aggregator
            .apply(&transcription.text, transcription.is_final);
    }

    /// Finalized transcript, if any was received
    pub fn final_transcript(&self) -> Option<String> {
        let text = self.aggregator.final_text();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    pub fn push_ai_response(&mut self, response: &AiResponse) {
        push_bounded(&mut self.ai_responses, response.clone());
    }

    pub fn push_feedback(&mut self, feedback: &RealTimeFeedback) {
        push_bounded(&mut self.feedback, feedback.clone());
    }

    pub fn audio_processed(&mut self, _ack: &AudioProcessed) {
        self.chunks_acknowledged += 1;
    }

    pub fn record_error(&mut self, message: &str) {
        self.last_error = Some(message.to_string());
    }

    /// Start fresh for a new task
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn push_bounded<T>(items: &mut Vec<T>, item: T) {
    if items.len() >= MAX_ITEMS {
        items.remove(0);
    }
    items.push(item);
}

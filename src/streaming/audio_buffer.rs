//! Audio chunks and the bounded backlog used while the stream reconnects
//!
//! Chunks produced while the stream is down are held in a ring buffer and
//! flushed, in order, once the stream re-authenticates. When the backlog is
//! full the oldest chunk is evicted.
//!
//! # Memory Budget
//!
//! At 16kHz mono PCM16 with 1s chunks:
//! - Chunk size: 16000 samples × 2 bytes = 32,000 bytes
//! - 10 seconds: 10 chunks × 32,000 bytes = 320 KB

use std::collections::VecDeque;

use super::protocol::ClientMessage;

/// Slots reserved up front; larger backlogs grow on demand
const PREALLOCATED_CHUNKS: usize = 32;

/// Payload encoding of an [`AudioChunk`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkEncoding {
    /// Signed 16-bit little-endian mono PCM
    Pcm16Le,
}

impl ChunkEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkEncoding::Pcm16Le => "pcm16le",
        }
    }
}

/// One slice of a recording, ready for transport
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Strictly increasing within one recording, starting at 0
    pub sequence_id: u64,
    /// Encoded audio bytes
    pub payload: Vec<u8>,
    /// Capture wall-clock time, milliseconds since the Unix epoch
    pub captured_at_ms: i64,
    pub encoding: ChunkEncoding,
    pub sample_rate: u32,
}

impl AudioChunk {
    /// Encode PCM16 samples as a little-endian chunk
    pub fn from_samples(
        sequence_id: u64,
        samples: &[i16],
        sample_rate: u32,
        captured_at_ms: i64,
    ) -> Self {
        let payload = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self {
            sequence_id,
            payload,
            captured_at_ms,
            encoding: ChunkEncoding::Pcm16Le,
            sample_rate,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.payload.len() / std::mem::size_of::<i16>()
    }

    /// Duration of this chunk in milliseconds
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.sample_count() as u64 * 1000) / self.sample_rate as u64
    }

    /// The `audio_chunk` message carrying this chunk (base64 payload)
    pub fn to_message(&self) -> ClientMessage {
        ClientMessage::audio_chunk(self.sequence_id, &self.payload, self.captured_at_ms)
    }
}

/// Ring buffer of chunks awaiting an authenticated stream
///
/// Not internally synchronized; the capture pipeline keeps it behind a mutex.
#[derive(Debug)]
pub struct ChunkBacklog {
    chunks: VecDeque<AudioChunk>,
    max_chunks: usize,
    evicted: u64,
}

impl ChunkBacklog {
    /// Create a backlog holding up to `max_duration_secs` of audio
    ///
    /// # Example
    /// ```ignore
    /// // 10 seconds in 1000ms chunks = 10 chunks max
    /// let backlog = ChunkBacklog::new(10.0, 1000);
    /// ```
    pub fn new(max_duration_secs: f32, chunk_duration_ms: u32) -> Self {
        let max_chunks = if max_duration_secs <= 0.0 || chunk_duration_ms == 0 {
            0
        } else {
            let chunks_per_second = 1000.0 / chunk_duration_ms as f32;
            (max_duration_secs * chunks_per_second).ceil() as usize
        };

        Self {
            chunks: VecDeque::with_capacity(max_chunks.min(PREALLOCATED_CHUNKS)),
            max_chunks,
            evicted: 0,
        }
    }

    /// Whether this backlog can hold anything at all
    pub fn is_enabled(&self) -> bool {
        self.max_chunks > 0
    }

    /// Queue a chunk, evicting the oldest if full.
    ///
    /// Returns false when the backlog is disabled and the chunk was dropped.
    pub fn push(&mut self, chunk: AudioChunk) -> bool {
        if self.max_chunks == 0 {
            return false;
        }

        if self.chunks.len() >= self.max_chunks {
            if let Some(old) = self.chunks.pop_front() {
                self.evicted += 1;
                log::warn!(
                    "ChunkBacklog: full, evicted chunk {} ({} evicted so far)",
                    old.sequence_id,
                    self.evicted
                );
            }
        }

        self.chunks.push_back(chunk);
        true
    }

    /// Remove every queued chunk, oldest first
    pub fn drain_all(&mut self) -> Vec<AudioChunk> {
        self.chunks.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Number of chunks lost to eviction
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Total duration of queued audio in milliseconds
    pub fn duration_ms(&self) -> u64 {
        self.chunks.iter().map(|c| c.duration_ms()).sum()
    }

    /// Approximate memory usage in bytes
    pub fn memory_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.payload.len()).sum()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}

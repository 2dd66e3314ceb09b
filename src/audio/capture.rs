//! AudioCapturePipeline: microphone → fixed-duration chunks → live stream
//!
//! # Architecture
//!
//! ```text
//! Capture Thread (sync)            Tokio Runtime (async)
//! ┌──────────────────┐             ┌─────────────────────────────┐
//! │ AudioSource      │──channel──▶ │ Chunker::run()              │
//! │ try_send(mono)   │             │   ├─ downsample             │
//! └──────────────────┘             │   ├─ chunk (1000ms)         │
//!                                  │   ├─ keep full recording    │
//!                                  │   └─ forward to connection  │
//!                                  └─────────────────────────────┘
//! ```
//!
//! Chunk forwarding:
//! - Authenticated: flush the backlog, then send
//! - Connecting / Reconnecting: hold in the backlog (if enabled)
//! - Otherwise (or no connection bound): drop with a warning

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::microphone::{AudioSource, CaptureConstraints, CpalMicrophone};
use super::resample::{downsample, effective_rate};
use super::wav::encode_wav;
use super::CaptureError;
use crate::api::AudioUpload;
use crate::streaming::{AudioChunk, ChunkBacklog, ConnectionManager, ConnectionStatus};

/// Capacity of the capture channel, in device buffers
const CAPTURE_CHANNEL_CAPACITY: usize = 256;

/// Log every N chunks
const CHUNK_LOG_INTERVAL: u64 = 10;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub constraints: CaptureConstraints,
    pub chunk_duration_ms: u32,
    /// Audio held while the stream reconnects; 0 drops instead
    pub reconnect_buffer_secs: f32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            constraints: CaptureConstraints::default(),
            chunk_duration_ms: 1000,
            reconnect_buffer_secs: 10.0,
        }
    }
}

/// Samples per chunk at `sample_rate`
pub fn samples_per_chunk(sample_rate: u32, chunk_duration_ms: u32) -> usize {
    ((sample_rate as u64 * chunk_duration_ms as u64) / 1000).max(1) as usize
}

/// Chunk delivery counters for one recording
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    pub chunks: u64,
    pub sent: u64,
    pub buffered: u64,
    pub dropped: u64,
}

/// Everything captured between start and stop
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub stats: CaptureStats,
}

impl CapturedAudio {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }

    pub fn to_wav(&self) -> Result<Vec<u8>, CaptureError> {
        encode_wav(&self.samples, self.sample_rate)
    }

    /// WAV upload named `file_name`
    pub fn to_upload(&self, file_name: &str) -> Result<AudioUpload, CaptureError> {
        Ok(AudioUpload {
            file_name: file_name.to_string(),
            mime_type: "audio/wav".to_string(),
            bytes: self.to_wav()?,
            duration_ms: self.duration_ms(),
        })
    }
}

type ConnectionSlot = Arc<Mutex<Option<ConnectionManager>>>;

pub struct AudioCapturePipeline {
    config: CaptureConfig,
    source: Box<dyn AudioSource>,
    native_rate: Option<u32>,
    connection: ConnectionSlot,
    recording: Option<JoinHandle<CapturedAudio>>,
}

impl AudioCapturePipeline {
    pub fn new(config: CaptureConfig, source: Box<dyn AudioSource>) -> Self {
        Self {
            config,
            source,
            native_rate: None,
            connection: Arc::new(Mutex::new(None)),
            recording: None,
        }
    }

    /// Pipeline over the default input device
    pub fn with_default_microphone(config: CaptureConfig) -> Self {
        Self::new(config, Box::new(CpalMicrophone::new()))
    }

    /// Acquire the microphone. A second call after success is a no-op.
    pub fn initialize(&mut self) -> Result<(), CaptureError> {
        if self.native_rate.is_some() {
            return Ok(());
        }

        let native_rate = self.source.acquire(&self.config.constraints)?;
        let rate = effective_rate(native_rate, self.config.constraints.sample_rate);
        if rate != self.config.constraints.sample_rate {
            log::warn!(
                "AudioCapture: cannot resample {}Hz to {}Hz, streaming at {}Hz",
                native_rate,
                self.config.constraints.sample_rate,
                rate
            );
        }

        log::info!("AudioCapture: initialized (native {}Hz)", native_rate);
        self.native_rate = Some(native_rate);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.native_rate.is_some()
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Bind (or unbind) the chunk sink; takes effect from the next chunk
    pub fn set_connection(&self, connection: Option<ConnectionManager>) {
        *self.connection.lock() = connection;
    }

    /// Begin capture. Must be called inside a tokio runtime.
    pub async fn start_recording(&mut self) -> Result<(), CaptureError> {
        let native_rate = self.native_rate.ok_or(CaptureError::NotInitialized)?;
        if self.recording.is_some() {
            return Err(CaptureError::AlreadyRecording);
        }

        let (tx, rx) = mpsc::channel::<Vec<i16>>(CAPTURE_CHANNEL_CAPACITY);
        self.source.start(tx).await?;

        let chunker = Chunker::new(&self.config, native_rate, self.connection.clone());
        self.recording = Some(tokio::spawn(chunker.run(rx)));

        log::info!("AudioCapture: recording started");
        Ok(())
    }

    /// End capture and return the recording. Safe from any state.
    pub async fn stop_recording(&mut self) -> Option<CapturedAudio> {
        let task = self.recording.take()?;

        // Dropping the source's sender ends the chunker loop
        self.source.stop().await;

        match task.await {
            Ok(captured) => {
                log::info!(
                    "AudioCapture: recording stopped ({}ms, {} chunks, {} sent, {} dropped)",
                    captured.duration_ms(),
                    captured.stats.chunks,
                    captured.stats.sent,
                    captured.stats.dropped
                );
                Some(captured)
            }
            Err(e) => {
                log::error!("AudioCapture: chunker task failed: {}", e);
                None
            }
        }
    }

    /// Release the microphone. Safe from any state.
    pub async fn cleanup(&mut self) {
        if self.recording.is_some() {
            let _ = self.stop_recording().await;
        }
        self.source.release().await;
        self.native_rate = None;
    }
}

/// Turns device buffers into chunks for one recording
struct Chunker {
    source_rate: u32,
    rate: u32,
    samples_per_chunk: usize,
    pending: Vec<i16>,
    recording: Vec<i16>,
    next_sequence: u64,
    connection: ConnectionSlot,
    backlog: ChunkBacklog,
    stats: CaptureStats,
}

impl Chunker {
    fn new(config: &CaptureConfig, source_rate: u32, connection: ConnectionSlot) -> Self {
        let rate = effective_rate(source_rate, config.constraints.sample_rate);
        let samples_per_chunk = samples_per_chunk(rate, config.chunk_duration_ms);

        log::info!(
            "AudioCapture: chunker ({}Hz → {}Hz, {}ms chunks = {} samples)",
            source_rate,
            rate,
            config.chunk_duration_ms,
            samples_per_chunk
        );

        Self {
            source_rate,
            rate,
            samples_per_chunk,
            pending: Vec::with_capacity(samples_per_chunk * 2),
            recording: Vec::new(),
            next_sequence: 0,
            connection,
            backlog: ChunkBacklog::new(config.reconnect_buffer_secs, config.chunk_duration_ms),
            stats: CaptureStats::default(),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Vec<i16>>) -> CapturedAudio {
        while let Some(samples) = rx.recv().await {
            let samples = downsample(&samples, self.source_rate, self.rate);
            self.recording.extend_from_slice(&samples);
            self.pending.extend(samples);

            while self.pending.len() >= self.samples_per_chunk {
                self.emit_chunk();
            }
        }

        // Source stopped: the remainder goes out as a short final chunk
        if !self.pending.is_empty() {
            log::debug!(
                "AudioCapture: final partial chunk ({} samples)",
                self.pending.len()
            );
            self.emit_chunk();
        }

        if !self.backlog.is_empty() {
            let connection = self.connection.lock().clone();
            match connection {
                Some(connection) if connection.status() == ConnectionStatus::Authenticated => {
                    log::debug!(
                        "AudioCapture: flushing {} backlogged chunks at stop",
                        self.backlog.len()
                    );
                    self.flush_backlog(&connection);
                }
                _ => {
                    log::warn!(
                        "AudioCapture: {} chunks still waiting for the stream at stop, discarding",
                        self.backlog.len()
                    );
                    self.stats.dropped += self.backlog.len() as u64;
                    self.backlog.clear();
                }
            }
        }
        self.stats.dropped += self.backlog.evicted();

        CapturedAudio {
            samples: self.recording,
            sample_rate: self.rate,
            stats: self.stats,
        }
    }

    fn emit_chunk(&mut self) {
        let size = self.pending.len().min(self.samples_per_chunk);
        let samples: Vec<i16> = self.pending.drain(..size).collect();

        let duration_ms = (samples.len() as i64 * 1000) / self.rate.max(1) as i64;
        let captured_at_ms = Utc::now().timestamp_millis() - duration_ms;

        let chunk = AudioChunk::from_samples(self.next_sequence, &samples, self.rate, captured_at_ms);
        self.next_sequence += 1;
        self.stats.chunks += 1;

        self.forward(chunk);

        if self.stats.chunks % CHUNK_LOG_INTERVAL == 0 {
            log::debug!(
                "AudioCapture: {} chunks ({} sent, {} buffered, {} dropped)",
                self.stats.chunks,
                self.stats.sent,
                self.stats.buffered,
                self.stats.dropped
            );
        }
    }

    fn forward(&mut self, chunk: AudioChunk) {
        let connection = self.connection.lock().clone();

        let Some(connection) = connection else {
            log::warn!("AudioCapture: no connection bound, dropping chunk {}", chunk.sequence_id);
            self.stats.dropped += 1;
            return;
        };

        match connection.status() {
            ConnectionStatus::Authenticated => {
                self.flush_backlog(&connection);
                self.deliver(&connection, &chunk);
            }
            ConnectionStatus::Connecting
            | ConnectionStatus::Connected
            | ConnectionStatus::Reconnecting
                if self.backlog.is_enabled() =>
            {
                self.backlog.push(chunk);
                self.stats.buffered += 1;
            }
            status => {
                log::warn!(
                    "AudioCapture: connection {:?}, dropping chunk {}",
                    status,
                    chunk.sequence_id
                );
                self.stats.dropped += 1;
            }
        }
    }

    fn flush_backlog(&mut self, connection: &ConnectionManager) {
        for queued in self.backlog.drain_all() {
            self.deliver(connection, &queued);
        }
    }

    fn deliver(&mut self, connection: &ConnectionManager, chunk: &AudioChunk) {
        if connection.send(&chunk.to_message()) {
            self.stats.sent += 1;
        } else {
            log::warn!("AudioCapture: send failed, dropping chunk {}", chunk.sequence_id);
            self.stats.dropped += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Source whose sink is handed to the test
    struct ScriptedSource {
        rate: u32,
        sink: Arc<Mutex<Option<mpsc::Sender<Vec<i16>>>>>,
        fail_acquire: bool,
    }

    #[async_trait::async_trait]
    impl AudioSource for ScriptedSource {
        fn acquire(&mut self, _: &CaptureConstraints) -> Result<u32, CaptureError> {
            if self.fail_acquire {
                return Err(CaptureError::MicrophoneAccessDenied("denied".to_string()));
            }
            Ok(self.rate)
        }

        async fn start(&mut self, sink: mpsc::Sender<Vec<i16>>) -> Result<(), CaptureError> {
            *self.sink.lock() = Some(sink);
            Ok(())
        }

        async fn stop(&mut self) {
            self.sink.lock().take();
        }

        async fn release(&mut self) {}
    }

    fn pipeline(rate: u32) -> (AudioCapturePipeline, Arc<Mutex<Option<mpsc::Sender<Vec<i16>>>>>) {
        let sink = Arc::new(Mutex::new(None));
        let source = ScriptedSource {
            rate,
            sink: sink.clone(),
            fail_acquire: false,
        };
        (
            AudioCapturePipeline::new(CaptureConfig::default(), Box::new(source)),
            sink,
        )
    }

    #[test]
    fn test_samples_per_chunk() {
        assert_eq!(samples_per_chunk(16000, 1000), 16000);
        assert_eq!(samples_per_chunk(48000, 100), 4800);
    }

    #[tokio::test]
    async fn test_start_requires_initialize() {
        let (mut pipeline, _sink) = pipeline(16000);
        assert!(matches!(
            pipeline.start_recording().await,
            Err(CaptureError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let (mut pipeline, _sink) = pipeline(16000);
        pipeline.initialize().unwrap();
        pipeline.start_recording().await.unwrap();

        assert!(matches!(
            pipeline.start_recording().await,
            Err(CaptureError::AlreadyRecording)
        ));
        assert!(pipeline.stop_recording().await.is_some());
    }

    #[tokio::test]
    async fn test_access_denied_surfaces() {
        let source = ScriptedSource {
            rate: 16000,
            sink: Arc::new(Mutex::new(None)),
            fail_acquire: true,
        };
        let mut pipeline = AudioCapturePipeline::new(CaptureConfig::default(), Box::new(source));

        assert!(matches!(
            pipeline.initialize(),
            Err(CaptureError::MicrophoneAccessDenied(_))
        ));
        assert!(!pipeline.is_initialized());
    }

    #[tokio::test]
    async fn test_stop_without_recording_is_none() {
        let (mut pipeline, _sink) = pipeline(16000);
        assert!(pipeline.stop_recording().await.is_none());
        pipeline.cleanup().await;
        pipeline.cleanup().await;
    }

    #[tokio::test]
    async fn test_unbound_chunks_dropped_but_recorded() {
        let (mut pipeline, sink) = pipeline(48000);
        pipeline.initialize().unwrap();
        pipeline.start_recording().await.unwrap();

        let tx = sink.lock().clone().unwrap();
        // 1.5s at 48kHz → 1.5s at 16kHz: one full chunk plus a partial one
        tx.send(vec![300i16; 72000]).await.unwrap();
        drop(tx);

        let captured = pipeline.stop_recording().await.unwrap();

        assert_eq!(captured.sample_rate, 16000);
        assert_eq!(captured.samples.len(), 24000);
        assert_eq!(captured.duration_ms(), 1500);
        assert_eq!(captured.stats.chunks, 2);
        assert_eq!(captured.stats.sent, 0);
        assert_eq!(captured.stats.dropped, 2);
    }

    #[tokio::test]
    async fn test_captured_audio_upload_is_wav() {
        let captured = CapturedAudio {
            samples: vec![0i16; 1600],
            sample_rate: 16000,
            stats: CaptureStats::default(),
        };
        let upload = captured.to_upload("task-1.wav").unwrap();

        assert_eq!(upload.mime_type, "audio/wav");
        assert_eq!(upload.duration_ms, 100);
        assert_eq!(&upload.bytes[0..4], b"RIFF");
    }
}

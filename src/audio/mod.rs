//! Microphone capture for spoken responses
//!
//! Uses CPAL for capture and hound for WAV encoding. The pipeline slices the
//! microphone signal into fixed-duration PCM16 chunks for the live stream and
//! keeps the full recording for upload.

mod capture;
mod microphone;
mod resample;
mod wav;

pub use capture::{
    samples_per_chunk, AudioCapturePipeline, CaptureConfig, CaptureStats, CapturedAudio,
};
pub use microphone::{AudioSource, CaptureConstraints, CpalMicrophone};
pub use resample::{downmix_to_mono, downsample, effective_rate};
pub use wav::encode_wav;

/// Errors that can occur during audio capture
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureError {
    /// The microphone could not be opened (no device, permission, config)
    MicrophoneAccessDenied(String),
    /// `start_recording` before `initialize`
    NotInitialized,
    /// `start_recording` twice without a stop
    AlreadyRecording,
    StreamFailed(String),
    EncodeFailed(String),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::MicrophoneAccessDenied(e) => {
                write!(f, "Microphone access denied: {}", e)
            }
            CaptureError::NotInitialized => write!(f, "Microphone not initialized"),
            CaptureError::AlreadyRecording => write!(f, "Already recording"),
            CaptureError::StreamFailed(e) => write!(f, "Audio stream failed: {}", e),
            CaptureError::EncodeFailed(e) => write!(f, "Failed to encode audio: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_error_display() {
        let err = CaptureError::MicrophoneAccessDenied("permission denied".to_string());
        assert!(err.to_string().contains("permission denied"));
        assert_eq!(CaptureError::NotInitialized.to_string(), "Microphone not initialized");
    }
}

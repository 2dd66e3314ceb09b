//! Microphone sources
//!
//! [`AudioSource`] is the seam between the capture pipeline and the device.
//! [`CpalMicrophone`] captures from the default input device; the cpal stream
//! is not `Send`, so it lives on a dedicated thread for the length of one
//! recording and pushes mono PCM16 buffers into a tokio channel. Waiting on
//! that thread never happens on the async runtime.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use tokio::sync::{mpsc, oneshot};

use super::resample::downmix_to_mono;
use super::CaptureError;

/// What the pipeline asks of the microphone
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConstraints {
    pub channels: u16,
    pub sample_rate: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            channels: 1,
            sample_rate: 16000,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// A microphone the pipeline can acquire, run and release
#[async_trait]
pub trait AudioSource: Send {
    /// Request access; returns the native sample rate of the delivered audio
    fn acquire(&mut self, constraints: &CaptureConstraints) -> Result<u32, CaptureError>;

    /// Begin delivering mono PCM16 buffers to `sink`
    async fn start(&mut self, sink: mpsc::Sender<Vec<i16>>) -> Result<(), CaptureError>;

    /// Stop delivering. Must drop every clone of the sink.
    async fn stop(&mut self);

    /// Give the device back
    async fn release(&mut self);
}

struct StreamWorker {
    stop_tx: std_mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Default input device via cpal
#[derive(Default)]
pub struct CpalMicrophone {
    constraints: Option<CaptureConstraints>,
    native_rate: Option<u32>,
    worker: Option<StreamWorker>,
}

impl CpalMicrophone {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Join the capture thread off the async runtime
async fn join_worker(handle: JoinHandle<()>) {
    match tokio::task::spawn_blocking(move || handle.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => log::error!("Microphone: capture thread panicked"),
        Err(e) => log::error!("Microphone: failed to join capture thread: {}", e),
    }
}

#[async_trait]
impl AudioSource for CpalMicrophone {
    fn acquire(&mut self, constraints: &CaptureConstraints) -> Result<u32, CaptureError> {
        if let Some(rate) = self.native_rate {
            return Ok(rate);
        }

        let (device, config, format) = open_input(constraints)?;

        log::info!(
            "Microphone: using {:?} ({} Hz, {} channels, {:?})",
            device.name(),
            config.sample_rate.0,
            config.channels,
            format
        );
        if constraints.echo_cancellation
            || constraints.noise_suppression
            || constraints.auto_gain_control
        {
            log::debug!(
                "Microphone: echo cancellation / noise suppression / AGC are left to the OS input stack"
            );
        }

        self.constraints = Some(constraints.clone());
        self.native_rate = Some(config.sample_rate.0);
        Ok(config.sample_rate.0)
    }

    async fn start(&mut self, sink: mpsc::Sender<Vec<i16>>) -> Result<(), CaptureError> {
        if self.worker.is_some() {
            return Err(CaptureError::AlreadyRecording);
        }
        let constraints = self.constraints.clone().ok_or(CaptureError::NotInitialized)?;

        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), CaptureError>>();

        let handle = std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let stream = match open_input(&constraints)
                    .and_then(|(device, config, format)| build_stream(&device, &config, format, sink))
                {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(CaptureError::StreamFailed(format!(
                        "Failed to start stream: {}",
                        e
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Park until stop() (or the microphone is dropped)
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Microphone: capture thread exiting");
            })
            .map_err(|e| CaptureError::StreamFailed(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                log::info!("Microphone: capture started");
                self.worker = Some(StreamWorker { stop_tx, handle });
                Ok(())
            }
            Ok(Err(e)) => {
                join_worker(handle).await;
                Err(e)
            }
            Err(_) => {
                join_worker(handle).await;
                Err(CaptureError::StreamFailed(
                    "capture thread exited before starting".to_string(),
                ))
            }
        }
    }

    async fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            join_worker(worker.handle).await;
            log::info!("Microphone: capture stopped");
        }
    }

    async fn release(&mut self) {
        self.stop().await;
        if self.native_rate.take().is_some() {
            log::info!("Microphone: released");
        }
        self.constraints = None;
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        // The thread drops its stream and exits on its own
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
        }
    }
}

/// Find the default input device and the config closest to `constraints`
fn open_input(
    constraints: &CaptureConstraints,
) -> Result<(Device, StreamConfig, SampleFormat), CaptureError> {
    let host = cpal::default_host();

    let device = host.default_input_device().ok_or_else(|| {
        CaptureError::MicrophoneAccessDenied("No audio input device found".to_string())
    })?;

    let wanted = cpal::SampleRate(constraints.sample_rate);
    let preferred = device
        .supported_input_configs()
        .map_err(|e| CaptureError::MicrophoneAccessDenied(e.to_string()))?
        .filter(|range| {
            range.min_sample_rate() <= wanted
                && wanted <= range.max_sample_rate()
                && matches!(
                    range.sample_format(),
                    SampleFormat::I16 | SampleFormat::U16 | SampleFormat::F32
                )
        })
        .min_by_key(|range| range.channels().abs_diff(constraints.channels))
        .map(|range| range.with_sample_rate(wanted));

    let supported = match preferred {
        Some(config) => config,
        None => device
            .default_input_config()
            .map_err(|e| CaptureError::MicrophoneAccessDenied(e.to_string()))?,
    };

    let format = supported.sample_format();
    Ok((device, supported.into(), format))
}

fn build_stream(
    device: &Device,
    config: &StreamConfig,
    format: SampleFormat,
    sink: mpsc::Sender<Vec<i16>>,
) -> Result<Stream, CaptureError> {
    let err_fn = |err: cpal::StreamError| log::error!("Microphone: stream error: {}", err);

    match format {
        SampleFormat::I16 => build_stream_typed::<i16>(device, config, sink, err_fn),
        SampleFormat::U16 => build_stream_typed::<u16>(device, config, sink, err_fn),
        SampleFormat::F32 => build_stream_typed::<f32>(device, config, sink, err_fn),
        other => Err(CaptureError::MicrophoneAccessDenied(format!(
            "Unsupported sample format {:?}",
            other
        ))),
    }
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    sink: mpsc::Sender<Vec<i16>>,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<Stream, CaptureError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let channels = config.channels;
    let mut overflows: u64 = 0;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<i16> = data.iter().map(|&s| sample_to_i16(s)).collect();
                let mono = downmix_to_mono(&samples, channels);

                // Never block the audio thread
                if sink.try_send(mono).is_err() {
                    overflows += 1;
                    if overflows % 100 == 1 {
                        log::warn!(
                            "Microphone: capture channel full or closed ({} buffers dropped)",
                            overflows
                        );
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| CaptureError::MicrophoneAccessDenied(e.to_string()))
}

/// Convert any sample type to i16
fn sample_to_i16<T>(sample: T) -> i16
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    let value: f32 = sample.to_sample::<f32>();
    (value.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

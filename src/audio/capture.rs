//! Audio capture using cpal
//!
//! The cpal stream is not `Send` on every host, so it lives on a dedicated
//! thread that parks until the capture is stopped. Frames reach async code
//! over an unbounded channel as mono `f32`.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AudioConfig;
use crate::error::{VoiceError, VoiceResult};

/// Stops a running capture. Cheap to clone through an `Arc`.
#[derive(Debug)]
pub struct CaptureHandle {
    active: AtomicBool,
    stopped: CancellationToken,
    stop_tx: Mutex<Option<std_mpsc::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureHandle {
    fn live(stop_tx: std_mpsc::Sender<()>, thread: JoinHandle<()>) -> Self {
        Self {
            active: AtomicBool::new(true),
            stopped: CancellationToken::new(),
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Release the device. Returns `false` if capture was already stopped.
    pub fn stop(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.stopped.cancel();

        let stop_tx = self
            .stop_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(tx) = stop_tx {
            let _ = tx.send(());
        }

        let thread = self
            .thread
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!("⚠️ Capture thread panicked");
            }
        }
        true
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Live microphone frames plus the handle that stops them
#[derive(Debug)]
pub struct CaptureStream {
    frames: mpsc::UnboundedReceiver<Vec<f32>>,
    sample_rate: u32,
    handle: Arc<CaptureHandle>,
}

impl CaptureStream {
    /// A stream fed by something other than a device (tests, file replay)
    pub fn from_channel(frames: mpsc::UnboundedReceiver<Vec<f32>>, sample_rate: u32) -> Self {
        let handle = CaptureHandle {
            active: AtomicBool::new(true),
            stopped: CancellationToken::new(),
            stop_tx: Mutex::new(None),
            thread: Mutex::new(None),
        };
        Self {
            frames,
            sample_rate,
            handle: Arc::new(handle),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn handle(&self) -> Arc<CaptureHandle> {
        self.handle.clone()
    }

    /// Next frame; `None` once capture stopped and buffered frames are drained
    pub async fn recv(&mut self) -> Option<Vec<f32>> {
        if !self.handle.is_active() {
            // Drop anything still queued from before the stop
            self.frames.close();
            while self.frames.try_recv().is_ok() {}
            return None;
        }
        tokio::select! {
            biased;
            _ = self.handle.stopped.cancelled() => None,
            frame = self.frames.recv() => frame,
        }
    }

    /// Idempotent; see [`CaptureHandle::stop`]
    pub fn stop(&self) -> bool {
        self.handle.stop()
    }
}

/// Open the configured input device and start streaming
///
/// Fails with [`VoiceError::DeviceUnavailable`] when no device can be opened
/// at the configured sample rate.
pub fn start_capture(config: &AudioConfig) -> VoiceResult<CaptureStream> {
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
    let device_index = config.device_index;
    let sample_rate = config.sample_rate;

    let thread = thread::Builder::new()
        .name("fieldvoice-capture".to_string())
        .spawn(move || {
            let stream = match open_stream(device_index, sample_rate, frames_tx) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(VoiceError::DeviceUnavailable(e.to_string())));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            // Park until stopped or the handle is gone
            let _ = stop_rx.recv();
            drop(stream);
            info!("🎙️ Audio capture stopped");
        })?;

    match ready_rx.recv() {
        Ok(Ok(())) => {
            info!("🎙️ Audio capture started at {} Hz", sample_rate);
            Ok(CaptureStream {
                frames: frames_rx,
                sample_rate,
                handle: Arc::new(CaptureHandle::live(stop_tx, thread)),
            })
        }
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => Err(VoiceError::DeviceUnavailable(
            "capture thread exited before the stream opened".to_string(),
        )),
    }
}

fn open_stream(
    device_index: Option<usize>,
    sample_rate: u32,
    frames_tx: mpsc::UnboundedSender<Vec<f32>>,
) -> VoiceResult<cpal::Stream> {
    let unavailable = |e: &dyn std::fmt::Display| VoiceError::DeviceUnavailable(e.to_string());
    let host = cpal::default_host();

    info!("Available audio input devices:");
    for (i, device) in host.input_devices().map_err(|e| unavailable(&e))?.enumerate() {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let marker = if device_index == Some(i) { "*" } else { " " };
        info!("  {} [{}] {}", marker, i, name);
    }

    let device = match device_index {
        Some(idx) => host
            .input_devices()
            .map_err(|e| unavailable(&e))?
            .nth(idx)
            .ok_or_else(|| VoiceError::DeviceUnavailable(format!("no input device at index {}", idx)))?,
        None => host
            .default_input_device()
            .ok_or_else(|| VoiceError::DeviceUnavailable("no default input device".to_string()))?,
    };
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    info!("Using audio device: {}", device_name);

    // Prefer float samples, then 16-bit; fewest channels first
    let mut candidates: Vec<_> = device
        .supported_input_configs()
        .map_err(|e| unavailable(&e))?
        .filter(|c| {
            c.min_sample_rate().0 <= sample_rate
                && c.max_sample_rate().0 >= sample_rate
                && matches!(c.sample_format(), SampleFormat::F32 | SampleFormat::I16)
        })
        .collect();
    candidates.sort_by_key(|c| (c.sample_format() != SampleFormat::F32, c.channels()));
    let supported = candidates.into_iter().next().ok_or_else(|| {
        VoiceError::DeviceUnavailable(format!("{} cannot capture at {} Hz", device_name, sample_rate))
    })?;

    let format = supported.sample_format();
    let config = supported.with_sample_rate(cpal::SampleRate(sample_rate)).config();
    debug!(
        "Capture config: {} channel(s), {:?}, {} Hz",
        config.channels, format, sample_rate
    );

    match format {
        SampleFormat::I16 => build_stream::<i16>(&device, &config, frames_tx),
        _ => build_stream::<f32>(&device, &config, frames_tx),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    frames_tx: mpsc::UnboundedSender<Vec<f32>>,
) -> VoiceResult<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono = downmix(data, channels);
                // Receiver gone means the consumer stopped listening
                let _ = frames_tx.send(mono);
            },
            |err| {
                warn!("Audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))
}

fn downmix<T>(data: &[T], channels: usize) -> Vec<f32>
where
    T: Sample,
    f32: FromSample<T>,
{
    data.chunks(channels)
        .map(|frame| frame.iter().map(|s| s.to_sample::<f32>()).sum::<f32>() / frame.len() as f32)
        .collect()
}

//! Sound Engine for spoken responses
//!
//! Uses a channel-based architecture to handle rodio's non-Send stream.
//! The engine spawns a dedicated audio thread that owns the playback
//! infrastructure and reports back when a clip finished or was stopped.

use async_trait::async_trait;
use std::io::Cursor;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::AudioOutput;
use crate::error::{VoiceError, VoiceResult};
use crate::tts::AudioPayload;

/// How often the audio thread checks for the end of playback
const POLL_INTERVAL: Duration = Duration::from_millis(20);

type Done = oneshot::Sender<VoiceResult<()>>;

/// Commands sent to the audio thread
enum AudioCommand {
    PlayWait(Arc<[u8]>, Done),
    Stop,
}

/// Thread-safe handle to the sound engine
#[derive(Clone)]
pub struct SoundEngine {
    sender: mpsc::Sender<AudioCommand>,
}

impl std::fmt::Debug for SoundEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundEngine").finish()
    }
}

impl SoundEngine {
    pub fn new() -> VoiceResult<Self> {
        let (sender, receiver) = mpsc::channel::<AudioCommand>();

        // Spawn dedicated audio thread
        thread::Builder::new()
            .name("fieldvoice-audio".to_string())
            .spawn(move || {
                Self::audio_thread(receiver);
            })?;

        Ok(Self { sender })
    }

    fn audio_thread(receiver: mpsc::Receiver<AudioCommand>) {
        use rodio::OutputStream;

        // Initialize audio output on this thread
        let (stream, stream_handle) = match OutputStream::try_default() {
            Ok(s) => s,
            Err(e) => {
                warn!("🔇 Failed to initialize audio output: {}", e);
                return;
            }
        };

        // Keep stream alive
        let _stream = stream;
        let mut sink = match rodio::Sink::try_new(&stream_handle) {
            Ok(s) => s,
            Err(e) => {
                error!("❌ Failed to create audio sink: {}", e);
                return;
            }
        };
        let mut waiting: Vec<Done> = Vec::new();

        info!("🔊 Audio thread started");

        loop {
            let cmd = match receiver.recv_timeout(POLL_INTERVAL) {
                Ok(cmd) => Some(cmd),
                Err(mpsc::RecvTimeoutError::Timeout) => None,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            };

            match cmd {
                Some(AudioCommand::PlayWait(bytes, done)) => {
                    debug!("🔊 Queueing {} bytes", bytes.len());
                    match rodio::Decoder::new(Cursor::new(bytes)) {
                        Ok(source) => {
                            sink.append(source);
                            waiting.push(done);
                        }
                        Err(e) => {
                            error!("❌ Audio decode failed: {}", e);
                            let _ = done.send(Err(VoiceError::Playback(e.to_string())));
                        }
                    }
                }
                Some(AudioCommand::Stop) => {
                    info!("🛑 Stopping all playback");
                    sink.stop();
                    // Re-create sink after stop as it becomes unusable if we want to play again
                    if let Ok(new_sink) = rodio::Sink::try_new(&stream_handle) {
                        sink = new_sink;
                    }
                }
                None => {}
            }

            if !waiting.is_empty() && sink.empty() {
                for done in waiting.drain(..) {
                    let _ = done.send(Ok(()));
                }
            }
        }

        for done in waiting.drain(..) {
            let _ = done.send(Err(VoiceError::Playback("audio thread stopped".to_string())));
        }
        info!("🔇 Audio thread stopped");
    }

    /// Stop all current playback and clear queue
    pub fn stop_playback(&self) -> VoiceResult<()> {
        self.sender
            .send(AudioCommand::Stop)
            .map_err(|e| VoiceError::Playback(format!("Audio thread disconnected: {}", e)))
    }
}

#[async_trait]
impl AudioOutput for SoundEngine {
    /// Play and wait for completion. Returns early with `Ok` when stopped.
    async fn play(&self, audio: &AudioPayload) -> VoiceResult<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AudioCommand::PlayWait(audio.bytes.clone(), tx))
            .map_err(|e| VoiceError::Playback(format!("Audio thread disconnected: {}", e)))?;

        rx.await
            .map_err(|_| VoiceError::Playback("Audio thread dropped the request".to_string()))?
    }

    fn stop(&self) {
        if let Err(e) = self.stop_playback() {
            debug!("Stop ignored: {}", e);
        }
    }
}

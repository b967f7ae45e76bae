//! Wyoming Protocol Client
//!
//! Implements the Wyoming protocol for local recognition servers.
//! Wyoming is a simple protocol where events are JSON lines over TCP.
//!
//! Reference: https://github.com/rhasspy/wyoming

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{InterimSink, SttProvider};
use crate::audio::AudioStream;
use crate::error::ProviderError;
use crate::utterance::{AudioBuffer, FinalTranscript};

/// Samples per audio-chunk event
const CHUNK_SAMPLES: usize = 1024;

/// Wyoming servers do not report confidence; a non-empty transcript gets this
const DEFAULT_CONFIDENCE: f32 = 0.9;

/// Wyoming event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WyomingEvent {
    /// Describe request (handshake)
    #[serde(rename = "describe")]
    Describe,

    /// Info response from server
    #[serde(rename = "info")]
    Info(InfoData),

    /// Transcription request with language hint
    #[serde(rename = "transcribe")]
    Transcribe(TranscribeData),

    /// Start of audio stream
    #[serde(rename = "audio-start")]
    AudioStart(AudioFormat),

    /// Audio chunk
    #[serde(rename = "audio-chunk")]
    AudioChunk(AudioChunkData),

    /// End of audio stream
    #[serde(rename = "audio-stop")]
    AudioStop,

    /// Partial transcript (streaming servers only)
    #[serde(rename = "transcript-chunk")]
    TranscriptChunk(TranscriptData),

    /// Transcript result
    #[serde(rename = "transcript")]
    Transcript(TranscriptData),
}

/// Info response data
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InfoData {
    #[serde(default)]
    pub asr: Vec<AsrInfo>,
}

/// ASR service info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrInfo {
    pub name: String,
    #[serde(default)]
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribeData {
    pub language: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AudioFormat {
    pub rate: u32,
    pub width: u8,
    pub channels: u8,
}

/// Audio chunk data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioChunkData {
    pub rate: u32,
    pub width: u8,
    pub channels: u8,
    #[serde(with = "base64_bytes")]
    pub audio: Vec<u8>,
    #[serde(default)]
    pub timestamp: u64,
}

/// Transcript result data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptData {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Base64 serialization for audio bytes
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Wyoming client for local ASR services
pub struct WyomingStt {
    host: String,
    port: u16,
}

impl WyomingStt {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    async fn send<W>(writer: &mut W, event: &WyomingEvent) -> Result<(), ProviderError>
    where
        W: AsyncWrite + Unpin,
    {
        let line = serde_json::to_string(event)
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn send_chunk<W>(
        writer: &mut W,
        format: AudioFormat,
        samples: Vec<f32>,
        timestamp_ms: &mut u64,
    ) -> Result<(), ProviderError>
    where
        W: AsyncWrite + Unpin,
    {
        let count = samples.len() as u64;
        let audio = AudioBuffer::new(samples, format.rate).to_pcm16();
        Self::send(
            writer,
            &WyomingEvent::AudioChunk(AudioChunkData {
                rate: format.rate,
                width: format.width,
                channels: format.channels,
                audio,
                timestamp: *timestamp_ms,
            }),
        )
        .await?;
        if format.rate > 0 {
            *timestamp_ms += count * 1000 / format.rate as u64;
        }
        Ok(())
    }
}

#[async_trait]
impl SttProvider for WyomingStt {
    fn name(&self) -> &str {
        "wyoming"
    }

    async fn transcribe(
        &self,
        mut audio: AudioStream,
        language: &str,
        interim: &InterimSink,
    ) -> Result<FinalTranscript, ProviderError> {
        let stream = TcpStream::connect((&*self.host, self.port))
            .await
            .map_err(|e| ProviderError::Unavailable(format!("Wyoming connect failed: {}", e)))?;

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        // Audio goes out as it is captured; partials come back meanwhile
        let send_audio = async {
            Self::send(
                &mut writer,
                &WyomingEvent::Transcribe(TranscribeData {
                    language: language.to_string(),
                }),
            )
            .await?;

            let format = AudioFormat {
                rate: audio.sample_rate(),
                width: 2,
                channels: 1,
            };
            Self::send(&mut writer, &WyomingEvent::AudioStart(format)).await?;

            let mut pending: Vec<f32> = Vec::new();
            let mut timestamp_ms = 0u64;
            while let Some(samples) = audio.next_chunk().await {
                pending.extend(samples);
                while pending.len() >= CHUNK_SAMPLES {
                    let chunk: Vec<f32> = pending.drain(..CHUNK_SAMPLES).collect();
                    Self::send_chunk(&mut writer, format, chunk, &mut timestamp_ms).await?;
                }
                writer.flush().await?;
            }
            if !pending.is_empty() {
                Self::send_chunk(&mut writer, format, pending, &mut timestamp_ms).await?;
            }

            Self::send(&mut writer, &WyomingEvent::AudioStop).await?;
            writer.flush().await?;
            Ok::<_, ProviderError>(timestamp_ms)
        };

        let receive = async {
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 {
                    return Err(ProviderError::Network(
                        "Wyoming server closed connection before transcript".into(),
                    ));
                }

                match serde_json::from_str::<WyomingEvent>(line.trim()) {
                    Ok(WyomingEvent::TranscriptChunk(data)) => {
                        interim.emit(data.text, data.confidence.unwrap_or(0.0));
                    }
                    Ok(WyomingEvent::Transcript(data)) => {
                        let text = data.text.trim().to_string();
                        let confidence = match data.confidence {
                            Some(c) => c.clamp(0.0, 1.0),
                            None if text.is_empty() => 0.0,
                            None => DEFAULT_CONFIDENCE,
                        };
                        info!("📝 Wyoming transcript: '{}'", text);
                        return Ok(FinalTranscript::new(text, confidence));
                    }
                    Ok(other) => debug!("Ignoring Wyoming event: {:?}", other),
                    Err(_) => debug!("Ignoring unknown Wyoming line: {}", line.trim()),
                }
            }
        };

        tokio::pin!(send_audio);
        tokio::pin!(receive);
        let mut sending = true;
        loop {
            tokio::select! {
                sent = &mut send_audio, if sending => {
                    let audio_ms = sent?;
                    sending = false;
                    debug!("Sent {} ms of audio, waiting for transcript...", audio_ms);
                }
                result = &mut receive => return result,
            }
        }
    }

    async fn health_check(&self) -> bool {
        let probe = async {
            let stream = TcpStream::connect((&*self.host, self.port)).await?;
            let (reader, mut writer) = stream.into_split();
            Self::send(&mut writer, &WyomingEvent::Describe).await?;
            writer.flush().await?;
            let mut line = String::new();
            BufReader::new(reader).read_line(&mut line).await?;
            Ok::<_, ProviderError>(line)
        };
        match probe.await {
            Ok(line) => {
                debug!("Wyoming server available at {}:{}: {}", self.host, self.port, line.trim());
                true
            }
            Err(e) => {
                warn!("Wyoming server not available: {}", e);
                false
            }
        }
    }
}

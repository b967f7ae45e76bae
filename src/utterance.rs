//! Utterance and turn records
//!
//! An [`Utterance`] is one spoken turn, owned by the pipeline for the life
//! of the turn. A [`VoiceTurnResult`] is the summary handed to telemetry
//! once the turn ends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::audio::LiveAudio;
use crate::core::intent::Intent;
use crate::dispatch::{ActionOutcome, UserRecovery};
use crate::error::{FailureReason, VoiceError, VoiceResult};
use crate::mode::DegradationLevel;

/// Mono PCM audio, normalised to -1.0..1.0
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }

    /// 16-bit little-endian PCM bytes
    pub fn to_pcm16(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for &sample in &self.samples {
            let value = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    /// 16-bit mono WAV file bytes
    pub fn to_wav(&self) -> VoiceResult<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)
                .map_err(|e| VoiceError::Audio(e.to_string()))?;
            for &sample in &self.samples {
                let value = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
                writer
                    .write_sample(value)
                    .map_err(|e| VoiceError::Audio(e.to_string()))?;
            }
            writer
                .finalize()
                .map_err(|e| VoiceError::Audio(e.to_string()))?;
        }
        Ok(cursor.into_inner())
    }
}

/// A partial transcript; UI feedback only, never authoritative
#[derive(Debug, Clone, PartialEq)]
pub struct InterimTranscript {
    pub text: String,
    pub confidence: f32,
    pub at: Instant,
}

/// The authoritative transcript of an utterance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalTranscript {
    pub text: String,
    pub confidence: f32,
}

impl FinalTranscript {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// One spoken turn
#[derive(Debug)]
pub struct Utterance {
    id: u64,
    raw_audio: Option<LiveAudio>,
    audio_ms: Option<u64>,
    interim: Vec<InterimTranscript>,
    final_transcript: Option<FinalTranscript>,
    started_at: Instant,
    ended_at: Option<Instant>,
}

impl Utterance {
    pub fn new(id: u64, started_at: Instant) -> Self {
        Self {
            id,
            raw_audio: None,
            audio_ms: None,
            interim: Vec::new(),
            final_transcript: None,
            started_at,
            ended_at: None,
        }
    }

    /// An utterance whose audio is still being captured
    pub fn live(id: u64, audio: LiveAudio, started_at: Instant) -> Self {
        Self {
            id,
            raw_audio: Some(audio),
            audio_ms: None,
            interim: Vec::new(),
            final_transcript: None,
            started_at,
            ended_at: None,
        }
    }

    /// An utterance whose audio was fully captured already
    pub fn with_audio(id: u64, audio: AudioBuffer, started_at: Instant, ended_at: Instant) -> Self {
        let audio_ms = audio.duration_ms();
        let mut utterance = Self::live(id, LiveAudio::finished(audio, ended_at), started_at);
        utterance.audio_ms = Some(audio_ms);
        utterance.ended_at = Some(ended_at);
        utterance
    }

    /// A typed turn: no audio, transcript already final
    pub fn from_text(id: u64, text: impl Into<String>, at: Instant) -> Self {
        let mut utterance = Self::new(id, at);
        utterance.final_transcript = Some(FinalTranscript::new(text, 1.0));
        utterance.ended_at = Some(at);
        utterance
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn audio(&self) -> Option<LiveAudio> {
        self.raw_audio.clone()
    }

    /// Drop the buffered audio; called once the turn no longer needs it.
    /// Duration and end of speech are kept for the summary.
    pub fn release_audio(&mut self) -> Option<LiveAudio> {
        let audio = self.raw_audio.take()?;
        self.audio_ms = Some(audio.duration_ms());
        if self.ended_at.is_none() {
            self.ended_at = audio.ended_at();
        }
        Some(audio)
    }

    pub fn interim_transcripts(&self) -> &[InterimTranscript] {
        &self.interim
    }

    /// Append a partial result. Timestamps never go backwards.
    pub fn push_interim(&mut self, text: String, confidence: f32, at: Instant) -> &InterimTranscript {
        let at = match self.interim.last() {
            Some(last) if at < last.at => last.at,
            _ => at,
        };
        self.interim.push(InterimTranscript {
            text,
            confidence,
            at,
        });
        &self.interim[self.interim.len() - 1]
    }

    pub fn final_transcript(&self) -> Option<&FinalTranscript> {
        self.final_transcript.as_ref()
    }

    /// Set the final transcript. Returns false if one was already set.
    pub fn set_final(&mut self, transcript: FinalTranscript) -> bool {
        if self.final_transcript.is_some() {
            return false;
        }
        self.final_transcript = Some(transcript);
        true
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// End of speech; `None` while the segment is still open
    pub fn ended_at(&self) -> Option<Instant> {
        self.ended_at
            .or_else(|| self.raw_audio.as_ref().and_then(LiveAudio::ended_at))
    }

    pub fn finish(&mut self, at: Instant) {
        if self.ended_at.is_none() {
            self.ended_at = Some(self.ended_at().unwrap_or(at));
        }
    }

    pub fn summary(&self) -> UtteranceSummary {
        UtteranceSummary {
            id: self.id,
            transcript: self.final_transcript.clone(),
            interim_count: self.interim.len(),
            audio_ms: self
                .audio_ms
                .or_else(|| self.raw_audio.as_ref().map(LiveAudio::duration_ms)),
            speech_ms: self
                .ended_at()
                .map(|end| end.saturating_duration_since(self.started_at).as_millis() as u64),
        }
    }
}

/// Telemetry view of an utterance; never carries audio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtteranceSummary {
    pub id: u64,
    pub transcript: Option<FinalTranscript>,
    pub interim_count: usize,
    pub audio_ms: Option<u64>,
    pub speech_ms: Option<u64>,
}

/// How the response reached the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SpokenResponse {
    /// Synthesized and played
    Spoken { text: String, cached: bool },
    /// No synthesis available; shown as text
    TextOnly { text: String },
    /// Nothing to say (turn cancelled)
    Silent,
}

impl SpokenResponse {
    pub fn text(&self) -> Option<&str> {
        match self {
            SpokenResponse::Spoken { text, .. } | SpokenResponse::TextOnly { text } => Some(text),
            SpokenResponse::Silent => None,
        }
    }
}

/// Terminal record of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceTurnResult {
    pub turn_id: u64,
    pub utterance: UtteranceSummary,
    pub intent: Option<Intent>,
    pub action_outcome: Option<ActionOutcome>,
    pub spoken_response: SpokenResponse,
    pub degradation_level: DegradationLevel,
    pub failure: Option<FailureReason>,
    pub recovery: Option<UserRecovery>,
    pub completed_at: DateTime<Utc>,
}

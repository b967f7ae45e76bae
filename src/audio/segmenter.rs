//! Utterance segmentation
//!
//! Splits conditioned audio into utterances. A segment opens on the first
//! frame above the noise gate and closes after `silence_timeout_ms` of gated
//! frames, at `max_utterance_ms`, or when capture stops.
//!
//! An utterance is handed out as soon as its segment holds
//! `min_utterance_ms` of speech; shorter segments are dropped as clicks and
//! bumps. From then on the segmenter keeps appending to the utterance's
//! [`LiveAudio`] until the segment closes, so recognition runs while the
//! user is still speaking.

use futures::stream::{self, Stream};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::{CaptureStream, ConditioningChain, LiveAudio, LiveAudioWriter};
use crate::config::AudioConfig;
use crate::utterance::Utterance;

#[derive(Debug)]
struct OpenSegment {
    start_sample: u64,
    /// Samples before the segment counts as speech
    held: Vec<f32>,
    /// Gated samples since the last speech frame; kept only if speech resumes
    trailing: Vec<f32>,
    /// Present once the utterance was handed out
    writer: Option<LiveAudioWriter>,
    length: usize,
    speech_samples: usize,
}

impl OpenSegment {
    fn new(start_sample: u64) -> Self {
        Self {
            start_sample,
            held: Vec::new(),
            trailing: Vec::new(),
            writer: None,
            length: 0,
            speech_samples: 0,
        }
    }

    fn append(&mut self, samples: &[f32]) {
        match &self.writer {
            Some(writer) => writer.push(samples),
            None => self.held.extend_from_slice(samples),
        }
    }
}

/// Stateful silence-timeout segmenter; one per capture session
#[derive(Debug)]
pub struct Segmenter {
    conditioning: ConditioningChain,
    sample_rate: u32,
    chunk_size: usize,
    silence_timeout: usize,
    min_speech: usize,
    max_length: usize,
    /// Leftover samples shorter than one chunk
    pending: Vec<f32>,
    segment: Option<OpenSegment>,
    /// Samples consumed since the session started
    position: u64,
    epoch: Instant,
    next_id: u64,
}

impl Segmenter {
    pub fn new(config: &AudioConfig) -> Self {
        let rate = config.sample_rate.max(1);
        let to_samples = |ms: u64| (ms * rate as u64 / 1000) as usize;
        Self {
            conditioning: ConditioningChain::new(config),
            sample_rate: rate,
            chunk_size: config.chunk_size.max(1),
            silence_timeout: to_samples(config.silence_timeout_ms),
            min_speech: to_samples(config.min_utterance_ms),
            max_length: to_samples(config.max_utterance_ms).max(1),
            pending: Vec::new(),
            segment: None,
            position: 0,
            epoch: Instant::now(),
            next_id: 1,
        }
    }

    pub fn in_speech(&self) -> bool {
        self.segment.is_some()
    }

    /// Feed raw samples; returns every utterance that started in them.
    /// Their audio keeps growing with later pushes until the segment closes.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Utterance> {
        self.pending.extend_from_slice(samples);
        let mut started = Vec::new();

        let whole = self.pending.len() / self.chunk_size * self.chunk_size;
        let frames: Vec<f32> = self.pending.drain(..whole).collect();
        for frame in frames.chunks(self.chunk_size) {
            if let Some(utterance) = self.process_frame(frame) {
                started.push(utterance);
            }
        }
        started
    }

    /// Close the open segment, as on an explicit stop
    pub fn finish(&mut self) {
        self.pending.clear();
        if let Some(segment) = self.segment.take() {
            self.close(segment);
        }
    }

    fn process_frame(&mut self, frame: &[f32]) -> Option<Utterance> {
        let mut frame = frame.to_vec();
        let info = self.conditioning.process(&mut frame);
        let frame_start = self.position;
        self.position += frame.len() as u64;

        let mut segment = match self.segment.take() {
            Some(segment) => segment,
            None if info.gated => return None,
            None => {
                debug!("🗣️ Speech start (rms {:.3})", info.rms);
                OpenSegment::new(frame_start)
            }
        };

        if info.gated {
            segment.trailing.extend_from_slice(&frame);
        } else {
            segment.speech_samples += frame.len();
            let trailing = std::mem::take(&mut segment.trailing);
            segment.append(&trailing);
            segment.append(&frame);
        }
        segment.length += frame.len();

        let started = self.confirm(&mut segment);
        if segment.trailing.len() >= self.silence_timeout {
            debug!(
                "🤫 Speech end after {} ms of silence",
                self.samples_to_ms(segment.trailing.len())
            );
            self.close(segment);
        } else if segment.length >= self.max_length {
            debug!("✂️ Utterance reached max length, closing");
            self.close(segment);
        } else {
            self.segment = Some(segment);
        }
        started
    }

    /// Hand out the utterance once the segment holds enough speech
    fn confirm(&mut self, segment: &mut OpenSegment) -> Option<Utterance> {
        if segment.writer.is_some() || segment.speech_samples < self.min_speech {
            return None;
        }
        let (writer, audio) = LiveAudio::open(self.sample_rate);
        writer.push(&std::mem::take(&mut segment.held));
        segment.writer = Some(writer);

        let id = self.next_id;
        self.next_id += 1;
        let started_at = self.epoch + self.sample_offset(segment.start_sample);
        debug!("Utterance {} confirmed, streaming", id);
        Some(Utterance::live(id, audio, started_at))
    }

    fn close(&self, segment: OpenSegment) {
        let Some(writer) = segment.writer else {
            debug!(
                "Dropping {} ms blip",
                self.samples_to_ms(segment.speech_samples)
            );
            return;
        };
        // Trailing silence is never appended
        let kept = (segment.length - segment.trailing.len()) as u64;
        writer.close(self.epoch + self.sample_offset(segment.start_sample + kept));
    }

    fn sample_offset(&self, samples: u64) -> Duration {
        Duration::from_micros(samples * 1_000_000 / self.sample_rate as u64)
    }

    fn samples_to_ms(&self, samples: usize) -> u64 {
        samples as u64 * 1000 / self.sample_rate as u64
    }
}

/// Turn a capture stream into a stream of utterances
///
/// Segmentation runs on its own task, so an utterance's audio keeps growing
/// while the consumer works on it. Ends after the capture stops; a segment
/// open at that moment is closed where it stands.
pub fn detect_segment_boundaries(
    capture: CaptureStream,
    config: &AudioConfig,
) -> impl Stream<Item = Utterance> + Send + 'static {
    let mut config = config.clone();
    config.sample_rate = capture.sample_rate();
    let segmenter = Segmenter::new(&config);

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_segmenter(capture, segmenter, tx));

    stream::unfold(rx, |mut rx| async move {
        let utterance = rx.recv().await?;
        Some((utterance, rx))
    })
}

async fn run_segmenter(
    mut capture: CaptureStream,
    mut segmenter: Segmenter,
    utterances: mpsc::UnboundedSender<Utterance>,
) {
    loop {
        let frame = tokio::select! {
            _ = utterances.closed() => {
                debug!("Utterance consumer gone, stopping segmentation");
                break;
            }
            frame = capture.recv() => frame,
        };
        let Some(frame) = frame else { break };
        for utterance in segmenter.push(&frame) {
            if utterances.send(utterance).is_err() {
                break;
            }
        }
    }
    segmenter.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::f32::consts::PI;

    fn config() -> AudioConfig {
        AudioConfig {
            silence_timeout_ms: 300,
            min_utterance_ms: 100,
            max_utterance_ms: 2_000,
            ..Default::default()
        }
    }

    fn tone(ms: u64) -> Vec<f32> {
        let n = (ms * 16) as usize;
        (0..n)
            .map(|i| 0.4 * (2.0 * PI * 800.0 * i as f32 / 16000.0).sin())
            .collect()
    }

    fn silence(ms: u64) -> Vec<f32> {
        vec![0.0; (ms * 16) as usize]
    }

    #[test]
    fn test_speech_then_silence_yields_one_utterance() {
        let mut segmenter = Segmenter::new(&config());
        assert!(segmenter.push(&silence(200)).is_empty());
        let started = segmenter.push(&tone(500));
        assert_eq!(started.len(), 1);
        assert!(segmenter.in_speech());

        let utterance = &started[0];
        assert_eq!(utterance.id(), 1);
        let audio = utterance.audio().unwrap();
        assert!(!audio.is_closed());
        assert!(utterance.ended_at().is_none());

        assert!(segmenter.push(&silence(400)).is_empty());
        assert!(audio.is_closed());
        // Trailing silence trimmed; filter ring-out keeps a few extra frames
        let ms = audio.duration_ms();
        assert!((500..=600).contains(&ms), "duration {} ms", ms);
        assert!(utterance.ended_at().is_some());
        assert!(!segmenter.in_speech());
    }

    #[test]
    fn test_audio_grows_while_segment_open() {
        let mut segmenter = Segmenter::new(&config());
        let started = segmenter.push(&tone(200));
        let audio = started[0].audio().unwrap();
        let early = audio.duration_ms();

        segmenter.push(&tone(300));
        assert!(audio.duration_ms() >= early + 300);
        assert!(!audio.is_closed());
    }

    #[test]
    fn test_short_pause_does_not_split() {
        let mut segmenter = Segmenter::new(&config());
        let mut samples = tone(300);
        samples.extend(silence(100));
        samples.extend(tone(300));
        samples.extend(silence(400));
        let started = segmenter.push(&samples);
        assert_eq!(started.len(), 1);
        // The pause stays inside the utterance
        assert!(started[0].audio().unwrap().duration_ms() >= 700);
    }

    #[test]
    fn test_blips_are_dropped() {
        let mut segmenter = Segmenter::new(&config());
        let mut samples = tone(40);
        samples.extend(silence(400));
        assert!(segmenter.push(&samples).is_empty());
        assert!(!segmenter.in_speech());
    }

    #[test]
    fn test_max_length_forces_boundary() {
        let mut segmenter = Segmenter::new(&config());
        let started = segmenter.push(&tone(4_500));
        assert_eq!(started.len(), 3);
        let first = started[0].audio().unwrap();
        assert!(first.is_closed());
        assert_eq!(first.duration_ms(), 2_000);
        assert!(started[1].audio().unwrap().is_closed());
        assert!(!started[2].audio().unwrap().is_closed());
        assert!(started[1].id() > started[0].id());
        assert!(segmenter.in_speech());
    }

    #[test]
    fn test_finish_closes_open_segment() {
        let mut segmenter = Segmenter::new(&config());
        let started = segmenter.push(&tone(500));
        let utterance = &started[0];
        segmenter.finish();
        assert!(utterance.audio().unwrap().is_closed());
        assert!(utterance.started_at() <= utterance.ended_at().unwrap());
        assert!(!segmenter.in_speech());
    }

    #[tokio::test]
    async fn test_utterance_arrives_before_speech_ends() {
        let (tx, rx) = mpsc::unbounded_channel();
        let capture = CaptureStream::from_channel(rx, 16000);
        let mut utterances = Box::pin(detect_segment_boundaries(capture, &config()));

        tx.send(tone(400)).unwrap();
        let utterance = utterances.next().await.unwrap();
        let audio = utterance.audio().unwrap();
        assert!(!audio.is_closed());

        tx.send(tone(200)).unwrap();
        tx.send(silence(400)).unwrap();
        audio.closed().await;
        assert!(audio.duration_ms() >= 600);
    }

    #[tokio::test]
    async fn test_stream_of_utterances_ends_on_stop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let capture = CaptureStream::from_channel(rx, 16000);
        let handle = capture.handle();
        let mut utterances = Box::pin(detect_segment_boundaries(capture, &config()));

        tx.send(tone(400)).unwrap();
        tx.send(silence(400)).unwrap();
        tx.send(tone(400)).unwrap();
        tx.send(silence(400)).unwrap();

        let first = utterances.next().await.unwrap();
        let second = utterances.next().await.unwrap();
        assert_eq!((first.id(), second.id()), (1, 2));

        handle.stop();
        assert!(utterances.next().await.is_none());
    }
}

//! Live utterance audio
//!
//! The segmenter owns a [`LiveAudioWriter`] while a segment is open and
//! appends conditioned frames to it. Recognition reads the same samples
//! through [`AudioStream`]s, which start from the first sample, so a retried
//! provider hears the whole utterance again.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::utterance::AudioBuffer;

#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    len: usize,
    /// Set once the segment closes
    ended_at: Option<Instant>,
}

/// Shared, growing audio of one utterance
#[derive(Debug, Clone)]
pub struct LiveAudio {
    sample_rate: u32,
    samples: Arc<Mutex<Vec<f32>>>,
    progress: watch::Receiver<Progress>,
}

/// Append side of a [`LiveAudio`]; closes the audio when dropped
#[derive(Debug)]
pub struct LiveAudioWriter {
    samples: Arc<Mutex<Vec<f32>>>,
    progress: watch::Sender<Progress>,
}

impl LiveAudio {
    pub fn open(sample_rate: u32) -> (LiveAudioWriter, LiveAudio) {
        let samples = Arc::new(Mutex::new(Vec::new()));
        let (progress, rx) = watch::channel(Progress::default());
        let writer = LiveAudioWriter {
            samples: samples.clone(),
            progress,
        };
        let audio = LiveAudio {
            sample_rate,
            samples,
            progress: rx,
        };
        (writer, audio)
    }

    /// Audio that was complete before anyone listened
    pub fn finished(buffer: AudioBuffer, ended_at: Instant) -> LiveAudio {
        let (writer, audio) = LiveAudio::open(buffer.sample_rate);
        writer.push(&buffer.samples);
        writer.close(ended_at);
        audio
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.progress.borrow().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.len() as u64 * 1000 / self.sample_rate as u64
    }

    pub fn is_closed(&self) -> bool {
        self.progress.borrow().ended_at.is_some()
    }

    pub fn ended_at(&self) -> Option<Instant> {
        self.progress.borrow().ended_at
    }

    /// Wait for the segment to close
    pub async fn closed(&self) {
        let mut progress = self.progress.clone();
        // Writer drop always closes first, so an error means already closed
        let _ = progress.wait_for(|p| p.ended_at.is_some()).await;
    }

    /// Everything captured so far
    pub fn snapshot(&self) -> AudioBuffer {
        let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        AudioBuffer::new(samples.clone(), self.sample_rate)
    }

    /// A reader positioned at the first sample
    pub fn stream(&self) -> AudioStream {
        AudioStream {
            audio: self.clone(),
            progress: self.progress.clone(),
            position: 0,
        }
    }
}

impl LiveAudioWriter {
    pub fn push(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let len = {
            let mut buffer = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.extend_from_slice(samples);
            buffer.len()
        };
        self.progress.send_modify(|p| p.len = len);
    }

    /// Mark the segment complete. Later pushes are still visible to readers
    /// that have not finished, so callers close last.
    pub fn close(self, ended_at: Instant) {
        self.progress.send_modify(|p| p.ended_at = Some(ended_at));
    }
}

impl Drop for LiveAudioWriter {
    fn drop(&mut self) {
        self.progress.send_if_modified(|p| {
            if p.ended_at.is_some() {
                return false;
            }
            p.ended_at = Some(Instant::now());
            true
        });
    }
}

/// Reads an utterance chunk by chunk as the segmenter appends it
#[derive(Debug)]
pub struct AudioStream {
    audio: LiveAudio,
    progress: watch::Receiver<Progress>,
    position: usize,
}

impl AudioStream {
    pub fn sample_rate(&self) -> u32 {
        self.audio.sample_rate
    }

    /// Samples appended since the last call; `None` once the segment closed
    /// and everything was read
    pub async fn next_chunk(&mut self) -> Option<Vec<f32>> {
        loop {
            let progress = *self.progress.borrow_and_update();
            if progress.len > self.position {
                let samples = self
                    .audio
                    .samples
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let chunk = samples[self.position..progress.len].to_vec();
                self.position = progress.len;
                return Some(chunk);
            }
            if progress.ended_at.is_some() {
                return None;
            }
            if self.progress.changed().await.is_err() && self.progress.borrow().len <= self.position {
                return None;
            }
        }
    }

    /// Wait for the whole utterance; the batch path for providers that
    /// need complete audio
    pub async fn collect(mut self) -> AudioBuffer {
        let mut samples = Vec::with_capacity(self.audio.len());
        while let Some(chunk) = self.next_chunk().await {
            samples.extend(chunk);
        }
        AudioBuffer::new(samples, self.audio.sample_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_chunks_follow_writes() {
        let (writer, audio) = LiveAudio::open(16000);
        let mut stream = audio.stream();

        writer.push(&[0.1; 160]);
        assert_eq!(stream.next_chunk().await.unwrap().len(), 160);
        assert!(!audio.is_closed());

        writer.push(&[0.2; 80]);
        writer.push(&[0.3; 80]);
        assert_eq!(stream.next_chunk().await.unwrap().len(), 160);

        writer.close(Instant::now());
        assert!(stream.next_chunk().await.is_none());
        assert_eq!(audio.duration_ms(), 20);
    }

    #[tokio::test]
    async fn test_reader_waits_for_speech() {
        let (writer, audio) = LiveAudio::open(16000);
        let reader = tokio::spawn(audio.stream().collect());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!reader.is_finished());

        writer.push(&[0.5; 320]);
        drop(writer);
        let buffer = reader.await.unwrap();
        assert_eq!(buffer.samples.len(), 320);
        assert!(audio.is_closed());
    }

    #[tokio::test]
    async fn test_second_stream_replays_from_start() {
        let audio = LiveAudio::finished(AudioBuffer::new(vec![0.25; 400], 16000), Instant::now());
        let first = audio.stream().collect().await;
        let second = audio.stream().collect().await;
        assert_eq!(first, second);
        assert_eq!(first.samples.len(), 400);
        audio.closed().await;
    }
}

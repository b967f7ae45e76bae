//! Captured audio through segmentation into pipeline turns

use futures::StreamExt;
use std::f32::consts::PI;
use std::sync::Arc;
use tokio::sync::mpsc;

use fieldvoice::asr::{RecognitionEvent, RecognitionState};
use fieldvoice::audio::{detect_segment_boundaries, CaptureStream};
use fieldvoice::config::AudioConfig;
use fieldvoice::core::Action;
use fieldvoice::providers::Tier;

mod common;
use common::{HarnessBuilder, MockStt, SAMPLE_RATE};

fn tone(ms: u64) -> Vec<f32> {
    let n = (SAMPLE_RATE as u64 * ms / 1000) as usize;
    (0..n)
        .map(|i| 0.5 * (2.0 * PI * 1000.0 * i as f32 / SAMPLE_RATE as f32).sin())
        .collect()
}

fn silence(ms: u64) -> Vec<f32> {
    vec![0.0; (SAMPLE_RATE as u64 * ms / 1000) as usize]
}

/// Send `audio` in 20 ms frames
fn feed(tx: &mpsc::UnboundedSender<Vec<f32>>, audio: &[f32]) {
    for frame in audio.chunks(320) {
        tx.send(frame.to_vec()).unwrap();
    }
}

#[tokio::test]
async fn test_spoken_command_becomes_turn() {
    let stt = Arc::new(MockStt::hearing("local-stt", "open schedule", 0.9));
    let h = HarnessBuilder::new()
        .offline()
        .stt(1, Tier::Local, stt.clone())
        .build();

    let (tx, rx) = mpsc::unbounded_channel();
    feed(&tx, &tone(600));
    feed(&tx, &silence(1000));
    drop(tx);

    let capture = CaptureStream::from_channel(rx, SAMPLE_RATE);
    let utterances = detect_segment_boundaries(capture, &AudioConfig::default());
    h.pipeline.clone().run(utterances).await.unwrap();

    assert_eq!(stt.calls(), 1);
    assert_eq!(h.app.actions(), vec![Action::Navigate]);
    let results = h.telemetry.results();
    assert_eq!(results.len(), 1);
    let audio_ms = results[0].utterance.audio_ms.unwrap();
    assert!((500..=700).contains(&audio_ms), "audio_ms = {}", audio_ms);
}

#[tokio::test]
async fn test_interims_arrive_before_speech_ends() {
    let stt = Arc::new(
        MockStt::hearing("local-stt", "open schedule", 0.9)
            .with_interims(&[("open", 0.4), ("open sched", 0.6)]),
    );
    let h = HarnessBuilder::new()
        .offline()
        .stt(1, Tier::Local, stt.clone())
        .build();
    let mut events = h.pipeline.recognition_events();

    let (tx, rx) = mpsc::unbounded_channel();
    let capture = CaptureStream::from_channel(rx, SAMPLE_RATE);
    let utterances = detect_segment_boundaries(capture, &AudioConfig::default());
    let run = tokio::spawn(h.pipeline.clone().run(utterances));

    // Still speaking: no silence fed yet
    feed(&tx, &tone(600));
    let first = loop {
        match events.recv().await.unwrap() {
            RecognitionEvent::Interim { text, .. } => break text,
            RecognitionEvent::State {
                state: RecognitionState::Transcribing,
                ..
            } => panic!("speech ended before any interim"),
            _ => {}
        }
    };
    assert_eq!(first, "open");
    assert!(h.telemetry.results().is_empty());

    feed(&tx, &silence(1000));
    drop(tx);
    run.await.unwrap().unwrap();

    let results = h.telemetry.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].utterance.interim_count, 2);
    assert_eq!(h.app.actions(), vec![Action::Navigate]);
    assert_eq!(stt.calls(), 1);
}

#[tokio::test]
async fn test_stop_capture_twice() {
    let (tx, rx) = mpsc::unbounded_channel();
    let capture = CaptureStream::from_channel(rx, SAMPLE_RATE);
    let handle = capture.handle();
    feed(&tx, &tone(600));

    assert!(handle.stop());
    assert!(!handle.stop());
    assert!(!handle.is_active());

    // Frames queued before the stop are discarded
    let mut utterances = Box::pin(detect_segment_boundaries(capture, &AudioConfig::default()));
    assert!(utterances.next().await.is_none());
}

#[tokio::test]
async fn test_shutdown_ends_listening_loop() {
    let h = HarnessBuilder::new()
        .offline()
        .stt(1, Tier::Local, Arc::new(MockStt::hearing("local-stt", "open schedule", 0.9)))
        .build();

    // Sender kept alive: the stream only ends through shutdown
    let (_tx, rx) = mpsc::unbounded_channel::<Vec<f32>>();
    let capture = CaptureStream::from_channel(rx, SAMPLE_RATE);
    let utterances = detect_segment_boundaries(capture, &AudioConfig::default());

    let run = tokio::spawn(h.pipeline.clone().run(utterances));
    h.pipeline.shutdown();
    run.await.unwrap().unwrap();
    assert!(h.pipeline.is_shut_down());
    assert!(h.telemetry.results().is_empty());
}

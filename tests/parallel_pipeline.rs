mod common;

use common::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use streak_eraser::core_modules::classifier::Classifier;
use streak_eraser::core_modules::feature_dump::FeatureDump;
use streak_eraser::core_modules::features::FeatureVector;
use streak_eraser::core_modules::frame::FrameState;
use streak_eraser::core_modules::paint_policy::PaintReason;
use streak_eraser::core_modules::pixel_buffer::PixelBuffer;
use streak_eraser::error::InternalError;
use streak_eraser::parallel_pipeline::write_with_retry;
use streak_eraser::{EraserError, PipelineConfig, RunSummary, StreakEraser};

async fn run(
    config: PipelineConfig,
    frames: Vec<PixelBuffer>,
    sink: Arc<MemorySink>,
) -> streak_eraser::Result<RunSummary> {
    let eraser = StreakEraser::new(config)?;
    eraser
        .run(Arc::new(MemorySource::new(frames)), sink, None)
        .await
}

fn assert_window_order(summary: &RunSummary, len: usize, radius: usize) {
    let mut last_complete = None;
    for index in 0..len {
        let Some(reload) = summary.event_position(index, FrameState::ReloadingImages) else {
            continue;
        };
        let start = index.saturating_sub(radius);
        let end = (index + radius).min(len - 1);
        for neighbor in start..=end {
            if let Some(classified) =
                summary.event_position(neighbor, FrameState::OutlierProcessingComplete)
            {
                assert!(
                    classified < reload,
                    "frame {index} finalized before frame {neighbor} was classified"
                );
            }
        }
        let complete = summary
            .event_position(index, FrameState::Complete)
            .expect("reloaded frames complete");
        if let Some(previous) = last_complete {
            assert!(previous < complete, "frame {index} completed out of order");
        }
        last_complete = Some(complete);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_bright_blob_is_painted_out_and_frames_finish_in_order() {
    let frames = sky_with_spike(8, 2, (10, 10));
    let sink = Arc::new(MemorySink::default());
    let summary = run(assume_everything(2, 3), frames.clone(), sink.clone())
        .await
        .unwrap();

    assert_eq!(summary.frames, 8);
    assert_eq!(summary.processed, 8);
    assert_eq!(summary.written, 8);
    assert_eq!(summary.painted_groups, 1);
    assert_eq!(summary.painted_pixels, 9);
    assert_window_order(&summary, 8, 2);

    let background = PixelBuffer::filled(WIDTH, HEIGHT, BACKGROUND);
    for index in 0..8 {
        assert_eq!(sink.output(index).unwrap(), background, "frame {index}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn frames_move_through_every_state_once() {
    let sink = Arc::new(MemorySink::default());
    let summary = run(assume_everything(1, 1), sky_with_spike(4, 0, (1, 1)), sink)
        .await
        .unwrap();
    assert_window_order(&summary, 4, 1);

    for index in 0..4 {
        let states: Vec<FrameState> = summary
            .events
            .iter()
            .filter(|(frame, _)| *frame == index)
            .map(|(_, state)| *state)
            .collect();
        assert_eq!(
            states,
            vec![
                FrameState::LoadingImages,
                FrameState::DetectingOutliers,
                FrameState::InterFrameProcessing,
                FrameState::OutlierProcessingComplete,
                FrameState::ReloadingImages,
                FrameState::Painting,
                FrameState::WritingOutputFile,
                FrameState::Complete,
            ],
            "frame {index}"
        );
    }
}

#[tokio::test]
async fn a_faint_blob_is_replaced_completely() {
    let mut frames = blank_sky(4, WIDTH, HEIGHT);
    let blob: Vec<(u32, u32)> = (0..3)
        .flat_map(|dy| (0..3).map(move |dx| (12 + dx, 6 + dy)))
        .collect();
    light(&mut frames[1], blob.iter().copied(), FAINT);

    let sink = Arc::new(MemorySink::default());
    let summary = run(assume_everything(1, 2), frames, sink.clone())
        .await
        .unwrap();
    assert_eq!(summary.painted_groups, 1);
    assert_eq!(summary.painted_pixels, 9);
    let output = sink.output(1).unwrap();
    for &(x, y) in &blob {
        assert_eq!(output.pixel(x, y), BACKGROUND, "pixel {x},{y}");
    }
}

/// Paints every group it is asked about.
#[derive(Debug)]
struct AlwaysPaint;

impl Classifier for AlwaysPaint {
    fn name(&self) -> &str {
        "always"
    }

    fn score(&self, _features: &FeatureVector) -> f64 {
        1.0
    }
}

const STREAK_WIDTH: u32 = 100;
const STREAK_HEIGHT: u32 = 40;

fn segment(position: u32) -> Vec<(u32, u32)> {
    (0..12).map(|i| (10 + 20 * position + i, 20)).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_segment_moving_across_frames_is_erased_as_a_streak() {
    let mut frames = blank_sky(4, STREAK_WIDTH, STREAK_HEIGHT);
    for (index, frame) in frames.iter_mut().take(3).enumerate() {
        light(frame, segment(index as u32), SPIKE);
    }
    let config = PipelineConfig {
        classifier: "line".into(),
        min_group_size: 5,
        neighbor_radius: 2,
        max_concurrent: 2,
        test_paint: true,
        ..PipelineConfig::default()
    };

    let sink = Arc::new(MemorySink::default());
    let summary = run(config, frames, sink.clone()).await.unwrap();
    assert_eq!(summary.groups, 3);
    assert_eq!(summary.painted_groups, 3);
    assert_eq!(summary.painted_pixels, 36);

    let background = PixelBuffer::filled(STREAK_WIDTH, STREAK_HEIGHT, BACKGROUND);
    let marked = sink.test_paint.lock().unwrap();
    for index in 0..3 {
        for (x, y) in segment(index as u32) {
            assert_eq!(
                marked[&index].pixel(x, y),
                PaintReason::InStreak.test_paint_color(),
                "frame {index} at {x},{y}"
            );
        }
    }
    for index in 0..4 {
        assert_eq!(sink.output(index).unwrap(), background, "frame {index}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_stationary_blob_in_consecutive_frames_is_kept() {
    let block: Vec<(u32, u32)> = (0..6)
        .flat_map(|dy| (0..6).map(move |dx| (40 + dx, 10 + dy)))
        .collect();
    let mut frames = blank_sky(4, STREAK_WIDTH, STREAK_HEIGHT);
    for frame in &mut frames[1..3] {
        light(frame, block.iter().copied(), SPIKE);
    }
    let config = PipelineConfig {
        min_group_size: 5,
        neighbor_radius: 1,
        max_concurrent: 2,
        test_paint: true,
        ..PipelineConfig::default()
    };

    let eraser = StreakEraser::with_classifier(config, Arc::new(AlwaysPaint)).unwrap();
    let sink = Arc::new(MemorySink::default());
    let summary = eraser
        .run(Arc::new(MemorySource::new(frames)), sink.clone(), None)
        .await
        .unwrap();
    assert_eq!(summary.groups, 2);
    assert_eq!(summary.painted_groups, 0);
    assert_eq!(summary.painted_pixels, 0);

    let marked = sink.test_paint.lock().unwrap();
    for index in 1..3 {
        let output = sink.output(index).unwrap();
        for &(x, y) in &block {
            assert_eq!(
                marked[&index].pixel(x, y),
                PaintReason::AdjacentOverlap.test_paint_color(),
                "frame {index} at {x},{y}"
            );
            assert_eq!(output.pixel(x, y), SPIKE, "frame {index} at {x},{y}");
        }
    }
}

#[tokio::test]
async fn a_panicking_write_is_not_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let err = write_with_retry(3, 2, move || -> streak_eraser::Result<bool> {
        counter.fetch_add(1, Ordering::SeqCst);
        panic!("sink exploded")
    })
    .await
    .unwrap_err();
    assert!(
        matches!(err, EraserError::Internal(InternalError::TaskFailed(_))),
        "{err}"
    );
    assert!(!err.is_retryable());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn the_first_frame_is_painted_from_the_next() {
    let sink = Arc::new(MemorySink::default());
    let summary = run(assume_everything(0, 1), sky_with_spike(3, 0, (5, 5)), sink.clone())
        .await
        .unwrap();
    assert_eq!(summary.painted_pixels, 9);
    assert_eq!(
        sink.output(0).unwrap(),
        PixelBuffer::filled(WIDTH, HEIGHT, BACKGROUND)
    );
}

#[tokio::test]
async fn test_paint_marks_groups_by_reason() {
    let config = PipelineConfig {
        test_paint: true,
        ..assume_everything(1, 2)
    };
    let sink = Arc::new(MemorySink::default());
    run(config, sky_with_spike(4, 1, (20, 4)), sink.clone())
        .await
        .unwrap();

    let marked = sink.test_paint.lock().unwrap();
    assert_eq!(marked.len(), 4);
    assert_eq!(
        marked[&1].pixel(21, 5),
        PaintReason::Assumed.test_paint_color()
    );
    assert_eq!(marked[&1].pixel(0, 0), BACKGROUND);
    assert_eq!(marked[&0].pixel(21, 5), BACKGROUND);
}

#[tokio::test]
async fn finished_outputs_are_skipped_on_resume() {
    let sink = Arc::new(MemorySink {
        existing: [0, 1, 2, 3, 5, 6, 7].into_iter().collect(),
        ..MemorySink::default()
    });
    let summary = run(assume_everything(1, 2), sky_with_spike(8, 4, (3, 3)), sink.clone())
        .await
        .unwrap();

    assert_eq!(summary.skipped, 5);
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.written, 1);
    assert!(sink.output(4).is_some());
    assert!(summary.event_position(0, FrameState::LoadingImages).is_none());
    assert!(summary.event_position(3, FrameState::Complete).is_some());
    assert_window_order(&summary, 8, 1);
}

#[tokio::test]
async fn nothing_runs_when_every_output_exists() {
    let sink = Arc::new(MemorySink {
        existing: (0..3).collect(),
        ..MemorySink::default()
    });
    let summary = run(assume_everything(1, 1), sky_with_spike(3, 1, (3, 3)), sink.clone())
        .await
        .unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.skipped, 3);
    assert!(summary.events.is_empty());
    assert_eq!(sink.attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn a_single_frame_has_no_neighbor() {
    let sink = Arc::new(MemorySink::default());
    let err = run(assume_everything(1, 1), sky_with_spike(1, 0, (3, 3)), sink)
        .await
        .unwrap_err();
    assert!(matches!(err, EraserError::MissingNeighbor { len: 1, .. }), "{err}");
}

#[tokio::test]
async fn failed_writes_are_retried() {
    let config = PipelineConfig {
        write_retries: 2,
        ..assume_everything(1, 2)
    };
    let sink = Arc::new(MemorySink::failing(1));
    let summary = run(config, sky_with_spike(3, 1, (3, 3)), sink.clone())
        .await
        .unwrap();
    assert_eq!(summary.written, 3);
    assert_eq!(sink.attempts.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn writes_fail_for_good_once_retries_run_out() {
    let config = PipelineConfig {
        write_retries: 1,
        ..assume_everything(1, 2)
    };
    let sink = Arc::new(MemorySink::failing(usize::MAX));
    let err = run(config, sky_with_spike(3, 1, (3, 3)), sink.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, EraserError::Write { .. }), "{err}");
    assert_eq!(sink.attempts.load(Ordering::SeqCst), 2);
    assert!(sink.outputs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn an_unreadable_frame_aborts_the_run() {
    let mut source = MemorySource::new(sky_with_spike(5, 1, (3, 3)));
    source.broken = Some(3);
    let eraser = StreakEraser::new(assume_everything(1, 2)).unwrap();
    let sink = Arc::new(MemorySink::default());
    let err = eraser
        .run(Arc::new(source), sink.clone(), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unreadable"), "{err}");
    assert!(sink.output(4).is_none());
}

#[tokio::test]
async fn every_group_lands_in_the_feature_dump() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("features.csv");
    let dump = FeatureDump::create(&path).unwrap();

    let eraser = StreakEraser::new(assume_everything(1, 2)).unwrap();
    let summary = eraser
        .run(
            Arc::new(MemorySource::new(sky_with_spike(4, 2, (6, 6)))),
            Arc::new(MemorySink::default()),
            Some(dump),
        )
        .await
        .unwrap();
    assert_eq!(summary.groups, 1);

    let mut reader = csv::Reader::from_path(&path).unwrap();
    let rows: Vec<csv::StringRecord> = reader.records().map(|row| row.unwrap()).collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0][0], "2");
    assert_eq!(&rows[0][1], "6,6");
    assert!(rows[0].iter().any(|field| field == "assumed"));
}

// THEORY:
// The parallel pipeline runs the per-frame analysis on a pool of workers and
// funnels every result into a single final-processing window. The window is an
// actor: it alone owns the processed frames, it is reached only through a
// channel, and it finalizes frames strictly in index order.
//
// Key architectural principles:
// 1.  **Dispatcher and workers**: A dispatcher hands each frame to whichever
//     worker is idle. Workers load the frame and its direct neighbors through
//     the shared cache, analyze it on a blocking thread and report to the window.
// 2.  **Bounded residency**: Admission is a semaphore. A frame only enters the
//     pool holding a permit, and the permit travels with it until the window
//     evicts the frame. `2W + 2 + max_concurrent` permits cover the widest
//     window the cursor ever needs plus one frame per worker, so admission
//     cannot starve the window.
// 3.  **Blocking, not polling**: The window sleeps on its channel. Each message
//     may classify frames whose neighbors are now known, advance the cursor,
//     and finalize the frame that fell out of the window.
// 4.  **Strict ordering**: Frame `i - W - 1` is finalized only once every
//     scheduled frame in `[i - W, i + W]` has been classified and frame `i` has
//     been reconciled against its neighbors.

use crate::core_modules::feature_dump::FeatureDump;
use crate::core_modules::frame::{FrameState, ProcessedFrame};
use crate::core_modules::image_sequence::{FrameCache, FrameSink, FrameSource, ResumePlan};
use crate::core_modules::pixel_buffer::PixelBuffer;
use crate::core_modules::reconcile;
use crate::error::{EraserError, InternalError, Result};
use crate::pipeline::{FrameAnalyzer, PipelineConfig, RunSummary};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// First delay between write attempts. Doubles with every retry.
pub const WRITE_BACKOFF: Duration = Duration::from_millis(250);

enum WindowMessage {
    State {
        index: usize,
        state: FrameState,
    },
    Processed {
        frame: ProcessedFrame,
        permit: OwnedSemaphorePermit,
    },
    Failed {
        index: usize,
        error: EraserError,
    },
}

struct FrameTask {
    index: usize,
    permit: OwnedSemaphorePermit,
}

fn join_error(err: tokio::task::JoinError) -> EraserError {
    InternalError::TaskFailed(err.to_string()).into()
}

struct WorkerPool {
    task_sender: mpsc::UnboundedSender<FrameTask>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(
        size: usize,
        cache: Arc<FrameCache>,
        analyzer: Arc<FrameAnalyzer>,
        window: mpsc::UnboundedSender<WindowMessage>,
    ) -> Self {
        let (task_sender, mut task_receiver) = mpsc::unbounded_channel::<FrameTask>();
        let (idle_sender, mut idle_receiver) = mpsc::unbounded_channel::<usize>();
        let mut workers = Vec::with_capacity(size);

        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) = (0..size)
            .map(|_| mpsc::unbounded_channel::<FrameTask>())
            .unzip();

        // Spawn dispatcher
        tokio::spawn(async move {
            while let Some(task) = task_receiver.recv().await {
                let Some(worker_id) = idle_receiver.recv().await else {
                    break;
                };
                if worker_senders[worker_id].send(task).is_err() {
                    break;
                }
            }
        });

        // Spawn workers
        for (worker_id, mut worker_receiver) in worker_receivers.into_iter().enumerate() {
            let cache = Arc::clone(&cache);
            let analyzer = Arc::clone(&analyzer);
            let window = window.clone();
            let idle = idle_sender.clone();

            let worker = tokio::spawn(async move {
                if idle.send(worker_id).is_err() {
                    return;
                }
                while let Some(task) = worker_receiver.recv().await {
                    let index = task.index;
                    let processed =
                        Self::process_frame_worker(&cache, &analyzer, &window, index).await;
                    let message = match processed {
                        Ok(frame) => WindowMessage::Processed {
                            frame,
                            permit: task.permit,
                        },
                        Err(error) => WindowMessage::Failed { index, error },
                    };
                    if window.send(message).is_err() || idle.send(worker_id).is_err() {
                        break;
                    }
                }
            });

            workers.push(worker);
        }

        Self {
            task_sender,
            workers,
        }
    }

    async fn process_frame_worker(
        cache: &FrameCache,
        analyzer: &Arc<FrameAnalyzer>,
        window: &mpsc::UnboundedSender<WindowMessage>,
        index: usize,
    ) -> Result<ProcessedFrame> {
        let report = |state| {
            window
                .send(WindowMessage::State { index, state })
                .map_err(|_| InternalError::ChannelClosed("window"))
        };

        report(FrameState::LoadingImages)?;
        let wanted = [Some(index), index.checked_sub(1), Some(index + 1)]
            .into_iter()
            .flatten()
            .filter(|&wanted| wanted < cache.len());
        let mut neighbors =
            futures::future::try_join_all(wanted.map(|wanted| cache.get(wanted))).await?;
        let frame = neighbors.remove(0);

        report(FrameState::DetectingOutliers)?;
        let analyzer = Arc::clone(analyzer);
        tokio::task::spawn_blocking(move || {
            let neighbors: Vec<&PixelBuffer> = neighbors.iter().map(Arc::as_ref).collect();
            analyzer.analyze(index, &frame, &neighbors)
        })
        .await
        .map_err(join_error)?
    }

    fn submit(&self, task: FrameTask) -> Result<()> {
        self.task_sender
            .send(task)
            .map_err(|_| InternalError::ChannelClosed("worker pool").into())
    }

    fn abort(&self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

/// Writes through `write`, retrying storage errors with exponential backoff.
pub async fn write_with_retry<F>(index: usize, retries: u32, write: F) -> Result<bool>
where
    F: Fn() -> Result<bool> + Send + Sync + 'static,
{
    let write = Arc::new(write);
    let mut attempt = 0;
    loop {
        let attempt_write = Arc::clone(&write);
        let result = tokio::task::spawn_blocking(move || attempt_write())
            .await
            .map_err(join_error)?;
        match result {
            Ok(written) => return Ok(written),
            Err(err) if err.is_retryable() && attempt < retries => {
                let delay = WRITE_BACKOFF * 2u32.pow(attempt);
                attempt += 1;
                warn!(frame = index, attempt, ?delay, "write failed, retrying: {err}");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                error!(frame = index, attempts = attempt + 1, "write failed: {err}");
                return Err(err);
            }
        }
    }
}

struct FinalProcessingWindow {
    config: Arc<PipelineConfig>,
    analyzer: Arc<FrameAnalyzer>,
    cache: Arc<FrameCache>,
    sink: Arc<dyn FrameSink>,
    plan: ResumePlan,
    feature_dump: Option<FeatureDump>,
    frames: BTreeMap<usize, ProcessedFrame>,
    permits: BTreeMap<usize, OwnedSemaphorePermit>,
    finalized: Vec<bool>,
    received: usize,
    /// Next frame to reconcile.
    cursor: usize,
    /// Next frame to finalize.
    next_final: usize,
    summary: RunSummary,
}

impl FinalProcessingWindow {
    fn radius(&self) -> usize {
        self.config.neighbor_radius
    }

    fn len(&self) -> usize {
        self.finalized.len()
    }

    fn record(&mut self, index: usize, state: FrameState) {
        self.summary.events.push((index, state));
    }

    /// A neighbor whose groups are known, or that will never have any.
    fn is_neighbor_known(&self, index: usize) -> bool {
        !self.plan.should_process(index)
            || self.finalized[index]
            || self.frames.contains_key(&index)
    }

    fn is_classified(&self, index: usize) -> bool {
        !self.plan.should_process(index)
            || self.finalized[index]
            || self
                .frames
                .get(&index)
                .is_some_and(|frame| frame.state().is_processing_complete())
    }

    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<WindowMessage>) -> Result<RunSummary> {
        let scheduled = self.plan.scheduled().count();
        while self.received < scheduled {
            let Some(message) = receiver.recv().await else {
                let missing = self
                    .plan
                    .scheduled()
                    .find(|index| !self.finalized[*index] && !self.frames.contains_key(index))
                    .unwrap_or(self.cursor);
                return Err(InternalError::FrameNeverArrived(missing).into());
            };
            match message {
                WindowMessage::State { index, state } => self.record(index, state),
                WindowMessage::Failed { index, error } => {
                    error!(frame = index, "frame failed: {error}");
                    return Err(error);
                }
                WindowMessage::Processed { frame, permit } => {
                    let index = frame.index;
                    self.received += 1;
                    self.record(index, frame.state());
                    self.permits.insert(index, permit);
                    self.frames.insert(index, frame);
                    self.classify_ready()?;
                    self.advance().await?;
                }
            }
        }

        self.classify_ready()?;
        self.advance().await?;
        while self.next_final < self.len() {
            self.finalize(self.next_final).await?;
        }
        Ok(self.summary)
    }

    /// Classifies every received frame whose direct neighbors are known.
    fn classify_ready(&mut self) -> Result<()> {
        let ready: Vec<usize> = self
            .frames
            .iter()
            .filter(|(_, frame)| frame.state() == FrameState::InterFrameProcessing)
            .map(|(&index, _)| index)
            .filter(|&index| {
                (index == 0 || self.is_neighbor_known(index - 1))
                    && (index + 1 >= self.len() || self.is_neighbor_known(index + 1))
            })
            .collect();

        for index in ready {
            let Some(mut frame) = self.frames.remove(&index) else {
                continue;
            };
            let neighbors: Vec<&ProcessedFrame> = [index.checked_sub(1), Some(index + 1)]
                .into_iter()
                .flatten()
                .filter_map(|neighbor| self.frames.get(&neighbor))
                .collect();
            self.analyzer.classify(&mut frame, &neighbors);
            frame.set_state(FrameState::OutlierProcessingComplete)?;
            debug!(frame = index, groups = frame.groups.len(), "classified frame");
            self.frames.insert(index, frame);
            self.record(index, FrameState::OutlierProcessingComplete);
        }
        Ok(())
    }

    /// Moves the cursor over every position whose whole window is classified.
    async fn advance(&mut self) -> Result<()> {
        let radius = self.radius();
        while self.cursor < self.len() {
            let start = self.cursor.saturating_sub(radius);
            let end = (self.cursor + radius).min(self.len() - 1);
            if !(start..=end).all(|index| self.is_classified(index)) {
                break;
            }
            self.reconcile(self.cursor)?;
            if self.cursor > radius {
                self.finalize(self.cursor - radius - 1).await?;
            }
            self.cursor += 1;
        }
        Ok(())
    }

    fn reconcile(&mut self, index: usize) -> Result<()> {
        if !self.frames.contains_key(&index) {
            return Ok(());
        }
        let params = self.config.reconcile_params();
        let radius = self.radius();
        let streaks = reconcile::streak_pass(&mut self.frames, index, radius, &params);

        let mut overlaps = 0;
        if index > 0 && self.frames.contains_key(&(index - 1)) {
            let mut later = self
                .frames
                .remove(&index)
                .ok_or(InternalError::FrameNeverArrived(index))?;
            if let Some(earlier) = self.frames.get_mut(&(index - 1)) {
                overlaps = reconcile::overlap_pass(earlier, &mut later, &params);
            }
            self.frames.insert(index, later);
        }
        if streaks > 0 || overlaps > 0 {
            debug!(frame = index, streaks, overlaps, "reconciled frame");
        }
        Ok(())
    }

    fn advance_state(&mut self, frame: &mut ProcessedFrame, state: FrameState) -> Result<()> {
        frame.set_state(state)?;
        self.record(frame.index, state);
        Ok(())
    }

    /// Paints, writes and evicts frame `index`. Frames outside the plan are
    /// only marked done.
    async fn finalize(&mut self, index: usize) -> Result<()> {
        if index != self.next_final {
            return Err(InternalError::FinalizedOutOfOrder {
                index,
                expected: self.next_final,
            }
            .into());
        }
        self.next_final += 1;
        if !self.plan.should_process(index) {
            self.finalized[index] = true;
            return Ok(());
        }
        let mut frame = self
            .frames
            .remove(&index)
            .ok_or(InternalError::FrameNeverArrived(index))?;

        self.advance_state(&mut frame, FrameState::ReloadingImages)?;
        let image = self.cache.get(index).await?;
        let source_index = if index == 0 { 1 } else { index - 1 };
        let source = self.cache.get(source_index).await?;
        frame.commit_decisions()?;

        self.advance_state(&mut frame, FrameState::Painting)?;
        let test_paint = self.config.test_paint;
        let (mut frame, output, test_output, painted_pixels) =
            tokio::task::spawn_blocking(move || {
                let mut output = image.as_ref().clone();
                let painted = frame.paint(&mut output, &source);
                let test_output = test_paint.then(|| {
                    let mut marked = image.as_ref().clone();
                    frame.test_paint(&mut marked);
                    marked
                });
                (frame, output, test_output, painted)
            })
            .await
            .map_err(join_error)?;

        self.advance_state(&mut frame, FrameState::WritingOutputFile)?;
        let retries = self.config.write_retries;
        let sink = Arc::clone(&self.sink);
        let output = Arc::new(output);
        let written = write_with_retry(index, retries, move || sink.write(index, &output)).await?;
        if let Some(test_output) = test_output {
            let sink = Arc::clone(&self.sink);
            let test_output = Arc::new(test_output);
            write_with_retry(index, retries, move || {
                sink.write_test_paint(index, &test_output)
            })
            .await?;
        }
        if let Some(dump) = self.feature_dump.as_mut() {
            dump.append(&frame)?;
        }

        self.advance_state(&mut frame, FrameState::Complete)?;
        let painted_groups = frame.painted_groups().count();
        info!(
            frame = index,
            groups = frame.groups.len(),
            painted_groups,
            painted_pixels,
            "finished frame"
        );
        self.summary.processed += 1;
        self.summary.groups += frame.groups.len();
        self.summary.painted_groups += painted_groups;
        self.summary.painted_pixels += painted_pixels;
        if written {
            self.summary.written += 1;
        }
        self.permits.remove(&index);
        self.finalized[index] = true;
        Ok(())
    }
}

pub struct ParallelPipeline {
    config: Arc<PipelineConfig>,
    analyzer: Arc<FrameAnalyzer>,
}

impl ParallelPipeline {
    pub fn new(config: Arc<PipelineConfig>, analyzer: Arc<FrameAnalyzer>) -> Self {
        Self { config, analyzer }
    }

    pub async fn run(
        &self,
        source: Arc<dyn FrameSource>,
        sink: Arc<dyn FrameSink>,
        feature_dump: Option<FeatureDump>,
    ) -> Result<RunSummary> {
        let len = source.len();
        if len < 2 {
            return Err(EraserError::MissingNeighbor { index: 0, len });
        }
        let radius = self.config.neighbor_radius;
        let plan = ResumePlan::new(len, radius, |index| sink.output_exists(index));
        let summary = RunSummary {
            frames: len,
            skipped: plan.skipped_count(),
            ..RunSummary::default()
        };
        if plan.scheduled().next().is_none() {
            info!(frames = len, "every output already exists, nothing to do");
            return Ok(summary);
        }
        if summary.skipped > 0 {
            info!(skipped = summary.skipped, "resuming, skipping finished frames");
        }

        let cache = Arc::new(FrameCache::new(source));
        let (window_sender, window_receiver) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(
            self.config.max_concurrent,
            Arc::clone(&cache),
            Arc::clone(&self.analyzer),
            window_sender,
        );

        let semaphore = Arc::new(Semaphore::new(self.config.window_permits()));
        let scheduled: Vec<usize> = plan.scheduled().collect();
        let feeder_semaphore = Arc::clone(&semaphore);
        let feeder = tokio::spawn(async move {
            for index in scheduled {
                let Ok(permit) = Arc::clone(&feeder_semaphore).acquire_owned().await else {
                    break;
                };
                if pool.submit(FrameTask { index, permit }).is_err() {
                    break;
                }
            }
            pool
        });

        let window = FinalProcessingWindow {
            config: Arc::clone(&self.config),
            analyzer: Arc::clone(&self.analyzer),
            cache,
            sink,
            plan,
            feature_dump,
            frames: BTreeMap::new(),
            permits: BTreeMap::new(),
            finalized: vec![false; len],
            received: 0,
            cursor: 0,
            next_final: 0,
            summary,
        };
        let result = window.run(window_receiver).await;

        semaphore.close();
        match feeder.await {
            Ok(pool) => {
                if result.is_err() {
                    pool.abort();
                }
            }
            Err(err) => warn!("frame feeder ended abnormally: {err}"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::classifier::{ClassifierRegistry, forests};
    use crate::core_modules::pixel::pixel::Pixel;

    struct BlankSource(usize);

    impl FrameSource for BlankSource {
        fn len(&self) -> usize {
            self.0
        }

        fn name(&self, index: usize) -> String {
            format!("{index}.tif")
        }

        fn load(&self, _index: usize) -> Result<PixelBuffer> {
            Ok(PixelBuffer::filled(4, 4, Pixel::new(2000, 2000, 2000)))
        }
    }

    struct DiscardingSink;

    impl FrameSink for DiscardingSink {
        fn output_exists(&self, _index: usize) -> bool {
            false
        }

        fn write(&self, _index: usize, _buffer: &PixelBuffer) -> Result<bool> {
            Ok(true)
        }

        fn write_test_paint(&self, _index: usize, _buffer: &PixelBuffer) -> Result<bool> {
            Ok(true)
        }
    }

    fn window(len: usize) -> FinalProcessingWindow {
        let config = PipelineConfig::default();
        let classifier = ClassifierRegistry::builtin()
            .resolve(forests::DEFAULT_FOREST)
            .unwrap();
        FinalProcessingWindow {
            analyzer: Arc::new(FrameAnalyzer::from_config(&config, classifier)),
            config: Arc::new(config),
            cache: Arc::new(FrameCache::new(Arc::new(BlankSource(len)))),
            sink: Arc::new(DiscardingSink),
            plan: ResumePlan::all(len),
            feature_dump: None,
            frames: BTreeMap::new(),
            permits: BTreeMap::new(),
            finalized: vec![false; len],
            received: 0,
            cursor: 0,
            next_final: 0,
            summary: RunSummary::default(),
        }
    }

    #[tokio::test]
    async fn finalizing_ahead_of_the_queue_is_rejected() {
        let mut window = window(4);
        let err = window.finalize(2).await.unwrap_err();
        assert!(matches!(
            err,
            EraserError::Internal(InternalError::FinalizedOutOfOrder {
                index: 2,
                expected: 0
            })
        ));
        assert_eq!(window.next_final, 0);
        assert!(!window.finalized[2]);
    }

    #[tokio::test]
    async fn a_panicking_task_is_an_internal_failure() {
        let joined = tokio::task::spawn_blocking(|| -> usize { panic!("analysis blew up") }).await;
        let err = joined.map_err(join_error).unwrap_err();
        assert!(matches!(err, EraserError::Internal(InternalError::TaskFailed(_))));
        assert!(!err.is_retryable());
    }
}

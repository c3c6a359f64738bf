// THEORY:
// The `pipeline` module is the top-level API of the streak eraser. It owns the
// run configuration, the per-frame analysis that workers execute, and the
// `StreakEraser` entry point that wires a frame source and sink into the
// parallel pipeline.
//
// Key architectural principles:
// 1.  **One immutable configuration**: Every tunable lives in `PipelineConfig`.
//     It is validated once, then shared behind an `Arc` by every worker and by
//     the final-processing window. Nothing reads a global.
// 2.  **Intra-frame work is self-contained**: `FrameAnalyzer::analyze` needs only
//     a frame and its direct neighbors. It is pure CPU work and runs on a
//     blocking thread.
// 3.  **Inter-frame work is deferred**: Classification needs the groups of the
//     neighboring frames, so it is run by the window once those are known.

use crate::core_modules::classifier::{Classifier, ClassifierRegistry};
use crate::core_modules::feature_dump::FeatureDump;
use crate::core_modules::frame::{FrameState, ProcessedFrame};
use crate::core_modules::group_tagger::GroupTagger;
use crate::core_modules::image_sequence::{FrameSink, FrameSource, TiffSequence, TiffSink};
use crate::core_modules::outlier_detector::OutlierDetector;
use crate::core_modules::outlier_group::{self, collect_groups};
use crate::core_modules::paint_policy::PaintPolicy;
use crate::core_modules::pixel_buffer::PixelBuffer;
use crate::core_modules::reconcile::ReconcileParams;
use crate::error::{EraserError, Result};
use crate::parallel_pipeline::ParallelPipeline;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Hough lines kept per group.
pub const MAX_HOUGH_LINES: usize = 20;

pub const FEATURE_DUMP_FILE: &str = "features.csv";

pub const CONFIG_FILE: &str = "config.json";

/// Converts a percentage of the full 16-bit range into brightness units.
pub fn sixteen_bit(percent: f64) -> u16 {
    (percent.clamp(0.0, 100.0) / 100.0 * u16::MAX as f64) as u16
}

/// Configuration for a streak-erasing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Outlier amount, in percent of full brightness, a pixel must exceed to be detected.
    pub outlier_min_threshold: f64,
    /// Groups must be strictly larger than this to be kept.
    pub min_group_size: usize,
    /// Groups at least this large are painted without classification.
    pub assume_airplane_size: usize,
    pub max_concurrent: usize,
    /// Frames on each side that must be classified before a frame is finalized.
    pub neighbor_radius: usize,
    /// Zero disables padding.
    pub padding_radius: u32,
    pub min_neighbors: usize,
    pub looks_like_a_line_score: f64,
    pub final_theta_diff: f64,
    pub final_rho_diff: f64,
    pub center_line_theta_diff: f64,
    pub final_center_distance: f64,
    pub final_size_ratio: f64,
    pub final_overlap_amount: f64,
    pub final_pixel_overlap_amount: f64,
    /// Built-in classifier name or path of a forest file.
    pub classifier: String,
    pub test_paint: bool,
    pub write_feature_csv: bool,
    pub write_retries: u32,
    pub output_suffix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            outlier_min_threshold: 9.0,
            min_group_size: 80,
            assume_airplane_size: 1000,
            max_concurrent: num_cpus::get().max(1),
            neighbor_radius: 2,
            padding_radius: 0,
            min_neighbors: 0,
            looks_like_a_line_score: 0.4,
            final_theta_diff: 10.0,
            final_rho_diff: 20.0,
            center_line_theta_diff: 18.0,
            final_center_distance: 300.0,
            final_size_ratio: 5.0,
            final_overlap_amount: 0.33,
            final_pixel_overlap_amount: 0.05,
            classifier: crate::core_modules::classifier::forests::DEFAULT_FOREST.to_string(),
            test_paint: false,
            write_feature_csv: false,
            write_retries: 3,
            output_suffix: "no-planes".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.outlier_min_threshold) {
            return Err(EraserError::Config(format!(
                "outlier threshold must be a percentage between 0 and 100, got {}",
                self.outlier_min_threshold
            )));
        }
        if self.max_concurrent == 0 {
            return Err(EraserError::Config("max_concurrent must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.looks_like_a_line_score) {
            return Err(EraserError::Config(
                "looks_like_a_line_score must lie between 0 and 1".into(),
            ));
        }
        let positive = [
            ("final_theta_diff", self.final_theta_diff),
            ("final_rho_diff", self.final_rho_diff),
            ("center_line_theta_diff", self.center_line_theta_diff),
            ("final_center_distance", self.final_center_distance),
        ];
        if let Some((name, value)) = positive.iter().find(|(_, value)| !(*value > 0.0)) {
            return Err(EraserError::Config(format!("{name} must be positive, got {value}")));
        }
        if !(self.final_size_ratio >= 1.0) {
            return Err(EraserError::Config("final_size_ratio must be at least 1".into()));
        }
        let fractions = [
            ("final_overlap_amount", self.final_overlap_amount),
            ("final_pixel_overlap_amount", self.final_pixel_overlap_amount),
        ];
        if let Some((name, value)) = fractions
            .iter()
            .find(|(_, value)| !(0.0..=1.0).contains(value))
        {
            return Err(EraserError::Config(format!(
                "{name} must lie between 0 and 1, got {value}"
            )));
        }
        if self.classifier.trim().is_empty() {
            return Err(EraserError::Config("no classifier selected".into()));
        }
        if self.output_suffix.trim().is_empty() {
            return Err(EraserError::Config("output_suffix must not be empty".into()));
        }
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            EraserError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        serde_json::from_str(&text)
            .map_err(|err| EraserError::Config(format!("{}: {err}", path.display())))
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|err| EraserError::Config(err.to_string()))?;
        std::fs::write(path, text).map_err(|err| EraserError::Write {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// Detection threshold in brightness units.
    pub fn max_pixel_distance(&self) -> u16 {
        sixteen_bit(self.outlier_min_threshold)
    }

    pub fn reconcile_params(&self) -> ReconcileParams {
        ReconcileParams {
            theta_diff: self.final_theta_diff,
            rho_diff: self.final_rho_diff,
            center_line_theta_diff: self.center_line_theta_diff,
            center_distance: self.final_center_distance,
            size_ratio: self.final_size_ratio,
            overlap_amount: self.final_overlap_amount,
            pixel_overlap_amount: self.final_pixel_overlap_amount,
            looks_like_a_line_score: self.looks_like_a_line_score,
        }
    }

    /// Permits bounding the frames resident at once.
    pub fn window_permits(&self) -> usize {
        2 * self.neighbor_radius + 2 + self.max_concurrent
    }

    /// `<input>-<suffix>` next to the input directory.
    pub fn output_dir_for(&self, input: &Path) -> PathBuf {
        let name = input
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "frames".to_string());
        input.with_file_name(format!("{name}-{}", self.output_suffix))
    }
}

/// `<output>-test-paint` next to the output directory.
pub fn test_paint_dir_for(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push("-test-paint");
    PathBuf::from(name)
}

/// Everything a worker needs to analyze one frame.
#[derive(Debug, Clone)]
pub struct FrameAnalyzer {
    detector: OutlierDetector,
    tagger: GroupTagger,
    policy: PaintPolicy,
    min_group_size: usize,
}

impl FrameAnalyzer {
    pub fn new(
        detector: OutlierDetector,
        tagger: GroupTagger,
        policy: PaintPolicy,
        min_group_size: usize,
    ) -> Self {
        Self {
            detector,
            tagger,
            policy,
            min_group_size,
        }
    }

    pub fn from_config(config: &PipelineConfig, classifier: Arc<dyn Classifier>) -> Self {
        Self::new(
            OutlierDetector::new(config.max_pixel_distance()),
            GroupTagger::new(config.padding_radius, config.min_neighbors),
            PaintPolicy::new(
                config.assume_airplane_size,
                config.looks_like_a_line_score,
                classifier,
            ),
            config.min_group_size,
        )
    }

    pub fn policy(&self) -> &PaintPolicy {
        &self.policy
    }

    /// Runs the intra-frame stages. The returned frame holds no pixel data and
    /// waits in `InterFrameProcessing` for its neighbors.
    pub fn analyze(
        &self,
        index: usize,
        frame: &PixelBuffer,
        neighbors: &[&PixelBuffer],
    ) -> Result<ProcessedFrame> {
        // Stage 1: Outlier Detection
        let mut map = self.detector.detect(index, frame, neighbors)?;
        let outlier_count = map.len();

        // Stage 2: Grouping and Padding
        let sizes = self.tagger.tag(&mut map)?;

        // Stage 3: Group Collection
        let mut groups = collect_groups(&map, &sizes, index, self.min_group_size);
        drop(map);

        // Stage 4: Line Analysis, skipped when the size override decides anyway
        for group in groups.iter_mut().filter(|g| !self.policy.is_assumed(g)) {
            group.analyze_lines(MAX_HOUGH_LINES);
        }

        // Stage 5: Intra-frame Features
        for group in &mut groups {
            group.compute_intra_features(frame.width, frame.height);
        }
        outlier_group::fill_same_frame_context(&mut groups, frame.width);

        debug!(
            frame = index,
            outliers = outlier_count,
            groups = groups.len(),
            "analyzed frame"
        );
        Ok(ProcessedFrame::new(
            index,
            frame.width,
            frame.height,
            outlier_count,
            groups,
            sizes,
        ))
    }

    /// Fills the cross-frame features of `frame` from its neighbors and records
    /// a provisional decision for every group.
    pub fn classify(&self, frame: &mut ProcessedFrame, neighbors: &[&ProcessedFrame]) {
        let width = frame.width;
        for group in &mut frame.groups {
            let others = neighbors.iter().flat_map(|neighbor| neighbor.groups.iter());
            outlier_group::fill_cross_frame_context(group, others, width);
        }
        let decisions: Vec<_> = frame
            .groups
            .iter()
            .map(|group| (group.tag, self.policy.decide(group)))
            .collect();
        for (tag, decision) in decisions {
            frame.set_decision(tag, decision);
        }
    }
}

/// What a run did.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub frames: usize,
    pub processed: usize,
    pub skipped: usize,
    pub groups: usize,
    pub painted_groups: usize,
    pub painted_pixels: usize,
    /// Outputs actually written. Already existing outputs are not counted.
    pub written: usize,
    /// Every state a frame entered, in the order the window observed it.
    pub events: Vec<(usize, FrameState)>,
}

impl RunSummary {
    /// Position in `events` at which frame `index` entered `state`.
    pub fn event_position(&self, index: usize, state: FrameState) -> Option<usize> {
        self.events
            .iter()
            .position(|&(frame, entered)| frame == index && entered == state)
    }
}

/// Erases airplane streaks from a sequence of frames.
pub struct StreakEraser {
    config: Arc<PipelineConfig>,
    analyzer: Arc<FrameAnalyzer>,
}

impl StreakEraser {
    /// Validates `config` and resolves its classifier.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let classifier = ClassifierRegistry::builtin().resolve(&config.classifier)?;
        Self::with_classifier(config, classifier)
    }

    pub fn with_classifier(config: PipelineConfig, classifier: Arc<dyn Classifier>) -> Result<Self> {
        config.validate()?;
        let analyzer = FrameAnalyzer::from_config(&config, classifier);
        Ok(Self {
            config: Arc::new(config),
            analyzer: Arc::new(analyzer),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run(
        &self,
        source: Arc<dyn FrameSource>,
        sink: Arc<dyn FrameSink>,
        feature_dump: Option<FeatureDump>,
    ) -> Result<RunSummary> {
        let pipeline = ParallelPipeline::new(Arc::clone(&self.config), Arc::clone(&self.analyzer));
        pipeline.run(source, sink, feature_dump).await
    }

    /// Processes a directory of TIFF frames into `output`, or into the default
    /// output directory next to the input.
    pub async fn run_directory(&self, input: &Path, output: Option<&Path>) -> Result<RunSummary> {
        let sequence = TiffSequence::open(input)?;
        let output = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.output_dir_for(input));
        let sink = TiffSink::new(
            output.clone(),
            test_paint_dir_for(&output),
            sequence.names().to_vec(),
        );
        let feature_dump = if self.config.write_feature_csv {
            Some(FeatureDump::create(&output.join(FEATURE_DUMP_FILE))?)
        } else {
            None
        };

        info!(
            frames = sequence.len(),
            classifier = self.analyzer.policy().classifier().name(),
            "erasing streaks from {} into {}",
            input.display(),
            output.display()
        );
        self.run(Arc::new(sequence), Arc::new(sink), feature_dump)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::features::FeatureVector;
    use crate::core_modules::paint_policy::PaintReason;
    use crate::core_modules::pixel::pixel::Pixel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl Classifier for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn score(&self, _features: &FeatureVector) -> f64 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            -1.0
        }
    }

    #[test]
    fn defaults_are_valid_and_survive_a_round_trip() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_pixel_distance(), sixteen_bit(9.0));
        assert_eq!(config.window_permits(), 6 + config.max_concurrent);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        config.write_to(&path).unwrap();
        assert_eq!(PipelineConfig::read_from(&path).unwrap(), config);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, r#"{ "min_group_size": 12, "test_paint": true }"#).unwrap();
        let config = PipelineConfig::read_from(&path).unwrap();
        assert_eq!(config.min_group_size, 12);
        assert!(config.test_paint);
        assert_eq!(config.neighbor_radius, 2);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut config = PipelineConfig {
            outlier_min_threshold: 120.0,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EraserError::Config(_))));

        config = PipelineConfig {
            max_concurrent: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EraserError::Config(_))));

        config = PipelineConfig {
            final_overlap_amount: 1.5,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EraserError::Config(_))));

        config = PipelineConfig {
            classifier: "no-such-forest".into(),
            ..PipelineConfig::default()
        };
        assert!(matches!(StreakEraser::new(config), Err(EraserError::Config(_))));
    }

    #[test]
    fn sixteen_bit_scaling() {
        assert_eq!(sixteen_bit(0.0), 0);
        assert_eq!(sixteen_bit(100.0), u16::MAX);
        assert_eq!(sixteen_bit(50.0), 32767);
    }

    #[test]
    fn output_directories_sit_next_to_the_input() {
        let config = PipelineConfig::default();
        let output = config.output_dir_for(Path::new("/data/night-01"));
        assert_eq!(output, PathBuf::from("/data/night-01-no-planes"));
        assert_eq!(
            test_paint_dir_for(&output),
            PathBuf::from("/data/night-01-no-planes-test-paint")
        );
    }

    #[test]
    fn a_single_spike_is_one_assumed_group() {
        let black = PixelBuffer::new(5, 5);
        let mut target = PixelBuffer::new(5, 5);
        target.set_pixel(2, 2, Pixel::new(20_000, 0, 0));

        let classifier = Arc::new(Counting::default());
        let analyzer = FrameAnalyzer::new(
            OutlierDetector::new(10_000),
            GroupTagger::new(0, 0),
            PaintPolicy::new(1, 0.4, classifier.clone()),
            0,
        );
        let mut frame = analyzer.analyze(1, &target, &[&black, &black]).unwrap();
        assert_eq!(frame.outlier_count, 1);
        assert_eq!(frame.groups.len(), 1);
        assert_eq!(frame.groups[0].size, 1);
        assert!(frame.groups[0].lines.is_empty());
        assert_eq!(frame.state(), FrameState::InterFrameProcessing);

        analyzer.classify(&mut frame, &[]);
        let tag = frame.groups[0].tag;
        assert_eq!(frame.reason(&tag), Some(PaintReason::Assumed));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn small_groups_are_dropped_before_classification() {
        let black = PixelBuffer::new(5, 5);
        let mut target = PixelBuffer::new(5, 5);
        target.set_pixel(2, 2, Pixel::new(20_000, 0, 0));

        let classifier = Arc::new(Counting::default());
        let analyzer = FrameAnalyzer::new(
            OutlierDetector::new(10_000),
            GroupTagger::new(0, 0),
            PaintPolicy::new(100, 0.4, classifier.clone()),
            1,
        );
        let mut frame = analyzer.analyze(0, &target, &[&black]).unwrap();
        assert_eq!(frame.outlier_count, 1);
        assert!(frame.groups.is_empty());
        analyzer.classify(&mut frame, &[]);
        assert_eq!(frame.decisions().count(), 0);
    }
}

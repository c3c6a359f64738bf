// THEORY:
// The `PaintPolicy` is the decision layer. For every outlier group it produces
// a paint / no-paint verdict plus the reason behind it. The reason is more than
// a log line: test-paint output colors each group by its reason, which is how a
// human checks a run.
//
// Key architectural principles:
// 1.  **Size override**: Groups of at least `assume_airplane_size` members are
//     painted without consulting the classifier. Nothing that large and that new is a
//     star, and skipping the Hough work on big groups saves most of the cost.
// 2.  **Classifier verdict**: Every other group is scored by the configured
//     classifier. A score above zero paints. Among painted groups, those whose
//     best Hough line explains a large share of their pixels are labelled as
//     looking like a line.
// 3.  **Cross-frame reasons**: `InStreak` and `AdjacentOverlap` are never produced
//     here. The final-processing window assigns them when it reconciles
//     neighboring frames.

use crate::core_modules::classifier::Classifier;
use crate::core_modules::features::Feature;
use crate::core_modules::outlier_group::OutlierGroup;
use crate::core_modules::pixel::pixel::Pixel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Why a group is or is not painted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PaintReason {
    /// At or above the size override.
    Assumed,
    GoodScore,
    LooksLikeALine,
    /// Part of a line of groups moving across consecutive frames.
    InStreak,
    BadScore,
    /// Overlaps a similar group in the adjacent frame, so it is not transient.
    AdjacentOverlap,
}

impl PaintReason {
    pub const ALL: [PaintReason; 6] = [
        PaintReason::Assumed,
        PaintReason::GoodScore,
        PaintReason::LooksLikeALine,
        PaintReason::InStreak,
        PaintReason::BadScore,
        PaintReason::AdjacentOverlap,
    ];

    pub fn will_paint(self) -> bool {
        match self {
            PaintReason::Assumed
            | PaintReason::GoodScore
            | PaintReason::LooksLikeALine
            | PaintReason::InStreak => true,
            PaintReason::BadScore | PaintReason::AdjacentOverlap => false,
        }
    }

    /// Color used for this reason in test-paint output.
    pub fn test_paint_color(self) -> Pixel {
        const FULL: u16 = 0xFFFF;
        const HALF: u16 = 0xBFFF;
        match self {
            PaintReason::Assumed => Pixel::new(FULL, 0, FULL),
            PaintReason::GoodScore => Pixel::new(FULL, FULL, 0),
            PaintReason::LooksLikeALine => Pixel::new(HALF, 0, 0),
            PaintReason::InStreak => Pixel::new(FULL, 0, 0),
            PaintReason::BadScore => Pixel::new(0, FULL, FULL),
            PaintReason::AdjacentOverlap => Pixel::new(0, 0, FULL),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PaintReason::Assumed => "assumed",
            PaintReason::GoodScore => "good score",
            PaintReason::LooksLikeALine => "looks like a line",
            PaintReason::InStreak => "in a streak",
            PaintReason::BadScore => "bad score",
            PaintReason::AdjacentOverlap => "adjacent overlap",
        }
    }
}

impl fmt::Display for PaintReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Test-paint color of padding pixels, whatever their group's reason.
pub const PADDING_TEST_COLOR: Pixel = Pixel::new(0, 0xFFFF, 0);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PaintDecision {
    pub reason: PaintReason,
    /// Classifier score, when the classifier was consulted.
    pub score: Option<f64>,
}

impl PaintDecision {
    pub fn new(reason: PaintReason, score: Option<f64>) -> Self {
        Self { reason, score }
    }

    pub fn will_paint(&self) -> bool {
        self.reason.will_paint()
    }
}

#[derive(Debug, Clone)]
pub struct PaintPolicy {
    pub assume_airplane_size: usize,
    /// Share of a group's members on its best line that makes it "look like a line".
    pub looks_like_a_line_score: f64,
    classifier: Arc<dyn Classifier>,
}

impl PaintPolicy {
    pub fn new(
        assume_airplane_size: usize,
        looks_like_a_line_score: f64,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        Self {
            assume_airplane_size,
            looks_like_a_line_score,
            classifier,
        }
    }

    pub fn classifier(&self) -> &dyn Classifier {
        self.classifier.as_ref()
    }

    /// Whether the size override applies, in which case no line analysis is needed.
    pub fn is_assumed(&self, group: &OutlierGroup) -> bool {
        group.size >= self.assume_airplane_size
    }

    pub fn looks_like_a_line(&self, group: &OutlierGroup) -> bool {
        group.features[Feature::MaxHoughTransformCount] >= self.looks_like_a_line_score
    }

    pub fn decide(&self, group: &OutlierGroup) -> PaintDecision {
        if self.is_assumed(group) {
            return PaintDecision::new(PaintReason::Assumed, None);
        }
        let score = self.classifier.score(&group.features);
        let reason = if score > 0.0 {
            if self.looks_like_a_line(group) {
                PaintReason::LooksLikeALine
            } else {
                PaintReason::GoodScore
            }
        } else {
            PaintReason::BadScore
        };
        PaintDecision::new(reason, Some(score))
    }
}

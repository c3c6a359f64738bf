// THEORY:
// The feature extractor condenses an outlier group into a fixed-order vector
// of numbers, which is the only thing the classifier ever looks at. The order is
// part of the contract with every trained forest, so it is fixed by the
// `Feature` enum's discriminants and never negotiated at runtime.
//
// Key architectural principles:
// 1.  **Four families**: geometric (extent and shape of the group), photometric
//     (how much brighter its pixels are), line-derived (how well one Hough
//     line explains it) and context (what surrounds it in this frame and its
//     neighbors).
// 2.  **Resolution independence**: Anything measured in pixels is divided by the
//     image dimensions, so a forest trained on one camera transfers to another.
// 3.  **Staged filling**: Intra-frame features are computed by the worker that
//     built the group. The same-frame context is filled once all groups of the
//     frame exist. The cross-frame context is filled by the final-processing
//     window, the only place that sees neighboring frames.

use crate::core_modules::hough::Line;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Index, IndexMut};

pub const FEATURE_COUNT: usize = 27;

/// How many of the strongest Hough lines the "first 10" features look at.
pub const LEADING_LINE_COUNT: usize = 10;

/// Members within this distance of the best line count toward its length.
const LINE_LENGTH_MAX_DISTANCE: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Feature {
    Size,
    Width,
    Height,
    CenterX,
    CenterY,
    MinX,
    MinY,
    MaxX,
    MaxY,
    Hypotenuse,
    AspectRatio,
    FillAmount,
    SurfaceAreaRatio,
    PixelBorderAmount,
    AverageBrightness,
    MedianBrightness,
    MaxBrightness,
    MaxHoughTransformCount,
    MaxHoughTheta,
    AvgCountOfFirst10HoughLines,
    MaxThetaDiffOfFirst10HoughLines,
    MaxRhoDiffOfFirst10HoughLines,
    LineLength,
    AverageLineVariance,
    NumberOfNearbyOutliersInSameFrame,
    MaxOverlap,
    BoundingBoxOverlapScore,
}

impl Feature {
    pub const ALL: [Feature; FEATURE_COUNT] = [
        Feature::Size,
        Feature::Width,
        Feature::Height,
        Feature::CenterX,
        Feature::CenterY,
        Feature::MinX,
        Feature::MinY,
        Feature::MaxX,
        Feature::MaxY,
        Feature::Hypotenuse,
        Feature::AspectRatio,
        Feature::FillAmount,
        Feature::SurfaceAreaRatio,
        Feature::PixelBorderAmount,
        Feature::AverageBrightness,
        Feature::MedianBrightness,
        Feature::MaxBrightness,
        Feature::MaxHoughTransformCount,
        Feature::MaxHoughTheta,
        Feature::AvgCountOfFirst10HoughLines,
        Feature::MaxThetaDiffOfFirst10HoughLines,
        Feature::MaxRhoDiffOfFirst10HoughLines,
        Feature::LineLength,
        Feature::AverageLineVariance,
        Feature::NumberOfNearbyOutliersInSameFrame,
        Feature::MaxOverlap,
        Feature::BoundingBoxOverlapScore,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// The name used in CSV headers and serialized forests.
    pub fn name(self) -> &'static str {
        match self {
            Feature::Size => "size",
            Feature::Width => "width",
            Feature::Height => "height",
            Feature::CenterX => "centerX",
            Feature::CenterY => "centerY",
            Feature::MinX => "minX",
            Feature::MinY => "minY",
            Feature::MaxX => "maxX",
            Feature::MaxY => "maxY",
            Feature::Hypotenuse => "hypotenuse",
            Feature::AspectRatio => "aspectRatio",
            Feature::FillAmount => "fillAmount",
            Feature::SurfaceAreaRatio => "surfaceAreaRatio",
            Feature::PixelBorderAmount => "pixelBorderAmount",
            Feature::AverageBrightness => "averageBrightness",
            Feature::MedianBrightness => "medianBrightness",
            Feature::MaxBrightness => "maxBrightness",
            Feature::MaxHoughTransformCount => "maxHoughTransformCount",
            Feature::MaxHoughTheta => "maxHoughTheta",
            Feature::AvgCountOfFirst10HoughLines => "avgCountOfFirst10HoughLines",
            Feature::MaxThetaDiffOfFirst10HoughLines => "maxThetaDiffOfFirst10HoughLines",
            Feature::MaxRhoDiffOfFirst10HoughLines => "maxRhoDiffOfFirst10HoughLines",
            Feature::LineLength => "lineLength",
            Feature::AverageLineVariance => "averageLineVariance",
            Feature::NumberOfNearbyOutliersInSameFrame => "numberOfNearbyOutliersInSameFrame",
            Feature::MaxOverlap => "maxOverlap",
            Feature::BoundingBoxOverlapScore => "boundingBoxOverlapScore",
        }
    }

    pub fn from_name(name: &str) -> Option<Feature> {
        Feature::ALL.into_iter().find(|feature| feature.name() == name)
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One value per [`Feature`], indexed by the feature itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector(pub [f64; FEATURE_COUNT]);

impl Default for FeatureVector {
    fn default() -> Self {
        FeatureVector([0.0; FEATURE_COUNT])
    }
}

impl Index<Feature> for FeatureVector {
    type Output = f64;

    fn index(&self, feature: Feature) -> &f64 {
        &self.0[feature.index()]
    }
}

impl IndexMut<Feature> for FeatureVector {
    fn index_mut(&mut self, feature: Feature) -> &mut f64 {
        &mut self.0[feature.index()]
    }
}

impl FeatureVector {
    pub fn values(&self) -> &[f64; FEATURE_COUNT] {
        &self.0
    }
}

/// Summary of how the strongest lines relate to each other.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LineSummary {
    pub max_count_ratio: f64,
    pub max_theta: f64,
    pub avg_count_ratio: f64,
    pub max_theta_diff: f64,
    pub max_rho_diff: f64,
}

/// Leading-line statistics, counts expressed as a fraction of `total`, the
/// vote weight every member cast together.
pub fn summarize_lines(lines: &[Line], total: u64) -> LineSummary {
    let Some(first) = lines.first() else {
        return LineSummary::default();
    };
    let total = total.max(1) as f64;
    let leading = &lines[..lines.len().min(LEADING_LINE_COUNT)];

    let avg_count_ratio =
        leading.iter().map(|line| line.count as f64 / total).sum::<f64>() / leading.len() as f64;
    let max_theta_diff = leading
        .iter()
        .map(|line| (line.theta - first.theta).abs())
        .fold(0.0, f64::max);
    let max_rho_diff = leading
        .iter()
        .map(|line| (line.rho - first.rho).abs())
        .fold(0.0, f64::max);

    LineSummary {
        max_count_ratio: first.count as f64 / total,
        max_theta: first.theta,
        avg_count_ratio,
        max_theta_diff,
        max_rho_diff,
    }
}

/// Fit of a set of points against one line.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LineFit {
    /// Extent along the line of the points close to it, in pixels.
    pub length: f64,
    /// Mean squared perpendicular distance of all points to the line.
    pub variance: f64,
}

/// Measures how tightly `points` hug `line`. Coordinates share the line's origin.
pub fn line_fit(line: &Line, points: impl Iterator<Item = (f64, f64)>) -> LineFit {
    let (sin, cos) = line.theta.to_radians().sin_cos();
    let mut count = 0usize;
    let mut squared = 0.0;
    let mut along_min = f64::MAX;
    let mut along_max = f64::MIN;

    for (x, y) in points {
        let distance = x * cos + y * sin - line.rho;
        squared += distance * distance;
        count += 1;
        if distance.abs() <= LINE_LENGTH_MAX_DISTANCE {
            let along = -x * sin + y * cos;
            along_min = along_min.min(along);
            along_max = along_max.max(along);
        }
    }

    if count == 0 {
        return LineFit::default();
    }
    let length = if along_max >= along_min {
        along_max - along_min + 1.0
    } else {
        0.0
    };
    LineFit {
        length,
        variance: squared / count as f64,
    }
}

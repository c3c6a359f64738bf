// THEORY:
// An `OutlierGroup` is a single, spatially coherent candidate streak within one
// frame: every outlier pixel that shares a tag after grouping. It is the unit
// the rest of the engine reasons about. Features are computed per group, the
// classifier scores a group, and the paint decision is made per group.
//
// Key architectural principles:
// 1.  **Local mask**: A group keeps a bounding-box-sized grid of the real member
//     amounts (zero where it has no member). The Hough transform, the shape
//     features and the pixel overlap against other frames all work on this
//     compact grid instead of the full frame.
// 2.  **Padding kept apart**: Padding pixels belong to the group for repainting
//     and count toward its size, but carry no brightness and cast no Hough
//     votes.
// 3.  **Decision set once**: The paint decision is committed exactly once, when
//     the frame is finalized. A second commit is an internal error.

use crate::core_modules::bounding_box::{BoundingBox, Point};
use crate::core_modules::features::{self, Feature, FeatureVector};
use crate::core_modules::group_tagger::GroupSizes;
use crate::core_modules::hough::{self, Line};
use crate::core_modules::outlier_detector::{OutlierMap, Tag};
use crate::core_modules::paint_policy::PaintDecision;
use crate::error::{InternalError, Result};
use std::collections::BTreeMap;

/// Groups whose centers lie closer than this fraction of the image width count as nearby.
pub const NEARBY_GROUP_DISTANCE_FRACTION: f64 = 800.0 / 7000.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BrightnessStats {
    pub average: f64,
    pub median: f64,
    pub max: f64,
}

#[derive(Debug, Clone)]
pub struct OutlierGroup {
    pub tag: Tag,
    pub frame_index: usize,
    /// Every member, padding included.
    pub size: usize,
    pub bounds: BoundingBox,
    /// Bounding-box-local amounts of the real members, row major, zero elsewhere.
    pub mask: Vec<u32>,
    /// Padding members in frame coordinates.
    pub padding: Vec<Point>,
    pub brightness: BrightnessStats,
    /// Ranked Hough lines in bounding-box-local coordinates. Empty until analyzed.
    pub lines: Vec<Line>,
    pub features: FeatureVector,
    decision: Option<PaintDecision>,
}

#[derive(Debug)]
struct GroupBuilder {
    bounds: BoundingBox,
    members: Vec<(u32, u32, u32)>,
    padding: Vec<Point>,
}

/// Collects every group larger than `min_group_size` from a tagged map.
pub fn collect_groups(
    map: &OutlierMap,
    sizes: &GroupSizes,
    frame_index: usize,
    min_group_size: usize,
) -> Vec<OutlierGroup> {
    let mut builders: BTreeMap<Tag, GroupBuilder> = BTreeMap::new();
    for (_, pixel) in map.iter() {
        let Some(tag) = pixel.tag else { continue };
        if sizes.get(&tag).is_none_or(|&size| size <= min_group_size) {
            continue;
        }
        let builder = builders.entry(tag).or_insert_with(|| GroupBuilder {
            bounds: BoundingBox::around(pixel.x, pixel.y),
            members: Vec::new(),
            padding: Vec::new(),
        });
        builder.bounds.include(pixel.x, pixel.y);
        if pixel.is_padding() {
            builder.padding.push(Point {
                x: pixel.x,
                y: pixel.y,
            });
        } else {
            builder
                .members
                .push((pixel.x, pixel.y, pixel.amount.max(1) as u32));
        }
    }

    builders
        .into_iter()
        .map(|(tag, builder)| OutlierGroup::from_builder(tag, frame_index, builder))
        .collect()
}

impl OutlierGroup {
    fn from_builder(tag: Tag, frame_index: usize, builder: GroupBuilder) -> Self {
        let bounds = builder.bounds;
        let width = bounds.width() as usize;
        let mut mask = vec![0u32; width * bounds.height() as usize];
        let mut amounts = Vec::with_capacity(builder.members.len());
        for (x, y, amount) in &builder.members {
            let local = (y - bounds.min.y) as usize * width + (x - bounds.min.x) as usize;
            mask[local] = *amount;
            amounts.push(*amount);
        }

        Self {
            tag,
            frame_index,
            size: builder.members.len() + builder.padding.len(),
            bounds,
            mask,
            padding: builder.padding,
            brightness: brightness_stats(&mut amounts),
            lines: Vec::new(),
            features: FeatureVector::default(),
            decision: None,
        }
    }

    /// `"x,y"` of the seed pixel, unique within a frame.
    pub fn name(&self) -> String {
        self.tag.to_string()
    }

    pub fn real_size(&self) -> usize {
        self.mask.iter().filter(|&&amount| amount != 0).count()
    }

    /// Whether the frame pixel at `(x, y)` is a real member.
    pub fn is_member(&self, x: u32, y: u32) -> bool {
        if !self.bounds.contains(x, y) {
            return false;
        }
        self.mask[self.local_index(x, y)] != 0
    }

    fn local_index(&self, x: u32, y: u32) -> usize {
        (y - self.bounds.min.y) as usize * self.bounds.width() as usize
            + (x - self.bounds.min.x) as usize
    }

    /// Every real member in frame coordinates with its amount.
    pub fn members(&self) -> impl Iterator<Item = (u32, u32, u32)> + '_ {
        let width = self.bounds.width();
        self.mask
            .iter()
            .enumerate()
            .filter(|(_, amount)| **amount != 0)
            .map(move |(i, amount)| {
                let i = i as u32;
                (
                    self.bounds.min.x + i % width,
                    self.bounds.min.y + i / width,
                    *amount,
                )
            })
    }

    /// Runs the Hough transform over the local mask, each member voting with
    /// its amount.
    pub fn analyze_lines(&mut self, max_lines: usize) {
        self.lines = hough::lines_of(
            &self.mask,
            self.bounds.width() as usize,
            self.bounds.height() as usize,
            0,
            true,
            Some(max_lines),
        );
    }

    /// Sum of the member amounts, the most a weighted Hough line can collect.
    pub fn total_amount(&self) -> u64 {
        self.mask.iter().map(|&amount| amount as u64).sum()
    }

    pub fn first_line(&self) -> Option<&Line> {
        self.lines.first()
    }

    /// The best line moved into frame coordinates, so lines of different
    /// groups can be compared with each other.
    pub fn frame_line(&self) -> Option<Line> {
        let line = self.lines.first()?;
        let (sin, cos) = line.theta.to_radians().sin_cos();
        let rho = line.rho + self.bounds.min.x as f64 * cos + self.bounds.min.y as f64 * sin;
        Some(if rho < 0.0 {
            Line {
                theta: (line.theta + 180.0) % 360.0,
                rho: -rho,
                count: line.count,
            }
        } else {
            Line { rho, ..*line }
        })
    }

    /// Fills the geometric, photometric and line-derived features.
    pub fn compute_intra_features(&mut self, image_width: u32, image_height: u32) {
        let image_width = image_width.max(1) as f64;
        let image_height = image_height.max(1) as f64;
        let image_diagonal = (image_width * image_width + image_height * image_height).sqrt();
        let bounds = self.bounds;
        let (center_x, center_y) = bounds.center();
        let size = self.size as f64;

        let f = &mut self.features;
        f[Feature::Size] = size / (image_width * image_height);
        f[Feature::Width] = bounds.width() as f64 / image_width;
        f[Feature::Height] = bounds.height() as f64 / image_height;
        f[Feature::CenterX] = center_x / image_width;
        f[Feature::CenterY] = center_y / image_height;
        f[Feature::MinX] = bounds.min.x as f64 / image_width;
        f[Feature::MinY] = bounds.min.y as f64 / image_height;
        f[Feature::MaxX] = bounds.max.x as f64 / image_width;
        f[Feature::MaxY] = bounds.max.y as f64 / image_height;
        f[Feature::Hypotenuse] = bounds.hypotenuse() / image_diagonal;
        f[Feature::AspectRatio] = bounds.width() as f64 / bounds.height() as f64;
        f[Feature::FillAmount] = size / bounds.area() as f64;
        f[Feature::AverageBrightness] = self.brightness.average;
        f[Feature::MedianBrightness] = self.brightness.median;
        f[Feature::MaxBrightness] = self.brightness.max;

        let (surface, border) = self.shape_ratios();
        self.features[Feature::SurfaceAreaRatio] = surface;
        self.features[Feature::PixelBorderAmount] = border;

        let summary = features::summarize_lines(&self.lines, self.total_amount());
        let fit = match self.lines.first() {
            Some(line) => {
                let min = bounds.min;
                features::line_fit(
                    line,
                    self.members()
                        .map(|(x, y, _)| ((x - min.x) as f64, (y - min.y) as f64)),
                )
            }
            None => features::LineFit::default(),
        };

        let f = &mut self.features;
        f[Feature::MaxHoughTransformCount] = summary.max_count_ratio;
        f[Feature::MaxHoughTheta] = summary.max_theta;
        f[Feature::AvgCountOfFirst10HoughLines] = summary.avg_count_ratio;
        f[Feature::MaxThetaDiffOfFirst10HoughLines] = summary.max_theta_diff;
        f[Feature::MaxRhoDiffOfFirst10HoughLines] = summary.max_rho_diff;
        f[Feature::LineLength] = fit.length / bounds.hypotenuse();
        f[Feature::AverageLineVariance] = fit.variance;
    }

    /// Fraction of real members on the group's edge, and the mean number of
    /// 8-connected member neighbors per member.
    fn shape_ratios(&self) -> (f64, f64) {
        let width = self.bounds.width() as i64;
        let height = self.bounds.height() as i64;
        let occupied = |x: i64, y: i64| {
            x >= 0 && y >= 0 && x < width && y < height && self.mask[(y * width + x) as usize] != 0
        };

        let mut members = 0usize;
        let mut on_edge = 0usize;
        let mut neighbor_total = 0usize;
        for y in 0..height {
            for x in 0..width {
                if !occupied(x, y) {
                    continue;
                }
                members += 1;
                if !(occupied(x - 1, y) && occupied(x + 1, y) && occupied(x, y - 1) && occupied(x, y + 1)) {
                    on_edge += 1;
                }
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        if (dx != 0 || dy != 0) && occupied(x + dx, y + dy) {
                            neighbor_total += 1;
                        }
                    }
                }
            }
        }
        if members == 0 {
            return (0.0, 0.0);
        }
        (
            on_edge as f64 / members as f64,
            neighbor_total as f64 / members as f64,
        )
    }

    /// Real pixels shared with `other`, relative to the average group size.
    pub fn pixel_overlap(&self, other: &OutlierGroup) -> f64 {
        let Some(shared) = self.bounds.overlap(&other.bounds) else {
            return 0.0;
        };
        let mut overlapping = 0usize;
        for y in shared.min.y..=shared.max.y {
            for x in shared.min.x..=shared.max.x {
                if self.is_member(x, y) && other.is_member(x, y) {
                    overlapping += 1;
                }
            }
        }
        if overlapping == 0 {
            return 0.0;
        }
        let average = (self.size + other.size) as f64 / 2.0;
        overlapping as f64 / average
    }

    pub fn max_nearby_distance(image_width: u32) -> f64 {
        image_width as f64 * NEARBY_GROUP_DISTANCE_FRACTION
    }

    pub fn is_near(&self, other: &OutlierGroup, image_width: u32) -> bool {
        self.bounds.center_distance(&other.bounds) < Self::max_nearby_distance(image_width)
    }

    pub fn decision(&self) -> Option<&PaintDecision> {
        self.decision.as_ref()
    }

    /// Commits the final paint decision. Fails if one was already committed.
    pub fn commit_decision(&mut self, decision: PaintDecision) -> Result<()> {
        if self.decision.is_some() {
            return Err(InternalError::DecisionCommittedTwice {
                frame: self.frame_index,
                group: self.name(),
            }
            .into());
        }
        self.decision = Some(decision);
        Ok(())
    }
}

/// Counts, for every group, the other groups of the same frame that are nearby.
pub fn fill_same_frame_context(groups: &mut [OutlierGroup], image_width: u32) {
    let counts: Vec<f64> = groups
        .iter()
        .enumerate()
        .map(|(i, group)| {
            groups
                .iter()
                .enumerate()
                .filter(|(j, other)| *j != i && group.is_near(other, image_width))
                .count() as f64
        })
        .collect();
    for (group, count) in groups.iter_mut().zip(counts) {
        group.features[Feature::NumberOfNearbyOutliersInSameFrame] = count;
    }
}

/// Fills the cross-frame features of `group` against the groups of its
/// neighboring frames.
pub fn fill_cross_frame_context<'a>(
    group: &mut OutlierGroup,
    neighbors: impl Iterator<Item = &'a OutlierGroup>,
    image_width: u32,
) {
    let mut max_overlap = 0.0f64;
    let mut max_box_overlap = 0.0f64;
    for other in neighbors {
        if !group.is_near(other, image_width) {
            continue;
        }
        max_overlap = max_overlap.max(group.pixel_overlap(other));
        max_box_overlap = max_box_overlap.max(group.bounds.overlap_amount(&other.bounds));
    }
    group.features[Feature::MaxOverlap] = max_overlap;
    group.features[Feature::BoundingBoxOverlapScore] = max_box_overlap;
}

fn brightness_stats(amounts: &mut [u32]) -> BrightnessStats {
    if amounts.is_empty() {
        return BrightnessStats::default();
    }
    amounts.sort_unstable();
    let total: u64 = amounts.iter().map(|&a| a as u64).sum();
    BrightnessStats {
        average: total as f64 / amounts.len() as f64,
        median: amounts[amounts.len() / 2] as f64,
        max: amounts[amounts.len() - 1] as f64,
    }
}

// THEORY:
// Reconciliation revisits provisional paint decisions with the benefit of the
// neighboring frames. Two passes run for each window position.
//
// Key architectural principles:
// 1.  **Streaks win**: An airplane crosses the sky as a chain of similar line
//     segments, one per frame, each a little further along the same line. When
//     such a chain spans at least three frames, every member is painted,
//     whatever the classifier thought of it alone.
// 2.  **Stationary objects lose**: A group that reappears in the next frame at
//     the same place, with the same size and orientation, is a star, a light
//     or a cloud edge. Both copies are kept out of the paint set.
// 3.  **Frame coordinates**: Hough lines are stored relative to each group's
//     bounding box. Every comparison between groups first moves both lines into
//     frame coordinates, otherwise equal lines at different places would
//     compare as different.

use crate::core_modules::bounding_box::BoundingBox;
use crate::core_modules::features::Feature;
use crate::core_modules::frame::ProcessedFrame;
use crate::core_modules::hough::Line;
use crate::core_modules::outlier_detector::Tag;
use crate::core_modules::outlier_group::OutlierGroup;
use crate::core_modules::paint_policy::PaintReason;
use std::collections::BTreeMap;
use tracing::debug;

/// Shortest chain of groups that counts as a streak.
pub const MIN_STREAK_LENGTH: usize = 3;

/// Largest change of direction, in degrees, between consecutive streak steps.
const MAX_STREAK_BEND: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileParams {
    pub theta_diff: f64,
    pub rho_diff: f64,
    pub center_line_theta_diff: f64,
    pub center_distance: f64,
    pub size_ratio: f64,
    pub overlap_amount: f64,
    pub pixel_overlap_amount: f64,
    pub looks_like_a_line_score: f64,
}

/// Difference of two line normals, in degrees, ignoring direction.
pub fn angle_difference(a: f64, b: f64) -> f64 {
    let diff = (a - b).rem_euclid(180.0);
    diff.min(180.0 - diff)
}

/// Hough normal of the line joining both box centers.
pub fn center_line_theta(from: &BoundingBox, to: &BoundingBox) -> f64 {
    (from.center_theta(to) + 90.0).rem_euclid(180.0)
}

/// Whether two frame-coordinate lines describe roughly the same line.
fn similar_lines(a: &Line, b: &Line, params: &ReconcileParams) -> bool {
    if angle_difference(a.theta, b.theta) >= params.theta_diff {
        return false;
    }
    // opposite normals put equal lines on opposite sides of the origin
    let opposite = (a.theta - b.theta).rem_euclid(360.0);
    let rho_diff = if (opposite - 180.0).abs() < 90.0 {
        a.rho + b.rho
    } else {
        (a.rho - b.rho).abs()
    };
    rho_diff < params.rho_diff
}

fn continues_streak(last: &OutlierGroup, other: &OutlierGroup, params: &ReconcileParams) -> bool {
    let (Some(last_line), Some(other_line)) = (last.frame_line(), other.frame_line()) else {
        return false;
    };
    if !similar_lines(&last_line, &other_line, params) {
        return false;
    }
    let direction = center_line_theta(&last.bounds, &other.bounds);
    angle_difference(direction, last_line.theta) < params.center_line_theta_diff
        || angle_difference(direction, other_line.theta) < params.center_line_theta_diff
}

/// Rejects a step that moves back toward the earlier members or bends too sharply.
fn bends_away(candidate: &OutlierGroup, streak: &[(usize, &OutlierGroup)]) -> bool {
    let [.., (_, two_back), (_, one_back)] = streak else {
        return false;
    };
    let one_back_distance = candidate.bounds.center_distance(&one_back.bounds);
    let two_back_distance = candidate.bounds.center_distance(&two_back.bounds);
    if two_back_distance < one_back_distance {
        return true;
    }
    let one_back_theta = center_line_theta(&candidate.bounds, &one_back.bounds);
    let two_back_theta = center_line_theta(&candidate.bounds, &two_back.bounds);
    angle_difference(one_back_theta, two_back_theta) > MAX_STREAK_BEND
}

fn streak_from<'a>(
    frames: &'a BTreeMap<usize, ProcessedFrame>,
    start: usize,
    group: &'a OutlierGroup,
    radius: usize,
    params: &ReconcileParams,
) -> Vec<(usize, Tag)> {
    let mut streak: Vec<(usize, &OutlierGroup)> = vec![(start, group)];
    let mut last = group;

    for index in start + 1..=start + radius {
        let Some(frame) = frames.get(&index) else { break };
        let mut best: Option<&OutlierGroup> = None;
        let mut best_distance = last.bounds.hypotenuse() * 2.0;

        for other in frame.groups.iter().filter(|other| is_painted(frame, other)) {
            let distance = last.bounds.center_distance(&other.bounds);
            if distance < best_distance && continues_streak(last, other, params) {
                best = Some(other);
                best_distance = distance;
            }
        }

        let Some(best) = best else { break };
        if bends_away(best, &streak) {
            break;
        }
        streak.push((index, best));
        last = best;
    }
    streak
        .into_iter()
        .map(|(index, group)| (index, group.tag))
        .collect()
}

fn is_painted(frame: &ProcessedFrame, group: &OutlierGroup) -> bool {
    frame
        .decision(&group.tag)
        .is_some_and(|decision| decision.will_paint())
}

/// Looks for streaks beginning in frame `start` and reaching up to `radius`
/// frames ahead. Only painted groups take part, so a group already matched as
/// `AdjacentOverlap` never joins a streak. Returns the number of groups
/// promoted to `InStreak`.
pub fn streak_pass(
    frames: &mut BTreeMap<usize, ProcessedFrame>,
    start: usize,
    radius: usize,
    params: &ReconcileParams,
) -> usize {
    let Some(first) = frames.get(&start) else {
        return 0;
    };
    let streaks: Vec<Vec<(usize, Tag)>> = first
        .groups
        .iter()
        .filter(|group| is_painted(first, group))
        .map(|group| streak_from(frames, start, group, radius, params))
        .filter(|streak| streak.len() >= MIN_STREAK_LENGTH)
        .collect();

    let mut promoted = 0;
    for streak in streaks {
        debug!(frame = start, members = streak.len(), "found streak");
        for (index, tag) in streak {
            if let Some(frame) = frames.get_mut(&index) {
                frame.promote(tag, PaintReason::InStreak);
                promoted += 1;
            }
        }
    }
    promoted
}

/// Groups that reconciliation has already explained as a line never match as stationary.
fn may_overlap(frame: &ProcessedFrame, group: &OutlierGroup, params: &ReconcileParams) -> bool {
    group.features[Feature::MaxHoughTransformCount] <= params.looks_like_a_line_score
        && !matches!(
            frame.reason(&group.tag),
            Some(PaintReason::LooksLikeALine | PaintReason::InStreak)
        )
}

fn size_ratio(a: &OutlierGroup, b: &OutlierGroup) -> f64 {
    let (small, large) = if a.size < b.size {
        (a.size, b.size)
    } else {
        (b.size, a.size)
    };
    large as f64 / small.max(1) as f64
}

/// Marks groups of two consecutive frames that are the same stationary
/// object. Returns the number of matched pairs.
pub fn overlap_pass(
    earlier: &mut ProcessedFrame,
    later: &mut ProcessedFrame,
    params: &ReconcileParams,
) -> usize {
    let mut pairs = Vec::new();
    for group in &earlier.groups {
        if !may_overlap(earlier, group, params) {
            continue;
        }
        let Some(line) = group.frame_line() else { continue };

        for other in &later.groups {
            if !may_overlap(later, other, params) {
                continue;
            }
            if size_ratio(group, other) > params.size_ratio {
                continue;
            }
            if group.bounds.center_distance(&other.bounds) > params.center_distance {
                continue;
            }
            let Some(other_line) = other.frame_line() else { continue };
            if !similar_lines(&line, &other_line, params) {
                continue;
            }
            if group.bounds.overlap_amount(&other.bounds) > params.overlap_amount
                || group.pixel_overlap(other) > params.pixel_overlap_amount
            {
                pairs.push((group.tag, other.tag));
            }
        }
    }

    for (tag, other_tag) in &pairs {
        earlier.promote(*tag, PaintReason::AdjacentOverlap);
        later.promote(*other_tag, PaintReason::AdjacentOverlap);
    }
    if !pairs.is_empty() {
        debug!(
            frame = later.index,
            pairs = pairs.len(),
            "groups overlap the previous frame"
        );
    }
    pairs.len()
}

// Built-in forests. Thresholds are in normalized feature units.

use super::decision_tree::{DecisionForest, DecisionTree, Node};
use crate::core_modules::features::Feature;

pub const DEFAULT_FOREST: &str = "default";
pub const LINE_FOREST: &str = "line";

/// Line shape first, then whether the group persists in the adjacent frames,
/// then brightness and crowding.
pub fn default_forest() -> DecisionForest {
    DecisionForest::new(DEFAULT_FOREST)
        .with_tree(1.0, line_shape_tree())
        .with_tree(
            0.75,
            DecisionTree::new(
                "persistence",
                Node::branch(
                    Feature::MaxOverlap,
                    0.3,
                    Node::stump(Feature::BoundingBoxOverlapScore, 0.5, 0.5, -0.5),
                    Node::Leaf(-1.0),
                ),
            ),
        )
        .with_tree(
            0.5,
            DecisionTree::new(
                "brightness",
                Node::branch(
                    Feature::NumberOfNearbyOutliersInSameFrame,
                    5.0,
                    Node::stump(Feature::MaxBrightness, 4000.0, -0.5, 0.75),
                    Node::Leaf(-1.0),
                ),
            ),
        )
}

/// Only asks whether the group is well explained by one line.
pub fn line_forest() -> DecisionForest {
    DecisionForest::new(LINE_FOREST).with_tree(1.0, line_shape_tree())
}

fn line_shape_tree() -> DecisionTree {
    DecisionTree::new(
        "line_shape",
        Node::branch(
            Feature::MaxHoughTransformCount,
            0.45,
            Node::stump(Feature::LineLength, 0.8, -1.0, 0.5),
            Node::stump(Feature::AverageLineVariance, 1.5, 1.0, -0.25),
        ),
    )
}

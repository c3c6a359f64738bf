// THEORY:
// A decision tree here is data, not code. Each node is an enum variant: a leaf
// holding a score, a stump that answers directly on either side of one split,
// or a branch that recurses. Trees are grouped into weighted forests whose
// score is the weighted mean of their members.
//
// Key architectural principles:
// 1.  **Split convention**: A node sends a value to its greater-or-equal side
//     when `value >= threshold`, otherwise to its less-than side. Ties always go
//     to the greater-or-equal side.
// 2.  **Named features on disk**: Serialized forests refer to features by name
//     so a file stays readable and survives a reordering of the feature enum.
//     Names are resolved once on load. An unknown name rejects the whole file.
// 3.  **Score sign**: Leaves hold values in `[-1, 1]` by convention. A positive
//     forest score means "paint".

use crate::core_modules::classifier::Classifier;
use crate::core_modules::features::{Feature, FeatureVector};
use crate::error::{EraserError, InternalError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf(f64),
    Stump {
        feature: Feature,
        threshold: f64,
        less: f64,
        greater_or_equal: f64,
    },
    Branch {
        feature: Feature,
        threshold: f64,
        less: Box<Node>,
        greater_or_equal: Box<Node>,
    },
}

impl Node {
    pub fn branch(feature: Feature, threshold: f64, less: Node, greater_or_equal: Node) -> Self {
        Node::Branch {
            feature,
            threshold,
            less: Box::new(less),
            greater_or_equal: Box::new(greater_or_equal),
        }
    }

    pub fn stump(feature: Feature, threshold: f64, less: f64, greater_or_equal: f64) -> Self {
        Node::Stump {
            feature,
            threshold,
            less,
            greater_or_equal,
        }
    }

    pub fn evaluate(&self, features: &FeatureVector) -> f64 {
        let mut node = self;
        loop {
            match node {
                Node::Leaf(score) => return *score,
                Node::Stump {
                    feature,
                    threshold,
                    less,
                    greater_or_equal,
                } => {
                    return if features[*feature] >= *threshold {
                        *greater_or_equal
                    } else {
                        *less
                    };
                }
                Node::Branch {
                    feature,
                    threshold,
                    less,
                    greater_or_equal,
                } => {
                    node = if features[*feature] >= *threshold {
                        &**greater_or_equal
                    } else {
                        &**less
                    };
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            Node::Leaf(_) | Node::Stump { .. } => 1,
            Node::Branch {
                less,
                greater_or_equal,
                ..
            } => 1 + less.depth().max(greater_or_equal.depth()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionTree {
    pub name: String,
    pub root: Node,
}

impl DecisionTree {
    pub fn new(name: impl Into<String>, root: Node) -> Self {
        Self {
            name: name.into(),
            root,
        }
    }
}

impl Classifier for DecisionTree {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self, features: &FeatureVector) -> f64 {
        self.root.evaluate(features)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightedTree {
    pub weight: f64,
    pub tree: DecisionTree,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionForest {
    pub name: String,
    pub trees: Vec<WeightedTree>,
}

impl DecisionForest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            trees: Vec::new(),
        }
    }

    pub fn with_tree(mut self, weight: f64, tree: DecisionTree) -> Self {
        self.trees.push(WeightedTree { weight, tree });
        self
    }

    pub fn total_weight(&self) -> f64 {
        self.trees.iter().map(|member| member.weight).sum()
    }

    /// Parses a forest file. Feature names are resolved here.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: ForestFile = serde_json::from_str(json)
            .map_err(|err| EraserError::Config(format!("malformed forest: {err}")))?;
        let trees = file
            .trees
            .into_iter()
            .map(|tree| {
                Ok(WeightedTree {
                    weight: tree.weight,
                    tree: DecisionTree::new(tree.name, Node::try_from(tree.root)?),
                })
            })
            .collect::<std::result::Result<Vec<_>, InternalError>>()?;
        Ok(Self {
            name: file.name,
            trees,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        let file = ForestFile {
            name: self.name.clone(),
            trees: self
                .trees
                .iter()
                .map(|member| TreeFile {
                    name: member.tree.name.clone(),
                    weight: member.weight,
                    root: NodeFile::from(&member.tree.root),
                })
                .collect(),
        };
        serde_json::to_string_pretty(&file)
            .map_err(|err| EraserError::Config(format!("cannot serialize forest: {err}")))
    }
}

impl Classifier for DecisionForest {
    fn name(&self) -> &str {
        &self.name
    }

    /// Weighted mean of the member scores. Zero for an empty or weightless forest.
    fn score(&self, features: &FeatureVector) -> f64 {
        let total_weight = self.total_weight();
        if total_weight == 0.0 {
            return 0.0;
        }
        let total: f64 = self
            .trees
            .iter()
            .map(|member| member.weight * member.tree.root.evaluate(features))
            .sum();
        total / total_weight
    }
}

// --- On-disk form ---

#[derive(Debug, Serialize, Deserialize)]
struct ForestFile {
    name: String,
    trees: Vec<TreeFile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TreeFile {
    name: String,
    #[serde(default = "default_weight")]
    weight: f64,
    root: NodeFile,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum NodeFile {
    Leaf(f64),
    #[serde(rename_all = "camelCase")]
    Stump {
        feature: String,
        threshold: f64,
        less: f64,
        greater_or_equal: f64,
    },
    #[serde(rename_all = "camelCase")]
    Branch {
        feature: String,
        threshold: f64,
        less: Box<NodeFile>,
        greater_or_equal: Box<NodeFile>,
    },
}

fn resolve_feature(name: &str) -> std::result::Result<Feature, InternalError> {
    Feature::from_name(name).ok_or_else(|| InternalError::UnknownFeature(name.to_string()))
}

impl TryFrom<NodeFile> for Node {
    type Error = InternalError;

    fn try_from(node: NodeFile) -> std::result::Result<Self, Self::Error> {
        Ok(match node {
            NodeFile::Leaf(score) => Node::Leaf(score),
            NodeFile::Stump {
                feature,
                threshold,
                less,
                greater_or_equal,
            } => Node::stump(resolve_feature(&feature)?, threshold, less, greater_or_equal),
            NodeFile::Branch {
                feature,
                threshold,
                less,
                greater_or_equal,
            } => Node::branch(
                resolve_feature(&feature)?,
                threshold,
                Node::try_from(*less)?,
                Node::try_from(*greater_or_equal)?,
            ),
        })
    }
}

impl From<&Node> for NodeFile {
    fn from(node: &Node) -> Self {
        match node {
            Node::Leaf(score) => NodeFile::Leaf(*score),
            Node::Stump {
                feature,
                threshold,
                less,
                greater_or_equal,
            } => NodeFile::Stump {
                feature: feature.name().to_string(),
                threshold: *threshold,
                less: *less,
                greater_or_equal: *greater_or_equal,
            },
            Node::Branch {
                feature,
                threshold,
                less,
                greater_or_equal,
            } => NodeFile::Branch {
                feature: feature.name().to_string(),
                threshold: *threshold,
                less: Box::new(NodeFile::from(&**less)),
                greater_or_equal: Box::new(NodeFile::from(&**greater_or_equal)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn with(feature: Feature, value: f64) -> FeatureVector {
        let mut features = FeatureVector::default();
        features[feature] = value;
        features
    }

    #[test]
    fn ties_go_to_the_greater_or_equal_side() {
        let node = Node::branch(Feature::Size, 0.5, Node::Leaf(-1.0), Node::Leaf(1.0));
        assert_eq!(node.evaluate(&with(Feature::Size, 0.5)), 1.0);
        assert_eq!(node.evaluate(&with(Feature::Size, 0.499_999)), -1.0);
        assert_eq!(node.evaluate(&with(Feature::Size, 0.7)), 1.0);
    }

    #[test]
    fn stumps_answer_directly() {
        let node = Node::stump(Feature::FillAmount, 0.2, 0.25, -0.75);
        assert_eq!(node.evaluate(&with(Feature::FillAmount, 0.1)), 0.25);
        assert_eq!(node.evaluate(&with(Feature::FillAmount, 0.2)), -0.75);
        assert_eq!(node.depth(), 1);
    }

    #[test]
    fn nested_branches_follow_each_split() {
        let root = Node::branch(
            Feature::Width,
            0.1,
            Node::Leaf(-1.0),
            Node::branch(Feature::MaxHoughTransformCount, 0.4, Node::Leaf(-0.5), Node::Leaf(1.0)),
        );
        let mut features = with(Feature::Width, 0.2);
        assert_eq!(root.evaluate(&features), -0.5);
        features[Feature::MaxHoughTransformCount] = 0.6;
        assert_eq!(root.evaluate(&features), 1.0);
        assert_eq!(root.depth(), 3);
    }

    #[test]
    fn forest_score_is_the_weighted_mean() {
        let forest = DecisionForest::new("mixed")
            .with_tree(3.0, DecisionTree::new("yes", Node::Leaf(1.0)))
            .with_tree(1.0, DecisionTree::new("no", Node::Leaf(-1.0)));
        assert_relative_eq!(forest.score(&FeatureVector::default()), 0.5);
        assert_eq!(DecisionForest::new("empty").score(&FeatureVector::default()), 0.0);
    }

    #[test]
    fn forests_load_from_json_by_feature_name() {
        let json = r#"{
            "name": "tiny",
            "trees": [
                { "name": "a", "weight": 2.0,
                  "root": { "branch": { "feature": "size", "threshold": 0.01,
                                        "less": { "leaf": -1.0 },
                                        "greaterOrEqual": { "stump": { "feature": "fillAmount",
                                            "threshold": 0.5, "less": 1.0, "greaterOrEqual": -1.0 } } } } },
                { "name": "b", "root": { "leaf": 1.0 } }
            ]
        }"#;
        let forest = DecisionForest::from_json(json).unwrap();
        assert_eq!(forest.trees.len(), 2);
        assert_eq!(forest.trees[1].weight, 1.0);

        let mut features = with(Feature::Size, 0.02);
        features[Feature::FillAmount] = 0.1;
        assert_relative_eq!(forest.score(&features), 1.0);

        let again = DecisionForest::from_json(&forest.to_json().unwrap()).unwrap();
        assert_eq!(again, forest);
    }

    #[test]
    fn unknown_features_reject_the_file() {
        let json = r#"{ "name": "bad", "trees": [
            { "name": "t", "root": { "stump": { "feature": "sparkle", "threshold": 1.0,
                                                "less": 1.0, "greaterOrEqual": -1.0 } } } ] }"#;
        match DecisionForest::from_json(json) {
            Err(EraserError::Internal(InternalError::UnknownFeature(name))) => {
                assert_eq!(name, "sparkle")
            }
            other => panic!("expected an unknown feature error, got {other:?}"),
        }
    }
}

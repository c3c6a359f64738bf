// THEORY:
// The classifier turns a finished feature vector into a single score. Anything
// above zero is painted. The rest of the engine only ever sees the `Classifier`
// trait, so built-in forests, forests loaded from disk and test doubles are
// interchangeable.
//
// Key architectural principles:
// 1.  **Pure scoring**: `score` has no side effects and needs no context beyond
//     the vector. A classifier is shared across workers behind an `Arc`.
// 2.  **Selection by name**: The configuration names a classifier. The registry
//     first looks the name up among the built-in forests, then treats it as the
//     path of a forest file. Anything else fails before the first frame is read.

pub mod decision_tree;
pub mod forests;

use crate::core_modules::features::FeatureVector;
use crate::error::{EraserError, Result};
use decision_tree::DecisionForest;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub trait Classifier: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Positive means "paint".
    fn score(&self, features: &FeatureVector) -> f64;
}

#[derive(Debug, Default)]
pub struct ClassifierRegistry {
    classifiers: BTreeMap<String, Arc<dyn Classifier>>,
}

impl ClassifierRegistry {
    /// A registry holding every built-in forest.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(forests::default_forest()));
        registry.register(Arc::new(forests::line_forest()));
        registry
    }

    pub fn register(&mut self, classifier: Arc<dyn Classifier>) {
        self.classifiers
            .insert(classifier.name().to_string(), classifier);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.classifiers.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Classifier>> {
        self.classifiers.get(name).cloned()
    }

    /// Resolves a configured selection: a registered name or a forest file.
    pub fn resolve(&self, selection: &str) -> Result<Arc<dyn Classifier>> {
        if let Some(classifier) = self.get(selection) {
            return Ok(classifier);
        }
        let path = Path::new(selection);
        if !path.is_file() {
            let known: Vec<&str> = self.names().collect();
            return Err(EraserError::Config(format!(
                "unknown classifier `{selection}` (built in: {})",
                known.join(", ")
            )));
        }
        let forest = load_forest(path)?;
        info!(
            classifier = forest.name.as_str(),
            trees = forest.trees.len(),
            "loaded forest from {}",
            path.display()
        );
        Ok(Arc::new(forest))
    }
}

/// Reads a forest file. Every failure is reported as a configuration error.
pub fn load_forest(path: &Path) -> Result<DecisionForest> {
    let json = std::fs::read_to_string(path)
        .map_err(|err| EraserError::Config(format!("cannot read {}: {err}", path.display())))?;
    DecisionForest::from_json(&json).map_err(|err| match err {
        EraserError::Config(message) => {
            EraserError::Config(format!("{}: {message}", path.display()))
        }
        other => EraserError::Config(format!("{}: {other}", path.display())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use decision_tree::{DecisionTree, Node};
    use std::io::Write;

    #[test]
    fn builtin_forests_are_registered_by_name() {
        let registry = ClassifierRegistry::builtin();
        let names: Vec<&str> = registry.names().collect();
        assert_eq!(names, vec![forests::DEFAULT_FOREST, forests::LINE_FOREST]);
        let classifier = registry.resolve(forests::DEFAULT_FOREST).unwrap();
        assert_eq!(classifier.name(), forests::DEFAULT_FOREST);
    }

    #[test]
    fn unknown_names_are_configuration_errors() {
        let err = ClassifierRegistry::builtin()
            .resolve("no-such-forest")
            .unwrap_err();
        assert!(matches!(err, EraserError::Config(_)), "{err}");
    }

    #[test]
    fn forest_files_resolve_by_path() {
        let forest = DecisionForest::new("from-disk")
            .with_tree(1.0, DecisionTree::new("only", Node::Leaf(0.25)));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(forest.to_json().unwrap().as_bytes()).unwrap();

        let path = file.path().to_string_lossy().into_owned();
        let classifier = ClassifierRegistry::builtin().resolve(&path).unwrap();
        assert_eq!(classifier.name(), "from-disk");
        assert_eq!(classifier.score(&FeatureVector::default()), 0.25);
    }

    #[test]
    fn a_file_with_an_unknown_feature_is_a_configuration_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"name":"x","trees":[{{"name":"t","root":{{"stump":{{"feature":"glow","threshold":0,"less":1,"greaterOrEqual":1}}}}}}]}}"#
        )
        .unwrap();
        let err = load_forest(file.path()).unwrap_err();
        match err {
            EraserError::Config(message) => assert!(message.contains("glow"), "{message}"),
            other => panic!("expected a configuration error, got {other:?}"),
        }
    }
}

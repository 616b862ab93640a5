use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::annotator::Annotator;

/// An annotator shared between the studio and the run that currently owns it.
pub type SharedAnnotator = Arc<Mutex<dyn Annotator>>;

/// Thread-safe registry of annotators.
///
/// Annotators are wrapped in `Mutex` because `Annotator::annotate` takes
/// `&mut self`; a run holds the lock for its whole duration.
pub struct AnnotatorRegistry {
    annotators: HashMap<String, SharedAnnotator>,
    default_name: Option<String>,
}

impl AnnotatorRegistry {
    pub fn new() -> Self {
        Self {
            annotators: HashMap::new(),
            default_name: None,
        }
    }

    /// Register an annotator. The first registered annotator becomes the default.
    pub fn register<A: Annotator + 'static>(&mut self, annotator: A) {
        let name = annotator.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.annotators.insert(name, Arc::new(Mutex::new(annotator)));
    }

    /// Set default annotator by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.annotators.contains_key(name) {
            return Err(anyhow!("detector '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<SharedAnnotator> {
        self.annotators.get(name).cloned()
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    pub fn default_annotator(&self) -> Option<SharedAnnotator> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// Annotator for a run: the named one, or the default when `name` is `None`.
    pub fn select(&self, name: Option<&str>) -> Result<(String, SharedAnnotator)> {
        let name = match name {
            Some(name) => name,
            None => self
                .default_name()
                .ok_or_else(|| anyhow!("no detector registered"))?,
        };
        let annotator = self
            .get(name)
            .ok_or_else(|| anyhow!("detector '{}' not registered", name))?;
        Ok((name.to_string(), annotator))
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.annotators.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for AnnotatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{MotionAnnotator, PassthroughAnnotator};

    #[test]
    fn first_registered_is_default() {
        let mut registry = AnnotatorRegistry::new();
        registry.register(MotionAnnotator::new());
        registry.register(PassthroughAnnotator::new());
        assert_eq!(registry.default_name(), Some("motion"));

        registry.set_default("passthrough").unwrap();
        let (name, _) = registry.select(None).unwrap();
        assert_eq!(name, "passthrough");
    }

    #[test]
    fn selecting_unknown_detector_fails() {
        let mut registry = AnnotatorRegistry::new();
        registry.register(PassthroughAnnotator::new());
        assert!(registry.select(Some("yolov9")).is_err());
        assert!(registry.set_default("yolov9").is_err());
    }

    #[test]
    fn empty_registry_has_no_default() {
        let registry = AnnotatorRegistry::default();
        assert!(registry.select(None).is_err());
        assert!(registry.default_annotator().is_none());
    }
}

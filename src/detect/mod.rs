//! Detector port.
//!
//! The run loop only knows `Annotator::annotate(Frame) -> Frame`. What sits
//! behind it (a CPU motion differ, an ONNX model) is opaque; its latency is
//! the dominant per-frame cost and nothing here tries to hide it.

mod annotator;
mod backends;
mod overlay;
mod registry;
mod result;

pub use annotator::Annotator;
pub use backends::{MotionAnnotator, PassthroughAnnotator};
#[cfg(feature = "backend-tract")]
pub use backends::Yolov8Annotator;
pub use overlay::draw_detections;
pub use registry::{AnnotatorRegistry, SharedAnnotator};
pub use result::{Detection, COCO_LABELS};

use anyhow::{anyhow, Result};

use crate::config::DetectorSettings;

/// Backend names accepted in configuration.
pub const BACKEND_NAMES: [&str; 3] = ["yolov8", "motion", "passthrough"];

/// Build the registry for a studio: the configured backend first (so it is the
/// default), then the always-available CPU backends.
pub fn build_registry(settings: &DetectorSettings) -> Result<AnnotatorRegistry> {
    let mut registry = AnnotatorRegistry::new();
    register_backend(&mut registry, &settings.backend, settings)?;
    for name in ["motion", "passthrough"] {
        if registry.get(name).is_none() {
            register_backend(&mut registry, name, settings)?;
        }
    }
    Ok(registry)
}

fn register_backend(
    registry: &mut AnnotatorRegistry,
    name: &str,
    settings: &DetectorSettings,
) -> Result<()> {
    match name {
        "passthrough" => registry.register(PassthroughAnnotator::new()),
        "motion" => registry.register(MotionAnnotator::new()),
        "yolov8" => {
            #[cfg(feature = "backend-tract")]
            {
                let annotator = Yolov8Annotator::load(&settings.model_path)?
                    .with_thresholds(settings.confidence, settings.iou);
                registry.register(annotator);
            }
            #[cfg(not(feature = "backend-tract"))]
            {
                return Err(anyhow!(
                    "detector 'yolov8' (model {}) requires the backend-tract feature",
                    settings.model_path.display()
                ));
            }
        }
        other => {
            return Err(anyhow!(
                "unknown detector '{}' (expected one of {:?})",
                other,
                BACKEND_NAMES
            ))
        }
    }
    Ok(())
}

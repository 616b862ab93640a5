pub mod motion;
pub mod passthrough;

#[cfg(feature = "backend-tract")]
pub mod yolov8;

pub use motion::MotionAnnotator;
pub use passthrough::PassthroughAnnotator;

#[cfg(feature = "backend-tract")]
pub use yolov8::Yolov8Annotator;

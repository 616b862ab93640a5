use crate::error::RunResult;
use crate::frame::{Frame, Geometry};

/// Detector port: one frame in, one annotated frame of identical geometry out.
///
/// # Contract
///
/// From the run loop's point of view `annotate` is a pure function per call:
/// - The returned frame has the input's geometry and channel order
/// - Boxes and labels are burned into the pixels
/// - Failures (malformed frame, model runtime error) are `RunError::Inference`
///   and end the run
///
/// Batching, device placement and model choice are the backend's business.
/// There is no timeout; a hung backend hangs the run.
pub trait Annotator: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Annotate one frame.
    fn annotate(&mut self, frame: Frame) -> RunResult<Frame>;

    /// Called once per run before the first frame, with the run's geometry.
    /// Backends that carry state between frames reset it here.
    fn warm_up(&mut self, _geometry: Geometry) -> RunResult<()> {
        Ok(())
    }
}

impl<A: Annotator + ?Sized> Annotator for Box<A> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn annotate(&mut self, frame: Frame) -> RunResult<Frame> {
        (**self).annotate(frame)
    }

    fn warm_up(&mut self, geometry: Geometry) -> RunResult<()> {
        (**self).warm_up(geometry)
    }
}

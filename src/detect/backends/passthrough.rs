use crate::detect::annotator::Annotator;
use crate::error::RunResult;
use crate::frame::Frame;

/// Identity annotator. Returns every frame unmodified.
///
/// Useful for checking that the pipeline itself preserves pixels, and for
/// transcoding a source into the output container without detection.
#[derive(Default)]
pub struct PassthroughAnnotator {
    frames_seen: u64,
}

impl PassthroughAnnotator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }
}

impl Annotator for PassthroughAnnotator {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn annotate(&mut self, frame: Frame) -> RunResult<Frame> {
        self.frames_seen += 1;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ChannelOrder, Geometry};

    #[test]
    fn passthrough_returns_identical_pixels() {
        let pixels: Vec<u8> = (0..12).collect();
        let frame = Frame::new(pixels.clone(), Geometry::new(2, 2), ChannelOrder::Bgr).unwrap();
        let mut annotator = PassthroughAnnotator::new();
        let out = annotator.annotate(frame).unwrap();
        assert_eq!(out.as_bytes(), pixels.as_slice());
        assert_eq!(out.order(), ChannelOrder::Bgr);
        assert_eq!(annotator.frames_seen(), 1);
    }
}

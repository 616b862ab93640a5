use crate::detect::annotator::Annotator;
use crate::detect::overlay::draw_detections;
use crate::detect::result::Detection;
use crate::error::{RunError, RunResult};
use crate::frame::{Frame, Geometry};

/// Per-channel difference that counts a pixel as changed.
const DIFF_THRESHOLD: u8 = 24;

/// Changed pixels below this fraction of the frame are treated as noise.
const MIN_CHANGED_FRACTION: f32 = 0.001;

/// CPU annotator that boxes the region that changed since the previous frame.
///
/// No model involved: each frame is diffed pixel by pixel against the previous
/// one and the bounding box of the changed pixels is drawn with a `MOTION`
/// label. Confidence is the changed fraction of the box.
#[derive(Default)]
pub struct MotionAnnotator {
    last_pixels: Option<Vec<u8>>,
    geometry: Option<Geometry>,
}

impl MotionAnnotator {
    pub fn new() -> Self {
        Self::default()
    }

    fn changed_region(&self, pixels: &[u8], geometry: Geometry) -> Option<Detection> {
        let previous = self.last_pixels.as_ref()?;
        let width = geometry.width as usize;
        let mut min_x = usize::MAX;
        let mut min_y = usize::MAX;
        let mut max_x = 0usize;
        let mut max_y = 0usize;
        let mut changed = 0usize;

        for (i, (now, before)) in pixels.chunks_exact(3).zip(previous.chunks_exact(3)).enumerate() {
            let moved = now
                .iter()
                .zip(before)
                .any(|(a, b)| a.abs_diff(*b) > DIFF_THRESHOLD);
            if !moved {
                continue;
            }
            let x = i % width;
            let y = i / width;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            changed += 1;
        }

        let total = geometry.width as f32 * geometry.height as f32;
        if changed == 0 || (changed as f32) < total * MIN_CHANGED_FRACTION {
            return None;
        }
        let box_w = (max_x - min_x + 1) as f32;
        let box_h = (max_y - min_y + 1) as f32;
        Some(Detection {
            left: min_x as f32,
            top: min_y as f32,
            width: box_w,
            height: box_h,
            confidence: (changed as f32 / (box_w * box_h)).min(1.0),
            class_id: 1,
            label: "motion".to_string(),
        })
    }
}

impl Annotator for MotionAnnotator {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn warm_up(&mut self, geometry: Geometry) -> RunResult<()> {
        self.last_pixels = None;
        self.geometry = Some(geometry);
        Ok(())
    }

    fn annotate(&mut self, mut frame: Frame) -> RunResult<Frame> {
        let geometry = frame.geometry();
        if let Some(expected) = self.geometry {
            if expected != geometry {
                return Err(RunError::Inference(format!(
                    "frame geometry {} does not match run geometry {}",
                    geometry, expected
                )));
            }
        }

        let detection = self.changed_region(frame.as_bytes(), geometry);
        self.last_pixels = Some(frame.as_bytes().to_vec());

        if let Some(detection) = detection {
            log::trace!(
                "motion: frame {} box {:.0}x{:.0} at ({:.0},{:.0})",
                frame.index(),
                detection.width,
                detection.height,
                detection.left,
                detection.top
            );
            draw_detections(&mut frame, &[detection]).map_err(RunError::inference)?;
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ChannelOrder;

    fn frame_with_block(block_at: Option<(usize, usize)>) -> Frame {
        let geometry = Geometry::new(32, 32);
        let mut pixels = vec![10u8; 32 * 32 * 3];
        if let Some((bx, by)) = block_at {
            for y in by..by + 4 {
                for x in bx..bx + 4 {
                    let idx = (y * 32 + x) * 3;
                    pixels[idx..idx + 3].copy_from_slice(&[200, 200, 200]);
                }
            }
        }
        Frame::new(pixels, geometry, ChannelOrder::Bgr).expect("frame")
    }

    #[test]
    fn first_frame_is_not_annotated() {
        let mut annotator = MotionAnnotator::new();
        annotator.warm_up(Geometry::new(32, 32)).unwrap();
        let input = frame_with_block(None);
        let expected = input.as_bytes().to_vec();
        let out = annotator.annotate(input).unwrap();
        assert_eq!(out.as_bytes(), expected.as_slice());
    }

    #[test]
    fn moving_block_is_boxed() {
        let mut annotator = MotionAnnotator::new();
        annotator.warm_up(Geometry::new(32, 32)).unwrap();
        annotator.annotate(frame_with_block(Some((4, 20)))).unwrap();

        let input = frame_with_block(Some((20, 20)));
        let before = input.as_bytes().to_vec();
        let out = annotator.annotate(input).unwrap();
        assert_ne!(out.as_bytes(), before.as_slice());
        assert_eq!(out.geometry(), Geometry::new(32, 32));
    }

    #[test]
    fn still_scene_after_motion_is_left_unmarked() {
        let mut annotator = MotionAnnotator::new();
        annotator.annotate(frame_with_block(Some((4, 4)))).unwrap();
        annotator.annotate(frame_with_block(Some((20, 4)))).unwrap();
        let input = frame_with_block(Some((20, 4)));
        let before = input.as_bytes().to_vec();
        let out = annotator.annotate(input).unwrap();
        assert_eq!(out.as_bytes(), before.as_slice());
    }

    #[test]
    fn geometry_change_is_an_inference_error() {
        let mut annotator = MotionAnnotator::new();
        annotator.warm_up(Geometry::new(16, 16)).unwrap();
        let err = annotator.annotate(frame_with_block(None)).unwrap_err();
        assert!(matches!(err, RunError::Inference(_)));
    }
}

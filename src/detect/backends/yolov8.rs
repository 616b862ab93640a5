#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{imageops, ImageBuffer, Rgb, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::annotator::Annotator;
use crate::detect::overlay::draw_detections;
use crate::detect::result::{Detection, COCO_LABELS};
use crate::error::{RunError, RunResult};
use crate::frame::{ChannelOrder, Frame};

/// Square input edge of exported YOLOv8 checkpoints.
const INPUT_SIZE: u32 = 640;
const LETTERBOX_FILL: u8 = 114;

/// Tract-based YOLOv8 annotator.
///
/// Loads a local ONNX export (`yolo export format=onnx`) and runs it on CPU.
/// Frames are letterboxed to 640x640, the `[1, 4 + classes, anchors]` output
/// is decoded, filtered by confidence, reduced by class-wise NMS and drawn
/// back onto the original frame.
pub struct Yolov8Annotator {
    model: TypedRunnableModel<TypedModel>,
    confidence_threshold: f32,
    iou_threshold: f32,
}

/// Placement of the resized frame inside the square model input.
#[derive(Clone, Copy, Debug)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Yolov8Annotator {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = INPUT_SIZE as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(0, f32::fact([1, 3, size, size]).into())
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        log::info!("yolov8: loaded {}", model_path.display());

        Ok(Self {
            model,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
        })
    }

    /// Override the default confidence and NMS IoU thresholds.
    pub fn with_thresholds(mut self, confidence: f32, iou: f32) -> Self {
        self.confidence_threshold = confidence;
        self.iou_threshold = iou;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<(Tensor, Letterbox)> {
        let rgb: RgbImage =
            ImageBuffer::from_raw(frame.width(), frame.height(), frame.to_order(ChannelOrder::Rgb))
                .ok_or_else(|| anyhow!("frame buffer does not match its geometry"))?;

        let scale = (INPUT_SIZE as f32 / frame.width() as f32)
            .min(INPUT_SIZE as f32 / frame.height() as f32);
        let new_w = ((frame.width() as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        let new_h = ((frame.height() as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        let resized = imageops::resize(&rgb, new_w, new_h, imageops::FilterType::Triangle);

        let pad_x = (INPUT_SIZE - new_w) / 2;
        let pad_y = (INPUT_SIZE - new_h) / 2;
        let mut canvas =
            RgbImage::from_pixel(INPUT_SIZE, INPUT_SIZE, Rgb([LETTERBOX_FILL; 3]));
        imageops::overlay(&mut canvas, &resized, pad_x as i64, pad_y as i64);

        let size = INPUT_SIZE as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            canvas.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });

        Ok((
            input.into_tensor(),
            Letterbox {
                scale,
                pad_x: pad_x as f32,
                pad_y: pad_y as f32,
            },
        ))
    }

    fn decode(&self, outputs: TVec<TValue>, letterbox: Letterbox, frame: &Frame) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }
        // Exports are [1, 4 + classes, anchors]; some tools transpose it.
        let transposed = shape[1] > shape[2];
        let (features, anchors) = if transposed {
            (shape[2], shape[1])
        } else {
            (shape[1], shape[2])
        };
        if features <= 4 {
            return Err(anyhow!("model output has no class scores: {:?}", shape));
        }
        let at = |feature: usize, anchor: usize| -> f32 {
            if transposed {
                view[[0, anchor, feature]]
            } else {
                view[[0, feature, anchor]]
            }
        };

        let max_x = frame.width() as f32;
        let max_y = frame.height() as f32;
        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let (class_id, score) = (4..features)
                .map(|f| (f - 4, at(f, anchor)))
                .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
            if score < self.confidence_threshold {
                continue;
            }
            let cx = at(0, anchor);
            let cy = at(1, anchor);
            let w = at(2, anchor);
            let h = at(3, anchor);
            let left = ((cx - w / 2.0 - letterbox.pad_x) / letterbox.scale).clamp(0.0, max_x);
            let top = ((cy - h / 2.0 - letterbox.pad_y) / letterbox.scale).clamp(0.0, max_y);
            let right = ((cx + w / 2.0 - letterbox.pad_x) / letterbox.scale).clamp(0.0, max_x);
            let bottom = ((cy + h / 2.0 - letterbox.pad_y) / letterbox.scale).clamp(0.0, max_y);
            if right <= left || bottom <= top {
                continue;
            }
            candidates.push(Detection {
                left,
                top,
                width: right - left,
                height: bottom - top,
                confidence: score,
                class_id,
                label: COCO_LABELS
                    .get(class_id)
                    .map(|label| label.to_string())
                    .unwrap_or_else(|| format!("class {}", class_id)),
            });
        }
        Ok(non_max_suppression(candidates, self.iou_threshold))
    }
}

/// Class-wise greedy NMS, highest confidence first.
fn non_max_suppression(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for candidate in candidates {
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == candidate.class_id && k.iou(&candidate) > iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

impl Annotator for Yolov8Annotator {
    fn name(&self) -> &'static str {
        "yolov8"
    }

    fn annotate(&mut self, mut frame: Frame) -> RunResult<Frame> {
        let (input, letterbox) = self.build_input(&frame).map_err(RunError::inference)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|err| RunError::Inference(format!("ONNX inference failed: {:#}", err)))?;
        let detections = self
            .decode(outputs, letterbox, &frame)
            .map_err(RunError::inference)?;
        log::trace!("yolov8: frame {} -> {} detections", frame.index(), detections.len());
        draw_detections(&mut frame, &detections).map_err(RunError::inference)?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(left: f32, confidence: f32, class_id: usize) -> Detection {
        Detection {
            left,
            top: 0.0,
            width: 10.0,
            height: 10.0,
            confidence,
            class_id,
            label: String::new(),
        }
    }

    #[test]
    fn nms_keeps_best_of_overlapping_same_class() {
        let kept = non_max_suppression(vec![det(0.0, 0.6, 0), det(1.0, 0.9, 0)], 0.45);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].confidence, 0.9);
    }

    #[test]
    fn nms_keeps_overlapping_boxes_of_different_classes() {
        let kept = non_max_suppression(vec![det(0.0, 0.6, 0), det(1.0, 0.9, 2)], 0.45);
        assert_eq!(kept.len(), 2);
    }
}

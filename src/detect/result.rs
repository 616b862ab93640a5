/// One detected object in pixel coordinates of the annotated frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    pub class_id: usize,
    pub label: String,
}

impl Detection {
    pub fn right(&self) -> f32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.top + self.height
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &Detection) -> f32 {
        let ix = (self.right().min(other.right()) - self.left.max(other.left)).max(0.0);
        let iy = (self.bottom().min(other.bottom()) - self.top.max(other.top)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Class names of the COCO dataset, in the order YOLOv8 checkpoints emit them.
pub const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(left: f32, top: f32, size: f32) -> Detection {
        Detection {
            left,
            top,
            width: size,
            height: size,
            confidence: 0.9,
            class_id: 0,
            label: "person".to_string(),
        }
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = boxed(10.0, 10.0, 20.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        assert_eq!(boxed(0.0, 0.0, 10.0).iou(&boxed(50.0, 50.0, 10.0)), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        // 10x10 boxes shifted by 5 on x: inter 50, union 150.
        let a = boxed(0.0, 0.0, 10.0);
        let b = boxed(5.0, 0.0, 10.0);
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }
}

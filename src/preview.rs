//! Live preview.
//!
//! The run loop hands every written frame to a `LivePreview`. The web UI reads
//! through `LatestFrameSlot`, a single-slot mailbox: each `show` replaces the
//! previous frame, so a slow reader sees fewer frames instead of holding up the
//! loop or growing a queue. Everything stored here is RGB.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

use crate::frame::{Frame, Geometry};

/// Display end of the loop. Must return promptly.
pub trait LivePreview: Send + Sync {
    fn show(&self, frame: &Frame);
}

/// A frame as the display sees it: RGB, packed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreviewFrame {
    pub geometry: Geometry,
    /// Source position of the frame (1-based).
    pub index: u64,
    pub rgb: Vec<u8>,
}

#[derive(Default)]
struct SlotState {
    latest: Option<PreviewFrame>,
    sequence: u64,
}

/// Single-slot "latest frame" mailbox shared between a run and the UI.
///
/// Cloning yields another handle to the same slot.
#[derive(Clone, Default)]
pub struct LatestFrameSlot {
    inner: Arc<Mutex<SlotState>>,
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent frame, if any run has shown one since the last `clear`.
    pub fn latest(&self) -> Option<PreviewFrame> {
        self.inner
            .lock()
            .ok()
            .and_then(|state| state.latest.clone())
    }

    /// Number of frames shown since the last `clear`.
    pub fn sequence(&self) -> u64 {
        self.inner.lock().map(|state| state.sequence).unwrap_or(0)
    }

    /// Drop the stored frame and reset the counter; called at run start.
    pub fn clear(&self) {
        if let Ok(mut state) = self.inner.lock() {
            *state = SlotState::default();
        }
    }

    /// Latest frame encoded as JPEG, `None` when nothing has been shown.
    pub fn latest_jpeg(&self, quality: u8) -> Result<Option<Vec<u8>>> {
        let Some(frame) = self.latest() else {
            return Ok(None);
        };
        let image = RgbImage::from_raw(frame.geometry.width, frame.geometry.height, frame.rgb)
            .ok_or_else(|| anyhow!("preview buffer does not match its geometry"))?;
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100))
            .encode_image(&image)
            .context("encode preview JPEG")?;
        Ok(Some(jpeg))
    }
}

impl LivePreview for LatestFrameSlot {
    fn show(&self, frame: &Frame) {
        // Convert before taking the lock so the reader is never held up by it.
        let next = PreviewFrame {
            geometry: frame.geometry(),
            index: frame.index(),
            rgb: frame.to_rgb(),
        };
        match self.inner.lock() {
            Ok(mut state) => {
                state.latest = Some(next);
                state.sequence += 1;
            }
            Err(_) => log::warn!("preview slot poisoned; dropping frame {}", frame.index()),
        }
    }
}

/// Preview that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullPreview;

impl LivePreview for NullPreview {
    fn show(&self, _frame: &Frame) {}
}

/// Fans one frame out to several previews, in order.
pub struct PreviewFanout {
    targets: Vec<Arc<dyn LivePreview>>,
}

impl PreviewFanout {
    pub fn new(targets: Vec<Arc<dyn LivePreview>>) -> Self {
        Self { targets }
    }
}

impl LivePreview for PreviewFanout {
    fn show(&self, frame: &Frame) {
        for target in &self.targets {
            target.show(frame);
        }
    }
}

//! Frame types shared by every stage of a run.
//!
//! - `Geometry`: width and height fixed for the duration of one run.
//! - `ChannelOrder`: byte order of the three 8-bit colour channels.
//! - `Frame`: one packed, row-major image. Sources produce BGR (the order the
//!   decoders and the AVI sink use); the preview wants RGB.
//!
//! Frames are ephemeral. A detector consumes a frame and hands back a
//! replacement; nothing keeps a frame past one pass through the loop.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fmt;

/// Bytes per pixel. All frames are 8-bit, three-channel.
pub const CHANNELS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Packed byte length of one frame, or `None` on overflow.
    pub fn byte_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|v| v.checked_mul(CHANNELS))
    }

    pub fn row_bytes(&self) -> usize {
        self.width as usize * CHANNELS
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Bgr,
    Rgb,
}

/// One decoded image.
///
/// Pixel bytes are private so the length invariant (`geometry.byte_len()`)
/// holds for every frame that exists.
#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    geometry: Geometry,
    order: ChannelOrder,
    index: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, geometry: Geometry, order: ChannelOrder) -> Result<Self> {
        if geometry.is_empty() {
            return Err(anyhow!("frame geometry {} has no pixels", geometry));
        }
        let expected = geometry
            .byte_len()
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame length mismatch for {}: expected {} bytes, got {}",
                geometry,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            geometry,
            order,
            index: 0,
        })
    }

    /// Position of this frame in its source, starting at 1.
    pub fn with_index(mut self, index: u64) -> Self {
        self.index = index;
        self
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn width(&self) -> u32 {
        self.geometry.width
    }

    pub fn height(&self) -> u32 {
        self.geometry.height
    }

    pub fn order(&self) -> ChannelOrder {
        self.order
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable pixel access for overlay rendering. Length cannot change.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Copy of the pixels in the requested channel order.
    pub fn to_order(&self, order: ChannelOrder) -> Vec<u8> {
        let mut pixels = self.data.clone();
        if order != self.order {
            swap_red_blue(&mut pixels);
        }
        pixels
    }

    pub fn into_order(mut self, order: ChannelOrder) -> Self {
        if order != self.order {
            swap_red_blue(&mut self.data);
            self.order = order;
        }
        self
    }

    /// Pixels normalized to RGB, the order displays expect.
    pub fn to_rgb(&self) -> Vec<u8> {
        self.to_order(ChannelOrder::Rgb)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Pixel content is never printed.
        f.debug_struct("Frame")
            .field("geometry", &self.geometry)
            .field("order", &self.order)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// Swap the first and third channel of every packed pixel in place.
pub fn swap_red_blue(pixels: &mut [u8]) {
    for px in pixels.chunks_exact_mut(CHANNELS) {
        px.swap(0, 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_length_mismatch() {
        let err = Frame::new(vec![0u8; 10], Geometry::new(2, 2), ChannelOrder::Bgr);
        assert!(err.is_err());
    }

    #[test]
    fn frame_rejects_empty_geometry() {
        assert!(Frame::new(Vec::new(), Geometry::new(0, 4), ChannelOrder::Bgr).is_err());
    }

    #[test]
    fn bgr_frame_normalizes_to_rgb() -> Result<()> {
        // Two pixels: pure blue, pure red (BGR order).
        let frame = Frame::new(
            vec![255, 0, 0, 0, 0, 255],
            Geometry::new(2, 1),
            ChannelOrder::Bgr,
        )?;
        assert_eq!(frame.to_rgb(), vec![0, 0, 255, 255, 0, 0]);
        // Source bytes are untouched.
        assert_eq!(frame.as_bytes(), &[255, 0, 0, 0, 0, 255]);
        Ok(())
    }

    #[test]
    fn rgb_frame_is_not_swapped_twice() -> Result<()> {
        let frame = Frame::new(vec![1, 2, 3], Geometry::new(1, 1), ChannelOrder::Rgb)?;
        assert_eq!(frame.to_rgb(), vec![1, 2, 3]);
        let bgr = frame.into_order(ChannelOrder::Bgr);
        assert_eq!(bgr.as_bytes(), &[3, 2, 1]);
        assert_eq!(bgr.order(), ChannelOrder::Bgr);
        Ok(())
    }

    #[test]
    fn debug_output_hides_pixels() -> Result<()> {
        let frame = Frame::new(vec![42; 12], Geometry::new(2, 2), ChannelOrder::Bgr)?
            .with_index(7);
        let text = format!("{:?}", frame);
        assert!(text.contains("index: 7"));
        assert!(!text.contains("42"));
        Ok(())
    }
}

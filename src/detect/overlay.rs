//! Burn detection boxes and labels into a frame.
//!
//! Drawing happens directly on the frame's pixel buffer in the frame's own
//! channel order, so the annotated frame keeps its geometry and order.

use anyhow::{anyhow, Result};
use image::{ImageBuffer, Rgb};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use super::result::Detection;
use crate::frame::{ChannelOrder, Frame};

const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;
const LABEL_PADDING: i32 = 2;

/// RGB colours cycled by class id.
const PALETTE: [[u8; 3]; 8] = [
    [57, 255, 20],
    [255, 0, 255],
    [0, 229, 255],
    [255, 214, 0],
    [255, 96, 0],
    [120, 80, 255],
    [0, 255, 170],
    [255, 40, 90],
];

/// Draw every detection onto `frame`.
pub fn draw_detections(frame: &mut Frame, detections: &[Detection]) -> Result<()> {
    if detections.is_empty() {
        return Ok(());
    }
    let width = frame.width();
    let height = frame.height();
    let order = frame.order();
    let scale = ((height / 360).max(1)) as i32;
    let thickness = scale;

    let mut canvas = ImageBuffer::<Rgb<u8>, &mut [u8]>::from_raw(
        width,
        height,
        frame.as_bytes_mut(),
    )
    .ok_or_else(|| anyhow!("frame buffer does not match its geometry"))?;

    for detection in detections {
        let color = class_color(detection.class_id, order);
        let left = detection.left.round().clamp(0.0, (width - 1) as f32) as i32;
        let top = detection.top.round().clamp(0.0, (height - 1) as f32) as i32;
        let right = detection.right().round().clamp(0.0, (width - 1) as f32) as i32;
        let bottom = detection.bottom().round().clamp(0.0, (height - 1) as f32) as i32;
        if right <= left || bottom <= top {
            continue;
        }

        for inset in 0..thickness {
            let w = right - left - 2 * inset;
            let h = bottom - top - 2 * inset;
            if w <= 0 || h <= 0 {
                break;
            }
            draw_hollow_rect_mut(
                &mut canvas,
                Rect::at(left + inset, top + inset).of_size(w as u32 + 1, h as u32 + 1),
                color,
            );
        }

        let text = format!(
            "{} {:.0}%",
            detection.label.to_uppercase(),
            (detection.confidence * 100.0).clamp(0.0, 100.0)
        );
        let text_width = text.chars().count() as i32 * (GLYPH_WIDTH + 1) * scale;
        let bar_height = GLYPH_HEIGHT * scale + 2 * LABEL_PADDING;
        let bar_top = if top >= bar_height { top - bar_height } else { top };
        draw_filled_rect_mut(
            &mut canvas,
            Rect::at(left, bar_top).of_size(
                (text_width + 2 * LABEL_PADDING) as u32,
                bar_height as u32,
            ),
            color,
        );
        draw_text(
            &mut canvas,
            left + LABEL_PADDING,
            bar_top + LABEL_PADDING,
            scale,
            &text,
            Rgb([0, 0, 0]),
        );
    }
    Ok(())
}

fn class_color(class_id: usize, order: ChannelOrder) -> Rgb<u8> {
    let [r, g, b] = PALETTE[class_id % PALETTE.len()];
    match order {
        ChannelOrder::Rgb => Rgb([r, g, b]),
        ChannelOrder::Bgr => Rgb([b, g, r]),
    }
}

fn draw_text(
    canvas: &mut ImageBuffer<Rgb<u8>, &mut [u8]>,
    mut x: i32,
    y: i32,
    scale: i32,
    text: &str,
    color: Rgb<u8>,
) {
    let width = canvas.width() as i32;
    let height = canvas.height() as i32;
    for ch in text.chars() {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if (pattern >> (GLYPH_WIDTH - 1 - col)) & 1 == 0 {
                        continue;
                    }
                    for dy in 0..scale {
                        for dx in 0..scale {
                            let px = x + col * scale + dx;
                            let py = y + row as i32 * scale + dy;
                            if px >= 0 && px < width && py >= 0 && py < height {
                                canvas.put_pixel(px as u32, py as u32, color);
                            }
                        }
                    }
                }
            }
        }
        x += (GLYPH_WIDTH + 1) * scale;
    }
}

/// 5x7 bitmap glyphs. Unknown characters render as blanks.
fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Geometry;

    fn blank(order: ChannelOrder) -> Frame {
        Frame::new(vec![0u8; 40 * 30 * 3], Geometry::new(40, 30), order).expect("frame")
    }

    fn person(left: f32, top: f32) -> Detection {
        Detection {
            left,
            top,
            width: 20.0,
            height: 15.0,
            confidence: 0.87,
            class_id: 0,
            label: "person".to_string(),
        }
    }

    fn pixel(frame: &Frame, x: u32, y: u32) -> [u8; 3] {
        let idx = ((y * frame.width() + x) * 3) as usize;
        let b = frame.as_bytes();
        [b[idx], b[idx + 1], b[idx + 2]]
    }

    #[test]
    fn box_edges_are_drawn_in_frame_order() -> Result<()> {
        let mut frame = blank(ChannelOrder::Bgr);
        draw_detections(&mut frame, &[person(10.0, 12.0)])?;
        // Palette[0] is RGB (57, 255, 20); stored as BGR.
        assert_eq!(pixel(&frame, 10, 20), [20, 255, 57]);
        // Interior untouched.
        assert_eq!(pixel(&frame, 20, 20), [0, 0, 0]);
        Ok(())
    }

    #[test]
    fn rgb_frames_get_rgb_colours() -> Result<()> {
        let mut frame = blank(ChannelOrder::Rgb);
        draw_detections(&mut frame, &[person(10.0, 12.0)])?;
        assert_eq!(pixel(&frame, 10, 20), [57, 255, 20]);
        Ok(())
    }

    #[test]
    fn no_detections_leaves_frame_untouched() -> Result<()> {
        let mut frame = blank(ChannelOrder::Bgr);
        draw_detections(&mut frame, &[])?;
        assert!(frame.as_bytes().iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn out_of_bounds_boxes_are_clamped() -> Result<()> {
        let mut frame = blank(ChannelOrder::Bgr);
        let mut wide = person(-50.0, -50.0);
        wide.width = 500.0;
        wide.height = 500.0;
        draw_detections(&mut frame, &[wide])?;
        assert_eq!(frame.geometry(), Geometry::new(40, 30));
        Ok(())
    }

    #[test]
    fn every_label_character_has_a_glyph() {
        for label in super::super::COCO_LABELS {
            for ch in label.to_uppercase().chars() {
                assert!(glyph_bits(ch).is_some(), "missing glyph for {:?}", ch);
            }
        }
    }
}

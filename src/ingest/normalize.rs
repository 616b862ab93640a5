use anyhow::{anyhow, Result};

use crate::frame::{swap_red_blue, Geometry};

/// Capture formats a camera may hand back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv,
    Nv12,
    Mjpeg,
}

impl PixelFormat {
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(Self::Rgb24),
            b"BGR3" => Some(Self::Bgr24),
            b"YUYV" => Some(Self::Yuyv),
            b"NV12" => Some(Self::Nv12),
            b"MJPG" => Some(Self::Mjpeg),
            _ => None,
        }
    }
}

/// Convert one captured buffer to packed BGR24.
pub(crate) fn normalize_to_bgr(
    pixels: &[u8],
    geometry: Geometry,
    format: PixelFormat,
) -> Result<Vec<u8>> {
    let expected = geometry
        .byte_len()
        .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
    match format {
        PixelFormat::Bgr24 | PixelFormat::Rgb24 => {
            // Drivers may hand back a larger mmap buffer than one frame.
            let frame = pixels.get(..expected).ok_or_else(|| {
                anyhow!(
                    "packed frame length mismatch: expected {}, got {}",
                    expected,
                    pixels.len()
                )
            })?;
            let mut out = frame.to_vec();
            if format == PixelFormat::Rgb24 {
                swap_red_blue(&mut out);
            }
            Ok(out)
        }
        PixelFormat::Yuyv => yuyv_to_bgr(pixels, geometry),
        PixelFormat::Nv12 => nv12_to_bgr(pixels, geometry),
        PixelFormat::Mjpeg => mjpeg_to_bgr(pixels, geometry),
    }
}

fn yuyv_to_bgr(pixels: &[u8], geometry: Geometry) -> Result<Vec<u8>> {
    let pixel_count = geometry.width as usize * geometry.height as usize;
    let expected = pixel_count * 2;
    if pixels.len() < expected || geometry.width % 2 != 0 {
        return Err(anyhow!(
            "YUYV frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let mut bgr = Vec::with_capacity(pixel_count * 3);
    for chunk in pixels[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
            push_bgr(&mut bgr, y as f32, u, v);
        }
    }
    Ok(bgr)
}

fn nv12_to_bgr(pixels: &[u8], geometry: Geometry) -> Result<Vec<u8>> {
    let w = geometry.width as usize;
    let h = geometry.height as usize;
    let y_plane = w
        .checked_mul(h)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    let expected = y_plane
        .checked_add(y_plane / 2)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    if pixels.len() < expected {
        return Err(anyhow!(
            "NV12 frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let mut bgr = Vec::with_capacity(y_plane * 3);
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;
            push_bgr(&mut bgr, y, u, v);
        }
    }
    Ok(bgr)
}

fn mjpeg_to_bgr(pixels: &[u8], geometry: Geometry) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory_with_format(pixels, image::ImageFormat::Jpeg)
        .map_err(|e| anyhow!("MJPEG frame decode failed: {}", e))?
        .to_rgb8();
    if decoded.width() != geometry.width || decoded.height() != geometry.height {
        return Err(anyhow!(
            "MJPEG frame is {}x{}, device negotiated {}",
            decoded.width(),
            decoded.height(),
            geometry
        ));
    }
    let mut bgr = decoded.into_raw();
    swap_red_blue(&mut bgr);
    Ok(bgr)
}

fn push_bgr(out: &mut Vec<u8>, y: f32, u: f32, v: f32) {
    let r = y + 1.402_f32 * v;
    let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
    let b = y + 1.772_f32 * u;
    out.push(clamp_to_u8(b));
    out.push(clamp_to_u8(g));
    out.push(clamp_to_u8(r));
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_conversion_produces_gray() -> Result<()> {
        let y_plane = vec![128u8; 4];
        let uv_plane = vec![128u8; 2];
        let nv12 = [y_plane, uv_plane].concat();

        let bgr = normalize_to_bgr(&nv12, Geometry::new(2, 2), PixelFormat::Nv12)?;
        assert_eq!(bgr, vec![128u8; 12]);
        Ok(())
    }

    #[test]
    fn yuyv_conversion_produces_gray() -> Result<()> {
        let yuyv = vec![200, 128, 200, 128];
        let bgr = normalize_to_bgr(&yuyv, Geometry::new(2, 1), PixelFormat::Yuyv)?;
        assert_eq!(bgr, vec![200u8; 6]);
        Ok(())
    }

    #[test]
    fn rgb_capture_is_swapped_to_bgr() -> Result<()> {
        let rgb = vec![10, 20, 30];
        let bgr = normalize_to_bgr(&rgb, Geometry::new(1, 1), PixelFormat::Rgb24)?;
        assert_eq!(bgr, vec![30, 20, 10]);
        Ok(())
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(normalize_to_bgr(&[0u8; 5], Geometry::new(2, 1), PixelFormat::Bgr24).is_err());
        assert!(normalize_to_bgr(&[0u8; 3], Geometry::new(2, 1), PixelFormat::Yuyv).is_err());
    }

    #[test]
    fn fourcc_lookup() {
        assert_eq!(PixelFormat::from_fourcc(b"YUYV"), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(b"H264"), None);
    }
}

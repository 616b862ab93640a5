//! RIFF/AVI container writer and reader.
//!
//! Layout written by `AviWriter` (one video stream, no audio):
//!
//! ```text
//! RIFF 'AVI '
//!   LIST 'hdrl'
//!     avih            main header (frame count patched on close)
//!     LIST 'strl'
//!       strh          stream header (length patched on close)
//!       strf          BITMAPINFOHEADER
//!   LIST 'movi'
//!     00dc | 00db     one chunk per frame
//!   idx1              one 16-byte entry per frame
//! ```
//!
//! The header is written with zero counts when the file is created and
//! rewritten in place by `close`, which is what makes a truncated run
//! (cancelled part-way) still produce a playable file.
//!
//! The writer handles MJPG and DIB. `AviSummary` also reads XVID files muxed
//! by FFmpeg, minus frame decoding.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

use super::{Codec, FrameSink};
use crate::error::{RunError, RunResult};
use crate::frame::{ChannelOrder, Frame, Geometry};

/// Bytes before the first frame chunk (through the 'movi' list type).
const HEADER_LEN: usize = 224;
/// Largest file we produce; plain AVI 1.0 readers choke past this.
const MAX_RIFF_BYTES: u64 = 1 << 30;
const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;
/// `dwScale` of the stream; the rate is stored in thousandths of a frame.
const RATE_SCALE: u32 = 1000;

/// Writes one run's frames into an AVI file.
pub struct AviWriter {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    codec: Codec,
    geometry: Geometry,
    frame_rate: f64,
    jpeg_quality: u8,
    index: Vec<(u32, u32)>,
    movi_bytes: u64,
    max_chunk: u32,
}

impl AviWriter {
    /// Create (or truncate) the file at `path` and write a provisional header.
    pub fn create(
        path: impl AsRef<Path>,
        codec: Codec,
        frame_rate: f64,
        geometry: Geometry,
    ) -> RunResult<Self> {
        let path = path.as_ref().to_path_buf();
        if codec == Codec::Xvid {
            return Err(RunError::Encode(
                "AviWriter writes MJPG or DIB; XVID is encoded by FFmpeg".to_string(),
            ));
        }
        if geometry.is_empty() {
            return Err(RunError::Encode(format!(
                "cannot open sink with empty geometry {}",
                geometry
            )));
        }
        if !(frame_rate.is_finite() && frame_rate > 0.0) {
            return Err(RunError::Encode(format!(
                "frame rate must be positive, got {}",
                frame_rate
            )));
        }
        let file = File::create(&path).map_err(|err| {
            RunError::Encode(format!("create {}: {}", path.display(), err))
        })?;
        let mut writer = Self {
            path,
            out: Some(BufWriter::new(file)),
            codec,
            geometry,
            frame_rate,
            jpeg_quality: 90,
            index: Vec::new(),
            movi_bytes: 0,
            max_chunk: 0,
        };
        let header = writer.header();
        writer
            .stream()?
            .write_all(&header)
            .map_err(|err| RunError::Encode(format!("write AVI header: {}", err)))?;
        log::debug!(
            "AviWriter: opened {} ({} {} @ {:.2} fps)",
            writer.path.display(),
            codec,
            geometry,
            frame_rate
        );
        Ok(writer)
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn is_closed(&self) -> bool {
        self.out.is_none()
    }

    fn stream(&mut self) -> RunResult<&mut BufWriter<File>> {
        let path = &self.path;
        self.out
            .as_mut()
            .ok_or_else(|| RunError::Encode(format!("sink {} already closed", path.display())))
    }

    fn chunk_id(&self) -> &'static [u8; 4] {
        match self.codec {
            Codec::Mjpeg | Codec::Xvid => b"00dc",
            Codec::Raw => b"00db",
        }
    }

    fn encode_payload(&self, frame: &Frame) -> Result<Vec<u8>> {
        match self.codec {
            Codec::Raw => Ok(encode_dib(frame)),
            Codec::Mjpeg => {
                let rgb = RgbImage::from_raw(
                    frame.width(),
                    frame.height(),
                    frame.to_order(ChannelOrder::Rgb),
                )
                .ok_or_else(|| anyhow!("frame buffer does not match its geometry"))?;
                let mut buffer = Vec::new();
                JpegEncoder::new_with_quality(&mut buffer, self.jpeg_quality)
                    .encode_image(&rgb)
                    .context("JPEG encode failed")?;
                Ok(buffer)
            }
            Codec::Xvid => Err(anyhow!("XVID frames are not encoded by AviWriter")),
        }
    }

    fn riff_len(&self) -> u64 {
        // HEADER_LEN already counts the 'RIFF' tag and size field.
        HEADER_LEN as u64 + self.movi_bytes + 8 + 16 * self.index.len() as u64 - 8
    }

    fn header(&self) -> Vec<u8> {
        let frames = self.index.len() as u32;
        let w = self.geometry.width;
        let h = self.geometry.height;
        let micros_per_frame = (1_000_000.0 / self.frame_rate).round() as u32;
        let rate = (self.frame_rate * RATE_SCALE as f64).round() as u32;
        let image_size = match self.codec {
            Codec::Raw => dib_stride(w) as u32 * h,
            Codec::Mjpeg | Codec::Xvid => w * h * 3,
        };
        let suggested = self.max_chunk.max(image_size);
        let fourcc = self.codec.fourcc();
        let compression = match self.codec {
            Codec::Raw => [0u8; 4],
            Codec::Mjpeg | Codec::Xvid => fourcc,
        };

        let mut b = Vec::with_capacity(HEADER_LEN);
        b.extend_from_slice(b"RIFF");
        put_u32(&mut b, self.riff_len() as u32);
        b.extend_from_slice(b"AVI ");

        b.extend_from_slice(b"LIST");
        put_u32(&mut b, 192);
        b.extend_from_slice(b"hdrl");

        b.extend_from_slice(b"avih");
        put_u32(&mut b, 56);
        put_u32(&mut b, micros_per_frame);
        put_u32(&mut b, (suggested as f64 * self.frame_rate).round() as u32);
        put_u32(&mut b, 0); // padding granularity
        put_u32(&mut b, AVIF_HASINDEX);
        put_u32(&mut b, frames);
        put_u32(&mut b, 0); // initial frames
        put_u32(&mut b, 1); // streams
        put_u32(&mut b, suggested);
        put_u32(&mut b, w);
        put_u32(&mut b, h);
        b.extend_from_slice(&[0u8; 16]);

        b.extend_from_slice(b"LIST");
        put_u32(&mut b, 116);
        b.extend_from_slice(b"strl");

        b.extend_from_slice(b"strh");
        put_u32(&mut b, 56);
        b.extend_from_slice(b"vids");
        b.extend_from_slice(&fourcc);
        put_u32(&mut b, 0); // flags
        put_u16(&mut b, 0); // priority
        put_u16(&mut b, 0); // language
        put_u32(&mut b, 0); // initial frames
        put_u32(&mut b, RATE_SCALE);
        put_u32(&mut b, rate);
        put_u32(&mut b, 0); // start
        put_u32(&mut b, frames);
        put_u32(&mut b, suggested);
        put_u32(&mut b, u32::MAX); // default quality
        put_u32(&mut b, 0); // sample size
        put_u16(&mut b, 0);
        put_u16(&mut b, 0);
        put_u16(&mut b, w.min(u16::MAX as u32) as u16);
        put_u16(&mut b, h.min(u16::MAX as u32) as u16);

        b.extend_from_slice(b"strf");
        put_u32(&mut b, 40);
        put_u32(&mut b, 40);
        put_u32(&mut b, w);
        put_u32(&mut b, h); // positive: bottom-up rows
        put_u16(&mut b, 1);
        put_u16(&mut b, 24);
        b.extend_from_slice(&compression);
        put_u32(&mut b, image_size);
        put_u32(&mut b, 0);
        put_u32(&mut b, 0);
        put_u32(&mut b, 0);
        put_u32(&mut b, 0);

        b.extend_from_slice(b"LIST");
        put_u32(&mut b, (4 + self.movi_bytes) as u32);
        b.extend_from_slice(b"movi");

        debug_assert_eq!(b.len(), HEADER_LEN);
        b
    }

    fn finalize(&mut self) -> Result<()> {
        let Some(mut out) = self.out.take() else {
            return Ok(());
        };
        let mut idx = Vec::with_capacity(8 + 16 * self.index.len());
        idx.extend_from_slice(b"idx1");
        put_u32(&mut idx, 16 * self.index.len() as u32);
        let chunk_id = *self.chunk_id();
        for (offset, size) in &self.index {
            idx.extend_from_slice(&chunk_id);
            put_u32(&mut idx, AVIIF_KEYFRAME);
            put_u32(&mut idx, *offset);
            put_u32(&mut idx, *size);
        }
        out.write_all(&idx).context("write AVI index")?;

        let header = self.header();
        out.seek(SeekFrom::Start(0)).context("rewind AVI header")?;
        out.write_all(&header).context("rewrite AVI header")?;
        let file = out
            .into_inner()
            .map_err(|err| anyhow!("flush AVI file: {}", err.error()))?;
        file.sync_all().context("sync AVI file")?;
        log::debug!(
            "AviWriter: finalized {} with {} frames",
            self.path.display(),
            self.index.len()
        );
        Ok(())
    }
}

impl FrameSink for AviWriter {
    fn write(&mut self, frame: &Frame) -> RunResult<()> {
        if self.is_closed() {
            return Err(RunError::Encode(format!(
                "sink {} already closed",
                self.path.display()
            )));
        }
        if frame.geometry() != self.geometry {
            return Err(RunError::Encode(format!(
                "frame geometry {} does not match sink geometry {}",
                frame.geometry(),
                self.geometry
            )));
        }
        let payload = self.encode_payload(frame).map_err(RunError::encode)?;
        let size = payload.len() as u64;
        let padded = size + (size & 1);
        if self.riff_len() + 8 + padded + 16 > MAX_RIFF_BYTES {
            return Err(RunError::Encode(format!(
                "{} would exceed the {} byte AVI limit",
                self.path.display(),
                MAX_RIFF_BYTES
            )));
        }

        let offset = 4 + self.movi_bytes as u32;
        let chunk_id = *self.chunk_id();
        let out = self.stream()?;
        let io = (|| -> std::io::Result<()> {
            out.write_all(&chunk_id)?;
            out.write_all(&(size as u32).to_le_bytes())?;
            out.write_all(&payload)?;
            if size & 1 == 1 {
                out.write_all(&[0])?;
            }
            Ok(())
        })();
        io.map_err(|err| RunError::Encode(format!("write frame chunk: {}", err)))?;

        self.index.push((offset, size as u32));
        self.movi_bytes += 8 + padded;
        self.max_chunk = self.max_chunk.max(size as u32);
        Ok(())
    }

    fn close(&mut self) -> RunResult<()> {
        self.finalize()
            .map_err(|err| RunError::Encode(format!("{}: {:#}", self.path.display(), err)))
    }

    fn frames_written(&self) -> u64 {
        self.index.len() as u64
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AviWriter {
    fn drop(&mut self) {
        if !self.is_closed() {
            log::warn!(
                "AviWriter: {} dropped without close; finalizing",
                self.path.display()
            );
            if let Err(err) = self.finalize() {
                log::error!("AviWriter: finalize on drop failed: {:#}", err);
            }
        }
    }
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Row length of an uncompressed 24-bit DIB, padded to 4 bytes.
fn dib_stride(width: u32) -> usize {
    (width as usize * 3 + 3) & !3
}

/// Bottom-up, row-padded BGR.
fn encode_dib(frame: &Frame) -> Vec<u8> {
    let geometry = frame.geometry();
    let row_bytes = geometry.row_bytes();
    let stride = dib_stride(geometry.width);
    let pixels = frame.to_order(ChannelOrder::Bgr);
    let mut out = vec![0u8; stride * geometry.height as usize];
    for (row, src) in pixels.chunks_exact(row_bytes).enumerate() {
        let dst_row = geometry.height as usize - 1 - row;
        out[dst_row * stride..dst_row * stride + row_bytes].copy_from_slice(src);
    }
    out
}

// ----------------------------------------------------------------------------
// Reader
// ----------------------------------------------------------------------------

/// What an AVI artifact contains, parsed back from disk.
#[derive(Clone, Debug)]
pub struct AviSummary {
    pub codec: Codec,
    pub geometry: Geometry,
    pub frame_rate: f64,
    /// `dwTotalFrames` from the main header.
    pub header_frames: u32,
    /// `dwLength` from the stream header.
    pub stream_frames: u32,
    /// Entries in the `idx1` index.
    pub indexed_frames: usize,
    payloads: Vec<Vec<u8>>,
}

#[derive(Default)]
struct Parsed {
    codec: Option<[u8; 4]>,
    width: u32,
    height: u32,
    scale: u32,
    rate: u32,
    header_frames: u32,
    stream_frames: u32,
    indexed_frames: usize,
    payloads: Vec<Vec<u8>>,
}

impl AviSummary {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
        Self::parse(&data).with_context(|| format!("parse AVI {}", path.display()))
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 12 || &data[0..4] != b"RIFF" || &data[8..12] != b"AVI " {
            return Err(anyhow!("not a RIFF AVI file"));
        }
        let riff_end = (8 + le_u32(data, 4)? as usize).min(data.len());
        let mut parsed = Parsed::default();
        walk(data, 12, riff_end, &mut parsed)?;

        let fourcc = parsed.codec.ok_or_else(|| anyhow!("missing stream format"))?;
        let codec = Codec::from_fourcc(&fourcc).ok_or_else(|| {
            anyhow!("unsupported codec {:?}", String::from_utf8_lossy(&fourcc))
        })?;
        let frame_rate = if parsed.scale == 0 {
            0.0
        } else {
            parsed.rate as f64 / parsed.scale as f64
        };
        Ok(Self {
            codec,
            geometry: Geometry::new(parsed.width, parsed.height),
            frame_rate,
            header_frames: parsed.header_frames,
            stream_frames: parsed.stream_frames,
            indexed_frames: parsed.indexed_frames,
            payloads: parsed.payloads,
        })
    }

    /// Frame chunks present in the `movi` list.
    pub fn frame_count(&self) -> usize {
        self.payloads.len()
    }

    /// Headers, index and data agree on the number of frames.
    pub fn is_finalized(&self) -> bool {
        let n = self.payloads.len();
        self.header_frames as usize == n
            && self.stream_frames as usize == n
            && self.indexed_frames == n
    }

    pub fn payload(&self, index: usize) -> Option<&[u8]> {
        self.payloads.get(index).map(Vec::as_slice)
    }

    /// Decode frame `index` (0-based) back into a BGR frame.
    pub fn decode_frame(&self, index: usize) -> Result<Frame> {
        let payload = self
            .payload(index)
            .ok_or_else(|| anyhow!("frame {} out of range", index))?;
        match self.codec {
            Codec::Raw => {
                let stride = dib_stride(self.geometry.width);
                let row_bytes = self.geometry.row_bytes();
                let height = self.geometry.height as usize;
                if payload.len() < stride * height {
                    return Err(anyhow!("DIB frame {} is truncated", index));
                }
                let mut pixels = Vec::with_capacity(row_bytes * height);
                for row in (0..height).rev() {
                    pixels.extend_from_slice(&payload[row * stride..row * stride + row_bytes]);
                }
                Frame::new(pixels, self.geometry, ChannelOrder::Bgr)
            }
            Codec::Mjpeg => {
                let rgb = image::load_from_memory_with_format(payload, image::ImageFormat::Jpeg)
                    .context("decode MJPG frame")?
                    .to_rgb8();
                let geometry = Geometry::new(rgb.width(), rgb.height());
                Ok(Frame::new(rgb.into_raw(), geometry, ChannelOrder::Rgb)?
                    .into_order(ChannelOrder::Bgr))
            }
            Codec::Xvid => Err(anyhow!(
                "frame {} is MPEG-4; decode the file with the ffmpeg source instead",
                index
            )),
        }
    }
}

fn walk(data: &[u8], mut pos: usize, end: usize, parsed: &mut Parsed) -> Result<()> {
    while pos + 8 <= end {
        let id: [u8; 4] = data[pos..pos + 4]
            .try_into()
            .map_err(|_| anyhow!("truncated chunk id"))?;
        let size = le_u32(data, pos + 4)? as usize;
        let body = pos + 8;
        let body_end = body
            .checked_add(size)
            .filter(|e| *e <= end)
            .ok_or_else(|| anyhow!("chunk {:?} overruns its parent", String::from_utf8_lossy(&id)))?;
        match &id {
            b"LIST" => walk(data, body + 4, body_end, parsed)?,
            b"avih" => parsed.header_frames = le_u32(data, body + 16)?,
            b"strh" => {
                parsed.scale = le_u32(data, body + 20)?;
                parsed.rate = le_u32(data, body + 24)?;
                parsed.stream_frames = le_u32(data, body + 32)?;
            }
            b"strf" => {
                parsed.width = le_u32(data, body + 4)?;
                parsed.height = le_u32(data, body + 8)?;
                let compression: [u8; 4] = data
                    .get(body + 16..body + 20)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| anyhow!("truncated strf"))?;
                parsed.codec = Some(compression);
            }
            b"idx1" => parsed.indexed_frames = size / 16,
            b"00dc" | b"00db" => parsed.payloads.push(data[body..body_end].to_vec()),
            _ => {}
        }
        pos = body_end + (size & 1);
    }
    Ok(())
}

fn le_u32(data: &[u8], at: usize) -> Result<u32> {
    data.get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| anyhow!("truncated field at byte {}", at))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(geometry: Geometry, seed: u8) -> Frame {
        let len = geometry.byte_len().unwrap();
        let pixels = (0..len).map(|i| (i as u8).wrapping_mul(seed)).collect();
        Frame::new(pixels, geometry, ChannelOrder::Bgr).unwrap()
    }

    #[test]
    fn raw_frames_round_trip_bit_exact() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("raw.avi");
        // Odd width exercises DIB row padding.
        let geometry = Geometry::new(5, 3);
        let frames = [frame(geometry, 3), frame(geometry, 7)];

        let mut writer = AviWriter::create(&path, Codec::Raw, 25.0, geometry)?;
        for f in &frames {
            writer.write(f)?;
        }
        writer.close()?;

        let summary = AviSummary::read(&path)?;
        assert!(summary.is_finalized());
        assert_eq!(summary.frame_count(), 2);
        assert_eq!(summary.geometry, geometry);
        assert_eq!(summary.codec, Codec::Raw);
        assert!((summary.frame_rate - 25.0).abs() < 1e-9);
        for (i, original) in frames.iter().enumerate() {
            assert_eq!(summary.decode_frame(i)?.as_bytes(), original.as_bytes());
        }
        Ok(())
    }

    #[test]
    fn mjpeg_frames_are_counted_and_decodable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mjpg.avi");
        let geometry = Geometry::new(16, 8);
        let mut writer = AviWriter::create(&path, Codec::Mjpeg, 29.97, geometry)?;
        for seed in 1..=3 {
            writer.write(&frame(geometry, seed))?;
        }
        writer.close()?;

        let summary = AviSummary::read(&path)?;
        assert!(summary.is_finalized());
        assert_eq!(summary.frame_count(), 3);
        assert_eq!(summary.codec, Codec::Mjpeg);
        assert!((summary.frame_rate - 29.97).abs() < 1e-3);
        assert_eq!(summary.decode_frame(2)?.geometry(), geometry);
        Ok(())
    }

    #[test]
    fn empty_container_is_valid() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("empty.avi");
        let mut writer = AviWriter::create(&path, Codec::Mjpeg, 20.0, Geometry::new(8, 8))?;
        writer.close()?;

        let summary = AviSummary::read(&path)?;
        assert!(summary.is_finalized());
        assert_eq!(summary.frame_count(), 0);
        assert_eq!(std::fs::metadata(&path)?.len(), HEADER_LEN as u64 + 8);
        Ok(())
    }

    #[test]
    fn geometry_mismatch_is_an_encode_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mismatch.avi");
        let mut writer = AviWriter::create(&path, Codec::Raw, 20.0, Geometry::new(8, 8))?;
        let err = writer.write(&frame(Geometry::new(4, 4), 1)).unwrap_err();
        assert!(matches!(err, RunError::Encode(_)));
        assert_eq!(writer.frames_written(), 0);
        writer.close()?;
        Ok(())
    }

    #[test]
    fn close_is_idempotent_and_blocks_writes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("closed.avi");
        let geometry = Geometry::new(4, 4);
        let mut writer = AviWriter::create(&path, Codec::Raw, 20.0, geometry)?;
        writer.write(&frame(geometry, 1))?;
        writer.close()?;
        writer.close()?;
        assert!(matches!(
            writer.write(&frame(geometry, 2)),
            Err(RunError::Encode(_))
        ));
        assert_eq!(AviSummary::read(&path)?.frame_count(), 1);
        Ok(())
    }

    #[test]
    fn dropped_writer_is_finalized() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dropped.avi");
        let geometry = Geometry::new(4, 4);
        {
            let mut writer = AviWriter::create(&path, Codec::Raw, 20.0, geometry)?;
            writer.write(&frame(geometry, 1))?;
        }
        assert!(AviSummary::read(&path)?.is_finalized());
        Ok(())
    }

    #[test]
    fn unwritable_path_is_an_encode_error() {
        let err = AviWriter::create(
            "/nonexistent-dir/out.avi",
            Codec::Raw,
            20.0,
            Geometry::new(4, 4),
        )
        .err()
        .expect("create must fail");
        assert!(matches!(err, RunError::Encode(_)));
    }

    #[test]
    fn xvid_is_left_to_ffmpeg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.avi");
        let err = AviWriter::create(&path, Codec::Xvid, 20.0, Geometry::new(4, 4))
            .err()
            .expect("AviWriter has no MPEG-4 encoder");
        assert!(matches!(err, RunError::Encode(_)));
        assert!(!path.exists());
    }

    #[test]
    fn garbage_is_not_an_avi() {
        assert!(AviSummary::parse(b"definitely not a video").is_err());
    }
}

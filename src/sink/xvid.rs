//! XVID output through FFmpeg.
//!
//! Frames are converted to YUV420P and encoded with libavcodec's `mpeg4`
//! encoder. The AVI muxer writes the container; the stream is tagged `XVID`
//! so players pick an Xvid-compatible decoder. MPEG-4 needs even dimensions,
//! so an odd width or height loses its last column or row.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::FrameSink;
use crate::error::{RunError, RunResult};
use crate::frame::{ChannelOrder, Frame, Geometry};

const XVID_TAG: u32 = u32::from_le_bytes(*b"XVID");
/// Frame rates are passed to the encoder in thousandths of a frame.
const RATE_SCALE: i32 = 1000;

pub struct XvidWriter {
    path: PathBuf,
    geometry: Geometry,
    state: Option<EncodeState>,
    frames_written: u64,
}

struct EncodeState {
    output: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::video::Encoder,
    scaler: ffmpeg::software::scaling::Context,
    stream_index: usize,
    encoder_time_base: ffmpeg::Rational,
    stream_time_base: ffmpeg::Rational,
}

impl XvidWriter {
    /// Create (or truncate) the file at `path` and write the container header.
    pub fn create(path: impl AsRef<Path>, frame_rate: f64, geometry: Geometry) -> RunResult<Self> {
        let path = path.as_ref().to_path_buf();
        if geometry.width < 2 || geometry.height < 2 {
            return Err(RunError::Encode(format!(
                "XVID needs at least 2x2 pixels, got {}",
                geometry
            )));
        }
        if !(frame_rate.is_finite() && frame_rate > 0.0) {
            return Err(RunError::Encode(format!(
                "frame rate must be positive, got {}",
                frame_rate
            )));
        }
        let state = EncodeState::open(&path, frame_rate, geometry).map_err(|err| {
            RunError::Encode(format!("open XVID sink {}: {:#}", path.display(), err))
        })?;
        log::debug!(
            "XvidWriter: opened {} ({} @ {:.2} fps)",
            path.display(),
            geometry,
            frame_rate
        );
        Ok(Self {
            path,
            geometry,
            state: Some(state),
            frames_written: 0,
        })
    }
}

impl EncodeState {
    fn open(path: &Path, frame_rate: f64, geometry: Geometry) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let mut output = ffmpeg::format::output_as(&path, "avi")
            .with_context(|| format!("create {}", path.display()))?;
        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4)
            .ok_or_else(|| anyhow!("ffmpeg was built without the mpeg4 encoder"))?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let rate = ffmpeg::Rational::new(
            (frame_rate * f64::from(RATE_SCALE)).round() as i32,
            RATE_SCALE,
        );
        let encoder_time_base = rate.invert();
        let width = geometry.width & !1;
        let height = geometry.height & !1;

        let (encoder, stream_index) = {
            let mut stream = output.add_stream(codec).context("add video stream")?;
            let mut setup =
                ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                    .context("load encoder parameters")?
                    .encoder()
                    .video()
                    .context("create mpeg4 encoder")?;
            setup.set_width(width);
            setup.set_height(height);
            setup.set_format(ffmpeg::format::Pixel::YUV420P);
            setup.set_time_base(encoder_time_base);
            setup.set_frame_rate(Some(rate));
            if global_header {
                setup.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
            }
            let encoder = setup.open_as(codec).context("open mpeg4 encoder")?;

            stream.set_parameters(&encoder);
            stream.set_time_base(encoder_time_base);
            let mut parameters = stream.parameters();
            // SAFETY: `parameters` points at the stream's codecpar, owned by
            // `output`, which outlives this block; only the tag is written.
            unsafe {
                (*parameters.as_mut_ptr()).codec_tag = XVID_TAG;
            }
            (encoder, stream.index())
        };
        output.write_header().context("write AVI header")?;
        let stream_time_base = output
            .stream(stream_index)
            .map(|stream| stream.time_base())
            .ok_or_else(|| anyhow!("video stream vanished after header"))?;

        let scaler = ffmpeg::software::scaling::Context::get(
            ffmpeg::format::Pixel::BGR24,
            geometry.width,
            geometry.height,
            ffmpeg::format::Pixel::YUV420P,
            width,
            height,
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            output,
            encoder,
            scaler,
            stream_index,
            encoder_time_base,
            stream_time_base,
        })
    }

    fn encode(&mut self, bgr: &[u8], geometry: Geometry, pts: i64) -> Result<()> {
        let mut input =
            ffmpeg::frame::Video::new(ffmpeg::format::Pixel::BGR24, geometry.width, geometry.height);
        let row_bytes = geometry.row_bytes();
        let stride = input.stride(0);
        let plane = input.data_mut(0);
        for (row, src) in bgr.chunks_exact(row_bytes).enumerate() {
            plane
                .get_mut(row * stride..row * stride + row_bytes)
                .context("ffmpeg frame row is out of bounds")?
                .copy_from_slice(src);
        }

        let mut yuv = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&input, &mut yuv)
            .context("scale frame to YUV420P")?;
        yuv.set_pts(Some(pts));
        self.encoder
            .send_frame(&yuv)
            .context("send frame to mpeg4 encoder")?;
        self.drain()
    }

    fn drain(&mut self) -> Result<()> {
        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
            packet
                .write_interleaved(&mut self.output)
                .context("write packet")?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.encoder.send_eof().context("flush mpeg4 encoder")?;
        self.drain()?;
        self.output.write_trailer().context("write AVI trailer")?;
        Ok(())
    }
}

impl FrameSink for XvidWriter {
    fn write(&mut self, frame: &Frame) -> RunResult<()> {
        if frame.geometry() != self.geometry {
            return Err(RunError::Encode(format!(
                "frame is {}, sink opened for {}",
                frame.geometry(),
                self.geometry
            )));
        }
        let path = &self.path;
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| RunError::Encode(format!("sink {} already closed", path.display())))?;
        let pixels = match frame.order() {
            ChannelOrder::Bgr => Cow::Borrowed(frame.as_bytes()),
            _ => Cow::Owned(frame.to_order(ChannelOrder::Bgr)),
        };
        let pts = self.frames_written as i64;
        state.encode(&pixels, self.geometry, pts).map_err(|err| {
            RunError::Encode(format!("encode frame {}: {:#}", pts + 1, err))
        })?;
        self.frames_written += 1;
        Ok(())
    }

    fn close(&mut self) -> RunResult<()> {
        let Some(mut state) = self.state.take() else {
            return Ok(());
        };
        state.finish().map_err(|err| {
            RunError::Encode(format!("finalize {}: {:#}", self.path.display(), err))
        })?;
        log::debug!(
            "XvidWriter: closed {} after {} frames",
            self.path.display(),
            self.frames_written
        );
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames_written
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for XvidWriter {
    fn drop(&mut self) {
        if self.state.is_some() {
            if let Err(err) = self.close() {
                log::error!("XvidWriter: finalize on drop failed: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{FileSource, FrameSource};
    use crate::sink::{AviSummary, Codec};

    fn frame(geometry: Geometry, shift: u8) -> Frame {
        let len = geometry.byte_len().unwrap();
        let pixels = (0..len).map(|i| (i as u8).wrapping_add(shift)).collect();
        Frame::new(pixels, geometry, ChannelOrder::Bgr).unwrap()
    }

    #[test]
    fn xvid_file_is_tagged_and_decodable() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out.avi");
        let geometry = Geometry::new(32, 24);

        let mut writer = XvidWriter::create(&path, 25.0, geometry)?;
        for shift in 0..5u8 {
            writer.write(&frame(geometry, shift * 16))?;
        }
        writer.close()?;
        writer.close()?;
        assert_eq!(writer.frames_written(), 5);

        let summary = AviSummary::read(&path)?;
        assert_eq!(summary.codec, Codec::Xvid);
        assert_eq!(summary.geometry, geometry);
        assert_eq!(summary.frame_count(), 5);
        assert!((summary.frame_rate - 25.0).abs() < 1e-6);

        let mut source = FileSource::open(&path)?;
        assert_eq!(source.geometry(), geometry);
        let mut decoded = 0;
        while source.read_frame()?.is_some() {
            decoded += 1;
        }
        assert_eq!(decoded, 5);
        Ok(())
    }

    #[test]
    fn odd_geometry_is_cropped_to_even() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("odd.avi");
        let geometry = Geometry::new(17, 13);

        let mut writer = XvidWriter::create(&path, 20.0, geometry)?;
        writer.write(&frame(geometry, 0))?;
        writer.close()?;

        let summary = AviSummary::read(&path)?;
        assert_eq!(summary.geometry, Geometry::new(16, 12));
        assert_eq!(summary.frame_count(), 1);
        Ok(())
    }

    #[test]
    fn mismatched_frame_and_write_after_close_are_encode_errors() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut writer = XvidWriter::create(dir.path().join("out.avi"), 20.0, Geometry::new(8, 8))?;
        let err = writer.write(&frame(Geometry::new(4, 4), 0)).unwrap_err();
        assert!(matches!(err, RunError::Encode(_)));

        writer.close()?;
        let err = writer.write(&frame(Geometry::new(8, 8), 0)).unwrap_err();
        assert!(matches!(err, RunError::Encode(_)));
        Ok(())
    }
}

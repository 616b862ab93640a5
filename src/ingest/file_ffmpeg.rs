//! Local file decoding with FFmpeg.
//!
//! Decodes the best video stream of a local container to packed BGR24. The
//! decoder is drained at end of input so trailing (reordered) frames are not
//! lost.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use crate::frame::{ChannelOrder, Frame, Geometry};

pub(crate) struct FfmpegFileSource {
    state: Option<DecodeState>,
    geometry: Geometry,
    frame_rate: f64,
    frame_count: u64,
}

struct DecodeState {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    eof_sent: bool,
}

impl FfmpegFileSource {
    pub(crate) fn open(path: &str) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("failed to open '{}' with ffmpeg", path))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();
        let rate = input_stream.avg_frame_rate();
        let frame_rate = if rate.denominator() == 0 {
            0.0
        } else {
            f64::from(rate.numerator()) / f64::from(rate.denominator())
        };
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let geometry = Geometry::new(decoder.width(), decoder.height());
        if geometry.is_empty() {
            return Err(anyhow!("video track reports empty geometry {}", geometry));
        }

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::BGR24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            state: Some(DecodeState {
                input,
                stream_index,
                decoder,
                scaler,
                eof_sent: false,
            }),
            geometry,
            frame_rate,
            frame_count: 0,
        })
    }

    pub(crate) fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub(crate) fn nominal_frame_rate(&self) -> f64 {
        self.frame_rate
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg source already closed"))?;

        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if state.decoder.receive_frame(&mut decoded).is_ok() {
                let mut bgr_frame = ffmpeg::frame::Video::empty();
                state
                    .scaler
                    .run(&decoded, &mut bgr_frame)
                    .context("scale frame to BGR")?;
                let pixels = frame_to_pixels(&bgr_frame)?;
                self.frame_count += 1;
                let frame = Frame::new(pixels, self.geometry, ChannelOrder::Bgr)?
                    .with_index(self.frame_count);
                return Ok(Some(frame));
            }
            if state.eof_sent {
                return Ok(None);
            }

            let stream_index = state.stream_index;
            let next = state
                .input
                .packets()
                .find(|(stream, _)| stream.index() == stream_index)
                .map(|(_, packet)| packet);
            match next {
                Some(packet) => state
                    .decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?,
                None => {
                    state.decoder.send_eof().context("flush ffmpeg decoder")?;
                    state.eof_sent = true;
                }
            }
        }
    }

    pub(crate) fn close(&mut self) {
        if self.state.take().is_some() {
            log::debug!("ffmpeg source closed after {} frames", self.frame_count);
        }
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<Vec<u8>> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let row_bytes = width * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return data
            .get(..row_bytes * height)
            .map(<[u8]>::to_vec)
            .context("ffmpeg frame is shorter than its geometry");
    }

    let mut pixels = Vec::with_capacity(row_bytes * height);
    for row in 0..height {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }
    Ok(pixels)
}

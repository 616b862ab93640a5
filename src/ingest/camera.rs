//! Live camera frame source.
//!
//! Camera index `N` maps to the V4L2 device node `/dev/videoN` (index 0 is the
//! system default camera). Capture buffers are normalized to packed BGR24 in
//! memory. Without the ingest-v4l2 feature every open fails with
//! `SourceUnavailable`.
//!
//! A disconnected camera surfaces as a read error; a camera that simply stops
//! delivering buffers blocks the run indefinitely.

use crate::error::{RunError, RunResult};
use crate::frame::{Frame, Geometry};

use super::FrameSource;

/// Live camera frame source.
pub struct CameraSource {
    index: u32,
    #[cfg(feature = "ingest-v4l2")]
    device: device::DeviceCamera,
}

impl CameraSource {
    pub fn device_path(index: u32) -> String {
        format!("/dev/video{}", index)
    }

    #[cfg(feature = "ingest-v4l2")]
    pub fn open(index: u32) -> RunResult<Self> {
        let device = device::DeviceCamera::open(&Self::device_path(index))
            .map_err(|err| RunError::SourceUnavailable(format!("camera #{}: {:#}", index, err)))?;
        Ok(Self { index, device })
    }

    #[cfg(not(feature = "ingest-v4l2"))]
    pub fn open(index: u32) -> RunResult<Self> {
        Err(RunError::SourceUnavailable(format!(
            "camera #{} ({}): live capture requires the ingest-v4l2 feature",
            index,
            Self::device_path(index)
        )))
    }
}

#[cfg(feature = "ingest-v4l2")]
impl FrameSource for CameraSource {
    fn describe(&self) -> String {
        format!("camera #{} ({})", self.index, Self::device_path(self.index))
    }

    fn geometry(&self) -> Geometry {
        self.device.geometry()
    }

    fn nominal_frame_rate(&self) -> f64 {
        self.device.frame_rate()
    }

    fn read_frame(&mut self) -> RunResult<Option<Frame>> {
        self.device
            .next_frame()
            .map(Some)
            .map_err(|err| RunError::SourceUnavailable(format!("camera #{}: {:#}", self.index, err)))
    }

    fn release(&mut self) {
        self.device.close();
    }
}

// Never constructed without the feature; keeps `Box<dyn FrameSource>` uniform.
#[cfg(not(feature = "ingest-v4l2"))]
impl FrameSource for CameraSource {
    fn describe(&self) -> String {
        format!("camera #{}", self.index)
    }

    fn geometry(&self) -> Geometry {
        Geometry::new(0, 0)
    }

    fn nominal_frame_rate(&self) -> f64 {
        0.0
    }

    fn read_frame(&mut self) -> RunResult<Option<Frame>> {
        Err(RunError::SourceUnavailable(
            "live capture requires the ingest-v4l2 feature".to_string(),
        ))
    }

    fn release(&mut self) {}
}

// ----------------------------------------------------------------------------
// V4L2 capture using libv4l
// ----------------------------------------------------------------------------

#[cfg(feature = "ingest-v4l2")]
mod device {
    use anyhow::{anyhow, Context, Result};
    use ouroboros::self_referencing;

    use super::super::normalize::{normalize_to_bgr, PixelFormat};
    use crate::frame::{ChannelOrder, Frame, Geometry};

    /// Formats requested in order of preference.
    const PREFERRED_FOURCC: [&[u8; 4]; 3] = [b"BGR3", b"YUYV", b"MJPG"];

    pub(super) struct DeviceCamera {
        path: String,
        state: Option<DeviceState>,
        geometry: Geometry,
        format: PixelFormat,
        frame_rate: f64,
        frame_count: u64,
    }

    #[self_referencing]
    struct DeviceState {
        device: v4l::Device,
        #[borrows(mut device)]
        #[covariant]
        stream: v4l::prelude::MmapStream<'this, v4l::Device>,
    }

    impl DeviceCamera {
        pub(super) fn open(path: &str) -> Result<Self> {
            use v4l::buffer::Type;
            use v4l::video::Capture;

            let device =
                v4l::Device::with_path(path).with_context(|| format!("open v4l2 device {}", path))?;
            let current = device.format().context("read v4l2 format")?;

            let mut negotiated = None;
            for fourcc in PREFERRED_FOURCC {
                let mut wanted = current.clone();
                wanted.fourcc = v4l::FourCC::new(fourcc);
                match device.set_format(&wanted) {
                    Ok(format) if format.fourcc.repr == *fourcc => {
                        negotiated = Some(format);
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        log::debug!("CameraSource: {} rejected {:?}: {}", path, fourcc, err);
                    }
                }
            }
            let format = match negotiated {
                Some(format) => format,
                None => device.format().context("read v4l2 format")?,
            };
            let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
                anyhow!(
                    "unsupported capture format {}",
                    String::from_utf8_lossy(&format.fourcc.repr)
                )
            })?;

            let frame_rate = match device.params() {
                Ok(params) if params.interval.numerator > 0 => {
                    f64::from(params.interval.denominator) / f64::from(params.interval.numerator)
                }
                Ok(_) => 0.0,
                Err(err) => {
                    log::warn!("CameraSource: failed to read fps on {}: {}", path, err);
                    0.0
                }
            };

            let state = DeviceStateBuilder {
                device,
                stream_builder: |device| {
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                        .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
                },
            }
            .try_build()?;

            let geometry = Geometry::new(format.width, format.height);
            log::info!(
                "CameraSource: connected to {} ({} {:?} @ {:.1} fps)",
                path,
                geometry,
                pixel_format,
                frame_rate
            );
            Ok(Self {
                path: path.to_string(),
                state: Some(state),
                geometry,
                format: pixel_format,
                frame_rate,
                frame_count: 0,
            })
        }

        pub(super) fn geometry(&self) -> Geometry {
            self.geometry
        }

        pub(super) fn frame_rate(&self) -> f64 {
            self.frame_rate
        }

        pub(super) fn next_frame(&mut self) -> Result<Frame> {
            use v4l::io::traits::CaptureStream;

            let state = self.state.as_mut().context("v4l2 device not connected")?;
            let captured = state
                .with_mut(|fields| -> std::io::Result<Vec<u8>> {
                    let (buf, meta) = fields.stream.next()?;
                    let used = (meta.bytesused as usize).min(buf.len());
                    let used = if used == 0 { buf.len() } else { used };
                    Ok(buf[..used].to_vec())
                })
                .map_err(|err| anyhow::Error::new(err).context("capture v4l2 frame"))?;
            let pixels = normalize_to_bgr(&captured, self.geometry, self.format)?;

            self.frame_count += 1;
            Ok(Frame::new(pixels, self.geometry, ChannelOrder::Bgr)?.with_index(self.frame_count))
        }

        pub(super) fn close(&mut self) {
            if self.state.take().is_some() {
                log::info!(
                    "CameraSource: released {} after {} frames",
                    self.path,
                    self.frame_count
                );
            }
        }
    }
}

//! Output sinks.
//!
//! A run writes annotated frames to exactly one sink: an AVI file at a fixed
//! path, fixed codec and fixed frame rate. The sink is opened with the
//! source's geometry and rejects any frame that does not match it. `close`
//! finalizes the container so the file is playable the moment it returns.
//!
//! MJPG and DIB are muxed by `avi::AviWriter` in every build. XVID needs an
//! MPEG-4 encoder and goes through FFmpeg (`ingest-file-ffmpeg` feature).

pub mod avi;
#[cfg(feature = "ingest-file-ffmpeg")]
pub mod xvid;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::anyhow;
use serde::Serialize;

use crate::error::RunResult;
use crate::frame::{Frame, Geometry};

pub use avi::{AviSummary, AviWriter};

/// Append-only writer for one run's artifact.
pub trait FrameSink: Send {
    /// Encode and append one frame.
    fn write(&mut self, frame: &Frame) -> RunResult<()>;

    /// Flush and finalize the container. Calling it again is a no-op.
    fn close(&mut self) -> RunResult<()>;

    /// Frames appended so far.
    fn frames_written(&self) -> u64;

    /// Location of the artifact.
    fn path(&self) -> &Path;
}

/// Video codecs an AVI artifact can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Codec {
    /// Motion JPEG: each frame an independent JPEG.
    Mjpeg,
    /// Uncompressed 24-bit BGR (`DIB `), bit-exact.
    Raw,
    /// MPEG-4 Part 2 tagged `XVID`. Needs the FFmpeg encoder.
    Xvid,
}

impl Codec {
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            Self::Mjpeg => *b"MJPG",
            Self::Raw => *b"DIB ",
            Self::Xvid => *b"XVID",
        }
    }

    pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"MJPG" | b"mjpg" => Some(Self::Mjpeg),
            b"DIB " | [0, 0, 0, 0] => Some(Self::Raw),
            b"XVID" | b"xvid" | b"FMP4" | b"DX50" => Some(Self::Xvid),
            _ => None,
        }
    }

    /// Whether this build can write the codec.
    pub fn is_available(&self) -> bool {
        match self {
            Self::Mjpeg | Self::Raw => true,
            Self::Xvid => cfg!(feature = "ingest-file-ffmpeg"),
        }
    }
}

impl FromStr for Codec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MJPG" | "MJPEG" => Ok(Self::Mjpeg),
            "DIB" | "RAW" => Ok(Self::Raw),
            "XVID" | "MPEG4" => Ok(Self::Xvid),
            other => Err(anyhow!(
                "unsupported codec '{}' (expected MJPG, DIB or XVID)",
                other
            )),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(String::from_utf8_lossy(&self.fourcc()).trim_end())
    }
}

/// Everything needed to open a run's sink except the source-derived geometry
/// and frame rate.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputSettings {
    pub path: PathBuf,
    pub codec: Codec,
    /// Frame rate used when the source does not report one.
    pub default_fps: f64,
    /// JPEG quality for `Codec::Mjpeg`. Unused by the other codecs.
    pub jpeg_quality: u8,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("output.avi"),
            codec: Codec::Mjpeg,
            default_fps: crate::ingest::DEFAULT_FRAME_RATE,
            jpeg_quality: 90,
        }
    }
}

/// Open the sink for a run, overwriting any previous artifact at the path.
pub fn open_sink(
    output: &OutputSettings,
    frame_rate: f64,
    geometry: Geometry,
) -> RunResult<Box<dyn FrameSink>> {
    match output.codec {
        Codec::Mjpeg | Codec::Raw => {
            let writer = AviWriter::create(&output.path, output.codec, frame_rate, geometry)?
                .with_jpeg_quality(output.jpeg_quality);
            Ok(Box::new(writer))
        }
        Codec::Xvid => open_xvid(&output.path, frame_rate, geometry),
    }
}

#[cfg(feature = "ingest-file-ffmpeg")]
fn open_xvid(path: &Path, frame_rate: f64, geometry: Geometry) -> RunResult<Box<dyn FrameSink>> {
    Ok(Box::new(xvid::XvidWriter::create(path, frame_rate, geometry)?))
}

#[cfg(not(feature = "ingest-file-ffmpeg"))]
fn open_xvid(path: &Path, _frame_rate: f64, _geometry: Geometry) -> RunResult<Box<dyn FrameSink>> {
    Err(crate::error::RunError::Encode(format!(
        "cannot write {}: XVID output requires the ingest-file-ffmpeg feature",
        path.display()
    )))
}

//! Frame sources.
//!
//! A run reads from exactly one source:
//! - Local video files (synthetic `stub://` clips always; real containers with
//!   feature: ingest-file-ffmpeg)
//! - Live cameras by index (feature: ingest-v4l2)
//!
//! Every source yields packed BGR frames of one fixed geometry and reports a
//! nominal frame rate. `read_frame` blocks until a frame is available, the
//! device disconnects, or the file is exhausted. There is no timeout: a stalled
//! camera stalls the run.

pub mod camera;
pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
#[cfg(feature = "ingest-v4l2")]
mod normalize;

use std::fmt;
use std::path::PathBuf;

use crate::error::RunResult;
use crate::frame::{Frame, Geometry};

pub use camera::CameraSource;
pub use file::{ClipSpec, FileSource};

/// Frame rate used when a source does not know its own.
pub const DEFAULT_FRAME_RATE: f64 = 20.0;

/// A sequential, blocking frame source owned by one run.
pub trait FrameSource: Send {
    /// Human-readable origin for logs and status.
    fn describe(&self) -> String;

    /// Geometry of every frame this source will produce.
    fn geometry(&self) -> Geometry;

    /// Rate reported by the container or device; `0.0` when unknown.
    fn nominal_frame_rate(&self) -> f64;

    /// Next frame, or `None` once the source is exhausted.
    fn read_frame(&mut self) -> RunResult<Option<Frame>>;

    /// Close the device or file. Must tolerate being called more than once.
    fn release(&mut self);

    /// Nominal rate, or `fallback` when the source reports zero or garbage.
    fn frame_rate_or(&self, fallback: f64) -> f64 {
        let rate = self.nominal_frame_rate();
        if rate.is_finite() && rate > 0.0 {
            rate
        } else {
            fallback
        }
    }
}

/// What the user asked to read from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceSpec {
    Camera { index: u32 },
    File { path: PathBuf },
}

impl SourceSpec {
    /// Resolve the run's source from the UI controls. The camera toggle wins
    /// when both a file and the camera are offered; `None` means no valid
    /// source was given.
    pub fn resolve(use_camera: bool, camera_index: u32, file: Option<PathBuf>) -> Option<Self> {
        if use_camera {
            return Some(Self::Camera {
                index: camera_index,
            });
        }
        file.map(|path| Self::File { path })
    }

    pub fn is_camera(&self) -> bool {
        matches!(self, Self::Camera { .. })
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Camera { index } => write!(f, "camera #{}", index),
            Self::File { path } => write!(f, "file {}", path.display()),
        }
    }
}

/// Open the source named by `spec`.
pub fn open_source(spec: &SourceSpec) -> RunResult<Box<dyn FrameSource>> {
    match spec {
        SourceSpec::Camera { index } => Ok(Box::new(CameraSource::open(*index)?)),
        SourceSpec::File { path } => Ok(Box::new(FileSource::open(path)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_takes_precedence_over_file() {
        let spec = SourceSpec::resolve(true, 0, Some(PathBuf::from("clip.mp4")));
        assert_eq!(spec, Some(SourceSpec::Camera { index: 0 }));
    }

    #[test]
    fn file_used_when_camera_off() {
        let spec = SourceSpec::resolve(false, 0, Some(PathBuf::from("clip.mp4")));
        assert_eq!(
            spec,
            Some(SourceSpec::File {
                path: PathBuf::from("clip.mp4")
            })
        );
    }

    #[test]
    fn no_source_without_file_or_camera() {
        assert_eq!(SourceSpec::resolve(false, 0, None), None);
    }

    #[test]
    fn zero_rate_falls_back_to_default() -> anyhow::Result<()> {
        let source = FileSource::open("stub://clip?frames=1&fps=0")?;
        assert_eq!(source.frame_rate_or(DEFAULT_FRAME_RATE), DEFAULT_FRAME_RATE);
        let source = FileSource::open("stub://clip?frames=1&fps=25")?;
        assert_eq!(source.frame_rate_or(DEFAULT_FRAME_RATE), 25.0);
        Ok(())
    }
}

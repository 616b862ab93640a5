//! Local file frame source.
//!
//! `FileSource` reads frames sequentially from a local video file. Two backends:
//! - `stub://clip?...` paths produce a deterministic synthetic clip (tests, demos)
//! - anything else is decoded with FFmpeg (feature: ingest-file-ffmpeg)
//!
//! The file source MUST NOT fetch remote URLs.

use std::path::Path;

use anyhow::{anyhow, Context, Result};

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::FrameSource;
use crate::error::{RunError, RunResult};
use crate::frame::{ChannelOrder, Frame, Geometry};

const STUB_SCHEME: &str = "stub://";

/// Local file frame source.
pub struct FileSource {
    path: String,
    backend: FileBackend,
}

enum FileBackend {
    Synthetic(SyntheticClip),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> RunResult<Self> {
        let path = path.as_ref().to_string_lossy().into_owned();
        if !is_local_file_path(&path) {
            return Err(RunError::SourceUnavailable(format!(
                "'{}' is not a local file path (no URL schemes)",
                path
            )));
        }
        if path.starts_with(STUB_SCHEME) {
            let spec = ClipSpec::parse(&path).map_err(RunError::unavailable)?;
            log::info!("FileSource: opened {} (synthetic, {} frames)", path, spec.frames);
            return Ok(Self {
                path,
                backend: FileBackend::Synthetic(SyntheticClip::new(spec)),
            });
        }
        if !Path::new(&path).is_file() {
            return Err(RunError::SourceUnavailable(format!(
                "video file '{}' does not exist or is not readable",
                path
            )));
        }
        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            let source = FfmpegFileSource::open(&path)
                .map_err(|err| RunError::SourceUnavailable(format!("{:#}", err)))?;
            log::info!(
                "FileSource: opened {} (ffmpeg, {} @ {:.2} fps)",
                path,
                source.geometry(),
                source.nominal_frame_rate()
            );
            Ok(Self {
                path,
                backend: FileBackend::Ffmpeg(source),
            })
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            Err(RunError::SourceUnavailable(
                "decoding video files requires the ingest-file-ffmpeg feature".to_string(),
            ))
        }
    }
}

impl FrameSource for FileSource {
    fn describe(&self) -> String {
        self.path.clone()
    }

    fn geometry(&self) -> Geometry {
        match &self.backend {
            FileBackend::Synthetic(clip) => clip.spec.geometry,
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.geometry(),
        }
    }

    fn nominal_frame_rate(&self) -> f64 {
        match &self.backend {
            FileBackend::Synthetic(clip) => clip.spec.fps,
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.nominal_frame_rate(),
        }
    }

    fn read_frame(&mut self) -> RunResult<Option<Frame>> {
        let result = match &mut self.backend {
            FileBackend::Synthetic(clip) => clip.next_frame(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.next_frame(),
        };
        result.map_err(|err| RunError::SourceUnavailable(format!("{}: {:#}", self.path, err)))
    }

    fn release(&mut self) {
        match &mut self.backend {
            FileBackend::Synthetic(clip) => clip.released = true,
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.close(),
        }
        log::debug!("FileSource: released {}", self.path);
    }
}

// ----------------------------------------------------------------------------
// Synthetic clip (stub://) for tests
// ----------------------------------------------------------------------------

/// Parameters of a synthetic clip: `stub://clip?frames=N&width=W&height=H&fps=F`.
///
/// Missing keys take the defaults below. `fps=0` models a container that does
/// not know its own rate.
#[derive(Clone, Debug, PartialEq)]
pub struct ClipSpec {
    pub frames: u64,
    pub geometry: Geometry,
    pub fps: f64,
}

impl Default for ClipSpec {
    fn default() -> Self {
        Self {
            frames: 30,
            geometry: Geometry::new(64, 48),
            fps: 0.0,
        }
    }
}

impl ClipSpec {
    pub fn parse(path: &str) -> Result<Self> {
        let rest = path
            .strip_prefix(STUB_SCHEME)
            .ok_or_else(|| anyhow!("synthetic clip path must start with {}", STUB_SCHEME))?;
        let mut spec = Self::default();
        let Some((_, query)) = rest.split_once('?') else {
            return Ok(spec);
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed clip parameter '{}'", pair))?;
            match key {
                "frames" => spec.frames = value.parse().context("clip frames")?,
                "width" => spec.geometry.width = value.parse().context("clip width")?,
                "height" => spec.geometry.height = value.parse().context("clip height")?,
                "fps" => spec.fps = value.parse().context("clip fps")?,
                other => return Err(anyhow!("unknown clip parameter '{}'", other)),
            }
        }
        if spec.geometry.is_empty() {
            return Err(anyhow!("clip geometry {} has no pixels", spec.geometry));
        }
        Ok(spec)
    }

    /// Pixels of frame `index` (1-based). Deterministic so tests can rebuild
    /// what the source produced.
    pub fn pixels(&self, index: u64) -> Vec<u8> {
        let width = self.geometry.width as usize;
        let row_bytes = self.geometry.row_bytes();
        let len = row_bytes * self.geometry.height as usize;
        let mut pixels = vec![0u8; len];
        for (i, value) in pixels.iter_mut().enumerate() {
            let y = i / row_bytes;
            let x = (i % row_bytes) / 3;
            let c = i % 3;
            *value = ((x + y * width / 4 + index as usize * 7 + c * 31) % 256) as u8;
        }
        pixels
    }
}

struct SyntheticClip {
    spec: ClipSpec,
    produced: u64,
    released: bool,
}

impl SyntheticClip {
    fn new(spec: ClipSpec) -> Self {
        Self {
            spec,
            produced: 0,
            released: false,
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.released {
            return Err(anyhow!("synthetic clip already released"));
        }
        if self.produced >= self.spec.frames {
            return Ok(None);
        }
        self.produced += 1;
        let frame = Frame::new(
            self.spec.pixels(self.produced),
            self.spec.geometry,
            ChannelOrder::Bgr,
        )?
        .with_index(self.produced);
        Ok(Some(frame))
    }
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with(STUB_SCHEME) {
        return true;
    }
    !path.contains("://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_clip_yields_requested_frames_then_ends() -> Result<()> {
        let mut source = FileSource::open("stub://clip?frames=3&width=8&height=4")?;
        assert_eq!(source.geometry(), Geometry::new(8, 4));

        for expected in 1..=3 {
            let frame = source.read_frame()?.expect("frame");
            assert_eq!(frame.index(), expected);
            assert_eq!(frame.order(), ChannelOrder::Bgr);
        }
        assert!(source.read_frame()?.is_none());
        assert!(source.read_frame()?.is_none());
        Ok(())
    }

    #[test]
    fn synthetic_frames_differ_between_indices() -> Result<()> {
        let spec = ClipSpec::parse("stub://clip?width=4&height=4")?;
        assert_ne!(spec.pixels(1), spec.pixels(2));
        assert_eq!(spec.pixels(2), spec.pixels(2));
        Ok(())
    }

    #[test]
    fn empty_clip_is_immediately_exhausted() -> Result<()> {
        let mut source = FileSource::open("stub://clip?frames=0")?;
        assert!(source.read_frame()?.is_none());
        Ok(())
    }

    #[test]
    fn read_after_release_fails() -> Result<()> {
        let mut source = FileSource::open("stub://clip?frames=2")?;
        source.release();
        source.release();
        assert!(matches!(
            source.read_frame(),
            Err(RunError::SourceUnavailable(_))
        ));
        Ok(())
    }

    #[test]
    fn remote_urls_are_rejected() {
        assert!(matches!(
            FileSource::open("rtsp://camera/stream"),
            Err(RunError::SourceUnavailable(_))
        ));
    }

    #[test]
    fn missing_file_is_unavailable() {
        assert!(matches!(
            FileSource::open("/definitely/not/here.mp4"),
            Err(RunError::SourceUnavailable(_))
        ));
    }

    #[test]
    fn clip_spec_rejects_unknown_keys() {
        assert!(ClipSpec::parse("stub://clip?colour=red").is_err());
        assert!(ClipSpec::parse("stub://clip?width=0").is_err());
    }
}

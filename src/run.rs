//! The run loop.
//!
//! One run drives one source through one annotator into one sink, frame by
//! frame, strictly in arrival order:
//!
//! ```text
//! IDLE -> RUNNING -> COMPLETED | CANCELLED | FAILED
//! ```
//!
//! Per iteration: check the cancel token, read, annotate, write, show. Any
//! error ends the run in `FAILED`; there are no retries.
//!
//! Whatever the terminal state, the sink is closed and then the source is
//! released, each exactly once. `RunResources` owns both handles and performs
//! the release from `Drop` as well, so a panicking annotator still cannot
//! leak a capture device or leave an unfinalized file behind.
//!
//! `read_frame` and `annotate` have no timeout. A hung camera or model hangs
//! the run until the process is stopped.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::detect::Annotator;
use crate::error::{RunError, RunResult};
use crate::frame::Geometry;
use crate::ingest::{self, FrameSource, SourceSpec};
use crate::preview::LivePreview;
use crate::sink::{self, FrameSink, OutputSettings};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stop signal for one run.
///
/// Clones share the flag. Any holder may set it at any time; the loop checks
/// it once per iteration, so a stop is observed before the next frame is read.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Opens the two resources a run owns. Swapped out in tests.
pub trait MediaFactory: Send + Sync {
    fn open_source(&self, spec: &SourceSpec) -> RunResult<Box<dyn FrameSource>>;

    fn open_sink(
        &self,
        output: &OutputSettings,
        frame_rate: f64,
        geometry: Geometry,
    ) -> RunResult<Box<dyn FrameSink>>;
}

/// Real files, real cameras, AVI output.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalMedia;

impl MediaFactory for LocalMedia {
    fn open_source(&self, spec: &SourceSpec) -> RunResult<Box<dyn FrameSource>> {
        ingest::open_source(spec)
    }

    fn open_sink(
        &self,
        output: &OutputSettings,
        frame_rate: f64,
        geometry: Geometry,
    ) -> RunResult<Box<dyn FrameSink>> {
        sink::open_sink(output, frame_rate, geometry)
    }
}

/// Immutable configuration of one run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunPlan {
    pub source: SourceSpec,
    pub output: OutputSettings,
}

impl RunPlan {
    /// True when the output path names the input file. Opening the sink would
    /// truncate the source it is about to read.
    pub fn output_overwrites_input(&self) -> bool {
        let SourceSpec::File { path } = &self.source else {
            return false;
        };
        match (path.canonicalize(), self.output.path.canonicalize()) {
            (Ok(input), Ok(output)) => input == output,
            _ => *path == self.output.path,
        }
    }
}

/// Outcome of a finished run.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub state: RunState,
    /// Origin as described by the source, empty if it never opened.
    pub source: String,
    pub geometry: Option<Geometry>,
    pub frame_rate: Option<f64>,
    pub frames_read: u64,
    pub frames_written: u64,
    /// Finalized artifact offered for playback and download.
    pub artifact: Option<PathBuf>,
    pub error: Option<RunError>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            state: RunState::Running,
            source: String::new(),
            geometry: None,
            frame_rate: None,
            frames_read: 0,
            frames_written: 0,
            artifact: None,
            error: None,
        }
    }

    /// Report for a run that ended before the loop could report for itself.
    pub fn failed(error: RunError) -> Self {
        Self {
            state: RunState::Failed,
            error: Some(error),
            ..Self::new()
        }
    }

    /// One line for the user.
    pub fn summary(&self) -> String {
        match (&self.state, &self.error) {
            (RunState::Failed, Some(err)) => format!(
                "run failed after {} frames: {}",
                self.frames_written, err
            ),
            (state, _) => format!("run {} with {} frames", state, self.frames_written),
        }
    }
}

/// Source and sink of a run in progress.
///
/// `release` closes the sink then releases the source. Both handles are taken
/// out of their slot first, so neither can be released twice.
#[derive(Default)]
struct RunResources {
    source: Option<Box<dyn FrameSource>>,
    sink: Option<Box<dyn FrameSink>>,
    frames_written: u64,
}

impl RunResources {
    fn release(&mut self) -> RunResult<()> {
        let closed = match self.sink.take() {
            Some(mut sink) => {
                let result = sink.close();
                log::debug!("run: sink {} closed", sink.path().display());
                result
            }
            None => Ok(()),
        };
        if let Some(mut source) = self.source.take() {
            source.release();
            log::debug!("run: source {} released", source.describe());
        }
        closed
    }
}

impl Drop for RunResources {
    fn drop(&mut self) {
        if self.source.is_none() && self.sink.is_none() {
            return;
        }
        log::warn!("run: releasing resources during unwind");
        let sink_path = self.sink.as_ref().map(|sink| sink.path().to_path_buf());
        if let Err(err) = self.release() {
            log::error!("run: sink close during unwind failed: {}", err);
        }
        // An unwinding run is a failed run: same empty-artifact rule.
        if let (Some(path), 0) = (sink_path, self.frames_written) {
            remove_empty_artifact(&path);
        }
    }
}

fn remove_empty_artifact(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        log::warn!("run: could not remove empty {}: {}", path.display(), err);
    }
}

/// Drives one run. Borrows everything; owns nothing past `run`.
pub struct RunLoop<'a> {
    media: &'a dyn MediaFactory,
    annotator: &'a mut dyn Annotator,
    preview: &'a dyn LivePreview,
    cancel: CancelToken,
}

impl<'a> RunLoop<'a> {
    pub fn new(
        media: &'a dyn MediaFactory,
        annotator: &'a mut dyn Annotator,
        preview: &'a dyn LivePreview,
        cancel: CancelToken,
    ) -> Self {
        Self {
            media,
            annotator,
            preview,
            cancel,
        }
    }

    /// Run `plan` to a terminal state. Never returns `Running`.
    pub fn run(self, plan: &RunPlan) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport::new();
        let mut resources = RunResources::default();
        log::info!(
            "run: IDLE -> RUNNING ({}, detector {})",
            plan.source,
            self.annotator.name()
        );

        let outcome = self.drive(plan, &mut resources, &mut report);
        let sink_path = resources.sink.as_ref().map(|sink| sink.path().to_path_buf());
        let closed = resources.release();

        report.state = match (outcome, closed) {
            (Ok(state), Ok(())) => state,
            (Ok(_), Err(err)) => {
                report.error = Some(err);
                RunState::Failed
            }
            (Err(err), closed) => {
                if let Err(close_err) = closed {
                    log::error!("run: sink close after failure also failed: {}", close_err);
                }
                report.error = Some(err);
                RunState::Failed
            }
        };

        match report.state {
            RunState::Completed | RunState::Cancelled => report.artifact = sink_path,
            RunState::Failed => {
                if let (Some(path), 0) = (sink_path, report.frames_written) {
                    remove_empty_artifact(&path);
                }
            }
            RunState::Idle | RunState::Running => {}
        }

        let elapsed = started.elapsed().as_secs_f64();
        match &report.error {
            Some(err) => log::error!(
                "run: RUNNING -> FAILED after {} frames in {:.1}s: {}",
                report.frames_written,
                elapsed,
                err
            ),
            None => log::info!(
                "run: RUNNING -> {} after {} frames in {:.1}s",
                report.state,
                report.frames_written,
                elapsed
            ),
        }
        report
    }

    fn drive(
        mut self,
        plan: &RunPlan,
        resources: &mut RunResources,
        report: &mut RunReport,
    ) -> RunResult<RunState> {
        if plan.output_overwrites_input() {
            return Err(RunError::Encode(format!(
                "output {} is the input file",
                plan.output.path.display()
            )));
        }
        let source = resources
            .source
            .insert(self.media.open_source(&plan.source)?);
        let geometry = source.geometry();
        let frame_rate = source.frame_rate_or(plan.output.default_fps);
        report.source = source.describe();
        report.geometry = Some(geometry);
        report.frame_rate = Some(frame_rate);
        log::info!(
            "run: source {} is {} @ {:.2} fps",
            report.source,
            geometry,
            frame_rate
        );

        let sink = self.media.open_sink(&plan.output, frame_rate, geometry)?;
        resources.sink = Some(sink);
        self.annotator.warm_up(geometry)?;

        let (Some(source), Some(sink)) =
            (resources.source.as_deref_mut(), resources.sink.as_deref_mut())
        else {
            return Err(RunError::SourceUnavailable(
                "run resources missing after acquisition".to_string(),
            ));
        };

        loop {
            if self.cancel.is_cancelled() {
                return Ok(RunState::Cancelled);
            }
            let Some(frame) = source.read_frame()? else {
                return Ok(RunState::Completed);
            };
            report.frames_read += 1;
            let frame = frame.with_index(report.frames_read);
            if frame.geometry() != geometry {
                return Err(RunError::Encode(format!(
                    "frame {} is {}, sink opened for {}",
                    report.frames_read,
                    frame.geometry(),
                    geometry
                )));
            }

            let annotated = self.annotator.annotate(frame)?;
            if annotated.geometry() != geometry {
                return Err(RunError::Inference(format!(
                    "{} returned a {} frame for a {} input",
                    self.annotator.name(),
                    annotated.geometry(),
                    geometry
                )));
            }

            sink.write(&annotated)?;
            report.frames_written += 1;
            resources.frames_written = report.frames_written;
            self.preview.show(&annotated);
            log::trace!("run: frame {} written", report.frames_written);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::PassthroughAnnotator;
    use crate::preview::{LatestFrameSlot, NullPreview};
    use crate::sink::{AviSummary, Codec};

    fn plan(dir: &std::path::Path, clip: &str) -> RunPlan {
        RunPlan {
            source: SourceSpec::File {
                path: PathBuf::from(clip),
            },
            output: OutputSettings {
                path: dir.join("out.avi"),
                codec: Codec::Raw,
                ..OutputSettings::default()
            },
        }
    }

    #[test]
    fn output_naming_the_input_is_refused_untouched() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("renders"))?;
        let input = dir.path().join("clip.avi");
        std::fs::write(&input, b"original footage")?;
        let plan = RunPlan {
            source: SourceSpec::File {
                path: input.clone(),
            },
            output: OutputSettings {
                path: dir.path().join("renders/../clip.avi"),
                ..OutputSettings::default()
            },
        };
        assert!(plan.output_overwrites_input());
        let mut annotator = PassthroughAnnotator::new();

        let report =
            RunLoop::new(&LocalMedia, &mut annotator, &NullPreview, CancelToken::new()).run(&plan);

        assert_eq!(report.state, RunState::Failed);
        assert!(matches!(report.error, Some(RunError::Encode(_))));
        assert_eq!(std::fs::read(&input)?, b"original footage");

        let elsewhere = RunPlan {
            output: OutputSettings {
                path: dir.path().join("renders/out.avi"),
                ..OutputSettings::default()
            },
            ..plan
        };
        assert!(!elsewhere.output_overwrites_input());
        Ok(())
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let handle = token.clone();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn only_finished_states_are_terminal() {
        assert!(!RunState::Idle.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert_eq!(serde_json::to_string(&RunState::Cancelled).unwrap(), "\"CANCELLED\"");
    }

    #[test]
    fn synthetic_clip_runs_to_completion() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let plan = plan(dir.path(), "stub://clip?frames=4&width=8&height=6&fps=12");
        let mut annotator = PassthroughAnnotator::new();
        let preview = LatestFrameSlot::new();

        let report = RunLoop::new(&LocalMedia, &mut annotator, &preview, CancelToken::new())
            .run(&plan);

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.frames_read, 4);
        assert_eq!(report.frames_written, 4);
        assert_eq!(report.frame_rate, Some(12.0));
        assert_eq!(preview.sequence(), 4);
        let artifact = report.artifact.expect("artifact offered");
        let summary = AviSummary::read(&artifact)?;
        assert_eq!(summary.frame_count(), 4);
        assert!((summary.frame_rate - 12.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn missing_file_fails_before_the_loop() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let plan = plan(dir.path(), "/definitely/not/here.mp4");
        let mut annotator = PassthroughAnnotator::new();

        let report =
            RunLoop::new(&LocalMedia, &mut annotator, &NullPreview, CancelToken::new()).run(&plan);

        assert_eq!(report.state, RunState::Failed);
        assert!(matches!(report.error, Some(RunError::SourceUnavailable(_))));
        assert!(report.artifact.is_none());
        assert!(!dir.path().join("out.avi").exists());
        assert_eq!(annotator.frames_seen(), 0);
        Ok(())
    }

    #[test]
    fn pre_cancelled_run_offers_empty_artifact() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let plan = plan(dir.path(), "stub://clip?frames=10");
        let mut annotator = PassthroughAnnotator::new();
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = RunLoop::new(&LocalMedia, &mut annotator, &NullPreview, cancel).run(&plan);

        assert_eq!(report.state, RunState::Cancelled);
        assert_eq!(report.frames_read, 0);
        let summary = AviSummary::read(report.artifact.expect("artifact offered"))?;
        assert_eq!(summary.frame_count(), 0);
        assert!(summary.is_finalized());
        Ok(())
    }
}

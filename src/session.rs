//! Single-user studio session.
//!
//! `Studio` holds what the web page manipulates between runs: the selected
//! video, the detector registry, the preview slot and the outcome of the last
//! run. A run executes on its own worker thread; the page polls `status` and
//! reads frames from the preview slot while it goes.
//!
//! One session, one run at a time. Starting while a run is active, or
//! replacing the upload under it, is refused.

use std::fs::File;
use std::io::{BufReader, Read};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::config::StudioConfig;
use crate::detect::{build_registry, AnnotatorRegistry, SharedAnnotator};
use crate::error::RunError;
use crate::frame::Geometry;
use crate::ingest::SourceSpec;
use crate::preview::LatestFrameSlot;
use crate::run::{CancelToken, LocalMedia, MediaFactory, RunLoop, RunPlan, RunReport, RunState};

/// Container extensions accepted by the upload control.
pub const UPLOAD_EXTENSIONS: [&str; 3] = ["mp4", "avi", "mov"];

/// Why a studio request was refused.
#[derive(Debug, Error)]
pub enum StudioError {
    #[error("a run is already in progress")]
    Busy,
    #[error("no source selected: upload a video or enable the camera")]
    NoSource,
    #[error("unknown detector '{0}'")]
    UnknownDetector(String),
    #[error("unsupported upload '{0}' (expected .mp4, .avi or .mov)")]
    UnsupportedUpload(String),
    #[error("upload exceeds {0} bytes")]
    UploadTooLarge(u64),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Controls of one start request.
#[derive(Clone, Debug, Default)]
pub struct StartRequest {
    /// Use the live camera; wins over an uploaded file.
    pub use_camera: bool,
    /// Detector override; the registry default when `None`.
    pub detector: Option<String>,
}

/// Snapshot of the session for the status endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct StudioStatus {
    pub state: RunState,
    pub detector: Option<String>,
    pub source: Option<String>,
    /// Frames written so far (running) or in total (finished).
    pub frames: u64,
    pub geometry: Option<Geometry>,
    pub frame_rate: Option<f64>,
    pub message: Option<String>,
    pub error_kind: Option<&'static str>,
    pub artifact_offered: bool,
    pub artifact_sha256: Option<String>,
    pub upload: Option<String>,
}

enum SelectedFile {
    Uploaded {
        name: String,
        file: NamedTempFile,
    },
    Local(PathBuf),
}

impl SelectedFile {
    fn path(&self) -> &Path {
        match self {
            Self::Uploaded { file, .. } => file.path(),
            Self::Local(path) => path,
        }
    }

    fn label(&self) -> String {
        match self {
            Self::Uploaded { name, .. } => name.clone(),
            Self::Local(path) => path.display().to_string(),
        }
    }
}

struct Finished {
    report: RunReport,
    artifact_sha256: Option<String>,
}

struct SessionState {
    state: RunState,
    selected: Option<SelectedFile>,
    detector: Option<String>,
    source: Option<String>,
    cancel: Option<CancelToken>,
    worker: Option<JoinHandle<()>>,
    finished: Option<Finished>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            state: RunState::Idle,
            selected: None,
            detector: None,
            source: None,
            cancel: None,
            worker: None,
            finished: None,
        }
    }
}

pub struct Studio {
    config: StudioConfig,
    media: Arc<dyn MediaFactory>,
    registry: AnnotatorRegistry,
    preview: LatestFrameSlot,
    session: Arc<Mutex<SessionState>>,
}

impl Studio {
    /// Studio over real files and cameras with the configured detectors.
    pub fn new(config: StudioConfig) -> Result<Self> {
        let registry = build_registry(&config.detector)?;
        Ok(Self::with_parts(config, registry, Arc::new(LocalMedia)))
    }

    pub fn with_parts(
        config: StudioConfig,
        registry: AnnotatorRegistry,
        media: Arc<dyn MediaFactory>,
    ) -> Self {
        Self {
            config,
            media,
            registry,
            preview: LatestFrameSlot::new(),
            session: Arc::new(Mutex::new(SessionState::new())),
        }
    }

    pub fn config(&self) -> &StudioConfig {
        &self.config
    }

    pub fn registry(&self) -> &AnnotatorRegistry {
        &self.registry
    }

    pub fn preview(&self) -> &LatestFrameSlot {
        &self.preview
    }

    fn lock(&self) -> Result<MutexGuard<'_, SessionState>> {
        self.session
            .lock()
            .map_err(|_| anyhow!("studio session lock poisoned"))
    }

    /// Store an uploaded video, replacing any previous one.
    ///
    /// At most `max_upload_bytes` are accepted; the temp file is deleted when
    /// it is replaced or the studio is dropped.
    pub fn store_upload(&self, name: &str, body: impl Read) -> Result<u64, StudioError> {
        let extension = upload_extension(name)
            .ok_or_else(|| StudioError::UnsupportedUpload(name.to_string()))?;
        if self.lock()?.state == RunState::Running {
            return Err(StudioError::Busy);
        }

        let limit = self.config.api.max_upload_bytes;
        let mut file = tempfile::Builder::new()
            .prefix("studio-upload-")
            .suffix(&format!(".{}", extension))
            .tempfile_in(&self.config.api.upload_dir)
            .with_context(|| {
                format!(
                    "create upload file in {}",
                    self.config.api.upload_dir.display()
                )
            })?;
        let written = std::io::copy(&mut body.take(limit + 1), file.as_file_mut())
            .context("store upload body")?;
        if written > limit {
            return Err(StudioError::UploadTooLarge(limit));
        }

        let mut session = self.lock()?;
        if session.state == RunState::Running {
            return Err(StudioError::Busy);
        }
        log::info!("studio: stored upload '{}' ({} bytes)", name, written);
        session.selected = Some(SelectedFile::Uploaded {
            name: name.to_string(),
            file,
        });
        Ok(written)
    }

    /// Select a local file (or `stub://` clip) instead of an upload.
    pub fn select_file(&self, path: impl Into<PathBuf>) -> Result<(), StudioError> {
        let mut session = self.lock()?;
        if session.state == RunState::Running {
            return Err(StudioError::Busy);
        }
        session.selected = Some(SelectedFile::Local(path.into()));
        Ok(())
    }

    /// Start a run on a worker thread.
    pub fn start(&self, request: StartRequest) -> Result<RunPlan, StudioError> {
        let mut session = self.lock()?;
        if session.state == RunState::Running {
            return Err(StudioError::Busy);
        }
        if let Some(previous) = session.worker.take() {
            // Already past its last use of the session lock.
            if previous.join().is_err() {
                log::error!("studio: previous run worker panicked");
            }
        }

        let file = session.selected.as_ref().map(|f| f.path().to_path_buf());
        let source = SourceSpec::resolve(request.use_camera, self.config.camera_index, file)
            .ok_or(StudioError::NoSource)?;
        let (detector, annotator) = self
            .registry
            .select(request.detector.as_deref())
            .map_err(|_| {
                StudioError::UnknownDetector(request.detector.clone().unwrap_or_default())
            })?;
        let plan = RunPlan {
            source,
            output: self.config.output.clone(),
        };

        let label = match (&plan.source, &session.selected) {
            (SourceSpec::File { .. }, Some(selected)) => selected.label(),
            (spec, _) => spec.to_string(),
        };
        let cancel = CancelToken::new();
        self.preview.clear();
        session.state = RunState::Running;
        session.detector = Some(detector.clone());
        session.source = Some(label);
        session.cancel = Some(cancel.clone());
        session.finished = None;

        let worker = RunWorker {
            media: Arc::clone(&self.media),
            annotator,
            preview: self.preview.clone(),
            cancel,
            plan: plan.clone(),
            session: Arc::clone(&self.session),
        };
        let handle = std::thread::Builder::new()
            .name("studio-run".to_string())
            .spawn(move || worker.run());
        match handle {
            Ok(handle) => session.worker = Some(handle),
            Err(err) => {
                session.state = RunState::Idle;
                session.cancel = None;
                return Err(StudioError::Internal(anyhow!("spawn run worker: {}", err)));
            }
        }
        log::info!("studio: started run on {} with {}", plan.source, detector);
        Ok(plan)
    }

    /// Ask the active run to stop. Returns `false` when nothing is running.
    pub fn stop(&self) -> Result<bool> {
        let session = self.lock()?;
        match (&session.state, &session.cancel) {
            (RunState::Running, Some(cancel)) => {
                cancel.cancel();
                log::info!("studio: stop requested");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn status(&self) -> Result<StudioStatus> {
        let session = self.lock()?;
        let mut status = StudioStatus {
            state: session.state,
            detector: session.detector.clone(),
            source: session.source.clone(),
            frames: self.preview.sequence(),
            geometry: None,
            frame_rate: None,
            message: None,
            error_kind: None,
            artifact_offered: false,
            artifact_sha256: None,
            upload: session.selected.as_ref().map(SelectedFile::label),
        };
        if let Some(finished) = &session.finished {
            let report = &finished.report;
            status.frames = report.frames_written;
            status.geometry = report.geometry;
            status.frame_rate = report.frame_rate;
            status.message = Some(report.summary());
            status.error_kind = report.error.as_ref().map(RunError::kind);
            status.artifact_offered = report.artifact.is_some();
            status.artifact_sha256 = finished.artifact_sha256.clone();
        }
        Ok(status)
    }

    /// Artifact of the last run, if it is offered for download.
    pub fn artifact(&self) -> Result<Option<PathBuf>> {
        let session = self.lock()?;
        Ok(session
            .finished
            .as_ref()
            .and_then(|finished| finished.report.artifact.clone()))
    }

    /// Cancel any active run and wait for its worker to release everything.
    pub fn shutdown(&self) -> Result<()> {
        let handle = {
            let mut session = self.lock()?;
            if let Some(cancel) = &session.cancel {
                cancel.cancel();
            }
            session.worker.take()
        };
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| anyhow!("run worker panicked during shutdown"))?;
        }
        Ok(())
    }

    /// Block until the active run (if any) finishes, returning the final status.
    pub fn wait(&self) -> Result<StudioStatus> {
        let handle = self.lock()?.worker.take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| anyhow!("run worker panicked"))?;
        }
        self.status()
    }
}

impl Drop for Studio {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("studio: shutdown failed: {:#}", err);
        }
    }
}

struct RunWorker {
    media: Arc<dyn MediaFactory>,
    annotator: SharedAnnotator,
    preview: LatestFrameSlot,
    cancel: CancelToken,
    plan: RunPlan,
    session: Arc<Mutex<SessionState>>,
}

impl RunWorker {
    fn run(self) {
        let report = self.execute();
        let artifact_sha256 = report.artifact.as_deref().and_then(|path| {
            file_sha256(path)
                .map_err(|err| log::warn!("studio: could not hash {}: {:#}", path.display(), err))
                .ok()
        });
        match self.session.lock() {
            Ok(mut session) => {
                session.state = report.state;
                session.cancel = None;
                session.finished = Some(Finished {
                    report,
                    artifact_sha256,
                });
            }
            Err(_) => log::error!("studio: session lock poisoned; run outcome lost"),
        }
    }

    fn execute(&self) -> RunReport {
        let mut annotator = match self.annotator.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("studio: detector lock poisoned by an earlier run; reusing it");
                poisoned.into_inner()
            }
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            RunLoop::new(
                self.media.as_ref(),
                &mut *annotator,
                &self.preview,
                self.cancel.clone(),
            )
            .run(&self.plan)
        }));
        outcome.unwrap_or_else(|_| {
            log::error!("studio: run panicked; resources were released during unwind");
            RunReport::failed(RunError::Inference("detector panicked".to_string()))
        })
    }
}

fn upload_extension(name: &str) -> Option<String> {
    let extension = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    UPLOAD_EXTENSIONS
        .contains(&extension.as_str())
        .then_some(extension)
}

fn file_sha256(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StudioConfig;
    use crate::detect::PassthroughAnnotator;
    use crate::sink::Codec;

    fn studio(dir: &Path) -> Studio {
        let mut config = StudioConfig::default();
        config.output.path = dir.join("output.avi");
        config.output.codec = Codec::Raw;
        config.api.upload_dir = dir.to_path_buf();
        config.api.max_upload_bytes = 16;
        let mut registry = AnnotatorRegistry::new();
        registry.register(PassthroughAnnotator::new());
        Studio::with_parts(config, registry, Arc::new(LocalMedia))
    }

    #[test]
    fn upload_extension_is_checked() {
        assert_eq!(upload_extension("clip.MP4").as_deref(), Some("mp4"));
        assert_eq!(upload_extension("clip.mov").as_deref(), Some("mov"));
        assert!(upload_extension("clip.mkv").is_none());
        assert!(upload_extension("clip").is_none());
    }

    #[test]
    fn oversized_upload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let studio = studio(dir.path());
        let err = studio
            .store_upload("big.mp4", &[0u8; 17][..])
            .unwrap_err();
        assert!(matches!(err, StudioError::UploadTooLarge(16)));
        assert!(studio.status().unwrap().upload.is_none());

        assert_eq!(studio.store_upload("small.mp4", &[0u8; 16][..]).unwrap(), 16);
        assert_eq!(studio.status().unwrap().upload.as_deref(), Some("small.mp4"));
    }

    #[test]
    fn start_without_source_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let studio = studio(dir.path());
        assert!(matches!(
            studio.start(StartRequest::default()),
            Err(StudioError::NoSource)
        ));
        assert_eq!(studio.status().unwrap().state, RunState::Idle);
    }

    #[test]
    fn unknown_detector_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let studio = studio(dir.path());
        studio.select_file("stub://clip?frames=1").unwrap();
        let err = studio
            .start(StartRequest {
                detector: Some("yolov9".to_string()),
                ..StartRequest::default()
            })
            .unwrap_err();
        assert!(matches!(err, StudioError::UnknownDetector(name) if name == "yolov9"));
    }

    #[test]
    fn finished_run_offers_artifact_with_digest() {
        let dir = tempfile::tempdir().unwrap();
        let studio = studio(dir.path());
        studio
            .select_file("stub://clip?frames=3&width=8&height=8")
            .unwrap();
        studio.start(StartRequest::default()).unwrap();
        let status = studio.wait().unwrap();

        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.frames, 3);
        assert!(status.artifact_offered);
        assert_eq!(status.artifact_sha256.as_ref().map(String::len), Some(64));
        assert_eq!(studio.artifact().unwrap(), Some(dir.path().join("output.avi")));
        assert!(!studio.stop().unwrap());
    }

    #[test]
    fn failed_run_offers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let studio = studio(dir.path());
        studio.select_file(dir.path().join("missing.mp4")).unwrap();
        studio.start(StartRequest::default()).unwrap();
        let status = studio.wait().unwrap();

        assert_eq!(status.state, RunState::Failed);
        assert_eq!(status.error_kind, Some("source_unavailable"));
        assert!(status.message.is_some());
        assert!(!status.artifact_offered);
        assert!(studio.artifact().unwrap().is_none());
    }

    struct CrashingDetector;

    impl crate::detect::Annotator for CrashingDetector {
        fn name(&self) -> &'static str {
            "crashing"
        }

        fn annotate(
            &mut self,
            _frame: crate::frame::Frame,
        ) -> crate::error::RunResult<crate::frame::Frame> {
            panic!("model crashed");
        }
    }

    #[test]
    fn detector_panic_on_first_frame_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StudioConfig::default();
        config.output.path = dir.path().join("output.avi");
        config.output.codec = Codec::Raw;
        let mut registry = AnnotatorRegistry::new();
        registry.register(CrashingDetector);
        let studio = Studio::with_parts(config, registry, Arc::new(LocalMedia));
        studio
            .select_file("stub://clip?frames=3&width=8&height=8")
            .unwrap();
        studio.start(StartRequest::default()).unwrap();
        let status = studio.wait().unwrap();

        assert_eq!(status.state, RunState::Failed);
        assert_eq!(status.error_kind, Some("inference_error"));
        assert!(!status.artifact_offered);
        assert!(!dir.path().join("output.avi").exists());
    }
}

//! Detection Studio
//!
//! Annotates an uploaded video or a live camera feed with object detections,
//! shows the annotated frames as they are produced, and writes them to a
//! downloadable AVI file.
//!
//! # Architecture
//!
//! One run wires four components together, leaves first:
//!
//! 1. **Source** (`ingest`): a camera or local file yielding BGR frames.
//! 2. **Detector** (`detect`): `annotate(Frame) -> Frame`, boxes burned in.
//! 3. **Sink** (`sink`): appends frames to an AVI container at a fixed rate.
//! 4. **Preview** (`preview`): the latest annotated frame, as RGB.
//!
//! `run::RunLoop` drives them one frame at a time and guarantees that the
//! sink is finalized and the source released exactly once on every exit.
//! `session::Studio` runs loops on a worker thread for the web page served by
//! `api`.
//!
//! # Module Structure
//!
//! - `frame`: Frame, Geometry, channel order
//! - `error`: run failure taxonomy
//! - `config`: studio settings (file + env)
//! - `ui`: terminal stages and progress for the CLI tools

pub mod api;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod preview;
pub mod run;
pub mod session;
pub mod sink;
pub mod ui;

pub use config::StudioConfig;
pub use detect::{Annotator, AnnotatorRegistry, Detection};
pub use error::{RunError, RunResult};
pub use frame::{ChannelOrder, Frame, Geometry};
pub use ingest::{open_source, FrameSource, SourceSpec, DEFAULT_FRAME_RATE};
pub use preview::{LatestFrameSlot, LivePreview, NullPreview};
pub use run::{CancelToken, LocalMedia, MediaFactory, RunLoop, RunPlan, RunReport, RunState};
pub use session::{StartRequest, Studio, StudioError, StudioStatus};
pub use sink::{open_sink, AviSummary, Codec, FrameSink, OutputSettings};

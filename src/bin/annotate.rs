//! annotate - one-shot annotation run from the command line
//!
//! Reads a video file (or the camera), annotates every frame with the chosen
//! detector and writes the AVI artifact. Ctrl-C stops the run; the frames
//! written so far are still finalized into a playable file.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use detection_studio::detect::build_registry;
use detection_studio::{
    CancelToken, Codec, LocalMedia, RunLoop, RunPlan, RunState, SourceSpec, StudioConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Video file to annotate (or a stub:// clip).
    input: Option<PathBuf>,
    /// Read from the camera instead; wins over INPUT.
    #[arg(long)]
    camera: bool,
    /// Camera index (0 = system default).
    #[arg(long, env = "STUDIO_CAMERA_INDEX")]
    camera_index: Option<u32>,
    /// Output AVI path.
    #[arg(long, short)]
    output: Option<PathBuf>,
    /// Output codec (MJPG, DIB, or XVID with the ingest-file-ffmpeg feature).
    #[arg(long)]
    codec: Option<Codec>,
    /// Frame rate used when the source does not report one.
    #[arg(long)]
    default_fps: Option<f64>,
    /// Detector backend (yolov8, motion, passthrough).
    #[arg(long)]
    detector: Option<String>,
    /// ONNX model for the yolov8 detector.
    #[arg(long)]
    model: Option<PathBuf>,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let ui = detection_studio::ui::Ui::from_args(Some(&args.ui), is_tty, false);

    let mut config = StudioConfig::load()?;
    if let Some(output) = args.output {
        config.output.path = output;
    }
    if let Some(codec) = args.codec {
        config.output.codec = codec;
    }
    if let Some(fps) = args.default_fps {
        if !(fps.is_finite() && fps > 0.0) {
            return Err(anyhow!("--default-fps must be greater than zero"));
        }
        config.output.default_fps = fps;
    }
    if let Some(backend) = &args.detector {
        config.detector.backend = backend.trim().to_lowercase();
    }
    if let Some(model) = args.model {
        config.detector.model_path = model;
    }
    let camera_index = args.camera_index.unwrap_or(config.camera_index);

    let source = SourceSpec::resolve(args.camera, camera_index, args.input)
        .ok_or_else(|| anyhow!("no source: pass a video file or --camera"))?;

    let (detector, annotator) = {
        let _stage = ui.stage("Load detector");
        let registry = build_registry(&config.detector)?;
        registry.select(None)?
    };

    let plan = RunPlan {
        source,
        output: config.output.clone(),
    };
    if plan.output_overwrites_input() {
        return Err(anyhow!(
            "output {} would overwrite the input; choose another -o",
            plan.output.path.display()
        ));
    }
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let progress = ui.frame_progress(&format!("{} -> {}", plan.source, detector));
    let report = {
        let mut annotator = annotator
            .lock()
            .map_err(|_| anyhow!("detector lock poisoned"))?;
        RunLoop::new(&LocalMedia, &mut *annotator, &progress, cancel).run(&plan)
    };
    progress.finish(&report.summary());

    match (report.state, &report.artifact) {
        (RunState::Failed, _) => Err(anyhow!(report.summary())),
        (_, Some(path)) => {
            println!("{}", path.display());
            Ok(())
        }
        (state, None) => Err(anyhow!("run ended {} without an artifact", state)),
    }
}

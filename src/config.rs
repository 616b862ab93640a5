use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::sink::{Codec, OutputSettings};

const DEFAULT_OUTPUT_PATH: &str = "output.avi";
const DEFAULT_CODEC: Codec = Codec::Mjpeg;
const DEFAULT_FPS: f64 = crate::ingest::DEFAULT_FRAME_RATE;
const DEFAULT_MJPEG_QUALITY: u8 = 90;
const DEFAULT_CAMERA_INDEX: u32 = 0;
#[cfg(feature = "backend-tract")]
const DEFAULT_DETECTOR: &str = "yolov8";
#[cfg(not(feature = "backend-tract"))]
const DEFAULT_DETECTOR: &str = "motion";
const DEFAULT_MODEL_PATH: &str = "yolov8n.onnx";
const DEFAULT_CONFIDENCE: f32 = 0.25;
const DEFAULT_IOU: f32 = 0.45;
const DEFAULT_API_ADDR: &str = "127.0.0.1:8501";
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 512 * 1024 * 1024;
const DEFAULT_PREVIEW_QUALITY: u8 = 80;

#[derive(Debug, Deserialize, Default)]
struct StudioConfigFile {
    output_path: Option<PathBuf>,
    codec: Option<String>,
    default_fps: Option<f64>,
    mjpeg_quality: Option<u8>,
    camera_index: Option<u32>,
    detector: Option<DetectorConfigFile>,
    api: Option<ApiConfigFile>,
    preview: Option<PreviewConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    confidence: Option<f32>,
    iou: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    upload_dir: Option<PathBuf>,
    max_upload_bytes: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PreviewConfigFile {
    jpeg_quality: Option<u8>,
}

/// Studio settings: defaults, then `STUDIO_CONFIG` file, then `STUDIO_*` env.
#[derive(Debug, Clone, PartialEq)]
pub struct StudioConfig {
    pub output: OutputSettings,
    pub camera_index: u32,
    pub detector: DetectorSettings,
    pub api: ApiSettings,
    pub preview: PreviewSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    /// Default backend; see `detect::BACKEND_NAMES`.
    pub backend: String,
    pub model_path: PathBuf,
    pub confidence: f32,
    pub iou: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiSettings {
    pub addr: String,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreviewSettings {
    pub jpeg_quality: u8,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_DETECTOR.to_string(),
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            confidence: DEFAULT_CONFIDENCE,
            iou: DEFAULT_IOU,
        }
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            addr: DEFAULT_API_ADDR.to_string(),
            upload_dir: std::env::temp_dir(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            jpeg_quality: DEFAULT_PREVIEW_QUALITY,
        }
    }
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            output: OutputSettings {
                path: PathBuf::from(DEFAULT_OUTPUT_PATH),
                codec: DEFAULT_CODEC,
                default_fps: DEFAULT_FPS,
                jpeg_quality: DEFAULT_MJPEG_QUALITY,
            },
            camera_index: DEFAULT_CAMERA_INDEX,
            detector: DetectorSettings::default(),
            api: ApiSettings::default(),
            preview: PreviewSettings::default(),
        }
    }
}

impl StudioConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("STUDIO_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: StudioConfigFile) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(path) = file.output_path {
            cfg.output.path = path;
        }
        if let Some(codec) = file.codec {
            cfg.output.codec = codec.parse()?;
        }
        if let Some(fps) = file.default_fps {
            cfg.output.default_fps = fps;
        }
        if let Some(quality) = file.mjpeg_quality {
            cfg.output.jpeg_quality = quality;
        }
        if let Some(index) = file.camera_index {
            cfg.camera_index = index;
        }
        if let Some(detector) = file.detector {
            if let Some(backend) = detector.backend {
                cfg.detector.backend = backend;
            }
            if let Some(path) = detector.model_path {
                cfg.detector.model_path = path;
            }
            if let Some(confidence) = detector.confidence {
                cfg.detector.confidence = confidence;
            }
            if let Some(iou) = detector.iou {
                cfg.detector.iou = iou;
            }
        }
        if let Some(api) = file.api {
            if let Some(addr) = api.addr {
                cfg.api.addr = addr;
            }
            if let Some(dir) = api.upload_dir {
                cfg.api.upload_dir = dir;
            }
            if let Some(max) = api.max_upload_bytes {
                cfg.api.max_upload_bytes = max;
            }
        }
        if let Some(quality) = file.preview.and_then(|preview| preview.jpeg_quality) {
            cfg.preview.jpeg_quality = quality;
        }
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_value("STUDIO_OUTPUT_PATH") {
            self.output.path = PathBuf::from(path);
        }
        if let Some(codec) = env_value("STUDIO_CODEC") {
            self.output.codec = codec
                .parse()
                .map_err(|e| anyhow!("STUDIO_CODEC: {}", e))?;
        }
        if let Some(fps) = env_value("STUDIO_DEFAULT_FPS") {
            self.output.default_fps = fps
                .parse()
                .map_err(|_| anyhow!("STUDIO_DEFAULT_FPS must be a number"))?;
        }
        if let Some(index) = env_value("STUDIO_CAMERA_INDEX") {
            self.camera_index = index
                .parse()
                .map_err(|_| anyhow!("STUDIO_CAMERA_INDEX must be a non-negative integer"))?;
        }
        if let Some(backend) = env_value("STUDIO_DETECTOR") {
            self.detector.backend = backend;
        }
        if let Some(path) = env_value("STUDIO_MODEL_PATH") {
            self.detector.model_path = PathBuf::from(path);
        }
        if let Some(addr) = env_value("STUDIO_API_ADDR") {
            self.api.addr = addr;
        }
        if let Some(dir) = env_value("STUDIO_UPLOAD_DIR") {
            self.api.upload_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if !(self.output.default_fps.is_finite() && self.output.default_fps > 0.0) {
            return Err(anyhow!("default_fps must be greater than zero"));
        }
        if !self.output.codec.is_available() {
            return Err(anyhow!(
                "codec {} requires the ingest-file-ffmpeg feature",
                self.output.codec
            ));
        }
        if !(1..=100).contains(&self.output.jpeg_quality) {
            return Err(anyhow!("mjpeg_quality must be between 1 and 100"));
        }
        self.detector.backend = self.detector.backend.trim().to_lowercase();
        if !crate::detect::BACKEND_NAMES.contains(&self.detector.backend.as_str()) {
            return Err(anyhow!(
                "unknown detector backend '{}' (expected one of {:?})",
                self.detector.backend,
                crate::detect::BACKEND_NAMES
            ));
        }
        for (name, value) in [
            ("detector.confidence", self.detector.confidence),
            ("detector.iou", self.detector.iou),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(anyhow!("{} must be in (0, 1], got {}", name, value));
            }
        }
        if self.api.max_upload_bytes == 0 {
            return Err(anyhow!("api.max_upload_bytes must be greater than zero"));
        }
        if !(1..=100).contains(&self.preview.jpeg_quality) {
            return Err(anyhow!("preview.jpeg_quality must be between 1 and 100"));
        }
        Ok(())
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_config_file(path: &Path) -> Result<StudioConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let mut cfg = StudioConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.output.path, PathBuf::from("output.avi"));
        assert_eq!(cfg.output.codec, Codec::Mjpeg);
        assert_eq!(cfg.output.default_fps, 20.0);
        assert_eq!(cfg.api.addr, "127.0.0.1:8501");
    }

    #[test]
    fn file_values_override_defaults() {
        let file: StudioConfigFile = toml::from_str(
            r#"
            codec = "DIB"
            default_fps = 12.5

            [detector]
            backend = "passthrough"
            iou = 0.5
            "#,
        )
        .unwrap();
        let cfg = StudioConfig::from_file(file).unwrap();
        assert_eq!(cfg.output.codec, Codec::Raw);
        assert_eq!(cfg.output.default_fps, 12.5);
        assert_eq!(cfg.detector.backend, "passthrough");
        assert_eq!(cfg.detector.iou, 0.5);
        assert_eq!(cfg.detector.confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn unknown_codec_in_file_is_rejected() {
        let file = StudioConfigFile {
            codec: Some("H264".to_string()),
            ..StudioConfigFile::default()
        };
        assert!(StudioConfig::from_file(file).is_err());
    }

    #[test]
    fn out_of_range_thresholds_are_rejected() {
        let mut cfg = StudioConfig::default();
        cfg.detector.confidence = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = StudioConfig::default();
        cfg.detector.iou = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn backend_names_are_normalized() {
        let mut cfg = StudioConfig::default();
        cfg.detector.backend = " Motion ".to_string();
        cfg.validate().unwrap();
        assert_eq!(cfg.detector.backend, "motion");
    }
}

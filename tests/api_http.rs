use anyhow::{anyhow, Result};
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};

use detection_studio::api::{ApiHandle, ApiServer};
use detection_studio::detect::{MotionAnnotator, PassthroughAnnotator};
use detection_studio::ingest::FileSource;
use detection_studio::{
    AnnotatorRegistry, AviSummary, Codec, FrameSink, FrameSource, Geometry, LocalMedia,
    MediaFactory, OutputSettings, RunResult, SourceSpec, Studio, StudioConfig,
};

/// Every file source becomes a synthetic clip, so uploads need no decoder.
struct SyntheticMedia {
    frames: u64,
}

impl MediaFactory for SyntheticMedia {
    fn open_source(&self, spec: &SourceSpec) -> RunResult<Box<dyn FrameSource>> {
        match spec {
            SourceSpec::File { .. } => Ok(Box::new(FileSource::open(format!(
                "stub://clip?frames={}&width=16&height=12&fps=10",
                self.frames
            ))?)),
            SourceSpec::Camera { .. } => LocalMedia.open_source(spec),
        }
    }

    fn open_sink(
        &self,
        output: &OutputSettings,
        frame_rate: f64,
        geometry: Geometry,
    ) -> RunResult<Box<dyn FrameSink>> {
        LocalMedia.open_sink(output, frame_rate, geometry)
    }
}

struct TestApi {
    dir: TempDir,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(frames: u64, max_upload_bytes: u64) -> Result<Self> {
        let dir = tempdir()?;
        let mut config = StudioConfig::default();
        config.output.path = dir.path().join("output.avi");
        config.output.codec = Codec::Raw;
        config.api.upload_dir = dir.path().to_path_buf();
        config.api.max_upload_bytes = max_upload_bytes;

        let mut registry = AnnotatorRegistry::new();
        registry.register(PassthroughAnnotator::new());
        registry.register(MotionAnnotator::new());
        let studio = Studio::with_parts(config, registry, Arc::new(SyntheticMedia { frames }));
        let api_handle = ApiServer::new(Arc::new(studio))
            .with_addr("127.0.0.1:0")
            .spawn()?;

        Ok(Self {
            dir,
            api_handle: Some(api_handle),
        })
    }

    fn addr(&self) -> SocketAddr {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
            .addr
    }

    fn request(&self, method: &str, path: &str, body: &[u8]) -> Result<(String, Vec<u8>)> {
        let mut stream = TcpStream::connect(self.addr())?;
        let head = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes())?;
        stream.write_all(body)?;
        let mut response = Vec::new();
        stream.read_to_end(&mut response)?;
        let split = response
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .ok_or_else(|| anyhow!("response without header terminator"))?;
        let headers = String::from_utf8_lossy(&response[..split]).to_string();
        Ok((headers, response[split + 4..].to_vec()))
    }

    fn json(&self, method: &str, path: &str, body: &[u8]) -> Result<(String, Value)> {
        let (headers, body) = self.request(method, path, body)?;
        Ok((headers, serde_json::from_slice(&body)?))
    }

    fn wait_until_finished(&self) -> Result<Value> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let (_, status) = self.json("GET", "/status", b"")?;
            if status["state"] != "RUNNING" {
                return Ok(status);
            }
            if Instant::now() > deadline {
                return Err(anyhow!("run did not finish: {}", status));
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

#[test]
fn health_and_page_are_served() -> Result<()> {
    let api = TestApi::new(3, 1024)?;

    let (headers, body) = api.json("GET", "/health", b"")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body["status"], "ok");

    let (headers, page) = api.request("GET", "/", b"")?;
    assert!(headers.contains("text/html"));
    assert!(String::from_utf8_lossy(&page).contains("Detection Studio"));
    Ok(())
}

#[test]
fn detectors_lists_registry_with_default() -> Result<()> {
    let api = TestApi::new(3, 1024)?;
    let (_, body) = api.json("GET", "/detectors", b"")?;
    assert_eq!(body["default"], "passthrough");
    assert_eq!(body["detectors"], serde_json::json!(["motion", "passthrough"]));
    Ok(())
}

#[test]
fn start_without_source_is_a_bad_request() -> Result<()> {
    let api = TestApi::new(3, 1024)?;
    let (headers, body) = api.json("POST", "/start", b"")?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(body["error"], "no_source");

    let (_, status) = api.json("GET", "/status", b"")?;
    assert_eq!(status["state"], "IDLE");
    Ok(())
}

#[test]
fn uploads_are_checked_for_type_and_size() -> Result<()> {
    let api = TestApi::new(3, 8)?;

    let (headers, body) = api.json("POST", "/upload?name=notes.txt", b"hello")?;
    assert!(headers.contains("415"));
    assert_eq!(body["error"], "unsupported_upload");

    let (headers, body) = api.json("POST", "/upload?name=clip.mp4", b"0123456789")?;
    assert!(headers.contains("413"));
    assert_eq!(body["error"], "upload_too_large");

    let (headers, body) = api.json("POST", "/upload", b"0123")?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(body["error"], "missing_name");
    Ok(())
}

#[test]
fn upload_run_and_download() -> Result<()> {
    let api = TestApi::new(4, 1024)?;

    let (_, missing) = api.json("GET", "/output", b"")?;
    assert_eq!(missing["error"], "no_artifact");
    let (headers, _) = api.request("GET", "/preview.jpg", b"")?;
    assert!(headers.contains("204 No Content"));

    let (headers, body) = api.json("POST", "/upload?name=my%20clip.mp4", b"not really mp4")?;
    assert!(headers.contains("200 OK"), "{}", headers);
    assert_eq!(body["name"], "my clip.mp4");
    assert_eq!(body["bytes"], 14);

    let (headers, _) = api.json("POST", "/start?detector=passthrough", b"")?;
    assert!(headers.contains("200 OK"), "{}", headers);

    let status = api.wait_until_finished()?;
    assert_eq!(status["state"], "COMPLETED");
    assert_eq!(status["frames"], 4);
    assert_eq!(status["detector"], "passthrough");
    assert_eq!(status["source"], "my clip.mp4");
    assert_eq!(status["artifact_offered"], true);
    assert_eq!(status["artifact_sha256"].as_str().map(str::len), Some(64));

    let (headers, jpeg) = api.request("GET", "/preview.jpg", b"")?;
    assert!(headers.contains("image/jpeg"));
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

    let (headers, video) = api.request("GET", "/output", b"")?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("video/avi"));
    assert!(headers.contains(r#"attachment; filename="output.avi""#));
    assert_eq!(&video[..4], b"RIFF");
    let summary = AviSummary::parse(&video)?;
    assert_eq!(summary.frame_count(), 4);
    assert!(api.dir.path().join("output.avi").exists());
    Ok(())
}

#[test]
fn second_start_conflicts_and_stop_cancels() -> Result<()> {
    let api = TestApi::new(u32::MAX as u64, 1024)?;
    api.json("POST", "/upload?name=long.avi", b"x")?;

    let (headers, _) = api.json("POST", "/start", b"")?;
    assert!(headers.contains("200 OK"));
    let (headers, body) = api.json("POST", "/start", b"")?;
    assert!(headers.contains("409 Conflict"));
    assert_eq!(body["error"], "run_in_progress");
    let (headers, _) = api.json("POST", "/upload?name=other.mp4", b"y")?;
    assert!(headers.contains("409 Conflict"));

    let (_, body) = api.json("POST", "/stop", b"")?;
    assert_eq!(body["stopping"], true);
    let status = api.wait_until_finished()?;
    assert_eq!(status["state"], "CANCELLED");
    assert_eq!(status["artifact_offered"], true);

    let (headers, _) = api.request("GET", "/output", b"")?;
    assert!(headers.contains("200 OK"));
    Ok(())
}

#[test]
fn unknown_routes_and_methods_are_rejected() -> Result<()> {
    let api = TestApi::new(1, 1024)?;
    let (headers, _) = api.json("GET", "/nope", b"")?;
    assert!(headers.contains("404 Not Found"));
    let (headers, _) = api.json("GET", "/start", b"")?;
    assert!(headers.contains("405 Method Not Allowed"));
    let (headers, body) = api.json("POST", "/start?detector=resnet&camera=0", b"")?;
    assert!(headers.contains("400 Bad Request"));
    assert!(body["error"] == "no_source" || body["error"] == "unknown_detector");
    Ok(())
}

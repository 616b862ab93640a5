//! Studio web surface.
//!
//! A blocking HTTP/1.1 server on a plain `TcpListener`, one connection at a
//! time. It serves the page and the JSON controls the page calls:
//!
//! | Route | |
//! |---|---|
//! | `GET /` | page |
//! | `GET /health` | liveness |
//! | `GET /status` | session snapshot |
//! | `GET /detectors` | registered detectors |
//! | `POST /upload?name=F` | store the request body as the selected video |
//! | `POST /start?camera=B&detector=D` | start a run |
//! | `POST /stop` | cancel the active run |
//! | `GET /preview.jpg` | latest annotated frame |
//! | `GET /output` | finished artifact |
//!
//! Bound to loopback by default; when it is, non-loopback peers get 403.

mod page;

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::session::{StartRequest, Studio, StudioError};

const MAX_HEADER_BYTES: usize = 8192;
const HEADER_TIMEOUT: Duration = Duration::from_secs(2);
const BODY_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_NAME: &str = "output.avi";

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    addr: String,
    studio: Arc<Studio>,
}

impl ApiServer {
    /// Server for `studio`, listening on the studio's configured address.
    pub fn new(studio: Arc<Studio>) -> Self {
        let addr = studio.config().api.addr.clone();
        Self { addr, studio }
    }

    /// Override the listen address (`127.0.0.1:0` in tests).
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let studio = self.studio;
        let join = std::thread::Builder::new()
            .name("studio-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, &studio, shutdown_thread) {
                    log::error!("studio api stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, studio: &Studio, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, studio) {
                    log::warn!("studio api request rejected: {:#}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, studio: &Studio) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_error(&mut stream, 403, "forbidden")?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    log::debug!("studio api: {} {}", request.method, request.path);
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/") => write_response(
            &mut stream,
            200,
            "text/html; charset=utf-8",
            page::INDEX_HTML.as_bytes(),
        ),
        ("GET", "/health") => write_response(
            &mut stream,
            200,
            "application/json",
            br#"{"status":"ok"}"#,
        ),
        ("GET", "/status") => write_json(&mut stream, 200, &studio.status()?),
        ("GET", "/detectors") => {
            let registry = studio.registry();
            write_json(
                &mut stream,
                200,
                &DetectorList {
                    detectors: registry.list(),
                    default: registry.default_name().map(str::to_string),
                },
            )
        }
        ("POST", "/upload") => handle_upload(&mut stream, studio, &request),
        ("POST", "/start") => {
            let start = StartRequest {
                use_camera: request.query_flag("camera"),
                detector: request
                    .query("detector")
                    .filter(|name| !name.is_empty())
                    .map(str::to_string),
            };
            match studio.start(start) {
                Ok(plan) => write_json(
                    &mut stream,
                    200,
                    &Started {
                        started: true,
                        source: plan.source.to_string(),
                    },
                ),
                Err(err) => write_studio_error(&mut stream, err),
            }
        }
        ("POST", "/stop") => {
            let stopping = studio.stop()?;
            write_json(&mut stream, 200, &Stopped { stopping })
        }
        ("GET", "/preview.jpg") => {
            match studio
                .preview()
                .latest_jpeg(studio.config().preview.jpeg_quality)?
            {
                Some(jpeg) => write_response(&mut stream, 200, "image/jpeg", &jpeg),
                None => write_response(&mut stream, 204, "image/jpeg", &[]),
            }
        }
        ("GET", "/output") => match studio.artifact()? {
            Some(path) => {
                let mut file = File::open(&path)
                    .map_err(|e| anyhow!("open artifact {}: {}", path.display(), e))?;
                let len = file.metadata()?.len();
                write_head(
                    &mut stream,
                    200,
                    "video/avi",
                    len,
                    &[(
                        "Content-Disposition",
                        &format!("attachment; filename=\"{}\"", DOWNLOAD_NAME),
                    )],
                )?;
                std::io::copy(&mut file, &mut stream)?;
                Ok(())
            }
            None => write_json_error(&mut stream, 404, "no_artifact"),
        },
        (_, "/" | "/health" | "/status" | "/detectors" | "/upload" | "/start" | "/stop"
        | "/preview.jpg" | "/output") => write_json_error(&mut stream, 405, "method_not_allowed"),
        _ => write_json_error(&mut stream, 404, "not_found"),
    }
}

fn handle_upload(stream: &mut TcpStream, studio: &Studio, request: &HttpRequest) -> Result<()> {
    let Some(name) = request.query("name").map(str::to_string) else {
        return write_json_error(stream, 400, "missing_name");
    };
    let Some(length) = request.content_length() else {
        return write_json_error(stream, 411, "length_required");
    };
    let limit = studio.config().api.max_upload_bytes;
    if length > limit {
        return write_json_error(stream, 413, "upload_too_large");
    }

    stream.set_read_timeout(Some(BODY_TIMEOUT))?;
    let buffered = request.body_prefix.len() as u64;
    let prefix = Cursor::new(request.body_prefix.as_slice());
    let rest = (&*stream).take(length.saturating_sub(buffered));
    let body = prefix.take(length).chain(rest);
    match studio.store_upload(&name, body) {
        Ok(bytes) if bytes == length => write_json(stream, 200, &Uploaded { name, bytes }),
        Ok(bytes) => Err(anyhow!(
            "upload '{}' truncated: {} of {} bytes received",
            name,
            bytes,
            length
        )),
        Err(err) => write_studio_error(stream, err),
    }
}

#[derive(Serialize)]
struct DetectorList {
    detectors: Vec<String>,
    default: Option<String>,
}

#[derive(Serialize)]
struct Started {
    started: bool,
    source: String,
}

#[derive(Serialize)]
struct Stopped {
    stopping: bool,
}

#[derive(Serialize)]
struct Uploaded {
    name: String,
    bytes: u64,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

fn write_studio_error(stream: &mut TcpStream, err: StudioError) -> Result<()> {
    let (status, code) = match &err {
        StudioError::Busy => (409, "run_in_progress"),
        StudioError::NoSource => (400, "no_source"),
        StudioError::UnknownDetector(_) => (400, "unknown_detector"),
        StudioError::UnsupportedUpload(_) => (415, "unsupported_upload"),
        StudioError::UploadTooLarge(_) => (413, "upload_too_large"),
        StudioError::Internal(_) => (500, "internal"),
    };
    log::warn!("studio api: {} ({})", err, status);
    write_json(
        stream,
        status,
        &ErrorBody {
            error: code,
            message: Some(err.to_string()),
        },
    )
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(HEADER_TIMEOUT))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
    };
    let body_prefix = data.split_off(header_end + 4);
    let text = String::from_utf8_lossy(&data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    };
    let query = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        headers,
        query,
        body_prefix,
    })
}

fn write_json<T: Serialize>(stream: &mut TcpStream, status: u16, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_json_error(stream: &mut TcpStream, status: u16, code: &str) -> Result<()> {
    write_json(
        stream,
        status,
        &ErrorBody {
            error: code,
            message: None,
        },
    )
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    write_head(stream, status, content_type, body.len() as u64, &[])?;
    stream.write_all(body)?;
    Ok(())
}

fn write_head(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    len: u64,
    extra: &[(&str, &str)],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        411 => "HTTP/1.1 411 Length Required",
        413 => "HTTP/1.1 413 Payload Too Large",
        415 => "HTTP/1.1 415 Unsupported Media Type",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let mut header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n",
    );
    for (name, value) in extra {
        header.push_str(&format!("{}: {}\r\n", name, value));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    query: HashMap<String, String>,
    /// Body bytes that arrived together with the headers.
    body_prefix: Vec<u8>,
}

impl HttpRequest {
    fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    fn query_flag(&self, key: &str) -> bool {
        matches!(
            self.query(key).map(|v| v.to_ascii_lowercase()).as_deref(),
            Some("1" | "true" | "on" | "yes")
        )
    }

    fn content_length(&self) -> Option<u64> {
        self.headers.get("content-length")?.parse().ok()
    }
}

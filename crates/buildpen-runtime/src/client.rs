//! Minimal LXD REST client over the daemon's unix socket.
//!
//! We speak just enough HTTP/1.1 for the handful of endpoints the LXD
//! backend needs: JSON requests and responses, async operation waiting, and
//! streamed file push/pull. One connection per request with
//! `Connection: close` keeps the framing simple.

use crate::BackendError;
use serde_json::{json, Value};
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use tracing::debug;

/// LXD status code for a running instance.
pub const LXD_RUNNING: i64 = 103;

/// Chunk size for streaming file pulls.
const PULL_CHUNK: usize = 64 * 1024;

pub struct LxdClient {
    socket_path: PathBuf,
}

struct HttpResponse {
    status: u16,
    body: HttpBody<BufReader<UnixStream>>,
}

impl LxdClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    fn connect(&self) -> Result<UnixStream, BackendError> {
        Ok(UnixStream::connect(&self.socket_path)?)
    }

    /// Send one request and parse the response headers. `body` is either
    /// in-memory bytes or a file streamed with a known length.
    fn request(
        &self,
        method: &str,
        path: &str,
        headers: &[(String, String)],
        body: RequestBody<'_>,
    ) -> Result<HttpResponse, BackendError> {
        let stream = self.connect()?;
        let mut writer = stream.try_clone()?;

        let mut head = format!(
            "{method} {path} HTTP/1.1\r\nHost: lxd\r\nUser-Agent: buildpen\r\nConnection: close\r\n"
        );
        for (name, value) in headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        match &body {
            RequestBody::None => {}
            RequestBody::Bytes(bytes) => {
                head.push_str(&format!("Content-Length: {}\r\n", bytes.len()));
            }
            RequestBody::File(_, len) => {
                head.push_str(&format!("Content-Length: {len}\r\n"));
            }
        }
        head.push_str("\r\n");
        writer.write_all(head.as_bytes())?;
        match body {
            RequestBody::None => {}
            RequestBody::Bytes(bytes) => writer.write_all(bytes)?,
            RequestBody::File(file, _) => {
                std::io::copy(&mut BufReader::new(file), &mut writer)?;
            }
        }
        writer.flush()?;

        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line)?;
        let status = parse_status_line(&status_line)
            .ok_or_else(|| daemon_error(method, path, "malformed HTTP status line"))?;

        let mut content_length: Option<u64> = None;
        let mut chunked = false;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line)?;
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                let value = value.trim();
                match name.to_ascii_lowercase().as_str() {
                    "content-length" => content_length = value.parse().ok(),
                    "transfer-encoding" => {
                        chunked = value.eq_ignore_ascii_case("chunked");
                    }
                    _ => {}
                }
            }
        }

        let framing = if chunked {
            Framing::Chunked { remaining: 0, done: false }
        } else if let Some(len) = content_length {
            Framing::Length(len)
        } else {
            // Connection: close delimits the body.
            Framing::Eof
        };
        Ok(HttpResponse {
            status,
            body: HttpBody { reader, framing },
        })
    }

    /// A JSON API call, following async operations to completion.
    ///
    /// Returns the `metadata` member of the response envelope.
    fn api(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, BackendError> {
        match self.api_optional(method, path, body)? {
            Some(metadata) => Ok(metadata),
            None => Err(daemon_error(method, path, "not found")),
        }
    }

    /// Like `api`, but a 404 becomes `Ok(None)` instead of an error.
    fn api_optional(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>, BackendError> {
        debug!("lxd api: {method} {path}");
        let serialized = body.map(Value::to_string);
        let headers = match &serialized {
            Some(_) => vec![("Content-Type".to_owned(), "application/json".to_owned())],
            None => Vec::new(),
        };
        let request_body = match &serialized {
            Some(s) => RequestBody::Bytes(s.as_bytes()),
            None => RequestBody::None,
        };
        let mut response = self.request(method, path, &headers, request_body)?;
        if response.status == 404 {
            return Ok(None);
        }
        let mut envelope = read_json(&mut response.body, method, path)?;
        if response.status >= 400 || envelope["type"] == "error" {
            let message = envelope["error"].as_str().unwrap_or("unknown error");
            return Err(daemon_error(method, path, message));
        }
        if envelope["type"] == "async" {
            let operation = envelope["operation"].as_str().unwrap_or_default().to_owned();
            return self.wait_operation(&operation).map(Some);
        }
        Ok(Some(envelope["metadata"].take()))
    }

    /// Block until an async operation finishes; error out if it failed.
    fn wait_operation(&self, operation: &str) -> Result<Value, BackendError> {
        let path = format!("{operation}/wait");
        let mut response = self.request("GET", &path, &[], RequestBody::None)?;
        let envelope = read_json(&mut response.body, "GET", &path)?;
        let metadata = &envelope["metadata"];
        let status_code = metadata["status_code"].as_i64().unwrap_or(0);
        if status_code >= 400 {
            let message = metadata["err"].as_str().unwrap_or("operation failed");
            return Err(daemon_error("GET", &path, message));
        }
        Ok(envelope["metadata"].clone())
    }

    pub fn server_info(&self) -> Result<Value, BackendError> {
        self.api("GET", "/1.0", None)
    }

    pub fn get_container(&self, name: &str) -> Result<Option<Value>, BackendError> {
        self.api_optional("GET", &format!("/1.0/containers/{name}"), None)
    }

    pub fn create_container(&self, request: &Value) -> Result<(), BackendError> {
        self.api("POST", "/1.0/containers", Some(request))?;
        Ok(())
    }

    pub fn stop_container(&self, name: &str) -> Result<(), BackendError> {
        let request = json!({"action": "stop", "timeout": -1, "force": true});
        self.api(
            "PUT",
            &format!("/1.0/containers/{name}/state"),
            Some(&request),
        )?;
        Ok(())
    }

    pub fn start_container(&self, name: &str) -> Result<(), BackendError> {
        let request = json!({"action": "start", "timeout": -1});
        self.api(
            "PUT",
            &format!("/1.0/containers/{name}/state"),
            Some(&request),
        )?;
        Ok(())
    }

    pub fn delete_container(&self, name: &str) -> Result<(), BackendError> {
        self.api("DELETE", &format!("/1.0/containers/{name}"), None)?;
        Ok(())
    }

    pub fn get_profile(&self, name: &str) -> Result<Option<Value>, BackendError> {
        self.api_optional("GET", &format!("/1.0/profiles/{name}"), None)
    }

    pub fn delete_profile(&self, name: &str) -> Result<(), BackendError> {
        self.api_optional("DELETE", &format!("/1.0/profiles/{name}"), None)?;
        Ok(())
    }

    pub fn create_profile(
        &self,
        name: &str,
        config: &Value,
        devices: &Value,
    ) -> Result<(), BackendError> {
        let request = json!({"name": name, "config": config, "devices": devices});
        self.api("POST", "/1.0/profiles", Some(&request))?;
        Ok(())
    }

    /// Upload an image tarball; returns its fingerprint.
    pub fn create_image(&self, tarball: &Path) -> Result<String, BackendError> {
        let file = File::open(tarball)?;
        let len = file.metadata()?.len();
        let mut response = self.request(
            "POST",
            "/1.0/images",
            &[(
                "Content-Type".to_owned(),
                "application/octet-stream".to_owned(),
            )],
            RequestBody::File(file, len),
        )?;
        let envelope = read_json(&mut response.body, "POST", "/1.0/images")?;
        if response.status >= 400 || envelope["type"] == "error" {
            let message = envelope["error"].as_str().unwrap_or("unknown error");
            return Err(daemon_error("POST", "/1.0/images", message));
        }
        let operation = envelope["operation"].as_str().unwrap_or_default();
        let metadata = self.wait_operation(operation)?;
        let fingerprint = metadata["metadata"]["fingerprint"]
            .as_str()
            .ok_or_else(|| daemon_error("POST", "/1.0/images", "no fingerprint in response"))?;
        Ok(fingerprint.to_owned())
    }

    pub fn add_image_alias(&self, fingerprint: &str, alias: &str) -> Result<(), BackendError> {
        let request = json!({"name": alias, "target": fingerprint});
        self.api("POST", "/1.0/images/aliases", Some(&request))?;
        Ok(())
    }

    pub fn list_images(&self) -> Result<Vec<Value>, BackendError> {
        let metadata = self.api("GET", "/1.0/images?recursion=1", None)?;
        match metadata {
            Value::Array(images) => Ok(images),
            _ => Ok(Vec::new()),
        }
    }

    pub fn delete_image(&self, fingerprint: &str) -> Result<(), BackendError> {
        self.api("DELETE", &format!("/1.0/images/{fingerprint}"), None)?;
        Ok(())
    }

    /// Write a host file into a container at `path`, with explicit
    /// ownership and mode.
    pub fn push_file(
        &self,
        container: &str,
        path: &str,
        source: &Path,
        uid: u32,
        gid: u32,
        mode: u32,
    ) -> Result<(), BackendError> {
        let file = File::open(source)?;
        let len = file.metadata()?.len();
        let url = format!(
            "/1.0/containers/{container}/files?path={}",
            percent_encode(path)
        );
        let headers = vec![
            ("X-LXD-uid".to_owned(), uid.to_string()),
            ("X-LXD-gid".to_owned(), gid.to_string()),
            ("X-LXD-mode".to_owned(), format_mode(mode)),
        ];
        let mut response = self.request("POST", &url, &headers, RequestBody::File(file, len))?;
        let envelope = read_json(&mut response.body, "POST", &url)?;
        if response.status >= 400 || envelope["type"] == "error" {
            let message = envelope["error"].as_str().unwrap_or("unknown error");
            return Err(BackendError::Daemon {
                action: format!("Failed to push {container}:{path}"),
                message: message.to_owned(),
            });
        }
        Ok(())
    }

    /// Stream a container file at `path` into `target`.
    pub fn pull_file(
        &self,
        container: &str,
        path: &str,
        target: &mut dyn Write,
    ) -> Result<(), BackendError> {
        let url = format!(
            "/1.0/containers/{container}/files?path={}",
            percent_encode(path)
        );
        let mut response = self.request("GET", &url, &[], RequestBody::None)?;
        if response.status >= 400 {
            let mut body = Vec::new();
            let _ = response.body.read_to_end(&mut body);
            let message = serde_json::from_slice::<Value>(&body)
                .ok()
                .and_then(|v| v["error"].as_str().map(std::borrow::ToOwned::to_owned))
                .unwrap_or_else(|| format!("HTTP {}", response.status));
            return Err(BackendError::Daemon {
                action: format!("Failed to pull {container}:{path}"),
                message,
            });
        }
        let mut chunk = vec![0u8; PULL_CHUNK];
        loop {
            let n = response.body.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            target.write_all(&chunk[..n])?;
        }
        Ok(())
    }
}

enum RequestBody<'a> {
    None,
    Bytes(&'a [u8]),
    File(File, u64),
}

enum Framing {
    Length(u64),
    Chunked { remaining: u64, done: bool },
    Eof,
}

/// Response body reader handling content-length and chunked framing.
struct HttpBody<R: BufRead> {
    reader: R,
    framing: Framing,
}

impl<R: BufRead> Read for HttpBody<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.framing {
            Framing::Length(remaining) => {
                if *remaining == 0 {
                    return Ok(0);
                }
                let limit = buf.len().min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                let n = self.reader.read(&mut buf[..limit])?;
                *remaining -= n as u64;
                Ok(n)
            }
            Framing::Chunked { remaining, done } => {
                if *done {
                    return Ok(0);
                }
                if *remaining == 0 {
                    *remaining = read_chunk_size(&mut self.reader)?;
                    if *remaining == 0 {
                        // Trailing CRLF after the last chunk.
                        let mut line = String::new();
                        self.reader.read_line(&mut line)?;
                        *done = true;
                        return Ok(0);
                    }
                }
                let limit = buf.len().min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                let n = self.reader.read(&mut buf[..limit])?;
                *remaining -= n as u64;
                if *remaining == 0 {
                    // CRLF terminating this chunk.
                    let mut crlf = [0u8; 2];
                    self.reader.read_exact(&mut crlf)?;
                }
                Ok(n)
            }
            Framing::Eof => self.reader.read(buf),
        }
    }
}

fn read_chunk_size(reader: &mut impl BufRead) -> std::io::Result<u64> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let size_part = line.trim().split(';').next().unwrap_or("");
    u64::from_str_radix(size_part, 16)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad chunk size"))
}

fn parse_status_line(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

fn read_json(
    body: &mut impl Read,
    method: &str,
    path: &str,
) -> Result<Value, BackendError> {
    let mut bytes = Vec::new();
    body.read_to_end(&mut bytes)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| daemon_error(method, path, &format!("invalid JSON response: {e}")))
}

fn daemon_error(method: &str, path: &str, message: &str) -> BackendError {
    BackendError::Daemon {
        action: format!("{method} {path}"),
        message: message.to_owned(),
    }
}

/// LXD expresses file modes as plain octal strings with a leading zero.
fn format_mode(mode: u32) -> String {
    if mode == 0 {
        "0".to_owned()
    } else {
        format!("0{mode:o}")
    }
}

/// Encode a query parameter value; everything but unreserved characters.
fn percent_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::dispatch::{ConfigRequest, Dispatcher, PlaygroundRequest};
use crate::error::DispatchError;
use crate::model::ErrorReport;
use crate::runtime::GuestLanguage;

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 256 * 1024;
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Origins echoed back in `Access-Control-Allow-Origin`; `*` allows all.
    pub allow_origins: Vec<String>,
    /// Connections served at once; each holds one thread while it waits on
    /// an interpreter. Further connections get 503.
    pub max_connections: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            allow_origins: Vec::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

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
    cfg: ApiConfig,
    dispatcher: Arc<Dispatcher>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self { cfg, dispatcher }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
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
        let cfg = Arc::new(self.cfg);
        let dispatcher = self.dispatcher;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, dispatcher, shutdown_thread) {
                log::error!("config api stopped: {}", err);
            }
        });

        log::info!("config api listening on {}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: Arc<ApiConfig>,
    dispatcher: Arc<Dispatcher>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let active = Arc::new(AtomicUsize::new(0));
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((mut stream, peer)) => {
                let Some(slot) = ConnectionSlot::acquire(&active, cfg.max_connections) else {
                    log::warn!(
                        "config api at {} connections, refusing {}",
                        cfg.max_connections,
                        peer
                    );
                    if let Err(err) = refuse_busy(&mut stream) {
                        log::debug!("failed to refuse connection: {}", err);
                    }
                    continue;
                };
                let cfg = cfg.clone();
                let dispatcher = dispatcher.clone();
                // requests block on script execution, so each gets its own thread
                std::thread::spawn(move || {
                    let _slot = slot;
                    if let Err(err) = handle_connection(stream, &cfg, &dispatcher) {
                        log::warn!("config api request rejected: {}", err);
                    }
                });
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

/// Counts a live connection thread until dropped.
struct ConnectionSlot {
    active: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    fn acquire(active: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .ok()?;
        Some(Self {
            active: active.clone(),
        })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

// Runs on the accept thread, so the unread request is drained for at most a
// short timeout before the socket closes.
fn refuse_busy(stream: &mut TcpStream) -> Result<()> {
    stream.set_nonblocking(false)?;
    write_json_response(stream, 503, r#"{"message":"server busy"}"#, None)?;
    stream.shutdown(Shutdown::Write)?;
    stream.set_read_timeout(Some(Duration::from_millis(100)))?;
    let mut scratch = [0u8; 1024];
    while matches!(stream.read(&mut scratch), Ok(n) if n > 0) {}
    Ok(())
}

struct Reply {
    status: u16,
    body: Vec<u8>,
}

impl Reply {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self { status, body },
            Err(err) => {
                log::error!("failed to encode response: {}", err);
                Self::message(500, "internal error")
            }
        }
    }

    fn message(status: u16, message: &str) -> Self {
        Self::json(status, &serde_json::json!({ "message": message }))
    }

    fn error(err: DispatchError) -> Self {
        Self::message(err.status(), &err.to_string())
    }
}

fn handle_connection(
    mut stream: TcpStream,
    cfg: &ApiConfig,
    dispatcher: &Dispatcher,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"message":"forbidden"}"#, None)?;
        return Ok(());
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json_response(&mut stream, 400, r#"{"message":"malformed request"}"#, None)?;
            return Err(err);
        }
    };
    let origin = allowed_origin(cfg, request.headers.get("origin").map(String::as_str));

    if request.method == "OPTIONS" {
        write_response(&mut stream, 204, "application/json", &[], origin.as_deref())?;
        return Ok(());
    }

    let reply = route(&request, dispatcher);
    write_response(
        &mut stream,
        reply.status,
        "application/json",
        &reply.body,
        origin.as_deref(),
    )?;
    Ok(())
}

fn route(request: &HttpRequest, dispatcher: &Dispatcher) -> Reply {
    let segments: Vec<&str> = request
        .path
        .trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();

    match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => health(dispatcher),
        ("POST", ["config", config_id]) => get_config(dispatcher, config_id, &request.body),
        ("GET", ["test", test_id]) => run_test(dispatcher, test_id, request.secret()),
        ("POST", ["playground", lang]) => playground(dispatcher, lang, &request.body),
        ("POST", ["report", config_id, code_id]) => {
            report_error(dispatcher, config_id, code_id, request.secret(), &request.body)
        }
        (_, ["health"]) | (_, ["config", _]) | (_, ["test", _]) | (_, ["playground", _])
        | (_, ["report", _, _]) => Reply::message(405, "method not allowed"),
        _ => Reply::message(404, "not found"),
    }
}

fn health(dispatcher: &Dispatcher) -> Reply {
    let engines = dispatcher.engines();
    let languages = [GuestLanguage::JavaScript, GuestLanguage::Starlark];
    let pools: serde_json::Map<String, serde_json::Value> = languages
        .into_iter()
        .map(|lang| {
            let pool = engines.pool(lang);
            (
                lang.to_string(),
                serde_json::json!({
                    "size": pool.size(),
                    "busy": pool.busy(),
                    "cached_programs": engines.cached_programs(lang),
                }),
            )
        })
        .collect();
    Reply::json(200, &serde_json::json!({ "status": "ok", "pools": pools }))
}

fn get_config(dispatcher: &Dispatcher, config_id: &str, body: &[u8]) -> Reply {
    if crate::validate_record_id(config_id).is_err() {
        return Reply::message(400, "invalid config id");
    }
    let request: ConfigRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(_) => return Reply::message(400, "invalid arguments"),
    };
    match dispatcher.get_config(config_id, &request) {
        Ok(response) => Reply::json(200, &response),
        Err(err) => Reply::error(err),
    }
}

fn run_test(dispatcher: &Dispatcher, test_id: &str, secret: Option<&str>) -> Reply {
    if crate::validate_record_id(test_id).is_err() {
        return Reply::message(400, "invalid test id");
    }
    match dispatcher.run_test(test_id, secret) {
        Ok(report) => Reply::json(200, &report),
        Err(err) => Reply::error(err),
    }
}

fn playground(dispatcher: &Dispatcher, lang: &str, body: &[u8]) -> Reply {
    let request: PlaygroundRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(_) => return Reply::message(400, "invalid arguments"),
    };
    match dispatcher.run_playground(lang, &request) {
        Ok(result) => Reply::json(200, &serde_json::json!({ "result": result })),
        Err(err) => Reply::error(err),
    }
}

fn report_error(
    dispatcher: &Dispatcher,
    config_id: &str,
    code_id: &str,
    secret: Option<&str>,
    body: &[u8],
) -> Reply {
    if crate::validate_record_id(config_id).is_err()
        || crate::validate_record_id(code_id).is_err()
    {
        return Reply::message(400, "invalid record id");
    }
    let report: ErrorReport = match serde_json::from_slice(body) {
        Ok(report) => report,
        Err(_) => return Reply::message(400, "invalid arguments"),
    };
    match dispatcher.report_error(config_id, code_id, secret, &report) {
        Ok(outcome) => Reply::json(200, &outcome),
        Err(err) => Reply::error(err),
    }
}

fn allowed_origin(cfg: &ApiConfig, origin: Option<&str>) -> Option<String> {
    if cfg.allow_origins.iter().any(|allowed| allowed == "*") {
        return Some("*".to_string());
    }
    let origin = origin?;
    cfg.allow_origins
        .iter()
        .find(|allowed| allowed.as_str() == origin)
        .cloned()
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }

    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        body,
    })
}

fn write_json_response(
    stream: &mut TcpStream,
    status: u16,
    body: &str,
    origin: Option<&str>,
) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes(), origin)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
    origin: Option<&str>,
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let mut header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    if let Some(origin) = origin {
        header.push_str(&format!(
            "Access-Control-Allow-Origin: {origin}\r\nAccess-Control-Allow-Methods: GET, POST, OPTIONS\r\nAccess-Control-Allow-Headers: Content-Type, Secret\r\n"
        ));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn secret(&self) -> Option<&str> {
        self.headers
            .get("secret")
            .map(String::as_str)
            .filter(|secret| !secret.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_origin_allows_everyone() {
        let cfg = ApiConfig {
            allow_origins: vec!["*".to_string()],
            ..ApiConfig::default()
        };
        assert_eq!(allowed_origin(&cfg, None).as_deref(), Some("*"));
    }

    #[test]
    fn listed_origin_is_echoed() {
        let cfg = ApiConfig {
            allow_origins: vec!["https://console.example".to_string()],
            ..ApiConfig::default()
        };
        assert_eq!(
            allowed_origin(&cfg, Some("https://console.example")).as_deref(),
            Some("https://console.example")
        );
        assert!(allowed_origin(&cfg, Some("https://other.example")).is_none());
        assert!(allowed_origin(&ApiConfig::default(), Some("https://console.example")).is_none());
    }

    #[test]
    fn connection_slots_are_bounded_and_released() {
        let active = Arc::new(AtomicUsize::new(0));
        let first = ConnectionSlot::acquire(&active, 2).expect("first slot");
        let second = ConnectionSlot::acquire(&active, 2).expect("second slot");
        assert!(ConnectionSlot::acquire(&active, 2).is_none());
        assert_eq!(active.load(Ordering::SeqCst), 2);

        drop(first);
        let third = ConnectionSlot::acquire(&active, 2);
        assert!(third.is_some());
        drop(second);
        drop(third);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }
}

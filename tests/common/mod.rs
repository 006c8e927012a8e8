//! In-process LFS server for integration tests.
//!
//! Speaks just enough HTTP/1.1 for ureq: one request per connection, answered
//! with `Connection: close`. Serves the batch API, object transfers and the
//! locks API, with switches for injecting failures.

#![allow(dead_code)]

use base64::Engine;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use url::Url;

#[derive(Debug, Clone)]
pub struct MockRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

impl MockRequest {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone)]
pub struct MockLock {
    pub id: String,
    pub path: String,
    pub owner: String,
}

/// Failure injection switches.
#[derive(Debug, Default)]
pub struct Faults {
    /// Answer this many batch requests with 429 before serving them.
    pub throttle_batches: u32,
    /// Answer every batch request with this status.
    pub batch_status: Option<u16>,
    /// Objects whose download always fails with 500.
    pub broken_downloads: HashSet<String>,
    /// Objects whose download is refused with the given status.
    pub download_status: HashMap<String, u16>,
    /// Objects served with one byte flipped.
    pub corrupt_downloads: HashSet<String>,
    /// Hand out already-expired actions for this many batch requests.
    pub expire_batches: u32,
    /// Lock list page size; 0 uses the client's limit.
    pub lock_page_size: usize,
    /// Ask for a verify call after uploads.
    pub verify_uploads: bool,
}

#[derive(Debug, Default)]
pub struct State {
    pub objects: HashMap<String, Vec<u8>>,
    pub locks: Vec<MockLock>,
    pub next_lock_id: u64,
    pub requests: Vec<MockRequest>,
    pub faults: Faults,
}

pub struct MockLfsServer {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MockLfsServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State::default()));
        let shutdown = Arc::new(AtomicBool::new(false));

        // Set socket to non-blocking for graceful shutdown
        listener.set_nonblocking(true).unwrap();

        let handle = {
            let state = Arc::clone(&state);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || loop {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match listener.accept() {
                    Ok((stream, _)) => {
                        let state = Arc::clone(&state);
                        thread::spawn(move || handle_connection(stream, addr, &state));
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            })
        };

        MockLfsServer {
            addr,
            state,
            shutdown,
            handle: Some(handle),
        }
    }

    /// LFS endpoint, as a client would be configured with.
    pub fn lfs_url(&self) -> Url {
        Url::parse(&format!("http://{}/lfs/", self.addr)).unwrap()
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_object(&self, content: &[u8]) -> String {
        let oid = hex::encode(Sha256::digest(content));
        self.state().objects.insert(oid.clone(), content.to_vec());
        oid
    }

    pub fn object(&self, oid: &str) -> Option<Vec<u8>> {
        self.state().objects.get(oid).cloned()
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        self.state().requests.clone()
    }

    /// Number of requests whose path contains `needle`.
    pub fn count(&self, method: &str, needle: &str) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|r| r.method == method && r.path.contains(needle))
            .count()
    }
}

impl Drop for MockLfsServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    fn json(status: u16, body: Value) -> Self {
        Response {
            status,
            headers: vec![(
                "Content-Type".into(),
                "application/vnd.git-lfs+json".into(),
            )],
            body: body.to_string().into_bytes(),
        }
    }

    fn empty(status: u16) -> Self {
        Response {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn bytes(body: Vec<u8>) -> Self {
        Response {
            status: 200,
            headers: vec![("Content-Type".into(), "application/octet-stream".into())],
            body,
        }
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        409 => "Conflict",
        416 => "Range Not Satisfiable",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

fn handle_connection(stream: TcpStream, addr: SocketAddr, state: &Mutex<State>) {
    stream.set_nonblocking(false).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
        return;
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let body = read_body(&mut reader, &headers);
    let user = basic_auth_user(&headers);

    let response = {
        let mut state = state.lock().unwrap();
        state.requests.push(MockRequest {
            method: method.clone(),
            path: target.clone(),
            body: body.clone(),
        });
        route(&mut state, addr, &method, &target, &body, user)
    };

    let mut stream = stream;
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        reason(response.status),
        response.body.len()
    );
    for (name, value) in &response.headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(&response.body);
    let _ = stream.flush();
}

fn read_body(reader: &mut impl BufRead, headers: &HashMap<String, String>) -> Vec<u8> {
    let mut body = Vec::new();
    if let Some(len) = headers.get("content-length").and_then(|v| v.parse::<usize>().ok()) {
        body.resize(len, 0);
        let _ = reader.read_exact(&mut body);
    } else if headers
        .get("transfer-encoding")
        .map_or(false, |v| v.eq_ignore_ascii_case("chunked"))
    {
        loop {
            let mut size_line = String::new();
            if reader.read_line(&mut size_line).unwrap_or(0) == 0 {
                break;
            }
            let size_hex = size_line.trim().split(';').next().unwrap_or("0");
            let size = usize::from_str_radix(size_hex, 16).unwrap_or(0);
            if size == 0 {
                let mut trailer = String::new();
                let _ = reader.read_line(&mut trailer);
                break;
            }
            let mut chunk = vec![0u8; size];
            if reader.read_exact(&mut chunk).is_err() {
                break;
            }
            body.extend_from_slice(&chunk);
            let mut crlf = [0u8; 2];
            let _ = reader.read_exact(&mut crlf);
        }
    }
    body
}

fn basic_auth_user(headers: &HashMap<String, String>) -> Option<String> {
    let value = headers.get("authorization")?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    decoded.split_once(':').map(|(user, _)| user.to_string())
}

fn route(
    state: &mut State,
    addr: SocketAddr,
    method: &str,
    target: &str,
    body: &[u8],
    user: Option<String>,
) -> Response {
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let request: Value = serde_json::from_slice(body).unwrap_or(Value::Null);

    match (method, segments.as_slice()) {
        ("POST", ["lfs", "objects", "batch"]) => batch(state, addr, &request),
        ("GET", ["objects", oid]) => download(state, oid),
        ("PUT", ["objects", oid]) => {
            state.objects.insert(oid.to_string(), body.to_vec());
            Response::empty(200)
        }
        ("POST", ["verify"]) => {
            let oid = request["oid"].as_str().unwrap_or_default();
            if state.objects.contains_key(oid) {
                Response::empty(200)
            } else {
                Response::json(404, json!({"message": "object not uploaded"}))
            }
        }
        ("POST", ["lfs", "locks"]) => {
            let owner = user.unwrap_or_else(|| {
                request["owner"]["name"].as_str().unwrap_or("anonymous").to_string()
            });
            create_lock(state, &request, owner)
        }
        ("POST", ["lfs", "locks", id, "unlock"]) => {
            let owner = user.unwrap_or_default();
            unlock(state, id, &request, &owner)
        }
        ("GET", ["lfs", "locks"]) => list_locks(state, query),
        _ => Response::empty(404),
    }
}

fn batch(state: &mut State, addr: SocketAddr, request: &Value) -> Response {
    if let Some(status) = state.faults.batch_status {
        return Response::json(status, json!({"message": "injected failure"}));
    }
    if state.faults.throttle_batches > 0 {
        state.faults.throttle_batches -= 1;
        let mut response = Response::json(429, json!({"message": "slow down"}));
        response.headers.push(("Retry-After".into(), "0".into()));
        return response;
    }

    let expires_in = if state.faults.expire_batches > 0 {
        state.faults.expire_batches -= 1;
        0
    } else {
        3600
    };

    let operation = request["operation"].as_str().unwrap_or_default();
    let empty = Vec::new();
    let objects: Vec<Value> = request["objects"]
        .as_array()
        .unwrap_or(&empty)
        .iter()
        .map(|object| {
            let oid = object["oid"].as_str().unwrap_or_default();
            let size = object["size"].as_u64().unwrap_or_default();
            let href = format!("http://{}/objects/{}", addr, oid);
            let present = state.objects.contains_key(oid);

            match operation {
                "download" if present => json!({
                    "oid": oid,
                    "size": size,
                    "actions": {
                        "download": {"href": href, "header": {"X-Transfer": "1"}, "expires_in": expires_in}
                    }
                }),
                "download" => json!({
                    "oid": oid,
                    "size": size,
                    "error": {"code": 404, "message": "Object does not exist"}
                }),
                _ if present => json!({"oid": oid, "size": size}),
                _ => {
                    let mut actions = json!({
                        "upload": {"href": href, "header": {"X-Transfer": "1"}, "expires_in": expires_in}
                    });
                    if state.faults.verify_uploads {
                        actions["verify"] = json!({"href": format!("http://{}/verify", addr)});
                    }
                    json!({"oid": oid, "size": size, "actions": actions})
                }
            }
        })
        .collect();

    Response::json(200, json!({"transfer": "basic", "objects": objects}))
}

fn download(state: &State, oid: &str) -> Response {
    if let Some(&status) = state.faults.download_status.get(oid) {
        return Response::json(status, json!({"message": "refused by storage"}));
    }
    if state.faults.broken_downloads.contains(oid) {
        return Response::json(500, json!({"message": "storage unavailable"}));
    }
    match state.objects.get(oid) {
        Some(content) => {
            let mut content = content.clone();
            if state.faults.corrupt_downloads.contains(oid) {
                if let Some(first) = content.first_mut() {
                    *first ^= 0xff;
                }
            }
            Response::bytes(content)
        }
        None => Response::empty(404),
    }
}

fn lock_json(lock: &MockLock) -> Value {
    json!({
        "id": lock.id,
        "path": lock.path,
        "owner": {"name": lock.owner},
        "locked_at": "2024-05-01T10:00:00Z"
    })
}

fn create_lock(state: &mut State, request: &Value, owner: String) -> Response {
    let path = request["path"].as_str().unwrap_or_default().to_string();
    if let Some(existing) = state.locks.iter().find(|l| l.path == path) {
        return Response::json(
            409,
            json!({"lock": lock_json(existing), "message": "already created lock"}),
        );
    }

    state.next_lock_id += 1;
    let lock = MockLock {
        id: state.next_lock_id.to_string(),
        path,
        owner,
    };
    let response = Response::json(201, json!({"lock": lock_json(&lock)}));
    state.locks.push(lock);
    response
}

fn unlock(state: &mut State, id: &str, request: &Value, owner: &str) -> Response {
    let index = match state.locks.iter().position(|l| l.id == id) {
        Some(index) => index,
        None => return Response::json(404, json!({"message": "unable to find lock"})),
    };
    let force = request["force"].as_bool().unwrap_or(false);
    if state.locks[index].owner != owner && !force {
        return Response::json(
            403,
            json!({"lock": lock_json(&state.locks[index]), "message": "lock owned by another user"}),
        );
    }
    let lock = state.locks.remove(index);
    Response::json(200, json!({"lock": lock_json(&lock)}))
}

fn list_locks(state: &State, query: &str) -> Response {
    let params: HashMap<&str, &str> = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .collect();
    let start = params
        .get("cursor")
        .and_then(|c| c.parse::<usize>().ok())
        .unwrap_or(0);
    let limit = match state.faults.lock_page_size {
        0 => params
            .get("limit")
            .and_then(|l| l.parse::<usize>().ok())
            .unwrap_or(100),
        n => n,
    };

    let page: Vec<Value> = state.locks.iter().skip(start).take(limit).map(lock_json).collect();
    let end = start + page.len();
    let mut body = json!({"locks": page});
    if end < state.locks.len() {
        body["next_cursor"] = json!(end.to_string());
    }
    Response::json(200, body)
}

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::client::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use rand::RngCore;
use tokio::net::TcpListener;

use offload::config::{AccessLog, Bootstrap, Cache, Logger, Origin, Server};
use offload::stream::BoxedBody;

pub fn full_body(bytes: Bytes) -> BoxedBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

pub struct Offload {
    pub addr: SocketAddr,
    pub cache_dir: PathBuf,
    _tempdir: tempfile::TempDir,
}

/// Boots a full offload server on a dedicated port against the given mock
/// origin. Each harness gets its own cache dir and cache name so parallel
/// tests never share lock or slot files.
pub async fn start_offload(port: u16, origin: SocketAddr, max_dupes: u32, timeout_secs: u64) -> Offload {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let cache_dir = tempdir.path().to_path_buf();
    let cache_name = format!("e2e-{port}");

    // stale slot tables from earlier runs may hold pids that are alive again
    let _ = std::fs::remove_file(std::env::temp_dir().join(format!("offload-{cache_name}.slots")));

    let cfg = Bootstrap {
        strict: false,
        pidfile: None,
        logger: Logger::default(),
        server: Server {
            addr: format!("127.0.0.1:{port}"),
        },
        origin: Origin {
            host: "127.0.0.1".to_string(),
            port: origin.port(),
            timeout: Duration::from_secs(timeout_secs),
        },
        cache: Cache {
            dir: cache_dir.display().to_string(),
            name: cache_name,
            max_dupe_downloads: max_dupes,
        },
        access_log: None::<AccessLog>,
    };

    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("runtime");
        runtime.block_on(async move {
            let _ = offload::server::run(Arc::new(cfg)).await;
        });
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    Offload {
        addr: format!("127.0.0.1:{port}").parse().unwrap(),
        cache_dir,
        _tempdir: tempdir,
    }
}

#[derive(Clone)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone)]
pub struct TestClient {
    addr: SocketAddr,
}

impl TestClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        headers: &[(&str, &str)],
    ) -> TestResponse {
        let (status, resp_headers, body) = self.request_streaming(method, path, headers).await;
        let body = body.collect().await.map(|b| b.to_bytes()).unwrap_or_default();
        TestResponse {
            status,
            headers: resp_headers,
            body,
        }
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.request(Method::GET, path, &[]).await
    }

    /// Returns once response headers arrive; the body is handed back
    /// unconsumed so a test can hold a download slot open.
    pub async fn request_streaming(
        &self,
        method: Method,
        path: &str,
        headers: &[(&str, &str)],
    ) -> (StatusCode, HeaderMap, Incoming) {
        let stream = tokio::net::TcpStream::connect(self.addr)
            .await
            .expect("connect offload");
        let io = TokioIo::new(stream);
        let (mut sender, conn) = http1::handshake(io).await.expect("handshake");
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::HOST, "offload-e2e");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let req = builder.body(Full::new(Bytes::new())).expect("request");

        let resp = sender.send_request(req).await.expect("send request");
        let status = resp.status();
        let headers = resp.headers().clone();
        (status, headers, resp.into_body())
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(Request<Incoming>) -> Response<BoxedBody> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(v) => v, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let resp = handler(req);
                                async move { Ok::<_, hyper::Error>(resp) }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            shutdown: Some(shutdown),
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Shared counters plus the headers a well-behaved static origin serves.
#[derive(Clone)]
pub struct OriginState {
    pub payload: Arc<Vec<u8>>,
    pub etag: Arc<Mutex<String>>,
    pub last_modified: Arc<Mutex<String>>,
    pub heads: Arc<AtomicUsize>,
    pub gets: Arc<AtomicUsize>,
}

impl OriginState {
    pub fn new(payload: Vec<u8>, etag: &str, last_modified: &str) -> Self {
        Self {
            payload: Arc::new(payload),
            etag: Arc::new(Mutex::new(etag.to_string())),
            last_modified: Arc::new(Mutex::new(last_modified.to_string())),
            heads: Arc::new(AtomicUsize::new(0)),
            gets: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn head_count(&self) -> usize {
        self.heads.load(Ordering::SeqCst)
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn set_last_modified(&self, value: &str) {
        *self.last_modified.lock().unwrap() = value.to_string();
    }

    pub fn handler(&self) -> impl Fn(Request<Incoming>) -> Response<BoxedBody> + Send + Sync {
        let state = self.clone();
        move |req: Request<Incoming>| {
            let is_head = req.method() == Method::HEAD;
            if is_head {
                state.heads.fetch_add(1, Ordering::SeqCst);
            } else {
                state.gets.fetch_add(1, Ordering::SeqCst);
            }
            let body = if is_head {
                Bytes::new()
            } else {
                Bytes::copy_from_slice(&state.payload)
            };
            Response::builder()
                .status(StatusCode::OK)
                .header("ETag", state.etag.lock().unwrap().as_str())
                .header("Last-Modified", state.last_modified.lock().unwrap().as_str())
                .header("Content-Length", state.payload.len().to_string())
                .header("Content-Type", "application/x-e2e")
                .body(full_body(body))
                .unwrap()
        }
    }
}

pub fn gen_payload(size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Origin whose GET bodies arrive slowly, for tests that need a download
/// to still be in flight while they poke at the server.
pub fn trickling_origin(
    payload: Arc<Vec<u8>>,
    etag: &'static str,
    last_modified: &'static str,
    gets: Arc<AtomicUsize>,
    chunk: usize,
    delay: Duration,
) -> impl Fn(Request<Incoming>) -> Response<BoxedBody> + Send + Sync {
    move |req| {
        let builder = Response::builder()
            .status(StatusCode::OK)
            .header("ETag", etag)
            .header("Last-Modified", last_modified)
            .header("Content-Length", payload.len().to_string())
            .header("Content-Type", "application/x-e2e");
        if req.method() == Method::HEAD {
            builder.body(full_body(Bytes::new())).unwrap()
        } else {
            gets.fetch_add(1, Ordering::SeqCst);
            builder
                .body(trickle_body(payload.as_ref().clone(), chunk, delay))
                .unwrap()
        }
    }
}

/// Origin body that arrives slowly, for tests that need a reader to catch
/// up with a writer mid-download.
pub fn trickle_body(payload: Vec<u8>, chunk: usize, delay: Duration) -> BoxedBody {
    let (mut tx, rx) = futures::channel::mpsc::channel::<Result<Frame<Bytes>, std::io::Error>>(1);
    tokio::spawn(async move {
        for piece in payload.chunks(chunk) {
            let piece = Bytes::copy_from_slice(piece);
            if tx.send(Ok(Frame::data(piece))).await.is_err() {
                return;
            }
            tokio::time::sleep(delay).await;
        }
    });
    StreamBody::new(rx).boxed()
}

/// Origin body that fails partway through.
pub fn broken_body(prefix: Vec<u8>, delay: Duration) -> BoxedBody {
    let (mut tx, rx) = futures::channel::mpsc::channel::<Result<Frame<Bytes>, std::io::Error>>(1);
    tokio::spawn(async move {
        if !prefix.is_empty() {
            let _ = tx.send(Ok(Frame::data(Bytes::from(prefix)))).await;
        }
        tokio::time::sleep(delay).await;
        let _ = tx
            .send(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "origin blew up",
            )))
            .await;
    });
    StreamBody::new(rx).boxed()
}

pub async fn wait_for_file_len(path: &Path, expected: u64, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Ok(meta) = std::fs::metadata(path) {
            if meta.len() == expected {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

pub async fn wait_until_gone(path: &Path, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use http::{Request, Response};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::access_log::AccessLogger;
use crate::config::Bootstrap;
use crate::dupes::DownloadRegistry;
use crate::lock::CacheLock;
use crate::origin::OriginClient;
use crate::pipeline;
use crate::store::CacheStore;
use crate::stream::BoxedBody;

pub struct AppState {
    pub cfg: Arc<Bootstrap>,
    pub store: CacheStore,
    pub origin: OriginClient,
    pub lock: Arc<CacheLock>,
    pub registry: Arc<DownloadRegistry>,
    pub access_logger: Option<Arc<AccessLogger>>,
    pub shutdown: watch::Receiver<bool>,
    pub workers: Arc<AtomicUsize>,
}

pub async fn run(cfg: Arc<Bootstrap>) -> Result<()> {
    let store = CacheStore::new(&cfg.cache.dir)?;
    let origin = OriginClient::new(&cfg.origin.host, cfg.origin.port(), cfg.origin.timeout());
    let lock = CacheLock::new(cfg.cache.name());
    let registry = DownloadRegistry::new(cfg.cache.name(), cfg.cache.max_dupe_downloads);
    let access_logger = build_access_logger(&cfg);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handlers(shutdown_tx);

    let listener = bind_listener(&cfg.server.addr)?;
    log::info!(
        "offloading {}:{} on {}, cache in {}",
        cfg.origin.host,
        cfg.origin.port(),
        cfg.server.addr,
        cfg.cache.dir
    );

    let state = Arc::new(AppState {
        cfg,
        store,
        origin,
        lock,
        registry,
        access_logger,
        shutdown: shutdown_rx.clone(),
        workers: Arc::new(AtomicUsize::new(0)),
    });

    accept_loop(listener, shutdown_rx, Arc::clone(&state)).await?;
    drain_workers(&state.workers).await;
    Ok(())
}

fn bind_listener(addr: &str) -> Result<TcpListener> {
    let bind_addr = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    let socket_addr: SocketAddr = bind_addr.parse().context("parse server.addr")?;
    let listener = std::net::TcpListener::bind(socket_addr).context("bind tcp")?;
    listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(listener)?)
}

async fn accept_loop(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<AppState>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, peer) = res.context("accept tcp")?;
                let client_ip = peer.ip().to_string();
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        handle(req, Arc::clone(&state), client_ip.clone())
                    });
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::debug!("http connection error: {err}");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<AppState>,
    client_ip: String,
) -> Result<Response<BoxedBody>, hyper::Error> {
    // request bodies are ignored; only the head of the request matters
    let (parts, _body) = req.into_parts();
    let info = RequestInfo::from_parts(&parts, &client_ip);
    let resp = pipeline::handle(parts, Arc::clone(&state), client_ip).await;
    log_access(&state, &info, &resp);
    Ok(resp)
}

fn spawn_signal_handlers(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();
        loop {
            tokio::select! {
                _ = async {
                    if let Some(sig) = sigterm.as_mut() {
                        let _ = sig.recv().await;
                    }
                } => {
                    let _ = shutdown.send(true);
                    break;
                }
                _ = async {
                    if let Some(sig) = sigint.as_mut() {
                        let _ = sig.recv().await;
                    }
                } => {
                    let _ = shutdown.send(true);
                    break;
                }
            }
        }
    });
}

// In-flight cache writers see the shutdown signal and wipe their partial
// entries; give them a moment before the process goes away.
async fn drain_workers(workers: &Arc<AtomicUsize>) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while workers.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn build_access_logger(cfg: &Bootstrap) -> Option<Arc<AccessLogger>> {
    let access = cfg.access_log.as_ref()?;
    if !access.enabled {
        return None;
    }
    match AccessLogger::new(Some(&access.path)) {
        Ok(logger) => Some(Arc::new(logger)),
        Err(err) => {
            log::warn!("failed to init access log: {err}");
            None
        }
    }
}

struct RequestInfo {
    client_ip: String,
    request_line: String,
    referer: String,
    user_agent: String,
    range: String,
    start_at: Instant,
}

impl RequestInfo {
    fn from_parts(parts: &http::request::Parts, client_ip: &str) -> Self {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("-")
                .to_string()
        };
        Self {
            client_ip: client_ip.to_string(),
            request_line: format!("{} {} {:?}", parts.method, parts.uri, parts.version),
            referer: header("Referer"),
            user_agent: header("User-Agent"),
            range: header("Range"),
            start_at: Instant::now(),
        }
    }
}

fn log_access(state: &AppState, info: &RequestInfo, resp: &Response<BoxedBody>) {
    let logger = match &state.access_logger {
        Some(logger) => logger,
        None => return,
    };
    let status = resp.status().as_u16();
    let bytes = resp
        .headers()
        .get("Content-Length")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-");
    let duration_ms = info.start_at.elapsed().as_millis().to_string();
    let fields = [
        normalize_field(&info.client_ip),
        normalize_field(&format_access_time()),
        normalize_field_replace(&info.request_line),
        normalize_field(&status.to_string()),
        normalize_field(bytes),
        normalize_field_replace(&info.referer),
        normalize_field_replace(&info.user_agent),
        normalize_field(&duration_ms),
        normalize_field_replace(&info.range),
    ];
    logger.log_line(&format!("{}\n", fields.join(" ")));
}

fn normalize_field(s: &str) -> String {
    if s.is_empty() {
        "-".to_string()
    } else {
        s.to_string()
    }
}

fn normalize_field_replace(s: &str) -> String {
    if s.is_empty() {
        "-".to_string()
    } else {
        s.replace(' ', "+")
    }
}

fn format_access_time() -> String {
    chrono::Local::now().format("[%d/%b/%Y:%H:%M:%S %z]").to_string()
}

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use http::request::Parts;
use http::{Response, StatusCode};

use crate::constants::{ROBOTS_BODY, SERVER_STRING};
use crate::dupes::Admission;
use crate::headers::HeaderList;
use crate::http_range::{resolve_range, ByteRange, RangeError};
use crate::lock::LockHandle;
use crate::origin::status_line;
use crate::server::AppState;
use crate::store::{self, parse_len, EntryPaths};
use crate::stream::{self, empty_body, full_body, BoxedBody, ReadPlan};

/// Terminal failure state of the request pipeline: a header block plus a
/// short plain-text message, never HTML.
pub struct Abort {
    status: StatusCode,
    message: String,
    location: Option<String>,
}

impl Abort {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            location: None,
        }
    }

    pub fn into_response(self) -> Response<BoxedBody> {
        let mut builder = Response::builder()
            .status(self.status)
            .header("Status", status_line(self.status))
            .header("Server", SERVER_STRING)
            .header("Date", httpdate::fmt_http_date(SystemTime::now()));
        if let Some(location) = &self.location {
            builder = builder.header("Location", location);
        }
        builder
            .header("Connection", "close")
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(full_body(Bytes::from(format!("{}\n\n", self.message))))
            .unwrap()
    }
}

pub async fn handle(parts: Parts, state: Arc<AppState>, client_ip: String) -> Response<BoxedBody> {
    match run(&parts, &state, &client_ip).await {
        Ok(resp) => resp,
        Err(abort) => {
            log::debug!("request failed: {} ({})", abort.status, abort.message);
            abort.into_response()
        }
    }
}

async fn run(
    parts: &Parts,
    state: &Arc<AppState>,
    client_ip: &str,
) -> Result<Response<BoxedBody>, Abort> {
    let uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    if !uri.starts_with('/') {
        return Err(Abort::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Bad request URI",
        ));
    }

    // keep webcrawlers off the offload host
    if uri == "/robots.txt" {
        return Ok(Abort::new(StatusCode::OK, ROBOTS_BODY).into_response());
    }

    let is_get = parts.method.as_str().eq_ignore_ascii_case("GET");
    let is_head = parts.method.as_str().eq_ignore_ascii_case("HEAD");
    if parts.uri.query().is_some() || (!is_get && !is_head) {
        return Err(forbidden_dynamic());
    }

    log::debug!("{} {} from {}", parts.method, uri, client_ip);

    let probe = state
        .origin
        .head(&uri)
        .await
        .map_err(|err| Abort::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()))?;
    let mut head = probe.headers;

    if probe.status == StatusCode::UNAUTHORIZED || head.contains("WWW-Authenticate") {
        return Err(Abort::new(
            StatusCode::FORBIDDEN,
            "Offload server doesn't do protected content.",
        ));
    }
    if probe.status != StatusCode::OK {
        // hand the origin's answer (404, redirects, ...) straight back
        return Err(Abort {
            status: probe.status,
            message: status_line(probe.status),
            location: head.get("Location").map(str::to_string),
        });
    }

    let Some(orig_etag) = head.get("ETag").map(str::to_string) else {
        return Err(forbidden_dynamic());
    };
    let Some(contentlength) = head.get("Content-Length").map(str::to_string) else {
        return Err(forbidden_dynamic());
    };
    if !head.contains("Last-Modified") {
        return Err(forbidden_dynamic());
    }

    head.set("X-Offload-Orig-ETag", &orig_etag);
    let (etag, weak) = store::normalize_etag(&orig_etag);
    if weak {
        log::debug!("weak etag chopped to [{etag}]");
        head.set("ETag", etag);
    }
    head.set("X-Offload-Is-Weak", if weak { "1" } else { "0" });
    let etag = etag.to_string();

    let total = parse_len(&contentlength);
    let range = resolve_range(
        parts
            .headers
            .get("Range")
            .and_then(|value| value.to_str().ok()),
        parts.headers.contains_key("If-Range"),
        total,
    )
    .map_err(|err| match err {
        RangeError::NotBytes => {
            Abort::new(StatusCode::BAD_REQUEST, "Only ranges of 'bytes' accepted.")
        }
        RangeError::MultiRange => Abort::new(
            StatusCode::BAD_REQUEST,
            "Multiple ranges not currently supported",
        ),
        RangeError::Invalid => Abort::new(StatusCode::BAD_REQUEST, "Bad content range requested."),
    })?;
    log::debug!(
        "feeding the client bytes {} to {} of {}",
        range.start,
        range.end,
        total
    );

    let Some(key) = store::cache_key(&etag) else {
        return Err(forbidden_dynamic());
    };
    let paths = state.store.entry_paths(&key);
    head.set("X-Offload-Orig-URL", &uri);
    head.set("X-Offload-Hostname", state.origin.host());
    log::debug!("metadata cache is {}", paths.metadata.display());
    log::debug!("file cache is {}", paths.filedata.display());

    // a HEAD to the offload server never touches the cache store
    if is_head {
        return Ok(respond(&head, range, total, empty_body()));
    }

    // Releasing a download slot re-takes the cache mutex, so the slot must
    // be declared before the lock handle: drops run in reverse order, and
    // an error below must give up the mutex before the slot is released.
    let slot;
    let mut mutex = LockHandle::new(Arc::clone(&state.lock));
    slot = match state
        .registry
        .admit(&mut mutex, &state.lock, client_ip, &uri)
        .await
        .map_err(|err| {
            Abort::new(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Couldn't update download registry: {err}"),
            )
        })? {
        Admission::Granted(slot) => slot,
        Admission::Rejected => {
            return Err(Abort::new(
                StatusCode::FORBIDDEN,
                "Too many simultaneous downloads of this file from your address. \
                 Please disable any 'download accelerator' software and try again.",
            ));
        }
    };

    mutex
        .acquire()
        .await
        .map_err(|_| Abort::new(StatusCode::SERVICE_UNAVAILABLE, "Couldn't lock cache."))?;

    let cached = store::load_metadata(&paths.metadata);
    let metadata = match cached {
        Some(cached) if store::entry_fresh(&cached, &head, &paths.filedata) => {
            log::debug!("file is cached");
            cached
        }
        _ => start_cache_refresh(state, &uri, head, total, &paths).await?,
    };
    mutex.release();

    let file = tokio::fs::File::open(&paths.filedata)
        .await
        .map_err(|_| Abort::new(StatusCode::INTERNAL_SERVER_ERROR, "Couldn't access cached data."))?;
    let body = stream::reader_body(
        file,
        ReadPlan {
            start: range.start,
            end: range.end,
            total,
            stall_timeout: state.cfg.origin.timeout(),
        },
        slot,
    );
    Ok(respond(&metadata, range, total, body))
}

/// Cache-miss path, entered with the cache mutex held: wipe whatever was
/// there, open the origin GET, commit metadata, and hand the streaming body
/// to a detached caching worker. The caller's LockHandle drops the mutex on
/// every error return.
async fn start_cache_refresh(
    state: &Arc<AppState>,
    uri: &str,
    mut head: HeaderList,
    total: i64,
    paths: &EntryPaths,
) -> Result<HeaderList, Abort> {
    log::debug!("cache needs refresh, pulling from base server");
    store::remove_entry(paths);

    let (status, get_headers, body) = state
        .origin
        .get(uri)
        .await
        .map_err(|err| Abort::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()))?;

    // The object may change between the HEAD probe and this fetch; only
    // commit metadata that still describes the body being cached.
    let unchanged = status == StatusCode::OK
        && get_headers.get("ETag") == head.get("X-Offload-Orig-ETag")
        && get_headers.get("Content-Length") == head.get("Content-Length")
        && get_headers.get("Last-Modified") == head.get("Last-Modified");
    if !unchanged {
        return Err(Abort::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Object changed at base server while caching.",
        ));
    }

    let file = std::fs::File::create(&paths.filedata).map_err(|_| {
        Abort::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Couldn't update cached data.",
        )
    })?;

    if !head.contains("Content-Type") {
        head.set("Content-Type", "application/octet-stream");
    }
    head.set("X-Offload-Caching-PID", &std::process::id().to_string());

    if let Err(err) = store::write_metadata(&paths.metadata, &head) {
        log::warn!("metadata write failed: {err}");
        store::remove_entry(paths);
        return Err(Abort::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Couldn't update metadata.",
        ));
    }

    stream::spawn_cache_worker(
        body,
        file,
        total,
        paths.clone(),
        Arc::clone(&state.lock),
        state.cfg.origin.timeout(),
        state.shutdown.clone(),
        Arc::clone(&state.workers),
    );
    Ok(head)
}

fn forbidden_dynamic() -> Abort {
    Abort::new(
        StatusCode::FORBIDDEN,
        "Offload server doesn't do dynamic content.",
    )
}

fn respond(
    metadata: &HeaderList,
    range: ByteRange,
    total: i64,
    body: BoxedBody,
) -> Response<BoxedBody> {
    let status = if range.partial {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let mut builder = Response::builder()
        .status(status)
        .header("Status", status_line(status))
        .header("Date", httpdate::fmt_http_date(SystemTime::now()))
        .header("Server", SERVER_STRING)
        .header("Connection", "close");
    if let Some(etag) = metadata.get("ETag") {
        builder = builder.header("ETag", etag);
    }
    if let Some(lastmodified) = metadata.get("Last-Modified") {
        builder = builder.header("Last-Modified", lastmodified);
    }
    builder = builder
        .header("Content-Length", (range.end - range.start + 1).to_string())
        .header("Accept-Ranges", "bytes")
        .header(
            "Content-Type",
            metadata
                .get("Content-Type")
                .unwrap_or("application/octet-stream"),
        );
    if range.partial {
        builder = builder.header(
            "Content-Range",
            format!("bytes {}-{}/{}", range.start, range.end, total),
        );
    }
    builder.body(body).unwrap()
}

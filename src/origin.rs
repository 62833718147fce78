use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http::{Method, Request, StatusCode, Uri};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::constants::{BYPASS_HEADER, SERVER_STRING};
use crate::headers::HeaderList;

/// HTTP client for the single base server this instance offloads. Every
/// outbound request carries the bypass header so the origin-side module
/// never redirects us back at ourselves.
#[derive(Clone)]
pub struct OriginClient {
    client: Client<HttpConnector, Full<Bytes>>,
    host: String,
    port: u16,
    timeout: Duration,
}

pub struct OriginHead {
    pub status: StatusCode,
    pub headers: HeaderList,
}

impl OriginClient {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        let connector = HttpConnector::new();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self {
            client,
            host: host.to_string(),
            port,
            timeout,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn head(&self, uri: &str) -> Result<OriginHead> {
        let resp = self.send(Method::HEAD, uri).await?;
        let status = resp.status();
        let headers = HeaderList::from_http(resp.headers());
        Ok(OriginHead { status, headers })
    }

    /// The returned body is still streaming from the base server,
    /// positioned at the first body byte.
    pub async fn get(&self, uri: &str) -> Result<(StatusCode, HeaderList, Incoming)> {
        let resp = self.send(Method::GET, uri).await?;
        let status = resp.status();
        let headers = HeaderList::from_http(resp.headers());
        Ok((status, headers, resp.into_body()))
    }

    async fn send(&self, method: Method, uri: &str) -> Result<http::Response<Incoming>> {
        let target: Uri = format!("http://{}:{}{}", self.host, self.port, uri)
            .parse()
            .context("build base server uri")?;
        let authority = if self.port == 80 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        };
        let req = Request::builder()
            .method(method)
            .uri(target)
            .header(http::header::HOST, authority)
            .header(http::header::USER_AGENT, SERVER_STRING)
            .header(http::header::CONNECTION, "close")
            .header(BYPASS_HEADER, "true")
            .body(Full::new(Bytes::new()))
            .context("build base server request")?;

        match tokio::time::timeout(self.timeout, self.client.request(req)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(err)) => {
                log::warn!("base server request failed: {err}");
                Err(anyhow!("Couldn't talk to offload base server."))
            }
            Err(_) => Err(anyhow!("Timeout while talking to offload base server.")),
        }
    }
}

pub fn status_line(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    }
}

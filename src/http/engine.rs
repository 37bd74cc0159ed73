//! Blocking HTTP client used by the transfer managers.
//!
//! The managers run on plain worker threads, so the engine exposes a
//! synchronous interface. [`ReqwestEngine`] drives `reqwest` on its own
//! small tokio runtime.

use std::error::Error as StdError;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use tokio::runtime::Runtime;
use tracing::{debug, trace};

use crate::core::CommoError;
use crate::core::constants::{DEFAULT_MP_CONN_TIMEOUT_SECS, DEFAULT_MP_XFER_TIMEOUT_SECS};
use crate::net::addr::parse_ip;
use crate::net::resolver::resolve;
use crate::streaming::TlsCredentials;
use crate::streaming::tls::{ca_only_config, client_config};

/// How the server's certificate is checked for `https` URLs.
#[derive(Debug, Clone, Default)]
pub enum HttpTls {
    /// Built-in web roots.
    #[default]
    Default,
    /// Present the client certificate and trust only its CAs. Hostnames
    /// are not checked.
    Client(TlsCredentials),
    /// Trust only the CAs in this PEM bundle. Hostnames are not checked.
    CaOnly(String),
    /// Accept any certificate.
    Insecure,
}

/// Per-request settings.
#[derive(Debug, Clone)]
pub struct HttpOptions {
    /// Certificate handling.
    pub tls: HttpTls,
    /// Limit for establishing the connection.
    pub connect_timeout: Duration,
    /// Longest gap without data once connected.
    pub transfer_timeout: Duration,
    /// Basic authentication credentials.
    pub basic_auth: Option<(String, String)>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            tls: HttpTls::Default,
            connect_timeout: Duration::from_secs(DEFAULT_MP_CONN_TIMEOUT_SECS),
            transfer_timeout: Duration::from_secs(DEFAULT_MP_XFER_TIMEOUT_SECS),
            basic_auth: None,
        }
    }
}

/// Status and body of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body as text.
    pub body: String,
}

/// Why a request did not complete.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// The URL could not be parsed.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The host name did not resolve.
    #[error("could not resolve host {0}")]
    Resolve(String),

    /// The connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// No progress within the configured timeout.
    #[error("transfer timed out")]
    Timeout,

    /// The server certificate was rejected.
    #[error("server certificate not trusted")]
    UntrustedServer,

    /// Any other TLS failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// The server answered with an unexpected status.
    #[error("unexpected http status {0}")]
    Status(u16),

    /// Reading or writing the local file failed.
    #[error("local file error: {0}")]
    LocalFile(#[source] std::io::Error),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl From<HttpError> for CommoError {
    fn from(err: HttpError) -> Self {
        CommoError::Http(err.to_string())
    }
}

/// The HTTP operations transfers need.
///
/// Calls block the calling thread until the request finishes.
pub trait HttpEngine: Send + Sync {
    /// GET `url`, returning the body as text.
    fn get(&self, url: &str, opts: &HttpOptions) -> Result<HttpResponse, HttpError>;

    /// POST `file` as a single multipart field.
    #[allow(clippy::too_many_arguments)]
    fn post_multipart(
        &self,
        url: &str,
        field: &str,
        file: &Path,
        filename: &str,
        content_type: &str,
        opts: &HttpOptions,
        progress: &mut dyn FnMut(u64),
    ) -> Result<HttpResponse, HttpError>;

    /// PUT a `text/plain` body.
    fn put_text(&self, url: &str, body: &str, opts: &HttpOptions) -> Result<HttpResponse, HttpError>;

    /// PUT the contents of `file`.
    fn put_file(
        &self,
        url: &str,
        file: &Path,
        opts: &HttpOptions,
        progress: &mut dyn FnMut(u64),
    ) -> Result<HttpResponse, HttpError>;

    /// GET `url` into `dest`, which is created or truncated.
    ///
    /// Anything but status 200 is [`HttpError::Status`]. `progress` sees
    /// the bytes written so far and the expected total when known.
    fn download(
        &self,
        url: &str,
        dest: &Path,
        opts: &HttpOptions,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64, HttpError>;
}

/// [`HttpEngine`] backed by `reqwest`.
pub struct ReqwestEngine {
    runtime: Runtime,
}

impl ReqwestEngine {
    /// Start the engine's runtime.
    pub fn new() -> crate::core::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("cmohttp")
            .enable_all()
            .build()?;
        Ok(Self { runtime })
    }

    fn client(&self, url: &str, opts: &HttpOptions) -> Result<reqwest::Client, HttpError> {
        check_host(url)?;
        let mut builder = reqwest::Client::builder()
            .no_proxy()
            .connect_timeout(opts.connect_timeout)
            .read_timeout(opts.transfer_timeout);
        builder = match &opts.tls {
            HttpTls::Default => builder,
            HttpTls::Client(creds) => {
                let config = client_config(creds).map_err(|e| HttpError::Tls(e.to_string()))?;
                builder.use_preconfigured_tls((*config).clone())
            }
            HttpTls::CaOnly(ca) => {
                let config = ca_only_config(ca).map_err(|e| HttpError::Tls(e.to_string()))?;
                builder.use_preconfigured_tls((*config).clone())
            }
            HttpTls::Insecure => builder.danger_accept_invalid_certs(true),
        };
        builder.build().map_err(|e| HttpError::Other(e.to_string()))
    }

    fn request(
        &self,
        client: &reqwest::Client,
        method: reqwest::Method,
        url: &str,
        opts: &HttpOptions,
    ) -> reqwest::RequestBuilder {
        let req = client.request(method, url);
        match &opts.basic_auth {
            Some((user, pass)) => req.basic_auth(user, Some(pass)),
            None => req,
        }
    }

    fn finish(&self, req: reqwest::RequestBuilder) -> Result<HttpResponse, HttpError> {
        self.runtime.block_on(async {
            let resp = req.send().await.map_err(classify)?;
            let status = resp.status().as_u16();
            let body = resp.text().await.map_err(classify)?;
            trace!(status, len = body.len(), "http response");
            Ok(HttpResponse { status, body })
        })
    }
}

impl HttpEngine for ReqwestEngine {
    fn get(&self, url: &str, opts: &HttpOptions) -> Result<HttpResponse, HttpError> {
        let client = self.client(url, opts)?;
        self.finish(self.request(&client, reqwest::Method::GET, url, opts))
    }

    fn post_multipart(
        &self,
        url: &str,
        field: &str,
        file: &Path,
        filename: &str,
        content_type: &str,
        opts: &HttpOptions,
        progress: &mut dyn FnMut(u64),
    ) -> Result<HttpResponse, HttpError> {
        let client = self.client(url, opts)?;
        let data = std::fs::read(file).map_err(HttpError::LocalFile)?;
        let len = data.len() as u64;
        let part = Part::bytes(data)
            .file_name(filename.to_string())
            .mime_str(content_type)
            .map_err(|e| HttpError::Other(e.to_string()))?;
        let form = Form::new().part(field.to_string(), part);
        let resp = self.finish(self.request(&client, reqwest::Method::POST, url, opts).multipart(form))?;
        progress(len);
        Ok(resp)
    }

    fn put_text(&self, url: &str, body: &str, opts: &HttpOptions) -> Result<HttpResponse, HttpError> {
        let client = self.client(url, opts)?;
        let req = self
            .request(&client, reqwest::Method::PUT, url, opts)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body.to_string());
        self.finish(req)
    }

    fn put_file(
        &self,
        url: &str,
        file: &Path,
        opts: &HttpOptions,
        progress: &mut dyn FnMut(u64),
    ) -> Result<HttpResponse, HttpError> {
        let client = self.client(url, opts)?;
        let data = std::fs::read(file).map_err(HttpError::LocalFile)?;
        let len = data.len() as u64;
        let resp = self.finish(self.request(&client, reqwest::Method::PUT, url, opts).body(data))?;
        progress(len);
        Ok(resp)
    }

    fn download(
        &self,
        url: &str,
        dest: &Path,
        opts: &HttpOptions,
        progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64, HttpError> {
        let client = self.client(url, opts)?;
        let req = self.request(&client, reqwest::Method::GET, url, opts);
        self.runtime.block_on(async {
            let mut resp = req.send().await.map_err(classify)?;
            let status = resp.status().as_u16();
            if status != 200 {
                debug!(url, status, "download refused");
                return Err(HttpError::Status(status));
            }
            let total = resp.content_length();
            let mut out = File::create(dest).map_err(HttpError::LocalFile)?;
            let mut received = 0u64;
            while let Some(chunk) = resp.chunk().await.map_err(classify)? {
                out.write_all(&chunk).map_err(HttpError::LocalFile)?;
                received += chunk.len() as u64;
                progress(received, total);
            }
            out.flush().map_err(HttpError::LocalFile)?;
            Ok(received)
        })
    }
}

/// Resolve the URL's host up front so lookup failures are reported as such.
fn check_host(url: &str) -> Result<(), HttpError> {
    let parsed = url::Url::parse(url).map_err(|e| HttpError::InvalidUrl(format!("{url}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| HttpError::InvalidUrl(format!("{url}: no host")))?;
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if parse_ip(bare).is_some() || resolve(bare).is_some() {
        Ok(())
    } else {
        Err(HttpError::Resolve(host.to_string()))
    }
}

fn classify(err: reqwest::Error) -> HttpError {
    if err.is_timeout() {
        return HttpError::Timeout;
    }
    if let Some(tls) = find_cause::<rustls::Error>(&err) {
        return match tls {
            rustls::Error::InvalidCertificate(_) => HttpError::UntrustedServer,
            other => HttpError::Tls(other.to_string()),
        };
    }
    if let Some(io) = find_cause::<std::io::Error>(&err)
        && io.kind() == std::io::ErrorKind::TimedOut
    {
        return HttpError::Timeout;
    }
    if err.is_connect() {
        return HttpError::Connect(err.to_string());
    }
    if err.is_builder() {
        return HttpError::InvalidUrl(err.to_string());
    }
    HttpError::Other(err.to_string())
}

/// First error of type `T` in the cause chain of `err`.
///
/// `io::Error` hides a wrapped error from `source()`, so those are opened
/// explicitly.
fn find_cause<'a, T: StdError + 'static>(err: &'a (dyn StdError + 'static)) -> Option<&'a T> {
    let mut cur = Some(err);
    while let Some(e) = cur {
        if let Some(found) = e.downcast_ref::<T>() {
            return Some(found);
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>()
            && let Some(found) = io.get_ref().and_then(|inner| inner.downcast_ref::<T>())
        {
            return Some(found);
        }
        cur = e.source();
    }
    None
}

//! Embedded web server for peer-hosted mission packages.
//!
//! Serves `GET /getfile?file=<transfer id>` from the files of transfers that
//! are in progress and `GET /getinfo` as a liveness check. Anything else is
//! a 404 page.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::core::Result;
use crate::core::constants::FILE_SERVER_INFO;

const NOT_FOUND_PAGE: &str =
    "<html><head><title>File not found</title></head><body>Could not locate specified file</body></html>";

/// Maps transfer ids to the files being offered.
pub trait FileLookup: Send + Sync {
    /// File of transfer `id`, if it is currently offered.
    fn file_for_transfer(&self, id: u32) -> Option<PathBuf>;
}

/// A running server. Stops when dropped.
pub struct FileServer {
    runtime: Option<Runtime>,
    shutdown: Option<oneshot::Sender<()>>,
    local_addr: SocketAddr,
}

impl FileServer {
    /// Bind `0.0.0.0:port` and start serving. Port 0 picks a free port.
    pub fn start(port: u16, lookup: Arc<dyn FileLookup>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("cmompweb")
            .enable_all()
            .build()?;
        let listener = runtime.block_on(tokio::net::TcpListener::bind(("0.0.0.0", port)))?;
        let local_addr = listener.local_addr()?;

        let app = Router::new()
            .route("/getfile", get(get_file))
            .route("/getinfo", get(get_info))
            .fallback(not_found)
            .with_state(lookup);

        let (tx, rx) = oneshot::channel::<()>();
        runtime.spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "file server stopped");
            }
        });
        info!(port = local_addr.port(), "local web server started");

        Ok(Self {
            runtime: Some(runtime),
            shutdown: Some(tx),
            local_addr,
        })
    }

    /// Port the server is bound to.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }
}

impl Drop for FileServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
        debug!(port = self.local_addr.port(), "local web server stopped");
    }
}

async fn get_info() -> &'static str {
    FILE_SERVER_INFO
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Html(NOT_FOUND_PAGE)).into_response()
}

async fn get_file(
    State(lookup): State<Arc<dyn FileLookup>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(id) = params.get("file").and_then(|f| f.parse::<u32>().ok()) else {
        debug!("file request without a valid transfer id");
        return not_found().await;
    };
    let Some(path) = lookup.file_for_transfer(id) else {
        debug!(id, "file request for unknown transfer");
        return not_found().await;
    };
    match tokio::fs::read(&path).await {
        Ok(data) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            data,
        )
            .into_response(),
        Err(e) => {
            debug!(id, file = %path.display(), error = %e, "transfer file could not be opened");
            not_found().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::engine::{HttpEngine, HttpOptions, ReqwestEngine};

    struct OneFile(PathBuf);

    impl FileLookup for OneFile {
        fn file_for_transfer(&self, id: u32) -> Option<PathBuf> {
            (id == 7).then(|| self.0.clone())
        }
    }

    #[test]
    fn test_serves_known_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("pkg.zip");
        std::fs::write(&src, b"package bytes").unwrap();
        let server = FileServer::start(0, Arc::new(OneFile(src))).unwrap();
        let base = format!("http://127.0.0.1:{}", server.port());

        let engine = ReqwestEngine::new().unwrap();
        let opts = HttpOptions::default();

        let info = engine.get(&format!("{base}/getinfo"), &opts).unwrap();
        assert_eq!((info.status, info.body.as_str()), (200, FILE_SERVER_INFO));

        let dest = dir.path().join("out.zip");
        let mut last = 0;
        let n = engine
            .download(&format!("{base}/getfile?file=7&sender=a"), &dest, &opts, &mut |got, _| last = got)
            .unwrap();
        assert_eq!(n, 13);
        assert_eq!(last, 13);
        assert_eq!(std::fs::read(&dest).unwrap(), b"package bytes");
    }

    #[test]
    fn test_unknown_requests_are_404() {
        let dir = tempfile::tempdir().unwrap();
        let server = FileServer::start(0, Arc::new(OneFile(dir.path().join("missing")))).unwrap();
        let base = format!("http://127.0.0.1:{}", server.port());
        let engine = ReqwestEngine::new().unwrap();
        let opts = HttpOptions::default();

        for path in ["/getfile?file=8", "/getfile?file=x", "/getfile?file=7", "/other"] {
            let resp = engine.get(&format!("{base}{path}"), &opts).unwrap();
            assert_eq!(resp.status, 404, "{path}");
            assert!(resp.body.contains("File not found"));
        }
    }
}

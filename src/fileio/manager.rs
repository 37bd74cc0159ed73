//! Simple file uploads and downloads.
//!
//! Transfers are created idle by [`SimpleFileIOManager::simple_file_transfer_init`]
//! and run one at a time on the I/O thread once started. Reports go to the
//! client from a second thread in the order they were produced.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};
use url::Url;

use super::io::{SimpleFileIO, SimpleFileIOStatus as Status, SimpleFileIOUpdate};
use crate::core::constants::SIMPLE_FILE_THREADS;
use crate::core::{CommoError, Result};
use crate::http::{HttpEngine, HttpError, HttpOptions, HttpTls};
use crate::streaming::tls::root_store;
use crate::threading::{StopFlag, ThreadWorker, ThreadedHandler, WorkQueue};

const IO_THREAD: usize = 0;
const STATUS_THREAD: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Http,
    Https,
    Ftp,
}

#[derive(Debug)]
struct FileTransfer {
    id: u32,
    upload: bool,
    url: String,
    scheme: Scheme,
    local_file: PathBuf,
    ca_pem: Option<String>,
    login: Option<(String, String)>,
}

type Failure = (Status, String);

struct Pending {
    next_id: u32,
    transfers: BTreeMap<u32, FileTransfer>,
}

struct Inner {
    io: Arc<dyn SimpleFileIO>,
    http: Arc<dyn HttpEngine>,
    pending: Mutex<Pending>,
    requests: WorkQueue<FileTransfer>,
    updates: WorkQueue<SimpleFileIOUpdate>,
}

/// Runs client-requested uploads and downloads.
pub struct SimpleFileIOManager {
    inner: Arc<Inner>,
    handler: ThreadedHandler,
}

impl SimpleFileIOManager {
    /// Create the manager and start its threads.
    pub fn new(io: Arc<dyn SimpleFileIO>, http: Arc<dyn HttpEngine>) -> Result<Self> {
        let inner = Arc::new(Inner {
            io,
            http,
            pending: Mutex::new(Pending {
                next_id: 0,
                transfers: BTreeMap::new(),
            }),
            requests: WorkQueue::new(),
            updates: WorkQueue::new(),
        });
        let handler = ThreadedHandler::new(SIMPLE_FILE_THREADS);
        handler.start(Arc::clone(&inner))?;
        Ok(Self { inner, handler })
    }

    /// Create a transfer between `local_file` and `remote_uri`.
    ///
    /// `ca_cert` is a PEM bundle trusted for `https`; without it any server
    /// certificate is accepted. A password needs a user name.
    pub fn simple_file_transfer_init(
        &self,
        for_upload: bool,
        remote_uri: &str,
        ca_cert: Option<&str>,
        user: Option<&str>,
        password: Option<&str>,
        local_file: &Path,
    ) -> Result<u32> {
        let url = Url::parse(remote_uri).map_err(|e| CommoError::invalid(format!("bad url: {e}")))?;
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            "ftp" | "ftps" => Scheme::Ftp,
            other => return Err(CommoError::invalid(format!("unsupported scheme {other}"))),
        };
        let login = match (user, password) {
            (None, Some(_)) => return Err(CommoError::invalid("password without user name")),
            (Some(u), p) => Some((u.to_string(), p.unwrap_or_default().to_string())),
            (None, None) => None,
        };
        if let Some(pem) = ca_cert {
            root_store(pem)?;
        }

        let mut pending = self.inner.pending.lock();
        let id = pending.next_id;
        pending.next_id = pending.next_id.wrapping_add(1);
        info!(
            id,
            direction = if for_upload { "upload" } else { "download" },
            url = remote_uri,
            file = %local_file.display(),
            "simple transfer created"
        );
        pending.transfers.insert(
            id,
            FileTransfer {
                id,
                upload: for_upload,
                url: remote_uri.to_string(),
                scheme,
                local_file: local_file.to_path_buf(),
                ca_pem: ca_cert.map(str::to_string),
                login,
            },
        );
        Ok(id)
    }

    /// Start a transfer created by [`Self::simple_file_transfer_init`].
    pub fn simple_file_transfer_start(&self, id: u32) -> Result<()> {
        let xfer = self
            .inner
            .pending
            .lock()
            .transfers
            .remove(&id)
            .ok_or_else(|| CommoError::invalid(format!("unknown transfer {id}")))?;
        debug!(id, "simple transfer started");
        self.inner.requests.push(xfer);
        Ok(())
    }
}

impl Drop for SimpleFileIOManager {
    fn drop(&mut self) {
        self.handler.stop(&*self.inner);
    }
}

impl Inner {
    fn report(&self, id: u32, status: Status, info: Option<String>, bytes: u64, total: u64) {
        self.updates.push(SimpleFileIOUpdate {
            xfer_id: id,
            status,
            additional_info: info,
            bytes_transferred: bytes,
            total_bytes_to_transfer: total,
        });
    }

    fn transfer(&self, xfer: &FileTransfer, bytes: &mut u64, total: &mut u64) -> std::result::Result<(), Failure> {
        let tls = match (xfer.scheme, &xfer.ca_pem) {
            (Scheme::Ftp, _) => {
                return Err((Status::UrlUnsupported, "ftp transfers are not supported".into()));
            }
            (Scheme::Https, Some(ca)) => HttpTls::CaOnly(ca.clone()),
            (Scheme::Https, None) => HttpTls::Insecure,
            (Scheme::Http, _) => HttpTls::Default,
        };
        let opts = HttpOptions {
            tls,
            basic_auth: xfer.login.clone(),
            ..HttpOptions::default()
        };
        let id = xfer.id;

        if xfer.upload {
            let len = fs::metadata(&xfer.local_file)
                .map_err(|_| {
                    (
                        Status::LocalFileOpenFailure,
                        "Could not determine file size - check path and permissions".to_string(),
                    )
                })?
                .len();
            File::open(&xfer.local_file).map_err(|_| {
                (
                    Status::LocalFileOpenFailure,
                    "Could not open file - check path and permissions".to_string(),
                )
            })?;
            *total = len;
            let resp = self
                .http
                .put_file(&xfer.url, &xfer.local_file, &opts, &mut |sent| {
                    if sent != *bytes {
                        *bytes = sent;
                        self.report(id, Status::InProgress, None, sent, len);
                    }
                })
                .map_err(classify)?;
            if !(200..300).contains(&resp.status) {
                return Err(status_failure(resp.status));
            }
        } else {
            File::create(&xfer.local_file).map_err(|_| {
                (
                    Status::LocalFileOpenFailure,
                    "Could not open file - check path and permissions".to_string(),
                )
            })?;
            let got = self
                .http
                .download(&xfer.url, &xfer.local_file, &opts, &mut |got, expected| {
                    if let Some(n) = expected {
                        *total = n;
                    }
                    if got != *bytes {
                        *bytes = got;
                        self.report(id, Status::InProgress, None, got, *total);
                    }
                })
                .map_err(classify)?;
            *bytes = got;
        }
        Ok(())
    }

    fn io_loop(&self, stop: &StopFlag) {
        while let Some(xfer) = self.requests.wait_pop(stop) {
            let (mut bytes, mut total) = (0, 0);
            let result = self.transfer(&xfer, &mut bytes, &mut total);
            match result {
                Ok(()) => {
                    info!(id = xfer.id, bytes, "simple transfer succeeded");
                    self.report(xfer.id, Status::Success, None, bytes, total);
                }
                Err((status, detail)) => {
                    info!(id = xfer.id, ?status, detail = %detail, bytes, "simple transfer failed");
                    self.report(xfer.id, status, Some(detail), bytes, total);
                }
            }
        }
    }

    fn status_loop(&self, stop: &StopFlag) {
        while let Some(update) = self.updates.wait_pop(stop) {
            self.io.file_transfer_update(&update);
        }
    }
}

impl ThreadWorker for Inner {
    fn thread_entry(&self, index: usize, stop: &StopFlag) {
        match index {
            IO_THREAD => self.io_loop(stop),
            STATUS_THREAD => self.status_loop(stop),
            _ => {}
        }
    }

    fn thread_stop_signal(&self, index: usize) {
        match index {
            IO_THREAD => self.requests.wake_all(),
            _ => self.updates.wake_all(),
        }
    }
}

fn status_failure(code: u16) -> Failure {
    let status = match code {
        401 => Status::AuthError,
        403 => Status::AccessDenied,
        404 => Status::UrlNoResource,
        _ => Status::OtherError,
    };
    (status, format!("server answered {code}"))
}

fn classify(err: HttpError) -> Failure {
    let status = match &err {
        HttpError::Status(code) => return status_failure(*code),
        HttpError::InvalidUrl(_) => Status::UrlInvalid,
        HttpError::Resolve(_) => Status::HostResolutionFail,
        HttpError::Connect(_) => Status::ConnectFail,
        HttpError::Timeout => Status::TransferTimeout,
        HttpError::UntrustedServer => Status::SslUntrustedServer,
        HttpError::Tls(_) => Status::SslOtherError,
        HttpError::LocalFile(_) => Status::LocalIoError,
        HttpError::Other(_) => Status::OtherError,
    };
    (status, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpResponse, ReqwestEngine};
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<SimpleFileIOUpdate>>);

    impl SimpleFileIO for Recorder {
        fn file_transfer_update(&self, update: &SimpleFileIOUpdate) {
            self.0.lock().push(update.clone());
        }
    }

    impl Recorder {
        fn wait_final(&self) -> SimpleFileIOUpdate {
            for _ in 0..300 {
                if let Some(last) = self.0.lock().last()
                    && last.status != Status::InProgress
                {
                    return last.clone();
                }
                thread::sleep(Duration::from_millis(10));
            }
            panic!("no final report");
        }
    }

    /// Answers every request with a fixed status.
    struct FixedHttp {
        status: u16,
        seen: Mutex<Vec<HttpOptions>>,
    }

    impl FixedHttp {
        fn new(status: u16) -> Self {
            Self {
                status,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl HttpEngine for FixedHttp {
        fn get(&self, _url: &str, _opts: &HttpOptions) -> std::result::Result<HttpResponse, HttpError> {
            Err(HttpError::Other("unused".into()))
        }

        fn post_multipart(
            &self,
            _url: &str,
            _field: &str,
            _file: &Path,
            _filename: &str,
            _content_type: &str,
            _opts: &HttpOptions,
            _progress: &mut dyn FnMut(u64),
        ) -> std::result::Result<HttpResponse, HttpError> {
            Err(HttpError::Other("unused".into()))
        }

        fn put_text(
            &self,
            _url: &str,
            _body: &str,
            _opts: &HttpOptions,
        ) -> std::result::Result<HttpResponse, HttpError> {
            Err(HttpError::Other("unused".into()))
        }

        fn put_file(
            &self,
            _url: &str,
            file: &Path,
            opts: &HttpOptions,
            progress: &mut dyn FnMut(u64),
        ) -> std::result::Result<HttpResponse, HttpError> {
            self.seen.lock().push(opts.clone());
            progress(fs::metadata(file).map_err(HttpError::LocalFile)?.len());
            Ok(HttpResponse {
                status: self.status,
                body: String::new(),
            })
        }

        fn download(
            &self,
            _url: &str,
            dest: &Path,
            opts: &HttpOptions,
            progress: &mut dyn FnMut(u64, Option<u64>),
        ) -> std::result::Result<u64, HttpError> {
            self.seen.lock().push(opts.clone());
            if self.status != 200 {
                return Err(HttpError::Status(self.status));
            }
            fs::write(dest, b"hello").map_err(HttpError::LocalFile)?;
            progress(2, Some(5));
            progress(5, Some(5));
            Ok(5)
        }
    }

    fn manager(status: u16) -> (SimpleFileIOManager, Arc<Recorder>, Arc<FixedHttp>) {
        let rec = Arc::new(Recorder::default());
        let http = Arc::new(FixedHttp::new(status));
        let mgr = SimpleFileIOManager::new(rec.clone(), http.clone()).unwrap();
        (mgr, rec, http)
    }

    #[test]
    fn test_init_validation() {
        let (mgr, _, _) = manager(200);
        let file = Path::new("/tmp/x");
        assert!(mgr.simple_file_transfer_init(false, "not a url", None, None, None, file).is_err());
        assert!(mgr.simple_file_transfer_init(false, "gopher://h/x", None, None, None, file).is_err());
        assert!(mgr
            .simple_file_transfer_init(false, "http://h/x", None, None, Some("pw"), file)
            .is_err());
        assert!(matches!(
            mgr.simple_file_transfer_init(false, "https://h/x", Some("garbage"), None, None, file),
            Err(CommoError::InvalidCaCert)
        ));
        let a = mgr.simple_file_transfer_init(false, "http://h/x", None, Some("u"), None, file).unwrap();
        let b = mgr.simple_file_transfer_init(true, "ftp://h/x", None, None, None, file).unwrap();
        assert_eq!(b, a + 1);
        assert!(mgr.simple_file_transfer_start(b + 1).is_err());
    }

    #[test]
    fn test_download_reports_progress_then_success() {
        let (mgr, rec, http) = manager(200);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let id = mgr
            .simple_file_transfer_init(false, "https://h/x", None, Some("u"), Some("p"), &dest)
            .unwrap();
        mgr.simple_file_transfer_start(id).unwrap();
        let last = rec.wait_final();

        assert_eq!(last.status, Status::Success);
        assert_eq!((last.bytes_transferred, last.total_bytes_to_transfer), (5, 5));
        let statuses: Vec<_> = rec.0.lock().iter().map(|u| (u.status, u.bytes_transferred)).collect();
        assert_eq!(
            statuses,
            vec![(Status::InProgress, 2), (Status::InProgress, 5), (Status::Success, 5)]
        );
        let opts = http.seen.lock()[0].clone();
        assert!(matches!(opts.tls, HttpTls::Insecure));
        assert_eq!(opts.basic_auth, Some(("u".to_string(), "p".to_string())));
        assert_eq!(fs::read(&dest).unwrap(), b"hello");
    }

    #[test]
    fn test_http_status_mapping() {
        for (code, expected) in [
            (401, Status::AuthError),
            (403, Status::AccessDenied),
            (404, Status::UrlNoResource),
            (500, Status::OtherError),
        ] {
            let (mgr, rec, _) = manager(code);
            let dir = tempfile::tempdir().unwrap();
            let id = mgr
                .simple_file_transfer_init(false, "http://h/x", None, None, None, &dir.path().join("f"))
                .unwrap();
            mgr.simple_file_transfer_start(id).unwrap();
            assert_eq!(rec.wait_final().status, expected, "status {code}");
        }
    }

    #[test]
    fn test_upload_and_local_failures() {
        let (mgr, rec, _) = manager(201);
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("up.bin");
        fs::write(&src, b"abc").unwrap();

        let id = mgr.simple_file_transfer_init(true, "http://h/up", None, None, None, &src).unwrap();
        mgr.simple_file_transfer_start(id).unwrap();
        let done = rec.wait_final();
        assert_eq!(done.status, Status::Success);
        assert_eq!((done.bytes_transferred, done.total_bytes_to_transfer), (3, 3));

        rec.0.lock().clear();
        let id = mgr
            .simple_file_transfer_init(true, "http://h/up", None, None, None, &dir.path().join("missing"))
            .unwrap();
        mgr.simple_file_transfer_start(id).unwrap();
        assert_eq!(rec.wait_final().status, Status::LocalFileOpenFailure);

        rec.0.lock().clear();
        let id = mgr.simple_file_transfer_init(true, "ftps://h/up", None, None, None, &src).unwrap();
        mgr.simple_file_transfer_start(id).unwrap();
        assert_eq!(rec.wait_final().status, Status::UrlUnsupported);
    }

    #[test]
    fn test_connection_refused_with_real_engine() {
        let rec = Arc::new(Recorder::default());
        let mgr = SimpleFileIOManager::new(rec.clone(), Arc::new(ReqwestEngine::new().unwrap())).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let id = mgr
            .simple_file_transfer_init(false, "http://127.0.0.1:1/x", None, None, None, &dir.path().join("f"))
            .unwrap();
        mgr.simple_file_transfer_start(id).unwrap();
        assert_eq!(rec.wait_final().status, Status::ConnectFail);
    }
}

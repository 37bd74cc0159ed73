//! Mission package transfer manager.
//!
//! Outgoing packages reach each recipient one of two ways: through the TAK
//! server the recipient is connected to (the package is uploaded, then a
//! request pointing at the server copy is sent), or directly from the
//! embedded web server. Every request carries an ack UID; the transfer to a
//! recipient finishes when the matching acknowledgement arrives or the
//! wait times out.
//!
//! Incoming requests are downloaded on a dedicated thread, alternating
//! between the sender's URL and the host the sender is currently heard
//! from, with a pause between failed rounds.
//!
//! Four threads: client event delivery, downloads, acknowledgement
//! matching and server uploads.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tracing::{debug, info, trace, warn};
use url::Url;
use uuid::Uuid;

use super::io::{
    MissionPackageIO, MissionPackageTransferStatus as Status, ReceiveStatusUpdate, SendStatusUpdate,
};
use super::settings::MPTransferSettings;
use crate::contact::ContactManager;
use crate::core::constants::{MP_ACK_TIMEOUT, MP_RETRY_DELAY, MP_THREADS};
use crate::core::{
    CoTSendMethod, CommoError, ContactUid, DatagramListener, Result, StreamingMessageListener,
    TcpMessageListener,
};
use crate::cot::{CoTMessage, FileTransferAck, FileTransferRequest, TakMessage};
use crate::http::{FileLookup, FileServer, HttpEngine, HttpError, HttpOptions, HttpTls};
use crate::net::HwIfScanner;
use crate::streaming::StreamingSocketManagement;
use crate::threading::{StopFlag, ThreadWorker, ThreadedHandler, WorkQueue};

const EVENT_THREAD: usize = 0;
const RX_THREAD: usize = 1;
const ACK_THREAD: usize = 2;
const UPLOAD_THREAD: usize = 3;

const ACK_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

const SERVER_XFER_NAME: &str = "serverxfer";
const UPLOAD_FIELD: &str = "assetfile";
const UPLOAD_CONTENT_TYPE: &str = "application/x-zip-compressed";

const RX_SUCCESS: &str = "File transferred successfully";
const RX_FILE_EXISTS: &str = "File already exists; transfer not needed";
const RX_DISABLED: &str = "File transfers disabled";
const RX_FAILED: &str = "Unable to download";
const RX_BAD_STATUS: &str = "Received unexpected http response code";
const UPLOAD_FAILED: &str = "Uploading package to TAK server failed";
const QUERY_FAILED: &str = "Unable to query TAK server to see if package exists";

enum MpEvent {
    Send(SendStatusUpdate),
    Receive(ReceiveStatusUpdate),
}

/// The file behind an outgoing transfer.
#[derive(Debug, Clone)]
struct TxFile {
    path: PathBuf,
    filename: String,
    transfer_name: String,
    sha256: String,
    size: u64,
}

#[derive(Debug)]
struct OutstandingAck {
    contact: ContactUid,
    local: bool,
    sent_at: Instant,
}

impl OutstandingAck {
    fn new(contact: ContactUid, local: bool) -> Self {
        Self {
            contact,
            local,
            sent_at: Instant::now(),
        }
    }
}

/// Upload of one transfer through one server stream.
#[derive(Debug, Clone)]
struct UploadJob {
    xfer_id: u32,
    stream: String,
    /// Recipients behind the server; `None` for a plain server upload.
    recipients: Option<Vec<ContactUid>>,
}

#[derive(Debug)]
struct TxTransfer {
    file: TxFile,
    settings: MPTransferSettings,
    local_contacts: Vec<ContactUid>,
    uploads: Vec<UploadJob>,
    pending_uploads: usize,
    outstanding_acks: BTreeMap<String, OutstandingAck>,
}

impl TxTransfer {
    fn is_done(&self) -> bool {
        self.pending_uploads == 0 && self.outstanding_acks.is_empty()
    }
}

struct TxState {
    next_id: u32,
    pending: BTreeMap<u32, TxTransfer>,
    active: BTreeMap<u32, TxTransfer>,
    acks_to_ids: BTreeMap<String, u32>,
    web_port: u16,
    https_port: u16,
    web_server: Option<FileServer>,
}

/// A request waiting for the download thread.
struct RxRequest {
    request: FileTransferRequest,
    source_stream: String,
}

struct RxTransfer {
    request: FileTransferRequest,
    source_stream: String,
    local_file: PathBuf,
    settings: MPTransferSettings,
    sender_url: String,
    sender_url_is_server: bool,
    using_sender_url: bool,
    attempt: u32,
    next_attempt: Instant,
    bytes: u64,
}

impl RxTransfer {
    fn new(req: RxRequest, local_file: PathBuf, settings: MPTransferSettings) -> Self {
        let sender_url = adjusted_sender_url(&req.request);
        Self {
            sender_url_is_server: sender_url.contains("/Marti/"),
            sender_url,
            request: req.request,
            source_stream: req.source_stream,
            local_file,
            settings,
            using_sender_url: true,
            attempt: 1,
            next_attempt: Instant::now(),
            bytes: 0,
        }
    }

    fn update(&self, status: Status, detail: Option<String>) -> ReceiveStatusUpdate {
        ReceiveStatusUpdate {
            local_file: self.local_file.clone(),
            status,
            total_bytes_received: self.bytes,
            total_bytes_expected: self.request.size_in_bytes,
            attempt: self.attempt,
            max_attempts: self.settings.num_tries(),
            error_detail: detail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadStage {
    Query,
    Upload,
}

#[derive(Debug)]
struct UploadFailure {
    stage: UploadStage,
    reason: String,
}

/// Result of [`MissionPackageManager::send_file_init`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFileInit {
    /// Id to pass to [`MissionPackageManager::send_file_start`].
    pub xfer_id: u32,
    /// Destinations that cannot be reached and were left out.
    pub gone: Vec<ContactUid>,
}

struct Inner {
    our_uid: ContactUid,
    callsign: RwLock<String>,
    io: Arc<dyn MissionPackageIO>,
    http: Arc<dyn HttpEngine>,
    contacts: Arc<ContactManager>,
    streams: Arc<StreamingSocketManagement>,
    scanner: Arc<HwIfScanner>,
    settings: Mutex<MPTransferSettings>,
    tx: Mutex<TxState>,
    events: WorkQueue<MpEvent>,
    rx_requests: WorkQueue<RxRequest>,
    acks: WorkQueue<FileTransferAck>,
    uploads: WorkQueue<UploadJob>,
}

/// Sends and receives mission packages.
pub struct MissionPackageManager {
    inner: Arc<Inner>,
    handler: ThreadedHandler,
}

/// Lets the embedded web server find the files of active transfers.
struct ServedFiles(Weak<Inner>);

impl FileLookup for ServedFiles {
    fn file_for_transfer(&self, id: u32) -> Option<PathBuf> {
        let inner = self.0.upgrade()?;
        let tx = inner.tx.lock();
        tx.active.get(&id).map(|x| x.file.path.clone())
    }
}

impl MissionPackageManager {
    /// Create the manager and start its threads.
    ///
    /// Local web serving starts disabled; see [`Self::set_local_port`].
    pub fn new(
        our_uid: ContactUid,
        callsign: &str,
        io: Arc<dyn MissionPackageIO>,
        http: Arc<dyn HttpEngine>,
        contacts: Arc<ContactManager>,
        streams: Arc<StreamingSocketManagement>,
        scanner: Arc<HwIfScanner>,
    ) -> Result<Self> {
        let inner = Arc::new(Inner {
            our_uid,
            callsign: RwLock::new(callsign.to_string()),
            io,
            http,
            contacts,
            streams,
            scanner,
            settings: Mutex::new(MPTransferSettings::default()),
            tx: Mutex::new(TxState {
                next_id: 1,
                pending: BTreeMap::new(),
                active: BTreeMap::new(),
                acks_to_ids: BTreeMap::new(),
                web_port: 0,
                https_port: 0,
                web_server: None,
            }),
            events: WorkQueue::new(),
            rx_requests: WorkQueue::new(),
            acks: WorkQueue::new(),
            uploads: WorkQueue::new(),
        });
        let handler = ThreadedHandler::new(MP_THREADS);
        handler.start(Arc::clone(&inner))?;
        Ok(Self { inner, handler })
    }

    /// Callsign placed in requests and download URLs.
    pub fn set_callsign(&self, callsign: &str) {
        *self.inner.callsign.write() = callsign.to_string();
    }

    /// Current settings. New transfers capture a copy when created.
    pub fn settings(&self) -> MPTransferSettings {
        self.inner.settings.lock().clone()
    }

    /// Change the settings through one of the validating setters.
    pub fn update_settings(&self, f: impl FnOnce(&mut MPTransferSettings) -> Result<()>) -> Result<()> {
        let mut settings = self.inner.settings.lock();
        let mut updated = settings.clone();
        f(&mut updated)?;
        *settings = updated;
        Ok(())
    }

    /// Serve outgoing packages over http on `port`; 0 disables.
    ///
    /// Any change aborts transfers waiting on a locally hosted download.
    pub fn set_local_port(&self, port: u16) -> Result<()> {
        let old_server = {
            let mut guard = self.inner.tx.lock();
            let tx = &mut *guard;
            if tx.web_port == port {
                return Ok(());
            }
            tx.web_port = 0;
            self.inner.abort_local_transfers(tx);
            tx.web_server.take()
        };
        drop(old_server);
        if port == 0 {
            info!("local web server disabled");
            return Ok(());
        }

        let lookup = Arc::new(ServedFiles(Arc::downgrade(&self.inner)));
        let server = FileServer::start(port, lookup)
            .map_err(|e| CommoError::invalid(format!("cannot serve on port {port}: {e}")))?;
        let mut tx = self.inner.tx.lock();
        tx.web_server = Some(server);
        tx.web_port = port;
        Ok(())
    }

    /// Port of the local web server, 0 when disabled.
    pub fn local_port(&self) -> u16 {
        self.inner.tx.lock().web_port
    }

    /// Advertise `port` as the https front end of the local web server;
    /// 0 disables.
    ///
    /// Any change aborts transfers waiting on a locally hosted download.
    pub fn set_local_https_port(&self, port: u16) {
        let mut guard = self.inner.tx.lock();
        let tx = &mut *guard;
        if tx.https_port == port {
            return;
        }
        self.inner.abort_local_transfers(tx);
        tx.https_port = port;
    }

    /// Prepare sending `file` to `destinations`.
    ///
    /// Recipients with an active server stream get the package through the
    /// server when server transfers are enabled; others are served locally
    /// when the web server is running. Destinations reachable neither way
    /// are listed in the result. Fails if no destination is reachable.
    pub fn send_file_init(
        &self,
        destinations: &[ContactUid],
        file: &Path,
        filename: &str,
        transfer_name: &str,
    ) -> Result<SendFileInit> {
        let (sha256, size) = hash_file(file)
            .map_err(|e| CommoError::invalid(format!("cannot read {}: {e}", file.display())))?;
        let settings = self.settings();

        let mut tx = self.inner.tx.lock();
        let mut by_stream: BTreeMap<String, Vec<ContactUid>> = BTreeMap::new();
        let mut local = Vec::new();
        let mut gone = Vec::new();
        for uid in destinations {
            if let Ok(stream) = self.inner.contacts.get_stream_endpoint_identifier(uid, true) {
                if settings.server_transfer_enabled() {
                    by_stream.entry(stream).or_default().push(uid.clone());
                    continue;
                }
                debug!(contact = %uid, "server transfers disabled; trying a local transfer");
            }
            if tx.web_port != 0 && self.inner.contacts.has_contact(uid) {
                local.push(uid.clone());
            } else {
                gone.push(uid.clone());
            }
        }
        if by_stream.is_empty() && local.is_empty() {
            return Err(CommoError::invalid("none of the destinations is reachable"));
        }

        let xfer_id = tx.next_id;
        tx.next_id = tx.next_id.wrapping_add(1);
        let uploads = by_stream
            .into_iter()
            .map(|(stream, recipients)| UploadJob {
                xfer_id,
                stream,
                recipients: Some(recipients),
            })
            .collect();
        tx.pending.insert(
            xfer_id,
            TxTransfer {
                file: TxFile {
                    path: file.to_path_buf(),
                    filename: filename.to_string(),
                    transfer_name: transfer_name.to_string(),
                    sha256,
                    size,
                },
                settings,
                local_contacts: local,
                uploads,
                pending_uploads: 0,
                outstanding_acks: BTreeMap::new(),
            },
        );
        debug!(xfer_id, gone = gone.len(), "send transfer created");
        Ok(SendFileInit { xfer_id, gone })
    }

    /// Prepare uploading `file` to the server behind `stream`, without
    /// sending it to anyone.
    pub fn upload_file_init(&self, stream: &str, file: &Path, filename: &str) -> Result<u32> {
        if let Err(e) = self.inner.streams.address_for_endpoint(stream) {
            debug!(stream, error = %e, "upload to unusable stream");
            return Err(CommoError::ContactGone(Vec::new()));
        }
        let (sha256, size) = hash_file(file)
            .map_err(|e| CommoError::invalid(format!("cannot read {}: {e}", file.display())))?;
        let settings = self.settings();

        let mut tx = self.inner.tx.lock();
        let xfer_id = tx.next_id;
        tx.next_id = tx.next_id.wrapping_add(1);
        tx.pending.insert(
            xfer_id,
            TxTransfer {
                file: TxFile {
                    path: file.to_path_buf(),
                    filename: filename.to_string(),
                    transfer_name: SERVER_XFER_NAME.to_string(),
                    sha256,
                    size,
                },
                settings,
                local_contacts: Vec::new(),
                uploads: vec![UploadJob {
                    xfer_id,
                    stream: stream.to_string(),
                    recipients: None,
                }],
                pending_uploads: 0,
                outstanding_acks: BTreeMap::new(),
            },
        );
        Ok(xfer_id)
    }

    /// Start a transfer prepared by one of the init calls.
    pub fn send_file_start(&self, xfer_id: u32) -> Result<()> {
        let inner = &self.inner;
        let mut guard = inner.tx.lock();
        let tx = &mut *guard;
        let mut xfer = tx
            .pending
            .remove(&xfer_id)
            .ok_or_else(|| CommoError::invalid(format!("unknown transfer {xfer_id}")))?;

        let uploads = std::mem::take(&mut xfer.uploads);
        let local = std::mem::take(&mut xfer.local_contacts);
        xfer.pending_uploads = uploads.len();
        for job in &uploads {
            match &job.recipients {
                Some(recipients) => {
                    for r in recipients {
                        inner.send_event(xfer_id, Some(r), Status::ServerUploadPending, None, 0);
                    }
                }
                None => inner.send_event(xfer_id, None, Status::ServerUploadPending, None, 0),
            }
        }

        let url = if tx.web_port == 0 {
            None
        } else {
            inner.local_url(xfer_id, tx.web_port)
        };
        for contact in local {
            let Some(url) = &url else {
                let status = if tx.web_port == 0 {
                    Status::FinishedDisabledLocally
                } else {
                    Status::FinishedContactGone
                };
                inner.send_event(xfer_id, Some(&contact), status, None, 0);
                continue;
            };
            let ack_uid = Uuid::new_v4().to_string();
            match inner.send_request(&xfer.file, url, &ack_uid, &contact, tx.https_port) {
                Ok(()) => {
                    inner.send_event(xfer_id, Some(&contact), Status::AttemptInProgress, None, 0);
                    xfer.outstanding_acks
                        .insert(ack_uid.clone(), OutstandingAck::new(contact, true));
                    tx.acks_to_ids.insert(ack_uid, xfer_id);
                }
                Err(e) => {
                    debug!(xfer_id, contact = %contact, error = %e, "request not sent");
                    inner.send_event(xfer_id, Some(&contact), Status::FinishedContactGone, None, 0);
                }
            }
        }

        if !xfer.is_done() {
            tx.active.insert(xfer_id, xfer);
        }
        drop(guard);
        inner.uploads.extend(uploads);
        info!(xfer_id, "send transfer started");
        Ok(())
    }
}

impl Drop for MissionPackageManager {
    fn drop(&mut self) {
        self.handler.stop(&*self.inner);
        let server = self.inner.tx.lock().web_server.take();
        drop(server);
    }
}

impl Inner {
    fn send_event(
        &self,
        xfer_id: u32,
        recipient: Option<&ContactUid>,
        status: Status,
        detail: Option<String>,
        bytes: u64,
    ) {
        self.events.push(MpEvent::Send(SendStatusUpdate {
            xfer_id,
            recipient: recipient.cloned(),
            status,
            detail,
            total_bytes_transferred: bytes,
        }));
    }

    fn message_received(&self, source_stream: &str, msg: &CoTMessage) {
        if let Some(ack) = msg.file_transfer_ack() {
            if !ack.uid.is_empty() {
                self.acks.push(ack);
            }
            return;
        }
        if let Some(req) = msg.file_transfer_request() {
            debug!(name = %req.name, sender = %req.sender_callsign, "file transfer offered");
            self.rx_requests.push(RxRequest {
                request: req.clone(),
                source_stream: source_stream.to_string(),
            });
        }
    }

    fn local_url(&self, xfer_id: u32, port: u16) -> Option<String> {
        let addr = self.scanner.primary_address()?;
        local_file_url(addr, port, xfer_id, &self.callsign.read())
    }

    fn send_request(
        &self,
        file: &TxFile,
        url: &str,
        ack_uid: &str,
        contact: &ContactUid,
        https_port: u16,
    ) -> Result<()> {
        let req = FileTransferRequest {
            sha256: file.sha256.clone(),
            name: file.transfer_name.clone(),
            sender_filename: file.filename.clone(),
            sender_url: url.to_string(),
            size_in_bytes: file.size,
            sender_callsign: self.callsign.read().clone(),
            sender_uid: self.our_uid.clone(),
            ack_uid: ack_uid.to_string(),
            peer_hosted: https_port != 0,
            https_port: (https_port != 0).then_some(https_port),
        };
        let msg = CoTMessage::new_file_transfer_request(
            &Uuid::new_v4().to_string(),
            self.io.current_point(),
            &req,
        );
        self.contacts
            .send_cot(std::slice::from_ref(contact), &msg, CoTSendMethod::Any)
    }

    /// Drop outstanding acks matching `pred`, reporting `status` for each.
    fn drop_acks(&self, tx: &mut TxState, pred: impl Fn(&OutstandingAck) -> bool, status: Status) {
        let mut done = Vec::new();
        for (id, xfer) in tx.active.iter_mut() {
            let matched: Vec<String> = xfer
                .outstanding_acks
                .iter()
                .filter(|(_, a)| pred(a))
                .map(|(uid, _)| uid.clone())
                .collect();
            for uid in matched {
                if let Some(ack) = xfer.outstanding_acks.remove(&uid) {
                    tx.acks_to_ids.remove(&uid);
                    self.send_event(*id, Some(&ack.contact), status, None, 0);
                }
            }
            if xfer.is_done() {
                done.push(*id);
            }
        }
        for id in done {
            tx.active.remove(&id);
        }
    }

    fn abort_local_transfers(&self, tx: &mut TxState) {
        self.drop_acks(tx, |a| a.local, Status::FinishedDisabledLocally);
    }

    fn expire_acks(&self, now: Instant) {
        let mut tx = self.tx.lock();
        self.drop_acks(
            &mut tx,
            |a| now.saturating_duration_since(a.sent_at) >= MP_ACK_TIMEOUT,
            Status::FinishedTimedOut,
        );
    }

    fn process_ack(&self, ack: FileTransferAck) {
        let mut guard = self.tx.lock();
        let tx = &mut *guard;
        let Some(id) = tx.acks_to_ids.remove(&ack.uid) else {
            trace!(ack = %ack.uid, "ack for unknown transfer");
            return;
        };
        let Some(xfer) = tx.active.get_mut(&id) else {
            return;
        };
        let Some(out) = xfer.outstanding_acks.remove(&ack.uid) else {
            return;
        };
        let (status, bytes) = if ack.success {
            (Status::FinishedSuccess, ack.size_in_bytes)
        } else {
            (Status::FinishedFailed, 0)
        };
        debug!(xfer_id = id, contact = %out.contact, success = ack.success, "transfer acknowledged");
        self.send_event(id, Some(&out.contact), status, Some(ack.reason), bytes);
        if xfer.is_done() {
            tx.active.remove(&id);
        }
    }

    // =========================================================================
    // Uploads
    // =========================================================================

    fn server_base_url(&self, stream: &str, settings: &MPTransferSettings) -> Result<String> {
        let host = match self.streams.address_for_endpoint(stream)? {
            IpAddr::V4(a) => a.to_string(),
            IpAddr::V6(a) => format!("[{a}]"),
        };
        Ok(if self.streams.is_endpoint_ssl(stream)? {
            format!("https://{host}:{}/Marti", settings.https_port())
        } else {
            format!("http://{host}:{}/Marti", settings.http_port())
        })
    }

    fn upload_progress(&self, job: &UploadJob, bytes: u64) {
        match &job.recipients {
            Some(recipients) => {
                for r in recipients {
                    self.send_event(job.xfer_id, Some(r), Status::ServerUploadInProgress, None, bytes);
                }
            }
            None => self.send_event(job.xfer_id, None, Status::ServerUploadInProgress, None, bytes),
        }
    }

    /// Query the server for the package, upload it if missing and mark
    /// its visibility. Returns the server URL of the package.
    fn run_upload(
        &self,
        job: &UploadJob,
        file: &TxFile,
        settings: &MPTransferSettings,
        bytes: &mut u64,
    ) -> std::result::Result<String, UploadFailure> {
        let query_failed = |reason: String| UploadFailure {
            stage: UploadStage::Query,
            reason,
        };
        let base = self
            .server_base_url(&job.stream, settings)
            .map_err(|e| query_failed(e.to_string()))?;
        let tls = if base.starts_with("https:") {
            match self.streams.tls_credentials(&job.stream) {
                Ok(Some(creds)) => HttpTls::Client(creds),
                _ => return Err(query_failed("stream has no client certificate".into())),
            }
        } else {
            HttpTls::Default
        };
        let opts = settings.http_options(tls);

        let query = with_params(
            &format!("{base}/sync/missionquery"),
            &[("hash", file.sha256.as_str())],
        )
        .map_err(query_failed)?;
        let resp = self
            .http
            .get(&query, &opts)
            .map_err(|e| query_failed(e.to_string()))?;
        let url = match resp.status {
            200 => {
                debug!(xfer_id = job.xfer_id, "package already on server");
                resp.body.trim().to_string()
            }
            404 => self.post_package(job, file, &base, &opts, bytes)?,
            other => return Err(query_failed(format!("query answered {other}"))),
        };

        let tool = if job.recipients.is_some() { "private" } else { "public" };
        let tool_url = format!("{base}/api/sync/metadata/{}/tool", file.sha256);
        match self.http.put_text(&tool_url, tool, &opts) {
            Ok(r) if r.status == 200 => debug!(xfer_id = job.xfer_id, tool, "package visibility set"),
            Ok(r) => debug!(xfer_id = job.xfer_id, status = r.status, "setting package visibility failed"),
            Err(e) => debug!(xfer_id = job.xfer_id, error = %e, "setting package visibility failed"),
        }
        Ok(url)
    }

    fn post_package(
        &self,
        job: &UploadJob,
        file: &TxFile,
        base: &str,
        opts: &HttpOptions,
        bytes: &mut u64,
    ) -> std::result::Result<String, UploadFailure> {
        let failed = |reason: String| UploadFailure {
            stage: UploadStage::Upload,
            reason,
        };
        let creator = self.our_uid.to_string_lossy();
        let url = with_params(
            &format!("{base}/sync/missionupload"),
            &[
                ("hash", file.sha256.as_str()),
                ("filename", file.filename.as_str()),
                ("creatorUid", creator.as_str()),
            ],
        )
        .map_err(failed)?;
        let resp = self
            .http
            .post_multipart(
                &url,
                UPLOAD_FIELD,
                &file.path,
                &file.filename,
                UPLOAD_CONTENT_TYPE,
                opts,
                &mut |sent| {
                    *bytes = sent;
                    self.upload_progress(job, sent);
                },
            )
            .map_err(|e| failed(e.to_string()))?;
        if resp.status != 200 {
            return Err(failed(format!("upload answered {}", resp.status)));
        }
        Ok(resp.body.trim().to_string())
    }

    fn upload_finished(
        &self,
        job: &UploadJob,
        file: &TxFile,
        result: std::result::Result<String, UploadFailure>,
        bytes: u64,
    ) {
        let id = job.xfer_id;
        let mut guard = self.tx.lock();
        let tx = &mut *guard;
        match (&job.recipients, result) {
            (None, Ok(url)) => {
                info!(xfer_id = id, url = %url, "package uploaded");
                self.send_event(id, None, Status::ServerUploadSuccess, Some(url), bytes);
                self.send_event(id, None, Status::FinishedSuccess, None, bytes);
            }
            (None, Err(f)) => {
                warn!(xfer_id = id, reason = %f.reason, "package upload failed");
                self.send_event(id, None, Status::ServerUploadFailed, Some(UPLOAD_FAILED.into()), bytes);
                self.send_event(id, None, Status::FinishedFailed, None, bytes);
            }
            (Some(recipients), Err(f)) => {
                warn!(xfer_id = id, reason = %f.reason, "package upload failed");
                let detail = match f.stage {
                    UploadStage::Upload => UPLOAD_FAILED,
                    UploadStage::Query => QUERY_FAILED,
                };
                for r in recipients {
                    self.send_event(id, Some(r), Status::ServerUploadFailed, Some(detail.into()), bytes);
                    self.send_event(id, Some(r), Status::FinishedFailed, None, bytes);
                }
            }
            (Some(recipients), Ok(url)) => {
                info!(xfer_id = id, url = %url, "package on server; notifying recipients");
                for r in recipients {
                    self.send_event(id, Some(r), Status::ServerUploadSuccess, Some(url.clone()), bytes);
                    let ack_uid = Uuid::new_v4().to_string();
                    match self.send_request(file, &url, &ack_uid, r, 0) {
                        Ok(()) => {
                            self.send_event(id, Some(r), Status::AttemptInProgress, None, 0);
                            if let Some(xfer) = tx.active.get_mut(&id) {
                                xfer.outstanding_acks
                                    .insert(ack_uid.clone(), OutstandingAck::new(r.clone(), false));
                                tx.acks_to_ids.insert(ack_uid, id);
                            }
                        }
                        Err(e) => {
                            debug!(xfer_id = id, contact = %r, error = %e, "request not sent");
                            self.send_event(id, Some(r), Status::FinishedContactGone, None, 0);
                        }
                    }
                }
            }
        }

        if let Some(xfer) = tx.active.get_mut(&id) {
            xfer.pending_uploads = xfer.pending_uploads.saturating_sub(1);
            if xfer.is_done() {
                tx.active.remove(&id);
            }
        }
    }

    fn upload_loop(&self, stop: &StopFlag) {
        while let Some(job) = self.uploads.wait_pop(stop) {
            let snapshot = self
                .tx
                .lock()
                .active
                .get(&job.xfer_id)
                .map(|x| (x.file.clone(), x.settings.clone()));
            let Some((file, settings)) = snapshot else {
                warn!(xfer_id = job.xfer_id, "upload for vanished transfer");
                continue;
            };
            let mut bytes = 0;
            let result = self.run_upload(&job, &file, &settings, &mut bytes);
            self.upload_finished(&job, &file, result, bytes);
        }
    }

    // =========================================================================
    // Downloads
    // =========================================================================

    fn send_ack(&self, req: &FileTransferRequest, success: bool, reason: &str) {
        let msg = CoTMessage::new_file_transfer_ack(
            &self.our_uid.to_string_lossy(),
            self.io.current_point(),
            req,
            &self.our_uid,
            !success,
            reason,
        );
        if let Err(e) =
            self.contacts
                .send_cot(std::slice::from_ref(&req.sender_uid), &msg, CoTSendMethod::Any)
        {
            debug!(sender = %req.sender_uid, error = %e, "transfer ack not sent");
        }
    }

    fn start_receive(&self, req: RxRequest, active: &mut Vec<RxTransfer>) {
        let r = &req.request;
        let init = self.io.mission_package_receive_init(
            &r.sender_filename,
            &r.name,
            &r.sha256,
            r.size_in_bytes,
            &r.sender_callsign,
        );
        let local_file = match init {
            Ok(path) => path,
            Err(Status::FinishedFileExists) => {
                debug!(name = %r.name, "package already present");
                self.send_ack(r, true, RX_FILE_EXISTS);
                return;
            }
            Err(Status::FinishedDisabledLocally) => {
                debug!(name = %r.name, "receiving disabled");
                self.send_ack(r, false, RX_DISABLED);
                return;
            }
            Err(status) => {
                debug!(name = %r.name, ?status, "package declined");
                return;
            }
        };
        if active.iter().any(|x| x.local_file == local_file) {
            debug!(file = %local_file.display(), "download to this file already running");
            return;
        }
        let settings = self.settings.lock().clone();
        active.push(RxTransfer::new(req, local_file, settings));
    }

    fn download_tls(&self, xfer: &RxTransfer) -> std::result::Result<HttpTls, String> {
        if xfer.request.peer_hosted {
            return Ok(HttpTls::Insecure);
        }
        let stream = match self
            .contacts
            .get_stream_endpoint_identifier(&xfer.request.sender_uid, false)
        {
            Ok(s) => s,
            Err(_) if !xfer.source_stream.is_empty() => xfer.source_stream.clone(),
            Err(_) => return Err("no stream to take client certificates from".into()),
        };
        match self.streams.tls_credentials(&stream) {
            Ok(Some(creds)) => Ok(HttpTls::Client(creds)),
            _ => Err(format!("stream {stream} has no client certificate")),
        }
    }

    /// One download attempt. Returns whether the transfer stays active.
    fn run_attempt(&self, xfer: &mut RxTransfer) -> bool {
        let mut url = xfer.sender_url.clone();
        if !xfer.using_sender_url {
            let sender = &xfer.request.sender_uid;
            let alternate = if !xfer.sender_url_is_server || !self.contacts.has_streaming_endpoint(sender) {
                self.contacts
                    .get_active_endpoint_host(sender)
                    .and_then(|host| replace_host(&url, &host))
            } else {
                None
            };
            match alternate {
                Some(alt) => url = alt,
                None => {
                    xfer.attempt += 1;
                    xfer.using_sender_url = true;
                }
            }
        }
        let url = with_params(&url, &[("receiver", self.callsign.read().as_str())]).unwrap_or(url);

        xfer.bytes = 0;
        let progress_base = xfer.update(Status::AttemptInProgress, None);
        self.events.push(MpEvent::Receive(progress_base.clone()));
        debug!(url = %url, attempt = xfer.attempt, "download attempt");

        let tls = if url.starts_with("https:") {
            self.download_tls(xfer)
        } else {
            Ok(HttpTls::Default)
        };
        let result = match tls {
            Ok(tls) => {
                let opts = xfer.settings.http_options(tls);
                self.http
                    .download(&url, &xfer.local_file, &opts, &mut |got, _| {
                        let mut ev = progress_base.clone();
                        ev.total_bytes_received = got;
                        self.events.push(MpEvent::Receive(ev));
                    })
            }
            Err(reason) => Err(HttpError::Tls(reason)),
        };

        match result {
            Ok(n) => {
                xfer.bytes = n;
                info!(file = %xfer.local_file.display(), bytes = n, "package received");
                self.events.push(MpEvent::Receive(
                    xfer.update(Status::FinishedSuccess, Some(RX_SUCCESS.into())),
                ));
                self.send_ack(&xfer.request, true, RX_SUCCESS);
                false
            }
            Err(e) => {
                let detail = match e {
                    HttpError::Status(_) => RX_BAD_STATUS.to_string(),
                    other => other.to_string(),
                };
                let tries = xfer.settings.num_tries();
                if xfer.using_sender_url && !xfer.sender_url_is_server && xfer.attempt < tries {
                    debug!(detail = %detail, "sender url failed; trying the sender's current host");
                    xfer.using_sender_url = false;
                    xfer.next_attempt = Instant::now();
                    return true;
                }
                xfer.attempt += 1;
                if xfer.attempt >= tries {
                    warn!(file = %xfer.local_file.display(), detail = %detail, "package download failed");
                    self.events
                        .push(MpEvent::Receive(xfer.update(Status::FinishedFailed, Some(detail))));
                    self.send_ack(&xfer.request, false, RX_FAILED);
                    false
                } else {
                    xfer.using_sender_url = true;
                    xfer.next_attempt = Instant::now() + MP_RETRY_DELAY;
                    self.events
                        .push(MpEvent::Receive(xfer.update(Status::AttemptFailed, Some(detail))));
                    true
                }
            }
        }
    }

    fn rx_loop(&self, stop: &StopFlag) {
        let mut active: Vec<RxTransfer> = Vec::new();
        while !stop.should_stop() {
            while let Some(req) = self.rx_requests.pop() {
                self.start_receive(req, &mut active);
            }
            let now = Instant::now();
            if let Some(i) = active.iter().position(|x| x.next_attempt <= now) {
                let mut xfer = active.swap_remove(i);
                if self.run_attempt(&mut xfer) {
                    active.push(xfer);
                }
                continue;
            }
            let next = active
                .iter()
                .map(|x| x.next_attempt.saturating_duration_since(now))
                .min();
            let req = match next {
                Some(wait) => self.rx_requests.wait_pop_timeout(stop, wait),
                None => self.rx_requests.wait_pop(stop),
            };
            if let Some(req) = req {
                self.start_receive(req, &mut active);
            }
        }
    }

    fn ack_loop(&self, stop: &StopFlag) {
        while !stop.should_stop() {
            if let Some(ack) = self.acks.wait_pop_timeout(stop, ACK_SWEEP_INTERVAL) {
                self.process_ack(ack);
            }
            self.expire_acks(Instant::now());
        }
    }

    fn event_loop(&self, stop: &StopFlag) {
        while let Some(ev) = self.events.wait_pop(stop) {
            match ev {
                MpEvent::Send(u) => self.io.mission_package_send_status_update(&u),
                MpEvent::Receive(u) => self.io.mission_package_receive_status_update(&u),
            }
        }
    }
}

impl ThreadWorker for Inner {
    fn thread_entry(&self, index: usize, stop: &StopFlag) {
        match index {
            EVENT_THREAD => self.event_loop(stop),
            RX_THREAD => self.rx_loop(stop),
            ACK_THREAD => self.ack_loop(stop),
            UPLOAD_THREAD => self.upload_loop(stop),
            _ => warn!(index, "unexpected mission package thread"),
        }
    }

    fn thread_stop_signal(&self, index: usize) {
        match index {
            EVENT_THREAD => self.events.wake_all(),
            RX_THREAD => self.rx_requests.wake_all(),
            ACK_THREAD => self.acks.wake_all(),
            _ => self.uploads.wake_all(),
        }
    }
}

impl DatagramListener for MissionPackageManager {
    fn datagram_received(&self, _endpoint_id: &str, _sender: Option<SocketAddr>, msg: &TakMessage) {
        if let Some(cot) = msg.cot_message() {
            self.inner.message_received("", cot);
        }
    }
}

impl TcpMessageListener for MissionPackageManager {
    fn tcp_message_received(&self, _endpoint_id: &str, _sender: Option<SocketAddr>, msg: &CoTMessage) {
        self.inner.message_received("", msg);
    }
}

impl StreamingMessageListener for MissionPackageManager {
    fn streaming_message_received(&self, stream_endpoint: &str, msg: &CoTMessage) {
        self.inner.message_received(stream_endpoint, msg);
    }
}

/// Hex SHA-256 and size of a file.
fn hash_file(path: &Path) -> std::io::Result<(String, u64)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 16 * 1024];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// Sender URL with peer-hosted https applied.
fn adjusted_sender_url(req: &FileTransferRequest) -> String {
    let (true, Some(port)) = (req.peer_hosted, req.https_port) else {
        return req.sender_url.clone();
    };
    let Ok(mut url) = Url::parse(&req.sender_url) else {
        return req.sender_url.clone();
    };
    if url.scheme() != "http" || url.set_scheme("https").is_err() || url.set_port(Some(port)).is_err() {
        return req.sender_url.clone();
    }
    url.into()
}

fn replace_host(url: &str, host: &str) -> Option<String> {
    let mut url = Url::parse(url).ok()?;
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    url.set_host(Some(&host)).ok()?;
    Some(url.into())
}

/// `base` with the query pairs appended.
fn with_params(base: &str, pairs: &[(&str, &str)]) -> std::result::Result<String, String> {
    let mut url = Url::parse(base).map_err(|e| format!("bad url {base}: {e}"))?;
    url.query_pairs_mut().extend_pairs(pairs);
    Ok(url.into())
}

fn local_file_url(addr: Ipv4Addr, port: u16, xfer_id: u32, callsign: &str) -> Option<String> {
    with_params(
        &format!("http://{addr}:{port}/getfile"),
        &[("file", xfer_id.to_string().as_str()), ("sender", callsign)],
    )
    .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CoTPointData, DatagramSender, StreamSender, TcpSender};
    use crate::http::HttpResponse;
    use std::thread;

    #[derive(Default)]
    struct FakeTransport {
        datagrams: Mutex<Vec<CoTMessage>>,
        streams: Mutex<Vec<(String, CoTMessage)>>,
    }

    impl DatagramSender for FakeTransport {
        fn send_datagram(&self, _dest: SocketAddr, msg: &CoTMessage, _v: u32) -> Result<()> {
            self.datagrams.lock().push(msg.clone());
            Ok(())
        }

        fn proto_level_change(&self, _v: u32) {}
    }

    impl TcpSender for FakeTransport {
        fn send_message(&self, _host: &str, _port: u16, _msg: &CoTMessage, _v: u32) -> Result<()> {
            Ok(())
        }
    }

    impl StreamSender for FakeTransport {
        fn send_message(&self, stream: &str, msg: &CoTMessage) -> Result<()> {
            self.streams.lock().push((stream.to_string(), msg.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingIO {
        dest: Mutex<Option<PathBuf>>,
        refuse: Mutex<Option<Status>>,
        sent: Mutex<Vec<SendStatusUpdate>>,
        received: Mutex<Vec<ReceiveStatusUpdate>>,
    }

    impl MissionPackageIO for RecordingIO {
        fn mission_package_receive_init(
            &self,
            _dest_file: &str,
            _transfer_name: &str,
            _sha256: &str,
            _size: u64,
            _sender_callsign: &str,
        ) -> std::result::Result<PathBuf, Status> {
            if let Some(status) = *self.refuse.lock() {
                return Err(status);
            }
            self.dest.lock().clone().ok_or(Status::FinishedFailed)
        }

        fn mission_package_send_status_update(&self, update: &SendStatusUpdate) {
            self.sent.lock().push(update.clone());
        }

        fn mission_package_receive_status_update(&self, update: &ReceiveStatusUpdate) {
            self.received.lock().push(update.clone());
        }

        fn current_point(&self) -> CoTPointData {
            CoTPointData::default()
        }
    }

    /// Answers server calls from a script and records every request.
    struct ScriptedHttp {
        query: (u16, String),
        upload: (u16, String),
        download_ok: bool,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedHttp {
        fn new(query: (u16, &str), upload: (u16, &str), download_ok: bool) -> Self {
            Self {
                query: (query.0, query.1.to_string()),
                upload: (upload.0, upload.1.to_string()),
                download_ok,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl HttpEngine for ScriptedHttp {
        fn get(&self, url: &str, _opts: &HttpOptions) -> std::result::Result<HttpResponse, HttpError> {
            self.calls.lock().push(format!("GET {url}"));
            Ok(HttpResponse {
                status: self.query.0,
                body: self.query.1.clone(),
            })
        }

        fn post_multipart(
            &self,
            url: &str,
            field: &str,
            file: &Path,
            _filename: &str,
            _content_type: &str,
            _opts: &HttpOptions,
            progress: &mut dyn FnMut(u64),
        ) -> std::result::Result<HttpResponse, HttpError> {
            self.calls.lock().push(format!("POST {field} {url}"));
            let len = std::fs::metadata(file).map_err(HttpError::LocalFile)?.len();
            progress(len);
            Ok(HttpResponse {
                status: self.upload.0,
                body: self.upload.1.clone(),
            })
        }

        fn put_text(
            &self,
            url: &str,
            body: &str,
            _opts: &HttpOptions,
        ) -> std::result::Result<HttpResponse, HttpError> {
            self.calls.lock().push(format!("PUT {url} {body}"));
            Ok(HttpResponse {
                status: 200,
                body: String::new(),
            })
        }

        fn put_file(
            &self,
            url: &str,
            _file: &Path,
            _opts: &HttpOptions,
            _progress: &mut dyn FnMut(u64),
        ) -> std::result::Result<HttpResponse, HttpError> {
            self.calls.lock().push(format!("PUT {url}"));
            Ok(HttpResponse {
                status: 200,
                body: String::new(),
            })
        }

        fn download(
            &self,
            url: &str,
            dest: &Path,
            _opts: &HttpOptions,
            progress: &mut dyn FnMut(u64, Option<u64>),
        ) -> std::result::Result<u64, HttpError> {
            self.calls.lock().push(format!("DOWNLOAD {url}"));
            if !self.download_ok {
                return Err(HttpError::Status(404));
            }
            std::fs::write(dest, b"pkg").map_err(HttpError::LocalFile)?;
            progress(3, Some(3));
            Ok(3)
        }
    }

    struct Harness {
        fake: Arc<FakeTransport>,
        io: Arc<RecordingIO>,
        http: Arc<ScriptedHttp>,
        contacts: Arc<ContactManager>,
        streams: Arc<StreamingSocketManagement>,
        mgr: MissionPackageManager,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(http: ScriptedHttp) -> Self {
            let fake = Arc::new(FakeTransport::default());
            let contacts =
                Arc::new(ContactManager::new(fake.clone(), fake.clone(), fake.clone()).unwrap());
            let streams = Arc::new(StreamingSocketManagement::new(ContactUid::from("ME")).unwrap());
            let scanner = Arc::new(HwIfScanner::new().unwrap());
            let io = Arc::new(RecordingIO::default());
            let http = Arc::new(http);
            let mgr = MissionPackageManager::new(
                ContactUid::from("ME"),
                "MYCALL",
                io.clone(),
                http.clone(),
                contacts.clone(),
                streams.clone(),
                scanner,
            )
            .unwrap();
            Self {
                fake,
                io,
                http,
                contacts,
                streams,
                mgr,
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn package(&self) -> PathBuf {
            let path = self.dir.path().join("pkg.zip");
            std::fs::write(&path, b"zip bytes").unwrap();
            path
        }

        /// A contact reachable only through a server stream.
        fn stream_contact(&self, uid: &str) -> String {
            let iface = self
                .streams
                .add_streaming_interface("127.0.0.1", 1, &[], None, None)
                .unwrap();
            self.contacts
                .streaming_message_received(&iface.remote_endpoint_id, &sa(uid, "*:-1:stcp"));
            iface.remote_endpoint_id
        }

        fn sent_for(&self, uid: Option<&str>) -> Vec<Status> {
            let uid = uid.map(ContactUid::from);
            self.io
                .sent
                .lock()
                .iter()
                .filter(|u| u.recipient == uid)
                .map(|u| u.status)
                .collect()
        }

        fn received(&self) -> Vec<Status> {
            self.io.received.lock().iter().map(|u| u.status).collect()
        }
    }

    fn sa(uid: &str, endpoint: &str) -> CoTMessage {
        let xml = format!(
            r#"<event version="2.0" uid="{uid}" type="a-f-G" how="m-g" time="2024-01-01T00:00:00Z" start="2024-01-01T00:00:00Z" stale="2024-01-01T00:01:00Z"><point lat="1" lon="2" hae="3" ce="4" le="5"/><detail><contact callsign="{uid}-CS" endpoint="{endpoint}"/></detail></event>"#
        );
        CoTMessage::parse(xml.as_bytes()).unwrap()
    }

    fn offer(sender: &str, url: &str) -> FileTransferRequest {
        FileTransferRequest {
            sha256: "ab".repeat(32),
            name: "pkg".into(),
            sender_filename: "pkg.zip".into(),
            sender_url: url.into(),
            size_in_bytes: 3,
            sender_callsign: "PEER-CS".into(),
            sender_uid: ContactUid::from(sender),
            ack_uid: "ack-1".into(),
            peer_hosted: false,
            https_port: None,
        }
    }

    fn wait_for(f: impl Fn() -> bool) {
        for _ in 0..300 {
            if f() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_url_helpers() {
        let mut req = offer("P", "http://10.0.0.1:8080/getfile?file=2&sender=X");
        assert_eq!(adjusted_sender_url(&req), req.sender_url);
        req.peer_hosted = true;
        req.https_port = Some(8443);
        assert_eq!(adjusted_sender_url(&req), "https://10.0.0.1:8443/getfile?file=2&sender=X");

        assert_eq!(
            replace_host("http://10.0.0.1:8080/getfile?file=2", "192.168.0.7").as_deref(),
            Some("http://192.168.0.7:8080/getfile?file=2")
        );
        assert_eq!(
            replace_host("http://10.0.0.1/x", "fe80::1").as_deref(),
            Some("http://[fe80::1]/x")
        );
        assert_eq!(
            with_params("http://h/getfile?file=2", &[("receiver", "ME")]).unwrap(),
            "http://h/getfile?file=2&receiver=ME"
        );
        assert_eq!(
            local_file_url(Ipv4Addr::new(10, 0, 0, 9), 8080, 5, "A B&C").unwrap(),
            "http://10.0.0.9:8080/getfile?file=5&sender=A+B%26C"
        );
    }

    #[test]
    fn test_send_init_routing() {
        let h = Harness::new(ScriptedHttp::new((404, ""), (200, ""), true));
        let file = h.package();
        let peer = ContactUid::from("PEER");
        let ghost = ContactUid::from("GHOST");
        h.contacts
            .config_known_endpoint_contact(&peer, Some("PEER-CS"), Some("10.1.1.1"), 4242)
            .unwrap();

        assert!(h.mgr.send_file_init(&[peer.clone()], &file, "pkg.zip", "pkg").is_err());
        assert!(h
            .mgr
            .send_file_init(&[peer.clone()], &h.dir.path().join("missing"), "m", "m")
            .is_err());

        h.mgr.inner.tx.lock().web_port = 18080;
        let init = h
            .mgr
            .send_file_init(&[peer.clone(), ghost.clone()], &file, "pkg.zip", "pkg")
            .unwrap();
        assert_eq!(init.gone, vec![ghost]);
        let tx = h.mgr.inner.tx.lock();
        let xfer = &tx.pending[&init.xfer_id];
        assert_eq!(xfer.local_contacts, vec![peer]);
        assert!(xfer.uploads.is_empty());
        assert_eq!(xfer.file.size, 9);
        assert_eq!(xfer.file.sha256.len(), 64);
        drop(tx);
        assert!(h.mgr.send_file_start(init.xfer_id + 100).is_err());
    }

    #[test]
    fn test_stream_contact_with_server_transfers_disabled_goes_local() {
        let h = Harness::new(ScriptedHttp::new((404, ""), (200, ""), true));
        let file = h.package();
        h.stream_contact("S1");
        h.mgr
            .update_settings(|s| {
                s.set_server_transfer_enabled(false);
                Ok(())
            })
            .unwrap();
        h.mgr.inner.tx.lock().web_port = 18080;
        let init = h
            .mgr
            .send_file_init(&[ContactUid::from("S1")], &file, "pkg.zip", "pkg")
            .unwrap();
        let tx = h.mgr.inner.tx.lock();
        assert_eq!(tx.pending[&init.xfer_id].local_contacts.len(), 1);
    }

    #[test]
    fn test_server_upload_then_ack() {
        let url = "https://srv/Marti/sync/content?hash=x";
        let h = Harness::new(ScriptedHttp::new((404, ""), (200, url), true));
        let file = h.package();
        let stream = h.stream_contact("S1");

        let init = h
            .mgr
            .send_file_init(&[ContactUid::from("S1")], &file, "pkg.zip", "pkg")
            .unwrap();
        assert!(init.gone.is_empty());
        h.mgr.send_file_start(init.xfer_id).unwrap();
        wait_for(|| h.sent_for(Some("S1")).contains(&Status::AttemptInProgress));

        assert_eq!(
            h.sent_for(Some("S1")),
            vec![
                Status::ServerUploadPending,
                Status::ServerUploadInProgress,
                Status::ServerUploadSuccess,
                Status::AttemptInProgress,
            ]
        );
        let calls = h.http.calls.lock().clone();
        assert!(calls[0].starts_with("GET http://127.0.0.1:8080/Marti/sync/missionquery?hash="));
        assert!(calls[1].starts_with("POST assetfile http://127.0.0.1:8080/Marti/sync/missionupload?"));
        assert!(calls[1].contains("creatorUid=ME"));
        assert!(calls[2].ends_with("/tool private"));

        let (sent_on, msg) = h.fake.streams.lock()[0].clone();
        assert_eq!(sent_on, stream);
        let req = msg.file_transfer_request().unwrap().clone();
        assert_eq!(req.sender_url, url);
        assert!(!req.peer_hosted);

        let ack = CoTMessage::new_file_transfer_ack(
            "S1",
            CoTPointData::default(),
            &req,
            &ContactUid::from("S1"),
            false,
            "got it",
        );
        h.mgr.streaming_message_received(&stream, &ack);
        wait_for(|| h.sent_for(Some("S1")).contains(&Status::FinishedSuccess));
        let done = h.io.sent.lock().last().unwrap().clone();
        assert_eq!(done.status, Status::FinishedSuccess);
        assert_eq!(done.detail.as_deref(), Some("got it"));
        assert_eq!(done.total_bytes_transferred, 9);
        wait_for(|| h.mgr.inner.tx.lock().active.is_empty());
        assert!(h.mgr.inner.tx.lock().active.is_empty());
    }

    #[test]
    fn test_upload_only_to_server() {
        let h = Harness::new(ScriptedHttp::new((200, "http://existing\n"), (500, ""), true));
        let file = h.package();
        assert!(matches!(
            h.mgr.upload_file_init("tcp:nowhere:1", &file, "pkg.zip"),
            Err(CommoError::ContactGone(_))
        ));

        let iface = h
            .streams
            .add_streaming_interface("127.0.0.1", 1, &[], None, None)
            .unwrap();
        let id = h
            .mgr
            .upload_file_init(&iface.remote_endpoint_id, &file, "pkg.zip")
            .unwrap();
        h.mgr.send_file_start(id).unwrap();
        wait_for(|| h.sent_for(None).contains(&Status::FinishedSuccess));

        assert_eq!(
            h.sent_for(None),
            vec![Status::ServerUploadPending, Status::ServerUploadSuccess, Status::FinishedSuccess]
        );
        let success = h.io.sent.lock()[1].clone();
        assert_eq!(success.detail.as_deref(), Some("http://existing"));
        let calls = h.http.calls.lock().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].ends_with("/tool public"));
    }

    #[test]
    fn test_receive_success_acks_sender() {
        let h = Harness::new(ScriptedHttp::new((404, ""), (200, ""), true));
        let dest = h.dir.path().join("in.zip");
        *h.io.dest.lock() = Some(dest.clone());
        h.contacts
            .config_known_endpoint_contact(&ContactUid::from("PEER"), Some("PEER-CS"), Some("10.1.1.1"), 4242)
            .unwrap();

        let req = offer("PEER", "http://10.1.1.1:8080/getfile?file=3&sender=PEER-CS");
        let msg = CoTMessage::new_file_transfer_request("e1", CoTPointData::default(), &req);
        h.mgr.tcp_message_received("*:4242:tcp", None, &msg);
        wait_for(|| h.received().contains(&Status::FinishedSuccess));

        assert_eq!(h.received().first(), Some(&Status::AttemptInProgress));
        assert_eq!(h.received().last(), Some(&Status::FinishedSuccess));
        assert_eq!(std::fs::read(&dest).unwrap(), b"pkg");
        assert_eq!(
            h.http.calls.lock()[0],
            "DOWNLOAD http://10.1.1.1:8080/getfile?file=3&sender=PEER-CS&receiver=MYCALL"
        );
        wait_for(|| !h.fake.datagrams.lock().is_empty());
        let ack = h.fake.datagrams.lock()[0].file_transfer_ack().unwrap();
        assert_eq!(ack.uid, "ack-1");
        assert!(ack.success);
        assert_eq!(ack.reason, RX_SUCCESS);
    }

    #[test]
    fn test_receive_tries_alternate_host_then_fails() {
        let h = Harness::new(ScriptedHttp::new((404, ""), (200, ""), false));
        *h.io.dest.lock() = Some(h.dir.path().join("in.zip"));
        h.mgr.update_settings(|s| s.set_num_tries(2)).unwrap();
        h.contacts
            .config_known_endpoint_contact(&ContactUid::from("PEER"), Some("PEER-CS"), Some("10.1.1.1"), 4242)
            .unwrap();

        let req = offer("PEER", "http://10.9.9.9:8080/getfile?file=3");
        let msg = CoTMessage::new_file_transfer_request("e1", CoTPointData::default(), &req);
        h.mgr.tcp_message_received("*:4242:tcp", None, &msg);
        wait_for(|| h.received().contains(&Status::FinishedFailed));

        assert_eq!(
            h.received(),
            vec![Status::AttemptInProgress, Status::AttemptInProgress, Status::FinishedFailed]
        );
        let failed = h.io.received.lock().last().unwrap().clone();
        assert_eq!(failed.error_detail.as_deref(), Some(RX_BAD_STATUS));
        let calls = h.http.calls.lock().clone();
        assert!(calls[0].starts_with("DOWNLOAD http://10.9.9.9:8080/"));
        assert!(calls[1].starts_with("DOWNLOAD http://10.1.1.1:8080/"));

        wait_for(|| !h.fake.datagrams.lock().is_empty());
        let ack = h.fake.datagrams.lock()[0].file_transfer_ack().unwrap();
        assert!(!ack.success);
        assert_eq!(ack.reason, RX_FAILED);
    }

    #[test]
    fn test_existing_file_is_acked_without_download() {
        let h = Harness::new(ScriptedHttp::new((404, ""), (200, ""), true));
        *h.io.refuse.lock() = Some(Status::FinishedFileExists);
        h.contacts
            .config_known_endpoint_contact(&ContactUid::from("PEER"), Some("PEER-CS"), Some("10.1.1.1"), 4242)
            .unwrap();
        let msg = CoTMessage::new_file_transfer_request(
            "e1",
            CoTPointData::default(),
            &offer("PEER", "http://10.1.1.1:8080/getfile?file=3"),
        );
        h.mgr.tcp_message_received("", None, &msg);

        wait_for(|| !h.fake.datagrams.lock().is_empty());
        let ack = h.fake.datagrams.lock()[0].file_transfer_ack().unwrap();
        assert!(ack.success);
        assert_eq!(ack.reason, RX_FILE_EXISTS);
        assert!(h.http.calls.lock().is_empty());
    }

    #[test]
    fn test_local_abort_and_ack_timeout() {
        let h = Harness::new(ScriptedHttp::new((404, ""), (200, ""), true));
        {
            let mut tx = h.mgr.inner.tx.lock();
            let mut acks = BTreeMap::new();
            acks.insert("local".to_string(), OutstandingAck::new(ContactUid::from("L"), true));
            acks.insert("remote".to_string(), OutstandingAck::new(ContactUid::from("R"), false));
            tx.acks_to_ids.insert("local".into(), 9);
            tx.acks_to_ids.insert("remote".into(), 9);
            tx.active.insert(
                9,
                TxTransfer {
                    file: TxFile {
                        path: PathBuf::from("/tmp/x"),
                        filename: "x".into(),
                        transfer_name: "x".into(),
                        sha256: String::new(),
                        size: 1,
                    },
                    settings: MPTransferSettings::default(),
                    local_contacts: Vec::new(),
                    uploads: Vec::new(),
                    pending_uploads: 0,
                    outstanding_acks: acks,
                },
            );
        }

        h.mgr.set_local_https_port(8443);
        wait_for(|| !h.sent_for(Some("L")).is_empty());
        assert_eq!(h.sent_for(Some("L")), vec![Status::FinishedDisabledLocally]);
        assert!(h.sent_for(Some("R")).is_empty());

        h.mgr.inner.expire_acks(Instant::now());
        assert!(h.mgr.inner.tx.lock().active.contains_key(&9));
        h.mgr
            .inner
            .expire_acks(Instant::now() + MP_ACK_TIMEOUT + Duration::from_secs(1));
        wait_for(|| !h.sent_for(Some("R")).is_empty());
        assert_eq!(h.sent_for(Some("R")), vec![Status::FinishedTimedOut]);
        let tx = h.mgr.inner.tx.lock();
        assert!(tx.active.is_empty());
        assert!(tx.acks_to_ids.is_empty());
    }
}

//! Persistent connections to TAK servers.
//!
//! Each configured server gets one connection, plain TCP or TLS. A
//! connection thread brings connections up (name resolution runs on its own
//! resolver thread), an I/O thread moves bytes for every up connection, and
//! a receive thread hands decoded messages to listeners.
//!
//! Connects and TLS handshakes never block: each pass of the connection
//! thread advances every connecting server by as much as its socket allows,
//! so one slow server cannot hold up the others.
//!
//! Streams start in XML. When the server advertises support for protocol
//! version 1 we ask to swap; once accepted, every queued message that has
//! not started transmitting is reserialized as length-framed protobuf.

use std::collections::{BTreeMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use socket2::Socket;
use tracing::{debug, error, info, trace, warn};

use super::scanner::{Frame, StreamScanner};
use super::tls::{TlsCredentials, client_config, handshake_error_code, tls_error_code};
use crate::core::constants::{
    CONN_RETRY, DEFAULT_STREAM_CONN_TIMEOUT, PROTO_TIMEOUT, RESOLVE_RETRY, RX_STALE, RX_STALE_PING,
    RX_TIMEOUT, STREAM_POLL_INTERVAL, STREAMING_THREADS,
};
use crate::core::{
    CoTMessageType, CommoError, ContactUid, EndpointType, InterfaceStatusListener, ListenerSet,
    NetInterfaceErrorCode, Result, StreamSender, StreamingMessageListener,
};
use crate::cot::{CoTMessage, ProtoHeader, TakControlType, TakMessage};
use crate::net::addr::{parse_ip, stream_endpoint_id};
use crate::net::socket::{poll_connect, start_connect};
use crate::net::{
    InterfaceId, NetInterface, ResolverListener, ResolverQueue, ResolverRequestId, StreamingNetInterface,
};
use crate::threading::{Signal, StopFlag, ThreadWorker, ThreadedHandler, WorkQueue};

const CONN_THREAD: usize = 0;
const IO_THREAD: usize = 1;
const RXQ_THREAD: usize = 2;

const READ_CHUNK: usize = 16 * 1024;
const PING_UID_SUFFIX: &str = "-ping";
const STREAM_PROTO_VERSION: u32 = 1;

/// Username and password sent to the server right after connecting.
#[derive(Clone)]
pub struct StreamAuth {
    /// Account name.
    pub username: String,
    /// Account password.
    pub password: String,
}

impl std::fmt::Debug for StreamAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamAuth").field("username", &self.username).finish_non_exhaustive()
    }
}

enum Transport {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectStage {
    /// TCP connect in flight.
    Tcp,
    /// Handshake waiting for the server.
    SslWantRead,
    /// Handshake waiting to write to the server.
    SslWantWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    /// Waiting for the hostname to resolve.
    Resolving(ResolverRequestId),
    /// Not connected; next attempt at `retry_at`.
    Down { retry_at: Instant },
    /// Connect or handshake in progress, abandoned at `deadline`.
    Connecting { stage: ConnectStage, deadline: Instant },
    Up,
}

/// Socket and TLS session of a connection that is not up yet.
struct PendingConnect {
    socket: Socket,
    session: Option<ClientConnection>,
}

impl PendingConnect {
    /// Advance from `stage`. `None` once the transport is ready.
    fn step(&mut self, stage: ConnectStage) -> std::result::Result<Option<ConnectStage>, NetInterfaceErrorCode> {
        if stage == ConnectStage::Tcp {
            match poll_connect(&self.socket) {
                Ok(false) => return Ok(Some(ConnectStage::Tcp)),
                Ok(true) => {
                    if let Err(e) = self.socket.set_nodelay(true) {
                        debug!(error = %e, "unable to disable nagle on stream socket");
                    }
                }
                Err(e) => return Err(connect_error_code(&e)),
            }
        }
        let PendingConnect { socket, session } = self;
        let Some(session) = session.as_mut() else {
            return Ok(None);
        };
        loop {
            if session.wants_write() {
                match session.write_tls(socket) {
                    Ok(_) => continue,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Some(ConnectStage::SslWantWrite)),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!(error = %e, "tls handshake failed");
                        return Err(handshake_error_code(&e));
                    }
                }
            }
            if !session.is_handshaking() {
                return Ok(None);
            }
            if !session.wants_read() {
                return Ok(Some(ConnectStage::SslWantRead));
            }
            match session.read_tls(socket) {
                Ok(0) => {
                    warn!("server closed the connection during the tls handshake");
                    return Err(NetInterfaceErrorCode::ConnSslHandshake);
                }
                Ok(_) => {
                    if let Err(e) = session.process_new_packets() {
                        warn!(error = %e, "tls handshake failed");
                        // flush the alert
                        let _ = session.write_tls(socket);
                        return Err(tls_error_code(&e));
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Some(ConnectStage::SslWantRead)),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "tls handshake failed");
                    return Err(handshake_error_code(&e));
                }
            }
        }
    }

    fn into_transport(self) -> Transport {
        let stream = TcpStream::from(self.socket);
        match self.session {
            None => Transport::Plain(stream),
            Some(session) => Transport::Tls(Box::new(StreamOwned::new(session, stream))),
        }
    }
}

enum ConnectProgress {
    Pending,
    Up,
    Failed(NetInterfaceErrorCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProtoState {
    /// XML, waiting to hear which versions the server supports.
    XmlNegotiate,
    /// Swap request sent; transmission paused until the server answers.
    WaitResponse,
    XmlOnly,
    Proto,
}

struct TxItem {
    msg: Option<CoTMessage>,
    data: Vec<u8>,
    sent: usize,
    proto_swap: bool,
}

impl TxItem {
    fn message(msg: CoTMessage, version: u32) -> Result<Self> {
        let data = serialize_for_stream(&msg, version)?;
        Ok(Self {
            msg: Some(msg),
            data,
            sent: 0,
            proto_swap: false,
        })
    }

    fn raw(data: Vec<u8>) -> Self {
        Self {
            msg: None,
            data,
            sent: 0,
            proto_swap: false,
        }
    }
}

fn serialize_for_stream(msg: &CoTMessage, version: u32) -> Result<Vec<u8>> {
    if version == 0 {
        Ok(msg.serialize())
    } else {
        TakMessage::new(Some(msg.clone()), None).serialize_protobuf(version, ProtoHeader::Stream, true, false)
    }
}

struct Connection {
    iface: StreamingNetInterface,
    host: String,
    port: u16,
    addr: Option<SocketAddr>,
    types: Vec<CoTMessageType>,
    tls: Option<(Arc<ClientConfig>, TlsCredentials)>,
    auth: Option<Vec<u8>>,
    state: LinkState,
    removed: bool,
    pending: Option<PendingConnect>,
    transport: Option<Transport>,
    tx_queue: VecDeque<TxItem>,
    tx_version: u32,
    scanner: StreamScanner,
    proto: ProtoState,
    blocked_for_response: bool,
    last_rx: Instant,
    ping_at: Instant,
    proto_timeout: Instant,
}

impl Connection {
    fn endpoint_id(&self) -> &str {
        &self.iface.remote_endpoint_id
    }

    /// Advance a connect in progress by as much as the socket allows.
    fn advance_connect(&mut self, now: Instant) -> ConnectProgress {
        let LinkState::Connecting { stage, deadline } = self.state else {
            return ConnectProgress::Pending;
        };
        let Some(pending) = self.pending.as_mut() else {
            return ConnectProgress::Failed(NetInterfaceErrorCode::Internal);
        };
        match pending.step(stage) {
            Ok(None) => match self.pending.take() {
                Some(pending) => {
                    self.bring_up(pending.into_transport(), now);
                    ConnectProgress::Up
                }
                None => ConnectProgress::Failed(NetInterfaceErrorCode::Internal),
            },
            Ok(Some(_)) if now > deadline => ConnectProgress::Failed(NetInterfaceErrorCode::ConnTimeout),
            Ok(Some(stage)) => {
                self.state = LinkState::Connecting { stage, deadline };
                ConnectProgress::Pending
            }
            Err(code) => ConnectProgress::Failed(code),
        }
    }

    fn bring_up(&mut self, transport: Transport, now: Instant) {
        self.pending = None;
        self.transport = Some(transport);
        self.state = LinkState::Up;
        self.tx_queue.clear();
        self.tx_version = 0;
        self.scanner.reset();
        self.proto = ProtoState::XmlNegotiate;
        self.blocked_for_response = false;
        self.last_rx = now;
        self.ping_at = now;
        self.proto_timeout = now + PROTO_TIMEOUT;
        if let Some(auth) = &self.auth {
            self.tx_queue.push_back(TxItem::raw(auth.clone()));
        }
    }

    /// Tear down the transport and schedule a reconnect.
    fn reset(&mut self, retry_at: Instant) {
        self.pending = None;
        self.transport = None;
        self.tx_queue.clear();
        self.scanner.reset();
        self.proto = ProtoState::XmlNegotiate;
        self.blocked_for_response = false;
        self.tx_version = 0;
        self.state = LinkState::Down { retry_at };
    }

    /// Give up on a connect attempt and schedule the next one.
    fn connect_failed(&mut self, now: Instant, code: NetInterfaceErrorCode) -> StatusEvent {
        info!(endpoint = %self.endpoint_id(), ?code, "stream connection failed; will retry");
        self.pending = None;
        self.state = LinkState::Down {
            retry_at: now + CONN_RETRY,
        };
        StatusEvent::Error(self.iface.clone(), code)
    }

    fn queue_message(&mut self, msg: CoTMessage) -> Result<()> {
        let item = TxItem::message(msg, self.tx_version)?;
        self.tx_queue.push_back(item);
        Ok(())
    }

    /// Reserialize everything not yet started at `version`.
    fn convert_tx(&mut self, version: u32) {
        self.tx_version = version;
        for item in self.tx_queue.iter_mut().filter(|i| i.sent == 0) {
            let Some(msg) = &item.msg else {
                continue;
            };
            match serialize_for_stream(msg, version) {
                Ok(data) => item.data = data,
                Err(e) => warn!(error = %e, "unable to reserialize queued message; leaving as is"),
            }
        }
    }

    /// Write as much of the queue as the socket takes.
    fn flush_tx(&mut self) -> std::result::Result<bool, NetInterfaceErrorCode> {
        let Connection {
            transport,
            tx_queue,
            blocked_for_response,
            ..
        } = self;
        let Some(transport) = transport.as_mut() else {
            return Err(NetInterfaceErrorCode::Internal);
        };
        let mut progress = false;
        while !*blocked_for_response {
            let Some(item) = tx_queue.front_mut() else {
                break;
            };
            match transport.write(&item.data[item.sent..]) {
                Ok(0) => break,
                Ok(n) => {
                    progress = true;
                    item.sent += n;
                    if item.sent == item.data.len() {
                        if item.proto_swap {
                            *blocked_for_response = true;
                        }
                        tx_queue.pop_front();
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(error = %e, "error sending stream data");
                    return Err(NetInterfaceErrorCode::Io);
                }
            }
        }
        match transport.flush() {
            Ok(()) => Ok(progress),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(progress),
            Err(e) => {
                error!(error = %e, "error sending stream data");
                Err(NetInterfaceErrorCode::Io)
            }
        }
    }
}

struct RxItem {
    endpoint_id: String,
    msg: CoTMessage,
}

enum StatusEvent {
    Up(StreamingNetInterface),
    Down(StreamingNetInterface),
    Error(StreamingNetInterface, NetInterfaceErrorCode),
}

struct Inner {
    our_uid: ContactUid,
    ping_uid: String,
    contexts: RwLock<BTreeMap<String, Arc<Mutex<Connection>>>>,
    resolver: Mutex<Option<ResolverQueue>>,
    rx_queue: WorkQueue<RxItem>,
    conn_signal: Signal,
    io_signal: Signal,
    conn_timeout: Mutex<Duration>,
    monitor: AtomicBool,
    listeners: ListenerSet<dyn StreamingMessageListener>,
    iface_listeners: ListenerSet<dyn InterfaceStatusListener>,
}

/// Manages connections to TAK servers.
pub struct StreamingSocketManagement {
    inner: Arc<Inner>,
    handler: ThreadedHandler,
}

impl StreamingSocketManagement {
    /// Create the manager and start its threads.
    pub fn new(our_uid: ContactUid) -> Result<Self> {
        let inner = Arc::new(Inner {
            ping_uid: format!("{}{PING_UID_SUFFIX}", our_uid.to_string_lossy()),
            our_uid,
            contexts: RwLock::new(BTreeMap::new()),
            resolver: Mutex::new(None),
            rx_queue: WorkQueue::new(),
            conn_signal: Signal::new(),
            io_signal: Signal::new(),
            conn_timeout: Mutex::new(DEFAULT_STREAM_CONN_TIMEOUT),
            monitor: AtomicBool::new(true),
            listeners: ListenerSet::new(),
            iface_listeners: ListenerSet::new(),
        });
        let weak: Weak<dyn ResolverListener> = Arc::downgrade(&inner) as Weak<Inner>;
        let resolver = ResolverQueue::new(weak, RESOLVE_RETRY, None)?;
        *inner.resolver.lock() = Some(resolver);

        let handler = ThreadedHandler::new(STREAMING_THREADS);
        handler.start(Arc::clone(&inner))?;
        Ok(Self { inner, handler })
    }

    /// Configure a connection to the server at `host:port`.
    ///
    /// Broadcasts of the listed message `types` are sent to this server.
    /// With `tls` set the connection is TLS, presenting the client
    /// certificate and trusting only the given CAs. `auth` is sent as the
    /// first message of every TLS session.
    pub fn add_streaming_interface(
        &self,
        host: &str,
        port: u16,
        types: &[CoTMessageType],
        tls: Option<TlsCredentials>,
        auth: Option<StreamAuth>,
    ) -> Result<StreamingNetInterface> {
        if host.is_empty() {
            return Err(CommoError::invalid("empty server host"));
        }
        let endpoint_id = stream_endpoint_id(host, port, tls.is_some());
        let tls = match tls {
            Some(creds) => Some((client_config(&creds)?, creds)),
            None => None,
        };
        let auth = match auth {
            Some(a) if a.username.is_empty() => None,
            Some(_) if tls.is_none() => {
                warn!(endpoint = %endpoint_id, "credentials are only sent over TLS; ignoring them");
                None
            }
            Some(a) => Some(self.inner.auth_document(&a)),
            None => None,
        };

        let mut contexts = self.inner.contexts.write();
        if contexts.contains_key(&endpoint_id) {
            return Err(CommoError::invalid(format!("stream {endpoint_id} already configured")));
        }
        let iface = StreamingNetInterface {
            id: InterfaceId::next(),
            remote_endpoint_id: endpoint_id.clone(),
        };
        let now = Instant::now();
        let (addr, state) = match parse_ip(host) {
            Some(ip) => (Some(SocketAddr::new(ip, port)), LinkState::Down { retry_at: now }),
            None => {
                let resolver = self.inner.resolver.lock();
                let resolver = resolver
                    .as_ref()
                    .ok_or_else(|| CommoError::Transport("streaming manager shutting down".into()))?;
                (None, LinkState::Resolving(resolver.queue_for_resolution(host)))
            }
        };
        let conn = Connection {
            iface: iface.clone(),
            host: host.to_string(),
            port,
            addr,
            types: types.to_vec(),
            tls,
            auth,
            state,
            removed: false,
            pending: None,
            transport: None,
            tx_queue: VecDeque::new(),
            tx_version: 0,
            scanner: StreamScanner::new(),
            proto: ProtoState::XmlNegotiate,
            blocked_for_response: false,
            last_rx: now,
            ping_at: now,
            proto_timeout: now,
        };
        contexts.insert(endpoint_id.clone(), Arc::new(Mutex::new(conn)));
        drop(contexts);
        info!(endpoint = %endpoint_id, "streaming interface added");
        self.inner.conn_signal.raise();
        Ok(iface)
    }

    /// Close and forget a server connection.
    pub fn remove_streaming_interface(&self, iface: &StreamingNetInterface) -> Result<()> {
        let conn = {
            let mut contexts = self.inner.contexts.write();
            let matches = contexts
                .get(&iface.remote_endpoint_id)
                .is_some_and(|c| c.lock().iface.id == iface.id);
            if !matches {
                return Err(CommoError::invalid("unknown streaming interface"));
            }
            contexts.remove(&iface.remote_endpoint_id)
        };
        let mut was_up = false;
        if let Some(conn) = conn {
            let mut c = conn.lock();
            c.removed = true;
            was_up = c.state == LinkState::Up;
            if let LinkState::Resolving(id) = c.state
                && let Some(r) = self.inner.resolver.lock().as_ref()
            {
                r.cancel_resolution(id);
            }
            c.pending = None;
            c.transport = None;
            c.tx_queue.clear();
        }
        let endpoint = iface.remote_endpoint_id.clone();
        self.inner.rx_queue.retain(|item| item.endpoint_id != endpoint);
        info!(endpoint = %iface.remote_endpoint_id, "streaming interface removed");
        if was_up {
            self.inner.fire(vec![StatusEvent::Down(iface.clone())]);
        }
        Ok(())
    }

    /// Queue `msg` for every up server carrying its message type, or every
    /// up server with `ignore_type` set.
    pub fn send_broadcast(&self, msg: &CoTMessage, ignore_type: bool) -> Result<()> {
        let ty = msg.message_type();
        let contexts = self.inner.contexts.read();
        for conn in contexts.values() {
            let mut c = conn.lock();
            if c.state != LinkState::Up || !(ignore_type || c.types.contains(&ty)) {
                continue;
            }
            c.queue_message(msg.clone())?;
        }
        drop(contexts);
        self.inner.io_signal.raise();
        Ok(())
    }

    /// True if the stream uses TLS.
    pub fn is_endpoint_ssl(&self, stream_endpoint: &str) -> Result<bool> {
        self.with_connection(stream_endpoint, |c| Ok(c.tls.is_some()))
    }

    /// TLS material of the stream, if it uses TLS.
    pub fn tls_credentials(&self, stream_endpoint: &str) -> Result<Option<TlsCredentials>> {
        self.with_connection(stream_endpoint, |c| Ok(c.tls.as_ref().map(|(_, creds)| creds.clone())))
    }

    /// Resolved server address of the stream.
    pub fn address_for_endpoint(&self, stream_endpoint: &str) -> Result<IpAddr> {
        self.with_connection(stream_endpoint, |c| {
            c.addr
                .map(|a| a.ip())
                .ok_or_else(|| CommoError::invalid("stream hostname not yet resolved"))
        })
    }

    /// Connect timeout for new connections and TLS handshakes.
    pub fn set_conn_timeout(&self, timeout: Duration) {
        *self.inner.conn_timeout.lock() = timeout;
    }

    /// Enable or disable idle pings and the no-data reconnect.
    pub fn set_monitor(&self, enabled: bool) {
        self.inner.monitor.store(enabled, Ordering::Relaxed);
    }

    /// Register a receiver of server messages.
    pub fn add_streaming_message_listener(&self, listener: Arc<dyn StreamingMessageListener>) -> Result<()> {
        self.inner.listeners.add(listener)
    }

    /// Remove a receiver.
    pub fn remove_streaming_message_listener(
        &self,
        listener: &Arc<dyn StreamingMessageListener>,
    ) -> Result<()> {
        self.inner.listeners.remove(listener)
    }

    /// Register an interface status listener.
    pub fn add_interface_status_listener(&self, listener: Arc<dyn InterfaceStatusListener>) -> Result<()> {
        self.inner.iface_listeners.add(listener)
    }

    /// Remove an interface status listener.
    pub fn remove_interface_status_listener(
        &self,
        listener: &Arc<dyn InterfaceStatusListener>,
    ) -> Result<()> {
        self.inner.iface_listeners.remove(listener)
    }

    fn with_connection<T>(&self, stream_endpoint: &str, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let contexts = self.inner.contexts.read();
        let conn = contexts
            .get(stream_endpoint)
            .ok_or_else(|| CommoError::invalid("invalid stream endpoint - interface has been removed"))?;
        let c = conn.lock();
        f(&c)
    }
}

impl Drop for StreamingSocketManagement {
    fn drop(&mut self) {
        let resolver = self.inner.resolver.lock().take();
        drop(resolver);
        self.handler.stop(&*self.inner);
        self.inner.rx_queue.drain();
        self.inner.contexts.write().clear();
    }
}

impl StreamSender for StreamingSocketManagement {
    fn send_message(&self, stream_endpoint: &str, msg: &CoTMessage) -> Result<()> {
        {
            let contexts = self.inner.contexts.read();
            let conn = contexts
                .get(stream_endpoint)
                .ok_or_else(|| CommoError::invalid("invalid stream endpoint - interface has been removed"))?;
            let mut c = conn.lock();
            if c.state != LinkState::Up {
                return Err(CommoError::invalid("specified streaming interface is down"));
            }
            c.queue_message(msg.clone())?;
        }
        self.inner.io_signal.raise();
        Ok(())
    }
}

impl ResolverListener for Inner {
    fn resolution_complete(&self, id: ResolverRequestId, host: &str, addr: Option<IpAddr>) {
        let Some(conn) = self.find_resolving(id) else {
            return;
        };
        let mut c = conn.lock();
        match addr {
            Some(ip) => {
                debug!(endpoint = %c.endpoint_id(), host, %ip, "stream host resolved");
                c.addr = Some(SocketAddr::new(ip, c.port));
                c.state = LinkState::Down {
                    retry_at: Instant::now(),
                };
                drop(c);
                self.conn_signal.raise();
            }
            None => {
                let iface = c.iface.clone();
                drop(c);
                self.fire(vec![StatusEvent::Error(iface, NetInterfaceErrorCode::ConnNameResFailed)]);
            }
        }
    }

    fn resolution_attempt_failed(&self, id: ResolverRequestId, host: &str) {
        let Some(conn) = self.find_resolving(id) else {
            return;
        };
        let iface = conn.lock().iface.clone();
        debug!(endpoint = %iface.remote_endpoint_id, host, "stream host did not resolve; will retry");
        self.fire(vec![StatusEvent::Error(iface, NetInterfaceErrorCode::ConnNameResFailed)]);
    }
}

impl ThreadWorker for Inner {
    fn thread_entry(&self, index: usize, stop: &StopFlag) {
        match index {
            CONN_THREAD => self.conn_loop(stop),
            IO_THREAD => self.io_loop(stop),
            RXQ_THREAD => self.rx_queue_loop(stop),
            _ => warn!(index, "unexpected streaming thread"),
        }
    }

    fn thread_stop_signal(&self, index: usize) {
        match index {
            CONN_THREAD => self.conn_signal.wake(),
            IO_THREAD => self.io_signal.wake(),
            RXQ_THREAD => self.rx_queue.wake_all(),
            _ => {}
        }
    }
}

impl Inner {
    fn auth_document(&self, auth: &StreamAuth) -> Vec<u8> {
        use quick_xml::escape::escape;
        format!(
            "<?xml version=\"1.0\"?>\n<auth><cot username=\"{}\" password=\"{}\" uid=\"{}\"/></auth>",
            escape(auth.username.as_str()),
            escape(auth.password.as_str()),
            escape(self.our_uid.to_string_lossy().as_str()),
        )
        .into_bytes()
    }

    fn find_resolving(&self, id: ResolverRequestId) -> Option<Arc<Mutex<Connection>>> {
        self.contexts
            .read()
            .values()
            .find(|c| c.lock().state == LinkState::Resolving(id))
            .cloned()
    }

    fn fire(&self, events: Vec<StatusEvent>) {
        for event in events {
            match event {
                StatusEvent::Up(iface) => {
                    let iface = NetInterface::Streaming(iface);
                    self.iface_listeners.for_each(|l| l.interface_up(&iface));
                }
                StatusEvent::Down(iface) => {
                    let iface = NetInterface::Streaming(iface);
                    self.iface_listeners.for_each(|l| l.interface_down(&iface));
                }
                StatusEvent::Error(iface, code) => {
                    let iface = NetInterface::Streaming(iface);
                    self.iface_listeners.for_each(|l| l.interface_error(&iface, code));
                }
            }
        }
    }

    fn conn_loop(&self, stop: &StopFlag) {
        while !stop.should_stop() {
            let conns: Vec<_> = self.contexts.read().values().cloned().collect();
            let mut events = Vec::new();
            for conn in conns {
                if stop.should_stop() {
                    return;
                }
                let mut c = conn.lock();
                if c.removed {
                    continue;
                }
                let now = Instant::now();
                match c.state {
                    LinkState::Down { retry_at } if retry_at <= now => {
                        if let Err(code) = self.begin_connect(&mut c, now) {
                            events.push(c.connect_failed(now, code));
                            continue;
                        }
                    }
                    LinkState::Connecting { .. } => {}
                    _ => continue,
                }
                match c.advance_connect(now) {
                    ConnectProgress::Pending => {}
                    ConnectProgress::Up => {
                        info!(endpoint = %c.endpoint_id(), "stream connection established");
                        events.push(StatusEvent::Up(c.iface.clone()));
                    }
                    ConnectProgress::Failed(code) => events.push(c.connect_failed(now, code)),
                }
            }
            if !events.is_empty() {
                self.fire(events);
                self.io_signal.raise();
            }
            self.conn_signal.wait(stop, STREAM_POLL_INTERVAL);
        }
    }

    /// Open the socket and TLS session for a down connection.
    fn begin_connect(&self, c: &mut Connection, now: Instant) -> std::result::Result<(), NetInterfaceErrorCode> {
        let Some(addr) = c.addr else {
            return Err(NetInterfaceErrorCode::Internal);
        };
        debug!(endpoint = %c.endpoint_id(), %addr, "connecting to server");
        let session = match &c.tls {
            Some((config, _)) => {
                let name = ServerName::try_from(c.host.clone())
                    .unwrap_or_else(|_| ServerName::IpAddress(addr.ip().into()));
                let session = ClientConnection::new(Arc::clone(config), name).map_err(|e| {
                    error!(error = %e, "unable to create tls session");
                    NetInterfaceErrorCode::ConnSslHandshake
                })?;
                Some(session)
            }
            None => None,
        };
        let socket = start_connect(addr).map_err(|e| connect_error_code(&e))?;
        c.pending = Some(PendingConnect { socket, session });
        c.state = LinkState::Connecting {
            stage: ConnectStage::Tcp,
            deadline: now + *self.conn_timeout.lock(),
        };
        Ok(())
    }

    fn io_loop(&self, stop: &StopFlag) {
        let mut buf = vec![0u8; READ_CHUNK];
        while !stop.should_stop() {
            let conns: Vec<_> = self.contexts.read().values().cloned().collect();
            let monitor = self.monitor.load(Ordering::Relaxed);
            let mut busy = false;
            let mut events = Vec::new();
            for conn in conns {
                let mut c = conn.lock();
                if c.removed || c.state != LinkState::Up {
                    continue;
                }
                let now = Instant::now();
                match self.service(&mut c, &mut buf, now, monitor) {
                    Ok(progress) => busy |= progress,
                    Err(code) => {
                        c.reset(now + CONN_RETRY);
                        events.push(StatusEvent::Error(c.iface.clone(), code));
                        events.push(StatusEvent::Down(c.iface.clone()));
                    }
                }
            }
            if !events.is_empty() {
                self.fire(events);
                self.conn_signal.raise();
            }
            if !busy {
                self.io_signal.wait(stop, STREAM_POLL_INTERVAL);
            }
        }
    }

    /// One pass over an up connection: write, read, check liveness.
    fn service(
        &self,
        c: &mut Connection,
        buf: &mut [u8],
        now: Instant,
        monitor: bool,
    ) -> std::result::Result<bool, NetInterfaceErrorCode> {
        let mut progress = c.flush_tx()?;

        let mut found = false;
        loop {
            let Some(transport) = c.transport.as_mut() else {
                return Err(NetInterfaceErrorCode::Internal);
            };
            match transport.read(buf) {
                Ok(0) => {
                    error!(endpoint = %c.endpoint_id(), "server closed the stream");
                    return Err(NetInterfaceErrorCode::Io);
                }
                Ok(n) => {
                    progress = true;
                    c.scanner.feed(&buf[..n]);
                    found |= self.scan(c);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(endpoint = %c.endpoint_id(), error = %e, "error receiving stream data");
                    return Err(NetInterfaceErrorCode::Io);
                }
            }
        }

        if found {
            c.last_rx = now;
        } else if monitor {
            let quiet = now.saturating_duration_since(c.last_rx);
            if quiet > RX_TIMEOUT {
                error!(endpoint = %c.endpoint_id(), secs = quiet.as_secs(), "no data received from server; reconnecting");
                return Err(NetInterfaceErrorCode::IoRxDataTimeout);
            }
            if quiet > RX_STALE && now > c.ping_at {
                debug!(endpoint = %c.endpoint_id(), secs = quiet.as_secs(), "no data received from server; sending ping");
                if let Err(e) = c.queue_message(CoTMessage::ping(&self.ping_uid)) {
                    warn!(error = %e, "unable to queue ping");
                }
                c.ping_at = now + RX_STALE_PING;
            }
        }

        if now > c.proto_timeout {
            match c.proto {
                ProtoState::XmlNegotiate => {
                    info!(endpoint = %c.endpoint_id(), "server did not advertise protocol support; using xml only");
                    c.proto = ProtoState::XmlOnly;
                }
                ProtoState::WaitResponse => {
                    error!(endpoint = %c.endpoint_id(), "timed out waiting for protocol negotiation response");
                    return Err(NetInterfaceErrorCode::Other);
                }
                ProtoState::XmlOnly | ProtoState::Proto => {}
            }
        }

        if !c.tx_queue.is_empty() {
            progress |= c.flush_tx()?;
        }
        Ok(progress)
    }

    /// Dispatch every complete frame. Returns true if any was found.
    fn scan(&self, c: &mut Connection) -> bool {
        let mut found = false;
        while let Some(frame) = c.scanner.next_frame() {
            found = true;
            let (parsed, data, xml) = match frame {
                Frame::Xml(data) => (TakMessage::parse_xml(&data), data, true),
                Frame::Proto(data) => (TakMessage::parse_protobuf(&data, STREAM_PROTO_VERSION), data, false),
            };
            match parsed {
                Ok(tak) => {
                    if let Some(msg) = tak.into_cot_message() {
                        self.dispatch(c, msg, xml);
                    }
                }
                Err(e) => {
                    error!(
                        endpoint = %c.endpoint_id(),
                        data = %String::from_utf8_lossy(&data[..data.len().min(256)]),
                        error = %e,
                        "invalid CoT message received from stream"
                    );
                }
            }
        }
        found
    }

    fn dispatch(&self, c: &mut Connection, msg: CoTMessage, xml: bool) {
        let control = msg.tak_control_type();
        if xml && c.proto != ProtoState::XmlOnly && control.is_some() && self.negotiate(c, &msg) {
            c.scanner.switch_to_proto();
        }
        if msg.is_pong() || control.is_some() {
            trace!(endpoint = %c.endpoint_id(), "control message consumed");
            return;
        }
        self.rx_queue.push(RxItem {
            endpoint_id: c.endpoint_id().to_string(),
            msg,
        });
    }

    /// Advance protocol negotiation. Returns true when the inbound stream
    /// switches to protobuf.
    fn negotiate(&self, c: &mut Connection, msg: &CoTMessage) -> bool {
        match msg.tak_control_type() {
            Some(TakControlType::Support) => {
                if c.proto != ProtoState::XmlNegotiate {
                    warn!(endpoint = %c.endpoint_id(), "protocol support advertised again; ignoring");
                    return false;
                }
                let versions = msg.tak_control_supported_versions();
                info!(endpoint = %c.endpoint_id(), ?versions, "server supports protocol versions");
                if !versions.contains(&STREAM_PROTO_VERSION) {
                    return false;
                }
                let request = CoTMessage::tak_control_request(msg.event_uid(), STREAM_PROTO_VERSION);
                match TxItem::message(request, 0) {
                    Ok(mut item) => {
                        item.proto_swap = true;
                        c.tx_queue.push_back(item);
                    }
                    Err(e) => {
                        error!(endpoint = %c.endpoint_id(), error = %e, "unable to serialize protocol swap request");
                        return false;
                    }
                }
                c.proto = ProtoState::WaitResponse;
                c.proto_timeout = Instant::now() + PROTO_TIMEOUT;
                info!(endpoint = %c.endpoint_id(), "requesting transition to protocol version 1");
                false
            }
            Some(TakControlType::Response) => {
                if c.proto != ProtoState::WaitResponse {
                    warn!(endpoint = %c.endpoint_id(), "protocol response without a request; ignoring");
                    return false;
                }
                c.blocked_for_response = false;
                if msg.tak_control_response_status() {
                    info!(endpoint = %c.endpoint_id(), "protocol negotiation accepted; swapping to protobuf");
                    c.proto = ProtoState::Proto;
                    c.convert_tx(STREAM_PROTO_VERSION);
                    true
                } else {
                    info!(endpoint = %c.endpoint_id(), "protocol negotiation denied; using xml only");
                    c.proto = ProtoState::XmlOnly;
                    false
                }
            }
            _ => false,
        }
    }

    fn rx_queue_loop(&self, stop: &StopFlag) {
        while let Some(mut item) = self.rx_queue.wait_pop(stop) {
            item.msg.set_endpoint(EndpointType::Streaming, "");
            self.listeners
                .for_each(|l| l.streaming_message_received(&item.endpoint_id, &item.msg));
        }
    }
}

fn connect_error_code(e: &std::io::Error) -> NetInterfaceErrorCode {
    match e.kind() {
        ErrorKind::ConnectionRefused => NetInterfaceErrorCode::ConnRefused,
        ErrorKind::TimedOut | ErrorKind::WouldBlock => NetInterfaceErrorCode::ConnTimeout,
        ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => NetInterfaceErrorCode::ConnHostUnreachable,
        _ => NetInterfaceErrorCode::ConnOther,
    }
}

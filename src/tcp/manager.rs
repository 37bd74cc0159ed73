//! Direct TCP transport.
//!
//! Every outbound message gets its own connection: connect, write the whole
//! payload, close. Inbound listeners accept one message per connection, read
//! until the peer closes.

use std::io::{ErrorKind, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, trace, warn};

use crate::core::constants::{
    DEFAULT_TCP_CONN_TIMEOUT, INBOUND_RETRY, MIN_TCP_CONN_TIMEOUT, RX_CLIENT_MAX_DATA_LEN,
    TCP_POLL_INTERVAL, TCP_RESOLVE_RETRY, TCP_RESOLVE_TRIES, TCP_THREADS,
};
use crate::core::{
    CoTSendFailureListener, CommoError, ContactUid, EndpointType, InterfaceStatusListener,
    ListenerSet, NetInterfaceErrorCode, Result, TcpMessageListener, TcpSender,
};
use crate::cot::framing::check_proto_version;
use crate::cot::{CoTMessage, TakMessage};
use crate::crypto::MeshCrypto;
use crate::net::addr::{parse_ip, tcp_endpoint_id};
use crate::net::socket::{poll_connect, start_connect};
use crate::net::{
    InterfaceId, NetInterface, ResolverListener, ResolverQueue, ResolverRequestId,
    TcpInboundNetInterface,
};
use crate::threading::{Signal, StopFlag, ThreadWorker, ThreadedHandler, WorkQueue};

const IO_THREAD: usize = 0;
const RXQ_THREAD: usize = 1;
const TXERR_THREAD: usize = 2;

const READ_CHUNK: usize = 5 * 1024;

struct InboundContext {
    iface: TcpInboundNetInterface,
    endpoint_id: String,
    listener: Option<TcpListener>,
    retry_at: Instant,
    up_fired: bool,
}

struct ClientContext {
    stream: TcpStream,
    sender: SocketAddr,
    endpoint_id: String,
    data: Vec<u8>,
}

/// One outbound message on its own connection.
struct TxContext {
    host: String,
    port: u16,
    dest: Option<SocketAddr>,
    data: Vec<u8>,
    written: usize,
    socket: Option<Socket>,
    deadline: Option<Instant>,
}

enum TxProgress {
    Pending,
    Done,
    Failed(&'static str),
}

impl TxContext {
    fn new(host: &str, port: u16, msg: &CoTMessage, our_uid: &ContactUid, version: u32) -> Result<Self> {
        let mut copy = msg.clone();
        copy.set_endpoint(EndpointType::None, "");
        let data = TakMessage::new(Some(copy), Some(our_uid)).serialize_mesh(check_proto_version(version), true)?;
        Ok(Self {
            host: host.to_string(),
            port,
            dest: None,
            data,
            written: 0,
            socket: None,
            deadline: None,
        })
    }

    /// Drive the connection as far as it will go without blocking.
    fn advance(&mut self, conn_timeout: Duration, now: Instant) -> TxProgress {
        let Some(dest) = self.dest else {
            return TxProgress::Failed("No destination address");
        };
        if self.socket.is_none() {
            match start_connect(dest) {
                Ok(sock) => {
                    self.socket = Some(sock);
                    self.deadline = Some(now + conn_timeout);
                }
                Err(_) => return TxProgress::Failed("Failed to create transmission socket"),
            }
        }
        let Some(sock) = self.socket.as_ref() else {
            return TxProgress::Pending;
        };

        if let Some(deadline) = self.deadline {
            match poll_connect(sock) {
                Ok(true) => {}
                Ok(false) if now > deadline => return TxProgress::Failed("Connection timed out"),
                Ok(false) => return TxProgress::Pending,
                Err(_) => return TxProgress::Failed("Connection to remote host failed"),
            }
            self.deadline = None;
        }

        while self.written < self.data.len() {
            match sock.send(&self.data[self.written..]) {
                Ok(0) => break,
                Ok(n) => self.written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => return TxProgress::Failed("I/O error transmitting data"),
            }
        }
        if self.written == self.data.len() {
            TxProgress::Done
        } else {
            TxProgress::Pending
        }
    }
}

struct TxFailure {
    host: String,
    port: u16,
    reason: String,
}

struct RxItem {
    sender: SocketAddr,
    endpoint_id: String,
    data: Vec<u8>,
}

struct Inner {
    our_uid: ContactUid,
    inbound: Mutex<Vec<InboundContext>>,
    tx_new: WorkQueue<TxContext>,
    resolving: Mutex<Vec<(ResolverRequestId, TxContext)>>,
    resolver: Mutex<Option<ResolverQueue>>,
    rx_queue: WorkQueue<RxItem>,
    err_queue: WorkQueue<TxFailure>,
    activity: Signal,
    conn_timeout: Mutex<Duration>,
    crypto: RwLock<Option<MeshCrypto>>,
    listeners: ListenerSet<dyn TcpMessageListener>,
    failure_listeners: ListenerSet<dyn CoTSendFailureListener>,
    iface_listeners: ListenerSet<dyn InterfaceStatusListener>,
}

/// Manages direct TCP sends and inbound TCP listeners.
pub struct TcpSocketManagement {
    inner: Arc<Inner>,
    handler: ThreadedHandler,
}

impl TcpSocketManagement {
    /// Create the manager and start its threads.
    pub fn new(our_uid: ContactUid) -> Result<Self> {
        let inner = Arc::new(Inner {
            our_uid,
            inbound: Mutex::new(Vec::new()),
            tx_new: WorkQueue::new(),
            resolving: Mutex::new(Vec::new()),
            resolver: Mutex::new(None),
            rx_queue: WorkQueue::new(),
            err_queue: WorkQueue::new(),
            activity: Signal::new(),
            conn_timeout: Mutex::new(DEFAULT_TCP_CONN_TIMEOUT),
            crypto: RwLock::new(None),
            listeners: ListenerSet::new(),
            failure_listeners: ListenerSet::new(),
            iface_listeners: ListenerSet::new(),
        });
        let weak: Weak<dyn ResolverListener> = Arc::downgrade(&inner) as Weak<Inner>;
        let resolver = ResolverQueue::new(weak, TCP_RESOLVE_RETRY, Some(TCP_RESOLVE_TRIES))?;
        *inner.resolver.lock() = Some(resolver);

        let handler = ThreadedHandler::new(TCP_THREADS);
        handler.start(Arc::clone(&inner))?;
        Ok(Self { inner, handler })
    }

    /// Listen for CoT on `port`. A listener that cannot be created is
    /// retried periodically.
    pub fn add_inbound_interface(&self, port: u16) -> Result<TcpInboundNetInterface> {
        let mut inbound = self.inner.inbound.lock();
        if inbound.iter().any(|c| c.iface.port == port) {
            return Err(CommoError::invalid(format!("tcp port {port} already has an inbound interface")));
        }
        let iface = TcpInboundNetInterface {
            id: InterfaceId::next(),
            port,
        };
        let mut ctx = InboundContext {
            iface: iface.clone(),
            endpoint_id: tcp_endpoint_id(port),
            listener: None,
            retry_at: Instant::now(),
            up_fired: false,
        };
        match build_listener(port) {
            Ok(l) => {
                info!(port, "successfully created socket to listen on TCP port at initial addition");
                ctx.listener = Some(l);
            }
            Err(e) => {
                error!(port, error = %e, "failed to create socket to listen on TCP port during initial addition; will retry");
                ctx.retry_at = Instant::now() + INBOUND_RETRY;
            }
        }
        inbound.push(ctx);
        drop(inbound);
        self.inner.activity.raise();
        Ok(iface)
    }

    /// Stop listening on an inbound interface. Listeners hear it go down
    /// if it was up.
    pub fn remove_inbound_interface(&self, iface: &TcpInboundNetInterface) -> Result<()> {
        let removed = {
            let mut inbound = self.inner.inbound.lock();
            let idx = inbound
                .iter()
                .position(|c| c.iface.id == iface.id)
                .ok_or_else(|| CommoError::invalid("unknown tcp inbound interface"))?;
            inbound.remove(idx)
        };
        info!(port = removed.iface.port, "tcp inbound interface removed");
        if removed.up_fired {
            self.inner.fire_status(&removed.iface, false);
        }
        Ok(())
    }

    /// Connect timeout for outbound sends, at least two seconds.
    pub fn set_conn_timeout(&self, timeout: Duration) -> Result<()> {
        if timeout < MIN_TCP_CONN_TIMEOUT {
            return Err(CommoError::invalid("tcp connect timeout too small"));
        }
        *self.inner.conn_timeout.lock() = timeout;
        Ok(())
    }

    /// Encrypt and decrypt all CoT with `crypto`, or stop doing so.
    pub fn set_crypto(&self, crypto: Option<MeshCrypto>) {
        *self.inner.crypto.write() = crypto;
    }

    /// Register a receiver of inbound CoT.
    pub fn add_message_receiver(&self, listener: Arc<dyn TcpMessageListener>) -> Result<()> {
        self.inner.listeners.add(listener)
    }

    /// Remove a receiver.
    pub fn remove_message_receiver(&self, listener: &Arc<dyn TcpMessageListener>) -> Result<()> {
        self.inner.listeners.remove(listener)
    }

    /// Register a listener for failed sends.
    pub fn add_send_failure_listener(&self, listener: Arc<dyn CoTSendFailureListener>) -> Result<()> {
        self.inner.failure_listeners.add(listener)
    }

    /// Remove a send failure listener.
    pub fn remove_send_failure_listener(&self, listener: &Arc<dyn CoTSendFailureListener>) -> Result<()> {
        self.inner.failure_listeners.remove(listener)
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
}

impl Drop for TcpSocketManagement {
    fn drop(&mut self) {
        // resolver first so no callback lands mid-teardown
        let resolver = self.inner.resolver.lock().take();
        drop(resolver);
        self.handler.stop(&*self.inner);
        self.inner.tx_new.drain();
        self.inner.rx_queue.drain();
        self.inner.err_queue.drain();
    }
}

impl TcpSender for TcpSocketManagement {
    fn send_message(&self, host: &str, port: u16, msg: &CoTMessage, proto_version: u32) -> Result<()> {
        let crypto = self.inner.crypto.read().clone();
        let mut ctx = TxContext::new(host, port, msg, &self.inner.our_uid, proto_version)?;
        if let Some(c) = crypto {
            ctx.data = c.encrypt(&ctx.data)?;
        }

        match parse_ip(host) {
            Some(ip) => {
                ctx.dest = Some(SocketAddr::new(ip, port));
                self.inner.tx_new.push(ctx);
                self.inner.activity.raise();
            }
            None => {
                // hold the lock across queueing so a fast resolution finds its context
                let mut resolving = self.inner.resolving.lock();
                let resolver = self.inner.resolver.lock();
                match resolver.as_ref() {
                    Some(r) => {
                        let id = r.queue_for_resolution(host);
                        resolving.push((id, ctx));
                    }
                    None => return Err(CommoError::Transport("tcp manager shutting down".into())),
                }
            }
        }
        Ok(())
    }
}

impl ResolverListener for Inner {
    fn resolution_complete(&self, id: ResolverRequestId, host: &str, addr: Option<IpAddr>) {
        let ctx = {
            let mut resolving = self.resolving.lock();
            let Some(idx) = resolving.iter().position(|(rid, _)| *rid == id) else {
                return;
            };
            resolving.remove(idx).1
        };
        match addr {
            Some(ip) => {
                let mut ctx = ctx;
                ctx.dest = Some(SocketAddr::new(ip, ctx.port));
                self.tx_new.push(ctx);
                self.activity.raise();
            }
            None => {
                debug!(host, "tcp destination did not resolve");
                self.queue_failure(&ctx, "Failed to resolve host");
            }
        }
    }
}

impl ThreadWorker for Inner {
    fn thread_entry(&self, index: usize, stop: &StopFlag) {
        match index {
            IO_THREAD => self.io_loop(stop),
            RXQ_THREAD => self.rx_queue_loop(stop),
            TXERR_THREAD => self.tx_err_loop(stop),
            _ => warn!(index, "unexpected tcp thread"),
        }
    }

    fn thread_stop_signal(&self, index: usize) {
        match index {
            IO_THREAD => self.activity.wake(),
            RXQ_THREAD => self.rx_queue.wake_all(),
            TXERR_THREAD => self.err_queue.wake_all(),
            _ => {}
        }
    }
}

impl Inner {
    fn queue_failure(&self, ctx: &TxContext, reason: &str) {
        debug!(host = %ctx.host, port = ctx.port, reason, "tcp send failed");
        self.err_queue.push(TxFailure {
            host: ctx.host.clone(),
            port: ctx.port,
            reason: reason.to_string(),
        });
    }

    fn fire_status(&self, iface: &TcpInboundNetInterface, up: bool) {
        let iface = NetInterface::TcpInbound(iface.clone());
        self.iface_listeners.for_each(|l| {
            if up {
                l.interface_up(&iface);
            } else {
                l.interface_down(&iface);
            }
        });
    }

    fn io_loop(&self, stop: &StopFlag) {
        let mut clients: Vec<ClientContext> = Vec::new();
        let mut tx: Vec<TxContext> = Vec::new();
        let mut buf = vec![0u8; READ_CHUNK];

        while !stop.should_stop() {
            let now = Instant::now();
            let mut busy = self.service_inbound(&mut clients, now);

            clients.retain_mut(|client| match read_client(client, &mut buf) {
                ClientRead::Open(progress) => {
                    busy |= progress;
                    true
                }
                ClientRead::Closed => {
                    busy = true;
                    if !client.data.is_empty() {
                        self.rx_queue.push(RxItem {
                            sender: client.sender,
                            endpoint_id: client.endpoint_id.clone(),
                            data: std::mem::take(&mut client.data),
                        });
                    }
                    false
                }
                ClientRead::Overflow => {
                    warn!(sender = %client.sender, "client sent excessive amount of data; dropping");
                    false
                }
            });

            tx.extend(self.tx_new.drain());
            let conn_timeout = *self.conn_timeout.lock();
            tx.retain_mut(|ctx| match ctx.advance(conn_timeout, now) {
                TxProgress::Pending => true,
                TxProgress::Done => {
                    trace!(host = %ctx.host, port = ctx.port, len = ctx.data.len(), "tcp message sent");
                    busy = true;
                    false
                }
                TxProgress::Failed(reason) => {
                    self.queue_failure(ctx, reason);
                    busy = true;
                    false
                }
            });

            if !busy {
                self.activity.wait(stop, TCP_POLL_INTERVAL);
            }
        }
    }

    /// Retry dead listeners and accept new clients. Returns true if anything
    /// happened.
    fn service_inbound(&self, clients: &mut Vec<ClientContext>, now: Instant) -> bool {
        let mut busy = false;
        let mut events = Vec::new();
        {
            let mut inbound = self.inbound.lock();
            for ctx in inbound.iter_mut() {
                if ctx.listener.is_none() && now >= ctx.retry_at {
                    match build_listener(ctx.iface.port) {
                        Ok(l) => {
                            info!(port = ctx.iface.port, "successfully created socket to listen on TCP port");
                            ctx.listener = Some(l);
                        }
                        Err(e) => {
                            error!(port = ctx.iface.port, error = %e, "failed to create socket to listen on TCP port; will retry");
                            ctx.retry_at = now + INBOUND_RETRY;
                            events.push((ctx.iface.clone(), None));
                        }
                    }
                }
                let Some(listener) = ctx.listener.as_ref() else {
                    continue;
                };
                if !ctx.up_fired {
                    ctx.up_fired = true;
                    events.push((ctx.iface.clone(), Some(true)));
                }
                let mut failed = false;
                loop {
                    match listener.accept() {
                        Ok((stream, sender)) => {
                            busy = true;
                            if let Err(e) = stream.set_nonblocking(true) {
                                warn!(%sender, error = %e, "unable to configure accepted tcp client");
                                continue;
                            }
                            trace!(%sender, port = ctx.iface.port, "tcp client accepted");
                            clients.push(ClientContext {
                                stream,
                                sender,
                                endpoint_id: ctx.endpoint_id.clone(),
                                data: Vec::new(),
                            });
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => {
                            error!(port = ctx.iface.port, error = %e, "tcp listener failed; will retry");
                            failed = true;
                            break;
                        }
                    }
                }
                if failed {
                    ctx.listener = None;
                    ctx.retry_at = now + INBOUND_RETRY;
                    if ctx.up_fired {
                        ctx.up_fired = false;
                        events.push((ctx.iface.clone(), Some(false)));
                    }
                }
            }
        }

        for (iface, up) in events {
            match up {
                Some(up) => self.fire_status(&iface, up),
                None => {
                    let iface = NetInterface::TcpInbound(iface);
                    self.iface_listeners
                        .for_each(|l| l.interface_error(&iface, NetInterfaceErrorCode::Other));
                }
            }
        }
        busy
    }

    fn rx_queue_loop(&self, stop: &StopFlag) {
        while let Some(item) = self.rx_queue.wait_pop(stop) {
            let data = match &*self.crypto.read() {
                Some(c) => match c.decrypt(&item.data) {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(endpoint = %item.endpoint_id, sender = %item.sender, error = %e, "unable to decrypt tcp message; dropping");
                        continue;
                    }
                },
                None => item.data,
            };
            match TakMessage::parse_mesh(&data) {
                Ok(msg) => {
                    if let Some(cot) = msg.cot_message() {
                        self.listeners
                            .for_each(|l| l.tcp_message_received(&item.endpoint_id, Some(item.sender), cot));
                    }
                }
                Err(e) => {
                    warn!(endpoint = %item.endpoint_id, sender = %item.sender, error = %e, "invalid CoT message received; dropping");
                }
            }
        }
    }

    fn tx_err_loop(&self, stop: &StopFlag) {
        while let Some(failure) = self.err_queue.wait_pop(stop) {
            self.failure_listeners
                .for_each(|l| l.send_cot_failure(&failure.host, failure.port, &failure.reason));
        }
    }
}

enum ClientRead {
    /// Still connected; true if data arrived.
    Open(bool),
    Closed,
    Overflow,
}

fn read_client(client: &mut ClientContext, buf: &mut [u8]) -> ClientRead {
    let mut progress = false;
    loop {
        match client.stream.read(buf) {
            Ok(0) => return ClientRead::Closed,
            Ok(n) => {
                progress = true;
                client.data.extend_from_slice(&buf[..n]);
                if client.data.len() > RX_CLIENT_MAX_DATA_LEN {
                    return ClientRead::Overflow;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return ClientRead::Open(progress),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(_) => return ClientRead::Closed,
        }
    }
}

fn build_listener(port: u16) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port).into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::mpsc;

    fn sa(uid: &str) -> CoTMessage {
        let xml = format!(
            r#"<event version="2.0" uid="{uid}" type="a-f-G" how="m-g" time="2024-01-01T00:00:00Z" start="2024-01-01T00:00:00Z" stale="2024-01-01T00:01:00Z"><point lat="1" lon="2" hae="3" ce="4" le="5"/><detail><contact callsign="ME" endpoint="1.2.3.4:4242:tcp"/></detail></event>"#
        );
        CoTMessage::parse(xml.as_bytes()).unwrap()
    }

    struct Failures(Mutex<mpsc::Sender<(String, u16, String)>>);

    impl CoTSendFailureListener for Failures {
        fn send_cot_failure(&self, host: &str, port: u16, reason: &str) {
            let _ = self.0.lock().send((host.to_string(), port, reason.to_string()));
        }
    }

    struct Received(Mutex<mpsc::Sender<(String, String)>>);

    impl TcpMessageListener for Received {
        fn tcp_message_received(&self, endpoint_id: &str, _sender: Option<SocketAddr>, msg: &CoTMessage) {
            let _ = self.0.lock().send((endpoint_id.to_string(), msg.event_uid().to_string()));
        }
    }

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    #[test]
    fn test_send_xml_to_listener() {
        let tcp = TcpSocketManagement::new(ContactUid::from("SELF")).unwrap();
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();

        tcp.send_message("127.0.0.1", port, &sa("T1"), 0).unwrap();
        let (mut conn, _) = server.accept().unwrap();
        conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut data = Vec::new();
        conn.read_to_end(&mut data).unwrap();

        let got = CoTMessage::parse(&data).unwrap();
        assert_eq!(got.event_uid(), "T1");
        // endpoint is stripped on direct sends
        assert_eq!(got.endpoint_type(), EndpointType::None);
    }

    #[test]
    fn test_refused_connection_fails_once() {
        let tcp = TcpSocketManagement::new(ContactUid::from("SELF")).unwrap();
        let (tx, rx) = mpsc::channel();
        tcp.add_send_failure_listener(Arc::new(Failures(Mutex::new(tx)))).unwrap();
        let port = free_port();

        tcp.send_message("127.0.0.1", port, &sa("T2"), 1).unwrap();
        let (host, got_port, _reason) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(host, "127.0.0.1");
        assert_eq!(got_port, port);
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    }

    #[test]
    fn test_connect_timeout_reports_failure() {
        let tcp = TcpSocketManagement::new(ContactUid::from("SELF")).unwrap();
        tcp.set_conn_timeout(MIN_TCP_CONN_TIMEOUT).unwrap();
        let (tx, rx) = mpsc::channel();
        tcp.add_send_failure_listener(Arc::new(Failures(Mutex::new(tx)))).unwrap();

        // TEST-NET-1 is not routed; the connect either hangs or fails outright
        tcp.send_message("192.0.2.1", 4242, &sa("T3"), 0).unwrap();
        let (host, port, _) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!((host.as_str(), port), ("192.0.2.1", 4242));
        assert!(rx.recv_timeout(Duration::from_secs(3)).is_err());
    }

    #[test]
    fn test_inbound_delivers_message() {
        let tcp = TcpSocketManagement::new(ContactUid::from("SELF")).unwrap();
        let port = free_port();
        tcp.add_inbound_interface(port).unwrap();
        assert!(tcp.add_inbound_interface(port).is_err());
        let (tx, rx) = mpsc::channel();
        tcp.add_message_receiver(Arc::new(Received(Mutex::new(tx)))).unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(&sa("IN1").serialize()).unwrap();
        drop(client);

        let (endpoint, uid) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(endpoint, format!("*:{port}:tcp"));
        assert_eq!(uid, "IN1");
    }

    struct Status(Mutex<mpsc::Sender<&'static str>>);

    impl InterfaceStatusListener for Status {
        fn interface_up(&self, _iface: &NetInterface) {
            let _ = self.0.lock().send("up");
        }

        fn interface_down(&self, _iface: &NetInterface) {
            let _ = self.0.lock().send("down");
        }
    }

    #[test]
    fn test_remove_inbound_fires_down() {
        let tcp = TcpSocketManagement::new(ContactUid::from("SELF")).unwrap();
        let (tx, rx) = mpsc::channel();
        tcp.add_interface_status_listener(Arc::new(Status(Mutex::new(tx)))).unwrap();

        let iface = tcp.add_inbound_interface(free_port()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "up");
        tcp.remove_inbound_interface(&iface).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "down");
        assert!(tcp.remove_inbound_interface(&iface).is_err());
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn test_rejects_short_timeout() {
        let tcp = TcpSocketManagement::new(ContactUid::from("SELF")).unwrap();
        assert!(tcp.set_conn_timeout(Duration::from_secs(1)).is_err());
        let bogus = TcpInboundNetInterface {
            id: InterfaceId::next(),
            port: 1,
        };
        assert!(tcp.remove_inbound_interface(&bogus).is_err());
    }
}

//! UDP transport: broadcast, multicast and unicast CoT.
//!
//! Three threads:
//! - `cmodg.tx` drains the send queue, fans each item out over the
//!   configured broadcast contexts and re-announces our protocol support
//!   every [`PROTOINF_BCAST`]
//! - `cmodg.rx` polls every shared receive socket, rebuilding and rejoining
//!   sockets when flagged or when one goes quiet for too long
//! - `cmodg.rxq` decrypts and parses received datagrams and hands them to
//!   listeners

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, trace, warn};

use super::context::{BroadcastContext, Interfaces, RecvContext, SendPlan, plan_sends};
use crate::core::constants::{
    DATAGRAM_IDLE_SLEEP, DATAGRAM_THREADS, DEFAULT_MCAST_TTL, DEFAULT_RX_NO_DATA_REBUILD_SECS,
    MAX_DATAGRAM_SIZE, PROTOINF_BCAST, SELF_MAX_PROTO,
};
use crate::core::{
    CoTMessageType, ContactUid, DatagramListener, DatagramSender,
    InterfaceStatusListener, ListenerSet, Result,
};
use crate::cot::framing::check_proto_version;
use crate::cot::{CoTMessage, TakMessage};
use crate::crypto::MeshCrypto;
use crate::net::{HwIfListener, HwIfScanner, InterfaceId, NetInterface, PhysicalNetInterface};
use crate::threading::{StopFlag, ThreadWorker, ThreadedHandler, WorkQueue};

const TX_THREAD: usize = 0;
const RX_THREAD: usize = 1;
const RXQ_THREAD: usize = 2;

/// An outbound item. No message means a protocol announce.
struct TxItem {
    dest: Option<SocketAddr>,
    msg: Option<CoTMessage>,
    version: Option<u32>,
}

impl TxItem {
    fn announce() -> Self {
        Self {
            dest: None,
            msg: None,
            version: None,
        }
    }
}

struct RxItem {
    sender: SocketAddr,
    endpoint_id: String,
    generic: bool,
    data: Vec<u8>,
}

/// A receive socket as seen by the rx thread between rebuilds.
struct ActiveRx {
    port: u16,
    endpoint_id: String,
    generic: bool,
    socket: Arc<UdpSocket>,
    last_rx: Instant,
}

struct Inner {
    our_uid: ContactUid,
    scanner: Arc<HwIfScanner>,
    ifaces: RwLock<Interfaces>,
    tx_socket: Mutex<Option<Arc<UdpSocket>>>,
    tx_queue: WorkQueue<TxItem>,
    rx_queue: WorkQueue<RxItem>,
    next_announce: Mutex<Option<Instant>>,
    proto_version: AtomicU32,
    ttl: AtomicU32,
    ep_as_udp: AtomicBool,
    crypto: RwLock<Option<MeshCrypto>>,
    listeners: ListenerSet<dyn DatagramListener>,
    iface_listeners: ListenerSet<dyn InterfaceStatusListener>,
}

/// Manages every UDP socket used for CoT.
pub struct DatagramSocketManagement {
    inner: Arc<Inner>,
    handler: ThreadedHandler,
}

impl DatagramSocketManagement {
    /// Create the manager and start its threads.
    ///
    /// `scanner` is consulted for interface addresses when interfaces are
    /// added; the manager must also be registered with it as a
    /// [`HwIfListener`] to follow later changes.
    pub fn new(our_uid: ContactUid, scanner: Arc<HwIfScanner>) -> Result<Self> {
        let inner = Arc::new(Inner::new(our_uid, scanner));
        let handler = ThreadedHandler::new(DATAGRAM_THREADS);
        handler.start(Arc::clone(&inner))?;
        Ok(Self { inner, handler })
    }

    /// Send CoT of the given types to `addr:port`.
    ///
    /// With `iface_name` set, `addr` must be multicast and is sent from that
    /// interface; otherwise it must be unicast.
    pub fn add_broadcast_interface(
        &self,
        iface_name: Option<&str>,
        types: &[CoTMessageType],
        addr: &str,
        port: u16,
    ) -> Result<PhysicalNetInterface> {
        let handle = PhysicalNetInterface {
            id: InterfaceId::next(),
            iface_name: iface_name.map(str::to_string),
        };
        let bcast = BroadcastContext::new(handle.clone(), types, addr, port).inspect_err(|e| {
            warn!(error = %e, "failed to create broadcast interface");
        })?;
        let up = {
            let mut ifaces = self.inner.ifaces.write();
            ifaces.add_broadcast(bcast);
            match iface_name {
                Some(name) => self.inner.refresh_addr(&mut ifaces, name),
                None => true,
            }
        };
        info!(iface = ?iface_name, addr, port, "broadcast interface added");
        if up {
            self.inner.fire_status(&[handle.clone()], true);
        }
        Ok(handle)
    }

    /// Remove a broadcast interface. Listeners hear it go down if it was up.
    pub fn remove_broadcast_interface(&self, iface: &PhysicalNetInterface) -> Result<()> {
        let was_up = self.inner.ifaces.write().remove_broadcast(iface)?;
        info!(iface = ?iface.iface_name, "broadcast interface removed");
        if was_up {
            self.inner.fire_status(std::slice::from_ref(iface), false);
        }
        Ok(())
    }

    /// Listen on `port` of the named interface, joining `mcast_addrs`.
    ///
    /// Generic inbound ports deliver raw payloads instead of CoT; one port
    /// cannot be both.
    pub fn add_inbound_interface(
        &self,
        iface_name: &str,
        port: u16,
        mcast_addrs: &[&str],
        generic: bool,
    ) -> Result<PhysicalNetInterface> {
        let handle = PhysicalNetInterface {
            id: InterfaceId::next(),
            iface_name: Some(iface_name.to_string()),
        };
        let rx = RecvContext::new(handle.clone(), port, mcast_addrs)?;
        let up = {
            let mut ifaces = self.inner.ifaces.write();
            ifaces.add_inbound(iface_name, rx, generic).inspect_err(|e| {
                warn!(iface = iface_name, port, error = %e, "unable to add inbound datagram interface");
            })?;
            self.inner.refresh_addr(&mut ifaces, iface_name)
        };
        info!(iface = iface_name, port, generic, "inbound interface added");
        if up {
            self.inner.fire_status(&[handle.clone()], true);
        }
        Ok(handle)
    }

    /// Remove an inbound interface. Listeners hear it go down if it was up.
    pub fn remove_inbound_interface(&self, iface: &PhysicalNetInterface) -> Result<()> {
        let was_up = self.inner.ifaces.write().remove_inbound(iface)?;
        info!(iface = ?iface.iface_name, "inbound interface removed");
        if was_up {
            self.inner.fire_status(std::slice::from_ref(iface), false);
        }
        Ok(())
    }

    /// Queue `msg` for every matching broadcast destination.
    pub fn send_multicast(&self, msg: &CoTMessage) {
        self.inner.tx_queue.push(TxItem {
            dest: None,
            msg: Some(msg.clone()),
            version: None,
        });
    }

    /// Register a receiver of parsed and generic datagrams.
    pub fn add_datagram_receiver(&self, listener: Arc<dyn DatagramListener>) -> Result<()> {
        self.inner.listeners.add(listener)
    }

    /// Remove a receiver.
    pub fn remove_datagram_receiver(&self, listener: &Arc<dyn DatagramListener>) -> Result<()> {
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

    /// Toggle `SO_REUSEADDR` on receive sockets; all of them are rebuilt.
    pub fn set_enable_address_reuse(&self, enable: bool) {
        let mut ifaces = self.inner.ifaces.write();
        if ifaces.reuse_address == enable {
            return;
        }
        ifaces.reuse_address = enable;
        info!(enable, "address reuse changed, rebuilding rx sockets");
        ifaces.kill_all_rx();
    }

    /// Toggle multicast loopback; outbound sockets are rebuilt.
    pub fn set_multicast_loopback_enabled(&self, enable: bool) {
        let mut ifaces = self.inner.ifaces.write();
        if ifaces.mcast_loop == enable {
            return;
        }
        ifaces.mcast_loop = enable;
        info!(enable, "multicast loopback changed, rebuilding tx sockets");
        ifaces.drop_outbound();
        *self.inner.tx_socket.lock() = None;
    }

    /// Multicast TTL for outbound broadcasts.
    pub fn set_ttl(&self, ttl: u32) {
        self.inner.ttl.store(ttl, Ordering::Relaxed);
    }

    /// Rebuild receive sockets that hear nothing for `timeout`.
    ///
    /// `None` restores the default; zero disables the check.
    pub fn set_rx_timeout(&self, timeout: Option<Duration>) {
        self.inner.ifaces.write().no_data_timeout =
            timeout.unwrap_or(Duration::from_secs(DEFAULT_RX_NO_DATA_REBUILD_SECS));
    }

    /// Advertise our endpoint as UDP rather than TCP.
    pub fn set_advertise_endpoint_as_udp(&self, enable: bool) {
        self.inner.ep_as_udp.store(enable, Ordering::Relaxed);
    }

    /// Encrypt and decrypt all CoT datagrams with `crypto`, or stop doing so.
    pub fn set_crypto(&self, crypto: Option<MeshCrypto>) {
        *self.inner.crypto.write() = crypto;
    }

    /// Version used for broadcasts.
    pub fn proto_version(&self) -> u32 {
        self.inner.proto_version.load(Ordering::Relaxed)
    }
}

impl Drop for DatagramSocketManagement {
    fn drop(&mut self) {
        self.handler.stop(&*self.inner);
        self.inner.tx_queue.drain();
        self.inner.rx_queue.drain();
    }
}

impl DatagramSender for DatagramSocketManagement {
    fn send_datagram(&self, dest: SocketAddr, msg: &CoTMessage, proto_version: u32) -> Result<()> {
        self.inner.tx_queue.push(TxItem {
            dest: Some(dest),
            msg: Some(msg.clone()),
            version: Some(check_proto_version(proto_version)),
        });
        Ok(())
    }

    fn proto_level_change(&self, new_version: u32) {
        self.inner.protocol_changed(new_version);
    }
}

impl HwIfListener for DatagramSocketManagement {
    fn interface_up(&self, name: &str, addr: Ipv4Addr) {
        let handles = {
            let mut ifaces = self.inner.ifaces.write();
            let Some(ctx) = ifaces.by_name.get_mut(name) else {
                return;
            };
            let old = ctx.addr;
            if old == Some(addr) {
                return;
            }
            ctx.addr = Some(addr);
            *ctx.outbound.lock() = None;
            let handles = if old.is_some() { Vec::new() } else { ctx.handles() };
            match old {
                Some(old) => ifaces.suspend_joins(name, old),
                None => ifaces.rx_needs_rebuild = true,
            }
            handles
        };
        debug!(iface = name, %addr, "datagram interface up");
        self.inner.fire_status(&handles, true);
    }

    fn interface_down(&self, name: &str) {
        let handles = {
            let mut ifaces = self.inner.ifaces.write();
            let Some(ctx) = ifaces.by_name.get_mut(name) else {
                return;
            };
            let Some(old) = ctx.addr.take() else {
                return;
            };
            *ctx.outbound.lock() = None;
            let handles = ctx.handles();
            ifaces.suspend_joins(name, old);
            handles
        };
        debug!(iface = name, "datagram interface down");
        self.inner.fire_status(&handles, false);
    }
}

impl ThreadWorker for Inner {
    fn thread_entry(&self, index: usize, stop: &StopFlag) {
        match index {
            TX_THREAD => self.tx_loop(stop),
            RX_THREAD => self.rx_loop(stop),
            RXQ_THREAD => self.rx_queue_loop(stop),
            _ => warn!(index, "unexpected datagram thread"),
        }
    }

    fn thread_stop_signal(&self, index: usize) {
        match index {
            TX_THREAD => self.tx_queue.wake_all(),
            RXQ_THREAD => self.rx_queue.wake_all(),
            _ => {}
        }
    }
}

impl Inner {
    fn new(our_uid: ContactUid, scanner: Arc<HwIfScanner>) -> Self {
        Self {
            our_uid,
            scanner,
            ifaces: RwLock::new(Interfaces::default()),
            tx_socket: Mutex::new(None),
            tx_queue: WorkQueue::new(),
            rx_queue: WorkQueue::new(),
            next_announce: Mutex::new(None),
            proto_version: AtomicU32::new(SELF_MAX_PROTO),
            ttl: AtomicU32::new(DEFAULT_MCAST_TTL),
            ep_as_udp: AtomicBool::new(false),
            crypto: RwLock::new(None),
            listeners: ListenerSet::new(),
            iface_listeners: ListenerSet::new(),
        }
    }

    /// Switch the broadcast version and announce it once, right away.
    fn protocol_changed(&self, new_version: u32) {
        self.proto_version.store(new_version, Ordering::Relaxed);
        self.tx_queue.push(TxItem::announce());
    }

    /// Pick up the current address of `name` from the scanner.
    ///
    /// Returns true if the interface is up.
    fn refresh_addr(&self, ifaces: &mut Interfaces, name: &str) -> bool {
        let addr = self.scanner.address_of(name);
        match ifaces.by_name.get_mut(name) {
            Some(ctx) => {
                if ctx.addr.is_none() {
                    ctx.addr = addr;
                }
                ctx.addr.is_some()
            }
            None => false,
        }
    }

    fn fire_status(&self, handles: &[PhysicalNetInterface], up: bool) {
        for handle in handles {
            let iface = NetInterface::Physical(handle.clone());
            self.iface_listeners.for_each(|l| {
                if up {
                    l.interface_up(&iface);
                } else {
                    l.interface_down(&iface);
                }
            });
        }
    }

    // =========================================================================
    // Transmit
    // =========================================================================

    fn tx_loop(&self, stop: &StopFlag) {
        while !stop.should_stop() {
            let now = Instant::now();
            let wait = (*self.next_announce.lock()).map_or(Duration::ZERO, |t| t.saturating_duration_since(now));
            let item = if wait.is_zero() {
                Some(TxItem::announce())
            } else {
                self.tx_queue.wait_pop_timeout(stop, wait)
            };
            if let Some(item) = item {
                self.transmit(item);
            }
        }
    }

    fn transmit(&self, item: TxItem) {
        let msg_type = item
            .msg
            .as_ref()
            .map_or(CoTMessageType::SituationalAwareness, CoTMessage::message_type);
        let ep_as_udp = self.ep_as_udp.load(Ordering::Relaxed);
        let send_version = item
            .version
            .unwrap_or_else(|| self.proto_version.load(Ordering::Relaxed));

        let sends: Vec<(SendPlan, Arc<UdpSocket>)> = {
            let ifaces = self.ifaces.read();
            plan_sends(&ifaces, item.dest, msg_type, ep_as_udp)
                .into_iter()
                .filter_map(|plan| {
                    let sock = self.tx_socket_for(&ifaces, plan.iface.as_deref())?;
                    Some((plan, sock))
                })
                .collect()
        };

        if item.dest.is_none()
            && msg_type == CoTMessageType::SituationalAwareness
            && (send_version != 0 || item.msg.is_none())
        {
            *self.next_announce.lock() = Some(Instant::now() + PROTOINF_BCAST);
        }

        let ttl = self.ttl.load(Ordering::Relaxed);
        for (plan, sock) in sends {
            let Some(data) = self.encode_for_plan(&item, &plan, send_version) else {
                continue;
            };
            if let Err((dest, e)) = send_planned(&sock, &plan, &data, ttl) {
                error!(%dest, error = %e, "socket error sending UDP message");
                self.discard_tx_socket(plan.iface.as_deref(), &sock);
            }
        }
    }

    /// The datagram carrying `item` along `plan`, encrypted if configured.
    ///
    /// `None` when nothing goes out on this plan.
    fn encode_for_plan(&self, item: &TxItem, plan: &SendPlan, send_version: u32) -> Option<Vec<u8>> {
        let mut version = send_version;
        if plan.unicast_broadcast {
            item.msg.as_ref()?;
            version = 0;
        }
        let mut msg = item.msg.clone();
        if let Some(m) = msg.as_mut() {
            m.set_endpoint(plan.ep_type, &plan.src_ip);
        }
        let data = match TakMessage::new(msg, Some(&self.our_uid)).serialize_mesh(version, true) {
            Ok(d) => d,
            Err(e) => {
                error!(error = %e, "unexpected error serializing message");
                return None;
            }
        };
        match &*self.crypto.read() {
            Some(c) => match c.encrypt(&data) {
                Ok(d) => Some(d),
                Err(e) => {
                    error!(error = %e, "failed to encrypt outgoing message");
                    None
                }
            },
            None => Some(data),
        }
    }

    /// The outbound socket for `iface`, building it if needed.
    fn tx_socket_for(&self, ifaces: &Interfaces, iface: Option<&str>) -> Option<Arc<UdpSocket>> {
        let (slot, bind_ip) = match iface {
            Some(name) => {
                let ctx = ifaces.by_name.get(name)?;
                (&ctx.outbound, Some(ctx.addr?))
            }
            None => (&self.tx_socket, None),
        };
        let mut slot = slot.lock();
        if let Some(s) = slot.as_ref() {
            return Some(Arc::clone(s));
        }
        match build_tx_socket(bind_ip, ifaces.mcast_loop) {
            Ok(s) => {
                let s = Arc::new(s);
                *slot = Some(Arc::clone(&s));
                Some(s)
            }
            Err(e) => {
                warn!(addr = ?bind_ip, error = %e, "unable to build outbound datagram socket; will retry later");
                None
            }
        }
    }

    fn discard_tx_socket(&self, iface: Option<&str>, sock: &Arc<UdpSocket>) {
        let ifaces = self.ifaces.read();
        let slot = match iface {
            Some(name) => match ifaces.by_name.get(name) {
                Some(ctx) => &ctx.outbound,
                None => return,
            },
            None => &self.tx_socket,
        };
        let mut slot = slot.lock();
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, sock)) {
            *slot = None;
        }
    }

    // =========================================================================
    // Receive
    // =========================================================================

    fn rx_loop(&self, stop: &StopFlag) {
        let mut active: Vec<ActiveRx> = Vec::new();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        while !stop.should_stop() {
            let no_data_timeout = {
                let mut ifaces = self.ifaces.write();
                if ifaces.rx_needs_rebuild {
                    ifaces.rx_needs_rebuild = false;
                    active = rebuild_rx(&mut ifaces, &active);
                }
                ifaces.no_data_timeout
            };

            let now = Instant::now();
            let mut received = false;
            let mut dead = Vec::new();
            for rx in &mut active {
                let mut count = 0usize;
                loop {
                    match rx.socket.recv_from(&mut buf) {
                        Ok((len, sender)) => {
                            count += 1;
                            self.rx_queue.push(RxItem {
                                sender,
                                endpoint_id: rx.endpoint_id.clone(),
                                generic: rx.generic,
                                data: buf[..len].to_vec(),
                            });
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => {
                            warn!(port = rx.port, error = %e, "datagram rx socket read error; will retry if interface still valid");
                            dead.push(rx.port);
                            break;
                        }
                    }
                }
                if count > 0 {
                    rx.last_rx = now;
                    received = true;
                } else if !no_data_timeout.is_zero() && now.saturating_duration_since(rx.last_rx) > no_data_timeout {
                    debug!(port = rx.port, "datagram rx socket quiet for too long; rebuilding and reissuing joins");
                    dead.push(rx.port);
                }
            }

            if !dead.is_empty() {
                let mut ifaces = self.ifaces.write();
                for port in &dead {
                    if let Some(shared) = ifaces.sockets.get_mut(port) {
                        shared.kill();
                    }
                }
                ifaces.rx_needs_rebuild = true;
                active.retain(|rx| !dead.contains(&rx.port));
            }
            if !received {
                thread::sleep(DATAGRAM_IDLE_SLEEP);
            }
        }
    }

    fn rx_queue_loop(&self, stop: &StopFlag) {
        while let Some(item) = self.rx_queue.wait_pop(stop) {
            if item.generic {
                self.listeners
                    .for_each(|l| l.datagram_received_generic(&item.endpoint_id, &item.data));
                continue;
            }
            let data = match &*self.crypto.read() {
                Some(c) => match c.decrypt(&item.data) {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(endpoint = %item.endpoint_id, sender = %item.sender, error = %e,
                            data = %preview(&item.data), "undecryptable datagram; dropping");
                        continue;
                    }
                },
                None => item.data,
            };
            match TakMessage::parse_mesh(&data) {
                Ok(msg) => {
                    self.listeners
                        .for_each(|l| l.datagram_received(&item.endpoint_id, Some(item.sender), &msg));
                }
                Err(e) => {
                    warn!(endpoint = %item.endpoint_id, sender = %item.sender, error = %e,
                        data = %preview(&data), "invalid CoT message received; dropping");
                }
            }
        }
    }
}

/// Recreate missing receive sockets and issue pending joins.
fn rebuild_rx(ifaces: &mut Interfaces, previous: &[ActiveRx]) -> Vec<ActiveRx> {
    let Interfaces {
        by_name,
        sockets,
        reuse_address,
        ..
    } = ifaces;
    let mut active = Vec::new();
    let now = Instant::now();

    for (port, shared) in sockets.iter_mut() {
        let sock = match &shared.socket {
            Some(s) => Arc::clone(s),
            None => match build_rx_socket(*port, *reuse_address) {
                Ok(s) => {
                    let s = Arc::new(s);
                    shared.socket = Some(Arc::clone(&s));
                    s
                }
                Err(e) => {
                    error!(port, error = %e, "unable to create listening UDP socket");
                    continue;
                }
            },
        };

        let mut join_failed = false;
        let pending: Vec<String> = shared.pending.iter().cloned().collect();
        for name in pending {
            let Some(ctx) = by_name.get(&name) else {
                continue;
            };
            let Some(local) = ctx.addr else {
                continue;
            };
            let groups = ctx
                .recv
                .iter()
                .find(|r| r.port == *port)
                .map(|r| r.mcast.as_slice())
                .unwrap_or_default();
            if let Some((group, e)) = groups
                .iter()
                .find_map(|g| sock.join_multicast_v4(g, &local).err().map(|e| (g, e)))
            {
                error!(port, iface = %name, %group, error = %e, "error joining multicast group; will rebuild socket");
                join_failed = true;
                break;
            }
            shared.pending.remove(&name);
            shared.joined.insert(name);
        }
        if join_failed {
            shared.kill();
            continue;
        }

        let last_rx = previous
            .iter()
            .find(|p| Arc::ptr_eq(&p.socket, &sock))
            .map_or(now, |p| p.last_rx);
        active.push(ActiveRx {
            port: *port,
            endpoint_id: shared.endpoint_id.clone(),
            generic: shared.generic,
            socket: sock,
            last_rx,
        });
    }
    active
}

/// Printable prefix of a payload for log lines.
fn preview(data: &[u8]) -> String {
    String::from_utf8_lossy(&data[..data.len().min(80)]).into_owned()
}

/// Send `data` to every destination of `plan`, stopping at the first
/// failure. Interface sockets get the multicast TTL first.
fn send_planned(
    sock: &UdpSocket,
    plan: &SendPlan,
    data: &[u8],
    ttl: u32,
) -> std::result::Result<(), (SocketAddr, std::io::Error)> {
    for dest in &plan.dests {
        let sent = if plan.iface.is_some() {
            sock.set_multicast_ttl_v4(ttl).and_then(|_| sock.send_to(data, dest))
        } else {
            sock.send_to(data, dest)
        };
        sent.map_err(|e| (*dest, e))?;
        trace!(%dest, len = data.len(), "datagram sent");
    }
    Ok(())
}

fn build_rx_socket(port: u16, reuse: bool) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(reuse)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn build_tx_socket(bind_ip: Option<Ipv4Addr>, mcast_loop: bool) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    let ip = bind_ip.unwrap_or(Ipv4Addr::UNSPECIFIED);
    socket.bind(&SocketAddr::new(IpAddr::V4(ip), 0).into())?;
    match bind_ip {
        Some(local) => socket.set_multicast_if_v4(&local)?,
        None => socket.set_broadcast(true)?,
    }
    socket.set_multicast_loop_v4(mcast_loop)?;
    Ok(socket.into())
}

//! Contact tracking and per-contact routing.
//!
//! Contacts are learned from received traffic (datagram, inbound TCP and
//! server streams) or configured by the application. Each one keeps at
//! most one endpoint per transport; sends pick the best endpoint according
//! to the send method and how recently each endpoint heard from the peer.
//!
//! A background thread intersects the protocol ranges of every contact with
//! a fresh mesh endpoint and tells the datagram layer which version to use
//! for broadcasts.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use super::endpoint::{DatagramEndpoint, StreamingEndpoint, TcpEndpoint};
use crate::core::constants::{
    CONTACT_DIRECT_TIMEOUT, CONTACT_THREADS, LEGACY_PROTO, PROTOINF_TIMEOUT, SELF_MAX_PROTO,
    SELF_MIN_PROTO,
};
use crate::core::{
    CoTSendMethod, CommoError, ContactEndpointType, ContactPresenceListener, ContactUid,
    DatagramListener, DatagramSender, EndpointType, InterfaceStatusListener, ListenerSet, Result,
    StreamSender, StreamingMessageListener, TakProtoInfo, TcpSender,
};
use crate::cot::{CoTMessage, TakMessage};
use crate::net::NetInterface;
use crate::threading::{Signal, StopFlag, ThreadWorker, ThreadedHandler, WorkQueue};

const EVENT_THREAD: usize = 0;
const PROTO_THREAD: usize = 1;

/// Everything known about one remote contact.
#[derive(Debug, Clone)]
pub(crate) struct ContactState {
    callsign: String,
    known_endpoint: bool,
    datagram: Option<DatagramEndpoint>,
    tcp: Option<TcpEndpoint>,
    stream: Option<StreamingEndpoint>,
    proto_inf: TakProtoInfo,
    proto_inf_valid: bool,
    proto_inf_expire: Option<Instant>,
    mesh_expire: Option<Instant>,
    last_mesh_proto: u32,
}

impl ContactState {
    fn new(known_endpoint: bool) -> Self {
        Self {
            callsign: String::new(),
            known_endpoint,
            datagram: None,
            tcp: None,
            stream: None,
            proto_inf: TakProtoInfo::new(LEGACY_PROTO, LEGACY_PROTO),
            proto_inf_valid: false,
            proto_inf_expire: None,
            mesh_expire: None,
            last_mesh_proto: LEGACY_PROTO,
        }
    }

    fn has_endpoint(&self) -> bool {
        self.datagram.is_some() || self.tcp.is_some() || self.stream.is_some()
    }

    fn mesh_fresh(&self, now: Instant) -> bool {
        self.mesh_expire.is_some_and(|t| now <= t)
    }

    fn update_endpoint(&mut self, ty: ContactEndpointType, host: &str, port: u16) -> Result<()> {
        match ty {
            ContactEndpointType::Datagram => {
                let known = self.known_endpoint;
                match self.datagram.as_mut() {
                    Some(ep) if known => ep.update_known(host, port)?,
                    Some(ep) => ep.update_from_cot(host)?,
                    None if known => self.datagram = Some(DatagramEndpoint::known(host, port)?),
                    None => self.datagram = Some(DatagramEndpoint::discovered(host)?),
                }
                if !self.known_endpoint
                    && let Some(ep) = &self.datagram
                {
                    self.mesh_expire = Some(ep.last_rx() + PROTOINF_TIMEOUT);
                }
            }
            ContactEndpointType::Tcp => {
                match &mut self.tcp {
                    Some(ep) => ep.update(host, port)?,
                    None => self.tcp = Some(TcpEndpoint::new(host, port)?),
                }
                if let Some(ep) = &self.tcp {
                    self.mesh_expire = Some(ep.last_rx() + PROTOINF_TIMEOUT);
                }
            }
            ContactEndpointType::Streaming => match &mut self.stream {
                Some(ep) => ep.update(host)?,
                None => self.stream = Some(StreamingEndpoint::new(host)?),
            },
        }
        Ok(())
    }

    /// Fold one received update into the state.
    ///
    /// Returns `(accepted, proto_needs_refresh)`.
    fn apply_update(&mut self, update: &ContactUpdate<'_>, now: Instant) -> (bool, bool) {
        if update.known_endpoint != self.known_endpoint {
            return (false, false);
        }
        let ep_was_fresh = self.mesh_fresh(now);
        let mut ok = true;
        if !update.proto_only {
            match self.update_endpoint(update.ep_type, update.host, update.port) {
                Ok(()) => self.callsign = update.callsign.to_string(),
                Err(e) => {
                    trace!(error = %e, "endpoint update rejected");
                    ok = false;
                }
            }
        }

        let mut refresh = false;
        if update.ep_type != ContactEndpointType::Streaming && !update.known_endpoint {
            let valid_ep = ok && !update.proto_only;
            let ep_fresh = ep_was_fresh || valid_ep;
            let old = (self.proto_inf_valid, self.proto_inf);
            if valid_ep {
                self.last_mesh_proto = update.msg_version;
            }
            if let Some(info) = update.proto_inf {
                self.proto_inf_valid = true;
                self.proto_inf_expire = Some(now + PROTOINF_TIMEOUT);
                self.proto_inf = info;
            } else if !self.proto_inf_valid && valid_ep {
                self.proto_inf = TakProtoInfo::new(update.msg_version, update.msg_version);
            }
            refresh = ep_fresh && (!ep_was_fresh || old != (self.proto_inf_valid, self.proto_inf));
        }
        (ok, refresh)
    }

    /// Protocol version to use for a direct send to this contact.
    fn send_version(&self) -> u32 {
        if self.proto_inf.max < SELF_MIN_PROTO || self.proto_inf.min > SELF_MAX_PROTO {
            LEGACY_PROTO
        } else {
            self.proto_inf.max.min(SELF_MAX_PROTO)
        }
    }

    /// Which endpoint a send with `method` should use right now.
    fn current_endpoint(
        &self,
        method: CoTSendMethod,
        prefer_stream: bool,
        now: Instant,
    ) -> Option<ContactEndpointType> {
        let stream = self.stream.as_ref().filter(|_| method.allows_streaming());
        let mut mesh = None;
        if method.allows_mesh() {
            if let Some(tcp) = &self.tcp {
                mesh = Some((ContactEndpointType::Tcp, tcp.last_rx()));
            }
            if let Some(dg) = &self.datagram
                && mesh.is_none_or(|(_, t)| dg.last_rx() > t)
            {
                mesh = Some((ContactEndpointType::Datagram, dg.last_rx()));
            }
        }
        if stream.is_some()
            && let Some((_, rx)) = mesh
            && now.saturating_duration_since(rx) > CONTACT_DIRECT_TIMEOUT
        {
            mesh = None;
        }
        match (stream, mesh) {
            (Some(_), Some((ty, _))) if !prefer_stream => Some(ty),
            (Some(_), _) => Some(ContactEndpointType::Streaming),
            (None, Some((ty, _))) => Some(ty),
            (None, None) => None,
        }
    }
}

/// One received or configured contact update.
struct ContactUpdate<'a> {
    proto_only: bool,
    msg_version: u32,
    proto_inf: Option<TakProtoInfo>,
    known_endpoint: bool,
    ep_type: ContactEndpointType,
    host: &'a str,
    callsign: &'a str,
    port: u16,
}

/// Intersection of the protocol ranges of every contact with a fresh mesh
/// endpoint, expiring stale protocol information on the way.
///
/// Returns the highest shared version, or legacy if there is none.
fn compute_broadcast_version<'a>(
    contacts: impl IntoIterator<Item = &'a mut ContactState>,
    now: Instant,
) -> u32 {
    let mut lo = SELF_MIN_PROTO;
    let mut hi = SELF_MAX_PROTO;
    let mut shared = true;
    for state in contacts {
        if state.proto_inf_valid && state.proto_inf_expire.is_none_or(|t| now >= t) {
            state.proto_inf_valid = false;
            state.proto_inf = TakProtoInfo::new(state.last_mesh_proto, state.last_mesh_proto);
        }
        if !state.mesh_fresh(now) {
            continue;
        }
        if shared {
            lo = lo.max(state.proto_inf.min);
            hi = hi.min(state.proto_inf.max);
            if lo > hi {
                shared = false;
            }
        }
    }
    if shared { hi } else { LEGACY_PROTO }
}

struct Inner {
    contacts: RwLock<BTreeMap<ContactUid, Mutex<ContactState>>>,
    datagram: Arc<dyn DatagramSender>,
    tcp: Arc<dyn TcpSender>,
    stream: Arc<dyn StreamSender>,
    listeners: ListenerSet<dyn ContactPresenceListener>,
    events: WorkQueue<(ContactUid, bool)>,
    proto_dirty: Signal,
    broadcast_version: Mutex<u32>,
    prefer_stream: Mutex<bool>,
}

/// Tracks remote contacts and routes point-to-point sends to them.
pub struct ContactManager {
    inner: Arc<Inner>,
    handler: ThreadedHandler,
}

impl ContactManager {
    /// Create a manager sending through the given transports.
    ///
    /// The datagram transport is told the initial broadcast version before
    /// this returns.
    pub fn new(
        datagram: Arc<dyn DatagramSender>,
        tcp: Arc<dyn TcpSender>,
        stream: Arc<dyn StreamSender>,
    ) -> Result<Self> {
        let inner = Arc::new(Inner {
            contacts: RwLock::new(BTreeMap::new()),
            datagram,
            tcp,
            stream,
            listeners: ListenerSet::new(),
            events: WorkQueue::new(),
            proto_dirty: Signal::new(),
            broadcast_version: Mutex::new(SELF_MAX_PROTO),
            prefer_stream: Mutex::new(false),
        });
        inner.datagram.proto_level_change(SELF_MAX_PROTO);
        let handler = ThreadedHandler::new(CONTACT_THREADS);
        handler.start(Arc::clone(&inner))?;
        Ok(Self { inner, handler })
    }

    /// Register a presence listener.
    pub fn add_contact_presence_listener(&self, listener: Arc<dyn ContactPresenceListener>) -> Result<()> {
        self.inner.listeners.add(listener)
    }

    /// Remove a presence listener.
    pub fn remove_contact_presence_listener(
        &self,
        listener: &Arc<dyn ContactPresenceListener>,
    ) -> Result<()> {
        self.inner.listeners.remove(listener)
    }

    /// Send `msg` to each destination over its current best endpoint.
    ///
    /// Destinations that are unknown, have no usable endpoint, or whose
    /// transport rejected the message are returned in
    /// [`CommoError::ContactGone`].
    pub fn send_cot(&self, destinations: &[ContactUid], msg: &CoTMessage, method: CoTSendMethod) -> Result<()> {
        let mut gone = Vec::new();
        let mut streams: BTreeMap<String, (Vec<String>, Vec<ContactUid>)> = BTreeMap::new();
        let prefer = *self.inner.prefer_stream.lock();
        let now = Instant::now();
        {
            let contacts = self.inner.contacts.read();
            for uid in destinations {
                let Some(state) = contacts.get(uid) else {
                    gone.push(uid.clone());
                    continue;
                };
                let state = state.lock();
                let sent = match state.current_endpoint(method, prefer, now) {
                    Some(ContactEndpointType::Datagram) => state.datagram.as_ref().map(|ep| {
                        self.inner
                            .datagram
                            .send_datagram(ep.addr_for(msg.message_type()), msg, state.send_version())
                    }),
                    Some(ContactEndpointType::Tcp) => state.tcp.as_ref().map(|ep| {
                        self.inner
                            .tcp
                            .send_message(ep.host(), ep.port(), msg, state.send_version())
                    }),
                    Some(ContactEndpointType::Streaming) => state.stream.as_ref().map(|ep| {
                        let entry = streams.entry(ep.stream_id().to_string()).or_default();
                        entry.0.push(state.callsign.clone());
                        entry.1.push(uid.clone());
                        Ok(())
                    }),
                    None => None,
                };
                match sent {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        debug!(contact = %uid, error = %e, "send to contact failed");
                        gone.push(uid.clone());
                    }
                    None => gone.push(uid.clone()),
                }
            }
        }

        for (stream_id, (callsigns, uids)) in streams {
            let mut relayed = msg.clone();
            relayed.set_endpoint(EndpointType::Streaming, "");
            relayed.set_tak_server_recipients(&callsigns);
            if let Err(e) = self.inner.stream.send_message(&stream_id, &relayed) {
                debug!(stream = %stream_id, error = %e, "stream send failed");
                gone.extend(uids);
            }
        }

        if gone.is_empty() {
            Ok(())
        } else {
            Err(CommoError::ContactGone(gone))
        }
    }

    /// Configure, update or delete a contact reachable at a fixed UDP address.
    ///
    /// With both `callsign` and `host` set the contact is created or
    /// updated; with both unset it is deleted. Contacts learned from
    /// traffic cannot be changed this way.
    pub fn config_known_endpoint_contact(
        &self,
        uid: &ContactUid,
        callsign: Option<&str>,
        host: Option<&str>,
        port: u16,
    ) -> Result<()> {
        match (callsign, host) {
            (None, None) => {
                let removed = {
                    let mut contacts = self.inner.contacts.write();
                    match contacts.get(uid) {
                        Some(state) if state.lock().known_endpoint => contacts.remove(uid).is_some(),
                        Some(_) => return Err(CommoError::invalid("contact was not configured")),
                        None => return Err(CommoError::invalid("no such contact")),
                    }
                };
                if removed {
                    info!(contact = %uid, "configured contact removed");
                    self.inner.events.push((uid.clone(), false));
                }
                Ok(())
            }
            (Some(callsign), Some(host)) if !callsign.is_empty() && !host.is_empty() => {
                self.inner.process_update(
                    uid,
                    ContactUpdate {
                        proto_only: false,
                        msg_version: LEGACY_PROTO,
                        proto_inf: None,
                        known_endpoint: true,
                        ep_type: ContactEndpointType::Datagram,
                        host,
                        callsign,
                        port,
                    },
                )
            }
            _ => Err(CommoError::invalid("callsign and address must be given together")),
        }
    }

    /// Every contact currently tracked.
    pub fn get_all_contacts(&self) -> Vec<ContactUid> {
        self.inner.contacts.read().keys().cloned().collect()
    }

    /// True if `uid` is tracked.
    pub fn has_contact(&self, uid: &ContactUid) -> bool {
        self.inner.contacts.read().contains_key(uid)
    }

    /// True if `uid` is reachable through a server stream.
    pub fn has_streaming_endpoint(&self, uid: &ContactUid) -> bool {
        self.inner
            .contacts
            .read()
            .get(uid)
            .is_some_and(|s| s.lock().stream.is_some())
    }

    /// Host a direct send to `uid` would go to.
    ///
    /// `None` if the contact is unknown or currently routed via a stream.
    pub fn get_active_endpoint_host(&self, uid: &ContactUid) -> Option<String> {
        let prefer = *self.inner.prefer_stream.lock();
        let contacts = self.inner.contacts.read();
        let state = contacts.get(uid)?.lock();
        match state.current_endpoint(CoTSendMethod::Any, prefer, Instant::now())? {
            ContactEndpointType::Datagram => state.datagram.as_ref().map(|ep| ep.base_addr().to_string()),
            ContactEndpointType::Tcp => state.tcp.as_ref().map(|ep| ep.host().to_string()),
            ContactEndpointType::Streaming => None,
        }
    }

    /// Endpoint id of the stream `uid` is reachable through.
    ///
    /// With `if_active` set this fails unless the stream is the endpoint a
    /// send would currently use.
    pub fn get_stream_endpoint_identifier(&self, uid: &ContactUid, if_active: bool) -> Result<String> {
        let prefer = *self.inner.prefer_stream.lock();
        let contacts = self.inner.contacts.read();
        let state = contacts
            .get(uid)
            .ok_or_else(|| CommoError::invalid("no such contact"))?
            .lock();
        let stream = state
            .stream
            .as_ref()
            .ok_or_else(|| CommoError::invalid("contact has no stream endpoint"))?;
        if if_active
            && state.current_endpoint(CoTSendMethod::Any, prefer, Instant::now())
                != Some(ContactEndpointType::Streaming)
        {
            return Err(CommoError::invalid("stream endpoint is not active"));
        }
        Ok(stream.stream_id().to_string())
    }

    /// Prefer a stream over an equally fresh mesh endpoint.
    pub fn set_prefer_stream_endpoint(&self, prefer: bool) {
        *self.inner.prefer_stream.lock() = prefer;
    }

    /// Version currently used for mesh broadcasts.
    pub fn broadcast_proto_version(&self) -> u32 {
        *self.inner.broadcast_version.lock()
    }

    /// Fold traffic received over TCP into the contact list.
    pub fn tcp_message_received(&self, sender: Option<SocketAddr>, msg: &CoTMessage) {
        let host = match msg.endpoint_type() {
            EndpointType::TcpUseSrc => match sender {
                Some(s) => s.ip().to_string(),
                None => return,
            },
            EndpointType::Tcp => msg.endpoint_host().to_string(),
            _ => return,
        };
        let uid = msg.contact_uid();
        self.inner.message_received(
            &host,
            uid.as_ref(),
            None,
            Some(msg),
            LEGACY_PROTO,
            ContactEndpointType::Tcp,
        );
    }

    /// Drop every stream endpoint pointing at `stream_id`.
    ///
    /// Contacts left with no endpoint are removed.
    pub fn remove_stream(&self, stream_id: &str) {
        let mut removed = Vec::new();
        {
            let mut contacts = self.inner.contacts.write();
            contacts.retain(|uid, state| {
                let state = state.get_mut();
                if state.stream.as_ref().is_none_or(|s| s.stream_id() != stream_id) {
                    return true;
                }
                if state.datagram.is_none() && state.tcp.is_none() {
                    removed.push(uid.clone());
                    false
                } else {
                    state.stream = None;
                    true
                }
            });
        }
        if !removed.is_empty() {
            info!(stream = %stream_id, count = removed.len(), "contacts lost with stream");
            self.inner.events.extend(removed.into_iter().map(|uid| (uid, false)));
        }
    }
}

impl Drop for ContactManager {
    fn drop(&mut self) {
        self.handler.stop(&*self.inner);
    }
}

impl Inner {
    fn process_update(&self, uid: &ContactUid, update: ContactUpdate<'_>) -> Result<()> {
        if update.known_endpoint && update.ep_type != ContactEndpointType::Datagram {
            return Err(CommoError::invalid("configured contacts are datagram only"));
        }
        let now = Instant::now();
        let mut found = false;
        let mut result = (true, false);
        if let Some(state) = self.contacts.read().get(uid) {
            found = true;
            result = state.lock().apply_update(&update, now);
        }

        if !found && !update.proto_only {
            let mut contacts = self.contacts.write();
            match contacts.get(uid) {
                Some(state) => result = state.lock().apply_update(&update, now),
                None => {
                    let mut state = ContactState::new(update.known_endpoint);
                    result = state.apply_update(&update, now);
                    if result.0 && state.has_endpoint() {
                        debug!(contact = %uid, callsign = %state.callsign, "new contact");
                        contacts.insert(uid.clone(), Mutex::new(state));
                        self.events.push((uid.clone(), true));
                        result.1 = true;
                    } else {
                        result.0 = false;
                    }
                }
            }
        }

        if result.1 {
            self.proto_dirty.raise();
        }
        if result.0 {
            Ok(())
        } else {
            Err(CommoError::invalid("contact update rejected"))
        }
    }

    fn message_received(
        &self,
        host: &str,
        uid: Option<&ContactUid>,
        proto_inf: Option<TakProtoInfo>,
        msg: Option<&CoTMessage>,
        msg_version: u32,
        ep_type: ContactEndpointType,
    ) {
        let Some(uid) = uid else {
            return;
        };
        let mut proto_only = msg.is_none();
        let mut callsign = "";
        let mut port = 0;
        if let Some(m) = msg {
            callsign = m.callsign();
            if !host.is_empty() {
                port = m
                    .endpoint_port()
                    .and_then(|p| u16::try_from(p).ok())
                    .unwrap_or(0);
            } else if proto_inf.is_some() {
                proto_only = true;
            } else {
                return;
            }
        }
        let update = ContactUpdate {
            proto_only,
            msg_version,
            proto_inf,
            known_endpoint: false,
            ep_type,
            host,
            callsign,
            port,
        };
        if let Err(e) = self.process_update(uid, update) {
            trace!(contact = %uid, error = %e, "ignored contact update");
        }
    }

    fn event_loop(&self, stop: &StopFlag) {
        while let Some((uid, added)) = self.events.wait_pop(stop) {
            self.listeners.for_each(|l| {
                if added {
                    l.contact_added(&uid);
                } else {
                    l.contact_removed(&uid);
                }
            });
        }
    }

    fn proto_loop(&self, stop: &StopFlag) {
        while !stop.should_stop() {
            self.proto_dirty.wait(stop, PROTOINF_TIMEOUT / 4);
            if stop.should_stop() {
                break;
            }
            let version = {
                let contacts = self.contacts.read();
                let mut guards: Vec<_> = contacts.values().map(|s| s.lock()).collect();
                compute_broadcast_version(guards.iter_mut().map(|g| &mut **g), Instant::now())
            };
            let changed = {
                let mut current = self.broadcast_version.lock();
                let changed = *current != version;
                *current = version;
                changed
            };
            if changed {
                info!(version, "mesh broadcast protocol version changed");
                self.datagram.proto_level_change(version);
            }
        }
    }
}

impl ThreadWorker for Inner {
    fn thread_entry(&self, index: usize, stop: &StopFlag) {
        match index {
            EVENT_THREAD => self.event_loop(stop),
            PROTO_THREAD => self.proto_loop(stop),
            _ => warn!(index, "unexpected contact manager thread"),
        }
    }

    fn thread_stop_signal(&self, index: usize) {
        match index {
            EVENT_THREAD => self.events.wake_all(),
            _ => self.proto_dirty.wake(),
        }
    }
}

impl DatagramListener for ContactManager {
    fn datagram_received(&self, _endpoint_id: &str, sender: Option<SocketAddr>, msg: &TakMessage) {
        let cot = msg.cot_message();
        let (host, ep_type) = match cot {
            Some(c) => (c.endpoint_host().to_string(), c.endpoint_type()),
            None => (String::new(), EndpointType::Tcp),
        };
        let (host, ty) = match ep_type {
            EndpointType::Udp => (host, ContactEndpointType::Datagram),
            EndpointType::Tcp => (host, ContactEndpointType::Tcp),
            EndpointType::TcpUseSrc => match sender {
                Some(s) => (s.ip().to_string(), ContactEndpointType::Tcp),
                None => return,
            },
            EndpointType::UdpUseSrc => match sender {
                Some(s) => (s.ip().to_string(), ContactEndpointType::Datagram),
                None => return,
            },
            EndpointType::Streaming | EndpointType::None => return,
        };
        self.inner.message_received(
            &host,
            msg.contact_uid(),
            msg.proto_info(),
            cot,
            msg.proto_version(),
            ty,
        );
    }
}

impl StreamingMessageListener for ContactManager {
    fn streaming_message_received(&self, stream_endpoint: &str, msg: &CoTMessage) {
        if msg.endpoint_type() == EndpointType::None {
            return;
        }
        let uid = msg.contact_uid();
        self.inner.message_received(
            stream_endpoint,
            uid.as_ref(),
            None,
            Some(msg),
            LEGACY_PROTO,
            ContactEndpointType::Streaming,
        );
    }
}

impl InterfaceStatusListener for ContactManager {
    fn interface_up(&self, _iface: &NetInterface) {}

    fn interface_down(&self, iface: &NetInterface) {
        if let NetInterface::Streaming(s) = iface {
            self.remove_stream(&s.remote_endpoint_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeTransport {
        datagrams: Mutex<Vec<(SocketAddr, u32)>>,
        tcp: Mutex<Vec<(String, u16)>>,
        streams: Mutex<Vec<(String, CoTMessage)>>,
        versions: Mutex<Vec<u32>>,
        fail_streams: bool,
    }

    impl DatagramSender for FakeTransport {
        fn send_datagram(&self, dest: SocketAddr, _msg: &CoTMessage, v: u32) -> Result<()> {
            self.datagrams.lock().push((dest, v));
            Ok(())
        }

        fn proto_level_change(&self, v: u32) {
            self.versions.lock().push(v);
        }
    }

    impl TcpSender for FakeTransport {
        fn send_message(&self, host: &str, port: u16, _msg: &CoTMessage, _v: u32) -> Result<()> {
            self.tcp.lock().push((host.to_string(), port));
            Ok(())
        }
    }

    impl StreamSender for FakeTransport {
        fn send_message(&self, stream: &str, msg: &CoTMessage) -> Result<()> {
            if self.fail_streams {
                return Err(CommoError::invalid("stream down"));
            }
            self.streams.lock().push((stream.to_string(), msg.clone()));
            Ok(())
        }
    }

    fn manager(fake: &Arc<FakeTransport>) -> ContactManager {
        ContactManager::new(fake.clone(), fake.clone(), fake.clone()).unwrap()
    }

    fn sa(uid: &str, callsign: &str, endpoint: &str) -> CoTMessage {
        let xml = format!(
            r#"<event version="2.0" uid="{uid}" type="a-f-G" how="m-g" time="2024-01-01T00:00:00Z" start="2024-01-01T00:00:00Z" stale="2024-01-01T00:01:00Z"><point lat="1" lon="2" hae="3" ce="4" le="5"/><detail><contact callsign="{callsign}" endpoint="{endpoint}"/></detail></event>"#
        );
        CoTMessage::parse(xml.as_bytes()).unwrap()
    }

    fn ago(secs: u64) -> Instant {
        Instant::now()
            .checked_sub(Duration::from_secs(secs))
            .unwrap_or_else(Instant::now)
    }

    #[derive(Default)]
    struct Presence(Mutex<Vec<(ContactUid, bool)>>);

    impl ContactPresenceListener for Presence {
        fn contact_added(&self, c: &ContactUid) {
            self.0.lock().push((c.clone(), true));
        }

        fn contact_removed(&self, c: &ContactUid) {
            self.0.lock().push((c.clone(), false));
        }
    }

    fn wait_for(f: impl Fn() -> bool) {
        for _ in 0..200 {
            if f() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_discovers_from_datagram() {
        let fake = Arc::new(FakeTransport::default());
        let cm = manager(&fake);
        let presence = Arc::new(Presence::default());
        cm.add_contact_presence_listener(presence.clone()).unwrap();

        let msg = TakMessage::parse_xml(&sa("ANDROID-1", "ALPHA", "10.0.0.5:4242:udp").serialize()).unwrap();
        cm.datagram_received("*:6969:udp", None, &msg);

        let uid = ContactUid::from("ANDROID-1");
        assert!(cm.has_contact(&uid));
        assert_eq!(cm.get_active_endpoint_host(&uid).as_deref(), Some("10.0.0.5"));
        wait_for(|| !presence.0.lock().is_empty());
        assert_eq!(presence.0.lock()[0], (uid.clone(), true));

        cm.send_cot(&[uid], &sa("me", "ME", ""), CoTSendMethod::Any).unwrap();
        let sent = fake.datagrams.lock();
        assert_eq!(sent[0].0, "10.0.0.5:6969".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_rejected_update_keeps_callsign() {
        let update = |host, callsign| ContactUpdate {
            proto_only: false,
            msg_version: LEGACY_PROTO,
            proto_inf: None,
            known_endpoint: false,
            ep_type: ContactEndpointType::Datagram,
            host,
            callsign,
            port: 4242,
        };
        let now = Instant::now();
        let mut state = ContactState::new(false);
        assert!(state.apply_update(&update("10.0.0.5", "ALPHA"), now).0);
        assert_eq!(state.callsign, "ALPHA");

        assert!(!state.apply_update(&update("not-an-address", "BRAVO"), now).0);
        assert_eq!(state.callsign, "ALPHA");

        assert!(state.apply_update(&update("10.0.0.6", "CHARLIE"), now).0);
        assert_eq!(state.callsign, "CHARLIE");
    }

    #[test]
    fn test_known_contact_not_overwritten_by_traffic() {
        let fake = Arc::new(FakeTransport::default());
        let cm = manager(&fake);
        let uid = ContactUid::from("K1");
        cm.config_known_endpoint_contact(&uid, Some("KNOWN"), Some("192.168.1.9"), 5000)
            .unwrap();

        let msg = TakMessage::parse_xml(&sa("K1", "OTHER", "10.9.9.9:4242:udp").serialize()).unwrap();
        cm.datagram_received("*:6969:udp", None, &msg);

        assert_eq!(cm.get_active_endpoint_host(&uid).as_deref(), Some("192.168.1.9"));
        cm.send_cot(std::slice::from_ref(&uid), &sa("me", "ME", ""), CoTSendMethod::Any)
            .unwrap();
        assert_eq!(fake.datagrams.lock()[0].0.port(), 5000);
    }

    #[test]
    fn test_config_known_contact_arguments() {
        let fake = Arc::new(FakeTransport::default());
        let cm = manager(&fake);
        let uid = ContactUid::from("K2");
        assert!(cm.config_known_endpoint_contact(&uid, Some("A"), None, 1).is_err());
        assert!(cm.config_known_endpoint_contact(&uid, Some(""), Some("10.0.0.1"), 1).is_err());
        assert!(cm.config_known_endpoint_contact(&uid, None, None, 0).is_err());
        cm.config_known_endpoint_contact(&uid, Some("A"), Some("10.0.0.1"), 1).unwrap();
        cm.config_known_endpoint_contact(&uid, None, None, 0).unwrap();
        assert!(!cm.has_contact(&uid));

        let msg = TakMessage::parse_xml(&sa("D1", "D", "10.0.0.2:4242:udp").serialize()).unwrap();
        cm.datagram_received("*:6969:udp", None, &msg);
        assert!(cm.config_known_endpoint_contact(&ContactUid::from("D1"), None, None, 0).is_err());
    }

    #[test]
    fn test_endpoint_selection() {
        let mut state = ContactState::new(false);
        state.update_endpoint(ContactEndpointType::Datagram, "10.0.0.1", 0).unwrap();
        state.update_endpoint(ContactEndpointType::Streaming, "ssl:tak:8089", 0).unwrap();
        let now = Instant::now();

        assert_eq!(
            state.current_endpoint(CoTSendMethod::Any, false, now),
            Some(ContactEndpointType::Datagram)
        );
        assert_eq!(
            state.current_endpoint(CoTSendMethod::Any, true, now),
            Some(ContactEndpointType::Streaming)
        );
        assert_eq!(
            state.current_endpoint(CoTSendMethod::TakServer, false, now),
            Some(ContactEndpointType::Streaming)
        );

        if let Some(dg) = state.datagram.as_mut() {
            dg.set_last_rx(ago(61));
        }
        assert_eq!(
            state.current_endpoint(CoTSendMethod::Any, false, now),
            Some(ContactEndpointType::Streaming)
        );
        assert_eq!(
            state.current_endpoint(CoTSendMethod::PointToPoint, false, now),
            Some(ContactEndpointType::Datagram)
        );
    }

    #[test]
    fn test_fresher_mesh_endpoint_wins() {
        let mut state = ContactState::new(false);
        state.update_endpoint(ContactEndpointType::Datagram, "10.0.0.1", 0).unwrap();
        state.update_endpoint(ContactEndpointType::Tcp, "10.0.0.1", 4242).unwrap();
        let now = Instant::now();
        if let Some(dg) = state.datagram.as_mut() {
            dg.set_last_rx(ago(5));
        }
        assert_eq!(state.current_endpoint(CoTSendMethod::Any, false, now), Some(ContactEndpointType::Tcp));
        if let Some(tcp) = state.tcp.as_mut() {
            tcp.set_last_rx(ago(10));
        }
        assert_eq!(
            state.current_endpoint(CoTSendMethod::Any, false, now),
            Some(ContactEndpointType::Datagram)
        );
    }

    #[test]
    fn test_broadcast_version_intersection() {
        let now = Instant::now();
        let mk = |min, max| {
            let mut s = ContactState::new(false);
            s.mesh_expire = Some(now + PROTOINF_TIMEOUT);
            s.proto_inf_valid = true;
            s.proto_inf_expire = Some(now + PROTOINF_TIMEOUT);
            s.proto_inf = TakProtoInfo::new(min, max);
            s
        };
        let mut disjoint = [mk(1, 1), mk(1, 2), mk(2, 2)];
        assert_eq!(compute_broadcast_version(disjoint.iter_mut(), now), LEGACY_PROTO);

        let mut all_v1 = [mk(1, 1), mk(1, 1)];
        assert_eq!(compute_broadcast_version(all_v1.iter_mut(), now), 1);

        let mut legacy = [mk(1, 1), mk(0, 0)];
        assert_eq!(compute_broadcast_version(legacy.iter_mut(), now), LEGACY_PROTO);

        // stale mesh endpoints do not vote
        let mut stale = mk(0, 0);
        stale.mesh_expire = None;
        let mut with_stale = [mk(1, 1), stale];
        assert_eq!(compute_broadcast_version(with_stale.iter_mut(), now), 1);
    }

    #[test]
    fn test_expired_proto_info_reverts() {
        let now = Instant::now();
        let mut s = ContactState::new(false);
        s.mesh_expire = Some(now + PROTOINF_TIMEOUT);
        s.proto_inf_valid = true;
        s.proto_inf_expire = Some(now);
        s.proto_inf = TakProtoInfo::new(1, 1);
        s.last_mesh_proto = LEGACY_PROTO;
        let mut contacts = [s];
        assert_eq!(compute_broadcast_version(contacts.iter_mut(), now), LEGACY_PROTO);
        assert!(!contacts[0].proto_inf_valid);
    }

    #[test]
    fn test_stream_batching_and_removal() {
        let fake = Arc::new(FakeTransport::default());
        let cm = manager(&fake);
        for (uid, cs) in [("S1", "ONE"), ("S2", "TWO")] {
            cm.streaming_message_received("ssl:tak:8089", &sa(uid, cs, "*:-1:stcp"));
        }
        let dests = [ContactUid::from("S1"), ContactUid::from("S2"), ContactUid::from("nobody")];
        match cm.send_cot(&dests, &sa("me", "ME", "10.0.0.1:4242:tcp"), CoTSendMethod::Any) {
            Err(CommoError::ContactGone(gone)) => assert_eq!(gone, vec![ContactUid::from("nobody")]),
            other => panic!("unexpected {other:?}"),
        }
        {
            let streams = fake.streams.lock();
            assert_eq!(streams.len(), 1);
            assert_eq!(streams[0].0, "ssl:tak:8089");
            assert_eq!(streams[0].1.endpoint_type(), EndpointType::Streaming);
        }
        assert!(cm.has_streaming_endpoint(&ContactUid::from("S1")));
        assert_eq!(
            cm.get_stream_endpoint_identifier(&ContactUid::from("S1"), true).unwrap(),
            "ssl:tak:8089"
        );

        cm.remove_stream("ssl:tak:8089");
        assert!(cm.get_all_contacts().is_empty());
    }

    #[test]
    fn test_failed_stream_reports_all_recipients() {
        let fake = Arc::new(FakeTransport {
            fail_streams: true,
            ..Default::default()
        });
        let cm = manager(&fake);
        cm.streaming_message_received("ssl:tak:8089", &sa("S1", "ONE", "*:-1:stcp"));
        cm.streaming_message_received("ssl:tak:8089", &sa("S2", "TWO", "*:-1:stcp"));
        let dests = [ContactUid::from("S1"), ContactUid::from("S2")];
        match cm.send_cot(&dests, &sa("me", "ME", ""), CoTSendMethod::TakServer) {
            Err(CommoError::ContactGone(gone)) => assert_eq!(gone.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_remove_stream_keeps_mesh_contacts() {
        let fake = Arc::new(FakeTransport::default());
        let cm = manager(&fake);
        let uid = ContactUid::from("M1");
        let msg = TakMessage::parse_xml(&sa("M1", "MESH", "10.0.0.7:4242:udp").serialize()).unwrap();
        cm.datagram_received("*:6969:udp", None, &msg);
        cm.streaming_message_received("ssl:tak:8089", &sa("M1", "MESH", "*:-1:stcp"));
        assert!(cm.has_streaming_endpoint(&uid));
        cm.remove_stream("ssl:tak:8089");
        assert!(cm.has_contact(&uid));
        assert!(!cm.has_streaming_endpoint(&uid));
    }

    #[test]
    fn test_initial_version_announced() {
        let fake = Arc::new(FakeTransport::default());
        let cm = manager(&fake);
        assert_eq!(fake.versions.lock().first(), Some(&SELF_MAX_PROTO));
        assert_eq!(cm.broadcast_proto_version(), SELF_MAX_PROTO);
    }
}

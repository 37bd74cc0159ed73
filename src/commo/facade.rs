//! The `Commo` facade.
//!
//! Owns every transport manager, wires them together on construction and
//! takes them apart again, top of the stack first, on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "mission-package")]
use std::path::Path;
#[cfg(feature = "mission-package")]
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::config::{CommoConfig, validate_ttl};
use super::listeners::CoTListenerManagement;
use crate::contact::ContactManager;
use crate::core::constants::{LEGACY_PROTO, MAX_DATAGRAM_SIZE, MIN_TCP_CONN_TIMEOUT};
use crate::core::{
    CoTMessageListener, CoTMessageType, CoTSendFailureListener, CoTSendMethod, CommoError,
    ContactPresenceListener, ContactUid, DatagramListener, EndpointType, GenericDataListener,
    InterfaceStatusListener, Result, StreamSender, StreamingMessageListener, TcpMessageListener,
    TcpSender,
};
use crate::cot::{self, CoTMessage};
use crate::crypto::MeshCrypto;
use crate::datagram::DatagramSocketManagement;
use crate::net::{
    HwIfListener, HwIfScanner, PhysicalNetInterface, StreamingNetInterface, TcpInboundNetInterface,
};
use crate::streaming::{StreamAuth, StreamingSocketManagement, TlsCredentials};
use crate::tcp::TcpSocketManagement;

#[cfg(feature = "mission-package")]
use crate::fileio::{SimpleFileIO, SimpleFileIOManager};
#[cfg(feature = "mission-package")]
use crate::http::{HttpEngine, HttpsProxy, ReqwestEngine};
#[cfg(feature = "mission-package")]
use crate::missionpkg::{MPTransferSettings, MissionPackageIO, MissionPackageManager, SendFileInit};

/// Recipient that makes a TAK server store a message instead of routing it.
const SERVER_CONTROL_CALLSIGN: &str = "ffffffff-ffff-ffff-ffff-ffffffffffff";

/// Feeds direct TCP traffic into the contact list.
struct ContactTcpFeed(Arc<ContactManager>);

impl TcpMessageListener for ContactTcpFeed {
    fn tcp_message_received(&self, _endpoint_id: &str, sender: Option<SocketAddr>, msg: &CoTMessage) {
        self.0.tcp_message_received(sender, msg);
    }
}

#[cfg(feature = "mission-package")]
struct MissionServices {
    proxy: HttpsProxy,
    mp: Arc<MissionPackageManager>,
}

struct FacadeState {
    callsign: String,
    #[cfg(feature = "mission-package")]
    mp_settings: MPTransferSettings,
}

struct Core {
    our_uid: ContactUid,
    state: Mutex<FacadeState>,
    scanner: Arc<HwIfScanner>,
    datagram: Arc<DatagramSocketManagement>,
    tcp: Arc<TcpSocketManagement>,
    streams: Arc<StreamingSocketManagement>,
    contacts: Arc<ContactManager>,
    contacts_tcp: Arc<dyn TcpMessageListener>,
    listeners: Arc<CoTListenerManagement>,
    #[cfg(feature = "mission-package")]
    mission: OnceLock<MissionServices>,
    #[cfg(feature = "mission-package")]
    simple_io: OnceLock<SimpleFileIOManager>,
}

impl Core {
    fn new(our_uid: ContactUid, callsign: &str) -> Result<Self> {
        let scanner = Arc::new(HwIfScanner::new()?);
        let datagram = Arc::new(DatagramSocketManagement::new(our_uid.clone(), Arc::clone(&scanner))?);
        let tcp = Arc::new(TcpSocketManagement::new(our_uid.clone())?);
        let streams = Arc::new(StreamingSocketManagement::new(our_uid.clone())?);
        let contacts = Arc::new(ContactManager::new(datagram.clone(), tcp.clone(), streams.clone())?);
        let contacts_tcp: Arc<dyn TcpMessageListener> = Arc::new(ContactTcpFeed(Arc::clone(&contacts)));
        let listeners = Arc::new(CoTListenerManagement::new()?);

        let core = Self {
            our_uid,
            state: Mutex::new(FacadeState {
                callsign: callsign.to_string(),
                #[cfg(feature = "mission-package")]
                mp_settings: MPTransferSettings::default(),
            }),
            scanner,
            datagram,
            tcp,
            streams,
            contacts,
            contacts_tcp,
            listeners,
            #[cfg(feature = "mission-package")]
            mission: OnceLock::new(),
            #[cfg(feature = "mission-package")]
            simple_io: OnceLock::new(),
        };
        core.wire()?;
        Ok(core)
    }

    fn wire(&self) -> Result<()> {
        self.scanner.add_listener(self.datagram.clone())?;

        self.datagram.add_datagram_receiver(self.contacts.clone())?;
        self.tcp.add_message_receiver(Arc::clone(&self.contacts_tcp))?;
        self.streams.add_streaming_message_listener(self.contacts.clone())?;
        self.streams.add_interface_status_listener(self.contacts.clone())?;

        self.datagram.add_datagram_receiver(self.listeners.clone())?;
        self.tcp.add_message_receiver(self.listeners.clone())?;
        self.streams.add_streaming_message_listener(self.listeners.clone())?;
        self.datagram.add_interface_status_listener(self.listeners.clone())?;
        self.tcp.add_interface_status_listener(self.listeners.clone())?;
        self.streams.add_interface_status_listener(self.listeners.clone())?;
        Ok(())
    }

    /// Undo the wiring, then drop the managers top of stack first.
    fn teardown(self) {
        #[cfg(feature = "mission-package")]
        if let Some(mission) = self.mission.get() {
            let as_stream: Arc<dyn StreamingMessageListener> = mission.mp.clone();
            let as_datagram: Arc<dyn DatagramListener> = mission.mp.clone();
            let as_tcp: Arc<dyn TcpMessageListener> = mission.mp.clone();
            let _ = self.streams.remove_streaming_message_listener(&as_stream);
            let _ = self.datagram.remove_datagram_receiver(&as_datagram);
            let _ = self.tcp.remove_message_receiver(&as_tcp);
        }

        let iface: Arc<dyn InterfaceStatusListener> = self.listeners.clone();
        let _ = self.datagram.remove_interface_status_listener(&iface);
        let _ = self.tcp.remove_interface_status_listener(&iface);
        let _ = self.streams.remove_interface_status_listener(&iface);
        let as_datagram: Arc<dyn DatagramListener> = self.listeners.clone();
        let as_tcp: Arc<dyn TcpMessageListener> = self.listeners.clone();
        let as_stream: Arc<dyn StreamingMessageListener> = self.listeners.clone();
        let _ = self.datagram.remove_datagram_receiver(&as_datagram);
        let _ = self.tcp.remove_message_receiver(&as_tcp);
        let _ = self.streams.remove_streaming_message_listener(&as_stream);

        let contact_iface: Arc<dyn InterfaceStatusListener> = self.contacts.clone();
        let contact_stream: Arc<dyn StreamingMessageListener> = self.contacts.clone();
        let contact_datagram: Arc<dyn DatagramListener> = self.contacts.clone();
        let _ = self.streams.remove_interface_status_listener(&contact_iface);
        let _ = self.streams.remove_streaming_message_listener(&contact_stream);
        let _ = self.tcp.remove_message_receiver(&self.contacts_tcp);
        let _ = self.datagram.remove_datagram_receiver(&contact_datagram);

        let hw: Arc<dyn HwIfListener> = self.datagram.clone();
        let _ = self.scanner.remove_listener(&hw);

        let Core {
            listeners,
            #[cfg(feature = "mission-package")]
            simple_io,
            #[cfg(feature = "mission-package")]
            mission,
            contacts_tcp,
            contacts,
            datagram,
            tcp,
            streams,
            scanner,
            ..
        } = self;
        drop(listeners);
        #[cfg(feature = "mission-package")]
        {
            drop(simple_io);
            drop(mission);
        }
        drop(contacts_tcp);
        drop(contacts);
        drop(datagram);
        drop(tcp);
        drop(streams);
        drop(scanner);
    }

    #[cfg(feature = "mission-package")]
    fn mission(&self) -> Result<&MissionServices> {
        self.mission
            .get()
            .ok_or_else(|| CommoError::invalid("mission package IO has not been set up"))
    }

    #[cfg(feature = "mission-package")]
    fn simple_io(&self) -> Result<&SimpleFileIOManager> {
        self.simple_io
            .get()
            .ok_or_else(|| CommoError::invalid("simple file IO has not been enabled"))
    }

    fn send_to_server(&self, stream: Option<&str>, msg: &CoTMessage) -> Result<()> {
        match stream {
            Some(id) => self.streams.send_message(id, msg),
            None => self.streams.send_broadcast(msg, true),
        }
    }
}

/// Parse client-supplied CoT, enforcing the datagram size limit.
fn parse_cot(cot_xml: &str) -> Result<CoTMessage> {
    if cot_xml.len() > MAX_DATAGRAM_SIZE {
        return Err(CommoError::invalid(format!(
            "CoT message of {} bytes exceeds {MAX_DATAGRAM_SIZE}",
            cot_xml.len()
        )));
    }
    CoTMessage::parse(cot_xml.as_bytes()).map_err(|e| CommoError::invalid(e.to_string()))
}

/// Entry point of the messaging core.
///
/// Creating a `Commo` starts the interface scanner and the datagram, TCP,
/// streaming, contact and listener managers. Interfaces and listeners are
/// then added through the methods below; received traffic is reported on
/// the listeners' own threads.
///
/// Every call made after [`Commo::shutdown`] fails with
/// [`CommoError::InvalidArgument`].
pub struct Commo {
    core: Option<Core>,
}

impl Commo {
    /// Start the messaging core for the local contact `our_uid`.
    pub fn new(our_uid: ContactUid, callsign: &str) -> Result<Self> {
        if our_uid.is_empty() {
            return Err(CommoError::invalid("empty contact uid"));
        }
        let core = Core::new(our_uid, callsign)?;
        info!(uid = %core.our_uid, callsign, "commo started");
        Ok(Self { core: Some(core) })
    }

    /// Start the messaging core and apply `config`.
    pub fn with_config(our_uid: ContactUid, callsign: &str, config: &CommoConfig) -> Result<Self> {
        config.validate()?;
        let commo = Self::new(our_uid, callsign)?;
        commo.apply_config(config)?;
        Ok(commo)
    }

    fn core(&self) -> Result<&Core> {
        self.core
            .as_ref()
            .ok_or_else(|| CommoError::invalid("commo has been shut down"))
    }

    /// Apply every transport-wide setting in `config`.
    ///
    /// Nothing is changed unless the whole configuration is valid.
    pub fn apply_config(&self, config: &CommoConfig) -> Result<()> {
        config.validate()?;
        let core = self.core()?;
        if let Some(cs) = &config.callsign {
            self.set_callsign(cs)?;
        }
        core.contacts.set_prefer_stream_endpoint(config.prefer_stream_endpoint);
        core.datagram.set_advertise_endpoint_as_udp(config.advertise_endpoint_as_udp);
        core.datagram.set_enable_address_reuse(config.enable_address_reuse);
        core.datagram.set_multicast_loopback_enabled(config.multicast_loopback);
        core.datagram.set_ttl(config.ttl);
        core.datagram.set_rx_timeout(config.udp_no_data_timeout);
        self.set_tcp_conn_timeout(config.tcp_conn_timeout)?;
        core.streams.set_monitor(config.stream_monitor);
        Ok(())
    }

    /// Stop every manager and release all interfaces.
    ///
    /// Safe to call more than once; also run on drop.
    pub fn shutdown(&mut self) {
        if let Some(core) = self.core.take() {
            info!(uid = %core.our_uid, "commo shutting down");
            core.teardown();
        }
    }

    // =========================================================================
    // Identity and tuning
    // =========================================================================

    /// Change the callsign used in mission package traffic.
    pub fn set_callsign(&self, callsign: &str) -> Result<()> {
        let core = self.core()?;
        let mut state = core.state.lock();
        state.callsign = callsign.to_string();
        #[cfg(feature = "mission-package")]
        if let Some(mission) = core.mission.get() {
            mission.mp.set_callsign(callsign);
        }
        Ok(())
    }

    /// Prefer server streams over equally fresh mesh endpoints when sending.
    pub fn set_prefer_stream_endpoint(&self, prefer: bool) -> Result<()> {
        self.core()?.contacts.set_prefer_stream_endpoint(prefer);
        Ok(())
    }

    /// Advertise our endpoint as UDP rather than TCP in outgoing CoT.
    pub fn set_advertise_endpoint_as_udp(&self, enabled: bool) -> Result<()> {
        self.core()?.datagram.set_advertise_endpoint_as_udp(enabled);
        Ok(())
    }

    /// Encrypt mesh traffic with the given key pair, or pass `None` for both
    /// to send in the clear. The two keys must differ.
    pub fn set_crypto_keys(&self, auth_key: Option<&[u8]>, crypto_key: Option<&[u8]>) -> Result<()> {
        let core = self.core()?;
        let crypto = match (auth_key, crypto_key) {
            (None, None) => None,
            (Some(auth), Some(key)) => {
                if auth == key {
                    return Err(CommoError::invalid("auth and crypto keys must differ"));
                }
                Some(MeshCrypto::new(auth, key).map_err(|e| CommoError::invalid(e.to_string()))?)
            }
            _ => return Err(CommoError::invalid("both or neither key must be given")),
        };
        info!(enabled = crypto.is_some(), "mesh encryption changed");
        core.datagram.set_crypto(crypto.clone());
        core.tcp.set_crypto(crypto);
        Ok(())
    }

    /// Set `SO_REUSEADDR` on datagram receive sockets.
    pub fn set_enable_address_reuse(&self, enabled: bool) -> Result<()> {
        self.core()?.datagram.set_enable_address_reuse(enabled);
        Ok(())
    }

    /// Loop outbound multicast back to local receivers.
    pub fn set_multicast_loopback_enabled(&self, enabled: bool) -> Result<()> {
        self.core()?.datagram.set_multicast_loopback_enabled(enabled);
        Ok(())
    }

    /// Multicast TTL, 1 to 255.
    pub fn set_ttl(&self, ttl: u32) -> Result<()> {
        let core = self.core()?;
        validate_ttl(ttl)?;
        core.datagram.set_ttl(ttl);
        Ok(())
    }

    /// Rebuild inbound datagram sockets that hear nothing for `timeout`.
    ///
    /// `None` restores the default; zero disables the check.
    pub fn set_udp_no_data_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.core()?.datagram.set_rx_timeout(timeout);
        Ok(())
    }

    /// Connect timeout for direct TCP sends and server streams.
    ///
    /// Values below two seconds are raised to two seconds.
    pub fn set_tcp_conn_timeout(&self, timeout: Duration) -> Result<()> {
        let core = self.core()?;
        let timeout = timeout.max(MIN_TCP_CONN_TIMEOUT);
        core.tcp.set_conn_timeout(timeout)?;
        core.streams.set_conn_timeout(timeout);
        Ok(())
    }

    /// Ping idle server streams and reconnect silent ones.
    pub fn set_stream_monitor_enabled(&self, enabled: bool) -> Result<()> {
        self.core()?.streams.set_monitor(enabled);
        Ok(())
    }

    /// TAK protocol version currently used for mesh broadcasts.
    pub fn broadcast_proto(&self) -> Result<u32> {
        Ok(self.core()?.contacts.broadcast_proto_version())
    }

    // =========================================================================
    // Interfaces
    // =========================================================================

    /// Broadcast CoT of the given types to multicast `addr:port` from the
    /// named hardware interface.
    pub fn add_broadcast_interface(
        &self,
        iface_name: &str,
        types: &[CoTMessageType],
        mcast_addr: &str,
        port: u16,
    ) -> Result<PhysicalNetInterface> {
        self.core()?
            .datagram
            .add_broadcast_interface(Some(iface_name), types, mcast_addr, port)
    }

    /// Broadcast CoT of the given types to unicast `addr:port`.
    pub fn add_unicast_broadcast_interface(
        &self,
        types: &[CoTMessageType],
        addr: &str,
        port: u16,
    ) -> Result<PhysicalNetInterface> {
        self.core()?.datagram.add_broadcast_interface(None, types, addr, port)
    }

    /// Stop a broadcast destination.
    pub fn remove_broadcast_interface(&self, iface: &PhysicalNetInterface) -> Result<()> {
        self.core()?.datagram.remove_broadcast_interface(iface)
    }

    /// Listen for datagrams on `port` of the named interface.
    ///
    /// `generic` ports deliver raw payloads to [`GenericDataListener`]s.
    pub fn add_inbound_interface(
        &self,
        iface_name: &str,
        port: u16,
        mcast_addrs: &[&str],
        generic: bool,
    ) -> Result<PhysicalNetInterface> {
        self.core()?
            .datagram
            .add_inbound_interface(iface_name, port, mcast_addrs, generic)
    }

    /// Stop listening on a datagram interface.
    pub fn remove_inbound_interface(&self, iface: &PhysicalNetInterface) -> Result<()> {
        self.core()?.datagram.remove_inbound_interface(iface)
    }

    /// Accept direct TCP CoT on `port`.
    pub fn add_tcp_inbound_interface(&self, port: u16) -> Result<TcpInboundNetInterface> {
        self.core()?.tcp.add_inbound_interface(port)
    }

    /// Stop accepting direct TCP CoT on an interface.
    pub fn remove_tcp_inbound_interface(&self, iface: &TcpInboundNetInterface) -> Result<()> {
        self.core()?.tcp.remove_inbound_interface(iface)
    }

    /// Connect to a TAK server.
    ///
    /// With `tls` the connection is TLS, presenting the client certificate
    /// and trusting only the given CAs. `auth` is only sent over TLS.
    pub fn add_streaming_interface(
        &self,
        host: &str,
        port: u16,
        types: &[CoTMessageType],
        tls: Option<TlsCredentials>,
        auth: Option<StreamAuth>,
    ) -> Result<StreamingNetInterface> {
        self.core()?
            .streams
            .add_streaming_interface(host, port, types, tls, auth)
    }

    /// Disconnect from a TAK server and forget contacts reached through it.
    pub fn remove_streaming_interface(&self, iface: &StreamingNetInterface) -> Result<()> {
        let core = self.core()?;
        core.streams.remove_streaming_interface(iface)?;
        core.contacts.remove_stream(&iface.remote_endpoint_id);
        Ok(())
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Register an interface status listener.
    pub fn add_interface_status_listener(&self, listener: Arc<dyn InterfaceStatusListener>) -> Result<()> {
        self.core()?.listeners.add_interface_status_listener(listener)
    }

    /// Remove an interface status listener.
    pub fn remove_interface_status_listener(
        &self,
        listener: &Arc<dyn InterfaceStatusListener>,
    ) -> Result<()> {
        self.core()?.listeners.remove_interface_status_listener(listener)
    }

    /// Register a listener for received CoT.
    pub fn add_cot_message_listener(&self, listener: Arc<dyn CoTMessageListener>) -> Result<()> {
        self.core()?.listeners.add_cot_message_listener(listener)
    }

    /// Remove a CoT listener.
    pub fn remove_cot_message_listener(&self, listener: &Arc<dyn CoTMessageListener>) -> Result<()> {
        self.core()?.listeners.remove_cot_message_listener(listener)
    }

    /// Register a listener for data received on generic inbound interfaces.
    pub fn add_generic_data_listener(&self, listener: Arc<dyn GenericDataListener>) -> Result<()> {
        self.core()?.listeners.add_generic_data_listener(listener)
    }

    /// Remove a generic data listener.
    pub fn remove_generic_data_listener(&self, listener: &Arc<dyn GenericDataListener>) -> Result<()> {
        self.core()?.listeners.remove_generic_data_listener(listener)
    }

    /// Register a listener for failed direct TCP sends.
    pub fn add_cot_send_failure_listener(&self, listener: Arc<dyn CoTSendFailureListener>) -> Result<()> {
        self.core()?.tcp.add_send_failure_listener(listener)
    }

    /// Remove a send failure listener.
    pub fn remove_cot_send_failure_listener(
        &self,
        listener: &Arc<dyn CoTSendFailureListener>,
    ) -> Result<()> {
        self.core()?.tcp.remove_send_failure_listener(listener)
    }

    /// Register a listener for contacts appearing and disappearing.
    pub fn add_contact_presence_listener(&self, listener: Arc<dyn ContactPresenceListener>) -> Result<()> {
        self.core()?.contacts.add_contact_presence_listener(listener)
    }

    /// Remove a presence listener.
    pub fn remove_contact_presence_listener(
        &self,
        listener: &Arc<dyn ContactPresenceListener>,
    ) -> Result<()> {
        self.core()?.contacts.remove_contact_presence_listener(listener)
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Send CoT to specific contacts.
    ///
    /// Fails with [`CommoError::ContactGone`] listing the destinations that
    /// could not be reached; the rest were sent to.
    pub fn send_cot(&self, destinations: &[ContactUid], cot_xml: &str, method: CoTSendMethod) -> Result<()> {
        let core = self.core()?;
        let msg = parse_cot(cot_xml)?;
        core.contacts.send_cot(destinations, &msg, method)
    }

    /// Send CoT to every broadcast interface and/or every server stream
    /// carrying its message type.
    pub fn broadcast_cot(&self, cot_xml: &str, method: CoTSendMethod) -> Result<()> {
        let core = self.core()?;
        let mut msg = parse_cot(cot_xml)?;
        if method.allows_mesh() {
            core.datagram.send_multicast(&msg);
        }
        if method.allows_streaming() {
            msg.set_endpoint(EndpointType::Streaming, "");
            msg.set_tak_server_recipients(&[]);
            core.streams.send_broadcast(&msg, false)?;
        }
        Ok(())
    }

    /// Send CoT over a one-shot TCP connection to `host:port`.
    ///
    /// Failures are reported to [`CoTSendFailureListener`]s.
    pub fn send_cot_tcp_direct(&self, host: &str, port: u16, cot_xml: &str) -> Result<()> {
        let core = self.core()?;
        let msg = parse_cot(cot_xml)?;
        core.tcp.send_message(host, port, &msg, LEGACY_PROTO)
    }

    /// Send CoT for the server itself rather than its users.
    ///
    /// Goes to `stream`, or to every connected server when `None`.
    pub fn send_cot_server_control(&self, stream: Option<&str>, cot_xml: &str) -> Result<()> {
        let core = self.core()?;
        let mut msg = parse_cot(cot_xml)?;
        msg.set_endpoint(EndpointType::Streaming, "");
        msg.set_tak_server_recipients(&[SERVER_CONTROL_CALLSIGN.to_string()]);
        core.send_to_server(stream, &msg)
    }

    /// Send CoT to the subscribers of a server mission.
    ///
    /// Goes to `stream`, or to every connected server when `None`.
    pub fn send_cot_to_server_mission_dest(
        &self,
        stream: Option<&str>,
        mission: &str,
        cot_xml: &str,
    ) -> Result<()> {
        let core = self.core()?;
        let mut msg = parse_cot(cot_xml)?;
        msg.set_endpoint(EndpointType::Streaming, "");
        msg.set_tak_server_mission_recipient(mission);
        core.send_to_server(stream, &msg)
    }

    // =========================================================================
    // Contacts
    // =========================================================================

    /// Every contact currently known.
    pub fn contact_list(&self) -> Result<Vec<ContactUid>> {
        Ok(self.core()?.contacts.get_all_contacts())
    }

    /// Create, update or, with neither `callsign` nor `host`, delete a
    /// contact reachable at a fixed UDP address.
    pub fn config_known_endpoint_contact(
        &self,
        uid: &ContactUid,
        callsign: Option<&str>,
        host: Option<&str>,
        port: u16,
    ) -> Result<()> {
        self.core()?
            .contacts
            .config_known_endpoint_contact(uid, callsign, host, port)
    }

    // =========================================================================
    // Conversions
    // =========================================================================

    /// Encode CoT XML as a TAK protocol mesh message of `version`.
    pub fn cot_xml_to_takproto(cot_xml: &str, version: u32) -> Result<Vec<u8>> {
        cot::cot_xml_to_takproto(cot_xml, version)
    }

    /// Decode a TAK protocol mesh message back to CoT XML.
    pub fn takproto_to_cot_xml(data: &[u8]) -> Result<String> {
        cot::takproto_to_cot_xml(data)
    }
}

#[cfg(feature = "certgen")]
#[cfg_attr(docsrs, doc(cfg(feature = "certgen")))]
impl Commo {
    /// New PEM private key of `key_bits` (256 or 384).
    pub fn generate_key_crypto_string(key_bits: u32) -> Result<String> {
        crate::crypto::certgen::generate_key_pem(key_bits)
    }

    /// PEM certificate signing request for `key_pem` with the given
    /// distinguished name entries.
    pub fn generate_csr_crypto_string(dn_entries: &[(String, String)], key_pem: &str) -> Result<String> {
        crate::crypto::certgen::generate_csr_pem(dn_entries, key_pem)
    }

    /// Self-signed certificate and key for the local https server, as
    /// `(certificate_pem, key_pem)`.
    pub fn generate_self_signed_cert(common_name: &str) -> Result<(String, String)> {
        crate::crypto::certgen::generate_self_signed_cert(common_name)
    }
}

#[cfg(feature = "mission-package")]
#[cfg_attr(docsrs, doc(cfg(feature = "mission-package")))]
impl Commo {
    /// Enable mission package transfers, reporting to `io`.
    ///
    /// Can only be done once.
    pub fn setup_mission_package_io(&self, io: Arc<dyn MissionPackageIO>) -> Result<()> {
        let core = self.core()?;
        let state = core.state.lock();
        if core.mission.get().is_some() {
            return Err(CommoError::invalid("mission package IO already set up"));
        }

        let http: Arc<dyn HttpEngine> = Arc::new(ReqwestEngine::new()?);
        let mp = Arc::new(MissionPackageManager::new(
            core.our_uid.clone(),
            &state.callsign,
            io,
            http,
            Arc::clone(&core.contacts),
            Arc::clone(&core.streams),
            Arc::clone(&core.scanner),
        )?);
        let settings = state.mp_settings.clone();
        let conn_timeout = Duration::from_secs(settings.conn_timeout_secs());
        mp.update_settings(|s| {
            *s = settings;
            Ok(())
        })?;
        let proxy = HttpsProxy::new()?;
        proxy.set_conn_timeout(conn_timeout);

        core.streams.add_streaming_message_listener(mp.clone())?;
        core.datagram.add_datagram_receiver(mp.clone())?;
        core.tcp.add_message_receiver(mp.clone())?;
        if core.mission.set(MissionServices { proxy, mp }).is_err() {
            return Err(CommoError::invalid("mission package IO already set up"));
        }
        info!("mission package IO enabled");
        Ok(())
    }

    /// Enable client-requested uploads and downloads, reporting to `io`.
    ///
    /// Can only be done once.
    pub fn enable_simple_file_io(&self, io: Arc<dyn SimpleFileIO>) -> Result<()> {
        let core = self.core()?;
        let _state = core.state.lock();
        if core.simple_io.get().is_some() {
            return Err(CommoError::invalid("simple file IO already enabled"));
        }
        let http: Arc<dyn HttpEngine> = Arc::new(ReqwestEngine::new()?);
        let manager = SimpleFileIOManager::new(io, http)?;
        if core.simple_io.set(manager).is_err() {
            return Err(CommoError::invalid("simple file IO already enabled"));
        }
        info!("simple file IO enabled");
        Ok(())
    }

    fn update_mp_settings(&self, f: impl FnOnce(&mut MPTransferSettings) -> Result<()>) -> Result<()> {
        let core = self.core()?;
        let mut state = core.state.lock();
        f(&mut state.mp_settings)?;
        if let Some(mission) = core.mission.get() {
            let settings = state.mp_settings.clone();
            let conn_timeout = Duration::from_secs(settings.conn_timeout_secs());
            mission.mp.update_settings(|s| {
                *s = settings;
                Ok(())
            })?;
            mission.proxy.set_conn_timeout(conn_timeout);
        }
        Ok(())
    }

    /// Serve outgoing packages over http on `port`; 0 disables local serving.
    pub fn set_mission_package_local_port(&self, port: u16) -> Result<()> {
        let mission = self.core()?.mission()?;
        mission.mp.set_local_port(port)?;
        mission.proxy.set_local_http_port(port);
        Ok(())
    }

    /// Serve outgoing packages over https on `port` with the given PEM
    /// certificate and key; port 0 disables https serving.
    ///
    /// On failure https serving is disabled.
    pub fn set_mission_package_local_https_params(
        &self,
        port: u16,
        cert_pem: Option<&str>,
        key_pem: Option<&str>,
    ) -> Result<()> {
        let mission = self.core()?.mission()?;
        match mission.proxy.set_server_params(port, cert_pem, key_pem) {
            Ok(()) => {
                mission.mp.set_local_https_port(port);
                Ok(())
            }
            Err(e) => {
                warn!(port, error = %e, "local https serving disabled");
                mission.mp.set_local_https_port(0);
                Err(e)
            }
        }
    }

    /// Allow or forbid sending packages through TAK servers.
    pub fn set_mission_package_via_server_enabled(&self, enabled: bool) -> Result<()> {
        self.update_mp_settings(|s| {
            s.set_server_transfer_enabled(enabled);
            Ok(())
        })
    }

    /// TAK server http port used for uploads.
    pub fn set_mission_package_http_port(&self, port: u16) -> Result<()> {
        self.update_mp_settings(|s| s.set_http_port(port))
    }

    /// TAK server https port used for uploads.
    pub fn set_mission_package_https_port(&self, port: u16) -> Result<()> {
        self.update_mp_settings(|s| s.set_https_port(port))
    }

    /// Download attempts before a receive is abandoned.
    pub fn set_mission_package_num_tries(&self, tries: u32) -> Result<()> {
        self.update_mp_settings(|s| s.set_num_tries(tries))
    }

    /// Connect timeout of transfers, in seconds.
    pub fn set_mission_package_conn_timeout(&self, secs: u64) -> Result<()> {
        self.update_mp_settings(|s| s.set_conn_timeout_secs(secs))
    }

    /// Transfer timeout, in seconds.
    pub fn set_mission_package_transfer_timeout(&self, secs: u64) -> Result<()> {
        self.update_mp_settings(|s| s.set_xfer_timeout_secs(secs))
    }

    /// Prepare sending `file` to contacts. Start it with
    /// [`Commo::send_mission_package_start`].
    pub fn send_mission_package_init(
        &self,
        destinations: &[ContactUid],
        file: &Path,
        filename: &str,
        transfer_name: &str,
    ) -> Result<SendFileInit> {
        self.core()?
            .mission()?
            .mp
            .send_file_init(destinations, file, filename, transfer_name)
    }

    /// Prepare uploading `file` to the server behind `stream` only.
    pub fn send_mission_package_to_server_init(&self, stream: &str, file: &Path, filename: &str) -> Result<u32> {
        self.core()?.mission()?.mp.upload_file_init(stream, file, filename)
    }

    /// Start a prepared mission package transfer.
    pub fn send_mission_package_start(&self, xfer_id: u32) -> Result<()> {
        self.core()?.mission()?.mp.send_file_start(xfer_id)
    }

    /// Prepare an upload of `local_file` to, or a download of it from,
    /// `remote_uri`. Start it with [`Commo::simple_file_transfer_start`].
    pub fn simple_file_transfer_init(
        &self,
        for_upload: bool,
        remote_uri: &str,
        ca_cert_pem: Option<&str>,
        user: Option<&str>,
        password: Option<&str>,
        local_file: &Path,
    ) -> Result<u32> {
        self.core()?.simple_io()?.simple_file_transfer_init(
            for_upload,
            remote_uri,
            ca_cert_pem,
            user,
            password,
            local_file,
        )
    }

    /// Start a prepared simple file transfer.
    pub fn simple_file_transfer_start(&self, xfer_id: u32) -> Result<()> {
        self.core()?.simple_io()?.simple_file_transfer_start(xfer_id)
    }
}

impl Drop for Commo {
    fn drop(&mut self) {
        self.shutdown();
        debug!("commo dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    const XML: &str = r#"<event version="2.0" uid="ANDROID-7" type="a-f-G-U-C" how="m-g" time="2024-01-01T00:00:00Z" start="2024-01-01T00:00:00Z" stale="2024-01-01T00:01:00Z"><point lat="1" lon="2" hae="3" ce="4" le="5"/><detail><contact callsign="SEVEN" endpoint="10.0.0.7:4242:tcp"/></detail></event>"#;

    fn commo() -> Commo {
        Commo::new(ContactUid::from("SELF-UID"), "SELF").unwrap()
    }

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        done()
    }

    struct CoTSink(Mutex<mpsc::Sender<(String, Option<String>)>>);

    impl CoTMessageListener for CoTSink {
        fn cot_message_received(&self, cot_xml: &str, rx_endpoint_id: Option<&str>) {
            let _ = self
                .0
                .lock()
                .send((cot_xml.to_string(), rx_endpoint_id.map(str::to_string)));
        }
    }

    #[derive(Default)]
    struct Presence(Mutex<Vec<ContactUid>>);

    impl ContactPresenceListener for Presence {
        fn contact_added(&self, contact: &ContactUid) {
            self.0.lock().push(contact.clone());
        }

        fn contact_removed(&self, _contact: &ContactUid) {}
    }

    #[test]
    fn test_empty_uid_rejected() {
        assert!(Commo::new(ContactUid::from(""), "X").is_err());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut c = commo();
        c.shutdown();
        c.shutdown();
        assert!(matches!(c.set_ttl(4), Err(CommoError::InvalidArgument(_))));
        assert!(c.contact_list().is_err());
    }

    #[test]
    fn test_cot_input_validated() {
        let c = commo();
        assert!(matches!(
            c.broadcast_cot("<not-cot/>", CoTSendMethod::Any),
            Err(CommoError::InvalidArgument(_))
        ));
        let huge = format!("{}{}", XML, " ".repeat(MAX_DATAGRAM_SIZE));
        assert!(matches!(
            c.send_cot_tcp_direct("127.0.0.1", 4242, &huge),
            Err(CommoError::InvalidArgument(_))
        ));
        // no interfaces: nothing to send to, but the message is fine
        assert!(c.broadcast_cot(XML, CoTSendMethod::Any).is_ok());
    }

    #[test]
    fn test_crypto_keys_validated() {
        let c = commo();
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert!(c.set_crypto_keys(Some(&a), None).is_err());
        assert!(c.set_crypto_keys(None, Some(&b)).is_err());
        assert!(c.set_crypto_keys(Some(&a), Some(&a)).is_err());
        assert!(c.set_crypto_keys(Some(&a[..16]), Some(&b)).is_err());
        assert!(c.set_crypto_keys(Some(&a), Some(&b)).is_ok());
        assert!(c.set_crypto_keys(None, None).is_ok());
    }

    #[test]
    fn test_tuning_setters() {
        let c = commo();
        assert!(c.set_ttl(0).is_err());
        assert!(c.set_ttl(64).is_ok());
        // clamped rather than rejected
        assert!(c.set_tcp_conn_timeout(Duration::from_millis(10)).is_ok());
        assert!(c.set_udp_no_data_timeout(Some(Duration::ZERO)).is_ok());
        assert!(c.set_stream_monitor_enabled(false).is_ok());
        assert!(c.set_prefer_stream_endpoint(true).is_ok());
        assert!(c.set_callsign("RENAMED").is_ok());
        assert!(c.broadcast_proto().unwrap() >= LEGACY_PROTO);
    }

    #[test]
    fn test_apply_config_validates_first() {
        let c = commo();
        assert!(c.apply_config(&CommoConfig::new().ttl(300)).is_err());
        let config = CommoConfig::new()
            .callsign("CONFIGURED")
            .ttl(8)
            .tcp_conn_timeout(Duration::from_secs(5))
            .stream_monitor(false);
        assert!(c.apply_config(&config).is_ok());
        let c2 = Commo::with_config(ContactUid::from("OTHER-UID"), "OTHER", &config).unwrap();
        assert!(c2.broadcast_proto().is_ok());
    }

    #[test]
    fn test_direct_tcp_send_reaches_own_inbound_port() {
        let c = commo();
        let port = free_port();
        let iface = c.add_tcp_inbound_interface(port).unwrap();
        let (tx, rx) = mpsc::channel();
        c.add_cot_message_listener(Arc::new(CoTSink(Mutex::new(tx)))).unwrap();

        c.send_cot_tcp_direct("127.0.0.1", port, XML).unwrap();
        let (xml, endpoint) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        let got = CoTMessage::parse(xml.as_bytes()).unwrap();
        assert_eq!(got.event_uid(), "ANDROID-7");
        assert_eq!(endpoint, Some(format!("*:{port}:tcp")));

        c.remove_tcp_inbound_interface(&iface).unwrap();
        assert!(c.remove_tcp_inbound_interface(&iface).is_err());
    }

    #[test]
    fn test_known_endpoint_contact_lifecycle() {
        let c = commo();
        let presence = Arc::new(Presence::default());
        c.add_contact_presence_listener(presence.clone()).unwrap();
        let uid = ContactUid::from("KNOWN-1");

        c.config_known_endpoint_contact(&uid, Some("KNOWN"), Some("127.0.0.1"), 6969)
            .unwrap();
        assert!(c.contact_list().unwrap().contains(&uid));
        assert!(wait_for(|| presence.0.lock().contains(&uid)));

        c.config_known_endpoint_contact(&uid, None, None, 0).unwrap();
        assert!(!c.contact_list().unwrap().contains(&uid));
        assert!(c.config_known_endpoint_contact(&uid, Some("KNOWN"), None, 0).is_err());
    }

    #[test]
    fn test_send_to_unknown_contact_reports_gone() {
        let c = commo();
        let missing = ContactUid::from("NOBODY");
        match c.send_cot(&[missing.clone()], XML, CoTSendMethod::Any) {
            Err(CommoError::ContactGone(gone)) => assert_eq!(gone, vec![missing]),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_server_sends_need_a_known_stream() {
        let c = commo();
        assert!(c.send_cot_server_control(Some("nowhere:8089:tcp"), XML).is_err());
        assert!(c.send_cot_server_control(None, XML).is_ok());
        assert!(
            c.send_cot_to_server_mission_dest(None, "mission-a", XML)
                .is_ok()
        );
    }

    #[test]
    fn test_streaming_interface_add_remove() {
        let c = commo();
        let iface = c
            .add_streaming_interface("127.0.0.1", free_port(), &[CoTMessageType::SituationalAwareness], None, None)
            .unwrap();
        assert!(
            c.add_streaming_interface("127.0.0.1", 1, &[], None, None)
                .is_ok()
        );
        c.remove_streaming_interface(&iface).unwrap();
        assert!(c.remove_streaming_interface(&iface).is_err());
    }

    #[test]
    fn test_takproto_conversion_round_trip() {
        let data = Commo::cot_xml_to_takproto(XML, 1).unwrap();
        let xml = Commo::takproto_to_cot_xml(&data).unwrap();
        let msg = CoTMessage::parse(xml.as_bytes()).unwrap();
        assert_eq!(msg.event_uid(), "ANDROID-7");
        assert!(Commo::cot_xml_to_takproto("garbage", 1).is_err());
        assert!(Commo::takproto_to_cot_xml(&[0x00, 0x01]).is_err());
    }

    #[cfg(feature = "certgen")]
    #[test]
    fn test_certificate_helpers() {
        let key = Commo::generate_key_crypto_string(256).unwrap();
        let csr = Commo::generate_csr_crypto_string(&[("CN".to_string(), "device".to_string())], &key).unwrap();
        assert!(csr.contains("CERTIFICATE REQUEST"));
        let (cert, key) = Commo::generate_self_signed_cert("device").unwrap();
        assert!(cert.contains("BEGIN CERTIFICATE"));
        assert!(key.contains("PRIVATE KEY"));
    }

    #[cfg(feature = "mission-package")]
    mod mission {
        use super::*;
        use crate::core::CoTPointData;
        use crate::fileio::SimpleFileIOUpdate;
        use crate::missionpkg::{MissionPackageTransferStatus, ReceiveStatusUpdate, SendStatusUpdate};
        use std::path::PathBuf;

        struct NoopIO;

        impl MissionPackageIO for NoopIO {
            fn mission_package_receive_init(
                &self,
                _dest_file: &str,
                _transfer_name: &str,
                _sha256: &str,
                _size: u64,
                _sender_callsign: &str,
            ) -> std::result::Result<PathBuf, MissionPackageTransferStatus> {
                Err(MissionPackageTransferStatus::FinishedDisabledLocally)
            }

            fn mission_package_send_status_update(&self, _update: &SendStatusUpdate) {}

            fn mission_package_receive_status_update(&self, _update: &ReceiveStatusUpdate) {}

            fn current_point(&self) -> CoTPointData {
                CoTPointData::default()
            }
        }

        impl SimpleFileIO for NoopIO {
            fn file_transfer_update(&self, _update: &SimpleFileIOUpdate) {}
        }

        #[test]
        fn test_mission_operations_need_setup() {
            let c = commo();
            assert!(c.set_mission_package_local_port(0).is_err());
            assert!(c.send_mission_package_start(1).is_err());
            assert!(c.simple_file_transfer_start(0).is_err());
            // settings are kept until the manager exists
            assert!(c.set_mission_package_num_tries(0).is_err());
            assert!(c.set_mission_package_num_tries(3).is_ok());
            assert!(c.set_mission_package_conn_timeout(4).is_err());
            assert!(c.set_mission_package_transfer_timeout(60).is_ok());
        }

        #[test]
        fn test_setup_only_once_and_settings_copied() {
            let c = commo();
            c.set_mission_package_num_tries(4).unwrap();
            c.setup_mission_package_io(Arc::new(NoopIO)).unwrap();
            assert!(c.setup_mission_package_io(Arc::new(NoopIO)).is_err());

            let core = c.core().unwrap();
            let mp = &core.mission().unwrap().mp;
            assert_eq!(mp.settings().num_tries(), 4);
            c.set_mission_package_via_server_enabled(false).unwrap();
            assert!(!mp.settings().server_transfer_enabled());

            c.set_mission_package_local_port(0).unwrap();
            assert_eq!(mp.local_port(), 0);
            assert!(
                c.set_mission_package_local_https_params(free_port(), Some("not a cert"), Some("not a key"))
                    .is_err()
            );

            c.enable_simple_file_io(Arc::new(NoopIO)).unwrap();
            assert!(c.enable_simple_file_io(Arc::new(NoopIO)).is_err());
            let dir = tempfile::tempdir().unwrap();
            let id = c
                .simple_file_transfer_init(
                    false,
                    "http://127.0.0.1:1/file.zip",
                    None,
                    None,
                    None,
                    &dir.path().join("file.zip"),
                )
                .unwrap();
            assert!(c.simple_file_transfer_start(id).is_ok());
        }

        #[test]
        fn test_send_init_to_unknown_contact_fails() {
            let c = commo();
            c.setup_mission_package_io(Arc::new(NoopIO)).unwrap();
            let dir = tempfile::tempdir().unwrap();
            let file = dir.path().join("pkg.zip");
            std::fs::write(&file, b"PK\x03\x04").unwrap();
            assert!(
                c.send_mission_package_init(&[ContactUid::from("NOBODY")], &file, "pkg.zip", "pkg")
                    .is_err()
            );
            assert!(
                c.send_mission_package_to_server_init("nowhere:8089:tcp", &file, "pkg.zip")
                    .is_err()
            );
        }
    }
}

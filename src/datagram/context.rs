//! Interface, broadcast and shared-socket bookkeeping for the datagram
//! manager, plus the pure send planner.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::core::constants::DEFAULT_RX_NO_DATA_REBUILD_SECS;
use crate::core::{CoTMessageType, CommoError, EndpointType, Result};
use crate::net::PhysicalNetInterface;
use crate::net::addr::{parse_ip, udp_endpoint_id};

/// Where broadcasts of certain message types go.
#[derive(Debug, Clone)]
pub(crate) struct BroadcastContext {
    pub(crate) iface: PhysicalNetInterface,
    pub(crate) types: BTreeSet<CoTMessageType>,
    pub(crate) dest: SocketAddr,
}

impl BroadcastContext {
    /// Multicast destinations need an interface; unicast ones must not have one.
    pub(crate) fn new(
        iface: PhysicalNetInterface,
        types: &[CoTMessageType],
        addr: &str,
        port: u16,
    ) -> Result<Self> {
        let ip = parse_ip(addr).ok_or_else(|| CommoError::invalid(format!("invalid address {addr}")))?;
        match (&iface.iface_name, ip.is_multicast()) {
            (Some(_), false) => {
                return Err(CommoError::invalid("non-multicast address given for multicast broadcast"));
            }
            (None, true) => {
                return Err(CommoError::invalid("multicast address given for unicast broadcast"));
            }
            _ => {}
        }
        Ok(Self {
            iface,
            types: types.iter().copied().collect(),
            dest: SocketAddr::new(ip, port),
        })
    }
}

/// One inbound port on one hardware interface.
#[derive(Debug, Clone)]
pub(crate) struct RecvContext {
    pub(crate) iface: PhysicalNetInterface,
    pub(crate) port: u16,
    pub(crate) mcast: Vec<Ipv4Addr>,
}

impl RecvContext {
    pub(crate) fn new(iface: PhysicalNetInterface, port: u16, mcast_addrs: &[&str]) -> Result<Self> {
        let mut mcast = Vec::with_capacity(mcast_addrs.len());
        for s in mcast_addrs {
            let addr = match parse_ip(s) {
                Some(IpAddr::V4(v4)) if v4.is_multicast() => v4,
                _ => return Err(CommoError::invalid(format!("invalid multicast address {s}"))),
            };
            if mcast.contains(&addr) {
                return Err(CommoError::invalid(format!("duplicate multicast address {s}")));
            }
            mcast.push(addr);
        }
        Ok(Self { iface, port, mcast })
    }
}

/// Everything configured on one hardware interface.
#[derive(Debug, Default)]
pub(crate) struct InterfaceContext {
    pub(crate) recv: Vec<RecvContext>,
    pub(crate) bcast: Vec<BroadcastContext>,
    pub(crate) addr: Option<Ipv4Addr>,
    pub(crate) outbound: Mutex<Option<Arc<UdpSocket>>>,
}

impl InterfaceContext {
    pub(crate) fn is_empty(&self) -> bool {
        self.recv.is_empty() && self.bcast.is_empty()
    }

    pub(crate) fn handles(&self) -> Vec<PhysicalNetInterface> {
        self.recv
            .iter()
            .map(|r| r.iface.clone())
            .chain(self.bcast.iter().map(|b| b.iface.clone()))
            .collect()
    }
}

/// A receive socket shared by every interface listening on one port.
///
/// The socket exists while at least one interface has joined; interfaces
/// whose joins have not completed (interface down, or the socket was just
/// rebuilt) wait in `pending`.
#[derive(Debug)]
pub(crate) struct SharedSocket {
    pub(crate) port: u16,
    pub(crate) generic: bool,
    pub(crate) endpoint_id: String,
    pub(crate) joined: BTreeSet<String>,
    pub(crate) pending: BTreeSet<String>,
    pub(crate) socket: Option<Arc<UdpSocket>>,
}

impl SharedSocket {
    pub(crate) fn new(port: u16, generic: bool) -> Self {
        Self {
            port,
            generic,
            endpoint_id: udp_endpoint_id(port),
            joined: BTreeSet::new(),
            pending: BTreeSet::new(),
            socket: None,
        }
    }

    /// Close the socket; every joined interface must join again.
    pub(crate) fn kill(&mut self) {
        self.socket = None;
        let joined = std::mem::take(&mut self.joined);
        self.pending.extend(joined);
    }
}

/// Interface and socket state guarded by the manager's reader-writer lock.
#[derive(Debug)]
pub(crate) struct Interfaces {
    pub(crate) by_name: BTreeMap<String, InterfaceContext>,
    pub(crate) unicast_bcast: Vec<BroadcastContext>,
    pub(crate) sockets: BTreeMap<u16, SharedSocket>,
    pub(crate) rx_needs_rebuild: bool,
    pub(crate) reuse_address: bool,
    pub(crate) mcast_loop: bool,
    pub(crate) no_data_timeout: Duration,
}

impl Default for Interfaces {
    fn default() -> Self {
        Self {
            by_name: BTreeMap::new(),
            unicast_bcast: Vec::new(),
            sockets: BTreeMap::new(),
            rx_needs_rebuild: false,
            reuse_address: false,
            mcast_loop: false,
            no_data_timeout: Duration::from_secs(DEFAULT_RX_NO_DATA_REBUILD_SECS),
        }
    }
}

impl Interfaces {
    /// Register an inbound port on `name`, sharing the port's socket.
    pub(crate) fn add_inbound(&mut self, name: &str, rx: RecvContext, generic: bool) -> Result<()> {
        let port = rx.port;
        if let Some(ctx) = self.by_name.get(name)
            && ctx.recv.iter().any(|r| r.port == port)
        {
            return Err(CommoError::invalid(format!("port {port} already in use on {name}")));
        }
        if let Some(shared) = self.sockets.get(&port)
            && shared.generic != generic
        {
            return Err(CommoError::invalid("cannot mix generic and non-generic on same inbound port"));
        }
        self.sockets
            .entry(port)
            .or_insert_with(|| SharedSocket::new(port, generic))
            .pending
            .insert(name.to_string());
        self.by_name.entry(name.to_string()).or_default().recv.push(rx);
        self.rx_needs_rebuild = true;
        Ok(())
    }

    /// Remove an inbound port, leaving its groups and closing the shared
    /// socket once no joined interface remains.
    ///
    /// Returns whether the interface was up.
    pub(crate) fn remove_inbound(&mut self, iface: &PhysicalNetInterface) -> Result<bool> {
        let name = iface
            .iface_name
            .as_deref()
            .ok_or_else(|| CommoError::invalid("inbound interfaces are always named"))?;
        let ctx = self
            .by_name
            .get_mut(name)
            .ok_or_else(|| CommoError::invalid("unknown interface"))?;
        let idx = ctx
            .recv
            .iter()
            .position(|r| r.iface.id == iface.id)
            .ok_or_else(|| CommoError::invalid("unknown inbound interface"))?;
        let rx = ctx.recv.remove(idx);
        let addr = ctx.addr;

        if let Some(shared) = self.sockets.get_mut(&rx.port) {
            if shared.joined.remove(name) {
                if let (Some(sock), Some(local)) = (&shared.socket, addr) {
                    for group in &rx.mcast {
                        if let Err(e) = sock.leave_multicast_v4(group, &local) {
                            warn!(iface = name, %group, error = %e, "unable to leave multicast group");
                        }
                    }
                }
            } else {
                shared.pending.remove(name);
            }
            if shared.joined.is_empty() {
                shared.socket = None;
                self.rx_needs_rebuild = true;
                if shared.pending.is_empty() {
                    self.sockets.remove(&rx.port);
                }
            }
        }
        self.drop_if_unused(name);
        Ok(addr.is_some())
    }

    /// Add a broadcast destination, on `name` for multicast or to the
    /// unicast set when `name` is `None`.
    pub(crate) fn add_broadcast(&mut self, bcast: BroadcastContext) {
        match bcast.iface.iface_name.clone() {
            Some(name) => self.by_name.entry(name).or_default().bcast.push(bcast),
            None => self.unicast_bcast.push(bcast),
        }
    }

    /// Remove a broadcast destination. Returns whether it was up; unicast
    /// destinations always are.
    pub(crate) fn remove_broadcast(&mut self, iface: &PhysicalNetInterface) -> Result<bool> {
        let up = match iface.iface_name.as_deref() {
            None => {
                let before = self.unicast_bcast.len();
                self.unicast_bcast.retain(|b| b.iface.id != iface.id);
                if before == self.unicast_bcast.len() {
                    return Err(CommoError::invalid("unknown broadcast interface"));
                }
                true
            }
            Some(name) => {
                let ctx = self
                    .by_name
                    .get_mut(name)
                    .ok_or_else(|| CommoError::invalid("unknown interface"))?;
                let before = ctx.bcast.len();
                ctx.bcast.retain(|b| b.iface.id != iface.id);
                if before == ctx.bcast.len() {
                    return Err(CommoError::invalid("unknown broadcast interface"));
                }
                let up = ctx.addr.is_some();
                self.drop_if_unused(name);
                up
            }
        };
        Ok(up)
    }

    fn drop_if_unused(&mut self, name: &str) {
        if self.by_name.get(name).is_some_and(InterfaceContext::is_empty) {
            self.by_name.remove(name);
        }
    }

    /// Leave the groups `name` joined through `old_addr` and queue it to join
    /// again on the next receive pass.
    pub(crate) fn suspend_joins(&mut self, name: &str, old_addr: Ipv4Addr) {
        let Some(ctx) = self.by_name.get(name) else {
            return;
        };
        for rx in &ctx.recv {
            let Some(shared) = self.sockets.get_mut(&rx.port) else {
                continue;
            };
            if !shared.joined.remove(name) {
                continue;
            }
            if let Some(sock) = &shared.socket {
                for group in &rx.mcast {
                    if let Err(e) = sock.leave_multicast_v4(group, &old_addr) {
                        warn!(iface = name, %group, error = %e, "unable to leave multicast group");
                    }
                }
            }
            shared.pending.insert(name.to_string());
        }
        self.rx_needs_rebuild = true;
    }

    /// Close every receive socket; each is rebuilt and rejoined on the next
    /// receive pass.
    pub(crate) fn kill_all_rx(&mut self) {
        for shared in self.sockets.values_mut() {
            shared.kill();
        }
        self.rx_needs_rebuild = true;
    }

    /// Drop every outbound interface socket.
    pub(crate) fn drop_outbound(&self) {
        for ctx in self.by_name.values() {
            *ctx.outbound.lock() = None;
        }
    }
}

/// Destinations reached from one source socket for one queued item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SendPlan {
    /// Interface whose outbound socket is used, `None` for the unicast socket.
    pub(crate) iface: Option<String>,
    /// Address advertised in the message's contact endpoint.
    pub(crate) src_ip: String,
    pub(crate) ep_type: EndpointType,
    pub(crate) dests: Vec<SocketAddr>,
    /// Broadcast to a unicast destination: legacy XML only, no announces.
    pub(crate) unicast_broadcast: bool,
}

/// Work out where one queued item goes.
///
/// - unicast destination: the shared unicast socket
/// - multicast destination: every interface with a broadcast configured
/// - no destination: each broadcast context whose types include `msg_type`
pub(crate) fn plan_sends(
    ifaces: &Interfaces,
    dest: Option<SocketAddr>,
    msg_type: CoTMessageType,
    ep_as_udp: bool,
) -> Vec<SendPlan> {
    let ep_type = if ep_as_udp { EndpointType::Udp } else { EndpointType::Tcp };
    let mut plans = Vec::new();

    if let Some(d) = dest.filter(|d| !d.ip().is_multicast()) {
        plans.push(SendPlan {
            iface: None,
            src_ip: String::new(),
            ep_type,
            dests: vec![d],
            unicast_broadcast: false,
        });
        return plans;
    }

    for (name, ctx) in &ifaces.by_name {
        if ctx.bcast.is_empty() {
            continue;
        }
        let dests: Vec<SocketAddr> = match dest {
            Some(fixed) => vec![fixed],
            None => ctx
                .bcast
                .iter()
                .filter(|b| b.types.contains(&msg_type))
                .map(|b| b.dest)
                .collect(),
        };
        if dests.is_empty() {
            continue;
        }
        let Some(addr) = ctx.addr else {
            continue;
        };
        plans.push(SendPlan {
            iface: Some(name.clone()),
            src_ip: addr.to_string(),
            ep_type,
            dests,
            unicast_broadcast: false,
        });
    }

    if dest.is_none() {
        let dests: Vec<SocketAddr> = ifaces
            .unicast_bcast
            .iter()
            .filter(|b| b.types.contains(&msg_type))
            .map(|b| b.dest)
            .collect();
        if !dests.is_empty() {
            plans.push(SendPlan {
                iface: None,
                src_ip: String::new(),
                ep_type: if ep_as_udp {
                    EndpointType::UdpUseSrc
                } else {
                    EndpointType::TcpUseSrc
                },
                dests,
                unicast_broadcast: true,
            });
        }
    }
    plans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::InterfaceId;

    fn handle(name: Option<&str>) -> PhysicalNetInterface {
        PhysicalNetInterface {
            id: InterfaceId::next(),
            iface_name: name.map(str::to_string),
        }
    }

    #[test]
    fn test_broadcast_address_rules() {
        let sa = [CoTMessageType::SituationalAwareness];
        assert!(BroadcastContext::new(handle(Some("eth0")), &sa, "239.2.3.1", 6969).is_ok());
        assert!(BroadcastContext::new(handle(Some("eth0")), &sa, "10.0.0.1", 6969).is_err());
        assert!(BroadcastContext::new(handle(None), &sa, "239.2.3.1", 6969).is_err());
        assert!(BroadcastContext::new(handle(None), &sa, "bogus", 6969).is_err());
    }

    #[test]
    fn test_recv_rejects_duplicate_groups() {
        assert!(RecvContext::new(handle(Some("eth0")), 6969, &["239.2.3.1", "239.2.3.1"]).is_err());
        assert!(RecvContext::new(handle(Some("eth0")), 6969, &["10.0.0.1"]).is_err());
    }

    #[test]
    fn test_shared_socket_lifecycle() {
        let mut ifaces = Interfaces::default();
        let a = handle(Some("eth0"));
        let b = handle(Some("eth1"));
        ifaces
            .add_inbound("eth0", RecvContext::new(a.clone(), 6969, &[]).unwrap(), false)
            .unwrap();
        ifaces
            .add_inbound("eth1", RecvContext::new(b.clone(), 6969, &[]).unwrap(), false)
            .unwrap();
        assert!(
            ifaces
                .add_inbound("eth0", RecvContext::new(handle(Some("eth0")), 6969, &[]).unwrap(), false)
                .is_err()
        );
        assert!(
            ifaces
                .add_inbound("eth2", RecvContext::new(handle(Some("eth2")), 6969, &[]).unwrap(), true)
                .is_err()
        );

        // eth0 joined, eth1 still pending
        {
            let shared = ifaces.sockets.get_mut(&6969).unwrap();
            shared.pending.remove("eth0");
            shared.joined.insert("eth0".into());
            shared.socket = Some(Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap()));
        }

        assert!(!ifaces.remove_inbound(&a).unwrap());
        let shared = &ifaces.sockets[&6969];
        assert!(shared.socket.is_none());
        assert!(shared.pending.contains("eth1"));
        assert!(!ifaces.by_name.contains_key("eth0"));

        ifaces.remove_inbound(&b).unwrap();
        assert!(ifaces.sockets.is_empty());
        assert!(ifaces.remove_inbound(&b).is_err());
    }

    #[test]
    fn test_remove_inbound_after_failed_leave() {
        let mut ifaces = Interfaces::default();
        let a = handle(Some("lo"));
        ifaces
            .add_inbound("lo", RecvContext::new(a.clone(), 6971, &["239.2.3.1"]).unwrap(), false)
            .unwrap();
        ifaces.by_name.get_mut("lo").unwrap().addr = Some(Ipv4Addr::LOCALHOST);
        {
            // marked joined, but the group was never joined on the socket
            let shared = ifaces.sockets.get_mut(&6971).unwrap();
            shared.pending.clear();
            shared.joined.insert("lo".into());
            shared.socket = Some(Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap()));
        }

        assert!(ifaces.remove_inbound(&a).unwrap());
        assert!(ifaces.sockets.is_empty());
        assert!(!ifaces.by_name.contains_key("lo"));
    }

    #[test]
    fn test_kill_moves_joined_to_pending() {
        let mut shared = SharedSocket::new(7000, false);
        shared.joined.insert("eth0".into());
        shared.socket = Some(Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap()));
        shared.kill();
        assert!(shared.socket.is_none());
        assert!(shared.joined.is_empty());
        assert!(shared.pending.contains("eth0"));
        assert_eq!(shared.endpoint_id, "*:7000:udp");
    }

    #[test]
    fn test_suspend_joins_requeues_interface() {
        let mut ifaces = Interfaces::default();
        ifaces
            .add_inbound("eth0", RecvContext::new(handle(Some("eth0")), 6970, &[]).unwrap(), false)
            .unwrap();
        {
            let shared = ifaces.sockets.get_mut(&6970).unwrap();
            shared.pending.clear();
            shared.joined.insert("eth0".into());
        }
        ifaces.rx_needs_rebuild = false;

        ifaces.suspend_joins("eth0", Ipv4Addr::new(10, 0, 0, 1));
        let shared = &ifaces.sockets[&6970];
        assert!(shared.joined.is_empty());
        assert!(shared.pending.contains("eth0"));
        assert!(ifaces.rx_needs_rebuild);
    }

    #[test]
    fn test_plan_multicast_broadcast() {
        let mut ifaces = Interfaces::default();
        let sa = [CoTMessageType::SituationalAwareness];
        ifaces.add_broadcast(BroadcastContext::new(handle(Some("eth0")), &sa, "239.2.3.1", 6969).unwrap());
        ifaces.by_name.get_mut("eth0").unwrap().addr = Some(Ipv4Addr::new(192, 168, 1, 20));

        let plans = plan_sends(&ifaces, None, CoTMessageType::SituationalAwareness, true);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].dests, vec!["239.2.3.1:6969".parse::<SocketAddr>().unwrap()]);
        assert_eq!(plans[0].src_ip, "192.168.1.20");
        assert_eq!(plans[0].ep_type, EndpointType::Udp);

        // chat is not configured on this interface
        assert!(plan_sends(&ifaces, None, CoTMessageType::Chat, true).is_empty());

        // interface down: nothing to send from
        ifaces.by_name.get_mut("eth0").unwrap().addr = None;
        assert!(plan_sends(&ifaces, None, CoTMessageType::SituationalAwareness, true).is_empty());
    }

    #[test]
    fn test_plan_unicast_broadcast_uses_source_reply() {
        let mut ifaces = Interfaces::default();
        let types = [CoTMessageType::SituationalAwareness, CoTMessageType::Chat];
        ifaces.add_broadcast(BroadcastContext::new(handle(None), &types, "10.0.0.9", 4000).unwrap());
        let plans = plan_sends(&ifaces, None, CoTMessageType::Chat, false);
        assert_eq!(plans.len(), 1);
        assert!(plans[0].unicast_broadcast);
        assert_eq!(plans[0].ep_type, EndpointType::TcpUseSrc);
    }

    #[test]
    fn test_plan_unicast_destination() {
        let ifaces = Interfaces::default();
        let dest: SocketAddr = "10.0.0.3:6969".parse().unwrap();
        let plans = plan_sends(&ifaces, Some(dest), CoTMessageType::SituationalAwareness, false);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].iface, None);
        assert_eq!(plans[0].dests, vec![dest]);
        assert!(!plans[0].unicast_broadcast);
    }
}

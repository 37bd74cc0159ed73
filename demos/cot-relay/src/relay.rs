//! Listener side of the relay.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use commo_core::core::{
    CoTMessageListener, ContactPresenceListener, InterfaceStatusListener, NetInterfaceErrorCode,
};
use commo_core::{ContactUid, NetInterface};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A CoT message waiting to be relayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Message text.
    pub xml: String,
    /// Endpoint it arrived on.
    pub endpoint: Option<String>,
}

/// Counters shared with the health endpoint.
#[derive(Debug, Default)]
pub struct RelayStats {
    received: AtomicU64,
    relayed: AtomicU64,
    contacts: AtomicUsize,
    interfaces_up: AtomicUsize,
}

impl RelayStats {
    /// Messages received.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Messages relayed.
    pub fn relayed(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }

    /// Count one relayed message.
    pub fn mark_relayed(&self) {
        self.relayed.fetch_add(1, Ordering::Relaxed);
    }

    /// Contacts currently known.
    pub fn contacts(&self) -> usize {
        self.contacts.load(Ordering::Relaxed)
    }

    /// Interfaces currently up.
    pub fn interfaces_up(&self) -> usize {
        self.interfaces_up.load(Ordering::Relaxed)
    }
}

/// Receives everything the relay's `Commo` reports.
pub struct RelayListener {
    stats: Arc<RelayStats>,
    tx: mpsc::UnboundedSender<Inbound>,
}

impl RelayListener {
    /// Listener feeding `tx` and counting into `stats`.
    pub fn new(stats: Arc<RelayStats>, tx: mpsc::UnboundedSender<Inbound>) -> Self {
        Self { stats, tx }
    }
}

impl CoTMessageListener for RelayListener {
    fn cot_message_received(&self, cot_xml: &str, rx_endpoint_id: Option<&str>) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        debug!(endpoint = ?rx_endpoint_id, len = cot_xml.len(), "CoT received");
        let item = Inbound {
            xml: cot_xml.to_string(),
            endpoint: rx_endpoint_id.map(str::to_string),
        };
        if self.tx.send(item).is_err() {
            warn!("relay loop gone, dropping CoT");
        }
    }
}

impl ContactPresenceListener for RelayListener {
    fn contact_added(&self, contact: &ContactUid) {
        self.stats.contacts.fetch_add(1, Ordering::Relaxed);
        info!(contact = %contact, "contact added");
    }

    fn contact_removed(&self, contact: &ContactUid) {
        let _ = self
            .stats
            .contacts
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        info!(contact = %contact, "contact removed");
    }
}

impl InterfaceStatusListener for RelayListener {
    fn interface_up(&self, iface: &NetInterface) {
        self.stats.interfaces_up.fetch_add(1, Ordering::Relaxed);
        info!(iface = %iface.id(), "interface up");
    }

    fn interface_down(&self, iface: &NetInterface) {
        let _ = self
            .stats
            .interfaces_up
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        info!(iface = %iface.id(), "interface down");
    }

    fn interface_error(&self, iface: &NetInterface, err: NetInterfaceErrorCode) {
        warn!(iface = %iface.id(), error = ?err, "interface error");
    }
}

/// True if a message from `endpoint` should go to the server at `server_endpoint`.
pub fn should_relay(endpoint: Option<&str>, server_endpoint: Option<&str>) -> bool {
    match (endpoint, server_endpoint) {
        (_, None) => false,
        (Some(ep), Some(server)) => ep != server,
        (None, Some(_)) => true,
    }
}

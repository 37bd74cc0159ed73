//! Hardware interface monitoring.
//!
//! Polls the host's interfaces once a second and reports IPv4 addresses
//! appearing or disappearing by interface name.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use get_if_addrs::{IfAddr, get_if_addrs};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::core::constants::IFSCAN_THREAD;
use crate::core::{ListenerSet, Result};
use crate::threading::{Signal, StopFlag, ThreadWorker, ThreadedHandler};

const SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Notified of hardware interface address changes.
pub trait HwIfListener: Send + Sync {
    /// `name` now has IPv4 address `addr`.
    fn interface_up(&self, name: &str, addr: Ipv4Addr);

    /// `name` no longer has an IPv4 address.
    fn interface_down(&self, name: &str);
}

struct Inner {
    current: Mutex<BTreeMap<String, Ipv4Addr>>,
    listeners: ListenerSet<dyn HwIfListener>,
    wake: Signal,
}

/// Background interface scanner.
pub struct HwIfScanner {
    inner: Arc<Inner>,
    handler: ThreadedHandler,
}

static IFSCAN_THREADS: &[&str] = &[IFSCAN_THREAD];

impl HwIfScanner {
    /// Start scanning.
    pub fn new() -> Result<Self> {
        let inner = Arc::new(Inner {
            current: Mutex::new(BTreeMap::new()),
            listeners: ListenerSet::new(),
            wake: Signal::new(),
        });
        inner.scan();
        let handler = ThreadedHandler::new(IFSCAN_THREADS);
        handler.start(Arc::clone(&inner))?;
        Ok(Self { inner, handler })
    }

    /// Register a listener. It is told about every interface already up.
    pub fn add_listener(&self, listener: Arc<dyn HwIfListener>) -> Result<()> {
        self.inner.listeners.add(Arc::clone(&listener))?;
        for (name, addr) in self.inner.current.lock().iter() {
            listener.interface_up(name, *addr);
        }
        Ok(())
    }

    /// Remove a listener.
    pub fn remove_listener(&self, listener: &Arc<dyn HwIfListener>) -> Result<()> {
        self.inner.listeners.remove(listener)
    }

    /// Current IPv4 address of interface `name`.
    pub fn address_of(&self, name: &str) -> Option<Ipv4Addr> {
        self.inner.current.lock().get(name).copied()
    }

    /// First non-loopback IPv4 address on the host.
    pub fn primary_address(&self) -> Option<Ipv4Addr> {
        self.inner
            .current
            .lock()
            .values()
            .find(|a| !a.is_loopback())
            .copied()
    }
}

impl Drop for HwIfScanner {
    fn drop(&mut self) {
        self.handler.stop(&*self.inner);
    }
}

impl ThreadWorker for Inner {
    fn thread_entry(&self, _index: usize, stop: &StopFlag) {
        while !stop.should_stop() {
            self.wake.wait(stop, SCAN_INTERVAL);
            if stop.should_stop() {
                break;
            }
            self.scan();
        }
    }

    fn thread_stop_signal(&self, _index: usize) {
        self.wake.wake();
    }
}

impl Inner {
    fn scan(&self) {
        let found = match get_if_addrs() {
            Ok(ifaces) => ifaces
                .into_iter()
                .filter_map(|i| match i.addr {
                    IfAddr::V4(v4) => Some((i.name, v4.ip)),
                    IfAddr::V6(_) => None,
                })
                .fold(BTreeMap::new(), |mut m, (name, ip)| {
                    m.entry(name).or_insert(ip);
                    m
                }),
            Err(e) => {
                warn!(error = %e, "interface scan failed");
                return;
            }
        };

        let (up, down) = {
            let mut current = self.current.lock();
            let up: Vec<(String, Ipv4Addr)> = found
                .iter()
                .filter(|(name, ip)| current.get(*name) != Some(ip))
                .map(|(n, ip)| (n.clone(), *ip))
                .collect();
            let down: Vec<String> = current
                .keys()
                .filter(|name| !found.contains_key(*name))
                .cloned()
                .collect();
            *current = found;
            (up, down)
        };

        for name in &down {
            info!(iface = %name, "interface down");
            self.listeners.for_each(|l| l.interface_down(name));
        }
        for (name, addr) in &up {
            debug!(iface = %name, %addr, "interface up");
            self.listeners.for_each(|l| l.interface_up(name, *addr));
        }
    }
}

/// Look up the current IPv4 address of a named interface without a scanner.
pub fn lookup_interface_v4(name: &str) -> Option<Ipv4Addr> {
    get_if_addrs().ok()?.into_iter().find_map(|i| match i.addr {
        IfAddr::V4(v4) if i.name == name => Some(v4.ip),
        _ => None,
    })
}

/// First non-loopback local IP, used when advertising endpoints.
pub fn first_non_loopback() -> Option<IpAddr> {
    get_if_addrs()
        .ok()?
        .into_iter()
        .find(|i| !i.is_loopback() && i.ip().is_ipv4())
        .map(|i| i.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Seen(Mutex<Vec<String>>);

    impl HwIfListener for Seen {
        fn interface_up(&self, name: &str, _addr: Ipv4Addr) {
            self.0.lock().push(name.to_string());
        }

        fn interface_down(&self, _name: &str) {}
    }

    #[test]
    fn test_replays_current_interfaces() {
        let scanner = HwIfScanner::new().unwrap();
        let seen = Arc::new(Seen::default());
        scanner.add_listener(seen.clone()).unwrap();
        let known = scanner.inner.current.lock().len();
        assert_eq!(seen.0.lock().len(), known);
        let dup: Arc<dyn HwIfListener> = seen;
        assert!(scanner.add_listener(dup).is_err());
    }

    #[test]
    fn test_loopback_not_primary() {
        let scanner = HwIfScanner::new().unwrap();
        if let Some(addr) = scanner.primary_address() {
            assert!(!addr.is_loopback());
        }
    }
}

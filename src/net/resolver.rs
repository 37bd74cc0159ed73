//! Background hostname resolution.
//!
//! Requests are retried on a fixed interval until they succeed or run out
//! of tries. Results are delivered to a [`ResolverListener`] on the resolver
//! thread.

use std::net::{IpAddr, ToSocketAddrs};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::core::Result;
use crate::core::constants::RESOLVER_THREAD;
use crate::threading::{StopFlag, ThreadWorker, ThreadedHandler};

/// Identity of a queued resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolverRequestId(u64);

/// Receives resolution outcomes.
pub trait ResolverListener: Send + Sync {
    /// Final outcome: `Some` on success, `None` once tries are exhausted.
    fn resolution_complete(&self, id: ResolverRequestId, host: &str, addr: Option<IpAddr>);

    /// One attempt failed and another is scheduled.
    fn resolution_attempt_failed(&self, id: ResolverRequestId, host: &str) {
        let _ = (id, host);
    }
}

struct Request {
    id: ResolverRequestId,
    host: String,
    tries_left: Option<u32>,
    due: Instant,
}

struct State {
    next_id: u64,
    pending: Vec<Request>,
    in_flight: Option<ResolverRequestId>,
    in_flight_cancelled: bool,
}

struct Inner {
    listener: Weak<dyn ResolverListener>,
    retry: Duration,
    tries: Option<u32>,
    state: Mutex<State>,
    monitor: Condvar,
}

/// A named thread resolving hostnames on behalf of one manager.
pub struct ResolverQueue {
    inner: Arc<Inner>,
    handler: ThreadedHandler,
}

static RESOLVER_THREADS: &[&str] = &[RESOLVER_THREAD];

impl ResolverQueue {
    /// Start a resolver.
    ///
    /// `tries` of `None` retries forever.
    pub fn new(listener: Weak<dyn ResolverListener>, retry: Duration, tries: Option<u32>) -> Result<Self> {
        let inner = Arc::new(Inner {
            listener,
            retry,
            tries,
            state: Mutex::new(State {
                next_id: 1,
                pending: Vec::new(),
                in_flight: None,
                in_flight_cancelled: false,
            }),
            monitor: Condvar::new(),
        });
        let handler = ThreadedHandler::new(RESOLVER_THREADS);
        handler.start(Arc::clone(&inner))?;
        Ok(Self { inner, handler })
    }

    /// Queue `host` for resolution, attempting it immediately.
    pub fn queue_for_resolution(&self, host: &str) -> ResolverRequestId {
        let mut state = self.inner.state.lock();
        let id = ResolverRequestId(state.next_id);
        state.next_id += 1;
        state.pending.push(Request {
            id,
            host: host.to_string(),
            tries_left: self.inner.tries,
            due: Instant::now(),
        });
        drop(state);
        self.inner.monitor.notify_all();
        id
    }

    /// Forget a request. No callback is made for it afterwards.
    pub fn cancel_resolution(&self, id: ResolverRequestId) {
        let mut state = self.inner.state.lock();
        state.pending.retain(|r| r.id != id);
        if state.in_flight == Some(id) {
            state.in_flight_cancelled = true;
        }
    }

    /// Number of requests still waiting.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().pending.len()
    }
}

impl Drop for ResolverQueue {
    fn drop(&mut self) {
        self.handler.stop(&*self.inner);
    }
}

impl ThreadWorker for Inner {
    fn thread_entry(&self, _index: usize, stop: &StopFlag) {
        while !stop.should_stop() {
            let Some(mut req) = self.next_due(stop) else {
                continue;
            };
            let resolved = resolve(&req.host);

            let mut state = self.state.lock();
            let cancelled = std::mem::replace(&mut state.in_flight_cancelled, false);
            state.in_flight = None;
            if cancelled {
                continue;
            }
            let Some(listener) = self.listener.upgrade() else {
                continue;
            };
            match resolved {
                Some(addr) => {
                    drop(state);
                    debug!(host = %req.host, %addr, "resolved");
                    listener.resolution_complete(req.id, &req.host, Some(addr));
                }
                None => {
                    let exhausted = match req.tries_left.as_mut() {
                        Some(n) => {
                            *n = n.saturating_sub(1);
                            *n == 0
                        }
                        None => false,
                    };
                    if exhausted {
                        drop(state);
                        warn!(host = %req.host, "name resolution failed, giving up");
                        listener.resolution_complete(req.id, &req.host, None);
                    } else {
                        let id = req.id;
                        let host = req.host.clone();
                        req.due = Instant::now() + self.retry;
                        state.pending.push(req);
                        drop(state);
                        debug!(host = %host, "name resolution failed, will retry");
                        listener.resolution_attempt_failed(id, &host);
                    }
                }
            }
        }
    }

    fn thread_stop_signal(&self, _index: usize) {
        let _state = self.state.lock();
        self.monitor.notify_all();
    }
}

impl Inner {
    /// Wait for the next due request and mark it in flight.
    fn next_due(&self, stop: &StopFlag) -> Option<Request> {
        let mut state = self.state.lock();
        loop {
            if stop.should_stop() {
                return None;
            }
            let now = Instant::now();
            let earliest = state
                .pending
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.due)
                .map(|(i, r)| (i, r.due));
            match earliest {
                Some((i, due)) if due <= now => {
                    let req = state.pending.swap_remove(i);
                    state.in_flight = Some(req.id);
                    state.in_flight_cancelled = false;
                    return Some(req);
                }
                Some((_, due)) => {
                    self.monitor.wait_until(&mut state, due);
                }
                None => {
                    self.monitor.wait(&mut state);
                }
            }
        }
    }
}

/// Resolve `host`, preferring an IPv4 address.
pub fn resolve(host: &str) -> Option<IpAddr> {
    let addrs: Vec<IpAddr> = match (host, 0u16).to_socket_addrs() {
        Ok(iter) => iter.map(|a| a.ip()).collect(),
        Err(e) => {
            debug!(host, error = %e, "lookup failed");
            return None;
        }
    };
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

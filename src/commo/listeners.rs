//! Delivery of received traffic to client listeners.
//!
//! Every transport hands its messages to [`CoTListenerManagement`], which
//! serializes them and delivers from its own thread so slow client callbacks
//! never stall a socket loop. Interface status changes are passed through
//! synchronously.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::core::constants::COT_LISTENER_THREAD;
use crate::core::{
    CoTMessageListener, DatagramListener, GenericDataListener, InterfaceStatusListener, ListenerSet,
    NetInterfaceErrorCode, Result, StreamingMessageListener, TcpMessageListener,
};
use crate::cot::{CoTMessage, TakMessage};
use crate::net::NetInterface;
use crate::threading::{StopFlag, ThreadWorker, ThreadedHandler, WorkQueue};

const LISTENER_THREADS: &[&str] = &[COT_LISTENER_THREAD];

enum Delivery {
    CoT { xml: String, endpoint: Option<String> },
    Generic { data: Vec<u8>, endpoint: Option<String> },
}

struct Inner {
    queue: WorkQueue<Delivery>,
    cot_listeners: ListenerSet<dyn CoTMessageListener>,
    generic_listeners: ListenerSet<dyn GenericDataListener>,
    iface_listeners: ListenerSet<dyn InterfaceStatusListener>,
}

impl Inner {
    fn queue_cot(&self, msg: &CoTMessage, endpoint: &str) {
        let xml = match String::from_utf8(msg.serialize()) {
            Ok(xml) => xml,
            Err(e) => {
                debug!(endpoint, error = %e, "unserializable CoT message dropped");
                return;
            }
        };
        self.queue.push(Delivery::CoT {
            xml,
            endpoint: rx_endpoint(endpoint),
        });
    }

    fn deliver(&self, item: Delivery) {
        match item {
            Delivery::CoT { xml, endpoint } => {
                trace!(endpoint = ?endpoint, len = xml.len(), "delivering CoT");
                self.cot_listeners
                    .for_each(|l| l.cot_message_received(&xml, endpoint.as_deref()));
            }
            Delivery::Generic { data, endpoint } => {
                trace!(endpoint = ?endpoint, len = data.len(), "delivering generic data");
                self.generic_listeners
                    .for_each(|l| l.generic_data_received(&data, endpoint.as_deref()));
            }
        }
    }
}

fn rx_endpoint(endpoint: &str) -> Option<String> {
    (!endpoint.is_empty()).then(|| endpoint.to_string())
}

impl ThreadWorker for Inner {
    fn thread_entry(&self, _index: usize, stop: &StopFlag) {
        while let Some(item) = self.queue.wait_pop(stop) {
            self.deliver(item);
        }
    }

    fn thread_stop_signal(&self, _index: usize) {
        self.queue.wake_all();
    }
}

/// Fan-out of received CoT, generic data and interface status to the client.
pub struct CoTListenerManagement {
    inner: Arc<Inner>,
    handler: ThreadedHandler,
}

impl CoTListenerManagement {
    /// Create the manager and start its delivery thread.
    pub fn new() -> Result<Self> {
        let inner = Arc::new(Inner {
            queue: WorkQueue::new(),
            cot_listeners: ListenerSet::new(),
            generic_listeners: ListenerSet::new(),
            iface_listeners: ListenerSet::new(),
        });
        let handler = ThreadedHandler::new(LISTENER_THREADS);
        handler.start(Arc::clone(&inner))?;
        Ok(Self { inner, handler })
    }

    /// Register a CoT listener.
    pub fn add_cot_message_listener(&self, listener: Arc<dyn CoTMessageListener>) -> Result<()> {
        self.inner.cot_listeners.add(listener)
    }

    /// Remove a CoT listener.
    pub fn remove_cot_message_listener(&self, listener: &Arc<dyn CoTMessageListener>) -> Result<()> {
        self.inner.cot_listeners.remove(listener)
    }

    /// Register a generic data listener.
    pub fn add_generic_data_listener(&self, listener: Arc<dyn GenericDataListener>) -> Result<()> {
        self.inner.generic_listeners.add(listener)
    }

    /// Remove a generic data listener.
    pub fn remove_generic_data_listener(&self, listener: &Arc<dyn GenericDataListener>) -> Result<()> {
        self.inner.generic_listeners.remove(listener)
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

impl Drop for CoTListenerManagement {
    fn drop(&mut self) {
        self.handler.stop(&*self.inner);
        self.inner.queue.drain();
    }
}

impl DatagramListener for CoTListenerManagement {
    fn datagram_received(&self, endpoint_id: &str, _sender: Option<SocketAddr>, msg: &TakMessage) {
        if let Some(cot) = msg.cot_message() {
            self.inner.queue_cot(cot, endpoint_id);
        }
    }

    fn datagram_received_generic(&self, endpoint_id: &str, data: &[u8]) {
        self.inner.queue.push(Delivery::Generic {
            data: data.to_vec(),
            endpoint: rx_endpoint(endpoint_id),
        });
    }
}

impl TcpMessageListener for CoTListenerManagement {
    fn tcp_message_received(&self, endpoint_id: &str, _sender: Option<SocketAddr>, msg: &CoTMessage) {
        self.inner.queue_cot(msg, endpoint_id);
    }
}

impl StreamingMessageListener for CoTListenerManagement {
    fn streaming_message_received(&self, stream_endpoint: &str, msg: &CoTMessage) {
        self.inner.queue_cot(msg, stream_endpoint);
    }
}

impl InterfaceStatusListener for CoTListenerManagement {
    fn interface_up(&self, iface: &NetInterface) {
        self.inner.iface_listeners.for_each(|l| l.interface_up(iface));
    }

    fn interface_down(&self, iface: &NetInterface) {
        self.inner.iface_listeners.for_each(|l| l.interface_down(iface));
    }

    fn interface_error(&self, iface: &NetInterface, err: NetInterfaceErrorCode) {
        self.inner.iface_listeners.for_each(|l| l.interface_error(iface, err));
    }
}

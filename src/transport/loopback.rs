//! In-memory transport for tests, demos and local development.
//!
//! A [`LoopbackNetwork`] links [`LoopbackTransport`] endpoints. Each endpoint
//! belongs to a node (the identifier remote sides see) and carries a transport
//! code, so one node can expose several transports to the same remote node.
//! Sends are queued; [`LoopbackNetwork::run_until_idle`] delivers them one at a
//! time, so acknowledgement-driven pumps never recurse.

use crate::transport::{ConnectionStatus, ExtraInfo, Transport, TransportCallback, EXTRA_SIGNAL_STRENGTH};
use crate::utils::TransportError;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Signal strength reported for loopback links
pub const LOOPBACK_SIGNAL_STRENGTH: i32 = -42;

type EndpointKey = (String, u32);

#[derive(Debug)]
struct Delivery {
    from: EndpointKey,
    to: EndpointKey,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<EndpointKey, Arc<LoopbackTransport>>,
    links: HashSet<(EndpointKey, EndpointKey)>,
    queue: VecDeque<Delivery>,
}

/// Shared medium connecting loopback endpoints
#[derive(Default)]
pub struct LoopbackNetwork {
    state: Mutex<NetworkState>,
}

impl LoopbackNetwork {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create an endpoint for `node` speaking transport `code`
    pub fn endpoint(
        self: &Arc<Self>,
        node: impl Into<String>,
        name: impl Into<String>,
        code: u32,
        mtu: usize,
    ) -> Arc<LoopbackTransport> {
        let transport = Arc::new(LoopbackTransport {
            node: node.into(),
            name: name.into(),
            code,
            mtu: mtu.max(1),
            network: Arc::downgrade(self),
            callback: Mutex::new(None),
            advertising: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            failures_to_inject: AtomicUsize::new(0),
            bytes_sent: AtomicU64::new(0),
        });
        debug!(
            "Loopback endpoint {} ({}, code {}, mtu {})",
            transport.node, transport.name, code, transport.mtu
        );
        self.state
            .lock()
            .endpoints
            .insert(transport.key(), transport.clone());
        transport
    }

    /// Link two endpoints and report `Connected` on both sides
    pub fn connect(&self, a: &Arc<LoopbackTransport>, b: &Arc<LoopbackTransport>) {
        {
            let mut state = self.state.lock();
            state.links.insert((a.key(), b.key()));
            state.links.insert((b.key(), a.key()));
        }
        info!("Loopback link up: {} <-> {}", a.node, b.node);
        let extra = signal_extra();
        a.notify_status(&b.node, ConnectionStatus::Connected, &extra);
        b.notify_status(&a.node, ConnectionStatus::Connected, &extra);
    }

    /// Unlink two endpoints and report `Disconnected` on both sides.
    ///
    /// Queued deliveries across the link fail when they are processed.
    pub fn disconnect(&self, a: &Arc<LoopbackTransport>, b: &Arc<LoopbackTransport>) {
        let was_linked = {
            let mut state = self.state.lock();
            let forward = state.links.remove(&(a.key(), b.key()));
            let backward = state.links.remove(&(b.key(), a.key()));
            forward || backward
        };
        if !was_linked {
            return;
        }
        info!("Loopback link down: {} <-> {}", a.node, b.node);
        let extra = ExtraInfo::new();
        a.notify_status(&b.node, ConnectionStatus::Disconnected, &extra);
        b.notify_status(&a.node, ConnectionStatus::Disconnected, &extra);
    }

    /// Whether two endpoints are linked
    pub fn is_linked(&self, a: &LoopbackTransport, b: &LoopbackTransport) -> bool {
        self.state.lock().links.contains(&(a.key(), b.key()))
    }

    /// Number of deliveries waiting to be processed
    pub fn pending_deliveries(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Process one queued delivery; `false` when the queue was empty
    pub fn deliver_next(&self) -> bool {
        let (delivery, sender, receiver, linked) = {
            let mut state = self.state.lock();
            let Some(delivery) = state.queue.pop_front() else {
                return false;
            };
            let sender = state.endpoints.get(&delivery.from).cloned();
            let receiver = state.endpoints.get(&delivery.to).cloned();
            let linked = state
                .links
                .contains(&(delivery.from.clone(), delivery.to.clone()));
            (delivery, sender, receiver, linked)
        };

        let Some(sender) = sender else {
            return true;
        };

        let error = match receiver {
            Some(receiver) if linked && !receiver.is_stopped() => {
                if sender.take_injected_failure() {
                    Some("injected failure".to_string())
                } else {
                    trace!(
                        "Loopback {} -> {}: {} bytes",
                        sender.node,
                        receiver.node,
                        delivery.bytes.len()
                    );
                    receiver.notify_received(&delivery.bytes, &sender.node);
                    None
                }
            }
            _ => Some("link down".to_string()),
        };

        let to_node = delivery.to.0.clone();
        let error = error.map(|reason| {
            warn!("Loopback delivery to {} failed: {}", to_node, reason);
            TransportError::Delivery {
                identifier: to_node.clone(),
                reason,
            }
        });
        if error.is_none() {
            sender
                .bytes_sent
                .fetch_add(delivery.bytes.len() as u64, Ordering::Relaxed);
        }
        sender.notify_sent(&delivery.bytes, &to_node, error);
        true
    }

    /// Deliver queued data until nothing is left; returns deliveries processed.
    ///
    /// Deliveries queued by callbacks during the run are processed too.
    pub fn run_until_idle(&self) -> usize {
        let mut processed = 0;
        while self.deliver_next() {
            processed += 1;
        }
        processed
    }

    fn enqueue(&self, from: EndpointKey, to: EndpointKey, bytes: Vec<u8>) -> bool {
        let mut state = self.state.lock();
        if !state.links.contains(&(from.clone(), to.clone())) {
            return false;
        }
        state.queue.push_back(Delivery { from, to, bytes });
        true
    }
}

fn signal_extra() -> ExtraInfo {
    let mut extra = ExtraInfo::new();
    extra.insert(
        EXTRA_SIGNAL_STRENGTH.to_string(),
        Value::from(LOOPBACK_SIGNAL_STRENGTH),
    );
    extra
}

/// One node's endpoint on a [`LoopbackNetwork`]
pub struct LoopbackTransport {
    node: String,
    name: String,
    code: u32,
    mtu: usize,
    network: Weak<LoopbackNetwork>,
    callback: Mutex<Option<Arc<dyn TransportCallback>>>,
    advertising: AtomicBool,
    stopped: AtomicBool,
    failures_to_inject: AtomicUsize,
    bytes_sent: AtomicU64,
}

impl LoopbackTransport {
    /// Identifier remote endpoints see for this node
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Whether `advertise` has been called and the endpoint is not stopped
    pub fn is_advertising(&self) -> bool {
        self.advertising.load(Ordering::Relaxed) && !self.is_stopped()
    }

    /// Whether `stop` has been called
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// Whether a callback is registered
    pub fn has_callback(&self) -> bool {
        self.callback.lock().is_some()
    }

    /// Total bytes successfully delivered from this endpoint
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Fail the next `count` deliveries from this endpoint
    pub fn inject_failures(&self, count: usize) {
        self.failures_to_inject.store(count, Ordering::Relaxed);
    }

    fn take_injected_failure(&self) -> bool {
        self.failures_to_inject
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    fn key(&self) -> EndpointKey {
        (self.node.clone(), self.code)
    }

    fn current_callback(&self) -> Option<Arc<dyn TransportCallback>> {
        self.callback.lock().clone()
    }

    fn notify_status(&self, identifier: &str, status: ConnectionStatus, extra: &ExtraInfo) {
        if let Some(callback) = self.current_callback() {
            callback.identifier_updated(self, identifier, status, extra);
        }
    }

    fn notify_received(&self, data: &[u8], identifier: &str) {
        if let Some(callback) = self.current_callback() {
            callback.data_received(self, data, identifier);
        }
    }

    fn notify_sent(&self, data: &[u8], identifier: &str, error: Option<TransportError>) {
        if let Some(callback) = self.current_callback() {
            callback.data_sent(self, data, identifier, error);
        }
    }
}

impl Transport for LoopbackTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn code(&self) -> u32 {
        self.code
    }

    fn advertise(&self) {
        self.stopped.store(false, Ordering::Relaxed);
        self.advertising.store(true, Ordering::Relaxed);
        debug!("Loopback {} advertising as {}", self.name, self.node);
    }

    fn scan_for_peers(&self) {
        debug!("Loopback {} scanning", self.name);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.advertising.store(false, Ordering::Relaxed);
        self.callback.lock().take();
        debug!("Loopback {} stopped", self.name);
    }

    fn send_data(&self, data: &[u8], identifier: &str) -> bool {
        if self.is_stopped() || data.is_empty() || data.len() > self.mtu {
            return false;
        }
        let Some(network) = self.network.upgrade() else {
            return false;
        };
        network.enqueue(self.key(), (identifier.to_string(), self.code), data.to_vec())
    }

    fn mtu_for_identifier(&self, _identifier: &str) -> usize {
        self.mtu
    }

    fn set_callback(&self, callback: Option<Arc<dyn TransportCallback>>) {
        *self.callback.lock() = callback;
    }
}

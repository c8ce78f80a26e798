//! Session orchestration across transports.
//!
//! The [`SessionManager`] keeps one record per remote identifier holding the
//! identified peer, the reachable routes, and the outgoing serializer and
//! incoming deserializer for that identifier. It runs the identity handshake,
//! elects the preferred route and drives the ack-gated send pump.
//!
//! All record mutation happens under one lock. Work that leaves the manager
//! (transport sends, delegate notifications) is collected as effects while the
//! lock is held and carried out after it is released, so transports and
//! delegates may call back into the manager freely.

use crate::crypto::{LocalPeer, Peer, UNKNOWN_SIGNAL_STRENGTH};
use crate::session::delegate::{DelegateList, SessionDelegate, SessionEvent, SubscriptionId};
use crate::transport::{
    signal_strength, ConnectionStatus, DeserializerEvent, ExtraInfo, Message, MessageDeserializer,
    MessageHeader, MessageKind, MessageSerializer, Transport, TransportCallback,
};
use crate::utils::{PeerlinkError, Result, SessionConfig, SessionError, TransportError};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Handshake state of one identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionPhase {
    /// Reachable, nothing exchanged yet
    Unknown,
    /// Local identity queued, remote identity not yet received
    Identifying,
    /// Remote identity received; application traffic flows
    Identified,
    /// Connection instance ended
    Disconnected,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Snapshot of manager activity
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    /// Identifiers with a live record
    pub identifiers: usize,
    /// Identifiers that completed the handshake
    pub identified: usize,
    /// Messages waiting in serializers
    pub queued_messages: usize,
    /// Messages parked for peers with no live identifier
    pub parked_messages: usize,
    /// Registered transports
    pub transports: usize,
}

struct Route {
    transport: Arc<dyn Transport>,
    mtu: usize,
    registered: u64,
}

/// Chunk handed to a transport and not yet reported back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InFlight {
    code: u32,
    seq: u64,
}

struct SessionRecord {
    identifier: String,
    phase: SessionPhase,
    peer: Option<Peer>,
    routes: HashMap<u32, Route>,
    preferred: Option<u32>,
    elected: Option<u32>,
    serializer: MessageSerializer,
    deserializer: MessageDeserializer,
    incoming: Option<MessageHeader>,
    identity_queued: bool,
    in_flight: Option<InFlight>,
    /// Transport that last carried outgoing bytes
    sending_on: Option<u32>,
    /// Transport that last delivered incoming bytes
    receiving_on: Option<u32>,
    default_mtu: usize,
    signal_strength: i32,
}

impl SessionRecord {
    fn new(identifier: &str, config: &SessionConfig) -> Self {
        debug!("New session record for {}", identifier);
        Self {
            identifier: identifier.to_string(),
            phase: SessionPhase::Unknown,
            peer: None,
            routes: HashMap::new(),
            preferred: None,
            elected: None,
            serializer: MessageSerializer::new(),
            deserializer: MessageDeserializer::new(config),
            incoming: None,
            identity_queued: false,
            in_flight: None,
            sending_on: None,
            receiving_on: None,
            default_mtu: config.default_mtu.max(1),
            signal_strength: UNKNOWN_SIGNAL_STRENGTH,
        }
    }

    fn add_route(&mut self, transport: Arc<dyn Transport>, registered: u64) {
        let code = transport.code();
        let mut mtu = transport.mtu_for_identifier(&self.identifier);
        if mtu == 0 {
            warn!(
                "{} reports no MTU for {}; assuming {}",
                transport.name(),
                self.identifier,
                self.default_mtu
            );
            mtu = self.default_mtu;
        }
        debug!(
            "Route to {} via {} (code {}, mtu {})",
            self.identifier,
            transport.name(),
            code,
            mtu
        );
        self.routes.insert(
            code,
            Route {
                transport,
                mtu,
                registered,
            },
        );
    }

    /// Explicit election wins while its route is alive; otherwise the largest
    /// MTU, ties going to the most recently registered route.
    fn elect(&mut self) {
        if let Some(code) = self.elected {
            if !self.routes.contains_key(&code) {
                self.elected = None;
            }
        }
        let choice = self.elected.or_else(|| {
            self.routes
                .iter()
                .max_by(|(_, a), (_, b)| {
                    a.mtu
                        .cmp(&b.mtu)
                        .then(a.registered.cmp(&b.registered))
                })
                .map(|(code, _)| *code)
        });
        if choice != self.preferred {
            if let Some(route) = choice.and_then(|code| self.routes.get(&code)) {
                info!(
                    "Preferred transport for {} is now {} (code {})",
                    self.identifier,
                    route.transport.name(),
                    route.transport.code()
                );
            }
            self.preferred = choice;
        }
    }

    fn queue_identity(&mut self, local: &Peer) {
        if self.identity_queued {
            return;
        }
        self.serializer
            .enqueue_front(Arc::new(Message::identity(local)));
        self.identity_queued = true;
        if self.phase == SessionPhase::Unknown {
            self.phase = SessionPhase::Identifying;
        }
    }

    /// Push the chunk at the serializer cursor if nothing is in flight
    fn pump(&mut self, effects: &mut Vec<Effect>) {
        if self.in_flight.is_some() {
            return;
        }
        let Some((transport, mtu)) = self
            .preferred
            .and_then(|code| self.routes.get(&code))
            .map(|route| (route.transport.clone(), route.mtu))
        else {
            return;
        };

        loop {
            match self.serializer.get_next_chunk(mtu) {
                Ok(Some(chunk)) => {
                    let code = transport.code();
                    self.in_flight = Some(InFlight {
                        code,
                        seq: chunk.seq,
                    });
                    self.sending_on = Some(code);
                    effects.push(Effect::Send {
                        transport,
                        identifier: self.identifier.clone(),
                        bytes: chunk.bytes,
                    });
                    return;
                }
                Ok(None) => return,
                Err(err) => {
                    let Some(message) = self.serializer.skip_current() else {
                        return;
                    };
                    warn!("Dropping outgoing {} to {}: {}", message, self.identifier, err);
                    if let Some(event) = self.sent_event(message, Some(err)) {
                        effects.push(Effect::Emit(event));
                    }
                }
            }
        }
    }

    fn sent_event(
        &self,
        message: Arc<Message>,
        error: Option<PeerlinkError>,
    ) -> Option<SessionEvent> {
        if message.header().is_identity() {
            return None;
        }
        let recipient = self.peer.clone()?;
        Some(SessionEvent::MessageSent {
            message,
            recipient,
            error,
        })
    }

    /// Tear the record down, reporting the peer and its unsent messages
    fn close(mut self, error: PeerlinkError, effects: &mut Vec<Effect>) {
        self.phase = SessionPhase::Disconnected;
        self.deserializer.reset();
        let unsent = self.serializer.drain();
        if let Some(peer) = &self.peer {
            info!("Peer disconnected: {} ({})", peer, self.identifier);
            effects.push(Effect::Emit(SessionEvent::PeerStatusUpdated {
                peer: peer.clone(),
                status: ConnectionStatus::Disconnected,
            }));
        }
        for message in unsent {
            if let Some(event) = self.sent_event(message, Some(error.clone())) {
                effects.push(Effect::Emit(event));
            }
        }
    }
}

type ParkedMessage = (Arc<Message>, Peer);

#[derive(Default)]
struct SessionTable {
    records: HashMap<String, SessionRecord>,
    parked: HashMap<Vec<u8>, VecDeque<ParkedMessage>>,
    route_seq: u64,
    stopped: bool,
}

enum Effect {
    Send {
        transport: Arc<dyn Transport>,
        identifier: String,
        bytes: Vec<u8>,
    },
    Emit(SessionEvent),
}

/// Orchestrates identity handshakes and message transfer over transports
pub struct SessionManager {
    local: LocalPeer,
    config: SessionConfig,
    transports: Mutex<HashMap<u32, Arc<dyn Transport>>>,
    table: Mutex<SessionTable>,
    delegates: DelegateList,
}

impl SessionManager {
    /// Create a manager for `local`
    pub fn new(local: LocalPeer, config: SessionConfig) -> Arc<Self> {
        info!("Session manager for {}", local.peer());
        Arc::new(Self {
            local,
            config,
            transports: Mutex::new(HashMap::new()),
            table: Mutex::new(SessionTable::default()),
            delegates: DelegateList::new(),
        })
    }

    /// The local identity announced to peers
    pub fn local_peer(&self) -> &LocalPeer {
        &self.local
    }

    /// Session tuning in effect
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register a transport and install this manager as its callback.
    ///
    /// A transport with the same code replaces the previous one.
    pub fn register_transport(self: &Arc<Self>, transport: Arc<dyn Transport>) {
        let code = transport.code();
        transport.set_callback(Some(self.clone() as Arc<dyn TransportCallback>));
        if let Some(previous) = self.transports.lock().insert(code, transport.clone()) {
            warn!(
                "Transport {} replaces {} for code {}",
                transport.name(),
                previous.name(),
                code
            );
            previous.set_callback(None);
        }
        debug!("Registered transport {} (code {})", transport.name(), code);
    }

    /// Advertise and scan on every registered transport
    pub fn start(self: &Arc<Self>) {
        self.table.lock().stopped = false;
        let transports = self.registered_transports();
        for transport in &transports {
            transport.set_callback(Some(self.clone() as Arc<dyn TransportCallback>));
            transport.advertise();
            transport.scan_for_peers();
        }
        info!("Session manager started on {} transport(s)", transports.len());
    }

    /// Stop every transport and drop all session state.
    ///
    /// Partial incoming bodies are discarded; queued and parked messages are
    /// reported as failed.
    pub fn stop(&self) {
        for transport in self.registered_transports() {
            transport.stop();
        }

        let mut effects = Vec::new();
        {
            let mut table = self.table.lock();
            table.stopped = true;
            for (_, record) in table.records.drain() {
                record.close(SessionError::Stopped.into(), &mut effects);
            }
            for (_, parked) in table.parked.drain() {
                for (message, recipient) in parked {
                    effects.push(Effect::Emit(SessionEvent::MessageSent {
                        message,
                        recipient,
                        error: Some(SessionError::Stopped.into()),
                    }));
                }
            }
        }
        info!("Session manager stopped");
        self.execute(effects);
    }

    /// Subscribe to session events
    pub fn subscribe(&self, delegate: Arc<dyn SessionDelegate>) -> SubscriptionId {
        self.delegates.subscribe(delegate)
    }

    /// Remove a subscription; `false` if it was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.delegates.unsubscribe(id)
    }

    /// Queue `message` for `peer`.
    ///
    /// With no live identifier for the peer the message is parked and starts
    /// moving once the peer completes a handshake.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Stopped` after [`SessionManager::stop`]
    pub fn send_message(&self, message: Arc<Message>, peer: &Peer) -> Result<()> {
        let mut effects = Vec::new();
        {
            let mut table = self.table.lock();
            if table.stopped {
                return Err(SessionError::Stopped.into());
            }

            match Self::identifier_for(&table, peer) {
                Some(identifier) => {
                    if let Some(record) = table.records.get_mut(&identifier) {
                        record.serializer.enqueue(message);
                        record.pump(&mut effects);
                    }
                }
                None => {
                    let reason = SessionError::NoReachableTransport {
                        identifier: peer.fingerprint(),
                    };
                    debug!("Parking {} for {}: {}", message, peer, reason);
                    table
                        .parked
                        .entry(peer.public_key().to_vec())
                        .or_default()
                        .push_back((message, peer.clone()));
                }
            }
        }
        self.execute(effects);
        Ok(())
    }

    /// Ask `peer` to move to the transport with `code`, and move locally too
    pub fn send_transport_upgrade(&self, peer: &Peer, code: u32) -> Result<()> {
        {
            let mut table = self.table.lock();
            if let Some(identifier) = Self::identifier_for(&table, peer) {
                if let Some(record) = table.records.get_mut(&identifier) {
                    Self::elect_transport(record, code);
                }
            }
        }
        self.send_message(Arc::new(Message::transport_upgrade(code)), peer)
    }

    /// Peers that completed the handshake on a live identifier
    pub fn available_peers(&self) -> Vec<Peer> {
        let table = self.table.lock();
        let mut peers: Vec<Peer> = Vec::new();
        for peer in table.records.values().filter_map(|r| r.peer.as_ref()) {
            if !peers.contains(peer) {
                peers.push(peer.clone());
            }
        }
        peers
    }

    /// Peer identified on `identifier`
    pub fn peer_for_identifier(&self, identifier: &str) -> Option<Peer> {
        self.table
            .lock()
            .records
            .get(identifier)
            .and_then(|record| record.peer.clone())
    }

    /// Handshake phase of `identifier`; `None` when no record exists
    pub fn phase_for_identifier(&self, identifier: &str) -> Option<SessionPhase> {
        self.table
            .lock()
            .records
            .get(identifier)
            .map(|record| record.phase)
    }

    /// Code of the transport currently preferred for `identifier`
    pub fn preferred_transport_code(&self, identifier: &str) -> Option<u32> {
        self.table
            .lock()
            .records
            .get(identifier)
            .and_then(|record| record.preferred)
    }

    /// Activity snapshot
    pub fn stats(&self) -> SessionStats {
        let transports = self.transports.lock().len();
        let table = self.table.lock();
        SessionStats {
            identifiers: table.records.len(),
            identified: table
                .records
                .values()
                .filter(|r| r.phase == SessionPhase::Identified)
                .count(),
            queued_messages: table.records.values().map(|r| r.serializer.len()).sum(),
            parked_messages: table.parked.values().map(VecDeque::len).sum(),
            transports,
        }
    }

    fn registered_transports(&self) -> Vec<Arc<dyn Transport>> {
        self.transports.lock().values().cloned().collect()
    }

    fn registered(&self, transport: &dyn Transport) -> Option<Arc<dyn Transport>> {
        let found = self.transports.lock().get(&transport.code()).cloned();
        if found.is_none() {
            warn!(
                "Ignoring report from unregistered transport {} (code {})",
                transport.name(),
                transport.code()
            );
        }
        found
    }

    /// Identified identifier for `peer`, preferring one with a usable route
    fn identifier_for(table: &SessionTable, peer: &Peer) -> Option<String> {
        let mut candidates = table
            .records
            .values()
            .filter(|record| record.peer.as_ref() == Some(peer));
        let first = candidates.next()?;
        if first.preferred.is_some() {
            return Some(first.identifier.clone());
        }
        Some(
            candidates
                .find(|record| record.preferred.is_some())
                .unwrap_or(first)
                .identifier
                .clone(),
        )
    }

    fn elect_transport(record: &mut SessionRecord, code: u32) {
        if record.routes.contains_key(&code) {
            record.elected = Some(code);
            record.elect();
        } else {
            warn!(
                "Cannot move {} to transport code {}: not reachable there",
                record.identifier, code
            );
        }
    }

    fn execute(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Emit(event) => self.delegates.dispatch(&event),
                Effect::Send {
                    transport,
                    identifier,
                    bytes,
                } => {
                    if transport.send_data(&bytes, &identifier) {
                        continue;
                    }
                    warn!(
                        "{}",
                        TransportError::SendRejected {
                            identifier: identifier.clone()
                        }
                    );
                    let mut table = self.table.lock();
                    if let Some(record) = table.records.get_mut(&identifier) {
                        if record.in_flight.map(|flight| flight.code) == Some(transport.code()) {
                            record.in_flight = None;
                        }
                    }
                }
            }
        }
    }

    fn handle_incoming(
        &self,
        table: &mut SessionTable,
        identifier: &str,
        event: DeserializerEvent,
        effects: &mut Vec<Effect>,
    ) {
        let Some(record) = table.records.get_mut(identifier) else {
            return;
        };

        match event {
            DeserializerEvent::HeaderReady(header) => {
                let reportable = !matches!(
                    header.kind(),
                    MessageKind::Identity { .. } | MessageKind::TransportUpgrade { .. }
                );
                if let (true, Some(sender)) = (reportable, record.peer.clone()) {
                    effects.push(Effect::Emit(SessionEvent::MessageReceiving {
                        header: header.clone(),
                        sender,
                        progress: 0.0,
                    }));
                    record.incoming = Some(header);
                }
            }
            DeserializerEvent::BodyProgress { id, progress } => {
                if let (Some(header), Some(sender)) = (&record.incoming, &record.peer) {
                    if header.id() == id {
                        effects.push(Effect::Emit(SessionEvent::MessageReceiving {
                            header: header.clone(),
                            sender: sender.clone(),
                            progress,
                        }));
                    }
                }
            }
            DeserializerEvent::Complete(Err(err)) => {
                record.incoming = None;
                warn!("Incoming message from {} failed: {}", identifier, err);
            }
            DeserializerEvent::Complete(Ok(message)) => {
                record.incoming = None;
                match message.kind() {
                    MessageKind::Identity { alias, public_key } => {
                        let peer =
                            Peer::new(public_key.clone(), alias.clone(), record.signal_strength);
                        self.complete_handshake(table, identifier, peer, effects);
                    }
                    _ => {
                        let Some(sender) = record.peer.clone() else {
                            warn!(
                                "Dropping {}: {}",
                                message,
                                SessionError::UnidentifiedSender {
                                    identifier: identifier.to_string()
                                }
                            );
                            return;
                        };
                        if let MessageKind::TransportUpgrade { transport_code } = message.kind() {
                            debug!("{} asked for transport code {}", sender, transport_code);
                            Self::elect_transport(record, *transport_code);
                            record.pump(effects);
                        } else {
                            trace!("Received {} from {}", message, sender);
                            effects.push(Effect::Emit(SessionEvent::MessageReceived {
                                message: message.clone(),
                                sender,
                            }));
                        }
                    }
                }
            }
        }
    }

    fn complete_handshake(
        &self,
        table: &mut SessionTable,
        identifier: &str,
        peer: Peer,
        effects: &mut Vec<Effect>,
    ) {
        let Some(record) = table.records.get_mut(identifier) else {
            return;
        };

        match record.peer.replace(peer.clone()) {
            Some(previous) if previous == peer => {
                debug!("{} re-announced on {}", peer, identifier);
            }
            Some(previous) => {
                warn!(
                    "{} changed identity from {} to {}",
                    identifier, previous, peer
                );
                effects.push(Effect::Emit(SessionEvent::PeerStatusUpdated {
                    peer: previous,
                    status: ConnectionStatus::Disconnected,
                }));
                effects.push(Effect::Emit(SessionEvent::PeerStatusUpdated {
                    peer: peer.clone(),
                    status: ConnectionStatus::Connected,
                }));
            }
            None => {
                info!("Peer connected: {} ({})", peer, identifier);
                effects.push(Effect::Emit(SessionEvent::PeerStatusUpdated {
                    peer: peer.clone(),
                    status: ConnectionStatus::Connected,
                }));
            }
        }
        record.phase = SessionPhase::Identified;
        record.queue_identity(self.local.peer());

        if let Some(parked) = table.parked.remove(peer.public_key()) {
            debug!("Releasing {} parked message(s) for {}", parked.len(), peer);
            for (message, _) in parked {
                record.serializer.enqueue(message);
            }
        }
        record.pump(effects);
    }

    fn route_connected(
        &self,
        transport: Arc<dyn Transport>,
        identifier: &str,
        extra: &ExtraInfo,
        effects: &mut Vec<Effect>,
    ) {
        let mut table = self.table.lock();
        if table.stopped {
            return;
        }
        table.route_seq += 1;
        let registered = table.route_seq;
        let record = table
            .records
            .entry(identifier.to_string())
            .or_insert_with(|| SessionRecord::new(identifier, &self.config));

        if let Some(rssi) = signal_strength(extra) {
            record.signal_strength = rssi;
            if let Some(peer) = &record.peer {
                record.peer = Some(peer.observed(rssi));
            }
        }
        record.add_route(transport, registered);
        record.elect();
        record.queue_identity(self.local.peer());
        record.pump(effects);
    }

    fn route_disconnected(&self, code: u32, identifier: &str, effects: &mut Vec<Effect>) {
        let mut table = self.table.lock();
        let Some(record) = table.records.get_mut(identifier) else {
            return;
        };
        if record.routes.remove(&code).is_none() {
            return;
        }
        debug!("Route to {} via code {} lost", identifier, code);

        if record.routes.is_empty() {
            if let Some(record) = table.records.remove(identifier) {
                record.close(
                    SessionError::Disconnected {
                        identifier: identifier.to_string(),
                    }
                    .into(),
                    effects,
                );
            }
            return;
        }

        // Only a stream that was running over the lost route can have been cut
        record.elect();
        if record.receiving_on == Some(code) {
            record.deserializer.reset();
            record.incoming = None;
            record.receiving_on = None;
        }
        let carried_outgoing = record.sending_on == Some(code)
            || record.in_flight.map(|flight| flight.code) == Some(code);
        if carried_outgoing {
            record.serializer.rewind();
            record.in_flight = None;
            record.sending_on = None;
        }
        record.pump(effects);
    }
}

impl TransportCallback for SessionManager {
    fn data_received(&self, transport: &dyn Transport, data: &[u8], identifier: &str) {
        let Some(registered) = self.registered(transport) else {
            return;
        };

        let mut effects = Vec::new();
        {
            let mut table = self.table.lock();
            if table.stopped {
                return;
            }
            if !table.records.contains_key(identifier) {
                table.route_seq += 1;
                let seq = table.route_seq;
                let mut record = SessionRecord::new(identifier, &self.config);
                record.add_route(registered, seq);
                record.elect();
                table.records.insert(identifier.to_string(), record);
            }

            let events = match table.records.get_mut(identifier) {
                Some(record) => {
                    record.receiving_on = Some(transport.code());
                    record.deserializer.receive(data)
                }
                None => Vec::new(),
            };
            for event in events {
                self.handle_incoming(&mut table, identifier, event, &mut effects);
            }
        }
        self.execute(effects);
    }

    fn data_sent(
        &self,
        transport: &dyn Transport,
        data: &[u8],
        identifier: &str,
        error: Option<TransportError>,
    ) {
        let mut effects = Vec::new();
        {
            let mut table = self.table.lock();
            let Some(record) = table.records.get_mut(identifier) else {
                return;
            };
            let Some(flight) = record
                .in_flight
                .filter(|flight| flight.code == transport.code())
                .filter(|flight| record.serializer.is_pending(flight.seq, data))
            else {
                trace!("Stale delivery report from {} for {}", transport.name(), identifier);
                return;
            };
            record.in_flight = None;

            if let Some(err) = error {
                warn!("{}; chunk will be retried", err);
                return;
            }

            if let Some(ack) = record.serializer.ack_chunk_delivery(flight.seq) {
                trace!(
                    "Chunk {} of {} delivered to {} ({:.3})",
                    ack.seq,
                    ack.message.id(),
                    identifier,
                    ack.progress
                );
                if let (false, Some(recipient)) =
                    (ack.message.header().is_identity(), record.peer.clone())
                {
                    effects.push(Effect::Emit(SessionEvent::MessageSending {
                        message: ack.message.clone(),
                        recipient,
                        progress: ack.progress,
                    }));
                    if ack.complete {
                        if let Some(event) = record.sent_event(ack.message, None) {
                            effects.push(Effect::Emit(event));
                        }
                    }
                }
            }
            record.pump(&mut effects);
        }
        self.execute(effects);
    }

    fn identifier_updated(
        &self,
        transport: &dyn Transport,
        identifier: &str,
        status: ConnectionStatus,
        extra: &ExtraInfo,
    ) {
        let mut effects = Vec::new();
        match status {
            ConnectionStatus::Connected => {
                let Some(registered) = self.registered(transport) else {
                    return;
                };
                self.route_connected(registered, identifier, extra, &mut effects);
            }
            ConnectionStatus::Connecting => {
                debug!("{} connecting via {}", identifier, transport.name());
            }
            ConnectionStatus::Disconnected => {
                self.route_disconnected(transport.code(), identifier, &mut effects);
            }
        }
        self.execute(effects);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::delegate::Subscription;
    use crate::transport::{LoopbackNetwork, LoopbackTransport};
    use rand::Rng;
    use serde_json::Map;

    struct Node {
        manager: Arc<SessionManager>,
        events: Arc<Mutex<Vec<SessionEvent>>>,
    }

    impl Node {
        fn new(alias: &str) -> Self {
            Self::with_config(alias, SessionConfig::default())
        }

        fn with_config(alias: &str, config: SessionConfig) -> Self {
            let manager = SessionManager::new(LocalPeer::generate(alias), config);
            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = events.clone();
            manager.subscribe(Arc::new(move |event: &SessionEvent| {
                sink.lock().push(event.clone());
                Subscription::Keep
            }));
            Self { manager, events }
        }

        fn peer(&self) -> Peer {
            self.manager.local_peer().peer().clone()
        }

        fn connects(&self) -> usize {
            self.status_count(ConnectionStatus::Connected)
        }

        fn status_count(&self, wanted: ConnectionStatus) -> usize {
            self.events
                .lock()
                .iter()
                .filter(|e| {
                    matches!(e, SessionEvent::PeerStatusUpdated { status, .. } if *status == wanted)
                })
                .count()
        }

        fn received(&self) -> Vec<Arc<Message>> {
            self.events
                .lock()
                .iter()
                .filter_map(|e| match e {
                    SessionEvent::MessageReceived { message, .. } => Some(message.clone()),
                    _ => None,
                })
                .collect()
        }

        fn sent_errors(&self) -> Vec<Option<PeerlinkError>> {
            self.events
                .lock()
                .iter()
                .filter_map(|e| match e {
                    SessionEvent::MessageSent { error, .. } => Some(error.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    fn link(
        network: &Arc<LoopbackNetwork>,
        a: &Node,
        b: &Node,
        code: u32,
        mtu: usize,
    ) -> (Arc<LoopbackTransport>, Arc<LoopbackTransport>) {
        let ta = network.endpoint("node-a", format!("loop-{}", code), code, mtu);
        let tb = network.endpoint("node-b", format!("loop-{}", code), code, mtu);
        a.manager.register_transport(ta.clone());
        b.manager.register_transport(tb.clone());
        (ta, tb)
    }

    fn handshake(mtu: usize) -> (Arc<LoopbackNetwork>, Node, Node, Arc<LoopbackTransport>, Arc<LoopbackTransport>) {
        let network = LoopbackNetwork::new();
        let a = Node::new("alice");
        let b = Node::new("dbro");
        let (ta, tb) = link(&network, &a, &b, 1, mtu);
        network.connect(&ta, &tb);
        network.run_until_idle();
        (network, a, b, ta, tb)
    }

    #[test]
    fn test_handshake_symmetry() {
        let (_network, a, b, _ta, _tb) = handshake(20);

        assert_eq!(a.manager.phase_for_identifier("node-b"), Some(SessionPhase::Identified));
        assert_eq!(b.manager.phase_for_identifier("node-a"), Some(SessionPhase::Identified));

        let seen_by_a = a.manager.peer_for_identifier("node-b").unwrap();
        assert_eq!(seen_by_a.alias(), "dbro");
        assert_eq!(seen_by_a.public_key(), b.manager.local_peer().public_key());
        let seen_by_b = b.manager.peer_for_identifier("node-a").unwrap();
        assert_eq!(seen_by_b.alias(), "alice");
        assert_eq!(seen_by_b, a.peer());

        assert_eq!(a.connects(), 1);
        assert_eq!(b.connects(), 1);
        // Identity traffic stays internal
        assert!(a.received().is_empty());
        assert!(a.sent_errors().is_empty());
        assert_eq!(a.manager.available_peers(), vec![b.peer()]);
    }

    #[test]
    fn test_one_sided_connect_still_completes() {
        let network = LoopbackNetwork::new();
        let a = Node::new("alice");
        let b = Node::new("bob");
        let (ta, tb) = link(&network, &a, &b, 1, 64);

        // Only alice learns about the link; bob answers once alice's identity lands
        b.manager.transports.lock().clear();
        tb.set_callback(None);
        network.connect(&ta, &tb);
        b.manager.register_transport(tb.clone());
        network.run_until_idle();

        assert_eq!(a.manager.phase_for_identifier("node-b"), Some(SessionPhase::Identified));
        assert_eq!(b.manager.phase_for_identifier("node-a"), Some(SessionPhase::Identified));
        assert_eq!(a.connects(), 1);
        assert_eq!(b.connects(), 1);
    }

    #[test]
    fn test_large_transfer_at_small_mtu() {
        let (network, a, b, _ta, _tb) = handshake(20);
        let mut payload = vec![0u8; 16_000];
        rand::thread_rng().fill(&mut payload[..]);

        let message = Arc::new(Message::data(payload.clone(), Map::new()));
        a.manager.send_message(message.clone(), &b.peer()).unwrap();
        network.run_until_idle();

        let received = b.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id(), message.id());
        assert_eq!(received[0].body_bytes().unwrap(), payload);

        let sending: Vec<f32> = a
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::MessageSending { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect();
        assert!(sending.len() >= 800);
        assert!(sending.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*sending.last().unwrap(), 1.0);
        assert!(matches!(a.sent_errors().as_slice(), [None]));

        let receiving: Vec<f32> = b
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SessionEvent::MessageReceiving { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect();
        assert!(receiving.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(receiving.iter().filter(|p| **p == 1.0).count(), 1);
    }

    #[test]
    fn test_unidentified_sender_is_dropped() {
        let network = LoopbackNetwork::new();
        let a = Node::new("alice");
        let ta = network.endpoint("node-a", "loop", 1, 50);
        let rogue = network.endpoint("mallory", "loop", 1, 50);
        a.manager.register_transport(ta.clone());
        network.connect(&ta, &rogue);

        let bytes = Message::data(b"sneaky".to_vec(), Map::new()).to_bytes().unwrap();
        for chunk in bytes.chunks(50) {
            assert!(rogue.send_data(chunk, "node-a"));
        }
        network.run_until_idle();

        assert!(a.received().is_empty());
        assert_eq!(a.connects(), 0);
        assert_eq!(a.manager.phase_for_identifier("mallory"), Some(SessionPhase::Identifying));
        assert!(a.manager.peer_for_identifier("mallory").is_none());
    }

    #[test]
    fn test_disconnect_cleans_up() {
        let (network, a, b, ta, tb) = handshake(20);

        let message = Arc::new(Message::data(vec![1; 2000], Map::new()));
        a.manager.send_message(message, &b.peer()).unwrap();
        for _ in 0..10 {
            network.deliver_next();
        }
        network.disconnect(&ta, &tb);
        network.run_until_idle();

        assert_eq!(a.status_count(ConnectionStatus::Disconnected), 1);
        assert_eq!(b.status_count(ConnectionStatus::Disconnected), 1);
        assert_eq!(a.manager.phase_for_identifier("node-b"), None);
        assert_eq!(b.manager.phase_for_identifier("node-a"), None);
        assert!(a.manager.available_peers().is_empty());
        assert!(b.received().is_empty());

        let errors = a.sent_errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors[0],
            Some(PeerlinkError::Session(SessionError::Disconnected { .. }))
        ));
    }

    #[test]
    fn test_reconnect_is_a_new_connection() {
        let (network, a, b, ta, tb) = handshake(40);
        network.disconnect(&ta, &tb);
        network.connect(&ta, &tb);
        network.run_until_idle();

        assert_eq!(a.connects(), 2);
        assert_eq!(b.connects(), 2);
        assert_eq!(a.manager.phase_for_identifier("node-b"), Some(SessionPhase::Identified));
    }

    #[test]
    fn test_parked_messages_flush_after_handshake() {
        let network = LoopbackNetwork::new();
        let a = Node::new("alice");
        let b = Node::new("bob");
        let (ta, tb) = link(&network, &a, &b, 1, 30);

        let first = Arc::new(Message::data(b"first".to_vec(), Map::new()));
        let second = Arc::new(Message::data(b"second".to_vec(), Map::new()));
        a.manager.send_message(first.clone(), &b.peer()).unwrap();
        a.manager.send_message(second.clone(), &b.peer()).unwrap();
        assert_eq!(a.manager.stats().parked_messages, 2);

        network.connect(&ta, &tb);
        network.run_until_idle();

        let ids: Vec<String> = b.received().iter().map(|m| m.id().to_string()).collect();
        assert_eq!(ids, vec![first.id().to_string(), second.id().to_string()]);
        assert_eq!(a.manager.stats().parked_messages, 0);
    }

    #[test]
    fn test_preferred_route_and_upgrade_election() {
        let network = LoopbackNetwork::new();
        let a = Node::new("alice");
        let b = Node::new("bob");
        let (slow_a, slow_b) = link(&network, &a, &b, 1, 20);
        let (fast_a, fast_b) = link(&network, &a, &b, 2, 100);
        network.connect(&slow_a, &slow_b);
        network.connect(&fast_a, &fast_b);
        network.run_until_idle();

        assert_eq!(a.manager.preferred_transport_code("node-b"), Some(2));
        assert_eq!(b.manager.preferred_transport_code("node-a"), Some(2));

        a.manager.send_transport_upgrade(&b.peer(), 1).unwrap();
        network.run_until_idle();
        assert_eq!(a.manager.preferred_transport_code("node-b"), Some(1));
        assert_eq!(b.manager.preferred_transport_code("node-a"), Some(1));
        // Upgrades are not application messages
        assert!(b.received().is_empty());

        // Election of an unreachable code is ignored
        a.manager.send_transport_upgrade(&b.peer(), 9).unwrap();
        network.run_until_idle();
        assert_eq!(b.manager.preferred_transport_code("node-a"), Some(1));
    }

    #[test]
    fn test_route_loss_reelects_and_resumes() {
        let network = LoopbackNetwork::new();
        let a = Node::new("alice");
        let b = Node::new("bob");
        let (slow_a, slow_b) = link(&network, &a, &b, 1, 20);
        let (fast_a, fast_b) = link(&network, &a, &b, 2, 100);
        network.connect(&slow_a, &slow_b);
        network.connect(&fast_a, &fast_b);
        network.run_until_idle();

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
        a.manager
            .send_message(Arc::new(Message::data(payload.clone(), Map::new())), &b.peer())
            .unwrap();
        for _ in 0..7 {
            network.deliver_next();
        }
        network.disconnect(&fast_a, &fast_b);
        network.run_until_idle();

        assert_eq!(a.manager.preferred_transport_code("node-b"), Some(1));
        assert_eq!(a.status_count(ConnectionStatus::Disconnected), 0);
        let received = b.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body_bytes().unwrap(), payload);
    }

    #[test]
    fn test_idle_route_loss_keeps_stream_on_preferred() {
        let network = LoopbackNetwork::new();
        let a = Node::new("alice");
        let b = Node::new("bob");
        let (slow_a, slow_b) = link(&network, &a, &b, 1, 20);
        let (fast_a, fast_b) = link(&network, &a, &b, 2, 100);
        network.connect(&slow_a, &slow_b);
        network.connect(&fast_a, &fast_b);
        network.run_until_idle();
        assert_eq!(a.manager.preferred_transport_code("node-b"), Some(2));

        let message = Arc::new(Message::data(vec![0x01; 5000], Map::new()));
        a.manager.send_message(message.clone(), &b.peer()).unwrap();
        for _ in 0..7 {
            network.deliver_next();
        }
        network.disconnect(&slow_a, &slow_b);
        network.run_until_idle();

        assert_eq!(a.manager.preferred_transport_code("node-b"), Some(2));
        assert!(matches!(a.sent_errors().as_slice(), [None]));
        let received = b.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id(), message.id());
        assert_eq!(received[0].body_bytes().unwrap(), vec![0x01; 5000]);
        assert_eq!(
            b.manager.phase_for_identifier("node-a"),
            Some(SessionPhase::Identified)
        );
    }

    struct NoMtu(Arc<LoopbackTransport>);

    impl Transport for NoMtu {
        fn name(&self) -> &str {
            self.0.name()
        }
        fn code(&self) -> u32 {
            self.0.code()
        }
        fn advertise(&self) {
            self.0.advertise();
        }
        fn scan_for_peers(&self) {
            self.0.scan_for_peers();
        }
        fn stop(&self) {
            self.0.stop();
        }
        fn send_data(&self, data: &[u8], identifier: &str) -> bool {
            self.0.send_data(data, identifier)
        }
        fn mtu_for_identifier(&self, _identifier: &str) -> usize {
            0
        }
        fn set_callback(&self, callback: Option<Arc<dyn TransportCallback>>) {
            self.0.set_callback(callback);
        }
    }

    #[test]
    fn test_zero_mtu_falls_back_to_default() {
        let network = LoopbackNetwork::new();
        let a = Node::new("alice");
        let b = Node::new("bob");
        let ta = network.endpoint("node-a", "quiet", 1, 500);
        let tb = network.endpoint("node-b", "quiet", 1, 500);
        a.manager.register_transport(Arc::new(NoMtu(ta.clone())));
        b.manager.register_transport(tb.clone());
        network.connect(&ta, &tb);
        network.run_until_idle();

        let message = Arc::new(Message::data(vec![9; 1000], Map::new()));
        a.manager.send_message(message.clone(), &b.peer()).unwrap();
        let deliveries = network.run_until_idle();

        assert!(matches!(a.sent_errors().as_slice(), [None]));
        assert_eq!(b.received().len(), 1);
        assert_eq!(b.received()[0].id(), message.id());
        // Chunks were cut at the configured default, not at one byte
        let default_mtu = a.manager.config().default_mtu;
        assert!(deliveries < 1000);
        assert!(deliveries >= message.total_length().unwrap() as usize / default_mtu);
    }

    #[test]
    fn test_failed_chunk_is_retried_on_next_trigger() {
        let (network, a, b, ta, _tb) = handshake(25);
        ta.inject_failures(1);

        let first = Arc::new(Message::data(vec![4; 60], Map::new()));
        a.manager.send_message(first.clone(), &b.peer()).unwrap();
        network.run_until_idle();
        assert!(b.received().is_empty());

        let second = Arc::new(Message::data(vec![5; 10], Map::new()));
        a.manager.send_message(second.clone(), &b.peer()).unwrap();
        network.run_until_idle();

        let received = b.received();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].body_bytes().unwrap(), vec![4; 60]);
        assert_eq!(received[1].id(), second.id());
    }

    #[test]
    fn test_delegate_unsubscribes_itself() {
        let (network, a, b, _ta, _tb) = handshake(64);
        let calls = Arc::new(Mutex::new(0usize));
        let counter = calls.clone();
        b.manager.subscribe(Arc::new(move |_: &SessionEvent| {
            *counter.lock() += 1;
            Subscription::Unsubscribe
        }));
        let explicit = b.manager.subscribe(Arc::new(|_: &SessionEvent| Subscription::Keep));
        assert!(b.manager.unsubscribe(explicit));

        for _ in 0..3 {
            a.manager
                .send_message(Arc::new(Message::data(vec![1; 5], Map::new())), &b.peer())
                .unwrap();
        }
        network.run_until_idle();

        assert_eq!(*calls.lock(), 1);
        assert_eq!(b.received().len(), 3);
    }

    #[test]
    fn test_delegate_may_send_from_callback() {
        let (network, a, b, _ta, _tb) = handshake(64);
        let responder = b.manager.clone();
        b.manager.subscribe(Arc::new(move |event: &SessionEvent| {
            if let SessionEvent::MessageReceived { message, sender } = event {
                if message.body_bytes().unwrap_or_default() == b"ping" {
                    let reply = Arc::new(Message::data(b"pong".to_vec(), Map::new()));
                    responder.send_message(reply, sender).unwrap();
                }
            }
            Subscription::Keep
        }));

        a.manager
            .send_message(Arc::new(Message::data(b"ping".to_vec(), Map::new())), &b.peer())
            .unwrap();
        network.run_until_idle();

        let replies = a.received();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].body_bytes().unwrap(), b"pong");
    }

    #[test]
    fn test_large_incoming_body_spools() {
        let spool = tempfile::tempdir().unwrap();
        let config = SessionConfig {
            body_spool_cutoff: 1000,
            spool_dir: Some(spool.path().to_path_buf()),
            ..SessionConfig::default()
        };
        let network = LoopbackNetwork::new();
        let a = Node::new("alice");
        let b = Node::with_config("bob", config);
        let (ta, tb) = link(&network, &a, &b, 1, 180);
        network.connect(&ta, &tb);

        let payload = vec![0x5Au8; 20_000];
        a.manager
            .send_message(Arc::new(Message::data(payload.clone(), Map::new())), &b.peer())
            .unwrap();
        network.run_until_idle();

        let received = b.received();
        assert_eq!(received.len(), 1);
        assert!(received[0].spooled_path().unwrap().starts_with(spool.path()));
        assert_eq!(received[0].body_bytes().unwrap(), payload);
    }

    #[test]
    fn test_stop_idles_everything() {
        let (network, a, b, ta, _tb) = handshake(20);
        a.manager
            .send_message(Arc::new(Message::data(vec![2; 500], Map::new())), &b.peer())
            .unwrap();
        a.manager.stop();
        network.run_until_idle();

        assert!(!ta.has_callback());
        assert_eq!(a.manager.stats().identifiers, 0);
        assert!(matches!(
            a.sent_errors().as_slice(),
            [Some(PeerlinkError::Session(SessionError::Stopped))]
        ));
        assert!(matches!(
            a.manager.send_message(Arc::new(Message::data(vec![1], Map::new())), &b.peer()),
            Err(PeerlinkError::Session(SessionError::Stopped))
        ));
    }

    #[test]
    fn test_start_advertises_registered_transports() {
        let network = LoopbackNetwork::new();
        let a = Node::new("alice");
        let ta = network.endpoint("node-a", "loop", 1, 20);
        a.manager.register_transport(ta.clone());
        a.manager.start();
        assert!(ta.is_advertising());
        assert_eq!(a.manager.stats().transports, 1);

        a.manager.stop();
        assert!(!ta.is_advertising());
        a.manager.start();
        assert!(ta.has_callback());
    }
}

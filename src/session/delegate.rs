//! Application-facing session notifications.
//!
//! The session manager reports peer and message lifecycle changes as
//! [`SessionEvent`] values to every subscribed [`SessionDelegate`]. A delegate
//! answers each event with a [`Subscription`]; delegates that answer
//! `Unsubscribe` are removed once the whole list has been notified.

use crate::crypto::Peer;
use crate::transport::{ConnectionStatus, Message, MessageHeader};
use crate::utils::PeerlinkError;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Session lifecycle notification
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A peer completed the identity handshake or went away
    PeerStatusUpdated {
        /// The peer
        peer: Peer,
        /// `Connected` or `Disconnected`
        status: ConnectionStatus,
    },
    /// Part of an incoming message has arrived
    MessageReceiving {
        /// Header of the incoming message
        header: MessageHeader,
        /// Sender
        sender: Peer,
        /// Received fraction of the body
        progress: f32,
    },
    /// An incoming message is complete
    MessageReceived {
        /// The message
        message: Arc<Message>,
        /// Sender
        sender: Peer,
    },
    /// Part of an outgoing message has been delivered
    MessageSending {
        /// The message
        message: Arc<Message>,
        /// Recipient
        recipient: Peer,
        /// Delivered fraction of the message
        progress: f32,
    },
    /// An outgoing message finished or was abandoned
    MessageSent {
        /// The message
        message: Arc<Message>,
        /// Recipient
        recipient: Peer,
        /// Why delivery stopped, if it did not complete
        error: Option<PeerlinkError>,
    },
}

impl SessionEvent {
    /// The remote peer the event concerns
    pub fn peer(&self) -> &Peer {
        match self {
            Self::PeerStatusUpdated { peer, .. } => peer,
            Self::MessageReceiving { sender, .. } | Self::MessageReceived { sender, .. } => sender,
            Self::MessageSending { recipient, .. } | Self::MessageSent { recipient, .. } => {
                recipient
            }
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerStatusUpdated { peer, status } => write!(f, "{} {}", peer, status),
            Self::MessageReceiving {
                header,
                sender,
                progress,
            } => write!(
                f,
                "receiving {} from {}: {:.0}%",
                header.message_type(),
                sender,
                progress * 100.0
            ),
            Self::MessageReceived { message, sender } => {
                write!(f, "received {} from {}", message, sender)
            }
            Self::MessageSending {
                message,
                recipient,
                progress,
            } => write!(
                f,
                "sending {} to {}: {:.0}%",
                message.header().message_type(),
                recipient,
                progress * 100.0
            ),
            Self::MessageSent {
                message,
                recipient,
                error: None,
            } => write!(f, "sent {} to {}", message, recipient),
            Self::MessageSent {
                message,
                recipient,
                error: Some(err),
            } => write!(f, "failed to send {} to {}: {}", message, recipient, err),
        }
    }
}

/// A delegate's answer to an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    /// Keep receiving events
    Keep,
    /// Remove this delegate after the current dispatch
    Unsubscribe,
}

/// Receiver of session events
pub trait SessionDelegate: Send + Sync {
    /// Handle one event
    fn on_event(&self, event: &SessionEvent) -> Subscription;
}

impl<F> SessionDelegate for F
where
    F: Fn(&SessionEvent) -> Subscription + Send + Sync,
{
    fn on_event(&self, event: &SessionEvent) -> Subscription {
        self(event)
    }
}

/// Handle returned by a subscription, used to unsubscribe explicitly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Entries {
    next_id: u64,
    delegates: Vec<(SubscriptionId, Arc<dyn SessionDelegate>)>,
}

/// Subscriber list safe to mutate from inside a delegate callback.
///
/// Dispatch works on a snapshot taken under the lock and calls delegates with
/// the lock released.
#[derive(Default)]
pub struct DelegateList {
    entries: Mutex<Entries>,
}

impl DelegateList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a delegate
    pub fn subscribe(&self, delegate: Arc<dyn SessionDelegate>) -> SubscriptionId {
        let mut entries = self.entries.lock();
        let id = SubscriptionId(entries.next_id);
        entries.next_id += 1;
        entries.delegates.push((id, delegate));
        id
    }

    /// Remove a delegate; `false` if it was not subscribed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.delegates.len();
        entries.delegates.retain(|(entry, _)| *entry != id);
        entries.delegates.len() != before
    }

    /// Notify every delegate, then drop those that asked to unsubscribe
    pub fn dispatch(&self, event: &SessionEvent) {
        let snapshot: Vec<_> = self.entries.lock().delegates.clone();

        let finished: Vec<SubscriptionId> = snapshot
            .iter()
            .filter(|(_, delegate)| delegate.on_event(event) == Subscription::Unsubscribe)
            .map(|(id, _)| *id)
            .collect();

        if !finished.is_empty() {
            self.entries
                .lock()
                .delegates
                .retain(|(id, _)| !finished.contains(id));
        }
    }

    /// Number of subscribed delegates
    pub fn len(&self) -> usize {
        self.entries.lock().delegates.len()
    }

    /// Whether no delegate is subscribed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Delegate forwarding events into a tokio channel.
///
/// Unsubscribes itself once the receiving half has been dropped.
pub struct ChannelDelegate {
    sender: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelDelegate {
    /// Create a delegate and the receiver its events arrive on
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { sender }), receiver)
    }
}

impl SessionDelegate for ChannelDelegate {
    fn on_event(&self, event: &SessionEvent) -> Subscription {
        match self.sender.send(event.clone()) {
            Ok(()) => Subscription::Keep,
            Err(_) => Subscription::Unsubscribe,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn status_event() -> SessionEvent {
        SessionEvent::PeerStatusUpdated {
            peer: Peer::new(vec![1u8; 32], "carol", -50),
            status: ConnectionStatus::Connected,
        }
    }

    #[test]
    fn test_unsubscribe_after_dispatch() {
        let list = DelegateList::new();
        let once = Arc::new(AtomicUsize::new(0));
        let always = Arc::new(AtomicUsize::new(0));

        let counter = once.clone();
        list.subscribe(Arc::new(move |_: &SessionEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
            Subscription::Unsubscribe
        }));
        let counter = always.clone();
        list.subscribe(Arc::new(move |_: &SessionEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
            Subscription::Keep
        }));

        list.dispatch(&status_event());
        list.dispatch(&status_event());

        assert_eq!(once.load(Ordering::SeqCst), 1);
        assert_eq!(always.load(Ordering::SeqCst), 2);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_explicit_unsubscribe() {
        let list = DelegateList::new();
        let id = list.subscribe(Arc::new(|_: &SessionEvent| Subscription::Keep));
        assert!(list.unsubscribe(id));
        assert!(!list.unsubscribe(id));
        assert!(list.is_empty());
    }

    #[test]
    fn test_delegate_may_subscribe_during_dispatch() {
        let list = Arc::new(DelegateList::new());
        let inner = list.clone();
        list.subscribe(Arc::new(move |_: &SessionEvent| {
            inner.subscribe(Arc::new(|_: &SessionEvent| Subscription::Keep));
            Subscription::Unsubscribe
        }));

        list.dispatch(&status_event());
        assert_eq!(list.len(), 1);
    }

    #[tokio::test]
    async fn test_channel_delegate_forwards_and_detaches() {
        let list = DelegateList::new();
        let (delegate, mut receiver) = ChannelDelegate::new();
        list.subscribe(delegate);

        list.dispatch(&status_event());
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.peer().alias(), "carol");
        assert!(event.to_string().contains("connected"));

        drop(receiver);
        list.dispatch(&status_event());
        assert!(list.is_empty());
    }
}

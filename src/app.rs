//! Main application lifecycle and coordination.
//!
//! [`App`] composes the configuration, the persisted local identity and a
//! [`SessionManager`], and consumes session events from a channel delegate.

use crate::{
    crypto::{IdentityKeyPair, LocalPeer, Peer},
    session::{ChannelDelegate, SessionEvent, SessionManager, SessionStats},
    transport::{ConnectionStatus, Message, Transport},
    utils::{CryptoError, PeerlinkConfig, Result},
};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::Map;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// File holding the public profile of the local identity
pub const PROFILE_FILE: &str = "profile.json";

/// File holding the raw 32-byte secret key of the local identity
pub const PRIVATE_KEY_FILE: &str = "private_key";

/// Main application structure
pub struct App {
    /// Application configuration
    config: PeerlinkConfig,
    /// Session orchestrator
    manager: Arc<SessionManager>,
    /// Session events forwarded by the channel delegate
    event_receiver: mpsc::UnboundedReceiver<SessionEvent>,
    /// Running totals
    counters: EventCounters,
    /// When the app was created
    started_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
struct EventCounters {
    peers_connected: usize,
    peers_disconnected: usize,
    messages_received: usize,
    messages_sent: usize,
    failed_sends: usize,
}

impl App {
    /// Create a new application instance
    pub async fn new(config: PeerlinkConfig) -> Result<Self> {
        config.validate()?;
        let local = load_or_create_local_peer(&config)?;

        let manager = SessionManager::new(local, config.session_config());
        let (delegate, event_receiver) = ChannelDelegate::new();
        manager.subscribe(delegate);

        Ok(Self {
            config,
            manager,
            event_receiver,
            counters: EventCounters::default(),
            started_at: Utc::now(),
        })
    }

    /// The session manager
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// The local identity
    pub fn local_peer(&self) -> &LocalPeer {
        self.manager.local_peer()
    }

    /// Configuration in use
    pub fn config(&self) -> &PeerlinkConfig {
        &self.config
    }

    /// Attach a transport to the session manager
    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        self.manager.register_transport(transport);
    }

    /// Send an in-memory payload to `peer`
    pub fn send_data(&self, peer: &Peer, payload: Vec<u8>) -> Result<Arc<Message>> {
        let message = Arc::new(Message::data(payload, Map::new()));
        self.manager.send_message(message.clone(), peer)?;
        Ok(message)
    }

    /// Send the file at `path` to `peer`
    pub fn send_file(
        &self,
        peer: &Peer,
        path: impl AsRef<Path>,
        content_type: &str,
    ) -> Result<Arc<Message>> {
        let message = Arc::new(Message::file_transfer(path, content_type)?);
        self.manager.send_message(message.clone(), peer)?;
        Ok(message)
    }

    /// Run the application until Ctrl-C
    pub async fn run(mut self) -> Result<()> {
        info!("Starting peerlink");
        info!("Identity: {}", self.local_peer().peer());

        self.manager.start();

        loop {
            tokio::select! {
                event = self.event_receiver.recv() => {
                    match event {
                        Some(event) => self.handle_event(&event),
                        None => break,
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown().await
    }

    /// Handle every event already waiting in the channel; returns how many
    pub fn process_pending_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.event_receiver.try_recv() {
            self.handle_event(&event);
            handled += 1;
        }
        handled
    }

    fn handle_event(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::PeerStatusUpdated { peer, status } => match status {
                ConnectionStatus::Connected => {
                    self.counters.peers_connected += 1;
                    info!("Peer connected: {}", peer);
                }
                ConnectionStatus::Disconnected => {
                    self.counters.peers_disconnected += 1;
                    info!("Peer disconnected: {}", peer);
                }
                ConnectionStatus::Connecting => debug!("Peer connecting: {}", peer),
            },
            SessionEvent::MessageReceiving { .. } | SessionEvent::MessageSending { .. } => {
                debug!("{}", event);
            }
            SessionEvent::MessageReceived { message, sender } => {
                self.counters.messages_received += 1;
                info!("Received {} from {}", message, sender);
            }
            SessionEvent::MessageSent { error: None, .. } => {
                self.counters.messages_sent += 1;
                info!("{}", event);
            }
            SessionEvent::MessageSent { error: Some(_), .. } => {
                self.counters.failed_sends += 1;
                warn!("{}", event);
            }
        }
    }

    /// Get application statistics
    pub fn stats(&self) -> AppStats {
        let peer = self.local_peer().peer();
        AppStats {
            alias: peer.alias().to_string(),
            fingerprint: peer.fingerprint(),
            session: self.manager.stats(),
            peers_connected: self.counters.peers_connected,
            peers_disconnected: self.counters.peers_disconnected,
            messages_received: self.counters.messages_received,
            messages_sent: self.counters.messages_sent,
            failed_sends: self.counters.failed_sends,
            uptime: Utc::now().signed_duration_since(self.started_at),
        }
    }

    /// Stop the session manager and drain remaining events
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Shutting down application");
        self.manager.stop();
        self.process_pending_events();
        Ok(())
    }
}

/// Application statistics
#[derive(Debug, Clone)]
pub struct AppStats {
    /// Local alias
    pub alias: String,
    /// Local key fingerprint
    pub fingerprint: String,
    /// Session manager snapshot
    pub session: SessionStats,
    /// Handshakes completed
    pub peers_connected: usize,
    /// Peers lost
    pub peers_disconnected: usize,
    /// Application messages received
    pub messages_received: usize,
    /// Application messages delivered
    pub messages_sent: usize,
    /// Application messages abandoned
    pub failed_sends: usize,
    /// Application uptime
    pub uptime: chrono::Duration,
}

/// Load the persisted local identity, generating and saving one if missing.
///
/// The alias always comes from the configuration.
pub fn load_or_create_local_peer(config: &PeerlinkConfig) -> Result<LocalPeer> {
    let keys_dir = &config.storage.keys_dir;
    let profile_path = keys_dir.join(PROFILE_FILE);
    let private_key_path = keys_dir.join(PRIVATE_KEY_FILE);

    if profile_path.exists() && private_key_path.exists() {
        let profile: Peer = serde_json::from_str(&std::fs::read_to_string(&profile_path)?)?;
        let keypair = IdentityKeyPair::from_secret_bytes(&std::fs::read(&private_key_path)?)?;
        if keypair.public_key_bytes() != profile.public_key() {
            return Err(CryptoError::InvalidKey {
                reason: format!(
                    "{} does not match {}",
                    private_key_path.display(),
                    profile_path.display()
                ),
            }
            .into());
        }

        let local = LocalPeer::from_keypair(keypair, config.identity.alias.clone());
        if profile.alias() != local.alias() {
            debug!("Alias changed from {} to {}", profile.alias(), local.alias());
            save_local_peer(&local, keys_dir)?;
        }
        Ok(local)
    } else {
        let local = LocalPeer::generate(config.identity.alias.clone());
        save_local_peer(&local, keys_dir)?;
        info!("Generated identity {}", local.peer());
        Ok(local)
    }
}

/// Persist `local` as `profile.json` plus the raw secret key
pub fn save_local_peer(local: &LocalPeer, keys_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(keys_dir)?;
    std::fs::write(
        keys_dir.join(PROFILE_FILE),
        serde_json::to_string_pretty(local.peer())?,
    )?;
    std::fs::write(
        keys_dir.join(PRIVATE_KEY_FILE),
        local.keypair().secret_key_bytes(),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackNetwork;
    use tempfile::TempDir;

    fn test_config(temp_dir: &TempDir, alias: &str) -> PeerlinkConfig {
        let mut config = PeerlinkConfig::default();
        config.identity.alias = alias.to_string();
        config.set_data_dir(temp_dir.path().to_path_buf());
        config
    }

    async fn create_test_app(alias: &str) -> (App, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let app = App::new(test_config(&temp_dir, alias)).await.unwrap();
        (app, temp_dir)
    }

    #[tokio::test]
    async fn test_app_creation_persists_identity() {
        let (app, temp_dir) = create_test_app("alice").await;
        let first_key = app.local_peer().public_key().to_vec();
        assert!(temp_dir.path().join("keys").join(PROFILE_FILE).exists());
        drop(app);

        let config = test_config(&temp_dir, "alice-renamed");
        let reloaded = App::new(config).await.unwrap();
        assert_eq!(reloaded.local_peer().public_key(), first_key.as_slice());
        assert_eq!(reloaded.local_peer().alias(), "alice-renamed");
    }

    #[tokio::test]
    async fn test_mismatched_key_files_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir, "alice");
        load_or_create_local_peer(&config).unwrap();

        let other = IdentityKeyPair::generate();
        std::fs::write(
            config.storage.keys_dir.join(PRIVATE_KEY_FILE),
            other.secret_key_bytes(),
        )
        .unwrap();
        assert!(load_or_create_local_peer(&config).is_err());
    }

    #[tokio::test]
    async fn test_app_stats() {
        let (app, _temp_dir) = create_test_app("alice").await;
        let stats = app.stats();

        assert_eq!(stats.alias, "alice");
        assert_eq!(stats.session.identifiers, 0);
        assert_eq!(stats.messages_received, 0);
        assert_eq!(stats.fingerprint.len(), 8);
    }

    #[tokio::test]
    async fn test_apps_exchange_over_loopback() {
        let (mut alice, _a_dir) = create_test_app("alice").await;
        let (mut bob, _b_dir) = create_test_app("bob").await;

        let network = LoopbackNetwork::new();
        let ta = network.endpoint("alice-node", "loopback", 1, 64);
        let tb = network.endpoint("bob-node", "loopback", 1, 64);
        alice.register_transport(ta.clone());
        bob.register_transport(tb.clone());
        network.connect(&ta, &tb);
        network.run_until_idle();

        let bob_peer = bob.local_peer().peer().clone();
        alice.send_data(&bob_peer, b"hello bob".to_vec()).unwrap();
        network.run_until_idle();

        assert!(alice.process_pending_events() > 0);
        assert!(bob.process_pending_events() > 0);
        assert_eq!(alice.stats().peers_connected, 1);
        assert_eq!(alice.stats().messages_sent, 1);
        assert_eq!(bob.stats().messages_received, 1);
        assert_eq!(bob.stats().session.identified, 1);

        bob.shutdown().await.unwrap();
        alice.process_pending_events();
        assert_eq!(alice.stats().failed_sends, 0);
    }
}

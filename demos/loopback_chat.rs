//! Loopback chat example.
//!
//! This example shows how to:
//! - Create two applications with their own persisted identities
//! - Link them over the in-process loopback transport
//! - Run the identity handshake and exchange a few messages
//! - Elect a faster transport with a transport upgrade

use peerlink::{
    transport::LoopbackNetwork,
    utils::PeerlinkConfig,
    App,
};
use tempfile::TempDir;

const SLOW_LINK: u32 = 1;
const FAST_LINK: u32 = 2;

async fn create_app(alias: &str, root: &TempDir) -> Result<App, Box<dyn std::error::Error>> {
    let mut config = PeerlinkConfig::default();
    config.identity.alias = alias.to_string();
    config.set_data_dir(root.path().join(alias));
    config.ensure_directories()?;
    Ok(App::new(config).await?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Peerlink - Loopback Chat Example");
    println!("================================");

    let root = TempDir::new()?;
    let mut alice = create_app("alice", &root).await?;
    let mut bob = create_app("bob", &root).await?;

    let network = LoopbackNetwork::new();
    let alice_slow = network.endpoint("alice", "ble", SLOW_LINK, 20);
    let bob_slow = network.endpoint("bob", "ble", SLOW_LINK, 20);
    let alice_fast = network.endpoint("alice", "wifi", FAST_LINK, 1024);
    let bob_fast = network.endpoint("bob", "wifi", FAST_LINK, 1024);
    alice.register_transport(alice_slow.clone());
    alice.register_transport(alice_fast.clone());
    bob.register_transport(bob_slow.clone());
    bob.register_transport(bob_fast.clone());

    println!("Connecting over the slow link...");
    network.connect(&alice_slow, &bob_slow);
    network.run_until_idle();

    let bob_peer = bob.local_peer().peer().clone();
    let alice_peer = alice.local_peer().peer().clone();

    let lines = ["hi bob", "how is the weather on your side?", "see you soon"];
    for line in lines {
        alice.send_data(&bob_peer, line.as_bytes().to_vec())?;
    }
    let deliveries = network.run_until_idle();
    println!("{} chunks delivered over the slow link", deliveries);

    println!("Bringing up the fast link and asking bob to use it...");
    network.connect(&alice_fast, &bob_fast);
    network.run_until_idle();
    alice.manager().send_transport_upgrade(&bob_peer, FAST_LINK)?;
    network.run_until_idle();

    bob.send_data(&alice_peer, vec![b'.'; 4096])?;
    let deliveries = network.run_until_idle();
    println!("{} chunks delivered for a 4 KiB reply", deliveries);

    alice.process_pending_events();
    bob.process_pending_events();

    for (name, app) in [("alice", &alice), ("bob", &bob)] {
        let stats = app.stats();
        println!("{}:", name);
        println!("   Fingerprint: {}", stats.fingerprint);
        println!("   Peers connected: {}", stats.peers_connected);
        println!("   Messages sent: {}", stats.messages_sent);
        println!("   Messages received: {}", stats.messages_received);
    }

    alice.shutdown().await?;
    bob.shutdown().await?;
    Ok(())
}

//! Common fixtures for the integration tests: a fast configuration, logging,
//! and helpers that stand up connected transports on one simulated fabric.

#![allow(dead_code)]

use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use fabric_transport::{Peer, SimFabric, Transport, TransportConfig};

static LOGGING: Once = Once::new();

/// Installs a test-writer subscriber once per test binary.
pub fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    });
}

/// Short slices so tests finish quickly.
pub fn fast_config() -> TransportConfig {
    TransportConfig {
        poll_interval_ms: 10,
        connect_retry_ms: 5,
        accept_interval_ms: 2,
        handshake_timeout_ms: 2_000,
        op_timeout_ms: 5_000,
        ..Default::default()
    }
}

pub const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

pub fn transport(fabric: &SimFabric) -> Transport {
    init_logging();
    Transport::init(fast_config(), fabric.add_nic()).expect("transport init")
}

/// Blocks until `transport` has accepted a connection from `instance`.
pub fn wait_for_peer(transport: &Transport, instance: u32) -> Peer {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(peer) = transport
            .peers()
            .into_iter()
            .find(|p| p.instance == instance)
        {
            return peer;
        }
        assert!(Instant::now() < deadline, "peer {instance} never connected");
        thread::sleep(Duration::from_millis(2));
    }
}

/// A client connected to `server`.
pub struct Client {
    pub transport: Transport,
    /// The server, as the client sees it.
    pub server: Peer,
    /// The client, as the server sees it.
    pub on_server: Peer,
}

pub fn connect_client(fabric: &SimFabric, server: &Transport) -> Client {
    let transport = transport(fabric);
    let peer = transport
        .connect(&server.url().to_string(), TIMEOUT)
        .expect("connect");
    let on_server = wait_for_peer(server, transport.instance());
    Client {
        transport,
        server: peer,
        on_server,
    }
}

/// Polls `check` until it holds or five seconds pass.
pub fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

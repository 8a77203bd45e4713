#![warn(missing_docs)]

//! fabric-selftest: exercises the transport over the simulated NIC.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::{Condvar, Mutex};
use fabric_transport::{
    MetricsSnapshot, Operation, Role, SimFabric, Transport, TransportConfig,
};
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fabric-selftest", version, about = "Fabric transport self-test")]
struct Cli {
    /// Transport configuration file (TOML or JSON).
    #[arg(long, short, env = "FABRIC_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a transport and print its contact URL.
    Url,
    /// Run a server and clients through the request queue in-process.
    SelfTest {
        /// Request-queue slots on the server.
        #[arg(long, default_value_t = 16)]
        slots: usize,
        /// Bytes per slot.
        #[arg(long, default_value_t = 512)]
        slot_size: usize,
        /// Client transports; must be fewer than half the slots.
        #[arg(long, default_value_t = 2)]
        clients: usize,
        /// Requests sent by each client.
        #[arg(long, default_value_t = 8)]
        requests: usize,
    },
}

#[derive(Debug, Serialize)]
struct Report {
    url: String,
    clients: usize,
    requests_delivered: usize,
    payload_mismatches: usize,
    elapsed_ms: u128,
    server: MetricsSnapshot,
    clients_total: MetricsSnapshot,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<TransportConfig> {
    let config = match path {
        Some(path) => TransportConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TransportConfig::default(),
    };
    Ok(config.with_env(|key| std::env::var(key).ok()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json);
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Url => {
            let fabric = SimFabric::default();
            let transport = Transport::init(config, fabric.add_nic())?;
            println!("{}", transport.url());
            transport.fini()?;
        }
        Command::SelfTest {
            slots,
            slot_size,
            clients,
            requests,
        } => {
            let report = self_test(config, slots, slot_size, clients, requests)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.payload_mismatches > 0 {
                bail!("{} payload mismatches", report.payload_mismatches);
            }
        }
    }
    Ok(())
}

fn payload(client: usize, seq: usize, len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    let tag = format!("client-{client}-request-{seq}");
    let n = tag.len().min(len);
    bytes[..n].copy_from_slice(&tag.as_bytes()[..n]);
    bytes
}

fn self_test(
    config: TransportConfig,
    slots: usize,
    slot_size: usize,
    clients: usize,
    requests: usize,
) -> Result<Report> {
    if clients == 0 || requests == 0 {
        bail!("need at least one client and one request");
    }
    // One request in flight per client keeps the live count under half the ring.
    if clients >= slots / 2 {
        bail!("{clients} clients need more than {} slots", 2 * clients);
    }
    let fabric = SimFabric::default();
    let started = Instant::now();
    let credit_wait = config.op_timeout();
    let timeout = Some(credit_wait);

    let server = Transport::init(config.clone(), fabric.add_nic())?;
    let mut queue = server.register(vec![0u8; slots * slot_size], slot_size, Role::RequestQueue, None)?;
    let url = server.url().to_string();
    tracing::info!(%url, slots, slot_size, clients, requests, "self-test starting");

    let client_config = TransportConfig {
        listen_port: 0,
        contact_file: None,
        ..config
    };
    let mut client_transports = Vec::with_capacity(clients);
    for _ in 0..clients {
        let transport = Transport::init(client_config.clone(), fabric.add_nic())?;
        let peer = transport.connect(&url, timeout)?;
        client_transports.push((transport, peer));
    }

    let expected = clients * requests;
    let delivered = AtomicUsize::new(0);
    let mismatches = AtomicUsize::new(0);
    let credits = Mutex::new(vec![0usize; clients]);
    let consumed = Condvar::new();

    thread::scope(|s| -> Result<()> {
        let mut senders = Vec::with_capacity(clients);
        for (client, (transport, peer)) in client_transports.iter().enumerate() {
            let credits = &credits;
            let consumed = &consumed;
            senders.push(s.spawn(move || -> Result<()> {
                let mut handle = transport.register(vec![0u8; slot_size], 1, Role::Send, Some(peer))?;
                for seq in 0..requests {
                    let mut done = credits.lock();
                    while done[client] < seq {
                        if consumed.wait_for(&mut done, credit_wait).timed_out() {
                            bail!("client {client} stalled before request {seq}");
                        }
                    }
                    drop(done);
                    handle.write(0, &payload(client, seq, slot_size))?;
                    transport.send(&mut handle, None)?;
                    transport.wait(&mut handle, Operation::Send, timeout)?;
                }
                transport.unregister(handle)?;
                Ok(())
            }));
        }

        while delivered.load(Ordering::Relaxed) < expected {
            let status = server.wait(&mut queue, Operation::Receive, timeout)?;
            let bytes = queue.read(status.offset as usize, status.length as usize)?;
            let known = (0..clients)
                .flat_map(|c| (0..requests).map(move |r| (c, r)))
                .find(|&(c, r)| bytes == payload(c, r, slot_size));
            match known {
                Some((client, seq)) => {
                    let mut done = credits.lock();
                    if done[client] != seq {
                        mismatches.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(client, seq, expected = done[client], "request out of order");
                    }
                    done[client] = done[client].max(seq + 1);
                    consumed.notify_all();
                }
                None => {
                    mismatches.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(offset = status.offset, "unexpected request payload");
                }
            }
            delivered.fetch_add(1, Ordering::Relaxed);
        }

        for sender in senders {
            match sender.join() {
                Ok(result) => result?,
                Err(_) => bail!("client thread panicked"),
            }
        }
        Ok(())
    })?;

    let mut total = MetricsSnapshot::default();
    for (transport, _) in &client_transports {
        let m = transport.metrics();
        total.connections_opened += m.connections_opened;
        total.requests_sent += m.requests_sent;
        total.bytes_put += m.bytes_put;
        total.slot_overflows += m.slot_overflows;
        total.unblocks_received += m.unblocks_received;
        total.waits_completed += m.waits_completed;
        transport.fini()?;
    }
    server.unregister(queue)?;
    let server_metrics = server.metrics();
    server.fini()?;

    let elapsed = started.elapsed();
    tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "self-test finished");
    Ok(Report {
        url,
        clients,
        requests_delivered: delivered.into_inner(),
        payload_mismatches: mismatches.into_inner(),
        elapsed_ms: elapsed.as_millis(),
        server: server_metrics,
        clients_total: total,
    })
}

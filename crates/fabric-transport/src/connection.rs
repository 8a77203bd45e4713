//! Connection arena and rendezvous.
//!
//! Connections live in one arena keyed by [`ConnId`]; the [`PeerDirectory`]
//! indexes them by socket address and by instance id. Outbound connections
//! are created by [`ConnectionManager::connect`], inbound ones by the accept
//! thread through [`ConnectionManager::accept`].

use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::completion::{OpContext, PeerLookup, UnblockTarget};
use crate::deadline::Deadline;
use crate::directory::{ConnId, PeerDirectory};
use crate::error::{Result, TransportError};
use crate::handshake::{self, ClientQueueAttrs, Identity, ServerQueueAttrs};
use crate::nic::{Credentials, DomainId, InstanceId, PlacementInfo};
use crate::request_queue::ClientQueue;
use crate::url::FabricUrl;

/// A process on the other end of a connection (or this process).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// URL the peer is reached at.
    pub url: FabricUrl,
    /// Resolved rendezvous address.
    pub addr: SocketAddr,
    /// Fabric instance id of the peer's NIC.
    pub instance: InstanceId,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (instance {})", self.url, self.instance)
    }
}

/// Which side of the rendezvous created a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnKind {
    /// Accepted by the listener.
    Server,
    /// Created by `connect`.
    Client,
}

/// Lifecycle of a connection. Only `Connected` and `Disconnected` are used;
/// the others mirror the rendezvous steps of RDMA connection managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Created, nothing exchanged.
    Idle,
    /// Rendezvous socket opened.
    ConnectRequest,
    /// Peer address known.
    AddrResolved,
    /// Peer placement known.
    RouteResolved,
    /// Handshake finished; transfers allowed.
    Connected,
    /// Torn down by `disconnect` or `fini`.
    Disconnected,
    /// Setup failed.
    Error,
}

pub(crate) struct Connection {
    pub id: ConnId,
    pub kind: ConnKind,
    pub peer: Peer,
    pub placement: PlacementInfo,
    pub credentials: Credentials,
    /// Domain attached for this connection; outbound connections only.
    pub domain: Option<DomainId>,
    pub state: Mutex<ConnectionState>,
    pub client_queue: Mutex<Option<ClientQueue>>,
    /// Where to send unblock notifications; inbound connections only.
    pub unblock: Option<ClientQueueAttrs>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("peer", &self.peer)
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[derive(Default)]
pub(crate) struct ConnectionManager {
    next_id: AtomicU64,
    arena: Mutex<HashMap<ConnId, Arc<Connection>>>,
    directory: PeerDirectory,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.arena.lock().len()
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.arena.lock().get(&id).cloned()
    }

    pub fn by_addr(&self, addr: &SocketAddr) -> Option<Arc<Connection>> {
        self.directory.by_addr(addr).and_then(|id| self.get(id))
    }

    pub fn by_instance(&self, instance: InstanceId) -> Option<Arc<Connection>> {
        self.directory.by_instance(instance).and_then(|id| self.get(id))
    }

    /// The live connection to `peer`, or `ENOENT`.
    pub fn resolve(&self, peer: &Peer) -> Result<Arc<Connection>> {
        self.by_addr(&peer.addr)
            .filter(|conn| conn.peer.instance == peer.instance)
            .ok_or_else(|| TransportError::NotConnected {
                peer: peer.to_string(),
            })
    }

    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<(ConnId, Peer)> = self
            .arena
            .lock()
            .values()
            .map(|conn| (conn.id, conn.peer.clone()))
            .collect();
        peers.sort_by_key(|(id, _)| *id);
        peers.into_iter().map(|(_, peer)| peer).collect()
    }

    fn insert(&self, conn: Connection) -> Arc<Connection> {
        let conn = Arc::new(conn);
        *conn.state.lock() = ConnectionState::Connected;
        self.arena.lock().insert(conn.id, conn.clone());
        self.directory
            .insert(conn.peer.addr, conn.peer.instance, conn.id);
        conn
    }

    fn next_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn configure_socket(ctx: &OpContext<'_>, stream: &TcpStream) -> Result<()> {
        let timeout = Some(ctx.config.handshake_timeout()).filter(|t| !t.is_zero());
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        stream.set_nodelay(true)?;
        Ok(())
    }

    /// Connects to the process behind `url`; an existing connection is reused.
    pub fn connect(
        &self,
        ctx: &OpContext<'_>,
        url: &FabricUrl,
        local: Identity,
        timeout: Option<Duration>,
    ) -> Result<Peer> {
        let addr = url.resolve()?;
        if let Some(existing) = self.by_addr(&addr) {
            tracing::debug!(peer = %existing.peer, "already connected");
            return Ok(existing.peer.clone());
        }

        let domain = ctx.nic.attach_domain(url.credentials)?;
        match self.establish(ctx, url, addr, domain, local, timeout) {
            Ok(peer) => Ok(peer),
            Err(err) => {
                let _ = ctx.nic.detach_domain(domain);
                tracing::warn!(url = %url, error = %err, "connect failed");
                Err(err)
            }
        }
    }

    fn establish(
        &self,
        ctx: &OpContext<'_>,
        url: &FabricUrl,
        addr: SocketAddr,
        domain: DomainId,
        local: Identity,
        timeout: Option<Duration>,
    ) -> Result<Peer> {
        let deadline = Deadline::from_timeout(timeout);
        let mut stream = loop {
            if ctx.cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let attempt = deadline.slice(ctx.config.handshake_timeout());
            if attempt.is_zero() {
                return Err(TransportError::ConnectTimeout {
                    addr: addr.to_string(),
                    timeout_ms: deadline.elapsed_ms(),
                });
            }
            match TcpStream::connect_timeout(&addr, attempt) {
                Ok(stream) => break stream,
                Err(err) => {
                    tracing::trace!(%addr, error = %err, "connect attempt failed");
                    if ctx.cancel.sleep(deadline.slice(ctx.config.connect_retry())) {
                        return Err(TransportError::Cancelled);
                    }
                }
            }
        };
        Self::configure_socket(ctx, &stream)?;

        let mut client_queue: Option<ClientQueue> = None;
        let exchanged = handshake::client_handshake(&mut stream, local, |server, attrs| {
            if !attrs.has_queue() {
                return Ok(ClientQueueAttrs::default());
            }
            let queue = ClientQueue::create(ctx, server, *attrs)?;
            let attrs = queue.attrs();
            client_queue = Some(queue);
            Ok(attrs)
        });
        let (server, queue_attrs): (Identity, ServerQueueAttrs) = match exchanged {
            Ok(done) => done,
            Err(err) => {
                if let Some(queue) = client_queue.take() {
                    queue.release(ctx.nic);
                }
                return Err(err);
            }
        };

        let conn = self.insert(Connection {
            id: self.next_id(),
            kind: ConnKind::Client,
            peer: Peer {
                url: url.clone(),
                addr,
                instance: server.instance,
            },
            placement: server.placement,
            credentials: url.credentials,
            domain: Some(domain),
            state: Mutex::new(ConnectionState::Idle),
            client_queue: Mutex::new(client_queue),
            unblock: None,
        });
        ctx.metrics.connection_opened();
        tracing::info!(
            peer = %conn.peer,
            request_queue = queue_attrs.has_queue(),
            "connected"
        );
        Ok(conn.peer.clone())
    }

    /// Server side of the rendezvous for one accepted socket.
    pub fn accept(
        &self,
        ctx: &OpContext<'_>,
        mut stream: TcpStream,
        addr: SocketAddr,
        local: Identity,
        queue: ServerQueueAttrs,
    ) -> Result<Peer> {
        stream.set_nonblocking(false)?;
        Self::configure_socket(ctx, &stream)?;
        let (client, attrs) = handshake::server_handshake(&mut stream, local, queue)?;

        let credentials = Credentials {
            ptag: client.placement.ptag,
            cookie: client.placement.cookie,
        };
        let conn = self.insert(Connection {
            id: self.next_id(),
            kind: ConnKind::Server,
            peer: Peer {
                url: FabricUrl::new(addr.ip().to_string(), addr.port(), credentials),
                addr,
                instance: client.instance,
            },
            placement: client.placement,
            credentials,
            domain: None,
            state: Mutex::new(ConnectionState::Idle),
            client_queue: Mutex::new(None),
            unblock: attrs.is_set().then_some(attrs),
        });
        ctx.metrics.connection_opened();
        tracing::info!(peer = %conn.peer, "accepted");
        Ok(conn.peer.clone())
    }

    /// Tears down the connection to `peer`. Unknown peers are ignored.
    pub fn disconnect(&self, ctx: &OpContext<'_>, peer: &Peer) {
        let Some(id) = self.directory.by_addr(&peer.addr) else {
            return;
        };
        let removed = self.arena.lock().remove(&id);
        if let Some(conn) = removed {
            self.directory
                .remove(conn.peer.addr, conn.peer.instance, conn.id);
            Self::release(ctx, &conn);
            tracing::info!(peer = %conn.peer, "disconnected");
        }
    }

    /// Tears down every connection.
    pub fn close_all(&self, ctx: &OpContext<'_>) {
        let drained: Vec<Arc<Connection>> = self.arena.lock().drain().map(|(_, c)| c).collect();
        self.directory.clear();
        for conn in &drained {
            Self::release(ctx, conn);
        }
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "connections closed");
        }
    }

    fn release(ctx: &OpContext<'_>, conn: &Connection) {
        if let Some(queue) = conn.client_queue.lock().take() {
            queue.release(ctx.nic);
        }
        if let Some(domain) = conn.domain {
            if let Err(err) = ctx.nic.detach_domain(domain) {
                tracing::warn!(peer = %conn.peer, error = %err, "domain detach failed");
            }
        }
        *conn.state.lock() = ConnectionState::Disconnected;
        ctx.metrics.connection_closed();
    }
}

impl PeerLookup for ConnectionManager {
    fn peer_by_instance(&self, instance: InstanceId) -> Option<Peer> {
        self.by_instance(instance).map(|conn| conn.peer.clone())
    }

    fn unblock_targets(&self) -> Vec<UnblockTarget> {
        self.arena
            .lock()
            .values()
            .filter(|conn| conn.kind == ConnKind::Server)
            .filter_map(|conn| {
                conn.unblock.map(|attrs| UnblockTarget {
                    instance: conn.peer.instance,
                    nic_addr: conn.placement.local_addr,
                    attrs,
                })
            })
            .collect()
    }
}

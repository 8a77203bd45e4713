//! The transport facade.
//!
//! [`Transport`] ties the pieces together: it attaches the process's
//! protection domain, runs the rendezvous listener on a background thread,
//! and exposes connect, register, send, put, get and wait to the caller.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
use crate::completion::{self, OpContext, Status};
use crate::config::TransportConfig;
use crate::connection::{ConnectionManager, Peer};
use crate::error::{Result, TransportError};
use crate::handshake::{Identity, ServerQueueAttrs};
use crate::memory::{self, MemoryHandle, RemoteBuffer};
use crate::metrics::{MetricsSnapshot, TransportMetrics};
use crate::nic::{DomainId, InstanceId, NicDriver};
use crate::request_queue::{self, QueueStats, RequestQueue};
use crate::role::{Operation, Role};
use crate::transfer;
use crate::url::FabricUrl;

struct Shared {
    config: TransportConfig,
    nic: Arc<dyn NicDriver>,
    url: FabricUrl,
    local: Peer,
    identity: Identity,
    domain: DomainId,
    cancel: CancelToken,
    cancel_handle: CancelHandle,
    shutdown: CancelToken,
    shutdown_handle: CancelHandle,
    metrics: TransportMetrics,
    connections: ConnectionManager,
    queue: Mutex<Option<RequestQueue>>,
    /// Copy of the queue descriptor, readable while a wait holds `queue`.
    queue_attrs: Mutex<ServerQueueAttrs>,
    next_handle: AtomicU64,
    finished: AtomicBool,
}

impl Shared {
    fn ctx(&self) -> OpContext<'_> {
        OpContext {
            nic: self.nic.as_ref(),
            config: &self.config,
            cancel: &self.cancel,
            metrics: &self.metrics,
        }
    }
}

/// One process's endpoint on the fabric.
pub struct Transport {
    shared: Arc<Shared>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Attaches the protection domain, starts the rendezvous listener and
    /// publishes the contact URL.
    pub fn init(config: TransportConfig, nic: Arc<dyn NicDriver>) -> Result<Self> {
        config.validate()?;
        let domain = nic.attach_domain(config.credentials())?;
        match Self::start(config, nic.clone(), domain) {
            Ok(transport) => Ok(transport),
            Err(err) => {
                let _ = nic.detach_domain(domain);
                Err(err)
            }
        }
    }

    fn start(config: TransportConfig, nic: Arc<dyn NicDriver>, domain: DomainId) -> Result<Self> {
        let listener = TcpListener::bind((config.listen_host.as_str(), config.listen_port))?;
        listener.set_nonblocking(true)?;
        let bound = listener.local_addr()?;

        let host = if bound.ip().is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST).to_string()
        } else {
            config.listen_host.clone()
        };
        let url = FabricUrl::new(host, bound.port(), config.credentials());
        let local = Peer {
            addr: url.resolve()?,
            url: url.clone(),
            instance: nic.instance(),
        };
        if let Some(path) = &config.contact_file {
            std::fs::write(path, format!("{url}\n"))?;
            tracing::debug!(path = %path.display(), "contact file written");
        }

        let (cancel, cancel_handle) = new_cancel_pair();
        let (shutdown, shutdown_handle) = new_cancel_pair();
        let identity = Identity {
            instance: nic.instance(),
            placement: nic.placement(),
        };
        let shared = Arc::new(Shared {
            config,
            nic,
            url,
            local,
            identity,
            domain,
            cancel,
            cancel_handle,
            shutdown,
            shutdown_handle,
            metrics: TransportMetrics::new(),
            connections: ConnectionManager::new(),
            queue: Mutex::new(None),
            queue_attrs: Mutex::new(ServerQueueAttrs::default()),
            next_handle: AtomicU64::new(1),
            finished: AtomicBool::new(false),
        });

        let accept_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("fabric-accept".to_string())
            .spawn(move || accept_loop(accept_shared, listener))?;

        tracing::info!(
            url = %shared.url,
            instance = shared.identity.instance,
            delivery_mode = shared.config.delivery_mode.as_str(),
            "transport initialized"
        );
        Ok(Self {
            shared,
            listener: Mutex::new(Some(handle)),
        })
    }

    /// This process's contact URL.
    pub fn url(&self) -> &FabricUrl {
        &self.shared.url
    }

    /// This process as a peer.
    pub fn local_peer(&self) -> &Peer {
        &self.shared.local
    }

    /// Instance id of the local NIC.
    pub fn instance(&self) -> InstanceId {
        self.shared.identity.instance
    }

    /// Every connected peer, oldest connection first.
    pub fn peers(&self) -> Vec<Peer> {
        self.shared.connections.peers()
    }

    /// Number of live connections in either direction.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Connects to the process whose URL is `url`.
    pub fn connect(&self, url: &str, timeout: Option<Duration>) -> Result<Peer> {
        let url = FabricUrl::parse(url)?;
        let ctx = self.shared.ctx();
        self.shared
            .connections
            .connect(&ctx, &url, self.shared.identity, timeout)
    }

    /// Drops the connection to `peer`. Unknown peers are not an error.
    pub fn disconnect(&self, peer: &Peer) -> Result<()> {
        let ctx = self.shared.ctx();
        self.shared.connections.disconnect(&ctx, peer);
        Ok(())
    }

    /// Registers `buffer` for `role`.
    ///
    /// `elem_size` is the slot size for [`Role::RequestQueue`]; for other
    /// roles the buffer must be a whole number of `elem_size` elements.
    /// Every role except the request queue is registered against `peer`.
    pub fn register(
        &self,
        buffer: Vec<u8>,
        elem_size: usize,
        role: Role,
        peer: Option<&Peer>,
    ) -> Result<MemoryHandle> {
        let ctx = self.shared.ctx();
        let id = self.shared.next_handle.fetch_add(1, Ordering::Relaxed);

        let handle = if role == Role::RequestQueue {
            let mut slot = self.shared.queue.lock();
            if slot.is_some() {
                return Err(TransportError::invalid("a request queue is already registered"));
            }
            let queue = RequestQueue::create(&ctx, buffer, elem_size)?;
            *self.shared.queue_attrs.lock() = queue.attrs();
            let handle = queue.handle(id, self.instance());
            *slot = Some(queue);
            handle
        } else {
            let peer = peer.ok_or_else(|| {
                TransportError::invalid(format!("{role} buffer needs a peer"))
            })?;
            let conn = self.shared.connections.resolve(peer)?;
            memory::register(&ctx, id, buffer, elem_size, role, &conn)?
        };
        self.shared.metrics.inc_buffers_registered();
        Ok(handle)
    }

    /// Releases `handle` and returns its bytes. The request-queue handle
    /// takes the request queue with it.
    pub fn unregister(&self, handle: MemoryHandle) -> Result<Vec<u8>> {
        let bytes = if handle.role() == Role::RequestQueue {
            let queue = self
                .shared
                .queue
                .lock()
                .take()
                .ok_or_else(|| TransportError::invalid("no request queue registered"))?;
            *self.shared.queue_attrs.lock() = ServerQueueAttrs::default();
            queue.release(self.shared.nic.as_ref())
        } else {
            memory::unregister(self.shared.nic.as_ref(), handle)?
        };
        self.shared.metrics.inc_buffers_unregistered();
        Ok(bytes)
    }

    /// Sends the whole of `handle`.
    ///
    /// Without `dest`, or with a request-queue `dest`, the buffer goes into
    /// the peer's request queue. Any other `dest` receives it as a put.
    pub fn send(&self, handle: &mut MemoryHandle, dest: Option<&RemoteBuffer>) -> Result<()> {
        if handle.role() != Role::Send {
            return Err(TransportError::invalid(format!(
                "cannot send from a {} buffer",
                handle.role()
            )));
        }
        let ctx = self.shared.ctx();
        if let Some(dest) = dest.filter(|d| d.role != Role::RequestQueue) {
            let len = handle.len() as u64;
            return transfer::put(&ctx, handle, 0, len, dest, 0);
        }

        let conn_id = handle.channels()?.conn;
        let conn = self
            .shared
            .connections
            .get(conn_id)
            .ok_or_else(|| TransportError::NotConnected {
                peer: handle
                    .peer()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            })?;
        let mut client_queue = conn.client_queue.lock();
        let queue = client_queue.as_mut().ok_or_else(|| {
            TransportError::invalid(format!("{} has no request queue", conn.peer))
        })?;
        request_queue::send_request(&ctx, queue, handle).map(|_| ())
    }

    /// Writes `len` bytes of `src` at `src_offset` to `dest` at `dest_offset`.
    pub fn put(
        &self,
        src: &mut MemoryHandle,
        src_offset: u64,
        len: u64,
        dest: &RemoteBuffer,
        dest_offset: u64,
    ) -> Result<()> {
        transfer::put(&self.shared.ctx(), src, src_offset, len, dest, dest_offset)
    }

    /// Reads `len` bytes of `src` at `src_offset` into `dest` at `dest_offset`.
    pub fn get(
        &self,
        src: &RemoteBuffer,
        src_offset: u64,
        len: u64,
        dest: &mut MemoryHandle,
        dest_offset: u64,
    ) -> Result<()> {
        transfer::get(&self.shared.ctx(), src, src_offset, len, dest, dest_offset)
    }

    /// Waits for `handle`'s current operation. `None` waits without a
    /// deadline; a zero timeout polls once.
    pub fn wait(
        &self,
        handle: &mut MemoryHandle,
        op: Operation,
        timeout: Option<Duration>,
    ) -> Result<Status> {
        let shared = &self.shared;
        let ctx = shared.ctx();
        if handle.role() == Role::RequestQueue {
            let mut queue = shared.queue.lock();
            let queue = queue
                .as_mut()
                .ok_or_else(|| TransportError::invalid("no request queue registered"))?;
            completion::wait(
                &ctx,
                handle,
                op,
                timeout,
                Some(queue),
                &shared.local,
                &shared.connections,
            )
        } else {
            completion::wait(
                &ctx,
                handle,
                op,
                timeout,
                None,
                &shared.local,
                &shared.connections,
            )
        }
    }

    /// Current transport counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Counters of the local request queue, if one is registered.
    pub fn queue_stats(&self) -> Option<QueueStats> {
        self.shared.queue.lock().as_ref().map(RequestQueue::stats)
    }

    /// Handle that cancels pending and future waits.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.shared.cancel_handle.clone()
    }

    /// Shuts the transport down. Calling it again is a no-op.
    pub fn fini(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.finished.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        shared.shutdown_handle.cancel(CancelReason::Shutdown);
        shared.cancel_handle.cancel(CancelReason::Shutdown);
        if let Some(handle) = self.listener.lock().take() {
            if handle.join().is_err() {
                tracing::error!("accept thread panicked");
            }
        }

        let ctx = shared.ctx();
        shared.connections.close_all(&ctx);
        if let Some(queue) = shared.queue.lock().take() {
            queue.release(shared.nic.as_ref());
        }
        shared.nic.detach_domain(shared.domain)?;

        let metrics = shared.metrics.snapshot();
        tracing::info!(
            url = %shared.url,
            connections = metrics.connections_opened,
            requests_sent = metrics.requests_sent,
            requests_received = metrics.requests_received,
            "transport finalized"
        );
        Ok(())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Err(err) = self.fini() {
            tracing::warn!(error = %err, "transport teardown failed");
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("url", &self.shared.url)
            .field("instance", &self.shared.identity.instance)
            .field("connections", &self.shared.connections.len())
            .finish()
    }
}

fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    let ctx = shared.ctx();
    let pause = shared.config.accept_interval();
    while !shared.shutdown.is_cancelled() {
        match listener.accept() {
            Ok((stream, addr)) => {
                let attrs = *shared.queue_attrs.lock();
                if let Err(err) =
                    shared
                        .connections
                        .accept(&ctx, stream, addr, shared.identity, attrs)
                {
                    tracing::warn!(%addr, error = %err, "inbound handshake failed");
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                shared.shutdown.sleep(pause);
            }
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                shared.shutdown.sleep(pause);
            }
        }
    }
    tracing::debug!("accept loop stopped");
}

//! RDMA simulation for running the transport without interconnect hardware.
//!
//! A [`SimFabric`] is the shared "network": every [`SimNic`] added to it,
//! every registration, endpoint and completion queue lives in its tables.
//! Posts execute synchronously against the registered bytes and raise the
//! local and remote events the hardware would raise. Tests can hold remote
//! data events back and release them in any order, fail posts, and refuse
//! protection-domain attaches.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::deadline::{wait_on, Deadline};
use crate::nic::{
    CqEvent, CqId, Credentials, DomainId, EpId, EventSource, InstanceId, MemHandle,
    MemoryRegion, NicDriver, NicError, PlacementInfo, PostDescriptor, PostOp,
};

static CQ_COUNTER: AtomicU64 = AtomicU64::new(1);
static EP_COUNTER: AtomicU64 = AtomicU64::new(1);
static MR_COUNTER: AtomicU64 = AtomicU64::new(1);
static PD_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Placement handed to every NIC added to a fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFabricConfig {
    /// Device number reported in each NIC's placement.
    pub device_id: u32,
    /// Protection tag reported in each NIC's placement.
    pub ptag: u32,
    /// Cookie reported in each NIC's placement.
    pub cookie: u32,
}

impl Default for SimFabricConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            ptag: 1,
            cookie: 0,
        }
    }
}

/// Fabric-wide counters, across every NIC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricStats {
    /// Posts whose local completion reported success.
    pub operations_completed: u64,
    /// Posts failed by injection or a bad descriptor.
    pub operations_failed: u64,
    /// Bytes moved by puts.
    pub bytes_written: u64,
    /// Bytes moved by gets.
    pub bytes_read: u64,
    /// Fetch-add and fetch-and operations.
    pub atomics: u64,
    /// Completion-queue writes.
    pub cq_writes: u64,
    /// Events lost to a full completion queue.
    pub events_dropped: u64,
}

struct SimCq {
    depth: usize,
    events: Mutex<VecDeque<CqEvent>>,
    ready: Condvar,
}

struct SimEp {
    owner: InstanceId,
    cq: CqId,
    bound: Option<InstanceId>,
    local_data: u32,
    remote_data: u32,
}

#[derive(Clone)]
struct Registration {
    owner: InstanceId,
    region: MemoryRegion,
    cq: Option<CqId>,
}

struct FabricState {
    config: SimFabricConfig,
    next_instance: AtomicU32,
    nics: Mutex<HashMap<InstanceId, PlacementInfo>>,
    cqs: Mutex<HashMap<CqId, Arc<SimCq>>>,
    eps: Mutex<HashMap<EpId, SimEp>>,
    regions: Mutex<HashMap<MemHandle, Registration>>,
    domains: Mutex<HashMap<DomainId, (InstanceId, Credentials)>>,
    refused_ptags: Mutex<HashSet<u32>>,
    hold_remote: AtomicBool,
    held: Mutex<Vec<(CqId, CqEvent)>>,
    fail_posts: AtomicU32,
    stats: Mutex<FabricStats>,
}

/// Shared simulated interconnect.
#[derive(Clone)]
pub struct SimFabric {
    state: Arc<FabricState>,
}

impl Default for SimFabric {
    fn default() -> Self {
        Self::new(SimFabricConfig::default())
    }
}

impl SimFabric {
    /// An empty fabric.
    pub fn new(config: SimFabricConfig) -> Self {
        Self {
            state: Arc::new(FabricState {
                config,
                next_instance: AtomicU32::new(1),
                nics: Mutex::new(HashMap::new()),
                cqs: Mutex::new(HashMap::new()),
                eps: Mutex::new(HashMap::new()),
                regions: Mutex::new(HashMap::new()),
                domains: Mutex::new(HashMap::new()),
                refused_ptags: Mutex::new(HashSet::new()),
                hold_remote: AtomicBool::new(false),
                held: Mutex::new(Vec::new()),
                fail_posts: AtomicU32::new(0),
                stats: Mutex::new(FabricStats::default()),
            }),
        }
    }

    /// Plugs a new NIC into the fabric.
    pub fn add_nic(&self) -> Arc<SimNic> {
        let instance = self.state.next_instance.fetch_add(1, Ordering::Relaxed);
        let placement = PlacementInfo {
            device_id: self.state.config.device_id,
            local_addr: 0x4000 + instance,
            ptag: self.state.config.ptag,
            cookie: self.state.config.cookie,
        };
        self.state.nics.lock().insert(instance, placement);
        tracing::debug!(instance, nic_addr = placement.local_addr, "simulated NIC added");
        Arc::new(SimNic {
            fabric: self.clone(),
            instance,
            placement,
        })
    }

    /// While set, remote data events are parked instead of delivered.
    /// Completion-queue writes are never held.
    pub fn hold_remote_events(&self, hold: bool) {
        self.state.hold_remote.store(hold, Ordering::SeqCst);
    }

    /// Remote events currently held back.
    pub fn held_events(&self) -> usize {
        self.state.held.lock().len()
    }

    /// Delivers held events in the order given by `order` (indices into the
    /// held list), then any held events `order` did not name, oldest first.
    /// Returns the number of events delivered.
    pub fn release_held(&self, order: &[usize]) -> usize {
        let held: Vec<(CqId, CqEvent)> = std::mem::take(&mut *self.state.held.lock());
        let mut released = vec![false; held.len()];
        let mut delivered = 0;
        for &index in order {
            if let Some(&(cq, event)) = held.get(index) {
                if !released[index] {
                    released[index] = true;
                    self.deliver(cq, event);
                    delivered += 1;
                }
            }
        }
        for (index, &(cq, event)) in held.iter().enumerate() {
            if !released[index] {
                self.deliver(cq, event);
                delivered += 1;
            }
        }
        delivered
    }

    /// Marks the local completion of the next `count` posts as failed.
    pub fn fail_next_posts(&self, count: u32) {
        self.state.fail_posts.store(count, Ordering::SeqCst);
    }

    /// Makes every later attach with `ptag` fail with a permission error.
    pub fn refuse_ptag(&self, ptag: u32) {
        self.state.refused_ptags.lock().insert(ptag);
    }

    /// Snapshot of the fabric counters.
    pub fn stats(&self) -> FabricStats {
        self.state.stats.lock().clone()
    }

    fn cq(&self, cq: CqId) -> Result<Arc<SimCq>, NicError> {
        self.state
            .cqs
            .lock()
            .get(&cq)
            .cloned()
            .ok_or(NicError::UnknownHandle {
                kind: "completion queue",
                id: cq.0,
            })
    }

    fn registration(&self, mem: MemHandle, owner: InstanceId) -> Result<Registration, NicError> {
        let regions = self.state.regions.lock();
        match regions.get(&mem) {
            Some(reg) if reg.owner == owner => Ok(reg.clone()),
            _ => Err(NicError::UnknownHandle {
                kind: "memory",
                id: mem.qword1,
            }),
        }
    }

    fn deliver(&self, cq: CqId, event: CqEvent) {
        let target = match self.cq(cq) {
            Ok(target) => target,
            Err(_) => {
                self.state.stats.lock().events_dropped += 1;
                tracing::debug!(%cq, "event for destroyed completion queue dropped");
                return;
            }
        };
        let mut events = target.events.lock();
        if events.len() >= target.depth {
            drop(events);
            self.state.stats.lock().events_dropped += 1;
            tracing::warn!(%cq, depth = target.depth, "completion queue overrun, event dropped");
            return;
        }
        events.push_back(event);
        target.ready.notify_all();
    }

    fn take_failure(&self) -> bool {
        self.state
            .fail_posts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// One simulated NIC attached to a [`SimFabric`].
pub struct SimNic {
    fabric: SimFabric,
    instance: InstanceId,
    placement: PlacementInfo,
}

impl SimNic {
    /// The fabric this NIC is plugged into.
    pub fn fabric(&self) -> &SimFabric {
        &self.fabric
    }

    fn local_range(
        &self,
        desc: &PostDescriptor,
    ) -> Result<(Registration, usize), NicError> {
        let local = self.fabric.registration(desc.local_mem, self.instance)?;
        let offset = local
            .region
            .offset_of(desc.local_addr, desc.length)
            .ok_or_else(|| NicError::InvalidDescriptor {
                reason: format!(
                    "local range {:#x}+{} outside registration",
                    desc.local_addr, desc.length
                ),
            })?;
        Ok((local, offset))
    }
}

impl NicDriver for SimNic {
    fn instance(&self) -> InstanceId {
        self.instance
    }

    fn placement(&self) -> PlacementInfo {
        self.placement
    }

    fn attach_domain(&self, credentials: Credentials) -> Result<DomainId, NicError> {
        if self
            .fabric
            .state
            .refused_ptags
            .lock()
            .contains(&credentials.ptag)
        {
            return Err(NicError::PermissionDenied {
                ptag: credentials.ptag,
            });
        }
        let domain = DomainId(PD_COUNTER.fetch_add(1, Ordering::Relaxed));
        self.fabric
            .state
            .domains
            .lock()
            .insert(domain, (self.instance, credentials));
        Ok(domain)
    }

    fn detach_domain(&self, domain: DomainId) -> Result<(), NicError> {
        match self.fabric.state.domains.lock().remove(&domain) {
            Some(_) => Ok(()),
            None => Err(NicError::UnknownHandle {
                kind: "domain",
                id: domain.0,
            }),
        }
    }

    fn create_cq(&self, depth: usize) -> Result<CqId, NicError> {
        if depth == 0 {
            return Err(NicError::InvalidDescriptor {
                reason: "completion queue depth is zero".to_string(),
            });
        }
        let cq = CqId(CQ_COUNTER.fetch_add(1, Ordering::Relaxed));
        self.fabric.state.cqs.lock().insert(
            cq,
            Arc::new(SimCq {
                depth,
                events: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
            }),
        );
        Ok(cq)
    }

    fn destroy_cq(&self, cq: CqId) -> Result<(), NicError> {
        match self.fabric.state.cqs.lock().remove(&cq) {
            Some(_) => Ok(()),
            None => Err(NicError::UnknownHandle {
                kind: "completion queue",
                id: cq.0,
            }),
        }
    }

    fn create_ep(&self, cq: CqId) -> Result<EpId, NicError> {
        self.fabric.cq(cq)?;
        let ep = EpId(EP_COUNTER.fetch_add(1, Ordering::Relaxed));
        self.fabric.state.eps.lock().insert(
            ep,
            SimEp {
                owner: self.instance,
                cq,
                bound: None,
                local_data: self.instance,
                remote_data: self.instance,
            },
        );
        Ok(ep)
    }

    fn bind_ep(&self, ep: EpId, remote_addr: u32, instance: InstanceId) -> Result<(), NicError> {
        let known = self
            .fabric
            .state
            .nics
            .lock()
            .get(&instance)
            .map(|p| p.local_addr == remote_addr)
            .unwrap_or(false);
        if !known {
            return Err(NicError::UnknownHandle {
                kind: "instance",
                id: instance as u64,
            });
        }
        let mut eps = self.fabric.state.eps.lock();
        match eps.get_mut(&ep) {
            Some(state) if state.owner == self.instance => {
                state.bound = Some(instance);
                Ok(())
            }
            _ => Err(NicError::UnknownHandle {
                kind: "endpoint",
                id: ep.0,
            }),
        }
    }

    fn unbind_ep(&self, ep: EpId) -> Result<(), NicError> {
        let mut eps = self.fabric.state.eps.lock();
        match eps.get_mut(&ep) {
            Some(state) if state.owner == self.instance => {
                state.bound = None;
                Ok(())
            }
            _ => Err(NicError::UnknownHandle {
                kind: "endpoint",
                id: ep.0,
            }),
        }
    }

    fn destroy_ep(&self, ep: EpId) -> Result<(), NicError> {
        match self.fabric.state.eps.lock().remove(&ep) {
            Some(_) => Ok(()),
            None => Err(NicError::UnknownHandle {
                kind: "endpoint",
                id: ep.0,
            }),
        }
    }

    fn set_event_data(&self, ep: EpId, local: u32, remote: u32) -> Result<(), NicError> {
        let mut eps = self.fabric.state.eps.lock();
        match eps.get_mut(&ep) {
            Some(state) if state.owner == self.instance => {
                state.local_data = local;
                state.remote_data = remote;
                Ok(())
            }
            _ => Err(NicError::UnknownHandle {
                kind: "endpoint",
                id: ep.0,
            }),
        }
    }

    fn register(&self, region: &MemoryRegion, cq: Option<CqId>) -> Result<MemHandle, NicError> {
        if let Some(cq) = cq {
            self.fabric.cq(cq)?;
        }
        let mem = MemHandle {
            qword1: MR_COUNTER.fetch_add(1, Ordering::Relaxed),
            qword2: region.base(),
        };
        self.fabric.state.regions.lock().insert(
            mem,
            Registration {
                owner: self.instance,
                region: region.clone(),
                cq,
            },
        );
        Ok(mem)
    }

    fn deregister(&self, mem: MemHandle) -> Result<(), NicError> {
        let mut regions = self.fabric.state.regions.lock();
        match regions.get(&mem) {
            Some(reg) if reg.owner == self.instance => {
                regions.remove(&mem);
                Ok(())
            }
            _ => Err(NicError::UnknownHandle {
                kind: "memory",
                id: mem.qword1,
            }),
        }
    }

    fn post(&self, ep: EpId, desc: &PostDescriptor) -> Result<(), NicError> {
        let (local_cq, target, local_data, remote_data) = {
            let eps = self.fabric.state.eps.lock();
            let state = eps
                .get(&ep)
                .filter(|s| s.owner == self.instance)
                .ok_or(NicError::UnknownHandle {
                    kind: "endpoint",
                    id: ep.0,
                })?;
            let target = state.bound.ok_or(NicError::Unbound { ep })?;
            (state.cq, target, state.local_data, state.remote_data)
        };

        let remote = self.fabric.registration(desc.remote_mem, target)?;
        let remote_range = |len: u64| {
            remote
                .region
                .offset_of(desc.remote_addr, len)
                .ok_or_else(|| NicError::InvalidDescriptor {
                    reason: format!(
                        "remote range {:#x}+{} outside registration",
                        desc.remote_addr, len
                    ),
                })
        };

        let mut payload = 0;
        match desc.op {
            PostOp::Put => {
                let (local, lo) = self.local_range(desc)?;
                let ro = remote_range(desc.length)?;
                let bytes = local
                    .region
                    .read_at(lo, desc.length as usize)
                    .ok_or_else(|| NicError::Hardware {
                        reason: "local read failed".to_string(),
                    })?;
                remote.region.write_at(ro, &bytes);
                self.fabric.state.stats.lock().bytes_written += desc.length;
            }
            PostOp::Get => {
                let (local, lo) = self.local_range(desc)?;
                let ro = remote_range(desc.length)?;
                let bytes = remote
                    .region
                    .read_at(ro, desc.length as usize)
                    .ok_or_else(|| NicError::Hardware {
                        reason: "remote read failed".to_string(),
                    })?;
                local.region.write_at(lo, &bytes);
                self.fabric.state.stats.lock().bytes_read += desc.length;
            }
            PostOp::FetchAdd(operand) | PostOp::FetchAnd(operand) => {
                let (local, lo) = self.local_range(&PostDescriptor { length: 8, ..*desc })?;
                let ro = remote_range(8)?;
                let old = remote
                    .region
                    .fetch_update(ro, |v| match desc.op {
                        PostOp::FetchAdd(_) => v.wrapping_add(operand),
                        _ => v & operand,
                    })
                    .ok_or_else(|| NicError::Hardware {
                        reason: "atomic on unaligned word".to_string(),
                    })?;
                local.region.write_u64(lo, old);
                self.fabric.state.stats.lock().atomics += 1;
            }
            PostOp::CqWrite(value) => {
                if remote.cq.is_none() {
                    return Err(NicError::InvalidDescriptor {
                        reason: "completion-queue write to a registration without a queue"
                            .to_string(),
                    });
                }
                payload = value;
                self.fabric.state.stats.lock().cq_writes += 1;
            }
        }

        let failed = self.fabric.take_failure();
        {
            let mut stats = self.fabric.state.stats.lock();
            if failed {
                stats.operations_failed += 1;
            } else {
                stats.operations_completed += 1;
            }
        }
        self.fabric.deliver(
            local_cq,
            CqEvent {
                source: EventSource::Local,
                data: local_data,
                payload: 0,
                ok: !failed,
            },
        );

        if desc.remote_event {
            if let Some(remote_cq) = remote.cq {
                let event = CqEvent {
                    source: EventSource::Remote,
                    data: remote_data,
                    payload,
                    ok: true,
                };
                let hold = !matches!(desc.op, PostOp::CqWrite(_))
                    && self.fabric.state.hold_remote.load(Ordering::SeqCst);
                if hold {
                    self.fabric.state.held.lock().push((remote_cq, event));
                } else {
                    self.fabric.deliver(remote_cq, event);
                }
            }
        }
        Ok(())
    }

    fn wait_event(&self, cq: CqId, timeout: Duration) -> Result<CqEvent, NicError> {
        let queue = self.fabric.cq(cq)?;
        let mut events = queue.events.lock();
        wait_on(&queue.ready, &mut events, Deadline::after(timeout), |q| {
            !q.is_empty()
        });
        events.pop_front().ok_or(NicError::Timeout { cq })
    }

    fn try_event(&self, cq: CqId) -> Result<Option<CqEvent>, NicError> {
        let queue = self.fabric.cq(cq)?;
        let event = queue.events.lock().pop_front();
        Ok(event)
    }
}

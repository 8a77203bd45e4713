//! Per-buffer role state table.
//!
//! Every registered buffer carries one [`RoleState`]. This module is the only
//! place that knows which completion queue a buffer waits on, how an event
//! moves it forward and when it counts as complete.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::wc::OpCode;

/// What a registered buffer is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Outgoing request, sent into a peer's request queue or put to an
    /// explicit destination.
    Send,
    /// Inbox a peer puts into.
    Receive,
    /// The transport's single many-to-one request ring.
    RequestQueue,
    /// Inbox for a reply to an earlier request.
    Result,
    /// Source a peer pulls from with `get`.
    GetSrc,
    /// Local landing buffer of a `get`.
    GetDst,
    /// Local source of a `put`.
    PutSrc,
    /// Destination a peer writes into with `put`.
    PutDst,
    /// Open to both puts and gets from a peer.
    RdmaTarget,
}

impl Role {
    /// Upper-case name used in logs and diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Send => "SEND",
            Role::Receive => "RECEIVE",
            Role::RequestQueue => "REQUEST_QUEUE",
            Role::Result => "RESULT",
            Role::GetSrc => "GET_SRC",
            Role::GetDst => "GET_DST",
            Role::PutSrc => "PUT_SRC",
            Role::PutDst => "PUT_DST",
            Role::RdmaTarget => "RDMA_TARGET",
        }
    }

    /// Pure target roles: data arrives without a matching local post.
    pub fn is_target(self) -> bool {
        matches!(self, Role::Receive | Role::Result | Role::GetSrc | Role::PutDst)
    }

    /// Roles whose registrations get a memory completion queue attached.
    pub fn needs_memory_cq(self) -> bool {
        self.is_target() || self == Role::RdmaTarget
    }

    /// Whether `wait` may be called on this role for `op`.
    pub fn accepts(self, op: Operation) -> bool {
        match self {
            Role::Send => matches!(op, Operation::Send | Operation::Put),
            Role::PutSrc | Role::PutDst => op == Operation::Put,
            Role::GetSrc | Role::GetDst => op == Operation::Get,
            Role::Receive | Role::Result => matches!(op, Operation::Put | Operation::Receive),
            Role::RequestQueue => matches!(op, Operation::Receive | Operation::Send),
            Role::RdmaTarget => matches!(op, Operation::Put | Operation::Get),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation named by `wait` and reported in a status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// A request into a request queue.
    Send,
    /// Data arriving at an inbox or the request queue.
    Receive,
    /// A one-sided write.
    Put,
    /// A one-sided read.
    Get,
}

impl Operation {
    /// The operation a work-completion code belongs to.
    pub fn of(op: OpCode) -> Self {
        match op {
            OpCode::Send => Operation::Send,
            OpCode::PutInitiator | OpCode::PutTarget => Operation::Put,
            OpCode::GetInitiator | OpCode::GetTarget => Operation::Get,
            OpCode::Receive | OpCode::Result | OpCode::NewRequest => Operation::Receive,
        }
    }
}

/// Progress of a buffer's current operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpState {
    /// Nothing observed yet.
    Init,
    /// Data moved; the acknowledgment round-trip is outstanding.
    NeedAck,
    /// A put or get finished on this side.
    Complete,
    /// A send finished on the sender.
    SendComplete,
    /// A request or inbox delivery finished on the receiver.
    RecvComplete,
}

impl OpState {
    /// True for the three completed states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OpState::Complete | OpState::SendComplete | OpState::RecvComplete
        )
    }
}

/// Which of a buffer's completion queues to poll next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSel {
    /// Local completions of the data endpoint.
    Endpoint,
    /// Local completions of the side-channel endpoint.
    SideChannel,
    /// Remote arrivals into the buffer.
    Memory,
    /// Remote arrivals into the side-channel record.
    SideChannelMemory,
    /// The request queue's record array.
    RequestQueue,
}

/// Result of feeding one successful event to [`RoleState::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The buffer moved on but is not complete.
    Progressed,
    /// The caller must post the acknowledgment write.
    NeedsAck,
    /// The operation finished.
    Completed,
    /// The request queue decides what the event delivers.
    Delegate,
}

/// Role-specific state of one registered buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum RoleState {
    /// `via` is `OpCode::Send` through a request queue or
    /// `OpCode::PutInitiator` to an explicit destination.
    Send { via: OpCode, state: OpState },
    /// PUT_SRC or GET_DST: the local side issues the transfer.
    Initiator { role: Role, state: OpState },
    /// RECEIVE, RESULT, GET_SRC or PUT_DST: a peer issues it.
    Target { role: Role, state: OpState },
    /// `last_op` is the peer's most recent operation on the buffer.
    RdmaTarget { last_op: Option<OpCode>, state: OpState },
    /// The request ring.
    RequestQueue { state: OpState },
}

impl RoleState {
    /// Fresh state for a newly registered buffer.
    pub fn for_role(role: Role) -> Self {
        let state = OpState::Init;
        match role {
            Role::Send => RoleState::Send {
                via: OpCode::Send,
                state,
            },
            Role::PutSrc | Role::GetDst => RoleState::Initiator { role, state },
            Role::Receive | Role::Result | Role::GetSrc | Role::PutDst => {
                RoleState::Target { role, state }
            }
            Role::RdmaTarget => RoleState::RdmaTarget {
                last_op: None,
                state,
            },
            Role::RequestQueue => RoleState::RequestQueue { state },
        }
    }

    /// The role the buffer was registered with.
    pub fn role(&self) -> Role {
        match *self {
            RoleState::Send { .. } => Role::Send,
            RoleState::Initiator { role, .. } | RoleState::Target { role, .. } => role,
            RoleState::RdmaTarget { .. } => Role::RdmaTarget,
            RoleState::RequestQueue { .. } => Role::RequestQueue,
        }
    }

    /// Current progress.
    pub fn state(&self) -> OpState {
        match *self {
            RoleState::Send { state, .. }
            | RoleState::Initiator { state, .. }
            | RoleState::Target { state, .. }
            | RoleState::RdmaTarget { state, .. }
            | RoleState::RequestQueue { state } => state,
        }
    }

    fn state_mut(&mut self) -> &mut OpState {
        match self {
            RoleState::Send { state, .. }
            | RoleState::Initiator { state, .. }
            | RoleState::Target { state, .. }
            | RoleState::RdmaTarget { state, .. }
            | RoleState::RequestQueue { state } => state,
        }
    }

    /// Most recent operation on the buffer, local or remote.
    pub fn last_op(&self) -> Option<OpCode> {
        match *self {
            RoleState::Send { via, .. } => Some(via),
            RoleState::Initiator { role: Role::GetDst, .. } => Some(OpCode::GetInitiator),
            RoleState::Initiator { .. } => Some(OpCode::PutInitiator),
            RoleState::Target { role, .. } => Some(match role {
                Role::Receive => OpCode::Receive,
                Role::Result => OpCode::Result,
                Role::GetSrc => OpCode::GetTarget,
                _ => OpCode::PutTarget,
            }),
            RoleState::RdmaTarget { last_op, .. } => last_op,
            RoleState::RequestQueue { .. } => Some(OpCode::NewRequest),
        }
    }

    /// True when the buffer's most recent operation was issued locally.
    pub fn initiated(&self) -> bool {
        match *self {
            RoleState::Send { .. } | RoleState::Initiator { .. } => true,
            RoleState::RdmaTarget { last_op, .. } => matches!(
                last_op,
                Some(OpCode::PutInitiator | OpCode::GetInitiator)
            ),
            RoleState::Target { .. } | RoleState::RequestQueue { .. } => false,
        }
    }

    /// True once the current operation reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether a completed buffer goes back to waiting for the next arrival
    /// when `wait` is called on it again.
    pub fn rearms_on_wait(&self) -> bool {
        !self.initiated()
    }

    /// Resets a completed buffer to `Init`.
    pub fn rearm(&mut self) {
        match self {
            RoleState::Target { state, .. } | RoleState::RequestQueue { state } => {
                *state = OpState::Init;
            }
            RoleState::RdmaTarget { last_op, state } => {
                *last_op = None;
                *state = OpState::Init;
            }
            RoleState::Send { .. } | RoleState::Initiator { .. } => {}
        }
    }

    /// Starts a locally issued operation.
    pub fn begin(&mut self, op: OpCode) -> Result<()> {
        let next = match (*self, op) {
            (RoleState::Send { .. }, OpCode::Send | OpCode::PutInitiator) => RoleState::Send {
                via: op,
                state: OpState::Init,
            },
            (RoleState::Initiator { role: Role::PutSrc, .. }, OpCode::PutInitiator)
            | (RoleState::Initiator { role: Role::GetDst, .. }, OpCode::GetInitiator) => {
                RoleState::Initiator {
                    role: self.role(),
                    state: OpState::Init,
                }
            }
            (RoleState::RdmaTarget { .. }, OpCode::PutInitiator | OpCode::GetInitiator) => {
                RoleState::RdmaTarget {
                    last_op: Some(op),
                    state: OpState::Init,
                }
            }
            _ => {
                return Err(TransportError::invalid(format!(
                    "{} buffer cannot issue {op:?}",
                    self.role()
                )))
            }
        };
        *self = next;
        Ok(())
    }

    /// Records the operation a peer performed on an RDMA target buffer.
    pub fn record_arrival(&mut self, op: OpCode) {
        if let RoleState::RdmaTarget { last_op, .. } = self {
            *last_op = Some(op);
        }
    }

    /// Queue to poll next; `None` once complete.
    pub fn select_queue(&self) -> Option<QueueSel> {
        if self.is_complete() {
            return None;
        }
        let init = self.state() == OpState::Init;
        let sel = match *self {
            RoleState::Send {
                via: OpCode::Send, ..
            } => QueueSel::SideChannel,
            RoleState::RequestQueue { .. } => QueueSel::RequestQueue,
            _ if self.initiated() => {
                if init {
                    QueueSel::Endpoint
                } else {
                    QueueSel::SideChannel
                }
            }
            _ => {
                if init {
                    QueueSel::Memory
                } else {
                    QueueSel::SideChannelMemory
                }
            }
        };
        Some(sel)
    }

    /// Feeds one successful event from the queue [`Self::select_queue`] chose.
    pub fn advance(&mut self) -> Transition {
        if self.is_complete() {
            return Transition::Progressed;
        }
        match *self {
            RoleState::RequestQueue { .. } => return Transition::Delegate,
            RoleState::Send {
                via: OpCode::Send, ..
            } => {
                *self.state_mut() = OpState::SendComplete;
                return Transition::Completed;
            }
            _ => {}
        }
        let initiated = self.initiated();
        let done = match *self {
            RoleState::Target {
                role: Role::Receive,
                ..
            } => OpState::RecvComplete,
            _ => OpState::Complete,
        };
        let state = self.state_mut();
        match *state {
            OpState::Init if initiated => {
                *state = OpState::NeedAck;
                Transition::NeedsAck
            }
            OpState::Init => {
                *state = OpState::NeedAck;
                Transition::Progressed
            }
            _ => {
                *state = done;
                Transition::Completed
            }
        }
    }

    /// Marks a request-queue delivery.
    pub fn deliver(&mut self) {
        if let RoleState::RequestQueue { state } = self {
            *state = OpState::RecvComplete;
        }
    }
}

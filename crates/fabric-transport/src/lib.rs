#![warn(missing_docs)]

//! User-space RDMA transport: TCP rendezvous, registered memory, a
//! flow-controlled many-to-one request queue and a polling completion engine.

pub mod cancel;
pub mod config;
pub mod deadline;
pub mod error;
pub mod metrics;
pub mod nic;
pub mod rdma_sim;
pub mod role;
pub mod url;
pub mod wc;

mod completion;
mod connection;
mod directory;
mod handshake;
mod memory;
mod request_queue;
mod transfer;
mod transport;

pub use cancel::{CancelHandle, CancelReason};
pub use completion::Status;
pub use config::{DeliveryMode, TransportConfig};
pub use connection::{ConnectionState, Peer};
pub use error::{Result, ResultCode, TransportError};
pub use memory::{MemoryHandle, RemoteBuffer, SideChannel};
pub use metrics::MetricsSnapshot;
pub use nic::NicDriver;
pub use rdma_sim::{SimFabric, SimFabricConfig};
pub use request_queue::QueueStats;
pub use role::{OpState, Operation, Role};
pub use transport::Transport;
pub use url::FabricUrl;

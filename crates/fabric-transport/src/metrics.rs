//! Transport counters.
//!
//! Each counter is a relaxed `AtomicU64`; [`TransportMetrics::snapshot`]
//! reads them one by one, so a snapshot taken under load is not atomic across
//! fields.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

macro_rules! counters {
    ($( $(#[$doc:meta])* $field:ident $(=> $bump:ident)?; )*) => {
        /// Counter values read by [`TransportMetrics::snapshot`].
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct MetricsSnapshot {
            $( $(#[$doc])* pub $field: u64, )*
        }

        /// Counters shared by every thread that touches a transport.
        #[derive(Default)]
        pub struct TransportMetrics {
            $( $field: AtomicU64, )*
        }

        impl TransportMetrics {
            $($(
                #[doc = concat!("Adds one to `", stringify!($field), "`.")]
                pub fn $bump(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )?)*

            /// Reads every counter.
            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $( $field: self.$field.load(Ordering::Relaxed), )*
                }
            }
        }
    };
}

counters! {
    /// Connections established, in either direction.
    connections_opened;
    /// Connections torn down.
    connections_closed;
    /// Connections currently in the directory.
    active_connections;
    /// Buffers registered, request queue included.
    buffers_registered => inc_buffers_registered;
    /// Buffers unregistered, request queue included.
    buffers_unregistered => inc_buffers_unregistered;
    /// Bytes written to peers by `put` and `send`.
    bytes_put;
    /// Bytes pulled from peers by `get`.
    bytes_got;
    /// Requests sent into a peer's request queue.
    requests_sent => inc_requests_sent;
    /// Requests delivered from the local request queue.
    requests_received => inc_requests_received;
    /// Slot claims that found the request queue full.
    slot_overflows => inc_slot_overflows;
    /// Resets of the request queue's shared index.
    queue_resets => inc_queue_resets;
    /// Unblock notifications broadcast to clients.
    unblocks_sent => inc_unblocks_sent;
    /// Unblock notifications consumed by this client.
    unblocks_received => inc_unblocks_received;
    /// Waits that returned OK.
    waits_completed => inc_waits_completed;
    /// Waits that ran out of time.
    waits_timed_out => inc_waits_timed_out;
    /// Waits that observed cancellation.
    waits_cancelled => inc_waits_cancelled;
    /// Completion events that reported failure.
    completion_errors => inc_completion_errors;
}

impl std::fmt::Debug for TransportMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.snapshot().fmt(f)
    }
}

impl TransportMetrics {
    /// All counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumps the opened total and the active gauge.
    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Bumps the closed total. The active gauge saturates at zero.
    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub(crate) fn add_bytes_put(&self, bytes: u64) {
        self.bytes_put.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_got(&self, bytes: u64) {
        self.bytes_got.fetch_add(bytes, Ordering::Relaxed);
    }
}

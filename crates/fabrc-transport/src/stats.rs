//! Protocol statistics.
//!
//! Counters are diagnostics only; protocol decisions never read them.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! proto_stats {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Snapshot of protocol counters at a point in time.
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        pub struct StatsSnapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        /// Lock-free protocol counters shared by an endpoint and its readers.
        #[derive(Default)]
        pub struct ProtoStats {
            $($name: AtomicU64,)*
        }

        impl ProtoStats {
            $(
                $(#[$doc])*
                pub fn $name(&self) -> &AtomicU64 {
                    &self.$name
                }
            )*

            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }

            pub fn reset(&self) {
                $(self.$name.store(0, Ordering::Relaxed);)*
            }
        }
    };
}

proto_stats! {
    /// Wire packets handed to the NIC, including retransmissions.
    packets_sent,
    packets_received,
    bytes_sent,
    bytes_received,
    messages_sent,
    messages_received,
    /// Send control blocks released by an acknowledgement.
    scbs_acked,
    /// Send control blocks completed by a reliable-delivery post.
    scbs_delivered,
    acks_sent,
    acks_received,
    naks_sent,
    naks_received,
    err_chk_sent,
    err_chk_received,
    becn_sent,
    becn_received,
    /// Packets re-posted after a NAK.
    retransmits,
    duplicates_received,
    out_of_order_received,
    reorder_overflow,
    stale_acks,
    /// Flush attempts stopped by an empty credit window.
    no_flow_credits,
    /// Posts refused by the NIC or the send pool.
    send_no_resources,
    credit_grows,
    credit_shrinks,
    ctrl_msgs_queued,
    ack_overwrites,
    ctrl_msg_queue_overflow,
    /// Ack timeouts that found the packet's local send still pending.
    send_dma_wait,
    checksum_errors,
    invalid_packets,
    connect_requests_sent,
    connect_replies_sent,
    connects_established,
    stale_connect_dropped,
    duplicate_connect_dropped,
    disconnect_requests_sent,
    disconnect_requests_received,
    disconnect_replies_sent,
    disconnect_timeouts,
    reconnects,
    connect_timeouts,
    fatal_errors,
    rc_qp_created,
    rc_qp_draining,
    rc_qp_freed,
    drain_markers_posted,
    /// Drain markers refused by a full send queue and left for a retry.
    drain_marker_deferred,
    rts_sent,
    cts_sent,
    rdma_writes_posted,
    rdma_windows,
    long_data_windows,
    mr_cache_full,
    rndv_retries,
    send_completions,
    recv_completions,
    completion_errors,
    recv_no_match,
    yields,
}

impl ProtoStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments a counter by one.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

impl fmt::Debug for ProtoStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtoStats")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

//! Protocol configuration.

use crate::error::{Result, TransportError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Upper bound on any flow's credit window.
pub const MAX_CREDIT: u16 = 16384;

/// Selects how data packets reach a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportMode {
    /// All traffic over the endpoint's unreliable datagram QP.
    Datagram,
    /// Data over a per-peer reliable connected QP, control over datagram.
    Reliable,
}

/// Credit window bounds, parsed from `"min:max:adjust"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowCredits {
    pub min: u16,
    pub max: u16,
    pub adjust: u16,
}

impl FlowCredits {
    pub fn fixed(credits: u16) -> Self {
        Self {
            min: credits,
            max: credits,
            adjust: 0,
        }
    }

    pub fn is_adaptive(&self) -> bool {
        self.max > self.min && self.adjust > 0
    }

    pub fn validate(&self) -> Result<()> {
        if self.min == 0 || self.max == 0 {
            return Err(TransportError::InvalidConfig(
                "flow credits min and max must be non-zero".into(),
            ));
        }
        if self.min > self.max {
            return Err(TransportError::InvalidConfig(format!(
                "flow credits min {} exceeds max {}",
                self.min, self.max
            )));
        }
        if self.max > MAX_CREDIT {
            return Err(TransportError::InvalidConfig(format!(
                "flow credits max {} exceeds {}",
                self.max, MAX_CREDIT
            )));
        }
        if self.max > self.min && self.adjust == 0 {
            return Err(TransportError::InvalidConfig(
                "flow credits adjust must be non-zero when max > min".into(),
            ));
        }
        Ok(())
    }
}

impl Default for FlowCredits {
    fn default() -> Self {
        Self {
            min: 32,
            max: 128,
            adjust: 4,
        }
    }
}

impl FromStr for FlowCredits {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |field: &str, name: &str| -> Result<u16> {
            field.trim().parse::<u16>().map_err(|_| {
                TransportError::InvalidConfig(format!("flow credits {}: bad value {:?}", name, field))
            })
        };
        let parts: Vec<&str> = s.split(':').collect();
        let credits = match parts.as_slice() {
            [min] => FlowCredits::fixed(parse(min, "min")?),
            [min, max] => FlowCredits {
                min: parse(min, "min")?,
                max: parse(max, "max")?,
                adjust: FlowCredits::default().adjust,
            },
            [min, max, adjust] => FlowCredits {
                min: parse(min, "min")?,
                max: parse(max, "max")?,
                adjust: parse(adjust, "adjust")?,
            },
            _ => {
                return Err(TransportError::InvalidConfig(format!(
                    "flow credits: expected min:max:adjust, got {:?}",
                    s
                )))
            }
        };
        credits.validate()?;
        Ok(credits)
    }
}

/// Protocol engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtoConfig {
    pub mode: TransportMode,
    pub flow_credits: FlowCredits,
    /// Starting window; clamped into `(min, max)`, else the midpoint.
    pub initial_credits: u16,
    /// Minimum PSN progress between two credit grows.
    pub credits_inc_thresh: u32,
    /// Low PSN bits mixed into each credit adjustment.
    pub credits_jitter_mask: u32,
    /// Optional byte-granular credit budget per flow.
    pub flow_credit_bytes: Option<u64>,
    /// Payload bytes per wire packet.
    pub mtu: usize,
    pub send_buffers: usize,
    pub send_cq_coalesce: u32,
    pub send_reap_thresh: usize,
    pub ud_recv_buffers: usize,
    pub rc_recv_buffers: usize,
    pub cq_batch: usize,
    pub ack_timeout_us: u64,
    pub ack_timeout_factor: u32,
    pub ack_timeout_max_us: u64,
    pub send_retry_us: u64,
    pub ctrlq_retry_us: u64,
    pub coalesce_acks: bool,
    pub checksum: bool,
    pub max_reorder: usize,
    pub allow_reconnect: bool,
    pub connect_timeout_us: u64,
    pub connect_retry_us: u64,
    pub connect_retry_max_us: u64,
    pub disconnect_timeout_us: u64,
    pub disconnect_retry_us: u64,
    /// Messages larger than this go through rendezvous.
    pub rndv_threshold: usize,
    pub rndv_window: usize,
    /// Extra CTS windows that may be outstanding beyond the first.
    pub rndv_prefetch: u32,
    pub rdma_enabled: bool,
    pub mr_cache_entries: usize,
    /// Packets per long-data send control block.
    pub long_data_frags: u16,
    pub yield_spin_count: u32,
    pub close_timeout_us: u64,
    pub close_grace_period_us: Option<u64>,
    pub close_grace_interval_us: Option<u64>,
    pub close_min_grace_us: u64,
    pub close_min_grace_interval_us: u64,
    pub close_max_grace_interval_us: u64,
    pub poll_thread_interval_us: u64,
}

impl Default for ProtoConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Datagram,
            flow_credits: FlowCredits::default(),
            initial_credits: 64,
            credits_inc_thresh: 2048,
            credits_jitter_mask: 0xF,
            flow_credit_bytes: None,
            mtu: 4096,
            send_buffers: 1024,
            send_cq_coalesce: 8,
            send_reap_thresh: 256,
            ud_recv_buffers: 512,
            rc_recv_buffers: 256,
            cq_batch: 32,
            ack_timeout_us: 2_000,
            ack_timeout_factor: 2,
            ack_timeout_max_us: 1_000_000,
            send_retry_us: 20,
            ctrlq_retry_us: 20,
            coalesce_acks: true,
            checksum: false,
            max_reorder: 4096,
            allow_reconnect: true,
            connect_timeout_us: 30_000_000,
            connect_retry_us: 100_000,
            connect_retry_max_us: 2_000_000,
            disconnect_timeout_us: 2_000_000,
            disconnect_retry_us: 100_000,
            rndv_threshold: 64 * 1024,
            rndv_window: 128 * 1024,
            rndv_prefetch: 0,
            rdma_enabled: true,
            mr_cache_entries: 64,
            long_data_frags: 4,
            yield_spin_count: 250,
            close_timeout_us: 2_000_000,
            close_grace_period_us: None,
            close_grace_interval_us: None,
            close_min_grace_us: 1_000_000,
            close_min_grace_interval_us: 100_000,
            close_max_grace_interval_us: 1_000_000,
            poll_thread_interval_us: 1_000,
        }
    }
}

impl ProtoConfig {
    pub fn with_mode(mut self, mode: TransportMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_flow_credits(mut self, credits: FlowCredits) -> Self {
        self.flow_credits = credits;
        self
    }

    pub fn with_initial_credits(mut self, credits: u16) -> Self {
        self.initial_credits = credits;
        self
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_ack_timeout(mut self, base: Duration, factor: u32, max: Duration) -> Self {
        self.ack_timeout_us = base.as_micros() as u64;
        self.ack_timeout_factor = factor;
        self.ack_timeout_max_us = max.as_micros() as u64;
        self
    }

    pub fn with_coalesce_acks(mut self, coalesce: bool) -> Self {
        self.coalesce_acks = coalesce;
        self
    }

    pub fn with_checksum(mut self, checksum: bool) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_reconnect(mut self, allow: bool) -> Self {
        self.allow_reconnect = allow;
        self
    }

    pub fn with_rendezvous(mut self, threshold: usize, window: usize, prefetch: u32) -> Self {
        self.rndv_threshold = threshold;
        self.rndv_window = window;
        self.rndv_prefetch = prefetch;
        self
    }

    pub fn with_rdma(mut self, enabled: bool) -> Self {
        self.rdma_enabled = enabled;
        self
    }

    pub fn with_mr_cache_entries(mut self, entries: usize) -> Self {
        self.mr_cache_entries = entries;
        self
    }

    pub fn with_send_buffers(mut self, buffers: usize, coalesce: u32, reap_thresh: usize) -> Self {
        self.send_buffers = buffers;
        self.send_cq_coalesce = coalesce;
        self.send_reap_thresh = reap_thresh;
        self
    }

    pub fn with_close_grace(mut self, min_grace: Duration, min_interval: Duration) -> Self {
        self.close_min_grace_us = min_grace.as_micros() as u64;
        self.close_min_grace_interval_us = min_interval.as_micros() as u64;
        self
    }

    /// Credits a new flow starts with.
    pub fn starting_credits(&self) -> u16 {
        let fc = &self.flow_credits;
        if fc.min == fc.max {
            return fc.min;
        }
        if self.initial_credits > fc.min && self.initial_credits < fc.max {
            self.initial_credits
        } else {
            fc.min + (fc.max - fc.min) / 2
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_micros(self.ack_timeout_us)
    }

    pub fn ack_timeout_max(&self) -> Duration {
        Duration::from_micros(self.ack_timeout_max_us)
    }

    pub fn send_retry(&self) -> Duration {
        Duration::from_micros(self.send_retry_us)
    }

    pub fn ctrlq_retry(&self) -> Duration {
        Duration::from_micros(self.ctrlq_retry_us)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_micros(self.connect_timeout_us)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_micros(self.connect_retry_us)
    }

    pub fn connect_retry_max(&self) -> Duration {
        Duration::from_micros(self.connect_retry_max_us)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_micros(self.disconnect_timeout_us)
    }

    pub fn disconnect_retry(&self) -> Duration {
        Duration::from_micros(self.disconnect_retry_us)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_micros(self.close_timeout_us)
    }

    pub fn poll_thread_interval(&self) -> Duration {
        Duration::from_micros(self.poll_thread_interval_us)
    }

    /// Grace period a closing endpoint waits for inbound disconnects:
    /// half of the close timeout unless configured, never below the minimum.
    pub fn close_grace_period(&self, timeout: Duration) -> Duration {
        let grace = self
            .close_grace_period_us
            .map(Duration::from_micros)
            .unwrap_or(timeout / 2);
        grace.max(Duration::from_micros(self.close_min_grace_us))
    }

    /// Interval that must see at least one new inbound disconnect for the
    /// grace wait to continue. Scales with the number of connections.
    pub fn close_grace_interval(&self, connections: usize) -> Duration {
        let min = Duration::from_micros(self.close_min_grace_interval_us);
        let max = Duration::from_micros(self.close_max_grace_interval_us);
        let interval = match self.close_grace_interval_us {
            Some(us) => Duration::from_micros(us),
            None => Duration::from_micros(100).saturating_mul(connections as u32),
        };
        interval.clamp(min, max.max(min))
    }

    pub fn validate(&self) -> Result<()> {
        self.flow_credits.validate()?;
        if self.mtu < 64 || self.mtu % 4 != 0 {
            return Err(TransportError::InvalidConfig(format!(
                "mtu {} must be at least 64 and a multiple of 4",
                self.mtu
            )));
        }
        if self.send_cq_coalesce == 0 || self.send_buffers < self.send_cq_coalesce as usize {
            return Err(TransportError::InvalidConfig(format!(
                "send_buffers {} must hold at least one coalesce group of {}",
                self.send_buffers, self.send_cq_coalesce
            )));
        }
        if self.ud_recv_buffers == 0 || self.rc_recv_buffers == 0 || self.cq_batch == 0 {
            return Err(TransportError::InvalidConfig(
                "receive buffers and cq batch must be non-zero".into(),
            ));
        }
        if self.ack_timeout_us == 0 || self.ack_timeout_factor == 0 {
            return Err(TransportError::InvalidConfig(
                "ack timeout and factor must be non-zero".into(),
            ));
        }
        if self.ack_timeout_max_us < self.ack_timeout_us {
            return Err(TransportError::InvalidConfig(
                "ack_timeout_max below ack_timeout".into(),
            ));
        }
        if self.rndv_window == 0 || self.rndv_window % self.mtu != 0 {
            return Err(TransportError::InvalidConfig(format!(
                "rndv_window {} must be a non-zero multiple of mtu {}",
                self.rndv_window, self.mtu
            )));
        }
        if self.long_data_frags == 0 || self.long_data_frags > self.flow_credits.min {
            return Err(TransportError::InvalidConfig(format!(
                "long_data_frags {} must be in 1..={}",
                self.long_data_frags, self.flow_credits.min
            )));
        }
        if self.rndv_threshold < self.mtu {
            return Err(TransportError::InvalidConfig(
                "rndv_threshold must be at least one mtu".into(),
            ));
        }
        if self.credits_inc_thresh == 0 {
            return Err(TransportError::InvalidConfig(
                "credits_inc_thresh must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

//! Fabrc transport core: reliable, flow-controlled messaging over RDMA-style
//! queue pairs, with ack/nak recovery, reliable-QP drain and reconnection,
//! and a windowed rendezvous engine for large messages.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod ctrlq;
pub mod endpoint;
pub mod error;
pub mod flow;
pub mod mq;
pub mod proto;
pub mod psn;
pub mod rcqp;
mod reaper;
mod receive;
pub mod reliability;
pub mod rendezvous;
pub mod scb;
pub mod sim;
pub mod stats;
pub mod timer;
pub mod verbs;
pub mod wire;

pub use config::{FlowCredits, ProtoConfig, TransportMode};
pub use connection::ConnState;
pub use endpoint::{Endpoint, EndpointRegistry};
pub use error::{Result, TransportError};
pub use flow::{FlowClass, FlowKey};
pub use mq::Received;
pub use proto::{InflightReport, Proto};
pub use psn::Psn;
pub use sim::{SimFabric, SimNic};
pub use stats::{ProtoStats, StatsSnapshot};
pub use verbs::{CopyOnly, CopyStrategy, HostCopy, TransportStrategy};
pub use wire::Epid;

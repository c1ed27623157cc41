//! Fabrc Test & Validation Infrastructure
//!
//! Property-based tests for the sequencing, buffer and credit primitives,
//! and two-endpoint scenarios over the simulated fabric: flow control, loss
//! recovery, rendezvous windows and reliable QP failure handling.

pub mod flow_control_tests;
pub mod harness;
pub mod proptest_transport;
pub mod rendezvous_tests;

pub use harness::{engine, init_tracing, Outcomes, Pair, RawPeer, A, B};

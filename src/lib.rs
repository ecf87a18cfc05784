//! eBPF-based network flow capture and aggregation agent.
//!
//! The agent attaches traffic-control classifiers to the configured
//! network interfaces, aggregates packets into flow records inside the
//! kernel and drains them through a staged userspace pipeline
//! (accounting, deduplication, rate limiting, decoration) into an
//! export sink.

pub mod agent;
pub mod config;
pub mod ebpf;
pub mod export;
pub mod flow;
pub mod ifaces;
pub mod metrics;

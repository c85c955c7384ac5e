//! Point-to-point RDMA echo benchmark over a reliable-connected queue pair.
//!
//! A client sends messages, the server echoes them back, and throughput is
//! measured once a warm-up threshold has been crossed.

pub mod affinity;
pub mod bench;
pub mod config;
pub mod connection;
pub mod constants;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod qp;
pub mod ring;
pub mod stats;
pub mod submit;
pub mod verbs;

pub use bench::{run_role, BenchParams, Role};
pub use config::{BenchConfig, ConfigLoader};
pub use error::{BenchError, Result};

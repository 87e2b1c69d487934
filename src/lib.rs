//! One-sided RDMA demonstrations over a reliable-connected transport.
//!
//! A passive server registers a buffer and exports its remote-access
//! descriptor; an active client then drives one of three one-sided
//! operations against it (atomic fetch-and-add, RDMA read, RDMA write).
//! Connection establishment goes through librdmacm, and the remote
//! key/address pair is swapped over an ordinary TCP side channel before
//! any work request is posted. Everything is built atop the [`rdma-sys`]
//! crate.
//!
//! The three demo variants share one session core ([`session`])
//! parameterized by an operation strategy ([`op::OpKind`]); the binaries
//! under `src/bin/` are thin CLI glue around it.
//!
//! [`rdma-sys`]: https://docs.rs/rdma-sys/latest/rdma_sys/

mod config;
mod error;

pub mod cm;
pub mod op;
pub mod rdma;
pub mod session;

/// TCP-based control utilities (descriptor exchange and acknowledgements).
pub mod ctrl;

pub use config::{Config, Role, DEFAULT_COUNT, DEFAULT_PORT};
pub use error::{CmError, Error, OpError, Result};

//! Safe wrappers over the ibverbs resources of one session.
//!
//! Each wrapper owns exactly one verbs object and releases it on drop;
//! [`crate::session::RdmaSession`] orders its fields so that drops run in
//! strict reverse order of acquisition.

pub mod cq;
pub mod mr;
pub mod pd;
pub mod qp;

pub use cq::{CompChannel, Cq, Wc, WcOpcode};
pub use mr::{AlignedBuf, Mr, MrDescriptor, Permission};
pub use pd::Pd;
pub use qp::Qp;

//! Connection establishment via librdmacm.
//!
//! The wrappers here mirror the rdma_cm object model: an event channel
//! delivering asynchronous connection-manager events, and connection
//! identifiers that progress through address/route resolution (client) or
//! bind/listen (server) before the final accept/connect handshake. The
//! expected event ordering is tracked by an explicit state machine
//! ([`CmState`]) instead of ad-hoc control flow.

mod event;
mod id;
mod state;

pub use event::{CmEvent, CmEventKind, EventChannel};
pub use id::{CmId, ConnParams};
pub use state::{CmState, CmStep};

//! Operation strategies.
//!
//! The three demo variants differ only in buffer size, memory access
//! rights, the work request posted, the completion opcode awaited, and how
//! the server observes the client's progress. [`OpKind`] carries those
//! differences so the session core stays variant-agnostic.

use std::time::Duration;

use crate::error::OpError;
use crate::rdma::{Cq, Mr, MrDescriptor, Permission, Qp, WcOpcode};

/// Size of the shared 64-bit counter (atomic variant).
pub const COUNTER_SIZE: usize = 8;

/// Size of the text message buffer (read/write variants).
pub const MSG_SIZE: usize = 64;

/// Addend of each atomic fetch-and-add.
pub const ATOMIC_ADD_VALUE: u64 = 1;

/// Base text of authored messages; a sequence number is appended.
pub const MSG_BASE: &str = "hello over one-sided RDMA";

/// Compose the `seq`-th message authored into a text buffer.
pub fn compose_message(seq: u32) -> String {
    format!("{MSG_BASE} #{seq}")
}

/// The one-sided operation a run demonstrates, selected once per process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpKind {
    /// Remote atomic fetch-and-add on the server's 64-bit counter.
    FetchAdd,
    /// RDMA read of the server's text buffer.
    Read,
    /// RDMA write into the server's text buffer.
    Write,
}

impl OpKind {
    pub fn name(self) -> &'static str {
        match self {
            OpKind::FetchAdd => "atomic fetch-and-add",
            OpKind::Read => "RDMA read",
            OpKind::Write => "RDMA write",
        }
    }

    /// Registered buffer size for this variant.
    pub fn buf_len(self) -> usize {
        match self {
            OpKind::FetchAdd => COUNTER_SIZE,
            OpKind::Read | OpKind::Write => MSG_SIZE,
        }
    }

    /// Access rights the buffer is registered with, on both peers.
    pub fn permission(self) -> Permission {
        match self {
            OpKind::FetchAdd => Permission::LOCAL_WRITE | Permission::REMOTE_ATOMIC,
            OpKind::Read | OpKind::Write => {
                Permission::LOCAL_WRITE | Permission::REMOTE_READ | Permission::REMOTE_WRITE
            }
        }
    }

    /// Completion opcode that ends the wait for one posted request.
    pub fn wc_opcode(self) -> WcOpcode {
        match self {
            OpKind::FetchAdd => WcOpcode::FetchAdd,
            OpKind::Read => WcOpcode::RdmaRead,
            OpKind::Write => WcOpcode::RdmaWrite,
        }
    }

    /// Whether the client acknowledges each completion over the side
    /// channel. The write variant does not: the server observes the buffer
    /// directly.
    pub fn uses_ack(self) -> bool {
        !matches!(self, OpKind::Write)
    }

    /// Delay between client operations, pacing the server's observation
    /// loop. Best-effort mitigation, not a correctness guarantee.
    pub fn pacing(self) -> Duration {
        match self {
            OpKind::FetchAdd => Duration::from_millis(10),
            OpKind::Read => Duration::from_millis(1),
            OpKind::Write => Duration::ZERO,
        }
    }

    /// Post this variant's work request and busy-wait for its completion.
    /// Exactly one request is outstanding at a time; there is no pipelining.
    pub fn execute(self, qp: &Qp, cq: &Cq, local: &Mr, remote: &MrDescriptor) -> Result<(), OpError> {
        match self {
            OpKind::FetchAdd => qp.post_fetch_add(local, remote, ATOMIC_ADD_VALUE)?,
            OpKind::Read => qp.post_read(local, remote)?,
            OpKind::Write => qp.post_write(local, remote)?,
        }
        cq.wait(self.wc_opcode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_sizes_per_variant() {
        assert_eq!(OpKind::FetchAdd.buf_len(), 8);
        assert_eq!(OpKind::Read.buf_len(), 64);
        assert_eq!(OpKind::Write.buf_len(), 64);
    }

    #[test]
    fn access_rights_per_variant() {
        let atomic = OpKind::FetchAdd.permission();
        assert!(atomic.contains(Permission::LOCAL_WRITE));
        assert!(atomic.contains(Permission::REMOTE_ATOMIC));
        assert!(!atomic.contains(Permission::REMOTE_READ));
        assert!(!atomic.contains(Permission::REMOTE_WRITE));

        for kind in [OpKind::Read, OpKind::Write] {
            let perm = kind.permission();
            assert!(perm.contains(Permission::LOCAL_WRITE));
            assert!(perm.contains(Permission::REMOTE_READ));
            assert!(perm.contains(Permission::REMOTE_WRITE));
            assert!(!perm.contains(Permission::REMOTE_ATOMIC));
        }
    }

    #[test]
    fn completion_opcodes_per_variant() {
        assert_eq!(OpKind::FetchAdd.wc_opcode(), WcOpcode::FetchAdd);
        assert_eq!(OpKind::Read.wc_opcode(), WcOpcode::RdmaRead);
        assert_eq!(OpKind::Write.wc_opcode(), WcOpcode::RdmaWrite);
    }

    #[test]
    fn only_write_skips_the_ack_channel() {
        assert!(OpKind::FetchAdd.uses_ack());
        assert!(OpKind::Read.uses_ack());
        assert!(!OpKind::Write.uses_ack());
    }

    #[test]
    fn messages_are_distinct_per_sequence_and_fit_the_buffer() {
        let a = compose_message(1);
        let b = compose_message(2);
        assert_ne!(a, b);
        assert!(a.len() < MSG_SIZE);
        assert!(compose_message(u32::MAX).len() < MSG_SIZE);
    }
}

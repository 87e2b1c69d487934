use std::io;
use std::mem;
use std::ptr::{self, NonNull};

use rdma_sys::*;

use super::cq::Cq;
use super::mr::{Mr, MrDescriptor};
use super::pd::Pd;
use crate::cm::CmId;
use crate::error::OpError;

/// Send/receive queue depth of the demo transport.
pub const MAX_WR: u32 = 10;

/// Scatter/gather entries per work request.
pub const MAX_SGE: u32 = 1;

/// Reliable-connected queue pair, created on a CM id.
///
/// Destroys the underlying `ibv_qp` on drop via `rdma_destroy_qp`, so it
/// must be dropped before the CQ and PD it references and before the id it
/// was created on; [`crate::session::RdmaSession`] orders its fields
/// accordingly.
pub struct Qp {
    qp: NonNull<ibv_qp>,
    id: NonNull<rdma_cm_id>,
}

impl Qp {
    /// Create an RC queue pair on the id, bound to the completion queue for
    /// both send and receive completions.
    pub fn create(id: &CmId, pd: &Pd, cq: &Cq) -> io::Result<Self> {
        // SAFETY: POD type.
        let mut attr: ibv_qp_init_attr = unsafe { mem::zeroed() };
        attr.send_cq = cq.as_raw();
        attr.recv_cq = cq.as_raw();
        attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        attr.cap.max_send_wr = MAX_WR;
        attr.cap.max_recv_wr = MAX_WR;
        attr.cap.max_send_sge = MAX_SGE;
        attr.cap.max_recv_sge = MAX_SGE;

        // SAFETY: FFI.
        let ret = unsafe { rdma_create_qp(id.as_raw(), pd.as_raw(), &mut attr) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        let qp = NonNull::new(id.qp()).ok_or_else(io::Error::last_os_error)?;
        Ok(Self {
            qp,
            // SAFETY: `as_raw` never returns null.
            id: unsafe { NonNull::new_unchecked(id.as_raw()) },
        })
    }

    pub(crate) fn as_raw(&self) -> *mut ibv_qp {
        self.qp.as_ptr()
    }

    /// Post an atomic fetch-and-add against the peer's counter. The
    /// pre-increment value lands in `local` on completion.
    pub fn post_fetch_add(
        &self,
        local: &Mr,
        remote: &MrDescriptor,
        add: u64,
    ) -> Result<(), OpError> {
        // SAFETY: POD type.
        let mut wr: ibv_send_wr = unsafe { mem::zeroed() };
        wr.opcode = ibv_wr_opcode::IBV_WR_ATOMIC_FETCH_AND_ADD;
        // SAFETY: writing the union member matching the opcode.
        unsafe {
            wr.wr.atomic.remote_addr = remote.addr;
            wr.wr.atomic.rkey = remote.rkey;
            wr.wr.atomic.compare_add = add;
        }
        self.post(&mut wr, local)
    }

    /// Post an RDMA read of the peer's buffer into `local`.
    pub fn post_read(&self, local: &Mr, remote: &MrDescriptor) -> Result<(), OpError> {
        // SAFETY: POD type.
        let mut wr: ibv_send_wr = unsafe { mem::zeroed() };
        wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
        // SAFETY: writing the union member matching the opcode.
        unsafe {
            wr.wr.rdma.remote_addr = remote.addr;
            wr.wr.rdma.rkey = remote.rkey;
        }
        self.post(&mut wr, local)
    }

    /// Post an RDMA write of `local` into the peer's buffer.
    pub fn post_write(&self, local: &Mr, remote: &MrDescriptor) -> Result<(), OpError> {
        // SAFETY: POD type.
        let mut wr: ibv_send_wr = unsafe { mem::zeroed() };
        wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
        // SAFETY: writing the union member matching the opcode.
        unsafe {
            wr.wr.rdma.remote_addr = remote.addr;
            wr.wr.rdma.rkey = remote.rkey;
        }
        self.post(&mut wr, local)
    }

    fn post(&self, wr: &mut ibv_send_wr, local: &Mr) -> Result<(), OpError> {
        let mut sge = local.sge();
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;

        let mut bad_wr = ptr::null_mut();
        // SAFETY: FFI; `wr` and `sge` outlive the call.
        let ret = unsafe { ibv_post_send(self.as_raw(), wr, &mut bad_wr) };
        if ret != 0 {
            return Err(OpError::Post(io::Error::from_raw_os_error(ret)));
        }
        Ok(())
    }

    /// Tighten the QP's RNR and transport timers.
    ///
    /// Which attributes are settable depends on the current QP state, so
    /// the state is queried first: `min_rnr_timer` from RTR onward,
    /// `timeout` only at RTS.
    pub fn tune_timeouts(&self, value: u8) -> io::Result<()> {
        // SAFETY: POD types.
        let mut attr: ibv_qp_attr = unsafe { mem::zeroed() };
        let mut init: ibv_qp_init_attr = unsafe { mem::zeroed() };
        // SAFETY: FFI.
        let ret = unsafe {
            ibv_query_qp(
                self.as_raw(),
                &mut attr,
                ibv_qp_attr_mask::IBV_QP_STATE.0 as i32,
                &mut init,
            )
        };
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
        let state = attr.qp_state;

        if state >= ibv_qp_state::IBV_QPS_RTR {
            // SAFETY: POD type.
            let mut attr: ibv_qp_attr = unsafe { mem::zeroed() };
            attr.min_rnr_timer = value;
            // SAFETY: FFI.
            let ret = unsafe {
                ibv_modify_qp(
                    self.as_raw(),
                    &mut attr,
                    ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER.0 as i32,
                )
            };
            if ret != 0 {
                return Err(io::Error::from_raw_os_error(ret));
            }
        }

        if state == ibv_qp_state::IBV_QPS_RTS {
            // SAFETY: POD type.
            let mut attr: ibv_qp_attr = unsafe { mem::zeroed() };
            attr.timeout = value;
            // SAFETY: FFI.
            let ret = unsafe {
                ibv_modify_qp(
                    self.as_raw(),
                    &mut attr,
                    ibv_qp_attr_mask::IBV_QP_TIMEOUT.0 as i32,
                )
            };
            if ret != 0 {
                return Err(io::Error::from_raw_os_error(ret));
            }
        }
        Ok(())
    }
}

impl Drop for Qp {
    fn drop(&mut self) {
        // SAFETY: called once, while the CQ, PD and id the QP references
        // are all still alive.
        unsafe { rdma_destroy_qp(self.id.as_ptr()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The QP must release itself rather than deferring to the CM id, or
    // the CQ and PD it references would be destroyed first and fail with
    // EBUSY. `RdmaSession` relies on this drop running before theirs.
    #[test]
    fn qp_destruction_is_its_own_drop() {
        assert!(std::mem::needs_drop::<Qp>());
    }
}

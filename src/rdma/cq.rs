use std::ffi::CStr;
use std::io;
use std::mem;
use std::ptr::{self, NonNull};

use rdma_sys::*;

use crate::cm::CmId;
use crate::error::OpError;

/// Opcode of a completion queue entry, restricted to the operations this
/// crate posts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WcOpcode {
    /// RDMA write request.
    RdmaWrite,
    /// RDMA read request.
    RdmaRead,
    /// RDMA fetch-and-add request.
    FetchAdd,
}

impl WcOpcode {
    pub(crate) fn as_raw(self) -> ibv_wc_opcode::Type {
        match self {
            WcOpcode::RdmaWrite => ibv_wc_opcode::IBV_WC_RDMA_WRITE,
            WcOpcode::RdmaRead => ibv_wc_opcode::IBV_WC_RDMA_READ,
            WcOpcode::FetchAdd => ibv_wc_opcode::IBV_WC_FETCH_ADD,
        }
    }
}

/// One polled work completion.
#[repr(transparent)]
pub struct Wc(ibv_wc);

impl Wc {
    pub fn is_success(&self) -> bool {
        self.0.status == ibv_wc_status::IBV_WC_SUCCESS
    }

    pub fn matches(&self, opcode: WcOpcode) -> bool {
        self.0.opcode == opcode.as_raw()
    }

    /// Status text as reported by `ibv_wc_status_str`.
    pub fn status_str(&self) -> String {
        // SAFETY: FFI; the returned string is static.
        unsafe { CStr::from_ptr(ibv_wc_status_str(self.0.status)) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Completion channel.
///
/// Allocated so the CQ has one attached, but never armed: completion
/// retrieval in this crate is busy polling. Isolating the wait behind
/// [`Cq::wait`] keeps the choice swappable for channel-based blocking
/// without touching callers.
pub struct CompChannel {
    ch: NonNull<ibv_comp_channel>,
}

impl CompChannel {
    pub fn new(id: &CmId) -> io::Result<Self> {
        // SAFETY: FFI; the id's verbs context is valid here.
        let ch = NonNull::new(unsafe { ibv_create_comp_channel(id.verbs()) })
            .ok_or_else(io::Error::last_os_error)?;
        Ok(Self { ch })
    }

    pub(crate) fn as_raw(&self) -> *mut ibv_comp_channel {
        self.ch.as_ptr()
    }
}

impl Drop for CompChannel {
    fn drop(&mut self) {
        // SAFETY: called once; the CQ attached to this channel is gone first.
        unsafe { ibv_destroy_comp_channel(self.as_raw()) };
    }
}

/// Completion queue.
pub struct Cq {
    cq: NonNull<ibv_cq>,
}

impl Cq {
    /// CQ depth of the demo transport.
    pub const DEPTH: i32 = 10;

    pub fn new(id: &CmId, channel: &CompChannel, depth: i32) -> io::Result<Self> {
        // SAFETY: FFI.
        let cq = unsafe {
            ibv_create_cq(
                id.verbs(),
                depth,
                ptr::null_mut(),
                channel.as_raw(),
                0,
            )
        };
        let cq = NonNull::new(cq).ok_or_else(io::Error::last_os_error)?;
        Ok(Self { cq })
    }

    pub(crate) fn as_raw(&self) -> *mut ibv_cq {
        self.cq.as_ptr()
    }

    /// Non-blockingly poll for at most one work completion.
    pub fn poll_one(&self) -> io::Result<Option<Wc>> {
        // SAFETY: POD type.
        let mut wc: ibv_wc = unsafe { mem::zeroed() };
        // SAFETY: FFI; `wc` has room for one entry.
        let n = unsafe { ibv_poll_cq(self.as_raw(), 1, &mut wc) };
        match n {
            0 => Ok(None),
            n if n > 0 => Ok(Some(Wc(wc))),
            _ => Err(io::Error::last_os_error()),
        }
    }

    /// Busy-wait until a successful completion with the expected opcode
    /// appears.
    ///
    /// Zero entries means retry immediately, no back-off. A negative poll
    /// result is fatal, as is any completion with non-success status.
    /// Completions with an unrelated opcode are ignored; with one request
    /// outstanding at a time there should be none.
    pub fn wait(&self, expected: WcOpcode) -> Result<(), OpError> {
        loop {
            let wc = match self.poll_one().map_err(OpError::Poll)? {
                Some(wc) => wc,
                None => continue,
            };
            if !wc.is_success() {
                return Err(OpError::Completion(wc.status_str()));
            }
            if wc.matches(expected) {
                return Ok(());
            }
        }
    }
}

impl Drop for Cq {
    fn drop(&mut self) {
        // SAFETY: called once; the QP using this CQ is gone first.
        unsafe { ibv_destroy_cq(self.as_raw()) };
    }
}

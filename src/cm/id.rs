use std::io;
use std::net::SocketAddrV4;
use std::ptr::{self, NonNull};

use rdma_sys::*;

use super::event::EventChannel;
use crate::error::CmError;

/// Bound on address and route resolution, in milliseconds.
pub const RESOLVE_TIMEOUT_MS: i32 = 2000;

/// Parameters of the final accept/connect handshake.
///
/// Retries here are transport-level; nothing above the connection manager
/// retries a failed handshake.
#[derive(Clone, Copy, Debug)]
pub struct ConnParams {
    pub initiator_depth: u8,
    pub responder_resources: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
}

impl Default for ConnParams {
    fn default() -> Self {
        Self {
            initiator_depth: 1,
            responder_resources: 1,
            retry_count: 7,
            rnr_retry_count: 7,
        }
    }
}

impl ConnParams {
    fn as_raw(&self) -> rdma_conn_param {
        // SAFETY: POD type.
        let mut param: rdma_conn_param = unsafe { std::mem::zeroed() };
        param.initiator_depth = self.initiator_depth;
        param.responder_resources = self.responder_resources;
        param.retry_count = self.retry_count;
        param.rnr_retry_count = self.rnr_retry_count;
        param
    }
}

/// RDMA connection identifier (`rdma_cm_id`), port space `RDMA_PS_TCP`.
///
/// A queue pair created on the id is owned by [`crate::rdma::Qp`] and must
/// be dropped before the id. Ids in turn must be dropped before the event
/// channel they were created on; [`crate::session::RdmaSession`] guarantees
/// both by field order.
pub struct CmId {
    id: NonNull<rdma_cm_id>,
}

impl CmId {
    pub fn new(channel: &EventChannel) -> Result<Self, CmError> {
        let mut id = ptr::null_mut();
        // SAFETY: FFI.
        let ret = unsafe {
            rdma_create_id(
                channel.as_raw(),
                &mut id,
                ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            )
        };
        if ret != 0 {
            return Err(CmError::CreateId(io::Error::last_os_error()));
        }
        let id = NonNull::new(id).ok_or_else(|| CmError::CreateId(io::Error::last_os_error()))?;
        Ok(Self { id })
    }

    /// Wrap an id handed over by librdmacm (a connect request's derived id).
    ///
    /// # Safety
    ///
    /// The pointer must be a valid `rdma_cm_id` whose ownership is being
    /// transferred to the caller.
    pub(crate) unsafe fn from_raw(id: NonNull<rdma_cm_id>) -> Self {
        Self { id }
    }

    pub(crate) fn as_raw(&self) -> *mut rdma_cm_id {
        self.id.as_ptr()
    }

    /// The verbs context this id is bound to. Only valid once the id has
    /// been resolved to a device (after bind on the server path, after
    /// address resolution on the client path).
    pub(crate) fn verbs(&self) -> *mut ibv_context {
        // SAFETY: the id is valid while `self` is alive.
        unsafe { (*self.as_raw()).verbs }
    }

    pub(crate) fn qp(&self) -> *mut ibv_qp {
        // SAFETY: the id is valid while `self` is alive.
        unsafe { (*self.as_raw()).qp }
    }

    /// Server: bind to a local address.
    pub fn bind_addr(&self, addr: SocketAddrV4) -> Result<(), CmError> {
        let mut sin = sockaddr_of(addr);
        // SAFETY: FFI; `sin` outlives the call.
        let ret =
            unsafe { rdma_bind_addr(self.as_raw(), &mut sin as *mut libc::sockaddr_in as *mut _) };
        if ret != 0 {
            return Err(CmError::Bind(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Server: start listening. A backlog of 1 rejects, not queues, a
    /// second concurrent connection attempt.
    pub fn listen(&self, backlog: i32) -> Result<(), CmError> {
        // SAFETY: FFI.
        let ret = unsafe { rdma_listen(self.as_raw(), backlog) };
        if ret != 0 {
            return Err(CmError::Listen(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Client: resolve the peer address to an RDMA device, bounded by
    /// [`RESOLVE_TIMEOUT_MS`]. Completion is reported asynchronously as an
    /// `ADDR_RESOLVED` event.
    pub fn resolve_addr(&self, addr: SocketAddrV4) -> Result<(), CmError> {
        let mut sin = sockaddr_of(addr);
        // SAFETY: FFI; `sin` outlives the call.
        let ret = unsafe {
            rdma_resolve_addr(
                self.as_raw(),
                ptr::null_mut(),
                &mut sin as *mut libc::sockaddr_in as *mut _,
                RESOLVE_TIMEOUT_MS,
            )
        };
        if ret != 0 {
            return Err(CmError::ResolveAddr(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Client: resolve a route to the peer, bounded by
    /// [`RESOLVE_TIMEOUT_MS`]. Completion is a `ROUTE_RESOLVED` event.
    pub fn resolve_route(&self) -> Result<(), CmError> {
        // SAFETY: FFI.
        let ret = unsafe { rdma_resolve_route(self.as_raw(), RESOLVE_TIMEOUT_MS) };
        if ret != 0 {
            return Err(CmError::ResolveRoute(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn accept(&self, params: &ConnParams) -> Result<(), CmError> {
        let mut raw = params.as_raw();
        // SAFETY: FFI; `raw` outlives the call.
        let ret = unsafe { rdma_accept(self.as_raw(), &mut raw) };
        if ret != 0 {
            return Err(CmError::Accept(io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn connect(&self, params: &ConnParams) -> Result<(), CmError> {
        let mut raw = params.as_raw();
        // SAFETY: FFI; `raw` outlives the call.
        let ret = unsafe { rdma_connect(self.as_raw(), &mut raw) };
        if ret != 0 {
            return Err(CmError::Connect(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for CmId {
    fn drop(&mut self) {
        // SAFETY: called once; the QP created on this id, if any, is
        // already gone ([`crate::rdma::Qp`] destroys it).
        unsafe { rdma_destroy_id(self.as_raw()) };
    }
}

fn sockaddr_of(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from(*addr.ip()).to_be(),
        },
        sin_zero: [0; 8],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn conn_params_default_matches_handshake_contract() {
        let p = ConnParams::default();
        assert_eq!(p.initiator_depth, 1);
        assert_eq!(p.responder_resources, 1);
        assert_eq!(p.retry_count, 7);
        assert_eq!(p.rnr_retry_count, 7);
    }

    #[test]
    fn sockaddr_is_network_byte_order() {
        let sin = sockaddr_of(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 18515));
        assert_eq!(sin.sin_port, 18515u16.to_be());
        assert_eq!(sin.sin_addr.s_addr, u32::from_be_bytes([10, 0, 0, 1]).to_be());
    }
}

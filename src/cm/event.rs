use std::ffi::CStr;
use std::io;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

use rdma_sys::*;

use super::id::CmId;
use crate::error::CmError;

/// Typed view of the `rdma_cm_event_type` values this crate cares about.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CmEventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    TimewaitExit,
}

impl CmEventKind {
    pub(crate) fn from_raw(ty: rdma_cm_event_type::Type) -> Option<Self> {
        use rdma_cm_event_type::*;
        Some(match ty {
            RDMA_CM_EVENT_ADDR_RESOLVED => CmEventKind::AddrResolved,
            RDMA_CM_EVENT_ADDR_ERROR => CmEventKind::AddrError,
            RDMA_CM_EVENT_ROUTE_RESOLVED => CmEventKind::RouteResolved,
            RDMA_CM_EVENT_ROUTE_ERROR => CmEventKind::RouteError,
            RDMA_CM_EVENT_CONNECT_REQUEST => CmEventKind::ConnectRequest,
            RDMA_CM_EVENT_CONNECT_ERROR => CmEventKind::ConnectError,
            RDMA_CM_EVENT_UNREACHABLE => CmEventKind::Unreachable,
            RDMA_CM_EVENT_REJECTED => CmEventKind::Rejected,
            RDMA_CM_EVENT_ESTABLISHED => CmEventKind::Established,
            RDMA_CM_EVENT_DISCONNECTED => CmEventKind::Disconnected,
            RDMA_CM_EVENT_TIMEWAIT_EXIT => CmEventKind::TimewaitExit,
            _ => return None,
        })
    }

    /// The librdmacm name of the event, for diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            CmEventKind::AddrResolved => "RDMA_CM_EVENT_ADDR_RESOLVED",
            CmEventKind::AddrError => "RDMA_CM_EVENT_ADDR_ERROR",
            CmEventKind::RouteResolved => "RDMA_CM_EVENT_ROUTE_RESOLVED",
            CmEventKind::RouteError => "RDMA_CM_EVENT_ROUTE_ERROR",
            CmEventKind::ConnectRequest => "RDMA_CM_EVENT_CONNECT_REQUEST",
            CmEventKind::ConnectError => "RDMA_CM_EVENT_CONNECT_ERROR",
            CmEventKind::Unreachable => "RDMA_CM_EVENT_UNREACHABLE",
            CmEventKind::Rejected => "RDMA_CM_EVENT_REJECTED",
            CmEventKind::Established => "RDMA_CM_EVENT_ESTABLISHED",
            CmEventKind::Disconnected => "RDMA_CM_EVENT_DISCONNECTED",
            CmEventKind::TimewaitExit => "RDMA_CM_EVENT_TIMEWAIT_EXIT",
        }
    }
}

/// RDMA CM event channel.
///
/// All connection identifiers of a session share one channel; the channel
/// must outlive every identifier created on it.
pub struct EventChannel {
    ec: NonNull<rdma_event_channel>,
}

impl EventChannel {
    pub fn new() -> Result<Self, CmError> {
        // SAFETY: FFI.
        let ec = NonNull::new(unsafe { rdma_create_event_channel() })
            .ok_or_else(|| CmError::CreateChannel(io::Error::last_os_error()))?;
        Ok(Self { ec })
    }

    pub(crate) fn as_raw(&self) -> *mut rdma_event_channel {
        self.ec.as_ptr()
    }

    /// Block until the next CM event arrives.
    pub fn wait(&self) -> Result<CmEvent<'_>, CmError> {
        let mut evt = ptr::null_mut();
        // SAFETY: FFI; blocks until an event is delivered.
        let ret = unsafe { rdma_get_cm_event(self.as_raw(), &mut evt) };
        if ret != 0 {
            return Err(CmError::GetEvent(io::Error::last_os_error()));
        }
        let evt = NonNull::new(evt).ok_or_else(|| CmError::GetEvent(io::Error::last_os_error()))?;
        Ok(CmEvent {
            evt,
            _marker: PhantomData,
        })
    }

    /// Block for the next event and require it to be of the given kind.
    ///
    /// The retrieved event is acknowledged exactly once whether or not it
    /// matches; a mismatch surfaces as [`CmError::UnexpectedEvent`].
    pub fn wait_for(&self, expected: CmEventKind) -> Result<CmEvent<'_>, CmError> {
        let evt = self.wait()?;
        if evt.kind() != Some(expected) {
            // `evt` is dropped (and thus acked) on this return path.
            return Err(CmError::UnexpectedEvent {
                expected: expected.as_str(),
                actual: describe_event(evt.kind_str(), evt.status()),
            });
        }
        Ok(evt)
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        // SAFETY: called once; all ids on this channel are destroyed first.
        unsafe { rdma_destroy_event_channel(self.as_raw()) };
    }
}

/// A retrieved CM event, acknowledged back to librdmacm on drop.
///
/// Skipping the acknowledgement leaks kernel resources, hence the RAII
/// wrapper rather than an explicit `ack` call.
pub struct CmEvent<'a> {
    evt: NonNull<rdma_cm_event>,
    _marker: PhantomData<&'a EventChannel>,
}

impl CmEvent<'_> {
    pub fn kind(&self) -> Option<CmEventKind> {
        // SAFETY: the event is valid until acked.
        CmEventKind::from_raw(unsafe { (*self.evt.as_ptr()).event })
    }

    /// Event name as reported by librdmacm, covering kinds this crate does
    /// not model.
    pub fn kind_str(&self) -> String {
        // SAFETY: the event is valid until acked; `rdma_event_str` returns
        // a static string.
        unsafe { CStr::from_ptr(rdma_event_str((*self.evt.as_ptr()).event)) }
            .to_string_lossy()
            .into_owned()
    }

    pub fn status(&self) -> i32 {
        // SAFETY: the event is valid until acked.
        unsafe { (*self.evt.as_ptr()).status }
    }

    /// For a connect request, take ownership of the per-connection
    /// identifier delivered with the event. The listening identifier is
    /// never used for data transfer, only the derived one.
    ///
    /// Consumes the event (acknowledging it) so the identifier can be taken
    /// at most once.
    pub fn into_connected_id(self) -> Option<CmId> {
        if self.kind() != Some(CmEventKind::ConnectRequest) {
            return None;
        }
        // SAFETY: the event is valid until acked, and librdmacm transfers
        // ownership of a connect request's id to the application.
        let id = NonNull::new(unsafe { (*self.evt.as_ptr()).id })?;
        Some(unsafe { CmId::from_raw(id) })
    }
}

impl Drop for CmEvent<'_> {
    fn drop(&mut self) {
        // SAFETY: acked exactly once, here.
        unsafe { rdma_ack_cm_event(self.evt.as_ptr()) };
    }
}

/// Render an event for the `UnexpectedEvent` diagnostic. Error-kind events
/// such as `ADDR_ERROR` or `REJECTED` carry a nonzero status worth
/// surfacing; the expected handshake events carry zero.
fn describe_event(kind: String, status: i32) -> String {
    if status == 0 {
        kind
    } else {
        format!("{kind} (status {status})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mapping_round_trips() {
        use rdma_cm_event_type::*;
        for (raw, kind) in [
            (RDMA_CM_EVENT_ADDR_RESOLVED, CmEventKind::AddrResolved),
            (RDMA_CM_EVENT_ROUTE_RESOLVED, CmEventKind::RouteResolved),
            (RDMA_CM_EVENT_CONNECT_REQUEST, CmEventKind::ConnectRequest),
            (RDMA_CM_EVENT_ESTABLISHED, CmEventKind::Established),
            (RDMA_CM_EVENT_DISCONNECTED, CmEventKind::Disconnected),
        ] {
            assert_eq!(CmEventKind::from_raw(raw), Some(kind));
        }
    }

    #[test]
    fn event_diagnostic_carries_nonzero_status() {
        let plain = describe_event("RDMA_CM_EVENT_DISCONNECTED".into(), 0);
        assert_eq!(plain, "RDMA_CM_EVENT_DISCONNECTED");
        let rejected = describe_event("RDMA_CM_EVENT_REJECTED".into(), 8);
        assert_eq!(rejected, "RDMA_CM_EVENT_REJECTED (status 8)");
    }

    #[test]
    fn event_names_match_librdmacm_convention() {
        assert_eq!(
            CmEventKind::ConnectRequest.as_str(),
            "RDMA_CM_EVENT_CONNECT_REQUEST"
        );
        assert_eq!(
            CmEventKind::Established.as_str(),
            "RDMA_CM_EVENT_ESTABLISHED"
        );
    }
}

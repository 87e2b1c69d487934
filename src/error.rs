use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Connection-manager failures.
///
/// librdmacm and ibverbs do not enumerate the errors a call may return;
/// the underlying reason is carried as the errno observed at the call site.
#[derive(Debug, Error)]
pub enum CmError {
    #[error("cannot create RDMA event channel: {0}")]
    CreateChannel(#[source] io::Error),

    #[error("cannot create RDMA CM identifier: {0}")]
    CreateId(#[source] io::Error),

    #[error("cannot bind to address: {0}")]
    Bind(#[source] io::Error),

    #[error("cannot listen: {0}")]
    Listen(#[source] io::Error),

    #[error("address resolution failed: {0}")]
    ResolveAddr(#[source] io::Error),

    #[error("route resolution failed: {0}")]
    ResolveRoute(#[source] io::Error),

    #[error("cannot fetch next CM event: {0}")]
    GetEvent(#[source] io::Error),

    #[error("expected CM event {expected}, got {actual}")]
    UnexpectedEvent {
        expected: &'static str,
        actual: String,
    },

    #[error("cannot accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("cannot connect: {0}")]
    Connect(#[source] io::Error),

    #[error("invalid CM state transition: {0} in state {1}")]
    InvalidTransition(&'static str, &'static str),
}

/// One-sided operation failures.
#[derive(Debug, Error)]
pub enum OpError {
    #[error("cannot post work request: {0}")]
    Post(#[source] io::Error),

    #[error("completion queue poll failed: {0}")]
    Poll(#[source] io::Error),

    #[error("work completion finished with error status: {0}")]
    Completion(String),
}

/// Top-level error taxonomy of a demo run.
///
/// Every error is terminal for the run: it aborts the session, triggers
/// full teardown and is reported to the caller. A clean peer disconnect
/// during the observation loop is *not* an error; the server ends the
/// loop early and reports the partial count as success.
#[derive(Debug, Error)]
pub enum Error {
    #[error("session setup failed: {0}")]
    Setup(#[source] CmError),

    #[error("transport setup failed: {0}")]
    TransportSetup(#[source] io::Error),

    #[error("memory registration failed: {0}")]
    Registration(#[source] io::Error),

    #[error("connection handshake failed: {0}")]
    Handshake(#[from] CmError),

    #[error("descriptor exchange failed: {0}")]
    Exchange(#[source] io::Error),

    #[error("remote operation failed: {0}")]
    Operation(#[from] OpError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unexpected_event_message_names_both_kinds() {
        let err = CmError::UnexpectedEvent {
            expected: "RDMA_CM_EVENT_ESTABLISHED",
            actual: "RDMA_CM_EVENT_REJECTED".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("RDMA_CM_EVENT_ESTABLISHED"));
        assert!(msg.contains("RDMA_CM_EVENT_REJECTED"));
    }

    #[test]
    fn handshake_error_wraps_cm_error() {
        let err: Error = CmError::InvalidTransition("accept", "Init").into();
        assert!(matches!(err, Error::Handshake(_)));
        assert!(err.to_string().contains("handshake"));
    }
}

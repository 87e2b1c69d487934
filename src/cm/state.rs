use crate::error::CmError;

/// Connection-manager states, server and client paths combined.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CmState {
    Init,
    // Server path.
    Bound,
    Listening,
    ConnectRequestReceived,
    Accepting,
    // Client path.
    AddrResolving,
    AddrResolved,
    RouteResolving,
    RouteResolved,
    Connecting,
    // Common tail.
    Established,
    Disconnected,
}

/// A step applied to the state machine, either a call we made or an event
/// we observed on the channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CmStep {
    Bind,
    Listen,
    ConnectRequest,
    ResolveAddr,
    AddrResolved,
    ResolveRoute,
    RouteResolved,
    Accept,
    Connect,
    Established,
    Disconnect,
}

impl CmState {
    pub fn name(self) -> &'static str {
        match self {
            CmState::Init => "Init",
            CmState::Bound => "Bound",
            CmState::Listening => "Listening",
            CmState::ConnectRequestReceived => "ConnectRequestReceived",
            CmState::Accepting => "Accepting",
            CmState::AddrResolving => "AddrResolving",
            CmState::AddrResolved => "AddrResolved",
            CmState::RouteResolving => "RouteResolving",
            CmState::RouteResolved => "RouteResolved",
            CmState::Connecting => "Connecting",
            CmState::Established => "Established",
            CmState::Disconnected => "Disconnected",
        }
    }

    /// Apply one step, yielding the successor state or a typed failure.
    ///
    /// There is no application-level retry: a failed handshake step never
    /// re-enters the machine, it tears the session down.
    pub fn step(self, step: CmStep) -> Result<CmState, CmError> {
        use CmState::*;
        use CmStep as S;

        Ok(match (self, step) {
            (Init, S::Bind) => Bound,
            (Bound, S::Listen) => Listening,
            (Listening, S::ConnectRequest) => ConnectRequestReceived,
            (ConnectRequestReceived, S::Accept) => Accepting,
            (Init, S::ResolveAddr) => AddrResolving,
            (AddrResolving, S::AddrResolved) => AddrResolved,
            (AddrResolved, S::ResolveRoute) => RouteResolving,
            (RouteResolving, S::RouteResolved) => RouteResolved,
            (RouteResolved, S::Connect) => Connecting,
            (Accepting, S::Established) | (Connecting, S::Established) => Established,
            (Established, S::Disconnect) => Disconnected,
            (state, step) => return Err(CmError::InvalidTransition(step.name(), state.name())),
        })
    }
}

impl CmStep {
    pub fn name(self) -> &'static str {
        match self {
            CmStep::Bind => "bind",
            CmStep::Listen => "listen",
            CmStep::ConnectRequest => "connect-request",
            CmStep::ResolveAddr => "resolve-addr",
            CmStep::AddrResolved => "addr-resolved",
            CmStep::ResolveRoute => "resolve-route",
            CmStep::RouteResolved => "route-resolved",
            CmStep::Accept => "accept",
            CmStep::Connect => "connect",
            CmStep::Established => "established",
            CmStep::Disconnect => "disconnect",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_path_reaches_established() {
        let mut state = CmState::Init;
        for step in [
            CmStep::Bind,
            CmStep::Listen,
            CmStep::ConnectRequest,
            CmStep::Accept,
            CmStep::Established,
        ] {
            state = state.step(step).unwrap();
        }
        assert_eq!(state, CmState::Established);
    }

    #[test]
    fn client_path_reaches_established() {
        let mut state = CmState::Init;
        for step in [
            CmStep::ResolveAddr,
            CmStep::AddrResolved,
            CmStep::ResolveRoute,
            CmStep::RouteResolved,
            CmStep::Connect,
            CmStep::Established,
        ] {
            state = state.step(step).unwrap();
        }
        assert_eq!(state, CmState::Established);
    }

    #[test]
    fn accept_before_connect_request_is_rejected() {
        let err = CmState::Listening.step(CmStep::Accept).unwrap_err();
        assert!(matches!(err, CmError::InvalidTransition("accept", "Listening")));
    }

    #[test]
    fn disconnect_only_from_established() {
        assert!(CmState::Established.step(CmStep::Disconnect).is_ok());
        assert!(CmState::Init.step(CmStep::Disconnect).is_err());
    }
}

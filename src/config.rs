use std::net::Ipv4Addr;

/// Which side of the demo this process plays.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// Passive side: registers memory and observes the client's operations.
    Server,
    /// Active side: posts the one-sided work requests.
    Client,
}

/// Immutable run parameters, fixed at startup.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Server or client.
    pub role: Role,
    /// Bind address (server) or peer address (client).
    pub addr: Ipv4Addr,
    /// Primary RDMA port.
    pub port: u16,
    /// Number of one-sided operations to perform or observe.
    pub count: u32,
}

/// Default primary port.
pub const DEFAULT_PORT: u16 = 18515;

/// Default operation count.
pub const DEFAULT_COUNT: u32 = 10;

impl Config {
    pub fn new(role: Role, addr: Ipv4Addr, port: u16, count: u32) -> Self {
        Self {
            role,
            addr,
            port,
            count,
        }
    }

    /// Port of the TCP side channel used for descriptor exchange and ACKs.
    ///
    /// `port` must be at most 65534 so the side channel fits in the port
    /// range; the CLI parsers enforce the bound. Saturates rather than
    /// wrapping to port 0 if a caller bypasses them.
    #[inline]
    pub fn exchange_port(&self) -> u16 {
        self.port.saturating_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_port_is_primary_plus_one() {
        let cfg = Config::new(Role::Server, Ipv4Addr::LOCALHOST, DEFAULT_PORT, 3);
        assert_eq!(cfg.port, 18515);
        assert_eq!(cfg.exchange_port(), 18516);
    }

    #[test]
    fn exchange_port_never_wraps_to_zero() {
        let top = Config::new(Role::Server, Ipv4Addr::LOCALHOST, 65534, 3);
        assert_eq!(top.exchange_port(), 65535);
        // 65535 is rejected by the CLI; if constructed anyway, saturate.
        let over = Config::new(Role::Server, Ipv4Addr::LOCALHOST, 65535, 3);
        assert_eq!(over.exchange_port(), 65535);
    }
}

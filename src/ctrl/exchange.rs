//! TCP side channel for descriptor exchange and acknowledgements.
//!
//! The remote key/address pair needed to build a work request must be known
//! before any one-sided operation can target the peer's memory, and the
//! exchange must be reliable and ordered independently of queue-pair state.
//! A plain TCP connection on `port + 1` carries it, and afterwards the
//! per-operation `ACK` tokens.
//!
//! The exchange ordering is fixed: the server writes its descriptor first
//! and then reads the client's, the client reads first and then writes.
//! Reversing the order on either side deadlocks both peers.

use std::ffi::c_void;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::fd::FromRawFd;

use crate::rdma::MrDescriptor;

/// Out-of-band acknowledgement token, one per confirmed remote operation.
/// No framing, no length prefix.
pub const ACK: &[u8; 3] = b"ACK";

/// Listening side of the exchange channel.
///
/// Built through libc so the listen backlog is exactly 1 (a second
/// concurrent connection attempt is rejected, not queued) and the address
/// can be rebound immediately after a previous run.
pub struct ExchangeListener {
    listener: TcpListener,
}

impl ExchangeListener {
    pub fn bind(port: u16) -> io::Result<Self> {
        // SAFETY: FFI; the fd is owned by the returned listener or closed
        // on the error paths.
        unsafe {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let one: libc::c_int = 1;
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const libc::c_int as *const c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            ) < 0
            {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: port.to_be(),
                sin_addr: libc::in_addr {
                    s_addr: libc::INADDR_ANY.to_be(),
                },
                sin_zero: [0; 8],
            };
            if libc::bind(
                fd,
                &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ) < 0
            {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }
            if libc::listen(fd, 1) < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }
            Ok(Self {
                listener: TcpListener::from_raw_fd(fd),
            })
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Block for the client's connection.
    pub fn accept(&self) -> io::Result<ExchangeChannel> {
        let (stream, _) = self.listener.accept()?;
        Ok(ExchangeChannel { stream })
    }
}

/// A connected exchange channel.
pub struct ExchangeChannel {
    stream: TcpStream,
}

impl ExchangeChannel {
    /// Client side: connect to the server's exchange listener.
    pub fn connect(addr: Ipv4Addr, port: u16) -> io::Result<Self> {
        let stream = TcpStream::connect(SocketAddrV4::new(addr, port))?;
        Ok(Self { stream })
    }

    /// Server ordering: write the local descriptor, then read the peer's.
    ///
    /// The peer's slot is always exchanged for symmetry even when the
    /// server never initiates an operation with it.
    pub fn swap_as_server(&mut self, local: &MrDescriptor) -> io::Result<MrDescriptor> {
        self.send_descriptor(local)?;
        self.recv_descriptor()
    }

    /// Client ordering: read the server's descriptor first, then write the
    /// local one.
    pub fn swap_as_client(&mut self, local: &MrDescriptor) -> io::Result<MrDescriptor> {
        let remote = self.recv_descriptor()?;
        self.send_descriptor(local)?;
        Ok(remote)
    }

    fn send_descriptor(&mut self, desc: &MrDescriptor) -> io::Result<()> {
        self.stream.write_all(&desc.to_wire())
    }

    fn recv_descriptor(&mut self) -> io::Result<MrDescriptor> {
        let mut wire = [0u8; MrDescriptor::WIRE_LEN];
        self.stream.read_exact(&mut wire)?;
        Ok(MrDescriptor::from_wire(&wire))
    }

    /// Notify the peer that one remote operation completed.
    pub fn send_ack(&mut self) -> io::Result<()> {
        self.stream.write_all(ACK)
    }

    /// Consume exactly one acknowledgement token. Returns `Ok(false)` on a
    /// 0-byte read at a token boundary, which signals a clean peer
    /// disconnect rather than an error; EOF in the middle of a token is a
    /// short read and therefore an error.
    pub fn recv_ack(&mut self) -> io::Result<bool> {
        let mut buf = [0u8; ACK.len()];
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed mid-acknowledgement",
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn listener_on_ephemeral_port() -> (ExchangeListener, u16) {
        let listener = ExchangeListener::bind(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn descriptors_cross_over() -> anyhow::Result<()> {
        let server_desc = MrDescriptor {
            rkey: 0xdead,
            addr: 0x1000,
        };
        let client_desc = MrDescriptor {
            rkey: 0xbeef,
            addr: 0x2000,
        };

        let (listener, port) = listener_on_ephemeral_port();
        let server = thread::spawn(move || -> io::Result<MrDescriptor> {
            let mut chan = listener.accept()?;
            chan.swap_as_server(&server_desc)
        });

        let mut chan = ExchangeChannel::connect(Ipv4Addr::LOCALHOST, port)?;
        let got_server = chan.swap_as_client(&client_desc)?;
        let got_client = server.join().expect("exchange thread panicked")?;

        // Each side ends up with exactly what the other registered.
        assert_eq!(got_server, server_desc);
        assert_eq!(got_client, client_desc);
        Ok(())
    }

    #[test]
    fn acks_arrive_then_disconnect_reads_zero() -> anyhow::Result<()> {
        let (listener, port) = listener_on_ephemeral_port();
        let client = thread::spawn(move || -> io::Result<()> {
            let mut chan = ExchangeChannel::connect(Ipv4Addr::LOCALHOST, port)?;
            chan.send_ack()?;
            chan.send_ack()?;
            // Dropping the stream closes it; the server sees a 0-byte read.
            Ok(())
        });

        let mut chan = listener.accept()?;
        client.join().expect("ack thread panicked")?;
        assert!(chan.recv_ack()?);
        assert!(chan.recv_ack()?);
        assert!(!chan.recv_ack()?);
        Ok(())
    }
}

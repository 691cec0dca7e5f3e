//! Socket creation and binding
//!
//! All bindings obtain their sockets from one [`SocketBinder`] shared by
//! the process. It serializes the bind step only; steady-state I/O on the
//! returned sockets is not synchronized.

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};

const SOCKET_BUFFER_BYTES: usize = 1024 * 1024;

/// Process-wide bind service
#[derive(Debug, Default)]
pub struct SocketBinder {
    bind_lock: Mutex<()>,
}

impl SocketBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a UDP socket on `local`.
    ///
    /// With an IPv4 `peer` the socket is connected to it. IPv6 sockets are
    /// never connected since a multi-homed peer may answer from another
    /// address.
    pub fn bind_udp(
        &self,
        local: SocketAddr,
        peer: Option<SocketAddr>,
        read_timeout: Duration,
    ) -> Result<UdpSocket> {
        let _guard = self.bind_lock.lock();
        let bind_err = |e: std::io::Error| Error::SocketBind(format!("UDP {}: {}", local, e));

        let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))
            .map_err(bind_err)?;

        #[cfg(target_os = "macos")]
        socket.set_reuse_port(true).map_err(bind_err)?;
        #[cfg(not(target_os = "macos"))]
        socket.set_reuse_address(true).map_err(bind_err)?;

        socket.bind(&local.into()).map_err(bind_err)?;
        socket.set_read_timeout(Some(read_timeout)).map_err(bind_err)?;

        let _ = socket.set_recv_buffer_size(SOCKET_BUFFER_BYTES);
        let _ = socket.set_send_buffer_size(SOCKET_BUFFER_BYTES);

        if let Some(peer) = peer {
            if local.is_ipv4() && peer.is_ipv4() {
                socket.connect(&peer.into()).map_err(bind_err)?;
            }
        }

        let socket: UdpSocket = socket.into();
        debug!(local = ?socket.local_addr().ok(), ?peer, "UDP socket bound");
        Ok(socket)
    }

    /// Open a raw ICMP socket. Needs elevated privileges on most systems.
    pub fn bind_icmp(&self, ipv6: bool, read_timeout: Duration) -> Result<Socket> {
        let _guard = self.bind_lock.lock();
        let (domain, protocol) = if ipv6 {
            (Domain::IPV6, Protocol::ICMPV6)
        } else {
            (Domain::IPV4, Protocol::ICMPV4)
        };
        let bind_err = |e: std::io::Error| {
            Error::SocketBind(format!("raw ICMP{} socket: {}", if ipv6 { "v6" } else { "" }, e))
        };

        let socket = Socket::new(domain, Type::RAW, Some(protocol)).map_err(bind_err)?;
        socket.set_read_timeout(Some(read_timeout)).map_err(bind_err)?;
        let _ = socket.set_recv_buffer_size(SOCKET_BUFFER_BYTES);

        debug!(ipv6, "ICMP socket opened");
        Ok(socket)
    }
}

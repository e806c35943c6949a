//! Async UDP socket wrapper: bind/connect/send/batched-send and a
//! `poll` loop that drains every readable datagram per wakeup.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::core::DEFAULT_RECV_BUFFER_SIZE;

/// Async UDP socket wrapper used by both client and server.
#[derive(Debug)]
pub struct VeilSocket {
    socket: Arc<UdpSocket>,
    recv_buffer: Vec<u8>,
    max_payload_size: usize,
}

impl VeilSocket {
    /// Bind a new socket to `addr`.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(socket))
    }

    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            recv_buffer: vec![0u8; DEFAULT_RECV_BUFFER_SIZE],
            max_payload_size: crate::core::DEFAULT_MTU,
        }
    }

    pub fn set_max_payload_size(&mut self, size: usize) {
        self.max_payload_size = size;
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Connect to `addr` for use with `send`/`recv`.
    ///
    /// The client MUST stay bound to the physical interface chosen here
    /// ("best route to server") even after the core installs VPN routes,
    /// or tunnel packets loop back through themselves - see
    /// [`Self::bind_to_route_interface`].
    pub async fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        self.socket.connect(addr).await
    }

    /// Best-effort: pin the socket to the network interface that currently
    /// carries the best route to `addr`, so later route changes (e.g. the
    /// tunnel's own default-route override) cannot redirect this socket's
    /// traffic back into the tunnel. A failure here is logged by the
    /// caller and is not fatal - the socket remains usable, just without
    /// the pin.
    #[cfg(target_os = "linux")]
    pub fn bind_to_route_interface(&self, interface_name: &str) -> io::Result<()> {
        let sock_ref = socket2::SockRef::from(&*self.socket);
        sock_ref.bind_device(Some(interface_name.as_bytes()))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn bind_to_route_interface(&self, _interface_name: &str) -> io::Result<()> {
        Ok(())
    }

    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, addr).await
    }

    pub async fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.socket.send(data).await
    }

    /// Best-effort batched send: falls back to sequential `send_to` calls,
    /// since `tokio::net::UdpSocket` has no platform-portable sendmmsg.
    pub async fn send_many(&self, datagrams: &[(Vec<u8>, SocketAddr)]) -> io::Result<usize> {
        let mut sent = 0;
        for (bytes, addr) in datagrams {
            self.socket.send_to(bytes, *addr).await?;
            sent += 1;
        }
        Ok(sent)
    }

    pub async fn recv_from(&mut self) -> io::Result<(&[u8], SocketAddr)> {
        let (len, addr) = self.socket.recv_from(&mut self.recv_buffer).await?;
        Ok((&self.recv_buffer[..len], addr))
    }

    pub fn try_recv_from(&mut self) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.try_recv_from(&mut self.recv_buffer) {
            Ok((len, addr)) => Ok(Some((len, addr))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn recv_data(&self, len: usize) -> &[u8] {
        &self.recv_buffer[..len]
    }

    /// Drain every currently-readable datagram, invoking `handler` once per
    /// datagram, for up to `timeout_budget`. Returns the number of
    /// datagrams handled.
    pub async fn poll<F: FnMut(&[u8], SocketAddr)>(&mut self, timeout_budget: Duration, mut handler: F) -> io::Result<usize> {
        let mut handled = 0;
        loop {
            match timeout(timeout_budget, self.socket.recv_from(&mut self.recv_buffer)).await {
                Ok(Ok((len, addr))) => {
                    handler(&self.recv_buffer[..len], addr);
                    handled += 1;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(handled),
            }

            // Drain without blocking once the first datagram has arrived.
            loop {
                match self.socket.try_recv_from(&mut self.recv_buffer) {
                    Ok((len, addr)) => {
                        handler(&self.recv_buffer[..len], addr);
                        handled += 1;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            }
            return Ok(handled);
        }
    }

    pub fn inner(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn socket_arc(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }
}

/// Builder for creating [`VeilSocket`]s with custom options.
#[derive(Debug, Clone)]
pub struct VeilSocketBuilder {
    recv_buffer_size: usize,
    max_payload_size: usize,
}

impl Default for VeilSocketBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VeilSocketBuilder {
    pub fn new() -> Self {
        Self {
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            max_payload_size: crate::core::DEFAULT_MTU,
        }
    }

    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    pub async fn bind(self, addr: SocketAddr) -> io::Result<VeilSocket> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(self.from_socket(socket))
    }

    pub fn from_socket(self, socket: UdpSocket) -> VeilSocket {
        VeilSocket {
            socket: Arc::new(socket),
            recv_buffer: vec![0u8; self.recv_buffer_size],
            max_payload_size: self.max_payload_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_assigns_a_port() {
        let socket = VeilSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(socket.local_addr().unwrap().port() != 0);
    }

    #[tokio::test]
    async fn send_to_and_recv_from_round_trip() {
        let mut server = VeilSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = VeilSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        client.send_to(b"hello veil", server_addr).await.unwrap();
        let (received, from) = server.recv_from().await.unwrap();
        assert_eq!(received, b"hello veil");
        assert_eq!(from, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn connected_send_and_recv() {
        let mut server = VeilSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = VeilSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        client.connect(server_addr).await.unwrap();

        client.send(b"connected").await.unwrap();
        let (received, _) = server.recv_from().await.unwrap();
        assert_eq!(received, b"connected");
    }

    #[tokio::test]
    async fn poll_drains_multiple_pending_datagrams() {
        let mut server = VeilSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = VeilSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        for _ in 0..3 {
            client.send_to(b"x", server_addr).await.unwrap();
        }
        // give the kernel a moment to queue all three
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut count = 0;
        server.poll(Duration::from_millis(200), |_, _| count += 1).await.unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn builder_configures_buffer_and_payload_size() {
        let builder = VeilSocketBuilder::new().recv_buffer_size(4096).max_payload_size(1200);
        assert_eq!(builder.recv_buffer_size, 4096);
        assert_eq!(builder.max_payload_size, 1200);
    }
}

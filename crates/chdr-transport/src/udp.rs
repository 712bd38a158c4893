//! Datagram link: one CHDR frame per UDP datagram.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::buffer::{FrameBuffer, FramePool};
use crate::error::{TransportError, TransportResult};
use crate::link::{Link, LinkKind, LinkParams};

pub struct DatagramLink {
    socket: UdpSocket,
    peer: SocketAddr,
    params: LinkParams,
    send_pool: FramePool,
    recv_pool: FramePool,
    closed: AtomicBool,
}

impl DatagramLink {
    /// Open a socket connected to `peer`, with kernel buffers sized to hold
    /// every frame of each pool.
    pub async fn connect(peer: SocketAddr, params: LinkParams) -> TransportResult<Self> {
        let socket = Socket::new(Domain::for_address(peer), Type::DGRAM, Some(Protocol::UDP))?;
        size_kernel_buffers(&socket, &params);
        socket.set_nonblocking(true)?;
        let bind: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        socket.bind(&bind.into())?;
        socket.connect(&peer.into())?;
        let socket = UdpSocket::from_std(socket.into())?;
        Self::with_socket(socket, params)
    }

    /// Wrap a socket that is already connected.
    pub fn with_socket(socket: UdpSocket, params: LinkParams) -> TransportResult<Self> {
        let peer = socket.peer_addr()?;
        tracing::info!(
            %peer,
            local = %socket.local_addr()?,
            recv_frame_size = params.recv_frame_size,
            num_recv_frames = params.num_recv_frames,
            send_frame_size = params.send_frame_size,
            num_send_frames = params.num_send_frames,
            "datagram link open"
        );
        Ok(Self {
            socket,
            peer,
            params,
            send_pool: FramePool::new(params.send_frame_size, params.num_send_frames),
            recv_pool: FramePool::new(params.recv_frame_size, params.num_recv_frames),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn check_open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Read whatever the kernel already holds, without waiting on the
    /// reactor.
    fn recv_now(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let sock = SockRef::from(&self.socket);
        let mut reader: &Socket = &sock;
        match reader.read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn recv_until(&self, buf: &mut [u8], deadline: Instant) -> io::Result<Option<usize>> {
        if let Some(n) = self.recv_now(buf)? {
            return Ok(Some(n));
        }
        match tokio::time::timeout_at(deadline, self.socket.recv(buf)).await {
            Ok(r) => r.map(Some),
            Err(_) => Ok(None),
        }
    }
}

fn size_kernel_buffers(socket: &Socket, params: &LinkParams) {
    let recv = params.recv_buff_size();
    let send = params.send_buff_size();
    if let Err(e) = socket.set_recv_buffer_size(recv) {
        tracing::warn!(requested = recv, error = %e, "could not size socket receive buffer");
    }
    if let Err(e) = socket.set_send_buffer_size(send) {
        tracing::warn!(requested = send, error = %e, "could not size socket send buffer");
    }
    // Linux reports double the usable size.
    if let Ok(granted) = socket.recv_buffer_size() {
        if granted < recv {
            tracing::warn!(requested = recv, granted, "socket receive buffer smaller than requested, frames may be dropped");
        }
    }
}

#[async_trait]
impl Link for DatagramLink {
    fn kind(&self) -> LinkKind {
        LinkKind::Datagram
    }

    fn params(&self) -> LinkParams {
        self.params
    }

    async fn get_send_buffer(&self, timeout: Duration) -> TransportResult<Option<FrameBuffer>> {
        self.check_open()?;
        Ok(self.send_pool.acquire(timeout).await)
    }

    async fn release_send_buffer(&self, buf: FrameBuffer) -> TransportResult<()> {
        let result = if buf.is_empty() {
            Ok(())
        } else if let Err(e) = self.check_open() {
            Err(e)
        } else {
            tracing::trace!(bytes = buf.len(), header = %hex::encode(&buf.as_slice()[..buf.len().min(8)]), "datagram send");
            self.socket.send(buf.as_slice()).await.map(|_| ()).map_err(TransportError::from)
        };
        self.send_pool.release(buf);
        result
    }

    async fn get_recv_buffer(&self, timeout: Duration) -> TransportResult<Option<FrameBuffer>> {
        self.check_open()?;
        let deadline = Instant::now() + timeout;
        let Some(mut buf) = self.recv_pool.acquire(timeout).await else {
            return Ok(None);
        };
        let received = if timeout.is_zero() {
            self.recv_now(buf.frame_mut())
        } else {
            self.recv_until(buf.frame_mut(), deadline).await
        };
        match received {
            Ok(Some(n)) => {
                buf.set_len(n);
                Ok(Some(buf))
            }
            Ok(None) => {
                self.recv_pool.release(buf);
                Ok(None)
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                tracing::debug!(peer = %self.peer, "peer port unreachable");
                self.recv_pool.release(buf);
                Ok(None)
            }
            Err(e) => {
                self.recv_pool.release(buf);
                Err(e.into())
            }
        }
    }

    async fn release_recv_buffer(&self, buf: FrameBuffer) {
        self.recv_pool.release(buf);
    }

    async fn flush(&self) -> TransportResult<usize> {
        let mut scratch = vec![0u8; self.params.recv_frame_size.max(1)];
        let mut dropped = 0;
        loop {
            match self.recv_now(&mut scratch) {
                Ok(Some(_)) => dropped += 1,
                Ok(None) => break,
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if dropped > 0 {
            tracing::debug!(peer = %self.peer, dropped, "flushed stale datagrams");
        }
        Ok(dropped)
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.flush().await;
        tracing::info!(peer = %self.peer, "datagram link closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chdr_core::{ChdrCodec, ChdrPacket};

    async fn pair(params: LinkParams) -> (DatagramLink, UdpSocket) {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let link = DatagramLink::connect(device.local_addr().unwrap(), params).await.unwrap();
        device.connect(link.local_addr().unwrap()).await.unwrap();
        (link, device)
    }

    fn params() -> LinkParams {
        LinkParams {
            recv_frame_size: 1472,
            send_frame_size: 1472,
            num_recv_frames: 32,
            num_send_frames: 32,
        }
    }

    #[tokio::test]
    async fn receive_before_and_after_injection() {
        let (link, device) = pair(params()).await;
        assert!(link.get_recv_buffer(Duration::ZERO).await.unwrap().is_none());

        let codec = ChdrCodec::default();
        let wire = codec
            .encode(&ChdrPacket::data(5, 0, Bytes::from(vec![0xA5u8; 92])))
            .unwrap();
        assert_eq!(wire.len(), 100);
        device.send(&wire).await.unwrap();

        let buf = link.get_recv_buffer(Duration::from_secs(1)).await.unwrap().unwrap();
        let pkt = codec.decode(buf.as_slice()).unwrap();
        assert_eq!(pkt.header.length, 100);
        link.release_recv_buffer(buf).await;
    }

    #[tokio::test]
    async fn send_buffer_goes_out_as_one_datagram() {
        let (link, device) = pair(params()).await;
        let mut buf = link.get_send_buffer(Duration::ZERO).await.unwrap().unwrap();
        buf.fill_from(b"hello");
        link.release_send_buffer(buf).await.unwrap();

        let mut got = [0u8; 32];
        let n = tokio::time::timeout(Duration::from_secs(1), device.recv(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got[..n], b"hello");
    }

    #[tokio::test]
    async fn send_pool_exhaustion_is_a_timeout() {
        let small = LinkParams {
            num_send_frames: 1,
            ..params()
        };
        let (link, _device) = pair(small).await;
        let held = link.get_send_buffer(Duration::ZERO).await.unwrap().unwrap();
        assert!(link.get_send_buffer(Duration::from_millis(10)).await.unwrap().is_none());
        link.release_send_buffer(held).await.unwrap();
        assert!(link.get_send_buffer(Duration::ZERO).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn flush_drops_queued_datagrams() {
        let (link, device) = pair(params()).await;
        for _ in 0..3 {
            device.send(&[0u8; 16]).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(link.flush().await.unwrap(), 3);
        assert!(link.get_recv_buffer(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_link_refuses_buffers() {
        let (link, _device) = pair(params()).await;
        link.close().await.unwrap();
        link.close().await.unwrap();
        assert!(matches!(
            link.get_recv_buffer(Duration::ZERO).await,
            Err(TransportError::Closed)
        ));
    }
}

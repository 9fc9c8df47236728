//! UDP socket I/O.
//!
//! Each bound endpoint gets one task that flushes the engine's queued
//! datagrams and drains inbound ones. Sockets are non-blocking with ECN
//! reception enabled, and destination-address reception where the
//! platform offers it, so multi-homed servers see which local address a
//! datagram arrived on. Both travel to the protocol machine unchanged.

use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::Interest;
use tokio::sync::Notify;

use crate::engine::{Engine, OutDatagram};

pub(crate) struct SocketIo {
    pub id: usize,
    pub io: tokio::net::UdpSocket,
    pub state: quinn_udp::UdpSocketState,
    pub local: SocketAddr,
    /// Wakes the socket task: datagrams queued, or the socket closed.
    pub notify: Notify,
}

impl SocketIo {
    /// Bind a non-blocking UDP socket with ECN and packet-info reception.
    pub fn bind(id: usize, addr: SocketAddr) -> io::Result<Self> {
        let socket = std::net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let state = quinn_udp::UdpSocketState::new((&socket).into())?;
        let local = socket.local_addr()?;
        let io = tokio::net::UdpSocket::from_std(socket)?;
        tracing::debug!(%local, "bound socket");
        Ok(Self {
            id,
            io,
            state,
            local,
            notify: Notify::new(),
        })
    }

    /// Send one datagram, waiting for write-readiness on `WouldBlock`.
    /// Returns false on a fatal socket error.
    async fn send(&self, datagram: &OutDatagram) -> bool {
        let transmit = quinn_udp::Transmit {
            destination: datagram.destination,
            ecn: datagram
                .ecn
                .and_then(|ecn| quinn_udp::EcnCodepoint::from_bits(ecn as u8)),
            contents: &datagram.data,
            segment_size: datagram.segment_size,
            src_ip: datagram.src_ip,
        };

        loop {
            if self.io.writable().await.is_err() {
                return false;
            }
            match self
                .io
                .try_io(Interest::WRITABLE, || self.state.send((&self.io).into(), &transmit))
            {
                Ok(()) => return true,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => {
                    // Transient sendmsg errors drop the datagram; QUIC
                    // recovers via retransmission.
                    tracing::warn!(%err, "sendmsg failed");
                    return true;
                }
            }
        }
    }

    /// Drain as many datagrams as the socket will give without blocking.
    fn recv_burst(&self, engine: &Engine, buf: &mut [u8]) {
        loop {
            let result = self.io.try_io(Interest::READABLE, || {
                let mut bufs = [IoSliceMut::new(buf)];
                let mut meta = [quinn_udp::RecvMeta::default()];
                self.state
                    .recv((&self.io).into(), &mut bufs, &mut meta)
                    .map(|_| meta[0])
            });

            match result {
                Ok(meta) => {
                    let ecn = meta.ecn.map(|ecn| ecn as u8);
                    // With receive offload, one recv may carry several
                    // datagrams at `stride` intervals.
                    let stride = if meta.stride == 0 { meta.len } else { meta.stride };
                    for segment in buf[..meta.len].chunks(stride.max(1)) {
                        engine.handle_datagram(self.id, meta.addr, ecn, meta.dst_ip, segment);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    tracing::warn!(%err, "recvmsg failed");
                    return;
                }
            }
        }
    }
}

/// The per-socket task: flush queued egress, then wait for readability or
/// a nudge from the engine.
pub(crate) async fn run_socket(engine: Arc<Engine>, io: Arc<SocketIo>) {
    let mut buf = vec![0u8; u16::MAX as usize];

    loop {
        // Egress first: the engine parks datagrams for us in arrival
        // order, and nothing else may send on this socket.
        while let Some(datagram) = engine.pop_unsent(io.id) {
            if !io.send(&datagram).await {
                tracing::warn!("socket send side failed");
                return;
            }
        }

        if engine.socket_done(io.id) {
            break;
        }

        tokio::select! {
            _ = io.notify.notified() => {}
            ready = io.io.readable() => {
                if ready.is_err() {
                    break;
                }
                io.recv_burst(&engine, &mut buf);
            }
        }
    }

    tracing::trace!(local = %io.local, "socket task stopped");
}

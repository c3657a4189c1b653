//! Per-`(node, port)` datagram conduit to one service.

use std::io;

use tokio::sync::mpsc;
use wire::SockAddrQrtr;

use crate::cancel::Cancel;
use crate::error::Error;
use crate::socket::QrtrSocket;

/// A datagram socket connected to one `(node_id, port)` endpoint. No
/// framing, no retries, no queueing beyond the kernel socket buffer: this
/// is a conduit, not a protocol.
pub struct ClientChannel {
    node_id: u32,
    port: u32,
    socket: QrtrSocket,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ClientChannel {
    /// Opens a socket connected to `(node_id, port)`. The caller drives the
    /// receive loop by polling [`ClientChannel::run`]; inbound datagrams are
    /// then delivered through the returned receiver as owned,
    /// freshly-allocated buffers, with a zero-length datagram delivered as
    /// an empty `Vec`.
    pub fn open(node_id: u32, port: u32) -> Result<(Self, mpsc::UnboundedReceiver<Vec<u8>>), Error> {
        let socket = QrtrSocket::open().map_err(Error::SocketCreate)?;
        socket
            .connect(&SockAddrQrtr::new(node_id, port))
            .map_err(Error::SocketIO)?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                node_id,
                port,
                socket,
                inbound_tx,
            },
            inbound_rx,
        ))
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    /// Sends `message` as one datagram to the connected remote. Retries
    /// only on `WouldBlock`, racing the wait for write-readiness against
    /// `cancel`.
    pub async fn send(&self, message: &[u8], mut cancel: Cancel) -> Result<(), Error> {
        loop {
            match self.socket.send(message) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        res = self.socket.writable() => res.map_err(Error::SocketIO)?,
                    }
                }
                Err(e) => return Err(Error::SocketIO(e)),
            }
        }
    }

    /// Runs the receive loop, pushing each inbound datagram to the channel
    /// returned from [`ClientChannel::open`] until a socket error occurs or
    /// every receiver has been dropped.
    pub async fn run(&self) {
        let mut buf = vec![0u8; 65536];

        loop {
            let n = match self.socket.recv(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    log::debug!(
                        "client channel ({}, {}) closing after socket error: {e}",
                        self.node_id,
                        self.port
                    );
                    return;
                }
            };

            if self.inbound_tx.send(buf[..n].to_vec()).is_err() {
                return;
            }
        }
    }

    /// Releases the socket. Equivalent to dropping the channel; provided
    /// as an explicit operation for callers that want to signal closure
    /// without relying on scope exit.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_without_permission_reports_socket_error() {
        // AF_QIPCRTR is unavailable in this sandbox; open() surfaces the
        // platform's ENODEV/EAFNOSUPPORT rather than panicking.
        let result = ClientChannel::open(5, 10);
        assert!(result.is_err());
    }
}

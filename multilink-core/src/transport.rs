//! Physical link transports.
//!
//! The engine only needs three things from a link: whether it is open, how much
//! it still has queued, and a way to queue a frame. [`LinkTransport`] captures
//! that; [`UdpLink`] implements it over a UDP socket, the way the daemon carries
//! each member link.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::link::LinkId;

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Link {0} is closed")]
    Closed(LinkId),

    #[error("Short write on link {link}: sent {sent} of {len} bytes")]
    ShortWrite { link: LinkId, sent: usize, len: usize },
}

/// Send path of a member link as seen by the distribution engine
pub trait LinkTransport {
    /// Whether the link is operationally open
    fn is_open(&self) -> bool;

    /// Frames queued but not yet written
    fn queue_len(&self) -> usize;

    /// Queue one encapsulated frame
    fn send(&mut self, frame: Vec<u8>);
}

/// Member link carried over UDP
pub struct UdpLink {
    /// Link identifier
    pub id: LinkId,
    name: String,
    socket: Arc<UdpSocket>,
    peer_addr: SocketAddr,
    queue: VecDeque<Vec<u8>>,
    open: bool,
}

impl UdpLink {
    /// Bind a new link
    pub async fn bind(
        id: LinkId,
        name: impl Into<String>,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(local_addr).await?;
        Ok(Self {
            id,
            name: name.into(),
            socket: Arc::new(socket),
            peer_addr,
            queue: VecDeque::new(),
            open: true,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared handle for a receive task
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    /// Get local address
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Write every queued frame to the peer.
    ///
    /// Returns the number of bytes written. On error the failed frame stays at
    /// the head of the queue.
    pub async fn flush(&mut self) -> Result<usize, TransportError> {
        if !self.open {
            self.queue.clear();
            return Err(TransportError::Closed(self.id));
        }

        let mut written = 0;
        while let Some(frame) = self.queue.front() {
            let sent = self.socket.send_to(frame, self.peer_addr).await?;
            if sent != frame.len() {
                return Err(TransportError::ShortWrite {
                    link: self.id,
                    sent,
                    len: frame.len(),
                });
            }
            written += sent;
            self.queue.pop_front();
        }
        Ok(written)
    }

    /// Mark the link closed and drop anything still queued.
    pub fn close(&mut self) {
        self.open = false;
        self.queue.clear();
    }
}

impl LinkTransport for UdpLink {
    fn is_open(&self) -> bool {
        self.open
    }

    fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn send(&mut self, frame: Vec<u8>) {
        if self.open {
            self.queue.push_back(frame);
        }
    }
}

//! Layer 2: frames opaque payloads onto best-effort UDP datagrams.
//!
//! A frame is a small header (destination id, length, XOR checksum, a
//! reserved byte) followed by the payload. [`L2Sap`] never reorders or
//! retries anything; it only frames, checksums and discards what doesn't
//! check out. Reliability is [`l4_sap`](../l4_sap/index.html)'s job.

use std::net::Ipv4Addr;
use std::time::Duration;

/// Size of the L2 header in bytes: `dst_addr(2) + len(2) + checksum(1) + mbz(1)`.
pub const L2_HEADER_SIZE: usize = 6;

/// Maximum size of a complete L2 frame (header + payload) accepted on the wire.
///
/// Chosen well under the common Internet MTU so a frame never fragments at
/// the IP layer.
pub const L2_FRAME_SIZE: usize = 512;

/// Maximum payload a single L2 frame can carry.
pub const L2_PAYLOAD_SIZE: usize = L2_FRAME_SIZE - L2_HEADER_SIZE;

/// The byte transport an [`L2Sap`] frames onto.
///
/// Generic over this instead of hard-coding [`tokio::net::UdpSocket`] so
/// tests can splice in a lossy/corrupting relay without touching a real
/// network. Boxes its futures (via `async-trait`) so an `L2Sap<S>` stays
/// usable across `tokio::spawn`, which otherwise can't be guaranteed for
/// a bare `async fn` in a generic trait.
#[async_trait::async_trait]
pub trait Socket: Send + Sync {
    /// Send one complete frame. Must not split it across multiple datagrams.
    async fn send(&self, frame: &[u8]) -> std::io::Result<usize>;

    /// Receive one datagram into `buf`, returning the number of bytes written.
    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// A [`Socket`] backed by a real, peer-connected UDP socket.
pub struct UdpTransport(tokio::net::UdpSocket);

#[async_trait::async_trait]
impl Socket for UdpTransport {
    async fn send(&self, frame: &[u8]) -> std::io::Result<usize> {
        self.0.send(frame).await
    }

    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.recv(buf).await
    }
}

/// Outcome of [`L2Sap::recv_from`]: either a payload arrived, or the
/// timeout elapsed first. Kept as its own type rather than overloading the
/// length with a sentinel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2RecvOutcome {
    /// A frame was received, checksum-verified, and its payload is this
    /// many bytes long.
    Payload(usize),
    /// No frame arrived before the requested timeout elapsed.
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum L2Error {
    #[error("L2 socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload of {len} bytes exceeds the {L2_PAYLOAD_SIZE} byte L2 payload limit")]
    PayloadTooLarge { len: usize },
    #[error("received {len} bytes, shorter than the {L2_HEADER_SIZE} byte L2 header")]
    FrameTooShort { len: usize },
    #[error("L2 frame checksum mismatch")]
    ChecksumMismatch,
    #[error("frame claims a {needed} byte payload but only {have} bytes were receivable")]
    RecvBufferTooSmall { needed: usize, have: usize },
}

/// Frames one payload onto UDP and hands received, checksum-verified
/// payloads back up. Owns exactly one [`Socket`] bound to exactly one peer.
pub struct L2Sap<S: Socket = UdpTransport> {
    socket: S,
    dst_addr: u16,
}

impl L2Sap<UdpTransport> {
    /// Opens a UDP/IPv4 socket connected to `(peer_ip, peer_port)`.
    ///
    /// The socket is connected rather than merely bound so that `send`/`recv`
    /// never have to juggle addresses: this layer serves exactly one peer.
    pub async fn create(peer_ip: Ipv4Addr, peer_port: u16) -> Result<Self, L2Error> {
        let socket = tokio::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect((peer_ip, peer_port)).await?;

        Ok(Self::from_socket(UdpTransport(socket), peer_ip))
    }
}

impl<S: Socket> L2Sap<S> {
    /// Builds an `L2Sap` around an already-constructed [`Socket`]. Used by
    /// [`L2Sap::create`] and, in tests, to splice in a lossy transport.
    pub fn from_socket(socket: S, peer_ip: Ipv4Addr) -> Self {
        // The source truncated the full 32-bit peer address into a 16-bit
        // field here; both peers do it the same way so it never affects
        // delivery. Preserved as-is rather than "fixed" to stay wire
        // compatible — see DESIGN.md.
        let dst_addr = (u32::from(peer_ip) & 0xffff) as u16;

        Self { socket, dst_addr }
    }

    /// Frames and transmits `data` as one UDP datagram.
    ///
    /// Returns the number of payload bytes accepted. Rejects payloads
    /// larger than [`L2_PAYLOAD_SIZE`] rather than truncating; L4 is the
    /// layer that truncates (see its `send`).
    pub async fn send_to(&self, data: &[u8]) -> Result<usize, L2Error> {
        let len = data.len();
        if len > L2_PAYLOAD_SIZE {
            return Err(L2Error::PayloadTooLarge { len });
        }

        let frame = self.build_frame(data);
        self.socket.send(&frame).await?;

        tracing::trace!(bytes = len, "sent L2 frame");
        Ok(len)
    }

    /// Builds a fully-initialized frame: header is written field by field
    /// into a zeroed buffer, then the payload is copied in, then the
    /// checksum is computed over the whole thing. No byte is ever left
    /// uninitialized.
    fn build_frame(&self, data: &[u8]) -> Vec<u8> {
        let total_len = data.len() + L2_HEADER_SIZE;
        let mut frame = vec![0u8; total_len];

        frame[0..2].copy_from_slice(&self.dst_addr.to_be_bytes());
        frame[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        frame[4] = 0; // checksum, filled in below once the rest is settled
        frame[5] = 0; // mbz
        frame[L2_HEADER_SIZE..].copy_from_slice(data);

        frame[4] = xor_checksum(&frame);
        frame
    }

    /// Waits for one frame, or for `timeout` to elapse if given.
    ///
    /// A short frame, a checksum mismatch, or a payload too large for `buf`
    /// is an error, not a timeout; the caller decides whether that's
    /// recoverable.
    pub async fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<L2RecvOutcome, L2Error> {
        let mut frame = vec![0u8; L2_FRAME_SIZE];

        let n = match timeout {
            Some(wait) => match tokio::time::timeout(wait, self.socket.recv(&mut frame)).await {
                Ok(result) => result?,
                Err(_elapsed) => return Ok(L2RecvOutcome::Timeout),
            },
            None => self.socket.recv(&mut frame).await?,
        };

        if n < L2_HEADER_SIZE {
            tracing::debug!(len = n, "discarding L2 frame shorter than header");
            return Err(L2Error::FrameTooShort { len: n });
        }

        let received = &frame[..n];
        let received_checksum = received[4];
        let mut zeroed = received.to_vec();
        zeroed[4] = 0;
        if xor_checksum(&zeroed) != received_checksum {
            tracing::debug!("discarding L2 frame with bad checksum");
            return Err(L2Error::ChecksumMismatch);
        }

        let total_len = u16::from_be_bytes([received[2], received[3]]) as usize;
        let payload_len = total_len.saturating_sub(L2_HEADER_SIZE);
        let available = n - L2_HEADER_SIZE;
        if payload_len > available {
            tracing::debug!(
                claimed = payload_len,
                available,
                "discarding L2 frame whose length field overruns the datagram"
            );
            return Err(L2Error::FrameTooShort { len: n });
        }
        if payload_len > buf.len() {
            return Err(L2Error::RecvBufferTooSmall {
                needed: payload_len,
                have: buf.len(),
            });
        }

        buf[..payload_len]
            .copy_from_slice(&received[L2_HEADER_SIZE..L2_HEADER_SIZE + payload_len]);

        tracing::trace!(bytes = payload_len, "received L2 frame");
        Ok(L2RecvOutcome::Payload(payload_len))
    }
}

/// XOR of every byte in `bytes`. The checksum field itself must be zeroed
/// by the caller before this runs, both when building and when verifying.
fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, byte| acc ^ byte)
}

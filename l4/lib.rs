//! Layer 4: reliable, in-order, exactly-once delivery of one payload at a
//! time between exactly two peers, built on [`l2_sap`]'s framing.
//!
//! This is a stop-and-wait transport: alternating-bit sequence numbers,
//! one outstanding frame at a time, a 1-second retransmit timer bounded to
//! 4 retries, and a `RESET` control frame that tears the session down.
//! There is no flow control, no handshake, and no support for more than
//! one peer per [`L4Sap`] — see the module-level non-goals in the design
//! docs.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use l2_sap::{L2RecvOutcome, L2Sap, Socket};

/// Size of the L4 header: `type(1) + seqno(1) + ackno(1) + mbz(1)`.
pub const L4_HEADER_SIZE: usize = 4;

/// An L4 frame is carried whole inside one L2 payload.
pub const L4_FRAME_SIZE: usize = l2_sap::L2_PAYLOAD_SIZE;

/// Maximum payload a single `send`/`recv` can carry; longer payloads are
/// truncated by `send`.
pub const L4_PAYLOAD_SIZE: usize = L4_FRAME_SIZE - L4_HEADER_SIZE;

/// Peer ports below this are rejected at `create`.
pub const MIN_PEER_PORT: u16 = 1024;

/// Total number of DATA transmissions attempted per `send` call, i.e. the
/// original transmission plus 4 retries.
pub const MAX_TRANSMISSIONS: u32 = 5;

/// How long `send` waits for an ACK before retransmitting.
pub const RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(1);

/// The closed set of L4 frame kinds. Kept as a tagged enum rather than a
/// bare `u8` everywhere except on the wire, where it is exactly one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameType {
    Data = 0,
    Ack = 1,
    Reset = 2,
}

/// A decoded, checksum-clean L4 frame borrowing its payload from the
/// buffer it was parsed out of.
struct ParsedFrame<'a> {
    kind: FrameType,
    seqno: u8,
    ackno: u8,
    payload: &'a [u8],
}

/// A single received DATA frame stashed while we were waiting for our own
/// ACK. At most one of these exists at a time; see [`L4Sap::recv`].
struct Pending {
    seqno: u8,
    payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum L4CreateError {
    #[error(transparent)]
    L2(#[from] l2_sap::L2Error),
    #[error("peer port {0} is privileged (< {MIN_PEER_PORT}) and rejected at this layer")]
    PrivilegedPort(u16),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum L4SendError {
    #[error("payload must be at least 1 byte")]
    EmptyPayload,
    #[error("exhausted {MAX_TRANSMISSIONS} transmissions without a matching ACK")]
    SendFailed,
    #[error("peer reset the session")]
    Quit,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum L4RecvError {
    #[error("peer reset the session")]
    Quit,
}

/// Reliable stop-and-wait delivery over one [`L2Sap`]. Exclusively owns it;
/// there is no way to reach the L2 layer except through this type.
pub struct L4Sap<S: Socket = l2_sap::UdpTransport> {
    l2: L2Sap<S>,
    send_seqno: u8,
    expected_seqno: u8,
    pending: Option<Pending>,
}

impl L4Sap<l2_sap::UdpTransport> {
    /// Creates the underlying L2 SAP and initializes both sequence
    /// numbers to 0. Rejects `peer_port < 1024` before touching the
    /// network.
    pub async fn create(peer_ip: Ipv4Addr, peer_port: u16) -> Result<Self, L4CreateError> {
        if peer_port < MIN_PEER_PORT {
            return Err(L4CreateError::PrivilegedPort(peer_port));
        }

        let l2 = L2Sap::create(peer_ip, peer_port).await?;
        Ok(Self::from_l2(l2))
    }
}

impl<S: Socket> L4Sap<S> {
    /// Builds an `L4Sap` directly around an existing [`L2Sap`]. Used by
    /// [`L4Sap::create`] and, in tests, to run the state machine over a
    /// lossy/corrupting relay instead of a real socket.
    pub fn from_l2(l2: L2Sap<S>) -> Self {
        Self {
            l2,
            send_seqno: 0,
            expected_seqno: 0,
            pending: None,
        }
    }

    /// Sends `data` (truncated to [`L4_PAYLOAD_SIZE`]) and blocks until the
    /// peer ACKs it, up to [`MAX_TRANSMISSIONS`] attempts a second apart.
    ///
    /// While waiting, a DATA frame from the peer (it is sending too) is
    /// ACKed and, if the pending slot is free, stashed for a later `recv`.
    pub async fn send(&mut self, data: &[u8]) -> Result<usize, L4SendError> {
        if data.is_empty() {
            return Err(L4SendError::EmptyPayload);
        }
        let payload = &data[..data.len().min(L4_PAYLOAD_SIZE)];

        for attempt in 1..=MAX_TRANSMISSIONS {
            let frame = encode_frame(FrameType::Data, self.send_seqno, 0, payload);
            if self.l2.send_to(&frame).await.is_err() {
                tracing::warn!(attempt, "L2 send failed while sending DATA");
                return Err(L4SendError::SendFailed);
            }
            tracing::debug!(attempt, seqno = self.send_seqno, "sent DATA, awaiting ACK");

            let deadline = Instant::now() + RETRANSMIT_TIMEOUT;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }

                let mut frame_buf = vec![0u8; L4_FRAME_SIZE];
                let outcome = match self.l2.recv_from(&mut frame_buf, Some(remaining)).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::debug!(error = %e, "transient L2 error while awaiting ACK");
                        continue;
                    }
                };

                let n = match outcome {
                    L2RecvOutcome::Timeout => break,
                    L2RecvOutcome::Payload(n) => n,
                };

                let Some(received) = parse_frame(&frame_buf[..n]) else {
                    tracing::debug!("ignoring malformed or reserved-bit-set frame");
                    continue;
                };

                match received.kind {
                    FrameType::Reset => {
                        tracing::warn!("peer reset the session during send");
                        return Err(L4SendError::Quit);
                    }
                    FrameType::Ack if received.ackno == 1 - self.send_seqno => {
                        self.send_seqno ^= 1;
                        tracing::trace!("received matching ACK");
                        return Ok(payload.len());
                    }
                    FrameType::Ack => {
                        tracing::trace!(ackno = received.ackno, "ignoring stale ACK");
                        continue;
                    }
                    FrameType::Data => {
                        self.ack_peer_data(received.seqno).await;
                        if self.pending.is_none() {
                            self.pending = Some(Pending {
                                seqno: received.seqno,
                                payload: received.payload.to_vec(),
                            });
                        }
                        continue;
                    }
                }
            }
        }

        tracing::warn!("exhausted retransmissions without a matching ACK");
        Err(L4SendError::SendFailed)
    }

    /// Blocks until a DATA frame with the expected sequence number is
    /// delivered, a RESET arrives, or the pending slot already holds one.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, L4RecvError> {
        if let Some(pending) = self.pending.take() {
            if pending.seqno == self.expected_seqno {
                let n = pending.payload.len().min(buf.len());
                buf[..n].copy_from_slice(&pending.payload[..n]);
                self.ack_peer_data(pending.seqno).await;
                self.expected_seqno ^= 1;
                return Ok(n);
            }

            // Stale frame that raced a previous send; duplicate-ack it and
            // fall through to wait for the one we actually expect.
            self.ack_peer_data(pending.seqno).await;
        }

        loop {
            let mut frame_buf = vec![0u8; L4_FRAME_SIZE];
            let outcome = match self.l2.recv_from(&mut frame_buf, None).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::debug!(error = %e, "transient L2 error while awaiting DATA");
                    continue;
                }
            };

            let n = match outcome {
                L2RecvOutcome::Timeout => continue,
                L2RecvOutcome::Payload(n) => n,
            };

            let Some(received) = parse_frame(&frame_buf[..n]) else {
                continue;
            };

            match received.kind {
                FrameType::Reset => {
                    tracing::warn!("peer reset the session during recv");
                    return Err(L4RecvError::Quit);
                }
                FrameType::Data if received.seqno == self.expected_seqno => {
                    let len = received.payload.len().min(buf.len());
                    buf[..len].copy_from_slice(&received.payload[..len]);
                    self.ack_peer_data(received.seqno).await;
                    self.expected_seqno ^= 1;
                    return Ok(len);
                }
                FrameType::Data => {
                    // Peer never saw our ACK for the frame before this
                    // one; re-ack it instead of redelivering.
                    self.ack_peer_data(received.seqno).await;
                    continue;
                }
                FrameType::Ack => continue,
            }
        }
    }

    /// Best-effort graceful teardown: sends a few RESET frames so the peer
    /// can notice and quit promptly, then drops. Never blocks waiting for
    /// a response — RESET is not acknowledged.
    pub async fn close(self) {
        for _ in 0..3 {
            let frame = encode_frame(FrameType::Reset, 0, 0, &[]);
            if self.l2.send_to(&frame).await.is_err() {
                break;
            }
        }
    }

    async fn ack_peer_data(&self, data_seqno: u8) {
        let ack = encode_frame(FrameType::Ack, 0, 1 - data_seqno, &[]);
        if let Err(e) = self.l2.send_to(&ack).await {
            tracing::debug!(error = %e, "failed to send ACK");
        }
    }
}

/// Builds a fully-initialized L4 frame: a zeroed buffer, header fields
/// written in, then the payload copied in. Never transmits more than it
/// has written.
fn encode_frame(kind: FrameType, seqno: u8, ackno: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; L4_HEADER_SIZE + payload.len()];
    frame[0] = kind as u8;
    frame[1] = seqno;
    frame[2] = ackno;
    frame[3] = 0; // mbz
    frame[L4_HEADER_SIZE..].copy_from_slice(payload);
    frame
}

/// Parses an L4 frame, rejecting anything shorter than the header, with an
/// unknown type tag, or with `mbz != 0`.
fn parse_frame(bytes: &[u8]) -> Option<ParsedFrame<'_>> {
    if bytes.len() < L4_HEADER_SIZE {
        return None;
    }
    if bytes[3] != 0 {
        return None;
    }
    let kind = match bytes[0] {
        0 => FrameType::Data,
        1 => FrameType::Ack,
        2 => FrameType::Reset,
        _ => return None,
    };

    Some(ParsedFrame {
        kind,
        seqno: bytes[1],
        ackno: bytes[2],
        payload: &bytes[L4_HEADER_SIZE..],
    })
}

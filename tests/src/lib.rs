//! Shared test harness: an in-memory, policy-controlled duplex channel
//! standing in for a real UDP socket so end-to-end scenarios (ACK loss,
//! checksum corruption, peer silence) can be driven deterministically
//! instead of relying on a real lossy network.

use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use l2_sap::{L2Sap, Socket};
use l4_sap::L4Sap;
use tokio::sync::{Mutex, mpsc};

/// What happens to one frame as it crosses a [`ChannelSocket`]'s `send`.
pub enum FrameAction {
    /// Forward the (possibly mutated) frame to the peer.
    Deliver(Vec<u8>),
    /// Swallow the frame; the peer never sees it.
    Drop,
}

/// Decides the fate of each frame sent in one direction. Receives the
/// exact bytes `L2Sap` built, header included.
pub type FramePolicy = Arc<dyn Fn(&[u8]) -> FrameAction + Send + Sync>;

/// Delivers every frame unchanged.
pub fn always_deliver() -> FramePolicy {
    Arc::new(|frame: &[u8]| FrameAction::Deliver(frame.to_vec()))
}

/// An in-memory [`Socket`] standing in for a connected UDP socket. Frames
/// sent through it pass through `policy` before reaching the peer's
/// receive queue.
pub struct ChannelSocket {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    policy: FramePolicy,
}

#[async_trait::async_trait]
impl Socket for ChannelSocket {
    async fn send(&self, frame: &[u8]) -> io::Result<usize> {
        let len = frame.len();
        if let FrameAction::Deliver(bytes) = (self.policy)(frame) {
            // The peer may already be gone in teardown-scenario tests;
            // that's not a send error from our side.
            let _ = self.outbound.send(bytes);
        }
        Ok(len)
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.inbound.lock().await;
        let frame = inbound
            .recv()
            .await
            .ok_or_else(|| io::Error::other("peer channel closed"))?;
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        Ok(n)
    }
}

/// Builds a connected pair of [`ChannelSocket`]s: frames `a` sends are
/// filtered by `a_to_b` before `b` can receive them, and vice versa.
pub fn paired_sockets(a_to_b: FramePolicy, b_to_a: FramePolicy) -> (ChannelSocket, ChannelSocket) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();

    let a = ChannelSocket {
        outbound: a_tx,
        inbound: Mutex::new(a_rx),
        policy: a_to_b,
    };
    let b = ChannelSocket {
        outbound: b_tx,
        inbound: Mutex::new(b_rx),
        policy: b_to_a,
    };

    (a, b)
}

/// Builds a pair of [`L4Sap`]s wired directly to each other through
/// [`ChannelSocket`]s, skipping real sockets entirely.
pub fn paired_l4_saps(
    a_to_b: FramePolicy,
    b_to_a: FramePolicy,
) -> (L4Sap<ChannelSocket>, L4Sap<ChannelSocket>) {
    let (a_socket, b_socket) = paired_sockets(a_to_b, b_to_a);
    let a = L4Sap::from_l2(L2Sap::from_socket(a_socket, Ipv4Addr::LOCALHOST));
    let b = L4Sap::from_l2(L2Sap::from_socket(b_socket, Ipv4Addr::LOCALHOST));
    (a, b)
}

/// A policy that drops the first `n` frames matched by `matches`,
/// delivering everything else untouched. Useful for "drop the first ACK"
/// style scenarios.
pub fn drop_first_matching(
    n: usize,
    matches: impl Fn(&[u8]) -> bool + Send + Sync + 'static,
) -> FramePolicy {
    let remaining = AtomicUsize::new(n);
    Arc::new(move |frame: &[u8]| {
        if matches(frame) && remaining.load(Ordering::SeqCst) > 0 {
            remaining.fetch_sub(1, Ordering::SeqCst);
            return FrameAction::Drop;
        }
        FrameAction::Deliver(frame.to_vec())
    })
}

/// A policy that flips one bit of the first frame matched by `matches`,
/// delivering it anyway so the receiver's checksum check is exercised,
/// and leaves every other frame untouched.
pub fn corrupt_first_matching(
    bit: usize,
    matches: impl Fn(&[u8]) -> bool + Send + Sync + 'static,
) -> FramePolicy {
    let done = AtomicBool::new(false);
    Arc::new(move |frame: &[u8]| {
        let mut bytes = frame.to_vec();
        if matches(frame) && !bytes.is_empty() && !done.swap(true, Ordering::SeqCst) {
            let byte = (bit / 8) % bytes.len();
            bytes[byte] ^= 1 << (bit % 8);
        }
        FrameAction::Deliver(bytes)
    })
}

/// Never delivers anything; stands in for a silent peer.
pub fn drop_everything() -> FramePolicy {
    Arc::new(|_frame: &[u8]| FrameAction::Drop)
}

/// True if the L2 frame's payload (an L4 frame) has the given L4 type tag
/// at its first byte: `0 = DATA`, `1 = ACK`, `2 = RESET`.
pub fn is_l4_type(frame: &[u8], type_tag: u8) -> bool {
    frame.get(l2_sap::L2_HEADER_SIZE).copied() == Some(type_tag)
}

use std::sync::Arc;

use crate::Result;

/// Local port identifier, a small integer naming one hardware attachment to
/// the interconnect.
pub type PortId = u8;

/// Opaque peer-device handle assigned by the transport.
///
/// The engine never interprets the value; it only stores it, passes it back
/// to [`Transport::submit_outbound`] and compares it during peer-removal
/// sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle(pub u64);

/// The peer can originate data messages.
pub const CAP_DATA_SRC: u32 = 1 << 0;

/// The peer can receive data messages.
pub const CAP_DATA_DST: u32 = 1 << 1;

/// A remote endpoint known to a local port.
///
/// Delivered by topology enumeration through `add_peer`; the capability
/// flags come from the peer's capability registers.
#[derive(Debug, Clone, Copy)]
pub struct PeerInfo {
    pub destid: u32,
    pub handle: PeerHandle,
    pub flags: u32,
}

impl PeerInfo {
    /// Only peers that can both source and sink data messages are usable as
    /// channel endpoints.
    pub fn is_data_capable(&self) -> bool {
        self.flags & (CAP_DATA_SRC | CAP_DATA_DST) == (CAP_DATA_SRC | CAP_DATA_DST)
    }
}

/// Completion notifications delivered by the transport.
///
/// Both callbacks run on transport-owned threads and must return quickly:
/// the engine only flips ring cursors or schedules a dispatch task from
/// them, it never blocks there. The transport must not invoke a callback
/// from inside a call the engine is making into it (the engine may be
/// holding its ring lock across `submit_outbound`).
pub trait MailboxEvents: Send + Sync {
    /// One or more filled buffers are waiting in the inbound mailbox.
    fn inbound_ready(&self, port: PortId, mbox: u8, slot: usize);

    /// Outbound progress notification. `slot` is the transport's next
    /// completion point: every ring entry from the engine's ack cursor up to
    /// (but not including) `slot` has been transmitted. A full ring with
    /// `slot` equal to the ack cursor means the whole ring completed.
    fn outbound_complete(&self, port: PortId, mbox: u8, slot: usize);
}

/// The hardware mailbox driver, as consumed by the engine.
///
/// One inbound/outbound mailbox pair is requested per local port. Datagrams
/// are fixed-maximum-size; [`submit_outbound`](Transport::submit_outbound)
/// copies the payload internally, so the caller may reuse or free its buffer
/// as soon as the call returns `Ok`.
pub trait Transport: Send + Sync + 'static {
    fn request_outbound(
        &self,
        port: PortId,
        mbox: u8,
        ring_size: usize,
        events: Arc<dyn MailboxEvents>,
    ) -> Result<()>;

    fn request_inbound(
        &self,
        port: PortId,
        mbox: u8,
        ring_size: usize,
        events: Arc<dyn MailboxEvents>,
    ) -> Result<()>;

    fn release_outbound(&self, port: PortId, mbox: u8);

    fn release_inbound(&self, port: PortId, mbox: u8);

    /// Hand an empty pool buffer to the transport for inbound reception.
    fn add_inbound_buffer(&self, port: PortId, mbox: u8, buf: Vec<u8>) -> Result<()>;

    /// Retrieve one filled inbound buffer, if any.
    fn get_inbound(&self, port: PortId, mbox: u8) -> Option<Vec<u8>>;

    /// Queue one datagram towards `peer`. `Err(Busy)` means the transport
    /// ring is momentarily full; any other error is a transmission failure.
    fn submit_outbound(&self, port: PortId, peer: PeerHandle, mbox: u8, buf: &[u8]) -> Result<()>;

    /// Polled at the top of each dispatcher activation.
    fn is_port_running(&self, port: PortId) -> bool;
}

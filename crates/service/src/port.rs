use std::{
    collections::VecDeque,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use codec::MAX_MSG_SIZE;
use parking_lot::{Mutex, RwLock};

use crate::{
    Error, Result,
    task::Task,
    transport::{MailboxEvents, PeerHandle, PeerInfo, PortId, Transport},
};

/// A deferred outbound request. Owns its payload until the transport
/// accepts it.
struct TxReq {
    peer: PeerHandle,
    buf: Vec<u8>,
}

struct TxState {
    // Slots between `ack` (inclusive) and `head` (exclusive, mod capacity)
    // are exactly the occupied entries awaiting completion.
    ring: Vec<Option<Vec<u8>>>,
    head: usize,
    ack: usize,
    count: usize,
    deferred: VecDeque<TxReq>,
}

/// Per-local-port context: the mailbox pair, the outbound ring, the inbound
/// buffer pool counter, the peer list and the RX dispatch task.
pub struct PortCtx<T> {
    id: PortId,
    host_destid: u32,
    mbox: u8,
    transport: Arc<T>,
    peers: RwLock<Vec<PeerInfo>>,
    tx: Mutex<TxState>,
    rx_pool: AtomicUsize,
    closed: AtomicBool,
    rx_task: Mutex<Option<Arc<Task>>>,
}

impl<T: Transport> PortCtx<T> {
    pub(crate) fn new(
        id: PortId,
        host_destid: u32,
        mbox: u8,
        tx_ring_size: usize,
        transport: Arc<T>,
    ) -> Arc<Self> {
        assert!(tx_ring_size.is_power_of_two());

        Arc::new(Self {
            id,
            host_destid,
            mbox,
            transport,
            peers: RwLock::new(Vec::with_capacity(8)),
            tx: Mutex::new(TxState {
                ring: vec![None; tx_ring_size],
                head: 0,
                ack: 0,
                count: 0,
                deferred: VecDeque::new(),
            }),
            rx_pool: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            rx_task: Mutex::new(None),
        })
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn host_destid(&self) -> u32 {
        self.host_destid
    }

    pub(crate) fn mbox(&self) -> u8 {
        self.mbox
    }

    pub(crate) fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Admit a peer. Duplicate destids and peers that cannot carry data
    /// messages are ignored.
    pub(crate) fn add_peer(&self, peer: PeerInfo) -> bool {
        if !peer.is_data_capable() {
            return false;
        }

        let mut peers = self.peers.write();
        if peers.iter().any(|p| p.destid == peer.destid) {
            return false;
        }

        peers.push(peer);
        true
    }

    pub(crate) fn remove_peer(&self, handle: PeerHandle) -> bool {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|p| p.handle != handle);
        peers.len() != before
    }

    pub(crate) fn resolve_peer(&self, destid: u32) -> Option<PeerInfo> {
        self.peers.read().iter().find(|p| p.destid == destid).copied()
    }

    pub(crate) fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub(crate) fn peer_destids(&self, max: usize) -> Vec<u32> {
        self.peers.read().iter().take(max).map(|p| p.destid).collect()
    }

    /// Queue one datagram. A full ring parks control messages on the
    /// deferred list (they carry the handshake and must not be lost), and
    /// reports `Busy` either way; data callers own their buffer and retry.
    pub(crate) fn tx_submit(&self, peer: PeerHandle, buf: Vec<u8>, control: bool) -> Result<()> {
        let mut tx = self.tx.lock();

        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NoDevice);
        }

        if tx.count == tx.ring.len() {
            if control {
                tx.deferred.push_back(TxReq { peer, buf });
            }

            return Err(Error::Busy);
        }

        match self.transport.submit_outbound(self.id, peer, self.mbox, &buf) {
            Ok(()) => {
                let slot = tx.head;
                let mask = tx.ring.len() - 1;
                tx.ring[slot] = Some(buf);
                tx.head = (slot + 1) & mask;
                tx.count += 1;
                Ok(())
            }
            Err(Error::Busy) if control => {
                tx.deferred.push_back(TxReq { peer, buf });
                Err(Error::Busy)
            }
            Err(e) => Err(e),
        }
    }

    /// Outbound completion. `slot` is the transport's next completion
    /// point; the ack cursor chases it, tolerating coalesced notifications,
    /// then freed slots are handed to parked control messages in FIFO
    /// order.
    pub(crate) fn tx_complete(&self, slot: usize) {
        let mut tx = self.tx.lock();
        let capacity = tx.ring.len();
        let mask = capacity - 1;

        while tx.count > 0 && (tx.ack != slot || tx.count == capacity) {
            let ack = tx.ack;
            tx.ring[ack] = None;
            tx.ack = (ack + 1) & mask;
            tx.count -= 1;
        }

        while tx.count < capacity {
            let Some(req) = tx.deferred.pop_front() else {
                break;
            };

            match self
                .transport
                .submit_outbound(self.id, req.peer, self.mbox, &req.buf)
            {
                Ok(()) => {
                    let slot = tx.head;
                    tx.ring[slot] = Some(req.buf);
                    tx.head = (slot + 1) & mask;
                    tx.count += 1;
                }
                Err(Error::Busy) => {
                    tx.deferred.push_front(req);
                    break;
                }
                Err(e) => {
                    log::warn!("port {}: deferred control send dropped: {}", self.id, e);
                }
            }
        }
    }

    /// Hand one fresh max-size buffer to the inbound mailbox.
    pub(crate) fn refill_inbound(&self) -> Result<()> {
        self.transport
            .add_inbound_buffer(self.id, self.mbox, vec![0u8; MAX_MSG_SIZE])?;

        self.rx_pool.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Pull one filled buffer out of the inbound mailbox.
    pub(crate) fn get_inbound(&self) -> Option<Vec<u8>> {
        let buf = self.transport.get_inbound(self.id, self.mbox)?;
        self.rx_pool.fetch_sub(1, Ordering::Relaxed);
        Some(buf)
    }

    /// Buffers currently lent to the inbound mailbox.
    pub(crate) fn inbound_level(&self) -> usize {
        self.rx_pool.load(Ordering::Relaxed)
    }

    pub(crate) fn set_rx_task(&self, task: Arc<Task>) {
        *self.rx_task.lock() = Some(task);
    }

    pub(crate) fn schedule_rx(&self) {
        if let Some(task) = &*self.rx_task.lock() {
            task.schedule();
        }
    }

    pub(crate) fn stop_rx_task(&self) {
        if let Some(task) = self.rx_task.lock().take() {
            task.stop();
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Drop everything still parked in the outbound ring and the deferred
    /// list. Called after the mailboxes are gone; no completions follow.
    pub(crate) fn clear_tx(&self) {
        let mut tx = self.tx.lock();
        for slot in tx.ring.iter_mut() {
            *slot = None;
        }

        tx.deferred.clear();
        tx.head = 0;
        tx.ack = 0;
        tx.count = 0;
    }
}

/// Bridges transport callbacks onto the owning port without keeping it
/// alive: a late callback after port removal upgrades to nothing and is
/// dropped.
pub(crate) struct PortEvents<T> {
    pub port: Weak<PortCtx<T>>,
}

impl<T: Transport> MailboxEvents for PortEvents<T> {
    fn inbound_ready(&self, _port: PortId, _mbox: u8, _slot: usize) {
        if let Some(port) = self.port.upgrade() {
            port.schedule_rx();
        }
    }

    fn outbound_complete(&self, _port: PortId, _mbox: u8, slot: usize) {
        if let Some(port) = self.port.upgrade() {
            port.tx_complete(slot);
        }
    }
}

//! ## Channelized messaging engine
//!
//! Multiplexes one inbound/outbound mailbox pair per local port into
//! thousands of independent bidirectional channels, each a reliable
//! in-order byte-message stream between a local endpoint and a matching
//! endpoint on another node of the interconnect.
//!
//! The engine owns the channel lifecycle (bind/listen/connect/accept/
//! close), the in-band connection handshake, the bounded transmit ring
//! with its deferred control queue, and the per-channel bounded receive
//! rings. The hardware mailbox driver, topology enumeration and the
//! user-facing device surface are collaborators behind the
//! [`Transport`](transport::Transport) trait and the lifecycle calls of
//! [`Service`].

pub mod channel;
pub mod port;
pub mod registry;
pub mod task;
pub mod transport;

mod handshake;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
    },
    time::Duration,
};

use bytes::Bytes;
use codec::{ChanOp, HEADER_LEN, Header, MAX_MSG_SIZE, PacketType};
use parking_lot::RwLock;

use self::{
    channel::{Channel, State},
    port::{PortCtx, PortEvents},
    registry::{ChannelRange, Registry},
    task::{ControlWorker, Job, Task},
    transport::{MailboxEvents, PeerHandle, PeerInfo, PortId, Transport},
};

/// Fixed timeout for the close path's wait on channel destruction.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Messages drained from the inbound mailbox per dispatcher activation.
const RX_BURST: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Invalid,
    NotFound,
    Busy,
    Again,
    Timeout,
    Interrupted,
    Canceled,
    Refused,
    ConnReset,
    NoMemory,
    Io,
    NoDevice,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why an inbound data message never reached a receive ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    RingFull,
    NotConnected,
    UnknownChannel,
}

/// Engine event callbacks.
///
/// Implemented by the embedding layer for logging and accounting; every
/// method defaults to a no-op. Callbacks fire on engine threads (the
/// serialized control worker or a dispatch task) and must not block.
pub trait ServiceHandler: Send + Sync {
    #[allow(unused_variables)]
    fn on_bind(&self, channel: u16, port: PortId) {}

    #[allow(unused_variables)]
    fn on_listen(&self, channel: u16) {}

    /// An outgoing connect completed; `remote_ch` came from the CONN_ACK.
    #[allow(unused_variables)]
    fn on_connected(&self, channel: u16, remote_destid: u32, remote_ch: u16) {}

    /// A listening channel spawned `channel` for a remote requester.
    #[allow(unused_variables)]
    fn on_accepted(&self, parent: u16, channel: u16, remote_destid: u32) {}

    /// The channel left the registry, whether by local close, remote
    /// close, peer loss or port teardown.
    #[allow(unused_variables)]
    fn on_close(&self, channel: u16) {}

    #[allow(unused_variables)]
    fn on_message_dropped(&self, channel: u16, reason: DropReason) {}
}

pub struct ServiceOptions {
    /// Mailbox number used on every local port.
    pub mbox: u8,
    /// Outbound ring capacity, a power of two.
    pub tx_ring_size: usize,
    /// Inbound pool and per-channel receive ring capacity.
    pub rx_ring_size: usize,
    /// Channel numbers handed out to dynamic requests.
    pub dynamic_range: ChannelRange,
    /// How long an outgoing connect waits for the CONN_ACK.
    pub connect_timeout: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            mbox: 1,
            tx_ring_size: 128,
            rx_ring_size: 128,
            dynamic_range: ChannelRange::default(),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

/// The channelized messaging engine.
///
/// One instance per process; local ports and peers arrive through the
/// lifecycle calls, channel operations are keyed by the process-wide
/// 16-bit channel number. Lock order, top-down: port list → registry →
/// channel → TX ring; nothing ever holds two channel locks at once.
pub struct Service<T: Transport, H: ServiceHandler> {
    transport: Arc<T>,
    handler: Arc<H>,
    options: ServiceOptions,
    ports: RwLock<Vec<Arc<PortCtx<T>>>>,
    registry: Arc<Registry<T>>,
    worker: ControlWorker<Arc<PortCtx<T>>>,
    shutdown: AtomicBool,
}

impl<T, H> Service<T, H>
where
    T: Transport,
    H: ServiceHandler + 'static,
{
    pub fn new(options: ServiceOptions, transport: T, handler: H) -> Self {
        assert!(options.tx_ring_size.is_power_of_two());

        let transport = Arc::new(transport);
        let handler = Arc::new(handler);
        let registry = Arc::new(Registry::new(options.dynamic_range));

        let worker = {
            let registry = registry.clone();
            let handler = handler.clone();
            ControlWorker::spawn(move |port, bytes| {
                handshake::process(&registry, handler.as_ref(), port, bytes)
            })
        };

        Self {
            transport,
            handler,
            options,
            ports: RwLock::new(Vec::new()),
            registry,
            worker,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Bring up a local port: request both mailboxes, pre-fill the inbound
    /// pool and start the RX dispatch task. Failure to acquire either
    /// mailbox is fatal for the port; everything acquired so far is
    /// released again.
    pub fn add_port(&self, id: PortId, host_destid: u32) -> Result<()> {
        {
            if self.ports.read().iter().any(|p| p.id() == id) {
                return Err(Error::Busy);
            }
        }

        let queue = match self.worker.queue() {
            Some(queue) => queue,
            None => return Err(Error::NoDevice),
        };

        let port = PortCtx::new(
            id,
            host_destid,
            self.options.mbox,
            self.options.tx_ring_size,
            self.transport.clone(),
        );

        let events: Arc<dyn MailboxEvents> = Arc::new(PortEvents {
            port: Arc::downgrade(&port),
        });

        self.transport
            .request_outbound(id, self.options.mbox, self.options.tx_ring_size, events.clone())?;

        if let Err(e) =
            self.transport
                .request_inbound(id, self.options.mbox, self.options.rx_ring_size, events)
        {
            self.transport.release_outbound(id, self.options.mbox);
            return Err(e);
        }

        for _ in 0..self.options.rx_ring_size {
            if let Err(e) = port.refill_inbound() {
                self.transport.release_inbound(id, self.options.mbox);
                self.transport.release_outbound(id, self.options.mbox);
                return Err(e);
            }
        }

        let task = {
            let weak = Arc::downgrade(&port);
            let registry = self.registry.clone();
            let handler = self.handler.clone();

            Task::spawn(&format!("chanmux-rx{}", id), move || {
                let Some(port) = weak.upgrade() else {
                    return false;
                };

                rx_dispatch(&port, &registry, handler.as_ref(), &queue)
            })
        };

        port.set_rx_task(task);
        self.ports.write().push(port);
        Ok(())
    }

    /// Tear a local port down: unpublish it, quiesce the dispatch task,
    /// drain the control worker, close every channel attached to the port,
    /// then give the mailboxes back.
    pub fn remove_port(&self, id: PortId) -> Result<()> {
        let port = {
            let mut ports = self.ports.write();
            let index = ports
                .iter()
                .position(|p| p.id() == id)
                .ok_or(Error::NotFound)?;

            ports.remove(index)
        };

        port.stop_rx_task();
        self.worker.flush();

        for channel in self.registry.snapshot() {
            let owned = channel.lock().port.as_ref().map(|p| p.id()) == Some(id);
            if owned {
                self.registry.unpublish(channel.id());
                channel.shut_down(true);
                self.handler.on_close(channel.id());
            }
        }

        port.mark_closed();
        self.transport.release_inbound(id, self.options.mbox);
        self.transport.release_outbound(id, self.options.mbox);
        port.clear_tx();

        log::debug!(
            "port {}: removed, {} inbound buffers left with the transport",
            id,
            port.inbound_level()
        );

        Ok(())
    }

    /// Admit a peer discovered on `port`. Peers that cannot both source
    /// and sink data messages are ignored, as are duplicate destids.
    pub fn add_peer(&self, port: PortId, peer: PeerInfo) -> Result<()> {
        let ports = self.ports.read();
        let port = ports.iter().find(|p| p.id() == port).ok_or(Error::NotFound)?;

        if !port.add_peer(peer) {
            log::debug!(
                "port {}: peer destid {:#x} ignored (duplicate or not data-capable)",
                port.id(),
                peer.destid
            );
        }

        Ok(())
    }

    /// A peer went away. Every channel attached to it transitions through
    /// `Disconnect` and is closed; during engine shutdown the transition
    /// is skipped, the peer is already marked down.
    pub fn remove_peer(&self, port: PortId, handle: PeerHandle) -> Result<()> {
        {
            let ports = self.ports.read();
            let port = ports.iter().find(|p| p.id() == port).ok_or(Error::NotFound)?;
            port.remove_peer(handle);
        }

        let shutting_down = self.shutdown.load(Ordering::Acquire);

        for channel in self.registry.snapshot() {
            let matches = channel.lock().peer == Some(handle);
            if matches {
                self.registry.unpublish(channel.id());

                if !shutting_down {
                    channel.set_state(State::Disconnect);
                }

                channel.shut_down(true);
                self.handler.on_close(channel.id());
            }
        }

        Ok(())
    }

    /// The process is going down: send CONN_CLOSE for every connected
    /// channel and wake every blocked caller.
    pub fn shutdown_notice(&self) {
        self.shutdown.store(true, Ordering::Release);

        for channel in self.registry.snapshot() {
            let close = {
                let inner = channel.lock();
                if inner.state == State::Connected {
                    inner.port.clone().zip(inner.peer).map(|(port, peer)| {
                        (
                            port,
                            peer,
                            inner.local_destid,
                            inner.remote_destid,
                            inner.remote_ch,
                        )
                    })
                } else {
                    None
                }
            };

            if let Some((port, peer, src_destid, dst_destid, remote_ch)) = close {
                let header = Header {
                    src_destid,
                    dst_destid,
                    src_mbox: port.mbox(),
                    dst_mbox: port.mbox(),
                    packet_type: PacketType::Channel,
                    ch_op: ChanOp::ConnClose,
                    dst_ch: remote_ch,
                    src_ch: channel.id(),
                    msg_len: HEADER_LEN as u16,
                };

                let mut buf = vec![0u8; HEADER_LEN];
                header.write_to(&mut buf);

                if let Err(e) = port.tx_submit(peer, buf, true) {
                    if e != Error::Busy {
                        log::warn!("channel {}: shutdown CONN_CLOSE not sent: {}", channel.id(), e);
                    }
                }
            }

            channel.interrupt();
        }
    }

    pub fn ep_list_size(&self, port: PortId) -> Result<usize> {
        let ports = self.ports.read();
        let port = ports.iter().find(|p| p.id() == port).ok_or(Error::NotFound)?;
        Ok(port.peer_count())
    }

    pub fn ep_list(&self, port: PortId, max: usize) -> Result<Vec<u32>> {
        let ports = self.ports.read();
        let port = ports.iter().find(|p| p.id() == port).ok_or(Error::NotFound)?;
        Ok(port.peer_destids(max))
    }

    pub fn port_list(&self, max: usize) -> Vec<(PortId, u32)> {
        self.ports
            .read()
            .iter()
            .take(max)
            .map(|p| (p.id(), p.host_destid()))
            .collect()
    }

    /// Create a channel. A non-zero `requested` number is reserved
    /// literally; `0` takes the lowest free number in the dynamic range.
    /// The owner token identifies the creator for
    /// [`channel_close`](Self::channel_close) and
    /// [`release_owner`](Self::release_owner).
    pub fn channel_create(&self, requested: u16, owner: u64) -> Result<u16> {
        let channel = self.registry.publish(requested, |id| {
            Channel::new(id, owner, self.options.rx_ring_size)
        })?;

        Ok(channel.id())
    }

    /// Attach a channel to a local port.
    pub fn channel_bind(&self, id: u16, port: PortId, context: u64) -> Result<()> {
        let channel = self.registry.lookup(id).ok_or(Error::NotFound)?;

        let port_ctx = {
            let ports = self.ports.read();
            ports
                .iter()
                .find(|p| p.id() == port)
                .cloned()
                .ok_or(Error::NotFound)?
        };

        channel.bind(port_ctx, context)?;
        self.handler.on_bind(id, port);
        Ok(())
    }

    pub fn channel_listen(&self, id: u16) -> Result<()> {
        let channel = self.registry.lookup(id).ok_or(Error::NotFound)?;
        channel.listen()?;
        self.handler.on_listen(id);
        Ok(())
    }

    /// Take one pending connection request off a listening channel and
    /// spawn the connected child channel for it, acknowledging the
    /// requester on the wire. Returns the child's channel number.
    pub fn channel_accept(&self, id: u16, timeout: Option<Duration>) -> Result<u16> {
        let parent = self.registry.lookup(id).ok_or(Error::NotFound)?;
        let req = parent.wait_conn_req(timeout)?;

        let (port, local_destid, context) = {
            let inner = parent.lock();
            match &inner.port {
                Some(port) => (port.clone(), inner.local_destid, inner.context),
                None => return Err(Error::Invalid),
            }
        };

        let child = self.registry.publish(0, |child_id| {
            Channel::new(child_id, parent.owner(), self.options.rx_ring_size)
        })?;

        let Some(peer) = port.resolve_peer(req.destid) else {
            self.registry.unpublish(child.id());
            return Err(Error::NotFound);
        };

        child.establish(
            port.clone(),
            peer.handle,
            local_destid,
            req.destid,
            req.channel,
            context,
        );

        let header = Header {
            src_destid: local_destid,
            dst_destid: req.destid,
            src_mbox: port.mbox(),
            dst_mbox: port.mbox(),
            packet_type: PacketType::Channel,
            ch_op: ChanOp::ConnAck,
            dst_ch: req.channel,
            src_ch: child.id(),
            msg_len: HEADER_LEN as u16,
        };

        let mut buf = vec![0u8; HEADER_LEN];
        header.write_to(&mut buf);

        match port.tx_submit(peer.handle, buf, true) {
            Ok(()) | Err(Error::Busy) => {}
            Err(e) => {
                self.registry.unpublish(child.id());
                child.shut_down(false);
                return Err(e);
            }
        }

        self.handler.on_accepted(id, child.id(), req.destid);
        Ok(child.id())
    }

    /// Connect an idle channel to a listening channel on a remote node and
    /// wait for the acknowledgement.
    pub fn channel_connect(
        &self,
        id: u16,
        port: PortId,
        remote_destid: u32,
        remote_ch: u16,
    ) -> Result<()> {
        let (port, peer) = {
            let ports = self.ports.read();
            let port = ports
                .iter()
                .find(|p| p.id() == port)
                .cloned()
                .ok_or(Error::NotFound)?;

            let peer = port.resolve_peer(remote_destid).ok_or(Error::NotFound)?;
            (port, peer)
        };

        let channel = self.registry.lookup(id).ok_or(Error::NotFound)?;
        channel.connect_start(port.clone(), peer.handle, remote_destid, remote_ch)?;

        let header = Header {
            src_destid: port.host_destid(),
            dst_destid: remote_destid,
            src_mbox: port.mbox(),
            dst_mbox: port.mbox(),
            packet_type: PacketType::Channel,
            ch_op: ChanOp::ConnReq,
            dst_ch: remote_ch,
            src_ch: id,
            msg_len: HEADER_LEN as u16,
        };

        let mut buf = vec![0u8; HEADER_LEN];
        header.write_to(&mut buf);

        if let Err(e) = port.tx_submit(peer.handle, buf, true) {
            // Busy means the request is parked on the deferred queue and
            // will go out as completions free ring slots.
            if e != Error::Busy {
                channel.connect_abort();
                return Err(e);
            }
        }

        channel.wait_connect(self.options.connect_timeout)
    }

    /// Send one message on a connected channel. The engine prefixes the
    /// channel header; `msg_len` on the wire counts header plus payload.
    pub fn channel_send(&self, id: u16, payload: &[u8]) -> Result<()> {
        if payload.is_empty() || payload.len() > MAX_MSG_SIZE - HEADER_LEN {
            return Err(Error::Invalid);
        }

        let channel = self.registry.lookup(id).ok_or(Error::NotFound)?;

        let (port, peer, src_destid, dst_destid, remote_ch) = {
            let inner = channel.lock();
            if inner.state != State::Connected {
                return Err(Error::Again);
            }

            (
                inner.port.clone().ok_or(Error::Io)?,
                inner.peer.ok_or(Error::Io)?,
                inner.local_destid,
                inner.remote_destid,
                inner.remote_ch,
            )
        };

        let mut buf = vec![0u8; HEADER_LEN + payload.len()];

        Header {
            src_destid,
            dst_destid,
            src_mbox: port.mbox(),
            dst_mbox: port.mbox(),
            packet_type: PacketType::Channel,
            ch_op: ChanOp::Data,
            dst_ch: remote_ch,
            src_ch: id,
            msg_len: (HEADER_LEN + payload.len()) as u16,
        }
        .write_to(&mut buf);

        buf[HEADER_LEN..].copy_from_slice(payload);
        port.tx_submit(peer, buf, false)
    }

    /// Fetch the oldest pending message. The returned buffer is the whole
    /// datagram, header included; it stays charged to the channel until
    /// [`channel_release_rx`](Self::channel_release_rx).
    pub fn channel_receive(&self, id: u16, timeout: Option<Duration>) -> Result<Bytes> {
        let channel = self.registry.lookup(id).ok_or(Error::NotFound)?;
        channel.receive(timeout)
    }

    /// Give back a buffer obtained from
    /// [`channel_receive`](Self::channel_receive). Valid exactly once per
    /// received buffer.
    pub fn channel_release_rx(&self, id: u16, buf: &Bytes) -> Result<()> {
        let channel = self.registry.lookup(id).ok_or(Error::NotFound)?;
        channel.release_rx(buf)
    }

    /// Close a channel and wait for it to be destroyed.
    ///
    /// The channel leaves the registry immediately; a CONN_CLOSE goes out
    /// if it was connected. The call then waits up to three seconds for
    /// outstanding references (blocked waiters, in-flight dispatches) to
    /// drain before reporting `Timeout`.
    pub fn channel_close(&self, id: u16, owner: u64) -> Result<()> {
        let channel = self.registry.lookup(id).ok_or(Error::NotFound)?;
        if channel.owner() != owner {
            return Err(Error::NotFound);
        }

        self.registry.unpublish(id);
        channel.shut_down(true);
        self.handler.on_close(id);

        let destroyed = channel.destroyed();
        drop(channel);

        if !destroyed.wait_timeout(CLOSE_TIMEOUT) {
            return Err(Error::Timeout);
        }

        Ok(())
    }

    /// Close every channel created with `owner`. Called by the adaptor
    /// when the owning handle goes away; nothing is waited on.
    pub fn release_owner(&self, owner: u64) {
        for channel in self.registry.snapshot() {
            if channel.owner() == owner {
                self.registry.unpublish(channel.id());
                channel.shut_down(true);
                self.handler.on_close(channel.id());
            }
        }
    }
}

impl<T: Transport, H: ServiceHandler> Drop for Service<T, H> {
    fn drop(&mut self) {
        let ports: Vec<Arc<PortCtx<T>>> = self.ports.write().drain(..).collect();

        for port in &ports {
            port.stop_rx_task();
            port.mark_closed();
            self.transport.release_inbound(port.id(), self.options.mbox);
            self.transport.release_outbound(port.id(), self.options.mbox);
            port.clear_tx();
        }

        self.worker.stop();
    }
}

/// One dispatcher activation: drain up to [`RX_BURST`] datagrams, refilling
/// the inbound pool one buffer per message. Data goes straight to the
/// target channel's receive ring; handshake datagrams are handed to the
/// serialized control worker. Returns `true` to request a reschedule.
fn rx_dispatch<T, H>(
    port: &Arc<PortCtx<T>>,
    registry: &Registry<T>,
    handler: &H,
    queue: &Sender<Job<Arc<PortCtx<T>>>>,
) -> bool
where
    T: Transport,
    H: ServiceHandler,
{
    if !port.transport().is_port_running(port.id()) {
        return false;
    }

    for _ in 0..RX_BURST {
        let Some(buf) = port.get_inbound() else {
            return false;
        };

        if let Err(e) = port.refill_inbound() {
            log::warn!("port {}: inbound pool refill failed: {}", port.id(), e);
        }

        let mut bytes = Bytes::from(buf);

        let header = match Header::decode(&bytes) {
            Ok(header) => header,
            Err(e) => {
                log::debug!("port {}: dropped undecodable datagram: {}", port.id(), e);
                continue;
            }
        };

        if header.packet_type != PacketType::Channel {
            continue;
        }

        let msg_len = header.msg_len as usize;
        if msg_len < HEADER_LEN || msg_len > bytes.len() {
            log::debug!("port {}: dropped datagram with bad length {}", port.id(), msg_len);
            continue;
        }

        bytes.truncate(msg_len);

        if header.ch_op == ChanOp::Data {
            match registry.lookup(header.dst_ch) {
                Some(channel) => {
                    if let Err(e) = channel.push_data(bytes) {
                        handler.on_message_dropped(
                            header.dst_ch,
                            match e {
                                Error::NoMemory => DropReason::RingFull,
                                _ => DropReason::NotConnected,
                            },
                        );
                    }
                }
                None => {
                    log::debug!("port {}: data for unknown channel {}", port.id(), header.dst_ch);
                    handler.on_message_dropped(header.dst_ch, DropReason::UnknownChannel);
                }
            }
        } else {
            let _ = queue.send(Job::Control {
                port: port.clone(),
                bytes,
            });
        }
    }

    // Burst exhausted with the mailbox possibly non-empty; reschedule so
    // other ports get a turn.
    true
}

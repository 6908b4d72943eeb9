pub mod ring;

pub use self::ring::RxRing;

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use codec::{ChanOp, HEADER_LEN, Header, PacketType};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    Error, Result,
    port::PortCtx,
    task::Completion,
    transport::{PeerHandle, Transport},
};

/// Channel lifecycle states.
///
/// `Idle → Bound → Listen` on the accepting side, `Idle → Connect →
/// Connected` on the initiating side; both sides leave through
/// `Disconnect`/`Destroying`. `Destroying` is terminal, the object goes away
/// once the last reference drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Bound,
    Listen,
    Connect,
    Connected,
    Disconnect,
    Destroying,
}

/// A pending inbound connection request parked on a listening channel.
pub(crate) struct ConnReq<T> {
    pub destid: u32,
    pub channel: u16,
    pub port: Arc<PortCtx<T>>,
}

pub(crate) struct ChannelInner<T> {
    pub state: State,
    pub context: u64,
    pub port: Option<Arc<PortCtx<T>>>,
    pub peer: Option<PeerHandle>,
    pub local_destid: u32,
    pub remote_destid: u32,
    pub remote_ch: u16,
    pub error: Option<Error>,
    pub interrupted: bool,
    pub accept_queue: VecDeque<ConnReq<T>>,
    pub rx: RxRing,
}

/// One endpoint of a bidirectional message channel.
///
/// All mutable state sits behind one mutex; a single condition variable
/// serves every waiter class (connectors, acceptors, receivers), woken
/// broadly on state changes and singly on data arrival. The `destroyed`
/// completion fires from `Drop`, which is what a closing caller waits on
/// after giving up its own references.
pub struct Channel<T> {
    id: u16,
    owner: u64,
    inner: Mutex<ChannelInner<T>>,
    cond: Condvar,
    destroyed: Arc<Completion>,
}

impl<T> Drop for Channel<T> {
    fn drop(&mut self) {
        self.destroyed.signal();
    }
}

impl<T: Transport> Channel<T> {
    pub(crate) fn new(id: u16, owner: u64, rx_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            owner,
            inner: Mutex::new(ChannelInner {
                state: State::Idle,
                context: 0,
                port: None,
                peer: None,
                local_destid: 0,
                remote_destid: 0,
                remote_ch: 0,
                error: None,
                interrupted: false,
                accept_queue: VecDeque::new(),
                rx: RxRing::new(rx_capacity),
            }),
            cond: Condvar::new(),
            destroyed: Arc::new(Completion::default()),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn owner(&self) -> u64 {
        self.owner
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ChannelInner<T>> {
        self.inner.lock()
    }

    pub(crate) fn destroyed(&self) -> Arc<Completion> {
        self.destroyed.clone()
    }

    /// Attach the channel to a local port. `Idle` only.
    pub(crate) fn bind(&self, port: Arc<PortCtx<T>>, context: u64) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != State::Idle {
            return Err(Error::Invalid);
        }

        inner.local_destid = port.host_destid();
        inner.port = Some(port);
        inner.context = context;
        inner.state = State::Bound;
        Ok(())
    }

    /// `Bound → Listen`, `Invalid` from any other state.
    pub(crate) fn listen(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != State::Bound {
            return Err(Error::Invalid);
        }

        inner.state = State::Listen;
        Ok(())
    }

    /// `Idle → Connect`, attaching port and peer for the outgoing request.
    pub(crate) fn connect_start(
        &self,
        port: Arc<PortCtx<T>>,
        peer: PeerHandle,
        remote_destid: u32,
        remote_ch: u16,
    ) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != State::Idle {
            return Err(Error::Invalid);
        }

        inner.local_destid = port.host_destid();
        inner.port = Some(port);
        inner.peer = Some(peer);
        inner.remote_destid = remote_destid;
        inner.remote_ch = remote_ch;
        inner.state = State::Connect;
        Ok(())
    }

    /// Roll a failed connection attempt back to `Idle`.
    pub(crate) fn connect_abort(&self) {
        let mut inner = self.lock();
        if inner.state == State::Connect {
            inner.state = State::Idle;
            inner.port = None;
            inner.peer = None;
        }
    }

    /// Block until the connect handshake resolves.
    ///
    /// A plain timeout rolls the channel back to `Idle` so the caller may
    /// retry; any other state change while waiting reports `Refused`.
    pub(crate) fn wait_connect(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();

        loop {
            match inner.state {
                State::Connected => return Ok(()),
                State::Connect => {}
                _ => return Err(Error::Refused),
            }

            if inner.interrupted {
                return Err(Error::Interrupted);
            }

            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                if inner.state == State::Connected {
                    return Ok(());
                }

                if inner.state != State::Connect {
                    return Err(Error::Refused);
                }

                inner.state = State::Idle;
                inner.port = None;
                inner.peer = None;
                return Err(Error::Timeout);
            }
        }
    }

    /// `Connect → Connected` on CONN_ACK, recording the peer's channel
    /// number from the wire. `false` when the ack raced a close or timeout.
    pub(crate) fn complete_connect(&self, remote_ch: u16) -> bool {
        let mut inner = self.lock();
        if inner.state != State::Connect {
            return false;
        }

        inner.remote_ch = remote_ch;
        inner.state = State::Connected;
        drop(inner);

        self.cond.notify_all();
        true
    }

    /// Place an accepted channel directly into `Connected`.
    pub(crate) fn establish(
        &self,
        port: Arc<PortCtx<T>>,
        peer: PeerHandle,
        local_destid: u32,
        remote_destid: u32,
        remote_ch: u16,
        context: u64,
    ) {
        let mut inner = self.lock();
        inner.local_destid = local_destid;
        inner.remote_destid = remote_destid;
        inner.remote_ch = remote_ch;
        inner.port = Some(port);
        inner.peer = Some(peer);
        inner.context = context;
        inner.state = State::Connected;
    }

    /// Park an inbound CONN_REQ on a listening channel. `false` (drop) when
    /// the channel is not listening.
    pub(crate) fn enqueue_conn_req(&self, req: ConnReq<T>) -> bool {
        let mut inner = self.lock();
        if inner.state != State::Listen {
            return false;
        }

        inner.accept_queue.push_back(req);
        drop(inner);

        self.cond.notify_all();
        true
    }

    /// Wait for a pending connection request. `timeout` of zero means
    /// non-blocking; `None` waits indefinitely.
    pub(crate) fn wait_conn_req(&self, timeout: Option<Duration>) -> Result<ConnReq<T>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.lock();

        loop {
            if inner.state != State::Listen {
                return Err(Error::Canceled);
            }

            if let Some(req) = inner.accept_queue.pop_front() {
                return Ok(req);
            }

            if inner.interrupted {
                return Err(Error::Interrupted);
            }

            match deadline {
                Some(deadline) => {
                    if matches!(timeout, Some(t) if t.is_zero()) {
                        return Err(Error::Again);
                    }

                    if self.cond.wait_until(&mut inner, deadline).timed_out()
                        && inner.accept_queue.is_empty()
                        && inner.state == State::Listen
                    {
                        return Err(Error::Timeout);
                    }
                }
                None => self.cond.wait(&mut inner),
            }
        }
    }

    /// Store one inbound data message on the receive ring.
    ///
    /// Wrong state drops the message with `Io`, a full ring drops it with
    /// `NoMemory`; neither errors the channel itself.
    pub(crate) fn push_data(&self, buf: Bytes) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != State::Connected {
            return Err(Error::Io);
        }

        inner.rx.push(buf)?;
        drop(inner);

        self.cond.notify_one();
        Ok(())
    }

    /// Fetch the oldest pending message, lending the buffer to the caller
    /// until [`release_rx`](Self::release_rx).
    pub fn receive(&self, timeout: Option<Duration>) -> Result<Bytes> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.lock();

        if inner.state != State::Connected {
            return Err(Error::Again);
        }

        if inner.rx.inuse_full() {
            return Err(Error::NoMemory);
        }

        while inner.rx.is_empty() {
            if inner.interrupted {
                return Err(Error::Interrupted);
            }

            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut inner, deadline).timed_out() {
                        if inner.state != State::Connected {
                            return Err(inner.error.unwrap_or(Error::ConnReset));
                        }

                        if inner.rx.is_empty() {
                            return Err(Error::Timeout);
                        }
                    }
                }
                None => self.cond.wait(&mut inner),
            }

            if inner.state != State::Connected {
                return Err(inner.error.unwrap_or(Error::ConnReset));
            }
        }

        if inner.rx.inuse_full() {
            return Err(Error::NoMemory);
        }

        Ok(inner.rx.pop().expect("receive ring count was non-zero"))
    }

    /// Return a buffer lent out by [`receive`](Self::receive).
    pub fn release_rx(&self, buf: &Bytes) -> Result<()> {
        self.lock().rx.release(buf)
    }

    pub(crate) fn set_state(&self, state: State) {
        self.lock().state = state;
    }

    /// Abort any blocked waiter; used when the engine is going down.
    pub(crate) fn interrupt(&self) {
        let mut inner = self.lock();
        inner.interrupted = true;
        drop(inner);

        self.cond.notify_all();
    }

    /// Tear the channel down, capturing the prior state.
    ///
    /// When the prior state was `Connected` and `send_close` is set, a
    /// CONN_CLOSE goes out on the wire; a deferred submission (`Busy`) is
    /// fine, any other transport error is logged and swallowed. Every
    /// waiter is woken and will observe `Destroying`.
    pub(crate) fn shut_down(&self, send_close: bool) -> State {
        let (prior, close) = {
            let mut inner = self.lock();
            let prior = inner.state;
            inner.state = State::Destroying;
            inner.accept_queue.clear();

            if prior == State::Connected {
                inner.error = Some(Error::ConnReset);
            }

            let close = if send_close && prior == State::Connected {
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
            };

            (prior, close)
        };

        self.cond.notify_all();

        if let Some((port, peer, src_destid, dst_destid, remote_ch)) = close {
            let header = Header {
                src_destid,
                dst_destid,
                src_mbox: port.mbox(),
                dst_mbox: port.mbox(),
                packet_type: PacketType::Channel,
                ch_op: ChanOp::ConnClose,
                dst_ch: remote_ch,
                src_ch: self.id,
                msg_len: HEADER_LEN as u16,
            };

            let mut buf = vec![0u8; HEADER_LEN];
            header.write_to(&mut buf);

            if let Err(e) = port.tx_submit(peer, buf, true) {
                if e != Error::Busy {
                    log::warn!("channel {}: CONN_CLOSE not sent: {}", self.id, e);
                }
            }
        }

        prior
    }
}

//! Two engine instances joined by an in-process loopback transport:
//! node A is destid 0x01, node B is destid 0x02, both on port 0, mailbox 1.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        mpsc::{Sender, channel},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Result;
use chanmux::{
    observer::Observer,
    statistics::{Number, Statistics},
};
use codec::HEADER_LEN;
use parking_lot::Mutex;
use service::{
    Error, Service, ServiceOptions,
    transport::{
        CAP_DATA_DST, CAP_DATA_SRC, MailboxEvents, PeerHandle, PeerInfo, PortId, Transport,
    },
};

enum Event {
    Deliver { to: u32, buf: Vec<u8> },
    Complete { from: u32 },
    Flush { from: u32 },
}

struct Endpoint {
    port: PortId,
    mbox: u8,
    running: bool,
    pool: usize,
    inbox: VecDeque<Vec<u8>>,
    events: Option<Arc<dyn MailboxEvents>>,
    ring_size: usize,
    accepted: usize,
    acked: usize,
    paused: bool,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            port: 0,
            mbox: 0,
            running: false,
            pool: 0,
            inbox: VecDeque::new(),
            events: None,
            ring_size: 128,
            accepted: 0,
            acked: 0,
            paused: false,
        }
    }
}

/// The shared wire. Deliveries and completions travel through a pump
/// thread so that no engine callback ever runs inside an engine call.
struct Hub {
    endpoints: Mutex<HashMap<u32, Endpoint>>,
    queue: Mutex<Sender<Event>>,
}

impl Hub {
    fn new() -> Arc<Self> {
        let (sender, receiver) = channel();

        let hub = Arc::new(Self {
            endpoints: Mutex::new(HashMap::new()),
            queue: Mutex::new(sender),
        });

        let this = Arc::downgrade(&hub);
        thread::spawn(move || {
            while let Ok(event) = receiver.recv() {
                let Some(hub) = this.upgrade() else { return };
                hub.handle(event);
            }
        });

        hub
    }

    fn send(&self, event: Event) {
        let _ = self.queue.lock().send(event);
    }

    /// Park outbound completions for a node, or flush everything parked.
    fn pause_completions(&self, destid: u32, paused: bool) {
        if paused {
            if let Some(endpoint) = self.endpoints.lock().get_mut(&destid) {
                endpoint.paused = true;
            }
        } else {
            self.send(Event::Flush { from: destid });
        }
    }

    fn handle(&self, event: Event) {
        match event {
            Event::Deliver { to, buf } => {
                let notify = {
                    let mut endpoints = self.endpoints.lock();
                    let Some(endpoint) = endpoints.get_mut(&to) else {
                        return;
                    };

                    if !endpoint.running {
                        return;
                    }

                    // The hardware ring is modeled as unbounded so that
                    // overflow behavior is decided by the engine's own
                    // rings, not by this harness.
                    endpoint.pool = endpoint.pool.saturating_sub(1);
                    endpoint.inbox.push_back(buf);
                    endpoint
                        .events
                        .clone()
                        .map(|events| (events, endpoint.port, endpoint.mbox))
                };

                if let Some((events, port, mbox)) = notify {
                    events.inbound_ready(port, mbox, 0);
                }
            }
            Event::Complete { from } => {
                let notify = {
                    let mut endpoints = self.endpoints.lock();
                    let Some(endpoint) = endpoints.get_mut(&from) else {
                        return;
                    };

                    endpoint.accepted += 1;
                    if endpoint.paused {
                        None
                    } else {
                        endpoint.acked = endpoint.accepted;
                        endpoint.events.clone().map(|events| {
                            (
                                events,
                                endpoint.port,
                                endpoint.mbox,
                                endpoint.acked % endpoint.ring_size,
                            )
                        })
                    }
                };

                if let Some((events, port, mbox, slot)) = notify {
                    events.outbound_complete(port, mbox, slot);
                }
            }
            Event::Flush { from } => {
                // One coalesced completion covering everything parked.
                let notify = {
                    let mut endpoints = self.endpoints.lock();
                    let Some(endpoint) = endpoints.get_mut(&from) else {
                        return;
                    };

                    endpoint.paused = false;
                    if endpoint.acked == endpoint.accepted {
                        None
                    } else {
                        endpoint.acked = endpoint.accepted;
                        endpoint.events.clone().map(|events| {
                            (
                                events,
                                endpoint.port,
                                endpoint.mbox,
                                endpoint.acked % endpoint.ring_size,
                            )
                        })
                    }
                };

                if let Some((events, port, mbox, slot)) = notify {
                    events.outbound_complete(port, mbox, slot);
                }
            }
        }
    }
}

#[derive(Clone)]
struct Loopback {
    destid: u32,
    hub: Arc<Hub>,
}

impl Loopback {
    fn new(destid: u32, hub: &Arc<Hub>) -> Self {
        Self {
            destid,
            hub: hub.clone(),
        }
    }
}

impl Transport for Loopback {
    fn request_outbound(
        &self,
        port: PortId,
        mbox: u8,
        ring_size: usize,
        events: Arc<dyn MailboxEvents>,
    ) -> service::Result<()> {
        let mut endpoints = self.hub.endpoints.lock();
        let endpoint = endpoints.entry(self.destid).or_default();
        endpoint.port = port;
        endpoint.mbox = mbox;
        endpoint.ring_size = ring_size;
        endpoint.events = Some(events);
        Ok(())
    }

    fn request_inbound(
        &self,
        port: PortId,
        mbox: u8,
        _ring_size: usize,
        events: Arc<dyn MailboxEvents>,
    ) -> service::Result<()> {
        let mut endpoints = self.hub.endpoints.lock();
        let endpoint = endpoints.entry(self.destid).or_default();
        endpoint.port = port;
        endpoint.mbox = mbox;
        endpoint.events = Some(events);
        endpoint.running = true;
        Ok(())
    }

    fn release_outbound(&self, _port: PortId, _mbox: u8) {}

    fn release_inbound(&self, _port: PortId, _mbox: u8) {
        if let Some(endpoint) = self.hub.endpoints.lock().get_mut(&self.destid) {
            endpoint.running = false;
            endpoint.inbox.clear();
            endpoint.pool = 0;
        }
    }

    fn add_inbound_buffer(&self, _port: PortId, _mbox: u8, _buf: Vec<u8>) -> service::Result<()> {
        // Delivery buffers are synthesized; only the pool level matters.
        self.hub
            .endpoints
            .lock()
            .entry(self.destid)
            .or_default()
            .pool += 1;

        Ok(())
    }

    fn get_inbound(&self, _port: PortId, _mbox: u8) -> Option<Vec<u8>> {
        self.hub
            .endpoints
            .lock()
            .get_mut(&self.destid)?
            .inbox
            .pop_front()
    }

    fn submit_outbound(
        &self,
        _port: PortId,
        peer: PeerHandle,
        _mbox: u8,
        buf: &[u8],
    ) -> service::Result<()> {
        // The payload is copied here; the caller may free its buffer.
        self.hub.send(Event::Deliver {
            to: peer.0 as u32,
            buf: buf.to_vec(),
        });

        self.hub.send(Event::Complete { from: self.destid });
        Ok(())
    }

    fn is_port_running(&self, _port: PortId) -> bool {
        self.hub
            .endpoints
            .lock()
            .get(&self.destid)
            .map(|endpoint| endpoint.running)
            .unwrap_or(false)
    }
}

struct Node {
    service: Arc<Service<Loopback, Observer>>,
    statistics: Statistics,
    destid: u32,
}

fn make_node(hub: &Arc<Hub>, destid: u32, options: ServiceOptions) -> Node {
    let statistics = Statistics::default();
    let service = Arc::new(Service::new(
        options,
        Loopback::new(destid, hub),
        Observer::new(statistics.clone()),
    ));

    service.add_port(0, destid).unwrap();

    Node {
        service,
        statistics,
        destid,
    }
}

fn link(a: &Node, b: &Node) {
    for (from, to) in [(a, b), (b, a)] {
        from.service
            .add_peer(
                0,
                PeerInfo {
                    destid: to.destid,
                    handle: PeerHandle(to.destid as u64),
                    flags: CAP_DATA_SRC | CAP_DATA_DST,
                },
            )
            .unwrap();
    }
}

fn make_pair(hub: &Arc<Hub>, options: impl Fn() -> ServiceOptions) -> (Node, Node) {
    let a = make_node(hub, 0x01, options());
    let b = make_node(hub, 0x02, options());
    link(&a, &b);
    (a, b)
}

/// Listen on `channel` at node `b` and connect `channel` 200 from `a`.
/// Returns the accepted channel number on `b`.
fn establish(a: &Node, b: &Node, listener: u16) -> u16 {
    b.service.channel_create(listener, 1).unwrap();
    b.service.channel_bind(listener, 0, 0).unwrap();
    b.service.channel_listen(listener).unwrap();

    let accepted = {
        let service = b.service.clone();
        thread::spawn(move || service.channel_accept(listener, Some(Duration::from_secs(2))))
    };

    a.service.channel_create(200, 1).unwrap();
    a.service
        .channel_connect(200, 0, b.destid, listener)
        .unwrap();

    accepted.join().unwrap().unwrap()
}

#[test]
fn test_connect_and_echo() -> Result<()> {
    let _ = simple_logger::init_with_level(log::Level::Debug);

    let hub = Hub::new();

    // Node A comes up through the config-driven assembly path.
    let config = Arc::new(chanmux::config::Config::default());
    let a = Node {
        service: Arc::new(chanmux::startup(config, Loopback::new(0x01, &hub))?),
        statistics: Statistics::default(),
        destid: 0x01,
    };
    a.service.add_port(0, 0x01).unwrap();

    let b = make_node(&hub, 0x02, ServiceOptions::default());
    link(&a, &b);

    let n = establish(&a, &b, 100);

    // A → B.
    a.service.channel_send(200, b"ping\0")?;

    let message: bytes::Bytes = b.service.channel_receive(n, Some(Duration::from_secs(2)))?;
    assert_eq!(message.len(), HEADER_LEN + 5);
    assert_eq!(&message[HEADER_LEN..], b"ping\0");

    b.service.channel_release_rx(n, &message)?;

    // A buffer can only be released once.
    assert_eq!(b.service.channel_release_rx(n, &message), Err(Error::Invalid));

    // B → A on the same channel pair.
    b.service.channel_send(n, b"pong\0")?;

    let message = a.service.channel_receive(200, Some(Duration::from_secs(2)))?;
    assert_eq!(&message[HEADER_LEN..], b"pong\0");
    a.service.channel_release_rx(200, &message)?;

    Ok(())
}

#[test]
fn test_connect_timeout() -> Result<()> {
    let hub = Hub::new();
    let (a, b) = make_pair(&hub, || ServiceOptions {
        connect_timeout: Duration::from_millis(250),
        ..ServiceOptions::default()
    });

    // The peer exists, nothing is listening on channel 500 over there.
    a.service.channel_create(200, 1)?;
    assert_eq!(
        a.service.channel_connect(200, 0, b.destid, 500),
        Err(Error::Timeout)
    );

    // The timeout rolled the channel back to idle: a retry starts a fresh
    // attempt instead of failing with Invalid.
    assert_eq!(
        a.service.channel_connect(200, 0, b.destid, 500),
        Err(Error::Timeout)
    );

    Ok(())
}

#[test]
fn test_remote_close_resets_receive() -> Result<()> {
    let hub = Hub::new();
    let (a, b) = make_pair(&hub, ServiceOptions::default);

    let n = establish(&a, &b, 100);

    let blocked = {
        let service = a.service.clone();
        thread::spawn(move || service.channel_receive(200, None))
    };

    // Give the receiver time to park on the ring.
    thread::sleep(Duration::from_millis(100));

    b.service.channel_close(n, 1)?;

    assert_eq!(blocked.join().unwrap(), Err(Error::ConnReset));

    // The closed channel left A's registry within one dispatch tick.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match a.service.channel_send(200, b"late") {
            Err(Error::NotFound) => break,
            _ if Instant::now() > deadline => panic!("channel 200 never left the registry"),
            _ => thread::sleep(Duration::from_millis(10)),
        }
    }

    Ok(())
}

#[test]
fn test_tx_backpressure_on_close() -> Result<()> {
    let hub = Hub::new();
    let (a, b) = make_pair(&hub, ServiceOptions::default);

    let n = establish(&a, &b, 100);

    // Let the handshake completions drain so the ring starts empty.
    thread::sleep(Duration::from_millis(100));

    // Park all outbound completions on A and fill the ring to its
    // capacity of 128.
    hub.pause_completions(0x01, true);

    for i in 0..128u32 {
        a.service.channel_send(200, &i.to_be_bytes())?;
    }

    // The 129th data message is refused outright.
    assert_eq!(a.service.channel_send(200, b"one too many"), Err(Error::Busy));

    // Closing now parks the CONN_CLOSE on the deferred queue; destruction
    // itself does not depend on the wire.
    a.service.channel_close(200, 1)?;
    assert_eq!(a.service.channel_send(200, b"gone"), Err(Error::NotFound));

    // One (coalesced) completion frees the ring and flushes the deferred
    // close out to B.
    hub.pause_completions(0x01, false);

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match b.service.channel_receive(n, Some(Duration::from_millis(10))) {
            Err(Error::NotFound) => break,
            Ok(message) => b.service.channel_release_rx(n, &message)?,
            _ if Instant::now() > deadline => panic!("close never reached node B"),
            _ => {}
        }
    }

    Ok(())
}

#[test]
fn test_peer_loss_closes_channels() -> Result<()> {
    let hub = Hub::new();
    let (a, b) = make_pair(&hub, ServiceOptions::default);

    establish(&a, &b, 100);

    a.service
        .remove_peer(0, PeerHandle(b.destid as u64))
        .unwrap();

    // The swept channel is gone from the registry.
    assert_eq!(a.service.channel_send(200, b"ping"), Err(Error::NotFound));
    assert_eq!(a.service.ep_list_size(0)?, 0);

    Ok(())
}

#[test]
fn test_rx_ring_drops_overflow() -> Result<()> {
    let hub = Hub::new();
    let (a, b) = make_pair(&hub, || ServiceOptions {
        rx_ring_size: 4,
        ..ServiceOptions::default()
    });

    let n = establish(&a, &b, 100);

    // Six messages against a four-slot receive ring: the last two are
    // dropped without erroring the channel.
    for i in 0..6u32 {
        a.service.channel_send(200, &i.to_be_bytes())?;
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while b.statistics.total().dropped_pkts.get() < 2 {
        assert!(Instant::now() < deadline, "overflow drops never happened");
        thread::sleep(Duration::from_millis(10));
    }

    for i in 0..4u32 {
        let message = b.service.channel_receive(n, Some(Duration::from_secs(1)))?;
        assert_eq!(&message[HEADER_LEN..], &i.to_be_bytes());
        b.service.channel_release_rx(n, &message)?;
    }

    assert_eq!(
        b.service.channel_receive(n, Some(Duration::from_millis(50))),
        Err(Error::Timeout)
    );

    Ok(())
}

#[test]
fn test_port_removal_sweeps_channels() -> Result<()> {
    let hub = Hub::new();
    let (a, b) = make_pair(&hub, ServiceOptions::default);

    establish(&a, &b, 100);

    a.service.remove_port(0)?;
    assert_eq!(a.service.remove_port(0), Err(Error::NotFound));

    assert_eq!(a.service.channel_send(200, b"ping"), Err(Error::NotFound));
    assert!(a.service.port_list(16).is_empty());
    assert_eq!(a.service.ep_list_size(0), Err(Error::NotFound));

    // A's statistics saw exactly one close.
    assert_eq!(a.statistics.total().closed.get(), 1);

    Ok(())
}

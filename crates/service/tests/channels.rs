use std::sync::Arc;

use anyhow::Result;
use chanmux_service::{
    Error, Service, ServiceHandler, ServiceOptions,
    transport::{CAP_DATA_DST, CAP_DATA_SRC, MailboxEvents, PeerHandle, PeerInfo, PortId, Transport},
};
use codec::{HEADER_LEN, MAX_MSG_SIZE};

#[derive(Default, Clone)]
struct Handler;

impl ServiceHandler for Handler {}

/// A transport with working mailboxes and a black-hole wire: submissions
/// are accepted and never complete, nothing ever arrives.
#[derive(Default)]
struct NullTransport;

impl Transport for NullTransport {
    fn request_outbound(
        &self,
        _port: PortId,
        _mbox: u8,
        _ring_size: usize,
        _events: Arc<dyn MailboxEvents>,
    ) -> chanmux_service::Result<()> {
        Ok(())
    }

    fn request_inbound(
        &self,
        _port: PortId,
        _mbox: u8,
        _ring_size: usize,
        _events: Arc<dyn MailboxEvents>,
    ) -> chanmux_service::Result<()> {
        Ok(())
    }

    fn release_outbound(&self, _port: PortId, _mbox: u8) {}

    fn release_inbound(&self, _port: PortId, _mbox: u8) {}

    fn add_inbound_buffer(&self, _port: PortId, _mbox: u8, _buf: Vec<u8>) -> chanmux_service::Result<()> {
        Ok(())
    }

    fn get_inbound(&self, _port: PortId, _mbox: u8) -> Option<Vec<u8>> {
        None
    }

    fn submit_outbound(
        &self,
        _port: PortId,
        _peer: PeerHandle,
        _mbox: u8,
        _buf: &[u8],
    ) -> chanmux_service::Result<()> {
        Ok(())
    }

    fn is_port_running(&self, _port: PortId) -> bool {
        true
    }
}

fn make_service() -> Service<NullTransport, Handler> {
    Service::new(
        ServiceOptions::default(),
        NullTransport::default(),
        Handler::default(),
    )
}

#[test]
fn test_channel_number_allocation() -> Result<()> {
    let service = make_service();

    // Occupy the first dynamic number, then let the allocator scan.
    assert_eq!(service.channel_create(256, 1)?, 256);
    assert_eq!(service.channel_create(0, 1)?, 257);

    // An exact request for a taken number fails, a number below the
    // dynamic range is honoured literally.
    assert_eq!(service.channel_create(256, 1), Err(Error::Busy));
    assert_eq!(service.channel_create(100, 1)?, 100);

    // Well-known numbers collide too.
    assert_eq!(service.channel_create(1, 1)?, 1);
    assert_eq!(service.channel_create(1, 1), Err(Error::Busy));

    Ok(())
}

#[test]
fn test_state_machine_edges() -> Result<()> {
    let service = make_service();
    service.add_port(0, 0x01)?;

    let id = service.channel_create(0, 1)?;

    // Listen requires a bound channel.
    assert_eq!(service.channel_listen(id), Err(Error::Invalid));

    // Binding to a port that does not exist fails, the channel stays idle.
    assert_eq!(service.channel_bind(id, 7, 0), Err(Error::NotFound));

    service.channel_bind(id, 0, 0)?;
    assert_eq!(service.channel_bind(id, 0, 0), Err(Error::Invalid));

    service.channel_listen(id)?;
    assert_eq!(service.channel_listen(id), Err(Error::Invalid));

    // Nothing has asked to connect yet.
    assert_eq!(
        service.channel_accept(id, Some(std::time::Duration::ZERO)),
        Err(Error::Again)
    );

    Ok(())
}

#[test]
fn test_connect_requires_known_peer() -> Result<()> {
    let service = make_service();
    service.add_port(0, 0x01)?;

    let id = service.channel_create(0, 1)?;

    // No such port.
    assert_eq!(service.channel_connect(id, 9, 0x02, 500), Err(Error::NotFound));

    // Port exists, destid was never discovered.
    assert_eq!(service.channel_connect(id, 0, 0x02, 500), Err(Error::NotFound));

    Ok(())
}

#[test]
fn test_peer_admission() -> Result<()> {
    let service = make_service();
    service.add_port(0, 0x01)?;

    service.add_peer(
        0,
        PeerInfo {
            destid: 0x02,
            handle: PeerHandle(2),
            flags: CAP_DATA_SRC | CAP_DATA_DST,
        },
    )?;

    // A peer that cannot sink data messages is ignored.
    service.add_peer(
        0,
        PeerInfo {
            destid: 0x03,
            handle: PeerHandle(3),
            flags: CAP_DATA_SRC,
        },
    )?;

    // So is a duplicate destid.
    service.add_peer(
        0,
        PeerInfo {
            destid: 0x02,
            handle: PeerHandle(4),
            flags: CAP_DATA_SRC | CAP_DATA_DST,
        },
    )?;

    assert_eq!(service.ep_list_size(0)?, 1);
    assert_eq!(service.ep_list(0, 16)?, vec![0x02]);
    assert_eq!(service.port_list(16), vec![(0, 0x01)]);

    Ok(())
}

#[test]
fn test_send_argument_bounds() -> Result<()> {
    let service = make_service();
    service.add_port(0, 0x01)?;

    let id = service.channel_create(0, 1)?;

    assert_eq!(service.channel_send(id, &[]), Err(Error::Invalid));
    assert_eq!(service.channel_send(id, &[0u8; MAX_MSG_SIZE]), Err(Error::Invalid));

    // The limit is exactly one datagram minus the header: one byte over is
    // rejected, the full payload passes the length check and only trips on
    // the unconnected state.
    let limit = MAX_MSG_SIZE - HEADER_LEN;
    assert_eq!(
        service.channel_send(id, &vec![0u8; limit + 1]),
        Err(Error::Invalid)
    );
    assert_eq!(service.channel_send(id, &vec![0u8; limit]), Err(Error::Again));

    // Valid length, but the channel is not connected.
    assert_eq!(service.channel_send(id, b"ping"), Err(Error::Again));

    // Unknown channel number.
    assert_eq!(service.channel_send(9999, b"ping"), Err(Error::NotFound));

    Ok(())
}

#[test]
fn test_close_is_idempotent() -> Result<()> {
    let service = make_service();

    let id = service.channel_create(0, 1)?;

    // The wrong owner cannot see the channel.
    assert_eq!(service.channel_close(id, 2), Err(Error::NotFound));

    service.channel_close(id, 1)?;
    assert_eq!(service.channel_close(id, 1), Err(Error::NotFound));

    // The number is free for reuse afterwards.
    assert_eq!(service.channel_create(id, 1)?, id);

    Ok(())
}

#[test]
fn test_release_owner_sweeps() -> Result<()> {
    let service = make_service();

    let first = service.channel_create(0, 7)?;
    let second = service.channel_create(0, 7)?;
    let other = service.channel_create(0, 8)?;

    service.release_owner(7);

    assert_eq!(service.channel_close(first, 7), Err(Error::NotFound));
    assert_eq!(service.channel_close(second, 7), Err(Error::NotFound));

    // The other owner's channel survived.
    service.channel_close(other, 8)?;

    Ok(())
}
